// ============================================================================
// src/net/packet.rs - Owned Packet View
// ============================================================================
//!
//! プールバッファ上のパケットビュー
//!
//! `Packet` はバッファの唯一の所有者で、ドロップされるとバッファを
//! 元のプールへ返す。ドライバと上位層の間ではムーブでのみ受け渡す。

use alloc::sync::Arc;
use x86_64::PhysAddr;

use super::mempool::{BufferPool, RawBuffer};
use crate::error::PoolError;
use crate::io::virtio::net::header::VirtioNetHdr;

/// パケット
pub struct Packet {
    buffer: Option<RawBuffer>,
    pool: Arc<dyn BufferPool>,
    /// データ先頭のオフセット
    offset: usize,
    /// データ長
    len: usize,
    /// オフロード要求（送信）/ デバイスの報告（受信）
    offload: VirtioNetHdr,
}

impl Packet {
    /// プールから空のパケットを割り当てる
    ///
    /// `headroom` バイトを先頭に空けておく。
    pub fn alloc(pool: &Arc<dyn BufferPool>, headroom: usize) -> Result<Self, PoolError> {
        let buffer = pool.alloc(pool.buffer_capacity())?;
        if headroom > buffer.capacity() {
            pool.release(buffer);
            return Err(PoolError::CapacityTooLarge(headroom));
        }
        Ok(Self::from_buffer(buffer, pool.clone(), headroom, 0, VirtioNetHdr::empty()))
    }

    /// ペイロードをコピーしたパケットを作る
    pub fn with_payload(pool: &Arc<dyn BufferPool>, payload: &[u8]) -> Result<Self, PoolError> {
        let mut packet = Self::alloc(pool, 0)?;
        if packet.append(payload) < payload.len() {
            return Err(PoolError::CapacityTooLarge(payload.len()));
        }
        Ok(packet)
    }

    /// 既存のバッファをパケットとして包む
    pub(crate) fn from_buffer(
        buffer: RawBuffer,
        pool: Arc<dyn BufferPool>,
        offset: usize,
        len: usize,
        offload: VirtioNetHdr,
    ) -> Self {
        debug_assert!(offset + len <= buffer.capacity());
        Self {
            buffer: Some(buffer),
            pool,
            offset,
            len,
            offload,
        }
    }

    fn raw(&self) -> &[u8] {
        self.buffer.as_ref().map(|b| b.as_slice()).unwrap_or(&[])
    }

    /// データ
    pub fn data(&self) -> &[u8] {
        &self.raw()[self.offset..self.offset + self.len]
    }

    /// データ（可変）
    pub fn data_mut(&mut self) -> &mut [u8] {
        let (offset, len) = (self.offset, self.len);
        match self.buffer.as_mut() {
            Some(b) => &mut b.as_mut_slice()[offset..offset + len],
            None => &mut [],
        }
    }

    /// データ長
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 先頭の空き
    pub fn headroom(&self) -> usize {
        self.offset
    }

    /// 末尾の空き
    pub fn tailroom(&self) -> usize {
        self.raw().len() - self.offset - self.len
    }

    /// データ長を設定（容量を超える場合は `false`）
    pub fn set_len(&mut self, len: usize) -> bool {
        if self.offset + len > self.raw().len() {
            return false;
        }
        self.len = len;
        true
    }

    /// 末尾に追記し、書けたバイト数を返す
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.tailroom());
        let start = self.offset + self.len;
        if let Some(b) = self.buffer.as_mut() {
            b.as_mut_slice()[start..start + n].copy_from_slice(&bytes[..n]);
        }
        self.len += n;
        n
    }

    /// データ先頭の物理アドレス
    pub fn phys_addr(&self) -> PhysAddr {
        match &self.buffer {
            Some(b) => b.phys_addr() + self.offset as u64,
            None => PhysAddr::zero(),
        }
    }

    /// オフロード情報
    pub fn offload(&self) -> &VirtioNetHdr {
        &self.offload
    }

    /// 送信時のオフロード要求を設定
    pub fn set_offload(&mut self, offload: VirtioNetHdr) {
        self.offload = offload;
    }
}

impl core::fmt::Debug for Packet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len)
            .field("headroom", &self.offset)
            .finish()
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.release(buffer);
        }
    }
}
