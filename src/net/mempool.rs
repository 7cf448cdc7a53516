// ============================================================================
// src/net/mempool.rs - DMA Buffer Pool
// NICのDMAエンジンが直接読み書きする固定サイズバッファの管理
// ============================================================================
//!
//! ドライバはバッファプールを外部コラボレータとして扱う。
//! 必要なのは「容量Cのバッファを割り当てる」「バッファを返却する」の2操作のみで、
//! これを [`BufferPool`] トレイトとして定義する。
//!
//! [`Mempool`] はカーネル標準の実装で、1枚の連続スラブを等間隔に分割する。
//! 単一アドレス空間（アイデンティティマップ）を前提に、仮想アドレスを
//! そのまま物理アドレスとしてデバイスに渡す。

use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use alloc::vec::Vec;
use core::ptr::NonNull;
use spin::Mutex;
use x86_64::PhysAddr;

use crate::error::PoolError;

/// デフォルトのパケットバッファサイズ
pub const DEFAULT_BUFFER_SIZE: usize = 2048;

/// キャッシュラインサイズ
const CACHE_LINE_SIZE: usize = 64;

/// スラブのアライメント（ページ境界）
const SLAB_ALIGN: usize = 4096;

/// DMA可能な生バッファ
///
/// 所有権は常にただ1か所（ドライバ側のキュー、上位層のパケット、またはプール）にある。
/// `Clone` を実装しないことでエイリアスを防ぐ。
#[derive(Debug)]
pub struct RawBuffer {
    ptr: NonNull<u8>,
    capacity: usize,
    pool_id: u32,
    index: u32,
}

// SAFETY: RawBufferは排他的に所有され、指す領域は他のRawBufferと重ならない
unsafe impl Send for RawBuffer {}

impl RawBuffer {
    /// 生ポインタからバッファを構築
    ///
    /// # Safety
    /// - `ptr` から `capacity` バイトが有効で、DMA可能なメモリであること
    /// - 同じ領域を指す他の `RawBuffer` が存在しないこと
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, capacity: usize, pool_id: u32, index: u32) -> Self {
        Self {
            ptr,
            capacity,
            pool_id,
            index,
        }
    }

    /// 物理アドレスを取得
    pub fn phys_addr(&self) -> PhysAddr {
        PhysAddr::new(self.ptr.as_ptr() as u64)
    }

    /// 容量を取得
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 所属プールID
    pub fn pool_id(&self) -> u32 {
        self.pool_id
    }

    /// プール内インデックス
    pub fn index(&self) -> u32 {
        self.index
    }

    /// 全容量のスライス
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: from_raw_parts の契約により有効
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.capacity) }
    }

    /// 全容量の可変スライス
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: 排他的所有のため可変参照は一意
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.capacity) }
    }
}

/// バッファプール（外部コラボレータ）
pub trait BufferPool: Send + Sync {
    /// 1バッファあたりの容量
    fn buffer_capacity(&self) -> usize;

    /// 容量 `capacity` 以上のバッファを割り当て
    fn alloc(&self, capacity: usize) -> Result<RawBuffer, PoolError>;

    /// バッファを返却
    fn release(&self, buffer: RawBuffer);

    /// 空きバッファ数
    fn available(&self) -> usize;
}

/// メモリプール
pub struct Mempool {
    /// プールID
    id: u32,
    /// スラブ先頭
    slab: NonNull<u8>,
    /// スラブのレイアウト
    layout: Layout,
    /// 1バッファの容量
    buffer_size: usize,
    /// バッファ間隔（キャッシュラインに切り上げ）
    stride: usize,
    /// 空きインデックス
    free_list: Mutex<Vec<u32>>,
    /// 使用中フラグ（二重返却検出用）
    in_use: Mutex<Vec<bool>>,
}

// SAFETY: スラブへのアクセスはRawBufferの排他所有とMutexで管理される
unsafe impl Send for Mempool {}
unsafe impl Sync for Mempool {}

impl Mempool {
    /// 新しいメモリプールを作成（バッファを事前割り当て）
    pub fn new(id: u32, buffer_size: usize, count: usize) -> Result<Self, PoolError> {
        if buffer_size == 0 || count == 0 || count > u32::MAX as usize {
            return Err(PoolError::SlabAllocationFailed);
        }
        let stride = (buffer_size + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1);
        let total = stride
            .checked_mul(count)
            .ok_or(PoolError::SlabAllocationFailed)?;
        let layout =
            Layout::from_size_align(total, SLAB_ALIGN).map_err(|_| PoolError::SlabAllocationFailed)?;

        // SAFETY: レイアウトはサイズ非ゼロ
        let ptr = unsafe { alloc_zeroed(layout) };
        let slab = NonNull::new(ptr).ok_or(PoolError::SlabAllocationFailed)?;

        // 低いインデックスから払い出すため逆順に積む
        let free_list: Vec<u32> = (0..count as u32).rev().collect();

        log::debug!(
            "[MEMPOOL] pool {} ready: {} x {} bytes at {:#x}",
            id,
            count,
            buffer_size,
            slab.as_ptr() as usize
        );

        Ok(Self {
            id,
            slab,
            layout,
            buffer_size,
            stride,
            free_list: Mutex::new(free_list),
            in_use: Mutex::new(alloc::vec![false; count]),
        })
    }

    /// 総バッファ数
    pub fn total(&self) -> usize {
        self.layout.size() / self.stride
    }
}

impl BufferPool for Mempool {
    fn buffer_capacity(&self) -> usize {
        self.buffer_size
    }

    fn alloc(&self, capacity: usize) -> Result<RawBuffer, PoolError> {
        if capacity > self.buffer_size {
            return Err(PoolError::CapacityTooLarge(capacity));
        }

        let index = match self.free_list.lock().pop() {
            Some(index) => index,
            None => return Err(PoolError::Exhausted),
        };
        self.in_use.lock()[index as usize] = true;

        // SAFETY: インデックスは範囲内、領域はスラブ内で他のバッファと重ならない
        unsafe {
            let ptr = NonNull::new_unchecked(self.slab.as_ptr().add(index as usize * self.stride));
            Ok(RawBuffer::from_raw_parts(ptr, self.buffer_size, self.id, index))
        }
    }

    fn release(&self, buffer: RawBuffer) {
        let index = buffer.index as usize;
        if buffer.pool_id != self.id || index >= self.total() {
            log::error!(
                "[MEMPOOL] pool {} got foreign buffer (pool {}, index {})",
                self.id,
                buffer.pool_id,
                buffer.index
            );
            return;
        }

        {
            let mut in_use = self.in_use.lock();
            if !in_use[index] {
                log::error!("[MEMPOOL] double release of buffer {} in pool {}", index, self.id);
                return;
            }
            in_use[index] = false;
        }

        self.free_list.lock().push(buffer.index);
    }

    fn available(&self) -> usize {
        self.free_list.lock().len()
    }
}

impl Drop for Mempool {
    fn drop(&mut self) {
        // SAFETY: new() で同じレイアウトで割り当てた
        unsafe { dealloc(self.slab.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_release_cycle() {
        let pool = Mempool::new(1, 256, 4).expect("pool");
        assert_eq!(pool.available(), 4);

        let a = pool.alloc(128).expect("alloc");
        let b = pool.alloc(256).expect("alloc");
        assert_ne!(a.phys_addr(), b.phys_addr());
        assert_eq!(a.capacity(), 256);
        assert_eq!(pool.available(), 2);

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_capacity_too_large() {
        let pool = Mempool::new(1, 256, 1).expect("pool");
        assert_eq!(pool.alloc(257).unwrap_err(), PoolError::CapacityTooLarge(257));
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_exhaustion() {
        let pool = Mempool::new(1, 64, 1).expect("pool");
        let held = pool.alloc(64).expect("alloc");
        assert_eq!(pool.alloc(64).unwrap_err(), PoolError::Exhausted);
        pool.release(held);
        assert!(pool.alloc(64).is_ok());
    }

    #[test]
    fn test_double_release_is_rejected() {
        let pool = Mempool::new(3, 64, 2).expect("pool");
        let buf = pool.alloc(64).expect("alloc");
        // SAFETY: テスト用に同じ領域のハンドルを意図的に複製する
        let alias = unsafe { RawBuffer::from_raw_parts(buf.ptr, buf.capacity, buf.pool_id, buf.index) };
        pool.release(buf);
        pool.release(alias);
        assert_eq!(pool.available(), 2);
        // 二重返却でも払い出しは1回だけ
        let _a = pool.alloc(64).expect("alloc");
        let _b = pool.alloc(64).expect("alloc");
        assert_eq!(pool.alloc(64).unwrap_err(), PoolError::Exhausted);
    }

    #[test]
    fn test_foreign_buffer_is_rejected() {
        let a = Mempool::new(1, 64, 1).expect("pool");
        let b = Mempool::new(2, 64, 1).expect("pool");
        let buf = a.alloc(64).expect("alloc");
        let index = buf.index();
        let ptr = buf.ptr;
        b.release(buf);
        assert_eq!(b.available(), 1);
        // 正しいプールへ戻す
        a.release(unsafe { RawBuffer::from_raw_parts(ptr, 64, 1, index) });
        assert_eq!(a.available(), 1);
    }
}
