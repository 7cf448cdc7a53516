// ============================================================================
// src/io/virtio/net/tx.rs - Transmit Queue Manager
// ============================================================================
//!
//! 送信キュー管理
//!
//! 1パケットは [ヘッダ, ペイロード] の2ディスクリプタのチェーンになる。
//! ヘッダは先頭ディスクリプタ番号で引くスクラッチ領域に書くので、
//! チェーンが使用中の間はそのスロットに触れない。
//!
//! 空きが2未満のとき、または既に待ちがあるときは上限付きFIFOに積む。
//! 送信順序はFIFOを経由しても投入順のまま保たれる。

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use x86_64::PhysAddr;

use super::header::{HeaderLayout, MAX_HEADER_SIZE};
use crate::error::QueueError;
use crate::io::virtio::virtqueue::{Segment, Virtqueue};
use crate::net::nic::NicStats;
use crate::net::packet::Packet;

/// 1パケットあたりのディスクリプタ数
const DESCS_PER_PACKET: u16 = 2;

/// 送信要求の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    /// リングに公開した
    Submitted,
    /// FIFOで待機中
    Queued,
    /// 捨てた（カウント済み）
    Dropped,
}

/// 完了処理の結果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxService {
    /// 回収したパケット数
    pub reclaimed: usize,
    /// FIFOから公開したパケット数
    pub submitted: usize,
}

/// 送信キュー
pub struct TxQueue {
    vq: Virtqueue<Packet>,
    /// ディスクリプタ番号ごとのヘッダ領域
    headers: Box<[[u8; MAX_HEADER_SIZE]]>,
    layout: HeaderLayout,
    pending: VecDeque<Packet>,
    pending_limit: usize,
    stats: Arc<NicStats>,
}

impl TxQueue {
    pub fn new(
        vq: Virtqueue<Packet>,
        layout: HeaderLayout,
        pending_limit: usize,
        stats: Arc<NicStats>,
    ) -> Self {
        let headers = alloc::vec![[0u8; MAX_HEADER_SIZE]; vq.size() as usize].into_boxed_slice();
        Self {
            vq,
            headers,
            layout,
            pending: VecDeque::new(),
            pending_limit,
            stats,
        }
    }

    /// キューインデックス
    pub fn index(&self) -> u16 {
        self.vq.index()
    }

    /// リング領域の物理アドレス
    pub fn ring_addr(&self) -> PhysAddr {
        self.vq.phys_addr()
    }

    /// 追加で公開できるパケット数
    pub fn available(&self) -> usize {
        (self.vq.num_free() / DESCS_PER_PACKET) as usize
    }

    /// FIFOで待機中のパケット数
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// デバイスに渡してあるパケット数
    pub fn in_flight(&self) -> u16 {
        self.vq.in_flight() / DESCS_PER_PACKET
    }

    /// パケットを送信する
    ///
    /// 通知はここでは行わない。呼び出し側が遅延キックを要求する。
    pub fn transmit(&mut self, packet: Packet) -> TxOutcome {
        if packet.is_empty() {
            log::debug!("[VIRTIO-NET] tx: empty packet dropped");
            self.stats.count_tx_drop();
            return TxOutcome::Dropped;
        }

        if !self.pending.is_empty() || self.vq.num_free() < DESCS_PER_PACKET {
            return self.enqueue(packet);
        }

        match self.submit(packet) {
            Ok(()) => TxOutcome::Submitted,
            Err(packet) => self.enqueue(packet),
        }
    }

    fn enqueue(&mut self, packet: Packet) -> TxOutcome {
        if self.pending.len() >= self.pending_limit {
            log::trace!("[VIRTIO-NET] tx: pending queue full, dropped");
            self.stats.count_tx_drop();
            return TxOutcome::Dropped;
        }
        self.pending.push_back(packet);
        TxOutcome::Queued
    }

    /// ヘッダを書いてチェーンを公開する
    fn submit(&mut self, packet: Packet) -> Result<(), Packet> {
        let Some(head) = self.vq.next_head() else {
            return Err(packet);
        };

        let slot = &mut self.headers[head as usize];
        let hdr_len = packet.offload().for_tx().encode(self.layout, slot);
        let hdr_addr = PhysAddr::new(slot.as_ptr() as u64);

        let len = packet.len();
        let segments = [
            Segment::readable(hdr_addr, hdr_len as u32),
            Segment::readable(packet.phys_addr(), len as u32),
        ];
        match self.vq.add(&segments, packet) {
            Ok(_) => {
                self.stats.count_tx(len);
                Ok(())
            }
            Err((_, packet)) => Err(packet),
        }
    }

    /// 完了したチェーンを回収し、空いた分だけFIFOから公開する
    pub fn service(&mut self) -> TxService {
        let mut result = TxService::default();

        // パケットのドロップでバッファはプールへ戻る
        while let Some((_packet, _)) = self.vq.pop_used() {
            result.reclaimed += 1;
        }

        while self.vq.num_free() >= DESCS_PER_PACKET {
            let Some(packet) = self.pending.pop_front() else {
                break;
            };
            match self.submit(packet) {
                Ok(()) => result.submitted += 1,
                Err(packet) => {
                    self.pending.push_front(packet);
                    break;
                }
            }
        }

        result
    }

    /// 通知が必要か（未通知カウンタはリセットされる）
    pub fn take_kick(&mut self) -> bool {
        self.vq.take_kick()
    }

    /// 未通知の公開があるか
    pub fn has_unkicked(&self) -> bool {
        self.vq.unkicked() > 0
    }

    /// 所有権の監査
    pub fn audit(&self) -> Result<(), QueueError> {
        self.vq.audit()
    }
}

impl Drop for TxQueue {
    fn drop(&mut self) {
        // デバイスはリセット済みであること
        let reclaimed = self.vq.drain_tokens().len();
        if reclaimed + self.pending.len() > 0 {
            log::debug!(
                "[VIRTIO-NET] tx: released {} in-flight, {} pending",
                reclaimed,
                self.pending.len()
            );
        }
    }
}
