// ============================================================================
// src/net/nic.rs - Generic NIC Interface
// ============================================================================
//!
//! 上位ネットワークスタックから見たNICの抽象
//!
//! 送信は戻り値を持たない。バックプレッシャーは統計カウンタと
//! キュー容量の問い合わせでのみ観測できる。

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU64, Ordering};

use super::ethernet::{ETH_MTU, MacAddress};
use super::packet::Packet;

/// リンク状態の変化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// リンクアップ
    Up,
    /// リンクダウン
    Down,
    /// デバイスがGratuitous ARP等の告知を求めている
    AnnounceRequested,
}

/// 受信ハンドラ
pub type ReceiveHandler = Box<dyn FnMut(Packet) + Send>;

/// 送信キューに空きができたときのハンドラ（引数は空きパケット数）
pub type TxAvailableHandler = Box<dyn FnMut(usize) + Send>;

/// リンク状態変化ハンドラ
pub type LinkHandler = Box<dyn FnMut(LinkEvent) + Send>;

/// NIC統計
///
/// 外部（スタック側）が所有し、ドライバは加算のみ行う。
#[derive(Debug, Default)]
pub struct NicStats {
    pub rx_packets: AtomicU64,
    pub tx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub rx_dropped: AtomicU64,
    pub tx_dropped: AtomicU64,
}

/// 統計のスナップショット
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NicStatsSnapshot {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
}

impl NicStats {
    pub const fn new() -> Self {
        Self {
            rx_packets: AtomicU64::new(0),
            tx_packets: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            rx_dropped: AtomicU64::new(0),
            tx_dropped: AtomicU64::new(0),
        }
    }

    pub(crate) fn count_rx(&self, bytes: usize) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn count_tx(&self, bytes: usize) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn count_rx_drop(&self) {
        self.rx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_tx_drop(&self) {
        self.tx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// 現在値を取得
    pub fn snapshot(&self) -> NicStatsSnapshot {
        NicStatsSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
            tx_dropped: self.tx_dropped.load(Ordering::Relaxed),
        }
    }
}

/// NICトレイト
pub trait Nic {
    /// デバイス名
    fn name(&self) -> &str;

    /// MACアドレス
    fn mac(&self) -> MacAddress;

    /// MTU
    fn mtu(&self) -> u16 {
        ETH_MTU
    }

    /// リンクが上がっているか
    fn link_up(&self) -> bool;

    /// パケットを送信（キューイングされるか、カウントされて捨てられる）
    fn transmit(&self, packet: Packet);

    /// 追加で受け付けられるパケット数
    fn transmit_queue_available(&self) -> usize;

    /// 受信済みで未処理のパケット数
    fn receive_queue_waiting(&self) -> usize;

    /// 受信ハンドラを登録
    fn set_receive_handler(&self, handler: ReceiveHandler);

    /// 送信キュー空き通知ハンドラを登録
    fn set_tx_available_handler(&self, handler: TxAvailableHandler);

    /// リンク状態変化ハンドラを登録
    fn set_link_handler(&self, handler: LinkHandler);

    /// 統計
    fn stats(&self) -> &NicStats;
}
