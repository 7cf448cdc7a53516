// ============================================================================
// src/io/virtio/net/irq.rs - Interrupt Source Decoding
// ============================================================================
//!
//! 割り込み発生源の判定
//!
//! INTxではISRの読み取り値から、MSI-Xではベクタ番号から発生源を求める。
//! 設定変更はリンク状態の差分として上位に通知する。

use alloc::vec::Vec;
use bitflags::bitflags;

use super::config::DeviceConfig;
use crate::io::virtio::defs::isr;
use crate::net::nic::LinkEvent;

/// MSI-Xベクタ割り当て（制御キューにはベクタを割り当てない）
pub mod vector {
    pub const RX: u16 = 0;
    pub const TX: u16 = 1;
    pub const CONFIG: u16 = 2;
}

bitflags! {
    /// 割り込み発生源
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IrqSource: u8 {
        /// 受信キュー
        const RX = 1 << 0;
        /// 送信キュー
        const TX = 1 << 1;
        /// 設定変更
        const CONFIG = 1 << 2;
    }
}

/// 割り込みモード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqMode {
    /// キューごとのMSI-Xベクタ
    Msix,
    /// 共有レガシー割り込み（ISRを読む）
    Intx,
}

impl IrqSource {
    /// ISR値から発生源を求める
    ///
    /// キュー割り込みビットはどのキューか区別しないため、RXとTXの両方を対象にする。
    pub fn from_isr(value: u8) -> Self {
        let mut sources = Self::empty();
        if value & isr::VIRTIO_ISR_QUEUE != 0 {
            sources |= Self::RX | Self::TX;
        }
        if value & isr::VIRTIO_ISR_CONFIG != 0 {
            sources |= Self::CONFIG;
        }
        sources
    }

    /// MSI-Xベクタから発生源を求める
    pub fn from_vector(v: u16) -> Self {
        match v {
            vector::RX => Self::RX,
            vector::TX => Self::TX,
            vector::CONFIG => Self::CONFIG,
            _ => Self::empty(),
        }
    }
}

/// 設定の再読み込み結果から上位に通知するイベントを求める
pub fn config_events(
    old: &DeviceConfig,
    new: &DeviceConfig,
    announce_negotiated: bool,
) -> Vec<LinkEvent> {
    let mut events = Vec::new();
    if old.link_up() != new.link_up() {
        events.push(if new.link_up() {
            LinkEvent::Up
        } else {
            LinkEvent::Down
        });
    }
    if announce_negotiated && new.announce_requested() {
        events.push(LinkEvent::AnnounceRequested);
    }
    events
}
