// ============================================================================
// src/io/virtio/net/config.rs - VirtIO-Net Device Configuration
// ============================================================================
//!
//! デバイス固有設定空間の読み取り
//!
//! レイアウト: mac[6], status(u16), max_virtqueue_pairs(u16)
//! statusはSTATUS、max_virtqueue_pairsはMQがネゴシエートされたときのみ有効。

use bitflags::bitflags;

use super::NetFeatures;
use crate::error::ConfigError;
use crate::io::virtio::transport::VirtioTransport;
use crate::net::ethernet::MacAddress;

/// 設定空間内のオフセット
mod offset {
    pub const MAC: usize = 0;
    pub const STATUS: usize = 6;
    pub const MAX_VIRTQUEUE_PAIRS: usize = 8;
}

/// max_virtqueue_pairsの上限
pub const MAX_QUEUE_PAIRS: u16 = 0x8000;

/// 制御キューのインデックス
///
/// MQがあれば全データキューの後ろ（2 * max_queue_pairs）、なければ2。
/// 16ビットのキュー番号に収まらなければエラー。
pub fn ctrl_queue_index(features: NetFeatures, max_queue_pairs: u16) -> Result<u16, ConfigError> {
    if !features.contains(NetFeatures::MQ) {
        return Ok(2);
    }
    max_queue_pairs
        .checked_mul(2)
        .ok_or(ConfigError::CtrlQueueOutOfRange(max_queue_pairs))
}

bitflags! {
    /// リンク状態ビット
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LinkStatus: u16 {
        const LINK_UP = 1;
        const ANNOUNCE = 2;
    }
}

/// デバイス設定のスナップショット
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    pub mac: MacAddress,
    pub status: LinkStatus,
    pub max_queue_pairs: u16,
}

impl DeviceConfig {
    /// ネゴシエート結果から必要な設定空間の長さ
    pub fn expected_len(features: NetFeatures) -> usize {
        if features.contains(NetFeatures::MQ) {
            offset::MAX_VIRTQUEUE_PAIRS + 2
        } else {
            offset::STATUS + 2
        }
    }

    /// 設定空間を読む
    ///
    /// デバイスが公開する長さが足りなければ初期化を中止する。
    /// 長い分には問題ない（後方互換の拡張）。
    pub fn read<T: VirtioTransport + ?Sized>(
        transport: &T,
        features: NetFeatures,
    ) -> Result<Self, ConfigError> {
        let expected = Self::expected_len(features);
        let available = transport.device_config_len();
        if available < expected {
            return Err(ConfigError::LengthMismatch {
                expected,
                available,
            });
        }

        let mut mac = [0u8; 6];
        for (i, byte) in mac.iter_mut().enumerate() {
            *byte = transport.read_config_u8(offset::MAC + i);
        }

        let status = if features.contains(NetFeatures::STATUS) {
            LinkStatus::from_bits_truncate(transport.read_config_u16(offset::STATUS))
        } else {
            // ステータスを報告しないデバイスは常にリンクアップ
            LinkStatus::LINK_UP
        };

        let max_queue_pairs = if features.contains(NetFeatures::MQ) {
            let pairs = transport.read_config_u16(offset::MAX_VIRTQUEUE_PAIRS);
            if !(1..=MAX_QUEUE_PAIRS).contains(&pairs) {
                return Err(ConfigError::InvalidQueuePairs(pairs));
            }
            pairs
        } else {
            1
        };

        Ok(Self {
            mac: MacAddress::new(mac),
            status,
            max_queue_pairs,
        })
    }

    /// リンクアップしているか
    pub fn link_up(&self) -> bool {
        self.status.contains(LinkStatus::LINK_UP)
    }

    /// 告知要求が立っているか
    pub fn announce_requested(&self) -> bool {
        self.status.contains(LinkStatus::ANNOUNCE)
    }
}
