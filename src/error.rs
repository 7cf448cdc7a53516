//! 統一エラーハンドリングモジュール
//!
//! ドライバ全体で使用される統一エラー型を定義し、
//! 各サブシステムのエラーから変換を提供します。
//!
//! 割り込みハンドラはエラーを返さない。ここに定義されたエラーは
//! 初期化・制御コマンドなど、呼び出し元が同期的に待つ経路でのみ使用される。

use core::fmt;

use crate::io::virtio::transport::TransportError;

/// ドライバ全体の統一エラー型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// トランスポート層のエラー
    Transport(TransportError),
    /// Virtqueue関連エラー
    Queue(QueueError),
    /// デバイス設定関連エラー
    Config(ConfigError),
    /// 制御キュー関連エラー
    Ctrl(CtrlError),
    /// バッファプール関連エラー
    Pool(PoolError),
}

/// Virtqueue関連エラーの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// キューサイズが0、または2のべき乗でない
    InvalidSize(u16),
    /// リングメモリの割り当てに失敗
    AllocationFailed,
    /// 空きディスクリプタが不足
    Full,
    /// セグメントが空
    EmptyChain,
    /// 所有権不変条件の違反（監査で検出）
    OwnershipViolation(u16),
}

/// デバイス設定関連エラーの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// 設定空間の長さがネゴシエートされたフィーチャーと合わない
    LengthMismatch {
        /// 必要な長さ
        expected: usize,
        /// デバイスが公開している長さ
        available: usize,
    },
    /// デバイスがキューを提供していない（サイズ0）
    QueueUnavailable(u16),
    /// RXバッファ容量がヘッダを収められない
    BufferTooSmall(usize),
    /// max_virtqueue_pairsが範囲外（1..=0x8000）
    InvalidQueuePairs(u16),
    /// 制御キューのインデックスが16ビットに収まらない
    CtrlQueueOutOfRange(u16),
}

/// 制御キュー関連エラーの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlError {
    /// 制御キューまたは必要なフィーチャーがネゴシエートされていない
    NotNegotiated,
    /// デバイスがコマンドを拒否した
    Rejected {
        /// コマンドクラス
        class: u8,
        /// コマンド
        command: u8,
    },
}

/// バッファプール関連エラーの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// 空きバッファなし
    Exhausted,
    /// 要求容量がプールのバッファサイズを超える
    CapacityTooLarge(usize),
    /// スラブの割り当てに失敗
    SlabAllocationFailed,
}

/// ドライバ結果型
pub type DriverResult<T> = Result<T, DriverError>;

// ===== Display implementations =====

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::Transport(e) => write!(f, "Transport error: {}", e),
            DriverError::Queue(e) => write!(f, "Queue error: {}", e),
            DriverError::Config(e) => write!(f, "Config error: {}", e),
            DriverError::Ctrl(e) => write!(f, "Control queue error: {}", e),
            DriverError::Pool(e) => write!(f, "Buffer pool error: {}", e),
        }
    }
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::InvalidSize(size) => write!(f, "invalid queue size {}", size),
            QueueError::AllocationFailed => write!(f, "ring allocation failed"),
            QueueError::Full => write!(f, "no free descriptors"),
            QueueError::EmptyChain => write!(f, "empty descriptor chain"),
            QueueError::OwnershipViolation(idx) => {
                write!(f, "descriptor {} has inconsistent ownership", idx)
            }
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::LengthMismatch { expected, available } => write!(
                f,
                "device config is {} bytes, negotiated features need {}",
                available, expected
            ),
            ConfigError::QueueUnavailable(idx) => write!(f, "queue {} not available", idx),
            ConfigError::BufferTooSmall(cap) => {
                write!(f, "rx buffer capacity {} cannot hold a frame", cap)
            }
            ConfigError::InvalidQueuePairs(n) => write!(f, "invalid max_virtqueue_pairs {}", n),
            ConfigError::CtrlQueueOutOfRange(pairs) => {
                write!(f, "no control queue index after {} queue pairs", pairs)
            }
        }
    }
}

impl fmt::Display for CtrlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CtrlError::NotNegotiated => write!(f, "feature not negotiated"),
            CtrlError::Rejected { class, command } => {
                write!(f, "device rejected command {}:{}", class, command)
            }
        }
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Exhausted => write!(f, "pool exhausted"),
            PoolError::CapacityTooLarge(cap) => write!(f, "capacity {} too large", cap),
            PoolError::SlabAllocationFailed => write!(f, "slab allocation failed"),
        }
    }
}

// ===== From implementations for sub-errors =====

impl From<TransportError> for DriverError {
    fn from(e: TransportError) -> Self {
        DriverError::Transport(e)
    }
}

impl From<QueueError> for DriverError {
    fn from(e: QueueError) -> Self {
        DriverError::Queue(e)
    }
}

impl From<ConfigError> for DriverError {
    fn from(e: ConfigError) -> Self {
        DriverError::Config(e)
    }
}

impl From<CtrlError> for DriverError {
    fn from(e: CtrlError) -> Self {
        DriverError::Ctrl(e)
    }
}

impl From<PoolError> for DriverError {
    fn from(e: PoolError) -> Self {
        DriverError::Pool(e)
    }
}
