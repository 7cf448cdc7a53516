// ============================================================================
// src/io/virtio/mod.rs - VirtIO Common Definitions
// ============================================================================
//!
//! # VirtIO共通モジュール（レガシーインターフェース）
//!
//! ## モジュール構成
//! - `defs`: レジスタオフセット、ステータス、リングレイアウト
//! - `transport`: トランスポートトレイトとレガシーPCI実装
//! - `virtqueue`: スプリットVirtqueue
//! - `loopback`: ソフトウェアデバイスモデル
//! - `net`: virtio-netドライバ

pub mod defs;
pub mod loopback;
pub mod net;
pub mod transport;
pub mod virtqueue;

pub use self::loopback::{LoopbackDevice, LoopbackTransport};
pub use self::transport::{
    LegacyPciTransport, PciDevice, TransportError, TransportResult, VirtioDeviceInit,
    VirtioTransport,
};
pub use self::virtqueue::{Segment, Virtqueue};
