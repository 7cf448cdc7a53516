// ============================================================================
// src/lib.rs - Legacy VirtIO-Net Driver
// ============================================================================
//!
//! # rany_virtio_net
//!
//! 単一アドレス空間・割り込み駆動カーネル向けのレガシーvirtio-netドライバ
//!
//! ## モジュール構成
//! - `io::virtio`: トランスポート、Virtqueue、virtio-netドライバ本体
//! - `net`: 上位スタックとの境界（パケット、バッファプール、NIC抽象）
//! - `sync`: 割り込み安全なロックとキューの再入防止
//! - `task`: tick終了時の遅延処理と割り込み→タスクのイベントチャネル
//! - `error`: 統一エラー型

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod io;
pub mod net;
pub mod sync;
pub mod task;

pub use error::{DriverError, DriverResult};
pub use io::virtio::net::{NetFeatures, VirtioNet, VirtioNetConfig};
pub use net::{BufferPool, MacAddress, Mempool, Nic, NicStats, Packet};
pub use task::TickDispatcher;
