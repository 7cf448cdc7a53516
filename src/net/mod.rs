// ============================================================================
// src/net/mod.rs - Network Subsystem Interfaces
// ドライバと上位スタックの境界（パケット・バッファプール・NIC抽象）
// ============================================================================

pub mod ethernet;
pub mod mempool;
pub mod nic;
pub mod packet;

pub use ethernet::{ETH_MTU, MacAddress};
pub use mempool::{BufferPool, DEFAULT_BUFFER_SIZE, Mempool, RawBuffer};
pub use nic::{
    LinkEvent, LinkHandler, Nic, NicStats, NicStatsSnapshot, ReceiveHandler, TxAvailableHandler,
};
pub use packet::Packet;
