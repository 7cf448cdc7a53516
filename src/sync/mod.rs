// ============================================================================
// src/sync/mod.rs - 同期プリミティブ
// 割り込み安全なロック機構とキューサービスの再入防止
// ============================================================================

pub mod irq_mutex;
pub mod service_gate;

pub use irq_mutex::{IrqMutex, IrqMutexGuard};
pub use service_gate::ServiceGate;
