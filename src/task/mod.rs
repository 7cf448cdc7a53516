// ============================================================================
// src/task/mod.rs - 割り込みとタスクの橋渡し
// ============================================================================

pub mod interrupt_waker;
pub mod tick;

pub use interrupt_waker::{AtomicWaker, IrqEventChannel, IrqEventFuture};
pub use tick::{DeferredWork, TickDispatcher};
