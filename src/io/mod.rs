// ============================================================================
// src/io/mod.rs - I/O Subsystem
// ============================================================================

pub mod log;
pub mod virtio;
