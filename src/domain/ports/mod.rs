//! Ports (trait interfaces) between the domain and its adapters.

pub mod clock;
pub mod memory_backend;

pub use clock::{Clock, ManualClock, SystemClock};
pub use memory_backend::{EventSink, MemoryBackend, WriteOp};
