//! Backend implementations of the scheduling contract:
//! - `memory`: in-process pool with exponential backoff
//! - `null`: accepts and discards everything
//! - `proxy`: forwards the contract to a worker task over channels

pub mod memory;
pub mod null;
pub mod proxy;

pub use memory::MemoryBackend;
pub use null::NullBackend;
pub use proxy::{ProxyBackend, spawn_backend_worker};
