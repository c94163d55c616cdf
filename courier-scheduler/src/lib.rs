//! Delivery scheduling: the engine loop and the backend contract it drives.
//!
//! The engine owns no envelope state of its own. Everything durable lives
//! behind [`backend::SchedulerBackend`]; the engine asks for homogeneous
//! batches, pushes delivery work onto per-dispatcher channels, and folds
//! attempt outcomes back into the backend.

pub mod backend;
pub mod backends;
pub mod backoff;
pub mod engine;
pub mod error;

pub use backend::{Batch, BatchKind, BatchResult, SchedulerBackend, TypeMask, UpdateResult};
pub use backends::{MemoryBackend, NullBackend, ProxyBackend, spawn_backend_worker};
pub use backoff::BackoffPolicy;
pub use engine::{Scheduler, SchedulerChannels, SchedulerConfig, SchedulerEvent, now_secs};
pub use error::{BackendError, SchedulerError};
