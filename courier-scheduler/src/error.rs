//! Typed error handling for scheduling operations.
//!
//! Backend failures are never fatal to the engine: the affected item is
//! tempfailed or skipped and the engine keeps draining other work.

use courier_common::{EnvelopeId, MessageId};
use thiserror::Error;

/// Failures of the persistence/decision backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The envelope is not in the pool.
    #[error("envelope {0} not found")]
    NotFound(EnvelopeId),

    /// No staged envelopes exist for the message.
    #[error("message {0} not found")]
    MessageNotFound(MessageId),

    /// The backend cannot be reached; retry later.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Failures of the engine itself.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// A dispatcher or upstream channel is gone; the engine cannot make
    /// progress and shuts down.
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}
