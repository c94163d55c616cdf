use thiserror::Error;

/// Identity resolution failures, split by whether a retry can help.
#[derive(Debug, Clone, Error)]
pub enum LookupError {
    #[error("temporary lookup failure: {0}")]
    Temporary(String),

    #[error("permanent lookup failure: {0}")]
    Permanent(String),
}

/// Helper processes fail to start for transient reasons only; a helper that
/// started and then misbehaved is classified by the session instead.
#[derive(Debug, Clone, Error)]
#[error("cannot spawn delivery helper: {0}")]
pub struct SpawnError(pub String);

#[derive(Debug, Error)]
pub enum MdaError {
    /// A channel the dispatcher depends on closed underneath it.
    #[error("{0} channel closed")]
    ChannelClosed(&'static str),
}
