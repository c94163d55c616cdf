use thiserror::Error;

/// The transport either grants a connected session or asks to come back
/// later; there is no permanent transport failure.
#[derive(Debug, Clone, Error)]
#[error("transport unavailable: {0}")]
pub struct TransportError(pub String);

#[derive(Debug, Error)]
pub enum BounceError {
    /// A channel the generator depends on closed underneath it.
    #[error("{0} channel closed")]
    ChannelClosed(&'static str),
}
