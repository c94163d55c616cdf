use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// The scheduler engine stopped; no further events can be delivered.
    #[error("scheduler engine is gone")]
    EngineGone,
}
