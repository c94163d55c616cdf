//! Generator configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BounceConfig {
    /// Seconds an aggregate waits after its first member before it becomes
    /// eligible to send, batching near-simultaneous failures of one message
    /// into a single notification.
    ///
    /// Default: 1 second
    #[serde(default = "defaults::coalesce_secs")]
    pub coalesce_secs: u64,

    /// Outbound notification sessions running at once, across identities.
    ///
    /// Default: 2
    #[serde(default = "defaults::max_sessions")]
    pub max_sessions: usize,
}

impl Default for BounceConfig {
    fn default() -> Self {
        Self {
            coalesce_secs: defaults::coalesce_secs(),
            max_sessions: defaults::max_sessions(),
        }
    }
}

mod defaults {
    pub const fn coalesce_secs() -> u64 {
        1
    }

    pub const fn max_sessions() -> usize {
        2
    }
}
