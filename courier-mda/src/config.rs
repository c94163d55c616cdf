//! Dispatcher ceilings.

use serde::{Deserialize, Serialize};

/// Concurrency and capacity limits enforced by the dispatcher.
///
/// Work over a ceiling is refused with a temporary failure so the scheduler
/// retries it later; nothing is ever dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MdaLimits {
    /// Envelopes held by the dispatcher, pending plus in flight.
    ///
    /// Default: 5000
    #[serde(default = "defaults::max_envelopes")]
    pub max_envelopes: usize,

    /// Helper sessions running at once, across all users.
    ///
    /// Default: 50
    #[serde(default = "defaults::max_sessions")]
    pub max_sessions: usize,

    /// Helper sessions running at once for a single user.
    ///
    /// Default: 7
    #[serde(default = "defaults::max_user_sessions")]
    pub max_user_sessions: usize,

    /// Envelopes queued for a single user.
    ///
    /// Default: 500
    #[serde(default = "defaults::max_user_pending")]
    pub max_user_pending: usize,

    /// Wall-clock bound on one helper session (in seconds).
    ///
    /// Default: 300 seconds
    #[serde(default = "defaults::session_timeout_secs")]
    pub session_timeout_secs: u64,
}

impl Default for MdaLimits {
    fn default() -> Self {
        Self {
            max_envelopes: defaults::max_envelopes(),
            max_sessions: defaults::max_sessions(),
            max_user_sessions: defaults::max_user_sessions(),
            max_user_pending: defaults::max_user_pending(),
            session_timeout_secs: defaults::session_timeout_secs(),
        }
    }
}

mod defaults {
    pub const fn max_envelopes() -> usize {
        5000
    }

    pub const fn max_sessions() -> usize {
        50
    }

    pub const fn max_user_sessions() -> usize {
        7
    }

    pub const fn max_user_pending() -> usize {
        500
    }

    pub const fn session_timeout_secs() -> u64 {
        300 // 5 minutes
    }
}
