//! Terminal outcomes reported by dispatchers back to the scheduler.

use serde::{Deserialize, Serialize};

use crate::id::EnvelopeId;

/// Classification of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryOutcome {
    /// The envelope was delivered.
    Ok,
    /// The attempt failed but may succeed later; carries the diagnostic
    /// captured from the failing helper or server.
    TempFail(String),
    /// The attempt failed and must never be retried.
    PermFail(String),
}

impl DeliveryOutcome {
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    #[must_use]
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Self::Ok => None,
            Self::TempFail(diag) | Self::PermFail(diag) => Some(diag),
        }
    }
}

/// One outcome event, a complete and self-contained message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeEvent {
    pub envelope: EnvelopeId,
    pub outcome: DeliveryOutcome,
}

impl OutcomeEvent {
    #[must_use]
    pub const fn ok(envelope: EnvelopeId) -> Self {
        Self {
            envelope,
            outcome: DeliveryOutcome::Ok,
        }
    }

    #[must_use]
    pub const fn tempfail(envelope: EnvelopeId, diagnostic: String) -> Self {
        Self {
            envelope,
            outcome: DeliveryOutcome::TempFail(diagnostic),
        }
    }

    #[must_use]
    pub const fn permfail(envelope: EnvelopeId, diagnostic: String) -> Self {
        Self {
            envelope,
            outcome: DeliveryOutcome::PermFail(diagnostic),
        }
    }
}

/// What the scheduler reports upstream once an envelope leaves the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeNotice {
    /// Delivered; the envelope is gone.
    Delivered(EnvelopeId),
    /// Administratively removed.
    Removed(EnvelopeId),
    /// Lifetime exceeded; the envelope is gone.
    Expired(EnvelopeId),
    /// Attempt failed, envelope rescheduled.
    TempFailed(EnvelopeId, String),
    /// Failed terminally; the envelope is gone.
    PermFailed(EnvelopeId, String),
}

impl EnvelopeNotice {
    #[must_use]
    pub const fn envelope(&self) -> EnvelopeId {
        match self {
            Self::Delivered(id)
            | Self::Removed(id)
            | Self::Expired(id)
            | Self::TempFailed(id, _)
            | Self::PermFailed(id, _) => *id,
        }
    }
}
