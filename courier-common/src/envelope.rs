//! The envelope: one (sender, recipient, delivery-method) unit of work.

use serde::{Deserialize, Serialize};

use crate::{address::Address, id::EnvelopeId};

/// Which dispatcher an envelope belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryKind {
    /// Local delivery through a helper process.
    Mda,
    /// Outbound relay to a remote host.
    Mta,
    /// A synthesized failure/delay/status notification.
    Bounce,
}

/// How a local delivery helper writes the message out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MdaMethod {
    /// Pipe the message into a command.
    Command,
    /// Append to an mbox file.
    Mbox,
    /// Deliver into a maildir.
    Maildir,
    /// Append to a raw file.
    File,
}

/// Local-delivery parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MdaInfo {
    pub method: MdaMethod,
    /// Method-specific target: the command line, mbox path, maildir path
    /// or file path the helper should deliver into.
    pub buffer: String,
    /// The user the helper runs as.
    pub username: String,
    /// The lookup table the username resolves through.
    pub usertable: String,
}

/// Severity class of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BounceClass {
    /// Delivery failed permanently.
    Failed,
    /// Delivery is delayed but still being retried.
    Delayed,
    /// Positive delivery-status (or relay hand-off) notice.
    Status,
}

/// How much of the original message a notification carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportScope {
    /// Only the header block of the original message.
    HeadersOnly,
    /// The complete original message.
    FullMessage,
}

/// Bounce parameters carried by a notification envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BounceInfo {
    pub class: BounceClass,
    pub scope: ReportScope,
    /// Seconds after which a delayed-warning becomes eligible.
    pub delay_secs: u64,
    /// Seconds after which the original envelope expires.
    pub ttl_secs: u64,
    /// Diagnostic line describing why the recipient failed.
    pub diagnostic: String,
}

/// Remote host descriptor for relay envelopes. The relay session itself is
/// an external collaborator; the descriptor only travels with the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelayInfo {
    pub host: String,
    pub port: u16,
}

/// Type-specific delivery payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Delivery {
    Mda(MdaInfo),
    Mta(RelayInfo),
    Bounce(BounceInfo),
}

impl Delivery {
    #[must_use]
    pub const fn kind(&self) -> DeliveryKind {
        match self {
            Self::Mda(_) => DeliveryKind::Mda,
            Self::Mta(_) => DeliveryKind::Mta,
            Self::Bounce(_) => DeliveryKind::Bounce,
        }
    }
}

/// One unit of delivery work derived from an accepted message.
///
/// An envelope belongs to exactly one message and, at any instant, is owned
/// by at most one of the scheduler pool and an in-flight dispatcher session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: EnvelopeId,
    pub sender: Address,
    /// The recipient as originally accepted.
    pub recipient: Address,
    /// The destination after alias/virtual expansion.
    pub dest: Address,
    /// Identity of the listener that accepted the message; selects the
    /// outbound identity used when a notification is generated for it.
    pub smtpname: String,
    pub delivery: Delivery,
    /// Attempts made so far.
    pub retry: u32,
    /// Unix seconds at creation.
    pub creation: u64,
    /// Seconds after creation at which the envelope expires.
    pub ttl_secs: u64,
    /// Unix seconds of the last attempt, zero before the first.
    pub last_attempt: u64,
}

impl Envelope {
    #[must_use]
    pub const fn kind(&self) -> DeliveryKind {
        self.delivery.kind()
    }

    /// Unix seconds at which the envelope expires.
    #[must_use]
    pub const fn expires_at(&self) -> u64 {
        self.creation.saturating_add(self.ttl_secs)
    }

    #[must_use]
    pub const fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at()
    }
}
