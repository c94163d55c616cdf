//! The scheduler backend contract.
//!
//! The backend owns every persisted envelope and makes the "what runs next"
//! decision; the engine only consumes its answers. Implementations may live
//! in-process ([`MemoryBackend`](crate::MemoryBackend),
//! [`NullBackend`](crate::NullBackend)) or behind a message-passing worker
//! ([`ProxyBackend`](crate::ProxyBackend)).

use async_trait::async_trait;
use courier_common::{Envelope, EnvelopeId, MessageId};
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// Bitmask of batch kinds a `batch` request is willing to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeMask(u8);

impl TypeMask {
    pub const REMOVE: Self = Self(1);
    pub const EXPIRE: Self = Self(1 << 1);
    pub const BOUNCE: Self = Self(1 << 2);
    pub const MDA: Self = Self(1 << 3);
    pub const MTA: Self = Self(1 << 4);

    /// The kinds that must always stay schedulable: cleanup and
    /// notification make progress even while delivery is paused.
    pub const BASE: Self = Self(Self::REMOVE.0 | Self::EXPIRE.0 | Self::BOUNCE.0);

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TypeMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for TypeMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// The kind of work a batch carries. Each batch is homogeneous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchKind {
    /// Administratively removed envelopes, to be deleted and reported.
    Remove,
    /// Envelopes past their lifetime, to be deleted and bounced.
    Expire,
    /// Notification envelopes for the bounce generator.
    Bounce,
    /// Local deliveries for the MDA dispatcher.
    Mda,
    /// Relay deliveries for the MTA channel.
    Mta,
}

impl BatchKind {
    #[must_use]
    pub const fn mask(self) -> TypeMask {
        match self {
            Self::Remove => TypeMask::REMOVE,
            Self::Expire => TypeMask::EXPIRE,
            Self::Bounce => TypeMask::BOUNCE,
            Self::Mda => TypeMask::MDA,
            Self::Mta => TypeMask::MTA,
        }
    }
}

/// A homogeneous set of envelopes returned by one scheduling decision,
/// consumed exactly once by the matching dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub kind: BatchKind,
    pub envelopes: Vec<Envelope>,
}

impl Batch {
    /// The id view of the batch.
    pub fn ids(&self) -> impl Iterator<Item = EnvelopeId> + '_ {
        self.envelopes.iter().map(|evp| evp.id)
    }
}

/// Answer to one `batch` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchResult {
    /// Nothing will become ready without a mutating event; sleep.
    None,
    /// Work becomes ready in this many seconds; re-arm the timer.
    Delay(u64),
    /// Ready work.
    Batch(Batch),
}

/// Answer to one `update` request after a temporary failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateResult {
    /// Rescheduled; the next attempt time is monotonically non-decreasing
    /// per retry.
    Scheduled { retry: u32, next_attempt: u64 },
    /// The next attempt would fall past the envelope lifetime.
    Expired,
}

/// The persistence/decision contract consumed by the scheduler engine.
///
/// Administrative operations (`schedule`, `remove`, `suspend`, `resume`)
/// accept either a single envelope id or a whole-message id (sequence half
/// zero) and return the number of envelopes affected. Envelopes already
/// claimed by a dispatcher session are left alone; the operation takes
/// effect at the next batch boundary for the rest.
#[async_trait]
pub trait SchedulerBackend: Send + Sync + std::fmt::Debug {
    /// Stage one envelope for its message. Not schedulable until committed.
    async fn insert(&self, envelope: Envelope) -> Result<(), BackendError>;

    /// Make every staged envelope of the message schedulable.
    async fn commit(&self, message: MessageId) -> Result<(), BackendError>;

    /// Drop every staged envelope of the message.
    async fn rollback(&self, message: MessageId) -> Result<(), BackendError>;

    /// Reschedule after a temporary failure; bumps the retry counter and
    /// computes the next attempt time.
    async fn update(&self, envelope: EnvelopeId, now: u64) -> Result<UpdateResult, BackendError>;

    /// Delete one envelope. Returns `false` when it was already gone, so a
    /// second delete of the same id is a no-op.
    async fn delete(&self, envelope: EnvelopeId) -> Result<bool, BackendError>;

    /// Produce the next batch of work for the given kinds, up to `hint`
    /// envelopes.
    async fn batch(
        &self,
        mask: TypeMask,
        hint: usize,
        now: u64,
    ) -> Result<BatchResult, BackendError>;

    /// Enumerate committed messages, for introspection.
    async fn messages(&self) -> Result<Vec<MessageId>, BackendError>;

    /// Enumerate committed envelopes of one message, for introspection.
    async fn envelopes(&self, message: MessageId) -> Result<Vec<Envelope>, BackendError>;

    /// Force the next attempt of the addressed envelopes to now.
    async fn schedule(&self, id: EnvelopeId) -> Result<usize, BackendError>;

    /// Mark the addressed envelopes for removal at the next batch boundary.
    async fn remove(&self, id: EnvelopeId) -> Result<usize, BackendError>;

    /// Keep the addressed envelopes out of batches until resumed.
    async fn suspend(&self, id: EnvelopeId) -> Result<usize, BackendError>;

    /// Make suspended envelopes schedulable again.
    async fn resume(&self, id: EnvelopeId) -> Result<usize, BackendError>;
}
