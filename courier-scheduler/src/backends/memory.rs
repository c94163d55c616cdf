//! In-memory scheduler backend.
//!
//! Envelope state lives in a pool keyed by envelope id; the batch decision
//! walks the pool in id order, so envelopes of one message come out in
//! sequence order. Claimed envelopes stay in the pool but are skipped until
//! the engine reports their outcome.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use courier_common::{DeliveryKind, Envelope, EnvelopeId, MessageId};
use parking_lot::Mutex;

use crate::{
    backend::{Batch, BatchKind, BatchResult, SchedulerBackend, TypeMask, UpdateResult},
    backoff::BackoffPolicy,
    error::BackendError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryStatus {
    Runnable,
    /// Claimed by a dispatcher session; untouchable until its outcome.
    InFlight,
    Suspended,
    /// Marked for removal at the next batch boundary.
    Removed,
}

#[derive(Debug)]
struct Entry {
    envelope: Envelope,
    next_attempt: u64,
    status: EntryStatus,
}

#[derive(Debug, Default)]
struct State {
    staged: HashMap<MessageId, Vec<Envelope>>,
    pool: BTreeMap<EnvelopeId, Entry>,
}

impl State {
    /// Ids addressed by an administrative operation: one envelope, or every
    /// envelope of a message when the sequence half is zero.
    fn targets(&self, id: EnvelopeId) -> Vec<EnvelopeId> {
        if id.is_message() {
            self.pool
                .range(id..)
                .take_while(|(evp, _)| evp.message() == id.message())
                .map(|(evp, _)| *evp)
                .collect()
        } else {
            self.pool.contains_key(&id).then_some(id).into_iter().collect()
        }
    }
}

/// In-process implementation of the backend contract.
#[derive(Debug)]
pub struct MemoryBackend {
    backoff: BackoffPolicy,
    state: Mutex<State>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

impl MemoryBackend {
    #[must_use]
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            backoff,
            state: Mutex::new(State::default()),
        }
    }

    fn collect(
        state: &mut State,
        kind: BatchKind,
        hint: usize,
        now: u64,
    ) -> Option<Batch> {
        let mut envelopes = Vec::new();

        for entry in state.pool.values_mut() {
            if envelopes.len() >= hint {
                break;
            }
            let ready = match kind {
                BatchKind::Remove => entry.status == EntryStatus::Removed,
                BatchKind::Expire => {
                    entry.status != EntryStatus::InFlight
                        && entry.status != EntryStatus::Removed
                        && entry.envelope.is_expired(now)
                }
                BatchKind::Bounce | BatchKind::Mda | BatchKind::Mta => {
                    entry.status == EntryStatus::Runnable
                        && !entry.envelope.is_expired(now)
                        && entry.next_attempt <= now
                        && batch_kind_of(&entry.envelope) == kind
                }
            };
            if ready {
                // Delivery work is claimed; remove/expire entries stay put
                // until the engine deletes them.
                if matches!(kind, BatchKind::Bounce | BatchKind::Mda | BatchKind::Mta) {
                    entry.status = EntryStatus::InFlight;
                }
                envelopes.push(entry.envelope.clone());
            }
        }

        (!envelopes.is_empty()).then_some(Batch { kind, envelopes })
    }

    /// Seconds until the next entry eligible under `mask` becomes ready.
    fn next_wake(state: &State, mask: TypeMask, now: u64) -> Option<u64> {
        state
            .pool
            .values()
            .filter_map(|entry| match entry.status {
                EntryStatus::Runnable => {
                    let due = if mask.contains(batch_kind_of(&entry.envelope).mask()) {
                        entry.next_attempt.min(entry.envelope.expires_at())
                    } else {
                        entry.envelope.expires_at()
                    };
                    Some(due)
                }
                EntryStatus::Suspended => Some(entry.envelope.expires_at()),
                EntryStatus::InFlight | EntryStatus::Removed => None,
            })
            .min()
            .map(|due| due.saturating_sub(now).max(1))
    }
}

const fn batch_kind_of(envelope: &Envelope) -> BatchKind {
    match envelope.kind() {
        DeliveryKind::Mda => BatchKind::Mda,
        DeliveryKind::Mta => BatchKind::Mta,
        DeliveryKind::Bounce => BatchKind::Bounce,
    }
}

#[async_trait]
impl SchedulerBackend for MemoryBackend {
    async fn insert(&self, envelope: Envelope) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state
            .staged
            .entry(envelope.id.message())
            .or_default()
            .push(envelope);
        Ok(())
    }

    async fn commit(&self, message: MessageId) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let staged = state
            .staged
            .remove(&message)
            .ok_or(BackendError::MessageNotFound(message))?;
        for envelope in staged {
            state.pool.insert(
                envelope.id,
                Entry {
                    envelope,
                    next_attempt: 0,
                    status: EntryStatus::Runnable,
                },
            );
        }
        Ok(())
    }

    async fn rollback(&self, message: MessageId) -> Result<(), BackendError> {
        self.state.lock().staged.remove(&message);
        Ok(())
    }

    async fn update(&self, envelope: EnvelopeId, now: u64) -> Result<UpdateResult, BackendError> {
        let mut state = self.state.lock();
        let entry = state
            .pool
            .get_mut(&envelope)
            .ok_or(BackendError::NotFound(envelope))?;

        entry.envelope.retry += 1;
        entry.envelope.last_attempt = now;

        let delay = self.backoff.delay(entry.envelope.retry).as_secs();
        let next_attempt = now.saturating_add(delay);
        if next_attempt >= entry.envelope.expires_at() {
            return Ok(UpdateResult::Expired);
        }

        entry.next_attempt = next_attempt;
        entry.status = EntryStatus::Runnable;
        Ok(UpdateResult::Scheduled {
            retry: entry.envelope.retry,
            next_attempt,
        })
    }

    async fn delete(&self, envelope: EnvelopeId) -> Result<bool, BackendError> {
        Ok(self.state.lock().pool.remove(&envelope).is_some())
    }

    async fn batch(
        &self,
        mask: TypeMask,
        hint: usize,
        now: u64,
    ) -> Result<BatchResult, BackendError> {
        let mut state = self.state.lock();

        for kind in [
            BatchKind::Remove,
            BatchKind::Expire,
            BatchKind::Bounce,
            BatchKind::Mda,
            BatchKind::Mta,
        ] {
            if !mask.contains(kind.mask()) {
                continue;
            }
            if let Some(batch) = Self::collect(&mut state, kind, hint, now) {
                return Ok(BatchResult::Batch(batch));
            }
        }

        Ok(Self::next_wake(&state, mask, now).map_or(BatchResult::None, BatchResult::Delay))
    }

    async fn messages(&self) -> Result<Vec<MessageId>, BackendError> {
        let state = self.state.lock();
        let mut out: Vec<MessageId> = state.pool.keys().map(|id| id.message()).collect();
        out.dedup();
        Ok(out)
    }

    async fn envelopes(&self, message: MessageId) -> Result<Vec<Envelope>, BackendError> {
        let state = self.state.lock();
        let start = EnvelopeId::new(message, 0);
        Ok(state
            .pool
            .range(start..)
            .take_while(|(id, _)| id.message() == message)
            .map(|(_, entry)| entry.envelope.clone())
            .collect())
    }

    async fn schedule(&self, id: EnvelopeId) -> Result<usize, BackendError> {
        let mut state = self.state.lock();
        let targets = state.targets(id);
        let mut affected = 0;
        for target in targets {
            if let Some(entry) = state.pool.get_mut(&target)
                && entry.status != EntryStatus::InFlight
            {
                entry.next_attempt = 0;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn remove(&self, id: EnvelopeId) -> Result<usize, BackendError> {
        let mut state = self.state.lock();
        let targets = state.targets(id);
        let mut affected = 0;
        for target in targets {
            if let Some(entry) = state.pool.get_mut(&target)
                && entry.status != EntryStatus::InFlight
            {
                entry.status = EntryStatus::Removed;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn suspend(&self, id: EnvelopeId) -> Result<usize, BackendError> {
        let mut state = self.state.lock();
        let targets = state.targets(id);
        let mut affected = 0;
        for target in targets {
            if let Some(entry) = state.pool.get_mut(&target)
                && entry.status == EntryStatus::Runnable
            {
                entry.status = EntryStatus::Suspended;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn resume(&self, id: EnvelopeId) -> Result<usize, BackendError> {
        let mut state = self.state.lock();
        let targets = state.targets(id);
        let mut affected = 0;
        for target in targets {
            if let Some(entry) = state.pool.get_mut(&target)
                && entry.status == EntryStatus::Suspended
            {
                entry.status = EntryStatus::Runnable;
                affected += 1;
            }
        }
        Ok(affected)
    }
}
