//! The local delivery dispatcher loop.
//!
//! Envelopes are grouped into per-user queues; a round-robin drain list
//! starts helper sessions while three ceilings hold (global envelopes,
//! global sessions, per-user sessions). Work over a ceiling is refused
//! with a temporary failure, never dropped.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use ahash::AHashMap;
use courier_common::{Delivery, Envelope, MessageStore, OutcomeEvent, Signal, internal};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

use crate::{
    config::MdaLimits,
    error::{LookupError, MdaError},
    helper::HelperSpawner,
    lookup::{UserInfo, UserLookup},
    session,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct UserKey {
    usertable: String,
    username: String,
}

#[derive(Debug)]
enum QueueState {
    /// Identity resolution in flight; the queue holds work but cannot run.
    LookupPending,
    Runnable(UserInfo),
}

#[derive(Debug)]
struct UserQueue {
    state: QueueState,
    pending: VecDeque<Envelope>,
    running: usize,
    /// Already on the drain list.
    listed: bool,
}

impl UserQueue {
    const fn new() -> Self {
        Self {
            state: QueueState::LookupPending,
            pending: VecDeque::new(),
            running: 0,
            listed: false,
        }
    }
}

/// Completions flowing back into the loop from spawned tasks.
#[derive(Debug)]
enum Internal {
    LookupDone(UserKey, Result<UserInfo, LookupError>),
    SessionDone(UserKey, OutcomeEvent),
}

/// The dispatcher context: every counter and queue lives here, owned by
/// the one task running the loop.
#[derive(Debug)]
pub struct MdaDispatcher {
    limits: MdaLimits,
    store: Arc<dyn MessageStore>,
    lookup: Arc<dyn UserLookup>,
    spawner: Arc<dyn HelperSpawner>,
    outcomes: mpsc::Sender<OutcomeEvent>,
    queues: AHashMap<UserKey, UserQueue>,
    drain: VecDeque<UserKey>,
    pending_total: usize,
    running_total: usize,
}

impl MdaDispatcher {
    #[must_use]
    pub fn new(
        limits: MdaLimits,
        store: Arc<dyn MessageStore>,
        lookup: Arc<dyn UserLookup>,
        spawner: Arc<dyn HelperSpawner>,
        outcomes: mpsc::Sender<OutcomeEvent>,
    ) -> Self {
        Self {
            limits,
            store,
            lookup,
            spawner,
            outcomes,
            queues: AHashMap::new(),
            drain: VecDeque::new(),
            pending_total: 0,
            running_total: 0,
        }
    }

    /// Run until the envelope channel closes or a shutdown signal arrives.
    ///
    /// # Errors
    /// When the outcome channel closes underneath the dispatcher.
    pub async fn run(
        mut self,
        mut envelopes: mpsc::Receiver<Envelope>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), MdaError> {
        internal!(level = INFO, "mda dispatcher starting");
        let (internal_tx, mut internal_rx) = mpsc::channel::<Internal>(256);

        loop {
            tokio::select! {
                envelope = envelopes.recv() => {
                    match envelope {
                        Some(envelope) => self.handle_envelope(&internal_tx, envelope).await?,
                        None => break,
                    }
                }
                event = internal_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_internal(&internal_tx, event).await?;
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!(level = INFO, "mda dispatcher received shutdown signal");
                        }
                        Err(e) => {
                            error!("mda shutdown channel error: {e}");
                        }
                    }
                    break;
                }
            }
        }

        internal!(level = INFO, "mda dispatcher stopped");
        Ok(())
    }

    async fn handle_envelope(
        &mut self,
        internal: &mpsc::Sender<Internal>,
        envelope: Envelope,
    ) -> Result<(), MdaError> {
        if self.pending_total + self.running_total >= self.limits.max_envelopes {
            warn!(envelope = %envelope.id, "envelope ceiling reached, refusing");
            return self.refuse(envelope.id, "too many envelopes").await;
        }

        let Delivery::Mda(info) = &envelope.delivery else {
            return self
                .send_outcome(OutcomeEvent::permfail(
                    envelope.id,
                    "envelope is not a local delivery".to_string(),
                ))
                .await;
        };
        let key = UserKey {
            usertable: info.usertable.clone(),
            username: info.username.clone(),
        };

        if !self.queues.contains_key(&key) {
            self.spawn_lookup(internal, key.clone());
            self.queues.insert(key.clone(), UserQueue::new());
        }
        let Some(queue) = self.queues.get_mut(&key) else {
            return Ok(());
        };

        if queue.pending.len() >= self.limits.max_user_pending {
            warn!(user = %key.username, "per-user pending ceiling reached, refusing");
            return self
                .refuse(envelope.id, "too many pending envelopes for user")
                .await;
        }

        queue.pending.push_back(envelope);
        self.pending_total += 1;
        if matches!(queue.state, QueueState::Runnable(_)) && !queue.listed {
            queue.listed = true;
            self.drain.push_back(key);
        }

        self.drain_queues(internal);
        Ok(())
    }

    async fn handle_internal(
        &mut self,
        internal: &mpsc::Sender<Internal>,
        event: Internal,
    ) -> Result<(), MdaError> {
        match event {
            Internal::LookupDone(key, Ok(user)) => {
                debug!(user = %user.username, "identity resolved");
                if let Some(queue) = self.queues.get_mut(&key) {
                    queue.state = QueueState::Runnable(user);
                    if queue.pending.is_empty() {
                        if queue.running == 0 {
                            self.queues.remove(&key);
                        }
                    } else if !queue.listed {
                        queue.listed = true;
                        self.drain.push_back(key);
                    }
                }
                self.drain_queues(internal);
            }
            Internal::LookupDone(key, Err(e)) => {
                warn!(user = %key.username, "identity lookup failed: {e}");
                if let Some(queue) = self.queues.remove(&key) {
                    self.pending_total -= queue.pending.len();
                    for envelope in queue.pending {
                        let outcome = match &e {
                            LookupError::Temporary(_) => {
                                OutcomeEvent::tempfail(envelope.id, e.to_string())
                            }
                            LookupError::Permanent(_) => {
                                OutcomeEvent::permfail(envelope.id, e.to_string())
                            }
                        };
                        self.send_outcome(outcome).await?;
                    }
                }
            }
            Internal::SessionDone(key, outcome) => {
                self.running_total -= 1;
                if let Some(queue) = self.queues.get_mut(&key) {
                    queue.running -= 1;
                    if queue.pending.is_empty() {
                        if queue.running == 0 {
                            self.queues.remove(&key);
                        }
                    } else if !queue.listed {
                        queue.listed = true;
                        self.drain.push_back(key);
                    }
                }
                self.send_outcome(outcome).await?;
                self.drain_queues(internal);
            }
        }
        Ok(())
    }

    /// Round-robin over the drain list, starting sessions until no queue
    /// can start another under the ceilings.
    ///
    /// Every iteration either starts a session or drops a queue from the
    /// list, so the loop terminates: a queue goes back on the list only
    /// when it just started a session and can still start more.
    fn drain_queues(&mut self, internal: &mpsc::Sender<Internal>) {
        while self.running_total < self.limits.max_sessions {
            let Some(key) = self.drain.pop_front() else {
                break;
            };
            let Some(queue) = self.queues.get_mut(&key) else {
                continue;
            };
            queue.listed = false;

            let QueueState::Runnable(user) = &queue.state else {
                continue;
            };
            let user = user.clone();

            if queue.running >= self.limits.max_user_sessions {
                // Relisted when one of its sessions finishes.
                continue;
            }

            let Some(envelope) = queue.pending.pop_front() else {
                if queue.running == 0 {
                    self.queues.remove(&key);
                }
                continue;
            };
            queue.running += 1;
            if !queue.pending.is_empty() && queue.running < self.limits.max_user_sessions {
                queue.listed = true;
                // Back to the tail: next user gets a turn first.
                self.drain.push_back(key.clone());
            }
            self.pending_total -= 1;
            self.running_total += 1;

            self.start_session(internal, key, user, envelope);
        }
    }

    fn spawn_lookup(&self, internal: &mpsc::Sender<Internal>, key: UserKey) {
        debug!(user = %key.username, table = %key.usertable, "resolving identity");
        let lookup = Arc::clone(&self.lookup);
        let internal = internal.clone();
        tokio::spawn(async move {
            let result = lookup.lookup(&key.usertable, &key.username).await;
            let _ = internal.send(Internal::LookupDone(key, result)).await;
        });
    }

    fn start_session(
        &self,
        internal: &mpsc::Sender<Internal>,
        key: UserKey,
        user: UserInfo,
        envelope: Envelope,
    ) {
        debug!(envelope = %envelope.id, user = %user.username, "starting delivery session");
        let store = Arc::clone(&self.store);
        let spawner = Arc::clone(&self.spawner);
        let timeout = Duration::from_secs(self.limits.session_timeout_secs);
        let internal = internal.clone();
        tokio::spawn(async move {
            let outcome = session::run(store, spawner, user, envelope, timeout).await;
            let _ = internal.send(Internal::SessionDone(key, outcome)).await;
        });
    }

    async fn refuse(
        &self,
        envelope: courier_common::EnvelopeId,
        diagnostic: &str,
    ) -> Result<(), MdaError> {
        self.send_outcome(OutcomeEvent::tempfail(envelope, diagnostic.to_string()))
            .await
    }

    async fn send_outcome(&self, outcome: OutcomeEvent) -> Result<(), MdaError> {
        self.outcomes
            .send(outcome)
            .await
            .map_err(|_| MdaError::ChannelClosed("outcome"))
    }
}
