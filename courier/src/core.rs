//! Wiring of the three event loops.
//!
//! `Core::spawn` connects the scheduler engine, the MDA dispatcher and the
//! bounce generator with channels, forwards dispatcher outcomes back into
//! the engine, and hands the embedder the ends it owns: the event sender,
//! the relay channel and the notice stream.

use std::sync::Arc;

use courier_bounce::{BounceGenerator, OutboundTransport};
use courier_common::{
    Envelope, EnvelopeNotice, MessageId, MessageStore, Signal, internal,
};
use courier_mda::{HelperSpawner, MdaDispatcher, UserLookup};
use courier_scheduler::{
    MemoryBackend, Scheduler, SchedulerBackend, SchedulerChannels, SchedulerEvent,
};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::{config::CourierConfig, error::CoreError};

/// Everything the core borrows from its embedder.
#[derive(Debug)]
pub struct Collaborators {
    /// Scheduling state; defaults to an in-memory backend built from the
    /// configured backoff policy.
    pub backend: Option<Arc<dyn SchedulerBackend>>,
    pub store: Arc<dyn MessageStore>,
    pub lookup: Arc<dyn UserLookup>,
    pub spawner: Arc<dyn HelperSpawner>,
    pub transport: Arc<dyn OutboundTransport>,
}

/// A running delivery core.
#[derive(Debug)]
pub struct Core {
    events: mpsc::Sender<SchedulerEvent>,
    /// Relay envelopes for the embedder's outbound MTA path.
    pub relay: mpsc::Receiver<Envelope>,
    /// Terminal notices toward the upstream queue.
    pub notices: mpsc::Receiver<EnvelopeNotice>,
    shutdown: broadcast::Sender<Signal>,
}

impl Core {
    /// Spawn the three loops and the outcome forwarder.
    #[must_use]
    pub fn spawn(config: CourierConfig, collaborators: Collaborators) -> Self {
        let backend = collaborators
            .backend
            .unwrap_or_else(|| Arc::new(MemoryBackend::new(config.backoff)));

        let (event_tx, event_rx) = mpsc::channel(1024);
        let (mda_tx, mda_rx) = mpsc::channel(1024);
        let (mta_tx, mta_rx) = mpsc::channel(1024);
        let (bounce_tx, bounce_rx) = mpsc::channel(1024);
        let (notice_tx, notice_rx) = mpsc::channel(1024);
        let (outcome_tx, mut outcome_rx) = mpsc::channel(1024);
        let (shutdown_tx, _) = broadcast::channel(1);

        let scheduler = Scheduler::new(
            backend,
            config.scheduler,
            SchedulerChannels {
                mda: mda_tx,
                mta: mta_tx,
                bounce: bounce_tx,
                upstream: notice_tx,
            },
        );
        tokio::spawn(scheduler.run(event_rx, shutdown_tx.subscribe()));

        let dispatcher = MdaDispatcher::new(
            config.mda,
            Arc::clone(&collaborators.store),
            collaborators.lookup,
            collaborators.spawner,
            outcome_tx.clone(),
        );
        tokio::spawn(dispatcher.run(mda_rx, shutdown_tx.subscribe()));

        let generator = BounceGenerator::new(
            config.bounce,
            collaborators.store,
            collaborators.transport,
            outcome_tx,
        );
        tokio::spawn(generator.run(bounce_rx, shutdown_tx.subscribe()));

        // Dispatcher outcomes fold back into the engine.
        let events = event_tx.clone();
        tokio::spawn(async move {
            while let Some(outcome) = outcome_rx.recv().await {
                if events.send(SchedulerEvent::Outcome(outcome)).await.is_err() {
                    break;
                }
            }
            internal!(level = DEBUG, "outcome forwarder exiting");
        });

        Self {
            events: event_tx,
            relay: mta_rx,
            notices: notice_rx,
            shutdown: shutdown_tx,
        }
    }

    /// The raw event sender, for administrative events.
    #[must_use]
    pub fn events(&self) -> mpsc::Sender<SchedulerEvent> {
        self.events.clone()
    }

    /// Stage one envelope for its message.
    ///
    /// # Errors
    /// When the engine is gone.
    pub async fn insert(&self, envelope: Envelope) -> Result<(), CoreError> {
        self.send(SchedulerEvent::Insert(envelope)).await
    }

    /// Make a message's staged envelopes schedulable.
    ///
    /// # Errors
    /// When the engine is gone.
    pub async fn commit(&self, message: MessageId) -> Result<(), CoreError> {
        self.send(SchedulerEvent::Commit(message)).await
    }

    /// Drop a message's staged envelopes.
    ///
    /// # Errors
    /// When the engine is gone.
    pub async fn rollback(&self, message: MessageId) -> Result<(), CoreError> {
        self.send(SchedulerEvent::Rollback(message)).await
    }

    /// Committed envelopes of one message, for introspection.
    ///
    /// # Errors
    /// When the engine is gone.
    pub async fn envelopes(&self, message: MessageId) -> Result<Vec<Envelope>, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(SchedulerEvent::ListEnvelopes(message, tx)).await?;
        rx.await.map_err(|_| CoreError::EngineGone)
    }

    /// Committed message ids, for introspection.
    ///
    /// # Errors
    /// When the engine is gone.
    pub async fn messages(&self) -> Result<Vec<MessageId>, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(SchedulerEvent::ListMessages(tx)).await?;
        rx.await.map_err(|_| CoreError::EngineGone)
    }

    async fn send(&self, event: SchedulerEvent) -> Result<(), CoreError> {
        self.events
            .send(event)
            .await
            .map_err(|_| CoreError::EngineGone)
    }

    /// Ask every loop to stop. In-flight sessions run to completion.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(Signal::Shutdown);
    }
}
