//! The scheduler engine: decides what runs next and dispatches it.
//!
//! The engine is a single event loop. Mutating events re-arm a zero-delay
//! timer; each timer tick asks the backend for one batch and dispatches it.
//! `None` from the backend means sleep until the next mutating event,
//! `Delay(n)` re-arms the timer, and a batch is followed by an immediate
//! re-arm so ready work drains before the loop goes back to sleep.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use courier_common::{
    BounceClass, BounceInfo, Delivery, DeliveryKind, DeliveryOutcome, Envelope, EnvelopeId,
    EnvelopeNotice, MessageId, OutcomeEvent, ReportScope, Signal, internal,
};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::{
    backend::{Batch, BatchKind, BatchResult, SchedulerBackend, TypeMask, UpdateResult},
    error::SchedulerError,
};

/// Unix seconds now.
#[must_use]
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

const fn default_batch_hint() -> usize {
    256
}

const fn default_bounce_ttl() -> u64 {
    14400 // 4 hours
}

const fn default_bounce_scope() -> ReportScope {
    ReportScope::HeadersOnly
}

/// Engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Envelope-count hint passed with every batch request.
    #[serde(default = "default_batch_hint")]
    pub batch_hint: usize,

    /// Lifetime of synthesized notification envelopes (in seconds).
    #[serde(default = "default_bounce_ttl")]
    pub bounce_ttl_secs: u64,

    /// How much of the original message notifications carry.
    #[serde(default = "default_bounce_scope")]
    pub bounce_scope: ReportScope,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_hint: default_batch_hint(),
            bounce_ttl_secs: default_bounce_ttl(),
            bounce_scope: default_bounce_scope(),
        }
    }
}

/// Everything the engine reacts to.
#[derive(Debug)]
pub enum SchedulerEvent {
    /// Stage an envelope for its message.
    Insert(Envelope),
    /// Make a message's envelopes schedulable.
    Commit(MessageId),
    /// Drop a message's staged envelopes.
    Rollback(MessageId),
    /// A dispatcher finished one attempt.
    Outcome(OutcomeEvent),
    /// Stop handing out local deliveries; cleanup and notification continue.
    PauseMda,
    ResumeMda,
    /// Stop handing out relay deliveries; cleanup and notification continue.
    PauseMta,
    ResumeMta,
    /// Force the next attempt of the addressed envelopes to now.
    Schedule(EnvelopeId),
    /// Remove the addressed envelopes at the next batch boundary.
    Remove(EnvelopeId),
    Suspend(EnvelopeId),
    Resume(EnvelopeId),
    /// Introspection: committed message ids.
    ListMessages(oneshot::Sender<Vec<MessageId>>),
    /// Introspection: committed envelopes of one message.
    ListEnvelopes(MessageId, oneshot::Sender<Vec<Envelope>>),
}

/// Outgoing sides of the engine's channels.
#[derive(Debug)]
pub struct SchedulerChannels {
    /// Local deliveries toward the MDA dispatcher.
    pub mda: mpsc::Sender<Envelope>,
    /// Relay deliveries toward the embedding daemon's MTA path.
    pub mta: mpsc::Sender<Envelope>,
    /// Notification envelopes toward the bounce generator.
    pub bounce: mpsc::Sender<Envelope>,
    /// Terminal notices toward the upstream queue.
    pub upstream: mpsc::Sender<EnvelopeNotice>,
}

/// The engine itself: one owned context, no ambient state.
#[derive(Debug)]
pub struct Scheduler {
    backend: Arc<dyn SchedulerBackend>,
    config: SchedulerConfig,
    channels: SchedulerChannels,
    mda_paused: bool,
    mta_paused: bool,
    /// `None` sleeps until the next mutating event.
    timer: Option<Duration>,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        backend: Arc<dyn SchedulerBackend>,
        config: SchedulerConfig,
        channels: SchedulerChannels,
    ) -> Self {
        Self {
            backend,
            config,
            channels,
            mda_paused: false,
            mta_paused: false,
            timer: Some(Duration::ZERO),
        }
    }

    /// Run until the event channel closes or a shutdown signal arrives.
    ///
    /// # Errors
    /// When a dispatcher or upstream channel closes underneath the engine.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<SchedulerEvent>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), SchedulerError> {
        internal!(level = INFO, "scheduler engine starting");

        loop {
            let timer = self.timer;
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await?,
                        None => break,
                    }
                }
                () = sleep_for(timer), if timer.is_some() => {
                    self.tick().await?;
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!(level = INFO, "scheduler engine received shutdown signal");
                        }
                        Err(e) => {
                            error!("scheduler shutdown channel error: {e}");
                        }
                    }
                    break;
                }
            }
        }

        internal!(level = INFO, "scheduler engine stopped");
        Ok(())
    }

    async fn handle_event(&mut self, event: SchedulerEvent) -> Result<(), SchedulerError> {
        match event {
            SchedulerEvent::Insert(envelope) => {
                debug!(envelope = %envelope.id, kind = ?envelope.kind(), "insert");
                if let Err(e) = self.backend.insert(envelope).await {
                    error!("backend insert failed: {e}");
                }
            }
            SchedulerEvent::Commit(message) => {
                debug!(message = %message, "commit");
                if let Err(e) = self.backend.commit(message).await {
                    error!(message = %message, "backend commit failed: {e}");
                }
                self.arm();
            }
            SchedulerEvent::Rollback(message) => {
                debug!(message = %message, "rollback");
                if let Err(e) = self.backend.rollback(message).await {
                    error!(message = %message, "backend rollback failed: {e}");
                }
            }
            SchedulerEvent::Outcome(outcome) => {
                self.handle_outcome(outcome).await?;
                self.arm();
            }
            SchedulerEvent::PauseMda => self.mda_paused = true,
            SchedulerEvent::ResumeMda => {
                self.mda_paused = false;
                self.arm();
            }
            SchedulerEvent::PauseMta => self.mta_paused = true,
            SchedulerEvent::ResumeMta => {
                self.mta_paused = false;
                self.arm();
            }
            SchedulerEvent::Schedule(id) => {
                match self.backend.schedule(id).await {
                    Ok(n) => debug!(id = %id, affected = n, "schedule"),
                    Err(e) => error!(id = %id, "backend schedule failed: {e}"),
                }
                self.arm();
            }
            SchedulerEvent::Remove(id) => {
                match self.backend.remove(id).await {
                    Ok(n) => debug!(id = %id, affected = n, "remove"),
                    Err(e) => error!(id = %id, "backend remove failed: {e}"),
                }
                self.arm();
            }
            SchedulerEvent::Suspend(id) => match self.backend.suspend(id).await {
                Ok(n) => debug!(id = %id, affected = n, "suspend"),
                Err(e) => error!(id = %id, "backend suspend failed: {e}"),
            },
            SchedulerEvent::Resume(id) => {
                match self.backend.resume(id).await {
                    Ok(n) => debug!(id = %id, affected = n, "resume"),
                    Err(e) => error!(id = %id, "backend resume failed: {e}"),
                }
                self.arm();
            }
            SchedulerEvent::ListMessages(reply) => {
                let messages = self.backend.messages().await.unwrap_or_default();
                let _ = reply.send(messages);
            }
            SchedulerEvent::ListEnvelopes(message, reply) => {
                let envelopes = self.backend.envelopes(message).await.unwrap_or_default();
                let _ = reply.send(envelopes);
            }
        }
        Ok(())
    }

    /// Request one batch and dispatch it.
    async fn tick(&mut self) -> Result<(), SchedulerError> {
        let mut mask = TypeMask::BASE;
        if !self.mda_paused {
            mask |= TypeMask::MDA;
        }
        if !self.mta_paused {
            mask |= TypeMask::MTA;
        }

        let now = now_secs();
        match self.backend.batch(mask, self.config.batch_hint, now).await {
            Ok(BatchResult::None) => self.timer = None,
            Ok(BatchResult::Delay(secs)) => self.timer = Some(Duration::from_secs(secs)),
            Ok(BatchResult::Batch(batch)) => {
                self.dispatch(batch, now).await?;
                self.arm();
            }
            Err(e) => {
                // Backend unavailability only delays work, it never stops
                // the loop.
                error!("backend batch failed: {e}");
                self.timer = Some(Duration::from_secs(1));
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, batch: Batch, now: u64) -> Result<(), SchedulerError> {
        debug!(kind = ?batch.kind, count = batch.envelopes.len(), "dispatching batch");
        match batch.kind {
            BatchKind::Remove => {
                for envelope in batch.envelopes {
                    let _ = self.backend.delete(envelope.id).await;
                    self.notify(EnvelopeNotice::Removed(envelope.id)).await?;
                }
            }
            BatchKind::Expire => {
                for envelope in batch.envelopes {
                    let _ = self.backend.delete(envelope.id).await;
                    self.notify(EnvelopeNotice::Expired(envelope.id)).await?;
                    let diagnostic =
                        format!("message expired after {} seconds", envelope.ttl_secs);
                    self.maybe_bounce(&envelope, diagnostic, now).await;
                }
            }
            BatchKind::Bounce => {
                for envelope in batch.envelopes {
                    self.channels
                        .bounce
                        .send(envelope)
                        .await
                        .map_err(|_| SchedulerError::ChannelClosed("bounce"))?;
                }
            }
            BatchKind::Mda => {
                for envelope in batch.envelopes {
                    self.channels
                        .mda
                        .send(envelope)
                        .await
                        .map_err(|_| SchedulerError::ChannelClosed("mda"))?;
                }
            }
            BatchKind::Mta => {
                for envelope in batch.envelopes {
                    self.channels
                        .mta
                        .send(envelope)
                        .await
                        .map_err(|_| SchedulerError::ChannelClosed("mta"))?;
                }
            }
        }
        Ok(())
    }

    async fn handle_outcome(&mut self, event: OutcomeEvent) -> Result<(), SchedulerError> {
        let now = now_secs();
        match event.outcome {
            DeliveryOutcome::Ok => {
                debug!(envelope = %event.envelope, "delivered");
                let _ = self.backend.delete(event.envelope).await;
                self.notify(EnvelopeNotice::Delivered(event.envelope)).await?;
            }
            DeliveryOutcome::TempFail(diagnostic) => {
                match self.backend.update(event.envelope, now).await {
                    Ok(UpdateResult::Scheduled {
                        retry,
                        next_attempt,
                    }) => {
                        debug!(
                            envelope = %event.envelope,
                            retry,
                            next_attempt,
                            "tempfail, rescheduled: {diagnostic}"
                        );
                        self.notify(EnvelopeNotice::TempFailed(event.envelope, diagnostic))
                            .await?;
                    }
                    Ok(UpdateResult::Expired) => {
                        self.fail_terminally(
                            event.envelope,
                            format!("{diagnostic} (envelope expired)"),
                            now,
                        )
                        .await?;
                    }
                    Err(e) => {
                        error!(envelope = %event.envelope, "backend update failed: {e}");
                    }
                }
            }
            DeliveryOutcome::PermFail(diagnostic) => {
                self.fail_terminally(event.envelope, diagnostic, now).await?;
            }
        }
        Ok(())
    }

    /// Delete a terminally failed envelope, report it, and synthesize the
    /// notification when one is warranted.
    async fn fail_terminally(
        &mut self,
        id: EnvelopeId,
        diagnostic: String,
        now: u64,
    ) -> Result<(), SchedulerError> {
        let original = match self.backend.envelopes(id.message()).await {
            Ok(envelopes) => envelopes.into_iter().find(|evp| evp.id == id),
            Err(e) => {
                error!(envelope = %id, "backend enumeration failed: {e}");
                None
            }
        };

        let _ = self.backend.delete(id).await;
        self.notify(EnvelopeNotice::PermFailed(id, diagnostic.clone()))
            .await?;

        if let Some(envelope) = original {
            self.maybe_bounce(&envelope, diagnostic, now).await;
        }
        Ok(())
    }

    /// Synthesize a failure notification for `failed`, unless it is itself a
    /// notification or its sender is null.
    async fn maybe_bounce(&mut self, failed: &Envelope, diagnostic: String, now: u64) {
        if failed.kind() == DeliveryKind::Bounce || failed.sender.is_null() {
            return;
        }

        let message = failed.id.message();
        let sequence = match self.backend.envelopes(message).await {
            Ok(envelopes) => envelopes
                .iter()
                .map(|evp| evp.id.sequence())
                .chain(std::iter::once(failed.id.sequence()))
                .max()
                .unwrap_or(0)
                .wrapping_add(1),
            Err(e) => {
                warn!(message = %message, "cannot allocate notification envelope: {e}");
                return;
            }
        };

        let bounce = Envelope {
            id: EnvelopeId::new(message, sequence),
            sender: failed.sender.clone(),
            recipient: failed.recipient.clone(),
            dest: failed.dest.clone(),
            smtpname: failed.smtpname.clone(),
            delivery: Delivery::Bounce(BounceInfo {
                class: BounceClass::Failed,
                scope: self.config.bounce_scope,
                delay_secs: 0,
                ttl_secs: self.config.bounce_ttl_secs,
                diagnostic,
            }),
            retry: 0,
            creation: now,
            ttl_secs: self.config.bounce_ttl_secs,
            last_attempt: 0,
        };

        debug!(envelope = %bounce.id, "synthesizing failure notification");
        if let Err(e) = self.backend.insert(bounce).await {
            warn!(message = %message, "notification insert failed: {e}");
            return;
        }
        if let Err(e) = self.backend.commit(message).await {
            warn!(message = %message, "notification commit failed: {e}");
        }
        self.arm();
    }

    async fn notify(&self, notice: EnvelopeNotice) -> Result<(), SchedulerError> {
        debug!(envelope = %notice.envelope(), "reporting upstream");
        self.channels
            .upstream
            .send(notice)
            .await
            .map_err(|_| SchedulerError::ChannelClosed("upstream"))
    }

    /// Re-arm the zero-delay timer after a mutating event.
    fn arm(&mut self) {
        self.timer = Some(Duration::ZERO);
    }
}

async fn sleep_for(timer: Option<Duration>) {
    if let Some(delay) = timer {
        tokio::time::sleep(delay).await;
    }
}
