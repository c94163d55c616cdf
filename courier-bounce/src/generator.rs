//! The notification generator loop.
//!
//! Bounce envelopes are aggregated by (message, identity, descriptor); an
//! aggregate becomes eligible once the coalescing window after its first
//! member has elapsed, so near-simultaneous per-recipient failures of one
//! message produce a single notification. Eligible aggregates queue FIFO
//! per identity and are drained by on-demand SMTP client sessions.

use std::{collections::VecDeque, sync::Arc};

use ahash::{AHashMap, AHashSet};
use courier_common::{
    Address, BounceClass, Delivery, Envelope, EnvelopeId, MessageId, MessageStore, OutcomeEvent,
    ReportScope, Signal, internal,
};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    time::Instant,
};
use tracing::{debug, error, warn};

use crate::{
    config::BounceConfig, error::BounceError, session, transport::OutboundTransport,
};

/// Everything but the diagnostic: envelopes sharing a descriptor coalesce.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AggregateKey {
    message: MessageId,
    smtpname: String,
    class: BounceClass,
    scope: ReportScope,
    delay_secs: u64,
    ttl_secs: u64,
}

/// One failed recipient inside an aggregate.
#[derive(Debug, Clone)]
pub(crate) struct Recipient {
    pub id: EnvelopeId,
    pub dest: Address,
    pub diagnostic: String,
}

/// One notification in the making.
#[derive(Debug)]
pub(crate) struct Aggregate {
    pub message: MessageId,
    pub smtpname: String,
    pub sender: Address,
    pub class: BounceClass,
    pub scope: ReportScope,
    pub recipients: Vec<Recipient>,
    deadline: Instant,
}

/// Traffic from sessions back into the loop.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// Pull the next eligible aggregate for an identity; `None` tells the
    /// session to quit.
    NextGroup(String, oneshot::Sender<Option<Aggregate>>),
    /// The session died before attempting any group.
    Failed { smtpname: String, diagnostic: String },
    Ended { smtpname: String },
}

/// The generator context, owned by the one task running the loop.
#[derive(Debug)]
pub struct BounceGenerator {
    config: BounceConfig,
    store: Arc<dyn MessageStore>,
    transport: Arc<dyn OutboundTransport>,
    outcomes: mpsc::Sender<OutcomeEvent>,
    pending: AHashMap<AggregateKey, Aggregate>,
    eligible: AHashMap<String, VecDeque<Aggregate>>,
    sessions: AHashSet<String>,
    running: usize,
}

impl BounceGenerator {
    #[must_use]
    pub fn new(
        config: BounceConfig,
        store: Arc<dyn MessageStore>,
        transport: Arc<dyn OutboundTransport>,
        outcomes: mpsc::Sender<OutcomeEvent>,
    ) -> Self {
        Self {
            config,
            store,
            transport,
            outcomes,
            pending: AHashMap::new(),
            eligible: AHashMap::new(),
            sessions: AHashSet::new(),
            running: 0,
        }
    }

    /// Run until the envelope channel closes or a shutdown signal arrives.
    ///
    /// # Errors
    /// When the outcome channel closes underneath the generator.
    pub async fn run(
        mut self,
        mut envelopes: mpsc::Receiver<Envelope>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), BounceError> {
        internal!(level = INFO, "bounce generator starting");
        let (event_tx, mut event_rx) = mpsc::channel::<SessionEvent>(256);

        loop {
            let deadline = self.pending.values().map(|aggregate| aggregate.deadline).min();
            tokio::select! {
                envelope = envelopes.recv() => {
                    match envelope {
                        Some(envelope) => self.handle_envelope(envelope).await?,
                        None => break,
                    }
                }
                event = event_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_session_event(&event_tx, event).await?;
                    }
                }
                () = sleep_until(deadline), if deadline.is_some() => {
                    self.promote_due(&event_tx);
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!(level = INFO, "bounce generator received shutdown signal");
                        }
                        Err(e) => {
                            error!("bounce shutdown channel error: {e}");
                        }
                    }
                    break;
                }
            }
        }

        internal!(level = INFO, "bounce generator stopped");
        Ok(())
    }

    async fn handle_envelope(&mut self, envelope: Envelope) -> Result<(), BounceError> {
        let Delivery::Bounce(info) = &envelope.delivery else {
            return self
                .send_outcome(OutcomeEvent::permfail(
                    envelope.id,
                    "envelope is not a notification".to_string(),
                ))
                .await;
        };

        let key = AggregateKey {
            message: envelope.id.message(),
            smtpname: envelope.smtpname.clone(),
            class: info.class,
            scope: info.scope,
            delay_secs: info.delay_secs,
            ttl_secs: info.ttl_secs,
        };
        let recipient = Recipient {
            id: envelope.id,
            dest: envelope.dest.clone(),
            diagnostic: info.diagnostic.clone(),
        };

        let coalesce = tokio::time::Duration::from_secs(self.config.coalesce_secs);
        let aggregate = self.pending.entry(key).or_insert_with(|| {
            debug!(message = %envelope.id.message(), identity = %envelope.smtpname, "new aggregate");
            Aggregate {
                message: envelope.id.message(),
                smtpname: envelope.smtpname.clone(),
                sender: envelope.sender.clone(),
                class: info.class,
                scope: info.scope,
                recipients: Vec::new(),
                deadline: Instant::now() + coalesce,
            }
        });
        aggregate.recipients.push(recipient);
        Ok(())
    }

    async fn handle_session_event(
        &mut self,
        events: &mpsc::Sender<SessionEvent>,
        event: SessionEvent,
    ) -> Result<(), BounceError> {
        match event {
            SessionEvent::NextGroup(smtpname, reply) => {
                let next = self
                    .eligible
                    .get_mut(&smtpname)
                    .and_then(VecDeque::pop_front);
                if self
                    .eligible
                    .get(&smtpname)
                    .is_some_and(VecDeque::is_empty)
                {
                    self.eligible.remove(&smtpname);
                }
                let _ = reply.send(next);
            }
            SessionEvent::Failed {
                smtpname,
                diagnostic,
            } => {
                warn!(identity = %smtpname, "flushing queued notifications: {diagnostic}");
                if let Some(queue) = self.eligible.remove(&smtpname) {
                    for aggregate in queue {
                        for recipient in aggregate.recipients {
                            self.send_outcome(OutcomeEvent::tempfail(
                                recipient.id,
                                diagnostic.clone(),
                            ))
                            .await?;
                        }
                    }
                }
            }
            SessionEvent::Ended { smtpname } => {
                self.sessions.remove(&smtpname);
                self.running -= 1;
                self.start_sessions(events);
            }
        }
        Ok(())
    }

    /// Move aggregates past their coalescing deadline onto the per-identity
    /// FIFO and start sessions for them.
    fn promote_due(&mut self, events: &mpsc::Sender<SessionEvent>) {
        let now = Instant::now();
        let due: Vec<AggregateKey> = self
            .pending
            .iter()
            .filter(|(_, aggregate)| aggregate.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in due {
            if let Some(aggregate) = self.pending.remove(&key) {
                debug!(
                    message = %aggregate.message,
                    identity = %aggregate.smtpname,
                    recipients = aggregate.recipients.len(),
                    "aggregate eligible"
                );
                self.eligible
                    .entry(aggregate.smtpname.clone())
                    .or_default()
                    .push_back(aggregate);
            }
        }

        self.start_sessions(events);
    }

    /// Start one session per identity with eligible work, up to the global
    /// session ceiling.
    fn start_sessions(&mut self, events: &mpsc::Sender<SessionEvent>) {
        let identities: Vec<String> = self
            .eligible
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(identity, _)| identity.clone())
            .collect();

        for identity in identities {
            if self.running >= self.config.max_sessions {
                break;
            }
            if !self.sessions.insert(identity.clone()) {
                continue;
            }
            self.running += 1;
            debug!(identity = %identity, "starting notification session");
            tokio::spawn(session::run(
                Arc::clone(&self.transport),
                Arc::clone(&self.store),
                identity,
                events.clone(),
                self.outcomes.clone(),
            ));
        }
    }

    async fn send_outcome(&self, outcome: OutcomeEvent) -> Result<(), BounceError> {
        self.outcomes
            .send(outcome)
            .await
            .map_err(|_| BounceError::ChannelClosed("outcome"))
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(deadline).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::{
        sync::Mutex,
        time::Duration,
    };

    use async_trait::async_trait;
    use courier_common::{BounceInfo, DeliveryOutcome, MemoryStore};
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        time::timeout,
    };

    use super::*;
    use crate::{
        error::TransportError,
        transport::Connection,
    };

    /// What the scripted server answers at each step.
    #[derive(Debug, Clone)]
    struct Script {
        rcpt_reply: &'static str,
        data_end_reply: &'static str,
    }

    impl Default for Script {
        fn default() -> Self {
            Self {
                rcpt_reply: "250 ok",
                data_end_reply: "250 2.0.0 accepted",
            }
        }
    }

    /// Transport granting duplex streams to a scripted SMTP server that
    /// records every command and DATA payload.
    #[derive(Debug)]
    struct ScriptTransport {
        script: Script,
        commands: Arc<Mutex<Vec<String>>>,
        payloads: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptTransport {
        fn with_script(script: Script) -> Self {
            Self {
                script,
                commands: Arc::default(),
                payloads: Arc::default(),
            }
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }

        fn payloads(&self) -> Vec<String> {
            self.payloads.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OutboundTransport for ScriptTransport {
        async fn connect(&self, _smtpname: &str) -> Result<Connection, TransportError> {
            let (client, server) = tokio::io::duplex(64 * 1024);
            let script = self.script.clone();
            let commands = Arc::clone(&self.commands);
            let payloads = Arc::clone(&self.payloads);
            tokio::spawn(async move {
                let _ = serve_script(server, &script, &commands, &payloads).await;
            });
            Ok(Box::new(client))
        }
    }

    async fn serve_script(
        stream: tokio::io::DuplexStream,
        script: &Script,
        commands: &Arc<Mutex<Vec<String>>>,
        payloads: &Arc<Mutex<Vec<String>>>,
    ) -> std::io::Result<()> {
        let (read, mut write) = tokio::io::split(stream);
        let mut reader = BufReader::new(read);
        write.write_all(b"220 test server ready\r\n").await?;

        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            let command = line.trim_end().to_string();
            let verb = command
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_uppercase();
            commands.lock().unwrap().push(verb.clone());

            match verb.as_str() {
                "EHLO" | "MAIL" => write.write_all(b"250 ok\r\n").await?,
                "RCPT" => {
                    write
                        .write_all(format!("{}\r\n", script.rcpt_reply).as_bytes())
                        .await?;
                }
                "DATA" => {
                    write.write_all(b"354 go ahead\r\n").await?;
                    let mut payload = String::new();
                    loop {
                        let mut data_line = String::new();
                        if reader.read_line(&mut data_line).await? == 0 {
                            return Ok(());
                        }
                        if data_line == ".\r\n" {
                            break;
                        }
                        payload.push_str(&data_line);
                    }
                    payloads.lock().unwrap().push(payload);
                    write
                        .write_all(format!("{}\r\n", script.data_end_reply).as_bytes())
                        .await?;
                }
                "QUIT" => {
                    write.write_all(b"221 bye\r\n").await?;
                    return Ok(());
                }
                _ => write.write_all(b"500 unknown\r\n").await?,
            }
        }
    }

    #[derive(Debug)]
    struct DownTransport;

    #[async_trait]
    impl OutboundTransport for DownTransport {
        async fn connect(&self, _smtpname: &str) -> Result<Connection, TransportError> {
            Err(TransportError("relay socket pool exhausted".to_string()))
        }
    }

    fn bounce_envelope(msg: u32, seq: u32, dest: &str, diagnostic: &str) -> Envelope {
        Envelope {
            id: EnvelopeId::new(MessageId::new(msg), seq),
            sender: Address::parse("sender@example.org").unwrap(),
            recipient: Address::parse(dest).unwrap(),
            dest: Address::parse(dest).unwrap(),
            smtpname: "smtp-in".to_string(),
            delivery: Delivery::Bounce(BounceInfo {
                class: BounceClass::Failed,
                scope: ReportScope::HeadersOnly,
                delay_secs: 0,
                ttl_secs: 14400,
                diagnostic: diagnostic.to_string(),
            }),
            retry: 0,
            creation: 0,
            ttl_secs: 14400,
            last_attempt: 0,
        }
    }

    struct Harness {
        envelopes: mpsc::Sender<Envelope>,
        outcomes: mpsc::Receiver<OutcomeEvent>,
        shutdown: broadcast::Sender<Signal>,
    }

    fn spawn_generator(transport: Arc<dyn OutboundTransport>, store: MemoryStore) -> Harness {
        let (envelope_tx, envelope_rx) = mpsc::channel(64);
        let (outcome_tx, outcome_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let generator = BounceGenerator::new(
            BounceConfig::default(),
            Arc::new(store),
            transport,
            outcome_tx,
        );
        tokio::spawn(generator.run(envelope_rx, shutdown_rx));

        Harness {
            envelopes: envelope_tx,
            outcomes: outcome_rx,
            shutdown: shutdown_tx,
        }
    }

    async fn next_outcome(harness: &mut Harness) -> OutcomeEvent {
        timeout(Duration::from_secs(5), harness.outcomes.recv())
            .await
            .expect("outcome timed out")
            .expect("channel open")
    }

    #[tokio::test]
    async fn coalesced_failures_produce_one_notification() {
        let store = MemoryStore::new();
        store.insert(MessageId::new(1), b"Subject: original\r\n\r\nsecret\r\n");
        let transport = Arc::new(ScriptTransport::with_script(Script::default()));
        let mut harness = spawn_generator(transport.clone(), store);

        harness
            .envelopes
            .send(bounce_envelope(1, 1, "alice@example.com", "550 no such user"))
            .await
            .unwrap();
        harness
            .envelopes
            .send(bounce_envelope(1, 2, "bob@example.com", "550 mailbox disabled"))
            .await
            .unwrap();

        // One outcome per original recipient.
        for _ in 0..2 {
            let outcome = next_outcome(&mut harness).await;
            assert!(outcome.outcome.is_ok());
        }

        assert_eq!(
            transport.commands(),
            vec!["EHLO", "MAIL", "RCPT", "DATA", "QUIT"],
            "two coalesced failures go out as one message"
        );
        let payloads = transport.payloads();
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].contains("alice@example.com: 550 no such user"));
        assert!(payloads[0].contains("bob@example.com: 550 mailbox disabled"));
        assert!(payloads[0].contains("Subject: Delivery failure notification"));
        assert!(payloads[0].contains("Auto-Submitted: auto-replied"));
        // Headers-only scope: the original body stays out.
        assert!(payloads[0].contains("Subject: original"));
        assert!(!payloads[0].contains("secret"));

        let _ = harness.shutdown.send(Signal::Shutdown);
    }

    #[tokio::test]
    async fn full_scope_copies_the_original_body() {
        let store = MemoryStore::new();
        store.insert(
            MessageId::new(1),
            b"Subject: original\r\n\r\n.hidden\r\nsecret\r\n",
        );
        let transport = Arc::new(ScriptTransport::with_script(Script::default()));
        let mut harness = spawn_generator(transport.clone(), store);

        let mut envelope = bounce_envelope(1, 1, "alice@example.com", "550 gone");
        if let Delivery::Bounce(info) = &mut envelope.delivery {
            info.scope = ReportScope::FullMessage;
        }
        harness.envelopes.send(envelope).await.unwrap();

        let outcome = next_outcome(&mut harness).await;
        assert!(outcome.outcome.is_ok());

        let payloads = transport.payloads();
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].contains("Subject: original"));
        assert!(payloads[0].contains("secret"));
        // Stuffed on the wire.
        assert!(payloads[0].contains("..hidden"));

        let _ = harness.shutdown.send(Signal::Shutdown);
    }

    #[tokio::test]
    async fn one_session_drains_groups_for_its_identity() {
        let store = MemoryStore::new();
        store.insert(MessageId::new(1), b"Subject: one\r\n\r\n");
        store.insert(MessageId::new(2), b"Subject: two\r\n\r\n");
        let transport = Arc::new(ScriptTransport::with_script(Script::default()));
        let mut harness = spawn_generator(transport.clone(), store);

        harness
            .envelopes
            .send(bounce_envelope(1, 1, "alice@example.com", "550 gone"))
            .await
            .unwrap();
        harness
            .envelopes
            .send(bounce_envelope(2, 1, "bob@example.com", "550 gone"))
            .await
            .unwrap();

        for _ in 0..2 {
            let outcome = next_outcome(&mut harness).await;
            assert!(outcome.outcome.is_ok());
        }

        assert_eq!(
            transport.commands(),
            vec!["EHLO", "MAIL", "RCPT", "DATA", "MAIL", "RCPT", "DATA", "QUIT"],
            "the session loops back to MAIL for the next group"
        );

        let _ = harness.shutdown.send(Signal::Shutdown);
    }

    #[tokio::test]
    async fn rejected_recipient_permfails_the_group_only() {
        let store = MemoryStore::new();
        store.insert(MessageId::new(1), b"Subject: one\r\n\r\n");
        let transport = Arc::new(ScriptTransport::with_script(Script {
            rcpt_reply: "550 refused",
            ..Script::default()
        }));
        let mut harness = spawn_generator(transport.clone(), store);

        harness
            .envelopes
            .send(bounce_envelope(1, 1, "alice@example.com", "550 gone"))
            .await
            .unwrap();

        let outcome = next_outcome(&mut harness).await;
        assert!(matches!(outcome.outcome, DeliveryOutcome::PermFail(_)));
        assert_eq!(outcome.envelope, EnvelopeId::new(MessageId::new(1), 1));

        let _ = harness.shutdown.send(Signal::Shutdown);
    }

    #[tokio::test]
    async fn transient_rejection_tempfails_the_group() {
        let store = MemoryStore::new();
        store.insert(MessageId::new(1), b"Subject: one\r\n\r\n");
        let transport = Arc::new(ScriptTransport::with_script(Script {
            data_end_reply: "421 try again later",
            ..Script::default()
        }));
        let mut harness = spawn_generator(transport.clone(), store);

        harness
            .envelopes
            .send(bounce_envelope(1, 1, "alice@example.com", "550 gone"))
            .await
            .unwrap();

        let outcome = next_outcome(&mut harness).await;
        assert!(matches!(outcome.outcome, DeliveryOutcome::TempFail(_)));

        let _ = harness.shutdown.send(Signal::Shutdown);
    }

    #[tokio::test]
    async fn unavailable_transport_tempfails_queued_groups() {
        let store = MemoryStore::new();
        store.insert(MessageId::new(1), b"Subject: one\r\n\r\n");
        let mut harness = spawn_generator(Arc::new(DownTransport), store);

        harness
            .envelopes
            .send(bounce_envelope(1, 1, "alice@example.com", "550 gone"))
            .await
            .unwrap();

        let outcome = next_outcome(&mut harness).await;
        assert!(matches!(outcome.outcome, DeliveryOutcome::TempFail(_)));

        let _ = harness.shutdown.send(Signal::Shutdown);
    }
}
