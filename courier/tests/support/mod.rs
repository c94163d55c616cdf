//! Shared harness for the end-to-end scenarios: a running core wired to
//! in-memory collaborators that record everything they are asked to do.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use courier::{
    Collaborators, Core, CourierConfig,
    bounce::{Connection, OutboundTransport, TransportError},
    common::{
        Address, Delivery, Envelope, EnvelopeId, EnvelopeNotice, MdaInfo, MdaMethod, MemoryStore,
        MessageId,
    },
    mda::{HelperExit, HelperHandle, HelperSpawner, SpawnError, StaticLookup, UserInfo},
    scheduler::{BackoffPolicy, now_secs},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::{mpsc, oneshot},
    time::{Duration, timeout},
};

/// Spawner whose helpers record their caller and input, then exit with a
/// configurable status.
#[derive(Debug, Default)]
pub struct RecordingSpawner {
    exit: Mutex<HelperExit>,
    users: Mutex<Vec<String>>,
    written: Arc<Mutex<Vec<u8>>>,
}

impl RecordingSpawner {
    pub fn set_exit(&self, code: i32, last_line: Option<&str>) {
        *self.exit.lock().unwrap() = HelperExit {
            code,
            last_line: last_line.map(str::to_string),
        };
    }

    pub fn spawned_users(&self) -> Vec<String> {
        self.users.lock().unwrap().clone()
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }
}

struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl tokio::io::AsyncWrite for SharedWriter {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        std::task::Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl HelperSpawner for RecordingSpawner {
    async fn spawn(
        &self,
        delivery: &MdaInfo,
        _user: &UserInfo,
    ) -> Result<HelperHandle, SpawnError> {
        self.users.lock().unwrap().push(delivery.username.clone());
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(self.exit.lock().unwrap().clone());
        Ok(HelperHandle {
            input: Box::new(SharedWriter(self.written.clone())),
            exit: rx,
        })
    }
}

/// Transport granting sessions to an accept-all SMTP server that records
/// commands and DATA payloads.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    commands: Arc<Mutex<Vec<String>>>,
    payloads: Arc<Mutex<Vec<String>>>,
}

impl RecordingTransport {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn payloads(&self) -> Vec<String> {
        self.payloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl OutboundTransport for RecordingTransport {
    async fn connect(&self, _smtpname: &str) -> Result<Connection, TransportError> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let commands = Arc::clone(&self.commands);
        let payloads = Arc::clone(&self.payloads);
        tokio::spawn(async move {
            let _ = serve(server, &commands, &payloads).await;
        });
        Ok(Box::new(client))
    }
}

async fn serve(
    stream: tokio::io::DuplexStream,
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
        let verb = line
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_uppercase();
        commands.lock().unwrap().push(verb.clone());

        match verb.as_str() {
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
                write.write_all(b"250 2.0.0 accepted\r\n").await?;
            }
            "QUIT" => {
                write.write_all(b"221 bye\r\n").await?;
                return Ok(());
            }
            _ => write.write_all(b"250 ok\r\n").await?,
        }
    }
}

pub struct Harness {
    pub core: Core,
    pub store: MemoryStore,
    pub spawner: Arc<RecordingSpawner>,
    pub transport: Arc<RecordingTransport>,
}

impl Harness {
    /// A running core with deterministic backoff and the given local users.
    pub fn start(users: &[&str]) -> Self {
        let store = MemoryStore::new();
        let spawner = Arc::new(RecordingSpawner::default());
        let transport = Arc::new(RecordingTransport::default());
        let lookup = StaticLookup::new(users.iter().map(|name| UserInfo {
            uid: 1000,
            gid: 1000,
            username: (*name).to_string(),
            directory: format!("/home/{name}"),
        }));

        let config = CourierConfig {
            backoff: BackoffPolicy {
                base_delay_secs: 400,
                max_delay_secs: 14400,
                jitter_factor: 0.0,
            },
            ..CourierConfig::default()
        };
        let core = Core::spawn(
            config,
            Collaborators {
                backend: None,
                store: Arc::new(store.clone()),
                lookup: Arc::new(lookup),
                spawner: spawner.clone(),
                transport: transport.clone(),
            },
        );

        Self {
            core,
            store,
            spawner,
            transport,
        }
    }

    /// One local-delivery envelope, with its body already in the store.
    pub fn local_envelope(&self, msg: u32, seq: u32, user: &str, ttl_secs: u64) -> Envelope {
        self.store.insert(
            MessageId::new(msg),
            b"From: sender@example.org\nSubject: hello\n\nbody\n",
        );
        Envelope {
            id: EnvelopeId::new(MessageId::new(msg), seq),
            sender: Address::parse("sender@example.org").unwrap(),
            recipient: Address::parse(&format!("{user}@example.com")).unwrap(),
            dest: Address::parse(&format!("{user}@example.com")).unwrap(),
            smtpname: "smtp-in".to_string(),
            delivery: Delivery::Mda(MdaInfo {
                method: MdaMethod::Maildir,
                buffer: "~/Maildir".to_string(),
                username: user.to_string(),
                usertable: "users".to_string(),
            }),
            retry: 0,
            creation: now_secs(),
            ttl_secs,
            last_attempt: 0,
        }
    }

    pub async fn submit(&self, envelope: Envelope) {
        let message = envelope.id.message();
        self.core.insert(envelope).await.expect("engine running");
        self.core.commit(message).await.expect("engine running");
    }

    pub async fn next_notice(&mut self) -> EnvelopeNotice {
        recv(&mut self.core.notices).await
    }
}

pub async fn recv<T>(receiver: &mut mpsc::Receiver<T>) -> T {
    timeout(Duration::from_secs(5), receiver.recv())
        .await
        .expect("timed out waiting on channel")
        .expect("channel closed")
}
