//! One outbound notification session.
//!
//! A session owns one SMTP client connection for one outbound identity and
//! repeatedly pulls eligible aggregates from the generator until none
//! remain. A rejected or failed group aborts that group only; the session
//! then advances to QUIT and later groups go out on a fresh session.

use std::sync::Arc;

use courier_common::{BodyReader, MessageStore, OutcomeEvent, ReportScope};
use tokio::{
    io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    sync::{mpsc, oneshot},
};
use tracing::debug;

use crate::{
    generator::{Aggregate, SessionEvent},
    report,
    response::Response,
    transport::OutboundTransport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Ehlo,
    MailFrom,
    RcptTo,
    Data,
    DataNotice,
    DataMessage,
    Quit,
    Close,
}

enum GroupOutcome {
    Delivered,
    /// The server refused the group; classified by the reply's leading digit.
    Rejected { transient: bool, diagnostic: String },
    /// The connection or the body store failed under the group.
    Failed(String),
}

pub(crate) async fn run(
    transport: Arc<dyn OutboundTransport>,
    store: Arc<dyn MessageStore>,
    smtpname: String,
    events: mpsc::Sender<SessionEvent>,
    outcomes: mpsc::Sender<OutcomeEvent>,
) {
    if let Err(diagnostic) = drive(&transport, &store, &smtpname, &events, &outcomes).await {
        debug!(identity = %smtpname, "notification session failed: {diagnostic}");
        let _ = events
            .send(SessionEvent::Failed {
                smtpname: smtpname.clone(),
                diagnostic,
            })
            .await;
    }
    let _ = events.send(SessionEvent::Ended { smtpname }).await;
}

/// Drive the session to completion.
///
/// An `Err` means the session died before any group was attempted (connect,
/// greeting or EHLO); the generator then flushes the identity's queue with
/// temporary failures. Per-group failures are handled inside the loop.
async fn drive(
    transport: &Arc<dyn OutboundTransport>,
    store: &Arc<dyn MessageStore>,
    smtpname: &str,
    events: &mpsc::Sender<SessionEvent>,
    outcomes: &mpsc::Sender<OutcomeEvent>,
) -> Result<(), String> {
    let connection = transport
        .connect(smtpname)
        .await
        .map_err(|e| e.to_string())?;
    let (read, mut writer) = tokio::io::split(connection);
    let mut reader = BufReader::new(read);

    let mut state = SessionState::Ehlo;
    debug!(identity = %smtpname, ?state, "session connected");

    let greeting = Response::read_from(&mut reader)
        .await
        .map_err(|e| e.to_string())?;
    if !greeting.is_positive() {
        return Err(greeting.diagnostic());
    }

    send_line(&mut writer, &format!("EHLO {smtpname}"))
        .await
        .map_err(|e| e.to_string())?;
    let reply = Response::read_from(&mut reader)
        .await
        .map_err(|e| e.to_string())?;
    if !reply.is_positive() {
        return Err(reply.diagnostic());
    }

    loop {
        let (tx, rx) = oneshot::channel();
        if events
            .send(SessionEvent::NextGroup(smtpname.to_string(), tx))
            .await
            .is_err()
        {
            break;
        }
        let Ok(Some(group)) = rx.await else {
            break;
        };

        state = SessionState::MailFrom;
        debug!(message = %group.message, ?state, "sending notification");
        match deliver_group(&mut reader, &mut writer, store, &group, &mut state).await {
            GroupOutcome::Delivered => {
                for recipient in &group.recipients {
                    let _ = outcomes.send(OutcomeEvent::ok(recipient.id)).await;
                }
            }
            GroupOutcome::Rejected {
                transient,
                diagnostic,
            } => {
                for recipient in &group.recipients {
                    let outcome = if transient {
                        OutcomeEvent::tempfail(recipient.id, diagnostic.clone())
                    } else {
                        OutcomeEvent::permfail(recipient.id, diagnostic.clone())
                    };
                    let _ = outcomes.send(outcome).await;
                }
                break;
            }
            GroupOutcome::Failed(diagnostic) => {
                for recipient in &group.recipients {
                    let _ = outcomes
                        .send(OutcomeEvent::tempfail(recipient.id, diagnostic.clone()))
                        .await;
                }
                break;
            }
        }
    }

    state = SessionState::Quit;
    debug!(identity = %smtpname, ?state, "session finishing");
    let _ = send_line(&mut writer, "QUIT").await;
    let _ = Response::read_from(&mut reader).await;
    state = SessionState::Close;
    debug!(identity = %smtpname, ?state, "session closed");
    Ok(())
}

async fn deliver_group<R, W>(
    reader: &mut R,
    writer: &mut W,
    store: &Arc<dyn MessageStore>,
    group: &Aggregate,
    state: &mut SessionState,
) -> GroupOutcome
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match exchange(reader, writer, "MAIL FROM:<>").await {
        Ok(None) => {}
        Ok(Some(rejected)) => return rejected,
        Err(e) => return GroupOutcome::Failed(e),
    }

    *state = SessionState::RcptTo;
    match exchange(reader, writer, &format!("RCPT TO:<{}>", group.sender)).await {
        Ok(None) => {}
        Ok(Some(rejected)) => return rejected,
        Err(e) => return GroupOutcome::Failed(e),
    }

    *state = SessionState::Data;
    match exchange(reader, writer, "DATA").await {
        Ok(None) => {}
        Ok(Some(rejected)) => return rejected,
        Err(e) => return GroupOutcome::Failed(e),
    }

    *state = SessionState::DataNotice;
    let reports: Vec<String> = group
        .recipients
        .iter()
        .map(|recipient| report::report_line(&recipient.dest, &recipient.diagnostic))
        .collect();
    let notice = report::notice(
        &group.smtpname,
        &group.sender,
        group.class,
        group.scope,
        &reports,
    );
    let mut payload = Vec::new();
    report::push_stuffed(&mut payload, notice.as_bytes());
    if let Err(e) = writer.write_all(&payload).await {
        return GroupOutcome::Failed(format!("connection failed: {e}"));
    }

    *state = SessionState::DataMessage;
    match store.open_read(group.message).await {
        Ok(body) => {
            if let Err(e) = copy_body(body, writer, group.scope).await {
                return GroupOutcome::Failed(format!("message copy failed: {e}"));
            }
        }
        Err(e) => {
            // The copy of the original is best effort; the notification
            // still goes out with its report lines when the body is gone.
            debug!(message = %group.message, "original body unavailable: {e}");
        }
    }

    if let Err(e) = end_data(writer).await {
        return GroupOutcome::Failed(format!("connection failed: {e}"));
    }
    match Response::read_from(reader).await {
        Ok(reply) if reply.is_positive() => GroupOutcome::Delivered,
        Ok(reply) => GroupOutcome::Rejected {
            transient: reply.is_transient(),
            diagnostic: reply.diagnostic(),
        },
        Err(e) => GroupOutcome::Failed(format!("connection failed: {e}")),
    }
}

/// Send one command and read its reply. `Ok(None)` means the reply was
/// positive; `Ok(Some(..))` carries the rejection.
async fn exchange<R, W>(
    reader: &mut R,
    writer: &mut W,
    command: &str,
) -> Result<Option<GroupOutcome>, String>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    send_line(writer, command)
        .await
        .map_err(|e| format!("connection failed: {e}"))?;
    let reply = Response::read_from(reader)
        .await
        .map_err(|e| format!("connection failed: {e}"))?;
    if reply.is_positive() {
        Ok(None)
    } else {
        Ok(Some(GroupOutcome::Rejected {
            transient: reply.is_transient(),
            diagnostic: reply.diagnostic(),
        }))
    }
}

/// Stream the original message onto the wire one line at a time, stuffed
/// and CRLF-normalized, never holding more than a line in memory. A
/// headers-only scope stops at the blank separator line.
async fn copy_body<W>(body: BodyReader, writer: &mut W, scope: ReportScope) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(body);
    let mut line = Vec::new();
    let mut stuffed = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(());
        }
        if scope == ReportScope::HeadersOnly && (line == b"\n" || line == b"\r\n") {
            return Ok(());
        }
        stuffed.clear();
        report::push_stuffed(&mut stuffed, &line);
        writer.write_all(&stuffed).await?;
    }
}

async fn send_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await
}

async fn end_data<W: AsyncWrite + Unpin>(writer: &mut W) -> std::io::Result<()> {
    writer.write_all(b".\r\n").await?;
    writer.flush().await
}
