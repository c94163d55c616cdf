//! One local delivery attempt.
//!
//! A session owns one envelope, one message body handle and one helper
//! pipe. It scans the header block for a delivery loop before spawning
//! anything, prepends a `Delivered-To:` line while streaming, and turns
//! the helper's exit into a single outcome event.

use std::{sync::Arc, time::Duration};

use courier_common::{
    Delivery, DeliveryOutcome, Envelope, MessageStore, OutcomeEvent,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::{
    helper::{HelperExit, HelperSpawner},
    lookup::UserInfo,
};

pub(crate) async fn run(
    store: Arc<dyn MessageStore>,
    spawner: Arc<dyn HelperSpawner>,
    user: UserInfo,
    envelope: Envelope,
    timeout: Duration,
) -> OutcomeEvent {
    let id = envelope.id;
    let outcome = match tokio::time::timeout(timeout, attempt(store, spawner, user, envelope)).await
    {
        Ok(outcome) => outcome,
        Err(_) => DeliveryOutcome::TempFail("session timed out".to_string()),
    };
    debug!(envelope = %id, outcome = ?outcome, "session finished");
    OutcomeEvent { envelope: id, outcome }
}

async fn attempt(
    store: Arc<dyn MessageStore>,
    spawner: Arc<dyn HelperSpawner>,
    user: UserInfo,
    envelope: Envelope,
) -> DeliveryOutcome {
    let Delivery::Mda(info) = &envelope.delivery else {
        return DeliveryOutcome::PermFail("envelope is not a local delivery".to_string());
    };

    let body = match store.open_read(envelope.id.message()).await {
        Ok(body) => body,
        Err(e) => return DeliveryOutcome::TempFail(format!("message body unavailable: {e}")),
    };
    let mut reader = BufReader::new(body);

    let dest = envelope.dest.to_string();
    let (headers, saw_separator) = match scan_headers(&mut reader, &dest).await {
        Ok(Some(scan)) => scan,
        Ok(None) => {
            return DeliveryOutcome::PermFail(format!("delivery loop detected for {dest}"));
        }
        Err(e) => return DeliveryOutcome::TempFail(format!("message body read failed: {e}")),
    };

    let helper = match spawner.spawn(info, &user).await {
        Ok(helper) => helper,
        Err(e) => return DeliveryOutcome::TempFail(e.to_string()),
    };
    let mut input = helper.input;

    let streamed = stream_body(&mut reader, &mut input, &dest, &headers, saw_separator).await;
    // Close the pipe so the helper sees end of input.
    drop(input);

    match helper.exit.await {
        Ok(exit) if exit.success() && streamed.is_ok() => DeliveryOutcome::Ok,
        Ok(HelperExit { code, last_line }) => {
            let diagnostic = last_line.unwrap_or_else(|| match &streamed {
                Ok(()) => format!("helper exited with code {code}"),
                Err(e) => format!("helper pipe failed: {e}"),
            });
            DeliveryOutcome::TempFail(diagnostic)
        }
        Err(_) => DeliveryOutcome::TempFail(match &streamed {
            Ok(()) => "helper exit status lost".to_string(),
            Err(e) => format!("helper pipe failed: {e}"),
        }),
    }
}

/// Read the header block, watching for a `Delivered-To:` line naming `dest`.
///
/// Returns the raw header lines and whether the blank separator line was
/// seen, or `None` on a detected loop.
async fn scan_headers<R>(
    reader: &mut R,
    dest: &str,
) -> std::io::Result<Option<(Vec<Vec<u8>>, bool)>>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers: Vec<Vec<u8>> = Vec::new();
    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Ok(Some((headers, false)));
        }
        if line == b"\n" || line == b"\r\n" {
            return Ok(Some((headers, true)));
        }
        if is_delivery_loop(&line, dest) {
            return Ok(None);
        }
        headers.push(line);
    }
}

fn is_delivery_loop(line: &[u8], dest: &str) -> bool {
    const FIELD: &[u8] = b"delivered-to:";
    if line.len() < FIELD.len() || !line[..FIELD.len()].eq_ignore_ascii_case(FIELD) {
        return false;
    }
    let value: &[u8] = &line[FIELD.len()..];
    let value = value
        .strip_suffix(b"\n")
        .map(|v| v.strip_suffix(b"\r").unwrap_or(v))
        .unwrap_or(value);
    value.trim_ascii().eq_ignore_ascii_case(dest.as_bytes())
}

async fn stream_body<R, W>(
    reader: &mut R,
    writer: &mut W,
    dest: &str,
    headers: &[Vec<u8>],
    saw_separator: bool,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(format!("Delivered-To: {dest}\n").as_bytes())
        .await?;
    for line in headers {
        writer.write_all(line).await?;
    }
    if saw_separator {
        writer.write_all(b"\n").await?;
    }
    tokio::io::copy(reader, writer).await?;
    writer.shutdown().await?;
    Ok(())
}
