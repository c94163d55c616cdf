//! End-to-end scenarios across the three event loops.
#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::time::Duration;

use courier::common::{DeliveryKind, EnvelopeNotice, MessageId};
use support::Harness;

/// A committed local delivery produces exactly one helper session and a
/// delivered notice.
#[tokio::test]
async fn committed_envelope_is_delivered_once() {
    let mut harness = Harness::start(&["alice"]);
    let envelope = harness.local_envelope(1, 1, "alice", 86400);
    let id = envelope.id;

    harness.submit(envelope).await;

    assert_eq!(harness.next_notice().await, EnvelopeNotice::Delivered(id));
    assert_eq!(harness.spawner.spawned_users(), vec!["alice"]);

    let written = String::from_utf8(harness.spawner.written()).unwrap();
    assert!(written.starts_with("Delivered-To: alice@example.com\n"));
    assert!(written.contains("Subject: hello"));

    harness.core.shutdown();
}

/// A helper failure surfaces its captured diagnostic and bumps the retry
/// counter by exactly one.
#[tokio::test]
async fn helper_failure_reschedules_with_diagnostic() {
    let mut harness = Harness::start(&["alice"]);
    harness.spawner.set_exit(1, Some("mailbox full"));
    let envelope = harness.local_envelope(2, 1, "alice", 86400);
    let id = envelope.id;

    harness.submit(envelope).await;

    assert_eq!(
        harness.next_notice().await,
        EnvelopeNotice::TempFailed(id, "mailbox full".to_string())
    );

    let envelopes = harness
        .core
        .envelopes(MessageId::new(2))
        .await
        .expect("engine running");
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0].retry, 1);

    harness.core.shutdown();
}

/// An envelope that cannot be rescheduled inside its lifetime fails
/// permanently, and a notification goes back to the original sender.
#[tokio::test]
async fn exhausted_envelope_permfails_and_bounces() {
    let mut harness = Harness::start(&["alice"]);
    harness.spawner.set_exit(1, Some("mailbox full"));
    // Lifetime shorter than the first retry delay.
    let envelope = harness.local_envelope(3, 1, "alice", 100);
    let id = envelope.id;

    harness.submit(envelope).await;

    let notice = harness.next_notice().await;
    let EnvelopeNotice::PermFailed(failed, diagnostic) = notice else {
        panic!("expected a permanent failure, got {notice:?}");
    };
    assert_eq!(failed, id);
    assert!(diagnostic.contains("mailbox full"));

    // The synthesized notification is delivered through the transport.
    let notice = harness.next_notice().await;
    let EnvelopeNotice::Delivered(bounce_id) = notice else {
        panic!("expected the notification to be delivered, got {notice:?}");
    };
    assert_eq!(bounce_id.message(), id.message());
    assert_ne!(bounce_id, id);

    let payloads = harness.transport.payloads();
    assert_eq!(payloads.len(), 1);
    assert!(payloads[0].contains("alice@example.com: mailbox full"));
    assert!(payloads[0].contains("To: sender@example.org"));
    assert!(payloads[0].contains("Auto-Submitted: auto-replied"));

    // Nothing is left in the pool.
    assert!(
        harness
            .core
            .envelopes(MessageId::new(3))
            .await
            .expect("engine running")
            .is_empty()
    );

    harness.core.shutdown();
}

/// Pausing local delivery holds envelopes without dropping them; resuming
/// delivers as if nothing happened.
#[tokio::test]
async fn paused_local_delivery_resumes_cleanly() {
    let mut harness = Harness::start(&["alice"]);
    let events = harness.core.events();
    events
        .send(courier::scheduler::SchedulerEvent::PauseMda)
        .await
        .unwrap();

    let envelope = harness.local_envelope(4, 1, "alice", 86400);
    let id = envelope.id;
    harness.submit(envelope).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        harness.spawner.spawned_users().is_empty(),
        "paused dispatcher must not see work"
    );

    events
        .send(courier::scheduler::SchedulerEvent::ResumeMda)
        .await
        .unwrap();
    assert_eq!(harness.next_notice().await, EnvelopeNotice::Delivered(id));

    harness.core.shutdown();
}
