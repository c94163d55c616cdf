//! Out-of-process backend shape: the contract carried over channels.
//!
//! `ProxyBackend` turns every operation into one request/reply exchange with
//! a worker task that owns the real backend. The worker is the only task
//! touching backend state, so a crashing or slow backend never blocks the
//! engine loop beyond the one outstanding exchange.

use std::sync::Arc;

use async_trait::async_trait;
use courier_common::{Envelope, EnvelopeId, MessageId, internal};
use tokio::sync::{mpsc, oneshot};

use crate::{
    backend::{BatchResult, SchedulerBackend, TypeMask, UpdateResult},
    error::BackendError,
};

type Reply<T> = oneshot::Sender<Result<T, BackendError>>;

/// One backend operation with its reply channel.
#[derive(Debug)]
enum Request {
    Insert(Envelope, Reply<()>),
    Commit(MessageId, Reply<()>),
    Rollback(MessageId, Reply<()>),
    Update(EnvelopeId, u64, Reply<UpdateResult>),
    Delete(EnvelopeId, Reply<bool>),
    Batch(TypeMask, usize, u64, Reply<BatchResult>),
    Messages(Reply<Vec<MessageId>>),
    Envelopes(MessageId, Reply<Vec<Envelope>>),
    Schedule(EnvelopeId, Reply<usize>),
    Remove(EnvelopeId, Reply<usize>),
    Suspend(EnvelopeId, Reply<usize>),
    Resume(EnvelopeId, Reply<usize>),
}

/// Backend stub that forwards the contract to a worker task.
#[derive(Debug, Clone)]
pub struct ProxyBackend {
    requests: mpsc::Sender<Request>,
}

/// Spawn a worker owning `inner` and return the stub talking to it.
#[must_use]
pub fn spawn_backend_worker(
    inner: Arc<dyn SchedulerBackend>,
) -> (ProxyBackend, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Request>(64);
    let handle = tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            dispatch(&*inner, request).await;
        }
        internal!(level = DEBUG, "backend worker draining done, exiting");
    });
    (ProxyBackend { requests: tx }, handle)
}

async fn dispatch(inner: &dyn SchedulerBackend, request: Request) {
    // A dropped reply receiver means the caller gave up; nothing to do.
    match request {
        Request::Insert(envelope, reply) => {
            let _ = reply.send(inner.insert(envelope).await);
        }
        Request::Commit(message, reply) => {
            let _ = reply.send(inner.commit(message).await);
        }
        Request::Rollback(message, reply) => {
            let _ = reply.send(inner.rollback(message).await);
        }
        Request::Update(envelope, now, reply) => {
            let _ = reply.send(inner.update(envelope, now).await);
        }
        Request::Delete(envelope, reply) => {
            let _ = reply.send(inner.delete(envelope).await);
        }
        Request::Batch(mask, hint, now, reply) => {
            let _ = reply.send(inner.batch(mask, hint, now).await);
        }
        Request::Messages(reply) => {
            let _ = reply.send(inner.messages().await);
        }
        Request::Envelopes(message, reply) => {
            let _ = reply.send(inner.envelopes(message).await);
        }
        Request::Schedule(id, reply) => {
            let _ = reply.send(inner.schedule(id).await);
        }
        Request::Remove(id, reply) => {
            let _ = reply.send(inner.remove(id).await);
        }
        Request::Suspend(id, reply) => {
            let _ = reply.send(inner.suspend(id).await);
        }
        Request::Resume(id, reply) => {
            let _ = reply.send(inner.resume(id).await);
        }
    }
}

impl ProxyBackend {
    async fn exchange<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Request,
    ) -> Result<T, BackendError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(build(tx))
            .await
            .map_err(|_| BackendError::Unavailable("backend worker gone".to_string()))?;
        rx.await
            .map_err(|_| BackendError::Unavailable("backend worker dropped reply".to_string()))?
    }
}

#[async_trait]
impl SchedulerBackend for ProxyBackend {
    async fn insert(&self, envelope: Envelope) -> Result<(), BackendError> {
        self.exchange(|reply| Request::Insert(envelope, reply)).await
    }

    async fn commit(&self, message: MessageId) -> Result<(), BackendError> {
        self.exchange(|reply| Request::Commit(message, reply)).await
    }

    async fn rollback(&self, message: MessageId) -> Result<(), BackendError> {
        self.exchange(|reply| Request::Rollback(message, reply)).await
    }

    async fn update(&self, envelope: EnvelopeId, now: u64) -> Result<UpdateResult, BackendError> {
        self.exchange(|reply| Request::Update(envelope, now, reply))
            .await
    }

    async fn delete(&self, envelope: EnvelopeId) -> Result<bool, BackendError> {
        self.exchange(|reply| Request::Delete(envelope, reply)).await
    }

    async fn batch(
        &self,
        mask: TypeMask,
        hint: usize,
        now: u64,
    ) -> Result<BatchResult, BackendError> {
        self.exchange(|reply| Request::Batch(mask, hint, now, reply))
            .await
    }

    async fn messages(&self) -> Result<Vec<MessageId>, BackendError> {
        self.exchange(Request::Messages).await
    }

    async fn envelopes(&self, message: MessageId) -> Result<Vec<Envelope>, BackendError> {
        self.exchange(|reply| Request::Envelopes(message, reply))
            .await
    }

    async fn schedule(&self, id: EnvelopeId) -> Result<usize, BackendError> {
        self.exchange(|reply| Request::Schedule(id, reply)).await
    }

    async fn remove(&self, id: EnvelopeId) -> Result<usize, BackendError> {
        self.exchange(|reply| Request::Remove(id, reply)).await
    }

    async fn suspend(&self, id: EnvelopeId) -> Result<usize, BackendError> {
        self.exchange(|reply| Request::Suspend(id, reply)).await
    }

    async fn resume(&self, id: EnvelopeId) -> Result<usize, BackendError> {
        self.exchange(|reply| Request::Resume(id, reply)).await
    }
}
