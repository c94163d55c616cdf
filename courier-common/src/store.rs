//! Contract for the queue/storage collaborator that holds message bodies.
//!
//! The delivery core never touches the on-disk format; it only asks for a
//! read handle on a body, given a message id. The real implementation lives
//! with the queue process, `MemoryStore` here backs the tests.

use std::{collections::HashMap, io::Cursor, sync::Arc, sync::Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::id::MessageId;

/// A readable message body.
pub type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

/// Storage failures, all temporary from the core's point of view: the
/// affected envelope is tempfailed and the engine keeps draining.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message {0} not found")]
    NotFound(MessageId),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Message-body storage, keyed by message id.
#[async_trait]
pub trait MessageStore: Send + Sync + std::fmt::Debug {
    /// Open the body of a committed message for reading.
    async fn open_read(&self, message: MessageId) -> Result<BodyReader, StoreError>;

    /// Open the body of a message for writing during acceptance.
    async fn open_write(&self, message: MessageId) -> Result<(), StoreError>;

    /// Append bytes to a body opened for writing.
    async fn append(&self, message: MessageId, data: &[u8]) -> Result<(), StoreError>;

    /// Make a written body visible to readers.
    async fn commit(&self, message: MessageId) -> Result<(), StoreError>;

    /// Delete one message body.
    async fn delete(&self, message: MessageId) -> Result<(), StoreError>;

    /// Drop everything, committed or not.
    async fn purge(&self) -> Result<(), StoreError>;
}

/// In-memory store used throughout the test suites.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    committed: HashMap<MessageId, Arc<[u8]>>,
    staged: HashMap<MessageId, Vec<u8>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a committed body directly.
    ///
    /// # Panics
    /// If the interior mutex is poisoned.
    pub fn insert(&self, message: MessageId, body: &[u8]) {
        self.inner
            .lock()
            .expect("MemoryStore mutex poisoned")
            .committed
            .insert(message, Arc::from(body));
    }

    /// Whether a committed body exists for `message`.
    ///
    /// # Panics
    /// If the interior mutex is poisoned.
    #[must_use]
    pub fn contains(&self, message: MessageId) -> bool {
        self.inner
            .lock()
            .expect("MemoryStore mutex poisoned")
            .committed
            .contains_key(&message)
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn open_read(&self, message: MessageId) -> Result<BodyReader, StoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let body = inner
            .committed
            .get(&message)
            .ok_or(StoreError::NotFound(message))?;
        Ok(Box::new(Cursor::new(body.to_vec())))
    }

    async fn open_write(&self, message: MessageId) -> Result<(), StoreError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        inner.staged.insert(message, Vec::new());
        Ok(())
    }

    async fn append(&self, message: MessageId, data: &[u8]) -> Result<(), StoreError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        inner
            .staged
            .get_mut(&message)
            .ok_or(StoreError::NotFound(message))?
            .extend_from_slice(data);
        Ok(())
    }

    async fn commit(&self, message: MessageId) -> Result<(), StoreError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let body = inner
            .staged
            .remove(&message)
            .ok_or(StoreError::NotFound(message))?;
        inner.committed.insert(message, Arc::from(body));
        Ok(())
    }

    async fn delete(&self, message: MessageId) -> Result<(), StoreError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        inner.committed.remove(&message);
        inner.staged.remove(&message);
        Ok(())
    }

    async fn purge(&self) -> Result<(), StoreError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        inner.committed.clear();
        inner.staged.clear();
        Ok(())
    }
}
