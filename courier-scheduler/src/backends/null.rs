//! A backend that accepts everything and schedules nothing.
//!
//! Useful when the daemon should keep accepting mail while delivery is
//! handled elsewhere, and as the do-nothing end of the proxy worker tests.

use async_trait::async_trait;
use courier_common::{Envelope, EnvelopeId, MessageId};

use crate::{
    backend::{BatchResult, SchedulerBackend, TypeMask, UpdateResult},
    error::BackendError,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct NullBackend;

#[async_trait]
impl SchedulerBackend for NullBackend {
    async fn insert(&self, _envelope: Envelope) -> Result<(), BackendError> {
        Ok(())
    }

    async fn commit(&self, _message: MessageId) -> Result<(), BackendError> {
        Ok(())
    }

    async fn rollback(&self, _message: MessageId) -> Result<(), BackendError> {
        Ok(())
    }

    async fn update(&self, _envelope: EnvelopeId, _now: u64) -> Result<UpdateResult, BackendError> {
        Ok(UpdateResult::Expired)
    }

    async fn delete(&self, _envelope: EnvelopeId) -> Result<bool, BackendError> {
        Ok(false)
    }

    async fn batch(
        &self,
        _mask: TypeMask,
        _hint: usize,
        _now: u64,
    ) -> Result<BatchResult, BackendError> {
        Ok(BatchResult::None)
    }

    async fn messages(&self) -> Result<Vec<MessageId>, BackendError> {
        Ok(Vec::new())
    }

    async fn envelopes(&self, _message: MessageId) -> Result<Vec<Envelope>, BackendError> {
        Ok(Vec::new())
    }

    async fn schedule(&self, _id: EnvelopeId) -> Result<usize, BackendError> {
        Ok(0)
    }

    async fn remove(&self, _id: EnvelopeId) -> Result<usize, BackendError> {
        Ok(0)
    }

    async fn suspend(&self, _id: EnvelopeId) -> Result<usize, BackendError> {
        Ok(0)
    }

    async fn resume(&self, _id: EnvelopeId) -> Result<usize, BackendError> {
        Ok(0)
    }
}
