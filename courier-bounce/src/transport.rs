//! Outbound transport contract.
//!
//! The generator never opens sockets itself; it asks the embedder for a
//! connected SMTP client stream for a given outbound identity.

use std::fmt::Debug;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::TransportError;

/// A bidirectional SMTP client stream.
pub trait SmtpStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SmtpStream for T {}

pub type Connection = Box<dyn SmtpStream>;

/// Grants connected SMTP client sessions, one per call.
#[async_trait]
pub trait OutboundTransport: Send + Sync + Debug {
    /// Obtain one connected stream for the outbound identity `smtpname`.
    async fn connect(&self, smtpname: &str) -> Result<Connection, TransportError>;
}
