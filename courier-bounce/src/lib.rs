//! Failure notification generation: aggregation, report composition and the
//! outbound SMTP client session.
//!
//! Bounce envelopes arrive from the scheduler, coalesce into per-message
//! aggregates, and go out as a single notification per aggregate through a
//! connection obtained from [`transport::OutboundTransport`]. Every bounce
//! envelope gets exactly one outcome event back.

pub mod config;
pub mod error;
pub mod generator;
pub mod report;
pub mod response;
mod session;
pub mod transport;

pub use config::BounceConfig;
pub use error::{BounceError, TransportError};
pub use generator::BounceGenerator;
pub use response::Response;
pub use transport::{Connection, OutboundTransport, SmtpStream};
