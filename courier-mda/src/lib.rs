//! Local delivery dispatching: per-user queues drained round-robin into
//! bounded helper-process sessions.
//!
//! The dispatcher consumes local-delivery envelopes from the scheduler,
//! resolves the acting identity through [`lookup::UserLookup`], runs one
//! delivery session per in-flight envelope against a helper obtained from
//! [`helper::HelperSpawner`], and reports every outcome back upstream.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod helper;
pub mod lookup;
mod session;

pub use config::MdaLimits;
pub use dispatcher::MdaDispatcher;
pub use error::{LookupError, MdaError, SpawnError};
pub use helper::{HelperExit, HelperHandle, HelperSpawner};
pub use lookup::{StaticLookup, UserInfo, UserLookup};
