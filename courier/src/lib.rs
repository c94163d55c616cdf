//! The reliable-delivery core of a mail transfer daemon.
//!
//! Three single-threaded event loops connected by channels: the scheduler
//! engine decides what runs next, the MDA dispatcher multiplexes local
//! deliveries across helper processes, and the bounce generator turns
//! failures into notifications. Everything the core does not own (message
//! bodies, user identities, helper processes, outbound sockets) is an
//! embedder-provided collaborator trait.

pub mod config;
pub mod core;
pub mod error;

pub use config::CourierConfig;
pub use core::{Collaborators, Core};
pub use error::CoreError;

pub use courier_bounce as bounce;
pub use courier_common as common;
pub use courier_mda as mda;
pub use courier_scheduler as scheduler;
