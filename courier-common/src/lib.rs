//! Shared types for the courier delivery core: identifiers, the envelope
//! model, outcome events, the message-body storage contract and logging.

pub mod address;
pub mod envelope;
pub mod id;
pub mod logging;
pub mod outcome;
pub mod store;

pub use address::{Address, AddressError};
pub use envelope::{
    BounceClass, BounceInfo, Delivery, DeliveryKind, Envelope, MdaInfo, MdaMethod, RelayInfo,
    ReportScope,
};
pub use id::{EnvelopeId, MessageId};
pub use outcome::{DeliveryOutcome, EnvelopeNotice, OutcomeEvent};
pub use store::{BodyReader, MemoryStore, MessageStore, StoreError};

pub use tracing;

#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
    Finalised,
}
