//! Message and envelope identifiers.
//!
//! An envelope id is a 64-bit value whose high half is the id of the owning
//! message and whose low half is a per-message sequence number. An envelope
//! id with a zero sequence half addresses the whole message; administrative
//! operations use that form to act on every envelope of a message at once.

use serde::{Deserialize, Serialize};

/// Identifier of one accepted mail transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(u32);

impl MessageId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Identifier of one unit of delivery work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvelopeId(u64);

impl EnvelopeId {
    #[must_use]
    pub const fn new(message: MessageId, sequence: u32) -> Self {
        Self((message.0 as u64) << 32 | sequence as u64)
    }

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// The message this envelope belongs to.
    #[must_use]
    pub const fn message(self) -> MessageId {
        MessageId((self.0 >> 32) as u32)
    }

    /// The per-message sequence number.
    #[must_use]
    pub const fn sequence(self) -> u32 {
        self.0 as u32
    }

    /// Whether this id addresses a whole message rather than one envelope.
    #[must_use]
    pub const fn is_message(self) -> bool {
        self.sequence() == 0
    }
}

impl std::fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn envelope_id_round_trips_message_and_sequence() {
        let msg = MessageId::new(0xdead_beef);
        let evp = EnvelopeId::new(msg, 42);

        assert_eq!(evp.message(), msg);
        assert_eq!(evp.sequence(), 42);
        assert_eq!(evp.raw(), 0xdead_beef_0000_002a);
    }

    #[test]
    fn zero_sequence_addresses_the_message() {
        let msg = MessageId::new(7);
        assert!(EnvelopeId::new(msg, 0).is_message());
        assert!(!EnvelopeId::new(msg, 1).is_message());
    }

    #[test]
    fn display_is_fixed_width_hex() {
        let evp = EnvelopeId::new(MessageId::new(0xab), 3);
        assert_eq!(evp.to_string(), "000000ab00000003");
        assert_eq!(evp.message().to_string(), "000000ab");
    }
}
