//! Mail addresses as they appear on envelopes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A parsed `user@domain` pair.
///
/// The empty address (null sender, `MAIL FROM:<>`) is representable and is
/// what bounce notifications are sent from; it is never itself bounced,
/// which is what keeps notification loops from forming.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    user: String,
    domain: String,
}

/// Address parse failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("missing '@' separator in {0:?}")]
    MissingSeparator(String),

    #[error("empty local part in {0:?}")]
    EmptyUser(String),

    #[error("empty domain in {0:?}")]
    EmptyDomain(String),
}

impl Address {
    /// Parse `user@domain`. The empty string parses to the null sender.
    ///
    /// # Errors
    /// If the input is non-empty and not of the form `user@domain`.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        if input.is_empty() {
            return Ok(Self::default());
        }

        let Some((user, domain)) = input.rsplit_once('@') else {
            return Err(AddressError::MissingSeparator(input.to_string()));
        };
        if user.is_empty() {
            return Err(AddressError::EmptyUser(input.to_string()));
        }
        if domain.is_empty() {
            return Err(AddressError::EmptyDomain(input.to_string()));
        }

        Ok(Self {
            user: user.to_string(),
            domain: domain.to_ascii_lowercase(),
        })
    }

    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Whether this is the null sender.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.user.is_empty() && self.domain.is_empty()
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            Ok(())
        } else {
            write!(f, "{}@{}", self.user, self.domain)
        }
    }
}

impl std::str::FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
