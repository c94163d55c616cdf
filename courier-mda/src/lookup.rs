//! Identity resolution contract.
//!
//! The dispatcher never touches the password database itself; it asks an
//! embedder-provided resolver and holds the user's queue back until the
//! answer arrives.

use std::fmt::Debug;

use ahash::AHashMap;
use async_trait::async_trait;

use crate::error::LookupError;

/// Resolved local identity a helper runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub uid: u32,
    pub gid: u32,
    /// Canonical username, which may differ from the lookup key.
    pub username: String,
    /// Home-directory-equivalent path for relative delivery targets.
    pub directory: String,
}

/// Asynchronous user lookup keyed by (table, username).
#[async_trait]
pub trait UserLookup: Send + Sync + Debug {
    async fn lookup(&self, table: &str, username: &str) -> Result<UserInfo, LookupError>;
}

/// Fixed table of identities; unknown users fail permanently.
#[derive(Debug, Default)]
pub struct StaticLookup {
    users: AHashMap<String, UserInfo>,
}

impl StaticLookup {
    #[must_use]
    pub fn new(users: impl IntoIterator<Item = UserInfo>) -> Self {
        Self {
            users: users
                .into_iter()
                .map(|user| (user.username.clone(), user))
                .collect(),
        }
    }
}

#[async_trait]
impl UserLookup for StaticLookup {
    async fn lookup(&self, _table: &str, username: &str) -> Result<UserInfo, LookupError> {
        self.users
            .get(username)
            .cloned()
            .ok_or_else(|| LookupError::Permanent(format!("no such user: {username}")))
    }
}
