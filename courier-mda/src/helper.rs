//! Delivery helper contract.
//!
//! A helper is an external process matched to the envelope's delivery
//! method. The dispatcher owns one write end of its pipe and a notification
//! of its exit; everything else about process supervision belongs to the
//! embedder.

use std::fmt::Debug;

use async_trait::async_trait;
use courier_common::MdaInfo;
use tokio::{io::AsyncWrite, sync::oneshot};

use crate::{error::SpawnError, lookup::UserInfo};

/// Exit report of one helper, with the last output line it produced.
///
/// The last line is the diagnostic local delivery agents conventionally
/// print on failure ("mailbox full", quota messages and the like).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HelperExit {
    pub code: i32,
    pub last_line: Option<String>,
}

impl HelperExit {
    #[must_use]
    pub const fn success(&self) -> bool {
        self.code == 0
    }
}

/// A running helper: the pipe the message body goes into, and the exit
/// notification that resolves when the process is gone.
pub struct HelperHandle {
    pub input: Box<dyn AsyncWrite + Send + Unpin>,
    pub exit: oneshot::Receiver<HelperExit>,
}

impl Debug for HelperHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperHandle").finish_non_exhaustive()
    }
}

/// Spawns helpers for local delivery methods.
#[async_trait]
pub trait HelperSpawner: Send + Sync + Debug {
    async fn spawn(&self, delivery: &MdaInfo, user: &UserInfo)
    -> Result<HelperHandle, SpawnError>;
}
