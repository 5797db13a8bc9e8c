//! Shared key-value store seen by every context of a namespace.
//!
//! A write made through one handle is visible to all handles via `get` and is
//! announced to every *other* handle through its [`ChangeStream`]. The writer
//! never hears about its own writes.

pub mod file;
pub mod memory;
pub mod schema;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::StoreError;

pub use file::FileStore;
pub use memory::{MemoryHub, MemoryStore};
pub use schema::{Heartbeat, Namespace, StoreKey};

/// Capacity of the notification channel. Slow readers skip ahead rather than
/// block writers; only the latest value per key matters.
pub(crate) const NOTIFY_CAPACITY: usize = 256;

/// A key written by another context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub key: String,
    pub old_value: Option<String>,
    /// `None` when the key was removed
    pub new_value: Option<String>,
}

/// A change tagged with the id of the handle that made it
#[derive(Debug, Clone)]
pub(crate) struct Notification {
    pub origin: Uuid,
    pub change: StoreChange,
}

/// Primitives every backing store provides.
pub trait SharedStore: Send + Sync {
    /// Id of this handle; notifications carrying it are not delivered back.
    fn origin(&self) -> Uuid;

    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Stream of changes made by other handles from now on.
    fn subscribe(&self) -> ChangeStream;
}

/// Receiver half of a store subscription, filtering out our own writes.
pub struct ChangeStream {
    rx: broadcast::Receiver<Notification>,
    origin: Uuid,
}

impl ChangeStream {
    pub(crate) fn new(rx: broadcast::Receiver<Notification>, origin: Uuid) -> Self {
        Self { rx, origin }
    }

    /// Next foreign change, or `None` once the store is gone.
    pub async fn recv(&mut self) -> Option<StoreChange> {
        loop {
            match self.rx.recv().await {
                Ok(n) if n.origin == self.origin => continue,
                Ok(n) => return Some(n.change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "store change stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<StoreChange> {
        loop {
            match self.rx.try_recv() {
                Ok(n) if n.origin == self.origin => continue,
                Ok(n) => return Some(n.change),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "store change stream lagged");
                }
                Err(_) => return None,
            }
        }
    }
}
