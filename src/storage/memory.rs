use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{ChangeStream, Notification, SharedStore, StoreChange, NOTIFY_CAPACITY};
use crate::error::StoreError;

/// In-process store shared by several contexts.
///
/// Each [`MemoryStore`] handed out by [`MemoryHub::store`] acts as one
/// context: it sees every value but only hears about writes made by the
/// other handles.
pub struct MemoryHub {
    entries: RwLock<HashMap<String, String>>,
    tx: broadcast::Sender<Notification>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(NOTIFY_CAPACITY);
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            tx,
        })
    }

    /// A new context handle onto this hub
    pub fn store(self: &Arc<Self>) -> MemoryStore {
        MemoryStore {
            hub: self.clone(),
            origin: Uuid::new_v4(),
        }
    }

    /// Snapshot of all keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    hub: Arc<MemoryHub>,
    origin: Uuid,
}

impl SharedStore for MemoryStore {
    fn origin(&self) -> Uuid {
        self.origin
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.hub.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let old_value = self
            .hub
            .entries
            .write()
            .insert(key.to_string(), value.to_string());

        // No receivers is fine: nobody else is listening yet.
        let _ = self.hub.tx.send(Notification {
            origin: self.origin,
            change: StoreChange {
                key: key.to_string(),
                old_value,
                new_value: Some(value.to_string()),
            },
        });
        Ok(())
    }

    fn subscribe(&self) -> ChangeStream {
        ChangeStream::new(self.hub.tx.subscribe(), self.origin)
    }
}
