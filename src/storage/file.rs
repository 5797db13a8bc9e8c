//! Directory-backed store shared between processes.
//!
//! Layout: one file per key, named by the hex encoding of the key, holding a
//! JSON envelope `{"origin": <uuid>, "value": <string>}`. Writes land in a
//! hidden temp file that is renamed over the record, so readers never see a
//! torn value. A debounced filesystem watcher turns record changes into
//! notifications; the envelope origin lets each handle skip its own writes.

use dashmap::DashMap;
use notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{
    new_debouncer, DebounceEventResult, DebouncedEvent, Debouncer, RecommendedCache,
};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{ChangeStream, Notification, SharedStore, StoreChange, NOTIFY_CAPACITY};
use crate::error::StoreError;

const DEBOUNCE: Duration = Duration::from_millis(50);

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    origin: Uuid,
    value: String,
}

pub struct FileStore {
    dir: PathBuf,
    origin: Uuid,
    tx: broadcast::Sender<Notification>,
    /// Last value seen per key, used for `old_value` and to drop
    /// duplicate watcher events for an unchanged record.
    seen: Arc<DashMap<String, String>>,
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
}

impl FileStore {
    /// Open (creating if needed) the store rooted at `dir` and start
    /// watching it.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        let origin = Uuid::new_v4();

        let unavailable = |source| StoreError::Unavailable {
            path: dir.clone(),
            source,
        };
        std::fs::create_dir_all(&dir).map_err(unavailable)?;
        let probe = dir.join(format!(".probe-{origin}"));
        std::fs::write(&probe, b"").map_err(unavailable)?;
        std::fs::remove_file(&probe).map_err(unavailable)?;

        let seen = Arc::new(DashMap::new());
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if let Some(key) = key_for_path(&path) {
                if let Ok(Some(envelope)) = read_envelope(&path, &key) {
                    seen.insert(key, envelope.value);
                }
            }
        }

        let (tx, _) = broadcast::channel(NOTIFY_CAPACITY);

        let handler_tx = tx.clone();
        let handler_seen = seen.clone();
        let mut debouncer = new_debouncer(DEBOUNCE, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    for event in events {
                        handle_event(&event, &handler_tx, &handler_seen);
                    }
                }
                Err(errors) => {
                    for error in errors {
                        tracing::warn!("store watcher error: {error}");
                    }
                }
            }
        })?;
        debouncer.watch(&dir, RecursiveMode::NonRecursive)?;

        tracing::debug!(dir = %dir.display(), %origin, "file store opened");

        Ok(Self {
            dir,
            origin,
            tx,
            seen,
            _debouncer: debouncer,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All keys currently stored, sorted
    pub fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            if let Some(key) = key_for_path(&entry?.path()) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(hex::encode(key))
    }
}

impl SharedStore for FileStore {
    fn origin(&self) -> Uuid {
        self.origin
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(read_envelope(&self.record_path(key), key)?.map(|e| e.value))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let envelope = Envelope {
            origin: self.origin,
            value: value.to_string(),
        };
        let bytes = serde_json::to_vec(&envelope).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        let target = self.record_path(key);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", hex::encode(key), self.origin));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &target)?;

        self.seen.insert(key.to_string(), envelope.value);
        Ok(())
    }

    fn subscribe(&self) -> ChangeStream {
        ChangeStream::new(self.tx.subscribe(), self.origin)
    }
}

/// Decode a record file name back into its key; temp and probe files are
/// hidden and yield `None`.
fn key_for_path(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    if name.starts_with('.') {
        return None;
    }
    String::from_utf8(hex::decode(name).ok()?).ok()
}

fn read_envelope(path: &Path, key: &str) -> Result<Option<Envelope>, StoreError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
}

fn handle_event(
    event: &DebouncedEvent,
    tx: &broadcast::Sender<Notification>,
    seen: &DashMap<String, String>,
) {
    let removal = match event.event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => false,
        EventKind::Remove(_) => true,
        _ => return,
    };

    for path in &event.event.paths {
        let Some(key) = key_for_path(path) else {
            continue;
        };

        if removal {
            if let Some((_, old_value)) = seen.remove(&key) {
                let _ = tx.send(Notification {
                    origin: Uuid::nil(),
                    change: StoreChange {
                        key,
                        old_value: Some(old_value),
                        new_value: None,
                    },
                });
            }
            continue;
        }

        let envelope = match read_envelope(path, &key) {
            Ok(Some(envelope)) => envelope,
            // Renamed away between the event and the read.
            Ok(None) => continue,
            Err(e) => {
                tracing::debug!(%key, "skipping unreadable record: {e}");
                continue;
            }
        };

        let old_value = seen.insert(key.clone(), envelope.value.clone());
        if old_value.as_deref() == Some(envelope.value.as_str()) {
            continue;
        }

        let _ = tx.send(Notification {
            origin: envelope.origin,
            change: StoreChange {
                key,
                old_value,
                new_value: Some(envelope.value),
            },
        });
    }
}
