//! Master election
//!
//! On startup a context reads the heartbeat record. No record: it becomes
//! master, writes the heartbeat every `heartbeat_interval` and opens the
//! channel. A record: it becomes slave and checks every `check_interval`
//! (first check immediately) whether the heartbeat is older than
//! `stale_after`; if so it promotes itself the same way.
//!
//! Two contexts can both end up master when the old master was slow rather
//! than dead. Nothing detects or corrects that, and a master never demotes
//! itself.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::context::Inner;
use crate::error::{millis, ConfigError, StoreError};
use crate::storage::{ChangeStream, Heartbeat, StoreKey};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionTimings {
    /// How often the master rewrites its heartbeat
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,

    /// How often a slave looks at the heartbeat
    #[serde(with = "millis")]
    pub check_interval: Duration,

    /// Heartbeat age beyond which the master is presumed dead
    #[serde(with = "millis")]
    pub stale_after: Duration,
}

impl Default for ElectionTimings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(2),
            check_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(5),
        }
    }
}

impl ElectionTimings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() || self.check_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "election intervals must be greater than zero".into(),
            ));
        }
        if self.heartbeat_interval >= self.stale_after {
            tracing::warn!(
                heartbeat_interval = ?self.heartbeat_interval,
                stale_after = ?self.stale_after,
                "heartbeat interval is not shorter than the staleness window; slaves will promote over a live master"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Role {
    #[default]
    Unstarted,
    Slave,
    Master,
    /// No usable store: own channel, no election, no relay
    Direct,
    Stopped,
}

/// Whether a heartbeat read at `now` shows a dead master. Missing records
/// count as stale; the window is exclusive.
pub(crate) fn is_stale(heartbeat: Option<Heartbeat>, now: i64, stale_after: Duration) -> bool {
    match heartbeat {
        Some(hb) => hb.age_millis(now) > stale_after.as_millis() as i64,
        None => true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskKind {
    Heartbeat,
    StalenessCheck,
    Relay,
    StoreListener,
}

/// Background tasks of one context; all are aborted on shutdown or drop.
pub(crate) struct TaskSet {
    tasks: Mutex<Option<Vec<(TaskKind, JoinHandle<()>)>>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Some(Vec::new())),
        }
    }

    /// Spawn `fut` unless the set is already shut down.
    pub fn spawn<F>(&self, kind: TaskKind, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        let Some(list) = tasks.as_mut() else {
            return;
        };
        list.retain(|(_, handle)| !handle.is_finished());
        list.push((kind, tokio::spawn(fut)));
    }

    #[cfg(test)]
    pub fn running(&self, kind: TaskKind) -> usize {
        self.tasks.lock().as_ref().map_or(0, |list| {
            list.iter()
                .filter(|(k, handle)| *k == kind && !handle.is_finished())
                .count()
        })
    }

    pub fn shutdown(&self) {
        if let Some(list) = self.tasks.lock().take() {
            for (_, handle) in list {
                handle.abort();
            }
        }
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    /// Decide the initial role and set it up.
    pub(crate) async fn elect(self: &Arc<Self>) {
        let Some(store) = self.store.clone() else {
            tracing::info!(namespace = %self.namespace, "no shared store, connecting directly");
            self.start_direct().await;
            return;
        };

        // Subscribe before reading so nothing written in between is missed.
        let changes = store.subscribe();
        match store.get(&self.namespace.key(&StoreKey::Heartbeat)) {
            Ok(None) => {
                self.spawn_store_listener(changes);
                self.promote().await;
            }
            Ok(Some(_)) | Err(StoreError::Corrupt { .. }) => {
                self.spawn_store_listener(changes);
                self.become_slave();
            }
            Err(e) => {
                tracing::warn!(
                    namespace = %self.namespace,
                    "shared store unavailable, connecting directly: {e}"
                );
                self.start_direct().await;
            }
        }
    }

    /// Take over as master. Returns `false` (and does nothing) unless this
    /// context is still unstarted or a slave.
    pub(crate) async fn promote(self: &Arc<Self>) -> bool {
        {
            let mut state = self.state.lock();
            if !matches!(state.role, Role::Unstarted | Role::Slave) {
                return false;
            }
            state.role = Role::Master;
        }
        tracing::info!(namespace = %self.namespace, "became master");

        self.write_heartbeat();
        self.spawn_heartbeat();
        self.open_channel().await;
        true
    }

    fn become_slave(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.role != Role::Unstarted {
                return;
            }
            state.role = Role::Slave;
        }
        tracing::info!(namespace = %self.namespace, "became slave");

        let weak = Arc::downgrade(self);
        let period = self.timings.check_interval;
        self.tasks.spawn(TaskKind::StalenessCheck, async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.master_is_stale() {
                    tracing::info!(namespace = %inner.namespace, "master heartbeat is stale");
                    inner.promote().await;
                    break;
                }
            }
        });
    }

    async fn start_direct(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.role != Role::Unstarted {
                return;
            }
            state.role = Role::Direct;
        }
        self.open_channel().await;
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.timings.heartbeat_interval;
        self.tasks.spawn(TaskKind::Heartbeat, async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick is immediate and promotion already wrote one.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.write_heartbeat();
            }
        });
    }

    fn write_heartbeat(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let heartbeat = Heartbeat(self.clock.now_millis());
        if let Err(e) = store.set(&self.namespace.key(&StoreKey::Heartbeat), &heartbeat.encode()) {
            tracing::warn!(namespace = %self.namespace, "failed to write heartbeat: {e}");
        }
    }

    fn master_is_stale(&self) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        let heartbeat = match store.get(&self.namespace.key(&StoreKey::Heartbeat)) {
            Ok(raw) => raw.as_deref().and_then(Heartbeat::decode),
            Err(StoreError::Corrupt { .. }) => None,
            Err(e) => {
                tracing::warn!(namespace = %self.namespace, "heartbeat check failed: {e}");
                return false;
            }
        };
        is_stale(heartbeat, self.clock.now_millis(), self.timings.stale_after)
    }

    fn spawn_store_listener(self: &Arc<Self>, mut changes: ChangeStream) {
        let weak = Arc::downgrade(self);
        self.tasks.spawn(TaskKind::StoreListener, async move {
            while let Some(change) = changes.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.on_store_change(&change);
            }
        });
    }
}
