//! One participant of a namespace and its event relay.
//!
//! Events reach local subscribers by one of two paths:
//!
//! - **direct**: the master (or a context in direct mode) dispatches every
//!   channel event to its own subscribers straight away;
//! - **via the store**: the master also writes the event under
//!   `<namespace>:<event>`, and every other context dispatches it when the
//!   store reports the change.
//!
//! A writer never sees its own store notifications, so the master does not
//! deliver twice.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::channel::{ChannelConnector, ChannelEvent, ChannelHandle, ChannelOptions, WsConnector};
use crate::clock::{Clock, SystemClock};
use crate::config::RelayConfig;
use crate::election::{ElectionTimings, Role, TaskKind, TaskSet};
use crate::registry::{Callback, SubscriberRegistry};
use crate::storage::schema::{decode_payload, encode_payload};
use crate::storage::{FileStore, Namespace, SharedStore, StoreChange, StoreKey};

#[derive(Default)]
pub(crate) struct State {
    pub role: Role,
    pub channel: Option<Arc<dyn ChannelHandle>>,
}

pub(crate) struct Inner {
    pub namespace: Namespace,
    pub timings: ElectionTimings,
    pub options: ChannelOptions,
    pub store: Option<Arc<dyn SharedStore>>,
    pub connector: Arc<dyn ChannelConnector>,
    pub clock: Arc<dyn Clock>,
    pub registry: SubscriberRegistry,
    pub state: Mutex<State>,
    pub tasks: TaskSet,
}

impl Inner {
    pub(crate) fn role(&self) -> Role {
        self.state.lock().role
    }

    /// Connect the channel, arm every subscribed event and start relaying.
    pub(crate) async fn open_channel(self: &Arc<Self>) {
        let connection = match self.connector.connect(&self.options).await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::error!(namespace = %self.namespace, "channel connect failed: {e:#}");
                return;
            }
        };

        {
            let mut state = self.state.lock();
            if state.role == Role::Stopped {
                connection.handle.close();
                return;
            }
            state.channel = Some(connection.handle.clone());
        }

        // Subscriptions made from here on arm themselves in `on`.
        for event in self.registry.events() {
            connection.handle.on(&event);
        }
        self.spawn_relay(connection.events);
    }

    fn spawn_relay(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        let weak = Arc::downgrade(self);
        self.tasks.spawn(TaskKind::Relay, async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.relay(&event);
            }
            tracing::debug!("channel event stream closed");
        });
    }

    /// Handle one channel event: publish for the other contexts when master,
    /// then deliver locally.
    pub(crate) fn relay(&self, event: &ChannelEvent) -> usize {
        if self.role() == Role::Master {
            self.publish(event);
        }
        let delivered = self.registry.dispatch(&event.event, &event.data);
        tracing::trace!(event = %event.event, delivered, "channel event delivered");
        delivered
    }

    fn publish(&self, event: &ChannelEvent) {
        let Some(store) = &self.store else {
            return;
        };
        if !StoreKey::is_relayable(&event.event) {
            tracing::warn!(
                event = %event.event,
                "event name collides with the heartbeat key; delivered locally only"
            );
            return;
        }

        let key = self.namespace.key(&StoreKey::event(event.event.as_str()));
        let result = encode_payload(&event.data)
            .map_err(|e| e.to_string())
            .and_then(|raw| store.set(&key, &raw).map_err(|e| e.to_string()));
        if let Err(e) = result {
            tracing::warn!(%key, "failed to relay event: {e}");
        }
    }

    /// Deliver an event another context wrote into the store. Malformed
    /// payloads are dropped. Returns the number of callbacks invoked.
    pub(crate) fn on_store_change(&self, change: &StoreChange) -> usize {
        let Some(StoreKey::Event(event)) = self.namespace.parse(&change.key) else {
            return 0;
        };
        let Some(raw) = change.new_value.as_deref() else {
            return 0;
        };

        match decode_payload(raw) {
            Ok(payload) => self.registry.dispatch(&event, &payload),
            Err(e) => {
                tracing::trace!(%event, "dropping malformed relayed payload: {e}");
                0
            }
        }
    }

    pub(crate) fn subscribe(&self, event: &str, callback: Callback) {
        self.registry.add(event, callback);
        let channel = self.state.lock().channel.clone();
        if let Some(channel) = channel {
            channel.on(event);
        }
    }

    pub(crate) fn unsubscribe(&self, event: &str, callback: &Callback) {
        self.registry.remove(event, callback);
    }

    pub(crate) fn shutdown(&self) {
        let channel = {
            let mut state = self.state.lock();
            if state.role == Role::Stopped {
                return;
            }
            state.role = Role::Stopped;
            state.channel.take()
        };
        self.tasks.shutdown();
        if let Some(channel) = channel {
            channel.close();
        }
        tracing::debug!(namespace = %self.namespace, "context shut down");
    }
}

/// Application-facing subscription API. Cheap to clone; works the same
/// whichever role the context holds.
#[derive(Clone)]
pub struct Subscriptions {
    inner: Arc<Inner>,
}

impl Subscriptions {
    /// Call `callback` with the payload of every `event` from now on.
    pub fn on(&self, event: &str, callback: Callback) {
        self.inner.subscribe(event, callback);
    }

    /// Remove the first registration of this very `callback` for `event`.
    pub fn off(&self, event: &str, callback: &Callback) {
        self.inner.unsubscribe(event, callback);
    }
}

/// A running participant. Dropping it (or calling [`shutdown`]) stops its
/// timers and closes its channel.
///
/// [`shutdown`]: TabContext::shutdown
pub struct TabContext {
    pub(crate) inner: Arc<Inner>,
}

impl TabContext {
    pub fn builder(namespace: impl Into<String>, options: ChannelOptions) -> TabContextBuilder {
        TabContextBuilder {
            namespace: Namespace::new(namespace),
            options,
            timings: ElectionTimings::default(),
            store: None,
            connector: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Builder wired from configuration: file store at the configured
    /// directory (or direct mode if it cannot be opened) and the network
    /// connector.
    pub fn from_config(config: &RelayConfig) -> TabContextBuilder {
        let mut builder = Self::builder(config.namespace.clone(), config.channel.clone())
            .timings(config.election.clone());

        let dir = config.store_dir();
        match FileStore::open(&dir) {
            Ok(store) => builder = builder.store(store),
            Err(e) => tracing::warn!(
                dir = %dir.display(),
                "shared store unavailable, running in direct mode: {e}"
            ),
        }
        builder
    }

    pub fn subscriptions(&self) -> Subscriptions {
        Subscriptions {
            inner: self.inner.clone(),
        }
    }

    pub fn on(&self, event: &str, callback: Callback) {
        self.inner.subscribe(event, callback);
    }

    pub fn off(&self, event: &str, callback: &Callback) {
        self.inner.unsubscribe(event, callback);
    }

    /// Stop timers, listeners and the channel. The heartbeat record is left
    /// in place and goes stale on its own.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    #[cfg(test)]
    pub(crate) fn role(&self) -> Role {
        self.inner.role()
    }
}

impl Drop for TabContext {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

pub struct TabContextBuilder {
    namespace: Namespace,
    options: ChannelOptions,
    timings: ElectionTimings,
    store: Option<Arc<dyn SharedStore>>,
    connector: Option<Arc<dyn ChannelConnector>>,
    clock: Arc<dyn Clock>,
}

impl TabContextBuilder {
    pub fn store(self, store: impl SharedStore + 'static) -> Self {
        self.shared_store(Arc::new(store))
    }

    pub fn shared_store(mut self, store: Arc<dyn SharedStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn connector(mut self, connector: impl ChannelConnector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    pub fn timings(mut self, timings: ElectionTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Run the election and return the live context. Never fails: a broken
    /// store degrades to direct mode and channel trouble is the connector's
    /// to retry.
    pub async fn start(self) -> TabContext {
        let inner = Arc::new(Inner {
            namespace: self.namespace,
            timings: self.timings,
            options: self.options,
            store: self.store,
            connector: self
                .connector
                .unwrap_or_else(|| Arc::new(WsConnector::new())),
            clock: self.clock,
            registry: SubscriberRegistry::new(),
            state: Mutex::new(State::default()),
            tasks: TaskSet::new(),
        });
        inner.elect().await;
        TabContext { inner }
    }
}
