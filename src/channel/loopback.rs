//! In-process channel server and connector.
//!
//! Stands in for a remote event server: every context that connects through
//! a clone of the same [`LoopbackChannel`] receives what [`emit`] sends.
//! Also records how many connections were opened, which is how callers can
//! tell which context holds the live channel.
//!
//! [`emit`]: LoopbackChannel::emit

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::{
    ChannelConnection, ChannelConnector, ChannelEvent, ChannelHandle, ChannelOptions, EventSink,
};

#[derive(Clone, Default)]
pub struct LoopbackChannel {
    inner: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    sinks: Mutex<Vec<(usize, EventSink)>>,
    connects: AtomicUsize,
    refuse: AtomicBool,
    last_options: Mutex<Option<ChannelOptions>>,
}

impl LoopbackChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `connect` calls fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Send an event to every open connection that armed it. Returns how
    /// many connections accepted it.
    pub fn emit(&self, event: &str, data: Value) -> usize {
        let sinks = self.inner.sinks.lock().clone();
        sinks
            .iter()
            .filter(|(_, sink)| sink.is_armed(event))
            .filter(|(_, sink)| sink.deliver(ChannelEvent::new(event, data.clone())))
            .count()
    }

    /// Connections opened so far, closed ones included
    pub fn connections(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Connections not yet closed
    pub fn open_connections(&self) -> usize {
        self.inner.sinks.lock().len()
    }

    /// Whether any open connection armed `event`
    pub fn is_armed(&self, event: &str) -> bool {
        self.inner
            .sinks
            .lock()
            .iter()
            .any(|(_, sink)| sink.is_armed(event))
    }

    pub fn last_options(&self) -> Option<ChannelOptions> {
        self.inner.last_options.lock().clone()
    }
}

#[async_trait]
impl ChannelConnector for LoopbackChannel {
    async fn connect(&self, options: &ChannelOptions) -> anyhow::Result<ChannelConnection> {
        if self.inner.refuse.load(Ordering::SeqCst) {
            anyhow::bail!("loopback connection refused");
        }

        let id = self.inner.connects.fetch_add(1, Ordering::SeqCst);
        *self.inner.last_options.lock() = Some(options.clone());

        let (sink, events) = EventSink::new();
        self.inner.sinks.lock().push((id, sink.clone()));

        Ok(ChannelConnection {
            handle: Arc::new(LoopbackHandle {
                id,
                sink: Mutex::new(Some(sink)),
                shared: self.inner.clone(),
            }),
            events,
        })
    }
}

struct LoopbackHandle {
    id: usize,
    sink: Mutex<Option<EventSink>>,
    shared: Arc<Shared>,
}

impl ChannelHandle for LoopbackHandle {
    fn on(&self, event: &str) {
        if let Some(sink) = self.sink.lock().as_ref() {
            sink.arm(event);
        }
    }

    fn close(&self) {
        self.sink.lock().take();
        self.shared.sinks.lock().retain(|(id, _)| *id != self.id);
    }
}

impl Drop for LoopbackHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn emits_to_armed_connections_only() {
        let server = LoopbackChannel::new();
        let mut a = server.connect(&ChannelOptions::new("loopback")).await.unwrap();
        let mut b = server.connect(&ChannelOptions::new("loopback")).await.unwrap();
        a.handle.on("headline");

        assert_eq!(server.emit("headline", json!({"id": 7})), 1);
        assert_eq!(a.events.recv().await.unwrap().data, json!({"id": 7}));
        assert!(b.events.try_recv().is_err());
        assert_eq!(server.connections(), 2);
    }

    #[tokio::test]
    async fn close_ends_the_event_stream() {
        let server = LoopbackChannel::new();
        let mut conn = server.connect(&ChannelOptions::new("loopback")).await.unwrap();
        conn.handle.on("headline");
        conn.handle.close();

        assert_eq!(server.open_connections(), 0);
        assert_eq!(server.emit("headline", json!(1)), 0);
        assert!(conn.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn refused_connections_error() {
        let server = LoopbackChannel::new();
        server.refuse_connections(true);
        assert!(server.connect(&ChannelOptions::new("loopback")).await.is_err());
        assert_eq!(server.connections(), 0);
    }
}
