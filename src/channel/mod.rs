//! Real-time channel client seam.
//!
//! Only the master context holds a live connection. The core never looks
//! inside it: it connects, arms the event names it cares about, and reads
//! [`ChannelEvent`]s off the connection's receiver.

pub mod loopback;
pub mod ws;

use async_trait::async_trait;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::RetryPolicy;

pub use loopback::LoopbackChannel;
pub use ws::WsConnector;

/// One named event as carried on the wire: `{"event": "...", "data": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl ChannelEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Transport mechanisms, tried in the order given in [`ChannelOptions`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Persistent WebSocket at `<url>/ws`
    Websocket,
    /// HTTP long polling at `<url>/poll`
    Polling,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Websocket => "websocket",
            Transport::Polling => "polling",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelOptions {
    /// Base URL of the event server
    pub url: String,
    /// Sent as the `token` query parameter
    pub token: Option<String>,
    /// Preferred transport first
    pub transports: Vec<Transport>,
    pub retry: RetryPolicy,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self::new("http://127.0.0.1:3000")
    }
}

impl ChannelOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            transports: vec![Transport::Websocket, Transport::Polling],
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_transports(mut self, transports: Vec<Transport>) -> Self {
        self.transports = transports;
        self
    }
}

/// Control side of a live connection
pub trait ChannelHandle: Send + Sync {
    /// Start routing events named `event` to the connection's receiver.
    /// Arming the same name twice has no further effect.
    fn on(&self, event: &str);

    /// Drop the connection; the event receiver closes afterwards.
    fn close(&self);
}

pub struct ChannelConnection {
    pub handle: Arc<dyn ChannelHandle>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Open a connection. Transport failures after this returns are handled
    /// by the connector itself; an error here means the options are unusable.
    async fn connect(&self, options: &ChannelOptions) -> anyhow::Result<ChannelConnection>;
}

/// Delivery end shared by connector implementations: forwards only armed
/// event names.
#[derive(Clone)]
pub(crate) struct EventSink {
    armed: Arc<DashSet<String>>,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl EventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                armed: Arc::new(DashSet::new()),
                tx,
            },
            rx,
        )
    }

    pub fn arm(&self, event: &str) {
        if self.armed.insert(event.to_string()) {
            tracing::debug!(event, "channel listener armed");
        }
    }

    pub fn is_armed(&self, event: &str) -> bool {
        self.armed.contains(event)
    }

    /// Returns `false` once the receiving side is gone.
    pub fn deliver(&self, event: ChannelEvent) -> bool {
        if !self.is_armed(&event.event) {
            return !self.tx.is_closed();
        }
        self.tx.send(event).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_format() {
        let ev: ChannelEvent =
            serde_json::from_str(r#"{"event":"headline","data":{"id":7}}"#).unwrap();
        assert_eq!(ev, ChannelEvent::new("headline", json!({"id": 7})));

        let bare: ChannelEvent = serde_json::from_str(r#"{"event":"ping"}"#).unwrap();
        assert_eq!(bare.data, Value::Null);
    }

    #[test]
    fn transports_parse_lowercase() {
        let t: Vec<Transport> = serde_json::from_str(r#"["polling","websocket"]"#).unwrap();
        assert_eq!(t, vec![Transport::Polling, Transport::Websocket]);
    }

    #[test]
    fn sink_forwards_only_armed_events() {
        let (sink, mut rx) = EventSink::new();
        sink.arm("headline");
        sink.arm("headline");

        assert!(sink.deliver(ChannelEvent::new("weather", json!(1))));
        assert!(sink.deliver(ChannelEvent::new("headline", json!(2))));

        assert_eq!(rx.try_recv().unwrap().data, json!(2));
        assert!(rx.try_recv().is_err());
    }
}
