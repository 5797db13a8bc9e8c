//! Network connector: WebSocket with an HTTP long-polling fallback.
//!
//! `connect` validates the options and hands back a connection at once; a
//! background supervisor walks the transport list in preference order, each
//! transport getting the configured retry budget, and starts over from the
//! most preferred transport whenever a session ends.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::{
    ChannelConnection, ChannelConnector, ChannelEvent, ChannelHandle, ChannelOptions, EventSink,
    Transport,
};
use crate::error::{with_retry, RetryPolicy};

const WS_PATH: &str = "ws";
const POLL_PATH: &str = "poll";
const POLL_IDLE: Duration = Duration::from_millis(250);

#[derive(Clone, Default)]
pub struct WsConnector {
    http: reqwest::Client,
}

impl WsConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChannelConnector for WsConnector {
    async fn connect(&self, options: &ChannelOptions) -> Result<ChannelConnection> {
        if options.transports.is_empty() {
            bail!("no transports configured");
        }
        let base =
            Url::parse(&options.url).map_err(|e| anyhow!("invalid channel url: {e}"))?;

        let endpoints = options
            .transports
            .iter()
            .map(|t| endpoint(&base, *t, options.token.as_deref()).map(|url| (*t, url)))
            .collect::<Result<Vec<_>>>()?;

        let (sink, events) = EventSink::new();
        let task = tokio::spawn(supervise(
            endpoints,
            options.retry.clone(),
            sink.clone(),
            self.http.clone(),
        ));

        Ok(ChannelConnection {
            handle: Arc::new(WsHandle {
                sink: Mutex::new(Some(sink)),
                task: Mutex::new(Some(task)),
            }),
            events,
        })
    }
}

struct WsHandle {
    sink: Mutex<Option<EventSink>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelHandle for WsHandle {
    fn on(&self, event: &str) {
        if let Some(sink) = self.sink.lock().as_ref() {
            sink.arm(event);
        }
    }

    fn close(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.sink.lock().take();
    }
}

impl Drop for WsHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Endpoint URL of `transport` under `base`, carrying the auth token.
fn endpoint(base: &Url, transport: Transport, token: Option<&str>) -> Result<Url> {
    let mut url = base.clone();
    let scheme = match (transport, base.scheme()) {
        (Transport::Websocket, "http" | "ws") => "ws",
        (Transport::Websocket, "https" | "wss") => "wss",
        (Transport::Polling, "http" | "ws") => "http",
        (Transport::Polling, "https" | "wss") => "https",
        (_, other) => bail!("unsupported channel url scheme: {other}"),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot use scheme {scheme} for {base}"))?;

    let path = match transport {
        Transport::Websocket => WS_PATH,
        Transport::Polling => POLL_PATH,
    };
    let joined = format!("{}/{}", base.path().trim_end_matches('/'), path);
    url.set_path(&joined);

    if let Some(token) = token {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}

enum SessionEnd {
    /// Server side went away; reconnect
    Closed,
    /// Nobody reads events anymore; stop
    ReceiverGone,
}

async fn supervise(
    endpoints: Vec<(Transport, Url)>,
    retry: RetryPolicy,
    sink: EventSink,
    http: reqwest::Client,
) {
    loop {
        let mut had_session = false;

        for (transport, url) in &endpoints {
            let outcome = match transport {
                Transport::Websocket => run_websocket(url, &retry, &sink).await,
                Transport::Polling => run_polling(&http, url, &retry, &sink).await,
            };

            match outcome {
                Ok(SessionEnd::ReceiverGone) => return,
                Ok(SessionEnd::Closed) => {
                    tracing::info!(transport = transport.as_str(), "channel session ended");
                    had_session = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        transport = transport.as_str(),
                        host = url.host_str().unwrap_or_default(),
                        "transport unavailable: {e:#}"
                    );
                }
            }
        }

        let pause = if had_session {
            retry.initial_delay
        } else {
            retry.max_delay
        };
        sleep(pause).await;
    }
}

async fn run_websocket(url: &Url, retry: &RetryPolicy, sink: &EventSink) -> Result<SessionEnd> {
    let (mut ws, _) = with_retry(retry, || tokio_tungstenite::connect_async(url.as_str())).await?;
    tracing::info!(host = url.host_str().unwrap_or_default(), "websocket connected");

    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ChannelEvent>(text.as_str()) {
                Ok(event) => {
                    if !sink.deliver(event) {
                        return Ok(SessionEnd::ReceiverGone);
                    }
                }
                Err(e) => tracing::debug!("ignoring malformed frame: {e}"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("websocket error: {e}");
                break;
            }
        }
    }

    Ok(SessionEnd::Closed)
}

#[derive(Debug, Deserialize)]
struct PollBatch {
    cursor: u64,
    #[serde(default)]
    events: Vec<ChannelEvent>,
}

async fn poll_once(http: &reqwest::Client, url: &Url, cursor: u64) -> reqwest::Result<PollBatch> {
    let mut url = url.clone();
    url.query_pairs_mut()
        .append_pair("cursor", &cursor.to_string());
    http.get(url)
        .send()
        .await?
        .error_for_status()?
        .json::<PollBatch>()
        .await
}

async fn run_polling(
    http: &reqwest::Client,
    url: &Url,
    retry: &RetryPolicy,
    sink: &EventSink,
) -> Result<SessionEnd> {
    let mut batch = with_retry(retry, || poll_once(http, url, 0)).await?;
    tracing::info!(host = url.host_str().unwrap_or_default(), "long polling connected");

    loop {
        let idle = batch.events.is_empty();
        for event in batch.events {
            if !sink.deliver(event) {
                return Ok(SessionEnd::ReceiverGone);
            }
        }
        if idle {
            sleep(POLL_IDLE).await;
        }

        batch = match poll_once(http, url, batch.cursor).await {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!("poll failed: {e}");
                return Ok(SessionEnd::Closed);
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_follow_transport() {
        let base = Url::parse("https://example.com/live/").unwrap();

        let ws = endpoint(&base, Transport::Websocket, Some("abc")).unwrap();
        assert_eq!(ws.as_str(), "wss://example.com/live/ws?token=abc");

        let poll = endpoint(&base, Transport::Polling, None).unwrap();
        assert_eq!(poll.as_str(), "https://example.com/live/poll");
    }

    #[test]
    fn plain_origin_gets_root_paths() {
        let base = Url::parse("http://127.0.0.1:4000").unwrap();
        let ws = endpoint(&base, Transport::Websocket, None).unwrap();
        assert_eq!(ws.as_str(), "ws://127.0.0.1:4000/ws");
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        let base = Url::parse("ftp://example.com").unwrap();
        assert!(endpoint(&base, Transport::Polling, None).is_err());
    }

    #[tokio::test]
    async fn connect_rejects_unusable_options() {
        let connector = WsConnector::new();
        let empty = ChannelOptions::new("http://localhost").with_transports(vec![]);
        assert!(connector.connect(&empty).await.is_err());
        assert!(connector
            .connect(&ChannelOptions::new("not a url"))
            .await
            .is_err());
    }
}
