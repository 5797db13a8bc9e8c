//! # tabcast - one live connection, many listeners
//!
//! Several contexts (tabs, processes, workers) of the same namespace share a
//! key-value store. One of them is elected master by a heartbeat in that
//! store and is the only one to hold the real-time channel; every event it
//! receives is written back into the store, where the other contexts pick it
//! up from change notifications. Application code subscribes the same way
//! whatever role its context ended up with.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tabcast::{callback, ChannelOptions, FileStore, TabContext};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = FileStore::open("/tmp/tabcast")?;
//!     let ctx = TabContext::builder("news", ChannelOptions::new("https://events.example.com"))
//!         .store(store)
//!         .start()
//!         .await;
//!
//!     ctx.on("headline", callback(|payload| println!("headline: {payload}")));
//!     tokio::signal::ctrl_c().await?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod clock;
pub mod config;
pub mod context;
pub mod election;
pub mod error;
pub mod logging;
pub mod registry;
pub mod storage;

pub use channel::{ChannelEvent, ChannelOptions, LoopbackChannel, Transport, WsConnector};
pub use config::RelayConfig;
pub use context::{Subscriptions, TabContext, TabContextBuilder};
pub use election::ElectionTimings;
pub use registry::{callback, Callback};
pub use storage::{FileStore, MemoryHub, MemoryStore, SharedStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
