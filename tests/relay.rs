use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tabcast::clock::TokioClock;
use tabcast::{
    callback, Callback, ChannelOptions, LoopbackChannel, MemoryHub, SharedStore, TabContext,
};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

/// One namespace: a shared store, a channel server and a common clock.
struct Site {
    hub: Arc<MemoryHub>,
    server: LoopbackChannel,
    clock: TokioClock,
}

impl Site {
    fn new() -> Self {
        Self {
            hub: MemoryHub::new(),
            server: LoopbackChannel::new(),
            clock: TokioClock::new(),
        }
    }

    async fn join(&self) -> TabContext {
        TabContext::builder("news", ChannelOptions::new("loopback://news"))
            .store(self.hub.store())
            .connector(self.server.clone())
            .clock(self.clock.clone())
            .start()
            .await
    }
}

fn forwarder() -> (Callback, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        callback(move |payload| {
            let _ = tx.send(payload.clone());
        }),
        rx,
    )
}

fn tagged(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Callback {
    let log = log.clone();
    callback(move |payload| log.lock().unwrap().push(format!("{tag}:{payload}")))
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Value>) -> Option<Value> {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("no event within a second")
}

#[tokio::test(start_paused = true)]
async fn headline_reaches_master_and_slave() {
    let site = Site::new();

    let a = site.join().await;
    let b = site.join().await;
    assert_eq!(site.server.connections(), 1, "only the first context connects");

    let (on_a, mut from_a) = forwarder();
    let (on_b, mut from_b) = forwarder();
    a.on("headline", on_a);
    b.on("headline", on_b);

    assert_eq!(site.server.emit("headline", json!({"id": 7})), 1);

    assert_eq!(next(&mut from_a).await, Some(json!({"id": 7})));
    assert_eq!(next(&mut from_b).await, Some(json!({"id": 7})));
    assert_eq!(
        site.hub.store().get("news:headline").unwrap().as_deref(),
        Some(r#"{"id":7}"#)
    );

    // The master does not hear its own store write.
    sleep(Duration::from_millis(50)).await;
    assert!(from_a.try_recv().is_err());
    assert!(from_b.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn store_path_delivers_to_every_slave() {
    let site = Site::new();
    let _a = site.join().await;
    let b = site.join().await;
    let c = site.join().await;

    let (on_b, mut from_b) = forwarder();
    let (on_c, mut from_c) = forwarder();
    b.on("weather", on_b);
    c.subscriptions().on("weather", on_c);

    // Any writer will do, e.g. a second master.
    site.hub
        .store()
        .set("news:weather", r#"{"sky":"clear","temp":[21.5,null]}"#)
        .unwrap();

    let expected = json!({"sky": "clear", "temp": [21.5, null]});
    assert_eq!(next(&mut from_b).await, Some(expected.clone()));
    assert_eq!(next(&mut from_c).await, Some(expected));
}

#[tokio::test(start_paused = true)]
async fn off_keeps_remaining_callbacks_in_order() {
    let site = Site::new();
    let _a = site.join().await;
    let b = site.join().await;

    let log = Arc::new(Mutex::new(Vec::new()));
    let second = tagged(&log, "second");
    b.on("headline", tagged(&log, "first"));
    b.on("headline", second.clone());
    b.on("headline", tagged(&log, "third"));

    b.off("headline", &second);
    b.off("headline", &tagged(&log, "never-registered"));
    b.off("sports", &second);

    site.hub.store().set("news:headline", "1").unwrap();
    sleep(Duration::from_millis(10)).await;

    assert_eq!(*log.lock().unwrap(), vec!["first:1", "third:1"]);
}

#[tokio::test(start_paused = true)]
async fn malformed_payload_is_dropped_and_listener_survives() {
    let site = Site::new();
    let _a = site.join().await;
    let b = site.join().await;

    let (on_b, mut from_b) = forwarder();
    b.on("headline", on_b);

    let writer = site.hub.store();
    writer.set("news:headline", "{\"id\": 7").unwrap();
    sleep(Duration::from_millis(10)).await;
    assert!(from_b.try_recv().is_err());

    writer.set("news:headline", "{\"id\": 8}").unwrap();
    assert_eq!(next(&mut from_b).await, Some(json!({"id": 8})));
}

#[tokio::test(start_paused = true)]
async fn master_only_arms_events_it_subscribed_to() {
    let site = Site::new();
    let a = site.join().await;

    assert_eq!(site.server.emit("headline", json!(1)), 0);
    sleep(Duration::from_millis(10)).await;
    assert!(site.hub.store().get("news:headline").unwrap().is_none());

    let (on_a, mut from_a) = forwarder();
    a.on("headline", on_a);
    assert_eq!(site.server.emit("headline", json!(2)), 1);
    assert_eq!(next(&mut from_a).await, Some(json!(2)));
}

#[tokio::test(start_paused = true)]
async fn slave_takes_over_after_master_leaves() {
    let site = Site::new();

    let a = site.join().await;
    let b = site.join().await;
    let c = site.join().await;

    let (on_b, mut from_b) = forwarder();
    let (on_c, mut from_c) = forwarder();
    b.on("headline", on_b);
    c.on("headline", on_c);

    drop(a);
    assert_eq!(site.server.open_connections(), 0);

    // Last heartbeat at t=0; the t=10s check finds it stale. Whichever slave
    // checks first promotes; the other may see the fresh heartbeat or may
    // promote as well.
    sleep(Duration::from_secs(11)).await;
    assert!(site.server.open_connections() >= 1);

    site.server.emit("headline", json!({"id": 9}));
    assert_eq!(next(&mut from_b).await, Some(json!({"id": 9})));
    assert_eq!(next(&mut from_c).await, Some(json!({"id": 9})));
}
