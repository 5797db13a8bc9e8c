//! Key layout and value encoding of the shared store.
//!
//! Every key lives under `<namespace>:`. `<namespace>:master` holds the
//! heartbeat, `<namespace>:<event>` holds the latest relayed payload of that
//! event. All JSON encoding of payloads goes through this module.

use serde_json::Value;
use std::fmt;

/// Suffix of the heartbeat key
pub const HEARTBEAT_SUFFIX: &str = "master";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKey {
    Heartbeat,
    Event(String),
}

impl StoreKey {
    pub fn event(name: impl Into<String>) -> Self {
        StoreKey::Event(name.into())
    }

    /// Whether a relayed event with this name can be written without
    /// clobbering the heartbeat.
    pub fn is_relayable(event: &str) -> bool {
        event != HEARTBEAT_SUFFIX
    }
}

/// Prefix scoping all keys of one deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace(String);

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn key(&self, key: &StoreKey) -> String {
        match key {
            StoreKey::Heartbeat => format!("{}:{}", self.0, HEARTBEAT_SUFFIX),
            StoreKey::Event(name) => format!("{}:{}", self.0, name),
        }
    }

    /// Inverse of [`key`](Self::key); `None` for keys of other namespaces.
    pub fn parse(&self, raw: &str) -> Option<StoreKey> {
        let rest = raw.strip_prefix(self.0.as_str())?.strip_prefix(':')?;
        match rest {
            HEARTBEAT_SUFFIX => Some(StoreKey::Heartbeat),
            "" => None,
            name => Some(StoreKey::Event(name.to_string())),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Heartbeat record: milliseconds since the epoch of the master's last write
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Heartbeat(pub i64);

impl Heartbeat {
    pub fn encode(&self) -> String {
        self.0.to_string()
    }

    pub fn decode(raw: &str) -> Option<Self> {
        raw.trim().parse().ok().map(Heartbeat)
    }

    /// Saturates, so a heartbeat from far in the past reads as very old
    /// rather than overflowing.
    pub fn age_millis(&self, now: i64) -> i64 {
        now.saturating_sub(self.0)
    }
}

pub fn encode_payload(payload: &Value) -> serde_json::Result<String> {
    serde_json::to_string(payload)
}

pub fn decode_payload(raw: &str) -> serde_json::Result<Value> {
    serde_json::from_str(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_round_trip_through_the_namespace() {
        let ns = Namespace::new("news");
        assert_eq!(ns.key(&StoreKey::Heartbeat), "news:master");
        assert_eq!(ns.key(&StoreKey::event("headline")), "news:headline");

        assert_eq!(ns.parse("news:master"), Some(StoreKey::Heartbeat));
        assert_eq!(ns.parse("news:headline"), Some(StoreKey::event("headline")));
        assert_eq!(ns.parse("news:a:b"), Some(StoreKey::event("a:b")));
    }

    #[test]
    fn foreign_keys_are_rejected() {
        let ns = Namespace::new("news");
        assert_eq!(ns.parse("sports:headline"), None);
        assert_eq!(ns.parse("newsroom:headline"), None);
        assert_eq!(ns.parse("news:"), None);
        assert_eq!(ns.parse("news"), None);
    }

    #[test]
    fn heartbeat_encoding() {
        let hb = Heartbeat(1_700_000_000_123);
        assert_eq!(Heartbeat::decode(&hb.encode()), Some(hb));
        assert_eq!(Heartbeat::decode("not a number"), None);
        assert_eq!(hb.age_millis(1_700_000_005_123), 5000);
    }

    #[test]
    fn extreme_heartbeats_do_not_overflow() {
        let now = 1_700_000_000_000;
        assert_eq!(Heartbeat(i64::MIN).age_millis(now), i64::MAX);
        assert!(Heartbeat(i64::MAX).age_millis(now) < 0);
        assert_eq!(
            Heartbeat::decode("-9223372036854775808").map(|hb| hb.age_millis(now)),
            Some(i64::MAX)
        );
    }

    #[test]
    fn master_is_not_relayable() {
        assert!(!StoreKey::is_relayable("master"));
        assert!(StoreKey::is_relayable("headline"));
    }

    #[test]
    fn payload_decoding_rejects_garbage() {
        let value = json!({"id": 7, "tags": ["a", "b"]});
        let raw = encode_payload(&value).unwrap();
        assert_eq!(decode_payload(&raw).unwrap(), value);
        assert!(decode_payload("{not json").is_err());
    }
}
