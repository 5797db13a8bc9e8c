use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Subscriber callback. Identity is the `Arc` allocation: keep a clone to
/// pass to `off` later.
pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Wrap a closure as a [`Callback`].
pub fn callback<F>(f: F) -> Callback
where
    F: Fn(&Value) + Send + Sync + 'static,
{
    Arc::new(f)
}

fn same_callback(a: &Callback, b: &Callback) -> bool {
    // Compare data pointers only; vtable pointers are not unique.
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Per-context map from event name to callbacks in registration order.
#[derive(Default)]
pub struct SubscriberRegistry {
    listeners: RwLock<HashMap<String, Vec<Callback>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, event: &str, callback: Callback) {
        self.listeners
            .write()
            .entry(event.to_string())
            .or_default()
            .push(callback);
    }

    /// Remove the first registration of `callback` for `event`. Returns
    /// whether anything was removed.
    pub fn remove(&self, event: &str, callback: &Callback) -> bool {
        let mut listeners = self.listeners.write();
        let Some(list) = listeners.get_mut(event) else {
            return false;
        };
        let Some(index) = list.iter().position(|cb| same_callback(cb, callback)) else {
            return false;
        };
        list.remove(index);
        if list.is_empty() {
            listeners.remove(event);
        }
        true
    }

    /// Event names with at least one live registration
    pub fn events(&self) -> Vec<String> {
        self.listeners.read().keys().cloned().collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.listeners.read().get(event).map_or(0, Vec::len)
    }

    /// Invoke every callback for `event` with `payload`. Works on a snapshot,
    /// so callbacks may add or remove subscriptions while being called.
    /// Returns the number of callbacks invoked.
    pub fn dispatch(&self, event: &str, payload: &Value) -> usize {
        let snapshot = match self.listeners.read().get(event) {
            Some(list) => list.clone(),
            None => return 0,
        };
        for callback in &snapshot {
            callback(payload);
        }
        snapshot.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder(log: &Arc<parking_lot::Mutex<Vec<String>>>, tag: &str) -> Callback {
        let log = log.clone();
        let tag = tag.to_string();
        callback(move |v| log.lock().push(format!("{tag}:{v}")))
    }

    #[test]
    fn dispatch_follows_registration_order() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let registry = SubscriberRegistry::new();
        registry.add("headline", recorder(&log, "a"));
        registry.add("headline", recorder(&log, "b"));
        registry.add("weather", recorder(&log, "w"));

        assert_eq!(registry.dispatch("headline", &json!(1)), 2);
        assert_eq!(*log.lock(), vec!["a:1", "b:1"]);
        assert_eq!(registry.dispatch("unknown", &json!(1)), 0);
    }

    #[test]
    fn off_removes_only_the_matching_callback() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let registry = SubscriberRegistry::new();
        let a = recorder(&log, "a");
        let b = recorder(&log, "b");
        let c = recorder(&log, "c");
        registry.add("headline", a.clone());
        registry.add("headline", b.clone());
        registry.add("headline", c.clone());

        assert!(registry.remove("headline", &b));
        assert!(!registry.remove("headline", &b));
        assert!(!registry.remove("weather", &a));

        registry.dispatch("headline", &json!(2));
        assert_eq!(*log.lock(), vec!["a:2", "c:2"]);
    }

    #[test]
    fn duplicate_registrations_are_removed_one_at_a_time() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let registry = SubscriberRegistry::new();
        let a = recorder(&log, "a");
        registry.add("headline", a.clone());
        registry.add("headline", a.clone());

        registry.remove("headline", &a);
        assert_eq!(registry.count("headline"), 1);
    }

    #[test]
    fn emptied_events_are_forgotten() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let registry = SubscriberRegistry::new();
        let a = recorder(&log, "a");
        registry.add("headline", a.clone());
        registry.add("weather", recorder(&log, "w"));

        assert!(registry.remove("headline", &a));
        assert_eq!(registry.events(), vec!["weather".to_string()]);
        assert_eq!(registry.count("headline"), 0);
        assert_eq!(registry.dispatch("headline", &json!(1)), 0);
    }

    #[test]
    fn callbacks_may_mutate_the_registry_during_dispatch() {
        let registry = Arc::new(SubscriberRegistry::new());
        let hits = Arc::new(parking_lot::Mutex::new(0));

        let late = {
            let hits = hits.clone();
            callback(move |_| *hits.lock() += 100)
        };
        let adder = {
            let registry = registry.clone();
            let late = late.clone();
            let hits = hits.clone();
            callback(move |_| {
                *hits.lock() += 1;
                registry.add("headline", late.clone());
            })
        };
        registry.add("headline", adder);

        // The callback added mid-dispatch only sees the next event.
        registry.dispatch("headline", &json!(null));
        assert_eq!(*hits.lock(), 1);
        registry.dispatch("headline", &json!(null));
        assert_eq!(*hits.lock(), 102);
    }
}
