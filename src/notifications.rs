//! Registry of handlers for server-pushed notifications.
//!
//! Handlers are bound per notification name and run in the order they were
//! subscribed. The same handler may be bound more than once and then runs
//! once per binding.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error};

/// A notification subscriber. Receives the notification's `params.data`.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Wrap a closure as a [`Handler`]. Keep the returned value to unsubscribe later.
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&Value) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Two handlers are the same binding when they share an allocation.
fn same_handler(a: &Handler, b: &Handler) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Notification name → ordered handler bindings.
#[derive(Default)]
pub struct NotificationRegistry {
    bindings: Mutex<HashMap<String, Vec<Handler>>>,
}

impl NotificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` to the bindings for `name`.
    pub fn subscribe(&self, name: &str, handler: Handler) {
        self.bindings
            .lock()
            .entry(name.to_string())
            .or_default()
            .push(handler);
    }

    /// Remove the first binding of `handler` for `name`.
    ///
    /// Returns whether a binding was removed. A name left without bindings
    /// is dropped from the map.
    pub fn unsubscribe(&self, name: &str, handler: &Handler) -> bool {
        let mut bindings = self.bindings.lock();
        let Some(handlers) = bindings.get_mut(name) else {
            return false;
        };

        let removed = match handlers.iter().position(|h| same_handler(h, handler)) {
            Some(index) => {
                handlers.remove(index);
                true
            }
            None => false,
        };

        if handlers.is_empty() {
            bindings.remove(name);
        }
        removed
    }

    pub fn has_subscribers(&self, name: &str) -> bool {
        self.bindings.lock().contains_key(name)
    }

    pub fn subscriber_count(&self, name: &str) -> usize {
        self.bindings.lock().get(name).map_or(0, Vec::len)
    }

    /// Names that currently have at least one binding, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bindings.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Invoke every handler bound to `name` with `data`.
    ///
    /// The binding list is copied before any handler runs, so handlers may
    /// subscribe or unsubscribe freely; changes apply from the next dispatch.
    /// A panicking handler is logged and skipped. Returns the number of
    /// handlers that were invoked.
    pub fn dispatch(&self, name: &str, data: &Value) -> usize {
        let handlers: Vec<Handler> = match self.bindings.lock().get(name) {
            Some(handlers) => handlers.clone(),
            None => {
                debug!("No subscribers for notification {}", name);
                return 0;
            }
        };

        for handler in &handlers {
            let result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(data)));
            if result.is_err() {
                error!("Notification handler for {} panicked", name);
            }
        }
        handlers.len()
    }
}

impl std::fmt::Debug for NotificationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<String, usize> = self
            .bindings
            .lock()
            .iter()
            .map(|(name, handlers)| (name.clone(), handlers.len()))
            .collect();
        f.debug_struct("NotificationRegistry")
            .field("bindings", &counts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn recorder(log: &Arc<StdMutex<Vec<String>>>, tag: &str) -> Handler {
        let log = Arc::clone(log);
        let tag = tag.to_string();
        handler(move |data| {
            log.lock().unwrap().push(format!("{}:{}", tag, data));
        })
    }

    #[test]
    fn test_dispatch_in_subscription_order() {
        let registry = NotificationRegistry::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        registry.subscribe("Player.OnPlay", recorder(&log, "a"));
        registry.subscribe("Player.OnPlay", recorder(&log, "b"));

        let invoked = registry.dispatch("Player.OnPlay", &json!({"item": {}}));

        assert_eq!(invoked, 2);
        assert_eq!(
            *log.lock().unwrap(),
            vec![r#"a:{"item":{}}"#.to_string(), r#"b:{"item":{}}"#.to_string()]
        );
    }

    #[test]
    fn test_unknown_name_is_ignored() {
        let registry = NotificationRegistry::new();
        assert_eq!(registry.dispatch("Nobody.Listens", &Value::Null), 0);
    }

    #[test]
    fn test_duplicate_binding_runs_per_registration() {
        let registry = NotificationRegistry::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let h = recorder(&log, "x");
        registry.subscribe("System.OnQuit", Arc::clone(&h));
        registry.subscribe("System.OnQuit", Arc::clone(&h));

        registry.dispatch("System.OnQuit", &Value::Null);
        assert_eq!(log.lock().unwrap().len(), 2);

        assert!(registry.unsubscribe("System.OnQuit", &h));
        registry.dispatch("System.OnQuit", &Value::Null);
        assert_eq!(log.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_unsubscribe_last_binding_removes_name() {
        let registry = NotificationRegistry::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let h = recorder(&log, "x");
        let other = recorder(&log, "y");
        registry.subscribe("Player.OnStop", Arc::clone(&h));

        assert!(!registry.unsubscribe("Player.OnStop", &other));
        assert!(registry.has_subscribers("Player.OnStop"));

        assert!(registry.unsubscribe("Player.OnStop", &h));
        assert!(!registry.has_subscribers("Player.OnStop"));
        assert!(registry.names().is_empty());
        assert!(!registry.unsubscribe("Player.OnStop", &h));
    }

    #[test]
    fn test_handler_may_unsubscribe_itself_during_dispatch() {
        let registry = Arc::new(NotificationRegistry::new());
        let count = Arc::new(StdMutex::new(0));
        let slot: Arc<StdMutex<Option<Handler>>> = Arc::new(StdMutex::new(None));

        let h = {
            let registry = Arc::clone(&registry);
            let count = Arc::clone(&count);
            let slot = Arc::clone(&slot);
            handler(move |_| {
                *count.lock().unwrap() += 1;
                if let Some(me) = slot.lock().unwrap().as_ref() {
                    registry.unsubscribe("Player.OnPause", me);
                }
                registry.subscribe("Player.OnPause", handler(|_| {}));
            })
        };
        *slot.lock().unwrap() = Some(Arc::clone(&h));
        registry.subscribe("Player.OnPause", Arc::clone(&h));
        registry.subscribe("Player.OnPause", handler(|_| {}));

        // Snapshot taken before the first handler mutates the bindings.
        assert_eq!(registry.dispatch("Player.OnPause", &Value::Null), 2);
        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(registry.subscriber_count("Player.OnPause"), 2);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_dispatch() {
        let registry = NotificationRegistry::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        registry.subscribe("GUI.OnScreensaverActivated", handler(|_| panic!("boom")));
        registry.subscribe("GUI.OnScreensaverActivated", recorder(&log, "after"));

        assert_eq!(
            registry.dispatch("GUI.OnScreensaverActivated", &Value::Null),
            2
        );
        assert_eq!(log.lock().unwrap().len(), 1);
    }
}
