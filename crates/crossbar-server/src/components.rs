//! Component registry: named server extensions loaded once at startup and
//! looked up by name afterwards.
//!
//! The registry is frozen after the builder finishes loading. Load failures
//! are recorded rather than forgotten, so a later lookup of a failed
//! component reports why it is unavailable instead of a bare "not found".

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use crossbar_core::ServerError;
use tracing::{error, info};

/// A named server extension. Components are constructed during startup and
/// live for the life of the server.
#[async_trait]
pub trait Component: Send + Sync + 'static {
    /// Called once after the server starts accepting connections, in load
    /// order. Failures are logged and do not prevent other components from
    /// being notified.
    async fn on_server_ready(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Component")
    }
}

struct Entry {
    component: Arc<dyn Component>,
    // Second erased clone of the same Arc, kept for typed downcasts.
    any: Arc<dyn Any + Send + Sync>,
}

/// Immutable after startup; share via `Arc`.
#[derive(Default)]
pub struct ComponentRegistry {
    entries: HashMap<String, Entry>,
    order: Vec<String>,
    failed: HashMap<String, String>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert<T: Component>(&mut self, name: &str, component: Arc<T>) {
        let any: Arc<dyn Any + Send + Sync> = component.clone();
        self.insert_erased(name, component, any);
    }

    /// Insert with the type already erased. `any` must be a clone of the
    /// same allocation as `component` for typed lookups to work.
    pub(crate) fn insert_erased(
        &mut self,
        name: &str,
        component: Arc<dyn Component>,
        any: Arc<dyn Any + Send + Sync>,
    ) {
        let entry = Entry { component, any };
        if self.entries.insert(name.to_string(), entry).is_none() {
            self.order.push(name.to_string());
        }
        let _ = self.failed.remove(name);
    }

    pub(crate) fn record_failure(&mut self, name: &str, reason: &str) {
        let _ = self.failed.insert(name.to_string(), reason.to_string());
    }

    /// Look up a component by name. A component that failed to load reports
    /// its load error; an unknown name reports not-loaded.
    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Component>, ServerError> {
        if let Some(entry) = self.entries.get(name) {
            return Ok(entry.component.clone());
        }
        match self.failed.get(name) {
            Some(reason) => Err(ServerError::ComponentLookup(format!(
                "component '{name}' failed to load: {reason}"
            ))),
            None => Err(ServerError::ComponentLookup(format!(
                "component '{name}' is not loaded"
            ))),
        }
    }

    /// Typed lookup for cross-component references.
    pub fn lookup_as<T: Component>(&self, name: &str) -> Result<Arc<T>, ServerError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| match self.failed.get(name) {
                Some(reason) => ServerError::ComponentLookup(format!(
                    "component '{name}' failed to load: {reason}"
                )),
                None => {
                    ServerError::ComponentLookup(format!("component '{name}' is not loaded"))
                }
            })?;
        entry.any.clone().downcast::<T>().map_err(|_| {
            ServerError::ComponentLookup(format!(
                "component '{name}' has a different type than requested"
            ))
        })
    }

    pub fn try_lookup(&self, name: &str) -> Option<Arc<dyn Component>> {
        self.entries.get(name).map(|e| e.component.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Loaded component names in load order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// Load failures by component name.
    pub fn failed(&self) -> &HashMap<String, String> {
        &self.failed
    }

    /// Notify every component, in load order, that the server is up. One
    /// component's failure does not stop the rest.
    pub async fn notify_server_ready(&self) {
        for name in &self.order {
            let Some(entry) = self.entries.get(name) else {
                continue;
            };
            match entry.component.on_server_ready().await {
                Ok(()) => info!(component = %name, "component ready"),
                Err(e) => error!(component = %name, error = %e, "component ready hook failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug)]
    struct Plain;
    impl Component for Plain {}

    struct Counter {
        hits: AtomicUsize,
    }
    impl Component for Counter {}

    #[test]
    fn lookup_distinguishes_missing_from_failed() {
        let mut registry = ComponentRegistry::new();
        registry.insert("plain", Arc::new(Plain));
        registry.record_failure("broken", "config section invalid");

        assert!(registry.lookup("plain").is_ok());

        let missing = registry.lookup("ghost").unwrap_err();
        assert!(matches!(missing, ServerError::ComponentLookup(_)));
        assert!(missing.to_string().contains("not loaded"));
        assert_eq!(missing.http_status(), 503);

        let failed = registry.lookup("broken").unwrap_err();
        assert!(failed.to_string().contains("config section invalid"));
        assert_eq!(failed.http_status(), 503);
    }

    #[test]
    fn typed_lookup_downcasts() {
        let mut registry = ComponentRegistry::new();
        let counter = Arc::new(Counter {
            hits: AtomicUsize::new(7),
        });
        registry.insert("counter", counter);

        let found: Arc<Counter> = registry.lookup_as("counter").unwrap();
        assert_eq!(found.hits.load(Ordering::SeqCst), 7);

        let wrong = registry.lookup_as::<Plain>("counter").unwrap_err();
        assert!(wrong.to_string().contains("different type"));
    }

    #[test]
    fn successful_reload_clears_failure() {
        let mut registry = ComponentRegistry::new();
        registry.record_failure("flaky", "first attempt");
        registry.insert("flaky", Arc::new(Plain));
        assert!(registry.lookup("flaky").is_ok());
        assert!(registry.failed().is_empty());
    }

    struct ReadyProbe {
        log: Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl Component for ReadyProbe {
        async fn on_server_ready(&self) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(self.name);
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn ready_hooks_run_in_load_order_despite_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ComponentRegistry::new();
        for (name, fail) in [("first", false), ("second", true), ("third", false)] {
            registry.insert(
                name,
                Arc::new(ReadyProbe {
                    log: log.clone(),
                    name,
                    fail,
                }),
            );
        }

        registry.notify_server_ready().await;
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
        assert_eq!(registry.names(), ["first", "second", "third"]);
    }
}
