//! In-process publish/subscribe keyed by exact event name.
//!
//! Event names follow the `"component:description"` convention. Callbacks
//! for one event fire strictly in registration order within a single
//! emission; independent emissions run on separate tasks and may interleave
//! when a callback suspends.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::warn;

/// Positional arguments carried by an event, shared across callbacks.
pub type EventArgs = Arc<Vec<Value>>;

type EventCallback = Arc<dyn Fn(EventArgs) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Ordered-list-per-key event bus.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<String, Vec<EventCallback>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback to the event's ordered list.
    pub fn register_event_handler<F, Fut>(&self, event: &str, callback: F)
    where
        F: Fn(EventArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback: EventCallback = Arc::new(move |args| Box::pin(callback(args)));
        self.handlers
            .write()
            .entry(event.to_string())
            .or_default()
            .push(callback);
    }

    /// Fire-and-forget emission. Callbacks run sequentially in registration
    /// order on a spawned task; a failing callback is logged and never stops
    /// its siblings or reaches the caller.
    pub fn send_event(&self, event: &str, args: Vec<Value>) {
        let callbacks = {
            let handlers = self.handlers.read();
            match handlers.get(event) {
                Some(list) => list.clone(),
                None => return,
            }
        };
        let event = event.to_string();
        let args: EventArgs = Arc::new(args);
        tokio::spawn(async move {
            run_callbacks(&event, callbacks, args).await;
        });
    }

    /// Emission that completes only after every callback has run. Used where
    /// startup needs ordering guarantees (e.g. `server:ready`).
    pub async fn send_event_and_wait(&self, event: &str, args: Vec<Value>) {
        let callbacks = {
            let handlers = self.handlers.read();
            match handlers.get(event) {
                Some(list) => list.clone(),
                None => return,
            }
        };
        run_callbacks(event, callbacks, Arc::new(args)).await;
    }

    /// Number of callbacks registered for an event.
    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.read().get(event).map_or(0, Vec::len)
    }
}

async fn run_callbacks(event: &str, callbacks: Vec<EventCallback>, args: EventArgs) {
    for callback in callbacks {
        if let Err(e) = callback(args.clone()).await {
            warn!(event, error = %e, "event callback failed");
        }
    }
}

/// The description part of a `"component:description"` event name.
pub fn event_description(event: &str) -> &str {
    event.split_once(':').map_or(event, |(_, desc)| desc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn callbacks_fire_in_registration_order() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for i in 0..3 {
            let tx = tx.clone();
            bus.register_event_handler("server:ready", move |_args| {
                let tx = tx.clone();
                async move {
                    tx.send(i).ok();
                    Ok(())
                }
            });
        }

        bus.send_event_and_wait("server:ready", vec![]).await;

        assert_eq!(rx.recv().await, Some(0));
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn args_passed_positionally() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        bus.register_event_handler("machine:state_changed", move |args: EventArgs| {
            let tx = tx.clone();
            async move {
                tx.send(args.to_vec()).ok();
                Ok(())
            }
        });

        bus.send_event_and_wait("machine:state_changed", vec![json!("ready"), json!(2)])
            .await;

        assert_eq!(rx.recv().await.unwrap(), vec![json!("ready"), json!(2)]);
    }

    #[tokio::test]
    async fn failing_callback_does_not_stop_siblings() {
        let bus = EventBus::new();
        let first_ran = Arc::new(AtomicUsize::new(0));
        let third_ran = Arc::new(AtomicUsize::new(0));

        {
            let first_ran = first_ran.clone();
            bus.register_event_handler("server:ready", move |_| {
                let first_ran = first_ran.clone();
                async move {
                    first_ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }
        bus.register_event_handler("server:ready", |_| async {
            anyhow::bail!("callback exploded")
        });
        {
            let third_ran = third_ran.clone();
            bus.register_event_handler("server:ready", move |_| {
                let third_ran = third_ran.clone();
                async move {
                    third_ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }

        // Must not panic or propagate the failure.
        bus.send_event_and_wait("server:ready", vec![]).await;

        assert_eq!(first_ran.load(Ordering::SeqCst), 1);
        assert_eq!(third_ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_event_is_fire_and_forget() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        bus.register_event_handler("server:ready", move |_| {
            let tx = tx.clone();
            async move {
                tx.send(()).ok();
                Ok(())
            }
        });

        bus.send_event("server:ready", vec![]);
        // Returns immediately; the callback still runs.
        rx.recv().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_event_is_a_noop() {
        let bus = EventBus::new();
        bus.send_event("nobody:listens", vec![json!(1)]);
        bus.send_event_and_wait("nobody:listens", vec![]).await;
        assert_eq!(bus.handler_count("nobody:listens"), 0);
    }

    #[test]
    fn no_wildcard_matching() {
        let bus = EventBus::new();
        bus.register_event_handler("machine:state_changed", |_| async { Ok(()) });
        assert_eq!(bus.handler_count("machine:state_changed"), 1);
        assert_eq!(bus.handler_count("machine:*"), 0);
        assert_eq!(bus.handler_count("machine"), 0);
    }

    #[test]
    fn description_part() {
        assert_eq!(event_description("server:ready"), "ready");
        assert_eq!(event_description("machine:state_changed"), "state_changed");
        // No separator: the whole name is the description.
        assert_eq!(event_description("ready"), "ready");
    }
}
