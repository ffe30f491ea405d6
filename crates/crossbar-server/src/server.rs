//! Server assembly: component loading, built-in endpoints, and transport
//! startup.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crossbar_core::{ApiRequest, ServerError, Verb};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::components::{Component, ComponentRegistry};
use crate::config::ServerConfig;
use crate::dispatcher::ApiDispatcher;
use crate::endpoint::{EndpointHandler, FnHandler};
use crate::events::EventBus;
use crate::notify::NotificationBridge;
use crate::subscriptions::{ObjectDataProvider, SubscriptionManager};
use crate::transport::http::{build_router, AppState};
use crate::transport::mqtt;
use crate::transport::ws::ConnectionRegistry;

struct LoadedComponent {
    component: Arc<dyn Component>,
    any: Arc<dyn Any + Send + Sync>,
}

impl LoadedComponent {
    fn new<T: Component>(component: Arc<T>) -> Self {
        let any: Arc<dyn Any + Send + Sync> = component.clone();
        Self { component, any }
    }
}

type ComponentFactory =
    Box<dyn FnOnce(&mut LoadContext<'_>) -> Result<LoadedComponent, ServerError> + Send>;

/// Passed to component factories during startup. Components use it to
/// register their endpoints, event handlers, and notifications, and to
/// obtain other components they depend on.
pub struct LoadContext<'a> {
    config: &'a ServerConfig,
    dispatcher: &'a mut ApiDispatcher,
    events: &'a Arc<EventBus>,
    notify: &'a Arc<NotificationBridge>,
    registry: &'a mut ComponentRegistry,
    factories: &'a mut HashMap<String, ComponentFactory>,
    load_stack: Vec<String>,
}

impl LoadContext<'_> {
    pub fn config(&self) -> &ServerConfig {
        self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        self.events
    }

    pub fn register_endpoint<H>(
        &mut self,
        path: &str,
        verbs: &[Verb],
        handler: H,
    ) -> Result<(), ServerError>
    where
        H: EndpointHandler + 'static,
    {
        self.dispatcher.register_endpoint(path, verbs, handler)
    }

    pub fn register_endpoint_with<H>(
        &mut self,
        path: &str,
        verbs: &[Verb],
        transports: &[crossbar_core::Transport],
        wrap_result: bool,
        handler: H,
    ) -> Result<(), ServerError>
    where
        H: EndpointHandler + 'static,
    {
        self.dispatcher
            .register_endpoint_with(path, verbs, transports, wrap_result, handler)
    }

    /// Bridge a bus event to a client notification; see
    /// [`NotificationBridge::register_notification`].
    pub fn register_notification(&self, event: &str, notify_name: Option<&str>) {
        self.notify.register_notification(event, notify_name);
    }

    /// Load a component this one depends on, running its factory if it has
    /// not loaded yet. Dependency cycles are a startup error.
    pub fn load_component(&mut self, name: &str) -> Result<Arc<dyn Component>, ServerError> {
        if self.registry.contains(name) {
            return self.registry.lookup(name);
        }
        if self.load_stack.iter().any(|loading| loading == name) {
            let mut chain = self.load_stack.clone();
            chain.push(name.to_string());
            return Err(ServerError::ComponentLoad {
                name: name.to_string(),
                reason: format!("circular dependency: {}", chain.join(" -> ")),
            });
        }
        let Some(factory) = self.factories.remove(name) else {
            let reason = "no such component".to_string();
            self.registry.record_failure(name, &reason);
            return Err(ServerError::ComponentLoad {
                name: name.to_string(),
                reason,
            });
        };

        self.load_stack.push(name.to_string());
        let result = factory(self);
        let _ = self.load_stack.pop();

        match result {
            Ok(loaded) => {
                self.registry
                    .insert_erased(name, loaded.component.clone(), loaded.any);
                info!(component = %name, "component loaded");
                Ok(loaded.component)
            }
            Err(e) => {
                self.registry.record_failure(name, &e.to_string());
                Err(ServerError::ComponentLoad {
                    name: name.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Typed lookup of an already-loaded component.
    pub fn lookup_component<T: Component>(&self, name: &str) -> Result<Arc<T>, ServerError> {
        self.registry.lookup_as(name)
    }
}

/// Builds an [`ApiServer`] from configuration, a data provider, and a set
/// of named component factories.
pub struct ServerBuilder {
    config: ServerConfig,
    provider: Option<Arc<dyn ObjectDataProvider>>,
    factories: HashMap<String, ComponentFactory>,
}

impl ServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            provider: None,
            factories: HashMap::new(),
        }
    }

    pub fn provider(mut self, provider: Arc<dyn ObjectDataProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Register a component factory. The factory runs during `build` if the
    /// component is listed in `config.components` or another component loads
    /// it as a dependency.
    pub fn register_component<T, F>(mut self, name: &str, factory: F) -> Self
    where
        T: Component,
        F: FnOnce(&mut LoadContext<'_>) -> Result<Arc<T>, ServerError> + Send + 'static,
    {
        let erased: ComponentFactory = Box::new(move |cx| factory(cx).map(LoadedComponent::new));
        let _ = self.factories.insert(name.to_string(), erased);
        self
    }

    /// Load components and assemble the server. Component load failures are
    /// recorded and logged but do not abort startup; a broken optional
    /// component must not take the whole API down.
    pub fn build(self) -> Result<ApiServer, ServerError> {
        let Self {
            config,
            provider,
            mut factories,
        } = self;
        let provider = provider
            .ok_or_else(|| ServerError::Config("no object data provider configured".into()))?;

        let mut dispatcher = ApiDispatcher::new(Duration::from_secs(config.handler_timeout_secs));
        let events = Arc::new(EventBus::new());
        let connections = Arc::new(ConnectionRegistry::new(config.max_send_queue));
        let notify = Arc::new(NotificationBridge::new(
            Arc::clone(&events),
            Arc::clone(&connections),
        ));
        let mut registry = ComponentRegistry::new();

        {
            let mut cx = LoadContext {
                config: &config,
                dispatcher: &mut dispatcher,
                events: &events,
                notify: &notify,
                registry: &mut registry,
                factories: &mut factories,
                load_stack: Vec::new(),
            };
            for name in &config.components {
                if let Err(e) = cx.load_component(name) {
                    error!(component = %name, error = %e, "component failed to load");
                }
            }
        }
        let registry = Arc::new(registry);

        let subscriptions = Arc::new(SubscriptionManager::new(
            provider,
            Arc::clone(&notify),
            config.status.clone(),
        ));
        subscriptions.register_endpoints(&mut dispatcher)?;
        register_server_endpoints(&mut dispatcher, &registry, &connections, &config)?;

        notify.register_notification("server:ready", Some("notify_server_ready"));

        Ok(ApiServer {
            config,
            dispatcher: Arc::new(dispatcher),
            events,
            connections,
            notify,
            subscriptions,
            components: registry,
        })
    }
}

fn register_server_endpoints(
    dispatcher: &mut ApiDispatcher,
    registry: &Arc<ComponentRegistry>,
    connections: &Arc<ConnectionRegistry>,
    config: &ServerConfig,
) -> Result<(), ServerError> {
    // The method list is only complete once every endpoint is registered,
    // so handlers read it from a slot filled at the end of this pass.
    let methods: Arc<OnceLock<Vec<String>>> = Arc::new(OnceLock::new());

    let started = Instant::now();
    let info_registry = Arc::clone(registry);
    let info_connections = Arc::clone(connections);
    let info_methods = Arc::clone(&methods);
    let instance = config.mqtt.instance_name.clone();
    dispatcher.register_endpoint(
        "server/info",
        &[Verb::Get],
        FnHandler(move |_req: ApiRequest| {
            let registry = Arc::clone(&info_registry);
            let connections = Arc::clone(&info_connections);
            let methods = Arc::clone(&info_methods);
            let instance = instance.clone();
            async move {
                Ok(json!({
                    "instance_name": instance,
                    "state": "ready",
                    "components": registry.names(),
                    "failed_components": registry.failed(),
                    "registered_methods": methods.get().map_or(0, Vec::len),
                    "websocket_connections": connections.count(),
                    "uptime": started.elapsed().as_secs_f64(),
                }))
            }
        }),
    )?;

    let methods_slot = Arc::clone(&methods);
    dispatcher.register_endpoint(
        "server/methods",
        &[Verb::Get],
        FnHandler(move |_req: ApiRequest| {
            let methods = Arc::clone(&methods_slot);
            async move {
                Ok(json!({
                    "methods": methods.get().cloned().unwrap_or_default(),
                }))
            }
        }),
    )?;
    let _ = methods.set(dispatcher.methods());
    Ok(())
}

/// A fully assembled server, not yet accepting connections.
pub struct ApiServer {
    config: ServerConfig,
    dispatcher: Arc<ApiDispatcher>,
    events: Arc<EventBus>,
    connections: Arc<ConnectionRegistry>,
    notify: Arc<NotificationBridge>,
    subscriptions: Arc<SubscriptionManager>,
    components: Arc<ComponentRegistry>,
}

impl std::fmt::Debug for ApiServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiServer").finish_non_exhaustive()
    }
}

impl ApiServer {
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn components(&self) -> &Arc<ComponentRegistry> {
        &self.components
    }

    pub fn notify(&self) -> &Arc<NotificationBridge> {
        &self.notify
    }

    pub fn dispatcher(&self) -> &Arc<ApiDispatcher> {
        &self.dispatcher
    }

    /// Bind the listener, start the transports and poll loops, then fire
    /// `server:ready` and the component ready hooks.
    pub async fn start(self) -> Result<ServerHandle, ServerError> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|e| {
                ServerError::Transport(format!(
                    "bind {}:{}: {e}",
                    self.config.host, self.config.port
                ))
            })?;
        let addr = listener
            .local_addr()
            .map_err(|e| ServerError::Transport(e.to_string()))?;

        let router = build_router(AppState {
            dispatcher: Arc::clone(&self.dispatcher),
            connections: Arc::clone(&self.connections),
            subscriptions: Arc::clone(&self.subscriptions),
            heartbeat_interval: Duration::from_secs(self.config.heartbeat_interval_secs),
        });
        let http_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!(error = %e, "http server exited");
            }
        });

        let mut tasks = self.subscriptions.start_poll_loops();
        tasks.push(http_task);
        if self.config.mqtt.enabled {
            tasks.push(mqtt::start(
                self.config.mqtt.clone(),
                Arc::clone(&self.dispatcher),
                Arc::clone(&self.notify),
            ));
        }

        info!(%addr, "server listening");
        self.events.send_event_and_wait("server:ready", vec![]).await;
        self.components.notify_server_ready().await;

        Ok(ServerHandle { addr, tasks })
    }
}

/// Running server: the bound address plus the background tasks.
pub struct ServerHandle {
    addr: std::net::SocketAddr,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}
