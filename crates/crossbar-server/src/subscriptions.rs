//! Object-state subscriptions: tiered polling, global change detection, and
//! per-connection diff delivery.
//!
//! All mutable subscription state lives behind one async mutex, so every
//! mutation funnels through a single serialized path while provider reads
//! and notification fan-out happen outside it (poll path) or under it
//! (catch-up path, which must be atomic with the merge).

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crossbar_core::{ApiRequest, ConnectionId, ServerError, Transport, Verb};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::StatusConfig;
use crate::dispatcher::ApiDispatcher;
use crate::endpoint::FnHandler;
use crate::notify::NotificationBridge;

/// Field map for one object, as returned by the provider.
pub type ObjectStatus = Map<String, Value>;

/// Requested fields for one object: `None` means all fields.
pub type FieldSet = Option<BTreeSet<String>>;

/// Supplies current field values for named objects on demand. Implemented
/// by the device-control integration; the server core never talks to
/// hardware directly.
#[async_trait]
pub trait ObjectDataProvider: Send + Sync {
    /// Names of all queryable objects.
    async fn list_objects(&self) -> Result<Vec<String>, ServerError>;

    /// Full current field maps for the named objects. Unknown names are
    /// omitted from the result.
    async fn query_objects(
        &self,
        objects: &[String],
    ) -> Result<HashMap<String, ObjectStatus>, ServerError>;
}

#[derive(Default)]
struct SubState {
    /// Per-connection requested object/field sets.
    subs: HashMap<ConnectionId, HashMap<String, FieldSet>>,
    /// Per-connection last-sent values, restricted to fields actually sent.
    last_sent: HashMap<ConnectionId, HashMap<String, ObjectStatus>>,
    /// Last value read from the provider, shared across connections. Used to
    /// skip per-connection diffing when nothing changed at all.
    global: HashMap<String, ObjectStatus>,
}

/// Tracks subscriptions, runs the tiered poll loop, and pushes diffs.
pub struct SubscriptionManager {
    provider: Arc<dyn ObjectDataProvider>,
    notify: Arc<NotificationBridge>,
    status: StatusConfig,
    state: Mutex<SubState>,
}

impl SubscriptionManager {
    pub fn new(
        provider: Arc<dyn ObjectDataProvider>,
        notify: Arc<NotificationBridge>,
        status: StatusConfig,
    ) -> Self {
        Self {
            provider,
            notify,
            status,
            state: Mutex::new(SubState::default()),
        }
    }

    /// Register the object API endpoints. Subscribe/unsubscribe need an
    /// originating connection, so they are not exposed over plain HTTP.
    pub fn register_endpoints(
        self: &Arc<Self>,
        dispatcher: &mut ApiDispatcher,
    ) -> Result<(), ServerError> {
        let mgr = Arc::clone(self);
        dispatcher.register_endpoint(
            "machine/objects/list",
            &[Verb::Get],
            FnHandler(move |_req: ApiRequest| {
                let mgr = Arc::clone(&mgr);
                async move {
                    let objects = mgr.provider.list_objects().await?;
                    Ok(json!({ "objects": objects }))
                }
            }),
        )?;

        let mgr = Arc::clone(self);
        dispatcher.register_endpoint(
            "machine/objects/query",
            &[Verb::Post],
            FnHandler(move |req: ApiRequest| {
                let mgr = Arc::clone(&mgr);
                async move {
                    let requested = parse_object_map(required_objects(&req)?)?;
                    mgr.query(requested).await
                }
            }),
        )?;

        let mgr = Arc::clone(self);
        dispatcher.register_endpoint_with(
            "machine/objects/subscribe",
            &[Verb::Post],
            &[Transport::Ws, Transport::Mqtt],
            true,
            FnHandler(move |req: ApiRequest| {
                let mgr = Arc::clone(&mgr);
                async move {
                    let connection = req.connection.clone().ok_or_else(|| {
                        ServerError::invalid_argument(
                            "subscriptions require a socket or broker connection",
                        )
                    })?;
                    let requested = parse_object_map(required_objects(&req)?)?;
                    mgr.subscribe(&connection, requested).await
                }
            }),
        )?;

        let mgr = Arc::clone(self);
        dispatcher.register_endpoint_with(
            "machine/objects/unsubscribe",
            &[Verb::Post],
            &[Transport::Ws, Transport::Mqtt],
            true,
            FnHandler(move |req: ApiRequest| {
                let mgr = Arc::clone(&mgr);
                async move {
                    let connection = req.connection.clone().ok_or_else(|| {
                        ServerError::invalid_argument(
                            "subscriptions require a socket or broker connection",
                        )
                    })?;
                    let objects = match req.args.raw("objects") {
                        Some(value) => Some(object_name_list(value)?),
                        None => None,
                    };
                    mgr.unsubscribe(&connection, objects).await;
                    Ok(json!("ok"))
                }
            }),
        )?;

        Ok(())
    }

    /// One-shot read restricted to the requested objects/fields.
    pub async fn query(
        &self,
        requested: HashMap<String, FieldSet>,
    ) -> Result<Value, ServerError> {
        let names: Vec<String> = requested.keys().cloned().collect();
        let data = self.provider.query_objects(&names).await?;
        validate_known(&requested, &data)?;
        Ok(json!({
            "eventtime": unix_now(),
            "status": restrict(&requested, &data),
        }))
    }

    /// Merge the requested object/field sets into the connection's
    /// subscription and return a full catch-up snapshot of the merged set.
    /// The snapshot is always complete current state, never a diff.
    pub async fn subscribe(
        &self,
        connection: &ConnectionId,
        requested: HashMap<String, FieldSet>,
    ) -> Result<Value, ServerError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        // Merge into a scratch copy so a failed validation leaves the
        // existing subscription untouched.
        let mut merged = state.subs.get(connection).cloned().unwrap_or_default();
        for (object, fields) in requested.iter() {
            match merged.get_mut(object) {
                Some(existing) => merge_fields(existing, fields),
                None => {
                    let _ = merged.insert(object.clone(), fields.clone());
                }
            }
        }

        let names: Vec<String> = merged.keys().cloned().collect();
        // Catch-up read happens under the lock: it must be atomic with the
        // merge, and this also keeps the provider from being re-entered by a
        // concurrent poll tick for the same objects.
        let data = self.provider.query_objects(&names).await?;
        validate_known(&requested, &data)?;

        for (object, fields) in &data {
            let _ = state.global.insert(object.clone(), fields.clone());
        }

        let status = restrict(&merged, &data);
        let sent = state.last_sent.entry(connection.clone()).or_default();
        sent.clear();
        for (object, fields) in &status {
            if let Value::Object(fields) = fields {
                let _ = sent.insert(object.clone(), fields.clone());
            }
        }
        let _ = state.subs.insert(connection.clone(), merged);

        debug!(conn_id = %connection, objects = names.len(), "subscription updated");
        Ok(json!({
            "eventtime": unix_now(),
            "status": Value::Object(status),
        }))
    }

    /// Remove the named objects (or the whole subscription) and drop the
    /// corresponding last-sent entries.
    pub async fn unsubscribe(&self, connection: &ConnectionId, objects: Option<Vec<String>>) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        match objects {
            None => {
                let _ = state.subs.remove(connection);
                let _ = state.last_sent.remove(connection);
            }
            Some(names) => {
                let empty = match state.subs.get_mut(connection) {
                    Some(sub) => {
                        for name in &names {
                            let _ = sub.remove(name);
                            if let Some(sent) = state.last_sent.get_mut(connection) {
                                let _ = sent.remove(name);
                            }
                        }
                        sub.is_empty()
                    }
                    None => false,
                };
                if empty {
                    let _ = state.subs.remove(connection);
                    let _ = state.last_sent.remove(connection);
                }
            }
        }
    }

    /// Tear down all subscription state for a closed connection.
    pub async fn on_disconnect(&self, connection: &ConnectionId) {
        let mut state = self.state.lock().await;
        if state.subs.remove(connection).is_some() {
            let _ = state.last_sent.remove(connection);
            debug!(conn_id = %connection, "dropped subscription state");
        }
    }

    /// Spawn one poll task per tier. Tier `k` ticks every
    /// `base_tick * multiplier(k)`; each tier is serialized against itself
    /// because a single task owns its loop.
    pub fn start_poll_loops(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        (1..=self.status.num_tiers.max(1))
            .map(|tier| {
                let mgr = Arc::clone(self);
                let period = Duration::from_millis(
                    mgr.status.base_tick_ms * StatusConfig::tier_multiplier(tier),
                );
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        mgr.poll_tier(tier).await;
                    }
                })
            })
            .collect()
    }

    /// One poll pass for a tier: read current values, detect changes against
    /// the global snapshot, then build and push per-connection diffs.
    pub async fn poll_tier(&self, tier: u32) {
        let objects: Vec<String> = {
            let state = self.state.lock().await;
            let mut names = BTreeSet::new();
            for sub in state.subs.values() {
                for object in sub.keys() {
                    if self.status.tier_of(object) == tier {
                        let _ = names.insert(object.clone());
                    }
                }
            }
            names.into_iter().collect()
        };
        if objects.is_empty() {
            return;
        }

        let data = match self.provider.query_objects(&objects).await {
            Ok(data) => data,
            Err(e) => {
                warn!(tier, error = %e, "object poll failed");
                return;
            }
        };
        let eventtime = unix_now();

        let payloads = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            // Cheap global check first: fields that changed at all since the
            // last read, regardless of who is subscribed.
            let mut changed: HashMap<String, Vec<(String, Value)>> = HashMap::new();
            for (object, new_fields) in &data {
                let mut fields_changed = Vec::new();
                {
                    let old = state.global.get(object);
                    let mut keys: BTreeSet<&String> = new_fields.keys().collect();
                    if let Some(old) = old {
                        keys.extend(old.keys());
                    }
                    for key in keys {
                        let new_value = new_fields.get(key.as_str());
                        let old_value = old.and_then(|m| m.get(key.as_str()));
                        if new_value != old_value {
                            fields_changed
                                .push((key.clone(), new_value.cloned().unwrap_or(Value::Null)));
                        }
                    }
                }
                // The global snapshot tracks every poll read unconditionally.
                let _ = state.global.insert(object.clone(), new_fields.clone());
                if !fields_changed.is_empty() {
                    let _ = changed.insert(object.clone(), fields_changed);
                }
            }
            if changed.is_empty() {
                Vec::new()
            } else {
                build_diffs(state, &changed, eventtime)
            }
        };

        for (connection, params) in payloads {
            self.notify
                .send_to(&connection, "notify_status_update", params);
        }
    }
}

/// Per-connection diffs for the globally-changed fields. Updates each
/// connection's last-sent snapshot for exactly the fields it is sent.
fn build_diffs(
    state: &mut SubState,
    changed: &HashMap<String, Vec<(String, Value)>>,
    eventtime: f64,
) -> Vec<(ConnectionId, Vec<Value>)> {
    let connections: Vec<ConnectionId> = state.subs.keys().cloned().collect();
    let mut payloads = Vec::new();

    for connection in connections {
        let mut updates: Vec<(String, Vec<(String, Value)>)> = Vec::new();
        if let Some(sub) = state.subs.get(&connection) {
            for (object, fields_changed) in changed {
                let Some(requested) = sub.get(object) else {
                    continue;
                };
                let mut delta = Vec::new();
                for (field, new_value) in fields_changed {
                    let wanted = requested
                        .as_ref()
                        .map_or(true, |fields| fields.contains(field));
                    if !wanted {
                        continue;
                    }
                    let last = state
                        .last_sent
                        .get(&connection)
                        .and_then(|sent| sent.get(object))
                        .and_then(|fields| fields.get(field));
                    if last != Some(new_value) {
                        delta.push((field.clone(), new_value.clone()));
                    }
                }
                if !delta.is_empty() {
                    updates.push((object.clone(), delta));
                }
            }
        }
        // Zero changed fields for this connection: no notification at all.
        if updates.is_empty() {
            continue;
        }

        let sent = state.last_sent.entry(connection.clone()).or_default();
        let mut diff = Map::new();
        for (object, delta) in updates {
            let sent_fields = sent.entry(object.clone()).or_default();
            let mut wire_fields = Map::new();
            for (field, value) in delta {
                let _ = sent_fields.insert(field.clone(), value.clone());
                let _ = wire_fields.insert(field, value);
            }
            let _ = diff.insert(object, Value::Object(wire_fields));
        }
        payloads.push((connection, vec![Value::Object(diff), json!(eventtime)]));
    }
    payloads
}

/// Union-merge one object's requested fields; "all fields" subsumes any
/// explicit subset.
fn merge_fields(existing: &mut FieldSet, incoming: &FieldSet) {
    match (existing.as_mut(), incoming) {
        (None, _) => {}
        (Some(_), None) => *existing = None,
        (Some(current), Some(new)) => current.extend(new.iter().cloned()),
    }
}

/// Parse the wire shape `{"objects": {name: null | [field, ...]}}`. `null`
/// and the empty list both mean "all fields".
pub fn parse_object_map(value: &Value) -> Result<HashMap<String, FieldSet>, ServerError> {
    let map = value
        .as_object()
        .ok_or_else(|| ServerError::invalid_argument("'objects' must be an object"))?;
    let mut requested = HashMap::new();
    for (name, fields) in map {
        let fields = match fields {
            Value::Null => None,
            Value::Array(list) => {
                let mut set = BTreeSet::new();
                for field in list {
                    let field = field.as_str().ok_or_else(|| {
                        ServerError::invalid_argument(format!(
                            "field list for '{name}' must contain strings"
                        ))
                    })?;
                    let _ = set.insert(field.to_string());
                }
                if set.is_empty() {
                    None
                } else {
                    Some(set)
                }
            }
            _ => {
                return Err(ServerError::invalid_argument(format!(
                    "fields for '{name}' must be null or a list"
                )))
            }
        };
        let _ = requested.insert(name.clone(), fields);
    }
    Ok(requested)
}

fn required_objects(req: &ApiRequest) -> Result<&Value, ServerError> {
    req.args
        .raw("objects")
        .ok_or_else(|| ServerError::invalid_argument("missing required argument 'objects'"))
}

fn object_name_list(value: &Value) -> Result<Vec<String>, ServerError> {
    match value {
        Value::Array(list) => list
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| ServerError::invalid_argument("object names must be strings"))
            })
            .collect(),
        // Accept the subscription map shape too; only the names matter.
        Value::Object(map) => Ok(map.keys().cloned().collect()),
        _ => Err(ServerError::invalid_argument(
            "'objects' must be a list or object",
        )),
    }
}

fn validate_known(
    requested: &HashMap<String, FieldSet>,
    data: &HashMap<String, ObjectStatus>,
) -> Result<(), ServerError> {
    for name in requested.keys() {
        if !data.contains_key(name) {
            return Err(ServerError::invalid_argument(format!(
                "unknown object '{name}'"
            )));
        }
    }
    Ok(())
}

/// Snapshot restricted to the requested objects/fields. Requested fields the
/// provider does not report are omitted.
fn restrict(
    requested: &HashMap<String, FieldSet>,
    data: &HashMap<String, ObjectStatus>,
) -> Map<String, Value> {
    let mut status = Map::new();
    for (object, fields) in requested {
        let Some(full) = data.get(object) else {
            continue;
        };
        let picked: Map<String, Value> = match fields {
            None => full.clone(),
            Some(set) => full
                .iter()
                .filter(|(k, _)| set.contains(k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        let _ = status.insert(object.clone(), Value::Object(picked));
    }
    status
}

fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
