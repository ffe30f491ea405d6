//! Endpoint registration table and async dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbar_core::rpc::{RpcRequest, RpcResponse};
use crossbar_core::{ApiRequest, ConnectionId, RequestArgs, ServerError, Transport, Verb};
use serde_json::Value;
use tracing::warn;

use crate::endpoint::{normalize_path, rpc_method_name, Endpoint, EndpointHandler};

/// One derived RPC method: its endpoint and the verb it maps back to.
pub struct RpcMethod {
    pub endpoint: Arc<Endpoint>,
    pub verb: Verb,
}

/// Routing table mapping `(path, verb)` and derived RPC method names to
/// handlers. Populated during startup registration, immutable afterward.
pub struct ApiDispatcher {
    routes: HashMap<(String, Verb), Arc<Endpoint>>,
    rpc_methods: HashMap<String, RpcMethod>,
    endpoints: Vec<Arc<Endpoint>>,
    handler_timeout: Duration,
}

impl ApiDispatcher {
    pub fn new(handler_timeout: Duration) -> Self {
        Self {
            routes: HashMap::new(),
            rpc_methods: HashMap::new(),
            endpoints: Vec::new(),
            handler_timeout,
        }
    }

    /// Register an endpoint on all three transports with result wrapping.
    pub fn register_endpoint<H>(
        &mut self,
        path: &str,
        verbs: &[Verb],
        handler: H,
    ) -> Result<(), ServerError>
    where
        H: EndpointHandler + 'static,
    {
        self.register_endpoint_with(path, verbs, &Transport::ALL, true, handler)
    }

    /// Full registration form: explicit transport set and `wrap_result`.
    pub fn register_endpoint_with<H>(
        &mut self,
        path: &str,
        verbs: &[Verb],
        transports: &[Transport],
        wrap_result: bool,
        handler: H,
    ) -> Result<(), ServerError>
    where
        H: EndpointHandler + 'static,
    {
        if verbs.is_empty() {
            return Err(ServerError::Config(format!(
                "endpoint '{path}' registered with an empty verb set"
            )));
        }
        let path = normalize_path(path);
        for verb in verbs {
            if self.routes.contains_key(&(path.clone(), *verb)) {
                return Err(ServerError::Config(format!(
                    "endpoint '{path}' already registered for {verb}"
                )));
            }
        }
        let multi_verb = verbs.len() > 1;
        let mut method_names = Vec::with_capacity(verbs.len());
        for verb in verbs {
            let name = rpc_method_name(&path, *verb, multi_verb);
            if self.rpc_methods.contains_key(&name)
                || method_names.iter().any(|(existing, _)| *existing == name)
            {
                return Err(ServerError::Config(format!(
                    "RPC method '{name}' already registered"
                )));
            }
            method_names.push((name, *verb));
        }

        let endpoint = Arc::new(Endpoint {
            path: path.clone(),
            verbs: verbs.to_vec(),
            transports: transports.to_vec(),
            wrap_result,
            handler: Arc::new(handler),
        });
        for verb in verbs {
            let _ = self
                .routes
                .insert((path.clone(), *verb), endpoint.clone());
        }
        for (name, verb) in method_names {
            let _ = self.rpc_methods.insert(
                name,
                RpcMethod {
                    endpoint: endpoint.clone(),
                    verb,
                },
            );
        }
        self.endpoints.push(endpoint);
        Ok(())
    }

    /// Direct `(path, verb)` lookup, used by the HTTP adapter.
    pub fn route(&self, path: &str, verb: Verb) -> Option<Arc<Endpoint>> {
        self.routes.get(&(normalize_path(path), verb)).cloned()
    }

    /// RPC method lookup, used by the socket and broker adapters.
    pub fn rpc_method(&self, name: &str) -> Option<&RpcMethod> {
        self.rpc_methods.get(name)
    }

    /// All registered endpoints, in registration order.
    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    /// All derived RPC method names (sorted).
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rpc_methods.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run the endpoint's handler under the execution budget. On timeout the
    /// underlying task keeps running but its late result is discarded.
    pub async fn dispatch(
        &self,
        endpoint: &Endpoint,
        request: ApiRequest,
    ) -> Result<Value, ServerError> {
        let path = request.path.clone();
        let verb = request.verb;
        let start = std::time::Instant::now();

        let result = match tokio::time::timeout(
            self.handler_timeout,
            endpoint.handler.handle(request),
        )
        .await
        {
            Ok(result) => result,
            Err(_elapsed) => {
                warn!(path, %verb, timeout = ?self.handler_timeout, "handler timed out");
                Err(ServerError::Timeout)
            }
        };

        let duration = start.elapsed();
        if duration.as_secs() >= 5 {
            warn!(path, %verb, duration_secs = duration.as_secs_f64(), "slow request");
        }
        result
    }

    /// Dispatch a decoded JSON-RPC request from a socket or broker client.
    ///
    /// Returns `None` for id-less requests (client notifications): there is
    /// no `id` to correlate a response to, so failures are logged instead.
    pub async fn dispatch_rpc(
        &self,
        request: RpcRequest,
        transport: Transport,
        connection: Option<ConnectionId>,
    ) -> Option<RpcResponse> {
        let id = request.id.clone();
        let method = request.method.clone();
        let result = self.dispatch_rpc_inner(request, transport, connection).await;

        match (id, result) {
            (Some(id), Ok(value)) => Some(RpcResponse::success(id, value)),
            (Some(id), Err(err)) => Some(RpcResponse::from_error(id, &err)),
            (None, Ok(_)) => None,
            (None, Err(err)) => {
                warn!(method, error = %err, "error in id-less request, no response sent");
                None
            }
        }
    }

    async fn dispatch_rpc_inner(
        &self,
        request: RpcRequest,
        transport: Transport,
        connection: Option<ConnectionId>,
    ) -> Result<Value, ServerError> {
        let method = self
            .rpc_method(&request.method)
            .ok_or_else(|| ServerError::MethodNotFound(request.method.clone()))?;
        if !method.endpoint.exposed_on(transport) {
            return Err(ServerError::MethodNotFound(request.method));
        }
        let args = RequestArgs::from_params(request.params)?;
        let mut api_request = ApiRequest::new(method.endpoint.path.clone(), method.verb, args);
        api_request.connection = connection;
        self.dispatch(&method.endpoint, api_request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::FnHandler;
    use serde_json::json;

    fn echo_handler() -> FnHandler<impl Fn(ApiRequest) -> futures::future::Ready<Result<Value, ServerError>>> {
        FnHandler(|req: ApiRequest| {
            futures::future::ready(Ok(json!({
                "path": req.path,
                "verb": req.verb.as_str(),
            })))
        })
    }

    fn dispatcher() -> ApiDispatcher {
        ApiDispatcher::new(Duration::from_secs(5))
    }

    fn rpc(method: &str, params: Option<Value>, id: Option<Value>) -> RpcRequest {
        RpcRequest {
            jsonrpc: Some("2.0".into()),
            method: method.into(),
            params,
            id,
        }
    }

    #[test]
    fn empty_verb_set_rejected() {
        let mut d = dispatcher();
        let err = d
            .register_endpoint("server/example", &[], echo_handler())
            .unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));
    }

    #[test]
    fn duplicate_path_verb_rejected() {
        let mut d = dispatcher();
        d.register_endpoint("server/example", &[Verb::Get, Verb::Post], echo_handler())
            .unwrap();
        let err = d
            .register_endpoint("/server/example", &[Verb::Post], echo_handler())
            .unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));
        assert!(err.to_string().contains("POST"));
    }

    #[test]
    fn disjoint_verbs_on_same_path_allowed() {
        let mut d = dispatcher();
        d.register_endpoint("server/example", &[Verb::Get], echo_handler())
            .unwrap();
        // Same path, different verb: fine, but new method name must not clash.
        d.register_endpoint_with(
            "server/other",
            &[Verb::Post],
            &Transport::ALL,
            true,
            echo_handler(),
        )
        .unwrap();
        assert!(d.route("server/example", Verb::Get).is_some());
        assert!(d.route("server/example", Verb::Post).is_none());
    }

    #[test]
    fn three_verbs_derive_three_methods() {
        let mut d = dispatcher();
        d.register_endpoint(
            "server/example",
            &[Verb::Get, Verb::Post, Verb::Delete],
            echo_handler(),
        )
        .unwrap();
        let methods = d.methods();
        assert_eq!(
            methods,
            vec![
                "server.delete_example",
                "server.get_example",
                "server.post_example"
            ]
        );
    }

    #[tokio::test]
    async fn scenario_missing_delete_method() {
        // Registered with GET and POST only: delete_example must not exist.
        let mut d = dispatcher();
        d.register_endpoint("server/example", &[Verb::Get, Verb::Post], echo_handler())
            .unwrap();

        assert!(d.rpc_method("server.get_example").is_some());
        assert!(d.rpc_method("server.post_example").is_some());

        let resp = d
            .dispatch_rpc(
                rpc("server.delete_example", None, Some(json!(1))),
                Transport::Ws,
                None,
            )
            .await
            .unwrap();
        let err = resp.error.unwrap();
        assert_eq!(err.code, crossbar_core::rpc::METHOD_NOT_FOUND);
        assert!(err.message.contains("server.delete_example"));
    }

    #[tokio::test]
    async fn rpc_dispatch_recovers_verb() {
        let mut d = dispatcher();
        d.register_endpoint("server/example", &[Verb::Get, Verb::Post], echo_handler())
            .unwrap();

        let resp = d
            .dispatch_rpc(
                rpc("server.post_example", None, Some(json!("r1"))),
                Transport::Ws,
                None,
            )
            .await
            .unwrap();
        assert_eq!(resp.id, json!("r1"));
        let result = resp.result.unwrap();
        assert_eq!(result["verb"], "POST");
        assert_eq!(result["path"], "server/example");
    }

    #[tokio::test]
    async fn transport_restriction_hides_method() {
        let mut d = dispatcher();
        d.register_endpoint_with(
            "machine/objects/subscribe",
            &[Verb::Post],
            &[Transport::Ws, Transport::Mqtt],
            true,
            echo_handler(),
        )
        .unwrap();

        let ok = d
            .dispatch_rpc(
                rpc("machine.objects.subscribe", None, Some(json!(1))),
                Transport::Ws,
                None,
            )
            .await
            .unwrap();
        assert!(ok.result.is_some());

        // HTTP route lookup still resolves, but transport gating applies to
        // the RPC surface only through dispatch_rpc; the HTTP adapter skips
        // non-HTTP endpoints when building its router.
        let hidden = d
            .dispatch_rpc(
                rpc("machine.objects.subscribe", None, Some(json!(2))),
                Transport::Http,
                None,
            )
            .await
            .unwrap();
        assert_eq!(
            hidden.error.unwrap().code,
            crossbar_core::rpc::METHOD_NOT_FOUND
        );
    }

    #[tokio::test]
    async fn handler_error_becomes_rpc_error() {
        let mut d = dispatcher();
        d.register_endpoint(
            "server/fail",
            &[Verb::Post],
            FnHandler(|_req: ApiRequest| async {
                Err::<Value, _>(ServerError::internal("handler exploded"))
            }),
        )
        .unwrap();

        let resp = d
            .dispatch_rpc(rpc("server.fail", None, Some(json!(3))), Transport::Ws, None)
            .await
            .unwrap();
        let err = resp.error.unwrap();
        assert_eq!(err.code, crossbar_core::rpc::INTERNAL_ERROR);
        assert!(err.message.contains("handler exploded"));
    }

    #[tokio::test]
    async fn id_less_request_gets_no_response() {
        let mut d = dispatcher();
        d.register_endpoint("server/fail", &[Verb::Post], FnHandler(|_req: ApiRequest| async {
            Err::<Value, _>(ServerError::internal("boom"))
        }))
        .unwrap();

        assert!(d
            .dispatch_rpc(rpc("server.fail", None, None), Transport::Ws, None)
            .await
            .is_none());
        assert!(d
            .dispatch_rpc(rpc("no.such.method", None, None), Transport::Ws, None)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn connection_id_threaded_through() {
        let mut d = dispatcher();
        d.register_endpoint(
            "server/whoami",
            &[Verb::Get],
            FnHandler(|req: ApiRequest| async move {
                Ok(json!(req.connection.map(|c| c.to_string())))
            }),
        )
        .unwrap();

        let conn = ConnectionId::new();
        let resp = d
            .dispatch_rpc(
                rpc("server.whoami", None, Some(json!(1))),
                Transport::Ws,
                Some(conn.clone()),
            )
            .await
            .unwrap();
        assert_eq!(resp.result.unwrap(), json!(conn.to_string()));
    }

    #[tokio::test]
    async fn array_params_rejected() {
        let mut d = dispatcher();
        d.register_endpoint("server/example", &[Verb::Post], echo_handler())
            .unwrap();
        let resp = d
            .dispatch_rpc(
                rpc("server.example", Some(json!([1, 2])), Some(json!(1))),
                Transport::Ws,
                None,
            )
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().code, crossbar_core::rpc::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn timeout_discards_late_result() {
        tokio::time::pause();

        let mut d = ApiDispatcher::new(Duration::from_secs(1));
        d.register_endpoint(
            "server/slow",
            &[Verb::Get],
            FnHandler(|_req: ApiRequest| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!("late"))
            }),
        )
        .unwrap();

        let resp = d
            .dispatch_rpc(rpc("server.slow", None, Some(json!(9))), Transport::Ws, None)
            .await
            .unwrap();
        assert_eq!(resp.id, json!(9));
        assert_eq!(resp.error.unwrap().code, crossbar_core::rpc::SERVER_ERROR);
    }

    #[tokio::test]
    async fn concurrent_requests_are_independent() {
        let mut d = dispatcher();
        d.register_endpoint(
            "server/slow",
            &[Verb::Get],
            FnHandler(|_req: ApiRequest| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(json!("slow"))
            }),
        )
        .unwrap();
        d.register_endpoint("server/fast", &[Verb::Get], FnHandler(|_req: ApiRequest| async {
            Ok(json!("fast"))
        }))
        .unwrap();

        let d = Arc::new(d);
        let slow = {
            let d = d.clone();
            tokio::spawn(async move {
                d.dispatch_rpc(
                    RpcRequest {
                        jsonrpc: None,
                        method: "server.slow".into(),
                        params: None,
                        id: Some(json!(1)),
                    },
                    Transport::Ws,
                    None,
                )
                .await
            })
        };
        // The fast request completes while the slow one is still sleeping.
        let fast = d
            .dispatch_rpc(
                RpcRequest {
                    jsonrpc: None,
                    method: "server.fast".into(),
                    params: None,
                    id: Some(json!(2)),
                },
                Transport::Ws,
                None,
            )
            .await
            .unwrap();
        assert_eq!(fast.result.unwrap(), json!("fast"));

        let slow = slow.await.unwrap().unwrap();
        assert_eq!(slow.result.unwrap(), json!("slow"));
    }
}
