//! Endpoint definitions and RPC method-name derivation.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use crossbar_core::{ApiRequest, ServerError, Transport, Verb};
use serde_json::Value;

/// Trait implemented by every endpoint handler.
#[async_trait]
pub trait EndpointHandler: Send + Sync {
    async fn handle(&self, request: ApiRequest) -> Result<Value, ServerError>;
}

/// Adapter so plain async closures can serve as handlers.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> EndpointHandler for FnHandler<F>
where
    F: Fn(ApiRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ServerError>> + Send,
{
    async fn handle(&self, request: ApiRequest) -> Result<Value, ServerError> {
        (self.0)(request).await
    }
}

/// A registered API resource: one path, one or more verbs, one handler,
/// exposed on a set of transports.
pub struct Endpoint {
    /// Path with the leading separator stripped, e.g. `server/info`.
    pub path: String,
    pub verbs: Vec<Verb>,
    pub transports: Vec<Transport>,
    /// When false, HTTP responses return the handler value verbatim instead
    /// of wrapping it as `{"result": value}`.
    pub wrap_result: bool,
    pub handler: Arc<dyn EndpointHandler>,
}

impl Endpoint {
    pub fn exposed_on(&self, transport: Transport) -> bool {
        self.transports.contains(&transport)
    }
}

/// Derive the RPC method name for one (path, verb) pair.
///
/// The leading separator is stripped and remaining separators become `.`.
/// With a single registered verb the method is just the transformed path;
/// with multiple verbs the final segment is prefixed with the lowercase
/// verb: `server/example` + `{GET, POST}` yields `server.get_example` and
/// `server.post_example`. This transform is wire compatibility; it must not
/// change.
pub fn rpc_method_name(path: &str, verb: Verb, multi_verb: bool) -> String {
    let dotted = path.trim_start_matches('/').replace('/', ".");
    if !multi_verb {
        return dotted;
    }
    match dotted.rsplit_once('.') {
        Some((namespace, last)) => format!("{namespace}.{}_{last}", verb.lowercase()),
        None => format!("{}_{dotted}", verb.lowercase()),
    }
}

/// Normalize a registration path: strip the leading separator.
pub fn normalize_path(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}
