//! HTTP adapter: maps REST-style requests onto the dispatcher's endpoint
//! table and serves the WebSocket upgrade path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use crossbar_core::{ApiRequest, RequestArgs, ServerError, Transport, Verb};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::debug;

use crate::dispatcher::ApiDispatcher;
use crate::subscriptions::SubscriptionManager;
use crate::transport::ws;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<ApiDispatcher>,
    pub connections: Arc<ws::ConnectionRegistry>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub heartbeat_interval: Duration,
}

/// Build the HTTP router. Endpoint paths are dynamic (components register
/// them at load time), so API traffic goes through a fallback handler that
/// consults the dispatcher's route table.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/websocket", get(ws_upgrade))
        .fallback(dispatch_http)
        .layer(CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_upgrade(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    let (id, rx) = state.connections.register();
    debug!(conn_id = %id, "websocket upgrade accepted");
    upgrade.on_upgrade(move |socket| {
        ws::handle_ws_connection(
            socket,
            id,
            rx,
            state.connections,
            state.dispatcher,
            state.subscriptions,
            state.heartbeat_interval,
        )
    })
}

async fn dispatch_http(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let verb = match method {
        Method::GET => Verb::Get,
        Method::POST => Verb::Post,
        Method::DELETE => Verb::Delete,
        _ => {
            return error_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "method not allowed",
            )
        }
    };

    let path = uri.path().trim_start_matches('/');
    let Some(endpoint) = state.dispatcher.route(path, verb) else {
        return error_response(StatusCode::NOT_FOUND, &format!("no endpoint for {path}"));
    };
    if !endpoint.exposed_on(Transport::Http) {
        return error_response(StatusCode::NOT_FOUND, &format!("no endpoint for {path}"));
    }

    // Query parameters first, then a JSON object body on top.
    let mut args = RequestArgs::from_query(query);
    if !body.is_empty() {
        match serde_json::from_slice::<Value>(&body) {
            Ok(Value::Object(map)) => args.merge(map),
            Ok(Value::Null) => {}
            Ok(_) => {
                return error_response(StatusCode::BAD_REQUEST, "request body must be an object")
            }
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("invalid JSON body: {e}"),
                )
            }
        }
    }

    let request = ApiRequest::new(path, verb, args);
    match state.dispatcher.dispatch(&endpoint, request).await {
        Ok(value) => {
            let body = if endpoint.wrap_result {
                json!({ "result": value })
            } else {
                value
            };
            Json(body).into_response()
        }
        Err(e) => server_error_response(&e),
    }
}

fn server_error_response(error: &ServerError) -> Response {
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    error_response(status, &error.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let body = json!({
        "error": {
            "code": status.as_u16(),
            "message": message,
        }
    });
    (status, Json(body)).into_response()
}
