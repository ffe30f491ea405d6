//! Server-wide error taxonomy.
//!
//! Every failure that can cross an API or component boundary is one of these
//! variants. The mapping to HTTP status codes and JSON-RPC error codes is
//! fixed here so both transports stay consistent.

/// Errors raised by the dispatcher, registry, transports, and handlers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServerError {
    /// Invalid startup configuration (duplicate route, empty verb set,
    /// circular component load). Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// A component failed to load. Fatal for core components; recorded and
    /// queryable for optional ones.
    #[error("component '{name}' failed to load: {reason}")]
    ComponentLoad { name: String, reason: String },

    /// A component lookup found nothing and no fallback was provided. The
    /// message states whether the component is unknown or failed to load.
    #[error("{0}")]
    ComponentLookup(String),

    /// Missing required argument or failed type conversion. Scoped to the
    /// requesting client.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No endpoint registered under the requested method or path+verb.
    #[error("method '{0}' not found")]
    MethodNotFound(String),

    /// Uncaught handler failure, converted to a generic internal error for
    /// the one request that hit it.
    #[error("internal error: {0}")]
    Internal(String),

    /// Handler exceeded its execution budget. The task finishes on its own
    /// and its late result is discarded.
    #[error("request timed out")]
    Timeout,

    /// Write failure or abrupt disconnect on a transport.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ServerError {
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }

    pub fn invalid_argument(msg: impl std::fmt::Display) -> Self {
        Self::InvalidArgument(msg.to_string())
    }

    /// HTTP status code for this error class (4xx client, 5xx internal).
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Config(_) | Self::ComponentLoad { .. } | Self::Internal(_) => 500,
            Self::ComponentLookup(_) => 503,
            Self::InvalidArgument(_) => 400,
            Self::MethodNotFound(_) => 404,
            Self::Timeout => 504,
            Self::Transport(_) => 502,
        }
    }

    /// JSON-RPC error code for this error class.
    pub fn jsonrpc_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::ComponentLoad { .. } | Self::Internal(_) => {
                crate::rpc::INTERNAL_ERROR
            }
            Self::ComponentLookup(_) | Self::MethodNotFound(_) => crate::rpc::METHOD_NOT_FOUND,
            Self::InvalidArgument(_) => crate::rpc::INVALID_PARAMS,
            Self::Timeout | Self::Transport(_) => crate::rpc::SERVER_ERROR,
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "configuration",
            Self::ComponentLoad { .. } => "component_load",
            Self::ComponentLookup(_) => "component_lookup",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::MethodNotFound(_) => "method_not_found",
            Self::Internal(_) => "internal",
            Self::Timeout => "timeout",
            Self::Transport(_) => "transport",
        }
    }
}
