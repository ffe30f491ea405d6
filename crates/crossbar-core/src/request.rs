//! The uniform request object handed to every endpoint handler, plus the
//! verb and transport vocabulary shared across the wire adapters.

use serde::{Deserialize, Serialize};

use crate::args::RequestArgs;
use crate::ids::ConnectionId;

/// HTTP-style verb an endpoint responds to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verb {
    Get,
    Post,
    Delete,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }

    pub fn lowercase(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Post => "post",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire transport an endpoint is exposed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    Http,
    Ws,
    Mqtt,
}

impl Transport {
    /// All three transports, the registration default.
    pub const ALL: [Transport; 3] = [Transport::Http, Transport::Ws, Transport::Mqtt];
}

/// A decoded inbound request, identical regardless of originating transport.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// Endpoint path without leading slash, e.g. `server/info`.
    pub path: String,
    pub verb: Verb,
    /// Originating connection, `None` for plain HTTP calls.
    pub connection: Option<ConnectionId>,
    pub args: RequestArgs,
}

impl ApiRequest {
    pub fn new(path: impl Into<String>, verb: Verb, args: RequestArgs) -> Self {
        Self {
            path: path.into(),
            verb,
            connection: None,
            args,
        }
    }

    pub fn with_connection(mut self, connection: ConnectionId) -> Self {
        self.connection = Some(connection);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verb_strings() {
        assert_eq!(Verb::Get.as_str(), "GET");
        assert_eq!(Verb::Delete.lowercase(), "delete");
        assert_eq!(Verb::Post.to_string(), "POST");
    }

    #[test]
    fn all_transports() {
        assert_eq!(Transport::ALL.len(), 3);
        assert!(Transport::ALL.contains(&Transport::Mqtt));
    }

    #[test]
    fn request_connection_defaults_to_none() {
        let req = ApiRequest::new("server/info", Verb::Get, RequestArgs::default());
        assert!(req.connection.is_none());

        let conn = ConnectionId::new();
        let req = req.with_connection(conn.clone());
        assert_eq!(req.connection, Some(conn));
    }
}
