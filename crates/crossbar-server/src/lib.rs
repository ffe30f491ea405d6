pub mod components;
pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod events;
pub mod notify;
pub mod server;
pub mod subscriptions;
pub mod transport;

pub use components::{Component, ComponentRegistry};
pub use config::{MqttConfig, ServerConfig, StatusConfig};
pub use endpoint::{EndpointHandler, FnHandler};
pub use server::{ApiServer, LoadContext, ServerBuilder, ServerHandle};
pub use subscriptions::{ObjectDataProvider, ObjectStatus};
