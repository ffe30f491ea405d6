pub mod args;
pub mod errors;
pub mod ids;
pub mod request;
pub mod rpc;

pub use args::RequestArgs;
pub use errors::ServerError;
pub use ids::ConnectionId;
pub use request::{ApiRequest, Transport, Verb};
pub use rpc::{RpcNotification, RpcRequest, RpcResponse};
