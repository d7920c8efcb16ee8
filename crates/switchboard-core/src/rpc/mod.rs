//! Line-delimited JSON-RPC.
//!
//! - `types` - Wire messages and their classification
//! - `transport` - Request/response multiplexing over a stream pair

mod transport;
mod types;

pub use transport::{JsonRpcTransport, NotificationHandler, ServerRequestHandler, WeakTransport};
pub use types::{
    IncomingMessage, RequestId, RpcErrorObject, RpcMessage, RpcNotification, RpcServerRequest,
};

#[cfg(test)]
pub(crate) use transport::tests::{duplex_pair, FakePeer};
