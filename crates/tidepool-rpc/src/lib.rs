// tidepool-rpc: Bidirectional JSON-RPC transport for tidepool live queries

pub mod channel;
pub mod error;
pub mod frame;
pub mod websocket;

pub use channel::{PushFn, PushHandlers, PushRouter, RpcChannel, TransportEvent};
pub use error::Error;
pub use websocket::{ReconnectConfig, RpcClientConfig, WsRpcClient};
