//! Host-side I/O: connection primitives, transports, the connection manager
//! and the inbound dispatch path.

pub mod connection;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod handle;
pub mod http;
pub mod manager;
pub mod policy;
pub mod queue;
pub mod router;

pub use connection::{FrameReceiver, IoConnection, LongPollConfig, PipePeer};
pub use dispatch::{DispatchOutcome, IoMessageDispatcher, NotifyRuntimeWaker, RuntimeWaker};
pub use error::IoError;
pub use frame::{FrameType, IoFrame};
pub use handle::{ConnectionHandle, ConnectionState, ConnectionType};
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, ReqwestHttpClient};
pub use manager::IoConnectionManager;
pub use policy::{KeepAliveConfig, ReconnectPolicy};
pub use queue::InboundMessageQueue;
pub use router::{InboundConnectionRouter, RemoteAddress};
