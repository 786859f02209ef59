//! Hot-restartable network gateway
//!
//! One routing table of named call handlers, served over gRPC or HTTP. The
//! transport and its settings live in a configuration store; changing them
//! and calling [`Gateway::restart`] swaps the live transport without losing
//! registered handlers.

pub mod bench;
pub mod config;
pub mod error;
pub mod gateway;
pub mod grpc;
pub mod host;
pub mod http;
pub mod router;
pub mod transport;

pub use config::{
    ConfigSnapshot, ConfigStore, GatewayConfig, GatewaySettings, HttpConfig, HttpSettings,
    RpcConfig, RpcSettings, TransportKind,
};
pub use error::{GatewayError, Result};
pub use gateway::{Gateway, RestartOutcome, RestartState};
pub use host::{Module, Scheduler};
pub use router::{
    canonical_key, handler_fn, listener_fn, CallContext, CallHandler, NotifyListener, RouteTable,
};
