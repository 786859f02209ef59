//! gRPC transport
//!
//! Serves the routing table over gRPC without generated code: message bodies
//! pass through [`RawCodec`] untouched and calls are routed by request path.

pub mod client;
pub mod codec;
pub mod interceptor;
pub mod transport;

pub use client::RpcClient;
pub use codec::RawCodec;
pub use interceptor::{
    stream_interceptor, unary_interceptor, StreamCall, StreamInterceptor, StreamNext, UnaryCall,
    UnaryInterceptor, UnaryNext,
};
pub use transport::RpcTransport;
