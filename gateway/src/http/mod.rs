//! HTTP transport
//!
//! Serves the routing table as plain HTTP: a POST on the configured path is
//! mapped to a routing key, the body is handed to the handler as-is and the
//! handler's bytes come back as the JSON response body.

pub mod middleware;
pub mod transport;

pub use middleware::{
    context_option, path_to_service_name, uri_path_service_name, ContextOption, HttpMiddleware,
    PathToServiceName,
};
pub use transport::HttpTransport;
