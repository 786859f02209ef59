//! Pluggable pieces of the HTTP transport

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use axum::extract::Request;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use axum::Router;
use futures_util::future::BoxFuture;

use crate::router::CallContext;

/// Maps an inbound request to its routing key
pub type PathToServiceName = Arc<dyn Fn(&Parts) -> String + Send + Sync>;

/// Adds transport-specific data to a call context before dispatch
pub type ContextOption = Arc<dyn Fn(&Parts, &mut CallContext) + Send + Sync>;

/// Routing key = request URI path.
pub fn uri_path_service_name() -> PathToServiceName {
    Arc::new(|parts: &Parts| parts.uri.path().to_string())
}

pub fn path_to_service_name<F>(f: F) -> PathToServiceName
where
    F: Fn(&Parts) -> String + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn context_option<F>(f: F) -> ContextOption
where
    F: Fn(&Parts, &mut CallContext) + Send + Sync + 'static,
{
    Arc::new(f)
}

type MiddlewareFn = dyn Fn(Request, Next) -> BoxFuture<'static, Response> + Send + Sync;

/// Request middleware wrapping every call on the HTTP transport.
///
/// Call `next.run(request)` to continue, or return a response to stop early.
#[derive(Clone)]
pub struct HttpMiddleware(Arc<MiddlewareFn>);

impl HttpMiddleware {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        Self(Arc::new(
            move |request: Request, next: Next| -> BoxFuture<'static, Response> {
                Box::pin(f(request, next))
            },
        ))
    }

    /// Wrap `router`; the last layer added ends up outermost.
    pub(crate) fn layer(&self, router: Router) -> Router {
        let f = self.0.clone();
        router.layer(axum::middleware::from_fn(move |request: Request, next: Next| {
            let f = f.clone();
            async move { f(request, next).await }
        }))
    }
}

impl fmt::Debug for HttpMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HttpMiddleware")
    }
}
