//! Service Router
//!
//! Name-based routing table shared by both transports. Calls are keyed by the
//! canonical `/package.service/method` string, always lower-cased, so a key
//! registered as `/Pkg.Svc/Echo` is found by `/pkg.svc/echo` and vice versa.
//!
//! Two independent maps are kept: call handlers (request/response) and
//! notification listeners (fire-and-forget). Registration takes effect on the
//! next inbound call; no transport restart is needed.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tonic::Status;
use uuid::Uuid;

use crate::config::TransportKind;
use crate::error::route_not_found;

/// Build the canonical routing key for a method.
///
/// An empty package yields `/service/method`.
pub fn canonical_key(package: &str, service: &str, method: &str) -> String {
    if package.is_empty() {
        format!("/{service}/{method}").to_lowercase()
    } else {
        format!("/{package}.{service}/{method}").to_lowercase()
    }
}

/// Normalize an already assembled key (e.g. a gRPC request path).
pub fn normalize_key(key: &str) -> String {
    key.to_lowercase()
}

/// Per-call information handed to handlers and interceptors.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Unique ID of this call, for log correlation
    pub call_id: Uuid,
    /// Transport that received the call
    pub transport: TransportKind,
    /// Canonical routing key
    pub method: String,
    /// Peer address, when the transport knows it
    pub remote_addr: Option<SocketAddr>,
    /// Request metadata (gRPC metadata or HTTP headers)
    pub metadata: HashMap<String, String>,
}

impl CallContext {
    pub fn new(transport: TransportKind, method: impl Into<String>) -> Self {
        Self {
            call_id: Uuid::new_v4(),
            transport,
            method: method.into(),
            remote_addr: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_remote_addr(mut self, remote_addr: Option<SocketAddr>) -> Self {
        self.remote_addr = remote_addr;
        self
    }

    /// Look up a metadata value by (case-insensitive) name.
    pub fn metadata_value(&self, name: &str) -> Option<&str> {
        self.metadata.get(&name.to_lowercase()).map(String::as_str)
    }
}

/// Request/response handler for one routed method.
#[async_trait]
pub trait CallHandler: Send + Sync {
    async fn handle(&self, ctx: CallContext, request: Bytes) -> Result<Bytes, Status>;
}

/// Fire-and-forget receiver for notifications on one routed method.
#[async_trait]
pub trait NotifyListener: Send + Sync {
    async fn notify(&self, ctx: CallContext, message: Bytes);
}

/// [`CallHandler`] backed by an async closure. See [`handler_fn`].
pub struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> CallHandler for HandlerFn<F>
where
    F: Fn(CallContext, Bytes) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Bytes, Status>> + Send,
{
    async fn handle(&self, ctx: CallContext, request: Bytes) -> Result<Bytes, Status> {
        (self.0)(ctx, request).await
    }
}

/// Wrap an async closure as a call handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn CallHandler>
where
    F: Fn(CallContext, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, Status>> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

/// [`NotifyListener`] backed by an async closure. See [`listener_fn`].
pub struct ListenerFn<F>(F);

#[async_trait]
impl<F, Fut> NotifyListener for ListenerFn<F>
where
    F: Fn(CallContext, Bytes) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn notify(&self, ctx: CallContext, message: Bytes) {
        (self.0)(ctx, message).await
    }
}

/// Wrap an async closure as a notification listener.
pub fn listener_fn<F, Fut>(f: F) -> Arc<dyn NotifyListener>
where
    F: Fn(CallContext, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(ListenerFn(f))
}

/// Thread-safe key -> handler and key -> listener maps.
///
/// Lookups clone the `Arc` out of the map so no shard lock is held while a
/// handler runs.
#[derive(Default)]
pub struct RouteTable {
    handlers: DashMap<String, Arc<dyn CallHandler>>,
    listeners: DashMap<String, Arc<dyn NotifyListener>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `key`. Empty keys are ignored.
    pub fn register_handler(&self, key: &str, handler: Arc<dyn CallHandler>) {
        if key.is_empty() {
            return;
        }
        self.handlers.insert(normalize_key(key), handler);
    }

    /// Remove the handler for `key`, if any.
    pub fn deregister_handler(&self, key: &str) {
        self.handlers.remove(&normalize_key(key));
    }

    pub fn lookup_handler(&self, key: &str) -> Option<Arc<dyn CallHandler>> {
        self.handlers
            .get(&normalize_key(key))
            .map(|entry| entry.value().clone())
    }

    /// Register (or replace) the listener for `key`. Empty keys are ignored.
    pub fn register_listener(&self, key: &str, listener: Arc<dyn NotifyListener>) {
        if key.is_empty() {
            return;
        }
        self.listeners.insert(normalize_key(key), listener);
    }

    /// Remove the listener for `key`, if any.
    pub fn deregister_listener(&self, key: &str) {
        self.listeners.remove(&normalize_key(key));
    }

    pub fn lookup_listener(&self, key: &str) -> Option<Arc<dyn NotifyListener>> {
        self.listeners
            .get(&normalize_key(key))
            .map(|entry| entry.value().clone())
    }

    /// Invoke the handler registered for `key`.
    ///
    /// A miss is answered with a `NotFound` status.
    pub async fn dispatch(&self, key: &str, ctx: CallContext, request: Bytes) -> Result<Bytes, Status> {
        match self.lookup_handler(key) {
            Some(handler) => handler.handle(ctx, request).await,
            None => {
                tracing::debug!("No handler for {}", key);
                Err(route_not_found(key))
            }
        }
    }

    /// Deliver a notification to the listener registered for `key`.
    ///
    /// Returns false when nobody listens on `key`.
    pub async fn notify(&self, key: &str, ctx: CallContext, message: Bytes) -> bool {
        match self.lookup_listener(key) {
            Some(listener) => {
                listener.notify(ctx, message).await;
                true
            }
            None => false,
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}
