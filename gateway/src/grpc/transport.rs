//! gRPC transport
//!
//! Serves the routing table with tonic. There are no generated services: a
//! single fallback service receives every call, takes the request path as the
//! routing key and runs it through the interceptor chain with [`RawCodec`].
//!
//! Keys that only have a listener are served as client-streaming calls, every
//! other key as a unary call.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::body::BoxBody;
use tonic::server::{ClientStreamingService, Grpc, UnaryService};
use tonic::service::Routes;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tower::Service;

use super::codec::RawCodec;
use super::interceptor::{StreamCall, StreamNext, UnaryCall, UnaryNext};
use crate::bench::{CallStats, MemoryListener};
use crate::config::{GatewayConfig, RpcConfig, TransportKind};
use crate::error::{GatewayError, Result};
use crate::router::{normalize_key, CallContext, RouteTable};
use crate::transport::LiveTransport;

enum RpcListener {
    Tcp(TcpListener),
    Memory(MemoryListener),
}

/// gRPC transport handle
pub struct RpcTransport {
    listener: Option<RpcListener>,
    local_addr: Option<SocketAddr>,
    dispatch: RpcDispatch,
    shutdown_timeout: Option<Duration>,
    abandon: CancellationToken,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RpcTransport {
    /// Bind the configured address. Nothing is served until [`start`](LiveTransport::start).
    pub async fn build(config: &GatewayConfig, routes: Arc<RouteTable>) -> Result<Self> {
        let addr = config.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind { addr, source })?;
        let local_addr = listener.local_addr().ok();
        tracing::debug!("gRPC transport bound to {:?}", local_addr);

        Ok(Self::new(
            RpcListener::Tcp(listener),
            local_addr,
            &config.rpc,
            routes,
            None,
        ))
    }

    /// Serve in-memory connections, optionally recording per-call timings.
    pub fn with_memory_listener(
        config: &RpcConfig,
        routes: Arc<RouteTable>,
        listener: MemoryListener,
        stats: Option<Arc<CallStats>>,
    ) -> Self {
        Self::new(RpcListener::Memory(listener), None, config, routes, stats)
    }

    fn new(
        listener: RpcListener,
        local_addr: Option<SocketAddr>,
        config: &RpcConfig,
        routes: Arc<RouteTable>,
        stats: Option<Arc<CallStats>>,
    ) -> Self {
        let abandon = CancellationToken::new();
        let dispatch = RpcDispatch {
            unary: UnaryNext::new(&config.interceptors, routes.clone()),
            stream: StreamNext::new(&config.stream_interceptors, routes.clone()),
            routes,
            stats,
            abandon: abandon.clone(),
        };

        Self {
            listener: Some(listener),
            local_addr,
            dispatch,
            shutdown_timeout: config.shutdown_timeout,
            abandon,
            shutdown_tx: None,
            handle: None,
        }
    }
}

#[async_trait]
impl LiveTransport for RpcTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Rpc
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    fn start(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let signal = async move {
            let _ = shutdown_rx.await;
        };
        let router = Server::builder().add_routes(Routes::from(
            axum::Router::new().fallback_service(self.dispatch.clone()),
        ));

        let handle = match listener {
            RpcListener::Tcp(listener) => {
                tracing::info!("gRPC transport listening on {:?}", self.local_addr);
                tokio::spawn(async move {
                    let incoming = TcpListenerStream::new(listener);
                    if let Err(e) = router.serve_with_incoming_shutdown(incoming, signal).await {
                        tracing::error!("gRPC server error: {}", e);
                    }
                })
            }
            RpcListener::Memory(listener) => {
                tracing::debug!("gRPC transport serving in-memory connections");
                tokio::spawn(async move {
                    let incoming = listener.into_incoming();
                    if let Err(e) = router.serve_with_incoming_shutdown(incoming, signal).await {
                        tracing::error!("gRPC server error: {}", e);
                    }
                })
            }
        };

        self.shutdown_tx = Some(shutdown_tx);
        self.handle = Some(handle);
    }

    async fn stop(&mut self) -> Result<()> {
        // never started: dropping the listener releases the port
        self.listener = None;

        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        match self.shutdown_timeout {
            None => {
                let _ = handle.await;
            }
            Some(grace) => {
                if tokio::time::timeout(grace, &mut handle).await.is_err() {
                    tracing::warn!("gRPC transport still busy after {:?}, aborting", grace);
                    self.abandon.cancel();
                    handle.abort();
                    let _ = handle.await;
                    return Err(GatewayError::ShutdownTimeout {
                        transport: TransportKind::Rpc,
                        grace,
                    });
                }
            }
        }

        tracing::info!("gRPC transport stopped");
        Ok(())
    }
}

/// Fallback service receiving every gRPC call
#[derive(Clone)]
struct RpcDispatch {
    unary: UnaryNext,
    stream: StreamNext,
    routes: Arc<RouteTable>,
    stats: Option<Arc<CallStats>>,
    /// Cancelled when a stop gives up waiting; calls still running are dropped
    abandon: CancellationToken,
}

impl Service<http::Request<Body>> for RpcDispatch {
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<Body>) -> Self::Future {
        let method = normalize_key(request.uri().path());
        let this = self.clone();

        Box::pin(async move {
            let _timer = this.stats.as_ref().map(|stats| stats.begin());
            let abandon = this.abandon.clone();
            let mut grpc = Grpc::new(RawCodec);

            let listener_only = this.routes.lookup_handler(&method).is_none()
                && this.routes.lookup_listener(&method).is_some();
            let dispatched = async move {
                if listener_only {
                    let entry = StreamEntry {
                        chain: this.stream,
                        method,
                    };
                    grpc.client_streaming(entry, request).await
                } else {
                    let entry = UnaryEntry {
                        chain: this.unary,
                        method,
                    };
                    grpc.unary(entry, request).await
                }
            };

            tokio::select! {
                response = dispatched => Ok(response),
                _ = abandon.cancelled() => {
                    Ok(Status::unavailable("gRPC transport force-closed").into_http())
                }
            }
        })
    }
}

fn call_context<T>(method: &str, request: &Request<T>) -> CallContext {
    let mut context =
        CallContext::new(TransportKind::Rpc, method).with_remote_addr(request.remote_addr());
    for (name, value) in request.metadata().clone().into_headers().iter() {
        if let Ok(value) = value.to_str() {
            context
                .metadata
                .insert(name.as_str().to_string(), value.to_string());
        }
    }
    context
}

struct UnaryEntry {
    chain: UnaryNext,
    method: String,
}

impl UnaryService<Bytes> for UnaryEntry {
    type Response = Bytes;
    type Future = BoxFuture<'static, std::result::Result<Response<Bytes>, Status>>;

    fn call(&mut self, request: Request<Bytes>) -> Self::Future {
        let call = UnaryCall {
            context: call_context(&self.method, &request),
            request: request.into_inner(),
        };
        let reply = self.chain.clone().run(call);
        Box::pin(async move { reply.await.map(Response::new) })
    }
}

struct StreamEntry {
    chain: StreamNext,
    method: String,
}

impl ClientStreamingService<Bytes> for StreamEntry {
    type Response = Bytes;
    type Future = BoxFuture<'static, std::result::Result<Response<Bytes>, Status>>;

    fn call(&mut self, request: Request<Streaming<Bytes>>) -> Self::Future {
        let call = StreamCall {
            context: call_context(&self.method, &request),
            messages: request.into_inner().boxed(),
        };
        let done = self.chain.clone().run(call);
        Box::pin(async move { done.await.map(|()| Response::new(Bytes::new())) })
    }
}
