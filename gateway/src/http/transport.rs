//! HTTP transport built on axum

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tonic::Status;
use tower::ServiceExt;
use tower_http::timeout::{RequestBodyTimeoutLayer, TimeoutLayer};
use tower_http::trace::TraceLayer;

use super::middleware::{ContextOption, PathToServiceName};
use crate::config::{validate_http_path, GatewayConfig, HttpConfig, TransportKind};
use crate::error::{route_not_found, status_response, GatewayError, Result};
use crate::router::{normalize_key, CallContext, RouteTable};
use crate::transport::LiveTransport;

/// Largest request body accepted
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Time given to in-flight requests on stop
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[derive(Clone)]
struct HttpState {
    routes: Arc<RouteTable>,
    path_to_service_name: PathToServiceName,
    context_options: Arc<[ContextOption]>,
}

/// HTTP transport handle
pub struct HttpTransport {
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    app: Router,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HttpTransport {
    /// Validate the config and bind. Nothing is served until [`start`](LiveTransport::start).
    pub async fn build(config: &GatewayConfig, routes: Arc<RouteTable>) -> Result<Self> {
        let app = Self::router(&config.http, routes)?;

        let addr = config.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind { addr, source })?;
        let local_addr = listener.local_addr().ok();
        tracing::debug!("HTTP transport bound to {:?}", local_addr);

        Ok(Self {
            listener: Some(listener),
            local_addr,
            app,
            shutdown_tx: None,
            handle: None,
        })
    }

    /// The axum app serving `routes` under `config`
    pub fn router(config: &HttpConfig, routes: Arc<RouteTable>) -> Result<Router> {
        validate_http_path(&config.path)?;

        let state = HttpState {
            routes,
            path_to_service_name: config.path_to_service_name.clone(),
            context_options: config.context_options.clone().into(),
        };

        let mut app = Router::new()
            .route(&config.path, post(handle_call))
            .fallback(not_found)
            .with_state(state);

        if let Some(timeout) = config.write_timeout {
            app = app.layer(TimeoutLayer::new(timeout));
        }
        if let Some(timeout) = config.read_timeout {
            app = app.layer(RequestBodyTimeoutLayer::new(timeout));
        }

        // first registered runs first
        for middleware in config.middlewares.iter().rev() {
            app = middleware.layer(app);
        }

        Ok(app.layer(TraceLayer::new_for_http()))
    }
}

#[async_trait]
impl LiveTransport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
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
        let app = self.app.clone();
        tracing::info!("HTTP transport listening on {:?}", self.local_addr);

        let handle = tokio::spawn(serve(listener, app, shutdown_rx));

        self.shutdown_tx = Some(shutdown_tx);
        self.handle = Some(handle);
    }

    async fn stop(&mut self) -> Result<()> {
        self.listener = None;

        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
            tracing::warn!("HTTP transport still busy after {:?}, aborting", SHUTDOWN_GRACE);
            handle.abort();
            let _ = handle.await;
            return Err(GatewayError::ShutdownTimeout {
                transport: TransportKind::Http,
                grace: SHUTDOWN_GRACE,
            });
        }

        tracing::info!("HTTP transport stopped");
        Ok(())
    }
}

/// Accept loop. Connections are owned by a `JoinSet`, so aborting the serve
/// task drops every connection and the requests running on it.
async fn serve(listener: TcpListener, app: Router, mut shutdown_rx: oneshot::Receiver<()>) {
    let (drain_tx, drain_rx) = watch::channel(());
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote_addr)) => {
                    connections.spawn(serve_connection(stream, remote_addr, app.clone(), drain_rx.clone()));
                }
                Err(e) => {
                    tracing::warn!("HTTP accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    // stop accepting, then let open connections finish their current request
    drop(listener);
    drop(drain_tx);
    while connections.join_next().await.is_some() {}
}

async fn serve_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    app: Router,
    mut drain: watch::Receiver<()>,
) {
    let app = app.map_request(move |mut request: axum::http::Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(remote_addr));
        request
    });
    // HTTP/1 runs each request inside the connection future, never in a task of its own
    let connection = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), TowerToHyperService::new(app))
        .with_upgrades();
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = drain.changed() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };
    if let Err(e) = result {
        tracing::debug!("HTTP connection from {} closed: {}", remote_addr, e);
    }
}

async fn handle_call(State(state): State<HttpState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let key = normalize_key(&(state.path_to_service_name)(&parts));

    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let mut context = CallContext::new(TransportKind::Http, key.clone()).with_remote_addr(remote_addr);
    for (name, value) in parts.headers.iter() {
        if let Ok(value) = value.to_str() {
            context
                .metadata
                .insert(name.as_str().to_string(), value.to_string());
        }
    }
    for option in state.context_options.iter() {
        option(&parts, &mut context);
    }

    let payload = match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<LengthLimitError>() => {
            return status_response(&Status::resource_exhausted(format!(
                "Request body exceeds {} bytes",
                MAX_BODY_BYTES
            )));
        }
        Err(e) => {
            return status_response(&Status::invalid_argument(format!(
                "Failed to read request body: {}",
                e
            )));
        }
    };

    if let Some(handler) = state.routes.lookup_handler(&key) {
        return match handler.handle(context, payload).await {
            Ok(reply) => ([(header::CONTENT_TYPE, "application/json")], reply).into_response(),
            Err(status) => status_response(&status),
        };
    }

    if state.routes.notify(&key, context, payload).await {
        return StatusCode::ACCEPTED.into_response();
    }

    tracing::debug!("No route for HTTP call {}", key);
    status_response(&route_not_found(&key))
}

async fn not_found(uri: Uri) -> Response {
    status_response(&route_not_found(uri.path()))
}
