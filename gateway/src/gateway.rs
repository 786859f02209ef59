//! Gateway and its restart state machine
//!
//! The [`Gateway`] owns the configuration store, the routing table and at
//! most one live transport. Configuration writes only mark the gateway as
//! changed; [`Gateway::restart`] applies them:
//!
//! ```text
//! Idle --(pending change claimed)--> Restarting
//!     stop current transport
//!     snapshot config
//!     disabled / no transport  -> Idle, nothing live
//!     build + start transport  -> Idle, one transport live
//! ```
//!
//! Restarts are serialised by the live-transport lock and collapse: any
//! number of writes before a restart result in a single stop/start cycle.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::bench::BenchHarness;
use crate::config::{ConfigStore, ConfigWriteGuard, GatewayConfig, TransportKind};
use crate::error::Result;
use crate::grpc::RpcTransport;
use crate::host::Module;
use crate::http::HttpTransport;
use crate::router::{canonical_key, CallHandler, NotifyListener, RouteTable};
use crate::transport::LiveTransport;

/// Result of one [`Gateway::restart`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    /// No pending change, or another caller applied it
    Unchanged,
    /// Change applied; nothing listens
    Quiesced { version: u64 },
    /// Change applied; one transport listens
    Serving {
        transport: TransportKind,
        local_addr: Option<SocketAddr>,
        version: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartState {
    Idle,
    Restarting,
}

pub struct Gateway {
    store: Arc<ConfigStore>,
    routes: Arc<RouteTable>,
    live: Mutex<Option<Box<dyn LiveTransport>>>,
    restarting: AtomicBool,
}

impl Gateway {
    pub fn new() -> Self {
        Self::with_config(GatewayConfig::default())
    }

    pub fn with_config(config: GatewayConfig) -> Self {
        Self {
            store: Arc::new(ConfigStore::new(config)),
            routes: Arc::new(RouteTable::new()),
            live: Mutex::new(None),
            restarting: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    /// Write access to the configuration; releasing the guard requests a restart.
    pub async fn config_mut(&self) -> ConfigWriteGuard<'_> {
        self.store.write().await
    }

    /// Apply `f` to the configuration and request a restart.
    pub async fn configure<F>(&self, f: F)
    where
        F: FnOnce(&mut GatewayConfig),
    {
        let mut config = self.store.write().await;
        f(&mut config);
    }

    pub fn register_call_handler(
        &self,
        package: &str,
        service: &str,
        method: &str,
        handler: Arc<dyn CallHandler>,
    ) {
        let key = canonical_key(package, service, method);
        tracing::debug!("Registered call handler {}", key);
        self.routes.register_handler(&key, handler);
    }

    pub fn deregister_call_handler(&self, package: &str, service: &str, method: &str) {
        let key = canonical_key(package, service, method);
        tracing::debug!("Deregistered call handler {}", key);
        self.routes.deregister_handler(&key);
    }

    pub fn register_listener(
        &self,
        package: &str,
        service: &str,
        method: &str,
        listener: Arc<dyn NotifyListener>,
    ) {
        let key = canonical_key(package, service, method);
        tracing::debug!("Registered listener {}", key);
        self.routes.register_listener(&key, listener);
    }

    pub fn deregister_listener(&self, package: &str, service: &str, method: &str) {
        let key = canonical_key(package, service, method);
        tracing::debug!("Deregistered listener {}", key);
        self.routes.deregister_listener(&key);
    }

    /// Whether a configuration change is waiting to be applied
    pub fn restart_pending(&self) -> bool {
        self.store.has_pending_change()
    }

    pub fn state(&self) -> RestartState {
        if self.restarting.load(Ordering::Acquire) {
            RestartState::Restarting
        } else {
            RestartState::Idle
        }
    }

    /// Apply the pending configuration change, if any.
    ///
    /// Without a pending change this is a single atomic load. Otherwise the
    /// current transport is stopped and the one selected by the latest
    /// configuration is built and started. If building fails the error is
    /// returned and nothing is left listening until the next change.
    pub async fn restart(&self) -> Result<RestartOutcome> {
        if !self.store.has_pending_change() {
            return Ok(RestartOutcome::Unchanged);
        }

        let mut live = self.live.lock().await;
        if !self.store.claim_change() {
            return Ok(RestartOutcome::Unchanged);
        }
        let _restarting = Restarting::enter(&self.restarting);

        if let Some(mut current) = live.take() {
            tracing::info!("Stopping {} transport", current.kind());
            if let Err(e) = current.stop().await {
                tracing::warn!("{} transport did not stop cleanly: {}", current.kind(), e);
            }
        }

        let snapshot = self.store.snapshot().await;
        let config = &snapshot.config;
        let built = match config.transport {
            _ if !config.enabled => None,
            TransportKind::None => None,
            TransportKind::Http => Some(
                HttpTransport::build(config, self.routes.clone())
                    .await
                    .map(|t| Box::new(t) as Box<dyn LiveTransport>),
            ),
            TransportKind::Rpc => Some(
                RpcTransport::build(config, self.routes.clone())
                    .await
                    .map(|t| Box::new(t) as Box<dyn LiveTransport>),
            ),
        };

        let mut transport = match built {
            None => {
                tracing::info!("Gateway quiesced (config version {})", snapshot.version);
                return Ok(RestartOutcome::Quiesced {
                    version: snapshot.version,
                });
            }
            Some(Ok(transport)) => transport,
            Some(Err(e)) => {
                tracing::error!("Failed to build {} transport: {}", config.transport, e);
                return Err(e);
            }
        };

        transport.start();
        let outcome = RestartOutcome::Serving {
            transport: transport.kind(),
            local_addr: transport.local_addr(),
            version: snapshot.version,
        };
        tracing::info!(
            "Gateway serving {} on {:?} (config version {})",
            transport.kind(),
            transport.local_addr(),
            snapshot.version
        );
        *live = Some(transport);

        Ok(outcome)
    }

    /// Restart on every configuration commit until the task is aborted.
    pub fn spawn_restart_task(self: &Arc<Self>) -> JoinHandle<()> {
        let gateway = self.clone();
        let mut commits = self.store.subscribe();

        tokio::spawn(async move {
            loop {
                if let Err(e) = gateway.restart().await {
                    tracing::error!("Gateway restart failed: {}", e);
                }
                if commits.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    /// Stop the live transport, if any. Configuration is left untouched.
    pub async fn shutdown(&self) -> Result<()> {
        let mut live = self.live.lock().await;
        match live.take() {
            Some(mut transport) => {
                tracing::info!("Shutting down {} transport", transport.kind());
                transport.stop().await
            }
            None => Ok(()),
        }
    }

    /// Address of the live transport
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.live.lock().await.as_ref().and_then(|t| t.local_addr())
    }

    pub async fn active_transport(&self) -> Option<TransportKind> {
        self.live.lock().await.as_ref().map(|t| t.kind())
    }

    pub async fn is_serving(&self) -> bool {
        self.live
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| t.is_running())
    }

    /// In-memory gRPC server over this gateway's routes and interceptors
    pub async fn bench_harness(&self) -> BenchHarness {
        let config = self.store.read().await;
        BenchHarness::start(self.routes.clone(), &config.rpc)
    }
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for Gateway {
    fn name(&self) -> &str {
        "gateway"
    }

    async fn restart_if_changed(&self) -> bool {
        match self.restart().await {
            Ok(RestartOutcome::Unchanged) => false,
            Ok(_) => true,
            Err(e) => {
                tracing::error!("Gateway restart failed: {}", e);
                false
            }
        }
    }

    async fn stop(&self) {
        if let Err(e) = self.shutdown().await {
            tracing::warn!("Gateway shutdown: {}", e);
        }
    }
}

/// Marks the gateway as restarting until dropped
struct Restarting<'a>(&'a AtomicBool);

impl<'a> Restarting<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for Restarting<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
