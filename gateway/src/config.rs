//! Gateway configuration
//!
//! [`GatewayConfig`] is the full runtime configuration, middleware chains
//! included. It lives in a [`ConfigStore`] for the whole process lifetime and
//! is only mutated through [`ConfigStore::write`]; releasing the write guard
//! commits the change and requests a restart.
//!
//! [`GatewaySettings`] is the serialisable subset, loadable from the
//! environment.

use std::fmt;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{GatewayError, Result};
use crate::grpc::{StreamInterceptor, UnaryInterceptor};
use crate::http::{uri_path_service_name, ContextOption, HttpMiddleware, PathToServiceName};

/// Default listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:50051";

/// Default HTTP route: every POST path, mapped to a key by its URI path
pub const DEFAULT_HTTP_PATH: &str = "/*method";

/// Transport selected to serve the routing table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Nothing listens
    #[default]
    None,
    /// HTTP/JSON
    Http,
    /// gRPC
    Rpc,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::None => "none",
            TransportKind::Http => "http",
            TransportKind::Rpc => "rpc",
        };
        f.write_str(name)
    }
}

impl FromStr for TransportKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" => Ok(TransportKind::None),
            "http" | "rest" => Ok(TransportKind::Http),
            "rpc" | "grpc" => Ok(TransportKind::Rpc),
            other => Err(GatewayError::InvalidTransport(other.to_string())),
        }
    }
}

/// HTTP transport configuration
#[derive(Clone)]
pub struct HttpConfig {
    /// Route accepting method calls (axum path syntax)
    pub path: String,
    /// Time allowed to receive a request body (`None` = unlimited)
    pub read_timeout: Option<Duration>,
    /// Time allowed to produce a response (`None` = unlimited)
    pub write_timeout: Option<Duration>,
    /// Maps a request to its routing key
    pub path_to_service_name: PathToServiceName,
    /// Middleware, outermost first
    pub middlewares: Vec<HttpMiddleware>,
    /// Call context enrichment, applied in order
    pub context_options: Vec<ContextOption>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_HTTP_PATH.to_string(),
            read_timeout: None,
            write_timeout: None,
            path_to_service_name: uri_path_service_name(),
            middlewares: Vec::new(),
            context_options: Vec::new(),
        }
    }
}

/// Check that `path` is a route axum accepts: a leading `/`, and `:name` or
/// `*name` captures only as whole segments, with `*name` last.
pub fn validate_http_path(path: &str) -> Result<()> {
    let invalid = || Err(GatewayError::InvalidHttpPath(path.to_string()));

    let Some(rest) = path.strip_prefix('/') else {
        return invalid();
    };
    let segments: Vec<&str> = rest.split('/').collect();
    for (i, segment) in segments.iter().enumerate() {
        let mut chars = segment.chars();
        match chars.next() {
            Some(':') | Some('*') => {
                let name = chars.as_str();
                if name.is_empty() || name.contains([':', '*']) {
                    return invalid();
                }
                if segment.starts_with('*') && i + 1 != segments.len() {
                    return invalid();
                }
            }
            _ if segment.contains([':', '*']) => return invalid(),
            _ => {}
        }
    }
    Ok(())
}

impl fmt::Debug for HttpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConfig")
            .field("path", &self.path)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("middlewares", &self.middlewares.len())
            .field("context_options", &self.context_options.len())
            .finish()
    }
}

/// gRPC transport configuration
#[derive(Clone, Default)]
pub struct RpcConfig {
    /// Unary interceptors, outermost first
    pub interceptors: Vec<Arc<dyn UnaryInterceptor>>,
    /// Stream interceptors, outermost first
    pub stream_interceptors: Vec<Arc<dyn StreamInterceptor>>,
    /// Bound on the graceful stop (`None` waits for every call to finish)
    pub shutdown_timeout: Option<Duration>,
}

impl fmt::Debug for RpcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcConfig")
            .field("interceptors", &self.interceptors.len())
            .field("stream_interceptors", &self.stream_interceptors.len())
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

/// Full gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Serve at all
    pub enabled: bool,
    /// Transport to serve with; at most one is active
    pub transport: TransportKind,
    /// Listen address shared by both transports
    pub listen_addr: SocketAddr,
    pub http: HttpConfig,
    pub rpc: RpcConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            transport: TransportKind::None,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 50051)),
            http: HttpConfig::default(),
            rpc: RpcConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Select the transport; the other one stops listening.
    pub fn use_transport(&mut self, transport: TransportKind) {
        self.transport = transport;
    }

    /// Whether `transport` would be served by this configuration
    pub fn is_listening(&self, transport: TransportKind) -> bool {
        self.enabled && transport != TransportKind::None && self.transport == transport
    }
}

/// Front configuration of the HTTP transport
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub enable: bool,
    pub listen_addr: SocketAddr,
    pub http: HttpConfig,
}

impl HttpSettings {
    /// Copy into the gateway config. Enabling HTTP turns gRPC off.
    pub fn apply_to(&self, config: &mut GatewayConfig) {
        if self.enable {
            config.use_transport(TransportKind::Http);
            config.listen_addr = self.listen_addr;
            config.http = self.http.clone();
        } else if config.transport == TransportKind::Http {
            config.use_transport(TransportKind::None);
        }
    }
}

/// Front configuration of the gRPC transport
#[derive(Debug, Clone)]
pub struct RpcSettings {
    pub enable: bool,
    pub listen_addr: SocketAddr,
    pub rpc: RpcConfig,
}

impl RpcSettings {
    /// Copy into the gateway config. Enabling gRPC turns HTTP off.
    pub fn apply_to(&self, config: &mut GatewayConfig) {
        if self.enable {
            config.use_transport(TransportKind::Rpc);
            config.listen_addr = self.listen_addr;
            config.rpc = self.rpc.clone();
        } else if config.transport == TransportKind::Rpc {
            config.use_transport(TransportKind::None);
        }
    }
}

/// Serialisable gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    pub enabled: bool,
    pub transport: TransportKind,
    pub listen_addr: String,
    pub http_path: String,
    /// 0 disables the timeout
    pub http_read_timeout_secs: u64,
    /// 0 disables the timeout
    pub http_write_timeout_secs: u64,
    /// 0 waits for in-flight calls without a bound
    pub rpc_shutdown_timeout_secs: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            transport: TransportKind::None,
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            http_path: DEFAULT_HTTP_PATH.to_string(),
            http_read_timeout_secs: 0,
            http_write_timeout_secs: 0,
            rpc_shutdown_timeout_secs: 0,
        }
    }
}

impl GatewaySettings {
    /// Create settings from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create settings from `GATEWAY_*` values supplied by `lookup`.
    /// Unparseable values are logged and leave the default in place.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Self::default();

        if let Some(enabled) = lookup("GATEWAY_ENABLED") {
            match enabled.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => settings.enabled = true,
                "false" | "0" | "no" | "off" => settings.enabled = false,
                other => tracing::warn!("Ignoring GATEWAY_ENABLED: unrecognised value {:?}", other),
            }
        }

        if let Some(transport) = lookup("GATEWAY_TRANSPORT") {
            match transport.parse() {
                Ok(kind) => settings.transport = kind,
                Err(e) => tracing::warn!("Ignoring GATEWAY_TRANSPORT: {}", e),
            }
        }

        if let Some(addr) = lookup("GATEWAY_LISTEN_ADDR") {
            settings.listen_addr = addr;
        }

        if let Some(path) = lookup("GATEWAY_HTTP_PATH") {
            settings.http_path = path;
        }

        let secs = |key: &str, default: u64| match lookup(key) {
            Some(value) => value.trim().parse().unwrap_or_else(|_| {
                tracing::warn!("Ignoring {}: not a number of seconds: {:?}", key, value);
                default
            }),
            None => default,
        };
        settings.http_read_timeout_secs =
            secs("GATEWAY_HTTP_READ_TIMEOUT_SECS", settings.http_read_timeout_secs);
        settings.http_write_timeout_secs =
            secs("GATEWAY_HTTP_WRITE_TIMEOUT_SECS", settings.http_write_timeout_secs);
        settings.rpc_shutdown_timeout_secs =
            secs("GATEWAY_RPC_SHUTDOWN_TIMEOUT_SECS", settings.rpc_shutdown_timeout_secs);

        settings
    }

    /// Parse the listen address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen_addr
            .parse()
            .map_err(|_| GatewayError::InvalidListenAddress(self.listen_addr.clone()))
    }

    /// Validate and copy into a gateway config. Middleware chains are kept.
    pub fn apply_to(&self, config: &mut GatewayConfig) -> Result<()> {
        let listen_addr = self.listen_addr()?;
        validate_http_path(&self.http_path)?;

        config.enabled = self.enabled;
        config.use_transport(self.transport);
        config.listen_addr = listen_addr;
        config.http.path = self.http_path.clone();
        config.http.read_timeout = secs(self.http_read_timeout_secs);
        config.http.write_timeout = secs(self.http_write_timeout_secs);
        config.rpc.shutdown_timeout = secs(self.rpc_shutdown_timeout_secs);
        Ok(())
    }
}

fn secs(n: u64) -> Option<Duration> {
    (n > 0).then(|| Duration::from_secs(n))
}

/// Configuration as seen by one restart
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    /// Number of commits included
    pub version: u64,
    pub config: GatewayConfig,
}

/// Lock-protected configuration with change tracking.
///
/// Every write-guard release sets the change flag and bumps the commit
/// version published on a watch channel. The restart path claims the flag
/// with a compare-and-swap, so bursts of commits collapse into one restart.
pub struct ConfigStore {
    config: RwLock<GatewayConfig>,
    changed: AtomicBool,
    commits: watch::Sender<u64>,
}

impl ConfigStore {
    pub fn new(config: GatewayConfig) -> Self {
        let (commits, _) = watch::channel(0);
        Self {
            config: RwLock::new(config),
            changed: AtomicBool::new(false),
            commits,
        }
    }

    /// Exclusive access. Dropping the guard commits the change.
    pub async fn write(&self) -> ConfigWriteGuard<'_> {
        ConfigWriteGuard {
            guard: self.config.write().await,
            store: self,
        }
    }

    /// Shared access
    pub async fn read(&self) -> RwLockReadGuard<'_, GatewayConfig> {
        self.config.read().await
    }

    /// Consistent copy of the configuration and its commit version
    pub async fn snapshot(&self) -> ConfigSnapshot {
        let config = self.config.read().await;
        ConfigSnapshot {
            version: *self.commits.borrow(),
            config: config.clone(),
        }
    }

    /// Number of commits so far
    pub fn version(&self) -> u64 {
        *self.commits.borrow()
    }

    /// Receiver notified on every commit
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.commits.subscribe()
    }

    /// Whether a commit has not been applied yet. A single atomic load.
    pub fn has_pending_change(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    /// Take the pending change. Only one caller wins per change.
    pub(crate) fn claim_change(&self) -> bool {
        self.changed
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn commit(&self) {
        self.changed.store(true, Ordering::Release);
        self.commits.send_modify(|version| *version += 1);
        tracing::debug!("Config committed (version {})", self.version());
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(GatewayConfig::default())
    }
}

/// Write access to a [`ConfigStore`]
pub struct ConfigWriteGuard<'a> {
    guard: RwLockWriteGuard<'a, GatewayConfig>,
    store: &'a ConfigStore,
}

impl Deref for ConfigWriteGuard<'_> {
    type Target = GatewayConfig;

    fn deref(&self) -> &GatewayConfig {
        &self.guard
    }
}

impl DerefMut for ConfigWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut GatewayConfig {
        &mut self.guard
    }
}

impl Drop for ConfigWriteGuard<'_> {
    fn drop(&mut self) {
        // Published while the lock is still held: readers of the new version
        // block until the guard field drops right after this.
        self.store.commit();
    }
}
