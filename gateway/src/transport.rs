//! Live transport handle
//!
//! A transport is built from a configuration snapshot, started once and
//! stopped once. The restart path never holds more than one.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::config::TransportKind;
use crate::error::Result;

#[async_trait]
pub trait LiveTransport: Send {
    fn kind(&self) -> TransportKind;

    /// Bound address, if the transport listens on TCP
    fn local_addr(&self) -> Option<SocketAddr>;

    fn is_running(&self) -> bool;

    /// Begin accepting calls in the background. Starting twice is a no-op.
    fn start(&mut self);

    /// Stop accepting calls and release the listener.
    ///
    /// Safe to call on a transport that never started, and more than once.
    async fn stop(&mut self) -> Result<()>;
}
