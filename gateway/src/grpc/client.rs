//! Raw gRPC client
//!
//! Calls any routed method by path with opaque payloads. Used by the
//! benchmark harness and by tests; real clients use their own generated stubs.

use std::net::SocketAddr;

use bytes::Bytes;
use http::uri::PathAndQuery;
use hyper_util::rt::TokioIo;
use tonic::client::Grpc;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::{Request, Status};

use super::codec::RawCodec;
use crate::bench::MemoryDialer;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct RpcClient {
    inner: Grpc<Channel>,
}

impl RpcClient {
    /// Connect over TCP.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let channel = Endpoint::from_shared(format!("http://{addr}"))?
            .connect()
            .await?;
        Ok(Self::new(channel))
    }

    /// Connect through an in-memory dialer.
    pub async fn connect_in_memory(dialer: MemoryDialer) -> Result<Self> {
        let channel = Endpoint::from_static("http://in-memory.local")
            .connect_with_connector(tower::service_fn(move |_: Uri| {
                let dialer = dialer.clone();
                async move { dialer.dial().await.map(TokioIo::new) }
            }))
            .await?;
        Ok(Self::new(channel))
    }

    fn new(channel: Channel) -> Self {
        Self {
            inner: Grpc::new(channel),
        }
    }

    /// Unary call on `method` (`/package.Service/Method`).
    pub async fn call(&mut self, method: &str, payload: Bytes) -> std::result::Result<Bytes, Status> {
        self.call_request(method, Request::new(payload)).await
    }

    /// Unary call carrying caller-supplied metadata.
    pub async fn call_request(
        &mut self,
        method: &str,
        request: Request<Bytes>,
    ) -> std::result::Result<Bytes, Status> {
        let path = self.prepare(method).await?;
        let response = self.inner.unary(request, path, RawCodec).await?;
        Ok(response.into_inner())
    }

    /// Stream `messages` to the listener on `method`.
    pub async fn notify(&mut self, method: &str, messages: Vec<Bytes>) -> std::result::Result<(), Status> {
        let path = self.prepare(method).await?;
        let request = Request::new(tokio_stream::iter(messages));
        self.inner.client_streaming(request, path, RawCodec).await?;
        Ok(())
    }

    async fn prepare(&mut self, method: &str) -> std::result::Result<PathAndQuery, Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| Status::unavailable(format!("Service was not ready: {e}")))?;
        PathAndQuery::try_from(method)
            .map_err(|e| Status::invalid_argument(format!("Invalid method {method}: {e}")))
    }
}
