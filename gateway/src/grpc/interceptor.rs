//! Interceptor chains
//!
//! Every inbound gRPC call runs through an ordered chain: the user
//! interceptors in registration order, then the routing step, then a terminal
//! `NotFound`. Each link decides whether to call the next one, so an
//! interceptor can short-circuit, rewrite the request, or post-process the
//! reply.
//!
//! ```text
//! user[0] -> user[1] -> ... -> route lookup -> NotFound
//! ```

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tonic::Status;

use crate::error::route_not_found;
use crate::router::{CallContext, RouteTable};

/// Unary call travelling through the chain
pub struct UnaryCall {
    pub context: CallContext,
    pub request: Bytes,
}

pub type UnaryFuture = BoxFuture<'static, Result<Bytes, Status>>;

/// Link of the unary chain
pub trait UnaryInterceptor: Send + Sync + 'static {
    fn intercept(&self, call: UnaryCall, next: UnaryNext) -> UnaryFuture;
}

impl<F, Fut> UnaryInterceptor for F
where
    F: Fn(UnaryCall, UnaryNext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, Status>> + Send + 'static,
{
    fn intercept(&self, call: UnaryCall, next: UnaryNext) -> UnaryFuture {
        Box::pin(self(call, next))
    }
}

/// Wrap an async closure as a unary interceptor.
pub fn unary_interceptor<F, Fut>(f: F) -> Arc<dyn UnaryInterceptor>
where
    F: Fn(UnaryCall, UnaryNext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, Status>> + Send + 'static,
{
    Arc::new(f)
}

/// Remainder of a unary chain
#[derive(Clone)]
pub struct UnaryNext {
    chain: Arc<[Arc<dyn UnaryInterceptor>]>,
    position: usize,
}

impl UnaryNext {
    /// Chain of `interceptors` ending in a lookup on `routes`
    pub fn new(interceptors: &[Arc<dyn UnaryInterceptor>], routes: Arc<RouteTable>) -> Self {
        let mut chain = interceptors.to_vec();
        chain.push(Arc::new(RouteHandler { routes }));
        chain.push(Arc::new(NotFound));
        Self {
            chain: chain.into(),
            position: 0,
        }
    }

    /// Hand the call to the next link.
    pub fn run(self, call: UnaryCall) -> UnaryFuture {
        match self.chain.get(self.position) {
            Some(interceptor) => {
                let next = UnaryNext {
                    chain: self.chain.clone(),
                    position: self.position + 1,
                };
                interceptor.intercept(call, next)
            }
            None => UnaryInterceptor::intercept(&NotFound, call, self),
        }
    }
}

/// Answers with the registered handler, or passes on
struct RouteHandler {
    routes: Arc<RouteTable>,
}

impl UnaryInterceptor for RouteHandler {
    fn intercept(&self, call: UnaryCall, next: UnaryNext) -> UnaryFuture {
        match self.routes.lookup_handler(&call.context.method) {
            Some(handler) => Box::pin(async move { handler.handle(call.context, call.request).await }),
            None => next.run(call),
        }
    }
}

/// Last link of both chains: nothing handled the call
struct NotFound;

impl UnaryInterceptor for NotFound {
    fn intercept(&self, call: UnaryCall, _next: UnaryNext) -> UnaryFuture {
        Box::pin(async move { Err(route_not_found(&call.context.method)) })
    }
}

impl StreamInterceptor for NotFound {
    fn intercept(&self, call: StreamCall, _next: StreamNext) -> StreamFuture {
        Box::pin(async move { Err(route_not_found(&call.context.method)) })
    }
}

/// Client-streaming call travelling through the chain
pub struct StreamCall {
    pub context: CallContext,
    pub messages: BoxStream<'static, Result<Bytes, Status>>,
}

pub type StreamFuture = BoxFuture<'static, Result<(), Status>>;

/// Link of the stream chain
pub trait StreamInterceptor: Send + Sync + 'static {
    fn intercept(&self, call: StreamCall, next: StreamNext) -> StreamFuture;
}

impl<F, Fut> StreamInterceptor for F
where
    F: Fn(StreamCall, StreamNext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    fn intercept(&self, call: StreamCall, next: StreamNext) -> StreamFuture {
        Box::pin(self(call, next))
    }
}

/// Wrap an async closure as a stream interceptor.
pub fn stream_interceptor<F, Fut>(f: F) -> Arc<dyn StreamInterceptor>
where
    F: Fn(StreamCall, StreamNext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    Arc::new(f)
}

/// Remainder of a stream chain
#[derive(Clone)]
pub struct StreamNext {
    chain: Arc<[Arc<dyn StreamInterceptor>]>,
    position: usize,
}

impl StreamNext {
    /// Chain of `interceptors` ending in a listener lookup on `routes`
    pub fn new(interceptors: &[Arc<dyn StreamInterceptor>], routes: Arc<RouteTable>) -> Self {
        let mut chain = interceptors.to_vec();
        chain.push(Arc::new(RouteListener { routes }));
        chain.push(Arc::new(NotFound));
        Self {
            chain: chain.into(),
            position: 0,
        }
    }

    pub fn run(self, call: StreamCall) -> StreamFuture {
        match self.chain.get(self.position) {
            Some(interceptor) => {
                let next = StreamNext {
                    chain: self.chain.clone(),
                    position: self.position + 1,
                };
                interceptor.intercept(call, next)
            }
            None => StreamInterceptor::intercept(&NotFound, call, self),
        }
    }
}

/// Feeds every message to the registered listener, or passes on
struct RouteListener {
    routes: Arc<RouteTable>,
}

impl StreamInterceptor for RouteListener {
    fn intercept(&self, call: StreamCall, next: StreamNext) -> StreamFuture {
        let Some(listener) = self.routes.lookup_listener(&call.context.method) else {
            return next.run(call);
        };

        Box::pin(async move {
            let StreamCall { context, mut messages } = call;
            while let Some(message) = messages.next().await {
                listener.notify(context.clone(), message?).await;
            }
            Ok(())
        })
    }
}
