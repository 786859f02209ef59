//! Integration tests for the gateway
//!
//! These tests drive the full restart path over real sockets: configuration
//! writes, transport swaps, and calls routed through both transports.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::Request;
use axum::middleware::Next;
use bytes::Bytes;
use network_gateway::grpc::{unary_interceptor, RpcClient, UnaryCall, UnaryNext};
use network_gateway::http::{path_to_service_name, HttpMiddleware, HttpTransport};
use network_gateway::transport::LiveTransport;
use network_gateway::{
    handler_fn, listener_fn, CallContext, Gateway, GatewayConfig, GatewayError, HttpConfig,
    RestartOutcome, Scheduler, TransportKind,
};
use tokio::net::{TcpListener, TcpStream};
use tonic::Code;

fn any_port() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn echo_gateway() -> Arc<Gateway> {
    let gateway = Arc::new(Gateway::new());
    gateway.register_call_handler(
        "pkg",
        "Svc",
        "Echo",
        handler_fn(|_, request| async move { Ok(request) }),
    );
    gateway
}

async fn serve(gateway: &Gateway, transport: TransportKind) -> SocketAddr {
    gateway
        .configure(|config| {
            config.listen_addr = any_port();
            config.use_transport(transport);
        })
        .await;

    match gateway.restart().await.unwrap() {
        RestartOutcome::Serving {
            local_addr: Some(addr),
            ..
        } => addr,
        other => panic!("expected to be serving, got {:?}", other),
    }
}

async fn post(addr: SocketAddr, path: &str, body: &'static str) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://{addr}{path}"))
        .body(body)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_echo_over_rpc_then_http() {
    let gateway = echo_gateway();

    // gRPC
    let addr = serve(&gateway, TransportKind::Rpc).await;
    let mut client = RpcClient::connect(addr).await.unwrap();
    let reply = client
        .call("/pkg.Svc/Echo", Bytes::from_static(b"hi"))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"hi"));

    // routing changes apply without a restart
    gateway.deregister_call_handler("pkg", "Svc", "Echo");
    let err = client
        .call("/pkg.Svc/Echo", Bytes::from_static(b"hi"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
    drop(client);

    gateway.register_call_handler(
        "pkg",
        "Svc",
        "Echo",
        handler_fn(|_, request| async move { Ok(request) }),
    );

    // HTTP, every call on /rpc routed to Echo
    gateway
        .configure(|config| {
            config.listen_addr = any_port();
            config.use_transport(TransportKind::Http);
            config.http = HttpConfig {
                path: "/rpc".to_string(),
                path_to_service_name: path_to_service_name(|_| "/pkg.Svc/Echo".to_string()),
                ..Default::default()
            };
        })
        .await;
    let addr = match gateway.restart().await.unwrap() {
        RestartOutcome::Serving {
            transport: TransportKind::Http,
            local_addr: Some(addr),
            ..
        } => addr,
        other => panic!("expected HTTP, got {:?}", other),
    };

    let response = post(addr, "/rpc", "hi").await;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "hi");

    gateway.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_changes_collapse_into_one_restart() {
    let gateway = echo_gateway();

    let mut writers = Vec::new();
    for i in 0..8 {
        let gateway = gateway.clone();
        writers.push(tokio::spawn(async move {
            gateway
                .configure(|config| {
                    config.listen_addr = any_port();
                    config.use_transport(TransportKind::Rpc);
                    config.http.path = format!("/writer{i}");
                })
                .await;
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }
    let last_path = gateway.config().read().await.http.path.clone();

    let mut restarts = Vec::new();
    for _ in 0..8 {
        let gateway = gateway.clone();
        restarts.push(tokio::spawn(async move { gateway.restart().await.unwrap() }));
    }
    let mut outcomes = Vec::new();
    for restart in restarts {
        outcomes.push(restart.await.unwrap());
    }

    let serving: Vec<_> = outcomes
        .iter()
        .filter(|o| matches!(o, RestartOutcome::Serving { .. }))
        .collect();
    assert_eq!(serving.len(), 1);
    assert!(matches!(serving[0], RestartOutcome::Serving { version: 8, .. }));
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == RestartOutcome::Unchanged)
            .count(),
        7
    );

    let snapshot = gateway.config().snapshot().await;
    assert_eq!(snapshot.version, 8);
    assert_eq!(snapshot.config.http.path, last_path);
    assert!(!gateway.restart_pending());

    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_switching_transport_stops_the_other() {
    let gateway = echo_gateway();

    let rpc_addr = serve(&gateway, TransportKind::Rpc).await;
    assert_eq!(gateway.active_transport().await, Some(TransportKind::Rpc));

    let http_addr = serve(&gateway, TransportKind::Http).await;
    assert_eq!(gateway.active_transport().await, Some(TransportKind::Http));
    assert!(gateway.is_serving().await);

    // old listener is gone, the new one answers
    assert!(TcpStream::connect(rpc_addr).await.is_err());
    let response = post(http_addr, "/pkg.Svc/Echo", "hi").await;
    assert_eq!(response.text().await.unwrap(), "hi");

    gateway.shutdown().await.unwrap();
    assert!(!gateway.is_serving().await);
}

#[tokio::test]
async fn test_unknown_method_is_not_found_on_both_transports() {
    let gateway = echo_gateway();

    let addr = serve(&gateway, TransportKind::Rpc).await;
    let mut client = RpcClient::connect(addr).await.unwrap();
    let err = client
        .call("/pkg.Svc/Missing", Bytes::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
    drop(client);

    let addr = serve(&gateway, TransportKind::Http).await;
    let response = post(addr, "/pkg.Svc/Missing", "").await;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "NOT_FOUND");

    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_disabling_releases_the_port() {
    let gateway = echo_gateway();
    let addr = serve(&gateway, TransportKind::Http).await;

    gateway.configure(|config| config.enabled = false).await;
    assert!(matches!(
        gateway.restart().await.unwrap(),
        RestartOutcome::Quiesced { .. }
    ));
    assert!(gateway.active_transport().await.is_none());

    TcpListener::bind(addr).await.unwrap();
}

#[tokio::test]
async fn test_bind_failure_leaves_gateway_quiesced() {
    let gateway = echo_gateway();
    let taken = TcpListener::bind(any_port()).await.unwrap();
    let taken_addr = taken.local_addr().unwrap();

    gateway
        .configure(|config| {
            config.listen_addr = taken_addr;
            config.use_transport(TransportKind::Rpc);
        })
        .await;
    let err = gateway.restart().await.unwrap_err();
    assert!(matches!(err, GatewayError::Bind { .. }));
    assert!(err.is_configuration());
    assert!(gateway.active_transport().await.is_none());
    // no retry until the next change
    assert_eq!(gateway.restart().await.unwrap(), RestartOutcome::Unchanged);

    serve(&gateway, TransportKind::Rpc).await;
    assert!(gateway.is_serving().await);
    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_http_transport_start_stop_idempotent() {
    let config = GatewayConfig {
        listen_addr: any_port(),
        ..Default::default()
    };
    let mut transport = HttpTransport::build(&config, echo_gateway().routes().clone())
        .await
        .unwrap();
    let addr = transport.local_addr().unwrap();

    transport.start();
    transport.start();
    assert!(transport.is_running());
    assert_eq!(post(addr, "/pkg.Svc/Echo", "x").await.text().await.unwrap(), "x");

    transport.stop().await.unwrap();
    transport.stop().await.unwrap();
    assert!(!transport.is_running());
    TcpListener::bind(addr).await.unwrap();
}

#[tokio::test]
async fn test_http_middleware_runs_in_registration_order() {
    let gateway = echo_gateway();
    let log = Arc::new(Mutex::new(Vec::new()));

    let recorder = |name: &'static str| {
        let log = log.clone();
        HttpMiddleware::new(move |request: Request, next: Next| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(name);
                next.run(request).await
            }
        })
    };
    let middlewares = vec![recorder("first"), recorder("second")];

    gateway
        .configure(|config| config.http.middlewares = middlewares)
        .await;
    let addr = serve(&gateway, TransportKind::Http).await;

    let response = post(addr, "/pkg.Svc/Echo", "x").await;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);

    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rpc_interceptors_see_metadata_in_order() {
    let gateway = Arc::new(Gateway::new());
    gateway.register_call_handler(
        "pkg",
        "Svc",
        "Tenant",
        handler_fn(|ctx: CallContext, _| async move {
            Ok(Bytes::from(ctx.metadata_value("x-tenant").unwrap_or("-").to_string()))
        }),
    );

    let log = Arc::new(Mutex::new(Vec::new()));
    let recorder = |name: &'static str| {
        let log = log.clone();
        unary_interceptor(move |call: UnaryCall, next: UnaryNext| {
            log.lock().unwrap().push(name);
            next.run(call)
        })
    };
    let interceptors = vec![recorder("outer"), recorder("inner")];
    gateway
        .configure(|config| config.rpc.interceptors = interceptors)
        .await;
    let addr = serve(&gateway, TransportKind::Rpc).await;

    let mut client = RpcClient::connect(addr).await.unwrap();
    let mut request = tonic::Request::new(Bytes::new());
    request
        .metadata_mut()
        .insert("x-tenant", "acme".parse().unwrap());
    let reply = client.call_request("/pkg.Svc/Tenant", request).await.unwrap();

    assert_eq!(reply, Bytes::from_static(b"acme"));
    assert_eq!(*log.lock().unwrap(), vec!["outer", "inner"]);

    drop(client);
    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rpc_notify_reaches_listener() {
    let gateway = Arc::new(Gateway::new());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    gateway.register_listener(
        "pkg",
        "Events",
        "Publish",
        listener_fn(move |_, message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message);
            }
        }),
    );
    let addr = serve(&gateway, TransportKind::Rpc).await;

    let mut client = RpcClient::connect(addr).await.unwrap();
    client
        .notify(
            "/pkg.Events/Publish",
            vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")],
        )
        .await
        .unwrap();

    assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"one"));
    assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"two"));

    drop(client);
    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_task_applies_commits() {
    let gateway = echo_gateway();
    let task = gateway.spawn_restart_task();

    gateway
        .configure(|config| {
            config.listen_addr = any_port();
            config.use_transport(TransportKind::Http);
        })
        .await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while gateway.active_transport().await != Some(TransportKind::Http) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    task.abort();
    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_scheduler_restarts_gateway() {
    let gateway = echo_gateway();
    let mut scheduler = Scheduler::new(Duration::from_millis(10));
    scheduler.register(gateway.clone());

    gateway
        .configure(|config| {
            config.listen_addr = any_port();
            config.use_transport(TransportKind::Rpc);
        })
        .await;
    assert_eq!(scheduler.tick().await, 1);
    assert_eq!(scheduler.tick().await, 0);
    assert_eq!(gateway.active_transport().await, Some(TransportKind::Rpc));

    // stopping the scheduler stops the gateway
    scheduler.run(std::future::ready(())).await;
    assert!(gateway.active_transport().await.is_none());
}

/// Echo gateway plus `/pkg.Svc/Slow`, which reports on `started` and then
/// sleeps far longer than any test waits.
fn slow_gateway() -> (Arc<Gateway>, tokio::sync::mpsc::UnboundedReceiver<()>) {
    let gateway = echo_gateway();
    let (started_tx, started) = tokio::sync::mpsc::unbounded_channel();
    gateway.register_call_handler(
        "pkg",
        "Svc",
        "Slow",
        handler_fn(move |_, request| {
            let started_tx = started_tx.clone();
            async move {
                let _ = started_tx.send(());
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(request)
            }
        }),
    );
    (gateway, started)
}

#[tokio::test]
async fn test_unroutable_http_path_fails_restart() {
    let gateway = echo_gateway();

    for path in ["/*", "/:", "/a/*rest/b"] {
        gateway
            .configure(|config| {
                config.listen_addr = any_port();
                config.use_transport(TransportKind::Http);
                config.http.path = path.to_string();
            })
            .await;

        let err = gateway.restart().await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidHttpPath(_)), "{path}: {err}");
        assert!(err.is_configuration());
        assert!(gateway.active_transport().await.is_none());
    }

    // a valid path on the next change serves again
    gateway
        .configure(|config| config.http.path = "/rpc/*method".to_string())
        .await;
    assert!(matches!(
        gateway.restart().await.unwrap(),
        RestartOutcome::Serving { .. }
    ));
    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rpc_shutdown_timeout_abandons_call() {
    let (gateway, mut started) = slow_gateway();
    gateway
        .configure(|config| config.rpc.shutdown_timeout = Some(Duration::from_millis(100)))
        .await;
    let addr = serve(&gateway, TransportKind::Rpc).await;

    let mut client = RpcClient::connect(addr).await.unwrap();
    let call = tokio::spawn(async move {
        client
            .call("/pkg.Svc/Slow", Bytes::from_static(b"late"))
            .await
    });
    started.recv().await.unwrap();

    let err = gateway.shutdown().await.unwrap_err();
    assert!(matches!(
        err,
        GatewayError::ShutdownTimeout {
            transport: TransportKind::Rpc,
            ..
        }
    ));
    assert!(!err.is_configuration());

    let reply = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .unwrap()
        .unwrap();
    assert!(reply.is_err());
    TcpListener::bind(addr).await.unwrap();
}

#[tokio::test]
async fn test_restart_after_timed_out_stop_serves_new_config() {
    let (gateway, mut started) = slow_gateway();
    gateway
        .configure(|config| config.rpc.shutdown_timeout = Some(Duration::from_millis(100)))
        .await;
    let rpc_addr = serve(&gateway, TransportKind::Rpc).await;

    let mut client = RpcClient::connect(rpc_addr).await.unwrap();
    let call = tokio::spawn(async move {
        client
            .call("/pkg.Svc/Slow", Bytes::from_static(b"late"))
            .await
    });
    started.recv().await.unwrap();

    // the stop inside this restart times out, the HTTP transport still comes up
    let http_addr = serve(&gateway, TransportKind::Http).await;
    assert_eq!(gateway.active_transport().await, Some(TransportKind::Http));
    assert!(call.await.unwrap().is_err());

    let response = post(http_addr, "/pkg.Svc/Echo", "hi").await;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "hi");

    gateway.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_http_shutdown_abandons_request_after_grace() {
    let (gateway, mut started) = slow_gateway();
    let addr = serve(&gateway, TransportKind::Http).await;

    let request = tokio::spawn(async move {
        reqwest::Client::new()
            .post(format!("http://{addr}/pkg.Svc/Slow"))
            .body("late")
            .send()
            .await
    });
    started.recv().await.unwrap();

    let begun = std::time::Instant::now();
    let err = gateway.shutdown().await.unwrap_err();
    assert!(matches!(
        err,
        GatewayError::ShutdownTimeout {
            transport: TransportKind::Http,
            ..
        }
    ));
    assert!(begun.elapsed() >= Duration::from_secs(3));

    let outcome = tokio::time::timeout(Duration::from_secs(5), request)
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.is_err());
    TcpListener::bind(addr).await.unwrap();
}
