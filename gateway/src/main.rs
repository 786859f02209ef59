//! Gateway main entry point
//!
//! Serves a small set of built-in handlers over the transport selected by the
//! environment, and applies configuration changes on the scheduler tick.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use network_gateway::{handler_fn, Gateway, GatewaySettings, Scheduler};

/// How often pending configuration changes are applied
const TICK: Duration = Duration::from_secs(1);

async fn run_server() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "network_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let settings = GatewaySettings::from_env();
    tracing::info!("Starting Gateway v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Transport {} on {} (enabled: {})",
        settings.transport,
        settings.listen_addr,
        settings.enabled
    );

    let gateway = Arc::new(Gateway::new());
    register_builtin_handlers(&gateway);

    {
        let mut config = gateway.config_mut().await;
        settings
            .apply_to(&mut config)
            .context("Invalid gateway settings")?;
    }

    // Apply the initial configuration right away instead of waiting a tick
    gateway.restart().await.context("Failed to start gateway")?;

    let mut scheduler = Scheduler::new(TICK);
    scheduler.register(gateway.clone());
    scheduler
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
            }
            tracing::info!("Shutdown signal received");
        })
        .await;

    Ok(())
}

fn register_builtin_handlers(gateway: &Gateway) {
    gateway.register_call_handler(
        "gateway",
        "Gateway",
        "Echo",
        handler_fn(|_, request| async move { Ok(request) }),
    );

    gateway.register_call_handler(
        "gateway",
        "Gateway",
        "Health",
        handler_fn(|_, _| async {
            let body = serde_json::json!({
                "status": "ok",
                "version": env!("CARGO_PKG_VERSION"),
            });
            Ok(Bytes::from(body.to_string()))
        }),
    );
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "run" => {}
            other => {
                eprintln!("Unknown argument: {}", other);
                print_help();
                return Ok(());
            }
        }
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_server())
}

fn print_help() {
    println!("Network Gateway - one handler registry served over gRPC or HTTP");
    println!();
    println!("Usage:");
    println!("  network-gateway [run]    Run in the foreground until ctrl-c");
    println!();
    println!("Built-in methods:");
    println!("  /gateway.Gateway/Echo    Reply with the request body");
    println!("  /gateway.Gateway/Health  Reply with a JSON status");
    println!();
    println!("Environment Variables:");
    println!("  GATEWAY_ENABLED                     Serve at all (default: true)");
    println!("  GATEWAY_TRANSPORT                   none, http or rpc (default: none)");
    println!("  GATEWAY_LISTEN_ADDR                 Listen address (default: 127.0.0.1:50051)");
    println!("  GATEWAY_HTTP_PATH                   HTTP route (default: /*method)");
    println!("  GATEWAY_HTTP_READ_TIMEOUT_SECS      HTTP body read timeout, 0 = none");
    println!("  GATEWAY_HTTP_WRITE_TIMEOUT_SECS     HTTP response timeout, 0 = none");
    println!("  GATEWAY_RPC_SHUTDOWN_TIMEOUT_SECS   gRPC drain bound on restart, 0 = none");
    println!("  RUST_LOG                            Log filter (default: network_gateway=info)");
}
