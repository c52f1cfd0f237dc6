// src/main.rs
use anyhow::Result;
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::Layer;
use tracing::{error, info};

use mlnode_balancer::{
    config::Settings,
    metrics::MetricsRegistry,
    monitor::Monitor,
    proxy::{BackendPool, Proxy},
    server::{RequestHandler, ServerBuilder, VersionRewriteLayer},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mlnode_balancer=info".parse()?)
                .add_directive("hyper=info".parse()?),
        )
        .init();

    let settings = Arc::new(Settings::load()?);
    info!(backends = settings.backend_urls.len(), "loaded configuration");

    // Initialize metrics
    let metrics_registry = Arc::new(MetricsRegistry::new()?);
    let metrics = metrics_registry.collector();

    // Create backend pool
    let pool = Arc::new(BackendPool::new(&settings));

    // One HTTP client is shared by every proxied request and every monitor.
    // Redirects are passed through to clients, never followed upstream.
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;

    // Start one monitor task per backend
    let monitor = Monitor::new(settings.clone(), client.clone(), metrics.clone());
    let monitor_tasks = monitor.start(&pool);

    // Start the sidecar metrics server if configured
    if let Some(port) = settings.metrics_port {
        let metrics_addr: SocketAddr = ([0, 0, 0, 0], port).into();
        start_metrics_server(metrics_addr, metrics_registry.clone()).await?;
    }

    // Create the proxy and its handler stack
    let proxy = Arc::new(Proxy::new(settings.clone(), pool, client, metrics));
    let handler = VersionRewriteLayer::new().layer(RequestHandler::new(proxy));

    info!("starting load balancer on {}", settings.listen_addr);
    ServerBuilder::new(settings.listen_addr)
        .with_handler(handler)
        .serve(shutdown_signal())
        .await?;

    // Teardown order: stop accepting (done above), stop the monitors and
    // await them, then the shared client drops.
    monitor.shutdown();
    for task in monitor_tasks {
        let _ = task.await;
    }
    info!("shutdown complete");

    Ok(())
}

async fn start_metrics_server(addr: SocketAddr, registry: Arc<MetricsRegistry>) -> Result<()> {
    let make_service = hyper::service::make_service_fn(move |_| {
        let registry = registry.clone();

        async move {
            Ok::<_, Infallible>(hyper::service::service_fn(move |req: Request<Body>| {
                let registry = registry.clone();

                async move {
                    if req.uri().path() == "/metrics" {
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .header("Content-Type", "text/plain; version=0.0.4")
                                .body(Body::from(registry.gather()))
                                .unwrap(),
                        )
                    } else {
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(StatusCode::NOT_FOUND)
                                .body(Body::from("Not Found"))
                                .unwrap(),
                        )
                    }
                }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_service);
    info!("metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("metrics server error: {}", e);
        }
    });

    Ok(())
}

// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
