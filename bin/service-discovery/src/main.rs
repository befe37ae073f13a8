use anyhow::{Context, Result};
use discovery_core::{DiscoveryConfig, GrpcDialer, ServiceDiscovery, ServicePool};
use discovery_etcd::EtcdClient;
use http_body_util::Full;
use hyper::{
    body::Bytes,
    header::{HeaderValue, CONTENT_TYPE},
    server::conn::http1,
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const LISTEN_ADDR_ENV: &str = "DISCOVERY_LISTEN_ADDR";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9090";

type Pool = ServicePool<GrpcDialer>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting service-discovery daemon...");

    let config = DiscoveryConfig::from_env();
    info!("etcd endpoints: {:?}", config.etcd_endpoints);

    // Without a store client there is nothing to discover
    let store = Arc::new(EtcdClient::from_config(&config).context("Failed to create etcd client")?);
    let discovery = ServiceDiscovery::new(config, store, GrpcDialer::new());
    let pool = discovery.initialize().await?;

    let listen_addr: SocketAddr = std::env::var(LISTEN_ADDR_ENV)
        .unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string())
        .parse()
        .with_context(|| format!("Invalid {}", LISTEN_ADDR_ENV))?;
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Status server listening on {}", listen_addr);

    tokio::spawn(report_pool(pool.clone()));

    tokio::select! {
        _ = serve(listener, pool) => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown signal received, exiting...");
        }
    }

    Ok(())
}

/// Periodically log the pool contents
async fn report_pool(pool: Arc<Pool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let snapshot = pool.snapshot().await;
        let endpoints: usize = snapshot.iter().map(|s| s.endpoints.len()).sum();
        info!(
            "Service pool has {} services and {} endpoints",
            snapshot.len(),
            endpoints
        );
        for service in &snapshot {
            debug!("{}: {} endpoints", service.name, service.endpoints.len());
        }
    }
}

async fn serve(listener: TcpListener, pool: Arc<Pool>) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Error accepting connection: {}", e);
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let pool = pool.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| handle_request(req, pool.clone()));

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving HTTP connection from {}: {}", peer_addr, e);
            }
        });
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    pool: Arc<Pool>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path();
    debug!("{} {}", req.method(), path);

    if req.method() != Method::GET {
        return Ok(respond(
            StatusCode::METHOD_NOT_ALLOWED,
            "text/plain",
            "Method Not Allowed\n".to_string(),
        ));
    }

    let response = match path {
        "/metrics" => match pool.metrics().gather() {
            Ok(text) => respond(StatusCode::OK, "text/plain; version=0.0.4", text),
            Err(e) => respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                format!("Failed to gather metrics: {}\n", e),
            ),
        },
        "/services" => {
            let snapshot = pool.snapshot().await;
            match serde_json::to_string_pretty(&snapshot) {
                Ok(json) => respond(StatusCode::OK, "application/json", json),
                Err(e) => respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    format!("Failed to encode services: {}\n", e),
                ),
            }
        }
        "/healthz" => respond(StatusCode::OK, "text/plain", "OK\n".to_string()),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found\n".to_string()),
    };

    Ok(response)
}
