use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use prometheus::TextEncoder;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rate_limit_proxy::{
    bucket::{MemoryTokenBucket, RedisTokenBucket, TokenBucketStore},
    config::{ProxyConfig, StoreBackend},
    metrics::Metrics,
    redis::RedisClient,
    service::{self, ProxyService},
    utils::TimeSource,
};

#[derive(Clone)]
struct AppState {
    service: Arc<ProxyService>,
    metrics: Arc<Metrics>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rate_limit_proxy=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Rate Limit Proxy");

    // Configuration problems abort before anything listens
    let config = ProxyConfig::from_env()?;
    info!(
        "Forwarding to {} with capacity={} refill_rate={}/s ttl={}s strategy={:?}",
        config.target_url,
        config.bucket.capacity,
        config.bucket.refill_rate,
        config.bucket.ttl,
        config.strategy
    );

    let metrics = Arc::new(Metrics::new()?);
    let store = create_store(&config).await?;
    let service = Arc::new(ProxyService::new(&config, store, metrics.clone())?);
    let state = AppState { service, metrics };

    let proxy_server = start_proxy_server(state.service.clone(), config.listen_addr);
    let admin_server = start_admin_server(state.clone(), config.admin_addr);

    info!("Proxy listening on {}", config.listen_addr);
    info!("Admin server listening on {}", config.admin_addr);

    // Wait for shutdown signal
    tokio::select! {
        result = proxy_server => {
            if let Err(e) = result {
                warn!("Proxy server error: {}", e);
            }
        }
        result = admin_server => {
            if let Err(e) = result {
                warn!("Admin server error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    info!("Proxy stopped");
    Ok(())
}

async fn create_store(config: &ProxyConfig) -> Result<Arc<dyn TokenBucketStore>> {
    match config.store {
        StoreBackend::Redis => {
            let client = RedisClient::new(config.redis.clone()).await?;
            Ok(Arc::new(RedisTokenBucket::new(client)))
        }
        StoreBackend::Memory => {
            warn!("Using in-process token buckets; limits are not shared between instances");
            let store = Arc::new(MemoryTokenBucket::new());
            spawn_purge_task(store.clone());
            Ok(store)
        }
    }
}

/// Periodically drop idle in-process buckets
fn spawn_purge_task(store: Arc<MemoryTokenBucket>) {
    let time_source = TimeSource::new();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            let purged = store.purge_expired(time_source.unix_now()).await;
            if purged > 0 {
                info!("Purged {} expired buckets", purged);
            }
        }
    });
}

async fn start_proxy_server(service: Arc<ProxyService>, addr: SocketAddr) -> Result<()> {
    let app = service::router(service);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}

async fn start_admin_server(state: AppState, addr: SocketAddr) -> Result<()> {
    let app: Router = Router::new()
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.service.health_check().await {
        Ok(()) => Ok(Json(json!({
            "status": "healthy",
            "timestamp": state.service.time_source().utc_now().to_rfc3339()
        }))),
        Err(e) => {
            warn!("Health check failed: {}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics) => Ok(metrics),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}
