use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use std::{sync::Arc, time::Instant};
use tracing::{debug, error, warn};

use crate::{
    bucket::{BucketParams, Decision, TokenBucketStore},
    classifier::{peer_addr, Classifier},
    config::ProxyConfig,
    error::{ClassificationError, ProxyError, Result},
    forwarder::Forwarder,
    metrics::{Metrics, Outcome},
    utils::{bucket_key, TimeSource},
};

/// Per-request decision: classify, evaluate the bucket, then forward or reject
pub struct ProxyService {
    store: Arc<dyn TokenBucketStore>,
    classifier: Classifier,
    forwarder: Forwarder,
    params: BucketParams,
    key_prefix: String,
    time_source: TimeSource,
    metrics: Arc<Metrics>,
}

impl ProxyService {
    /// Create a new proxy service
    pub fn new(
        config: &ProxyConfig,
        store: Arc<dyn TokenBucketStore>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        Ok(Self {
            store,
            classifier: Classifier::new(config.strategy.clone(), config.trust_forwarded_for),
            forwarder: Forwarder::new(config.target_url.clone(), config.upstream_timeout, config.preserve_host)?,
            params: config.bucket,
            key_prefix: config.cache_key_prefix.clone(),
            time_source: TimeSource::new(),
            metrics,
        })
    }

    /// Replace the clock used for refill timestamps
    pub fn with_time_source(mut self, time_source: TimeSource) -> Self {
        self.time_source = time_source;
        self
    }

    pub fn time_source(&self) -> &TimeSource {
        &self.time_source
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Health check for the service
    pub async fn health_check(&self) -> Result<()> {
        self.store.health_check().await
    }

    /// Evaluate the bucket for `identifier`.
    ///
    /// The store call runs on its own task: once dispatched it completes even
    /// if the caller is dropped because the client went away.
    pub async fn check(&self, identifier: &str) -> Result<Decision> {
        let store = self.store.clone();
        let key = bucket_key(&self.key_prefix, identifier);
        let params = self.params;
        let now = self.time_source.unix_now();

        let start = Instant::now();
        let result = tokio::spawn(async move { store.evaluate(&key, &params, now).await })
            .await
            .map_err(|e| ProxyError::Store(format!("Token bucket task failed: {}", e)))
            .and_then(|evaluated| evaluated);
        self.metrics.record_store_duration(start.elapsed().as_secs_f64());

        match &result {
            Ok(_) => self.metrics.record_store_operation("evaluate", "success"),
            Err(_) => self.metrics.record_store_operation("evaluate", "error"),
        }
        result
    }

    /// Handle one inbound request end to end
    pub async fn handle(&self, request: Request<Body>) -> Response {
        let _timer = self.metrics.start_request_timer();

        let identifier = match self.classifier.classify(&request) {
            Ok(identifier) => identifier,
            Err(e) => {
                debug!("Rejecting {} {}: {}", request.method(), request.uri(), e);
                self.metrics.record_outcome(match e {
                    ClassificationError::MissingApiKey => Outcome::MissingApiKey,
                    ClassificationError::InvalidRemoteAddress => Outcome::InvalidRemoteAddress,
                });
                return ProxyError::from(e).into_response();
            }
        };

        let decision = match self.check(&identifier).await {
            Ok(decision) => decision,
            Err(e) => {
                error!("Rate limit check failed for {}: {}", identifier, e);
                self.metrics.record_outcome(Outcome::StoreError);
                return e.into_response();
            }
        };

        if !decision.allowed {
            debug!("Rate limit exceeded for {}", identifier);
            self.metrics.record_outcome(Outcome::RateLimited);
            return self.rate_limited_response(&decision);
        }

        let client_ip = peer_addr(&request).map(|addr| addr.ip());
        match self.forwarder.forward(request, client_ip).await {
            Ok(response) => {
                self.metrics.record_outcome(Outcome::Allowed);
                response
            }
            Err(e) => {
                warn!("Forwarding request from {} failed: {}", identifier, e);
                self.metrics.record_outcome(Outcome::UpstreamError);
                e.into_response()
            }
        }
    }

    fn rate_limited_response(&self, decision: &Decision) -> Response {
        let mut response = (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response();
        let headers = response.headers_mut();
        headers.insert("x-ratelimit-limit", HeaderValue::from(self.params.capacity));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
        if self.params.refill_rate > 0 {
            // Refill is per whole second
            headers.insert(header::RETRY_AFTER, HeaderValue::from(1u64));
        }
        response
    }
}

/// Router sending every method and path through the limiter
pub fn router(service: Arc<ProxyService>) -> Router {
    Router::new().fallback(proxy_handler).with_state(service)
}

async fn proxy_handler(State(service): State<Arc<ProxyService>>, request: Request<Body>) -> Response {
    service.handle(request).await
}
