use axum::{http::HeaderMap, routing::any, Router};
use rate_limit_proxy::{
    bucket::MemoryTokenBucket,
    config::ProxyConfig,
    metrics::Metrics,
    service::{router, ProxyService},
    utils::TimeSource,
};
use reqwest::{Client, StatusCode};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;

const START: i64 = 1_700_000_000;

/// Upstream that echoes what it received
async fn spawn_upstream() -> String {
    let app = Router::new().route(
        "/*path",
        any(|headers: HeaderMap, uri: axum::http::Uri, body: String| async move {
            let forwarded = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            (
                [("x-upstream", "yes")],
                format!("path={} forwarded={} body={}", uri, forwarded, body),
            )
        }),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn spawn_proxy(vars: &[(&str, &str)], time_source: TimeSource) -> String {
    let config = ProxyConfig::from_vars(vars.iter().map(|(k, v)| (k.to_string(), v.to_string()))).unwrap();
    let metrics = Arc::new(Metrics::new().unwrap());
    let service = Arc::new(
        ProxyService::new(&config, Arc::new(MemoryTokenBucket::new()), metrics)
            .unwrap()
            .with_time_source(time_source),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router(service).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_api_key_scenario_over_http() {
    let upstream = spawn_upstream().await;
    let clock = TimeSource::manual(START);
    let proxy = spawn_proxy(
        &[
            ("TARGET_URL", upstream.as_str()),
            ("RATE_LIMITER_CAPACITY", "2"),
            ("RATE_LIMITER_REFILL_RATE", "1"),
            ("RATE_LIMITER_TTL", "60"),
            ("RATE_LIMITER_IDENTIFIER", "API_KEY"),
            ("API_KEY_HEADER", "X-API-Key"),
        ],
        clock.clone(),
    )
    .await;
    let client = Client::new();
    let get = |key: Option<&'static str>| {
        let mut request = client.get(format!("{}/v1/health", proxy));
        if let Some(key) = key {
            request = request.header("x-api-key", key);
        }
        request.send()
    };

    let response = get(None).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.text().await.unwrap().contains("Missing API Key"));

    assert_eq!(get(Some("A")).await.unwrap().status(), StatusCode::OK);
    assert_eq!(get(Some("A")).await.unwrap().status(), StatusCode::OK);

    let response = get(Some("A")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.text().await.unwrap().contains("Rate limit exceeded"));

    clock.advance(1);
    assert_eq!(get(Some("A")).await.unwrap().status(), StatusCode::OK);
    assert_eq!(get(Some("A")).await.unwrap().status(), StatusCode::TOO_MANY_REQUESTS);

    assert_eq!(get(Some("B")).await.unwrap().status(), StatusCode::OK);
}

#[tokio::test]
async fn test_request_is_relayed_verbatim() {
    let upstream = spawn_upstream().await;
    let proxy = spawn_proxy(
        &[
            ("TARGET_URL", upstream.as_str()),
            ("RATE_LIMITER_CAPACITY", "5"),
            ("RATE_LIMITER_REFILL_RATE", "1"),
            ("RATE_LIMITER_TTL", "60"),
        ],
        TimeSource::manual(START),
    )
    .await;

    let response = Client::new()
        .post(format!("{}/orders/42?expand=items", proxy))
        .body("hello upstream")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-upstream"], "yes");
    assert_eq!(
        response.text().await.unwrap(),
        "path=/orders/42?expand=items forwarded=127.0.0.1 body=hello upstream"
    );
}

#[tokio::test]
async fn test_ttl_expiry_restores_full_bucket() {
    let upstream = spawn_upstream().await;
    let clock = TimeSource::manual(START);
    let proxy = spawn_proxy(
        &[
            ("TARGET_URL", upstream.as_str()),
            ("RATE_LIMITER_CAPACITY", "1"),
            ("RATE_LIMITER_REFILL_RATE", "0"),
            ("RATE_LIMITER_TTL", "30"),
        ],
        clock.clone(),
    )
    .await;
    let client = Client::new();
    let url = format!("{}/anything", proxy);

    assert_eq!(client.get(&url).send().await.unwrap().status(), StatusCode::OK);

    // No refill while the bucket is kept alive
    clock.advance(20);
    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().get("retry-after").is_none());

    clock.advance(30);
    assert_eq!(client.get(&url).send().await.unwrap().status(), StatusCode::OK);
}
