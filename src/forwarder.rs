use axum::body::{Body, HttpBody};
use http::{header, HeaderMap, HeaderName, HeaderValue, Request, Response, Uri};
use reqwest::{redirect, Client, Url};
use std::{net::IpAddr, time::Duration};
use tracing::debug;

use crate::error::{ProxyError, Result};

/// Headers that describe a single connection and are never relayed
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Relays approved requests to the single upstream origin
#[derive(Clone)]
pub struct Forwarder {
    client: Client,
    target: Url,
    preserve_host: bool,
}

impl Forwarder {
    /// `preserve_host` relays the inbound `Host` instead of the target's
    pub fn new(target: Url, timeout: Duration, preserve_host: bool) -> Result<Self> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            target,
            preserve_host,
        })
    }

    /// Send `request` upstream, streaming both bodies.
    ///
    /// `client_ip` is appended to `X-Forwarded-For` when known.
    pub async fn forward(&self, request: Request<Body>, client_ip: Option<IpAddr>) -> Result<Response<Body>> {
        let (parts, body) = request.into_parts();
        let url = upstream_url(&self.target, &parts.uri);

        let mut headers = strip_hop_by_hop(&parts.headers);
        if !self.preserve_host {
            headers.remove(header::HOST);
        }
        if let Some(ip) = client_ip {
            append_forwarded_for(&mut headers, ip);
        }

        debug!("Forwarding {} {}", parts.method, url);
        let mut outbound = self.client.request(parts.method, url).headers(headers);
        // Bodyless requests must not turn into empty chunked uploads
        if !body.is_end_stream() {
            outbound = outbound.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }
        let upstream = outbound.send().await?;

        let mut response = Response::builder().status(upstream.status());
        if let Some(response_headers) = response.headers_mut() {
            *response_headers = strip_hop_by_hop(upstream.headers());
        }
        response
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| ProxyError::Forward(format!("Failed to build upstream response: {}", e)))
    }
}

/// Join the target origin with the path and query of an inbound request
pub fn upstream_url(target: &Url, uri: &Uri) -> Url {
    let mut url = target.clone();

    let base = target.path().trim_end_matches('/');
    let path = uri.path();
    let joined = if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    };
    url.set_path(&joined);

    let query = match (target.query().filter(|q| !q.is_empty()), uri.query().filter(|q| !q.is_empty())) {
        (Some(t), Some(r)) => Some(format!("{}&{}", t, r)),
        (Some(t), None) => Some(t.to_string()),
        (None, Some(r)) => Some(r.to_string()),
        (None, None) => None,
    };
    url.set_query(query.as_deref());
    url
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = headers.clone();

    // Headers named in Connection are hop-by-hop too
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in HOP_BY_HOP.iter().chain(named.iter()) {
        forwarded.remove(name);
    }
    forwarded
}

fn append_forwarded_for(headers: &mut HeaderMap, ip: IpAddr) {
    let prior: Vec<String> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::to_string)
        .collect();

    let value = if prior.is_empty() {
        ip.to_string()
    } else {
        format!("{}, {}", prior.join(", "), ip)
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Bytes, Router};
    use futures::{SinkExt, StreamExt};
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    /// Upstream that reports the first body chunk as soon as it arrives
    /// and answers with the whole body
    async fn spawn_chunk_reporter(first_chunk: oneshot::Sender<Bytes>) -> String {
        let first_chunk = Arc::new(Mutex::new(Some(first_chunk)));
        let app = Router::new().fallback(move |body: Body| {
            let first_chunk = first_chunk.clone();
            async move {
                let mut stream = body.into_data_stream();
                let mut received = Vec::new();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.unwrap();
                    let sender = first_chunk.lock().unwrap().take();
                    if let Some(sender) = sender {
                        let _ = sender.send(chunk.clone());
                    }
                    received.extend_from_slice(&chunk);
                }
                received
            }
        });
        spawn(app).await
    }

    async fn spawn_host_echo() -> String {
        let app = Router::new().fallback(|headers: HeaderMap| async move {
            headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string()
        });
        spawn(app).await
    }

    async fn body_text(response: Response<Body>) -> String {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_request_body_reaches_upstream_before_it_ends() {
        let (first_tx, first_rx) = oneshot::channel();
        let target = spawn_chunk_reporter(first_tx).await;
        let forwarder = Forwarder::new(url(&target), Duration::from_secs(5), false).unwrap();

        let (mut chunks, body) = futures::channel::mpsc::channel::<std::result::Result<Bytes, std::io::Error>>(4);
        let request = Request::builder()
            .method("POST")
            .uri("/upload")
            .body(Body::from_stream(body))
            .unwrap();
        let forwarding = tokio::spawn(async move { forwarder.forward(request, None).await });

        chunks.send(Ok(Bytes::from_static(b"first "))).await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), first_rx)
            .await
            .expect("first chunk should be relayed while the body is still open")
            .unwrap();
        assert_eq!(first, "first ");

        chunks.send(Ok(Bytes::from_static(b"second"))).await.unwrap();
        drop(chunks);

        let response = forwarding.await.unwrap().unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(body_text(response).await, "first second");
    }

    #[tokio::test]
    async fn test_host_header_is_replaced_by_default() {
        let target = spawn_host_echo().await;
        let request = || {
            Request::builder()
                .uri("/")
                .header(header::HOST, "public.example.com")
                .body(Body::empty())
                .unwrap()
        };

        let forwarder = Forwarder::new(url(&target), Duration::from_secs(5), false).unwrap();
        let response = forwarder.forward(request(), None).await.unwrap();
        assert_eq!(body_text(response).await, target.trim_start_matches("http://"));

        let forwarder = Forwarder::new(url(&target), Duration::from_secs(5), true).unwrap();
        let response = forwarder.forward(request(), None).await.unwrap();
        assert_eq!(body_text(response).await, "public.example.com");
    }

    #[test]
    fn test_upstream_url_joins_paths() {
        let uri: Uri = "/v1/health".parse().unwrap();
        assert_eq!(
            upstream_url(&url("http://origin:8000"), &uri).as_str(),
            "http://origin:8000/v1/health"
        );
        assert_eq!(
            upstream_url(&url("http://origin:8000/api/"), &uri).as_str(),
            "http://origin:8000/api/v1/health"
        );
        assert_eq!(
            upstream_url(&url("http://origin:8000/api"), &uri).as_str(),
            "http://origin:8000/api/v1/health"
        );
    }

    #[test]
    fn test_upstream_url_merges_queries() {
        let uri: Uri = "/search?q=rust".parse().unwrap();
        assert_eq!(
            upstream_url(&url("http://origin/?tenant=a"), &uri).as_str(),
            "http://origin/search?tenant=a&q=rust"
        );
        assert_eq!(
            upstream_url(&url("http://origin"), &uri).as_str(),
            "http://origin/search?q=rust"
        );

        let plain: Uri = "/".parse().unwrap();
        assert_eq!(upstream_url(&url("http://origin"), &plain).as_str(), "http://origin/");
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "keep-alive, x-session-hop".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());
        headers.insert("x-session-hop", "1".parse().unwrap());
        headers.insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());
        headers.insert("x-api-key", "secret".parse().unwrap());

        let stripped = strip_hop_by_hop(&headers);
        assert_eq!(stripped.len(), 2);
        assert_eq!(stripped[header::CONTENT_TYPE], "text/plain");
        assert_eq!(stripped["x-api-key"], "secret");
    }

    #[test]
    fn test_append_forwarded_for() {
        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, "10.0.0.1".parse().unwrap());
        assert_eq!(headers[&X_FORWARDED_FOR], "10.0.0.1");

        append_forwarded_for(&mut headers, "10.0.0.2".parse().unwrap());
        assert_eq!(headers[&X_FORWARDED_FOR], "10.0.0.1, 10.0.0.2");
    }
}
