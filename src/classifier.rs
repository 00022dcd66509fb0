use axum::extract::ConnectInfo;
use http::{HeaderName, Request};
use std::net::{IpAddr, SocketAddr};

use crate::error::ClassificationError;

/// How a request is mapped to its rate limit identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentifierStrategy {
    /// Client IP address
    Ip,
    /// Value of the given request header
    ApiKey(HeaderName),
    /// Any other configured value; treated as `Ip`
    Unrecognized(String),
}

impl IdentifierStrategy {
    /// Parse the configured strategy name. Unknown names are kept, not rejected.
    pub fn parse(name: &str, api_key_header: Option<HeaderName>) -> Option<Self> {
        match name {
            "IP" => Some(IdentifierStrategy::Ip),
            "API_KEY" => api_key_header.map(IdentifierStrategy::ApiKey),
            other => Some(IdentifierStrategy::Unrecognized(other.to_string())),
        }
    }
}

/// Derives rate limit identifiers from requests
#[derive(Debug, Clone)]
pub struct Classifier {
    strategy: IdentifierStrategy,
    trust_forwarded_for: bool,
}

impl Classifier {
    pub fn new(strategy: IdentifierStrategy, trust_forwarded_for: bool) -> Self {
        Self {
            strategy,
            trust_forwarded_for,
        }
    }

    /// Identifier for `request` under the configured strategy
    pub fn classify<B>(&self, request: &Request<B>) -> Result<String, ClassificationError> {
        match &self.strategy {
            IdentifierStrategy::ApiKey(header) => api_key(request, header),
            IdentifierStrategy::Ip | IdentifierStrategy::Unrecognized(_) => {
                self.client_ip(request).map(|ip| ip.to_string())
            }
        }
    }

    /// Address of the client that sent `request`
    pub fn client_ip<B>(&self, request: &Request<B>) -> Result<IpAddr, ClassificationError> {
        if self.trust_forwarded_for {
            if let Some(forwarded) = request.headers().get("x-forwarded-for") {
                // Left-most entry is the original client
                return forwarded
                    .to_str()
                    .ok()
                    .and_then(|value| value.split(',').next())
                    .and_then(|first| first.trim().parse::<IpAddr>().ok())
                    .ok_or(ClassificationError::InvalidRemoteAddress);
            }
        }

        peer_addr(request)
            .map(|addr| addr.ip())
            .ok_or(ClassificationError::InvalidRemoteAddress)
    }
}

/// Socket address of the directly connected peer, if the server recorded one
pub fn peer_addr<B>(request: &Request<B>) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

fn api_key<B>(request: &Request<B>, header: &HeaderName) -> Result<String, ClassificationError> {
    request
        .headers()
        .get(header)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or(ClassificationError::MissingApiKey)
}
