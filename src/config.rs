use config::{Config, Environment};
use http::HeaderName;
use reqwest::Url;
use serde::Deserialize;
use std::{net::SocketAddr, str::FromStr, time::Duration};
use tracing::{info, warn};

use crate::{
    bucket::BucketParams,
    classifier::IdentifierStrategy,
    error::{ProxyError, Result},
    redis::RedisConfig,
};

const DEFAULT_REDIS_HOST: &str = "localhost";
const DEFAULT_REDIS_PORT: u16 = 6379;
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_ADMIN_PORT: u16 = 9090;
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;

/// Largest integer a Lua number (an f64) holds exactly
pub const MAX_SCRIPT_INTEGER: u64 = 1 << 53;

/// Which store holds the token buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    /// Single-instance, in-process buckets
    Memory,
}

/// Validated proxy configuration, immutable after startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub target_url: Url,
    pub redis: RedisConfig,
    pub store: StoreBackend,
    pub bucket: BucketParams,
    pub strategy: IdentifierStrategy,
    pub trust_forwarded_for: bool,
    pub cache_key_prefix: String,
    pub listen_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub upstream_timeout: Duration,
    pub preserve_host: bool,
}

/// Environment variables as read, before validation.
///
/// Keys are lowercased by the `config` environment source.
#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    target_url: Option<String>,
    redis_url: Option<String>,
    redis_host: Option<String>,
    redis_port: Option<String>,
    redis_password: Option<String>,
    rate_limiter_capacity: Option<String>,
    rate_limiter_refill_rate: Option<String>,
    rate_limiter_ttl: Option<String>,
    rate_limiter_identifier: Option<String>,
    rate_limiter_store: Option<String>,
    api_key_header: Option<String>,
    cache_key_prefix: Option<String>,
    trust_forwarded_for: Option<String>,
    port: Option<String>,
    admin_port: Option<String>,
    upstream_timeout_secs: Option<String>,
    preserve_host: Option<String>,
}

impl ProxyConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_source(Environment::default())
    }

    /// Load configuration from an explicit set of variables
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: config::Map<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::from_source(Environment::default().source(Some(map)))
    }

    fn from_source(source: Environment) -> Result<Self> {
        let raw: RawSettings = Config::builder()
            .add_source(source)
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ProxyError::Config(format!("Failed to read environment: {}", e)))?;

        Self::validate(raw)
    }

    fn validate(raw: RawSettings) -> Result<Self> {
        let target = required(&raw.target_url, "TARGET_URL")?;
        let target_url = Url::parse(target)
            .map_err(|e| ProxyError::Config(format!("Invalid TARGET_URL: {}", e)))?;
        if !matches!(target_url.scheme(), "http" | "https") || !target_url.has_host() {
            return Err(ProxyError::Config(format!(
                "Invalid TARGET_URL: {} is not an absolute http(s) URL",
                target
            )));
        }

        let redis = match present(&raw.redis_url) {
            Some(url) => RedisConfig {
                url: url.to_string(),
                password: present(&raw.redis_password).map(str::to_string),
                ..Default::default()
            },
            None => RedisConfig::from_host_port(
                present(&raw.redis_host).unwrap_or(DEFAULT_REDIS_HOST),
                optional_number(&raw.redis_port, "REDIS_PORT", DEFAULT_REDIS_PORT)?,
                present(&raw.redis_password).map(str::to_string),
            ),
        };

        let store = match present(&raw.rate_limiter_store).map(str::to_ascii_lowercase).as_deref() {
            None | Some("redis") => StoreBackend::Redis,
            Some("memory") => StoreBackend::Memory,
            Some(other) => {
                return Err(ProxyError::Config(format!(
                    "Invalid RATE_LIMITER_STORE: {} (expected redis or memory)",
                    other
                )))
            }
        };

        let capacity: u64 = required_number(&raw.rate_limiter_capacity, "RATE_LIMITER_CAPACITY")?;
        if capacity == 0 {
            return Err(ProxyError::Config("RATE_LIMITER_CAPACITY must be greater than 0".to_string()));
        }
        let refill_rate: u64 = required_number(&raw.rate_limiter_refill_rate, "RATE_LIMITER_REFILL_RATE")?;
        let ttl: u64 = required_number(&raw.rate_limiter_ttl, "RATE_LIMITER_TTL")?;
        if ttl == 0 {
            return Err(ProxyError::Config("RATE_LIMITER_TTL must be greater than 0".to_string()));
        }
        if capacity > MAX_SCRIPT_INTEGER {
            return Err(ProxyError::Config(format!(
                "RATE_LIMITER_CAPACITY must be at most {}",
                MAX_SCRIPT_INTEGER
            )));
        }
        if refill_rate > MAX_SCRIPT_INTEGER {
            return Err(ProxyError::Config(format!(
                "RATE_LIMITER_REFILL_RATE must be at most {}",
                MAX_SCRIPT_INTEGER
            )));
        }
        // Passed to Redis as a signed integer
        if ttl > i64::MAX as u64 {
            return Err(ProxyError::Config("RATE_LIMITER_TTL is out of range".to_string()));
        }

        let api_key_header = present(&raw.api_key_header)
            .map(|name| {
                HeaderName::from_str(name)
                    .map_err(|e| ProxyError::Config(format!("Invalid API_KEY_HEADER: {}", e)))
            })
            .transpose()?;

        let strategy_name = present(&raw.rate_limiter_identifier).unwrap_or_else(|| {
            info!("RATE_LIMITER_IDENTIFIER not set, defaulting to IP");
            "IP"
        });
        let strategy = IdentifierStrategy::parse(strategy_name, api_key_header).ok_or_else(|| {
            ProxyError::Config("API_KEY_HEADER is required when RATE_LIMITER_IDENTIFIER is API_KEY".to_string())
        })?;
        if let IdentifierStrategy::Unrecognized(name) = &strategy {
            warn!("Unrecognized RATE_LIMITER_IDENTIFIER {:?}, falling back to IP", name);
        }

        let trust_forwarded_for = optional_flag(&raw.trust_forwarded_for, "TRUST_FORWARDED_FOR")?;
        let preserve_host = optional_flag(&raw.preserve_host, "PRESERVE_HOST")?;

        let port: u16 = optional_number(&raw.port, "PORT", DEFAULT_PORT)?;
        let admin_port: u16 = optional_number(&raw.admin_port, "ADMIN_PORT", DEFAULT_ADMIN_PORT)?;
        if port == admin_port {
            return Err(ProxyError::Config(format!("PORT and ADMIN_PORT must differ (both {})", port)));
        }

        let upstream_timeout_secs: u64 =
            optional_number(&raw.upstream_timeout_secs, "UPSTREAM_TIMEOUT_SECS", DEFAULT_UPSTREAM_TIMEOUT_SECS)?;

        Ok(Self {
            target_url,
            redis,
            store,
            bucket: BucketParams {
                capacity,
                refill_rate,
                ttl,
            },
            strategy,
            trust_forwarded_for,
            cache_key_prefix: present(&raw.cache_key_prefix).unwrap_or_default().to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            admin_addr: SocketAddr::from(([0, 0, 0, 0], admin_port)),
            upstream_timeout: Duration::from_secs(upstream_timeout_secs),
            preserve_host,
        })
    }
}

/// Non-blank value of a variable
fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str> {
    present(value).ok_or_else(|| ProxyError::Config(format!("{} environment variable is required", name)))
}

fn required_number<T: FromStr>(value: &Option<String>, name: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    let raw = required(value, name)?;
    raw.parse::<T>()
        .map_err(|e| ProxyError::Config(format!("Invalid {}: {:?} ({})", name, raw, e)))
}

fn optional_number<T: FromStr>(value: &Option<String>, name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match present(value) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| ProxyError::Config(format!("Invalid {}: {:?} ({})", name, raw, e))),
    }
}

fn optional_flag(value: &Option<String>, name: &str) -> Result<bool> {
    match present(value) {
        None => Ok(false),
        Some(raw) => raw.parse::<bool>().map_err(|_| {
            ProxyError::Config(format!("Invalid {}: {} (expected true or false)", name, raw))
        }),
    }
}
