use redis::{aio::ConnectionManager, FromRedisValue, IntoConnectionInfo, Script};
use std::time::Duration;
use crate::error::{Result, ProxyError};

/// Redis client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub url: String,
    pub password: Option<String>,
    pub connection_timeout: Option<Duration>,
    pub command_timeout: Option<Duration>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            password: None,
            connection_timeout: Some(Duration::from_secs(5)),
            command_timeout: Some(Duration::from_secs(1)),
        }
    }
}

impl RedisConfig {
    /// Build a configuration for `host:port`
    pub fn from_host_port(host: &str, port: u16, password: Option<String>) -> Self {
        Self {
            url: format!("redis://{}:{}", host, port),
            password,
            ..Default::default()
        }
    }
}

/// Redis client wrapper shared by every request task.
///
/// `ConnectionManager` multiplexes one connection and reconnects on
/// failure; cloning it is cheap.
#[derive(Clone)]
pub struct RedisClient {
    connection: ConnectionManager,
    config: RedisConfig,
}

impl RedisClient {
    /// Create a new Redis client and verify it with PING
    pub async fn new(config: RedisConfig) -> Result<Self> {
        use tracing::{info, warn};

        info!("Creating Redis client for URL: {}", config.url);

        let mut connection_info = config.url.as_str().into_connection_info().map_err(|e| {
            warn!("Invalid Redis URL: {}", e);
            ProxyError::Redis(e)
        })?;
        if let Some(password) = &config.password {
            connection_info.redis.password = Some(password.clone());
        }

        let client = redis::Client::open(connection_info)
            .map_err(|e| {
                warn!("Failed to create Redis client: {}", e);
                ProxyError::Redis(e)
            })?;

        let connect_timeout = config.connection_timeout.unwrap_or(Duration::from_secs(10));
        let connection = match tokio::time::timeout(connect_timeout, client.get_connection_manager()).await {
            Ok(Ok(conn)) => {
                info!("Connection manager established successfully");
                conn
            }
            Ok(Err(e)) => {
                warn!("Failed to create connection manager: {}", e);
                return Err(ProxyError::Redis(e));
            }
            Err(_) => {
                warn!("Timeout while creating connection manager ({}s)", connect_timeout.as_secs());
                return Err(ProxyError::Store(
                    "Timeout while creating Redis connection manager".to_string()
                ));
            }
        };

        let redis_client = Self { connection, config };
        redis_client.health_check().await.map_err(|e| {
            warn!("Redis PING failed: {}", e);
            e
        })?;

        info!("Redis client initialized successfully");
        Ok(redis_client)
    }

    /// Run a Lua script against a single key.
    ///
    /// Uses EVALSHA and falls back to loading the script on NOSCRIPT.
    pub async fn invoke_script<T: FromRedisValue>(
        &self,
        script: &Script,
        key: &str,
        args: &[i64],
    ) -> Result<T> {
        let mut conn = self.connection.clone();
        let mut invocation = script.key(key);
        for arg in args {
            invocation.arg(*arg);
        }

        match self.config.command_timeout {
            Some(timeout) => tokio::time::timeout(timeout, invocation.invoke_async(&mut conn))
                .await
                .map_err(|_| ProxyError::Store(format!(
                    "Redis script timed out after {}ms",
                    timeout.as_millis()
                )))?
                .map_err(ProxyError::Redis),
            None => invocation.invoke_async(&mut conn).await.map_err(ProxyError::Redis),
        }
    }

    /// Check if the connection is healthy
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let cmd = redis::cmd("PING");
        let ping = cmd.query_async::<_, ()>(&mut conn);
        match self.config.command_timeout {
            Some(timeout) => tokio::time::timeout(timeout, ping)
                .await
                .map_err(|_| ProxyError::Store("Redis PING timed out".to_string()))?
                .map_err(ProxyError::Redis),
            None => ping.await.map_err(ProxyError::Redis),
        }
    }
}
