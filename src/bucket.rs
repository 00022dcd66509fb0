//! Token bucket evaluation.
//!
//! A bucket holds up to `capacity` tokens and refills lazily at
//! `refill_rate` tokens per whole second of elapsed time. Every permitted
//! request consumes one token. The check-and-consume step is atomic per
//! key: [`RedisTokenBucket`] runs it as a single Lua script, and
//! [`MemoryTokenBucket`] runs it under a lock.

use async_trait::async_trait;
use redis::Script;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    error::{ProxyError, Result},
    redis::RedisClient,
};

/// Lua source of the atomic check-and-consume step
pub const TOKEN_BUCKET_SCRIPT: &str = include_str!("token_bucket.lua");

/// Process-wide bucket parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketParams {
    /// Maximum number of tokens, > 0
    pub capacity: u64,
    /// Tokens added per elapsed second
    pub refill_rate: u64,
    /// Seconds of inactivity before a bucket is discarded, > 0
    pub ttl: u64,
}

/// Outcome of a single evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Tokens left after this evaluation
    pub remaining: u64,
}

/// Persisted bucket state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    pub tokens: u64,
    pub last_refill: i64,
}

impl BucketState {
    /// A full bucket as seen on first use
    pub fn full(params: &BucketParams, now: i64) -> Self {
        Self {
            tokens: params.capacity,
            last_refill: now,
        }
    }

    /// Refill for the elapsed time, then try to take one token.
    ///
    /// Mirrors `token_bucket.lua`. Elapsed time is clamped to zero so a
    /// clock that goes backwards never drains a bucket.
    pub fn refill_and_take(self, params: &BucketParams, now: i64) -> (Self, bool) {
        let elapsed = now.saturating_sub(self.last_refill).max(0) as u64;
        let refilled = self
            .tokens
            .saturating_add(elapsed.saturating_mul(params.refill_rate))
            .min(params.capacity);

        let (tokens, allowed) = if refilled >= 1 {
            (refilled - 1, true)
        } else {
            (refilled, false)
        };

        (
            Self {
                tokens,
                last_refill: now,
            },
            allowed,
        )
    }
}

/// Atomic token bucket storage
#[async_trait]
pub trait TokenBucketStore: Send + Sync {
    /// Refill and try to consume one token from the bucket at `key`
    async fn evaluate(&self, key: &str, params: &BucketParams, now: i64) -> Result<Decision>;

    /// Health check for the store
    async fn health_check(&self) -> Result<()>;
}

/// Redis-backed buckets shared by every proxy instance
pub struct RedisTokenBucket {
    client: RedisClient,
    script: Script,
}

impl RedisTokenBucket {
    pub fn new(client: RedisClient) -> Self {
        Self::with_script(client, Script::new(TOKEN_BUCKET_SCRIPT))
    }

    /// Use a different script body. Only useful for exercising failure paths.
    pub fn with_script(client: RedisClient, script: Script) -> Self {
        Self { client, script }
    }
}

#[async_trait]
impl TokenBucketStore for RedisTokenBucket {
    async fn evaluate(&self, key: &str, params: &BucketParams, now: i64) -> Result<Decision> {
        let args = [
            params.capacity as i64,
            params.refill_rate as i64,
            params.ttl as i64,
            now,
        ];
        let (allowed, remaining): (i64, i64) =
            self.client.invoke_script(&self.script, key, &args).await?;

        if remaining < 0 {
            return Err(ProxyError::Store(format!(
                "token bucket script returned negative remaining count {}",
                remaining
            )));
        }

        debug!("Bucket {} evaluated: allowed={} remaining={}", key, allowed != 0, remaining);
        Ok(Decision {
            allowed: allowed != 0,
            remaining: remaining as u64,
        })
    }

    async fn health_check(&self) -> Result<()> {
        self.client.health_check().await
    }
}

#[derive(Debug, Clone, Copy)]
struct StoredBucket {
    state: BucketState,
    expires_at: i64,
}

/// In-process buckets for a single proxy instance.
///
/// Expiry is measured against the `now` passed to `evaluate`, so it
/// follows whatever clock the caller uses.
#[derive(Default)]
pub struct MemoryTokenBucket {
    buckets: Mutex<HashMap<String, StoredBucket>>,
}

impl MemoryTokenBucket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of a live bucket
    pub async fn get(&self, key: &str, now: i64) -> Option<BucketState> {
        let buckets = self.buckets.lock().await;
        buckets
            .get(key)
            .filter(|stored| stored.expires_at > now)
            .map(|stored| stored.state)
    }

    /// Drop every bucket whose TTL has run out; returns how many were removed
    pub async fn purge_expired(&self, now: i64) -> usize {
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        buckets.retain(|_, stored| stored.expires_at > now);
        before - buckets.len()
    }

    /// Number of buckets held, expired or not
    pub async fn len(&self) -> usize {
        self.buckets.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl TokenBucketStore for MemoryTokenBucket {
    async fn evaluate(&self, key: &str, params: &BucketParams, now: i64) -> Result<Decision> {
        let mut buckets = self.buckets.lock().await;

        let current = buckets
            .get(key)
            .filter(|stored| stored.expires_at > now)
            .map(|stored| stored.state)
            .unwrap_or_else(|| BucketState::full(params, now));

        let (state, allowed) = current.refill_and_take(params, now);
        buckets.insert(
            key.to_string(),
            StoredBucket {
                state,
                expires_at: now.saturating_add(params.ttl as i64),
            },
        );

        Ok(Decision {
            allowed,
            remaining: state.tokens,
        })
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
