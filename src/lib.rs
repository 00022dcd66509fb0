//! Rate Limit Proxy
//!
//! A reverse proxy that rate limits every request with a token bucket
//! before forwarding it to a single upstream origin. Bucket state lives in
//! Redis and is updated by one atomic Lua script per request, so any number
//! of proxy instances share the same quotas.

pub mod bucket;
pub mod classifier;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod metrics;
pub mod redis;
pub mod service;
pub mod utils;

// Re-export main types
pub use bucket::{BucketParams, Decision, MemoryTokenBucket, RedisTokenBucket, TokenBucketStore};
pub use classifier::{Classifier, IdentifierStrategy};
pub use config::ProxyConfig;
pub use error::{ClassificationError, ProxyError, Result};
pub use service::ProxyService;
