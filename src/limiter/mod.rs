pub mod memory;
pub mod token_bucket;

use crate::errors::{RateLimitError, Result};
use crate::rules::Rule;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub use memory::MemoryBucketStore;
pub use token_bucket::{BucketParams, BucketState, ConsumeOutcome};

/// Arguments of one atomic consume against the shared bucket store.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeRequest {
    pub bucket_key: String,
    pub now_ms: u64,
    pub capacity: u32,
    pub refill_tokens_per_second: f64,
    pub burst_capacity: u32,
    pub cost: u32,
    pub ttl_ms: u64,
}

impl ConsumeRequest {
    pub fn new(rule: &Rule, key: &str, cost: u32, now_ms: u64) -> Self {
        Self {
            bucket_key: rule.bucket_key(key),
            now_ms,
            capacity: rule.capacity,
            refill_tokens_per_second: rule.refill_tokens_per_second,
            burst_capacity: rule.burst_capacity,
            cost,
            ttl_ms: rule.ttl_ms,
        }
    }

    pub fn params(&self) -> BucketParams {
        BucketParams {
            capacity: self.capacity,
            refill_tokens_per_second: self.refill_tokens_per_second,
            burst_capacity: self.burst_capacity,
        }
    }
}

/// Typed reply of the atomic consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketReply {
    pub allowed: bool,

    /// Time until `cost` tokens are available. `None` when denied under a
    /// rule that never refills.
    pub retry_after_ms: Option<u64>,

    /// Whole tokens left after this decision
    pub remaining: u64,
}

impl From<ConsumeOutcome> for BucketReply {
    fn from(outcome: ConsumeOutcome) -> Self {
        Self {
            allowed: outcome.allowed,
            retry_after_ms: outcome.retry_after_ms,
            remaining: outcome.remaining,
        }
    }
}

/// Why a consume produced no usable reply. Every variant fails closed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumeFailure {
    #[error("bucket store unreachable: {0}")]
    StoreUnreachable(String),

    #[error("malformed bucket reply: {0}")]
    MalformedReply(String),

    #[error("unexpected field type in bucket reply: {0}")]
    UnexpectedFieldType(String),
}

impl ConsumeFailure {
    /// Metric label distinguishing the remediation paths.
    pub fn reason(&self) -> &'static str {
        match self {
            ConsumeFailure::StoreUnreachable(_) => "store_unreachable",
            ConsumeFailure::MalformedReply(_) => "malformed_reply",
            ConsumeFailure::UnexpectedFieldType(_) => "unexpected_field_type",
        }
    }
}

impl From<ConsumeFailure> for RateLimitError {
    fn from(value: ConsumeFailure) -> Self {
        match value {
            ConsumeFailure::StoreUnreachable(msg) => RateLimitError::BucketStoreUnavailable(msg),
            ConsumeFailure::MalformedReply(msg) => RateLimitError::MalformedBucketReply(msg),
            ConsumeFailure::UnexpectedFieldType(msg) => {
                RateLimitError::UnexpectedBucketReplyType(msg)
            }
        }
    }
}

/// Boundary to the store holding bucket state.
///
/// `consume` must run refill, decision and write as one indivisible step per
/// key and must not retry internally.
#[async_trait]
pub trait BucketStore: Send + Sync {
    async fn consume(
        &self,
        request: &ConsumeRequest,
    ) -> std::result::Result<BucketReply, ConsumeFailure>;

    /// Check if the store is reachable
    async fn health_check(&self) -> Result<()>;
}

/// Millisecond clock. Bucket timestamps are shared across replicas, so
/// production uses wall-clock time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// Hand-driven clock for tests and replays.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set_ms(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
