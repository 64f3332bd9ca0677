use crate::errors::Result;
use crate::limiter::token_bucket::{self, BucketState};
use crate::limiter::{BucketReply, BucketStore, ConsumeFailure, ConsumeRequest};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// Every this many consumes, expired buckets are dropped from the map.
const SWEEP_INTERVAL: u64 = 256;

#[derive(Debug, Clone, Copy)]
struct StoredBucket {
    state: BucketState,
    expires_at_ms: u64,
}

/// Bucket store living in this process.
///
/// Holding the map entry for the whole refill/consume/write step serializes
/// consumers of the same key, mirroring the script's atomicity. Expiry is
/// judged against each request's `now_ms`; expired buckets are swept out
/// every `SWEEP_INTERVAL` consumes.
#[derive(Debug, Default)]
pub struct MemoryBucketStore {
    buckets: DashMap<String, StoredBucket>,
    consumes: AtomicU64,
}

impl MemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored state for `bucket_key` as of `now_ms`, or `None` if absent or
    /// expired. Does not refill.
    pub fn state(&self, bucket_key: &str, now_ms: u64) -> Option<BucketState> {
        self.buckets
            .get(bucket_key)
            .filter(|stored| stored.expires_at_ms > now_ms)
            .map(|stored| stored.state)
    }

    /// Drop buckets expired as of `now_ms`; returns how many were removed.
    pub fn purge_expired(&self, now_ms: u64) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, stored| stored.expires_at_ms > now_ms);
        before.saturating_sub(self.buckets.len())
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn consume(
        &self,
        request: &ConsumeRequest,
    ) -> std::result::Result<BucketReply, ConsumeFailure> {
        let params = request.params();
        let now_ms = request.now_ms;
        let expires_at_ms = now_ms.saturating_add(request.ttl_ms);

        if self.consumes.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            let purged = self.purge_expired(now_ms);
            if purged > 0 {
                debug!(purged, "Swept expired in-memory buckets");
            }
        }

        let outcome = match self.buckets.entry(request.bucket_key.clone()) {
            Entry::Occupied(mut entry) => {
                let prior = Some(entry.get())
                    .filter(|stored| stored.expires_at_ms > now_ms)
                    .map(|stored| stored.state);
                let outcome = token_bucket::consume(prior, &params, request.cost, now_ms);
                entry.insert(StoredBucket {
                    state: outcome.state,
                    expires_at_ms,
                });
                outcome
            }
            Entry::Vacant(entry) => {
                let outcome = token_bucket::consume(None, &params, request.cost, now_ms);
                entry.insert(StoredBucket {
                    state: outcome.state,
                    expires_at_ms,
                });
                outcome
            }
        };

        trace!(
            bucket_key = %request.bucket_key,
            allowed = outcome.allowed,
            tokens = outcome.state.tokens,
            "In-memory bucket consumed"
        );

        Ok(outcome.into())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
