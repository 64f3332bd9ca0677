use crate::errors::{RateLimitError, Result};
use crate::rules::{Rule, RuleStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of looking up the rule for a decision.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleResolution {
    /// The store answered with the rule.
    Found(Rule),
    /// The store failed or timed out; carries the conservative stand-in.
    Fallback(Rule),
    /// The store answered and has no such rule.
    NotFound,
}

/// Time-bounded rule lookup with fail-conservative fallback.
pub struct RuleResolver<R: RuleStore> {
    store: Arc<R>,
    timeout: Duration,
}

impl<R: RuleStore> RuleResolver<R> {
    pub fn new(store: Arc<R>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Resolve the rule for a decision. Never fails: store trouble becomes
    /// [`RuleResolution::Fallback`] with [`Rule::conservative`].
    pub async fn resolve(&self, rule_id: &str) -> RuleResolution {
        match self.fetch_optional(rule_id).await {
            Ok(Some(rule)) => {
                debug!(rule_id, "Rule resolved");
                RuleResolution::Found(rule)
            }
            Ok(None) => RuleResolution::NotFound,
            Err(e) => {
                crate::metrics::record_rule_fallback();
                warn!(
                    rule_id,
                    error = %e,
                    "Fail-conservative: rule store unavailable, using restrictive fallback rule"
                );
                RuleResolution::Fallback(Rule::conservative(rule_id))
            }
        }
    }

    /// Strict lookup for rule reads: absence is `RuleNotFound`, store trouble
    /// is `RuleStoreUnavailable`.
    pub async fn fetch(&self, rule_id: &str) -> Result<Rule> {
        self.fetch_optional(rule_id)
            .await?
            .ok_or_else(|| RateLimitError::RuleNotFound(rule_id.to_string()))
    }

    async fn fetch_optional(&self, rule_id: &str) -> Result<Option<Rule>> {
        match tokio::time::timeout(self.timeout, self.store.get(rule_id)).await {
            Ok(Ok(found)) => Ok(found),
            Ok(Err(RateLimitError::RuleStoreUnavailable(msg))) => {
                Err(RateLimitError::RuleStoreUnavailable(msg))
            }
            Ok(Err(e)) => Err(RateLimitError::RuleStoreUnavailable(e.to_string())),
            Err(_) => Err(RateLimitError::RuleStoreUnavailable(format!(
                "rule lookup exceeded {:?}",
                self.timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::MemoryRuleStore;
    use async_trait::async_trait;

    struct UnreachableRuleStore;

    #[async_trait]
    impl RuleStore for UnreachableRuleStore {
        async fn get(&self, _rule_id: &str) -> Result<Option<Rule>> {
            Err(RateLimitError::RuleStoreUnavailable("connection refused".to_string()))
        }

        async fn upsert(&self, _rule: &Rule) -> Result<()> {
            Err(RateLimitError::RuleStoreUnavailable("connection refused".to_string()))
        }
    }

    struct HangingRuleStore;

    #[async_trait]
    impl RuleStore for HangingRuleStore {
        async fn get(&self, _rule_id: &str) -> Result<Option<Rule>> {
            std::future::pending().await
        }

        async fn upsert(&self, _rule: &Rule) -> Result<()> {
            std::future::pending().await
        }
    }

    fn resolver<R: RuleStore>(store: R) -> RuleResolver<R> {
        RuleResolver::new(Arc::new(store), Duration::from_millis(250))
    }

    #[tokio::test]
    async fn test_found_and_not_found_are_distinct() {
        let store = MemoryRuleStore::new();
        let rule = Rule {
            rule_id: "login".to_string(),
            endpoint: "/login".to_string(),
            plan: "free".to_string(),
            capacity: 3,
            refill_tokens_per_second: 0.1,
            burst_capacity: 0,
            ttl_ms: 10_000,
            max_cost: 1,
        };
        store.upsert(&rule).await.unwrap();
        let resolver = resolver(store);

        assert_eq!(resolver.resolve("login").await, RuleResolution::Found(rule));
        assert_eq!(resolver.resolve("signup").await, RuleResolution::NotFound);
        assert!(matches!(
            resolver.fetch("signup").await,
            Err(RateLimitError::RuleNotFound(id)) if id == "signup"
        ));
    }

    #[tokio::test]
    async fn test_store_error_falls_back_to_conservative_rule() {
        let resolver = resolver(UnreachableRuleStore);
        assert_eq!(
            resolver.resolve("orders").await,
            RuleResolution::Fallback(Rule::conservative("orders"))
        );
        assert!(matches!(
            resolver.fetch("orders").await,
            Err(RateLimitError::RuleStoreUnavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_times_out_into_fallback() {
        let resolver = resolver(HangingRuleStore);
        assert_eq!(
            resolver.resolve("orders").await,
            RuleResolution::Fallback(Rule::conservative("orders"))
        );
    }
}
