//! Decision orchestration: rule resolution, cost gate, bucket consume and
//! caller-facing timing.
//!
//! Failures are handled on two independent branches:
//! - rule store trouble proceeds under [`Rule::conservative`];
//! - bucket store trouble denies outright with a short retry hint.
//!
//! Unknown rules and over-budget costs are client errors and are never
//! disguised as either of the above.

use crate::config::validator::validate_rule;
use crate::config::LimiterSettings;
use crate::errors::{RateLimitError, Result};
use crate::limiter::{BucketReply, BucketStore, Clock, ConsumeFailure, ConsumeRequest};
use crate::rules::{Rule, RuleResolution, RuleResolver, RuleStore};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of one `check_and_consume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,

    /// Milliseconds until a retry is likely to succeed; 0 when allowed
    pub retry_after_ms: u64,

    /// Whole tokens left after this decision
    pub remaining: u64,

    /// Steady-state capacity of the applied rule (`RateLimit-Limit`)
    pub limit: u32,

    /// Retry hint in whole seconds (`Retry-After` / `RateLimit-Reset`); 0 when allowed
    pub retry_after_secs: u64,
}

/// Composes rule lookup, cost validation and bucket consumption.
pub struct DecisionService<R: RuleStore, B: BucketStore> {
    rules: Arc<R>,
    resolver: RuleResolver<R>,
    buckets: Arc<B>,
    clock: Arc<dyn Clock>,
    settings: LimiterSettings,
}

impl<R: RuleStore, B: BucketStore> DecisionService<R, B> {
    pub fn new(
        rules: Arc<R>,
        buckets: Arc<B>,
        clock: Arc<dyn Clock>,
        settings: LimiterSettings,
    ) -> Self {
        Self {
            resolver: RuleResolver::new(Arc::clone(&rules), settings.store_timeout),
            rules,
            buckets,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &LimiterSettings {
        &self.settings
    }

    /// Decide whether `key` may spend `cost` tokens under `rule_id`.
    ///
    /// Only `RuleNotFound` and `CostTooHigh` come back as errors; every store
    /// failure is folded into a well-formed [`Decision`].
    pub async fn check_and_consume(&self, key: &str, rule_id: &str, cost: u64) -> Result<Decision> {
        let started = Instant::now();

        let rule = match self.resolver.resolve(rule_id).await {
            RuleResolution::Found(rule) => rule,
            RuleResolution::Fallback(rule) => rule,
            RuleResolution::NotFound => {
                crate::metrics::record_rejected("rule_not_found");
                info!(rule_id, key, "ratelimit reject reason=rule_not_found");
                return Err(RateLimitError::RuleNotFound(rule_id.to_string()));
            }
        };

        if cost > u64::from(rule.max_cost) {
            crate::metrics::record_rejected("cost_too_high");
            info!(
                rule_id = %rule.rule_id,
                endpoint = %rule.endpoint,
                plan = %rule.plan,
                cost,
                max_cost = rule.max_cost,
                "ratelimit reject reason=cost_too_high"
            );
            return Err(RateLimitError::CostTooHigh {
                cost,
                max_cost: rule.max_cost,
            });
        }

        // cost <= max_cost, which is a u32
        let cost = cost as u32;
        let request = ConsumeRequest::new(&rule, key, cost, self.clock.now_ms());

        let decision = match self.consume_bounded(&request).await {
            Ok(reply) => self.decide(&rule, reply),
            Err(failure) => {
                crate::metrics::record_fail_closed(failure.reason());
                warn!(
                    rule_id = %rule.rule_id,
                    endpoint = %rule.endpoint,
                    plan = %rule.plan,
                    cost,
                    reason = failure.reason(),
                    error = %failure,
                    "ratelimit fail_closed"
                );
                self.fail_closed(&rule)
            }
        };

        crate::metrics::record_decision(
            &rule,
            decision.allowed,
            started.elapsed().as_secs_f64(),
        );
        info!(
            rule_id = %rule.rule_id,
            endpoint = %rule.endpoint,
            plan = %rule.plan,
            cost,
            allowed = decision.allowed,
            retry_after_ms = decision.retry_after_ms,
            remaining = decision.remaining,
            "ratelimit decision"
        );

        Ok(decision)
    }

    /// Validate and store a rule, replacing any previous version.
    pub async fn upsert_rule(&self, rule: Rule) -> Result<Rule> {
        validate_rule(&rule)?;

        match tokio::time::timeout(self.settings.store_timeout, self.rules.upsert(&rule)).await {
            Ok(Ok(())) => {}
            Ok(Err(RateLimitError::RuleStoreUnavailable(msg))) => {
                return Err(RateLimitError::RuleStoreUnavailable(msg));
            }
            Ok(Err(e)) => return Err(RateLimitError::RuleStoreUnavailable(e.to_string())),
            Err(_) => {
                return Err(RateLimitError::RuleStoreUnavailable(format!(
                    "rule upsert exceeded {:?}",
                    self.settings.store_timeout
                )));
            }
        }

        info!(
            rule_id = %rule.rule_id,
            endpoint = %rule.endpoint,
            plan = %rule.plan,
            capacity = rule.capacity,
            refill_tokens_per_second = rule.refill_tokens_per_second,
            burst_capacity = rule.burst_capacity,
            max_cost = rule.max_cost,
            "Rule upserted"
        );
        Ok(rule)
    }

    /// Read a rule. Absence is `RuleNotFound`; no fallback applies here.
    pub async fn get_rule(&self, rule_id: &str) -> Result<Rule> {
        self.resolver.fetch(rule_id).await
    }

    /// Ping the bucket store.
    pub async fn health_check(&self) -> Result<()> {
        self.buckets.health_check().await
    }

    async fn consume_bounded(
        &self,
        request: &ConsumeRequest,
    ) -> std::result::Result<BucketReply, ConsumeFailure> {
        match tokio::time::timeout(self.settings.store_timeout, self.buckets.consume(request)).await
        {
            Ok(result) => result,
            Err(_) => Err(ConsumeFailure::StoreUnreachable(format!(
                "consume on {} exceeded {:?}",
                request.bucket_key, self.settings.store_timeout
            ))),
        }
    }

    fn decide(&self, rule: &Rule, reply: BucketReply) -> Decision {
        if reply.allowed {
            return Decision {
                allowed: true,
                retry_after_ms: 0,
                remaining: reply.remaining,
                limit: rule.capacity,
                retry_after_secs: 0,
            };
        }

        let max_retry_ms = self.settings.max_retry_secs.saturating_mul(1000);
        let (retry_after_ms, retry_after_secs) = match reply.retry_after_ms {
            Some(ms) if rule.refill_tokens_per_second > 0.0 => {
                let ms = ms.min(max_retry_ms);
                let secs = ms
                    .div_ceil(1000)
                    .clamp(1, self.settings.max_retry_secs);
                (ms, secs)
            }
            _ => {
                debug!(rule_id = %rule.rule_id, "Bucket never refills; using fixed retry hint");
                (
                    self.settings.no_refill_retry_secs.saturating_mul(1000),
                    self.settings.no_refill_retry_secs,
                )
            }
        };

        Decision {
            allowed: false,
            retry_after_ms,
            remaining: reply.remaining,
            limit: rule.capacity,
            retry_after_secs,
        }
    }

    fn fail_closed(&self, rule: &Rule) -> Decision {
        let retry_after_ms = self.settings.fail_closed_retry_ms;
        Decision {
            allowed: false,
            retry_after_ms,
            remaining: 0,
            limit: rule.capacity,
            retry_after_secs: retry_after_ms.div_ceil(1000).max(1),
        }
    }
}
