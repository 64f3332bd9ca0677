use crate::errors::{RateLimitError, Result};
use crate::rules::{Rule, RuleStore};
use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, error};

const RULE_KEY_PREFIX: &str = "rule:";

/// Rules persisted as one Redis hash per rule (`rule:{rule_id}`).
pub struct RedisRuleStore {
    pool: Pool,
}

impl RedisRuleStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    fn rule_key(rule_id: &str) -> String {
        format!("{}{}", RULE_KEY_PREFIX, rule_id)
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool.get().await.map_err(|e| {
            crate::metrics::record_redis_error("pool");
            RateLimitError::RuleStoreUnavailable(format!("Failed to get Redis connection: {}", e))
        })
    }
}

#[async_trait]
impl RuleStore for RedisRuleStore {
    async fn get(&self, rule_id: &str) -> Result<Option<Rule>> {
        let mut conn = self.connection().await?;
        let key = Self::rule_key(rule_id);
        let started = Instant::now();

        let fields: HashMap<String, String> = conn.hgetall(&key).await.map_err(|e| {
            error!("HGETALL {} failed: {}", key, e);
            crate::metrics::record_redis_error("hgetall");
            RateLimitError::RuleStoreUnavailable(e.to_string())
        })?;
        crate::metrics::record_redis_duration("hgetall", started.elapsed().as_secs_f64());

        if fields.is_empty() {
            debug!("Rule not found: {}", rule_id);
            return Ok(None);
        }

        Rule::from_fields(rule_id, &fields).map(Some)
    }

    async fn upsert(&self, rule: &Rule) -> Result<()> {
        let mut conn = self.connection().await?;
        let key = Self::rule_key(&rule.rule_id);
        let fields = rule.to_fields();
        let started = Instant::now();

        // DEL + HSET in one MULTI so a replace never leaves fields from the
        // previous record behind.
        let _: () = redis::pipe()
            .atomic()
            .del(&key)
            .ignore()
            .hset_multiple(&key, fields.as_slice())
            .ignore()
            .query_async(&mut *conn)
            .await
            .map_err(|e| {
                error!("Rule upsert for {} failed: {}", key, e);
                crate::metrics::record_redis_error("hset");
                RateLimitError::RuleStoreUnavailable(e.to_string())
            })?;
        crate::metrics::record_redis_duration("hset", started.elapsed().as_secs_f64());

        debug!("Rule stored under {}", key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_key_prefix() {
        assert_eq!(RedisRuleStore::rule_key("checkout"), "rule:checkout");
    }
}
