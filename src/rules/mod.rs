pub mod redis_store;
pub mod resolver;

use crate::errors::{RateLimitError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use redis_store::RedisRuleStore;
pub use resolver::{RuleResolution, RuleResolver};

/// Endpoint tag used when a record carries none.
pub const DEFAULT_ENDPOINT: &str = "unknown";

/// Plan tag used when a record carries none.
pub const DEFAULT_PLAN: &str = "default";

/// One limiting policy. Immutable once built; replaced wholesale on upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub rule_id: String,

    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_plan")]
    pub plan: String,

    /// Steady-state token ceiling
    pub capacity: u32,

    /// Continuous refill rate; 0 means a drained bucket never recovers
    pub refill_tokens_per_second: f64,

    /// Extra headroom above `capacity`
    #[serde(default)]
    pub burst_capacity: u32,

    /// Idle expiry for the stored bucket state
    pub ttl_ms: u64,

    /// Upper bound on a single request's cost
    pub max_cost: u32,
}

impl Rule {
    /// Worst-case policy used while the rule store cannot be reached: one
    /// token, no refill, no burst.
    pub fn conservative(rule_id: &str) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            plan: DEFAULT_PLAN.to_string(),
            capacity: 1,
            refill_tokens_per_second: 0.0,
            burst_capacity: 0,
            ttl_ms: 60_000,
            max_cost: 1,
        }
    }

    /// Highest token stock a bucket under this rule can hold.
    pub fn ceiling(&self) -> u64 {
        u64::from(self.capacity) + u64::from(self.burst_capacity)
    }

    /// Namespaced bucket key for one caller under this rule.
    pub fn bucket_key(&self, key: &str) -> String {
        format!("tb:{}:{}:{}:{}", self.rule_id, self.endpoint, self.plan, key)
    }

    /// Flatten into the string-keyed record persisted by rule stores.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("endpoint", self.endpoint.clone()),
            ("plan", self.plan.clone()),
            ("capacity", self.capacity.to_string()),
            ("refillTokensPerSecond", self.refill_tokens_per_second.to_string()),
            ("burstCapacity", self.burst_capacity.to_string()),
            ("ttlMs", self.ttl_ms.to_string()),
            ("maxCost", self.max_cost.to_string()),
        ]
    }

    /// Rebuild a rule from its flat record.
    ///
    /// `endpoint`, `plan` and `burstCapacity` may be absent in records written
    /// by older schemas; they read back as `"unknown"`, `"default"` and
    /// `capacity`. Any other missing or unparsable field makes the record
    /// unreadable, which callers treat as a rule store failure.
    pub fn from_fields(rule_id: &str, fields: &HashMap<String, String>) -> Result<Self> {
        let capacity: u32 = required_field(rule_id, fields, "capacity")?;
        let burst_capacity = match fields.get("burstCapacity") {
            Some(raw) => parse_field(rule_id, "burstCapacity", raw)?,
            None => capacity,
        };

        Ok(Self {
            rule_id: rule_id.to_string(),
            endpoint: fields
                .get("endpoint")
                .cloned()
                .unwrap_or_else(default_endpoint),
            plan: fields.get("plan").cloned().unwrap_or_else(default_plan),
            capacity,
            refill_tokens_per_second: required_field(rule_id, fields, "refillTokensPerSecond")?,
            burst_capacity,
            ttl_ms: required_field(rule_id, fields, "ttlMs")?,
            max_cost: required_field(rule_id, fields, "maxCost")?,
        })
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_plan() -> String {
    DEFAULT_PLAN.to_string()
}

fn required_field<T: std::str::FromStr>(
    rule_id: &str,
    fields: &HashMap<String, String>,
    name: &str,
) -> Result<T> {
    let raw = fields.get(name).ok_or_else(|| {
        RateLimitError::RuleStoreUnavailable(format!(
            "rule '{}' record is missing field '{}'",
            rule_id, name
        ))
    })?;
    parse_field(rule_id, name, raw)
}

fn parse_field<T: std::str::FromStr>(rule_id: &str, name: &str, raw: &str) -> Result<T> {
    raw.trim().parse::<T>().map_err(|_| {
        RateLimitError::RuleStoreUnavailable(format!(
            "rule '{}' has unreadable field '{}' = {:?}",
            rule_id, name, raw
        ))
    })
}

/// Key-value access to persisted rules.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// `Ok(None)` means the store answered and has no such rule.
    async fn get(&self, rule_id: &str) -> Result<Option<Rule>>;

    /// Full replace of the rule's record.
    async fn upsert(&self, rule: &Rule) -> Result<()>;
}

/// Process-local rule store holding the same flat records the Redis store
/// writes, so default-on-read applies identically.
#[derive(Debug, Default)]
pub struct MemoryRuleStore {
    records: DashMap<String, HashMap<String, String>>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw record as-is, bypassing [`Rule::to_fields`].
    pub fn insert_record(&self, rule_id: &str, fields: HashMap<String, String>) {
        self.records.insert(rule_id.to_string(), fields);
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn get(&self, rule_id: &str) -> Result<Option<Rule>> {
        match self.records.get(rule_id) {
            Some(entry) => Rule::from_fields(rule_id, entry.value()).map(Some),
            None => Ok(None),
        }
    }

    async fn upsert(&self, rule: &Rule) -> Result<()> {
        let fields = rule
            .to_fields()
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect();
        self.records.insert(rule.rule_id.clone(), fields);
        Ok(())
    }
}
