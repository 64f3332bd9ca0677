use crate::config::{AppConfig, LimiterSettings, RedisConfig};
use crate::errors::{RateLimitError, Result};
use crate::rules::Rule;
use tracing::{debug, warn};

/// Validate the entire application configuration
pub fn validate_config(config: &AppConfig) -> Result<()> {
    debug!("Validating configuration...");

    validate_redis_config(&config.redis)?;
    validate_limiter_settings(&config.limiter)?;

    debug!("Configuration validation successful");
    Ok(())
}

/// Validate Redis configuration
fn validate_redis_config(config: &RedisConfig) -> Result<()> {
    if config.url.is_empty() {
        return Err(RateLimitError::ConfigurationError(
            "Redis URL cannot be empty".to_string()
        ));
    }

    if !config.url.starts_with("redis://") && !config.url.starts_with("rediss://") {
        return Err(RateLimitError::ConfigurationError(
            format!("Invalid Redis URL format: {}. Must start with redis:// or rediss://", config.url)
        ));
    }

    if config.max_connections == 0 {
        return Err(RateLimitError::ConfigurationError(
            "max_connections must be greater than 0".to_string()
        ));
    }

    if config.max_connections > 1000 {
        warn!(
            "max_connections is very high ({}). This may consume excessive resources.",
            config.max_connections
        );
    }

    if config.connection_timeout_secs == 0 {
        return Err(RateLimitError::ConfigurationError(
            "connection_timeout_secs must be greater than 0".to_string()
        ));
    }

    if config.command_timeout_secs == 0 {
        return Err(RateLimitError::ConfigurationError(
            "command_timeout_secs must be greater than 0".to_string()
        ));
    }

    debug!("Redis configuration valid");
    Ok(())
}

/// Validate decision policy constants
fn validate_limiter_settings(settings: &LimiterSettings) -> Result<()> {
    if settings.max_retry_secs < 1 {
        return Err(RateLimitError::ConfigurationError(
            "max_retry_secs must be at least 1".to_string()
        ));
    }

    if settings.no_refill_retry_secs > settings.max_retry_secs {
        return Err(RateLimitError::ConfigurationError(format!(
            "no_refill_retry_secs ({}) cannot exceed max_retry_secs ({})",
            settings.no_refill_retry_secs, settings.max_retry_secs
        )));
    }

    if settings.fail_closed_retry_ms == 0 {
        return Err(RateLimitError::ConfigurationError(
            "fail_closed_retry_ms must be greater than 0".to_string()
        ));
    }

    if settings.fail_closed_retry_ms > 60_000 {
        warn!(
            "fail_closed_retry_ms is {}ms; callers will back off a long time on transient store faults",
            settings.fail_closed_retry_ms
        );
    }

    if settings.store_timeout.is_zero() {
        return Err(RateLimitError::ConfigurationError(
            "store timeout must be greater than 0".to_string()
        ));
    }

    Ok(())
}

/// Check a rule against the invariants every stored rule must hold.
pub fn validate_rule(rule: &Rule) -> Result<()> {
    if rule.rule_id.trim().is_empty() {
        return Err(RateLimitError::InvalidRule(
            "ruleId cannot be empty".to_string()
        ));
    }

    if rule.endpoint.trim().is_empty() || rule.plan.trim().is_empty() {
        return Err(RateLimitError::InvalidRule(format!(
            "endpoint and plan cannot be empty for rule '{}'",
            rule.rule_id
        )));
    }

    if rule.capacity < 1 {
        return Err(RateLimitError::InvalidRule(format!(
            "capacity must be at least 1 for rule '{}' (got {})",
            rule.rule_id, rule.capacity
        )));
    }

    if !rule.refill_tokens_per_second.is_finite() || rule.refill_tokens_per_second < 0.0 {
        return Err(RateLimitError::InvalidRule(format!(
            "refillTokensPerSecond must be a finite number >= 0 for rule '{}' (got {})",
            rule.rule_id, rule.refill_tokens_per_second
        )));
    }

    if rule.ttl_ms < 1 {
        return Err(RateLimitError::InvalidRule(format!(
            "ttlMs must be at least 1 for rule '{}'",
            rule.rule_id
        )));
    }

    if rule.max_cost < 1 {
        return Err(RateLimitError::InvalidRule(format!(
            "maxCost must be at least 1 for rule '{}'",
            rule.rule_id
        )));
    }

    if u64::from(rule.max_cost) > rule.ceiling() {
        warn!(
            "Rule '{}' allows cost up to {} but the bucket only holds {}; such requests always deny",
            rule.rule_id,
            rule.max_cost,
            rule.ceiling()
        );
    }

    if rule.refill_tokens_per_second > 0.0 {
        let seconds_to_fill = rule.ceiling() as f64 / rule.refill_tokens_per_second;
        if seconds_to_fill * 1000.0 > rule.ttl_ms as f64 {
            debug!(
                "Rule '{}' refills slower ({:.2}s) than its idle expiry ({}ms); idle keys restart full",
                rule.rule_id, seconds_to_fill, rule.ttl_ms
            );
        }
    }

    Ok(())
}
