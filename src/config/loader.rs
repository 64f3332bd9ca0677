use crate::config::validator::{validate_config, validate_rule};
use crate::config::{AppConfig, LimiterSettings, RedisConfig, RuleSeedConfig};
use crate::decision::DecisionService;
use crate::errors::{RateLimitError, Result};
use crate::limiter::BucketStore;
use crate::rules::RuleStore;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Load and validate a rule seed file
pub async fn load_rule_seed_from_file<P: AsRef<Path>>(path: P) -> Result<RuleSeedConfig> {
    let path = path.as_ref();
    info!("Loading rule seed file from: {}", path.display());

    let contents = tokio::fs::read_to_string(path).await?;
    let seed: RuleSeedConfig = serde_json::from_str(&contents)?;

    let mut seen = HashSet::new();
    for rule in &seed.rules {
        validate_rule(rule)?;
        if !seen.insert(rule.rule_id.as_str()) {
            return Err(RateLimitError::ConfigurationError(format!(
                "rule '{}' appears more than once in {}",
                rule.rule_id,
                path.display()
            )));
        }
    }

    info!("Rule seed file loaded and validated ({} rules)", seed.rules.len());
    log_rule_seed_summary(&seed);

    Ok(seed)
}

/// Load complete application configuration from environment variables
pub fn load_config() -> Result<AppConfig> {
    info!("Loading application configuration...");

    let redis = RedisConfig::from_env();
    log_redis_config_summary(&redis);

    let limiter = LimiterSettings::from_env(redis.command_timeout());
    let rules_file = std::env::var("TOLLGATE_RULES_FILE").ok().map(PathBuf::from);
    debug!("Rule seed file: {:?}", rules_file);

    let app_config = AppConfig {
        redis,
        limiter,
        rules_file,
    };

    validate_config(&app_config)?;

    info!("Application configuration loaded and validated successfully");
    log_config_summary(&app_config);

    Ok(app_config)
}

/// Upsert every seeded rule through the regular rule write path.
pub async fn apply_rule_seed<R, B>(
    service: &DecisionService<R, B>,
    seed: &RuleSeedConfig,
) -> Result<usize>
where
    R: RuleStore,
    B: BucketStore,
{
    for rule in &seed.rules {
        service.upsert_rule(rule.clone()).await?;
    }
    info!("Applied {} seeded rules", seed.rules.len());
    Ok(seed.rules.len())
}

fn log_config_summary(config: &AppConfig) {
    info!("=== Configuration Summary ===");
    info!("Redis URL: {}", mask_password(&config.redis.url));
    info!("Store timeout: {:?}", config.limiter.store_timeout);
    info!("Fail-closed retry: {}ms", config.limiter.fail_closed_retry_ms);
    info!("No-refill retry: {}s", config.limiter.no_refill_retry_secs);
    info!("Max retry: {}s", config.limiter.max_retry_secs);
    match &config.rules_file {
        Some(path) => info!("Rule seed file: {}", path.display()),
        None => info!("Rule seed file: none"),
    }
    info!("=============================");
}

fn log_rule_seed_summary(seed: &RuleSeedConfig) {
    for rule in &seed.rules {
        debug!(
            "  - {} ({} / {}): capacity {}, burst {}, {:.2} tokens/sec, maxCost {}, ttl {}ms",
            rule.rule_id,
            rule.endpoint,
            rule.plan,
            rule.capacity,
            rule.burst_capacity,
            rule.refill_tokens_per_second,
            rule.max_cost,
            rule.ttl_ms
        );
    }
}

fn log_redis_config_summary(config: &RedisConfig) {
    info!("Redis URL: {}", mask_password(&config.url));
    info!("Redis Max Connections: {}", config.max_connections);
    info!("Redis Connection Timeout: {}s", config.connection_timeout_secs);
    info!("Redis Command Timeout: {}s", config.command_timeout_secs);
}

/// Mask password in Redis URL for safe logging
fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.rfind('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            // Only mask when the colon sits inside the userinfo, not the scheme
            if url[..colon_pos].contains("//") {
                let mut masked = url.to_string();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
    }
    url.to_string()
}
