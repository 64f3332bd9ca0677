use crate::rules::Rule;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, register_int_counter_vec,
    CounterVec, HistogramVec, IntCounter, IntCounterVec,
};

lazy_static! {
    // Decision metrics
    pub static ref DECISIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tollgate_decisions_total",
        "Total rate-limit decisions (allowed/blocked)",
        &["rule_id", "endpoint", "plan", "allowed"]
    ).unwrap();

    pub static ref REJECTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tollgate_rejected_total",
        "Requests rejected before reaching the bucket",
        &["reason"]
    ).unwrap();

    pub static ref FAIL_CLOSED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tollgate_fail_closed_total",
        "Requests denied because the bucket store gave no usable answer",
        &["reason"]
    ).unwrap();

    pub static ref RULE_FALLBACK_TOTAL: IntCounter = register_int_counter!(
        "tollgate_rule_fallback_total",
        "Decisions made under the conservative fallback rule"
    ).unwrap();

    // Latency metrics
    pub static ref DECISION_DURATION: HistogramVec = register_histogram_vec!(
        "tollgate_decision_duration_seconds",
        "Decision processing duration in seconds",
        &["allowed"],
        vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    ).unwrap();

    pub static ref STORE_DURATION: HistogramVec = register_histogram_vec!(
        "tollgate_store_duration_seconds",
        "Redis command duration in seconds",
        &["command"],
        vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5]
    ).unwrap();

    pub static ref REDIS_ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "tollgate_redis_errors_total",
        "Total number of Redis errors",
        &["command"]
    ).unwrap();

    // Config metrics
    pub static ref CONFIG_RELOADS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tollgate_config_reloads_total",
        "Total number of rule seed reloads",
        &["result"]
    ).unwrap();
}

/// Record a completed decision
pub fn record_decision(rule: &Rule, allowed: bool, duration_secs: f64) {
    let allowed_str = if allowed { "true" } else { "false" };
    DECISIONS_TOTAL
        .with_label_values(&[
            rule.rule_id.as_str(),
            rule.endpoint.as_str(),
            rule.plan.as_str(),
            allowed_str,
        ])
        .inc();

    DECISION_DURATION
        .with_label_values(&[allowed_str])
        .observe(duration_secs);
}

/// Record a client-error rejection (`cost_too_high`, `rule_not_found`)
pub fn record_rejected(reason: &str) {
    REJECTED_TOTAL.with_label_values(&[reason]).inc();
}

/// Record a fail-closed denial by failure reason
pub fn record_fail_closed(reason: &str) {
    FAIL_CLOSED_TOTAL.with_label_values(&[reason]).inc();
}

/// Record use of the conservative fallback rule
pub fn record_rule_fallback() {
    RULE_FALLBACK_TOTAL.inc();
}

/// Record Redis operation duration
pub fn record_redis_duration(command: &str, duration_secs: f64) {
    STORE_DURATION
        .with_label_values(&[command])
        .observe(duration_secs);
}

/// Record Redis error
pub fn record_redis_error(command: &str) {
    REDIS_ERRORS_TOTAL.with_label_values(&[command]).inc();
}

/// Record rule seed reload
pub fn record_config_reload(success: bool) {
    let result = if success { "success" } else { "error" };
    CONFIG_RELOADS_TOTAL.with_label_values(&[result]).inc();
}
