use crate::errors::{RateLimitError, Result};
use crate::limiter::{BucketReply, BucketStore, ConsumeFailure, ConsumeRequest};
use crate::redis::script::{get_script, load_script};
use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::{ErrorKind, RedisError, Script, Value};
use std::time::Instant;
use tracing::{debug, error};

/// Bucket store backed by the token bucket Lua script.
pub struct RedisBucketStore {
    pool: Pool,
    script: Script,
}

impl RedisBucketStore {
    /// Create the store and preload the script.
    pub async fn new(pool: Pool) -> Result<Self> {
        let mut conn = pool.get().await.map_err(|e| {
            RateLimitError::InternalError(format!(
                "Failed to get connection for script loading: {}",
                e
            ))
        })?;
        load_script(&mut *conn).await?;

        Ok(Self {
            pool,
            script: get_script(),
        })
    }
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn consume(
        &self,
        request: &ConsumeRequest,
    ) -> std::result::Result<BucketReply, ConsumeFailure> {
        let mut conn = self.pool.get().await.map_err(|e| {
            error!("Failed to get Redis connection: {}", e);
            crate::metrics::record_redis_error("pool");
            ConsumeFailure::StoreUnreachable(format!("Failed to get Redis connection: {}", e))
        })?;

        debug!(
            "Executing token bucket script: key={}, cost={}, now_ms={}",
            request.bucket_key, request.cost, request.now_ms
        );

        let started = Instant::now();
        let reply: Value = self
            .script
            .key(&request.bucket_key)
            .arg(request.now_ms)
            .arg(request.capacity)
            .arg(request.refill_tokens_per_second)
            .arg(request.burst_capacity)
            .arg(request.cost)
            .arg(request.ttl_ms)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| {
                error!("Script execution failed: {}", e);
                crate::metrics::record_redis_error("evalsha");
                classify_redis_error(e)
            })?;
        crate::metrics::record_redis_duration("evalsha", started.elapsed().as_secs_f64());

        let parsed = parse_reply(&reply);
        if let Err(e) = &parsed {
            error!("Unusable script reply for {}: {} ({:?})", request.bucket_key, e, reply);
        }
        parsed
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.pool.get().await.map_err(|e| {
            RateLimitError::RedisConnectionError(RedisError::from((
                ErrorKind::IoError,
                "Pool exhausted",
                e.to_string(),
            )))
        })?;

        let response: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(RateLimitError::RedisConnectionError)?;

        if response != "PONG" {
            return Err(RateLimitError::InternalError(format!(
                "Unexpected PING response: {}",
                response
            )));
        }

        Ok(())
    }
}

fn classify_redis_error(err: RedisError) -> ConsumeFailure {
    match err.kind() {
        ErrorKind::TypeError => ConsumeFailure::UnexpectedFieldType(err.to_string()),
        _ => ConsumeFailure::StoreUnreachable(err.to_string()),
    }
}

/// Translate the script's `{allowed, retry_after_ms, remaining}` reply.
pub fn parse_reply(reply: &Value) -> std::result::Result<BucketReply, ConsumeFailure> {
    let fields = match reply {
        Value::Array(fields) => fields,
        Value::Nil => {
            return Err(ConsumeFailure::MalformedReply("missing reply".to_string()));
        }
        other => {
            return Err(ConsumeFailure::MalformedReply(format!(
                "expected a 3-element array, got {:?}",
                other
            )));
        }
    };

    if fields.len() != 3 {
        return Err(ConsumeFailure::MalformedReply(format!(
            "expected 3 fields, got {}",
            fields.len()
        )));
    }

    let allowed = match integer_field(&fields[0], "allowed")? {
        0 => false,
        1 => true,
        other => {
            return Err(ConsumeFailure::MalformedReply(format!(
                "allowed flag must be 0 or 1, got {}",
                other
            )));
        }
    };

    let retry_after_ms = match integer_field(&fields[1], "retry_after_ms")? {
        _ if allowed => Some(0),
        -1 => None,
        v if v >= 0 => Some(v as u64),
        v => {
            return Err(ConsumeFailure::MalformedReply(format!(
                "negative retry_after_ms {}",
                v
            )));
        }
    };

    let remaining = integer_field(&fields[2], "remaining")?;
    let remaining = u64::try_from(remaining).map_err(|_| {
        ConsumeFailure::MalformedReply(format!("negative remaining {}", remaining))
    })?;

    Ok(BucketReply {
        allowed,
        retry_after_ms,
        remaining,
    })
}

fn integer_field(value: &Value, name: &str) -> std::result::Result<i64, ConsumeFailure> {
    let unexpected = || {
        ConsumeFailure::UnexpectedFieldType(format!(
            "field '{}' is not an integer: {:?}",
            name, value
        ))
    };

    match value {
        Value::Int(v) => Ok(*v),
        Value::Nil => Err(ConsumeFailure::MalformedReply(format!(
            "field '{}' is null",
            name
        ))),
        Value::BulkString(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .ok_or_else(unexpected),
        Value::SimpleString(s) => s.trim().parse::<i64>().map_err(|_| unexpected()),
        Value::Double(v) if v.is_finite() && v.fract() == 0.0 => Ok(*v as i64),
        _ => Err(unexpected()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(fields: Vec<Value>) -> Value {
        Value::Array(fields)
    }

    #[test]
    fn test_parse_allowed_reply() {
        let parsed = parse_reply(&reply(vec![Value::Int(1), Value::Int(0), Value::Int(4)])).unwrap();
        assert_eq!(
            parsed,
            BucketReply {
                allowed: true,
                retry_after_ms: Some(0),
                remaining: 4,
            }
        );
    }

    #[test]
    fn test_parse_denied_reply_and_never_refill_marker() {
        let parsed =
            parse_reply(&reply(vec![Value::Int(0), Value::Int(400), Value::Int(4)])).unwrap();
        assert!(!parsed.allowed);
        assert_eq!(parsed.retry_after_ms, Some(400));

        let parsed = parse_reply(&reply(vec![Value::Int(0), Value::Int(-1), Value::Int(0)])).unwrap();
        assert_eq!(parsed.retry_after_ms, None);
    }

    #[test]
    fn test_numeric_strings_are_coerced() {
        let parsed = parse_reply(&reply(vec![
            Value::BulkString(b"0".to_vec()),
            Value::BulkString(b"250".to_vec()),
            Value::SimpleString("2".to_string()),
        ]))
        .unwrap();
        assert_eq!(parsed.retry_after_ms, Some(250));
        assert_eq!(parsed.remaining, 2);
    }

    #[test]
    fn test_missing_or_short_reply_is_malformed() {
        assert!(matches!(
            parse_reply(&Value::Nil),
            Err(ConsumeFailure::MalformedReply(_))
        ));
        assert!(matches!(
            parse_reply(&reply(vec![Value::Int(1), Value::Int(0)])),
            Err(ConsumeFailure::MalformedReply(_))
        ));
        assert!(matches!(
            parse_reply(&reply(vec![Value::Int(1), Value::Nil, Value::Int(3)])),
            Err(ConsumeFailure::MalformedReply(_))
        ));
        assert!(matches!(
            parse_reply(&Value::Okay),
            Err(ConsumeFailure::MalformedReply(_))
        ));
    }

    #[test]
    fn test_out_of_range_values_are_malformed() {
        assert!(matches!(
            parse_reply(&reply(vec![Value::Int(2), Value::Int(0), Value::Int(3)])),
            Err(ConsumeFailure::MalformedReply(_))
        ));
        assert!(matches!(
            parse_reply(&reply(vec![Value::Int(0), Value::Int(-7), Value::Int(3)])),
            Err(ConsumeFailure::MalformedReply(_))
        ));
        assert!(matches!(
            parse_reply(&reply(vec![Value::Int(1), Value::Int(0), Value::Int(-3)])),
            Err(ConsumeFailure::MalformedReply(_))
        ));
    }

    #[test]
    fn test_non_numeric_fields_are_type_errors() {
        assert!(matches!(
            parse_reply(&reply(vec![
                Value::BulkString(b"yes".to_vec()),
                Value::Int(0),
                Value::Int(3),
            ])),
            Err(ConsumeFailure::UnexpectedFieldType(_))
        ));
        assert!(matches!(
            parse_reply(&reply(vec![
                Value::Int(1),
                Value::Array(vec![]),
                Value::Int(3),
            ])),
            Err(ConsumeFailure::UnexpectedFieldType(_))
        ));
        assert!(matches!(
            parse_reply(&reply(vec![Value::Int(1), Value::Int(0), Value::Double(2.5)])),
            Err(ConsumeFailure::UnexpectedFieldType(_))
        ));
    }

    #[test]
    fn test_transport_errors_map_to_unreachable() {
        let io = RedisError::from((ErrorKind::IoError, "connection refused"));
        assert_eq!(classify_redis_error(io).reason(), "store_unreachable");

        let ty = RedisError::from((ErrorKind::TypeError, "bad type"));
        assert_eq!(classify_redis_error(ty).reason(), "unexpected_field_type");
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use super::*;
    use crate::config::RedisConfig;
    use crate::limiter::token_bucket::{self, BucketParams, BucketState, MAX_RETRY_AFTER_MS};
    use crate::redis::create_redis_pool;
    use std::time::{SystemTime, UNIX_EPOCH};

    async fn store() -> (RedisBucketStore, Pool) {
        let config = RedisConfig {
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            ..RedisConfig::default()
        };
        let pool = create_redis_pool(&config).await.unwrap();
        (RedisBucketStore::new(pool.clone()).await.unwrap(), pool)
    }

    fn unique_key(name: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("tb:tollgate-test-{}-{}:{}", std::process::id(), nanos, name)
    }

    fn request(key: &str, params: BucketParams, cost: u32, now_ms: u64, ttl_ms: u64) -> ConsumeRequest {
        ConsumeRequest {
            bucket_key: key.to_string(),
            now_ms,
            capacity: params.capacity,
            refill_tokens_per_second: params.refill_tokens_per_second,
            burst_capacity: params.burst_capacity,
            cost,
            ttl_ms,
        }
    }

    /// Run `(cost, now_ms)` steps through the script and the engine side by
    /// side, asserting identical replies. Returns the script's replies.
    async fn run_against_engine(
        store: &RedisBucketStore,
        key: &str,
        params: BucketParams,
        steps: &[(u32, u64)],
    ) -> Vec<BucketReply> {
        let mut engine_state: Option<BucketState> = None;
        let mut replies = Vec::new();
        for &(cost, now_ms) in steps {
            let reply = store
                .consume(&request(key, params, cost, now_ms, 60_000))
                .await
                .unwrap();
            let expected = token_bucket::consume(engine_state, &params, cost, now_ms);
            engine_state = Some(expected.state);
            assert_eq!(reply, BucketReply::from(expected), "step cost={} now={}", cost, now_ms);
            replies.push(reply);
        }
        replies
    }

    async fn stored_tokens(pool: &Pool, key: &str) -> f64 {
        let mut conn = pool.get().await.unwrap();
        let tokens: String = redis::cmd("HGET")
            .arg(key)
            .arg("tokens")
            .query_async(&mut *conn)
            .await
            .unwrap();
        tokens.parse().unwrap()
    }

    fn params(capacity: u32, rate: f64, burst: u32) -> BucketParams {
        BucketParams {
            capacity,
            refill_tokens_per_second: rate,
            burst_capacity: burst,
        }
    }

    #[tokio::test]
    async fn script_cost_six_twice_denies_with_400ms() {
        let (store, _pool) = store().await;
        let key = unique_key("six-six");
        let replies = run_against_engine(&store, &key, params(10, 5.0, 0), &[(6, 1_000), (6, 1_000)]).await;
        assert!(replies[0].allowed);
        assert_eq!(replies[0].remaining, 4);
        assert!(!replies[1].allowed);
        assert_eq!(replies[1].retry_after_ms, Some(400));
        assert_eq!(replies[1].remaining, 4);
    }

    #[tokio::test]
    async fn script_fresh_key_starts_full_including_burst() {
        let (store, _pool) = store().await;
        let key = unique_key("fresh");
        let replies = run_against_engine(&store, &key, params(8, 1.0, 2), &[(10, 5_000), (1, 5_000)]).await;
        assert!(replies[0].allowed);
        assert_eq!(replies[0].remaining, 0);
        assert!(!replies[1].allowed);
    }

    #[tokio::test]
    async fn script_repeated_denial_consumes_nothing() {
        let (store, pool) = store().await;
        let key = unique_key("idempotent");
        let p = params(3, 1.0, 0);
        run_against_engine(&store, &key, p, &[(2, 0)]).await;
        let before = stored_tokens(&pool, &key).await;

        let replies = run_against_engine(&store, &key, p, &[(3, 0), (3, 0), (3, 0)]).await;
        assert!(replies.iter().all(|r| !r.allowed && r.retry_after_ms == Some(2_000)));
        assert_eq!(stored_tokens(&pool, &key).await, before);
    }

    #[tokio::test]
    async fn script_refill_is_capped_and_skew_tolerant() {
        let (store, _pool) = store().await;
        let key = unique_key("refill");
        let replies = run_against_engine(
            &store,
            &key,
            params(10, 3.0, 2),
            // drain, partial refill, clock going backwards, long idle (capped)
            &[(12, 10_000), (1, 10_200), (1, 9_000), (1, 10_500), (12, 50_000)],
        )
        .await;
        assert!(replies[4].allowed);
        assert_eq!(replies[4].remaining, 0);
    }

    #[tokio::test]
    async fn script_zero_refill_reports_never() {
        let (store, _pool) = store().await;
        let key = unique_key("no-refill");
        let replies = run_against_engine(&store, &key, params(1, 0.0, 0), &[(1, 0), (1, 30_000)]).await;
        assert!(!replies[1].allowed);
        assert_eq!(replies[1].retry_after_ms, None);
    }

    #[tokio::test]
    async fn script_caps_retry_for_vanishing_rates() {
        let (store, _pool) = store().await;
        let key = unique_key("tiny-rate");
        let replies = run_against_engine(&store, &key, params(1, 1e-18, 0), &[(1, 0), (1, 0)]).await;
        assert_eq!(replies[1].retry_after_ms, Some(MAX_RETRY_AFTER_MS));
    }

    #[tokio::test]
    async fn script_refreshes_ttl_on_every_write() {
        let (store, pool) = store().await;
        let key = unique_key("ttl");
        let p = params(5, 1.0, 0);
        store.consume(&request(&key, p, 1, 0, 5_000)).await.unwrap();
        store.consume(&request(&key, p, 50, 0, 60_000)).await.unwrap();

        let mut conn = pool.get().await.unwrap();
        let pttl: i64 = redis::cmd("PTTL").arg(&key).query_async(&mut *conn).await.unwrap();
        assert!(pttl > 5_000 && pttl <= 60_000, "pttl {}", pttl);
    }
}
