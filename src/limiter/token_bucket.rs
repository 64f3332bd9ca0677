//! Token bucket refill-then-consume arithmetic.
//!
//! This is the reference for `scripts/token_bucket.lua`: any store-side
//! procedure must produce the same outcome for the same inputs. Tokens are
//! real-valued; only the reported `remaining` is floored.

/// Largest wait the engine reports. Every integer up to 2^53 is exact in
/// both f64 and Lua numbers, so the script clamps to the same value.
pub const MAX_RETRY_AFTER_MS: u64 = 1 << 53;

/// Rule parameters that shape one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketParams {
    pub capacity: u32,
    pub refill_tokens_per_second: f64,
    pub burst_capacity: u32,
}

impl BucketParams {
    pub fn ceiling(&self) -> f64 {
        f64::from(self.capacity) + f64::from(self.burst_capacity)
    }
}

/// Persisted per-key state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill_at_ms: u64,
}

impl BucketState {
    /// A never-seen key starts full.
    pub fn full(params: &BucketParams, now_ms: u64) -> Self {
        Self {
            tokens: params.ceiling(),
            last_refill_at_ms: now_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumeOutcome {
    pub allowed: bool,
    /// `Some(0)` when allowed; `None` when denied and the bucket never refills.
    pub retry_after_ms: Option<u64>,
    pub remaining: u64,
    /// State to persist, stamped with the decision time.
    pub state: BucketState,
}

/// Tokens available at `now_ms`, capped at the bucket ceiling.
pub fn available_tokens(state: &BucketState, params: &BucketParams, now_ms: u64) -> f64 {
    let elapsed_ms = now_ms.saturating_sub(state.last_refill_at_ms) as f64;
    let refilled = state.tokens + elapsed_ms / 1000.0 * params.refill_tokens_per_second;
    refilled.min(params.ceiling())
}

/// Refill, then try to take `cost` tokens. A denial consumes nothing.
pub fn consume(
    prior: Option<BucketState>,
    params: &BucketParams,
    cost: u32,
    now_ms: u64,
) -> ConsumeOutcome {
    let state = prior.unwrap_or_else(|| BucketState::full(params, now_ms));
    let available = available_tokens(&state, params, now_ms);
    let cost = f64::from(cost);

    if available >= cost {
        let tokens = available - cost;
        return ConsumeOutcome {
            allowed: true,
            retry_after_ms: Some(0),
            remaining: floor_tokens(tokens),
            state: BucketState {
                tokens,
                last_refill_at_ms: now_ms,
            },
        };
    }

    let retry_after_ms = if params.refill_tokens_per_second > 0.0 {
        let wait = ((cost - available) / params.refill_tokens_per_second * 1000.0).ceil();
        Some(wait.min(MAX_RETRY_AFTER_MS as f64) as u64)
    } else {
        None
    };

    ConsumeOutcome {
        allowed: false,
        retry_after_ms,
        remaining: floor_tokens(available),
        state: BucketState {
            tokens: available,
            last_refill_at_ms: now_ms,
        },
    }
}

fn floor_tokens(tokens: f64) -> u64 {
    tokens.max(0.0).floor() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(capacity: u32, rate: f64, burst: u32) -> BucketParams {
        BucketParams {
            capacity,
            refill_tokens_per_second: rate,
            burst_capacity: burst,
        }
    }

    #[test]
    fn test_fresh_key_starts_full_including_burst() {
        let p = params(10, 1.0, 5);
        let outcome = consume(None, &p, 15, 1_000);
        assert!(outcome.allowed);
        assert_eq!(outcome.remaining, 0);

        let outcome = consume(None, &p, 10, 1_000);
        assert!(outcome.allowed);
        assert_eq!(outcome.remaining, 5);
        assert_eq!(outcome.state.last_refill_at_ms, 1_000);
    }

    #[test]
    fn test_refill_is_monotonic_and_capped() {
        let p = params(10, 2.0, 3);
        let drained = BucketState {
            tokens: 0.0,
            last_refill_at_ms: 0,
        };

        let mut previous = 0.0;
        for t in [0u64, 100, 500, 1_000, 2_500, 6_000, 6_500, 60_000] {
            let available = available_tokens(&drained, &p, t);
            assert!(available >= previous, "refill went backwards at t={}", t);
            assert!(available <= p.ceiling());
            previous = available;
        }
        assert_eq!(previous, 13.0);
    }

    #[test]
    fn test_clock_skew_does_not_drain_tokens() {
        let p = params(5, 1.0, 0);
        let state = BucketState {
            tokens: 2.5,
            last_refill_at_ms: 10_000,
        };
        assert_eq!(available_tokens(&state, &p, 9_000), 2.5);
    }

    #[test]
    fn test_denial_keeps_tokens_and_reports_pre_cost_remaining() {
        let p = params(10, 5.0, 0);
        let state = BucketState {
            tokens: 4.7,
            last_refill_at_ms: 0,
        };
        let outcome = consume(Some(state), &p, 6, 0);
        assert!(!outcome.allowed);
        assert_eq!(outcome.remaining, 4);
        assert_eq!(outcome.state.tokens, 4.7);
    }

    #[test]
    fn test_repeated_denial_is_idempotent() {
        let p = params(3, 1.0, 0);
        let mut state = Some(BucketState {
            tokens: 1.0,
            last_refill_at_ms: 500,
        });
        for _ in 0..5 {
            let outcome = consume(state, &p, 2, 500);
            assert!(!outcome.allowed);
            assert_eq!(outcome.state.tokens, 1.0);
            assert_eq!(outcome.retry_after_ms, Some(1_000));
            state = Some(outcome.state);
        }
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let p = params(10, 5.0, 0);
        let first = consume(None, &p, 6, 0);
        assert!(first.allowed);
        assert_eq!(first.remaining, 4);

        let second = consume(Some(first.state), &p, 6, 0);
        assert!(!second.allowed);
        assert_eq!(second.retry_after_ms, Some(400));

        let p = params(10, 3.0, 0);
        let state = BucketState {
            tokens: 0.0,
            last_refill_at_ms: 0,
        };
        // 1 / 3 s = 333.33 ms
        assert_eq!(consume(Some(state), &p, 1, 0).retry_after_ms, Some(334));
    }

    #[test]
    fn test_vanishing_refill_rate_caps_the_wait() {
        let p = params(1, 1e-18, 0);
        let state = BucketState {
            tokens: 0.0,
            last_refill_at_ms: 0,
        };
        let outcome = consume(Some(state), &p, 1, 0);
        assert!(!outcome.allowed);
        assert_eq!(outcome.retry_after_ms, Some(MAX_RETRY_AFTER_MS));
    }

    #[test]
    fn test_zero_refill_denial_has_no_computed_wait() {
        let p = params(1, 0.0, 0);
        let first = consume(None, &p, 1, 0);
        assert!(first.allowed);

        let later = consume(Some(first.state), &p, 1, 3_600_000);
        assert!(!later.allowed);
        assert_eq!(later.retry_after_ms, None);
        assert_eq!(later.remaining, 0);
    }

    #[test]
    fn test_fractional_tokens_survive_between_calls() {
        let p = params(2, 0.5, 0);
        let state = BucketState {
            tokens: 0.0,
            last_refill_at_ms: 0,
        };
        let outcome = consume(Some(state), &p, 1, 1_000);
        assert!(!outcome.allowed);
        assert_eq!(outcome.state.tokens, 0.5);
        assert_eq!(outcome.remaining, 0);

        let outcome = consume(Some(outcome.state), &p, 1, 2_000);
        assert!(outcome.allowed);
        assert_eq!(outcome.state.tokens, 0.0);
    }
}
