use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::decision::DecisionService;
use crate::errors::RateLimitError;
use crate::generated;
use crate::limiter::BucketStore;
use crate::rules::{Rule, RuleStore};

use generated::{
    health_check_response::ServingStatus, rate_limiter_service_server::RateLimiterService,
    CheckRequest, CheckResponse, GetRuleRequest, HealthCheckRequest, HealthCheckResponse,
    RuleResponse, UpsertRuleRequest,
};

pub struct RateLimiterServiceImpl<R: RuleStore, B: BucketStore> {
    service: Arc<DecisionService<R, B>>,
}

impl<R: RuleStore, B: BucketStore> RateLimiterServiceImpl<R, B> {
    pub fn new(service: Arc<DecisionService<R, B>>) -> Self {
        Self { service }
    }
}

#[tonic::async_trait]
impl<R, B> RateLimiterService for RateLimiterServiceImpl<R, B>
where
    R: RuleStore + 'static,
    B: BucketStore + 'static,
{
    async fn check_and_consume(
        &self,
        request: Request<CheckRequest>,
    ) -> Result<Response<CheckResponse>, Status> {
        let req = request.into_inner();
        debug!("CheckAndConsume request: {:?}", req);

        if req.key.trim().is_empty() || req.rule_id.trim().is_empty() {
            return Err(Status::invalid_argument("key and rule_id are required"));
        }
        let cost = u64::try_from(req.cost)
            .ok()
            .filter(|cost| *cost >= 1)
            .ok_or_else(|| Status::invalid_argument("cost must be at least 1"))?;

        let decision = self
            .service
            .check_and_consume(&req.key, &req.rule_id, cost)
            .await?;

        Ok(Response::new(CheckResponse {
            allowed: decision.allowed,
            retry_after_ms: saturating_i64(decision.retry_after_ms),
            remaining: saturating_i64(decision.remaining),
            limit: i64::from(decision.limit),
            retry_after_secs: saturating_i64(decision.retry_after_secs),
        }))
    }

    async fn upsert_rule(
        &self,
        request: Request<UpsertRuleRequest>,
    ) -> Result<Response<RuleResponse>, Status> {
        let req = request.into_inner();
        info!(rule_id = %req.rule_id, "Received UpsertRule request");

        let rule = rule_from_request(req)?;
        let stored = self.service.upsert_rule(rule).await?;

        Ok(Response::new(rule_response(&stored)))
    }

    async fn get_rule(
        &self,
        request: Request<GetRuleRequest>,
    ) -> Result<Response<RuleResponse>, Status> {
        let req = request.into_inner();
        debug!(rule_id = %req.rule_id, "Received GetRule request");

        let rule = self.service.get_rule(&req.rule_id).await?;
        Ok(Response::new(rule_response(&rule)))
    }

    async fn health_check(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let response = match self.service.health_check().await {
            Ok(()) => HealthCheckResponse {
                status: ServingStatus::Serving as i32,
                message: "Bucket store reachable".to_string(),
            },
            Err(e) => {
                warn!("Health check failed: {}", e);
                HealthCheckResponse {
                    status: ServingStatus::NotServing as i32,
                    message: e.to_string(),
                }
            }
        };

        Ok(Response::new(response))
    }
}

fn rule_from_request(req: UpsertRuleRequest) -> Result<Rule, RateLimitError> {
    Ok(Rule {
        capacity: int_field("capacity", req.capacity)?,
        burst_capacity: int_field("burstCapacity", req.burst_capacity)?,
        ttl_ms: int_field("ttlMs", req.ttl_ms)?,
        max_cost: int_field("maxCost", req.max_cost)?,
        refill_tokens_per_second: req.refill_tokens_per_second,
        rule_id: req.rule_id,
        endpoint: req.endpoint,
        plan: req.plan,
    })
}

fn int_field<T: TryFrom<i64>>(name: &str, value: i64) -> Result<T, RateLimitError> {
    T::try_from(value)
        .map_err(|_| RateLimitError::InvalidRule(format!("{} out of range: {}", name, value)))
}

fn rule_response(rule: &Rule) -> RuleResponse {
    RuleResponse {
        rule_id: rule.rule_id.clone(),
        endpoint: rule.endpoint.clone(),
        plan: rule.plan.clone(),
        capacity: i64::from(rule.capacity),
        refill_tokens_per_second: rule.refill_tokens_per_second,
        burst_capacity: i64::from(rule.burst_capacity),
        ttl_ms: saturating_i64(rule.ttl_ms),
        max_cost: i64::from(rule.max_cost),
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimiterSettings;
    use crate::limiter::{ManualClock, MemoryBucketStore};
    use crate::rules::MemoryRuleStore;
    use tonic::Code;

    fn handler() -> RateLimiterServiceImpl<MemoryRuleStore, MemoryBucketStore> {
        RateLimiterServiceImpl::new(Arc::new(DecisionService::new(
            Arc::new(MemoryRuleStore::new()),
            Arc::new(MemoryBucketStore::new()),
            Arc::new(ManualClock::new(0)),
            LimiterSettings::default(),
        )))
    }

    fn upsert(rule_id: &str, capacity: i64, max_cost: i64) -> UpsertRuleRequest {
        UpsertRuleRequest {
            rule_id: rule_id.to_string(),
            endpoint: "/api".to_string(),
            plan: "free".to_string(),
            capacity,
            refill_tokens_per_second: 5.0,
            burst_capacity: 0,
            ttl_ms: 60_000,
            max_cost,
        }
    }

    fn check(key: &str, rule_id: &str, cost: i64) -> Request<CheckRequest> {
        Request::new(CheckRequest {
            key: key.to_string(),
            rule_id: rule_id.to_string(),
            cost,
        })
    }

    #[tokio::test]
    async fn test_upsert_get_and_check() {
        let handler = handler();
        let stored = handler
            .upsert_rule(Request::new(upsert("api", 10, 6)))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(stored.capacity, 10);

        let fetched = handler
            .get_rule(Request::new(GetRuleRequest {
                rule_id: "api".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(fetched, stored);

        let first = handler.check_and_consume(check("u", "api", 6)).await.unwrap().into_inner();
        assert!(first.allowed);
        assert_eq!(first.remaining, 4);
        assert_eq!(first.limit, 10);

        let second = handler.check_and_consume(check("u", "api", 6)).await.unwrap().into_inner();
        assert!(!second.allowed);
        assert_eq!(second.retry_after_ms, 400);
        assert_eq!(second.retry_after_secs, 1);
    }

    #[tokio::test]
    async fn test_client_errors_map_to_status_codes() {
        let handler = handler();
        handler
            .upsert_rule(Request::new(upsert("api", 10, 2)))
            .await
            .unwrap();

        let status = handler.check_and_consume(check("u", "missing", 1)).await.unwrap_err();
        assert_eq!(status.code(), Code::NotFound);

        let status = handler.check_and_consume(check("u", "api", 3)).await.unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);

        let status = handler.check_and_consume(check("u", "api", 0)).await.unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);

        let status = handler.check_and_consume(check("", "api", 1)).await.unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);

        let status = handler
            .upsert_rule(Request::new(upsert("bad", -1, 1)))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);

        let status = handler
            .upsert_rule(Request::new(upsert("bad", 0, 1)))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_health_check_reports_serving() {
        let response = handler()
            .health_check(Request::new(HealthCheckRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.status, ServingStatus::Serving as i32);
    }
}
