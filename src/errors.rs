use thiserror::Error;
use tonic::{Code, Status};

#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Cost {cost} exceeds maxCost {max_cost}")]
    CostTooHigh { cost: u64, max_cost: u32 },

    #[error("Rule store unavailable: {0}")]
    RuleStoreUnavailable(String),

    #[error("Bucket store unavailable: {0}")]
    BucketStoreUnavailable(String),

    #[error("Malformed bucket reply: {0}")]
    MalformedBucketReply(String),

    #[error("Unexpected bucket reply type: {0}")]
    UnexpectedBucketReplyType(String),

    #[error("Redis connection error: {0}")]
    RedisConnectionError(#[from] redis::RedisError),

    #[error("File system error: {0}")]
    FileSystemError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl RateLimitError {
    /// Client errors are reported back to the caller as rejections with a
    /// reason code; everything else is an infrastructure problem.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RateLimitError::RuleNotFound(_)
                | RateLimitError::InvalidRule(_)
                | RateLimitError::CostTooHigh { .. }
        )
    }

    /// Stable reason code surfaced to callers and used as a metric label.
    pub fn reason(&self) -> &'static str {
        match self {
            RateLimitError::ConfigurationError(_) => "configuration_error",
            RateLimitError::RuleNotFound(_) => "rule_not_found",
            RateLimitError::InvalidRule(_) => "invalid_rule",
            RateLimitError::CostTooHigh { .. } => "cost_too_high",
            RateLimitError::RuleStoreUnavailable(_) => "rule_store_unavailable",
            RateLimitError::BucketStoreUnavailable(_) => "store_unreachable",
            RateLimitError::MalformedBucketReply(_) => "malformed_reply",
            RateLimitError::UnexpectedBucketReplyType(_) => "unexpected_field_type",
            RateLimitError::RedisConnectionError(_) => "redis_error",
            RateLimitError::FileSystemError(_) => "file_system_error",
            RateLimitError::JsonError(_) => "json_error",
            RateLimitError::InternalError(_) => "internal_error",
        }
    }
}

impl From<RateLimitError> for Status {
    fn from(value: RateLimitError) -> Self {
        let reason = value.reason();
        match value {
            RateLimitError::RuleNotFound(rule_id) => {
                Status::new(Code::NotFound, format!("{}: {}", reason, rule_id))
            }
            RateLimitError::InvalidRule(msg) => {
                Status::new(Code::InvalidArgument, format!("{}: {}", reason, msg))
            }
            err @ RateLimitError::CostTooHigh { .. } => {
                Status::new(Code::InvalidArgument, format!("{}: {}", reason, err))
            }
            RateLimitError::RuleStoreUnavailable(msg)
            | RateLimitError::BucketStoreUnavailable(msg) => {
                Status::new(Code::Unavailable, format!("{}: {}", reason, msg))
            }
            RateLimitError::RedisConnectionError(err) => Status::new(
                Code::Unavailable,
                format!("Redis connection error: {}", err),
            ),
            RateLimitError::ConfigurationError(msg) => {
                Status::new(Code::Internal, format!("Configuration Error: {}", msg))
            }
            other => Status::new(Code::Internal, format!("{}: {}", reason, other)),
        }
    }
}

/// Result type alias for rate limiter operations
pub type Result<T> = std::result::Result<T, RateLimitError>;
