pub mod config;
pub mod decision;
pub mod errors;
pub mod limiter;
pub mod metrics;
pub mod metrics_server;
pub mod redis;
pub mod rules;
pub mod server;

pub mod generated {
    tonic::include_proto!("tollgate.v1");

    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("tollgate_descriptor");
}

// Re-export commonly used types
pub use config::{AppConfig, LimiterSettings};
pub use decision::{Decision, DecisionService};
pub use errors::{RateLimitError, Result};
pub use rules::Rule;
pub use server::{start_server, ServerConfig};
