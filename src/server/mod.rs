pub mod handler;

use tonic::transport::Server;
use tonic_reflection::server::Builder as ReflectionBuilder;
use tracing::info;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::decision::DecisionService;
use crate::errors::{RateLimitError, Result};
use crate::generated::rate_limiter_service_server::RateLimiterServiceServer;
use crate::limiter::BucketStore;
use crate::rules::RuleStore;

/// gRPC and metrics listener configuration
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub metrics_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 50051,
            metrics_port: 9090,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("GRPC_HOST").unwrap_or(defaults.host),
            port: std::env::var("GRPC_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            metrics_port: std::env::var("METRICS_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.metrics_port),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Start the gRPC server with reflection support
pub async fn start_server<R, B>(
    config: &ServerConfig,
    service: Arc<DecisionService<R, B>>,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()>
where
    R: RuleStore + 'static,
    B: BucketStore + 'static,
{
    let addr: SocketAddr = config.addr().parse().map_err(|e| {
        RateLimitError::ConfigurationError(format!("Invalid server address: {}", e))
    })?;

    info!("Starting gRPC server on {}", addr);

    let rate_limiter_service = handler::RateLimiterServiceImpl::new(service);

    let reflection_service = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(crate::generated::FILE_DESCRIPTOR_SET)
        .build_v1()
        .map_err(|e| {
            RateLimitError::InternalError(format!("Failed to build reflection service: {}", e))
        })?;

    info!("gRPC reflection enabled");

    Server::builder()
        .add_service(RateLimiterServiceServer::new(rate_limiter_service))
        .add_service(reflection_service)
        .serve_with_shutdown(addr, shutdown)
        .await
        .map_err(|e| RateLimitError::InternalError(format!("Server error: {}", e)))?;

    Ok(())
}
