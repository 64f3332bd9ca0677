use crate::decision::DecisionService;
use crate::errors::{RateLimitError, Result};
use crate::limiter::BucketStore;
use crate::rules::RuleStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Serve `GET /metrics` (Prometheus text format) and `GET /internal/store/ping`.
pub async fn start_metrics_server<R, B>(port: u16, service: Arc<DecisionService<R, B>>) -> Result<()>
where
    R: RuleStore + 'static,
    B: BucketStore + 'static,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        RateLimitError::InternalError(format!("Failed to bind metrics server: {}", e))
    })?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                continue;
            }
        };

        let service = Arc::clone(&service);
        tokio::spawn(async move {
            let mut buffer = [0; 1024];
            let read = match socket.read(&mut buffer).await {
                Ok(read) => read,
                Err(e) => {
                    error!("Failed to read from socket: {}", e);
                    return;
                }
            };

            let request = String::from_utf8_lossy(&buffer[..read]);
            let response = respond(&request, &service).await;
            if let Err(e) = socket.write_all(response.as_bytes()).await {
                warn!("Failed to write metrics response: {}", e);
            }
        });
    }
}

async fn respond<R: RuleStore, B: BucketStore>(
    request: &str,
    service: &DecisionService<R, B>,
) -> String {
    let request_line = request.lines().next().unwrap_or_default();

    if request_line.starts_with("GET /metrics") || request_line.starts_with("GET / ") {
        return match gather_metrics() {
            Ok(metrics) => http_response("200 OK", "text/plain; version=0.0.4", &metrics),
            Err(e) => {
                error!("Failed to gather metrics: {}", e);
                http_response("500 Internal Server Error", "text/plain", "")
            }
        };
    }

    if request_line.starts_with("GET /internal/store/ping") {
        return match service.health_check().await {
            Ok(()) => http_response("200 OK", "text/plain", "PONG"),
            Err(e) => {
                warn!("Store ping failed: {}", e);
                http_response("503 Service Unavailable", "text/plain", &e.to_string())
            }
        };
    }

    http_response("404 Not Found", "text/plain", "Try GET /metrics")
}

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    )
}

/// Encode the default registry in the text exposition format
fn gather_metrics() -> std::result::Result<String, String> {
    use prometheus::{Encoder, TextEncoder};

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Failed to convert metrics to UTF-8: {}", e))
}
