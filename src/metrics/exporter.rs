use crate::metrics::collector::EngineCollector;
use crate::{NetlogError, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Serves traffic metrics in the Prometheus text format at `/metrics`
pub struct PrometheusExporter {
    registry: Registry,
}

impl PrometheusExporter {
    pub fn new(collector: EngineCollector) -> Result<Self> {
        let registry = Registry::new();
        registry.register(Box::new(collector))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self { registry })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current metrics in the text exposition format
    pub fn render(&self) -> Result<String> {
        Ok(TextEncoder::new().encode_to_string(&self.registry.gather())?)
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.registry.clone())
    }

    pub async fn bind(address: &str, port: u16) -> Result<TcpListener> {
        let bind_address = format!("{}:{}", address, port);
        TcpListener::bind(&bind_address)
            .await
            .map_err(|source| NetlogError::MetricsBind {
                address: bind_address,
                source,
            })
    }

    /// Serve until `shutdown` is cancelled
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        if let Ok(local) = listener.local_addr() {
            info!("Starting Prometheus exporter on {}", local);
        }

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Prometheus exporter stopped");
        Ok(())
    }
}

async fn metrics_handler(State(registry): State<Registry>) -> impl IntoResponse {
    match tokio::task::spawn_blocking(move || {
        TextEncoder::new().encode_to_string(&registry.gather())
    })
    .await
    {
        Ok(Ok(body)) => (StatusCode::OK, body),
        Ok(Err(e)) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {e}"),
            )
        }
        Err(e) => {
            error!("Metrics gathering task failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to gather metrics".to_string(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::AggregationEngine;
    use netlog_common::PacketRecord;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[test]
    fn test_render_includes_traffic_families() {
        let engine = AggregationEngine::new();
        engine.record(&PacketRecord::new("172.17.0.2", "8.8.8.8", "UDP", 80));

        let exporter = PrometheusExporter::new(EngineCollector::new(engine).unwrap()).unwrap();
        let text = exporter.render().unwrap();

        assert!(text.contains(r#"network_logger_packets_total{protocol="UDP"} 1"#));
        assert!(text.contains(r#"network_logger_bandwidth_bytes_total{ip="8.8.8.8"} 80"#));
    }

    #[tokio::test]
    async fn test_serves_metrics_over_http() {
        let engine = AggregationEngine::new();
        engine.record(&PacketRecord::new("10.0.0.1", "10.0.0.2", "TCP", 100));

        let exporter = PrometheusExporter::new(EngineCollector::new(engine).unwrap()).unwrap();
        let listener = PrometheusExporter::bind("127.0.0.1", 0).await.unwrap();
        let address = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(exporter.serve(listener, shutdown.clone()));

        let mut stream = TcpStream::connect(address).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#"network_logger_packets_total{protocol="TCP"} 1"#));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let taken = PrometheusExporter::bind("127.0.0.1", 0).await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = PrometheusExporter::bind("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, NetlogError::MetricsBind { .. }));
    }
}
