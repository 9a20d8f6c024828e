//! HTTP exporter for Prometheus metrics
//!
//! A minimal hyper server exposing `/metrics` (text format) and
//! `/health`. Runs on its own thread with a local single-threaded tokio
//! runtime so the rest of the control plane stays on the thread fabric.

use super::MetricsRegistry;
use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::thread::JoinHandle;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Exporter configuration.
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    pub listen_addr: SocketAddr,
}

impl Default for MetricsServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9090".parse().unwrap(),
        }
    }
}

/// The exporter.
pub struct MetricsServer {
    config: MetricsServerConfig,
    registry: MetricsRegistry,
}

impl MetricsServer {
    pub fn new(config: MetricsServerConfig, registry: MetricsRegistry) -> Self {
        Self { config, registry }
    }

    /// Run the exporter on a dedicated thread until the process exits.
    pub fn spawn(self) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("tarn-metrics-http".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_io()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        error!(%err, "failed to build metrics server runtime");
                        return;
                    }
                };
                if let Err(err) = runtime.block_on(self.serve()) {
                    error!(%err, "metrics server exited");
                }
            })
            .expect("failed to spawn metrics server thread")
    }

    async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .context("failed to bind metrics exporter")?;
        info!("metrics exporter listening on http://{}/metrics", self.config.listen_addr);

        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    error!(%err, "metrics exporter accept failed");
                    continue;
                }
            };
            let registry = self.registry.clone();
            tokio::spawn(conn::serve_connection(stream, registry, remote));
        }
    }

    /// Encode the current metric families as Prometheus text.
    pub fn encode(registry: &MetricsRegistry) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&registry.registry().gather(), &mut buffer)
            .context("failed to encode metrics")?;
        String::from_utf8(buffer).context("metrics are not valid UTF-8")
    }
}

// Serve one connection; inline module-level helper keeps `serve` readable.
mod conn {
    use super::*;

    pub async fn serve_connection(
        stream: tokio::net::TcpStream,
        registry: MetricsRegistry,
        remote: SocketAddr,
    ) {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req: Request<hyper::body::Incoming>| {
            let registry = registry.clone();
            async move { handle(req, registry).await }
        });
        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
            debug!(%remote, %err, "metrics connection error");
        }
    }

    async fn handle(
        req: Request<hyper::body::Incoming>,
        registry: MetricsRegistry,
    ) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
        let response = match req.uri().path() {
            "/health" | "/healthz" => Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from("OK")))
                .unwrap(),
            "/metrics" => match MetricsServer::encode(&registry) {
                Ok(text) => Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "text/plain; version=0.0.4")
                    .body(Full::new(Bytes::from(text)))
                    .unwrap(),
                Err(err) => Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Full::new(Bytes::from(err.to_string())))
                    .unwrap(),
            },
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("not found")))
                .unwrap(),
        };
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_produces_text_format() {
        let registry = MetricsRegistry::new().unwrap();
        let text = MetricsServer::encode(&registry).unwrap();
        assert!(text.contains("tarn_bus_published_total"));
    }
}
