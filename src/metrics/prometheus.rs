//! Prometheus metrics definitions and HTTP server

use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Total number of reconciliations
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "pachyderm_backup_operator_reconciliations_total",
        "Total number of reconciliations",
        &["kind"]
    ).unwrap();

    /// Total number of reconciliation errors
    pub static ref RECONCILIATION_ERRORS: CounterVec = register_counter_vec!(
        "pachyderm_backup_operator_reconciliation_errors_total",
        "Total number of reconciliation errors",
        &["kind"]
    ).unwrap();

    /// Reconciliation duration histogram
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "pachyderm_backup_operator_reconcile_duration_seconds",
        "Duration of reconciliations in seconds",
        &["kind"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    /// Jobs submitted to the backup handler
    pub static ref JOBS_SUBMITTED: CounterVec = register_counter_vec!(
        "pachyderm_backup_operator_jobs_submitted_total",
        "Backup and restore jobs submitted to the backup handler",
        &["kind", "namespace"]
    ).unwrap();

    /// Jobs observed in a terminal phase
    pub static ref JOBS_FINISHED: CounterVec = register_counter_vec!(
        "pachyderm_backup_operator_jobs_finished_total",
        "Backup and restore jobs by terminal phase",
        &["kind", "phase"]
    ).unwrap();

    /// Jobs worked by the dispatch loop
    pub static ref JOBS_DISPATCHED: CounterVec = register_counter_vec!(
        "pachyderm_backup_handler_jobs_dispatched_total",
        "Jobs worked by the dispatch loop by outcome",
        &["kind", "outcome"]
    ).unwrap();

    /// Uncompressed size of written archives
    pub static ref ARCHIVE_BYTES: prometheus::Histogram = prometheus::register_histogram!(
        "pachyderm_backup_handler_archive_bytes",
        "Uncompressed size of written archives",
        prometheus::exponential_buckets(1024.0, 8.0, 10).unwrap_or_default()
    ).unwrap();

    /// Total number of cleanup operations
    pub static ref CLEANUPS: CounterVec = register_counter_vec!(
        "pachyderm_backup_operator_cleanups_total",
        "Total number of cleanup operations",
        &["kind"]
    ).unwrap();

    /// Operator health (1 = healthy, 0 = unhealthy)
    pub static ref OPERATOR_HEALTH: prometheus::Gauge = prometheus::register_gauge!(
        "pachyderm_backup_operator_health",
        "Operator health status (1 = healthy, 0 = unhealthy)"
    ).unwrap();
}

/// Count a job worked by the dispatch loop
pub fn record_job(kind: &str, outcome: &str) {
    JOBS_DISPATCHED.with_label_values(&[kind, outcome]).inc();
}

/// Record the size of a written archive
pub fn record_archive_bytes(bytes: u64) {
    ARCHIVE_BYTES.observe(bytes as f64);
}

/// Count a job reaching a terminal phase on its resource
pub fn record_finished(kind: &str, phase: &str) {
    JOBS_FINISHED.with_label_values(&[kind, phase]).inc();
}

/// Start the metrics HTTP server
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    OPERATOR_HEALTH.set(1.0);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!("Error serving connection: {}", e);
            }
        });
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => metrics_response(),
        "/healthz" | "/health" => text_response(StatusCode::OK, "ok"),
        "/readyz" | "/ready" => ready_response(),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}

/// Render the default registry in text exposition format
pub fn render() -> Result<(String, Vec<u8>), prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok((encoder.format_type().to_string(), buffer))
}

fn metrics_response() -> Response<Full<Bytes>> {
    match render() {
        Ok((content_type, buffer)) => {
            let mut response = Response::new(Full::new(Bytes::from(buffer)));
            if let Ok(value) = HeaderValue::from_str(&content_type) {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics")
        }
    }
}

fn ready_response() -> Response<Full<Bytes>> {
    if OPERATOR_HEALTH.get() >= 1.0 {
        text_response(StatusCode::OK, "ok")
    } else {
        text_response(StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_metrics_include_dispatch_counters() {
        record_job("backup", "completed");
        record_archive_bytes(2048);

        let (content_type, buffer) = render().unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("pachyderm_backup_handler_jobs_dispatched_total"));
        assert!(text.contains("pachyderm_backup_handler_archive_bytes"));
    }

    #[test]
    fn text_response_sets_status() {
        let response = text_response(StatusCode::NOT_FOUND, "Not Found");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
