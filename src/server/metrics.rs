use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all chat server metrics
const PREFIX: &str = "chat_server";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_http_requests_total"), "Total number of HTTP requests"),
        &["method", "path", "status"]
    ).expect("Failed to create http_requests_total metric");

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_http_request_duration_seconds"),
            "HTTP request duration in seconds"
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
        &["method", "path"]
    ).expect("Failed to create http_request_duration_seconds metric");

    // Websocket chat protocol
    pub static ref WS_CONNECTIONS: IntGauge = IntGauge::new(
        format!("{PREFIX}_ws_connections"),
        "Number of open chat websocket connections"
    ).expect("Failed to create ws_connections metric");

    pub static ref PROTOCOL_EVENTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_protocol_events_total"), "Chat protocol events by outcome"),
        &["event", "outcome"]
    ).expect("Failed to create protocol_events_total metric");

    pub static ref ENGINE_FAILURES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_engine_failures_total"), "Conversation engine failures by kind"),
        &["kind"]
    ).expect("Failed to create engine_failures_total metric");

    // Future jobs
    pub static ref FUTURE_JOBS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_future_jobs_total"), "Processed future jobs by outcome"),
        &["action_type", "outcome"]
    ).expect("Failed to create future_jobs_total metric");

    pub static ref FUTURE_JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_future_job_duration_seconds"),
            "Future job handler duration in seconds"
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        &["action_type"]
    ).expect("Failed to create future_job_duration_seconds metric");

    pub static ref PROCESS_MEMORY_BYTES: Gauge = Gauge::new(
        format!("{PREFIX}_process_memory_bytes"),
        "Process memory usage in bytes"
    ).expect("Failed to create process_memory_bytes metric");
}

/// Registers every metric. Already registered metrics are ignored, so tests can call it
/// repeatedly.
pub fn init_metrics() {
    let _ = REGISTRY.register(Box::new(HTTP_REQUESTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(WS_CONNECTIONS.clone()));
    let _ = REGISTRY.register(Box::new(PROTOCOL_EVENTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(ENGINE_FAILURES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(FUTURE_JOBS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(FUTURE_JOB_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(PROCESS_MEMORY_BYTES.clone()));

    tracing::info!("Metrics system initialized successfully");
}

pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();

    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration.as_secs_f64());
}

pub fn set_ws_connections(count: usize) {
    WS_CONNECTIONS.set(count as i64);
}

/// `event` is one of connect, message, ping, close; `outcome` is the response action or
/// `error`.
pub fn record_protocol_event(event: &str, outcome: &str) {
    PROTOCOL_EVENTS_TOTAL
        .with_label_values(&[event, outcome])
        .inc();
}

pub fn record_engine_failure(kind: &str) {
    ENGINE_FAILURES_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_future_job(action_type: &str, outcome: &str, duration: Duration) {
    FUTURE_JOBS_TOTAL
        .with_label_values(&[action_type, outcome])
        .inc();

    FUTURE_JOB_DURATION_SECONDS
        .with_label_values(&[action_type])
        .observe(duration.as_secs_f64());
}

pub fn update_memory_usage() {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<f64>().ok());
            if let Some(kb) = rss_kb {
                PROCESS_MEMORY_BYTES.set(kb * 1024.0);
            }
        }
    }
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    update_memory_usage();

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}
