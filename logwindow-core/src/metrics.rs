use std::iter;
use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::body::Body;
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use axum::{Router, routing::get};
use axum_server::tls_rustls::RustlsConfig;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use rcgen::{CertifiedKey, generate_simple_self_signed};
use tracing::{debug, error, info};

use crate::Error;

// The top-level metric registry is created with the GLOBAL_PREFIX
const REGISTRY_GLOBAL_PREFIX: &str = "logwindow";
// Prefixes for the sub-registries
const SOURCE_REGISTRY_PREFIX: &str = "source";
const WINDOW_REGISTRY_PREFIX: &str = "window";
const SINK_REGISTRY_PREFIX: &str = "sink";

// Note: We do not add a suffix to the metric name, as the suffix is inferred through the metric type
// by the prometheus client library
const READ_TOTAL: &str = "read";
const READ_BYTES_TOTAL: &str = "read_bytes";
const ACK_TOTAL: &str = "ack";
const NACK_TOTAL: &str = "nack";
const READ_RETRIES_TOTAL: &str = "read_retries";
const DUPLICATE_TOTAL: &str = "duplicate";
const LATE_TOTAL: &str = "late";
const MALFORMED_TOTAL: &str = "malformed";
const FLUSH_TOTAL: &str = "flush";
const WRITE_RETRIES_TOTAL: &str = "write_retries";
const ARTIFACT_BYTES_TOTAL: &str = "artifact_bytes";
const WRITE_TIME: &str = "write_time";

pub(crate) const REASON_LABEL: &str = "reason";
pub(crate) const OUTCOME_LABEL: &str = "outcome";

/// The global register of all metrics.
struct GlobalRegistry {
    // It is okay to use a blocking mutex because we register each metric only one time.
    registry: parking_lot::Mutex<Registry>,
}

impl GlobalRegistry {
    fn new() -> Self {
        GlobalRegistry {
            registry: parking_lot::Mutex::new(Registry::default()),
        }
    }
}

/// GLOBAL_REGISTRY is the static global registry which is initialized only once.
static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::new)
}

/// Metrics of the pipeline. Fields are exposed to the components that update them.
pub(crate) struct PipelineMetrics {
    pub(crate) source: SourceMetrics,
    pub(crate) window: WindowMetrics,
    pub(crate) sink: SinkMetrics,
}

pub(crate) struct SourceMetrics {
    pub(crate) read_total: Counter,
    pub(crate) read_bytes_total: Counter,
    pub(crate) ack_total: Counter,
    pub(crate) nack_total: Counter,
    pub(crate) read_retries: Counter,
}

pub(crate) struct WindowMetrics {
    /// Redeliveries suppressed because the id was already buffered or flushed.
    pub(crate) duplicate_total: Counter,
    /// Messages routed to a late window.
    pub(crate) late_total: Counter,
    /// Messages assigned by processing time, labeled by [REASON_LABEL].
    pub(crate) malformed_total: Family<Vec<(String, String)>, Counter>,
    /// Batches handed to the sink, labeled by [OUTCOME_LABEL].
    pub(crate) flush_total: Family<Vec<(String, String)>, Counter>,
}

pub(crate) struct SinkMetrics {
    pub(crate) write_retries: Counter,
    pub(crate) artifact_bytes_total: Counter,
    /// Microseconds from the first attempt to the durable write.
    pub(crate) write_time: Histogram,
}

/// Exponential bucket distribution with range.
/// Creates `length` buckets, where the lowest bucket is `min` and the highest bucket is `max`.
/// `length` must be at least 2 and `min` positive.
fn exponential_buckets_range(min: f64, max: f64, length: u16) -> impl Iterator<Item = f64> {
    let growth_factor = (max / min).powf(1.0 / (f64::from(length) - 1.0));
    iter::successors(Some(min), move |prev| Some(prev * growth_factor)).take(length.into())
}

impl PipelineMetrics {
    fn new() -> Self {
        let metrics = Self {
            source: SourceMetrics {
                read_total: Counter::default(),
                read_bytes_total: Counter::default(),
                ack_total: Counter::default(),
                nack_total: Counter::default(),
                read_retries: Counter::default(),
            },
            window: WindowMetrics {
                duplicate_total: Counter::default(),
                late_total: Counter::default(),
                malformed_total: Family::<Vec<(String, String)>, Counter>::default(),
                flush_total: Family::<Vec<(String, String)>, Counter>::default(),
            },
            sink: SinkMetrics {
                write_retries: Counter::default(),
                artifact_bytes_total: Counter::default(),
                // 1 millisecond to 15 minutes
                write_time: Histogram::new(exponential_buckets_range(1_000.0, 60_000_000.0 * 15.0, 10)),
            },
        };

        let mut registry = global_registry().registry.lock();
        let registry = registry.sub_registry_with_prefix(REGISTRY_GLOBAL_PREFIX);

        let source_registry = registry.sub_registry_with_prefix(SOURCE_REGISTRY_PREFIX);
        source_registry.register(
            READ_TOTAL,
            "Total number of messages read from the queue",
            metrics.source.read_total.clone(),
        );
        source_registry.register(
            READ_BYTES_TOTAL,
            "Total number of payload bytes read from the queue",
            metrics.source.read_bytes_total.clone(),
        );
        source_registry.register(
            ACK_TOTAL,
            "Total number of messages acknowledged",
            metrics.source.ack_total.clone(),
        );
        source_registry.register(
            NACK_TOTAL,
            "Total number of messages released for redelivery",
            metrics.source.nack_total.clone(),
        );
        source_registry.register(
            READ_RETRIES_TOTAL,
            "Total number of reads retried after a transient queue error",
            metrics.source.read_retries.clone(),
        );

        let window_registry = registry.sub_registry_with_prefix(WINDOW_REGISTRY_PREFIX);
        window_registry.register(
            DUPLICATE_TOTAL,
            "Total number of redelivered messages suppressed as duplicates",
            metrics.window.duplicate_total.clone(),
        );
        window_registry.register(
            LATE_TOTAL,
            "Total number of messages routed to late windows",
            metrics.window.late_total.clone(),
        );
        window_registry.register(
            MALFORMED_TOTAL,
            "Total number of messages assigned by processing time",
            metrics.window.malformed_total.clone(),
        );
        window_registry.register(
            FLUSH_TOTAL,
            "Total number of window batches flushed, by outcome",
            metrics.window.flush_total.clone(),
        );

        let sink_registry = registry.sub_registry_with_prefix(SINK_REGISTRY_PREFIX);
        sink_registry.register(
            WRITE_RETRIES_TOTAL,
            "Total number of retried artifact writes",
            metrics.sink.write_retries.clone(),
        );
        sink_registry.register(
            ARTIFACT_BYTES_TOTAL,
            "Total number of compressed bytes persisted",
            metrics.sink.artifact_bytes_total.clone(),
        );
        sink_registry.register(
            WRITE_TIME,
            "Time taken to durably write an artifact in microseconds",
            metrics.sink.write_time.clone(),
        );

        metrics
    }
}

static PIPELINE_METRICS: OnceLock<PipelineMetrics> = OnceLock::new();

pub(crate) fn pipeline_metrics() -> &'static PipelineMetrics {
    PIPELINE_METRICS.get_or_init(PipelineMetrics::new)
}

/// Label set with a single `key=value` pair.
pub(crate) fn label(key: &str, value: &str) -> Vec<(String, String)> {
    vec![(key.to_string(), value.to_string())]
}

// metrics_handler is used to generate and return a snapshot of the
// current state of the metrics in the global registry
pub async fn metrics_handler() -> impl IntoResponse {
    // make sure every metric is registered before the first scrape
    pipeline_metrics();
    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &global_registry().registry.lock()) {
        error!(?e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    debug!("Exposing metrics: {:?}", buffer);
    Response::builder()
        .status(StatusCode::OK)
        .header(
            axum::http::header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )
        .body(Body::from(buffer))
        .map(IntoResponse::into_response)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

pub(crate) async fn start_metrics_https_server(addr: SocketAddr) -> crate::Result<()> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    // Generate a self-signed certificate
    let CertifiedKey { cert, signing_key: key_pair } = generate_simple_self_signed(vec!["localhost".into()])
        .map_err(|e| Error::Metrics(format!("Generating self-signed certificate: {e}")))?;

    let tls_config = RustlsConfig::from_pem(cert.pem().into(), key_pair.serialize_pem().into())
        .await
        .map_err(|e| Error::Metrics(format!("Creating tlsConfig from pem: {e}")))?;

    info!(%addr, "Starting metrics server");
    axum_server::bind_rustls(addr, tls_config)
        .serve(metrics_router().into_make_service())
        .await
        .map_err(|e| Error::Metrics(format!("Starting web server for metrics: {e}")))?;

    Ok(())
}

/// router for metrics and k8s health endpoints
fn metrics_router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez))
        .route("/readyz", get(livez))
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}
