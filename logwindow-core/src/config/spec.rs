use serde::Deserialize;

use crate::config::components::{
    DEFAULT_ACK_TIMEOUT_MS, DEFAULT_ALLOWED_OUT_OF_ORDERNESS_MS, DEFAULT_FLUSHED_RETENTION_MS,
    DEFAULT_GRACE_PERIOD_MS, DEFAULT_MAX_BYTES_PER_WINDOW, DEFAULT_MAX_INFLIGHT_MESSAGES,
    DEFAULT_MAX_LAG_MS, DEFAULT_MAX_MESSAGE_BYTES, DEFAULT_MAX_MESSAGES_PER_WINDOW,
    DEFAULT_MAX_OPEN_DURATION_MS, DEFAULT_READ_BATCH_SIZE, DEFAULT_READ_TIMEOUT_MS,
    DEFAULT_RETRY_FACTOR, DEFAULT_RETRY_INITIAL_INTERVAL_MS, DEFAULT_RETRY_JITTER,
    DEFAULT_RETRY_MAX_ATTEMPTS, DEFAULT_RETRY_MAX_INTERVAL_MS, DEFAULT_SOURCE_WORKERS,
    DEFAULT_TICK_INTERVAL_MS, DEFAULT_WRITE_CONCURRENCY, DEFAULT_WRITE_TIMEOUT_MS,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PipelineSpec {
    pub(crate) source: SourceSpec,
    pub(crate) event_time_header: Option<String>,
    pub(crate) output_directory: String,
    pub(crate) output_filename_prefix: Option<String>,
    #[serde(default)]
    pub(crate) date_partitioned: bool,
    pub(crate) window_duration_secs: Option<u64>,
    pub(crate) compression: Option<String>,
    #[serde(default)]
    pub(crate) limits: LimitsSpec,
    #[serde(default)]
    pub(crate) trigger: TriggerSpec,
    #[serde(default)]
    pub(crate) sink: SinkSpec,
    pub(crate) shutdown_timeout_ms: Option<u64>,
    pub(crate) metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) enum SourceSpec {
    Jetstream(JetstreamSpec),
    Generator(GeneratorSpec),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JetstreamSpec {
    pub(crate) url: String,
    pub(crate) stream: String,
    pub(crate) consumer: String,
    pub(crate) auth: Option<NatsAuthSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) enum NatsAuthSpec {
    Basic { username: String, password: String },
    Nkey(String),
    Token(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GeneratorSpec {
    pub(crate) rpu: Option<usize>,
    pub(crate) msg_size_bytes: Option<usize>,
    pub(crate) event_time_skew_ms: Option<u64>,
    pub(crate) duplicate_every: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct LimitsSpec {
    pub(crate) read_batch_size: usize,
    pub(crate) read_timeout_ms: u64,
    pub(crate) max_inflight_messages: usize,
    pub(crate) source_workers: usize,
    pub(crate) max_messages_per_window: usize,
    pub(crate) max_bytes_per_window: usize,
    pub(crate) max_message_bytes: usize,
    pub(crate) ack_timeout_ms: u64,
}

impl Default for LimitsSpec {
    fn default() -> Self {
        Self {
            read_batch_size: DEFAULT_READ_BATCH_SIZE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            max_inflight_messages: DEFAULT_MAX_INFLIGHT_MESSAGES,
            source_workers: DEFAULT_SOURCE_WORKERS,
            max_messages_per_window: DEFAULT_MAX_MESSAGES_PER_WINDOW,
            max_bytes_per_window: DEFAULT_MAX_BYTES_PER_WINDOW,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct TriggerSpec {
    pub(crate) allowed_out_of_orderness_ms: u64,
    pub(crate) grace_period_ms: u64,
    pub(crate) max_open_duration_ms: u64,
    pub(crate) max_lag_ms: u64,
    pub(crate) tick_interval_ms: u64,
    pub(crate) flushed_retention_ms: u64,
}

impl Default for TriggerSpec {
    fn default() -> Self {
        Self {
            allowed_out_of_orderness_ms: DEFAULT_ALLOWED_OUT_OF_ORDERNESS_MS,
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            max_open_duration_ms: DEFAULT_MAX_OPEN_DURATION_MS,
            max_lag_ms: DEFAULT_MAX_LAG_MS,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            flushed_retention_ms: DEFAULT_FLUSHED_RETENTION_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct SinkSpec {
    pub(crate) write_timeout_ms: u64,
    pub(crate) write_concurrency: usize,
    pub(crate) retry: RetrySpec,
}

impl Default for SinkSpec {
    fn default() -> Self {
        Self {
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            write_concurrency: DEFAULT_WRITE_CONCURRENCY,
            retry: RetrySpec::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct RetrySpec {
    pub(crate) max_attempts: u16,
    pub(crate) initial_interval_ms: u64,
    pub(crate) max_interval_ms: u64,
    pub(crate) factor: f64,
    pub(crate) jitter: f64,
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            initial_interval_ms: DEFAULT_RETRY_INITIAL_INTERVAL_MS,
            max_interval_ms: DEFAULT_RETRY_MAX_INTERVAL_MS,
            factor: DEFAULT_RETRY_FACTOR,
            jitter: DEFAULT_RETRY_JITTER,
        }
    }
}
