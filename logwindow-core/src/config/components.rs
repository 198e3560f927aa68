use std::time::Duration;

use logwindow_jetstream::{JetstreamSourceConfig, NatsAuth};

use crate::compression::Codec;
use crate::config::spec::{JetstreamSpec, NatsAuthSpec};

pub(crate) const DEFAULT_READ_BATCH_SIZE: usize = 500;
pub(crate) const DEFAULT_READ_TIMEOUT_MS: u64 = 1_000;
pub(crate) const DEFAULT_MAX_INFLIGHT_MESSAGES: usize = 100_000;
pub(crate) const DEFAULT_SOURCE_WORKERS: usize = 1;
pub(crate) const DEFAULT_MAX_MESSAGES_PER_WINDOW: usize = 50_000;
pub(crate) const DEFAULT_MAX_BYTES_PER_WINDOW: usize = 64 * 1024 * 1024;
pub(crate) const DEFAULT_MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;
pub(crate) const DEFAULT_ACK_TIMEOUT_MS: u64 = 10_000;

pub(crate) const DEFAULT_ALLOWED_OUT_OF_ORDERNESS_MS: u64 = 5_000;
pub(crate) const DEFAULT_GRACE_PERIOD_MS: u64 = 2_000;
pub(crate) const DEFAULT_MAX_OPEN_DURATION_MS: u64 = 5 * 60 * 1_000;
pub(crate) const DEFAULT_MAX_LAG_MS: u64 = 2 * 60 * 1_000;
pub(crate) const DEFAULT_TICK_INTERVAL_MS: u64 = 500;
pub(crate) const DEFAULT_FLUSHED_RETENTION_MS: u64 = 30 * 60 * 1_000;

pub(crate) const DEFAULT_WRITE_TIMEOUT_MS: u64 = 30_000;
pub(crate) const DEFAULT_WRITE_CONCURRENCY: usize = 4;
pub(crate) const DEFAULT_RETRY_MAX_ATTEMPTS: u16 = 5;
pub(crate) const DEFAULT_RETRY_INITIAL_INTERVAL_MS: u64 = 200;
pub(crate) const DEFAULT_RETRY_MAX_INTERVAL_MS: u64 = 10_000;
pub(crate) const DEFAULT_RETRY_FACTOR: f64 = 2.0;
pub(crate) const DEFAULT_RETRY_JITTER: f64 = 0.2;

pub(crate) const DEFAULT_GENERATOR_RPU: usize = 5;
pub(crate) const DEFAULT_GENERATOR_MSG_SIZE: usize = 64;

#[derive(Debug, Clone)]
pub(crate) struct SourceConfig {
    pub(crate) source_type: SourceType,
    pub(crate) read_batch_size: usize,
    pub(crate) read_timeout: Duration,
    /// Upper bound on messages read but not yet acked or nacked.
    pub(crate) max_inflight_messages: usize,
    pub(crate) workers: usize,
    pub(crate) ack_timeout: Duration,
    /// Header carrying the event time; publish time is used when unset.
    pub(crate) event_time_header: Option<String>,
    /// Larger payloads are treated as malformed and land in the processing-time window.
    pub(crate) max_message_bytes: usize,
}

#[derive(Debug, Clone)]
pub(crate) enum SourceType {
    Jetstream(JetstreamSourceConfig),
    Generator(GeneratorConfig),
}

#[derive(Debug, Clone)]
pub(crate) struct GeneratorConfig {
    /// Messages produced per read.
    pub(crate) rpu: usize,
    pub(crate) msg_size_bytes: usize,
    /// Event times are set this far behind the wall clock.
    pub(crate) event_time_skew: Duration,
    /// Re-emit every n-th message with the same id, 0 disables it.
    pub(crate) duplicate_every: usize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct WindowConfig {
    pub(crate) length: Duration,
}

/// Caps on a single batch. Exceeding either seals the batch as a continuation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BatchLimits {
    pub(crate) max_messages: usize,
    pub(crate) max_bytes: usize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TriggerConfig {
    pub(crate) allowed_out_of_orderness: Duration,
    pub(crate) grace_period: Duration,
    pub(crate) max_open_duration: Duration,
    pub(crate) max_lag: Duration,
    pub(crate) tick_interval: Duration,
    /// How long a flushed window is remembered for duplicate and late routing.
    pub(crate) flushed_retention: Duration,
}

#[derive(Debug, Clone)]
pub(crate) struct SinkConfig {
    pub(crate) output_directory: String,
    pub(crate) filename_prefix: String,
    pub(crate) date_partitioned: bool,
    pub(crate) codec: Codec,
    pub(crate) write_timeout: Duration,
    pub(crate) write_concurrency: usize,
    pub(crate) retry: RetryConfig,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct RetryConfig {
    pub(crate) max_attempts: u16,
    pub(crate) initial_interval: Duration,
    pub(crate) max_interval: Duration,
    pub(crate) factor: f64,
    pub(crate) jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            initial_interval: Duration::from_millis(DEFAULT_RETRY_INITIAL_INTERVAL_MS),
            max_interval: Duration::from_millis(DEFAULT_RETRY_MAX_INTERVAL_MS),
            factor: DEFAULT_RETRY_FACTOR,
            jitter: DEFAULT_RETRY_JITTER,
        }
    }
}

impl From<JetstreamSpec> for JetstreamSourceConfig {
    fn from(spec: JetstreamSpec) -> Self {
        JetstreamSourceConfig {
            addr: spec.url,
            stream: spec.stream,
            consumer: spec.consumer,
            auth: spec.auth.map(|auth| match auth {
                NatsAuthSpec::Basic { username, password } => {
                    NatsAuth::Basic { username, password }
                }
                NatsAuthSpec::Nkey(nkey) => NatsAuth::NKey(nkey),
                NatsAuthSpec::Token(token) => NatsAuth::Token(token),
            }),
        }
    }
}
