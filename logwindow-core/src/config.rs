use std::env;
use std::time::Duration;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;

use crate::Error;
use crate::Result;
use crate::compression::Codec;
use crate::config::components::{
    BatchLimits, GeneratorConfig, RetryConfig, SinkConfig, SourceConfig, SourceType,
    TriggerConfig, WindowConfig,
};
use crate::config::spec::{PipelineSpec, SourceSpec};

/// Environment variable holding the base64 encoded JSON pipeline spec.
pub(crate) const ENV_PIPELINE_SPEC: &str = "LOGWINDOW_SPEC";

const DEFAULT_WINDOW_DURATION_SECS: u64 = 60;
const DEFAULT_CODEC: &str = "gzip";
const DEFAULT_FILENAME_PREFIX: &str = "logs-";
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_METRICS_PORT: u16 = 2469;

/// Typed components built from the spec.
pub(crate) mod components;

/// The wire format of the spec, as deserialized from JSON.
pub(crate) mod spec;

/// Immutable pipeline settings, validated once at startup.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) source: SourceConfig,
    pub(crate) window: WindowConfig,
    pub(crate) limits: BatchLimits,
    pub(crate) trigger: TriggerConfig,
    pub(crate) sink: SinkConfig,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) metrics_port: u16,
}

impl Settings {
    /// Loads the settings from [ENV_PIPELINE_SPEC]. Any problem here is fatal: the pipeline must
    /// not start consuming with a configuration it cannot honor.
    pub(crate) fn load() -> Result<Self> {
        let encoded = env::var(ENV_PIPELINE_SPEC)
            .map_err(|_| Error::Config(format!("environment variable {ENV_PIPELINE_SPEC} is not set")))?;
        Self::from_encoded(&encoded)
    }

    pub(crate) fn from_encoded(encoded: &str) -> Result<Self> {
        let decoded = BASE64_STANDARD
            .decode(encoded.trim().as_bytes())
            .map_err(|e| Error::Config(format!("Failed to base64 decode pipeline spec: {e:?}")))?;
        let spec: PipelineSpec = serde_json::from_slice(&decoded)
            .map_err(|e| Error::Config(format!("Failed to parse pipeline spec: {e:?}")))?;
        Self::try_from(spec)
    }
}

impl TryFrom<PipelineSpec> for Settings {
    type Error = Error;

    fn try_from(spec: PipelineSpec) -> Result<Self> {
        let window_secs = spec
            .window_duration_secs
            .unwrap_or(DEFAULT_WINDOW_DURATION_SECS);
        if window_secs == 0 {
            return Err(Error::Config(
                "windowDurationSecs must be greater than zero".to_string(),
            ));
        }

        let codec: Codec = spec
            .compression
            .as_deref()
            .unwrap_or(DEFAULT_CODEC)
            .parse()?;

        if spec.output_directory.is_empty() || !spec.output_directory.ends_with('/') {
            return Err(Error::Config(format!(
                "outputDirectory must end with '/', got {:?}",
                spec.output_directory
            )));
        }

        let limits = spec.limits;
        let trigger = spec.trigger;
        let sink = spec.sink;
        let retry = sink.retry;

        let source_type = match spec.source {
            SourceSpec::Jetstream(js) => SourceType::Jetstream(js.into()),
            SourceSpec::Generator(generator) => SourceType::Generator(GeneratorConfig {
                rpu: generator.rpu.unwrap_or(components::DEFAULT_GENERATOR_RPU),
                msg_size_bytes: generator
                    .msg_size_bytes
                    .unwrap_or(components::DEFAULT_GENERATOR_MSG_SIZE),
                event_time_skew: Duration::from_millis(generator.event_time_skew_ms.unwrap_or(0)),
                duplicate_every: generator.duplicate_every.unwrap_or(0),
            }),
        };

        let settings = Settings {
            source: SourceConfig {
                source_type,
                read_batch_size: limits.read_batch_size,
                read_timeout: Duration::from_millis(limits.read_timeout_ms),
                max_inflight_messages: limits.max_inflight_messages,
                workers: limits.source_workers,
                ack_timeout: Duration::from_millis(limits.ack_timeout_ms),
                event_time_header: spec.event_time_header.filter(|h| !h.is_empty()),
                max_message_bytes: limits.max_message_bytes,
            },
            window: WindowConfig {
                length: Duration::from_secs(window_secs),
            },
            limits: BatchLimits {
                max_messages: limits.max_messages_per_window,
                max_bytes: limits.max_bytes_per_window,
            },
            trigger: TriggerConfig {
                allowed_out_of_orderness: Duration::from_millis(trigger.allowed_out_of_orderness_ms),
                grace_period: Duration::from_millis(trigger.grace_period_ms),
                max_open_duration: Duration::from_millis(trigger.max_open_duration_ms),
                max_lag: Duration::from_millis(trigger.max_lag_ms),
                tick_interval: Duration::from_millis(trigger.tick_interval_ms),
                flushed_retention: Duration::from_millis(trigger.flushed_retention_ms),
            },
            sink: SinkConfig {
                output_directory: spec.output_directory,
                filename_prefix: spec
                    .output_filename_prefix
                    .unwrap_or_else(|| DEFAULT_FILENAME_PREFIX.to_string()),
                date_partitioned: spec.date_partitioned,
                codec,
                write_timeout: Duration::from_millis(sink.write_timeout_ms),
                write_concurrency: sink.write_concurrency,
                retry: RetryConfig {
                    max_attempts: retry.max_attempts,
                    initial_interval: Duration::from_millis(retry.initial_interval_ms),
                    max_interval: Duration::from_millis(retry.max_interval_ms),
                    factor: retry.factor,
                    jitter: retry.jitter,
                },
            },
            shutdown_timeout: Duration::from_millis(
                spec.shutdown_timeout_ms
                    .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            ),
            metrics_port: spec.metrics_port.unwrap_or(DEFAULT_METRICS_PORT),
        };
        settings.validate()?;
        Ok(settings)
    }
}

impl Settings {
    fn validate(&self) -> Result<()> {
        let positive = [
            ("limits.readBatchSize", self.source.read_batch_size),
            ("limits.maxInflightMessages", self.source.max_inflight_messages),
            ("limits.sourceWorkers", self.source.workers),
            ("limits.maxMessagesPerWindow", self.limits.max_messages),
            ("limits.maxBytesPerWindow", self.limits.max_bytes),
            ("limits.maxMessageBytes", self.source.max_message_bytes),
            ("sink.writeConcurrency", self.sink.write_concurrency),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(Error::Config(format!("{name} must be greater than zero")));
        }

        if self.source.max_inflight_messages < self.source.read_batch_size {
            return Err(Error::Config(
                "limits.maxInflightMessages must be at least limits.readBatchSize".to_string(),
            ));
        }

        let durations = [
            ("limits.readTimeoutMs", self.source.read_timeout),
            ("trigger.maxOpenDurationMs", self.trigger.max_open_duration),
            ("trigger.maxLagMs", self.trigger.max_lag),
            ("trigger.tickIntervalMs", self.trigger.tick_interval),
            ("sink.writeTimeoutMs", self.sink.write_timeout),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::Config(format!("{name} must be greater than zero")));
        }

        let retry = &self.sink.retry;
        if retry.max_attempts == 0 {
            return Err(Error::Config(
                "sink.retry.maxAttempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            return Err(Error::Config(format!(
                "sink.retry.jitter must be within [0, 1], got {}",
                retry.jitter
            )));
        }
        if retry.factor < 1.0 {
            return Err(Error::Config(format!(
                "sink.retry.factor must be at least 1, got {}",
                retry.factor
            )));
        }
        if retry.max_interval < retry.initial_interval {
            return Err(Error::Config(
                "sink.retry.maxIntervalMs must not be smaller than initialIntervalMs".to_string(),
            ));
        }
        Ok(())
    }
}
