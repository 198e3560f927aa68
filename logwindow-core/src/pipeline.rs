//! Wires a source to the accumulator and the sink.
//!
//! Shutdown is driven by the cancellation token: the source workers stop pulling, the input
//! stream ends, the accumulator force-closes and flushes every live window, and the source's ack
//! task settles the remaining acks once the flushes complete. A fatal sink error takes the same
//! path, except that the unflushed messages are nacked.

use std::sync::Arc;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::Result;
use crate::accumulator::Accumulator;
use crate::config::Settings;
use crate::config::components::SourceType;
use crate::sinker::store::ObjectStoreBlob;
use crate::sinker::{BlobStore, SinkWriter};
use crate::source::generator::{GeneratorAck, GeneratorRead};
use crate::source::jetstream::new_jetstream_source;
use crate::source::{Source, SourceAcker, SourceOptions, SourceReader};

/// Builds the configured source and blob store and runs until `cln_token` is cancelled.
pub(crate) async fn start_pipeline(settings: &Settings, cln_token: CancellationToken) -> Result<()> {
    let store = Arc::new(ObjectStoreBlob::from_url(&settings.sink.output_directory)?);

    match &settings.source.source_type {
        SourceType::Jetstream(js_config) => {
            let source = new_jetstream_source(
                js_config.clone(),
                settings.source.read_batch_size,
                settings.source.read_timeout,
            )
            .await?;
            run(settings, source.clone(), source, store, cln_token).await
        }
        SourceType::Generator(generator_config) => {
            let reader = GeneratorRead::new(generator_config.clone());
            run(settings, reader, GeneratorAck, store, cln_token).await
        }
    }
}

pub(crate) async fn run<R, A, S>(
    settings: &Settings,
    reader: R,
    acker: A,
    store: Arc<S>,
    cln_token: CancellationToken,
) -> Result<()>
where
    R: SourceReader + Send + 'static,
    A: SourceAcker + Send + 'static,
    S: BlobStore + Send + Sync + 'static,
{
    let source = Source::new(reader, acker, SourceOptions::from(&settings.source));
    let (input, source_task) = source.streaming_read(cln_token.clone())?;

    let writer = SinkWriter::from_config(store, &settings.sink);
    let accumulator = Accumulator::new(settings, writer);
    info!(
        window = ?settings.window.length,
        codec = %settings.sink.codec,
        directory = settings.sink.output_directory,
        "Started pipeline"
    );

    let accumulator_result = accumulator.run(input).await;
    if let Err(e) = &accumulator_result {
        error!(?e, "Accumulator failed, stopping the source");
        cln_token.cancel();
    }

    // the ack task finishes once every message handed out is resolved
    let source_result = match time::timeout(settings.shutdown_timeout, source_task).await {
        Ok(joined) => joined?,
        Err(_) => {
            warn!(
                timeout = ?settings.shutdown_timeout,
                "Source did not settle its acks in time, unresolved messages will be redelivered"
            );
            Ok(())
        }
    };

    accumulator_result.and(source_result)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    use super::*;
    use crate::Error;
    use crate::compression::{self, Codec};
    use crate::config::tests::encode;
    use crate::sinker::test_utils::MemoryStore;
    use crate::source::test_utils::SimpleSource;

    fn at(secs: i64) -> Option<DateTime<Utc>> {
        Some(Utc.timestamp_opt(secs, 0).unwrap())
    }

    fn settings(compression: &str) -> Settings {
        Settings::from_encoded(&encode(json!({
            "source": { "generator": {} },
            "outputDirectory": "memory:///",
            "outputFilenamePrefix": "logs-",
            "compression": compression,
            "eventTimeHeader": "event-time",
            "limits": { "readBatchSize": 10, "maxInflightMessages": 100 },
            "trigger": {
                "allowedOutOfOrdernessMs": 0,
                "gracePeriodMs": 20,
                "maxLagMs": 50,
                "tickIntervalMs": 10
            },
            "sink": {
                "writeConcurrency": 2,
                "retry": { "maxAttempts": 3, "initialIntervalMs": 1, "maxIntervalMs": 5, "jitter": 0.0 }
            },
            "shutdownTimeoutMs": 5000
        })))
        .unwrap()
    }

    /// Waits until the source acked `n` messages.
    async fn wait_for_acks(source: &SimpleSource, n: usize) {
        time::timeout(Duration::from_secs(5), async {
            while source.acked_ids().len() < n {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_windows_written_once_and_acked() {
        let settings = settings("gzip");
        let source = SimpleSource::new(10);
        source.push("a", Bytes::from_static(b"a"), at(1));
        source.push("b", Bytes::from_static(b"b"), at(61));
        source.push("c", Bytes::from_static(b"c"), at(2));
        // redelivery of an already read message
        source.push("a", Bytes::from_static(b"a"), at(1));

        let store = Arc::new(MemoryStore::default());
        let cln_token = CancellationToken::new();
        let pipeline = tokio::spawn({
            let settings = settings.clone();
            let source = source.clone();
            let store = Arc::clone(&store);
            let cln_token = cln_token.clone();
            async move { run(&settings, source.clone(), source, store, cln_token).await }
        });

        wait_for_acks(&source, 4).await;
        cln_token.cancel();
        pipeline.await.unwrap().unwrap();

        let objects = store.objects();
        let paths: Vec<_> = objects.iter().map(|(path, _)| path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "logs-1970-01-01T00:00:00Z-1970-01-01T00:01:00Z.gz",
                "logs-1970-01-01T00:01:00Z-1970-01-01T00:02:00Z.gz",
            ]
        );
        assert_eq!(
            compression::decompress(&objects[0].1, Codec::Gzip).unwrap(),
            b"a\nc\n"
        );
        assert_eq!(
            compression::decompress(&objects[1].1, Codec::Gzip).unwrap(),
            b"b\n"
        );
        assert!(source.nacked_ids().is_empty());
        assert!(source.is_drained());
    }

    #[tokio::test]
    async fn test_event_time_header_takes_precedence() {
        let settings = settings("uncompressed");
        let source = SimpleSource::new(10);
        source.push_with_headers(
            "a",
            Bytes::from_static(b"a"),
            at(500),
            [("event-time".to_string(), "1970-01-01T00:00:30Z".to_string())].into(),
        );

        let store = Arc::new(MemoryStore::default());
        let cln_token = CancellationToken::new();
        let pipeline = tokio::spawn({
            let source = source.clone();
            let store = Arc::clone(&store);
            let cln_token = cln_token.clone();
            async move { run(&settings, source.clone(), source, store, cln_token).await }
        });

        wait_for_acks(&source, 1).await;
        cln_token.cancel();
        pipeline.await.unwrap().unwrap();

        assert_eq!(
            store
                .object("logs-1970-01-01T00:00:00Z-1970-01-01T00:01:00Z.json")
                .unwrap(),
            Bytes::from_static(b"a\n")
        );
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_before_acking() {
        let settings = settings("uncompressed");
        let source = SimpleSource::new(10);
        source.push("a", Bytes::from_static(b"a"), at(1));

        let store = Arc::new(MemoryStore::default());
        store.fail_next_puts(2);
        let cln_token = CancellationToken::new();
        let pipeline = tokio::spawn({
            let source = source.clone();
            let store = Arc::clone(&store);
            let cln_token = cln_token.clone();
            async move { run(&settings, source.clone(), source, store, cln_token).await }
        });

        wait_for_acks(&source, 1).await;
        cln_token.cancel();
        pipeline.await.unwrap().unwrap();

        assert_eq!(store.failed_puts(), 2);
        assert_eq!(store.objects().len(), 1);
        assert!(source.nacked_ids().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_open_windows() {
        let settings = settings("uncompressed");
        let source = SimpleSource::new(10);
        // the lag bound cannot close a window of the current minute within the test
        source.push("a", Bytes::from_static(b"a"), Some(Utc::now()));

        let store = Arc::new(MemoryStore::default());
        let cln_token = CancellationToken::new();
        let pipeline = tokio::spawn({
            let mut settings = settings.clone();
            settings.trigger.max_lag = Duration::from_secs(3600);
            let source = source.clone();
            let store = Arc::clone(&store);
            let cln_token = cln_token.clone();
            async move { run(&settings, source.clone(), source, store, cln_token).await }
        });

        time::sleep(Duration::from_millis(100)).await;
        assert!(store.objects().is_empty());
        cln_token.cancel();
        pipeline.await.unwrap().unwrap();

        assert_eq!(store.objects().len(), 1);
        assert_eq!(source.acked_ids(), vec!["a"]);
        assert!(source.is_drained());
    }

    #[tokio::test]
    async fn test_fatal_sink_error_nacks_and_fails() {
        let settings = settings("uncompressed");
        let source = SimpleSource::new(10);
        source.push("a", Bytes::from_static(b"a"), at(1));

        let store = Arc::new(MemoryStore::default());
        store.deny_writes();
        let result = time::timeout(
            Duration::from_secs(5),
            run(
                &settings,
                source.clone(),
                source.clone(),
                store,
                CancellationToken::new(),
            ),
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(Error::SinkFatal(_))));
        assert!(source.acked_ids().is_empty());
        assert!(source.nacked_ids().contains(&"a".to_string()));
    }
}
