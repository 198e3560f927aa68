//! Sink writer: persists compressed window batches to blob storage.
//!
//! A write is a create-only put under a deterministic path, so an existing object is never
//! replaced. When the path is taken, its content is compared: identical bytes mean an earlier
//! attempt (or an earlier run of the pipeline) already persisted the batch; different bytes mean
//! the path belongs to another incarnation of the window, so the artifact is relocated to the late
//! variant or the next sequence and the put is tried again there. Transient failures retry with
//! exponential backoff up to the attempt ceiling; permission and credential failures end the
//! write at once.

use std::sync::Arc;
use std::time::Duration;

use backoff::retry::Retry;
use backoff::strategy::exponential::Exponential;
use bytes::Bytes;
use tokio::time;
use tracing::{debug, info, warn};

use crate::compression::Codec;
use crate::config::components::{RetryConfig, SinkConfig};
use crate::metrics::pipeline_metrics;
use crate::window::WindowKey;
use crate::{Error, Result};

/// Deterministic artifact paths.
pub(crate) mod path;

/// `object_store` backed [BlobStore].
pub(crate) mod store;

#[cfg(test)]
pub(crate) mod test_utils;

use path::{OutputPath, PathBuilder};

/// How many alternative paths are tried before giving up on a write.
const MAX_RELOCATIONS: usize = 16;

/// Result of a create-only put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PutOutcome {
    Created,
    /// Something already lives at the path; it was left untouched.
    AlreadyExists,
}

/// Storage boundary. `put_object` must be atomic and create-if-absent: readers see either no
/// object or the complete one, and of two concurrent puts to the same path exactly one creates.
#[trait_variant::make(BlobStore: Send)]
#[allow(dead_code)]
pub(crate) trait LocalBlobStore {
    async fn put_object(
        &self,
        path: &str,
        bytes: Bytes,
        content_type: &'static str,
    ) -> Result<PutOutcome>;

    /// Size of the object, or None when it does not exist.
    async fn head_object(&self, path: &str) -> Result<Option<u64>>;

    async fn get_object(&self, path: &str) -> Result<Option<Bytes>>;
}

/// A compressed batch, ready to be written. Never mutated once created; relocation produces a
/// new path for the same bytes.
#[derive(Debug, Clone)]
pub(crate) struct OutputArtifact {
    pub(crate) key: WindowKey,
    pub(crate) seq: u32,
    pub(crate) codec: Codec,
    pub(crate) message_count: usize,
    pub(crate) bytes: Bytes,
}

impl OutputArtifact {
    pub(crate) fn byte_size(&self) -> usize {
        self.bytes.len()
    }
}

/// Proof of a durable write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WriteReceipt {
    pub(crate) path: OutputPath,
    pub(crate) byte_size: usize,
    /// The exact bytes were already at `path`; nothing was written.
    pub(crate) already_persisted: bool,
}

pub(crate) struct SinkWriter<S> {
    store: Arc<S>,
    paths: PathBuilder,
    write_timeout: Duration,
    retry: RetryConfig,
}

impl<S> SinkWriter<S>
where
    S: BlobStore + Send + Sync + 'static,
{
    pub(crate) fn new(
        store: Arc<S>,
        paths: PathBuilder,
        write_timeout: Duration,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            paths,
            write_timeout,
            retry,
        }
    }

    pub(crate) fn from_config(store: Arc<S>, config: &SinkConfig) -> Self {
        Self::new(
            store,
            PathBuilder::new(
                config.output_directory.as_str(),
                config.filename_prefix.as_str(),
                config.date_partitioned,
                config.codec,
            ),
            config.write_timeout,
            config.retry,
        )
    }

    pub(crate) fn codec(&self) -> Codec {
        self.paths.codec()
    }

    /// Persists the artifact, retrying transient failures. Returns only once the bytes are
    /// durable, or with the last error once retries are exhausted or the error is fatal.
    pub(crate) async fn write(&self, artifact: &OutputArtifact) -> Result<WriteReceipt> {
        let backoff = Exponential::new(
            self.retry.initial_interval,
            self.retry.max_interval,
            self.retry.factor,
        )
        .with_jitter(self.retry.jitter)
        .with_max_attempts(self.retry.max_attempts.saturating_sub(1));

        let receipt = Retry::new(
            backoff,
            || self.attempt(artifact),
            |e: &Error, attempt: u16| {
                if !e.is_retryable() {
                    return false;
                }
                warn!(
                    window = %artifact.key,
                    seq = artifact.seq,
                    attempt,
                    error = ?e,
                    "Retrying window write"
                );
                pipeline_metrics().sink.write_retries.inc();
                true
            },
        )
        .await?;

        info!(
            window = %artifact.key,
            seq = artifact.seq,
            path = %receipt.path,
            bytes = receipt.byte_size,
            messages = artifact.message_count,
            already_persisted = receipt.already_persisted,
            "Window persisted"
        );
        Ok(receipt)
    }

    async fn attempt(&self, artifact: &OutputArtifact) -> Result<WriteReceipt> {
        time::timeout(self.write_timeout, self.place(artifact))
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "writing window {} seq {} exceeded {:?}",
                    artifact.key, artifact.seq, self.write_timeout
                ))
            })?
    }

    /// Creates the artifact at its path, or at the first relocation not holding other content.
    async fn place(&self, artifact: &OutputArtifact) -> Result<WriteReceipt> {
        let (mut key, mut seq) = (artifact.key, artifact.seq);
        for _ in 0..MAX_RELOCATIONS {
            let path = self.paths.build(&key, seq);
            let outcome = self
                .store
                .put_object(
                    &path.relative,
                    artifact.bytes.clone(),
                    artifact.codec.content_type(),
                )
                .await?;
            let already_persisted = match outcome {
                PutOutcome::Created => false,
                PutOutcome::AlreadyExists => {
                    self.holds_same_content(&path, &artifact.bytes).await?
                }
            };
            if outcome == PutOutcome::Created || already_persisted {
                return Ok(WriteReceipt {
                    path,
                    byte_size: artifact.byte_size(),
                    already_persisted,
                });
            }
            debug!(%path, "Path taken by a different artifact, relocating");
            (key, seq) = PathBuilder::relocate(key, seq);
        }
        Err(Error::SinkFatal(format!(
            "no free path for window {} after {MAX_RELOCATIONS} relocations",
            artifact.key
        )))
    }

    /// True when the object at `path` holds exactly `bytes`.
    async fn holds_same_content(&self, path: &OutputPath, bytes: &Bytes) -> Result<bool> {
        match self.store.head_object(&path.relative).await? {
            Some(size) if size == bytes.len() as u64 => {
                let existing = self.store.get_object(&path.relative).await?;
                Ok(existing.is_some_and(|existing| existing == *bytes))
            }
            _ => Ok(false),
        }
    }
}
