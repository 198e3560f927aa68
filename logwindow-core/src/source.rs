//! The source adapter pulls messages from the queue and attaches an [AckHandle] to each of them.
//!
//! Reads and acks are served by two actors so a slow ack never stalls the pull loop. The pull
//! loop is the single throttling point of the pipeline: it reserves room on the bounded output
//! channel and in the in-flight budget *before* reading, so when the accumulator or the sink
//! falls behind, the source simply stops pulling. Transient read errors are retried in place
//! with exponential backoff; only a fatal one stops the worker.

use std::sync::Arc;
use std::time::Duration;

use backoff::retry::Retry;
use backoff::strategy::exponential::Exponential;
use backoff::strategy::fixed;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::components::SourceConfig;
use crate::message::{AckHandle, Message, Offset, ReadAck};
use crate::metrics::pipeline_metrics;
use crate::{Error, Result};

/// [Generator] is a builtin to generate data for load testing.
pub(crate) mod generator;

/// Jetstream source, the production queue.
pub(crate) mod jetstream;

#[cfg(test)]
pub(crate) mod test_utils;

/// How often resolved acks are flushed to the queue when the batch is not full.
const ACK_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// A failed ack or nack is retried at a fixed interval a few times before it is left to the
/// queue's redelivery.
const ACK_RETRY_INTERVAL: Duration = Duration::from_millis(50);
const ACK_RETRY_ATTEMPTS: usize = 3;

/// Backoff between retries of a failed read. Reads are retried until they succeed, fail
/// fatally, or the source is cancelled.
const READ_RETRY_INITIAL_INTERVAL: Duration = Duration::from_millis(50);
const READ_RETRY_MAX_INTERVAL: Duration = Duration::from_secs(1);
const READ_RETRY_FACTOR: f64 = 2.0;
const READ_RETRY_JITTER: f64 = 0.2;

/// Set of Read related items that has to be implemented to become a Source. Implementations
/// must bound a single read by the configured read timeout and return what they have.
#[trait_variant::make(SourceReader: Send)]
#[allow(dead_code)]
pub(crate) trait LocalSourceReader {
    /// Name of the source.
    fn name(&self) -> &'static str;

    async fn read(&mut self) -> Result<Vec<Message>>;
}

/// Set of Ack related items that has to be implemented to become a Source.
#[trait_variant::make(SourceAcker: Send)]
#[allow(dead_code)]
pub(crate) trait LocalSourceAcker {
    /// Acknowledges durably persisted messages.
    async fn ack(&mut self, offsets: Vec<Offset>) -> Result<()>;

    /// Releases messages for redelivery.
    async fn nack(&mut self, offsets: Vec<Offset>) -> Result<()>;
}

/// ReadActorMessage is a message to the ReadActor to read messages.
struct ReadActorMessage {
    respond_to: oneshot::Sender<Result<Vec<Message>>>,
}

/// ReadActor is responsible for reading messages from the source.
struct ReadActor<R> {
    reader: R,
}

impl<R> ReadActor<R>
where
    R: SourceReader,
{
    async fn handle_message(&mut self, message: ReadActorMessage) {
        let msgs = self.reader.read().await;
        let _ = message.respond_to.send(msgs);
    }
}

enum AckActorMessage {
    Ack {
        offsets: Vec<Offset>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Nack {
        offsets: Vec<Offset>,
        respond_to: oneshot::Sender<Result<()>>,
    },
}

/// AckActor is responsible for acknowledging the offsets.
struct AckActor<A> {
    acker: A,
}

impl<A> AckActor<A>
where
    A: SourceAcker,
{
    async fn handle_message(&mut self, message: AckActorMessage) {
        match message {
            AckActorMessage::Ack {
                offsets,
                respond_to,
            } => {
                let _ = respond_to.send(self.acker.ack(offsets).await);
            }
            AckActorMessage::Nack {
                offsets,
                respond_to,
            } => {
                let _ = respond_to.send(self.acker.nack(offsets).await);
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SourceOptions {
    pub(crate) read_batch_size: usize,
    pub(crate) max_inflight_messages: usize,
    pub(crate) workers: usize,
    pub(crate) ack_timeout: Duration,
}

impl From<&SourceConfig> for SourceOptions {
    fn from(config: &SourceConfig) -> Self {
        Self {
            read_batch_size: config.read_batch_size,
            max_inflight_messages: config.max_inflight_messages,
            workers: config.workers,
            ack_timeout: config.ack_timeout,
        }
    }
}

/// Handle to the source actors. Cheap to clone.
#[derive(Clone)]
pub(crate) struct Source {
    name: &'static str,
    options: SourceOptions,
    inflight: Arc<Semaphore>,
    read_sender: mpsc::Sender<ReadActorMessage>,
    ack_sender: mpsc::Sender<AckActorMessage>,
}

impl Source {
    /// Create a new Source. It starts the read and ack actors in the background.
    pub(crate) fn new<R, A>(reader: R, acker: A, options: SourceOptions) -> Self
    where
        R: SourceReader + Send + 'static,
        A: SourceAcker + Send + 'static,
    {
        let name = reader.name();
        let (read_sender, mut read_receiver) = mpsc::channel(options.workers.max(1));
        let (ack_sender, mut ack_receiver) = mpsc::channel(options.read_batch_size);

        let mut read_actor = ReadActor { reader };
        tokio::spawn(async move {
            while let Some(msg) = read_receiver.recv().await {
                read_actor.handle_message(msg).await;
            }
        });

        let mut ack_actor = AckActor { acker };
        tokio::spawn(async move {
            while let Some(msg) = ack_receiver.recv().await {
                ack_actor.handle_message(msg).await;
            }
        });

        Self {
            name,
            options,
            inflight: Arc::new(Semaphore::new(options.max_inflight_messages)),
            read_sender,
            ack_sender,
        }
    }

    /// read messages from the source by communicating with the read actor.
    async fn read(&self) -> Result<Vec<Message>> {
        let (sender, receiver) = oneshot::channel();
        let msg = ReadActorMessage { respond_to: sender };
        // Ignore send errors. If send fails, so does the recv.await below.
        let _ = self.read_sender.send(msg).await;
        receiver
            .await
            .map_err(|e| Error::ActorPatternRecv(e.to_string()))?
    }

    async fn ack(&self, offsets: Vec<Offset>) -> Result<()> {
        let (sender, receiver) = oneshot::channel();
        let msg = AckActorMessage::Ack {
            offsets,
            respond_to: sender,
        };
        let _ = self.ack_sender.send(msg).await;
        receiver
            .await
            .map_err(|e| Error::ActorPatternRecv(e.to_string()))?
    }

    async fn nack(&self, offsets: Vec<Offset>) -> Result<()> {
        let (sender, receiver) = oneshot::channel();
        let msg = AckActorMessage::Nack {
            offsets,
            respond_to: sender,
        };
        let _ = self.ack_sender.send(msg).await;
        receiver
            .await
            .map_err(|e| Error::ActorPatternRecv(e.to_string()))?
    }

    /// Starts streaming messages from the source. It returns a stream of messages and a handle
    /// to the spawned task. The task completes once the pull loops stopped (on cancellation) and
    /// every message handed out has been acked or nacked.
    pub(crate) fn streaming_read(
        &self,
        cln_token: CancellationToken,
    ) -> Result<(ReceiverStream<Message>, JoinHandle<Result<()>>)> {
        let batch_size = self.options.read_batch_size;
        let (messages_tx, messages_rx) = mpsc::channel(2 * batch_size);
        let (pending_tx, pending_rx) = mpsc::channel(2 * batch_size);

        info!(
            source = self.name,
            batch_size,
            workers = self.options.workers,
            "Started streaming source"
        );

        let workers: Vec<_> = (0..self.options.workers)
            .map(|worker| {
                tokio::spawn(self.clone().pull_loop(
                    worker,
                    messages_tx.clone(),
                    pending_tx.clone(),
                    cln_token.clone(),
                ))
            })
            .collect();
        // only the workers hold senders now, the channels close once they all exit
        drop((messages_tx, pending_tx));

        let ack_task = tokio::spawn(self.clone().ack_loop(pending_rx));

        let handle = tokio::spawn(async move {
            let mut result = Ok(());
            for worker in workers {
                if let Err(e) = worker.await.map_err(Error::from).and_then(|r| r) {
                    error!(?e, "Source worker failed");
                    cln_token.cancel();
                    result = result.and(Err(e));
                }
            }
            ack_task.await?;
            info!("Streaming source stopped");
            result
        });

        Ok((ReceiverStream::new(messages_rx), handle))
    }

    async fn pull_loop(
        self,
        worker: usize,
        messages_tx: mpsc::Sender<Message>,
        pending_tx: mpsc::Sender<(Offset, oneshot::Receiver<ReadAck>)>,
        cln_token: CancellationToken,
    ) -> Result<()> {
        let batch_size = self.options.read_batch_size;
        let permits = u32::try_from(batch_size).unwrap_or(u32::MAX);

        loop {
            // Reserve the output slots before invoking the read method.
            let mut slots = tokio::select! {
                _ = cln_token.cancelled() => break,
                slots = messages_tx.reserve_many(batch_size) => match slots {
                    Ok(slots) => slots,
                    // the consumer is gone, nothing left to feed
                    Err(_) => break,
                },
            };

            let inflight = tokio::select! {
                _ = cln_token.cancelled() => break,
                permit = Arc::clone(&self.inflight).acquire_many_owned(permits) => {
                    permit.map_err(|e| Error::SourceFatal(format!("in-flight budget closed: {e}")))?
                }
            };

            let read_start = time::Instant::now();
            // an in-flight read is never abandoned, its messages are already held for us
            let messages = match self.read_with_retry(worker, &cln_token).await {
                Ok(messages) => messages,
                Err(e) if e.is_retryable() && cln_token.is_cancelled() => break,
                Err(e) => return Err(e),
            };
            let n = messages.len();
            debug!(worker, n, elapsed = ?read_start.elapsed(), "Read batch");

            // each message returns its own permit once resolved; hand back the unused ones
            inflight.forget();
            self.inflight.add_permits(batch_size - n.min(batch_size));

            let metrics = &pipeline_metrics().source;
            metrics.read_total.inc_by(n as u64);
            metrics
                .read_bytes_total
                .inc_by(messages.iter().map(|m| m.payload.len() as u64).sum());

            for mut message in messages {
                let (ack_tx, ack_rx) = oneshot::channel();
                message.ack_handle = Some(Arc::new(
                    AckHandle::new(ack_tx).with_inflight(Arc::clone(&self.inflight)),
                ));

                if pending_tx
                    .send((message.offset.clone(), ack_rx))
                    .await
                    .is_err()
                {
                    return Err(Error::SourceFatal("ack task terminated".to_string()));
                }

                match slots.next() {
                    Some(slot) => slot.send(message),
                    None => {
                        // more messages than requested; the handle naks on drop
                        warn!(worker, offset = %message.offset, "Source returned more than the batch size");
                    }
                }
            }

            if cln_token.is_cancelled() {
                break;
            }
        }

        info!(worker, "Source worker stopped");
        Ok(())
    }

    async fn read_with_retry(
        &self,
        worker: usize,
        cln_token: &CancellationToken,
    ) -> Result<Vec<Message>> {
        let backoff = Exponential::new(
            READ_RETRY_INITIAL_INTERVAL,
            READ_RETRY_MAX_INTERVAL,
            READ_RETRY_FACTOR,
        )
        .with_jitter(READ_RETRY_JITTER);

        Retry::new(
            backoff,
            || self.read(),
            |e: &Error, attempt: u16| {
                if !e.is_retryable() || cln_token.is_cancelled() {
                    return false;
                }
                warn!(worker, attempt, error = ?e, "Retrying source read");
                pipeline_metrics().source.read_retries.inc();
                true
            },
        )
        .await
    }

    /// Listens to the oneshot receivers and acks or nacks the offsets in batches.
    async fn ack_loop(self, mut pending_rx: mpsc::Receiver<(Offset, oneshot::Receiver<ReadAck>)>) {
        let batch_size = self.options.read_batch_size;
        let mut outstanding = FuturesUnordered::new();
        let mut to_ack = Vec::with_capacity(batch_size);
        let mut to_nack = Vec::new();
        let mut flush_interval = time::interval(ACK_FLUSH_INTERVAL);
        let mut input_done = false;

        loop {
            tokio::select! {
                pending = pending_rx.recv(), if !input_done => match pending {
                    Some((offset, ack_rx)) => {
                        outstanding.push(async move { (offset, ack_rx.await) });
                    }
                    None => input_done = true,
                },
                Some((offset, verdict)) = outstanding.next() => match verdict {
                    Ok(ReadAck::Ack) => to_ack.push(offset),
                    Ok(ReadAck::Nak) => to_nack.push(offset),
                    Err(e) => {
                        error!(%offset, ?e, "Ack handle dropped without a verdict");
                        to_nack.push(offset);
                    }
                },
                _ = flush_interval.tick() => {
                    self.flush_acks(&mut to_ack, &mut to_nack).await;
                }
            }

            if to_ack.len() >= batch_size || to_nack.len() >= batch_size {
                self.flush_acks(&mut to_ack, &mut to_nack).await;
            }
            if input_done && outstanding.is_empty() {
                break;
            }
        }

        self.flush_acks(&mut to_ack, &mut to_nack).await;
        info!("Ack task stopped");
    }

    async fn flush_acks(&self, to_ack: &mut Vec<Offset>, to_nack: &mut Vec<Offset>) {
        let metrics = &pipeline_metrics().source;
        if !to_ack.is_empty() {
            let offsets = std::mem::take(to_ack);
            let n = offsets.len() as u64;
            match self.resolve(offsets, ReadAck::Ack).await {
                Ok(()) => {
                    metrics.ack_total.inc_by(n);
                }
                // the queue redelivers, and the duplicate is absorbed downstream
                Err(e) => error!(?e, n, "Failed to ack messages"),
            }
        }
        if !to_nack.is_empty() {
            let offsets = std::mem::take(to_nack);
            let n = offsets.len() as u64;
            match self.resolve(offsets, ReadAck::Nak).await {
                Ok(()) => {
                    metrics.nack_total.inc_by(n);
                }
                Err(e) => error!(?e, n, "Failed to nack messages"),
            }
        }
    }

    /// Acks or nacks the offsets, each attempt bounded by the ack timeout.
    async fn resolve(&self, offsets: Vec<Offset>, verdict: ReadAck) -> Result<()> {
        let interval = fixed::Interval::new(ACK_RETRY_INTERVAL).take(ACK_RETRY_ATTEMPTS);
        let ack_timeout = self.options.ack_timeout;

        Retry::new(
            interval,
            || {
                let offsets = offsets.clone();
                async move {
                    let call = async {
                        match verdict {
                            ReadAck::Ack => self.ack(offsets).await,
                            ReadAck::Nak => self.nack(offsets).await,
                        }
                    };
                    time::timeout(ack_timeout, call).await.map_err(|_| {
                        Error::Timeout(format!("{verdict:?} exceeded {ack_timeout:?}"))
                    })?
                }
            },
            |e: &Error, attempt: u16| {
                if !e.is_retryable() {
                    return false;
                }
                warn!(?verdict, attempt, error = ?e, "Retrying ack");
                true
            },
        )
        .await
    }
}
