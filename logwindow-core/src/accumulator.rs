//! The accumulator is the single owner of every window book. Messages are routed to their window
//! by key; ticks move windows through OPEN, CLOSING and CLOSED; closed batches are compressed and
//! written by flush tasks which commit the acks of their messages once the write is durable.
//!
//! ```text
//!            should_close          grace deadline         last batch persisted
//!   OPEN  ---------------> CLOSING ---------------> CLOSED ---------------------> FLUSHED
//!     |                                                                       (ledger entry,
//!     +--- cap reached: current batch sealed as a continuation                 book removed)
//! ```
//!
//! Arrivals for a CLOSED or FLUSHED window go to its late book, which is written under the
//! `.late` path and may be flushed several times as continuations.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{Semaphore, mpsc};
use tokio::task;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::compression::{self, Codec};
use crate::config::Settings;
use crate::config::components::BatchLimits;
use crate::message::{Message, MessageID};
use crate::metrics::{OUTCOME_LABEL, REASON_LABEL, label, pipeline_metrics};
use crate::sinker::{BlobStore, OutputArtifact, SinkWriter, WriteReceipt};
use crate::watermark::{CloseReason, WatermarkController};
use crate::window::WindowKey;
use crate::window::assigner::WindowAssigner;
use crate::{Error, Result};

/// The ordered payloads of one sealed batch. Immutable once created.
#[derive(Debug, Clone)]
pub(crate) struct Batch {
    pub(crate) key: WindowKey,
    pub(crate) seq: u32,
    pub(crate) reason: CloseReason,
    payloads: Arc<[Bytes]>,
}

impl Batch {
    pub(crate) fn compress(&self, codec: Codec) -> Result<OutputArtifact> {
        let bytes = compression::compress(self.payloads.iter(), codec)?;
        Ok(OutputArtifact {
            key: self.key,
            seq: self.seq,
            codec,
            message_count: self.payloads.len(),
            bytes,
        })
    }
}

/// A sealed batch together with the messages whose acks depend on it.
struct FlushJob {
    batch: Batch,
    messages: Vec<Message>,
}

struct FlushOutcome {
    key: WindowKey,
    seq: u32,
    result: Result<WriteReceipt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BookState {
    Open,
    Closing {
        deadline: DateTime<Utc>,
        reason: CloseReason,
    },
    /// Frozen; waiting for its batches to be persisted.
    Closed,
}

/// Live state of one window key.
struct WindowBook {
    state: BookState,
    /// Sequence of the batch currently collecting.
    seq: u32,
    batch: Vec<Message>,
    batch_bytes: usize,
    first_seen: DateTime<Utc>,
    last_arrival: DateTime<Utc>,
    /// Accepted ids and the batch carrying them.
    seen: HashMap<MessageID, u32>,
    /// Duplicates, keyed by the batch carrying their original.
    held: HashMap<u32, Vec<Message>>,
    in_flight: HashSet<u32>,
    persisted: HashSet<u32>,
}

impl WindowBook {
    fn new(seq: u32, now: DateTime<Utc>) -> Self {
        Self {
            state: BookState::Open,
            seq,
            batch: Vec::new(),
            batch_bytes: 0,
            first_seen: now,
            last_arrival: now,
            seen: HashMap::new(),
            held: HashMap::new(),
            in_flight: HashSet::new(),
            persisted: HashSet::new(),
        }
    }

    fn has_room(&self, payload_len: usize, limits: &BatchLimits) -> bool {
        self.batch.is_empty()
            || (self.batch.len() < limits.max_messages
                && self.batch_bytes.saturating_add(payload_len) <= limits.max_bytes)
    }

    fn append(&mut self, message: Message, now: DateTime<Utc>) {
        self.batch_bytes += message.payload.len();
        self.last_arrival = now;
        self.seen.insert(message.id.clone(), self.seq);
        self.batch.push(message);
    }

    /// Seals the collecting batch, if any, and starts the next sequence.
    fn take_batch(
        &mut self,
        key: WindowKey,
        reason: CloseReason,
        now: DateTime<Utc>,
    ) -> Option<FlushJob> {
        if self.batch.is_empty() {
            return None;
        }
        let messages = std::mem::take(&mut self.batch);
        let batch = Batch {
            key,
            seq: self.seq,
            reason,
            payloads: messages.iter().map(|m| m.payload.clone()).collect(),
        };
        self.in_flight.insert(self.seq);
        self.seq = self.seq.saturating_add(1);
        self.batch_bytes = 0;
        self.first_seen = now;
        Some(FlushJob { batch, messages })
    }

    fn is_settled(&self) -> bool {
        self.state == BookState::Closed && self.in_flight.is_empty() && self.batch.is_empty()
    }
}

struct LedgerEntry {
    next_seq: u32,
    ids: HashSet<MessageID>,
    flushed_at: DateTime<Utc>,
}

/// Recently flushed windows. Used to recognize redeliveries of persisted messages and to route
/// new arrivals to the late book, continuing its sequence.
#[derive(Default)]
struct FlushLedger {
    entries: HashMap<WindowKey, LedgerEntry>,
}

impl FlushLedger {
    fn contains(&self, key: &WindowKey) -> bool {
        self.entries.contains_key(key)
    }

    fn next_seq(&self, key: &WindowKey) -> u32 {
        self.entries.get(key).map_or(0, |entry| entry.next_seq)
    }

    fn persisted(&self, key: &WindowKey, id: &MessageID) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.ids.contains(id))
    }

    fn record(
        &mut self,
        key: WindowKey,
        next_seq: u32,
        ids: impl IntoIterator<Item = MessageID>,
        now: DateTime<Utc>,
    ) {
        let entry = self.entries.entry(key).or_insert_with(|| LedgerEntry {
            next_seq,
            ids: HashSet::new(),
            flushed_at: now,
        });
        entry.next_seq = entry.next_seq.max(next_seq);
        entry.ids.extend(ids);
        entry.flushed_at = now;
    }

    fn prune(&mut self, now: DateTime<Utc>, retention: chrono::Duration) {
        self.entries
            .retain(|_, entry| now - entry.flushed_at < retention);
    }
}

/// The keyed window store and everything needed to mutate it.
struct WindowStore<S> {
    assigner: WindowAssigner,
    watermark: WatermarkController,
    limits: BatchLimits,
    flushed_retention: chrono::Duration,
    writer: Arc<SinkWriter<S>>,
    write_permits: Arc<Semaphore>,
    books: BTreeMap<WindowKey, WindowBook>,
    ledger: FlushLedger,
    outcome_tx: mpsc::Sender<FlushOutcome>,
}

/// Batch accumulator actor.
pub(crate) struct Accumulator<S> {
    store: WindowStore<S>,
    outcome_rx: mpsc::Receiver<FlushOutcome>,
    tick_interval: Duration,
    shutdown_timeout: Duration,
}

impl<S> Accumulator<S>
where
    S: BlobStore + Send + Sync + 'static,
{
    pub(crate) fn new(settings: &Settings, writer: SinkWriter<S>) -> Self {
        let write_concurrency = settings.sink.write_concurrency;
        let (outcome_tx, outcome_rx) = mpsc::channel(write_concurrency * 2);
        let store = WindowStore {
            assigner: WindowAssigner::new(
                settings.window.length,
                settings.source.event_time_header.clone(),
                settings.source.max_message_bytes,
            ),
            watermark: WatermarkController::new(&settings.trigger),
            limits: settings.limits,
            flushed_retention: chrono::Duration::from_std(settings.trigger.flushed_retention)
                .unwrap_or(chrono::Duration::MAX),
            writer: Arc::new(writer),
            write_permits: Arc::new(Semaphore::new(write_concurrency)),
            books: BTreeMap::new(),
            ledger: FlushLedger::default(),
            outcome_tx,
        };
        Self {
            store,
            outcome_rx,
            tick_interval: settings.trigger.tick_interval,
            shutdown_timeout: settings.shutdown_timeout,
        }
    }

    /// Consumes the input until it ends, then force-closes and flushes every live window. Returns
    /// early only on a fatal sink error.
    pub(crate) async fn run(self, mut input: ReceiverStream<Message>) -> Result<()> {
        let Accumulator {
            mut store,
            mut outcome_rx,
            tick_interval,
            shutdown_timeout,
        } = self;

        let mut ticker = time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                Some(outcome) = outcome_rx.recv() => store.handle_outcome(outcome, Utc::now())?,
                _ = ticker.tick() => store.on_tick(Utc::now()).await?,
                message = input.next() => match message {
                    Some(message) => store.on_message(message, Utc::now()).await?,
                    None => break,
                },
            }
        }

        info!(live_windows = store.books.len(), "Input closed, draining windows");
        let drain = async {
            store.close_all(Utc::now()).await?;
            while !store.books.is_empty() {
                let Some(outcome) = outcome_rx.recv().await else {
                    break;
                };
                store.handle_outcome(outcome, Utc::now())?;
            }
            Ok::<_, Error>(())
        };
        match time::timeout(shutdown_timeout, drain).await {
            Ok(result) => {
                if result.is_ok() {
                    info!("All windows drained");
                }
                result
            }
            Err(_) => {
                // the remaining messages are nacked as the books drop
                warn!(
                    timeout = ?shutdown_timeout,
                    "Shutdown timeout reached before every window was persisted"
                );
                Ok(())
            }
        }
    }
}

impl<S> WindowStore<S>
where
    S: BlobStore + Send + Sync + 'static,
{
    async fn on_message(&mut self, message: Message, now: DateTime<Utc>) -> Result<()> {
        let assignment = self.assigner.assign(&message, now);
        match assignment.fallback {
            Some(reason) => {
                pipeline_metrics()
                    .window
                    .malformed_total
                    .get_or_create(&label(REASON_LABEL, reason.as_str()))
                    .inc();
            }
            None => self.watermark.observe(assignment.event_time),
        }

        let on_time = WindowKey::on_time(assignment.window);
        let Some(message) = self.absorb_duplicate(on_time, message) else {
            return Ok(());
        };

        let key = self.route(on_time);
        if key.late {
            pipeline_metrics().window.late_total.inc();
            debug!(window = %on_time, id = %message.id, "Routing message to late window");
        }
        self.append(key, message, now).await
    }

    /// Handles a message whose id was already accepted by the window or its late variant.
    /// Returns the message back when it is not a duplicate.
    fn absorb_duplicate(&mut self, key: WindowKey, message: Message) -> Option<Message> {
        for candidate in [key, key.late()] {
            if self.ledger.persisted(&candidate, &message.id) {
                debug!(window = %candidate, id = %message.id, attempt = message.delivery_attempt, "Duplicate of a persisted message");
                pipeline_metrics().window.duplicate_total.inc();
                message.commit();
                return None;
            }

            if let Some(book) = self.books.get_mut(&candidate)
                && let Some(&seq) = book.seen.get(&message.id)
            {
                debug!(window = %candidate, seq, id = %message.id, attempt = message.delivery_attempt, "Duplicate of a buffered message");
                pipeline_metrics().window.duplicate_total.inc();
                if book.persisted.contains(&seq) {
                    message.commit();
                } else {
                    book.held.entry(seq).or_default().push(message);
                }
                return None;
            }
        }
        Some(message)
    }

    fn route(&self, key: WindowKey) -> WindowKey {
        match self.books.get(&key).map(|book| book.state) {
            Some(BookState::Open | BookState::Closing { .. }) => key,
            Some(BookState::Closed) => key.late(),
            None if self.ledger.contains(&key) => key.late(),
            None => key,
        }
    }

    async fn append(&mut self, key: WindowKey, message: Message, now: DateTime<Utc>) -> Result<()> {
        let next_seq = self.ledger.next_seq(&key);
        let book = self.books.entry(key).or_insert_with(|| {
            debug!(window = %key, seq = next_seq, "Opened window");
            WindowBook::new(next_seq, now)
        });

        if book.state == BookState::Closed {
            // a frozen late book starts its next continuation
            debug!(window = %key, seq = book.seq, "Reopened late window");
            book.state = BookState::Open;
            book.first_seen = now;
        }

        let sealed = if book.has_room(message.payload.len(), &self.limits) {
            None
        } else {
            debug!(window = %key, seq = book.seq, "Batch cap reached, sealing continuation");
            book.take_batch(key, CloseReason::Overflow, now)
        };

        book.append(message, now);
        if let BookState::Closing { reason, .. } = book.state {
            book.state = BookState::Closing {
                deadline: self
                    .watermark
                    .grace_deadline(book.last_arrival, book.first_seen),
                reason,
            };
        }

        if let Some(job) = sealed {
            self.dispatch(job).await?;
        }
        Ok(())
    }

    async fn on_tick(&mut self, now: DateTime<Utc>) -> Result<()> {
        let mut ready = Vec::new();
        for (key, book) in self.books.iter_mut() {
            if book.state == BookState::Open
                && let Some(reason) =
                    self.watermark
                        .should_close(key.window.end_time, book.first_seen, now)
            {
                let deadline = self
                    .watermark
                    .grace_deadline(book.last_arrival, book.first_seen);
                debug!(window = %key, %reason, %deadline, "Window closing");
                book.state = BookState::Closing { deadline, reason };
            }

            if let BookState::Closing { deadline, reason } = book.state
                && now >= deadline
            {
                info!(window = %key, %reason, messages = book.batch.len(), "Window closed");
                book.state = BookState::Closed;
                ready.extend(book.take_batch(*key, reason, now));
            }
        }

        for job in ready {
            self.dispatch(job).await?;
        }
        self.finalize_settled(now);
        self.ledger.prune(now, self.flushed_retention);
        Ok(())
    }

    /// Closes every live window without grace and dispatches what they hold.
    async fn close_all(&mut self, now: DateTime<Utc>) -> Result<()> {
        let mut ready = Vec::new();
        for (key, book) in self.books.iter_mut() {
            if book.state != BookState::Closed {
                info!(window = %key, reason = %CloseReason::Shutdown, messages = book.batch.len(), "Window closed");
                book.state = BookState::Closed;
            }
            ready.extend(book.take_batch(*key, CloseReason::Shutdown, now));
        }
        for job in ready {
            self.dispatch(job).await?;
        }
        self.finalize_settled(now);
        Ok(())
    }

    /// Hands the batch to a flush task. Waits for a write permit, so a saturated sink stops the
    /// accumulator from consuming input.
    async fn dispatch(&mut self, job: FlushJob) -> Result<()> {
        let permit = Arc::clone(&self.write_permits)
            .acquire_owned()
            .await
            .map_err(|e| Error::Accumulator(format!("write permits closed: {e}")))?;

        let writer = Arc::clone(&self.writer);
        let outcome_tx = self.outcome_tx.clone();
        let FlushJob { batch, messages } = job;
        debug!(window = %batch.key, seq = batch.seq, reason = %batch.reason, messages = messages.len(), "Dispatching batch");

        tokio::spawn(async move {
            let (key, seq) = (batch.key, batch.seq);
            let start = Instant::now();
            let result = flush(&writer, batch).await;
            if result.is_ok() {
                for message in &messages {
                    message.commit();
                }
                pipeline_metrics()
                    .sink
                    .write_time
                    .observe(start.elapsed().as_micros() as f64);
            }
            // acks (or nacks) are released here, after the write completed
            drop(messages);
            drop(permit);
            let _ = outcome_tx.send(FlushOutcome { key, seq, result }).await;
        });
        Ok(())
    }

    fn handle_outcome(&mut self, outcome: FlushOutcome, now: DateTime<Utc>) -> Result<()> {
        let FlushOutcome { key, seq, result } = outcome;
        let Some(book) = self.books.get_mut(&key) else {
            warn!(window = %key, seq, "Flush outcome for an unknown window");
            return Ok(());
        };
        book.in_flight.remove(&seq);

        match result {
            Ok(receipt) => {
                book.persisted.insert(seq);
                if let Some(held) = book.held.remove(&seq) {
                    for duplicate in &held {
                        duplicate.commit();
                    }
                }
                let metrics = pipeline_metrics();
                metrics
                    .window
                    .flush_total
                    .get_or_create(&label(OUTCOME_LABEL, "success"))
                    .inc();
                metrics
                    .sink
                    .artifact_bytes_total
                    .inc_by(receipt.byte_size as u64);
            }
            Err(e) => {
                pipeline_metrics()
                    .window
                    .flush_total
                    .get_or_create(&label(OUTCOME_LABEL, "failure"))
                    .inc();
                error!(window = %key, seq, ?e, "Failed to persist batch, its messages will be redelivered");
                // held duplicates are nacked on drop, the ids may be accepted again
                book.held.remove(&seq);
                book.seen.retain(|_, s| *s != seq);
                if matches!(e, Error::SinkFatal(_)) {
                    return Err(e);
                }
            }
        }

        if book.is_settled() {
            self.finalize(key, now);
        }
        Ok(())
    }

    fn finalize_settled(&mut self, now: DateTime<Utc>) {
        let settled: Vec<_> = self
            .books
            .iter()
            .filter(|(_, book)| book.is_settled())
            .map(|(key, _)| *key)
            .collect();
        for key in settled {
            self.finalize(key, now);
        }
    }

    /// Removes a settled book. A window with at least one persisted batch is remembered in the
    /// ledger; one with none is forgotten so its redelivered messages reuse the same paths.
    fn finalize(&mut self, key: WindowKey, now: DateTime<Utc>) {
        let Some(book) = self.books.remove(&key) else {
            return;
        };
        if book.persisted.is_empty() {
            warn!(window = %key, "No batch of the window was persisted, forgetting it");
            return;
        }
        info!(window = %key, batches = book.persisted.len(), next_seq = book.seq, "Window flushed");
        self.ledger
            .record(key, book.seq, book.seen.into_keys(), now);
    }
}

async fn flush<S>(writer: &SinkWriter<S>, batch: Batch) -> Result<WriteReceipt>
where
    S: BlobStore + Send + Sync + 'static,
{
    let codec = writer.codec();
    let artifact = task::spawn_blocking(move || batch.compress(codec)).await??;
    writer.write(&artifact).await
}
