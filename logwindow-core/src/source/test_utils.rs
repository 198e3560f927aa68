use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::{Error, Result};
use crate::message::{Message, MessageID, Offset};
use crate::source::{SourceAcker, SourceReader};

/// How long an empty read waits, standing in for the queue's read timeout.
const EMPTY_READ_WAIT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
struct Record {
    id: MessageID,
    payload: Bytes,
    publish_time: Option<DateTime<Utc>>,
    headers: Arc<HashMap<String, String>>,
    delivery_attempt: u64,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Record>,
    unacked: HashMap<u64, Record>,
    next_offset: u64,
    acked: Vec<String>,
    nacked: Vec<String>,
    fail_reads: usize,
    failed_reads: usize,
    fatal_reads: bool,
    fail_acks: usize,
    failed_acks: usize,
}

/// In-memory queue with at-least-once semantics: a nacked message goes back to the front of the
/// queue with its delivery attempt bumped. Reader and acker are clones sharing one queue.
#[derive(Clone)]
pub(crate) struct SimpleSource {
    batch_size: usize,
    state: Arc<Mutex<State>>,
}

impl SimpleSource {
    pub(crate) fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub(crate) fn push(
        &self,
        id: impl Into<MessageID>,
        payload: Bytes,
        publish_time: Option<DateTime<Utc>>,
    ) {
        self.push_with_headers(id, payload, publish_time, HashMap::new());
    }

    pub(crate) fn push_with_headers(
        &self,
        id: impl Into<MessageID>,
        payload: Bytes,
        publish_time: Option<DateTime<Utc>>,
        headers: HashMap<String, String>,
    ) {
        self.state.lock().queue.push_back(Record {
            id: id.into(),
            payload,
            publish_time,
            headers: Arc::new(headers),
            delivery_attempt: 1,
        });
    }

    /// Ids of acked messages, in ack order.
    pub(crate) fn acked_ids(&self) -> Vec<String> {
        self.state.lock().acked.clone()
    }

    /// Ids of nacked messages, in nack order.
    pub(crate) fn nacked_ids(&self) -> Vec<String> {
        self.state.lock().nacked.clone()
    }

    /// The next `n` reads fail with a retryable error.
    pub(crate) fn fail_next_reads(&self, n: usize) {
        self.state.lock().fail_reads = n;
    }

    /// Every read fails with an error no retry can fix.
    pub(crate) fn fail_reads_fatally(&self) {
        self.state.lock().fatal_reads = true;
    }

    pub(crate) fn failed_reads(&self) -> usize {
        self.state.lock().failed_reads
    }

    /// The next `n` acks fail with a retryable error.
    pub(crate) fn fail_next_acks(&self, n: usize) {
        self.state.lock().fail_acks = n;
    }

    pub(crate) fn failed_acks(&self) -> usize {
        self.state.lock().failed_acks
    }

    /// Nothing queued and nothing waiting for an ack.
    pub(crate) fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.queue.is_empty() && state.unacked.is_empty()
    }
}

impl SourceReader for SimpleSource {
    fn name(&self) -> &'static str {
        "simple"
    }

    async fn read(&mut self) -> Result<Vec<Message>> {
        let messages: Vec<Message> = {
            let mut state = self.state.lock();
            if state.fatal_reads {
                state.failed_reads += 1;
                return Err(Error::SourceFatal("client closed".to_string()));
            }
            if state.fail_reads > 0 {
                state.fail_reads -= 1;
                state.failed_reads += 1;
                return Err(Error::Source("missed idle heartbeat".to_string()));
            }
            let n = self.batch_size.min(state.queue.len());
            let records: Vec<Record> = state.queue.drain(..n).collect();
            records
                .into_iter()
                .map(|record| {
                    let offset = state.next_offset;
                    state.next_offset += 1;
                    let message = Message {
                        id: record.id.clone(),
                        payload: record.payload.clone(),
                        publish_time: record.publish_time,
                        headers: Arc::clone(&record.headers),
                        delivery_attempt: record.delivery_attempt,
                        received_at: Utc::now(),
                        offset: Offset::Int(offset),
                        ack_handle: None,
                    };
                    state.unacked.insert(offset, record);
                    message
                })
                .collect()
        };

        if messages.is_empty() {
            tokio::time::sleep(EMPTY_READ_WAIT).await;
        }
        Ok(messages)
    }
}

impl SourceAcker for SimpleSource {
    async fn ack(&mut self, offsets: Vec<Offset>) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_acks > 0 {
            state.fail_acks -= 1;
            state.failed_acks += 1;
            return Err(Error::Source("ack request timed out".to_string()));
        }
        for offset in offsets {
            if let Offset::Int(offset) = offset
                && let Some(record) = state.unacked.remove(&offset)
            {
                state.acked.push(record.id.to_string());
            }
        }
        Ok(())
    }

    async fn nack(&mut self, offsets: Vec<Offset>) -> Result<()> {
        let mut offsets: Vec<u64> = offsets
            .into_iter()
            .filter_map(|offset| match offset {
                Offset::Int(offset) => Some(offset),
                Offset::String(_) => None,
            })
            .collect();
        // redeliver in the original read order
        offsets.sort_unstable();

        let mut state = self.state.lock();
        for offset in offsets.into_iter().rev() {
            if let Some(mut record) = state.unacked.remove(&offset) {
                state.nacked.push(record.id.to_string());
                record.delivery_attempt += 1;
                state.queue.push_front(record);
            }
        }
        Ok(())
    }
}
