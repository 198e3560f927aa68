//! Message is what a source worker reads from the queue and what the accumulator buffers until
//! its window is durably written. The moment a message is read, an [AckHandle] is attached to it
//! and its oneshot receiver is handed to the source's ack task. The handle is reference counted;
//! once every copy of the [Message] is dropped the handle resolves, sending an ack if it was
//! committed after a durable write, or a nak otherwise. A message can never be acknowledged
//! merely by being dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{Semaphore, oneshot};

/// The message that flows from the source to the sink.
/// NOTE: It is cheap to clone.
#[derive(Debug, Clone)]
pub(crate) struct Message {
    /// Source-assigned id, stable across redeliveries of the same message.
    pub(crate) id: MessageID,
    pub(crate) payload: Bytes,
    /// Queue-assigned publish time, used as event time when no event-time header is present.
    pub(crate) publish_time: Option<DateTime<Utc>>,
    pub(crate) headers: Arc<HashMap<String, String>>,
    /// Starts at 1; greater than 1 means the queue redelivered it.
    pub(crate) delivery_attempt: u64,
    pub(crate) received_at: DateTime<Utc>,
    /// Handle used to ack or nack the message at the source.
    pub(crate) offset: Offset,
    pub(crate) ack_handle: Option<Arc<AckHandle>>,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            id: MessageID::default(),
            payload: Bytes::new(),
            publish_time: None,
            headers: Arc::new(HashMap::new()),
            delivery_attempt: 1,
            received_at: Utc::now(),
            offset: Offset::default(),
            ack_handle: None,
        }
    }
}

impl Message {
    /// Marks the message as safe to acknowledge. Takes effect when the last copy is dropped.
    pub(crate) fn commit(&self) {
        if let Some(handle) = self.ack_handle.as_ref() {
            handle.commit();
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct MessageID(Arc<str>);

impl MessageID {
    pub(crate) fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageID {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for MessageID {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

/// Offset of the message which will be used to acknowledge the message.
#[derive(Debug, Clone, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub(crate) enum Offset {
    Int(u64),
    String(Bytes),
}

impl Default for Offset {
    fn default() -> Self {
        Offset::Int(0)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Offset::Int(offset) => write!(f, "{offset}"),
            Offset::String(offset) => write!(f, "{}", String::from_utf8_lossy(offset)),
        }
    }
}

/// Final verdict for a message, delivered to the source's ack task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadAck {
    /// Durably persisted (or a duplicate of something durably persisted).
    Ack,
    /// Release for redelivery.
    Nak,
}

/// Sends the ack/nak to the source exactly once, when the last reference is dropped. It also
/// returns the message's slot in the in-flight budget.
#[derive(Debug)]
pub(crate) struct AckHandle {
    ack_tx: Option<oneshot::Sender<ReadAck>>,
    committed: AtomicBool,
    inflight: Option<Arc<Semaphore>>,
}

impl AckHandle {
    pub(crate) fn new(ack_tx: oneshot::Sender<ReadAck>) -> Self {
        Self {
            ack_tx: Some(ack_tx),
            committed: AtomicBool::new(false),
            inflight: None,
        }
    }

    /// Returns one permit to `inflight` when the handle resolves.
    pub(crate) fn with_inflight(mut self, inflight: Arc<Semaphore>) -> Self {
        self.inflight = Some(inflight);
        self
    }

    pub(crate) fn commit(&self) {
        self.committed.store(true, Ordering::Release);
    }

    pub(crate) fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }
}

impl Drop for AckHandle {
    fn drop(&mut self) {
        if let Some(ack_tx) = self.ack_tx.take() {
            let verdict = if self.is_committed() {
                ReadAck::Ack
            } else {
                ReadAck::Nak
            };
            // the ack task may already be gone during shutdown; the queue redelivers then
            let _ = ack_tx.send(verdict);
        }
        if let Some(inflight) = self.inflight.take() {
            inflight.add_permits(1);
        }
    }
}
