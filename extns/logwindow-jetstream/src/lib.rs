//! JetStream pull-consumer client for the log window pipeline.
//!
//! A single actor task owns the consumer's message stream. Every message handed out by
//! [`JetstreamSource::read_messages`] stays in-progress on the server (a background task keeps
//! sending `AckKind::Progress` at half the consumer's `ack_wait`) until the caller resolves it
//! with [`JetstreamSource::ack_messages`] or [`JetstreamSource::nack_messages`]. Held messages
//! are therefore not redelivered while their window is still open.

use std::collections::HashMap;
use std::time::Duration;

use async_nats::ConnectOptions;
use async_nats::jetstream::consumer::PullConsumer;
use async_nats::jetstream::consumer::pull::Stream;
use async_nats::jetstream::{AckKind, Message as JetstreamMessage};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_stream::StreamExt;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("Connecting to NATS {server} - {error}")]
    Connection { server: String, error: String },

    #[error("Jetstream - {0}")]
    Jetstream(String),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum NatsAuth {
    Basic { username: String, password: String },
    NKey(String),
    Token(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct JetstreamSourceConfig {
    pub addr: String,
    pub stream: String,
    pub consumer: String,
    pub auth: Option<NatsAuth>,
}

/// A message pulled from the stream. `stream_sequence` is the handle used to ack or nack it.
#[derive(Debug, Clone)]
pub struct Message {
    pub value: Bytes,
    pub stream_sequence: u64,
    /// Time the server stored the message.
    pub published: DateTime<Utc>,
    /// How many times the server has delivered this message, starting at 1.
    pub delivered: u64,
    pub headers: HashMap<String, String>,
}

impl TryFrom<&JetstreamMessage> for Message {
    type Error = Error;

    fn try_from(msg: &JetstreamMessage) -> Result<Self> {
        let headers = match msg.message.headers.as_ref() {
            // only the first value of a repeated header is kept
            Some(headers) => headers
                .iter()
                .filter_map(|(k, v)| v.first().map(|v| (k.to_string(), v.as_str().to_string())))
                .collect(),
            None => HashMap::new(),
        };

        let info = msg.info().map_err(|e| {
            Error::Jetstream(format!("fetching message metadata from Jetstream: {e:?}"))
        })?;

        let published_nanos = i64::try_from(info.published.unix_timestamp_nanos())
            .map_err(|_| Error::Jetstream("publish timestamp out of range".to_string()))?;

        Ok(Message {
            value: msg.message.payload.clone(),
            stream_sequence: info.stream_sequence,
            published: DateTime::from_timestamp_nanos(published_nanos),
            delivered: u64::try_from(info.delivered).unwrap_or(1),
            headers,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Resolution {
    Ack,
    Nak,
}

enum ActorMessage {
    Read {
        respond_to: oneshot::Sender<Result<Vec<Message>>>,
    },
    Resolve {
        offsets: Vec<u64>,
        resolution: Resolution,
        respond_to: oneshot::Sender<Result<()>>,
    },
}

struct JetstreamActor {
    consumer: PullConsumer,
    messages: Stream,
    batch_size: usize,
    read_timeout: Duration,
    in_progress: HashMap<u64, MessageProcessingTracker>,
    handler_rx: mpsc::Receiver<ActorMessage>,
}

impl JetstreamActor {
    async fn start(
        config: JetstreamSourceConfig,
        batch_size: usize,
        read_timeout: Duration,
        handler_rx: mpsc::Receiver<ActorMessage>,
    ) -> Result<()> {
        let mut conn_opts = ConnectOptions::new()
            .max_reconnects(None)
            .reconnect_delay_callback(|attempts| {
                Duration::from_millis(std::cmp::min((attempts * 10) as u64, 1000))
            })
            .ping_interval(Duration::from_secs(3))
            .retry_on_initial_connect();
        if let Some(auth) = config.auth {
            conn_opts = match auth {
                NatsAuth::Basic { username, password } => {
                    conn_opts.user_and_password(username, password)
                }
                NatsAuth::NKey(nkey) => conn_opts.nkey(nkey),
                NatsAuth::Token(token) => conn_opts.token(token),
            };
        }

        let client = async_nats::connect_with_options(&config.addr, conn_opts)
            .await
            .map_err(|err| Error::Connection {
                server: config.addr.to_string(),
                error: err.to_string(),
            })?;

        let js_ctx = async_nats::jetstream::new(client);
        let consumer: PullConsumer = js_ctx
            .get_consumer_from_stream(&config.consumer, &config.stream)
            .await
            .map_err(|err| {
                Error::Jetstream(format!(
                    "Getting consumer {} from stream {}: {err:?}",
                    config.consumer, config.stream
                ))
            })?;
        let messages = consumer.messages().await.map_err(|err| {
            Error::Jetstream(format!(
                "Creating message stream for consumer {}: {err:?}",
                config.consumer
            ))
        })?;

        tokio::spawn(async move {
            let mut actor = JetstreamActor {
                consumer,
                messages,
                batch_size,
                read_timeout,
                in_progress: HashMap::new(),
                handler_rx,
            };
            tracing::info!(stream = ?config.stream, consumer = ?config.consumer, "Starting Jetstream source actor");
            actor.run().await;
        });

        Ok(())
    }

    async fn run(&mut self) {
        while let Some(msg) = self.handler_rx.recv().await {
            self.handle_message(msg).await;
        }
        // handle dropped: nak whatever is still held so the server redelivers it promptly
        let held: Vec<u64> = self.in_progress.keys().copied().collect();
        self.resolve(held, Resolution::Nak).await;
    }

    async fn handle_message(&mut self, msg: ActorMessage) {
        match msg {
            ActorMessage::Read { respond_to } => {
                let messages = self.read_messages().await;
                let _ = respond_to.send(messages);
            }
            ActorMessage::Resolve {
                offsets,
                resolution,
                respond_to,
            } => {
                self.resolve(offsets, resolution).await;
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    /// Reads up to `batch_size` messages or until `read_timeout` elapses, whichever is first.
    /// A stream error ends the batch early; it is returned only when nothing was read, since
    /// the messages already tracked are held in-progress on the server.
    async fn read_messages(&mut self) -> Result<Vec<Message>> {
        let mut messages = Vec::with_capacity(self.batch_size);
        let timeout = time::sleep(self.read_timeout);
        tokio::pin!(timeout);
        loop {
            if messages.len() >= self.batch_size {
                break;
            }
            tokio::select! {
                biased;

                _ = &mut timeout => {
                    tracing::debug!(msg_count = messages.len(), "Timed out waiting for Jetstream messages");
                    break;
                }
                maybe_msg = self.messages.next() => {
                    let Some(msg) = maybe_msg else {
                        break;
                    };
                    let msg = match msg {
                        Ok(msg) => msg,
                        Err(e) if messages.is_empty() => {
                            return Err(Error::Jetstream(format!(
                                "Getting next message from the stream: {e:?}"
                            )));
                        }
                        Err(e) => {
                            tracing::warn!(
                                ?e,
                                msg_count = messages.len(),
                                "Stream error, returning a partial batch"
                            );
                            break;
                        }
                    };
                    match self.track(msg) {
                        Ok(message) => messages.push(message),
                        // never tracked, so the server redelivers it once ack_wait expires
                        Err(e) => tracing::warn!(?e, "Skipping message without usable metadata"),
                    }
                }
            }
        }
        Ok(messages)
    }

    fn track(&mut self, js_message: JetstreamMessage) -> Result<Message> {
        let message = Message::try_from(&js_message)?;
        let tick = self.consumer.cached_info().config.ack_wait / 2;
        // a redelivered sequence replaces its stale tracker, which stops ticking when dropped
        if let Some(stale) = self.in_progress.insert(
            message.stream_sequence,
            MessageProcessingTracker::start(js_message, tick),
        ) {
            stale.in_progress_task.abort();
        }
        Ok(message)
    }

    async fn resolve(&mut self, offsets: Vec<u64>, resolution: Resolution) {
        let mut pending = Vec::with_capacity(offsets.len());
        for offset in offsets {
            match self.in_progress.remove(&offset) {
                Some(tracker) => pending.push(tracker.signal(resolution)),
                None => tracing::warn!(offset, ?resolution, "No in-progress message for offset"),
            }
        }
        // every tracker acks on its own task; wait for all of them so callers observe completion
        for task in pending.into_iter().flatten() {
            let _ = task.await;
        }
    }
}

struct MessageProcessingTracker {
    in_progress_task: JoinHandle<()>,
    resolve_tx: oneshot::Sender<Resolution>,
}

impl MessageProcessingTracker {
    fn start(msg: JetstreamMessage, tick: Duration) -> Self {
        let (resolve_tx, resolve_rx) = oneshot::channel();
        let in_progress_task = tokio::spawn(Self::work_in_progress(msg, tick, resolve_rx));
        Self {
            in_progress_task,
            resolve_tx,
        }
    }

    async fn work_in_progress(
        msg: JetstreamMessage,
        tick: Duration,
        resolve_rx: oneshot::Receiver<Resolution>,
    ) {
        // ack_wait of zero would make interval() panic
        let tick = tick.max(Duration::from_millis(100));
        let mut interval = time::interval_at(Instant::now() + tick, tick);
        tokio::pin!(resolve_rx);

        loop {
            tokio::select! {
                biased;

                resolution = &mut resolve_rx => {
                    let result = match resolution {
                        Ok(Resolution::Ack) => msg.ack().await,
                        // a dropped tracker also releases the message for redelivery
                        Ok(Resolution::Nak) | Err(_) => msg.ack_with(AckKind::Nak(None)).await,
                    };
                    if let Err(err) = result {
                        tracing::error!(?err, "Failed to resolve Jetstream message");
                    }
                    return;
                },
                _ = interval.tick() => {
                    if let Err(err) = msg.ack_with(AckKind::Progress).await {
                        tracing::error!(?err, "Failed to send InProgress Ack to Jetstream for message");
                    }
                }
            }
        }
    }

    fn signal(self, resolution: Resolution) -> Option<JoinHandle<()>> {
        let Self {
            in_progress_task,
            resolve_tx,
        } = self;
        if resolve_tx.send(resolution).is_err() {
            tracing::error!(
                "Background task to mark the message status as in-progress is already terminated"
            );
            return None;
        }
        Some(in_progress_task)
    }
}

/// Handle to the Jetstream actor. Cheap to clone.
#[derive(Clone)]
pub struct JetstreamSource {
    actor_tx: mpsc::Sender<ActorMessage>,
}

impl JetstreamSource {
    pub async fn connect(
        config: JetstreamSourceConfig,
        batch_size: usize,
        read_timeout: Duration,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(10);
        JetstreamActor::start(config, batch_size, read_timeout, rx).await?;
        Ok(Self { actor_tx: tx })
    }

    pub async fn read_messages(&self) -> Result<Vec<Message>> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .actor_tx
            .send(ActorMessage::Read { respond_to: tx })
            .await;
        rx.await
            .map_err(|_| Error::Other("Actor task terminated".into()))?
    }

    pub async fn ack_messages(&self, offsets: Vec<u64>) -> Result<()> {
        self.resolve(offsets, Resolution::Ack).await
    }

    /// Releases the messages for immediate redelivery.
    pub async fn nack_messages(&self, offsets: Vec<u64>) -> Result<()> {
        self.resolve(offsets, Resolution::Nak).await
    }

    async fn resolve(&self, offsets: Vec<u64>, resolution: Resolution) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .actor_tx
            .send(ActorMessage::Resolve {
                offsets,
                resolution,
                respond_to: tx,
            })
            .await;
        rx.await
            .map_err(|_| Error::Other("Actor task terminated".into()))?
    }
}
