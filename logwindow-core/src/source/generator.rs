use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::time::{self, Interval, MissedTickBehavior};

use crate::Result;
use crate::config::components::GeneratorConfig;
use crate::message::{Message, MessageID, Offset};
use crate::source::{SourceAcker, SourceReader};

/// Generates `rpu` messages per second. Each payload is a JSON line padded to
/// `msg_size_bytes`; the publish time lags the wall clock by the configured skew.
pub(crate) struct GeneratorRead {
    config: GeneratorConfig,
    ticker: Interval,
    counter: u64,
}

impl GeneratorRead {
    pub(crate) fn new(config: GeneratorConfig) -> Self {
        let mut ticker = time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            config,
            ticker,
            counter: 0,
        }
    }

    fn next_message(&mut self) -> Message {
        let seq = self.counter;
        self.counter += 1;

        // every n-th message reuses the previous id, the way a redelivery would look
        let id_seq = match self.config.duplicate_every {
            n if n > 0 && seq > 0 && seq % n as u64 == 0 => seq - 1,
            _ => seq,
        };

        let now = Utc::now();
        let publish_time = chrono::Duration::from_std(self.config.event_time_skew)
            .ok()
            .and_then(|skew| now.checked_sub_signed(skew))
            .unwrap_or(now);

        Message {
            id: MessageID::from(format!("gen-{id_seq}")),
            payload: payload(id_seq, self.config.msg_size_bytes),
            publish_time: Some(publish_time),
            headers: Arc::new(HashMap::new()),
            delivery_attempt: 1,
            received_at: now,
            offset: Offset::Int(seq),
            ack_handle: None,
        }
    }
}

fn payload(seq: u64, size: usize) -> Bytes {
    let mut line = format!("{{\"seq\":{seq},\"data\":\"");
    let padding = size.saturating_sub(line.len() + 2);
    line.extend(std::iter::repeat_n('x', padding));
    line.push_str("\"}");
    Bytes::from(line)
}

impl SourceReader for GeneratorRead {
    fn name(&self) -> &'static str {
        "generator"
    }

    async fn read(&mut self) -> Result<Vec<Message>> {
        self.ticker.tick().await;
        Ok((0..self.config.rpu).map(|_| self.next_message()).collect())
    }
}

/// Generated messages need no acknowledgement.
pub(crate) struct GeneratorAck;

impl SourceAcker for GeneratorAck {
    async fn ack(&mut self, _: Vec<Offset>) -> Result<()> {
        Ok(())
    }

    async fn nack(&mut self, _: Vec<Offset>) -> Result<()> {
        Ok(())
    }
}
