use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use logwindow_jetstream::{JetstreamSource, JetstreamSourceConfig};

use crate::message::{Message, MessageID, Offset};
use crate::source::{SourceAcker, SourceReader};
use crate::{Error, Result};

/// Header carrying the publisher-assigned message id, also used by the server for
/// publish-side deduplication.
const NATS_MSG_ID_HEADER: &str = "Nats-Msg-Id";

impl From<logwindow_jetstream::Message> for Message {
    fn from(message: logwindow_jetstream::Message) -> Self {
        let id = message
            .headers
            .get(NATS_MSG_ID_HEADER)
            .filter(|id| !id.is_empty())
            .map(|id| MessageID::from(id.as_str()))
            .unwrap_or_else(|| MessageID::from(message.stream_sequence.to_string()));

        Message {
            id,
            payload: message.value,
            publish_time: Some(message.published),
            headers: Arc::new(message.headers),
            delivery_attempt: message.delivered,
            received_at: Utc::now(),
            offset: Offset::Int(message.stream_sequence),
            ack_handle: None,
        }
    }
}

pub(crate) async fn new_jetstream_source(
    cfg: JetstreamSourceConfig,
    batch_size: usize,
    read_timeout: Duration,
) -> Result<JetstreamSource> {
    Ok(JetstreamSource::connect(cfg, batch_size, read_timeout).await?)
}

fn stream_sequences(offsets: Vec<Offset>) -> Result<Vec<u64>> {
    offsets
        .into_iter()
        .map(|offset| match offset {
            Offset::Int(seq) => Ok(seq),
            Offset::String(_) => Err(Error::Source(format!(
                "Expected integer offset for Jetstream source. Got: {offset}"
            ))),
        })
        .collect()
}

impl SourceReader for JetstreamSource {
    fn name(&self) -> &'static str {
        "Jetstream"
    }

    async fn read(&mut self) -> Result<Vec<Message>> {
        Ok(self
            .read_messages()
            .await?
            .into_iter()
            .map(Message::from)
            .collect())
    }
}

impl SourceAcker for JetstreamSource {
    async fn ack(&mut self, offsets: Vec<Offset>) -> Result<()> {
        self.ack_messages(stream_sequences(offsets)?).await?;
        Ok(())
    }

    async fn nack(&mut self, offsets: Vec<Offset>) -> Result<()> {
        self.nack_messages(stream_sequences(offsets)?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bytes::Bytes;
    use chrono::TimeZone;
    use logwindow_jetstream::Message as JetstreamMessage;

    use super::*;

    fn jetstream_message(headers: HashMap<String, String>) -> JetstreamMessage {
        JetstreamMessage {
            value: Bytes::from("test_value"),
            stream_sequence: 42,
            published: Utc.with_ymd_and_hms(2024, 3, 9, 10, 0, 0).unwrap(),
            delivered: 3,
            headers,
        }
    }

    #[test]
    fn test_message_id_from_header() {
        let headers = HashMap::from([(NATS_MSG_ID_HEADER.to_string(), "order-7".to_string())]);
        let message: Message = jetstream_message(headers).into();
        assert_eq!(message.id.as_str(), "order-7");
        assert_eq!(message.offset, Offset::Int(42));
        assert_eq!(message.delivery_attempt, 3);
        assert_eq!(
            message.publish_time,
            Some(Utc.with_ymd_and_hms(2024, 3, 9, 10, 0, 0).unwrap())
        );
        assert_eq!(message.payload, Bytes::from("test_value"));
    }

    #[test]
    fn test_message_id_falls_back_to_sequence() {
        let message: Message = jetstream_message(HashMap::new()).into();
        assert_eq!(message.id.as_str(), "42");
    }

    #[test]
    fn test_string_offsets_are_rejected() {
        assert_eq!(stream_sequences(vec![Offset::Int(1), Offset::Int(5)]).unwrap(), vec![1, 5]);
        assert!(stream_sequences(vec![Offset::String(Bytes::from("a"))]).is_err());
    }

    #[cfg(feature = "nats-tests")]
    #[tokio::test]
    async fn test_jetstream_read_and_ack() {
        use async_nats::jetstream;
        use async_nats::jetstream::{consumer, stream};

        let stream_name = "test_logwindow_source";
        let client = async_nats::connect("localhost").await.unwrap();
        let context = jetstream::new(client);
        let _ = context.delete_stream(stream_name).await;
        context
            .get_or_create_stream(stream::Config {
                name: stream_name.into(),
                subjects: vec![stream_name.into()],
                max_message_size: 1024,
                ..Default::default()
            })
            .await
            .unwrap();
        context
            .create_consumer_on_stream(
                consumer::pull::Config {
                    durable_name: Some(stream_name.to_string()),
                    ..Default::default()
                },
                stream_name,
            )
            .await
            .unwrap();

        for i in 0..5 {
            context
                .publish(stream_name, format!("line {i}").into())
                .await
                .unwrap()
                .await
                .unwrap();
        }

        let mut source = new_jetstream_source(
            JetstreamSourceConfig {
                addr: "localhost".to_string(),
                stream: stream_name.to_string(),
                consumer: stream_name.to_string(),
                auth: None,
            },
            10,
            Duration::from_millis(500),
        )
        .await
        .unwrap();

        let messages = SourceReader::read(&mut source).await.unwrap();
        assert_eq!(messages.len(), 5);
        assert!(messages.iter().all(|m| m.delivery_attempt == 1));
        let offsets = messages.iter().map(|m| m.offset.clone()).collect();
        SourceAcker::ack(&mut source, offsets).await.unwrap();

        context.delete_stream(stream_name).await.unwrap();
    }
}
