use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::message::Message;
use crate::window::Window;

/// Why a message was placed in the processing-time window instead of its event-time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FallbackReason {
    /// The event-time header was present but could not be parsed.
    MalformedTimestamp,
    /// Neither an event-time header nor a publish time.
    MissingTimestamp,
    /// Payload above the per-message size limit.
    Oversize,
}

impl FallbackReason {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::MalformedTimestamp => "malformed_timestamp",
            FallbackReason::MissingTimestamp => "missing_timestamp",
            FallbackReason::Oversize => "oversize",
        }
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The result of assigning a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Assignment {
    pub(crate) window: Window,
    /// The time used for assignment, processing time when `fallback` is set.
    pub(crate) event_time: DateTime<Utc>,
    pub(crate) fallback: Option<FallbackReason>,
}

/// Assigns each message to exactly one fixed window, `floor(t / length) * length`.
#[derive(Debug, Clone)]
pub(crate) struct WindowAssigner {
    length_millis: i64,
    event_time_header: Option<String>,
    max_message_bytes: usize,
}

impl WindowAssigner {
    pub(crate) fn new(
        length: Duration,
        event_time_header: Option<String>,
        max_message_bytes: usize,
    ) -> Self {
        Self {
            length_millis: i64::try_from(length.as_millis()).unwrap_or(i64::MAX).max(1),
            event_time_header,
            max_message_bytes,
        }
    }

    /// Resolves the event time of `msg` and maps it to its window. Messages whose event time
    /// cannot be determined, or which are too large, go to the window of `now`.
    pub(crate) fn assign(&self, msg: &Message, now: DateTime<Utc>) -> Assignment {
        match self.event_time(msg) {
            Ok(event_time) => Assignment {
                window: self.window_for(event_time),
                event_time,
                fallback: None,
            },
            Err(reason) => {
                warn!(
                    id = %msg.id,
                    offset = %msg.offset,
                    %reason,
                    "Assigning message to processing-time window"
                );
                Assignment {
                    window: self.window_for(now),
                    event_time: now,
                    fallback: Some(reason),
                }
            }
        }
    }

    /// The window containing `t`. Floor semantics hold for times before the epoch too.
    pub(crate) fn window_for(&self, t: DateTime<Utc>) -> Window {
        let millis = t.timestamp_millis();
        let start_millis = millis - millis.rem_euclid(self.length_millis);
        let start_time =
            DateTime::from_timestamp_millis(start_millis).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let end_time = start_millis
            .checked_add(self.length_millis)
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Window::new(start_time, end_time)
    }

    fn event_time(&self, msg: &Message) -> Result<DateTime<Utc>, FallbackReason> {
        if msg.payload.len() > self.max_message_bytes {
            return Err(FallbackReason::Oversize);
        }

        if let Some(header) = self.event_time_header.as_ref()
            && let Some(value) = msg.headers.get(header)
        {
            return parse_timestamp(value).ok_or(FallbackReason::MalformedTimestamp);
        }

        msg.publish_time.ok_or(FallbackReason::MissingTimestamp)
    }
}

/// Accepts RFC 3339 or integer epoch milliseconds.
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Some(t.with_timezone(&Utc));
    }
    value
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use bytes::Bytes;
    use chrono::TimeZone;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn message(publish_secs: Option<i64>, headers: &[(&str, &str)]) -> Message {
        Message {
            id: "id".into(),
            payload: Bytes::from_static(b"payload"),
            publish_time: publish_secs.map(at),
            headers: Arc::new(
                headers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<HashMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    fn assigner() -> WindowAssigner {
        WindowAssigner::new(Duration::from_secs(60), Some("event-time".to_string()), 16)
    }

    #[test]
    fn test_window_boundaries() {
        let assigner = assigner();
        assert_eq!(assigner.window_for(at(59)), Window::new(at(0), at(60)));
        assert_eq!(assigner.window_for(at(60)), Window::new(at(60), at(120)));
        assert_eq!(assigner.window_for(at(61)), Window::new(at(60), at(120)));
        // floor, not truncation, before the epoch
        assert_eq!(assigner.window_for(at(-1)), Window::new(at(-60), at(0)));
    }

    #[test]
    fn test_every_time_in_exactly_one_window() {
        let assigner = assigner();
        for t in (-600..600).step_by(7) {
            let w = assigner.window_for(at(t));
            assert!(w.contains(at(t)));
            assert_eq!(w.end_time - w.start_time, chrono::Duration::seconds(60));
        }
    }

    #[test]
    fn test_publish_time_used_without_header() {
        let assignment = assigner().assign(&message(Some(125), &[]), at(1_000));
        assert_eq!(assignment.window, Window::new(at(120), at(180)));
        assert_eq!(assignment.fallback, None);
    }

    #[test]
    fn test_header_overrides_publish_time() {
        let rfc = message(Some(125), &[("event-time", "1970-01-01T00:00:05Z")]);
        assert_eq!(
            assigner().assign(&rfc, at(1_000)).window,
            Window::new(at(0), at(60))
        );

        let millis = message(Some(125), &[("event-time", "61000")]);
        assert_eq!(
            assigner().assign(&millis, at(1_000)).window,
            Window::new(at(60), at(120))
        );
    }

    #[test]
    fn test_malformed_header_falls_back_to_processing_time() {
        let msg = message(Some(125), &[("event-time", "yesterday-ish")]);
        let assignment = assigner().assign(&msg, at(1_000));
        assert_eq!(assignment.window, Window::new(at(960), at(1_020)));
        assert_eq!(assignment.fallback, Some(FallbackReason::MalformedTimestamp));
    }

    #[test]
    fn test_missing_timestamp_falls_back() {
        let assignment = assigner().assign(&message(None, &[]), at(30));
        assert_eq!(assignment.window, Window::new(at(0), at(60)));
        assert_eq!(assignment.fallback, Some(FallbackReason::MissingTimestamp));
    }

    #[test]
    fn test_oversize_payload_falls_back() {
        let mut msg = message(Some(125), &[]);
        msg.payload = Bytes::from(vec![b'x'; 17]);
        let assignment = assigner().assign(&msg, at(30));
        assert_eq!(assignment.fallback, Some(FallbackReason::Oversize));
        assert_eq!(assignment.window, Window::new(at(0), at(60)));
    }
}
