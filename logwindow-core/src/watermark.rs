//! Decides when a window may stop accepting messages.
//!
//! The watermark is the bounded out-of-orderness estimate `max event time seen - allowance`; it
//! never moves backwards. The max is taken over the whole stream, not per window: the events of
//! a window all precede its end, so only later events can prove it complete. A window is ready to
//! close once any of these holds:
//! - the watermark reached the window end,
//! - the window has been open for longer than the max open duration (processing time),
//! - processing time drifted past the window end by more than the global lag bound, which is what
//!   closes windows when the source goes idle and the watermark stops moving.
//!
//! Closing is two-phase: a ready window enters CLOSING and is frozen only after a grace period
//! without arrivals, bounded so a steady trickle cannot keep it open forever.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::components::TriggerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    Watermark,
    MaxOpenDuration,
    LagBound,
    /// Size or count cap reached; the batch is sealed as a continuation.
    Overflow,
    Shutdown,
}

impl CloseReason {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Watermark => "watermark",
            CloseReason::MaxOpenDuration => "max_open_duration",
            CloseReason::LagBound => "lag_bound",
            CloseReason::Overflow => "overflow",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct WatermarkController {
    allowed_out_of_orderness: chrono::Duration,
    grace_period: chrono::Duration,
    max_open_duration: chrono::Duration,
    max_lag: chrono::Duration,
    max_event_time: Option<DateTime<Utc>>,
}

impl WatermarkController {
    pub(crate) fn new(config: &TriggerConfig) -> Self {
        Self {
            allowed_out_of_orderness: to_chrono(config.allowed_out_of_orderness),
            grace_period: to_chrono(config.grace_period),
            max_open_duration: to_chrono(config.max_open_duration),
            max_lag: to_chrono(config.max_lag),
            max_event_time: None,
        }
    }

    /// Records an event time. Only times resolved from the message itself should be observed;
    /// processing-time fallbacks would drag the watermark to the wall clock.
    pub(crate) fn observe(&mut self, event_time: DateTime<Utc>) {
        if self.max_event_time.is_none_or(|max| event_time > max) {
            self.max_event_time = Some(event_time);
        }
    }

    pub(crate) fn watermark(&self) -> Option<DateTime<Utc>> {
        self.max_event_time
            .and_then(|max| max.checked_sub_signed(self.allowed_out_of_orderness))
    }

    /// Whether an open window ending at `window_end`, whose current batch started collecting at
    /// `first_seen`, should start closing at `now`.
    pub(crate) fn should_close(
        &self,
        window_end: DateTime<Utc>,
        first_seen: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<CloseReason> {
        if self.watermark().is_some_and(|wm| wm >= window_end) {
            return Some(CloseReason::Watermark);
        }
        if now - first_seen >= self.max_open_duration {
            return Some(CloseReason::MaxOpenDuration);
        }
        if now - window_end >= self.max_lag {
            return Some(CloseReason::LagBound);
        }
        None
    }

    /// Deadline for a CLOSING window: `grace` after the last arrival, but never later than
    /// `grace` past the max open duration of the batch.
    pub(crate) fn grace_deadline(
        &self,
        last_arrival: DateTime<Utc>,
        first_seen: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let by_arrival = last_arrival
            .checked_add_signed(self.grace_period)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let hard_limit = first_seen
            .checked_add_signed(self.max_open_duration)
            .and_then(|t| t.checked_add_signed(self.grace_period))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        by_arrival.min(hard_limit)
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn controller() -> WatermarkController {
        WatermarkController::new(&TriggerConfig {
            allowed_out_of_orderness: Duration::from_secs(5),
            grace_period: Duration::from_secs(2),
            max_open_duration: Duration::from_secs(300),
            max_lag: Duration::from_secs(120),
            tick_interval: Duration::from_millis(500),
            flushed_retention: Duration::from_secs(60),
        })
    }

    #[test]
    fn test_watermark_never_regresses() {
        let mut wm = controller();
        assert_eq!(wm.watermark(), None);
        wm.observe(at(100));
        assert_eq!(wm.watermark(), Some(at(95)));
        wm.observe(at(50));
        assert_eq!(wm.watermark(), Some(at(95)));
        wm.observe(at(110));
        assert_eq!(wm.watermark(), Some(at(105)));
    }

    #[test]
    fn test_closes_when_watermark_passes_end() {
        let mut wm = controller();
        wm.observe(at(64));
        // watermark 59 < end 60
        assert_eq!(wm.should_close(at(60), at(10), at(70)), None);
        wm.observe(at(65));
        assert_eq!(
            wm.should_close(at(60), at(10), at(70)),
            Some(CloseReason::Watermark)
        );
    }

    #[test]
    fn test_max_open_duration_forces_close() {
        let wm = controller();
        assert_eq!(wm.should_close(at(10_000), at(0), at(299)), None);
        assert_eq!(
            wm.should_close(at(10_000), at(0), at(300)),
            Some(CloseReason::MaxOpenDuration)
        );
    }

    #[test]
    fn test_idle_source_closes_on_lag_bound() {
        // no events observed at all, the wall clock moves past the window end
        let wm = controller();
        assert_eq!(wm.should_close(at(60), at(50), at(179)), None);
        assert_eq!(
            wm.should_close(at(60), at(50), at(180)),
            Some(CloseReason::LagBound)
        );
    }

    #[test]
    fn test_grace_deadline_is_bounded() {
        let wm = controller();
        assert_eq!(wm.grace_deadline(at(100), at(0)), at(102));
        // a trickle of arrivals cannot extend past first_seen + max_open + grace
        assert_eq!(wm.grace_deadline(at(1_000), at(0)), at(302));
    }
}
