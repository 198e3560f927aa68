use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};

/// Maps messages to fixed, non-overlapping windows.
pub(crate) mod assigner;

/// A half-open interval `[start_time, end_time)` of event time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Window {
    pub(crate) start_time: DateTime<Utc>,
    pub(crate) end_time: DateTime<Utc>,
}

impl Window {
    pub(crate) fn new(start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            end_time,
        }
    }

    pub(crate) fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start_time <= t && t < self.end_time
    }
}

impl Ord for Window {
    fn cmp(&self, other: &Self) -> Ordering {
        self.end_time
            .cmp(&other.end_time)
            .then_with(|| self.start_time.cmp(&other.start_time))
    }
}

impl PartialOrd for Window {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Identity of a window book. The late variant of a window collects arrivals after the on-time
/// book was frozen, and is written under a distinct path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct WindowKey {
    pub(crate) window: Window,
    pub(crate) late: bool,
}

impl WindowKey {
    pub(crate) fn on_time(window: Window) -> Self {
        Self {
            window,
            late: false,
        }
    }

    pub(crate) fn late(self) -> Self {
        Self { late: true, ..self }
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            self.window.start_time.to_rfc3339(),
            self.window.end_time.to_rfc3339()
        )?;
        if self.late {
            write!(f, ".late")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn window(start: i64, end: i64) -> Window {
        Window::new(
            Utc.timestamp_opt(start, 0).unwrap(),
            Utc.timestamp_opt(end, 0).unwrap(),
        )
    }

    #[test]
    fn test_window_is_half_open() {
        let w = window(60, 120);
        assert!(w.contains(Utc.timestamp_opt(60, 0).unwrap()));
        assert!(w.contains(Utc.timestamp_opt(119, 999_000_000).unwrap()));
        assert!(!w.contains(Utc.timestamp_opt(120, 0).unwrap()));
    }

    #[test]
    fn test_keys_order_by_end_then_lateness() {
        let early = WindowKey::on_time(window(0, 60));
        let early_late = early.late();
        let next = WindowKey::on_time(window(60, 120));
        let mut keys = vec![next, early_late, early];
        keys.sort();
        assert_eq!(keys, vec![early, early_late, next]);
    }

    #[test]
    fn test_key_display() {
        let key = WindowKey::on_time(window(0, 60)).late();
        assert_eq!(
            key.to_string(),
            "1970-01-01T00:00:00+00:00-1970-01-01T00:01:00+00:00.late"
        );
    }
}
