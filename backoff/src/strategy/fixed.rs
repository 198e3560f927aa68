use std::time::Duration;

/// Repeats the same interval forever; bound it with `take`.
#[derive(Debug, Clone, Copy)]
pub struct Interval {
    interval: Duration,
}

impl Interval {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }
}

impl Iterator for Interval {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.interval)
    }
}
