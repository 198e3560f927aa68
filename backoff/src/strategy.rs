/// Fixed interval between attempts.
pub mod fixed;

/// Exponentially growing interval with jitter and an attempt ceiling.
pub mod exponential;
