use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    /// A read or ack failure the queue client may recover from (a missed heartbeat, a
    /// reconnect in progress).
    #[error("Source Error - {0}")]
    Source(String),

    /// The source can no longer be used, e.g. its client actor is gone.
    #[error("Fatal Source Error - {0}")]
    SourceFatal(String),

    /// A sink failure that may succeed if attempted again (I/O, throttling, unavailability).
    #[error("Sink Error - {0}")]
    Sink(String),

    /// A sink failure no retry can fix (permissions, credentials, unsupported operation).
    #[error("Fatal Sink Error - {0}")]
    SinkFatal(String),

    #[error("Compression Error - {0}")]
    Compression(String),

    #[error("Accumulator Error - {0}")]
    Accumulator(String),

    #[error("Timeout Error - {0}")]
    Timeout(String),

    #[error("metrics Error - {0}")]
    Metrics(String),

    #[error("OneShot Receiver Error - {0}")]
    ActorPatternRecv(String),
}

impl Error {
    /// Whether a read or write that failed with this error is worth another attempt.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(self, Error::Source(_) | Error::Sink(_) | Error::Timeout(_))
    }
}

impl From<logwindow_jetstream::Error> for Error {
    fn from(value: logwindow_jetstream::Error) -> Self {
        match value {
            logwindow_jetstream::Error::Other(_) => {
                Error::SourceFatal(format!("Jetstream source: {value}"))
            }
            other => Error::Source(format!("Jetstream source: {other}")),
        }
    }
}

impl From<object_store::Error> for Error {
    fn from(value: object_store::Error) -> Self {
        match value {
            object_store::Error::PermissionDenied { .. }
            | object_store::Error::Unauthenticated { .. }
            | object_store::Error::NotImplemented { .. }
            | object_store::Error::NotSupported { .. }
            | object_store::Error::UnknownConfigurationKey { .. } => {
                Error::SinkFatal(value.to_string())
            }
            other => Error::Sink(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(value: tokio::task::JoinError) -> Self {
        Error::Accumulator(format!("task failed: {value}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jetstream_errors_are_classified() {
        let transient: Error =
            logwindow_jetstream::Error::Jetstream("missed heartbeat".to_string()).into();
        assert!(matches!(transient, Error::Source(_)));
        assert!(transient.is_retryable());

        let fatal: Error = logwindow_jetstream::Error::Other("Actor task terminated".into()).into();
        assert!(matches!(fatal, Error::SourceFatal(_)));
        assert!(!fatal.is_retryable());
    }

    #[test]
    fn test_object_store_errors_are_classified() {
        let denied: Error = object_store::Error::PermissionDenied {
            path: "logs/a.gz".to_string(),
            source: "access denied".into(),
        }
        .into();
        assert!(matches!(denied, Error::SinkFatal(_)));
        assert!(!denied.is_retryable());

        let unavailable: Error = object_store::Error::Generic {
            store: "S3",
            source: "503 slow down".into(),
        }
        .into();
        assert!(unavailable.is_retryable());
    }
}
