use std::fmt;

use chrono::{DateTime, Utc};

use crate::compression::Codec;
use crate::window::WindowKey;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Where an artifact lives: the configured output directory (with its trailing `/`) and the
/// object key below it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct OutputPath {
    pub(crate) directory: String,
    pub(crate) relative: String,
}

impl fmt::Display for OutputPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.directory, self.relative)
    }
}

/// Builds deterministic artifact paths:
/// `{directory}[YYYY/MM/DD/]{prefix}{start}-{end}[.late][-{seq}].{ext}`.
#[derive(Debug, Clone)]
pub(crate) struct PathBuilder {
    directory: String,
    prefix: String,
    date_partitioned: bool,
    codec: Codec,
}

impl PathBuilder {
    pub(crate) fn new(
        directory: impl Into<String>,
        prefix: impl Into<String>,
        date_partitioned: bool,
        codec: Codec,
    ) -> Self {
        Self {
            directory: directory.into(),
            prefix: prefix.into(),
            date_partitioned,
            codec,
        }
    }

    pub(crate) fn codec(&self) -> Codec {
        self.codec
    }

    pub(crate) fn build(&self, key: &WindowKey, seq: u32) -> OutputPath {
        let mut relative = String::new();
        if self.date_partitioned {
            relative.push_str(&key.window.start_time.format("%Y/%m/%d/").to_string());
        }
        relative.push_str(&self.prefix);
        relative.push_str(&format_time(key.window.start_time));
        relative.push('-');
        relative.push_str(&format_time(key.window.end_time));
        if key.late {
            relative.push_str(".late");
        }
        if seq > 0 {
            relative.push_str(&format!("-{seq}"));
        }
        relative.push('.');
        relative.push_str(self.codec.extension());

        OutputPath {
            directory: self.directory.clone(),
            relative,
        }
    }

    /// Next candidate when `(key, seq)` is taken by different content: an on-time artifact moves
    /// to the late variant, a late one to the next sequence.
    pub(crate) fn relocate(key: WindowKey, seq: u32) -> (WindowKey, u32) {
        if key.late {
            (key, seq.saturating_add(1))
        } else {
            (key.late(), seq)
        }
    }
}

fn format_time(t: DateTime<Utc>) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::window::Window;

    fn key() -> WindowKey {
        WindowKey::on_time(Window::new(
            Utc.with_ymd_and_hms(2024, 3, 9, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 9, 0, 1, 0).unwrap(),
        ))
    }

    #[test]
    fn test_on_time_path() {
        let builder = PathBuilder::new("gs://bucket/logs/", "", false, Codec::Gzip);
        let path = builder.build(&key(), 0);
        assert_eq!(
            path.to_string(),
            "gs://bucket/logs/2024-03-09T00:00:00Z-2024-03-09T00:01:00Z.gz"
        );
        assert_eq!(path.relative, "2024-03-09T00:00:00Z-2024-03-09T00:01:00Z.gz");
    }

    #[test]
    fn test_late_continuation_with_prefix_and_date_partitions() {
        let builder = PathBuilder::new("s3://b/", "logs-", true, Codec::Bzip2);
        let path = builder.build(&key().late(), 2);
        assert_eq!(
            path.relative,
            "2024/03/09/logs-2024-03-09T00:00:00Z-2024-03-09T00:01:00Z.late-2.bz2"
        );
    }

    #[test]
    fn test_paths_are_distinct_per_variant() {
        let builder = PathBuilder::new("memory:///", "", false, Codec::Deflate);
        let on_time = builder.build(&key(), 0);
        let continuation = builder.build(&key(), 1);
        let late = builder.build(&key().late(), 0);
        assert_ne!(on_time, continuation);
        assert_ne!(on_time, late);
        assert_ne!(continuation, late);
        assert!(late.relative.ends_with(".late.zlib"));
    }

    #[test]
    fn test_relocate() {
        let (late, seq) = PathBuilder::relocate(key(), 3);
        assert!(late.late);
        assert_eq!(seq, 3);
        assert_eq!(PathBuilder::relocate(late, seq), (late, 4));
    }
}
