//! Run summary and the error type that carries a partial summary out of a
//! failed run.

use std::time::Duration;

/// Per-file failure recorded in the final summary.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FileError {
    pub name: String,
    pub error: String,
    pub attempts: u32,
}

/// Aggregate counters for one sender or receiver run.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub files_sent: u64,
    pub files_failed: u64,
    pub bytes_sent: u64,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
    pub per_file_errors: Vec<FileError>,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        let mut per_file_errors = self.per_file_errors;
        per_file_errors.extend(other.per_file_errors);
        Self {
            files_sent: self.files_sent + other.files_sent,
            files_failed: self.files_failed + other.files_failed,
            bytes_sent: self.bytes_sent + other.bytes_sent,
            elapsed: self.elapsed.max(other.elapsed),
            per_file_errors,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "files sent: {}\n\
            files failed: {}\n\
            bytes sent: {}\n\
            elapsed: {}",
            self.files_sent,
            self.files_failed,
            bytesize::ByteSize(self.bytes_sent),
            humantime::format_duration(self.elapsed),
        )
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u128(value.as_millis())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Terminal error from a run, carrying whatever partial summary had already
/// accumulated before the failure.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct RunError {
    #[source]
    pub source: anyhow::Error,
    pub summary: Summary,
}

impl RunError {
    pub fn new(source: anyhow::Error, summary: Summary) -> Self {
        RunError { source, summary }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_combines_counters_and_takes_max_elapsed() {
        let a = Summary {
            files_sent: 3,
            files_failed: 1,
            bytes_sent: 100,
            elapsed: Duration::from_secs(2),
            per_file_errors: vec![FileError {
                name: "a.jpg".into(),
                error: "timeout".into(),
                attempts: 2,
            }],
        };
        let b = Summary {
            files_sent: 5,
            files_failed: 0,
            bytes_sent: 200,
            elapsed: Duration::from_secs(5),
            per_file_errors: vec![],
        };
        let total = a + b;
        assert_eq!(total.files_sent, 8);
        assert_eq!(total.files_failed, 1);
        assert_eq!(total.bytes_sent, 300);
        assert_eq!(total.elapsed, Duration::from_secs(5));
        assert_eq!(total.per_file_errors.len(), 1);
    }

    #[test]
    fn display_includes_byte_size_and_duration() {
        let summary = Summary {
            files_sent: 1,
            files_failed: 0,
            bytes_sent: 1024,
            elapsed: Duration::from_secs(1),
            per_file_errors: vec![],
        };
        let rendered = summary.to_string();
        assert!(rendered.contains("files sent: 1"));
        assert!(rendered.contains("KiB") || rendered.contains("KB"));
    }
}
