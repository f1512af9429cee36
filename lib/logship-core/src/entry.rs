use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::LabelSet;

/// A single log record.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Labels identifying the stream this entry belongs to.
    pub labels: LabelSet,

    /// Time at which the record was produced.
    pub timestamp: DateTime<Utc>,

    /// The log line itself.
    pub line: String,
}

impl LogEntry {
    /// Creates a new `LogEntry`.
    pub fn new(labels: LabelSet, timestamp: DateTime<Utc>, line: impl Into<String>) -> Self {
        Self {
            labels,
            timestamp,
            line: line.into(),
        }
    }

    /// Returns the size this entry contributes to a batch, in bytes.
    ///
    /// Only the line is counted, as labels are sent once per stream rather than once per entry.
    pub fn size_bytes(&self) -> usize {
        self.line.len()
    }
}

/// Renders a timestamp the way it is embedded into packed lines.
pub fn render_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    #[test]
    fn timestamps_render_with_nanoseconds() {
        let ts = Utc.timestamp_opt(1_700_000_000, 6).unwrap();
        assert_eq!(render_timestamp(&ts), "2023-11-14T22:13:20.000000006Z");
    }

    #[test]
    fn size_counts_only_the_line() {
        let labels = [("namespace", "foo")].into_iter().collect();
        let entry = LogEntry::new(labels, Utc::now(), "abcd");
        assert_eq!(entry.size_bytes(), 4);
    }
}
