//! Pushing batches to a log storage backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use logship_core::LabelSet;
use serde::ser::{Serialize, SerializeSeq as _, SerializeStruct as _, Serializer};
use snafu::Snafu;

mod http;
pub use self::http::HttpPushClient;

/// A push error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum PushError {
    /// The push failed in a way that may succeed when retried.
    #[snafu(display("Push failed transiently: {}", reason))]
    Transient {
        /// Failure description.
        reason: String,
    },

    /// The destination refused the push.
    #[snafu(display("Push rejected with status {}: {}", status, body))]
    Rejected {
        /// HTTP status code.
        status: u16,

        /// Response body, as returned by the destination.
        body: String,
    },

    /// The request could not be encoded.
    #[snafu(display("Failed to encode push request: {}", source))]
    Encode {
        /// Error source.
        source: serde_json::Error,
    },
}

impl PushError {
    /// Returns `true` if the push should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PushError::Transient { .. })
    }
}

/// Entries sharing one label set.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PushStream {
    /// Labels of every entry in the stream.
    pub labels: LabelSet,

    /// Timestamp and line of each entry, in push order.
    pub entries: Vec<(DateTime<Utc>, String)>,
}

/// A single push call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PushRequest {
    /// Tenant the streams are pushed under, if any.
    pub tenant: Option<String>,

    /// Streams to push.
    pub streams: Vec<PushStream>,
}

impl PushRequest {
    /// Returns the total number of entries across all streams.
    pub fn entry_count(&self) -> usize {
        self.streams.iter().map(|stream| stream.entries.len()).sum()
    }

    /// Encodes the request as a JSON push payload.
    ///
    /// Timestamps are encoded as nanoseconds since the Unix epoch, as strings.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&Payload(self))
    }
}

struct Payload<'a>(&'a PushRequest);

impl Serialize for Payload<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut payload = serializer.serialize_struct("Payload", 1)?;
        payload.serialize_field("streams", &Streams(&self.0.streams))?;
        payload.end()
    }
}

struct Streams<'a>(&'a [PushStream]);

impl Serialize for Streams<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for stream in self.0 {
            seq.serialize_element(&Stream(stream))?;
        }
        seq.end()
    }
}

struct Stream<'a>(&'a PushStream);

impl Serialize for Stream<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let values = self
            .0
            .entries
            .iter()
            .map(|(timestamp, line)| (unix_nanos(timestamp), line.as_str()))
            .collect::<Vec<_>>();

        let mut stream = serializer.serialize_struct("Stream", 2)?;
        stream.serialize_field("stream", &self.0.labels)?;
        stream.serialize_field("values", &values)?;
        stream.end()
    }
}

fn unix_nanos(timestamp: &DateTime<Utc>) -> String {
    let nanos = i128::from(timestamp.timestamp()) * 1_000_000_000 + i128::from(timestamp.timestamp_subsec_nanos());
    nanos.to_string()
}

/// Delivers push requests to a destination.
#[async_trait]
pub trait PushClient: Send + Sync {
    /// Pushes the request.
    ///
    /// # Errors
    ///
    /// If the push does not succeed, an error is returned. Whether the push is worth retrying is indicated by
    /// [`PushError::is_retryable`].
    async fn push(&self, request: &PushRequest) -> Result<(), PushError>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use super::*;

    /// A push client that records every attempt and replays scripted failures.
    #[derive(Default)]
    pub struct RecordingPushClient {
        attempts: Mutex<usize>,
        delivered: Mutex<Vec<PushRequest>>,
        failures: Mutex<VecDeque<PushError>>,
        always_fail: Mutex<Option<fn() -> PushError>>,
    }

    impl RecordingPushClient {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Fails the next pushes with the given errors, in order.
        pub fn fail_next(&self, errors: impl IntoIterator<Item = PushError>) {
            self.failures.lock().unwrap().extend(errors);
        }

        /// Fails every push with the error built by `error`.
        pub fn fail_always(&self, error: fn() -> PushError) {
            *self.always_fail.lock().unwrap() = Some(error);
        }

        pub fn attempts(&self) -> usize {
            *self.attempts.lock().unwrap()
        }

        pub fn delivered(&self) -> Vec<PushRequest> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PushClient for RecordingPushClient {
        async fn push(&self, request: &PushRequest) -> Result<(), PushError> {
            *self.attempts.lock().unwrap() += 1;

            if let Some(error) = *self.always_fail.lock().unwrap() {
                return Err(error());
            }
            if let Some(error) = self.failures.lock().unwrap().pop_front() {
                return Err(error);
            }

            self.delivered.lock().unwrap().push(request.clone());
            Ok(())
        }
    }

    pub fn transient() -> PushError {
        PushError::Transient {
            reason: "connection refused".to_string(),
        }
    }

    pub fn rejected() -> PushError {
        PushError::Rejected {
            status: 400,
            body: "entry out of order".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    #[test]
    fn payload_groups_entries_by_stream() {
        let request = PushRequest {
            tenant: Some("operator".to_string()),
            streams: vec![PushStream {
                labels: [("namespace", "foo")].into_iter().collect(),
                entries: vec![
                    (Utc.timestamp_opt(1, 5).unwrap(), "first".to_string()),
                    (Utc.timestamp_opt(2, 0).unwrap(), "second".to_string()),
                ],
            }],
        };

        let payload: serde_json::Value = serde_json::from_slice(&request.to_json().unwrap()).unwrap();
        let expected = serde_json::json!({
            "streams": [{
                "stream": {"namespace": "foo"},
                "values": [["1000000005", "first"], ["2000000000", "second"]],
            }],
        });
        assert_eq!(payload, expected);
        assert_eq!(request.entry_count(), 2);
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(test_support::transient().is_retryable());
        assert!(!test_support::rejected().is_retryable());
    }
}
