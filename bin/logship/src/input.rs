use chrono::{DateTime, Utc};
use logship_core::{ClusterState, DestinationKey, LabelSet};
use logship_error::{ErrorContext as _, GenericError};
use serde::Deserialize;

/// A record read from standard input.
#[derive(Debug, PartialEq)]
pub enum Input {
    /// A log entry to ship.
    Entry {
        labels: LabelSet,
        timestamp: DateTime<Utc>,
        line: String,
    },

    /// A lifecycle state change of a destination.
    Notification {
        destination: DestinationKey,
        state: ClusterState,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawInput {
    Entry {
        #[serde(default)]
        labels: LabelSet,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
        line: String,
    },
    Notification {
        destination: String,
        state: ClusterState,
    },
}

/// Parses a single line of input.
///
/// Blank lines yield `None`. The destination `main` names the main destination.
///
/// # Errors
///
/// If the line is neither a log entry nor a notification, an error is returned.
pub fn parse_input(line: &str) -> Result<Option<Input>, GenericError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let raw = serde_json::from_str::<RawInput>(line).error_context("Input is neither a log entry nor a notification.")?;
    let input = match raw {
        RawInput::Entry { labels, timestamp, line } => Input::Entry { labels, timestamp, line },
        RawInput::Notification { destination, state } => Input::Notification {
            destination: if destination == "main" {
                DestinationKey::Main
            } else {
                DestinationKey::Named(destination)
            },
            state,
        },
    };

    Ok(Some(input))
}
