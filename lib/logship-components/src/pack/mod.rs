//! Label packing.

use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use logship_core::{render_timestamp, DeliveryReceipt, LabelSet, LogClient, TENANT_LABEL};
use logship_error::{ErrorContext as _, GenericError};
use serde_json::{Map, Value};

const ENTRY_KEY: &str = "_entry";
const TIME_KEY: &str = "time";
const COLLISION_PREFIX: &str = "label_";

/// Folds non-preserved labels into the log line.
///
/// Destinations index every label, so high-cardinality labels (pod names, container IDs) are better carried inside the
/// line itself. For every entry, labels whose key is in the preserved set are kept as labels. All remaining labels are
/// packed, together with the original line and timestamp, into a JSON object that replaces the line:
///
/// ```json
/// {"_entry": "<original line>", "time": "<RFC 3339 timestamp>", "<packed key>": "<value>", ...}
/// ```
///
/// A packed label named `_entry` or `time` is written as `label__entry` or `label_time`, so the reserved keys always
/// hold the original line and timestamp. Entries without any packable label pass through untouched.
///
/// The tenant label is always kept, as it is consumed further down the chain when the entry is pushed.
pub struct PackClient {
    inner: Arc<dyn LogClient>,
    preserved: HashSet<String>,
}

impl PackClient {
    /// Wraps `inner` so that every label not in `preserved` is packed into the line.
    ///
    /// When `preserved` is empty, packing is disabled and `inner` is returned as-is.
    pub fn wrap(inner: Arc<dyn LogClient>, preserved: HashSet<String>) -> Arc<dyn LogClient> {
        if preserved.is_empty() {
            return inner;
        }

        Arc::new(Self { inner, preserved })
    }

    fn pack(
        &self, mut labels: LabelSet, timestamp: &DateTime<Utc>, line: String,
    ) -> Result<(LabelSet, String), GenericError> {
        let tenant = labels.remove(TENANT_LABEL);
        let (mut preserved, packed) = labels.partition(&self.preserved);
        if let Some(tenant) = tenant {
            preserved.insert(TENANT_LABEL, tenant);
        }
        if packed.is_empty() {
            return Ok((preserved, line));
        }

        let mut object = Map::with_capacity(packed.len() + 2);
        for (key, value) in packed {
            let key = if key == ENTRY_KEY || key == TIME_KEY {
                format!("{}{}", COLLISION_PREFIX, key)
            } else {
                key
            };
            object.insert(key, Value::String(value));
        }
        object.insert(ENTRY_KEY.to_string(), Value::String(line));
        object.insert(TIME_KEY.to_string(), Value::String(render_timestamp(timestamp)));

        let line = serde_json::to_string(&object).error_context("Failed to serialize packed log line.")?;
        Ok((preserved, line))
    }
}

#[async_trait]
impl LogClient for PackClient {
    async fn handle(&self, labels: LabelSet, timestamp: DateTime<Utc>, line: String) -> Result<(), GenericError> {
        let (labels, line) = self.pack(labels, &timestamp, line)?;
        self.inner.handle(labels, timestamp, line).await
    }

    async fn handle_acknowledged(
        &self, labels: LabelSet, timestamp: DateTime<Utc>, line: String,
    ) -> Result<DeliveryReceipt, GenericError> {
        let (labels, line) = self.pack(labels, &timestamp, line)?;
        self.inner.handle_acknowledged(labels, timestamp, line).await
    }

    async fn stop(&self) {
        self.inner.stop().await
    }

    async fn stop_wait(&self) {
        self.inner.stop_wait().await
    }
}
