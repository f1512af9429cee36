//! Core data model for the log shipper.
//!
//! Covers log entries and their labels, the cluster lifecycle states that gate delivery, and the [`LogClient`] trait
//! that every stage of a delivery chain implements.
#![deny(missing_docs)]

mod client;
pub use self::client::LogClient;

mod cluster;
pub use self::cluster::{ClusterState, DestinationKey, SendPermissionMatrix, UnknownClusterState};

mod delivery;
pub use self::delivery::{Delivery, DeliveryAck, DeliveryReceipt};

mod entry;
pub use self::entry::{render_timestamp, LogEntry};

mod labels;
pub use self::labels::{LabelSet, TENANT_LABEL};

pub mod task;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;
