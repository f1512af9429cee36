use async_trait::async_trait;
use chrono::{DateTime, Utc};
use logship_error::GenericError;

use crate::{DeliveryReceipt, LabelSet};

/// A client that accepts log entries and delivers them somewhere.
///
/// Clients are composed into chains: decorators rewrite entries and forward them to the client they wrap, while the
/// innermost client pushes them over the network. Stopping a chain stops every client in it.
#[async_trait]
pub trait LogClient: Send + Sync {
    /// Accepts a single log entry.
    ///
    /// Returns once the entry has been handed off, which does not imply it has been delivered.
    ///
    /// # Errors
    ///
    /// If the entry cannot be accepted, such as when the client has already been stopped, an error is returned.
    async fn handle(&self, labels: LabelSet, timestamp: DateTime<Utc>, line: String) -> Result<(), GenericError>;

    /// Accepts a single log entry, returning a receipt that resolves once the entry has been delivered or dropped.
    ///
    /// Clients that hand entries off asynchronously override this to report the final outcome. By default, an entry
    /// counts as delivered as soon as [`handle`][LogClient::handle] accepts it.
    ///
    /// # Errors
    ///
    /// If the entry cannot be accepted, an error is returned.
    async fn handle_acknowledged(
        &self, labels: LabelSet, timestamp: DateTime<Utc>, line: String,
    ) -> Result<DeliveryReceipt, GenericError> {
        self.handle(labels, timestamp, line).await?;
        Ok(DeliveryReceipt::delivered())
    }

    /// Stops the client immediately.
    ///
    /// Anything buffered or in flight may be dropped.
    async fn stop(&self);

    /// Stops the client gracefully.
    ///
    /// Waits for buffered entries to be delivered, bounded by the client's shutdown timeout, after which it behaves like
    /// [`stop`][LogClient::stop].
    async fn stop_wait(&self);
}
