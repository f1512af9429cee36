use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use logship_config::{ClientConfiguration, Configuration};
use logship_core::{DestinationKey, LogClient};
use logship_error::{ErrorContext as _, GenericError};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::{
    batch::BatchingClient,
    buffer::BufferedClient,
    pack::PackClient,
    push::{HttpPushClient, PushClient},
};

/// Where a destination's entries are pushed to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DestinationTarget {
    /// Push endpoint.
    pub url: Url,

    /// Tenant sent with every push, unless an entry carries its own.
    pub tenant: Option<String>,
}

/// Builds the delivery chain of a destination.
#[async_trait]
pub trait ClientBuilder: Send + Sync {
    /// Builds the chain delivering to `target` on behalf of `destination`.
    ///
    /// # Errors
    ///
    /// If the chain cannot be built, an error is returned.
    async fn build(
        &self, destination: &DestinationKey, target: &DestinationTarget,
    ) -> Result<Arc<dyn LogClient>, GenericError>;
}

/// Creates the push client at the end of a chain.
pub trait PushClientFactory: Send + Sync {
    /// Creates a push client sending to `target`, giving up on a single push after `timeout`.
    ///
    /// # Errors
    ///
    /// If the client cannot be created, an error is returned.
    fn create(&self, target: &DestinationTarget, timeout: Duration) -> Result<Arc<dyn PushClient>, GenericError>;
}

/// Creates [`HttpPushClient`]s.
pub struct HttpPushClientFactory;

impl PushClientFactory for HttpPushClientFactory {
    fn create(&self, target: &DestinationTarget, timeout: Duration) -> Result<Arc<dyn PushClient>, GenericError> {
        Ok(Arc::new(HttpPushClient::new(target.url.clone(), timeout)?))
    }
}

/// Builds the standard chain: packing, optional disk buffering and batching over HTTP.
pub struct DefaultClientBuilder {
    client: ClientConfiguration,
    preserved_labels: HashSet<String>,
    push: Arc<dyn PushClientFactory>,
    shutdown: CancellationToken,
}

impl DefaultClientBuilder {
    /// Creates a new `DefaultClientBuilder` whose chains are cancelled when `shutdown` is cancelled.
    pub fn new(config: &Configuration, shutdown: CancellationToken) -> Self {
        Self::with_push_client_factory(config, shutdown, Arc::new(HttpPushClientFactory))
    }

    /// Like [`new`][Self::new], with chains ending in push clients created by `push`.
    pub fn with_push_client_factory(
        config: &Configuration, shutdown: CancellationToken, push: Arc<dyn PushClientFactory>,
    ) -> Self {
        Self {
            client: config.client.clone(),
            preserved_labels: config.plugin.preserved_labels.clone(),
            push,
            shutdown,
        }
    }
}

#[async_trait]
impl ClientBuilder for DefaultClientBuilder {
    async fn build(
        &self, destination: &DestinationKey, target: &DestinationTarget,
    ) -> Result<Arc<dyn LogClient>, GenericError> {
        let push = self
            .push
            .create(target, self.client.timeout)
            .with_error_context(|| format!("Failed to create push client for destination '{}'.", destination))?;

        let mut chain: Arc<dyn LogClient> = Arc::new(BatchingClient::new(
            destination.clone(),
            &self.client,
            push,
            target.tenant.clone(),
            &self.shutdown,
        ));

        if self.client.buffer.enabled {
            let buffered = BufferedClient::open(destination.clone(), &self.client, chain, &self.shutdown)
                .await
                .with_error_context(|| format!("Failed to open buffer for destination '{}'.", destination))?;
            chain = Arc::new(buffered);
        }

        debug!(
            destination = %destination,
            url = %target.url,
            buffered = self.client.buffer.enabled,
            "Built delivery chain."
        );

        Ok(PackClient::wrap(chain, self.preserved_labels.clone()))
    }
}
