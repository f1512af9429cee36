use std::time::Duration;

use async_trait::async_trait;
use logship_error::{ErrorContext as _, GenericError};
use reqwest::{header::CONTENT_TYPE, StatusCode};
use snafu::ResultExt as _;
use tracing::trace;
use url::Url;

use super::{Encode, PushClient, PushError, PushRequest};

const TENANT_HEADER: &str = "X-Scope-OrgID";

/// Pushes requests to an HTTP endpoint as JSON.
///
/// Server errors (5xx), throttling (429) and transport failures are reported as transient. Every other non-success
/// status is reported as a rejection.
pub struct HttpPushClient {
    client: reqwest::Client,
    url: Url,
}

impl HttpPushClient {
    /// Creates a new `HttpPushClient` targeting `url`, where every request is bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// If the underlying HTTP client cannot be built, an error is returned.
    pub fn new(url: Url, timeout: Duration) -> Result<Self, GenericError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .error_context("Failed to build HTTP client.")?;

        Ok(Self { client, url })
    }
}

#[async_trait]
impl PushClient for HttpPushClient {
    async fn push(&self, request: &PushRequest) -> Result<(), PushError> {
        let body = request.to_json().context(Encode)?;

        let mut builder = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(tenant) = &request.tenant {
            builder = builder.header(TENANT_HEADER, tenant);
        }

        let response = builder.send().await.map_err(|e| PushError::Transient {
            reason: e.to_string(),
        })?;

        let status = response.status();
        trace!(url = %self.url, %status, entries = request.entry_count(), "Push completed.");
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(PushError::Transient {
                reason: format!("status {}: {}", status, body),
            })
        } else {
            Err(PushError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}
