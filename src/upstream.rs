use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::error::GatewayError;
use crate::pool::{mask_key, UpstreamKeyPool};

/// Thin client for the single upstream endpoint. Issues exactly one POST
/// per call with the auth header swapped to a pool credential; the body is
/// forwarded byte-for-byte, never parsed or re-serialized.
pub struct UpstreamClient {
    client: reqwest::Client,
    messages_url: String,
    anthropic_version: String,
    pool: Arc<UpstreamKeyPool>,
}

impl UpstreamClient {
    pub fn new(
        base_url: &str,
        anthropic_version: &str,
        timeout: Duration,
        pool: Arc<UpstreamKeyPool>,
    ) -> Result<Self, GatewayError> {
        // Connection reuse is disabled to tolerate long-lived,
        // intermittently idle upstream connections.
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .timeout(timeout)
            .build()
            .map_err(|err| GatewayError::Upstream(err.to_string()))?;

        Ok(Self {
            client,
            messages_url: format!("{}/v1/messages", base_url.trim_end_matches('/')),
            anthropic_version: anthropic_version.to_string(),
            pool,
        })
    }

    pub async fn forward(
        &self,
        body: Bytes,
        stream: bool,
    ) -> Result<reqwest::Response, GatewayError> {
        let api_key = self.pool.next_key()?;
        debug!(key = %mask_key(&api_key), stream, "forwarding to upstream");

        self.client
            .post(&self.messages_url)
            .header("x-api-key", api_key)
            .header("anthropic-version", &self.anthropic_version)
            .header("content-type", "application/json")
            .header(
                "accept",
                if stream {
                    "text/event-stream"
                } else {
                    "application/json"
                },
            )
            .body(body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    GatewayError::Timeout
                } else {
                    GatewayError::Upstream(err.to_string())
                }
            })
    }
}
