//! Single-delivery HTTP webhook client with bounded, cancellable retry.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::payload::WebhookPayload;

/// Tunables for [`WebhookClient`]. Defaults match SPEC_FULL.md section 4.4.
#[derive(Debug, Clone)]
pub struct WebhookClientConfig {
    pub http_timeout: Duration,
    pub retry_count: u32,
    pub retry_delay: Duration,
}

impl Default for WebhookClientConfig {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(30),
            retry_count: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Delivers a single webhook payload, retrying on failure with linear
/// backoff (`retry_delay * attempt`).
#[derive(Debug, Clone)]
pub struct WebhookClient {
    http: reqwest::Client,
    config: WebhookClientConfig,
}

impl WebhookClient {
    pub fn new(config: WebhookClientConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .expect("failed to build reqwest client");
        Self { http, config }
    }

    /// Send `payload` to `url`. An empty `url` is treated as "webhook not
    /// configured" and returns `Ok(())` without attempting delivery.
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        url: &str,
        payload: &WebhookPayload,
    ) -> anyhow::Result<()> {
        if url.is_empty() {
            tracing::debug!("no webhook url configured, skipping delivery");
            return Ok(());
        }

        let attempts = self.config.retry_count + 1;
        let mut last_err = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.config.retry_delay * attempt;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        anyhow::bail!("webhook delivery cancelled");
                    }
                }
            }

            match self.attempt(url, payload).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(url, attempt, error = %e, "webhook delivery attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(anyhow::anyhow!(
            "webhook delivery failed after {attempts} attempts: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        ))
    }

    async fn attempt(&self, url: &str, payload: &WebhookPayload) -> anyhow::Result<()> {
        let response = self
            .http
            .post(url)
            .header("Content-Type", "application/json")
            .header("User-Agent", "wtask-webhook/1.0")
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() >= 200 && status.as_u16() < 300 {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("webhook returned status {status}: {body}")
    }
}
