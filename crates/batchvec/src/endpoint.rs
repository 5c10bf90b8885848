use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use tracing::instrument;

use crate::cancel_token::CancelToken;
use crate::config::EndpointConfig;
use crate::error::{truncate_string, EmbedError};

#[derive(Debug, Clone)]
struct RetryConfig {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryConfig {
    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        // attempt is 1-based; attempt=1 => initial backoff.
        let shift = attempt.saturating_sub(1).min(16);
        let mul = 1u64 << shift;
        let backoff = self.initial_backoff.saturating_mul(mul as u32);
        std::cmp::min(backoff, self.max_backoff)
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    text: &'a str,
    truncate: bool,
}

/// HTTP embedding backend. One request carries one document; the service
/// answers with one vector per accepted chunk and only the first is kept.
#[derive(Debug)]
pub struct RemoteBackend {
    url: String,
    api_key: Option<String>,
    pub dimensions: usize,
    truncate: bool,
    client: Client,
    retry: RetryConfig,
}

impl RemoteBackend {
    pub fn new(cfg: &EndpointConfig) -> Result<Self, EmbedError> {
        if cfg.url.trim().is_empty() {
            return Err(EmbedError::Config("endpoint url must not be empty".into()));
        }
        if cfg.dimensions == 0 {
            return Err(EmbedError::Config("dimensions must be positive".into()));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            url: cfg.url.clone(),
            api_key: cfg.resolve_api_key(),
            dimensions: cfg.dimensions,
            truncate: cfg.truncate,
            client,
            retry: RetryConfig {
                max_attempts: cfg.max_attempts.max(1),
                initial_backoff: Duration::from_millis(cfg.initial_backoff_ms.max(1)),
                max_backoff: Duration::from_millis(cfg.max_backoff_ms.max(cfg.initial_backoff_ms)),
            },
        })
    }

    async fn wait_cancel_or_sleep(
        cancel: Option<&CancelToken>,
        dur: Duration,
    ) -> Result<(), EmbedError> {
        if let Some(cancel) = cancel {
            tokio::select! {
                _ = cancel.cancelled() => {
                    Err(EmbedError::Cancelled("embedding request cancelled".into()))
                }
                _ = tokio::time::sleep(dur) => Ok(()),
            }
        } else {
            tokio::time::sleep(dur).await;
            Ok(())
        }
    }

    async fn post_once(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let body = EmbedRequest {
            text,
            truncate: self.truncate,
        };
        let mut req = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let res = req.send().await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            if status.as_u16() == 413 && !self.truncate {
                return Err(EmbedError::OversizedInput(truncate_string(&body, 200)));
            }
            return Err(EmbedError::Http {
                status: status.as_u16(),
                body: truncate_string(&body, 200),
                url: self.url.clone(),
            });
        }

        let vectors = res
            .json::<Vec<Vec<f32>>>()
            .await
            .map_err(|e| EmbedError::Decode(e.to_string()))?;
        // One vector per accepted chunk; single-document usage keeps the first.
        let first = vectors
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::Decode("service returned no vectors".into()))?;
        if first.len() != self.dimensions {
            return Err(EmbedError::DimensionMismatch {
                expected: self.dimensions,
                actual: first.len(),
            });
        }
        if first.iter().any(|f| !f.is_finite()) {
            return Err(EmbedError::Decode(
                "service returned non-finite float in embedding".into(),
            ));
        }
        Ok(first)
    }

    /// Embed one document, retrying transient failures with exponential
    /// backoff. Backoff sleeps race the cancel token.
    #[instrument(skip_all, fields(len = text.len()), target = "embed-pipeline")]
    pub async fn embed_one(
        &self,
        text: &str,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<f32>, EmbedError> {
        let mut last_err: Option<EmbedError> = None;
        for attempt in 1..=self.retry.max_attempts {
            if let Some(cancel) = cancel {
                if cancel.is_cancelled() {
                    return Err(EmbedError::Cancelled("embedding request cancelled".into()));
                }
            }
            match self.post_once(text).await {
                Ok(vector) => return Ok(vector),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let backoff = self.retry.backoff_for_attempt(attempt);
                    tracing::warn!(
                        target: "embed-pipeline",
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient embedding failure; backing off"
                    );
                    Self::wait_cancel_or_sleep(cancel, backoff).await?;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| EmbedError::Network("embedding request failed".into())))
    }
}
