use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{info, warn};

use parley_core::config::RetryConfig;
use parley_core::error::{ParleyError, Result};
use parley_core::traits::LanguageModel;
use parley_core::types::*;

/// A language model that retries transient failures and then falls back to
/// alternative models in order.
pub struct RetryingClient {
    primary: Box<dyn LanguageModel>,
    fallbacks: Vec<(String, Box<dyn LanguageModel>)>,
    retry_config: RetryConfig,
}

impl RetryingClient {
    pub fn new(
        primary: Box<dyn LanguageModel>,
        fallbacks: Vec<(String, Box<dyn LanguageModel>)>,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            primary,
            fallbacks,
            retry_config,
        }
    }
}

fn is_retryable(e: &ParleyError) -> bool {
    match e {
        ParleyError::LlmRequest(msg) => {
            let msg = msg.to_lowercase();
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("timeout")
                || msg.contains("timed out")
                || msg.contains("connection")
        }
        ParleyError::Timeout { .. } => true,
        _ => false,
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl LanguageModel for RetryingClient {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<Completion>> {
        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;

            let mut last_err = None;
            for attempt in 0..=max_retries {
                match self.primary.complete(request.clone()).await {
                    Ok(completion) => return Ok(completion),
                    Err(e) => {
                        if is_retryable(&e) && attempt < max_retries {
                            let backoff = calculate_backoff(attempt, &self.retry_config);
                            warn!(
                                attempt = attempt + 1,
                                max_retries,
                                backoff_ms = backoff.as_millis() as u64,
                                error = %e,
                                "Retrying model request"
                            );
                            tokio::time::sleep(backoff).await;
                            last_err = Some(e);
                            continue;
                        }
                        last_err = Some(e);
                        break;
                    }
                }
            }

            if !self.fallbacks.is_empty() {
                info!("Primary model exhausted, trying fallback models");
            }
            for (label, client) in &self.fallbacks {
                match client.complete(request.clone()).await {
                    Ok(completion) => {
                        info!(model = %label, "Fell back to alternative model");
                        return Ok(completion);
                    }
                    Err(e) => {
                        warn!(model = %label, error = %e, "Fallback model also failed");
                    }
                }
            }

            Err(last_err.unwrap_or_else(|| ParleyError::LlmRequest("All models failed".into())))
        })
    }
}
