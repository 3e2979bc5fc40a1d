//! Provider Adapter Set (C2) — a uniform capability surface over Gemini,
//! OpenAI, and Claude.

pub mod claude;
pub mod gemini;
pub mod mock;
pub mod openai;
pub mod sanitize;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::model::ProviderKind;

/// A plain-text generation request, common across all three providers.
#[derive(Debug, Clone)]
pub struct TextRequest {
    /// The model id to call.
    pub model: String,
    /// User prompt text.
    pub prompt: String,
    /// Optional system/instruction prompt.
    pub system_prompt: Option<String>,
    /// Sampling temperature, `0.0..=2.0`.
    pub temperature: f32,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
}

/// A multimodal generation request: prompt plus a single inline image.
#[derive(Debug, Clone)]
pub struct MultimodalRequest {
    /// The underlying text request.
    pub text: TextRequest,
    /// Raw image bytes.
    pub image_bytes: Vec<u8>,
    /// Image MIME type (e.g. `image/jpeg`).
    pub mime_type: String,
}

/// A normalized adapter response.
#[derive(Debug, Clone)]
pub struct AdapterResponse {
    /// Generated text.
    pub text: String,
    /// Input/prompt tokens, provider-reported or estimated.
    pub input_tokens: i64,
    /// Output/completion tokens, provider-reported or estimated.
    pub output_tokens: i64,
    /// True when the provider did not report usage and the counts above
    /// were estimated via the tokens-per-word heuristic.
    pub estimated: bool,
}

/// The capability set every provider adapter implements (§4.2).
///
/// Adapters are flat structs over `(api_key, model_id, http_client)`,
/// stateless aside from that configuration, and safe for concurrent use.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Which provider this adapter talks to.
    fn kind(&self) -> ProviderKind;

    /// Generate a text completion.
    async fn generate_text(&self, req: TextRequest) -> Result<AdapterResponse>;

    /// Generate a completion grounded in an inline image.
    async fn generate_multimodal(&self, req: MultimodalRequest) -> Result<AdapterResponse>;

    /// Check that the configured credential is accepted by the provider.
    async fn validate_credentials(&self) -> Result<bool>;
}

/// Estimate token counts via a documented tokens-per-word heuristic, used
/// only when a provider response omits usage (§4.2). `word_count * 4/3`
/// approximates the average English subword ratio for the three supported
/// providers' tokenizers.
#[must_use]
pub fn estimate_tokens(text: &str) -> i64 {
    let words = text.split_whitespace().count() as i64;
    (words * 4) / 3
}

/// Run `call` with the crate's standard retry policy for transient provider
/// failures: bounded exponential backoff with jitter, with separate retry
/// budgets per error kind (§7): `ProviderUnavailable` gets
/// `max_unavailable_retries` (default 2), `ProviderTimeout` gets
/// `max_timeout_retries` (default 1). Every other error kind is returned
/// immediately.
pub async fn with_retry<F, Fut>(
    max_unavailable_retries: u32,
    max_timeout_retries: u32,
    mut call: F,
) -> Result<AdapterResponse>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<AdapterResponse>>,
{
    let mut backoff = backoff::ExponentialBackoff {
        initial_interval: Duration::from_millis(200),
        max_interval: Duration::from_secs(5),
        max_elapsed_time: Some(Duration::from_secs(30)),
        ..Default::default()
    };
    use backoff::backoff::Backoff;

    let mut unavailable_attempts = 0u32;
    let mut timeout_attempts = 0u32;
    loop {
        match call().await {
            Ok(resp) => return Ok(resp),
            Err(e @ GatewayError::ProviderUnavailable) => {
                if unavailable_attempts >= max_unavailable_retries {
                    return Err(e);
                }
                let Some(wait) = backoff.next_backoff() else {
                    return Err(e);
                };
                tokio::time::sleep(wait).await;
                unavailable_attempts += 1;
            }
            Err(e @ GatewayError::ProviderTimeout) => {
                if timeout_attempts >= max_timeout_retries {
                    return Err(e);
                }
                let Some(wait) = backoff.next_backoff() else {
                    return Err(e);
                };
                tokio::time::sleep(wait).await;
                timeout_attempts += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Apply the crate's default per-call timeout, mapping expiry to
/// `ProviderTimeout` (§5).
pub async fn with_timeout<T>(
    duration: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::ProviderTimeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_tokens_uses_four_thirds_ratio() {
        let text = "one two three four five six";
        assert_eq!(estimate_tokens(text), 8);
    }

    #[tokio::test]
    async fn with_retry_gives_up_after_max_unavailable_retries() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result = with_retry(2, 1, || {
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Err(GatewayError::ProviderUnavailable) }
        })
        .await;
        assert!(matches!(result, Err(GatewayError::ProviderUnavailable)));
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn with_retry_gives_up_after_one_timeout_retry() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result = with_retry(2, 1, || {
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Err(GatewayError::ProviderTimeout) }
        })
        .await;
        assert!(matches!(result, Err(GatewayError::ProviderTimeout)));
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn with_retry_does_not_retry_non_transient_errors() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result = with_retry(2, 1, || {
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Err(GatewayError::MalformedResponse) }
        })
        .await;
        assert!(matches!(result, Err(GatewayError::MalformedResponse)));
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn with_timeout_maps_expiry_to_provider_timeout() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, GatewayError>(())
        })
        .await;
        assert!(matches!(result, Err(GatewayError::ProviderTimeout)));
    }
}
