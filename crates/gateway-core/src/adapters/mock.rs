//! In-memory mock adapter for facade-level tests that must not hit the network.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{AdapterResponse, MultimodalRequest, ProviderAdapter, TextRequest};
use crate::error::{GatewayError, Result};
use crate::model::ProviderKind;

/// Scripted behavior for a [`MockAdapter`] call.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Return a canned successful response.
    Succeed {
        /// Text to return.
        text: String,
        /// Input tokens to report.
        input_tokens: i64,
        /// Output tokens to report.
        output_tokens: i64,
    },
    /// Fail with a specific error.
    Fail(fn() -> GatewayError),
}

/// A provider adapter backed by a scripted, in-memory behavior instead of a
/// real HTTP call. Tracks how many times each method was invoked so tests
/// can assert on call counts (e.g. that a cache hit never reaches the adapter).
pub struct MockAdapter {
    kind: ProviderKind,
    behavior: Mutex<MockBehavior>,
    text_calls: AtomicUsize,
    multimodal_calls: AtomicUsize,
    validate_result: AtomicBool,
}

impl MockAdapter {
    /// Build a mock that always succeeds with fixed text and token counts.
    #[must_use]
    pub fn succeeding(kind: ProviderKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            behavior: Mutex::new(MockBehavior::Succeed {
                text: text.into(),
                input_tokens: 100,
                output_tokens: 50,
            }),
            text_calls: AtomicUsize::new(0),
            multimodal_calls: AtomicUsize::new(0),
            validate_result: AtomicBool::new(true),
        }
    }

    /// Build a mock that always fails with the given error.
    #[must_use]
    pub fn failing(kind: ProviderKind, error: fn() -> GatewayError) -> Self {
        Self {
            kind,
            behavior: Mutex::new(MockBehavior::Fail(error)),
            text_calls: AtomicUsize::new(0),
            multimodal_calls: AtomicUsize::new(0),
            validate_result: AtomicBool::new(true),
        }
    }

    /// Whether `validate_credentials` should report success.
    #[must_use]
    pub fn with_validate_result(self, ok: bool) -> Self {
        self.validate_result.store(ok, Ordering::SeqCst);
        self
    }

    /// Flip what `validate_credentials` reports, for tests that simulate a
    /// credential rotation partway through a scenario.
    pub fn set_validate_result(&self, ok: bool) {
        self.validate_result.store(ok, Ordering::SeqCst);
    }

    /// Number of `generate_text` calls observed so far.
    pub fn text_call_count(&self) -> usize {
        self.text_calls.load(Ordering::SeqCst)
    }

    /// Number of `generate_multimodal` calls observed so far.
    pub fn multimodal_call_count(&self) -> usize {
        self.multimodal_calls.load(Ordering::SeqCst)
    }

    fn respond(&self) -> Result<AdapterResponse> {
        match &*self.behavior.lock().unwrap() {
            MockBehavior::Succeed {
                text,
                input_tokens,
                output_tokens,
            } => Ok(AdapterResponse {
                text: text.clone(),
                input_tokens: *input_tokens,
                output_tokens: *output_tokens,
                estimated: false,
            }),
            MockBehavior::Fail(make_err) => Err(make_err()),
        }
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn generate_text(&self, _req: TextRequest) -> Result<AdapterResponse> {
        self.text_calls.fetch_add(1, Ordering::SeqCst);
        self.respond()
    }

    async fn generate_multimodal(&self, _req: MultimodalRequest) -> Result<AdapterResponse> {
        self.multimodal_calls.fetch_add(1, Ordering::SeqCst);
        self.respond()
    }

    async fn validate_credentials(&self) -> Result<bool> {
        Ok(self.validate_result.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn succeeding_mock_counts_calls() {
        let mock = MockAdapter::succeeding(ProviderKind::Gemini, "hello");
        let req = TextRequest {
            model: "m".to_string(),
            prompt: "p".to_string(),
            system_prompt: None,
            temperature: 0.7,
            max_tokens: 100,
        };
        mock.generate_text(req).await.unwrap();
        assert_eq!(mock.text_call_count(), 1);
        assert_eq!(mock.multimodal_call_count(), 0);
    }

    #[tokio::test]
    async fn failing_mock_returns_configured_error() {
        let mock = MockAdapter::failing(ProviderKind::OpenAi, || GatewayError::ProviderUnavailable);
        let req = TextRequest {
            model: "m".to_string(),
            prompt: "p".to_string(),
            system_prompt: None,
            temperature: 0.7,
            max_tokens: 100,
        };
        let result = mock.generate_text(req).await;
        assert!(matches!(result, Err(GatewayError::ProviderUnavailable)));
    }
}
