//! Anthropic Claude adapter over raw `reqwest`, since `async-openai` has no
//! Claude support.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{estimate_tokens, sanitize, AdapterResponse, MultimodalRequest, ProviderAdapter, TextRequest};
use crate::error::{GatewayError, Result};
use crate::model::ProviderKind;
use crate::util::mask_api_key;

const API_VERSION: &str = "2023-06-01";
const BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ResponseContentBlock>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: i64,
    output_tokens: i64,
}

/// Claude adapter: a flat `(api_key, model, client)` struct over Anthropic's
/// Messages API.
pub struct ClaudeAdapter {
    api_key: String,
    model: String,
    client: Client,
}

impl std::fmt::Debug for ClaudeAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaudeAdapter")
            .field("api_key", &mask_api_key(&self.api_key))
            .field("model", &self.model)
            .finish()
    }
}

impl ClaudeAdapter {
    /// Build an adapter from a decrypted API key and resolved model id.
    #[must_use]
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder().timeout(timeout).build().unwrap_or_else(|_| Client::new());
        Self {
            api_key: api_key.into(),
            model: model.into(),
            client,
        }
    }

    async fn call(&self, req: &TextRequest, image: Option<(&[u8], &str)>) -> Result<AdapterResponse> {
        let model = if req.model.is_empty() { &self.model } else { &req.model };

        let mut blocks = Vec::new();
        if let Some((bytes, mime_type)) = image {
            blocks.push(ContentBlock::Image {
                source: ImageSource {
                    kind: "base64",
                    media_type: mime_type.to_string(),
                    data: STANDARD.encode(bytes),
                },
            });
        }
        blocks.push(ContentBlock::Text {
            text: req.prompt.clone(),
        });

        let body = AnthropicRequest {
            model: model.to_string(),
            max_tokens: if req.max_tokens == 0 { DEFAULT_MAX_TOKENS } else { req.max_tokens },
            system: req.system_prompt.clone(),
            messages: vec![AnthropicMessage { role: "user", content: blocks }],
            temperature: req.temperature,
        };

        let response = self
            .client
            .post(format!("{BASE_URL}/v1/messages"))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| sanitize::sanitize_transport_error(&e))?;

        let status = response.status();
        let text_body = response.text().await.map_err(|e| sanitize::sanitize_transport_error(&e))?;

        if !status.is_success() {
            return Err(sanitize::sanitize_api_error(status.as_u16(), &text_body));
        }

        let parsed: AnthropicResponse = serde_json::from_str(&text_body).map_err(|e| {
            tracing::warn!(error = %e, "failed to parse anthropic response");
            GatewayError::MalformedResponse
        })?;

        let text = parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                ResponseContentBlock::Text { text } => Some(text),
                ResponseContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("");

        let (input_tokens, output_tokens, estimated) = if parsed.usage.input_tokens > 0 || parsed.usage.output_tokens > 0 {
            (parsed.usage.input_tokens, parsed.usage.output_tokens, false)
        } else {
            (estimate_tokens(&req.prompt), estimate_tokens(&text), true)
        };

        Ok(AdapterResponse {
            text,
            input_tokens,
            output_tokens,
            estimated,
        })
    }
}

#[async_trait]
impl ProviderAdapter for ClaudeAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Claude
    }

    #[tracing::instrument(skip(self, req), fields(model = %req.model))]
    async fn generate_text(&self, req: TextRequest) -> Result<AdapterResponse> {
        self.call(&req, None).await
    }

    #[tracing::instrument(skip(self, req), fields(model = %req.text.model))]
    async fn generate_multimodal(&self, req: MultimodalRequest) -> Result<AdapterResponse> {
        self.call(&req.text, Some((&req.image_bytes, &req.mime_type))).await
    }

    async fn validate_credentials(&self) -> Result<bool> {
        let probe = TextRequest {
            model: self.model.clone(),
            prompt: "ping".to_string(),
            system_prompt: None,
            temperature: 0.0,
            max_tokens: 1,
        };
        match self.call(&probe, None).await {
            Ok(_) => Ok(true),
            Err(GatewayError::InvalidCredential) => Ok(false),
            Err(other) => Err(other),
        }
    }
}
