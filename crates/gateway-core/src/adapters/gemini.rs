//! Google Gemini adapter over raw `reqwest`, calling the Generative Language
//! REST API directly (no gRPC/Vertex dependency).

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{estimate_tokens, sanitize, AdapterResponse, MultimodalRequest, ProviderAdapter, TextRequest};
use crate::error::{GatewayError, Result};
use crate::model::ProviderKind;
use crate::util::mask_api_key;

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
    Text { text: String },
    InlineData { #[serde(rename = "inlineData")] inline_data: InlineData },
}

#[derive(Debug, Serialize)]
struct InlineData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: i64,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: i64,
}

/// Gemini adapter: a flat `(api_key, model, client)` struct over the
/// Generative Language REST API's `generateContent` endpoint.
pub struct GeminiAdapter {
    api_key: String,
    model: String,
    client: Client,
}

impl std::fmt::Debug for GeminiAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiAdapter")
            .field("api_key", &mask_api_key(&self.api_key))
            .field("model", &self.model)
            .finish()
    }
}

impl GeminiAdapter {
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

        let mut parts = vec![Part::Text { text: req.prompt.clone() }];
        if let Some((bytes, mime_type)) = image {
            parts.push(Part::InlineData {
                inline_data: InlineData {
                    mime_type: mime_type.to_string(),
                    data: STANDARD.encode(bytes),
                },
            });
        }

        let body = GenerateContentRequest {
            contents: vec![Content { role: "user", parts }],
            system_instruction: req.system_prompt.clone().map(|text| Content {
                role: "user",
                parts: vec![Part::Text { text }],
            }),
            generation_config: GenerationConfig {
                temperature: req.temperature,
                max_output_tokens: req.max_tokens,
            },
        };

        let url = format!("{BASE_URL}/models/{model}:generateContent?key={}", self.api_key);
        let response = self
            .client
            .post(url)
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

        let parsed: GenerateContentResponse = serde_json::from_str(&text_body).map_err(|e| {
            tracing::warn!(error = %e, "failed to parse gemini response");
            GatewayError::MalformedResponse
        })?;

        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect::<Vec<_>>().join(""))
            .ok_or(GatewayError::MalformedResponse)?;

        let (input_tokens, output_tokens, estimated) = match parsed.usage_metadata {
            Some(usage) => (usage.prompt_token_count, usage.candidates_token_count, false),
            None => (estimate_tokens(&req.prompt), estimate_tokens(&text), true),
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
impl ProviderAdapter for GeminiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
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
