//! OpenAI adapter, backed by `async-openai`.

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImage,
    ChatCompletionRequestMessageContentPartText, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessage,
    ChatCompletionRequestUserMessageContent, ChatCompletionRequestUserMessageContentPart,
    CreateChatCompletionRequestArgs, ImageUrl,
};
use async_openai::Client;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};

use super::{estimate_tokens, sanitize, AdapterResponse, MultimodalRequest, ProviderAdapter, TextRequest};
use crate::error::{GatewayError, Result};
use crate::model::ProviderKind;
use crate::util::mask_api_key;

/// OpenAI chat-completion adapter: a flat `(api_key, model, client)` struct,
/// constructed fresh per call from a just-decrypted credential.
pub struct OpenAiAdapter {
    model: String,
    client: Client<OpenAIConfig>,
}

impl std::fmt::Debug for OpenAiAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiAdapter").field("model", &self.model).finish()
    }
}

impl OpenAiAdapter {
    /// Build an adapter from a decrypted API key and resolved model id.
    #[must_use]
    pub fn new(api_key: &str, model: impl Into<String>, timeout: Duration) -> Self {
        tracing::debug!(api_key = %mask_api_key(api_key), "building openai adapter");
        let config = OpenAIConfig::new().with_api_key(api_key);

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        // The orchestrator's own retry/timeout wrapping handles call-level
        // retries; cap async-openai's internal backoff to the same window
        // instead of its 15-minute default.
        let backoff = backoff::ExponentialBackoff {
            max_elapsed_time: Some(timeout),
            ..Default::default()
        };

        Self {
            model: model.into(),
            client: Client::build(http_client, config, backoff),
        }
    }

    fn user_message(req: &TextRequest, image: Option<(&[u8], &str)>) -> ChatCompletionRequestMessage {
        match image {
            None => ChatCompletionRequestUserMessage {
                content: ChatCompletionRequestUserMessageContent::Text(req.prompt.clone()),
                name: None,
            }
            .into(),
            Some((bytes, mime_type)) => {
                let mut parts: Vec<ChatCompletionRequestUserMessageContentPart> = Vec::new();
                if !req.prompt.is_empty() {
                    parts.push(ChatCompletionRequestUserMessageContentPart::Text(
                        ChatCompletionRequestMessageContentPartText {
                            text: req.prompt.clone(),
                        },
                    ));
                }
                let data_uri = format!("data:{mime_type};base64,{}", STANDARD.encode(bytes));
                parts.push(ChatCompletionRequestUserMessageContentPart::ImageUrl(
                    ChatCompletionRequestMessageContentPartImage {
                        image_url: ImageUrl {
                            url: data_uri,
                            detail: None,
                        },
                    },
                ));
                ChatCompletionRequestUserMessage {
                    content: ChatCompletionRequestUserMessageContent::Array(parts),
                    name: None,
                }
                .into()
            }
        }
    }

    fn messages(req: &TextRequest, image: Option<(&[u8], &str)>) -> Vec<ChatCompletionRequestMessage> {
        let mut messages = Vec::new();
        if let Some(system) = &req.system_prompt {
            messages.push(
                ChatCompletionRequestSystemMessage {
                    content: ChatCompletionRequestSystemMessageContent::Text(system.clone()),
                    name: None,
                }
                .into(),
            );
        }
        messages.push(Self::user_message(req, image));
        messages
    }

    async fn call(&self, req: &TextRequest, image: Option<(&[u8], &str)>) -> Result<AdapterResponse> {
        let model = if req.model.is_empty() { &self.model } else { &req.model };
        let request = CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages(Self::messages(req, image))
            .temperature(req.temperature)
            .max_tokens(req.max_tokens)
            .build()
            .map_err(|e| {
                tracing::warn!(error = %e, "failed to build openai request");
                GatewayError::MalformedResponse
            })?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| sanitize::sanitize_openai_error(&e))?;

        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(GatewayError::MalformedResponse)?;

        let (input_tokens, output_tokens, estimated) = match response.usage {
            Some(usage) => (i64::from(usage.prompt_tokens), i64::from(usage.completion_tokens), false),
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
impl ProviderAdapter for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
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
