//! Normalizes raw provider failures into the shared [`GatewayError`] taxonomy
//! without ever surfacing a raw response body or API key.

use crate::error::GatewayError;
use crate::util::sanitize_error_for_user;

/// Classify an HTTP status code and (already-read) response body from a
/// provider call into a [`GatewayError`], logging the sanitized detail.
pub fn sanitize_api_error(status: u16, body: &str) -> GatewayError {
    let detail = sanitize_error_for_user(body);
    tracing::warn!(status, detail = %detail, "provider call failed");

    match status {
        401 | 403 => GatewayError::InvalidCredential,
        408 => GatewayError::ProviderTimeout,
        429 => GatewayError::ProviderUnavailable,
        500..=599 => GatewayError::ProviderUnavailable,
        _ => GatewayError::MalformedResponse,
    }
}

/// Classify a transport-level failure (connection reset, DNS failure, etc.)
/// from `reqwest` into a [`GatewayError`].
pub fn sanitize_transport_error(err: &reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::ProviderTimeout
    } else {
        tracing::warn!(error = %sanitize_error_for_user(&err.to_string()), "provider transport error");
        GatewayError::ProviderUnavailable
    }
}

/// Classify an `async-openai` call failure. `async-openai` never surfaces the
/// raw HTTP status on its `ApiError` variant, so unlike the other two
/// adapters this can't route through [`sanitize_api_error`]; instead it reads
/// the provider's own `type`/`code` fields the way OpenAI's API documents
/// them.
pub fn sanitize_openai_error(err: &async_openai::error::OpenAIError) -> GatewayError {
    match err {
        async_openai::error::OpenAIError::Reqwest(e) => sanitize_transport_error(e),
        async_openai::error::OpenAIError::ApiError(api_err) => {
            let marker = format!(
                "{} {}",
                api_err.r#type.as_deref().unwrap_or_default(),
                api_err.code.as_ref().map(ToString::to_string).unwrap_or_default()
            )
            .to_lowercase();
            let detail = sanitize_error_for_user(&api_err.message);
            tracing::warn!(r#type = ?api_err.r#type, code = ?api_err.code, detail = %detail, "openai call failed");

            if marker.contains("invalid_api_key") || marker.contains("incorrect_api_key") {
                GatewayError::InvalidCredential
            } else if marker.contains("insufficient_quota") || marker.contains("rate_limit") {
                GatewayError::ProviderUnavailable
            } else if marker.contains("server_error") {
                GatewayError::ProviderUnavailable
            } else {
                GatewayError::MalformedResponse
            }
        }
        other => {
            tracing::warn!(error = %other, "openai call failed");
            GatewayError::MalformedResponse
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_auth_failures_to_invalid_credential() {
        assert!(matches!(
            sanitize_api_error(401, "invalid api_key"),
            GatewayError::InvalidCredential
        ));
        assert!(matches!(
            sanitize_api_error(403, "forbidden"),
            GatewayError::InvalidCredential
        ));
    }

    #[test]
    fn maps_rate_limit_and_5xx_to_provider_unavailable() {
        assert!(matches!(
            sanitize_api_error(429, "rate limited"),
            GatewayError::ProviderUnavailable
        ));
        assert!(matches!(
            sanitize_api_error(503, "service unavailable"),
            GatewayError::ProviderUnavailable
        ));
    }

    #[test]
    fn maps_other_statuses_to_malformed_response() {
        assert!(matches!(
            sanitize_api_error(400, "bad request"),
            GatewayError::MalformedResponse
        ));
    }

    fn openai_api_error(r#type: &str, code: &str, message: &str) -> async_openai::error::OpenAIError {
        async_openai::error::OpenAIError::ApiError(async_openai::error::ApiError {
            message: message.to_string(),
            r#type: Some(r#type.to_string()),
            param: None,
            code: Some(code.to_string()),
        })
    }

    #[test]
    fn maps_openai_invalid_api_key_to_invalid_credential() {
        let err = openai_api_error("invalid_request_error", "invalid_api_key", "Incorrect API key provided");
        assert!(matches!(sanitize_openai_error(&err), GatewayError::InvalidCredential));
    }

    #[test]
    fn maps_openai_rate_limit_to_provider_unavailable() {
        let err = openai_api_error("rate_limit_error", "rate_limit_exceeded", "Rate limit reached");
        assert!(matches!(sanitize_openai_error(&err), GatewayError::ProviderUnavailable));
    }

    #[test]
    fn maps_openai_unrecognized_error_to_malformed_response() {
        let err = openai_api_error("invalid_request_error", "model_not_found", "The model does not exist");
        assert!(matches!(sanitize_openai_error(&err), GatewayError::MalformedResponse));
    }
}
