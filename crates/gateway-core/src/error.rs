//! Error taxonomy for the gateway.

use thiserror::Error;

/// Gateway error kinds, surfaced by [`crate::facade::GatewayFacade::generate`]
/// and the admin-facing [`crate::registry::ProviderRegistry`] operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The registry has no active config and the environment fallback lacks a key.
    #[error("no provider configured")]
    NoProviderConfigured,

    /// The codec failed to decrypt a credential, or `validate_credentials` returned false.
    #[error("invalid credential")]
    InvalidCredential,

    /// A pre-call quota check denied the request.
    #[error("quota exceeded: {dimension} used={used} limit={limit}")]
    QuotaExceeded {
        /// Which budget dimension was exceeded (`daily`, `monthly`, `hourly`, `provider`).
        dimension: String,
        /// Usage observed at check time, in the dimension's unit.
        used: i64,
        /// The configured limit for that dimension.
        limit: i64,
    },

    /// The adapter surfaced a transport error, 5xx, or rate limit from the provider.
    #[error("provider unavailable")]
    ProviderUnavailable,

    /// The adapter call exceeded its configured timeout.
    #[error("provider timeout")]
    ProviderTimeout,

    /// The adapter returned a non-text or unparseable payload.
    #[error("malformed response from provider")]
    MalformedResponse,

    /// The caller's cancellation signal fired before the call completed.
    #[error("cancelled")]
    Cancelled,

    /// A persistence-layer failure that is not safe to silently swallow
    /// (used by registry/admin operations; the request path on the ledger
    /// and cache always degrades instead of raising this).
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// A configuration value was missing or malformed at startup.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl GatewayError {
    /// The short, stable string used as `UsageRecord.error_kind`.
    #[must_use]
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::NoProviderConfigured => "no_provider_configured",
            Self::InvalidCredential => "invalid_credential",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::ProviderUnavailable => "provider_unavailable",
            Self::ProviderTimeout => "provider_timeout",
            Self::MalformedResponse => "malformed_response",
            Self::Cancelled => "cancelled",
            Self::Storage(_) => "storage_error",
            Self::Configuration(_) => "configuration_error",
        }
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GatewayError>;
