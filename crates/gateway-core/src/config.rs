//! Gateway-wide configuration, loaded from environment variables (via `dotenvy`)
//! and layered through the `config` crate.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::model::ModelPricing;

/// Symbolic model tiers resolved by the [`crate::router::ModelRouter`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Concrete model id behind `fast-tier`.
    pub fast_tier_model: String,
    /// Concrete model id behind `quality-tier`.
    pub quality_tier_model: String,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            fast_tier_model: "gemini-2.5-flash".to_string(),
            quality_tier_model: "gemini-1.5-pro".to_string(),
        }
    }
}

/// Environment-variable fallback used when the registry has no usable config (§4.3 step 4).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EnvFallbackConfig {
    /// API key for the synthesized ephemeral config, if set.
    pub api_key: Option<String>,
    /// Model id used for fast-tier resolution in the fallback config.
    pub model_fast: Option<String>,
    /// Model id used for quality-tier resolution in the fallback config.
    pub model_quality: Option<String>,
}

/// Policy knobs that do not fit the static pricing/quota tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Default estimated request size, in tokens, used by the quota pre-check.
    pub default_estimated_tokens: i64,
    /// Default adapter call timeout, in seconds.
    pub adapter_timeout_secs: u64,
    /// Default credential-validation timeout, in seconds.
    pub validate_timeout_secs: u64,
    /// Default TTL for `session`-scope cache entries, in seconds.
    pub session_cache_ttl_secs: i64,
    /// Default TTL for `content`-scope cache entries, in seconds.
    pub content_cache_ttl_secs: i64,
    /// Maximum adapter retries on `ProviderUnavailable` (§7: default 2).
    pub max_adapter_retries: u32,
    /// Maximum adapter retries on `ProviderTimeout` (§7: default 1).
    pub max_timeout_retries: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default_estimated_tokens: 1_000,
            adapter_timeout_secs: 30,
            validate_timeout_secs: 10,
            session_cache_ttl_secs: 3_600,
            content_cache_ttl_secs: 86_400,
            max_adapter_retries: 2,
            max_timeout_retries: 1,
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Path to the SQLite database file (or `:memory:`).
    pub database_path: String,
    /// Model tier resolution.
    pub tiers: TierConfig,
    /// Environment fallback values.
    pub env_fallback: EnvFallbackConfig,
    /// Policy knobs.
    pub policy: PolicyConfig,
    /// Static per-model pricing table, in micro-USD per million tokens.
    pub pricing: HashMap<String, ModelPricing>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            database_path: "gateway.db".to_string(),
            tiers: TierConfig::default(),
            env_fallback: EnvFallbackConfig::default(),
            policy: PolicyConfig::default(),
            pricing: default_pricing_table(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from the process environment, having first loaded
    /// a `.env` file if present, then layering the named fallback variables
    /// over the embedded defaults through `config::Config::builder()`
    /// (mirrors the teacher's `dotenvy::dotenv().ok()` then layered-source
    /// pattern). The fallback variables target both a tier default and the
    /// env-fallback config, which don't share a key path, so each is applied
    /// as an explicit override rather than through a single `Environment` source.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let defaults = serde_json::to_string(&Self::default())
            .map_err(|e| GatewayError::Configuration(format!("failed to serialize defaults: {e}")))?;

        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(&defaults, config::FileFormat::Json));

        let overlay_err = |e: config::ConfigError| GatewayError::Configuration(format!("failed to apply override: {e}"));

        if let Ok(path) = std::env::var("GATEWAY_DATABASE_PATH") {
            builder = builder.set_override("database_path", path).map_err(overlay_err)?;
        }
        if let Ok(v) = std::env::var("PROVIDER_DEFAULT_MODEL_FAST") {
            builder = builder.set_override("tiers.fast_tier_model", v.clone()).map_err(overlay_err)?;
            builder = builder.set_override("env_fallback.model_fast", v).map_err(overlay_err)?;
        }
        if let Ok(v) = std::env::var("PROVIDER_DEFAULT_MODEL_QUALITY") {
            builder = builder.set_override("tiers.quality_tier_model", v.clone()).map_err(overlay_err)?;
            builder = builder.set_override("env_fallback.model_quality", v).map_err(overlay_err)?;
        }
        if let Ok(v) = std::env::var("PROVIDER_DEFAULT_API_KEY") {
            builder = builder.set_override("env_fallback.api_key", v).map_err(overlay_err)?;
        }

        builder
            .build()
            .map_err(|e| GatewayError::Configuration(format!("failed to build configuration: {e}")))?
            .try_deserialize()
            .map_err(|e| GatewayError::Configuration(format!("failed to deserialize configuration: {e}")))
    }

    /// Load the process-wide encryption secret from `ENCRYPTION_SECRET`.
    pub fn load_secret() -> Result<gateway_crypto::Secret> {
        let raw = std::env::var("ENCRYPTION_SECRET").map_err(|_| {
            GatewayError::Configuration("ENCRYPTION_SECRET is not set".to_string())
        })?;
        gateway_crypto::Secret::parse(&raw)
            .map_err(|e| GatewayError::Configuration(format!("ENCRYPTION_SECRET: {e}")))
    }

    /// Look up pricing for a model id, falling back to the fast-tier model's
    /// pricing if the exact id is not in the table (keeps routing overrides
    /// and tier aliases from producing a missing-pricing panic downstream).
    #[must_use]
    pub fn pricing_for(&self, model: &str) -> ModelPricing {
        self.pricing
            .get(model)
            .copied()
            .or_else(|| self.pricing.get(&self.tiers.fast_tier_model).copied())
            .unwrap_or(ModelPricing {
                input_price_per_million: 0,
                output_price_per_million: 0,
            })
    }
}

fn default_pricing_table() -> HashMap<String, ModelPricing> {
    let mut table = HashMap::new();
    table.insert(
        "gemini-2.5-flash".to_string(),
        ModelPricing {
            input_price_per_million: 75_000,
            output_price_per_million: 300_000,
        },
    );
    table.insert(
        "gemini-1.5-pro".to_string(),
        ModelPricing {
            input_price_per_million: 1_250_000,
            output_price_per_million: 5_000_000,
        },
    );
    table.insert(
        "gpt-4o".to_string(),
        ModelPricing {
            input_price_per_million: 2_500_000,
            output_price_per_million: 10_000_000,
        },
    );
    table.insert(
        "claude-3-5-sonnet".to_string(),
        ModelPricing {
            input_price_per_million: 3_000_000,
            output_price_per_million: 15_000_000,
        },
    );
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_pricing_for_default_tiers() {
        let cfg = GatewayConfig::default();
        assert!(cfg.pricing.contains_key(&cfg.tiers.fast_tier_model));
        assert!(cfg.pricing.contains_key(&cfg.tiers.quality_tier_model));
    }

    #[test]
    fn pricing_for_unknown_model_falls_back() {
        let cfg = GatewayConfig::default();
        let p = cfg.pricing_for("totally-unknown-model");
        assert_eq!(p.input_price_per_million, cfg.pricing[&cfg.tiers.fast_tier_model].input_price_per_million);
    }
}
