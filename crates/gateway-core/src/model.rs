//! Persistent and transient data types shared across the gateway components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One of the three supported upstream LLM providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Google Gemini.
    Gemini,
    /// OpenAI.
    OpenAi,
    /// Anthropic Claude.
    Claude,
}

impl ProviderKind {
    /// Parse the lowercase wire/DB representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gemini" => Some(Self::Gemini),
            "openai" => Some(Self::OpenAi),
            "claude" => Some(Self::Claude),
            _ => None,
        }
    }

    /// The lowercase wire/DB representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::OpenAi => "openai",
            Self::Claude => "claude",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the declared generative workloads a caller may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Structured field extraction from a job posting or document.
    Extraction,
    /// CV/resume drafting.
    CvDraft,
    /// Cover letter drafting.
    CoverLetter,
    /// Validation of a prior extraction/draft.
    Validation,
    /// Combined extraction-then-validation workload.
    ExtractionValidation,
}

impl TaskType {
    /// The lowercase wire/DB representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::CvDraft => "cv_draft",
            Self::CoverLetter => "cover_letter",
            Self::Validation => "validation",
            Self::ExtractionValidation => "extraction_validation",
        }
    }

    /// The `default_for_<task>` column name on `provider_configs`, when one exists.
    ///
    /// `extraction_validation` has no dedicated routing-hint column — the
    /// spec defines the four-task routing-hint table only over the original
    /// four task kinds — so it falls back to the registry's default-config
    /// selection step.
    #[must_use]
    pub fn default_for_column(&self) -> Option<&'static str> {
        match self {
            Self::Extraction => Some("default_for_extraction"),
            Self::CvDraft => Some("default_for_cv_draft"),
            Self::CoverLetter => Some("default_for_cover_letter"),
            Self::Validation => Some("default_for_validation"),
            Self::ExtractionValidation => None,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A caller's subscription plan, supplied by the external subscription
/// subsystem. The gateway treats it as an opaque tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserPlan {
    /// Free tier.
    Freemium,
    /// Pay-as-you-go.
    Paygo,
    /// Paid monthly subscription.
    ProMonthly,
    /// Paid annual subscription.
    ProAnnual,
}

impl UserPlan {
    /// The lowercase wire/DB representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Freemium => "freemium",
            Self::Paygo => "paygo",
            Self::ProMonthly => "pro_monthly",
            Self::ProAnnual => "pro_annual",
        }
    }

    /// Whether this plan bypasses the cache layer entirely (§4.6).
    #[must_use]
    pub fn bypasses_cache(&self) -> bool {
        matches!(self, Self::Freemium)
    }
}

impl std::fmt::Display for UserPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome status of a single `generate` attempt, recorded on its [`UsageRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageStatus {
    /// The call completed and returned a usable response.
    Success,
    /// The call failed for a reason other than quota or timeout.
    Error,
    /// The call exceeded its configured timeout.
    Timeout,
    /// The pre-call quota check denied the request.
    QuotaDenied,
    /// The caller's cancellation signal fired before completion.
    Cancelled,
}

impl UsageStatus {
    /// The lowercase wire/DB representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::QuotaDenied => "quota_denied",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse the lowercase wire/DB representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            "timeout" => Some(Self::Timeout),
            "quota_denied" => Some(Self::QuotaDenied),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Scope of a [`CacheEntry`], governing ownership and TTL defaults (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheScope {
    /// Permanent, unowned, shared across all users.
    System,
    /// Owned by a single user; short TTL.
    Session,
    /// Keyed by a content hash; medium TTL.
    Content,
}

impl CacheScope {
    /// The lowercase wire/DB representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Session => "session",
            Self::Content => "content",
        }
    }

    /// Parse the lowercase wire/DB representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "session" => Some(Self::Session),
            "content" => Some(Self::Content),
            _ => None,
        }
    }
}

/// A persisted provider configuration: credentials, routing hints, and caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Numeric identity.
    pub id: i64,
    /// Which upstream provider this config talks to.
    pub kind: ProviderKind,
    /// Provider-specific model identifier (may be a concrete model or overridden at routing).
    pub model: String,
    /// Admin-facing display name.
    pub display_name: String,
    /// Optional free-text description.
    pub description: Option<String>,
    /// Ciphertext of the provider API key; never decrypted outside a single request scope.
    #[serde(skip_serializing)]
    pub api_key_ciphertext: Vec<u8>,
    /// Whether the config is eligible for selection at all.
    pub is_active: bool,
    /// Whether this config is the provider kind's default.
    pub is_default: bool,
    /// Per-task routing-hint flags.
    pub default_for_extraction: bool,
    /// See [`Self::default_for_extraction`].
    pub default_for_cv_draft: bool,
    /// See [`Self::default_for_extraction`].
    pub default_for_cover_letter: bool,
    /// See [`Self::default_for_extraction`].
    pub default_for_validation: bool,
    /// Optional daily token cap, enforced in addition to the plan's policy limits.
    pub daily_token_cap: Option<i64>,
    /// Optional monthly token cap.
    pub monthly_token_cap: Option<i64>,
    /// Timestamp of the most recent `test()` invocation, if any.
    pub last_tested_at: Option<DateTime<Utc>>,
    /// Outcome of the most recent `test()` invocation, if any.
    pub last_test_ok: Option<bool>,
    /// Id of the admin user who created this config.
    pub created_by: Option<i64>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-modified timestamp.
    pub updated_at: DateTime<Utc>,
}

impl ProviderConfig {
    /// Redact the ciphertext for callers that still hold an owned value
    /// (the `Serialize` impl already omits it, but admin code paths that
    /// pass configs around in-process should call this before logging).
    pub fn redacted(mut self) -> Self {
        self.api_key_ciphertext.clear();
        self
    }
}

/// An append-only record of a single `generate` attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Numeric identity.
    pub id: i64,
    /// The calling user's id.
    pub user_id: i64,
    /// The provider config used, or `None` when the environment fallback was used.
    pub provider_config_id: Option<i64>,
    /// Which task kind the call was for.
    pub task: TaskType,
    /// The model identifier actually used.
    pub model: String,
    /// Input/prompt tokens.
    pub input_tokens: i64,
    /// Output/completion tokens.
    pub output_tokens: i64,
    /// `input_tokens + output_tokens`, invariant-checked at construction.
    pub total_tokens: i64,
    /// Estimated cost in integer micro-USD.
    pub cost_micro_usd: i64,
    /// Call latency in milliseconds.
    pub latency_ms: i64,
    /// Outcome of the attempt.
    pub status: UsageStatus,
    /// Short machine-readable error kind, set when `status != success`.
    pub error_kind: Option<String>,
    /// Short human-readable error message, never containing secrets or raw provider bodies.
    pub error_message: Option<String>,
    /// Whether the response came from the cache rather than a live adapter call.
    pub cache_hit: bool,
    /// Whether token counts were estimated rather than provider-reported.
    pub estimated: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl UsageRecord {
    /// Build a record, enforcing `total_tokens == input_tokens + output_tokens` by construction.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: i64,
        provider_config_id: Option<i64>,
        task: TaskType,
        model: impl Into<String>,
        input_tokens: i64,
        output_tokens: i64,
        cost_micro_usd: i64,
        latency_ms: i64,
        status: UsageStatus,
    ) -> Self {
        Self {
            id: 0,
            user_id,
            provider_config_id,
            task,
            model: model.into(),
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            cost_micro_usd,
            latency_ms,
            status,
            error_kind: None,
            error_message: None,
            cache_hit: false,
            estimated: false,
            created_at: Utc::now(),
        }
    }

    /// Attach an error kind/message (for non-success statuses).
    #[must_use]
    pub fn with_error(mut self, kind: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_kind = Some(kind.into());
        self.error_message = Some(message.into());
        self
    }

    /// Mark this record as a cache hit.
    #[must_use]
    pub fn with_cache_hit(mut self) -> Self {
        self.cache_hit = true;
        self
    }

    /// Mark token counts as estimated rather than provider-reported.
    #[must_use]
    pub fn with_estimated(mut self, estimated: bool) -> Self {
        self.estimated = estimated;
        self
    }
}

/// A cached response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Opaque cache key (hex content hash, or caller-supplied string).
    pub cache_key: String,
    /// Cache scope.
    pub scope: CacheScope,
    /// Owning user id; required for `session` scope, absent otherwise.
    pub user_id: Option<i64>,
    /// Serialized response payload.
    pub payload: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Expiry timestamp; `None` means it never expires (only valid for `system`).
    pub expires_at: Option<DateTime<Utc>>,
    /// Number of times this entry has been served from a lookup.
    pub hit_count: i64,
}

/// Per-model pricing, in micro-USD per million tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Cost per million input tokens, in micro-USD.
    pub input_price_per_million: i64,
    /// Cost per million output tokens, in micro-USD.
    pub output_price_per_million: i64,
}

impl ModelPricing {
    /// Compute the micro-USD cost of a call with the given token counts.
    ///
    /// Monotonic in both `input_tokens` and `output_tokens` (Testable Property 8).
    #[must_use]
    pub fn cost_micro_usd(&self, input_tokens: i64, output_tokens: i64) -> i64 {
        (input_tokens * self.input_price_per_million + output_tokens * self.output_price_per_million)
            / 1_000_000
    }
}

/// Per-plan quota policy: daily/monthly token budgets and hourly call cap.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuotaPolicy {
    /// Total tokens allowed per UTC calendar day.
    pub daily_token_limit: i64,
    /// Total tokens allowed per UTC calendar month.
    pub monthly_token_limit: i64,
    /// Successful calls allowed in a rolling 60-minute window.
    pub hourly_call_limit: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_round_trips() {
        for k in [ProviderKind::Gemini, ProviderKind::OpenAi, ProviderKind::Claude] {
            assert_eq!(ProviderKind::parse(k.as_str()), Some(k));
        }
    }

    #[test]
    fn usage_record_enforces_total_tokens() {
        let r = UsageRecord::new(1, Some(1), TaskType::Extraction, "m", 100, 50, 0, 10, UsageStatus::Success);
        assert_eq!(r.total_tokens, 150);
    }

    #[test]
    fn pricing_is_monotonic() {
        let p = ModelPricing {
            input_price_per_million: 100,
            output_price_per_million: 300,
        };
        let base = p.cost_micro_usd(1000, 1000);
        assert!(p.cost_micro_usd(2000, 1000) >= base);
        assert!(p.cost_micro_usd(1000, 2000) >= base);
    }

    #[test]
    fn task_type_default_column_missing_for_extraction_validation() {
        assert!(TaskType::ExtractionValidation.default_for_column().is_none());
        assert!(TaskType::Extraction.default_for_column().is_some());
    }
}
