//! Orchestrator facade (C8) — the single `generate` entry point that
//! composes every other component per the twelve-step call algorithm.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::adapters::{
    claude::ClaudeAdapter, gemini::GeminiAdapter, mock::MockAdapter, openai::OpenAiAdapter, with_retry,
    with_timeout, MultimodalRequest, ProviderAdapter, TextRequest,
};
use crate::cache::{CacheLayer, ContentCacheInput};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::ledger::UsageLedger;
use crate::model::{CacheScope, ProviderConfig, ProviderKind, TaskType, UsageRecord, UsageStatus, UserPlan};
use crate::quota::{Admission, QuotaManager};
use crate::registry::ProviderRegistry;
use crate::router::ModelRouter;

/// A `generate` request, mirroring §6's external interface exactly.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// The calling user's id.
    pub user_id: i64,
    /// The caller's current subscription plan.
    pub plan: UserPlan,
    /// Which declared workload this call is for.
    pub task: TaskType,
    /// The prompt text.
    pub prompt: String,
    /// Optional system/instruction prompt.
    pub system_prompt: Option<String>,
    /// Optional inline image, as `(bytes, mime_type)`.
    pub image: Option<(Vec<u8>, String)>,
    /// Sampling temperature; defaults to `0.7` when unset.
    pub temperature: Option<f32>,
    /// Maximum tokens to generate; defaults to `4096` when unset.
    pub max_tokens: Option<u32>,
    /// Force a specific provider kind instead of registry selection.
    pub provider_override: Option<ProviderKind>,
    /// Caller-supplied cache key for `session`-scope reuse across calls.
    pub cache_key: Option<String>,
}

/// The result of a successful `generate` call (§6's external interface).
#[derive(Debug, Clone)]
pub struct GenerateResponse {
    /// Generated text.
    pub response_text: String,
    /// Whether this response was served from the cache.
    pub cached: bool,
    /// Estimated cost in integer micro-USD.
    pub cost_micro_usd: i64,
    /// The model id actually used.
    pub model: String,
    /// Input tokens (provider-reported or estimated); zero on a cache hit.
    pub input_tokens: i64,
    /// Output tokens (provider-reported or estimated); zero on a cache hit.
    pub output_tokens: i64,
}

/// Constructs a live [`ProviderAdapter`] from a decrypted credential and
/// resolved model. Kept as a free function (rather than a method on
/// [`ProviderKind`]) so tests can substitute [`MockAdapter`]s per kind
/// without touching the gateway's core selection/routing logic.
fn build_adapter(kind: ProviderKind, api_key: &str, model: &str, timeout: Duration) -> Arc<dyn ProviderAdapter> {
    match kind {
        ProviderKind::OpenAi => Arc::new(OpenAiAdapter::new(api_key, model, timeout)),
        ProviderKind::Claude => Arc::new(ClaudeAdapter::new(api_key, model, timeout)),
        ProviderKind::Gemini => Arc::new(GeminiAdapter::new(api_key, model, timeout)),
    }
}

/// Optional seam for tests: when present for a given [`ProviderKind`], its
/// adapter is used in place of a freshly constructed live one.
pub type AdapterOverrides = HashMap<ProviderKind, Arc<dyn ProviderAdapter>>;

/// The Orchestrator Facade (C8). Cheaply `Clone`-able: every field is an
/// `Arc` or a plain value, so handing out a clone per inbound request is
/// free of additional connection/pool setup.
#[derive(Clone)]
pub struct GatewayFacade {
    codec: Arc<gateway_crypto::CredentialCodec>,
    registry: Arc<ProviderRegistry>,
    router: Arc<ModelRouter>,
    quota: Arc<QuotaManager>,
    cache: Arc<CacheLayer>,
    ledger: Arc<UsageLedger>,
    config: Arc<GatewayConfig>,
    /// Per-process memoization of which config ids have already passed a
    /// `validate_credentials` probe this run (§4.8 step 7, §9: modeled as an
    /// explicit injected dependency rather than a module-level singleton).
    validated_config_ids: Arc<RwLock<std::collections::HashSet<i64>>>,
    adapter_overrides: Arc<AdapterOverrides>,
}

impl GatewayFacade {
    /// Wire up a facade from its already-constructed components. All
    /// dependencies — including the encryption secret (via `codec`) and the
    /// `validated_config_ids` memoization set — are passed in explicitly.
    #[must_use]
    pub fn new(
        codec: Arc<gateway_crypto::CredentialCodec>,
        registry: Arc<ProviderRegistry>,
        router: Arc<ModelRouter>,
        quota: Arc<QuotaManager>,
        cache: Arc<CacheLayer>,
        ledger: Arc<UsageLedger>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            codec,
            registry,
            router,
            quota,
            cache,
            ledger,
            config,
            validated_config_ids: Arc::new(RwLock::new(std::collections::HashSet::new())),
            adapter_overrides: Arc::new(HashMap::new()),
        }
    }

    /// Build a facade that serves [`MockAdapter`]s in place of live provider
    /// calls, for integration tests that must not touch the network.
    #[must_use]
    pub fn with_adapter_overrides(mut self, overrides: AdapterOverrides) -> Self {
        self.adapter_overrides = Arc::new(overrides);
        self
    }

    fn resolve_adapter(&self, kind: ProviderKind, api_key: &str, model: &str) -> Arc<dyn ProviderAdapter> {
        if let Some(adapter) = self.adapter_overrides.get(&kind) {
            return adapter.clone();
        }
        build_adapter(kind, api_key, model, Duration::from_secs(self.config.policy.adapter_timeout_secs))
    }

    async fn ensure_validated(&self, config: &ProviderConfig, adapter: &Arc<dyn ProviderAdapter>) -> Result<()> {
        if config.id < 0 {
            return Ok(());
        }
        {
            let validated = self.validated_config_ids.read().await;
            if validated.contains(&config.id) {
                return Ok(());
            }
        }

        let timeout = Duration::from_secs(self.config.policy.validate_timeout_secs);
        let ok = with_timeout(timeout, adapter.validate_credentials()).await?;
        let _ = self.registry.record_test_result(config.id, ok).await;
        if !ok {
            return Err(GatewayError::InvalidCredential);
        }

        self.validated_config_ids.write().await.insert(config.id);
        Ok(())
    }

    /// Run a single `generate` call end to end (§4.8).
    ///
    /// State machine: `INIT -> CONFIG_SELECTED -> DECRYPTED -> MODEL_RESOLVED
    /// -> QUOTA_CHECKED -> (CACHE_HIT -> DONE) | CACHE_MISS -> ADAPTER_CALLED
    /// -> (SUCCESS | FAILURE) -> LEDGER_WRITTEN -> DONE`. Every terminal
    /// state writes exactly one [`UsageRecord`] before returning.
    #[instrument(skip(self, req, cancel), fields(user_id = req.user_id, task = %req.task))]
    pub async fn generate(&self, req: GenerateRequest, cancel: CancellationToken) -> Result<GenerateResponse> {
        let started = Instant::now();
        let temperature = req.temperature.unwrap_or(0.7);
        let max_tokens = req.max_tokens.unwrap_or(4096);

        // Step 1: select config.
        let selected = match req.provider_override {
            Some(kind) => self.registry.select_override(kind).await,
            None => self.registry.select_for(req.task).await,
        };
        let selected = match selected {
            Ok(s) => s,
            Err(e) => return self.fail_without_config(&req, e).await,
        };
        let config = selected.config;

        // Step 2: decrypt credential.
        let plaintext_key = match self.codec.decrypt_str(&config.api_key_ciphertext) {
            Ok(k) => k,
            Err(_) => {
                return self
                    .record_failure(&req, Some(config.id), &config.model, started, GatewayError::InvalidCredential)
                    .await
            }
        };

        // Step 3: resolve model. A config with a pinned model wins; an empty
        // `model` column defers to the plan/task router (§4.4).
        let model = if config.model.is_empty() {
            self.router.model_for(req.plan, req.task)
        } else {
            config.model.clone()
        };

        // Step 4: quota check.
        let estimate = self.config.policy.default_estimated_tokens;
        let admission = match self.quota.check(&self.ledger, req.user_id, req.plan, estimate).await {
            Ok(a) => a,
            Err(e) => return self.record_failure(&req, Some(config.id), &model, started, e).await,
        };
        if let Admission::Deny { dimension, used, limit } = admission {
            let err = GatewayError::QuotaExceeded { dimension, used, limit };
            return self.record_failure(&req, Some(config.id), &model, started, err).await;
        }
        let provider_admission = match self
            .quota
            .check_provider_cap(&self.ledger, config.id, config.daily_token_cap, config.monthly_token_cap, estimate)
            .await
        {
            Ok(a) => a,
            Err(e) => return self.record_failure(&req, Some(config.id), &model, started, e).await,
        };
        if let Admission::Deny { dimension, used, limit } = provider_admission {
            let err = GatewayError::QuotaExceeded { dimension, used, limit };
            return self.record_failure(&req, Some(config.id), &model, started, err).await;
        }

        // Step 5: cache lookup (content -> session -> system), unless the
        // caller's plan bypasses the cache entirely.
        let content_key = ContentCacheInput {
            task: req.task.as_str(),
            model: &model,
            prompt: &req.prompt,
            system_prompt: req.system_prompt.as_deref(),
            temperature,
            max_tokens,
            image_bytes: req.image.as_ref().map(|(bytes, _)| bytes.as_slice()),
        }
        .content_hash();

        if !req.plan.bypasses_cache() {
            match self.cache.lookup_through(&content_key, req.cache_key.as_deref(), req.user_id).await {
                Ok(Some(entry)) => {
                    let record = UsageRecord::new(req.user_id, Some(config.id), req.task, &model, 0, 0, 0, 0, UsageStatus::Success)
                        .with_cache_hit();
                    self.ledger.append(&record).await;
                    return Ok(GenerateResponse {
                        response_text: entry.payload,
                        cached: true,
                        cost_micro_usd: 0,
                        model,
                        input_tokens: 0,
                        output_tokens: 0,
                    });
                }
                Ok(None) => {}
                Err(e) => return self.record_failure(&req, Some(config.id), &model, started, e).await,
            }
        }

        // Step 6: instantiate adapter.
        let adapter = self.resolve_adapter(config.kind, &plaintext_key, &model);

        // Step 7: validate credentials once per process-life per config.
        if let Err(e) = self.ensure_validated(&config, &adapter).await {
            return self.record_failure(&req, Some(config.id), &model, started, e).await;
        }

        // Step 8: invoke adapter, racing the caller's cancellation signal.
        let text_request = TextRequest {
            model: model.clone(),
            prompt: req.prompt.clone(),
            system_prompt: req.system_prompt.clone(),
            temperature,
            max_tokens,
        };
        let unavailable_retries = self.config.policy.max_adapter_retries;
        let timeout_retries = self.config.policy.max_timeout_retries;
        let adapter_timeout = Duration::from_secs(self.config.policy.adapter_timeout_secs);

        let call = {
            let adapter = adapter.clone();
            let image = req.image.clone();
            let text_request = text_request.clone();
            with_timeout(adapter_timeout, with_retry(unavailable_retries, timeout_retries, move || {
                let adapter = adapter.clone();
                let image = image.clone();
                let text_request = text_request.clone();
                async move {
                    match &image {
                        Some((bytes, mime_type)) => {
                            adapter
                                .generate_multimodal(MultimodalRequest {
                                    text: text_request,
                                    image_bytes: bytes.clone(),
                                    mime_type: mime_type.clone(),
                                })
                                .await
                        }
                        None => adapter.generate_text(text_request).await,
                    }
                }
            }))
        };

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(GatewayError::Cancelled),
            result = call => result,
        };

        let response = match outcome {
            Ok(r) => r,
            Err(e) => return self.record_failure(&req, Some(config.id), &model, started, e).await,
        };

        // Step 9: post-process (latency, cost already derivable from tokens).
        let latency_ms = started.elapsed().as_millis() as i64;
        let pricing = self.config.pricing_for(&model);
        let cost = pricing.cost_micro_usd(response.input_tokens, response.output_tokens);

        // Step 10: cache store (system/freemium bypass handled above; store
        // under the content key so later callers with identical inputs hit).
        if !req.plan.bypasses_cache() {
            if let Err(e) = self.cache.put(&content_key, CacheScope::Content, None, &response.text).await {
                tracing::warn!(error = %e, user_id = req.user_id, "failed to write content cache entry, continuing");
            }
            if let Some(session_key) = &req.cache_key {
                if let Err(e) = self.cache.put(session_key, CacheScope::Session, Some(req.user_id), &response.text).await {
                    tracing::warn!(error = %e, user_id = req.user_id, "failed to write session cache entry, continuing");
                }
            }
        }

        // Step 11: ledger append.
        let record = UsageRecord::new(
            req.user_id,
            Some(config.id),
            req.task,
            &model,
            response.input_tokens,
            response.output_tokens,
            cost,
            latency_ms,
            UsageStatus::Success,
        )
        .with_estimated(response.estimated);
        self.ledger.append(&record).await;

        // Step 12: return response. `plaintext_key` drops here, at function exit.
        Ok(GenerateResponse {
            response_text: response.text,
            cached: false,
            cost_micro_usd: cost,
            model,
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
        })
    }

    async fn fail_without_config(&self, req: &GenerateRequest, err: GatewayError) -> Result<GenerateResponse> {
        self.record_failure(req, None, "", Instant::now(), err).await
    }

    async fn record_failure(
        &self,
        req: &GenerateRequest,
        provider_config_id: Option<i64>,
        model: &str,
        started: Instant,
        err: GatewayError,
    ) -> Result<GenerateResponse> {
        let status = match &err {
            GatewayError::QuotaExceeded { .. } => UsageStatus::QuotaDenied,
            GatewayError::ProviderTimeout => UsageStatus::Timeout,
            GatewayError::Cancelled => UsageStatus::Cancelled,
            _ => UsageStatus::Error,
        };
        let latency_ms = started.elapsed().as_millis() as i64;
        let record = UsageRecord::new(req.user_id, provider_config_id, req.task, model, 0, 0, 0, latency_ms, status)
            .with_error(err.kind_str(), err.to_string());
        self.ledger.append(&record).await;
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvFallbackConfig, GatewayConfig};
    use crate::registry::NewProviderConfig;

    async fn harness() -> (GatewayFacade, Arc<ProviderRegistry>) {
        let pool = crate::db::connect(":memory:").await.unwrap();
        let codec = Arc::new(gateway_crypto::CredentialCodec::new(&gateway_crypto::Secret::from_bytes([3u8; 32])));
        let registry = Arc::new(ProviderRegistry::new(pool.clone(), codec.clone(), EnvFallbackConfig::default()));
        let config = Arc::new(GatewayConfig::default());
        let router = Arc::new(ModelRouter::new(config.tiers.clone()));
        let quota = Arc::new(QuotaManager::new(QuotaManager::default_policies()));
        let cache = Arc::new(CacheLayer::new(pool.clone(), config.policy.session_cache_ttl_secs, config.policy.content_cache_ttl_secs));
        let ledger = Arc::new(UsageLedger::new(pool));

        let facade = GatewayFacade::new(codec, registry.clone(), router, quota, cache, ledger, config);
        (facade, registry)
    }

    fn request(user_id: i64, task: TaskType, plan: UserPlan) -> GenerateRequest {
        GenerateRequest {
            user_id,
            plan,
            task,
            prompt: "Extract from: https://jobs.example/1".to_string(),
            system_prompt: None,
            image: None,
            temperature: None,
            max_tokens: None,
            provider_override: None,
            cache_key: None,
        }
    }

    /// §4.8 step 7: a config is validated against the adapter at most once
    /// per process life; a second call for the same config never re-probes.
    #[tokio::test]
    async fn credential_validation_is_memoized_per_config() {
        let (facade, registry) = harness().await;
        registry
            .create(NewProviderConfig {
                kind: ProviderKind::Gemini,
                api_key: "key".to_string(),
                model: "gemini-2.5-flash".to_string(),
                display_name: "Primary".to_string(),
                description: None,
                created_by: None,
            })
            .await
            .unwrap();

        let mock = Arc::new(MockAdapter::succeeding(ProviderKind::Gemini, "text"));
        let mut overrides: AdapterOverrides = HashMap::new();
        overrides.insert(ProviderKind::Gemini, mock.clone());
        let facade = facade.with_adapter_overrides(overrides);

        let mut first = request(1, TaskType::Extraction, UserPlan::Paygo);
        first.cache_key = Some("memo-1".to_string());
        facade.generate(first, CancellationToken::new()).await.unwrap();

        let mut second = request(1, TaskType::Extraction, UserPlan::Paygo);
        second.cache_key = Some("memo-2".to_string());
        facade.generate(second, CancellationToken::new()).await.unwrap();

        assert_eq!(mock.text_call_count(), 2);
        assert_eq!(facade.validated_config_ids.read().await.len(), 1);
    }

    /// An env-fallback config (`id = -1`, never persisted) is never recorded
    /// in the per-process memoization set.
    #[tokio::test]
    async fn env_fallback_config_is_never_memoized() {
        let pool = crate::db::connect(":memory:").await.unwrap();
        let codec = Arc::new(gateway_crypto::CredentialCodec::new(&gateway_crypto::Secret::from_bytes([4u8; 32])));
        let registry = Arc::new(ProviderRegistry::new(
            pool.clone(),
            codec.clone(),
            EnvFallbackConfig {
                api_key: Some("env-key".to_string()),
                model_fast: Some("gemini-2.5-flash".to_string()),
                model_quality: None,
            },
        ));
        let config = Arc::new(GatewayConfig::default());
        let router = Arc::new(ModelRouter::new(config.tiers.clone()));
        let quota = Arc::new(QuotaManager::new(QuotaManager::default_policies()));
        let cache = Arc::new(CacheLayer::new(pool.clone(), config.policy.session_cache_ttl_secs, config.policy.content_cache_ttl_secs));
        let ledger = Arc::new(UsageLedger::new(pool));
        let facade = GatewayFacade::new(codec, registry, router, quota, cache, ledger, config);

        let mock = Arc::new(MockAdapter::succeeding(ProviderKind::Gemini, "text"));
        let mut overrides: AdapterOverrides = HashMap::new();
        overrides.insert(ProviderKind::Gemini, mock);
        let facade = facade.with_adapter_overrides(overrides);

        let req = request(1, TaskType::Extraction, UserPlan::Paygo);
        facade.generate(req, CancellationToken::new()).await.unwrap();
        assert!(facade.validated_config_ids.read().await.is_empty());
    }
}
