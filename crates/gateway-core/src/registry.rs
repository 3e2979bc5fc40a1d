//! Provider registry & credential vault (C3).

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::instrument;

use crate::error::{GatewayError, Result};
use crate::model::{ProviderConfig, ProviderKind, TaskType};

/// Partial update applied to an existing [`ProviderConfig`].
///
/// Fields left as `None` keep their stored value — in particular, omitting
/// `api_key` preserves the existing credential (§3 invariant).
#[derive(Debug, Clone, Default)]
pub struct ProviderConfigUpdate {
    /// New plaintext API key, if rotating credentials.
    pub api_key: Option<String>,
    /// New model id.
    pub model: Option<String>,
    /// New display name.
    pub display_name: Option<String>,
    /// New description.
    pub description: Option<Option<String>>,
    /// New active flag.
    pub is_active: Option<bool>,
    /// New default flag (clears the flag on all other configs of the same kind).
    pub is_default: Option<bool>,
    /// New per-task routing flags (clears the flag on all other configs of the same kind).
    pub default_for_extraction: Option<bool>,
    /// See [`Self::default_for_extraction`].
    pub default_for_cv_draft: Option<bool>,
    /// See [`Self::default_for_extraction`].
    pub default_for_cover_letter: Option<bool>,
    /// See [`Self::default_for_extraction`].
    pub default_for_validation: Option<bool>,
    /// New daily token cap.
    pub daily_token_cap: Option<Option<i64>>,
    /// New monthly token cap.
    pub monthly_token_cap: Option<Option<i64>>,
}

/// Fields required to create a new [`ProviderConfig`].
#[derive(Debug, Clone)]
pub struct NewProviderConfig {
    /// Upstream provider kind.
    pub kind: ProviderKind,
    /// Plaintext API key, encrypted before storage.
    pub api_key: String,
    /// Provider-specific model id.
    pub model: String,
    /// Admin-facing display name.
    pub display_name: String,
    /// Optional free-text description.
    pub description: Option<String>,
    /// Id of the creating admin user.
    pub created_by: Option<i64>,
}

/// Outcome of [`ProviderRegistry::test`].
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Whether `validate_credentials` returned true.
    pub ok: bool,
    /// Human-readable detail (never contains the raw key).
    pub detail: String,
    /// When the test ran.
    pub tested_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct ProviderConfigRow {
    id: i64,
    kind: String,
    model: String,
    display_name: String,
    description: Option<String>,
    api_key_ciphertext: Vec<u8>,
    is_active: bool,
    is_default: bool,
    default_for_extraction: bool,
    default_for_cv_draft: bool,
    default_for_cover_letter: bool,
    default_for_validation: bool,
    daily_token_cap: Option<i64>,
    monthly_token_cap: Option<i64>,
    last_tested_at: Option<DateTime<Utc>>,
    last_test_ok: Option<bool>,
    created_by: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ProviderConfigRow> for ProviderConfig {
    type Error = GatewayError;

    fn try_from(row: ProviderConfigRow) -> Result<Self> {
        let kind = ProviderKind::parse(&row.kind).ok_or_else(|| {
            GatewayError::Configuration(format!("unknown provider kind in row: {}", row.kind))
        })?;
        Ok(ProviderConfig {
            id: row.id,
            kind,
            model: row.model,
            display_name: row.display_name,
            description: row.description,
            api_key_ciphertext: row.api_key_ciphertext,
            is_active: row.is_active,
            is_default: row.is_default,
            default_for_extraction: row.default_for_extraction,
            default_for_cv_draft: row.default_for_cv_draft,
            default_for_cover_letter: row.default_for_cover_letter,
            default_for_validation: row.default_for_validation,
            daily_token_cap: row.daily_token_cap,
            monthly_token_cap: row.monthly_token_cap,
            last_tested_at: row.last_tested_at,
            last_test_ok: row.last_test_ok,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// An ephemeral, unpersisted config synthesized from environment variables
/// when the registry has no usable row (§4.3 step 4). `id` is always `None`,
/// which downstream code treats as the `config_source=env` marker.
#[derive(Debug, Clone)]
pub struct SelectedConfig {
    /// The resolved config, `None` only for the synthesized env fallback's identity.
    pub config: ProviderConfig,
    /// True when this config was synthesized from the environment rather than read from storage.
    pub from_env_fallback: bool,
}

/// CRUD over persisted provider configurations, and selection of the active
/// config for a call (§4.3).
pub struct ProviderRegistry {
    pool: SqlitePool,
    codec: std::sync::Arc<gateway_crypto::CredentialCodec>,
    env_fallback: crate::config::EnvFallbackConfig,
}

impl ProviderRegistry {
    /// Construct a registry over `pool`, encrypting/decrypting credentials with `codec`.
    #[must_use]
    pub fn new(
        pool: SqlitePool,
        codec: std::sync::Arc<gateway_crypto::CredentialCodec>,
        env_fallback: crate::config::EnvFallbackConfig,
    ) -> Self {
        Self {
            pool,
            codec,
            env_fallback,
        }
    }

    /// List all configs, ciphertext never decrypted (Testable Property 3).
    pub async fn list_configs(&self) -> Result<Vec<ProviderConfig>> {
        let rows: Vec<ProviderConfigRow> =
            sqlx::query_as("SELECT * FROM provider_configs ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Fetch a single config by id.
    pub async fn get_config(&self, id: i64) -> Result<Option<ProviderConfig>> {
        let row: Option<ProviderConfigRow> =
            sqlx::query_as("SELECT * FROM provider_configs WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// Create a new config, encrypting the plaintext API key at rest.
    #[instrument(skip(self, new), fields(kind = %new.kind))]
    pub async fn create(&self, new: NewProviderConfig) -> Result<ProviderConfig> {
        let ciphertext = self
            .codec
            .encrypt_str(&new.api_key)
            .map_err(|_| GatewayError::InvalidCredential)?;
        let now = Utc::now();

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO provider_configs
                (kind, model, display_name, description, api_key_ciphertext,
                 is_active, is_default, created_by, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 1, 0, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(new.kind.as_str())
        .bind(&new.model)
        .bind(&new.display_name)
        .bind(&new.description)
        .bind(&ciphertext)
        .bind(new.created_by)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        self.get_config(id)
            .await?
            .ok_or_else(|| GatewayError::Configuration("config vanished after insert".to_string()))
    }

    /// Apply a partial update. Setting `is_default` or any `default_for_*`
    /// flag to true atomically clears that flag on every other config of
    /// the same kind (§4.3, Testable Property 4).
    #[instrument(skip(self, update))]
    pub async fn update(&self, id: i64, update: ProviderConfigUpdate) -> Result<ProviderConfig> {
        let existing = self
            .get_config(id)
            .await?
            .ok_or(GatewayError::NoProviderConfigured)?;

        let mut tx = self.pool.begin().await?;

        if update.is_default == Some(true) {
            sqlx::query("UPDATE provider_configs SET is_default = 0 WHERE kind = ? AND id <> ?")
                .bind(existing.kind.as_str())
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        for (flag, column) in [
            (update.default_for_extraction, "default_for_extraction"),
            (update.default_for_cv_draft, "default_for_cv_draft"),
            (update.default_for_cover_letter, "default_for_cover_letter"),
            (update.default_for_validation, "default_for_validation"),
        ] {
            if flag == Some(true) {
                let sql = format!(
                    "UPDATE provider_configs SET {column} = 0 WHERE kind = ? AND id <> ?"
                );
                sqlx::query(&sql)
                    .bind(existing.kind.as_str())
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        let ciphertext = match &update.api_key {
            Some(plaintext) => Some(
                self.codec
                    .encrypt_str(plaintext)
                    .map_err(|_| GatewayError::InvalidCredential)?,
            ),
            None => None,
        };

        let model = update.model.unwrap_or(existing.model);
        let display_name = update.display_name.unwrap_or(existing.display_name);
        let description = update.description.unwrap_or(existing.description);
        let is_active = update.is_active.unwrap_or(existing.is_active);
        let is_default = update.is_default.unwrap_or(existing.is_default);
        let default_for_extraction = update
            .default_for_extraction
            .unwrap_or(existing.default_for_extraction);
        let default_for_cv_draft = update
            .default_for_cv_draft
            .unwrap_or(existing.default_for_cv_draft);
        let default_for_cover_letter = update
            .default_for_cover_letter
            .unwrap_or(existing.default_for_cover_letter);
        let default_for_validation = update
            .default_for_validation
            .unwrap_or(existing.default_for_validation);
        let daily_token_cap = update.daily_token_cap.unwrap_or(existing.daily_token_cap);
        let monthly_token_cap = update
            .monthly_token_cap
            .unwrap_or(existing.monthly_token_cap);
        let ciphertext = ciphertext.unwrap_or(existing.api_key_ciphertext);

        sqlx::query(
            r#"
            UPDATE provider_configs SET
                model = ?, display_name = ?, description = ?, api_key_ciphertext = ?,
                is_active = ?, is_default = ?,
                default_for_extraction = ?, default_for_cv_draft = ?,
                default_for_cover_letter = ?, default_for_validation = ?,
                daily_token_cap = ?, monthly_token_cap = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&model)
        .bind(&display_name)
        .bind(&description)
        .bind(&ciphertext)
        .bind(is_active)
        .bind(is_default)
        .bind(default_for_extraction)
        .bind(default_for_cv_draft)
        .bind(default_for_cover_letter)
        .bind(default_for_validation)
        .bind(daily_token_cap)
        .bind(monthly_token_cap)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.get_config(id)
            .await?
            .ok_or(GatewayError::NoProviderConfigured)
    }

    /// Delete a config. Existing `usage_records` referencing it fall back to
    /// `provider_config_id = NULL` via the schema's `ON DELETE SET NULL`.
    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM provider_configs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Resolve the config to use for `task`, per §4.3's five-step algorithm.
    #[instrument(skip(self))]
    pub async fn select_for(&self, task: TaskType) -> Result<SelectedConfig> {
        if let Some(column) = task.default_for_column() {
            let sql = format!(
                "SELECT * FROM provider_configs WHERE is_active = 1 AND {column} = 1 ORDER BY id LIMIT 1"
            );
            let row: Option<ProviderConfigRow> =
                sqlx::query_as(&sql).fetch_optional(&self.pool).await?;
            if let Some(row) = row {
                return Ok(SelectedConfig {
                    config: row.try_into()?,
                    from_env_fallback: false,
                });
            }
        }

        let row: Option<ProviderConfigRow> = sqlx::query_as(
            "SELECT * FROM provider_configs WHERE is_active = 1 AND is_default = 1 ORDER BY id LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = row {
            return Ok(SelectedConfig {
                config: row.try_into()?,
                from_env_fallback: false,
            });
        }

        let row: Option<ProviderConfigRow> =
            sqlx::query_as("SELECT * FROM provider_configs WHERE is_active = 1 ORDER BY id LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        if let Some(row) = row {
            return Ok(SelectedConfig {
                config: row.try_into()?,
                from_env_fallback: false,
            });
        }

        self.env_fallback_config()
    }

    /// Select an active config of a specific kind, for `provider_override` (facade step 1).
    pub async fn select_override(&self, kind: ProviderKind) -> Result<SelectedConfig> {
        let row: Option<ProviderConfigRow> = sqlx::query_as(
            "SELECT * FROM provider_configs WHERE is_active = 1 AND kind = ? ORDER BY is_default DESC, id LIMIT 1",
        )
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(SelectedConfig {
                config: row.try_into()?,
                from_env_fallback: false,
            }),
            None if kind == ProviderKind::Gemini => self.env_fallback_config(),
            None => Err(GatewayError::NoProviderConfigured),
        }
    }

    fn env_fallback_config(&self) -> Result<SelectedConfig> {
        let api_key = self
            .env_fallback
            .api_key
            .clone()
            .ok_or(GatewayError::NoProviderConfigured)?;
        let ciphertext = self
            .codec
            .encrypt_str(&api_key)
            .map_err(|_| GatewayError::InvalidCredential)?;
        let now = Utc::now();
        let model = self
            .env_fallback
            .model_fast
            .clone()
            .unwrap_or_else(|| "gemini-2.5-flash".to_string());

        Ok(SelectedConfig {
            config: ProviderConfig {
                id: -1,
                kind: ProviderKind::Gemini,
                model,
                display_name: "environment fallback".to_string(),
                description: None,
                api_key_ciphertext: ciphertext,
                is_active: true,
                is_default: false,
                default_for_extraction: false,
                default_for_cv_draft: false,
                default_for_cover_letter: false,
                default_for_validation: false,
                daily_token_cap: None,
                monthly_token_cap: None,
                last_tested_at: None,
                last_test_ok: None,
                created_by: None,
                created_at: now,
                updated_at: now,
            },
            from_env_fallback: true,
        })
    }

    /// Record the outcome of a credential test against a persisted config.
    /// Has no effect on env-fallback configs (`id < 0`), which are never persisted.
    pub async fn record_test_result(&self, id: i64, ok: bool) -> Result<()> {
        if id < 0 {
            return Ok(());
        }
        sqlx::query(
            "UPDATE provider_configs SET last_tested_at = ?, last_test_ok = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(ok)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvFallbackConfig;

    async fn registry() -> ProviderRegistry {
        let pool = crate::db::connect(":memory:").await.unwrap();
        let codec = std::sync::Arc::new(gateway_crypto::CredentialCodec::new(
            &gateway_crypto::Secret::from_bytes([9u8; 32]),
        ));
        ProviderRegistry::new(pool, codec, EnvFallbackConfig::default())
    }

    #[tokio::test]
    async fn create_and_list_never_exposes_plaintext() {
        let reg = registry().await;
        reg.create(NewProviderConfig {
            kind: ProviderKind::Gemini,
            api_key: "secret-key".to_string(),
            model: "gemini-2.5-flash".to_string(),
            display_name: "Primary".to_string(),
            description: None,
            created_by: None,
        })
        .await
        .unwrap();

        let configs = reg.list_configs().await.unwrap();
        assert_eq!(configs.len(), 1);
        assert_ne!(configs[0].api_key_ciphertext, b"secret-key".to_vec());
        let serialized = serde_json::to_string(&configs[0]).unwrap();
        assert!(!serialized.contains("secret-key"));
    }

    #[tokio::test]
    async fn setting_is_default_clears_other_configs() {
        let reg = registry().await;
        let a = reg
            .create(NewProviderConfig {
                kind: ProviderKind::Gemini,
                api_key: "key-a".to_string(),
                model: "gemini-2.5-flash".to_string(),
                display_name: "A".to_string(),
                description: None,
                created_by: None,
            })
            .await
            .unwrap();
        let b = reg
            .create(NewProviderConfig {
                kind: ProviderKind::Gemini,
                api_key: "key-b".to_string(),
                model: "gemini-2.5-flash".to_string(),
                display_name: "B".to_string(),
                description: None,
                created_by: None,
            })
            .await
            .unwrap();

        reg.update(
            a.id,
            ProviderConfigUpdate {
                is_default: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        reg.update(
            b.id,
            ProviderConfigUpdate {
                is_default: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let a_after = reg.get_config(a.id).await.unwrap().unwrap();
        let b_after = reg.get_config(b.id).await.unwrap().unwrap();
        assert!(!a_after.is_default);
        assert!(b_after.is_default);
    }

    #[tokio::test]
    async fn update_without_api_key_preserves_existing() {
        let reg = registry().await;
        let config = reg
            .create(NewProviderConfig {
                kind: ProviderKind::Gemini,
                api_key: "original-key".to_string(),
                model: "gemini-2.5-flash".to_string(),
                display_name: "A".to_string(),
                description: None,
                created_by: None,
            })
            .await
            .unwrap();

        reg.update(
            config.id,
            ProviderConfigUpdate {
                display_name: Some("Renamed".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let after = reg.get_config(config.id).await.unwrap().unwrap();
        assert_eq!(after.api_key_ciphertext, config.api_key_ciphertext);
        assert_eq!(after.display_name, "Renamed");
    }

    #[tokio::test]
    async fn select_for_falls_back_to_env_when_empty() {
        let pool = crate::db::connect(":memory:").await.unwrap();
        let codec = std::sync::Arc::new(gateway_crypto::CredentialCodec::new(
            &gateway_crypto::Secret::from_bytes([9u8; 32]),
        ));
        let reg = ProviderRegistry::new(
            pool,
            codec,
            EnvFallbackConfig {
                api_key: Some("env-key".to_string()),
                model_fast: Some("gemini-2.5-flash".to_string()),
                model_quality: None,
            },
        );

        let selected = reg.select_for(TaskType::Extraction).await.unwrap();
        assert!(selected.from_env_fallback);
    }

    #[tokio::test]
    async fn select_for_fails_with_no_provider_when_nothing_configured() {
        let reg = registry().await;
        let result = reg.select_for(TaskType::Extraction).await;
        assert!(matches!(result, Err(GatewayError::NoProviderConfigured)));
    }

    #[tokio::test]
    async fn select_for_prefers_task_default_then_global_default_then_any() {
        let reg = registry().await;
        let a = reg
            .create(NewProviderConfig {
                kind: ProviderKind::Gemini,
                api_key: "key-a".to_string(),
                model: "gemini-2.5-flash".to_string(),
                display_name: "A".to_string(),
                description: None,
                created_by: None,
            })
            .await
            .unwrap();
        let b = reg
            .create(NewProviderConfig {
                kind: ProviderKind::Gemini,
                api_key: "key-b".to_string(),
                model: "gemini-2.5-flash".to_string(),
                display_name: "B".to_string(),
                description: None,
                created_by: None,
            })
            .await
            .unwrap();

        let selected = reg.select_for(TaskType::Extraction).await.unwrap();
        assert_eq!(selected.config.id, a.id);

        reg.update(
            b.id,
            ProviderConfigUpdate {
                default_for_extraction: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let selected = reg.select_for(TaskType::Extraction).await.unwrap();
        assert_eq!(selected.config.id, b.id);
    }
}
