//! Three-tier cache layer (C6).

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::error::Result;
use crate::model::{CacheEntry, CacheScope};

#[derive(Debug, sqlx::FromRow)]
struct CacheEntryRow {
    cache_key: String,
    scope: String,
    user_id: Option<i64>,
    payload: String,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    hit_count: i64,
}

impl CacheEntryRow {
    fn into_entry(self) -> Option<CacheEntry> {
        Some(CacheEntry {
            cache_key: self.cache_key,
            scope: CacheScope::parse(&self.scope)?,
            user_id: self.user_id,
            payload: self.payload,
            created_at: self.created_at,
            expires_at: self.expires_at,
            hit_count: self.hit_count,
        })
    }
}

/// The canonical inputs hashed to form a `content`-scope cache key (§9).
#[derive(Debug, Clone)]
#[allow(clippy::struct_field_names)]
pub struct ContentCacheInput<'a> {
    /// Task kind.
    pub task: &'a str,
    /// Resolved model id.
    pub model: &'a str,
    /// Prompt text.
    pub prompt: &'a str,
    /// Optional system prompt.
    pub system_prompt: Option<&'a str>,
    /// Temperature, formatted to a fixed number of decimals for stability.
    pub temperature: f32,
    /// Max tokens requested.
    pub max_tokens: u32,
    /// Raw image bytes, if this is a multimodal call.
    pub image_bytes: Option<&'a [u8]>,
}

impl ContentCacheInput<'_> {
    /// Compute the hex-encoded SHA-256 content hash used as the cache key.
    #[must_use]
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.task.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.model.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.prompt.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.system_prompt.unwrap_or("").as_bytes());
        hasher.update(b"\0");
        hasher.update(format!("{:.4}", self.temperature).as_bytes());
        hasher.update(b"\0");
        hasher.update(self.max_tokens.to_le_bytes());
        if let Some(bytes) = self.image_bytes {
            hasher.update(b"\0");
            hasher.update(bytes);
        }
        hex::encode(hasher.finalize())
    }
}

/// Small hex-encoding shim so we don't pull in a whole `hex` crate dependency
/// just for this one call site.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Three-tier (system/session/content) response cache backed by SQLite (§4.6).
pub struct CacheLayer {
    pool: SqlitePool,
    session_ttl: Duration,
    content_ttl: Duration,
}

impl CacheLayer {
    /// Build a cache layer over `pool`, applying the given default TTLs
    /// (seconds) for `session` and `content` scope writes.
    #[must_use]
    pub fn new(pool: SqlitePool, session_ttl_secs: i64, content_ttl_secs: i64) -> Self {
        Self {
            pool,
            session_ttl: Duration::seconds(session_ttl_secs),
            content_ttl: Duration::seconds(content_ttl_secs),
        }
    }

    /// Look up a specific key/scope, incrementing the hit counter on success.
    /// `user_id` scopes the lookup: a `session` entry owned by a different
    /// user is never returned (Testable Property 6).
    pub async fn get(
        &self,
        key: &str,
        scope: CacheScope,
        user_id: Option<i64>,
    ) -> Result<Option<CacheEntry>> {
        let now = Utc::now();
        let row: Option<CacheEntryRow> = match scope {
            CacheScope::Session => {
                sqlx::query_as(
                    "SELECT * FROM cache_entries WHERE cache_key = ? AND scope = 'session' AND user_id = ? \
                     AND (expires_at IS NULL OR expires_at > ?)",
                )
                .bind(key)
                .bind(user_id)
                .bind(now)
                .fetch_optional(&self.pool)
                .await?
            }
            _ => {
                sqlx::query_as(
                    "SELECT * FROM cache_entries WHERE cache_key = ? AND scope = ? \
                     AND (expires_at IS NULL OR expires_at > ?)",
                )
                .bind(key)
                .bind(scope.as_str())
                .bind(now)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        let Some(row) = row else { return Ok(None) };
        sqlx::query("UPDATE cache_entries SET hit_count = hit_count + 1 WHERE cache_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(row.into_entry().map(|mut e| {
            e.hit_count += 1;
            e
        }))
    }

    /// Cache-through lookup used by the facade: `content → session → system`.
    pub async fn lookup_through(
        &self,
        content_key: &str,
        session_key: Option<&str>,
        user_id: i64,
    ) -> Result<Option<CacheEntry>> {
        if let Some(entry) = self.get(content_key, CacheScope::Content, None).await? {
            return Ok(Some(entry));
        }
        if let Some(key) = session_key {
            if let Some(entry) = self.get(key, CacheScope::Session, Some(user_id)).await? {
                return Ok(Some(entry));
            }
        }
        self.get(content_key, CacheScope::System, None).await
    }

    /// Store a payload under `scope`, applying the scope's default TTL unless
    /// `scope = system` (which never expires).
    pub async fn put(
        &self,
        key: &str,
        scope: CacheScope,
        user_id: Option<i64>,
        payload: &str,
    ) -> Result<()> {
        let now = Utc::now();
        let expires_at = match scope {
            CacheScope::System => None,
            CacheScope::Session => Some(now + self.session_ttl),
            CacheScope::Content => Some(now + self.content_ttl),
        };
        let owner = if scope == CacheScope::Session { user_id } else { None };

        sqlx::query(
            r#"
            INSERT INTO cache_entries (cache_key, scope, user_id, payload, created_at, expires_at, hit_count)
            VALUES (?, ?, ?, ?, ?, ?, 0)
            ON CONFLICT(cache_key) DO UPDATE SET
                scope = excluded.scope,
                user_id = excluded.user_id,
                payload = excluded.payload,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(scope.as_str())
        .bind(owner)
        .bind(payload)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Remove all `session`-scope entries for `user_id` (logout signal, §4.6).
    pub async fn evict_session(&self, user_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM cache_entries WHERE scope = 'session' AND user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn cache() -> CacheLayer {
        let pool = crate::db::connect(":memory:").await.unwrap();
        CacheLayer::new(pool, 3_600, 86_400)
    }

    #[tokio::test]
    async fn content_hash_is_stable_and_sensitive_to_image() {
        let base = ContentCacheInput {
            task: "extraction",
            model: "gemini-2.5-flash",
            prompt: "Extract from: https://x/1",
            system_prompt: None,
            temperature: 0.7,
            max_tokens: 4096,
            image_bytes: None,
        };
        let h1 = base.content_hash();
        let h2 = base.content_hash();
        assert_eq!(h1, h2);

        let with_image = ContentCacheInput {
            image_bytes: Some(&[1, 2, 3]),
            ..base.clone()
        };
        assert_ne!(h1, with_image.content_hash());
    }

    #[tokio::test]
    async fn put_then_get_round_trips_and_counts_hits() {
        let c = cache().await;
        c.put("H1", CacheScope::Content, None, "payload").await.unwrap();

        let first = c.get("H1", CacheScope::Content, None).await.unwrap().unwrap();
        assert_eq!(first.hit_count, 1);
        let second = c.get("H1", CacheScope::Content, None).await.unwrap().unwrap();
        assert_eq!(second.hit_count, 2);
    }

    #[tokio::test]
    async fn session_entry_is_not_visible_to_other_user() {
        let c = cache().await;
        c.put("profile", CacheScope::Session, Some(1), "a's data")
            .await
            .unwrap();

        let as_owner = c.get("profile", CacheScope::Session, Some(1)).await.unwrap();
        assert!(as_owner.is_some());

        let as_other = c.get("profile", CacheScope::Session, Some(2)).await.unwrap();
        assert!(as_other.is_none());
    }

    #[tokio::test]
    async fn lookup_through_checks_content_then_session_then_system() {
        let c = cache().await;
        c.put("sys-key", CacheScope::System, None, "system payload")
            .await
            .unwrap();

        let found = c.lookup_through("sys-key", Some("sess-key"), 1).await.unwrap();
        assert_eq!(found.unwrap().payload, "system payload");
    }

    #[tokio::test]
    async fn evict_session_removes_only_that_users_entries() {
        let c = cache().await;
        c.put("k", CacheScope::Session, Some(1), "a").await.unwrap();
        c.put("k2", CacheScope::Session, Some(2), "b").await.unwrap();

        c.evict_session(1).await.unwrap();

        assert!(c.get("k", CacheScope::Session, Some(1)).await.unwrap().is_none());
        assert!(c.get("k2", CacheScope::Session, Some(2)).await.unwrap().is_some());
    }
}
