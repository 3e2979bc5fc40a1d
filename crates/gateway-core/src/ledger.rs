//! Usage ledger (C7) — append-only record of every `generate` attempt.

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tracing::warn;

use crate::error::Result;
use crate::model::{TaskType, UsageRecord, UsageStatus};

#[derive(Debug, sqlx::FromRow)]
struct UsageRecordRow {
    id: i64,
    user_id: i64,
    provider_config_id: Option<i64>,
    task: String,
    model: String,
    input_tokens: i64,
    output_tokens: i64,
    total_tokens: i64,
    cost_micro_usd: i64,
    latency_ms: i64,
    status: String,
    error_kind: Option<String>,
    error_message: Option<String>,
    cache_hit: bool,
    estimated: bool,
    created_at: DateTime<Utc>,
}

impl UsageRecordRow {
    fn into_record(self) -> Option<UsageRecord> {
        Some(UsageRecord {
            id: self.id,
            user_id: self.user_id,
            provider_config_id: self.provider_config_id,
            task: parse_task(&self.task)?,
            model: self.model,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_tokens: self.total_tokens,
            cost_micro_usd: self.cost_micro_usd,
            latency_ms: self.latency_ms,
            status: UsageStatus::parse(&self.status)?,
            error_kind: self.error_kind,
            error_message: self.error_message,
            cache_hit: self.cache_hit,
            estimated: self.estimated,
            created_at: self.created_at,
        })
    }
}

fn parse_task(s: &str) -> Option<TaskType> {
    match s {
        "extraction" => Some(TaskType::Extraction),
        "cv_draft" => Some(TaskType::CvDraft),
        "cover_letter" => Some(TaskType::CoverLetter),
        "validation" => Some(TaskType::Validation),
        "extraction_validation" => Some(TaskType::ExtractionValidation),
        _ => None,
    }
}

/// Filters for [`UsageLedger::query`].
#[derive(Debug, Clone, Default)]
pub struct UsageQuery {
    /// Restrict to a single user.
    pub user_id: Option<i64>,
    /// Restrict to a single provider config.
    pub provider_config_id: Option<i64>,
    /// Restrict to a single task kind.
    pub task: Option<TaskType>,
    /// Restrict to records at or after this time.
    pub since: Option<DateTime<Utc>>,
    /// Restrict to records strictly before this time.
    pub until: Option<DateTime<Utc>>,
    /// Page size.
    pub limit: i64,
    /// Page offset.
    pub offset: i64,
}

impl UsageQuery {
    /// A query for `user_id` with the given page size and offset.
    #[must_use]
    pub fn for_user(user_id: i64, limit: i64, offset: i64) -> Self {
        Self {
            user_id: Some(user_id),
            limit,
            offset,
            ..Default::default()
        }
    }
}

/// Aggregate view over a set of usage records (sum tokens, sum cost, avg
/// latency, success rate), per §4.7.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct UsageAggregate {
    /// Number of records matched.
    pub count: i64,
    /// Sum of `total_tokens` across matched records.
    pub total_tokens: i64,
    /// Sum of `cost_micro_usd` across matched records.
    pub total_cost_micro_usd: i64,
    /// Average `latency_ms` across matched records.
    pub avg_latency_ms: f64,
    /// Fraction of matched records with `status = success`, in `[0, 1]`.
    pub success_rate: f64,
}

/// Append-only store of [`UsageRecord`]s (C7).
pub struct UsageLedger {
    pool: SqlitePool,
}

impl UsageLedger {
    /// Build a ledger over `pool`.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a record. Best-effort: a storage failure is logged at warn
    /// level and swallowed — the caller's result never depends on whether
    /// the ledger write succeeded (§4.7, §7).
    pub async fn append(&self, record: &UsageRecord) {
        let result = sqlx::query(
            r#"
            INSERT INTO usage_records
                (user_id, provider_config_id, task, model, input_tokens, output_tokens,
                 total_tokens, cost_micro_usd, latency_ms, status, error_kind, error_message,
                 cache_hit, estimated, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.user_id)
        .bind(record.provider_config_id)
        .bind(record.task.as_str())
        .bind(&record.model)
        .bind(record.input_tokens)
        .bind(record.output_tokens)
        .bind(record.total_tokens)
        .bind(record.cost_micro_usd)
        .bind(record.latency_ms)
        .bind(record.status.as_str())
        .bind(&record.error_kind)
        .bind(&record.error_message)
        .bind(record.cache_hit)
        .bind(record.estimated)
        .bind(record.created_at)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(error = %e, user_id = record.user_id, "failed to append usage record, continuing");
        }
    }

    /// Paginated read.
    pub async fn query(&self, q: &UsageQuery) -> Result<Vec<UsageRecord>> {
        let mut sql = String::from("SELECT * FROM usage_records WHERE 1=1");
        if q.user_id.is_some() {
            sql.push_str(" AND user_id = ?");
        }
        if q.provider_config_id.is_some() {
            sql.push_str(" AND provider_config_id = ?");
        }
        if q.task.is_some() {
            sql.push_str(" AND task = ?");
        }
        if q.since.is_some() {
            sql.push_str(" AND created_at >= ?");
        }
        if q.until.is_some() {
            sql.push_str(" AND created_at < ?");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query_as::<_, UsageRecordRow>(&sql);
        if let Some(v) = q.user_id {
            query = query.bind(v);
        }
        if let Some(v) = q.provider_config_id {
            query = query.bind(v);
        }
        if let Some(v) = q.task {
            query = query.bind(v.as_str());
        }
        if let Some(v) = q.since {
            query = query.bind(v);
        }
        if let Some(v) = q.until {
            query = query.bind(v);
        }
        query = query.bind(q.limit).bind(q.offset);

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().filter_map(UsageRecordRow::into_record).collect())
    }

    /// Aggregate view over the same filters as [`Self::query`] (ignoring pagination).
    pub async fn aggregate(&self, q: &UsageQuery) -> Result<UsageAggregate> {
        let mut sql = String::from(
            "SELECT COUNT(*), COALESCE(SUM(total_tokens),0), COALESCE(SUM(cost_micro_usd),0), \
             COALESCE(AVG(latency_ms),0.0), \
             COALESCE(AVG(CASE WHEN status = 'success' THEN 1.0 ELSE 0.0 END), 0.0) \
             FROM usage_records WHERE 1=1",
        );
        if q.user_id.is_some() {
            sql.push_str(" AND user_id = ?");
        }
        if q.provider_config_id.is_some() {
            sql.push_str(" AND provider_config_id = ?");
        }
        if q.task.is_some() {
            sql.push_str(" AND task = ?");
        }
        if q.since.is_some() {
            sql.push_str(" AND created_at >= ?");
        }
        if q.until.is_some() {
            sql.push_str(" AND created_at < ?");
        }

        let mut query = sqlx::query_as::<_, (i64, i64, i64, f64, f64)>(&sql);
        if let Some(v) = q.user_id {
            query = query.bind(v);
        }
        if let Some(v) = q.provider_config_id {
            query = query.bind(v);
        }
        if let Some(v) = q.task {
            query = query.bind(v.as_str());
        }
        if let Some(v) = q.since {
            query = query.bind(v);
        }
        if let Some(v) = q.until {
            query = query.bind(v);
        }

        let (count, total_tokens, total_cost_micro_usd, avg_latency_ms, success_rate) =
            query.fetch_one(&self.pool).await?;

        Ok(UsageAggregate {
            count,
            total_tokens,
            total_cost_micro_usd,
            avg_latency_ms,
            success_rate,
        })
    }

    /// Sum of `total_tokens` for `user_id` since UTC midnight today.
    pub async fn tokens_today(&self, user_id: i64, now: DateTime<Utc>) -> Result<i64> {
        let start = now.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc();
        self.sum_tokens_since(user_id, start).await
    }

    /// Sum of `total_tokens` for `user_id` since the start of the current UTC month.
    pub async fn tokens_this_month(&self, user_id: i64, now: DateTime<Utc>) -> Result<i64> {
        let start = now
            .date_naive()
            .with_day(1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        self.sum_tokens_since(user_id, start).await
    }

    /// Count of successful calls for `user_id` in the rolling 60 minutes before `now`.
    pub async fn successful_calls_last_hour(&self, user_id: i64, now: DateTime<Utc>) -> Result<i64> {
        let since = now - Duration::minutes(60);
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM usage_records WHERE user_id = ? AND status = 'success' AND created_at >= ?",
        )
        .bind(user_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Sum of `total_tokens` for a provider config since `since` (per-provider caps, §4.5).
    pub async fn tokens_for_provider_since(
        &self,
        provider_config_id: i64,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let sum: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(total_tokens),0) FROM usage_records WHERE provider_config_id = ? AND created_at >= ?",
        )
        .bind(provider_config_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(sum)
    }

    async fn sum_tokens_since(&self, user_id: i64, since: DateTime<Utc>) -> Result<i64> {
        let sum: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(total_tokens),0) FROM usage_records WHERE user_id = ? AND created_at >= ?",
        )
        .bind(user_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(sum)
    }
}

use chrono::Datelike;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UsageRecord;

    async fn ledger() -> UsageLedger {
        let pool = crate::db::connect(":memory:").await.unwrap();
        UsageLedger::new(pool)
    }

    #[tokio::test]
    async fn append_then_query_round_trips() {
        let l = ledger().await;
        let r = UsageRecord::new(1, Some(1), TaskType::Extraction, "gemini-2.5-flash", 100, 50, 10, 200, UsageStatus::Success);
        l.append(&r).await;

        let results = l.query(&UsageQuery::for_user(1, 10, 0)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].total_tokens, 150);
    }

    #[tokio::test]
    async fn aggregate_computes_sums_and_success_rate() {
        let l = ledger().await;
        l.append(&UsageRecord::new(1, None, TaskType::Extraction, "m", 100, 0, 10, 100, UsageStatus::Success))
            .await;
        l.append(&UsageRecord::new(1, None, TaskType::Extraction, "m", 100, 0, 10, 100, UsageStatus::Error))
            .await;

        let agg = l.aggregate(&UsageQuery::for_user(1, 10, 0)).await.unwrap();
        assert_eq!(agg.count, 2);
        assert_eq!(agg.total_tokens, 200);
        assert!((agg.success_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn tokens_today_only_counts_today() {
        let l = ledger().await;
        let now = Utc::now();
        let mut yesterday_record = UsageRecord::new(1, None, TaskType::Extraction, "m", 500, 0, 10, 100, UsageStatus::Success);
        yesterday_record.created_at = now - Duration::days(1);
        l.append(&yesterday_record).await;
        l.append(&UsageRecord::new(1, None, TaskType::Extraction, "m", 700, 0, 10, 100, UsageStatus::Success))
            .await;

        let today = l.tokens_today(1, now).await.unwrap();
        assert_eq!(today, 700);
    }
}
