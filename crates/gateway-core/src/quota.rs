//! Quota manager (C5) — pre-call admissibility check over the usage ledger.

use chrono::{Datelike, Utc};

use crate::error::Result;
use crate::ledger::UsageLedger;
use crate::model::{QuotaPolicy, UserPlan};

/// Outcome of [`QuotaManager::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The call may proceed.
    Admit,
    /// The call is denied; `dimension` identifies which budget was exceeded.
    Deny {
        /// `"daily"`, `"monthly"`, `"hourly"`, or `"provider"`.
        dimension: String,
        /// Observed usage at check time.
        used: i64,
        /// The configured limit.
        limit: i64,
    },
}

/// Enforces per-user daily/monthly token budgets and the hourly call cap (§4.5).
pub struct QuotaManager {
    policies: std::collections::HashMap<UserPlan, QuotaPolicy>,
}

impl QuotaManager {
    /// Build a manager over the static per-plan policy table.
    #[must_use]
    pub fn new(policies: std::collections::HashMap<UserPlan, QuotaPolicy>) -> Self {
        Self { policies }
    }

    /// The default policy table described in §4.5's worked examples.
    #[must_use]
    pub fn default_policies() -> std::collections::HashMap<UserPlan, QuotaPolicy> {
        let mut map = std::collections::HashMap::new();
        map.insert(
            UserPlan::Freemium,
            QuotaPolicy {
                daily_token_limit: 10_000,
                monthly_token_limit: 100_000,
                hourly_call_limit: 20,
            },
        );
        map.insert(
            UserPlan::Paygo,
            QuotaPolicy {
                daily_token_limit: 200_000,
                monthly_token_limit: 3_000_000,
                hourly_call_limit: 120,
            },
        );
        map.insert(
            UserPlan::ProMonthly,
            QuotaPolicy {
                daily_token_limit: 500_000,
                monthly_token_limit: 8_000_000,
                hourly_call_limit: 300,
            },
        );
        map.insert(
            UserPlan::ProAnnual,
            QuotaPolicy {
                daily_token_limit: 500_000,
                monthly_token_limit: 10_000_000,
                hourly_call_limit: 300,
            },
        );
        map
    }

    /// Check whether `user_id` on `plan` may make a call estimated to cost
    /// `estimated_tokens` tokens. Queries the ledger for running sums rather
    /// than keeping an in-memory counter, so quota state survives restarts.
    pub async fn check(
        &self,
        ledger: &UsageLedger,
        user_id: i64,
        plan: UserPlan,
        estimated_tokens: i64,
    ) -> Result<Admission> {
        let policy = self.policies.get(&plan).copied().unwrap_or(QuotaPolicy {
            daily_token_limit: i64::MAX,
            monthly_token_limit: i64::MAX,
            hourly_call_limit: i64::MAX,
        });

        let now = Utc::now();
        let daily_used = ledger.tokens_today(user_id, now).await?;
        if daily_used + estimated_tokens > policy.daily_token_limit {
            return Ok(Admission::Deny {
                dimension: "daily".to_string(),
                used: daily_used,
                limit: policy.daily_token_limit,
            });
        }

        let monthly_used = ledger.tokens_this_month(user_id, now).await?;
        if monthly_used + estimated_tokens > policy.monthly_token_limit {
            return Ok(Admission::Deny {
                dimension: "monthly".to_string(),
                used: monthly_used,
                limit: policy.monthly_token_limit,
            });
        }

        let hourly_calls = ledger.successful_calls_last_hour(user_id, now).await?;
        if hourly_calls + 1 > policy.hourly_call_limit {
            return Ok(Admission::Deny {
                dimension: "hourly".to_string(),
                used: hourly_calls,
                limit: policy.hourly_call_limit,
            });
        }

        Ok(Admission::Admit)
    }

    /// Enforce the optional per-provider daily and monthly token caps,
    /// analogous to [`Self::check`] but keyed by `provider_config_id`
    /// instead of `user_id`.
    pub async fn check_provider_cap(
        &self,
        ledger: &UsageLedger,
        provider_config_id: i64,
        daily_cap: Option<i64>,
        monthly_cap: Option<i64>,
        estimated_tokens: i64,
    ) -> Result<Admission> {
        let now = Utc::now();

        if let Some(cap) = daily_cap {
            let start = now.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc();
            let used = ledger.tokens_for_provider_since(provider_config_id, start).await?;
            if used + estimated_tokens > cap {
                return Ok(Admission::Deny {
                    dimension: "provider".to_string(),
                    used,
                    limit: cap,
                });
            }
        }

        if let Some(cap) = monthly_cap {
            let start = now
                .date_naive()
                .with_day(1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
                .and_utc();
            let used = ledger.tokens_for_provider_since(provider_config_id, start).await?;
            if used + estimated_tokens > cap {
                return Ok(Admission::Deny {
                    dimension: "provider_monthly".to_string(),
                    used,
                    limit: cap,
                });
            }
        }

        Ok(Admission::Admit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TaskType, UsageRecord, UsageStatus};

    async fn ledger() -> UsageLedger {
        let pool = crate::db::connect(":memory:").await.unwrap();
        UsageLedger::new(pool)
    }

    #[tokio::test]
    async fn admits_under_limit() {
        let l = ledger().await;
        let q = QuotaManager::new(QuotaManager::default_policies());
        let result = q.check(&l, 1, UserPlan::Freemium, 1_000).await.unwrap();
        assert_eq!(result, Admission::Admit);
    }

    #[tokio::test]
    async fn denies_when_daily_would_be_exceeded() {
        let l = ledger().await;
        l.append(&UsageRecord::new(3, None, TaskType::Extraction, "m", 9_600, 0, 0, 10, UsageStatus::Success))
            .await;

        let q = QuotaManager::new(QuotaManager::default_policies());
        let result = q.check(&l, 3, UserPlan::Freemium, 1_000).await.unwrap();
        assert_eq!(
            result,
            Admission::Deny {
                dimension: "daily".to_string(),
                used: 9_600,
                limit: 10_000,
            }
        );
    }

    #[tokio::test]
    async fn denies_when_hourly_call_cap_reached() {
        let l = ledger().await;
        let mut policies = std::collections::HashMap::new();
        policies.insert(
            UserPlan::Freemium,
            QuotaPolicy {
                daily_token_limit: 1_000_000,
                monthly_token_limit: 1_000_000,
                hourly_call_limit: 1,
            },
        );
        l.append(&UsageRecord::new(4, None, TaskType::Extraction, "m", 10, 0, 0, 10, UsageStatus::Success))
            .await;

        let q = QuotaManager::new(policies);
        let result = q.check(&l, 4, UserPlan::Freemium, 10).await.unwrap();
        assert!(matches!(result, Admission::Deny { ref dimension, .. } if dimension == "hourly"));
    }

    #[tokio::test]
    async fn provider_cap_denies_when_daily_exceeded() {
        let l = ledger().await;
        let q = QuotaManager::new(QuotaManager::default_policies());
        let result = q.check_provider_cap(&l, 7, Some(100), None, 200).await.unwrap();
        assert_eq!(
            result,
            Admission::Deny {
                dimension: "provider".to_string(),
                used: 0,
                limit: 100,
            }
        );
    }

    #[tokio::test]
    async fn provider_cap_denies_when_monthly_exceeded() {
        let l = ledger().await;
        l.append(&UsageRecord::new(0, Some(7), TaskType::Extraction, "m", 900, 0, 0, 100, UsageStatus::Success))
            .await;

        let q = QuotaManager::new(QuotaManager::default_policies());
        let result = q.check_provider_cap(&l, 7, None, Some(1_000), 200).await.unwrap();
        assert_eq!(
            result,
            Admission::Deny {
                dimension: "provider_monthly".to_string(),
                used: 900,
                limit: 1_000,
            }
        );
    }

    #[tokio::test]
    async fn provider_cap_admits_when_no_cap_set() {
        let l = ledger().await;
        let q = QuotaManager::new(QuotaManager::default_policies());
        let result = q.check_provider_cap(&l, 7, None, None, 1_000_000).await.unwrap();
        assert_eq!(result, Admission::Admit);
    }
}
