//! Plan-aware model router (C4) — a pure function over the §4.4 policy table.

use tracing::warn;

use crate::config::TierConfig;
use crate::model::{TaskType, UserPlan};

/// A resolved model identifier — either a concrete provider model id or a
/// symbolic tier name that has already been expanded against [`TierConfig`].
pub type ModelId = String;

/// Maps `(plan, task)` to a concrete model identifier (§4.4).
pub struct ModelRouter {
    tiers: TierConfig,
}

impl ModelRouter {
    /// Build a router over the given tier configuration.
    #[must_use]
    pub fn new(tiers: TierConfig) -> Self {
        Self { tiers }
    }

    /// Resolve the model for `(plan, task)`. Total over every declared
    /// `(plan, task)` pair (Testable Property 10); combinations outside the
    /// four originally declared tasks are routed through
    /// [`Self::model_for_unmapped`] instead of silently defaulting.
    #[must_use]
    pub fn model_for(&self, plan: UserPlan, task: TaskType) -> ModelId {
        let tier = match (plan, task) {
            (UserPlan::Freemium, TaskType::Extraction | TaskType::CvDraft | TaskType::CoverLetter | TaskType::Validation) => {
                Tier::Fast
            }
            (UserPlan::Paygo, TaskType::Extraction | TaskType::CvDraft | TaskType::CoverLetter | TaskType::Validation) => {
                Tier::Fast
            }
            (UserPlan::ProMonthly, TaskType::CvDraft | TaskType::CoverLetter) => Tier::Quality,
            (UserPlan::ProMonthly, TaskType::Extraction | TaskType::Validation) => Tier::Fast,
            (UserPlan::ProAnnual, TaskType::CvDraft | TaskType::CoverLetter) => Tier::Quality,
            (UserPlan::ProAnnual, TaskType::Extraction | TaskType::Validation) => Tier::Fast,
            (_, TaskType::ExtractionValidation) => return self.model_for_unmapped(plan, task),
        };
        self.resolve(tier)
    }

    fn resolve(&self, tier: Tier) -> ModelId {
        match tier {
            Tier::Fast => self.tiers.fast_tier_model.clone(),
            Tier::Quality => self.tiers.quality_tier_model.clone(),
        }
    }

    /// Resolve a tier for a `(plan, task)` pair that is not one of the four
    /// originally declared tasks (e.g. `extraction_validation`), logging a
    /// warning per §4.4's "unknown combinations resolve to fast-tier" rule.
    #[must_use]
    pub fn model_for_unmapped(&self, plan: UserPlan, task: TaskType) -> ModelId {
        warn!(%plan, %task, "unmapped (plan, task) combination, defaulting to fast-tier");
        self.resolve(Tier::Fast)
    }
}

#[derive(Debug, Clone, Copy)]
enum Tier {
    Fast,
    Quality,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> ModelRouter {
        ModelRouter::new(TierConfig::default())
    }

    #[test]
    fn freemium_is_always_fast_tier() {
        let r = router();
        for task in [
            TaskType::Extraction,
            TaskType::CvDraft,
            TaskType::CoverLetter,
            TaskType::Validation,
        ] {
            assert_eq!(r.model_for(UserPlan::Freemium, task), r.tiers.fast_tier_model);
        }
    }

    #[test]
    fn pro_monthly_uses_quality_tier_for_drafting() {
        let r = router();
        assert_eq!(
            r.model_for(UserPlan::ProMonthly, TaskType::CvDraft),
            r.tiers.quality_tier_model
        );
        assert_eq!(
            r.model_for(UserPlan::ProMonthly, TaskType::CoverLetter),
            r.tiers.quality_tier_model
        );
        assert_eq!(
            r.model_for(UserPlan::ProMonthly, TaskType::Extraction),
            r.tiers.fast_tier_model
        );
        assert_eq!(
            r.model_for(UserPlan::ProMonthly, TaskType::Validation),
            r.tiers.fast_tier_model
        );
    }

    #[test]
    fn pro_annual_matches_pro_monthly_policy() {
        let r = router();
        assert_eq!(
            r.model_for(UserPlan::ProAnnual, TaskType::CvDraft),
            r.model_for(UserPlan::ProMonthly, TaskType::CvDraft)
        );
    }

    #[test]
    fn router_is_total_and_resolves_to_priced_models() {
        let cfg = crate::config::GatewayConfig::default();
        let r = ModelRouter::new(cfg.tiers.clone());
        for plan in [
            UserPlan::Freemium,
            UserPlan::Paygo,
            UserPlan::ProMonthly,
            UserPlan::ProAnnual,
        ] {
            for task in [
                TaskType::Extraction,
                TaskType::CvDraft,
                TaskType::CoverLetter,
                TaskType::Validation,
            ] {
                let model = r.model_for(plan, task);
                assert!(cfg.pricing.contains_key(&model));
            }
        }
    }

    #[test]
    fn unmapped_combination_falls_back_to_fast_tier() {
        let r = router();
        assert_eq!(
            r.model_for_unmapped(UserPlan::ProMonthly, TaskType::ExtractionValidation),
            r.tiers.fast_tier_model
        );
    }

    #[test]
    fn model_for_routes_extraction_validation_through_unmapped_path() {
        let r = router();
        for plan in [
            UserPlan::Freemium,
            UserPlan::Paygo,
            UserPlan::ProMonthly,
            UserPlan::ProAnnual,
        ] {
            assert_eq!(
                r.model_for(plan, TaskType::ExtractionValidation),
                r.model_for_unmapped(plan, TaskType::ExtractionValidation)
            );
        }
    }
}
