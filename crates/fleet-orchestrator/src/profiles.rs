use crate::types::AgentRole;
use fleet_agent::CapabilitySlot;
use fleet_core::{ParamValue, Parameters};

/// Static description of what an agent of a given role needs and reports.
#[derive(Debug, Clone)]
pub struct RoleProfile {
    /// Role described.
    pub role: AgentRole,
    /// Instructions prepended to every prompt.
    pub system_prompt: &'static str,
    /// Slots an agent spec must bind before the factory accepts it.
    pub required_slots: Vec<CapabilitySlot>,
    /// Actions the role is normally asked to perform.
    pub actions: Vec<&'static str>,
    /// Counter reported once per completed task.
    pub work_metric: &'static str,
    /// KPI fed by the scoring slot, when the role has one.
    pub score_metric: Option<&'static str>,
    defaults: Parameters,
}

impl RoleProfile {
    /// Parameters every agent of this role starts with.
    pub fn default_parameters(&self) -> Parameters {
        self.defaults.clone()
    }

    /// Whether this role needs `slot` bound.
    pub fn requires(&self, slot: CapabilitySlot) -> bool {
        self.required_slots.contains(&slot)
    }
}

/// Profiles for every role, in catalogue order.
pub fn default_profiles() -> Vec<RoleProfile> {
    AgentRole::ALL.iter().map(|r| profile(*r)).collect()
}

/// Profile of `role`.
pub fn profile(role: AgentRole) -> RoleProfile {
    use CapabilitySlot::{Generation, Scoring};

    match role {
        AgentRole::LaunchStrategist => RoleProfile {
            role,
            system_prompt: LAUNCH_PROMPT,
            required_slots: vec![Generation],
            actions: vec!["phase_transition", "execute_task", "update_strategy"],
            work_metric: "launch_tasks_executed",
            score_metric: None,
            defaults: params(&[("current_phase", "pre_launch".into())]),
        },
        AgentRole::ContentCreator => RoleProfile {
            role,
            system_prompt: CONTENT_PROMPT,
            required_slots: vec![Generation],
            actions: vec!["create_content", "optimize_content", "schedule_content"],
            work_metric: "content_created",
            score_metric: None,
            defaults: params(&[("default_channel", "blog".into())]),
        },
        AgentRole::RevenueOptimizer => RoleProfile {
            role,
            system_prompt: REVENUE_PROMPT,
            required_slots: vec![Scoring],
            actions: vec!["optimize_pricing", "analyze_revenue", "implement_strategy"],
            work_metric: "pricing_reviews",
            score_metric: Some("conversionRate"),
            defaults: params(&[
                ("daily_revenue_target", 50.0.into()),
                ("discount", 0.0.into()),
            ]),
        },
        AgentRole::CommunityEngagement => RoleProfile {
            role,
            system_prompt: COMMUNITY_PROMPT,
            required_slots: vec![Generation, Scoring],
            actions: vec!["respond_to_user", "monitor_sentiment", "create_event"],
            work_metric: "community_responses",
            score_metric: Some("sentiment_score"),
            defaults: Parameters::new(),
        },
        AgentRole::InfluencerOutreach => RoleProfile {
            role,
            system_prompt: INFLUENCER_PROMPT,
            required_slots: vec![Generation, Scoring],
            actions: vec!["identify_influencers", "create_campaign", "track_performance"],
            work_metric: "outreach_actions",
            score_metric: Some("influencer_fit"),
            defaults: params(&[("min_followers", 1_000i64.into())]),
        },
        AgentRole::FeedbackManager => RoleProfile {
            role,
            system_prompt: FEEDBACK_PROMPT,
            required_slots: vec![Generation, Scoring],
            actions: vec!["collect_feedback", "analyze_feedback", "generate_report"],
            work_metric: "feedback_processed",
            score_metric: Some("feedback_sentiment"),
            defaults: Parameters::new(),
        },
        AgentRole::DataPrivacy => RoleProfile {
            role,
            system_prompt: PRIVACY_PROMPT,
            required_slots: vec![Scoring],
            actions: vec!["privacy_check", "handle_request", "audit_access"],
            work_metric: "privacy_checks",
            score_metric: Some("compliance_score"),
            defaults: params(&[("retention_days", 365i64.into())]),
        },
        AgentRole::UserOnboarding => RoleProfile {
            role,
            system_prompt: ONBOARDING_PROMPT,
            required_slots: vec![Generation],
            actions: vec!["start_onboarding", "track_progress", "optimize_flow"],
            work_metric: "onboarding_steps",
            score_metric: None,
            defaults: params(&[("flow_type", "default".into())]),
        },
        AgentRole::Analytics => RoleProfile {
            role,
            system_prompt: ANALYTICS_PROMPT,
            required_slots: vec![Generation, Scoring],
            actions: vec!["generate_report", "analyze_data"],
            work_metric: "reports_generated",
            score_metric: Some("insight_confidence"),
            defaults: params(&[("metrics_window", "24h".into())]),
        },
        AgentRole::MarketplaceManager => RoleProfile {
            role,
            system_prompt: MARKETPLACE_PROMPT,
            required_slots: vec![Scoring],
            actions: vec!["analyze_marketplace", "get_marketplace_stats"],
            work_metric: "listings_reviewed",
            score_metric: Some("listing_quality"),
            defaults: params(&[("commission_rate", 0.10.into())]),
        },
        AgentRole::RoiOptimization => RoleProfile {
            role,
            system_prompt: ROI_PROMPT,
            required_slots: vec![Scoring],
            actions: vec!["optimize_roi"],
            work_metric: "roi_reviews",
            score_metric: Some("current_roi"),
            defaults: params(&[("target_roi", 0.15.into())]),
        },
    }
}

fn params(pairs: &[(&str, ParamValue)]) -> Parameters {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

const LAUNCH_PROMPT: &str = "\
You are the launch strategist. You move the product through its launch phases \
(pre-launch, soft launch, public launch, growth) and break each phase into \
concrete tasks. Answer with the next concrete step only.";

const CONTENT_PROMPT: &str = "\
You are the content creator. You write and optimize announcements, posts and \
newsletters for the requested channel. Keep copy short and on brand.";

const REVENUE_PROMPT: &str = "\
You are the revenue optimizer. Given current pricing and demand, estimate the \
probability that the proposed change improves conversion.";

const COMMUNITY_PROMPT: &str = "\
You are the community manager. Reply to members helpfully and judge the \
sentiment of the conversation.";

const INFLUENCER_PROMPT: &str = "\
You handle influencer outreach. Draft outreach messages and rate how well a \
candidate fits the campaign audience.";

const FEEDBACK_PROMPT: &str = "\
You manage user feedback. Summarize incoming feedback, classify it and rate \
overall sentiment.";

const PRIVACY_PROMPT: &str = "\
You are the data privacy officer. Rate how compliant the described data \
handling is with the active privacy policies.";

const ONBOARDING_PROMPT: &str = "\
You guide new users through onboarding. Produce the next onboarding message \
for the user's current step.";

const ANALYTICS_PROMPT: &str = "\
You are the analyst. Turn the supplied figures into a short report and rate \
your confidence in the main finding.";

const MARKETPLACE_PROMPT: &str = "\
You manage the marketplace. Rate the quality of the listings described.";

const ROI_PROMPT: &str = "\
You track return on investment. Estimate the ROI of the described spend \
against the configured target.";

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_every_role_has_a_profile() {
        let profiles = default_profiles();
        assert_eq!(profiles.len(), AgentRole::ALL.len());
        for (p, role) in profiles.iter().zip(AgentRole::ALL) {
            assert_eq!(p.role, role);
            assert!(!p.system_prompt.is_empty());
            assert!(!p.required_slots.is_empty());
            assert!(!p.actions.is_empty());
        }
    }

    #[test]
    fn test_scoring_roles_report_a_score_metric() {
        for p in default_profiles() {
            assert_eq!(p.requires(CapabilitySlot::Scoring), p.score_metric.is_some());
        }
    }

    #[test]
    fn test_known_defaults() {
        let roi = profile(AgentRole::RoiOptimization).default_parameters();
        assert_eq!(roi["target_roi"], ParamValue::Float(0.15));

        let revenue = profile(AgentRole::RevenueOptimizer);
        assert_eq!(
            revenue.default_parameters()["daily_revenue_target"],
            ParamValue::Float(50.0)
        );
        assert_eq!(revenue.score_metric, Some("conversionRate"));
    }
}
