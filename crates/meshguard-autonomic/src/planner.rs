//! Planner stage: translate hypotheses into scored remediation policies

use chrono::Utc;
use meshguard_common::config::PlannerConfig;
use meshguard_common::types::{
    ActionType, AdvisorySnapshot, AnalysisResult, ApprovalState, CauseTag, PolicyPriority,
    RemediationAction, RemediationPolicy, RollbackSpec, RootCauseHypothesis, Severity, Violation,
};
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

/// Benefit ceiling applied to every policy
const BENEFIT_CAP: f64 = 0.95;

fn severity_weight(priority: PolicyPriority) -> f64 {
    match priority {
        PolicyPriority::Critical => 0.95,
        PolicyPriority::High => 0.85,
        PolicyPriority::Medium => 0.70,
        PolicyPriority::Low => 0.50,
    }
}

/// Planner stage of the autonomic loop. Stateless; all knobs come from
/// configuration and the advisory snapshot.
pub struct Planner {
    config: PlannerConfig,
}

impl Planner {
    pub fn new(config: PlannerConfig) -> Self {
        Planner { config }
    }

    /// Produce one candidate policy per actionable hypothesis. Policies
    /// with non-positive score are discarded here; unknown causes are
    /// escalated to operators rather than planned for.
    pub fn plan(
        &self,
        analysis: &AnalysisResult,
        advisory: &AdvisorySnapshot,
        violations: &[Violation],
    ) -> Vec<RemediationPolicy> {
        let mut policies = Vec::new();

        for hypothesis in &analysis.hypotheses {
            if hypothesis.cause == CauseTag::Unknown
                || hypothesis.confidence < self.config.min_hypothesis_confidence
            {
                info!(
                    cause = ?hypothesis.cause,
                    confidence = hypothesis.confidence,
                    "not actionable, escalating to operators"
                );
                continue;
            }

            let priority = self.priority_for(hypothesis, analysis, violations);
            let mut actions = self.actions_for(hypothesis.cause);
            self.apply_advisory_override(hypothesis.cause, advisory, &mut actions);

            let total_cost: f64 = actions.iter().map(|a| a.estimated_cost).sum();
            let benefit =
                (hypothesis.confidence * severity_weight(priority)).min(BENEFIT_CAP);
            let score = benefit - total_cost;
            if score <= 0.0 {
                debug!(cause = ?hypothesis.cause, score, "discarding non-positive score");
                continue;
            }

            let policy = RemediationPolicy {
                policy_id: Uuid::new_v4(),
                priority,
                approval_state: self.initial_approval_state(priority, &actions),
                actions,
                rationale: analysis.analysis_id,
                estimated_benefit: benefit,
                score,
                created_at: Utc::now(),
            };
            policies.push(policy);
        }

        policies
    }

    /// Pick the highest-scoring policy at or above the threshold
    pub fn select_best(
        &self,
        policies: Vec<RemediationPolicy>,
        threshold: f64,
    ) -> Option<RemediationPolicy> {
        policies
            .into_iter()
            .filter(|p| p.score >= threshold)
            .max_by(|a, b| {
                a.score
                    .partial_cmp(&b.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }

    /// Priority derives from the highest-severity violation contributing
    /// to the hypothesis
    fn priority_for(
        &self,
        hypothesis: &RootCauseHypothesis,
        analysis: &AnalysisResult,
        violations: &[Violation],
    ) -> PolicyPriority {
        let by_id: HashMap<u64, &Violation> = violations.iter().map(|v| (v.id, v)).collect();
        let max_severity = hypothesis
            .contributing_patterns
            .iter()
            .filter_map(|&i| analysis.patterns.get(i))
            .flat_map(|p| p.evidence.iter())
            .filter_map(|id| by_id.get(id))
            .map(|v| v.kind)
            .max();

        match max_severity {
            Some(Severity::Critical) => PolicyPriority::Critical,
            Some(Severity::Warning) => PolicyPriority::High,
            Some(Severity::Info) => PolicyPriority::Low,
            None => PolicyPriority::Medium,
        }
    }

    /// Strategy table: cause tag to ordered action template
    fn actions_for(&self, cause: CauseTag) -> Vec<RemediationAction> {
        let costs = &self.config.action_costs;
        let mk = |action_type: ActionType,
                  target: &str,
                  parameters: HashMap<String, serde_json::Value>,
                  rollback: RollbackSpec| {
            RemediationAction {
                action_type,
                target: target.to_string(),
                parameters,
                estimated_cost: costs.cost(action_type),
                rollback,
            }
        };
        let inverse = |action_type: ActionType, parameters: HashMap<String, serde_json::Value>| {
            RollbackSpec::Inverse {
                action_type,
                parameters,
            }
        };

        match cause {
            CauseTag::ValidationLatency => vec![
                mk(
                    ActionType::ScaleUp,
                    "workers",
                    HashMap::from([("delta".into(), serde_json::json!(2))]),
                    inverse(
                        ActionType::ScaleDown,
                        HashMap::from([("delta".into(), serde_json::json!(2))]),
                    ),
                ),
                mk(
                    ActionType::UpdateConfig,
                    "limits",
                    HashMap::from([("max_concurrent_pct".into(), serde_json::json!(20))]),
                    inverse(
                        ActionType::UpdateConfig,
                        HashMap::from([("restore_previous".into(), serde_json::json!(true))]),
                    ),
                ),
            ],
            CauseTag::PolicyMisconfiguration => vec![mk(
                ActionType::ApplyPolicy,
                "charter",
                HashMap::from([("corrected".into(), serde_json::json!(true))]),
                inverse(
                    ActionType::ApplyPolicy,
                    HashMap::from([("restore_previous".into(), serde_json::json!(true))]),
                ),
            )],
            CauseTag::CascadingFailure => vec![
                mk(
                    ActionType::EmergencyOverride,
                    "mesh",
                    HashMap::new(),
                    inverse(
                        ActionType::EmergencyOverride,
                        HashMap::from([("clear".into(), serde_json::json!(true))]),
                    ),
                ),
                mk(
                    ActionType::Throttle,
                    "ingress",
                    HashMap::from([("rate_pct".into(), serde_json::json!(50))]),
                    inverse(
                        ActionType::Throttle,
                        HashMap::from([("release".into(), serde_json::json!(true))]),
                    ),
                ),
            ],
            CauseTag::ResourceExhaustion => vec![
                mk(
                    ActionType::ScaleUp,
                    "capacity",
                    HashMap::from([("delta".into(), serde_json::json!(2))]),
                    inverse(
                        ActionType::ScaleDown,
                        HashMap::from([("delta".into(), serde_json::json!(2))]),
                    ),
                ),
                mk(
                    ActionType::Rebalance,
                    "mesh",
                    HashMap::new(),
                    RollbackSpec::NoOp,
                ),
            ],
            CauseTag::SystemInstability => vec![
                mk(
                    ActionType::Rebalance,
                    "mesh",
                    HashMap::new(),
                    RollbackSpec::NoOp,
                ),
                mk(
                    ActionType::RestartService,
                    "unstable",
                    HashMap::new(),
                    RollbackSpec::NoOp,
                ),
            ],
            CauseTag::Unknown => Vec::new(),
        }
    }

    /// Advisory patterns override the default first action when the
    /// knowledge store has seen the alternative work reliably
    fn apply_advisory_override(
        &self,
        cause: CauseTag,
        advisory: &AdvisorySnapshot,
        actions: &mut [RemediationAction],
    ) {
        let Some(best) = advisory.best_actions.get(&cause) else {
            return;
        };
        if best.success_rate < 0.7 || best.confidence < 0.5 {
            return;
        }
        let Some(first) = actions.first_mut() else {
            return;
        };
        if first.action_type == best.action_type {
            return;
        }
        debug!(
            cause = ?cause,
            advised = best.action_type.as_str(),
            "advisory override replaces default action"
        );
        first.action_type = best.action_type;
        first.estimated_cost = self.config.action_costs.cost(best.action_type);
        first.rollback = RollbackSpec::NoOp;
    }

    fn initial_approval_state(
        &self,
        priority: PolicyPriority,
        actions: &[RemediationAction],
    ) -> ApprovalState {
        let max_cost = actions.iter().map(|a| a.estimated_cost).fold(0.0, f64::max);
        if max_cost > self.config.governance_cost_threshold {
            return ApprovalState::Pending;
        }
        if !self.config.auto_approve && priority != PolicyPriority::Critical {
            return ApprovalState::Pending;
        }
        ApprovalState::Approved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use meshguard_common::types::{AdvisoryAction, Pattern, PatternKind};

    fn analysis_with(cause: CauseTag, confidence: f64, severity: Severity) -> (AnalysisResult, Vec<Violation>) {
        let now = Utc::now();
        let violations: Vec<Violation> = (0..6)
            .map(|i| Violation {
                id: i + 1,
                kind: severity,
                source_component: "validator".into(),
                metric_name: "validation_latency_p99".into(),
                observed_value: 2.0,
                threshold: 1.0,
                detected_at: now + ChronoDuration::seconds(i as i64),
                correlation_key: "router-a".into(),
            })
            .collect();

        let pattern = Pattern {
            kind: PatternKind::TemporalBurst,
            evidence: violations.iter().map(|v| v.id).collect(),
            confidence,
            subject: "router-a".into(),
        };
        let analysis = AnalysisResult {
            analysis_id: Uuid::new_v4(),
            window_start: now - ChronoDuration::seconds(60),
            window_end: now,
            patterns: vec![pattern],
            hypotheses: vec![RootCauseHypothesis {
                cause,
                contributing_patterns: vec![0],
                confidence,
                recommendations: Vec::new(),
            }],
            overall_confidence: confidence,
            timestamp: now,
        };
        (analysis, violations)
    }

    fn planner() -> Planner {
        Planner::new(PlannerConfig::default())
    }

    #[test]
    fn burst_hypothesis_prices_scale_up_policy() {
        let (analysis, violations) =
            analysis_with(CauseTag::ValidationLatency, 0.85, Severity::Critical);
        let policies = planner().plan(&analysis, &AdvisorySnapshot::default(), &violations);

        assert_eq!(policies.len(), 1);
        let policy = &policies[0];
        assert_eq!(policy.priority, PolicyPriority::Critical);
        assert_eq!(policy.actions.len(), 2);
        assert_eq!(policy.actions[0].action_type, ActionType::ScaleUp);
        assert_eq!(policy.actions[1].action_type, ActionType::UpdateConfig);
        // benefit = min(0.95, 0.85 * 0.95), cost = 0.15 + 0.35
        assert!((policy.estimated_benefit - 0.8075).abs() < 1e-9);
        assert!((policy.score - 0.3075).abs() < 1e-9);
        assert_eq!(policy.approval_state, ApprovalState::Approved);
        assert_eq!(policy.rationale, analysis.analysis_id);
    }

    #[test]
    fn non_positive_scores_are_discarded() {
        // Low severity drags benefit below the action costs
        let (analysis, violations) =
            analysis_with(CauseTag::ValidationLatency, 0.55, Severity::Info);
        let policies = planner().plan(&analysis, &AdvisorySnapshot::default(), &violations);
        assert!(policies.is_empty());
    }

    #[test]
    fn low_confidence_hypotheses_are_not_planned() {
        let (analysis, violations) =
            analysis_with(CauseTag::ValidationLatency, 0.3, Severity::Critical);
        let policies = planner().plan(&analysis, &AdvisorySnapshot::default(), &violations);
        assert!(policies.is_empty());
    }

    #[test]
    fn unknown_cause_escalates_without_policy() {
        let (analysis, violations) = analysis_with(CauseTag::Unknown, 0.9, Severity::Critical);
        let policies = planner().plan(&analysis, &AdvisorySnapshot::default(), &violations);
        assert!(policies.is_empty());
    }

    #[test]
    fn governance_threshold_marks_policy_pending() {
        let (analysis, violations) =
            analysis_with(CauseTag::CascadingFailure, 0.9, Severity::Critical);
        let policies = planner().plan(&analysis, &AdvisorySnapshot::default(), &violations);
        assert_eq!(policies.len(), 1);
        // emergency_override costs 0.60, above the 0.50 governance bar
        assert_eq!(policies[0].approval_state, ApprovalState::Pending);
    }

    #[test]
    fn manual_approval_mode_holds_non_critical_policies() {
        let mut config = PlannerConfig::default();
        config.auto_approve = false;
        let planner = Planner::new(config);

        let (analysis, violations) =
            analysis_with(CauseTag::ValidationLatency, 0.85, Severity::Warning);
        let policies = planner.plan(&analysis, &AdvisorySnapshot::default(), &violations);
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].priority, PolicyPriority::High);
        assert_eq!(policies[0].approval_state, ApprovalState::Pending);
    }

    #[test]
    fn advisory_override_replaces_default_action() {
        let (analysis, violations) =
            analysis_with(CauseTag::ValidationLatency, 0.85, Severity::Critical);
        let mut advisory = AdvisorySnapshot::default();
        advisory.best_actions.insert(
            CauseTag::ValidationLatency,
            AdvisoryAction {
                action_type: ActionType::Throttle,
                success_rate: 0.9,
                confidence: 0.8,
            },
        );
        let policies = planner().plan(&analysis, &advisory, &violations);
        assert_eq!(policies[0].actions[0].action_type, ActionType::Throttle);
        assert!(
            (policies[0].actions[0].estimated_cost - 0.25).abs() < 1e-9,
            "cost follows the advised action type"
        );
    }

    #[test]
    fn weak_advisory_is_ignored() {
        let (analysis, violations) =
            analysis_with(CauseTag::ValidationLatency, 0.85, Severity::Critical);
        let mut advisory = AdvisorySnapshot::default();
        advisory.best_actions.insert(
            CauseTag::ValidationLatency,
            AdvisoryAction {
                action_type: ActionType::Throttle,
                success_rate: 0.6,
                confidence: 0.8,
            },
        );
        let policies = planner().plan(&analysis, &advisory, &violations);
        assert_eq!(policies[0].actions[0].action_type, ActionType::ScaleUp);
    }

    #[test]
    fn select_best_enforces_threshold() {
        let (analysis, violations) =
            analysis_with(CauseTag::ValidationLatency, 0.85, Severity::Critical);
        let planner = planner();
        let policies = planner.plan(&analysis, &AdvisorySnapshot::default(), &violations);

        assert!(planner.select_best(policies.clone(), 0.9).is_none());
        let best = planner.select_best(policies, 0.1).unwrap();
        assert!(best.score >= 0.1);
    }
}
