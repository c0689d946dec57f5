//! Core data model for the meshguard control plane

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for remediation policies
pub type PolicyId = Uuid;

/// Unique identifier for analysis results
pub type AnalysisId = Uuid;

/// Monotonic identifier for violations
pub type ViolationId = u64;

/// One typed sample pulled from the external time-series store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Summary statistics over one observation window
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SummaryStats {
    pub count: usize,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
}

impl SummaryStats {
    /// Compute summary statistics from raw values. Returns a zeroed
    /// summary for an empty slice.
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return SummaryStats {
                count: 0,
                mean: 0.0,
                p50: 0.0,
                p95: 0.0,
                p99: 0.0,
                min: 0.0,
                max: 0.0,
            };
        }

        let mut sorted: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        if sorted.is_empty() {
            return Self::from_values(&[]);
        }

        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();
        let pct = |p: f64| -> f64 {
            let idx = ((count as f64 - 1.0) * p).round() as usize;
            sorted[idx.min(count - 1)]
        };

        SummaryStats {
            count,
            mean: sum / count as f64,
            p50: pct(0.50),
            p95: pct(0.95),
            p99: pct(0.99),
            min: sorted[0],
            max: sorted[count - 1],
        }
    }

    /// Sample standard deviation of the window the stats were built from
    pub fn stddev(values: &[f64]) -> f64 {
        let clean: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
        if clean.len() < 2 {
            return 0.0;
        }
        let mean = clean.iter().sum::<f64>() / clean.len() as f64;
        let var =
            clean.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (clean.len() - 1) as f64;
        var.sqrt()
    }
}

/// A window of metric samples for a single metric name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub metric: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub samples: Vec<MetricSample>,
    pub stats: SummaryStats,
}

/// Violation severity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info = 1,
    Warning = 2,
    Critical = 3,
}

/// A threshold breach observed by the monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub id: ViolationId,
    pub kind: Severity,
    pub source_component: String,
    pub metric_name: String,
    pub observed_value: f64,
    pub threshold: f64,
    pub detected_at: DateTime<Utc>,
    pub correlation_key: String,
}

/// Output of one monitor tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorOutput {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub observations: Vec<Observation>,
    pub violations: Vec<Violation>,
}

/// Kinds of anomaly patterns the analyzer detects
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PatternKind {
    TemporalBurst,
    SpatialCluster,
    CausalPair,
    FrequencyAnomaly,
}

/// A detected anomaly pattern with supporting evidence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub kind: PatternKind,
    /// Ids of the violations backing this pattern
    pub evidence: Vec<ViolationId>,
    pub confidence: f64,
    /// Human-oriented summary of what matched (key, component, pair…)
    pub subject: String,
}

impl Pattern {
    /// Newest violation id in the evidence set, used for overlap tie-breaks
    pub fn newest_evidence(&self) -> ViolationId {
        self.evidence.iter().copied().max().unwrap_or(0)
    }
}

/// Root-cause tags the planner knows strategies for
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CauseTag {
    ValidationLatency,
    PolicyMisconfiguration,
    CascadingFailure,
    ResourceExhaustion,
    SystemInstability,
    Unknown,
}

impl CauseTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            CauseTag::ValidationLatency => "validation_latency",
            CauseTag::PolicyMisconfiguration => "policy_misconfiguration",
            CauseTag::CascadingFailure => "cascading_failure",
            CauseTag::ResourceExhaustion => "resource_exhaustion",
            CauseTag::SystemInstability => "system_instability",
            CauseTag::Unknown => "unknown",
        }
    }

    pub const ALL: [CauseTag; 6] = [
        CauseTag::ValidationLatency,
        CauseTag::PolicyMisconfiguration,
        CauseTag::CascadingFailure,
        CauseTag::ResourceExhaustion,
        CauseTag::SystemInstability,
        CauseTag::Unknown,
    ];

    pub fn from_str_name(name: &str) -> Option<CauseTag> {
        CauseTag::ALL.iter().copied().find(|c| c.as_str() == name)
    }
}

/// A ranked root-cause hypothesis derived from one or more patterns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootCauseHypothesis {
    pub cause: CauseTag,
    /// Indexes into `AnalysisResult::patterns`
    pub contributing_patterns: Vec<usize>,
    pub confidence: f64,
    pub recommendations: Vec<String>,
}

/// Result of one analyzer pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub analysis_id: AnalysisId,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub patterns: Vec<Pattern>,
    pub hypotheses: Vec<RootCauseHypothesis>,
    pub overall_confidence: f64,
    pub timestamp: DateTime<Utc>,
}

/// Remediation action vocabulary
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActionType {
    ScaleUp,
    ScaleDown,
    RestartService,
    ApplyPolicy,
    BypassValidation,
    Throttle,
    EmergencyOverride,
    Rebalance,
    UpdateConfig,
}

impl ActionType {
    /// Stable snake-case name used for persistence keys and the charter
    /// action vocabulary
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::ScaleUp => "scale_up",
            ActionType::ScaleDown => "scale_down",
            ActionType::RestartService => "restart_service",
            ActionType::ApplyPolicy => "apply_policy",
            ActionType::BypassValidation => "bypass_validation",
            ActionType::Throttle => "throttle",
            ActionType::EmergencyOverride => "emergency_override",
            ActionType::Rebalance => "rebalance",
            ActionType::UpdateConfig => "update_config",
        }
    }

    /// Inverse of [`ActionType::as_str`], used when loading persisted keys
    pub fn from_str_name(name: &str) -> Option<ActionType> {
        ActionType::ALL.iter().copied().find(|a| a.as_str() == name)
    }

    pub const ALL: [ActionType; 9] = [
        ActionType::ScaleUp,
        ActionType::ScaleDown,
        ActionType::RestartService,
        ActionType::ApplyPolicy,
        ActionType::BypassValidation,
        ActionType::Throttle,
        ActionType::EmergencyOverride,
        ActionType::Rebalance,
        ActionType::UpdateConfig,
    ];
}

/// How an action is undone if a later action in the same policy fails
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RollbackSpec {
    /// Nothing to undo
    NoOp,
    /// Apply the inverse action against the same target
    Inverse {
        action_type: ActionType,
        parameters: HashMap<String, serde_json::Value>,
    },
}

/// One step of a remediation policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationAction {
    pub action_type: ActionType,
    pub target: String,
    pub parameters: HashMap<String, serde_json::Value>,
    pub estimated_cost: f64,
    pub rollback: RollbackSpec,
}

impl RemediationAction {
    /// Serialization key for executor-level mutual exclusion
    pub fn serialization_key(&self) -> (ActionType, String) {
        (self.action_type, self.target.clone())
    }
}

/// Policy priority, derived from the highest-severity contributing violation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PolicyPriority {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

/// Governance state of a policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
    Superseded,
}

/// An ordered list of remediation actions with a shared rationale
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationPolicy {
    pub policy_id: PolicyId,
    pub priority: PolicyPriority,
    pub actions: Vec<RemediationAction>,
    /// Analysis that motivated this policy
    pub rationale: AnalysisId,
    pub estimated_benefit: f64,
    pub score: f64,
    pub approval_state: ApprovalState,
    pub created_at: DateTime<Utc>,
}

impl RemediationPolicy {
    pub fn total_cost(&self) -> f64 {
        self.actions.iter().map(|a| a.estimated_cost).sum()
    }

    pub fn max_action_cost(&self) -> f64 {
        self.actions
            .iter()
            .map(|a| a.estimated_cost)
            .fold(0.0, f64::max)
    }
}

/// Per-action outcome inside an execution record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ActionStatus {
    Applied,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action_type: ActionType,
    pub target: String,
    pub status: ActionStatus,
    pub error: Option<String>,
    pub rolled_back_at: Option<DateTime<Utc>>,
}

/// Terminal state of one policy execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OverallStatus {
    Completed,
    Failed,
    RolledBack,
    Partial,
    Cancelled,
}

/// Immutable record of one policy execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub policy_id: PolicyId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub action_results: Vec<ActionRecord>,
    pub overall_status: OverallStatus,
    pub violations_before: usize,
    pub violations_after: usize,
    pub success_rate: f64,
}

/// Outcome classes the knowledge store derives from execution records
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutcomeClass {
    Success,
    Partial,
    Ineffective,
    Degradation,
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OutcomeClassification {
    pub class: OutcomeClass,
    pub confidence: f64,
}

/// Per-action-type success statistics maintained by the knowledge store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionPattern {
    pub action_type: ActionType,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub success_rate: f64,
    pub avg_time_to_effect_ms: f64,
    pub avg_violations_resolved: f64,
    pub confidence: f64,
}

impl ActionPattern {
    pub fn new(action_type: ActionType) -> Self {
        ActionPattern {
            action_type,
            total_executions: 0,
            successful_executions: 0,
            success_rate: 0.0,
            avg_time_to_effect_ms: 0.0,
            avg_violations_resolved: 0.0,
            confidence: 0.0,
        }
    }
}

/// An advisory rule surfaced by the knowledge store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub cause: CauseTag,
    pub action_type: ActionType,
    pub previous_success_rate: f64,
    pub current_success_rate: f64,
    pub generated_at: DateTime<Utc>,
}

/// Best known remediation for a cause, surfaced by the knowledge store
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdvisoryAction {
    pub action_type: ActionType,
    pub success_rate: f64,
    pub confidence: f64,
}

/// Immutable snapshot of knowledge advisories, handed to the monitor and
/// planner at the start of a tick. Updates apply to the next tick only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdvisorySnapshot {
    /// Best known action per cause tag
    pub best_actions: HashMap<CauseTag, AdvisoryAction>,
    /// Multiplier applied to the adaptive-threshold width per metric name.
    /// Values below 1.0 narrow the band after repeated low-value violations.
    pub threshold_narrowing: HashMap<String, f64>,
}
