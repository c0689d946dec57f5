//! Configuration for the meshguard control plane
//!
//! No option is read from implicit sources; the embedding host supplies the
//! whole tree explicitly (typically from a JSON file handed to the daemon).

use crate::error::{Error, Result};
use crate::types::{ActionType, Severity};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lowest accepted orchestrator cadence. The default stays at 30 s; hosts
/// chasing tighter detection targets may configure down to this floor.
pub const MIN_INTERVAL_SECONDS: u64 = 1;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    pub endpoints: EndpointsConfig,
    pub monitor: MonitorConfig,
    pub analyzer: AnalyzerConfig,
    pub planner: PlannerConfig,
    pub executor: ExecutorConfig,
    pub knowledge: KnowledgeConfig,
    pub federated: FederatedConfig,
}

/// Upstream service endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointsConfig {
    /// Base URL of the external time-series store
    pub metrics_url: String,
    /// Base URL of the policy-enforcement (charter) service
    pub charter_url: String,
}

/// One fixed range query the monitor issues every tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricQuery {
    /// Metric name the parsed samples are filed under
    pub metric: String,
    /// Opaque expression in the upstream store's dialect
    pub expression: String,
    /// Component violations on this metric are attributed to
    pub source_component: String,
    /// Label whose value becomes the violation correlation key
    pub correlation_label: String,
}

/// Adaptive threshold rule for one metric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub metric: String,
    /// Base threshold; the effective value is `base + k * sigma_recent`
    /// clamped into `[envelope_min, envelope_max]`
    pub base: f64,
    pub sigma_factor: f64,
    pub envelope_min: f64,
    pub envelope_max: f64,
    /// Severity assigned when the observed value breaches the threshold
    pub severity: Severity,
    /// Breaches at or above `base * critical_multiplier` escalate to critical
    pub critical_multiplier: f64,
}

/// Monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Orchestrator cadence in seconds
    pub interval_seconds: u64,
    /// Observation window in seconds
    pub window_seconds: u64,
    /// Maximum age of last-good observations before a stale violation
    pub staleness_budget_seconds: u64,
    /// Bound on concurrently in-flight range queries
    pub query_concurrency: usize,
    /// Per-query deadline in milliseconds
    pub query_timeout_ms: u64,
    /// Alert drain budget in milliseconds
    pub alert_drain_timeout_ms: u64,
    /// Ticks with fewer violations than this emit a heartbeat and skip the
    /// analyze/plan/execute stages
    pub plan_threshold: usize,
    pub queries: Vec<MetricQuery>,
    pub thresholds: Vec<ThresholdRule>,
}

/// Alert sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSinkConfig {
    pub queue_capacity: usize,
    /// Sliding dedup window for `(alertname, fingerprint)` pairs
    pub dedup_window_seconds: u64,
}

/// Analyzer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Temporal burst: minimum violations on one correlation key
    pub burst_min_violations: usize,
    /// Temporal burst: sliding window in seconds
    pub burst_window_seconds: u64,
    /// Spatial cluster: minimum violations sharing a source component
    pub cluster_min_violations: usize,
    /// Whitelisted metric pairs evaluated for causal correlation
    pub causal_pairs: Vec<(String, String)>,
    /// Minimum absolute rank correlation for a causal pattern
    pub causal_correlation_threshold: f64,
    /// Maximum sample lag explored when correlating a pair
    pub causal_max_lag: usize,
    /// Frequency anomaly: z-score over the rolling baseline
    pub frequency_z: f64,
    /// Rolling baseline length, in ticks
    pub baseline_window: usize,
}

/// Fixed per-action-type cost table used by the planner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionCosts {
    pub scale_up: f64,
    pub scale_down: f64,
    pub restart_service: f64,
    pub apply_policy: f64,
    pub bypass_validation: f64,
    pub throttle: f64,
    pub emergency_override: f64,
    pub rebalance: f64,
    pub update_config: f64,
}

impl ActionCosts {
    pub fn cost(&self, action: ActionType) -> f64 {
        match action {
            ActionType::ScaleUp => self.scale_up,
            ActionType::ScaleDown => self.scale_down,
            ActionType::RestartService => self.restart_service,
            ActionType::ApplyPolicy => self.apply_policy,
            ActionType::BypassValidation => self.bypass_validation,
            ActionType::Throttle => self.throttle,
            ActionType::EmergencyOverride => self.emergency_override,
            ActionType::Rebalance => self.rebalance,
            ActionType::UpdateConfig => self.update_config,
        }
    }
}

impl Default for ActionCosts {
    fn default() -> Self {
        ActionCosts {
            scale_up: 0.15,
            scale_down: 0.05,
            restart_service: 0.20,
            apply_policy: 0.30,
            bypass_validation: 0.70,
            throttle: 0.25,
            emergency_override: 0.60,
            rebalance: 0.20,
            update_config: 0.35,
        }
    }
}

/// Planner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Minimum score a policy needs to be selected
    pub score_threshold: f64,
    /// If false, every non-critical policy requires external approval
    pub auto_approve: bool,
    /// Per-action cost above which a policy needs governance approval
    pub governance_cost_threshold: f64,
    /// Minimum hypothesis confidence a policy may be built from
    pub min_hypothesis_confidence: f64,
    pub action_costs: ActionCosts,
}

/// Executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub action_timeout_seconds: u64,
    pub max_retries: u32,
    /// Quiet period before re-reading metrics to verify effects
    pub settle_seconds: u64,
    pub retry_base_delay_ms: u64,
}

/// Knowledge store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    /// Sample count at which action-pattern confidence saturates
    pub saturation_samples: u64,
    /// Bound on the in-memory ring of recent execution records
    pub record_history: usize,
    /// Insights are generated every this many orchestrator cycles
    pub insight_interval_cycles: u64,
    /// Directory for the durable sled store
    pub store_path: PathBuf,
}

/// Robust aggregation mode, selected per round from configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMode {
    Krum,
    MultiKrum,
    TrimmedMean,
    Median,
}

/// Outlier-fraction estimator driving the adaptive trim fraction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutlierEstimator {
    Iqr,
    ZScore,
    Mad,
}

/// Gradient compression scheme
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompressionKind {
    None,
    TopK,
    Int8,
    TopKInt8,
}

/// Client sampling strategy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    Uniform,
    ConvergenceWeighted,
    ResourceAware,
}

/// Differential-privacy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DpConfig {
    pub enabled: bool,
    /// L2 clipping norm applied to every update before aggregation
    pub clip_norm: f64,
    /// Gaussian noise scale added to the aggregate
    pub noise_sigma: f64,
    /// Total epsilon available across rounds
    pub epsilon_budget: f64,
    /// Epsilon charged per published round
    pub epsilon_per_round: f64,
    pub delta: f64,
}

/// Compression configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    pub scheme: CompressionKind,
    /// Fraction of coordinates retained by top-k sparsification
    pub topk_fraction: f64,
}

/// Per-round training hyperparameters fanned out to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingParams {
    pub learning_rate: f64,
    pub local_epochs: u32,
    pub batch_size: u32,
}

/// Federated-learning aggregator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederatedConfig {
    pub clients_per_round: usize,
    pub round_deadline_seconds: u64,
    pub min_participants: usize,
    /// Aggregation starts early once this fraction of sampled clients
    /// reported, without waiting out the deadline
    pub quorum_fraction: f64,
    pub aggregation_mode: AggregationMode,
    /// Byzantine tolerance parameter `f` for krum variants
    pub byzantine_f: usize,
    /// Trim fraction ceiling for the trimmed mean
    pub trim_fraction_beta: f64,
    pub outlier_estimator: OutlierEstimator,
    /// Number of selections averaged by multi-krum
    pub multi_krum_m: usize,
    pub sampling_strategy: SamplingStrategy,
    pub compression: CompressionConfig,
    pub dp: DpConfig,
    /// Late updates within this window after the deadline carry into the
    /// next round; older ones are discarded
    pub grace_window_seconds: u64,
    /// Published model versions retained for stragglers
    pub straggler_window_versions: usize,
    /// Number of disjoint client partitions served by aggregator shards
    pub shards: usize,
    /// Expected gradient dimension; mismatching updates are rejected
    pub model_dimension: usize,
    /// Accepted bounds on a client's reported sample count
    pub min_sample_count: u64,
    pub max_sample_count: u64,
    pub training: TrainingParams,
    /// Directory for the durable checkpoint store
    pub checkpoint_path: PathBuf,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        EndpointsConfig {
            metrics_url: "http://127.0.0.1:9090".to_string(),
            charter_url: "http://127.0.0.1:8181".to_string(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            interval_seconds: 30,
            window_seconds: 60,
            staleness_budget_seconds: 120,
            query_concurrency: 4,
            query_timeout_ms: 3_000,
            alert_drain_timeout_ms: 100,
            plan_threshold: 1,
            queries: Vec::new(),
            thresholds: Vec::new(),
        }
    }
}

impl Default for AlertSinkConfig {
    fn default() -> Self {
        AlertSinkConfig {
            queue_capacity: 1024,
            dedup_window_seconds: 300,
        }
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        AnalyzerConfig {
            burst_min_violations: 5,
            burst_window_seconds: 60,
            cluster_min_violations: 4,
            causal_pairs: Vec::new(),
            causal_correlation_threshold: 0.8,
            causal_max_lag: 5,
            frequency_z: 3.0,
            baseline_window: 20,
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        PlannerConfig {
            score_threshold: 0.1,
            auto_approve: true,
            governance_cost_threshold: 0.50,
            min_hypothesis_confidence: 0.5,
            action_costs: ActionCosts::default(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            action_timeout_seconds: 10,
            max_retries: 2,
            settle_seconds: 5,
            retry_base_delay_ms: 500,
        }
    }
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        KnowledgeConfig {
            saturation_samples: 30,
            record_history: 256,
            insight_interval_cycles: 10,
            store_path: PathBuf::from("./data/knowledge"),
        }
    }
}

impl Default for DpConfig {
    fn default() -> Self {
        DpConfig {
            enabled: true,
            clip_norm: 1.0,
            noise_sigma: 0.01,
            epsilon_budget: 10.0,
            epsilon_per_round: 0.1,
            delta: 1e-5,
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig {
            scheme: CompressionKind::TopKInt8,
            topk_fraction: 0.1,
        }
    }
}

impl Default for TrainingParams {
    fn default() -> Self {
        TrainingParams {
            learning_rate: 0.01,
            local_epochs: 1,
            batch_size: 32,
        }
    }
}

impl Default for FederatedConfig {
    fn default() -> Self {
        FederatedConfig {
            clients_per_round: 10,
            round_deadline_seconds: 60,
            min_participants: 5,
            quorum_fraction: 1.0,
            aggregation_mode: AggregationMode::MultiKrum,
            byzantine_f: 2,
            trim_fraction_beta: 0.2,
            outlier_estimator: OutlierEstimator::Iqr,
            multi_krum_m: 5,
            sampling_strategy: SamplingStrategy::Uniform,
            compression: CompressionConfig::default(),
            dp: DpConfig::default(),
            grace_window_seconds: 10,
            straggler_window_versions: 3,
            shards: 1,
            model_dimension: 64,
            min_sample_count: 1,
            max_sample_count: 1_000_000,
            training: TrainingParams::default(),
            checkpoint_path: PathBuf::from("./data/models"),
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        MeshConfig {
            endpoints: EndpointsConfig::default(),
            monitor: MonitorConfig::default(),
            analyzer: AnalyzerConfig::default(),
            planner: PlannerConfig::default(),
            executor: ExecutorConfig::default(),
            knowledge: KnowledgeConfig::default(),
            federated: FederatedConfig::default(),
        }
    }
}

impl MeshConfig {
    /// Validate cross-field constraints. Invalid values are rejected rather
    /// than clamped so a bad deployment fails loudly at startup.
    pub fn validate(&self) -> Result<()> {
        if self.monitor.interval_seconds < MIN_INTERVAL_SECONDS {
            return Err(Error::Configuration(format!(
                "monitor.interval_seconds {} is below the {}s floor",
                self.monitor.interval_seconds, MIN_INTERVAL_SECONDS
            )));
        }
        if self.monitor.query_concurrency == 0 {
            return Err(Error::Configuration(
                "monitor.query_concurrency must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.planner.score_threshold) {
            return Err(Error::Configuration(
                "planner.score_threshold must be within [0, 1]".into(),
            ));
        }
        let fl = &self.federated;
        if fl.min_participants > fl.clients_per_round {
            return Err(Error::Configuration(
                "fl.min_participants cannot exceed fl.clients_per_round".into(),
            ));
        }
        if !(0.0..0.5).contains(&fl.trim_fraction_beta) {
            return Err(Error::Configuration(
                "fl.trim_fraction_beta must be within [0, 0.5)".into(),
            ));
        }
        if !(0.0..=1.0).contains(&fl.quorum_fraction) {
            return Err(Error::Configuration(
                "fl.quorum_fraction must be within [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&fl.compression.topk_fraction) || fl.compression.topk_fraction == 0.0
        {
            return Err(Error::Configuration(
                "fl.compression.topk_fraction must be within (0, 1]".into(),
            ));
        }
        if fl.shards == 0 || fl.model_dimension == 0 {
            return Err(Error::Configuration(
                "fl.shards and fl.model_dimension must be at least 1".into(),
            ));
        }
        if fl.dp.enabled && fl.dp.epsilon_per_round <= 0.0 {
            return Err(Error::Configuration(
                "fl.dp.epsilon_per_round must be positive when dp is enabled".into(),
            ));
        }
        Ok(())
    }
}
