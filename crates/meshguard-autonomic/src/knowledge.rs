//! Knowledge stage: outcome classification, per-action success statistics,
//! and the advisory snapshot fed back to the monitor and planner
//!
//! Action patterns and the execution-record log are durable across
//! restarts; everything else is rebuilt from them at startup.

use chrono::Utc;
use meshguard_common::config::KnowledgeConfig;
use meshguard_common::types::{
    ActionPattern, ActionType, AdvisoryAction, AdvisorySnapshot, CauseTag, ExecutionRecord,
    Insight, OutcomeClass, OutcomeClassification, OverallStatus, RemediationPolicy, Violation,
};
use meshguard_common::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Stamped into every persisted record so later readers can migrate
const SCHEMA_VERSION: u32 = 1;

/// Rate change that qualifies as an insight
const INSIGHT_MIN_DELTA: f64 = 0.05;

/// Floor for the advisory threshold-narrowing multiplier
const NARROWING_FLOOR: f64 = 0.6;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedRecord {
    schema_version: u32,
    record: ExecutionRecord,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CauseActionStats {
    total: u64,
    successful: u64,
    success_rate: f64,
}

/// Knowledge stage of the autonomic loop
pub struct Knowledge {
    config: KnowledgeConfig,
    db: sled::Db,
    records: sled::Tree,
    pattern_tree: sled::Tree,
    cause_tree: sled::Tree,
    next_seq: AtomicU64,
    patterns: RwLock<HashMap<ActionType, ActionPattern>>,
    cause_stats: RwLock<HashMap<(CauseTag, ActionType), CauseActionStats>>,
    recent: Mutex<VecDeque<ExecutionRecord>>,
    /// Metrics whose remediations keep coming back low-value; drives
    /// advisory threshold narrowing
    low_value: Mutex<HashMap<String, u32>>,
    /// Rates at the time of the last insight pass
    insight_baseline: Mutex<HashMap<(CauseTag, ActionType), f64>>,
}

impl Knowledge {
    /// Open (or create) the durable store and rebuild in-memory state
    pub fn open(config: KnowledgeConfig) -> Result<Self> {
        let db = sled::open(&config.store_path)
            .map_err(|e| Error::Storage(format!("failed to open knowledge store: {}", e)))?;
        let records = db
            .open_tree("execution_records")
            .map_err(|e| Error::Storage(format!("failed to open record log: {}", e)))?;
        let pattern_tree = db
            .open_tree("action_patterns")
            .map_err(|e| Error::Storage(format!("failed to open pattern table: {}", e)))?;
        let cause_tree = db
            .open_tree("cause_stats")
            .map_err(|e| Error::Storage(format!("failed to open cause table: {}", e)))?;

        let mut patterns = HashMap::new();
        for entry in pattern_tree.iter() {
            let (key, value) =
                entry.map_err(|e| Error::Storage(format!("pattern scan: {}", e)))?;
            let Some(action) =
                std::str::from_utf8(&key).ok().and_then(ActionType::from_str_name)
            else {
                continue;
            };
            let pattern: ActionPattern = bincode::deserialize(&value)
                .map_err(|e| Error::Integrity(format!("corrupt action pattern: {}", e)))?;
            patterns.insert(action, pattern);
        }

        let mut cause_stats = HashMap::new();
        for entry in cause_tree.iter() {
            let (key, value) = entry.map_err(|e| Error::Storage(format!("cause scan: {}", e)))?;
            let Some((cause, action)) = decode_cause_key(&key) else {
                continue;
            };
            let stats: CauseActionStats = bincode::deserialize(&value)
                .map_err(|e| Error::Integrity(format!("corrupt cause stats: {}", e)))?;
            cause_stats.insert((cause, action), stats);
        }

        let next_seq = records
            .last()
            .map_err(|e| Error::Storage(format!("record scan: {}", e)))?
            .and_then(|(key, _)| key.as_ref().try_into().ok().map(u64::from_be_bytes))
            .map(|last| last + 1)
            .unwrap_or(0);

        info!(
            patterns = patterns.len(),
            next_seq, "knowledge store opened"
        );

        Ok(Knowledge {
            config,
            db,
            records,
            pattern_tree,
            cause_tree,
            next_seq: AtomicU64::new(next_seq),
            patterns: RwLock::new(patterns),
            cause_stats: RwLock::new(cause_stats),
            recent: Mutex::new(VecDeque::new()),
            low_value: Mutex::new(HashMap::new()),
            insight_baseline: Mutex::new(HashMap::new()),
        })
    }

    /// Classify an execution outcome and append the record to the durable
    /// log
    pub fn record(
        &self,
        _policy: &RemediationPolicy,
        record: &ExecutionRecord,
    ) -> Result<OutcomeClassification> {
        let classification = classify(record);

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let persisted = PersistedRecord {
            schema_version: SCHEMA_VERSION,
            record: record.clone(),
        };
        let bytes = bincode::serialize(&persisted)
            .map_err(|e| Error::Integrity(format!("record encode: {}", e)))?;
        self.records
            .insert(seq.to_be_bytes(), bytes)
            .map_err(|e| Error::Storage(format!("record append: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| Error::Storage(format!("record flush: {}", e)))?;

        let mut recent = self.recent.lock();
        recent.push_back(record.clone());
        while recent.len() > self.config.record_history {
            recent.pop_front();
        }

        debug!(
            policy_id = %record.policy_id,
            class = ?classification.class,
            confidence = classification.confidence,
            "outcome recorded"
        );
        Ok(classification)
    }

    /// Update per-action and per-cause statistics from a classified
    /// outcome. Unknown outcomes advance only the execution counter; the
    /// effect was never observed, so rates and averages stay put.
    pub fn update_patterns(
        &self,
        policy: &RemediationPolicy,
        record: &ExecutionRecord,
        classification: OutcomeClassification,
        cause: CauseTag,
    ) -> Result<()> {
        let action_types: HashSet<ActionType> =
            policy.actions.iter().map(|a| a.action_type).collect();
        let observed = classification.class != OutcomeClass::Unknown;
        let successful = matches!(
            classification.class,
            OutcomeClass::Success | OutcomeClass::Partial
        );
        let time_to_effect_ms =
            (record.finished_at - record.started_at).num_milliseconds().max(0) as f64;
        let resolved = record.violations_before.saturating_sub(record.violations_after) as f64;
        let saturation = self.config.saturation_samples.max(1) as f64;

        let mut patterns = self.patterns.write();
        for action_type in &action_types {
            let pattern = patterns
                .entry(*action_type)
                .or_insert_with(|| ActionPattern::new(*action_type));
            pattern.total_executions += 1;
            if observed {
                if successful {
                    pattern.successful_executions += 1;
                }
                pattern.success_rate =
                    pattern.successful_executions as f64 / pattern.total_executions as f64;
                pattern.avg_time_to_effect_ms = running_mean(
                    pattern.avg_time_to_effect_ms,
                    time_to_effect_ms,
                    pattern.total_executions,
                );
                pattern.avg_violations_resolved = running_mean(
                    pattern.avg_violations_resolved,
                    resolved,
                    pattern.total_executions,
                );
            }
            pattern.confidence = (pattern.total_executions as f64 / saturation).min(1.0);

            let bytes = bincode::serialize(pattern)
                .map_err(|e| Error::Integrity(format!("pattern encode: {}", e)))?;
            self.pattern_tree
                .insert(action_type.as_str(), bytes)
                .map_err(|e| Error::Storage(format!("pattern write: {}", e)))?;
        }
        drop(patterns);

        if observed {
            let mut cause_stats = self.cause_stats.write();
            for action_type in &action_types {
                let stats = cause_stats.entry((cause, *action_type)).or_default();
                stats.total += 1;
                if successful {
                    stats.successful += 1;
                }
                stats.success_rate = stats.successful as f64 / stats.total as f64;

                let bytes = bincode::serialize(stats)
                    .map_err(|e| Error::Integrity(format!("cause encode: {}", e)))?;
                self.cause_tree
                    .insert(encode_cause_key(cause, *action_type), bytes)
                    .map_err(|e| Error::Storage(format!("cause write: {}", e)))?;
            }
        }

        self.db
            .flush()
            .map_err(|e| Error::Storage(format!("pattern flush: {}", e)))?;
        Ok(())
    }

    /// Best known action for a cause: highest `success_rate * confidence`
    pub fn advisory_for(&self, cause: CauseTag) -> Option<AdvisoryAction> {
        let saturation = self.config.saturation_samples.max(1) as f64;
        let cause_stats = self.cause_stats.read();
        cause_stats
            .iter()
            .filter(|((c, _), _)| *c == cause)
            .map(|((_, action), stats)| {
                let confidence = (stats.total as f64 / saturation).min(1.0);
                (
                    AdvisoryAction {
                        action_type: *action,
                        success_rate: stats.success_rate,
                        confidence,
                    },
                    stats.success_rate * confidence,
                )
            })
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(advisory, _)| advisory)
    }

    /// Build the immutable advisory snapshot handed to the next tick
    pub fn snapshot(&self) -> AdvisorySnapshot {
        let mut best_actions = HashMap::new();
        for cause in CauseTag::ALL {
            if let Some(advisory) = self.advisory_for(cause) {
                best_actions.insert(cause, advisory);
            }
        }

        let low_value = self.low_value.lock();
        let threshold_narrowing = low_value
            .iter()
            .map(|(metric, count)| {
                let factor = 0.9f64.powi((*count).min(5) as i32).max(NARROWING_FLOOR);
                (metric.clone(), factor)
            })
            .collect();

        AdvisorySnapshot {
            best_actions,
            threshold_narrowing,
        }
    }

    /// Note violations whose remediation produced no observable value;
    /// repeated offenders get their adaptive-threshold band narrowed
    pub fn observe_low_value(&self, violations: &[Violation]) {
        let mut low_value = self.low_value.lock();
        let metrics: HashSet<&str> =
            violations.iter().map(|v| v.metric_name.as_str()).collect();
        for metric in metrics {
            *low_value.entry(metric.to_string()).or_insert(0) += 1;
        }
    }

    /// Surface "action X for cause Y moved from A to B" rules since the
    /// last pass
    pub fn insights(&self) -> Vec<Insight> {
        let cause_stats = self.cause_stats.read();
        let mut baseline = self.insight_baseline.lock();
        let mut insights = Vec::new();

        for ((cause, action), stats) in cause_stats.iter() {
            let previous = baseline.get(&(*cause, *action)).copied().unwrap_or(0.0);
            if (stats.success_rate - previous).abs() >= INSIGHT_MIN_DELTA {
                insights.push(Insight {
                    cause: *cause,
                    action_type: *action,
                    previous_success_rate: previous,
                    current_success_rate: stats.success_rate,
                    generated_at: Utc::now(),
                });
            }
            baseline.insert((*cause, *action), stats.success_rate);
        }
        insights
    }

    /// Recent execution records, newest last
    pub fn recent_records(&self) -> Vec<ExecutionRecord> {
        self.recent.lock().iter().cloned().collect()
    }

    pub fn pattern_for(&self, action: ActionType) -> Option<ActionPattern> {
        self.patterns.read().get(&action).cloned()
    }
}

/// Outcome classification thresholds
fn classify(record: &ExecutionRecord) -> OutcomeClassification {
    let before = record.violations_before;
    let after = record.violations_after;

    let (class, confidence) = match record.overall_status {
        // Effects were never observed
        OverallStatus::RolledBack | OverallStatus::Cancelled | OverallStatus::Failed => {
            (OutcomeClass::Unknown, 0.5)
        }
        // A later action failed and rollback did not fully restore;
        // counts as degradation unless the violations demonstrably fell
        OverallStatus::Partial => {
            if after < before {
                (OutcomeClass::Partial, 0.70)
            } else {
                (OutcomeClass::Degradation, 0.0)
            }
        }
        OverallStatus::Completed => {
            if after == 0 {
                (OutcomeClass::Success, 0.95)
            } else if after > before {
                (OutcomeClass::Degradation, 0.0)
            } else {
                let resolved = (before - after) as f64;
                if before > 0 && resolved / before as f64 > 0.5 {
                    (OutcomeClass::Partial, 0.70)
                } else {
                    (OutcomeClass::Ineffective, 0.40)
                }
            }
        }
    };

    OutcomeClassification { class, confidence }
}

fn running_mean(current: f64, sample: f64, count: u64) -> f64 {
    let n = count.max(1) as f64;
    current + (sample - current) / n
}

fn encode_cause_key(cause: CauseTag, action: ActionType) -> Vec<u8> {
    format!("{}/{}", cause.as_str(), action.as_str()).into_bytes()
}

fn decode_cause_key(key: &[u8]) -> Option<(CauseTag, ActionType)> {
    let text = std::str::from_utf8(key).ok()?;
    let (cause, action) = text.split_once('/')?;
    Some((
        CauseTag::from_str_name(cause)?,
        ActionType::from_str_name(action)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use meshguard_common::types::{
        ActionRecord, ActionStatus, ApprovalState, PolicyPriority, RemediationAction,
        RollbackSpec,
    };
    use tempfile::TempDir;
    use uuid::Uuid;

    fn knowledge(dir: &TempDir) -> Knowledge {
        let config = KnowledgeConfig {
            saturation_samples: 30,
            record_history: 8,
            insight_interval_cycles: 10,
            store_path: dir.path().to_path_buf(),
        };
        Knowledge::open(config).unwrap()
    }

    fn policy_with(action_type: ActionType) -> RemediationPolicy {
        RemediationPolicy {
            policy_id: Uuid::new_v4(),
            priority: PolicyPriority::High,
            actions: vec![RemediationAction {
                action_type,
                target: "workers".into(),
                parameters: HashMap::new(),
                estimated_cost: 0.15,
                rollback: RollbackSpec::NoOp,
            }],
            rationale: Uuid::new_v4(),
            estimated_benefit: 0.8,
            score: 0.3,
            approval_state: ApprovalState::Approved,
            created_at: Utc::now(),
        }
    }

    fn record_with(status: OverallStatus, before: usize, after: usize) -> ExecutionRecord {
        let now = Utc::now();
        ExecutionRecord {
            policy_id: Uuid::new_v4(),
            started_at: now - ChronoDuration::seconds(4),
            finished_at: now,
            action_results: vec![ActionRecord {
                action_type: ActionType::ScaleUp,
                target: "workers".into(),
                status: ActionStatus::Applied,
                error: None,
                rolled_back_at: None,
            }],
            overall_status: status,
            violations_before: before,
            violations_after: after,
            success_rate: 1.0,
        }
    }

    #[test]
    fn classification_thresholds() {
        let cases = [
            (OverallStatus::Completed, 6, 0, OutcomeClass::Success, 0.95),
            (OverallStatus::Completed, 6, 2, OutcomeClass::Partial, 0.70),
            (OverallStatus::Completed, 6, 4, OutcomeClass::Ineffective, 0.40),
            (OverallStatus::Completed, 4, 6, OutcomeClass::Degradation, 0.0),
            (OverallStatus::RolledBack, 6, 6, OutcomeClass::Unknown, 0.5),
            (OverallStatus::Cancelled, 6, 6, OutcomeClass::Unknown, 0.5),
            (OverallStatus::Partial, 6, 2, OutcomeClass::Partial, 0.70),
            (OverallStatus::Partial, 6, 6, OutcomeClass::Degradation, 0.0),
        ];
        for (status, before, after, class, confidence) in cases {
            let c = classify(&record_with(status, before, after));
            assert_eq!(c.class, class, "{:?} {}->{}", status, before, after);
            assert!((c.confidence - confidence).abs() < 1e-9);
        }
    }

    #[test]
    fn successful_outcomes_update_rates_and_averages() {
        let dir = TempDir::new().unwrap();
        let k = knowledge(&dir);
        let policy = policy_with(ActionType::ScaleUp);
        let record = record_with(OverallStatus::Completed, 6, 0);

        let class = k.record(&policy, &record).unwrap();
        k.update_patterns(&policy, &record, class, CauseTag::ValidationLatency)
            .unwrap();

        let pattern = k.pattern_for(ActionType::ScaleUp).unwrap();
        assert_eq!(pattern.total_executions, 1);
        assert_eq!(pattern.successful_executions, 1);
        assert!((pattern.success_rate - 1.0).abs() < 1e-9);
        assert!(pattern.avg_violations_resolved > 5.9);
        assert!((pattern.confidence - 1.0 / 30.0).abs() < 1e-9);
        assert!(pattern.successful_executions <= pattern.total_executions);
    }

    #[test]
    fn unknown_outcomes_only_advance_the_counter() {
        let dir = TempDir::new().unwrap();
        let k = knowledge(&dir);
        let policy = policy_with(ActionType::ApplyPolicy);

        // One good outcome first
        let good = record_with(OverallStatus::Completed, 6, 0);
        let class = k.record(&policy, &good).unwrap();
        k.update_patterns(&policy, &good, class, CauseTag::PolicyMisconfiguration)
            .unwrap();
        let rate_before = k.pattern_for(ActionType::ApplyPolicy).unwrap().success_rate;

        // Then a rolled-back one whose effect was unobservable
        let unknown = record_with(OverallStatus::RolledBack, 6, 6);
        let class = k.record(&policy, &unknown).unwrap();
        assert_eq!(class.class, OutcomeClass::Unknown);
        k.update_patterns(&policy, &unknown, class, CauseTag::PolicyMisconfiguration)
            .unwrap();

        let pattern = k.pattern_for(ActionType::ApplyPolicy).unwrap();
        assert_eq!(pattern.total_executions, 2);
        assert!(
            (pattern.success_rate - rate_before).abs() < 1e-9,
            "success rate untouched by unknown outcomes"
        );
    }

    #[test]
    fn advisory_prefers_the_best_observed_action() {
        let dir = TempDir::new().unwrap();
        let k = knowledge(&dir);

        // scale_up works twice, restart_service fails once
        for _ in 0..2 {
            let policy = policy_with(ActionType::ScaleUp);
            let record = record_with(OverallStatus::Completed, 4, 0);
            let class = k.record(&policy, &record).unwrap();
            k.update_patterns(&policy, &record, class, CauseTag::ResourceExhaustion)
                .unwrap();
        }
        let policy = policy_with(ActionType::RestartService);
        let record = record_with(OverallStatus::Completed, 4, 4);
        let class = k.record(&policy, &record).unwrap();
        k.update_patterns(&policy, &record, class, CauseTag::ResourceExhaustion)
            .unwrap();

        let advisory = k.advisory_for(CauseTag::ResourceExhaustion).unwrap();
        assert_eq!(advisory.action_type, ActionType::ScaleUp);
        assert!((advisory.success_rate - 1.0).abs() < 1e-9);
        assert!(k.advisory_for(CauseTag::CascadingFailure).is_none());
    }

    #[test]
    fn patterns_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let k = knowledge(&dir);
            let policy = policy_with(ActionType::Rebalance);
            let record = record_with(OverallStatus::Completed, 3, 0);
            let class = k.record(&policy, &record).unwrap();
            k.update_patterns(&policy, &record, class, CauseTag::SystemInstability)
                .unwrap();
        }

        let reopened = knowledge(&dir);
        let pattern = reopened.pattern_for(ActionType::Rebalance).unwrap();
        assert_eq!(pattern.total_executions, 1);
        assert_eq!(pattern.successful_executions, 1);
        let advisory = reopened.advisory_for(CauseTag::SystemInstability).unwrap();
        assert_eq!(advisory.action_type, ActionType::Rebalance);
    }

    #[test]
    fn low_value_violations_narrow_thresholds() {
        let dir = TempDir::new().unwrap();
        let k = knowledge(&dir);
        let violation = Violation {
            id: 1,
            kind: meshguard_common::types::Severity::Warning,
            source_component: "validator".into(),
            metric_name: "validation_latency_p99".into(),
            observed_value: 1.1,
            threshold: 1.0,
            detected_at: Utc::now(),
            correlation_key: "router-a".into(),
        };
        for _ in 0..3 {
            k.observe_low_value(std::slice::from_ref(&violation));
        }

        let snapshot = k.snapshot();
        let factor = snapshot
            .threshold_narrowing
            .get("validation_latency_p99")
            .copied()
            .unwrap();
        assert!(factor < 1.0);
        assert!(factor >= NARROWING_FLOOR);
    }

    #[test]
    fn insights_surface_rate_movements() {
        let dir = TempDir::new().unwrap();
        let k = knowledge(&dir);
        let policy = policy_with(ActionType::ScaleUp);
        let record = record_with(OverallStatus::Completed, 4, 0);
        let class = k.record(&policy, &record).unwrap();
        k.update_patterns(&policy, &record, class, CauseTag::ResourceExhaustion)
            .unwrap();

        let first = k.insights();
        assert_eq!(first.len(), 1);
        assert!((first[0].current_success_rate - 1.0).abs() < 1e-9);

        // No movement since the last pass
        let second = k.insights();
        assert!(second.is_empty());
    }

    #[test]
    fn record_ring_is_bounded() {
        let dir = TempDir::new().unwrap();
        let k = knowledge(&dir);
        let policy = policy_with(ActionType::ScaleUp);
        for _ in 0..20 {
            let record = record_with(OverallStatus::Completed, 1, 0);
            k.record(&policy, &record).unwrap();
        }
        assert_eq!(k.recent_records().len(), 8);
    }
}
