//! Orchestrator: drives the monitor → analyze → plan → execute → knowledge
//! cycle on a fixed cadence and owns lifecycle, state, and cancellation

use crate::analyzer::Analyzer;
use crate::approval::{ApprovalDecision, ApprovalOracle};
use crate::executor::{Executor, ViolationProbe};
use crate::knowledge::Knowledge;
use crate::monitor::Monitor;
use crate::planner::Planner;
use chrono::{DateTime, Utc};
use meshguard_clients::charter::CharterApi;
use meshguard_common::config::MeshConfig;
use meshguard_common::events::{EventBus, EventKind};
use meshguard_common::types::{
    ApprovalState, CauseTag, OutcomeClass, PolicyId, RemediationPolicy, Violation,
};
use meshguard_common::Error;
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Ticks a pending policy survives before aging out of the approval ledger
const PENDING_MAX_TICKS: u64 = 20;

/// Observable orchestrator state
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorState {
    pub iteration: u64,
    pub last_update: Option<DateTime<Utc>>,
    pub last_violation_count: usize,
    pub last_policy_id: Option<PolicyId>,
    pub last_error: Option<String>,
    pub is_running: bool,
    pub degraded: bool,
}

impl Default for OrchestratorState {
    fn default() -> Self {
        OrchestratorState {
            iteration: 0,
            last_update: None,
            last_violation_count: 0,
            last_policy_id: None,
            last_error: None,
            is_running: false,
            degraded: false,
        }
    }
}

struct PendingPolicy {
    policy: RemediationPolicy,
    violations: Vec<Violation>,
    cause: CauseTag,
    first_seen: u64,
}

struct Inner {
    config: MeshConfig,
    monitor: Mutex<Monitor>,
    analyzer: Mutex<Analyzer>,
    planner: Planner,
    executor: Executor,
    knowledge: Arc<Knowledge>,
    oracle: Arc<dyn ApprovalOracle>,
    events: EventBus,
    state: RwLock<OrchestratorState>,
    pending: SyncMutex<Vec<PendingPolicy>>,
    degraded: AtomicBool,
}

/// Drives the autonomic loop. One instance per control plane.
pub struct Orchestrator {
    inner: Arc<Inner>,
    stop_tx: watch::Sender<bool>,
    handle: SyncMutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: MeshConfig,
        monitor: Monitor,
        analyzer: Analyzer,
        knowledge: Arc<Knowledge>,
        charter: Arc<dyn CharterApi>,
        probe: Arc<dyn ViolationProbe>,
        oracle: Arc<dyn ApprovalOracle>,
        events: EventBus,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let executor = Executor::new(config.executor.clone(), charter, probe, stop_rx);
        let planner = Planner::new(config.planner.clone());

        let inner = Arc::new(Inner {
            config,
            monitor: Mutex::new(monitor),
            analyzer: Mutex::new(analyzer),
            planner,
            executor,
            knowledge,
            oracle,
            events,
            state: RwLock::new(OrchestratorState::default()),
            pending: SyncMutex::new(Vec::new()),
            degraded: AtomicBool::new(false),
        });

        Orchestrator {
            inner,
            stop_tx,
            handle: SyncMutex::new(None),
        }
    }

    /// Start the cadence loop. Idempotent; a second call is a no-op while
    /// the loop is running.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        let inner = self.inner.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        inner.state.write().is_running = true;
        info!(
            interval_seconds = inner.config.monitor.interval_seconds,
            "orchestrator starting"
        );

        *handle = Some(tokio::spawn(async move {
            let mut ticker =
                interval(Duration::from_secs(inner.config.monitor.interval_seconds));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::run_cycle(&inner).await;
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            inner.state.write().is_running = false;
            info!("orchestrator stopped");
        }));
    }

    /// Graceful stop: signals cancellation (which the executor observes at
    /// action boundaries) and awaits the in-flight tick.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "orchestrator task join failed");
            }
        }
        self.inner.state.write().is_running = false;
    }

    /// Current state snapshot
    pub fn state(&self) -> OrchestratorState {
        self.inner.state.read().clone()
    }

    /// Clear the degraded flag after external intervention
    pub fn clear_degraded(&self) {
        self.inner.degraded.store(false, Ordering::SeqCst);
        self.inner.state.write().degraded = false;
        self.inner
            .events
            .emit(EventKind::OrchestratorCleared, None, "degraded state cleared");
    }

    /// Run one cycle immediately, outside the cadence. Used by the loop
    /// task and directly by tests.
    pub async fn tick_once(&self) {
        Self::run_cycle(&self.inner).await;
    }

    async fn run_cycle(inner: &Arc<Inner>) {
        let iteration = inner.state.read().iteration;
        let advisory = inner.knowledge.snapshot();
        let now = Utc::now();

        // Revisit policies held for approval before planning new work.
        if !inner.degraded.load(Ordering::SeqCst) {
            Self::drain_pending(inner, iteration).await;
        }

        let output = {
            let mut monitor = inner.monitor.lock().await;
            monitor.tick(now, &advisory).await
        };
        let output = match output {
            Ok(output) => output,
            Err(e) => {
                Self::note_error(inner, &e);
                Self::finish_cycle(inner, now);
                return;
            }
        };

        {
            let mut state = inner.state.write();
            state.last_violation_count = output.violations.len();
        }

        if output.violations.len() < inner.config.monitor.plan_threshold {
            debug!(iteration, "quiet tick");
            inner.events.emit(EventKind::Heartbeat, None, format!("iteration {}", iteration));
            Self::finish_cycle(inner, now);
            return;
        }

        inner.events.emit(
            EventKind::ViolationsDetected {
                count: output.violations.len(),
            },
            None,
            "threshold breaches observed",
        );

        // Degraded mode keeps monitoring and knowledge alive but disables
        // planning and execution until externally cleared.
        if inner.degraded.load(Ordering::SeqCst) {
            warn!(iteration, "degraded: skipping analyze/plan/execute");
            Self::finish_cycle(inner, now);
            return;
        }

        let analysis = {
            let mut analyzer = inner.analyzer.lock().await;
            analyzer.analyze(&output)
        };
        inner.events.emit(
            EventKind::AnalysisCompleted,
            Some(analysis.analysis_id),
            format!("{} patterns", analysis.patterns.len()),
        );

        let candidates = inner
            .planner
            .plan(&analysis, &advisory, &output.violations);
        let primary_cause = analysis
            .hypotheses
            .first()
            .map(|h| h.cause)
            .unwrap_or(CauseTag::Unknown);

        if let Some(policy) = inner
            .planner
            .select_best(candidates, inner.config.planner.score_threshold)
        {
            inner.state.write().last_policy_id = Some(policy.policy_id);
            inner.events.emit(
                EventKind::PolicySelected,
                Some(policy.policy_id),
                format!("score {:.3}", policy.score),
            );

            if policy.approval_state == ApprovalState::Pending {
                match inner.oracle.decide(&policy).await {
                    ApprovalDecision::Approved => {
                        inner.events.emit(
                            EventKind::PolicyApproved,
                            Some(policy.policy_id),
                            "oracle approved",
                        );
                        Self::execute_and_record(inner, policy, &output.violations, primary_cause)
                            .await;
                    }
                    ApprovalDecision::Rejected => {
                        inner.events.emit(
                            EventKind::PolicyRejected,
                            Some(policy.policy_id),
                            "oracle rejected",
                        );
                    }
                    ApprovalDecision::Pending => {
                        inner.events.emit(
                            EventKind::PolicyPendingApproval,
                            Some(policy.policy_id),
                            "held for governance",
                        );
                        inner.pending.lock().push(PendingPolicy {
                            policy,
                            violations: output.violations.clone(),
                            cause: primary_cause,
                            first_seen: iteration,
                        });
                    }
                }
            } else {
                Self::execute_and_record(inner, policy, &output.violations, primary_cause).await;
            }
        }

        if inner.config.knowledge.insight_interval_cycles > 0
            && iteration % inner.config.knowledge.insight_interval_cycles == 0
        {
            for insight in inner.knowledge.insights() {
                debug!(
                    cause = insight.cause.as_str(),
                    action = insight.action_type.as_str(),
                    from = insight.previous_success_rate,
                    to = insight.current_success_rate,
                    "insight"
                );
            }
        }

        Self::finish_cycle(inner, now);
    }

    async fn drain_pending(inner: &Arc<Inner>, iteration: u64) {
        let held: Vec<PendingPolicy> = inner.pending.lock().drain(..).collect();
        for mut entry in held {
            match inner.oracle.decide(&entry.policy).await {
                ApprovalDecision::Approved => {
                    inner.events.emit(
                        EventKind::PolicyApproved,
                        Some(entry.policy.policy_id),
                        "approval recorded",
                    );
                    Self::execute_and_record(
                        inner,
                        entry.policy,
                        &entry.violations,
                        entry.cause,
                    )
                    .await;
                }
                ApprovalDecision::Rejected => {
                    inner.events.emit(
                        EventKind::PolicyRejected,
                        Some(entry.policy.policy_id),
                        "rejection recorded",
                    );
                }
                ApprovalDecision::Pending => {
                    if iteration.saturating_sub(entry.first_seen) >= PENDING_MAX_TICKS {
                        warn!(policy_id = %entry.policy.policy_id, "pending policy aged out");
                        entry.policy.approval_state = ApprovalState::Rejected;
                        inner.events.emit(
                            EventKind::PolicyRejected,
                            Some(entry.policy.policy_id),
                            "aged out waiting for approval",
                        );
                    } else {
                        inner.pending.lock().push(entry);
                    }
                }
            }
        }
    }

    async fn execute_and_record(
        inner: &Arc<Inner>,
        mut policy: RemediationPolicy,
        violations: &[Violation],
        cause: CauseTag,
    ) {
        policy.approval_state = ApprovalState::Approved;
        inner.events.emit(
            EventKind::ExecutionStarted,
            Some(policy.policy_id),
            format!("{} actions", policy.actions.len()),
        );

        let record = match inner.executor.execute(&policy, violations).await {
            Ok(record) => record,
            Err(Error::Conflict(reason)) => {
                policy.approval_state = ApprovalState::Superseded;
                inner.events.emit(
                    EventKind::PolicySuperseded,
                    Some(policy.policy_id),
                    reason,
                );
                return;
            }
            Err(Error::Cancelled) => {
                debug!(policy_id = %policy.policy_id, "execution cancelled");
                return;
            }
            Err(e) => {
                Self::note_error(inner, &e);
                return;
            }
        };

        inner.events.emit(
            EventKind::ExecutionFinished {
                status: format!("{:?}", record.overall_status),
            },
            Some(policy.policy_id),
            format!("success rate {:.2}", record.success_rate),
        );

        // Knowledge always finalizes, even for rolled-back or cancelled
        // executions; only complete records reach the store.
        let classification = match inner.knowledge.record(&policy, &record) {
            Ok(c) => c,
            Err(e) => {
                Self::note_error(inner, &e);
                return;
            }
        };
        if let Err(e) =
            inner
                .knowledge
                .update_patterns(&policy, &record, classification, cause)
        {
            Self::note_error(inner, &e);
            return;
        }
        if matches!(
            classification.class,
            OutcomeClass::Ineffective | OutcomeClass::Unknown
        ) {
            inner.knowledge.observe_low_value(violations);
        }

        inner.events.emit(
            EventKind::OutcomeRecorded {
                class: format!("{:?}", classification.class),
            },
            Some(policy.policy_id),
            format!("confidence {:.2}", classification.confidence),
        );
    }

    fn note_error(inner: &Arc<Inner>, error: &Error) {
        if error.is_fatal() {
            error!(error = %error, "fatal component error, entering degraded state");
            inner.degraded.store(true, Ordering::SeqCst);
            let mut state = inner.state.write();
            state.degraded = true;
            state.last_error = Some(error.to_string());
            inner.events.emit(
                EventKind::OrchestratorDegraded,
                None,
                error.to_string(),
            );
        } else {
            warn!(error = %error, category = error.category(), "recoverable cycle error");
            inner.state.write().last_error = Some(error.to_string());
            inner.events.emit(
                EventKind::ComponentError {
                    category: error.category().to_string(),
                },
                None,
                error.to_string(),
            );
        }
    }

    fn finish_cycle(inner: &Arc<Inner>, now: DateTime<Utc>) {
        let mut state = inner.state.write();
        state.iteration += 1;
        state.last_update = Some(now);
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}
