//! Executor stage: apply approved policies through the charter with
//! per-action rollback on partial failure

use async_trait::async_trait;
use chrono::Utc;
use meshguard_clients::charter::{CharterApi, PolicyHandle};
use meshguard_common::retry::{action_is_retriable, retry_with_backoff, RetryConfig};
use meshguard_common::types::{
    ActionRecord, ActionStatus, ActionType, ExecutionRecord, OverallStatus, PolicyId,
    RemediationPolicy, Violation,
};
use meshguard_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Re-reads the relevant metrics after a policy settles and counts the
/// violations remaining on the given correlation keys
#[async_trait]
pub trait ViolationProbe: Send + Sync {
    async fn current_violations(&self, correlation_keys: &[String]) -> Result<usize>;
}

type SerializationKey = (ActionType, String);

/// Executor stage of the autonomic loop
pub struct Executor {
    config: meshguard_common::config::ExecutorConfig,
    charter: Arc<dyn CharterApi>,
    probe: Arc<dyn ViolationProbe>,
    /// Per-(action type, target) mutexes serializing overlapping policies
    locks: Mutex<HashMap<SerializationKey, Arc<tokio::sync::Mutex<()>>>>,
    /// Newest policy registered per key; older in-flight policies observe
    /// this at action boundaries and stand down
    latest: Mutex<HashMap<SerializationKey, PolicyId>>,
    cancel: watch::Receiver<bool>,
}

impl Executor {
    pub fn new(
        config: meshguard_common::config::ExecutorConfig,
        charter: Arc<dyn CharterApi>,
        probe: Arc<dyn ViolationProbe>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Executor {
            config,
            charter,
            probe,
            locks: Mutex::new(HashMap::new()),
            latest: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    fn lock_for(&self, key: &SerializationKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn superseded(&self, keys: &BTreeSet<SerializationKey>, policy_id: PolicyId) -> bool {
        let latest = self.latest.lock();
        keys.iter()
            .any(|key| latest.get(key).map(|id| *id != policy_id).unwrap_or(false))
    }

    /// Execute an approved policy: submit, apply actions in order, roll
    /// back in reverse on failure, then settle and verify effects.
    pub async fn execute(
        &self,
        policy: &RemediationPolicy,
        violations_before: &[Violation],
    ) -> Result<ExecutionRecord> {
        if self.cancelled() {
            return Err(Error::Cancelled);
        }

        let keys: BTreeSet<SerializationKey> = policy
            .actions
            .iter()
            .map(|a| a.serialization_key())
            .collect();

        // Register as the newest claimant before queueing so an older
        // policy waiting on the same keys stands down at its next boundary.
        {
            let mut latest = self.latest.lock();
            for key in &keys {
                latest.insert(key.clone(), policy.policy_id);
            }
        }

        // Acquire in sorted order (BTreeSet iteration) to avoid deadlock.
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.lock_for(key).lock_owned().await);
        }

        if self.superseded(&keys, policy.policy_id) {
            info!(policy_id = %policy.policy_id, "superseded while queued, standing down");
            return Err(Error::Conflict("superseded by a newer policy".into()));
        }

        let retry = RetryConfig::default()
            .with_max_attempts(self.config.max_retries + 1)
            .with_base_delay(Duration::from_millis(self.config.retry_base_delay_ms));
        let charter = self.charter.clone();
        let handle = retry_with_backoff(&retry, "charter submit", || {
            let charter = charter.clone();
            async move { charter.submit(policy).await }
        })
        .await?;

        let started_at = Utc::now();
        let mut results: Vec<ActionRecord> = policy
            .actions
            .iter()
            .map(|a| ActionRecord {
                action_type: a.action_type,
                target: a.target.clone(),
                status: ActionStatus::Skipped,
                error: None,
                rolled_back_at: None,
            })
            .collect();

        let mut failed_at: Option<usize> = None;
        let mut interrupted = false;

        for (index, action) in policy.actions.iter().enumerate() {
            // Cancellation and supersession are honored at action
            // boundaries only; the current action always runs to its own
            // conclusion.
            if self.cancelled() || self.superseded(&keys, policy.policy_id) {
                interrupted = true;
                break;
            }

            match self.apply_action(&handle, index, action).await {
                Ok(()) => {
                    results[index].status = ActionStatus::Applied;
                    debug!(policy_id = %policy.policy_id, index, "action applied");
                }
                Err(e) => {
                    warn!(policy_id = %policy.policy_id, index, error = %e, "action failed");
                    results[index].status = ActionStatus::Failed;
                    results[index].error = Some(e.to_string());
                    failed_at = Some(index);
                    break;
                }
            }
        }

        let applied = results
            .iter()
            .filter(|r| r.status == ActionStatus::Applied)
            .count();
        let total = policy.actions.len().max(1);

        let (overall_status, violations_after, success_rate) =
            if failed_at.is_some() || interrupted {
                let rollback_clean = self.rollback_applied(&handle, &mut results).await;
                let overall = if interrupted {
                    OverallStatus::Cancelled
                } else if applied == 0 {
                    OverallStatus::Failed
                } else if rollback_clean {
                    OverallStatus::RolledBack
                } else {
                    OverallStatus::Partial
                };
                let still_standing = results
                    .iter()
                    .filter(|r| r.status == ActionStatus::Applied && r.rolled_back_at.is_none())
                    .count();
                let rate = if overall == OverallStatus::Partial {
                    still_standing as f64 / total as f64
                } else {
                    0.0
                };
                // Effects were never observed; the record carries the
                // before-count unchanged.
                (overall, violations_before.len(), rate)
            } else {
                sleep(Duration::from_secs(self.config.settle_seconds)).await;
                let keys: Vec<String> = dedup_keys(violations_before);
                let after = match self.probe.current_violations(&keys).await {
                    Ok(count) => count,
                    Err(e) => {
                        warn!(error = %e, "effect verification failed, assuming no change");
                        violations_before.len()
                    }
                };
                (OverallStatus::Completed, after, applied as f64 / total as f64)
            };

        let record = ExecutionRecord {
            policy_id: policy.policy_id,
            started_at,
            finished_at: Utc::now(),
            action_results: results,
            overall_status,
            violations_before: violations_before.len(),
            violations_after,
            success_rate,
        };

        info!(
            policy_id = %policy.policy_id,
            status = ?record.overall_status,
            success_rate = record.success_rate,
            "execution finished"
        );
        drop(guards);
        Ok(record)
    }

    async fn apply_action(
        &self,
        handle: &PolicyHandle,
        index: usize,
        action: &meshguard_common::types::RemediationAction,
    ) -> Result<()> {
        let deadline = Duration::from_secs(self.config.action_timeout_seconds);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = timeout(deadline, self.charter.activate(handle, index, action))
                .await
                .unwrap_or_else(|_| Err(Error::Timeout(format!("action {} deadline", index))));

            match outcome {
                Ok(_) => return Ok(()),
                Err(e) if action_is_retriable(&e) && attempt <= self.config.max_retries => {
                    let delay = Duration::from_millis(
                        self.config.retry_base_delay_ms * 2u64.pow(attempt - 1),
                    );
                    debug!(index, attempt, delay_ms = delay.as_millis() as u64, "retrying action");
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Roll back every applied action in reverse order. Returns false when
    /// any rollback step itself failed.
    async fn rollback_applied(
        &self,
        handle: &PolicyHandle,
        results: &mut [ActionRecord],
    ) -> bool {
        let mut clean = true;
        let applied: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.status == ActionStatus::Applied)
            .map(|(i, _)| i)
            .collect();

        for index in applied.into_iter().rev() {
            match self.charter.rollback(handle, index).await {
                Ok(record) => {
                    results[index].rolled_back_at = Some(record.rolled_back_at);
                }
                Err(e) => {
                    error!(index, error = %e, "rollback step failed");
                    let note = format!("rollback failed: {}", e);
                    results[index].error = Some(match results[index].error.take() {
                        Some(existing) => format!("{}; {}", existing, note),
                        None => note,
                    });
                    clean = false;
                }
            }
        }
        clean
    }
}

fn dedup_keys(violations: &[Violation]) -> Vec<String> {
    let mut keys: Vec<String> = violations.iter().map(|v| v.correlation_key.clone()).collect();
    keys.sort();
    keys.dedup();
    keys
}
