//! Pluggable approval oracle at the planner/orchestrator boundary
//!
//! Governance over expensive remediation is decentralized; this crate only
//! defines the seam. The shipped implementations are an auto-approver and
//! an in-memory ledger the embedding host records decisions into.

use async_trait::async_trait;
use meshguard_common::types::{PolicyId, RemediationPolicy};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Decision returned by the approval oracle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Rejected,
    Pending,
}

/// Oracle consulted for policies that require governance approval
#[async_trait]
pub trait ApprovalOracle: Send + Sync {
    async fn decide(&self, policy: &RemediationPolicy) -> ApprovalDecision;
}

/// Approves everything. Suitable for tests and fully trusted deployments.
pub struct AutoApprover;

#[async_trait]
impl ApprovalOracle for AutoApprover {
    async fn decide(&self, _policy: &RemediationPolicy) -> ApprovalDecision {
        ApprovalDecision::Approved
    }
}

/// In-memory decision ledger. The embedding host records approvals and
/// rejections; undecided policies stay pending.
#[derive(Default)]
pub struct LedgerOracle {
    decisions: RwLock<HashMap<PolicyId, ApprovalDecision>>,
}

impl LedgerOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn approve(&self, policy_id: PolicyId) {
        self.decisions
            .write()
            .insert(policy_id, ApprovalDecision::Approved);
    }

    pub fn reject(&self, policy_id: PolicyId) {
        self.decisions
            .write()
            .insert(policy_id, ApprovalDecision::Rejected);
    }
}

#[async_trait]
impl ApprovalOracle for LedgerOracle {
    async fn decide(&self, policy: &RemediationPolicy) -> ApprovalDecision {
        self.decisions
            .read()
            .get(&policy.policy_id)
            .copied()
            .unwrap_or(ApprovalDecision::Pending)
    }
}
