//! Self-healing autonomic loop for the meshguard control plane
//!
//! A continuously running monitor → analyze → plan → execute → knowledge
//! cycle that turns metric windows and alerts into vetted remediation
//! policies applied against the charter service, with bounded latency,
//! rollback on partial failure, and reinforcement from recorded outcomes.

pub mod analyzer;
pub mod approval;
pub mod executor;
pub mod knowledge;
pub mod monitor;
pub mod orchestrator;
pub mod planner;

pub use analyzer::Analyzer;
pub use approval::{ApprovalDecision, ApprovalOracle, AutoApprover, LedgerOracle};
pub use executor::{Executor, ViolationProbe};
pub use knowledge::Knowledge;
pub use monitor::{Monitor, ThresholdProbe};
pub use orchestrator::{Orchestrator, OrchestratorState};
pub use planner::Planner;
