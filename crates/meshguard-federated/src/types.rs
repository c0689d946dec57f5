//! Data model for federated rounds, client updates, and global models

use crate::compression::CompressedGradient;
use chrono::{DateTime, Utc};
use meshguard_common::config::TrainingParams;
use serde::{Deserialize, Serialize};

/// Monotonic round identifier
pub type RoundId = u64;

/// Stable client identifier
pub type ClientId = String;

/// Monotonic global-model version
pub type ModelVersion = u64;

/// One signed gradient update received from a worker node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientUpdate {
    pub round_id: RoundId,
    pub client_id: ClientId,
    pub gradient: CompressedGradient,
    pub sample_count: u64,
    /// Ed25519 signature over [`ClientUpdate::signed_payload`]
    pub signature: Vec<u8>,
}

impl ClientUpdate {
    /// Canonical bytes covered by the signature
    pub fn signed_payload(&self) -> Vec<u8> {
        // Signature is excluded from its own payload
        bincode::serialize(&(
            self.round_id,
            &self.client_id,
            &self.gradient,
            self.sample_count,
        ))
        .expect("payload types are always serializable")
    }
}

/// A published global model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalModel {
    pub version: ModelVersion,
    pub weights: Vec<f64>,
    pub trained_on_rounds: Vec<RoundId>,
    pub published_at: DateTime<Utc>,
}

impl GlobalModel {
    /// Version-zero model all training starts from
    pub fn genesis(dimension: usize) -> Self {
        GlobalModel {
            version: 0,
            weights: vec![0.0; dimension],
            trained_on_rounds: Vec::new(),
            published_at: Utc::now(),
        }
    }
}

/// Round lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundState {
    Open,
    Collecting,
    Aggregating,
    Published { version: ModelVersion },
    Aborted { reason: String },
}

/// One federated round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub round_id: RoundId,
    pub selected_clients: Vec<ClientId>,
    pub deadline: DateTime<Utc>,
    pub received_updates: usize,
    pub state: RoundState,
    pub aggregated_at: Option<DateTime<Utc>>,
}

/// Training configuration fanned out to sampled clients at round open
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub round_id: RoundId,
    pub global_model_version: ModelVersion,
    pub params: TrainingParams,
}

/// What the aggregator knows about one worker node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientDescriptor {
    pub client_id: ClientId,
    /// Ed25519 public key used to verify updates
    pub public_key: Vec<u8>,
    /// Decremented on signature mismatches; clients at or below zero are
    /// no longer sampled
    pub reputation: f64,
    /// Recent loss-improvement signal for convergence-weighted sampling
    pub loss_improvement: f64,
    /// Self-reported available compute, in fractional cores
    pub cpu_available: f64,
    /// Self-reported available memory
    pub memory_available_mb: u64,
}

impl ClientDescriptor {
    pub fn new(client_id: impl Into<ClientId>, public_key: Vec<u8>) -> Self {
        ClientDescriptor {
            client_id: client_id.into(),
            public_key,
            reputation: 1.0,
            loss_improvement: 0.0,
            cpu_available: 1.0,
            memory_available_mb: 1024,
        }
    }

    pub fn eligible(&self) -> bool {
        self.reputation > 0.0
    }
}
