//! Federated-learning aggregator for the meshguard control plane
//!
//! Coordinates training rounds against a population of untrusted worker
//! nodes: samples clients, collects compressed gradient updates, runs
//! Byzantine-robust aggregation under differential privacy, and publishes
//! versioned global anomaly-detection models.

pub mod aggregation;
pub mod aggregator;
pub mod compression;
pub mod model_store;
pub mod privacy;
pub mod sampling;
pub mod types;
pub mod wire;

pub use aggregator::{ClientTransport, FlAggregator, FlState, NullTransport};
pub use compression::CompressedGradient;
pub use model_store::ModelStore;
pub use privacy::DpEngine;
pub use types::{ClientDescriptor, ClientUpdate, GlobalModel, Round, RoundState, TrainingConfig};
