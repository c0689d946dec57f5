//! Global-model store: an atomically swappable current snapshot plus a
//! durable, versioned checkpoint history
//!
//! Readers (clients pulling the model, the monitor scoring with it) grab a
//! snapshot reference and never hold a lock; the aggregator is the single
//! writer. Superseded versions stay available for the straggler window.

use crate::types::{GlobalModel, ModelVersion};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use meshguard_common::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const SCHEMA_VERSION: u32 = 1;

/// Checkpoint manifest persisted next to every weights blob
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub schema_version: u32,
    pub version: ModelVersion,
    pub trained_on_rounds: Vec<u64>,
    pub published_at: DateTime<Utc>,
    pub aggregation_mode: String,
    pub dp_epsilon_spent: f64,
}

/// Durable, snapshot-readable model store
pub struct ModelStore {
    db: sled::Db,
    weights_tree: sled::Tree,
    manifest_tree: sled::Tree,
    current: ArcSwap<GlobalModel>,
    retained: Mutex<VecDeque<Arc<GlobalModel>>>,
    retain_versions: usize,
}

impl ModelStore {
    /// Open the store, restoring the newest checkpoint as the current
    /// model or seeding the genesis model when the store is empty
    pub fn open(path: &Path, retain_versions: usize, dimension: usize) -> Result<Self> {
        let db = sled::open(path)
            .map_err(|e| Error::Storage(format!("failed to open model store: {}", e)))?;
        let weights_tree = db
            .open_tree("model_weights")
            .map_err(|e| Error::Storage(format!("failed to open weights tree: {}", e)))?;
        let manifest_tree = db
            .open_tree("model_manifests")
            .map_err(|e| Error::Storage(format!("failed to open manifest tree: {}", e)))?;

        let current = match weights_tree
            .last()
            .map_err(|e| Error::Storage(format!("checkpoint scan: {}", e)))?
        {
            Some((_, value)) => bincode::deserialize::<GlobalModel>(&value)
                .map_err(|e| Error::Integrity(format!("corrupt checkpoint: {}", e)))?,
            None => GlobalModel::genesis(dimension),
        };

        info!(version = current.version, "model store opened");
        let current = Arc::new(current);
        let mut retained = VecDeque::new();
        retained.push_back(current.clone());

        Ok(ModelStore {
            db,
            weights_tree,
            manifest_tree,
            current: ArcSwap::new(current),
            retained: Mutex::new(retained),
            retain_versions: retain_versions.max(1),
        })
    }

    /// Current model snapshot. Cheap; safe to call from any reader.
    pub fn current(&self) -> Arc<GlobalModel> {
        self.current.load_full()
    }

    /// Publish the next model version. The checkpoint is written and
    /// flushed before the in-memory snapshot swaps, so a crash between the
    /// two replays to the already-durable state and never double-publishes.
    pub fn publish(&self, model: GlobalModel, manifest: CheckpointManifest) -> Result<()> {
        let expected = self.current().version + 1;
        if model.version != expected {
            return Err(Error::FatalComponent(format!(
                "model version {} breaks monotonicity, expected {}",
                model.version, expected
            )));
        }
        if manifest.version != model.version || manifest.schema_version != SCHEMA_VERSION {
            return Err(Error::FatalComponent("manifest disagrees with model".into()));
        }

        let weights = bincode::serialize(&model)
            .map_err(|e| Error::Integrity(format!("checkpoint encode: {}", e)))?;
        let manifest_bytes = bincode::serialize(&manifest)
            .map_err(|e| Error::Integrity(format!("manifest encode: {}", e)))?;

        self.weights_tree
            .insert(model.version.to_be_bytes(), weights)
            .map_err(|e| Error::Storage(format!("checkpoint write: {}", e)))?;
        self.manifest_tree
            .insert(model.version.to_be_bytes(), manifest_bytes)
            .map_err(|e| Error::Storage(format!("manifest write: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| Error::Storage(format!("checkpoint flush: {}", e)))?;

        let model = Arc::new(model);
        {
            let mut retained = self.retained.lock();
            retained.push_back(model.clone());
            while retained.len() > self.retain_versions {
                if let Some(evicted) = retained.pop_front() {
                    // Keep durable history in step with the in-memory window
                    let _ = self.weights_tree.remove(evicted.version.to_be_bytes());
                    let _ = self.manifest_tree.remove(evicted.version.to_be_bytes());
                }
            }
        }
        self.current.store(model.clone());
        debug!(version = model.version, "model published");
        Ok(())
    }

    /// Fetch a retained version for a straggler; `None` once it has aged
    /// out of the window
    pub fn get(&self, version: ModelVersion) -> Option<Arc<GlobalModel>> {
        self.retained
            .lock()
            .iter()
            .find(|m| m.version == version)
            .cloned()
    }

    /// Manifest for a retained version
    pub fn manifest(&self, version: ModelVersion) -> Result<Option<CheckpointManifest>> {
        let Some(bytes) = self
            .manifest_tree
            .get(version.to_be_bytes())
            .map_err(|e| Error::Storage(format!("manifest read: {}", e)))?
        else {
            return Ok(None);
        };
        let manifest = bincode::deserialize(&bytes)
            .map_err(|e| Error::Integrity(format!("corrupt manifest: {}", e)))?;
        Ok(Some(manifest))
    }
}
