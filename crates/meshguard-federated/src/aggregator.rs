//! Federated round driver: sampling, collection, robust aggregation under
//! differential privacy, and checkpointed publication

use crate::aggregation::{aggregate, AggregationParams};
use crate::compression::decompress;
use crate::model_store::{CheckpointManifest, ModelStore};
use crate::privacy::DpEngine;
use crate::sampling::sample_clients;
use crate::types::{
    ClientDescriptor, ClientId, ClientUpdate, GlobalModel, Round, RoundId, RoundState,
    TrainingConfig,
};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use meshguard_common::config::{AggregationMode, FederatedConfig};
use meshguard_common::events::{EventBus, EventKind};
use meshguard_common::retry::{retry_with_backoff, RetryConfig};
use meshguard_common::{Error, Result};
use parking_lot::{Mutex, RwLock};
use ring::signature::{UnparsedPublicKey, ED25519};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Poll interval of the collection loop
const COLLECT_POLL_MS: u64 = 25;

/// Reputation penalty for a signature mismatch
const REPUTATION_PENALTY: f64 = 0.25;

/// How a round ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    Published { round_id: RoundId, version: u64 },
    Aborted { round_id: RoundId, reason: String },
}

/// Observable aggregator state
#[derive(Debug, Clone, serde::Serialize)]
pub struct FlState {
    pub current_version: u64,
    pub rounds_published: u64,
    pub rounds_aborted: u64,
    pub dp_epsilon_spent: f64,
    pub dp_budget_exhausted: bool,
    pub last_round: Option<RoundId>,
    pub discarded_updates: u64,
}

/// Transport used to fan training configuration out to sampled clients.
/// Update delivery flows the other way, through
/// [`FlAggregator::submit_update`].
#[async_trait]
pub trait ClientTransport: Send + Sync {
    async fn broadcast(&self, config: &TrainingConfig, clients: &[ClientId]) -> Result<()>;
}

/// Transport that drops the fan-out on the floor. Useful when clients poll
/// for the training configuration instead of receiving a push.
pub struct NullTransport;

#[async_trait]
impl ClientTransport for NullTransport {
    async fn broadcast(&self, _config: &TrainingConfig, _clients: &[ClientId]) -> Result<()> {
        Ok(())
    }
}

struct Collection {
    round_id: RoundId,
    /// Verified, decompressed updates keyed by shard
    by_shard: HashMap<usize, Vec<(ClientId, Vec<f64>, u64)>>,
    received: usize,
}

struct RoundHistory {
    last_closed: Option<RoundId>,
    last_deadline: Option<chrono::DateTime<Utc>>,
}

/// Federated-learning aggregator. Owns its round clock, the client
/// registry, and the model store's single-writer side.
pub struct FlAggregator {
    config: FederatedConfig,
    store: Arc<ModelStore>,
    dp: DpEngine,
    transport: Arc<dyn ClientTransport>,
    events: EventBus,
    clients: RwLock<HashMap<ClientId, ClientDescriptor>>,
    round_seq: AtomicU64,
    collection: Mutex<Option<Collection>>,
    /// Already-verified late updates accepted within the grace window,
    /// carried into the next round
    carry_over: Mutex<Vec<(ClientId, Vec<f64>, u64)>>,
    history: Mutex<RoundHistory>,
    current_round: RwLock<Option<Round>>,
    rounds_published: AtomicU64,
    rounds_aborted: AtomicU64,
    discarded: AtomicU64,
    stopping: AtomicBool,
}

impl FlAggregator {
    pub fn new(
        config: FederatedConfig,
        store: Arc<ModelStore>,
        transport: Arc<dyn ClientTransport>,
        events: EventBus,
    ) -> Self {
        let dp = DpEngine::new(config.dp.clone());
        FlAggregator {
            config,
            store,
            dp,
            transport,
            events,
            clients: RwLock::new(HashMap::new()),
            round_seq: AtomicU64::new(1),
            collection: Mutex::new(None),
            carry_over: Mutex::new(Vec::new()),
            history: Mutex::new(RoundHistory {
                last_closed: None,
                last_deadline: None,
            }),
            current_round: RwLock::new(None),
            rounds_published: AtomicU64::new(0),
            rounds_aborted: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
        }
    }

    /// Register (or refresh) a worker node
    pub fn register_client(&self, descriptor: ClientDescriptor) {
        self.clients
            .write()
            .insert(descriptor.client_id.clone(), descriptor);
    }

    pub fn client(&self, client_id: &str) -> Option<ClientDescriptor> {
        self.clients.read().get(client_id).cloned()
    }

    /// Current observable state
    pub fn state(&self) -> FlState {
        FlState {
            current_version: self.store.current().version,
            rounds_published: self.rounds_published.load(Ordering::SeqCst),
            rounds_aborted: self.rounds_aborted.load(Ordering::SeqCst),
            dp_epsilon_spent: self.dp.epsilon_spent(),
            dp_budget_exhausted: self.dp.exhausted(),
            last_round: self.current_round.read().as_ref().map(|r| r.round_id),
            discarded_updates: self.discarded.load(Ordering::SeqCst),
        }
    }

    pub fn current_round(&self) -> Option<Round> {
        self.current_round.read().clone()
    }

    /// Signal shutdown: the in-flight round aborts collection but an
    /// already-produced aggregate is still published.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    /// Spawn a task driving rounds at the given interval until stopped
    pub fn start(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        let aggregator = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if aggregator.stopping.load(Ordering::SeqCst) {
                    break;
                }
                match aggregator.run_round().await {
                    Ok(outcome) => debug!(?outcome, "round finished"),
                    Err(e) => warn!(error = %e, "round failed"),
                }
            }
        })
    }

    /// Accept one client update into the open collection window. Every
    /// verification failure is counted and dropped; only transportable
    /// rejections surface to the caller.
    pub fn submit_update(&self, update: ClientUpdate) -> Result<()> {
        let verified = self.verify_update(&update);
        match verified {
            Ok(dense) => {
                let mut collection = self.collection.lock();
                match collection.as_mut() {
                    Some(open) if open.round_id == update.round_id => {
                        let shard = self.shard_of(&update.client_id);
                        open.by_shard.entry(shard).or_default().push((
                            update.client_id.clone(),
                            dense,
                            update.sample_count,
                        ));
                        open.received += 1;
                        Ok(())
                    }
                    _ => {
                        drop(collection);
                        self.handle_out_of_round(update, dense)
                    }
                }
            }
            Err(e) => {
                self.discarded.fetch_add(1, Ordering::SeqCst);
                debug!(client = %update.client_id, error = %e, "update discarded");
                Err(e)
            }
        }
    }

    /// Drive one complete round
    pub async fn run_round(&self) -> Result<RoundOutcome> {
        // Budget exhaustion refuses the round before any client work
        self.dp.admit_round()?;

        let population: Vec<ClientDescriptor> = self.clients.read().values().cloned().collect();
        let selected = sample_clients(
            self.config.sampling_strategy,
            &population,
            self.config.clients_per_round,
        );
        if selected.len() < self.config.min_participants {
            return Err(Error::Unavailable(format!(
                "only {} eligible clients, need {}",
                selected.len(),
                self.config.min_participants
            )));
        }

        let round_id = self.round_seq.fetch_add(1, Ordering::SeqCst);
        let deadline =
            Utc::now() + ChronoDuration::seconds(self.config.round_deadline_seconds as i64);
        let model_version = self.store.current().version;

        *self.current_round.write() = Some(Round {
            round_id,
            selected_clients: selected.clone(),
            deadline,
            received_updates: 0,
            state: RoundState::Open,
            aggregated_at: None,
        });
        self.events.emit(
            EventKind::RoundOpened { round_id },
            None,
            format!("{} clients sampled", selected.len()),
        );

        let training = TrainingConfig {
            round_id,
            global_model_version: model_version,
            params: self.config.training.clone(),
        };
        if let Err(e) = self.transport.broadcast(&training, &selected).await {
            warn!(error = %e, "training fan-out failed");
        }

        // Open the collection window, seeding grace-window carry-overs
        // from the previous round.
        {
            let mut collection = self.collection.lock();
            *collection = Some(Collection {
                round_id,
                by_shard: HashMap::new(),
                received: 0,
            });
        }
        self.set_round_state(RoundState::Collecting);
        let carried: Vec<(ClientId, Vec<f64>, u64)> = self.carry_over.lock().drain(..).collect();
        if !carried.is_empty() {
            let mut collection = self.collection.lock();
            if let Some(open) = collection.as_mut() {
                for (client_id, dense, samples) in carried {
                    let shard = self.shard_of(&client_id);
                    open.by_shard
                        .entry(shard)
                        .or_default()
                        .push((client_id, dense, samples));
                    open.received += 1;
                }
            }
        }

        let quorum = ((selected.len() as f64) * self.config.quorum_fraction).ceil() as usize;
        let quorum = quorum.clamp(self.config.min_participants, selected.len());
        loop {
            let received = self
                .collection
                .lock()
                .as_ref()
                .map(|c| c.received)
                .unwrap_or(0);
            if received >= quorum || Utc::now() >= deadline {
                break;
            }
            if self.stopping.load(Ordering::SeqCst) {
                return self.abort_round(round_id, "shutdown during collection");
            }
            tokio::time::sleep(Duration::from_millis(COLLECT_POLL_MS)).await;
        }

        // Close the window; anything arriving from here on is late.
        let collection = self
            .collection
            .lock()
            .take()
            .ok_or_else(|| Error::Internal("collection window vanished".into()))?;
        {
            let mut history = self.history.lock();
            history.last_closed = Some(round_id);
            history.last_deadline = Some(deadline);
        }
        if let Some(round) = self.current_round.write().as_mut() {
            round.received_updates = collection.received;
        }

        if collection.received < self.config.min_participants {
            return self.abort_round(
                round_id,
                &format!(
                    "{} of {} required updates by deadline",
                    collection.received, self.config.min_participants
                ),
            );
        }

        self.set_round_state(RoundState::Aggregating);
        let weights = match self.aggregate_shards(&collection) {
            Ok(weights) => weights,
            Err(e) => {
                warn!(round_id, error = %e, "aggregation failed");
                return self.abort_round(round_id, &format!("aggregation failure: {}", e));
            }
        };

        // CPU-bound robust aggregation is already behind us; publication
        // retries with backoff on storage trouble and the round stays
        // `Aggregating` if it never lands, so a model is never
        // double-published.
        let previous = self.store.current();
        let mut trained_on_rounds = previous.trained_on_rounds.clone();
        trained_on_rounds.push(round_id);
        let model = GlobalModel {
            version: previous.version + 1,
            weights,
            trained_on_rounds,
            published_at: Utc::now(),
        };
        let manifest = CheckpointManifest {
            schema_version: 1,
            version: model.version,
            trained_on_rounds: model.trained_on_rounds.clone(),
            published_at: model.published_at,
            aggregation_mode: mode_name(self.config.aggregation_mode).to_string(),
            dp_epsilon_spent: self.dp.epsilon_spent(),
        };

        let retry = RetryConfig::default()
            .with_max_attempts(3)
            .with_base_delay(Duration::from_millis(50));
        let store = self.store.clone();
        let published = retry_with_backoff(&retry, "model checkpoint", || {
            let store = store.clone();
            let model = model.clone();
            let manifest = manifest.clone();
            async move { store.publish(model, manifest) }
        })
        .await;
        if let Err(e) = published {
            warn!(round_id, error = %e, "checkpoint failed, round stays aggregating");
            return Err(e);
        }

        self.dp.charge_round();
        let version = model.version;
        if let Some(round) = self.current_round.write().as_mut() {
            round.state = RoundState::Published { version };
            round.aggregated_at = Some(Utc::now());
        }
        self.rounds_published.fetch_add(1, Ordering::SeqCst);
        self.events.emit(
            EventKind::RoundPublished { round_id, version },
            None,
            format!("{} updates aggregated", collection.received),
        );
        info!(round_id, version, "round published");
        Ok(RoundOutcome::Published { round_id, version })
    }

    /// Robust aggregation per shard, then a second-pass combination
    /// weighted by each shard's total sample count
    fn aggregate_shards(&self, collection: &Collection) -> Result<Vec<f64>> {
        let params = AggregationParams {
            byzantine_f: self.config.byzantine_f,
            multi_krum_m: self.config.multi_krum_m,
            trim_beta: self.config.trim_fraction_beta,
            outlier_estimator: self.config.outlier_estimator,
        };

        let mut shard_results: Vec<(Vec<f64>, u64)> = Vec::new();
        for (shard, members) in &collection.by_shard {
            let updates: Vec<Vec<f64>> = members.iter().map(|(_, u, _)| u.clone()).collect();
            let sample_total: u64 = members.iter().map(|(_, _, s)| s).sum();
            let result = aggregate(self.config.aggregation_mode, &updates, &params)?;
            debug!(shard, members = members.len(), "shard aggregated");
            shard_results.push((result, sample_total));
        }

        let mut combined = match shard_results.len() {
            0 => return Err(Error::Integrity("no shards produced output".into())),
            1 => shard_results.remove(0).0,
            _ => {
                let dimension = shard_results[0].0.len();
                let total: u64 = shard_results.iter().map(|(_, s)| *s).sum();
                let total = total.max(1) as f64;
                let mut out = vec![0.0; dimension];
                for (weights, samples) in &shard_results {
                    let weight = *samples as f64 / total;
                    for (c, v) in weights.iter().enumerate() {
                        out[c] += v * weight;
                    }
                }
                out
            }
        };

        self.dp.add_noise(&mut combined)?;
        Ok(combined)
    }

    /// Verify signature, bounds, and encoding; returns the dense gradient
    fn verify_update(&self, update: &ClientUpdate) -> Result<Vec<f64>> {
        let descriptor = self
            .client(&update.client_id)
            .ok_or_else(|| Error::Integrity(format!("unknown client {}", update.client_id)))?;

        let key = UnparsedPublicKey::new(&ED25519, descriptor.public_key.clone());
        if key
            .verify(&update.signed_payload(), &update.signature)
            .is_err()
        {
            self.penalize(&update.client_id);
            return Err(Error::Integrity(format!(
                "signature mismatch from {}",
                update.client_id
            )));
        }

        if update.sample_count < self.config.min_sample_count
            || update.sample_count > self.config.max_sample_count
        {
            return Err(Error::Integrity(format!(
                "sample count {} out of bounds",
                update.sample_count
            )));
        }

        let mut dense = decompress(&update.gradient, self.config.model_dimension)?;
        self.dp.clip(&mut dense);
        Ok(dense)
    }

    fn handle_out_of_round(&self, update: ClientUpdate, dense: Vec<f64>) -> Result<()> {
        let history = self.history.lock();
        let in_grace = history.last_closed == Some(update.round_id)
            && history
                .last_deadline
                .map(|deadline| {
                    Utc::now()
                        <= deadline
                            + ChronoDuration::seconds(self.config.grace_window_seconds as i64)
                })
                .unwrap_or(false);
        drop(history);

        if in_grace {
            debug!(client = %update.client_id, round = update.round_id, "late update carried over");
            self.carry_over
                .lock()
                .push((update.client_id, dense, update.sample_count));
            Ok(())
        } else {
            self.discarded.fetch_add(1, Ordering::SeqCst);
            Err(Error::Integrity(format!(
                "update for round {} outside any collection window",
                update.round_id
            )))
        }
    }

    fn penalize(&self, client_id: &str) {
        let mut clients = self.clients.write();
        if let Some(descriptor) = clients.get_mut(client_id) {
            descriptor.reputation = (descriptor.reputation - REPUTATION_PENALTY).max(0.0);
            warn!(
                client = client_id,
                reputation = descriptor.reputation,
                "reputation decremented"
            );
        }
    }

    /// Stable shard assignment so per-client baselines survive across
    /// rounds
    fn shard_of(&self, client_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        client_id.hash(&mut hasher);
        (hasher.finish() % self.config.shards.max(1) as u64) as usize
    }

    fn set_round_state(&self, state: RoundState) {
        if let Some(round) = self.current_round.write().as_mut() {
            round.state = state;
        }
    }

    fn abort_round(&self, round_id: RoundId, reason: &str) -> Result<RoundOutcome> {
        warn!(round_id, reason, "round aborted, previous model retained");
        self.collection.lock().take();
        if let Some(round) = self.current_round.write().as_mut() {
            round.state = RoundState::Aborted {
                reason: reason.to_string(),
            };
        }
        self.rounds_aborted.fetch_add(1, Ordering::SeqCst);
        self.events.emit(
            EventKind::RoundAborted { round_id },
            None,
            reason.to_string(),
        );
        Ok(RoundOutcome::Aborted {
            round_id,
            reason: reason.to_string(),
        })
    }
}

fn mode_name(mode: AggregationMode) -> &'static str {
    match mode {
        AggregationMode::Krum => "krum",
        AggregationMode::MultiKrum => "multi_krum",
        AggregationMode::TrimmedMean => "trimmed_mean",
        AggregationMode::Median => "median",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{compress, CompressedGradient};
    use meshguard_common::config::{CompressionKind, DpConfig};
    use ring::rand::SystemRandom;
    use ring::signature::{Ed25519KeyPair, KeyPair};
    use tempfile::TempDir;

    const DIMENSION: usize = 8;

    struct TestClient {
        id: ClientId,
        keypair: Ed25519KeyPair,
    }

    impl TestClient {
        fn new(id: &str) -> Self {
            let rng = SystemRandom::new();
            let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
            let keypair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap();
            TestClient {
                id: id.to_string(),
                keypair,
            }
        }

        fn descriptor(&self) -> ClientDescriptor {
            ClientDescriptor::new(
                self.id.clone(),
                self.keypair.public_key().as_ref().to_vec(),
            )
        }

        fn update(&self, round_id: RoundId, values: &[f64]) -> ClientUpdate {
            let gradient = compress(values, CompressionKind::None, 0.1);
            self.signed(round_id, gradient)
        }

        fn signed(&self, round_id: RoundId, gradient: CompressedGradient) -> ClientUpdate {
            let mut update = ClientUpdate {
                round_id,
                client_id: self.id.clone(),
                gradient,
                sample_count: 100,
                signature: Vec::new(),
            };
            update.signature = self
                .keypair
                .sign(&update.signed_payload())
                .as_ref()
                .to_vec();
            update
        }
    }

    struct Fixture {
        aggregator: Arc<FlAggregator>,
        clients: Vec<TestClient>,
        _store_dir: TempDir,
    }

    fn fixture(mut mutate: impl FnMut(&mut FederatedConfig), client_count: usize) -> Fixture {
        let store_dir = TempDir::new().unwrap();
        let mut config = FederatedConfig {
            clients_per_round: client_count,
            min_participants: client_count.min(3),
            round_deadline_seconds: 1,
            quorum_fraction: 1.0,
            model_dimension: DIMENSION,
            checkpoint_path: store_dir.path().to_path_buf(),
            // Median is safe for any population size; krum tests override
            // the mode and bound explicitly
            aggregation_mode: AggregationMode::Median,
            byzantine_f: 0,
            dp: DpConfig {
                enabled: false,
                ..DpConfig::default()
            },
            ..FederatedConfig::default()
        };
        mutate(&mut config);

        let store =
            Arc::new(ModelStore::open(&config.checkpoint_path, 3, DIMENSION).unwrap());
        let aggregator = Arc::new(FlAggregator::new(
            config,
            store,
            Arc::new(NullTransport),
            EventBus::new(64),
        ));

        let clients: Vec<TestClient> = (0..client_count)
            .map(|i| TestClient::new(&format!("node-{}", i)))
            .collect();
        for client in &clients {
            aggregator.register_client(client.descriptor());
        }

        Fixture {
            aggregator,
            clients,
            _store_dir: store_dir,
        }
    }

    /// Wait until a fresh collection window is open and return its round id
    async fn wait_for_collecting(aggregator: &FlAggregator) -> RoundId {
        for _ in 0..200 {
            if let Some(round) = aggregator.current_round() {
                if round.state == RoundState::Collecting {
                    return round.round_id;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("collection window never opened");
    }

    /// Drive one round, feeding the given per-client gradients once the
    /// collection window opens
    async fn drive_round(fixture: &Fixture, gradients: Vec<Vec<f64>>) -> RoundOutcome {
        let aggregator = fixture.aggregator.clone();
        let round_task = tokio::spawn(async move { aggregator.run_round().await });

        let round_id = wait_for_collecting(&fixture.aggregator).await;

        for (client, gradient) in fixture.clients.iter().zip(gradients.iter()) {
            let _ = fixture
                .aggregator
                .submit_update(client.update(round_id, gradient));
        }

        round_task.await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn byzantine_round_publishes_from_the_honest_cluster() {
        let fixture = fixture(
            |config| {
                config.aggregation_mode = AggregationMode::MultiKrum;
                config.byzantine_f = 3;
                config.multi_krum_m = 5;
                config.min_participants = 10;
            },
            10,
        );

        // Seven honest updates near 1.0, three adversarial at 100x norm
        let mut gradients: Vec<Vec<f64>> = (0..7)
            .map(|i| {
                (0..DIMENSION)
                    .map(|c| 1.0 + 0.01 * (((i * DIMENSION + c) % 13) as f64 - 6.0))
                    .collect()
            })
            .collect();
        gradients.extend((0..3).map(|i| vec![100.0 * (i + 1) as f64; DIMENSION]));

        let outcome = drive_round(&fixture, gradients).await;
        let RoundOutcome::Published { version, .. } = outcome else {
            panic!("round did not publish: {:?}", outcome);
        };
        assert_eq!(version, 1, "version advances by exactly one");

        let model = fixture.aggregator.store.current();
        for weight in &model.weights {
            assert!(
                (weight - 1.0).abs() < 0.1,
                "weight {} polluted by adversaries",
                weight
            );
        }
    }

    #[tokio::test]
    async fn quorum_miss_aborts_and_keeps_the_previous_model() {
        let fixture = fixture(
            |config| {
                config.min_participants = 4;
                config.round_deadline_seconds = 0;
            },
            5,
        );

        // Nothing submitted: the zero-second deadline fires first
        let aggregator = fixture.aggregator.clone();
        let outcome = aggregator.run_round().await.unwrap();
        assert!(matches!(outcome, RoundOutcome::Aborted { .. }));

        let state = fixture.aggregator.state();
        assert_eq!(state.current_version, 0);
        assert_eq!(state.rounds_aborted, 1);
    }

    #[tokio::test]
    async fn bad_signature_is_discarded_and_penalized() {
        let fixture = fixture(|_| {}, 3);
        let honest = vec![1.0; DIMENSION];

        let aggregator = fixture.aggregator.clone();
        let round_task = tokio::spawn(async move { aggregator.run_round().await });
        let round_id = wait_for_collecting(&fixture.aggregator).await;

        // Tampered signature from node-0
        let mut forged = fixture.clients[0].update(round_id, &honest);
        forged.signature[0] ^= 0xFF;
        let err = fixture.aggregator.submit_update(forged).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
        assert!(fixture.aggregator.client("node-0").unwrap().reputation < 1.0);

        // The others still make quorum
        for client in &fixture.clients {
            let _ = fixture
                .aggregator
                .submit_update(client.update(round_id, &honest));
        }
        let outcome = round_task.await.unwrap().unwrap();
        assert!(matches!(outcome, RoundOutcome::Published { .. }));
        assert!(fixture.aggregator.state().discarded_updates >= 1);
    }

    #[tokio::test]
    async fn wrong_round_id_is_rejected() {
        let fixture = fixture(|_| {}, 3);
        let update = fixture.clients[0].update(999, &vec![1.0; DIMENSION]);
        let err = fixture.aggregator.submit_update(update).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[tokio::test]
    async fn out_of_bounds_sample_count_is_rejected() {
        let fixture = fixture(
            |config| {
                config.max_sample_count = 50;
            },
            3,
        );
        // sample_count is fixed at 100 by the test client
        let aggregator = fixture.aggregator.clone();
        let round_task = tokio::spawn(async move { aggregator.run_round().await });
        let round_id = wait_for_collecting(&fixture.aggregator).await;

        let err = fixture
            .aggregator
            .submit_update(fixture.clients[0].update(round_id, &vec![1.0; DIMENSION]))
            .unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
        fixture.aggregator.stop();
        let _ = round_task.await.unwrap();
    }

    #[tokio::test]
    async fn compressed_updates_aggregate_after_reconstruction() {
        let fixture = fixture(
            |config| {
                config.aggregation_mode = AggregationMode::Median;
                config.compression.scheme = CompressionKind::TopKInt8;
            },
            3,
        );

        let aggregator = fixture.aggregator.clone();
        let round_task = tokio::spawn(async move { aggregator.run_round().await });
        let round_id = wait_for_collecting(&fixture.aggregator).await;

        for client in &fixture.clients {
            let values = vec![2.0, -2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
            let gradient = compress(&values, CompressionKind::TopKInt8, 0.25);
            let _ = fixture.aggregator.submit_update(client.signed(round_id, gradient));
        }

        let outcome = round_task.await.unwrap().unwrap();
        assert!(matches!(outcome, RoundOutcome::Published { .. }));
        let model = fixture.aggregator.store.current();
        assert!((model.weights[0] - 2.0).abs() < 0.05);
        assert!((model.weights[1] + 2.0).abs() < 0.05);
        assert!(model.weights[2].abs() < 1e-9);
    }

    #[tokio::test]
    async fn dp_budget_exhaustion_refuses_new_rounds() {
        let fixture = fixture(
            |config| {
                config.dp = DpConfig {
                    enabled: true,
                    clip_norm: 100.0,
                    noise_sigma: 0.0,
                    epsilon_budget: 0.2,
                    epsilon_per_round: 0.1,
                    delta: 1e-5,
                };
            },
            3,
        );
        let honest = vec![1.0; DIMENSION];

        for expected_version in 1..=2u64 {
            let gradients = vec![honest.clone(); 3];
            let outcome = drive_round(&fixture, gradients).await;
            assert!(
                matches!(outcome, RoundOutcome::Published { version, .. } if version == expected_version)
            );
        }

        let err = fixture.aggregator.run_round().await.unwrap_err();
        assert!(matches!(err, Error::BudgetExhausted(_)));

        let state = fixture.aggregator.state();
        assert!(state.dp_budget_exhausted);
        assert_eq!(state.current_version, 2, "previous model remains current");
    }

    #[tokio::test]
    async fn sharded_rounds_combine_by_sample_weight() {
        let fixture = fixture(
            |config| {
                config.shards = 2;
                config.aggregation_mode = AggregationMode::Median;
                config.min_participants = 4;
            },
            6,
        );

        let gradients = vec![vec![3.0; DIMENSION]; 6];
        let outcome = drive_round(&fixture, gradients).await;
        assert!(matches!(outcome, RoundOutcome::Published { .. }));

        let model = fixture.aggregator.store.current();
        for weight in &model.weights {
            assert!((weight - 3.0).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn late_update_within_grace_carries_into_the_next_round() {
        let fixture = fixture(
            |config| {
                config.grace_window_seconds = 30;
            },
            4,
        );
        let honest = vec![1.0; DIMENSION];

        // Round 1 publishes without node-3
        let aggregator = fixture.aggregator.clone();
        let round_task = tokio::spawn(async move { aggregator.run_round().await });
        let round_id = wait_for_collecting(&fixture.aggregator).await;
        for client in &fixture.clients[..3] {
            let _ = fixture
                .aggregator
                .submit_update(client.update(round_id, &honest));
        }
        let outcome = round_task.await.unwrap().unwrap();
        assert!(matches!(outcome, RoundOutcome::Published { .. }));

        // node-3 arrives late but within the grace window: accepted and
        // held for the next round instead of discarded
        let late = fixture.clients[3].update(round_id, &honest);
        fixture.aggregator.submit_update(late).unwrap();

        let aggregator = fixture.aggregator.clone();
        let round_task = tokio::spawn(async move { aggregator.run_round().await });
        let next_round = wait_for_collecting(&fixture.aggregator).await;
        assert!(next_round > round_id);
        for client in &fixture.clients[..3] {
            let _ = fixture
                .aggregator
                .submit_update(client.update(next_round, &honest));
        }
        let outcome = round_task.await.unwrap().unwrap();
        assert!(matches!(outcome, RoundOutcome::Published { .. }));
        let round = fixture.aggregator.current_round().unwrap();
        assert_eq!(round.received_updates, 4, "carried update counted");
    }

    #[tokio::test]
    async fn versions_increase_across_rounds() {
        let fixture = fixture(|_| {}, 5);
        let honest = vec![0.5; DIMENSION];
        for expected in 1..=3u64 {
            let outcome = drive_round(&fixture, vec![honest.clone(); 5]).await;
            let RoundOutcome::Published { version, .. } = outcome else {
                panic!("round failed");
            };
            assert_eq!(version, expected);
        }
        assert_eq!(fixture.aggregator.state().rounds_published, 3);
    }
}
