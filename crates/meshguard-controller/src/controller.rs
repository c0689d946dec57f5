//! Control-plane composition: one struct owning every subsystem

use meshguard_autonomic::approval::{ApprovalOracle, AutoApprover, LedgerOracle};
use meshguard_autonomic::monitor::ThresholdProbe;
use meshguard_autonomic::{Analyzer, Knowledge, Monitor, Orchestrator, OrchestratorState};
use meshguard_clients::alerts::AlertSink;
use meshguard_clients::charter::CharterClient;
use meshguard_clients::metrics::MetricsClient;
use meshguard_common::config::{AlertSinkConfig, MeshConfig};
use meshguard_common::events::EventBus;
use meshguard_common::Result;
use meshguard_federated::aggregator::{FlAggregator, FlState, NullTransport};
use meshguard_federated::ModelStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// The assembled control plane
pub struct Controller {
    config: MeshConfig,
    alert_sink: Arc<AlertSink>,
    orchestrator: Arc<Orchestrator>,
    aggregator: Arc<FlAggregator>,
    events: EventBus,
    fl_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Controller {
    /// Build every subsystem from explicit configuration. Nothing starts
    /// running until [`Controller::start`].
    pub fn new(config: MeshConfig) -> Result<Self> {
        config.validate()?;
        let events = EventBus::default();

        let metrics = Arc::new(MetricsClient::new(
            config.endpoints.metrics_url.clone(),
            Duration::from_millis(config.monitor.query_timeout_ms),
        )?);
        let charter = Arc::new(CharterClient::new(
            config.endpoints.charter_url.clone(),
            Duration::from_secs(config.executor.action_timeout_seconds),
        )?);
        let alert_sink = Arc::new(AlertSink::new(AlertSinkConfig::default()));

        let monitor = Monitor::new(config.monitor.clone(), metrics.clone(), alert_sink.clone());
        let analyzer = Analyzer::new(config.analyzer.clone());
        let knowledge = Arc::new(Knowledge::open(config.knowledge.clone())?);
        let probe = Arc::new(ThresholdProbe::new(config.monitor.clone(), metrics));

        let oracle: Arc<dyn ApprovalOracle> = if config.planner.auto_approve {
            Arc::new(AutoApprover)
        } else {
            Arc::new(LedgerOracle::new())
        };

        let orchestrator = Arc::new(Orchestrator::new(
            config.clone(),
            monitor,
            analyzer,
            knowledge,
            charter,
            probe,
            oracle,
            events.clone(),
        ));

        let model_store = Arc::new(ModelStore::open(
            &config.federated.checkpoint_path,
            config.federated.straggler_window_versions,
            config.federated.model_dimension,
        )?);
        let aggregator = Arc::new(FlAggregator::new(
            config.federated.clone(),
            model_store,
            Arc::new(NullTransport),
            events.clone(),
        ));

        Ok(Controller {
            config,
            alert_sink,
            orchestrator,
            aggregator,
            events,
            fl_task: parking_lot::Mutex::new(None),
        })
    }

    /// Start the autonomic loop and the federated round clock
    pub fn start(&self) {
        info!("starting control plane");
        self.orchestrator.start();
        let every = Duration::from_secs(self.config.federated.round_deadline_seconds.max(1) * 2);
        *self.fl_task.lock() = Some(self.aggregator.clone().start(every));
    }

    /// Graceful shutdown: the orchestrator finishes its in-flight tick,
    /// the aggregator aborts collection but never discards a produced
    /// aggregate.
    pub async fn stop(&self) {
        info!("stopping control plane");
        self.aggregator.stop();
        self.orchestrator.stop().await;
        if let Some(task) = self.fl_task.lock().take() {
            task.abort();
        }
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn alert_sink(&self) -> Arc<AlertSink> {
        self.alert_sink.clone()
    }

    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        self.orchestrator.clone()
    }

    pub fn aggregator(&self) -> Arc<FlAggregator> {
        self.aggregator.clone()
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn loop_state(&self) -> OrchestratorState {
        self.orchestrator.state()
    }

    pub fn fl_state(&self) -> FlState {
        self.aggregator.state()
    }
}
