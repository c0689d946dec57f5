//! HTTP handlers for the controller surface

use crate::controller::Controller;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use meshguard_common::events::EventKind;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tracing::error;

/// Application state shared across handlers
pub struct AppState {
    pub controller: Arc<Controller>,
    pub registry: Registry,
    gauges: Gauges,
}

struct Gauges {
    iteration: IntGauge,
    last_violations: IntGauge,
    degraded: IntGauge,
    fl_version: IntGauge,
    fl_rounds_published: IntGauge,
    fl_rounds_aborted: IntGauge,
    fl_budget_exhausted: IntGauge,
    alerts_dropped: IntGauge,
    alerts_deduplicated: IntGauge,
}

impl AppState {
    pub fn new(controller: Arc<Controller>) -> Arc<Self> {
        let registry = Registry::new();
        let gauge = |name: &str, help: &str| {
            let g = IntGauge::with_opts(Opts::new(name, help)).expect("valid gauge opts");
            registry.register(Box::new(g.clone())).expect("unique gauge");
            g
        };

        let gauges = Gauges {
            iteration: gauge("meshguard_loop_iteration", "Autonomic loop iterations"),
            last_violations: gauge(
                "meshguard_loop_last_violations",
                "Violations observed in the last tick",
            ),
            degraded: gauge("meshguard_loop_degraded", "1 when the loop is degraded"),
            fl_version: gauge("meshguard_fl_model_version", "Current global model version"),
            fl_rounds_published: gauge("meshguard_fl_rounds_published", "Published rounds"),
            fl_rounds_aborted: gauge("meshguard_fl_rounds_aborted", "Aborted rounds"),
            fl_budget_exhausted: gauge(
                "meshguard_fl_dp_budget_exhausted",
                "1 once the privacy budget is spent",
            ),
            alerts_dropped: gauge(
                "meshguard_alerts_dropped_total",
                "Alerts dropped by queue overflow",
            ),
            alerts_deduplicated: gauge(
                "meshguard_alerts_deduplicated_total",
                "Alerts suppressed by the dedup window",
            ),
        };

        let event_counter = IntCounterVec::new(
            Opts::new("meshguard_events_total", "Control events by kind"),
            &["kind"],
        )
        .expect("valid counter opts");
        registry
            .register(Box::new(event_counter.clone()))
            .expect("unique counter");

        // Count control events in the background for the /metrics surface
        let mut events = controller.events().subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                event_counter
                    .with_label_values(&[event_kind_label(&event.kind)])
                    .inc();
            }
        });

        Arc::new(AppState {
            controller,
            registry,
            gauges,
        })
    }

    fn refresh(&self) {
        let loop_state = self.controller.loop_state();
        self.gauges.iteration.set(loop_state.iteration as i64);
        self.gauges
            .last_violations
            .set(loop_state.last_violation_count as i64);
        self.gauges.degraded.set(loop_state.degraded as i64);

        let fl = self.controller.fl_state();
        self.gauges.fl_version.set(fl.current_version as i64);
        self.gauges
            .fl_rounds_published
            .set(fl.rounds_published as i64);
        self.gauges.fl_rounds_aborted.set(fl.rounds_aborted as i64);
        self.gauges
            .fl_budget_exhausted
            .set(fl.dp_budget_exhausted as i64);

        let counters = self.controller.alert_sink().counters();
        self.gauges
            .alerts_dropped
            .set(counters.dropped_overflow as i64);
        self.gauges
            .alerts_deduplicated
            .set(counters.deduplicated as i64);
    }
}

fn event_kind_label(kind: &EventKind) -> &'static str {
    match kind {
        EventKind::Heartbeat => "heartbeat",
        EventKind::ViolationsDetected { .. } => "violations_detected",
        EventKind::AnalysisCompleted => "analysis_completed",
        EventKind::PolicySelected => "policy_selected",
        EventKind::PolicyPendingApproval => "policy_pending",
        EventKind::PolicyApproved => "policy_approved",
        EventKind::PolicyRejected => "policy_rejected",
        EventKind::PolicySuperseded => "policy_superseded",
        EventKind::ExecutionStarted => "execution_started",
        EventKind::ExecutionFinished { .. } => "execution_finished",
        EventKind::RollbackPerformed => "rollback_performed",
        EventKind::OutcomeRecorded { .. } => "outcome_recorded",
        EventKind::OrchestratorDegraded => "orchestrator_degraded",
        EventKind::OrchestratorCleared => "orchestrator_cleared",
        EventKind::RoundOpened { .. } => "round_opened",
        EventKind::RoundPublished { .. } => "round_published",
        EventKind::RoundAborted { .. } => "round_aborted",
        EventKind::DpBudgetExhausted => "dp_budget_exhausted",
        EventKind::ComponentError { .. } => "component_error",
    }
}

/// Build the full router: health, metrics, and the alert webhook
pub fn create_router(state: Arc<AppState>) -> Router {
    let webhook = state.controller.alert_sink().router();
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
        .merge(webhook)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let loop_state = state.controller.loop_state();
    let fl_state = state.controller.fl_state();
    let status = if loop_state.degraded {
        "degraded"
    } else if loop_state.is_running {
        "ok"
    } else {
        "stopped"
    };

    Json(serde_json::json!({
        "status": status,
        "timestamp": chrono::Utc::now(),
        "loop": loop_state,
        "federated": fl_state,
    }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.refresh();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&state.registry.gather(), &mut buffer) {
        error!(error = %e, "metrics encoding failed");
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new()).into_response();
    }
    (
        [("content-type", prometheus::TEXT_FORMAT)],
        String::from_utf8_lossy(&buffer).into_owned(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use meshguard_common::config::MeshConfig;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_state(dir: &TempDir) -> Arc<AppState> {
        let mut config = MeshConfig::default();
        config.knowledge.store_path = dir.path().join("knowledge");
        config.federated.checkpoint_path = dir.path().join("models");
        let controller = Arc::new(Controller::new(config).unwrap());
        AppState::new(controller)
    }

    #[tokio::test]
    async fn health_reports_stopped_before_start() {
        let dir = TempDir::new().unwrap();
        let app = create_router(test_state(&dir));

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "stopped");
        assert_eq!(json["loop"]["iteration"], 0);
        assert_eq!(json["federated"]["current_version"], 0);
    }

    #[tokio::test]
    async fn metrics_render_prometheus_text() {
        let dir = TempDir::new().unwrap();
        let app = create_router(test_state(&dir));

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("# HELP"));
        assert!(text.contains("meshguard_loop_iteration"));
        assert!(text.contains("meshguard_fl_model_version"));
    }

    #[tokio::test]
    async fn webhook_route_is_mounted() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let sink = state.controller.alert_sink();
        let app = create_router(state);

        let payload = serde_json::json!({
            "alerts": [{
                "labels": {"alertname": "MeshDown"},
                "startsAt": "2026-01-10T12:00:00Z",
                "fingerprint": "fp-9"
            }]
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook/alerts")
                    .header("content-type", "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(sink.queued(), 1);
    }
}
