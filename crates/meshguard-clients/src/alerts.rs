//! Alert webhook sink and inbound queue
//!
//! External alerting systems push JSON payloads at this sink; the monitor
//! drains the queue once per tick. The queue is the only shared-mutable
//! state in this crate and sits behind one mutex with short critical
//! sections.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::post;
use axum::Router;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use meshguard_common::config::AlertSinkConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// One alert accepted into the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshAlert {
    pub alertname: String,
    pub fingerprint: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
}

/// Inbound webhook payload
#[derive(Debug, Deserialize)]
struct WebhookPayload {
    alerts: Vec<WebhookAlert>,
}

#[derive(Debug, Deserialize)]
struct WebhookAlert {
    #[serde(default)]
    labels: HashMap<String, String>,
    #[serde(default)]
    annotations: HashMap<String, String>,
    #[serde(rename = "startsAt")]
    starts_at: DateTime<Utc>,
    #[serde(rename = "endsAt", default)]
    ends_at: Option<DateTime<Utc>>,
    fingerprint: String,
}

/// Sink counters, exposed for metrics scraping
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SinkCounters {
    pub accepted: u64,
    pub deduplicated: u64,
    pub dropped_overflow: u64,
    pub malformed: u64,
}

#[derive(Debug, Default)]
struct SinkState {
    queue: VecDeque<MeshAlert>,
    /// Last-seen time per `(alertname, fingerprint)` for dedup
    recent: HashMap<(String, String), DateTime<Utc>>,
    counters: SinkCounters,
}

/// Bounded, deduplicating alert queue with a webhook front end
pub struct AlertSink {
    config: AlertSinkConfig,
    state: Mutex<SinkState>,
}

impl AlertSink {
    pub fn new(config: AlertSinkConfig) -> Self {
        AlertSink {
            config,
            state: Mutex::new(SinkState::default()),
        }
    }

    /// Accept a batch of alerts. Duplicates within the sliding window are
    /// suppressed; on overflow the oldest queued alert is dropped and
    /// counted.
    pub fn ingest(&self, alerts: Vec<MeshAlert>, now: DateTime<Utc>) -> SinkCounters {
        let window = ChronoDuration::seconds(self.config.dedup_window_seconds as i64);
        let mut state = self.state.lock();

        state.recent.retain(|_, seen| now - *seen <= window);

        for alert in alerts {
            let key = (alert.alertname.clone(), alert.fingerprint.clone());
            if let Some(seen) = state.recent.get(&key) {
                if now - *seen <= window {
                    state.counters.deduplicated += 1;
                    continue;
                }
            }
            state.recent.insert(key, now);

            if state.queue.len() >= self.config.queue_capacity {
                state.queue.pop_front();
                state.counters.dropped_overflow += 1;
            }
            state.queue.push_back(alert);
            state.counters.accepted += 1;
        }

        state.counters
    }

    /// Record a payload that failed to parse. Bad payloads are counted and
    /// dropped, never raised to the monitor.
    pub fn record_malformed(&self) {
        self.state.lock().counters.malformed += 1;
    }

    /// Drain up to `max` queued alerts, oldest first
    pub fn drain(&self, max: usize) -> Vec<MeshAlert> {
        let mut state = self.state.lock();
        let take = max.min(state.queue.len());
        state.queue.drain(..take).collect()
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn counters(&self) -> SinkCounters {
        self.state.lock().counters
    }

    /// Webhook router mounted by the controller surface
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/webhook/alerts", post(receive_alerts))
            .with_state(self)
    }
}

async fn receive_alerts(
    State(sink): State<Arc<AlertSink>>,
    body: String,
) -> impl IntoResponse {
    let payload: WebhookPayload = match serde_json::from_str(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "rejecting malformed alert payload");
            sink.record_malformed();
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "malformed payload"})),
            );
        }
    };

    if payload.alerts.len() > sink.config.queue_capacity {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": "payload exceeds queue capacity"})),
        );
    }

    let now = Utc::now();
    let alerts = payload
        .alerts
        .into_iter()
        .map(|a| MeshAlert {
            alertname: a
                .labels
                .get("alertname")
                .cloned()
                .unwrap_or_else(|| "unnamed".to_string()),
            fingerprint: a.fingerprint,
            labels: a.labels,
            annotations: a.annotations,
            starts_at: a.starts_at,
            ends_at: a.ends_at,
            received_at: now,
        })
        .collect();

    let counters = sink.ingest(alerts, now);
    debug!(queued = sink.queued(), "alert batch enqueued");
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "accepted": counters.accepted,
            "deduplicated": counters.deduplicated,
            "dropped": counters.dropped_overflow,
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn alert(name: &str, fingerprint: &str) -> MeshAlert {
        MeshAlert {
            alertname: name.to_string(),
            fingerprint: fingerprint.to_string(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            starts_at: Utc::now(),
            ends_at: None,
            received_at: Utc::now(),
        }
    }

    fn small_sink(capacity: usize) -> AlertSink {
        AlertSink::new(AlertSinkConfig {
            queue_capacity: capacity,
            dedup_window_seconds: 300,
        })
    }

    #[test]
    fn duplicates_within_window_are_suppressed() {
        let sink = small_sink(16);
        let now = Utc::now();
        sink.ingest(vec![alert("HighLatency", "f1")], now);
        let counters = sink.ingest(vec![alert("HighLatency", "f1")], now);
        assert_eq!(counters.accepted, 1);
        assert_eq!(counters.deduplicated, 1);
        assert_eq!(sink.queued(), 1);
    }

    #[test]
    fn duplicate_outside_window_is_accepted_again() {
        let sink = small_sink(16);
        let t0 = Utc::now();
        sink.ingest(vec![alert("HighLatency", "f1")], t0);
        let later = t0 + ChronoDuration::seconds(301);
        let counters = sink.ingest(vec![alert("HighLatency", "f1")], later);
        assert_eq!(counters.accepted, 2);
        assert_eq!(counters.deduplicated, 0);
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let sink = small_sink(2);
        let now = Utc::now();
        sink.ingest(
            vec![alert("A", "1"), alert("B", "2"), alert("C", "3")],
            now,
        );
        assert_eq!(sink.queued(), 2);
        assert_eq!(sink.counters().dropped_overflow, 1);
        let drained = sink.drain(10);
        assert_eq!(drained[0].alertname, "B");
        assert_eq!(drained[1].alertname, "C");
    }

    #[test]
    fn drain_empties_in_fifo_order() {
        let sink = small_sink(16);
        let now = Utc::now();
        sink.ingest(vec![alert("A", "1"), alert("B", "2")], now);
        let first = sink.drain(1);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].alertname, "A");
        assert_eq!(sink.queued(), 1);
    }

    #[tokio::test]
    async fn webhook_accepts_valid_payload() {
        let sink = Arc::new(small_sink(16));
        let app = sink.clone().router();
        let body = serde_json::json!({
            "alerts": [{
                "labels": {"alertname": "MeshDown", "instance": "router-a"},
                "annotations": {"summary": "mesh link flapping"},
                "startsAt": "2026-01-10T12:00:00Z",
                "fingerprint": "abc123"
            }]
        });

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook/alerts")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(sink.queued(), 1);
    }

    #[tokio::test]
    async fn webhook_rejects_malformed_payload() {
        let sink = Arc::new(small_sink(16));
        let app = sink.clone().router();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook/alerts")
                    .header("content-type", "application/json")
                    .body(Body::from("{\"not\": \"alerts\""))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(sink.counters().malformed, 1);
        assert_eq!(sink.queued(), 0);
    }
}
