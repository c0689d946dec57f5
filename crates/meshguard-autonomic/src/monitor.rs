//! Monitor stage: poll the metrics store, drain alerts, emit violations

use crate::executor::ViolationProbe;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use meshguard_clients::alerts::{AlertSink, MeshAlert};
use meshguard_clients::metrics::{MetricsApi, QueryResult};
use meshguard_common::config::{MetricQuery, MonitorConfig, ThresholdRule};
use meshguard_common::types::{
    AdvisorySnapshot, MetricSample, MonitorOutput, Observation, Severity, SummaryStats, Violation,
};
use meshguard_common::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Metric name of the synthetic violation emitted when observations go
/// stale beyond the configured budget
pub const STALE_METRIC: &str = "MONITOR_STALE";

struct LastGood {
    samples: Vec<MetricSample>,
    refreshed_at: DateTime<Utc>,
}

/// Monitor stage of the autonomic loop. One instance is owned by the
/// orchestrator; `tick` is called once per cycle.
pub struct Monitor {
    config: MonitorConfig,
    metrics: Arc<dyn MetricsApi>,
    alerts: Arc<AlertSink>,
    violation_seq: AtomicU64,
    last_good: HashMap<String, LastGood>,
    /// Monotonic clamp per source component, backing the violation-ordering
    /// invariant
    last_detected: HashMap<String, DateTime<Utc>>,
}

impl Monitor {
    pub fn new(config: MonitorConfig, metrics: Arc<dyn MetricsApi>, alerts: Arc<AlertSink>) -> Self {
        Monitor {
            config,
            metrics,
            alerts,
            violation_seq: AtomicU64::new(1),
            last_good: HashMap::new(),
            last_detected: HashMap::new(),
        }
    }

    /// Run one monitoring pass: issue the fixed query set, join with
    /// drained alerts, apply adaptive thresholds.
    pub async fn tick(
        &mut self,
        now: DateTime<Utc>,
        advisory: &AdvisorySnapshot,
    ) -> Result<MonitorOutput> {
        let window = Duration::from_secs(self.config.window_seconds);
        let window_start = now - ChronoDuration::seconds(self.config.window_seconds as i64);
        let query_deadline = Duration::from_millis(self.config.query_timeout_ms);

        let metrics = self.metrics.clone();
        let results: Vec<(MetricQuery, Result<QueryResult>)> =
            stream::iter(self.config.queries.clone())
                .map(|query| {
                    let metrics = metrics.clone();
                    async move {
                        let outcome =
                            timeout(query_deadline, metrics.range_query(&query.expression, window))
                                .await
                                .unwrap_or_else(|_| {
                                    Err(Error::Timeout(format!(
                                        "range query for {} exceeded deadline",
                                        query.metric
                                    )))
                                });
                        (query, outcome)
                    }
                })
                .buffer_unordered(self.config.query_concurrency.max(1))
                .collect()
                .await;

        let mut observations = Vec::new();
        let mut violations = Vec::new();

        for (query, outcome) in results {
            match outcome {
                Ok(result) if !result.partial => {
                    self.last_good.insert(
                        query.metric.clone(),
                        LastGood {
                            samples: result.samples.clone(),
                            refreshed_at: now,
                        },
                    );
                    observations.push(build_observation(
                        &query.metric,
                        window_start,
                        now,
                        result.samples,
                    ));
                }
                degraded => {
                    match &degraded {
                        Ok(_) => warn!(metric = %query.metric, "store returned partial results"),
                        Err(e) => warn!(metric = %query.metric, error = %e, "range query failed"),
                    }
                    let budget =
                        ChronoDuration::seconds(self.config.staleness_budget_seconds as i64);
                    match self.last_good.get(&query.metric) {
                        Some(last) if now - last.refreshed_at <= budget => {
                            debug!(metric = %query.metric, "degrading to last-good observations");
                            observations.push(build_observation(
                                &query.metric,
                                window_start,
                                now,
                                last.samples.clone(),
                            ));
                        }
                        _ => {
                            violations.push(self.make_violation(
                                Severity::Warning,
                                &query.source_component,
                                STALE_METRIC,
                                0.0,
                                0.0,
                                now,
                                query.metric.clone(),
                            ));
                        }
                    }
                }
            }
        }

        for observation in &observations {
            // Copies of the rule and query fields keep the borrow of the
            // configuration from overlapping the mutable violation path.
            let Some((base, critical_multiplier, rule_severity, effective)) = self
                .config
                .thresholds
                .iter()
                .find(|r| r.metric == observation.metric)
                .map(|rule| {
                    let narrowing = advisory
                        .threshold_narrowing
                        .get(&observation.metric)
                        .copied()
                        .unwrap_or(1.0);
                    (
                        rule.base,
                        rule.critical_multiplier,
                        rule.severity,
                        effective_threshold(rule, &observation.samples, narrowing),
                    )
                })
            else {
                continue;
            };
            let query = self
                .config
                .queries
                .iter()
                .find(|q| q.metric == observation.metric);
            let source = query
                .map(|q| q.source_component.clone())
                .unwrap_or_else(|| "monitor".to_string());
            let correlation_label = query
                .map(|q| q.correlation_label.clone())
                .unwrap_or_default();

            let breaches: Vec<(f64, DateTime<Utc>, String)> = observation
                .samples
                .iter()
                .filter(|s| !s.value.is_nan() && s.value > effective)
                .map(|s| {
                    let key = s
                        .labels
                        .get(&correlation_label)
                        .cloned()
                        .unwrap_or_else(|| source.clone());
                    (s.value, s.timestamp, key)
                })
                .collect();

            for (value, at, key) in breaches {
                let severity = if value >= base * critical_multiplier {
                    Severity::Critical
                } else {
                    rule_severity
                };
                let violation = self.make_violation(
                    severity,
                    &source,
                    &observation.metric,
                    value,
                    effective,
                    at,
                    key,
                );
                violations.push(violation);
            }
        }

        // Alert-sink failures are non-fatal; the drain is in-memory and
        // bounded by the configured budget.
        let drained = timeout(
            Duration::from_millis(self.config.alert_drain_timeout_ms),
            async { self.alerts.drain(usize::MAX) },
        )
        .await
        .unwrap_or_default();
        for alert in drained {
            violations.push(self.violation_from_alert(alert, now));
        }

        debug!(
            observations = observations.len(),
            violations = violations.len(),
            "monitor tick complete"
        );
        Ok(MonitorOutput {
            window_start,
            window_end: now,
            observations,
            violations,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn make_violation(
        &mut self,
        kind: Severity,
        source_component: &str,
        metric_name: &str,
        observed_value: f64,
        threshold: f64,
        at: DateTime<Utc>,
        correlation_key: String,
    ) -> Violation {
        // detected_at is clamped so it never regresses for a component,
        // which makes the id order imply time order per component.
        let floor = self
            .last_detected
            .get(source_component)
            .copied()
            .unwrap_or(at);
        let detected_at = at.max(floor);
        self.last_detected
            .insert(source_component.to_string(), detected_at);

        Violation {
            id: self.violation_seq.fetch_add(1, Ordering::SeqCst),
            kind,
            source_component: source_component.to_string(),
            metric_name: metric_name.to_string(),
            observed_value,
            threshold,
            detected_at,
            correlation_key,
        }
    }

    fn violation_from_alert(&mut self, alert: MeshAlert, now: DateTime<Utc>) -> Violation {
        let severity = match alert.labels.get("severity").map(String::as_str) {
            Some("critical") => Severity::Critical,
            Some("info") => Severity::Info,
            _ => Severity::Warning,
        };
        let metric = alert
            .labels
            .get("metric")
            .cloned()
            .unwrap_or_else(|| alert.alertname.clone());
        let source = alert
            .labels
            .get("component")
            .cloned()
            .unwrap_or_else(|| "alert-sink".to_string());
        let key = alert
            .labels
            .get("instance")
            .cloned()
            .unwrap_or_else(|| alert.fingerprint.clone());
        let observed = alert
            .annotations
            .get("observed_value")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);
        let threshold = alert
            .annotations
            .get("threshold")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);

        self.make_violation(severity, &source, &metric, observed, threshold, now, key)
    }
}

fn build_observation(
    metric: &str,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    samples: Vec<MetricSample>,
) -> Observation {
    let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
    Observation {
        metric: metric.to_string(),
        window_start,
        window_end,
        stats: SummaryStats::from_values(&values),
        samples,
    }
}

/// Adaptive threshold: `base + k * sigma_recent`, with the advisory
/// narrowing multiplier applied to `k`, clamped into the envelope
fn effective_threshold(rule: &ThresholdRule, samples: &[MetricSample], narrowing: f64) -> f64 {
    let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
    let sigma = SummaryStats::stddev(&values);
    let raw = rule.base + rule.sigma_factor * narrowing * sigma;
    raw.clamp(rule.envelope_min, rule.envelope_max)
}

/// Verification probe the executor uses after applying a policy: re-read
/// the configured metrics and count base-threshold breaches on the given
/// correlation keys.
pub struct ThresholdProbe {
    config: MonitorConfig,
    metrics: Arc<dyn MetricsApi>,
}

impl ThresholdProbe {
    pub fn new(config: MonitorConfig, metrics: Arc<dyn MetricsApi>) -> Self {
        ThresholdProbe { config, metrics }
    }
}

#[async_trait]
impl ViolationProbe for ThresholdProbe {
    async fn current_violations(&self, correlation_keys: &[String]) -> Result<usize> {
        let window = Duration::from_secs(self.config.window_seconds);
        let mut count = 0usize;
        for query in &self.config.queries {
            let Some(rule) = self
                .config
                .thresholds
                .iter()
                .find(|r| r.metric == query.metric)
            else {
                continue;
            };
            let result = self.metrics.range_query(&query.expression, window).await?;
            count += result
                .samples
                .iter()
                .filter(|s| {
                    !s.value.is_nan()
                        && s.value > rule.base
                        && s.labels
                            .get(&query.correlation_label)
                            .map(|key| correlation_keys.contains(key))
                            .unwrap_or(false)
                })
                .count();
        }
        Ok(count)
    }
}
