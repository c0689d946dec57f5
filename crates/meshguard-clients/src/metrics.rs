//! Client for the external time-series store

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use meshguard_common::{Error, Result};
use meshguard_common::types::MetricSample;
use reqwest::{Client, ClientBuilder};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Result of one query, with the store's partial flag surfaced
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub samples: Vec<MetricSample>,
    /// True when the store answered with an incomplete result set. Callers
    /// decide whether to degrade; the client never retries on its own.
    pub partial: bool,
}

/// Read access to the time-series store
#[async_trait]
pub trait MetricsApi: Send + Sync {
    /// Evaluate a range expression over the trailing window
    async fn range_query(&self, expression: &str, window: Duration) -> Result<QueryResult>;

    /// Evaluate an instant expression
    async fn instant_query(&self, expression: &str) -> Result<QueryResult>;
}

/// Stateless HTTP client for the store's query endpoint
pub struct MetricsClient {
    client: Client,
    base_url: String,
}

/// Wire shape of the store's query response
#[derive(Debug, Deserialize)]
struct StoreResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Option<StoreData>,
}

#[derive(Debug, Deserialize)]
struct StoreData {
    #[serde(default)]
    result: Vec<StoreSeries>,
    #[serde(default)]
    partial: bool,
}

#[derive(Debug, Deserialize)]
struct StoreSeries {
    #[serde(default)]
    metric: HashMap<String, String>,
    /// Range queries answer `values`, instant queries answer `value`
    #[serde(default)]
    values: Vec<(f64, serde_json::Value)>,
    #[serde(default)]
    value: Option<(f64, serde_json::Value)>,
}

impl MetricsClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = ClientBuilder::new()
            .timeout(timeout)
            .user_agent(concat!("meshguard/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Unavailable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn query(&self, path: &str, params: &[(&str, String)]) -> Result<QueryResult> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("metrics query: {}", e))
                } else {
                    Error::Unavailable(format!("metrics store: {}", e))
                }
            })?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Query(format!("store rejected expression: {}", body)));
        }
        if !status.is_success() {
            return Err(Error::Unavailable(format!(
                "metrics store answered {}",
                status
            )));
        }

        let parsed: StoreResponse = response
            .json()
            .await
            .map_err(|e| Error::Integrity(format!("malformed store response: {}", e)))?;

        match parsed.status.as_str() {
            "success" | "partial" => {}
            _ => {
                return Err(Error::Query(
                    parsed.error.unwrap_or_else(|| "store reported an error".into()),
                ))
            }
        }

        let data = parsed.data.unwrap_or(StoreData {
            result: Vec::new(),
            partial: false,
        });
        let partial = data.partial || parsed.status == "partial";

        let mut samples = Vec::new();
        for series in data.result {
            let name = series
                .metric
                .get("__name__")
                .cloned()
                .unwrap_or_else(|| "unnamed".to_string());
            let labels: HashMap<String, String> = series
                .metric
                .iter()
                .filter(|(k, _)| k.as_str() != "__name__")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            let points = series
                .values
                .into_iter()
                .chain(series.value.into_iter())
                .collect::<Vec<_>>();
            for (ts, raw) in points {
                let Some(value) = coerce_value(&raw) else {
                    warn!(metric = %name, "dropping sample with non-numeric value");
                    continue;
                };
                let Some(timestamp) = coerce_timestamp(ts) else {
                    warn!(metric = %name, "dropping sample with out-of-range timestamp");
                    continue;
                };
                samples.push(MetricSample {
                    name: name.clone(),
                    labels: labels.clone(),
                    timestamp,
                    value,
                });
            }
        }

        debug!(
            samples = samples.len(),
            partial, "metrics query completed"
        );
        Ok(QueryResult { samples, partial })
    }
}

fn coerce_value(raw: &serde_json::Value) -> Option<f64> {
    match raw {
        serde_json::Value::String(s) => s.parse::<f64>().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn coerce_timestamp(ts: f64) -> Option<DateTime<Utc>> {
    let secs = ts.trunc() as i64;
    let nanos = ((ts.fract()) * 1e9) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

#[async_trait]
impl MetricsApi for MetricsClient {
    async fn range_query(&self, expression: &str, window: Duration) -> Result<QueryResult> {
        let params = [
            ("query", expression.to_string()),
            ("window", format!("{}s", window.as_secs())),
        ];
        self.query("/api/v1/query_range", &params).await
    }

    async fn instant_query(&self, expression: &str) -> Result<QueryResult> {
        let params = [("query", expression.to_string())];
        self.query("/api/v1/query", &params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn range_body() -> serde_json::Value {
        serde_json::json!({
            "status": "success",
            "data": {
                "result": [{
                    "metric": {
                        "__name__": "validation_latency_p99",
                        "instance": "router-a"
                    },
                    "values": [
                        [1700000000.0, "1.8"],
                        [1700000010.0, "2.0"],
                        [1700000020.0, 2.1]
                    ]
                }]
            }
        })
    }

    #[tokio::test]
    async fn range_query_parses_samples() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query_range"))
            .and(query_param("query", "validation_latency_p99"))
            .respond_with(ResponseTemplate::new(200).set_body_json(range_body()))
            .mount(&server)
            .await;

        let client = MetricsClient::new(server.uri(), Duration::from_secs(3)).unwrap();
        let result = client
            .range_query("validation_latency_p99", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(!result.partial);
        assert_eq!(result.samples.len(), 3);
        assert_eq!(result.samples[0].name, "validation_latency_p99");
        assert_eq!(result.samples[0].labels.get("instance").unwrap(), "router-a");
        assert!((result.samples[1].value - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn partial_results_are_surfaced_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query_range"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "partial",
                "data": { "result": [], "partial": true }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = MetricsClient::new(server.uri(), Duration::from_secs(3)).unwrap();
        let result = client
            .range_query("anything", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(result.partial);
        assert!(result.samples.is_empty());
    }

    #[tokio::test]
    async fn malformed_expression_maps_to_query_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(400).set_body_string("parse error at ':'"))
            .mount(&server)
            .await;

        let client = MetricsClient::new(server.uri(), Duration::from_secs(3)).unwrap();
        let err = client.instant_query("bad{{expr").await.unwrap_err();
        assert!(matches!(err, Error::Query(_)));
    }

    #[tokio::test]
    async fn store_error_status_maps_to_query_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "error",
                "error": "unknown expression fixture"
            })))
            .mount(&server)
            .await;

        let client = MetricsClient::new(server.uri(), Duration::from_secs(3)).unwrap();
        let err = client.instant_query("unknown_fixture").await.unwrap_err();
        assert!(matches!(err, Error::Query(_)));
    }

    #[tokio::test]
    async fn transport_failure_maps_to_unavailable() {
        // Nothing listens on this port
        let client =
            MetricsClient::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let err = client.instant_query("up").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn non_numeric_values_are_dropped() {
        assert_eq!(coerce_value(&serde_json::json!("2.5")), Some(2.5));
        assert_eq!(coerce_value(&serde_json::json!(3)), Some(3.0));
        assert_eq!(coerce_value(&serde_json::json!("not-a-number")), None);
        assert_eq!(coerce_value(&serde_json::json!({"v": 1})), None);
    }
}
