//! Analyzer stage: pattern detection and root-cause ranking

use chrono::Duration as ChronoDuration;
use meshguard_common::config::AnalyzerConfig;
use meshguard_common::types::{
    AnalysisResult, CauseTag, MonitorOutput, Pattern, PatternKind, RootCauseHypothesis, Violation,
};
use std::collections::{HashMap, VecDeque};
use tracing::debug;
use uuid::Uuid;

/// Violation count at which the sample factor of the overall confidence
/// saturates
const SAMPLE_SATURATION: f64 = 10.0;

/// Ceiling applied when merging hypothesis confidences
const MERGED_CONFIDENCE_CAP: f64 = 0.95;

const TEMPORAL_BURST_CONFIDENCE: f64 = 0.85;
const SPATIAL_CLUSTER_CONFIDENCE: f64 = 0.80;
const CAUSAL_PAIR_CONFIDENCE: f64 = 0.75;
const FREQUENCY_ANOMALY_CONFIDENCE: f64 = 0.70;

/// Minimum baseline length before frequency anomalies are scored
const MIN_BASELINE_TICKS: usize = 5;

/// Analyzer stage of the autonomic loop. Holds the rolling violation-rate
/// baseline across ticks.
pub struct Analyzer {
    config: AnalyzerConfig,
    rate_baseline: VecDeque<f64>,
}

impl Analyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Analyzer {
            config,
            rate_baseline: VecDeque::new(),
        }
    }

    /// Detect patterns in one monitor window and rank root-cause
    /// hypotheses. All arithmetic is f64; NaN confidences collapse to the
    /// unknown cause with confidence zero.
    pub fn analyze(&mut self, output: &MonitorOutput) -> AnalysisResult {
        let violations = &output.violations;
        let by_id: HashMap<u64, &Violation> = violations.iter().map(|v| (v.id, v)).collect();

        let mut patterns = Vec::new();
        patterns.extend(self.detect_temporal_bursts(violations));
        patterns.extend(self.detect_spatial_clusters(violations));
        patterns.extend(self.detect_causal_pairs(output));
        patterns.extend(self.detect_frequency_anomaly(violations));

        for pattern in &mut patterns {
            if pattern.confidence.is_nan() {
                pattern.confidence = 0.0;
            }
        }

        // Overlapping patterns: higher confidence wins, newer evidence
        // breaks ties.
        patterns.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.newest_evidence().cmp(&a.newest_evidence()))
        });

        let hypotheses = self.build_hypotheses(&patterns, &by_id);

        let sample_factor = (violations.len() as f64 / SAMPLE_SATURATION).min(1.0);
        let avg_confidence = if patterns.is_empty() {
            0.0
        } else {
            patterns.iter().map(|p| p.confidence).sum::<f64>() / patterns.len() as f64
        };
        let mut overall_confidence = 0.7 * avg_confidence + 0.3 * sample_factor;
        if overall_confidence.is_nan() {
            overall_confidence = 0.0;
        }

        debug!(
            patterns = patterns.len(),
            hypotheses = hypotheses.len(),
            overall_confidence,
            "analysis complete"
        );

        AnalysisResult {
            analysis_id: Uuid::new_v4(),
            window_start: output.window_start,
            window_end: output.window_end,
            patterns,
            hypotheses,
            overall_confidence,
            timestamp: output.window_end,
        }
    }

    /// >= N violations on a single correlation key within a sliding T
    fn detect_temporal_bursts(&self, violations: &[Violation]) -> Vec<Pattern> {
        let window = ChronoDuration::seconds(self.config.burst_window_seconds as i64);
        let mut by_key: HashMap<&str, Vec<&Violation>> = HashMap::new();
        for v in violations {
            by_key.entry(v.correlation_key.as_str()).or_default().push(v);
        }

        let mut patterns = Vec::new();
        for (key, mut group) in by_key {
            group.sort_by_key(|v| v.detected_at);
            let mut start = 0usize;
            let mut best: Option<(usize, usize)> = None;
            for end in 0..group.len() {
                while group[end].detected_at - group[start].detected_at > window {
                    start += 1;
                }
                let len = end - start + 1;
                if len >= self.config.burst_min_violations
                    && best.map(|(s, e)| len > e - s + 1).unwrap_or(true)
                {
                    best = Some((start, end));
                }
            }
            if let Some((s, e)) = best {
                patterns.push(Pattern {
                    kind: PatternKind::TemporalBurst,
                    evidence: group[s..=e].iter().map(|v| v.id).collect(),
                    confidence: TEMPORAL_BURST_CONFIDENCE,
                    subject: key.to_string(),
                });
            }
        }
        patterns
    }

    /// >= N violations sharing a source component across distinct keys
    fn detect_spatial_clusters(&self, violations: &[Violation]) -> Vec<Pattern> {
        let mut by_component: HashMap<&str, Vec<&Violation>> = HashMap::new();
        for v in violations {
            by_component
                .entry(v.source_component.as_str())
                .or_default()
                .push(v);
        }

        let mut patterns = Vec::new();
        for (component, group) in by_component {
            let distinct_keys: std::collections::HashSet<&str> =
                group.iter().map(|v| v.correlation_key.as_str()).collect();
            if group.len() >= self.config.cluster_min_violations && distinct_keys.len() >= 2 {
                patterns.push(Pattern {
                    kind: PatternKind::SpatialCluster,
                    evidence: group.iter().map(|v| v.id).collect(),
                    confidence: SPATIAL_CLUSTER_CONFIDENCE,
                    subject: component.to_string(),
                });
            }
        }
        patterns
    }

    /// Rank correlation between whitelisted metric pairs within a bounded lag
    fn detect_causal_pairs(&self, output: &MonitorOutput) -> Vec<Pattern> {
        let mut patterns = Vec::new();
        for (left, right) in &self.config.causal_pairs {
            let Some(a) = output.observations.iter().find(|o| &o.metric == left) else {
                continue;
            };
            let Some(b) = output.observations.iter().find(|o| &o.metric == right) else {
                continue;
            };
            let series_a: Vec<f64> = a.samples.iter().map(|s| s.value).collect();
            let series_b: Vec<f64> = b.samples.iter().map(|s| s.value).collect();

            let mut best = 0.0f64;
            for lag in 0..=self.config.causal_max_lag {
                if series_a.len() <= lag || series_b.len() <= lag {
                    break;
                }
                let n = series_a.len().min(series_b.len()) - lag;
                if n < 3 {
                    break;
                }
                let rho = spearman(&series_a[..n], &series_b[lag..lag + n]);
                if rho.abs() > best.abs() {
                    best = rho;
                }
            }

            if best.abs() >= self.config.causal_correlation_threshold {
                let evidence: Vec<u64> = output
                    .violations
                    .iter()
                    .filter(|v| &v.metric_name == left || &v.metric_name == right)
                    .map(|v| v.id)
                    .collect();
                patterns.push(Pattern {
                    kind: PatternKind::CausalPair,
                    evidence,
                    confidence: CAUSAL_PAIR_CONFIDENCE,
                    subject: format!("{} -> {}", left, right),
                });
            }
        }
        patterns
    }

    /// Violation arrival rate above baseline + z * sigma
    fn detect_frequency_anomaly(&mut self, violations: &[Violation]) -> Vec<Pattern> {
        let rate = violations.len() as f64;
        let mut patterns = Vec::new();

        if self.rate_baseline.len() >= MIN_BASELINE_TICKS {
            let n = self.rate_baseline.len() as f64;
            let mean = self.rate_baseline.iter().sum::<f64>() / n;
            let var = self
                .rate_baseline
                .iter()
                .map(|r| (r - mean) * (r - mean))
                .sum::<f64>()
                / n;
            let sigma = var.sqrt();
            if rate > mean + self.config.frequency_z * sigma && rate > mean {
                patterns.push(Pattern {
                    kind: PatternKind::FrequencyAnomaly,
                    evidence: violations.iter().map(|v| v.id).collect(),
                    confidence: FREQUENCY_ANOMALY_CONFIDENCE,
                    subject: format!("rate {:.1} vs baseline {:.1}", rate, mean),
                });
            }
        }

        self.rate_baseline.push_back(rate);
        while self.rate_baseline.len() > self.config.baseline_window {
            self.rate_baseline.pop_front();
        }
        patterns
    }

    /// Each pattern yields at most one hypothesis; hypotheses sharing a
    /// cause merge with `1 - prod(1 - c_i)` capped at 0.95.
    fn build_hypotheses(
        &self,
        patterns: &[Pattern],
        by_id: &HashMap<u64, &Violation>,
    ) -> Vec<RootCauseHypothesis> {
        let mut merged: HashMap<CauseTag, (Vec<usize>, f64)> = HashMap::new();
        for (index, pattern) in patterns.iter().enumerate() {
            let cause = cause_for(pattern, by_id);
            let entry = merged.entry(cause).or_insert((Vec::new(), 1.0));
            entry.0.push(index);
            entry.1 *= 1.0 - pattern.confidence;
        }

        let mut hypotheses: Vec<RootCauseHypothesis> = merged
            .into_iter()
            .map(|(cause, (contributing, residual))| {
                let mut confidence = (1.0 - residual).min(MERGED_CONFIDENCE_CAP);
                let cause = if confidence.is_nan() {
                    confidence = 0.0;
                    CauseTag::Unknown
                } else {
                    cause
                };
                RootCauseHypothesis {
                    cause,
                    contributing_patterns: contributing,
                    confidence,
                    recommendations: recommendations_for(cause),
                }
            })
            .collect();

        hypotheses.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hypotheses
    }
}

fn cause_for(pattern: &Pattern, by_id: &HashMap<u64, &Violation>) -> CauseTag {
    let metric_class = |needles: &[&str]| {
        pattern.evidence.iter().any(|id| {
            by_id
                .get(id)
                .map(|v| needles.iter().any(|n| v.metric_name.contains(n)))
                .unwrap_or(false)
        })
    };

    match pattern.kind {
        PatternKind::TemporalBurst => {
            if metric_class(&["latency", "duration"]) {
                CauseTag::ValidationLatency
            } else if metric_class(&["cpu", "memory", "queue", "disk", "resource"]) {
                CauseTag::ResourceExhaustion
            } else {
                CauseTag::SystemInstability
            }
        }
        PatternKind::SpatialCluster => CauseTag::CascadingFailure,
        PatternKind::CausalPair => CauseTag::PolicyMisconfiguration,
        PatternKind::FrequencyAnomaly => CauseTag::SystemInstability,
    }
}

fn recommendations_for(cause: CauseTag) -> Vec<String> {
    let recs: &[&str] = match cause {
        CauseTag::ValidationLatency => {
            &["scale up validation workers", "raise concurrency limits"]
        }
        CauseTag::PolicyMisconfiguration => {
            &["re-apply a corrected policy", "audit recent policy changes"]
        }
        CauseTag::CascadingFailure => {
            &["engage emergency override", "throttle upstream traffic"]
        }
        CauseTag::ResourceExhaustion => &["scale up capacity", "rebalance load"],
        CauseTag::SystemInstability => {
            &["rebalance mesh partitions", "restart affected services"]
        }
        CauseTag::Unknown => &["escalate to operators"],
    };
    recs.iter().map(|s| s.to_string()).collect()
}

/// Spearman rank correlation: Pearson over tie-averaged ranks
fn spearman(a: &[f64], b: &[f64]) -> f64 {
    let ra = ranks(a);
    let rb = ranks(b);
    pearson(&ra, &rb)
}

fn ranks(values: &[f64]) -> Vec<f64> {
    let mut indexed: Vec<(usize, f64)> = values.iter().copied().enumerate().collect();
    indexed.sort_by(|x, y| x.1.partial_cmp(&y.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut out = vec![0.0; values.len()];
    let mut i = 0;
    while i < indexed.len() {
        let mut j = i;
        while j + 1 < indexed.len() && indexed[j + 1].1 == indexed[i].1 {
            j += 1;
        }
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for item in &indexed[i..=j] {
            out[item.0] = avg_rank;
        }
        i = j + 1;
    }
    out
}

fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len()) as f64;
    if n < 2.0 {
        return 0.0;
    }
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        cov += (x - mean_a) * (y - mean_b);
        var_a += (x - mean_a) * (x - mean_a);
        var_b += (y - mean_b) * (y - mean_b);
    }
    if var_a == 0.0 || var_b == 0.0 {
        return 0.0;
    }
    cov / (var_a.sqrt() * var_b.sqrt())
}
