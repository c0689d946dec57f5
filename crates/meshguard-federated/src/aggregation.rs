//! Byzantine-robust aggregation rules
//!
//! All rules operate on already-decompressed dense gradients. Updates with
//! non-finite coordinates never reach this module; the collection path
//! discards them as integrity failures.

use meshguard_common::config::{AggregationMode, OutlierEstimator};
use meshguard_common::{Error, Result};
use tracing::debug;

/// Parameters driving the robust rules
#[derive(Debug, Clone)]
pub struct AggregationParams {
    /// Byzantine tolerance `f` for the krum variants
    pub byzantine_f: usize,
    /// Number of selections averaged by multi-krum
    pub multi_krum_m: usize,
    /// Ceiling on the trimmed-mean trim fraction
    pub trim_beta: f64,
    pub outlier_estimator: OutlierEstimator,
}

/// Aggregate a set of updates under the configured mode
pub fn aggregate(
    mode: AggregationMode,
    updates: &[Vec<f64>],
    params: &AggregationParams,
) -> Result<Vec<f64>> {
    if updates.is_empty() {
        return Err(Error::Integrity("no updates to aggregate".into()));
    }
    let dimension = updates[0].len();
    if updates.iter().any(|u| u.len() != dimension) {
        return Err(Error::Integrity("updates disagree on dimension".into()));
    }

    let aggregate = match mode {
        AggregationMode::Krum => {
            let chosen = krum_select(updates, params.byzantine_f)?;
            updates[chosen].clone()
        }
        AggregationMode::MultiKrum => {
            let chosen = multi_krum_select(updates, params.byzantine_f, params.multi_krum_m)?;
            mean_of(updates, &chosen)
        }
        AggregationMode::TrimmedMean => {
            let beta = adaptive_beta(updates, params);
            trimmed_mean(updates, beta)
        }
        AggregationMode::Median => coordinate_median(updates),
    };

    if aggregate.iter().any(|v| !v.is_finite()) {
        return Err(Error::Integrity(
            "aggregation produced non-finite coordinates".into(),
        ));
    }
    Ok(aggregate)
}

/// Single-krum selection: the update whose summed distance to its
/// `n - f - 2` nearest neighbours is smallest
pub fn krum_select(updates: &[Vec<f64>], f: usize) -> Result<usize> {
    let scores = krum_scores(updates, f)?;
    Ok(scores
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .expect("scores are non-empty"))
}

/// Multi-krum selection: the `m` best-scoring updates
pub fn multi_krum_select(updates: &[Vec<f64>], f: usize, m: usize) -> Result<Vec<usize>> {
    let scores = krum_scores(updates, f)?;
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
        scores[a]
            .partial_cmp(&scores[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order.truncate(m.clamp(1, scores.len()));
    Ok(order)
}

fn krum_scores(updates: &[Vec<f64>], f: usize) -> Result<Vec<f64>> {
    let n = updates.len();
    if n < 3 {
        return Err(Error::Configuration(format!(
            "krum needs at least 3 updates, got {}",
            n
        )));
    }
    // Classical bound: f <= floor((n - 3) / 2)
    if f > (n - 3) / 2 {
        return Err(Error::Configuration(format!(
            "byzantine f {} violates the krum bound for n {}",
            f, n
        )));
    }

    let mut distances = vec![vec![0.0f64; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let d = squared_l2(&updates[i], &updates[j]);
            distances[i][j] = d;
            distances[j][i] = d;
        }
    }

    let neighbours = n - f - 2;
    let scores = (0..n)
        .map(|i| {
            let mut others: Vec<f64> = (0..n).filter(|&j| j != i).map(|j| distances[i][j]).collect();
            others.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            others.iter().take(neighbours).sum()
        })
        .collect();
    Ok(scores)
}

/// Coordinate-wise trimmed mean with the given trim fraction per side
pub fn trimmed_mean(updates: &[Vec<f64>], beta: f64) -> Vec<f64> {
    let n = updates.len();
    let dimension = updates[0].len();
    let trim = ((n as f64) * beta).floor() as usize;
    let trim = trim.min((n - 1) / 2);

    let mut out = Vec::with_capacity(dimension);
    let mut column = vec![0.0f64; n];
    for c in 0..dimension {
        for (r, update) in updates.iter().enumerate() {
            column[r] = update[c];
        }
        column.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let kept = &column[trim..n - trim];
        out.push(kept.iter().sum::<f64>() / kept.len() as f64);
    }
    out
}

/// Coordinate-wise median, the fallback rule
pub fn coordinate_median(updates: &[Vec<f64>]) -> Vec<f64> {
    let n = updates.len();
    let dimension = updates[0].len();
    let mut out = Vec::with_capacity(dimension);
    let mut column = vec![0.0f64; n];
    for c in 0..dimension {
        for (r, update) in updates.iter().enumerate() {
            column[r] = update[c];
        }
        column.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mid = n / 2;
        out.push(if n % 2 == 1 {
            column[mid]
        } else {
            (column[mid - 1] + column[mid]) / 2.0
        });
    }
    out
}

/// Pick the effective trim fraction from an outlier-fraction estimate over
/// the update norms, capped at the configured beta
fn adaptive_beta(updates: &[Vec<f64>], params: &AggregationParams) -> f64 {
    let norms: Vec<f64> = updates.iter().map(|u| squared_l2(u, &[]).sqrt()).collect();
    let fraction = estimate_outlier_fraction(&norms, params.outlier_estimator);
    let beta = fraction.min(params.trim_beta);
    debug!(fraction, beta, "adaptive trim selected");
    beta
}

fn estimate_outlier_fraction(norms: &[f64], estimator: OutlierEstimator) -> f64 {
    let n = norms.len();
    if n < 4 {
        return 0.0;
    }
    let mut sorted = norms.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let outliers = match estimator {
        OutlierEstimator::Iqr => {
            let q1 = sorted[n / 4];
            let q3 = sorted[(3 * n) / 4];
            let iqr = q3 - q1;
            let (lo, hi) = (q1 - 1.5 * iqr, q3 + 1.5 * iqr);
            norms.iter().filter(|&&v| v < lo || v > hi).count()
        }
        OutlierEstimator::ZScore => {
            let mean = norms.iter().sum::<f64>() / n as f64;
            let var = norms.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n as f64;
            let sigma = var.sqrt();
            if sigma == 0.0 {
                0
            } else {
                norms
                    .iter()
                    .filter(|&&v| ((v - mean) / sigma).abs() > 3.0)
                    .count()
            }
        }
        OutlierEstimator::Mad => {
            let median = sorted[n / 2];
            let mut deviations: Vec<f64> = norms.iter().map(|v| (v - median).abs()).collect();
            deviations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let mad = deviations[n / 2] * 1.4826;
            if mad == 0.0 {
                0
            } else {
                norms
                    .iter()
                    .filter(|&&v| (v - median).abs() > 3.0 * mad)
                    .count()
            }
        }
    };
    outliers as f64 / n as f64
}

fn mean_of(updates: &[Vec<f64>], chosen: &[usize]) -> Vec<f64> {
    let dimension = updates[0].len();
    let mut out = vec![0.0; dimension];
    for &index in chosen {
        for (c, v) in updates[index].iter().enumerate() {
            out[c] += v;
        }
    }
    for v in &mut out {
        *v /= chosen.len() as f64;
    }
    out
}

fn squared_l2(a: &[f64], b: &[f64]) -> f64 {
    if b.is_empty() {
        return a.iter().map(|v| v * v).sum();
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Honest updates cluster near `center`; each gets a small
    /// deterministic perturbation
    fn honest_cluster(count: usize, dimension: usize, center: f64) -> Vec<Vec<f64>> {
        (0..count)
            .map(|i| {
                (0..dimension)
                    .map(|c| center + 0.01 * (((i * dimension + c) % 13) as f64 - 6.0))
                    .collect()
            })
            .collect()
    }

    fn adversarial(count: usize, dimension: usize) -> Vec<Vec<f64>> {
        (0..count)
            .map(|i| vec![100.0 * (i as f64 + 1.0); dimension])
            .collect()
    }

    fn params() -> AggregationParams {
        AggregationParams {
            byzantine_f: 3,
            multi_krum_m: 5,
            trim_beta: 0.3,
            outlier_estimator: OutlierEstimator::Iqr,
        }
    }

    #[test]
    fn krum_picks_from_the_honest_cluster() {
        let mut updates = honest_cluster(7, 8, 1.0);
        updates.extend(adversarial(3, 8));

        let chosen = krum_select(&updates, 3).unwrap();
        assert!(chosen < 7, "krum chose adversarial update {}", chosen);
    }

    #[test]
    fn multi_krum_excludes_all_adversaries() {
        // n = 10, f = 3, m = 5: three arbitrary-large vectors never make
        // the selection, and the aggregate is the mean of five honest ones
        let mut updates = honest_cluster(7, 8, 1.0);
        updates.extend(adversarial(3, 8));

        let chosen = multi_krum_select(&updates, 3, 5).unwrap();
        assert_eq!(chosen.len(), 5);
        assert!(chosen.iter().all(|&i| i < 7));

        let aggregate = aggregate(AggregationMode::MultiKrum, &updates, &params()).unwrap();
        for v in &aggregate {
            assert!((v - 1.0).abs() < 0.1, "aggregate {} far from honest center", v);
        }
    }

    #[test]
    fn krum_bound_is_enforced() {
        let updates = honest_cluster(6, 4, 0.0);
        // floor((6 - 3) / 2) = 1, so f = 2 must be rejected
        assert!(krum_select(&updates, 2).is_err());
        assert!(krum_select(&updates, 1).is_ok());
    }

    #[test]
    fn krum_needs_three_updates() {
        let updates = honest_cluster(2, 4, 0.0);
        assert!(krum_select(&updates, 0).is_err());
    }

    #[test]
    fn trimmed_mean_sheds_extremes() {
        let mut updates = honest_cluster(8, 4, 2.0);
        updates.push(vec![1000.0; 4]);
        updates.push(vec![-1000.0; 4]);

        let result = aggregate(AggregationMode::TrimmedMean, &updates, &params()).unwrap();
        for v in &result {
            assert!((v - 2.0).abs() < 0.2);
        }
    }

    #[test]
    fn plain_cluster_trims_nothing() {
        let updates = honest_cluster(8, 4, 2.0);
        let beta = adaptive_beta(&updates, &params());
        assert_eq!(beta, 0.0);
    }

    #[test]
    fn median_is_robust_to_a_minority() {
        let mut updates = honest_cluster(6, 4, 3.0);
        updates.push(vec![f64::MAX / 1e10; 4]);

        let result = aggregate(AggregationMode::Median, &updates, &params()).unwrap();
        for v in &result {
            assert!((v - 3.0).abs() < 0.1);
        }
    }

    #[test]
    fn median_of_even_count_averages_the_middle() {
        let updates = vec![vec![1.0], vec![2.0], vec![3.0], vec![4.0]];
        let result = coordinate_median(&updates);
        assert!((result[0] - 2.5).abs() < 1e-12);
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let updates = vec![vec![1.0, 2.0], vec![1.0]];
        assert!(aggregate(AggregationMode::Median, &updates, &params()).is_err());
    }

    #[test]
    fn outlier_estimators_flag_the_planted_outlier() {
        let mut norms: Vec<f64> = (0..19).map(|i| 1.0 + 0.01 * i as f64).collect();
        norms.push(500.0);
        for estimator in [
            OutlierEstimator::Iqr,
            OutlierEstimator::ZScore,
            OutlierEstimator::Mad,
        ] {
            let fraction = estimate_outlier_fraction(&norms, estimator);
            assert!(
                fraction >= 0.049,
                "{:?} missed the outlier: {}",
                estimator,
                fraction
            );
        }
    }
}
