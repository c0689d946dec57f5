//! Client sampling strategies for round fan-out

use crate::types::{ClientDescriptor, ClientId};
use meshguard_common::config::SamplingStrategy;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

/// Self-reported resource floor for resource-aware sampling
const MIN_CPU_AVAILABLE: f64 = 0.25;
const MIN_MEMORY_AVAILABLE_MB: u64 = 256;

/// Pick up to `count` clients from the eligible population under the
/// configured strategy. Clients with non-positive reputation are never
/// sampled.
pub fn sample_clients(
    strategy: SamplingStrategy,
    population: &[ClientDescriptor],
    count: usize,
) -> Vec<ClientId> {
    let eligible: Vec<&ClientDescriptor> =
        population.iter().filter(|c| c.eligible()).collect();
    if eligible.is_empty() || count == 0 {
        return Vec::new();
    }

    let selected = match strategy {
        SamplingStrategy::Uniform => uniform(&eligible, count),
        SamplingStrategy::ConvergenceWeighted => convergence_weighted(&eligible, count),
        SamplingStrategy::ResourceAware => resource_aware(&eligible, count),
    };
    debug!(
        strategy = ?strategy,
        eligible = eligible.len(),
        selected = selected.len(),
        "clients sampled"
    );
    selected
}

fn uniform(eligible: &[&ClientDescriptor], count: usize) -> Vec<ClientId> {
    let mut rng = rand::thread_rng();
    eligible
        .choose_multiple(&mut rng, count.min(eligible.len()))
        .map(|c| c.client_id.clone())
        .collect()
}

/// Weight by the recent loss-improvement signal: clients still learning
/// fast are proportionally more likely to be picked
fn convergence_weighted(eligible: &[&ClientDescriptor], count: usize) -> Vec<ClientId> {
    let mut rng = rand::thread_rng();
    let mut pool: Vec<(&ClientDescriptor, f64)> = eligible
        .iter()
        .map(|c| (*c, c.loss_improvement.max(1e-6)))
        .collect();

    let mut selected = Vec::new();
    while selected.len() < count && !pool.is_empty() {
        let total: f64 = pool.iter().map(|(_, w)| w).sum();
        let mut roll = rng.gen::<f64>() * total;
        let mut picked = pool.len() - 1;
        for (index, (_, weight)) in pool.iter().enumerate() {
            if roll < *weight {
                picked = index;
                break;
            }
            roll -= weight;
        }
        let (client, _) = pool.swap_remove(picked);
        selected.push(client.client_id.clone());
    }
    selected
}

/// Skip clients whose self-reports show insufficient compute or memory
fn resource_aware(eligible: &[&ClientDescriptor], count: usize) -> Vec<ClientId> {
    let capable: Vec<&ClientDescriptor> = eligible
        .iter()
        .filter(|c| {
            c.cpu_available >= MIN_CPU_AVAILABLE
                && c.memory_available_mb >= MIN_MEMORY_AVAILABLE_MB
        })
        .copied()
        .collect();
    uniform(&capable, count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(id: &str) -> ClientDescriptor {
        ClientDescriptor::new(id, vec![0; 32])
    }

    fn population(count: usize) -> Vec<ClientDescriptor> {
        (0..count).map(|i| client(&format!("node-{}", i))).collect()
    }

    #[test]
    fn uniform_sampling_respects_count_and_uniqueness() {
        let population = population(20);
        let selected = sample_clients(SamplingStrategy::Uniform, &population, 8);
        assert_eq!(selected.len(), 8);
        let mut unique = selected.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 8);
    }

    #[test]
    fn sampling_never_exceeds_the_population() {
        let population = population(3);
        let selected = sample_clients(SamplingStrategy::Uniform, &population, 10);
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn zero_reputation_clients_are_excluded() {
        let mut population = population(5);
        for c in population.iter_mut().take(4) {
            c.reputation = 0.0;
        }
        let selected = sample_clients(SamplingStrategy::Uniform, &population, 5);
        assert_eq!(selected, vec!["node-4".to_string()]);
    }

    #[test]
    fn convergence_weighting_prefers_fast_learners() {
        let mut population = population(10);
        population[0].loss_improvement = 100.0;
        for c in population.iter_mut().skip(1) {
            c.loss_improvement = 0.001;
        }

        let mut hits = 0;
        for _ in 0..50 {
            let selected =
                sample_clients(SamplingStrategy::ConvergenceWeighted, &population, 1);
            if selected[0] == "node-0" {
                hits += 1;
            }
        }
        assert!(hits > 40, "fast learner picked only {}/50 times", hits);
    }

    #[test]
    fn resource_aware_skips_starved_clients() {
        let mut population = population(6);
        for c in population.iter_mut().take(3) {
            c.cpu_available = 0.05;
        }
        population[3].memory_available_mb = 64;

        let selected = sample_clients(SamplingStrategy::ResourceAware, &population, 6);
        assert_eq!(selected.len(), 2);
        assert!(selected.contains(&"node-4".to_string()));
        assert!(selected.contains(&"node-5".to_string()));
    }
}
