//! Stratified, seed-driven task sampling.
//!
//! The sampler turns the loaded task list and a [`DistributionSpec`] into the
//! ordered work queue the scheduler dispatches. It is a pure computation: the
//! RNG is created from the seed on every call, so identical inputs always
//! produce identical plans.
//!
//! # Algorithm
//!
//! 1. Stratify tasks by bucket and shuffle each stratum with the seeded RNG.
//! 2. Apportion the requested total across weighted buckets with the
//!    largest-remainder method (ties go to the lexically smaller bucket).
//! 3. Cap each target at the stratum size and report shortfalls. Slots left
//!    over by exhausted strata are handed out one at a time by a
//!    weight-proportional random draw among strata that still have tasks.
//! 4. Interleave strata with smooth weighted round-robin over the final
//!    target counts, so every prefix of the queue tracks the target mix.
//!
//! Without a limit every task is kept exactly once and the targets are the
//! stratum sizes.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::{RngExt, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::distribution::DistributionSpec;
use super::task::Task;
use crate::error::ConfigError;

/// A task together with the bucket it was sampled from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampledTask {
    pub task: Task,
    pub bucket: String,
}

/// A bucket whose weight asked for more tasks than the dataset holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shortfall {
    pub category: String,
    pub requested: usize,
    pub available: usize,
}

/// Output of the sampler: the ordered queue plus accounting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplePlan {
    pub tasks: Vec<SampledTask>,
    pub shortfalls: Vec<Shortfall>,
    /// Realized count per bucket.
    pub counts: BTreeMap<String, usize>,
}

impl SamplePlan {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Stratified sampler over a category distribution.
#[derive(Debug, Clone)]
pub struct TaskSampler<'a> {
    distribution: &'a DistributionSpec,
    seed: u64,
    limit: Option<usize>,
}

impl<'a> TaskSampler<'a> {
    /// Creates a sampler with seed 0 and no subset limit.
    pub fn new(distribution: &'a DistributionSpec) -> Self {
        Self {
            distribution,
            seed: 0,
            limit: None,
        }
    }

    /// Sets the seed used for shuffling and fallback draws.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Restricts the plan to at most `limit` tasks.
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Builds the ordered work queue.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnweightedCategory` when a task's category has
    /// no weight and the distribution has no fallback bucket.
    pub fn sample(&self, tasks: &[Task]) -> Result<SamplePlan, ConfigError> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);

        let mut strata: BTreeMap<String, Vec<Task>> = BTreeMap::new();
        for task in tasks {
            let bucket = self.distribution.bucket_for(task)?;
            strata.entry(bucket).or_default().push(task.clone());
        }
        for stratum in strata.values_mut() {
            stratum.shuffle(&mut rng);
        }

        let total = match self.limit {
            Some(limit) => limit.min(tasks.len()),
            None => tasks.len(),
        };

        let mut weights: BTreeMap<String, f64> = self
            .distribution
            .buckets()
            .into_iter()
            .map(|b| {
                let w = self.distribution.weight(&b);
                (b, w)
            })
            .collect();
        for bucket in strata.keys() {
            weights
                .entry(bucket.clone())
                .or_insert_with(|| self.distribution.weight(bucket));
        }

        let requested = apportion(total, &weights);
        let available: BTreeMap<&str, usize> =
            strata.iter().map(|(b, s)| (b.as_str(), s.len())).collect();

        let shortfalls: Vec<Shortfall> = requested
            .iter()
            .filter_map(|(bucket, &req)| {
                let avail = available.get(bucket.as_str()).copied().unwrap_or(0);
                (req > avail).then(|| Shortfall {
                    category: bucket.clone(),
                    requested: req,
                    available: avail,
                })
            })
            .collect();

        for shortfall in &shortfalls {
            tracing::warn!(
                category = %shortfall.category,
                requested = shortfall.requested,
                available = shortfall.available,
                "Category shortfall"
            );
        }

        let targets: BTreeMap<String, usize> = if self.limit.is_none() {
            strata.iter().map(|(b, s)| (b.clone(), s.len())).collect()
        } else {
            let mut targets: BTreeMap<String, usize> = strata
                .iter()
                .map(|(b, s)| {
                    let req = requested.get(b).copied().unwrap_or(0);
                    (b.clone(), req.min(s.len()))
                })
                .collect();
            fill_deficit(&mut targets, &available, &weights, total, &mut rng);
            targets
        };

        let order = interleave(&targets);
        let mut cursors: BTreeMap<&str, std::vec::IntoIter<Task>> = strata
            .iter()
            .map(|(b, s)| (b.as_str(), s.clone().into_iter()))
            .collect();

        let mut plan = SamplePlan {
            shortfalls,
            ..Default::default()
        };
        for bucket in order {
            if let Some(task) = cursors.get_mut(bucket.as_str()).and_then(Iterator::next) {
                *plan.counts.entry(bucket.clone()).or_insert(0) += 1;
                plan.tasks.push(SampledTask { task, bucket });
            }
        }

        tracing::info!(
            input = tasks.len(),
            sampled = plan.tasks.len(),
            seed = self.seed,
            shortfalls = plan.shortfalls.len(),
            "Sampled task queue"
        );

        Ok(plan)
    }
}

/// Largest-remainder apportionment of `total` slots across positive weights.
///
/// Zero-weight buckets receive nothing. Fractional remainders are handed out
/// in descending order, ties broken by bucket name.
pub fn apportion(total: usize, weights: &BTreeMap<String, f64>) -> BTreeMap<String, usize> {
    let sum: f64 = weights.values().filter(|w| **w > 0.0).sum();
    let mut counts: BTreeMap<String, usize> = weights.keys().map(|b| (b.clone(), 0)).collect();
    if sum <= 0.0 || total == 0 {
        return counts;
    }

    let mut remainders: Vec<(String, f64)> = Vec::new();
    let mut assigned = 0usize;
    for (bucket, &weight) in weights {
        if weight <= 0.0 {
            continue;
        }
        let quota = total as f64 * weight / sum;
        let floor = quota.floor() as usize;
        counts.insert(bucket.clone(), floor);
        assigned += floor;
        remainders.push((bucket.clone(), quota - floor as f64));
    }

    remainders.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    for (bucket, _) in remainders.into_iter().take(total.saturating_sub(assigned)) {
        if let Some(count) = counts.get_mut(&bucket) {
            *count += 1;
        }
    }
    counts
}

/// Hands out slots left unfilled by exhausted strata.
fn fill_deficit(
    targets: &mut BTreeMap<String, usize>,
    available: &BTreeMap<&str, usize>,
    weights: &BTreeMap<String, f64>,
    total: usize,
    rng: &mut ChaCha8Rng,
) {
    let mut deficit = total.saturating_sub(targets.values().sum());
    while deficit > 0 {
        let open: Vec<(String, f64)> = targets
            .iter()
            .filter_map(|(bucket, &target)| {
                let cap = available.get(bucket.as_str()).copied().unwrap_or(0);
                let weight = weights.get(bucket).copied().unwrap_or(0.0);
                (target < cap && weight > 0.0).then(|| (bucket.clone(), weight))
            })
            .collect();

        let sum: f64 = open.iter().map(|(_, w)| w).sum();
        if open.is_empty() || sum <= 0.0 {
            break;
        }

        let roll = rng.random::<f64>() * sum;
        let mut cumulative = 0.0;
        let mut chosen = &open[open.len() - 1].0;
        for (bucket, weight) in &open {
            cumulative += weight;
            if roll < cumulative {
                chosen = bucket;
                break;
            }
        }

        if let Some(target) = targets.get_mut(chosen) {
            *target += 1;
        }
        deficit -= 1;
    }
}

/// Smooth weighted round-robin over target counts.
///
/// Over `sum(targets)` steps each bucket is emitted exactly its target
/// number of times, spread as evenly as the counts allow.
fn interleave(targets: &BTreeMap<String, usize>) -> Vec<String> {
    let total: usize = targets.values().sum();
    let mut remaining: BTreeMap<&str, usize> =
        targets.iter().map(|(b, &t)| (b.as_str(), t)).collect();
    let mut credit: BTreeMap<&str, i64> = targets.keys().map(|b| (b.as_str(), 0)).collect();
    let mut order = Vec::with_capacity(total);

    for _ in 0..total {
        let mut best: Option<&str> = None;
        for (bucket, &target) in targets {
            if target == 0 {
                continue;
            }
            let c = credit.entry(bucket.as_str()).or_insert(0);
            *c += target as i64;
        }
        for (&bucket, &left) in &remaining {
            if left == 0 {
                continue;
            }
            best = match best {
                Some(b) if credit[b] >= credit[bucket] => Some(b),
                _ => Some(bucket),
            };
        }
        let Some(pick) = best else { break };
        if let Some(c) = credit.get_mut(pick) {
            *c -= total as i64;
        }
        if let Some(left) = remaining.get_mut(pick) {
            *left -= 1;
        }
        order.push(pick.to_string());
    }
    order
}
