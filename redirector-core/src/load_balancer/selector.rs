//! Instance selection strategies.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::domain::route::ServiceInstance;

/// How one instance is picked out of a candidate pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Cycle through candidates in order.
    #[default]
    RoundRobin,
    /// Uniformly random candidate.
    Random,
    /// Random candidate, proportional to host weight.
    WeightedRandom,
}

/// Applies a [`SelectionStrategy`].
///
/// Round-robin cursors are kept per pool, keyed by the server path that
/// produced the candidates. They live here rather than in the providers so
/// they survive provider snapshot swaps.
#[derive(Debug)]
pub struct Selector {
    strategy: SelectionStrategy,
    cursors: DashMap<String, AtomicUsize>,
}

impl Selector {
    /// Create a selector for `strategy`.
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self {
            strategy,
            cursors: DashMap::new(),
        }
    }

    /// The configured strategy.
    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Pick one candidate out of `pool`. `None` when there is nothing to pick.
    pub fn pick<'a>(&self, pool: &str, candidates: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        if candidates.is_empty() {
            return None;
        }

        match self.strategy {
            SelectionStrategy::RoundRobin => {
                candidates.get(self.advance(pool) % candidates.len())
            }
            SelectionStrategy::Random => {
                let index = rand::thread_rng().gen_range(0..candidates.len());
                candidates.get(index)
            }
            SelectionStrategy::WeightedRandom => {
                let total: u64 = candidates.iter().map(|c| u64::from(c.host.weight)).sum();
                if total == 0 {
                    return None;
                }
                let mut roll = rand::thread_rng().gen_range(0..total);
                candidates.iter().find(|c| {
                    let weight = u64::from(c.host.weight);
                    if roll < weight {
                        true
                    } else {
                        roll -= weight;
                        false
                    }
                })
            }
        }
    }

    fn advance(&self, pool: &str) -> usize {
        if let Some(cursor) = self.cursors.get(pool) {
            return cursor.fetch_add(1, Ordering::Relaxed);
        }
        self.cursors
            .entry(pool.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }
}
