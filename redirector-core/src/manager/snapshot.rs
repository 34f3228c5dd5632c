//! Provider snapshots and the lock-free table that publishes them.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rand::seq::SliceRandom;

use crate::domain::host::StackSeed;
use crate::domain::stack::{FlavorKey, StackPath};
use crate::provider::{AggregateProvider, InstanceProvider};

/// Stack providers and the flavor aggregates derived from them.
///
/// Both maps are built together and published together, so a reader never
/// sees a stack in one map that the other does not account for.
#[derive(Default)]
pub struct ProviderSnapshot {
    stacks: HashMap<StackPath, Arc<InstanceProvider>>,
    flavors: HashMap<FlavorKey, Arc<AggregateProvider>>,
}

impl ProviderSnapshot {
    /// A snapshot with no providers.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Group `providers` by `(flavor, app)`, shuffling each group.
    pub fn build(providers: impl IntoIterator<Item = Arc<InstanceProvider>>) -> Self {
        let mut stacks = HashMap::new();
        let mut groups: HashMap<FlavorKey, Vec<Arc<InstanceProvider>>> = HashMap::new();

        for provider in providers {
            let stack = provider.stack().clone();
            groups
                .entry(stack.flavor_key())
                .or_default()
                .push(Arc::clone(&provider));
            stacks.insert(stack, provider);
        }

        let mut rng = rand::thread_rng();
        let flavors = groups
            .into_iter()
            .map(|(key, mut members)| {
                // No fixed provider should always be probed first.
                members.shuffle(&mut rng);
                let aggregate = AggregateProvider::new(key.clone(), members);
                (key, Arc::new(aggregate))
            })
            .collect();

        Self { stacks, flavors }
    }

    /// Build fixed providers from seeds.
    pub fn from_seeds(seeds: impl IntoIterator<Item = StackSeed>) -> Self {
        Self::build(
            seeds
                .into_iter()
                .map(|seed| Arc::new(InstanceProvider::fixed(seed.path, seed.hosts))),
        )
    }

    /// Provider bound to `stack`.
    pub fn provider_for_stack(&self, stack: &StackPath) -> Option<Arc<InstanceProvider>> {
        self.stacks.get(stack).cloned()
    }

    /// Aggregate serving `(flavor, app)`.
    pub fn provider_for_flavor(&self, flavor: &str, app: &str) -> Option<Arc<AggregateProvider>> {
        self.flavors.get(&FlavorKey::new(flavor, app)).cloned()
    }

    /// Every stack provider.
    pub fn providers(&self) -> Vec<Arc<InstanceProvider>> {
        self.stacks.values().cloned().collect()
    }

    /// Stack providers keyed by path.
    pub fn stacks(&self) -> &HashMap<StackPath, Arc<InstanceProvider>> {
        &self.stacks
    }

    /// Aggregates keyed by `(flavor, app)`.
    pub fn flavors(&self) -> &HashMap<FlavorKey, Arc<AggregateProvider>> {
        &self.flavors
    }

    /// Whether the snapshot holds no providers.
    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }
}

/// A lock-free table holding the current [`ProviderSnapshot`].
///
/// Readers load the snapshot without locking; writers replace it wholesale.
pub struct ProviderTable {
    current: ArcSwap<ProviderSnapshot>,
}

impl ProviderTable {
    /// Create a table holding `initial`.
    pub fn new(initial: ProviderSnapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    /// Atomically replace the snapshot.
    pub fn publish(&self, next: Arc<ProviderSnapshot>) {
        self.current.store(next);
    }

    /// The snapshot readers currently see.
    pub fn load(&self) -> Arc<ProviderSnapshot> {
        self.current.load_full()
    }
}

impl Default for ProviderTable {
    fn default() -> Self {
        Self::new(ProviderSnapshot::empty())
    }
}
