//! Service provider managers.
//!
//! A static manager is built once from explicit seeds. A dynamic manager
//! follows the topology cache, rebuilding its [`ProviderSnapshot`] whenever
//! the set of stacks changes, and can start out from a backup seed while the
//! coordination store is unreachable.

pub mod snapshot;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::RedirectorConfig;
use crate::domain::host::StackSeed;
use crate::domain::stack::StackPath;
use crate::error::Result;
use crate::provider::{AggregateProvider, InstanceProvider};
use crate::topology::{StackDiff, TopologyCache};

pub use snapshot::{ProviderSnapshot, ProviderTable};

/// Supplies the last known topology for disconnected operation.
pub trait BackupSource: Send + Sync {
    /// The persisted seeds, or `None` when no backup exists.
    fn load(&self) -> Result<Option<Vec<StackSeed>>>;
}

impl BackupSource for Vec<StackSeed> {
    fn load(&self) -> Result<Option<Vec<StackSeed>>> {
        Ok((!self.is_empty()).then(|| self.clone()))
    }
}

/// Where the manager's providers currently come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderMode {
    /// Fixed seeds, never refreshed.
    Static,
    /// Dynamic manager that has not published anything yet.
    Pending,
    /// Dynamic manager serving a backup seed.
    Backup,
    /// Dynamic manager following the live topology. Never left once entered.
    Live,
}

struct RebuildState {
    mode: ProviderMode,
    /// Live stacks seen at the last successful rebuild.
    last_seen: HashSet<StackPath>,
}

struct Discovery {
    cache: Arc<TopologyCache>,
    backup: Option<Arc<dyn BackupSource>>,
    excluded_apps: HashSet<String>,
    poll_interval: Duration,
}

enum ManagerKind {
    Static,
    Dynamic(Discovery),
}

/// Owns the stack-to-provider and flavor-to-aggregate mappings.
pub struct ServiceProviderManager {
    kind: ManagerKind,
    table: ProviderTable,
    backup_table: ProviderTable,
    /// Serializes rebuilds and guards the one-way mode transition.
    state: Mutex<RebuildState>,
}

impl ServiceProviderManager {
    /// A static manager over `seeds`.
    ///
    /// Backup lookups against a static manager see the same providers.
    pub fn fixed(seeds: Vec<StackSeed>) -> Arc<Self> {
        let snapshot = Arc::new(ProviderSnapshot::from_seeds(seeds));
        let table = ProviderTable::default();
        let backup_table = ProviderTable::default();
        table.publish(Arc::clone(&snapshot));
        backup_table.publish(snapshot);

        Arc::new(Self {
            kind: ManagerKind::Static,
            table,
            backup_table,
            state: Mutex::new(RebuildState {
                mode: ProviderMode::Static,
                last_seen: HashSet::new(),
            }),
        })
    }

    /// A dynamic manager following `cache`.
    pub fn dynamic(
        cache: Arc<TopologyCache>,
        config: &RedirectorConfig,
        backup: Option<Arc<dyn BackupSource>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind: ManagerKind::Dynamic(Discovery {
                cache,
                backup,
                excluded_apps: config.excluded_apps.clone(),
                poll_interval: config.poll_interval(),
            }),
            table: ProviderTable::default(),
            backup_table: ProviderTable::default(),
            state: Mutex::new(RebuildState {
                mode: ProviderMode::Pending,
                last_seen: HashSet::new(),
            }),
        })
    }

    /// Current provider source.
    pub fn mode(&self) -> ProviderMode {
        self.state.lock().mode
    }

    /// The published snapshot.
    pub fn snapshot(&self) -> Arc<ProviderSnapshot> {
        self.table.load()
    }

    /// The backup snapshot, empty when no backup was ever loaded.
    pub fn backup_snapshot(&self) -> Arc<ProviderSnapshot> {
        self.backup_table.load()
    }

    /// Every stack provider in the published snapshot.
    pub fn all_providers(&self) -> Vec<Arc<InstanceProvider>> {
        self.table.load().providers()
    }

    /// Provider bound to `stack`.
    pub fn provider_for_stack(&self, stack: &StackPath) -> Option<Arc<InstanceProvider>> {
        self.table.load().provider_for_stack(stack)
    }

    /// Aggregate serving `(flavor, app)`.
    pub fn provider_for_flavor(&self, flavor: &str, app: &str) -> Option<Arc<AggregateProvider>> {
        self.table.load().provider_for_flavor(flavor, app)
    }

    /// Backup provider bound to `stack`.
    pub fn backup_provider_for_stack(&self, stack: &StackPath) -> Option<Arc<InstanceProvider>> {
        self.backup_table.load().provider_for_stack(stack)
    }

    /// Backup aggregate serving `(flavor, app)`.
    pub fn backup_provider_for_flavor(
        &self,
        flavor: &str,
        app: &str,
    ) -> Option<Arc<AggregateProvider>> {
        self.backup_table.load().provider_for_flavor(flavor, app)
    }

    /// Run one discovery tick. A no-op for static managers.
    pub fn refresh(&self) -> Result<()> {
        match &self.kind {
            ManagerKind::Static => Ok(()),
            ManagerKind::Dynamic(discovery) => self.rebuild(discovery),
        }
    }

    /// Spawn the periodic poller. Returns `None` for static managers.
    ///
    /// Besides the fixed interval, a tick runs as soon as the topology cache
    /// reports a stack change.
    pub fn spawn_poller(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let ManagerKind::Dynamic(discovery) = &self.kind else {
            return None;
        };
        let period = discovery.poll_interval;
        let mut changes = discovery.cache.subscribe();
        let manager = Arc::clone(self);

        Some(tokio::spawn(async move {
            let mut interval = time::interval(period);
            let mut events_open = true;

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    change = changes.recv(), if events_open => match change {
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => events_open = false,
                    },
                }

                if let Err(e) = manager.refresh() {
                    warn!(error = %e, "provider poll tick failed, keeping previous snapshot");
                }
            }
        }))
    }

    fn load_backup(&self, discovery: &Discovery) -> Result<Option<Arc<ProviderSnapshot>>> {
        let Some(source) = &discovery.backup else {
            return Ok(None);
        };
        let Some(seeds) = source.load()? else {
            return Ok(None);
        };

        let seeds: Vec<StackSeed> = seeds
            .into_iter()
            .filter(|seed| !discovery.excluded_apps.contains(seed.path.app()))
            .collect();
        if seeds.is_empty() {
            return Ok(None);
        }

        let snapshot = Arc::new(ProviderSnapshot::from_seeds(seeds));
        self.backup_table.publish(Arc::clone(&snapshot));
        Ok(Some(snapshot))
    }

    fn rebuild(&self, discovery: &Discovery) -> Result<()> {
        let mut state = self.state.lock();

        let seeding = state.mode != ProviderMode::Live
            && self.table.load().is_empty()
            && !discovery.cache.is_available();
        if seeding {
            if let Some(snapshot) = self.load_backup(discovery)? {
                info!(stacks = snapshot.stacks().len(), "serving providers from backup");
                self.table.publish(snapshot);
                state.mode = ProviderMode::Backup;
                return Ok(());
            }
        }

        let live: HashSet<StackPath> = discovery
            .cache
            .current_stacks()
            .into_iter()
            .filter(|stack| !discovery.excluded_apps.contains(stack.app()))
            .collect();
        let diff = StackDiff::between(&state.last_seen, &live);
        if diff.is_empty() {
            debug!("no topology change");
            return Ok(());
        }

        // last_seen is only filled in live mode, so outside it `added` is
        // every live stack.
        let mode = state.mode;
        let mut providers: HashMap<StackPath, Arc<InstanceProvider>> = match mode {
            ProviderMode::Live => self.table.load().stacks().clone(),
            previous => {
                if previous == ProviderMode::Backup {
                    info!("topology reachable, discarding backup providers");
                }
                state.mode = ProviderMode::Live;
                HashMap::new()
            }
        };

        for stack in &diff.removed {
            if let Some(provider) = providers.remove(stack) {
                if let Err(e) = provider.close() {
                    warn!(stack = %stack, error = %e, "failed to close provider");
                }
            }
        }
        for stack in &diff.added {
            providers.entry(stack.clone()).or_insert_with(|| {
                Arc::new(InstanceProvider::from_topology(
                    stack.clone(),
                    Arc::clone(&discovery.cache),
                ))
            });
        }

        let next = ProviderSnapshot::build(providers.into_values());
        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            stacks = next.stacks().len(),
            flavors = next.flavors().len(),
            "provider snapshot rebuilt"
        );
        self.table.publish(Arc::new(next));
        state.last_seen = live;
        Ok(())
    }
}
