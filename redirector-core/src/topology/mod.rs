//! Topology cache.
//!
//! Mirrors the `{base}/{dc}/{region}/{zone}/{app}/{host}` subtree of the
//! coordination store into an immutable [`StackInventory`] that is replaced
//! wholesale on every refresh. Raw store events arrive on one internal channel;
//! coalesced stack diffs are republished to subscribers.

pub mod diff;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RedirectorConfig;
use crate::domain::host::{HostInstance, StackSeed};
use crate::domain::stack::StackPath;
use crate::error::{RedirectorError, Result, StoreError};
use crate::store::{join_path, ConnectionState, CoordinationStore, StoreEvent};

pub use diff::StackDiff;

/// Immutable mirror of every stack and its hosts.
#[derive(Debug, Clone, Default)]
pub struct StackInventory {
    stacks: HashMap<StackPath, Arc<Vec<HostInstance>>>,
}

impl StackInventory {
    /// Build an inventory from seeds. Later seeds for the same stack win.
    pub fn from_seeds(seeds: impl IntoIterator<Item = StackSeed>) -> Self {
        Self {
            stacks: seeds
                .into_iter()
                .map(|seed| (seed.path, Arc::new(seed.hosts)))
                .collect(),
        }
    }

    /// Every stack in the inventory.
    pub fn stacks(&self) -> HashSet<StackPath> {
        self.stacks.keys().cloned().collect()
    }

    /// Hosts of one stack, empty when the stack is unknown.
    pub fn hosts(&self, stack: &StackPath) -> &[HostInstance] {
        self.stacks.get(stack).map(|h| h.as_slice()).unwrap_or(&[])
    }

    /// Export as seeds, e.g. for a backup snapshot.
    pub fn to_seeds(&self) -> Vec<StackSeed> {
        let mut seeds: Vec<StackSeed> = self
            .stacks
            .iter()
            .map(|(path, hosts)| StackSeed::new(path.clone(), hosts.as_ref().clone()))
            .collect();
        seeds.sort_by(|a, b| a.path.cmp(&b.path));
        seeds
    }

    /// Number of stacks.
    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    /// Whether the inventory holds no stacks.
    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }
}

/// Where a host lookup is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostLookup {
    /// The in-memory mirror.
    Cached,
    /// A direct read against the store.
    Live,
}

/// Cache behaviour derived from [`RedirectorConfig`].
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Root of the stack hierarchy.
    pub base_path: String,
    /// Weight for hosts whose payload carries none.
    pub default_weight: u32,
    /// Serve lookups from the mirror while connected.
    pub use_cache: bool,
    /// Serve lookups from the mirror while disconnected.
    pub use_cache_when_disconnected: bool,
}

impl From<&RedirectorConfig> for CacheSettings {
    fn from(config: &RedirectorConfig) -> Self {
        Self {
            base_path: config.base_path.trim_end_matches('/').to_string(),
            default_weight: config.default_weight,
            use_cache: config.use_cache,
            use_cache_when_disconnected: config.use_cache_when_disconnected,
        }
    }
}

/// Pending refresh work accumulated from a batch of events.
#[derive(Default)]
struct RefreshWork {
    full: bool,
    stacks: HashSet<StackPath>,
}

/// State owned by the watch loop.
#[derive(Default)]
struct WatchState {
    initialized: bool,
    deferred: Vec<StoreEvent>,
}

/// In-memory mirror of the stack hierarchy.
pub struct TopologyCache {
    store: Arc<dyn CoordinationStore>,
    settings: CacheSettings,
    inventory: ArcSwap<StackInventory>,
    available: watch::Sender<bool>,
    connected: AtomicBool,
    /// Stack set at the last published change, used for change events.
    published: Mutex<HashSet<StackPath>>,
    changes: broadcast::Sender<StackDiff>,
}

impl TopologyCache {
    /// Create a cache over `store`. Nothing is read until [`start`](Self::start).
    pub fn new(store: Arc<dyn CoordinationStore>, settings: CacheSettings) -> Arc<Self> {
        let (available, _) = watch::channel(false);
        let (changes, _) = broadcast::channel(64);
        let connected = store.connection_state() == ConnectionState::Connected;
        Arc::new(Self {
            store,
            settings,
            inventory: ArcSwap::from_pointee(StackInventory::default()),
            available,
            connected: AtomicBool::new(connected),
            published: Mutex::new(HashSet::new()),
            changes,
        })
    }

    /// Register the subtree watch and spawn the task that applies its events.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.store.watch_subtree(&self.settings.base_path, tx)?;

        let cache = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let mut state = WatchState::default();
            while let Some(event) = rx.recv().await {
                let mut batch = vec![event];
                while let Ok(next) = rx.try_recv() {
                    batch.push(next);
                }
                cache.apply(batch, &mut state);
            }
            debug!(base = %cache.settings.base_path, "topology watch closed");
        }))
    }

    /// Block until the first full population completes, or fail after `timeout`.
    pub async fn wait_for_availability(&self, timeout: Duration) -> Result<()> {
        let mut ready = self.available.subscribe();
        let became_available = matches!(
            tokio::time::timeout(timeout, ready.wait_for(|available| *available)).await,
            Ok(Ok(_))
        );
        if became_available {
            return Ok(());
        }
        error!(?timeout, base = %self.settings.base_path, "topology never became available");
        Err(RedirectorError::AvailabilityTimeout(timeout))
    }

    /// Whether the first full population has completed.
    pub fn is_available(&self) -> bool {
        *self.available.borrow()
    }

    /// Connection state as last reported by the watch.
    pub fn connection_state(&self) -> ConnectionState {
        if self.connected.load(Ordering::Acquire) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Subscribe to stack add/remove events.
    pub fn subscribe(&self) -> broadcast::Receiver<StackDiff> {
        self.changes.subscribe()
    }

    /// Whether host lookups may be served from the mirror.
    pub fn cache_usage_allowed(&self) -> bool {
        if !self.is_available() {
            return false;
        }
        self.settings.use_cache
            || (self.connection_state() == ConnectionState::Disconnected
                && self.settings.use_cache_when_disconnected)
    }

    /// How the next host lookup will be served.
    pub fn lookup_mode(&self) -> HostLookup {
        if self.cache_usage_allowed() {
            HostLookup::Cached
        } else {
            HostLookup::Live
        }
    }

    /// The current inventory snapshot.
    pub fn inventory(&self) -> Arc<StackInventory> {
        self.inventory.load_full()
    }

    /// Every stack currently mirrored.
    pub fn current_stacks(&self) -> HashSet<StackPath> {
        self.inventory.load().stacks()
    }

    /// Hosts registered under `stack`, including zero-weight ones.
    pub fn hosts_for(&self, stack: &StackPath) -> Vec<HostInstance> {
        match self.lookup_mode() {
            HostLookup::Cached => self.inventory.load().hosts(stack).to_vec(),
            HostLookup::Live => match self.read_hosts(&self.stack_node(stack)) {
                Ok(hosts) => hosts,
                Err(e) => {
                    warn!(stack = %stack, error = %e, "live host lookup failed");
                    Vec::new()
                }
            },
        }
    }

    /// Number of hosts registered under `stack`.
    pub fn host_count(&self, stack: &StackPath) -> usize {
        match self.lookup_mode() {
            HostLookup::Cached => self.inventory.load().hosts(stack).len(),
            HostLookup::Live => self.hosts_for(stack).len(),
        }
    }

    /// The host at `index` under `stack`.
    pub fn host_at(&self, stack: &StackPath, index: usize) -> Option<HostInstance> {
        match self.lookup_mode() {
            HostLookup::Cached => self.inventory.load().hosts(stack).get(index).cloned(),
            HostLookup::Live => self.hosts_for(stack).into_iter().nth(index),
        }
    }

    /// Re-read the whole subtree and publish it.
    pub fn refresh(&self) -> Result<()> {
        let inventory = self.read_inventory()?;
        self.publish(inventory);
        Ok(())
    }

    /// Re-read the hosts of one stack and publish the patched inventory.
    pub fn refresh_stack(&self, stack: &StackPath) -> Result<()> {
        let node = self.stack_node(stack);
        let mut next = StackInventory::clone(&self.inventory.load());
        match self.store.children_of(&node) {
            Err(StoreError::NoNode(_)) => {
                next.stacks.remove(stack);
            }
            Err(e) => return Err(e.into()),
            Ok(_) => {
                let hosts = self.read_hosts(&node)?;
                next.stacks.insert(stack.clone(), Arc::new(hosts));
            }
        }
        self.publish(next);
        Ok(())
    }

    fn apply(&self, events: Vec<StoreEvent>, state: &mut WatchState) {
        let mut work = RefreshWork::default();
        for event in events {
            // Connection events apply immediately, even before initialization.
            if event.is_connection_event() {
                self.on_connection(&event, &mut work);
                continue;
            }
            match event {
                StoreEvent::Initialized => {
                    state.initialized = true;
                    work.full = true;
                    for deferred in state.deferred.drain(..) {
                        self.classify(&deferred, &mut work);
                    }
                }
                other if !state.initialized => state.deferred.push(other),
                other => self.classify(&other, &mut work),
            }
        }

        let outcome = if work.full {
            self.refresh()
        } else {
            work.stacks
                .iter()
                .try_for_each(|stack| self.refresh_stack(stack))
        };

        match outcome {
            Ok(()) if state.initialized && !self.is_available() => {
                info!(stacks = self.inventory.load().len(), "topology cache available");
                self.available.send_replace(true);
            }
            Ok(()) => {}
            Err(e) => warn!(error = %e, "topology refresh failed, keeping previous inventory"),
        }
    }

    fn on_connection(&self, event: &StoreEvent, work: &mut RefreshWork) {
        let restored = matches!(event, StoreEvent::ConnectionRestored);
        self.connected.store(restored, Ordering::Release);
        if restored {
            info!(base = %self.settings.base_path, "coordination store connection restored");
            work.full = true;
        } else {
            warn!(base = %self.settings.base_path, "coordination store connection lost");
        }
    }

    /// Decide whether a node event needs a full or a per-stack refresh.
    fn classify(&self, event: &StoreEvent, work: &mut RefreshWork) {
        let Some(path) = event.path() else { return };
        let Some(relative) = path.strip_prefix(self.settings.base_path.as_str()) else {
            return;
        };
        let segments: Vec<&str> = relative.split('/').filter(|s| !s.is_empty()).collect();
        match segments.as_slice() {
            [dc, region, zone, app, _host, ..] => match StackPath::new(*dc, *region, *zone, *app) {
                Ok(stack) => {
                    work.stacks.insert(stack);
                }
                Err(_) => work.full = true,
            },
            _ => work.full = true,
        }
    }

    fn publish(&self, inventory: StackInventory) {
        let current = inventory.stacks();
        self.inventory.store(Arc::new(inventory));

        let mut published = self.published.lock();
        let diff = StackDiff::between(&published, &current);
        if diff.is_empty() {
            return;
        }
        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            "topology changed"
        );
        *published = current;
        // No subscribers is fine.
        let _ = self.changes.send(diff);
    }

    fn stack_node(&self, stack: &StackPath) -> String {
        format!("{}{}", self.settings.base_path, stack)
    }

    fn children(&self, path: &str) -> std::result::Result<Vec<String>, StoreError> {
        match self.store.children_of(path) {
            Err(StoreError::NoNode(_)) => Ok(Vec::new()),
            other => other,
        }
    }

    fn read_inventory(&self) -> Result<StackInventory> {
        let mut stacks = HashMap::new();
        let base = self.settings.base_path.as_str();

        for dc in self.children(base)? {
            let dc_node = join_path(base, &dc);
            for region in self.children(&dc_node)? {
                let region_node = join_path(&dc_node, &region);
                for zone in self.children(&region_node)? {
                    let zone_node = join_path(&region_node, &zone);
                    for app in self.children(&zone_node)? {
                        let stack = match StackPath::new(dc.as_str(), region.as_str(), zone.as_str(), app.as_str()) {
                            Ok(stack) => stack,
                            Err(e) => {
                                warn!(error = %e, "skipping malformed stack node");
                                continue;
                            }
                        };
                        let hosts = self.read_hosts(&join_path(&zone_node, &app))?;
                        stacks.insert(stack, Arc::new(hosts));
                    }
                }
            }
        }

        Ok(StackInventory { stacks })
    }

    fn read_hosts(&self, stack_node: &str) -> Result<Vec<HostInstance>> {
        let mut hosts = Vec::new();
        for name in self.children(stack_node)? {
            let node = join_path(stack_node, &name);
            let payload = match self.store.data_of(&node) {
                Ok(payload) => payload,
                Err(StoreError::NoNode(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            match HostInstance::decode(&node, &name, &payload, self.settings.default_weight) {
                Ok(host) => hosts.push(host),
                Err(e) => warn!(error = %e, "skipping undecodable host"),
            }
        }
        Ok(hosts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn settings() -> CacheSettings {
        CacheSettings::from(&RedirectorConfig::default())
    }

    fn add_host(store: &InMemoryStore, stack: &str, id: &str, weight: u32) {
        let host = HostInstance::new(format!("10.0.0.{id}"), weight);
        store.create(&format!("/services{stack}/{id}"), &host.encode());
    }

    fn stack(raw: &str) -> StackPath {
        StackPath::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_initial_population() {
        let store = Arc::new(InMemoryStore::new());
        add_host(&store, "/DC1/R1/Zone1/app", "1", 10);
        add_host(&store, "/DC1/R1/Zone1/app", "2", 10);
        add_host(&store, "/DC1/R1/Zone2/app", "3", 10);

        let cache = TopologyCache::new(store.clone(), settings());
        assert!(!cache.is_available());
        cache.start().unwrap();
        cache.wait_for_availability(Duration::from_secs(1)).await.unwrap();

        assert_eq!(cache.current_stacks().len(), 2);
        assert_eq!(cache.host_count(&stack("/DC1/R1/Zone1/app")), 2);
        assert_eq!(cache.lookup_mode(), HostLookup::Cached);
        assert!(cache.host_at(&stack("/DC1/R1/Zone2/app"), 0).is_some());
        assert!(cache.host_at(&stack("/DC1/R1/Zone2/app"), 1).is_none());
    }

    #[tokio::test]
    async fn test_change_events_carry_diff() {
        let store = Arc::new(InMemoryStore::new());
        add_host(&store, "/DC1/R1/Zone1/app", "1", 10);
        let cache = TopologyCache::new(store.clone(), settings());
        cache.start().unwrap();
        cache.wait_for_availability(Duration::from_secs(1)).await.unwrap();

        let mut changes = cache.subscribe();
        add_host(&store, "/DC2/R1/Zone1/app", "2", 10);
        let diff = tokio::time::timeout(Duration::from_secs(1), changes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(diff.added, [stack("/DC2/R1/Zone1/app")].into_iter().collect());
        assert!(diff.removed.is_empty());

        store.delete("/services/DC1");
        let diff = tokio::time::timeout(Duration::from_secs(1), changes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(diff.removed, [stack("/DC1/R1/Zone1/app")].into_iter().collect());
    }

    #[tokio::test]
    async fn test_host_update_refreshes_single_stack() {
        let store = Arc::new(InMemoryStore::new());
        add_host(&store, "/DC1/R1/Zone1/app", "1", 10);
        let cache = TopologyCache::new(store.clone(), settings());
        cache.start().unwrap();
        cache.wait_for_availability(Duration::from_secs(1)).await.unwrap();

        add_host(&store, "/DC1/R1/Zone1/app", "2", 10);
        // Host-level changes do not alter the stack set, so poll the mirror.
        for _ in 0..50 {
            if cache.host_count(&stack("/DC1/R1/Zone1/app")) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.host_count(&stack("/DC1/R1/Zone1/app")), 2);
    }

    #[tokio::test]
    async fn test_availability_times_out_when_disconnected() {
        let store = Arc::new(InMemoryStore::new());
        store.disconnect();
        let cache = TopologyCache::new(store.clone(), settings());
        cache.start().unwrap();

        let err = cache
            .wait_for_availability(Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, RedirectorError::AvailabilityTimeout(_)));
        assert!(!cache.is_available());
    }

    #[tokio::test]
    async fn test_availability_after_reconnect() {
        let store = Arc::new(InMemoryStore::new());
        add_host(&store, "/DC1/R1/Zone1/app", "1", 10);
        store.disconnect();
        let cache = TopologyCache::new(store.clone(), settings());
        cache.start().unwrap();

        store.reconnect();
        cache.wait_for_availability(Duration::from_secs(1)).await.unwrap();
        assert_eq!(cache.current_stacks().len(), 1);
    }

    #[test]
    fn test_live_lookup_before_availability() {
        let store = Arc::new(InMemoryStore::new());
        add_host(&store, "/DC1/R1/Zone1/app", "1", 10);
        let cache = TopologyCache::new(store.clone(), settings());

        assert_eq!(cache.lookup_mode(), HostLookup::Live);
        assert_eq!(cache.hosts_for(&stack("/DC1/R1/Zone1/app")).len(), 1);
        store.disconnect();
        assert!(cache.hosts_for(&stack("/DC1/R1/Zone1/app")).is_empty());
    }

    #[test]
    fn test_cache_usage_gate_respects_disconnected_setting() {
        let store = Arc::new(InMemoryStore::new());
        add_host(&store, "/DC1/R1/Zone1/app", "1", 10);
        let mut settings = settings();
        settings.use_cache = false;
        settings.use_cache_when_disconnected = true;
        let cache = TopologyCache::new(store.clone(), settings);
        cache.refresh().unwrap();
        cache.available.send_replace(true);

        assert!(!cache.cache_usage_allowed());
        cache.connected.store(false, Ordering::Release);
        assert!(cache.cache_usage_allowed());
        assert_eq!(cache.hosts_for(&stack("/DC1/R1/Zone1/app")).len(), 1);
    }

    #[test]
    fn test_refresh_skips_undecodable_hosts() {
        let store = Arc::new(InMemoryStore::new());
        add_host(&store, "/DC1/R1/Zone1/app", "1", 10);
        store.create("/services/DC1/R1/Zone1/app/broken", b"{oops");
        let cache = TopologyCache::new(store.clone(), settings());
        cache.refresh().unwrap();
        assert_eq!(cache.inventory().hosts(&stack("/DC1/R1/Zone1/app")).len(), 1);
    }

    #[test]
    fn test_node_events_before_initialization_are_deferred() {
        let store = Arc::new(InMemoryStore::new());
        add_host(&store, "/DC1/R1/Zone1/app", "1", 10);
        let cache = TopologyCache::new(store.clone(), settings());
        let mut state = WatchState::default();

        cache.apply(
            vec![
                StoreEvent::NodeAdded("/services/DC1/R1/Zone1/app/1".to_string()),
                StoreEvent::ConnectionLost,
                StoreEvent::NodeUpdated("/services/DC1/R1/Zone1/app/1".to_string()),
            ],
            &mut state,
        );
        assert_eq!(state.deferred.len(), 2);
        assert!(state.deferred.iter().all(|e| !e.is_connection_event()));
        assert_eq!(cache.connection_state(), ConnectionState::Disconnected);
        assert!(cache.inventory().is_empty());
        assert!(!cache.is_available());

        cache.apply(vec![StoreEvent::ConnectionRestored, StoreEvent::Initialized], &mut state);
        assert!(state.deferred.is_empty());
        assert_eq!(cache.connection_state(), ConnectionState::Connected);
        assert!(cache.is_available());
        assert_eq!(cache.host_count(&stack("/DC1/R1/Zone1/app")), 1);
    }

    #[test]
    fn test_host_event_classifies_to_its_stack() {
        let cache = TopologyCache::new(Arc::new(InMemoryStore::new()), settings());
        let mut work = RefreshWork::default();
        cache.classify(
            &StoreEvent::NodeRemoved("/services/DC1/R1/Zone1/app/1".to_string()),
            &mut work,
        );
        assert!(!work.full);
        assert_eq!(work.stacks, [stack("/DC1/R1/Zone1/app")].into_iter().collect());

        cache.classify(&StoreEvent::NodeAdded("/services/DC1/R1".to_string()), &mut work);
        assert!(work.full);
    }

    #[test]
    fn test_refresh_of_missing_base_is_empty() {
        let store = Arc::new(InMemoryStore::new());
        let cache = TopologyCache::new(store, settings());
        cache.refresh().unwrap();
        assert!(cache.inventory().is_empty());
    }
}
