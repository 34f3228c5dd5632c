//! Server path resolution and host selection.

use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::debug;

use crate::domain::route::ServiceInstance;
use crate::domain::stack::StackPath;
use crate::load_balancer::selector::{SelectionStrategy, Selector};
use crate::manager::snapshot::ProviderSnapshot;
use crate::manager::ServiceProviderManager;
use crate::provider::{filter_instances, FilterMode, Whitelist};
use crate::rules::Server;

/// How the balancer looks up candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupMode {
    /// Whitelist filter applied to candidate stacks.
    pub filter: FilterMode,
    /// Read the backup snapshot instead of the live one.
    pub force_backup: bool,
}

impl LookupMode {
    /// Live lookup with `filter`.
    pub fn live(filter: FilterMode) -> Self {
        Self {
            filter,
            force_backup: false,
        }
    }

    /// Backup lookup with `filter`.
    pub fn backup(filter: FilterMode) -> Self {
        Self {
            filter,
            force_backup: true,
        }
    }
}

/// Picks one instance for a server of a single application.
///
/// A server path starting with `/` names a `/dc/region/zone` stack and is
/// served by that stack's provider alone. Any other path is a flavor and is
/// served by the `(flavor, app)` aggregate.
pub struct Balancer {
    manager: Arc<ServiceProviderManager>,
    app: String,
    whitelist: ArcSwap<Whitelist>,
    selector: Selector,
}

impl Balancer {
    /// Create a balancer for `app`.
    pub fn new(
        manager: Arc<ServiceProviderManager>,
        app: impl Into<String>,
        whitelist: Whitelist,
        strategy: SelectionStrategy,
    ) -> Self {
        Self {
            manager,
            app: app.into(),
            whitelist: ArcSwap::from_pointee(whitelist),
            selector: Selector::new(strategy),
        }
    }

    /// Application this balancer serves.
    pub fn app(&self) -> &str {
        &self.app
    }

    /// The provider manager lookups go through.
    pub fn manager(&self) -> &Arc<ServiceProviderManager> {
        &self.manager
    }

    /// Current whitelist.
    pub fn whitelist(&self) -> Arc<Whitelist> {
        self.whitelist.load_full()
    }

    /// Replace the whitelist. In-flight lookups keep the one they loaded.
    pub fn update_whitelist(&self, whitelist: Whitelist) {
        self.whitelist.store(Arc::new(whitelist));
    }

    /// Pick one instance for `server`. `None` when no candidate passes `mode`.
    pub fn get_service_instance(&self, server: &Server, mode: LookupMode) -> Option<ServiceInstance> {
        let candidates = self.candidates(&server.path, mode);
        let picked = self.selector.pick(&server.path, &candidates).cloned();
        debug!(
            server = %server.name,
            path = %server.path,
            candidates = candidates.len(),
            selected = picked.as_ref().map(|i| i.host.ipv4.as_str()).unwrap_or("none"),
            "balancer lookup"
        );
        picked
    }

    /// Number of distinct hosts `path` resolves to under `mode`.
    pub fn get_count_of_hosts_for_path(&self, path: &str, mode: LookupMode) -> usize {
        let mut seen = HashSet::new();
        self.candidates(path, mode)
            .into_iter()
            .filter(|i| seen.insert((i.host.ipv4.clone(), i.host.ipv6.clone())))
            .count()
    }

    fn candidates(&self, path: &str, mode: LookupMode) -> Vec<ServiceInstance> {
        let snapshot = if mode.force_backup {
            self.manager.backup_snapshot()
        } else {
            self.manager.snapshot()
        };
        let whitelist = self.whitelist.load();
        let is_whitelisted = |stack: &str| whitelist.matches(stack);

        if path.starts_with('/') {
            let instances = self.stack_instances(&snapshot, path);
            filter_instances(instances, mode.filter, is_whitelisted)
        } else {
            snapshot
                .provider_for_flavor(path, &self.app)
                .map(|aggregate| aggregate.select_filtered(mode.filter, is_whitelisted))
                .unwrap_or_default()
        }
    }

    fn stack_instances(&self, snapshot: &ProviderSnapshot, path: &str) -> Vec<ServiceInstance> {
        match StackPath::from_stack_and_app(path, &self.app) {
            Ok(stack) => snapshot
                .provider_for_stack(&stack)
                .map(|provider| provider.instances())
                .unwrap_or_default(),
            Err(e) => {
                debug!(path, error = %e, "server path is not a stack");
                Vec::new()
            }
        }
    }
}
