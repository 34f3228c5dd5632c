//! Instance providers.
//!
//! An [`InstanceProvider`] is bound to exactly one stack. An
//! [`AggregateProvider`] groups every provider that serves the same
//! `(flavor, app)` and selects across their combined instances.

pub mod filter;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::domain::host::HostInstance;
use crate::domain::route::ServiceInstance;
use crate::domain::stack::{FlavorKey, StackPath};
use crate::error::{RedirectorError, Result};
use crate::load_balancer::selector::Selector;
use crate::topology::TopologyCache;

pub use filter::{filter_instances, FilterMode, Whitelist};

enum HostSource {
    /// Pulled from the topology cache on every read.
    Topology(Arc<TopologyCache>),
    /// Fixed at construction, e.g. from a backup seed.
    Fixed(Arc<Vec<HostInstance>>),
}

/// Closeable handle over the hosts of one stack.
pub struct InstanceProvider {
    stack: StackPath,
    source: HostSource,
    closed: AtomicBool,
}

impl InstanceProvider {
    /// A provider that reads `stack`'s hosts from the topology cache lazily.
    pub fn from_topology(stack: StackPath, cache: Arc<TopologyCache>) -> Self {
        Self {
            stack,
            source: HostSource::Topology(cache),
            closed: AtomicBool::new(false),
        }
    }

    /// A provider over a fixed host list.
    pub fn fixed(stack: StackPath, hosts: Vec<HostInstance>) -> Self {
        Self {
            stack,
            source: HostSource::Fixed(Arc::new(hosts)),
            closed: AtomicBool::new(false),
        }
    }

    /// The stack this provider is bound to.
    pub fn stack(&self) -> &StackPath {
        &self.stack
    }

    /// Routable hosts, tagged with this provider's stack.
    ///
    /// Zero-weight hosts are excluded. A closed provider has no instances.
    pub fn instances(&self) -> Vec<ServiceInstance> {
        if self.is_closed() {
            return Vec::new();
        }
        let hosts = match &self.source {
            HostSource::Topology(cache) => cache.hosts_for(&self.stack),
            HostSource::Fixed(hosts) => hosts.as_ref().clone(),
        };
        hosts
            .into_iter()
            .filter(HostInstance::is_routable)
            .map(|host| ServiceInstance::new(self.stack.clone(), host))
            .collect()
    }

    /// Release the provider. Fails if it was already closed.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(RedirectorError::ProviderClosed(self.stack.to_string()));
        }
        Ok(())
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Every provider serving one `(flavor, app)`.
///
/// Built fresh on each snapshot rebuild and never mutated afterwards.
pub struct AggregateProvider {
    key: FlavorKey,
    members: Vec<Arc<InstanceProvider>>,
}

impl AggregateProvider {
    /// Wrap an already shuffled group of providers.
    pub fn new(key: FlavorKey, members: Vec<Arc<InstanceProvider>>) -> Self {
        Self { key, members }
    }

    /// The `(flavor, app)` this aggregate serves.
    pub fn key(&self) -> &FlavorKey {
        &self.key
    }

    /// Member providers in probe order.
    pub fn members(&self) -> &[Arc<InstanceProvider>] {
        &self.members
    }

    /// Routable instances across every member.
    pub fn select_all(&self) -> Vec<ServiceInstance> {
        self.members.iter().flat_map(|p| p.instances()).collect()
    }

    /// One instance across every member.
    pub fn select_one(&self, selector: &Selector) -> Option<ServiceInstance> {
        selector.pick(&self.key.to_string(), &self.select_all()).cloned()
    }

    /// Instances whose stack passes `mode`.
    pub fn select_filtered<F>(&self, mode: FilterMode, is_whitelisted: F) -> Vec<ServiceInstance>
    where
        F: Fn(&str) -> bool,
    {
        filter_instances(self.select_all(), mode, is_whitelisted)
    }

    /// One instance whose stack passes `mode`.
    pub fn select_filtered_one<F>(
        &self,
        mode: FilterMode,
        is_whitelisted: F,
        selector: &Selector,
    ) -> Option<ServiceInstance>
    where
        F: Fn(&str) -> bool,
    {
        selector
            .pick(&self.key.to_string(), &self.select_filtered(mode, is_whitelisted))
            .cloned()
    }

    /// Instances de-duplicated by `(ipv4, ipv6)`, first occurrence wins.
    pub fn unique_instances(&self) -> Vec<ServiceInstance> {
        let mut seen = HashSet::new();
        self.select_all()
            .into_iter()
            .filter(|i| seen.insert((i.host.ipv4.clone(), i.host.ipv6.clone())))
            .collect()
    }
}
