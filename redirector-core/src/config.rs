//! Runtime configuration for the redirector core.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::route::UrlParams;
use crate::error::{RedirectorError, Result};
use crate::load_balancer::selector::SelectionStrategy;
use crate::provider::Whitelist;

/// Settings consumed by the topology cache, provider managers, balancer and
/// engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedirectorConfig {
    /// Root of the stack hierarchy in the coordination store.
    pub base_path: String,
    /// Applications that are never auto-discovered.
    pub excluded_apps: HashSet<String>,
    /// Weight given to hosts whose payload carries none.
    pub default_weight: u32,
    /// Fallback URL parameters.
    pub url_defaults: UrlParams,
    /// Seconds between dynamic discovery polls.
    pub discovery_poll_interval_secs: u64,
    /// Minimum whitelisted hosts a server needs to pass validation.
    pub min_hosts: usize,
    /// Serve host lookups from the in-memory mirror while connected.
    pub use_cache: bool,
    /// Serve host lookups from the in-memory mirror while disconnected.
    pub use_cache_when_disconnected: bool,
    /// Upper bound on the initial availability wait, in seconds.
    pub availability_timeout_secs: u64,
    /// Instance selection strategy.
    pub selection: SelectionStrategy,
    /// Stack prefixes approved for production traffic.
    pub whitelist: Whitelist,
}

impl Default for RedirectorConfig {
    fn default() -> Self {
        Self {
            base_path: "/services".to_string(),
            excluded_apps: HashSet::new(),
            default_weight: 10,
            url_defaults: UrlParams {
                protocol: Some("http".to_string()),
                port: Some(80),
                urn: Some(String::new()),
                ip_protocol_version: Some(4),
            },
            discovery_poll_interval_secs: 30,
            min_hosts: 1,
            use_cache: true,
            use_cache_when_disconnected: true,
            availability_timeout_secs: 180,
            selection: SelectionStrategy::RoundRobin,
            whitelist: Whitelist::default(),
        }
    }
}

impl RedirectorConfig {
    /// Parse a JSON document. Missing fields keep their defaults.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| RedirectorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.base_path.starts_with('/') {
            return Err(RedirectorError::Config(format!(
                "base_path must be absolute, got {:?}",
                self.base_path
            )));
        }
        if self.discovery_poll_interval_secs == 0 {
            return Err(RedirectorError::Config(
                "discovery_poll_interval_secs must be positive".into(),
            ));
        }
        self.url_defaults.validate()?;
        Ok(())
    }

    /// Poll interval of the dynamic provider manager.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_poll_interval_secs)
    }

    /// Bound on the initial availability wait.
    pub fn availability_timeout(&self) -> Duration {
        Duration::from_secs(self.availability_timeout_secs)
    }

    /// Whether `app` is excluded from discovery.
    pub fn is_excluded(&self, app: &str) -> bool {
        self.excluded_apps.contains(app)
    }
}
