//! Startup wiring: JSON file loading, store seeding, the file-backed backup
//! source and provider discovery.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use redirector_core::domain::StackSeed;
use redirector_core::manager::{BackupSource, ProviderMode, ServiceProviderManager};
use redirector_core::store::InMemoryStore;
use redirector_core::topology::TopologyCache;
use redirector_core::{RedirectorConfig, RedirectorError, Result};

/// Read a whole file as UTF-8.
pub fn read_file(path: &Path) -> anyhow::Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

/// Read and decode a JSON file.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    serde_json::from_str(&read_file(path)?).with_context(|| format!("decoding {}", path.display()))
}

/// Register every seeded host under `base`, one node per host named by its
/// IPv4 address.
pub fn seed_store(store: &InMemoryStore, base: &str, seeds: &[StackSeed]) {
    let base = base.trim_end_matches('/');
    for seed in seeds {
        for host in &seed.hosts {
            store.create(&format!("{base}{}/{}", seed.path, host.ipv4), &host.encode());
        }
    }
    info!(stacks = seeds.len(), "coordination store seeded");
}

/// Last known topology persisted as a JSON list of stack seeds.
#[derive(Debug, Clone)]
pub struct JsonFileBackup {
    path: PathBuf,
}

impl JsonFileBackup {
    /// Back up to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Overwrite the backup with `seeds`.
    pub fn save(&self, seeds: &[StackSeed]) -> Result<()> {
        let encoded = serde_json::to_vec_pretty(seeds).map_err(|source| RedirectorError::Decode {
            path: self.path.display().to_string(),
            source,
        })?;
        // Staged write, then rename over the target.
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, encoded)
            .and_then(|()| fs::rename(&staging, &self.path))
            .map_err(|e| RedirectorError::Config(format!("writing {}: {e}", self.path.display())))
    }
}

impl BackupSource for JsonFileBackup {
    fn load(&self) -> Result<Option<Vec<StackSeed>>> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(RedirectorError::Config(format!(
                    "reading {}: {e}",
                    self.path.display()
                )))
            }
        };
        let seeds: Vec<StackSeed> =
            serde_json::from_slice(&raw).map_err(|source| RedirectorError::Decode {
                path: self.path.display().to_string(),
                source,
            })?;
        Ok((!seeds.is_empty()).then_some(seeds))
    }
}

/// Persist the inventory to `backup` every time the stack set changes.
pub fn spawn_backup_writer(cache: Arc<TopologyCache>, backup: Arc<JsonFileBackup>) -> JoinHandle<()> {
    let mut changes = cache.subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
            let seeds = cache.inventory().to_seeds();
            match backup.save(&seeds) {
                Ok(()) => debug!(stacks = seeds.len(), "backup written"),
                Err(e) => warn!(error = %e, "failed to write backup"),
            }
        }
    })
}

/// Build the dynamic provider manager over a started `cache`.
///
/// The first refresh runs before the topology is available, so a backup can
/// seed the providers. If the topology then fails to come up in time, startup
/// continues only when the backup did seed them.
pub async fn start_providers(
    cache: Arc<TopologyCache>,
    config: &RedirectorConfig,
    backup: Option<Arc<dyn BackupSource>>,
) -> anyhow::Result<Arc<ServiceProviderManager>> {
    let manager = ServiceProviderManager::dynamic(Arc::clone(&cache), config, backup);
    manager.refresh()?;

    match cache.wait_for_availability(config.availability_timeout()).await {
        Ok(()) => manager.refresh()?,
        Err(e) if manager.mode() == ProviderMode::Backup => {
            warn!(error = %e, "topology unavailable, serving backup providers");
        }
        Err(e) => return Err(e).context("waiting for topology"),
    }
    info!(mode = ?manager.mode(), "providers ready");
    Ok(manager)
}
