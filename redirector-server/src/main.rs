//! Redirector Server
//!
//! Seeds a coordination store from an inventory file, follows it with a
//! topology cache and a dynamic provider manager, and answers every HTTP
//! request with a redirect to one live host chosen by the rule model.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use redirector_core::domain::StackSeed;
use redirector_core::manager::BackupSource;
use redirector_core::rules::StaticRuleModel;
use redirector_core::store::InMemoryStore;
use redirector_core::topology::{CacheSettings, TopologyCache};
use redirector_core::{RedirectorConfig, RedirectorEngine};

mod bootstrap;
mod server;

use bootstrap::JsonFileBackup;

/// Server command line arguments.
#[derive(Parser, Debug)]
#[command(name = "redirector-server")]
#[command(about = "Redirects clients to a live host of the right application stack")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Core configuration (JSON)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Stack inventory to seed the coordination store with (JSON list of stacks)
    #[arg(long, value_name = "PATH")]
    inventory: PathBuf,

    /// Rule model (JSON)
    #[arg(long, value_name = "PATH")]
    rules: PathBuf,

    /// Backup file read when the topology is unreachable and rewritten on change
    #[arg(long, value_name = "PATH")]
    backup: Option<PathBuf>,

    /// Application to route
    #[arg(long, default_value = "app")]
    app: String,
}

/// The primary entrypoint for the redirector.
///
/// Waits for topology availability before accepting traffic, unless a
/// backup file seeds the providers first.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_tracing();

    let config = match &args.config {
        Some(path) => RedirectorConfig::from_json(&bootstrap::read_file(path)?)?,
        None => RedirectorConfig::default(),
    };
    info!(app = %args.app, base = %config.base_path, "starting redirector");

    let seeds: Vec<StackSeed> = bootstrap::load_json(&args.inventory)?;
    let store = Arc::new(InMemoryStore::new());
    bootstrap::seed_store(&store, &config.base_path, &seeds);

    let cache = TopologyCache::new(store, CacheSettings::from(&config));
    let backup = args.backup.map(|path| Arc::new(JsonFileBackup::new(path)));
    if let Some(backup) = &backup {
        bootstrap::spawn_backup_writer(Arc::clone(&cache), Arc::clone(backup));
    }
    cache.start()?;

    let manager = bootstrap::start_providers(
        cache,
        &config,
        backup.map(|b| b as Arc<dyn BackupSource>),
    )
    .await?;
    let _poller = manager.spawn_poller();

    let model = Arc::new(StaticRuleModel::from_json(&bootstrap::read_file(&args.rules)?)?);
    let engine = RedirectorEngine::new(args.app, manager, model.clone(), &config)
        .with_url_model(model);

    let listener = TcpListener::bind(args.bind).await?;
    server::serve(listener, Arc::new(engine)).await
}

fn setup_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
