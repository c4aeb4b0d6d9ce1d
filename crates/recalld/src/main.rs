use anyhow::{Context, Result};
use recall_bridge::{HelperManifest, ProcessComparator, ProcessGenerator, ScratchRoot};
use recall_core::{Comparator, EuclideanComparator, MatchPolicy, RecallService, Resolver};
use recall_store::{EmbeddingCipher, SqliteSignatureStore};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::{ComparatorKind, Config};

const BUS_NAME: &str = "org.recall.Recall1";
const OBJECT_PATH: &str = "/org/recall/Recall1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("recalld starting");
    let config = Config::from_env();

    let policy = MatchPolicy::new(config.acceptance_floor)
        .with_context(|| format!("invalid RECALL_ACCEPTANCE_FLOOR {}", config.acceptance_floor))?;

    let manifest = HelperManifest::resolve(config.helpers_path.as_deref())?;
    tracing::info!(
        generator = %manifest.generator.program,
        comparator = ?config.comparator,
        "helper manifest loaded"
    );

    let scratch = ScratchRoot::new(&config.scratch_dir).with_context(|| {
        format!("cannot create scratch root {}", config.scratch_dir.display())
    })?;
    match scratch.sweep_stale() {
        Ok(0) => {}
        Ok(n) => tracing::info!(removed = n, "swept stale call scopes"),
        Err(err) => tracing::warn!(error = %err, "scratch sweep failed"),
    }

    let generator = ProcessGenerator::new(
        manifest.generator.clone(),
        scratch.clone(),
        config.call_timeout(),
    );
    let comparator: Box<dyn Comparator> = match config.comparator {
        ComparatorKind::Builtin => Box::new(EuclideanComparator),
        ComparatorKind::Helper => {
            let command = manifest
                .comparator
                .clone()
                .context("RECALL_COMPARATOR=helper but the manifest has no [comparator]")?;
            Box::new(ProcessComparator::new(command, scratch, config.call_timeout()))
        }
    };

    let cipher = config.store_key.as_deref().map(EmbeddingCipher::from_passphrase);
    let sealed = cipher.is_some();
    let store = SqliteSignatureStore::open(&config.db_path, cipher)
        .with_context(|| format!("cannot open store {}", config.db_path.display()))?;

    let service = RecallService::new(
        Box::new(generator),
        comparator,
        Box::new(store),
        Resolver::new(policy),
    );
    let engine = engine::spawn_engine(service, config.workers)?;
    tracing::info!(workers = config.workers, floor = policy.floor(), "engine ready");

    let interface = dbus_interface::RecallInterface::new(
        engine,
        dbus_interface::DaemonInfo {
            workers: config.workers,
            acceptance_floor: policy.floor(),
            comparator: match config.comparator {
                ComparatorKind::Builtin => "builtin",
                ComparatorKind::Helper => "helper",
            },
            sealed,
        },
    );

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, interface)?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(bus_name = BUS_NAME, path = OBJECT_PATH, "recalld ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("recalld shutting down");

    Ok(())
}
