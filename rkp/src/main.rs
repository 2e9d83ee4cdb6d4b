use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rkp::config::{Config, load_config, load_manifest};
use rkp::events::DirEventSink;
use rkp::oom::OomProbe;
use rkp::store::XlineStore;
use rkp::supervisor::S6Supervisor;
use rkp::{AppAgent, AppPresence, NodeReaper, ServicePresence};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rkp")]
#[command(about = "Node presence and service lifecycle agent", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Register an app and supervise its services until it exits")]
    Run {
        #[arg(long, value_name = "CONFIG_YAML")]
        config: String,
        #[arg(long, value_name = "MANIFEST_YAML")]
        manifest: String,
        #[arg(long, value_name = "DIR")]
        container_dir: PathBuf,
        /// Supervised directory of the container; the app is killed when it goes down.
        #[arg(long, value_name = "DIR")]
        control_dir: Option<PathBuf>,
    },
    #[command(about = "Remove presence of every app placed on a dead node")]
    KillNode {
        #[arg(long, value_name = "CONFIG_YAML")]
        config: String,
        #[arg(value_name = "NODE")]
        node: String,
    },
    #[command(about = "Report exits of an app's services that were not reported yet")]
    Report {
        #[arg(long, value_name = "CONFIG_YAML")]
        config: String,
        #[arg(long, value_name = "MANIFEST_YAML")]
        manifest: String,
        #[arg(long, value_name = "DIR")]
        container_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            manifest,
            container_dir,
            control_dir,
        } => run_app(&config, &manifest, container_dir, control_dir).await,
        Commands::KillNode { config, node } => kill_node(&config, &node).await,
        Commands::Report {
            config,
            manifest,
            container_dir,
        } => report(&config, &manifest, container_dir).await,
    }
}

fn service_presence(
    cfg: &Config,
    manifest: common::Manifest,
    container_dir: PathBuf,
    supervisor: Arc<S6Supervisor>,
) -> ServicePresence {
    ServicePresence::new(
        manifest,
        container_dir,
        cfg.hostname(),
        supervisor,
        Arc::new(DirEventSink::new(&cfg.appevents_dir)),
    )
    .with_oom_probe(OomProbe::new(&cfg.cgroup_memory_root))
    .with_timing(cfg.timing.lifecycle_timing())
}

async fn run_app(
    config: &str,
    manifest: &str,
    container_dir: PathBuf,
    control_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let cfg = load_config(config)?;
    let manifest = load_manifest(manifest)?;
    let store = Arc::new(
        XlineStore::connect(&cfg.xline_config)
            .await
            .context("Failed to connect to xline")?,
    );

    let presence = AppPresence::new(store.clone(), manifest.clone(), cfg.hostname())
        .with_retry(cfg.timing.retry_policy());
    let supervisor = Arc::new(S6Supervisor::new());
    let services = service_presence(&cfg, manifest, container_dir, supervisor.clone());
    let mut agent = AppAgent::new(presence, services, supervisor, control_dir);

    let result = agent.run().await;
    if let Err(e) = store.close().await {
        warn!("Failed to close xline session: {e}");
    }
    let info = result?;
    info!(
        "app exited: service {:?}, killed {}, oom {}",
        info.service, info.killed, info.oom
    );
    Ok(())
}

async fn kill_node(config: &str, node: &str) -> anyhow::Result<()> {
    let cfg = load_config(config)?;
    let store = Arc::new(
        XlineStore::connect(&cfg.xline_config)
            .await
            .context("Failed to connect to xline")?,
    );
    let result = NodeReaper::new(store.clone()).kill_node(node).await;
    if let Err(e) = store.close().await {
        warn!("Failed to close xline session: {e}");
    }
    result.with_context(|| format!("Failed to reap node {node}"))
}

async fn report(config: &str, manifest: &str, container_dir: PathBuf) -> anyhow::Result<()> {
    let cfg = load_config(config)?;
    let manifest = load_manifest(manifest)?;
    let mut services =
        service_presence(&cfg, manifest, container_dir, Arc::new(S6Supervisor::new()));
    match services.update_all_exit_status().await {
        Ok(n) => {
            info!("{}: reported {n} pending exits", services.appname());
            Ok(())
        }
        Err(e) => {
            error!("{}: failed to report exits: {e:#}", services.appname());
            Err(e)
        }
    }
}
