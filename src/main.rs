mod config;
mod dispatch;
mod groups;
mod protocol;
mod reaper;
mod sandbox;
mod server;
mod snapshot;
mod state;
mod store;
mod watcher;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::dispatch::{DispatchEvent, Dispatcher};
use crate::reaper::{
    LoggingDeleter, MemoryReaperStore, MessageDeleter, ReaperStore, SqliteReaperStore, TtlReaper,
};
use crate::sandbox::ProcessSandboxHost;
use crate::snapshot::builder::SnapshotBuilder;
use crate::state::FlowStateStore;
use crate::store::Store;
use crate::watcher::SourceWatcher;

/// Coarse sweep interval for the TTL reaper (armed deadlines wake it early).
const REAP_INTERVAL_SECS: u64 = 5;
/// Bulk-expiry interval for idle flow sessions.
const FLOW_SWEEP_SECS: u64 = 30;

#[derive(Parser)]
#[command(name = "switchboard", about = "Multi-tenant chat-bot routing runtime")]
enum Cli {
    /// Start the HTTP server (default when no subcommand is given)
    #[command(alias = "run")]
    Serve {
        /// Do not watch the services directory for source changes
        #[arg(long)]
        no_watch: bool,
    },
    /// Delete service bundles no live snapshot references
    Gc,
    /// Sandbox child entrypoint (internal; reads stdin, writes stdout)
    #[command(hide = true)]
    SandboxExec,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // The sandbox child must not touch dotenv or tracing: its stdout is the
    // response channel and its environment arrives cleared.
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("sandbox-exec") {
        std::process::exit(sandbox::runtime::run_child());
    }

    dotenv().ok();

    // Default to Serve when no subcommand is given, but still allow
    // --help and --version to work.
    let cli = if args.len() <= 1 {
        Cli::Serve { no_watch: false }
    } else {
        Cli::parse()
    };

    match cli {
        Cli::Serve { no_watch } => run_server(no_watch).await,
        Cli::Gc => run_gc().await,
        Cli::SandboxExec => std::process::exit(sandbox::runtime::run_child()),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("switchboard=info,tower_http=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_tree::HierarchicalLayer::new(2)
                .with_targets(true)
                .with_bracketed_fields(false),
        )
        .init();
}

async fn run_server(no_watch: bool) -> Result<(), Box<dyn Error>> {
    let config = config::Config::from_env();
    init_tracing();

    tracing::info!(
        environment = %config.environment,
        db = %config.db_path,
        services = %config.services_root.display(),
        "starting switchboard"
    );

    let store = Arc::new(Store::open(&config.db_path).context("failed to open database")?);
    std::fs::create_dir_all(&config.services_root)
        .context("failed to create services directory")?;

    let builder = Arc::new(SnapshotBuilder::new(store.clone(), config.services_root.clone()));
    let flow_state = Arc::new(FlowStateStore::new());

    let runner = Arc::new(
        ProcessSandboxHost::new(config.data_dir.join("sandboxes"))
            .context("failed to initialize sandbox host")?,
    );

    let (events_tx, _) = tokio::sync::broadcast::channel::<DispatchEvent>(256);

    let dispatcher = Arc::new(
        Dispatcher::new(
            store.clone(),
            builder.clone(),
            flow_state.clone(),
            runner,
            Duration::from_millis(config.sandbox_timeout_ms),
            config.flow_ttl_ms,
        )
        .with_events(events_tx.clone()),
    );

    // Durable reaper tier when the database lives on disk; in-memory tier
    // (with its restart caveat) otherwise.
    let reaper_store: Box<dyn ReaperStore> = if config.db_path == crate::store::MEMORY_DB {
        Box::new(MemoryReaperStore::new())
    } else {
        Box::new(SqliteReaperStore::new(store.clone()))
    };
    let reaper = Arc::new(TtlReaper::new(reaper_store));
    let deleter: Arc<dyn MessageDeleter> = Arc::new(LoggingDeleter);

    // Startup flush: deadlines that passed while we were down still fire.
    match reaper.cleanup_all(deleter.as_ref()).await {
        Ok(0) => {}
        Ok(n) => tracing::info!(flushed = n, "flushed leftover tracked messages"),
        Err(e) => tracing::error!(error = %e, "startup reaper flush failed"),
    }

    tokio::spawn(
        reaper
            .clone()
            .run_loop(deleter.clone(), Duration::from_secs(REAP_INTERVAL_SECS)),
    );

    {
        let flow_state = flow_state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(FLOW_SWEEP_SECS));
            loop {
                interval.tick().await;
                let swept = flow_state.sweep_expired_flows(None);
                if swept > 0 {
                    tracing::debug!(swept, "expired idle flow sessions");
                }
            }
        });
    }

    let _watcher = if no_watch {
        tracing::info!("service source watcher disabled (--no-watch)");
        None
    } else {
        match SourceWatcher::start(config.services_root.clone(), store.clone(), builder.clone()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::warn!(error = %e, "failed to start source watcher, continuing without");
                None
            }
        }
    };

    let app_state = server::AppState {
        store,
        builder,
        dispatcher,
        reaper,
        flow_state,
        groups: Arc::new(crate::groups::GroupTracker::new()),
        events_tx,
    };
    let app = server::create_app(app_state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    println!("Listening on http://{addr}");
    axum::serve(listener, app).await?;

    Ok(())
}

async fn run_gc() -> Result<(), Box<dyn Error>> {
    let config = config::Config::from_env();
    init_tracing();

    let store = Arc::new(Store::open(&config.db_path).context("failed to open database")?);
    let builder = SnapshotBuilder::new(store, config.services_root.clone());

    let pruned = builder.prune_stale_snapshots()?;
    let report = builder.gc_orphan_bundles().await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "prunedSnapshots": pruned,
            "deleted": report.deleted,
            "kept": report.kept,
        }))?
    );
    Ok(())
}
