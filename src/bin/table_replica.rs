use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use url::Url;

use tablesync::config::{RealtimeConfig, ReplicaConfig};
use tablesync::pubsub::RealtimePubSub;
use tablesync::replica::{ReplicaEvent, ReplicaManager};

const LOG_TARGET: &str = "bin::table_replica";
const DEFAULT_STORAGE_ROOT: &str = "./data";

#[derive(Debug, Parser)]
#[command(name = "table_replica")]
#[command(about = "Run durable per-table replicas fed by the realtime broadcast bus", long_about = None)]
struct Args {
    /// Realtime websocket URL of the broadcast bus
    #[arg(long, env = "REPLICA_REALTIME_URL")]
    realtime_url: String,

    /// API key for realtime websocket auth
    #[arg(long, env = "REPLICA_API_KEY")]
    api_key: String,

    /// Directory holding the `room-follower/` replica files
    #[arg(long, env = "REPLICA_STORAGE_ROOT", default_value = DEFAULT_STORAGE_ROOT)]
    storage_root: PathBuf,

    /// Table ids to replicate (comma separated)
    #[arg(long, env = "REPLICA_TABLES", value_delimiter = ',', required = true)]
    tables: Vec<String>,

    /// Restarts allowed per replica before it is given up
    #[arg(long, env = "REPLICA_MAX_RESTARTS")]
    max_restarts: Option<u32>,

    /// Toggle structured (JSON) logs
    #[arg(long, env = "REPLICA_LOG_JSON", default_value_t = false)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();
    let args = Args::parse();
    init_tracing(args.json)?;
    run(args).await
}

fn load_dotenv() {
    let manifest_env_path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(".env");
    dotenv::from_filename(manifest_env_path).ok();
    dotenv::dotenv().ok();
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt::fmt().with_env_filter(filter).with_target(false);

    if json {
        builder.json().flatten_event(true).init();
    } else {
        builder.compact().init();
    }

    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let realtime_url = Url::parse(&args.realtime_url).context("invalid REPLICA_REALTIME_URL")?;
    let mut replica_cfg = ReplicaConfig::new(args.storage_root.clone());
    if let Some(max_restarts) = args.max_restarts {
        replica_cfg.max_restarts = max_restarts;
    }

    let stop = CancellationToken::new();
    let (bus, bus_task) =
        RealtimePubSub::spawn(RealtimeConfig::new(realtime_url, args.api_key), stop.clone());
    let manager = Arc::new(ReplicaManager::with_file_store(replica_cfg, bus));

    let mut events = manager.events();
    for table in args.tables.iter().filter(|table| !table.is_empty()) {
        manager.start(table);
    }
    info!(
        target: LOG_TARGET,
        tables = ?manager.tables(),
        storage_root = %args.storage_root.display(),
        "replicas started"
    );

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                info!(target: LOG_TARGET, "shutdown requested");
                break;
            }
            event = events.recv() => match event {
                Ok(ReplicaEvent::Restarted { table_id, attempt, reason }) => {
                    warn!(
                        target: LOG_TARGET,
                        table = %table_id,
                        attempt,
                        %reason,
                        "replica restarted; authority should push a snapshot"
                    );
                }
                Ok(ReplicaEvent::Failed { table_id, reason }) => {
                    error!(target: LOG_TARGET, table = %table_id, %reason, "replica gave up");
                    if let Err(err) = manager.stop(&table_id).await {
                        warn!(target: LOG_TARGET, table = %table_id, error = %err, "replica ended with error");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: LOG_TARGET, skipped, "missed replica events");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    manager.shutdown().await;
    stop.cancel();
    bus_task
        .await
        .context("realtime task panicked")?
        .context("realtime pub/sub failed")?;
    info!(target: LOG_TARGET, "table replica stopped");
    Ok(())
}
