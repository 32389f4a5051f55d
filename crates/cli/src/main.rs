use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use heatgrid_api::{Config, Pipeline};
use heatgrid_core::{ShardKey, SpatialIndex, SubmitRequest};
use heatgrid_dispatch::{LocalBus, Transport};
use heatgrid_persist::{LastStateStore, SqliteStore};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "heatgridctl", version, about = "Heatgrid CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// JSON config file (built-in defaults when omitted)
    #[arg(long = "config", global = true, env = "HEATGRID_CONFIG")]
    config: Option<PathBuf>,

    /// Serve Prometheus metrics on this address while the command runs
    #[arg(long = "metrics-addr", global = true, env = "HEATGRID_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a sample batch file (`{"geo_data": [...]}`) for a user
    Submit {
        /// User the samples belong to
        #[arg(long = "user")]
        user: String,
        /// Path to the JSON payload
        file: PathBuf,
    },
    /// Show the recorded last state of a user
    State {
        #[arg(long = "user")]
        user: String,
    },
    /// Show cell, shard key and channel for a coordinate
    Locate {
        #[arg(allow_negative_numbers = true)]
        lon: f64,
        #[arg(allow_negative_numbers = true)]
        lat: f64,
    },
}

/// Logs go to stderr so `-o json` output on stdout stays machine-readable.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("HEATGRID_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn init_metrics(addr: SocketAddr) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("starting metrics exporter on {addr}"))?;
    info!(%addr, "serving prometheus metrics");
    Ok(())
}

fn open_store(cfg: &Config) -> Result<SqliteStore> {
    match cfg.db_path.as_deref() {
        Some(p) => SqliteStore::open(p),
        None => SqliteStore::open_default(),
    }
}

/// In-process bus. With the bus transport every configured channel plus the default
/// gets a loopback acknowledger, so submissions complete without external shards.
fn local_bus(cfg: &Config) -> Result<Arc<LocalBus>> {
    let bus = Arc::new(LocalBus::default());
    if cfg.dispatch.transport == Transport::Bus {
        let table = cfg.shard_table();
        for id in &cfg.shards {
            bus.spawn_acknowledger(table.channel_for(ShardKey(*id)))?;
        }
        bus.spawn_acknowledger(table.default_channel())?;
    }
    Ok(bus)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    if let Some(addr) = cli.metrics_addr {
        init_metrics(addr)?;
    }
    let cfg = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Submit { user, file } => {
            info!(user = %user, file = %file.display(), "submit invoked");
            let body = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let req = SubmitRequest::from_json(&body).with_context(|| format!("parsing {}", file.display()))?;
            let store = Arc::new(open_store(&cfg)?);
            let pipeline = Pipeline::from_config(&cfg, store, local_bus(&cfg)?)?;
            match pipeline.submit(&user, &req.geo_data).await {
                Ok(receipt) => match cli.output {
                    Output::Human => println!(
                        "submission {} • {} ops • {} shards",
                        receipt.submission, receipt.ops, receipt.shards
                    ),
                    Output::Json => println!("{}", serde_json::to_string_pretty(&receipt)?),
                },
                Err(e) => {
                    error!(error = %e, status = e.status_code(), "submit failed");
                    eprintln!("submit error ({}): {}", e.status_code(), e);
                    std::process::exit(if e.is_client_error() { 2 } else { 1 });
                }
            }
        }
        Commands::State { user } => {
            let store = open_store(&cfg)?;
            let state = store.get(&user)?;
            match cli.output {
                Output::Human => match state {
                    Some(s) => println!("{} • cell {} • {:?}", s.user_id, s.cell, s.category),
                    None => println!("{} • no recorded state", user),
                },
                Output::Json => println!("{}", serde_json::to_string_pretty(&state)?),
            }
        }
        Commands::Locate { lon, lat } => {
            let index = cfg.spatial_index()?;
            let cell = index.cell_of(lon, lat)?;
            let shard = index.shard_key_of(cell);
            let table = cfg.shard_table();
            let channel = table.channel_for(shard);
            match cli.output {
                Output::Human => println!("cell {} • shard {} • {}", cell, shard, channel),
                Output::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "cell": cell,
                        "shard": shard,
                        "channel": channel,
                        "mapped": table.is_mapped(shard),
                    }))?
                ),
            }
        }
    }
    Ok(())
}
