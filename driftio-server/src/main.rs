mod config;
mod server;
mod store_sqlite;
mod transfer_http;

use clap::{Parser, Subcommand};
use config::Config;
use driftio_core::{HttpRemoteLog, StatusStore, SyncDeps, ZoneDataSync};
use server::{run_server, ServerState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use store_sqlite::SqliteStore;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "driftio")]
#[command(about = "Asynchronous replication engine for multi-zone object storage")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the replication engine and admin API
    Start {
        /// Path to configuration file
        #[arg(long = "conf", default_value = "driftio.yaml")]
        conf: String,
    },
}

const ENGINE_RESTART_DELAY: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "driftio=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { conf } => {
            tracing::info!("starting driftio with config: {}", conf);

            let cfg = match Config::from_file(&conf) {
                Ok(cfg) => cfg,
                Err(error) => {
                    tracing::error!("failed to load config: {}", error);
                    std::process::exit(1);
                }
            };

            if let Err(error) = run(cfg).await {
                tracing::error!("server error: {}", error);
                std::process::exit(1);
            }
        }
    }
}

async fn run(cfg: Config) -> driftio_core::Result<()> {
    let store = Arc::new(SqliteStore::new(cfg.store.path.clone())?);
    let status = StatusStore::new(store);
    let client = reqwest::Client::new();
    let transfer = Arc::new(transfer_http::HttpTransfer::new(
        client.clone(),
        cfg.transfer.endpoint.clone(),
    ));

    let mut zones = HashMap::new();
    for source in &cfg.sources {
        let deps = SyncDeps {
            remote: Arc::new(HttpRemoteLog::new(client.clone(), source.endpoint.clone())),
            status: status.clone(),
            transfer: transfer.clone(),
        };
        let zone = Arc::new(ZoneDataSync::new(deps, source.name.clone()));
        zones.insert(source.name.clone(), zone.clone());

        tracing::info!(
            "replicating zone {} -> {} from {}",
            source.name,
            cfg.zone,
            source.endpoint
        );

        tokio::spawn(async move {
            loop {
                if let Err(error) = zone.run().await {
                    tracing::error!(
                        "data sync for zone {} stopped: {}",
                        zone.source_zone(),
                        error
                    );
                }
                tokio::time::sleep(ENGINE_RESTART_DELAY).await;
            }
        });
    }

    let state = Arc::new(ServerState { zones });
    run_server(state, &cfg.bind_addr).await
}
