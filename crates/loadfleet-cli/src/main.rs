mod config;

use clap::{Parser, Subcommand};
use config::LoadfleetConfig;
use loadfleet_coordinator::{Coordinator, CoordinatorClient, CoordinatorOptions, FileEndpointSource, ReqOpts};
use loadfleet_core::{CollectionId, PlanId};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "loadfleet", about = "loadfleet: distributed load-test orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "loadfleet.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the per-project coordinator
    Coordinator {
        /// Address to bind to (overrides config and env)
        #[arg(long)]
        listen: Option<String>,
    },
    /// Report an engine's running state to its coordinator
    Report {
        /// Coordinator address or base URL
        #[arg(long)]
        coordinator: String,
        #[arg(long)]
        collection: CollectionId,
        #[arg(long)]
        plan: PlanId,
        /// Engine ordinal within the plan
        #[arg(long)]
        engine: u32,
        #[arg(long, action = clap::ArgAction::Set)]
        running: bool,
        /// Bearer key (defaults to the configured api_key)
        #[arg(long)]
        api_key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut config = LoadfleetConfig::load(&cli.config).await?;
    config.coordinator.apply_env(|key| std::env::var(key).ok());

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.coordinator.log_filter())),
        )
        .json()
        .init();

    match cli.command {
        Commands::Coordinator { listen } => {
            let cfg = config.coordinator;
            let addr = listen.unwrap_or_else(|| cfg.listen_addr.clone());
            let project_id = cfg.project_id()?;
            let acceptor = cfg.tls.acceptor().await?;

            let options = CoordinatorOptions {
                project_id,
                api_key: cfg.api_key.clone(),
                files_root: cfg.files_root.clone(),
                inventory_interval: cfg.inventory_interval(),
            };
            let source = Arc::new(FileEndpointSource::new(cfg.endpoints_file.clone()));
            let coordinator = Coordinator::new(options, source)?;
            if cfg.api_key.is_empty() {
                tracing::warn!("No api_key configured; control API is unauthenticated");
            }

            let shutdown = CancellationToken::new();
            let inventory = coordinator.spawn_inventory(shutdown.clone());
            let app = coordinator.router();
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!(
                project_id,
                namespace = %cfg.namespace,
                files_root = %cfg.files_root.display(),
                "Starting loadfleet coordinator on {addr}"
            );

            if let Some(acceptor) = acceptor {
                info!("loadfleet coordinator listening on {addr} (TLS enabled)");
                loop {
                    let (stream, peer_addr) = tokio::select! {
                        accepted = listener.accept() => accepted?,
                        _ = tokio::signal::ctrl_c() => break,
                    };
                    let acceptor = acceptor.clone();
                    let app = app.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(stream).await {
                            Ok(tls_stream) => {
                                let io = hyper_util::rt::TokioIo::new(tls_stream);
                                let svc = hyper_util::service::TowerToHyperService::new(app);
                                let conn = hyper_util::server::conn::auto::Builder::new(
                                    hyper_util::rt::TokioExecutor::new(),
                                );
                                if let Err(e) = conn.serve_connection_with_upgrades(io, svc).await {
                                    tracing::error!(
                                        peer = %peer_addr,
                                        error = %e,
                                        "TLS connection error"
                                    );
                                }
                            }
                            Err(e) => {
                                tracing::warn!(
                                    peer = %peer_addr,
                                    error = %e,
                                    "TLS handshake failed"
                                );
                            }
                        }
                    });
                }
            } else {
                info!("loadfleet coordinator listening on {addr}");
                axum::serve(listener, app)
                    .with_graceful_shutdown(async {
                        let _ = tokio::signal::ctrl_c().await;
                    })
                    .await?;
            }

            shutdown.cancel();
            inventory.await?;
            info!("loadfleet coordinator stopped");
        }
        Commands::Report {
            coordinator,
            collection,
            plan,
            engine,
            running,
            api_key,
        } => {
            let ro = ReqOpts::new(
                coordinator,
                api_key.unwrap_or(config.coordinator.api_key),
            );
            CoordinatorClient::new()?
                .report_progress(&ro, collection, plan, engine, running)
                .await?;
            info!(collection, plan, engine, running, "Engine state reported");
        }
    }

    Ok(())
}
