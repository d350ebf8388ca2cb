use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};

use order_pipeline as pipeline;
use pipeline::services::{DbCartSource, SettlementSignal};
use pipeline::workers::{self, EventBus};

#[derive(Parser)]
#[command(name = "order-pipeline", about = "Checkout, order commit and outbox relay service", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API (and the background workers unless disabled)
    Serve {
        /// Do not start background workers in this process
        #[arg(long)]
        no_workers: bool,
    },
    /// Apply pending database migrations and exit
    Migrate,
    /// Run only the background workers
    Workers,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = pipeline::config::load_config().context("failed to load configuration")?;
    pipeline::config::init_tracing(&cfg.log_level, cfg.log_json);

    let db_pool = pipeline::db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to the database")?;

    let command = cli.command.unwrap_or(Command::Serve { no_workers: false });
    if let Command::Migrate = command {
        pipeline::db::run_migrations(&db_pool)
            .await
            .context("failed running migrations")?;
        info!("migrations applied");
        return Ok(());
    }

    if cfg.auto_migrate {
        pipeline::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }

    let db_arc = Arc::new(db_pool);
    let bus = EventBus::from_config(&cfg.publisher)
        .await
        .context("failed to initialise the event publisher")?;
    let (settlement, settlement_rx) = SettlementSignal::channel(1024);
    let gateway = Arc::new(
        pipeline::gateway::RazorpayGateway::new(&cfg.payment)
            .context("failed to build the payment gateway client")?,
    );
    let cart = Arc::new(DbCartSource::new(db_arc.clone()));
    let state = pipeline::AppState::new(db_arc, cfg.clone(), cart, gateway, settlement);

    match command {
        Command::Workers => {
            let worker_set = workers::spawn_all(&state, &bus, settlement_rx);
            shutdown_signal().await;
            info!("shutdown requested");
            worker_set.shutdown().await;
        }
        Command::Serve { no_workers } => {
            let worker_set = if cfg.run_workers && !no_workers {
                Some(workers::spawn_all(&state, &bus, settlement_rx))
            } else {
                info!("background workers disabled for this process");
                None
            };

            let app = pipeline::app_router(state);
            let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
                .parse()
                .context("invalid listen address")?;
            info!("order-pipeline listening on http://{}", addr);
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            if let Some(worker_set) = worker_set {
                worker_set.shutdown().await;
            }
        }
        Command::Migrate => {}
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
