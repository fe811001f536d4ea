use clap::{Parser, Subcommand};
use node::auth::TokenVerifier;
use node::bus::{CommandBus, LoggingMiddleware};
use node::config::{self, BuildInfo, Settings};
use node::connection;
use node::db;
use node::participant::ParticipantService;
use node::pubsub::{NatsParticipantClient, ParticipantClient};
use node::registry::ConnectionRegistry;
use node::repo::{SqlMessageRepository, SqlParticipantRepository};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "node", about = "A chat fabric node")]
struct Cli {
    /// Path to the build information file.
    #[arg(long, default_value = config::DEFAULT_APPLICATION_PATH)]
    application: PathBuf,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Accept client connections and route messages (default).
    Run,
    /// Apply pending SQL migrations and exit.
    Migrate,
    /// Revert the most recent SQL migration and exit.
    Rollback,
}

#[tokio::main]
async fn main() -> ExitCode {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let cli = Cli::parse();
    let build = match BuildInfo::load(&cli.application) {
        Ok(build) => build,
        Err(error) => {
            error!(%error, "failed to load build information");
            return ExitCode::FAILURE;
        }
    };
    let settings = match config::load_settings(&build).await {
        Ok(settings) => settings,
        Err(error) => {
            error!(%error, "failed to load settings");
            return ExitCode::FAILURE;
        }
    };

    match cli.command.unwrap_or(Command::Run) {
        Command::Migrate => migrate(&settings).await,
        Command::Rollback => rollback(&settings).await,
        Command::Run => run(&build, settings).await,
    }
}

async fn migrate(settings: &Settings) -> ExitCode {
    info!(uri = %settings.database.uri, "running migrations");
    let pool = match db::create_pool(&settings.database.uri).await {
        Ok(pool) => pool,
        Err(error) => {
            error!(%error, "failed to connect to the database");
            return ExitCode::FAILURE;
        }
    };
    match db::run_migrations(&pool).await {
        Ok(()) => {
            info!("migrations applied");
            ExitCode::SUCCESS
        }
        Err(error) => {
            error!(%error, "migration failed");
            ExitCode::FAILURE
        }
    }
}

async fn rollback(settings: &Settings) -> ExitCode {
    info!(uri = %settings.database.uri, "rolling back the latest migration");
    let pool = match db::create_pool(&settings.database.uri).await {
        Ok(pool) => pool,
        Err(error) => {
            error!(%error, "failed to connect to the database");
            return ExitCode::FAILURE;
        }
    };
    match db::rollback_last(&pool).await {
        Ok(()) => {
            info!("rollback complete");
            ExitCode::SUCCESS
        }
        Err(error) => {
            error!(%error, "rollback failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(build: &BuildInfo, settings: Settings) -> ExitCode {
    info!(
        name = %build.name,
        version = %build.version,
        environment = %build.environment,
        commit = %build.commit_hash,
        "starting node"
    );
    let settings = Arc::new(settings);

    let verifier = match TokenVerifier::from_pem_file(&settings.token_key) {
        Ok(verifier) => Arc::new(verifier),
        Err(error) => {
            error!(%error, "failed to load the token key");
            return ExitCode::FAILURE;
        }
    };

    let pool = match db::create_pool(&settings.database.uri).await {
        Ok(pool) => pool,
        Err(error) => {
            error!(%error, "failed to connect to the database");
            return ExitCode::FAILURE;
        }
    };
    if let Err(error) = db::run_migrations(&pool).await {
        error!(%error, "failed to run database migrations");
        return ExitCode::FAILURE;
    }
    info!("migrations applied");

    let bus = Arc::new(CommandBus::new(vec![Box::new(LoggingMiddleware)]));
    let registry = Arc::new(ConnectionRegistry::new(verifier));
    if let Err(error) = registry.wire(&bus) {
        error!(%error, "failed to wire the registry onto the command bus");
        return ExitCode::FAILURE;
    }

    let client: Arc<dyn ParticipantClient> = Arc::new(NatsParticipantClient::new(
        settings.nats.clone(),
        settings.node.clone(),
    ));
    let service = ParticipantService::new(
        Arc::clone(&settings),
        Arc::clone(&bus),
        Arc::new(SqlParticipantRepository::new(pool.clone())),
        Arc::new(SqlMessageRepository::new(pool.clone())),
        Arc::clone(&client),
    );
    service.wire();

    {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            if let Err(error) = client.start_up().await {
                error!(%error, "bus start-up failed");
            }
        });
    }

    let bind_addr = format!("0.0.0.0:{}", settings.port);
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(error) => {
            error!(%error, addr = %bind_addr, "failed to bind");
            return ExitCode::FAILURE;
        }
    };
    info!(addr = %bind_addr, node = %settings.node, "node listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let serving = tokio::spawn(connection::serve(listener, registry, service, shutdown_rx));

    shutdown_signal().await;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = serving.await;
    if let Err(error) = client.shutdown().await {
        warn!(%error, "bus shutdown reported an error");
    }
    info!("node shut down gracefully");
    ExitCode::SUCCESS
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
