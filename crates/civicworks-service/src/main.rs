use civicworks_adapters::HttpEscrowConfig;
use civicworks_core::{OrchestratorConfig, StorageConfig};
use civicworks_service::{build_router, EscrowConfig, ServiceConfig, ServiceState};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EscrowMode {
    Auto,
    Http,
    Mock,
    Off,
}

#[derive(Debug, Parser)]
#[command(name = "civicworksd", version, about = "CivicWorks work-order REST service")]
struct Cli {
    /// Socket address to bind, e.g. 127.0.0.1:8080
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,
    /// Storage backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "CIVICWORKS_STORAGE")]
    storage: StorageMode,
    /// PostgreSQL url for work-order and report persistence.
    #[arg(long, env = "CIVICWORKS_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "CIVICWORKS_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Escrow provider mode. `auto` picks http when a base url is configured,
    /// falling back to the in-process mock provider.
    #[arg(long, value_enum, default_value_t = EscrowMode::Auto, env = "CIVICWORKS_ESCROW")]
    escrow: EscrowMode,
    /// Escrow provider origin, e.g. https://escrow.example
    #[arg(long, env = "CIVICWORKS_ESCROW_BASE_URL")]
    escrow_base_url: Option<String>,
    /// API key for the escrow provider.
    #[arg(long, env = "CIVICWORKS_ESCROW_API_KEY")]
    escrow_api_key: Option<String>,
    /// Escrow request timeout in seconds.
    #[arg(long, default_value_t = 5, env = "CIVICWORKS_ESCROW_TIMEOUT_SECS")]
    escrow_timeout_secs: u64,
}

fn resolve_storage(cli: &Cli) -> anyhow::Result<StorageConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.storage {
        StorageMode::Memory => StorageConfig::Memory,
        StorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL")
            })?;
            StorageConfig::postgres(database_url, cli.pg_max_connections)
        }
        StorageMode::Auto => match resolved_url {
            Some(database_url) => StorageConfig::postgres(database_url, cli.pg_max_connections),
            None => StorageConfig::Memory,
        },
    };

    Ok(storage)
}

fn resolve_escrow(cli: &Cli) -> anyhow::Result<EscrowConfig> {
    let http_config = || -> anyhow::Result<HttpEscrowConfig> {
        let base_url = cli
            .escrow_base_url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("escrow=http requires --escrow-base-url"))?;
        let api_key = cli
            .escrow_api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("escrow=http requires --escrow-api-key"))?;
        Ok(HttpEscrowConfig::new(base_url, api_key)
            .with_timeout(Duration::from_secs(cli.escrow_timeout_secs)))
    };

    let escrow = match cli.escrow {
        EscrowMode::Http => EscrowConfig::Http(http_config()?),
        EscrowMode::Mock => EscrowConfig::Mock,
        EscrowMode::Off => EscrowConfig::Disabled,
        EscrowMode::Auto => {
            if cli.escrow_base_url.is_some() {
                EscrowConfig::Http(http_config()?)
            } else {
                EscrowConfig::Mock
            }
        }
    };

    Ok(escrow)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "civicworks_service=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let config = ServiceConfig {
        storage: resolve_storage(&cli)?,
        escrow: resolve_escrow(&cli)?,
        orchestrator: OrchestratorConfig::default(),
    };

    let state = ServiceState::bootstrap(config).await?;
    let app = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(
        storage = state.storage.backend_label(),
        escrow = state.orchestrator.escrow_provider(),
        "civicworks-service listening on {}",
        listener.local_addr()?
    );

    axum::serve(listener, app).await?;
    Ok(())
}
