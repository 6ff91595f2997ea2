//! Keepsafe Server
//!
//! Hosts the HTTP auth surface (registration, login) and the framed RPC
//! surface (record sync, chunked file transfer) over one storage layer.

use clap::Parser;
use keepsafe_core::TokenAuthority;
use keepsafe_server::config::ServerConfig;
use keepsafe_server::files::FileStore;
use keepsafe_server::rpc::RpcServer;
use keepsafe_server::server::{build_router, AppState};
use keepsafe_server::storage::Storage;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keepsafe-server", about = "Keepsafe sync server")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "keepsafe.toml")]
    config: PathBuf,

    /// HTTP listen address override
    #[arg(long)]
    http: Option<String>,

    /// RPC listen address override
    #[arg(long)]
    rpc: Option<String>,

    /// Database path override
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// File storage root override
    #[arg(short, long)]
    files: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    let mut cfg = if cli.config.exists() {
        ServerConfig::load(&cli.config)?
    } else {
        tracing::info!("No config file found, using defaults");
        ServerConfig::default()
    };

    if let Some(http) = cli.http {
        cfg.http_addr = http;
    }
    if let Some(rpc) = cli.rpc {
        cfg.rpc_addr = rpc;
    }
    if let Some(database) = cli.database {
        cfg.db_path = database;
    }
    if let Some(files) = cli.files {
        cfg.file_root = files;
    }

    let storage = Storage::open(&cfg.db_path)?;
    let tokens = TokenAuthority::new(cfg.token_secret.as_bytes(), cfg.token_ttl_secs);
    let files = FileStore::new(&cfg.file_root)?;

    let app = build_router(
        AppState {
            storage: storage.clone(),
            tokens: tokens.clone(),
        },
        &cfg,
    );
    let http_listener = tokio::net::TcpListener::bind(&cfg.http_addr).await?;
    tracing::info!("HTTP listening on {}", cfg.http_addr);

    let rpc = RpcServer::new(storage, tokens, files);
    let rpc_listener = tokio::net::TcpListener::bind(&cfg.rpc_addr).await?;
    tracing::info!("RPC listening on {}", cfg.rpc_addr);

    tokio::try_join!(
        async { axum::serve(http_listener, app).await.map_err(anyhow::Error::from) },
        rpc.serve(rpc_listener),
    )?;

    Ok(())
}
