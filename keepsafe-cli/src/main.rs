//! Keepsafe CLI - a local-first secret store synchronized with a
//! central server.

mod client;
mod session;
mod store;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use keepsafe_core::model::{format_timestamp, CardPayload};
use tracing_subscriber::EnvFilter;

use client::Client;

#[derive(Parser)]
#[command(name = "keepsafe", about = "Local-first secret store with server sync")]
struct Cli {
    /// HTTP address of the server's auth surface
    #[arg(long, default_value = "http://127.0.0.1:8543")]
    server: String,

    /// Address of the server's sync surface
    #[arg(long, default_value = "127.0.0.1:8553")]
    rpc: String,

    /// Path to the local record database
    #[arg(long, default_value = "data/client.db")]
    db: PathBuf,

    /// Directory holding local copies of binary files
    #[arg(long, default_value = "data/client_files")]
    files: PathBuf,

    /// Path to the cached session token
    #[arg(long, default_value = "data/session.json")]
    session: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an account on the server
    Register {
        #[arg(long)]
        username: String,
        /// Password (prompted when omitted)
        #[arg(long)]
        password: Option<String>,
    },

    /// Log in and cache the session token
    Login {
        #[arg(long)]
        username: String,
        /// Password (prompted when omitted)
        #[arg(long)]
        password: Option<String>,
    },

    /// List all local records
    Get,

    /// Store a free-text record
    SaveText {
        #[arg(long)]
        text: String,
        #[arg(long, default_value = "")]
        meta: String,
    },

    /// Store a login/password pair
    SaveCredential {
        #[arg(long)]
        login: String,
        /// Password (prompted when omitted)
        #[arg(long)]
        password: Option<String>,
        #[arg(long, default_value = "")]
        meta: String,
    },

    /// Store payment-card data
    SaveCard {
        /// Card number (13-19 digits)
        #[arg(long)]
        number: String,
        /// Expiration date (MM/YY or MM/YYYY)
        #[arg(long)]
        exp: String,
        /// CVV (3-4 digits)
        #[arg(long)]
        cvv: String,
        /// Card holder name
        #[arg(long)]
        holder: String,
        #[arg(long, default_value = "")]
        meta: String,
    },

    /// Store a binary file
    SaveFile {
        /// Path to the file
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value = "")]
        meta: String,
    },

    /// Remove a record from this device only
    Delete {
        #[arg(long)]
        id: String,
    },

    /// Synchronize records and files with the server
    Sync,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut client = Client::new(
        cli.server,
        cli.rpc,
        &cli.db,
        cli.session,
        cli.files,
    )?;

    match cli.command {
        Commands::Register { username, password } => {
            let password = password_or_prompt(password)?;
            client.register(&username, &password).await?;
            println!("Registration successful");
        }
        Commands::Login { username, password } => {
            let password = password_or_prompt(password)?;
            client.login(&username, &password).await?;
            println!("Login successful. Session saved.");
        }
        Commands::Get => {
            let items = client.list_items()?;
            if items.is_empty() {
                println!("No records found.");
                return Ok(());
            }
            println!("{:<38} {:<12} {:<22} CONTENT", "ID", "TYPE", "UPDATED AT");
            for item in items {
                println!(
                    "{:<38} {:<12} {:<22} {}",
                    item.id,
                    item.kind.as_str(),
                    format_timestamp(item.updated_at),
                    item.content,
                );
            }
        }
        Commands::SaveText { text, meta } => {
            let id = client.save_text(&text, &meta)?;
            println!("Text record saved ({id})");
        }
        Commands::SaveCredential {
            login,
            password,
            meta,
        } => {
            let password = password_or_prompt(password)?;
            let id = client.save_credential(&login, &password, &meta)?;
            println!("Credential record saved ({id})");
        }
        Commands::SaveCard {
            number,
            exp,
            cvv,
            holder,
            meta,
        } => {
            let payload = CardPayload {
                number,
                expiry: exp,
                cvv,
                holder,
            };
            let id = client.save_card(&payload, &meta)?;
            println!("Card record saved ({id})");
        }
        Commands::SaveFile { file, meta } => {
            let id = client.save_file(&file, &meta)?;
            println!("File record saved ({id})");
        }
        Commands::Delete { id } => {
            client.delete_item(&id)?;
            println!("Record deleted");
        }
        Commands::Sync => {
            let summary = client.sync().await?;
            if summary.failed_transfers > 0 {
                println!(
                    "Synchronized {} records ({} uploads, {} downloads, {} transfers failed; they will be retried next sync)",
                    summary.records, summary.uploads, summary.downloads, summary.failed_transfers,
                );
            } else {
                println!(
                    "Synchronized {} records ({} uploads, {} downloads)",
                    summary.records, summary.uploads, summary.downloads,
                );
            }
        }
    }
    Ok(())
}

fn password_or_prompt(password: Option<String>) -> anyhow::Result<String> {
    match password {
        Some(password) => Ok(password),
        None => Ok(rpassword::prompt_password("Password: ")?),
    }
}
