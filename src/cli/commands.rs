//! CLI commands

use std::io::Write;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;

use crate::app::AppState;
use crate::config::Config;
use crate::db::{CreditRepository, Database};
use crate::server::{ErrorBody, GenerateBody, GenerationServer, StopResponse};
use crate::session::StatusView;

#[derive(Parser)]
#[command(name = "genflight")]
#[command(about = "Single-flight coordinator for streaming AI generation sessions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (default: ~/.genflight/config.yml)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Server base URL for client commands (default: from config)
    #[arg(long, global = true)]
    server: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the generation server
    Serve {
        /// Port number (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Start a generation and print the streamed response
    Generate {
        /// Resource (application) ID
        resource_id: String,

        /// Credit account to charge
        #[arg(long)]
        owner: String,

        /// Message to send
        #[arg(long)]
        message: String,
    },

    /// Ask the running generation for a resource to stop
    Stop {
        /// Resource (application) ID
        resource_id: String,
    },

    /// Show the session state for a resource
    Status {
        /// Resource (application) ID
        resource_id: String,
    },

    /// Manage credit balances in the SQLite ledger
    Credits {
        #[command(subcommand)]
        command: CreditCommands,
    },
}

#[derive(Subcommand)]
enum CreditCommands {
    /// Add credits to an account
    Grant {
        owner: String,
        amount: u64,
    },

    /// Show an account's balance and history
    Balance {
        owner: String,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let server_url = cli
        .server
        .clone()
        .unwrap_or_else(|| config.server.base_url());

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        match cli.command {
            Commands::Serve { port } => {
                let mut config = config;
                if let Some(port) = port {
                    config.server.port = port;
                }
                let addr = config.server.addr();
                let state = AppState::from_config(config)?;

                let server = GenerationServer::new(addr, state.coordinator);
                server.run().await
            }

            Commands::Generate {
                resource_id,
                owner,
                message,
            } => generate(&server_url, &resource_id, owner, message).await,

            Commands::Stop { resource_id } => {
                let url = format!("{}/apps/{}/stop", server_url, resource_id);
                let response: StopResponse = reqwest::Client::new()
                    .post(&url)
                    .send()
                    .await
                    .context("Failed to reach generation server")?
                    .json()
                    .await?;

                if response.stopped {
                    println!("Stop requested for {}", resource_id);
                } else {
                    println!("No running generation for {}", resource_id);
                }
                Ok(())
            }

            Commands::Status { resource_id } => {
                let url = format!("{}/apps/{}/status", server_url, resource_id);
                let view: StatusView = reqwest::get(&url)
                    .await
                    .context("Failed to reach generation server")?
                    .json()
                    .await?;

                match view.error_reason {
                    Some(reason) => println!("{}: {} ({})", view.resource_id, view.state, reason),
                    None => println!("{}: {}", view.resource_id, view.state),
                }
                Ok(())
            }

            Commands::Credits { command } => {
                let db = Database::new(config.ledger.resolve_db_path()?)?;
                let credits = CreditRepository::new(db);

                match command {
                    CreditCommands::Grant { owner, amount } => {
                        credits.grant(&owner, amount).await?;
                        let balance = credits.balance(&owner).await?.unwrap_or(0);
                        println!("Granted {} credits to {} (balance {})", amount, owner, balance);
                    }
                    CreditCommands::Balance { owner } => {
                        match credits.balance(&owner).await? {
                            Some(balance) => println!("{}: {} credits", owner, balance),
                            None => println!("{}: no account", owner),
                        }
                        for event in credits.events(&owner).await? {
                            println!(
                                "  {} {:>8} {}",
                                event.created_at.format("%Y-%m-%d %H:%M:%S"),
                                event.kind.as_str(),
                                event.amount
                            );
                        }
                    }
                }
                Ok(())
            }
        }
    })
}

async fn generate(server_url: &str, resource_id: &str, owner: String, message: String) -> Result<()> {
    let url = format!("{}/apps/{}/generate", server_url, resource_id);
    let response = reqwest::Client::new()
        .post(&url)
        .json(&GenerateBody {
            owner_id: owner,
            message,
        })
        .send()
        .await
        .context("Failed to reach generation server")?;

    let status = response.status();
    if !status.is_success() {
        let error: ErrorBody = response.json().await.context("Unexpected error response")?;
        anyhow::bail!("{} ({}): {}", error.error, status.as_u16(), error.message);
    }

    let mut body = response.bytes_stream();
    let mut stdout = std::io::stdout();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("Stream interrupted")?;
        stdout.write_all(&chunk)?;
        stdout.flush()?;
    }
    println!();
    Ok(())
}
