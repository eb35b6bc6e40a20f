//! bountyhall - a command-line client for the textile sourcing marketplace.
//!
//! Log in with a phone verification code, browse bounties, place and
//! withdraw bids, and search. Expired tokens are refreshed transparently;
//! if the refresh fails the stored session is wiped and the command exits
//! with an error.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use bountyhall_core::api::client::DEFAULT_PAGE_SIZE;
use bountyhall_core::api::{AuthGateway, MarketClient, ReqwestTransport, SearchParams};
use bountyhall_core::{Config, CredentialStore};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "bountyhall", version, about = "Textile sourcing marketplace client")]
struct Args {
    /// Override the API base URL
    #[arg(long, global = true, env = "BOUNTYHALL_API_BASE")]
    api_base: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Request a login verification code
    SendCode { phone: String },
    /// Log in (or register) with a verification code
    Login { phone: String, code: String },
    /// Forget the stored session
    Logout,
    /// Show the stored identity
    Whoami,
    /// List open bounties
    Bounties {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        page_size: u32,
    },
    /// Show one bounty
    Bounty { id: u64 },
    /// List bids on a bounty
    Bids {
        bounty_id: u64,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        page_size: u32,
    },
    /// List your own bids
    MyBids {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 50)]
        page_size: u32,
    },
    /// Place a bid from a JSON document
    Bid { json: String },
    /// Withdraw a bid
    DeleteBid { id: String },
    /// Search bounties
    Search {
        query: String,
        #[arg(long, default_value = "bounty")]
        index: String,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        size: u32,
    },
    /// Upload a business license for recognition
    UploadLicense { path: PathBuf },
}

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    init_tracing();

    let args = Args::parse();
    // Saved as loaded; the override only applies to this run
    let mut config = Config::load()?;
    let effective = config.with_api_base(args.api_base.as_deref());

    let session_ended = Arc::new(AtomicBool::new(false));
    let flag = session_ended.clone();

    let transport = ReqwestTransport::with_timeout(effective.request_timeout())?;
    let credentials = CredentialStore::new(effective.storage_backend()?);
    let gateway = AuthGateway::builder(Arc::new(transport), credentials, effective.refresh_url())
        .on_session_invalid(move || {
            warn!("Session is no longer valid");
            flag.store(true, Ordering::SeqCst);
        })
        .build();
    let client = MarketClient::new(gateway, effective.api_base.clone());

    let result = run(&client, &mut config, args.command).await;

    if session_ended.load(Ordering::SeqCst) {
        eprintln!("Your session has expired. Run `bountyhall send-code` and `bountyhall login` again.");
        std::process::exit(2);
    }
    result
}

async fn run(client: &MarketClient, config: &mut Config, command: Commands) -> Result<()> {
    match command {
        Commands::SendCode { phone } => {
            let message = client.send_code(&phone).await?;
            config.last_phone = Some(phone);
            config.save()?;
            println!("{}", message.unwrap_or_else(|| "Verification code sent".to_string()));
        }
        Commands::Login { phone, code } => {
            let outcome = client.verify_code(&phone, &code).await?;
            config.last_phone = Some(phone);
            config.save()?;
            info!("Login complete");
            print_json(&outcome)?;
        }
        Commands::Logout => {
            client.logout()?;
            println!("Logged out");
        }
        Commands::Whoami => {
            let mut record = client.gateway().credentials().snapshot()?;
            // Never echo the token itself
            record.token = record.token.map(|_| "<present>".to_string());
            print_json(&record)?;
        }
        Commands::Bounties { page, page_size } => {
            print_json(&client.list_bounties(page, page_size).await?)?;
        }
        Commands::Bounty { id } => {
            print_json(&client.bounty_detail(id).await?)?;
        }
        Commands::Bids {
            bounty_id,
            page,
            page_size,
        } => {
            print_json(&client.list_bids(bounty_id, page, page_size).await?)?;
        }
        Commands::MyBids {
            status,
            page,
            page_size,
        } => {
            print_json(&client.my_bids(status.as_deref(), page, page_size).await?)?;
        }
        Commands::Bid { json } => {
            let bid: Value = serde_json::from_str(&json).context("Bid must be a JSON object")?;
            print_json(&client.place_bid(&bid).await?)?;
        }
        Commands::DeleteBid { id } => {
            client.delete_bid(&id).await?;
            println!("Deleted bid {}", id);
        }
        Commands::Search {
            query,
            index,
            page,
            size,
        } => {
            let params = SearchParams {
                index,
                page,
                size,
                ..SearchParams::query(query)
            };
            print_json(&client.search(&params).await?)?;
        }
        Commands::UploadLicense { path } => {
            let data = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "license".to_string());
            print_json(&client.recognize_license(&file_name, data).await?)?;
        }
    }
    Ok(())
}
