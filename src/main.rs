//! Token Keeper CLI
//!
//! Manages Login with Amazon tokens for Amazon Advertising API accounts.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use token_keeper::Config;

#[derive(Parser)]
#[command(name = "token-keeper")]
#[command(about = "OAuth2 credential keeper for Amazon Advertising API accounts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Account identity the tokens belong to
    #[arg(short, long, global = true, default_value = "default")]
    account: String,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the consent URL that yields an authorization code
    AuthUrl,

    /// Exchange an authorization code for tokens
    Login {
        /// Code from the redirect after consent
        #[arg(short, long)]
        code: String,
    },

    /// Print a valid access token, refreshing it first if needed
    Token,

    /// Print Advertising API request headers
    Headers,

    /// Refresh the access token now
    Refresh,

    /// Store a refresh token obtained elsewhere
    Seed {
        #[arg(long)]
        refresh_token: String,
    },

    /// Show token state as JSON
    Status,

    /// Log out and delete stored tokens
    Logout,

    /// Keep the token fresh in the foreground until Ctrl-C
    Watch {
        /// Longest pause between checks, in seconds
        #[arg(short, long, default_value = "60")]
        interval: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = Config::load()?;
    let account = cli.account.as_str();

    match cli.command {
        Commands::AuthUrl => {
            commands::auth_url(&config)?;
        }
        Commands::Login { code } => {
            tracing::info!("Exchanging authorization code...");
            commands::login(&config, account, &code).await?;
        }
        Commands::Token => {
            commands::token(&config, account).await?;
        }
        Commands::Headers => {
            commands::headers(&config, account).await?;
        }
        Commands::Refresh => {
            commands::refresh(&config, account).await?;
        }
        Commands::Seed { refresh_token } => {
            commands::seed(&config, account, &refresh_token).await?;
        }
        Commands::Status => {
            commands::status(&config, account).await?;
        }
        Commands::Logout => {
            tracing::info!("Logging out...");
            commands::logout(&config, account).await?;
        }
        Commands::Watch { interval } => {
            commands::watch(&config, account, interval).await?;
        }
    }

    Ok(())
}
