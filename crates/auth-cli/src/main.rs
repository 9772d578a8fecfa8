//! Keyward CLI - sign in, refresh tokens and link third-party accounts.

mod commands;
mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use client_config::{init_logging, Config, Paths};
use output::OutputFormat;
use tracing::debug;

/// Keyward CLI - manage the locally stored session.
#[derive(Parser)]
#[command(name = "keyward")]
#[command(about = "Keyward CLI for authentication and account linking")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(short, long, default_value = "text", global = true)]
    format: OutputFormat,

    /// Log level (trace, debug, info, warn, error). Defaults to the configured level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Base directory for config, logs and the credential file. Defaults to ~/.keyward
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the stored session against the backend
    Status,

    /// Exchange an identity provider token for a session
    SignIn {
        /// ID token from the identity provider
        #[arg(long, env = "KEYWARD_ID_TOKEN", hide_env_values = true)]
        id_token: String,
    },

    /// Sign out and clear stored credentials
    SignOut,

    /// Refresh the access token
    Refresh {
        /// Start a new refresh even if one is in flight
        #[arg(long)]
        force: bool,
    },

    /// Send an authenticated GET request and print the response
    Get {
        /// Path relative to the API base URL
        path: String,
    },

    /// Link third-party accounts
    Link {
        #[command(subcommand)]
        command: LinkCommands,
    },
}

#[derive(Subcommand)]
enum LinkCommands {
    /// Start linking a provider and print the consent URL
    Start {
        /// Provider name (e.g. github, gmail)
        provider: String,
    },
    /// Finish linking with the values from the provider callback
    Complete {
        /// Provider name
        provider: String,
        /// `state` parameter from the callback
        #[arg(long)]
        state: String,
        /// `code` parameter from the callback
        #[arg(long)]
        code: String,
    },
    /// Check whether a link attempt is waiting for its callback
    Pending {
        /// Provider name
        provider: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let format = cli.format;

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e), &format);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    let config = Config::load(&paths)?;

    let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    init_logging("keyward", level, &paths);
    debug!(base_dir = %paths.base_dir().display(), "Loaded configuration");

    let client = commands::build_client(&config, &paths)?;
    let format = cli.format;

    match cli.command {
        Commands::Status => commands::status(&client, &format).await,
        Commands::SignIn { id_token } => commands::sign_in(&client, &id_token, &format).await,
        Commands::SignOut => commands::sign_out(&client, &format).await,
        Commands::Refresh { force } => commands::refresh(&client, force, &format).await,
        Commands::Get { path } => commands::get(&client, &path, &format).await,
        Commands::Link { command } => match command {
            LinkCommands::Start { provider } => {
                commands::link_start(&client, &provider, &format).await
            }
            LinkCommands::Complete {
                provider,
                state,
                code,
            } => commands::link_complete(&client, &provider, &state, &code, &format).await,
            LinkCommands::Pending { provider } => {
                commands::link_pending(&client, &provider, &format)
            }
        },
    }
}
