mod access;
mod config;
mod error;
mod proxy;
mod server;

use clap::{Parser, Subcommand};
use crate::config::{Config, Environment};
use server::run_server;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use vellum_core::VellumError;

#[derive(Parser)]
#[command(name = "vellum")]
#[command(about = "Signed-URL blob storage with a crash-consistent metadata index")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Server {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },
    /// Print a signed URL path for offline distribution
    Sign {
        /// Path to sign, e.g. /blob/cats/tom.png
        path: String,

        /// Expiry as unix seconds; omit for a perpetual signature
        #[arg(long)]
        expire: Option<i64>,

        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },
}

impl Commands {
    fn config_path(&self) -> Option<&str> {
        match self {
            Commands::Server { config } | Commands::Sign { config, .. } => config.as_deref(),
        }
    }
}

fn init_tracing(environment: Environment) {
    let default_filter = match environment {
        Environment::Development => "vellum=debug,tower_http=debug",
        Environment::Production => "vellum=info,tower_http=info",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let loaded = Config::load(cli.command.config_path());
    init_tracing(
        loaded
            .as_ref()
            .map(|config| config.environment)
            .unwrap_or_default(),
    );

    let cfg = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Server { config } => {
            tracing::info!(
                "Starting Vellum server with config: {}",
                config.as_deref().unwrap_or("<environment>")
            );
            tracing::info!(
                "Environment: {:?}, Upload root: {:?}, Index: {:?}",
                cfg.environment,
                cfg.storage.upload_root,
                cfg.storage.index_dir
            );

            if let Err(e) = run_server(cfg).await {
                match e {
                    VellumError::LockContention(path) => tracing::error!(
                        "Metadata index {} is held by another process, refusing to start",
                        path
                    ),
                    other => tracing::error!("Server error: {}", other),
                }
                std::process::exit(1);
            }
        }
        Commands::Sign { path, expire, .. } => {
            let expiry = match expire {
                Some(seconds) => match chrono::DateTime::from_timestamp(seconds, 0) {
                    Some(at) => Some(at),
                    None => {
                        tracing::error!("Expiry {} is out of range", seconds);
                        std::process::exit(1);
                    }
                },
                None => None,
            };
            println!("{}", access::signed_path(&cfg.signer(), &path, expiry));
        }
    }
}
