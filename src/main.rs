//! Headless entry point.
//!
//! Two subcommands: `init` migrates a database, `serve` runs the loopback
//! HTTP sidecar. Each invocation prints one JSON object on stdout and
//! exits 0 on success, 1 on any error; diagnostics go to stderr via
//! `tracing`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use agrafes::config::{self, Config};
use agrafes::sidecar::{run_sidecar, SidecarOptions};
use agrafes::{db, migrate};

#[derive(Parser)]
#[command(
    name = "agrafes",
    about = "Agrafes — a local-first multilingual corpus search and alignment engine",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or migrate the corpus database
    Init {
        /// Path to the database file
        #[arg(long)]
        db: PathBuf,
    },

    /// Run the loopback HTTP sidecar
    Serve {
        /// Path to the database file
        #[arg(long)]
        db: PathBuf,

        /// Bind host (loopback only)
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Bind port; 0 asks the OS for a free port
        #[arg(long, default_value_t = 0)]
        port: u16,

        /// Token mode: off, auto, or an explicit token value
        #[arg(long, default_value = "off")]
        token: String,

        /// Optional engine tuning file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db } => {
            let pool = db::connect(&db).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!(
                "{}",
                serde_json::json!({ "status": "ok", "db_path": db.display().to_string() })
            );
        }
        Commands::Serve {
            db,
            host,
            port,
            token,
            config: config_path,
        } => {
            let config = match config_path {
                Some(path) => config::load_config(&path)?,
                None => Config::default(),
            };
            run_sidecar(SidecarOptions {
                db_path: db,
                host,
                port,
                token_mode: token,
                config,
            })
            .await?;
        }
    }

    Ok(())
}
