use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use mentor::server::{ServerConfig, start_server};

#[derive(Parser)]
#[command(name = "mentor")]
#[command(version, about = "Reflective coaching session service")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coaching API server
    Serve {
        /// Port to serve on
        #[arg(short, long, default_value = "4280")]
        port: u16,

        /// Path to the SQLite session database
        #[arg(long, default_value = ".mentor/sessions.db")]
        db: PathBuf,

        /// Enable permissive CORS for local UI development
        #[arg(long)]
        dev: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "mentor=debug" } else { "mentor=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Serve { port, db, dev } => {
            start_server(ServerConfig {
                port,
                db_path: db,
                dev_mode: dev,
            })
            .await
        }
    }
}
