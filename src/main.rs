use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use ucoder::server::{start_server, ServerConfig};

#[derive(Parser)]
#[command(name = "ucoder")]
#[command(version, about = "Issue-to-PR automation server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator HTTP server
    Serve {
        /// Bind port (defaults to UCODER_PORT or 8321)
        #[arg(short, long)]
        port: Option<u16>,

        /// SQLite database path
        #[arg(long, default_value = ".ucoder/ucoder.db")]
        db: PathBuf,

        /// Bind on all interfaces and allow cross-origin requests
        #[arg(long)]
        dev: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { port, db, dev } => {
            let env_port = std::env::var("UCODER_PORT")
                .ok()
                .and_then(|v| v.parse::<u16>().ok());
            let config = ServerConfig {
                port: port
                    .or(env_port)
                    .unwrap_or(ucoder::config::DEFAULT_PORT),
                db_path: db,
                dev_mode: dev,
            };
            start_server(config).await
        }
    }
}
