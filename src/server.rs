//! Server assembly: store, runner, router, lifecycle.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::api::{api_router, AppState, SharedState};
use crate::config::Config;
use crate::db::{DbHandle, UcoderDb};
use crate::llm::{CompletionClient, OpenRouterClient};
use crate::runner::WorkspaceRunner;

pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: crate::config::DEFAULT_PORT,
            db_path: PathBuf::from(".ucoder/ucoder.db"),
            dev_mode: false,
        }
    }
}

/// Placeholder completion client used when no RPC key is configured;
/// spawns fail at synthesis with an actionable message instead of at
/// startup.
struct UnconfiguredCompletions;

#[async_trait::async_trait]
impl CompletionClient for UnconfiguredCompletions {
    async fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
        anyhow::bail!("OPENROUTER_API_KEY is not configured")
    }
}

pub fn build_router(state: SharedState) -> Router {
    api_router().with_state(state)
}

pub async fn start_server(server_config: ServerConfig) -> Result<()> {
    if let Some(parent) = server_config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = DbHandle::new(
        UcoderDb::new(&server_config.db_path).context("Failed to initialize database")?,
    );

    let mut config = Config::from_env();
    config.port = server_config.port;

    let completions: Arc<dyn CompletionClient> = match &config.completion_api_key {
        Some(key) => Arc::new(OpenRouterClient::new(key.clone())),
        None => {
            eprintln!("[server] OPENROUTER_API_KEY not set; spawns will fail at synthesis");
            Arc::new(UnconfiguredCompletions)
        }
    };

    let runner = Arc::new(WorkspaceRunner::new(
        db.clone(),
        completions,
        config.clone(),
    ));

    // Non-terminal workspaces from a previous process cannot be resumed;
    // settle them before accepting traffic.
    if let Err(e) = runner.reconcile_startup().await {
        eprintln!("[server] startup reconciliation failed: {:#}", e);
    }

    let state = Arc::new(AppState {
        db,
        config,
        runner: Arc::clone(&runner),
    });

    let mut app = build_router(state);
    if server_config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if server_config.dev_mode {
        "0.0.0.0"
    } else {
        "127.0.0.1"
    };
    let addr = format!("{}:{}", host, server_config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    println!("ucoder listening on http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Stop any in-flight workspace containers before exiting.
    runner.shutdown().await;
    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    println!("\nShutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.port, crate::config::DEFAULT_PORT);
        assert_eq!(config.db_path, PathBuf::from(".ucoder/ucoder.db"));
        assert!(!config.dev_mode);
    }

    #[tokio::test]
    async fn test_unconfigured_completions_bails() {
        let err = UnconfiguredCompletions
            .complete("system", "prompt")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("OPENROUTER_API_KEY"));
    }
}
