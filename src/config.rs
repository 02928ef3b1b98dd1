//! Process configuration, read once at startup from the environment.

use std::path::PathBuf;

/// Environment-derived configuration shared across the server.
///
/// Secrets are optional at startup: a missing webhook secret fails webhook
/// verification with 500, a missing completion key fails spawn at synthesis
/// time. This keeps `serve` usable for read-only inspection without any
/// credentials configured.
#[derive(Debug, Clone)]
pub struct Config {
    /// Provider token injected into workspace containers (`GITHUB_TOKEN`).
    pub github_token: Option<String>,
    /// Shared secret for webhook HMAC verification (`GITHUB_WEBHOOK_SECRET`).
    pub webhook_secret: Option<String>,
    /// Key for the text-completion RPC (`OPENROUTER_API_KEY`).
    pub completion_api_key: Option<String>,
    /// Key for the external issue-extraction RPC (`EXTRACTOR_API_KEY`).
    pub extractor_api_key: Option<String>,
    /// HTTP bind port (`UCODER_PORT`, overridden by `--port`).
    pub port: u16,
    /// Operator SSH key bind-mounted read-only into containers.
    pub ssh_key_path: PathBuf,
    /// Coding-agent auth file bind-mounted read-only into containers.
    pub agent_auth_path: PathBuf,
    /// Coding-agent config directory bind-mounted read-only into containers.
    pub agent_config_dir: PathBuf,
}

pub const DEFAULT_PORT: u16 = 8321;

impl Config {
    pub fn from_env() -> Self {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/root"));

        let port = std::env::var("UCODER_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);

        Self {
            github_token: non_empty_env("GITHUB_TOKEN"),
            webhook_secret: non_empty_env("GITHUB_WEBHOOK_SECRET"),
            completion_api_key: non_empty_env("OPENROUTER_API_KEY"),
            extractor_api_key: non_empty_env("EXTRACTOR_API_KEY"),
            port,
            ssh_key_path: home.join(".ssh/id_ed25519"),
            agent_auth_path: home.join(".claude.json"),
            agent_config_dir: home.join(".claude"),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}
