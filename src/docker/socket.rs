//! Daemon socket discovery.
//!
//! The socket path is resolved once per process and cached. Resolution
//! order: `DOCKER_HOST` override, the active docker context, the user's
//! runtime socket, the system socket. The first path that stats wins.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use sha2::{Digest, Sha256};

use crate::errors::DaemonError;

static SOCKET_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Resolve the daemon socket, caching the result process-wide.
pub fn resolve_socket_path() -> Result<PathBuf, DaemonError> {
    if let Some(path) = SOCKET_PATH.get() {
        return Ok(path.clone());
    }
    let resolved = first_existing(candidate_paths()).ok_or(DaemonError::SocketNotFound)?;
    Ok(SOCKET_PATH.get_or_init(|| resolved).clone())
}

fn first_existing(candidates: Vec<PathBuf>) -> Option<PathBuf> {
    candidates.into_iter().find(|p| p.metadata().is_ok())
}

fn candidate_paths() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    if let Ok(host) = std::env::var("DOCKER_HOST") {
        if !host.trim().is_empty() {
            candidates.push(PathBuf::from(strip_unix_prefix(host.trim())));
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let docker_dir = PathBuf::from(&home).join(".docker");
        if let Some(path) = context_socket(&docker_dir) {
            candidates.push(path);
        }
    }

    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        if !runtime_dir.trim().is_empty() {
            candidates.push(PathBuf::from(runtime_dir).join("docker.sock"));
        }
    }

    candidates.push(PathBuf::from("/var/run/docker.sock"));
    candidates
}

/// Resolve the endpoint of the active docker context, if any. The context
/// name selects a metadata file keyed by the sha256 of the name.
fn context_socket(docker_dir: &Path) -> Option<PathBuf> {
    let config: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(docker_dir.join("config.json")).ok()?)
            .ok()?;
    let context = config.get("currentContext")?.as_str()?;
    if context.is_empty() || context == "default" {
        return None;
    }

    let digest = hex::encode(Sha256::digest(context.as_bytes()));
    let meta_path = docker_dir
        .join("contexts")
        .join("meta")
        .join(digest)
        .join("meta.json");
    let meta: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(meta_path).ok()?).ok()?;
    let host = meta
        .get("Endpoints")?
        .get("docker")?
        .get("Host")?
        .as_str()?;
    if !host.starts_with("unix://") {
        return None;
    }
    Some(PathBuf::from(strip_unix_prefix(host)))
}

fn strip_unix_prefix(host: &str) -> &str {
    host.strip_prefix("unix://").unwrap_or(host)
}
