//! Typed error hierarchy for the workspace orchestrator.
//!
//! Three top-level enums cover the three failure domains:
//! - `DaemonError`: container daemon protocol failures
//! - `SynthesisError`: recipe generation failures
//! - `SpawnError`: workspace provisioning failures surfaced to the API

use thiserror::Error;

/// Errors from the container daemon client.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("No container daemon socket found (tried DOCKER_HOST, docker context, runtime and system sockets)")]
    SocketNotFound,

    #[error("Daemon transport error on {path}: {source}")]
    Transport {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Daemon request {path} timed out after {seconds}s")]
    Timeout { path: String, seconds: u64 },

    #[error("Daemon returned {status} for {path}: {message}")]
    Api {
        status: u16,
        path: String,
        message: String,
    },

    #[error("Image build failed: {message}")]
    Build {
        message: String,
        /// Tail of the build progress stream, for diagnostics.
        progress: Vec<String>,
    },

    #[error("Protocol error on {path}: {message}")]
    Protocol { path: String, message: String },
}

impl DaemonError {
    pub fn transport(path: &str, source: std::io::Error) -> Self {
        Self::Transport {
            path: path.to_string(),
            source,
        }
    }

    pub fn protocol(path: &str, message: impl Into<String>) -> Self {
        Self::Protocol {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

/// Errors from recipe synthesis.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("Completion RPC failed: {0}")]
    Completion(String),

    #[error("Generated recipe is invalid: {0}")]
    InvalidRecipe(String),

    #[error("Recipe synthesis exhausted {attempts} attempts; last error: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// Errors raised while provisioning a workspace (the inline part of spawn).
/// Each variant maps to a workspace terminal status and a structured
/// `error_message` blob persisted on the row before the error is re-raised
/// to the HTTP caller.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Issue {0} not found")]
    IssueNotFound(i64),

    #[error("Agent {0} not found")]
    AgentNotFound(i64),

    #[error("Repository {0} not found")]
    RepositoryNotFound(i64),

    #[error("Repository {0} has no extracted environment; run extraction first")]
    EnvironmentMissing(String),

    #[error("Concurrent agent limit ({0}) reached")]
    ConcurrencyLimit(i64),

    #[error("Workspace build failed: {0}")]
    BuildFailed(String),

    #[error("Container failed to start: {0}")]
    ContainerCrashed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_api_error_carries_status_and_path() {
        let err = DaemonError::Api {
            status: 404,
            path: "/containers/abc/json".to_string(),
            message: "No such container".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("404"));
        assert!(text.contains("/containers/abc/json"));
        assert!(text.contains("No such container"));
    }

    #[test]
    fn daemon_build_error_keeps_progress_tail() {
        let err = DaemonError::Build {
            message: "unknown instruction: FRMO".to_string(),
            progress: vec!["Step 1/9 : FROM node:20".to_string()],
        };
        match &err {
            DaemonError::Build { progress, .. } => assert_eq!(progress.len(), 1),
            _ => panic!("Expected Build variant"),
        }
    }

    #[test]
    fn synthesis_exhausted_carries_attempts() {
        let err = SynthesisError::Exhausted {
            attempts: 3,
            last_error: "no FROM line".to_string(),
        };
        assert!(err.to_string().contains("3 attempts"));
        assert!(err.to_string().contains("no FROM line"));
    }

    #[test]
    fn spawn_error_variants_are_matchable() {
        assert!(matches!(
            SpawnError::IssueNotFound(42),
            SpawnError::IssueNotFound(42)
        ));
        assert!(matches!(
            SpawnError::ConcurrencyLimit(3),
            SpawnError::ConcurrencyLimit(3)
        ));
    }

    #[test]
    fn all_error_types_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&DaemonError::SocketNotFound);
        assert_std_error(&SynthesisError::Completion("x".into()));
        assert_std_error(&SpawnError::IssueNotFound(1));
    }
}
