//! HTTP control surface.
//!
//! Thin axum handlers over the store plus the three orchestration entry
//! points: spawn (inline provision + detached execution), destroy, and the
//! provider webhook endpoint.

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use crate::config::Config;
use crate::db::DbHandle;
use crate::errors::SpawnError;
use crate::runner::WorkspaceRunner;

pub mod crud;
pub mod webhooks;
pub mod workspaces;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub config: Config,
    pub runner: Arc<WorkspaceRunner>,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unauthorized(String),
    /// Downstream failure (daemon, synthesis) surfaced from spawn.
    UpstreamFailed(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::UpstreamFailed(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{:#}", err))
    }
}

impl From<SpawnError> for ApiError {
    fn from(err: SpawnError) -> Self {
        match &err {
            SpawnError::IssueNotFound(_)
            | SpawnError::AgentNotFound(_)
            | SpawnError::RepositoryNotFound(_) => ApiError::NotFound(err.to_string()),
            SpawnError::EnvironmentMissing(_) | SpawnError::ConcurrencyLimit(_) => {
                ApiError::Conflict(err.to_string())
            }
            SpawnError::BuildFailed(_) | SpawnError::ContainerCrashed(_) => {
                ApiError::UpstreamFailed(err.to_string())
            }
            SpawnError::Other(inner) => ApiError::Internal(format!("{:#}", inner)),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        // Workspaces and orchestration
        .route("/workspaces", get(workspaces::list_workspaces))
        .route("/workspaces/spawn", post(workspaces::spawn_workspace))
        .route(
            "/workspaces/:id",
            get(workspaces::get_workspace).delete(workspaces::delete_workspace),
        )
        .route("/workspaces/:id/destroy", post(workspaces::destroy_workspace))
        .route("/workspaces/:id/logs", get(workspaces::get_workspace_logs))
        .route("/workspaces/:id/pr", get(workspaces::get_workspace_pr))
        // Provider events
        .route("/webhooks/github", post(webhooks::github_webhook))
        .route("/webhooks", get(webhooks::list_webhooks))
        .route("/webhooks/:id", get(webhooks::get_webhook).delete(webhooks::delete_webhook))
        // Entity CRUD
        .route(
            "/repositories",
            get(crud::list_repositories).post(crud::create_repository),
        )
        .route(
            "/repositories/:id",
            get(crud::get_repository)
                .patch(crud::update_repository)
                .delete(crud::delete_repository),
        )
        .route(
            "/repositories/:id/environment",
            get(crud::get_environment).put(crud::upsert_environment),
        )
        .route("/issues", get(crud::list_issues).post(crud::create_issue))
        .route(
            "/issues/:id",
            get(crud::get_issue)
                .patch(crud::update_issue)
                .delete(crud::delete_issue),
        )
        .route("/agents", get(crud::list_agents).post(crud::create_agent))
        .route(
            "/agents/:id",
            get(crud::get_agent)
                .patch(crud::update_agent)
                .delete(crud::delete_agent),
        )
        .route("/agent-runs", get(crud::list_agent_runs))
        .route(
            "/agent-runs/:id",
            get(crud::get_agent_run).delete(crud::delete_agent_run),
        )
        .route(
            "/agent-states",
            get(crud::list_agent_states).post(crud::create_agent_state),
        )
        .route(
            "/agent-states/:id",
            get(crud::get_agent_state)
                .patch(crud::update_agent_state)
                .delete(crud::delete_agent_state),
        )
        .route("/contributions", get(crud::list_contributions))
        .route(
            "/contributions/:id",
            get(crud::get_contribution)
                .patch(crud::update_contribution)
                .delete(crud::delete_contribution),
        )
        .route("/config", get(crud::list_config))
        .route(
            "/config/:key",
            get(crud::get_config)
                .put(crud::set_config)
                .delete(crud::delete_config),
        )
}

async fn health_check() -> &'static str {
    "ok"
}

// ── Test support ──────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod testsupport {
    use super::*;
    use crate::db::UcoderDb;
    use crate::llm::CompletionClient;
    use anyhow::Result;
    use async_trait::async_trait;

    struct NoCompletions;

    #[async_trait]
    impl CompletionClient for NoCompletions {
        async fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
            anyhow::bail!("completions not expected in router tests")
        }
    }

    pub fn test_state() -> SharedState {
        test_state_with_secret(None)
    }

    pub fn test_state_with_secret(webhook_secret: Option<&str>) -> SharedState {
        let db = DbHandle::new(UcoderDb::new_in_memory().unwrap());
        let mut config = Config::from_env();
        config.webhook_secret = webhook_secret.map(str::to_string);
        // Daemon socket pointed at nothing: router tests never reach it.
        let runner = WorkspaceRunner::new(db.clone(), Arc::new(NoCompletions), config.clone())
            .with_daemon_socket(std::env::temp_dir().join("ucoder-test-absent.sock"));
        Arc::new(AppState {
            db,
            config,
            runner: Arc::new(runner),
        })
    }

    pub fn test_router(state: SharedState) -> Router {
        api_router().with_state(state)
    }
}

#[cfg(test)]
mod tests {
    use super::testsupport::{test_router, test_state};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health() {
        let app = test_router(test_state());
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = test_router(test_state());
        let req = Request::builder()
            .uri("/nope")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
