//! Workspace endpoints: spawn, destroy, logs, PR lookup, and reads.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::db::models::WorkspaceStatus;
use crate::runner::logs::{find_pr_url, pr_number_from_url};

use super::{ApiError, SharedState};

#[derive(Deserialize)]
pub struct SpawnRequest {
    pub issue_id: i64,
    pub agent_id: i64,
    pub timeout_minutes: Option<f64>,
}

#[derive(Deserialize)]
pub struct LogParams {
    pub after_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct WorkspaceListParams {
    pub status: Option<String>,
}

#[derive(Serialize)]
pub struct PrInfo {
    pub pr_url: Option<String>,
    pub pr_number: Option<i64>,
    pub branch_name: String,
    pub source: Option<&'static str>,
}

/// Provision inline (synthesize, build, start), then detach the agent
/// execution. The response is the workspace row in `running`; failures
/// surface as errors while the failed row stays queryable.
pub async fn spawn_workspace(
    State(state): State<SharedState>,
    Json(req): Json<SpawnRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(timeout) = req.timeout_minutes {
        if !(timeout > 0.0) {
            return Err(ApiError::BadRequest(
                "timeout_minutes must be positive".to_string(),
            ));
        }
    }
    let workspace = state
        .runner
        .provision(req.issue_id, req.agent_id, req.timeout_minutes)
        .await?;
    std::sync::Arc::clone(&state.runner).spawn_execution(workspace.clone());
    Ok((StatusCode::CREATED, Json(workspace)))
}

pub async fn list_workspaces(
    State(state): State<SharedState>,
    Query(params): Query<WorkspaceListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match params.status.as_deref() {
        Some(text) => Some(
            text.parse::<WorkspaceStatus>()
                .map_err(ApiError::BadRequest)?,
        ),
        None => None,
    };
    let workspaces = state
        .db
        .call(move |db| db.list_workspaces(status.as_ref()))
        .await?;
    Ok(Json(workspaces))
}

pub async fn get_workspace(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let workspace = state
        .db
        .call(move |db| db.get_workspace(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Workspace {} not found", id)))?;
    Ok(Json(workspace))
}

/// Idempotent cancel/teardown. Non-terminal workspaces transition to
/// `cancelled` and their issue returns to `open`; already-terminal
/// workspaces only get their container cleaned up.
pub async fn destroy_workspace(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let workspace = state
        .runner
        .cancel(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Workspace {} not found", id)))?;
    Ok(Json(workspace))
}

pub async fn delete_workspace(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let existing = state.db.call(move |db| db.get_workspace(id)).await?;
    let Some(existing) = existing else {
        return Err(ApiError::NotFound(format!("Workspace {} not found", id)));
    };
    if !existing.status.is_terminal() {
        return Err(ApiError::Conflict(
            "Workspace is still active; destroy it first".to_string(),
        ));
    }
    state.db.call(move |db| db.delete_workspace(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Ordered log rows with id strictly greater than `after_id`.
pub async fn get_workspace_logs(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(params): Query<LogParams>,
) -> Result<impl IntoResponse, ApiError> {
    let exists = state
        .db
        .call(move |db| Ok(db.get_workspace(id)?.is_some()))
        .await?;
    if !exists {
        return Err(ApiError::NotFound(format!("Workspace {} not found", id)));
    }
    let logs = state
        .db
        .call(move |db| db.list_workspace_logs(id, params.after_id))
        .await?;
    Ok(Json(logs))
}

/// PR lookup with fallback: the workspace column, then a grep of this
/// workspace's logs, then the issue's contribution.
pub async fn get_workspace_pr(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let workspace = state
        .db
        .call(move |db| db.get_workspace(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Workspace {} not found", id)))?;

    if let Some(url) = workspace.pr_url.clone() {
        return Ok(Json(PrInfo {
            pr_number: pr_number_from_url(&url),
            pr_url: Some(url),
            branch_name: workspace.branch_name,
            source: Some("workspace"),
        }));
    }

    let candidates = state
        .db
        .call(move |db| db.recent_log_lines_containing(id, "/pull/", 50))
        .await?;
    if let Some(url) = candidates.iter().find_map(|line| find_pr_url(line)) {
        return Ok(Json(PrInfo {
            pr_number: pr_number_from_url(&url),
            pr_url: Some(url),
            branch_name: workspace.branch_name,
            source: Some("logs"),
        }));
    }

    let issue_id = workspace.issue_id;
    let contribution = state
        .db
        .call(move |db| db.get_contribution_by_issue(issue_id))
        .await?;
    if let Some(contribution) = contribution {
        if contribution.pr_url.is_some() {
            return Ok(Json(PrInfo {
                pr_url: contribution.pr_url,
                pr_number: contribution.pr_number,
                branch_name: workspace.branch_name,
                source: Some("contribution"),
            }));
        }
    }

    Ok(Json(PrInfo {
        pr_url: None,
        pr_number: None,
        branch_name: workspace.branch_name,
        source: None,
    }))
}
