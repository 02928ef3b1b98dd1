//! CRUD handlers over the persisted entities.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use crate::db::models::{ContributionStatus, IssueStatus};

use super::{ApiError, SharedState};

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateRepositoryRequest {
    pub full_name: String,
    pub origin_url: String,
    pub language: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateRepositoryRequest {
    pub origin_url: Option<String>,
    pub language: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateIssueRequest {
    pub repository_id: i64,
    pub number: i64,
    pub title: String,
    pub body: Option<String>,
    pub labels: Option<Vec<String>>,
}

#[derive(Deserialize)]
pub struct UpdateIssueRequest {
    pub title: Option<String>,
    pub body: Option<String>,
    pub labels: Option<Vec<String>>,
    pub ai_fix_prompt: Option<String>,
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub struct IssueListParams {
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub struct UpsertEnvironmentRequest {
    pub runtime: String,
    pub package_manager: String,
    pub setup_command: Option<String>,
    pub test_command: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateAgentRequest {
    pub name: String,
    pub command: String,
}

#[derive(Deserialize)]
pub struct UpdateAgentRequest {
    pub name: Option<String>,
    pub command: Option<String>,
    pub enabled: Option<bool>,
}

#[derive(Deserialize)]
pub struct CreateAgentStateRequest {
    pub agent_run_id: i64,
    pub contribution_id: Option<i64>,
    pub payload: Option<serde_json::Value>,
    pub suspended: Option<bool>,
}

#[derive(Deserialize)]
pub struct UpdateAgentStateRequest {
    pub payload: Option<serde_json::Value>,
    pub suspended: Option<bool>,
    pub contribution_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct AgentStateListParams {
    pub suspended: Option<bool>,
}

#[derive(Deserialize)]
pub struct UpdateContributionRequest {
    pub status: String,
}

#[derive(Deserialize)]
pub struct SetConfigRequest {
    pub value: String,
}

// ── Repositories ──────────────────────────────────────────────────────

pub async fn list_repositories(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let repositories = state.db.call(|db| db.list_repositories()).await?;
    Ok(Json(repositories))
}

pub async fn create_repository(
    State(state): State<SharedState>,
    Json(req): Json<CreateRepositoryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.full_name.split('/').count() != 2 {
        return Err(ApiError::BadRequest(
            "full_name must be owner/name".to_string(),
        ));
    }
    let repository = state
        .db
        .call(move |db| {
            db.create_repository(&req.full_name, &req.origin_url, req.language.as_deref())
        })
        .await?;
    Ok((StatusCode::CREATED, Json(repository)))
}

pub async fn get_repository(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let repository = state
        .db
        .call(move |db| db.get_repository(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Repository {} not found", id)))?;
    Ok(Json(repository))
}

pub async fn update_repository(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateRepositoryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    ensure_exists(&state, move |db| Ok(db.get_repository(id)?.is_some()), "Repository", id)
        .await?;
    let repository = state
        .db
        .call(move |db| db.update_repository(id, req.origin_url.as_deref(), req.language.as_deref()))
        .await?;
    Ok(Json(repository))
}

pub async fn delete_repository(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.db.call(move |db| db.delete_repository(id)).await?;
    if !deleted {
        return Err(ApiError::NotFound(format!("Repository {} not found", id)));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ── Repository environments ───────────────────────────────────────────

pub async fn get_environment(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let environment = state
        .db
        .call(move |db| db.get_environment(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Repository {} has no environment", id)))?;
    Ok(Json(environment))
}

pub async fn upsert_environment(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<UpsertEnvironmentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    ensure_exists(&state, move |db| Ok(db.get_repository(id)?.is_some()), "Repository", id)
        .await?;
    let environment = state
        .db
        .call(move |db| {
            db.upsert_environment(
                id,
                &req.runtime,
                &req.package_manager,
                req.setup_command.as_deref().unwrap_or(""),
                req.test_command.as_deref().unwrap_or(""),
            )
        })
        .await?;
    Ok(Json(environment))
}

// ── Issues ────────────────────────────────────────────────────────────

pub async fn list_issues(
    State(state): State<SharedState>,
    Query(params): Query<IssueListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let status = parse_optional_status::<IssueStatus>(params.status.as_deref())?;
    let issues = state
        .db
        .call(move |db| db.list_issues(status.as_ref()))
        .await?;
    Ok(Json(issues))
}

pub async fn create_issue(
    State(state): State<SharedState>,
    Json(req): Json<CreateIssueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let repo_id = req.repository_id;
    ensure_exists(
        &state,
        move |db| Ok(db.get_repository(repo_id)?.is_some()),
        "Repository",
        repo_id,
    )
    .await?;
    let issue = state
        .db
        .call(move |db| {
            db.create_issue(
                req.repository_id,
                req.number,
                &req.title,
                req.body.as_deref().unwrap_or(""),
                &req.labels.unwrap_or_default(),
            )
        })
        .await
        .map_err(|e| {
            if format!("{:#}", e).contains("UNIQUE") {
                ApiError::Conflict("Issue number already exists for this repository".to_string())
            } else {
                ApiError::from(e)
            }
        })?;
    Ok((StatusCode::CREATED, Json(issue)))
}

pub async fn get_issue(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let issue = state
        .db
        .call(move |db| db.get_issue(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Issue {} not found", id)))?;
    Ok(Json(issue))
}

pub async fn update_issue(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateIssueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    ensure_exists(&state, move |db| Ok(db.get_issue(id)?.is_some()), "Issue", id).await?;
    let status = parse_optional_status::<IssueStatus>(req.status.as_deref())?;
    let issue = state
        .db
        .call(move |db| {
            let issue = db.update_issue(
                id,
                req.title.as_deref(),
                req.body.as_deref(),
                req.labels.as_deref(),
                req.ai_fix_prompt.as_deref(),
            )?;
            match status {
                Some(status) => db.set_issue_status(id, &status),
                None => Ok(issue),
            }
        })
        .await?;
    Ok(Json(issue))
}

pub async fn delete_issue(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.db.call(move |db| db.delete_issue(id)).await?;
    if !deleted {
        return Err(ApiError::NotFound(format!("Issue {} not found", id)));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ── Agents ────────────────────────────────────────────────────────────

pub async fn list_agents(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let agents = state.db.call(|db| db.list_agents()).await?;
    Ok(Json(agents))
}

pub async fn create_agent(
    State(state): State<SharedState>,
    Json(req): Json<CreateAgentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let agent = state
        .db
        .call(move |db| db.create_agent(&req.name, &req.command))
        .await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

pub async fn get_agent(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let agent = state
        .db
        .call(move |db| db.get_agent(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Agent {} not found", id)))?;
    Ok(Json(agent))
}

pub async fn update_agent(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateAgentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    ensure_exists(&state, move |db| Ok(db.get_agent(id)?.is_some()), "Agent", id).await?;
    let agent = state
        .db
        .call(move |db| db.update_agent(id, req.name.as_deref(), req.command.as_deref(), req.enabled))
        .await?;
    Ok(Json(agent))
}

pub async fn delete_agent(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.db.call(move |db| db.delete_agent(id)).await?;
    if !deleted {
        return Err(ApiError::NotFound(format!("Agent {} not found", id)));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ── Agent runs ────────────────────────────────────────────────────────

pub async fn list_agent_runs(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let runs = state.db.call(|db| db.list_agent_runs()).await?;
    Ok(Json(runs))
}

pub async fn get_agent_run(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state
        .db
        .call(move |db| db.get_agent_run(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Agent run {} not found", id)))?;
    Ok(Json(run))
}

pub async fn delete_agent_run(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.db.call(move |db| db.delete_agent_run(id)).await?;
    if !deleted {
        return Err(ApiError::NotFound(format!("Agent run {} not found", id)));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ── Agent states ──────────────────────────────────────────────────────

pub async fn list_agent_states(
    State(state): State<SharedState>,
    Query(params): Query<AgentStateListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let states = state
        .db
        .call(move |db| db.list_agent_states(params.suspended))
        .await?;
    Ok(Json(states))
}

pub async fn create_agent_state(
    State(state): State<SharedState>,
    Json(req): Json<CreateAgentStateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = req.agent_run_id;
    ensure_exists(
        &state,
        move |db| Ok(db.get_agent_run(run_id)?.is_some()),
        "Agent run",
        run_id,
    )
    .await?;
    let agent_state = state
        .db
        .call(move |db| {
            db.create_agent_state(
                req.agent_run_id,
                req.contribution_id,
                &req.payload.unwrap_or_else(|| serde_json::json!({})),
                req.suspended.unwrap_or(false),
            )
        })
        .await?;
    Ok((StatusCode::CREATED, Json(agent_state)))
}

pub async fn get_agent_state(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let agent_state = state
        .db
        .call(move |db| db.get_agent_state(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Agent state {} not found", id)))?;
    Ok(Json(agent_state))
}

pub async fn update_agent_state(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateAgentStateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    ensure_exists(&state, move |db| Ok(db.get_agent_state(id)?.is_some()), "Agent state", id)
        .await?;
    let agent_state = state
        .db
        .call(move |db| {
            db.update_agent_state(id, req.payload.as_ref(), req.suspended, req.contribution_id)
        })
        .await?;
    Ok(Json(agent_state))
}

pub async fn delete_agent_state(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.db.call(move |db| db.delete_agent_state(id)).await?;
    if !deleted {
        return Err(ApiError::NotFound(format!("Agent state {} not found", id)));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ── Contributions ─────────────────────────────────────────────────────

pub async fn list_contributions(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let contributions = state.db.call(|db| db.list_contributions()).await?;
    Ok(Json(contributions))
}

pub async fn get_contribution(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let contribution = state
        .db
        .call(move |db| db.get_contribution(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Contribution {} not found", id)))?;
    Ok(Json(contribution))
}

pub async fn update_contribution(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateContributionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    ensure_exists(&state, move |db| Ok(db.get_contribution(id)?.is_some()), "Contribution", id)
        .await?;
    let status: ContributionStatus = req
        .status
        .parse()
        .map_err(|e: String| ApiError::BadRequest(e))?;
    let contribution = state
        .db
        .call(move |db| db.update_contribution_status(id, &status))
        .await?;
    Ok(Json(contribution))
}

pub async fn delete_contribution(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.db.call(move |db| db.delete_contribution(id)).await?;
    if !deleted {
        return Err(ApiError::NotFound(format!("Contribution {} not found", id)));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ── Config ────────────────────────────────────────────────────────────

pub async fn list_config(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let entries = state.db.call(|db| db.list_config()).await?;
    Ok(Json(entries))
}

pub async fn get_config(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = key.clone();
    let value = state
        .db
        .call(move |db| db.get_config(&lookup))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Config key {} not found", key)))?;
    Ok(Json(serde_json::json!({"key": key, "value": value})))
}

pub async fn set_config(
    State(state): State<SharedState>,
    Path(key): Path<String>,
    Json(req): Json<SetConfigRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let stored_key = key.clone();
    state
        .db
        .call(move |db| db.set_config(&stored_key, &req.value))
        .await?;
    Ok(Json(serde_json::json!({"key": key, "updated": true})))
}

pub async fn delete_config(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.db.call(move |db| db.delete_config(&key)).await?;
    if !deleted {
        return Err(ApiError::NotFound("Config key not found".to_string()));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ── Helpers ───────────────────────────────────────────────────────────

fn parse_optional_status<T: std::str::FromStr<Err = String>>(
    status: Option<&str>,
) -> Result<Option<T>, ApiError> {
    match status {
        Some(text) => text
            .parse::<T>()
            .map(Some)
            .map_err(ApiError::BadRequest),
        None => Ok(None),
    }
}

async fn ensure_exists<F>(
    state: &SharedState,
    check: F,
    entity: &str,
    id: i64,
) -> Result<(), ApiError>
where
    F: FnOnce(&crate::db::UcoderDb) -> anyhow::Result<bool> + Send + 'static,
{
    let exists = state.db.call(check).await?;
    if !exists {
        return Err(ApiError::NotFound(format!("{} {} not found", entity, id)));
    }
    Ok(())
}
