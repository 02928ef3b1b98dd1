//! Workspace runner: drives one workspace from `pending` to a terminal
//! state.
//!
//! The inline half (`provision`) synthesizes a recipe, builds the image and
//! starts the container before the spawn request returns; the detached half
//! (`execute`) runs the coding agent, ingests its output and settles the
//! contribution. Cancellation force-removes the container and lets the
//! runner observe the resulting stream EOF.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::db::models::{
    Agent, AgentRunStatus, Contribution, ContributionStatus, Issue, IssueStatus, LogStream,
    Repository, RepositoryEnvironment, Workspace, WorkspaceStatus,
};
use crate::db::{now_rfc3339, DbHandle};
use crate::docker::{ContainerSpec, DaemonClient, ExecSpec, HostConfig};
use crate::errors::{DaemonError, SpawnError};
use crate::llm::CompletionClient;
use crate::prompt::{build_fix_prompt, PromptInput};
use crate::provider::ProviderCli;
use crate::recipe::{RecipeContext, RecipeSynthesizer, MAX_ATTEMPTS};

pub mod logs;

use logs::{find_pr_url, pr_number_from_url, LineBuffer};

/// In-container path the fix prompt is written to.
const PROMPT_PATH: &str = "/home/agent/fix-prompt.md";
/// Heredoc delimiter for the prompt write.
const PROMPT_DELIMITER: &str = "UCODER_PROMPT_EOF";
/// Lines of log excerpt attached to crash errors.
const CRASH_LOG_EXCERPT: i64 = 20;

/// Structured error persisted into `workspaces.error_message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceFailure {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub details: serde_json::Value,
    pub timestamp: String,
}

impl WorkspaceFailure {
    pub fn new(kind: &str, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
            details,
            timestamp: now_rfc3339(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"type\":\"{}\"}}", self.kind))
    }
}

/// Process-wide registry of in-flight runners, keyed by workspace id.
/// Cancel and shutdown reach containers through it.
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    inner: Arc<tokio::sync::Mutex<HashMap<i64, String>>>,
}

impl RunnerRegistry {
    pub async fn register(&self, workspace_id: i64, container_id: String) {
        self.inner.lock().await.insert(workspace_id, container_id);
    }

    pub async fn unregister(&self, workspace_id: i64) {
        self.inner.lock().await.remove(&workspace_id);
    }

    pub async fn drain(&self) -> Vec<(i64, String)> {
        self.inner.lock().await.drain().collect()
    }
}

pub struct WorkspaceRunner {
    db: DbHandle,
    completions: Arc<dyn CompletionClient>,
    provider: ProviderCli,
    config: Config,
    registry: RunnerRegistry,
    /// Socket override for tests; production resolves via the environment.
    daemon_socket: Option<PathBuf>,
}

impl WorkspaceRunner {
    pub fn new(db: DbHandle, completions: Arc<dyn CompletionClient>, config: Config) -> Self {
        let provider = ProviderCli::new(config.github_token.clone());
        Self {
            db,
            completions,
            provider,
            config,
            registry: RunnerRegistry::default(),
            daemon_socket: None,
        }
    }

    pub fn with_daemon_socket(mut self, socket: PathBuf) -> Self {
        self.daemon_socket = Some(socket);
        self
    }

    fn daemon(&self) -> Result<DaemonClient, DaemonError> {
        match &self.daemon_socket {
            Some(socket) => Ok(DaemonClient::with_socket(socket.clone())),
            None => DaemonClient::from_env(),
        }
    }

    // ── Inline half: provision ────────────────────────────────────────

    /// Steps 1–9 of a workspace run: load rows, ensure fork, detect prior
    /// PR, insert the workspace, synthesize + build, start the container.
    /// Failures after the row exists are persisted into it before the
    /// error is re-raised to the spawn caller.
    pub async fn provision(
        &self,
        issue_id: i64,
        agent_id: i64,
        timeout_minutes: Option<f64>,
    ) -> Result<Workspace, SpawnError> {
        // Existence checks up front; the rows themselves are re-read by the
        // execution phase.
        let (_agent, issue, repository, _environment) =
            self.load_spawn_rows(issue_id, agent_id).await?;

        let (max_concurrent, default_timeout) = self
            .db
            .call(|db| {
                Ok((
                    db.config_i64("max_concurrent_agents", 3)?,
                    db.config_i64("workspace_timeout_minutes", 60)?,
                ))
            })
            .await
            .map_err(SpawnError::Other)?;
        let active = self
            .db
            .call(|db| db.count_active_workspaces())
            .await
            .map_err(SpawnError::Other)?;
        if active >= max_concurrent {
            return Err(SpawnError::ConcurrencyLimit(max_concurrent));
        }
        let timeout_minutes = timeout_minutes.unwrap_or(default_timeout as f64);

        // A prior contribution makes this a re-run; its branch is reused.
        let prior = self
            .db
            .call(move |db| db.get_contribution_by_issue(issue_id))
            .await
            .map_err(SpawnError::Other)?;
        let branch_name = match &prior {
            Some(contribution) => contribution.branch_name.clone(),
            None => format!("fix/issue-{}", issue.number),
        };
        let base_branch = "main".to_string();

        // Fork fields populate lazily on the first spawn.
        let repository = self.ensure_fork(repository).await?;

        // An open PR for this branch is recorded up front (re-run case).
        let existing_pr = match self
            .provider
            .find_open_pr(&repository.full_name, &branch_name)
            .await
        {
            Ok(pr) => pr,
            Err(e) => {
                eprintln!(
                    "[runner] issue {}: open-PR lookup failed, continuing: {:#}",
                    issue_id, e
                );
                None
            }
        };

        let workspace = {
            let branch = branch_name.clone();
            let base = base_branch.clone();
            let repo_id = repository.id;
            self.db
                .call(move |db| {
                    db.create_workspace(
                        agent_id,
                        repo_id,
                        issue_id,
                        &branch,
                        &base,
                        timeout_minutes,
                        &WorkspaceStatus::Building,
                    )
                })
                .await
                .map_err(SpawnError::Other)?
        };
        eprintln!(
            "[runner] workspace {}: building (issue #{}, branch {})",
            workspace.id, issue.number, branch_name
        );

        if let Some(pr) = &existing_pr {
            let ws_id = workspace.id;
            let url = pr.url.clone();
            self.db
                .call(move |db| db.set_workspace_pr_url(ws_id, &url))
                .await
                .map_err(SpawnError::Other)?;
        }

        let ws_id = workspace.id;
        self.db
            .call(move |db| db.set_issue_status(issue_id, &IssueStatus::Fixing).map(|_| ()))
            .await
            .map_err(SpawnError::Other)?;

        // Daemon must answer before anything is built.
        let daemon = match self.daemon() {
            Ok(daemon) => daemon,
            Err(e) => {
                return Err(self
                    .fail_provision(
                        ws_id,
                        issue_id,
                        WorkspaceStatus::BuildFailed,
                        WorkspaceFailure::new(
                            "build_failed",
                            format!("container daemon unavailable: {}", e),
                            serde_json::json!({}),
                        ),
                        SpawnError::BuildFailed(e.to_string()),
                    )
                    .await);
            }
        };
        if let Err(e) = daemon.ping().await {
            return Err(self
                .fail_provision(
                    ws_id,
                    issue_id,
                    WorkspaceStatus::BuildFailed,
                    WorkspaceFailure::new(
                        "build_failed",
                        format!("container daemon unavailable: {}", e),
                        serde_json::json!({}),
                    ),
                    SpawnError::BuildFailed(e.to_string()),
                )
                .await);
        }

        // Synthesize + build, feeding each failure into the next attempt.
        let image_id = match self
            .synthesize_and_build(&daemon, &workspace, &repository)
            .await
        {
            Ok(image_id) => image_id,
            Err((attempt, last_error, recipe, progress)) => {
                let recipe_excerpt: String = recipe.chars().take(2000).collect();
                return Err(self
                    .fail_provision(
                        ws_id,
                        issue_id,
                        WorkspaceStatus::BuildFailed,
                        WorkspaceFailure::new(
                            "build_failed",
                            last_error.clone(),
                            serde_json::json!({
                                "attempt": attempt,
                                "recipe": recipe_excerpt,
                                "progress": progress,
                            }),
                        ),
                        SpawnError::BuildFailed(last_error.clone()),
                    )
                    .await);
            }
        };

        // Create and start the container.
        let spec = self.container_spec(&image_id, ws_id);
        let container_id = match daemon.create_and_start(&spec).await {
            Ok(id) => id,
            Err(e) => {
                return Err(self
                    .fail_provision(
                        ws_id,
                        issue_id,
                        WorkspaceStatus::ContainerCrashed,
                        WorkspaceFailure::new(
                            "container_crashed",
                            format!("container failed to start: {}", e),
                            serde_json::json!({}),
                        ),
                        SpawnError::ContainerCrashed(e.to_string()),
                    )
                    .await);
            }
        };

        {
            let container = container_id.clone();
            self.db
                .call(move |db| {
                    db.set_workspace_container(ws_id, &container)?;
                    db.update_workspace_status(ws_id, &WorkspaceStatus::Running)?;
                    Ok(())
                })
                .await
                .map_err(SpawnError::Other)?;
        }
        self.registry.register(ws_id, container_id).await;
        eprintln!("[runner] workspace {}: running", ws_id);

        let workspace = self
            .db
            .call(move |db| db.get_workspace(ws_id))
            .await
            .map_err(SpawnError::Other)?
            .context("Workspace disappeared after start")
            .map_err(SpawnError::Other)?;
        Ok(workspace)
    }

    async fn load_spawn_rows(
        &self,
        issue_id: i64,
        agent_id: i64,
    ) -> Result<(Agent, Issue, Repository, RepositoryEnvironment), SpawnError> {
        let rows = self
            .db
            .call(move |db| {
                let agent = db.get_agent(agent_id)?;
                let issue = db.get_issue(issue_id)?;
                let repository = match &issue {
                    Some(issue) => db.get_repository(issue.repository_id)?,
                    None => None,
                };
                let environment = match &repository {
                    Some(repo) => db.get_environment(repo.id)?,
                    None => None,
                };
                Ok((agent, issue, repository, environment))
            })
            .await
            .map_err(SpawnError::Other)?;

        let (agent, issue, repository, environment) = rows;
        let agent = agent.ok_or(SpawnError::AgentNotFound(agent_id))?;
        let issue = issue.ok_or(SpawnError::IssueNotFound(issue_id))?;
        let repository = repository.ok_or(SpawnError::RepositoryNotFound(issue.repository_id))?;
        let environment =
            environment.ok_or_else(|| SpawnError::EnvironmentMissing(repository.full_name.clone()))?;
        Ok((agent, issue, repository, environment))
    }

    async fn ensure_fork(&self, repository: Repository) -> Result<Repository, SpawnError> {
        if repository.fork_full_name.is_some() {
            return Ok(repository);
        }
        let (fork_full_name, fork_url) = self
            .provider
            .ensure_fork(&repository.full_name)
            .await
            .map_err(SpawnError::Other)?;
        let repo_id = repository.id;
        self.db
            .call(move |db| db.update_repository_fork(repo_id, &fork_full_name, &fork_url))
            .await
            .map_err(SpawnError::Other)
    }

    /// Up to `MAX_ATTEMPTS` synthesize+build rounds. The error of each
    /// failed round is appended to the next synthesis prompt. On failure
    /// returns (attempt, last error, last recipe, progress tail).
    async fn synthesize_and_build(
        &self,
        daemon: &DaemonClient,
        workspace: &Workspace,
        repository: &Repository,
    ) -> Result<String, (u32, String, String, Vec<String>)> {
        let synthesizer = RecipeSynthesizer::new(self.completions.clone());
        let fork_url = repository
            .fork_url
            .clone()
            .unwrap_or_else(|| format!("https://github.com/{}", repository.full_name));
        let ctx = RecipeContext {
            full_name: &repository.full_name,
            origin_url: &repository.origin_url,
            language: repository.language.as_deref(),
            fork_url: &fork_url,
        };
        let tag = format!(
            "uc-workspace-{}:{}",
            sanitize_image_tag(&repository.full_name),
            workspace.id
        );

        let mut previous_error: Option<String> = None;
        let mut last_recipe = String::new();
        let mut last_progress: Vec<String> = Vec::new();

        for attempt in 1..=MAX_ATTEMPTS {
            let recipe = match synthesizer.synthesize(&ctx, previous_error.as_deref()).await {
                Ok(recipe) => recipe,
                Err(e) => {
                    eprintln!(
                        "[recipe] workspace {}: attempt {}/{} failed: {}",
                        workspace.id, attempt, MAX_ATTEMPTS, e
                    );
                    previous_error = Some(e.to_string());
                    continue;
                }
            };
            last_recipe = recipe.clone();

            // Persist each candidate recipe for diagnostics.
            let ws_id = workspace.id;
            let persisted = recipe.clone();
            if let Err(e) = self
                .db
                .call(move |db| db.set_workspace_recipe(ws_id, &persisted))
                .await
            {
                eprintln!("[recipe] workspace {}: recipe persist failed: {:#}", ws_id, e);
            }

            let mut progress: Vec<String> = Vec::new();
            let result = daemon
                .build_image(&recipe, &tag, &mut |line| {
                    progress.push(line.to_string());
                    if progress.len() > 100 {
                        progress.remove(0);
                    }
                })
                .await;
            match result {
                Ok(image_id) => {
                    eprintln!(
                        "[runner] workspace {}: image {} built on attempt {}",
                        workspace.id, tag, attempt
                    );
                    return Ok(image_id);
                }
                Err(e) => {
                    eprintln!(
                        "[runner] workspace {}: build attempt {}/{} failed: {}",
                        workspace.id, attempt, MAX_ATTEMPTS, e
                    );
                    if let DaemonError::Build { progress: tail, .. } = &e {
                        last_progress = tail.clone();
                    } else {
                        last_progress = progress;
                    }
                    previous_error = Some(e.to_string());
                }
            }
        }

        Err((
            MAX_ATTEMPTS,
            previous_error.unwrap_or_else(|| "recipe synthesis failed".to_string()),
            last_recipe,
            last_progress,
        ))
    }

    fn container_spec(&self, image_id: &str, workspace_id: i64) -> ContainerSpec {
        let mut env = Vec::new();
        if let Some(token) = &self.config.github_token {
            env.push(format!("GITHUB_TOKEN={}", token));
            env.push(format!("GH_TOKEN={}", token));
        }
        let binds = vec![
            format!(
                "{}:/home/agent/.ssh/id_ed25519:ro",
                self.config.ssh_key_path.display()
            ),
            format!(
                "{}:/home/agent/.claude.json:ro",
                self.config.agent_auth_path.display()
            ),
            format!(
                "{}:/home/agent/.claude:ro",
                self.config.agent_config_dir.display()
            ),
        ];
        ContainerSpec {
            image: image_id.to_string(),
            cmd: vec![
                "bash".to_string(),
                "-lc".to_string(),
                "touch /home/agent/agent.log && exec tail -f /home/agent/agent.log".to_string(),
            ],
            env,
            working_dir: Some("/home/agent/repo".to_string()),
            user: Some("agent".to_string()),
            tty: true,
            labels: [(
                "ucoder.workspace".to_string(),
                workspace_id.to_string(),
            )]
            .into_iter()
            .collect(),
            host_config: HostConfig {
                binds,
                network_mode: "host".to_string(),
            },
        }
    }

    async fn fail_provision(
        &self,
        workspace_id: i64,
        issue_id: i64,
        status: WorkspaceStatus,
        failure: WorkspaceFailure,
        error: SpawnError,
    ) -> SpawnError {
        eprintln!(
            "[runner] workspace {}: {}: {}",
            workspace_id, failure.kind, failure.message
        );
        let json = failure.to_json();
        let result = self
            .db
            .call(move |db| {
                db.set_workspace_error(workspace_id, &json)?;
                db.update_workspace_status(workspace_id, &status)?;
                db.set_issue_status(issue_id, &IssueStatus::Error)?;
                Ok(())
            })
            .await;
        if let Err(e) = result {
            eprintln!(
                "[runner] workspace {}: failed to persist failure: {:#}",
                workspace_id, e
            );
        }
        error
    }

    // ── Detached half: execute ────────────────────────────────────────

    /// Launch the agent-execution phase in a background task whose
    /// lifetime is independent of the spawn request.
    pub fn spawn_execution(self: Arc<Self>, workspace: Workspace) {
        let runner = self;
        tokio::spawn(async move {
            let ws_id = workspace.id;
            if let Err(e) = runner.execute(workspace).await {
                eprintln!("[runner] workspace {}: execution error: {:#}", ws_id, e);
            }
        });
    }

    /// Steps 10–12: run the agent inside the container, ingest output,
    /// settle the terminal state, wait the grace period, tear down.
    pub async fn execute(&self, workspace: Workspace) -> Result<()> {
        let ws_id = workspace.id;
        let issue_id = workspace.issue_id;
        let container_id = workspace
            .container_id
            .clone()
            .context("Workspace has no container")?;
        let daemon = self.daemon()?;

        let (agent, issue, repository, environment) = self
            .load_spawn_rows(issue_id, workspace.agent_id)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let prior = self
            .db
            .call(move |db| db.get_contribution_by_issue(issue_id))
            .await?;

        let prompt = build_fix_prompt(&PromptInput {
            issue: &issue,
            repository: &repository,
            environment: &environment,
            branch_name: &workspace.branch_name,
            base_branch: &workspace.base_branch,
            rerun: prior.is_some(),
        });

        let agent_run = {
            let agent_id = agent.id;
            self.db
                .call(move |db| db.create_agent_run(agent_id, issue_id, Some(ws_id)))
                .await?
        };

        // Log writer: commits complete lines and tracks the latest PR URL
        // seen on stdout. Terminal status is only written after this task
        // has drained.
        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<(LogStream, String)>();
        let writer_db = self.db.clone();
        let writer = tokio::spawn(async move {
            let mut latest_pr: Option<String> = None;
            while let Some((stream, line)) = line_rx.recv().await {
                if stream == LogStream::Stdout {
                    if let Some(url) = find_pr_url(&line) {
                        latest_pr = Some(url.clone());
                        if let Err(e) = writer_db
                            .call(move |db| db.set_workspace_pr_url(ws_id, &url))
                            .await
                        {
                            eprintln!("[runner] workspace {}: PR URL persist failed: {:#}", ws_id, e);
                        }
                    }
                }
                let owned = line;
                if let Err(e) = writer_db
                    .call(move |db| db.append_workspace_log(ws_id, stream, &owned).map(|_| ()))
                    .await
                {
                    eprintln!("[runner] workspace {}: log persist failed: {:#}", ws_id, e);
                }
            }
            latest_pr
        });

        let script = agent_script(&agent.command, &prompt);
        let mut spec = ExecSpec::new(vec!["bash".to_string(), "-lc".to_string(), script]);
        spec.user = Some("agent".to_string());
        spec.working_dir = Some("/home/agent/repo".to_string());
        if let Some(token) = &self.config.github_token {
            spec.env.push(format!("GITHUB_TOKEN={}", token));
            spec.env.push(format!("GH_TOKEN={}", token));
        }

        let remaining = remaining_time(&workspace);
        let exec_result = if remaining.is_zero() {
            None
        } else {
            let mut stdout_buf = LineBuffer::new();
            let mut stderr_buf = LineBuffer::new();
            let result = {
                let mut sink = |stream: LogStream, bytes: &[u8]| {
                    let buffer = match stream {
                        LogStream::Stdout => &mut stdout_buf,
                        LogStream::Stderr => &mut stderr_buf,
                    };
                    for line in buffer.push(bytes) {
                        let _ = line_tx.send((stream, line));
                    }
                };
                tokio::time::timeout(
                    remaining,
                    daemon.exec_streaming(&container_id, &spec, &mut sink),
                )
                .await
            };
            // The retained fragment is committed as a final line.
            if let Some(line) = stdout_buf.flush() {
                let _ = line_tx.send((LogStream::Stdout, line));
            }
            if let Some(line) = stderr_buf.flush() {
                let _ = line_tx.send((LogStream::Stderr, line));
            }
            result.ok()
        };

        // All log lines commit before any terminal transition.
        drop(line_tx);
        let latest_pr = writer.await.unwrap_or(None);

        match exec_result {
            // Timed out (or already expired on entry).
            None => {
                self.settle_timeout(&workspace, &daemon, &container_id, agent_run.id)
                    .await?;
            }
            Some(Ok(exit_code)) => {
                if exit_code == 0 {
                    self.settle_completed(&workspace, latest_pr, agent_run.id, &issue)
                        .await?;
                } else {
                    self.settle_crashed(
                        &workspace,
                        agent_run.id,
                        exit_code,
                        format!("agent exited with code {}", exit_code),
                    )
                    .await?;
                }
                self.teardown_after_grace(ws_id, &daemon, &container_id).await;
            }
            Some(Err(e)) => {
                // A cancel force-removes the container, which surfaces here
                // as a stream error; the cancel already settled the row.
                let current = self.db.call(move |db| db.get_workspace(ws_id)).await?;
                if matches!(
                    current.map(|w| w.status),
                    Some(WorkspaceStatus::Cancelled) | Some(WorkspaceStatus::Destroyed)
                ) {
                    self.db
                        .call(move |db| {
                            db.append_workspace_log(
                                ws_id,
                                LogStream::Stdout,
                                "agent output stream closed; workspace cancelled",
                            )
                            .map(|_| ())
                        })
                        .await?;
                    let run_id = agent_run.id;
                    self.db
                        .call(move |db| {
                            db.complete_agent_run(run_id, &AgentRunStatus::Cancelled, None)
                                .map(|_| ())
                        })
                        .await?;
                    self.registry.unregister(ws_id).await;
                    return Ok(());
                }
                self.settle_crashed(
                    &workspace,
                    agent_run.id,
                    -1,
                    format!("agent exec failed: {}", e),
                )
                .await?;
                self.teardown_after_grace(ws_id, &daemon, &container_id).await;
            }
        }

        self.registry.unregister(ws_id).await;
        Ok(())
    }

    async fn settle_completed(
        &self,
        workspace: &Workspace,
        latest_pr: Option<String>,
        agent_run_id: i64,
        issue: &Issue,
    ) -> Result<()> {
        let ws_id = workspace.id;
        let transitioned = self
            .db
            .call(move |db| db.update_workspace_status(ws_id, &WorkspaceStatus::Completed))
            .await?;
        if !transitioned {
            // Cancelled while the agent was finishing; no contribution.
            self.db
                .call(move |db| {
                    db.complete_agent_run(agent_run_id, &AgentRunStatus::Cancelled, Some(0))
                        .map(|_| ())
                })
                .await?;
            return Ok(());
        }
        self.db
            .call(move |db| {
                db.complete_agent_run(agent_run_id, &AgentRunStatus::Completed, Some(0))
                    .map(|_| ())
            })
            .await?;

        // Fall back to a PR URL recorded before the run (re-run case).
        let pr_url = match latest_pr {
            Some(url) => Some(url),
            None => {
                self.db
                    .call(move |db| Ok(db.get_workspace(ws_id)?.and_then(|w| w.pr_url)))
                    .await?
            }
        };
        let pr_number = pr_url.as_deref().and_then(pr_number_from_url);

        let issue_id = workspace.issue_id;
        let branch = workspace.branch_name.clone();
        let summary = format!("Automated fix for issue #{}", issue.number);
        let contribution: Contribution = self
            .db
            .call(move |db| {
                db.upsert_contribution(
                    issue_id,
                    Some(agent_run_id),
                    &branch,
                    pr_url.as_deref(),
                    pr_number,
                    &ContributionStatus::PrOpen,
                    Some(&summary),
                )
            })
            .await?;

        // The branch was pushed even when no PR URL surfaced in the logs,
        // so the issue advances regardless.
        self.db
            .call(move |db| db.set_issue_status(issue_id, &IssueStatus::PrOpen).map(|_| ()))
            .await?;
        eprintln!(
            "[runner] workspace {}: completed (contribution {}, pr {})",
            ws_id,
            contribution.id,
            contribution.pr_url.as_deref().unwrap_or("undetected")
        );
        Ok(())
    }

    async fn settle_crashed(
        &self,
        workspace: &Workspace,
        agent_run_id: i64,
        exit_code: i64,
        message: String,
    ) -> Result<()> {
        let ws_id = workspace.id;
        let issue_id = workspace.issue_id;
        let excerpt = self
            .db
            .call(move |db| db.tail_workspace_logs(ws_id, CRASH_LOG_EXCERPT))
            .await
            .unwrap_or_default();
        let failure = WorkspaceFailure::new(
            "container_crashed",
            message.clone(),
            serde_json::json!({ "logs": excerpt }),
        );
        let json = failure.to_json();
        let transitioned = self
            .db
            .call(move |db| {
                let transitioned =
                    db.update_workspace_status(ws_id, &WorkspaceStatus::ContainerCrashed)?;
                if transitioned {
                    db.set_workspace_error(ws_id, &json)?;
                    db.set_issue_status(issue_id, &IssueStatus::Error)?;
                }
                Ok(transitioned)
            })
            .await?;
        if transitioned {
            eprintln!("[runner] workspace {}: container_crashed: {}", ws_id, message);
        }
        self.db
            .call(move |db| {
                db.complete_agent_run(agent_run_id, &AgentRunStatus::Failed, Some(exit_code))
                    .map(|_| ())
            })
            .await?;
        Ok(())
    }

    async fn settle_timeout(
        &self,
        workspace: &Workspace,
        daemon: &DaemonClient,
        container_id: &str,
        agent_run_id: i64,
    ) -> Result<()> {
        let ws_id = workspace.id;
        let issue_id = workspace.issue_id;
        let duration_seconds = elapsed_seconds(&workspace.created_at);
        let failure = WorkspaceFailure::new(
            "timeout",
            format!(
                "workspace exceeded its {} minute timeout",
                workspace.timeout_minutes
            ),
            serde_json::json!({ "duration": duration_seconds }),
        );
        let json = failure.to_json();
        let transitioned = self
            .db
            .call(move |db| {
                let transitioned = db.update_workspace_status(ws_id, &WorkspaceStatus::Timeout)?;
                if transitioned {
                    db.set_workspace_error(ws_id, &json)?;
                    db.set_issue_status(issue_id, &IssueStatus::Error)?;
                }
                Ok(transitioned)
            })
            .await?;
        if transitioned {
            eprintln!(
                "[runner] workspace {}: timeout after {}s, force-removing container",
                ws_id, duration_seconds
            );
        }
        self.db
            .call(move |db| {
                db.complete_agent_run(agent_run_id, &AgentRunStatus::Failed, None)
                    .map(|_| ())
            })
            .await?;

        // Forced teardown, no grace.
        if let Err(e) = daemon.stop_and_remove(container_id).await {
            eprintln!("[runner] workspace {}: teardown failed: {}", ws_id, e);
        }
        self.db
            .call(move |db| db.mark_workspace_destroyed(ws_id).map(|_| ()))
            .await?;
        Ok(())
    }

    async fn teardown_after_grace(&self, ws_id: i64, daemon: &DaemonClient, container_id: &str) {
        let grace_seconds = self
            .db
            .call(|db| db.config_i64("workspace_grace_seconds", 60))
            .await
            .unwrap_or(60);
        if grace_seconds > 0 {
            tokio::time::sleep(std::time::Duration::from_secs(grace_seconds as u64)).await;
        }
        if let Err(e) = daemon.stop_and_remove(container_id).await {
            eprintln!("[runner] workspace {}: teardown failed: {}", ws_id, e);
        }
        if let Err(e) = self
            .db
            .call(move |db| db.mark_workspace_destroyed(ws_id).map(|_| ()))
            .await
        {
            eprintln!("[runner] workspace {}: destroy stamp failed: {:#}", ws_id, e);
        }
    }

    // ── Cancel / destroy ──────────────────────────────────────────────

    /// Cancel a workspace from any non-terminal state (idempotent). The
    /// container is force-removed, which EOFs the exec stream; the runner
    /// task observes that and exits without a contribution.
    pub async fn cancel(&self, workspace_id: i64) -> Result<Option<Workspace>> {
        let workspace = self
            .db
            .call(move |db| db.get_workspace(workspace_id))
            .await?;
        let Some(workspace) = workspace else {
            return Ok(None);
        };

        let issue_id = workspace.issue_id;
        let transitioned = self
            .db
            .call(move |db| {
                let transitioned =
                    db.update_workspace_status(workspace_id, &WorkspaceStatus::Cancelled)?;
                if transitioned {
                    let failure = WorkspaceFailure::new(
                        "cancelled",
                        "workspace cancelled by operator",
                        serde_json::json!({}),
                    );
                    db.set_workspace_error(workspace_id, &failure.to_json())?;
                    db.set_issue_status(issue_id, &IssueStatus::Open)?;
                }
                Ok(transitioned)
            })
            .await?;
        if transitioned {
            eprintln!("[runner] workspace {}: cancelled", workspace_id);
        }

        if let Some(container_id) = &workspace.container_id {
            match self.daemon() {
                Ok(daemon) => {
                    if let Err(e) = daemon.stop_and_remove(container_id).await {
                        eprintln!(
                            "[runner] workspace {}: container removal failed: {}",
                            workspace_id, e
                        );
                    }
                }
                Err(e) => {
                    eprintln!(
                        "[runner] workspace {}: daemon unavailable for removal: {}",
                        workspace_id, e
                    );
                }
            }
        }
        self.registry.unregister(workspace_id).await;

        let workspace = self
            .db
            .call(move |db| db.mark_workspace_destroyed(workspace_id))
            .await?;
        Ok(Some(workspace))
    }

    // ── Startup reconciliation / shutdown ─────────────────────────────

    /// After a process restart, non-terminal workspaces cannot be resumed:
    /// their containers are looked up and the rows settled as crashed
    /// (stale containers are force-destroyed first).
    pub async fn reconcile_startup(&self) -> Result<()> {
        let stranded = self.db.call(|db| db.list_non_terminal_workspaces()).await?;
        if stranded.is_empty() {
            return Ok(());
        }
        eprintln!(
            "[runner] reconciling {} workspace(s) left over from a previous run",
            stranded.len()
        );
        let daemon = self.daemon().ok();

        for workspace in stranded {
            let ws_id = workspace.id;
            let issue_id = workspace.issue_id;
            let message = match (&workspace.container_id, &daemon) {
                (None, _) => "orchestrator restarted during provisioning".to_string(),
                (Some(container_id), Some(daemon)) => match daemon.inspect_container(container_id).await {
                    Ok(None) => "container missing after orchestrator restart".to_string(),
                    Ok(Some(_)) => {
                        if let Err(e) = daemon.stop_and_remove(container_id).await {
                            eprintln!(
                                "[runner] workspace {}: stale container removal failed: {}",
                                ws_id, e
                            );
                        }
                        "stale container force-destroyed after orchestrator restart".to_string()
                    }
                    Err(e) => {
                        eprintln!(
                            "[runner] workspace {}: reconcile inspect failed, skipping: {}",
                            ws_id, e
                        );
                        continue;
                    }
                },
                (Some(_), None) => "container daemon unavailable after restart".to_string(),
            };

            let failure = WorkspaceFailure::new(
                "container_crashed",
                message.clone(),
                serde_json::json!({}),
            );
            let json = failure.to_json();
            let result = self
                .db
                .call(move |db| {
                    if db.update_workspace_status(ws_id, &WorkspaceStatus::ContainerCrashed)? {
                        db.set_workspace_error(ws_id, &json)?;
                        db.set_issue_status(issue_id, &IssueStatus::Error)?;
                    }
                    db.mark_workspace_destroyed(ws_id)?;
                    Ok(())
                })
                .await;
            if let Err(e) = result {
                eprintln!("[runner] workspace {}: reconcile persist failed: {:#}", ws_id, e);
            } else {
                eprintln!("[runner] workspace {}: reconciled: {}", ws_id, message);
            }
        }
        Ok(())
    }

    /// Stop every in-flight container (graceful shutdown).
    pub async fn shutdown(&self) {
        let inflight = self.registry.drain().await;
        if inflight.is_empty() {
            return;
        }
        let Ok(daemon) = self.daemon() else {
            return;
        };
        for (ws_id, container_id) in inflight {
            eprintln!("[runner] workspace {}: stopping container on shutdown", ws_id);
            if let Err(e) = daemon.stop_and_remove(&container_id).await {
                eprintln!("[runner] workspace {}: shutdown removal failed: {}", ws_id, e);
            }
        }
    }
}

/// Shell script executed inside the container: write the prompt through a
/// bounded heredoc (no shell escaping of the prompt body), then invoke the
/// agent referencing the file, teeing stdout into the sentinel log.
fn agent_script(agent_command: &str, prompt: &str) -> String {
    // A prompt line colliding with the delimiter would end the heredoc
    // early; indent any such line.
    let safe_prompt: String = prompt
        .lines()
        .map(|line| {
            if line.trim() == PROMPT_DELIMITER {
                format!(" {}", line)
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "set -uo pipefail\n\
         cat > {path} <<'{delim}'\n\
         {prompt}\n\
         {delim}\n\
         cd /home/agent/repo\n\
         {agent} --print --dangerously-skip-permissions \"$(cat {path})\" | tee -a /home/agent/agent.log\n\
         exit ${{PIPESTATUS[0]}}\n",
        path = PROMPT_PATH,
        delim = PROMPT_DELIMITER,
        prompt = safe_prompt,
        agent = agent_command,
    )
}

fn sanitize_image_tag(full_name: &str) -> String {
    full_name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

fn remaining_time(workspace: &Workspace) -> std::time::Duration {
    let expires = match chrono::DateTime::parse_from_rfc3339(&workspace.expires_at) {
        Ok(t) => t.with_timezone(&Utc),
        Err(_) => return std::time::Duration::ZERO,
    };
    (expires - Utc::now())
        .to_std()
        .unwrap_or(std::time::Duration::ZERO)
}

fn elapsed_seconds(created_at: &str) -> i64 {
    chrono::DateTime::parse_from_rfc3339(created_at)
        .map(|t| (Utc::now() - t.with_timezone(&Utc)).num_seconds())
        .unwrap_or(0)
}
