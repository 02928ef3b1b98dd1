//! SQLite persistence for the orchestrator.
//!
//! All entities live in a single database file with foreign keys enforced.
//! The schema is created idempotently at startup. Writes are serialized
//! behind `DbHandle`'s mutex; readers share the same connection through it.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

pub mod models;

use models::*;

/// RFC 3339 UTC timestamp for row stamping.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Async-safe handle to the orchestrator database.
///
/// Wraps `UcoderDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<UcoderDb>>,
}

impl DbHandle {
    pub fn new(db: UcoderDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&UcoderDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Used during startup
    /// initialization and in tests; must not be called from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, UcoderDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct UcoderDb {
    conn: Connection,
}

impl UcoderDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        self.insert_default_config()
            .context("Failed to insert config defaults")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS repositories (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    full_name TEXT NOT NULL UNIQUE,
                    origin_url TEXT NOT NULL,
                    fork_full_name TEXT,
                    fork_url TEXT,
                    language TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS issues (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repository_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
                    number INTEGER NOT NULL,
                    title TEXT NOT NULL,
                    body TEXT NOT NULL DEFAULT '',
                    labels TEXT NOT NULL DEFAULT '[]',
                    status TEXT NOT NULL DEFAULT 'pending',
                    ai_fix_prompt TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE(repository_id, number)
                );

                CREATE TABLE IF NOT EXISTS repository_environments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repository_id INTEGER NOT NULL UNIQUE REFERENCES repositories(id) ON DELETE CASCADE,
                    runtime TEXT NOT NULL,
                    package_manager TEXT NOT NULL,
                    setup_command TEXT NOT NULL DEFAULT '',
                    test_command TEXT NOT NULL DEFAULT '',
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS agents (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    command TEXT NOT NULL,
                    enabled INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS agent_runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    agent_id INTEGER NOT NULL REFERENCES agents(id),
                    issue_id INTEGER NOT NULL REFERENCES issues(id),
                    workspace_id INTEGER REFERENCES workspaces(id),
                    status TEXT NOT NULL DEFAULT 'queued',
                    exit_code INTEGER,
                    started_at TEXT NOT NULL,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS workspaces (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    agent_id INTEGER NOT NULL REFERENCES agents(id),
                    repository_id INTEGER NOT NULL REFERENCES repositories(id),
                    issue_id INTEGER NOT NULL REFERENCES issues(id),
                    container_id TEXT,
                    status TEXT NOT NULL DEFAULT 'pending',
                    branch_name TEXT NOT NULL,
                    base_branch TEXT NOT NULL DEFAULT 'main',
                    timeout_minutes REAL NOT NULL,
                    recipe TEXT,
                    pr_url TEXT,
                    error_message TEXT,
                    created_at TEXT NOT NULL,
                    expires_at TEXT NOT NULL,
                    destroyed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS workspace_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    workspace_id INTEGER NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                    stream TEXT NOT NULL,
                    line TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS contributions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    agent_run_id INTEGER REFERENCES agent_runs(id),
                    issue_id INTEGER NOT NULL REFERENCES issues(id),
                    pr_url TEXT,
                    pr_number INTEGER,
                    branch_name TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    summary TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS agent_states (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    agent_run_id INTEGER NOT NULL REFERENCES agent_runs(id),
                    contribution_id INTEGER REFERENCES contributions(id),
                    payload TEXT NOT NULL DEFAULT '{}',
                    suspended INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS webhooks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    contribution_id INTEGER REFERENCES contributions(id),
                    event_type TEXT NOT NULL,
                    action TEXT,
                    payload TEXT NOT NULL,
                    processed INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    processed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS config (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_issues_status ON issues(status);
                CREATE INDEX IF NOT EXISTS idx_contributions_status ON contributions(status);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_contributions_issue ON contributions(issue_id);
                CREATE INDEX IF NOT EXISTS idx_webhooks_unprocessed
                    ON webhooks(contribution_id) WHERE processed = 0;
                CREATE INDEX IF NOT EXISTS idx_workspaces_agent ON workspaces(agent_id);
                CREATE INDEX IF NOT EXISTS idx_workspaces_status ON workspaces(status);
                CREATE INDEX IF NOT EXISTS idx_workspaces_expiry ON workspaces(expires_at);
                CREATE INDEX IF NOT EXISTS idx_agent_states_suspended ON agent_states(suspended);
                CREATE INDEX IF NOT EXISTS idx_workspace_logs_ws ON workspace_logs(workspace_id, id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    fn insert_default_config(&self) -> Result<()> {
        let now = now_rfc3339();
        for (key, value) in [
            ("max_concurrent_agents", "3"),
            ("workspace_timeout_minutes", "60"),
            ("workspace_grace_seconds", "60"),
        ] {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO config (key, value, updated_at) VALUES (?1, ?2, ?3)",
                    params![key, value, now],
                )
                .context("Failed to insert config default")?;
        }
        Ok(())
    }

    // ── Repository CRUD ───────────────────────────────────────────────

    pub fn create_repository(
        &self,
        full_name: &str,
        origin_url: &str,
        language: Option<&str>,
    ) -> Result<Repository> {
        self.conn
            .execute(
                "INSERT INTO repositories (full_name, origin_url, language, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![full_name, origin_url, language, now_rfc3339()],
            )
            .context("Failed to insert repository")?;
        let id = self.conn.last_insert_rowid();
        self.get_repository(id)?
            .context("Repository not found after insert")
    }

    pub fn get_repository(&self, id: i64) -> Result<Option<Repository>> {
        self.conn
            .query_row(
                "SELECT id, full_name, origin_url, fork_full_name, fork_url, language, created_at
                 FROM repositories WHERE id = ?1",
                params![id],
                Self::map_repository,
            )
            .optional()
            .context("Failed to query repository")
    }

    pub fn get_repository_by_full_name(&self, full_name: &str) -> Result<Option<Repository>> {
        self.conn
            .query_row(
                "SELECT id, full_name, origin_url, fork_full_name, fork_url, language, created_at
                 FROM repositories WHERE full_name = ?1",
                params![full_name],
                Self::map_repository,
            )
            .optional()
            .context("Failed to query repository by full name")
    }

    pub fn list_repositories(&self) -> Result<Vec<Repository>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, full_name, origin_url, fork_full_name, fork_url, language, created_at
             FROM repositories ORDER BY id",
        )?;
        let rows = stmt.query_map([], Self::map_repository)?;
        let mut repositories = Vec::new();
        for row in rows {
            repositories.push(row.context("Failed to read repository row")?);
        }
        Ok(repositories)
    }

    pub fn update_repository_fork(
        &self,
        id: i64,
        fork_full_name: &str,
        fork_url: &str,
    ) -> Result<Repository> {
        self.conn
            .execute(
                "UPDATE repositories SET fork_full_name = ?1, fork_url = ?2 WHERE id = ?3",
                params![fork_full_name, fork_url, id],
            )
            .context("Failed to update repository fork")?;
        self.get_repository(id)?
            .context("Repository not found after fork update")
    }

    pub fn update_repository(
        &self,
        id: i64,
        origin_url: Option<&str>,
        language: Option<&str>,
    ) -> Result<Repository> {
        if let Some(url) = origin_url {
            self.conn.execute(
                "UPDATE repositories SET origin_url = ?1 WHERE id = ?2",
                params![url, id],
            )?;
        }
        if let Some(lang) = language {
            self.conn.execute(
                "UPDATE repositories SET language = ?1 WHERE id = ?2",
                params![lang, id],
            )?;
        }
        self.get_repository(id)?
            .context("Repository not found after update")
    }

    pub fn delete_repository(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM repositories WHERE id = ?1", params![id])
            .context("Failed to delete repository")?;
        Ok(count > 0)
    }

    fn map_repository(row: &rusqlite::Row<'_>) -> rusqlite::Result<Repository> {
        Ok(Repository {
            id: row.get(0)?,
            full_name: row.get(1)?,
            origin_url: row.get(2)?,
            fork_full_name: row.get(3)?,
            fork_url: row.get(4)?,
            language: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    // ── Issue CRUD ────────────────────────────────────────────────────

    pub fn create_issue(
        &self,
        repository_id: i64,
        number: i64,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<Issue> {
        let labels_json =
            serde_json::to_string(labels).context("Failed to serialize issue labels")?;
        let now = now_rfc3339();
        self.conn
            .execute(
                "INSERT INTO issues (repository_id, number, title, body, labels, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![repository_id, number, title, body, labels_json, now],
            )
            .context("Failed to insert issue")?;
        let id = self.conn.last_insert_rowid();
        self.get_issue(id)?.context("Issue not found after insert")
    }

    pub fn get_issue(&self, id: i64) -> Result<Option<Issue>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, repository_id, number, title, body, labels, status, ai_fix_prompt, created_at, updated_at
                 FROM issues WHERE id = ?1",
                params![id],
                Self::map_issue_row,
            )
            .optional()
            .context("Failed to query issue")?;
        row.map(IssueRow::into_issue).transpose()
    }

    pub fn list_issues(&self, status: Option<&IssueStatus>) -> Result<Vec<Issue>> {
        let mut out = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, repository_id, number, title, body, labels, status, ai_fix_prompt, created_at, updated_at
                     FROM issues WHERE status = ?1 ORDER BY id",
                )?;
                let rows = stmt.query_map(params![status.as_str()], Self::map_issue_row)?;
                for row in rows {
                    out.push(row.context("Failed to read issue row")?.into_issue()?);
                }
            }
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, repository_id, number, title, body, labels, status, ai_fix_prompt, created_at, updated_at
                     FROM issues ORDER BY id",
                )?;
                let rows = stmt.query_map([], Self::map_issue_row)?;
                for row in rows {
                    out.push(row.context("Failed to read issue row")?.into_issue()?);
                }
            }
        }
        Ok(out)
    }

    pub fn update_issue(
        &self,
        id: i64,
        title: Option<&str>,
        body: Option<&str>,
        labels: Option<&[String]>,
        ai_fix_prompt: Option<&str>,
    ) -> Result<Issue> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let now = now_rfc3339();
        if let Some(t) = title {
            tx.execute(
                "UPDATE issues SET title = ?1, updated_at = ?2 WHERE id = ?3",
                params![t, now, id],
            )?;
        }
        if let Some(b) = body {
            tx.execute(
                "UPDATE issues SET body = ?1, updated_at = ?2 WHERE id = ?3",
                params![b, now, id],
            )?;
        }
        if let Some(l) = labels {
            let labels_json = serde_json::to_string(l)?;
            tx.execute(
                "UPDATE issues SET labels = ?1, updated_at = ?2 WHERE id = ?3",
                params![labels_json, now, id],
            )?;
        }
        if let Some(p) = ai_fix_prompt {
            tx.execute(
                "UPDATE issues SET ai_fix_prompt = ?1, updated_at = ?2 WHERE id = ?3",
                params![p, now, id],
            )?;
        }
        tx.commit().context("Failed to commit issue update")?;
        self.get_issue(id)?.context("Issue not found after update")
    }

    pub fn set_issue_status(&self, id: i64, status: &IssueStatus) -> Result<Issue> {
        self.conn
            .execute(
                "UPDATE issues SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now_rfc3339(), id],
            )
            .context("Failed to update issue status")?;
        self.get_issue(id)?
            .context("Issue not found after status update")
    }

    pub fn delete_issue(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM issues WHERE id = ?1", params![id])
            .context("Failed to delete issue")?;
        Ok(count > 0)
    }

    fn map_issue_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IssueRow> {
        Ok(IssueRow {
            id: row.get(0)?,
            repository_id: row.get(1)?,
            number: row.get(2)?,
            title: row.get(3)?,
            body: row.get(4)?,
            labels: row.get(5)?,
            status: row.get(6)?,
            ai_fix_prompt: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    // ── Repository environments ───────────────────────────────────────

    pub fn upsert_environment(
        &self,
        repository_id: i64,
        runtime: &str,
        package_manager: &str,
        setup_command: &str,
        test_command: &str,
    ) -> Result<RepositoryEnvironment> {
        self.conn
            .execute(
                "INSERT INTO repository_environments
                     (repository_id, runtime, package_manager, setup_command, test_command, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(repository_id) DO UPDATE SET
                     runtime = excluded.runtime,
                     package_manager = excluded.package_manager,
                     setup_command = excluded.setup_command,
                     test_command = excluded.test_command,
                     updated_at = excluded.updated_at",
                params![
                    repository_id,
                    runtime,
                    package_manager,
                    setup_command,
                    test_command,
                    now_rfc3339()
                ],
            )
            .context("Failed to upsert repository environment")?;
        self.get_environment(repository_id)?
            .context("Environment not found after upsert")
    }

    pub fn get_environment(&self, repository_id: i64) -> Result<Option<RepositoryEnvironment>> {
        self.conn
            .query_row(
                "SELECT id, repository_id, runtime, package_manager, setup_command, test_command, updated_at
                 FROM repository_environments WHERE repository_id = ?1",
                params![repository_id],
                |row| {
                    Ok(RepositoryEnvironment {
                        id: row.get(0)?,
                        repository_id: row.get(1)?,
                        runtime: row.get(2)?,
                        package_manager: row.get(3)?,
                        setup_command: row.get(4)?,
                        test_command: row.get(5)?,
                        updated_at: row.get(6)?,
                    })
                },
            )
            .optional()
            .context("Failed to query repository environment")
    }

    // ── Agent CRUD ────────────────────────────────────────────────────

    pub fn create_agent(&self, name: &str, command: &str) -> Result<Agent> {
        self.conn
            .execute(
                "INSERT INTO agents (name, command, created_at) VALUES (?1, ?2, ?3)",
                params![name, command, now_rfc3339()],
            )
            .context("Failed to insert agent")?;
        let id = self.conn.last_insert_rowid();
        self.get_agent(id)?.context("Agent not found after insert")
    }

    pub fn get_agent(&self, id: i64) -> Result<Option<Agent>> {
        self.conn
            .query_row(
                "SELECT id, name, command, enabled, created_at FROM agents WHERE id = ?1",
                params![id],
                Self::map_agent,
            )
            .optional()
            .context("Failed to query agent")
    }

    pub fn list_agents(&self) -> Result<Vec<Agent>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, command, enabled, created_at FROM agents ORDER BY id")?;
        let rows = stmt.query_map([], Self::map_agent)?;
        let mut agents = Vec::new();
        for row in rows {
            agents.push(row.context("Failed to read agent row")?);
        }
        Ok(agents)
    }

    pub fn update_agent(
        &self,
        id: i64,
        name: Option<&str>,
        command: Option<&str>,
        enabled: Option<bool>,
    ) -> Result<Agent> {
        if let Some(n) = name {
            self.conn
                .execute("UPDATE agents SET name = ?1 WHERE id = ?2", params![n, id])?;
        }
        if let Some(c) = command {
            self.conn.execute(
                "UPDATE agents SET command = ?1 WHERE id = ?2",
                params![c, id],
            )?;
        }
        if let Some(e) = enabled {
            self.conn.execute(
                "UPDATE agents SET enabled = ?1 WHERE id = ?2",
                params![e as i64, id],
            )?;
        }
        self.get_agent(id)?.context("Agent not found after update")
    }

    pub fn delete_agent(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM agents WHERE id = ?1", params![id])
            .context("Failed to delete agent")?;
        Ok(count > 0)
    }

    fn map_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
        Ok(Agent {
            id: row.get(0)?,
            name: row.get(1)?,
            command: row.get(2)?,
            enabled: row.get::<_, i64>(3)? != 0,
            created_at: row.get(4)?,
        })
    }

    // ── Agent runs ────────────────────────────────────────────────────

    pub fn create_agent_run(
        &self,
        agent_id: i64,
        issue_id: i64,
        workspace_id: Option<i64>,
    ) -> Result<AgentRun> {
        self.conn
            .execute(
                "INSERT INTO agent_runs (agent_id, issue_id, workspace_id, status, started_at)
                 VALUES (?1, ?2, ?3, 'running', ?4)",
                params![agent_id, issue_id, workspace_id, now_rfc3339()],
            )
            .context("Failed to insert agent run")?;
        let id = self.conn.last_insert_rowid();
        self.get_agent_run(id)?
            .context("Agent run not found after insert")
    }

    pub fn complete_agent_run(
        &self,
        id: i64,
        status: &AgentRunStatus,
        exit_code: Option<i64>,
    ) -> Result<AgentRun> {
        self.conn
            .execute(
                "UPDATE agent_runs SET status = ?1, exit_code = ?2, completed_at = ?3 WHERE id = ?4",
                params![status.as_str(), exit_code, now_rfc3339(), id],
            )
            .context("Failed to complete agent run")?;
        self.get_agent_run(id)?
            .context("Agent run not found after completion")
    }

    pub fn get_agent_run(&self, id: i64) -> Result<Option<AgentRun>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, agent_id, issue_id, workspace_id, status, exit_code, started_at, completed_at
                 FROM agent_runs WHERE id = ?1",
                params![id],
                Self::map_agent_run_row,
            )
            .optional()
            .context("Failed to query agent run")?;
        row.map(AgentRunRow::into_agent_run).transpose()
    }

    pub fn list_agent_runs(&self) -> Result<Vec<AgentRun>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, agent_id, issue_id, workspace_id, status, exit_code, started_at, completed_at
             FROM agent_runs ORDER BY id",
        )?;
        let rows = stmt.query_map([], Self::map_agent_run_row)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read agent run row")?.into_agent_run()?);
        }
        Ok(runs)
    }

    pub fn delete_agent_run(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM agent_runs WHERE id = ?1", params![id])
            .context("Failed to delete agent run")?;
        Ok(count > 0)
    }

    fn map_agent_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRunRow> {
        Ok(AgentRunRow {
            id: row.get(0)?,
            agent_id: row.get(1)?,
            issue_id: row.get(2)?,
            workspace_id: row.get(3)?,
            status: row.get(4)?,
            exit_code: row.get(5)?,
            started_at: row.get(6)?,
            completed_at: row.get(7)?,
        })
    }

    // ── Agent states ──────────────────────────────────────────────────

    pub fn create_agent_state(
        &self,
        agent_run_id: i64,
        contribution_id: Option<i64>,
        payload: &serde_json::Value,
        suspended: bool,
    ) -> Result<AgentState> {
        let payload_json =
            serde_json::to_string(payload).context("Failed to serialize agent state payload")?;
        let now = now_rfc3339();
        self.conn
            .execute(
                "INSERT INTO agent_states (agent_run_id, contribution_id, payload, suspended, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![agent_run_id, contribution_id, payload_json, suspended as i64, now],
            )
            .context("Failed to insert agent state")?;
        let id = self.conn.last_insert_rowid();
        self.get_agent_state(id)?
            .context("Agent state not found after insert")
    }

    pub fn get_agent_state(&self, id: i64) -> Result<Option<AgentState>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, agent_run_id, contribution_id, payload, suspended, created_at, updated_at
                 FROM agent_states WHERE id = ?1",
                params![id],
                Self::map_agent_state_row,
            )
            .optional()
            .context("Failed to query agent state")?;
        row.map(AgentStateRow::into_agent_state).transpose()
    }

    pub fn list_agent_states(&self, suspended: Option<bool>) -> Result<Vec<AgentState>> {
        let mut out = Vec::new();
        match suspended {
            Some(flag) => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, agent_run_id, contribution_id, payload, suspended, created_at, updated_at
                     FROM agent_states WHERE suspended = ?1 ORDER BY id",
                )?;
                let rows = stmt.query_map(params![flag as i64], Self::map_agent_state_row)?;
                for row in rows {
                    out.push(row?.into_agent_state()?);
                }
            }
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, agent_run_id, contribution_id, payload, suspended, created_at, updated_at
                     FROM agent_states ORDER BY id",
                )?;
                let rows = stmt.query_map([], Self::map_agent_state_row)?;
                for row in rows {
                    out.push(row?.into_agent_state()?);
                }
            }
        }
        Ok(out)
    }

    pub fn update_agent_state(
        &self,
        id: i64,
        payload: Option<&serde_json::Value>,
        suspended: Option<bool>,
        contribution_id: Option<i64>,
    ) -> Result<AgentState> {
        let now = now_rfc3339();
        if let Some(p) = payload {
            let payload_json = serde_json::to_string(p)?;
            self.conn.execute(
                "UPDATE agent_states SET payload = ?1, updated_at = ?2 WHERE id = ?3",
                params![payload_json, now, id],
            )?;
        }
        if let Some(s) = suspended {
            self.conn.execute(
                "UPDATE agent_states SET suspended = ?1, updated_at = ?2 WHERE id = ?3",
                params![s as i64, now, id],
            )?;
        }
        if let Some(c) = contribution_id {
            self.conn.execute(
                "UPDATE agent_states SET contribution_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![c, now, id],
            )?;
        }
        self.get_agent_state(id)?
            .context("Agent state not found after update")
    }

    pub fn delete_agent_state(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM agent_states WHERE id = ?1", params![id])
            .context("Failed to delete agent state")?;
        Ok(count > 0)
    }

    fn map_agent_state_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentStateRow> {
        Ok(AgentStateRow {
            id: row.get(0)?,
            agent_run_id: row.get(1)?,
            contribution_id: row.get(2)?,
            payload: row.get(3)?,
            suspended: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    // ── Workspace CRUD ────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_workspace(
        &self,
        agent_id: i64,
        repository_id: i64,
        issue_id: i64,
        branch_name: &str,
        base_branch: &str,
        timeout_minutes: f64,
        status: &WorkspaceStatus,
    ) -> Result<Workspace> {
        let created = Utc::now();
        let expires = created + chrono::Duration::milliseconds((timeout_minutes * 60_000.0) as i64);
        self.conn
            .execute(
                "INSERT INTO workspaces
                     (agent_id, repository_id, issue_id, status, branch_name, base_branch,
                      timeout_minutes, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    agent_id,
                    repository_id,
                    issue_id,
                    status.as_str(),
                    branch_name,
                    base_branch,
                    timeout_minutes,
                    created.to_rfc3339(),
                    expires.to_rfc3339()
                ],
            )
            .context("Failed to insert workspace")?;
        let id = self.conn.last_insert_rowid();
        self.get_workspace(id)?
            .context("Workspace not found after insert")
    }

    pub fn get_workspace(&self, id: i64) -> Result<Option<Workspace>> {
        let row = self
            .conn
            .query_row(
                &format!("{} WHERE id = ?1", WORKSPACE_SELECT),
                params![id],
                Self::map_workspace_row,
            )
            .optional()
            .context("Failed to query workspace")?;
        row.map(WorkspaceRow::into_workspace).transpose()
    }

    pub fn list_workspaces(&self, status: Option<&WorkspaceStatus>) -> Result<Vec<Workspace>> {
        let mut out = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = self
                    .conn
                    .prepare(&format!("{} WHERE status = ?1 ORDER BY id", WORKSPACE_SELECT))?;
                let rows = stmt.query_map(params![status.as_str()], Self::map_workspace_row)?;
                for row in rows {
                    out.push(row?.into_workspace()?);
                }
            }
            None => {
                let mut stmt = self
                    .conn
                    .prepare(&format!("{} ORDER BY id", WORKSPACE_SELECT))?;
                let rows = stmt.query_map([], Self::map_workspace_row)?;
                for row in rows {
                    out.push(row?.into_workspace()?);
                }
            }
        }
        Ok(out)
    }

    /// Workspaces whose status is not terminal (candidates for startup
    /// reconciliation and the concurrency cap).
    pub fn list_non_terminal_workspaces(&self) -> Result<Vec<Workspace>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE status IN ('pending', 'building', 'running') ORDER BY id",
            WORKSPACE_SELECT
        ))?;
        let rows = stmt.query_map([], Self::map_workspace_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_workspace()?);
        }
        Ok(out)
    }

    pub fn count_active_workspaces(&self) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM workspaces WHERE status IN ('pending', 'building', 'running')",
                [],
                |row| row.get(0),
            )
            .context("Failed to count active workspaces")
    }

    /// Transition a workspace to a new status. Terminal states never
    /// transition further: returns `false` (and leaves the row untouched)
    /// when the current status is already terminal.
    pub fn update_workspace_status(&self, id: i64, status: &WorkspaceStatus) -> Result<bool> {
        let current: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM workspaces WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.context("Workspace not found for status update")?;
        let current = WorkspaceStatus::from_str(&current).map_err(|e| anyhow::anyhow!(e))?;
        if current.is_terminal() {
            return Ok(false);
        }
        self.conn
            .execute(
                "UPDATE workspaces SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update workspace status")?;
        Ok(true)
    }

    pub fn set_workspace_container(&self, id: i64, container_id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE workspaces SET container_id = ?1 WHERE id = ?2",
                params![container_id, id],
            )
            .context("Failed to set workspace container")?;
        Ok(())
    }

    pub fn set_workspace_recipe(&self, id: i64, recipe: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE workspaces SET recipe = ?1 WHERE id = ?2",
                params![recipe, id],
            )
            .context("Failed to set workspace recipe")?;
        Ok(())
    }

    pub fn set_workspace_pr_url(&self, id: i64, pr_url: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE workspaces SET pr_url = ?1 WHERE id = ?2",
                params![pr_url, id],
            )
            .context("Failed to set workspace PR URL")?;
        Ok(())
    }

    pub fn set_workspace_error(&self, id: i64, error_message: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE workspaces SET error_message = ?1 WHERE id = ?2",
                params![error_message, id],
            )
            .context("Failed to set workspace error")?;
        Ok(())
    }

    /// Stamp `destroyed_at` once; repeated calls do not move the timestamp.
    pub fn mark_workspace_destroyed(&self, id: i64) -> Result<Workspace> {
        self.conn
            .execute(
                "UPDATE workspaces SET destroyed_at = ?1 WHERE id = ?2 AND destroyed_at IS NULL",
                params![now_rfc3339(), id],
            )
            .context("Failed to mark workspace destroyed")?;
        self.get_workspace(id)?
            .context("Workspace not found after destroy")
    }

    pub fn delete_workspace(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM workspaces WHERE id = ?1", params![id])
            .context("Failed to delete workspace")?;
        Ok(count > 0)
    }

    fn map_workspace_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkspaceRow> {
        Ok(WorkspaceRow {
            id: row.get(0)?,
            agent_id: row.get(1)?,
            repository_id: row.get(2)?,
            issue_id: row.get(3)?,
            container_id: row.get(4)?,
            status: row.get(5)?,
            branch_name: row.get(6)?,
            base_branch: row.get(7)?,
            timeout_minutes: row.get(8)?,
            recipe: row.get(9)?,
            pr_url: row.get(10)?,
            error_message: row.get(11)?,
            created_at: row.get(12)?,
            expires_at: row.get(13)?,
            destroyed_at: row.get(14)?,
        })
    }

    // ── Workspace logs ────────────────────────────────────────────────

    pub fn append_workspace_log(
        &self,
        workspace_id: i64,
        stream: LogStream,
        line: &str,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO workspace_logs (workspace_id, stream, line, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![workspace_id, stream.as_str(), line, now_rfc3339()],
            )
            .context("Failed to append workspace log")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Log rows for a workspace with id strictly greater than `after_id`,
    /// ascending. `after_id = None` returns all rows.
    pub fn list_workspace_logs(
        &self,
        workspace_id: i64,
        after_id: Option<i64>,
    ) -> Result<Vec<WorkspaceLog>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, workspace_id, stream, line, created_at
             FROM workspace_logs WHERE workspace_id = ?1 AND id > ?2 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![workspace_id, after_id.unwrap_or(0)], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut logs = Vec::new();
        for row in rows {
            let (id, workspace_id, stream_str, line, created_at) = row?;
            logs.push(WorkspaceLog {
                id,
                workspace_id,
                stream: stream_str
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid stream in database: '{}'", stream_str))?,
                line,
                created_at,
            });
        }
        Ok(logs)
    }

    /// Tail of a workspace's log, newest last. Used for crash excerpts.
    pub fn tail_workspace_logs(&self, workspace_id: i64, limit: i64) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT line FROM (
                 SELECT id, line FROM workspace_logs WHERE workspace_id = ?1
                 ORDER BY id DESC LIMIT ?2
             ) ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![workspace_id, limit], |row| row.get::<_, String>(0))?;
        let mut lines = Vec::new();
        for row in rows {
            lines.push(row?);
        }
        Ok(lines)
    }

    /// Newest-first log lines containing a substring (used by the PR-URL
    /// fallback grep).
    pub fn recent_log_lines_containing(
        &self,
        workspace_id: i64,
        needle: &str,
        limit: i64,
    ) -> Result<Vec<String>> {
        let pattern = format!("%{}%", needle);
        let mut stmt = self.conn.prepare(
            "SELECT line FROM workspace_logs
             WHERE workspace_id = ?1 AND line LIKE ?2 ORDER BY id DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![workspace_id, pattern, limit], |row| {
            row.get::<_, String>(0)
        })?;
        let mut lines = Vec::new();
        for row in rows {
            lines.push(row?);
        }
        Ok(lines)
    }

    // ── Contributions ─────────────────────────────────────────────────

    /// At most one contribution exists per issue: update it when present,
    /// insert otherwise.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_contribution(
        &self,
        issue_id: i64,
        agent_run_id: Option<i64>,
        branch_name: &str,
        pr_url: Option<&str>,
        pr_number: Option<i64>,
        status: &ContributionStatus,
        summary: Option<&str>,
    ) -> Result<Contribution> {
        let now = now_rfc3339();
        match self.get_contribution_by_issue(issue_id)? {
            Some(existing) => {
                self.conn
                    .execute(
                        "UPDATE contributions SET agent_run_id = COALESCE(?1, agent_run_id),
                             branch_name = ?2,
                             pr_url = COALESCE(?3, pr_url),
                             pr_number = COALESCE(?4, pr_number),
                             status = ?5,
                             summary = COALESCE(?6, summary),
                             updated_at = ?7
                         WHERE id = ?8",
                        params![
                            agent_run_id,
                            branch_name,
                            pr_url,
                            pr_number,
                            status.as_str(),
                            summary,
                            now,
                            existing.id
                        ],
                    )
                    .context("Failed to update contribution")?;
                self.get_contribution(existing.id)?
                    .context("Contribution not found after update")
            }
            None => {
                self.conn
                    .execute(
                        "INSERT INTO contributions
                             (agent_run_id, issue_id, pr_url, pr_number, branch_name, status, summary, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                        params![
                            agent_run_id,
                            issue_id,
                            pr_url,
                            pr_number,
                            branch_name,
                            status.as_str(),
                            summary,
                            now
                        ],
                    )
                    .context("Failed to insert contribution")?;
                let id = self.conn.last_insert_rowid();
                self.get_contribution(id)?
                    .context("Contribution not found after insert")
            }
        }
    }

    pub fn get_contribution(&self, id: i64) -> Result<Option<Contribution>> {
        let row = self
            .conn
            .query_row(
                &format!("{} WHERE id = ?1", CONTRIBUTION_SELECT),
                params![id],
                Self::map_contribution_row,
            )
            .optional()
            .context("Failed to query contribution")?;
        row.map(ContributionRow::into_contribution).transpose()
    }

    pub fn get_contribution_by_issue(&self, issue_id: i64) -> Result<Option<Contribution>> {
        let row = self
            .conn
            .query_row(
                &format!("{} WHERE issue_id = ?1", CONTRIBUTION_SELECT),
                params![issue_id],
                Self::map_contribution_row,
            )
            .optional()
            .context("Failed to query contribution by issue")?;
        row.map(ContributionRow::into_contribution).transpose()
    }

    /// Locate a contribution by PR URL or PR number (webhook routing).
    pub fn find_contribution_by_pr(
        &self,
        pr_url: Option<&str>,
        pr_number: Option<i64>,
    ) -> Result<Option<Contribution>> {
        if let Some(url) = pr_url {
            if let Some(c) = self
                .conn
                .query_row(
                    &format!("{} WHERE pr_url = ?1", CONTRIBUTION_SELECT),
                    params![url],
                    Self::map_contribution_row,
                )
                .optional()
                .context("Failed to query contribution by PR URL")?
            {
                return Ok(Some(c.into_contribution()?));
            }
        }
        if let Some(number) = pr_number {
            if let Some(c) = self
                .conn
                .query_row(
                    &format!("{} WHERE pr_number = ?1", CONTRIBUTION_SELECT),
                    params![number],
                    Self::map_contribution_row,
                )
                .optional()
                .context("Failed to query contribution by PR number")?
            {
                return Ok(Some(c.into_contribution()?));
            }
        }
        Ok(None)
    }

    pub fn list_contributions(&self) -> Result<Vec<Contribution>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} ORDER BY id", CONTRIBUTION_SELECT))?;
        let rows = stmt.query_map([], Self::map_contribution_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_contribution()?);
        }
        Ok(out)
    }

    pub fn update_contribution_status(
        &self,
        id: i64,
        status: &ContributionStatus,
    ) -> Result<Contribution> {
        self.conn
            .execute(
                "UPDATE contributions SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now_rfc3339(), id],
            )
            .context("Failed to update contribution status")?;
        self.get_contribution(id)?
            .context("Contribution not found after status update")
    }

    pub fn delete_contribution(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM contributions WHERE id = ?1", params![id])
            .context("Failed to delete contribution")?;
        Ok(count > 0)
    }

    fn map_contribution_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContributionRow> {
        Ok(ContributionRow {
            id: row.get(0)?,
            agent_run_id: row.get(1)?,
            issue_id: row.get(2)?,
            pr_url: row.get(3)?,
            pr_number: row.get(4)?,
            branch_name: row.get(5)?,
            status: row.get(6)?,
            summary: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    // ── Webhooks ──────────────────────────────────────────────────────

    pub fn insert_webhook(
        &self,
        contribution_id: Option<i64>,
        event_type: &str,
        action: Option<&str>,
        payload: &str,
    ) -> Result<Webhook> {
        self.conn
            .execute(
                "INSERT INTO webhooks (contribution_id, event_type, action, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![contribution_id, event_type, action, payload, now_rfc3339()],
            )
            .context("Failed to insert webhook")?;
        let id = self.conn.last_insert_rowid();
        self.get_webhook(id)?
            .context("Webhook not found after insert")
    }

    pub fn mark_webhook_processed(&self, id: i64) -> Result<Webhook> {
        self.conn
            .execute(
                "UPDATE webhooks SET processed = 1, processed_at = ?1 WHERE id = ?2",
                params![now_rfc3339(), id],
            )
            .context("Failed to mark webhook processed")?;
        self.get_webhook(id)?
            .context("Webhook not found after processing")
    }

    pub fn get_webhook(&self, id: i64) -> Result<Option<Webhook>> {
        self.conn
            .query_row(
                "SELECT id, contribution_id, event_type, action, payload, processed, created_at, processed_at
                 FROM webhooks WHERE id = ?1",
                params![id],
                Self::map_webhook,
            )
            .optional()
            .context("Failed to query webhook")
    }

    pub fn list_webhooks(&self) -> Result<Vec<Webhook>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, contribution_id, event_type, action, payload, processed, created_at, processed_at
             FROM webhooks ORDER BY id",
        )?;
        let rows = stmt.query_map([], Self::map_webhook)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read webhook row")?);
        }
        Ok(out)
    }

    pub fn delete_webhook(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM webhooks WHERE id = ?1", params![id])
            .context("Failed to delete webhook")?;
        Ok(count > 0)
    }

    fn map_webhook(row: &rusqlite::Row<'_>) -> rusqlite::Result<Webhook> {
        Ok(Webhook {
            id: row.get(0)?,
            contribution_id: row.get(1)?,
            event_type: row.get(2)?,
            action: row.get(3)?,
            payload: row.get(4)?,
            processed: row.get::<_, i64>(5)? != 0,
            created_at: row.get(6)?,
            processed_at: row.get(7)?,
        })
    }

    // ── Config ────────────────────────────────────────────────────────

    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query config")
    }

    pub fn config_i64(&self, key: &str, default: i64) -> Result<i64> {
        Ok(self
            .get_config(key)?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(default))
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO config (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, now_rfc3339()],
            )
            .context("Failed to upsert config")?;
        Ok(())
    }

    pub fn list_config(&self) -> Result<Vec<ConfigEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value, updated_at FROM config ORDER BY key")?;
        let rows = stmt.query_map([], |row| {
            Ok(ConfigEntry {
                key: row.get(0)?,
                value: row.get(1)?,
                updated_at: row.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read config row")?);
        }
        Ok(out)
    }

    pub fn delete_config(&self, key: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM config WHERE key = ?1", params![key])
            .context("Failed to delete config")?;
        Ok(count > 0)
    }
}

const WORKSPACE_SELECT: &str = "SELECT id, agent_id, repository_id, issue_id, container_id, status, \
     branch_name, base_branch, timeout_minutes, recipe, pr_url, error_message, \
     created_at, expires_at, destroyed_at FROM workspaces";

const CONTRIBUTION_SELECT: &str = "SELECT id, agent_run_id, issue_id, pr_url, pr_number, \
     branch_name, status, summary, created_at, updated_at FROM contributions";

// ── Internal row helpers ──────────────────────────────────────────────

/// Intermediate row struct for issues, converting status/labels strings
/// into typed values.
struct IssueRow {
    id: i64,
    repository_id: i64,
    number: i64,
    title: String,
    body: String,
    labels: String,
    status: String,
    ai_fix_prompt: Option<String>,
    created_at: String,
    updated_at: String,
}

impl IssueRow {
    fn into_issue(self) -> Result<Issue> {
        let status = IssueStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse issue status")?;
        let labels: Vec<String> =
            serde_json::from_str(&self.labels).context("Failed to parse issue labels JSON")?;
        Ok(Issue {
            id: self.id,
            repository_id: self.repository_id,
            number: self.number,
            title: self.title,
            body: self.body,
            labels,
            status,
            ai_fix_prompt: self.ai_fix_prompt,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct AgentRunRow {
    id: i64,
    agent_id: i64,
    issue_id: i64,
    workspace_id: Option<i64>,
    status: String,
    exit_code: Option<i64>,
    started_at: String,
    completed_at: Option<String>,
}

impl AgentRunRow {
    fn into_agent_run(self) -> Result<AgentRun> {
        Ok(AgentRun {
            id: self.id,
            agent_id: self.agent_id,
            issue_id: self.issue_id,
            workspace_id: self.workspace_id,
            status: self
                .status
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid agent run status: '{}'", self.status))?,
            exit_code: self.exit_code,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

struct AgentStateRow {
    id: i64,
    agent_run_id: i64,
    contribution_id: Option<i64>,
    payload: String,
    suspended: i64,
    created_at: String,
    updated_at: String,
}

impl AgentStateRow {
    fn into_agent_state(self) -> Result<AgentState> {
        let payload: serde_json::Value = serde_json::from_str(&self.payload)
            .with_context(|| format!("corrupt agent state payload JSON '{}'", self.payload))?;
        Ok(AgentState {
            id: self.id,
            agent_run_id: self.agent_run_id,
            contribution_id: self.contribution_id,
            payload,
            suspended: self.suspended != 0,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct WorkspaceRow {
    id: i64,
    agent_id: i64,
    repository_id: i64,
    issue_id: i64,
    container_id: Option<String>,
    status: String,
    branch_name: String,
    base_branch: String,
    timeout_minutes: f64,
    recipe: Option<String>,
    pr_url: Option<String>,
    error_message: Option<String>,
    created_at: String,
    expires_at: String,
    destroyed_at: Option<String>,
}

impl WorkspaceRow {
    fn into_workspace(self) -> Result<Workspace> {
        let status = WorkspaceStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse workspace status")?;
        Ok(Workspace {
            id: self.id,
            agent_id: self.agent_id,
            repository_id: self.repository_id,
            issue_id: self.issue_id,
            container_id: self.container_id,
            status,
            branch_name: self.branch_name,
            base_branch: self.base_branch,
            timeout_minutes: self.timeout_minutes,
            recipe: self.recipe,
            pr_url: self.pr_url,
            error_message: self.error_message,
            created_at: self.created_at,
            expires_at: self.expires_at,
            destroyed_at: self.destroyed_at,
        })
    }
}

struct ContributionRow {
    id: i64,
    agent_run_id: Option<i64>,
    issue_id: i64,
    pr_url: Option<String>,
    pr_number: Option<i64>,
    branch_name: String,
    status: String,
    summary: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ContributionRow {
    fn into_contribution(self) -> Result<Contribution> {
        let status = ContributionStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse contribution status")?;
        Ok(Contribution {
            id: self.id,
            agent_run_id: self.agent_run_id,
            issue_id: self.issue_id,
            pr_url: self.pr_url,
            pr_number: self.pr_number,
            branch_name: self.branch_name,
            status,
            summary: self.summary,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
