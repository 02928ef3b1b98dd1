use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub full_name: String,
    pub origin_url: String,
    pub fork_full_name: Option<String>,
    pub fork_url: Option<String>,
    pub language: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Pending,
    Extracting,
    /// Extraction finished; the issue is ready to be fixed.
    Open,
    Fixing,
    PrOpen,
    Fixed,
    Error,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Extracting => "extracting",
            Self::Open => "open",
            Self::Fixing => "fixing",
            Self::PrOpen => "pr_open",
            Self::Fixed => "fixed",
            Self::Error => "error",
        }
    }
}

impl FromStr for IssueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "extracting" => Ok(Self::Extracting),
            // "extracted" is the legacy stored form of "open".
            "open" | "extracted" => Ok(Self::Open),
            "fixing" => Ok(Self::Fixing),
            "pr_open" => Ok(Self::PrOpen),
            "fixed" => Ok(Self::Fixed),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid issue status: {}", s)),
        }
    }
}

impl std::fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: i64,
    pub repository_id: i64,
    pub number: i64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub status: IssueStatus,
    pub ai_fix_prompt: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryEnvironment {
    pub id: i64,
    pub repository_id: i64,
    pub runtime: String,
    pub package_manager: String,
    pub setup_command: String,
    pub test_command: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: i64,
    pub name: String,
    /// Executable invoked inside the workspace container (e.g. `claude`).
    pub command: String,
    pub enabled: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl AgentRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for AgentRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid agent run status: {}", s)),
        }
    }
}

impl std::fmt::Display for AgentRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: i64,
    pub agent_id: i64,
    pub issue_id: i64,
    pub workspace_id: Option<i64>,
    pub status: AgentRunStatus,
    pub exit_code: Option<i64>,
    pub started_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub id: i64,
    pub agent_run_id: i64,
    pub contribution_id: Option<i64>,
    pub payload: serde_json::Value,
    pub suspended: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Pending,
    Building,
    Running,
    Completed,
    BuildFailed,
    ContainerCrashed,
    Timeout,
    Destroyed,
    Cancelled,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Building => "building",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::BuildFailed => "build_failed",
            Self::ContainerCrashed => "container_crashed",
            Self::Timeout => "timeout",
            Self::Destroyed => "destroyed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states never transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::BuildFailed
                | Self::ContainerCrashed
                | Self::Timeout
                | Self::Destroyed
                | Self::Cancelled
        )
    }
}

impl FromStr for WorkspaceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "building" => Ok(Self::Building),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "build_failed" => Ok(Self::BuildFailed),
            "container_crashed" => Ok(Self::ContainerCrashed),
            "timeout" => Ok(Self::Timeout),
            "destroyed" => Ok(Self::Destroyed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid workspace status: {}", s)),
        }
    }
}

impl std::fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: i64,
    pub agent_id: i64,
    pub repository_id: i64,
    pub issue_id: i64,
    pub container_id: Option<String>,
    pub status: WorkspaceStatus,
    pub branch_name: String,
    pub base_branch: String,
    pub timeout_minutes: f64,
    pub recipe: Option<String>,
    pub pr_url: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub expires_at: String,
    pub destroyed_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl FromStr for LogStream {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            _ => Err(format!("Invalid log stream: {}", s)),
        }
    }
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceLog {
    pub id: i64,
    pub workspace_id: i64,
    pub stream: LogStream,
    pub line: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ContributionStatus {
    Pending,
    PrOpen,
    Merged,
    Closed,
}

impl ContributionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::PrOpen => "pr_open",
            Self::Merged => "merged",
            Self::Closed => "closed",
        }
    }
}

impl FromStr for ContributionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "pr_open" => Ok(Self::PrOpen),
            "merged" => Ok(Self::Merged),
            "closed" => Ok(Self::Closed),
            _ => Err(format!("Invalid contribution status: {}", s)),
        }
    }
}

impl std::fmt::Display for ContributionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contribution {
    pub id: i64,
    pub agent_run_id: Option<i64>,
    pub issue_id: i64,
    pub pr_url: Option<String>,
    pub pr_number: Option<i64>,
    pub branch_name: String,
    pub status: ContributionStatus,
    pub summary: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: i64,
    pub contribution_id: Option<i64>,
    pub event_type: String,
    pub action: Option<String>,
    pub payload: String,
    pub processed: bool,
    pub created_at: String,
    pub processed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_status_roundtrip() {
        for s in &[
            "pending",
            "building",
            "running",
            "completed",
            "build_failed",
            "container_crashed",
            "timeout",
            "destroyed",
            "cancelled",
        ] {
            let parsed: WorkspaceStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<WorkspaceStatus>().is_err());
    }

    #[test]
    fn test_workspace_terminal_set() {
        assert!(!WorkspaceStatus::Pending.is_terminal());
        assert!(!WorkspaceStatus::Building.is_terminal());
        assert!(!WorkspaceStatus::Running.is_terminal());
        assert!(WorkspaceStatus::Completed.is_terminal());
        assert!(WorkspaceStatus::BuildFailed.is_terminal());
        assert!(WorkspaceStatus::ContainerCrashed.is_terminal());
        assert!(WorkspaceStatus::Timeout.is_terminal());
        assert!(WorkspaceStatus::Destroyed.is_terminal());
        assert!(WorkspaceStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_issue_status_roundtrip() {
        for s in &[
            "pending",
            "extracting",
            "open",
            "fixing",
            "pr_open",
            "fixed",
            "error",
        ] {
            let parsed: IssueStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        // Legacy stored form maps onto Open.
        assert_eq!("extracted".parse::<IssueStatus>().unwrap(), IssueStatus::Open);
        assert!("invalid".parse::<IssueStatus>().is_err());
    }

    #[test]
    fn test_contribution_status_roundtrip() {
        for s in &["pending", "pr_open", "merged", "closed"] {
            let parsed: ContributionStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<ContributionStatus>().is_err());
    }

    #[test]
    fn test_log_stream_roundtrip() {
        assert_eq!("stdout".parse::<LogStream>().unwrap(), LogStream::Stdout);
        assert_eq!("stderr".parse::<LogStream>().unwrap(), LogStream::Stderr);
        assert!("stdin".parse::<LogStream>().is_err());
    }

    #[test]
    fn test_serde_produces_snake_case_strings() {
        assert_eq!(
            serde_json::to_string(&WorkspaceStatus::BuildFailed).unwrap(),
            "\"build_failed\""
        );
        assert_eq!(
            serde_json::to_string(&IssueStatus::PrOpen).unwrap(),
            "\"pr_open\""
        );
        assert_eq!(
            serde_json::to_string(&ContributionStatus::Merged).unwrap(),
            "\"merged\""
        );
        assert_eq!(
            serde_json::to_string(&LogStream::Stderr).unwrap(),
            "\"stderr\""
        );
    }

    #[test]
    fn test_serde_deserialize_snake_case_strings() {
        assert_eq!(
            serde_json::from_str::<WorkspaceStatus>("\"container_crashed\"").unwrap(),
            WorkspaceStatus::ContainerCrashed
        );
        assert_eq!(
            serde_json::from_str::<AgentRunStatus>("\"queued\"").unwrap(),
            AgentRunStatus::Queued
        );
    }
}
