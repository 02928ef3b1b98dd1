//! Provider operations through the `gh` CLI.
//!
//! Fork management and PR lookups shell out to `gh`, authenticated with the
//! operator token. The runner treats these as best-effort provider state:
//! a missing fork is created, an existing open PR is recorded for re-runs.

use std::process::Stdio;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::process::Command;

#[derive(Clone)]
pub struct ProviderCli {
    token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenPr {
    pub url: String,
    pub number: i64,
}

#[derive(Deserialize)]
struct PrListEntry {
    url: String,
    number: i64,
}

impl ProviderCli {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }

    /// Login of the authenticated operator account (the fork owner).
    pub async fn viewer_login(&self) -> Result<String> {
        let output = self.gh(&["api", "user", "--jq", ".login"]).await?;
        let login = String::from_utf8_lossy(&output).trim().to_string();
        if login.is_empty() {
            anyhow::bail!("gh returned an empty login");
        }
        Ok(login)
    }

    /// Make sure a fork of `full_name` exists under the operator account.
    /// Returns (fork full name, fork URL).
    pub async fn ensure_fork(&self, full_name: &str) -> Result<(String, String)> {
        let login = self.viewer_login().await?;
        let repo_name = full_name
            .rsplit('/')
            .next()
            .context("Repository full name has no name part")?;
        let fork_full_name = format!("{}/{}", login, repo_name);

        let exists = self
            .gh(&["repo", "view", &fork_full_name, "--json", "nameWithOwner"])
            .await
            .is_ok();
        if !exists {
            self.gh(&["repo", "fork", full_name, "--clone=false"])
                .await
                .with_context(|| format!("Failed to fork {}", full_name))?;
        }
        Ok((fork_full_name.clone(), fork_url_for(&fork_full_name)))
    }

    /// Look for an open PR on `full_name` whose head is `branch`.
    pub async fn find_open_pr(&self, full_name: &str, branch: &str) -> Result<Option<OpenPr>> {
        let output = self
            .gh(&[
                "pr",
                "list",
                "--repo",
                full_name,
                "--state",
                "open",
                "--head",
                branch,
                "--json",
                "url,number",
            ])
            .await?;
        parse_pr_list(&String::from_utf8_lossy(&output))
    }

    async fn gh(&self, args: &[&str]) -> Result<Vec<u8>> {
        let mut cmd = Command::new("gh");
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(token) = &self.token {
            cmd.env("GH_TOKEN", token);
        }
        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to run gh {}", args.join(" ")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("gh {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(output.stdout)
    }
}

pub fn fork_url_for(fork_full_name: &str) -> String {
    format!("https://github.com/{}", fork_full_name)
}

fn parse_pr_list(json: &str) -> Result<Option<OpenPr>> {
    let entries: Vec<PrListEntry> =
        serde_json::from_str(json.trim()).context("Failed to parse gh pr list output")?;
    Ok(entries.into_iter().next().map(|e| OpenPr {
        url: e.url,
        number: e.number,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fork_url_for() {
        assert_eq!(
            fork_url_for("operator/widget"),
            "https://github.com/operator/widget"
        );
    }

    #[test]
    fn test_parse_pr_list_first_entry_wins() {
        let json = r#"[
            {"url": "https://github.com/acme/widget/pull/7", "number": 7},
            {"url": "https://github.com/acme/widget/pull/8", "number": 8}
        ]"#;
        let pr = parse_pr_list(json).unwrap().unwrap();
        assert_eq!(pr.url, "https://github.com/acme/widget/pull/7");
        assert_eq!(pr.number, 7);
    }

    #[test]
    fn test_parse_pr_list_empty() {
        assert!(parse_pr_list("[]").unwrap().is_none());
    }

    #[test]
    fn test_parse_pr_list_garbage() {
        assert!(parse_pr_list("not json").is_err());
    }
}
