//! Fix-prompt construction for the coding agent.
//!
//! Fresh runs get branch-create + push + open-PR instructions; re-runs get
//! rebase-and-reuse instructions so pushing updates the existing PR instead
//! of opening a new one.

use crate::db::models::{Issue, Repository, RepositoryEnvironment};

/// Marker the re-run prompt must carry verbatim.
pub const RERUN_MARKER: &str = "this is a RE-RUN";

pub struct PromptInput<'a> {
    pub issue: &'a Issue,
    pub repository: &'a Repository,
    pub environment: &'a RepositoryEnvironment,
    pub branch_name: &'a str,
    pub base_branch: &'a str,
    /// Set when a prior contribution exists for this issue.
    pub rerun: bool,
}

pub fn build_fix_prompt(input: &PromptInput<'_>) -> String {
    let task = match input.issue.ai_fix_prompt.as_deref() {
        Some(prompt) if !prompt.trim().is_empty() => prompt.trim().to_string(),
        _ => format!(
            "Fix the following issue:\n\nTitle: {}\n\n{}",
            input.issue.title, input.issue.body
        ),
    };

    let mut prompt = format!(
        "You are working in a clone of the fork of {full_name} at /home/agent/repo. \
         The `origin` remote is the fork (your push target); the `upstream` remote is \
         the original repository.\n\n\
         ## Task (issue #{number})\n{task}\n\n\
         ## Environment\n\
         Runtime: {runtime} ({package_manager})\n\
         Setup: {setup}\n\
         Tests: {tests}\n\n",
        full_name = input.repository.full_name,
        number = input.issue.number,
        task = task,
        runtime = input.environment.runtime,
        package_manager = input.environment.package_manager,
        setup = command_or_none(&input.environment.setup_command),
        tests = command_or_none(&input.environment.test_command),
    );

    if input.rerun {
        prompt.push_str(&format!(
            "## Workflow ({marker})\n\
             A pull request for this issue already exists on branch `{branch}`.\n\
             1. `git fetch upstream`\n\
             2. `git checkout {branch}` and rebase it onto `upstream/{base}`\n\
             3. Apply the fix, run the setup and test commands, and commit\n\
             4. `git push --force-with-lease origin {branch}`\n\
             Do NOT create a new pull request: pushing the branch updates the existing one.\n",
            marker = RERUN_MARKER,
            branch = input.branch_name,
            base = input.base_branch,
        ));
    } else {
        prompt.push_str(&format!(
            "## Workflow\n\
             1. `git fetch upstream`\n\
             2. Create branch `{branch}` from `upstream/{base}`\n\
             3. Apply the fix, run the setup and test commands, and commit\n\
             4. `git push -u origin {branch}`\n\
             5. Open a pull request from the fork to {full_name} with \
                `gh pr create --repo {full_name} --base {base}` and print its URL\n",
            branch = input.branch_name,
            base = input.base_branch,
            full_name = input.repository.full_name,
        ));
    }

    prompt.push_str(
        "\nWork autonomously; do not ask questions. Print the pull request URL on its own \
         line when you are done.",
    );
    prompt
}

fn command_or_none(command: &str) -> &str {
    if command.trim().is_empty() {
        "(none)"
    } else {
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::IssueStatus;

    fn fixtures() -> (Issue, Repository, RepositoryEnvironment) {
        let issue = Issue {
            id: 1,
            repository_id: 1,
            number: 42,
            title: "Login crash".to_string(),
            body: "The login page crashes on submit".to_string(),
            labels: vec!["bug".to_string()],
            status: IssueStatus::Open,
            ai_fix_prompt: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        };
        let repository = Repository {
            id: 1,
            full_name: "acme/widget".to_string(),
            origin_url: "https://github.com/acme/widget".to_string(),
            fork_full_name: Some("operator/widget".to_string()),
            fork_url: Some("https://github.com/operator/widget".to_string()),
            language: Some("Node.js".to_string()),
            created_at: "2026-01-01T00:00:00Z".to_string(),
        };
        let environment = RepositoryEnvironment {
            id: 1,
            repository_id: 1,
            runtime: "node".to_string(),
            package_manager: "npm".to_string(),
            setup_command: "npm ci".to_string(),
            test_command: "npm test".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        };
        (issue, repository, environment)
    }

    #[test]
    fn test_fresh_prompt_creates_branch_and_pr() {
        let (issue, repository, environment) = fixtures();
        let prompt = build_fix_prompt(&PromptInput {
            issue: &issue,
            repository: &repository,
            environment: &environment,
            branch_name: "fix/issue-42",
            base_branch: "main",
            rerun: false,
        });
        assert!(prompt.contains("Create branch `fix/issue-42`"));
        assert!(prompt.contains("gh pr create --repo acme/widget"));
        assert!(prompt.contains("issue #42"));
        assert!(prompt.contains("npm ci"));
        assert!(!prompt.contains(RERUN_MARKER));
    }

    #[test]
    fn test_rerun_prompt_reuses_branch_and_skips_pr() {
        let (issue, repository, environment) = fixtures();
        let prompt = build_fix_prompt(&PromptInput {
            issue: &issue,
            repository: &repository,
            environment: &environment,
            branch_name: "fix/issue-42",
            base_branch: "main",
            rerun: true,
        });
        assert!(prompt.contains(RERUN_MARKER));
        assert!(prompt.contains("git checkout fix/issue-42"));
        assert!(prompt.contains("Do NOT create a new pull request"));
        assert!(!prompt.contains("gh pr create"));
    }

    #[test]
    fn test_stored_fix_prompt_takes_precedence() {
        let (mut issue, repository, environment) = fixtures();
        issue.ai_fix_prompt = Some("Precise surgical instructions".to_string());
        let prompt = build_fix_prompt(&PromptInput {
            issue: &issue,
            repository: &repository,
            environment: &environment,
            branch_name: "fix/issue-42",
            base_branch: "main",
            rerun: false,
        });
        assert!(prompt.contains("Precise surgical instructions"));
        assert!(!prompt.contains("The login page crashes"));
    }

    #[test]
    fn test_empty_commands_render_as_none() {
        let (issue, repository, mut environment) = fixtures();
        environment.setup_command = String::new();
        let prompt = build_fix_prompt(&PromptInput {
            issue: &issue,
            repository: &repository,
            environment: &environment,
            branch_name: "fix/issue-42",
            base_branch: "main",
            rerun: false,
        });
        assert!(prompt.contains("Setup: (none)"));
    }
}
