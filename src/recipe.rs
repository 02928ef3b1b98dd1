//! Container recipe synthesis.
//!
//! One synthesis call produces one candidate recipe via the completion RPC.
//! The runner owns the retry loop (up to [`MAX_ATTEMPTS`] synthesize+build
//! rounds), feeding the previous attempt's error back into the next prompt.

use std::sync::Arc;

use crate::errors::SynthesisError;
use crate::llm::CompletionClient;

/// Total synthesize+build attempts before a workspace goes `build_failed`.
pub const MAX_ATTEMPTS: u32 = 3;

const SYSTEM_PROMPT: &str = "You generate Dockerfiles for disposable code-fixing workspaces. \
Respond with the Dockerfile content only: no prose, no markdown fences, no explanations.";

/// Everything the prompt needs to know about the target repository.
#[derive(Debug, Clone)]
pub struct RecipeContext<'a> {
    pub full_name: &'a str,
    pub origin_url: &'a str,
    pub language: Option<&'a str>,
    pub fork_url: &'a str,
}

pub struct RecipeSynthesizer {
    completions: Arc<dyn CompletionClient>,
}

impl RecipeSynthesizer {
    pub fn new(completions: Arc<dyn CompletionClient>) -> Self {
        Self { completions }
    }

    /// One synthesis attempt. The result is fence-stripped and validated;
    /// an invalid recipe fails the attempt without reaching the builder.
    pub async fn synthesize(
        &self,
        ctx: &RecipeContext<'_>,
        previous_error: Option<&str>,
    ) -> Result<String, SynthesisError> {
        let prompt = build_prompt(ctx, previous_error);
        let raw = self
            .completions
            .complete(SYSTEM_PROMPT, &prompt)
            .await
            .map_err(|e| SynthesisError::Completion(format!("{:#}", e)))?;
        let recipe = strip_code_fences(&raw);
        validate_recipe(&recipe).map_err(SynthesisError::InvalidRecipe)?;
        Ok(recipe)
    }
}

/// Base image keyed on the repository's primary language.
pub fn base_image_for(language: Option<&str>) -> &'static str {
    match language.map(|l| l.to_ascii_lowercase()).as_deref() {
        Some("node.js") | Some("javascript") | Some("typescript") => "node:20-bookworm",
        Some("python") => "python:3.12-bookworm",
        Some("rust") => "rust:1-bookworm",
        Some("go") => "golang:1.22-bookworm",
        Some("ruby") => "ruby:3.3-bookworm",
        Some("java") | Some("kotlin") => "eclipse-temurin:21-jdk",
        _ => "ubuntu:24.04",
    }
}

fn build_prompt(ctx: &RecipeContext<'_>, previous_error: Option<&str>) -> String {
    let base_image = base_image_for(ctx.language);
    let mut prompt = format!(
        "Write a Dockerfile for a workspace that will fix issues in {full_name}.\n\n\
         Requirements, all mandatory:\n\
         1. Base image: {base_image}\n\
         2. Install shell utilities (curl, git, sudo, ca-certificates, openssh-client), \
            the GitHub CLI (download the linux archive for the build architecture from \
            https://github.com/cli/cli/releases and install the `gh` binary), and the \
            claude-code coding agent via its installer \
            (curl -fsSL https://claude.ai/install.sh | bash).\n\
         3. Create a non-root user `agent` with passwordless sudo.\n\
         4. Pre-seed /home/agent/.ssh/known_hosts with github.com host keys (ssh-keyscan).\n\
         5. Clone the fork {fork_url} to /home/agent/repo and add an `upstream` remote \
            pointing at {origin_url}.\n\
         6. Extend PATH so the coding agent binary (~/.local/bin) resolves for `agent`.\n\
         7. Default command: a long-running process that keeps the container alive \
            (`tail -f /home/agent/agent.log` after touching the file).\n",
        full_name = ctx.full_name,
        base_image = base_image,
        fork_url = ctx.fork_url,
        origin_url = ctx.origin_url,
    );
    if let Some(error) = previous_error {
        prompt.push_str(&format!(
            "\nThe previous Dockerfile failed with this error; fix the cause:\n{}\n",
            error
        ));
    }
    prompt.push_str("\nRespond with the Dockerfile only.");
    prompt
}

/// Strip markdown code-fence decoration from a completion. If the text
/// contains a fenced block, its content wins; otherwise the trimmed text
/// is returned as-is.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(open) = trimmed.find("```") else {
        return trimmed.to_string();
    };
    let after_fence = &trimmed[open + 3..];
    // Skip the info string ("dockerfile", "Dockerfile", ...) on the fence line.
    let content_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
    let content = &after_fence[content_start..];
    let body = match content.find("```") {
        Some(close) => &content[..close],
        None => content,
    };
    body.trim().to_string()
}

fn validate_recipe(recipe: &str) -> Result<(), String> {
    if recipe.trim().is_empty() {
        return Err("completion returned an empty recipe".to_string());
    }
    let has_from = recipe
        .lines()
        .any(|l| l.trim_start().to_ascii_uppercase().starts_with("FROM "));
    if !has_from {
        return Err("recipe has no FROM instruction".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted completion client: returns canned responses in order.
    pub struct ScriptedCompletions {
        responses: Mutex<Vec<Result<String, String>>>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedCompletions {
        pub fn new(responses: Vec<Result<String, String>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedCompletions {
        async fn complete(&self, _system: &str, prompt: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                anyhow::bail!("no scripted responses left");
            }
            responses.remove(0).map_err(|e| anyhow::anyhow!(e))
        }
    }

    fn ctx<'a>() -> RecipeContext<'a> {
        RecipeContext {
            full_name: "acme/widget",
            origin_url: "https://github.com/acme/widget",
            language: Some("Node.js"),
            fork_url: "https://github.com/operator/widget",
        }
    }

    #[test]
    fn test_base_image_mapping() {
        assert_eq!(base_image_for(Some("Node.js")), "node:20-bookworm");
        assert_eq!(base_image_for(Some("python")), "python:3.12-bookworm");
        assert_eq!(base_image_for(Some("Rust")), "rust:1-bookworm");
        assert_eq!(base_image_for(Some("Go")), "golang:1.22-bookworm");
        assert_eq!(base_image_for(Some("COBOL")), "ubuntu:24.04");
        assert_eq!(base_image_for(None), "ubuntu:24.04");
    }

    #[test]
    fn test_strip_code_fences_plain_text() {
        assert_eq!(strip_code_fences("FROM node:20\n"), "FROM node:20");
    }

    #[test]
    fn test_strip_code_fences_with_info_string() {
        let fenced = "Here you go:\n```dockerfile\nFROM node:20\nRUN true\n```\nEnjoy!";
        assert_eq!(strip_code_fences(fenced), "FROM node:20\nRUN true");
    }

    #[test]
    fn test_strip_code_fences_unclosed() {
        let fenced = "```\nFROM node:20";
        assert_eq!(strip_code_fences(fenced), "FROM node:20");
    }

    #[tokio::test]
    async fn test_synthesize_strips_and_validates() {
        let completions = Arc::new(ScriptedCompletions::new(vec![Ok(
            "```dockerfile\nFROM node:20-bookworm\nUSER agent\n```".to_string(),
        )]));
        let synthesizer = RecipeSynthesizer::new(completions);
        let recipe = synthesizer.synthesize(&ctx(), None).await.unwrap();
        assert!(recipe.starts_with("FROM node:20-bookworm"));
        assert!(!recipe.contains("```"));
    }

    #[tokio::test]
    async fn test_synthesize_rejects_recipe_without_from() {
        let completions = Arc::new(ScriptedCompletions::new(vec![Ok(
            "RUN echo no base image".to_string(),
        )]));
        let synthesizer = RecipeSynthesizer::new(completions);
        let err = synthesizer.synthesize(&ctx(), None).await.unwrap_err();
        assert!(matches!(err, SynthesisError::InvalidRecipe(_)));
    }

    #[tokio::test]
    async fn test_previous_error_appears_in_prompt() {
        let completions = Arc::new(ScriptedCompletions::new(vec![Ok(
            "FROM node:20-bookworm".to_string(),
        )]));
        let synthesizer = RecipeSynthesizer::new(completions.clone());
        synthesizer
            .synthesize(&ctx(), Some("pull access denied for nod:20"))
            .await
            .unwrap();
        let prompts = completions.prompts.lock().unwrap();
        assert!(prompts[0].contains("pull access denied for nod:20"));
        assert!(prompts[0].contains("previous Dockerfile failed"));
    }

    #[tokio::test]
    async fn test_prompt_fixes_the_invariants() {
        let completions = Arc::new(ScriptedCompletions::new(vec![Ok(
            "FROM node:20-bookworm".to_string(),
        )]));
        let synthesizer = RecipeSynthesizer::new(completions.clone());
        synthesizer.synthesize(&ctx(), None).await.unwrap();
        let prompts = completions.prompts.lock().unwrap();
        let prompt = &prompts[0];
        assert!(prompt.contains("node:20-bookworm"));
        assert!(prompt.contains("passwordless sudo"));
        assert!(prompt.contains("known_hosts"));
        assert!(prompt.contains("/home/agent/repo"));
        assert!(prompt.contains("upstream"));
        assert!(prompt.contains("https://github.com/operator/widget"));
        assert!(prompt.contains("tail -f"));
    }

    #[tokio::test]
    async fn test_completion_failure_maps_to_synthesis_error() {
        let completions = Arc::new(ScriptedCompletions::new(vec![Err(
            "rate limited".to_string()
        )]));
        let synthesizer = RecipeSynthesizer::new(completions);
        let err = synthesizer.synthesize(&ctx(), None).await.unwrap_err();
        assert!(matches!(err, SynthesisError::Completion(_)));
    }
}
