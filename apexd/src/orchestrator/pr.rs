//! Pull-request and branch-push operations
//!
//! Shells out to `gh` and `git`, interpreting exit status only; stdout from
//! `gh pr create` is taken verbatim as the PR URL. Title and body
//! generation are pure functions so they stay testable without the CLIs.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use eyre::{Result, eyre};
use tracing::{debug, info};

use apexstore::Task;

/// Max length of the title text after the conventional-commit prefix
const TITLE_SUFFIX_MAX: usize = 60;

/// Leading verbs stripped from descriptions when deriving a PR title
const LEADING_VERBS: [&str; 11] = [
    "implement",
    "add",
    "create",
    "fix",
    "update",
    "make",
    "build",
    "write",
    "introduce",
    "support",
    "refactor",
];

/// Options for creating a pull request
#[derive(Debug, Clone, Default)]
pub struct PrRequest {
    pub title: Option<String>,
    pub body: Option<String>,
    pub draft: bool,
}

/// Result of a PR creation attempt
#[derive(Debug, Clone)]
pub struct PrOutcome {
    pub success: bool,
    pub url: Option<String>,
    pub error: Option<String>,
}

impl PrOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            url: None,
            error: Some(error.into()),
        }
    }
}

/// Result of a branch push attempt
#[derive(Debug, Clone)]
pub struct PushOutcome {
    pub success: bool,
    pub remote_branch: Option<String>,
    pub error: Option<String>,
}

impl PushOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            remote_branch: None,
            error: Some(error.into()),
        }
    }
}

/// Pre-push validation hook (build + test), injectable for tests
#[async_trait]
pub trait PushValidator: Send + Sync {
    async fn validate(&self, project_path: &str) -> Result<()>;
}

/// Validator that accepts everything
pub struct NoopValidator;

#[async_trait]
impl PushValidator for NoopValidator {
    async fn validate(&self, _project_path: &str) -> Result<()> {
        Ok(())
    }
}

/// Validator that runs shell commands in the project directory and requires
/// all of them to exit zero
pub struct CommandValidator {
    pub commands: Vec<String>,
}

#[async_trait]
impl PushValidator for CommandValidator {
    async fn validate(&self, project_path: &str) -> Result<()> {
        for command in &self.commands {
            let status = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(project_path)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await?;
            if !status.success() {
                return Err(eyre!("Pre-push validation failed: {command}"));
            }
        }
        Ok(())
    }
}

/// Conventional-commit type for a workflow name
pub fn conventional_type(workflow: &str) -> &'static str {
    match workflow {
        "bugfix" => "fix",
        "refactor" => "refactor",
        "docs" => "docs",
        "test" | "tests" => "test",
        _ => "feat",
    }
}

/// Derive a conventional-commit PR title from the workflow and description
pub fn generate_pr_title(workflow: &str, description: &str) -> String {
    let prefix = conventional_type(workflow);

    let mut words: Vec<&str> = description.split_whitespace().collect();
    if words.len() > 1
        && let Some(first) = words.first()
        && LEADING_VERBS.contains(&first.to_lowercase().as_str())
    {
        words.remove(0);
    }

    let mut summary = String::new();
    for word in words {
        let extra = if summary.is_empty() { word.len() } else { word.len() + 1 };
        if summary.len() + extra > TITLE_SUFFIX_MAX {
            break;
        }
        if !summary.is_empty() {
            summary.push(' ');
        }
        summary.push_str(word);
    }
    if summary.is_empty() {
        summary = "task changes".to_string();
    }

    // Conventional commit summaries start lowercase
    let mut chars = summary.chars();
    let summary = match chars.next() {
        Some(first) => first.to_lowercase().collect::<String>() + chars.as_str(),
        None => summary,
    };

    format!("{prefix}: {summary}")
}

/// Render the PR body for a task
pub fn generate_pr_body(task: &Task) -> String {
    let mut body = String::new();
    body.push_str("## Summary\n\n");
    body.push_str(&task.description);
    body.push('\n');

    if let Some(criteria) = &task.acceptance_criteria {
        body.push_str("\n## Acceptance Criteria\n\n");
        body.push_str(criteria);
        body.push('\n');
    }

    body.push_str("\n## Details\n\n");
    body.push_str(&format!("- Task: `{}`\n", task.id));
    body.push_str(&format!("- Workflow: `{}`\n", task.workflow));
    body.push_str(&format!("- Branch: `{}`\n", task.branch_name));
    body.push_str(&format!("- Tokens used: {}\n", format_thousands(task.usage.total_tokens)));
    body.push_str(&format!("- Estimated cost: ${:.2}\n", task.usage.estimated_cost));
    body.push_str("\n---\n🤖 Generated by APEX\n");
    body
}

/// Format an integer with thousands separators
pub fn format_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

async fn run(program: &str, args: &[&str], cwd: Option<&Path>) -> Result<(bool, String)> {
    let mut command = tokio::process::Command::new(program);
    command.args(args).stdin(Stdio::null());
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    let output = command.output().await?;
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    debug!(program, ?args, success = output.status.success(), "Ran external command");
    Ok((output.status.success(), stdout))
}

/// Whether the `gh` CLI is installed and runnable
pub async fn gh_available() -> bool {
    run("gh", &["--version"], None).await.map(|(ok, _)| ok).unwrap_or(false)
}

/// Whether the project's origin remote points at GitHub
pub async fn remote_is_github(project_path: &str) -> bool {
    run("git", &["remote", "get-url", "origin"], Some(Path::new(project_path)))
        .await
        .map(|(ok, stdout)| ok && stdout.contains("github.com"))
        .unwrap_or(false)
}

/// Create a pull request via `gh pr create`; returns the PR URL
pub async fn create_pr(project_path: &str, branch: &str, title: &str, body: &str, draft: bool) -> Result<String> {
    let mut args = vec!["pr", "create", "--head", branch, "--title", title, "--body", body];
    if draft {
        args.push("--draft");
    }

    let (ok, stdout) = run("gh", &args, Some(Path::new(project_path))).await?;
    if !ok {
        return Err(eyre!("gh pr create failed"));
    }

    // gh prints the PR URL as the last stdout line
    stdout
        .lines()
        .last()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .ok_or_else(|| eyre!("gh pr create produced no URL"))
}

/// Push the task branch to origin
pub async fn push_branch(project_path: &str, branch: &str) -> Result<()> {
    let (ok, _) = run("git", &["push", "-u", "origin", branch], Some(Path::new(project_path))).await?;
    if !ok {
        return Err(eyre!("git push failed for branch {branch}"));
    }
    info!(branch, "Pushed branch to origin");
    Ok(())
}
