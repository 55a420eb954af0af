//! Identifier and branch-name generation
//!
//! Formats: `task_<millis>_<rand>`, `cp_<uuid>`, `template_<uuid>`,
//! `idle-<kebab-title>`, branches `apex/<slug>`.

use rand::Rng;
use rand::distr::Alphanumeric;

const BRANCH_SLUG_MAX: usize = 48;

/// Generate a task id: millisecond timestamp plus a short random suffix
pub fn task_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("task_{}_{}", apexstore::now_ms(), suffix)
}

/// Generate a checkpoint id
pub fn checkpoint_id() -> String {
    format!("cp_{}", uuid::Uuid::now_v7().simple())
}

/// Generate a template id
pub fn template_id() -> String {
    format!("template_{}", uuid::Uuid::now_v7().simple())
}

/// Generate an idle-task id from its title
pub fn idle_task_id(title: &str) -> String {
    format!("idle-{}", slugify(title, usize::MAX))
}

/// Stable branch name derived from the task description
pub fn branch_name(description: &str) -> String {
    let slug = slugify(description, BRANCH_SLUG_MAX);
    if slug.is_empty() {
        "apex/task".to_string()
    } else {
        format!("apex/{}", slug)
    }
}

/// Slugify free text: lowercase, alphanumeric runs joined by hyphens,
/// apostrophes stripped, truncated at a word boundary
fn slugify(text: &str, max_len: usize) -> String {
    let slug = text
        .to_lowercase()
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() {
                Some(c)
            } else if c == '\'' || c == '\u{2019}' || c == '\u{2018}' {
                None
            } else {
                Some('-')
            }
        })
        .collect::<String>();

    let mut out = String::new();
    for part in slug.split('-').filter(|s| !s.is_empty()) {
        let extra = if out.is_empty() { part.len() } else { part.len() + 1 };
        if out.len() + extra > max_len {
            break;
        }
        if !out.is_empty() {
            out.push('-');
        }
        out.push_str(part);
    }
    out
}
