//! Agent definitions and loading
//!
//! Agents live in `<projectPath>/.apex/agents/<name>.md` as markdown with a
//! YAML front-matter header; the body after the front-matter is the agent's
//! system prompt. A builtin `developer` agent is embedded in the binary.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// YAML front-matter of an agent file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AgentFrontMatter {
    name: String,
    description: String,
    tools: Vec<String>,
    model: String,
    role: Option<String>,
    instructions: Option<String>,
}

/// A named external actor invoked per workflow stage
#[derive(Debug, Clone)]
pub struct AgentDef {
    pub name: String,
    pub description: String,
    pub tools: Vec<String>,
    pub model: String,
    pub role: Option<String>,
    pub instructions: Option<String>,
    /// Markdown body after the front-matter
    pub system_prompt: String,
}

impl AgentDef {
    /// Parse an agent definition from markdown with YAML front-matter
    ///
    /// Without front-matter the whole file becomes the system prompt and
    /// the fallback name applies.
    pub fn parse(content: &str, fallback_name: &str) -> Result<Self> {
        let (front, body) = split_front_matter(content);

        let matter: AgentFrontMatter = match front {
            Some(yaml) => serde_yaml::from_str(yaml).context("Failed to parse agent front-matter")?,
            None => AgentFrontMatter::default(),
        };

        let name = if matter.name.is_empty() {
            fallback_name.to_string()
        } else {
            matter.name
        };

        Ok(Self {
            name,
            description: matter.description,
            tools: matter.tools,
            model: matter.model,
            role: matter.role,
            instructions: matter.instructions,
            system_prompt: body.trim().to_string(),
        })
    }
}

/// Split `---` delimited front-matter from the markdown body
fn split_front_matter(content: &str) -> (Option<&str>, &str) {
    let Some(rest) = content.strip_prefix("---") else {
        return (None, content);
    };
    let Some(rest) = rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n")) else {
        return (None, content);
    };

    for marker in ["\n---\n", "\n---\r\n"] {
        if let Some(end) = rest.find(marker) {
            return (Some(&rest[..end]), &rest[end + marker.len()..]);
        }
    }
    if let Some(stripped) = rest.strip_suffix("\n---") {
        return (Some(stripped), "");
    }
    (None, content)
}

const BUILTIN_DEVELOPER: &str = include_str!("builtin/developer.md");

/// Loader for agent definitions
pub struct AgentLoader {
    agents: HashMap<String, AgentDef>,
}

impl AgentLoader {
    /// Load builtins plus `<projectPath>/.apex/agents/*.md`
    pub fn load(project_path: impl AsRef<Path>) -> Result<Self> {
        let mut loader = Self { agents: HashMap::new() };

        let builtin = AgentDef::parse(BUILTIN_DEVELOPER, "developer")?;
        loader.agents.insert(builtin.name.clone(), builtin);

        let dir = project_path.as_ref().join(".apex").join("agents");
        if dir.exists() {
            loader.load_from_directory(&dir)?;
        } else {
            debug!(?dir, "Agent directory does not exist, builtins only");
        }

        info!(count = loader.agents.len(), "Loaded agent definitions");
        Ok(loader)
    }

    /// A loader with only the embedded builtins (used by tests)
    pub fn builtin_only() -> Result<Self> {
        let mut loader = Self { agents: HashMap::new() };
        let builtin = AgentDef::parse(BUILTIN_DEVELOPER, "developer")?;
        loader.agents.insert(builtin.name.clone(), builtin);
        Ok(loader)
    }

    fn load_from_directory(&mut self, dir: &Path) -> Result<()> {
        let entries = fs::read_dir(dir).with_context(|| format!("Failed to read directory: {}", dir.display()))?;

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().map(|e| e == "md").unwrap_or(false) {
                match self.load_from_file(&path) {
                    Ok(()) => {}
                    Err(e) => warn!(?path, error = %e, "Failed to load agent file"),
                }
            }
        }
        Ok(())
    }

    fn load_from_file(&mut self, path: &Path) -> Result<()> {
        let content = fs::read_to_string(path).with_context(|| format!("Failed to read: {}", path.display()))?;
        let fallback = path.file_stem().and_then(|s| s.to_str()).unwrap_or("agent");
        let agent = AgentDef::parse(&content, fallback)?;
        debug!(?path, name = %agent.name, "Loaded agent");
        self.agents.insert(agent.name.clone(), agent);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&AgentDef> {
        self.agents.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
