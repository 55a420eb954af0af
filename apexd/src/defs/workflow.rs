//! Workflow definitions and loading
//!
//! Workflows live in `<projectPath>/.apex/workflows/<name>.yaml` and map an
//! ordered DAG of stages onto agents. A builtin `feature` workflow is
//! embedded in the binary; on-disk definitions with the same name override
//! it.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// One stage of a workflow: a single agent invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDef {
    pub name: String,

    /// Agent resolved against the agent definitions directory
    pub agent: String,

    /// Stage names that must finish before this stage runs
    #[serde(rename = "dependsOn", alias = "depends-on", default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub description: Option<String>,
}

/// A named DAG of stages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDef {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub stages: Vec<StageDef>,
}

impl WorkflowDef {
    /// Validate stage references and acyclicity
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(eyre!("Workflow {} has no stages", self.name));
        }

        let names: Vec<&str> = self.stages.iter().map(|s| s.name.as_str()).collect();
        for stage in &self.stages {
            for dep in &stage.depends_on {
                if !names.contains(&dep.as_str()) {
                    return Err(eyre!(
                        "Workflow {}: stage {} depends on unknown stage {}",
                        self.name,
                        stage.name,
                        dep
                    ));
                }
            }
        }

        self.stage_order()?;
        Ok(())
    }

    /// Topological execution order over the stage DAG
    ///
    /// Among stages whose dependencies are satisfied, declaration order
    /// wins, so a linear workflow executes exactly as written.
    pub fn stage_order(&self) -> Result<Vec<usize>> {
        let mut order = Vec::with_capacity(self.stages.len());
        let mut done: Vec<&str> = Vec::new();
        let mut remaining: Vec<usize> = (0..self.stages.len()).collect();

        while !remaining.is_empty() {
            let next = remaining.iter().position(|&i| {
                self.stages[i]
                    .depends_on
                    .iter()
                    .all(|dep| done.contains(&dep.as_str()))
            });

            match next {
                Some(pos) => {
                    let idx = remaining.remove(pos);
                    done.push(&self.stages[idx].name);
                    order.push(idx);
                }
                None => {
                    return Err(eyre!("Workflow {} has a dependency cycle", self.name));
                }
            }
        }

        Ok(order)
    }
}

const BUILTIN_FEATURE: &str = include_str!("builtin/feature.yaml");

/// Loader for workflow definitions
pub struct WorkflowLoader {
    workflows: HashMap<String, WorkflowDef>,
}

impl WorkflowLoader {
    /// Load builtins plus `<projectPath>/.apex/workflows/*.yaml`
    pub fn load(project_path: impl AsRef<Path>) -> Result<Self> {
        let mut loader = Self {
            workflows: HashMap::new(),
        };

        loader.load_builtin(BUILTIN_FEATURE)?;

        let dir = project_path.as_ref().join(".apex").join("workflows");
        if dir.exists() {
            loader.load_from_directory(&dir)?;
        } else {
            debug!(?dir, "Workflow directory does not exist, builtins only");
        }

        info!(count = loader.workflows.len(), "Loaded workflow definitions");
        Ok(loader)
    }

    /// A loader with only the embedded builtins (used by tests)
    pub fn builtin_only() -> Result<Self> {
        let mut loader = Self {
            workflows: HashMap::new(),
        };
        loader.load_builtin(BUILTIN_FEATURE)?;
        Ok(loader)
    }

    fn load_builtin(&mut self, yaml: &str) -> Result<()> {
        let workflow: WorkflowDef = serde_yaml::from_str(yaml).context("Failed to parse builtin workflow")?;
        workflow.validate()?;
        self.workflows.insert(workflow.name.clone(), workflow);
        Ok(())
    }

    fn load_from_directory(&mut self, dir: &Path) -> Result<()> {
        let entries = fs::read_dir(dir).with_context(|| format!("Failed to read directory: {}", dir.display()))?;

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().map(|e| e == "yml" || e == "yaml").unwrap_or(false)
                && let Err(e) = self.load_from_file(&path)
            {
                warn!(?path, error = %e, "Failed to load workflow file");
            }
        }
        Ok(())
    }

    fn load_from_file(&mut self, path: &Path) -> Result<()> {
        let content = fs::read_to_string(path).with_context(|| format!("Failed to read: {}", path.display()))?;
        let mut workflow: WorkflowDef =
            serde_yaml::from_str(&content).with_context(|| format!("Failed to parse: {}", path.display()))?;

        if workflow.name.is_empty()
            && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
        {
            workflow.name = stem.to_string();
        }

        workflow.validate()?;
        debug!(?path, name = %workflow.name, "Loaded workflow");
        self.workflows.insert(workflow.name.clone(), workflow);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&WorkflowDef> {
        self.workflows.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    /// Insert a definition directly (tests and decomposition)
    pub fn insert(&mut self, workflow: WorkflowDef) {
        self.workflows.insert(workflow.name.clone(), workflow);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(name: &str, deps: &[&str]) -> StageDef {
        StageDef {
            name: name.to_string(),
            agent: "developer".to_string(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            description: None,
        }
    }

    #[test]
    fn test_builtin_feature_parses() {
        let loader = WorkflowLoader::builtin_only().unwrap();
        let feature = loader.get("feature").unwrap();
        assert_eq!(feature.stages.len(), 2);
        assert_eq!(feature.stages[0].name, "planning");
        assert_eq!(feature.stages[1].depends_on, vec!["planning"]);
    }

    #[test]
    fn test_linear_order_is_declaration_order() {
        let workflow = WorkflowDef {
            name: "linear".to_string(),
            description: String::new(),
            stages: vec![stage("a", &[]), stage("b", &["a"]), stage("c", &["b"])],
        };
        assert_eq!(workflow.stage_order().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_dag_order_respects_dependencies() {
        let workflow = WorkflowDef {
            name: "diamond".to_string(),
            description: String::new(),
            stages: vec![
                stage("fan-in", &["left", "right"]),
                stage("left", &["root"]),
                stage("right", &["root"]),
                stage("root", &[]),
            ],
        };
        let order = workflow.stage_order().unwrap();
        let pos = |name: &str| {
            order
                .iter()
                .position(|&i| workflow.stages[i].name == name)
                .unwrap()
        };
        assert!(pos("root") < pos("left"));
        assert!(pos("root") < pos("right"));
        assert!(pos("fan-in") > pos("left"));
        assert!(pos("fan-in") > pos("right"));
    }

    #[test]
    fn test_cycle_detected() {
        let workflow = WorkflowDef {
            name: "cyclic".to_string(),
            description: String::new(),
            stages: vec![stage("a", &["b"]), stage("b", &["a"])],
        };
        let err = workflow.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let workflow = WorkflowDef {
            name: "broken".to_string(),
            description: String::new(),
            stages: vec![stage("a", &["ghost"])],
        };
        let err = workflow.validate().unwrap_err();
        assert!(err.to_string().contains("unknown stage ghost"));
    }

    #[test]
    fn test_disk_definitions_override_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let workflows = dir.path().join(".apex").join("workflows");
        fs::create_dir_all(&workflows).unwrap();
        fs::write(
            workflows.join("feature.yaml"),
            "name: feature\nstages:\n  - name: solo\n    agent: developer\n",
        )
        .unwrap();

        let loader = WorkflowLoader::load(dir.path()).unwrap();
        let feature = loader.get("feature").unwrap();
        assert_eq!(feature.stages.len(), 1);
        assert_eq!(feature.stages[0].name, "solo");
    }

    #[test]
    fn test_unparseable_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let workflows = dir.path().join(".apex").join("workflows");
        fs::create_dir_all(&workflows).unwrap();
        fs::write(workflows.join("broken.yaml"), ": not yaml {").unwrap();

        let loader = WorkflowLoader::load(dir.path()).unwrap();
        assert!(loader.get("feature").is_some(), "builtins survive a broken file");
        assert!(loader.get("broken").is_none());
    }
}
