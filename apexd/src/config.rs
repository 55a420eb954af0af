//! APEX daemon configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use apexstore::Autonomy;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Agent transport (LLM provider) configuration
    pub llm: LlmConfig,

    /// Per-task and per-day resource limits
    pub limits: LimitsConfig,

    /// Git integration
    pub git: GitConfig,

    /// Opaque model routing info passed through to the agent transport
    pub models: HashMap<String, serde_yaml::Value>,

    /// Daemon-level behavior
    pub daemon: DaemonConfig,

    /// Workspace handling
    pub workspace: WorkspaceConfig,

    /// Autonomy policy
    pub autonomy: AutonomyConfig,
}

impl Config {
    /// Load configuration with fallback chain: explicit path, project-local
    /// `.apex.yml`, user config `~/.config/apex/apex.yml`, then defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".apex.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("apex").join("apex.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Whether completed-task workspaces are cleaned up (absent means yes)
    pub fn cleanup_on_complete(&self) -> bool {
        self.workspace.cleanup_on_complete.unwrap_or(true)
    }
}

/// Agent transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name (currently only "anthropic" supported)
    pub provider: String,

    /// Default model identifier
    pub model: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Maximum tokens per response
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Context window size used for session-pressure estimation
    #[serde(rename = "context-window")]
    pub context_window: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 16384,
            timeout_ms: 300_000,
            context_window: 200_000,
        }
    }
}

/// Resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum tasks executing at once
    #[serde(rename = "max-concurrent-tasks")]
    pub max_concurrent_tasks: usize,

    /// Per-task token cap; None means unlimited
    #[serde(rename = "max-tokens-per-task")]
    pub max_tokens_per_task: Option<u64>,

    /// Per-task cost cap in USD; None means unlimited
    #[serde(rename = "max-cost-per-task")]
    pub max_cost_per_task: Option<f64>,

    /// Daily spend budget in USD
    #[serde(rename = "daily-budget")]
    pub daily_budget: f64,

    /// Maximum agent turns per stage
    #[serde(rename = "max-turns")]
    pub max_turns: u32,

    /// Transient-failure retries per task
    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    /// Base backoff delay between retries
    #[serde(rename = "retry-delay-ms")]
    pub retry_delay_ms: u64,

    /// Exponential backoff factor
    #[serde(rename = "retry-backoff-factor")]
    pub retry_backoff_factor: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            max_tokens_per_task: None,
            max_cost_per_task: None,
            daily_budget: 25.0,
            max_turns: 50,
            max_retries: 3,
            retry_delay_ms: 1_000,
            retry_backoff_factor: 2.0,
        }
    }
}

impl LimitsConfig {
    /// Backoff before retry attempt `n` (0-based)
    pub fn retry_backoff(&self, attempt: u32) -> std::time::Duration {
        let ms = self.retry_delay_ms as f64 * self.retry_backoff_factor.powi(attempt as i32);
        std::time::Duration::from_millis(ms as u64)
    }
}

/// Git integration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// Create a worktree per task
    #[serde(rename = "auto-worktree")]
    pub auto_worktree: bool,

    /// Push the task branch after completion
    #[serde(rename = "push-after-task")]
    pub push_after_task: bool,
}

/// Daemon-level behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    #[serde(rename = "session-recovery")]
    pub session_recovery: SessionRecoveryConfig,

    #[serde(rename = "time-based-usage")]
    pub time_based_usage: TimeBasedUsageConfig,

    pub watchdog: WatchdogConfig,

    #[serde(rename = "health-check")]
    pub health_check: HealthCheckConfig,

    /// Scheduler poll interval in milliseconds
    #[serde(rename = "poll-interval")]
    pub poll_interval_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            session_recovery: SessionRecoveryConfig::default(),
            time_based_usage: TimeBasedUsageConfig::default(),
            watchdog: WatchdogConfig::default(),
            health_check: HealthCheckConfig::default(),
            poll_interval_ms: 5_000,
        }
    }
}

/// Session recovery (checkpoint/resume) behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionRecoveryConfig {
    pub enabled: bool,

    /// Resume attempts before a paused task is forced to failed
    #[serde(rename = "max-resume-attempts")]
    pub max_resume_attempts: u32,

    /// Context-window utilization at which a checkpoint is required
    #[serde(rename = "context-window-threshold")]
    pub context_window_threshold: f64,

    /// Automatically resume eligible paused tasks
    #[serde(rename = "auto-resume")]
    pub auto_resume: bool,
}

impl Default for SessionRecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_resume_attempts: 3,
            context_window_threshold: 0.8,
            auto_resume: true,
        }
    }
}

/// Per-mode resource caps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeThresholds {
    /// Maximum active tasks in this mode
    #[serde(rename = "max-active-tasks")]
    pub max_active_tasks: usize,
}

impl Default for ModeThresholds {
    fn default() -> Self {
        Self { max_active_tasks: 3 }
    }
}

/// Time-of-day capacity windows
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeBasedUsageConfig {
    pub enabled: bool,

    /// Local hours considered day mode
    #[serde(rename = "day-mode-hours")]
    pub day_mode_hours: Vec<u32>,

    /// Local hours considered night mode
    #[serde(rename = "night-mode-hours")]
    pub night_mode_hours: Vec<u32>,

    /// Fraction of daily budget at which day mode pauses work
    #[serde(rename = "day-mode-capacity-threshold")]
    pub day_mode_capacity_threshold: f64,

    /// Fraction of daily budget at which night mode pauses work
    #[serde(rename = "night-mode-capacity-threshold")]
    pub night_mode_capacity_threshold: f64,

    #[serde(rename = "day-mode-thresholds")]
    pub day_mode_thresholds: ModeThresholds,

    #[serde(rename = "night-mode-thresholds")]
    pub night_mode_thresholds: ModeThresholds,
}

impl Default for TimeBasedUsageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            day_mode_hours: (8..18).collect(),
            night_mode_hours: vec![22, 23, 0, 1, 2, 3, 4, 5],
            day_mode_capacity_threshold: 0.7,
            night_mode_capacity_threshold: 0.9,
            day_mode_thresholds: ModeThresholds { max_active_tasks: 3 },
            night_mode_thresholds: ModeThresholds { max_active_tasks: 1 },
        }
    }
}

/// Watchdog supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,

    #[serde(rename = "interval-ms")]
    pub interval_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 60_000,
        }
    }
}

/// Periodic health checks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,

    #[serde(rename = "interval-ms")]
    pub interval_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
        }
    }
}

/// Workspace handling
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Clean up a task's workspace on completion; absent means true
    #[serde(rename = "cleanup-on-complete")]
    pub cleanup_on_complete: Option<bool>,
}

/// Autonomy policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutonomyConfig {
    pub default: Autonomy,
    pub allowed: Vec<Autonomy>,
}

impl Default for AutonomyConfig {
    fn default() -> Self {
        Self {
            default: Autonomy::Full,
            allowed: vec![Autonomy::Full, Autonomy::ReviewBeforeMerge, Autonomy::Manual],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.limits.max_concurrent_tasks, 3);
        assert_eq!(config.limits.max_retries, 3);
        assert_eq!(config.daemon.session_recovery.max_resume_attempts, 3);
        assert!((config.daemon.session_recovery.context_window_threshold - 0.8).abs() < f64::EPSILON);
        assert!(config.cleanup_on_complete(), "absent cleanup flag defaults to true");
        assert!(!config.git.push_after_task);
    }

    #[test]
    fn test_cleanup_on_complete_explicit_false() {
        let mut config = Config::default();
        config.workspace.cleanup_on_complete = Some(false);
        assert!(!config.cleanup_on_complete());
    }

    #[test]
    fn test_retry_backoff_grows_exponentially() {
        let limits = LimitsConfig {
            retry_delay_ms: 100,
            retry_backoff_factor: 2.0,
            ..Default::default()
        };
        assert_eq!(limits.retry_backoff(0).as_millis(), 100);
        assert_eq!(limits.retry_backoff(1).as_millis(), 200);
        assert_eq!(limits.retry_backoff(2).as_millis(), 400);
    }

    #[test]
    fn test_parse_kebab_case_yaml() {
        let yaml = r#"
limits:
  max-concurrent-tasks: 5
  max-cost-per-task: 2.5
  retry-delay-ms: 250
git:
  push-after-task: true
daemon:
  poll-interval: 1000
  session-recovery:
    max-resume-attempts: 5
  time-based-usage:
    day-mode-hours: [9, 10, 11]
    night-mode-thresholds:
      max-active-tasks: 2
workspace:
  cleanup-on-complete: false
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.limits.max_concurrent_tasks, 5);
        assert_eq!(config.limits.max_cost_per_task, Some(2.5));
        assert_eq!(config.limits.retry_delay_ms, 250);
        assert!(config.git.push_after_task);
        assert_eq!(config.daemon.poll_interval_ms, 1000);
        assert_eq!(config.daemon.session_recovery.max_resume_attempts, 5);
        assert_eq!(config.daemon.time_based_usage.day_mode_hours, vec![9, 10, 11]);
        assert_eq!(config.daemon.time_based_usage.night_mode_thresholds.max_active_tasks, 2);
        assert_eq!(config.workspace.cleanup_on_complete, Some(false));
    }

    #[test]
    fn test_unspecified_sections_fall_back() {
        let config: Config = serde_yaml::from_str("git:\n  auto-worktree: true\n").unwrap();
        assert!(config.git.auto_worktree);
        assert_eq!(config.limits.max_concurrent_tasks, 3);
        assert_eq!(config.llm.provider, "anthropic");
    }
}
