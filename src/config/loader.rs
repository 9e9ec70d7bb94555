/// Builder configuration loaded from JSON with environment overrides
use crate::config::limits::{CommandExecutionPreferences, WrapperMode};
use crate::config::types::{Result, SandboxError};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "gradebox.json";

pub const ENV_SCRATCH_DIR: &str = "GRADEBOX_SCRATCH_DIR";
pub const ENV_NATIVE_WRAPPER: &str = "GRADEBOX_NATIVE_WRAPPER";
pub const ENV_SANDBOX_LIBRARY: &str = "GRADEBOX_SANDBOX_LIBRARY";
pub const ENV_WRAPPER_MODE: &str = "GRADEBOX_WRAPPER_MODE";

/// What happens to a unit that ignores cancellation past the grace period
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StuckTaskPolicy {
    /// Detach the thread and log it
    #[default]
    Abandon,
    /// Abort the whole process; for supervised daemons that get restarted
    AbortProcess,
}

/// Task manager settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskManagerConfig {
    /// Number of polling slices the deadline is divided into
    pub num_pauses: u32,
    /// Time granted to reclaimed units to observe cancellation
    pub grace_period_ms: u64,
    pub stuck_policy: StuckTaskPolicy,
    /// Prefix for unit thread names
    pub thread_name_prefix: String,
    /// Per-unit cap on captured stdout/stderr bytes
    pub capture_max_bytes: usize,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        TaskManagerConfig {
            num_pauses: 5,
            grace_period_ms: 250,
            stuck_policy: StuckTaskPolicy::Abandon,
            thread_name_prefix: "Thread".to_string(),
            capture_max_bytes: 64 * 1024,
        }
    }
}

impl TaskManagerConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Command executor settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Wall-clock budget for one command
    pub max_time_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            max_time_ms: 8000,
            poll_interval_ms: 500,
        }
    }
}

/// Top-level configuration for a build worker
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Where wrapper scripts are externalized; system temp dir when unset
    pub scratch_dir: Option<PathBuf>,
    pub wrapper_mode: WrapperMode,
    /// Explicit path of the native wrapper; searched next to the current executable when unset
    pub native_wrapper_path: Option<PathBuf>,
    /// Shell used to interpret the wrapper script
    pub shell: PathBuf,
    /// Prebuilt sandbox library injected with `LD_PRELOAD`
    pub sandbox_library_path: Option<PathBuf>,
    /// Limits applied to every command unless overridden
    pub limits: CommandExecutionPreferences,
    pub task_manager: TaskManagerConfig,
    pub executor: ExecutorConfig,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        BuilderConfig {
            scratch_dir: None,
            wrapper_mode: WrapperMode::Script,
            native_wrapper_path: None,
            shell: PathBuf::from("/bin/bash"),
            sandbox_library_path: None,
            limits: CommandExecutionPreferences::default(),
            task_manager: TaskManagerConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl BuilderConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: BuilderConfig = serde_json::from_str(&content)
            .map_err(|e| SandboxError::Config(format!("Failed to parse config JSON: {}", e)))?;

        config.validate()?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load ./gradebox.json if present, defaults otherwise; env overrides applied last
    pub fn load_default() -> Result<Self> {
        let config_path = std::env::current_dir()
            .map_err(|e| SandboxError::Config(format!("Failed to get current directory: {}", e)))?
            .join(DEFAULT_CONFIG_FILE);

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            info!(
                "{} not found in current directory, using built-in defaults",
                DEFAULT_CONFIG_FILE
            );
            Self::default()
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `GRADEBOX_*` environment variables on top of the loaded values
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_SCRATCH_DIR) {
            self.scratch_dir = Some(PathBuf::from(dir));
        }
        if let Some(path) = lookup(ENV_NATIVE_WRAPPER) {
            self.native_wrapper_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup(ENV_SANDBOX_LIBRARY) {
            self.sandbox_library_path = Some(PathBuf::from(path));
        }
        if let Some(mode) = lookup(ENV_WRAPPER_MODE) {
            self.wrapper_mode = match mode.trim() {
                "script" => WrapperMode::Script,
                "native_exe" | "native" => WrapperMode::NativeExe,
                other => {
                    return Err(SandboxError::Config(format!(
                        "{} must be 'script' or 'native_exe', got '{}'",
                        ENV_WRAPPER_MODE, other
                    )))
                }
            };
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.task_manager.num_pauses == 0 {
            return Err(SandboxError::Config(
                "task_manager.num_pauses must be at least 1".to_string(),
            ));
        }
        if self.executor.poll_interval_ms == 0 {
            return Err(SandboxError::Config(
                "executor.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.shell.as_os_str().is_empty() {
            return Err(SandboxError::Config("shell must not be empty".to_string()));
        }
        Ok(())
    }

    /// Preferences with the configured wrapper mode applied
    pub fn default_preferences(&self) -> CommandExecutionPreferences {
        let mut prefs = self.limits.clone();
        prefs.set_wrapper_mode(self.wrapper_mode);
        prefs
    }
}
