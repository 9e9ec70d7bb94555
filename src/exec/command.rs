//! Command executor
//!
//! Runs a compiled program once per test input, each run bounded by a
//! wall-clock deadline on top of the wrapper's CPU limit.

use crate::config::limits::CommandExecutionPreferences;
use crate::config::loader::{BuilderConfig, TaskManagerConfig};
use crate::config::types::{CommandResult, ProcessStatus, Result, SandboxError};
use crate::exec::runner::{AsyncRun, ProcessRunner};
use crate::exec::wrapper::WrapperContext;
use crate::runtime::task_manager::{IsolatedTask, TaskContext, TaskManager};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_TIME: Duration = Duration::from_millis(8000);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A program invocation: working directory, argv and extra environment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub dir: PathBuf,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

impl Command {
    pub fn new(dir: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Command {
            dir: dir.into(),
            args,
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Input for one run of a command
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInput {
    pub stdin: Option<String>,
}

impl CommandInput {
    pub fn new(stdin: impl Into<String>) -> Self {
        CommandInput {
            stdin: Some(stdin.into()),
        }
    }
}

/// Runs commands under limits with a wall-clock deadline
#[derive(Clone)]
pub struct CommandExecutor {
    context: Arc<WrapperContext>,
    prefs: CommandExecutionPreferences,
    max_time: Duration,
    poll_interval: Duration,
    task_config: TaskManagerConfig,
}

impl CommandExecutor {
    pub fn new(context: Arc<WrapperContext>) -> Self {
        CommandExecutor {
            context,
            prefs: CommandExecutionPreferences::default(),
            max_time: DEFAULT_MAX_TIME,
            poll_interval: DEFAULT_POLL_INTERVAL,
            task_config: TaskManagerConfig::default(),
        }
    }

    pub fn from_config(context: Arc<WrapperContext>, config: &BuilderConfig) -> Self {
        CommandExecutor {
            context,
            prefs: config.default_preferences(),
            max_time: Duration::from_millis(config.executor.max_time_ms),
            poll_interval: Duration::from_millis(config.executor.poll_interval_ms),
            task_config: config.task_manager.clone(),
        }
    }

    pub fn with_preferences(mut self, prefs: CommandExecutionPreferences) -> Self {
        self.prefs = prefs;
        self
    }

    pub fn with_max_time(mut self, max_time: Duration) -> Self {
        self.max_time = max_time;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    pub fn max_time(&self) -> Duration {
        self.max_time
    }

    fn make_runner(&self, command: &Command, input: &CommandInput) -> ProcessRunner {
        let mut runner = ProcessRunner::new(self.context.clone());
        runner.set_preferences(&self.prefs);
        for (key, value) in &command.env {
            runner.set_env(key, value);
        }
        if let Some(stdin) = &input.stdin {
            runner.set_stdin(stdin.clone());
        }
        runner
    }

    fn launch(&self, command: &Command, input: &CommandInput) -> Result<AsyncRun> {
        self.make_runner(command, input)
            .run_asynchronous(command.dir.clone(), command.args.clone())
    }

    /// Run `command` once against `input`
    pub fn execute(&self, command: &Command, input: &CommandInput) -> CommandResult {
        match self.launch(command, input) {
            Ok(run) => self.wait_and_collect(run, None),
            Err(e) => {
                warn!("Could not start process monitor: {}", e);
                CommandResult::failed(
                    ProcessStatus::CouldNotStart,
                    format!("Could not execute process: {}", e),
                )
            }
        }
    }

    fn wait_and_collect(&self, run: AsyncRun, ctx: Option<&TaskContext>) -> CommandResult {
        let started = Instant::now();
        let cancelled = || ctx.map(TaskContext::is_cancelled).unwrap_or(false);

        while run.is_running() && !cancelled() {
            let elapsed = started.elapsed();
            if elapsed >= self.max_time {
                break;
            }
            thread::sleep(self.poll_interval.min(self.max_time - elapsed));
        }

        let timed_out = run.is_running();
        if timed_out {
            info!("Process exceeded {:?}, killing it", self.max_time);
            run.kill_process();
        }

        match run.join() {
            Ok(_) if timed_out => CommandResult::timed_out(),
            Ok(runner) if !runner.is_exit_status_known() => {
                debug!("Exit status unknown: {}", runner.status_message());
                CommandResult::failed(runner.status(), runner.status_message())
            }
            Ok(runner) => runner.command_result(),
            Err(e) => CommandResult::failed(ProcessStatus::CouldNotStart, e.to_string()),
        }
    }

    /// Run each command against its input concurrently; results are index-aligned.
    ///
    /// A single command is reused for every input.
    pub fn execute_all(
        &self,
        commands: &[Command],
        inputs: &[CommandInput],
    ) -> Result<Vec<CommandResult>> {
        if commands.len() != inputs.len() && commands.len() != 1 {
            return Err(SandboxError::Config(format!(
                "{} commands for {} inputs",
                commands.len(),
                inputs.len()
            )));
        }

        let tasks: Vec<Box<dyn IsolatedTask<CommandResult>>> = inputs
            .iter()
            .enumerate()
            .map(|(i, input)| {
                let command = commands.get(i).unwrap_or(&commands[0]).clone();
                let task: Box<dyn IsolatedTask<CommandResult>> = Box::new(CommandTask {
                    executor: self.clone(),
                    command,
                    input: input.clone(),
                });
                task
            })
            .collect();

        // Leave room for the per-command kill and join before the batch deadline
        let batch_time = self.max_time + self.poll_interval + self.task_config.grace_period();
        let mut manager = TaskManager::new(tasks, batch_time, CommandResult::timed_out)?
            .with_config(&self.task_config)
            .with_thread_name_prefix("Command");
        Ok(manager
            .run()
            .into_iter()
            .map(|outcome| outcome.result)
            .collect())
    }
}

struct CommandTask {
    executor: CommandExecutor,
    command: Command,
    input: CommandInput,
}

impl IsolatedTask<CommandResult> for CommandTask {
    fn execute(&self, ctx: &TaskContext) -> CommandResult {
        match self.executor.launch(&self.command, &self.input) {
            Ok(run) => {
                ctx.register_process(run.control());
                self.executor.wait_and_collect(run, Some(ctx))
            }
            Err(e) => CommandResult::failed(
                ProcessStatus::CouldNotStart,
                format!("Could not execute process: {}", e),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mismatched_lengths_rejected() {
        crate::runtime::security::install_default();
        let context = Arc::new(WrapperContext::prepare(&BuilderConfig::default()).unwrap());
        let executor = CommandExecutor::new(context);
        let dir = tempfile::tempdir().unwrap();
        let commands = vec![
            Command::new(dir.path(), vec!["true".to_string()]),
            Command::new(dir.path(), vec!["true".to_string()]),
        ];
        let inputs = vec![CommandInput::default(); 3];
        assert!(matches!(
            executor.execute_all(&commands, &inputs),
            Err(SandboxError::Config(_))
        ));
    }

    #[test]
    fn test_command_deserializes_without_env() {
        let command: Command =
            serde_json::from_str(r#"{"dir": "/tmp", "args": ["./a.out"]}"#).unwrap();
        assert!(command.env.is_empty());
        assert_eq!(command.args, vec!["./a.out".to_string()]);
    }
}
