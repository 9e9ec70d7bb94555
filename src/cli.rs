use crate::config::limits::{CommandExecutionPreferences, CommandLimit, WrapperMode};
use crate::config::loader::BuilderConfig;
use crate::exec::command::{Command, CommandExecutor, CommandInput};
use crate::exec::wrapper::WrapperContext;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./gradebox.json when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Append security audit records to this file
    #[arg(long, global = true)]
    audit_log: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum WrapperArg {
    Script,
    Native,
}

impl From<WrapperArg> for WrapperMode {
    fn from(arg: WrapperArg) -> Self {
        match arg {
            WrapperArg::Script => WrapperMode::Script,
            WrapperArg::Native => WrapperMode::NativeExe,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run one command under resource limits and print the result as JSON
    Run {
        /// Working directory (defaults to the current directory)
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Text sent to the command's stdin
        #[arg(long, conflicts_with = "stdin_file")]
        stdin: Option<String>,
        /// File whose contents are sent to the command's stdin
        #[arg(long)]
        stdin_file: Option<PathBuf>,
        /// Wrapper program
        #[arg(long, value_enum)]
        wrapper: Option<WrapperArg>,
        /// CPU time limit in seconds
        #[arg(long)]
        cpu: Option<i64>,
        /// Virtual memory limit in KB
        #[arg(long)]
        mem_kb: Option<i64>,
        /// Stack size limit in KB
        #[arg(long)]
        stack_kb: Option<i64>,
        /// File size limit in KB
        #[arg(long)]
        file_size_kb: Option<i64>,
        /// Process count limit
        #[arg(long)]
        processes: Option<i64>,
        /// Maximum captured lines per stream
        #[arg(long)]
        max_lines: Option<i64>,
        /// Maximum characters per captured line
        #[arg(long)]
        max_chars: Option<i64>,
        /// Maximum bytes read per stream
        #[arg(long)]
        max_bytes: Option<i64>,
        /// Do not inject the sandbox library
        #[arg(long)]
        no_sandbox: bool,
        /// Wall-clock limit in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Command and arguments
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Report which wrappers and sandbox library are available
    Check,
}

fn load_config(path: Option<&PathBuf>) -> Result<BuilderConfig> {
    let mut config = match path {
        Some(path) => BuilderConfig::load_from_file(path)?,
        None => return Ok(BuilderConfig::load_default()?),
    };
    config.apply_env_overrides()?;
    Ok(config)
}

pub fn run() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    if let Some(path) = cli.audit_log {
        crate::observability::audit::init_security_logger(path)?;
    }

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Run {
            dir,
            stdin,
            stdin_file,
            wrapper,
            cpu,
            mem_kb,
            stack_kb,
            file_size_kb,
            processes,
            max_lines,
            max_chars,
            max_bytes,
            no_sandbox,
            timeout_ms,
            command,
        } => {
            let mut prefs: CommandExecutionPreferences = config.default_preferences();
            let overrides = [
                (CommandLimit::CpuTimeSec, cpu),
                (CommandLimit::VmSizeKb, mem_kb),
                (CommandLimit::StackSizeKb, stack_kb),
                (CommandLimit::FileSizeKb, file_size_kb),
                (CommandLimit::Processes, processes),
                (CommandLimit::OutputMaxLines, max_lines),
                (CommandLimit::OutputLineMaxChars, max_chars),
                (CommandLimit::OutputMaxBytes, max_bytes),
            ];
            for (limit, value) in overrides {
                if let Some(value) = value {
                    prefs.set_limit(limit, value);
                }
            }
            if no_sandbox {
                prefs.set_limit(CommandLimit::EnableSandbox, 0);
            }
            if let Some(wrapper) = wrapper {
                prefs.set_wrapper_mode(wrapper.into());
            }

            let stdin = match (stdin, stdin_file) {
                (Some(text), _) => Some(text),
                (None, Some(path)) => Some(
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?,
                ),
                (None, None) => None,
            };

            let dir = match dir {
                Some(dir) => dir,
                None => std::env::current_dir().context("current directory")?,
            };

            let context = Arc::new(WrapperContext::prepare(&config)?);
            let mut executor =
                CommandExecutor::from_config(context, &config).with_preferences(prefs);
            if let Some(ms) = timeout_ms {
                executor = executor.with_max_time(Duration::from_millis(ms));
            }

            let result = executor.execute(&Command::new(dir, command), &CommandInput { stdin });
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Commands::Check => {
            let context = WrapperContext::prepare(&config)?;
            let report = serde_json::json!({
                "shell": context.shell(),
                "script": context.script_path(),
                "native_wrapper": context.native_wrapper(),
                "sandbox_library": context.sandbox_library(),
                "default_wrapper": config.wrapper_mode,
                "effective_wrapper": context.effective_mode(config.wrapper_mode),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}
