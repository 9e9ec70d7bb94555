//! Resource limit configuration
//!
//! Limits are either passed to the wrapper program as ulimit-style flags
//! (`-f -s -t -u -v`) or consumed by the runner itself (output caps, sandbox).

use crate::utils::output::OutputLimits;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A configurable limit on a wrapped command
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandLimit {
    /// Maximum size of files written, in KB
    FileSizeKb,
    /// Maximum stack size, in KB
    StackSizeKb,
    /// Maximum CPU time, in seconds
    CpuTimeSec,
    /// Maximum number of processes for the user
    Processes,
    /// Maximum virtual memory, in KB
    VmSizeKb,
    /// Maximum bytes read from each output stream
    OutputMaxBytes,
    /// Maximum lines kept from each output stream
    OutputMaxLines,
    /// Maximum characters kept per output line
    OutputLineMaxChars,
    /// Non-zero to inject the sandbox library when available
    EnableSandbox,
    /// Heap size handed to the sandbox library
    SandboxHeapSizeBytes,
}

impl CommandLimit {
    pub const ALL: [CommandLimit; 10] = [
        CommandLimit::FileSizeKb,
        CommandLimit::StackSizeKb,
        CommandLimit::CpuTimeSec,
        CommandLimit::Processes,
        CommandLimit::VmSizeKb,
        CommandLimit::OutputMaxBytes,
        CommandLimit::OutputMaxLines,
        CommandLimit::OutputLineMaxChars,
        CommandLimit::EnableSandbox,
        CommandLimit::SandboxHeapSizeBytes,
    ];

    /// The ulimit flag letter for limits enforced by the wrapper
    pub fn wrapper_flag(self) -> Option<char> {
        match self {
            CommandLimit::FileSizeKb => Some('f'),
            CommandLimit::StackSizeKb => Some('s'),
            CommandLimit::CpuTimeSec => Some('t'),
            CommandLimit::Processes => Some('u'),
            CommandLimit::VmSizeKb => Some('v'),
            _ => None,
        }
    }

    pub fn from_wrapper_flag(flag: char) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|limit| limit.wrapper_flag() == Some(flag))
    }

    pub fn default_value(self) -> Option<i64> {
        match self {
            CommandLimit::FileSizeKb => Some(0),
            CommandLimit::StackSizeKb => Some(128),
            CommandLimit::CpuTimeSec => Some(10),
            CommandLimit::Processes => Some(0),
            CommandLimit::VmSizeKb => Some(32768),
            CommandLimit::OutputMaxBytes => Some(8192),
            CommandLimit::OutputMaxLines => Some(50),
            CommandLimit::OutputLineMaxChars => Some(200),
            CommandLimit::EnableSandbox => Some(1),
            CommandLimit::SandboxHeapSizeBytes => None,
        }
    }
}

impl fmt::Display for CommandLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandLimit::FileSizeKb => "FILE_SIZE_KB",
            CommandLimit::StackSizeKb => "STACK_SIZE_KB",
            CommandLimit::CpuTimeSec => "CPU_TIME_SEC",
            CommandLimit::Processes => "PROCESSES",
            CommandLimit::VmSizeKb => "VM_SIZE_KB",
            CommandLimit::OutputMaxBytes => "OUTPUT_MAX_BYTES",
            CommandLimit::OutputMaxLines => "OUTPUT_MAX_LINES",
            CommandLimit::OutputLineMaxChars => "OUTPUT_LINE_MAX_CHARS",
            CommandLimit::EnableSandbox => "ENABLE_SANDBOX",
            CommandLimit::SandboxHeapSizeBytes => "SANDBOX_HEAP_SIZE_BYTES",
        };
        f.write_str(name)
    }
}

/// Which wrapper program launches the command
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WrapperMode {
    /// Shell script applying limits with `ulimit`
    #[default]
    Script,
    /// Compiled `run-process` wrapper
    NativeExe,
}

/// Caller-supplied limit overrides plus a wrapper choice
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandExecutionPreferences {
    limits: BTreeMap<CommandLimit, i64>,
    wrapper_mode: WrapperMode,
}

impl CommandExecutionPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_limit(&mut self, limit: CommandLimit, value: i64) -> &mut Self {
        self.limits.insert(limit, value);
        self
    }

    pub fn unset_limit(&mut self, limit: CommandLimit) -> &mut Self {
        self.limits.remove(&limit);
        self
    }

    pub fn limit(&self, limit: CommandLimit) -> Option<i64> {
        self.limits.get(&limit).copied()
    }

    /// Limits explicitly set, in `CommandLimit` order
    pub fn limits(&self) -> impl Iterator<Item = (CommandLimit, i64)> + '_ {
        self.limits.iter().map(|(limit, value)| (*limit, *value))
    }

    pub fn wrapper_mode(&self) -> WrapperMode {
        self.wrapper_mode
    }

    pub fn set_wrapper_mode(&mut self, mode: WrapperMode) -> &mut Self {
        self.wrapper_mode = mode;
        self
    }
}

/// Effective limits for one runner: defaults overlaid with preferences
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LimitMap {
    values: BTreeMap<CommandLimit, i64>,
}

impl Default for LimitMap {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl LimitMap {
    pub fn with_defaults() -> Self {
        let values = CommandLimit::ALL
            .into_iter()
            .filter_map(|limit| limit.default_value().map(|value| (limit, value)))
            .collect();
        LimitMap { values }
    }

    /// A map with no limits at all; the wrapper then applies nothing
    pub fn empty() -> Self {
        LimitMap {
            values: BTreeMap::new(),
        }
    }

    pub fn apply(&mut self, prefs: &CommandExecutionPreferences) {
        for (limit, value) in prefs.limits() {
            debug!("Limit override {}={}", limit, value);
            self.values.insert(limit, value);
        }
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn set(&mut self, limit: CommandLimit, value: i64) {
        self.values.insert(limit, value);
    }

    pub fn get(&self, limit: CommandLimit) -> Option<i64> {
        self.values.get(&limit).copied()
    }

    pub fn sandbox_enabled(&self) -> bool {
        self.get(CommandLimit::EnableSandbox)
            .map(|value| value != 0)
            .unwrap_or(false)
    }

    /// Wrapper flags in `f s t u v` order, e.g. `-f0 -s128 -t10 -u0 -v32768`
    pub fn encode_wrapper_flags(&self) -> String {
        self.values
            .iter()
            .filter_map(|(limit, value)| {
                limit
                    .wrapper_flag()
                    .map(|flag| format!("-{}{}", flag, value))
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Output caps; caps missing from the map fall back to their defaults
    pub fn output_limits(&self) -> OutputLimits {
        let resolve = |limit: CommandLimit| -> usize {
            self.get(limit)
                .or_else(|| limit.default_value())
                .map(|value| value.max(0) as usize)
                .unwrap_or(0)
        };
        OutputLimits {
            max_bytes: resolve(CommandLimit::OutputMaxBytes),
            max_lines: resolve(CommandLimit::OutputMaxLines),
            max_chars_per_line: resolve(CommandLimit::OutputLineMaxChars),
        }
    }
}

/// Parse a wrapper flag string back into limits.
///
/// Tokens that are not `-<letter><integer>` for a known letter are skipped.
pub fn parse_wrapper_flags(flags: &str) -> Vec<(CommandLimit, i64)> {
    flags
        .split_whitespace()
        .filter_map(|token| {
            let body = token.strip_prefix('-')?;
            let mut chars = body.chars();
            let limit = CommandLimit::from_wrapper_flag(chars.next()?)?;
            let value = chars.as_str().parse::<i64>().ok()?;
            Some((limit, value))
        })
        .collect()
}
