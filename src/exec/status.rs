//! Wrapper status file
//!
//! The wrapper writes two lines: a tag (`exited`, `failed_to_execute`,
//! `terminated_by_signal`) and an integer code.

use crate::config::types::ProcessStatus;
use log::{debug, warn};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

/// Environment variable naming the status file
pub const STATUS_FILE_ENV: &str = "CC_PROC_STAT_FILE";

pub const STATUS_UNDETERMINED: &str = "Process status could not be determined";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitTag {
    Exited,
    FailedToExecute,
    TerminatedBySignal,
}

impl ExitTag {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitTag::Exited => "exited",
            ExitTag::FailedToExecute => "failed_to_execute",
            ExitTag::TerminatedBySignal => "terminated_by_signal",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "exited" => Some(ExitTag::Exited),
            "failed_to_execute" => Some(ExitTag::FailedToExecute),
            "terminated_by_signal" => Some(ExitTag::TerminatedBySignal),
            _ => None,
        }
    }
}

impl fmt::Display for ExitTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contents of a status file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitRecord {
    pub tag: ExitTag,
    pub code: i32,
}

impl ExitRecord {
    /// Parse status file contents; `None` if truncated or malformed.
    /// An unknown tag is reported as `Err` with the tag text.
    pub fn parse(content: &str) -> Option<Result<Self, String>> {
        let mut lines = content.lines().map(str::trim);
        let tag = lines.next().filter(|t| !t.is_empty())?;
        let code = lines.next()?.parse::<i32>().ok()?;
        Some(match ExitTag::parse(tag) {
            Some(tag) => Ok(ExitRecord { tag, code }),
            None => Err(tag.to_string()),
        })
    }

    pub fn render(&self) -> String {
        format!("{}\n{}\n", self.tag, self.code)
    }

    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        fs::write(path, self.render())
    }
}

/// Termination cause derived from the status file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusResolution {
    pub status: ProcessStatus,
    pub exit_code: i32,
    pub message: String,
    /// False when the wrapper reports that the command itself never ran
    pub process_started: bool,
}

impl StatusResolution {
    fn undetermined(exit_code: i32) -> Self {
        StatusResolution {
            status: ProcessStatus::CouldNotStart,
            exit_code,
            message: STATUS_UNDETERMINED.to_string(),
            process_started: true,
        }
    }
}

/// Map a terminating signal to a status.
///
/// SIGKILL comes from the CPU hard limit or our own kill, SIGXCPU from the
/// soft CPU limit; both mean the process ran out of time.
pub fn classify_signal(signal: i32) -> ProcessStatus {
    if signal == libc::SIGKILL || signal == libc::SIGXCPU {
        ProcessStatus::TimedOut
    } else if signal == libc::SIGXFSZ {
        ProcessStatus::FileSizeLimitExceeded
    } else {
        ProcessStatus::KilledBySignal
    }
}

/// Interpret a parsed record
pub fn resolve_record(record: ExitRecord) -> StatusResolution {
    match record.tag {
        ExitTag::Exited => StatusResolution {
            status: ProcessStatus::Exited,
            exit_code: record.code,
            message: format!("Process exited with code {}", record.code),
            process_started: true,
        },
        ExitTag::FailedToExecute => StatusResolution {
            status: ProcessStatus::CouldNotStart,
            exit_code: record.code,
            message: "Process could not be executed".to_string(),
            process_started: false,
        },
        ExitTag::TerminatedBySignal => {
            let status = classify_signal(record.code);
            let message = match status {
                ProcessStatus::TimedOut => {
                    format!("Process timed out (terminated by signal {})", record.code)
                }
                ProcessStatus::FileSizeLimitExceeded => format!(
                    "Process exceeded the file size limit (terminated by signal {})",
                    record.code
                ),
                _ => format!("Process crashed (terminated by signal {})", record.code),
            };
            StatusResolution {
                status,
                exit_code: record.code,
                message,
                process_started: true,
            }
        }
    }
}

/// Read and interpret the status file at `path`.
///
/// `fallback_code` is reported as the exit code when the file is unusable.
pub fn read_status_file(path: &Path, fallback_code: i32) -> StatusResolution {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!("Could not read process status file {}: {}", path.display(), e);
            return StatusResolution::undetermined(fallback_code);
        }
    };

    match ExitRecord::parse(&content) {
        Some(Ok(record)) => {
            debug!("Process status: {} {}", record.tag, record.code);
            resolve_record(record)
        }
        Some(Err(tag)) => {
            warn!("Unknown process status tag '{}'", tag);
            StatusResolution::undetermined(fallback_code)
        }
        None => {
            warn!("Malformed process status file {}", path.display());
            StatusResolution::undetermined(fallback_code)
        }
    }
}
