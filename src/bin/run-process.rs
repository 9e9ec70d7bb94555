//! Native wrapper: `run-process <command> [args...]`
//!
//! Applies the limits from `CC_PROCESS_RESOURCE_LIMITS` in the child,
//! executes the command, waits for it, and records how it ended in the
//! file named by `CC_PROC_STAT_FILE`. Exits with the child's exit code, or
//! with the signal number if the child was killed by a signal.

use anyhow::{Context, Result};
use gradebox::config::limits::parse_wrapper_flags;
use gradebox::exec::runner::{HEAP_SIZE_ENV, LD_PRELOAD_ENV, RESOURCE_LIMITS_ENV};
use gradebox::exec::status::{ExitRecord, ExitTag, STATUS_FILE_ENV};
use gradebox::kernel::{rlimit, signal::SigtermForwarder};
use std::ffi::OsString;
use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Command, ExitStatus};

/// Exit code for failures of the wrapper itself
const EXIT_FATAL_ERROR: i32 = 111;
/// Exit code reported when the command could not be executed
const EXIT_FAILED_TO_EXECUTE: i32 = 127;

fn main() {
    env_logger::init();

    let args: Vec<OsString> = std::env::args_os().skip(1).collect();
    if args.is_empty() {
        eprintln!("usage: run-process <command> [args...]");
        std::process::exit(EXIT_FATAL_ERROR);
    }

    let code = match run(&args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("run-process: {:#}", e);
            EXIT_FATAL_ERROR
        }
    };
    std::process::exit(code);
}

fn run(args: &[OsString]) -> Result<i32> {
    let limits = std::env::var(RESOURCE_LIMITS_ENV)
        .map(|flags| parse_wrapper_flags(&flags))
        .unwrap_or_default();
    let resolved = rlimit::resolve(&limits);
    let status_file = std::env::var_os(STATUS_FILE_ENV).map(PathBuf::from);

    let forwarder = SigtermForwarder::install()
        .map_err(anyhow::Error::msg)
        .context("signal setup")?;

    let mut command = Command::new(&args[0]);
    command.args(&args[1..]);
    if let Some(preload) = std::env::var_os(LD_PRELOAD_ENV) {
        command.env("LD_PRELOAD", preload);
    }
    if let Some(heap) = std::env::var_os(HEAP_SIZE_ENV) {
        command.env("EASYSANDBOX_HEAPSIZE", heap);
    }
    // SAFETY: the closure only calls setrlimit(2) on pre-resolved values
    unsafe {
        command.pre_exec(move || {
            rlimit::apply(&resolved).map_err(|errno| io::Error::from_raw_os_error(errno as i32))
        });
    }

    let record = match command.spawn() {
        Err(e) => {
            eprintln!("run-process: could not execute {:?}: {}", args[0], e);
            ExitRecord {
                tag: ExitTag::FailedToExecute,
                code: EXIT_FAILED_TO_EXECUTE,
            }
        }
        Ok(mut child) => {
            forwarder.forward_to(child.id());
            let status = wait(&mut child).context("waiting for child")?;
            classify(status)
        }
    };

    if let Some(path) = status_file {
        record
            .write_to(&path)
            .with_context(|| format!("writing status file {}", path.display()))?;
    }
    Ok(record.code)
}

fn wait(child: &mut std::process::Child) -> io::Result<ExitStatus> {
    loop {
        match child.wait() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

fn classify(status: ExitStatus) -> ExitRecord {
    match (status.code(), status.signal()) {
        (Some(code), _) => ExitRecord {
            tag: ExitTag::Exited,
            code,
        },
        (None, Some(signal)) => ExitRecord {
            tag: ExitTag::TerminatedBySignal,
            code: signal,
        },
        (None, None) => ExitRecord {
            tag: ExitTag::FailedToExecute,
            code: EXIT_FATAL_ERROR,
        },
    }
}
