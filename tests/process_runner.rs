//! Integration tests for the external process runner
//!
//! Every test runs real commands under both wrappers: the embedded script
//! and the `run-process` binary built alongside these tests.

use gradebox::config::limits::{CommandLimit, WrapperMode};
use gradebox::config::loader::BuilderConfig;
use gradebox::exec::runner::ProcessRunner;
use gradebox::exec::wrapper::WrapperContext;
use gradebox::ProcessStatus;
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const MODES: [WrapperMode; 2] = [WrapperMode::Script, WrapperMode::NativeExe];

fn context() -> WrapperContext {
    WrapperContext::prepare(&BuilderConfig::default())
        .unwrap()
        .with_native_wrapper(env!("CARGO_BIN_EXE_run-process"))
        .with_sandbox_library(None)
}

fn runner(context: &Arc<WrapperContext>, mode: WrapperMode) -> ProcessRunner {
    let mut runner = ProcessRunner::new(context.clone());
    runner.set_wrapper_mode(mode);
    // Room for the shell itself; the defaults target compiled submissions
    runner.set_limit(CommandLimit::VmSizeKb, 1 << 20);
    runner.set_limit(CommandLimit::StackSizeKb, 8192);
    runner
}

// The default process limit forbids forking, so scripts stick to builtins
fn sh(script: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
}

#[test]
fn test_stdin_is_delivered() {
    let context = Arc::new(context());
    for mode in MODES {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = runner(&context, mode);
        runner.set_stdin("5\n3\n");

        assert!(runner.run_synchronous(dir.path(), &sh("read a; read b; echo $((a + b))")));
        assert_eq!(runner.status(), ProcessStatus::Exited, "{:?}", mode);
        assert_eq!(runner.exit_code(), 0);
        assert_eq!(runner.stdout_lines(), ["8".to_string()]);
        assert!(runner.stderr_lines().is_empty());
    }
}

#[test]
fn test_output_is_truncated_to_limits() {
    let context = Arc::new(context());
    let dir = tempfile::tempdir().unwrap();
    let mut runner = runner(&context, WrapperMode::Script);
    runner.set_limit(CommandLimit::OutputMaxBytes, 100_000);
    runner.set_limit(CommandLimit::OutputMaxLines, 50);
    runner.set_limit(CommandLimit::OutputLineMaxChars, 80);

    let script = "i=0; while [ $i -lt 100 ]; do printf '%0300d\\n' 0; i=$((i + 1)); done";
    assert!(runner.run_synchronous(dir.path(), &sh(script)));

    assert_eq!(runner.status(), ProcessStatus::Exited);
    let lines = runner.stdout_lines();
    assert_eq!(lines.len(), 50);
    assert!(lines.iter().all(|line| line.chars().count() == 80));
}

#[test]
fn test_nonzero_exit_code() {
    let context = Arc::new(context());
    for mode in MODES {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = runner(&context, mode);
        assert!(runner.run_synchronous(dir.path(), &sh("echo failing >&2; exit 3")));
        assert_eq!(runner.status(), ProcessStatus::Exited);
        assert_eq!(runner.exit_code(), 3);
        assert_eq!(runner.stderr_lines(), ["failing".to_string()]);
    }
}

#[test]
fn test_signals_are_classified() {
    let context = Arc::new(context());
    let cases = [
        ("SEGV", ProcessStatus::KilledBySignal, libc::SIGSEGV),
        ("XCPU", ProcessStatus::TimedOut, libc::SIGXCPU),
        ("XFSZ", ProcessStatus::FileSizeLimitExceeded, libc::SIGXFSZ),
    ];
    for mode in MODES {
        for (name, expected, signal) in cases {
            let dir = tempfile::tempdir().unwrap();
            let mut runner = runner(&context, mode);
            let script = format!("echo before >&2; kill -s {} $$", name);
            assert!(runner.run_synchronous(dir.path(), &sh(&script)));
            assert_eq!(runner.status(), expected, "{:?} {}", mode, name);
            assert_eq!(runner.exit_code(), signal);
            assert!(runner.is_exit_status_known());
            if expected.suppresses_stderr() {
                assert!(runner.stderr_lines().is_empty());
            } else {
                // bash may append its own report of the signal
                assert_eq!(
                    runner.stderr_lines().first().map(String::as_str),
                    Some("before")
                );
            }
        }
    }
}

#[test]
fn test_file_size_limit() {
    let context = Arc::new(context());
    for mode in MODES {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = runner(&context, mode);
        runner.set_limit(CommandLimit::FileSizeKb, 0);
        assert!(runner.run_synchronous(dir.path(), &sh("echo hi > out.txt")));
        assert_eq!(
            runner.status(),
            ProcessStatus::FileSizeLimitExceeded,
            "{:?}",
            mode
        );
    }
}

#[test]
fn test_missing_program_could_not_start() {
    let context = Arc::new(context());
    for mode in MODES {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = runner(&context, mode);
        let launched =
            runner.run_synchronous(dir.path(), &["./no-such-program".to_string()]);
        assert!(launched, "the wrapper itself starts");
        assert!(!runner.is_process_started());
        assert_eq!(runner.status(), ProcessStatus::CouldNotStart, "{:?}", mode);
        assert!(!runner.is_exit_status_known());
    }
}

#[test]
fn test_missing_status_file() {
    let scratch = tempfile::tempdir().unwrap();
    let script = scratch.path().join("silent.sh");
    fs::write(&script, "#!/bin/bash\nexec \"$@\"\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    let context = Arc::new(context().with_script_path(&script));

    let dir = tempfile::tempdir().unwrap();
    let mut runner = runner(&context, WrapperMode::Script);
    assert!(runner.run_synchronous(dir.path(), &sh("echo ok")));
    assert_eq!(runner.status(), ProcessStatus::CouldNotStart);
    assert_eq!(
        runner.status_message(),
        gradebox::exec::status::STATUS_UNDETERMINED
    );
}

#[test]
fn test_missing_working_dir() {
    let context = Arc::new(context());
    let mut runner = runner(&context, WrapperMode::Script);
    let launched = runner.run_synchronous(
        std::path::Path::new("/nonexistent/gradebox/dir"),
        &sh("true"),
    );
    assert!(!launched);
    assert!(!runner.is_process_started());
    assert_eq!(runner.status(), ProcessStatus::CouldNotStart);
    assert!(runner
        .status_message()
        .starts_with("Could not execute process"));
}

#[test]
fn test_environment_and_path() {
    let context = Arc::new(context());
    let tools = tempfile::tempdir().unwrap();
    let tool = tools.path().join("greet-tool");
    fs::write(&tool, "#!/bin/sh\necho \"hello $GREETING\"\n").unwrap();
    fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let mut runner = runner(&context, WrapperMode::NativeExe);
    runner.set_env("GREETING", "grader");
    runner.add_dir_to_path(tools.path()).unwrap();
    assert!(runner.run_synchronous(dir.path(), &["greet-tool".to_string()]));
    assert_eq!(runner.status(), ProcessStatus::Exited);
    assert_eq!(runner.stdout_lines(), ["hello grader".to_string()]);
}

#[test]
fn test_kill_process_reaps_child() {
    let context = Arc::new(context());
    for mode in MODES {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(&context, mode);
        let run = runner
            .run_asynchronous(
                dir.path().to_path_buf(),
                vec!["sleep".to_string(), "30".to_string()],
            )
            .unwrap();

        let started = Instant::now();
        while run.control().pid().is_none() && started.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(10));
        }
        let pid = run.control().pid().unwrap();
        assert!(run.is_running());

        run.kill_process();
        assert!(!run.is_running());
        let runner = run.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(runner.status(), ProcessStatus::TimedOut, "{:?}", mode);
        assert!(runner.stderr_lines().is_empty());
        assert_eq!(
            waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)),
            Err(Errno::ECHILD)
        );
    }
}

#[test]
fn test_kill_before_launch_is_noop() {
    let context = Arc::new(context());
    let runner = runner(&context, WrapperMode::Script);
    let started = Instant::now();
    runner.kill_process();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!runner.control().was_killed());
}

#[test]
fn test_background_children_do_not_outlive_the_run() {
    let context = Arc::new(context());
    for mode in MODES {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = runner(&context, mode);
        runner.set_limit(CommandLimit::Processes, 4096);

        let started = Instant::now();
        assert!(runner.run_synchronous(dir.path(), &sh("sleep 30 & echo hi")));
        assert!(started.elapsed() < Duration::from_secs(10), "{:?}", mode);
        assert_eq!(runner.status(), ProcessStatus::Exited, "{:?}", mode);
        assert_eq!(runner.exit_code(), 0);
        assert_eq!(runner.stdout_lines(), ["hi".to_string()]);
    }
}

#[test]
fn test_killed_runner_can_run_again() {
    let context = Arc::new(context());
    let dir = tempfile::tempdir().unwrap();
    let run = runner(&context, WrapperMode::NativeExe)
        .run_asynchronous(
            dir.path().to_path_buf(),
            vec!["sleep".to_string(), "30".to_string()],
        )
        .unwrap();

    let started = Instant::now();
    while run.control().pid().is_none() && started.elapsed() < Duration::from_secs(5) {
        thread::sleep(Duration::from_millis(10));
    }
    run.kill_process();
    let mut runner = run.join().unwrap();
    assert_eq!(runner.status(), ProcessStatus::TimedOut);

    assert!(runner.run_synchronous(dir.path(), &sh("echo again")));
    assert_eq!(runner.status(), ProcessStatus::Exited);
    assert_eq!(runner.stdout_lines(), ["again".to_string()]);
    assert!(!runner.control().was_killed());
}
