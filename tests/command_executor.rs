//! Integration tests for the command executor

use gradebox::config::limits::{CommandExecutionPreferences, CommandLimit, WrapperMode};
use gradebox::config::loader::BuilderConfig;
use gradebox::exec::command::{Command, CommandExecutor, CommandInput};
use gradebox::exec::wrapper::WrapperContext;
use gradebox::runtime::security;
use gradebox::{CommandResult, ProcessStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn executor(mode: WrapperMode) -> CommandExecutor {
    let context = WrapperContext::prepare(&BuilderConfig::default())
        .unwrap()
        .with_native_wrapper(env!("CARGO_BIN_EXE_run-process"))
        .with_sandbox_library(None);
    let mut prefs = CommandExecutionPreferences::default();
    prefs.set_limit(CommandLimit::VmSizeKb, 1 << 20);
    prefs.set_limit(CommandLimit::StackSizeKb, 8192);
    prefs.set_wrapper_mode(mode);
    CommandExecutor::new(Arc::new(context))
        .with_preferences(prefs)
        .with_poll_interval(Duration::from_millis(20))
}

fn sum_program(dir: &std::path::Path) -> Command {
    Command::new(
        dir,
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "read a; read b; echo $((a + b))".to_string(),
        ],
    )
}

#[test]
fn test_execute_sums_input() {
    let dir = tempfile::tempdir().unwrap();
    for mode in [WrapperMode::Script, WrapperMode::NativeExe] {
        let result = executor(mode).execute(&sum_program(dir.path()), &CommandInput::new("5\n3\n"));
        assert_eq!(result.status, ProcessStatus::Exited, "{:?}", mode);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, vec!["8".to_string()]);
        assert!(result.is_success());
    }
}

#[test]
fn test_wall_clock_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let executor = executor(WrapperMode::Script).with_max_time(Duration::from_millis(300));
    let command = Command::new(dir.path(), vec!["sleep".to_string(), "5".to_string()]);

    let started = Instant::now();
    let result = executor.execute(&command, &CommandInput::default());
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(result, CommandResult::timed_out());
    assert_eq!(result.status_message, "Process timed out");
}

#[test]
fn test_command_environment() {
    let dir = tempfile::tempdir().unwrap();
    let command = Command::new(
        dir.path(),
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "echo \"$LANGUAGE_LEVEL\"".to_string(),
        ],
    )
    .with_env("LANGUAGE_LEVEL", "intro");
    let result = executor(WrapperMode::NativeExe).execute(&command, &CommandInput::default());
    assert_eq!(result.stdout, vec!["intro".to_string()]);
}

#[test]
fn test_execute_all_keeps_input_order() {
    security::install_default();
    let dir = tempfile::tempdir().unwrap();
    let inputs: Vec<CommandInput> = [(1, 2), (10, 20), (100, 200)]
        .iter()
        .map(|(a, b)| CommandInput::new(format!("{}\n{}\n", a, b)))
        .collect();

    let results = executor(WrapperMode::Script)
        .with_max_time(Duration::from_secs(5))
        .execute_all(&[sum_program(dir.path())], &inputs)
        .unwrap();

    let sums: Vec<_> = results.iter().map(|r| r.stdout.clone()).collect();
    assert_eq!(
        sums,
        vec![
            vec!["3".to_string()],
            vec!["30".to_string()],
            vec!["300".to_string()]
        ]
    );
}

#[test]
fn test_execute_all_times_out_slow_inputs() {
    security::install_default();
    let dir = tempfile::tempdir().unwrap();
    let commands = vec![
        sum_program(dir.path()),
        Command::new(dir.path(), vec!["sleep".to_string(), "5".to_string()]),
    ];
    let inputs = vec![CommandInput::new("2\n2\n"), CommandInput::default()];

    let started = Instant::now();
    let results = executor(WrapperMode::NativeExe)
        .with_max_time(Duration::from_millis(400))
        .execute_all(&commands, &inputs)
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(results[0].stdout, vec!["4".to_string()]);
    assert_eq!(results[1].status, ProcessStatus::TimedOut);
}

#[test]
fn test_deadline_holds_with_background_children() {
    let dir = tempfile::tempdir().unwrap();
    let mut prefs = CommandExecutionPreferences::default();
    prefs.set_limit(CommandLimit::VmSizeKb, 1 << 20);
    prefs.set_limit(CommandLimit::StackSizeKb, 8192);
    prefs.set_limit(CommandLimit::Processes, 4096);
    let command = Command::new(
        dir.path(),
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "sleep 30 & echo hi".to_string(),
        ],
    );

    let started = Instant::now();
    let result = executor(WrapperMode::Script)
        .with_preferences(prefs)
        .with_max_time(Duration::from_millis(1000))
        .execute(&command, &CommandInput::default());
    assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
    assert_eq!(result.stdout, vec!["hi".to_string()]);
}
