//! External process runner
//!
//! Runs one command under a wrapper program in its own process group,
//! collects bounded stdout/stderr, optionally feeds stdin, and determines
//! the real termination cause from the wrapper's status file.

use crate::config::limits::{CommandExecutionPreferences, CommandLimit, LimitMap, WrapperMode};
use crate::config::types::{CommandResult, ProcessStatus, Result, SandboxError};
use crate::exec::input::InputSender;
use crate::exec::status::{self, STATUS_FILE_ENV};
use crate::exec::wrapper::WrapperContext;
use crate::observability::audit;
use crate::utils::merge_one_line;
use crate::utils::output::LimitedOutputCollector;
use crate::utils::prefix::PrefixStripper;
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const RESOURCE_LIMITS_ENV: &str = "CC_PROCESS_RESOURCE_LIMITS";
pub const LD_PRELOAD_ENV: &str = "CC_LD_PRELOAD";
pub const HEAP_SIZE_ENV: &str = "CC_EASYSANDBOX_HEAPSIZE";

const KILL_RETRY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct ControlState {
    launched: bool,
    launching: bool,
    pid: Option<i32>,
    reaped: bool,
    finished: bool,
    kill_requested: bool,
    killed: bool,
    interrupts: Vec<Arc<AtomicBool>>,
}

/// Cross-thread handle on a runner's process.
///
/// The runner thread records spawn, reap and completion; any other thread
/// may query liveness or kill the process group.
#[derive(Default)]
pub struct ProcessControl {
    state: Mutex<ControlState>,
    changed: Condvar,
}

impl ProcessControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_launch(&self) {
        let mut state = self.lock();
        // Only a kill issued before the first launch carries over to it
        if state.launched {
            state.kill_requested = false;
        }
        state.launched = true;
        state.launching = true;
        state.pid = None;
        state.reaped = false;
        state.finished = false;
        state.killed = false;
        state.interrupts.clear();
    }

    /// Record the spawned pid; kills at once if a kill was already requested
    fn attach(&self, pid: i32) {
        let mut state = self.lock();
        state.pid = Some(pid);
        if state.kill_requested {
            info!("Kill requested before spawn; killing process {}", pid);
            send_kill(pid);
            state.killed = true;
        }
    }

    fn register_interrupts(&self, flags: Vec<Arc<AtomicBool>>) {
        let mut state = self.lock();
        if state.killed {
            for flag in &flags {
                flag.store(true, Ordering::SeqCst);
            }
        }
        state.interrupts = flags;
    }

    fn mark_reaped(&self) {
        self.lock().reaped = true;
        self.changed.notify_all();
    }

    fn mark_finished(&self) {
        let mut state = self.lock();
        state.finished = true;
        state.launching = false;
        drop(state);
        self.changed.notify_all();
    }

    /// True until the child has been reaped; a run that has not spawned yet counts as running
    pub fn is_running(&self) -> bool {
        let state = self.lock();
        !(state.reaped || state.finished)
    }

    pub fn pid(&self) -> Option<i32> {
        self.lock().pid
    }

    /// Whether this run was ended by `kill_process`
    pub fn was_killed(&self) -> bool {
        self.lock().killed
    }

    /// Kill the process group and block until the child has been reaped,
    /// then interrupt the output collectors and the stdin writer.
    ///
    /// Once the child is reaped, anything left in its group is killed too,
    /// so no straggler can keep the output pipes open.
    pub fn kill_process(&self) {
        let mut state = self.lock();
        state.kill_requested = true;
        if !state.launching {
            debug!("Kill requested for a run that has not been launched");
            return;
        }

        let mut audited = false;
        while !(state.reaped || state.finished) {
            if let Some(pid) = state.pid {
                send_kill(pid);
                state.killed = true;
                if !audited {
                    audit::forced_kill(pid, "kill requested by supervisor");
                    audited = true;
                }
            }
            let (guard, wait) = self
                .changed
                .wait_timeout(state, KILL_RETRY_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
            if wait.timed_out() && !(state.reaped || state.finished) {
                debug!("Process not reaped yet, retrying kill");
            }
        }

        if !state.finished {
            if let Some(pid) = state.pid {
                kill_group(pid);
            }
        }

        for flag in &state.interrupts {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

/// Kill whatever is left in the group led by an already reaped child.
///
/// Only the group is signalled, never the bare pid, which may have been reused.
fn kill_group(pgid: i32) {
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) => debug!("Killed leftover processes in group {}", pgid),
        Err(Errno::ESRCH) => {}
        Err(e) => debug!("killpg({}) failed: {}", pgid, e),
    }
}

fn send_kill(pid: i32) {
    let pid = Pid::from_raw(pid);
    match killpg(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            debug!("killpg({}) failed: {}, killing the process directly", pid, e);
            if let Err(e) = kill(pid, Signal::SIGKILL) {
                debug!("kill({}) failed: {}", pid, e);
            }
        }
    }
}

/// Runs one command under a wrapper and records its outcome
pub struct ProcessRunner {
    context: Arc<WrapperContext>,
    wrapper_mode: WrapperMode,
    limits: LimitMap,
    env: BTreeMap<OsString, OsString>,
    stdin: Option<String>,
    control: Arc<ProcessControl>,
    status: ProcessStatus,
    status_message: String,
    exit_code: i32,
    process_started: bool,
    stdout: Vec<String>,
    stderr: Vec<String>,
}

impl ProcessRunner {
    /// New runner with default limits and a copy of the current environment
    pub fn new(context: Arc<WrapperContext>) -> Self {
        ProcessRunner {
            context,
            wrapper_mode: WrapperMode::Script,
            limits: LimitMap::with_defaults(),
            env: std::env::vars_os().collect(),
            stdin: None,
            control: ProcessControl::new(),
            status: ProcessStatus::Unknown,
            status_message: String::new(),
            exit_code: -1,
            process_started: false,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    pub fn set_preferences(&mut self, prefs: &CommandExecutionPreferences) {
        self.limits.apply(prefs);
        self.wrapper_mode = prefs.wrapper_mode();
    }

    pub fn set_wrapper_mode(&mut self, mode: WrapperMode) {
        self.wrapper_mode = mode;
    }

    pub fn set_limit(&mut self, limit: CommandLimit, value: i64) {
        self.limits.set(limit, value);
    }

    /// Drop every limit, including the defaults
    pub fn clear_limits(&mut self) {
        self.limits.clear();
    }

    pub fn limits(&self) -> &LimitMap {
        &self.limits
    }

    pub fn set_stdin(&mut self, text: impl Into<String>) {
        self.stdin = Some(text.into());
    }

    pub fn set_env(&mut self, key: impl Into<OsString>, value: impl Into<OsString>) {
        self.env.insert(key.into(), value.into());
    }

    /// Prepend `dir` to the child's PATH
    pub fn add_dir_to_path(&mut self, dir: &Path) -> Result<()> {
        let key = OsString::from("PATH");
        let mut paths = vec![dir.to_path_buf()];
        if let Some(existing) = self.env.get(&key) {
            paths.extend(std::env::split_paths(existing));
        }
        let joined = std::env::join_paths(paths)
            .map_err(|e| SandboxError::Config(format!("Invalid PATH entry: {}", e)))?;
        self.env.insert(key, joined);
        Ok(())
    }

    pub fn control(&self) -> Arc<ProcessControl> {
        self.control.clone()
    }

    pub fn kill_process(&self) {
        self.control.kill_process();
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    /// Run the command to completion. Returns false if it could not be launched.
    pub fn run_synchronous(&mut self, working_dir: &Path, command: &[String]) -> bool {
        self.status = ProcessStatus::Unknown;
        self.status_message.clear();
        self.exit_code = -1;
        self.process_started = false;
        self.stdout.clear();
        self.stderr.clear();

        self.control.begin_launch();
        let launched = self.launch_and_wait(working_dir, command);
        self.control.mark_finished();

        match launched {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not execute process {}: {}", merge_one_line(command), e);
                audit::launch_failure(&merge_one_line(command), &e.to_string());
                self.status = ProcessStatus::CouldNotStart;
                self.status_message = format!("Could not execute process: {}", e);
                false
            }
        }
    }

    /// Run on a monitor thread; the returned handle can poll, kill and join
    pub fn run_asynchronous(self, working_dir: PathBuf, command: Vec<String>) -> Result<AsyncRun> {
        let control = self.control.clone();
        let handle = thread::Builder::new()
            .name("process-monitor".to_string())
            .spawn(move || {
                let mut runner = self;
                runner.run_synchronous(&working_dir, &command);
                runner
            })?;
        Ok(AsyncRun { control, handle })
    }

    fn child_environment(&self, status_file: &Path) -> Vec<(OsString, OsString)> {
        let mut vars: Vec<(OsString, OsString)> = vec![
            (STATUS_FILE_ENV.into(), status_file.as_os_str().to_owned()),
            (
                RESOURCE_LIMITS_ENV.into(),
                self.limits.encode_wrapper_flags().into(),
            ),
        ];

        if self.limits.sandbox_enabled() {
            match self.context.sandbox_library() {
                Some(library) => {
                    vars.push((LD_PRELOAD_ENV.into(), library.as_os_str().to_owned()));
                    if let Some(heap) = self.limits.get(CommandLimit::SandboxHeapSizeBytes) {
                        vars.push((HEAP_SIZE_ENV.into(), heap.to_string().into()));
                    }
                }
                None => debug!("Sandbox requested but no sandbox library is available"),
            }
        }
        vars
    }

    fn sandbox_injected(&self) -> bool {
        self.limits.sandbox_enabled() && self.context.sandbox_library().is_some()
    }

    fn launch_and_wait(&mut self, working_dir: &Path, command: &[String]) -> Result<()> {
        if command.is_empty() {
            return Err(SandboxError::Config("Empty command".to_string()));
        }

        let argv = self.context.wrap_command(self.wrapper_mode, command);
        info!(
            "Running in {} the command: {}",
            working_dir.display(),
            merge_one_line(command)
        );

        let status_file = tempfile::Builder::new()
            .prefix("ccxs")
            .suffix(".txt")
            .tempfile_in(working_dir)?
            .into_temp_path();

        let mut cmd = std::process::Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(working_dir)
            .env_clear()
            .envs(&self.env)
            .envs(self.child_environment(&status_file))
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = cmd.spawn()?;
        let pid = child.id() as i32;
        self.process_started = true;
        self.control.attach(pid);
        debug!("Spawned wrapper pid {}", pid);

        let io = match self.start_io(&mut child) {
            Ok(io) => io,
            Err(e) => {
                send_kill(pid);
                let _ = wait_for_child(&mut child);
                self.control.mark_reaped();
                return Err(e);
            }
        };
        let ProcessIo {
            mut stdout,
            mut stderr,
            mut stdin,
        } = io;

        let wait_status = wait_for_child(&mut child);
        self.control.mark_reaped();
        // Background children of the command still hold the pipes
        kill_group(pid);

        stdout.join();
        stderr.join();
        if let Some(sender) = stdin.as_mut() {
            sender.join();
        }

        let fallback_code = wait_status.as_ref().map(exit_code_of).unwrap_or(-1);
        let resolution = status::read_status_file(&status_file, fallback_code);
        if let Err(e) = status_file.close() {
            debug!("Could not remove status file: {}", e);
        }

        self.process_started = resolution.process_started;
        if self.control.was_killed() {
            self.status = ProcessStatus::TimedOut;
            self.exit_code = resolution.exit_code;
            self.status_message = "Process was killed after exceeding its time limit".to_string();
        } else {
            self.status = resolution.status;
            self.exit_code = resolution.exit_code;
            self.status_message = resolution.message;
        }

        self.stdout = stdout.into_lines();
        self.stderr = stderr.into_lines();
        debug!(
            "Process {} finished: {} ({})",
            pid, self.status, self.status_message
        );
        Ok(())
    }

    fn start_io(&self, child: &mut Child) -> Result<ProcessIo> {
        let (child_out, child_err) = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => (out, err),
            _ => return Err(SandboxError::Process("Child output pipes missing".to_string())),
        };

        let limits = self.limits.output_limits();
        let stdout = if self.sandbox_injected() {
            LimitedOutputCollector::start(PrefixStripper::sandbox_banner(child_out), limits)?
        } else {
            LimitedOutputCollector::start(child_out, limits)?
        };
        let stderr = LimitedOutputCollector::start(child_err, limits)?;

        let stdin = match (&self.stdin, child.stdin.take()) {
            (Some(text), Some(pipe)) => Some(InputSender::start(pipe, text.clone())?),
            _ => None,
        };

        let mut flags = vec![stdout.interrupt_flag(), stderr.interrupt_flag()];
        if let Some(sender) = &stdin {
            flags.push(sender.interrupt_flag());
        }
        self.control.register_interrupts(flags);

        Ok(ProcessIo {
            stdout,
            stderr,
            stdin,
        })
    }

    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    pub fn status_message(&self) -> &str {
        &self.status_message
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn is_process_started(&self) -> bool {
        self.process_started
    }

    /// False if the process never started or its fate is unknowable
    pub fn is_exit_status_known(&self) -> bool {
        !matches!(
            self.status,
            ProcessStatus::Unknown | ProcessStatus::CouldNotStart
        )
    }

    pub fn stdout_lines(&self) -> &[String] {
        &self.stdout
    }

    /// Stderr lines; empty for time and file size limit terminations
    pub fn stderr_lines(&self) -> &[String] {
        if self.status.suppresses_stderr() {
            &[]
        } else {
            &self.stderr
        }
    }

    pub fn stdout(&self) -> String {
        join_lines(self.stdout_lines())
    }

    pub fn stderr(&self) -> String {
        join_lines(self.stderr_lines())
    }

    pub fn command_result(&self) -> CommandResult {
        CommandResult {
            exit_code: self.exit_code,
            stdout: self.stdout_lines().to_vec(),
            stderr: self.stderr_lines().to_vec(),
            status: self.status,
            status_message: self.status_message.clone(),
        }
    }
}

struct ProcessIo {
    stdout: LimitedOutputCollector,
    stderr: LimitedOutputCollector,
    stdin: Option<InputSender>,
}

fn join_lines(lines: &[String]) -> String {
    let mut text = String::new();
    for line in lines {
        text.push_str(line);
        text.push('\n');
    }
    text
}

fn exit_code_of(status: &ExitStatus) -> i32 {
    status.code().or_else(|| status.signal()).unwrap_or(-1)
}

fn wait_for_child(child: &mut Child) -> io::Result<ExitStatus> {
    loop {
        match child.wait() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// A runner executing on its monitor thread
pub struct AsyncRun {
    control: Arc<ProcessControl>,
    handle: JoinHandle<ProcessRunner>,
}

impl AsyncRun {
    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    pub fn kill_process(&self) {
        self.control.kill_process();
    }

    pub fn control(&self) -> Arc<ProcessControl> {
        self.control.clone()
    }

    /// Wait for the monitor thread and hand back the finished runner
    pub fn join(self) -> Result<ProcessRunner> {
        self.handle
            .join()
            .map_err(|_| SandboxError::Process("Process monitor thread panicked".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::BuilderConfig;

    fn runner() -> ProcessRunner {
        let context = WrapperContext::prepare(&BuilderConfig::default()).unwrap();
        ProcessRunner::new(Arc::new(context))
    }

    #[test]
    fn test_environment_carries_limits_and_status_file() {
        let runner = runner();
        let vars = runner.child_environment(Path::new("/tmp/ccxs1.txt"));
        assert!(vars.contains(&(STATUS_FILE_ENV.into(), "/tmp/ccxs1.txt".into())));
        assert!(vars.contains(&(
            RESOURCE_LIMITS_ENV.into(),
            "-f0 -s128 -t10 -u0 -v32768".into()
        )));
        // No sandbox library configured
        assert!(!vars.iter().any(|(k, _)| k == LD_PRELOAD_ENV));
    }

    #[test]
    fn test_sandbox_variables_when_library_present() {
        let lib = tempfile::NamedTempFile::new().unwrap();
        let context = WrapperContext::prepare(&BuilderConfig::default())
            .unwrap()
            .with_sandbox_library(Some(lib.path().to_path_buf()));
        let mut runner = ProcessRunner::new(Arc::new(context));
        runner.set_limit(CommandLimit::SandboxHeapSizeBytes, 1 << 20);

        let vars = runner.child_environment(Path::new("/tmp/s.txt"));
        assert!(vars.contains(&(LD_PRELOAD_ENV.into(), lib.path().as_os_str().to_owned())));
        assert!(vars.contains(&(HEAP_SIZE_ENV.into(), "1048576".into())));
        assert!(runner.sandbox_injected());

        runner.set_limit(CommandLimit::EnableSandbox, 0);
        assert!(!runner.sandbox_injected());
    }

    #[test]
    fn test_add_dir_to_path_prepends() {
        let mut runner = runner();
        runner.set_env("PATH", "/usr/bin:/bin");
        runner.add_dir_to_path(Path::new("/opt/tools")).unwrap();
        assert_eq!(
            runner.env.get(&OsString::from("PATH")),
            Some(&OsString::from("/opt/tools:/usr/bin:/bin"))
        );
    }

    #[test]
    fn test_empty_command_cannot_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = runner();
        assert!(!runner.run_synchronous(dir.path(), &[]));
        assert_eq!(runner.status(), ProcessStatus::CouldNotStart);
        assert!(runner.status_message().starts_with("Could not execute process"));
        assert!(!runner.is_process_started());
        assert!(!runner.is_running());
    }

    #[test]
    fn test_kill_before_launch_returns_immediately() {
        let control = ProcessControl::new();
        control.kill_process();
        assert!(!control.was_killed());
        assert!(control.is_running());
    }

    #[test]
    fn test_kill_request_scoped_to_its_run() {
        let control = ProcessControl::new();
        control.kill_process();
        control.begin_launch();
        assert!(control.lock().kill_requested);
        control.mark_reaped();
        control.mark_finished();

        control.begin_launch();
        assert!(!control.lock().kill_requested);
        control.mark_reaped();
        control.kill_process();
        control.mark_finished();

        control.begin_launch();
        assert!(!control.lock().kill_requested);
        assert!(!control.was_killed());
    }

    #[test]
    fn test_stderr_hidden_for_limit_statuses() {
        let mut runner = runner();
        runner.stderr = vec!["boom".to_string()];
        runner.status = ProcessStatus::TimedOut;
        assert!(runner.stderr_lines().is_empty());
        runner.status = ProcessStatus::KilledBySignal;
        assert_eq!(runner.stderr(), "boom\n");
    }
}
