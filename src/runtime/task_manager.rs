//! Task manager
//!
//! Runs a batch of independent computations, one named thread each, under
//! a single wall-clock deadline. Units that are still running at the
//! deadline are reclaimed: they are asked to stop, every OS process they
//! registered is killed, their captured output is closed, and their
//! outcome becomes the timeout default. A late result is discarded.

pub use crate::config::loader::StuckTaskPolicy;

use crate::config::loader::TaskManagerConfig;
use crate::config::types::{Outcome, Result, SandboxError};
use crate::exec::runner::ProcessControl;
use crate::observability::audit;
use crate::runtime::capture::{CapturedStreams, RedirectGuard, UnitWriter};
use crate::runtime::security::{self, CapabilityPolicy, Operation, SecurityViolation};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// A computation run as one isolated unit
pub trait IsolatedTask<T>: Send {
    fn execute(&self, ctx: &TaskContext) -> T;
}

impl<T, F> IsolatedTask<T> for F
where
    F: Fn(&TaskContext) -> T + Send,
{
    fn execute(&self, ctx: &TaskContext) -> T {
        self(ctx)
    }
}

/// Cooperative stop request shared between the manager and a unit
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a unit may use to talk to its host
pub struct TaskContext {
    index: usize,
    unit_name: String,
    cancel: CancellationToken,
    policy: Arc<dyn CapabilityPolicy>,
    streams: CapturedStreams,
    processes: Arc<Mutex<Vec<Arc<ProcessControl>>>>,
}

impl TaskContext {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn unit_name(&self) -> &str {
        &self.unit_name
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Vet an operation against the unit's policy; units are always untrusted
    pub fn check(&self, op: &Operation) -> std::result::Result<(), SecurityViolation> {
        security::enforce(self.policy.as_ref(), op, true, Some(&self.unit_name))
    }

    /// Units may not end the host process; this only reports the denial
    pub fn request_exit(&self, code: i32) -> std::result::Result<(), SecurityViolation> {
        self.check(&Operation::Exit(code))
    }

    pub fn request_exec(&self, command: &str) -> std::result::Result<(), SecurityViolation> {
        self.check(&Operation::Exec(command.to_string()))
    }

    /// Have the manager kill this process if the unit is reclaimed
    pub fn register_process(&self, control: Arc<ProcessControl>) {
        self.processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(control);
    }

    /// Writer into this unit's captured stdout
    pub fn stdout(&self) -> UnitWriter {
        UnitWriter::new(self.streams.stdout.clone(), self.unit_name.clone())
    }

    pub fn stderr(&self) -> UnitWriter {
        UnitWriter::new(self.streams.stderr.clone(), self.unit_name.clone())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitState {
    Pending,
    Running,
    Finished,
    /// Panicked; treated like a timeout
    Failed,
    /// Still running at the deadline
    ForciblyDefaulted,
}

enum UnitEvent<T> {
    Finished { index: usize, result: T },
    Failed { index: usize },
}

struct Unit {
    name: String,
    state: UnitState,
    handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    processes: Arc<Mutex<Vec<Arc<ProcessControl>>>>,
}

static UNIT_COUNTER: AtomicUsize = AtomicUsize::new(0);

type TimeoutHandler<T> = Box<dyn Fn() -> T + Send + Sync>;

/// Runs a batch of tasks concurrently under one deadline
pub struct TaskManager<T> {
    tasks: Vec<Box<dyn IsolatedTask<T>>>,
    max_run_time: Duration,
    num_pauses: u32,
    grace_period: Duration,
    stuck_policy: StuckTaskPolicy,
    thread_name_prefix: String,
    capture_max_bytes: usize,
    timeout_handler: TimeoutHandler<T>,
    policy: Arc<dyn CapabilityPolicy>,
    buffered_stdout: BTreeMap<usize, String>,
    buffered_stderr: BTreeMap<usize, String>,
}

impl<T: Send + 'static> TaskManager<T> {
    /// Fails unless a capability policy has been installed
    pub fn new<H>(tasks: Vec<Box<dyn IsolatedTask<T>>>, max_run_time: Duration, timeout_handler: H) -> Result<Self>
    where
        H: Fn() -> T + Send + Sync + 'static,
    {
        let policy = security::installed_policy().ok_or_else(|| {
            SandboxError::Config(
                "Capability policy must be installed before creating a task manager".to_string(),
            )
        })?;
        let defaults = TaskManagerConfig::default();

        Ok(TaskManager {
            tasks,
            max_run_time,
            num_pauses: defaults.num_pauses,
            grace_period: defaults.grace_period(),
            stuck_policy: defaults.stuck_policy,
            thread_name_prefix: defaults.thread_name_prefix,
            capture_max_bytes: defaults.capture_max_bytes,
            timeout_handler: Box::new(timeout_handler),
            policy,
            buffered_stdout: BTreeMap::new(),
            buffered_stderr: BTreeMap::new(),
        })
    }

    pub fn with_config(mut self, config: &TaskManagerConfig) -> Self {
        self.num_pauses = config.num_pauses.max(1);
        self.grace_period = config.grace_period();
        self.stuck_policy = config.stuck_policy;
        self.thread_name_prefix = config.thread_name_prefix.clone();
        self.capture_max_bytes = config.capture_max_bytes;
        self
    }

    pub fn with_num_pauses(mut self, num_pauses: u32) -> Self {
        self.num_pauses = num_pauses.max(1);
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_stuck_policy(mut self, policy: StuckTaskPolicy) -> Self {
        self.stuck_policy = policy;
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Use a policy other than the installed one for this batch
    pub fn with_policy(mut self, policy: Arc<dyn CapabilityPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Captured stdout per task index, available after `run()`
    pub fn buffered_stdout(&self) -> &BTreeMap<usize, String> {
        &self.buffered_stdout
    }

    pub fn buffered_stderr(&self) -> &BTreeMap<usize, String> {
        &self.buffered_stderr
    }

    /// Run every task and return one outcome per task, in task order
    pub fn run(&mut self) -> Vec<Outcome<T>> {
        let tasks = std::mem::take(&mut self.tasks);
        let total = tasks.len();
        let run_id = audit::new_run_id();
        audit::batch_start(run_id, total, self.max_run_time.as_millis());

        let streams = CapturedStreams::new(self.capture_max_bytes);
        let redirect = RedirectGuard::install(streams.clone());

        let mut results: Vec<Option<T>> = (0..total).map(|_| None).collect();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut units = self.start_units(tasks, &streams, &tx);
        drop(tx);

        self.poll(&rx, &mut units, &mut results);

        // Anything that completed between the last poll and now still counts
        while let Ok(event) = rx.try_recv() {
            apply_event(event, &mut units, &mut results);
        }

        self.reclaim(run_id, &mut units, &streams);

        for (index, unit) in units.iter().enumerate() {
            self.buffered_stdout
                .insert(index, streams.stdout.take_output(&unit.name));
            self.buffered_stderr
                .insert(index, streams.stderr.take_output(&unit.name));
        }
        drop(redirect);

        let finished = units
            .iter()
            .filter(|unit| unit.state == UnitState::Finished)
            .count();
        audit::batch_end(run_id, finished, total);

        units
            .iter()
            .zip(results)
            .map(|(unit, result)| match (unit.state, result) {
                (UnitState::Finished, Some(result)) => Outcome {
                    finished: true,
                    result,
                },
                _ => Outcome {
                    finished: false,
                    result: (self.timeout_handler)(),
                },
            })
            .collect()
    }

    fn start_units(
        &self,
        tasks: Vec<Box<dyn IsolatedTask<T>>>,
        streams: &CapturedStreams,
        tx: &Sender<UnitEvent<T>>,
    ) -> Vec<Unit> {
        tasks
            .into_iter()
            .enumerate()
            .map(|(index, task)| {
                let name = format!(
                    "{}{}",
                    self.thread_name_prefix,
                    UNIT_COUNTER.fetch_add(1, Ordering::SeqCst)
                );
                let ctx = TaskContext {
                    index,
                    unit_name: name.clone(),
                    cancel: CancellationToken::new(),
                    policy: self.policy.clone(),
                    streams: streams.clone(),
                    processes: Arc::new(Mutex::new(Vec::new())),
                };
                let cancel = ctx.cancel.clone();
                let processes = ctx.processes.clone();
                let tx = tx.clone();

                let mut unit = Unit {
                    name: name.clone(),
                    state: UnitState::Pending,
                    handle: None,
                    cancel,
                    processes,
                };
                match thread::Builder::new()
                    .name(name)
                    .spawn(move || run_unit(task, ctx, tx))
                {
                    Ok(handle) => {
                        unit.state = UnitState::Running;
                        unit.handle = Some(handle);
                    }
                    Err(e) => {
                        error!("Could not start unit {}: {}", unit.name, e);
                        unit.state = UnitState::Failed;
                    }
                }
                unit
            })
            .collect()
    }

    /// Wait in `num_pauses` slices, stopping as soon as every unit is done
    fn poll(&self, rx: &Receiver<UnitEvent<T>>, units: &mut [Unit], results: &mut [Option<T>]) {
        let slice = self.max_run_time / self.num_pauses;
        for pause in 0..self.num_pauses {
            let slice_end = Instant::now() + slice;
            while !all_done(units) {
                let now = Instant::now();
                if now >= slice_end {
                    break;
                }
                match rx.recv_timeout(slice_end - now) {
                    Ok(event) => apply_event(event, units, results),
                    Err(RecvTimeoutError::Timeout) => break,
                    // Every unit thread has exited
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            if all_done(units) {
                debug!("All units done after {} of {} pauses", pause + 1, self.num_pauses);
                return;
            }
        }
    }

    fn reclaim(&self, run_id: Uuid, units: &mut [Unit], streams: &CapturedStreams) {
        let mut reclaimed = Vec::new();
        for (index, unit) in units.iter_mut().enumerate() {
            if unit.state != UnitState::Running {
                continue;
            }
            warn!("Unit {} (task {}) still running at the deadline", unit.name, index);
            audit::wall_time_limit_violation(run_id, &unit.name, self.max_run_time.as_millis());

            unit.cancel.cancel();
            let processes = std::mem::take(
                &mut *unit.processes.lock().unwrap_or_else(PoisonError::into_inner),
            );
            for control in processes {
                control.kill_process();
            }
            streams.stdout.close(&unit.name);
            streams.stderr.close(&unit.name);
            unit.state = UnitState::ForciblyDefaulted;
            reclaimed.push(index);
        }

        let grace_end = Instant::now() + self.grace_period;
        for unit in units.iter_mut() {
            let Some(handle) = unit.handle.take() else {
                continue;
            };
            if unit.state == UnitState::ForciblyDefaulted {
                while !handle.is_finished() && Instant::now() < grace_end {
                    thread::sleep(Duration::from_millis(5));
                }
                if !handle.is_finished() {
                    self.handle_stuck_unit(run_id, &unit.name);
                    continue;
                }
            }
            if handle.join().is_err() {
                debug!("Unit {} thread ended by panic", unit.name);
            }
        }

        if !reclaimed.is_empty() {
            info!("Reclaimed {} unit(s) at the deadline: {:?}", reclaimed.len(), reclaimed);
        }
    }

    fn handle_stuck_unit(&self, run_id: Uuid, name: &str) {
        audit::unit_abandoned(run_id, name);
        match self.stuck_policy {
            StuckTaskPolicy::Abandon => {
                error!("Unit {} ignored cancellation; abandoning its thread", name);
            }
            StuckTaskPolicy::AbortProcess => {
                error!("Unit {} ignored cancellation; aborting the process", name);
                std::process::abort();
            }
        }
    }
}

fn all_done(units: &[Unit]) -> bool {
    units.iter().all(|unit| unit.state != UnitState::Running)
}

fn apply_event<T>(event: UnitEvent<T>, units: &mut [Unit], results: &mut [Option<T>]) {
    match event {
        UnitEvent::Finished { index, result } => {
            if units[index].state == UnitState::Running {
                units[index].state = UnitState::Finished;
                results[index] = Some(result);
            }
        }
        UnitEvent::Failed { index } => {
            if units[index].state == UnitState::Running {
                units[index].state = UnitState::Failed;
            }
        }
    }
}

fn run_unit<T>(task: Box<dyn IsolatedTask<T>>, ctx: TaskContext, tx: Sender<UnitEvent<T>>) {
    security::join_untrusted_group();
    let index = ctx.index;
    let event = match panic::catch_unwind(AssertUnwindSafe(|| task.execute(&ctx))) {
        Ok(result) => UnitEvent::Finished { index, result },
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("Unit {} failed with an internal error: {}", ctx.unit_name, message);
            audit::unit_panicked(&ctx.unit_name, &message);
            UnitEvent::Failed { index }
        }
    };
    // The manager is gone once the deadline passed; a late result is dropped
    let _ = tx.send(event);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn boxed<T, F>(f: F) -> Box<dyn IsolatedTask<T>>
    where
        F: Fn(&TaskContext) -> T + Send + 'static,
    {
        Box::new(f)
    }

    #[test]
    fn test_empty_batch() {
        security::install_default();
        let mut manager = TaskManager::<i32>::new(Vec::new(), Duration::from_millis(100), || -1).unwrap();
        assert!(manager.run().is_empty());
    }

    #[test]
    fn test_results_keep_task_order() {
        security::install_default();
        let tasks = (0..5u64)
            .map(|i| {
                boxed(move |_: &TaskContext| {
                    thread::sleep(Duration::from_millis(10 * (5 - i)));
                    i * 10
                })
            })
            .collect();
        let started = Instant::now();
        let outcomes = TaskManager::new(tasks, Duration::from_secs(5), || u64::MAX)
            .unwrap()
            .run();
        assert!(started.elapsed() < Duration::from_secs(2));
        let results: Vec<_> = outcomes.iter().map(|o| (o.finished, o.result)).collect();
        assert_eq!(results, vec![(true, 0), (true, 10), (true, 20), (true, 30), (true, 40)]);
    }

    #[test]
    fn test_unit_output_is_captured_by_index() {
        security::install_default();
        let tasks = vec![
            boxed(|ctx: &TaskContext| {
                write!(ctx.stdout(), "out {}", ctx.index()).unwrap();
                write!(ctx.stderr(), "err").unwrap();
            }),
            boxed(|ctx: &TaskContext| {
                writeln!(crate::runtime::capture::stdout(), "via thread {}", ctx.index()).unwrap();
            }),
        ];
        let mut manager = TaskManager::new(tasks, Duration::from_secs(2), || ()).unwrap();
        manager.run();
        assert_eq!(manager.buffered_stdout()[&0], "out 0");
        assert_eq!(manager.buffered_stderr()[&0], "err");
        assert_eq!(manager.buffered_stdout()[&1], "via thread 1\n");
        assert_eq!(manager.buffered_stderr()[&1], "");
    }

    #[test]
    fn test_units_are_untrusted() {
        security::install_default();
        let tasks = vec![boxed(|ctx: &TaskContext| {
            (
                ctx.request_exit(1),
                ctx.request_exec("rm -rf /"),
                security::check(&Operation::ThreadAccess),
                ctx.check(&Operation::CreateClassLoader),
            )
        })];
        let outcomes = TaskManager::new(tasks, Duration::from_secs(2), || {
            (Ok(()), Ok(()), Ok(()), Ok(()))
        })
        .unwrap()
        .run();
        let (exit, exec, thread, loader) = outcomes[0].result.clone();
        assert!(outcomes[0].finished);
        assert_eq!(exit, Err(SecurityViolation::Exit(1)));
        assert!(matches!(exec, Err(SecurityViolation::Exec(_))));
        assert_eq!(thread, Err(SecurityViolation::ThreadAccess));
        assert_eq!(loader, Ok(()));
    }

    #[test]
    fn test_stuck_unit_is_abandoned() {
        security::install_default();
        let tasks = vec![boxed(|_: &TaskContext| {
            // Ignores cancellation
            thread::sleep(Duration::from_millis(1500));
            1
        })];
        let started = Instant::now();
        let outcomes = TaskManager::new(tasks, Duration::from_millis(100), || 0)
            .unwrap()
            .with_grace_period(Duration::from_millis(20))
            .with_stuck_policy(StuckTaskPolicy::Abandon)
            .run();
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert_eq!(outcomes, vec![Outcome { finished: false, result: 0 }]);
    }

    #[test]
    fn test_thread_names_use_prefix() {
        security::install_default();
        let tasks = vec![boxed(|ctx: &TaskContext| {
            (ctx.unit_name().to_string(), thread::current().name().map(str::to_string))
        })];
        let outcomes = TaskManager::new(tasks, Duration::from_secs(2), || (String::new(), None))
            .unwrap()
            .with_thread_name_prefix("Tester")
            .run();
        let (unit, thread_name) = &outcomes[0].result;
        assert!(unit.starts_with("Tester"));
        assert_eq!(thread_name.as_deref(), Some(unit.as_str()));
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
