//! Per-unit output capture
//!
//! While a task batch runs, text written through `stdout()`/`stderr()` is
//! routed into a buffer keyed by the writing thread's name instead of the
//! real standard streams.
//!
//! Only these writers (and the ones handed out by `TaskContext`) are
//! redirected. `println!`, `eprintln!` and direct writes to
//! `std::io::stdout()` still reach the process's real streams, so code
//! running inside a unit must send its output through the context writers.

use log::debug;
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

const UNNAMED: &str = "<unnamed>";

#[derive(Default)]
struct UnitBuffer {
    pending: Vec<u8>,
    data: Vec<u8>,
    closed: bool,
    truncated: bool,
}

/// Bounded per-thread-name text buffers
pub struct ThreadedOutputMonitor {
    max_bytes: usize,
    buffers: Mutex<HashMap<String, UnitBuffer>>,
}

impl ThreadedOutputMonitor {
    pub fn new(max_bytes: usize) -> Self {
        ThreadedOutputMonitor {
            max_bytes,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, UnitBuffer>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append to the buffer of `unit`; ignored once the unit is closed
    pub fn write_for(&self, unit: &str, bytes: &[u8]) {
        let mut buffers = self.lock();
        let buffer = buffers.entry(unit.to_string()).or_default();
        if buffer.closed {
            return;
        }
        let room = self
            .max_bytes
            .saturating_sub(buffer.data.len() + buffer.pending.len());
        if bytes.len() > room {
            buffer.truncated = true;
        }
        buffer.pending.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    /// Append to the buffer named after the calling thread
    pub fn write_current(&self, bytes: &[u8]) {
        let current = std::thread::current();
        self.write_for(current.name().unwrap_or(UNNAMED), bytes);
    }

    pub fn flush(&self, unit: &str) {
        if let Some(buffer) = self.lock().get_mut(unit) {
            let pending = std::mem::take(&mut buffer.pending);
            buffer.data.extend_from_slice(&pending);
        }
    }

    /// Flush and stop accepting output for `unit`
    pub fn close(&self, unit: &str) {
        let mut buffers = self.lock();
        let buffer = buffers.entry(unit.to_string()).or_default();
        let pending = std::mem::take(&mut buffer.pending);
        buffer.data.extend_from_slice(&pending);
        buffer.closed = true;
    }

    /// Flush, close and return the text captured for `unit`
    pub fn take_output(&self, unit: &str) -> String {
        self.close(unit);
        let buffers = self.lock();
        match buffers.get(unit) {
            Some(buffer) => {
                if buffer.truncated {
                    debug!("Captured output of {} was truncated", unit);
                }
                String::from_utf8_lossy(&buffer.data).into_owned()
            }
            None => String::new(),
        }
    }
}

/// The pair of monitors standing in for stdout and stderr
#[derive(Clone)]
pub struct CapturedStreams {
    pub stdout: Arc<ThreadedOutputMonitor>,
    pub stderr: Arc<ThreadedOutputMonitor>,
}

impl CapturedStreams {
    pub fn new(max_bytes: usize) -> Self {
        CapturedStreams {
            stdout: Arc::new(ThreadedOutputMonitor::new(max_bytes)),
            stderr: Arc::new(ThreadedOutputMonitor::new(max_bytes)),
        }
    }
}

static ACTIVE: RwLock<Option<CapturedStreams>> = RwLock::new(None);
static RUN_LOCK: Mutex<()> = Mutex::new(());

/// Routes `stdout()`/`stderr()` into monitors until dropped.
///
/// Only one redirection exists at a time; a second `install` blocks until
/// the first guard is dropped. The previous state is restored on drop,
/// including during unwinding.
pub struct RedirectGuard {
    previous: Option<CapturedStreams>,
    _serial: MutexGuard<'static, ()>,
}

impl RedirectGuard {
    pub fn install(streams: CapturedStreams) -> Self {
        let serial = RUN_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let mut active = ACTIVE.write().unwrap_or_else(PoisonError::into_inner);
        let previous = active.replace(streams);
        debug!("Standard output redirected to per-unit buffers");
        RedirectGuard {
            previous,
            _serial: serial,
        }
    }
}

impl Drop for RedirectGuard {
    fn drop(&mut self) {
        let mut active = ACTIVE.write().unwrap_or_else(PoisonError::into_inner);
        *active = self.previous.take();
        debug!("Standard output redirection restored");
    }
}

pub fn is_redirected() -> bool {
    ACTIVE
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .is_some()
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

fn write_stream(stream: Stream, bytes: &[u8]) -> io::Result<()> {
    let active = ACTIVE.read().unwrap_or_else(PoisonError::into_inner);
    match (active.as_ref(), stream) {
        (Some(streams), Stream::Stdout) => {
            streams.stdout.write_current(bytes);
            Ok(())
        }
        (Some(streams), Stream::Stderr) => {
            streams.stderr.write_current(bytes);
            Ok(())
        }
        (None, Stream::Stdout) => io::stdout().write_all(bytes),
        (None, Stream::Stderr) => io::stderr().write_all(bytes),
    }
}

/// Process stdout, or the caller's capture buffer during a batch run
pub struct Stdout;

/// Process stderr, or the caller's capture buffer during a batch run
pub struct Stderr;

pub fn stdout() -> Stdout {
    Stdout
}

pub fn stderr() -> Stderr {
    Stderr
}

impl Write for Stdout {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        write_stream(Stream::Stdout, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !is_redirected() {
            io::stdout().flush()?;
        }
        Ok(())
    }
}

impl Write for Stderr {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        write_stream(Stream::Stderr, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writer bound to one unit's buffer, handed out through `TaskContext`
pub struct UnitWriter {
    monitor: Arc<ThreadedOutputMonitor>,
    unit: String,
}

impl UnitWriter {
    pub fn new(monitor: Arc<ThreadedOutputMonitor>, unit: impl Into<String>) -> Self {
        UnitWriter {
            monitor,
            unit: unit.into(),
        }
    }
}

impl Write for UnitWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.monitor.write_for(&self.unit, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.monitor.flush(&self.unit);
        Ok(())
    }
}
