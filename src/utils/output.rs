/// Bounded output collection
/// Reads a child stream on its own thread and keeps a capped set of lines.
use crate::utils::limited_input::{is_amount_exceeded, LimitedReader};
use log::{debug, warn};
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

const READ_CHUNK: usize = 4096;

/// Output caps for one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputLimits {
    /// Bytes read from the stream before the rest is discarded
    pub max_bytes: usize,
    /// Lines kept
    pub max_lines: usize,
    /// Characters kept per line
    pub max_chars_per_line: usize,
}

impl Default for OutputLimits {
    fn default() -> Self {
        OutputLimits {
            max_bytes: 8192,
            max_lines: 60,
            max_chars_per_line: 80,
        }
    }
}

/// Collects lines from a stream on a dedicated thread
pub struct LimitedOutputCollector {
    handle: Option<JoinHandle<Vec<String>>>,
    interrupted: Arc<AtomicBool>,
    lines: Vec<String>,
}

impl LimitedOutputCollector {
    /// Start collecting `source` in the background
    pub fn start<R>(source: R, limits: OutputLimits) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let interrupted = Arc::new(AtomicBool::new(false));
        let flag = interrupted.clone();
        let handle = thread::Builder::new()
            .name("output-collector".to_string())
            .spawn(move || collect_lines(source, limits, &flag))?;

        Ok(LimitedOutputCollector {
            handle: Some(handle),
            interrupted,
            lines: Vec::new(),
        })
    }

    /// Ask the collector to stop at its next read
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    /// Shared flag that has the same effect as `interrupt()`
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    /// Wait for the collector thread; idempotent
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(lines) => self.lines = lines,
                Err(_) => warn!("Output collector thread panicked; output discarded"),
            }
        }
    }

    /// Lines collected, in order. Empty until `join()` has returned.
    pub fn collected_output(&self) -> &[String] {
        &self.lines
    }

    pub fn into_lines(mut self) -> Vec<String> {
        self.join();
        std::mem::take(&mut self.lines)
    }
}

/// Read `source` to the end (or until interrupted) keeping bounded lines
pub fn collect_lines<R: Read>(source: R, limits: OutputLimits, interrupted: &AtomicBool) -> Vec<String> {
    let mut reader = LimitedReader::new(source, limits.max_bytes);
    let mut builder = LineBuilder::new(limits);
    let mut buf = [0u8; READ_CHUNK];

    loop {
        if interrupted.load(Ordering::SeqCst) {
            debug!("Output collector interrupted");
            return builder.finish();
        }
        match reader.read(&mut buf) {
            Ok(0) => return builder.finish(),
            Ok(n) => builder.push_bytes(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_amount_exceeded(&e) => {
                debug!("Output byte cap of {} reached", limits.max_bytes);
                drain(reader.into_inner(), interrupted);
                return builder.finish();
            }
            Err(e) => {
                debug!("Output stream closed with error: {}", e);
                return builder.finish();
            }
        }
    }
}

/// Keep reading so the writer never blocks on a full pipe
fn drain<R: Read>(mut source: R, interrupted: &AtomicBool) {
    let mut buf = [0u8; READ_CHUNK];
    while !interrupted.load(Ordering::SeqCst) {
        match source.read(&mut buf) {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => return,
        }
    }
}

struct LineBuilder {
    limits: OutputLimits,
    lines: Vec<String>,
    current: Vec<u8>,
}

impl LineBuilder {
    fn new(limits: OutputLimits) -> Self {
        LineBuilder {
            limits,
            lines: Vec::new(),
            current: Vec::new(),
        }
    }

    fn is_full(&self) -> bool {
        self.lines.len() >= self.limits.max_lines
    }

    // A UTF-8 char is at most four bytes
    fn byte_budget(&self) -> usize {
        self.limits.max_chars_per_line.saturating_mul(4)
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if self.is_full() {
                return;
            }
            if b == b'\n' {
                self.end_line();
            } else if self.current.len() < self.byte_budget() {
                self.current.push(b);
            }
        }
    }

    fn end_line(&mut self) {
        let line = truncate_line(&self.current, self.limits.max_chars_per_line);
        self.lines.push(line);
        self.current.clear();
    }

    fn finish(mut self) -> Vec<String> {
        if !self.current.is_empty() && !self.is_full() {
            self.end_line();
        }
        self.lines
    }
}

fn truncate_line(bytes: &[u8], max_chars: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.strip_suffix('\r').unwrap_or(&text);
    text.chars().take(max_chars).collect()
}
