/// Stdin writer thread
use log::{debug, warn};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

const WRITE_CHUNK: usize = 4096;

/// Sends a fixed text to a child's stdin, then closes the pipe.
///
/// Write errors (typically EPIPE when the child exits without reading)
/// are swallowed.
pub struct InputSender {
    handle: Option<JoinHandle<()>>,
    interrupted: Arc<AtomicBool>,
}

impl InputSender {
    pub fn start<W>(sink: W, text: String) -> std::io::Result<Self>
    where
        W: Write + Send + 'static,
    {
        let interrupted = Arc::new(AtomicBool::new(false));
        let flag = interrupted.clone();
        let handle = thread::Builder::new()
            .name("input-sender".to_string())
            .spawn(move || send(sink, text.as_bytes(), &flag))?;
        Ok(InputSender {
            handle: Some(handle),
            interrupted,
        })
    }

    /// Stop writing at the next chunk boundary
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Input sender thread panicked");
            }
        }
    }
}

fn send<W: Write>(mut sink: W, bytes: &[u8], interrupted: &AtomicBool) {
    for chunk in bytes.chunks(WRITE_CHUNK) {
        if interrupted.load(Ordering::SeqCst) {
            debug!("Input sender interrupted");
            return;
        }
        if let Err(e) = sink.write_all(chunk) {
            debug!("Stdin write failed: {}", e);
            return;
        }
    }
    if let Err(e) = sink.flush() {
        debug!("Stdin flush failed: {}", e);
    }
    // Dropping the sink closes the pipe
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_sends_all_text() {
        let sink = SharedSink::default();
        let text = "5\n3\n".repeat(3000);
        let mut sender = InputSender::start(sink.clone(), text.clone()).unwrap();
        sender.join();
        assert_eq!(*sink.0.lock().unwrap(), text.into_bytes());
    }

    #[test]
    fn test_write_errors_are_swallowed() {
        let mut sender = InputSender::start(BrokenPipe, "data".to_string()).unwrap();
        sender.join();
    }
}
