/// Byte-capped reader
use std::io::{self, Read};
use thiserror::Error;

/// Raised (inside an `io::Error`) once a stream produced more than its cap
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Input amount exceeded ({limit} bytes)")]
pub struct InputAmountExceeded {
    pub limit: usize,
}

/// True if the error was produced by a `LimitedReader` hitting its cap
pub fn is_amount_exceeded(err: &io::Error) -> bool {
    err.get_ref()
        .map(|inner| inner.is::<InputAmountExceeded>())
        .unwrap_or(false)
}

/// Reader that delivers at most `max_bytes` bytes.
///
/// Reading exactly `max_bytes` and then hitting end-of-stream is fine; any
/// byte beyond the cap turns this and every later read into an
/// `InputAmountExceeded` error.
pub struct LimitedReader<R> {
    inner: R,
    max_bytes: usize,
    count: usize,
    exceeded: bool,
}

impl<R: Read> LimitedReader<R> {
    pub fn new(inner: R, max_bytes: usize) -> Self {
        LimitedReader {
            inner,
            max_bytes,
            count: 0,
            exceeded: false,
        }
    }

    pub fn bytes_read(&self) -> usize {
        self.count
    }

    pub fn is_exceeded(&self) -> bool {
        self.exceeded
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn exceeded_error(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::Other,
            InputAmountExceeded {
                limit: self.max_bytes,
            },
        )
    }
}

impl<R: Read> Read for LimitedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.exceeded {
            return Err(self.exceeded_error());
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let remaining = self.max_bytes - self.count;
        if remaining == 0 {
            // At the cap: one probe byte tells EOF apart from overflow
            let mut probe = [0u8; 1];
            return match self.inner.read(&mut probe)? {
                0 => Ok(0),
                _ => {
                    self.exceeded = true;
                    Err(self.exceeded_error())
                }
            };
        }

        let want = buf.len().min(remaining);
        let n = self.inner.read(&mut buf[..want])?;
        self.count += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_exact_cap_then_eof_is_clean() {
        let mut reader = LimitedReader::new(Cursor::new(b"abcd".to_vec()), 4);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcd");
        assert!(!reader.is_exceeded());
    }

    #[test]
    fn test_overflow_fails_and_stays_failed() {
        let mut reader = LimitedReader::new(Cursor::new(b"abcdef".to_vec()), 4);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert!(is_amount_exceeded(&err));
        assert_eq!(out, b"abcd");
        assert_eq!(reader.bytes_read(), 4);

        let mut buf = [0u8; 8];
        assert!(is_amount_exceeded(&reader.read(&mut buf).unwrap_err()));
    }

    #[test]
    fn test_zero_cap_allows_empty_stream() {
        let mut reader = LimitedReader::new(Cursor::new(Vec::new()), 0);
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_other_errors_are_not_amount_exceeded() {
        let err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        assert!(!is_amount_exceeded(&err));
    }
}
