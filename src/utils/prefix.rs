/// Prefix stripping for the sandbox banner
use std::io::{self, Read};

/// Printed to stdout by the sandbox library before it hands control to the program
pub const SANDBOX_BANNER: &[u8] = b"<<entering SECCOMP mode>>\n";

enum State {
    /// `matched` bytes of the prefix seen so far
    Matching { matched: usize },
    /// Bytes held back while matching, to be returned before anything else
    Replaying { pending: Vec<u8>, pos: usize },
    Passthrough,
}

/// Removes `prefix` from the head of a stream iff the stream starts with it.
///
/// On the first mismatching byte everything read so far is passed through
/// unchanged, as is a partial match cut short by end-of-stream.
pub struct PrefixStripper<R> {
    inner: R,
    prefix: &'static [u8],
    state: State,
}

impl<R: Read> PrefixStripper<R> {
    pub fn new(inner: R, prefix: &'static [u8]) -> Self {
        let state = if prefix.is_empty() {
            State::Passthrough
        } else {
            State::Matching { matched: 0 }
        };
        PrefixStripper {
            inner,
            prefix,
            state,
        }
    }

    pub fn sandbox_banner(inner: R) -> Self {
        Self::new(inner, SANDBOX_BANNER)
    }

    /// Advance the matcher by one read; returns once the state changed or EOF
    fn advance(&mut self, matched: usize) -> io::Result<bool> {
        let mut chunk = vec![0u8; self.prefix.len() - matched];
        let n = loop {
            match self.inner.read(&mut chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        if n == 0 {
            self.state = if matched == 0 {
                State::Passthrough
            } else {
                State::Replaying {
                    pending: self.prefix[..matched].to_vec(),
                    pos: 0,
                }
            };
            return Ok(matched == 0);
        }

        let mut now_matched = matched;
        for (i, &b) in chunk[..n].iter().enumerate() {
            if b == self.prefix[now_matched] {
                now_matched += 1;
            } else {
                let mut pending = self.prefix[..now_matched].to_vec();
                pending.extend_from_slice(&chunk[i..n]);
                self.state = State::Replaying { pending, pos: 0 };
                return Ok(false);
            }
        }

        self.state = if now_matched == self.prefix.len() {
            State::Passthrough
        } else {
            State::Matching {
                matched: now_matched,
            }
        };
        Ok(false)
    }
}

impl<R: Read> Read for PrefixStripper<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match &mut self.state {
                State::Passthrough => return self.inner.read(buf),
                State::Replaying { pending, pos } => {
                    let n = buf.len().min(pending.len() - *pos);
                    buf[..n].copy_from_slice(&pending[*pos..*pos + n]);
                    *pos += n;
                    if *pos == pending.len() {
                        self.state = State::Passthrough;
                    }
                    return Ok(n);
                }
                State::Matching { matched } => {
                    let matched = *matched;
                    if self.advance(matched)? {
                        return Ok(0);
                    }
                }
            }
        }
    }
}
