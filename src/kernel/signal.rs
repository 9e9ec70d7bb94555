//! Async-safe SIGTERM forwarding for the native wrapper
//!
//! A SIGTERM sent to the wrapper is relayed to the wrapped child so the
//! child can be stopped through the wrapper's pid.

use log::debug;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Pid of the child to forward to (0 = none yet)
static FORWARD_TARGET: AtomicI32 = AtomicI32::new(0);

/// Set once a SIGTERM arrived, so a late-spawned child can be stopped too
static TERM_RECEIVED: AtomicBool = AtomicBool::new(false);

/// Installed SIGTERM forwarding state
pub struct SigtermForwarder;

impl SigtermForwarder {
    /// Install the handler; call before spawning the child
    pub fn install() -> Result<Self, String> {
        let sig_action = SigAction::new(
            SigHandler::Handler(Self::signal_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        unsafe {
            signal::sigaction(Signal::SIGTERM, &sig_action)
                .map_err(|e| format!("Failed to install SIGTERM handler: {}", e))?;
        }

        debug!("SIGTERM forwarding installed");
        Ok(Self)
    }

    /// Async-safe signal handler
    /// Only atomics and kill(2), which is async-signal-safe
    extern "C" fn signal_handler(_signal: libc::c_int) {
        TERM_RECEIVED.store(true, Ordering::SeqCst);
        let pid = FORWARD_TARGET.load(Ordering::SeqCst);
        if pid > 0 {
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
    }

    /// Start forwarding to `pid`; forwards at once if SIGTERM already arrived
    pub fn forward_to(&self, pid: u32) {
        let pid = pid as i32;
        FORWARD_TARGET.store(pid, Ordering::SeqCst);
        if TERM_RECEIVED.load(Ordering::SeqCst) {
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
    }

    pub fn term_received(&self) -> bool {
        TERM_RECEIVED.load(Ordering::SeqCst)
    }
}

impl Drop for SigtermForwarder {
    fn drop(&mut self) {
        FORWARD_TARGET.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_target_cleared_on_drop() {
        let forwarder = SigtermForwarder;
        FORWARD_TARGET.store(12345, Ordering::SeqCst);
        drop(forwarder);
        assert_eq!(FORWARD_TARGET.load(Ordering::SeqCst), 0);
    }
}
