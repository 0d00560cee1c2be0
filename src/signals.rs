//! Async-signal-safe delivery of SIGCHLD/SIGHUP/SIGINT/SIGTERM (and any
//! per-task signal) onto a self-pipe the Poller can wait on.
use nix::errno::Errno;
use nix::fcntl::{self, FcntlArg, OFlag};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::{LegionError, PollError};

static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn relay(signum: libc::c_int) {
    let fd = WRITE_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    let byte = [signum as u8];
    // Best effort; a full pipe just means a duplicate wakeup, which the
    // drain loop already treats as harmless.
    unsafe {
        libc::write(fd, byte.as_ptr() as *const libc::c_void, 1);
    }
}

/// What a readiness event on the self-pipe resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// A child exited; the reap loop should run.
    Reap,
    /// Schedule a graceful shutdown followed by a reset signal to the caller.
    Reset,
    /// Schedule an exit.
    Exit,
    /// Any other signal, to be relayed to all registered tasks.
    Relay(Signal),
}

/// Installs restartable handlers and exposes the self-pipe's read end.
pub struct SignalHub {
    read_fd: RawFd,
    write_fd: RawFd,
    installed: HashMap<Signal, SigAction>,
}

impl SignalHub {
    /// Installs handlers for SIGCHLD, SIGHUP, SIGTERM, and SIGINT (the
    /// latter only if it isn't already ignored at entry, matching the
    /// contract that a caller who deliberately ignores SIGINT is left
    /// alone).
    pub fn new() -> Result<Self, LegionError> {
        let (read_fd, write_fd) = unistd::pipe().map_err(LegionError::Signal)?;
        for fd in [read_fd, write_fd] {
            fcntl::fcntl(fd, FcntlArg::F_SETFD(fcntl::FdFlag::FD_CLOEXEC))
                .map_err(LegionError::Signal)?;
        }
        fcntl::fcntl(
            read_fd,
            FcntlArg::F_SETFL(OFlag::O_NONBLOCK),
        )
        .map_err(LegionError::Signal)?;

        WRITE_FD.store(write_fd, Ordering::Relaxed);

        let mut hub = SignalHub {
            read_fd,
            write_fd,
            installed: HashMap::new(),
        };

        hub.install(Signal::SIGCHLD)?;
        hub.install(Signal::SIGHUP)?;
        hub.install(Signal::SIGTERM)?;
        hub.install_if_not_ignored(Signal::SIGINT)?;

        Ok(hub)
    }

    /// Installs a handler for an additional signal named in a task's
    /// `events: [{type: ..., signal: ...}]` binding.
    pub fn watch_signal(&mut self, name: &str) -> Result<Signal, LegionError> {
        let sig = parse_signal_name(name)
            .ok_or_else(|| LegionError::Signal(Errno::EINVAL))?;
        if !self.installed.contains_key(&sig) {
            self.install(sig)?;
        }
        Ok(sig)
    }

    fn install(&mut self, sig: Signal) -> Result<(), LegionError> {
        let action = SigAction::new(
            SigHandler::Handler(relay),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        let old = unsafe { signal::sigaction(sig, &action) }.map_err(LegionError::Signal)?;
        self.installed.insert(sig, old);
        Ok(())
    }

    fn install_if_not_ignored(&mut self, sig: Signal) -> Result<(), LegionError> {
        let current = unsafe {
            signal::sigaction(
                sig,
                &SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty()),
            )
        }
        .map_err(LegionError::Signal)?;

        if current.handler() == SigHandler::SigIgn {
            // It already was ignored; put that back and do not install ours.
            unsafe { signal::sigaction(sig, &current) }.map_err(LegionError::Signal)?;
            return Ok(());
        }

        let action = SigAction::new(
            SigHandler::Handler(relay),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        unsafe { signal::sigaction(sig, &action) }.map_err(LegionError::Signal)?;
        self.installed.insert(sig, current);
        Ok(())
    }

    /// The self-pipe's read end, for registration with the Poller.
    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Drains the self-pipe and classifies each signal byte seen, in order.
    pub fn drain(&self) -> Result<Vec<SignalEvent>, PollError> {
        let mut events = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match unistd::read(self.read_fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for &byte in &buf[..n] {
                        events.push(classify(byte as libc::c_int));
                    }
                    if n < buf.len() {
                        break;
                    }
                }
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(PollError::Errno(e)),
            }
        }
        Ok(events)
    }

    /// Restores every signal to its entry-time disposition, then closes the
    /// self-pipe.
    pub fn shutdown(mut self) {
        for (sig, action) in self.installed.drain() {
            let _ = unsafe { signal::sigaction(sig, &action) };
        }
        WRITE_FD.store(-1, Ordering::Relaxed);
        let _ = unistd::close(self.read_fd);
        let _ = unistd::close(self.write_fd);
    }
}

fn classify(raw: libc::c_int) -> SignalEvent {
    match Signal::try_from(raw) {
        Ok(Signal::SIGCHLD) => SignalEvent::Reap,
        Ok(Signal::SIGHUP) => SignalEvent::Reset,
        Ok(Signal::SIGTERM) | Ok(Signal::SIGINT) => SignalEvent::Exit,
        Ok(other) => SignalEvent::Relay(other),
        Err(_) => SignalEvent::Relay(Signal::SIGCHLD),
    }
}

/// Resolves a signal name (`HUP`, `SIGHUP`, case-insensitive) to a `Signal`.
pub fn parse_signal_name(name: &str) -> Option<Signal> {
    let trimmed = name.trim();
    let upper = trimmed.to_ascii_uppercase();
    let canonical = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::iterator().find(|s| s.as_str().eq_ignore_ascii_case(&canonical))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parse_signal_name_accepts_bare_and_prefixed() {
        assert_eq!(parse_signal_name("HUP"), Some(Signal::SIGHUP));
        assert_eq!(parse_signal_name("SIGHUP"), Some(Signal::SIGHUP));
        assert_eq!(parse_signal_name("hup"), Some(Signal::SIGHUP));
        assert_eq!(parse_signal_name("not-a-signal"), None);
    }

    #[test]
    fn self_pipe_wakes_on_raised_signal() {
        let hub = SignalHub::new().expect("install handlers");
        signal::raise(Signal::SIGHUP).expect("raise");

        // Give the handler a moment; SA_RESTART handlers run synchronously
        // on delivery so this is only needed for scheduler fairness.
        std::thread::sleep(Duration::from_millis(20));

        let events = hub.drain().expect("drain");
        assert!(events.contains(&SignalEvent::Reset));
        hub.shutdown();
    }
}
