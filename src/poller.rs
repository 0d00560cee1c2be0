//! Uniform readiness multiplexing over kqueue, epoll/poll, or select.
//!
//! The backend is chosen once, at construction, and frozen the moment the
//! first object is registered — mirroring the upstream implementation's
//! rule that the poll mode can't change mid-flight.
use crate::error::PollError;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Readiness bits returned from `poll()`. Mirrors `POLLIN`/`POLLOUT`/etc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMask(u32);

impl EventMask {
    /// Readable.
    pub const IN: EventMask = EventMask(0b0_0001);
    /// Writable.
    pub const OUT: EventMask = EventMask(0b0_0010);
    /// Urgent/priority data (select backend only; kqueue can't express this).
    pub const PRI: EventMask = EventMask(0b0_0100);
    /// Error condition.
    pub const ERR: EventMask = EventMask(0b0_1000);
    /// Peer hung up.
    pub const HUP: EventMask = EventMask(0b1_0000);
    /// Descriptor is invalid.
    pub const INVAL: EventMask = EventMask(0b10_0000);
    /// No bits set.
    pub const EMPTY: EventMask = EventMask(0);

    /// Whether `self` contains every bit set in `other`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no bits are set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for EventMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        EventMask(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl std::ops::BitAnd for EventMask {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        EventMask(self.0 & rhs.0)
    }
}

/// Which OS primitive backs the poller. Frozen after the first `register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// `kqueue(2)` — BSD/macOS.
    Kqueue,
    /// `epoll(7)` — Linux.
    Epoll,
    /// Portable `poll(2)`.
    Poll,
    /// Portable `select(2)`, the universal fallback. `PRI` only works here.
    Select,
}

impl PollMode {
    fn best_available() -> Option<PollMode> {
        #[cfg(target_os = "linux")]
        {
            return Some(PollMode::Epoll);
        }
        #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
        {
            return Some(PollMode::Kqueue);
        }
        #[cfg(not(any(
            target_os = "linux",
            target_os = "macos",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd"
        )))]
        {
            Some(PollMode::Poll)
        }
    }
}

/// A uniform readiness interface over the registered objects of type `T`.
///
/// `T` is whatever the caller wants back in the result set (a task name, a
/// watcher handle, ...); only its associated `RawFd` is given to the OS.
pub struct Poller<T: Clone> {
    mode: PollMode,
    frozen: bool,
    registered: HashMap<RawFd, (T, EventMask)>,
    #[cfg(target_os = "linux")]
    epoll_fd: Option<RawFd>,
    #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
    kqueue_fd: Option<RawFd>,
}

impl<T: Clone> Poller<T> {
    /// Constructs a poller, selecting the best backend for this platform.
    /// Fails only if no backend at all is available.
    pub fn new() -> Result<Self, PollError> {
        Self::with_mode(PollMode::best_available().ok_or(PollError::NoBackend)?)
    }

    /// Constructs a poller forced onto a specific backend. Used by tests to
    /// exercise the `select` fallback even on platforms that would normally
    /// pick kqueue/epoll, and by callers that need `PRI`, which kqueue does
    /// not support.
    pub fn with_mode(mode: PollMode) -> Result<Self, PollError> {
        let poller = Poller {
            mode,
            frozen: false,
            registered: HashMap::new(),
            #[cfg(target_os = "linux")]
            epoll_fd: None,
            #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
            kqueue_fd: None,
        };
        Ok(poller)
    }

    /// The backend this poller ended up using.
    pub fn mode(&self) -> PollMode {
        self.mode
    }

    #[cfg(target_os = "linux")]
    fn ensure_epoll(&mut self) -> Result<RawFd, PollError> {
        if let Some(fd) = self.epoll_fd {
            return Ok(fd);
        }
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(PollError::Io(std::io::Error::last_os_error()));
        }
        self.epoll_fd = Some(fd);
        Ok(fd)
    }

    #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
    fn ensure_kqueue(&mut self) -> Result<RawFd, PollError> {
        if let Some(fd) = self.kqueue_fd {
            return Ok(fd);
        }
        let fd = unsafe { libc::kqueue() };
        if fd < 0 {
            return Err(PollError::Io(std::io::Error::last_os_error()));
        }
        self.kqueue_fd = Some(fd);
        Ok(fd)
    }

    /// Registers an object's descriptor for the given mask. Freezes the
    /// backend on first call. `PRI` is rejected on the kqueue backend — the
    /// caller must force `PollMode::Select` to use it.
    pub fn register(&mut self, token: T, fd: RawFd, mask: EventMask) -> Result<(), PollError> {
        if self.mode == PollMode::Kqueue && mask.contains(EventMask::PRI) {
            return Err(PollError::Io(std::io::Error::other(
                "PRI is not available on the kqueue backend; force the select backend",
            )));
        }
        self.frozen = true;

        match self.mode {
            #[cfg(target_os = "linux")]
            PollMode::Epoll => {
                let epfd = self.ensure_epoll()?;
                let mut ev = libc::epoll_event {
                    events: to_epoll_events(mask),
                    u64: fd as u64,
                };
                let rc = unsafe {
                    libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd, &mut ev as *mut _)
                };
                if rc != 0 {
                    return Err(PollError::Io(std::io::Error::last_os_error()));
                }
            }
            #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
            PollMode::Kqueue => {
                let kq = self.ensure_kqueue()?;
                register_kqueue(kq, fd, mask)?;
            }
            _ => {}
        }

        self.registered.insert(fd, (token, mask));
        Ok(())
    }

    /// Updates the mask for an already-registered descriptor.
    pub fn modify(&mut self, fd: RawFd, mask: EventMask) -> Result<(), PollError> {
        if let Some((token, old_mask)) = self.registered.get(&fd).cloned() {
            match self.mode {
                #[cfg(target_os = "linux")]
                PollMode::Epoll => {
                    let epfd = self.ensure_epoll()?;
                    let mut ev = libc::epoll_event {
                        events: to_epoll_events(mask),
                        u64: fd as u64,
                    };
                    let rc = unsafe {
                        libc::epoll_ctl(epfd, libc::EPOLL_CTL_MOD, fd, &mut ev as *mut _)
                    };
                    if rc != 0 {
                        return Err(PollError::Io(std::io::Error::last_os_error()));
                    }
                }
                #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
                PollMode::Kqueue => {
                    let kq = self.ensure_kqueue()?;
                    unregister_kqueue(kq, fd, old_mask);
                    register_kqueue(kq, fd, mask)?;
                }
                _ => {
                    let _ = old_mask;
                }
            }
            self.registered.insert(fd, (token, mask));
        }
        Ok(())
    }

    /// Stops watching a descriptor.
    pub fn unregister(&mut self, fd: RawFd) -> Result<(), PollError> {
        if let Some((_, mask)) = self.registered.remove(&fd) {
            match self.mode {
                #[cfg(target_os = "linux")]
                PollMode::Epoll => {
                    if let Some(epfd) = self.epoll_fd {
                        unsafe {
                            libc::epoll_ctl(
                                epfd,
                                libc::EPOLL_CTL_DEL,
                                fd,
                                std::ptr::null_mut(),
                            );
                        }
                    }
                }
                #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
                PollMode::Kqueue => {
                    if let Some(kq) = self.kqueue_fd {
                        unregister_kqueue(kq, fd, mask);
                    }
                }
                _ => {
                    let _ = mask;
                }
            }
        }
        Ok(())
    }

    /// Blocks up to `timeout` waiting for readiness, returning the
    /// originally-registered tokens paired with what fired. `EINTR` is
    /// retried transparently rather than surfaced as an error.
    pub fn poll(&mut self, timeout: Duration) -> Result<Vec<(T, EventMask)>, PollError> {
        loop {
            let result = match self.mode {
                #[cfg(target_os = "linux")]
                PollMode::Epoll => self.poll_epoll(timeout),
                #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
                PollMode::Kqueue => self.poll_kqueue(timeout),
                PollMode::Poll => self.poll_poll(timeout),
                PollMode::Select => self.poll_select(timeout),
                #[allow(unreachable_patterns)]
                _ => self.poll_poll(timeout),
            };

            match result {
                Err(PollError::Errno(nix::errno::Errno::EINTR)) => continue,
                Err(PollError::Io(ref e)) if e.kind() == std::io::ErrorKind::Interrupted => {
                    continue;
                }
                other => return other,
            }
        }
    }

    fn poll_select(&mut self, timeout: Duration) -> Result<Vec<(T, EventMask)>, PollError> {
        unsafe {
            let mut read_set: libc::fd_set = std::mem::zeroed();
            let mut write_set: libc::fd_set = std::mem::zeroed();
            let mut except_set: libc::fd_set = std::mem::zeroed();
            libc::FD_ZERO(&mut read_set);
            libc::FD_ZERO(&mut write_set);
            libc::FD_ZERO(&mut except_set);

            let mut max_fd = 0;
            for (&fd, (_, mask)) in &self.registered {
                if mask.contains(EventMask::IN) || mask.contains(EventMask::PRI) {
                    libc::FD_SET(fd, &mut read_set);
                }
                if mask.contains(EventMask::OUT) {
                    libc::FD_SET(fd, &mut write_set);
                }
                libc::FD_SET(fd, &mut except_set);
                max_fd = max_fd.max(fd);
            }

            let mut tv = libc::timeval {
                tv_sec: timeout.as_secs() as libc::time_t,
                tv_usec: timeout.subsec_micros() as libc::suseconds_t,
            };

            let rc = libc::select(
                max_fd + 1,
                &mut read_set,
                &mut write_set,
                &mut except_set,
                &mut tv,
            );
            if rc < 0 {
                return Err(PollError::Io(std::io::Error::last_os_error()));
            }

            let mut out = Vec::new();
            for (&fd, (token, _)) in &self.registered {
                let mut mask = EventMask::EMPTY;
                if libc::FD_ISSET(fd, &read_set) {
                    mask |= EventMask::IN;
                }
                if libc::FD_ISSET(fd, &write_set) {
                    mask |= EventMask::OUT;
                }
                if libc::FD_ISSET(fd, &except_set) {
                    mask |= EventMask::ERR;
                }
                if !mask.is_empty() {
                    out.push((token.clone(), mask));
                }
            }
            Ok(out)
        }
    }

    fn poll_poll(&mut self, timeout: Duration) -> Result<Vec<(T, EventMask)>, PollError> {
        let mut entries: Vec<(RawFd, T)> = self
            .registered
            .iter()
            .map(|(&fd, (token, _))| (fd, token.clone()))
            .collect();
        let mut pollfds: Vec<libc::pollfd> = entries
            .iter()
            .map(|(fd, _)| {
                let (_, mask) = &self.registered[fd];
                libc::pollfd {
                    fd: *fd,
                    events: to_poll_events(*mask),
                    revents: 0,
                }
            })
            .collect();

        let rc = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout.as_millis() as libc::c_int,
            )
        };
        if rc < 0 {
            return Err(PollError::Io(std::io::Error::last_os_error()));
        }

        let mut out = Vec::new();
        for (pfd, (fd, _)) in pollfds.iter().zip(entries.drain(..)) {
            let mask = from_poll_events(pfd.revents);
            if !mask.is_empty() {
                let (token, _) = &self.registered[&fd];
                out.push((token.clone(), mask));
            }
        }
        Ok(out)
    }

    #[cfg(target_os = "linux")]
    fn poll_epoll(&mut self, timeout: Duration) -> Result<Vec<(T, EventMask)>, PollError> {
        let epfd = self.ensure_epoll()?;
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.registered.len().max(1)];
        let rc = unsafe {
            libc::epoll_wait(
                epfd,
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                timeout.as_millis() as libc::c_int,
            )
        };
        if rc < 0 {
            return Err(PollError::Io(std::io::Error::last_os_error()));
        }
        let mut out = Vec::with_capacity(rc as usize);
        for ev in events.into_iter().take(rc as usize) {
            let fd = ev.u64 as RawFd;
            if let Some((token, _)) = self.registered.get(&fd) {
                out.push((token.clone(), from_epoll_events(ev.events)));
            }
        }
        Ok(out)
    }

    #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
    fn poll_kqueue(&mut self, timeout: Duration) -> Result<Vec<(T, EventMask)>, PollError> {
        let kq = self.ensure_kqueue()?;
        let mut out_events = vec![unsafe { std::mem::zeroed::<libc::kevent>() }; self.registered.len().max(1)];
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as i64,
        };
        let rc = unsafe {
            libc::kevent(
                kq,
                std::ptr::null(),
                0,
                out_events.as_mut_ptr(),
                out_events.len() as libc::c_int,
                &ts,
            )
        };
        if rc < 0 {
            return Err(PollError::Io(std::io::Error::last_os_error()));
        }
        let mut out = Vec::with_capacity(rc as usize);
        for ev in out_events.into_iter().take(rc as usize) {
            let fd = ev.ident as RawFd;
            if let Some((token, _)) = self.registered.get(&fd) {
                let mut mask = EventMask::EMPTY;
                if ev.filter == libc::EVFILT_READ {
                    mask |= EventMask::IN;
                }
                if ev.filter == libc::EVFILT_WRITE {
                    mask |= EventMask::OUT;
                }
                if ev.flags & libc::EV_EOF != 0 {
                    mask |= EventMask::HUP;
                }
                if ev.flags & libc::EV_ERROR != 0 {
                    mask |= EventMask::ERR;
                }
                out.push((token.clone(), mask));
            }
        }
        Ok(out)
    }
}

#[cfg(target_os = "linux")]
fn to_epoll_events(mask: EventMask) -> u32 {
    let mut bits = 0u32;
    if mask.contains(EventMask::IN) {
        bits |= libc::EPOLLIN as u32;
    }
    if mask.contains(EventMask::OUT) {
        bits |= libc::EPOLLOUT as u32;
    }
    if mask.contains(EventMask::PRI) {
        bits |= libc::EPOLLPRI as u32;
    }
    bits
}

#[cfg(target_os = "linux")]
fn from_epoll_events(bits: u32) -> EventMask {
    let mut mask = EventMask::EMPTY;
    if bits & libc::EPOLLIN as u32 != 0 {
        mask |= EventMask::IN;
    }
    if bits & libc::EPOLLOUT as u32 != 0 {
        mask |= EventMask::OUT;
    }
    if bits & libc::EPOLLPRI as u32 != 0 {
        mask |= EventMask::PRI;
    }
    if bits & libc::EPOLLERR as u32 != 0 {
        mask |= EventMask::ERR;
    }
    if bits & libc::EPOLLHUP as u32 != 0 {
        mask |= EventMask::HUP;
    }
    mask
}

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
fn register_kqueue(kq: RawFd, fd: RawFd, mask: EventMask) -> Result<(), PollError> {
    let mut changes = Vec::new();
    if mask.contains(EventMask::IN) {
        changes.push(kevent_for(fd, libc::EVFILT_READ, libc::EV_ADD));
    }
    if mask.contains(EventMask::OUT) {
        changes.push(kevent_for(fd, libc::EVFILT_WRITE, libc::EV_ADD));
    }
    let rc = unsafe {
        libc::kevent(
            kq,
            changes.as_ptr(),
            changes.len() as libc::c_int,
            std::ptr::null_mut(),
            0,
            std::ptr::null(),
        )
    };
    if rc < 0 {
        return Err(PollError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
fn unregister_kqueue(kq: RawFd, fd: RawFd, mask: EventMask) {
    let mut changes = Vec::new();
    if mask.contains(EventMask::IN) {
        changes.push(kevent_for(fd, libc::EVFILT_READ, libc::EV_DELETE));
    }
    if mask.contains(EventMask::OUT) {
        changes.push(kevent_for(fd, libc::EVFILT_WRITE, libc::EV_DELETE));
    }
    unsafe {
        libc::kevent(
            kq,
            changes.as_ptr(),
            changes.len() as libc::c_int,
            std::ptr::null_mut(),
            0,
            std::ptr::null(),
        );
    }
}

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
fn kevent_for(fd: RawFd, filter: i16, flags: u16) -> libc::kevent {
    libc::kevent {
        ident: fd as usize,
        filter,
        flags,
        fflags: 0,
        data: 0,
        udata: std::ptr::null_mut(),
    }
}

fn to_poll_events(mask: EventMask) -> libc::c_short {
    let mut bits = 0;
    if mask.contains(EventMask::IN) {
        bits |= libc::POLLIN;
    }
    if mask.contains(EventMask::OUT) {
        bits |= libc::POLLOUT;
    }
    if mask.contains(EventMask::PRI) {
        bits |= libc::POLLPRI;
    }
    bits as libc::c_short
}

fn from_poll_events(bits: libc::c_short) -> EventMask {
    let bits = bits as i32;
    let mut mask = EventMask::EMPTY;
    if bits & libc::POLLIN != 0 {
        mask |= EventMask::IN;
    }
    if bits & libc::POLLOUT != 0 {
        mask |= EventMask::OUT;
    }
    if bits & libc::POLLPRI != 0 {
        mask |= EventMask::PRI;
    }
    if bits & libc::POLLERR != 0 {
        mask |= EventMask::ERR;
    }
    if bits & libc::POLLHUP != 0 {
        mask |= EventMask::HUP;
    }
    if bits & libc::POLLNVAL != 0 {
        mask |= EventMask::INVAL;
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn select_backend_reports_readable_pipe() {
        let (mut a, b) = UnixStream::pair().expect("socketpair");
        let mut poller: Poller<&'static str> =
            Poller::with_mode(PollMode::Select).expect("select backend");
        poller
            .register("sock", b.as_raw_fd(), EventMask::IN)
            .expect("register");

        a.write_all(b"x").expect("write");

        let events = poller
            .poll(Duration::from_millis(500))
            .expect("poll succeeds");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "sock");
        assert!(events[0].1.contains(EventMask::IN));

        let mut buf = [0u8; 1];
        let mut b = b;
        b.read_exact(&mut buf).expect("drain");
    }

    #[test]
    fn poll_backend_reports_readable_pipe() {
        let (mut a, b) = UnixStream::pair().expect("socketpair");
        let mut poller: Poller<u32> =
            Poller::with_mode(PollMode::Poll).expect("poll backend");
        poller
            .register(7, b.as_raw_fd(), EventMask::IN)
            .expect("register");

        a.write_all(b"y").expect("write");

        let events = poller
            .poll(Duration::from_millis(500))
            .expect("poll succeeds");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, 7);
    }

    #[test]
    fn kqueue_backend_rejects_pri() {
        let mut poller: Poller<u32> =
            Poller::with_mode(PollMode::Kqueue).expect("construct");
        let (_, b) = UnixStream::pair().expect("socketpair");
        let result = poller.register(1, b.as_raw_fd(), EventMask::PRI);
        if poller.mode() == PollMode::Kqueue {
            assert!(result.is_err());
        }
    }
}
