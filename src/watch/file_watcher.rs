//! Watches a mutable set of paths, deduplicating and aggregating changes.
//!
//! Backed by inotify on Linux, kqueue `EVFILT_VNODE` on BSD/macOS, or a
//! stat-polling fallback elsewhere. Paths registered with `missing=true`
//! are allowed to not exist yet; they sit in a pending set until they
//! appear, at which point exactly one change is synthesized.
use crate::error::WatchError;
use nix::errno::Errno;
use nix::fcntl::{self, FcntlArg, OFlag};
use nix::unistd;
use std::collections::{HashMap, HashSet};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StatSnapshot {
    mode: u32,
    nlink: u64,
    uid: u32,
    gid: u32,
    size: u64,
    mtime: i64,
    ino: u64,
}

impl StatSnapshot {
    fn capture(path: &Path) -> Option<Self> {
        let meta = std::fs::symlink_metadata(path).ok()?;
        Some(StatSnapshot {
            mode: meta.mode(),
            nlink: meta.nlink(),
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.size(),
            mtime: meta.mtime(),
            ino: meta.ino(),
        })
    }
}

struct WatchedPath {
    missing_ok: bool,
    pending: bool,
    stat: Option<StatSnapshot>,
    inotify_wd: Option<i32>,
    kqueue_fd: Option<RawFd>,
}

enum Backend {
    #[cfg(target_os = "linux")]
    Inotify { fd: RawFd },
    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    Kqueue { fd: RawFd },
    Polling { read_fd: RawFd, write_fd: RawFd },
}

/// Watches a changing set of filesystem paths.
pub struct FileWatcher {
    backend: Backend,
    paths: HashMap<PathBuf, WatchedPath>,
    changed: HashSet<PathBuf>,
    dirty: bool,
}

impl FileWatcher {
    /// Selects the best backend for the platform.
    pub fn new() -> Result<Self, WatchError> {
        #[cfg(target_os = "linux")]
        {
            let fd = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
            if fd < 0 {
                return Err(WatchError::Io(std::io::Error::last_os_error()));
            }
            return Ok(FileWatcher {
                backend: Backend::Inotify { fd },
                paths: HashMap::new(),
                changed: HashSet::new(),
                dirty: false,
            });
        }

        #[cfg(any(
            target_os = "macos",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd"
        ))]
        {
            let fd = unsafe { libc::kqueue() };
            if fd < 0 {
                return Err(WatchError::Io(std::io::Error::last_os_error()));
            }
            return Ok(FileWatcher {
                backend: Backend::Kqueue { fd },
                paths: HashMap::new(),
                changed: HashSet::new(),
                dirty: false,
            });
        }

        #[allow(unreachable_code)]
        {
            Self::new_polling()
        }
    }

    /// Forces the stat-polling backend; used as the portable fallback and
    /// exercised directly by tests regardless of platform.
    pub fn new_polling() -> Result<Self, WatchError> {
        let (read_fd, write_fd) = unistd::pipe()?;
        fcntl::fcntl(read_fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
        for fd in [read_fd, write_fd] {
            fcntl::fcntl(fd, FcntlArg::F_SETFD(fcntl::FdFlag::FD_CLOEXEC))?;
        }
        Ok(FileWatcher {
            backend: Backend::Polling { read_fd, write_fd },
            paths: HashMap::new(),
            changed: HashSet::new(),
            dirty: false,
        })
    }

    /// The descriptor to register with the `Poller`.
    pub fn fd(&self) -> RawFd {
        match &self.backend {
            #[cfg(target_os = "linux")]
            Backend::Inotify { fd } => *fd,
            #[cfg(any(
                target_os = "macos",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Backend::Kqueue { fd } => *fd,
            Backend::Polling { read_fd, .. } => *read_fd,
        }
    }

    /// Registers paths for watching. If `missing` is set, a nonexistent
    /// path is accepted and held pending until it appears.
    pub fn add(&mut self, paths: &[PathBuf], missing: bool) {
        for path in paths {
            let exists = path.exists();
            if !exists && !missing {
                warn!(path = %path.display(), "watched path does not exist and missing=false");
            }
            self.paths.entry(path.clone()).or_insert_with(|| WatchedPath {
                missing_ok: missing,
                pending: !exists,
                stat: StatSnapshot::capture(path),
                inotify_wd: None,
                kqueue_fd: None,
            });
        }
        self.dirty = true;
    }

    /// Stops watching the given paths.
    pub fn remove(&mut self, paths: &[PathBuf]) {
        for path in paths {
            if let Some(entry) = self.paths.remove(path) {
                self.teardown_os_watch(path, &entry);
            }
        }
        self.dirty = true;
    }

    fn teardown_os_watch(&self, _path: &Path, entry: &WatchedPath) {
        match &self.backend {
            #[cfg(target_os = "linux")]
            Backend::Inotify { fd } => {
                if let Some(wd) = entry.inotify_wd {
                    unsafe {
                        libc::inotify_rm_watch(*fd, wd);
                    }
                }
            }
            #[cfg(any(
                target_os = "macos",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Backend::Kqueue { .. } => {
                if let Some(watch_fd) = entry.kqueue_fd {
                    let _ = unistd::close(watch_fd);
                }
            }
            Backend::Polling { .. } => {}
        }
    }

    /// Reconciles the registered set with the OS primitives. A no-op if
    /// nothing changed since the last `commit()`.
    pub fn commit(&mut self) -> Result<(), WatchError> {
        if !self.dirty {
            return Ok(());
        }

        for (path, entry) in self.paths.iter_mut() {
            if entry.pending || entry.inotify_wd.is_some() || entry.kqueue_fd.is_some() {
                continue;
            }
            match &self.backend {
                #[cfg(target_os = "linux")]
                Backend::Inotify { fd } => {
                    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
                        .map_err(|_| {
                            WatchError::Io(std::io::Error::other("path contains NUL byte"))
                        })?;
                    let mask = libc::IN_ATTRIB
                        | libc::IN_MODIFY
                        | libc::IN_DELETE_SELF
                        | libc::IN_MOVE_SELF
                        | libc::IN_CLOSE_WRITE;
                    let wd = unsafe { libc::inotify_add_watch(*fd, c_path.as_ptr(), mask) };
                    if wd < 0 {
                        return Err(WatchError::Io(std::io::Error::last_os_error()));
                    }
                    entry.inotify_wd = Some(wd);
                }
                #[cfg(any(
                    target_os = "macos",
                    target_os = "freebsd",
                    target_os = "netbsd",
                    target_os = "openbsd"
                ))]
                Backend::Kqueue { fd } => {
                    let watch_fd = unsafe {
                        libc::open(
                            std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
                                .map_err(|_| {
                                    WatchError::Io(std::io::Error::other(
                                        "path contains NUL byte",
                                    ))
                                })?
                                .as_ptr(),
                            libc::O_RDONLY,
                        )
                    };
                    if watch_fd < 0 {
                        return Err(WatchError::Io(std::io::Error::last_os_error()));
                    }
                    let change = libc::kevent {
                        ident: watch_fd as usize,
                        filter: libc::EVFILT_VNODE,
                        flags: libc::EV_ADD | libc::EV_CLEAR,
                        fflags: libc::NOTE_DELETE
                            | libc::NOTE_WRITE
                            | libc::NOTE_RENAME
                            | libc::NOTE_ATTRIB
                            | libc::NOTE_REVOKE,
                        data: 0,
                        udata: std::ptr::null_mut(),
                    };
                    let rc = unsafe {
                        libc::kevent(
                            *fd,
                            &change,
                            1,
                            std::ptr::null_mut(),
                            0,
                            std::ptr::null(),
                        )
                    };
                    if rc < 0 {
                        let _ = unistd::close(watch_fd);
                        return Err(WatchError::Io(std::io::Error::last_os_error()));
                    }
                    entry.kqueue_fd = Some(watch_fd);
                }
                Backend::Polling { .. } => {}
            }
        }

        self.dirty = false;
        Ok(())
    }

    fn wake_polling(&self) {
        if let Backend::Polling { write_fd, .. } = &self.backend {
            let _ = unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(*write_fd) }, b"x");
        }
    }

    /// Periodic tick: promotes newly-appeared pending paths (synthesizing
    /// exactly one change event each) and, in polling mode, compares
    /// recorded stat state to detect modification.
    pub fn scan(&mut self) -> Result<(), WatchError> {
        let mut newly_changed = Vec::new();

        for (path, entry) in self.paths.iter_mut() {
            if entry.pending {
                if path.exists() {
                    entry.pending = false;
                    entry.stat = StatSnapshot::capture(path);
                    self.dirty = true;
                    newly_changed.push(path.clone());
                }
                continue;
            }

            if matches!(self.backend, Backend::Polling { .. }) {
                let current = StatSnapshot::capture(path);
                if current != entry.stat {
                    match (&current, entry.missing_ok) {
                        (None, true) => {
                            entry.pending = true;
                        }
                        (None, false) => {
                            return Err(WatchError::PathVanished(path.clone()));
                        }
                        (Some(_), _) => {
                            newly_changed.push(path.clone());
                        }
                    }
                    entry.stat = current;
                }
            }
        }

        if !newly_changed.is_empty() {
            for path in newly_changed {
                self.changed.insert(path);
            }
            self.wake_polling();
        }

        Ok(())
    }

    fn drain_inotify(&mut self) -> Result<(), WatchError> {
        #[cfg(target_os = "linux")]
        {
            let Backend::Inotify { fd } = &self.backend else {
                return Ok(());
            };
            let fd = *fd;
            let mut buf = [0u8; 4096];
            loop {
                let n = unsafe {
                    libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                if n < 0 {
                    let err = std::io::Error::last_os_error();
                    if err.kind() == std::io::ErrorKind::WouldBlock {
                        break;
                    }
                    return Err(WatchError::Io(err));
                }
                if n == 0 {
                    break;
                }
                let mut offset = 0usize;
                while offset + std::mem::size_of::<libc::inotify_event>() <= n as usize {
                    let event = unsafe {
                        &*(buf.as_ptr().add(offset) as *const libc::inotify_event)
                    };
                    let wd = event.wd;
                    let mask = event.mask;
                    offset += std::mem::size_of::<libc::inotify_event>() + event.len as usize;

                    let hit = self
                        .paths
                        .iter_mut()
                        .find(|(_, entry)| entry.inotify_wd == Some(wd));
                    let Some((path, entry)) = hit else { continue };

                    if mask & (libc::IN_DELETE_SELF | libc::IN_MOVE_SELF | libc::IN_IGNORED) != 0
                    {
                        entry.inotify_wd = None;
                        if entry.missing_ok {
                            entry.pending = true;
                            self.dirty = true;
                        } else {
                            let path = path.clone();
                            return Err(WatchError::PathVanished(path));
                        }
                    } else {
                        self.changed.insert(path.clone());
                    }
                }
                if n < buf.len() as isize {
                    break;
                }
            }
            Ok(())
        }
        #[cfg(not(target_os = "linux"))]
        Ok(())
    }

    fn drain_kqueue(&mut self) -> Result<(), WatchError> {
        #[cfg(any(
            target_os = "macos",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd"
        ))]
        {
            let Backend::Kqueue { fd } = &self.backend else {
                return Ok(());
            };
            let fd = *fd;
            let mut events = vec![unsafe { std::mem::zeroed::<libc::kevent>() }; 32];
            let ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
            loop {
                let rc = unsafe {
                    libc::kevent(
                        fd,
                        std::ptr::null(),
                        0,
                        events.as_mut_ptr(),
                        events.len() as libc::c_int,
                        &ts,
                    )
                };
                if rc < 0 {
                    return Err(WatchError::Io(std::io::Error::last_os_error()));
                }
                if rc == 0 {
                    break;
                }
                for ev in events.iter().take(rc as usize) {
                    let watch_fd = ev.ident as RawFd;
                    let hit = self
                        .paths
                        .iter_mut()
                        .find(|(_, entry)| entry.kqueue_fd == Some(watch_fd));
                    let Some((path, entry)) = hit else { continue };

                    if ev.fflags & (libc::NOTE_DELETE | libc::NOTE_REVOKE) != 0 {
                        entry.kqueue_fd = None;
                        let _ = unistd::close(watch_fd);
                        if entry.missing_ok {
                            entry.pending = true;
                            self.dirty = true;
                        } else {
                            let path = path.clone();
                            return Err(WatchError::PathVanished(path));
                        }
                    } else {
                        self.changed.insert(path.clone());
                    }
                }
            }
            Ok(())
        }
        #[cfg(not(any(
            target_os = "macos",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd"
        )))]
        Ok(())
    }

    fn drain_polling_pipe(&mut self) -> Result<(), WatchError> {
        let Backend::Polling { read_fd, .. } = &self.backend else {
            return Ok(());
        };
        let read_fd = *read_fd;
        let mut buf = [0u8; 64];
        loop {
            match unistd::read(read_fd, &mut buf) {
                Ok(0) => break,
                Ok(n) if n < buf.len() => break,
                Ok(_) => continue,
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(WatchError::Errno(e)),
            }
        }
        Ok(())
    }

    /// Drains pending change events, aggregating bursts: keeps re-reading
    /// until `timeout` passes with no new event, or `limit` distinct paths
    /// have been collected. Returns a sorted, deduplicated list.
    pub fn get(&mut self, timeout: Duration, limit: usize) -> Result<Vec<PathBuf>, WatchError> {
        let deadline = Instant::now() + timeout;
        loop {
            match &self.backend {
                #[cfg(target_os = "linux")]
                Backend::Inotify { .. } => self.drain_inotify()?,
                #[cfg(any(
                    target_os = "macos",
                    target_os = "freebsd",
                    target_os = "netbsd",
                    target_os = "openbsd"
                ))]
                Backend::Kqueue { .. } => self.drain_kqueue()?,
                Backend::Polling { .. } => self.drain_polling_pipe()?,
                #[allow(unreachable_patterns)]
                _ => {}
            }

            if self.changed.len() >= limit || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(5).min(timeout));
        }

        let mut out: Vec<PathBuf> = self.changed.drain().collect();
        out.sort();
        out.truncate(limit.max(1));
        debug!(count = out.len(), "file watcher reporting changes");
        Ok(out)
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        match &self.backend {
            #[cfg(target_os = "linux")]
            Backend::Inotify { fd } => {
                let _ = unistd::close(*fd);
            }
            #[cfg(any(
                target_os = "macos",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Backend::Kqueue { fd } => {
                let _ = unistd::close(*fd);
            }
            Backend::Polling { read_fd, write_fd } => {
                let _ = unistd::close(*read_fd);
                let _ = unistd::close(*write_fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn polling_backend_detects_modification() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("watched");
        fs::write(&path, "v1").unwrap();

        let mut watcher = FileWatcher::new_polling().unwrap();
        watcher.add(&[path.clone()], false);
        watcher.commit().unwrap();
        watcher.scan().unwrap();

        std::thread::sleep(Duration::from_millis(10));
        fs::write(&path, "v2 longer").unwrap();
        watcher.scan().unwrap();

        let changes = watcher.get(Duration::from_millis(50), 10).unwrap();
        assert_eq!(changes, vec![path]);
    }

    #[test]
    fn polling_backend_reports_change_exactly_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("watched");
        fs::write(&path, "v1").unwrap();

        let mut watcher = FileWatcher::new_polling().unwrap();
        watcher.add(&[path.clone()], false);
        watcher.commit().unwrap();
        watcher.scan().unwrap();

        fs::write(&path, "v2").unwrap();
        fs::write(&path, "v3").unwrap();
        watcher.scan().unwrap();

        let changes = watcher.get(Duration::from_millis(20), 10).unwrap();
        assert_eq!(changes, vec![path]);
    }

    #[test]
    fn missing_path_becomes_pending_then_fires_once_on_appearance() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("not-yet");

        let mut watcher = FileWatcher::new_polling().unwrap();
        watcher.add(&[path.clone()], true);
        watcher.commit().unwrap();
        watcher.scan().unwrap();
        assert!(watcher.get(Duration::from_millis(10), 10).unwrap().is_empty());

        fs::write(&path, "now exists").unwrap();
        watcher.scan().unwrap();
        let changes = watcher.get(Duration::from_millis(50), 10).unwrap();
        assert_eq!(changes, vec![path]);
    }

    #[test]
    fn vanished_path_without_missing_flag_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("watched");
        fs::write(&path, "v1").unwrap();

        let mut watcher = FileWatcher::new_polling().unwrap();
        watcher.add(&[path.clone()], false);
        watcher.commit().unwrap();
        watcher.scan().unwrap();

        fs::remove_file(&path).unwrap();
        let result = watcher.scan();
        assert!(matches!(result, Err(WatchError::PathVanished(p)) if p == path));
    }

    #[test]
    fn remove_then_commit_stops_tracking_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("watched");
        fs::write(&path, "v1").unwrap();

        let mut watcher = FileWatcher::new_polling().unwrap();
        watcher.add(&[path.clone()], false);
        watcher.commit().unwrap();
        watcher.remove(&[path.clone()]);
        watcher.commit().unwrap();

        fs::write(&path, "changed").unwrap();
        watcher.scan().unwrap();
        assert!(watcher.get(Duration::from_millis(10), 10).unwrap().is_empty());
    }
}
