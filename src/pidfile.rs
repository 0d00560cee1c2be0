//! The supervisor's own PID file: a single advisory-locked file recording
//! this process's pid, so a second invocation against the same runtime
//! directory can detect it and refuse to start.
use crate::error::PidFileError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Holds the open, locked file for the lifetime of the process. Dropping
/// it releases the lock and leaves the (now stale) file behind.
pub struct PidFile {
    path: PathBuf,
    file: File,
}

impl PidFile {
    /// Opens (creating if absent) and locks `path`, failing if another
    /// live process already holds the lock.
    pub fn acquire(path: &Path) -> Result<Self, PidFileError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;

        if let Err(_err) = file.try_lock_exclusive() {
            let mut existing = String::new();
            let mut reader = File::open(path)?;
            reader.read_to_string(&mut existing)?;
            let pid: i32 = existing
                .trim()
                .parse()
                .map_err(|_| PidFileError::Parse(existing.clone()))?;
            return Err(PidFileError::AlreadyRunning(pid));
        }

        let mut pidfile = PidFile {
            path: path.to_path_buf(),
            file,
        };
        pidfile.write_own_pid()?;
        Ok(pidfile)
    }

    fn write_own_pid(&mut self) -> Result<(), PidFileError> {
        let pid = std::process::id();
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        write!(self.file, "{pid}")?;
        self.file.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_writes_current_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("taskforce.pid");
        let pidfile = PidFile::acquire(&path).unwrap();
        let contents = std::fs::read_to_string(pidfile.path()).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    #[test]
    fn second_acquire_on_same_path_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("taskforce.pid");
        let _first = PidFile::acquire(&path).unwrap();
        let second = PidFile::acquire(&path);
        assert!(matches!(second, Err(PidFileError::AlreadyRunning(_))));
    }

    #[test]
    fn dropping_removes_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("taskforce.pid");
        {
            let _pidfile = PidFile::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
