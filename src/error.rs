//! Error taxonomy for taskforce.
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating the config/roles documents.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading a configuration or roles file from disk.
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    /// Error parsing the YAML configuration document.
    #[error("invalid config document: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The document has no `tasks` mapping.
    #[error("config document has no tasks")]
    MissingTasks,

    /// A task names a `requires` entry that is not defined.
    #[error("task '{task}' requires unknown task '{requires}'")]
    UnknownDependency {
        /// The task declaring the dependency.
        task: String,
        /// The missing dependency name.
        requires: String,
    },

    /// The requires graph contains a cycle.
    #[error("dependency cycle among tasks: {}", .remaining.join(", "))]
    DependencyCycle {
        /// Tasks that could not be scheduled because of the cycle.
        remaining: Vec<String>,
    },

    /// An `onexit.start` action targets a task that is not itself `once`.
    #[error("task '{task}' onexit.start targets '{target}', which is not a once task")]
    OnExitTargetNotOnce {
        /// The task declaring the onexit action.
        task: String,
        /// The target task name.
        target: String,
    },
}

/// Errors from the readiness-multiplexing backend.
#[derive(Debug, Error)]
pub enum PollError {
    /// No poll backend is available on this platform.
    #[error("no poll backend available")]
    NoBackend,

    /// The poll backend was already selected and cannot register a new mode.
    #[error("poll backend is frozen after first registration")]
    BackendFrozen,

    /// An underlying OS call failed.
    #[error("poll backend error: {0}")]
    Errno(#[from] nix::errno::Errno),

    /// Low-level I/O failure building or tearing down the backend.
    #[error("poll backend io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the file/module watcher subsystems.
#[derive(Debug, Error)]
pub enum WatchError {
    /// Underlying I/O failure registering or reading a watch.
    #[error("watch io error: {0}")]
    Io(#[from] std::io::Error),

    /// A path that was not registered with `missing=true` disappeared.
    #[error("watched path vanished: {0}")]
    PathVanished(PathBuf),

    /// The OS notification primitive failed to initialise.
    #[error("failed to initialise watch backend: {0}")]
    Errno(#[from] nix::errno::Errno),
}

/// Errors from `exec_process`, one variant per failure site in the contract.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// `user` named a nonexistent account.
    #[error("unknown user '{0}'")]
    UnknownUser(String),

    /// `group` named a nonexistent group.
    #[error("unknown group '{0}'")]
    UnknownGroup(String),

    /// `cwd` does not exist.
    #[error("working directory does not exist: {}", .0.display())]
    MissingCwd(PathBuf),

    /// The task has no `commands.start` entry.
    #[error("task '{0}' has no start command")]
    MissingStartCommand(String),

    /// `fork()` failed.
    #[error("fork failed: {0}")]
    Fork(nix::errno::Errno),

    /// Underlying OS error resolving uid/gid.
    #[error("privilege resolution failed: {0}")]
    Nix(#[from] nix::errno::Errno),
}

/// Errors surfaced by the HTTP control/status plane.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Underlying socket I/O failure.
    #[error("http io error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS setup failed (bad cert/key file, handshake failure).
    #[error("tls error: {0}")]
    Tls(String),

    /// The request could not be parsed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The listener address is neither a valid `[host][:port]` nor an
    /// absolute Unix-domain socket path.
    #[error("invalid listen address: {0}")]
    InvalidAddress(String),
}

/// Top-level error type for the legion main loop and its setup phase.
#[derive(Debug, Error)]
pub enum LegionError {
    /// Config or roles file failed to load or validate.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The poll backend could not be constructed.
    #[error(transparent)]
    Poll(#[from] PollError),

    /// A watch subsystem failed during setup.
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// An HTTP listener failed to bind at startup.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// A signal handler could not be installed.
    #[error("signal setup failed: {0}")]
    Signal(nix::errno::Errno),

    /// A mutex guarding shared state was poisoned by a panicking thread.
    #[error("internal lock poisoned: {0}")]
    Poisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for LegionError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        LegionError::Poisoned(err.to_string())
    }
}

/// Error type for the supervisor's own PID file.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// Error reading or writing the PID file.
    #[error("pid file io error: {0}")]
    Io(#[from] std::io::Error),

    /// The PID file could not be parsed.
    #[error("pid file is corrupt: {0}")]
    Parse(String),

    /// Another instance already holds the lock on this PID file.
    #[error("another instance is already running (pid {0})")]
    AlreadyRunning(i32),
}
