//! File and module dependency watching.

/// Low-level path watcher (inotify / kqueue / polling fallback).
pub mod file_watcher;

/// Program-to-source-dependency-closure watcher built on `file_watcher`.
pub mod module_watcher;

pub use file_watcher::FileWatcher;
pub use module_watcher::ModuleWatcher;
