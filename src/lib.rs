//! A user-space process supervisor: per-task state machines, a single-
//! threaded event-driven main loop, and an HTTP control/status plane.

#![warn(unused_crate_dependencies)]
// These dependencies are only used in the binaries (src/bin/*.rs).
// Test dependencies are only used in test code.
#[cfg(test)]
use assert_cmd as _;
// OpenSSL is only needed for static linking on Linux.
#[cfg(target_os = "linux")]
use openssl_sys as _;
use strum as _;
#[cfg(test)]
use tempfile as _;
use tracing_subscriber as _;

/// CLI parsing.
pub mod cli;

/// Config loading.
pub mod config;

/// Errors.
pub mod error;

/// Single point for forking and execing a configured command.
pub mod exec;

/// HTTP control/status plane.
pub mod http;

/// The process-wide supervisor: tasks, scope, watchers, main loop.
pub mod legion;

/// Readiness-multiplexing backend (epoll/kqueue/poll/select).
pub mod poller;

/// The supervisor's own PID file.
pub mod pidfile;

/// Runtime paths and modes.
pub mod runtime;

/// Self-pipe signal handling.
pub mod signals;

/// Per-task state machine.
pub mod task;

/// Test utils.
#[doc(hidden)]
pub mod test_utils;

/// File and Python-module dependency watchers.
pub mod watch;
