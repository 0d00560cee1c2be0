//! A single point for spawning a task's child process.
use crate::error::SpawnError;
use nix::unistd::{ForkResult, Gid, Group, Pid, Uid, User};
use std::collections::HashMap;
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

const SUBSTITUTION_FUEL: usize = 8;

/// A context value: either a concrete string or the literal null, which is
/// preserved (not stringified) through substitution and dropped from the
/// environment rather than becoming `"null"` or `""`.
#[derive(Debug, Clone)]
pub enum ContextValue {
    String(String),
    Null,
}

impl ContextValue {
    fn as_str(&self) -> Option<&str> {
        match self {
            ContextValue::String(s) => Some(s),
            ContextValue::Null => None,
        }
    }
}

/// Everything `exec_process` needs to launch one child.
pub struct ExecRequest {
    pub argv: Vec<String>,
    pub context: HashMap<String, ContextValue>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub cwd: Option<PathBuf>,
    pub procname: Option<String>,
    /// File descriptors to dup2 onto stdout/stderr; `None` redirects to
    /// `/dev/null` instead.
    pub log_fds: (Option<RawFd>, Option<RawFd>),
}

fn resolve_uid(spec: &str) -> Result<Uid, SpawnError> {
    if let Ok(raw) = spec.parse::<libc::uid_t>() {
        return Ok(Uid::from_raw(raw));
    }
    User::from_name(spec)
        .map_err(|_| SpawnError::UnknownUser(spec.to_string()))?
        .map(|u| u.uid)
        .ok_or_else(|| SpawnError::UnknownUser(spec.to_string()))
}

fn resolve_gid(spec: &str) -> Result<Gid, SpawnError> {
    if let Ok(raw) = spec.parse::<libc::gid_t>() {
        return Ok(Gid::from_raw(raw));
    }
    Group::from_name(spec)
        .map_err(|_| SpawnError::UnknownGroup(spec.to_string()))?
        .map(|g| g.gid)
        .ok_or_else(|| SpawnError::UnknownGroup(spec.to_string()))
}

/// Substitutes `{name}` placeholders from `context` into `template`,
/// iterating until a pass makes no change (or the fuel runs out).
fn substitute(template: &str, context: &HashMap<String, ContextValue>) -> String {
    let mut current = template.to_string();
    for _ in 0..SUBSTITUTION_FUEL {
        let mut next = String::with_capacity(current.len());
        let mut changed = false;
        let mut rest = current.as_str();
        while let Some(start) = rest.find('{') {
            let Some(end) = rest[start..].find('}') else {
                next.push_str(rest);
                rest = "";
                break;
            };
            let end = start + end;
            let key = &rest[start + 1..end];
            next.push_str(&rest[..start]);
            match context.get(key).and_then(ContextValue::as_str) {
                Some(value) => {
                    next.push_str(value);
                    changed = true;
                }
                None => next.push_str(&rest[start..=end]),
            }
            rest = &rest[end + 1..];
        }
        next.push_str(rest);
        if !changed || next == current {
            return next;
        }
        current = next;
    }
    current
}

fn stringified_env(context: &HashMap<String, ContextValue>) -> HashMap<String, String> {
    context
        .iter()
        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
        .collect()
}

fn open_null(flags: libc::c_int) -> RawFd {
    let path = c"/dev/null";
    unsafe { libc::open(path.as_ptr(), flags) }
}

/// Spawns the child described by `req`, returning its PID in the parent.
///
/// # Safety contract
/// This forks. The child path never returns: it either `execvpe`s
/// successfully or calls `_exit` with a distinct code per failure site, to
/// avoid running any of the parent's destructors twice.
pub fn exec_process(req: &ExecRequest) -> Result<Pid, SpawnError> {
    let uid = req.user.as_deref().map(resolve_uid).transpose()?;
    let gid = req
        .group
        .as_deref()
        .map(resolve_gid)
        .transpose()?
        .or_else(|| {
            uid.and_then(|uid| User::from_uid(uid).ok().flatten().map(|u| u.gid))
        });

    if let Some(cwd) = &req.cwd
        && !cwd.is_dir()
    {
        return Err(SpawnError::MissingCwd(cwd.clone()));
    }

    if req.argv.is_empty() {
        return Err(SpawnError::MissingStartCommand(
            req.procname.clone().unwrap_or_default(),
        ));
    }

    // uid/gid are resolved before the fork, so they're placeholder-visible
    // to argv/env formatting the same way the child's own pid is once known.
    let mut context = req.context.clone();
    if let Some(uid) = uid {
        context.insert("Task_uid".into(), ContextValue::String(uid.as_raw().to_string()));
    }
    if let Some(gid) = gid {
        context.insert("Task_gid".into(), ContextValue::String(gid.as_raw().to_string()));
    }

    let argv = req.argv.clone();
    let procname = req.procname.clone();
    let cwd = req.cwd.clone();
    let log_fds = req.log_fds;

    match unsafe { nix::unistd::fork() }.map_err(SpawnError::Fork)? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            child_exec(&argv, &procname, context, &cwd, gid, uid, log_fds);
            unreachable!("child_exec never returns");
        }
    }
}

/// Exit codes used by the child on distinct failure sites, so the parent's
/// waitpid status can distinguish "setup failed before exec" from "the
/// program itself exited non-zero".
mod exit_code {
    pub const SETGID: i32 = 101;
    pub const SETUID: i32 = 102;
    pub const CHDIR: i32 = 103;
    pub const REDIRECT: i32 = 104;
    pub const EXEC: i32 = 105;
}

fn child_exec(
    argv: &[String],
    procname: &Option<String>,
    mut context: HashMap<String, ContextValue>,
    cwd: &Option<PathBuf>,
    gid: Option<Gid>,
    uid: Option<Uid>,
    log_fds: (Option<RawFd>, Option<RawFd>),
) -> ! {
    if let Some(gid) = gid
        && unsafe { libc::setgid(gid.as_raw()) } != 0
    {
        error!(gid = gid.as_raw(), "setgid failed in child");
        unsafe { libc::_exit(exit_code::SETGID) };
    }
    if let Some(uid) = uid
        && unsafe { libc::setuid(uid.as_raw()) } != 0
    {
        error!(uid = uid.as_raw(), "setuid failed in child");
        unsafe { libc::_exit(exit_code::SETUID) };
    }

    if let Some(cwd) = cwd
        && unsafe {
            libc::chdir(
                CString::new(cwd.as_os_str().as_encoded_bytes())
                    .unwrap_or_default()
                    .as_ptr(),
            )
        } != 0
    {
        error!(cwd = %cwd.display(), "chdir failed in child");
        unsafe { libc::_exit(exit_code::CHDIR) };
    }

    // The pid is only known now; argv/procname/env formatting happens here,
    // after uid/gid/cwd are settled, so `{Task_pid}` placeholders resolve.
    context.insert(
        "Task_pid".into(),
        ContextValue::String(std::process::id().to_string()),
    );

    let argv: Vec<String> = argv.iter().map(|arg| substitute(arg, &context)).collect();
    let Some(program) = argv.first().cloned() else {
        error!("start command became empty after substitution");
        unsafe { libc::_exit(exit_code::EXEC) };
    };
    let procname = procname.as_deref().map(|p| substitute(p, &context));
    let env = stringified_env(&context);

    close_all_except(&[0, 1, 2, log_fds.0.unwrap_or(-1), log_fds.1.unwrap_or(-1)]);

    if !redirect_fds(log_fds) {
        unsafe { libc::_exit(exit_code::REDIRECT) };
    }

    let c_argv: Vec<CString> = std::iter::once(procname.unwrap_or_else(|| program.clone()))
        .chain(argv.iter().skip(1).cloned())
        .map(|s| CString::new(s).unwrap_or_default())
        .collect();
    let mut argv_ptrs: Vec<*const libc::c_char> =
        c_argv.iter().map(|s| s.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    let c_env: Vec<CString> = env
        .iter()
        .map(|(k, v)| CString::new(format!("{k}={}", substitute(v, &context))).unwrap_or_default())
        .collect();
    let mut env_ptrs: Vec<*const libc::c_char> = c_env.iter().map(|s| s.as_ptr()).collect();
    env_ptrs.push(std::ptr::null());

    let c_program = CString::new(program.as_str()).unwrap_or_default();
    unsafe {
        libc::execvpe(
            c_program.as_ptr(),
            argv_ptrs.as_ptr(),
            env_ptrs.as_ptr(),
        );
    }
    error!(program, "execvpe failed in child");
    unsafe { libc::_exit(exit_code::EXEC) };
}

fn close_all_except(keep: &[RawFd]) {
    let max_fd = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let max_fd = if max_fd < 0 { 1024 } else { max_fd as RawFd };
    for fd in 3..max_fd {
        if !keep.contains(&fd) {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

fn redirect_fds(log_fds: (Option<RawFd>, Option<RawFd>)) -> bool {
    let null_r = open_null(libc::O_RDONLY);
    if null_r < 0 || unsafe { libc::dup2(null_r, 0) } < 0 {
        return false;
    }
    unsafe { libc::close(null_r) };

    for (target, provided) in [(1, log_fds.0), (2, log_fds.1)] {
        let source = match provided {
            Some(fd) => fd,
            None => {
                let fd = open_null(libc::O_WRONLY);
                if fd < 0 {
                    return false;
                }
                fd
            }
        };
        if unsafe { libc::dup2(source, target) } < 0 {
            return false;
        }
        if provided.is_none() {
            unsafe { libc::close(source) };
        }
    }
    true
}

/// Renders a raw `waitpid` status in human form: `"exited ok"` for a clean
/// exit, `"exited <n>"` for nonzero, `"died on <SIGNAME>"` (plus core-dump
/// suffix) for a signal death, and a hex fallback for anything else.
pub fn format_exit_status(status: i32) -> String {
    use nix::sys::wait::WaitStatus;
    match nix::sys::wait::WaitStatus::from_raw(Pid::from_raw(0), status) {
        Ok(WaitStatus::Exited(_, 0)) => "exited ok".to_string(),
        Ok(WaitStatus::Exited(_, code)) => format!("exited {code}"),
        Ok(WaitStatus::Signaled(_, sig, core)) => {
            if core {
                format!("died on {sig} (core dumped)")
            } else {
                format!("died on {sig}")
            }
        }
        _ => {
            warn!(status, "unrecognised wait status");
            format!("unknown exit code {status:#x}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pairs: &[(&str, &str)]) -> HashMap<String, ContextValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), ContextValue::String(v.to_string())))
            .collect()
    }

    #[test]
    fn substitute_replaces_known_placeholders() {
        let context = ctx(&[("name", "worker"), ("id", "7")]);
        assert_eq!(substitute("{name}-{id}", &context), "worker-7");
    }

    #[test]
    fn substitute_leaves_unknown_placeholders_untouched() {
        let context = ctx(&[("name", "worker")]);
        assert_eq!(substitute("{name}-{missing}", &context), "worker-{missing}");
    }

    #[test]
    fn substitute_preserves_null_values() {
        let mut context = ctx(&[("name", "worker")]);
        context.insert("tag".to_string(), ContextValue::Null);
        assert_eq!(substitute("{name}:{tag}", &context), "worker:{tag}");
    }

    #[test]
    fn substitute_handles_nested_chained_placeholders() {
        let context = ctx(&[("a", "{b}"), ("b", "final")]);
        assert_eq!(substitute("{a}", &context), "final");
    }

    #[test]
    fn resolve_uid_accepts_numeric_spec() {
        assert_eq!(resolve_uid("0").unwrap(), Uid::from_raw(0));
    }

    #[test]
    fn resolve_uid_rejects_unknown_name() {
        let err = resolve_uid("definitely-not-a-real-user-xyz").unwrap_err();
        assert!(matches!(err, SpawnError::UnknownUser(_)));
    }

    #[test]
    fn stringified_env_drops_null_entries() {
        let mut context = ctx(&[("name", "worker")]);
        context.insert("missing".to_string(), ContextValue::Null);
        let env = stringified_env(&context);
        assert_eq!(env.get("name"), Some(&"worker".to_string()));
        assert!(!env.contains_key("missing"));
    }

    #[test]
    fn format_exit_status_reports_clean_exit() {
        let status = libc::W_EXITCODE(0, 0);
        assert_eq!(format_exit_status(status), "exited ok");
    }

    #[test]
    fn exec_process_exposes_builtin_placeholders_to_child() {
        let dir = std::env::temp_dir();
        let out_path = dir.join(format!("taskforce-exec-test-{}", std::process::id()));
        let _ = std::fs::remove_file(&out_path);

        // Task_ppid is normally seeded by the caller (Legion); set it here to
        // confirm exec_process/child_exec leave caller-supplied context
        // entries alone while adding their own (pid, uid).
        let context = ctx(&[("Task_ppid", "4242")]);

        let req = ExecRequest {
            argv: vec![
                "/bin/sh".into(),
                "-c".into(),
                format!(
                    "printf '%s %s %s' \"$Task_pid\" \"$Task_uid\" \"$Task_ppid\" > {}",
                    out_path.display()
                ),
            ],
            context,
            user: None,
            group: None,
            cwd: None,
            procname: None,
            log_fds: (None, None),
        };
        let pid = exec_process(&req).expect("spawn");
        let status = nix::sys::wait::waitpid(pid, None).expect("wait");
        assert!(matches!(status, nix::sys::wait::WaitStatus::Exited(_, 0)));

        let written = std::fs::read_to_string(&out_path).expect("child wrote output");
        let _ = std::fs::remove_file(&out_path);
        let parts: Vec<&str> = written.split(' ').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], pid.as_raw().to_string(), "Task_pid should be the child's own pid");
        assert_eq!(parts[1], unsafe { libc::getuid() }.to_string());
        assert_eq!(parts[2], "4242", "caller-supplied context entries pass through unchanged");
    }

    #[test]
    fn exec_process_carries_parent_environment() {
        // SAFETY: test-only, serialized by cargo's single-threaded test env mutation isn't
        // guaranteed, but this key is unlikely to collide with anything else under test.
        unsafe { std::env::set_var("TASKFORCE_EXEC_TEST_ENV", "present") };
        let dir = std::env::temp_dir();
        let out_path = dir.join(format!("taskforce-exec-env-test-{}", std::process::id()));
        let _ = std::fs::remove_file(&out_path);

        let mut context = ctx(&[]);
        for (k, v) in std::env::vars() {
            context.insert(k, ContextValue::String(v));
        }
        let req = ExecRequest {
            argv: vec![
                "/bin/sh".into(),
                "-c".into(),
                format!("printf '%s' \"$TASKFORCE_EXEC_TEST_ENV\" > {}", out_path.display()),
            ],
            context,
            user: None,
            group: None,
            cwd: None,
            procname: None,
            log_fds: (None, None),
        };
        let pid = exec_process(&req).expect("spawn");
        nix::sys::wait::waitpid(pid, None).expect("wait");
        let written = std::fs::read_to_string(&out_path).expect("child wrote output");
        let _ = std::fs::remove_file(&out_path);
        unsafe { std::env::remove_var("TASKFORCE_EXEC_TEST_ENV") };
        assert_eq!(written, "present");
    }

    #[test]
    fn format_exit_status_reports_nonzero_exit() {
        let status = libc::W_EXITCODE(exit_code::SETUID, 0);
        assert_eq!(format_exit_status(status), format!("exited {}", exit_code::SETUID));
    }
}
