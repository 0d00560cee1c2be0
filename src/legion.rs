//! The process-wide supervisor: owns tasks, the roles filter, the config
//! document, the poller, the watchers, the HTTP services, and the main loop.
use crate::config::{self, ControlMode, EventHandler, EventKind, RolesSet, TaskConfig};
use crate::error::LegionError;
use crate::exec::{exec_process, ContextValue};
use crate::poller::{EventMask, Poller};
use crate::signals::{SignalEvent, SignalHub};
use crate::task::{ManageContext, Task};
use crate::watch::{FileWatcher, ModuleWatcher};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

const SHORT_TIMEOUT: Duration = Duration::from_millis(250);
const LONG_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_STARVATION: Duration = Duration::from_secs(15);
const SIGTERM_LIMIT: Duration = Duration::from_secs(10);

/// What a registered descriptor means to the main loop when it becomes
/// ready.
#[derive(Debug, Clone)]
enum PollToken {
    Signals,
    FileWatch,
    ModuleWatch,
}

/// A deferred action recorded in `CommandKind::Command`/`Signal` handlers.
/// Registration key is a value, not a pointer, per the ownership design:
/// Legion owns everything and handlers carry names.
#[derive(Debug, Clone)]
enum EventTarget {
    /// Run a task's named one-shot command; log its exit.
    Command { task: String, name: String },
    /// Send a signal to every live pid of a task.
    Signal { task: String, signal: Signal },
}

/// State mutated by HTTP worker threads; applied by the main loop on its
/// next idle pass. This is the sole concurrency boundary in the design.
#[derive(Debug, Default)]
pub struct SharedState {
    pub reload_requested: bool,
    pub exiting_requested: bool,
    pub reset_requested: bool,
    pub control_requests: HashMap<String, ControlMode>,
    pub count_requests: HashMap<String, u32>,
}

pub type Shared = Arc<Mutex<SharedState>>;

/// A live process within a task, as reported by `/status/tasks`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessStatus {
    pub pid: i32,
    pub started: Option<u64>,
    pub exit_code: Option<i32>,
}

/// One task's point-in-time status.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskStatus {
    pub name: String,
    pub control: ControlMode,
    pub count: u32,
    pub processes: Vec<ProcessStatus>,
}

/// A consistent, read-only snapshot the HTTP worker threads consult. The
/// main loop refreshes this once per idle pass; workers never touch task
/// or pid-map state directly.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StatusSnapshot {
    pub tasks: Vec<TaskStatus>,
}

pub type Status = Arc<Mutex<StatusSnapshot>>;

/// Read-only handle to the currently active configuration document, for
/// the `/status/config` endpoint. Refreshed alongside `Status`.
pub type ConfigHandle = Arc<Mutex<config::Config>>;

/// The top-level supervisor instance.
pub struct Legion {
    config_path: PathBuf,
    roles_path: Option<PathBuf>,
    config: config::Config,
    roles: RolesSet,
    tasks: HashMap<String, Task>,
    order: Vec<String>,
    poller: Poller<PollToken>,
    signals: SignalHub,
    file_watcher: FileWatcher,
    module_watcher: ModuleWatcher,
    file_targets: HashMap<PathBuf, Vec<EventTarget>>,
    pid_targets: HashMap<Pid, String>,
    shared: Shared,
    status: Status,
    config_handle: ConfigHandle,
    exiting: bool,
    exiting_since: Option<SystemTime>,
    reset_in_progress: bool,
    expires: Option<SystemTime>,
    host: String,
    fqdn: String,
    next_timeout: Duration,
    last_idle_pass: SystemTime,
}

impl Legion {
    /// Loads config and roles, installs signal handlers, builds the scoped
    /// task set, and registers watchers with the poller.
    pub fn bootstrap(
        config_path: PathBuf,
        roles_path: Option<PathBuf>,
        expires: Option<Duration>,
    ) -> Result<Self, LegionError> {
        let config = config::load_config(&config_path)?;
        warn_invalid_onexit_targets(&config);
        let roles = match &roles_path {
            Some(path) => RolesSet::load(path)?,
            None => RolesSet::Disabled,
        };

        let signals = SignalHub::new()?;
        let mut poller: Poller<PollToken> = Poller::new().map_err(LegionError::from)?;
        poller
            .register(PollToken::Signals, signals.read_fd(), EventMask::IN)
            .map_err(LegionError::from)?;

        let mut file_watcher = FileWatcher::new().map_err(LegionError::from)?;
        let module_search_path = vec![config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))];
        let mut module_watcher =
            ModuleWatcher::new(module_search_path).map_err(LegionError::from)?;

        let host = hostname();
        let fqdn = host.clone();

        let config_handle = Arc::new(Mutex::new(config.clone()));

        let mut legion = Legion {
            config_path,
            roles_path,
            config,
            roles,
            tasks: HashMap::new(),
            order: Vec::new(),
            poller,
            signals,
            file_watcher,
            module_watcher,
            file_targets: HashMap::new(),
            pid_targets: HashMap::new(),
            shared: Arc::new(Mutex::new(SharedState::default())),
            status: Arc::new(Mutex::new(StatusSnapshot::default())),
            config_handle,
            exiting: false,
            exiting_since: None,
            reset_in_progress: false,
            expires: expires.map(|d| SystemTime::now() + d),
            host,
            fqdn,
            next_timeout: SHORT_TIMEOUT,
            last_idle_pass: SystemTime::now(),
        };

        legion.rebuild_scope()?;
        legion
            .poller
            .register(PollToken::FileWatch, legion.file_watcher.fd(), EventMask::IN)
            .map_err(LegionError::from)?;
        legion
            .poller
            .register(
                PollToken::ModuleWatch,
                legion.module_watcher.fd(),
                EventMask::IN,
            )
            .map_err(LegionError::from)?;

        Ok(legion)
    }

    /// A clone-able handle HTTP services use to schedule deferred actions.
    pub fn shared(&self) -> Shared {
        Arc::clone(&self.shared)
    }

    /// A clone-able handle HTTP services use to read point-in-time status.
    pub fn status(&self) -> Status {
        Arc::clone(&self.status)
    }

    fn status_snapshot(&self) -> StatusSnapshot {
        let tasks = self
            .order
            .iter()
            .filter_map(|name| {
                let task = self.tasks.get(name)?;
                let processes = task
                    .proc_state
                    .iter()
                    .filter_map(|slot| {
                        let pid = slot.pid?;
                        Some(ProcessStatus {
                            pid: pid.as_raw(),
                            started: slot
                                .started
                                .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                                .map(|d| d.as_secs()),
                            exit_code: slot.exit_code,
                        })
                    })
                    .collect();
                Some(TaskStatus {
                    name: name.clone(),
                    control: task.config_running.control,
                    count: task.config_running.count.unwrap_or(1),
                    processes,
                })
            })
            .collect();
        StatusSnapshot { tasks }
    }

    /// A clone-able handle HTTP services use to read the active config
    /// document for `/status/config`.
    pub fn config_handle(&self) -> ConfigHandle {
        Arc::clone(&self.config_handle)
    }

    /// The HTTP listeners declared in `settings.http` of the loaded config.
    pub fn config_listeners(&self) -> Vec<config::HttpListenerConfig> {
        self.config.settings.http.clone()
    }

    /// Builds one task's formatting context: the supervisor's own process
    /// environment, overridden by document-level `defines`/`role_defines`,
    /// then by the task's own `defines`/`role_defines`, then filled in by the
    /// task's `defaults`/`role_defaults` and finally the document's
    /// `defaults`/`role_defaults`. This mirrors the original's layering,
    /// where defines always win over environment and later layers win over
    /// earlier ones, while defaults only ever fill an absent key.
    fn context_for(&self, task_cfg: &TaskConfig) -> HashMap<String, ContextValue> {
        let mut ctx: HashMap<String, ContextValue> = std::env::vars()
            .map(|(k, v)| (k, ContextValue::String(v)))
            .collect();

        ctx.insert(
            "Task_ppid".into(),
            ContextValue::String(std::process::id().to_string()),
        );

        apply_defines(&mut ctx, &self.config.defines, &self.config.role_defines, &self.roles);
        apply_defines(&mut ctx, &task_cfg.defines, &task_cfg.role_defines, &self.roles);

        apply_defaults(&mut ctx, &task_cfg.defaults, &task_cfg.role_defaults, &self.roles);
        apply_defaults(&mut ctx, &self.config.defaults, &self.config.role_defaults, &self.roles);

        ctx
    }

    /// Recomputes the roles-filtered, dependency-ordered scope and
    /// (re)registers file/module watch targets for every in-scope task's
    /// events.
    fn rebuild_scope(&mut self) -> Result<(), LegionError> {
        let order = self.config.task_start_order()?;
        self.order = order
            .into_iter()
            .filter(|name| {
                let cfg = &self.config.tasks[name];
                cfg.control.is_run_control() && self.roles.in_scope(cfg.roles.as_deref())
            })
            .collect();

        for name in &self.order {
            if self.tasks.contains_key(name) {
                continue;
            }
            let cfg = self.config.tasks[name].clone();
            let context = self.context_for(&cfg);
            self.tasks.insert(name.clone(), Task::new(name.clone(), cfg, context));
        }

        // Tasks dropped from scope (config removed, or rolled out of roles)
        // are marked do-not-resuscitate; they drain and are reaped by the
        // idle pass once stopped.
        let in_scope: std::collections::HashSet<&String> = self.order.iter().collect();
        for (name, task) in self.tasks.iter_mut() {
            if !in_scope.contains(name) {
                task.dnr = true;
            }
        }

        self.register_watch_targets();
        Ok(())
    }

    fn register_watch_targets(&mut self) {
        self.file_targets.clear();
        for name in self.order.clone() {
            let Some(task) = self.tasks.get_mut(&name) else {
                continue;
            };
            let Some(command_path) = task.config_running.start_command().and_then(|c| c.first())
            else {
                continue;
            };
            let command_path = PathBuf::from(command_path);

            for event in task.config_running.events.clone() {
                match event.kind {
                    EventKind::SelfChange => {
                        self.file_watcher.add(&[command_path.clone()], true);
                        self.bind_event(&command_path, &name, &event.handler);
                    }
                    EventKind::Python => {
                        self.module_watcher.add(&name, command_path.clone());
                    }
                    EventKind::FileChange => {
                        let paths: Vec<PathBuf> =
                            event.paths.iter().map(PathBuf::from).collect();
                        self.file_watcher.add(&paths, true);
                        for path in &paths {
                            self.bind_event(path, &name, &event.handler);
                        }
                    }
                    EventKind::Stop | EventKind::Restart => {
                        // Consulted directly by the stop path, not via watchers.
                    }
                }
            }
        }
        let _ = self.file_watcher.commit();
        let _ = self.module_watcher.commit();
    }

    fn bind_event(&mut self, path: &Path, task: &str, handler: &EventHandler) {
        let target = match handler {
            EventHandler::Command(name) => EventTarget::Command {
                task: task.to_string(),
                name: name.clone(),
            },
            EventHandler::Signal(name) => {
                let Some(sig) = crate::signals::parse_signal_name(name) else {
                    warn!(task, signal = name, "unknown signal name in event binding");
                    return;
                };
                EventTarget::Signal {
                    task: task.to_string(),
                    signal: sig,
                }
            }
        };
        self.file_targets.entry(path.to_path_buf()).or_default().push(target);
    }

    fn fire(&mut self, target: &EventTarget) {
        match target {
            EventTarget::Signal { task, signal } => {
                let Some(task) = self.tasks.get(task) else { return };
                for pid in task.live_pids() {
                    if let Err(err) = signal::kill(pid, *signal) {
                        warn!(%err, "failed to relay signal to task process");
                    }
                }
            }
            EventTarget::Command { task, name } => {
                let host = self.host.clone();
                let fqdn = self.fqdn.clone();
                let Some(task_obj) = self.tasks.get_mut(task) else { return };
                let Some(req) = task_obj.command_exec_request(name, &host, &fqdn) else {
                    warn!(task, command = name, "event command not found");
                    return;
                };
                match exec_process(&req) {
                    Ok(pid) => {
                        info!(task, command = name, pid = pid.as_raw(), "ran event command");
                    }
                    Err(err) => warn!(task, command = name, %err, "event command failed to start"),
                }
            }
        }
    }

    fn apply_shared_state(&mut self) {
        let (reload, exiting, reset, control_requests, count_requests) = {
            let mut shared = match self.shared.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            (
                std::mem::take(&mut shared.reload_requested),
                std::mem::take(&mut shared.exiting_requested),
                std::mem::take(&mut shared.reset_requested),
                std::mem::take(&mut shared.control_requests),
                std::mem::take(&mut shared.count_requests),
            )
        };

        for (name, mode) in control_requests {
            if let Some(task) = self.tasks.get_mut(&name) {
                task.set_control(mode);
            }
        }
        for (name, count) in count_requests {
            if let Some(task) = self.tasks.get_mut(&name) {
                task.set_count(count);
            }
        }
        if reset {
            self.reset_in_progress = true;
        }
        if reload || reset {
            self.reload();
        }
        if exiting || reset {
            self.begin_exit();
        }
    }

    fn reload(&mut self) {
        match config::load_config(&self.config_path) {
            Ok(config) => {
                warn_invalid_onexit_targets(&config);
                self.config = config;
                if let Some(path) = &self.roles_path.clone() {
                    match RolesSet::load(path) {
                        Ok(roles) => self.roles = roles,
                        Err(err) => warn!(%err, "failed to reload roles file; keeping previous"),
                    }
                }
                for (name, task) in self.tasks.iter_mut() {
                    if let Some(cfg) = self.config.tasks.get(name) {
                        task.config_pending = cfg.clone();
                    }
                }
                if let Err(err) = self.rebuild_scope() {
                    warn!(%err, "config reload produced an invalid schedule; keeping prior scope");
                }
            }
            Err(err) => warn!(%err, "config reload failed; previous config remains active"),
        }
    }

    fn begin_exit(&mut self) {
        if !self.exiting {
            self.exiting = true;
            self.exiting_since = Some(SystemTime::now());
            for task in self.tasks.values_mut() {
                task.set_control(ControlMode::Off);
            }
        }
    }

    /// Runs the main loop until a clean exit is reached.
    pub fn run(&mut self) -> Result<(), LegionError> {
        loop {
            if self.exiting {
                let all_stopped = self.tasks.values().all(|t| t.is_fully_stopped());
                let over_limit = self
                    .exiting_since
                    .map(|since| SystemTime::now().duration_since(since).unwrap_or_default() > SIGTERM_LIMIT)
                    .unwrap_or(false);
                if all_stopped || over_limit {
                    break;
                }
            }

            if let Some(expires) = self.expires
                && SystemTime::now() >= expires
            {
                self.begin_exit();
            }

            let events = self.poller.poll(self.next_timeout).map_err(LegionError::from)?;
            self.next_timeout = LONG_TIMEOUT;

            let starving = SystemTime::now()
                .duration_since(self.last_idle_pass)
                .map(|d| d > IDLE_STARVATION)
                .unwrap_or(false);

            if events.is_empty() && !starving {
                continue;
            }

            for (token, _mask) in events {
                match token {
                    PollToken::Signals => self.handle_signals()?,
                    PollToken::FileWatch => self.handle_file_changes(),
                    PollToken::ModuleWatch => self.handle_module_changes(),
                }
            }

            self.idle_pass();
        }
        Ok(())
    }

    fn handle_signals(&mut self) -> Result<(), LegionError> {
        for event in self.signals.drain()? {
            match event {
                SignalEvent::Reap => self.reap(),
                SignalEvent::Reset => {
                    self.reset_in_progress = true;
                    self.reload();
                    self.begin_exit();
                }
                SignalEvent::Exit => self.begin_exit(),
                SignalEvent::Relay(sig) => {
                    for task in self.tasks.values() {
                        for pid in task.live_pids() {
                            let _ = signal::kill(pid, sig);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_file_changes(&mut self) {
        let Ok(changed) = self.file_watcher.get(SHORT_TIMEOUT, 64) else {
            return;
        };
        for path in changed {
            if let Some(targets) = self.file_targets.get(&path).cloned() {
                for target in targets {
                    self.fire(&target);
                }
            }
        }
    }

    fn handle_module_changes(&mut self) {
        let Ok(changed) = self.module_watcher.get(SHORT_TIMEOUT, 64) else {
            return;
        };
        for (name, _command_path, _files) in changed {
            let Some(task) = self.tasks.get(&name) else { continue };
            let handlers: Vec<EventHandler> = task
                .config_running
                .events
                .iter()
                .filter(|e| e.kind == EventKind::Python)
                .map(|e| e.handler.clone())
                .collect();
            for handler in handlers {
                let target = match handler {
                    EventHandler::Command(cmd) => EventTarget::Command {
                        task: name.clone(),
                        name: cmd,
                    },
                    EventHandler::Signal(sig) => {
                        let Some(sig) = crate::signals::parse_signal_name(&sig) else {
                            continue;
                        };
                        EventTarget::Signal {
                            task: name.clone(),
                            signal: sig,
                        }
                    }
                };
                self.fire(&target);
            }
        }
    }

    fn reap(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => break,
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.on_child_exit(pid, libc::W_EXITCODE(code, 0));
                }
                Ok(WaitStatus::Signaled(pid, sig, core)) => {
                    let status = sig as i32 | if core { 0x80 } else { 0 };
                    self.on_child_exit(pid, status);
                }
                Ok(_) => continue,
                Err(err) => {
                    debug!(%err, "waitpid error during reap loop");
                    break;
                }
            }
        }
    }

    fn on_child_exit(&mut self, pid: Pid, status: i32) {
        let Some(task_name) = self.pid_targets.remove(&pid) else {
            warn!(pid = pid.as_raw(), "reaped unknown pid");
            return;
        };
        if let Some(task) = self.tasks.get_mut(&task_name) {
            task.record_exit(pid, status, SystemTime::now());
        }
    }

    fn idle_pass(&mut self) {
        self.last_idle_pass = SystemTime::now();
        self.apply_shared_state();

        let now = SystemTime::now();
        let mut onexit_actions = Vec::new();

        for name in self.order.clone() {
            let can_start = {
                let task = &self.tasks[&name];
                task.requires().iter().all(|req| match self.tasks.get(req) {
                    None => true,
                    Some(dep) if dep.config_running.control.is_once_like() => dep.stopped.is_some(),
                    Some(dep) => dep.started.is_some(),
                })
            };

            let ctx = ManageContext {
                now,
                can_start,
                host: self.host.clone(),
                fqdn: self.fqdn.clone(),
                resetting: self.reset_in_progress,
            };

            let Some(task) = self.tasks.get_mut(&name) else {
                continue;
            };
            let outcome = task.manage(&ctx);

            for pid in outcome.newly_spawned {
                self.pid_targets.insert(pid, name.clone());
            }
            if let Some(timeout) = outcome.next_timeout {
                self.next_timeout = self.next_timeout.min(timeout);
            }
            if outcome.became_stopped {
                onexit_actions.extend(outcome.fire_onexit.into_iter().map(|a| (name.clone(), a)));
            }
        }

        for (_source, action) in onexit_actions {
            let config::OnExitAction::Start { task: target } = action;
            if let Some(task) = self.tasks.get_mut(&target) {
                if task.config_running.control.is_once_like() {
                    task.proc_state.clear();
                    task.stopped = None;
                } else {
                    warn!(target, "onexit.start target is not a once/event task; skipping");
                }
            }
        }

        self.tasks.retain(|_, task| !task.should_remove());

        let snapshot = self.status_snapshot();
        *self.status.lock().unwrap_or_else(|p| p.into_inner()) = snapshot;
        *self.config_handle.lock().unwrap_or_else(|p| p.into_inner()) = self.config.clone();
    }
}

/// Overlays `defines`, then `role_defines` for every currently active role,
/// onto `ctx`. Later keys win, and role-scoped values win over plain ones.
fn apply_defines(
    ctx: &mut HashMap<String, ContextValue>,
    defines: &HashMap<String, String>,
    role_defines: &HashMap<String, HashMap<String, String>>,
    roles: &RolesSet,
) {
    for (k, v) in defines {
        ctx.insert(k.clone(), ContextValue::String(v.clone()));
    }
    if let Some(active) = roles.active() {
        for role in active {
            if let Some(map) = role_defines.get(role) {
                for (k, v) in map {
                    ctx.insert(k.clone(), ContextValue::String(v.clone()));
                }
            }
        }
    }
}

/// Fills in `role_defaults` for active roles, then `defaults`, for any key
/// not already present in `ctx`. Role-scoped defaults are preferred over
/// plain ones since they're applied first and defaults never overwrite.
fn apply_defaults(
    ctx: &mut HashMap<String, ContextValue>,
    defaults: &HashMap<String, String>,
    role_defaults: &HashMap<String, HashMap<String, String>>,
    roles: &RolesSet,
) {
    if let Some(active) = roles.active() {
        for role in active {
            if let Some(map) = role_defaults.get(role) {
                for (k, v) in map {
                    ctx.entry(k.clone()).or_insert_with(|| ContextValue::String(v.clone()));
                }
            }
        }
    }
    for (k, v) in defaults {
        ctx.entry(k.clone()).or_insert_with(|| ContextValue::String(v.clone()));
    }
}

fn warn_invalid_onexit_targets(config: &config::Config) {
    for (task, target) in config.invalid_onexit_targets() {
        warn!(task, target, "on_exit target is not a once-control task; ignoring");
    }
}

fn hostname() -> String {
    let mut buf = vec![0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}
