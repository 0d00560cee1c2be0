//! Per-task state machine: starting, running, suspending, stopping
//! (graceful then forced), and one-shot/event variants with restart
//! back-off.
use crate::config::{ControlMode, EventHandler, EventKind, OnExitAction, TaskConfig};
use crate::exec::{exec_process, ContextValue, ExecRequest};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Minimum time a slot must sit idle after an exit before it restarts.
pub const RESTART_BACKOFF: Duration = Duration::from_secs(5);
/// How long a stopping/shrinking slot waits after SIGTERM before SIGKILL.
pub const SIGKILL_ESCALATION: Duration = Duration::from_secs(5);

/// Where a task sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Starting,
    Started,
    Stopping,
    Killed,
    Stopped,
    Suspended,
}

/// One slot's process history. A slot persists across restarts.
#[derive(Debug, Clone, Default)]
pub struct ProcessSlot {
    pub pid: Option<Pid>,
    pub started: Option<SystemTime>,
    pub exited: Option<SystemTime>,
    pub exit_code: Option<i32>,
    pub next_sig: Option<Signal>,
    escalate_at: Option<SystemTime>,
}

impl ProcessSlot {
    fn is_live(&self) -> bool {
        self.pid.is_some()
    }

    /// Whether enough time has passed since the last exit to retry a start,
    /// resetting the clock if the wall clock moved backward.
    fn restart_allowed(&mut self, now: SystemTime) -> bool {
        let Some(exited) = self.exited else {
            return true;
        };
        match now.duration_since(exited) {
            Ok(elapsed) => elapsed >= RESTART_BACKOFF,
            Err(_) => {
                // Clock moved backward; reset the reference point and defer.
                self.exited = Some(now);
                false
            }
        }
    }
}

/// What the main loop should do in response to a `manage()` call.
#[derive(Debug, Default)]
pub struct ManageOutcome {
    /// A shorter poll timeout this task would like the loop to honor.
    pub next_timeout: Option<Duration>,
    /// PIDs freshly forked this tick; the caller must add these to the
    /// legion's pid map before the next poll.
    pub newly_spawned: Vec<Pid>,
    /// Signals freshly sent this tick, paired with the target pid, for the
    /// caller to log or relay.
    pub signalled: Vec<(Pid, Signal)>,
    /// `onexit` actions to run because this task just became fully stopped.
    pub fire_onexit: Vec<OnExitAction>,
    /// True once this tick drove the task from non-stopped to stopped.
    pub became_stopped: bool,
}

/// What the caller (Legion) knows about the outside world for this tick.
pub struct ManageContext {
    pub now: SystemTime,
    /// Whether this task's `requires` are currently satisfied.
    pub can_start: bool,
    pub host: String,
    pub fqdn: String,
    /// Whether the legion is tearing down for a reset rather than a plain
    /// stop; selects the `restart` event over `stop` when both could apply.
    pub resetting: bool,
}

/// One configured unit of supervision.
pub struct Task {
    pub name: String,
    pub state: TaskState,
    pub proc_state: Vec<ProcessSlot>,
    pub config_running: TaskConfig,
    pub config_pending: TaskConfig,
    pub context: HashMap<String, ContextValue>,
    pub starting: Option<SystemTime>,
    pub started: Option<SystemTime>,
    pub suspended: Option<SystemTime>,
    pub stopping: Option<SystemTime>,
    pub killed: Option<SystemTime>,
    pub stopped: Option<SystemTime>,
    /// Do-not-resuscitate: set when the task was dropped from config while
    /// still running. Once `stopped`, such a task is removed by the caller.
    pub dnr: bool,
    /// Absolute expiry derived from `time_limit`.
    pub limit: Option<SystemTime>,
    instance: u32,
}

impl Task {
    pub fn new(name: String, config: TaskConfig, context: HashMap<String, ContextValue>) -> Self {
        Task {
            name,
            state: TaskState::Idle,
            proc_state: Vec::new(),
            config_running: config.clone(),
            config_pending: config,
            context,
            starting: None,
            started: None,
            suspended: None,
            stopping: None,
            killed: None,
            stopped: None,
            dnr: false,
            limit: None,
            instance: 0,
        }
    }

    pub fn requires(&self) -> &[String] {
        &self.config_running.requires
    }

    pub fn live_pids(&self) -> Vec<Pid> {
        self.proc_state.iter().filter_map(|s| s.pid).collect()
    }

    /// True once every slot has exited and none remain pending reap.
    pub fn is_fully_stopped(&self) -> bool {
        self.proc_state.iter().all(|s| s.pid.is_none())
    }

    /// Marks a task removable: it was dropped from config and has no
    /// remaining processes.
    pub fn should_remove(&self) -> bool {
        self.dnr && self.is_fully_stopped() && self.state == TaskState::Stopped
    }

    /// Applies a pending config reload, comparing against the running one.
    /// A start-command change forces a restart of live processes; other
    /// changes (count, control) take effect the next `manage()` tick.
    pub fn apply_pending_config(&mut self) {
        let command_changed =
            self.config_pending.start_command() != self.config_running.start_command();
        self.config_running = self.config_pending.clone();
        if command_changed && !self.proc_state.is_empty() {
            self.begin_stop();
        }
    }

    /// Changes the pending control mode. Returns whether it actually changed.
    pub fn set_control(&mut self, mode: ControlMode) -> bool {
        if self.config_pending.control == mode {
            return false;
        }
        self.config_pending.control = mode;
        true
    }

    /// Changes the pending process count. Returns whether it actually changed.
    pub fn set_count(&mut self, count: u32) -> bool {
        if self.config_pending.count == Some(count) {
            return false;
        }
        self.config_pending.count = Some(count);
        true
    }

    fn desired_count(&self) -> usize {
        self.config_running.count.unwrap_or(1) as usize
    }

    fn begin_stop(&mut self) {
        if matches!(self.state, TaskState::Stopping | TaskState::Killed) {
            return;
        }
        self.state = TaskState::Stopping;
        self.stopping = Some(SystemTime::now());
    }

    fn build_exec_request(&mut self, host: &str, fqdn: &str) -> Option<ExecRequest> {
        let argv = self.config_running.start_command()?.to_vec();
        Some(self.build_exec_request_for(argv, host, fqdn))
    }

    /// Builds a one-shot request for a named `commands` entry (used by
    /// `events: [{command: ...}]` handlers and onexit actions).
    pub fn command_exec_request(&mut self, name: &str, host: &str, fqdn: &str) -> Option<ExecRequest> {
        let argv = self.config_running.commands.get(name)?.clone();
        Some(self.build_exec_request_for(argv, host, fqdn))
    }

    fn build_exec_request_for(&mut self, argv: Vec<String>, host: &str, fqdn: &str) -> ExecRequest {
        self.instance += 1;

        let mut context = self.context.clone();
        context.insert("Task_name".into(), ContextValue::String(self.name.clone()));
        context.insert(
            "Task_instance".into(),
            ContextValue::String(self.instance.to_string()),
        );
        context.insert("Task_host".into(), ContextValue::String(host.to_string()));
        context.insert("Task_fqdn".into(), ContextValue::String(fqdn.to_string()));
        context.insert(
            "Task_started".into(),
            ContextValue::String(
                SystemTime::now()
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .map(|d| d.as_secs().to_string())
                    .unwrap_or_default(),
            ),
        );

        ExecRequest {
            argv,
            context,
            user: self.config_running.user.clone(),
            group: self.config_running.group.clone(),
            cwd: self.config_running.cwd.clone().map(Into::into),
            procname: self.config_running.procname.clone(),
            log_fds: (None, None),
        }
    }

    fn spawn_slot(&mut self, slot_index: usize, ctx: &ManageContext) -> Option<Pid> {
        let req = self.build_exec_request(&ctx.host, &ctx.fqdn)?;
        match exec_process(&req) {
            Ok(pid) => {
                while self.proc_state.len() <= slot_index {
                    self.proc_state.push(ProcessSlot::default());
                }
                let slot = &mut self.proc_state[slot_index];
                slot.pid = Some(pid);
                slot.started = Some(ctx.now);
                slot.exit_code = None;
                Some(pid)
            }
            Err(err) => {
                warn!(task = %self.name, error = %err, "failed to spawn process");
                None
            }
        }
    }

    /// Called once per idle pass. Reconciles running state toward the
    /// configured `control`/`count`, applying back-off and escalation.
    pub fn manage(&mut self, ctx: &ManageContext) -> ManageOutcome {
        let mut outcome = ManageOutcome::default();

        if self.config_pending.control != self.config_running.control
            || self.config_pending.count != self.config_running.count
        {
            self.apply_pending_config();
        }

        match self.config_running.control {
            ControlMode::Off => self.manage_draining(ctx, &mut outcome),
            ControlMode::Suspend => self.manage_suspend(ctx, &mut outcome),
            ControlMode::Once | ControlMode::Event => self.manage_once(ctx, &mut outcome),
            ControlMode::Wait | ControlMode::Nowait | ControlMode::Adopt => {
                self.manage_resident(ctx, &mut outcome)
            }
        }

        if let Some(limit) = self.limit
            && ctx.now >= limit
            && !matches!(self.state, TaskState::Stopping | TaskState::Killed | TaskState::Stopped)
        {
            self.begin_stop();
        }

        self.drive_stop_escalation(ctx, &mut outcome);

        if self.is_fully_stopped()
            && matches!(self.state, TaskState::Stopping | TaskState::Killed)
        {
            let was_stopped_already = self.state == TaskState::Stopped;
            self.state = TaskState::Stopped;
            self.stopped = Some(ctx.now);
            if !was_stopped_already {
                outcome.became_stopped = true;
                outcome.fire_onexit = self.config_running.onexit.clone();
            }
        }

        outcome
    }

    fn manage_resident(&mut self, ctx: &ManageContext, outcome: &mut ManageOutcome) {
        // The requires gate applies to every resident control alike (wait,
        // nowait, adopt) and only to the initial start: once a task has
        // started it is never re-blocked by a dependency's later state.
        if !ctx.can_start && self.started.is_none() {
            outcome.next_timeout = Some(Duration::from_millis(250));
            return;
        }

        let desired = self.desired_count();
        let live = self.proc_state.iter().filter(|s| s.is_live()).count();

        if live < desired && self.state != TaskState::Stopping && self.state != TaskState::Killed {
            self.state = TaskState::Starting;
            self.starting.get_or_insert(ctx.now);
            for idx in 0..self.proc_state.len().max(desired) {
                if idx >= desired {
                    break;
                }
                if self.proc_state.get(idx).map(|s| s.is_live()).unwrap_or(false) {
                    continue;
                }
                let ready = self
                    .proc_state
                    .get_mut(idx)
                    .map(|s| s.restart_allowed(ctx.now))
                    .unwrap_or(true);
                if !ready {
                    outcome.next_timeout = Some(Duration::from_millis(250));
                    continue;
                }
                if let Some(pid) = self.spawn_slot(idx, ctx) {
                    outcome.newly_spawned.push(pid);
                }
            }
            if self.proc_state.iter().filter(|s| s.is_live()).count() >= desired {
                self.state = TaskState::Started;
                self.started.get_or_insert(ctx.now);
            }
        } else if live > desired {
            self.shrink_to(desired, ctx, outcome);
        } else if live == desired && desired > 0 {
            self.state = TaskState::Started;
            self.started.get_or_insert(ctx.now);
        }
    }

    fn manage_once(&mut self, ctx: &ManageContext, outcome: &mut ManageOutcome) {
        if !self.proc_state.is_empty() {
            // Already ran; once/event tasks never restart on their own.
            return;
        }
        if !ctx.can_start {
            outcome.next_timeout = Some(Duration::from_millis(250));
            return;
        }
        self.state = TaskState::Starting;
        self.starting.get_or_insert(ctx.now);
        if let Some(pid) = self.spawn_slot(0, ctx) {
            outcome.newly_spawned.push(pid);
        }
        // `once` is marked stopping at the moment it starts; `event` is
        // additionally marked stopped immediately (it "ran at start").
        self.state = TaskState::Stopping;
        self.stopping.get_or_insert(ctx.now);
        if self.config_running.control == ControlMode::Event {
            self.stopped = Some(ctx.now);
        }
    }

    fn manage_suspend(&mut self, ctx: &ManageContext, outcome: &mut ManageOutcome) {
        self.shrink_to(0, ctx, outcome);
        if self.is_fully_stopped() && self.state != TaskState::Suspended {
            self.state = TaskState::Suspended;
            self.suspended = Some(ctx.now);
        }
    }

    fn manage_draining(&mut self, ctx: &ManageContext, outcome: &mut ManageOutcome) {
        self.shrink_to(0, ctx, outcome);
    }

    /// The signal that begins this task's stop sequence: the `stop` (or,
    /// while resetting, `restart`) event's signal handler if one is bound,
    /// else plain SIGTERM. A command handler on `stop`/`restart` is not
    /// consulted here; only direct signal overrides are.
    fn stop_signal(&self, resetting: bool) -> Signal {
        let kind = if resetting { EventKind::Restart } else { EventKind::Stop };
        self.config_running
            .events
            .iter()
            .find(|event| event.kind == kind)
            .and_then(|event| match &event.handler {
                EventHandler::Signal(name) => crate::signals::parse_signal_name(name),
                EventHandler::Command(_) => None,
            })
            .unwrap_or(Signal::SIGTERM)
    }

    /// Signals surplus slots (highest index first) with the task's stop
    /// signal, escalating to SIGKILL after `SIGKILL_ESCALATION` if they
    /// haven't exited.
    fn shrink_to(&mut self, desired: usize, ctx: &ManageContext, outcome: &mut ManageOutcome) {
        if self.proc_state.iter().filter(|s| s.is_live()).count() > desired {
            self.begin_stop();
        }
        let stop_signal = self.stop_signal(ctx.resetting);
        let mut live_indices: Vec<usize> = self
            .proc_state
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_live())
            .map(|(i, _)| i)
            .collect();
        live_indices.sort_unstable_by(|a, b| b.cmp(a));

        for idx in live_indices.into_iter().skip(desired) {
            let slot = &mut self.proc_state[idx];
            let Some(pid) = slot.pid else { continue };
            match slot.escalate_at {
                None => {
                    let _ = signal::kill(pid, stop_signal);
                    slot.escalate_at = Some(ctx.now + SIGKILL_ESCALATION);
                    outcome.signalled.push((pid, stop_signal));
                    outcome.next_timeout = Some(Duration::from_millis(250));
                }
                Some(deadline) if ctx.now >= deadline => {
                    let _ = signal::kill(pid, Signal::SIGKILL);
                    outcome.signalled.push((pid, Signal::SIGKILL));
                    self.state = TaskState::Killed;
                    self.killed.get_or_insert(ctx.now);
                }
                Some(_) => {
                    outcome.next_timeout = Some(Duration::from_millis(250));
                }
            }
        }
    }

    fn drive_stop_escalation(&mut self, ctx: &ManageContext, outcome: &mut ManageOutcome) {
        if self.state != TaskState::Stopping {
            return;
        }
        let desired = if matches!(
            self.config_running.control,
            ControlMode::Suspend | ControlMode::Off
        ) {
            0
        } else {
            self.desired_count()
        };
        if self.proc_state.iter().filter(|s| s.is_live()).count() > desired {
            self.shrink_to(desired, ctx, outcome);
        }
    }

    /// Records an exit reaped from `waitpid`. Clears the slot's pid while
    /// preserving its history for restart back-off.
    pub fn record_exit(&mut self, pid: Pid, status: i32, now: SystemTime) {
        for slot in &mut self.proc_state {
            if slot.pid == Some(pid) {
                slot.pid = None;
                slot.exited = Some(now);
                slot.exit_code = Some(status);
                slot.escalate_at = None;
                info!(
                    task = %self.name,
                    pid = pid.as_raw(),
                    status = crate::exec::format_exit_status(status),
                    "process exited"
                );
                return;
            }
        }
        warn!(task = %self.name, pid = pid.as_raw(), "reaped pid not found in any slot");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlMode;
    use std::collections::HashMap as Map;

    fn ctx(now: SystemTime, can_start: bool) -> ManageContext {
        ManageContext {
            now,
            can_start,
            host: "testhost".into(),
            fqdn: "testhost.local".into(),
            resetting: false,
        }
    }

    fn make_task(name: &str, argv: &[&str]) -> Task {
        let mut commands = Map::new();
        commands.insert("start".to_string(), argv.iter().map(|s| s.to_string()).collect());
        let config = TaskConfig {
            control: ControlMode::Wait,
            count: Some(1),
            commands,
            ..TaskConfig::default()
        };
        Task::new(name.to_string(), config, Map::new())
    }

    #[test]
    fn resident_task_spawns_up_to_count() {
        let mut task = make_task("sleeper", &["/bin/sh", "-c", "sleep 30"]);
        let outcome = task.manage(&ctx(SystemTime::now(), true));
        assert_eq!(outcome.newly_spawned.len(), 1);
        assert_eq!(task.state, TaskState::Started);
        let pid = task.proc_state[0].pid.unwrap();
        let _ = signal::kill(pid, Signal::SIGKILL);
        let _ = nix::sys::wait::waitpid(pid, None);
    }

    #[test]
    fn once_task_becomes_stopped_and_never_restarts() {
        let mut task = make_task("job", &["/bin/sh", "-c", "exit 0"]);
        task.config_running.control = ControlMode::Once;
        task.config_pending.control = ControlMode::Once;

        let now = SystemTime::now();
        let outcome = task.manage(&ctx(now, true));
        assert_eq!(outcome.newly_spawned.len(), 1);
        assert_eq!(task.state, TaskState::Stopping);

        let pid = task.proc_state[0].pid.unwrap();
        let status = nix::sys::wait::waitpid(pid, None).unwrap();
        let raw = match status {
            nix::sys::wait::WaitStatus::Exited(_, code) => code,
            _ => panic!("expected clean exit"),
        };
        task.record_exit(pid, libc::W_EXITCODE(raw, 0), now);

        let outcome = task.manage(&ctx(now + Duration::from_secs(1), true));
        assert!(outcome.became_stopped);
        assert_eq!(task.state, TaskState::Stopped);

        // A later manage() must not spawn another process.
        let outcome = task.manage(&ctx(now + Duration::from_secs(2), true));
        assert!(outcome.newly_spawned.is_empty());
    }

    #[test]
    fn requires_not_satisfied_blocks_wait_task() {
        let mut task = make_task("dependent", &["/bin/sh", "-c", "sleep 30"]);
        let outcome = task.manage(&ctx(SystemTime::now(), false));
        assert!(outcome.newly_spawned.is_empty());
        assert_eq!(task.state, TaskState::Idle);
    }

    #[test]
    fn requires_not_satisfied_blocks_nowait_task_before_first_start() {
        let mut task = make_task("dependent_nowait", &["/bin/sh", "-c", "sleep 30"]);
        task.config_running.control = ControlMode::Nowait;
        task.config_pending.control = ControlMode::Nowait;
        let outcome = task.manage(&ctx(SystemTime::now(), false));
        assert!(outcome.newly_spawned.is_empty());
        assert_eq!(task.state, TaskState::Idle);
    }

    #[test]
    fn already_started_task_is_not_reblocked_by_later_unmet_requires() {
        let mut task = make_task("stays_up", &["/bin/sh", "-c", "sleep 30"]);
        let now = SystemTime::now();
        let outcome = task.manage(&ctx(now, true));
        assert_eq!(outcome.newly_spawned.len(), 1);
        let pid = task.proc_state[0].pid.unwrap();

        // A dependency going unsatisfied after the task has started must not
        // undo its running state.
        let outcome = task.manage(&ctx(now + Duration::from_millis(10), false));
        assert!(outcome.newly_spawned.is_empty());
        assert_eq!(task.state, TaskState::Started);

        let _ = signal::kill(pid, Signal::SIGKILL);
        let _ = nix::sys::wait::waitpid(pid, None);
    }

    #[test]
    fn adopt_control_spawns_like_wait() {
        let mut task = make_task("adopted", &["/bin/sh", "-c", "sleep 30"]);
        task.config_running.control = ControlMode::Adopt;
        task.config_pending.control = ControlMode::Adopt;
        let outcome = task.manage(&ctx(SystemTime::now(), true));
        assert_eq!(outcome.newly_spawned.len(), 1);
        assert_eq!(task.state, TaskState::Started);
        let pid = task.proc_state[0].pid.unwrap();
        let _ = signal::kill(pid, Signal::SIGKILL);
        let _ = nix::sys::wait::waitpid(pid, None);
    }

    #[test]
    fn restart_backoff_defers_respawn_after_exit() {
        let mut task = make_task("flappy", &["/bin/sh", "-c", "exit 1"]);
        let now = SystemTime::now();
        task.manage(&ctx(now, true));
        let pid = task.proc_state[0].pid.unwrap();
        nix::sys::wait::waitpid(pid, None).unwrap();
        task.record_exit(pid, libc::W_EXITCODE(1, 0), now);

        let outcome = task.manage(&ctx(now + Duration::from_millis(100), true));
        assert!(outcome.newly_spawned.is_empty(), "back-off should defer the respawn");

        let outcome = task.manage(&ctx(now + RESTART_BACKOFF + Duration::from_secs(1), true));
        assert_eq!(outcome.newly_spawned.len(), 1);
        let pid = task.proc_state[0].pid.unwrap();
        let _ = signal::kill(pid, Signal::SIGKILL);
        let _ = nix::sys::wait::waitpid(pid, None);
    }

    #[test]
    fn shrinking_count_sends_sigterm_then_sigkill() {
        let mut task = make_task("pool", &["/bin/sh", "-c", "sleep 30"]);
        task.config_running.count = Some(2);
        task.config_pending.count = Some(2);
        let now = SystemTime::now();
        task.manage(&ctx(now, true));
        task.manage(&ctx(now, true));
        assert_eq!(task.proc_state.iter().filter(|s| s.is_live()).count(), 1.max(1));

        task.config_running.count = Some(0);
        task.config_pending.count = Some(0);
        let outcome = task.manage(&ctx(now, true));
        assert!(outcome.signalled.iter().any(|(_, sig)| *sig == Signal::SIGTERM));

        let later = now + SIGKILL_ESCALATION + Duration::from_secs(1);
        let outcome = task.manage(&ctx(later, true));
        assert!(outcome.signalled.iter().any(|(_, sig)| *sig == Signal::SIGKILL));

        for slot in &task.proc_state.clone() {
            if let Some(pid) = slot.pid {
                let _ = nix::sys::wait::waitpid(pid, None);
            }
        }
    }
}
