//! Configuration document model: tasks, settings, defines/defaults, and roles.
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    env, fs,
    path::{Path, PathBuf},
};

use crate::error::ConfigError;

/// Per-task supervision mode.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    /// Excluded from scope entirely; stopped if running.
    Off,
    /// Normal resident task; default.
    #[default]
    Wait,
    /// Resident, but startup does not wait on its requirements being `started`.
    Nowait,
    /// Resident; taskforce adopts an externally-started process rather than forking one.
    Adopt,
    /// Runs once to completion, then stays `stopped` until reset by `onexit.start`.
    Once,
    /// Like `once`, but marked stopped the instant it starts.
    Event,
    /// Resident but drained and parked; resumes the normal start path when unsuspended.
    Suspend,
}

impl ControlMode {
    /// True for controls whose tasks are expected to be supervised at all
    /// (the universe quantified over in the testable "requires" invariant).
    pub fn is_run_control(self) -> bool {
        !matches!(self, ControlMode::Off)
    }

    /// True for `once`/`event`, which settle into `stopped` after a single run.
    pub fn is_once_like(self) -> bool {
        matches!(self, ControlMode::Once | ControlMode::Event)
    }
}

/// One `events:` entry's trigger condition.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Fires when the task's own executable changes on disk.
    #[serde(rename = "self")]
    SelfChange,
    /// Fires when the executable or any dependent source file changes.
    Python,
    /// Fires when any of a fixed list of paths changes.
    FileChange,
    /// Bound to the task's default stop path.
    Stop,
    /// Used instead of `stop` when the legion is resetting.
    Restart,
}

/// The handler invoked when an event fires.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum EventHandler {
    /// Run `commands[<name>]` as a one-shot child; its exit is only logged.
    Command(String),
    /// Send the named signal to every live PID in the task.
    Signal(String),
}

/// One `events:` entry.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct EventConfig {
    /// What triggers this event.
    pub kind: EventKind,
    /// Paths to watch; only meaningful for `file_change`.
    pub paths: Vec<String>,
    /// What to do when the event fires.
    pub handler: EventHandler,
}

impl<'de> Deserialize<'de> for EventConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(rename = "type")]
            kind: EventKind,
            #[serde(default)]
            paths: Vec<String>,
            command: Option<String>,
            signal: Option<String>,
        }

        let raw = Raw::deserialize(deserializer)?;
        let handler = match (raw.command, raw.signal) {
            (Some(command), None) => EventHandler::Command(command),
            (None, Some(signal)) => EventHandler::Signal(signal),
            _ => {
                return Err(serde::de::Error::custom(
                    "event entry must set exactly one of 'command' or 'signal'",
                ));
            }
        };

        Ok(EventConfig {
            kind: raw.kind,
            paths: raw.paths,
            handler,
        })
    }
}

/// An `onexit:` action. Currently the only kind the document supports is
/// starting another (necessarily `once`) task.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OnExitAction {
    /// Start the named task.
    Start {
        /// Name of the task to start; must itself be `once`/`event` control.
        task: String,
    },
}

/// One task's configuration, as it appears under `tasks.<name>` in the document.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct TaskConfig {
    /// Supervision mode.
    #[serde(default)]
    pub control: ControlMode,
    /// Number of processes to maintain. Defaults to 1.
    pub count: Option<u32>,
    /// Named argv lists, e.g. `start`, `stop`.
    #[serde(default)]
    pub commands: HashMap<String, Vec<String>>,
    /// Tasks that must be started (or, if `once`, stopped) before this one starts.
    #[serde(default)]
    pub requires: Vec<String>,
    /// Role names this task belongs to. Absent means always in scope.
    pub roles: Option<Vec<String>>,
    /// Event bindings.
    #[serde(default)]
    pub events: Vec<EventConfig>,
    /// Actions to run once all of this task's processes have exited.
    #[serde(default)]
    pub onexit: Vec<OnExitAction>,
    /// Account to run as.
    pub user: Option<String>,
    /// Group to run as.
    pub group: Option<String>,
    /// Working directory; validated to exist at spawn time.
    pub cwd: Option<String>,
    /// Override for argv[0].
    pub procname: Option<String>,
    /// Optional external PID file path (formatted with context).
    pub pidfile: Option<String>,
    /// Seconds to wait before the first spawn.
    pub start_delay: Option<u64>,
    /// Absolute number of seconds after which the task is force-stopped.
    pub time_limit: Option<u64>,
    /// Task-scoped formatting context, merged over the document-level maps.
    #[serde(default)]
    pub defines: HashMap<String, String>,
    /// Task-scoped defaults, only applied when a key is otherwise absent.
    #[serde(default)]
    pub defaults: HashMap<String, String>,
    /// Role-conditional defines, merged in when a role is active.
    #[serde(default)]
    pub role_defines: HashMap<String, HashMap<String, String>>,
    /// Role-conditional defaults.
    #[serde(default)]
    pub role_defaults: HashMap<String, HashMap<String, String>>,
}

impl TaskConfig {
    /// The `requires` tasks that must be *stopped* (not merely started)
    /// before this task may start, i.e. those configured `once`/`event`.
    pub fn start_command(&self) -> Option<&[String]> {
        self.commands.get("start").map(Vec::as_slice)
    }
}

/// One HTTP listener descriptor under `settings.http`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpListenerConfig {
    /// `[host][:port]` for TCP, or an absolute path for a Unix-domain socket.
    pub listen: String,
    /// Optional PEM file containing both certificate and key; enables TLS.
    pub certfile: Option<String>,
    /// Whether `/manage/*` control endpoints are permitted on this listener.
    #[serde(default)]
    pub allow_control: bool,
}

/// The `settings` block.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Settings {
    /// HTTP service descriptors.
    #[serde(default)]
    pub http: Vec<HttpListenerConfig>,
}

/// The top-level configuration document.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Task definitions, keyed by name.
    pub tasks: HashMap<String, TaskConfig>,
    /// Listener/control-plane settings.
    #[serde(default)]
    pub settings: Settings,
    /// Document-level formatting context, merged into every task's context.
    #[serde(default)]
    pub defines: HashMap<String, String>,
    /// Document-level defaults.
    #[serde(default)]
    pub defaults: HashMap<String, String>,
    /// Role-conditional defines at document scope.
    #[serde(default)]
    pub role_defines: HashMap<String, HashMap<String, String>>,
    /// Role-conditional defaults at document scope.
    #[serde(default)]
    pub role_defaults: HashMap<String, HashMap<String, String>>,
}

impl Config {
    /// Returns task names topologically sorted so every `requires` entry
    /// precedes its dependents. Ties are broken alphabetically for
    /// determinism (the scheduler does not depend on this, but tests do).
    pub fn task_start_order(&self) -> Result<Vec<String>, ConfigError> {
        let mut indegree: HashMap<&str, usize> =
            self.tasks.keys().map(|name| (name.as_str(), 0)).collect();
        let mut graph: HashMap<&str, Vec<&str>> = HashMap::new();

        for (name, task) in &self.tasks {
            for dep in &task.requires {
                if !self.tasks.contains_key(dep) {
                    return Err(ConfigError::UnknownDependency {
                        task: name.clone(),
                        requires: dep.clone(),
                    });
                }
                *indegree.get_mut(name.as_str()).expect("task must exist") += 1;
                graph.entry(dep.as_str()).or_default().push(name.as_str());
            }
        }

        let mut ready: BTreeSet<&str> = indegree
            .iter()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(name) = ready.pop_first() {
            order.push(name.to_string());
            if let Some(children) = graph.get(name) {
                for child in children {
                    let deg = indegree.get_mut(child).expect("child must exist");
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(child);
                    }
                }
            }
        }

        if order.len() != self.tasks.len() {
            let remaining: Vec<String> = indegree
                .into_iter()
                .filter(|(_, deg)| *deg > 0)
                .map(|(name, _)| name.to_string())
                .collect();
            return Err(ConfigError::DependencyCycle { remaining });
        }

        Ok(order)
    }

    /// Validates `onexit.start` targets per the runtime-rejection design
    /// decision: load does not fail, but we can still surface violations to
    /// the operator via the status plane; this returns the offending pairs.
    pub fn invalid_onexit_targets(&self) -> Vec<(String, String)> {
        let mut bad = Vec::new();
        for (name, task) in &self.tasks {
            for action in &task.onexit {
                let OnExitAction::Start { task: target } = action;
                match self.tasks.get(target) {
                    Some(target_cfg) if target_cfg.control.is_once_like() => {}
                    _ => bad.push((name.clone(), target.clone())),
                }
            }
        }
        bad
    }
}

/// Operator-supplied role filter.
///
/// `None` (no roles file given) disables filtering entirely; every task is
/// in scope. `Some(set)` (including the empty set, from an empty roles
/// file) restricts scope to tasks with no `roles` or at least one role in
/// the set.
#[derive(Debug, Clone)]
pub enum RolesSet {
    /// Role filtering disabled; all tasks are in scope.
    Disabled,
    /// Explicit role set; may be empty.
    Explicit(HashSet<String>),
}

impl RolesSet {
    /// Whether a task's declared roles place it in scope.
    pub fn in_scope(&self, task_roles: Option<&[String]>) -> bool {
        match self {
            RolesSet::Disabled => true,
            RolesSet::Explicit(set) => match task_roles {
                None => true,
                Some(roles) => roles.iter().any(|r| set.contains(r)),
            },
        }
    }

    /// The roles currently active, for merging `role_defines`/`role_defaults`.
    /// `None` when filtering is disabled: no role is considered "active" for
    /// context-merge purposes, matching the original's `get_roles()` being
    /// falsy with no roles file loaded.
    pub fn active(&self) -> Option<&HashSet<String>> {
        match self {
            RolesSet::Disabled => None,
            RolesSet::Explicit(set) => Some(set),
        }
    }

    /// Loads a roles file: one role per line, blank lines and `#` comments
    /// ignored. An empty (or all-comment) file yields the empty explicit set.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let set = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect();
        Ok(RolesSet::Explicit(set))
    }
}

fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").expect("static regex");
    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let name = &caps[1];
        match env::var(name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    if let Some(name) = missing {
        return Err(ConfigError::Read(std::io::Error::other(format!(
            "missing environment variable: {name}"
        ))));
    }
    Ok(result.to_string())
}

/// Loads and parses the task configuration document, expanding
/// `${VAR}`/`$VAR` references against the process environment.
pub fn load_config(config_path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(config_path).map_err(|e| {
        ConfigError::Read(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let expanded = expand_env_vars(&content)?;
    let config: Config = serde_yaml::from_str(&expanded)?;

    if config.tasks.is_empty() && !content.contains("tasks") {
        return Err(ConfigError::MissingTasks);
    }

    config.task_start_order()?;
    Ok(config)
}
