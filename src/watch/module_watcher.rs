//! Maps a set of named programs to the transitive closure of source files
//! they depend on, and reports changes back by program name rather than by
//! path.
//!
//! Dependency resolution only understands Python: a program whose file
//! begins with a `#!...python` shebang is scanned line-by-line for
//! `import x` / `from x import y` statements, resolved against the module
//! search path, and recursively expanded. Anything else — compiled
//! binaries, shell scripts, unrecognized interpreters — falls back to
//! watching just the program path itself, per the contract that an
//! unresolvable source set still watches the program.
use crate::error::WatchError;
use crate::watch::file_watcher::FileWatcher;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

fn looks_like_python(path: &Path) -> bool {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return false;
    };
    contents
        .lines()
        .next()
        .map(|line| line.starts_with("#!") && line.contains("python"))
        .unwrap_or(false)
}

fn resolve_import(module: &str, search_path: &[PathBuf]) -> Option<PathBuf> {
    let rel = module.replace('.', "/");
    for dir in search_path {
        let as_module = dir.join(format!("{rel}.py"));
        if as_module.is_file() {
            return Some(as_module);
        }
        let as_package = dir.join(&rel).join("__init__.py");
        if as_package.is_file() {
            return Some(as_package);
        }
    }
    None
}

fn scan_imports(path: &Path) -> HashSet<String> {
    let mut modules = HashSet::new();
    let Ok(contents) = std::fs::read_to_string(path) else {
        return modules;
    };
    for line in contents.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("import ") {
            for part in rest.split(',') {
                let name = part.trim().split_whitespace().next().unwrap_or("");
                if !name.is_empty() {
                    modules.insert(name.to_string());
                }
            }
        } else if let Some(rest) = line.strip_prefix("from ") {
            if let Some((module, _)) = rest.split_once(" import ") {
                let module = module.trim();
                if !module.is_empty() && !module.starts_with('.') {
                    modules.insert(module.to_string());
                }
            }
        }
    }
    modules
}

/// Computes the transitive Python import closure of `entry`, resolving
/// against `search_path`. Always includes `entry` itself.
fn dependency_closure(entry: &Path, search_path: &[PathBuf]) -> HashSet<PathBuf> {
    let mut closure = HashSet::new();
    closure.insert(entry.to_path_buf());

    if !looks_like_python(entry) {
        return closure;
    }

    let mut frontier = vec![entry.to_path_buf()];
    while let Some(current) = frontier.pop() {
        for module in scan_imports(&current) {
            if let Some(resolved) = resolve_import(&module, search_path) {
                if closure.insert(resolved.clone()) {
                    frontier.push(resolved);
                }
            }
        }
    }
    closure
}

struct Program {
    command_path: PathBuf,
    files: HashSet<PathBuf>,
}

/// Watches a set of named programs by the files each transitively depends on.
pub struct ModuleWatcher {
    watcher: FileWatcher,
    search_path: Vec<PathBuf>,
    programs: HashMap<String, Program>,
    file_to_programs: HashMap<PathBuf, HashSet<String>>,
}

impl ModuleWatcher {
    /// `search_path` is consulted, in order, to resolve Python imports.
    pub fn new(search_path: Vec<PathBuf>) -> Result<Self, WatchError> {
        Ok(ModuleWatcher {
            watcher: FileWatcher::new()?,
            search_path,
            programs: HashMap::new(),
            file_to_programs: HashMap::new(),
        })
    }

    /// The descriptor to register with the `Poller`.
    pub fn fd(&self) -> std::os::unix::io::RawFd {
        self.watcher.fd()
    }

    /// Starts tracking `name`, computing its dependency closure now.
    pub fn add(&mut self, name: &str, command_path: PathBuf) {
        let files = dependency_closure(&command_path, &self.search_path);
        debug!(name, files = files.len(), "module watcher resolved dependency closure");

        let paths: Vec<PathBuf> = files.iter().cloned().collect();
        self.watcher.add(&paths, false);

        for file in &files {
            self.file_to_programs
                .entry(file.clone())
                .or_default()
                .insert(name.to_string());
        }

        self.programs.insert(
            name.to_string(),
            Program {
                command_path,
                files,
            },
        );
    }

    /// Stops tracking `name`. Files still depended on by another program
    /// remain watched.
    pub fn remove(&mut self, name: &str) {
        let Some(program) = self.programs.remove(name) else {
            return;
        };
        let mut to_unwatch = Vec::new();
        for file in &program.files {
            if let Some(owners) = self.file_to_programs.get_mut(file) {
                owners.remove(name);
                if owners.is_empty() {
                    self.file_to_programs.remove(file);
                    to_unwatch.push(file.clone());
                }
            }
        }
        if !to_unwatch.is_empty() {
            self.watcher.remove(&to_unwatch);
        }
    }

    /// Reconciles the underlying file watcher with the current program set.
    pub fn commit(&mut self) -> Result<(), WatchError> {
        self.watcher.commit()
    }

    /// Periodic tick, delegated to the underlying file watcher.
    pub fn scan(&mut self) -> Result<(), WatchError> {
        self.watcher.scan()
    }

    /// Drains changed files and de-aggregates them back to the owning
    /// programs: one `(name, command_path, changed_files)` tuple per
    /// affected program.
    pub fn get(
        &mut self,
        timeout: Duration,
        limit: usize,
    ) -> Result<Vec<(String, PathBuf, Vec<PathBuf>)>, WatchError> {
        let changed = self.watcher.get(timeout, limit)?;
        let mut by_program: HashMap<String, Vec<PathBuf>> = HashMap::new();

        for file in changed {
            if let Some(owners) = self.file_to_programs.get(&file) {
                for owner in owners {
                    by_program.entry(owner.clone()).or_default().push(file.clone());
                }
            }
        }

        let mut out: Vec<(String, PathBuf, Vec<PathBuf>)> = by_program
            .into_iter()
            .filter_map(|(name, files)| {
                self.programs
                    .get(&name)
                    .map(|program| (name, program.command_path.clone(), files))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn non_python_program_watches_only_itself() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.sh");
        fs::write(&path, "#!/bin/sh\necho hi\n").unwrap();

        let mut watcher = ModuleWatcher::new(vec![dir.path().to_path_buf()]).unwrap();
        watcher.add("job", path.clone());
        watcher.commit().unwrap();
        watcher.scan().unwrap();

        fs::write(&path, "#!/bin/sh\necho changed\n").unwrap();
        watcher.scan().unwrap();

        let changes = watcher.get(Duration::from_millis(50), 10).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].0, "job");
        assert_eq!(changes[0].2, vec![path]);
    }

    #[test]
    fn python_program_watches_its_imports() {
        let dir = tempdir().unwrap();
        let entry = dir.path().join("main.py");
        let helper = dir.path().join("helper.py");
        fs::write(&helper, "VALUE = 1\n").unwrap();
        fs::write(&entry, "#!/usr/bin/env python3\nimport helper\n").unwrap();

        let mut watcher = ModuleWatcher::new(vec![dir.path().to_path_buf()]).unwrap();
        watcher.add("job", entry.clone());
        watcher.commit().unwrap();
        watcher.scan().unwrap();

        fs::write(&helper, "VALUE = 2\n").unwrap();
        watcher.scan().unwrap();

        let changes = watcher.get(Duration::from_millis(50), 10).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].0, "job");
        assert_eq!(changes[0].2, vec![helper]);
    }

    #[test]
    fn shared_dependency_reports_both_owners() {
        let dir = tempdir().unwrap();
        let shared = dir.path().join("shared.py");
        let a = dir.path().join("a.py");
        let b = dir.path().join("b.py");
        fs::write(&shared, "VALUE = 1\n").unwrap();
        fs::write(&a, "#!/usr/bin/env python3\nimport shared\n").unwrap();
        fs::write(&b, "#!/usr/bin/env python3\nimport shared\n").unwrap();

        let mut watcher = ModuleWatcher::new(vec![dir.path().to_path_buf()]).unwrap();
        watcher.add("a", a.clone());
        watcher.add("b", b.clone());
        watcher.commit().unwrap();
        watcher.scan().unwrap();

        fs::write(&shared, "VALUE = 2\n").unwrap();
        watcher.scan().unwrap();

        let mut changes = watcher.get(Duration::from_millis(50), 10).unwrap();
        changes.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].0, "a");
        assert_eq!(changes[1].0, "b");
    }

    #[test]
    fn remove_stops_reporting_changes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.sh");
        fs::write(&path, "#!/bin/sh\necho hi\n").unwrap();

        let mut watcher = ModuleWatcher::new(vec![dir.path().to_path_buf()]).unwrap();
        watcher.add("job", path.clone());
        watcher.commit().unwrap();
        watcher.scan().unwrap();
        watcher.remove("job");
        watcher.commit().unwrap();

        fs::write(&path, "#!/bin/sh\necho changed\n").unwrap();
        watcher.scan().unwrap();
        assert!(watcher.get(Duration::from_millis(10), 10).unwrap().is_empty());
    }
}
