//! Scripted collaborators for tests
//!
//! `ScriptedRunner` records every invocation as a single `"program arg..."`
//! line and answers from rules; anything without a rule succeeds with empty
//! output. `MemoryFileSystem` keeps files in a map.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Result, anyhow};

use super::{CommandOutput, CommandRunner, FileSystem};

type Matcher = Box<dyn Fn(&str) -> bool + Send + Sync>;

struct Rule {
    matcher: Matcher,
    response: CommandOutput,
    remaining: Option<usize>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Command runner that answers from rules and records calls
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
    stdins: Mutex<Vec<(String, String)>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_rule(&self, matcher: Matcher, response: CommandOutput, remaining: Option<usize>) {
        lock(&self.rules).push(Rule {
            matcher,
            response,
            remaining,
        });
    }

    /// Succeed with `output` for calls containing `pattern`
    pub fn respond(&self, pattern: &str, output: &str) {
        let pattern = pattern.to_string();
        self.push_rule(
            Box::new(move |line| line.contains(&pattern)),
            CommandOutput::ok(output),
            None,
        );
    }

    /// Fail (exit 1) every call containing `pattern`
    pub fn fail_on(&self, pattern: &str, stderr: &str) {
        let pattern = pattern.to_string();
        self.push_rule(
            Box::new(move |line| line.contains(&pattern)),
            CommandOutput::failed(1, stderr),
            None,
        );
    }

    /// Fail only the first `times` calls containing `pattern`
    pub fn fail_times(&self, pattern: &str, times: usize, stderr: &str) {
        let pattern = pattern.to_string();
        self.push_rule(
            Box::new(move |line| line.contains(&pattern)),
            CommandOutput::failed(1, stderr),
            Some(times),
        );
    }

    /// Fail every call for which `predicate` holds
    pub fn fail_when<F>(&self, predicate: F, stderr: &str)
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.push_rule(Box::new(predicate), CommandOutput::failed(1, stderr), None);
    }

    /// All recorded calls in order
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Recorded calls containing `pattern`
    pub fn calls_matching(&self, pattern: &str) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.contains(pattern))
            .cloned()
            .collect()
    }

    /// Index of the first call containing `pattern`
    pub fn position(&self, pattern: &str) -> Option<usize> {
        lock(&self.calls).iter().position(|c| c.contains(pattern))
    }

    /// Stdin passed to the first call containing `pattern`
    pub fn stdin_for(&self, pattern: &str) -> Option<String> {
        lock(&self.stdins)
            .iter()
            .find(|(call, _)| call.contains(pattern))
            .map(|(_, stdin)| stdin.clone())
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
        lock(&self.stdins).clear();
    }

    fn answer(&self, line: &str) -> CommandOutput {
        let mut rules = lock(&self.rules);
        // Later rules override earlier ones.
        for rule in rules.iter_mut().rev() {
            if rule.remaining == Some(0) || !(rule.matcher)(line) {
                continue;
            }
            if let Some(n) = rule.remaining.as_mut() {
                *n -= 1;
            }
            return rule.response.clone();
        }
        CommandOutput::ok("")
    }
}

fn call_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[&str]) -> CommandOutput {
        let line = call_line(program, args);
        lock(&self.calls).push(line.clone());
        self.answer(&line)
    }

    fn run_with_stdin(&self, program: &str, args: &[&str], stdin: &str) -> CommandOutput {
        let line = call_line(program, args);
        lock(&self.calls).push(line.clone());
        lock(&self.stdins).push((line.clone(), stdin.to_string()));
        self.answer(&line)
    }
}

/// In-memory [`FileSystem`]
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    files: Mutex<BTreeMap<PathBuf, String>>,
    dirs: Mutex<BTreeSet<PathBuf>>,
    modes: Mutex<HashMap<PathBuf, u32>>,
    read_only: Mutex<BTreeSet<PathBuf>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style seed of a file
    pub fn with_file(self, path: impl AsRef<Path>, contents: &str) -> Self {
        self.put(path, contents);
        self
    }

    /// Builder-style seed of a directory
    pub fn with_dir(self, path: impl AsRef<Path>) -> Self {
        lock(&self.dirs).insert(path.as_ref().to_path_buf());
        self
    }

    pub fn put(&self, path: impl AsRef<Path>, contents: &str) {
        lock(&self.files).insert(path.as_ref().to_path_buf(), contents.to_string());
    }

    /// Make writes to `path` fail
    pub fn deny_writes(&self, path: impl AsRef<Path>) {
        lock(&self.read_only).insert(path.as_ref().to_path_buf());
    }

    pub fn contents(&self, path: impl AsRef<Path>) -> Option<String> {
        lock(&self.files).get(path.as_ref()).cloned()
    }

    pub fn mode_of(&self, path: impl AsRef<Path>) -> Option<u32> {
        lock(&self.modes).get(path.as_ref()).copied()
    }

    fn check_writable(&self, path: &Path) -> Result<()> {
        if lock(&self.read_only).contains(path) {
            return Err(anyhow!("Failed to write {:?}: read-only file system", path));
        }
        Ok(())
    }
}

impl FileSystem for MemoryFileSystem {
    fn exists(&self, path: &Path) -> bool {
        lock(&self.files).contains_key(path) || self.is_dir(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        lock(&self.dirs).contains(path)
            || lock(&self.files).keys().any(|p| p != path && p.starts_with(path))
    }

    fn read_to_string(&self, path: &Path) -> Result<String> {
        lock(&self.files)
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("Failed to read {:?}: no such file", path))
    }

    fn write(&self, path: &Path, contents: &str) -> Result<()> {
        self.check_writable(path)?;
        lock(&self.files).insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn append(&self, path: &Path, contents: &str) -> Result<()> {
        self.check_writable(path)?;
        lock(&self.files)
            .entry(path.to_path_buf())
            .or_default()
            .push_str(contents);
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        lock(&self.dirs).insert(path.to_path_buf());
        Ok(())
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        lock(&self.files).retain(|p, _| !p.starts_with(path));
        lock(&self.dirs).retain(|p| !p.starts_with(path));
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        lock(&self.files).remove(path);
        Ok(())
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>> {
        let mut names = BTreeSet::new();
        let files = lock(&self.files);
        let dirs = lock(&self.dirs);
        for p in files.keys().chain(dirs.iter()) {
            if let Ok(rest) = p.strip_prefix(path) {
                if let Some(first) = rest.components().next() {
                    names.insert(first.as_os_str().to_string_lossy().to_string());
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    fn write_mode(&self, path: &Path, contents: &str, mode: u32) -> Result<()> {
        self.write(path, contents)?;
        lock(&self.modes).insert(path.to_path_buf(), mode);
        Ok(())
    }
}
