//! Collaborators through which phases touch the outside world
//!
//! Phases never spawn processes or touch files directly. They go through
//! three narrow traits so every phase can run against the scripted doubles
//! in [`fake`] in tests.

pub mod chroot;
pub mod command;
pub mod fake;
pub mod fs;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

pub use chroot::ArchChroot;
pub use command::SystemRunner;
pub use fake::{MemoryFileSystem, ScriptedRunner};
pub use fs::OsFileSystem;

/// Captured result of an external command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (`None` if terminated by signal or never started)
    pub exit_code: Option<i32>,
    /// Standard output
    pub output: String,
    /// Standard error, or the spawn failure message
    pub error: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            output: output.into(),
            error: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(exit_code: i32, error: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            output: String::new(),
            error: error.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Check if the command succeeded and return an error if not.
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success() {
            return Ok(());
        }
        let code = self.exit_code.unwrap_or(-1);
        let detail = if self.error.trim().is_empty() {
            self.output.trim()
        } else {
            self.error.trim()
        };
        if detail.is_empty() {
            anyhow::bail!("{} failed (exit code {})", context, code)
        }
        anyhow::bail!("{} failed (exit code {}): {}", context, code, detail)
    }

    /// `ensure_success` and hand back trimmed stdout
    pub fn into_stdout(self, context: &str) -> Result<String> {
        self.ensure_success(context)?;
        Ok(self.output.trim().to_string())
    }
}

/// Runs programs on the live (host) system
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> CommandOutput;

    /// Run with `stdin` piped to the child (passwords, key material)
    fn run_with_stdin(&self, program: &str, args: &[&str], stdin: &str) -> CommandOutput;
}

/// Runs shell commands inside the installed system
pub trait ChrootRunner: Send + Sync {
    /// Run `command` under `bash -c` inside `root` and return stdout
    fn exec(&self, root: &Path, command: &str) -> Result<String>;

    fn exec_with_stdin(&self, root: &Path, command: &str, stdin: &str) -> Result<()>;

    fn install_packages(&self, root: &Path, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        let cmd = format!("pacman -S --noconfirm --needed {}", packages.join(" "));
        self.exec(root, &cmd).map(|_| ())
    }

    fn enable_service(&self, root: &Path, service: &str) -> Result<()> {
        self.exec(root, &format!("systemctl enable {}", service))
            .map(|_| ())
    }
}

/// File system access
pub trait FileSystem: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;
    fn read_to_string(&self, path: &Path) -> Result<String>;
    fn write(&self, path: &Path, contents: &str) -> Result<()>;
    fn append(&self, path: &Path, contents: &str) -> Result<()>;
    fn create_dir_all(&self, path: &Path) -> Result<()>;
    fn remove_dir_all(&self, path: &Path) -> Result<()>;
    fn remove_file(&self, path: &Path) -> Result<()>;
    /// Names of the direct children of `path`, sorted
    fn list_dir(&self, path: &Path) -> Result<Vec<String>>;
    /// Write `contents` to a file created (or reset) with permission `mode`
    fn write_mode(&self, path: &Path, contents: &str, mode: u32) -> Result<()>;
}

/// The collaborator bundle handed to every phase
#[derive(Clone)]
pub struct SystemHandles {
    pub runner: Arc<dyn CommandRunner>,
    pub chroot: Arc<dyn ChrootRunner>,
    pub fs: Arc<dyn FileSystem>,
}

impl SystemHandles {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        chroot: Arc<dyn ChrootRunner>,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        Self { runner, chroot, fs }
    }

    /// Real collaborators: processes in their own group, `arch-chroot`, std fs
    pub fn live() -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new());
        Self {
            chroot: Arc::new(ArchChroot::new(Arc::clone(&runner))),
            runner,
            fs: Arc::new(OsFileSystem),
        }
    }

    /// Scripted doubles sharing one runner for host and chroot commands
    pub fn scripted(runner: Arc<ScriptedRunner>, fs: Arc<MemoryFileSystem>) -> Self {
        let as_runner: Arc<dyn CommandRunner> = runner;
        Self {
            chroot: Arc::new(ArchChroot::new(Arc::clone(&as_runner))),
            runner: as_runner,
            fs,
        }
    }
}
