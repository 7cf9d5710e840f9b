//! Commands inside the target system via `arch-chroot`

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use super::{ChrootRunner, CommandRunner};

/// [`ChrootRunner`] that wraps each command in `arch-chroot <root> bash -c`
#[derive(Clone)]
pub struct ArchChroot {
    runner: Arc<dyn CommandRunner>,
}

impl ArchChroot {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl ChrootRunner for ArchChroot {
    fn exec(&self, root: &Path, command: &str) -> Result<String> {
        let root = root.to_string_lossy();
        self.runner
            .run("arch-chroot", &[&root, "bash", "-c", command])
            .into_stdout(&format!("chroot command '{}'", command))
    }

    fn exec_with_stdin(&self, root: &Path, command: &str, stdin: &str) -> Result<()> {
        let root = root.to_string_lossy();
        self.runner
            .run_with_stdin("arch-chroot", &[&root, "bash", "-c", command], stdin)
            .ensure_success(&format!("chroot command '{}'", command))
    }
}
