//! The phase contract
//!
//! A phase is one named, ordered unit of installation work with a fixed
//! lifecycle driven by the orchestrator:
//!
//! ```text
//! Pending --execute--> Running --pre-check err--> Failed
//!                      Running --execute err----> Failed   (rollback attempted)
//!                      Running --post-check err-> Failed
//!                      Running --all ok---------> Completed
//! Pending --skip (only if can_skip)------------> Skipped
//! any     --reset--------------------------------> Pending
//! ```
//!
//! Phases only mutate the machine in `execute` (and undo in `rollback`);
//! `pre_check` must have no side effects.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::context::SharedContext;
use crate::progress::ProgressSender;
use crate::system::SystemHandles;

/// Lifecycle status of a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    /// Completed or Skipped
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

/// Outcome of `Phase::execute`
#[derive(Debug, Default)]
pub struct PhaseResult {
    pub success: bool,
    pub message: String,
    /// Cause of a failed execution
    pub error: Option<anyhow::Error>,
    /// Non-fatal problems (best-effort steps, partially failed batches)
    pub warnings: Vec<String>,
}

impl PhaseResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn failure(error: anyhow::Error) -> Self {
        Self {
            success: false,
            message: format!("{:#}", error),
            error: Some(error),
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    /// Build from the result of a phase body, keeping collected warnings
    pub fn from_outcome(
        outcome: anyhow::Result<String>,
        warnings: Vec<String>,
    ) -> Self {
        match outcome {
            Ok(message) => Self::success(message).with_warnings(warnings),
            Err(err) => Self::failure(err).with_warnings(warnings),
        }
    }

    /// Cause of failure; synthesized if a phase reported failure without one
    pub fn into_error(self) -> anyhow::Error {
        match self.error {
            Some(err) => err,
            None if self.message.is_empty() => anyhow::anyhow!("phase reported failure"),
            None => anyhow::anyhow!(self.message),
        }
    }
}

/// One installation phase.
///
/// Implementations hold their own status; the orchestrator is the only
/// caller of `set_status`.
pub trait Phase: Send {
    /// Unique identifier within an orchestrator
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Validate preconditions without side effects
    fn pre_check(&self) -> anyhow::Result<()>;

    /// Do the work, reporting through `progress` while running
    fn execute(&mut self, progress: &ProgressSender) -> PhaseResult;

    /// Verify the work took effect, then persist the context
    fn post_check(&mut self) -> anyhow::Result<()>;

    /// Best-effort undo after a failed `execute`
    fn rollback(&mut self) -> anyhow::Result<()>;

    fn can_skip(&self) -> bool {
        false
    }

    fn status(&self) -> PhaseStatus;

    fn set_status(&mut self, status: PhaseStatus);
}

/// State shared by every concrete phase: identity, status and collaborators.
pub struct PhaseCore {
    name: &'static str,
    description: &'static str,
    status: PhaseStatus,
    pub ctx: SharedContext,
    pub sys: SystemHandles,
}

impl PhaseCore {
    pub fn new(
        name: &'static str,
        description: &'static str,
        ctx: SharedContext,
        sys: SystemHandles,
    ) -> Self {
        Self {
            name,
            description,
            status: PhaseStatus::Pending,
            ctx,
            sys,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn description(&self) -> &'static str {
        self.description
    }

    pub fn status(&self) -> PhaseStatus {
        self.status
    }

    pub fn set_status(&mut self, status: PhaseStatus) {
        self.status = status;
    }

    /// Mount root of the target system
    pub fn mount_root(&self) -> PathBuf {
        self.ctx.with(|c| c.mount_root.clone())
    }

    /// Path inside the target system
    pub fn target(&self, path: &str) -> PathBuf {
        self.ctx.with(|c| c.target(path))
    }

    /// Persist the shared context; the common tail of every post-check
    pub fn persist(&self) -> anyhow::Result<()> {
        self.ctx.persist(self.sys.fs.as_ref())
    }

    /// Run a host command, failing on a non-zero exit; returns trimmed stdout
    pub fn host(&self, program: &str, args: &[&str]) -> anyhow::Result<String> {
        let label = match args.first() {
            Some(first) => format!("{} {}", program, first),
            None => program.to_string(),
        };
        self.sys.runner.run(program, args).into_stdout(&label)
    }

    /// Run a shell command inside the target system
    pub fn chroot(&self, command: &str) -> anyhow::Result<String> {
        self.sys.chroot.exec(&self.mount_root(), command)
    }

    /// Whether the target root is currently a mount point
    pub fn is_mounted(&self) -> bool {
        let root = self.mount_root();
        self.sys
            .runner
            .run("mountpoint", &["-q", &root.to_string_lossy()])
            .success()
    }
}

/// Implements the identity and status methods of [`Phase`] by delegating
/// to a `core: PhaseCore` field.
#[macro_export]
macro_rules! delegate_phase_core {
    () => {
        fn name(&self) -> &str {
            self.core.name()
        }

        fn description(&self) -> &str {
            self.core.description()
        }

        fn status(&self) -> $crate::phase::PhaseStatus {
            self.core.status()
        }

        fn set_status(&mut self, status: $crate::phase::PhaseStatus) {
            self.core.set_status(status)
        }
    };
}
