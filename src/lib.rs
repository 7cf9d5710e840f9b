//! archstage Library
//!
//! Installation phases, the orchestrator that drives them, and the system
//! collaborators they run commands and touch files through.

pub mod cleanup;
pub mod cli;
pub mod context;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod phase;
pub mod phases;
pub mod process_guard;
pub mod progress;
pub mod resilience;
pub mod storage;
pub mod system;
pub mod types;

// Re-export main types for convenience
pub use context::{InstallContext, SharedContext};
pub use error::{BatchError, InstallError, OrchestratorError, PhaseError};
pub use orchestrator::Orchestrator;
pub use phase::{Phase, PhaseCore, PhaseResult, PhaseStatus};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use progress::{PhaseReporter, ProgressSender, ProgressUpdate, progress_channel};
pub use storage::{ActiveRoot, DiskLayout, StorageOp};
pub use system::{ChrootRunner, CommandOutput, CommandRunner, FileSystem, SystemHandles};
pub use types::{AurHelper, CpuVendor, EncryptionMode, Kernel};
