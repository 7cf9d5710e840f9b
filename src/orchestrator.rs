//! Phase orchestrator
//!
//! Owns the ordered list of phases, runs them through their lifecycle one at
//! a time on the caller's thread, and exposes the progress channel.
//!
//! # Failure policy
//!
//! - Pre-check failure: phase `Failed`, nothing to undo, no rollback.
//! - Execute failure: phase `Failed`, `rollback` is called once. If rollback
//!   fails too, both messages end up in the returned error.
//! - Post-check failure: phase `Failed`, **no rollback**. The phase's effects
//!   are left in place for inspection; `archstage cleanup` is the recovery path.
//! - `execute_all` stops at the first failure. Later phases stay `Pending`.
//!   Nothing is retried automatically.

use std::collections::HashMap;
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::error::{OrchestratorError, PhaseError};
use crate::phase::{Phase, PhaseStatus};
use crate::progress::{DEFAULT_PROGRESS_CAPACITY, ProgressSender, ProgressUpdate, progress_channel};

pub struct Orchestrator {
    phases: Vec<Box<dyn Phase>>,
    current: Option<usize>,
    durations: HashMap<String, Duration>,
    progress_tx: ProgressSender,
    progress_rx: Option<Receiver<ProgressUpdate>>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::with_progress_capacity(DEFAULT_PROGRESS_CAPACITY)
    }

    /// Orchestrator whose progress channel buffers `capacity` updates
    pub fn with_progress_capacity(capacity: usize) -> Self {
        let (progress_tx, progress_rx) = progress_channel(capacity);
        Self {
            phases: Vec::new(),
            current: None,
            durations: HashMap::new(),
            progress_tx,
            progress_rx: Some(progress_rx),
        }
    }

    /// Append a phase to the sequence.
    ///
    /// Rejects a phase with a blank name and a name that is already
    /// registered; in both cases the orchestrator is left unchanged.
    pub fn register_phase(&mut self, phase: Box<dyn Phase>) -> Result<(), OrchestratorError> {
        let name = phase.name();
        if name.trim().is_empty() {
            return Err(OrchestratorError::InvalidPhase);
        }
        if self.index_of(name).is_some() {
            return Err(OrchestratorError::DuplicatePhase(name.to_string()));
        }
        debug!("Registered phase '{}'", name);
        self.phases.push(phase);
        Ok(())
    }

    /// All phases in registration order
    pub fn phases(&self) -> &[Box<dyn Phase>] {
        &self.phases
    }

    /// Phase by name
    pub fn phase(&self, name: &str) -> Option<&dyn Phase> {
        self.index_of(name).map(|i| self.phases[i].as_ref())
    }

    /// The phase most recently started, if any
    pub fn current_phase(&self) -> Option<&dyn Phase> {
        self.current
            .and_then(|i| self.phases.get(i))
            .map(|p| p.as_ref())
    }

    /// First `Pending` phase in registration order
    pub fn next_phase(&self) -> Option<&dyn Phase> {
        self.next_index().map(|i| self.phases[i].as_ref())
    }

    fn next_index(&self) -> Option<usize> {
        self.phases
            .iter()
            .position(|p| p.status() == PhaseStatus::Pending)
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name() == name)
    }

    /// Run the named phase through pre-check, execute and post-check.
    pub fn execute_phase(&mut self, name: &str) -> Result<(), OrchestratorError> {
        let idx = self
            .index_of(name)
            .ok_or_else(|| OrchestratorError::UnknownPhase(name.to_string()))?;
        self.run_at(idx)
    }

    /// Run the first pending phase
    pub fn execute_next(&mut self) -> Result<(), OrchestratorError> {
        let idx = self.next_index().ok_or(OrchestratorError::NoPendingPhases)?;
        self.run_at(idx)
    }

    /// Run pending phases in order until none remain or one fails
    pub fn execute_all(&mut self) -> Result<(), OrchestratorError> {
        while let Some(idx) = self.next_index() {
            self.run_at(idx)?;
        }
        info!("All phases finished");
        Ok(())
    }

    fn run_at(&mut self, idx: usize) -> Result<(), OrchestratorError> {
        self.current = Some(idx);
        let started = Instant::now();
        let phase = &mut self.phases[idx];
        let name = phase.name().to_string();

        info!("Starting phase '{}': {}", name, phase.description());
        phase.set_status(PhaseStatus::Running);

        let outcome = run_lifecycle(phase.as_mut(), &self.progress_tx);
        let elapsed = started.elapsed();
        self.durations.insert(name.clone(), elapsed);

        let reporter = self.progress_tx.reporter(&name);
        match outcome {
            Ok(message) => {
                phase.set_status(PhaseStatus::Completed);
                info!("Phase '{}' completed in {:.1?}", name, elapsed);
                reporter.complete(&message);
                Ok(())
            }
            Err(source) => {
                phase.set_status(PhaseStatus::Failed);
                error!("Phase '{}' failed after {:.1?}: {}", name, elapsed, source);
                let err = OrchestratorError::Phase {
                    phase: name.clone(),
                    source,
                };
                reporter.error(&anyhow::anyhow!(err.to_string()));
                Err(err)
            }
        }
    }

    /// Mark a pending phase as skipped; only phases that allow it.
    ///
    /// A phase that already ran, failed or was skipped keeps its status.
    pub fn skip_phase(&mut self, name: &str) -> Result<(), OrchestratorError> {
        let idx = self
            .index_of(name)
            .ok_or_else(|| OrchestratorError::UnknownPhase(name.to_string()))?;
        let phase = &mut self.phases[idx];
        if !phase.can_skip() {
            return Err(OrchestratorError::CannotSkip(name.to_string()));
        }
        if phase.status() != PhaseStatus::Pending {
            return Err(OrchestratorError::NotPending {
                phase: name.to_string(),
                status: phase.status(),
            });
        }
        info!("Skipping phase '{}'", name);
        phase.set_status(PhaseStatus::Skipped);
        Ok(())
    }

    /// Return every phase to `Pending` and clear the current phase.
    ///
    /// Only bookkeeping is reset; nothing a phase did to the machine is undone.
    pub fn reset(&mut self) {
        self.current = None;
        for phase in &mut self.phases {
            phase.set_status(PhaseStatus::Pending);
        }
    }

    /// `(done, total)` where done counts Completed and Skipped phases
    pub fn progress(&self) -> (usize, usize) {
        let done = self.phases.iter().filter(|p| p.status().is_done()).count();
        (done, self.phases.len())
    }

    /// Every phase is Completed or Skipped
    pub fn is_complete(&self) -> bool {
        self.phases.iter().all(|p| p.status().is_done())
    }

    pub fn has_failed(&self) -> bool {
        self.phases
            .iter()
            .any(|p| p.status() == PhaseStatus::Failed)
    }

    /// Wall-clock duration of each phase's last execution
    pub fn phase_durations(&self) -> &HashMap<String, Duration> {
        &self.durations
    }

    /// Additional producer handle for the progress channel
    pub fn progress_sender(&self) -> ProgressSender {
        self.progress_tx.clone()
    }

    /// The single consumer end of the progress channel.
    ///
    /// Returns `None` once taken. The consumer must keep draining while
    /// phases run, or producers block when the buffer fills.
    pub fn take_progress_receiver(&mut self) -> Option<Receiver<ProgressUpdate>> {
        self.progress_rx.take()
    }
}

/// PreCheck → Execute → PostCheck, with rollback only after Execute fails.
fn run_lifecycle(phase: &mut dyn Phase, progress: &ProgressSender) -> Result<String, PhaseError> {
    let name = phase.name().to_string();

    phase.pre_check().map_err(PhaseError::PreCheck)?;

    let result = phase.execute(progress);
    for warning in &result.warnings {
        warn!("Phase '{}' warning: {}", name, warning);
    }
    if !result.success {
        let cause = result.into_error();
        warn!("Phase '{}' execution failed, rolling back", name);
        return match phase.rollback() {
            Ok(()) => Err(PhaseError::Execution(cause)),
            Err(rollback) => {
                error!("Rollback of phase '{}' failed: {:#}", name, rollback);
                Err(PhaseError::Rollback { cause, rollback })
            }
        };
    }
    let message = result.message;

    phase.post_check().map_err(PhaseError::PostCheck)?;
    Ok(message)
}
