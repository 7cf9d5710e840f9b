//! Progress reporting from phases to a single consumer
//!
//! Phases push [`ProgressUpdate`]s into a bounded channel while they run. The
//! channel is a `sync_channel`, so a slow consumer applies backpressure: the
//! producing phase blocks once the buffer is full until the consumer drains it.

use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

/// Buffer size of the orchestrator's progress channel
pub const DEFAULT_PROGRESS_CAPACITY: usize = 100;

/// One progress event emitted by a phase.
///
/// Three shapes are used in practice: a step update (`step`, `current`,
/// `total`), a raw output line (`output_line`), and a terminal completion or
/// error update (`is_complete`, optionally `is_error` + `error_msg`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub phase_name: String,
    pub step: String,
    pub output_line: String,
    pub current: u32,
    pub total: u32,
    pub is_complete: bool,
    pub is_error: bool,
    pub error_msg: Option<String>,
}

impl ProgressUpdate {
    /// Render the update as a single human readable line.
    ///
    /// Returns `None` for updates that carry nothing to show.
    pub fn render(&self) -> Option<String> {
        if self.is_error {
            let msg = self.error_msg.as_deref().unwrap_or("unknown error");
            return Some(format!("[{}] ✗ {}", self.phase_name, msg));
        }
        if self.is_complete {
            return Some(format!("[{}] ✓ {}", self.phase_name, self.step));
        }
        if !self.output_line.is_empty() {
            return Some(format!("[{}]   {}", self.phase_name, self.output_line));
        }
        if !self.step.is_empty() {
            return Some(format!(
                "[{}] ({}/{}) {}",
                self.phase_name, self.current, self.total, self.step
            ));
        }
        None
    }
}

/// Create a bounded progress channel with the given capacity
pub fn progress_channel(capacity: usize) -> (ProgressSender, Receiver<ProgressUpdate>) {
    let (tx, rx) = mpsc::sync_channel(capacity);
    (ProgressSender { tx }, rx)
}

/// Producer half of the progress channel.
///
/// Sending blocks while the buffer is full. Once the consumer is gone,
/// updates are dropped so a vanished UI never aborts an installation.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: SyncSender<ProgressUpdate>,
}

impl ProgressSender {
    /// Send an update, blocking while the channel is full
    pub fn send(&self, update: ProgressUpdate) {
        if self.tx.send(update).is_err() {
            debug!("Progress consumer disconnected, dropping update");
        }
    }

    /// Reporter that stamps every update with `phase_name`
    pub fn reporter<'a>(&'a self, phase_name: &str) -> PhaseReporter<'a> {
        PhaseReporter {
            sender: self,
            phase: phase_name.to_string(),
        }
    }
}

/// Convenience wrapper used inside `Phase::execute`.
///
/// Borrowing the sender ties every report to the duration of the execute
/// call; a phase cannot keep emitting after it has returned.
pub struct PhaseReporter<'a> {
    sender: &'a ProgressSender,
    phase: String,
}

impl PhaseReporter<'_> {
    pub fn phase_name(&self) -> &str {
        &self.phase
    }

    /// Announce step `current` of `total`
    pub fn step(&self, step: &str, current: u32, total: u32) {
        info!(phase = %self.phase, "[{}/{}] {}", current, total, step);
        self.sender.send(ProgressUpdate {
            phase_name: self.phase.clone(),
            step: step.to_string(),
            current,
            total,
            ..Default::default()
        });
    }

    /// Forward one line of command output (also written to the log)
    pub fn output(&self, line: &str) {
        info!(phase = %self.phase, "{}", line);
        self.sender.send(ProgressUpdate {
            phase_name: self.phase.clone(),
            output_line: line.to_string(),
            ..Default::default()
        });
    }

    /// Report a non-fatal problem as a `[WARN]` output line
    pub fn warn(&self, message: &str) {
        warn!(phase = %self.phase, "{}", message);
        self.sender.send(ProgressUpdate {
            phase_name: self.phase.clone(),
            output_line: format!("[WARN] {}", message),
            ..Default::default()
        });
    }

    /// Terminal success update
    pub fn complete(&self, message: &str) {
        self.sender.send(ProgressUpdate {
            phase_name: self.phase.clone(),
            step: message.to_string(),
            is_complete: true,
            ..Default::default()
        });
    }

    /// Terminal error update
    pub fn error(&self, err: &anyhow::Error) {
        self.sender.send(ProgressUpdate {
            phase_name: self.phase.clone(),
            is_complete: true,
            is_error: true,
            error_msg: Some(format!("{:#}", err)),
            ..Default::default()
        });
    }
}

/// Run `handle` on every update on a dedicated thread until all senders
/// are dropped.
pub fn spawn_consumer<F>(rx: Receiver<ProgressUpdate>, mut handle: F) -> JoinHandle<()>
where
    F: FnMut(ProgressUpdate) + Send + 'static,
{
    thread::spawn(move || {
        for update in rx {
            handle(update);
        }
        debug!("Progress channel closed");
    })
}
