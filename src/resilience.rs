//! Failure policies for the steps inside a phase
//!
//! Each step of a phase is run under one of three policies:
//!
//! - **fatal**: the error aborts the phase's execute (and triggers rollback).
//! - **best-effort**: the error is reported as a `[WARN]` line and a phase
//!   warning; the phase carries on. Used for cosmetic or optional work
//!   (boot logo, BIOS loader, repo verification).
//! - **batch with fallback**: one batched call for a list of items; if it
//!   fails, each item is retried on its own. Zero successes is fatal, any
//!   success turns the failed items into a warning.
//!
//! None of these retry a failed step a second time under the same policy.

use anyhow::Result;
use tracing::{info, warn};

use crate::error::BatchError;
use crate::progress::PhaseReporter;

/// Run a step whose failure must abort the phase.
///
/// The error is reported as a `[FAIL]` output line and returned with `label`
/// as context.
pub fn fatal<T>(
    reporter: &PhaseReporter<'_>,
    label: &str,
    step: impl FnOnce() -> Result<T>,
) -> Result<T> {
    match step() {
        Ok(value) => Ok(value),
        Err(err) => {
            reporter.output(&format!("[FAIL] {}: {:#}", label, err));
            Err(err.context(label.to_string()))
        }
    }
}

/// Run a step whose failure must not abort the phase.
///
/// On error a `[WARN]` line is emitted, the warning is appended to
/// `warnings`, and `None` is returned.
pub fn best_effort<T>(
    reporter: &PhaseReporter<'_>,
    warnings: &mut Vec<String>,
    label: &str,
    step: impl FnOnce() -> Result<T>,
) -> Option<T> {
    match step() {
        Ok(value) => Some(value),
        Err(err) => {
            let message = format!("{}: {:#}", label, err);
            reporter.warn(&message);
            warnings.push(message);
            None
        }
    }
}

/// Result of a batch that did not fail completely
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub succeeded: Vec<String>,
    /// Items whose individual attempt failed, with the reason
    pub failed: Vec<(String, String)>,
    /// Whether the batched call failed and items were tried one by one
    pub used_fallback: bool,
}

impl BatchOutcome {
    /// Some items failed but at least one went through
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }

    /// Warning naming every failed item, if any failed
    pub fn warning(&self) -> Option<String> {
        if !self.is_partial() {
            return None;
        }
        let names: Vec<&str> = self.failed.iter().map(|(item, _)| item.as_str()).collect();
        Some(format!(
            "{} of {} items failed: {}",
            self.failed.len(),
            self.failed.len() + self.succeeded.len(),
            names.join(", ")
        ))
    }
}

/// Try `batch` on all items at once, falling back to `single` per item.
///
/// - batch succeeds → every item succeeded
/// - batch fails → each item is attempted individually
///   - none succeed → [`BatchError`] listing every item and reason
///   - some succeed → `Ok` with the failures in [`BatchOutcome::failed`]
///
/// An empty item list is a successful no-op.
pub fn batch_with_fallback<B, S>(
    items: &[String],
    batch: B,
    mut single: S,
) -> std::result::Result<BatchOutcome, BatchError>
where
    B: FnOnce(&[String]) -> Result<()>,
    S: FnMut(&str) -> Result<()>,
{
    if items.is_empty() {
        return Ok(BatchOutcome::default());
    }

    let batch_err = match batch(items) {
        Ok(()) => {
            return Ok(BatchOutcome {
                succeeded: items.to_vec(),
                ..Default::default()
            });
        }
        Err(err) => err,
    };
    warn!(
        "Batch of {} items failed ({:#}), retrying individually",
        items.len(),
        batch_err
    );

    let mut outcome = BatchOutcome {
        used_fallback: true,
        ..Default::default()
    };
    for item in items {
        match single(item) {
            Ok(()) => outcome.succeeded.push(item.clone()),
            Err(err) => {
                warn!("Item '{}' failed: {:#}", item, err);
                outcome.failed.push((item.clone(), format!("{:#}", err)));
            }
        }
    }

    if outcome.succeeded.is_empty() {
        return Err(BatchError {
            failed: outcome.failed,
        });
    }
    info!(
        "Fallback installed {} of {} items",
        outcome.succeeded.len(),
        items.len()
    );
    Ok(outcome)
}
