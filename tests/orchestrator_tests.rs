//! Orchestrator lifecycle tests
//!
//! Spy phases record every lifecycle call into a shared log so ordering,
//! rollback policy and stop-at-first-failure can be asserted from outside.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use archstage::error::{OrchestratorError, PhaseError};
use archstage::orchestrator::Orchestrator;
use archstage::phase::{Phase, PhaseResult, PhaseStatus};
use archstage::progress::{ProgressSender, ProgressUpdate};

// =============================================================================
// Spy phase
// =============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Fail {
    Never,
    PreCheck,
    Execute,
    PostCheck,
}

type CallLog = Arc<Mutex<Vec<String>>>;

struct Spy {
    name: String,
    status: PhaseStatus,
    fail: Fail,
    rollback_fails: bool,
    skippable: bool,
    /// Step updates to send from execute
    steps: u32,
    log: CallLog,
    rollbacks: Arc<AtomicUsize>,
}

impl Spy {
    fn new(name: &str, log: &CallLog) -> Self {
        Self {
            name: name.to_string(),
            status: PhaseStatus::Pending,
            fail: Fail::Never,
            rollback_fails: false,
            skippable: false,
            steps: 0,
            log: Arc::clone(log),
            rollbacks: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn failing(mut self, fail: Fail) -> Self {
        self.fail = fail;
        self
    }

    fn skippable(mut self) -> Self {
        self.skippable = true;
        self
    }

    fn record(&self, call: &str) {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.name, call));
    }
}

impl Phase for Spy {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "spy phase"
    }

    fn pre_check(&self) -> anyhow::Result<()> {
        self.record("pre_check");
        if self.fail == Fail::PreCheck {
            return Err(anyhow!("disk not found"));
        }
        Ok(())
    }

    fn execute(&mut self, progress: &ProgressSender) -> PhaseResult {
        self.record("execute");
        let report = progress.reporter(&self.name);
        for i in 1..=self.steps {
            report.step(&format!("step {}", i), i, self.steps);
        }
        if self.fail == Fail::Execute {
            return PhaseResult::failure(anyhow!("pacstrap exited with 1"));
        }
        PhaseResult::success(format!("{} done", self.name))
    }

    fn post_check(&mut self) -> anyhow::Result<()> {
        self.record("post_check");
        if self.fail == Fail::PostCheck {
            return Err(anyhow!("/mnt/usr missing"));
        }
        Ok(())
    }

    fn rollback(&mut self) -> anyhow::Result<()> {
        self.record("rollback");
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        if self.rollback_fails {
            return Err(anyhow!("umount: target is busy"));
        }
        Ok(())
    }

    fn can_skip(&self) -> bool {
        self.skippable
    }

    fn status(&self) -> PhaseStatus {
        self.status
    }

    fn set_status(&mut self, status: PhaseStatus) {
        self.status = status;
    }
}

fn new_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

fn calls(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn statuses(orch: &Orchestrator) -> Vec<PhaseStatus> {
    orch.phases().iter().map(|p| p.status()).collect()
}

fn orchestrator_with(phases: Vec<Spy>) -> Orchestrator {
    let mut orch = Orchestrator::new();
    for phase in phases {
        orch.register_phase(Box::new(phase)).unwrap();
    }
    orch
}

// =============================================================================
// Registration
// =============================================================================

#[test]
fn test_duplicate_registration_rejected() {
    let log = new_log();
    let mut orch = orchestrator_with(vec![Spy::new("base", &log)]);
    let err = orch
        .register_phase(Box::new(Spy::new("base", &log)))
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::DuplicatePhase(ref n) if n == "base"));
    assert_eq!(orch.phases().len(), 1);
}

#[test]
fn test_registration_order_is_execution_order() {
    let log = new_log();
    let mut orch = orchestrator_with(vec![
        Spy::new("preflight", &log),
        Spy::new("partitioning", &log),
        Spy::new("base", &log),
    ]);
    orch.execute_all().unwrap();

    let executes: Vec<String> = calls(&log)
        .into_iter()
        .filter(|c| c.ends_with(":execute"))
        .collect();
    assert_eq!(
        executes,
        vec!["preflight:execute", "partitioning:execute", "base:execute"]
    );
    assert!(orch.is_complete());
    assert!(!orch.has_failed());
    assert_eq!(orch.progress(), (3, 3));
}

// =============================================================================
// Failure policy
// =============================================================================

#[test]
fn test_stops_at_first_failure() {
    let log = new_log();
    let mut orch = orchestrator_with(vec![
        Spy::new("preflight", &log),
        Spy::new("partitioning", &log).failing(Fail::Execute),
        Spy::new("base", &log),
        Spy::new("config", &log),
    ]);

    let err = orch.execute_all().unwrap_err();
    assert_eq!(err.phase_name(), Some("partitioning"));
    assert_eq!(
        statuses(&orch),
        vec![
            PhaseStatus::Completed,
            PhaseStatus::Failed,
            PhaseStatus::Pending,
            PhaseStatus::Pending,
        ]
    );
    assert!(calls(&log).iter().all(|c| !c.starts_with("base:")));
    assert_eq!(orch.next_phase().map(|p| p.name()), Some("base"));
    assert!(orch.has_failed());
}

#[test]
fn test_execute_failure_rolls_back_once() {
    let log = new_log();
    let spy = Spy::new("partitioning", &log).failing(Fail::Execute);
    let rollbacks = Arc::clone(&spy.rollbacks);
    let mut orch = orchestrator_with(vec![spy]);

    let err = orch.execute_phase("partitioning").unwrap_err();
    match &err {
        OrchestratorError::Phase { phase, source } => {
            assert_eq!(phase, "partitioning");
            assert!(matches!(source, PhaseError::Execution(_)));
            assert!(source.rolled_back());
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
    assert_eq!(
        calls(&log),
        vec![
            "partitioning:pre_check",
            "partitioning:execute",
            "partitioning:rollback"
        ]
    );
    assert!(err.to_string().contains("pacstrap exited with 1"));
}

#[test]
fn test_pre_check_failure_skips_execute_and_rollback() {
    let log = new_log();
    let spy = Spy::new("partitioning", &log).failing(Fail::PreCheck);
    let rollbacks = Arc::clone(&spy.rollbacks);
    let mut orch = orchestrator_with(vec![spy]);

    let err = orch.execute_next().unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Phase {
            source: PhaseError::PreCheck(_),
            ..
        }
    ));
    assert_eq!(calls(&log), vec!["partitioning:pre_check"]);
    assert_eq!(rollbacks.load(Ordering::SeqCst), 0);
    assert_eq!(statuses(&orch), vec![PhaseStatus::Failed]);
    // The failed phase is still the current one
    assert_eq!(orch.current_phase().map(|p| p.name()), Some("partitioning"));
}

#[test]
fn test_post_check_failure_does_not_roll_back() {
    let log = new_log();
    let spy = Spy::new("base", &log).failing(Fail::PostCheck);
    let rollbacks = Arc::clone(&spy.rollbacks);
    let mut orch = orchestrator_with(vec![spy]);

    let err = orch.execute_all().unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Phase {
            source: PhaseError::PostCheck(_),
            ..
        }
    ));
    assert_eq!(rollbacks.load(Ordering::SeqCst), 0);
    assert!(!calls(&log).contains(&"base:rollback".to_string()));
    assert!(err.to_string().contains("post-check failed: /mnt/usr missing"));
}

#[test]
fn test_rollback_failure_keeps_both_messages() {
    let log = new_log();
    let mut spy = Spy::new("partitioning", &log).failing(Fail::Execute);
    spy.rollback_fails = true;
    let mut orch = orchestrator_with(vec![spy]);

    let err = orch.execute_all().unwrap_err();
    let text = err.to_string();
    assert!(text.starts_with("phase 'partitioning'"), "{}", text);
    assert!(text.contains("pacstrap exited with 1"), "{}", text);
    assert!(text.contains("umount: target is busy"), "{}", text);
    assert!(matches!(
        err,
        OrchestratorError::Phase {
            source: PhaseError::Rollback { .. },
            ..
        }
    ));
}

#[test]
fn test_failed_phase_is_not_retried_automatically() {
    let log = new_log();
    let mut orch = orchestrator_with(vec![
        Spy::new("partitioning", &log).failing(Fail::Execute),
        Spy::new("base", &log),
    ]);
    assert!(orch.execute_all().is_err());
    // Failed is not Pending, so the next call moves past it
    orch.execute_all().unwrap();
    let executes = calls(&log)
        .iter()
        .filter(|c| *c == "partitioning:execute")
        .count();
    assert_eq!(executes, 1);
    assert_eq!(
        statuses(&orch),
        vec![PhaseStatus::Failed, PhaseStatus::Completed]
    );
    assert!(!orch.is_complete());
}

// =============================================================================
// Skip, reset, progress
// =============================================================================

#[test]
fn test_skip_rules() {
    let log = new_log();
    let mut orch = orchestrator_with(vec![
        Spy::new("bootstrap", &log).skippable(),
        Spy::new("partitioning", &log),
    ]);

    assert!(matches!(
        orch.skip_phase("partitioning"),
        Err(OrchestratorError::CannotSkip(_))
    ));
    assert_eq!(orch.phase("partitioning").unwrap().status(), PhaseStatus::Pending);

    orch.skip_phase("bootstrap").unwrap();
    assert_eq!(orch.progress(), (1, 2));
    assert_eq!(orch.next_phase().map(|p| p.name()), Some("partitioning"));

    orch.execute_all().unwrap();
    assert!(calls(&log).iter().all(|c| !c.starts_with("bootstrap:")));
    assert!(orch.is_complete());
}

#[test]
fn test_skip_cannot_hide_a_failure() {
    let log = new_log();
    let mut orch = orchestrator_with(vec![
        Spy::new("repos", &log).skippable().failing(Fail::Execute),
    ]);
    assert!(orch.execute_all().is_err());

    let err = orch.skip_phase("repos").unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::NotPending {
            status: PhaseStatus::Failed,
            ..
        }
    ));
    assert_eq!(orch.phase("repos").unwrap().status(), PhaseStatus::Failed);
    assert!(orch.has_failed());
    assert!(!orch.is_complete());
}

#[test]
fn test_skip_only_from_pending() {
    let log = new_log();
    let mut orch = orchestrator_with(vec![
        Spy::new("bootstrap", &log).skippable(),
        Spy::new("repos", &log).skippable(),
    ]);
    orch.execute_phase("bootstrap").unwrap();
    assert!(matches!(
        orch.skip_phase("bootstrap"),
        Err(OrchestratorError::NotPending {
            status: PhaseStatus::Completed,
            ..
        })
    ));

    orch.skip_phase("repos").unwrap();
    assert!(matches!(
        orch.skip_phase("repos"),
        Err(OrchestratorError::NotPending {
            status: PhaseStatus::Skipped,
            ..
        })
    ));
    assert_eq!(orch.phase("bootstrap").unwrap().status(), PhaseStatus::Completed);
    assert_eq!(orch.progress(), (2, 2));
}

#[test]
fn test_reset_returns_all_to_pending() {
    let log = new_log();
    let mut orch = orchestrator_with(vec![
        Spy::new("preflight", &log),
        Spy::new("base", &log).failing(Fail::Execute),
    ]);
    let _ = orch.execute_all();
    orch.reset();

    assert!(statuses(&orch).iter().all(|s| *s == PhaseStatus::Pending));
    assert!(orch.current_phase().is_none());
    assert_eq!(orch.progress(), (0, 2));
    // Reset only touches bookkeeping
    assert_eq!(
        calls(&log)
            .iter()
            .filter(|c| c.ends_with(":rollback"))
            .count(),
        1
    );
}

#[test]
fn test_no_pending_phases() {
    let log = new_log();
    let mut orch = orchestrator_with(vec![Spy::new("preflight", &log)]);
    orch.execute_next().unwrap();
    assert!(matches!(
        orch.execute_next(),
        Err(OrchestratorError::NoPendingPhases)
    ));
    assert!(orch.next_phase().is_none());
    // execute_all with nothing pending is a no-op
    orch.execute_all().unwrap();
}

#[test]
fn test_durations_recorded_for_executed_phases() {
    let log = new_log();
    let mut orch = orchestrator_with(vec![
        Spy::new("bootstrap", &log).skippable(),
        Spy::new("preflight", &log),
        Spy::new("base", &log).failing(Fail::PreCheck),
    ]);
    orch.skip_phase("bootstrap").unwrap();
    let _ = orch.execute_all();

    let durations = orch.phase_durations();
    assert!(durations.contains_key("preflight"));
    assert!(durations.contains_key("base"));
    assert!(!durations.contains_key("bootstrap"));
}

// =============================================================================
// Progress channel
// =============================================================================

#[test]
fn test_progress_updates_and_single_terminal_update() {
    let log = new_log();
    let mut first = Spy::new("preflight", &log);
    first.steps = 3;
    let mut second = Spy::new("base", &log).failing(Fail::Execute);
    second.steps = 2;
    let mut orch = orchestrator_with(vec![first, second]);
    let rx = orch.take_progress_receiver().unwrap();
    assert!(orch.take_progress_receiver().is_none());

    let _ = orch.execute_all();
    drop(orch);
    let updates: Vec<ProgressUpdate> = rx.iter().collect();

    let for_phase = |name: &str| -> Vec<ProgressUpdate> {
        updates
            .iter()
            .filter(|u| u.phase_name == name)
            .cloned()
            .collect()
    };

    let preflight = for_phase("preflight");
    assert_eq!(preflight.len(), 4);
    assert_eq!(preflight[2].current, 3);
    assert_eq!(preflight[2].total, 3);
    assert!(preflight[3].is_complete && !preflight[3].is_error);
    assert_eq!(preflight[3].step, "preflight done");

    let base = for_phase("base");
    assert_eq!(base.len(), 3);
    let terminal: Vec<&ProgressUpdate> = base.iter().filter(|u| u.is_complete).collect();
    assert_eq!(terminal.len(), 1);
    assert!(terminal[0].is_error);
    assert!(
        terminal[0]
            .error_msg
            .as_deref()
            .unwrap()
            .starts_with("phase 'base'")
    );
}

#[test]
fn test_consumer_on_thread_drains_large_run() {
    // More updates than the channel holds; the consumer must keep up
    let log = new_log();
    let phases: Vec<Spy> = (0..5)
        .map(|i| {
            let mut spy = Spy::new(&format!("phase-{}", i), &log);
            spy.steps = 50;
            spy
        })
        .collect();
    let mut orch = orchestrator_with(phases);
    let rx = orch.take_progress_receiver().unwrap();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let consumer = archstage::progress::spawn_consumer(rx, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    orch.execute_all().unwrap();
    drop(orch);
    consumer.join().unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 5 * 51);
}
