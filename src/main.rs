//! archstage - Main entry point
//!
//! Headless driver: loads the install config, registers the phases with the
//! orchestrator and prints progress until the run finishes or fails.

use std::path::Path;
use std::process;

use tracing::{debug, error, info, warn};

use archstage::cleanup::{self, CleanupOptions};
use archstage::cli::{Cli, Commands};
use archstage::context::{InstallContext, SharedContext};
use archstage::error::OrchestratorError;
use archstage::logging;
use archstage::orchestrator::Orchestrator;
use archstage::phases::default_phases;
use archstage::process_guard::{self, ProcessGuard};
use archstage::progress::spawn_consumer;
use archstage::system::SystemHandles;

/// Lines of the install log shown after a failure
const LOG_TAIL_LINES: usize = 20;

/// Set ARCHSTAGE_SKIP_ROOT_CHECK=1 to skip
fn should_skip_root_check() -> bool {
    std::env::var("ARCHSTAGE_SKIP_ROOT_CHECK")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn require_root() {
    if should_skip_root_check() {
        warn!("Root check skipped (ARCHSTAGE_SKIP_ROOT_CHECK=1)");
        return;
    }
    if !nix::unistd::geteuid().is_root() {
        eprintln!("✗ archstage must be run as root");
        process::exit(1);
    }
}

fn load_config(path: &Path) -> InstallContext {
    let ctx = match InstallContext::load_from_file(path) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("Failed to load configuration file: {}", e);
            eprintln!("✗ Failed to load configuration file: {}", e);
            process::exit(1);
        }
    };
    if let Err(e) = ctx.validate() {
        error!("Configuration validation failed: {}", e);
        eprintln!("✗ Configuration validation failed: {}", e);
        process::exit(1);
    }
    ctx
}

fn main() {
    let cli = Cli::parse_args();

    if let Err(e) = logging::init(&cli.log, cli.verbose) {
        logging::init_stderr();
        warn!("Logging to {:?} unavailable: {}", cli.log, e);
    }
    info!("archstage {} starting", env!("CARGO_PKG_VERSION"));

    // Children registered with the process guard are terminated on
    // SIGINT/SIGTERM and when the guard drops.
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    let _guard = ProcessGuard::new();
    debug!("Signal handlers initialized");

    match cli.command {
        Commands::Validate { config } => {
            info!("Validating configuration file: {:?}", config);
            load_config(&config);
            info!("Configuration validation successful");
            println!("✓ Configuration file is valid: {:?}", config);
        }
        Commands::Plan { config } => print_plan(&load_config(&config)),
        Commands::Install { config, .. } if cli.dry_run => {
            println!("Dry run: nothing will be executed");
            print_plan(&load_config(&config));
        }
        Commands::Install {
            config,
            state,
            skip,
        } => {
            require_root();
            let mut ctx = load_config(&config);
            ctx.state_path =
                Some(state.unwrap_or_else(|| archstage::context::DEFAULT_STATE_PATH.into()));
            if let Err(e) = run_install(ctx, &skip) {
                report_failure(&e, &cli.log);
                process::exit(1);
            }
        }
        Commands::Cleanup => {
            if cli.dry_run {
                println!("Dry run: cleanup would unmount /mnt, release the root device and remove the state file");
                return;
            }
            require_root();
            let report = cleanup::run(&SystemHandles::live(), &CleanupOptions::default());
            for action in &report.actions {
                println!("✓ {}", action);
            }
            for warning in &report.warnings {
                println!("⚠ {}", warning);
            }
            if report.actions.is_empty() && report.is_clean() {
                println!("Nothing to clean up");
            }
            if !report.is_clean() {
                process::exit(1);
            }
        }
    }
}

fn print_plan(ctx: &InstallContext) {
    println!(
        "Installing to {} ({} encryption, {} kernel)",
        ctx.target_disk, ctx.encryption, ctx.kernel
    );
    let phases = default_phases(SharedContext::new(ctx.clone()), SystemHandles::live());
    for (i, phase) in phases.iter().enumerate() {
        let skippable = if phase.can_skip() { " (skippable)" } else { "" };
        println!(
            "  {}. {:<13} {}{}",
            i + 1,
            phase.name(),
            phase.description(),
            skippable
        );
    }
}

fn run_install(ctx: InstallContext, skip: &[String]) -> Result<(), OrchestratorError> {
    let shared = SharedContext::new(ctx);
    let mut orchestrator = Orchestrator::new();
    for phase in default_phases(shared, SystemHandles::live()) {
        orchestrator.register_phase(phase)?;
    }
    for name in skip {
        orchestrator.skip_phase(name)?;
    }

    let consumer = orchestrator.take_progress_receiver().map(|rx| {
        spawn_consumer(rx, |update| {
            if let Some(line) = update.render() {
                println!("{}", line);
            }
        })
    });

    println!("🚀 Starting installation");
    let result = orchestrator.execute_all();

    let durations: Vec<(String, std::time::Duration)> = orchestrator
        .phases()
        .iter()
        .filter_map(|p| {
            orchestrator
                .phase_durations()
                .get(p.name())
                .map(|d| (p.name().to_string(), *d))
        })
        .collect();
    let (done, total) = orchestrator.progress();

    // Dropping the orchestrator drops the last sender and ends the consumer
    drop(orchestrator);
    if let Some(handle) = consumer {
        if handle.join().is_err() {
            warn!("Progress consumer panicked");
        }
    }

    println!();
    for (name, elapsed) in durations {
        println!("  {:<13} {:.1?}", name, elapsed);
    }
    println!("  {}/{} phases done", done, total);

    result?;
    println!("\n✓ Installation completed successfully! Reboot to start the new system.");
    Ok(())
}

fn report_failure(err: &OrchestratorError, log_path: &Path) {
    error!("Installation failed: {}", err);
    eprintln!();
    match err.phase_name() {
        Some(phase) => eprintln!("✗ Installation failed in phase '{}'", phase),
        None => eprintln!("✗ Installation could not start"),
    }
    eprintln!("  {}", err);

    let tail = logging::tail(log_path, LOG_TAIL_LINES);
    if !tail.is_empty() {
        eprintln!("\nLast {} lines of {}:", tail.len(), log_path.display());
        for line in tail {
            eprintln!("  {}", line);
        }
    }
    eprintln!("\nRun `archstage cleanup` before retrying.");
}
