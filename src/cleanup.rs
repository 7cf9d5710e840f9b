//! Recovery after an interrupted or failed install
//!
//! `archstage cleanup` returns the live system to a state where a fresh
//! install can start: target unmounted, root device stack released, swap
//! off, stray installer processes gone, state file removed. Every step
//! checks before acting, so running it twice is harmless, and no single
//! failure stops the rest.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::process_guard;
use crate::storage::{CRYPT_MAPPER_NAME, VOLUME_GROUP};
use crate::system::SystemHandles;

/// What cleanup acts on
#[derive(Debug, Clone)]
pub struct CleanupOptions {
    pub mount_root: PathBuf,
    pub state_path: Option<PathBuf>,
    /// How long a stray process gets between SIGTERM and SIGKILL
    pub kill_grace: Duration,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            mount_root: PathBuf::from("/mnt"),
            state_path: Some(PathBuf::from(crate::context::DEFAULT_STATE_PATH)),
            kill_grace: Duration::from_secs(2),
        }
    }
}

/// Actions taken and steps that did not succeed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub actions: Vec<String>,
    pub warnings: Vec<String>,
}

impl CleanupReport {
    fn action(&mut self, msg: String) {
        info!("{}", msg);
        self.actions.push(msg);
    }

    fn warn(&mut self, msg: String) {
        warn!("{}", msg);
        self.warnings.push(msg);
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Run every cleanup step in order
pub fn run(sys: &SystemHandles, opts: &CleanupOptions) -> CleanupReport {
    info!("Starting cleanup");
    let mut report = CleanupReport::default();

    unmount_target(sys, &opts.mount_root, &mut report);
    release_root_device(sys, &mut report);
    disable_swap(sys, &mut report);
    stop_stray_processes(sys, opts.kill_grace, &mut report);
    remove_state(sys, opts.state_path.as_deref(), &mut report);

    let _ = sys.runner.run("sync", &[]);
    info!(
        "Cleanup finished: {} actions, {} warnings",
        report.actions.len(),
        report.warnings.len()
    );
    report
}

fn is_mounted(sys: &SystemHandles, path: &str) -> bool {
    sys.runner.run("mountpoint", &["-q", path]).success()
}

fn unmount_target(sys: &SystemHandles, mnt: &Path, report: &mut CleanupReport) {
    for path in [mnt.join("boot"), mnt.join("home"), mnt.to_path_buf()] {
        let path = path.to_string_lossy().to_string();
        if !is_mounted(sys, &path) {
            continue;
        }
        if sys.runner.run("umount", &["-R", &path]).success() {
            report.action(format!("Unmounted {}", path));
            continue;
        }
        let lazy = sys.runner.run("umount", &["-R", "-l", &path]);
        if lazy.success() {
            report.action(format!("Lazily unmounted {}", path));
        } else {
            report.warn(format!("Failed to unmount {}: {}", path, lazy.error.trim()));
        }
    }
}

fn release_root_device(sys: &SystemHandles, report: &mut CleanupReport) {
    let vg_dir = format!("/dev/{}", VOLUME_GROUP);
    if sys.fs.exists(Path::new(&vg_dir)) {
        let out = sys.runner.run("vgchange", &["-an", VOLUME_GROUP]);
        if out.success() {
            report.action(format!("Deactivated volume group {}", VOLUME_GROUP));
        } else {
            report.warn(format!(
                "Failed to deactivate {}: {}",
                VOLUME_GROUP,
                out.error.trim()
            ));
        }
    }

    let mut mappings = Vec::new();
    if sys
        .fs
        .exists(Path::new(&format!("/dev/mapper/{}", CRYPT_MAPPER_NAME)))
    {
        mappings.push(CRYPT_MAPPER_NAME.to_string());
    }
    let listing = sys.runner.run("dmsetup", &["ls", "--target", "crypt"]);
    if listing.success() {
        for name in listing
            .output
            .lines()
            .filter_map(|l| l.split_whitespace().next())
        {
            // "No devices found" is dmsetup's way of saying nothing is open
            if name == "No" || mappings.iter().any(|m| m == name) {
                continue;
            }
            mappings.push(name.to_string());
        }
    }

    for name in mappings {
        let out = sys.runner.run("cryptsetup", &["close", &name]);
        if out.success() {
            report.action(format!("Closed dm-crypt mapping {}", name));
        } else {
            report.warn(format!("Failed to close {}: {}", name, out.error.trim()));
        }
    }
}

fn disable_swap(sys: &SystemHandles, report: &mut CleanupReport) {
    let active = sys.runner.run("swapon", &["--show"]);
    if !active.success() || active.output.trim().is_empty() {
        return;
    }
    if sys.runner.run("swapoff", &["-a"]).success() {
        report.action("Disabled swap".to_string());
    } else {
        report.warn("Failed to disable swap".to_string());
    }
}

fn stop_stray_processes(sys: &SystemHandles, grace: Duration, report: &mut CleanupReport) {
    // pgrep exits 1 when nothing matches
    let found = sys.runner.run("pgrep", &["-f", "pacstrap|arch-chroot"]);
    if !found.success() {
        return;
    }
    for pid in found
        .output
        .split_whitespace()
        .filter_map(|p| p.parse::<u32>().ok())
    {
        if pid == std::process::id() {
            continue;
        }
        if process_guard::terminate_pid(pid, grace) {
            report.action(format!("Terminated stray process {}", pid));
        } else {
            report.warn(format!("Process {} survived SIGKILL", pid));
        }
    }
}

fn remove_state(sys: &SystemHandles, state_path: Option<&Path>, report: &mut CleanupReport) {
    let Some(path) = state_path else {
        return;
    };
    if !sys.fs.exists(path) {
        return;
    }
    match sys.fs.remove_file(path) {
        Ok(()) => report.action(format!("Removed state file {:?}", path)),
        Err(e) => report.warn(format!("Failed to remove {:?}: {:#}", path, e)),
    }
}
