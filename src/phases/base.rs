//! Base system: pacstrap and fstab

use std::path::Path;

use anyhow::{Result, bail};

use super::{BASE_PACKAGES, read_package_list};
use crate::context::SharedContext;
use crate::phase::{Phase, PhaseCore, PhaseResult};
use crate::progress::{PhaseReporter, ProgressSender};
use crate::resilience::{best_effort, fatal};
use crate::system::SystemHandles;
use crate::types::CpuVendor;

const HOST_PACMAN_CONF: &str = "/etc/pacman.conf";

pub struct BasePhase {
    core: PhaseCore,
}

impl BasePhase {
    pub const NAME: &'static str = "base";

    pub fn new(ctx: SharedContext, sys: SystemHandles) -> Self {
        Self {
            core: PhaseCore::new(Self::NAME, "Install the base system", ctx, sys),
        }
    }

    fn run(&mut self, report: &PhaseReporter<'_>, warnings: &mut Vec<String>) -> Result<String> {
        report.step("Configuring pacman for faster downloads", 1, 4);
        fatal(report, "Configuring pacman", || {
            self.core
                .host(
                    "sed",
                    &[
                        "-i",
                        "s/^#ParallelDownloads = 5$/ParallelDownloads = 10/",
                        HOST_PACMAN_CONF,
                    ],
                )
                .map(|_| ())
        })?;

        report.step("Detecting CPU vendor", 2, 4);
        let cpuinfo = self.core.sys.fs.read_to_string(Path::new("/proc/cpuinfo"))?;
        let vendor = CpuVendor::from_cpuinfo(&cpuinfo);
        let microcode = vendor.microcode_package().map(str::to_string);
        self.core.ctx.with_mut(|c| {
            c.cpu_vendor = vendor;
            c.microcode = microcode.clone();
        });
        best_effort(report, warnings, "CPU detection", || match &microcode {
            Some(package) => {
                report.output(&format!("[OK] Detected {} CPU, microcode: {}", vendor, package));
                Ok(())
            }
            None => bail!("unknown CPU vendor, no microcode will be installed"),
        });

        report.step("Installing base packages", 3, 4);
        let packages = self.package_set()?;
        report.output(&format!("Installing {} packages...", packages.len()));
        let mnt = self.core.mount_root().to_string_lossy().to_string();
        fatal(report, "Running pacstrap", || {
            let mut args: Vec<&str> = vec!["-K", mnt.as_str()];
            args.extend(packages.iter().map(String::as_str));
            self.core.host("pacstrap", &args).map(|_| ())
        })?;
        report.output(&format!("[OK] Installed {} packages", packages.len()));

        report.step("Generating fstab", 4, 4);
        fatal(report, "Generating fstab", || {
            let fstab = self.core.host("genfstab", &["-U", &mnt])?;
            self.core
                .sys
                .fs
                .append(&self.core.target("/etc/fstab"), &format!("{}\n", fstab))
        })?;

        Ok(format!("Installed {} packages", packages.len()))
    }

    /// Base list plus kernel, microcode and whatever the root device needs
    fn package_set(&self) -> Result<Vec<String>> {
        let (list_path, kernel, microcode, root) = self.core.ctx.with(|c| {
            (
                c.asset(BASE_PACKAGES),
                c.kernel,
                c.microcode.clone(),
                c.active_root.clone(),
            )
        });
        let mut packages = read_package_list(self.core.sys.fs.as_ref(), &list_path)?;
        packages.push(kernel.to_string());
        packages.push(kernel.headers_package());
        packages.extend(microcode);
        if let Some(root) = root {
            packages.extend(root.required_packages().into_iter().map(str::to_string));
        }
        let mut seen = std::collections::HashSet::new();
        packages.retain(|p| seen.insert(p.clone()));
        Ok(packages)
    }
}

impl Phase for BasePhase {
    crate::delegate_phase_core!();

    fn pre_check(&self) -> Result<()> {
        if !self.core.is_mounted() {
            bail!("{:?} is not mounted", self.core.mount_root());
        }
        Ok(())
    }

    fn execute(&mut self, progress: &ProgressSender) -> PhaseResult {
        let report = progress.reporter(Self::NAME);
        let mut warnings = Vec::new();
        let outcome = self.run(&report, &mut warnings);
        PhaseResult::from_outcome(outcome, warnings)
    }

    fn post_check(&mut self) -> Result<()> {
        let fs = &self.core.sys.fs;
        if !fs.is_dir(&self.core.target("/usr")) {
            bail!("{:?} does not exist", self.core.target("/usr"));
        }
        if !fs.exists(&self.core.target("/etc/fstab")) {
            bail!("{:?} was not created", self.core.target("/etc/fstab"));
        }
        self.core.persist()
    }

    /// Nothing to undo here; partitioning rollback or cleanup releases the disk.
    fn rollback(&mut self) -> Result<()> {
        tracing::warn!("Base installation failed, target left mounted for cleanup");
        Ok(())
    }
}
