//! Preflight: verify the live environment and fill in defaults
//!
//! Refuses to run anywhere but a vanilla x86_64 Arch ISO booted in UEFI
//! mode with Secure Boot off, and with every tool the later phases call.

use std::path::Path;

use anyhow::{Result, bail};
use tracing::debug;

use crate::context::SharedContext;
use crate::phase::{Phase, PhaseCore, PhaseResult};
use crate::progress::ProgressSender;
use crate::system::SystemHandles;

const DEFAULT_HOSTNAME: &str = "archstage";
const DEFAULT_TIMEZONE: &str = "UTC";

const DERIVATIVE_MARKERS: &[(&str, &str)] = &[
    ("/etc/cachyos-release", "CachyOS"),
    ("/etc/eos-release", "EndeavourOS"),
    ("/etc/garuda-release", "Garuda"),
    ("/etc/manjaro-release", "Manjaro"),
];

/// Binaries the installer calls on the host, with the package providing them
const REQUIRED_BINARIES: &[(&str, &str)] = &[
    ("sgdisk", "gptfdisk"),
    ("wipefs", "util-linux"),
    ("mkfs.fat", "dosfstools"),
    ("mkfs.btrfs", "btrfs-progs"),
    ("cryptsetup", "cryptsetup"),
    ("pacstrap", "arch-install-scripts"),
    ("arch-chroot", "arch-install-scripts"),
    ("genfstab", "arch-install-scripts"),
    ("curl", "curl"),
];

pub struct PreflightPhase {
    core: PhaseCore,
}

impl PreflightPhase {
    pub const NAME: &'static str = "preflight";

    pub fn new(ctx: SharedContext, sys: SystemHandles) -> Self {
        Self {
            core: PhaseCore::new(Self::NAME, "Check the live environment", ctx, sys),
        }
    }

    fn missing_binaries(&self) -> Vec<String> {
        REQUIRED_BINARIES
            .iter()
            .filter(|(bin, _)| !self.core.sys.runner.run("which", &[*bin]).success())
            .map(|(bin, pkg)| format!("{} (pacman -S {})", bin, pkg))
            .collect()
    }
}

impl Phase for PreflightPhase {
    crate::delegate_phase_core!();

    fn pre_check(&self) -> Result<()> {
        let fs = self.core.sys.fs.as_ref();
        if !fs.exists(Path::new("/etc/arch-release")) {
            bail!("Must be running on Arch Linux or the Arch ISO");
        }
        for (marker, distro) in DERIVATIVE_MARKERS {
            if fs.exists(Path::new(marker)) {
                bail!("Must be vanilla Arch (detected {})", distro);
            }
        }

        let arch = self.core.host("uname", &["-m"])?;
        if arch != "x86_64" {
            bail!("Must be x86_64 architecture (detected: {})", arch);
        }

        if !fs.exists(Path::new("/sys/firmware/efi/efivars")) {
            bail!("Must be booted in UEFI mode (legacy BIOS not supported)");
        }

        // bootctl exits non-zero without an ESP; only an explicit report counts
        let bootctl = self.core.sys.runner.run("bootctl", &["status"]);
        if bootctl.success() && bootctl.output.contains("Secure Boot: enabled") {
            bail!("Secure Boot must be disabled");
        }

        let missing = self.missing_binaries();
        if !missing.is_empty() {
            bail!("Missing required binaries: {}", missing.join(", "));
        }
        Ok(())
    }

    fn execute(&mut self, progress: &ProgressSender) -> PhaseResult {
        let report = progress.reporter(Self::NAME);
        report.step("Applying defaults", 1, 1);
        self.core.ctx.with_mut(|c| {
            if c.hostname.trim().is_empty() {
                debug!("No hostname configured, using {}", DEFAULT_HOSTNAME);
                c.hostname = DEFAULT_HOSTNAME.to_string();
            }
            if c.timezone.trim().is_empty() {
                c.timezone = DEFAULT_TIMEZONE.to_string();
            }
        });
        PhaseResult::success("Preflight checks passed")
    }

    fn post_check(&mut self) -> Result<()> {
        let snapshot = self.core.ctx.snapshot();
        if snapshot.username.is_empty() {
            bail!("Username is required");
        }
        if snapshot.hostname.is_empty() {
            bail!("Hostname is required");
        }
        if snapshot.timezone.is_empty() {
            bail!("Timezone is required");
        }
        self.core.persist()
    }

    fn rollback(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InstallContext;
    use crate::progress::progress_channel;
    use crate::system::{MemoryFileSystem, ScriptedRunner};
    use std::sync::Arc;

    fn arch_iso() -> MemoryFileSystem {
        MemoryFileSystem::new()
            .with_file("/etc/arch-release", "")
            .with_dir("/sys/firmware/efi/efivars")
    }

    fn phase(fs: MemoryFileSystem, runner: Arc<ScriptedRunner>, ctx: InstallContext) -> PreflightPhase {
        runner.respond("uname -m", "x86_64\n");
        PreflightPhase::new(
            SharedContext::new(ctx),
            SystemHandles::scripted(runner, Arc::new(fs)),
        )
    }

    #[test]
    fn test_vanilla_uefi_passes() {
        let p = phase(arch_iso(), Arc::new(ScriptedRunner::new()), InstallContext::default());
        p.pre_check().unwrap();
    }

    #[test]
    fn test_derivative_rejected() {
        let fs = arch_iso().with_file("/etc/manjaro-release", "");
        let p = phase(fs, Arc::new(ScriptedRunner::new()), InstallContext::default());
        assert!(p.pre_check().unwrap_err().to_string().contains("Manjaro"));
    }

    #[test]
    fn test_secure_boot_rejected() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("bootctl status", "  Secure Boot: enabled (user)\n");
        let p = phase(arch_iso(), runner, InstallContext::default());
        assert!(p.pre_check().unwrap_err().to_string().contains("Secure Boot"));
    }

    #[test]
    fn test_bios_and_arch_rejected() {
        let fs = MemoryFileSystem::new().with_file("/etc/arch-release", "");
        let p = phase(fs, Arc::new(ScriptedRunner::new()), InstallContext::default());
        assert!(p.pre_check().unwrap_err().to_string().contains("UEFI"));

        let runner = Arc::new(ScriptedRunner::new());
        let p = phase(arch_iso(), runner.clone(), InstallContext::default());
        runner.respond("uname -m", "aarch64");
        assert!(p.pre_check().unwrap_err().to_string().contains("aarch64"));
    }

    #[test]
    fn test_missing_binary_named_with_package() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail_on("which pacstrap", "");
        let p = phase(arch_iso(), runner, InstallContext::default());
        let err = p.pre_check().unwrap_err().to_string();
        assert!(err.contains("pacstrap (pacman -S arch-install-scripts)"));
    }

    #[test]
    fn test_defaults_then_username_required() {
        let mut p = phase(arch_iso(), Arc::new(ScriptedRunner::new()), InstallContext::default());
        let (tx, _rx) = progress_channel(8);
        assert!(p.execute(&tx).success);
        assert_eq!(p.core.ctx.with(|c| c.hostname.clone()), "archstage");
        assert_eq!(p.core.ctx.with(|c| c.timezone.clone()), "UTC");
        assert!(p.post_check().unwrap_err().to_string().contains("Username"));
    }
}
