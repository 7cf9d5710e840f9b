//! Bootloader: initramfs hooks, Limine, UEFI boot entry
//!
//! Kernel parameters come from the active root resolved during
//! partitioning; this phase never inspects the encryption mode directly.

use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};

use super::LIMINE_TEMPLATE;
use crate::context::{InstallContext, SharedContext};
use crate::phase::{Phase, PhaseCore, PhaseResult};
use crate::progress::{PhaseReporter, ProgressSender};
use crate::resilience::{best_effort, fatal};
use crate::storage::partition_number;
use crate::system::SystemHandles;

pub const BOOT_LABEL: &str = "Arch Linux";
const LIMINE_DIR: &str = "/boot/EFI/limine";
const LIMINE_LOADER: &str = "\\EFI\\limine\\BOOTX64.EFI";
const QUIET_PARAMS: &str = "quiet splash loglevel=3 rd.udev.log_priority=3 systemd.show_status=auto";
const MENU_TIMEOUT: &str = "0";
const DEFAULT_ENTRY: &str = "0";
const MENU_COLOR: &str = "6";

pub struct BootPhase {
    core: PhaseCore,
}

impl BootPhase {
    pub const NAME: &'static str = "boot";

    pub fn new(ctx: SharedContext, sys: SystemHandles) -> Self {
        Self {
            core: PhaseCore::new(Self::NAME, "Install the bootloader", ctx, sys),
        }
    }

    fn run(&mut self, report: &PhaseReporter<'_>, warnings: &mut Vec<String>) -> Result<String> {
        let ctx = self.core.ctx.snapshot();
        let root = ctx
            .active_root
            .clone()
            .ok_or_else(|| anyhow!("Root device was not resolved; run partitioning first"))?;
        let fs = self.core.sys.fs.clone();

        report.step("Configuring initramfs", 1, 4);
        fatal(report, "Configuring mkinitcpio", || {
            let conf = self.core.target("/etc/mkinitcpio.conf");
            let content = fs.read_to_string(&conf)?;
            fs.write(&conf, &replace_hooks(&content, root.mkinitcpio_hooks())?)?;
            self.core.chroot("mkinitcpio -P").map(|_| ())
        })?;

        report.step("Installing Limine", 2, 4);
        if best_effort(report, warnings, "BIOS installation skipped", || {
            self.core
                .chroot(&format!("limine bios-install {}", ctx.target_disk))
        })
        .is_some()
        {
            report.output("[OK] Limine BIOS stage installed");
        }
        fatal(report, "Installing Limine EFI loader", || {
            let dir = self.core.target(LIMINE_DIR);
            fs.create_dir_all(&dir)?;
            let loader = self.core.target("/usr/share/limine/BOOTX64.EFI");
            self.core
                .host("cp", &[&loader.to_string_lossy(), &dir.to_string_lossy()])
                .map(|_| ())
        })?;

        report.step("Writing Limine configuration", 3, 4);
        let uuid = {
            let partition = root.partition.as_str();
            fatal(report, "Reading root partition UUID", || {
                let uuid = self.core.host("blkid", &["-s", "UUID", "-o", "value", partition])?;
                if uuid.is_empty() {
                    bail!("blkid returned no UUID for {}", partition);
                }
                Ok(uuid)
            })?
        };
        let params = kernel_params(&ctx, &root.kernel_params(&uuid));
        fatal(report, "Rendering limine.conf", || {
            let template = fs
                .read_to_string(&ctx.asset(LIMINE_TEMPLATE))
                .context("Limine template missing; was bootstrap skipped?")?;
            let rendered = render_limine(&template, &ctx.kernel.to_string(), &params);
            fs.write(&self.core.target(&format!("{}/limine.conf", LIMINE_DIR)), &rendered)
        })?;
        report.output(&format!("Kernel parameters: {}", params));

        report.step("Creating UEFI boot entry", 4, 4);
        fatal(report, "Creating UEFI boot entry", || {
            let efi = ctx
                .efi_partition
                .as_deref()
                .ok_or_else(|| anyhow!("EFI partition is not recorded"))?;
            let number = partition_number(efi)
                .ok_or_else(|| anyhow!("Cannot extract partition number from {}", efi))?;
            self.core
                .chroot(&format!(
                    "efibootmgr --create --disk {} --part {} --label \"{}\" --loader \"{}\" --unicode",
                    ctx.target_disk, number, BOOT_LABEL, LIMINE_LOADER
                ))
                .map(|_| ())
        })?;

        Ok("Bootloader installed".to_string())
    }
}

/// Swap the `HOOKS=` line for `hooks`, keeping everything else
fn replace_hooks(content: &str, hooks: &str) -> Result<String> {
    let mut found = false;
    let lines: Vec<&str> = content
        .lines()
        .map(|line| {
            if line.starts_with("HOOKS=") {
                found = true;
                hooks
            } else {
                line
            }
        })
        .collect();
    if !found {
        bail!("No HOOKS= line in mkinitcpio.conf");
    }
    Ok(lines.join("\n") + "\n")
}

/// Root parameters plus optional AMD P-State and the quiet boot set
fn kernel_params(ctx: &InstallContext, root_params: &str) -> String {
    let mut params = root_params.to_string();
    if let Some(mode) = &ctx.amd_pstate {
        params.push_str(&format!(" amd_pstate={}", mode));
    }
    params.push(' ');
    params.push_str(QUIET_PARAMS);
    params
}

fn render_limine(template: &str, kernel: &str, params: &str) -> String {
    template
        .replace("{{TIMEOUT}}", MENU_TIMEOUT)
        .replace("{{DEFAULT_ENTRY}}", DEFAULT_ENTRY)
        .replace("{{BRANDING}}", BOOT_LABEL)
        .replace("{{COLOR}}", MENU_COLOR)
        .replace("{{KERNEL}}", kernel)
        .replace("{{KERNEL_PARAMS}}", params)
}

impl Phase for BootPhase {
    crate::delegate_phase_core!();

    fn pre_check(&self) -> Result<()> {
        if !self.core.is_mounted() {
            bail!("{:?} is not mounted", self.core.mount_root());
        }
        let boot = self.core.target("/boot");
        if !self
            .core
            .sys
            .runner
            .run("mountpoint", &["-q", &boot.to_string_lossy()])
            .success()
        {
            bail!("{:?} is not mounted", boot);
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
        for file in ["BOOTX64.EFI", "limine.conf"] {
            let path = self.core.target(&format!("{}/{}", LIMINE_DIR, file));
            if !self.core.sys.fs.exists(&path) {
                bail!("{} was not installed", Path::new(LIMINE_DIR).join(file).display());
            }
        }
        self.core.persist()
    }

    fn rollback(&mut self) -> Result<()> {
        self.core.sys.fs.remove_dir_all(&self.core.target(LIMINE_DIR))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::progress_channel;
    use crate::storage::ActiveRoot;
    use crate::system::{FileSystem, MemoryFileSystem, ScriptedRunner};
    use crate::types::EncryptionMode;
    use std::sync::Arc;

    const TEMPLATE: &str = "timeout: {{TIMEOUT}}\n/{{BRANDING}}\n    kernel_path: boot():/vmlinuz-{{KERNEL}}\n    cmdline: {{KERNEL_PARAMS}}\n";
    const MKINITCPIO: &str = "MODULES=()\nHOOKS=(base udev autodetect filesystems fsck)\nCOMPRESSION=\"zstd\"\n";

    fn setup(mode: EncryptionMode) -> (BootPhase, Arc<ScriptedRunner>, Arc<MemoryFileSystem>) {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("blkid", "1111-2222\n");
        let fs = Arc::new(
            MemoryFileSystem::new()
                .with_file("/mnt/etc/mkinitcpio.conf", MKINITCPIO)
                .with_file("/tmp/archstage-install/configs/limine.conf.template", TEMPLATE),
        );
        let ctx = SharedContext::new(InstallContext {
            target_disk: "/dev/sda".into(),
            encryption: mode,
            efi_partition: Some("/dev/sda1".into()),
            root_partition: Some("/dev/sda2".into()),
            active_root: Some(ActiveRoot::resolve(mode, "/dev/sda2")),
            amd_pstate: Some("active".into()),
            ..Default::default()
        });
        let phase = BootPhase::new(ctx, SystemHandles::scripted(runner.clone(), fs.clone()));
        (phase, runner, fs)
    }

    #[test]
    fn test_luks_lvm_kernel_params_and_hooks() {
        let (mut phase, runner, fs) = setup(EncryptionMode::LuksLvm);
        let (tx, _rx) = progress_channel(64);
        let result = phase.execute(&tx);
        assert!(result.success, "{}", result.message);

        let conf = fs.contents("/mnt/boot/EFI/limine/limine.conf").unwrap();
        assert!(conf.contains(
            "cmdline: cryptdevice=UUID=1111-2222:cryptroot root=/dev/archvg/root rootflags=subvol=@ rw amd_pstate=active quiet"
        ));
        assert!(conf.contains("kernel_path: boot():/vmlinuz-linux"));
        assert!(conf.contains("/Arch Linux"));

        let mkinitcpio = fs.contents("/mnt/etc/mkinitcpio.conf").unwrap();
        assert!(mkinitcpio.contains("plymouth encrypt lvm2 filesystems"));
        assert!(mkinitcpio.starts_with("MODULES=()\n"));

        assert_eq!(runner.calls_matching("blkid"), vec!["blkid -s UUID -o value /dev/sda2"]);
        assert!(runner.position("efibootmgr --create --disk /dev/sda --part 1").is_some());
    }

    #[test]
    fn test_plain_root_uses_uuid() {
        let (mut phase, _runner, fs) = setup(EncryptionMode::None);
        let (tx, _rx) = progress_channel(64);
        assert!(phase.execute(&tx).success);
        let conf = fs.contents("/mnt/boot/EFI/limine/limine.conf").unwrap();
        assert!(conf.contains("cmdline: root=UUID=1111-2222 rootflags=subvol=@ rw"));
        assert!(!conf.contains("cryptdevice"));
    }

    #[test]
    fn test_bios_install_failure_is_warning() {
        let (mut phase, runner, _fs) = setup(EncryptionMode::None);
        runner.fail_on("limine bios-install", "no MBR gap");
        let (tx, rx) = progress_channel(64);
        let result = phase.execute(&tx);
        assert!(result.success);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].starts_with("BIOS installation skipped"));
        assert!(
            rx.try_iter()
                .any(|u| u.output_line.starts_with("[WARN] BIOS installation skipped"))
        );
    }

    #[test]
    fn test_missing_uuid_fails_and_rollback_removes_limine() {
        let (mut phase, runner, fs) = setup(EncryptionMode::Luks);
        runner.respond("blkid", "");
        let (tx, _rx) = progress_channel(64);
        let result = phase.execute(&tx);
        assert!(!result.success);
        assert!(result.message.contains("no UUID"));

        fs.put("/mnt/boot/EFI/limine/BOOTX64.EFI", "");
        phase.rollback().unwrap();
        assert!(!fs.exists(Path::new("/mnt/boot/EFI/limine/BOOTX64.EFI")));
    }

    #[test]
    fn test_replace_hooks_requires_line() {
        assert!(replace_hooks("MODULES=()\n", "HOOKS=(base)").is_err());
        assert_eq!(
            replace_hooks("A=1\nHOOKS=(old)\n", "HOOKS=(base)").unwrap(),
            "A=1\nHOOKS=(base)\n"
        );
    }
}
