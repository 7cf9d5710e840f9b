//! Partitioning: GPT layout, root device stack, btrfs subvolumes, mounts
//!
//! The root device is resolved exactly once here (see
//! [`ActiveRoot::resolve`]) and stored in the context. Formatting, mounting,
//! rollback and every later phase use that stored value.

use std::path::Path;

use anyhow::{Result, bail};
use tracing::{debug, info};

use crate::context::SharedContext;
use crate::phase::{Phase, PhaseCore, PhaseResult};
use crate::progress::{PhaseReporter, ProgressSender};
use crate::resilience::fatal;
use crate::storage::{ActiveRoot, DiskLayout, StorageOp};
use crate::system::SystemHandles;

const BTRFS_MOUNT_OPTS: &str = "noatime,compress=zstd";
const SUBVOLUMES: [&str; 2] = ["@", "@home"];

pub struct PartitioningPhase {
    core: PhaseCore,
    /// Teardown for each device this run actually brought up, in build order
    opened: Vec<StorageOp>,
}

impl PartitioningPhase {
    pub const NAME: &'static str = "partitioning";

    pub fn new(ctx: SharedContext, sys: SystemHandles) -> Self {
        Self {
            core: PhaseCore::new(Self::NAME, "Partition, encrypt and mount the target disk", ctx, sys),
            opened: Vec::new(),
        }
    }

    fn run(&mut self, report: &PhaseReporter<'_>) -> Result<String> {
        self.opened.clear();
        let (disk, mode, passphrase) = self
            .core
            .ctx
            .with(|c| (c.target_disk.clone(), c.encryption, c.luks_passphrase().to_string()));
        let mnt = self.core.mount_root();
        let mnt = mnt.to_string_lossy().to_string();

        report.step(&format!("Wiping {}", disk), 1, 6);
        fatal(report, "Wiping disk", || {
            self.core.host("wipefs", &["-af", &disk])?;
            self.core.host("sgdisk", &["--zap-all", &disk]).map(|_| ())
        })?;

        report.step("Creating GPT partitions", 2, 6);
        let layout = DiskLayout::for_disk(&disk);
        fatal(report, "Creating partitions", || {
            self.core.host(
                "sgdisk",
                &[
                    "--clear",
                    "--new=1:0:+512M",
                    "--typecode=1:ef00",
                    "--change-name=1:EFI",
                    "--new=2:0:0",
                    "--typecode=2:8300",
                    "--change-name=2:ROOT",
                    &disk,
                ],
            )?;
            self.core.host("partprobe", &[&disk]).map(|_| ())
        })?;

        let root = ActiveRoot::resolve(mode, &layout.root);
        info!("Root device for mode '{}': {}", mode, root.device);
        self.core.ctx.with_mut(|c| {
            c.efi_partition = Some(layout.efi.clone());
            c.root_partition = Some(layout.root.clone());
            c.active_root = Some(root.clone());
        });
        report.output(&format!("[OK] EFI: {} (512MB)", layout.efi));
        report.output(&format!("[OK] Root: {}", layout.root));

        report.step("Formatting EFI partition", 3, 6);
        fatal(report, "Formatting EFI partition", || {
            self.core.host("wipefs", &["-af", &layout.efi])?;
            self.core
                .host("mkfs.fat", &["-F32", "-n", "EFI", &layout.efi])
                .map(|_| ())
        })?;

        report.step("Preparing root device", 4, 6);
        if root.is_encrypted() {
            fatal(report, "Wiping root partition", || {
                self.core.host("wipefs", &["-af", &root.partition]).map(|_| ())
            })?;
        }
        for op in root.build_ops() {
            report.output(&op.to_string());
            fatal(report, &op.to_string(), || self.run_op(&op, &passphrase))?;
            if let Some(undo) = op.undo() {
                self.opened.push(undo);
            }
        }

        report.step("Creating btrfs subvolumes", 5, 6);
        fatal(report, "Creating subvolumes", || self.create_subvolumes(&root.device, &mnt))?;

        report.step("Mounting target filesystems", 6, 6);
        fatal(report, "Mounting filesystems", || {
            self.mount_all(&root.device, &layout.efi, &mnt)
        })?;

        Ok(format!("{} partitioned and mounted at {}", disk, mnt))
    }

    fn run_op(&self, op: &StorageOp, passphrase: &str) -> Result<()> {
        let (program, args) = op.command();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let runner = &self.core.sys.runner;
        let output = if op.needs_passphrase() {
            runner.run_with_stdin(program, &args, passphrase)
        } else {
            runner.run(program, &args)
        };
        output.ensure_success(&op.to_string())
    }

    fn create_subvolumes(&self, device: &str, mnt: &str) -> Result<()> {
        self.core.sys.fs.create_dir_all(Path::new(mnt))?;
        self.core.host("mount", &[device, mnt])?;
        for subvol in SUBVOLUMES {
            let path = format!("{}/{}", mnt, subvol);
            if let Err(err) = self.core.host("btrfs", &["subvolume", "create", &path]) {
                let _ = self.core.sys.runner.run("umount", &[mnt]);
                return Err(err.context(format!("Creating subvolume {}", subvol)));
            }
        }
        self.core.host("umount", &[mnt]).map(|_| ())
    }

    fn mount_all(&self, device: &str, efi: &str, mnt: &str) -> Result<()> {
        let fs = &self.core.sys.fs;
        let root_opts = format!("{},subvol=@", BTRFS_MOUNT_OPTS);
        self.core.host("mount", &["-o", &root_opts, device, mnt])?;

        let home = format!("{}/home", mnt);
        fs.create_dir_all(Path::new(&home))?;
        let home_opts = format!("{},subvol=@home", BTRFS_MOUNT_OPTS);
        self.core.host("mount", &["-o", &home_opts, device, &home])?;

        let boot = format!("{}/boot", mnt);
        fs.create_dir_all(Path::new(&boot))?;
        self.core.host("mount", &[efi, &boot]).map(|_| ())
    }
}

impl Phase for PartitioningPhase {
    crate::delegate_phase_core!();

    fn pre_check(&self) -> Result<()> {
        let (disk, encrypted, has_passphrase) = self.core.ctx.with(|c| {
            (
                c.target_disk.clone(),
                c.encryption.is_encrypted(),
                !c.luks_passphrase().is_empty(),
            )
        });
        if disk.is_empty() {
            bail!("Target disk not selected");
        }
        if !self.core.sys.fs.exists(Path::new(&disk)) {
            bail!("Target disk {} does not exist", disk);
        }
        if encrypted && !has_passphrase {
            bail!("A password is required for encryption");
        }
        Ok(())
    }

    fn execute(&mut self, progress: &ProgressSender) -> PhaseResult {
        let report = progress.reporter(Self::NAME);
        let outcome = self.run(&report);
        PhaseResult::from_outcome(outcome, Vec::new())
    }

    fn post_check(&mut self) -> Result<()> {
        if !self.core.is_mounted() {
            bail!("{:?} is not mounted", self.core.mount_root());
        }
        self.core.persist()
    }

    /// Unmount in reverse order, then release the devices this run opened.
    ///
    /// Unmount failures are ignored (the path may never have been mounted).
    /// Only devices that were brought up are released, and a failure to
    /// release one of them is reported.
    fn rollback(&mut self) -> Result<()> {
        let mnt = self.core.mount_root();
        for path in [mnt.join("boot"), mnt.join("home"), mnt.clone()] {
            let out = self.core.sys.runner.run("umount", &[&path.to_string_lossy()]);
            if !out.success() {
                debug!("Rollback: umount {:?} skipped: {}", path, out.error.trim());
            }
        }

        let mut failures = Vec::new();
        let opened: Vec<StorageOp> = self.opened.drain(..).rev().collect();
        for op in opened {
            if let Err(err) = self.run_op(&op, "") {
                failures.push(format!("{:#}", err));
            }
        }
        if !failures.is_empty() {
            bail!("{}", failures.join("; "));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InstallContext;
    use crate::progress::progress_channel;
    use crate::system::{MemoryFileSystem, ScriptedRunner};
    use crate::types::EncryptionMode;
    use std::sync::Arc;

    fn setup(mode: EncryptionMode) -> (PartitioningPhase, Arc<ScriptedRunner>) {
        let runner = Arc::new(ScriptedRunner::new());
        let fs = Arc::new(MemoryFileSystem::new().with_file("/dev/nvme0n1", ""));
        let ctx = SharedContext::new(InstallContext {
            target_disk: "/dev/nvme0n1".into(),
            encryption: mode,
            user_password: "hunter2".into(),
            ..Default::default()
        });
        let phase = PartitioningPhase::new(ctx, SystemHandles::scripted(runner.clone(), fs));
        (phase, runner)
    }

    #[test]
    fn test_plain_layout_mounts_raw_partition() {
        let (mut phase, runner) = setup(EncryptionMode::None);
        phase.pre_check().unwrap();
        let (tx, _rx) = progress_channel(64);
        let result = phase.execute(&tx);
        assert!(result.success, "{}", result.message);

        assert!(runner.calls().contains(&"mkfs.btrfs -f -L ROOT /dev/nvme0n1p2".to_string()));
        assert!(runner.calls().contains(
            &"mount -o noatime,compress=zstd,subvol=@ /dev/nvme0n1p2 /mnt".to_string()
        ));
        assert!(runner.calls().contains(&"mount /dev/nvme0n1p1 /mnt/boot".to_string()));
        assert!(runner.calls_matching("cryptsetup").is_empty());

        let ctx = phase.core.ctx.snapshot();
        assert_eq!(ctx.efi_partition.as_deref(), Some("/dev/nvme0n1p1"));
        assert_eq!(ctx.active_root.unwrap().device, "/dev/nvme0n1p2");
    }

    #[test]
    fn test_luks_passphrase_goes_through_stdin() {
        let (mut phase, runner) = setup(EncryptionMode::Luks);
        let (tx, _rx) = progress_channel(64);
        assert!(phase.execute(&tx).success);

        let format = runner.calls_matching("luksFormat");
        assert_eq!(format.len(), 1);
        assert!(!format[0].contains("hunter2"));
        assert_eq!(runner.stdin_for("luksFormat").as_deref(), Some("hunter2"));
        assert_eq!(runner.stdin_for("cryptsetup open").as_deref(), Some("hunter2"));
        assert!(runner.calls().contains(
            &"mount -o noatime,compress=zstd,subvol=@home /dev/mapper/cryptroot /mnt/home".to_string()
        ));
    }

    #[test]
    fn test_subvolume_failure_unmounts_before_returning() {
        let (mut phase, runner) = setup(EncryptionMode::None);
        runner.fail_on("btrfs subvolume create /mnt/@home", "No space left");
        let (tx, _rx) = progress_channel(64);
        let result = phase.execute(&tx);
        assert!(!result.success);
        assert!(result.message.contains("Creating subvolume @home"));

        let create = runner.position("btrfs subvolume create /mnt/@home").unwrap();
        let umount = runner.calls().iter().rposition(|c| c == "umount /mnt").unwrap();
        assert!(umount > create);
    }

    #[test]
    fn test_rollback_skips_container_that_never_opened() {
        let (mut phase, runner) = setup(EncryptionMode::Luks);
        runner.fail_on("mkfs.fat", "unable to open /dev/nvme0n1p1");
        runner.fail_on("cryptsetup close", "Device cryptroot is not active.");
        let (tx, _rx) = progress_channel(64);
        assert!(!phase.execute(&tx).success);

        phase.rollback().unwrap();
        assert!(runner.calls_matching("cryptsetup").is_empty());
    }

    #[test]
    fn test_rollback_releases_only_what_opened() {
        let (mut phase, runner) = setup(EncryptionMode::LuksLvm);
        runner.fail_on("vgcreate", "Physical volume not found");
        let (tx, _rx) = progress_channel(64);
        assert!(!phase.execute(&tx).success);

        phase.rollback().unwrap();
        assert!(runner.calls_matching("vgchange").is_empty());
        assert_eq!(
            runner.calls_matching("cryptsetup close"),
            vec!["cryptsetup close /dev/mapper/cryptroot".to_string()]
        );

        // A second rollback has nothing left to release
        phase.rollback().unwrap();
        assert_eq!(runner.calls_matching("cryptsetup close").len(), 1);
    }

    #[test]
    fn test_pre_check_requires_disk_and_passphrase() {
        let (phase, _runner) = setup(EncryptionMode::Luks);
        phase.core.ctx.with_mut(|c| c.user_password.clear());
        assert!(phase.pre_check().unwrap_err().to_string().contains("password"));

        phase.core.ctx.with_mut(|c| c.target_disk = "/dev/sdz".into());
        assert!(phase.pre_check().unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_post_check_requires_mount() {
        let (mut phase, runner) = setup(EncryptionMode::None);
        runner.fail_on("mountpoint -q /mnt", "");
        assert!(phase.post_check().unwrap_err().to_string().contains("not mounted"));
    }
}
