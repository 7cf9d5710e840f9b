//! System configuration inside the target: locale, identity, users, zram

use anyhow::{Result, bail};

use crate::context::SharedContext;
use crate::phase::{Phase, PhaseCore, PhaseResult};
use crate::progress::{PhaseReporter, ProgressSender};
use crate::resilience::fatal;
use crate::system::SystemHandles;

const SUDOERS_WHEEL: &str = "%wheel ALL=(ALL:ALL) ALL\n";
const ZRAM_GENERATOR: &str = "[zram0]\nzram-size = min(ram / 2, 4096)\ncompression-algorithm = zstd\n";
const ZRAM_SYSCTL: &str = "vm.swappiness = 180\n\
vm.watermark_boost_factor = 0\n\
vm.watermark_scale_factor = 125\n\
vm.page-cluster = 0\n";

const ZRAM_GENERATOR_PATH: &str = "/etc/systemd/zram-generator.conf";
const ZRAM_SYSCTL_PATH: &str = "/etc/sysctl.d/99-vm-zram-parameters.conf";

pub struct ConfigPhase {
    core: PhaseCore,
}

impl ConfigPhase {
    pub const NAME: &'static str = "config";

    pub fn new(ctx: SharedContext, sys: SystemHandles) -> Self {
        Self {
            core: PhaseCore::new(Self::NAME, "Configure the installed system", ctx, sys),
        }
    }

    fn write(&self, path: &str, contents: &str) -> Result<()> {
        let target = self.core.target(path);
        if let Some(parent) = target.parent() {
            self.core.sys.fs.create_dir_all(parent)?;
        }
        self.core.sys.fs.write(&target, contents)
    }

    fn run(&mut self, report: &PhaseReporter<'_>) -> Result<String> {
        let c = self.core.ctx.snapshot();

        report.step("Setting timezone and locale", 1, 4);
        fatal(report, "Setting timezone", || {
            self.core.chroot(&format!(
                "ln -sf /usr/share/zoneinfo/{} /etc/localtime",
                c.timezone
            ))?;
            self.core.chroot("hwclock --systohc").map(|_| ())
        })?;
        report.output(&format!("[OK] Timezone set to: {}", c.timezone));

        fatal(report, "Setting locale", || {
            self.write("/etc/locale.gen", &format!("{} UTF-8\n", c.locale))?;
            self.core.chroot("locale-gen")?;
            self.write("/etc/locale.conf", &format!("LANG={}\n", c.locale))?;
            if !c.keymap.is_empty() {
                self.write("/etc/vconsole.conf", &format!("KEYMAP={}\n", c.keymap))?;
            }
            Ok(())
        })?;
        report.output(&format!("[OK] Locale set to: {}", c.locale));

        fatal(report, "Setting hostname", || {
            self.write("/etc/hostname", &format!("{}\n", c.hostname))?;
            self.write(
                "/etc/hosts",
                &format!(
                    "127.0.0.1   localhost\n::1         localhost\n127.0.1.1   {0}.localdomain {0}\n",
                    c.hostname
                ),
            )
        })?;
        report.output(&format!("[OK] Hostname set to: {}", c.hostname));

        report.step("Enabling networking", 2, 4);
        fatal(report, "Enabling NetworkManager", || {
            self.core
                .sys
                .chroot
                .enable_service(&self.core.mount_root(), "NetworkManager")
        })?;

        report.step("Creating user account", 3, 4);
        let mnt = self.core.mount_root();
        fatal(report, "Creating user", || {
            self.core
                .chroot(&format!("useradd -m -G wheel -s /bin/bash {}", c.username))?;
            self.core.sys.chroot.exec_with_stdin(
                &mnt,
                "chpasswd",
                &format!("{}:{}", c.username, c.user_password),
            )
        })?;
        if !c.root_password.is_empty() {
            fatal(report, "Setting root password", || {
                self.core.sys.chroot.exec_with_stdin(
                    &mnt,
                    "chpasswd",
                    &format!("root:{}", c.root_password),
                )
            })?;
        }
        fatal(report, "Enabling sudo for wheel", || {
            let path = self.core.target("/etc/sudoers.d/wheel");
            if let Some(parent) = path.parent() {
                self.core.sys.fs.create_dir_all(parent)?;
            }
            self.core.sys.fs.write_mode(&path, SUDOERS_WHEEL, 0o440)
        })?;
        report.output(&format!("[OK] User created: {}", c.username));

        report.step("Configuring zram swap", 4, 4);
        fatal(report, "Configuring zram", || {
            self.write(ZRAM_GENERATOR_PATH, ZRAM_GENERATOR)?;
            self.write(ZRAM_SYSCTL_PATH, ZRAM_SYSCTL)
        })?;

        Ok("System configured".to_string())
    }
}

impl Phase for ConfigPhase {
    crate::delegate_phase_core!();

    fn pre_check(&self) -> Result<()> {
        if !self.core.is_mounted() {
            bail!("{:?} is not mounted", self.core.mount_root());
        }
        let c = self.core.ctx.snapshot();
        if c.hostname.is_empty() {
            bail!("Hostname is required");
        }
        if c.username.is_empty() {
            bail!("Username is required");
        }
        if c.user_password.is_empty() {
            bail!("User password is required");
        }
        if c.timezone.is_empty() {
            bail!("Timezone is required");
        }
        Ok(())
    }

    fn execute(&mut self, progress: &ProgressSender) -> PhaseResult {
        let report = progress.reporter(Self::NAME);
        let outcome = self.run(&report);
        PhaseResult::from_outcome(outcome, Vec::new())
    }

    fn post_check(&mut self) -> Result<()> {
        for path in ["/etc/hostname", "/etc/locale.conf", ZRAM_GENERATOR_PATH] {
            if !self.core.sys.fs.exists(&self.core.target(path)) {
                bail!("{} was not created", path);
            }
        }
        self.core.persist()
    }

    // Everything lives on the target filesystem; partitioning owns its removal.
    fn rollback(&mut self) -> Result<()> {
        Ok(())
    }
}
