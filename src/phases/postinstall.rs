//! Post-install polish and the final unmount
//!
//! Cosmetic steps (boot logo, plymouth, snapshots, git settings, themes) and
//! the verification passes are best-effort. Pacman settings, first-boot
//! setup, the Limine hook, the shell files and the unmount are not: a target
//! left mounted would fail the post-check anyway.

use anyhow::{Result, anyhow, bail};

use super::shell::{self, TOOL_THEMES, UserHome};
use super::{FIRST_BOOT_TEMPLATE, asset_url, download};
use crate::context::{InstallContext, SharedContext};
use crate::phase::{Phase, PhaseCore, PhaseResult};
use crate::progress::{PhaseReporter, ProgressSender};
use crate::resilience::{best_effort, fatal};
use crate::system::SystemHandles;

const LIMINE_DIR: &str = "/boot/EFI/limine";
const LIMINE_CONF: &str = "/boot/EFI/limine/limine.conf";
const BOOT_LOGO: &str = "/boot/arch-logo.png";
const PLYMOUTH_THEME: &str = "archstage";
const PLYMOUTH_FILES: [&str; 3] = ["archstage.plymouth", "archstage.script", "logo.png"];
const LIMINE_HOOK: &str = "[Trigger]
Operation = Install
Operation = Upgrade
Type = Package
Target = limine

[Action]
Description = Deploying Limine after upgrade...
When = PostTransaction
Exec = /usr/bin/cp /usr/share/limine/BOOTX64.EFI /boot/EFI/limine/
";

/// First-boot scripts, run once by the first-boot service
const POST_BOOT_DIR: &str = "/usr/local/share/archstage/post-boot";
const POST_BOOT_FILES: [&str; 6] = [
    "logo.txt",
    "all.sh",
    "snapper.sh",
    "ufw.sh",
    "ssh-keygen.sh",
    "blesh.sh",
];
const FIRST_BOOT_SERVICE: &str = "archstage-first-boot.service";

const TOTAL_STEPS: u32 = 11;

pub struct PostInstallPhase {
    core: PhaseCore,
}

impl PostInstallPhase {
    pub const NAME: &'static str = "postinstall";

    pub fn new(ctx: SharedContext, sys: SystemHandles) -> Self {
        Self {
            core: PhaseCore::new(Self::NAME, "Finish and unmount the installed system", ctx, sys),
        }
    }

    fn run(&mut self, report: &PhaseReporter<'_>, warnings: &mut Vec<String>) -> Result<String> {
        let c = self.core.ctx.snapshot();

        report.step("Installing boot logo", 1, TOTAL_STEPS);
        best_effort(report, warnings, "Boot logo", || self.boot_logo(&c));

        report.step("Configuring Plymouth splash screen", 2, TOTAL_STEPS);
        best_effort(report, warnings, "Plymouth", || self.plymouth(&c));

        report.step("Configuring btrfs snapshots", 3, TOTAL_STEPS);
        best_effort(report, warnings, "Snapper", || self.snapshots());

        report.step("Applying git settings", 4, TOTAL_STEPS);
        if c.email.is_empty() {
            report.output("[SKIP] No email configured");
        } else {
            best_effort(report, warnings, "Git settings", || self.git_settings(&c));
        }

        report.step("Configuring pacman", 5, TOTAL_STEPS);
        fatal(report, "Configuring pacman", || {
            let path = self.core.target("/etc/pacman.conf");
            let content = self.core.sys.fs.read_to_string(&path)?;
            self.core.sys.fs.write(&path, &pacman_cosmetics(&content))
        })?;

        report.step("Setting up first-boot service", 6, TOTAL_STEPS);
        fatal(report, "First-boot setup", || self.first_boot(&c))?;
        report.output(&format!(
            "[OK] {} post-boot files downloaded, {} enabled",
            POST_BOOT_FILES.len(),
            FIRST_BOOT_SERVICE
        ));

        report.step("Installing pacman hooks", 7, TOTAL_STEPS);
        fatal(report, "Installing Limine hook", || {
            let dir = self.core.target("/etc/pacman.d/hooks");
            self.core.sys.fs.create_dir_all(&dir)?;
            self.core.sys.fs.write(&dir.join("99-limine.hook"), LIMINE_HOOK)
        })?;

        report.step("Configuring shell environment", 8, TOTAL_STEPS);
        let home = UserHome::new(&self.core, &c.username);
        fatal(report, "Configuring shell environment", || {
            shell::install_shell_files(&self.core, &c, &home)
        })?;
        self.themes(report, warnings, &home);

        report.step("Verifying shell configuration", 9, TOTAL_STEPS);
        best_effort(report, warnings, "Shell verification", || {
            let missing = shell::missing_shell_files(&self.core, &home);
            if !missing.is_empty() {
                bail!("missing {}", missing.join(", "));
            }
            report.output("[OK] Shell configuration and theme files found");
            Ok(())
        });

        report.step("Verifying installation", 10, TOTAL_STEPS);
        best_effort(report, warnings, "Installation verification", || {
            self.verify_installation(&c)?;
            report.output("[OK] Kernel, initramfs, bootloader and network verified");
            Ok(())
        });

        report.step("Unmounting target", 11, TOTAL_STEPS);
        let mnt = self.core.mount_root();
        fatal(report, "Unmounting target", || {
            self.core.host("umount", &["-R", &mnt.to_string_lossy()]).map(|_| ())
        })?;
        if let Some(root) = c.active_root.as_ref() {
            for op in root.teardown_ops() {
                let (program, args) = op.command();
                let args: Vec<&str> = args.iter().map(String::as_str).collect();
                best_effort(report, warnings, &op.to_string(), || {
                    self.core.sys.runner.run(program, &args).ensure_success(program)
                });
            }
        }

        Ok("Installation finished".to_string())
    }

    /// Download the first-boot scripts and install the service that runs them.
    fn first_boot(&self, c: &InstallContext) -> Result<()> {
        let dir = self.core.target(POST_BOOT_DIR);
        self.core.sys.fs.create_dir_all(&dir)?;
        for file in POST_BOOT_FILES {
            download(
                self.core.sys.runner.as_ref(),
                &asset_url(&c.asset_url, &format!("post-boot/{}", file)),
                &dir.join(file),
            )?;
        }
        self.core
            .chroot(&format!("chmod 755 {}/*.sh", POST_BOOT_DIR))?;

        let template = self.core.sys.fs.read_to_string(&c.asset(FIRST_BOOT_TEMPLATE))?;
        let unit = template
            .replace("__ARCHSTAGE_EMAIL__", &c.email)
            .replace("__ARCHSTAGE_USERNAME__", &c.username);
        let systemd = self.core.target("/etc/systemd/system");
        self.core.sys.fs.create_dir_all(&systemd)?;
        self.core
            .sys
            .fs
            .write(&systemd.join(FIRST_BOOT_SERVICE), &unit)?;
        self.core
            .sys
            .chroot
            .enable_service(&self.core.mount_root(), FIRST_BOOT_SERVICE)
    }

    /// Clone the theme and link each CLI tool to it; every failure is a warning.
    fn themes(&self, report: &PhaseReporter<'_>, warnings: &mut Vec<String>, home: &UserHome) {
        if best_effort(report, warnings, "Theme repository", || {
            shell::clone_theme(&self.core, home)
        })
        .is_none()
        {
            return;
        }
        let applied = TOOL_THEMES
            .iter()
            .filter(|theme| {
                best_effort(report, warnings, &format!("{} theme", theme.tool), || {
                    shell::link_tool_theme(&self.core, home, theme)
                })
                .is_some()
            })
            .count();
        report.output(&format!("[OK] Shell environment configured ({} themes applied)", applied));
        best_effort(report, warnings, "Git delta", || {
            shell::configure_delta(&self.core, home)
        });
    }

    /// Boot files present, Limine has a kernel entry, NetworkManager enabled.
    fn verify_installation(&self, c: &InstallContext) -> Result<()> {
        let fs = &self.core.sys.fs;
        let mut problems = Vec::new();
        let expected = [
            ("kernel", format!("/boot/vmlinuz-{}", c.kernel)),
            ("initramfs", format!("/boot/initramfs-{}.img", c.kernel)),
            ("bootloader", format!("{}/BOOTX64.EFI", LIMINE_DIR)),
        ];
        for (what, path) in &expected {
            if !fs.exists(&self.core.target(path)) {
                problems.push(format!("{} missing ({})", what, path));
            }
        }
        match fs.read_to_string(&self.core.target(LIMINE_CONF)) {
            Ok(conf) if conf.contains("kernel_path:") => {}
            Ok(_) => problems.push("limine.conf has no kernel entry".to_string()),
            Err(_) => problems.push("limine.conf missing".to_string()),
        }
        if self.core.chroot("systemctl is-enabled NetworkManager").is_err() {
            problems.push("NetworkManager not enabled".to_string());
        }
        if !problems.is_empty() {
            bail!("{}", problems.join(", "));
        }
        Ok(())
    }

    fn boot_logo(&self, c: &InstallContext) -> Result<()> {
        download(
            self.core.sys.runner.as_ref(),
            &asset_url(&c.asset_url, "branding/arch-logo.png"),
            &self.core.target(BOOT_LOGO),
        )?;
        let path = self.core.target(LIMINE_CONF);
        let content = self.core.sys.fs.read_to_string(&path)?;
        if !content.lines().any(|l| l.trim() == "graphics: yes") {
            bail!("'graphics: yes' not found in limine.conf");
        }
        let updated = content.replacen(
            "graphics: yes",
            "graphics: yes\nwallpaper: boot():/arch-logo.png\nwallpaper_style: centered\nbackdrop: 000000",
            1,
        );
        self.core.sys.fs.write(&path, &updated)
    }

    fn plymouth(&self, c: &InstallContext) -> Result<()> {
        let dir = self
            .core
            .target(&format!("/usr/share/plymouth/themes/{}", PLYMOUTH_THEME));
        for file in PLYMOUTH_FILES {
            download(
                self.core.sys.runner.as_ref(),
                &asset_url(&c.asset_url, &format!("plymouth/{}", file)),
                &dir.join(file),
            )?;
        }
        self.core
            .chroot(&format!("plymouth-set-default-theme {}", PLYMOUTH_THEME))?;
        self.core.chroot("mkinitcpio -P").map(|_| ())
    }

    fn snapshots(&self) -> Result<()> {
        let mnt = self.core.mount_root();
        self.core
            .sys
            .chroot
            .install_packages(&mnt, &["limine-snapper-sync".to_string()])?;
        let conf = self.core.sys.fs.read_to_string(&self.core.target(LIMINE_CONF))?;
        let cmdline = limine_cmdline(&conf)
            .ok_or_else(|| anyhow!("no cmdline entry in limine.conf"))?;
        let defaults = format!(
            "TARGET_OS_NAME=\"Arch Linux\"\n\nESP_PATH=\"/boot\"\n\nKERNEL_CMDLINE[default]=\"{}\"\n\nENABLE_UKI=no\nENABLE_LIMINE_FALLBACK=yes\n\nFIND_BOOTLOADERS=yes\n\nBOOT_ORDER=\"*, *fallback, Snapshots\"\n\nMAX_SNAPSHOT_ENTRIES=5\n\nSNAPSHOT_FORMAT_CHOICE=5\n",
            cmdline
        );
        self.core
            .sys
            .fs
            .write(&self.core.target("/etc/default/limine"), &defaults)?;
        self.core
            .sys
            .chroot
            .enable_service(&mnt, "limine-snapper-sync.service")
    }

    fn git_settings(&self, c: &InstallContext) -> Result<()> {
        for (key, value) in [("user.name", &c.username), ("user.email", &c.email)] {
            self.core.chroot(&format!(
                "su - {} -c \"git config --global {} '{}'\"",
                c.username, key, value
            ))?;
        }
        Ok(())
    }
}

/// Enable Color and ParallelDownloads, add ILoveCandy once
fn pacman_cosmetics(content: &str) -> String {
    let mut out = Vec::new();
    let has_candy = content.contains("ILoveCandy");
    for line in content.lines() {
        match line {
            "#Color" | "Color" => {
                out.push("Color".to_string());
                if !has_candy {
                    out.push("ILoveCandy".to_string());
                }
            }
            "#ParallelDownloads = 5" => out.push("ParallelDownloads = 5".to_string()),
            other => out.push(other.to_string()),
        }
    }
    out.join("\n") + "\n"
}

fn limine_cmdline(conf: &str) -> Option<&str> {
    conf.lines()
        .filter_map(|l| l.trim().strip_prefix("cmdline:"))
        .map(str::trim)
        .next()
}

impl Phase for PostInstallPhase {
    crate::delegate_phase_core!();

    fn pre_check(&self) -> Result<()> {
        if !self.core.is_mounted() {
            bail!("{:?} is not mounted", self.core.mount_root());
        }
        if !self.core.sys.fs.is_dir(&self.core.target("/boot")) {
            bail!("Boot directory not found");
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
        if self.core.is_mounted() {
            bail!("{:?} is still mounted", self.core.mount_root());
        }
        self.core.persist()
    }

    fn rollback(&mut self) -> Result<()> {
        let mnt = self.core.mount_root();
        let _ = self.core.sys.runner.run("umount", &["-R", &mnt.to_string_lossy()]);
        Ok(())
    }
}
