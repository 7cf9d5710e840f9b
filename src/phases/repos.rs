//! Repositories: multilib, extra packages, Chaotic-AUR, AUR helper

use std::collections::HashMap;

use anyhow::{Context, Result, anyhow, bail};

use super::{CHAOTIC_CONFIG, EXTRA_PACKAGES, read_package_list};
use crate::context::SharedContext;
use crate::phase::{Phase, PhaseCore, PhaseResult};
use crate::progress::{PhaseReporter, ProgressSender};
use crate::resilience::{batch_with_fallback, best_effort, fatal};
use crate::system::SystemHandles;

const PACMAN_CONF: &str = "/etc/pacman.conf";
const MIRRORLIST_INCLUDE: &str = "Include = /etc/pacman.d/mirrorlist";

/// Settings read from the Chaotic-AUR asset file (`KEY=VALUE` lines)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChaoticConfig {
    pub key_id: String,
    pub keyserver: String,
    pub keyring_url: String,
    pub mirrorlist_url: String,
    pub repo_name: String,
    pub mirrorlist_path: String,
}

impl ChaoticConfig {
    pub fn parse(content: &str) -> Result<Self> {
        let values: HashMap<&str, &str> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(|l| l.split_once('='))
            .map(|(k, v)| (k.trim(), v.trim()))
            .collect();
        let get = |key: &str| -> Result<String> {
            values
                .get(key)
                .filter(|v| !v.is_empty())
                .map(|v| v.to_string())
                .ok_or_else(|| anyhow!("{} missing from Chaotic-AUR config", key))
        };
        Ok(Self {
            key_id: get("CHAOTIC_KEY_ID")?,
            keyserver: get("CHAOTIC_KEYSERVER")?,
            keyring_url: get("CHAOTIC_KEYRING_URL")?,
            mirrorlist_url: get("CHAOTIC_MIRRORLIST_URL")?,
            repo_name: get("CHAOTIC_REPO_NAME")?,
            mirrorlist_path: get("CHAOTIC_MIRRORLIST_PATH")?,
        })
    }

    fn section(&self) -> String {
        format!(
            "\n# Chaotic-AUR repository\n[{}]\nInclude = {}\n",
            self.repo_name, self.mirrorlist_path
        )
    }
}

/// Uncomment `[multilib]` and the Include line right below it.
///
/// Returns `None` if multilib is already enabled.
fn enable_multilib(content: &str) -> Result<Option<String>> {
    if content.lines().any(|l| l.trim() == "[multilib]") {
        return Ok(None);
    }
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    let idx = lines
        .iter()
        .position(|l| l.trim() == "#[multilib]")
        .ok_or_else(|| anyhow!("No [multilib] section in pacman.conf"))?;
    lines[idx] = "[multilib]".to_string();
    if let Some(next) = lines.get_mut(idx + 1) {
        if next.trim() == format!("#{}", MIRRORLIST_INCLUDE) {
            *next = MIRRORLIST_INCLUDE.to_string();
        }
    }
    Ok(Some(lines.join("\n") + "\n"))
}

fn has_section(content: &str, name: &str) -> bool {
    let header = format!("[{}]", name);
    content.lines().any(|l| l.trim() == header)
}

pub struct ReposPhase {
    core: PhaseCore,
    chaotic_repo: Option<String>,
}

impl ReposPhase {
    pub const NAME: &'static str = "repos";

    pub fn new(ctx: SharedContext, sys: SystemHandles) -> Self {
        Self {
            core: PhaseCore::new(Self::NAME, "Configure repositories and extra packages", ctx, sys),
            chaotic_repo: None,
        }
    }

    fn run(&mut self, report: &PhaseReporter<'_>, warnings: &mut Vec<String>) -> Result<String> {
        let c = self.core.ctx.snapshot();
        let fs = self.core.sys.fs.clone();
        let pacman_conf = self.core.target(PACMAN_CONF);

        report.step("Enabling multilib", 1, 4);
        if c.enable_multilib {
            fatal(report, "Enabling multilib", || {
                let content = fs.read_to_string(&pacman_conf)?;
                match enable_multilib(&content)? {
                    Some(updated) => fs.write(&pacman_conf, &updated),
                    None => Ok(()),
                }
            })?;
            report.output("[OK] Multilib enabled");
        } else {
            report.output("[SKIP] Multilib disabled");
        }

        report.step("Installing extra packages", 2, 4);
        let packages = fatal(report, "Reading extra package list", || {
            read_package_list(fs.as_ref(), &c.asset(EXTRA_PACKAGES))
        })?;
        let mnt = self.core.mount_root();
        let chroot = self.core.sys.chroot.clone();
        let outcome = batch_with_fallback(
            &packages,
            |all| chroot.install_packages(&mnt, all),
            |one| chroot.install_packages(&mnt, &[one.to_string()]),
        )
        .map_err(|e| anyhow::Error::new(e).context("Installing extra packages"))?;
        if outcome.is_partial() {
            if let Some(warning) = outcome.warning() {
                report.warn(&warning);
                warnings.push(warning);
            }
            report.output(&format!(
                "[OK] Installed {} of {} extra packages",
                outcome.succeeded.len(),
                packages.len()
            ));
        } else {
            report.output(&format!("[OK] Installed {} extra packages", outcome.succeeded.len()));
        }

        report.step("Configuring Chaotic-AUR", 3, 4);
        if c.enable_chaotic {
            let chaotic = fatal(report, "Reading Chaotic-AUR config", || {
                ChaoticConfig::parse(&fs.read_to_string(&c.asset(CHAOTIC_CONFIG))?)
            })?;
            self.enable_chaotic(report, warnings, &chaotic)?;
            self.chaotic_repo = Some(chaotic.repo_name);
        } else {
            report.output("[SKIP] Chaotic-AUR disabled");
        }

        report.step("Installing AUR helper", 4, 4);
        match c.aur_helper.package() {
            None => report.output("[SKIP] AUR helper disabled"),
            // Helpers are only packaged in Chaotic-AUR
            Some(helper) if !c.enable_chaotic => {
                let message = format!("{} skipped: requires Chaotic-AUR", helper);
                report.warn(&message);
                warnings.push(message);
            }
            Some(helper) => {
                fatal(report, &format!("Installing {}", helper), || {
                    chroot.install_packages(&mnt, &[helper.to_string()])?;
                    self.core
                        .chroot(&format!("su - {} -c '{} --version'", c.username, helper))
                        .map(|_| ())
                })?;
                report.output(&format!("[OK] {} installed", helper));
            }
        }

        Ok("Repositories configured".to_string())
    }

    fn enable_chaotic(
        &self,
        report: &PhaseReporter<'_>,
        warnings: &mut Vec<String>,
        cfg: &ChaoticConfig,
    ) -> Result<()> {
        fatal(report, "Importing Chaotic-AUR key", || {
            self.core.chroot(&format!(
                "pacman-key --recv-key {} --keyserver {}",
                cfg.key_id, cfg.keyserver
            ))?;
            self.core
                .chroot(&format!("pacman-key --lsign-key {}", cfg.key_id))
                .map(|_| ())
        })?;
        fatal(report, "Installing Chaotic-AUR keyring", || {
            self.core
                .chroot(&format!(
                    "pacman -U --noconfirm '{}' '{}'",
                    cfg.keyring_url, cfg.mirrorlist_url
                ))
                .map(|_| ())
        })?;
        fatal(report, "Adding Chaotic-AUR to pacman.conf", || {
            let path = self.core.target(PACMAN_CONF);
            let content = self.core.sys.fs.read_to_string(&path)?;
            if !has_section(&content, &cfg.repo_name) {
                self.core.sys.fs.append(&path, &cfg.section())?;
            }
            self.core.chroot("pacman -Sy --noconfirm").map(|_| ())
        })?;
        best_effort(report, warnings, "Chaotic-AUR verification", || {
            let listing = self.core.chroot(&format!("pacman -Sl {}", cfg.repo_name))?;
            if listing.is_empty() {
                bail!("{} lists no packages", cfg.repo_name);
            }
            Ok(())
        });
        report.output("[OK] Chaotic-AUR enabled");
        Ok(())
    }
}

impl Phase for ReposPhase {
    crate::delegate_phase_core!();

    fn pre_check(&self) -> Result<()> {
        if !self.core.is_mounted() {
            bail!("{:?} is not mounted", self.core.mount_root());
        }
        if !self.core.sys.fs.exists(&self.core.target(PACMAN_CONF)) {
            bail!("pacman.conf not found in target");
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
        let content = self
            .core
            .sys
            .fs
            .read_to_string(&self.core.target(PACMAN_CONF))
            .context("Failed to read pacman.conf")?;
        if self.core.ctx.with(|c| c.enable_multilib) && !has_section(&content, "multilib") {
            bail!("multilib was not enabled in pacman.conf");
        }
        if let Some(repo) = &self.chaotic_repo {
            if !has_section(&content, repo) {
                bail!("{} was not added to pacman.conf", repo);
            }
        }
        self.core.persist()
    }

    fn rollback(&mut self) -> Result<()> {
        tracing::warn!("Repository configuration failed; pacman.conf left as is");
        Ok(())
    }
}
