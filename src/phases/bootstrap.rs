//! Bootstrap: fetch package lists and config templates

use anyhow::{Context, Result};

use super::{
    BASE_PACKAGES, CHAOTIC_CONFIG, EXTRA_PACKAGES, FIRST_BOOT_TEMPLATE, LIMINE_TEMPLATE,
    SHELL_TEMPLATES, asset_url, download,
};
use crate::context::SharedContext;
use crate::phase::{Phase, PhaseCore, PhaseResult};
use crate::progress::{PhaseReporter, ProgressSender};
use crate::resilience::fatal;
use crate::system::SystemHandles;

const ASSETS: [&str; 11] = [
    BASE_PACKAGES,
    EXTRA_PACKAGES,
    LIMINE_TEMPLATE,
    CHAOTIC_CONFIG,
    FIRST_BOOT_TEMPLATE,
    SHELL_TEMPLATES[0],
    SHELL_TEMPLATES[1],
    SHELL_TEMPLATES[2],
    SHELL_TEMPLATES[3],
    SHELL_TEMPLATES[4],
    SHELL_TEMPLATES[5],
];

pub struct BootstrapPhase {
    core: PhaseCore,
}

impl BootstrapPhase {
    pub const NAME: &'static str = "bootstrap";

    pub fn new(ctx: SharedContext, sys: SystemHandles) -> Self {
        Self {
            core: PhaseCore::new(Self::NAME, "Download installer assets", ctx, sys),
        }
    }

    fn run(&mut self, report: &PhaseReporter<'_>) -> Result<String> {
        let (base_url, install_dir) = self
            .core
            .ctx
            .with(|c| (c.asset_url.clone(), c.install_dir.clone()));
        let total = ASSETS.len() as u32 + 1;

        report.step("Creating install directory", 1, total);
        self.core.sys.fs.create_dir_all(&install_dir)?;

        for (i, relative) in ASSETS.iter().enumerate() {
            report.step(&format!("Downloading {}", relative), i as u32 + 2, total);
            let url = asset_url(&base_url, relative);
            let dest = install_dir.join(relative);
            fatal(report, &format!("Downloading {}", relative), || {
                download(self.core.sys.runner.as_ref(), &url, &dest)
            })?;
            report.output(&format!("[OK] {}", relative));
        }
        Ok(format!("Downloaded {} assets", ASSETS.len()))
    }
}

impl Phase for BootstrapPhase {
    crate::delegate_phase_core!();

    fn pre_check(&self) -> Result<()> {
        let base_url = self.core.ctx.with(|c| c.asset_url.clone());
        self.core
            .sys
            .runner
            .run("curl", &["-fsI", &base_url])
            .ensure_success("Asset host check")
            .with_context(|| format!("Cannot reach {}", base_url))
    }

    fn execute(&mut self, progress: &ProgressSender) -> PhaseResult {
        let report = progress.reporter(Self::NAME);
        let outcome = self.run(&report);
        PhaseResult::from_outcome(outcome, Vec::new())
    }

    fn post_check(&mut self) -> Result<()> {
        let install_dir = self.core.ctx.with(|c| c.install_dir.clone());
        for relative in ASSETS {
            let path = install_dir.join(relative);
            if !self.core.sys.fs.exists(&path) {
                anyhow::bail!("{:?} was not downloaded", path);
            }
        }
        self.core.persist()
    }

    fn rollback(&mut self) -> Result<()> {
        let install_dir = self.core.ctx.with(|c| c.install_dir.clone());
        self.core.sys.fs.remove_dir_all(&install_dir)
    }

    fn can_skip(&self) -> bool {
        true
    }
}
