//! Concrete installation phases
//!
//! Every phase embeds a [`PhaseCore`](crate::phase::PhaseCore) and runs its
//! body as a sequence of steps under the policies in
//! [`resilience`](crate::resilience). [`default_phases`] returns them in
//! installation order.

pub mod base;
pub mod boot;
pub mod bootstrap;
pub mod partitioning;
pub mod postinstall;
pub mod preflight;
pub mod repos;
pub mod shell;
pub mod sysconfig;

use std::path::Path;

use anyhow::{Context, Result};

use crate::context::SharedContext;
use crate::phase::Phase;
use crate::system::{CommandRunner, FileSystem, SystemHandles};

pub use base::BasePhase;
pub use boot::BootPhase;
pub use bootstrap::BootstrapPhase;
pub use partitioning::PartitioningPhase;
pub use postinstall::PostInstallPhase;
pub use preflight::PreflightPhase;
pub use repos::ReposPhase;
pub use sysconfig::ConfigPhase;

/// Downloaded asset paths, relative to the install dir and the asset URL
pub const BASE_PACKAGES: &str = "base.packages";
pub const EXTRA_PACKAGES: &str = "extra.packages";
pub const LIMINE_TEMPLATE: &str = "configs/limine.conf.template";
pub const CHAOTIC_CONFIG: &str = "configs/chaotic-aur.conf";
pub const FIRST_BOOT_TEMPLATE: &str = "post-boot/archstage-first-boot.service";
/// Shell templates; `bashrc` becomes the user's `.bashrc`
pub const SHELL_TEMPLATES: [&str; 6] = [
    "configs/shell/shell",
    "configs/shell/init",
    "configs/shell/aliases",
    "configs/shell/envs",
    "configs/shell/rc",
    "configs/shell/bashrc",
];

/// All phases, in the order they must run
pub fn default_phases(ctx: SharedContext, sys: SystemHandles) -> Vec<Box<dyn Phase>> {
    vec![
        Box::new(BootstrapPhase::new(ctx.clone(), sys.clone())),
        Box::new(PreflightPhase::new(ctx.clone(), sys.clone())),
        Box::new(PartitioningPhase::new(ctx.clone(), sys.clone())),
        Box::new(BasePhase::new(ctx.clone(), sys.clone())),
        Box::new(ConfigPhase::new(ctx.clone(), sys.clone())),
        Box::new(BootPhase::new(ctx.clone(), sys.clone())),
        Box::new(ReposPhase::new(ctx.clone(), sys.clone())),
        Box::new(PostInstallPhase::new(ctx, sys)),
    ]
}

/// Package names from a list file: one per line, `#` comments and blank
/// lines ignored
pub fn read_package_list(fs: &dyn FileSystem, path: &Path) -> Result<Vec<String>> {
    let content = fs
        .read_to_string(path)
        .with_context(|| format!("Failed to read package list {:?}", path))?;
    Ok(parse_package_list(&content))
}

fn parse_package_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Fetch `url` to `dest` with curl, creating parent directories
pub fn download(runner: &dyn CommandRunner, url: &str, dest: &Path) -> Result<()> {
    let dest = dest.to_string_lossy();
    runner
        .run("curl", &["-fsSL", "--create-dirs", "-o", &dest, url])
        .ensure_success(&format!("Download of {}", url))
}

/// Join the asset base URL and a relative asset path
pub fn asset_url(base: &str, relative: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), relative)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InstallContext;
    use crate::system::{MemoryFileSystem, ScriptedRunner};
    use std::sync::Arc;

    #[test]
    fn test_default_order() {
        let sys = SystemHandles::scripted(
            Arc::new(ScriptedRunner::new()),
            Arc::new(MemoryFileSystem::new()),
        );
        let names: Vec<String> = default_phases(SharedContext::new(InstallContext::default()), sys)
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "bootstrap",
                "preflight",
                "partitioning",
                "base",
                "config",
                "boot",
                "repos",
                "postinstall"
            ]
        );
    }

    #[test]
    fn test_parse_package_list() {
        let list = "# core\nbase\n\n  linux-firmware  \n#btrfs-progs\nsudo\n";
        assert_eq!(parse_package_list(list), vec!["base", "linux-firmware", "sudo"]);
    }

    #[test]
    fn test_asset_url_join() {
        assert_eq!(asset_url("https://host/assets/", "base.packages"), "https://host/assets/base.packages");
        assert_eq!(asset_url("https://host/assets", "configs/x"), "https://host/assets/configs/x");
    }
}
