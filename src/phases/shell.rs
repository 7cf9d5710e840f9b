//! User shell environment: config templates, CLI tool themes, verification
//!
//! Files are written through the [`FileSystem`](crate::system::FileSystem)
//! seam at their target path; anything that must run as the user goes
//! through the chroot with `su - <user>`.

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow, bail};

use super::SHELL_TEMPLATES;
use crate::context::InstallContext;
use crate::phase::PhaseCore;

const THEME_REPO: &str = "https://github.com/bnema/bleu-theme.git";
const THEME_NAME: &str = "bleu";
/// Data directory under the user's home
const DATA_DIR: &str = ".local/share/archstage";

/// Link under `themes/current` → file inside the theme repo
const THEME_FILES: [(&str, &str); 6] = [
    ("starship.toml", "starship/bleu.toml"),
    ("eza.yml", "eza/theme.yml"),
    ("bat.tmTheme", "bat/bleu.tmTheme"),
    ("btop.theme", "btop/bleu.theme"),
    ("yazi.toml", "yazi/bleu.toml"),
    ("fzf.sh", "fzf/bleu.sh"),
];

/// A CLI tool that reads its theme through a link in its own config dir
#[derive(Debug, Clone, Copy)]
pub struct ToolTheme {
    pub tool: &'static str,
    config_dir: &'static str,
    link: &'static str,
    /// Entry of [`THEME_FILES`] the link points at
    central: &'static str,
}

/// Starship needs no link; its init script exports `STARSHIP_CONFIG`.
pub const TOOL_THEMES: [ToolTheme; 4] = [
    ToolTheme {
        tool: "eza",
        config_dir: ".config/eza",
        link: "theme.yml",
        central: "eza.yml",
    },
    ToolTheme {
        tool: "bat",
        config_dir: ".config/bat/themes",
        link: "current.tmTheme",
        central: "bat.tmTheme",
    },
    ToolTheme {
        tool: "btop",
        config_dir: ".config/btop/themes",
        link: "current.theme",
        central: "btop.theme",
    },
    ToolTheme {
        tool: "yazi",
        config_dir: ".config/yazi/flavors/current",
        link: "flavor.toml",
        central: "yazi.toml",
    },
];

const GIT_DELTA: [(&str, &str); 7] = [
    ("core.pager", "delta"),
    ("interactive.diffFilter", "delta --color-only"),
    ("delta.navigate", "true"),
    ("delta.light", "false"),
    ("delta.side-by-side", "true"),
    ("merge.conflictstyle", "diff3"),
    ("diff.colorMoved", "default"),
];

/// The installed user's home, from the host and from inside the chroot
#[derive(Debug, Clone)]
pub struct UserHome {
    pub user: String,
    pub host: PathBuf,
    pub chroot: String,
}

impl UserHome {
    pub fn new(core: &PhaseCore, user: &str) -> Self {
        let chroot = format!("/home/{}", user);
        Self {
            user: user.to_string(),
            host: core.target(&chroot),
            chroot,
        }
    }

    fn themes(&self) -> String {
        format!("{}/{}/themes", self.chroot, DATA_DIR)
    }

    fn host_theme_repo(&self) -> PathBuf {
        self.host.join(DATA_DIR).join("themes").join(THEME_NAME)
    }

    fn host_bash_dir(&self) -> PathBuf {
        self.host.join(DATA_DIR).join("default").join("bash")
    }

    /// `su - <user> -c "<command>"`
    fn as_user(&self, command: &str) -> String {
        format!("su - {} -c \"{}\"", self.user, command)
    }
}

/// Copy the shell templates and `.bashrc` into the home, then hand them to the user.
pub fn install_shell_files(core: &PhaseCore, c: &InstallContext, home: &UserHome) -> Result<()> {
    let fs = &core.sys.fs;
    if !fs.is_dir(&home.host) {
        bail!("No home directory for {} in the target", home.user);
    }
    let bash_dir = home.host_bash_dir();
    fs.create_dir_all(&bash_dir)?;

    for template in SHELL_TEMPLATES {
        let name = Path::new(template)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| anyhow!("Bad template path {}", template))?;
        let content = fs.read_to_string(&c.asset(template))?;
        let dest = match name.as_str() {
            "bashrc" => home.host.join(".bashrc"),
            _ => bash_dir.join(&name),
        };
        fs.write(&dest, &content)?;
    }

    core.chroot(&format!(
        "chown -R {u}:{u} {h}/.local {h}/.bashrc",
        u = home.user,
        h = home.chroot
    ))
    .map(|_| ())
}

/// Clone the theme repo and point `themes/current` at its files.
pub fn clone_theme(core: &PhaseCore, home: &UserHome) -> Result<()> {
    let themes = home.themes();
    let mut steps = vec![
        format!("mkdir -p {}/current", themes),
        format!("git clone {} {}/{}", THEME_REPO, themes, THEME_NAME),
    ];
    for (link, file) in THEME_FILES {
        steps.push(format!(
            "ln -snf {t}/{n}/{f} {t}/current/{l}",
            t = themes,
            n = THEME_NAME,
            f = file,
            l = link
        ));
    }
    core.chroot(&home.as_user(&steps.join(" && "))).map(|_| ())
}

/// Link one tool's config dir to the central theme file.
pub fn link_tool_theme(core: &PhaseCore, home: &UserHome, theme: &ToolTheme) -> Result<()> {
    let dir = format!("{}/{}", home.chroot, theme.config_dir);
    let mut steps = vec![
        format!("mkdir -p {}", dir),
        format!(
            "ln -snf {}/current/{} {}/{}",
            home.themes(),
            theme.central,
            dir,
            theme.link
        ),
    ];
    if theme.tool == "bat" {
        steps.push(format!(
            "printf '%s\\n' '--theme=current' > {}/.config/bat/bat.conf",
            home.chroot
        ));
        steps.push("bat cache --build".to_string());
    }
    core.chroot(&home.as_user(&steps.join(" && "))).map(|_| ())
}

/// Route git diffs through delta.
pub fn configure_delta(core: &PhaseCore, home: &UserHome) -> Result<()> {
    for (key, value) in GIT_DELTA {
        core.chroot(&home.as_user(&format!("git config --global {} '{}'", key, value)))?;
    }
    Ok(())
}

/// Everything the shell and theme steps should have left behind.
///
/// Returns the missing items; an empty list means the environment is complete.
pub fn missing_shell_files(core: &PhaseCore, home: &UserHome) -> Vec<String> {
    let fs = &core.sys.fs;
    let mut missing = Vec::new();
    if !fs.exists(&home.host.join(".bashrc")) {
        missing.push(".bashrc".to_string());
    }
    if !fs.is_dir(&home.host_bash_dir()) {
        missing.push("shell config directory".to_string());
    }

    let repo = home.host_theme_repo();
    if !fs.is_dir(&repo.join(".git")) {
        missing.push(format!("{} theme repository", THEME_NAME));
        return missing;
    }
    for (_, file) in THEME_FILES {
        if !fs.exists(&repo.join(file)) {
            missing.push(format!("theme file {}", file));
        }
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SharedContext;
    use crate::system::{MemoryFileSystem, ScriptedRunner, SystemHandles};
    use std::sync::Arc;

    fn core(fs: Arc<MemoryFileSystem>) -> (PhaseCore, Arc<ScriptedRunner>) {
        let runner = Arc::new(ScriptedRunner::new());
        let core = PhaseCore::new(
            "postinstall",
            "test",
            SharedContext::new(InstallContext::default()),
            SystemHandles::scripted(runner.clone(), fs),
        );
        (core, runner)
    }

    fn templates() -> MemoryFileSystem {
        SHELL_TEMPLATES
            .iter()
            .fold(MemoryFileSystem::new(), |fs, t| {
                fs.with_file(format!("/tmp/archstage-install/{}", t), t)
            })
    }

    #[test]
    fn test_shell_files_land_in_home() {
        let fs = Arc::new(templates().with_dir("/mnt/home/alice"));
        let (core, runner) = core(fs.clone());
        let home = UserHome::new(&core, "alice");
        let c = core.ctx.snapshot();

        install_shell_files(&core, &c, &home).unwrap();
        assert_eq!(
            fs.contents("/mnt/home/alice/.bashrc").as_deref(),
            Some("configs/shell/bashrc")
        );
        assert_eq!(
            fs.contents("/mnt/home/alice/.local/share/archstage/default/bash/aliases").as_deref(),
            Some("configs/shell/aliases")
        );
        assert!(runner
            .position("chown -R alice:alice /home/alice/.local /home/alice/.bashrc")
            .is_some());
        assert!(missing_shell_files(&core, &home).contains(&"bleu theme repository".to_string()));
    }

    #[test]
    fn test_missing_home_is_an_error() {
        let (core, runner) = core(Arc::new(templates()));
        let home = UserHome::new(&core, "bob");
        let err = install_shell_files(&core, &core.ctx.snapshot(), &home).unwrap_err();
        assert!(err.to_string().contains("No home directory for bob"));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_theme_links_run_as_user() {
        let (core, runner) = core(Arc::new(MemoryFileSystem::new()));
        let home = UserHome::new(&core, "alice");
        clone_theme(&core, &home).unwrap();
        for theme in &TOOL_THEMES {
            link_tool_theme(&core, &home, theme).unwrap();
        }

        let calls = runner.calls();
        assert_eq!(calls.len(), 1 + TOOL_THEMES.len());
        assert!(calls.iter().all(|c| c.contains("su - alice -c")));
        assert!(calls[0].contains(
            "ln -snf /home/alice/.local/share/archstage/themes/bleu/fzf/bleu.sh /home/alice/.local/share/archstage/themes/current/fzf.sh"
        ));
        let bat = runner.calls_matching("bat cache --build");
        assert_eq!(bat.len(), 1);
        assert!(bat[0].contains("/home/alice/.config/bat/themes/current.tmTheme"));
    }

    #[test]
    fn test_theme_files_checked_once_cloned() {
        let fs = Arc::new(
            MemoryFileSystem::new()
                .with_dir("/mnt/home/alice/.local/share/archstage/themes/bleu/.git")
                .with_file("/mnt/home/alice/.local/share/archstage/themes/bleu/eza/theme.yml", ""),
        );
        let (core, _runner) = core(fs);
        let missing = missing_shell_files(&core, &UserHome::new(&core, "alice"));
        assert!(missing.contains(&".bashrc".to_string()));
        assert!(missing.contains(&"theme file starship/bleu.toml".to_string()));
        assert!(!missing.contains(&"theme file eza/theme.yml".to_string()));
    }
}
