//! Installation context: the decisions every phase reads and writes
//!
//! Loaded from the user's JSON config, enriched by phases as they run
//! (partition paths, resolved root device, CPU vendor), and persisted after
//! every successful post-check so a failed run leaves a record of what was
//! decided.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{InstallError, Result};
use crate::storage::ActiveRoot;
use crate::system::FileSystem;
use crate::types::{AurHelper, CpuVendor, EncryptionMode, Kernel};

/// Default location of the persisted context
pub const DEFAULT_STATE_PATH: &str = "/var/log/archstage-install.json";
/// Default location of downloaded assets
pub const DEFAULT_INSTALL_DIR: &str = "/tmp/archstage-install";
/// Default base URL assets are downloaded from
pub const DEFAULT_ASSET_URL: &str =
    "https://raw.githubusercontent.com/live4thamuzik/ArchTUI/main/assets";

/// Accumulated installation decisions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallContext {
    // Identity
    pub hostname: String,
    pub username: String,
    pub user_password: String,
    pub root_password: String,
    /// LUKS passphrase; the user password is used when empty
    pub encryption_password: String,
    /// Optional, used for git settings
    pub email: String,

    // Locale & time
    pub keymap: String,
    pub timezone: String,
    pub locale: String,

    // Disk
    pub target_disk: String,
    pub encryption: EncryptionMode,
    pub efi_partition: Option<String>,
    pub root_partition: Option<String>,
    pub active_root: Option<ActiveRoot>,

    // Base system
    pub kernel: Kernel,
    pub cpu_vendor: CpuVendor,
    pub microcode: Option<String>,
    /// `active`, `passive` or `guided`
    pub amd_pstate: Option<String>,

    // Repositories
    pub aur_helper: AurHelper,
    pub enable_multilib: bool,
    pub enable_chaotic: bool,

    // Locations
    pub asset_url: String,
    pub install_dir: PathBuf,
    pub mount_root: PathBuf,

    /// Where the context is persisted; not itself persisted
    #[serde(skip)]
    pub state_path: Option<PathBuf>,
}

impl Default for InstallContext {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            username: String::new(),
            user_password: String::new(),
            root_password: String::new(),
            encryption_password: String::new(),
            email: String::new(),
            keymap: "us".to_string(),
            timezone: String::new(),
            locale: "en_US.UTF-8".to_string(),
            target_disk: String::new(),
            encryption: EncryptionMode::None,
            efi_partition: None,
            root_partition: None,
            active_root: None,
            kernel: Kernel::Linux,
            cpu_vendor: CpuVendor::Unknown,
            microcode: None,
            amd_pstate: None,
            aur_helper: AurHelper::Paru,
            enable_multilib: true,
            enable_chaotic: false,
            asset_url: DEFAULT_ASSET_URL.to_string(),
            install_dir: PathBuf::from(DEFAULT_INSTALL_DIR),
            mount_root: PathBuf::from("/mnt"),
            state_path: None,
        }
    }
}

impl InstallContext {
    /// Load a context from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            InstallError::config(format!("Failed to read {:?}: {}", path.as_ref(), e))
        })?;
        let ctx: Self = serde_json::from_str(&content)?;
        Ok(ctx)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Path inside the target system (`/etc/hostname` → `/mnt/etc/hostname`)
    pub fn target(&self, path: &str) -> PathBuf {
        self.mount_root.join(path.trim_start_matches('/'))
    }

    /// Path of a downloaded asset
    pub fn asset(&self, relative: &str) -> PathBuf {
        self.install_dir.join(relative)
    }

    /// Passphrase for the LUKS container
    pub fn luks_passphrase(&self) -> &str {
        if self.encryption_password.is_empty() {
            &self.user_password
        } else {
            &self.encryption_password
        }
    }

    /// Validate the user-supplied part of the context
    pub fn validate(&self) -> Result<()> {
        let disk = self.target_disk.trim();
        if disk.is_empty() {
            return Err(InstallError::validation("Target disk must be specified"));
        }
        if !disk.starts_with("/dev/") {
            return Err(InstallError::validation(format!(
                "Target disk must be a /dev path, got '{}'",
                disk
            )));
        }

        validate_name("Hostname", &self.hostname, |c| {
            c.is_ascii_alphanumeric() || c == '_' || c == '-'
        })?;
        validate_name("Username", &self.username, |c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-'
        })?;

        validate_password("User password", &self.user_password)?;
        validate_password("Root password", &self.root_password)?;
        if self.encryption.is_encrypted() && !self.encryption_password.is_empty() {
            validate_password("Encryption password", &self.encryption_password)?;
        }

        if !self.email.is_empty() && !self.email.contains('@') {
            return Err(InstallError::validation("Email must contain '@'"));
        }
        if let Some(pstate) = &self.amd_pstate {
            if !matches!(pstate.as_str(), "active" | "passive" | "guided") {
                return Err(InstallError::validation(format!(
                    "amd_pstate must be active, passive or guided, got '{}'",
                    pstate
                )));
            }
        }
        Ok(())
    }
}

/// 3-32 chars, starts with a letter, restricted alphabet
fn validate_name(label: &str, value: &str, allowed: impl Fn(char) -> bool) -> Result<()> {
    let value = value.trim();
    if value.is_empty() {
        return Err(InstallError::validation(format!("{} must be specified", label)));
    }
    if value.len() < 3 || value.len() > 32 {
        return Err(InstallError::validation(format!(
            "{} must be 3-32 characters long",
            label
        )));
    }
    if !value.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        return Err(InstallError::validation(format!("{} must start with a letter", label)));
    }
    if let Some(bad) = value.chars().find(|c| !allowed(*c)) {
        return Err(InstallError::validation(format!(
            "{} contains invalid character '{}'",
            label, bad
        )));
    }
    Ok(())
}

fn validate_password(label: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(InstallError::validation(format!("{} must be specified", label)));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(InstallError::validation(format!(
            "{} cannot contain whitespace",
            label
        )));
    }
    Ok(())
}

/// Context shared between the phases of one run
#[derive(Debug, Clone)]
pub struct SharedContext(Arc<Mutex<InstallContext>>);

impl SharedContext {
    pub fn new(ctx: InstallContext) -> Self {
        Self(Arc::new(Mutex::new(ctx)))
    }

    // A panic while holding the lock leaves plain data; keep using it.
    fn lock(&self) -> MutexGuard<'_, InstallContext> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with<R>(&self, f: impl FnOnce(&InstallContext) -> R) -> R {
        f(&self.lock())
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut InstallContext) -> R) -> R {
        f(&mut self.lock())
    }

    /// Owned copy of the current state
    pub fn snapshot(&self) -> InstallContext {
        self.lock().clone()
    }

    /// Write the context as JSON (mode 0600) to its state path, if any
    pub fn persist(&self, fs: &dyn FileSystem) -> anyhow::Result<()> {
        let (path, json) = {
            let ctx = self.lock();
            let Some(path) = ctx.state_path.clone() else {
                debug!("No state path configured, skipping context persistence");
                return Ok(());
            };
            let json = serde_json::to_string_pretty(&*ctx)
                .context("Failed to serialize install context")?;
            (path, json)
        };
        if let Some(parent) = path.parent() {
            fs.create_dir_all(parent)?;
        }
        fs.write_mode(&path, &json, 0o600)
            .with_context(|| format!("Failed to persist install context to {:?}", path))?;
        debug!("Persisted install context to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::MemoryFileSystem;
    use std::io::Write;

    fn valid() -> InstallContext {
        InstallContext {
            hostname: "archbox".into(),
            username: "alice".into(),
            user_password: "hunter2".into(),
            root_password: "toor".into(),
            target_disk: "/dev/sda".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_context_passes() {
        valid().validate().unwrap();
    }

    #[test]
    fn test_validation_rules() {
        let mut ctx = valid();
        ctx.hostname = "1box".into();
        assert!(ctx.validate().unwrap_err().to_string().contains("start with a letter"));

        let mut ctx = valid();
        ctx.username = "Alice".into();
        assert!(ctx.validate().unwrap_err().to_string().contains("invalid character"));

        let mut ctx = valid();
        ctx.user_password = "two words".into();
        assert!(ctx.validate().unwrap_err().to_string().contains("whitespace"));

        let mut ctx = valid();
        ctx.target_disk = "sda".into();
        assert!(ctx.validate().is_err());

        let mut ctx = valid();
        ctx.amd_pstate = Some("turbo".into());
        assert!(ctx.validate().is_err());
    }

    #[test]
    fn test_luks_passphrase_falls_back_to_user_password() {
        let mut ctx = valid();
        assert_eq!(ctx.luks_passphrase(), "hunter2");
        ctx.encryption_password = "diskpw".into();
        assert_eq!(ctx.luks_passphrase(), "diskpw");
    }

    #[test]
    fn test_target_paths() {
        let ctx = valid();
        assert_eq!(ctx.target("/etc/hostname"), PathBuf::from("/mnt/etc/hostname"));
        assert_eq!(
            ctx.asset("base.packages"),
            PathBuf::from("/tmp/archstage-install/base.packages")
        );
    }

    #[test]
    fn test_load_partial_config_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"hostname":"archbox","target_disk":"/dev/nvme0n1","encryption":"luks-lvm"}}"#
        )
        .unwrap();
        let ctx = InstallContext::load_from_file(file.path()).unwrap();
        assert_eq!(ctx.encryption, EncryptionMode::LuksLvm);
        assert_eq!(ctx.mount_root, PathBuf::from("/mnt"));
        assert!(ctx.enable_multilib);
        assert!(ctx.state_path.is_none());
    }

    #[test]
    fn test_load_rejects_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = InstallContext::load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, InstallError::Json(_)));
    }

    #[test]
    fn test_persist_writes_private_json() {
        let fs = MemoryFileSystem::new();
        let mut ctx = valid();
        ctx.state_path = Some(PathBuf::from("/var/log/state.json"));
        let shared = SharedContext::new(ctx);
        shared.with_mut(|c| c.root_partition = Some("/dev/sda2".into()));
        shared.persist(&fs).unwrap();

        let json = fs.contents("/var/log/state.json").unwrap();
        let back: InstallContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back.root_partition.as_deref(), Some("/dev/sda2"));
        assert_eq!(fs.mode_of("/var/log/state.json"), Some(0o600));
    }

    #[test]
    fn test_persist_without_state_path_is_noop() {
        let fs = MemoryFileSystem::new();
        SharedContext::new(valid()).persist(&fs).unwrap();
        assert!(fs.list_dir(Path::new("/")).unwrap().is_empty());
    }
}
