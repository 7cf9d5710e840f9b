//! Type-safe installation choices
//!
//! Enums instead of stringly-typed config values, so every phase matches
//! exhaustively on the choices it cares about.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Root disk encryption layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionMode {
    #[default]
    #[strum(serialize = "none")]
    None,
    /// LUKS2 container directly holding the root filesystem
    #[strum(serialize = "luks")]
    Luks,
    /// LUKS2 container holding an LVM volume group
    #[strum(serialize = "luks-lvm")]
    LuksLvm,
}

impl EncryptionMode {
    /// Check if this mode puts root inside a LUKS container
    pub fn is_encrypted(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Check if this mode uses LVM on top of the container
    pub fn uses_lvm(&self) -> bool {
        matches!(self, Self::LuksLvm)
    }
}

/// Linux kernel selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "kebab-case")]
pub enum Kernel {
    #[default]
    #[strum(serialize = "linux")]
    Linux,
    #[strum(serialize = "linux-lts")]
    LinuxLts,
    #[strum(serialize = "linux-zen")]
    LinuxZen,
    #[strum(serialize = "linux-hardened")]
    LinuxHardened,
}

impl Kernel {
    /// Headers package matching this kernel
    pub fn headers_package(&self) -> String {
        format!("{}-headers", self)
    }

    /// Path of the kernel image inside /boot
    pub fn image_path(&self) -> String {
        format!("/vmlinuz-{}", self)
    }

    /// Path of the initramfs inside /boot
    pub fn initramfs_path(&self) -> String {
        format!("/initramfs-{}.img", self)
    }
}

/// AUR helper selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AurHelper {
    #[default]
    #[strum(serialize = "paru")]
    Paru,
    #[strum(serialize = "yay")]
    Yay,
    #[strum(serialize = "none")]
    None,
}

impl AurHelper {
    /// Package name to install, `None` when no helper is wanted
    pub fn package(&self) -> Option<&'static str> {
        match self {
            Self::Paru => Some("paru"),
            Self::Yay => Some("yay"),
            Self::None => None,
        }
    }
}

/// CPU vendor, used to pick the microcode package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CpuVendor {
    #[default]
    Unknown,
    Intel,
    Amd,
}

impl CpuVendor {
    /// Detect the vendor from the contents of `/proc/cpuinfo`
    pub fn from_cpuinfo(cpuinfo: &str) -> Self {
        for line in cpuinfo.lines() {
            if !line.starts_with("vendor_id") {
                continue;
            }
            if line.contains("GenuineIntel") {
                return Self::Intel;
            }
            if line.contains("AuthenticAMD") {
                return Self::Amd;
            }
        }
        Self::Unknown
    }

    /// Microcode package for this vendor
    pub fn microcode_package(&self) -> Option<&'static str> {
        match self {
            Self::Intel => Some("intel-ucode"),
            Self::Amd => Some("amd-ucode"),
            Self::Unknown => None,
        }
    }
}
