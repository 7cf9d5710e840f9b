//! Disk layout and active root device resolution
//!
//! The installer partitions the target disk as GPT with a 512M EFI system
//! partition and one root partition. What actually carries the root
//! filesystem depends on the encryption mode:
//!
//! | Mode       | Active root device     | Stack on the root partition              |
//! |------------|------------------------|------------------------------------------|
//! | `none`     | root partition         | btrfs                                    |
//! | `luks`     | `/dev/mapper/cryptroot`| LUKS2 → btrfs                            |
//! | `luks-lvm` | `/dev/archvg/root`     | LUKS2 → PV → VG `archvg` → LV `root` → btrfs |
//!
//! [`ActiveRoot::resolve`] is called exactly once, by the partitioning phase,
//! and the result is stored in the install context. Formatting, mounting,
//! kernel parameters and teardown all read it instead of re-deriving it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::EncryptionMode;

/// Device-mapper name of the opened LUKS container
pub const CRYPT_MAPPER_NAME: &str = "cryptroot";
/// Volume group created inside the container for `luks-lvm`
pub const VOLUME_GROUP: &str = "archvg";
/// Logical volume holding the root filesystem for `luks-lvm`
pub const ROOT_VOLUME: &str = "root";
/// Filesystem and LUKS label
pub const ROOT_LABEL: &str = "ROOT";

/// Partition paths for the fixed two-partition layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskLayout {
    pub disk: String,
    pub efi: String,
    pub root: String,
}

impl DiskLayout {
    pub fn for_disk(disk: &str) -> Self {
        Self {
            disk: disk.to_string(),
            efi: partition_path(disk, 1),
            root: partition_path(disk, 2),
        }
    }
}

/// Path of partition `n` on `disk`.
///
/// Devices whose name ends in a digit (`nvme0n1`, `mmcblk0`, `loop0`) take a
/// `p` separator, others (`sda`, `vda`) do not.
pub fn partition_path(disk: &str, n: u32) -> String {
    if disk.chars().last().is_some_and(|c| c.is_ascii_digit()) {
        format!("{}p{}", disk, n)
    } else {
        format!("{}{}", disk, n)
    }
}

/// Trailing partition number of a partition path (`/dev/nvme0n1p1` → `1`)
pub fn partition_number(partition: &str) -> Option<u32> {
    let digits: String = partition
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let number: u32 = digits.parse().ok()?;
    // A bare nvme namespace (`/dev/nvme0n1`) has no partition suffix.
    let stem = &partition[..partition.len() - digits.len()];
    if stem.ends_with('n') && stem.contains("nvme") {
        return None;
    }
    Some(number)
}

/// The block device that carries the root filesystem, resolved once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRoot {
    pub mode: EncryptionMode,
    /// Raw root partition on the target disk
    pub partition: String,
    /// Device that is formatted btrfs and mounted at the target root
    pub device: String,
    /// Device-mapper name of the LUKS container, if any
    pub mapper: Option<String>,
    /// LVM volume group inside the container, if any
    pub volume_group: Option<String>,
}

impl ActiveRoot {
    pub fn resolve(mode: EncryptionMode, root_partition: &str) -> Self {
        let partition = root_partition.to_string();
        match mode {
            EncryptionMode::None => Self {
                mode,
                device: partition.clone(),
                partition,
                mapper: None,
                volume_group: None,
            },
            EncryptionMode::Luks => Self {
                mode,
                device: mapper_path(CRYPT_MAPPER_NAME),
                partition,
                mapper: Some(CRYPT_MAPPER_NAME.to_string()),
                volume_group: None,
            },
            EncryptionMode::LuksLvm => Self {
                mode,
                device: format!("/dev/{}/{}", VOLUME_GROUP, ROOT_VOLUME),
                partition,
                mapper: Some(CRYPT_MAPPER_NAME.to_string()),
                volume_group: Some(VOLUME_GROUP.to_string()),
            },
        }
    }

    /// `/dev/mapper/<name>` of the LUKS container, if encrypted
    pub fn mapper_device(&self) -> Option<String> {
        self.mapper.as_deref().map(mapper_path)
    }

    pub fn is_encrypted(&self) -> bool {
        self.mapper.is_some()
    }

    /// Operations that turn the raw root partition into a formatted root
    /// device, in execution order.
    pub fn build_ops(&self) -> Vec<StorageOp> {
        let mut ops = Vec::new();
        if let Some(mapper) = &self.mapper {
            ops.push(StorageOp::LuksFormat {
                device: self.partition.clone(),
                label: ROOT_LABEL.to_string(),
            });
            ops.push(StorageOp::LuksOpen {
                device: self.partition.clone(),
                mapper: mapper.clone(),
            });
        }
        if let (Some(vg), Some(pv)) = (&self.volume_group, self.mapper_device()) {
            ops.push(StorageOp::CreateLvmPv { device: pv.clone() });
            ops.push(StorageOp::CreateLvmVg {
                vg: vg.clone(),
                pv,
            });
            ops.push(StorageOp::CreateLvmLv {
                vg: vg.clone(),
                lv: ROOT_VOLUME.to_string(),
                size: "100%FREE".to_string(),
            });
        }
        ops.push(StorageOp::FormatBtrfs {
            device: self.device.clone(),
            label: ROOT_LABEL.to_string(),
        });
        ops
    }

    /// Operations that release the root device stack (after unmounting),
    /// in execution order: volume group first, then the container.
    pub fn teardown_ops(&self) -> Vec<StorageOp> {
        let mut ops = Vec::new();
        if let Some(vg) = &self.volume_group {
            ops.push(StorageOp::DeactivateVg { vg: vg.clone() });
        }
        if let Some(device) = self.mapper_device() {
            ops.push(StorageOp::LuksClose { device });
        }
        ops
    }

    /// Kernel command line for this root.
    ///
    /// `uuid` is the UUID of the raw root partition: the LUKS header UUID
    /// when encrypted, the btrfs UUID otherwise.
    pub fn kernel_params(&self, uuid: &str) -> String {
        match &self.mapper {
            Some(mapper) => format!(
                "cryptdevice=UUID={}:{} root={} rootflags=subvol=@ rw",
                uuid, mapper, self.device
            ),
            None => format!("root=UUID={} rootflags=subvol=@ rw", uuid),
        }
    }

    /// mkinitcpio HOOKS line matching the device stack
    pub fn mkinitcpio_hooks(&self) -> &'static str {
        match self.mode {
            EncryptionMode::None => {
                "HOOKS=(base udev autodetect microcode modconf kms keyboard keymap consolefont block plymouth filesystems fsck)"
            }
            EncryptionMode::Luks => {
                "HOOKS=(base udev autodetect microcode modconf kms keyboard keymap consolefont block plymouth encrypt filesystems fsck)"
            }
            EncryptionMode::LuksLvm => {
                "HOOKS=(base udev autodetect microcode modconf kms keyboard keymap consolefont block plymouth encrypt lvm2 filesystems fsck)"
            }
        }
    }

    /// Packages the installed system needs to open this root at boot
    pub fn required_packages(&self) -> Vec<&'static str> {
        match self.mode {
            EncryptionMode::None => vec![],
            EncryptionMode::Luks => vec!["cryptsetup"],
            EncryptionMode::LuksLvm => vec!["cryptsetup", "lvm2"],
        }
    }
}

fn mapper_path(name: &str) -> String {
    format!("/dev/mapper/{}", name)
}

/// A single storage command against the root device stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    LuksFormat { device: String, label: String },
    LuksOpen { device: String, mapper: String },
    CreateLvmPv { device: String },
    CreateLvmVg { vg: String, pv: String },
    CreateLvmLv { vg: String, lv: String, size: String },
    FormatBtrfs { device: String, label: String },
    DeactivateVg { vg: String },
    LuksClose { device: String },
}

impl StorageOp {
    /// Program and arguments to run on the host
    pub fn command(&self) -> (&'static str, Vec<String>) {
        let owned = |args: &[&str]| args.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        match self {
            Self::LuksFormat { device, label } => (
                "cryptsetup",
                owned(&[
                    "luksFormat",
                    "--type",
                    "luks2",
                    "--pbkdf",
                    "argon2id",
                    "--label",
                    label.as_str(),
                    "--batch-mode",
                    "--key-file",
                    "-",
                    device.as_str(),
                ]),
            ),
            Self::LuksOpen { device, mapper } => (
                "cryptsetup",
                owned(&["open", "--key-file", "-", device.as_str(), mapper.as_str()]),
            ),
            Self::CreateLvmPv { device } => ("pvcreate", owned(&["-ff", "-y", device.as_str()])),
            Self::CreateLvmVg { vg, pv } => ("vgcreate", owned(&[vg.as_str(), pv.as_str()])),
            Self::CreateLvmLv { vg, lv, size } => {
                ("lvcreate", owned(&["-y", "-l", size.as_str(), "-n", lv.as_str(), vg.as_str()]))
            }
            Self::FormatBtrfs { device, label } => {
                ("mkfs.btrfs", owned(&["-f", "-L", label.as_str(), device.as_str()]))
            }
            Self::DeactivateVg { vg } => ("vgchange", owned(&["-an", vg.as_str()])),
            Self::LuksClose { device } => ("cryptsetup", owned(&["close", device.as_str()])),
        }
    }

    /// Whether the encryption passphrase must be piped to stdin
    pub fn needs_passphrase(&self) -> bool {
        matches!(self, Self::LuksFormat { .. } | Self::LuksOpen { .. })
    }

    /// The op that releases what this one leaves active, if anything.
    ///
    /// Only opening the container and creating the volume group leave a
    /// device behind that has to be released before the disk is reused.
    pub fn undo(&self) -> Option<StorageOp> {
        match self {
            Self::LuksOpen { mapper, .. } => Some(Self::LuksClose {
                device: mapper_path(mapper),
            }),
            Self::CreateLvmVg { vg, .. } => Some(Self::DeactivateVg { vg: vg.clone() }),
            _ => None,
        }
    }
}

impl fmt::Display for StorageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LuksFormat { device, .. } => write!(f, "Encrypting {}", device),
            Self::LuksOpen { mapper, .. } => write!(f, "Opening encrypted container as {}", mapper),
            Self::CreateLvmPv { device } => write!(f, "Creating physical volume on {}", device),
            Self::CreateLvmVg { vg, .. } => write!(f, "Creating volume group {}", vg),
            Self::CreateLvmLv { vg, lv, .. } => write!(f, "Creating logical volume {}/{}", vg, lv),
            Self::FormatBtrfs { device, .. } => write!(f, "Formatting {} as btrfs", device),
            Self::DeactivateVg { vg } => write!(f, "Deactivating volume group {}", vg),
            Self::LuksClose { device } => write!(f, "Closing {}", device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Disk layout
    // =========================================================================

    #[test]
    fn test_partition_paths() {
        let sata = DiskLayout::for_disk("/dev/sda");
        assert_eq!(sata.efi, "/dev/sda1");
        assert_eq!(sata.root, "/dev/sda2");

        let nvme = DiskLayout::for_disk("/dev/nvme0n1");
        assert_eq!(nvme.efi, "/dev/nvme0n1p1");
        assert_eq!(nvme.root, "/dev/nvme0n1p2");

        assert_eq!(partition_path("/dev/mmcblk0", 2), "/dev/mmcblk0p2");
    }

    #[test]
    fn test_partition_number() {
        assert_eq!(partition_number("/dev/sda1"), Some(1));
        assert_eq!(partition_number("/dev/nvme0n1p12"), Some(12));
        assert_eq!(partition_number("/dev/vdb"), None);
        assert_eq!(partition_number("/dev/nvme0n1"), None);
    }

    // =========================================================================
    // Active root resolution
    // =========================================================================

    #[test]
    fn test_resolve_plain() {
        let root = ActiveRoot::resolve(EncryptionMode::None, "/dev/sda2");
        assert_eq!(root.device, "/dev/sda2");
        assert!(!root.is_encrypted());
        assert!(root.teardown_ops().is_empty());
        assert_eq!(
            root.build_ops(),
            vec![StorageOp::FormatBtrfs {
                device: "/dev/sda2".into(),
                label: "ROOT".into()
            }]
        );
    }

    #[test]
    fn test_resolve_luks() {
        let root = ActiveRoot::resolve(EncryptionMode::Luks, "/dev/nvme0n1p2");
        assert_eq!(root.device, "/dev/mapper/cryptroot");
        assert_eq!(root.mapper_device().as_deref(), Some("/dev/mapper/cryptroot"));
        assert_eq!(
            root.teardown_ops(),
            vec![StorageOp::LuksClose {
                device: "/dev/mapper/cryptroot".into()
            }]
        );
        let ops = root.build_ops();
        assert_eq!(ops.len(), 3);
        assert!(ops[0].needs_passphrase());
        assert_eq!(
            ops[2],
            StorageOp::FormatBtrfs {
                device: "/dev/mapper/cryptroot".into(),
                label: "ROOT".into()
            }
        );
    }

    #[test]
    fn test_resolve_luks_lvm_goes_through_volume_group() {
        let root = ActiveRoot::resolve(EncryptionMode::LuksLvm, "/dev/sda2");
        assert_eq!(root.device, "/dev/archvg/root");
        assert_eq!(root.volume_group.as_deref(), Some("archvg"));

        let ops = root.build_ops();
        assert_eq!(
            ops[2],
            StorageOp::CreateLvmPv {
                device: "/dev/mapper/cryptroot".into()
            }
        );
        assert_eq!(
            ops.last(),
            Some(&StorageOp::FormatBtrfs {
                device: "/dev/archvg/root".into(),
                label: "ROOT".into()
            })
        );

        let teardown = root.teardown_ops();
        assert_eq!(teardown[0], StorageOp::DeactivateVg { vg: "archvg".into() });
        assert_eq!(
            teardown[1],
            StorageOp::LuksClose {
                device: "/dev/mapper/cryptroot".into()
            }
        );
    }

    #[test]
    fn test_undo_of_build_ops_is_teardown() {
        let root = ActiveRoot::resolve(EncryptionMode::LuksLvm, "/dev/sda2");
        let mut undo: Vec<StorageOp> = root.build_ops().iter().filter_map(StorageOp::undo).collect();
        undo.reverse();
        assert_eq!(undo, root.teardown_ops());

        let plain = ActiveRoot::resolve(EncryptionMode::None, "/dev/sda2");
        assert!(plain.build_ops().iter().all(|op| op.undo().is_none()));
    }

    #[test]
    fn test_kernel_params_follow_active_root() {
        let plain = ActiveRoot::resolve(EncryptionMode::None, "/dev/sda2");
        assert_eq!(plain.kernel_params("abcd"), "root=UUID=abcd rootflags=subvol=@ rw");

        let luks = ActiveRoot::resolve(EncryptionMode::Luks, "/dev/sda2");
        assert_eq!(
            luks.kernel_params("abcd"),
            "cryptdevice=UUID=abcd:cryptroot root=/dev/mapper/cryptroot rootflags=subvol=@ rw"
        );

        let lvm = ActiveRoot::resolve(EncryptionMode::LuksLvm, "/dev/sda2");
        assert_eq!(
            lvm.kernel_params("abcd"),
            "cryptdevice=UUID=abcd:cryptroot root=/dev/archvg/root rootflags=subvol=@ rw"
        );
    }

    #[test]
    fn test_hooks_and_packages() {
        let lvm = ActiveRoot::resolve(EncryptionMode::LuksLvm, "/dev/sda2");
        assert!(lvm.mkinitcpio_hooks().contains("encrypt lvm2 filesystems"));
        assert_eq!(lvm.required_packages(), vec!["cryptsetup", "lvm2"]);

        let plain = ActiveRoot::resolve(EncryptionMode::None, "/dev/sda2");
        assert!(!plain.mkinitcpio_hooks().contains("encrypt"));
    }

    #[test]
    fn test_luks_format_command() {
        let op = StorageOp::LuksFormat {
            device: "/dev/sda2".into(),
            label: "ROOT".into(),
        };
        let (program, args) = op.command();
        assert_eq!(program, "cryptsetup");
        assert_eq!(
            args.join(" "),
            "luksFormat --type luks2 --pbkdf argon2id --label ROOT --batch-mode --key-file - /dev/sda2"
        );
    }
}
