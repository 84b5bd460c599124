//! The flat-vector storage graph: every layer the scanner discovers becomes
//! one node, cross-linked by vector index rather than by pointer.

use crate::disk::Partition;
use std::fmt;

/// What a storage node is, and therefore how it can be extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ItemKind {
    #[default]
    Unknown,
    Fs,
    Disk,
    LvmGroup,
    LvmPv,
    /// An existing physical volume not yet assigned to any volume group.
    LvmPvAdd,
    /// A physical volume to be created on a new partition.
    LvmPvNew,
    LvmLv,
    Partition,
    PartitionNew,
    /// Planner demoted the node; `old_kind`/`skip_reason` say why.
    Skip,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemKind::Unknown => "UNKNOWN",
            ItemKind::Fs => "FS",
            ItemKind::Disk => "DISK",
            ItemKind::LvmGroup => "LVM_GROUP",
            ItemKind::LvmPv => "LVM_PV",
            ItemKind::LvmPvAdd => "LVM_PV_ADD",
            ItemKind::LvmPvNew => "LVM_PV_NEW",
            ItemKind::LvmLv => "LVM_LV",
            ItemKind::Partition => "PARTITION",
            ItemKind::PartitionNew => "PARTITION_NEW",
            ItemKind::Skip => "SKIP",
        };
        f.write_str(name)
    }
}

/// Filesystems the tool understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    Ext2,
    Ext3,
    Ext4,
    Xfs,
}

impl FsType {
    /// Map a `blkid` TYPE value to a known filesystem.
    pub fn from_blkid(s: &str) -> Option<FsType> {
        match s {
            "ext2" => Some(FsType::Ext2),
            "ext3" => Some(FsType::Ext3),
            "ext4" => Some(FsType::Ext4),
            "xfs" => Some(FsType::Xfs),
            _ => None,
        }
    }

    pub fn is_ext(&self) -> bool {
        matches!(self, FsType::Ext2 | FsType::Ext3 | FsType::Ext4)
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FsType::Ext2 => "ext2",
            FsType::Ext3 => "ext3",
            FsType::Ext4 => "ext4",
            FsType::Xfs => "xfs",
        };
        f.write_str(name)
    }
}

/// One node of the storage graph.
///
/// `child` points at the node this extension feeds, downstream toward the
/// target filesystem; the target itself has `child == None`. `free_space` is
/// only what this layer can gain on its own, gains from layers below are
/// propagated along `child` links at print/execute time.
#[derive(Debug, Clone, Default)]
pub struct StorageItem {
    pub kind: ItemKind,
    pub path: String,
    pub child: Option<usize>,
    pub size: u64,
    pub free_space: u64,
    pub fs_type: Option<FsType>,
    pub partition: Option<Partition>,
    pub lvm_extent_size: u64,
    pub old_kind: Option<ItemKind>,
    pub skip_reason: Option<String>,
}

impl StorageItem {
    pub fn new(kind: ItemKind, path: impl Into<String>, child: Option<usize>) -> StorageItem {
        StorageItem {
            kind,
            path: path.into(),
            child,
            ..StorageItem::default()
        }
    }

    /// Demote the node to SKIP, remembering what it was and why.
    pub fn skip(&mut self, reason: &str) {
        self.old_kind = Some(self.kind);
        self.kind = ItemKind::Skip;
        self.skip_reason = Some(reason.to_string());
    }
}

impl fmt::Display for StorageItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Kind: {}, Path: {}, Size: {} (+{}), Child: {}",
            self.kind,
            self.path,
            format_size(self.size),
            format_size(self.free_space),
            match self.child {
                Some(c) => c.to_string(),
                None => "-".to_string(),
            }
        )?;
        match self.kind {
            ItemKind::Fs => {
                if let Some(fs) = self.fs_type {
                    write!(f, ", FS: {}", fs)?;
                }
            }
            ItemKind::Partition | ItemKind::PartitionNew => {
                if let Some(part) = &self.partition {
                    write!(f, ", PartNum={}", part.number)?;
                }
            }
            ItemKind::LvmGroup | ItemKind::LvmPv | ItemKind::LvmPvAdd | ItemKind::LvmPvNew => {
                write!(f, ", ExtentSize: {}", format_size(self.lvm_extent_size))?;
            }
            ItemKind::Skip => {
                if let Some(old) = self.old_kind {
                    write!(f, ", Was: {}", old)?;
                }
                if let Some(reason) = &self.skip_reason {
                    write!(f, ", Reason: {}", reason)?;
                }
            }
            _ => {}
        }
        f.write_str("]")
    }
}

/// Human-readable byte size, one decimal.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 8] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB", "ZiB"];
    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return format!("{:.1}{}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.1}YiB", size)
}
