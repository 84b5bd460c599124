//! Block-device probing: symlink resolution, major/minor lookup and the
//! major-number classification table.

use crate::runner::CommandRunner;
use crate::storage::ItemKind;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A logical volume known from `lvs`, keyed in the context cache by the
/// kernel device numbers of its mapper node.
#[derive(Debug, Clone)]
pub struct LvDevice {
    /// Canonical `VG/LV` name.
    pub path: String,
    pub size: u64,
}

/// Shared probe state for one run.
///
/// Holds the command runner plus the two process-wide caches: the
/// device-number classification cache populated by the LVM probe, and the
/// per-disk counter for numbers handed out to planned partitions. Tests
/// build a fresh context per scenario instead of sharing globals.
pub struct Context<'a> {
    pub runner: &'a dyn CommandRunner,
    /// Where mount information is read from; `/proc/mounts` in production.
    pub mounts_path: PathBuf,
    /// Directory walked for block devices; `/dev` in production.
    pub dev_dir: PathBuf,
    /// Test hook: also consider regular files as disk candidates when
    /// walking `dev_dir` (device nodes need root to create).
    pub scan_plain_files: bool,
    lv_by_devno: HashMap<(u32, u32), LvDevice>,
    next_part_num: HashMap<(u32, u32), u32>,
}

impl<'a> Context<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Context<'a> {
        Context {
            runner,
            mounts_path: PathBuf::from("/proc/mounts"),
            dev_dir: PathBuf::from("/dev"),
            scan_plain_files: false,
            lv_by_devno: HashMap::new(),
            next_part_num: HashMap::new(),
        }
    }

    pub fn register_lv(&mut self, major: u32, minor: u32, lv: LvDevice) {
        self.lv_by_devno.insert((major, minor), lv);
    }

    pub fn lv_by_devno(&self, major: u32, minor: u32) -> Option<&LvDevice> {
        self.lv_by_devno.get(&(major, minor))
    }

    /// Classify a device by its kernel device numbers.
    ///
    /// Logical volumes registered by the LVM probe win over the static
    /// table; everything unrecognized is `Unknown` and the caller skips it.
    pub fn kind_by_devno(&self, major: u32, minor: u32) -> ItemKind {
        if self.lv_by_devno.contains_key(&(major, minor)) {
            return ItemKind::LvmLv;
        }
        kind_by_major_table(major, minor)
    }

    /// Smallest unused partition number on the disk, never reusing a number
    /// already handed out for this disk during the run, so several planned
    /// partitions on one disk cannot collide.
    pub fn next_partition_number(&mut self, disk: &crate::disk::DiskInfo) -> u32 {
        let key = (disk.major, disk.minor);
        let start = self.next_part_num.get(&key).copied().unwrap_or(0);
        let mut num = start + 1;
        while disk.partitions.iter().any(|p| p.number == num) {
            num += 1;
        }
        self.next_part_num.insert(key, num);
        num
    }
}

/// Classification by major number, from the kernel's devices.txt.
fn kind_by_major_table(major: u32, minor: u32) -> ItemKind {
    match major {
        7 => ItemKind::Disk,
        259 => ItemKind::Partition,
        3 | 22 | 33 | 34 | 56 | 57 | 88..=91 => {
            if minor % 64 == 0 {
                ItemKind::Disk
            } else {
                ItemKind::Partition
            }
        }
        8 | 65..=71 | 128..=135 => {
            if minor % 16 == 0 {
                ItemKind::Disk
            } else {
                ItemKind::Partition
            }
        }
        _ => ItemKind::Unknown,
    }
}

/// Follow symlinks until a real file. The returned path is best-effort: a
/// missing file resolves to itself alongside the error, matching how the
/// probes treat unreadable paths as "use as-is".
pub fn read_link(path: &str) -> (String, Option<std::io::Error>) {
    let mut current = PathBuf::from(path);
    loop {
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => match std::fs::read_link(&current) {
                Ok(target) => {
                    current = if target.is_absolute() {
                        target
                    } else {
                        current
                            .parent()
                            .unwrap_or(Path::new("/"))
                            .join(target)
                    };
                }
                Err(e) => return (current.to_string_lossy().to_string(), Some(e)),
            },
            Ok(_) => return (current.to_string_lossy().to_string(), None),
            Err(e) => return (current.to_string_lossy().to_string(), Some(e)),
        }
    }
}

/// Kernel device numbers for a path, `(0, 0)` when they cannot be read.
/// Symlinks are chased first so `/dev/mapper` and by-uuid paths resolve to
/// the real node.
pub fn major_minor(ctx: &Context, path: &str) -> (u32, u32) {
    let (real_path, _) = read_link(path);
    let output = match ctx.runner.run("stat", &["-c", "%t:%T", &real_path]) {
        Ok(out) => out,
        Err(_) => return (0, 0),
    };
    parse_major_minor(&output.stdout)
}

/// Parse `stat -c %t:%T` output: colon-separated hex device numbers.
pub fn parse_major_minor(s: &str) -> (u32, u32) {
    let mut parts = s.trim().split(':');
    let (Some(major_hex), Some(minor_hex), None) = (parts.next(), parts.next(), parts.next())
    else {
        return (0, 0);
    };
    let major = u32::from_str_radix(major_hex.trim(), 16).unwrap_or(0);
    let minor = u32::from_str_radix(minor_hex.trim(), 16).unwrap_or(0);
    (major, minor)
}
