//! Filesystem probing: type detection via blkid, size queries for the ext
//! family and XFS, and mount-table lookups.
//!
//! XFS can only be inspected while mounted, so the probe mounts unmounted
//! volumes onto a temporary directory and guarantees the unmount on every
//! exit path through a drop guard.

use crate::device::{self, Context};
use crate::runner::CommandRunner;
use crate::storage::FsType;
use anyhow::{bail, Context as _, Result};
use std::path::Path;
use tempfile::TempDir;

/// Filesystem (or other signature) type reported by blkid, if any.
///
/// blkid exits non-zero for blank devices; that is a valid "nothing there"
/// answer, not a failure.
pub fn blkid_type(runner: &dyn CommandRunner, path: &str) -> Option<String> {
    let output = runner.run("blkid", &[path]).ok()?;
    parse_blkid_type(&output.stdout)
}

pub fn parse_blkid_type(s: &str) -> Option<String> {
    let start = s.find("TYPE=\"")? + "TYPE=\"".len();
    let rest = &s[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

/// Filesystem size in bytes, dispatched by type.
pub fn fs_size(ctx: &Context, fs_type: FsType, path: &str) -> Result<u64> {
    match fs_type {
        FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => ext_size(ctx.runner, path),
        FsType::Xfs => xfs_size(ctx, path),
    }
}

/// ext2/3/4 size from superblock metadata: block size times block count.
pub fn ext_size(runner: &dyn CommandRunner, path: &str) -> Result<u64> {
    let output = runner
        .run("tune2fs", &["-l", path])
        .with_context(|| format!("Can't run tune2fs on {}", path))?;
    parse_tune2fs_size(&output.stdout)
        .with_context(|| format!("Can't get filesystem size of {}", path))
}

fn parse_tune2fs_size(s: &str) -> Option<u64> {
    let mut block_size = None;
    let mut block_count = None;
    for line in s.lines() {
        if let Some(rest) = line.strip_prefix("Block size:") {
            block_size = rest.trim().parse::<u64>().ok();
        } else if let Some(rest) = line.strip_prefix("Block count:") {
            block_count = rest.trim().parse::<u64>().ok();
        }
    }
    Some(block_size? * block_count?)
}

/// XFS size in bytes. Mounts the volume onto a temporary directory first
/// when nothing has it mounted; the guard unmounts when dropped.
pub fn xfs_size(ctx: &Context, path: &str) -> Result<u64> {
    let _guard = match mount_point_of(ctx, path) {
        Some(_) => None,
        None => Some(TempMount::mount_xfs(ctx.runner, path)?),
    };

    let output = ctx
        .runner
        .run("xfs_info", &[path])
        .with_context(|| format!("Can't run xfs_info on {}", path))?;
    parse_xfs_info_size(&output.stdout)
        .with_context(|| format!("Can't find size of xfs filesystem: {}", path))
}

fn parse_xfs_info_size(s: &str) -> Option<u64> {
    for line in s.lines() {
        if !line.starts_with("data ") {
            continue;
        }
        // data     =                       bsize=4096   blocks=26240000, imaxpct=25
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let bsize = fields[2].strip_prefix("bsize=")?;
        let blocks = fields[3].strip_prefix("blocks=")?.trim_end_matches(',');
        return Some(bsize.parse::<u64>().ok()? * blocks.parse::<u64>().ok()?);
    }
    None
}

/// Mount table as (source, mount point) pairs.
pub fn read_mounts(ctx: &Context) -> Result<Vec<(String, String)>> {
    let content = std::fs::read_to_string(&ctx.mounts_path)
        .with_context(|| format!("Can't read {}", ctx.mounts_path.display()))?;
    Ok(content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some((fields.next()?.to_string(), fields.next()?.to_string()))
        })
        .collect())
}

/// Source device of the filesystem mounted at `mount_point`. When a path
/// was mounted over several times the most recent mount wins.
pub fn mount_source_for(ctx: &Context, mount_point: &str) -> Result<Option<String>> {
    let mut source = None;
    for (from, to) in read_mounts(ctx)? {
        if to == mount_point {
            source = Some(from);
        }
    }
    Ok(source)
}

/// Where the device is mounted, if anywhere. Sources are compared by
/// device numbers so by-uuid and mapper symlinks match their real node.
pub fn mount_point_of(ctx: &Context, dev_path: &str) -> Option<String> {
    let (major, minor) = device::major_minor(ctx, dev_path);
    if (major, minor) == (0, 0) {
        return None;
    }
    let mounts = read_mounts(ctx).ok()?;
    mounts
        .into_iter()
        .find(|(from, _)| device::major_minor(ctx, from) == (major, minor))
        .map(|(_, to)| to)
}

/// A transient XFS mount on a fresh temporary directory. Dropping the guard
/// unmounts and removes the directory, on success and failure paths alike.
pub struct TempMount<'a> {
    runner: &'a dyn CommandRunner,
    dir: TempDir,
}

impl<'a> TempMount<'a> {
    pub fn mount_xfs(runner: &'a dyn CommandRunner, dev_path: &str) -> Result<TempMount<'a>> {
        let dir = tempfile::tempdir().context("Can't create temporary mount directory")?;
        let dir_str = dir.path().to_string_lossy().to_string();
        let output = runner.run("mount", &["-t", "xfs", dev_path, &dir_str])?;
        if !output.success() {
            bail!("Can't mount {} on {}: {}", dev_path, dir_str, output.stderr.trim());
        }
        Ok(TempMount { runner, dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl Drop for TempMount<'_> {
    fn drop(&mut self) {
        let dir = self.dir.path().to_string_lossy().to_string();
        match self.runner.run("umount", &[&dir]) {
            Ok(out) if out.success() => {}
            Ok(out) => eprintln!("Can't unmount {}: {}", dir, out.stderr.trim()),
            Err(e) => eprintln!("Can't unmount {}: {}", dir, e),
        }
    }
}
