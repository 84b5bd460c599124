//! Builds the storage graph from a user path, descending filesystem ->
//! logical volume -> volume group -> physical volumes -> partitions ->
//! disks with an explicit work queue.

use crate::device::{self, Context};
use crate::disk::{self, Partition, MIN_NEW_PARTITION_SIZE};
use crate::fsprobe;
use crate::lvm;
use crate::storage::{FsType, ItemKind, StorageItem};
use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::os::unix::fs::FileTypeExt;
use walkdir::WalkDir;

/// Bound on the storage list; descending past it means the device graph
/// loops back on itself.
pub const MAX_STORAGE_DEPTH: usize = 1000;

/// Scan the layered storage under `start_path` and return the flat graph,
/// deepest target (the filesystem) first.
pub fn scan(ctx: &mut Context, start_path: &str) -> Result<Vec<StorageItem>> {
    let mut start = normalize_path(start_path);
    lvm::scan_lvs(ctx);

    // A mount point stands for its source device.
    if let Some(source) = fsprobe::mount_source_for(ctx, &start)? {
        start = source;
    }

    let mut storage: Vec<StorageItem> = Vec::new();
    let mut to_scan = vec![StorageItem::new(ItemKind::Unknown, start, None)];

    while let Some(mut item) = to_scan.pop() {
        if storage.len() > MAX_STORAGE_DEPTH {
            bail!("Storage stack is cyclic or too deep");
        }

        match item.kind {
            ItemKind::Unknown => {
                let blk = fsprobe::blkid_type(ctx.runner, &item.path);
                let (major, minor) = device::major_minor(ctx, &item.path);
                if let Some(fs_type) = blk.as_deref().and_then(FsType::from_blkid) {
                    item.kind = ItemKind::Fs;
                    item.fs_type = Some(fs_type);
                } else {
                    match ctx.kind_by_devno(major, minor) {
                        ItemKind::Unknown => {
                            eprintln!(
                                "Can't detect device type. Path: '{}' Blk: '{}', major: {}, minor: {}",
                                item.path,
                                blk.unwrap_or_default(),
                                major,
                                minor
                            );
                            continue;
                        }
                        kind => item.kind = kind,
                    }
                }
                // Scan again with the kind resolved.
                to_scan.push(item);
            }

            ItemKind::Fs => {
                let Some(fs_type) = item.fs_type else {
                    continue;
                };
                match fsprobe::fs_size(ctx, fs_type, &item.path) {
                    Ok(size) => item.size = size,
                    Err(e) => {
                        eprintln!("Can't get size of filesystem {} ({}). Skip it.", item.path, e);
                        continue;
                    }
                }
                let path = item.path.clone();
                storage.push(item);

                let (major, minor) = device::major_minor(ctx, &path);
                let under_kind = ctx.kind_by_devno(major, minor);
                if under_kind != ItemKind::Unknown {
                    to_scan.push(StorageItem::new(under_kind, path, Some(storage.len() - 1)));
                }
            }

            ItemKind::Partition => {
                let (disk_path, part_number) = match disk::extract_part_number(&item.path) {
                    Ok(res) => res,
                    Err(e) => {
                        eprintln!("{}", e);
                        continue;
                    }
                };
                let disk_info = match disk::read_disk_info(ctx, &disk_path) {
                    Ok(info) => info,
                    Err(e) => {
                        eprintln!(
                            "Error while scanning partition {}. Skip it: {}",
                            item.path, e
                        );
                        continue;
                    }
                };
                for (i, part) in disk_info.partitions.iter().enumerate() {
                    if part.number != part_number {
                        continue;
                    }
                    item.size = part.size();
                    item.partition = Some(part.clone());
                    // Room to grow into trailing free space.
                    if let Some(next) = disk_info.partitions.get(i + 1) {
                        if next.is_free_space() {
                            item.free_space = next.last_byte - part.last_byte;
                        }
                    }
                }
                let child = item.child;
                let size = item.size;
                storage.push(item);

                // A larger partition lets its PV grow to the matching
                // usable size.
                if let Some(c) = child {
                    if storage[c].kind == ItemKind::LvmPv {
                        let new_size = lvm::pv_usable_size(size, storage[c].lvm_extent_size);
                        if new_size > storage[c].size {
                            storage[c].free_space = new_size - storage[c].size;
                        }
                    }
                }
            }

            ItemKind::Disk => {
                storage.push(item);
            }

            ItemKind::LvmLv => {
                // Replace a /dev path with the canonical VG/LV name.
                let (major, minor) = device::major_minor(ctx, &item.path);
                if let Some(lv) = ctx.lv_by_devno(major, minor) {
                    item.path = lv.path.clone();
                }
                item.size = lvm::lv_size(ctx.runner, &item.path);
                let Some(slash) = item.path.find('/') else {
                    eprintln!("Can't get volume group of: {}", item.path);
                    continue;
                };
                let vg_name = item.path[..slash].to_string();
                storage.push(item);
                to_scan.push(StorageItem::new(
                    ItemKind::LvmGroup,
                    vg_name,
                    Some(storage.len() - 1),
                ));
            }

            ItemKind::LvmPv | ItemKind::LvmPvAdd => {
                item.size = lvm::pv_size(ctx.runner, &item.path);
                let path = item.path.clone();
                storage.push(item);

                let (major, minor) = device::major_minor(ctx, &path);
                let parent_kind = ctx.kind_by_devno(major, minor);
                if parent_kind != ItemKind::Unknown {
                    to_scan.push(StorageItem::new(parent_kind, path, Some(storage.len() - 1)));
                }
            }

            ItemKind::LvmGroup => {
                let info = lvm::vg_info(ctx.runner, &item.path);
                item.size = info.size;
                item.free_space = info.free;
                item.lvm_extent_size = info.extent_size;
                let vg_name = item.path.clone();
                storage.push(item);
                let vg_index = storage.len() - 1;

                for pv in lvm::list_pvs(ctx.runner) {
                    if pv.vg.is_empty() {
                        // Unused PV, can be attached to this group.
                        let mut add = StorageItem::new(
                            ItemKind::LvmPvAdd,
                            pv.path,
                            Some(vg_index),
                        );
                        add.lvm_extent_size = info.extent_size;
                        add.size = lvm::pv_usable_size(pv.size, info.extent_size);
                        to_scan.push(add);
                    } else if pv.vg == vg_name {
                        let mut mine =
                            StorageItem::new(ItemKind::LvmPv, pv.path, Some(vg_index));
                        mine.size = pv.size;
                        mine.lvm_extent_size = info.extent_size;
                        to_scan.push(mine);
                    }
                }

                // Disk free space large enough for a fresh PV-bearing
                // partition extends this group too.
                for part in new_partition_candidates(ctx) {
                    let mut pv_new =
                        StorageItem::new(ItemKind::LvmPvNew, part.path.clone(), Some(vg_index));
                    pv_new.lvm_extent_size = info.extent_size;
                    storage.push(pv_new);

                    let mut part_new = StorageItem::new(
                        ItemKind::PartitionNew,
                        part.path.clone(),
                        Some(storage.len() - 1),
                    );
                    part_new.free_space = part.size();
                    part_new.partition = Some(part);
                    storage.push(part_new);
                }
            }

            ItemKind::LvmPvNew | ItemKind::PartitionNew | ItemKind::Skip => {}
        }
    }

    fix_fs_free_space(&mut storage);
    Ok(storage)
}

/// The scanner can't know a filesystem's headroom while descending; once
/// sizes of the layers below are in, any surplus of the layer directly
/// underneath becomes the filesystem's own free space.
pub(crate) fn fix_fs_free_space(storage: &mut [StorageItem]) {
    for i in 0..storage.len() {
        let Some(child) = storage[i].child else {
            continue;
        };
        if storage[child].kind != ItemKind::Fs {
            continue;
        }
        let under_size = storage[i].size;
        let under_kind = storage[i].kind;
        let under_path = storage[i].path.clone();
        let fs = &mut storage[child];
        if under_size > fs.size {
            fs.free_space += under_size - fs.size;
        } else if under_size < fs.size {
            eprintln!(
                "WARNING: Filesystem {} is larger than the layer under it ({}, {})",
                fs.path, under_kind, under_path
            );
        }
    }
}

/// Find every free-space slot on every disk where a partition worth
/// creating would fit. Numbers are handed out by the context so candidates
/// from one run never collide.
pub fn new_partition_candidates(ctx: &mut Context) -> Vec<Partition> {
    let mut seen: HashSet<(u32, u32)> = HashSet::new();
    let mut disks: BTreeMap<String, disk::DiskInfo> = BTreeMap::new();

    let dev_dir = ctx.dev_dir.clone();
    for entry in WalkDir::new(&dev_dir).min_depth(1).into_iter().flatten() {
        let is_candidate = entry.file_type().is_block_device()
            || (ctx.scan_plain_files && entry.file_type().is_file());
        if !is_candidate {
            continue;
        }
        let path = entry.path().to_string_lossy().to_string();
        let (major, minor) = device::major_minor(ctx, &path);
        if ctx.kind_by_devno(major, minor) != ItemKind::Disk {
            continue;
        }
        if !seen.insert((major, minor)) {
            continue;
        }
        match disk::read_disk_info(ctx, &path) {
            Ok(info) => {
                disks.insert(info.path.clone(), info);
            }
            Err(e) => eprintln!("Can't read disk {}: {}", path, e),
        }
    }

    let mut result = Vec::new();
    for info in disks.values() {
        for part in &info.partitions {
            if !part.is_free_space() || part.size() < MIN_NEW_PARTITION_SIZE {
                continue;
            }
            let number = ctx.next_partition_number(info);
            result.push(Partition {
                disk: info.disk_ref(),
                path: Partition::make_path(&info.path, number),
                number,
                first_byte: part.first_byte,
                last_byte: part.last_byte,
            });
        }
    }
    result
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}
