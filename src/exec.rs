//! Walks the plan front to back and applies each step: partition-table
//! rewrites directly on the device, everything else through the volume
//! manager and filesystem tools.
//!
//! A failing step is logged and skipped; the rest of the plan still runs.
//! Only the kernel refusing to re-read a changed partition table escalates,
//! and then only into the reboot flag.

use crate::device::Context;
use crate::disk::{self, Partition, TableKind, GPT_TYPE_LVM, MBR_TYPE_LVM};
use crate::fsprobe::{self, TempMount};
use crate::lvm;
use crate::storage::{format_size, FsType, ItemKind, StorageItem};
use std::fs::{File, OpenOptions};
use std::thread::sleep;
use std::time::Duration;

/// Attempts for steps where the volume manager needs a moment to settle.
pub const TRY_COUNT: u32 = 5;

const MAX_U32: u64 = u32::MAX as u64;

/// Print the plan with free space accumulated along the child links, so
/// every line shows what the step will really have to work with.
pub fn print_plan(plan: &[StorageItem]) {
    for (i, item) in propagate_free_space(plan).iter().enumerate() {
        if item.kind == ItemKind::Partition && item.free_space > 0 {
            println!("{}: {} May need reboot", i, item);
        } else {
            println!("{}: {}", i, item);
        }
    }
}

/// The plan as it will look mid-execution: each item's free space plus
/// everything the items before it hand down.
fn propagate_free_space(plan: &[StorageItem]) -> Vec<StorageItem> {
    let mut items: Vec<StorageItem> = plan.to_vec();
    for i in 0..items.len() {
        if let Some(child) = items[i].child {
            let pass_down = items[i].free_space;
            items[child].free_space += pass_down;
        }
    }
    items
}

/// Execute every step of the plan. Returns true when a partition change
/// could not be activated without a reboot.
pub fn execute_plan(ctx: &Context, plan: &mut [StorageItem]) -> bool {
    let mut need_reboot = false;
    for i in 0..plan.len() {
        eprintln!("DO {}: {}", i, plan[i]);
        match plan[i].kind {
            ItemKind::Partition => {
                if grow_partition(ctx, plan, i) {
                    need_reboot = true;
                }
            }
            ItemKind::PartitionNew => create_partition(ctx, plan, i),
            ItemKind::LvmGroup => lvm_group_step(plan, i),
            ItemKind::LvmLv => grow_lvm_lv(ctx, plan, i),
            ItemKind::LvmPv => grow_lvm_pv(ctx, plan, i),
            ItemKind::LvmPvAdd => {}
            ItemKind::LvmPvNew => create_lvm_pv(ctx, plan, i),
            ItemKind::Fs => grow_fs(ctx, plan, i),
            ItemKind::Skip => {
                if let Some(reason) = &plan[i].skip_reason {
                    eprintln!("Skip {}: {}", plan[i].path, reason);
                }
            }
            ItemKind::Disk => {}
            ItemKind::Unknown => {
                eprintln!("No way to extend {}: {}", plan[i].kind, plan[i].path);
            }
        }
    }
    need_reboot
}

/// Move the item's free space down to whatever it feeds.
fn carry_to_child(plan: &mut [StorageItem], i: usize) {
    if let Some(child) = plan[i].child {
        let free = plan[i].free_space;
        plan[child].free_space += free;
        plan[i].size += free;
        plan[i].free_space = 0;
    }
}

/// Grow an existing partition into its trailing free space. Returns true
/// when the kernel kept the old geometry and a reboot is required.
fn grow_partition(ctx: &Context, plan: &mut [StorageItem], i: usize) -> bool {
    let Some(part) = plan[i].partition.clone() else {
        eprintln!("No partition details for {}, skipping.", plan[i].path);
        return false;
    };
    let part_path = plan[i].path.clone();
    let old_free = plan[i].free_space;
    let old_kernel_size = disk::block_device_size(ctx, &part_path);

    let written = match part.disk.table {
        TableKind::Msdos => grow_partition_msdos(plan, i, &part),
        TableKind::Gpt => grow_partition_gpt(plan, i, &part),
    };
    if !written {
        return false;
    }

    if let Err(e) = ctx.runner.run("partprobe", &[&part.disk.path]) {
        eprintln!("partprobe failed on {}: {}", part.disk.path, e);
    }
    let new_kernel_size = disk::block_device_size(ctx, &part_path);
    if old_kernel_size == new_kernel_size && old_free != 0 {
        eprintln!("Kernel did not re-read the partition table of {}.", part.disk.path);
        return true;
    }
    false
}

fn grow_partition_msdos(plan: &mut [StorageItem], i: usize, part: &Partition) -> bool {
    if part.number > 4 {
        eprintln!("WARNING: Can't grow partition number > 4 in an msdos partition table.");
        return false;
    }
    let sector = part.disk.sector_size;

    let mut file = match File::open(&part.disk.path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Can't open disk {}: {}", part.disk.path, e);
            return false;
        }
    };
    let mut mbr = match mbrman::MBR::read_from(&mut file, sector as u32) {
        Ok(mbr) => mbr,
        Err(e) => {
            eprintln!("Can't read partition table of {}: {}", part.disk.path, e);
            return false;
        }
    };
    drop(file);

    let new_sectors = (plan[i].size + plan[i].free_space) / sector;
    if new_sectors > MAX_U32 {
        eprintln!("New size of {} does not fit an msdos partition table. SKIP IT.", plan[i].path);
        return false;
    }
    match mbr.get_mut(part.number as usize) {
        Some(entry) if entry.is_used() => entry.sectors = new_sectors as u32,
        _ => {
            eprintln!("Can't grow empty partition slot {} on {}.", part.number, part.disk.path);
            return false;
        }
    }

    let mut file = match OpenOptions::new().write(true).open(&part.disk.path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Can't open disk {} for writing: {}", part.disk.path, e);
            return false;
        }
    };
    if let Err(e) = mbr.write_into(&mut file) {
        eprintln!(
            "WARNING!!! Can't write the new partition table of {}, it may be damaged: {}",
            part.disk.path, e
        );
        return false;
    }
    if let Err(e) = file.sync_all() {
        eprintln!("Can't sync {}: {}", part.disk.path, e);
    }

    let old_free = plan[i].free_space;
    carry_to_child(plan, i);
    println!(
        "Partition resized: {} to {} (+{})",
        plan[i].path,
        format_size(plan[i].size),
        format_size(old_free)
    );
    true
}

fn grow_partition_gpt(plan: &mut [StorageItem], i: usize, part: &Partition) -> bool {
    let sector = part.disk.sector_size;
    let mut file = match OpenOptions::new().read(true).write(true).open(&part.disk.path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Can't open disk {}: {}", part.disk.path, e);
            return false;
        }
    };
    let mut gpt = match gptman::GPT::read_from(&mut file, sector) {
        Ok(gpt) => gpt,
        Err(e) => {
            eprintln!("Can't read GPT table of {}: {}", part.disk.path, e);
            return false;
        }
    };
    if part.number == 0 || part.number > gpt.header.number_of_partition_entries {
        eprintln!("Bad GPT partition number {} on {}.", part.number, part.disk.path);
        return false;
    }
    if gpt[part.number].is_unused() {
        eprintln!("Can't grow empty partition slot {} on {}.", part.number, part.disk.path);
        return false;
    }

    gpt[part.number].ending_lba += plan[i].free_space / sector;
    if gpt[part.number].ending_lba > gpt.header.last_usable_lba {
        // The disk itself grew since the table was written; recompute the
        // usable range for the current size.
        if let Err(e) = gpt.header.update_from(&mut file, sector) {
            eprintln!("Can't recompute GPT table of {}: {}", part.disk.path, e);
            return false;
        }
        if gpt[part.number].ending_lba > gpt.header.last_usable_lba {
            eprintln!("ATTENTION!!! Partition size calculation error on {}.", plan[i].path);
            return false;
        }
    }

    if let Err(e) = gpt.write_into(&mut file) {
        eprintln!(
            "WARNING!!! GPT table write error on {}. DATA MAY BE LOST: {}",
            part.disk.path, e
        );
        return false;
    }
    if let Err(e) = file.sync_all() {
        eprintln!("Can't sync {}: {}", part.disk.path, e);
    }

    let old_free = plan[i].free_space;
    carry_to_child(plan, i);
    println!(
        "Partition resized: {} to {} (+{})",
        plan[i].path,
        format_size(plan[i].size),
        format_size(old_free)
    );
    true
}

fn create_partition(ctx: &Context, plan: &mut [StorageItem], i: usize) {
    let Some(part) = plan[i].partition.clone() else {
        eprintln!("No partition details for {}, skipping.", plan[i].path);
        return;
    };
    let created = match part.disk.table {
        TableKind::Msdos => create_partition_msdos(&part),
        TableKind::Gpt => create_partition_gpt(&part),
    };
    if created {
        if let Err(e) = ctx.runner.run("partprobe", &[&part.disk.path]) {
            eprintln!("partprobe failed on {}: {}", part.disk.path, e);
        }
    }
}

fn create_partition_msdos(part: &Partition) -> bool {
    if part.number > 4 {
        eprintln!("WARNING: Can't create partition number > 4 in an msdos partition table.");
        return false;
    }
    let sector = part.disk.sector_size;
    let mut file = match OpenOptions::new().read(true).write(true).open(&part.disk.path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Can't open disk {}: {}", part.disk.path, e);
            return false;
        }
    };
    let mut mbr = match mbrman::MBR::read_from(&mut file, sector as u32) {
        Ok(mbr) => mbr,
        Err(e) => {
            eprintln!("Can't read partition table of {}: {}", part.disk.path, e);
            return false;
        }
    };

    let lba_start = part.first_byte / sector;
    if lba_start >= MAX_U32 {
        eprintln!("Can't create msdos partition, sector number overflow: {}", part.path);
        return false;
    }
    let bytes_len = part.last_byte - part.first_byte + 1;
    let mut lba_len = bytes_len / sector;
    if bytes_len % sector != 0 {
        lba_len += 1;
    }
    if lba_start + lba_len > MAX_U32 {
        lba_len = MAX_U32 - lba_start;
    }
    // Rounding up must not push the partition past the disk itself.
    let disk_sectors = part.disk.size / sector;
    if lba_start + lba_len > disk_sectors {
        lba_len = disk_sectors - lba_start;
    }

    match mbr.get_mut(part.number as usize) {
        Some(entry) if entry.is_unused() => {
            *entry = mbrman::MBRPartitionEntry {
                boot: mbrman::BOOT_INACTIVE,
                first_chs: mbrman::CHS::empty(),
                sys: MBR_TYPE_LVM,
                last_chs: mbrman::CHS::empty(),
                starting_lba: lba_start as u32,
                sectors: lba_len as u32,
            };
        }
        Some(_) => {
            eprintln!("Partition slot {} on {} is not empty.", part.number, part.disk.path);
            return false;
        }
        None => {
            eprintln!("No partition slot {} on {}.", part.number, part.disk.path);
            return false;
        }
    }
    if mbr_entries_overlap(&mbr) {
        eprintln!("Partition table would overlap after creating {}.", part.path);
        return false;
    }

    if let Err(e) = mbr.write_into(&mut file) {
        eprintln!(
            "WARNING!!! Can't write the new partition table of {}, it may be damaged: {}",
            part.disk.path, e
        );
        return false;
    }
    if let Err(e) = file.sync_all() {
        eprintln!("Can't sync {}: {}", part.disk.path, e);
    }
    println!(
        "Partition created: {} ({})",
        part.path,
        format_size(lba_len * sector)
    );
    true
}

fn create_partition_gpt(part: &Partition) -> bool {
    let sector = part.disk.sector_size;
    let mut file = match OpenOptions::new().read(true).write(true).open(&part.disk.path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Can't open disk {}: {}", part.disk.path, e);
            return false;
        }
    };
    let mut gpt = match gptman::GPT::read_from(&mut file, sector) {
        Ok(gpt) => gpt,
        Err(e) => {
            eprintln!("Can't read GPT table of {}: {}", part.disk.path, e);
            return false;
        }
    };
    if part.number == 0 || part.number > gpt.header.number_of_partition_entries {
        eprintln!("Bad GPT partition number {} on {}.", part.number, part.disk.path);
        return false;
    }
    if gpt[part.number].is_used() {
        eprintln!("Partition slot {} on {} is not empty.", part.number, part.disk.path);
        return false;
    }

    gpt[part.number] = gptman::GPTPartitionEntry {
        partition_type_guid: GPT_TYPE_LVM,
        unique_partition_guid: rand::random(),
        starting_lba: part.first_byte / sector,
        ending_lba: part.last_byte / sector,
        attribute_bits: 0,
        partition_name: "".into(),
    };
    if gpt[part.number].ending_lba > gpt.header.last_usable_lba {
        if let Err(e) = gpt.header.update_from(&mut file, sector) {
            eprintln!("Can't recompute GPT table of {}: {}", part.disk.path, e);
            return false;
        }
        if gpt[part.number].ending_lba > gpt.header.last_usable_lba {
            eprintln!("ATTENTION!!! Partition size calculation error on {}.", part.path);
            return false;
        }
    }

    if let Err(e) = gpt.write_into(&mut file) {
        eprintln!(
            "WARNING!!! GPT table write error on {}. DATA MAY BE LOST: {}",
            part.disk.path, e
        );
        return false;
    }
    if let Err(e) = file.sync_all() {
        eprintln!("Can't sync {}: {}", part.disk.path, e);
    }
    let size = (gpt[part.number].ending_lba - gpt[part.number].starting_lba + 1) * sector;
    println!("New GPT partition created: {} ({})", part.path, format_size(size));
    true
}

/// A volume group extends nothing by itself, it only hands its free
/// extents down to the logical volume.
fn lvm_group_step(plan: &mut [StorageItem], i: usize) {
    let free = plan[i].free_space;
    if let Some(child) = plan[i].child {
        plan[child].free_space = free;
    }
    println!(
        "Free space on LVM_GROUP '{}' {}",
        plan[i].path,
        format_size(free)
    );
}

fn grow_lvm_lv(ctx: &Context, plan: &mut [StorageItem], i: usize) {
    let path = plan[i].path.clone();
    for retry in 0..TRY_COUNT {
        if retry > 0 {
            eprintln!("Retrying LVM LV extend: {}", path);
            sleep(Duration::from_secs(1));
        }
        if let Err(e) = ctx.runner.run("lvresize", &["-l", "+100%FREE", &path]) {
            eprintln!("lvresize failed on {}: {}", path, e);
        }
        let new_size = lvm::lv_size(ctx.runner, &path);
        let add_space = new_size.saturating_sub(plan[i].size);
        let child_expects_growth = plan[i]
            .child
            .map(|c| plan[c].free_space > 0)
            .unwrap_or(false);
        if child_expects_growth && (add_space == 0 || new_size == 0) {
            continue;
        }
        println!(
            "Resize LVM_LV {} to {} (+{})",
            path,
            format_size(new_size),
            format_size(add_space)
        );
        plan[i].size = new_size;
        plan[i].free_space = 0;
        if let Some(child) = plan[i].child {
            plan[child].free_space += add_space;
        }
        return;
    }
}

/// One best-effort `pvresize`; the volume group step after it reports what
/// actually arrived.
fn grow_lvm_pv(ctx: &Context, plan: &mut [StorageItem], i: usize) {
    let path = plan[i].path.clone();
    if let Err(e) = ctx.runner.run("pvresize", &[&path]) {
        eprintln!("pvresize failed on {}: {}", path, e);
    }
    let new_size = lvm::pv_size(ctx.runner, &path);
    let add_space = new_size.saturating_sub(plan[i].size);
    if let Some(child) = plan[i].child {
        plan[child].free_space += add_space;
    }
    println!(
        "LVM PV resized: {} to {} (+{})",
        path,
        format_size(new_size),
        format_size(add_space)
    );
    plan[i].free_space = plan[i].free_space.saturating_sub(add_space);
    plan[i].size = new_size;
}

fn create_lvm_pv(ctx: &Context, plan: &mut [StorageItem], i: usize) {
    let path = plan[i].path.clone();
    let Some(child) = plan[i].child else {
        eprintln!("New PV {} feeds no volume group, skipping.", path);
        return;
    };
    let vg = plan[child].path.clone();
    // The PV is created, but the volume group's total size is what tells
    // whether the extension really landed.
    let old_size = lvm::vg_info(ctx.runner, &vg).size;
    for retry in 0..TRY_COUNT {
        if retry > 0 {
            sleep(Duration::from_secs(1));
        }
        if let Err(e) = ctx.runner.run("pvcreate", &[&path]) {
            eprintln!("pvcreate failed on {}: {}", path, e);
        }
        if let Err(e) = ctx.runner.run("vgextend", &[&vg, &path]) {
            eprintln!("vgextend failed on {}: {}", vg, e);
        }
        let new_size = lvm::vg_info(ctx.runner, &vg).size;
        let add_space = new_size.saturating_sub(old_size);
        if plan[child].free_space > 0 && (add_space == 0 || new_size == 0) {
            println!("Retry extending VG {} with {}", vg, path);
            continue;
        }
        println!("Add PV {} (+{})", path, format_size(add_space));
        return;
    }
}

fn grow_fs(ctx: &Context, plan: &mut [StorageItem], i: usize) {
    let path = plan[i].path.clone();
    let Some(fs_type) = plan[i].fs_type else {
        eprintln!("Unknown filesystem on {}, skipping.", path);
        return;
    };
    for retry in 0..TRY_COUNT {
        if retry > 0 {
            sleep(Duration::from_secs(1));
        }
        let new_size = match fs_type {
            FsType::Ext3 | FsType::Ext4 => {
                let resize_log = match ctx.runner.run("resize2fs", &["-f", &path]) {
                    Ok(out) => out,
                    Err(e) => {
                        eprintln!("resize2fs failed on {}: {}", path, e);
                        continue;
                    }
                };
                match fsprobe::ext_size(ctx.runner, &path) {
                    Ok(size) => size,
                    Err(e) => {
                        eprintln!(
                            "ATTENTION: Can't read new size after resize of {} ({}).\nResize log:\n{}\n{}",
                            path, e, resize_log.stdout, resize_log.stderr
                        );
                        continue;
                    }
                }
            }
            FsType::Xfs => {
                let mut tmp_mount = None;
                let mount_point = match fsprobe::mount_point_of(ctx, &path) {
                    Some(mp) => mp,
                    None => match TempMount::mount_xfs(ctx.runner, &path) {
                        Ok(mount) => {
                            let mp = mount.path().to_string_lossy().to_string();
                            tmp_mount = Some(mount);
                            mp
                        }
                        Err(e) => {
                            eprintln!("Can't mount xfs {}: {}", path, e);
                            continue;
                        }
                    },
                };
                let grow_log = match ctx.runner.run("xfs_growfs", &[&mount_point]) {
                    Ok(out) => out,
                    Err(e) => {
                        eprintln!("xfs_growfs failed on {}: {}", mount_point, e);
                        continue;
                    }
                };
                let size = fsprobe::xfs_size(ctx, &path);
                drop(tmp_mount);
                match size {
                    Ok(size) => size,
                    Err(e) => {
                        eprintln!(
                            "ATTENTION: Can't read new size after resize of {} ({}).\nResize log:\n{}\n{}",
                            path, e, grow_log.stdout, grow_log.stderr
                        );
                        continue;
                    }
                }
            }
            FsType::Ext2 => {
                eprintln!("Don't know how to grow {} on {}.", fs_type, path);
                return;
            }
        };

        let add_space = new_size.saturating_sub(plan[i].size);
        if add_space == 0 {
            if plan[i].free_space == 0 {
                // Nothing was expected; the filesystem is already at its
                // maximum size.
                return;
            }
            eprintln!("Filesystem {} did not extend.", path);
            continue;
        }
        plan[i].free_space = plan[i].free_space.saturating_sub(add_space);
        plan[i].size = new_size;
        println!(
            "Resize filesystem: {} to {} (+{})",
            path,
            format_size(new_size),
            format_size(add_space)
        );
        return;
    }
}

fn mbr_entries_overlap(mbr: &mbrman::MBR) -> bool {
    let mut ranges: Vec<(u64, u64)> = mbr
        .iter()
        .filter(|(_, entry)| entry.is_used())
        .map(|(_, entry)| {
            (
                entry.starting_lba as u64,
                entry.starting_lba as u64 + entry.sectors as u64,
            )
        })
        .collect();
    ranges.sort();
    ranges.windows(2).any(|pair| pair[0].1 > pair[1].0)
}
