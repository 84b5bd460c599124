//! Turns the scanned storage list into an execution plan: apply the user's
//! path filter, prefer growing existing partitions over creating
//! overlapping new ones, and emit the list in execution order.

use crate::disk::{self, Partition};
use crate::storage::{ItemKind, StorageItem};
use anyhow::{anyhow, Result};
use regex::Regex;
use std::collections::HashMap;
use std::collections::HashSet;

/// Filter sentinel expanding to every disk that already carries a PV of a
/// scanned volume group.
pub const FILTER_LVM_ALREADY_PLACED: &str = "LVM_ALREADY_PLACED";

const REGEXP_CHARS: &[char] = &['^', '*', '+', '?', '[', ']'];

const SKIP_BY_FILTER: &str = "Skip by filters.";
const SKIP_BY_OPTIMIZATION: &str =
    "Partition layout optimization. Partition number may be wrong because it optimize too.";

/// Expand a comma-separated filter into one alternation regex over device
/// paths.
///
/// Plain tokens are anchored: a leading `/` pins the path start, a token
/// without regex metacharacters is closed with `[^/]*$`. Tokens already
/// containing metacharacters pass through untouched. The expansion is a
/// sorted, deduplicated alternation, so token order never changes the
/// matched set.
pub fn expand_filter(storage: &[StorageItem], filter: &str) -> String {
    let mut tokens: HashSet<String> = HashSet::new();
    for token in filter.split(',') {
        if token == FILTER_LVM_ALREADY_PLACED {
            for (vg_index, vg) in storage.iter().enumerate() {
                if vg.kind != ItemKind::LvmGroup {
                    continue;
                }
                for part in &storage[vg_index + 1..] {
                    if part.child != Some(vg_index) || part.kind != ItemKind::LvmPv {
                        continue;
                    }
                    match disk::extract_part_number(&part.path) {
                        Ok((disk_path, _)) => {
                            tokens.insert(format!("^{}[^/]*$", disk_path));
                        }
                        Err(e) => {
                            eprintln!("Can't extract disk path from {}: {}", part.path, e)
                        }
                    }
                }
            }
        } else {
            tokens.insert(token.to_string());
        }
    }

    let mut expressions: Vec<String> = tokens
        .into_iter()
        .map(|mut token| {
            if !token.is_empty() && !token.ends_with('/') && !token.contains(REGEXP_CHARS) {
                token.push_str("[^/]*$");
            }
            if token.starts_with('/') {
                token.insert(0, '^');
            }
            token
        })
        .collect();
    expressions.sort();
    expressions.join("|")
}

/// Build the execution plan. The storage list is consumed; the result is
/// ordered outermost layer first, with `child` indexes remapped so every
/// link points forward.
pub fn build_plan(mut storage: Vec<StorageItem>, filter: &str) -> Result<Vec<StorageItem>> {
    let expanded = expand_filter(&storage, filter);
    let filter_re = Regex::new(&expanded)
        .map_err(|e| anyhow!("Error while compiling filter regexp: {}", e))?;

    apply_filter(&mut storage, &filter_re);
    optimize_partition_overlap(&mut storage);

    // Reverse of scan order puts partitions and disks before the LVM
    // layers and the filesystem they feed.
    let mut plan_map: HashMap<usize, usize> = HashMap::new();
    let mut plan: Vec<StorageItem> = Vec::new();
    for i in (0..storage.len()).rev() {
        if storage[i].kind == ItemKind::Unknown {
            continue;
        }
        plan_map.insert(i, plan.len());
        plan.push(storage[i].clone());
    }
    for item in &mut plan {
        item.child = item.child.and_then(|c| plan_map.get(&c).copied());
    }
    Ok(plan)
}

/// Demote extendable items whose path falls outside the filter.
fn apply_filter(storage: &mut [StorageItem], filter_re: &Regex) {
    for item in storage.iter_mut() {
        match item.kind {
            ItemKind::Partition
            | ItemKind::PartitionNew
            | ItemKind::LvmPv
            | ItemKind::LvmPvAdd
            | ItemKind::LvmPvNew => {
                if !filter_re.is_match(&item.path) {
                    item.skip(SKIP_BY_FILTER);
                }
            }
            _ => {}
        }
    }
}

/// Growing an existing partition beats creating a new one in the same
/// place. Cancel every planned partition that collides with an extension,
/// cancel the PV planned on top of it, and close the numbering gap by
/// shifting later planned partitions on that disk down one slot each.
fn optimize_partition_overlap(storage: &mut Vec<StorageItem>) {
    for i in 0..storage.len() {
        if storage[i].kind != ItemKind::Partition || storage[i].free_space == 0 {
            continue;
        }
        let Some(grown) = storage[i].partition.clone() else {
            continue;
        };
        let grown_end = storage[i].last_byte_when_grown();

        for new_i in 0..storage.len() {
            if new_i == i || storage[new_i].kind != ItemKind::PartitionNew {
                continue;
            }
            let Some(candidate) = storage[new_i].partition.clone() else {
                continue;
            };
            if candidate.disk.path != grown.disk.path {
                continue;
            }
            if candidate.last_byte < grown.first_byte || candidate.first_byte > grown_end {
                continue;
            }

            // The planned PV on the cancelled partition goes with it.
            if let Some(child) = storage[new_i].child {
                if storage[child].kind == ItemKind::LvmPvNew {
                    storage[child].skip(SKIP_BY_OPTIMIZATION);
                }
            }
            storage[new_i].skip(SKIP_BY_OPTIMIZATION);

            renumber_after_cancel(storage, &candidate);
        }
    }
}

/// Shift every remaining planned partition on the cancelled partition's
/// disk down into the freed number slot, cascading, and keep items that
/// reference a renamed partition by path pointing at the right place.
fn renumber_after_cancel(storage: &mut Vec<StorageItem>, cancelled: &Partition) {
    let mut prev_num = cancelled.number;
    for j in 0..storage.len() {
        if storage[j].kind != ItemKind::PartitionNew {
            continue;
        }
        let old_path = storage[j].path.clone();
        let Some(part) = storage[j].partition.as_mut() else {
            continue;
        };
        if part.disk.major != cancelled.disk.major
            || part.disk.minor != cancelled.disk.minor
            || part.number <= prev_num
        {
            continue;
        }

        let current_num = part.number;
        let new_path = Partition::make_path(&part.disk.path, prev_num);
        part.number = prev_num;
        part.path = new_path.clone();
        storage[j].path = new_path.clone();
        prev_num = current_num;

        // Layers stacked on the renamed partition link to it by path.
        for k in 0..storage.len() {
            if k != j && storage[k].path == old_path {
                storage[k].path = new_path.clone();
            }
        }
    }
}

impl StorageItem {
    /// Last byte this partition would cover after growing into its free
    /// space.
    fn last_byte_when_grown(&self) -> u64 {
        match &self.partition {
            Some(part) => part.last_byte + self.free_space,
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{DiskRef, TableKind};

    const GB: u64 = 1024 * 1024 * 1024;

    fn lvm_fixture() -> Vec<StorageItem> {
        let mut items = vec![
            StorageItem::new(ItemKind::Fs, "/dev/storage/test", None), // 0
            StorageItem::new(ItemKind::LvmLv, "/dev/storage/test", Some(0)), // 1
            StorageItem::new(ItemKind::LvmGroup, "storage", Some(1)),  // 2
            StorageItem::new(ItemKind::LvmPv, "/dev/sda1", Some(2)),   // 3
            StorageItem::new(ItemKind::LvmPv, "/dev/sda2", Some(2)),   // 4
            StorageItem::new(ItemKind::LvmPv, "/dev/sdb1", Some(2)),   // 5
            StorageItem::new(ItemKind::LvmPvAdd, "/dev/sdc1", Some(2)), // 6
            StorageItem::new(ItemKind::LvmPvNew, "/dev/sdd1", Some(2)), // 7
            StorageItem::new(ItemKind::PartitionNew, "/dev/sde1", Some(7)), // 8
        ];
        items[0].fs_type = Some(crate::storage::FsType::Xfs);
        items
    }

    #[test]
    fn test_expand_filter_plain_tokens() {
        assert_eq!(expand_filter(&[], ""), "");
        assert_eq!(expand_filter(&[], ".*"), ".*");
        // Full path with metacharacters: anchored but otherwise verbatim.
        assert_eq!(expand_filter(&[], "/dev/loop.*"), "^/dev/loop.*");
        // Bare disk name.
        assert_eq!(expand_filter(&[], "loop"), "loop[^/]*$");
        // Disk path.
        assert_eq!(expand_filter(&[], "/dev/loop"), "^/dev/loop[^/]*$");
    }

    #[test]
    fn test_expand_filter_lvm_already_placed() {
        let storage = lvm_fixture();
        assert_eq!(
            expand_filter(&storage, FILTER_LVM_ALREADY_PLACED),
            "^/dev/sda[^/]*$|^/dev/sdb[^/]*$"
        );
        assert_eq!(
            expand_filter(&storage, "LVM_ALREADY_PLACED,/dev/loop"),
            "^/dev/loop[^/]*$|^/dev/sda[^/]*$|^/dev/sdb[^/]*$"
        );
    }

    #[test]
    fn test_expand_filter_order_independent() {
        let storage = lvm_fixture();
        assert_eq!(
            expand_filter(&storage, "/dev/loop,LVM_ALREADY_PLACED"),
            expand_filter(&storage, "LVM_ALREADY_PLACED,/dev/loop")
        );
        assert_eq!(
            expand_filter(&[], "b,a,c"),
            expand_filter(&[], "c,a,b")
        );
        // Duplicate tokens collapse.
        assert_eq!(expand_filter(&[], "loop,loop"), "loop[^/]*$");
    }

    #[test]
    fn test_apply_filter_demotes_unmatched() {
        let mut storage = lvm_fixture();
        let re = Regex::new("^/dev/sda[^/]*$").unwrap();
        apply_filter(&mut storage, &re);

        // FS, LV and VG are never filtered.
        assert_eq!(storage[0].kind, ItemKind::Fs);
        assert_eq!(storage[1].kind, ItemKind::LvmLv);
        assert_eq!(storage[2].kind, ItemKind::LvmGroup);
        // sda PVs match, everything else is demoted.
        assert_eq!(storage[3].kind, ItemKind::LvmPv);
        assert_eq!(storage[4].kind, ItemKind::LvmPv);
        assert_eq!(storage[5].kind, ItemKind::Skip);
        assert_eq!(storage[5].old_kind, Some(ItemKind::LvmPv));
        assert_eq!(storage[5].skip_reason.as_deref(), Some(SKIP_BY_FILTER));
        assert_eq!(storage[6].kind, ItemKind::Skip);
        assert_eq!(storage[7].kind, ItemKind::Skip);
        assert_eq!(storage[8].kind, ItemKind::Skip);
    }

    fn disk_ref() -> DiskRef {
        DiskRef {
            path: "/dev/sda".to_string(),
            table: TableKind::Msdos,
            size: 100 * GB,
            major: 8,
            minor: 0,
            sector_size: 512,
        }
    }

    fn partition(number: u32, first_byte: u64, last_byte: u64) -> Partition {
        let disk = disk_ref();
        Partition {
            path: Partition::make_path(&disk.path, number),
            disk,
            number,
            first_byte,
            last_byte,
        }
    }

    /// An existing partition that can grow plus planned partitions before
    /// and after it, the middle one colliding with the growth.
    fn overlap_fixture() -> Vec<StorageItem> {
        let mut vg = StorageItem::new(ItemKind::LvmGroup, "storage", None);
        vg.lvm_extent_size = 4 * 1024 * 1024;

        // Existing partition [5 GiB, 6 GiB) can grow to 10 GiB.
        let mut grown = StorageItem::new(ItemKind::Partition, "/dev/sda1", Some(0));
        grown.partition = Some(partition(1, 5 * GB, 6 * GB - 1));
        grown.size = GB;
        grown.free_space = 4 * GB;

        // Leading free space: new partition 3.
        let mut pv3 = StorageItem::new(ItemKind::LvmPvNew, "/dev/sda3", Some(0));
        pv3.lvm_extent_size = 4 * 1024 * 1024;
        let mut part3 = StorageItem::new(ItemKind::PartitionNew, "/dev/sda3", Some(2));
        part3.partition = Some(partition(3, 32256, 5 * GB - 1));
        part3.free_space = 5 * GB - 32256;

        // Middle free space, swallowed by the grown partition: number 4.
        let mut pv4 = StorageItem::new(ItemKind::LvmPvNew, "/dev/sda4", Some(0));
        pv4.lvm_extent_size = 4 * 1024 * 1024;
        let mut part4 = StorageItem::new(ItemKind::PartitionNew, "/dev/sda4", Some(4));
        part4.partition = Some(partition(4, 6 * GB, 10 * GB - 1));
        part4.free_space = 4 * GB;

        // Trailing free space: number 5.
        let mut pv5 = StorageItem::new(ItemKind::LvmPvNew, "/dev/sda5", Some(0));
        pv5.lvm_extent_size = 4 * 1024 * 1024;
        let mut part5 = StorageItem::new(ItemKind::PartitionNew, "/dev/sda5", Some(6));
        part5.partition = Some(partition(5, 11 * GB, 100 * GB - 1));
        part5.free_space = 89 * GB;

        vec![vg, grown, pv3, part3, pv4, part4, pv5, part5]
    }

    #[test]
    fn test_overlap_optimization_cancels_and_renumbers() {
        let mut storage = overlap_fixture();
        optimize_partition_overlap(&mut storage);

        // The colliding pair is cancelled.
        assert_eq!(storage[5].kind, ItemKind::Skip);
        assert_eq!(storage[5].old_kind, Some(ItemKind::PartitionNew));
        assert_eq!(storage[4].kind, ItemKind::Skip);
        assert_eq!(storage[4].old_kind, Some(ItemKind::LvmPvNew));

        // Leading partition 3 is untouched.
        assert_eq!(storage[3].kind, ItemKind::PartitionNew);
        assert_eq!(storage[3].partition.as_ref().unwrap().number, 3);
        assert_eq!(storage[3].path, "/dev/sda3");

        // Trailing partition 5 shifted into the freed slot 4, and the PV
        // planned on it followed the rename.
        assert_eq!(storage[7].kind, ItemKind::PartitionNew);
        assert_eq!(storage[7].partition.as_ref().unwrap().number, 4);
        assert_eq!(storage[7].path, "/dev/sda4");
        assert_eq!(storage[6].kind, ItemKind::LvmPvNew);
        assert_eq!(storage[6].path, "/dev/sda4");
    }

    #[test]
    fn test_overlap_optimization_keeps_location_count() {
        let mut storage = overlap_fixture();
        let before = storage
            .iter()
            .filter(|i| matches!(i.kind, ItemKind::PartitionNew | ItemKind::LvmPvNew))
            .count();
        optimize_partition_overlap(&mut storage);
        let after = storage
            .iter()
            .filter(|i| matches!(i.kind, ItemKind::PartitionNew | ItemKind::LvmPvNew))
            .count();
        assert!(after <= before);
        // Every cancelled pair is justified by a grown partition.
        let cancelled = before - after;
        assert_eq!(cancelled, 2);
        assert!(storage
            .iter()
            .any(|i| i.kind == ItemKind::Partition && i.free_space > 0));
    }

    #[test]
    fn test_overlap_optimization_ignores_other_disks() {
        let mut storage = overlap_fixture();
        // Move the colliding candidate to another disk.
        if let Some(part) = storage[5].partition.as_mut() {
            part.disk.path = "/dev/sdb".to_string();
            part.disk.major = 8;
            part.disk.minor = 16;
        }
        optimize_partition_overlap(&mut storage);
        assert_eq!(storage[5].kind, ItemKind::PartitionNew);
    }

    #[test]
    fn test_build_plan_reverses_and_remaps() {
        let storage = vec![
            StorageItem::new(ItemKind::Fs, "/dev/storage/test", None), // 0
            StorageItem::new(ItemKind::LvmLv, "storage/test", Some(0)), // 1
            StorageItem::new(ItemKind::LvmGroup, "storage", Some(1)),  // 2
            StorageItem::new(ItemKind::LvmPv, "/dev/sda1", Some(2)),   // 3
            StorageItem::new(ItemKind::Partition, "/dev/sda1", Some(3)), // 4
        ];
        let plan = build_plan(storage, "").unwrap();

        let kinds: Vec<ItemKind> = plan.iter().map(|i| i.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ItemKind::Partition,
                ItemKind::LvmPv,
                ItemKind::LvmGroup,
                ItemKind::LvmLv,
                ItemKind::Fs,
            ]
        );
        // Every child link points forward; the target sits at the end.
        for (i, item) in plan.iter().enumerate() {
            match item.child {
                Some(c) => assert!(c > i, "child {} does not point forward of {}", c, i),
                None => assert_eq!(i, plan.len() - 1),
            }
        }
    }

    #[test]
    fn test_build_plan_drops_unknown_keeps_skip() {
        let mut storage = vec![
            StorageItem::new(ItemKind::Fs, "/dev/sda1", None),
            StorageItem::new(ItemKind::Unknown, "/dev/junk", None),
            StorageItem::new(ItemKind::Partition, "/dev/sda1", Some(0)),
        ];
        storage[2].skip("Skip by filters.");
        let plan = build_plan(storage, "").unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].kind, ItemKind::Skip);
        assert_eq!(plan[1].kind, ItemKind::Fs);
    }

    #[test]
    fn test_build_plan_bad_filter() {
        let storage = vec![StorageItem::new(ItemKind::Fs, "/dev/sda1", None)];
        assert!(build_plan(storage, "[").is_err());
    }
}
