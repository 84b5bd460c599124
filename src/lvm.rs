//! Read-only LVM enumeration via the lvm2 userland tools, and the physical
//! volume size arithmetic.

use crate::device::{Context, LvDevice};
use crate::runner::CommandRunner;
use std::thread::sleep;
use std::time::Duration;

/// Extents reserved by LVM for physical volume metadata.
pub const PV_METADATA_EXTENTS: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LvmPv {
    pub path: String,
    /// Empty when the PV is not assigned to any volume group.
    pub vg: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VgInfo {
    pub size: u64,
    pub free: u64,
    pub extent_size: u64,
}

/// Usable bytes of a PV carved out of `partition_size`: whole extents minus
/// the two metadata extents, zero when the partition can't fit them.
pub fn pv_usable_size(partition_size: u64, extent_size: u64) -> u64 {
    if extent_size == 0 {
        return 0;
    }
    let extents = partition_size / extent_size;
    if extents < PV_METADATA_EXTENTS {
        return 0;
    }
    (extents - PV_METADATA_EXTENTS) * extent_size
}

/// Strip lvm2's `B` unit suffix from a `--units B` size field.
fn trim_suffix_b(s: &str) -> &str {
    s.strip_suffix('B').unwrap_or(s)
}

/// Enumerate logical volumes and register their kernel device numbers in
/// the context cache, so mapper nodes classify as LVM LVs afterwards.
pub fn scan_lvs(ctx: &mut Context) {
    let output = match ctx.runner.run(
        "lvs",
        &[
            "-a",
            "-o",
            "vg_name,lv_name,lv_kernel_major,lv_kernel_minor,lv_size",
            "--units",
            "B",
            "--separator",
            "/",
            "--noheading",
        ],
    ) {
        Ok(out) => out,
        Err(e) => {
            eprintln!("Can't list logical volumes: {}", e);
            return;
        }
    };

    for line in output.stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('/').collect();
        if fields.len() < 5 {
            eprintln!("Can't parse lvs line: {}", line);
            continue;
        }
        let path = format!("{}/{}", fields[0], fields[1]);
        let (Ok(major), Ok(minor)) = (fields[2].parse::<u32>(), fields[3].parse::<u32>()) else {
            eprintln!("Can't parse lvs device numbers: {}", line);
            continue;
        };
        let Ok(size) = trim_suffix_b(fields[4]).parse::<u64>() else {
            eprintln!("Can't parse lvs size: {}", line);
            continue;
        };
        ctx.register_lv(major, minor, LvDevice { path, size });
    }
}

/// All known physical volumes. An empty `vg` means the PV is unused and
/// available for `vgextend`.
pub fn list_pvs(runner: &dyn CommandRunner) -> Vec<LvmPv> {
    let output = match runner.run(
        "pvs",
        &[
            "-o",
            "pv_name,vg_name,pv_size",
            "--units",
            "B",
            "--separator",
            "|",
            "--noheading",
        ],
    ) {
        Ok(out) => out,
        Err(e) => {
            eprintln!("Can't list physical volumes: {}", e);
            return Vec::new();
        }
    };

    let mut result = Vec::new();
    for line in output.stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() < 3 {
            eprintln!("Can't parse pvs line: {}", line);
            continue;
        }
        let Ok(size) = trim_suffix_b(fields[2]).parse::<u64>() else {
            eprintln!("Can't parse pvs size: {}", line);
            continue;
        };
        result.push(LvmPv {
            path: fields[0].to_string(),
            vg: fields[1].to_string(),
            size,
        });
    }
    result
}

/// Size of one logical volume by its canonical `VG/LV` name.
pub fn lv_size(runner: &dyn CommandRunner, path: &str) -> u64 {
    let output = match runner.run(
        "lvs",
        &[
            "-o",
            "vg_name,lv_name,lv_size",
            "--units",
            "B",
            "--separator",
            "/",
            "--noheading",
        ],
    ) {
        Ok(out) => out,
        Err(e) => {
            eprintln!("Can't read LV size of {}: {}", path, e);
            return 0;
        }
    };

    let prefix = format!("{}/", path);
    for line in output.stdout.lines() {
        let line = line.trim();
        if let Some(size_field) = line.strip_prefix(&prefix) {
            match trim_suffix_b(size_field).parse::<u64>() {
                Ok(size) => return size,
                Err(e) => {
                    eprintln!("Can't parse LV size: {} ({})", line, e);
                    return 0;
                }
            }
        }
    }
    eprintln!("Can't find logical volume: {}", path);
    0
}

/// Size of one physical volume. lvm2 occasionally reports an empty size
/// right after a change, so an empty first answer is retried once after a
/// pause.
pub fn pv_size(runner: &dyn CommandRunner, path: &str) -> u64 {
    let size = pv_size_once(runner, path);
    if size == 0 {
        eprintln!("Empty PV size, retrying: {}", path);
        sleep(Duration::from_secs(5));
        return pv_size_once(runner, path);
    }
    size
}

fn pv_size_once(runner: &dyn CommandRunner, path: &str) -> u64 {
    let output = match runner.run(
        "pvs",
        &[
            "-o",
            "pv_size",
            "--units",
            "B",
            "--separator",
            "|",
            "--noheading",
            path,
        ],
    ) {
        Ok(out) => out,
        Err(e) => {
            eprintln!("Can't read PV size of {}: {}", path, e);
            return 0;
        }
    };
    let line = output.stdout.trim();
    match trim_suffix_b(line).parse::<u64>() {
        Ok(size) => size,
        Err(_) => {
            eprintln!("Can't parse PV size of {}: '{}'", path, line);
            0
        }
    }
}

/// Total size, free space and extent size of a volume group.
pub fn vg_info(runner: &dyn CommandRunner, vg_name: &str) -> VgInfo {
    let output = match runner.run(
        "vgs",
        &[
            "--units",
            "B",
            "--separator",
            "/",
            "--noheading",
            "-o",
            "vg_name,vg_size,vg_free,vg_extent_size",
        ],
    ) {
        Ok(out) => out,
        Err(e) => {
            eprintln!("Can't read volume group info for {}: {}", vg_name, e);
            return VgInfo::default();
        }
    };

    for line in output.stdout.lines() {
        let line = line.trim();
        let fields: Vec<&str> = line.split('/').collect();
        if fields.len() < 4 || fields[0] != vg_name {
            continue;
        }
        return VgInfo {
            size: trim_suffix_b(fields[1]).parse().unwrap_or(0),
            free: trim_suffix_b(fields[2]).parse().unwrap_or(0),
            extent_size: trim_suffix_b(fields[3]).parse().unwrap_or(0),
        };
    }
    eprintln!("Can't find volume group: {}", vg_name);
    VgInfo::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ScriptedRunner;
    use crate::storage::ItemKind;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_pv_usable_size() {
        let extent = 4 * MB;
        // Too small for metadata extents.
        assert_eq!(pv_usable_size(0, extent), 0);
        assert_eq!(pv_usable_size(extent, extent), 0);
        assert_eq!(pv_usable_size(2 * extent, extent), 0);
        // From three extents on, two are always reserved.
        assert_eq!(pv_usable_size(3 * extent, extent), extent);
        assert_eq!(pv_usable_size(3 * extent + 1, extent), extent);
        assert_eq!(pv_usable_size(1024 * MB, extent), 1024 * MB - 2 * extent);
        // Degenerate extent size.
        assert_eq!(pv_usable_size(1024 * MB, 0), 0);
    }

    #[test]
    fn test_pv_usable_size_monotonic() {
        let extent = 4 * MB;
        let mut prev = 0;
        for step in 0..64 {
            let size = step * extent / 2;
            let usable = pv_usable_size(size, extent);
            assert!(usable >= prev, "usable size decreased at {}", size);
            prev = usable;
        }
    }

    #[test]
    fn test_scan_lvs_populates_cache() {
        let runner = ScriptedRunner::new();
        runner.on(
            "lvs -a -o vg_name,lv_name,lv_kernel_major,lv_kernel_minor,lv_size --units B --separator / --noheading",
            "  storage/test/253/0/536870912B\n  other/data/253/1/1073741824B\n  bad line\n",
        );
        let mut ctx = Context::new(&runner);
        scan_lvs(&mut ctx);

        assert_eq!(ctx.kind_by_devno(253, 0), ItemKind::LvmLv);
        let lv = ctx.lv_by_devno(253, 0).unwrap();
        assert_eq!(lv.path, "storage/test");
        assert_eq!(lv.size, 536870912);
        assert_eq!(ctx.kind_by_devno(253, 1), ItemKind::LvmLv);
        assert_eq!(ctx.kind_by_devno(253, 2), ItemKind::Unknown);
    }

    #[test]
    fn test_list_pvs() {
        let runner = ScriptedRunner::new();
        runner.on(
            "pvs -o pv_name,vg_name,pv_size --units B --separator | --noheading",
            "  /dev/sda1|storage|1073741824B\n  /dev/sdb1||2147483648B\n",
        );
        let pvs = list_pvs(&runner);
        assert_eq!(
            pvs,
            vec![
                LvmPv {
                    path: "/dev/sda1".to_string(),
                    vg: "storage".to_string(),
                    size: 1073741824,
                },
                LvmPv {
                    path: "/dev/sdb1".to_string(),
                    vg: String::new(),
                    size: 2147483648,
                },
            ]
        );
    }

    #[test]
    fn test_lv_size() {
        let runner = ScriptedRunner::new();
        runner.on(
            "lvs -o vg_name,lv_name,lv_size --units B --separator / --noheading",
            "  storage/test/536870912B\n",
        );
        assert_eq!(lv_size(&runner, "storage/test"), 536870912);
        assert_eq!(lv_size(&runner, "storage/missing"), 0);
    }

    #[test]
    fn test_vg_info() {
        let runner = ScriptedRunner::new();
        runner.on(
            "vgs --units B --separator / --noheading -o vg_name,vg_size,vg_free,vg_extent_size",
            "  storage/1069547520B/0B/4194304B\n",
        );
        let info = vg_info(&runner, "storage");
        assert_eq!(
            info,
            VgInfo {
                size: 1069547520,
                free: 0,
                extent_size: 4194304,
            }
        );
        assert_eq!(vg_info(&runner, "absent"), VgInfo::default());
    }
}
