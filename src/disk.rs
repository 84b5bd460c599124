//! Disk and partition model, plus reading MBR and GPT tables into it.
//!
//! A disk is read into a [`DiskInfo`] whose partition list is sorted by
//! first byte and interleaved with free-space pseudo-partitions
//! (`number == 0`) so the whole usable range `[first_usable, last_usable]`
//! is covered contiguously.

use crate::device::{self, Context};
use anyhow::{bail, Context as _, Result};
use std::io::{Read, Seek};
use std::thread::sleep;
use std::time::Duration;

/// Don't bother creating partitions smaller than this.
pub const MIN_NEW_PARTITION_SIZE: u64 = 100 * 1024 * 1024;

/// MBR partition type byte for Linux LVM.
pub const MBR_TYPE_LVM: u8 = 0x8e;

/// GPT partition type GUID for Linux LVM
/// (E6D6D379-F507-44C2-A23C-238F2A3DF928), in on-disk mixed-endian layout.
pub const GPT_TYPE_LVM: [u8; 16] = [
    0x79, 0xd3, 0xd6, 0xe6, 0x07, 0xf5, 0xc2, 0x44, 0xa2, 0x3c, 0x23, 0x8f, 0x2a, 0x3d, 0xf9,
    0x28,
];

/// Retries for flaky block-device queries right after table changes.
pub const TRY_COUNT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Msdos,
    Gpt,
}

impl std::fmt::Display for TableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableKind::Msdos => f.write_str("msdos"),
            TableKind::Gpt => f.write_str("gpt"),
        }
    }
}

/// Summary of the disk a partition belongs to. Partitions are stored inside
/// a flat storage vector, so they carry this copy instead of borrowing the
/// owning [`DiskInfo`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskRef {
    pub path: String,
    pub table: TableKind,
    pub size: u64,
    pub major: u32,
    pub minor: u32,
    pub sector_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub disk: DiskRef,
    pub path: String,
    /// 1-based on-disk number; 0 marks a free-space pseudo-partition.
    pub number: u32,
    pub first_byte: u64,
    /// Inclusive.
    pub last_byte: u64,
}

impl Partition {
    pub fn size(&self) -> u64 {
        self.last_byte - self.first_byte + 1
    }

    pub fn is_free_space(&self) -> bool {
        self.number == 0
    }

    /// Device path for partition N of the disk: `<disk>p<N>` when the disk
    /// path ends in a digit (loop0, nvme0n1), `<disk><N>` otherwise.
    pub fn make_path(disk_path: &str, number: u32) -> String {
        if disk_path
            .chars()
            .last()
            .map(|c| c.is_ascii_digit())
            .unwrap_or(false)
        {
            format!("{}p{}", disk_path, number)
        } else {
            format!("{}{}", disk_path, number)
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiskInfo {
    pub path: String,
    pub table: TableKind,
    pub size: u64,
    pub major: u32,
    pub minor: u32,
    pub sector_size: u64,
    /// Sorted by first byte, free-space pseudo-partitions included.
    pub partitions: Vec<Partition>,
}

impl DiskInfo {
    pub fn disk_ref(&self) -> DiskRef {
        DiskRef {
            path: self.path.clone(),
            table: self.table,
            size: self.size,
            major: self.major,
            minor: self.minor,
            sector_size: self.sector_size,
        }
    }
}

/// Split a partition path into its disk path and partition number:
/// `/dev/sda3` -> (`/dev/sda`, 3), `/dev/loop0p1` -> (`/dev/loop0`, 1).
pub fn extract_part_number(path: &str) -> Result<(String, u32)> {
    let chars: Vec<char> = path.chars().collect();
    if !chars.last().map(|c| c.is_ascii_digit()).unwrap_or(false) {
        bail!("Can't extract partition number from: {}", path);
    }
    let mut start = chars.len() - 1;
    while start > 0 && chars[start - 1].is_ascii_digit() {
        start -= 1;
    }
    let mut disk_end = start;
    // /dev/loop0p1 style: drop the 'p' only when a digit precedes it.
    if disk_end > 1 && chars[disk_end - 1] == 'p' && chars[disk_end - 2].is_ascii_digit() {
        disk_end -= 1;
    }
    let disk_path: String = chars[..disk_end].iter().collect();
    let number: u32 = chars[start..]
        .iter()
        .collect::<String>()
        .parse()
        .with_context(|| format!("Bad partition number in: {}", path))?;
    Ok((disk_path, number))
}

/// Size in bytes as the kernel reports it. Device nodes can lag for a
/// moment after a table change, so failures are retried with a short sleep.
pub fn block_device_size(ctx: &Context, path: &str) -> u64 {
    for attempt in 0..TRY_COUNT {
        if attempt > 0 {
            eprintln!("Retrying device size read: {}", path);
            sleep(Duration::from_secs(1));
        }
        let output = match ctx.runner.run("blockdev", &["--getsize64", path]) {
            Ok(out) => out,
            Err(e) => {
                eprintln!("blockdev failed for {}: {}", path, e);
                continue;
            }
        };
        if !output.success() {
            continue;
        }
        match output.stdout.trim().parse::<u64>() {
            Ok(size) => return size,
            Err(e) => eprintln!("Can't parse device size of {}: {}", path, e),
        }
    }
    0
}

/// Read a disk's partition table from the live device node.
pub fn read_disk_info(ctx: &Context, path: &str) -> Result<DiskInfo> {
    let (major, minor) = device::major_minor(ctx, path);

    let sector_out = ctx
        .runner
        .run("blockdev", &["--getss", path])
        .with_context(|| format!("Can't get sector size of {}", path))?;
    let sector_size: u64 = sector_out
        .stdout
        .trim()
        .parse()
        .with_context(|| format!("Can't parse sector size of {}", path))?;

    let size = block_device_size(ctx, path);
    if size == 0 {
        bail!("Can't get disk size: {}", path);
    }

    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Can't open disk: {}", path))?;
    read_table(&mut file, path, major, minor, sector_size, size)
}

/// Parse the partition table out of any readable disk image.
pub fn read_table<R: Read + Seek>(
    io: &mut R,
    path: &str,
    major: u32,
    minor: u32,
    sector_size: u64,
    size: u64,
) -> Result<DiskInfo> {
    let mbr = mbrman::MBR::read_from(io, sector_size as u32)
        .with_context(|| format!("Can't read partition table of {}", path))?;

    let is_gpt = mbr.iter().any(|(_, p)| p.is_used() && p.sys == 0xee);
    let table = if is_gpt { TableKind::Gpt } else { TableKind::Msdos };

    let mut disk = DiskInfo {
        path: path.to_string(),
        table,
        size,
        major,
        minor,
        sector_size,
        partitions: Vec::new(),
    };
    let disk_ref = disk.disk_ref();

    let first_usable;
    let last_usable;
    if is_gpt {
        let gpt = gptman::GPT::read_from(io, sector_size)
            .with_context(|| format!("Can't read GPT table of {}", path))?;
        first_usable = gpt.header.first_usable_lba * sector_size;
        last_usable = gpt.header.last_usable_lba * sector_size + sector_size - 1;
        for (number, entry) in gpt.iter() {
            if entry.is_unused() {
                continue;
            }
            disk.partitions.push(Partition {
                disk: disk_ref.clone(),
                path: Partition::make_path(path, number),
                number,
                first_byte: entry.starting_lba * sector_size,
                last_byte: entry.ending_lba * sector_size + sector_size - 1,
            });
        }
    } else {
        // Align like parted does, leaving room for a later GPT conversion.
        first_usable = 63 * 512;
        last_usable = size - 1;
        for number in 1..=4usize {
            let Some(entry) = mbr.get(number) else {
                continue;
            };
            if entry.is_unused() {
                continue;
            }
            disk.partitions.push(Partition {
                disk: disk_ref.clone(),
                path: Partition::make_path(path, number as u32),
                number: number as u32,
                first_byte: entry.starting_lba as u64 * sector_size,
                last_byte: (entry.starting_lba as u64 + entry.sectors as u64) * sector_size - 1,
            });
        }
    }

    disk.partitions.sort_by_key(|p| p.first_byte);
    disk.partitions = fill_free_space(&disk_ref, disk.partitions, first_usable, last_usable)?;
    Ok(disk)
}

/// Interleave real partitions with free-space pseudo-partitions so the
/// result covers `[first_usable, last_usable]` without holes.
///
/// A first partition starting past the computed start but still within the
/// minimum partition size pulls `first_usable` forward to its own start;
/// old tools produced such layouts and the sub-partition-sized lead-in is
/// unusable anyway. A partition starting below the computed start is a
/// broken layout and fails as an overlap.
fn fill_free_space(
    disk_ref: &DiskRef,
    sorted: Vec<Partition>,
    mut first_usable: u64,
    last_usable: u64,
) -> Result<Vec<Partition>> {
    if let Some(first) = sorted.first() {
        if first_usable < first.first_byte && first.first_byte < MIN_NEW_PARTITION_SIZE {
            first_usable = first.first_byte;
        }
    }

    let free = |first_byte: u64, last_byte: u64| Partition {
        disk: disk_ref.clone(),
        path: String::new(),
        number: 0,
        first_byte,
        last_byte,
    };

    let mut result = Vec::with_capacity(sorted.len() * 2 + 1);
    let mut next_start = first_usable;
    for part in sorted {
        if part.first_byte > next_start {
            result.push(free(next_start, part.first_byte - 1));
        } else if part.first_byte < next_start {
            bail!("OVERLAP PARTITIONS on {}", disk_ref.path);
        }
        next_start = part.last_byte + 1;
        result.push(part);
    }
    if next_start <= last_usable {
        result.push(free(next_start, last_usable));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn disk_ref() -> DiskRef {
        DiskRef {
            path: "/dev/sda".to_string(),
            table: TableKind::Msdos,
            size: 100 * 1024 * 1024 * 1024,
            major: 8,
            minor: 0,
            sector_size: 512,
        }
    }

    fn part(number: u32, first_byte: u64, last_byte: u64) -> Partition {
        let disk = disk_ref();
        Partition {
            path: Partition::make_path(&disk.path, number),
            disk,
            number,
            first_byte,
            last_byte,
        }
    }

    /// Free pseudo-partitions plus the real ones must tile the usable range.
    fn assert_contiguous(parts: &[Partition], first_usable: u64, last_usable: u64) {
        assert_eq!(parts.first().unwrap().first_byte, first_usable);
        assert_eq!(parts.last().unwrap().last_byte, last_usable);
        for pair in parts.windows(2) {
            assert_eq!(pair[0].last_byte + 1, pair[1].first_byte);
        }
    }

    #[test]
    fn test_make_path() {
        assert_eq!(Partition::make_path("/dev/sda", 1), "/dev/sda1");
        assert_eq!(Partition::make_path("/dev/loop0", 1), "/dev/loop0p1");
        assert_eq!(Partition::make_path("/dev/nvme0n1", 3), "/dev/nvme0n1p3");
    }

    #[test]
    fn test_extract_part_number() {
        assert_eq!(
            extract_part_number("/dev/sda1").unwrap(),
            ("/dev/sda".to_string(), 1)
        );
        assert_eq!(
            extract_part_number("/dev/sda12").unwrap(),
            ("/dev/sda".to_string(), 12)
        );
        assert_eq!(
            extract_part_number("/dev/loop0p1").unwrap(),
            ("/dev/loop0".to_string(), 1)
        );
        assert_eq!(
            extract_part_number("/dev/nvme0n1p3").unwrap(),
            ("/dev/nvme0n1".to_string(), 3)
        );
        assert!(extract_part_number("/dev/sda").is_err());
        assert!(extract_part_number("/dev/mapper/vg-lv").is_err());
    }

    #[test]
    fn test_fill_free_space_gaps_and_ends() {
        let gb = 1024 * 1024 * 1024u64;
        let last_usable = 100 * gb - 1;
        let parts = vec![part(1, 5 * gb, 6 * gb - 1), part(2, 10 * gb, 11 * gb - 1)];
        let filled = fill_free_space(&disk_ref(), parts, 32256, last_usable).unwrap();

        assert_contiguous(&filled, 32256, last_usable);
        let numbers: Vec<u32> = filled.iter().map(|p| p.number).collect();
        assert_eq!(numbers, vec![0, 1, 0, 2, 0]);
        // Trailing free space sits after partition 2.
        assert_eq!(filled[4].first_byte, 11 * gb);
        assert_eq!(filled[4].last_byte, last_usable);
    }

    #[test]
    fn test_fill_free_space_adjacent_partitions() {
        let gb = 1024 * 1024 * 1024u64;
        let parts = vec![part(1, 32256, gb - 1), part(2, gb, 2 * gb - 1)];
        let filled = fill_free_space(&disk_ref(), parts, 32256, 100 * gb - 1).unwrap();
        let numbers: Vec<u32> = filled.iter().map(|p| p.number).collect();
        assert_eq!(numbers, vec![1, 2, 0]);
        assert_contiguous(&filled, 32256, 100 * gb - 1);
    }

    #[test]
    fn test_fill_free_space_overlap_fails() {
        let gb = 1024 * 1024 * 1024u64;
        let parts = vec![part(1, 32256, 2 * gb), part(2, gb, 3 * gb)];
        let err = fill_free_space(&disk_ref(), parts, 32256, 100 * gb - 1).unwrap_err();
        assert!(err.to_string().contains("OVERLAP PARTITIONS"));
    }

    #[test]
    fn test_fill_free_space_legacy_first_partition() {
        // First partition slightly above the computed start: the lead-in
        // fragment is suppressed and the usable range starts at the
        // partition.
        let parts = vec![part(1, 1024 * 1024, 10 * 1024 * 1024 - 1)];
        let filled =
            fill_free_space(&disk_ref(), parts, 32256, 20 * 1024 * 1024 - 1).unwrap();
        assert_eq!(filled[0].number, 1);
        assert_eq!(filled[0].first_byte, 1024 * 1024);
        assert_contiguous(&filled, 1024 * 1024, 20 * 1024 * 1024 - 1);
    }

    #[test]
    fn test_fill_free_space_partition_below_usable_start_fails() {
        let parts = vec![part(1, 16384, 1024 * 1024 - 1)];
        let err = fill_free_space(&disk_ref(), parts, 32256, 10 * 1024 * 1024 - 1).unwrap_err();
        assert!(err.to_string().contains("OVERLAP PARTITIONS"));
    }

    #[test]
    fn test_read_table_msdos() {
        let size = 64 * 1024 * 1024u64;
        let mut image = Cursor::new(vec![0u8; size as usize]);
        let mut mbr = mbrman::MBR::new_from(&mut image, 512, [0x12, 0x34, 0x56, 0x78]).unwrap();
        mbr[1] = mbrman::MBRPartitionEntry {
            boot: mbrman::BOOT_INACTIVE,
            first_chs: mbrman::CHS::empty(),
            sys: 0x83,
            last_chs: mbrman::CHS::empty(),
            starting_lba: 63,
            sectors: 2048,
        };
        mbr.write_into(&mut image).unwrap();

        let disk = read_table(&mut image, "/dev/sda", 8, 0, 512, size).unwrap();
        assert_eq!(disk.table, TableKind::Msdos);
        let real: Vec<&Partition> = disk.partitions.iter().filter(|p| !p.is_free_space()).collect();
        assert_eq!(real.len(), 1);
        assert_eq!(real[0].number, 1);
        assert_eq!(real[0].first_byte, 63 * 512);
        assert_eq!(real[0].last_byte, (63 + 2048) * 512 - 1);
        assert_eq!(real[0].path, "/dev/sda1");
        assert_contiguous(&disk.partitions, 63 * 512, size - 1);
    }

    #[test]
    fn test_read_table_gpt() {
        let size = 64 * 1024 * 1024u64;
        let mut image = Cursor::new(vec![0u8; size as usize]);
        let mut gpt = gptman::GPT::new_from(&mut image, 512, [0xab; 16]).unwrap();
        let first = gpt.header.first_usable_lba;
        gpt[1] = gptman::GPTPartitionEntry {
            partition_type_guid: GPT_TYPE_LVM,
            unique_partition_guid: [0xcd; 16],
            starting_lba: first,
            ending_lba: first + 2047,
            attribute_bits: 0,
            partition_name: "".into(),
        };
        gpt.write_into(&mut image).unwrap();
        gptman::GPT::write_protective_mbr_into(&mut image, 512).unwrap();

        let disk = read_table(&mut image, "/dev/sdb", 8, 16, 512, size).unwrap();
        assert_eq!(disk.table, TableKind::Gpt);
        let real: Vec<&Partition> = disk.partitions.iter().filter(|p| !p.is_free_space()).collect();
        assert_eq!(real.len(), 1);
        assert_eq!(real[0].number, 1);
        assert_eq!(real[0].first_byte, first * 512);
        assert_eq!(real[0].last_byte, (first + 2048) * 512 - 1);
        // Free space runs to the GPT last usable LBA, not the disk end.
        let last = disk.partitions.last().unwrap();
        assert!(last.is_free_space());
        assert!(last.last_byte < size - 1);
    }
}
