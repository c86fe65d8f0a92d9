//! MBR and GPT partition-table scanning.
//!
//! The catalog core only needs a byte offset; this module derives the
//! candidates from the image's partition table. Nothing here validates
//! checksums, it only reads enough structure to enumerate start offsets.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

use crate::image::ImageFile;
use crate::structures::{BTRFS_MAGIC, BTRFS_SUPER_INFO_OFFSET, SB_MAGIC_OFFSET};
use crate::Result;

const SECTOR: u64 = 512;
const MBR_SIGNATURE: u16 = 0xAA55;
const MBR_ENTRY_COUNT: usize = 4;
const MBR_TABLE_OFFSET: usize = 446;
const MBR_TYPE_EXTENDED_CHS: u8 = 0x05;
const MBR_TYPE_EXTENDED_LBA: u8 = 0x0F;
const MBR_TYPE_GPT_PROTECTIVE: u8 = 0xEE;
const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const EBR_CHAIN_LIMIT: usize = 128;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TableKind {
    Mbr,
    Gpt,
}

#[derive(Clone, Debug)]
pub struct PartitionInfo {
    pub index: usize,
    pub start_byte: u64,
    pub len_bytes: u64,
    pub kind: TableKind,
}

/// Probe for the btrfs magic at a candidate partition start.
pub fn is_btrfs_at(image: &ImageFile, partition_offset: u64) -> bool {
    let magic_offset = partition_offset + BTRFS_SUPER_INFO_OFFSET + SB_MAGIC_OFFSET as u64;
    matches!(image.read_at(magic_offset, 8), Ok(magic) if magic == BTRFS_MAGIC)
}

/// Enumerate the partitions of the image, following GPT when the MBR is
/// only protective, and one level of extended-partition chaining
/// otherwise. An image without a table yields an empty list.
pub fn scan_partitions(image: &ImageFile) -> Result<Vec<PartitionInfo>> {
    let mbr = match image.read_at(0, SECTOR as usize) {
        Ok(mbr) => mbr,
        Err(_) => return Ok(Vec::new()), // smaller than one sector
    };
    if LittleEndian::read_u16(&mbr[510..512]) != MBR_SIGNATURE {
        return Ok(Vec::new());
    }

    let mut partitions = Vec::new();
    for slot in 0..MBR_ENTRY_COUNT {
        let entry = &mbr[MBR_TABLE_OFFSET + slot * 16..MBR_TABLE_OFFSET + (slot + 1) * 16];
        let ptype = entry[4];
        let lba_start = LittleEndian::read_u32(&entry[8..12]) as u64;
        let sectors = LittleEndian::read_u32(&entry[12..16]) as u64;

        match ptype {
            0x00 => {}
            MBR_TYPE_GPT_PROTECTIVE => {
                return scan_gpt(image);
            }
            MBR_TYPE_EXTENDED_CHS | MBR_TYPE_EXTENDED_LBA => {
                scan_extended(image, lba_start, &mut partitions);
            }
            _ => partitions.push(PartitionInfo {
                index: partitions.len(),
                start_byte: lba_start * SECTOR,
                len_bytes: sectors * SECTOR,
                kind: TableKind::Mbr,
            }),
        }
    }
    Ok(partitions)
}

/// Walk the linked list of extended boot records. Each EBR holds one
/// logical partition (relative to itself) and an optional link to the
/// next EBR (relative to the extended partition's start).
fn scan_extended(image: &ImageFile, extended_start_lba: u64, partitions: &mut Vec<PartitionInfo>) {
    let mut ebr_lba = extended_start_lba;
    for _ in 0..EBR_CHAIN_LIMIT {
        let Ok(ebr) = image.read_at(ebr_lba * SECTOR, SECTOR as usize) else {
            warn!("unreadable extended boot record at LBA {ebr_lba}");
            return;
        };
        if LittleEndian::read_u16(&ebr[510..512]) != MBR_SIGNATURE {
            return;
        }

        let first = &ebr[MBR_TABLE_OFFSET..MBR_TABLE_OFFSET + 16];
        let rel_start = LittleEndian::read_u32(&first[8..12]) as u64;
        let sectors = LittleEndian::read_u32(&first[12..16]) as u64;
        if first[4] != 0 && sectors != 0 {
            partitions.push(PartitionInfo {
                index: partitions.len(),
                start_byte: (ebr_lba + rel_start) * SECTOR,
                len_bytes: sectors * SECTOR,
                kind: TableKind::Mbr,
            });
        }

        let link = &ebr[MBR_TABLE_OFFSET + 16..MBR_TABLE_OFFSET + 32];
        let link_rel = LittleEndian::read_u32(&link[8..12]) as u64;
        if link[4] == 0 || link_rel == 0 {
            return;
        }
        ebr_lba = extended_start_lba + link_rel;
    }
    warn!("extended partition chain longer than {EBR_CHAIN_LIMIT}, stopping");
}

fn scan_gpt(image: &ImageFile) -> Result<Vec<PartitionInfo>> {
    let header = image.read_at(SECTOR, SECTOR as usize)?;
    if &header[0..8] != GPT_SIGNATURE {
        warn!("protective MBR without a GPT header");
        return Ok(Vec::new());
    }

    let entries_lba = LittleEndian::read_u64(&header[72..80]);
    let entry_count = LittleEndian::read_u32(&header[80..84]) as usize;
    let entry_size = LittleEndian::read_u32(&header[84..88]) as usize;
    debug!("gpt: {entry_count} entries of {entry_size} bytes at LBA {entries_lba}");
    if entry_size < 128 || entry_count > 1024 {
        warn!("implausible GPT entry geometry ({entry_count} x {entry_size})");
        return Ok(Vec::new());
    }

    let table = image.read_at(entries_lba * SECTOR, entry_count * entry_size)?;
    let mut partitions = Vec::new();
    for slot in 0..entry_count {
        let entry = &table[slot * entry_size..(slot + 1) * entry_size];
        if entry[0..16].iter().all(|&b| b == 0) {
            continue; // unused slot
        }
        let first_lba = LittleEndian::read_u64(&entry[32..40]);
        let last_lba = LittleEndian::read_u64(&entry[40..48]);
        if last_lba < first_lba {
            continue;
        }
        partitions.push(PartitionInfo {
            index: partitions.len(),
            start_byte: first_lba * SECTOR,
            len_bytes: (last_lba - first_lba + 1) * SECTOR,
            kind: TableKind::Gpt,
        });
    }
    Ok(partitions)
}
