//! Superblock loading, chunk-map bootstrap and the top level parse entry
//! point.
//!
//! Opening a volume is a fixed dance: read the superblock at
//! `partition_offset + 0x10000`, seed the chunk map from the embedded
//! sys_chunk_array, then walk the chunk tree proper to complete the map.
//! Everything after that reads tree blocks through [`Volume`].

use std::path::Path;

use log::{info, warn};

use crate::address::ChunkMap;
use crate::entry::{self, FileEntry};
use crate::filesystem::FileSystem;
use crate::image::ImageFile;
use crate::structures::*;
use crate::tree::TreeItems;
use crate::{BtrfsError, Result};

/// Decoded superblock fields this tool consumes.
#[derive(Clone, Debug)]
pub struct Superblock {
    pub fsid: [u8; BTRFS_FSID_SIZE],
    pub generation: u64,
    pub root: u64,
    pub chunk_root: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub num_devices: u64,
    pub sectorsize: u32,
    pub nodesize: u32,
    pub root_level: u8,
    pub chunk_root_level: u8,
    pub label: String,
    pub sys_chunk_array_size: u32,
    pub sys_chunk_array: Vec<u8>,
}

pub fn decode_superblock(buf: &[u8]) -> Result<Superblock> {
    if read_bytes(buf, SB_MAGIC_OFFSET, 8)? != BTRFS_MAGIC {
        return Err(BtrfsError::NotBtrfs);
    }

    let mut fsid = [0u8; BTRFS_FSID_SIZE];
    fsid.copy_from_slice(&read_bytes(buf, 32, BTRFS_FSID_SIZE)?);

    let label_raw = read_bytes(buf, SB_LABEL_OFFSET, BTRFS_LABEL_SIZE)?;
    let label_end = label_raw.iter().position(|&b| b == 0).unwrap_or(label_raw.len());
    let label = String::from_utf8_lossy(&label_raw[..label_end]).into_owned();

    let sys_chunk_array_size =
        read_u32(buf, SB_SYS_CHUNK_ARRAY_SIZE_OFFSET)?.min(BTRFS_SYSTEM_CHUNK_ARRAY_SIZE as u32);

    Ok(Superblock {
        fsid,
        generation: read_u64(buf, SB_GENERATION_OFFSET)?,
        root: read_u64(buf, SB_ROOT_OFFSET)?,
        chunk_root: read_u64(buf, SB_CHUNK_ROOT_OFFSET)?,
        total_bytes: read_u64(buf, SB_TOTAL_BYTES_OFFSET)?,
        bytes_used: read_u64(buf, SB_BYTES_USED_OFFSET)?,
        num_devices: read_u64(buf, SB_NUM_DEVICES_OFFSET)?,
        sectorsize: read_u32(buf, SB_SECTORSIZE_OFFSET)?,
        nodesize: read_u32(buf, SB_NODESIZE_OFFSET)?,
        root_level: read_u8(buf, SB_ROOT_LEVEL_OFFSET)?,
        chunk_root_level: read_u8(buf, SB_CHUNK_ROOT_LEVEL_OFFSET)?,
        label,
        sys_chunk_array_size,
        sys_chunk_array: read_bytes(
            buf,
            SB_SYS_CHUNK_ARRAY_OFFSET,
            sys_chunk_array_size as usize,
        )?,
    })
}

/// An opened image with its superblock and completed chunk map.
pub struct Volume {
    pub image: ImageFile,
    pub superblock: Superblock,
    pub chunk_map: ChunkMap,
}

impl Volume {
    /// Open the image, validate the superblock at `partition_offset +
    /// 0x10000` and build the full logical address map.
    pub fn open(path: &Path, partition_offset: u64) -> Result<Volume> {
        let image = ImageFile::open(path)?;
        let superblock = load_superblock(&image, partition_offset)?;
        info!(
            "superblock ok: label {:?}, nodesize {}, generation {}",
            superblock.label, superblock.nodesize, superblock.generation
        );

        let mut chunk_map = ChunkMap::new(partition_offset);
        bootstrap_chunks(&superblock, &mut chunk_map);
        info!("sys_chunk_array seeded {} mappings", chunk_map.len());

        let mut volume = Volume {
            image,
            superblock,
            chunk_map,
        };
        read_chunk_tree(&mut volume);
        info!("chunk map complete with {} mappings", volume.chunk_map.len());

        Ok(volume)
    }

    /// Read the `nodesize` bytes of the tree block at a logical address.
    pub fn read_tree_block(&self, logical: u64) -> Result<Vec<u8>> {
        let physical = self.chunk_map.translate(logical)?;
        self.image
            .read_at(physical, self.superblock.nodesize as usize)
    }

    /// Read an arbitrary span of mapped logical address space.
    pub fn read_logical(&self, logical: u64, len: usize) -> Result<Vec<u8>> {
        let physical = self.chunk_map.translate(logical)?;
        self.image.read_at(physical, len)
    }
}

fn load_superblock(image: &ImageFile, partition_offset: u64) -> Result<Superblock> {
    let offset = partition_offset + BTRFS_SUPER_INFO_OFFSET;
    let buf = image.read_at(offset, BTRFS_SUPER_INFO_SIZE).map_err(|e| {
        // an image too small to hold a superblock is not btrfs either
        match e {
            BtrfsError::ShortRead { .. } => BtrfsError::NotBtrfs,
            other => other,
        }
    })?;
    decode_superblock(&buf)
}

/// Seed the chunk map from the superblock's embedded `(Key, Chunk)`
/// pairs. A malformed record ends the scan; whatever was decoded before
/// it stays in the map.
fn bootstrap_chunks(superblock: &Superblock, map: &mut ChunkMap) {
    let array = &superblock.sys_chunk_array;
    let size = (superblock.sys_chunk_array_size as usize).min(array.len());
    let mut offset = 0usize;

    while offset < size {
        let key = match decode_key(array, offset) {
            Ok(key) => key,
            Err(e) => {
                warn!("sys_chunk_array truncated at offset {offset}: {e}");
                return;
            }
        };
        if key.ty != BTRFS_CHUNK_ITEM_KEY {
            warn!(
                "unexpected item type {} in sys_chunk_array at offset {offset}",
                key.ty
            );
            return;
        }
        offset += BTRFS_KEY_SIZE;

        let chunk = match decode_chunk(array, offset) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("sys_chunk_array chunk truncated at offset {offset}: {e}");
                return;
            }
        };
        offset += chunk.encoded_size();

        insert_chunk(map, key.offset, &chunk);
    }
}

fn insert_chunk(map: &mut ChunkMap, logical: u64, chunk: &BtrfsChunk) {
    let Some(stripe) = chunk.stripes.first() else {
        warn!("chunk at {logical:#x} has no stripes, skipping");
        return;
    };
    if chunk.num_stripes > 1 {
        warn!(
            "chunk at {logical:#x} has {} stripes, using stripe 0 only",
            chunk.num_stripes
        );
    }
    map.add(logical, chunk.length, stripe.offset);
}

/// Walk the chunk tree rooted at `chunk_root` and install every
/// CHUNK_ITEM, overriding the bootstrap entries where they overlap.
fn read_chunk_tree(volume: &mut Volume) {
    let mut found = Vec::new();
    for (key, payload) in TreeItems::new(volume, volume.superblock.chunk_root) {
        if key.ty != BTRFS_CHUNK_ITEM_KEY {
            continue;
        }
        match decode_chunk(&payload, 0) {
            Ok(chunk) => found.push((key.offset, chunk)),
            Err(e) => warn!("bad chunk item at logical {:#x}: {e}", key.offset),
        }
    }
    for (logical, chunk) in found {
        insert_chunk(&mut volume.chunk_map, logical, &chunk);
    }
}

/// Options of [`parse`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ParseOptions {
    /// Stop after the superblock; return no entries.
    pub info_only: bool,
    /// Emit progress on the log side channel.
    pub verbose: bool,
}

/// Parse the btrfs volume at `partition_offset` inside the image and
/// return its superblock plus one entry per inode.
///
/// Only a missing superblock (or an unreadable image) is fatal; damaged
/// records, unmapped addresses and undecodable extents degrade the
/// affected entries instead.
pub fn parse(
    image_path: &Path,
    partition_offset: u64,
    options: ParseOptions,
) -> Result<(Superblock, Vec<FileEntry>)> {
    let volume = Volume::open(image_path, partition_offset)?;
    let superblock = volume.superblock.clone();

    if options.info_only {
        return Ok((superblock, Vec::new()));
    }

    let fs = FileSystem::reconstruct(&volume);
    if options.verbose {
        info!(
            "reconstructed {} inodes across {} subvolumes",
            fs.inodes.len(),
            fs.subvolumes.len()
        );
    }

    let entries = entry::emit_entries(&volume, &fs);
    Ok((superblock, entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{ByteOrder, LittleEndian};

    fn minimal_superblock_bytes() -> Vec<u8> {
        let mut buf = vec![0u8; BTRFS_SUPER_INFO_SIZE];
        buf[SB_MAGIC_OFFSET..SB_MAGIC_OFFSET + 8].copy_from_slice(&BTRFS_MAGIC);
        LittleEndian::write_u64(&mut buf[SB_ROOT_OFFSET..SB_ROOT_OFFSET + 8], 0x40_4000);
        LittleEndian::write_u64(
            &mut buf[SB_CHUNK_ROOT_OFFSET..SB_CHUNK_ROOT_OFFSET + 8],
            0x40_0000,
        );
        LittleEndian::write_u32(&mut buf[SB_NODESIZE_OFFSET..SB_NODESIZE_OFFSET + 4], 16384);
        LittleEndian::write_u32(
            &mut buf[SB_SECTORSIZE_OFFSET..SB_SECTORSIZE_OFFSET + 4],
            4096,
        );
        buf[SB_LABEL_OFFSET..SB_LABEL_OFFSET + 4].copy_from_slice(b"test");
        buf
    }

    #[test]
    fn superblock_magic_is_required() {
        let mut buf = minimal_superblock_bytes();
        buf[SB_MAGIC_OFFSET] = b'X';
        assert!(matches!(decode_superblock(&buf), Err(BtrfsError::NotBtrfs)));
    }

    #[test]
    fn superblock_fields_decode() {
        let buf = minimal_superblock_bytes();
        let sb = decode_superblock(&buf).unwrap();
        assert_eq!(sb.root, 0x40_4000);
        assert_eq!(sb.chunk_root, 0x40_0000);
        assert_eq!(sb.nodesize, 16384);
        assert_eq!(sb.sectorsize, 4096);
        assert_eq!(sb.label, "test");
        assert_eq!(sb.sys_chunk_array_size, 0);
    }

    #[test]
    fn bootstrap_reads_sys_chunk_array() {
        let mut buf = minimal_superblock_bytes();
        // one (key, chunk) pair mapping [0x40_0000, +1MiB) -> 0x8_0000
        let base = SB_SYS_CHUNK_ARRAY_OFFSET;
        LittleEndian::write_u64(&mut buf[base..base + 8], BTRFS_FIRST_CHUNK_TREE_OBJECTID);
        buf[base + 8] = BTRFS_CHUNK_ITEM_KEY;
        LittleEndian::write_u64(&mut buf[base + 9..base + 17], 0x40_0000);
        let chunk = base + BTRFS_KEY_SIZE;
        LittleEndian::write_u64(&mut buf[chunk..chunk + 8], 1 << 20);
        LittleEndian::write_u16(&mut buf[chunk + 44..chunk + 46], 1);
        LittleEndian::write_u64(&mut buf[chunk + 48..chunk + 56], 1); // devid
        LittleEndian::write_u64(&mut buf[chunk + 56..chunk + 64], 0x8_0000);
        let total = BTRFS_KEY_SIZE + BTRFS_CHUNK_FIXED_SIZE + BTRFS_STRIPE_SIZE;
        LittleEndian::write_u32(
            &mut buf[SB_SYS_CHUNK_ARRAY_SIZE_OFFSET..SB_SYS_CHUNK_ARRAY_SIZE_OFFSET + 4],
            total as u32,
        );

        let sb = decode_superblock(&buf).unwrap();
        let mut map = ChunkMap::new(0);
        bootstrap_chunks(&sb, &mut map);
        assert_eq!(map.len(), 1);
        assert_eq!(map.translate(0x40_0000).unwrap(), 0x8_0000);
        assert_eq!(map.translate(0x40_0000 + 0x123).unwrap(), 0x8_0000 + 0x123);
    }

    #[test]
    fn bootstrap_stops_on_bad_type() {
        let mut buf = minimal_superblock_bytes();
        let base = SB_SYS_CHUNK_ARRAY_OFFSET;
        buf[base + 8] = BTRFS_INODE_ITEM_KEY; // not a chunk item
        LittleEndian::write_u32(
            &mut buf[SB_SYS_CHUNK_ARRAY_SIZE_OFFSET..SB_SYS_CHUNK_ARRAY_SIZE_OFFSET + 4],
            64,
        );
        let sb = decode_superblock(&buf).unwrap();
        let mut map = ChunkMap::new(0);
        bootstrap_chunks(&sb, &mut map);
        assert_eq!(map.len(), 0);
    }
}
