//! On-disk btrfs records and their little-endian decoders.
//!
//! Every structure here is a plain record holding already-decoded fields;
//! the `decode_*` functions read from `(buffer, offset)` and fail with
//! [`BtrfsError::TruncatedRecord`] when the required span does not fit.
//! Variable-length tails (names, xattr values, inline data) are bounded by
//! their length prefixes but never trusted beyond the enclosing buffer.

use byteorder::{ByteOrder, LittleEndian};
use static_assertions::const_assert;

use crate::{BtrfsError, Result};

pub const BTRFS_SUPER_INFO_OFFSET: u64 = 0x10000;
pub const BTRFS_SUPER_INFO_SIZE: usize = 4096;
pub const BTRFS_MAGIC: [u8; 8] = *b"_BHRfS_M";
pub const BTRFS_SYSTEM_CHUNK_ARRAY_SIZE: usize = 2048;
pub const BTRFS_LABEL_SIZE: usize = 256;
pub const BTRFS_FSID_SIZE: usize = 16;
pub const BTRFS_UUID_SIZE: usize = 16;
pub const BTRFS_SECTOR_SIZE: usize = 4096;

/* superblock field offsets, relative to the start of the block */
pub const SB_MAGIC_OFFSET: usize = 0x40;
pub const SB_GENERATION_OFFSET: usize = 0x48;
pub const SB_ROOT_OFFSET: usize = 0x50;
pub const SB_CHUNK_ROOT_OFFSET: usize = 0x58;
pub const SB_TOTAL_BYTES_OFFSET: usize = 0x70;
pub const SB_BYTES_USED_OFFSET: usize = 0x78;
pub const SB_NUM_DEVICES_OFFSET: usize = 0x88;
pub const SB_SECTORSIZE_OFFSET: usize = 0x90;
pub const SB_NODESIZE_OFFSET: usize = 0x94;
pub const SB_SYS_CHUNK_ARRAY_SIZE_OFFSET: usize = 0xA0;
pub const SB_ROOT_LEVEL_OFFSET: usize = 0xC6;
pub const SB_CHUNK_ROOT_LEVEL_OFFSET: usize = 0xC7;
pub const SB_LABEL_OFFSET: usize = 0x12B;
pub const SB_SYS_CHUNK_ARRAY_OFFSET: usize = 0x32B;

const_assert!(SB_SYS_CHUNK_ARRAY_OFFSET + BTRFS_SYSTEM_CHUNK_ARRAY_SIZE <= BTRFS_SUPER_INFO_SIZE);
const_assert!(SB_LABEL_OFFSET + BTRFS_LABEL_SIZE <= SB_SYS_CHUNK_ARRAY_OFFSET);

/* fixed record sizes */
pub const BTRFS_KEY_SIZE: usize = 17;
pub const BTRFS_HEADER_SIZE: usize = 101;
pub const BTRFS_ITEM_SIZE: usize = 25;
pub const BTRFS_KEY_PTR_SIZE: usize = 33;
pub const BTRFS_CHUNK_FIXED_SIZE: usize = 48;
pub const BTRFS_STRIPE_SIZE: usize = 32;
pub const BTRFS_INODE_ITEM_SIZE: usize = 160;
pub const BTRFS_DIR_ITEM_HEADER_SIZE: usize = 30;
pub const BTRFS_INODE_REF_HEADER_SIZE: usize = 10;
pub const BTRFS_EXTENT_DATA_HEADER_SIZE: usize = 21;
pub const BTRFS_EXTENT_DATA_REG_SIZE: usize = 53;
pub const BTRFS_ROOT_ITEM_BYTENR_OFFSET: usize = 176;

const_assert!(BTRFS_ITEM_SIZE == BTRFS_KEY_SIZE + 8);
const_assert!(BTRFS_KEY_PTR_SIZE == BTRFS_KEY_SIZE + 16);
const_assert!(BTRFS_EXTENT_DATA_REG_SIZE == BTRFS_EXTENT_DATA_HEADER_SIZE + 32);
const_assert!(BTRFS_ROOT_ITEM_BYTENR_OFFSET == BTRFS_INODE_ITEM_SIZE + 16);

/* well known tree object ids */
pub const BTRFS_ROOT_TREE_OBJECTID: u64 = 1;
pub const BTRFS_EXTENT_TREE_OBJECTID: u64 = 2;
pub const BTRFS_CHUNK_TREE_OBJECTID: u64 = 3;
pub const BTRFS_DEV_TREE_OBJECTID: u64 = 4;
pub const BTRFS_FS_TREE_OBJECTID: u64 = 5;
pub const BTRFS_ROOT_TREE_DIR_OBJECTID: u64 = 6;
pub const BTRFS_CSUM_TREE_OBJECTID: u64 = 7;
pub const BTRFS_FIRST_FREE_OBJECTID: u64 = 256;
pub const BTRFS_LAST_FREE_OBJECTID: u64 = u64::MAX - 256;
pub const BTRFS_FIRST_CHUNK_TREE_OBJECTID: u64 = 256;

/* leaf item types */
pub const BTRFS_INODE_ITEM_KEY: u8 = 1;
pub const BTRFS_INODE_REF_KEY: u8 = 12;
pub const BTRFS_INODE_EXTREF_KEY: u8 = 13;
pub const BTRFS_XATTR_ITEM_KEY: u8 = 24;
pub const BTRFS_DIR_ITEM_KEY: u8 = 84;
pub const BTRFS_DIR_INDEX_KEY: u8 = 96;
pub const BTRFS_EXTENT_DATA_KEY: u8 = 108;
pub const BTRFS_EXTENT_CSUM_KEY: u8 = 128;
pub const BTRFS_ROOT_ITEM_KEY: u8 = 132;
pub const BTRFS_ROOT_REF_KEY: u8 = 156;
pub const BTRFS_CHUNK_ITEM_KEY: u8 = 228;

/* EXTENT_DATA layouts */
pub const BTRFS_FILE_EXTENT_INLINE: u8 = 0;
pub const BTRFS_FILE_EXTENT_REG: u8 = 1;
pub const BTRFS_FILE_EXTENT_PREALLOC: u8 = 2;

/* compression codes */
pub const BTRFS_COMPRESS_NONE: u8 = 0;
pub const BTRFS_COMPRESS_ZLIB: u8 = 1;
pub const BTRFS_COMPRESS_LZO: u8 = 2;
pub const BTRFS_COMPRESS_ZSTD: u8 = 3;

/// Inode flag bits, in bit-index order.
pub const BTRFS_INODE_FLAG_NAMES: [&str; 12] = [
    "NODATASUM",
    "NODATACOW",
    "READONLY",
    "NOCOMPRESS",
    "PREALLOC",
    "SYNC",
    "IMMUTABLE",
    "APPEND",
    "NODUMP",
    "NOATIME",
    "DIRSYNC",
    "COMPRESS",
];

fn span(buf: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    let end = offset.checked_add(len).ok_or(BtrfsError::TruncatedRecord {
        offset,
        needed: len,
        available: 0,
    })?;
    buf.get(offset..end).ok_or(BtrfsError::TruncatedRecord {
        offset,
        needed: len,
        available: buf.len().saturating_sub(offset),
    })
}

pub fn read_u8(buf: &[u8], offset: usize) -> Result<u8> {
    Ok(span(buf, offset, 1)?[0])
}

pub fn read_u16(buf: &[u8], offset: usize) -> Result<u16> {
    Ok(LittleEndian::read_u16(span(buf, offset, 2)?))
}

pub fn read_u32(buf: &[u8], offset: usize) -> Result<u32> {
    Ok(LittleEndian::read_u32(span(buf, offset, 4)?))
}

pub fn read_u64(buf: &[u8], offset: usize) -> Result<u64> {
    Ok(LittleEndian::read_u64(span(buf, offset, 8)?))
}

pub fn read_bytes(buf: &[u8], offset: usize, len: usize) -> Result<Vec<u8>> {
    Ok(span(buf, offset, len)?.to_vec())
}

/// Universal item identifier; orders lexicographically by
/// `(objectid, ty, offset)`, which the derived `Ord` provides.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BtrfsKey {
    pub objectid: u64,
    pub ty: u8,
    pub offset: u64,
}

pub fn decode_key(buf: &[u8], offset: usize) -> Result<BtrfsKey> {
    Ok(BtrfsKey {
        objectid: read_u64(buf, offset)?,
        ty: read_u8(buf, offset + 8)?,
        offset: read_u64(buf, offset + 9)?,
    })
}

/// Tree block header. `bytenr` is the block's own logical address and is
/// advisory only; traversal trusts the address it reached the block by.
#[derive(Clone, Copy, Debug, Default)]
pub struct BtrfsHeader {
    pub bytenr: u64,
    pub generation: u64,
    pub owner: u64,
    pub nritems: u32,
    pub level: u8,
}

pub fn decode_header(buf: &[u8], offset: usize) -> Result<BtrfsHeader> {
    span(buf, offset, BTRFS_HEADER_SIZE)?;
    Ok(BtrfsHeader {
        bytenr: read_u64(buf, offset + 48)?,
        generation: read_u64(buf, offset + 80)?,
        owner: read_u64(buf, offset + 88)?,
        nritems: read_u32(buf, offset + 96)?,
        level: read_u8(buf, offset + 100)?,
    })
}

/// Leaf item descriptor; `offset` counts from the end of the header.
#[derive(Clone, Copy, Debug)]
pub struct BtrfsItem {
    pub key: BtrfsKey,
    pub offset: u32,
    pub size: u32,
}

pub fn decode_item(buf: &[u8], offset: usize) -> Result<BtrfsItem> {
    Ok(BtrfsItem {
        key: decode_key(buf, offset)?,
        offset: read_u32(buf, offset + BTRFS_KEY_SIZE)?,
        size: read_u32(buf, offset + BTRFS_KEY_SIZE + 4)?,
    })
}

/// Internal node child pointer; `blockptr` is a logical address.
#[derive(Clone, Copy, Debug)]
pub struct BtrfsKeyPtr {
    pub key: BtrfsKey,
    pub blockptr: u64,
    pub generation: u64,
}

pub fn decode_key_ptr(buf: &[u8], offset: usize) -> Result<BtrfsKeyPtr> {
    Ok(BtrfsKeyPtr {
        key: decode_key(buf, offset)?,
        blockptr: read_u64(buf, offset + BTRFS_KEY_SIZE)?,
        generation: read_u64(buf, offset + BTRFS_KEY_SIZE + 8)?,
    })
}

#[derive(Clone, Copy, Debug)]
pub struct BtrfsStripe {
    pub devid: u64,
    pub offset: u64,
    pub dev_uuid: [u8; BTRFS_UUID_SIZE],
}

pub fn decode_stripe(buf: &[u8], offset: usize) -> Result<BtrfsStripe> {
    let uuid = span(buf, offset + 16, BTRFS_UUID_SIZE)?;
    let mut dev_uuid = [0u8; BTRFS_UUID_SIZE];
    dev_uuid.copy_from_slice(uuid);
    Ok(BtrfsStripe {
        devid: read_u64(buf, offset)?,
        offset: read_u64(buf, offset + 8)?,
        dev_uuid,
    })
}

/// Chunk record: a run of logical address space backed by `num_stripes`
/// physical stripes. Stripe 0 is the only one this parser consults.
#[derive(Clone, Debug)]
pub struct BtrfsChunk {
    pub length: u64,
    pub owner: u64,
    pub stripe_len: u64,
    pub ty: u64,
    pub num_stripes: u16,
    pub sub_stripes: u16,
    pub stripes: Vec<BtrfsStripe>,
}

impl BtrfsChunk {
    /// Total encoded size, stripes included.
    pub fn encoded_size(&self) -> usize {
        BTRFS_CHUNK_FIXED_SIZE + self.stripes.len() * BTRFS_STRIPE_SIZE
    }
}

pub fn decode_chunk(buf: &[u8], offset: usize) -> Result<BtrfsChunk> {
    let num_stripes = read_u16(buf, offset + 44)?;
    let mut stripes = Vec::with_capacity(num_stripes as usize);
    let mut at = offset + BTRFS_CHUNK_FIXED_SIZE;
    for _ in 0..num_stripes {
        stripes.push(decode_stripe(buf, at)?);
        at += BTRFS_STRIPE_SIZE;
    }
    Ok(BtrfsChunk {
        length: read_u64(buf, offset)?,
        owner: read_u64(buf, offset + 8)?,
        stripe_len: read_u64(buf, offset + 16)?,
        ty: read_u64(buf, offset + 24)?,
        num_stripes,
        sub_stripes: read_u16(buf, offset + 46)?,
        stripes,
    })
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BtrfsTimespec {
    pub sec: u64,
    pub nsec: u32,
}

pub fn decode_timespec(buf: &[u8], offset: usize) -> Result<BtrfsTimespec> {
    Ok(BtrfsTimespec {
        sec: read_u64(buf, offset)?,
        nsec: read_u32(buf, offset + 8)?,
    })
}

/// Decoded INODE_ITEM payload.
#[derive(Clone, Copy, Debug, Default)]
pub struct BtrfsInodeItem {
    pub generation: u64,
    pub transid: u64,
    pub size: u64,
    pub nbytes: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub rdev: u64,
    pub flags: u64,
    pub atime: BtrfsTimespec,
    pub ctime: BtrfsTimespec,
    pub mtime: BtrfsTimespec,
    pub otime: BtrfsTimespec,
}

pub fn decode_inode_item(buf: &[u8], offset: usize) -> Result<BtrfsInodeItem> {
    span(buf, offset, BTRFS_INODE_ITEM_SIZE)?;
    Ok(BtrfsInodeItem {
        generation: read_u64(buf, offset)?,
        transid: read_u64(buf, offset + 8)?,
        size: read_u64(buf, offset + 16)?,
        nbytes: read_u64(buf, offset + 24)?,
        nlink: read_u32(buf, offset + 40)?,
        uid: read_u32(buf, offset + 44)?,
        gid: read_u32(buf, offset + 48)?,
        mode: read_u32(buf, offset + 52)?,
        rdev: read_u64(buf, offset + 56)?,
        flags: read_u64(buf, offset + 64)?,
        atime: decode_timespec(buf, offset + 112)?,
        ctime: decode_timespec(buf, offset + 124)?,
        mtime: decode_timespec(buf, offset + 136)?,
        otime: decode_timespec(buf, offset + 148)?,
    })
}

/// One entry of a DIR_ITEM / DIR_INDEX / XATTR_ITEM payload. A single
/// item may pack several entries back to back; use [`decode_dir_entries`]
/// to consume them all.
#[derive(Clone, Debug)]
pub struct BtrfsDirEntry {
    pub location: BtrfsKey,
    pub transid: u64,
    pub ty: u8,
    pub name: Vec<u8>,
    pub data: Vec<u8>,
}

pub fn decode_dir_entry(buf: &[u8], offset: usize) -> Result<(BtrfsDirEntry, usize)> {
    let location = decode_key(buf, offset)?;
    let transid = read_u64(buf, offset + 17)?;
    let data_len = read_u16(buf, offset + 25)? as usize;
    let name_len = read_u16(buf, offset + 27)? as usize;
    let ty = read_u8(buf, offset + 29)?;
    let name = read_bytes(buf, offset + BTRFS_DIR_ITEM_HEADER_SIZE, name_len)?;
    let data = read_bytes(buf, offset + BTRFS_DIR_ITEM_HEADER_SIZE + name_len, data_len)?;
    let consumed = BTRFS_DIR_ITEM_HEADER_SIZE + name_len + data_len;
    Ok((
        BtrfsDirEntry {
            location,
            transid,
            ty,
            name,
            data,
        },
        consumed,
    ))
}

/// Consume every packed entry of an item payload. A malformed tail stops
/// the scan; entries decoded so far are still returned.
pub fn decode_dir_entries(payload: &[u8]) -> (Vec<BtrfsDirEntry>, Option<BtrfsError>) {
    let mut entries = Vec::new();
    let mut at = 0;
    while at + BTRFS_DIR_ITEM_HEADER_SIZE <= payload.len() {
        match decode_dir_entry(payload, at) {
            Ok((entry, consumed)) => {
                entries.push(entry);
                at += consumed;
            }
            Err(e) => return (entries, Some(e)),
        }
    }
    (entries, None)
}

/// One name of an INODE_REF payload; like dir items, several may be
/// packed into one item.
#[derive(Clone, Debug)]
pub struct BtrfsInodeRef {
    pub index: u64,
    pub name: Vec<u8>,
}

pub fn decode_inode_ref(buf: &[u8], offset: usize) -> Result<(BtrfsInodeRef, usize)> {
    let index = read_u64(buf, offset)?;
    let name_len = read_u16(buf, offset + 8)? as usize;
    let name = read_bytes(buf, offset + BTRFS_INODE_REF_HEADER_SIZE, name_len)?;
    Ok((
        BtrfsInodeRef { index, name },
        BTRFS_INODE_REF_HEADER_SIZE + name_len,
    ))
}

pub fn decode_inode_refs(payload: &[u8]) -> (Vec<BtrfsInodeRef>, Option<BtrfsError>) {
    let mut refs = Vec::new();
    let mut at = 0;
    while at + BTRFS_INODE_REF_HEADER_SIZE <= payload.len() {
        match decode_inode_ref(payload, at) {
            Ok((r, consumed)) => {
                refs.push(r);
                at += consumed;
            }
            Err(e) => return (refs, Some(e)),
        }
    }
    (refs, None)
}

/// Decoded EXTENT_DATA payload. `inline_data` carries the (possibly still
/// compressed) payload bytes for inline extents; the disk fields are zero
/// in that case.
#[derive(Clone, Debug)]
pub struct BtrfsFileExtentItem {
    pub generation: u64,
    pub ram_bytes: u64,
    pub compression: u8,
    pub encryption: u8,
    pub ty: u8,
    pub disk_bytenr: u64,
    pub disk_num_bytes: u64,
    pub extent_offset: u64,
    pub num_bytes: u64,
    pub inline_data: Option<Vec<u8>>,
}

pub fn decode_file_extent_item(payload: &[u8]) -> Result<BtrfsFileExtentItem> {
    let generation = read_u64(payload, 0)?;
    let ram_bytes = read_u64(payload, 8)?;
    let compression = read_u8(payload, 16)?;
    let encryption = read_u8(payload, 17)?;
    let ty = read_u8(payload, 20)?;

    if ty == BTRFS_FILE_EXTENT_INLINE {
        return Ok(BtrfsFileExtentItem {
            generation,
            ram_bytes,
            compression,
            encryption,
            ty,
            disk_bytenr: 0,
            disk_num_bytes: 0,
            extent_offset: 0,
            num_bytes: ram_bytes,
            inline_data: Some(payload[BTRFS_EXTENT_DATA_HEADER_SIZE..].to_vec()),
        });
    }

    span(payload, 0, BTRFS_EXTENT_DATA_REG_SIZE)?;
    Ok(BtrfsFileExtentItem {
        generation,
        ram_bytes,
        compression,
        encryption,
        ty,
        disk_bytenr: read_u64(payload, 21)?,
        disk_num_bytes: read_u64(payload, 29)?,
        extent_offset: read_u64(payload, 37)?,
        num_bytes: read_u64(payload, 45)?,
        inline_data: None,
    })
}

/// The slice of a ROOT_ITEM this parser needs: where the subvolume's fs
/// tree lives and which directory inode anchors it.
#[derive(Clone, Copy, Debug)]
pub struct BtrfsRootItem {
    pub generation: u64,
    pub root_dirid: u64,
    pub bytenr: u64,
}

pub fn decode_root_item(payload: &[u8]) -> Result<BtrfsRootItem> {
    Ok(BtrfsRootItem {
        generation: read_u64(payload, BTRFS_INODE_ITEM_SIZE)?,
        root_dirid: read_u64(payload, BTRFS_INODE_ITEM_SIZE + 8)?,
        bytenr: read_u64(payload, BTRFS_ROOT_ITEM_BYTENR_OFFSET)?,
    })
}

/// ROOT_REF payload: the key's `offset` names the child subvolume, the
/// payload names it in the parent directory.
#[derive(Clone, Debug)]
pub struct BtrfsRootRef {
    pub dirid: u64,
    pub sequence: u64,
    pub name: Vec<u8>,
}

pub fn decode_root_ref(payload: &[u8]) -> Result<BtrfsRootRef> {
    let name_len = read_u16(payload, 16)? as usize;
    Ok(BtrfsRootRef {
        dirid: read_u64(payload, 0)?,
        sequence: read_u64(payload, 8)?,
        name: read_bytes(payload, 18, name_len)?,
    })
}
