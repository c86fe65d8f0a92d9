//! Fabricated btrfs images for the end-to-end tests.
//!
//! One chunk maps a few MiB of logical space onto the image; every tree
//! is a single leaf inside that chunk. The builder mirrors the on-disk
//! layout the parser expects: items grow forward from the header, their
//! payloads grow backward from the end of the block.

use std::io::Write;

use byteorder::{ByteOrder, LittleEndian};
use tempfile::NamedTempFile;

pub const NODESIZE: usize = 16384;
pub const SECTORSIZE: usize = 4096;
pub const LOGICAL_BASE: u64 = 0x40_0000;
pub const PHYSICAL_BASE: u64 = 0x8_0000;
pub const CHUNK_LEN: u64 = 0x40_0000;

pub const SUPERBLOCK_OFFSET: usize = 0x10000;
pub const MAGIC: &[u8; 8] = b"_BHRfS_M";

pub const INODE_ITEM: u8 = 1;
pub const INODE_REF: u8 = 12;
pub const XATTR_ITEM: u8 = 24;
pub const DIR_ITEM: u8 = 84;
pub const EXTENT_DATA: u8 = 108;
pub const EXTENT_CSUM: u8 = 128;
pub const ROOT_ITEM: u8 = 132;
pub const ROOT_REF: u8 = 156;
pub const CHUNK_ITEM: u8 = 228;

#[derive(Clone, Copy, Debug)]
pub struct Key {
    pub objectid: u64,
    pub ty: u8,
    pub offset: u64,
}

pub fn key(objectid: u64, ty: u8, offset: u64) -> Key {
    Key {
        objectid,
        ty,
        offset,
    }
}

pub struct ImageBuilder {
    buf: Vec<u8>,
    next_block: u64,
    pub label: String,
}

impl ImageBuilder {
    pub fn new() -> ImageBuilder {
        ImageBuilder {
            buf: vec![0u8; (PHYSICAL_BASE + CHUNK_LEN) as usize],
            next_block: LOGICAL_BASE,
            label: String::from("fixture"),
        }
    }

    fn physical(logical: u64) -> usize {
        (PHYSICAL_BASE + (logical - LOGICAL_BASE)) as usize
    }

    fn alloc(&mut self, len: usize, align: usize) -> u64 {
        let align = align as u64;
        let logical = (self.next_block + align - 1) / align * align;
        self.next_block = logical + len as u64;
        assert!(
            self.next_block <= LOGICAL_BASE + CHUNK_LEN,
            "fixture chunk exhausted"
        );
        logical
    }

    /// Write raw bytes into mapped logical space and return their
    /// logical address (usable as an extent's disk_bytenr).
    pub fn write_data(&mut self, data: &[u8]) -> u64 {
        let logical = self.alloc(data.len().max(1), SECTORSIZE);
        let at = Self::physical(logical);
        self.buf[at..at + data.len()].copy_from_slice(data);
        logical
    }

    /// Assemble a leaf block from `(key, payload)` items and place it,
    /// returning its logical address.
    pub fn place_leaf(&mut self, owner: u64, mut items: Vec<(Key, Vec<u8>)>) -> u64 {
        items.sort_by_key(|(k, _)| (k.objectid, k.ty, k.offset));
        let logical = self.alloc(NODESIZE, NODESIZE);

        let mut block = vec![0u8; NODESIZE];
        LittleEndian::write_u64(&mut block[48..56], logical); // bytenr
        LittleEndian::write_u64(&mut block[80..88], 1); // generation
        LittleEndian::write_u64(&mut block[88..96], owner);
        LittleEndian::write_u32(&mut block[96..100], items.len() as u32);
        block[100] = 0; // leaf

        let mut data_end = NODESIZE;
        for (i, (k, payload)) in items.iter().enumerate() {
            data_end -= payload.len();
            block[data_end..data_end + payload.len()].copy_from_slice(payload);
            let item = 101 + i * 25;
            LittleEndian::write_u64(&mut block[item..item + 8], k.objectid);
            block[item + 8] = k.ty;
            LittleEndian::write_u64(&mut block[item + 9..item + 17], k.offset);
            LittleEndian::write_u32(&mut block[item + 17..item + 21], (data_end - 101) as u32);
            LittleEndian::write_u32(&mut block[item + 21..item + 25], payload.len() as u32);
        }

        let at = Self::physical(logical);
        self.buf[at..at + NODESIZE].copy_from_slice(&block);
        logical
    }

    /// Write the superblock and produce the final image file, optionally
    /// shifted behind `partition_offset` bytes of leading space.
    pub fn finish(mut self, root: u64, chunk_root: u64, partition_offset: u64) -> NamedTempFile {
        let mut sb = vec![0u8; 4096];
        sb[0x40..0x48].copy_from_slice(MAGIC);
        LittleEndian::write_u64(&mut sb[0x48..0x50], 1); // generation
        LittleEndian::write_u64(&mut sb[0x50..0x58], root);
        LittleEndian::write_u64(&mut sb[0x58..0x60], chunk_root);
        LittleEndian::write_u64(&mut sb[0x70..0x78], self.buf.len() as u64); // total_bytes
        LittleEndian::write_u64(&mut sb[0x88..0x90], 1); // num_devices
        LittleEndian::write_u32(&mut sb[0x90..0x94], SECTORSIZE as u32);
        LittleEndian::write_u32(&mut sb[0x94..0x98], NODESIZE as u32);
        sb[0x12B..0x12B + self.label.len()].copy_from_slice(self.label.as_bytes());

        // one sys chunk covering everything the fixture allocates
        let array = 0x32B;
        LittleEndian::write_u64(&mut sb[array..array + 8], 256);
        sb[array + 8] = CHUNK_ITEM;
        LittleEndian::write_u64(&mut sb[array + 9..array + 17], LOGICAL_BASE);
        let chunk = array + 17;
        sb[chunk..chunk + 48 + 32].copy_from_slice(&chunk_payload(CHUNK_LEN, PHYSICAL_BASE));
        LittleEndian::write_u32(&mut sb[0xA0..0xA4], (17 + 48 + 32) as u32);

        self.buf[SUPERBLOCK_OFFSET..SUPERBLOCK_OFFSET + 4096].copy_from_slice(&sb);

        let mut file = NamedTempFile::new().expect("tempfile");
        if partition_offset > 0 {
            file.write_all(&vec![0u8; partition_offset as usize])
                .expect("pad");
        }
        file.write_all(&self.buf).expect("image");
        file.flush().expect("flush");
        file
    }

    /// Overwrite the first sector (used by the partition-table tests;
    /// only meaningful together with a nonzero partition offset).
    pub fn raw_first_sector(file: &mut NamedTempFile, sector: &[u8]) {
        use std::io::Seek;
        file.as_file_mut().rewind().expect("rewind");
        file.as_file_mut().write_all(sector).expect("sector");
        file.flush().expect("flush");
    }
}

/* payload encoders */

pub fn chunk_payload(length: u64, stripe_offset: u64) -> Vec<u8> {
    let mut buf = vec![0u8; 48 + 32];
    LittleEndian::write_u64(&mut buf[0..8], length);
    LittleEndian::write_u64(&mut buf[8..16], 2); // owner
    LittleEndian::write_u64(&mut buf[16..24], 0x1_0000); // stripe_len
    LittleEndian::write_u64(&mut buf[24..32], 2); // SYSTEM
    LittleEndian::write_u16(&mut buf[44..46], 1); // num_stripes
    LittleEndian::write_u64(&mut buf[48..56], 1); // devid
    LittleEndian::write_u64(&mut buf[56..64], stripe_offset);
    buf
}

pub struct InodeSpec {
    pub mode: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub flags: u64,
    pub mtime: u64,
}

impl Default for InodeSpec {
    fn default() -> InodeSpec {
        InodeSpec {
            mode: 0o100644,
            size: 0,
            uid: 0,
            gid: 0,
            nlink: 1,
            flags: 0,
            mtime: 1_700_000_000,
        }
    }
}

pub fn inode_payload(spec: &InodeSpec) -> Vec<u8> {
    let mut buf = vec![0u8; 160];
    LittleEndian::write_u64(&mut buf[0..8], 1); // generation
    LittleEndian::write_u64(&mut buf[8..16], 1); // transid
    LittleEndian::write_u64(&mut buf[16..24], spec.size);
    LittleEndian::write_u64(&mut buf[24..32], spec.size);
    LittleEndian::write_u32(&mut buf[40..44], spec.nlink);
    LittleEndian::write_u32(&mut buf[44..48], spec.uid);
    LittleEndian::write_u32(&mut buf[48..52], spec.gid);
    LittleEndian::write_u32(&mut buf[52..56], spec.mode);
    LittleEndian::write_u64(&mut buf[64..72], spec.flags);
    for time_at in [112, 124, 136, 148] {
        LittleEndian::write_u64(&mut buf[time_at..time_at + 8], spec.mtime);
    }
    buf
}

pub fn inode_ref_payload(index: u64, name: &str) -> Vec<u8> {
    let mut buf = vec![0u8; 10];
    LittleEndian::write_u64(&mut buf[0..8], index);
    LittleEndian::write_u16(&mut buf[8..10], name.len() as u16);
    buf.extend_from_slice(name.as_bytes());
    buf
}

pub fn dir_entry_payload(child: u64, child_type: u8, entry_type: u8, name: &str, data: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; 30];
    LittleEndian::write_u64(&mut buf[0..8], child);
    buf[8] = child_type;
    LittleEndian::write_u64(&mut buf[17..25], 1); // transid
    LittleEndian::write_u16(&mut buf[25..27], data.len() as u16);
    LittleEndian::write_u16(&mut buf[27..29], name.len() as u16);
    buf[29] = entry_type;
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(data);
    buf
}

pub fn inline_extent_payload(compression: u8, ram_bytes: u64, data: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; 21];
    LittleEndian::write_u64(&mut buf[0..8], 1); // generation
    LittleEndian::write_u64(&mut buf[8..16], ram_bytes);
    buf[16] = compression;
    buf[20] = 0; // inline
    buf.extend_from_slice(data);
    buf
}

pub fn reg_extent_payload(
    disk_bytenr: u64,
    disk_num_bytes: u64,
    extent_offset: u64,
    num_bytes: u64,
    compression: u8,
    ram_bytes: u64,
) -> Vec<u8> {
    let mut buf = vec![0u8; 53];
    LittleEndian::write_u64(&mut buf[0..8], 1);
    LittleEndian::write_u64(&mut buf[8..16], ram_bytes);
    buf[16] = compression;
    buf[20] = 1; // regular
    LittleEndian::write_u64(&mut buf[21..29], disk_bytenr);
    LittleEndian::write_u64(&mut buf[29..37], disk_num_bytes);
    LittleEndian::write_u64(&mut buf[37..45], extent_offset);
    LittleEndian::write_u64(&mut buf[45..53], num_bytes);
    buf
}

pub fn root_item_payload(tree_root: u64, root_dirid: u64) -> Vec<u8> {
    let mut buf = vec![0u8; 439];
    LittleEndian::write_u64(&mut buf[160..168], 1); // generation
    LittleEndian::write_u64(&mut buf[168..176], root_dirid);
    LittleEndian::write_u64(&mut buf[176..184], tree_root);
    buf
}

pub fn root_ref_payload(dirid: u64, name: &str) -> Vec<u8> {
    let mut buf = vec![0u8; 18];
    LittleEndian::write_u64(&mut buf[0..8], dirid);
    LittleEndian::write_u64(&mut buf[8..16], 1); // sequence
    LittleEndian::write_u16(&mut buf[16..18], name.len() as u16);
    buf.extend_from_slice(name.as_bytes());
    buf
}

/// Items for one inode that is linked into a parent directory.
pub struct FsTree {
    pub items: Vec<(Key, Vec<u8>)>,
}

impl FsTree {
    pub fn new() -> FsTree {
        FsTree { items: Vec::new() }
    }

    pub fn inode(&mut self, ino: u64, spec: InodeSpec) -> &mut Self {
        self.items
            .push((key(ino, INODE_ITEM, 0), inode_payload(&spec)));
        self
    }

    /// Wire `child` into `parent` under `name`: INODE_REF on the child
    /// plus DIR_ITEM on the parent.
    pub fn link(&mut self, child: u64, parent: u64, name: &str, entry_type: u8) -> &mut Self {
        self.items
            .push((key(child, INODE_REF, parent), inode_ref_payload(2, name)));
        self.items.push((
            key(parent, DIR_ITEM, name_hash(name)),
            dir_entry_payload(child, INODE_ITEM, entry_type, name, &[]),
        ));
        self
    }

    pub fn xattr(&mut self, ino: u64, name: &str, value: &[u8]) -> &mut Self {
        self.items.push((
            key(ino, XATTR_ITEM, name_hash(name)),
            dir_entry_payload(0, 0, 8, name, value),
        ));
        self
    }

    pub fn extent(&mut self, ino: u64, file_offset: u64, payload: Vec<u8>) -> &mut Self {
        self.items.push((key(ino, EXTENT_DATA, file_offset), payload));
        self
    }
}

/// Stand-in for the crc32c name hash; the parser never recomputes it, it
/// only needs distinct key offsets per name.
fn name_hash(name: &str) -> u64 {
    name.bytes().fold(0xcbf2_9ce4_8422_2325u64, |acc, b| {
        (acc ^ b as u64).wrapping_mul(0x100_0000_01b3)
    }) & 0xFFFF_FFFF
}

pub fn zlib_compress(data: &[u8]) -> Vec<u8> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("zlib");
    encoder.finish().expect("zlib finish")
}

pub fn zstd_compress(data: &[u8]) -> Vec<u8> {
    zstd::stream::encode_all(data, 0).expect("zstd")
}
