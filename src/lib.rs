//! Read-only, offline catalog of an unmounted btrfs filesystem image.
//!
//! Given a raw disk image (optionally behind a partition table), this
//! library locates the superblock, bootstraps the logical-to-physical
//! chunk map, walks the filesystem trees of every subvolume and emits one
//! [`FileEntry`] per inode with full path, metadata and content hashes.
//!
//! Only single/DUP chunk profiles are handled: translation always uses
//! stripe 0, so RAID0/1/5/6/10 volumes will resolve to wrong offsets.
//! Checksums are counted from the checksum tree but never verified.

pub mod address;
pub mod btrfs;
pub mod compress;
pub mod dump;
pub mod entry;
pub mod extent;
pub mod filesystem;
pub mod image;
pub mod partition;
pub mod structures;
pub mod tree;

use thiserror::Error;

pub use btrfs::{parse, ParseOptions, Superblock, Volume};
pub use entry::FileEntry;
pub use filesystem::FileSystem;

/// Error kinds of the parser.
///
/// Only [`BtrfsError::NotBtrfs`] and open-time I/O failures abort a run;
/// every other condition is localized to the record or extent that raised
/// it and logged on the side.
#[derive(Debug, Error)]
pub enum BtrfsError {
    #[error("no btrfs superblock magic found")]
    NotBtrfs,

    #[error("truncated record at offset {offset}: need {needed} bytes, have {available}")]
    TruncatedRecord {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("logical address {0:#x} is not covered by any chunk")]
    UnmappedLogicalAddress(u64),

    #[error("short read of {wanted} bytes at image offset {offset:#x}")]
    ShortRead { offset: u64, wanted: usize },

    #[error("unsupported compression codec {0}")]
    UnsupportedCompression(u8),

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("tree block {0:#x} visited twice in one traversal")]
    Cycle(u64),

    #[error("parent chain exceeds {0} links")]
    PathDepthExceeded(usize),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BtrfsError>;
