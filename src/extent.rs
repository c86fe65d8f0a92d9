//! Reassembly of file content from its extents.

use log::warn;

use crate::btrfs::Volume;
use crate::compress::decompress;
use crate::structures::{BtrfsFileExtentItem, BTRFS_COMPRESS_NONE, BTRFS_FILE_EXTENT_INLINE};
use crate::{BtrfsError, Result};

/// One EXTENT_DATA occurrence of an inode, keyed by the file offset it
/// starts at. `inline_data` holds the raw (possibly compressed) payload
/// for inline extents.
#[derive(Clone, Debug)]
pub struct FileExtent {
    pub file_offset: u64,
    pub disk_bytenr: u64,
    pub disk_num_bytes: u64,
    pub compression: u8,
    pub ty: u8,
    pub extent_offset: u64,
    pub num_bytes: u64,
    pub ram_bytes: u64,
    pub inline_data: Option<Vec<u8>>,
}

impl FileExtent {
    pub fn from_item(file_offset: u64, item: BtrfsFileExtentItem) -> FileExtent {
        FileExtent {
            file_offset,
            disk_bytenr: item.disk_bytenr,
            disk_num_bytes: item.disk_num_bytes,
            compression: item.compression,
            ty: item.ty,
            extent_offset: item.extent_offset,
            num_bytes: item.num_bytes,
            ram_bytes: item.ram_bytes,
            inline_data: item.inline_data,
        }
    }

    pub fn is_inline(&self) -> bool {
        self.ty == BTRFS_FILE_EXTENT_INLINE
    }

    pub fn is_hole(&self) -> bool {
        !self.is_inline() && self.disk_bytenr == 0
    }
}

/// Rebuild the logical bytes of a file from its extents and declared
/// size. Extents are processed in file-offset order; gaps between them
/// read as zeros, like holes. The result is exactly `size` bytes.
pub fn reassemble(volume: &Volume, extents: &[FileExtent], size: u64) -> Result<Vec<u8>> {
    let mut sorted: Vec<&FileExtent> = extents.iter().collect();
    sorted.sort_by_key(|e| e.file_offset);

    let mut out: Vec<u8> = Vec::with_capacity(size as usize);
    for extent in sorted {
        if extent.file_offset as usize > out.len() {
            out.resize(extent.file_offset as usize, 0);
        }

        if let Some(inline) = &extent.inline_data {
            if extent.compression == BTRFS_COMPRESS_NONE {
                out.extend_from_slice(inline);
            } else {
                let plain = decompress(extent.compression, inline, extent.ram_bytes as usize)?;
                out.extend_from_slice(&plain);
            }
            continue;
        }

        if extent.is_hole() {
            let len = out.len() + extent.num_bytes as usize;
            out.resize(len, 0);
            continue;
        }

        if extent.compression == BTRFS_COMPRESS_NONE {
            let raw = volume.read_logical(
                extent.disk_bytenr + extent.extent_offset,
                extent.num_bytes as usize,
            )?;
            out.extend_from_slice(&raw);
        } else {
            let raw = volume.read_logical(extent.disk_bytenr, extent.disk_num_bytes as usize)?;
            let plain = decompress(extent.compression, &raw, extent.ram_bytes as usize)?;
            let start = extent.extent_offset as usize;
            let end = start + extent.num_bytes as usize;
            let window = plain.get(start..end.min(plain.len())).ok_or_else(|| {
                BtrfsError::Decompress(format!(
                    "decompressed extent of {} bytes lacks window {start}..{end}",
                    plain.len()
                ))
            })?;
            if window.len() < extent.num_bytes as usize {
                warn!(
                    "decompressed extent at file offset {} is {} bytes short",
                    extent.file_offset,
                    extent.num_bytes as usize - window.len()
                );
            }
            out.extend_from_slice(window);
        }
    }

    // trailing range past the last extent reads as zeros
    out.resize(size as usize, 0);
    Ok(out)
}
