//! Logical-to-physical address translation.
//!
//! Btrfs trees reference each other by logical address; a chunk maps a
//! contiguous logical range onto a physical range of the partition. The
//! map is assembled twice: first from the superblock's sys_chunk_array,
//! then overwritten by the full chunk tree pass.

use log::debug;

use crate::{BtrfsError, Result};

#[derive(Clone, Copy, Debug)]
struct ChunkMapping {
    logical_start: u64,
    length: u64,
    physical_offset: u64,
}

/// Interval map from logical address space to absolute image offsets.
/// `partition_offset` is added to every translation so callers can stay
/// entirely in image coordinates.
#[derive(Clone, Debug, Default)]
pub struct ChunkMap {
    partition_offset: u64,
    // sorted by logical_start, non-overlapping
    mappings: Vec<ChunkMapping>,
}

impl ChunkMap {
    pub fn new(partition_offset: u64) -> ChunkMap {
        ChunkMap {
            partition_offset,
            mappings: Vec::new(),
        }
    }

    pub fn partition_offset(&self) -> u64 {
        self.partition_offset
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Insert a mapping. A later entry with the same `logical_start`
    /// silently replaces the earlier one (the chunk tree overrides the
    /// bootstrap entries).
    pub fn add(&mut self, logical_start: u64, length: u64, physical_offset: u64) {
        if length == 0 {
            debug!("ignoring empty chunk at {logical_start:#x}");
            return;
        }
        let mapping = ChunkMapping {
            logical_start,
            length,
            physical_offset,
        };
        match self
            .mappings
            .binary_search_by_key(&logical_start, |m| m.logical_start)
        {
            Ok(i) => self.mappings[i] = mapping,
            Err(i) => self.mappings.insert(i, mapping),
        }
    }

    /// Translate a logical address to an absolute image offset.
    pub fn translate(&self, logical: u64) -> Result<u64> {
        let i = match self
            .mappings
            .binary_search_by_key(&logical, |m| m.logical_start)
        {
            Ok(i) => i,
            Err(0) => return Err(BtrfsError::UnmappedLogicalAddress(logical)),
            Err(i) => i - 1,
        };
        let m = &self.mappings[i];
        if logical >= m.logical_start + m.length {
            return Err(BtrfsError::UnmappedLogicalAddress(logical));
        }
        Ok(self.partition_offset + m.physical_offset + (logical - m.logical_start))
    }
}
