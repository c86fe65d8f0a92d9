//! Traversal of btrfs trees.
//!
//! A tree block is either a leaf (items plus payloads) or an internal
//! node (key pointers to children). [`TreeItems`] drives a depth-first,
//! left-to-right walk and yields each leaf item with its payload; broken
//! blocks, unmapped children and revisited addresses are skipped with a
//! warning so one bad subtree cannot take down the whole scan.

use std::collections::HashSet;

use log::{debug, warn};

use crate::btrfs::Volume;
use crate::structures::*;

struct Frame {
    block: Vec<u8>,
    nritems: u32,
    level: u8,
    index: u32,
}

/// Iterator over every `(key, payload)` of a tree, in key-pointer order.
pub struct TreeItems<'a> {
    volume: &'a Volume,
    stack: Vec<Frame>,
    visited: HashSet<u64>,
}

impl<'a> TreeItems<'a> {
    pub fn new(volume: &'a Volume, root_logical: u64) -> TreeItems<'a> {
        let mut iter = TreeItems {
            volume,
            stack: Vec::new(),
            visited: HashSet::new(),
        };
        iter.push_block(root_logical);
        iter
    }

    fn push_block(&mut self, logical: u64) {
        if !self.visited.insert(logical) {
            warn!("tree block {logical:#x} already visited, skipping subtree");
            return;
        }
        let block = match self.volume.read_tree_block(logical) {
            Ok(block) => block,
            Err(e) => {
                warn!("cannot read tree block {logical:#x}: {e}");
                return;
            }
        };
        let header = match decode_header(&block, 0) {
            Ok(header) => header,
            Err(e) => {
                warn!("cannot parse header of tree block {logical:#x}: {e}");
                return;
            }
        };
        if header.bytenr != logical {
            debug!(
                "tree block {logical:#x} reports bytenr {:#x}",
                header.bytenr
            );
        }
        self.stack.push(Frame {
            block,
            nritems: header.nritems,
            level: header.level,
            index: 0,
        });
    }
}

impl Iterator for TreeItems<'_> {
    type Item = (BtrfsKey, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let frame = self.stack.last_mut()?;
            if frame.index >= frame.nritems {
                self.stack.pop();
                continue;
            }
            let index = frame.index as usize;
            frame.index += 1;

            if frame.level == 0 {
                let item = match decode_item(&frame.block, BTRFS_HEADER_SIZE + index * BTRFS_ITEM_SIZE)
                {
                    Ok(item) => item,
                    Err(e) => {
                        warn!("leaf item {index} does not fit its block: {e}");
                        self.stack.pop();
                        continue;
                    }
                };
                let start = BTRFS_HEADER_SIZE + item.offset as usize;
                let end = start + item.size as usize;
                if end > frame.block.len() {
                    warn!(
                        "payload of item {:?} runs past the block end, skipping",
                        item.key
                    );
                    continue;
                }
                let payload = frame.block[start..end].to_vec();
                return Some((item.key, payload));
            }

            // internal node: descend into the child pointer
            match decode_key_ptr(&frame.block, BTRFS_HEADER_SIZE + index * BTRFS_KEY_PTR_SIZE) {
                Ok(ptr) => {
                    let child = ptr.blockptr;
                    self.push_block(child);
                }
                Err(e) => {
                    warn!("key pointer {index} does not fit its block: {e}");
                    self.stack.pop();
                }
            }
        }
    }
}

/// Depth-first walk invoking `visitor` for every leaf item.
pub fn walk_tree<F>(volume: &Volume, root_logical: u64, mut visitor: F)
where
    F: FnMut(&BtrfsKey, &[u8]),
{
    for (key, payload) in TreeItems::new(volume, root_logical) {
        visitor(&key, &payload);
    }
}

/// Walk yielding only items with the given `objectid` (and item type,
/// when one is supplied).
pub fn search_tree<'a>(
    volume: &'a Volume,
    root_logical: u64,
    objectid: u64,
    ty: Option<u8>,
) -> impl Iterator<Item = (BtrfsKey, Vec<u8>)> + 'a {
    TreeItems::new(volume, root_logical)
        .filter(move |(key, _)| key.objectid == objectid && ty.map_or(true, |t| key.ty == t))
}
