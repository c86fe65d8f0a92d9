//! Reconstruction of the filesystem model from the on-disk trees.
//!
//! The root tree names every subvolume; each subvolume is an independent
//! fs tree whose inodes all start at 256. To keep them apart in one flat
//! model, inode ids are qualified with the subvolume id in the upper 16
//! bits before insertion. The accumulator is filled in a single forward
//! pass and consumed afterwards by the record emitter.

use std::collections::{BTreeMap, HashMap, HashSet};

use log::{debug, warn};

use crate::btrfs::Volume;
use crate::extent::FileExtent;
use crate::structures::*;
use crate::tree::TreeItems;

/// Upper bits of a qualified inode id hold the subvolume.
pub const SUBVOL_ID_SHIFT: u32 = 48;
/// Largest raw inode number representable in the low 48 bits.
pub const MAX_INODE_NUMBER: u64 = (1 << SUBVOL_ID_SHIFT) - 1;
/// Parent chains longer than this are treated as corrupt.
pub const MAX_PATH_DEPTH: usize = 100;

/// Qualify a raw inode number with its subvolume id.
pub fn qualified_id(subvolume_id: u64, inode: u64) -> u64 {
    (subvolume_id << SUBVOL_ID_SHIFT) | inode
}

/// Split a qualified id back into `(subvolume_id, inode)`.
pub fn split_id(id: u64) -> (u16, u64) {
    ((id >> SUBVOL_ID_SHIFT) as u16, id & MAX_INODE_NUMBER)
}

#[derive(Clone, Debug)]
pub struct Subvolume {
    pub id: u64,
    /// Name from the ROOT_REF entry; the default fs tree has none.
    pub name: String,
    pub tree_root: u64,
    pub generation: u64,
    pub root_dirid: u64,
}

/// Accumulated filesystem model, keyed by qualified inode id.
#[derive(Debug, Default)]
pub struct FileSystem {
    pub subvolumes: Vec<Subvolume>,
    pub inodes: BTreeMap<u64, BtrfsInodeItem>,
    pub names: HashMap<u64, Vec<u8>>,
    pub parents: HashMap<u64, u64>,
    pub dir_entries: HashMap<u64, Vec<BtrfsDirEntry>>,
    pub xattrs: HashMap<u64, Vec<(Vec<u8>, Vec<u8>)>>,
    pub extents: HashMap<u64, Vec<FileExtent>>,
    /// CRC32C sector-sum counts from the checksum tree, keyed by the
    /// logical address each EXTENT_CSUM item starts at.
    pub checksums: BTreeMap<u64, u64>,
}

impl FileSystem {
    /// Build the whole model: subvolume discovery, one fs-tree pass per
    /// subvolume, then the checksum tree. Damage is localized; whatever
    /// could be decoded is kept.
    pub fn reconstruct(volume: &Volume) -> FileSystem {
        let mut fs = FileSystem::default();

        let mut csum_tree_root = None;
        let mut names: HashMap<u64, String> = HashMap::new();
        let mut roots: Vec<(u64, BtrfsRootItem)> = Vec::new();

        for (key, payload) in TreeItems::new(volume, volume.superblock.root) {
            match key.ty {
                BTRFS_ROOT_ITEM_KEY => match decode_root_item(&payload) {
                    Ok(item) => {
                        if key.objectid == BTRFS_CSUM_TREE_OBJECTID {
                            csum_tree_root = Some(item.bytenr);
                        }
                        roots.push((key.objectid, item));
                    }
                    Err(e) => warn!("bad ROOT_ITEM for tree {}: {e}", key.objectid),
                },
                BTRFS_ROOT_REF_KEY => match decode_root_ref(&payload) {
                    // the key offset names the child subvolume
                    Ok(r) => {
                        names.insert(key.offset, String::from_utf8_lossy(&r.name).into_owned());
                    }
                    Err(e) => warn!("bad ROOT_REF {} -> {}: {e}", key.objectid, key.offset),
                },
                _ => {}
            }
        }

        for (id, item) in roots {
            if !is_subvolume_id(id) {
                continue;
            }
            fs.subvolumes.push(Subvolume {
                id,
                name: names.get(&id).cloned().unwrap_or_default(),
                tree_root: item.bytenr,
                generation: item.generation,
                root_dirid: item.root_dirid,
            });
        }

        for subvol in fs.subvolumes.clone() {
            debug!(
                "scanning subvolume {} ({:?}) at {:#x}",
                subvol.id, subvol.name, subvol.tree_root
            );
            fs.scan_subvolume(volume, &subvol);
        }

        if let Some(root) = csum_tree_root {
            fs.scan_checksum_tree(volume, root);
        }

        fs
    }

    fn scan_subvolume(&mut self, volume: &Volume, subvol: &Subvolume) {
        if subvol.id > u16::MAX as u64 {
            warn!(
                "subvolume id {} does not fit the 16-bit qualifier, skipping",
                subvol.id
            );
            return;
        }

        for (key, payload) in TreeItems::new(volume, subvol.tree_root) {
            if key.objectid > MAX_INODE_NUMBER {
                warn!(
                    "inode {} of subvolume {} exceeds 48 bits, skipping item",
                    key.objectid, subvol.id
                );
                continue;
            }
            let id = qualified_id(subvol.id, key.objectid);

            match key.ty {
                BTRFS_INODE_ITEM_KEY => match decode_inode_item(&payload, 0) {
                    Ok(inode) => {
                        self.inodes.insert(id, inode);
                    }
                    Err(e) => warn!("bad INODE_ITEM {}: {e}", key.objectid),
                },
                BTRFS_INODE_REF_KEY => {
                    // key.offset is the parent inode; the payload may pack
                    // several names, the first one wins
                    let (refs, err) = decode_inode_refs(&payload);
                    if let Some(e) = err {
                        warn!("bad INODE_REF {}: {e}", key.objectid);
                    }
                    if let Some(first) = refs.into_iter().next() {
                        self.names.entry(id).or_insert(first.name);
                        self.parents
                            .entry(id)
                            .or_insert_with(|| qualified_id(subvol.id, key.offset));
                    }
                }
                BTRFS_XATTR_ITEM_KEY => {
                    let (entries, err) = decode_dir_entries(&payload);
                    if let Some(e) = err {
                        warn!("bad XATTR_ITEM {}: {e}", key.objectid);
                    }
                    self.xattrs
                        .entry(id)
                        .or_default()
                        .extend(entries.into_iter().map(|x| (x.name, x.data)));
                }
                BTRFS_DIR_ITEM_KEY => {
                    let (entries, err) = decode_dir_entries(&payload);
                    if let Some(e) = err {
                        warn!("bad DIR_ITEM {}: {e}", key.objectid);
                    }
                    self.dir_entries.entry(id).or_default().extend(entries);
                }
                BTRFS_EXTENT_DATA_KEY => match decode_file_extent_item(&payload) {
                    Ok(item) => self
                        .extents
                        .entry(id)
                        .or_default()
                        .push(FileExtent::from_item(key.offset, item)),
                    Err(e) => warn!("bad EXTENT_DATA {}: {e}", key.objectid),
                },
                BTRFS_DIR_INDEX_KEY => {
                    // same content as DIR_ITEM, indexed differently
                }
                BTRFS_INODE_EXTREF_KEY => {
                    debug!("ignoring INODE_EXTREF for inode {}", key.objectid);
                }
                _ => {
                    // other item types carry nothing this catalog reports
                }
            }
        }
    }

    fn scan_checksum_tree(&mut self, volume: &Volume, root: u64) {
        for (key, payload) in TreeItems::new(volume, root) {
            if key.ty != BTRFS_EXTENT_CSUM_KEY {
                continue;
            }
            // one 4-byte CRC32C per sector, starting at key.offset
            self.checksums
                .insert(key.offset, (payload.len() / 4) as u64);
        }
    }

    /// Walk the parent chain of a qualified inode id and return its
    /// absolute path, plus whether the chain was broken by a cycle or by
    /// exceeding [`MAX_PATH_DEPTH`].
    pub fn build_path(&self, id: u64) -> (String, bool) {
        let mut parts: Vec<String> = Vec::new();
        let mut seen: HashSet<u64> = HashSet::new();
        let mut broken = false;
        let mut current = id;

        loop {
            if !seen.insert(current) || seen.len() > MAX_PATH_DEPTH {
                broken = true;
                break;
            }
            let Some(name) = self.names.get(&current) else {
                break; // subvolume root
            };
            let name = String::from_utf8_lossy(name).into_owned();
            if name.starts_with('/') {
                parts.push(name.trim_start_matches('/').to_string());
                break;
            }
            parts.push(name);
            match self.parents.get(&current) {
                Some(parent) => current = *parent,
                None => break,
            }
        }

        parts.reverse();
        let joined = parts.join("/");
        if broken {
            (format!("<broken>/{joined}"), true)
        } else {
            (format!("/{joined}"), false)
        }
    }
}

fn is_subvolume_id(id: u64) -> bool {
    // 1..=7 are reserved trees; 5 is the default fs tree; user
    // subvolumes and snapshots start at 256 and stay clear of the
    // reserved range at the top of the id space
    id == BTRFS_FS_TREE_OBJECTID
        || (BTRFS_FIRST_FREE_OBJECTID..=BTRFS_LAST_FREE_OBJECTID).contains(&id)
}
