//! Per-inode catalog records.
//!
//! After reconstruction every inode becomes one [`FileEntry`]: identity,
//! decoded metadata, the path from the path builder, and content hashes
//! for regular files. Owner names are resolved from the image's own
//! `/etc/passwd` and `/etc/group` when those files are present.

use std::collections::HashMap;

use chrono::DateTime;
use log::{debug, warn};
use md5::Md5;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::btrfs::Volume;
use crate::extent::{self, FileExtent};
use crate::filesystem::{split_id, FileSystem};
use crate::structures::{BtrfsTimespec, BTRFS_INODE_FLAG_NAMES};

/// One emitted record per (subvolume, inode).
#[derive(Clone, Debug, Serialize)]
pub struct FileEntry {
    pub inode: u64,
    pub subvolume_id: u16,
    pub name: String,
    pub path: String,
    pub size: u64,
    pub file_type: String,
    pub mode: u32,
    pub mode_string: String,
    pub uid: u32,
    pub uid_name: Option<String>,
    pub gid: u32,
    pub gid_name: Option<String>,
    pub nlink: u32,
    pub atime: String,
    pub ctime: String,
    pub mtime: String,
    pub otime: String,
    pub parent_inode: Option<u64>,
    pub generation: u64,
    pub transid: u64,
    pub flags: u64,
    pub flag_string: String,
    pub xattr_count: usize,
    pub extent_count: usize,
    /// On-disk footprint: the sum of `disk_num_bytes` over all extents,
    /// distinct from the logical `size`.
    pub disk_bytes: u64,
    /// Image offset of the first regular extent, when there is one.
    pub physical_offset: Option<u64>,
    /// CRC32C sector sums registered for this file's extent starts.
    /// Extents shared between files make this an approximation.
    pub checksum_count: u64,
    pub md5: Option<String>,
    pub sha256: Option<String>,
}

const S_IFMT: u32 = 0o170000;
const S_IFSOCK: u32 = 0o140000;
const S_IFLNK: u32 = 0o120000;
const S_IFREG: u32 = 0o100000;
const S_IFBLK: u32 = 0o060000;
const S_IFDIR: u32 = 0o040000;
const S_IFCHR: u32 = 0o020000;
const S_IFIFO: u32 = 0o010000;

pub fn type_string(mode: u32) -> &'static str {
    match mode & S_IFMT {
        S_IFREG => "file",
        S_IFDIR => "directory",
        S_IFLNK => "symlink",
        S_IFCHR => "char_device",
        S_IFBLK => "block_device",
        S_IFIFO => "fifo",
        S_IFSOCK => "socket",
        _ => "unknown",
    }
}

/// `ls -l` style ten character mode string, with the usual `s`/`S` and
/// `t`/`T` overrides for setuid, setgid and sticky.
pub fn mode_string(mode: u32) -> String {
    let type_char = match mode & S_IFMT {
        S_IFDIR => 'd',
        S_IFLNK => 'l',
        S_IFCHR => 'c',
        S_IFBLK => 'b',
        S_IFIFO => 'p',
        S_IFSOCK => 's',
        S_IFREG => '-',
        _ => '?',
    };

    let mut out = String::with_capacity(10);
    out.push(type_char);
    for (shift, special, special_char) in [(6, mode & 0o4000 != 0, 's'), (3, mode & 0o2000 != 0, 's'), (0, mode & 0o1000 != 0, 't')] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        let x = bits & 0o1 != 0;
        out.push(match (special, x) {
            (true, true) => special_char,
            (true, false) => special_char.to_ascii_uppercase(),
            (false, true) => 'x',
            (false, false) => '-',
        });
    }
    out
}

/// Comma-joined names of the inode flag bits that are set.
pub fn flag_string(flags: u64) -> String {
    let mut names = Vec::new();
    for (bit, name) in BTRFS_INODE_FLAG_NAMES.iter().enumerate() {
        if flags & (1 << bit) != 0 {
            names.push(*name);
        }
    }
    names.join(",")
}

/// ISO 8601 without a timezone suffix.
pub fn format_timestamp(ts: &BtrfsTimespec) -> String {
    match DateTime::from_timestamp(ts.sec as i64, ts.nsec) {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S").to_string(),
        None => "1970-01-01T00:00:00".to_string(),
    }
}

/// uid and gid lookup tables read out of the image itself.
#[derive(Debug, Default)]
struct NameDb {
    users: HashMap<u32, String>,
    groups: HashMap<u32, String>,
}

impl NameDb {
    fn load(volume: &Volume, fs: &FileSystem, paths: &HashMap<u64, String>) -> NameDb {
        NameDb {
            users: load_id_file(volume, fs, paths, &["/etc/passwd", "/root/etc/passwd"]),
            groups: load_id_file(volume, fs, paths, &["/etc/group", "/root/etc/group"]),
        }
    }
}

fn load_id_file(
    volume: &Volume,
    fs: &FileSystem,
    paths: &HashMap<u64, String>,
    candidates: &[&str],
) -> HashMap<u32, String> {
    for candidate in candidates {
        let Some((&id, _)) = paths.iter().find(|(_, p)| p == candidate) else {
            continue;
        };
        let Some(inode) = fs.inodes.get(&id) else {
            continue;
        };
        let extents = fs.extents.get(&id).map(Vec::as_slice).unwrap_or(&[]);
        match extent::reassemble(volume, extents, inode.size) {
            Ok(data) => {
                debug!("resolved names from {candidate}");
                return parse_id_file(&data);
            }
            Err(e) => debug!("cannot read {candidate}: {e}"),
        }
    }
    HashMap::new()
}

/// Parse colon-separated `name:x:id:...` lines; both passwd and group
/// keep the numeric id in the third field.
fn parse_id_file(data: &[u8]) -> HashMap<u32, String> {
    let mut out = HashMap::new();
    for line in String::from_utf8_lossy(data).lines() {
        let mut fields = line.split(':');
        let (Some(name), Some(_), Some(id)) = (fields.next(), fields.next(), fields.next()) else {
            continue;
        };
        if let Ok(id) = id.trim().parse::<u32>() {
            out.entry(id).or_insert_with(|| name.to_string());
        }
    }
    out
}

/// Turn the reconstructed model into the final record stream. Content
/// hashes are computed for regular files only; a file whose extents
/// cannot be read or decompressed keeps its entry but loses its hashes.
pub fn emit_entries(volume: &Volume, fs: &FileSystem) -> Vec<FileEntry> {
    let mut paths: HashMap<u64, String> = HashMap::with_capacity(fs.inodes.len());
    let mut broken_paths = 0usize;
    for &id in fs.inodes.keys() {
        let (path, broken) = fs.build_path(id);
        if broken {
            broken_paths += 1;
        }
        paths.insert(id, path);
    }
    if broken_paths > 0 {
        warn!("{broken_paths} inode(s) have broken parent chains");
    }

    let name_db = NameDb::load(volume, fs, &paths);

    let no_extents: Vec<FileExtent> = Vec::new();
    let mut entries = Vec::with_capacity(fs.inodes.len());
    for (&id, inode) in &fs.inodes {
        let (subvolume_id, ino) = split_id(id);
        let extents = fs.extents.get(&id).unwrap_or(&no_extents);

        let mut sorted: Vec<&FileExtent> = extents.iter().collect();
        sorted.sort_by_key(|e| e.file_offset);

        let physical_offset = sorted
            .iter()
            .find(|e| !e.is_inline() && e.disk_bytenr != 0)
            .and_then(|e| volume.chunk_map.translate(e.disk_bytenr).ok());
        let disk_bytes = sorted.iter().map(|e| e.disk_num_bytes).sum();
        let checksum_count = sorted
            .iter()
            .filter(|e| !e.is_inline() && e.disk_bytenr != 0)
            .filter_map(|e| fs.checksums.get(&e.disk_bytenr))
            .sum();

        let is_regular = inode.mode & S_IFMT == S_IFREG;
        let (md5, sha256) = if is_regular {
            match extent::reassemble(volume, extents, inode.size) {
                Ok(data) => (
                    Some(hex::encode(Md5::digest(&data))),
                    Some(hex::encode(Sha256::digest(&data))),
                ),
                Err(e) => {
                    warn!("cannot rebuild content of inode {ino} (subvolume {subvolume_id}): {e}");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        entries.push(FileEntry {
            inode: ino,
            subvolume_id,
            name: fs
                .names
                .get(&id)
                .map(|n| String::from_utf8_lossy(n).into_owned())
                .unwrap_or_default(),
            path: paths.get(&id).cloned().unwrap_or_else(|| "/".to_string()),
            size: inode.size,
            file_type: type_string(inode.mode).to_string(),
            mode: inode.mode,
            mode_string: mode_string(inode.mode),
            uid: inode.uid,
            uid_name: name_db.users.get(&inode.uid).cloned(),
            gid: inode.gid,
            gid_name: name_db.groups.get(&inode.gid).cloned(),
            nlink: inode.nlink,
            atime: format_timestamp(&inode.atime),
            ctime: format_timestamp(&inode.ctime),
            mtime: format_timestamp(&inode.mtime),
            otime: format_timestamp(&inode.otime),
            parent_inode: fs.parents.get(&id).map(|&p| split_id(p).1),
            generation: inode.generation,
            transid: inode.transid,
            flags: inode.flags,
            flag_string: flag_string(inode.flags),
            xattr_count: fs.xattrs.get(&id).map(Vec::len).unwrap_or(0),
            extent_count: extents.len(),
            disk_bytes,
            physical_offset,
            checksum_count,
            md5,
            sha256,
        });
    }
    entries
}
