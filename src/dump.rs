//! Output formatting over the emitted records.

use std::io::{self, Write};

use crate::btrfs::Superblock;
use crate::entry::FileEntry;

pub fn uuid_str(uuid: &[u8; 16]) -> String {
    format!(
        "{}-{}-{}-{}-{}",
        hex::encode(&uuid[0..4]),
        hex::encode(&uuid[4..6]),
        hex::encode(&uuid[6..8]),
        hex::encode(&uuid[8..10]),
        hex::encode(&uuid[10..])
    )
}

pub fn print_superblock(sb: &Superblock) {
    println!(
        "label:          {}",
        if sb.label.is_empty() { "(none)" } else { sb.label.as_str() }
    );
    println!("fsid:           {}", uuid_str(&sb.fsid));
    println!("generation:     {}", sb.generation);
    println!("root tree:      {:#x} (level {})", sb.root, sb.root_level);
    println!("chunk root:     {:#x} (level {})", sb.chunk_root, sb.chunk_root_level);
    println!("node size:      {}", sb.nodesize);
    println!("sector size:    {}", sb.sectorsize);
    println!("total bytes:    {}", sb.total_bytes);
    println!("bytes used:     {}", sb.bytes_used);
    println!("num devices:    {}", sb.num_devices);
}

pub fn print_console(entries: &[FileEntry]) {
    for entry in entries {
        println!(
            "{} {:>5} {:>5} {:>10} {} {:>3} {}",
            entry.mode_string, entry.uid, entry.gid, entry.size, entry.mtime, entry.subvolume_id,
            entry.path
        );
    }
}

pub fn print_json(entries: &[FileEntry]) -> io::Result<()> {
    let out = io::stdout();
    let mut out = out.lock();
    serde_json::to_writer_pretty(&mut out, entries)?;
    writeln!(out)
}

fn csv_quote(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn csv_opt<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(T::to_string).unwrap_or_default()
}

pub fn print_csv(entries: &[FileEntry]) {
    println!(
        "inode,subvolume_id,name,path,size,type,mode,mode_string,uid,uid_name,gid,gid_name,\
         nlink,atime,ctime,mtime,otime,parent_inode,generation,transid,flags,flag_string,\
         xattr_count,extent_count,disk_bytes,physical_offset,checksum_count,md5,sha256"
    );
    for e in entries {
        println!(
            "{},{},{},{},{},{},{:o},{},{},{},{},{},{},{},{},{},{},{},{},{},{:#x},{},{},{},{},{},{},{},{}",
            e.inode,
            e.subvolume_id,
            csv_quote(&e.name),
            csv_quote(&e.path),
            e.size,
            e.file_type,
            e.mode,
            e.mode_string,
            e.uid,
            csv_opt(&e.uid_name),
            e.gid,
            csv_opt(&e.gid_name),
            e.nlink,
            e.atime,
            e.ctime,
            e.mtime,
            e.otime,
            csv_opt(&e.parent_inode),
            e.generation,
            e.transid,
            e.flags,
            csv_quote(&e.flag_string),
            e.xattr_count,
            e.extent_count,
            e.disk_bytes,
            csv_opt(&e.physical_offset),
            e.checksum_count,
            csv_opt(&e.md5),
            csv_opt(&e.sha256),
        );
    }
}

/// Aggregate summary over the catalog.
#[derive(Debug, Default)]
pub struct Stats {
    pub entries: usize,
    pub files: usize,
    pub directories: usize,
    pub symlinks: usize,
    pub other: usize,
    pub subvolumes: usize,
    pub logical_bytes: u64,
    pub disk_bytes: u64,
    pub hashed: usize,
    pub checksums: u64,
}

impl Stats {
    pub fn collect(entries: &[FileEntry]) -> Stats {
        let mut stats = Stats::default();
        let mut subvols = std::collections::HashSet::new();
        for entry in entries {
            stats.entries += 1;
            match entry.file_type.as_str() {
                "file" => stats.files += 1,
                "directory" => stats.directories += 1,
                "symlink" => stats.symlinks += 1,
                _ => stats.other += 1,
            }
            subvols.insert(entry.subvolume_id);
            stats.logical_bytes += entry.size;
            stats.disk_bytes += entry.disk_bytes;
            if entry.sha256.is_some() {
                stats.hashed += 1;
            }
            stats.checksums += entry.checksum_count;
        }
        stats.subvolumes = subvols.len();
        stats
    }

    pub fn print(&self) {
        println!("entries:        {}", self.entries);
        println!("  files:        {}", self.files);
        println!("  directories:  {}", self.directories);
        println!("  symlinks:     {}", self.symlinks);
        println!("  other:        {}", self.other);
        println!("subvolumes:     {}", self.subvolumes);
        println!("logical bytes:  {}", self.logical_bytes);
        println!("disk bytes:     {}", self.disk_bytes);
        println!("hashed files:   {}", self.hashed);
        println!("checksums seen: {}", self.checksums);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_is_lowercase_hyphenated() {
        let uuid = [
            0xab, 0x00, 0xc2, 0x87, 0xf8, 0xde, 0x4f, 0xe1, 0xb4, 0x63, 0x61, 0xcf, 0xc5, 0xc6,
            0x81, 0x4c,
        ];
        assert_eq!(uuid_str(&uuid), "ab00c287-f8de-4fe1-b463-61cfc5c6814c");
    }

    #[test]
    fn csv_quoting() {
        assert_eq!(csv_quote("plain"), "plain");
        assert_eq!(csv_quote("a,b"), "\"a,b\"");
        assert_eq!(csv_quote("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
