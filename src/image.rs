//! Positioned-read access to the disk image.
//!
//! The image is opened once and every consumer reads through absolute
//! offsets; there is no shared cursor to coordinate.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::{BtrfsError, Result};

pub struct ImageFile {
    file: File,
    len: u64,
}

impl ImageFile {
    pub fn open(path: &Path) -> Result<ImageFile> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(ImageFile { file, len })
    }

    /// Image length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read exactly `len` bytes at absolute `offset`. A read past the end
    /// of the image fails with [`BtrfsError::ShortRead`] without touching
    /// the file.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let short = || BtrfsError::ShortRead {
            offset,
            wanted: len,
        };
        let end = offset.checked_add(len as u64).ok_or_else(short)?;
        if end > self.len {
            return Err(short());
        }
        let mut buf = vec![0u8; len];
        self.file.read_exact_at(&mut buf, offset).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                short()
            } else {
                BtrfsError::Io(e)
            }
        })?;
        Ok(buf)
    }
}
