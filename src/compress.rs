//! Extent decompression behind a single seam.
//!
//! Codec 1 (zlib) and codec 3 (zstd) are direct library calls. Codec 2
//! (LZO) is btrfs-framed: a 4-byte total length, then per-segment 4-byte
//! length prefixes, where a segment header never straddles a 4 KiB page
//! of the compressed stream and each segment inflates to at most one
//! sector. The LZO1X-1 match decoder itself lives here too; nothing on
//! crates.io that the rest of this tool already depends on provides it.

use std::io::Read;

use byteorder::{ByteOrder, LittleEndian};

use crate::structures::{
    BTRFS_COMPRESS_LZO, BTRFS_COMPRESS_NONE, BTRFS_COMPRESS_ZLIB, BTRFS_COMPRESS_ZSTD,
    BTRFS_SECTOR_SIZE,
};
use crate::{BtrfsError, Result};

/// Decompress `data` with the given btrfs codec code, expecting
/// `expected_len` bytes of output. Output longer than `expected_len` is
/// truncated; an unknown codec is a soft failure the caller localizes.
pub fn decompress(codec: u8, data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut out = match codec {
        BTRFS_COMPRESS_NONE => data.to_vec(),
        BTRFS_COMPRESS_ZLIB => zlib_decompress(data, expected_len)?,
        BTRFS_COMPRESS_LZO => lzo_decompress(data, expected_len)?,
        BTRFS_COMPRESS_ZSTD => zstd_decompress(data, expected_len)?,
        other => return Err(BtrfsError::UnsupportedCompression(other)),
    };
    out.truncate(expected_len);
    Ok(out)
}

fn zlib_decompress(data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected_len);
    let mut decoder = flate2::read::ZlibDecoder::new(data);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| BtrfsError::Decompress(format!("zlib: {e}")))?;
    Ok(out)
}

fn zstd_decompress(data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    // single_frame stops at the frame boundary; compressed extents are
    // sector padded and the padding is not a second frame
    let decoder = zstd::stream::read::Decoder::new(data)
        .map_err(|e| BtrfsError::Decompress(format!("zstd: {e}")))?
        .single_frame();
    let mut out = Vec::with_capacity(expected_len);
    decoder
        .take(expected_len as u64)
        .read_to_end(&mut out)
        .map_err(|e| BtrfsError::Decompress(format!("zstd: {e}")))?;
    Ok(out)
}

/// Btrfs LZO framing: `u32` total stream length (header included), then
/// `u32` segment length + LZO1X-1 segment data, repeated. Segment length
/// words are padded onto the next 4 KiB page rather than split across one.
fn lzo_decompress(data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let total = frame_word(data, 0)? as usize;
    if total > data.len() {
        return Err(BtrfsError::Decompress(format!(
            "lzo: framed length {total} exceeds extent of {} bytes",
            data.len()
        )));
    }

    let mut out = Vec::with_capacity(expected_len);
    let mut pos = 4usize;
    while pos + 4 <= total && out.len() < expected_len {
        // a length word never straddles a page of the compressed stream
        let page_left = BTRFS_SECTOR_SIZE - pos % BTRFS_SECTOR_SIZE;
        if page_left < 4 {
            pos += page_left;
            if pos + 4 > total {
                break;
            }
        }
        let seg_len = frame_word(data, pos)? as usize;
        pos += 4;
        if seg_len == 0 || pos + seg_len > total {
            return Err(BtrfsError::Decompress(format!(
                "lzo: bad segment length {seg_len} at offset {pos}"
            )));
        }
        let want = (expected_len - out.len()).min(BTRFS_SECTOR_SIZE);
        let segment = lzo1x_decompress(&data[pos..pos + seg_len], want)?;
        out.extend_from_slice(&segment);
        pos += seg_len;
    }
    Ok(out)
}

fn frame_word(data: &[u8], pos: usize) -> Result<u32> {
    data.get(pos..pos + 4)
        .map(LittleEndian::read_u32)
        .ok_or_else(|| BtrfsError::Decompress("lzo: truncated length word".into()))
}

struct Lzo1xReader<'a> {
    src: &'a [u8],
    ip: usize,
}

impl Lzo1xReader<'_> {
    fn byte(&mut self) -> Result<usize> {
        let b = *self
            .src
            .get(self.ip)
            .ok_or_else(|| BtrfsError::Decompress("lzo: input overrun".into()))?;
        self.ip += 1;
        Ok(b as usize)
    }

    fn le16(&mut self) -> Result<usize> {
        let lo = self.byte()?;
        let hi = self.byte()?;
        Ok(lo | (hi << 8))
    }

    /// Zero-byte run extension used by long literal and match lengths.
    fn extended_len(&mut self, base: usize) -> Result<usize> {
        let mut t = 0usize;
        loop {
            let b = self.byte()?;
            if b != 0 {
                return Ok(t + base + b);
            }
            t += 255;
            if t > usize::MAX / 2 {
                return Err(BtrfsError::Decompress("lzo: runaway length".into()));
            }
        }
    }

    fn literals(&mut self, out: &mut Vec<u8>, n: usize, max_out: usize) -> Result<()> {
        if out.len() + n > max_out {
            return Err(BtrfsError::Decompress("lzo: output overrun".into()));
        }
        let end = self
            .ip
            .checked_add(n)
            .filter(|&e| e <= self.src.len())
            .ok_or_else(|| BtrfsError::Decompress("lzo: input overrun".into()))?;
        out.extend_from_slice(&self.src[self.ip..end]);
        self.ip = end;
        Ok(())
    }
}

fn copy_match(out: &mut Vec<u8>, distance: usize, len: usize, max_out: usize) -> Result<()> {
    if distance == 0 || distance > out.len() {
        return Err(BtrfsError::Decompress(format!(
            "lzo: match distance {distance} outside window of {}",
            out.len()
        )));
    }
    if out.len() + len > max_out {
        return Err(BtrfsError::Decompress("lzo: output overrun".into()));
    }
    // overlapping copies are how runs are encoded; go byte by byte
    let mut from = out.len() - distance;
    for _ in 0..len {
        let b = out[from];
        out.push(b);
        from += 1;
    }
    Ok(())
}

/// LZO1X-1 match decoder. Inflates one segment of at most `max_out`
/// bytes; fails on malformed streams rather than reading out of bounds.
pub fn lzo1x_decompress(src: &[u8], max_out: usize) -> Result<Vec<u8>> {
    let mut r = Lzo1xReader { src, ip: 0 };
    let mut out = Vec::with_capacity(max_out);

    let mut t = r.byte()?;
    let mut want_match;
    if t > 17 {
        t -= 17;
        if t < 4 {
            // short initial literal run, a match instruction follows
            r.literals(&mut out, t, max_out)?;
            t = r.byte()?;
            want_match = true;
        } else {
            r.literals(&mut out, t, max_out)?;
            t = r.byte()?;
            if t < 16 {
                // state-4 special: copy 3 from 2..3kB back
                let h = r.byte()?;
                let distance = (h << 2) + (t >> 2) + 2049;
                copy_match(&mut out, distance, 3, max_out)?;
                let trailing = t & 3;
                if trailing != 0 {
                    r.literals(&mut out, trailing, max_out)?;
                    t = r.byte()?;
                    want_match = true;
                } else {
                    t = r.byte()?;
                    want_match = t >= 16;
                }
            } else {
                want_match = true;
            }
        }
    } else {
        want_match = t >= 16;
    }

    loop {
        if !want_match {
            // literal run instruction
            let mut run = t;
            if run == 0 {
                run = r.extended_len(15)?;
            }
            r.literals(&mut out, run + 3, max_out)?;
            t = r.byte()?;
            if t < 16 {
                // state-4 special M1: copy 3 from 2..3kB back
                let h = r.byte()?;
                let distance = (h << 2) + (t >> 2) + 2049;
                copy_match(&mut out, distance, 3, max_out)?;
                let trailing = t & 3;
                if trailing == 0 {
                    t = r.byte()?;
                    want_match = t >= 16;
                } else {
                    r.literals(&mut out, trailing, max_out)?;
                    t = r.byte()?;
                    want_match = true;
                }
                continue;
            }
            want_match = true;
            continue;
        }

        // match instruction; t >= 16 except for the near M1 form
        let trailing;
        if t >= 64 {
            // M2: 3..8 bytes from up to 2kB back
            let h = r.byte()?;
            let distance = 1 + ((t >> 2) & 7) + (h << 3);
            let len = (t >> 5) + 1;
            copy_match(&mut out, distance, len, max_out)?;
            trailing = t & 3;
        } else if t >= 32 {
            // M3: up to 16kB back
            let mut len = t & 31;
            if len == 0 {
                len = r.extended_len(31)?;
            }
            let d = r.le16()?;
            let distance = 1 + (d >> 2);
            copy_match(&mut out, distance, len + 2, max_out)?;
            trailing = d & 3;
        } else if t >= 16 {
            // M4: 16..48kB back; doubles as the end marker
            let far = (t & 8) << 11;
            let mut len = t & 7;
            if len == 0 {
                len = r.extended_len(7)?;
            }
            let d = r.le16()?;
            let distance = far + (d >> 2);
            if distance == 0 {
                // end of stream
                return Ok(out);
            }
            copy_match(&mut out, distance + 0x4000, len + 2, max_out)?;
            trailing = d & 3;
        } else {
            // near M1: 2 bytes from up to 1kB back
            let h = r.byte()?;
            let distance = 1 + (t >> 2) + (h << 2);
            copy_match(&mut out, distance, 2, max_out)?;
            trailing = t & 3;
        }

        if trailing == 0 {
            t = r.byte()?;
            want_match = t >= 16;
        } else {
            r.literals(&mut out, trailing, max_out)?;
            t = r.byte()?;
            want_match = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Frame a raw LZO1X stream the way btrfs does for a single segment.
    fn frame(segment: &[u8]) -> Vec<u8> {
        let mut framed = Vec::new();
        framed.extend_from_slice(&(8 + segment.len() as u32).to_le_bytes());
        framed.extend_from_slice(&(segment.len() as u32).to_le_bytes());
        framed.extend_from_slice(segment);
        framed
    }

    /// Literal-only LZO1X stream: initial run marker, payload, end marker.
    fn lzo_literal_stream(payload: &[u8]) -> Vec<u8> {
        assert!(payload.len() >= 4 && payload.len() <= 238);
        let mut stream = vec![17 + payload.len() as u8];
        stream.extend_from_slice(payload);
        stream.extend_from_slice(&[0x11, 0x00, 0x00]);
        stream
    }

    #[test]
    fn zlib_round_trip() {
        use flate2::write::ZlibEncoder;
        use flate2::Compression;
        use std::io::Write;

        let plain = b"the quick brown fox jumps over the lazy dog";
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(plain).unwrap();
        let packed = encoder.finish().unwrap();

        let out = decompress(BTRFS_COMPRESS_ZLIB, &packed, plain.len()).unwrap();
        assert_eq!(out, plain);
    }

    #[test]
    fn zstd_round_trip() {
        let plain: Vec<u8> = (0..2048u32).flat_map(|i| i.to_le_bytes()).collect();
        let packed = zstd::stream::encode_all(&plain[..], 0).unwrap();
        let out = decompress(BTRFS_COMPRESS_ZSTD, &packed, plain.len()).unwrap();
        assert_eq!(out, plain);
    }

    #[test]
    fn zstd_ignores_sector_padding() {
        let plain = b"compressed then padded to a sector boundary";
        let mut packed = zstd::stream::encode_all(&plain[..], 0).unwrap();
        packed.resize(512, 0);
        let out = decompress(BTRFS_COMPRESS_ZSTD, &packed, plain.len()).unwrap();
        assert_eq!(out, plain);
    }

    #[test]
    fn lzo_literal_only_segment() {
        let payload = b"hello world";
        let framed = frame(&lzo_literal_stream(payload));
        let out = decompress(BTRFS_COMPRESS_LZO, &framed, payload.len()).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn lzo_short_match() {
        // "abc" literals followed by a 6-byte copy at distance 3:
        // M2 control 0xA8 (len 6, distance 3), then the end marker.
        let stream = [0x14, b'a', b'b', b'c', 0xA8, 0x00, 0x11, 0x00, 0x00];
        let out = lzo1x_decompress(&stream, 16).unwrap();
        assert_eq!(out, b"abcabcabc");
    }

    #[test]
    fn lzo_overlapping_match_makes_run() {
        // one literal then a long overlapping copy at distance 1 is the
        // classic RLE encoding
        // M3 control 0x20|len, len = 30 -> copies 32 bytes
        let stream = [0x12, b'x', 0x3E, 0x00, 0x00, 0x11, 0x00, 0x00];
        let out = lzo1x_decompress(&stream, 64).unwrap();
        assert_eq!(out, vec![b'x'; 33]);
    }

    #[test]
    fn lzo_bad_distance_is_error() {
        // match referencing bytes before the start of output
        let stream = [0x12, b'x', 0xA8, 0x40, 0x11, 0x00, 0x00];
        assert!(lzo1x_decompress(&stream, 64).is_err());
    }

    #[test]
    fn lzo_truncated_frame_is_error() {
        let framed = frame(&lzo_literal_stream(b"hello world"));
        assert!(decompress(BTRFS_COMPRESS_LZO, &framed[..6], 11).is_err());
    }

    #[test]
    fn unknown_codec_is_soft_failure() {
        assert!(matches!(
            decompress(9, b"x", 1),
            Err(BtrfsError::UnsupportedCompression(9))
        ));
    }

    #[test]
    fn none_codec_truncates_to_expected() {
        let out = decompress(BTRFS_COMPRESS_NONE, b"abcdef", 4).unwrap();
        assert_eq!(out, b"abcd");
    }
}
