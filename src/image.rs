use std::fs::File;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Utc};
use memmap2::Mmap;

use crate::Error;

// -----------------------------
// Memory-mapped image access
// -----------------------------

/// A read-only, memory-mapped view of a raw DVR disk image.
///
/// The image is mapped once at open time and never mutated, so an `Image`
/// can be shared freely across threads for concurrent read-only access.
/// All multi-byte decoders are little-endian, matching the on-disk format.
pub struct Image {
    map: Mmap,
}

impl Image {
    /// Map an image file for reading.
    ///
    /// Fails with [`Error::EmptyImage`] when the file has zero length and
    /// with [`Error::Io`] when it cannot be opened or mapped.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Err(Error::EmptyImage);
        }
        // Safety: the mapping is never written through, and the image is
        // treated as untrusted bytes everywhere it is decoded.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Image { map })
    }

    /// Total image size in bytes; fixed for the lifetime of the reader.
    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Borrow the byte range `[start, end)`.
    pub fn slice(&self, start: u64, end: u64) -> Result<&[u8], Error> {
        if start > end || end > self.len() {
            return Err(Error::OutOfRange {
                offset: start,
                len: end.saturating_sub(start),
                image_len: self.len(),
            });
        }
        Ok(&self.map[start as usize..end as usize])
    }

    fn bytes_at(&self, offset: u64, len: u64) -> Result<&[u8], Error> {
        let end = offset.checked_add(len).ok_or(Error::OutOfRange {
            offset,
            len,
            image_len: self.len(),
        })?;
        self.slice(offset, end)
    }

    pub fn read_u8(&self, offset: u64) -> Result<u8, Error> {
        Ok(self.bytes_at(offset, 1)?[0])
    }

    pub fn read_u32(&self, offset: u64) -> Result<u32, Error> {
        Ok(LittleEndian::read_u32(self.bytes_at(offset, 4)?))
    }

    pub fn read_u64(&self, offset: u64) -> Result<u64, Error> {
        Ok(LittleEndian::read_u64(self.bytes_at(offset, 8)?))
    }

    /// Fixed-size byte read, for signature and version fields.
    pub fn read_array<const N: usize>(&self, offset: u64) -> Result<[u8; N], Error> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes_at(offset, N as u64)?);
        Ok(out)
    }

    /// Decode a little-endian u32 at `offset` as UTC seconds since the Unix
    /// epoch. Zero is a valid timestamp, not a sentinel.
    pub fn read_datetime(&self, offset: u64) -> Result<DateTime<Utc>, Error> {
        let secs = self.read_u32(offset)?;
        // Every u32 second count is representable in chrono's range.
        Ok(DateTime::from_timestamp(i64::from(secs), 0).unwrap_or(DateTime::UNIX_EPOCH))
    }

    /// Search for `needle` within `[start, min(start + max_len, len()))`.
    ///
    /// Returns the absolute offset of the first match, or `None` when the
    /// pattern does not occur entirely inside the window.
    pub fn find(&self, needle: &[u8], start: u64, max_len: u64) -> Option<u64> {
        let start = usize::try_from(start).ok()?;
        let max_len = usize::try_from(max_len).unwrap_or(usize::MAX);
        find_bytes(&self.map, needle, start, max_len).map(|pos| pos as u64)
    }
}

/// Bounded substring search over a byte slice.
///
/// The match must lie entirely within `[start, min(start + max_len, len))`.
pub(crate) fn find_bytes(
    haystack: &[u8],
    needle: &[u8],
    start: usize,
    max_len: usize,
) -> Option<usize> {
    if needle.is_empty() || start >= haystack.len() {
        return None;
    }
    let end = haystack.len().min(start.saturating_add(max_len));
    haystack[start..end]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| start + pos)
}

/// Best-effort display of on-disk name fields for diagnostics.
pub(crate) fn printable(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii_graphic() { b as char } else { '.' })
        .collect()
}
