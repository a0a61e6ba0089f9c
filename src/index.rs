use chrono::{DateTime, Utc};

use crate::image::{printable, Image};
use crate::master::MasterBlock;
use crate::{Error, Warning};

/// Signature of the primary segment index.
pub const INDEX_MAGIC: &[u8; 8] = b"HIKBTREE";

/// Byte stride between index slots within a page.
pub const INDEX_ENTRY_STRIDE: u64 = 48;

/// Start-timestamp value marking a segment that is still being written.
pub const RECORDING_SENTINEL: u32 = 0x7FFF_FFFF;

/// Next-page pointer value terminating the page chain.
pub const END_OF_CHAIN: u64 = u64::MAX;

/// Guard against cyclic or runaway page chains.
pub const MAX_INDEX_PAGES: usize = 1000;

/// One recorded video segment from the primary index.
///
/// This is a plain value copied out of the mapping at decode time; it never
/// borrows the image. `recording == true` means the segment was still being
/// written when the device stopped, and both timestamps are absent;
/// otherwise both are present with `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentEntry {
    /// Camera channel id.
    pub channel: u8,
    /// Segment was in progress when the image was taken.
    pub recording: bool,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Absolute byte offset of the segment's data block in the image.
    pub offset_datablock: u64,
}

/// One visited page of the index chain. Never surfaced to callers.
struct IndexPage {
    entry_count: u32,
    next_page: u64,
    first_slot: u64,
}

impl IndexPage {
    fn read(image: &Image, page: u64) -> Result<Self, Error> {
        Ok(IndexPage {
            entry_count: image.read_u32(page.saturating_add(0x10))?,
            next_page: image.read_u64(page.saturating_add(0x20))?,
            first_slot: page.saturating_add(0x60),
        })
    }
}

/// Walk the primary index and produce the full segment catalog.
///
/// The catalog preserves on-disk page-and-slot order; any reordering is the
/// export layer's concern. Tombstoned slots are silently dropped. A page
/// chain longer than [`MAX_INDEX_PAGES`] stops the walk with
/// [`Warning::IndexOverrun`]; whatever was accumulated is still returned.
pub fn walk_index(
    image: &Image,
    master: &MasterBlock,
    warnings: &mut Vec<Warning>,
) -> Result<Vec<SegmentEntry>, Error> {
    let base = master.offset_primary_index;
    let signature: [u8; 8] = image.read_array(base.saturating_add(0x10))?;
    if &signature != INDEX_MAGIC {
        return Err(Error::BadIndexMagic {
            offset: base,
            found: printable(&signature),
        });
    }

    let mut page = image.read_u64(base.saturating_add(0x58))?;
    let mut entries = Vec::new();
    let mut visited = 0usize;

    loop {
        visited += 1;
        let header = IndexPage::read(image, page)?;
        log::debug!(
            "index page {visited} at {page:#x}: {} slots, next {:#x}",
            header.entry_count,
            header.next_page
        );

        for i in 0..u64::from(header.entry_count) {
            let slot = header.first_slot.saturating_add(i * INDEX_ENTRY_STRIDE);
            if let Some(entry) = decode_slot(image, slot)? {
                if keep_entry(&entry, master, image.len()) {
                    entries.push(entry);
                }
            }
        }

        if header.next_page == END_OF_CHAIN {
            break;
        }
        if visited >= MAX_INDEX_PAGES {
            warnings.push(Warning::IndexOverrun {
                limit: MAX_INDEX_PAGES,
            });
            break;
        }
        page = header.next_page;
    }

    Ok(entries)
}

/// Decode one 48-byte index slot. `None` means the slot is tombstoned.
fn decode_slot(image: &Image, slot: u64) -> Result<Option<SegmentEntry>, Error> {
    // Non-zero at +0x08 marks the slot unallocated or reclaimed.
    if image.read_u64(slot.saturating_add(0x08))? != 0 {
        return Ok(None);
    }

    let channel = image.read_u8(slot.saturating_add(0x11))?;
    let start_raw = image.read_u32(slot.saturating_add(0x18))?;
    let offset_datablock = image.read_u64(slot.saturating_add(0x20))?;

    let entry = if start_raw == RECORDING_SENTINEL {
        SegmentEntry {
            channel,
            recording: true,
            start: None,
            end: None,
            offset_datablock,
        }
    } else {
        SegmentEntry {
            channel,
            recording: false,
            start: Some(image.read_datetime(slot.saturating_add(0x18))?),
            end: Some(image.read_datetime(slot.saturating_add(0x1C))?),
            offset_datablock,
        }
    };
    Ok(Some(entry))
}

/// Reject entries that violate catalog invariants: the data block must lie
/// entirely inside the image, and a completed segment must not end before
/// it starts.
fn keep_entry(entry: &SegmentEntry, master: &MasterBlock, image_len: u64) -> bool {
    let in_image = entry
        .offset_datablock
        .checked_add(master.size_data_block)
        .is_some_and(|end| end <= image_len);
    if !in_image {
        log::warn!(
            "dropping channel {:02} entry: data block at {:#x} extends past the image",
            entry.channel,
            entry.offset_datablock
        );
        return false;
    }
    if let (Some(start), Some(end)) = (entry.start, entry.end) {
        if start > end {
            log::warn!(
                "dropping channel {:02} entry at {:#x}: start {start} is after end {end}",
                entry.channel,
                entry.offset_datablock
            );
            return false;
        }
    }
    true
}
