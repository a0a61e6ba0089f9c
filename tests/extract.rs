//! End-to-end tests over synthetic disk images: build an image in memory,
//! write it to a temp file, then run the catalog and export paths against
//! it exactly as the CLI would.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use hikcarve::{
    export_all, read_catalog, CarveOutcome, Error, ExportEvent, ExportOptions, ExportOrder, Image,
    END_OF_CHAIN, INDEX_MAGIC, MASTER_MAGIC, MASTER_OFFSET, PS_PACK_START, SUPPORTED_VERSION,
};
use tempfile::{NamedTempFile, TempDir};

const INDEX_OFFSET: usize = 0x1000;
const PAGE_OFFSET: usize = 0x2000;
const FIRST_SLOT: usize = PAGE_OFFSET + 0x60;
const BLOCK_SIZE: u64 = 0x4000;
const IMAGE_LEN: usize = 0x2_0000;

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Builder for a minimal valid image: master block, one-page index, and a
/// video area with `BLOCK_SIZE` data blocks from 0x10000 upward.
struct TestImage {
    buf: Vec<u8>,
    slots: u32,
}

impl TestImage {
    fn new() -> Self {
        let mut buf = vec![0u8; IMAGE_LEN];
        let master = MASTER_OFFSET as usize;
        buf[master + 0x10..master + 0x22].copy_from_slice(MASTER_MAGIC);
        buf[master + 0x30..master + 0x3E].copy_from_slice(SUPPORTED_VERSION);
        put_u64(&mut buf, master + 0x48, IMAGE_LEN as u64);
        put_u64(&mut buf, master + 0x88, BLOCK_SIZE);
        put_u32(&mut buf, master + 0x90, 4);
        put_u64(&mut buf, master + 0x98, INDEX_OFFSET as u64);
        put_u32(&mut buf, master + 0xF0, 1_500_000_000);

        buf[INDEX_OFFSET + 0x10..INDEX_OFFSET + 0x18].copy_from_slice(INDEX_MAGIC);
        put_u64(&mut buf, INDEX_OFFSET + 0x58, PAGE_OFFSET as u64);
        put_u64(&mut buf, PAGE_OFFSET + 0x20, END_OF_CHAIN);

        TestImage { buf, slots: 0 }
    }

    fn next_slot(&mut self) -> usize {
        let slot = FIRST_SLOT + self.slots as usize * 48;
        self.slots += 1;
        put_u32(&mut self.buf, PAGE_OFFSET + 0x10, self.slots);
        slot
    }

    fn push_completed(&mut self, channel: u8, start: u32, end: u32, offset: u64) {
        let slot = self.next_slot();
        self.buf[slot + 0x11] = channel;
        put_u32(&mut self.buf, slot + 0x18, start);
        put_u32(&mut self.buf, slot + 0x1C, end);
        put_u64(&mut self.buf, slot + 0x20, offset);
    }

    fn push_recording(&mut self, channel: u8, offset: u64) {
        let slot = self.next_slot();
        self.buf[slot + 0x11] = channel;
        put_u32(&mut self.buf, slot + 0x18, 0x7FFF_FFFF);
        put_u64(&mut self.buf, slot + 0x20, offset);
    }

    /// Fill one data block with payload bytes and drop pack-start codes at
    /// the given block-relative offsets.
    fn fill_block(&mut self, block: u64, pack_offsets: &[usize]) {
        let base = block as usize;
        self.buf[base..base + BLOCK_SIZE as usize].fill(0xAB);
        for &rel in pack_offsets {
            self.buf[base + rel..base + rel + 4].copy_from_slice(&PS_PACK_START);
        }
    }

    fn open(&self) -> (NamedTempFile, Image) {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(&self.buf).expect("write image");
        file.flush().expect("flush");
        let image = Image::open(file.path()).expect("open image");
        (file, image)
    }
}

fn raw_file_sink(path: &Path) -> std::io::Result<BufWriter<fs::File>> {
    fs::File::create(path).map(BufWriter::new)
}

fn run_export(
    image: &Image,
    opts: &ExportOptions,
    dest: Option<&Path>,
) -> (hikcarve::ExportSummary, Vec<ExportEvent>) {
    let mut events = Vec::new();
    let summary = export_all(image, opts, dest, raw_file_sink, |event| events.push(event))
        .expect("export runs");
    (summary, events)
}

#[test]
fn empty_image_is_rejected_at_open() {
    let file = NamedTempFile::new().expect("temp file");
    assert!(matches!(Image::open(file.path()), Err(Error::EmptyImage)));
}

#[test]
fn catalog_of_a_minimal_image() {
    let mut img = TestImage::new();
    img.push_completed(7, 1_700_000_000, 1_700_000_060, 0x1_0000);
    let (_file, image) = img.open();

    let catalog = read_catalog(&image).expect("read catalog");
    assert!(catalog.warnings.is_empty());
    assert_eq!(catalog.master.size_data_block, BLOCK_SIZE);
    assert_eq!(catalog.segments.len(), 1);

    let entry = catalog.segments[0];
    assert_eq!(entry.channel, 7);
    assert!(!entry.recording);
    assert_eq!(
        entry.start.unwrap().to_rfc3339(),
        "2023-11-14T22:13:20+00:00"
    );
    assert_eq!(entry.end.unwrap().to_rfc3339(), "2023-11-14T22:14:20+00:00");
    assert_eq!(entry.offset_datablock, 0x1_0000);
}

#[test]
fn catalog_is_idempotent() {
    let mut img = TestImage::new();
    img.push_completed(1, 1_600_000_000, 1_600_000_600, 0x1_0000);
    img.push_recording(2, 0x1_4000);
    let (_file, image) = img.open();

    let first = read_catalog(&image).expect("first read");
    let second = read_catalog(&image).expect("second read");
    assert_eq!(first.master, second.master);
    assert_eq!(first.segments, second.segments);
    assert_eq!(first.warnings, second.warnings);
}

#[test]
fn unknown_version_is_a_warning_not_an_error() {
    let mut img = TestImage::new();
    let master = MASTER_OFFSET as usize;
    img.buf[master + 0x30..master + 0x3E].copy_from_slice(b"HIK.2016.06.06");
    img.push_recording(1, 0x1_0000);
    let (_file, image) = img.open();

    let catalog = read_catalog(&image).expect("read catalog");
    assert_eq!(catalog.segments.len(), 1);
    assert_eq!(catalog.warnings.len(), 1);
    assert!(matches!(
        catalog.warnings[0],
        hikcarve::Warning::UnsupportedVersion { .. }
    ));
}

#[test]
fn export_carves_packets_into_named_files() {
    let mut img = TestImage::new();
    img.push_completed(7, 1_700_000_000, 1_700_000_060, 0x1_0000);
    img.fill_block(0x1_0000, &[16, 3000]);
    let (_file, image) = img.open();
    let dir = TempDir::new().expect("temp dir");

    let opts = ExportOptions {
        raw_stream: true,
        ..Default::default()
    };
    let (summary, events) = run_export(&image, &opts, Some(dir.path()));

    assert_eq!(summary.exported, 1);
    assert_eq!(summary.skipped, 0);

    let expected_path = dir
        .path()
        .join("CH-07__2023-11-14-22-13__2023-11-14-22-14.h264");
    let written = fs::read(&expected_path).expect("carved file exists");
    assert_eq!(written, img.buf[0x1_0000 + 16..0x1_0000 + 3000]);

    assert!(events.iter().any(|event| matches!(
        event,
        ExportEvent::SegmentFinished {
            outcome: CarveOutcome::Done,
            ..
        }
    )));
}

#[test]
fn block_without_stream_is_reported_empty() {
    let mut img = TestImage::new();
    img.push_recording(3, 0x1_0000);
    let (_file, image) = img.open();
    let dir = TempDir::new().expect("temp dir");

    let opts = ExportOptions {
        raw_stream: true,
        ..Default::default()
    };
    let (summary, _) = run_export(&image, &opts, Some(dir.path()));

    assert_eq!(summary.empty, 1);
    assert_eq!(summary.exported, 0);
    let written = fs::read(dir.path().join("CH-03__RECORDING.h264")).expect("file exists");
    assert!(written.is_empty());
}

#[test]
fn channel_filter_keeps_only_the_requested_channel() {
    let mut img = TestImage::new();
    img.push_completed(1, 1_600_000_000, 1_600_000_060, 0x1_0000);
    img.push_completed(2, 1_600_001_000, 1_600_001_060, 0x1_4000);
    let (_file, image) = img.open();

    let opts = ExportOptions {
        list_only: true,
        channel: Some(2),
        ..Default::default()
    };
    let (summary, events) = run_export(&image, &opts, None);

    assert_eq!(summary.listed, 1);
    let listed: Vec<u8> = events
        .iter()
        .filter_map(|event| match event {
            ExportEvent::SegmentListed(entry) => Some(entry.channel),
            _ => None,
        })
        .collect();
    assert_eq!(listed, vec![2]);
}

#[test]
fn list_mode_needs_no_destination_and_writes_nothing() {
    let mut img = TestImage::new();
    img.push_recording(5, 0x1_0000);
    let (_file, image) = img.open();

    let opts = ExportOptions {
        list_only: true,
        ..Default::default()
    };
    let (summary, events) = run_export(&image, &opts, None);
    assert_eq!(summary.listed, 1);
    assert_eq!(summary.exported, 0);
    assert!(events
        .iter()
        .any(|event| matches!(event, ExportEvent::SegmentListed(_))));
}

#[test]
fn master_only_stops_before_the_index() {
    // The index area is garbage; master-only must still succeed.
    let mut img = TestImage::new();
    img.buf[INDEX_OFFSET + 0x10] = b'X';
    let (_file, image) = img.open();

    let opts = ExportOptions {
        master_only: true,
        ..Default::default()
    };
    let (_, events) = run_export(&image, &opts, None);
    assert!(events
        .iter()
        .any(|event| matches!(event, ExportEvent::MasterParsed(_))));
    assert!(!events
        .iter()
        .any(|event| matches!(event, ExportEvent::ChannelCounts(_))));
}

#[test]
fn carving_without_destination_fails() {
    let mut img = TestImage::new();
    img.push_recording(1, 0x1_0000);
    let (_file, image) = img.open();

    let opts = ExportOptions {
        raw_stream: true,
        ..Default::default()
    };
    let result = export_all(&image, &opts, None, raw_file_sink, |_| {});
    assert!(matches!(result, Err(Error::NoDestination)));
}

#[test]
fn physical_order_runs_newest_offset_first() {
    let mut img = TestImage::new();
    img.push_completed(1, 1_700_000_000, 1_700_000_060, 0x1_0000);
    img.push_completed(2, 1_600_000_000, 1_600_000_060, 0x1_8000);
    img.push_recording(3, 0x1_4000);
    for block in [0x1_0000u64, 0x1_4000, 0x1_8000] {
        img.fill_block(block, &[0, 2000]);
    }
    let (_file, image) = img.open();
    let dir = TempDir::new().expect("temp dir");

    let opts = ExportOptions {
        order: ExportOrder::Physical,
        raw_stream: true,
        ..Default::default()
    };
    let (summary, events) = run_export(&image, &opts, Some(dir.path()));
    assert_eq!(summary.exported, 3);

    let started: Vec<u64> = events
        .iter()
        .filter_map(|event| match event {
            ExportEvent::SegmentStarted { entry, .. } => Some(entry.offset_datablock),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec![0x1_8000, 0x1_4000, 0x1_0000]);

    assert!(dir.path().join("CH-02__seq000001.h264").is_file());
    assert!(dir.path().join("CH-03__seq000002__RECORDING.h264").is_file());
    assert!(dir.path().join("CH-01__seq000003.h264").is_file());
}

#[test]
fn colliding_filenames_get_a_counter_suffix() {
    let mut img = TestImage::new();
    img.push_recording(9, 0x1_0000);
    img.fill_block(0x1_0000, &[0, 1000]);
    let (_file, image) = img.open();
    let dir = TempDir::new().expect("temp dir");

    let opts = ExportOptions {
        raw_stream: true,
        ..Default::default()
    };
    let (first, _) = run_export(&image, &opts, Some(dir.path()));
    let (second, _) = run_export(&image, &opts, Some(dir.path()));
    assert_eq!(first.exported, 1);
    assert_eq!(second.exported, 1);

    assert!(dir.path().join("CH-09__RECORDING.h264").is_file());
    assert!(dir.path().join("CH-09__RECORDING_1.h264").is_file());
}

#[cfg(feature = "async")]
mod async_stream {
    use super::*;
    use tokio_stream::StreamExt;

    #[test]
    fn streams_the_catalog_in_disk_order() {
        let mut img = TestImage::new();
        img.push_completed(4, 1_700_000_000, 1_700_000_060, 0x1_0000);
        img.push_recording(6, 0x1_4000);
        let (file, _image) = img.open();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        let channels: Vec<u8> = runtime.block_on(async {
            hikcarve::stream_catalog(file.path(), 8)
                .map(|item| item.expect("catalog entry").channel)
                .collect()
                .await
        });
        assert_eq!(channels, vec![4, 6]);
    }
}
