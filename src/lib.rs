//! `hikcarve` recovers video footage from raw Hikvision DVR disk images.
//!
//! The DVR family this crate targets writes recordings to a proprietary
//! on-disk filesystem rather than to files: a master control block at a
//! fixed offset describes the layout, a linked chain of `HIKBTREE` index
//! pages catalogs the recorded segments, and each segment occupies one
//! fixed-size data block holding an MPEG program stream.
//!
//! This crate provides:
//! - A memory-mapped [`Image`] reader over the raw image.
//! - Metadata parsing: [`MasterBlock::parse`] and [`walk_index`], or the
//!   bundled [`read_catalog`] convenience.
//! - A program-stream carver, [`carve_program_stream`], that writes the
//!   packets of one data block to any byte sink.
//! - An export orchestrator, [`export_all`], that composes the above with
//!   ordering, filename, and collision policy.
//! - A Tokio-based async `Stream` of catalog entries (enabled by default)
//!   for easy integration with async apps.
//!
//! ## Quick start (sync)
//! - Open an image with [`Image::open`], read its metadata with
//!   [`read_catalog`], then drive [`export_all`] with a sink factory.
//!
//! ## Quick start (async)
//! - Use [`async_catalog::stream_catalog`] to get a Tokio `Stream` of
//!   segment entries.
//!
//! ## Features
//! - `async` (default): enables Tokio stream helpers.
//!
//! Parsing is read-only and best-effort in the forensic sense: tombstoned
//! and implausible index entries are dropped with diagnostics, unknown
//! filesystem versions are parsed anyway with a [`Warning`], and nothing is
//! ever written back to the image.

pub mod error;

mod carve;
mod image;
mod index;
mod master;

pub mod export;

#[cfg(feature = "async")]
pub mod async_catalog;

pub use carve::{carve_program_stream, CarveOutcome, PS_PACK_START};
pub use error::{Error, Warning};
pub use export::{
    export_all, order_segments, read_catalog, resolve_collision, segment_filename, Catalog,
    ExportEvent, ExportOptions, ExportOrder, ExportSummary,
};
pub use image::Image;
pub use index::{
    walk_index, SegmentEntry, END_OF_CHAIN, INDEX_ENTRY_STRIDE, INDEX_MAGIC, MAX_INDEX_PAGES,
    RECORDING_SENTINEL,
};
pub use master::{MasterBlock, MASTER_LEN, MASTER_MAGIC, MASTER_OFFSET, SUPPORTED_VERSION};

#[cfg(feature = "async")]
pub use async_catalog::{stream_catalog, stream_catalog_from_image};
