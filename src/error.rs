use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Passthrough for IO errors (open/map/create).
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The image file has zero length and cannot be mapped.
    #[error("image file is empty")]
    EmptyImage,

    /// A decode would read past the end of the image.
    #[error("out of range: {len} bytes at offset {offset:#x} (image is {image_len} bytes)")]
    OutOfRange { offset: u64, len: u64, image_len: u64 },

    /// The master block signature did not match `HIKVISION@HANGZHOU`.
    #[error("wrong master block signature: found {found:?}")]
    BadMagic { found: String },

    /// The primary segment index signature did not match `HIKBTREE`.
    #[error("wrong segment index signature at offset {offset:#x}: found {found:?}")]
    BadIndexMagic { offset: u64, found: String },

    /// Carving was requested without a destination directory.
    #[error("no destination directory for export")]
    NoDestination,
}

/// Non-fatal diagnostics surfaced alongside results.
///
/// Warnings never abort a run; they are collected into
/// [`Catalog::warnings`](crate::export::Catalog) and forwarded as
/// [`ExportEvent::Warning`](crate::export::ExportEvent) during export.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Warning {
    /// The filesystem version string is not the one this parser was
    /// validated against; parsing proceeds best-effort.
    #[error("filesystem version {found:?} is untested (expected HIK.2011.03.08); use at your own risk")]
    UnsupportedVersion { found: String },

    /// The index page chain exceeded the page limit; the catalog is
    /// whatever was accumulated before the walk stopped.
    #[error("segment index chain exceeded {limit} pages; catalog may be truncated")]
    IndexOverrun { limit: usize },
}
