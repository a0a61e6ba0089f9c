#![cfg(feature = "async")]

use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::export::read_catalog;
use crate::image::Image;
use crate::index::SegmentEntry;
use crate::Error;

/// Create a Tokio `Stream` of segment catalog entries from an image on disk.
///
/// This API is enabled by default (crate feature `async`).
///
/// Implementation detail: mapping and walking the image is synchronous, so
/// this function runs the scan on a blocking thread
/// (`tokio::task::spawn_blocking`) and forwards entries over a bounded
/// channel. Non-fatal warnings are routed through `log`; a fatal parse
/// error arrives as the stream's only (and last) item.
///
/// `buffer` controls the channel capacity.
pub fn stream_catalog(
    path: impl Into<PathBuf>,
    buffer: usize,
) -> ReceiverStream<Result<SegmentEntry, Error>> {
    let path = path.into();
    let (tx, rx) = mpsc::channel(buffer.max(1));

    tokio::task::spawn_blocking(move || {
        let image = match Image::open(&path) {
            Ok(image) => image,
            Err(err) => {
                let _ = tx.blocking_send(Err(err));
                return;
            }
        };
        send_catalog(&image, &tx);
    });

    ReceiverStream::new(rx)
}

/// Create a Tokio `Stream` of segment catalog entries from an already
/// opened [`Image`].
///
/// The image must be owned because the scan runs in `spawn_blocking`.
pub fn stream_catalog_from_image(
    image: Image,
    buffer: usize,
) -> ReceiverStream<Result<SegmentEntry, Error>> {
    let (tx, rx) = mpsc::channel(buffer.max(1));

    tokio::task::spawn_blocking(move || {
        send_catalog(&image, &tx);
    });

    ReceiverStream::new(rx)
}

fn send_catalog(image: &Image, tx: &mpsc::Sender<Result<SegmentEntry, Error>>) {
    let catalog = match read_catalog(image) {
        Ok(catalog) => catalog,
        Err(err) => {
            let _ = tx.blocking_send(Err(err));
            return;
        }
    };
    for warning in &catalog.warnings {
        log::warn!("{warning}");
    }
    for entry in catalog.segments {
        if tx.blocking_send(Ok(entry)).is_err() {
            break;
        }
    }
}
