use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::carve::{carve_program_stream, CarveOutcome};
use crate::image::Image;
use crate::index::{walk_index, SegmentEntry};
use crate::master::MasterBlock;
use crate::{Error, Warning};

/// How segments are ordered for listing and export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportOrder {
    /// Sort by `(start time, channel)`, in-progress segments first. Matches
    /// the device's own notion of chronology, which is only as good as its
    /// real-time clock.
    #[default]
    Time,
    /// Sort by data-block offset, descending. Higher offsets are assumed
    /// newer; useful when the device clock was wrong or reset.
    Physical,
}

/// Options for one orchestrated run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExportOptions {
    /// Produce the catalog only; do not carve.
    pub list_only: bool,
    /// Produce the master-block summary only; do not walk the index.
    pub master_only: bool,
    /// Keep only segments recorded by this channel.
    pub channel: Option<u8>,
    pub order: ExportOrder,
    /// The output is a raw elementary stream; filenames get the raw
    /// extension instead of the container one.
    pub raw_stream: bool,
}

/// Progress events emitted while a run executes.
///
/// Events are owned values and can be forwarded across threads.
#[derive(Debug, Clone)]
pub enum ExportEvent {
    MasterParsed(MasterBlock),
    Warning(Warning),
    /// Per-channel segment counts over the whole catalog, before filtering.
    ChannelCounts(BTreeMap<u8, usize>),
    /// One catalog row, in the requested order. Emitted in list mode only.
    SegmentListed(SegmentEntry),
    SegmentStarted {
        index: usize,
        total: usize,
        entry: SegmentEntry,
        path: PathBuf,
    },
    SegmentFinished {
        index: usize,
        entry: SegmentEntry,
        path: PathBuf,
        outcome: CarveOutcome,
    },
    /// The segment could not be carved; the run continues with the next.
    SegmentSkipped {
        index: usize,
        entry: SegmentEntry,
        reason: String,
    },
}

/// Tally of one orchestrated run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub listed: usize,
    pub exported: usize,
    /// Data blocks with no pack-start code; a sink was opened but nothing
    /// was written.
    pub empty: usize,
    pub skipped: usize,
}

/// The parsed metadata of one image: master block, segment catalog in
/// on-disk order, and any non-fatal warnings raised while reading them.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub master: MasterBlock,
    pub segments: Vec<SegmentEntry>,
    pub warnings: Vec<Warning>,
}

/// Parse the master block and walk the primary index.
///
/// This is the programmatic entry point for callers that want the metadata
/// without driving an export.
pub fn read_catalog(image: &Image) -> Result<Catalog, Error> {
    let mut warnings = Vec::new();
    let master = MasterBlock::parse(image)?;
    if !master.is_supported_version() {
        warnings.push(Warning::UnsupportedVersion {
            found: master.version_string(),
        });
    }
    let segments = walk_index(image, &master, &mut warnings)?;
    Ok(Catalog {
        master,
        segments,
        warnings,
    })
}

/// Sort segments in place for the requested ordering.
pub fn order_segments(segments: &mut [SegmentEntry], order: ExportOrder) {
    match order {
        ExportOrder::Time => segments.sort_by_cached_key(time_sort_key),
        ExportOrder::Physical => {
            segments.sort_by(|a, b| b.offset_datablock.cmp(&a.offset_datablock))
        }
    }
}

// In-progress segments carry no start time; the synthetic "00REC" prefix
// sorts them ahead of every timestamped key.
fn time_sort_key(entry: &SegmentEntry) -> String {
    match entry.start {
        Some(start) => format!("{}-{:02}", start.format("%Y%m%d%H%M"), entry.channel),
        None => format!("00REC-{:02}", entry.channel),
    }
}

/// Render the output filename for one segment.
///
/// `seq` is the run-local sequence number used under physical ordering,
/// where timestamps are not trusted; `None` selects the timestamped form.
pub fn segment_filename(entry: &SegmentEntry, ext: &str, seq: Option<u32>) -> String {
    let ch = entry.channel;
    match seq {
        Some(n) if entry.recording => format!("CH-{ch:02}__seq{n:06}__RECORDING.{ext}"),
        Some(n) => format!("CH-{ch:02}__seq{n:06}.{ext}"),
        None => match (entry.start, entry.end) {
            (Some(start), Some(end)) => format!(
                "CH-{ch:02}__{}__{}.{ext}",
                start.format("%Y-%m-%d-%H-%M"),
                end.format("%Y-%m-%d-%H-%M")
            ),
            _ => format!("CH-{ch:02}__RECORDING.{ext}"),
        },
    }
}

/// Join `filename` onto `dir`, appending `_<k>` before the extension for
/// the smallest `k >= 1` that avoids an existing file.
pub fn resolve_collision(dir: &Path, filename: &str) -> PathBuf {
    let mut candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = filename
        .rsplit_once('.')
        .unwrap_or((filename, ""));
    for k in 1u32.. {
        candidate = if ext.is_empty() {
            dir.join(format!("{stem}_{k}"))
        } else {
            dir.join(format!("{stem}_{k}.{ext}"))
        };
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("collision counter exhausted");
}

/// Run a full export: parse master, walk the index, filter and order the
/// catalog, then carve each eligible segment into a sink produced by
/// `make_sink`.
///
/// The sink for a segment is acquired immediately before carving and
/// dropped on every exit path, including skip paths. Per-segment failures
/// emit [`ExportEvent::SegmentSkipped`] and do not abort the run. `dest`
/// may be `None` only when no carving will happen (`list_only` or
/// `master_only`); otherwise the run fails with [`Error::NoDestination`].
pub fn export_all<W, F, E>(
    image: &Image,
    opts: &ExportOptions,
    dest: Option<&Path>,
    mut make_sink: F,
    mut on_event: E,
) -> Result<ExportSummary, Error>
where
    W: Write,
    F: FnMut(&Path) -> io::Result<W>,
    E: FnMut(ExportEvent),
{
    let mut summary = ExportSummary::default();

    let master = MasterBlock::parse(image)?;
    on_event(ExportEvent::MasterParsed(master.clone()));
    if !master.is_supported_version() {
        on_event(ExportEvent::Warning(Warning::UnsupportedVersion {
            found: master.version_string(),
        }));
    }
    if opts.master_only {
        return Ok(summary);
    }

    let mut warnings = Vec::new();
    let mut segments = walk_index(image, &master, &mut warnings)?;
    for warning in warnings {
        on_event(ExportEvent::Warning(warning));
    }

    let mut counts = BTreeMap::new();
    for entry in &segments {
        *counts.entry(entry.channel).or_insert(0) += 1;
    }
    on_event(ExportEvent::ChannelCounts(counts));

    if let Some(channel) = opts.channel {
        segments.retain(|entry| entry.channel == channel);
    }
    order_segments(&mut segments, opts.order);

    if opts.list_only {
        for entry in segments {
            on_event(ExportEvent::SegmentListed(entry));
            summary.listed += 1;
        }
        return Ok(summary);
    }

    let dest = dest.ok_or(Error::NoDestination)?;
    let ext = if opts.raw_stream { "h264" } else { "mp4" };
    let total = segments.len();
    let mut seq = 0u32;

    for (index, entry) in segments.into_iter().enumerate() {
        let seq_no = match opts.order {
            ExportOrder::Physical => {
                seq += 1;
                Some(seq)
            }
            ExportOrder::Time => None,
        };
        let name = segment_filename(&entry, ext, seq_no);
        let path = resolve_collision(dest, &name);
        on_event(ExportEvent::SegmentStarted {
            index,
            total,
            entry,
            path: path.clone(),
        });

        let block_end = entry
            .offset_datablock
            .saturating_add(master.size_data_block);
        let block = match image.slice(entry.offset_datablock, block_end) {
            Ok(block) => block,
            Err(err) => {
                summary.skipped += 1;
                on_event(ExportEvent::SegmentSkipped {
                    index,
                    entry,
                    reason: err.to_string(),
                });
                continue;
            }
        };

        let outcome = {
            let mut sink = match make_sink(&path) {
                Ok(sink) => sink,
                Err(err) => {
                    summary.skipped += 1;
                    on_event(ExportEvent::SegmentSkipped {
                        index,
                        entry,
                        reason: err.to_string(),
                    });
                    continue;
                }
            };
            carve_program_stream(block, &mut sink)
            // Sink dropped here, on every path out of the scope.
        };

        match outcome {
            CarveOutcome::Empty => summary.empty += 1,
            CarveOutcome::Done => summary.exported += 1,
            CarveOutcome::SinkClosed => summary.skipped += 1,
        }
        on_event(ExportEvent::SegmentFinished {
            index,
            entry,
            path,
            outcome,
        });
    }

    Ok(summary)
}
