use clap::Parser;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitCode, Stdio};

use chrono::{DateTime, Utc};
use env_logger::Env;

use hikcarve::{
    export_all, order_segments, read_catalog, CarveOutcome, Error, ExportEvent, ExportOptions,
    ExportOrder, Image, SegmentEntry,
};

#[derive(Parser, Debug)]
#[command(name = "hikcarve")]
#[command(about = "Recover video footage from a Hikvision DVR disk image", long_about = None)]
struct Cli {
    /// Raw image file from the DVR HD
    #[arg(short = 'i', long = "input", value_name = "PATH")]
    input: PathBuf,

    /// Output directory
    #[arg(short = 'o', long = "output", value_name = "DIR")]
    output: Option<PathBuf>,

    /// List footage that can be exported
    #[arg(short = 'l', long = "list")]
    list: bool,

    /// Parse only the master block
    #[arg(short = 'm', long = "master-only")]
    master_only: bool,

    /// Export footage as a raw h264 stream (do not remux into mp4)
    #[arg(short = 'r', long = "raw-h264")]
    raw: bool,

    /// Only export this channel (e.g. 6)
    #[arg(short = 'c', long = "channel", value_name = "N")]
    channel: Option<u8>,

    /// Ignore timestamps; walk blocks by physical offset (newest first)
    #[arg(long = "physical-order")]
    physical: bool,

    /// Print the footage list as JSON instead of text
    #[arg(long, requires = "list")]
    json: bool,
}

/// One catalog row for `--list --json` output.
#[derive(Debug, Serialize)]
struct ListRow {
    channel: u8,
    recording: bool,
    start: Option<String>,
    end: Option<String>,
    offset_datablock: u64,
}

impl From<SegmentEntry> for ListRow {
    fn from(entry: SegmentEntry) -> Self {
        ListRow {
            channel: entry.channel,
            recording: entry.recording,
            start: entry.start.map(|t| t.to_rfc3339()),
            end: entry.end.map(|t| t.to_rfc3339()),
            offset_datablock: entry.offset_datablock,
        }
    }
}

/// Pipe sink into an external ffmpeg remux, matching the device streams'
/// quirks: copy the video, pass only VCL/IDR unit types, force 4:3.
struct RemuxSink {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl RemuxSink {
    fn spawn(output: &Path) -> io::Result<Self> {
        let mut child = Command::new("ffmpeg")
            .args([
                "-err_detect",
                "ignore_err",
                "-i",
                "-",
                "-c:v",
                "copy",
                "-bsf:v",
                "filter_units=pass_types=1-5",
                "-aspect",
                "4/3",
                "-loglevel",
                "error",
                "-stats",
            ])
            .arg(output)
            .stdin(Stdio::piped())
            .spawn()?;
        let stdin = child.stdin.take();
        Ok(RemuxSink { child, stdin })
    }
}

impl Write for RemuxSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.stdin {
            Some(stdin) => stdin.write(buf),
            None => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.stdin {
            Some(stdin) => stdin.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for RemuxSink {
    fn drop(&mut self) {
        // Closing stdin signals EOF so ffmpeg finalizes the container;
        // waiting reaps the child on every exit path.
        drop(self.stdin.take());
        let _ = self.child.wait();
    }
}

/// Per-segment sink: a buffered file for raw output, or an ffmpeg pipe.
enum Sink {
    Raw(BufWriter<File>),
    Remux(RemuxSink),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Raw(file) => file.write(buf),
            Sink::Remux(remux) => remux.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Raw(file) => file.flush(),
            Sink::Remux(remux) => remux.flush(),
        }
    }
}

fn ffmpeg_available() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

fn fmt_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M").to_string()
}

fn print_event(event: ExportEvent, physical: bool) {
    match event {
        ExportEvent::MasterParsed(master) => {
            println!("HD Signature: {}", master.signature_string());
            println!("Filesystem version: {}", master.version_string());
            println!("HD Capacity: {} bytes", master.capacity);
            println!("Data block size: {} bytes", master.size_data_block);
            println!(
                "Time System Init: {}",
                master.time_system_init.format("%Y-%m-%d %H:%M")
            );
            println!();
        }
        ExportEvent::Warning(warning) => log::warn!("{warning}"),
        ExportEvent::ChannelCounts(counts) => {
            for (channel, count) in counts {
                println!("Channel {channel:02}: {count} video blocks");
            }
        }
        ExportEvent::SegmentListed(entry) => match (entry.start, entry.end) {
            (Some(start), Some(end)) => println!(
                "Channel {:02}, from {} to {}",
                entry.channel,
                fmt_time(start),
                fmt_time(end)
            ),
            _ => println!("Channel {:02}, block being recorded.", entry.channel),
        },
        ExportEvent::SegmentStarted { entry, path, .. } => {
            println!();
            if entry.recording {
                println!(
                    "Exporting footage for channel {:02}, block being recorded.",
                    entry.channel
                );
            } else if physical {
                println!(
                    "Exporting channel {:02} -> {}",
                    entry.channel,
                    path.display()
                );
            } else if let (Some(start), Some(end)) = (entry.start, entry.end) {
                println!(
                    "Exporting footage for channel {:02}, from {} to {}",
                    entry.channel,
                    fmt_time(start),
                    fmt_time(end)
                );
            }
        }
        ExportEvent::SegmentFinished {
            outcome: CarveOutcome::Empty,
            path,
            ..
        } => println!("  block has no program stream; {} is empty", path.display()),
        ExportEvent::SegmentFinished { .. } => {}
        ExportEvent::SegmentSkipped { entry, reason, .. } => {
            log::warn!("skipping channel {:02} segment: {reason}", entry.channel);
        }
    }
}

fn run_json_list(image: &Image, cli: &Cli, order: ExportOrder) -> Result<(), Error> {
    let catalog = read_catalog(image)?;
    for warning in &catalog.warnings {
        log::warn!("{warning}");
    }

    let mut segments = catalog.segments;
    if let Some(channel) = cli.channel {
        segments.retain(|entry| entry.channel == channel);
    }
    order_segments(&mut segments, order);

    let rows: Vec<ListRow> = segments.into_iter().map(ListRow::from).collect();
    let json = serde_json::to_string_pretty(&rows).expect("catalog rows serialize");
    println!("{json}");
    Ok(())
}

fn run(cli: Cli) -> Result<(), Error> {
    let image = Image::open(&cli.input)?;
    let order = if cli.physical {
        ExportOrder::Physical
    } else {
        ExportOrder::Time
    };

    if cli.json {
        return run_json_list(&image, &cli, order);
    }

    let exporting = !cli.list && !cli.master_only;
    let mut raw = cli.raw;
    let dest = match &cli.output {
        Some(dir) if exporting => {
            if !dir.is_dir() {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::NotADirectory,
                    format!("{} is not a directory", dir.display()),
                )));
            }
            Some(dir.as_path())
        }
        Some(dir) => Some(dir.as_path()),
        None if exporting => return Err(Error::NoDestination),
        None => None,
    };

    if exporting && !raw && !ffmpeg_available() {
        println!("FFmpeg not found or not working. Exporting as raw H.264 instead.");
        raw = true;
    }

    let opts = ExportOptions {
        list_only: cli.list,
        master_only: cli.master_only,
        channel: cli.channel,
        order,
        raw_stream: raw,
    };

    let make_sink = |path: &Path| -> io::Result<Sink> {
        if raw {
            File::create(path).map(|file| Sink::Raw(BufWriter::new(file)))
        } else {
            RemuxSink::spawn(path).map(Sink::Remux)
        }
    };

    export_all(&image, &opts, dest, make_sink, |event| {
        print_event(event, cli.physical)
    })?;
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
