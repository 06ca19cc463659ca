mod app;

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use log::{debug, info};

use siddec::bus::{self, BusMessage, BusReceiver};
use siddec::config::{SessionConfig, Setting};
use siddec::decoder::{
    BlockSink, DecodeSession, DecodeTask, EngineFactory, Format, SessionContext, UpstreamEvent,
    TIME_UNIT,
};
use siddec::engine::{Engine, ResidEngine};
use siddec::roms::RomSet;
use siddec::tune::TuneMetadata;

use app::output::RawFileSink;
use app::settings::HostSettings;

/// The byte source hands the decoder the file in chunks of this size.
const READ_CHUNK: usize = 4096;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "siddec-play", version, about = "Play a Commodore 64 SID tune")]
struct Args {
    /// PSID/RSID file to play.
    file: PathBuf,

    /// Sub-tune to play (0 = the tune's start song).
    #[arg(short = 't', long)]
    tune: Option<u16>,

    /// Decoder setting, e.g. `-s sid-model=mos8580`. Repeatable.
    #[arg(short = 's', long = "set", value_name = "KEY=VALUE")]
    settings: Vec<String>,

    /// Directory holding kernal/basic/chargen images.
    #[arg(long, value_name = "DIR")]
    rom_dir: Option<PathBuf>,

    /// Stop after this many seconds.
    #[arg(long, value_name = "SECS")]
    length: Option<f64>,

    /// Write raw s16 PCM here instead of playing it.
    #[arg(short = 'o', long, value_name = "FILE.raw")]
    output: Option<PathBuf>,

    /// Store the effective settings as the new defaults.
    #[arg(long)]
    save_defaults: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("siddec-play: {e:#}");
            ExitCode::from(1)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Setup
// ─────────────────────────────────────────────────────────────────────────────

/// Returns whether playback finished without a fatal error.
fn run(args: &Args) -> anyhow::Result<bool> {
    let mut host = HostSettings::load();
    let config = session_config(args, &host.session)?;
    if args.save_defaults {
        host.session = config.clone();
        let path = host.save()?;
        println!("Defaults saved to {}", path.display());
    }

    let roms = match args.rom_dir.as_ref().or(host.rom_dir.as_ref()) {
        Some(dir) => RomSet::load_from(dir),
        None => RomSet::discover(),
    };
    if roms.is_empty() {
        info!("no ROM images, RSID tunes run on built-in kernal vectors");
    }

    let (sink, device) = open_output(args.output.as_deref())?;

    let (bus_tx, bus_rx) = bus::channel();
    let ctx = SessionContext {
        max_image_size: host.max_image_size,
        ..SessionContext::new(bus_tx)
    };
    let factory: EngineFactory = Box::new(|| Box::new(ResidEngine::new()) as Box<dyn Engine>);
    let mut session = DecodeSession::new(sink, factory, ctx);
    session.set_config(config)?;
    session.set_roms(roms);

    let mut task = DecodeTask::new(session);
    if let Err(e) = feed(&mut task, &args.file) {
        // Session failures show up on the bus; anything else is ours.
        if e.downcast_ref::<siddec::SessionError>().is_none() {
            return Err(e);
        }
        debug!("feeding stopped: {e:#}");
    }

    let ok = monitor(&task, &bus_rx);
    task.terminate();
    finish_output(device, ok);
    Ok(ok)
}

fn session_config(args: &Args, defaults: &SessionConfig) -> anyhow::Result<SessionConfig> {
    let mut config = defaults.clone();
    for pair in &args.settings {
        config
            .apply(Setting::parse_pair(pair)?)
            .with_context(|| format!("-s {pair}"))?;
    }
    if let Some(tune) = args.tune {
        config.apply(Setting::Tune(tune))?;
    }
    if let Some(secs) = args.length {
        config.apply(Setting::parse("length", &secs.to_string())?)?;
    }
    Ok(config)
}

#[cfg(feature = "audio")]
type Device = Option<app::output::AudioOutput>;
#[cfg(not(feature = "audio"))]
type Device = Option<()>;

fn open_output(path: Option<&Path>) -> anyhow::Result<(Box<dyn BlockSink>, Device)> {
    if let Some(path) = path {
        let sink: Box<dyn BlockSink> = Box::new(
            RawFileSink::create(path).with_context(|| format!("cannot create {}", path.display()))?,
        );
        return Ok((sink, None));
    }

    #[cfg(feature = "audio")]
    {
        let device = app::output::AudioOutput::open().map_err(anyhow::Error::msg)?;
        info!("audio output at {} Hz", device.rate());
        let sink: Box<dyn BlockSink> = Box::new(device.sink());
        Ok((sink, Some(device)))
    }

    #[cfg(not(feature = "audio"))]
    {
        anyhow::bail!("built without audio output, use --output FILE.raw")
    }
}

/// Let queued audio play out before the device closes.
#[cfg(feature = "audio")]
fn finish_output(device: Device, ok: bool) {
    if let (Some(device), true) = (device, ok) {
        device.drain(Duration::from_secs(2));
    }
}

#[cfg(not(feature = "audio"))]
fn finish_output(_device: Device, _ok: bool) {}

/// Hand the file to the decoder in fixed-size chunks, then end the input.
fn feed(task: &mut DecodeTask, path: &Path) -> anyhow::Result<()> {
    let mut file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    task.handle_event(UpstreamEvent::StreamStart { group_id: None })?;
    task.handle_event(UpstreamEvent::Segment)?;

    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = file
            .read(&mut chunk)
            .with_context(|| format!("cannot read {}", path.display()))?;
        if n == 0 {
            break;
        }
        task.accept_input(&chunk[..n])?;
    }
    task.handle_event(UpstreamEvent::Eos)?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
//  Playback monitor
// ─────────────────────────────────────────────────────────────────────────────

/// Print bus messages and the position once per second until the stream
/// ends. Returns false if a fatal error was posted.
fn monitor(task: &DecodeTask, bus: &BusReceiver) -> bool {
    let mut ok = true;
    loop {
        match bus.recv_timeout(POLL_INTERVAL) {
            Ok(BusMessage::Error(e)) => {
                eprintln!("Error: {e}");
                ok = false;
            }
            Ok(BusMessage::Eos) => {
                println!("End of stream");
                break;
            }
            Ok(BusMessage::Tags(meta)) => print_tags(&meta),
            Ok(BusMessage::StreamStart { stream_id, group_id }) => {
                debug!("stream {stream_id} (group {group_id})");
            }
            Ok(BusMessage::StateChanged { from, to }) => {
                debug!("session {from:?} → {to:?}");
            }
            Err(RecvTimeoutError::Timeout) => print_position(task),
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if task.state().is_finished() && bus.is_empty() {
            break;
        }
    }
    ok
}

fn print_tags(meta: &TuneMetadata) {
    for (label, value) in [
        ("Title", &meta.title),
        ("Artist", &meta.artist),
        ("Copyright", &meta.copyright),
    ] {
        if let Some(v) = value {
            println!("{label:>9}: {v}");
        }
    }
}

fn print_position(task: &DecodeTask) {
    let Some(pos) = task.query_position(Format::Time) else {
        println!("Position: unknown");
        return;
    };
    match task.query_duration(Format::Time) {
        Some(dur) => println!("Position: {} / {}", clock(pos), clock(dur)),
        None => println!("Position: {}", clock(pos)),
    }
}

fn clock(ns: u64) -> String {
    let secs = ns / TIME_UNIT;
    format!("{}:{:02}", secs / 60, secs % 60)
}
