// Decode session: buffers a SID image, starts a fresh engine for it and
// turns the engine's output into position-stamped PCM blocks.
//
//   Accumulating ─finalize─▶ Negotiating ─▶ Playing ─short─▶ Draining ─▶ Ended
//                                  └──────────────▶ Failed

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::bus::{BusMessage, BusSender};
use crate::config::{SessionConfig, Setting, DEFAULT_BLOCK_SIZE};
use crate::decoder::convert::{AudioFormat, Format};
use crate::decoder::sink::{Block, BlockSink, Flow, StreamEvent, UpstreamEvent};
use crate::engine::{BuilderParams, Engine, EngineConfig, LiveSettings};
use crate::error::{Result, SessionError};
use crate::roms::RomSet;
use crate::tune::{image_digest, Tune, TuneMetadata};

/// Largest tune image accepted unless the context says otherwise.
pub const DEFAULT_MAX_IMAGE_SIZE: usize = 8 * DEFAULT_BLOCK_SIZE as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accumulating,
    Negotiating,
    Playing,
    /// The engine ran dry; the next block request ends the stream.
    Draining,
    Ended,
    Failed,
}

impl SessionState {
    pub fn is_finished(self) -> bool {
        matches!(self, SessionState::Ended | SessionState::Failed)
    }
}

/// Hands out stream group ids. Never returns 0.
#[derive(Debug)]
pub struct GroupIds(AtomicU32);

impl GroupIds {
    pub fn new() -> Self {
        Self(AtomicU32::new(1))
    }

    pub fn next(&self) -> u32 {
        loop {
            let id = self.0.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

impl Default for GroupIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Host-provided surroundings of a session.
pub struct SessionContext {
    pub bus: BusSender,
    pub group_ids: Arc<GroupIds>,
    pub max_image_size: usize,
}

impl SessionContext {
    pub fn new(bus: BusSender) -> Self {
        Self {
            bus,
            group_ids: Arc::new(GroupIds::new()),
            max_image_size: DEFAULT_MAX_IMAGE_SIZE,
        }
    }
}

/// Creates the engine for each play cycle.
pub type EngineFactory = Box<dyn FnMut() -> Box<dyn Engine> + Send>;

/// Outcome of a successful [`DecodeSession::produce_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Production {
    Continue,
    Finished,
}

pub struct DecodeSession {
    state: SessionState,
    config: SessionConfig,
    roms: RomSet,
    image: Vec<u8>,
    songs: u16,
    tune: Option<Tune>,
    metadata: Option<TuneMetadata>,
    engine: Option<Box<dyn Engine>>,
    factory: EngineFactory,
    sink: Box<dyn BlockSink>,
    ctx: SessionContext,
    format: Option<AudioFormat>,
    /// Engine configuration fixed at start; only its live part changes.
    latched: Option<EngineConfig>,
    /// Bytes produced since the stream started.
    position: u64,
    upstream_group: Option<u32>,
    /// Group id of a start that failed after allocating it.
    retained_group: Option<u32>,
}

impl DecodeSession {
    pub fn new(sink: Box<dyn BlockSink>, factory: EngineFactory, ctx: SessionContext) -> Self {
        Self {
            state: SessionState::Accumulating,
            config: SessionConfig::default(),
            roms: RomSet::default(),
            image: Vec::new(),
            songs: 0,
            tune: None,
            metadata: None,
            engine: None,
            factory,
            sink,
            ctx,
            format: None,
            latched: None,
            position: 0,
            upstream_group: None,
            retained_group: None,
        }
    }

    // --- input ---

    pub fn accept_input(&mut self, bytes: &[u8]) -> Result<()> {
        self.require(SessionState::Accumulating)?;
        let len = self.image.len() + bytes.len();
        let max = self.ctx.max_image_size;
        if len > max {
            return Err(self.fail(SessionError::Overflow { len, max }));
        }
        self.image.extend_from_slice(bytes);
        Ok(())
    }

    pub fn handle_event(&mut self, event: UpstreamEvent) -> Result<()> {
        match event {
            UpstreamEvent::Eos => self.finalize_input(),
            UpstreamEvent::StreamStart { group_id } => {
                if group_id.is_some() {
                    self.upstream_group = group_id;
                }
                Ok(())
            }
            UpstreamEvent::Segment | UpstreamEvent::Discontinuity => Ok(()),
        }
    }

    /// The image is complete: parse it, start an engine and negotiate.
    pub fn finalize_input(&mut self) -> Result<()> {
        self.require(SessionState::Accumulating)?;
        self.set_state(SessionState::Negotiating);
        debug!("finalizing {} byte image", self.image.len());
        self.start().map_err(|e| self.fail(e))
    }

    fn start(&mut self) -> Result<()> {
        let mut tune = Tune::parse(&self.image).map_err(SessionError::TuneSelection)?;
        self.songs = tune.songs();
        let song = tune
            .select_song(self.config.tune)
            .map_err(SessionError::TuneSelection)?;

        let mut engine = (self.factory)();
        engine.set_roms(&self.roms);
        engine.load(&tune).map_err(SessionError::Load)?;

        let group_id = match self.upstream_group.or(self.retained_group) {
            Some(id) => id,
            None => self.ctx.group_ids.next(),
        };
        self.retained_group = Some(group_id);

        let format = self.negotiate()?;
        let latched = EngineConfig::from_session(&self.config, format.rate, format.channels);
        engine.configure(&latched).map_err(SessionError::Builder)?;
        let params = BuilderParams {
            emulation: self.config.emulation,
            chips: engine.max_sids(),
            filter: self.config.filter,
            curve_6581: self.config.filter_curve_6581,
            curve_8580: self.config.filter_curve_8580,
            bias: self.config.filter_bias,
        };
        engine.build(&params).map_err(SessionError::Builder)?;

        info!(
            "playing song {song}/{} at {} Hz, {} channel(s)",
            self.songs, format.rate, format.channels
        );

        self.position = 0;
        let stream_id = image_digest(&self.image);
        self.sink.event(StreamEvent::StreamStart {
            stream_id: stream_id.clone(),
            group_id,
        });
        self.post(BusMessage::StreamStart {
            stream_id,
            group_id,
        });
        self.sink.event(StreamEvent::Caps(format));
        self.sink.event(StreamEvent::Segment);

        let metadata = tune.metadata();
        if !metadata.is_empty() {
            self.sink.event(StreamEvent::Tags(metadata.clone()));
            self.post(BusMessage::Tags(metadata.clone()));
        }

        self.metadata = Some(metadata);
        self.tune = Some(tune);
        self.engine = Some(engine);
        self.format = Some(format);
        self.latched = Some(latched);
        self.retained_group = None;
        self.set_state(SessionState::Playing);
        Ok(())
    }

    /// First consumer candidate that takes 16-bit samples wins.
    fn negotiate(&self) -> Result<AudioFormat> {
        let candidates = self.sink.accepted_formats();
        if candidates.is_empty() {
            return Err(SessionError::Negotiation("downstream accepts no formats".into()));
        }
        candidates
            .iter()
            .find_map(|c| c.fixate(self.config.rate, self.config.channels))
            .ok_or_else(|| SessionError::Negotiation("no 16-bit format accepted downstream".into()))
    }

    // --- output ---

    pub fn produce_block(&mut self) -> Result<Production> {
        match self.state {
            SessionState::Playing => self.render_block(),
            SessionState::Draining => {
                debug!("end of stream at byte {}", self.position);
                self.sink.event(StreamEvent::Eos);
                self.post(BusMessage::Eos);
                self.engine = None;
                self.set_state(SessionState::Ended);
                Ok(Production::Finished)
            }
            state => Err(SessionError::InvalidState(state)),
        }
    }

    fn render_block(&mut self) -> Result<Production> {
        let format = self
            .format
            .ok_or(SessionError::InvalidState(self.state))?;

        let mut samples = (self.config.block_size / 2).max(1) as usize;
        let mut limited = false;
        if let Some(limit) = self.length_bytes(&format) {
            let left = (limit.saturating_sub(self.position) / 2) as usize;
            if left <= samples {
                samples = left;
                limited = true;
            }
        }

        let mut buf = vec![0i16; samples];
        let written = match self.engine.as_mut() {
            Some(engine) if samples > 0 => engine.render(&mut buf),
            Some(_) => 0,
            None => return Err(SessionError::InvalidState(self.state)),
        };

        if written > 0 {
            buf.truncate(written);
            let block = self.stamp(Block::from_samples(&buf), &format);
            match self.sink.push(block) {
                Flow::Ok => {}
                Flow::NotLinked => return Err(self.rejected(false)),
                Flow::Fatal => return Err(self.rejected(true)),
            }
        }

        if written < samples || limited {
            debug!("short block ({written}/{samples} samples), draining");
            self.set_state(SessionState::Draining);
        }
        Ok(Production::Continue)
    }

    /// Stamp offsets and times before and after advancing the position.
    fn stamp(&mut self, mut block: Block, format: &AudioFormat) -> Block {
        let start = self.position;
        let end = start + block.data.len() as u64;
        block.offset = format.convert(Format::Bytes, start, Format::Default).ok();
        block.pts = format.convert(Format::Bytes, start, Format::Time).ok();
        self.position = end;
        block.offset_end = format.convert(Format::Bytes, end, Format::Default).ok();
        block.duration = format
            .convert(Format::Bytes, end, Format::Time)
            .ok()
            .zip(block.pts)
            .map(|(end, start)| end - start);
        block
    }

    /// Play-length limit in bytes, rounded down to whole samples.
    fn length_bytes(&self, format: &AudioFormat) -> Option<u64> {
        let length = self.config.play_length?;
        let ns = u64::try_from(length.as_nanos()).unwrap_or(u64::MAX);
        let bytes = format.convert(Format::Time, ns, Format::Bytes).ok()?;
        let bps = format.bytes_per_sample().max(1);
        Some(bytes - bytes % bps)
    }

    fn rejected(&mut self, fatal: bool) -> SessionError {
        let err = SessionError::ConsumerRejected { fatal };
        if fatal {
            error!("{err}");
            self.post(BusMessage::Error(err.clone()));
        } else {
            info!("downstream not linked, stopping");
        }
        self.sink.event(StreamEvent::Eos);
        self.engine = None;
        self.set_state(SessionState::Ended);
        err
    }

    // --- control ---

    /// Store one setting. Live settings reach a running engine at once;
    /// everything else waits for the next tune.
    pub fn configure(&mut self, setting: Setting) -> Result<()> {
        if self.state.is_finished() {
            return Err(SessionError::InvalidState(self.state));
        }
        self.config.apply(setting)?;
        if setting.is_latched() {
            if self.engine.is_some() {
                debug!("{setting:?} takes effect with the next tune");
            }
            return Ok(());
        }
        if let (Some(engine), Some(latched)) = (self.engine.as_mut(), self.latched.as_mut()) {
            let live = LiveSettings::from_session(&self.config);
            if live != latched.live {
                latched.live = live;
                if let Err(e) = engine.configure(latched) {
                    warn!("engine rejected live settings: {e}");
                }
            }
        }
        Ok(())
    }

    /// Replace the whole configuration before any input arrives.
    pub fn set_config(&mut self, config: SessionConfig) -> Result<()> {
        self.require(SessionState::Accumulating)?;
        self.config = config.validated()?;
        Ok(())
    }

    /// ROMs handed to the next engine.
    pub fn set_roms(&mut self, roms: RomSet) {
        self.roms = roms;
    }

    pub fn terminate(&mut self) {
        self.engine = None;
        self.tune = None;
        self.image = Vec::new();
        self.set_state(SessionState::Ended);
    }

    /// Start over with an empty image after the session ended or failed.
    /// Configuration, ROMs and a retained group id carry over.
    pub fn restart(&mut self) -> Result<()> {
        if !self.state.is_finished() {
            return Err(SessionError::InvalidState(self.state));
        }
        self.engine = None;
        self.tune = None;
        self.metadata = None;
        self.image.clear();
        self.songs = 0;
        self.format = None;
        self.latched = None;
        self.position = 0;
        self.upstream_group = None;
        self.set_state(SessionState::Accumulating);
        Ok(())
    }

    // --- queries ---

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Sub-tunes in the parsed image; 0 before parsing.
    pub fn tune_count(&self) -> u16 {
        self.songs
    }

    pub fn format(&self) -> Option<AudioFormat> {
        self.format
    }

    pub fn metadata(&self) -> Option<&TuneMetadata> {
        self.metadata.as_ref()
    }

    /// `None` when no format is negotiated or the unit is not convertible.
    pub fn query_position(&self, unit: Format) -> Option<u64> {
        let format = self.format?;
        format.convert(Format::Bytes, self.position, unit).ok()
    }

    /// Known only when a play length is configured.
    pub fn query_duration(&self, unit: Format) -> Option<u64> {
        let format = self.format?;
        let length = self.config.play_length?;
        let ns = u64::try_from(length.as_nanos()).unwrap_or(u64::MAX);
        format.convert(Format::Time, ns, unit).ok()
    }

    // --- internals ---

    fn require(&self, state: SessionState) -> Result<()> {
        if self.state != state {
            return Err(SessionError::InvalidState(self.state));
        }
        Ok(())
    }

    fn set_state(&mut self, to: SessionState) {
        let from = self.state;
        if from != to {
            debug!("{from:?} → {to:?}");
            self.state = to;
            self.post(BusMessage::StateChanged { from, to });
        }
    }

    fn post(&self, message: BusMessage) {
        // A host that stopped listening is not the session's problem.
        let _ = self.ctx.bus.send(message);
    }

    /// Terminal failure: post it once and end the stream downstream.
    fn fail(&mut self, err: SessionError) -> SessionError {
        error!("{err}");
        self.engine = None;
        self.set_state(SessionState::Failed);
        if err.is_fatal() {
            self.post(BusMessage::Error(err.clone()));
        }
        self.sink.event(StreamEvent::Eos);
        err
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::bus::{self, BusReceiver};
    use crate::config::{C64Model, SidModel};
    use crate::decoder::convert::TIME_UNIT;
    use crate::decoder::sink::FormatCandidate;
    use crate::tune::build_psid;

    #[derive(Default)]
    struct Probe {
        loads: Vec<u16>,
        configs: Vec<EngineConfig>,
        builds: Vec<BuilderParams>,
    }

    struct MockEngine {
        probe: Arc<Mutex<Probe>>,
        budget: usize,
        fail_build: bool,
    }

    impl Engine for MockEngine {
        fn set_roms(&mut self, _roms: &RomSet) {}

        fn load(&mut self, tune: &Tune) -> std::result::Result<(), String> {
            self.probe.lock().loads.push(tune.current_song());
            Ok(())
        }

        fn max_sids(&self) -> usize {
            3
        }

        fn configure(&mut self, config: &EngineConfig) -> std::result::Result<(), String> {
            self.probe.lock().configs.push(*config);
            Ok(())
        }

        fn build(&mut self, params: &BuilderParams) -> std::result::Result<(), String> {
            self.probe.lock().builds.push(*params);
            if self.fail_build {
                return Err("no chips".into());
            }
            Ok(())
        }

        fn render(&mut self, out: &mut [i16]) -> usize {
            let n = out.len().min(self.budget);
            out[..n].fill(7);
            self.budget -= n;
            n
        }
    }

    #[derive(Default)]
    struct Record {
        formats: Vec<FormatCandidate>,
        flow: Option<Flow>,
        events: Vec<StreamEvent>,
        blocks: Vec<Block>,
    }

    struct RecordingSink(Arc<Mutex<Record>>);

    impl BlockSink for RecordingSink {
        fn accepted_formats(&self) -> Vec<FormatCandidate> {
            self.0.lock().formats.clone()
        }

        fn push(&mut self, block: Block) -> Flow {
            let mut record = self.0.lock();
            record.blocks.push(block);
            record.flow.unwrap_or(Flow::Ok)
        }

        fn event(&mut self, event: StreamEvent) {
            self.0.lock().events.push(event);
        }
    }

    struct Fixture {
        session: DecodeSession,
        probe: Arc<Mutex<Probe>>,
        record: Arc<Mutex<Record>>,
        bus: BusReceiver,
    }

    fn fixture_with(budget: usize, fail_build: bool, max_image_size: usize) -> Fixture {
        let probe = Arc::new(Mutex::new(Probe::default()));
        let record = Arc::new(Mutex::new(Record {
            formats: vec![FormatCandidate::any_s16()],
            ..Record::default()
        }));
        let (tx, rx) = bus::channel();
        let factory_probe = probe.clone();
        let factory: EngineFactory = Box::new(move || {
            Box::new(MockEngine {
                probe: factory_probe.clone(),
                budget,
                fail_build,
            }) as Box<dyn Engine>
        });
        let ctx = SessionContext {
            max_image_size,
            ..SessionContext::new(tx)
        };
        let session = DecodeSession::new(Box::new(RecordingSink(record.clone())), factory, ctx);
        Fixture {
            session,
            probe,
            record,
            bus: rx,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(usize::MAX, false, DEFAULT_MAX_IMAGE_SIZE)
    }

    fn image() -> Vec<u8> {
        build_psid(0x1000, 0x1000, 0x1003, 3, &[0x60, 0xEA, 0xEA, 0x60])
    }

    fn errors(bus: &BusReceiver) -> Vec<SessionError> {
        bus.try_iter()
            .filter_map(|m| match m {
                BusMessage::Error(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    fn start(f: &mut Fixture) {
        f.session.accept_input(&image()).unwrap();
        f.session.handle_event(UpstreamEvent::Eos).unwrap();
        assert_eq!(f.session.state(), SessionState::Playing);
    }

    #[test]
    fn exact_bound_accepted_one_more_byte_overflows() {
        let img = image();
        let mut f = fixture_with(usize::MAX, false, img.len());
        f.session.accept_input(&img[..64]).unwrap();
        f.session.accept_input(&img[64..]).unwrap();
        let err = f.session.accept_input(&[0]).unwrap_err();
        assert_eq!(
            err,
            SessionError::Overflow {
                len: img.len() + 1,
                max: img.len()
            }
        );
        assert_eq!(f.session.state(), SessionState::Failed);
        assert_eq!(f.session.image, img);
        assert_eq!(errors(&f.bus), vec![err]);
    }

    #[test]
    fn no_candidates_fails_negotiation() {
        let mut f = fixture();
        f.record.lock().formats.clear();
        f.session.accept_input(&image()).unwrap();
        let err = f.session.finalize_input().unwrap_err();
        assert!(matches!(err, SessionError::Negotiation(_)));
        assert_eq!(f.session.state(), SessionState::Failed);
        assert_eq!(errors(&f.bus).len(), 1);
        assert_eq!(f.record.lock().events, vec![StreamEvent::Eos]);
        assert!(f.probe.lock().builds.is_empty());
    }

    #[test]
    fn only_wide_formats_fail_negotiation() {
        let mut f = fixture();
        f.record.lock().formats = vec![FormatCandidate {
            sample_width_bits: 32,
            ..FormatCandidate::any_s16()
        }];
        f.session.accept_input(&image()).unwrap();
        assert!(matches!(
            f.session.finalize_input(),
            Err(SessionError::Negotiation(_))
        ));
    }

    #[test]
    fn negotiation_clamps_into_first_acceptable_candidate() {
        let mut f = fixture();
        f.record.lock().formats = vec![
            FormatCandidate::s16(4..=8, 8_000..=48_000),
            FormatCandidate::s16(2..=2, 48_000..=48_000),
        ];
        start(&mut f);
        assert_eq!(f.session.format(), Some(AudioFormat::s16(2, 48_000)));
        let probe = f.probe.lock();
        assert_eq!(probe.configs[0].frequency, 48_000);
        assert_eq!(probe.configs[0].channels, 2);
        assert_eq!(probe.builds[0].chips, 3);
    }

    #[test]
    fn start_sends_stream_events_in_order() {
        let mut f = fixture();
        start(&mut f);
        let events = f.record.lock().events.clone();
        assert_eq!(
            events[0],
            StreamEvent::StreamStart {
                stream_id: image_digest(&image()),
                group_id: 1
            }
        );
        assert_eq!(events[1], StreamEvent::Caps(AudioFormat::s16(1, 44_100)));
        assert_eq!(events[2], StreamEvent::Segment);
        match &events[3] {
            StreamEvent::Tags(meta) => {
                assert_eq!(meta.title.as_deref(), Some("Title"));
                assert_eq!(meta.artist.as_deref(), Some("Author"));
                assert_eq!(meta.copyright, None);
            }
            other => panic!("expected tags, got {other:?}"),
        }
        assert_eq!(f.session.tune_count(), 3);
        let tags = f
            .bus
            .try_iter()
            .filter(|m| matches!(m, BusMessage::Tags(_)))
            .count();
        assert_eq!(tags, 1);
    }

    #[test]
    fn blocks_are_stamped_from_position() {
        let mut f = fixture();
        start(&mut f);
        f.session.produce_block().unwrap();
        f.session.produce_block().unwrap();

        let record = f.record.lock();
        let step = 2048 * TIME_UNIT / 44_100;
        let first = &record.blocks[0];
        assert_eq!(first.data.len(), 4096);
        assert_eq!(first.offset, Some(0));
        assert_eq!(first.offset_end, Some(2048));
        assert_eq!(first.pts, Some(0));
        assert_eq!(first.duration, Some(step));
        let second = &record.blocks[1];
        assert_eq!(second.offset, Some(2048));
        assert_eq!(second.pts, Some(step));
        assert_eq!(f.session.query_position(Format::Bytes), Some(8192));
        assert_eq!(f.session.query_position(Format::Default), Some(4096));
        assert_eq!(f.session.query_position(Format::Percent), None);
    }

    #[test]
    fn short_render_drains_then_ends() {
        let mut f = fixture_with(3000, false, DEFAULT_MAX_IMAGE_SIZE);
        start(&mut f);
        assert_eq!(f.session.produce_block(), Ok(Production::Continue));
        assert_eq!(f.session.state(), SessionState::Playing);
        assert_eq!(f.session.produce_block(), Ok(Production::Continue));
        assert_eq!(f.session.state(), SessionState::Draining);
        assert_eq!(f.record.lock().blocks[1].data.len(), 952 * 2);

        assert_eq!(f.session.produce_block(), Ok(Production::Finished));
        assert_eq!(f.session.state(), SessionState::Ended);
        assert_eq!(f.record.lock().events.last(), Some(&StreamEvent::Eos));
        assert!(f.bus.try_iter().any(|m| m == BusMessage::Eos));
        assert_eq!(
            f.session.produce_block(),
            Err(SessionError::InvalidState(SessionState::Ended))
        );
    }

    #[test]
    fn play_length_truncates_the_stream() {
        let mut f = fixture();
        f.session.configure(Setting::Rate(8_000)).unwrap();
        f.session
            .configure(Setting::PlayLength(Some(Duration::from_millis(400))))
            .unwrap();
        start(&mut f);
        assert_eq!(f.session.query_duration(Format::Time), Some(400_000_000));
        assert_eq!(f.session.query_duration(Format::Bytes), Some(6400));

        f.session.produce_block().unwrap();
        f.session.produce_block().unwrap();
        assert_eq!(f.session.state(), SessionState::Draining);
        assert_eq!(f.record.lock().blocks[1].data.len(), 6400 - 4096);
        assert_eq!(f.session.produce_block(), Ok(Production::Finished));
    }

    #[test]
    fn out_of_range_subtune_never_loads() {
        let mut f = fixture();
        f.session.configure(Setting::Tune(5)).unwrap();
        f.session.accept_input(&image()).unwrap();
        let err = f.session.finalize_input().unwrap_err();
        assert!(matches!(err, SessionError::TuneSelection(_)));
        assert!(f.probe.lock().loads.is_empty());
        assert_eq!(f.session.state(), SessionState::Failed);
    }

    #[test]
    fn garbage_image_fails_tune_selection() {
        let mut f = fixture();
        f.session.accept_input(b"not a sid file at all").unwrap();
        assert!(matches!(
            f.session.finalize_input(),
            Err(SessionError::TuneSelection(_))
        ));
        assert_eq!(f.session.tune_count(), 0);
    }

    #[test]
    fn builder_failure_is_fatal() {
        let mut f = fixture_with(usize::MAX, true, DEFAULT_MAX_IMAGE_SIZE);
        f.session.accept_input(&image()).unwrap();
        assert_eq!(
            f.session.finalize_input(),
            Err(SessionError::Builder("no chips".into()))
        );
        assert_eq!(errors(&f.bus).len(), 1);
    }

    #[test]
    fn subtune_change_while_playing_waits_for_next_cycle() {
        let mut f = fixture();
        start(&mut f);
        f.session.configure(Setting::Tune(2)).unwrap();
        f.session.produce_block().unwrap();
        assert_eq!(f.probe.lock().loads, vec![1]);

        f.session.terminate();
        f.session.restart().unwrap();
        start(&mut f);
        assert_eq!(f.probe.lock().loads, vec![1, 2]);
    }

    #[test]
    fn live_settings_reach_the_engine_latched_ones_do_not() {
        let mut f = fixture();
        start(&mut f);
        f.session.configure(Setting::Filter(false)).unwrap();
        f.session.configure(Setting::SidModel(SidModel::Mos8580)).unwrap();
        f.session.configure(Setting::C64Model(C64Model::Ntsc)).unwrap();

        let probe = f.probe.lock();
        assert_eq!(probe.configs.len(), 2);
        let last = probe.configs[1];
        assert!(!last.live.filter);
        assert_eq!(last.sid_model, SidModel::Mos6581);
        assert_eq!(last.c64_model, C64Model::Pal);
        assert_eq!(f.session.config().sid_model, SidModel::Mos8580);
    }

    #[test]
    fn rejected_setting_keeps_previous_value() {
        let mut f = fixture();
        assert!(matches!(
            f.session.configure(Setting::Rate(96_000)),
            Err(SessionError::Config(_))
        ));
        assert_eq!(f.session.config().rate, 44_100);
        assert_eq!(f.session.state(), SessionState::Accumulating);
    }

    #[test]
    fn not_linked_stops_quietly() {
        let mut f = fixture();
        f.record.lock().flow = Some(Flow::NotLinked);
        start(&mut f);
        assert_eq!(
            f.session.produce_block(),
            Err(SessionError::ConsumerRejected { fatal: false })
        );
        assert_eq!(f.session.state(), SessionState::Ended);
        assert!(errors(&f.bus).is_empty());
        assert_eq!(f.record.lock().events.last(), Some(&StreamEvent::Eos));
    }

    #[test]
    fn fatal_rejection_posts_one_error() {
        let mut f = fixture();
        f.record.lock().flow = Some(Flow::Fatal);
        start(&mut f);
        assert!(f.session.produce_block().is_err());
        assert_eq!(
            errors(&f.bus),
            vec![SessionError::ConsumerRejected { fatal: true }]
        );
        assert_eq!(f.session.state(), SessionState::Ended);
    }

    #[test]
    fn upstream_group_id_wins() {
        let mut f = fixture();
        f.session
            .handle_event(UpstreamEvent::StreamStart { group_id: Some(42) })
            .unwrap();
        start(&mut f);
        assert!(matches!(
            f.record.lock().events[0],
            StreamEvent::StreamStart { group_id: 42, .. }
        ));
    }

    #[test]
    fn group_id_survives_failed_negotiation_only() {
        let mut f = fixture();
        f.record.lock().formats.clear();
        f.session.accept_input(&image()).unwrap();
        assert!(f.session.finalize_input().is_err());

        f.record.lock().formats = vec![FormatCandidate::any_s16()];
        f.record.lock().events.clear();
        f.session.restart().unwrap();
        start(&mut f);
        assert!(matches!(
            f.record.lock().events[0],
            StreamEvent::StreamStart { group_id: 1, .. }
        ));

        f.record.lock().events.clear();
        f.session.terminate();
        f.session.restart().unwrap();
        start(&mut f);
        assert!(matches!(
            f.record.lock().events[0],
            StreamEvent::StreamStart { group_id: 2, .. }
        ));
    }

    #[test]
    fn operations_outside_their_states() {
        let mut f = fixture();
        assert_eq!(
            f.session.produce_block(),
            Err(SessionError::InvalidState(SessionState::Accumulating))
        );
        assert!(f.session.restart().is_err());
        start(&mut f);
        assert_eq!(
            f.session.accept_input(&[0]),
            Err(SessionError::InvalidState(SessionState::Playing))
        );
        assert_eq!(
            f.session.finalize_input(),
            Err(SessionError::InvalidState(SessionState::Playing))
        );
        assert!(errors(&f.bus).is_empty());
    }

    #[test]
    fn terminate_from_any_state() {
        let mut f = fixture();
        f.session.accept_input(&image()).unwrap();
        f.session.terminate();
        assert_eq!(f.session.state(), SessionState::Ended);
        assert!(f.session.image.is_empty());
        assert!(f.session.configure(Setting::Filter(false)).is_err());

        let mut g = fixture();
        start(&mut g);
        g.session.terminate();
        assert!(g.session.engine.is_none());
        assert_eq!(g.session.state(), SessionState::Ended);
    }
}
