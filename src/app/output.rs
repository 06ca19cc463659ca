// Host-side consumers of decoded blocks: the audio device (through a
// shared ring buffer drained by the cpal callback) and a raw PCM file.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use siddec::config::{MAX_RATE, MIN_RATE};
use siddec::decoder::{AudioFormat, Block, BlockSink, Flow, FormatCandidate, StreamEvent};

/// Max ring buffer capacity in stereo pairs.
const MAX_BUFFER_FRAMES: usize = 8192;

const FULL_BUFFER_WAIT: Duration = Duration::from_millis(5);

/// Shared audio ring buffer (sink pushes, cpal callback pops).
pub type AudioBuffer = Arc<Mutex<VecDeque<(i16, i16)>>>;

pub fn new_audio_buffer() -> AudioBuffer {
    Arc::new(Mutex::new(VecDeque::with_capacity(MAX_BUFFER_FRAMES)))
}

/// Interleaved s16 to stereo pairs. Mono is duplicated, extra channels
/// beyond the second are dropped.
pub fn to_frames(samples: impl Iterator<Item = i16>, channels: u32, out: &mut Vec<(i16, i16)>) {
    match channels {
        0 => {}
        1 => out.extend(samples.map(|s| (s, s))),
        n => {
            let mut it = samples;
            loop {
                let (Some(l), Some(r)) = (it.next(), it.next()) else {
                    break;
                };
                out.push((l, r));
                for _ in 2..n {
                    it.next();
                }
            }
        }
    }
}

/// Streaming linear interpolation between two fixed rates.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    step: f64,
    pos: f64,
    prev: (i16, i16),
}

impl LinearResampler {
    pub fn new(from: u32, to: u32) -> Self {
        Self {
            step: f64::from(from) / f64::from(to.max(1)),
            pos: 0.0,
            prev: (0, 0),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.step == 1.0
    }

    pub fn process(&mut self, input: &[(i16, i16)], out: &mut Vec<(i16, i16)>) {
        if self.is_identity() {
            out.extend_from_slice(input);
            return;
        }
        let lerp = |a: i16, b: i16, t: f64| (f64::from(a) + (f64::from(b) - f64::from(a)) * t) as i16;
        for &cur in input {
            while self.pos < 1.0 {
                out.push((
                    lerp(self.prev.0, cur.0, self.pos),
                    lerp(self.prev.1, cur.1, self.pos),
                ));
                self.pos += self.step;
            }
            self.pos -= 1.0;
            self.prev = cur;
        }
    }
}

/// Feeds the ring buffer at the device rate, waiting while it is full.
pub struct PlaybackSink {
    ring: AudioBuffer,
    device_rate: u32,
    shutdown: Arc<AtomicBool>,
    format: Option<AudioFormat>,
    resampler: Option<LinearResampler>,
    /// Samples of a frame split across two blocks.
    partial: Vec<i16>,
    interleaved: Vec<i16>,
    frames: Vec<(i16, i16)>,
    resampled: Vec<(i16, i16)>,
}

impl PlaybackSink {
    pub fn new(ring: AudioBuffer, device_rate: u32, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            ring,
            device_rate,
            shutdown,
            format: None,
            resampler: None,
            partial: Vec::new(),
            interleaved: Vec::new(),
            frames: Vec::new(),
            resampled: Vec::new(),
        }
    }

    fn enqueue(&mut self) -> Flow {
        let mut pending = &self.resampled[..];
        while !pending.is_empty() {
            if self.shutdown.load(Ordering::Relaxed) {
                return Flow::NotLinked;
            }
            let taken = {
                let mut ring = self.ring.lock();
                let room = MAX_BUFFER_FRAMES.saturating_sub(ring.len());
                let n = room.min(pending.len());
                ring.extend(&pending[..n]);
                n
            };
            pending = &pending[taken..];
            if !pending.is_empty() {
                thread::sleep(FULL_BUFFER_WAIT);
            }
        }
        Flow::Ok
    }
}

impl BlockSink for PlaybackSink {
    fn accepted_formats(&self) -> Vec<FormatCandidate> {
        if (MIN_RATE..=MAX_RATE).contains(&self.device_rate) {
            vec![FormatCandidate::s16(1..=2, self.device_rate..=self.device_rate)]
        } else {
            vec![FormatCandidate::any_s16()]
        }
    }

    fn push(&mut self, block: Block) -> Flow {
        let Some(format) = self.format else {
            error!("block before caps");
            return Flow::Fatal;
        };
        let channels = format.channels.max(1) as usize;
        self.interleaved.clear();
        self.interleaved.append(&mut self.partial);
        self.interleaved.extend(block.samples());
        let whole = self.interleaved.len() - self.interleaved.len() % channels;
        self.partial.extend_from_slice(&self.interleaved[whole..]);

        self.frames.clear();
        to_frames(
            self.interleaved[..whole].iter().copied(),
            format.channels,
            &mut self.frames,
        );
        self.resampled.clear();
        match self.resampler.as_mut() {
            Some(r) => r.process(&self.frames, &mut self.resampled),
            None => self.resampled.extend_from_slice(&self.frames),
        }
        self.enqueue()
    }

    fn event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Caps(format) => {
                if format.rate != self.device_rate {
                    info!("resampling {} Hz → {} Hz", format.rate, self.device_rate);
                    self.resampler = Some(LinearResampler::new(format.rate, self.device_rate));
                } else {
                    self.resampler = None;
                }
                self.format = Some(format);
                self.partial.clear();
            }
            StreamEvent::Eos => debug!("playback sink: end of stream"),
            other => debug!("playback sink: {other:?}"),
        }
    }
}

/// Writes the decoded stream as headerless s16 native-endian PCM.
pub struct RawFileSink {
    out: BufWriter<File>,
    path: PathBuf,
}

impl RawFileSink {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            out: BufWriter::new(File::create(path)?),
            path: path.to_path_buf(),
        })
    }
}

impl BlockSink for RawFileSink {
    fn accepted_formats(&self) -> Vec<FormatCandidate> {
        vec![FormatCandidate::any_s16()]
    }

    fn push(&mut self, block: Block) -> Flow {
        match self.out.write_all(&block.data) {
            Ok(()) => Flow::Ok,
            Err(e) => {
                error!("{}: {e}", self.path.display());
                Flow::Fatal
            }
        }
    }

    fn event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Caps(f) => info!(
                "writing s16 {} Hz, {} channel(s) to {}",
                f.rate,
                f.channels,
                self.path.display()
            ),
            StreamEvent::Eos => {
                if let Err(e) = self.out.flush() {
                    warn!("{}: {e}", self.path.display());
                }
            }
            _ => {}
        }
    }
}

#[cfg(feature = "audio")]
pub use device::AudioOutput;

#[cfg(feature = "audio")]
mod device {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use log::{error, info};

    use super::{new_audio_buffer, AudioBuffer, PlaybackSink};

    /// The default output device, owned by a parked thread that keeps the
    /// cpal stream alive.
    pub struct AudioOutput {
        ring: AudioBuffer,
        shutdown: Arc<AtomicBool>,
        rate: u32,
        thread: Option<JoinHandle<()>>,
    }

    impl AudioOutput {
        pub fn open() -> Result<Self, String> {
            let ring = new_audio_buffer();
            let shutdown = Arc::new(AtomicBool::new(false));
            let (thread, rate) = spawn_audio_thread(ring.clone(), shutdown.clone())?;
            Ok(Self {
                ring,
                shutdown,
                rate,
                thread: Some(thread),
            })
        }

        pub fn rate(&self) -> u32 {
            self.rate
        }

        pub fn sink(&self) -> PlaybackSink {
            PlaybackSink::new(self.ring.clone(), self.rate, self.shutdown.clone())
        }

        /// Wait for queued audio to play out.
        pub fn drain(&self, timeout: Duration) {
            let deadline = Instant::now() + timeout;
            while !self.ring.lock().is_empty() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(20));
            }
        }
    }

    impl Drop for AudioOutput {
        fn drop(&mut self) {
            self.shutdown.store(true, Ordering::Relaxed);
            if let Some(thread) = self.thread.take() {
                thread.thread().unpark();
                let _ = thread.join();
            }
        }
    }

    /// Spawn a thread that owns the cpal stream. Returns the device's
    /// actual sample rate on success.
    fn spawn_audio_thread(
        ring: AudioBuffer,
        shutdown: Arc<AtomicBool>,
    ) -> Result<(JoinHandle<()>, u32), String> {
        let (result_tx, result_rx) = crossbeam_channel::bounded::<Result<u32, String>>(1);

        let handle = thread::Builder::new()
            .name("siddec-audio".into())
            .spawn(move || {
                let result = (|| -> Result<(cpal::Stream, u32), String> {
                    let host = cpal::default_host();
                    let device = host
                        .default_output_device()
                        .ok_or_else(|| "No audio output device found".to_string())?;

                    let dev_name = device.name().unwrap_or_else(|_| "unknown".into());
                    let default_config = device
                        .default_output_config()
                        .map_err(|e| format!("No default output config: {e}"))?;
                    let rate = default_config.sample_rate().0;
                    info!("audio device '{dev_name}', native rate {rate} Hz");

                    let config = cpal::StreamConfig {
                        channels: 2,
                        sample_rate: cpal::SampleRate(rate),
                        buffer_size: cpal::BufferSize::Default,
                    };

                    let buf = ring;
                    let stream = device
                        .build_output_stream(
                            &config,
                            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                                let mut ring = buf.lock();
                                for frame in data.chunks_exact_mut(2) {
                                    // Underrun plays silence.
                                    let (l, r) = ring.pop_front().unwrap_or((0, 0));
                                    frame[0] = f32::from(l) / 32768.0;
                                    frame[1] = f32::from(r) / 32768.0;
                                }
                            },
                            move |err| error!("audio stream error: {err}"),
                            None,
                        )
                        .map_err(|e| format!("build_output_stream failed: {e}"))?;

                    stream
                        .play()
                        .map_err(|e| format!("stream.play() failed: {e}"))?;
                    Ok((stream, rate))
                })();

                match result {
                    Ok((stream, rate)) => {
                        let _ = result_tx.send(Ok(rate));
                        while !shutdown.load(Ordering::Relaxed) {
                            thread::park_timeout(Duration::from_millis(100));
                        }
                        drop(stream);
                        info!("audio thread exiting");
                    }
                    Err(e) => {
                        let _ = result_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| format!("spawn audio thread: {e}"))?;

        let rate = result_rx
            .recv()
            .map_err(|_| "Audio thread died before reporting status".to_string())??;
        Ok((handle, rate))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn mono_is_duplicated_stereo_passes_through() {
        let mut out = Vec::new();
        to_frames([1, 2].into_iter(), 1, &mut out);
        assert_eq!(out, vec![(1, 1), (2, 2)]);

        out.clear();
        to_frames([1, 2, 3, 4, 5].into_iter(), 2, &mut out);
        assert_eq!(out, vec![(1, 2), (3, 4)]);
    }

    #[test]
    fn resampler_doubles_and_halves() {
        let input = vec![(0, 0), (100, 100), (100, 100), (100, 100)];

        let mut up = LinearResampler::new(22_050, 44_100);
        let mut out = Vec::new();
        up.process(&input, &mut out);
        assert_eq!(out.len(), 8);
        assert!(out.contains(&(50, 50)));

        let mut down = LinearResampler::new(44_100, 22_050);
        out.clear();
        down.process(&input, &mut out);
        assert_eq!(out.len(), 2);

        let mut same = LinearResampler::new(48_000, 48_000);
        assert!(same.is_identity());
        out.clear();
        same.process(&input, &mut out);
        assert_eq!(out, input);
    }

    #[test]
    fn playback_sink_fills_ring_at_device_rate() {
        let ring = new_audio_buffer();
        let mut sink = PlaybackSink::new(ring.clone(), 44_100, Arc::new(AtomicBool::new(false)));
        assert_eq!(
            sink.accepted_formats()[0].fixate(22_050, 1),
            Some(AudioFormat::s16(1, 44_100))
        );
        sink.event(StreamEvent::Caps(AudioFormat::s16(1, 44_100)));
        assert_eq!(sink.push(Block::from_samples(&[7; 100])), Flow::Ok);
        assert_eq!(ring.lock().len(), 100);
        assert_eq!(ring.lock().front(), Some(&(7, 7)));
    }

    #[test]
    fn stereo_frames_span_block_boundaries() {
        let ring = new_audio_buffer();
        let mut sink = PlaybackSink::new(ring.clone(), 44_100, Arc::new(AtomicBool::new(false)));
        sink.event(StreamEvent::Caps(AudioFormat::s16(2, 44_100)));
        assert_eq!(sink.push(Block::from_samples(&[100, -100, 101])), Flow::Ok);
        assert_eq!(sink.push(Block::from_samples(&[-101, 102, -102])), Flow::Ok);
        let frames: Vec<_> = ring.lock().iter().copied().collect();
        assert_eq!(frames, vec![(100, -100), (101, -101), (102, -102)]);
    }

    #[test]
    fn new_caps_drop_a_dangling_half_frame() {
        let ring = new_audio_buffer();
        let mut sink = PlaybackSink::new(ring.clone(), 44_100, Arc::new(AtomicBool::new(false)));
        sink.event(StreamEvent::Caps(AudioFormat::s16(2, 44_100)));
        assert_eq!(sink.push(Block::from_samples(&[1, 2, 3])), Flow::Ok);
        sink.event(StreamEvent::Caps(AudioFormat::s16(2, 44_100)));
        assert_eq!(sink.push(Block::from_samples(&[4, 5])), Flow::Ok);
        let frames: Vec<_> = ring.lock().iter().copied().collect();
        assert_eq!(frames, vec![(1, 2), (4, 5)]);
    }

    #[test]
    fn playback_sink_stops_when_shut_down() {
        let ring = new_audio_buffer();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut sink = PlaybackSink::new(ring, 44_100, shutdown.clone());
        assert_eq!(sink.push(Block::from_samples(&[0; 4])), Flow::Fatal);

        sink.event(StreamEvent::Caps(AudioFormat::s16(2, 44_100)));
        shutdown.store(true, Ordering::Relaxed);
        assert_eq!(sink.push(Block::from_samples(&[0; 4])), Flow::NotLinked);
    }

    #[test]
    fn raw_file_sink_writes_block_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.raw");
        let mut sink = RawFileSink::create(&path).unwrap();
        let block = Block::from_samples(&[1, -2, 3]);
        let expected = block.data.clone();
        assert_eq!(sink.push(block), Flow::Ok);
        sink.event(StreamEvent::Eos);
        assert_eq!(fs::read(&path).unwrap(), expected);
    }
}
