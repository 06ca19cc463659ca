// Downstream side of a decode session: what a consumer accepts, what it
// receives, and how it answers.

use std::ops::RangeInclusive;

use crate::config::{MAX_RATE, MIN_RATE};
use crate::decoder::convert::AudioFormat;
use crate::tune::TuneMetadata;

/// One raw-audio layout a consumer can take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatCandidate {
    pub sample_width_bits: u32,
    pub channels: RangeInclusive<u32>,
    pub rate: RangeInclusive<u32>,
}

impl FormatCandidate {
    /// Signed 16-bit candidate.
    pub fn s16(channels: RangeInclusive<u32>, rate: RangeInclusive<u32>) -> Self {
        Self {
            sample_width_bits: 16,
            channels,
            rate,
        }
    }

    /// Anything the decoder can produce.
    pub fn any_s16() -> Self {
        Self::s16(1..=2, MIN_RATE..=MAX_RATE)
    }

    /// Clamp the preferred rate and channel count into this candidate,
    /// after narrowing it to what the decoder can produce. `None` when the
    /// candidate is not 16-bit or the ranges do not overlap.
    pub fn fixate(&self, rate: u32, channels: u32) -> Option<AudioFormat> {
        if self.sample_width_bits != 16 {
            return None;
        }
        let (ch_lo, ch_hi) = intersect(&self.channels, 1, 2)?;
        let (rate_lo, rate_hi) = intersect(&self.rate, MIN_RATE, MAX_RATE)?;
        Some(AudioFormat::s16(
            channels.clamp(ch_lo, ch_hi),
            rate.clamp(rate_lo, rate_hi),
        ))
    }
}

fn intersect(range: &RangeInclusive<u32>, lo: u32, hi: u32) -> Option<(u32, u32)> {
    let lo = (*range.start()).max(lo);
    let hi = (*range.end()).min(hi);
    (lo <= hi).then_some((lo, hi))
}

/// A chunk of interleaved native-endian s16 PCM with its stream position.
/// Fields whose conversion is unsupported stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    pub data: Vec<u8>,
    /// First sample (per channel) of the block.
    pub offset: Option<u64>,
    pub offset_end: Option<u64>,
    /// Start time in nanoseconds.
    pub pts: Option<u64>,
    pub duration: Option<u64>,
}

impl Block {
    pub fn from_samples(samples: &[i16]) -> Self {
        Self {
            data: samples.iter().flat_map(|s| s.to_ne_bytes()).collect(),
            ..Self::default()
        }
    }

    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.data
            .chunks_exact(2)
            .map(|b| i16::from_ne_bytes([b[0], b[1]]))
    }
}

/// Consumer verdict on a pushed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Ok,
    /// Nobody is listening any more. Stops production quietly.
    NotLinked,
    /// The consumer broke. Stops production with an error.
    Fatal,
}

/// Out-of-band events sent downstream alongside the blocks.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    StreamStart { stream_id: String, group_id: u32 },
    Caps(AudioFormat),
    /// Time segment starting at zero.
    Segment,
    Tags(TuneMetadata),
    Eos,
}

/// Events arriving from the byte source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamEvent {
    StreamStart { group_id: Option<u32> },
    Segment,
    Discontinuity,
    /// End of input: the image is complete.
    Eos,
}

/// The consumer a session produces into.
pub trait BlockSink: Send {
    /// Formats the consumer takes, in order of preference.
    fn accepted_formats(&self) -> Vec<FormatCandidate>;

    fn push(&mut self, block: Block) -> Flow;

    fn event(&mut self, event: StreamEvent);
}
