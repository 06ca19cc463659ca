// Byte / sample / time conversions for the negotiated output format.
//
// Positions are only ever tracked in bytes; everything else is derived on
// demand from the format's sample width, channel count and rate.

use crate::error::ConversionUnsupported;

/// Nanoseconds per second.
pub const TIME_UNIT: u64 = 1_000_000_000;

/// Units a position or duration can be expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Bytes,
    /// Samples per channel ("default" unit of a raw audio stream).
    Default,
    /// Nanoseconds.
    Time,
    /// Not convertible from anything; queries in it report "unknown".
    Percent,
}

/// Negotiated raw audio format: signed, native-endian, interleaved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_width_bits: u32,
    pub channels: u32,
    pub rate: u32,
}

impl AudioFormat {
    pub fn s16(channels: u32, rate: u32) -> Self {
        Self {
            sample_width_bits: 16,
            channels,
            rate,
        }
    }

    pub fn bytes_per_sample(&self) -> u64 {
        u64::from(self.sample_width_bits / 8) * u64::from(self.channels)
    }

    pub fn byte_rate(&self) -> u64 {
        self.bytes_per_sample() * u64::from(self.rate)
    }

    /// Convert `value` from `src` units to `dest` units.
    pub fn convert(&self, src: Format, value: u64, dest: Format) -> Result<u64, ConversionUnsupported> {
        let unsupported = ConversionUnsupported { from: src, to: dest };
        if src == dest {
            return Ok(value);
        }

        let bps = self.bytes_per_sample();
        let rate = u64::from(self.rate);

        match (src, dest) {
            (Format::Bytes, Format::Default) => {
                if bps == 0 {
                    return Err(unsupported);
                }
                Ok(value / bps)
            }
            (Format::Bytes, Format::Time) => {
                let byterate = self.byte_rate();
                if byterate == 0 {
                    return Err(unsupported);
                }
                Ok(scale(value, TIME_UNIT, byterate))
            }
            (Format::Default, Format::Bytes) => Ok(value.saturating_mul(bps)),
            (Format::Default, Format::Time) => {
                if rate == 0 {
                    return Err(unsupported);
                }
                Ok(scale(value, TIME_UNIT, rate))
            }
            (Format::Time, Format::Bytes) => Ok(scale(value, bps * rate, TIME_UNIT)),
            (Format::Time, Format::Default) => Ok(scale(value, rate, TIME_UNIT)),
            _ => Err(unsupported),
        }
    }
}

/// `value * num / denom` without intermediate overflow, saturating at
/// `u64::MAX`. `denom` must be non-zero.
pub fn scale(value: u64, num: u64, denom: u64) -> u64 {
    let wide = u128::from(value) * u128::from(num) / u128::from(denom);
    u64::try_from(wide).unwrap_or(u64::MAX)
}
