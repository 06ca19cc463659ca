// resid-rs chips fed with the cycle-stamped register writes of one frame,
// each followed by the C64 board's RC output stage, then mixed down.
//
//   SID out → 1kΩ → ─┬─ 1000pF → GND         (LP, ~15.9 kHz)
//                     └─ 10kΩ  → C 10μF → amp  (HP, ~1.59 Hz)

use std::collections::VecDeque;

use log::warn;
use resid::{ChipModel, Sid};

use super::memory::SidWrite;
use super::LiveSettings;
use crate::config::{SamplingMethod, SidModel};

const SCRATCH_SIZE: usize = 2048;

/// Input level the digi boost feeds into an 8580 so $D418 volume writes
/// become audible again.
const DIGI_BOOST_INPUT: i32 = -32768;

/// Fixed-point model of the board filter, one multiply-shift per stage.
#[derive(Debug, Default)]
pub struct ExternalFilter {
    vlp: i32,
    vhp: i32,
    w0lp_1_s7: i32,
    w0hp_1_s17: i32,
}

impl ExternalFilter {
    pub fn new(clock: u32) -> Self {
        let dt = 1.0 / f64::from(clock);
        // LP: 10 kΩ · 1000 pF, HP: 10 kΩ · 10 µF
        let rc_lp = 10_000.0 * 1_000e-12;
        let rc_hp = 10_000.0 * 10e-6;
        Self {
            vlp: 0,
            vhp: 0,
            w0lp_1_s7: (dt / (dt + rc_lp) * 128.0 + 0.5) as i32,
            w0hp_1_s17: (dt / (dt + rc_hp) * 131_072.0 + 0.5) as i32,
        }
    }

    #[inline]
    pub fn clock(&mut self, input: i16) -> i16 {
        let vi = i32::from(input) << 11;
        self.vlp += (self.w0lp_1_s7 * (vi - self.vlp)) >> 7;
        self.vhp += (self.w0hp_1_s17 * (self.vlp - self.vhp)) >> 17;
        ((self.vlp - self.vhp) >> 11).clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
    }
}

/// `resid::Sid` holds an `Rc` internally; each instance is only ever
/// touched by the thread that currently owns the engine.
struct SendSid(Sid);
unsafe impl Send for SendSid {}

struct Chip {
    sid: SendSid,
    board: ExternalFilter,
    out: Vec<i16>,
}

impl Chip {
    /// Clock by `delta` cycles, appending the samples produced.
    fn clock(&mut self, delta: u32) {
        let mut scratch = [0i16; SCRATCH_SIZE];
        let mut remaining = delta;
        while remaining > 0 {
            let (n, next) = self.sid.0.sample(remaining, &mut scratch, 1);
            self.out
                .extend(scratch[..n].iter().map(|&s| self.board.clock(s)));
            if n == 0 && next >= remaining {
                // No progress: let the chip catch up without output.
                self.sid.0.clock_delta(remaining);
                break;
            }
            remaining = next;
        }
    }
}

fn resid_model(model: SidModel) -> ChipModel {
    match model {
        SidModel::Mos6581 => ChipModel::Mos6581,
        SidModel::Mos8580 => ChipModel::Mos8580,
    }
}

fn resid_sampling(method: SamplingMethod) -> resid::SamplingMethod {
    match method {
        SamplingMethod::Interpolate => resid::SamplingMethod::Interpolate,
        SamplingMethod::ResampleInterpolate => resid::SamplingMethod::Resample,
    }
}

pub struct ChipBank {
    chips: Vec<Chip>,
    model: SidModel,
    clock: u32,
    rate: u32,
    stereo: bool,
    live: LiveSettings,
}

impl ChipBank {
    pub fn new(
        count: usize,
        model: SidModel,
        clock: u32,
        rate: u32,
        stereo: bool,
        live: LiveSettings,
    ) -> Result<Self, String> {
        if !(1..=3).contains(&count) {
            return Err(format!("unsupported SID count {count}"));
        }
        if rate == 0 || clock == 0 {
            return Err(format!("invalid sampling parameters {clock} Hz → {rate} Hz"));
        }
        let chips = (0..count)
            .map(|_| Chip {
                sid: SendSid(Sid::new(resid_model(model))),
                board: ExternalFilter::new(clock),
                out: Vec::with_capacity(1024),
            })
            .collect();
        let mut bank = Self {
            chips,
            model,
            clock,
            rate,
            stereo,
            live,
        };
        bank.apply(live, true);
        Ok(bank)
    }

    pub fn len(&self) -> usize {
        self.chips.len()
    }

    /// Apply writes immediately, without clocking (INIT's register setup).
    pub fn poke(&mut self, writes: &[SidWrite]) {
        for &(_, chip, reg, value) in writes {
            if let Some(c) = self.chips.get_mut(usize::from(chip)) {
                c.sid.0.write(reg, value);
            }
        }
    }

    /// Re-apply live settings; the sampler is only rebuilt when the method
    /// actually changed.
    pub fn apply(&mut self, live: LiveSettings, force: bool) {
        let resample = force || live.sampling != self.live.sampling;
        let boost = if live.digi_boost && self.model == SidModel::Mos8580 {
            DIGI_BOOST_INPUT
        } else {
            0
        };
        for chip in &mut self.chips {
            if resample {
                chip.sid
                    .0
                    .set_sampling_parameters(resid_sampling(live.sampling), self.clock, self.rate);
            }
            chip.sid.0.enable_filter(live.filter);
            chip.sid.0.input(boost);
        }
        if live.digi_boost && self.model != SidModel::Mos8580 {
            warn!("digi boost only affects the MOS8580");
        }
        self.live = live;
    }

    /// Replay one frame of writes and append the mixed, interleaved
    /// output to `out`.
    pub fn play_frame(&mut self, writes: &[SidWrite], frame_cycles: u32, out: &mut VecDeque<i16>) {
        let mut clocked = 0u32;
        for &(cycle, chip, reg, value) in writes {
            if cycle > clocked {
                self.clock_all(cycle - clocked);
                clocked = cycle;
            }
            if let Some(c) = self.chips.get_mut(usize::from(chip)) {
                c.sid.0.write(reg, value);
            }
        }
        if frame_cycles > clocked {
            self.clock_all(frame_cycles - clocked);
        }
        self.mix(out);
    }

    fn clock_all(&mut self, delta: u32) {
        for chip in &mut self.chips {
            chip.clock(delta);
        }
    }

    fn mix(&mut self, out: &mut VecDeque<i16>) {
        let frames = self.chips.iter().map(|c| c.out.len()).min().unwrap_or(0);
        let at = |chip: &Chip, i: usize| i32::from(chip.out[i]);
        let clamp = |v: i32| v.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;

        for i in 0..frames {
            if self.stereo {
                let left = at(&self.chips[0], i);
                let right = self.chips.get(1).map_or(left, |c| at(c, i));
                let centre = self.chips.get(2).map_or(0, |c| at(c, i) / 2);
                out.push_back(clamp(left + centre));
                out.push_back(clamp(right + centre));
            } else {
                let sum: i32 = self.chips.iter().map(|c| at(c, i)).sum();
                out.push_back(clamp(sum / self.chips.len() as i32));
            }
        }
        for chip in &mut self.chips {
            chip.out.clear();
        }
    }
}
