// Emulation engine contract and the resid-rs backed implementation.
//
// A decode session creates one engine per play cycle through a factory,
// hands it the ROM set and the tune, configures it for the negotiated
// output format, builds its sound chips and then pulls PCM from it.

pub mod c64;
pub mod chips;
mod cia;
pub mod cpu;
pub mod memory;
mod vic;

pub use c64::ResidEngine;

use crate::config::{
    C64Model, CiaModel, Emulation, SamplingMethod, SessionConfig, SidModel, MAX_FILTER_BIAS,
    MIN_FILTER_BIAS,
};
use crate::roms::RomSet;
use crate::tune::Tune;

/// Settings an engine applies again whenever they change mid-play.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveSettings {
    pub filter: bool,
    pub digi_boost: bool,
    pub sampling: SamplingMethod,
}

/// Output format and machine models for one play cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    pub frequency: u32,
    pub channels: u32,
    pub c64_model: C64Model,
    pub force_c64_model: bool,
    pub sid_model: SidModel,
    pub force_sid_model: bool,
    pub cia_model: CiaModel,
    pub live: LiveSettings,
}

impl EngineConfig {
    pub fn from_session(config: &SessionConfig, frequency: u32, channels: u32) -> Self {
        Self {
            frequency,
            channels,
            c64_model: config.c64_model,
            force_c64_model: config.force_c64_model,
            sid_model: config.sid_model,
            force_sid_model: config.force_sid_model,
            cia_model: config.cia_model,
            live: LiveSettings::from_session(config),
        }
    }
}

impl LiveSettings {
    pub fn from_session(config: &SessionConfig) -> Self {
        Self {
            filter: config.filter,
            digi_boost: config.digi_boost,
            sampling: config.sampling_method,
        }
    }
}

/// Sound-chip builder parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BuilderParams {
    pub emulation: Emulation,
    /// Upper bound on chips to create.
    pub chips: usize,
    pub filter: bool,
    pub curve_6581: f64,
    pub curve_8580: f64,
    pub bias: f64,
}

impl BuilderParams {
    pub fn validate(&self) -> Result<(), String> {
        if self.chips == 0 {
            return Err("builder asked for zero chips".into());
        }
        for (name, curve) in [("6581", self.curve_6581), ("8580", self.curve_8580)] {
            if !(0.0..=1.0).contains(&curve) {
                return Err(format!("filter curve {name} out of range: {curve}"));
            }
        }
        if !(MIN_FILTER_BIAS..=MAX_FILTER_BIAS).contains(&self.bias) {
            return Err(format!("filter bias out of range: {} mV", self.bias));
        }
        Ok(())
    }
}

/// The emulator a decode session drives.
pub trait Engine: Send {
    /// ROM images used by the next `load`.
    fn set_roms(&mut self, roms: &RomSet);

    /// Prepare the tune's selected song.
    fn load(&mut self, tune: &Tune) -> Result<(), String>;

    /// Most sound chips this engine can emulate at once.
    fn max_sids(&self) -> usize;

    /// Apply an output configuration. Called once before `build` and again
    /// with updated live settings while playing.
    fn configure(&mut self, config: &EngineConfig) -> Result<(), String>;

    /// Create the sound chips and start the tune.
    fn build(&mut self, params: &BuilderParams) -> Result<(), String>;

    /// Fill `out` with interleaved samples. Returns how many were written;
    /// fewer than `out.len()` means the engine has nothing more to play.
    fn render(&mut self, out: &mut [i16]) -> usize;
}
