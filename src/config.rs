// Decoder session configuration: named, validated fields plus the
// key=value parsing used by the command line and the defaults file.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_RATE: u32 = 44_100;
pub const DEFAULT_CHANNELS: u32 = 1;
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
pub const DEFAULT_FILTER_CURVE: f64 = 0.5;
pub const DEFAULT_FILTER_BIAS: f64 = 0.5;

pub const MIN_RATE: u32 = 8000;
pub const MAX_RATE: u32 = 48_000;
pub const MAX_TUNE_INDEX: u16 = 100;
/// One block is rendered in a single allocation of this many bytes at most.
pub const MAX_BLOCK_SIZE: u32 = 1 << 20;
pub const MIN_FILTER_BIAS: f64 = -600.0;
pub const MAX_FILTER_BIAS: f64 = 600.0;

/// Declares a plain enum with a lowercase nick used for parsing and display.
macro_rules! nick_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $nick:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $nick)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn nick(self) -> &'static str {
                match self {
                    $($name::$variant => $nick,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.nick())
            }
        }

        impl FromStr for $name {
            type Err = ();

            fn from_str(s: &str) -> Result<Self, ()> {
                let s = s.trim().to_ascii_lowercase();
                $name::ALL.iter().copied().find(|v| v.nick() == s).ok_or(())
            }
        }
    };
}

nick_enum!(
    /// Which sound-chip emulation family to build.
    Emulation { ResidFp => "residfp", Resid => "resid" }
);

nick_enum!(
    /// SID chip revision.
    SidModel { Mos6581 => "mos6581", Mos8580 => "mos8580" }
);

nick_enum!(
    /// C64 board / video standard.
    C64Model {
        Pal => "pal",
        Ntsc => "ntsc",
        OldNtsc => "old-ntsc",
        Drean => "drean",
        PalM => "pal-m",
    }
);

nick_enum!(
    /// CIA chip revision.
    CiaModel {
        Mos6526 => "mos6526",
        Mos8521 => "mos8521",
        Mos6526W4485 => "mos6526w4485",
    }
);

nick_enum!(
    /// How the emulated chip output is brought to the output rate.
    SamplingMethod {
        Interpolate => "interpolate",
        ResampleInterpolate => "resample-interpolate",
    }
);

impl C64Model {
    /// CPU clock in Hz.
    pub fn clock(self) -> u32 {
        match self {
            C64Model::Pal => 985_248,
            C64Model::Ntsc | C64Model::OldNtsc => 1_022_727,
            C64Model::Drean => 1_023_440,
            C64Model::PalM => 1_022_727,
        }
    }

    /// CPU cycles per video frame.
    pub fn cycles_per_frame(self) -> u32 {
        match self {
            C64Model::Pal => 19_705,
            C64Model::Ntsc => 17_045,
            C64Model::OldNtsc => 64 * 262,
            C64Model::Drean => 65 * 312,
            C64Model::PalM => 65 * 263,
        }
    }

    pub fn is_pal(self) -> bool {
        matches!(self, C64Model::Pal | C64Model::Drean)
    }
}

/// Everything the decode session can be told before or during playback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Preferred output rate; the negotiated rate may differ.
    pub rate: u32,
    /// Preferred channel count (1 or 2).
    pub channels: u32,
    pub emulation: Emulation,
    pub sid_model: SidModel,
    pub force_sid_model: bool,
    pub c64_model: C64Model,
    pub force_c64_model: bool,
    pub cia_model: CiaModel,
    pub sampling_method: SamplingMethod,
    pub digi_boost: bool,
    pub filter: bool,
    pub filter_curve_6581: f64,
    pub filter_curve_8580: f64,
    /// In millivolts.
    pub filter_bias: f64,
    /// Bytes per output block.
    pub block_size: u32,
    /// 0 selects the tune's start song.
    pub tune: u16,
    /// Stop after this much audio. `None` plays until the engine stops.
    #[serde(with = "opt_secs")]
    pub play_length: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rate: DEFAULT_RATE,
            channels: DEFAULT_CHANNELS,
            emulation: Emulation::ResidFp,
            sid_model: SidModel::Mos6581,
            force_sid_model: false,
            c64_model: C64Model::Pal,
            force_c64_model: false,
            cia_model: CiaModel::Mos6526,
            sampling_method: SamplingMethod::Interpolate,
            digi_boost: false,
            filter: true,
            filter_curve_6581: DEFAULT_FILTER_CURVE,
            filter_curve_8580: DEFAULT_FILTER_CURVE,
            filter_bias: DEFAULT_FILTER_BIAS,
            block_size: DEFAULT_BLOCK_SIZE,
            tune: 0,
            play_length: None,
        }
    }
}

/// One assignment to a [`SessionConfig`] field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Setting {
    Rate(u32),
    Channels(u32),
    Emulation(Emulation),
    SidModel(SidModel),
    ForceSidModel(bool),
    C64Model(C64Model),
    ForceC64Model(bool),
    CiaModel(CiaModel),
    SamplingMethod(SamplingMethod),
    DigiBoost(bool),
    Filter(bool),
    FilterCurve6581(f64),
    FilterCurve8580(f64),
    FilterBias(f64),
    BlockSize(u32),
    Tune(u16),
    PlayLength(Option<Duration>),
}

impl Setting {
    /// Setting keys accepted by [`Setting::parse`].
    pub const KEYS: &'static [&'static str] = &[
        "rate",
        "channels",
        "emulation",
        "sid-model",
        "force-sid-model",
        "c64-model",
        "force-c64-model",
        "cia-model",
        "sampling-method",
        "digi-boost",
        "filter",
        "filter-curve-6581",
        "filter-curve-8580",
        "filter-bias",
        "blocksize",
        "tune",
        "length",
    ];

    /// Parse a `key=value` pair.
    pub fn parse_pair(pair: &str) -> Result<Self, ConfigError> {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| ConfigError::Malformed(pair.to_string()))?;
        Self::parse(key.trim(), value.trim())
    }

    /// Parse a value for a named setting. Range checks happen on apply.
    pub fn parse(key: &str, value: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        let num = |v: &str| v.parse::<f64>().map_err(|_| invalid());
        let int = |v: &str| v.parse::<u32>().map_err(|_| invalid());
        let flag = |v: &str| parse_bool(v).ok_or_else(invalid);

        let setting = match key {
            "rate" => Setting::Rate(int(value)?),
            "channels" => Setting::Channels(int(value)?),
            "emulation" => Setting::Emulation(value.parse().map_err(|_| invalid())?),
            "sid-model" => Setting::SidModel(value.parse().map_err(|_| invalid())?),
            "force-sid-model" => Setting::ForceSidModel(flag(value)?),
            "c64-model" => Setting::C64Model(value.parse().map_err(|_| invalid())?),
            "force-c64-model" => Setting::ForceC64Model(flag(value)?),
            "cia-model" => Setting::CiaModel(value.parse().map_err(|_| invalid())?),
            "sampling-method" => Setting::SamplingMethod(value.parse().map_err(|_| invalid())?),
            "digi-boost" => Setting::DigiBoost(flag(value)?),
            "filter" => Setting::Filter(flag(value)?),
            "filter-curve-6581" => Setting::FilterCurve6581(num(value)?),
            "filter-curve-8580" => Setting::FilterCurve8580(num(value)?),
            "filter-bias" => Setting::FilterBias(num(value)?),
            "blocksize" => Setting::BlockSize(int(value)?),
            "tune" => Setting::Tune(value.parse::<u16>().map_err(|_| invalid())?),
            "length" => {
                let secs = num(value)?;
                if secs < 0.0 || !secs.is_finite() {
                    return Err(invalid());
                }
                Setting::PlayLength((secs > 0.0).then(|| Duration::from_secs_f64(secs)))
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        };
        Ok(setting)
    }

    /// Whether the value is only read when a new tune is started.
    pub fn is_latched(&self) -> bool {
        matches!(
            self,
            Setting::Rate(_)
                | Setting::Channels(_)
                | Setting::Emulation(_)
                | Setting::SidModel(_)
                | Setting::ForceSidModel(_)
                | Setting::C64Model(_)
                | Setting::ForceC64Model(_)
                | Setting::CiaModel(_)
                | Setting::FilterCurve6581(_)
                | Setting::FilterCurve8580(_)
                | Setting::FilterBias(_)
                | Setting::Tune(_)
        )
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn check_range(key: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value.is_nan() || value < min || value > max {
        return Err(ConfigError::OutOfRange {
            key,
            value,
            min,
            max,
        });
    }
    Ok(())
}

impl SessionConfig {
    /// Validate and store one setting. On error the previous value is kept.
    pub fn apply(&mut self, setting: Setting) -> Result<(), ConfigError> {
        match setting {
            Setting::Rate(v) => {
                check_range("rate", f64::from(v), f64::from(MIN_RATE), f64::from(MAX_RATE))?;
                self.rate = v;
            }
            Setting::Channels(v) => {
                check_range("channels", f64::from(v), 1.0, 2.0)?;
                self.channels = v;
            }
            Setting::Emulation(v) => self.emulation = v,
            Setting::SidModel(v) => self.sid_model = v,
            Setting::ForceSidModel(v) => self.force_sid_model = v,
            Setting::C64Model(v) => self.c64_model = v,
            Setting::ForceC64Model(v) => self.force_c64_model = v,
            Setting::CiaModel(v) => self.cia_model = v,
            Setting::SamplingMethod(v) => self.sampling_method = v,
            Setting::DigiBoost(v) => self.digi_boost = v,
            Setting::Filter(v) => self.filter = v,
            Setting::FilterCurve6581(v) => {
                check_range("filter-curve-6581", v, 0.0, 1.0)?;
                self.filter_curve_6581 = v;
            }
            Setting::FilterCurve8580(v) => {
                check_range("filter-curve-8580", v, 0.0, 1.0)?;
                self.filter_curve_8580 = v;
            }
            Setting::FilterBias(v) => {
                check_range("filter-bias", v, MIN_FILTER_BIAS, MAX_FILTER_BIAS)?;
                self.filter_bias = v;
            }
            Setting::BlockSize(v) => {
                check_range("blocksize", f64::from(v), 1.0, f64::from(MAX_BLOCK_SIZE))?;
                self.block_size = v;
            }
            Setting::Tune(v) => {
                check_range("tune", f64::from(v), 0.0, f64::from(MAX_TUNE_INDEX))?;
                self.tune = v;
            }
            Setting::PlayLength(v) => self.play_length = v,
        }
        Ok(())
    }

    /// Re-check every field; used for configs read from disk.
    pub fn validated(self) -> Result<Self, ConfigError> {
        let mut checked = SessionConfig::default();
        for setting in self.settings() {
            checked.apply(setting)?;
        }
        Ok(checked)
    }

    fn settings(&self) -> [Setting; 17] {
        [
            Setting::Rate(self.rate),
            Setting::Channels(self.channels),
            Setting::Emulation(self.emulation),
            Setting::SidModel(self.sid_model),
            Setting::ForceSidModel(self.force_sid_model),
            Setting::C64Model(self.c64_model),
            Setting::ForceC64Model(self.force_c64_model),
            Setting::CiaModel(self.cia_model),
            Setting::SamplingMethod(self.sampling_method),
            Setting::DigiBoost(self.digi_boost),
            Setting::Filter(self.filter),
            Setting::FilterCurve6581(self.filter_curve_6581),
            Setting::FilterCurve8580(self.filter_curve_8580),
            Setting::FilterBias(self.filter_bias),
            Setting::BlockSize(self.block_size),
            Setting::Tune(self.tune),
            Setting::PlayLength(self.play_length),
        ]
    }
}

/// `Option<Duration>` stored as fractional seconds.
mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(d)?;
        Ok(secs
            .filter(|s| s.is_finite() && *s > 0.0)
            .map(Duration::from_secs_f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_defaults() {
        let c = SessionConfig::default();
        assert_eq!(c.rate, 44100);
        assert_eq!(c.channels, 1);
        assert_eq!(c.block_size, 4096);
        assert_eq!(c.emulation, Emulation::ResidFp);
        assert_eq!(c.sid_model, SidModel::Mos6581);
        assert_eq!(c.c64_model, C64Model::Pal);
        assert!(c.filter);
        assert!(!c.digi_boost);
        assert_eq!(c.tune, 0);
    }

    #[test]
    fn nicks_round_trip() {
        for m in C64Model::ALL {
            assert_eq!(m.nick().parse::<C64Model>(), Ok(*m));
        }
        assert_eq!("MOS8580".parse::<SidModel>(), Ok(SidModel::Mos8580));
        assert_eq!(
            "resample-interpolate".parse::<SamplingMethod>(),
            Ok(SamplingMethod::ResampleInterpolate)
        );
        assert!("mos6502".parse::<SidModel>().is_err());
    }

    #[test]
    fn parse_pairs() {
        assert_eq!(Setting::parse_pair("tune=3"), Ok(Setting::Tune(3)));
        assert_eq!(Setting::parse_pair("filter = off"), Ok(Setting::Filter(false)));
        assert_eq!(
            Setting::parse_pair("c64-model=ntsc"),
            Ok(Setting::C64Model(C64Model::Ntsc))
        );
        assert_eq!(
            Setting::parse_pair("length=2.5"),
            Ok(Setting::PlayLength(Some(Duration::from_millis(2500))))
        );
        assert_eq!(Setting::parse_pair("length=0"), Ok(Setting::PlayLength(None)));
        assert!(matches!(
            Setting::parse_pair("volume=3"),
            Err(ConfigError::UnknownKey(_))
        ));
        assert!(matches!(
            Setting::parse_pair("filter"),
            Err(ConfigError::Malformed(_))
        ));
        assert!(matches!(
            Setting::parse_pair("digi-boost=maybe"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn out_of_range_keeps_previous_value() {
        let mut c = SessionConfig::default();
        assert!(c.apply(Setting::BlockSize(0)).is_err());
        assert_eq!(c.block_size, DEFAULT_BLOCK_SIZE);
        assert!(matches!(
            c.apply(Setting::BlockSize(MAX_BLOCK_SIZE + 1)),
            Err(ConfigError::OutOfRange { .. })
        ));
        assert!(c.apply(Setting::BlockSize(u32::MAX)).is_err());
        assert_eq!(c.block_size, DEFAULT_BLOCK_SIZE);
        assert!(c.apply(Setting::BlockSize(MAX_BLOCK_SIZE)).is_ok());
        c.block_size = DEFAULT_BLOCK_SIZE;
        assert!(c.apply(Setting::Rate(96_000)).is_err());
        assert_eq!(c.rate, DEFAULT_RATE);
        assert!(c.apply(Setting::Channels(3)).is_err());
        assert!(c.apply(Setting::FilterCurve6581(1.5)).is_err());
        assert!(c.apply(Setting::FilterBias(-601.0)).is_err());
        assert!(c.apply(Setting::Tune(101)).is_err());
        assert!(c.apply(Setting::FilterCurve8580(f64::NAN)).is_err());
        assert_eq!(c, SessionConfig::default());

        c.apply(Setting::FilterBias(-600.0)).unwrap();
        c.apply(Setting::Rate(8000)).unwrap();
        assert_eq!(c.filter_bias, -600.0);
        assert_eq!(c.rate, 8000);
    }

    #[test]
    fn every_key_parses() {
        let samples = [
            "48000", "2", "resid", "mos8580", "1", "ntsc", "0", "mos8521",
            "interpolate", "yes", "no", "0.25", "0.75", "-100", "2048", "4", "60",
        ];
        for (key, value) in Setting::KEYS.iter().zip(samples) {
            let setting = Setting::parse(key, value).unwrap();
            SessionConfig::default().apply(setting).unwrap();
        }
    }

    #[test]
    fn json_round_trip_revalidates() {
        let mut c = SessionConfig::default();
        c.apply(Setting::PlayLength(Some(Duration::from_secs(90)))).unwrap();
        c.apply(Setting::SidModel(SidModel::Mos8580)).unwrap();
        let json = serde_json::to_string(&c).unwrap();
        assert!(json.contains("\"mos8580\""));
        let back: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.validated().unwrap(), c);

        let bad: SessionConfig = serde_json::from_str(r#"{"block_size": 0}"#).unwrap();
        assert!(bad.validated().is_err());
    }
}
