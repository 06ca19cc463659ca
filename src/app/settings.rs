// Persistent host defaults: session settings, ROM directory, image bound.
// Stored as JSON in <config_dir>/siddec/config.json

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use siddec::config::SessionConfig;
use siddec::decoder::session::DEFAULT_MAX_IMAGE_SIZE;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    /// Defaults applied before any `-s key=value` from the command line.
    pub session: SessionConfig,
    /// Where kernal/basic/chargen live. Searched for when unset.
    pub rom_dir: Option<PathBuf>,
    /// Largest SID file accepted, in bytes.
    pub max_image_size: usize,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            rom_dir: None,
            max_image_size: DEFAULT_MAX_IMAGE_SIZE,
        }
    }
}

impl HostSettings {
    pub fn config_path() -> Option<PathBuf> {
        config_dir().map(|d| d.join("config.json"))
    }

    /// Load from the default location, or return defaults if not found or
    /// invalid.
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("{e:#}, using defaults");
                Self::default()
            }),
            _ => {
                debug!("no config file, using defaults");
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        Self::parse_json(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Unknown fields are ignored, missing ones get defaults, and the
    /// session part must pass the usual range checks.
    pub fn parse_json(s: &str) -> anyhow::Result<Self> {
        let mut settings: Self = serde_json::from_str(s)?;
        settings.session = settings.session.validated()?;
        if settings.max_image_size == 0 {
            anyhow::bail!("max_image_size must be positive");
        }
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<PathBuf> {
        let path = Self::config_path().context("cannot determine config directory")?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("cannot save config {}", path.display()))?;
        info!("config saved to {}", path.display());
        Ok(())
    }
}

fn config_dir() -> Option<PathBuf> {
    // macOS:   ~/Library/Application Support/siddec/
    // Linux:   ~/.config/siddec/
    // Windows: %APPDATA%/siddec/

    #[cfg(target_os = "macos")]
    {
        let home = std::env::var("HOME").ok()?;
        Some(
            PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("siddec"),
        )
    }

    #[cfg(target_os = "windows")]
    {
        let appdata = std::env::var("APPDATA").ok()?;
        Some(PathBuf::from(appdata).join("siddec"))
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            if !xdg.is_empty() {
                return Some(PathBuf::from(xdg).join("siddec"));
            }
        }
        let home = std::env::var("HOME").ok()?;
        Some(PathBuf::from(home).join(".config").join("siddec"))
    }
}

#[cfg(test)]
mod tests {
    use siddec::config::{C64Model, SidModel};

    use super::*;

    #[test]
    fn partial_json_fills_in_defaults() {
        let s = r#"{ "session": { "sid_model": "mos8580", "rate": 48000 }, "extra": 1 }"#;
        let settings = HostSettings::parse_json(s).unwrap();
        assert_eq!(settings.session.sid_model, SidModel::Mos8580);
        assert_eq!(settings.session.rate, 48_000);
        assert_eq!(settings.session.c64_model, C64Model::Pal);
        assert_eq!(settings.rom_dir, None);
        assert_eq!(settings.max_image_size, DEFAULT_MAX_IMAGE_SIZE);
    }

    #[test]
    fn out_of_range_session_values_are_rejected() {
        assert!(HostSettings::parse_json(r#"{ "session": { "channels": 6 } }"#).is_err());
        assert!(HostSettings::parse_json(r#"{ "max_image_size": 0 }"#).is_err());
        assert!(HostSettings::parse_json("not json").is_err());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("siddec").join("config.json");
        let mut settings = HostSettings::default();
        settings.rom_dir = Some(PathBuf::from("/opt/c64"));
        settings.session.filter = false;
        settings.save_to(&path).unwrap();
        assert_eq!(HostSettings::load_from(&path).unwrap(), settings);
    }
}
