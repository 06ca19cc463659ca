//! C64 system ROM images and the loader that finds them on disk.
//!
//! Both `.bin` and `.rom` extensions are accepted (`.bin` tried first).
//!
//! # Search paths (tried in order)
//! 1. `$C64_ROM_DIR`  (environment variable)
//! 2. `./roms/`
//! 3. `./`
//! 4. `roms/` and the directory next to the executable
//! 5. `~/.local/share/c64/roms/`
//! 6. `/usr/share/vice/C64/`
//!
//! The first directory holding any of the three images wins. A missing or
//! wrongly sized image leaves its slot empty; the engine falls back to
//! built-in kernal vectors in that case.

use std::path::{Path, PathBuf};
use std::{env, fs};

use log::{debug, info, warn};

pub const KERNAL_SIZE: usize = 0x2000;
pub const BASIC_SIZE: usize = 0x2000;
pub const CHARGEN_SIZE: usize = 0x1000;

/// Optional kernal, basic and chargen images. Each slot only ever holds a
/// buffer of the exact expected size.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RomSet {
    kernal: Option<Vec<u8>>,
    basic: Option<Vec<u8>>,
    chargen: Option<Vec<u8>>,
}

/// Store `data` in `slot` if it has the expected size, otherwise clear the
/// slot. Returns whether the image was accepted.
fn store(slot: &mut Option<Vec<u8>>, data: Option<Vec<u8>>, name: &str, size: usize) -> bool {
    match data {
        Some(d) if d.len() == size => {
            *slot = Some(d);
            true
        }
        Some(d) => {
            warn!("{name} ROM rejected: expected {size} bytes, got {}", d.len());
            *slot = None;
            false
        }
        None => {
            *slot = None;
            true
        }
    }
}

impl RomSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_kernal(&mut self, data: Option<Vec<u8>>) -> bool {
        store(&mut self.kernal, data, "kernal", KERNAL_SIZE)
    }

    pub fn set_basic(&mut self, data: Option<Vec<u8>>) -> bool {
        store(&mut self.basic, data, "basic", BASIC_SIZE)
    }

    pub fn set_chargen(&mut self, data: Option<Vec<u8>>) -> bool {
        store(&mut self.chargen, data, "chargen", CHARGEN_SIZE)
    }

    pub fn kernal(&self) -> Option<&[u8]> {
        self.kernal.as_deref()
    }

    pub fn basic(&self) -> Option<&[u8]> {
        self.basic.as_deref()
    }

    pub fn chargen(&self) -> Option<&[u8]> {
        self.chargen.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.kernal.is_none() && self.basic.is_none() && self.chargen.is_none()
    }

    /// Search the standard paths. Never fails; absent images stay empty.
    pub fn discover() -> Self {
        match find_rom_dir() {
            Some(dir) => Self::load_from(&dir),
            None => {
                debug!("no C64 ROM directory found, using built-in kernal vectors");
                Self::default()
            }
        }
    }

    /// Load whatever images exist in `dir`.
    pub fn load_from<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref();
        let mut set = Self::default();
        set.set_kernal(read_rom(dir, "kernal"));
        set.set_basic(read_rom(dir, "basic"));
        set.set_chargen(read_rom(dir, "chargen"));
        set
    }
}

fn candidate_dirs() -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();

    if let Ok(val) = env::var("C64_ROM_DIR") {
        candidates.push(PathBuf::from(val));
    }
    if let Ok(cwd) = env::current_dir() {
        candidates.push(cwd.join("roms"));
        candidates.push(cwd);
    }
    if let Ok(exe) = env::current_exe() {
        if let Some(d) = exe.parent() {
            candidates.push(d.join("roms"));
            candidates.push(d.to_path_buf());
        }
    }
    if let Some(home) = dirs_home() {
        candidates.push(home.join(".local").join("share").join("c64").join("roms"));
    }
    candidates.push(PathBuf::from("/usr/share/vice/C64"));
    candidates
}

fn find_rom_dir() -> Option<PathBuf> {
    candidate_dirs().into_iter().find(|dir| {
        ["kernal", "basic", "chargen"]
            .iter()
            .any(|base| rom_path(dir, base).is_some())
    })
}

/// Find a ROM file by base name, `.bin` before `.rom`.
fn rom_path(dir: &Path, base: &str) -> Option<PathBuf> {
    ["bin", "rom"]
        .iter()
        .map(|ext| dir.join(format!("{base}.{ext}")))
        .find(|p| p.is_file())
}

fn read_rom(dir: &Path, base: &str) -> Option<Vec<u8>> {
    let path = rom_path(dir, base)?;
    match fs::read(&path) {
        Ok(data) => {
            info!("loaded ROM {}", path.display());
            Some(data)
        }
        Err(e) => {
            warn!("{}: {e}", path.display());
            None
        }
    }
}

fn dirs_home() -> Option<PathBuf> {
    env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("USERPROFILE").map(PathBuf::from))
}
