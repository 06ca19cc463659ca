// PSID / RSID header parser (v1–v4), payload extraction and sub-tune
// selection.

use crate::config::{C64Model, SidModel};

const HEADER_V1_LEN: usize = 0x76;
const HEADER_V2_LEN: usize = 0x7C;

/// Video standard requested by the tune's flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockHint {
    Unknown,
    Pal,
    Ntsc,
    Any,
}

/// SID revision requested by the tune's flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelHint {
    Unknown,
    Mos6581,
    Mos8580,
    Any,
}

impl ClockHint {
    fn from_bits(bits: u16) -> Self {
        match bits & 0x03 {
            1 => ClockHint::Pal,
            2 => ClockHint::Ntsc,
            3 => ClockHint::Any,
            _ => ClockHint::Unknown,
        }
    }

    /// The model to run on, given the user default and force flag.
    pub fn resolve(self, default: C64Model, force: bool) -> C64Model {
        match self {
            _ if force => default,
            ClockHint::Pal if !default.is_pal() => C64Model::Pal,
            ClockHint::Ntsc if default.is_pal() => C64Model::Ntsc,
            _ => default,
        }
    }
}

impl ModelHint {
    fn from_bits(bits: u16) -> Self {
        match bits & 0x03 {
            1 => ModelHint::Mos6581,
            2 => ModelHint::Mos8580,
            3 => ModelHint::Any,
            _ => ModelHint::Unknown,
        }
    }

    pub fn resolve(self, default: SidModel, force: bool) -> SidModel {
        match self {
            _ if force => default,
            ModelHint::Mos6581 => SidModel::Mos6581,
            ModelHint::Mos8580 => SidModel::Mos8580,
            _ => default,
        }
    }
}

/// Parsed SID file header.
#[derive(Debug, Clone)]
pub struct SidHeader {
    pub version: u16,
    pub data_offset: u16,
    pub load_address: u16,
    pub init_address: u16,
    pub play_address: u16,
    pub songs: u16,
    pub start_song: u16,
    pub speed: u32,
    pub name: String,
    pub author: String,
    pub released: String,
    pub is_rsid: bool,
    pub clock: ClockHint,
    pub sid_model: ModelHint,
    /// C64 addresses of extra SIDs (0 = unused). Index 0 = SID2, 1 = SID3.
    pub extra_sid_addrs: [u16; 2],
}

impl SidHeader {
    /// Number of SID chips the tune uses (1–3 from header alone).
    pub fn num_sids(&self) -> usize {
        1 + self.extra_sid_addrs.iter().filter(|&&a| a != 0).count()
    }
}

/// Title, artist and copyright as UTF-8. Empty header fields are absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TuneMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub copyright: Option<String>,
}

impl TuneMetadata {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.artist.is_none() && self.copyright.is_none()
    }
}

/// A loaded SID file: header, payload and the selected sub-tune.
#[derive(Debug, Clone)]
pub struct Tune {
    pub header: SidHeader,
    pub load_address: u16,
    pub payload: Vec<u8>,
    current_song: u16,
}

fn read_be_u16(d: &[u8], o: usize) -> u16 {
    u16::from_be_bytes([d[o], d[o + 1]])
}

fn read_be_u32(d: &[u8], o: usize) -> u32 {
    u32::from_be_bytes([d[o], d[o + 1], d[o + 2], d[o + 3]])
}

/// NUL-terminated ISO-8859-1 field. Latin-1 maps 1:1 onto the first 256
/// code points, so each byte becomes one `char`.
fn read_latin1(d: &[u8], o: usize, len: usize) -> String {
    let s = &d[o..o + len];
    let end = s.iter().position(|&b| b == 0).unwrap_or(len);
    s[..end].iter().map(|&b| char::from(b)).collect()
}

/// Decode a SID address byte (from header offset $7A or $7B).
fn decode_sid_addr_byte(b: u8) -> u16 {
    if b >= 0x42 && (b <= 0x7F || b >= 0xE0) && (b & 1) == 0 {
        0xD000 | (u16::from(b) << 4)
    } else {
        0
    }
}

/// Parse just the header.
pub fn parse_header(data: &[u8]) -> Result<SidHeader, String> {
    if data.len() < HEADER_V1_LEN {
        return Err(format!("file too small for a SID header ({} bytes)", data.len()));
    }

    let is_rsid = match &data[0..4] {
        b"PSID" => false,
        b"RSID" => true,
        other => return Err(format!("not a SID file (magic={:?})", String::from_utf8_lossy(other))),
    };

    let version = read_be_u16(data, 0x04);
    if !(1..=4).contains(&version) {
        return Err(format!("unsupported SID version {version}"));
    }

    let mut clock = ClockHint::Unknown;
    let mut sid_model = ModelHint::Unknown;
    let mut extra_sid_addrs = [0u16; 2];

    if version >= 2 && data.len() >= HEADER_V2_LEN {
        let flags = read_be_u16(data, 0x76);
        clock = ClockHint::from_bits(flags >> 2);
        sid_model = ModelHint::from_bits(flags >> 4);

        if version >= 3 {
            extra_sid_addrs[0] = decode_sid_addr_byte(data[0x7A]);
        }
        if version >= 4 {
            extra_sid_addrs[1] = decode_sid_addr_byte(data[0x7B]);
        }
    }

    let songs = read_be_u16(data, 0x0E);
    if songs == 0 {
        return Err("tune declares no songs".into());
    }

    Ok(SidHeader {
        version,
        data_offset: read_be_u16(data, 0x06),
        load_address: read_be_u16(data, 0x08),
        init_address: read_be_u16(data, 0x0A),
        play_address: read_be_u16(data, 0x0C),
        songs,
        start_song: read_be_u16(data, 0x10),
        speed: read_be_u32(data, 0x12),
        name: read_latin1(data, 0x16, 32),
        author: read_latin1(data, 0x36, 32),
        released: read_latin1(data, 0x56, 32),
        is_rsid,
        clock,
        sid_model,
        extra_sid_addrs,
    })
}

impl Tune {
    /// Parse a SID file from raw bytes.
    pub fn parse(data: &[u8]) -> Result<Self, String> {
        let header = parse_header(data)?;
        let ds = usize::from(header.data_offset);
        let header_len = if header.version >= 2 {
            HEADER_V2_LEN
        } else {
            HEADER_V1_LEN
        };

        if ds < header_len {
            return Err(format!("data offset {ds:#X} inside the header"));
        }
        if ds >= data.len() {
            return Err("data offset past end of file".into());
        }

        let (load_address, payload_start) = if header.load_address == 0 {
            if ds + 2 > data.len() {
                return Err("file too small for embedded load address".into());
            }
            (u16::from_le_bytes([data[ds], data[ds + 1]]), ds + 2)
        } else {
            (header.load_address, ds)
        };

        let payload = data[payload_start..].to_vec();
        if usize::from(load_address) + payload.len() > 0x10000 {
            return Err(format!(
                "payload of {} bytes does not fit at ${load_address:04X}",
                payload.len()
            ));
        }

        let current_song = start_song(&header);
        Ok(Self {
            header,
            load_address,
            payload,
            current_song,
        })
    }

    pub fn songs(&self) -> u16 {
        self.header.songs
    }

    /// The selected sub-tune, 1-based.
    pub fn current_song(&self) -> u16 {
        self.current_song
    }

    /// Select a sub-tune. 0 picks the tune's start song.
    pub fn select_song(&mut self, song: u16) -> Result<u16, String> {
        let songs = self.header.songs;
        self.current_song = match song {
            0 => start_song(&self.header),
            n if n <= songs => n,
            n => return Err(format!("sub-tune {n} out of range (1..={songs})")),
        };
        Ok(self.current_song)
    }

    /// Whether the selected song is timed by CIA 1 rather than the
    /// vertical blank.
    pub fn uses_cia_timer(&self) -> bool {
        if self.header.is_rsid {
            return true;
        }
        let bit = u32::from(self.current_song.saturating_sub(1).min(31));
        self.header.speed & (1 << bit) != 0
    }

    pub fn metadata(&self) -> TuneMetadata {
        let field = |s: &str| (!s.trim().is_empty()).then(|| s.to_string());
        TuneMetadata {
            title: field(&self.header.name),
            artist: field(&self.header.author),
            copyright: field(&self.header.released),
        }
    }
}

fn start_song(header: &SidHeader) -> u16 {
    match header.start_song {
        0 => 1,
        s if s > header.songs => 1,
        s => s,
    }
}

/// Hex MD5 of a whole image, used as the stream identity.
pub fn image_digest(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Assemble a minimal PSID v2 image around `code` for tests.
#[cfg(test)]
pub(crate) fn build_psid(load: u16, init: u16, play: u16, songs: u16, code: &[u8]) -> Vec<u8> {
    let mut d = vec![0u8; HEADER_V2_LEN];
    d[0..4].copy_from_slice(b"PSID");
    d[0x04..0x06].copy_from_slice(&2u16.to_be_bytes());
    d[0x06..0x08].copy_from_slice(&(HEADER_V2_LEN as u16).to_be_bytes());
    d[0x08..0x0A].copy_from_slice(&load.to_be_bytes());
    d[0x0A..0x0C].copy_from_slice(&init.to_be_bytes());
    d[0x0C..0x0E].copy_from_slice(&play.to_be_bytes());
    d[0x0E..0x10].copy_from_slice(&songs.to_be_bytes());
    d[0x10..0x12].copy_from_slice(&1u16.to_be_bytes());
    d[0x16..0x16 + 5].copy_from_slice(b"Title");
    d[0x36..0x36 + 6].copy_from_slice(b"Author");
    d[0x76..0x78].copy_from_slice(&0x0014u16.to_be_bytes());
    d.extend_from_slice(code);
    d
}
