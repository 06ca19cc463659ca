// C64 address space seen by the 6502: RAM, processor-port banking of the
// BASIC/KERNAL/character ROMs and I/O, CIA and VIC registers, and capture
// of SID register writes with the cycle they happened on.

use mos6502::memory::Bus;

use super::cia::Cia;
use super::vic::Vic;
use crate::config::C64Model;
use crate::roms::RomSet;

/// SID register write: (cycle within frame, chip index, register, value).
pub type SidWrite = (u32, u8, u8, u8);

pub const SID_REGS: u16 = 0x20;

pub struct C64Bus {
    pub ram: Box<[u8; 0x10000]>,
    kernal: Box<[u8; 0x2000]>,
    /// Real KERNAL image present: $E000-$FFFF is read-only.
    kernal_is_rom: bool,
    basic: Option<Box<[u8]>>,
    chargen: Option<Box<[u8]>>,
    sid_bases: Vec<u16>,
    pub sid_writes: Vec<SidWrite>,
    pub cia1: Cia,
    pub cia2: Cia,
    pub vic: Vic,
    noise: u32,
    pub frame_cycle: u32,
}

fn loram(port: u8) -> bool {
    port & 0x01 != 0
}

fn hiram(port: u8) -> bool {
    port & 0x02 != 0
}

fn charen(port: u8) -> bool {
    port & 0x04 != 0
}

fn io_visible(port: u8) -> bool {
    (loram(port) || hiram(port)) && charen(port)
}

impl C64Bus {
    pub fn new(model: C64Model, roms: &RomSet, sid_bases: &[u16]) -> Self {
        let mut ram = Box::new([0u8; 0x10000]);
        ram[0x0000] = 0x2F;
        ram[0x0001] = 0x37;
        ram[0x02A6] = u8::from(model.is_pal());
        ram[0x0314..0x031A].copy_from_slice(&[0x31, 0xEA, 0x81, 0xEA, 0x72, 0xFE]);
        install_kernal_stubs(&mut ram[0xE000..]);

        let mut kernal = Box::new([0u8; 0x2000]);
        let kernal_is_rom = match roms.kernal() {
            Some(image) => {
                kernal.copy_from_slice(image);
                true
            }
            None => {
                kernal.copy_from_slice(&ram[0xE000..]);
                false
            }
        };

        let mut cia2 = Cia::new();
        cia2.write(0x02, 0x3F);
        cia2.write(0x00, 0x17);

        Self {
            ram,
            kernal,
            kernal_is_rom,
            basic: roms.basic().map(Box::from),
            chargen: roms.chargen().map(Box::from),
            sid_bases: sid_bases.to_vec(),
            sid_writes: Vec::with_capacity(256),
            cia1: Cia::new(),
            cia2,
            vic: Vic::new(model),
            noise: 0x1234_5678,
            frame_cycle: 0,
        }
    }

    pub fn load(&mut self, addr: u16, data: &[u8]) {
        let start = usize::from(addr);
        let end = (start + data.len()).min(0x10000);
        self.ram[start..end].copy_from_slice(&data[..end - start]);
        // Without a real KERNAL the tune may live under $E000: make its code
        // visible through the overlay, keeping the stub entry points.
        if !self.kernal_is_rom && end > 0xE000 {
            self.kernal.copy_from_slice(&self.ram[0xE000..]);
            install_kernal_stubs(&mut self.kernal[..]);
        }
    }

    /// `JSR target; JMP *` at `at`. Returns the address of the JMP.
    pub fn install_trampoline(&mut self, at: u16, target: u16) -> u16 {
        let halt = at + 3;
        let [tlo, thi] = target.to_le_bytes();
        let [hlo, hhi] = halt.to_le_bytes();
        self.ram[usize::from(at)..usize::from(at) + 6]
            .copy_from_slice(&[0x20, tlo, thi, 0x4C, hlo, hhi]);
        halt
    }

    /// Point a hardware vector somewhere, in RAM and in the KERNAL overlay.
    pub fn set_vector(&mut self, addr: u16, value: u16) {
        let [lo, hi] = value.to_le_bytes();
        let a = usize::from(addr);
        self.ram[a] = lo;
        self.ram[a + 1] = hi;
        if addr >= 0xE000 {
            let k = a - 0xE000;
            self.kernal[k] = lo;
            self.kernal[k + 1] = hi;
        }
    }

    pub fn read_vector(&mut self, addr: u16) -> u16 {
        u16::from_le_bytes([self.get_byte(addr), self.get_byte(addr.wrapping_add(1))])
    }

    pub fn begin_frame(&mut self) {
        self.sid_writes.clear();
        self.frame_cycle = 0;
    }

    /// Bump the jiffy clock at $A0-$A2 the way the KERNAL IRQ does.
    pub fn tick_jiffy_clock(&mut self) {
        for a in [0xA2usize, 0xA1, 0xA0] {
            self.ram[a] = self.ram[a].wrapping_add(1);
            if self.ram[a] != 0 {
                break;
            }
        }
    }

    /// Opcode at `pc` as the CPU will fetch it.
    pub fn peek_opcode(&self, pc: u16) -> u8 {
        let port = self.ram[0x0001];
        match pc {
            0xE000..=0xFFFF if hiram(port) => self.kernal[usize::from(pc - 0xE000)],
            0xA000..=0xBFFF if loram(port) && hiram(port) => match &self.basic {
                Some(b) => b[usize::from(pc - 0xA000)],
                None => self.ram[usize::from(pc)],
            },
            _ => self.ram[usize::from(pc)],
        }
    }

    fn sid_slot(&self, addr: u16) -> Option<(u8, u8)> {
        self.sid_bases
            .iter()
            .position(|&base| addr >= base && addr < base + SID_REGS)
            .map(|chip| (chip as u8, (addr & 0x1F) as u8))
    }

    fn read_io(&mut self, address: u16) -> u8 {
        match address {
            0xD000..=0xD3FF => self.vic.read(address),
            0xD400..=0xD7FF => match address & 0x1F {
                // OSC3 / ENV3: cheap noise so random-seeded tunes progress.
                0x1B | 0x1C => {
                    self.noise = self.noise.wrapping_mul(1_103_515_245).wrapping_add(12345);
                    (self.noise >> 16) as u8
                }
                0x19 | 0x1A => 0x80,
                _ => 0,
            },
            0xDC00..=0xDCFF => self.cia1.read(address as u8),
            0xDD00..=0xDDFF => self.cia2.read(address as u8),
            _ => self.ram[usize::from(address)],
        }
    }

    fn write_io(&mut self, address: u16, value: u8) {
        match address {
            0xD000..=0xD3FF => self.vic.write(address, value),
            0xDC00..=0xDCFF => self.cia1.write(address as u8, value),
            0xDD00..=0xDDFF => self.cia2.write(address as u8, value),
            _ => {
                if let Some((chip, reg)) = self.sid_slot(address) {
                    self.sid_writes.push((self.frame_cycle, chip, reg, value));
                }
            }
        }
    }
}

impl Bus for C64Bus {
    fn get_byte(&mut self, address: u16) -> u8 {
        let port = self.ram[0x0001];
        match address {
            0xA000..=0xBFFF if loram(port) && hiram(port) => match &self.basic {
                Some(b) => b[usize::from(address - 0xA000)],
                None => self.ram[usize::from(address)],
            },
            0xD000..=0xDFFF if io_visible(port) => self.read_io(address),
            0xD000..=0xDFFF if loram(port) || hiram(port) => match &self.chargen {
                Some(c) => c[usize::from(address - 0xD000)],
                None => self.ram[usize::from(address)],
            },
            0xE000..=0xFFFF if hiram(port) => self.kernal[usize::from(address - 0xE000)],
            _ => self.ram[usize::from(address)],
        }
    }

    fn set_byte(&mut self, address: u16, value: u8) {
        // Writes always land in RAM underneath.
        self.ram[usize::from(address)] = value;
        match address {
            0xD000..=0xDFFF if io_visible(self.ram[0x0001]) => self.write_io(address, value),
            0xE000..=0xFFFF if !self.kernal_is_rom => {
                self.kernal[usize::from(address - 0xE000)] = value;
            }
            _ => {}
        }
    }
}

/// Minimal KERNAL: RTS at the jump table, the IRQ/NMI entry sequences that
/// dispatch through $0314/$0318, a default IRQ handler that acknowledges
/// CIA 1 and the VIC, and the hardware vectors. `rom` covers $E000-$FFFF.
fn install_kernal_stubs(rom: &mut [u8]) {
    let mut put = |addr: u16, bytes: &[u8]| {
        let at = usize::from(addr - 0xE000);
        rom[at..at + bytes.len()].copy_from_slice(bytes);
    };

    for addr in (0xFF81..=0xFFDE).step_by(3) {
        put(addr, &[0x60]);
    }
    put(0xFFE1, &[0x18, 0x60]); // STOP: CLC RTS
    put(0xFFE4, &[0xA9, 0x00, 0x18, 0x60]); // GETIN: LDA #0 CLC RTS
    put(0xE544, &[0x60]);

    // IRQ entry: save registers, BRK check, JMP ($0314).
    put(
        0xFF48,
        &[
            0x48, 0x8A, 0x48, 0x98, 0x48, 0xBA, 0xBD, 0x04, 0x01, 0x29, 0x10, 0xD0, 0x03, 0x6C,
            0x14, 0x03, 0x6C, 0x16, 0x03,
        ],
    );
    // LDA $DC0D; LDA #$FF; STA $D019; INC $A2; JMP $EA81
    put(
        0xEA31,
        &[0xAD, 0x0D, 0xDC, 0xA9, 0xFF, 0x8D, 0x19, 0xD0, 0xEE, 0xA2, 0x00, 0x4C, 0x81, 0xEA],
    );
    // PLA TAY PLA TAX PLA RTI
    put(0xEA81, &[0x68, 0xA8, 0x68, 0xAA, 0x68, 0x40]);
    // NMI entry: save registers, JMP ($0318).
    put(0xFE43, &[0x48, 0x8A, 0x48, 0x98, 0x48, 0x6C, 0x18, 0x03]);
    // LDA $DD0D; JMP $EA81
    put(0xFE72, &[0xAD, 0x0D, 0xDD, 0x4C, 0x81, 0xEA]);

    put(0xFFFA, &[0x43, 0xFE, 0x00, 0xE0, 0x48, 0xFF]);
}
