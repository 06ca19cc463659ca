// VIC-II as far as a music player sees it: the raster counter, the raster
// compare interrupt and the cycles stolen on bad lines.

use crate::config::C64Model;

const FIRST_DMA_LINE: u16 = 0x30;
const LAST_DMA_LINE: u16 = 0xF7;
const BADLINE_CYCLES: u32 = 40;

pub struct Vic {
    raster: u16,
    pub raster_compare: u16,
    pub raster_irq_enabled: bool,
    irq_status: u8,
    line_cycle: u32,
    cycles_per_line: u32,
    lines: u16,
    regs: [u8; 0x40],
    /// Asserted IRQ output.
    pub irq_line: bool,
    /// Bad-line cycles accumulated by the last `tick`.
    pub stolen: u32,
    /// Set when the raster wrapped; cleared by the caller.
    pub new_frame: bool,
}

impl Vic {
    pub fn new(model: C64Model) -> Self {
        let (cycles_per_line, lines) = match model {
            C64Model::Pal => (63, 312),
            C64Model::Ntsc => (65, 263),
            C64Model::OldNtsc => (64, 262),
            C64Model::Drean => (65, 312),
            C64Model::PalM => (65, 263),
        };
        let mut regs = [0u8; 0x40];
        regs[0x11] = 0x1B;
        regs[0x16] = 0xC8;
        regs[0x18] = 0x14;
        Self {
            raster: 0,
            raster_compare: 0x137,
            raster_irq_enabled: false,
            irq_status: 0,
            line_cycle: 0,
            cycles_per_line,
            lines,
            regs,
            irq_line: false,
            stolen: 0,
            new_frame: false,
        }
    }

    fn is_badline(&self) -> bool {
        let d011 = self.regs[0x11];
        d011 & 0x10 != 0
            && (FIRST_DMA_LINE..=LAST_DMA_LINE).contains(&self.raster)
            && (self.raster & 7) == u16::from(d011 & 7)
    }

    pub fn tick(&mut self, cycles: u32) {
        self.stolen = 0;
        self.line_cycle += cycles;
        while self.line_cycle >= self.cycles_per_line {
            self.line_cycle -= self.cycles_per_line;
            self.raster += 1;
            if self.raster >= self.lines {
                self.raster = 0;
                self.new_frame = true;
            }
            if self.is_badline() {
                self.stolen += BADLINE_CYCLES;
            }
            if self.raster == self.raster_compare {
                self.irq_status |= 0x01;
                if self.raster_irq_enabled {
                    self.irq_status |= 0x80;
                    self.irq_line = true;
                }
            }
        }
    }

    pub fn read(&self, reg: u16) -> u8 {
        let r = usize::from(reg & 0x3F);
        match r {
            0x11 => (self.regs[0x11] & 0x7F) | if self.raster > 0xFF { 0x80 } else { 0 },
            0x12 => self.raster as u8,
            0x19 => self.irq_status | 0x70,
            0x1A => self.regs[0x1A] | 0xF0,
            0x1E | 0x1F => 0,
            0x2F..=0x3F => 0xFF,
            _ => self.regs[r],
        }
    }

    pub fn write(&mut self, reg: u16, value: u8) {
        let r = usize::from(reg & 0x3F);
        self.regs[r] = value;
        match r {
            0x11 => {
                self.raster_compare = (self.raster_compare & 0x00FF) | (u16::from(value & 0x80) << 1);
            }
            0x12 => self.raster_compare = (self.raster_compare & 0x0100) | u16::from(value),
            0x19 => {
                self.irq_status &= !(value & 0x0F);
                if self.irq_status & 0x0F == 0 {
                    self.irq_status = 0;
                    self.irq_line = false;
                }
            }
            0x1A => {
                self.raster_irq_enabled = value & 0x01 != 0;
                if self.raster_irq_enabled && self.irq_status & 0x01 != 0 {
                    self.irq_status |= 0x80;
                    self.irq_line = true;
                }
            }
            _ => {}
        }
    }
}
