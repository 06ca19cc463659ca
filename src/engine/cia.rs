// MOS 6526 complex interface adapter: the two interval timers, the
// interrupt control register and the data ports. CIA 1 drives the IRQ
// line, CIA 2 drives NMI.

const ICR_TA: u8 = 0x01;
const ICR_TB: u8 = 0x02;
const ICR_SOURCES: u8 = 0x1F;

/// One 16-bit interval timer.
#[derive(Debug, Clone)]
pub struct Timer {
    pub counter: u16,
    pub latch: u16,
    pub running: bool,
    pub one_shot: bool,
}

impl Default for Timer {
    fn default() -> Self {
        Self {
            counter: 0xFFFF,
            latch: 0xFFFF,
            running: false,
            one_shot: false,
        }
    }
}

impl Timer {
    /// Count down `cycles` phi2 clocks and return how many times the
    /// counter passed zero.
    fn advance(&mut self, cycles: u32) -> u32 {
        let mut left = cycles;
        let mut underflows = 0;
        while self.running && left > 0 {
            let to_zero = u32::from(self.counter) + 1;
            if left < to_zero {
                self.counter -= left as u16;
                break;
            }
            left -= to_zero;
            underflows += 1;
            self.counter = self.latch;
            if self.one_shot {
                self.running = false;
            }
        }
        underflows
    }

    fn control(&mut self, value: u8) {
        let start = value & 0x01 != 0;
        if (start && !self.running) || value & 0x10 != 0 {
            self.counter = self.latch;
        }
        self.running = start;
        self.one_shot = value & 0x08 != 0;
    }

    fn set_latch_hi(&mut self, value: u8) {
        self.latch = (self.latch & 0x00FF) | (u16::from(value) << 8);
        if !self.running {
            self.counter = self.latch;
        }
    }
}

pub struct Cia {
    pub timer_a: Timer,
    pub timer_b: Timer,
    pub icr_mask: u8,
    icr_data: u8,
    line: bool,
    cra: u8,
    crb: u8,
    port_a: u8,
    port_b: u8,
    ddr_a: u8,
    ddr_b: u8,
    tod: [u8; 4],
    tod_cycles: u32,
}

impl Cia {
    pub fn new() -> Self {
        Self {
            timer_a: Timer::default(),
            timer_b: Timer::default(),
            icr_mask: 0,
            icr_data: 0,
            line: false,
            cra: 0,
            crb: 0,
            port_a: 0xFF,
            port_b: 0xFF,
            ddr_a: 0,
            ddr_b: 0,
            tod: [0, 0, 0, 0x01],
            tod_cycles: 0,
        }
    }

    /// Timer A free-running at the KERNAL's 60 Hz jiffy rate with its
    /// interrupt enabled, which is what an RSID tune expects at entry.
    pub fn kernal_defaults(&mut self, pal: bool) {
        let latch = if pal { 0x4025 } else { 0x4295 };
        self.timer_a.latch = latch;
        self.timer_a.counter = latch;
        self.timer_a.running = true;
        self.timer_a.one_shot = false;
        self.cra = 0x01;
        self.icr_mask = ICR_TA;
    }

    pub fn tick(&mut self, cycles: u32) {
        let a = self.timer_a.advance(cycles);
        let b = if self.crb & 0x40 != 0 {
            // Timer B counts timer A underflows.
            self.timer_b.advance(a)
        } else {
            self.timer_b.advance(cycles)
        };
        if a > 0 {
            self.icr_data |= ICR_TA;
        }
        if b > 0 {
            self.icr_data |= ICR_TB;
        }
        if self.icr_data & self.icr_mask != 0 {
            self.line = true;
        }

        // TOD runs at 10 Hz off a nominal 1 MHz clock.
        self.tod_cycles += cycles;
        while self.tod_cycles >= 100_000 {
            self.tod_cycles -= 100_000;
            self.advance_tod();
        }
    }

    fn advance_tod(&mut self) {
        self.tod[0] = (self.tod[0] + 1) % 10;
        if self.tod[0] != 0 {
            return;
        }
        self.tod[1] = bcd_inc(self.tod[1], 0x59);
        if self.tod[1] != 0 {
            return;
        }
        self.tod[2] = bcd_inc(self.tod[2], 0x59);
        if self.tod[2] == 0 {
            self.tod[3] = bcd_inc(self.tod[3], 0x12);
        }
    }

    /// Interrupt output asserted.
    pub fn pending(&self) -> bool {
        self.line && self.icr_data & self.icr_mask != 0
    }

    /// Drop underflow flags of stopped timers so a stale, unacknowledged
    /// flag left behind by INIT does not hold the line low forever.
    pub fn clear_stale(&mut self) {
        if !self.timer_a.running {
            self.icr_data &= !ICR_TA;
        }
        if !self.timer_b.running {
            self.icr_data &= !ICR_TB;
        }
        if self.icr_data & self.icr_mask == 0 {
            self.line = false;
        }
    }

    pub fn write(&mut self, reg: u8, value: u8) {
        match reg & 0x0F {
            0x0 => self.port_a = value,
            0x1 => self.port_b = value,
            0x2 => self.ddr_a = value,
            0x3 => self.ddr_b = value,
            0x4 => self.timer_a.latch = (self.timer_a.latch & 0xFF00) | u16::from(value),
            0x5 => self.timer_a.set_latch_hi(value),
            0x6 => self.timer_b.latch = (self.timer_b.latch & 0xFF00) | u16::from(value),
            0x7 => self.timer_b.set_latch_hi(value),
            r @ 0x8..=0xB => self.tod[usize::from(r - 0x8)] = value,
            0xD => {
                if value & 0x80 != 0 {
                    self.icr_mask |= value & ICR_SOURCES;
                } else {
                    self.icr_mask &= !(value & ICR_SOURCES);
                }
                if self.icr_data & self.icr_mask != 0 {
                    self.line = true;
                }
            }
            0xE => {
                self.cra = value & !0x10;
                self.timer_a.control(value);
            }
            0xF => {
                self.crb = value & !0x10;
                self.timer_b.control(value);
            }
            _ => {}
        }
    }

    pub fn read(&mut self, reg: u8) -> u8 {
        match reg & 0x0F {
            // No keyboard or joystick: undriven inputs float high.
            0x0 => (self.port_a & self.ddr_a) | !self.ddr_a,
            0x1 => (self.port_b & self.ddr_b) | !self.ddr_b,
            0x2 => self.ddr_a,
            0x3 => self.ddr_b,
            0x4 => self.timer_a.counter as u8,
            0x5 => (self.timer_a.counter >> 8) as u8,
            0x6 => self.timer_b.counter as u8,
            0x7 => (self.timer_b.counter >> 8) as u8,
            r @ 0x8..=0xB => self.tod[usize::from(r - 0x8)],
            0xD => {
                let value = self.icr_data | if self.line { 0x80 } else { 0 };
                self.icr_data = 0;
                self.line = false;
                value
            }
            0xE => self.cra,
            0xF => self.crb,
            _ => 0,
        }
    }
}

fn bcd_inc(value: u8, max: u8) -> u8 {
    let mut lo = (value & 0x0F) + 1;
    let mut hi = value >> 4;
    if lo > 9 {
        lo = 0;
        hi += 1;
    }
    let next = (hi << 4) | lo;
    if next > max {
        0
    } else {
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_a_underflow_raises_line() {
        let mut cia = Cia::new();
        cia.write(0x4, 0x10);
        cia.write(0x5, 0x00);
        cia.write(0xD, 0x81);
        cia.write(0xE, 0x01);
        cia.tick(0x10);
        assert!(!cia.pending());
        cia.tick(1);
        assert!(cia.pending());
        // Reading the ICR acknowledges.
        assert_eq!(cia.read(0xD), 0x81);
        assert!(!cia.pending());
        assert_eq!(cia.timer_a.counter, 0x10);
    }

    #[test]
    fn masked_source_does_not_interrupt() {
        let mut cia = Cia::new();
        cia.write(0x4, 0x01);
        cia.write(0x5, 0x00);
        cia.write(0xE, 0x01);
        cia.tick(100);
        assert!(!cia.pending());
        assert_eq!(cia.read(0xD) & ICR_TA, ICR_TA);
    }

    #[test]
    fn one_shot_stops_after_underflow() {
        let mut cia = Cia::new();
        cia.write(0x4, 0x04);
        cia.write(0x5, 0x00);
        cia.write(0xE, 0x09);
        cia.tick(20);
        assert!(!cia.timer_a.running);
    }

    #[test]
    fn timer_b_counts_timer_a() {
        let mut cia = Cia::new();
        cia.write(0x4, 0x09);
        cia.write(0x5, 0x00);
        cia.write(0x6, 0x01);
        cia.write(0x7, 0x00);
        cia.write(0xD, 0x82);
        cia.write(0xF, 0x41);
        cia.write(0xE, 0x01);
        cia.tick(10);
        assert!(!cia.pending());
        cia.tick(10);
        assert!(cia.pending());
    }

    #[test]
    fn stale_flags_cleared_for_stopped_timers() {
        let mut cia = Cia::new();
        cia.kernal_defaults(true);
        cia.tick(0x5000);
        assert!(cia.pending());
        cia.write(0xE, 0x00);
        cia.clear_stale();
        assert!(!cia.pending());
    }

    #[test]
    fn bcd_wraps() {
        assert_eq!(bcd_inc(0x09, 0x59), 0x10);
        assert_eq!(bcd_inc(0x59, 0x59), 0x00);
        assert_eq!(bcd_inc(0x12, 0x12), 0x00);
    }
}
