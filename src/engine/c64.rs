// ResidEngine: a C64 running the tune on the mos6502 core, its SID writes
// replayed frame by frame into resid-rs chips.

use std::collections::VecDeque;

use log::{debug, info, warn};
use mos6502::cpu::CPU;
use mos6502::instruction::Nmos6502;

use super::chips::ChipBank;
use super::cpu::{self, Cpu, Jammed};
use super::memory::C64Bus;
use super::{BuilderParams, Engine, EngineConfig};
use crate::config::{C64Model, SidModel};
use crate::roms::RomSet;
use crate::tune::Tune;

const MAX_SIDS: usize = 3;
const TRAMPOLINE: u16 = 0x0300;
/// CPU budget for a PSID INIT call: a couple of seconds of C64 time.
const INIT_BUDGET: u32 = 2_000_000;

enum Driver {
    /// INIT once, then PLAY through the trampoline every frame.
    Psid { halt: u16, cia_timed: bool },
    /// Free-running program with interrupts.
    Rsid { prev_nmi: bool, overshoot: u32 },
}

struct Machine {
    cpu: Cpu,
    chips: ChipBank,
    driver: Driver,
    frame_cycles: u32,
    jammed: bool,
}

impl Machine {
    fn boot(
        tune: &Tune,
        roms: &RomSet,
        config: &EngineConfig,
        params: &BuilderParams,
    ) -> Result<Self, String> {
        let header = &tune.header;
        let model = header
            .clock
            .resolve(config.c64_model, config.force_c64_model);
        let sid_model = header
            .sid_model
            .resolve(config.sid_model, config.force_sid_model);

        let mut bases = vec![0xD400u16];
        bases.extend(header.extra_sid_addrs.iter().copied().filter(|&a| a != 0));
        bases.truncate(params.chips.min(MAX_SIDS));

        let chips = ChipBank::new(
            bases.len(),
            sid_model,
            model.clock(),
            config.frequency,
            config.channels == 2,
            config.live,
        )?;

        let mut bus = C64Bus::new(model, roms, &bases);
        bus.load(tune.load_address, &tune.payload);
        bus.set_vector(0xFFFA, 0xFE43);

        let init = match header.init_address {
            0 => tune.load_address,
            a => a,
        };
        let is_rsid = header.is_rsid || header.play_address == 0;
        let halt = bus.install_trampoline(TRAMPOLINE, init);

        if is_rsid {
            bus.set_vector(0xFFFE, 0xFF48);
            bus.cia1.kernal_defaults(model.is_pal());
            // After INIT returns: CLI; JMP *
            bus.ram[usize::from(halt)..usize::from(halt) + 4].copy_from_slice(&[
                0x58,
                0x4C,
                (halt + 1) as u8,
                ((halt + 1) >> 8) as u8,
            ]);
        } else {
            bus.set_vector(0xFFFE, halt);
        }

        let mut cpu = CPU::new(bus, Nmos6502);
        cpu::call(&mut cpu, TRAMPOLINE, tune.current_song().saturating_sub(1) as u8);

        info!(
            "{} song {}/{}: {:?} {:?} x{}, CIA {:?}, {} Hz {}ch",
            if is_rsid { "RSID" } else { "PSID" },
            tune.current_song(),
            tune.songs(),
            model,
            sid_model,
            chips.len(),
            config.cia_model,
            config.frequency,
            config.channels,
        );

        let mut machine = Self {
            cpu,
            chips,
            driver: Driver::Rsid {
                prev_nmi: false,
                overshoot: 0,
            },
            frame_cycles: model.cycles_per_frame(),
            jammed: false,
        };

        if !is_rsid {
            let returned = cpu::run_until(&mut machine.cpu, halt, INIT_BUDGET)
                .map_err(|Jammed(pc)| format!("INIT jammed at ${pc:04X}"))?;
            if !returned {
                warn!("INIT did not return within {INIT_BUDGET} cycles");
            }
            machine.chips.poke(&machine.cpu.memory.sid_writes);
            let halt = machine
                .cpu
                .memory
                .install_trampoline(TRAMPOLINE, header.play_address);
            machine.driver = Driver::Psid {
                halt,
                cia_timed: tune.uses_cia_timer(),
            };
        }
        Ok(machine)
    }

    /// Emulate one frame and append its audio to `out`.
    fn frame(&mut self, out: &mut VecDeque<i16>) -> Result<(), Jammed> {
        self.cpu.memory.begin_frame();
        let length = match self.driver {
            Driver::Psid { halt, cia_timed } => {
                let period = psid_period(&self.cpu.memory, self.frame_cycles, cia_timed);
                cpu::call(&mut self.cpu, TRAMPOLINE, 0);
                cpu::run_until(&mut self.cpu, halt, period)?;
                period
            }
            Driver::Rsid {
                ref mut prev_nmi,
                ref mut overshoot,
            } => {
                let budget = self.frame_cycles.saturating_sub(*overshoot).max(1);
                cpu::run_cycles(&mut self.cpu, budget, prev_nmi)?;
                let ran = self.cpu.memory.frame_cycle;
                *overshoot = ran.saturating_sub(budget);
                ran
            }
        };
        self.chips
            .play_frame(&self.cpu.memory.sid_writes, length, out);
        Ok(())
    }
}

/// Length of the next PSID frame: the CIA 1 timer period when the song is
/// timer driven and the tune programmed one, else one video frame.
fn psid_period(bus: &C64Bus, frame_cycles: u32, cia_timed: bool) -> u32 {
    let latch = bus.cia1.timer_a.latch;
    if cia_timed && latch >= 0x100 {
        u32::from(latch) + 1
    } else {
        frame_cycles
    }
}

/// Engine backed by `mos6502` and `resid-rs`.
#[derive(Default)]
pub struct ResidEngine {
    roms: RomSet,
    tune: Option<Tune>,
    config: Option<EngineConfig>,
    machine: Option<Machine>,
    pending: VecDeque<i16>,
}

impl ResidEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// C64 model the loaded tune will run on with the current config.
    pub fn effective_models(&self) -> Option<(C64Model, SidModel)> {
        let tune = self.tune.as_ref()?;
        let config = self.config.as_ref()?;
        Some((
            tune.header.clock.resolve(config.c64_model, config.force_c64_model),
            tune.header.sid_model.resolve(config.sid_model, config.force_sid_model),
        ))
    }
}

impl Engine for ResidEngine {
    fn set_roms(&mut self, roms: &RomSet) {
        self.roms = roms.clone();
    }

    fn load(&mut self, tune: &Tune) -> Result<(), String> {
        if tune.payload.is_empty() {
            return Err("tune has no payload".into());
        }
        if !tune.header.is_rsid && tune.header.init_address == 0 && tune.load_address == 0 {
            return Err("tune has no entry point".into());
        }
        self.machine = None;
        self.pending.clear();
        self.tune = Some(tune.clone());
        Ok(())
    }

    fn max_sids(&self) -> usize {
        MAX_SIDS
    }

    fn configure(&mut self, config: &EngineConfig) -> Result<(), String> {
        if config.frequency == 0 {
            return Err("output frequency is zero".into());
        }
        if !(1..=2).contains(&config.channels) {
            return Err(format!("unsupported channel count {}", config.channels));
        }
        if let Some(machine) = self.machine.as_mut() {
            machine.chips.apply(config.live, false);
            debug!("live settings updated: {:?}", config.live);
        }
        self.config = Some(*config);
        Ok(())
    }

    fn build(&mut self, params: &BuilderParams) -> Result<(), String> {
        params.validate()?;
        let tune = self.tune.as_ref().ok_or("no tune loaded")?;
        let config = self.config.as_ref().ok_or("engine not configured")?;
        debug!(
            "building {:?} backend: curves {}/{}, bias {} mV",
            params.emulation, params.curve_6581, params.curve_8580, params.bias
        );
        let mut machine = Machine::boot(tune, &self.roms, config, params)?;
        machine.chips.apply(
            super::LiveSettings {
                filter: params.filter && config.live.filter,
                ..config.live
            },
            false,
        );
        self.pending.clear();
        self.machine = Some(machine);
        Ok(())
    }

    fn render(&mut self, out: &mut [i16]) -> usize {
        while self.pending.len() < out.len() {
            let Some(machine) = self.machine.as_mut() else {
                break;
            };
            if machine.jammed {
                break;
            }
            if let Err(Jammed(pc)) = machine.frame(&mut self.pending) {
                warn!("CPU jammed at ${pc:04X}, tune stopped");
                machine.jammed = true;
            }
        }
        let n = out.len().min(self.pending.len());
        for (dst, src) in out.iter_mut().zip(self.pending.drain(..n)) {
            *dst = src;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Emulation, SessionConfig};
    use crate::tune::build_psid;

    fn config(channels: u32) -> EngineConfig {
        EngineConfig::from_session(&SessionConfig::default(), 44_100, channels)
    }

    fn params() -> BuilderParams {
        BuilderParams {
            emulation: Emulation::ResidFp,
            chips: MAX_SIDS,
            filter: true,
            curve_6581: 0.5,
            curve_8580: 0.5,
            bias: 0.5,
        }
    }

    fn engine_for(image: &[u8], channels: u32) -> ResidEngine {
        let tune = Tune::parse(image).unwrap();
        let mut engine = ResidEngine::new();
        engine.set_roms(&RomSet::new());
        engine.load(&tune).unwrap();
        engine.configure(&config(channels)).unwrap();
        engine.build(&params()).unwrap();
        engine
    }

    // $1000 INIT: LDA #$0F; STA $D418; LDA #$11; STA $D404; RTS
    // $100B PLAY: INC $D401; RTS
    const PLAYER: [u8; 15] = [
        0xA9, 0x0F, 0x8D, 0x18, 0xD4, 0xA9, 0x11, 0x8D, 0x04, 0xD4, 0x60, 0xEE, 0x01, 0xD4,
        0x60,
    ];

    #[test]
    fn psid_renders_full_blocks() {
        let img = build_psid(0x1000, 0x1000, 0x100B, 1, &PLAYER);
        let mut engine = engine_for(&img, 1);
        let mut out = [0i16; 2048];
        for _ in 0..10 {
            assert_eq!(engine.render(&mut out), out.len());
        }
    }

    #[test]
    fn stereo_renders_even_counts() {
        let img = build_psid(0x1000, 0x1000, 0x100B, 1, &PLAYER);
        let mut engine = engine_for(&img, 2);
        let mut out = [0i16; 1000];
        assert_eq!(engine.render(&mut out), 1000);
    }

    #[test]
    fn jam_in_play_ends_output() {
        // PLAY executes KIL.
        let img = build_psid(0x1000, 0x1000, 0x1001, 1, &[0x60, 0x02]);
        let mut engine = engine_for(&img, 1);
        let mut out = [0i16; 2048];
        assert_eq!(engine.render(&mut out), 0);
        assert_eq!(engine.render(&mut out), 0);
    }

    #[test]
    fn jam_in_init_fails_build() {
        let img = build_psid(0x1000, 0x1000, 0x1001, 1, &[0x02, 0x60]);
        let tune = Tune::parse(&img).unwrap();
        let mut engine = ResidEngine::new();
        engine.load(&tune).unwrap();
        engine.configure(&config(1)).unwrap();
        assert!(engine.build(&params()).is_err());
    }

    #[test]
    fn build_needs_tune_and_config() {
        let mut engine = ResidEngine::new();
        assert!(engine.build(&params()).is_err());
        let img = build_psid(0x1000, 0x1000, 0x100B, 1, &PLAYER);
        engine.load(&Tune::parse(&img).unwrap()).unwrap();
        assert!(engine.build(&params()).is_err());
        assert_eq!(engine.render(&mut [0i16; 16]), 0);
    }

    #[test]
    fn configure_rejects_bad_formats() {
        let mut engine = ResidEngine::new();
        let mut cfg = config(1);
        cfg.channels = 3;
        assert!(engine.configure(&cfg).is_err());
        cfg.channels = 1;
        cfg.frequency = 0;
        assert!(engine.configure(&cfg).is_err());
    }

    #[test]
    fn live_reconfigure_keeps_playing() {
        let img = build_psid(0x1000, 0x1000, 0x100B, 1, &PLAYER);
        let mut engine = engine_for(&img, 1);
        let mut out = [0i16; 512];
        assert_eq!(engine.render(&mut out), 512);
        let mut cfg = config(1);
        cfg.live.filter = false;
        cfg.live.digi_boost = true;
        engine.configure(&cfg).unwrap();
        assert_eq!(engine.render(&mut out), 512);
    }

    #[test]
    fn rsid_runs_interrupt_driven_player() {
        // INIT: install IRQ handler at $1010, CLI, RTS.
        // Handler: INC $FB; LDA $DC0D; JMP $EA81
        let mut code = vec![0u8; 0x20];
        code[..11].copy_from_slice(&[
            0xA9, 0x10, 0x8D, 0x14, 0x03, 0xA9, 0x10, 0x8D, 0x15, 0x03, 0x60,
        ]);
        code[0x10..0x18].copy_from_slice(&[0xE6, 0xFB, 0xAD, 0x0D, 0xDC, 0x4C, 0x81, 0xEA]);
        let mut img = build_psid(0x1000, 0x1000, 0, 1, &code);
        img[0..4].copy_from_slice(b"RSID");

        let tune = Tune::parse(&img).unwrap();
        let mut engine = ResidEngine::new();
        engine.load(&tune).unwrap();
        engine.configure(&config(1)).unwrap();
        engine.build(&params()).unwrap();

        let mut out = [0i16; 4096];
        assert_eq!(engine.render(&mut out), 4096);
        let machine = engine.machine.as_ref().unwrap();
        assert!(!machine.jammed);
        // The handler ran at least once per 60 Hz tick.
        assert!(machine.cpu.memory.ram[0xFB] > 3);
    }

    #[test]
    fn header_models_apply_unless_forced() {
        let mut img = build_psid(0x1000, 0x1000, 0x100B, 1, &PLAYER);
        // flags: NTSC, 8580
        img[0x77] = 0x28;
        let tune = Tune::parse(&img).unwrap();
        let mut engine = ResidEngine::new();
        engine.load(&tune).unwrap();
        engine.configure(&config(1)).unwrap();
        assert_eq!(
            engine.effective_models(),
            Some((C64Model::Ntsc, SidModel::Mos8580))
        );

        let mut cfg = config(1);
        cfg.force_c64_model = true;
        cfg.force_sid_model = true;
        engine.configure(&cfg).unwrap();
        assert_eq!(
            engine.effective_models(),
            Some((C64Model::Pal, SidModel::Mos6581))
        );
    }
}
