// Drives the `mos6502` core over the C64 bus: cycle accounting, IRQ/NMI
// delivery (the core itself has no interrupt pins) and jam detection.

use mos6502::cpu::CPU;
use mos6502::instruction::Nmos6502;
use mos6502::registers::{StackPointer, Status};

use super::memory::C64Bus;

pub type Cpu = CPU<C64Bus, Nmos6502>;

/// Approximate base cycle counts per opcode (no page-cross penalties).
static OPCODE_CYCLES: [u8; 256] = [
    //0  1  2  3  4  5  6  7  8  9  A  B  C  D  E  F
    7, 6, 2, 8, 3, 3, 5, 5, 3, 2, 2, 2, 4, 4, 6, 6, // 0x
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7, // 1x
    6, 6, 2, 8, 3, 3, 5, 5, 4, 2, 2, 2, 4, 4, 6, 6, // 2x
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7, // 3x
    6, 6, 2, 8, 3, 3, 5, 5, 3, 2, 2, 2, 3, 4, 6, 6, // 4x
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7, // 5x
    6, 6, 2, 8, 3, 3, 5, 5, 4, 2, 2, 2, 5, 4, 6, 6, // 6x
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7, // 7x
    2, 6, 2, 6, 3, 3, 3, 3, 2, 2, 2, 2, 4, 4, 4, 4, // 8x
    2, 6, 2, 6, 4, 4, 4, 4, 2, 5, 2, 5, 5, 5, 5, 5, // 9x
    2, 6, 2, 6, 3, 3, 3, 3, 2, 2, 2, 2, 4, 4, 4, 4, // Ax
    2, 5, 2, 5, 4, 4, 4, 4, 2, 4, 2, 4, 4, 4, 4, 4, // Bx
    2, 6, 2, 8, 3, 3, 5, 5, 2, 2, 2, 2, 4, 4, 6, 6, // Cx
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7, // Dx
    2, 6, 2, 8, 3, 3, 5, 5, 2, 2, 2, 2, 4, 4, 6, 6, // Ex
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7, // Fx
];

const INTERRUPT_CYCLES: u32 = 7;

/// Opcodes that halt an NMOS 6502 until reset.
fn is_kil(opcode: u8) -> bool {
    matches!(
        opcode,
        0x02 | 0x12 | 0x22 | 0x32 | 0x42 | 0x52 | 0x62 | 0x72 | 0x92 | 0xB2 | 0xD2 | 0xF2
    )
}

/// Instructions allowed to leave PC where it was (`JMP *`, `Bxx *`).
fn may_loop_on_itself(opcode: u8) -> bool {
    matches!(opcode, 0x4C | 0x6C) || opcode & 0x1F == 0x10
}

/// The CPU executed a KIL opcode or one the core could not decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jammed(pub u16);

/// Execute one instruction. Returns the cycles it took.
pub fn step(cpu: &mut Cpu) -> Result<u32, Jammed> {
    let pc = cpu.registers.program_counter;
    let opcode = cpu.memory.peek_opcode(pc);
    if is_kil(opcode) {
        return Err(Jammed(pc));
    }
    cpu.single_step();
    if cpu.registers.program_counter == pc && !may_loop_on_itself(opcode) {
        return Err(Jammed(pc));
    }
    let cycles = u32::from(OPCODE_CYCLES[usize::from(opcode)]);
    cpu.memory.frame_cycle += cycles;
    Ok(cycles)
}

/// Run until PC reaches `halt` or `max_cycles` elapse. Used for PSID
/// INIT/PLAY calls, which need no interrupt sources.
pub fn run_until(cpu: &mut Cpu, halt: u16, max_cycles: u32) -> Result<bool, Jammed> {
    let mut done = 0;
    while done < max_cycles {
        if cpu.registers.program_counter == halt {
            return Ok(true);
        }
        done += step(cpu)?;
    }
    Ok(cpu.registers.program_counter == halt)
}

/// Continuous execution with CIA/VIC ticking and interrupt delivery.
/// `prev_nmi` carries the NMI edge detector across calls.
pub fn run_cycles(cpu: &mut Cpu, cycles: u32, prev_nmi: &mut bool) -> Result<(), Jammed> {
    let mut done = 0;
    while done < cycles {
        let mut spent = step(cpu)?;

        let stolen = tick_hardware(cpu, spent);
        spent += stolen;

        if cpu.memory.cia1.pending() || cpu.memory.vic.irq_line {
            let irq = deliver(cpu, 0xFFFE, false);
            tick_hardware(cpu, irq);
            spent += irq;
        }

        let nmi = cpu.memory.cia2.pending();
        if nmi && !*prev_nmi {
            let n = deliver(cpu, 0xFFFA, true);
            tick_hardware(cpu, n);
            spent += n;
        }
        *prev_nmi = nmi;

        done += spent;
    }
    Ok(())
}

/// Tick CIAs and VIC by `cycles`; returns bad-line cycles stolen from the
/// CPU, which the CIAs see as well.
fn tick_hardware(cpu: &mut Cpu, cycles: u32) -> u32 {
    if cycles == 0 {
        return 0;
    }
    let bus = &mut cpu.memory;
    bus.cia1.tick(cycles);
    bus.cia2.tick(cycles);
    bus.vic.tick(cycles);
    let stolen = bus.vic.stolen;
    if stolen > 0 {
        bus.cia1.tick(stolen);
        bus.cia2.tick(stolen);
        bus.frame_cycle += stolen;
    }
    if bus.vic.new_frame {
        bus.vic.new_frame = false;
        bus.tick_jiffy_clock();
    }
    stolen
}

/// Push PC and status, set I, load PC from `vector`. A maskable request
/// with I set is ignored and costs nothing.
fn deliver(cpu: &mut Cpu, vector: u16, non_maskable: bool) -> u32 {
    if !non_maskable && cpu.registers.status.contains(Status::PS_DISABLE_INTERRUPTS) {
        return 0;
    }

    let [lo, hi] = cpu.registers.program_counter.to_le_bytes();
    let status = (cpu.registers.status.bits() | 0x20) & !0x10;
    let mut sp = cpu.registers.stack_pointer.0;
    for byte in [hi, lo, status] {
        cpu.memory.ram[0x0100 | usize::from(sp)] = byte;
        sp = sp.wrapping_sub(1);
    }
    cpu.registers.stack_pointer = StackPointer(sp);
    cpu.registers.status.insert(Status::PS_DISABLE_INTERRUPTS);
    cpu.registers.program_counter = cpu.memory.read_vector(vector);

    cpu.memory.frame_cycle += INTERRUPT_CYCLES;
    INTERRUPT_CYCLES
}

/// Set up registers for a subroutine call through a trampoline.
pub fn call(cpu: &mut Cpu, trampoline: u16, accumulator: u8) {
    cpu.registers.program_counter = trampoline;
    cpu.registers.stack_pointer = StackPointer(0xFD);
    cpu.registers.accumulator = accumulator;
}

pub fn enable_interrupts(cpu: &mut Cpu) {
    cpu.registers.status.remove(Status::PS_DISABLE_INTERRUPTS);
}
