//! A simulated target behind the scan queue, for tests.
//!
//! [`FakeJtag`] answers IR and DR scans like a 0.13 DTM, or a 0.11 one. The
//! [`MockDebugModule`] behind it runs abstract commands, the program buffer,
//! Debug RAM programs and system bus accesses against [`MockHart`]s and a
//! [`MockMemory`]. Resumed harts run code from memory
//! with a small RV32I/RV64I interpreter until they halt or stop making progress.
#![allow(missing_docs)] // Don't require docs for test code

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use bitvec::prelude::*;

use crate::assembly::{C_EBREAK, EBREAK};
use crate::dm::registers::{
    Abstractauto, Abstractcs, Authdata, Command, DebugRegister, Dmcontrol, Dmcs2, Dmstatus,
    Haltsum0, Hartinfo, Hawindow, Hawindowsel, Sbaddress0, Sbaddress1, Sbcs, Sbdata0, Sbdata1,
    DATA0_ADDRESS, DATA_MAX, PROGBUF0_ADDRESS, PROGBUF_MAX,
};
use crate::dtm::{DBUS_ADDRESS_BIT_OFFSET, DMI_ADDRESS, DMI_ADDRESS_BIT_OFFSET, DTMCS_ADDRESS};
use crate::legacy::{dram_address, DCSR_HALT, DEBUG_RAM_ADDRESS, DEBUG_ROM_RESUME};
use crate::registers::csr;
use crate::transport::{dr_bits, JtagAccess, TapPosition, TransportError};

const IDCODE_ADDRESS: u32 = 0x1;

/// IDCODE reported by the fake TAP.
pub const FAKE_IDCODE: u32 = 0x2000_0913;

/// Base of the RAM every [`MockDebugModule`] starts with.
pub const RAM_BASE: u64 = 0x8000_0000;

/// Size of that RAM.
pub const RAM_SIZE: usize = 0x1_0000;

const ABITS: u32 = 7;

const DMI_STATUS_OK: u8 = 0;
const DMI_STATUS_BUSY: u8 = 3;

const CMDERR_BUSY: u32 = 1;
const CMDERR_NOT_SUPPORTED: u32 = 2;
const CMDERR_EXCEPTION: u32 = 3;
const CMDERR_HALT_RESUME: u32 = 4;
const CMDERR_BUS: u32 = 5;

const SBERROR_BAD_ADDRESS: u32 = 2;
const SBERROR_BAD_SIZE: u32 = 4;

pub const CAUSE_EBREAK: u32 = 1;
pub const CAUSE_TRIGGER: u32 = 2;
pub const CAUSE_HALTREQ: u32 = 3;
pub const CAUSE_STEP: u32 = 4;
pub const CAUSE_RESETHALTREQ: u32 = 5;
pub const CAUSE_GROUP: u32 = 6;

/// `debugver` 4 in M-mode.
const DCSR_RESET: u32 = 4 << 28 | 3;
/// `dcsr` bits a debugger can change.
const DCSR_WRITABLE: u32 = 1 << 17
    | 1 << 16
    | 1 << 15
    | 1 << 13
    | 1 << 12
    | 1 << 11
    | 1 << 10
    | 1 << 9
    | 1 << 5
    | 1 << 4
    | 1 << 2
    | DCSR_HALT
    | 0x3;
const DCSR_STEP: u32 = 1 << 2;

/// Instructions a resumed hart runs before the simulation gives up on it.
const RUN_BUDGET: usize = 10_000;
/// Instructions a program buffer run may take.
const PROGBUF_BUDGET: usize = 64;

/// `dbus` addresses of a 0.11 Debug Module.
const DBUS_DMCONTROL: usize = 0x10;
const DBUS_DMINFO: usize = 0x11;
const DBUS_INTERRUPT: u64 = 1 << 33;
const DBUS_HALTNOT: u64 = 1 << 32;
const DBUS_DATA_MASK: u128 = (1 << 34) - 1;
/// Largest Debug RAM the fake implements.
const DRAM_MAX: usize = 64;

/// `jal zero, 0`
pub const JUMP_TO_SELF: u32 = 0x0000_006f;

/// `vlenb` of harts with the V extension.
pub const VLENB: usize = 16;

/// `misa` bits of the extensions named by `letters`.
pub fn extensions(letters: &str) -> u64 {
    letters
        .bytes()
        .filter(u8::is_ascii_uppercase)
        .fold(0, |misa, letter| misa | 1 << (letter - b'A'))
}

/// A block of target memory.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    pub base: u64,
    pub data: Vec<u8>,
    pub writable: bool,
}

/// The physical address space seen by the harts and the system bus.
///
/// Accesses outside of every region fault. Writes to read-only regions are
/// dropped.
#[derive(Debug, Clone, Default)]
pub struct MockMemory {
    pub regions: Vec<MemoryRegion>,
}

impl MockMemory {
    pub fn add_ram(&mut self, base: u64, size: usize) {
        self.regions.push(MemoryRegion {
            base,
            data: vec![0; size],
            writable: true,
        });
    }

    pub fn add_rom(&mut self, base: u64, contents: &[u8]) {
        self.regions.push(MemoryRegion {
            base,
            data: contents.to_vec(),
            writable: false,
        });
    }

    fn find(&self, address: u64, len: usize) -> Option<(usize, usize)> {
        self.regions.iter().enumerate().find_map(|(index, region)| {
            let offset = usize::try_from(address.checked_sub(region.base)?).ok()?;
            (offset.checked_add(len)? <= region.data.len()).then_some((index, offset))
        })
    }

    pub fn read(&self, address: u64, buffer: &mut [u8]) -> bool {
        match self.find(address, buffer.len()) {
            Some((index, offset)) => {
                buffer.copy_from_slice(&self.regions[index].data[offset..offset + buffer.len()]);
                true
            }
            None => false,
        }
    }

    pub fn write(&mut self, address: u64, data: &[u8]) -> bool {
        match self.find(address, data.len()) {
            Some((index, offset)) => {
                let region = &mut self.regions[index];
                if region.writable {
                    region.data[offset..offset + data.len()].copy_from_slice(data);
                } else {
                    tracing::trace!("MockMemory: dropping write to ROM at {:#x}", address);
                }
                true
            }
            None => false,
        }
    }

    /// Place `data` at `address`, even in ROM.
    pub fn load(&mut self, address: u64, data: &[u8]) -> bool {
        match self.find(address, data.len()) {
            Some((index, offset)) => {
                self.regions[index].data[offset..offset + data.len()].copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    /// Place instructions at `address`.
    pub fn load_words(&mut self, address: u64, words: &[u32]) -> bool {
        let bytes: Vec<u8> = words.iter().flat_map(|word| word.to_le_bytes()).collect();
        self.load(address, &bytes)
    }

    pub fn read_value(&self, address: u64, size: usize) -> Option<u64> {
        let mut bytes = [0u8; 8];
        self.read(address, &mut bytes[..size]).then(|| u64::from_le_bytes(bytes))
    }

    pub fn write_value(&mut self, address: u64, size: usize, value: u64) -> bool {
        self.write(address, &value.to_le_bytes()[..size])
    }

    pub fn read_u32(&self, address: u64) -> Option<u32> {
        self.read_value(address, 4).map(|value| value as u32)
    }
}

/// One trigger of a [`MockHart`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockTrigger {
    /// Supported trigger types, as reported by `tinfo`.
    pub tinfo: u32,
    /// Supported `match` values, one bit each.
    pub match_kinds: u32,
    pub tdata1: u64,
    pub tdata2: u64,
}

impl MockTrigger {
    /// A match control trigger supporting equal, NAPOT, greater-equal and less-than.
    pub fn mcontrol() -> Self {
        Self {
            tinfo: 1 << 2,
            match_kinds: 0b1111,
            tdata1: 0,
            tdata2: 0,
        }
    }

    /// A `mcontrol6` trigger supporting equal, NAPOT, greater-equal and less-than.
    pub fn mcontrol6() -> Self {
        Self {
            tinfo: 1 << 6,
            match_kinds: 0b1111,
            tdata1: 0,
            tdata2: 0,
        }
    }

    /// Only exact address matches.
    pub fn equal_only(mut self) -> Self {
        self.match_kinds = 0b1;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Execute,
    Load,
    Store,
}

impl Access {
    fn bit(self) -> u64 {
        match self {
            Self::Load => 1 << 0,
            Self::Store => 1 << 1,
            Self::Execute => 1 << 2,
        }
    }
}

/// What a running hart did with one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Retired,
    Halt(u32),
    /// An exception. The simulated hart doesn't take traps, it just stays put.
    Stuck,
}

/// A simulated hart.
#[derive(Debug, Clone)]
pub struct MockHart {
    pub xlen: u32,
    pub misa: u64,
    pub gprs: [u64; 32],
    pub fprs: [u64; 32],
    /// Vector registers, [`VLENB`] bytes each when the hart has V.
    pub vregs: Vec<Vec<u8>>,
    /// Doubles as `dpc` while halted.
    pub pc: u64,
    pub dcsr: u32,
    pub csrs: BTreeMap<u16, u64>,
    pub triggers: Vec<MockTrigger>,
    pub tselect: usize,
    /// Whether `tinfo` can be read.
    pub tinfo_readable: bool,
    pub halted: bool,
    pub resumeack: bool,
    pub havereset: bool,
    pub resethaltreq: bool,
    pub in_reset: bool,
    pub unavailable: bool,
    pub group: u32,
    pub reset_pc: u64,
    /// Instructions retired while running.
    pub retired: u64,
}

impl MockHart {
    pub fn new(xlen: u32, misa: u64) -> Self {
        let mut csrs = BTreeMap::new();
        for number in [
            csr::MSTATUS,
            csr::MIE,
            csr::MTVEC,
            csr::MSCRATCH,
            csr::MEPC,
            csr::MCAUSE,
            csr::MTVAL,
            csr::MIP,
            csr::DSCRATCH0,
            csr::DSCRATCH1,
            csr::MHARTID,
        ] {
            csrs.insert(number, 0);
        }
        if misa & extensions("S") != 0 {
            csrs.insert(csr::SATP, 0);
        }
        if misa & extensions("H") != 0 {
            csrs.insert(csr::HSTATUS, 0);
            csrs.insert(csr::HGATP, 0);
            csrs.insert(csr::VSATP, 0);
        }
        let vector = misa & extensions("V") != 0;
        if misa & extensions("FD") != 0 {
            csrs.insert(csr::FCSR, 0);
        }
        if vector {
            csrs.insert(csr::VL, 0);
            csrs.insert(csr::VTYPE, 0);
            csrs.insert(csr::VLENB, VLENB as u64);
        }

        Self {
            xlen,
            misa,
            gprs: [0; 32],
            fprs: [0; 32],
            vregs: if vector {
                vec![vec![0; VLENB]; 32]
            } else {
                Vec::new()
            },
            pc: RAM_BASE,
            dcsr: DCSR_RESET,
            csrs,
            triggers: Vec::new(),
            tselect: 0,
            tinfo_readable: true,
            halted: false,
            resumeack: false,
            havereset: true,
            resethaltreq: false,
            in_reset: false,
            unavailable: false,
            group: 0,
            reset_pc: RAM_BASE,
            retired: 0,
        }
    }

    pub fn rv32() -> Self {
        Self::new(32, 1 << 30 | extensions("IMASU"))
    }

    pub fn rv64() -> Self {
        Self::new(64, 2 << 62 | extensions("IMASU"))
    }

    pub fn with_triggers(mut self, triggers: Vec<MockTrigger>) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn halted(mut self) -> Self {
        self.halted = true;
        self.dcsr = self.dcsr & !(0x7 << 6) | CAUSE_HALTREQ << 6;
        self
    }

    /// `dcsr.cause` of the last halt.
    pub fn cause(&self) -> u32 {
        (self.dcsr >> 6) & 0x7
    }

    fn mask(&self, value: u64) -> u64 {
        if self.xlen == 32 {
            value & 0xffff_ffff
        } else {
            value
        }
    }

    fn signed(&self, value: u64) -> i64 {
        if self.xlen == 32 {
            value as u32 as i32 as i64
        } else {
            value as i64
        }
    }

    pub fn gpr(&self, index: usize) -> u64 {
        self.gprs[index]
    }

    pub fn set_gpr(&mut self, index: usize, value: u64) {
        if index != 0 {
            self.gprs[index] = self.mask(value);
        }
    }

    /// Width of the FPRs, 0 without F or D.
    pub fn flen(&self) -> u32 {
        if self.misa & extensions("D") != 0 {
            64
        } else if self.misa & extensions("F") != 0 {
            32
        } else {
            0
        }
    }

    /// Write an FPR. Narrower values are NaN-boxed.
    pub fn set_fpr(&mut self, index: usize, value: u64, bits: u32) {
        self.fprs[index] = if bits < self.flen() {
            value & 0xffff_ffff | 0xffff_ffff_0000_0000
        } else {
            value
        };
    }

    fn priv_bit(&self) -> u64 {
        match self.dcsr & 0x3 {
            3 => 1 << 6,
            1 => 1 << 4,
            _ => 1 << 3,
        }
    }

    pub fn read_csr(&self, number: u16) -> Option<u64> {
        let trigger = self.triggers.get(self.tselect);
        match number {
            csr::MISA => Some(self.misa),
            csr::DCSR => Some(u64::from(self.dcsr)),
            csr::DPC => Some(self.pc),
            csr::TSELECT => (!self.triggers.is_empty()).then_some(self.tselect as u64),
            csr::TDATA1 => trigger.map(|trigger| trigger.tdata1),
            csr::TDATA2 => trigger.map(|trigger| trigger.tdata2),
            csr::TINFO if self.tinfo_readable => trigger.map(|trigger| u64::from(trigger.tinfo)),
            csr::TINFO => None,
            number => self.csrs.get(&number).copied(),
        }
    }

    /// Write a CSR. `false` if it doesn't exist.
    pub fn write_csr(&mut self, number: u16, value: u64) -> bool {
        let value = self.mask(value);
        match number {
            csr::MISA => true,
            csr::DCSR => {
                self.dcsr = self.dcsr & !DCSR_WRITABLE | value as u32 & DCSR_WRITABLE;
                true
            }
            csr::DPC => {
                self.pc = value & !1;
                true
            }
            csr::TSELECT => {
                if (value as usize) < self.triggers.len() {
                    self.tselect = value as usize;
                }
                !self.triggers.is_empty()
            }
            csr::TDATA1 => {
                let xlen = self.xlen;
                match self.triggers.get_mut(self.tselect) {
                    Some(trigger) => {
                        trigger.tdata1 = accept_tdata1(trigger, value, xlen);
                        true
                    }
                    None => false,
                }
            }
            csr::TDATA2 => match self.triggers.get_mut(self.tselect) {
                Some(trigger) => {
                    trigger.tdata2 = value;
                    true
                }
                None => false,
            },
            csr::TINFO => self.tinfo_readable && !self.triggers.is_empty(),
            number => match self.csrs.get_mut(&number) {
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => false,
            },
        }
    }

    fn reset(&mut self) {
        self.gprs = [0; 32];
        self.fprs = [0; 32];
        self.pc = self.reset_pc;
        self.dcsr = DCSR_RESET;
        for value in self.csrs.values_mut() {
            *value = 0;
        }
        for trigger in &mut self.triggers {
            trigger.tdata1 = 0;
            trigger.tdata2 = 0;
        }
        self.tselect = 0;
        self.halted = false;
        self.resumeack = false;
        self.havereset = true;
    }

    fn enter_debug(&mut self, cause: u32) {
        tracing::debug!("MockHart: halting at {:#x}, cause {}", self.pc, cause);
        self.halted = true;
        self.dcsr = self.dcsr & !(0x7 << 6) | (cause & 0x7) << 6;
    }

    fn trigger_matches(&self, index: usize, access: Access, address: u64) -> bool {
        let trigger = &self.triggers[index];
        let tdata1 = trigger.tdata1;
        let kind = tdata1_kind(tdata1, self.xlen);

        if kind != 2 && kind != 6 {
            return false;
        }
        // Only triggers that enter debug mode.
        if (tdata1 >> 12) & 0xf != 1 {
            return false;
        }
        if tdata1 & access.bit() == 0 || tdata1 & self.priv_bit() == 0 {
            return false;
        }

        let tdata2 = trigger.tdata2;
        match (tdata1 >> 7) & 0xf {
            0 => address == tdata2,
            1 => {
                let mask = tdata2 ^ tdata2.wrapping_add(1);
                address | mask == tdata2 | mask
            }
            2 => address >= tdata2,
            3 => address < tdata2,
            _ => false,
        }
    }

    /// Check the triggers for an access, setting the hit bits of a chain that fires.
    fn trigger_fires(&mut self, access: Access, address: u64) -> bool {
        let xlen = self.xlen;
        let mut first = 0;

        while first < self.triggers.len() {
            let mut last = first;
            while last + 1 < self.triggers.len() && self.triggers[last].tdata1 & 1 << 11 != 0 {
                last += 1;
            }

            if (first..=last).all(|index| self.trigger_matches(index, access, address)) {
                for trigger in &mut self.triggers[first..=last] {
                    trigger.tdata1 |= match tdata1_kind(trigger.tdata1, xlen) {
                        2 => 1 << 20,
                        _ => 1 << 22,
                    };
                }
                tracing::debug!("MockHart: triggers {}..={} fired at {:#x}", first, last, address);
                return true;
            }

            first = last + 1;
        }

        false
    }

    fn ebreak(&self) -> Event {
        let virtualized = self.dcsr & 1 << 5 != 0;
        let bit = match (self.dcsr & 0x3, virtualized) {
            (3, _) => 15,
            (1, false) => 13,
            (1, true) => 17,
            (_, false) => 12,
            (_, true) => 16,
        };

        if self.dcsr & 1 << bit != 0 {
            Event::Halt(CAUSE_EBREAK)
        } else {
            Event::Stuck
        }
    }

    fn data_access(&self, instruction: u32) -> Option<(Access, u64)> {
        let base = self.gprs[((instruction >> 15) & 0x1f) as usize];
        match instruction & 0x7f {
            0x03 => Some((Access::Load, self.mask(base.wrapping_add(imm_i(instruction) as u64)))),
            0x23 => Some((Access::Store, self.mask(base.wrapping_add(imm_s(instruction) as u64)))),
            _ => None,
        }
    }

    /// Run one instruction at `pc` in normal mode.
    fn step_instruction(&mut self, memory: &mut MockMemory) -> Event {
        let pc = self.pc;

        if self.trigger_fires(Access::Execute, pc) {
            return Event::Halt(CAUSE_TRIGGER);
        }

        let Some(low) = memory.read_value(pc, 2) else {
            return Event::Stuck;
        };
        if low & 0x3 != 0x3 {
            return if low == u64::from(C_EBREAK) {
                self.ebreak()
            } else {
                Event::Stuck
            };
        }

        let Some(instruction) = memory.read_u32(pc) else {
            return Event::Stuck;
        };
        if instruction == EBREAK {
            return self.ebreak();
        }

        if let Some((access, address)) = self.data_access(instruction) {
            if self.trigger_fires(access, address) {
                return Event::Halt(CAUSE_TRIGGER);
            }
        }

        match self.execute(instruction, pc, memory) {
            Some(next) => {
                self.pc = next;
                self.retired += 1;
                Event::Retired
            }
            None => Event::Stuck,
        }
    }

    /// Run the program buffer in debug mode. `false` on an exception.
    fn run_program(
        &mut self,
        program: &[u32],
        address: u64,
        impebreak: bool,
        memory: &mut MockMemory,
    ) -> bool {
        let mut slot = 0;

        for _ in 0..PROGBUF_BUDGET {
            let Some(&instruction) = program.get(slot) else {
                // Running off the end is only fine with an implicit ebreak.
                return slot == program.len() && impebreak;
            };
            if instruction == EBREAK {
                return true;
            }

            let pc = address + 4 * slot as u64;
            match self.execute(instruction, pc, memory) {
                Some(next) if next >= address && (next - address) % 4 == 0 => {
                    slot = ((next - address) / 4) as usize;
                }
                _ => {
                    tracing::debug!("MockHart: exception in progbuf{}: {:#010x}", slot, instruction);
                    return false;
                }
            }
        }

        false
    }

    /// Execute an instruction at `pc`. Returns the next PC, or `None` on an exception.
    fn execute(&mut self, instruction: u32, pc: u64, memory: &mut MockMemory) -> Option<u64> {
        let rd = ((instruction >> 7) & 0x1f) as usize;
        let funct3 = (instruction >> 12) & 0x7;
        let rs1_index = ((instruction >> 15) & 0x1f) as usize;
        let rs1 = self.gprs[rs1_index];
        let rs2 = self.gprs[((instruction >> 20) & 0x1f) as usize];
        let next = self.mask(pc.wrapping_add(4));
        let wide = self.xlen == 64;

        match instruction & 0x7f {
            // Loads
            0x03 => {
                let (size, signed) = match funct3 {
                    0 => (1, true),
                    1 => (2, true),
                    2 => (4, true),
                    3 if wide => (8, false),
                    4 => (1, false),
                    5 => (2, false),
                    6 if wide => (4, false),
                    _ => return None,
                };
                let address = self.mask(rs1.wrapping_add(imm_i(instruction) as u64));
                let value = memory.read_value(address, size)?;
                let value = if signed {
                    sign_extend(value, size as u32 * 8)
                } else {
                    value
                };
                self.set_gpr(rd, value);
            }
            // Stores
            0x23 => {
                let size = match funct3 {
                    0 => 1,
                    1 => 2,
                    2 => 4,
                    3 if wide => 8,
                    _ => return None,
                };
                let address = self.mask(rs1.wrapping_add(imm_s(instruction) as u64));
                if !memory.write_value(address, size, rs2) {
                    return None;
                }
            }
            // OP-IMM
            0x13 => {
                let imm = imm_i(instruction) as u64;
                let shamt = (instruction >> 20) & (self.xlen - 1);
                let value = match funct3 {
                    0 => rs1.wrapping_add(imm),
                    1 => rs1 << shamt,
                    2 => u64::from(self.signed(rs1) < imm as i64),
                    3 => u64::from(rs1 < self.mask(imm)),
                    4 => rs1 ^ imm,
                    5 if instruction & 1 << 30 != 0 => (self.signed(rs1) >> shamt) as u64,
                    5 => rs1 >> shamt,
                    6 => rs1 | imm,
                    _ => rs1 & imm,
                };
                self.set_gpr(rd, value);
            }
            // AUIPC
            0x17 => self.set_gpr(rd, pc.wrapping_add(imm_u(instruction) as u64)),
            // LUI
            0x37 => self.set_gpr(rd, imm_u(instruction) as u64),
            // JAL
            0x6f => {
                self.set_gpr(rd, next);
                return Some(self.mask(pc.wrapping_add(imm_j(instruction) as u64)));
            }
            // JALR
            0x67 => {
                let target = self.mask(rs1.wrapping_add(imm_i(instruction) as u64)) & !1;
                self.set_gpr(rd, next);
                return Some(target);
            }
            // Branches
            0x63 => {
                let (a, b) = (self.signed(rs1), self.signed(rs2));
                let taken = match funct3 {
                    0 => rs1 == rs2,
                    1 => rs1 != rs2,
                    4 => a < b,
                    5 => a >= b,
                    6 => rs1 < rs2,
                    7 => rs1 >= rs2,
                    _ => return None,
                };
                if taken {
                    return Some(self.mask(pc.wrapping_add(imm_b(instruction) as u64)));
                }
            }
            // OP
            0x33 => {
                let shamt = (rs2 & u64::from(self.xlen - 1)) as u32;
                let value = match (instruction >> 25, funct3) {
                    (0x00, 0) => rs1.wrapping_add(rs2),
                    (0x20, 0) => rs1.wrapping_sub(rs2),
                    (0x00, 1) => rs1 << shamt,
                    (0x00, 2) => u64::from(self.signed(rs1) < self.signed(rs2)),
                    (0x00, 3) => u64::from(rs1 < rs2),
                    (0x00, 4) => rs1 ^ rs2,
                    (0x00, 5) => rs1 >> shamt,
                    (0x20, 5) => (self.signed(rs1) >> shamt) as u64,
                    (0x00, 6) => rs1 | rs2,
                    (0x00, 7) => rs1 & rs2,
                    (0x01, 0) => rs1.wrapping_mul(rs2),
                    _ => return None,
                };
                self.set_gpr(rd, value);
            }
            // FLW, FLD
            0x07 => {
                let size = match funct3 {
                    2 if self.flen() >= 32 => 4,
                    3 if self.flen() == 64 => 8,
                    _ => return None,
                };
                let address = self.mask(rs1.wrapping_add(imm_i(instruction) as u64));
                let value = memory.read_value(address, size)?;
                self.set_fpr(rd, value, size as u32 * 8);
            }
            // FSW, FSD
            0x27 => {
                let size = match funct3 {
                    2 if self.flen() >= 32 => 4,
                    3 if self.flen() == 64 => 8,
                    _ => return None,
                };
                let address = self.mask(rs1.wrapping_add(imm_s(instruction) as u64));
                let value = self.fprs[((instruction >> 20) & 0x1f) as usize];
                if !memory.write_value(address, size, value) {
                    return None;
                }
            }
            // Only the moves between FPRs and GPRs.
            0x53 => {
                let flen = self.flen();
                match (instruction >> 25, funct3) {
                    (0x70, 0) if flen >= 32 => {
                        let value = sign_extend(self.fprs[rs1_index] & 0xffff_ffff, 32);
                        self.set_gpr(rd, value);
                    }
                    (0x71, 0) if flen == 64 && wide => self.set_gpr(rd, self.fprs[rs1_index]),
                    (0x78, 0) if flen >= 32 => self.set_fpr(rd, rs1, 32),
                    (0x79, 0) if flen == 64 && wide => self.set_fpr(rd, rs1, 64),
                    _ => return None,
                }
            }
            // Only what it takes to move vector registers through a GPR.
            0x57 => return self.execute_vector(instruction, next),
            // FENCE, FENCE.I
            0x0f => {}
            // CSR instructions. ECALL, EBREAK and xRET trap.
            0x73 => {
                if funct3 == 0 || funct3 == 4 {
                    return None;
                }
                let number = (instruction >> 20) as u16;
                let source = if funct3 & 0x4 != 0 {
                    rs1_index as u64
                } else {
                    rs1
                };
                let old = self.read_csr(number)?;
                let new = match funct3 & 0x3 {
                    1 => Some(source),
                    2 => (rs1_index != 0).then_some(old | source),
                    _ => (rs1_index != 0).then_some(old & !source),
                };
                if let Some(new) = new {
                    if !self.write_csr(number, new) {
                        return None;
                    }
                }
                self.set_gpr(rd, old);
            }
            _ => return None,
        }

        Some(next)
    }
}

impl MockHart {
    /// `vsetvl`, `vmv.x.s` and `vslide1down.vx` with LMUL 1.
    fn execute_vector(&mut self, instruction: u32, next: u64) -> Option<u64> {
        if self.vregs.is_empty() {
            return None;
        }

        let rd = ((instruction >> 7) & 0x1f) as usize;
        let funct3 = (instruction >> 12) & 0x7;
        let rs1_index = ((instruction >> 15) & 0x1f) as usize;
        let vs2 = ((instruction >> 20) & 0x1f) as usize;
        let funct6 = instruction >> 26;

        let vtype = self.csrs.get(&csr::VTYPE).copied().unwrap_or(0);
        let sew = 1usize << ((vtype >> 3) & 0x7);
        let vl = self.csrs.get(&csr::VL).copied().unwrap_or(0) as usize;

        match (funct3, funct6) {
            (0b111, _) if instruction >> 25 == 0b100_0000 => {
                let vtype = self.gprs[vs2];
                let vlmax = (VLENB / (1 << ((vtype >> 3) & 0x7))) as u64;
                let vl = match (rs1_index, rd) {
                    (0, 0) => vl as u64,
                    (0, _) => vlmax,
                    _ => self.gprs[rs1_index].min(vlmax),
                };
                self.csrs.insert(csr::VTYPE, vtype);
                self.csrs.insert(csr::VL, vl);
                self.set_gpr(rd, vl);
            }
            (0b010, 0b01_0000) if rs1_index == 0 => {
                let mut bytes = [0u8; 8];
                bytes[..sew].copy_from_slice(&self.vregs[vs2][..sew]);
                self.set_gpr(rd, sign_extend(u64::from_le_bytes(bytes), sew as u32 * 8));
            }
            (0b110, 0b00_1111) if vl > 0 => {
                let source = self.vregs[vs2].clone();
                let last = (vl - 1) * sew;
                let destination = &mut self.vregs[rd];
                destination[..last].copy_from_slice(&source[sew..last + sew]);
                destination[last..last + sew]
                    .copy_from_slice(&self.gprs[rs1_index].to_le_bytes()[..sew]);
            }
            _ => return None,
        }

        Some(next)
    }
}

fn tdata1_kind(tdata1: u64, xlen: u32) -> u64 {
    (tdata1 >> (xlen - 4)) & 0xf
}

/// The value `tdata1` holds after writing `value`. Unsupported configurations
/// read back as 0.
fn accept_tdata1(trigger: &MockTrigger, value: u64, xlen: u32) -> u64 {
    let kind = tdata1_kind(value, xlen);

    if kind == 0 {
        return if trigger.tinfo & 1 << 1 != 0 { value } else { 0 };
    }
    if trigger.tinfo & 1 << kind == 0 {
        return 0;
    }
    if (kind == 2 || kind == 6) && trigger.match_kinds & 1 << ((value >> 7) & 0xf) == 0 {
        return 0;
    }
    if kind == 2 {
        // maskmax is read-only 0.
        return value & !(0x3f << (xlen - 11));
    }

    value
}

fn sign_extend(value: u64, bits: u32) -> u64 {
    let shift = 64 - bits;
    ((value << shift) as i64 >> shift) as u64
}

fn imm_i(instruction: u32) -> i64 {
    (instruction as i32 >> 20) as i64
}

fn imm_s(instruction: u32) -> i64 {
    ((instruction as i32 >> 25) << 5 | ((instruction >> 7) & 0x1f) as i32) as i64
}

fn imm_b(instruction: u32) -> i64 {
    let imm = ((instruction >> 31) & 0x1) << 12
        | ((instruction >> 7) & 0x1) << 11
        | ((instruction >> 25) & 0x3f) << 5
        | ((instruction >> 8) & 0xf) << 1;
    sign_extend(u64::from(imm), 13) as i64
}

fn imm_u(instruction: u32) -> i64 {
    (instruction & 0xffff_f000) as i32 as i64
}

fn imm_j(instruction: u32) -> i64 {
    let imm = ((instruction >> 31) & 0x1) << 20
        | ((instruction >> 12) & 0xff) << 12
        | ((instruction >> 20) & 0x1) << 11
        | ((instruction >> 21) & 0x3ff) << 1;
    sign_extend(u64::from(imm), 21) as i64
}

/// A simulated DTM and Debug Module.
///
/// The public fields configure what the module implements. They can be changed
/// between operations through [`FakeJtag::target`].
#[derive(Debug)]
pub struct MockDebugModule {
    pub harts: Vec<MockHart>,
    pub memory: MockMemory,

    /// `dtmcs.version`. 0 is a 0.11 DTM.
    pub dtm_version: u32,
    /// A dead TAP captures all zeros.
    pub present: bool,
    pub dtm_idle: u32,
    /// DMI operations answered with busy before the next one goes through.
    pub dmi_busy: usize,

    pub dm_version: u32,
    pub progbuf_size: usize,
    pub impebreak: bool,
    pub datacount: usize,
    pub progbuf_address: u64,
    pub abstract_csr: bool,
    pub abstract_fpr: bool,
    pub abstract_memory: bool,
    /// Whether the hart can load and store to the program buffer.
    pub progbuf_writable: bool,
    /// Abstract commands answered with busy before the next one runs.
    pub abstract_busy: usize,
    pub hartinfo: u32,
    pub hartsellen: u32,
    pub hasel_supported: bool,
    pub hartreset_supported: bool,
    pub halt_groups: bool,

    pub system_bus: bool,
    /// Supported system bus access sizes, `sbaccess8` in bit 0.
    pub sb_sizes: u32,
    pub sbasize: u32,

    pub authenticated: bool,
    pub auth_key: u32,

    /// Words of Debug RAM of a 0.11 module, up to 64.
    pub dram_words: usize,
    /// Debug RAM programs that ran.
    pub dram_programs: usize,

    /// Abstract commands that ran.
    pub commands: Vec<u32>,
    /// Harts in the order they were resumed.
    pub resumed: Vec<usize>,
    /// DMI reads and writes that went through.
    pub dmi_operations: usize,
    /// Calls to [`JtagAccess::execute`].
    pub executes: usize,
    pub idle_cycles: u64,

    ir: u32,
    dmi_status: u8,
    dmi_data: u32,
    dbus_data: u64,
    dram: [u32; DRAM_MAX],

    dmactive: bool,
    ndmreset: bool,
    hartreset: bool,
    hartsel: u32,
    hasel: bool,
    hawindow: u32,
    cmderr: u32,
    command: u32,
    abstractauto: u32,
    data: [u32; DATA_MAX],
    progbuf: [u32; PROGBUF_MAX],

    sbreadonaddr: bool,
    sbaccess: u32,
    sbautoincrement: bool,
    sbreadondata: bool,
    sberror: u32,
    sbaddress: u64,
    sbdata: [u32; 2],
}

impl MockDebugModule {
    /// A 1.0 Debug Module with an 8 word program buffer in front of `harts`,
    /// with [`RAM_SIZE`] bytes of RAM at [`RAM_BASE`].
    pub fn new(harts: Vec<MockHart>) -> Self {
        let mut memory = MockMemory::default();
        memory.add_ram(RAM_BASE, RAM_SIZE);

        Self {
            harts,
            memory,
            dtm_version: 1,
            present: true,
            dtm_idle: 1,
            dmi_busy: 0,
            dm_version: 3,
            progbuf_size: 8,
            impebreak: false,
            datacount: 4,
            progbuf_address: 0x300,
            abstract_csr: true,
            abstract_fpr: true,
            abstract_memory: false,
            progbuf_writable: false,
            abstract_busy: 0,
            hartinfo: 0,
            hartsellen: 5,
            hasel_supported: true,
            hartreset_supported: false,
            halt_groups: true,
            system_bus: false,
            sb_sizes: 0b0111,
            sbasize: 32,
            authenticated: true,
            auth_key: 0,
            dram_words: 16,
            dram_programs: 0,
            commands: Vec::new(),
            resumed: Vec::new(),
            dmi_operations: 0,
            executes: 0,
            idle_cycles: 0,
            ir: IDCODE_ADDRESS,
            dmi_status: DMI_STATUS_OK,
            dmi_data: 0,
            dbus_data: 0,
            dram: [0; DRAM_MAX],
            dmactive: false,
            ndmreset: false,
            hartreset: false,
            hartsel: 0,
            hasel: false,
            hawindow: 0,
            cmderr: 0,
            command: 0,
            abstractauto: 0,
            data: [0; DATA_MAX],
            progbuf: [0; PROGBUF_MAX],
            sbreadonaddr: false,
            sbaccess: 2,
            sbautoincrement: false,
            sbreadondata: false,
            sberror: 0,
            sbaddress: 0,
            sbdata: [0; 2],
        }
    }

    pub fn hart(&self, index: usize) -> &MockHart {
        &self.harts[index]
    }

    pub fn hart_mut(&mut self, index: usize) -> &mut MockHart {
        &mut self.harts[index]
    }

    /// Program buffer contents.
    pub fn progbuf(&self) -> &[u32] {
        &self.progbuf[..self.progbuf_size.min(PROGBUF_MAX)]
    }

    fn scan_dr(&mut self, bits: &BitSlice<u8, Lsb0>) -> BitVec<u8, Lsb0> {
        let len = bits.len();
        let value = if len == 0 {
            0
        } else {
            bits[..len.min(128)].load_le::<u128>()
        };

        let capture: u128 = if !self.present {
            0
        } else {
            match self.ir {
                DTMCS_ADDRESS => u128::from(self.dtmcs_scan(value as u32)),
                DMI_ADDRESS if self.dtm_version == 0 => self.dbus_scan(value),
                DMI_ADDRESS => self.dmi_scan(value),
                IDCODE_ADDRESS => u128::from(FAKE_IDCODE),
                _ => 0,
            }
        };

        if len == 0 {
            BitVec::new()
        } else {
            dr_bits(capture, len.min(128) as u32)
        }
    }

    fn dtmcs_scan(&mut self, out: u32) -> u32 {
        let capture = if self.dtm_version == 0 {
            // dtmcontrol of a 0.11 DTM
            ABITS << 4 | u32::from(self.dmi_status) << 8 | (self.dtm_idle & 0x7) << 10
        } else {
            self.dtm_version
                | ABITS << 4
                | u32::from(self.dmi_status) << 10
                | (self.dtm_idle & 0x7) << 12
        };

        if out & (1 << 16 | 1 << 17) != 0 {
            tracing::trace!("MockDebugModule: DMI status reset");
            self.dmi_status = DMI_STATUS_OK;
        }

        capture
    }

    fn dmi_scan(&mut self, value: u128) -> u128 {
        let capture = u128::from(self.dmi_data) << 2 | u128::from(self.dmi_status);

        // A busy DMI ignores everything until dmireset.
        if self.dmi_status == DMI_STATUS_BUSY {
            return capture;
        }

        let op = (value & 0x3) as u8;
        let address = ((value >> DMI_ADDRESS_BIT_OFFSET) & ((1 << ABITS) - 1)) as u32;
        let data = (value >> 2) as u32;

        match op {
            1 | 2 if self.dmi_busy > 0 => {
                self.dmi_busy -= 1;
                self.dmi_status = DMI_STATUS_BUSY;
            }
            1 => {
                self.dmi_data = self.read_register(address);
                self.dmi_operations += 1;
                tracing::trace!("MockDebugModule: read {:#04x} -> {:#010x}", address, self.dmi_data);
            }
            2 => {
                tracing::trace!("MockDebugModule: write {:#04x} <- {:#010x}", address, data);
                self.write_register(address, data);
                self.dmi_operations += 1;
            }
            _ => {}
        }

        capture
    }

    /// Debug RAM contents.
    pub fn dram(&self) -> &[u32] {
        &self.dram[..self.dram_words.min(DRAM_MAX)]
    }

    fn dbus_scan(&mut self, value: u128) -> u128 {
        let capture = u128::from(self.dbus_data) << 2 | u128::from(self.dmi_status);

        if self.dmi_status == DMI_STATUS_BUSY {
            return capture;
        }

        let op = (value & 0x3) as u8;
        let address = ((value >> DBUS_ADDRESS_BIT_OFFSET) & ((1 << ABITS) - 1)) as usize;
        let data = ((value >> 2) & DBUS_DATA_MASK) as u64;

        match op {
            1 | 2 if self.dmi_busy > 0 => {
                self.dmi_busy -= 1;
                self.dmi_status = DMI_STATUS_BUSY;
            }
            1 => {
                self.dbus_data = self.dbus_read(address);
                self.dmi_operations += 1;
                tracing::trace!("MockDebugModule: dbus read {:#04x} -> {:#011x}", address, self.dbus_data);
            }
            2 => {
                tracing::trace!("MockDebugModule: dbus write {:#04x} <- {:#011x}", address, data);
                self.dbus_write(address, data);
                self.dbus_data = self.dbus_read(address);
                self.dmi_operations += 1;
            }
            _ => {}
        }

        capture
    }

    fn dram_index(&self, address: usize) -> Option<usize> {
        (0..self.dram_words.min(DRAM_MAX)).find(|&index| dram_address(index) as usize == address)
    }

    /// Programs run synchronously, so `interrupt` always reads as clear.
    fn dbus_read(&self, address: usize) -> u64 {
        let haltnot = match self.harts.first() {
            Some(hart) if hart.halted => DBUS_HALTNOT,
            _ => 0,
        };

        let value = match (self.dram_index(address), address) {
            (Some(index), _) => self.dram[index],
            (None, DBUS_DMINFO) => {
                let dramsize = (self.dram_words.min(DRAM_MAX) as u32 - 1) << 10;
                dramsize | u32::from(self.authenticated) << 5 | 1
            }
            _ => 0,
        };

        u64::from(value) | haltnot
    }

    fn dbus_write(&mut self, address: usize, data: u64) {
        if let Some(index) = self.dram_index(address) {
            self.dram[index] = data as u32;
        } else if address != DBUS_DMCONTROL {
            return;
        }

        if data & DBUS_INTERRUPT != 0 {
            self.debug_interrupt();
        }
    }

    /// Run the Debug RAM program on hart 0, the way the Debug ROM does.
    fn debug_interrupt(&mut self) {
        let words = self.dram_words.min(DRAM_MAX);
        self.dram_programs += 1;

        let Some(hart) = self.harts.first_mut() else {
            return;
        };
        if !hart.halted {
            hart.enter_debug(CAUSE_HALTREQ);
        }
        let s0 = hart.gpr(8);
        hart.write_csr(csr::DSCRATCH0, s0);

        self.memory.regions.insert(
            0,
            MemoryRegion {
                base: DEBUG_RAM_ADDRESS,
                data: self.dram[..words].iter().flat_map(|word| word.to_le_bytes()).collect(),
                writable: true,
            },
        );

        let hart = &mut self.harts[0];
        let mut pc = DEBUG_RAM_ADDRESS;
        let mut finished = false;
        for _ in 0..PROGBUF_BUDGET {
            let Some(instruction) = self.memory.read_u32(pc) else {
                break;
            };
            match hart.execute(instruction, pc, &mut self.memory) {
                Some(DEBUG_ROM_RESUME) => {
                    finished = true;
                    break;
                }
                Some(next) => pc = next,
                None => break,
            }
        }

        let region = self.memory.regions.remove(0);
        for (word, bytes) in self.dram.iter_mut().zip(region.data.chunks_exact(4)) {
            *word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }

        if !finished {
            tracing::debug!("MockHart: exception in Debug RAM at {:#x}", pc);
            self.dram[words - 1] = 0xffff_ffff;
        }

        let hart = &mut self.harts[0];
        let s0 = hart.read_csr(csr::DSCRATCH0).unwrap_or(0);
        hart.set_gpr(8, s0);

        if hart.dcsr & DCSR_HALT == 0 {
            hart.halted = false;
            self.resumed.push(0);
            self.run_hart(0);
        }
    }

    /// Harts addressed by `hartsel` and, with `hasel`, the hart array window.
    fn selected(&self) -> Vec<usize> {
        let mut selected = vec![self.hartsel as usize];
        if self.hasel {
            for index in 0..32 {
                if self.hawindow & 1 << index != 0 && index != self.hartsel as usize {
                    selected.push(index);
                }
            }
        }
        selected
    }

    fn hartsel_mask(&self) -> u32 {
        (1 << self.hartsellen) - 1
    }

    fn dmstatus(&self) -> u32 {
        // halted, running, unavailable, nonexistent, resumeack, havereset
        let mut any = [false; 6];
        let mut all = [true; 6];

        for index in self.selected() {
            let flags = match self.harts.get(index) {
                None => [false, false, false, true, false, false],
                Some(hart) => {
                    let unavailable = hart.unavailable || hart.in_reset;
                    [
                        hart.halted && !unavailable,
                        !hart.halted && !unavailable,
                        unavailable,
                        false,
                        hart.resumeack,
                        hart.havereset,
                    ]
                }
            };
            for (flag, (any, all)) in flags.into_iter().zip(any.iter_mut().zip(all.iter_mut())) {
                *any |= flag;
                *all &= flag;
            }
        }

        let mut value = self.dm_version & 0xf | 1 << 5;
        if self.authenticated {
            value |= 1 << 7;
        }
        if self.impebreak {
            value |= 1 << 22;
        }
        if self.ndmreset {
            value |= 1 << 24;
        }
        for (position, (any, all)) in any.into_iter().zip(all).enumerate() {
            value |= u32::from(any) << (8 + 2 * position);
            value |= u32::from(all) << (9 + 2 * position);
        }
        value
    }

    fn dmcontrol(&self) -> u32 {
        let mut control = Dmcontrol::from(0);
        control.set_dmactive(self.dmactive);
        control.set_ndmreset(self.ndmreset);
        control.set_hartreset(self.hartreset);
        control.set_hasel(self.hasel);
        control.set_hartsel(self.hartsel);
        u32::from(control)
    }

    fn sbcs(&self) -> u32 {
        if !self.system_bus {
            return 0;
        }
        1 << 29
            | u32::from(self.sbreadonaddr) << 20
            | self.sbaccess << 17
            | u32::from(self.sbautoincrement) << 16
            | u32::from(self.sbreadondata) << 15
            | self.sberror << 12
            | (self.sbasize & 0x7f) << 5
            | self.sb_sizes & 0x1f
    }

    fn read_register(&mut self, address: u32) -> u32 {
        if !self.authenticated && address != Dmstatus::ADDRESS as u32 && address != Authdata::ADDRESS as u32 {
            return 0;
        }

        let data = DATA0_ADDRESS as u32..DATA0_ADDRESS as u32 + DATA_MAX as u32;
        let progbuf = PROGBUF0_ADDRESS as u32..PROGBUF0_ADDRESS as u32 + PROGBUF_MAX as u32;

        match address {
            address if data.contains(&address) => {
                let index = (address - DATA0_ADDRESS as u32) as usize;
                if index >= self.datacount {
                    return 0;
                }
                let value = self.data[index];
                if self.abstractauto & 1 << index != 0 {
                    self.run_command();
                }
                value
            }
            address if progbuf.contains(&address) => {
                self.progbuf[(address - PROGBUF0_ADDRESS as u32) as usize]
            }
            address if address == Dmcontrol::ADDRESS as u32 => self.dmcontrol(),
            address if address == Dmstatus::ADDRESS as u32 => self.dmstatus(),
            address if address == Hartinfo::ADDRESS as u32 => self.hartinfo,
            address if address == Hawindow::ADDRESS as u32 => self.hawindow,
            address if address == Abstractcs::ADDRESS as u32 => {
                (self.progbuf_size as u32) << 24 | self.cmderr << 8 | self.datacount as u32
            }
            address if address == Command::ADDRESS as u32 => 0,
            address if address == Abstractauto::ADDRESS as u32 => self.abstractauto,
            address if address == Authdata::ADDRESS as u32 => 0xa5a5_0000,
            address if address == Dmcs2::ADDRESS as u32 => {
                let group = self.harts.get(self.hartsel as usize).map_or(0, |hart| hart.group);
                (group & 0x1f) << 2
            }
            address if address == Sbcs::ADDRESS as u32 => self.sbcs(),
            address if address == Sbaddress0::ADDRESS as u32 => self.sbaddress as u32,
            address if address == Sbaddress1::ADDRESS as u32 => (self.sbaddress >> 32) as u32,
            address if address == Sbdata0::ADDRESS as u32 => {
                let value = self.sbdata[0];
                if self.system_bus && self.sbreadondata && self.sberror == 0 {
                    self.sb_read();
                }
                value
            }
            address if address == Sbdata1::ADDRESS as u32 => self.sbdata[1],
            address if address == Haltsum0::ADDRESS as u32 => self
                .harts
                .iter()
                .take(32)
                .enumerate()
                .filter(|(_, hart)| hart.halted)
                .fold(0, |sum, (index, _)| sum | 1 << index),
            _ => 0,
        }
    }

    fn write_register(&mut self, address: u32, value: u32) {
        if !self.authenticated && address != Authdata::ADDRESS as u32 {
            return;
        }

        let data = DATA0_ADDRESS as u32..DATA0_ADDRESS as u32 + DATA_MAX as u32;
        let progbuf = PROGBUF0_ADDRESS as u32..PROGBUF0_ADDRESS as u32 + PROGBUF_MAX as u32;

        match address {
            address if data.contains(&address) => {
                let index = (address - DATA0_ADDRESS as u32) as usize;
                if index >= self.datacount {
                    return;
                }
                self.data[index] = value;
                if self.abstractauto & 1 << index != 0 {
                    self.run_command();
                }
            }
            address if progbuf.contains(&address) => {
                let index = (address - PROGBUF0_ADDRESS as u32) as usize;
                if index < self.progbuf_size {
                    self.progbuf[index] = value;
                }
            }
            address if address == Dmcontrol::ADDRESS as u32 => self.write_dmcontrol(Dmcontrol::from(value)),
            address if address == Hawindowsel::ADDRESS as u32 => {}
            address if address == Hawindow::ADDRESS as u32 => self.hawindow = value,
            address if address == Abstractcs::ADDRESS as u32 => {
                self.cmderr &= !(Abstractcs::from(value).cmderr());
            }
            address if address == Command::ADDRESS as u32 => {
                if self.cmderr == 0 {
                    self.command = value;
                    self.run_command();
                }
            }
            address if address == Abstractauto::ADDRESS as u32 => {
                let auto = Abstractauto::from(value);
                let data_mask = (1 << self.datacount) - 1;
                let progbuf_mask = (1 << self.progbuf_size) - 1;
                self.abstractauto = (auto.autoexecprogbuf() & progbuf_mask) << 16
                    | auto.autoexecdata() & data_mask;
            }
            address if address == Authdata::ADDRESS as u32 => {
                self.authenticated = value == self.auth_key;
                tracing::debug!("MockDebugModule: authenticated: {}", self.authenticated);
            }
            address if address == Dmcs2::ADDRESS as u32 => {
                let dmcs2 = Dmcs2::from(value);
                if dmcs2.hgwrite() && !dmcs2.hgselect() && self.halt_groups {
                    for index in self.selected() {
                        if let Some(hart) = self.harts.get_mut(index) {
                            hart.group = dmcs2.group();
                        }
                    }
                }
            }
            address if address == Sbcs::ADDRESS as u32 && self.system_bus => {
                let sbcs = Sbcs::from(value);
                self.sbreadonaddr = sbcs.sbreadonaddr();
                self.sbaccess = sbcs.sbaccess();
                self.sbautoincrement = sbcs.sbautoincrement();
                self.sbreadondata = sbcs.sbreadondata();
                self.sberror &= !sbcs.sberror();
            }
            address if address == Sbaddress0::ADDRESS as u32 && self.system_bus => {
                self.sbaddress = self.sbaddress & !0xffff_ffff | u64::from(value);
                if self.sbreadonaddr && self.sberror == 0 {
                    self.sb_read();
                }
            }
            address if address == Sbaddress1::ADDRESS as u32 && self.system_bus => {
                self.sbaddress = self.sbaddress & 0xffff_ffff | u64::from(value) << 32;
            }
            address if address == Sbdata0::ADDRESS as u32 && self.system_bus => {
                self.sbdata[0] = value;
                if self.sberror == 0 {
                    self.sb_write();
                }
            }
            address if address == Sbdata1::ADDRESS as u32 && self.system_bus => self.sbdata[1] = value,
            _ => {}
        }
    }

    fn reset_dm(&mut self) {
        tracing::debug!("MockDebugModule: reset");
        self.dmactive = false;
        self.ndmreset = false;
        self.hartreset = false;
        self.hartsel = 0;
        self.hasel = false;
        self.hawindow = 0;
        self.cmderr = 0;
        self.command = 0;
        self.abstractauto = 0;
        self.data = [0; DATA_MAX];
        self.sbreadonaddr = false;
        self.sbaccess = 2;
        self.sbautoincrement = false;
        self.sbreadondata = false;
        self.sberror = 0;
        self.sbaddress = 0;
        self.sbdata = [0; 2];
        for hart in &mut self.harts {
            hart.in_reset = false;
        }
    }

    fn write_dmcontrol(&mut self, control: Dmcontrol) {
        if !control.dmactive() {
            self.reset_dm();
            return;
        }

        self.dmactive = true;
        self.hartsel = control.hartsel() & self.hartsel_mask();
        self.hasel = control.hasel() && self.hasel_supported;
        let selected: Vec<usize> = self
            .selected()
            .into_iter()
            .filter(|&index| index < self.harts.len())
            .collect();

        for &index in &selected {
            let hart = &mut self.harts[index];
            if control.ackhavereset() {
                hart.havereset = false;
            }
            if control.setresethaltreq() {
                hart.resethaltreq = true;
            }
            if control.clrresethaltreq() {
                hart.resethaltreq = false;
            }
        }

        let mut released = Vec::new();

        if control.ndmreset() != self.ndmreset {
            self.ndmreset = control.ndmreset();
            for index in 0..self.harts.len() {
                self.harts[index].in_reset = self.ndmreset;
                if !self.ndmreset {
                    released.push(index);
                }
            }
            tracing::debug!("MockDebugModule: ndmreset {}", self.ndmreset);
        }

        if self.hartreset_supported && control.hartreset() != self.hartreset {
            self.hartreset = control.hartreset();
            for &index in &selected {
                self.harts[index].in_reset = self.hartreset;
                if !self.hartreset {
                    released.push(index);
                }
            }
        }

        let mut to_run = Vec::new();
        for index in released {
            let hart = &mut self.harts[index];
            hart.reset();
            if hart.resethaltreq {
                hart.enter_debug(CAUSE_RESETHALTREQ);
            } else if control.haltreq() && selected.contains(&index) {
                hart.enter_debug(CAUSE_HALTREQ);
            } else {
                to_run.push(index);
            }
        }

        if control.haltreq() {
            for &index in &selected {
                let hart = &mut self.harts[index];
                if !hart.halted && !hart.in_reset && !hart.unavailable {
                    hart.enter_debug(CAUSE_HALTREQ);
                }
            }
        } else if control.resumereq() {
            for &index in &selected {
                let hart = &mut self.harts[index];
                if hart.halted && !hart.unavailable {
                    hart.halted = false;
                    to_run.push(index);
                    self.resumed.push(index);
                }
                hart.resumeack = true;
            }
        }

        for index in to_run {
            self.run_hart(index);
        }
    }

    /// Let a resumed hart run until it halts or stops making progress.
    fn run_hart(&mut self, index: usize) {
        let hart = &mut self.harts[index];
        tracing::debug!("MockHart: running from {:#x}", hart.pc);

        if hart.dcsr & DCSR_STEP != 0 {
            let cause = match hart.step_instruction(&mut self.memory) {
                Event::Halt(cause) => cause,
                Event::Retired | Event::Stuck => CAUSE_STEP,
            };
            hart.enter_debug(cause);
            return;
        }

        for _ in 0..RUN_BUDGET {
            let before = hart.pc;
            match hart.step_instruction(&mut self.memory) {
                Event::Retired if hart.pc == before => return,
                Event::Retired => {}
                Event::Halt(cause) => {
                    hart.enter_debug(cause);
                    break;
                }
                Event::Stuck => return,
            }
        }

        let group = self.harts[index].group;
        if self.harts[index].halted && group != 0 && self.halt_groups {
            for (other, hart) in self.harts.iter_mut().enumerate() {
                if other != index && hart.group == group && !hart.halted && !hart.in_reset {
                    hart.enter_debug(CAUSE_GROUP);
                }
            }
        }
    }

    fn run_command(&mut self) {
        if self.cmderr != 0 {
            return;
        }

        if self.abstract_busy > 0 {
            self.abstract_busy -= 1;
            self.cmderr = CMDERR_BUSY;
            return;
        }

        let command = self.command;
        self.commands.push(command);

        let result = match command >> 24 {
            0 => self.access_register(command),
            2 => self.access_memory(command),
            _ => Err(CMDERR_NOT_SUPPORTED),
        };

        if let Err(cmderr) = result {
            tracing::debug!("MockDebugModule: command {:#010x} failed with cmderr {}", command, cmderr);
            self.cmderr = cmderr;
        }
    }

    fn access_register(&mut self, command: u32) -> Result<(), u32> {
        let index = self.hartsel as usize;
        let hart = self.harts.get_mut(index).ok_or(CMDERR_HALT_RESUME)?;
        if !hart.halted {
            return Err(CMDERR_HALT_RESUME);
        }

        let size_bits = 8u32 << ((command >> 20) & 0x7);
        let postexec = command & 1 << 18 != 0;
        let transfer = command & 1 << 17 != 0;
        let write = command & 1 << 16 != 0;
        let regno = (command & 0xffff) as u16;

        if transfer {
            let width = match regno {
                0x1020..=0x103f => hart.flen(),
                _ => hart.xlen,
            };
            if size_bits > width {
                return Err(CMDERR_NOT_SUPPORTED);
            }

            if write {
                let mut value = u64::from(self.data[0]);
                if size_bits > 32 {
                    value |= u64::from(self.data[1]) << 32;
                }
                match regno {
                    0x1000..=0x101f => hart.set_gpr(usize::from(regno - 0x1000), value),
                    0x1020..=0x103f if self.abstract_fpr => {
                        hart.set_fpr(usize::from(regno - 0x1020), value, size_bits)
                    }
                    0..=0xfff if self.abstract_csr => {
                        if !hart.write_csr(regno, value) {
                            return Err(CMDERR_EXCEPTION);
                        }
                    }
                    _ => return Err(CMDERR_NOT_SUPPORTED),
                }
            } else {
                let value = match regno {
                    0x1000..=0x101f => hart.gpr(usize::from(regno - 0x1000)),
                    0x1020..=0x103f if self.abstract_fpr => hart.fprs[usize::from(regno - 0x1020)],
                    0..=0xfff if self.abstract_csr => hart.read_csr(regno).ok_or(CMDERR_EXCEPTION)?,
                    _ => return Err(CMDERR_NOT_SUPPORTED),
                };
                self.data[0] = value as u32;
                if size_bits > 32 {
                    self.data[1] = (value >> 32) as u32;
                }
            }
        }

        if postexec && !self.execute_progbuf(index) {
            return Err(CMDERR_EXCEPTION);
        }

        Ok(())
    }

    /// Run the program buffer on hart `index`. A writable buffer is mapped into
    /// memory for the duration of the run.
    fn execute_progbuf(&mut self, index: usize) -> bool {
        let words = self.progbuf_size.min(PROGBUF_MAX);
        let program = self.progbuf[..words].to_vec();

        if !self.progbuf_writable {
            let hart = &mut self.harts[index];
            return hart.run_program(&program, self.progbuf_address, self.impebreak, &mut self.memory);
        }

        self.memory.regions.insert(
            0,
            MemoryRegion {
                base: self.progbuf_address,
                data: program.iter().flat_map(|word| word.to_le_bytes()).collect(),
                writable: true,
            },
        );
        let hart = &mut self.harts[index];
        let finished = hart.run_program(&program, self.progbuf_address, self.impebreak, &mut self.memory);

        let region = self.memory.regions.remove(0);
        for (word, bytes) in self.progbuf.iter_mut().zip(region.data.chunks_exact(4)) {
            *word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }

        finished
    }

    fn access_memory(&mut self, command: u32) -> Result<(), u32> {
        if !self.abstract_memory {
            return Err(CMDERR_NOT_SUPPORTED);
        }

        let xlen = self.harts.get(self.hartsel as usize).map_or(32, |hart| hart.xlen);
        let size = 1usize << ((command >> 20) & 0x7);
        if size > 8 {
            return Err(CMDERR_NOT_SUPPORTED);
        }
        let write = command & 1 << 16 != 0;

        let address = if xlen > 32 {
            u64::from(self.data[2]) | u64::from(self.data[3]) << 32
        } else {
            u64::from(self.data[1])
        };

        if write {
            let mut value = u64::from(self.data[0]);
            if size == 8 {
                value |= u64::from(self.data[1]) << 32;
            }
            if !self.memory.write_value(address, size, value) {
                return Err(CMDERR_BUS);
            }
        } else {
            let value = self.memory.read_value(address, size).ok_or(CMDERR_BUS)?;
            self.data[0] = value as u32;
            if size == 8 {
                self.data[1] = (value >> 32) as u32;
            }
        }

        Ok(())
    }

    fn sb_size(&mut self) -> Option<usize> {
        if self.sbaccess > 3 || self.sb_sizes & 1 << self.sbaccess == 0 {
            self.sberror = SBERROR_BAD_SIZE;
            return None;
        }
        Some(1 << self.sbaccess)
    }

    fn sb_read(&mut self) {
        let Some(size) = self.sb_size() else { return };
        match self.memory.read_value(self.sbaddress, size) {
            Some(value) => {
                self.sbdata = [value as u32, (value >> 32) as u32];
                if self.sbautoincrement {
                    self.sbaddress += size as u64;
                }
            }
            None => {
                tracing::debug!("MockDebugModule: system bus read at {:#x} failed", self.sbaddress);
                self.sberror = SBERROR_BAD_ADDRESS;
            }
        }
    }

    fn sb_write(&mut self) {
        let Some(size) = self.sb_size() else { return };
        let value = u64::from(self.sbdata[0]) | u64::from(self.sbdata[1]) << 32;
        if self.memory.write_value(self.sbaddress, size, value) {
            if self.sbautoincrement {
                self.sbaddress += size as u64;
            }
        } else {
            tracing::debug!("MockDebugModule: system bus write at {:#x} failed", self.sbaddress);
            self.sberror = SBERROR_BAD_ADDRESS;
        }
    }
}

#[derive(Debug)]
enum Scan {
    Ir(u32),
    Dr(BitVec<u8, Lsb0>),
    Idle(u32),
}

/// A JTAG adapter whose scan chain ends in a [`MockDebugModule`].
#[derive(Debug)]
pub struct FakeJtag {
    target: Rc<RefCell<MockDebugModule>>,
    queue: Vec<Scan>,
}

impl FakeJtag {
    pub fn new(target: MockDebugModule) -> Self {
        Self {
            target: Rc::new(RefCell::new(target)),
            queue: Vec::new(),
        }
    }

    /// Handle on the simulated target, which stays usable after the adapter was
    /// handed to a debugger.
    pub fn target(&self) -> Rc<RefCell<MockDebugModule>> {
        self.target.clone()
    }
}

impl JtagAccess for FakeJtag {
    fn add_ir(&mut self, _tap: TapPosition, instruction: u32) {
        self.queue.push(Scan::Ir(instruction));
    }

    fn add_dr(&mut self, _tap: TapPosition, data: &BitSlice<u8, Lsb0>) {
        self.queue.push(Scan::Dr(data.to_bitvec()));
    }

    fn add_runtest(&mut self, cycles: u32) {
        self.queue.push(Scan::Idle(cycles));
    }

    fn execute(&mut self) -> Result<Vec<BitVec<u8, Lsb0>>, TransportError> {
        let mut target = self.target.borrow_mut();
        target.executes += 1;

        let mut captures = Vec::new();
        for scan in self.queue.drain(..) {
            match scan {
                Scan::Ir(instruction) => target.ir = instruction,
                Scan::Dr(bits) => captures.push(target.scan_dr(&bits)),
                Scan::Idle(cycles) => target.idle_cycles += u64::from(cycles),
            }
        }

        Ok(captures)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::assembly;
    use pretty_assertions::assert_eq;

    #[test]
    fn immediates() {
        // addi a0, a0, -1
        assert_eq!(imm_i(0xfff5_0513), -1);
        // sw a1, -4(a0)
        assert_eq!(imm_s(0xfeb5_2e23), -4);
        // beq zero, zero, -8
        assert_eq!(imm_b(0xfe00_0ce3), -8);
        // jal zero, 0
        assert_eq!(imm_j(JUMP_TO_SELF), 0);
        // lui a0, 0x80000
        assert_eq!(imm_u(0x8000_0537) as u64 & 0xffff_ffff, 0x8000_0000);
    }

    #[test]
    fn program_buffer_loads_and_increments() {
        let mut memory = MockMemory::default();
        memory.add_ram(0x1000, 0x100);
        memory.write_value(0x1010, 4, 0xdead_beef);

        let mut hart = MockHart::rv32().halted();
        hart.set_gpr(8, 0x1010);

        let program = [
            assembly::load(2, 9, 8, 0),
            assembly::addi(8, 8, 4),
            EBREAK,
        ];
        assert!(hart.run_program(&program, 0x300, false, &mut memory));
        assert_eq!(hart.gpr(9), 0xdead_beef);
        assert_eq!(hart.gpr(8), 0x1014);
    }

    #[test]
    fn program_buffer_faults_outside_memory() {
        let mut memory = MockMemory::default();
        let mut hart = MockHart::rv64().halted();

        let program = [assembly::load(3, 9, 8, 0)];
        assert!(!hart.run_program(&program, 0x300, true, &mut memory));
    }

    #[test]
    fn napot_trigger_matches_range() {
        let mut hart = MockHart::rv32().with_triggers(vec![MockTrigger::mcontrol6()]);
        // type 6, action debug, NAPOT, M-mode, store
        let tdata1 = 6 << 28 | 1 << 12 | 1 << 7 | 1 << 6 | 1 << 1;
        assert!(hart.write_csr(csr::TDATA1, tdata1));
        assert!(hart.write_csr(csr::TDATA2, 0x1003));

        assert!(!hart.trigger_fires(Access::Load, 0x1004));
        assert!(!hart.trigger_fires(Access::Store, 0x1008));
        assert!(hart.trigger_fires(Access::Store, 0x1007));
        assert_ne!(hart.triggers[0].tdata1 & 1 << 22, 0);
    }

    #[test]
    fn unsupported_match_reads_back_zero() {
        let mut hart = MockHart::rv32().with_triggers(vec![MockTrigger::mcontrol().equal_only()]);
        assert!(hart.write_csr(csr::TDATA1, 2 << 28 | 1 << 12 | 1 << 7 | 1 << 6 | 1 << 2));
        assert_eq!(hart.read_csr(csr::TDATA1), Some(0));
    }

    #[test]
    fn dmi_busy_is_sticky_until_reset() {
        let mut dm = MockDebugModule::new(vec![MockHart::rv32()]);
        dm.dmi_busy = 1;

        let write = u128::from(Dmcontrol::ADDRESS) << DMI_ADDRESS_BIT_OFFSET | 1 << 2 | 2;
        dm.dmi_scan(write);
        assert_eq!(dm.dmi_scan(0) & 0x3, u128::from(DMI_STATUS_BUSY));
        assert!(!dm.dmactive);

        dm.dtmcs_scan(1 << 16);
        dm.dmi_scan(write);
        assert_eq!(dm.dmi_scan(0) & 0x3, 0);
        assert!(dm.dmactive);
    }
}
