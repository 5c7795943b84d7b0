//! Debug Modules behind a 0.11 DTM.
//!
//! These have neither abstract commands nor a program buffer. The debugger
//! writes a short program into Debug RAM and raises the debug interrupt of the
//! hart, which runs the program from the Debug ROM. The ROM saves `s0` in
//! `dscratch` on entry and restores it when the program jumps back, so programs
//! may use `s0` freely. While `dcsr.halt` is set the hart stays in debug mode
//! after the program, otherwise it returns to the interrupted code.
//!
//! Only hart 0 of such a module is used.

use std::time::Instant;

use bitfield::bitfield;

use crate::abstract_command::AbstractCommandErrorKind;
use crate::assembly::{self, width_for_size};
use crate::dm::{DebugModule, DmVersion};
use crate::error::RiscvError;
use crate::hart::RiscvCore;
use crate::memory::memory_fault;
use crate::progbuf::{S0, S1};
use crate::registers::csr;

/// `dbus` address of `dmcontrol`.
const DMCONTROL: u32 = 0x10;
/// `dbus` address of `dminfo`.
const DMINFO: u32 = 0x11;

/// Raises the debug interrupt of the selected hart when written, reads as set
/// until the hart finished its program.
const INTERRUPT: u64 = 1 << 33;
/// The selected hart is in debug mode.
const HALTNOT: u64 = 1 << 32;

/// Address of Debug RAM in the hart's address space.
pub const DEBUG_RAM_ADDRESS: u64 = 0x400;

/// Debug ROM entry that ends a Debug RAM program.
pub const DEBUG_ROM_RESUME: u64 = 0x804;

/// `dcsr.halt`: stay in debug mode after a Debug RAM program.
pub const DCSR_HALT: u32 = 1 << 3;

/// Debug RAM words the programs here need.
const MIN_DRAM_WORDS: usize = 16;

/// Words at the start of Debug RAM available to a program, including the
/// `dcsr.halt` update in front and the jump back to the ROM.
const PROGRAM_WORDS: usize = 8;

/// Debug RAM slots holding one register value each, in two words.
const SLOT_SAVE: usize = 8;
const SLOT_ADDRESS: usize = 10;
const SLOT_DATA: usize = 12;

/// Value the Debug ROM writes into the last Debug RAM word on an exception.
const EXCEPTION_MARKER: u32 = 0xffff_ffff;

bitfield! {
    /// `dminfo` of a 0.11 Debug Module.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Dminfo(u32);
    impl Debug;

    pub abussize, _: 31, 25;
    pub serialcount, _: 24, 21;
    pub access128, _: 20;
    pub access64, _: 19;
    pub access32, _: 18;
    pub access16, _: 17;
    pub access8, _: 16;
    pub dramsize, _: 15, 10;
    pub haltsum, _: 9;
    pub version_high, _: 7, 6;
    pub authenticated, _: 5;
    pub authbusy, _: 4;
    pub authtype, _: 3, 2;
    pub version_low, _: 1, 0;
}

impl Dminfo {
    /// Debug Module version, 1 for 0.11.
    pub fn version(&self) -> u32 {
        self.version_high() << 2 | self.version_low()
    }

    /// Words of Debug RAM.
    pub fn dram_words(&self) -> usize {
        self.dramsize() as usize + 1
    }
}

/// `dbus` address of Debug RAM word `index`. Words past the sixteenth live
/// above `dminfo`.
pub fn dram_address(index: usize) -> u32 {
    if index < 0x10 {
        index as u32
    } else {
        0x40 + index as u32 - 0x10
    }
}

/// Offset of Debug RAM word `index` from address 0, for loads and stores
/// relative to `zero`.
fn dram_offset(index: usize) -> i16 {
    (DEBUG_RAM_ADDRESS as usize + 4 * index) as i16
}

impl DebugModule<'_> {
    /// Examine a 0.11 Debug Module through `dminfo`.
    pub(crate) fn examine_legacy(&mut self) -> Result<(), RiscvError> {
        let dminfo = Dminfo(self.dtm.dbus_read(DMINFO)? as u32);
        tracing::debug!("{:?}", dminfo);

        if dminfo.version() != 1 {
            tracing::error!(
                "Debug module version {} is not supported behind a 0.11 DTM",
                dminfo.version()
            );
            return Err(RiscvError::UnsupportedDebugModuleVersion(dminfo.version() as u8));
        }

        if !dminfo.authenticated() {
            return Err(RiscvError::AuthenticationRequired);
        }

        if dminfo.dram_words() < MIN_DRAM_WORDS {
            tracing::error!(
                "The debug module has {} words of Debug RAM, at least {} are needed",
                dminfo.dram_words(),
                MIN_DRAM_WORDS
            );
            return Err(RiscvError::ResourceUnavailable("debug RAM"));
        }

        // Select hart 0.
        self.dtm.dbus_write(DMCONTROL, 0)?;

        self.state.version = DmVersion::V0_11;
        self.state.dram_words = dminfo.dram_words();
        self.state.progbuf_size = 0;
        self.state.abstract_data_count = 0;
        self.state.hart_count = Some(1);
        self.state.current_hartid = Some(0);
        self.state.hasel_supported = false;
        self.state.examined = true;

        tracing::info!(
            "Found a 0.11 debug module with {} words of Debug RAM",
            self.state.dram_words
        );

        Ok(())
    }

    fn dram_read(&mut self, index: usize) -> Result<u32, RiscvError> {
        Ok(self.dtm.dbus_read(dram_address(index))? as u32)
    }

    fn dram_write(&mut self, index: usize, value: u32, interrupt: bool) -> Result<(), RiscvError> {
        let interrupt = if interrupt { INTERRUPT } else { 0 };
        self.dtm.dbus_write(dram_address(index), u64::from(value) | interrupt)
    }

    /// Whether the hart is in debug mode.
    pub(crate) fn legacy_halted(&mut self) -> Result<bool, RiscvError> {
        Ok(self.dtm.dbus_read(DMCONTROL)? & HALTNOT != 0)
    }

    fn wait_for_program(&mut self) -> Result<(), RiscvError> {
        let start = Instant::now();
        loop {
            if self.dtm.dbus_read(DMCONTROL)? & INTERRUPT == 0 {
                return Ok(());
            }

            if start.elapsed() > self.timeout() {
                tracing::error!("The hart did not finish its Debug RAM program");
                return Err(RiscvError::Timeout);
            }
        }
    }
}

impl RiscvCore<'_> {
    fn xlen_width(&self) -> u8 {
        width_for_size(self.hart.xlen as usize / 8)
    }

    /// Run `body` from Debug RAM and wait for it to finish.
    ///
    /// `inputs` are written to their slots first. With `resume` the program
    /// clears `dcsr.halt`, otherwise it sets it and the hart stays halted.
    fn legacy_run(
        &mut self,
        body: &[u32],
        inputs: &[(usize, u64)],
        resume: bool,
    ) -> Result<(), RiscvError> {
        if body.len() + 2 > PROGRAM_WORDS {
            return Err(RiscvError::ResourceUnavailable("debug RAM"));
        }

        let mut program = Vec::with_capacity(PROGRAM_WORDS);
        program.push(if resume {
            assembly::csrrci(0, DCSR_HALT as u8, csr::DCSR)
        } else {
            assembly::csrrsi(0, DCSR_HALT as u8, csr::DCSR)
        });
        program.extend_from_slice(body);
        let jump = DEBUG_RAM_ADDRESS + 4 * program.len() as u64;
        program.push(assembly::jal(0, (DEBUG_ROM_RESUME - jump) as i32));

        self.touch();

        for (index, &word) in program.iter().enumerate() {
            self.dm.dram_write(index, word, false)?;
        }
        for &(slot, value) in inputs {
            self.dm.dram_write(slot, value as u32, false)?;
            self.dm.dram_write(slot + 1, (value >> 32) as u32, false)?;
        }

        // Clearing the exception marker starts the program.
        let last = self.dm.state.dram_words - 1;
        self.dm.dram_write(last, 0, true)?;
        self.dm.wait_for_program()?;

        if self.dm.dram_read(last)? == EXCEPTION_MARKER {
            tracing::debug!("Debug RAM program {:x?} raised an exception", body);
            return Err(RiscvError::AbstractCommand(AbstractCommandErrorKind::Exception));
        }

        Ok(())
    }

    /// Run `body` from Debug RAM, leaving the hart halted.
    pub(crate) fn legacy_exec(&mut self, body: &[u32], inputs: &[(usize, u64)]) -> Result<(), RiscvError> {
        self.legacy_run(body, inputs, false)
    }

    /// Value of `slot`: one word, or two with `wide`.
    fn slot_value(&mut self, slot: usize, wide: bool) -> Result<u64, RiscvError> {
        let low = self.dm.dram_read(slot)?;
        let high = if wide { self.dm.dram_read(slot + 1)? } else { 0 };
        Ok(u64::from(high) << 32 | u64::from(low))
    }

    /// Halt the hart. A running hart enters debug mode for the interrupt and
    /// stays there.
    pub(crate) fn legacy_halt(&mut self) -> Result<(), RiscvError> {
        self.legacy_exec(&[], &[])
    }

    /// Clear `dcsr.halt` and let the hart return from debug mode.
    pub(crate) fn legacy_resume(&mut self) -> Result<(), RiscvError> {
        self.legacy_run(&[], &[], true)
    }

    /// Find the register width by shifting all ones right twice.
    pub(crate) fn legacy_discover_xlen(&mut self) -> Result<u32, RiscvError> {
        let body = [
            assembly::xori(S0, 0, -1),
            assembly::srli(S0, S0, 31),
            assembly::store(width_for_size(4), S0, 0, dram_offset(SLOT_DATA)),
            assembly::srli(S0, S0, 31),
            assembly::store(width_for_size(4), S0, 0, dram_offset(SLOT_DATA + 1)),
        ];
        self.legacy_exec(&body, &[])?;

        match (self.dm.dram_read(SLOT_DATA)?, self.dm.dram_read(SLOT_DATA + 1)?) {
            (1, 0) => Ok(32),
            (0xffff_ffff, 3) => Ok(64),
            (0xffff_ffff, 0xffff_ffff) => {
                tracing::error!("Hart {} has 128 bit registers", self.hart.hartid);
                Err(RiscvError::Unsupported("128 bit harts"))
            }
            (low, high) => {
                tracing::error!("Unexpected register width result {:#x} {:#x}", low, high);
                Err(RiscvError::Unsupported("register width"))
            }
        }
    }

    /// Read a GPR. `s0` lives in `dscratch` while the ROM runs.
    pub(crate) fn legacy_read_gpr(&mut self, n: u8) -> Result<u64, RiscvError> {
        let mut body = Vec::with_capacity(2);
        if n == S0 {
            body.push(assembly::csrr(S0, csr::DSCRATCH0));
        }
        body.push(assembly::store(self.xlen_width(), n, 0, dram_offset(SLOT_DATA)));

        self.legacy_exec(&body, &[])?;
        self.slot_value(SLOT_DATA, self.hart.xlen > 32)
    }

    pub(crate) fn legacy_write_gpr(&mut self, n: u8, value: u64) -> Result<(), RiscvError> {
        let mut body = vec![assembly::load(self.xlen_width(), n, 0, dram_offset(SLOT_DATA))];
        if n == S0 {
            body.push(assembly::csrw(csr::DSCRATCH0, S0));
        }

        self.legacy_exec(&body, &[(SLOT_DATA, value)])
    }

    pub(crate) fn legacy_read_csr(&mut self, number: u16) -> Result<u64, RiscvError> {
        let body = [
            assembly::csrr(S0, number),
            assembly::store(self.xlen_width(), S0, 0, dram_offset(SLOT_DATA)),
        ];

        self.legacy_exec(&body, &[])?;
        self.slot_value(SLOT_DATA, self.hart.xlen > 32)
    }

    pub(crate) fn legacy_write_csr(&mut self, number: u16, value: u64) -> Result<(), RiscvError> {
        // A write without `dcsr.halt` would resume the hart.
        let value = if number == csr::DCSR {
            value | u64::from(DCSR_HALT)
        } else {
            value
        };

        let body = [
            assembly::load(self.xlen_width(), S0, 0, dram_offset(SLOT_DATA)),
            assembly::csrw(number, S0),
        ];

        self.legacy_exec(&body, &[(SLOT_DATA, value)])
    }

    /// Read an FPR through Debug RAM, which also works for doubles on RV32.
    pub(crate) fn legacy_read_fpr(&mut self, n: u8, double: bool) -> Result<u64, RiscvError> {
        let body = [assembly::store_fp(double, n, 0, dram_offset(SLOT_DATA))];

        self.legacy_exec(&body, &[])?;
        self.slot_value(SLOT_DATA, double)
    }

    pub(crate) fn legacy_write_fpr(&mut self, n: u8, value: u64, double: bool) -> Result<(), RiscvError> {
        let body = [assembly::load_fp(double, n, 0, dram_offset(SLOT_DATA))];

        self.legacy_exec(&body, &[(SLOT_DATA, value)])
    }

    /// Order memory accesses and make instruction fetches see written memory.
    pub(crate) fn legacy_fence(&mut self) -> Result<(), RiscvError> {
        match self.legacy_exec(&[assembly::FENCE_I, assembly::FENCE], &[]) {
            Err(RiscvError::AbstractCommand(AbstractCommandErrorKind::Exception)) => {
                self.legacy_exec(&[assembly::FENCE], &[])
            }
            result => result,
        }
    }

    /// Read memory one element per Debug RAM program.
    pub(crate) fn legacy_read_memory(
        &mut self,
        address: u64,
        size: usize,
        count: usize,
        buffer: &mut [u8],
    ) -> Result<(), RiscvError> {
        self.require_halted()?;

        let register_bytes = self.hart.xlen as usize / 8;
        if size > register_bytes {
            return self.legacy_read_memory(address, register_bytes, count * size / register_bytes, buffer);
        }

        let width = width_for_size(size);
        let body = [
            assembly::load(self.xlen_width(), S0, 0, dram_offset(SLOT_ADDRESS)),
            assembly::load(width, S0, S0, 0),
            assembly::store(width, S0, 0, dram_offset(SLOT_DATA)),
        ];

        for (index, element) in buffer.chunks_exact_mut(size).enumerate() {
            let element_address = address + (index * size) as u64;
            self.legacy_exec(&body, &[(SLOT_ADDRESS, element_address)])
                .map_err(|error| memory_fault(error, element_address))?;

            let value = self.slot_value(SLOT_DATA, size > 4)?;
            element.copy_from_slice(&value.to_le_bytes()[..size]);
        }

        Ok(())
    }

    /// Write memory one element per Debug RAM program. `s1` is saved in Debug RAM
    /// while the program runs.
    pub(crate) fn legacy_write_memory(
        &mut self,
        address: u64,
        size: usize,
        count: usize,
        buffer: &[u8],
    ) -> Result<(), RiscvError> {
        self.require_halted()?;

        let register_bytes = self.hart.xlen as usize / 8;
        if size > register_bytes {
            return self.legacy_write_memory(address, register_bytes, count * size / register_bytes, buffer);
        }

        let xlen_width = self.xlen_width();
        let restore_s1 = assembly::load(xlen_width, S1, 0, dram_offset(SLOT_SAVE));
        let body = [
            assembly::store(xlen_width, S1, 0, dram_offset(SLOT_SAVE)),
            assembly::load(xlen_width, S0, 0, dram_offset(SLOT_ADDRESS)),
            assembly::load(xlen_width, S1, 0, dram_offset(SLOT_DATA)),
            assembly::store(width_for_size(size), S1, S0, 0),
            restore_s1,
        ];

        for (index, element) in buffer.chunks_exact(size).enumerate() {
            let element_address = address + (index * size) as u64;
            let mut bytes = [0u8; 8];
            bytes[..size].copy_from_slice(element);

            let inputs = [
                (SLOT_ADDRESS, element_address),
                (SLOT_DATA, u64::from_le_bytes(bytes)),
            ];
            if let Err(error) = self.legacy_exec(&body, &inputs) {
                // The store faulted before `s1` was restored.
                self.legacy_exec(&[restore_s1], &[])?;
                return Err(memory_fault(error, element_address));
            }
        }

        self.legacy_fence()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dminfo_fields() {
        // version 1, authenticated, 16 words of Debug RAM
        let dminfo = Dminfo(15 << 10 | 1 << 5 | 1);

        assert_eq!(dminfo.version(), 1);
        assert!(dminfo.authenticated());
        assert_eq!(dminfo.dram_words(), 16);
    }

    #[test]
    fn version_spans_two_fields() {
        assert_eq!(Dminfo(1 << 6 | 1).version(), 5);
    }

    #[test]
    fn slots_are_reachable_from_zero() {
        assert_eq!(dram_offset(0), 0x400);
        assert_eq!(dram_offset(SLOT_DATA + 1), 0x434);
        assert_eq!(dram_offset(SLOT_SAVE) % 8, 0);
    }

    #[test]
    fn upper_debug_ram_skips_dmcontrol() {
        assert_eq!(dram_address(15), 0x0f);
        assert_eq!(dram_address(16), 0x40);
        assert_eq!(dram_address(63), 0x6f);
    }
}
