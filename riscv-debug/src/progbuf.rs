//! Programs executed from the program buffer.
//!
//! A [`Program`] is assembled on the host, written to the `progbuf` registers
//! (skipping words the buffer already holds) and started with an access register
//! command that has `postexec` set.

use crate::abstract_command::{gpr_regno, AbstractCommandErrorKind, AccessSize};
use crate::assembly;
use crate::dm::registers::PROGBUF0_ADDRESS;
use crate::dm::{DebugModule, DmState};
use crate::error::RiscvError;
use crate::hart::RiscvCore;
use crate::registers::RegisterNumber;

/// `s0`
pub(crate) const S0: u8 = 8;
/// `s1`
pub(crate) const S1: u8 = 9;

/// Most instructions `exec_progbuf` takes, the size of the largest buffer.
const MAX_USER_INSTRUCTIONS: usize = 16;

/// A program for the program buffer.
#[derive(Debug, Clone)]
pub(crate) struct Program {
    instructions: Vec<u32>,
    capacity: usize,
    impebreak: bool,
    /// GPRs written by the program, as a bit mask.
    clobbered: u32,
}

impl Program {
    /// An empty program for the buffer of the DM described by `state`.
    pub(crate) fn new(state: &DmState) -> Self {
        Self {
            instructions: Vec::new(),
            capacity: state.progbuf_size as usize,
            impebreak: state.impebreak,
            clobbered: 0,
        }
    }

    /// Number of instructions that fit, leaving room for the final `ebreak`.
    pub(crate) fn max_instructions(state: &DmState) -> usize {
        let size = state.progbuf_size as usize;
        if state.impebreak {
            size
        } else {
            size.saturating_sub(1)
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Number of buffer words the program occupies, including the `ebreak`.
    pub(crate) fn footprint(&self) -> usize {
        if self.needs_ebreak() {
            self.instructions.len() + 1
        } else {
            self.instructions.len()
        }
    }

    fn needs_ebreak(&self) -> bool {
        !(self.impebreak && self.instructions.len() == self.capacity)
    }

    /// Append an instruction.
    pub(crate) fn insert(&mut self, instruction: u32) -> Result<(), RiscvError> {
        let limit = if self.impebreak {
            self.capacity
        } else {
            self.capacity.saturating_sub(1)
        };

        if self.instructions.len() >= limit {
            tracing::debug!(
                "Program of {} instructions does not fit a buffer of {} words",
                self.instructions.len() + 1,
                self.capacity
            );
            return Err(RiscvError::ResourceUnavailable("program buffer"));
        }

        self.instructions.push(instruction);
        Ok(())
    }

    fn clobber(&mut self, gpr: u8) {
        if gpr != 0 {
            self.clobbered |= 1 << gpr;
        }
    }

    /// GPRs the program overwrites.
    pub(crate) fn clobbered(&self) -> impl Iterator<Item = u8> + '_ {
        (1..32u8).filter(move |gpr| self.clobbered & (1 << gpr) != 0)
    }

    pub(crate) fn load(&mut self, size: usize, rd: u8, base: u8, offset: i16) -> Result<(), RiscvError> {
        self.clobber(rd);
        self.insert(assembly::load(assembly::width_for_size(size), rd, base, offset))
    }

    pub(crate) fn store(&mut self, size: usize, rs: u8, base: u8, offset: i16) -> Result<(), RiscvError> {
        self.insert(assembly::store(assembly::width_for_size(size), rs, base, offset))
    }

    pub(crate) fn addi(&mut self, rd: u8, rs: u8, immediate: i16) -> Result<(), RiscvError> {
        self.clobber(rd);
        self.insert(assembly::addi(rd, rs, immediate))
    }

    pub(crate) fn auipc(&mut self, rd: u8) -> Result<(), RiscvError> {
        self.clobber(rd);
        self.insert(assembly::auipc(rd, 0))
    }

    pub(crate) fn csrr(&mut self, rd: u8, csr: u16) -> Result<(), RiscvError> {
        self.clobber(rd);
        self.insert(assembly::csrr(rd, csr))
    }

    pub(crate) fn csrw(&mut self, csr: u16, rs: u8) -> Result<(), RiscvError> {
        self.insert(assembly::csrw(csr, rs))
    }

    pub(crate) fn fmv_x_f(&mut self, double: bool, rd: u8, fs: u8) -> Result<(), RiscvError> {
        self.clobber(rd);
        self.insert(assembly::fmv_x_f(double, rd, fs))
    }

    pub(crate) fn fmv_f_x(&mut self, double: bool, fd: u8, rs: u8) -> Result<(), RiscvError> {
        self.insert(assembly::fmv_f_x(double, fd, rs))
    }

    pub(crate) fn load_fp(&mut self, double: bool, fd: u8, base: u8) -> Result<(), RiscvError> {
        self.insert(assembly::load_fp(double, fd, base, 0))
    }

    pub(crate) fn store_fp(&mut self, double: bool, fs: u8, base: u8) -> Result<(), RiscvError> {
        self.insert(assembly::store_fp(double, fs, base, 0))
    }

    pub(crate) fn fence(&mut self) -> Result<(), RiscvError> {
        self.insert(assembly::FENCE)
    }

    pub(crate) fn fence_i(&mut self) -> Result<(), RiscvError> {
        self.insert(assembly::FENCE_I)
    }

    pub(crate) fn vmv_x_s(&mut self, rd: u8, vs: u8) -> Result<(), RiscvError> {
        self.clobber(rd);
        self.insert(assembly::vmv_x_s(rd, vs))
    }

    pub(crate) fn vslide1down(&mut self, vd: u8, vs: u8, rs: u8) -> Result<(), RiscvError> {
        self.insert(assembly::vslide1down_vx(vd, vs, rs))
    }

    pub(crate) fn vsetvl(&mut self, rd: u8, rs1: u8, rs2: u8) -> Result<(), RiscvError> {
        self.clobber(rd);
        self.insert(assembly::vsetvl(rd, rs1, rs2))
    }

    /// Write the program to the buffer. Words the buffer is known to hold are skipped.
    pub(crate) fn write(&self, dm: &mut DebugModule<'_>) -> Result<(), RiscvError> {
        let ebreak = self.needs_ebreak().then_some(assembly::EBREAK);

        for (index, word) in self.instructions.iter().copied().chain(ebreak).enumerate() {
            if dm.dtm.state.progbuf_cache[index] == Some(word) {
                continue;
            }
            tracing::trace!("progbuf{} <- {:#010x}", index, word);
            dm.dtm.write_progbuf(index, word)?;
        }

        Ok(())
    }
}

/// Scratch memory used to move 64 bit values on RV32 harts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scratch {
    /// `data` registers mapped into the hart's address space.
    DataWindow { address: u64, first_data: usize },
    /// `progbuf` words behind the program, mapped into the hart's address space.
    ProgbufWindow { address: u64, first_word: usize },
    /// RAM handed out by the host.
    WorkingArea { address: u64 },
}

impl Scratch {
    pub(crate) fn address(self) -> u64 {
        match self {
            Self::DataWindow { address, .. }
            | Self::ProgbufWindow { address, .. }
            | Self::WorkingArea { address } => address,
        }
    }
}

impl RiscvCore<'_> {
    /// Write a program to the buffer after saving the GPRs it overwrites.
    ///
    /// Use this when the program is started by a later command with `postexec`.
    pub(crate) fn load_program(&mut self, program: &Program) -> Result<(), RiscvError> {
        for gpr in program.clobbered() {
            self.save_register(RegisterNumber::gpr(gpr))?;
        }

        program.write(&mut self.dm)
    }

    /// Write and run a program.
    pub(crate) fn run_program(&mut self, program: &Program) -> Result<(), RiscvError> {
        self.load_program(program)?;
        self.touch();
        self.dm.execute_progbuf()
    }

    /// Run raw `instructions` in the program buffer of the halted hart.
    ///
    /// Cached registers are written back first and dropped afterwards, as the
    /// instructions may change any of them. The final `ebreak` is added when
    /// the buffer needs one.
    pub fn exec_progbuf(&mut self, instructions: &[u32]) -> Result<(), RiscvError> {
        if instructions.is_empty() || instructions.len() > MAX_USER_INSTRUCTIONS {
            return Err(RiscvError::InvalidArgument("between 1 and 16 instructions"));
        }
        self.require_halted()?;
        if self.dm.state.progbuf_size == 0 {
            tracing::error!("The target has no program buffer");
            return Err(RiscvError::Unsupported("program buffer"));
        }

        let mut program = self.new_program();
        for &instruction in instructions {
            program.insert(instruction)?;
        }

        self.flush_registers()?;
        let result = program.write(&mut self.dm).and_then(|()| {
            self.touch();
            self.dm.execute_progbuf()
        });
        self.invalidate_registers();

        result
    }

    /// Whether a program of `instructions` instructions fits the buffer.
    pub(crate) fn has_progbuf(&self, instructions: usize) -> bool {
        Program::max_instructions(self.dm.state) >= instructions
    }

    pub(crate) fn new_program(&self) -> Program {
        Program::new(self.dm.state)
    }

    /// Order memory accesses of the hart with those of the debugger, and make
    /// instruction fetches see written memory.
    pub(crate) fn execute_fence(&mut self) -> Result<(), RiscvError> {
        if self.dm.is_legacy() {
            return self.legacy_fence();
        }

        if self.dm.state.progbuf_size as usize + self.dm.state.impebreak as usize >= 3 {
            let mut program = self.new_program();
            program.fence_i()?;
            program.fence()?;

            match self.run_program(&program) {
                Ok(()) => return Ok(()),
                Err(RiscvError::AbstractCommand(AbstractCommandErrorKind::Exception)) => {
                    // Harts without Zifencei trap on fence.i.
                    let mut program = self.new_program();
                    program.fence()?;
                    return self.run_program(&program);
                }
                Err(error) => return Err(error),
            }
        }

        if !self.hart.warnings.fence {
            self.hart.warnings.fence = true;
            tracing::warn!(
                "The program buffer is too small to execute fences; memory and caches may be out of sync"
            );
        }

        Ok(())
    }

    /// Find out whether the program buffer is mapped into the hart's address space.
    ///
    /// Returns the address of `progbuf0` if the hart can write to it.
    pub(crate) fn examine_progbuf(&mut self) -> Result<Option<u64>, RiscvError> {
        if let Some(address) = self.hart.progbuf_address {
            return Ok(address);
        }

        if !self.has_progbuf(1) {
            self.hart.progbuf_address = Some(None);
            return Ok(None);
        }

        let size = self.register_size();

        let mut program = self.new_program();
        program.auipc(S0)?;
        self.run_program(&program)?;
        let address = self.dm.abstract_read_register(gpr_regno(S0), size)? as u64;

        let mut program = self.new_program();
        program.store(4, S0, S0, 0)?;
        let writable = match self.run_program(&program) {
            Ok(()) => {
                self.dm.dtm.state.invalidate_progbuf_cache();
                let written = self.dm.dmi_read(PROGBUF0_ADDRESS as u32)?;
                written == address as u32
            }
            Err(RiscvError::AbstractCommand(_)) => false,
            Err(error) => return Err(error),
        };
        self.dm.dtm.state.invalidate_progbuf_cache();

        let result = writable.then_some(address);
        tracing::debug!("Program buffer at {:#x}, writable: {}", address, writable);
        self.hart.progbuf_address = Some(result);

        Ok(result)
    }

    /// Find 8 bytes of scratch memory behind a program of `program_len` instructions.
    pub(crate) fn reserve_scratch(&mut self, program_len: usize) -> Result<Scratch, RiscvError> {
        const SIZE: u64 = 8;

        if let Some(hartinfo) = self.dm.state.hartinfo {
            if hartinfo.dataaccess() {
                let data_address = sign_extend_12(hartinfo.dataaddr());
                let aligned = data_address.wrapping_add(SIZE - 1) & !(SIZE - 1);
                let first_data = (aligned.wrapping_sub(data_address) / 4) as usize;
                if first_data + 2 <= hartinfo.datasize() as usize {
                    return Ok(Scratch::DataWindow {
                        address: aligned,
                        first_data,
                    });
                }
            }
        }

        if let Some(progbuf) = self.examine_progbuf()? {
            let start = progbuf + 4 * (program_len as u64 + 1);
            let aligned = start.div_ceil(SIZE) * SIZE;
            let end = progbuf + 4 * self.dm.state.progbuf_size as u64;
            if aligned + SIZE <= end {
                return Ok(Scratch::ProgbufWindow {
                    address: aligned,
                    first_word: ((aligned - progbuf) / 4) as usize,
                });
            }
        }

        match self.hooks.working_area_alloc(self.hart.id, SIZE, SIZE) {
            Some(address) => Ok(Scratch::WorkingArea { address }),
            None => {
                tracing::error!("No scratch memory is available to move a 64 bit value");
                Err(RiscvError::ResourceUnavailable("scratch memory"))
            }
        }
    }

    pub(crate) fn release_scratch(&mut self, scratch: Scratch) {
        if let Scratch::WorkingArea { address } = scratch {
            self.hooks.working_area_free(self.hart.id, address);
        }
    }

    pub(crate) fn scratch_read64(&mut self, scratch: Scratch) -> Result<u64, RiscvError> {
        match scratch {
            Scratch::DataWindow { first_data, .. } => {
                Ok(self.dm.read_data_at(first_data, AccessSize::U64)? as u64)
            }
            Scratch::ProgbufWindow { first_word, .. } => {
                let low = self.dm.dmi_read(PROGBUF0_ADDRESS as u32 + first_word as u32)?;
                let high = self.dm.dmi_read(PROGBUF0_ADDRESS as u32 + first_word as u32 + 1)?;
                Ok((high as u64) << 32 | low as u64)
            }
            Scratch::WorkingArea { address } => {
                let mut bytes = [0u8; 8];
                self.read_phys_memory(address, 4, 2, &mut bytes)?;
                Ok(u64::from_le_bytes(bytes))
            }
        }
    }

    pub(crate) fn scratch_write64(&mut self, scratch: Scratch, value: u64) -> Result<(), RiscvError> {
        match scratch {
            Scratch::DataWindow { first_data, .. } => {
                self.dm.write_data_at(first_data, AccessSize::U64, value as u128)
            }
            Scratch::ProgbufWindow { first_word, .. } => {
                self.dm.dtm.write_progbuf(first_word, value as u32)?;
                self.dm.dtm.write_progbuf(first_word + 1, (value >> 32) as u32)
            }
            Scratch::WorkingArea { address } => {
                self.write_phys_memory(address, 4, 2, &value.to_le_bytes())
            }
        }
    }
}

/// `hartinfo.dataaddr` is a signed 12 bit offset from address 0.
fn sign_extend_12(value: u32) -> u64 {
    (((value as i32) << 20) >> 20) as i64 as u64
}

#[cfg(test)]
mod test {
    use super::*;

    fn dm_state(progbuf_size: u8, impebreak: bool) -> DmState {
        DmState {
            progbuf_size,
            impebreak,
            ..Default::default()
        }
    }

    #[test]
    fn ebreak_is_appended() {
        let state = dm_state(2, false);
        let mut program = Program::new(&state);
        program.csrr(S0, 0x300).unwrap();

        assert_eq!(program.footprint(), 2);
        assert!(program.insert(assembly::FENCE).is_err());
    }

    #[test]
    fn implicit_ebreak_fills_buffer() {
        let state = dm_state(2, true);
        let mut program = Program::new(&state);
        program.load(4, S1, S0, 0).unwrap();
        program.addi(S0, S0, 4).unwrap();

        assert_eq!(program.footprint(), 2);
        assert_eq!(program.clobbered().collect::<Vec<_>>(), vec![S0, S1]);
    }

    #[test]
    fn empty_buffer_holds_nothing() {
        let state = dm_state(0, false);
        let mut program = Program::new(&state);

        assert!(matches!(
            program.fence(),
            Err(RiscvError::ResourceUnavailable(_))
        ));
        assert_eq!(Program::max_instructions(&state), 0);
    }

    #[test]
    fn dataaddr_is_signed() {
        assert_eq!(sign_extend_12(0x800), 0xffff_ffff_ffff_f800);
        assert_eq!(sign_extend_12(0x380), 0x380);
    }
}
