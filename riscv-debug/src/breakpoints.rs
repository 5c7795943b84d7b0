//! Breakpoints and watchpoints.
//!
//! Software breakpoints replace the instruction with `ebreak`. Hardware
//! breakpoints and watchpoints each take one or two triggers.

use crate::error::{MemoryFaultKind, RiscvError};
use crate::hart::RiscvCore;
use crate::registers::{csr, RegisterNumber};
use crate::triggers::TriggerRequest;

/// `ebreak`
const EBREAK: u32 = 0x0010_0073;
/// `c.ebreak`
const C_EBREAK: u16 = 0x9002;

const OPCODE_LOAD: u32 = 0x03;
const OPCODE_STORE: u32 = 0x23;

/// How a breakpoint stops the hart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointKind {
    /// An `ebreak` written over the instruction.
    Software,
    /// An execute trigger.
    Hardware,
}

/// An execution breakpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub(crate) id: i32,
    pub(crate) address: u64,
    pub(crate) length: u64,
    pub(crate) kind: BreakpointKind,
    /// Instruction bytes replaced by a software breakpoint.
    pub(crate) original: Vec<u8>,
    pub(crate) is_set: bool,
}

impl Breakpoint {
    /// Unique id of the breakpoint.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Address of the instruction.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// How the breakpoint is implemented.
    pub fn kind(&self) -> BreakpointKind {
        self.kind
    }

    /// Whether the breakpoint is currently armed.
    pub fn is_set(&self) -> bool {
        self.is_set
    }
}

/// Accesses a watchpoint reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchpointAccess {
    Read,
    Write,
    ReadWrite,
}

impl WatchpointAccess {
    fn reads(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    fn writes(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// A data watchpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watchpoint {
    pub(crate) id: i32,
    pub(crate) address: u64,
    pub(crate) length: u64,
    pub(crate) access: WatchpointAccess,
    pub(crate) is_set: bool,
}

impl Watchpoint {
    /// Unique id of the watchpoint.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// First watched address.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Number of watched bytes.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Watched accesses.
    pub fn access(&self) -> WatchpointAccess {
        self.access
    }
}

/// Address a load or store instruction accesses, given the value of its base register.
///
/// Returns `None` for other instructions.
pub(crate) fn access_address(instruction: u32, base: u64) -> Option<u64> {
    let immediate = match instruction & 0x7f {
        OPCODE_LOAD => ((instruction as i32) >> 20) as i64,
        OPCODE_STORE => {
            let low = (instruction >> 7) & 0x1f;
            let high = ((instruction as i32) >> 25) << 5;
            (high | low as i32) as i64
        }
        _ => return None,
    };

    Some(base.wrapping_add(immediate as u64))
}

/// Base register of a load or store.
fn rs1(instruction: u32) -> u8 {
    ((instruction >> 15) & 0x1f) as u8
}

fn ebreak_bytes(length: u64) -> Result<Vec<u8>, RiscvError> {
    match length {
        2 => Ok(C_EBREAK.to_le_bytes().to_vec()),
        4 => Ok(EBREAK.to_le_bytes().to_vec()),
        _ => {
            tracing::error!("Software breakpoints must be 2 or 4 bytes long, not {}", length);
            Err(RiscvError::InvalidArgument("breakpoint length"))
        }
    }
}

impl RiscvCore<'_> {
    fn next_unique_id(&self) -> i32 {
        let breakpoints = self.hart.breakpoints.iter().map(|bp| bp.id);
        let watchpoints = self.hart.watchpoints.iter().map(|wp| wp.id);
        breakpoints.chain(watchpoints).max().unwrap_or(0) + 1
    }

    fn arm_software_breakpoint(&mut self, address: u64, length: u64) -> Result<Vec<u8>, RiscvError> {
        let ebreak = ebreak_bytes(length)?;

        let mut original = vec![0; ebreak.len()];
        self.read_buffer(address, &mut original)?;
        self.write_buffer(address, &ebreak)?;

        let mut readback = vec![0; ebreak.len()];
        self.read_buffer(address, &mut readback)?;
        if readback != ebreak {
            tracing::error!(
                "Failed to write a software breakpoint at {:#x}: read back {:02x?}",
                address,
                readback
            );
            // The memory may be read-only, leave it as it was.
            self.write_buffer(address, &original)?;
            return Err(RiscvError::MemoryFault {
                address,
                kind: MemoryFaultKind::DataAbort,
            });
        }

        if self.hart.status.is_halted() {
            self.execute_fence()?;
        }

        Ok(original)
    }

    fn execute_request(id: i32, address: u64, length: u64) -> TriggerRequest {
        TriggerRequest {
            address,
            length,
            read: false,
            write: false,
            execute: true,
            unique_id: id,
        }
    }

    /// Add a breakpoint at `address` and return its id.
    ///
    /// `length` is the size of the instruction, 2 or 4 bytes for software breakpoints.
    pub fn add_breakpoint(
        &mut self,
        address: u64,
        length: u64,
        kind: BreakpointKind,
    ) -> Result<i32, RiscvError> {
        let id = self.next_unique_id();

        let original = match kind {
            BreakpointKind::Software => self.arm_software_breakpoint(address, length)?,
            BreakpointKind::Hardware => {
                self.add_trigger(&Self::execute_request(id, address, length))?;
                Vec::new()
            }
        };

        tracing::debug!("Added {:?} breakpoint {} at {:#x}", kind, id, address);

        self.hart.breakpoints.push(Breakpoint {
            id,
            address,
            length,
            kind,
            original,
            is_set: true,
        });

        Ok(id)
    }

    /// Remove the breakpoint with id `id`.
    pub fn remove_breakpoint(&mut self, id: i32) -> Result<(), RiscvError> {
        let index = self
            .hart
            .breakpoints
            .iter()
            .position(|bp| bp.id == id)
            .ok_or(RiscvError::UnknownBreakpoint(id))?;

        if self.hart.breakpoints[index].is_set {
            self.unset_breakpoint(index)?;
        }

        self.hart.breakpoints.remove(index);
        Ok(())
    }

    /// Disarm the breakpoint at `index`, keeping it in the list.
    pub(crate) fn unset_breakpoint(&mut self, index: usize) -> Result<(), RiscvError> {
        let breakpoint = self.hart.breakpoints[index].clone();

        match breakpoint.kind {
            BreakpointKind::Software => {
                self.write_buffer(breakpoint.address, &breakpoint.original)?;
                if self.hart.status.is_halted() {
                    self.execute_fence()?;
                }
            }
            BreakpointKind::Hardware => self.remove_trigger(breakpoint.id)?,
        }

        self.hart.breakpoints[index].is_set = false;
        Ok(())
    }

    /// Re-arm the breakpoint at `index`.
    pub(crate) fn set_breakpoint(&mut self, index: usize) -> Result<(), RiscvError> {
        let breakpoint = self.hart.breakpoints[index].clone();

        match breakpoint.kind {
            BreakpointKind::Software => {
                let original = self.arm_software_breakpoint(breakpoint.address, breakpoint.length)?;
                self.hart.breakpoints[index].original = original;
            }
            BreakpointKind::Hardware => self.add_trigger(&Self::execute_request(
                breakpoint.id,
                breakpoint.address,
                breakpoint.length,
            ))?,
        }

        self.hart.breakpoints[index].is_set = true;
        Ok(())
    }

    /// Add a watchpoint on `length` bytes at `address` and return its id.
    pub fn add_watchpoint(
        &mut self,
        address: u64,
        length: u64,
        access: WatchpointAccess,
    ) -> Result<i32, RiscvError> {
        let id = self.next_unique_id();

        self.add_trigger(&TriggerRequest {
            address,
            length,
            read: access.reads(),
            write: access.writes(),
            execute: false,
            unique_id: id,
        })?;

        tracing::debug!("Added {:?} watchpoint {} on {:#x}+{}", access, id, address, length);

        self.hart.watchpoints.push(Watchpoint {
            id,
            address,
            length,
            access,
            is_set: true,
        });

        Ok(id)
    }

    /// Remove the watchpoint with id `id`.
    pub fn remove_watchpoint(&mut self, id: i32) -> Result<(), RiscvError> {
        let index = self
            .hart
            .watchpoints
            .iter()
            .position(|wp| wp.id == id)
            .ok_or(RiscvError::UnknownBreakpoint(id))?;

        if self.hart.watchpoints[index].is_set {
            self.remove_trigger(id)?;
        }

        self.hart.watchpoints.remove(index);
        Ok(())
    }

    /// The watchpoint that halted the hart.
    ///
    /// When the trigger that fired is not known, the load or store at `dpc` is
    /// decoded and its address looked up.
    pub fn hit_watchpoint(&mut self) -> Result<Option<Watchpoint>, RiscvError> {
        if let Some(hit) = self.hart.triggers.hit {
            if let Some(watchpoint) = self.hart.watchpoints.iter().find(|wp| wp.id == hit) {
                return Ok(Some(watchpoint.clone()));
            }
        }

        self.require_halted()?;

        let dpc = self.read_register(RegisterNumber::csr(csr::DPC))?;
        let mut buffer = [0u8; 4];
        self.read_memory(dpc, 4, 1, &mut buffer)?;
        let instruction = u32::from_le_bytes(buffer);

        let base_register = rs1(instruction);
        let base = self.read_register(RegisterNumber::gpr(base_register))?;
        let Some(address) = access_address(instruction, base) else {
            tracing::debug!("{:#010x} at {:#x} is not a load or store", instruction, dpc);
            return Ok(None);
        };

        tracing::debug!("{:#010x} at {:#x} accesses {:#x}", instruction, dpc, address);

        Ok(self
            .hart
            .watchpoints
            .iter()
            .find(|wp| wp.address == address)
            .cloned())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    // lw a0, 8(s0)
    #[test_case(0x0084_2503, 0x1000, Some(0x1008); "load")]
    // lw a0, -4(s0)
    #[test_case(0xffc4_2503, 0x1000, Some(0x0ffc); "load negative offset")]
    // sw a1, 12(s0)
    #[test_case(0x00b4_2623, 0x2000, Some(0x200c); "store")]
    // sw a1, -32(s0)
    #[test_case(0xfeb4_2023, 0x2000, Some(0x1fe0); "store negative offset")]
    // addi a0, a0, 1
    #[test_case(0x0015_0513, 0x2000, None; "not a memory access")]
    fn decoded_access_address(instruction: u32, base: u64, expected: Option<u64>) {
        assert_eq!(access_address(instruction, base), expected);
    }

    #[test]
    fn base_register() {
        assert_eq!(rs1(0x0084_2503), 8);
        assert_eq!(rs1(0x00b4_2623), 8);
    }

    #[test]
    fn ebreak_encodings() {
        assert_eq!(ebreak_bytes(2).unwrap(), vec![0x02, 0x90]);
        assert_eq!(ebreak_bytes(4).unwrap(), vec![0x73, 0x00, 0x10, 0x00]);
        assert!(ebreak_bytes(3).is_err());
    }
}
