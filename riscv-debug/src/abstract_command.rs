//! Abstract commands: register access and memory access executed by the Debug Module.

use bitfield::bitfield;
use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;
use std::time::Instant;

use crate::batch::{ScanBatch, DEFAULT_BATCH_CAPACITY};
use crate::dm::registers::{Abstractcs, Command, DebugRegister, DATA0_ADDRESS};
use crate::dm::DebugModule;
use crate::error::RiscvError;

/// Errors which can occur while executing an abstract command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Primitive, docsplay::Display)]
pub enum AbstractCommandErrorKind {
    /// No error.
    None = 0,
    /// A command was issued while another one was still running.
    Busy = 1,
    /// The requested command is not supported.
    NotSupported = 2,
    /// An exception occurred while executing the command.
    Exception = 3,
    /// The command could not run because the hart was not in the required state.
    HaltResume = 4,
    /// A bus error occurred.
    Bus = 5,
    /// Reserved value.
    Reserved = 6,
    /// Some other error occurred.
    Other = 7,
}

impl AbstractCommandErrorKind {
    /// Decode `abstractcs.cmderr`.
    pub fn parse(value: u32) -> Self {
        Self::from_u32(value & 0x7).unwrap_or(Self::Other)
    }
}

bitfield! {
    /// Abstract command register, located at address 0x17
    /// This is not for all commands, only for the ones
    /// defined by the External Debug Support document.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct AccessRegisterCommand(u32);
    impl Debug;

    pub _, set_cmd_type: 31, 24;
    pub u8, _, set_aarsize: 22, 20;
    pub _, set_aarpostincrement: 19;
    pub _, set_postexec: 18;
    pub _, set_transfer: 17;
    pub _, set_write: 16;
    pub _, set_regno: 15, 0;
}

impl From<AccessRegisterCommand> for Command {
    fn from(command: AccessRegisterCommand) -> Self {
        Command(command.0)
    }
}

bitfield! {
    /// Access memory command (`cmdtype` 2).
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct AccessMemoryCommand(u32);
    impl Debug;

    pub _, set_cmd_type: 31, 24;
    pub aamvirtual, set_aamvirtual: 23;
    pub u8, _, set_aamsize: 22, 20;
    pub _, set_aampostincrement: 19;
    pub _, set_write: 16;
    pub _, set_target_specific: 15, 14;
}

impl AccessMemoryCommand {
    /// A command for an access of `size` bytes.
    pub fn new(size: AccessSize, write: bool) -> Self {
        let mut command = Self(0);
        command.set_cmd_type(2);
        command.set_aamsize(size.encoding());
        command.set_write(write);
        command
    }
}

impl From<AccessMemoryCommand> for Command {
    fn from(command: AccessMemoryCommand) -> Self {
        Command(command.0)
    }
}

/// Size of an abstract register or memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessSize {
    /// 8 bit
    U8,
    /// 16 bit
    U16,
    /// 32 bit
    U32,
    /// 64 bit
    U64,
    /// 128 bit
    U128,
}

impl AccessSize {
    /// Access size for `bits`.
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            8 => Some(Self::U8),
            16 => Some(Self::U16),
            32 => Some(Self::U32),
            64 => Some(Self::U64),
            128 => Some(Self::U128),
            _ => None,
        }
    }

    /// Access size for `bytes`.
    pub fn from_bytes(bytes: usize) -> Option<Self> {
        Self::from_bits(bytes as u32 * 8)
    }

    /// Value of the `aarsize`/`aamsize`/`sbaccess` fields.
    pub fn encoding(self) -> u8 {
        match self {
            Self::U8 => 0,
            Self::U16 => 1,
            Self::U32 => 2,
            Self::U64 => 3,
            Self::U128 => 4,
        }
    }

    /// Number of bytes.
    pub fn bytes(self) -> usize {
        1 << self.encoding()
    }

    /// Number of 32 bit `data` registers needed for a value.
    pub fn data_words(self) -> usize {
        self.bytes().div_ceil(4)
    }
}

/// Abstract register number of GPR `x<n>`.
pub const fn gpr_regno(n: u8) -> u16 {
    0x1000 + n as u16
}

/// Abstract register number of FPR `f<n>`.
pub const fn fpr_regno(n: u8) -> u16 {
    0x1020 + n as u16
}

/// Abstract register number of custom register `n`.
pub const fn custom_regno(n: u32) -> u16 {
    (0xc000 + n) as u16
}

/// Builds an access register command.
pub fn access_register(
    regno: u16,
    size: AccessSize,
    transfer: bool,
    write: bool,
    postexec: bool,
) -> AccessRegisterCommand {
    let mut command = AccessRegisterCommand(0);
    command.set_cmd_type(0);
    command.set_aarsize(size.encoding());
    command.set_transfer(transfer);
    command.set_write(write);
    command.set_postexec(postexec);
    command.set_regno(regno as u32);
    command
}

impl DebugModule<'_> {
    /// Execute an abstract command and wait for it to finish.
    ///
    /// A `busy` error grows the abstract command delay and retries. Any other error
    /// is cleared before it is returned.
    pub fn execute_abstract_command(&mut self, command: u32) -> Result<(), RiscvError> {
        let start = Instant::now();

        loop {
            tracing::debug!("Executing abstract command {:#010x}", command);

            self.dtm.write_exec(Command::ADDRESS as u32, command)?;

            let status = self.wait_for_abstract_idle(start)?;

            match AbstractCommandErrorKind::parse(status.cmderr()) {
                AbstractCommandErrorKind::None => return Ok(()),
                AbstractCommandErrorKind::Busy => {
                    self.clear_cmderr()?;
                    self.dtm.increase_ac_busy_delay();

                    if start.elapsed() > self.timeout() {
                        return Err(RiscvError::AbstractCommand(AbstractCommandErrorKind::Busy));
                    }
                }
                error => {
                    tracing::debug!(
                        "Abstract command {:#010x} failed: {:?}",
                        command,
                        error
                    );
                    self.clear_cmderr()?;
                    return Err(RiscvError::AbstractCommand(error));
                }
            }
        }
    }

    /// Poll `abstractcs` until no command is running.
    pub(crate) fn wait_for_abstract_idle(&mut self, start: Instant) -> Result<Abstractcs, RiscvError> {
        loop {
            let status: Abstractcs = self.read_dm_register()?;

            if !status.busy() {
                return Ok(status);
            }

            if start.elapsed() > self.timeout() {
                tracing::error!("Abstract command still busy after {:?}", self.timeout());
                return Err(RiscvError::Timeout);
            }
        }
    }

    /// Read `data0..` as a value of `size`.
    pub fn read_abstract_data(&mut self, size: AccessSize) -> Result<u128, RiscvError> {
        self.read_data_at(0, size)
    }

    /// Read a value of `size` starting at `data<first>`.
    pub(crate) fn read_data_at(&mut self, first: usize, size: AccessSize) -> Result<u128, RiscvError> {
        let words = size.data_words();
        let mut batch = ScanBatch::new(DEFAULT_BATCH_CAPACITY);
        let keys: Vec<_> = (0..words)
            .map(|i| batch.add_read((DATA0_ADDRESS as usize + first + i) as u32))
            .collect();
        batch.run(&mut self.dtm)?;

        let mut value = 0u128;
        for (i, key) in keys.into_iter().enumerate() {
            value |= (batch.get(key)? as u128) << (32 * i);
        }

        Ok(mask_to_size(value, size))
    }

    /// Write a value of `size` to `data0..`.
    pub fn write_abstract_data(&mut self, size: AccessSize, value: u128) -> Result<(), RiscvError> {
        self.write_data_at(0, size, value)
    }

    /// Write a value of `size` starting at `data<first>`.
    pub(crate) fn write_data_at(
        &mut self,
        first: usize,
        size: AccessSize,
        value: u128,
    ) -> Result<(), RiscvError> {
        let mut batch = ScanBatch::new(DEFAULT_BATCH_CAPACITY);
        for i in 0..size.data_words() {
            batch.add_write(
                (DATA0_ADDRESS as usize + first + i) as u32,
                (value >> (32 * i)) as u32,
            );
        }
        batch.run(&mut self.dtm)
    }

    /// Read a register with an access register command.
    pub fn abstract_read_register(
        &mut self,
        regno: u16,
        size: AccessSize,
    ) -> Result<u128, RiscvError> {
        let command = access_register(regno, size, true, false, false);
        self.execute_abstract_command(command.0)?;
        self.read_abstract_data(size)
    }

    /// Write a register with an access register command, optionally running the
    /// program buffer afterwards.
    pub fn abstract_write_register(
        &mut self,
        regno: u16,
        size: AccessSize,
        value: u128,
        postexec: bool,
    ) -> Result<(), RiscvError> {
        self.write_abstract_data(size, value)?;
        let command = access_register(regno, size, true, true, postexec);
        self.execute_abstract_command(command.0)
    }

    /// Run the program buffer without transferring a register.
    pub fn execute_progbuf(&mut self) -> Result<(), RiscvError> {
        let command = access_register(0, AccessSize::U32, false, false, true);
        self.execute_abstract_command(command.0)
    }

    /// Read memory with an access memory command.
    pub fn abstract_read_memory(
        &mut self,
        address: u64,
        size: AccessSize,
        xlen: u32,
    ) -> Result<u128, RiscvError> {
        self.write_memory_command_address(address, xlen)?;
        let command = AccessMemoryCommand::new(size, false);
        self.execute_abstract_command(command.0)?;
        self.read_abstract_data(size)
    }

    /// Write memory with an access memory command.
    pub fn abstract_write_memory(
        &mut self,
        address: u64,
        size: AccessSize,
        value: u128,
        xlen: u32,
    ) -> Result<(), RiscvError> {
        self.write_memory_command_address(address, xlen)?;
        self.write_abstract_data(size, value)?;
        let command = AccessMemoryCommand::new(size, true);
        self.execute_abstract_command(command.0)
    }

    /// `arg1` of the access memory command lives in `data1` for RV32 and in
    /// `data2`/`data3` for RV64.
    fn write_memory_command_address(&mut self, address: u64, xlen: u32) -> Result<(), RiscvError> {
        if xlen > 32 {
            self.write_data_at(2, AccessSize::U64, address as u128)
        } else {
            self.write_data_at(1, AccessSize::U32, address as u128)
        }
    }
}

fn mask_to_size(value: u128, size: AccessSize) -> u128 {
    match size {
        AccessSize::U128 => value,
        size => value & ((1u128 << (size.bytes() * 8)) - 1),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_case::test_case;

    #[test]
    fn read_x10_command() {
        let command = access_register(gpr_regno(10), AccessSize::U32, true, false, false);

        assert_eq!(command.0, 0x0022_100a);
    }

    #[test]
    fn write_s0_with_postexec() {
        let command = access_register(gpr_regno(8), AccessSize::U64, true, true, true);

        assert_eq!(command.0, 0x0037_1008);
    }

    #[test]
    fn access_memory_command() {
        let command = AccessMemoryCommand::new(AccessSize::U32, true);

        assert_eq!(command.0, 0x0221_0000);
    }

    #[test_case(0, AbstractCommandErrorKind::None)]
    #[test_case(1, AbstractCommandErrorKind::Busy)]
    #[test_case(2, AbstractCommandErrorKind::NotSupported)]
    #[test_case(3, AbstractCommandErrorKind::Exception)]
    #[test_case(4, AbstractCommandErrorKind::HaltResume)]
    #[test_case(5, AbstractCommandErrorKind::Bus)]
    #[test_case(7, AbstractCommandErrorKind::Other)]
    fn cmderr_decoding(value: u32, kind: AbstractCommandErrorKind) {
        assert_eq!(AbstractCommandErrorKind::parse(value), kind);
    }

    #[test_case(AccessSize::U8, 1)]
    #[test_case(AccessSize::U32, 1)]
    #[test_case(AccessSize::U64, 2)]
    #[test_case(AccessSize::U128, 4)]
    fn data_words(size: AccessSize, words: usize) {
        assert_eq!(size.data_words(), words);
    }

    #[test]
    fn regno_mapping() {
        assert_eq!(gpr_regno(31), 0x101f);
        assert_eq!(fpr_regno(0), 0x1020);
        assert_eq!(custom_regno(3), 0xc003);
    }
}
