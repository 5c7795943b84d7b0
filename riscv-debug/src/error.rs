use crate::abstract_command::AbstractCommandErrorKind;
use crate::registers::RegisterNumber;
use crate::transport::TransportError;

/// Errors raised by the RISC-V debug core.
#[derive(thiserror::Error, Debug)]
pub enum RiscvError {
    /// The scan queue could not be flushed.
    #[error("An error occurred in the JTAG transport")]
    Transport(#[from] TransportError),
    /// The DMI kept reporting busy until the command timeout expired.
    #[error("The DMI stayed busy after the idle delay was increased")]
    DmiBusy,
    /// The DMI reported a failed operation.
    #[error("DMI operation at address {address:#x} failed")]
    DmiFailed {
        /// DMI address of the failed operation.
        address: u32,
    },
    /// The `dtmcs` register read back as zero.
    #[error("No RISC-V debug transport module was found (dtmcs reads as 0). Check JTAG connectivity and board power.")]
    NoRiscvTarget,
    /// The DTM version is not one of 0.11 or 0.13/1.0.
    #[error("Debug transport module version {0} is not supported")]
    UnsupportedDebugTransportModuleVersion(u8),
    /// The DM version is not 0.13 or 1.0.
    #[error("Debug module version {0} is not supported")]
    UnsupportedDebugModuleVersion(u8),
    /// `dmactive` did not read back as set after activation.
    #[error("The debug module did not become active")]
    DebugModuleInactive,
    /// `dmstatus.authenticated` is clear.
    #[error("The debug module requires authentication")]
    AuthenticationRequired,
    /// An abstract command completed with `cmderr` set.
    #[error("Abstract command failed: {0}")]
    AbstractCommand(AbstractCommandErrorKind),
    /// A memory access or address translation failed.
    #[error("Memory access at {address:#x} failed: {kind}")]
    MemoryFault {
        /// Address of the failing access.
        address: u64,
        /// Cause of the fault.
        kind: MemoryFaultKind,
    },
    /// The operation requires a halted hart.
    #[error("The hart is not halted")]
    TargetNotHalted,
    /// All triggers are in use, the program buffer is too small, or similar.
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(&'static str),
    /// A wall-clock budget expired.
    #[error("Timeout during operation")]
    Timeout,
    /// The target lacks a feature the operation needs.
    #[error("Not supported by this target: {0}")]
    Unsupported(&'static str),
    /// No hart with this index exists behind the debug module.
    #[error("Hart {0} does not exist")]
    HartNotFound(u32),
    /// No target with this id was registered.
    #[error("Target {0} does not exist")]
    TargetNotFound(usize),
    /// The register does not exist on this hart.
    #[error("Register {0:?} does not exist")]
    UnknownRegister(RegisterNumber),
    /// The hart has not been examined yet.
    #[error("The target has not been examined")]
    NotExamined,
    /// A scan batch was queried for a result it does not hold.
    #[error("The result of a batched DMI operation is not available")]
    BatchedResultNotAvailable,
    /// An argument is outside the range the operation accepts.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// No breakpoint or watchpoint with this id exists.
    #[error("No breakpoint or watchpoint with id {0}")]
    UnknownBreakpoint(i32),
    /// Error reported by a host hook.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Cause of a [`RiscvError::MemoryFault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, docsplay::Display)]
pub enum MemoryFaultKind {
    /// system bus error {0}
    Bus(u8),
    /// exception while the hart accessed memory
    DataAbort,
    /// page table walk failed
    Translation,
    /// unaligned access
    Unaligned,
}
