//! # RISC-V external debug core
//!
//! Drives harts through the RISC-V Debug Module, reached over JTAG through a
//! Debug Transport Module. The crate does not talk to JTAG adapters itself: it queues
//! scans on a [`JtagAccess`] implementation and looks at the captured bits.
//!
//! ## Halting a hart and reading its memory
//!
//! ```no_run
//! # use riscv_debug::{Debugger, DebugConfig, JtagAccess, RiscvError, TapPosition};
//! # fn run(jtag: Box<dyn JtagAccess>) -> Result<(), RiscvError> {
//! let mut debugger = Debugger::new(jtag, DebugConfig::default())?;
//!
//! let hart = debugger.add_target(TapPosition(0), 0);
//! debugger.examine(hart)?;
//! debugger.halt(hart)?;
//!
//! let mut words = [0u8; 16];
//! debugger.read_memory(hart, 0x8000_0000, 4, 4, &mut words)?;
//! # Ok(())
//! # }
//! ```
//!
//! [`Debugger`] owns the scan queue and every hart. Per-hart operations are
//! implemented on [`RiscvCore`], which borrows a hart together with its Debug
//! Module for the duration of a call.

pub mod abstract_command;
mod algorithm;
pub mod assembly;
mod batch;
mod breakpoints;
pub mod config;
mod debugger;
pub mod dm;
pub mod dtm;
mod error;
mod hart;
mod hooks;
pub mod legacy;
mod memory;
pub mod mmu;
mod progbuf;
mod register_access;
pub mod register_cache;
pub mod registers;
mod sampling;
mod sba;
mod semihosting;
mod smp;
mod status;
mod transport;
pub mod triggers;

#[cfg(any(test, feature = "test"))]
pub mod fake_jtag;

pub use crate::algorithm::{ParameterDirection, RegisterParameter};
pub use crate::breakpoints::{Breakpoint, BreakpointKind, Watchpoint, WatchpointAccess};
pub use crate::config::{DebugConfig, MemoryAccessMethod, ResumeOrder};
pub use crate::debugger::Debugger;
pub use crate::error::{MemoryFaultKind, RiscvError};
pub use crate::hart::{HartState, ResetKind, RiscvCore, TargetId};
pub use crate::hooks::{DebugHooks, DefaultHooks, SemihostingOutcome, SemihostingRequest, TargetEvent};
pub use crate::registers::RegisterNumber;
pub use crate::sampling::{MemorySampler, Sample, SampleBucket, SAMPLE_BUCKETS};
pub use crate::semihosting::SemihostingAction;
pub use crate::status::{BreakpointCause, CoreStatus, HaltReason};
pub use crate::transport::{BscanTunnel, JtagAccess, TapPosition, TransportError};
pub use crate::triggers::{Etrigger, IcountTrigger, Itrigger, TriggerModes};

// Exports only used in tests
#[cfg(feature = "test")]
pub use crate::fake_jtag::{FakeJtag, MockDebugModule, MockHart, MockMemory, MockTrigger};
