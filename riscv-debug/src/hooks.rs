//! Services the host provides to the debug core.

use crate::hart::TargetId;

/// Events reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetEvent {
    /// The hart halted.
    Halted,
    /// The hart resumed.
    Resumed,
    /// The hart halted while running a debugger algorithm.
    DebugHalted,
    /// The hart resumed to run a debugger algorithm.
    DebugResumed,
    /// Reset is being asserted.
    ResetAssert,
    /// The hart came out of reset or became available again.
    BecameAvailable,
}

/// A semihosting call found at `dpc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemihostingRequest {
    /// Operation number, from `a0`.
    pub operation: u64,
    /// Parameter block address, from `a1`.
    pub parameter: u64,
    /// Address of the `ebreak`.
    pub pc: u64,
}

/// Outcome of a semihosting call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemihostingOutcome {
    /// The call was not recognized. The hart stays halted on the breakpoint.
    None,
    /// The host needs more time. The hart stays halted.
    Waiting,
    /// The call was handled. `result` is written to `a0` and the hart resumes.
    Handled {
        /// Return value of the call.
        result: Option<u64>,
    },
    /// The call failed.
    Error,
}

/// An interface to the host services used by the debug core.
///
/// Every method has a default that does nothing.
pub trait DebugHooks {
    /// Called for every state change of a target.
    fn on_event(&mut self, _target: TargetId, _event: TargetEvent) {}

    /// Handle a semihosting call.
    fn semihosting(
        &mut self,
        _target: TargetId,
        _request: &SemihostingRequest,
    ) -> Result<SemihostingOutcome, anyhow::Error> {
        Ok(SemihostingOutcome::None)
    }

    /// Allocate `size` bytes of target RAM, aligned to `align`.
    fn working_area_alloc(&mut self, _target: TargetId, _size: u64, _align: u64) -> Option<u64> {
        None
    }

    /// Free an area returned by [`DebugHooks::working_area_alloc`].
    fn working_area_free(&mut self, _target: TargetId, _address: u64) {}
}

/// Hooks for a host without any services.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl DebugHooks for DefaultHooks {}
