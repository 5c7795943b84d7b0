//! Run control of a single hart.
//!
//! A [`HartState`] holds everything the debug core knows about a hart between
//! operations. A [`RiscvCore`] borrows that state together with the Debug Module
//! the hart sits behind and implements the operations on it.

use std::time::{Duration, Instant};

use num_traits::FromPrimitive;

use crate::abstract_command::{gpr_regno, AccessSize};
use crate::breakpoints::{Breakpoint, Watchpoint};
use crate::config::{DebugConfig, IsrMaskMode};
use crate::dm::registers::Dmstatus;
use crate::dm::DebugModule;
use crate::error::RiscvError;
use crate::hooks::{DebugHooks, TargetEvent};
use crate::register_cache::RegisterCache;
use crate::registers::{csr, misa_has, Dcsr, Mstatus, RegisterNumber};
use crate::sampling::MemorySampler;
use crate::semihosting::SemihostingAction;
use crate::status::{BreakpointCause, CoreStatus, DcsrCause, HaltReason};
use crate::transport::TapPosition;
use crate::triggers::TriggerState;

/// How long a hart may take to halt after a halt request or a single step.
const HALT_TIMEOUT: Duration = Duration::from_secs(1);

/// Halted harts with dirty registers are flushed after this much inactivity.
const IDLE_FLUSH_DELAY: Duration = Duration::from_millis(100);

/// Identifies a target registered with a [`crate::Debugger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(pub usize);

/// Kind of reset requested by [`RiscvCore::assert_reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetKind {
    /// Reset the whole system with `ndmreset`.
    #[default]
    System,
    /// Reset only the selected hart with `hartreset`, if the DM supports it.
    Hart,
}

/// Abstract commands that turned out to work. A `not supported` error clears a
/// flag, and later accesses go straight to the program buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AbstractCapabilities {
    pub(crate) read_csr: bool,
    pub(crate) write_csr: bool,
    pub(crate) read_fpr: bool,
    pub(crate) write_fpr: bool,
    pub(crate) memory: bool,
}

impl Default for AbstractCapabilities {
    fn default() -> Self {
        Self {
            read_csr: true,
            write_csr: true,
            read_fpr: true,
            write_fpr: true,
            memory: true,
        }
    }
}

/// Warnings that are only logged once per hart.
#[derive(Debug, Default)]
pub(crate) struct Warnings {
    pub(crate) range_trigger_fallback: bool,
    pub(crate) fence: bool,
    pub(crate) method_chosen: [bool; 3],
    pub(crate) method_skipped: [bool; 3],
}

/// What the SMP poll loop should do after polling a hart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NextAction {
    None,
    RemainHalted,
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    NonExistent,
    Unavailable,
    Halted,
    Running,
}

/// Everything known about a hart.
#[derive(Debug)]
pub struct HartState {
    pub(crate) id: TargetId,
    pub(crate) tap: TapPosition,
    pub(crate) hartid: u32,
    pub(crate) examined: bool,
    pub(crate) xlen: u32,
    pub(crate) misa: u64,
    pub(crate) vlenb: u64,
    pub(crate) registers: RegisterCache,
    pub(crate) triggers: TriggerState,
    pub(crate) status: CoreStatus,
    /// The hart runs an algorithm on behalf of the debugger.
    pub(crate) debug_running: bool,
    pub(crate) last_activity: Instant,
    pub(crate) prepped: bool,
    /// Halt event to report once every hart of the SMP group was polled.
    pub(crate) pending_event: Option<TargetEvent>,
    pub(crate) caps: AbstractCapabilities,
    pub(crate) warnings: Warnings,
    pub(crate) breakpoints: Vec<Breakpoint>,
    pub(crate) watchpoints: Vec<Watchpoint>,
    pub(crate) smp_group: Option<usize>,
    /// Address of the program buffer in the hart's address space, once known.
    pub(crate) progbuf_address: Option<Option<u64>>,
    /// `mstatus.FS` was switched on behind the register cache.
    pub(crate) fpu_enabled: bool,
    /// `mstatus.VS` was switched on behind the register cache.
    pub(crate) vector_enabled: bool,
    pub(crate) sampler: MemorySampler,
}

impl HartState {
    /// State of hart `hartid` behind the DTM at `tap`, not examined yet.
    pub fn new(id: TargetId, tap: TapPosition, hartid: u32) -> Self {
        Self {
            id,
            tap,
            hartid,
            examined: false,
            xlen: 0,
            misa: 0,
            vlenb: 0,
            registers: RegisterCache::default(),
            triggers: TriggerState::default(),
            status: CoreStatus::Unknown,
            debug_running: false,
            last_activity: Instant::now(),
            prepped: false,
            pending_event: None,
            caps: AbstractCapabilities::default(),
            warnings: Warnings::default(),
            breakpoints: Vec::new(),
            watchpoints: Vec::new(),
            smp_group: None,
            progbuf_address: None,
            fpu_enabled: false,
            vector_enabled: false,
            sampler: MemorySampler::default(),
        }
    }

    /// Id of the target.
    pub fn id(&self) -> TargetId {
        self.id
    }

    /// Index of the hart behind its Debug Module.
    pub fn hartid(&self) -> u32 {
        self.hartid
    }

    /// TAP position of the DTM the hart is reached through.
    pub fn tap(&self) -> TapPosition {
        self.tap
    }

    /// Last known status.
    pub fn status(&self) -> CoreStatus {
        self.status
    }

    /// Register width, 0 before examination.
    pub fn xlen(&self) -> u32 {
        self.xlen
    }

    /// Value of `misa` read during examination.
    pub fn misa(&self) -> u64 {
        self.misa
    }

    /// Whether the hart was examined.
    pub fn is_examined(&self) -> bool {
        self.examined
    }

    /// Memory sampling configuration and samples.
    pub fn sampler(&self) -> &MemorySampler {
        &self.sampler
    }

    /// The register cache.
    pub fn registers(&self) -> &RegisterCache {
        &self.registers
    }

    /// Number of hardware triggers found during examination.
    pub fn trigger_count(&self) -> usize {
        self.triggers.count()
    }

    /// Unique id of the breakpoint or watchpoint whose trigger fired last.
    pub fn trigger_hit(&self) -> Option<i32> {
        self.triggers.hit
    }
}

/// A hart together with the Debug Module it sits behind.
pub struct RiscvCore<'a> {
    pub(crate) dm: DebugModule<'a>,
    pub(crate) hart: &'a mut HartState,
    pub(crate) config: &'a DebugConfig,
    pub(crate) hooks: &'a mut dyn DebugHooks,
}

impl std::fmt::Debug for RiscvCore<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiscvCore")
            .field("dm", &self.dm)
            .field("hart", &self.hart)
            .finish()
    }
}

impl<'a> RiscvCore<'a> {
    /// Borrow a hart for an operation.
    pub fn new(
        dm: DebugModule<'a>,
        hart: &'a mut HartState,
        config: &'a DebugConfig,
        hooks: &'a mut dyn DebugHooks,
    ) -> Self {
        Self {
            dm,
            hart,
            config,
            hooks,
        }
    }

    /// State of the hart.
    pub fn state(&self) -> &HartState {
        self.hart
    }

    /// Register width of the hart.
    pub fn xlen(&self) -> u32 {
        self.hart.xlen
    }

    pub(crate) fn emit(&mut self, event: TargetEvent) {
        tracing::debug!("hart {}: {:?}", self.hart.hartid, event);
        self.hooks.on_event(self.hart.id, event);
    }

    /// Make sure the DM talks to this hart.
    pub(crate) fn select(&mut self) -> Result<(), RiscvError> {
        self.dm.select_hart(self.hart.hartid)
    }

    pub(crate) fn touch(&mut self) {
        self.hart.last_activity = Instant::now();
    }

    pub(crate) fn read_dmstatus(&mut self) -> Result<Dmstatus, RiscvError> {
        self.select()?;
        self.dm.read_dm_register()
    }

    pub(crate) fn require_halted(&self) -> Result<(), RiscvError> {
        if self.hart.status.is_halted() {
            Ok(())
        } else {
            Err(RiscvError::TargetNotHalted)
        }
    }

    /// Examine the hart: register width, `misa`, triggers and `ebreak` handling.
    ///
    /// A running hart is halted for the duration of the examination.
    pub fn examine(&mut self) -> Result<(), RiscvError> {
        self.dm.examine()?;

        let hart_count = self.dm.state.hart_count.unwrap_or(0);
        if self.hart.hartid >= hart_count {
            tracing::error!(
                "Hart {} does not exist, the debug module has {} harts",
                self.hart.hartid,
                hart_count
            );
            return Err(RiscvError::HartNotFound(self.hart.hartid));
        }

        let was_running = if self.dm.is_legacy() {
            !self.dm.legacy_halted()?
        } else {
            let status = self.read_dmstatus()?;
            if status.anyunavail() {
                return Err(RiscvError::ResourceUnavailable("hart is unavailable"));
            }
            !status.allhalted()
        };
        if was_running {
            self.request_halt()?;
        }

        let xlen = self.discover_xlen()?;
        self.hart.xlen = xlen;
        self.hart.registers = RegisterCache::new(xlen, 0, 0, self.config);
        self.hart.fpu_enabled = false;
        self.hart.vector_enabled = false;
        self.hart.progbuf_address = None;

        let misa = self.read_register(RegisterNumber::csr(csr::MISA))?;
        self.hart.misa = misa;

        if misa_has(misa, 'V') {
            self.hart.vlenb = self.read_register(RegisterNumber::csr(csr::VLENB))?;
        }

        // The temporary cache may hold a saved mstatus.
        self.flush_registers()?;
        self.hart.registers = RegisterCache::new(xlen, misa, self.hart.vlenb, self.config);

        self.hart.triggers = TriggerState::default();
        self.enumerate_triggers()?;
        self.apply_ebreak_settings()?;
        self.flush_registers()?;

        self.hart.examined = true;

        if was_running {
            self.request_resume()?;
            self.invalidate_registers();
            self.hart.status = CoreStatus::Running;
        } else {
            self.hart.status = CoreStatus::Halted(HaltReason::Unknown);
        }

        tracing::info!(
            "Examined hart {}: xlen {}, misa {:#x}, {} triggers",
            self.hart.hartid,
            xlen,
            misa,
            self.hart.triggers.count()
        );

        Ok(())
    }

    /// Find the register width by reading `s0` with decreasing access sizes.
    fn discover_xlen(&mut self) -> Result<u32, RiscvError> {
        if self.dm.is_legacy() {
            return self.legacy_discover_xlen();
        }

        let s0 = gpr_regno(8);

        if self.dm.abstract_read_register(s0, AccessSize::U128).is_ok() {
            tracing::error!("Hart {} has 128 bit registers", self.hart.hartid);
            return Err(RiscvError::Unsupported("128 bit harts"));
        }

        if self.dm.abstract_read_register(s0, AccessSize::U64).is_ok() {
            return Ok(64);
        }

        match self.dm.abstract_read_register(s0, AccessSize::U32) {
            Ok(_) => Ok(32),
            Err(error) => {
                tracing::error!("Unable to read s0 with an abstract command: {}", error);
                Err(RiscvError::Unsupported("abstract GPR access"))
            }
        }
    }

    fn run_state(&mut self) -> Result<RunState, RiscvError> {
        if self.dm.is_legacy() {
            return Ok(if self.dm.legacy_halted()? {
                RunState::Halted
            } else {
                RunState::Running
            });
        }

        let mut status = self.read_dmstatus()?;

        if status.anynonexistent() {
            return Ok(RunState::NonExistent);
        }

        if status.anyhavereset() {
            tracing::info!("Hart {} unexpectedly reset", self.hart.hartid);

            let mut control = self.dm.dmcontrol();
            control.set_ackhavereset(true);
            self.dm.write_dm_register(control)?;

            self.invalidate_registers();
            self.emit(TargetEvent::BecameAvailable);

            // A hart that was halted before the reset is halted again.
            if self.hart.status.is_halted() {
                self.request_halt()?;
                self.apply_ebreak_settings()?;
            }

            status = self.read_dmstatus()?;
        }

        Ok(if status.anyunavail() {
            RunState::Unavailable
        } else if status.allhalted() {
            RunState::Halted
        } else {
            RunState::Running
        })
    }

    /// Update the status of the hart.
    ///
    /// A transition to halted decodes the halt reason and handles semihosting calls.
    /// The halt event is not emitted here, but left in `pending_event` for the SMP
    /// poll loop.
    pub(crate) fn poll_hart(&mut self) -> Result<NextAction, RiscvError> {
        let previous = self.hart.status;
        let state = self.run_state()?;

        if state == RunState::NonExistent {
            tracing::error!("Hart {} is non-existent", self.hart.hartid);
            self.hart.status = CoreStatus::NonExistent;
            return Err(RiscvError::HartNotFound(self.hart.hartid));
        }

        if state == RunState::Halted
            && self.hart.last_activity.elapsed() > IDLE_FLUSH_DELAY
            && self.hart.registers.any_dirty()
        {
            // The session may end without resuming the hart.
            self.flush_registers()?;
        }

        let changed = !matches!(
            (previous, state),
            (CoreStatus::Halted(_), RunState::Halted)
                | (CoreStatus::Running, RunState::Running)
                | (CoreStatus::Unavailable, RunState::Unavailable)
        );

        if !changed {
            return Ok(NextAction::None);
        }

        match state {
            RunState::Halted => {
                if previous == CoreStatus::Unavailable {
                    tracing::info!("Hart {} became available (halted)", self.hart.hartid);
                }

                let reason = self.halt_reason()?;
                tracing::debug!("Hart {} halted: {:?}", self.hart.hartid, reason);
                self.hart.status = CoreStatus::Halted(reason);

                if reason == HaltReason::Breakpoint(BreakpointCause::Software) {
                    match self.semihosting()? {
                        SemihostingAction::NotSemihosting => {}
                        SemihostingAction::RemainHalted => {
                            self.hart.status =
                                CoreStatus::Halted(HaltReason::Breakpoint(BreakpointCause::Semihosting));
                            return Ok(NextAction::RemainHalted);
                        }
                        SemihostingAction::Resume => {
                            self.hart.status =
                                CoreStatus::Halted(HaltReason::Breakpoint(BreakpointCause::Semihosting));
                            return Ok(NextAction::Resume);
                        }
                    }
                }

                self.hart.pending_event = Some(if self.hart.debug_running {
                    TargetEvent::DebugHalted
                } else {
                    TargetEvent::Halted
                });
                self.hart.debug_running = false;
            }
            RunState::Running => {
                if previous == CoreStatus::Unavailable {
                    tracing::info!("Hart {} became available (running)", self.hart.hartid);
                }
                self.hart.status = CoreStatus::Running;
            }
            RunState::Unavailable => {
                tracing::info!("Hart {} became unavailable", self.hart.hartid);
                self.hart.status = CoreStatus::Unavailable;
            }
            RunState::NonExistent => {}
        }

        Ok(NextAction::None)
    }

    /// Poll the hart and report a halt right away.
    ///
    /// Semihosting calls that were handled resume the hart.
    pub fn poll(&mut self) -> Result<CoreStatus, RiscvError> {
        match self.poll_hart()? {
            NextAction::Resume => self.resume(true, 0, false, false)?,
            NextAction::RemainHalted | NextAction::None => {}
        }

        if let Some(event) = self.hart.pending_event.take() {
            self.emit(event);
        }

        Ok(self.hart.status)
    }

    fn halt_reason(&mut self) -> Result<HaltReason, RiscvError> {
        let dcsr = Dcsr::from(self.read_register(RegisterNumber::csr(csr::DCSR))? as u32);

        let reason = match DcsrCause::from_u32(dcsr.cause()) {
            Some(DcsrCause::Ebreak) => HaltReason::Breakpoint(BreakpointCause::Software),
            Some(DcsrCause::Trigger) => {
                let hit = self.detect_trigger_hit()?;
                self.hart.triggers.hit = hit;

                match hit {
                    Some(id) if self.hart.breakpoints.iter().any(|bp| bp.id == id) => {
                        HaltReason::Breakpoint(BreakpointCause::Hardware)
                    }
                    _ => HaltReason::Watchpoint,
                }
            }
            Some(DcsrCause::HaltRequest | DcsrCause::ResetHaltRequest | DcsrCause::Group) => {
                HaltReason::Request
            }
            Some(DcsrCause::Step) => HaltReason::Step,
            None => {
                tracing::error!("Unknown dcsr.cause {}", dcsr.cause());
                HaltReason::Unknown
            }
        };

        Ok(reason)
    }

    /// Halt the hart.
    pub fn halt(&mut self) -> Result<(), RiscvError> {
        self.halt_prep();
        if self.hart.prepped {
            self.halt_go()?;
        }
        self.halt_finish();
        Ok(())
    }

    pub(crate) fn halt_prep(&mut self) {
        self.hart.prepped = false;

        match self.hart.status {
            CoreStatus::Halted(_) => tracing::debug!("Hart {} is already halted", self.hart.hartid),
            CoreStatus::Unavailable => tracing::debug!("Hart {} is unavailable", self.hart.hartid),
            _ => self.hart.prepped = true,
        }
    }

    pub(crate) fn halt_go(&mut self) -> Result<(), RiscvError> {
        if self.run_state()? != RunState::Halted {
            self.request_halt()?;
        }

        self.mark_halted();
        self.apply_ebreak_settings()
    }

    /// Record that the hart halted on our request, e.g. through the hart array mask.
    pub(crate) fn mark_halted(&mut self) {
        self.invalidate_registers();

        if !self.hart.status.is_halted() {
            self.hart.status = CoreStatus::Halted(HaltReason::Request);
        }
    }

    pub(crate) fn halt_finish(&mut self) {
        self.hart.prepped = false;
        if self.hart.status.is_halted() {
            self.emit(TargetEvent::Halted);
        }
    }

    /// Set `haltreq` and wait for the hart to halt.
    pub(crate) fn request_halt(&mut self) -> Result<(), RiscvError> {
        if self.dm.is_legacy() {
            self.legacy_halt()?;
            return if self.wait_for_halt(HALT_TIMEOUT)? {
                Ok(())
            } else {
                tracing::error!("Hart {} failed to halt", self.hart.hartid);
                Err(RiscvError::Timeout)
            };
        }

        self.select()?;

        let mut control = self.dm.dmcontrol();
        control.set_haltreq(true);
        self.dm.write_dm_register(control)?;

        let halted = self.wait_for_halt(HALT_TIMEOUT)?;

        // Clear the halt request.
        let control = self.dm.dmcontrol();
        self.dm.write_dm_register(control)?;

        if !halted {
            let status = self.read_dmstatus()?;
            tracing::error!("Hart {} failed to halt: {:?}", self.hart.hartid, status);
            return Err(RiscvError::Timeout);
        }

        Ok(())
    }

    pub(crate) fn wait_for_halt(&mut self, timeout: Duration) -> Result<bool, RiscvError> {
        let start = Instant::now();
        loop {
            let halted = if self.dm.is_legacy() {
                self.dm.legacy_halted()?
            } else {
                self.read_dmstatus()?.allhalted()
            };
            if halted {
                return Ok(true);
            }
            if start.elapsed() > timeout {
                return Ok(false);
            }
        }
    }

    /// Set `resumereq` and wait for the acknowledgement.
    pub(crate) fn request_resume(&mut self) -> Result<(), RiscvError> {
        if self.dm.is_legacy() {
            return self.legacy_resume();
        }

        self.select()?;

        let mut control = self.dm.dmcontrol();
        control.set_resumereq(true);
        self.dm.write_dm_register(control)?;

        let start = Instant::now();
        loop {
            let status: Dmstatus = self.dm.read_dm_register()?;
            if status.allresumeack() {
                break;
            }

            if start.elapsed() > self.dm.timeout() {
                tracing::error!("Hart {} did not acknowledge the resume request", self.hart.hartid);
                let control = self.dm.dmcontrol();
                self.dm.write_dm_register(control)?;
                return Err(RiscvError::Timeout);
            }
        }

        let control = self.dm.dmcontrol();
        self.dm.write_dm_register(control)
    }

    /// Resume the hart.
    ///
    /// With `current` unset the hart resumes at `address`. With `handle_breakpoints`
    /// the hart first steps over a breakpoint at the resume address.
    pub fn resume(
        &mut self,
        current: bool,
        address: u64,
        handle_breakpoints: bool,
        debug_execution: bool,
    ) -> Result<(), RiscvError> {
        if !self.hart.status.is_halted() {
            tracing::debug!("Hart {} is not halted, not resuming", self.hart.hartid);
            return Ok(());
        }

        self.resume_prep(current, address, handle_breakpoints)?;
        self.resume_go()?;
        self.resume_finish(debug_execution);

        Ok(())
    }

    /// Get the hart ready to resume: set the PC, step over breakpoints and write
    /// back every dirty register.
    pub(crate) fn resume_prep(
        &mut self,
        current: bool,
        address: u64,
        handle_breakpoints: bool,
    ) -> Result<(), RiscvError> {
        if !current {
            self.write_register(RegisterNumber::PC, address)?;
        }

        if handle_breakpoints {
            // Running off a trigger at the current PC needs a step.
            self.step_over(true)?;
        }

        self.flush_registers()?;

        tracing::debug!("Hart {} is prepped", self.hart.hartid);
        self.hart.prepped = true;

        Ok(())
    }

    pub(crate) fn resume_go(&mut self) -> Result<(), RiscvError> {
        if self.run_state()? == RunState::Halted {
            self.request_resume()?;
        } else {
            tracing::debug!("Hart {} was already resumed", self.hart.hartid);
        }

        self.invalidate_registers();
        Ok(())
    }

    pub(crate) fn resume_finish(&mut self, debug_execution: bool) {
        self.invalidate_registers();
        self.hart.prepped = false;
        self.hart.status = CoreStatus::Running;
        self.hart.debug_running = debug_execution;

        self.emit(if debug_execution {
            TargetEvent::DebugResumed
        } else {
            TargetEvent::Resumed
        });
    }

    /// Execute a single instruction.
    pub fn step(
        &mut self,
        current: bool,
        address: u64,
        handle_breakpoints: bool,
    ) -> Result<(), RiscvError> {
        self.require_halted()?;

        if !current {
            self.write_register(RegisterNumber::PC, address)?;
        }

        self.step_over(handle_breakpoints)?;

        self.hart.status = CoreStatus::Running;
        self.emit(TargetEvent::Resumed);
        self.hart.status = CoreStatus::Halted(HaltReason::Step);
        self.emit(TargetEvent::Halted);

        Ok(())
    }

    /// Step with triggers disabled and, with `handle_breakpoints`, without the
    /// software breakpoint at the PC.
    fn step_over(&mut self, handle_breakpoints: bool) -> Result<(), RiscvError> {
        let breakpoint = if handle_breakpoints {
            let pc = self.read_register(RegisterNumber::PC)?;
            let index = self
                .hart
                .breakpoints
                .iter()
                .position(|bp| bp.address == pc && bp.is_set);
            if let Some(index) = index {
                self.unset_breakpoint(index)?;
            }
            index
        } else {
            None
        };

        let disabled = self.disable_triggers()?;

        let result = self.step_with_interrupt_mask();

        let triggers = self.enable_triggers(&disabled);
        let restored = match breakpoint {
            Some(index) => self.set_breakpoint(index),
            None => Ok(()),
        };

        result?;
        triggers?;
        restored
    }

    fn step_with_interrupt_mask(&mut self) -> Result<(), RiscvError> {
        let mstatus_number = RegisterNumber::csr(csr::MSTATUS);

        let saved = match self.config.isr_mask {
            IsrMaskMode::StepOnly => {
                let mstatus = self.read_register(mstatus_number)?;
                let masked = Mstatus::from(mstatus).with_interrupts_masked();
                self.set_register(mstatus_number, u64::from(masked))?;
                Some(mstatus)
            }
            IsrMaskMode::Off => None,
        };

        let result = self.step_hart();

        if let Some(mstatus) = saved {
            self.write_register(mstatus_number, mstatus)?;
        }

        result
    }

    /// Single step with `dcsr.step`.
    fn step_hart(&mut self) -> Result<(), RiscvError> {
        let dcsr_number = RegisterNumber::csr(csr::DCSR);

        let mut dcsr = Dcsr::from(self.read_register(dcsr_number)? as u32);
        dcsr.set_step(true);
        self.set_register(dcsr_number, u32::from(dcsr) as u64)?;

        self.flush_registers()?;
        self.request_resume()?;
        self.invalidate_registers();

        let halted = self.wait_for_halt(HALT_TIMEOUT)?;
        if !halted {
            tracing::error!("Hart {} did not halt after a single step", self.hart.hartid);
            self.request_halt()?;
        }

        let mut dcsr = Dcsr::from(self.read_register(dcsr_number)? as u32);
        dcsr.set_step(false);
        self.write_register(dcsr_number, u32::from(dcsr) as u64)?;

        if halted {
            Ok(())
        } else {
            Err(RiscvError::Timeout)
        }
    }

    /// Make `ebreak` enter debug mode in the privilege modes the configuration asks for.
    pub(crate) fn apply_ebreak_settings(&mut self) -> Result<(), RiscvError> {
        let number = RegisterNumber::csr(csr::DCSR);
        let original = Dcsr::from(self.read_register(number)? as u32);

        let misa = self.hart.misa;
        let supervisor = self.config.ebreaks && misa_has(misa, 'S');
        let user = self.config.ebreaku && misa_has(misa, 'U');
        let hypervisor = misa_has(misa, 'H');

        let mut dcsr = original;
        dcsr.set_ebreakm(self.config.ebreakm);
        dcsr.set_ebreaks(supervisor);
        dcsr.set_ebreaku(user);
        dcsr.set_ebreakvs(hypervisor && supervisor);
        dcsr.set_ebreakvu(hypervisor && user);

        if dcsr != original {
            self.write_register(number, u32::from(dcsr) as u64)?;
        }

        Ok(())
    }

    fn require_reset_control(&self) -> Result<(), RiscvError> {
        if self.dm.is_legacy() {
            tracing::error!("Resetting through a 0.11 debug module is not supported");
            return Err(RiscvError::Unsupported("reset through a 0.11 debug module"));
        }
        Ok(())
    }

    /// Put the system (or the hart) into reset.
    ///
    /// With `reset_halt` configured, the hart is asked to halt when it comes out
    /// of reset, through `setresethaltreq` if the DM has it.
    pub fn assert_reset(&mut self, kind: ResetKind) -> Result<(), RiscvError> {
        self.require_reset_control()?;

        let status = self.read_dmstatus()?;

        if self.config.reset_halt && status.hasresethaltreq() {
            let mut control = self.dm.dmcontrol();
            control.set_setresethaltreq(true);
            self.dm.write_dm_register(control)?;
        }

        let mut control = self.dm.dmcontrol();
        control.set_haltreq(self.config.reset_halt);
        match kind {
            ResetKind::System => control.set_ndmreset(true),
            ResetKind::Hart => control.set_hartreset(true),
        }
        self.dm.write_dm_register(control)?;

        if kind == ResetKind::Hart {
            let readback: crate::dm::registers::Dmcontrol = self.dm.read_dm_register()?;
            if !readback.hartreset() {
                tracing::warn!("hartreset is not supported, resetting the system instead");
                control.set_ndmreset(true);
                self.dm.write_dm_register(control)?;
            }
        }

        self.invalidate_registers();
        self.dm.dtm.state.invalidate_progbuf_cache();
        self.hart.status = CoreStatus::Unknown;

        self.emit(TargetEvent::ResetAssert);

        Ok(())
    }

    /// Release the reset and wait for the hart to come out of it.
    pub fn deassert_reset(&mut self) -> Result<(), RiscvError> {
        self.require_reset_control()?;
        self.select()?;

        let reset_halt = self.config.reset_halt;

        // Release the reset, but keep requesting a halt.
        let mut control = self.dm.dmcontrol();
        control.set_haltreq(reset_halt);
        self.dm.write_dm_register(control)?;

        let start = Instant::now();
        let status = loop {
            let status = self.read_dmstatus()?;

            let done = !status.anyunavail()
                && if reset_halt {
                    status.allhalted()
                } else {
                    status.allrunning()
                };

            if done {
                break status;
            }

            if start.elapsed() > self.config.reset_timeout() {
                tracing::error!(
                    "Hart {} did not come out of reset within {:?}: {:?}",
                    self.hart.hartid,
                    self.config.reset_timeout(),
                    status
                );
                return Err(RiscvError::Timeout);
            }
        };

        let mut control = self.dm.dmcontrol();
        control.set_ackhavereset(status.allhavereset());
        control.set_clrresethaltreq(reset_halt);
        self.dm.write_dm_register(control)?;

        self.invalidate_registers();
        self.hart.triggers.clear_assignments();

        if reset_halt {
            self.hart.status = CoreStatus::Halted(HaltReason::Request);
            self.apply_ebreak_settings()?;
        } else {
            self.hart.status = CoreStatus::Running;
        }

        Ok(())
    }
}
