//! The [`Debugger`] owns the scan queue, the Debug Module sessions and every hart.
//!
//! Operations address harts by [`TargetId`]. Each call borrows the hart together
//! with its Debug Module session for the duration of the operation.

use std::collections::HashMap;
use std::time::Duration;

use crate::algorithm::RegisterParameter;
use crate::breakpoints::{BreakpointKind, Watchpoint, WatchpointAccess};
use crate::config::DebugConfig;
use crate::dm::{DebugModule, DmSession};
use crate::error::RiscvError;
use crate::hart::{HartState, ResetKind, RiscvCore, TargetId};
use crate::hooks::{DebugHooks, DefaultHooks};
use crate::register_cache::RegisterDescription;
use crate::registers::RegisterNumber;
use crate::sampling::{Sample, SampleBucket};
use crate::status::CoreStatus;
use crate::transport::{BscanTunnel, JtagAccess, TapPosition};
use crate::triggers::{Etrigger, IcountTrigger, Itrigger};

/// Entry point of the debug core.
pub struct Debugger {
    pub(crate) jtag: Box<dyn JtagAccess>,
    pub(crate) sessions: HashMap<TapPosition, DmSession>,
    pub(crate) harts: Vec<HartState>,
    /// Harts halted and resumed together.
    pub(crate) smp_groups: Vec<Vec<TargetId>>,
    pub(crate) config: DebugConfig,
    pub(crate) hooks: Box<dyn DebugHooks>,
}

impl std::fmt::Debug for Debugger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debugger")
            .field("sessions", &self.sessions)
            .field("harts", &self.harts)
            .field("smp_groups", &self.smp_groups)
            .field("config", &self.config)
            .finish()
    }
}

impl Debugger {
    /// A debugger driving `jtag`.
    ///
    /// The configuration is validated here.
    pub fn new(jtag: Box<dyn JtagAccess>, config: DebugConfig) -> Result<Self, RiscvError> {
        config.validate().map_err(|error| {
            tracing::error!("Invalid configuration: {}", error);
            RiscvError::InvalidArgument("configuration")
        })?;

        Ok(Self {
            jtag,
            sessions: HashMap::new(),
            harts: Vec::new(),
            smp_groups: Vec::new(),
            config,
            hooks: Box::new(DefaultHooks),
        })
    }

    /// Replace the host services.
    pub fn set_hooks(&mut self, hooks: Box<dyn DebugHooks>) {
        self.hooks = hooks;
    }

    /// The configuration in use.
    pub fn config(&self) -> &DebugConfig {
        &self.config
    }

    /// Register hart `hartid` behind the DTM at `tap`.
    pub fn add_target(&mut self, tap: TapPosition, hartid: u32) -> TargetId {
        self.add_target_inner(tap, None, hartid)
    }

    /// Register hart `hartid` behind a DTM reached through a BSCAN tunnel.
    pub fn add_tunneled_target(
        &mut self,
        tap: TapPosition,
        tunnel: BscanTunnel,
        hartid: u32,
    ) -> TargetId {
        self.add_target_inner(tap, Some(tunnel), hartid)
    }

    fn add_target_inner(
        &mut self,
        tap: TapPosition,
        tunnel: Option<BscanTunnel>,
        hartid: u32,
    ) -> TargetId {
        let reset_delays_wait = self.config.reset_delays_wait;
        self.sessions
            .entry(tap)
            .or_insert_with(|| DmSession::new(tap, tunnel, reset_delays_wait));

        let id = TargetId(self.harts.len());
        self.harts.push(HartState::new(id, tap, hartid));
        tracing::debug!("Target {:?}: hart {} behind TAP {:?}", id, hartid, tap);
        id
    }

    /// Ids of all registered targets.
    pub fn targets(&self) -> impl Iterator<Item = TargetId> + '_ {
        self.harts.iter().map(|hart| hart.id)
    }

    /// State of a target.
    pub fn target(&self, id: TargetId) -> Result<&HartState, RiscvError> {
        self.harts.get(id.0).ok_or(RiscvError::TargetNotFound(id.0))
    }

    /// The Debug Module session behind `tap`.
    pub fn session(&self, tap: TapPosition) -> Option<&DmSession> {
        self.sessions.get(&tap)
    }

    /// Borrow a target for an operation.
    pub fn core(&mut self, id: TargetId) -> Result<RiscvCore<'_>, RiscvError> {
        let timeout = self.config.command_timeout();
        let hart = self
            .harts
            .get_mut(id.0)
            .ok_or(RiscvError::TargetNotFound(id.0))?;
        let session = self
            .sessions
            .get_mut(&hart.tap)
            .ok_or(RiscvError::TargetNotFound(id.0))?;

        let dm = session.module(self.jtag.as_mut(), timeout);
        Ok(RiscvCore::new(dm, hart, &self.config, self.hooks.as_mut()))
    }

    /// Borrow the Debug Module behind `tap`.
    pub(crate) fn module(&mut self, tap: TapPosition) -> Result<DebugModule<'_>, RiscvError> {
        let timeout = self.config.command_timeout();
        let session = self
            .sessions
            .get_mut(&tap)
            .ok_or(RiscvError::InvalidArgument("no debug module at this TAP"))?;
        Ok(session.module(self.jtag.as_mut(), timeout))
    }

    /// Examine a target.
    pub fn examine(&mut self, id: TargetId) -> Result<(), RiscvError> {
        self.core(id)?.examine()?;

        if let Some(group) = self.target(id)?.smp_group {
            self.join_halt_group(id, group)?;
        }

        Ok(())
    }

    fn require_examined(&self, id: TargetId) -> Result<(), RiscvError> {
        if self.target(id)?.examined {
            Ok(())
        } else {
            Err(RiscvError::NotExamined)
        }
    }

    /// Halt a target, and every target in its SMP group.
    pub fn halt(&mut self, id: TargetId) -> Result<(), RiscvError> {
        self.require_examined(id)?;
        let members = self.group_of(id)?;
        self.halt_targets(&members)
    }

    /// Resume a target, and every target in its SMP group.
    ///
    /// With `current` unset the targets resume at `address`.
    pub fn resume(
        &mut self,
        id: TargetId,
        current: bool,
        address: u64,
        handle_breakpoints: bool,
        debug_execution: bool,
    ) -> Result<(), RiscvError> {
        self.require_examined(id)?;
        let members = self.group_of(id)?;
        self.resume_targets(&members, current, address, handle_breakpoints, debug_execution)
    }

    /// Single step a target.
    pub fn step(
        &mut self,
        id: TargetId,
        current: bool,
        address: u64,
        handle_breakpoints: bool,
    ) -> Result<(), RiscvError> {
        self.require_examined(id)?;
        self.core(id)?.step(current, address, handle_breakpoints)
    }

    /// Put the system (or the hart) into reset.
    pub fn assert_reset(&mut self, id: TargetId, kind: ResetKind) -> Result<(), RiscvError> {
        self.core(id)?.assert_reset(kind)
    }

    /// Take the target out of reset.
    pub fn deassert_reset(&mut self, id: TargetId) -> Result<(), RiscvError> {
        self.core(id)?.deassert_reset()
    }

    /// Read `count` elements of `size` bytes at virtual address `address`.
    pub fn read_memory(
        &mut self,
        id: TargetId,
        address: u64,
        size: usize,
        count: usize,
        buffer: &mut [u8],
    ) -> Result<(), RiscvError> {
        self.require_examined(id)?;
        self.core(id)?.read_memory(address, size, count, buffer)
    }

    /// Write `count` elements of `size` bytes at virtual address `address`.
    pub fn write_memory(
        &mut self,
        id: TargetId,
        address: u64,
        size: usize,
        count: usize,
        buffer: &[u8],
    ) -> Result<(), RiscvError> {
        self.require_examined(id)?;
        self.core(id)?.write_memory(address, size, count, buffer)
    }

    /// Read physical memory.
    pub fn read_phys_memory(
        &mut self,
        id: TargetId,
        address: u64,
        size: usize,
        count: usize,
        buffer: &mut [u8],
    ) -> Result<(), RiscvError> {
        self.require_examined(id)?;
        self.core(id)?.read_phys_memory(address, size, count, buffer)
    }

    /// Write physical memory.
    pub fn write_phys_memory(
        &mut self,
        id: TargetId,
        address: u64,
        size: usize,
        count: usize,
        buffer: &[u8],
    ) -> Result<(), RiscvError> {
        self.require_examined(id)?;
        self.core(id)?.write_phys_memory(address, size, count, buffer)
    }

    /// Translate a virtual address of a target.
    pub fn virt2phys(&mut self, id: TargetId, address: u64) -> Result<u64, RiscvError> {
        self.require_examined(id)?;
        self.core(id)?.virt2phys(address)
    }

    /// Whether the target translates addresses.
    pub fn mmu(&mut self, id: TargetId) -> Result<bool, RiscvError> {
        self.require_examined(id)?;
        self.core(id)?.mmu()
    }

    /// Registers of a target, in GDB numbering order.
    pub fn register_list(&self, id: TargetId) -> Result<Vec<RegisterDescription>, RiscvError> {
        self.require_examined(id)?;
        Ok(self.target(id)?.registers.list())
    }

    /// Read a register of a halted target.
    pub fn read_register(&mut self, id: TargetId, number: RegisterNumber) -> Result<u64, RiscvError> {
        self.require_examined(id)?;
        let mut core = self.core(id)?;
        core.require_halted()?;
        core.read_register(number)
    }

    /// Write a register of a halted target.
    ///
    /// The value reaches the hart when it resumes.
    pub fn write_register(
        &mut self,
        id: TargetId,
        number: RegisterNumber,
        value: u64,
    ) -> Result<(), RiscvError> {
        self.require_examined(id)?;
        let mut core = self.core(id)?;
        core.require_halted()?;
        core.set_register(number, value)
    }

    /// Add a breakpoint and return its id.
    pub fn add_breakpoint(
        &mut self,
        id: TargetId,
        address: u64,
        length: u64,
        kind: BreakpointKind,
    ) -> Result<i32, RiscvError> {
        self.require_examined(id)?;
        self.core(id)?.add_breakpoint(address, length, kind)
    }

    /// Remove a breakpoint.
    pub fn remove_breakpoint(&mut self, id: TargetId, breakpoint: i32) -> Result<(), RiscvError> {
        self.core(id)?.remove_breakpoint(breakpoint)
    }

    /// Add a watchpoint and return its id.
    pub fn add_watchpoint(
        &mut self,
        id: TargetId,
        address: u64,
        length: u64,
        access: WatchpointAccess,
    ) -> Result<i32, RiscvError> {
        self.require_examined(id)?;
        self.core(id)?.add_watchpoint(address, length, access)
    }

    /// Remove a watchpoint.
    pub fn remove_watchpoint(&mut self, id: TargetId, watchpoint: i32) -> Result<(), RiscvError> {
        self.core(id)?.remove_watchpoint(watchpoint)
    }

    /// The watchpoint that halted the target.
    pub fn hit_watchpoint(&mut self, id: TargetId) -> Result<Option<Watchpoint>, RiscvError> {
        self.core(id)?.hit_watchpoint()
    }

    /// Run code on a halted target.
    pub fn run_algorithm(
        &mut self,
        id: TargetId,
        parameters: &mut [RegisterParameter],
        entry: u64,
        exit: u64,
        timeout: Duration,
    ) -> Result<(), RiscvError> {
        self.require_examined(id)?;
        self.core(id)?.run_algorithm(parameters, entry, exit, timeout)
    }

    /// Run raw instructions in the program buffer of a halted target.
    pub fn exec_progbuf(&mut self, id: TargetId, instructions: &[u32]) -> Result<(), RiscvError> {
        self.require_examined(id)?;
        self.core(id)?.exec_progbuf(instructions)
    }

    /// Read the element at physical `address` `count` times.
    pub fn repeat_read(
        &mut self,
        id: TargetId,
        address: u64,
        size: usize,
        count: usize,
        buffer: &mut [u8],
    ) -> Result<(), RiscvError> {
        self.require_examined(id)?;
        self.core(id)?.repeat_read(address, size, count, buffer)
    }

    /// Set the instruction count trigger of a target.
    pub fn set_icount(&mut self, id: TargetId, trigger: IcountTrigger) -> Result<(), RiscvError> {
        self.core(id)?.set_icount(trigger)
    }

    /// Clear the instruction count trigger of a target.
    pub fn clear_icount(&mut self, id: TargetId) -> Result<(), RiscvError> {
        self.core(id)?.clear_icount()
    }

    /// Set the interrupt trigger of a target.
    pub fn set_itrigger(&mut self, id: TargetId, trigger: Itrigger) -> Result<(), RiscvError> {
        self.core(id)?.set_itrigger(trigger)
    }

    /// Clear the interrupt trigger of a target.
    pub fn clear_itrigger(&mut self, id: TargetId) -> Result<(), RiscvError> {
        self.core(id)?.clear_itrigger()
    }

    /// Set the exception trigger of a target.
    pub fn set_etrigger(&mut self, id: TargetId, trigger: Etrigger) -> Result<(), RiscvError> {
        self.core(id)?.set_etrigger(trigger)
    }

    /// Clear the exception trigger of a target.
    pub fn clear_etrigger(&mut self, id: TargetId) -> Result<(), RiscvError> {
        self.core(id)?.clear_etrigger()
    }

    /// Sample `bucket` on every poll that finds the target running, or stop
    /// sampling it with `None`.
    ///
    /// Collected samples are dropped.
    pub fn memory_sample(
        &mut self,
        id: TargetId,
        index: usize,
        bucket: Option<SampleBucket>,
    ) -> Result<(), RiscvError> {
        self.harts
            .get_mut(id.0)
            .ok_or(RiscvError::TargetNotFound(id.0))?
            .sampler
            .configure(index, bucket)
    }

    /// Decode and drop the samples collected for a target.
    ///
    /// The samples are dropped even when they can't be decoded.
    pub fn dump_sample_buf(&mut self, id: TargetId) -> Result<Vec<Sample>, RiscvError> {
        let sampler = &mut self
            .harts
            .get_mut(id.0)
            .ok_or(RiscvError::TargetNotFound(id.0))?
            .sampler;
        let samples = sampler.decode();
        sampler.clear();
        samples
    }

    /// Take the undecoded samples collected for a target.
    pub fn dump_sample_buf_raw(&mut self, id: TargetId) -> Result<Vec<u8>, RiscvError> {
        let sampler = &mut self
            .harts
            .get_mut(id.0)
            .ok_or(RiscvError::TargetNotFound(id.0))?
            .sampler;
        let raw = sampler.raw().to_vec();
        sampler.clear();
        Ok(raw)
    }

    /// Raw read of the DMI register at `address` of the DM behind `tap`.
    pub fn dmi_read(&mut self, tap: TapPosition, address: u32) -> Result<u32, RiscvError> {
        self.module(tap)?.dmi_read(address)
    }

    /// Raw write of the DMI register at `address` of the DM behind `tap`.
    pub fn dmi_write(&mut self, tap: TapPosition, address: u32, value: u32) -> Result<(), RiscvError> {
        self.module(tap)?.dmi_write(address, value)
    }

    /// Read the register at `address` of the DM behind `tap`, relative to the
    /// DM's base.
    pub fn dm_read(&mut self, tap: TapPosition, address: u32) -> Result<u32, RiscvError> {
        self.module(tap)?.dm_read(address)
    }

    /// Write the register at `address` of the DM behind `tap`, relative to the
    /// DM's base.
    pub fn dm_write(&mut self, tap: TapPosition, address: u32, value: u32) -> Result<(), RiscvError> {
        self.module(tap)?.dm_write(address, value)
    }

    /// Read `authdata` of the DM behind `tap`.
    pub fn authdata_read(&mut self, tap: TapPosition) -> Result<u32, RiscvError> {
        let mut dm = self.module(tap)?;
        dm.init_dtm()?;
        dm.authdata_read()
    }

    /// Write `authdata` of the DM behind `tap` and return whether it is now
    /// authenticated.
    pub fn authdata_write(&mut self, tap: TapPosition, value: u32) -> Result<bool, RiscvError> {
        let mut dm = self.module(tap)?;
        dm.init_dtm()?;
        dm.authdata_write(value)
    }

    /// Poll a target, and every target in its SMP group.
    pub fn poll(&mut self, id: TargetId) -> Result<CoreStatus, RiscvError> {
        self.require_examined(id)?;
        let members = self.group_of(id)?;
        self.poll_targets(&members)?;
        Ok(self.target(id)?.status)
    }

    /// Poll every examined target.
    pub fn poll_all(&mut self) -> Result<(), RiscvError> {
        let mut polled = Vec::new();

        for id in self.targets().collect::<Vec<_>>() {
            if polled.contains(&id) || !self.target(id)?.examined {
                continue;
            }
            let members = self.group_of(id)?;
            self.poll_targets(&members)?;
            polled.extend(members);
        }

        Ok(())
    }
}
