//! Harts that halt and resume together.
//!
//! Halting and resuming goes through three phases for every member of a group:
//! prepare, go and finish. Harts behind the same Debug Module are started with a
//! single request through the hart array mask when the DM has one.

use std::time::Instant;

use crate::config::ResumeOrder;
use crate::debugger::Debugger;
use crate::dm::registers::{Dmstatus, Hawindow, Hawindowsel};
use crate::dm::DebugModule;
use crate::error::RiscvError;
use crate::hart::{NextAction, TargetId};
use crate::hooks::TargetEvent;
use crate::transport::TapPosition;

/// Halt group all SMP members join.
const HALT_GROUP: u32 = 1;

/// Hart array window covering harts 0 to 31.
const WINDOW_SIZE: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HartRequest {
    Halt,
    Resume,
}

impl DebugModule<'_> {
    /// Send a halt or resume request to several harts at once through the hart
    /// array mask, and wait until all of them follow it.
    fn request_hart_mask(&mut self, hartids: &[u32], request: HartRequest) -> Result<(), RiscvError> {
        let mask = hartids
            .iter()
            .filter(|&&hartid| hartid < WINDOW_SIZE)
            .fold(0u32, |mask, hartid| mask | 1 << hartid);

        tracing::debug!("{:?} request for hart mask {:#x}", request, mask);

        self.write_dm_register(Hawindowsel::from(0))?;
        self.write_dm_register(Hawindow(mask))?;

        let mut control = self.dmcontrol();
        control.set_hasel(true);
        match request {
            HartRequest::Halt => control.set_haltreq(true),
            HartRequest::Resume => control.set_resumereq(true),
        }
        self.write_dm_register(control)?;

        let start = Instant::now();
        let result = loop {
            let status: Dmstatus = self.read_dm_register()?;
            let done = match request {
                HartRequest::Halt => status.allhalted(),
                HartRequest::Resume => status.allresumeack(),
            };
            if done {
                break Ok(());
            }
            if start.elapsed() > self.timeout() {
                tracing::error!("Harts {:#x} did not follow the {:?} request: {:?}", mask, request, status);
                break Err(RiscvError::Timeout);
            }
        };

        // Drop the request and the mask.
        let control = self.dmcontrol();
        self.write_dm_register(control)?;

        result
    }
}

impl Debugger {
    /// Make `targets` halt and resume together.
    ///
    /// Members are put into a DM halt group when they are examined, if the DM
    /// supports halt groups.
    pub fn add_smp_group(&mut self, targets: &[TargetId]) -> Result<(), RiscvError> {
        for &id in targets {
            if self.target(id)?.smp_group.is_some() {
                tracing::error!("Target {:?} already is in an SMP group", id);
                return Err(RiscvError::InvalidArgument("target already in an SMP group"));
            }
        }

        let group = self.smp_groups.len();
        for &id in targets {
            self.harts[id.0].smp_group = Some(group);
        }
        self.smp_groups.push(targets.to_vec());

        for &id in targets {
            if self.target(id)?.examined {
                self.join_halt_group(id, group)?;
            }
        }

        Ok(())
    }

    pub(crate) fn join_halt_group(&mut self, id: TargetId, group: usize) -> Result<(), RiscvError> {
        if self.smp_groups[group].len() < 2 {
            return Ok(());
        }

        let (tap, hartid) = {
            let hart = self.target(id)?;
            (hart.tap, hart.hartid)
        };

        if !self.module(tap)?.set_halt_group(hartid, HALT_GROUP)? {
            tracing::info!("Hart {} is halted by the debugger instead of a halt group", hartid);
        }

        Ok(())
    }

    /// Members of the SMP group of `id`, or just `id`.
    pub(crate) fn group_of(&self, id: TargetId) -> Result<Vec<TargetId>, RiscvError> {
        Ok(match self.target(id)?.smp_group {
            Some(group) => self.smp_groups[group].clone(),
            None => vec![id],
        })
    }

    /// Harts of `targets` that have `prepped` set, grouped by Debug Module.
    fn prepped_harts(&self, targets: &[TargetId]) -> Vec<(TapPosition, Vec<u32>)> {
        let mut by_tap: Vec<(TapPosition, Vec<u32>)> = Vec::new();

        for hart in targets.iter().filter_map(|id| self.harts.get(id.0)) {
            if !hart.prepped {
                continue;
            }
            match by_tap.iter_mut().find(|(tap, _)| *tap == hart.tap) {
                Some((_, hartids)) => hartids.push(hart.hartid),
                None => by_tap.push((hart.tap, vec![hart.hartid])),
            }
        }

        by_tap
    }

    /// Start several prepped harts with one request where the DM allows it.
    ///
    /// Returns the targets that were reached through the hart array mask.
    fn request_prepped(
        &mut self,
        targets: &[TargetId],
        request: HartRequest,
    ) -> Result<Vec<TargetId>, RiscvError> {
        let mut masked = Vec::new();

        for (tap, hartids) in self.prepped_harts(targets) {
            let handled = {
                let mut dm = self.module(tap)?;
                let handled = hartids.len() > 1 && dm.state().hasel_supported();
                if handled {
                    dm.request_hart_mask(&hartids, request)?;
                }
                handled
            };

            if handled {
                masked.extend(targets.iter().copied().filter(|id| {
                    let hart = &self.harts[id.0];
                    hart.tap == tap && hart.prepped && hartids.contains(&hart.hartid)
                }));
            }
        }

        Ok(masked)
    }

    pub(crate) fn halt_targets(&mut self, targets: &[TargetId]) -> Result<(), RiscvError> {
        for &id in targets {
            self.core(id)?.halt_prep();
        }

        let masked = self.request_prepped(targets, HartRequest::Halt)?;

        for &id in targets {
            let mut core = self.core(id)?;
            if !core.state().prepped {
                continue;
            }
            if masked.contains(&id) {
                core.mark_halted();
            } else {
                core.halt_go()?;
            }
        }

        for &id in targets {
            self.core(id)?.halt_finish();
        }

        Ok(())
    }

    pub(crate) fn resume_targets(
        &mut self,
        targets: &[TargetId],
        current: bool,
        address: u64,
        handle_breakpoints: bool,
        debug_execution: bool,
    ) -> Result<(), RiscvError> {
        let mut order = targets.to_vec();
        if self.config.resume_order == ResumeOrder::Reversed {
            order.reverse();
        }

        for &id in &order {
            let mut core = self.core(id)?;
            if core.state().status.is_halted() {
                core.resume_prep(current, address, handle_breakpoints)?;
            } else {
                tracing::debug!("Target {:?} is not halted, not resuming it", id);
            }
        }

        let masked = self.request_prepped(&order, HartRequest::Resume)?;

        for &id in &order {
            let mut core = self.core(id)?;
            if core.state().prepped {
                // A hart may already have halted again after the mask resume.
                if !masked.contains(&id) {
                    core.resume_go()?;
                }
                core.resume_finish(debug_execution);
            }
        }

        Ok(())
    }

    /// Poll every member of a group.
    ///
    /// When one member halted, the others are halted too. Halt events are only
    /// reported after every member was polled.
    pub(crate) fn poll_targets(&mut self, targets: &[TargetId]) -> Result<(), RiscvError> {
        let mut remain_halted = false;
        let mut resume = false;
        let mut any_halted = false;

        for &id in targets {
            let mut core = self.core(id)?;
            match core.poll_hart()? {
                NextAction::None => {}
                NextAction::RemainHalted => remain_halted = true,
                NextAction::Resume => resume = true,
            }
            any_halted |= core.state().pending_event.is_some();
        }

        if targets.len() > 1 && (any_halted || remain_halted) {
            let running: Vec<TargetId> = targets
                .iter()
                .copied()
                .filter(|id| self.harts[id.0].status.is_running())
                .collect();

            if !running.is_empty() {
                tracing::debug!("Halting the rest of the group: {:?}", running);
                for &id in &running {
                    self.core(id)?.halt_prep();
                }
                let masked = self.request_prepped(&running, HartRequest::Halt)?;
                for &id in &running {
                    let mut core = self.core(id)?;
                    if masked.contains(&id) {
                        core.mark_halted();
                    } else {
                        core.halt_go()?;
                    }
                    core.hart.prepped = false;
                    core.hart.pending_event = Some(TargetEvent::Halted);
                }
            }
        } else if resume {
            tracing::debug!("Resuming after a handled semihosting call");
            let halted: Vec<TargetId> = targets
                .iter()
                .copied()
                .filter(|id| self.harts[id.0].status.is_halted())
                .collect();
            self.resume_targets(&halted, true, 0, false, false)?;
        }

        let any_running = targets.iter().any(|id| self.harts[id.0].status.is_running());
        if let Some(&id) = targets
            .iter()
            .find(|id| any_running && self.harts[id.0].sampler.enabled())
        {
            // Failures turn sampling off and don't fail the poll.
            let _ = self.core(id)?.sample_memory();
        }

        for &id in targets {
            let mut core = self.core(id)?;
            if let Some(event) = core.hart.pending_event.take() {
                core.emit(event);
            }
        }

        Ok(())
    }
}
