//! Running code on the hart on behalf of the debugger.

use std::time::{Duration, Instant};

use crate::breakpoints::BreakpointKind;
use crate::error::RiscvError;
use crate::hart::RiscvCore;
use crate::registers::{csr, misa_has, Mstatus, RegisterNumber};

/// Direction of an algorithm parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterDirection {
    /// Written before the algorithm runs.
    In,
    /// Read after the algorithm returns.
    Out,
    /// Both.
    InOut,
}

/// A register an algorithm takes or returns a value in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterParameter {
    pub register: RegisterNumber,
    pub value: u64,
    pub direction: ParameterDirection,
}

impl RegisterParameter {
    /// A parameter passed in `register`.
    pub fn input(register: RegisterNumber, value: u64) -> Self {
        Self {
            register,
            value,
            direction: ParameterDirection::In,
        }
    }

    /// A result returned in `register`.
    pub fn output(register: RegisterNumber) -> Self {
        Self {
            register,
            value: 0,
            direction: ParameterDirection::Out,
        }
    }
}

impl RiscvCore<'_> {
    /// Run the code at `entry` until it reaches `exit`, with interrupts disabled.
    ///
    /// Parameter registers are written before the run, results are read back into
    /// `parameters` and every register touched is restored afterwards.
    pub fn run_algorithm(
        &mut self,
        parameters: &mut [RegisterParameter],
        entry: u64,
        exit: u64,
        timeout: Duration,
    ) -> Result<(), RiscvError> {
        self.require_halted()?;

        let mstatus_number = RegisterNumber::csr(csr::MSTATUS);
        let mut saved = vec![
            (RegisterNumber::PC, self.read_register(RegisterNumber::PC)?),
            (mstatus_number, self.read_register(mstatus_number)?),
        ];

        for parameter in parameters.iter() {
            if !self.hart.registers.exists(parameter.register) {
                tracing::error!("Algorithm parameter register {:?} does not exist", parameter.register);
                return Err(RiscvError::UnknownRegister(parameter.register));
            }
            if !saved.iter().any(|(number, _)| *number == parameter.register) {
                saved.push((parameter.register, self.read_register(parameter.register)?));
            }
        }

        for parameter in parameters.iter() {
            if parameter.direction != ParameterDirection::Out {
                self.set_register(parameter.register, parameter.value)?;
            }
        }

        let mstatus = Mstatus::from(self.read_register(mstatus_number)?);
        self.write_register(mstatus_number, u64::from(mstatus.with_interrupts_masked()))?;

        let length = if misa_has(self.hart.misa, 'C') { 2 } else { 4 };
        let breakpoint = self.add_breakpoint(exit, length, BreakpointKind::Software)?;

        tracing::debug!("Running algorithm at {:#x}, exit at {:#x}", entry, exit);
        let result = self.run_to_exit(entry, exit, timeout);

        let removed = self.remove_breakpoint(breakpoint);

        if result.is_ok() {
            for parameter in parameters.iter_mut() {
                if parameter.direction != ParameterDirection::In {
                    parameter.value = self.read_register(parameter.register)?;
                }
            }
        }

        for (number, value) in saved.into_iter().rev() {
            self.write_register(number, value)?;
        }

        result?;
        removed
    }

    fn run_to_exit(&mut self, entry: u64, exit: u64, timeout: Duration) -> Result<(), RiscvError> {
        self.resume(false, entry, false, true)?;

        let start = Instant::now();
        loop {
            self.poll_hart()?;
            if self.hart.status.is_halted() {
                break;
            }

            if start.elapsed() > timeout {
                tracing::error!("Algorithm at {:#x} timed out after {:?}", entry, timeout);
                self.halt()?;
                return Err(RiscvError::Timeout);
            }
        }

        if let Some(event) = self.hart.pending_event.take() {
            self.emit(event);
        }

        let pc = self.read_register(RegisterNumber::PC)?;
        if pc != exit {
            tracing::error!("Algorithm stopped at {:#x} instead of {:#x}", pc, exit);
            return Err(anyhow::anyhow!("algorithm stopped at {:#x} instead of {:#x}", pc, exit).into());
        }

        Ok(())
    }
}
