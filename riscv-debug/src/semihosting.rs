//! Semihosting calls: an `ebreak` between two magic no-ops.

use crate::error::RiscvError;
use crate::hart::RiscvCore;
use crate::hooks::{SemihostingOutcome, SemihostingRequest};
use crate::registers::RegisterNumber;

/// `slli zero, zero, 0x1f`, `ebreak`, `srai zero, zero, 7`
const MAGIC: [u32; 3] = [0x01f0_1013, 0x0010_0073, 0x4070_5013];

/// What to do with a hart halted on an `ebreak`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemihostingAction {
    /// An ordinary breakpoint.
    NotSemihosting,
    /// A semihosting call the host hasn't finished.
    RemainHalted,
    /// A semihosting call that was handled.
    Resume,
}

/// Whether `words`, read from `dpc - 4`, hold the semihosting sequence.
pub(crate) fn is_semihosting_call(words: &[u8; 12]) -> bool {
    words
        .chunks_exact(4)
        .zip(MAGIC)
        .all(|(word, magic)| word == magic.to_le_bytes())
}

impl RiscvCore<'_> {
    /// Check for a semihosting call at `dpc` and hand it to the host.
    pub(crate) fn semihosting(&mut self) -> Result<SemihostingAction, RiscvError> {
        let pc = self.read_register(RegisterNumber::PC)?;

        let mut words = [0u8; 12];
        match self.read_memory(pc.wrapping_sub(4), 4, 3, &mut words) {
            Ok(()) => {}
            Err(error @ (RiscvError::MemoryFault { .. } | RiscvError::AbstractCommand(_))) => {
                tracing::debug!("Unable to read around {:#x}: {}", pc, error);
                return Ok(SemihostingAction::NotSemihosting);
            }
            Err(error) => return Err(error),
        }

        if !is_semihosting_call(&words) {
            return Ok(SemihostingAction::NotSemihosting);
        }

        let request = SemihostingRequest {
            operation: self.read_register(RegisterNumber::A0)?,
            parameter: self.read_register(RegisterNumber::A1)?,
            pc,
        };
        tracing::debug!("Semihosting call {:#x} at {:#x}", request.operation, pc);

        let target = self.hart.id;
        match self.hooks.semihosting(target, &request)? {
            SemihostingOutcome::None => Ok(SemihostingAction::NotSemihosting),
            SemihostingOutcome::Waiting => Ok(SemihostingAction::RemainHalted),
            SemihostingOutcome::Handled { result } => {
                if let Some(result) = result {
                    self.set_register(RegisterNumber::A0, result)?;
                }
                // Continue after the ebreak.
                self.write_register(RegisterNumber::PC, pc.wrapping_add(4))?;
                Ok(SemihostingAction::Resume)
            }
            SemihostingOutcome::Error => {
                tracing::error!("Semihosting call {:#x} failed", request.operation);
                Err(anyhow::anyhow!("semihosting call {:#x} failed", request.operation).into())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn magic_sequence() {
        let mut words = [0u8; 12];
        for (chunk, word) in words.chunks_exact_mut(4).zip(MAGIC) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        assert!(is_semihosting_call(&words));

        words[4] = 0x74;
        assert!(!is_semihosting_call(&words));
    }
}
