//! The scan queue the debug core drives.
//!
//! Executing scans on real hardware is the job of an adapter driver. The core only
//! queues IR and DR scans plus run-test/idle cycles, then flushes the queue and
//! looks at the captured DR bits.

use bitvec::prelude::*;
use serde::{Deserialize, Serialize};

/// Position of a TAP in the JTAG chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct TapPosition(pub usize);

/// A BSCAN tunnel through which the DTM registers are reached.
///
/// The protocol was created by SiFive for FPGA soft cores. Every tunneled DR scan
/// carries a select bit, a 7 bit payload width, the payload and three idle bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BscanTunnel {
    /// IR instruction of the tunnel data register.
    pub ir_id: u32,
    /// IR length of the tunneled TAP.
    pub ir_width: u32,
}

/// Errors reported by the scan queue.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum TransportError {
    /// The scan queue could not be executed: {0}
    Execute(String),
    /// The transport returned {returned} captures for {expected} queued DR scans
    CaptureMismatch {
        /// Number of DR scans that were queued.
        expected: usize,
        /// Number of captures returned.
        returned: usize,
    },
    /// The adapter driver reported an error
    Adapter(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Queue of JTAG operations.
///
/// Scans are only queued by the `add_*` methods. [`JtagAccess::execute`] shifts all
/// of them and returns the captured bits of every DR scan, in queue order.
pub trait JtagAccess {
    /// Queue an IR scan selecting `instruction` on the TAP at `tap`.
    fn add_ir(&mut self, tap: TapPosition, instruction: u32);

    /// Queue a DR scan on the TAP at `tap`, shifting `data` out.
    fn add_dr(&mut self, tap: TapPosition, data: &BitSlice<u8, Lsb0>);

    /// Queue `cycles` clocks in the Run-Test/Idle state.
    fn add_runtest(&mut self, cycles: u32);

    /// Execute the queue.
    fn execute(&mut self) -> Result<Vec<BitVec<u8, Lsb0>>, TransportError>;
}

/// Builds the bit representation of a DR scan of `len` bits holding `value`.
pub(crate) fn dr_bits(value: u128, len: u32) -> BitVec<u8, Lsb0> {
    let mut bits = bitvec![u8, Lsb0; 0; len as usize];
    bits.store_le(value);
    bits
}

#[cfg(test)]
mod test {
    use super::dr_bits;
    use bitvec::field::BitField;

    #[test]
    fn dr_bits_holds_value() {
        let bits = dr_bits(0x1_2345_6789_a, 41);

        assert_eq!(bits.len(), 41);
        assert_eq!(bits.load_le::<u64>(), 0x1_2345_6789_a);
    }
}
