//! Debug Transport Module (DTM) handling
//!
//! The DTM is responsible for access to the debug module.
//! Every DMI operation is a request scan, followed by a scan that captures the
//! response. A busy response makes the adapter grow its idle delay, reset the
//! sticky error with `dtmcs.dmireset` and retry the same operation.
//!
//! A 0.11 DTM has a `dbus` register in place of `dmi`, with a wider data field
//! that also carries the `interrupt` and `haltnot` bits of the selected hart.

use bitfield::bitfield;
use bitvec::prelude::*;
use std::time::{Duration, Instant};

use crate::dm::registers::{DebugRegister, Dmcontrol, PROGBUF0_ADDRESS, PROGBUF_MAX};
use crate::error::RiscvError;
use crate::transport::{dr_bits, BscanTunnel, JtagAccess, TapPosition, TransportError};

/// Address of the `dtmcs` JTAG register.
pub(crate) const DTMCS_ADDRESS: u32 = 0x10;

/// Width of the `dtmcs` JTAG register.
const DTMCS_WIDTH: u32 = 32;

/// Address of the `dmi` JTAG register
pub(crate) const DMI_ADDRESS: u32 = 0x11;

/// Address of the `idcode` JTAG register
const IDCODE_ADDRESS: u32 = 0x1;

/// Offset of the `address` field in the `dmi` JTAG register.
pub(crate) const DMI_ADDRESS_BIT_OFFSET: u32 = 34;

/// Offset of the `value` field in the `dmi` JTAG register.
const DMI_VALUE_BIT_OFFSET: u32 = 2;

const DMI_OP_MASK: u128 = 0x3;

/// Offset of the `address` field in the 0.11 `dbus` register.
pub(crate) const DBUS_ADDRESS_BIT_OFFSET: u32 = 36;

/// The 34 data bits of a `dbus` operation.
const DBUS_DATA_MASK: u64 = (1 << 34) - 1;

/// Bits dropped from the front of a tunneled DR capture.
const TUNNEL_RESPONSE_OFFSET: usize = 4;

bitfield! {
    /// The `dtmcs` register of a 0.13/1.0 DTM.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Dtmcs(u32);
    impl Debug;

    pub _, set_dmihardreset: 17;
    pub _, set_dmireset: 16;
    pub idle, _: 14, 12;
    pub dmistat, _: 11, 10;
    pub abits, _: 9, 4;
    pub version, _: 3, 0;
}

bitfield! {
    /// The `dtmcontrol` register of a 0.11 DTM.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct DtmcontrolV011(u32);
    impl Debug;

    pub idle, _: 12, 10;
    pub dbusstat, _: 9, 8;
    pub addrbits, _: 7, 4;
    pub version, _: 3, 0;
}

/// Version advertised by the DTM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DtmVersion {
    /// External Debug Support 0.11.
    V0_11,
    /// External Debug Support 0.13 and 1.0.
    V0_13,
    /// Not examined yet, or an unknown version.
    #[default]
    Unknown,
}

/// A DMI operation, as shifted into the `dmi` register.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DmiOperation {
    /// Capture the result of the previous operation.
    NoOp,
    /// Read a DM register.
    Read {
        /// DMI address.
        address: u32,
    },
    /// Write a DM register.
    Write {
        /// DMI address.
        address: u32,
        /// Value to write.
        value: u32,
    },
}

impl DmiOperation {
    fn opcode(&self) -> u8 {
        match self {
            Self::NoOp => 0,
            Self::Read { .. } => 1,
            Self::Write { .. } => 2,
        }
    }

    /// Value of the `dmi` register for this operation.
    pub fn register_value(&self) -> u128 {
        let (address, value): (u128, u128) = match self {
            Self::NoOp => (0, 0),
            Self::Read { address } => (*address as u128, 0),
            Self::Write { address, value } => (*address as u128, *value as u128),
        };
        (address << DMI_ADDRESS_BIT_OFFSET) | (value << DMI_VALUE_BIT_OFFSET) | self.opcode() as u128
    }

    /// Frame the operation for a BSCAN tunnel. Returns the frame length and value.
    fn to_tunneled_frame(self, dmi_bits: u32) -> (u32, u128) {
        let width_offset = 1 + dmi_bits + 3;
        let msb_offset = 7 + width_offset;
        let bits = (1 << (msb_offset as u128))
            | (((dmi_bits + 1) as u128) << (width_offset as u128))
            | (self.register_value() << 3);
        (msb_offset + 1, bits)
    }
}

/// Possible return values in the op field of
/// the dmi register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmiOperationStatus {
    /// The previous operation completed.
    Ok = 0,
    /// Reserved value.
    Reserved = 1,
    /// The previous operation failed.
    OperationFailed = 2,
    /// An operation was attempted while a DMI request was still in progress.
    RequestInProgress = 3,
}

impl DmiOperationStatus {
    pub(crate) fn parse(value: u8) -> Self {
        match value & 0x3 {
            0 => Self::Ok,
            1 => Self::Reserved,
            2 => Self::OperationFailed,
            _ => Self::RequestInProgress,
        }
    }
}

/// Decoded capture of a `dmi` scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmiResponse {
    /// Status of the previous operation.
    pub status: DmiOperationStatus,
    /// Data returned by the previous operation.
    pub data: u32,
}

/// Persistent state of the DTM, owned by the DM session.
#[derive(Debug)]
pub struct DtmState {
    pub(crate) tap: TapPosition,
    pub(crate) tunnel: Option<BscanTunnel>,
    /// Number of address bits in the DMI register
    pub(crate) abits: u32,
    /// Idle cycles requested by `dtmcs.idle`.
    pub(crate) idle_cycles: u32,
    pub(crate) dmi_busy_delay: u32,
    pub(crate) ac_busy_delay: u32,
    pub(crate) version: DtmVersion,
    /// Last values written to the program buffer, if known.
    pub(crate) progbuf_cache: [Option<u32>; PROGBUF_MAX],
    /// Consecutive batches that completed without a busy response.
    pub(crate) quiet_batches: u32,
    /// Quiet batches after which the adaptive delays are dropped to zero.
    pub(crate) reset_delays_wait: Option<u32>,
}

impl DtmState {
    /// State for the DTM at `tap`, not yet initialized.
    pub fn new(tap: TapPosition, tunnel: Option<BscanTunnel>) -> Self {
        Self {
            tap,
            tunnel,
            abits: 0,
            idle_cycles: 0,
            dmi_busy_delay: 0,
            ac_busy_delay: 0,
            version: DtmVersion::Unknown,
            progbuf_cache: [None; PROGBUF_MAX],
            quiet_batches: 0,
            reset_delays_wait: None,
        }
    }

    /// Forget the cached program buffer contents.
    pub(crate) fn invalidate_progbuf_cache(&mut self) {
        self.progbuf_cache = [None; PROGBUF_MAX];
    }

    /// Number of idle cycles to insert after a request scan.
    pub(crate) fn request_idle(&self, exec: bool) -> u32 {
        let mut idle = self.idle_cycles + self.dmi_busy_delay;
        if exec {
            idle += self.ac_busy_delay;
        }
        idle
    }

    /// Current DMI busy delay.
    pub fn dmi_busy_delay(&self) -> u32 {
        self.dmi_busy_delay
    }

    /// Current abstract command busy delay.
    pub fn ac_busy_delay(&self) -> u32 {
        self.ac_busy_delay
    }

    /// Number of address bits of the DMI.
    pub fn abits(&self) -> u32 {
        self.abits
    }

    /// Version of the DTM.
    pub fn version(&self) -> DtmVersion {
        self.version
    }
}

/// Grow an adaptive delay by 10% plus one cycle.
pub(crate) fn grow_delay(delay: u32) -> u32 {
    delay.saturating_add(delay / 10 + 1)
}

/// Access to the Debug Transport Module (DTM),
/// which is used to communicate with the RISC-V debug module.
pub struct Dtm<'jtag> {
    jtag: &'jtag mut dyn JtagAccess,
    pub(crate) state: &'jtag mut DtmState,
    timeout: Duration,
    /// Currently selected IR, if known.
    ir: Option<u32>,
    /// For every DR scan queued since the last flush, whether its capture is kept.
    captures: Vec<bool>,
}

impl std::fmt::Debug for Dtm<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dtm")
            .field("state", &self.state)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<'jtag> Dtm<'jtag> {
    /// Create a DTM accessor. `timeout` bounds busy retries.
    pub fn new(
        jtag: &'jtag mut dyn JtagAccess,
        state: &'jtag mut DtmState,
        timeout: Duration,
    ) -> Self {
        Self {
            jtag,
            state,
            timeout,
            ir: None,
            captures: Vec::new(),
        }
    }

    /// Timeout applied to DMI level operations.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn select_ir(&mut self, instruction: u32) {
        if self.ir != Some(instruction) {
            self.jtag.add_ir(self.state.tap, instruction);
            self.ir = Some(instruction);
        }
    }

    fn queue_dr(&mut self, bits: &BitSlice<u8, Lsb0>, keep: bool) {
        self.jtag.add_dr(self.state.tap, bits);
        self.captures.push(keep);
    }

    /// Select one of the DTM registers through the BSCAN tunnel.
    fn queue_tunnel_select(&mut self, tunnel: BscanTunnel, address: u32) {
        let tunneled_ir: u32 = (tunnel.ir_width << (tunnel.ir_width + 3)) | (address << 3);
        let tunneled_ir_len = 1 + 7 + tunnel.ir_width + 3;

        self.select_ir(tunnel.ir_id);
        self.queue_dr(&dr_bits(tunneled_ir as u128, tunneled_ir_len), false);
    }

    /// Queue a scan of the `dmi` register, followed by `idle` run-test/idle cycles.
    pub(crate) fn queue_dmi(&mut self, op: DmiOperation, idle: u32) {
        let dmi_bits = self.state.abits + DMI_ADDRESS_BIT_OFFSET;

        match self.state.tunnel {
            Some(tunnel) => {
                self.queue_tunnel_select(tunnel, DMI_ADDRESS);
                let (len, frame) = op.to_tunneled_frame(dmi_bits);
                self.queue_dr(&dr_bits(frame, len), true);
            }
            None => {
                self.select_ir(DMI_ADDRESS);
                self.queue_dr(&dr_bits(op.register_value(), dmi_bits), true);
            }
        }

        if idle > 0 {
            self.jtag.add_runtest(idle);
        }

        tracing::trace!("queued {:x?}, idle {}", op, idle);
    }

    /// Execute everything queued and return the captures that were asked for.
    pub(crate) fn flush(&mut self) -> Result<Vec<BitVec<u8, Lsb0>>, RiscvError> {
        let keep = std::mem::take(&mut self.captures);
        let captures = self.jtag.execute()?;

        if captures.len() != keep.len() {
            return Err(TransportError::CaptureMismatch {
                expected: keep.len(),
                returned: captures.len(),
            }
            .into());
        }

        Ok(captures
            .into_iter()
            .zip(keep)
            .filter_map(|(bits, keep)| keep.then_some(bits))
            .collect())
    }

    /// Decode the capture of a `dmi` scan.
    pub(crate) fn decode_dmi(&self, bits: &BitSlice<u8, Lsb0>) -> DmiResponse {
        let bits = if self.state.tunnel.is_some() {
            &bits[TUNNEL_RESPONSE_OFFSET.min(bits.len())..]
        } else {
            bits
        };
        let len = bits.len().min(128);
        let response_value = bits[..len].load_le::<u128>();

        DmiResponse {
            status: DmiOperationStatus::parse((response_value & DMI_OP_MASK) as u8),
            data: (response_value >> DMI_VALUE_BIT_OFFSET) as u32,
        }
    }

    /// Shift `out` through the `dtmcs` register and return the captured value.
    pub fn dtmcs_scan(&mut self, out: u32) -> Result<u32, RiscvError> {
        match self.state.tunnel {
            Some(tunnel) => {
                self.queue_tunnel_select(tunnel, DTMCS_ADDRESS);
                let width_offset = 1 + (DTMCS_WIDTH as u128) + 3;
                let msb_offset = 7 + width_offset;
                let frame: u128 =
                    (1 << msb_offset) | ((DTMCS_WIDTH as u128) << width_offset) | ((out as u128) << 3);
                self.queue_dr(&dr_bits(frame, msb_offset as u32 + 1), true);
            }
            None => {
                self.select_ir(DTMCS_ADDRESS);
                self.queue_dr(&dr_bits(out as u128, DTMCS_WIDTH), true);
            }
        }

        let captures = self.flush()?;
        let bits = captures
            .first()
            .ok_or(RiscvError::BatchedResultNotAvailable)?;
        let bits = if self.state.tunnel.is_some() {
            &bits[TUNNEL_RESPONSE_OFFSET.min(bits.len())..]
        } else {
            &bits[..]
        };
        let value = bits[..bits.len().min(32)].load_le::<u32>();

        tracing::trace!("dtmcs: {:#x} -> {:#x}", out, value);
        Ok(value)
    }

    /// Read `dtmcs` and set up the DMI parameters.
    pub fn init(&mut self) -> Result<Dtmcs, RiscvError> {
        let raw_dtmcs = self.dtmcs_scan(0)?;

        if raw_dtmcs == 0 {
            return Err(RiscvError::NoRiscvTarget);
        }

        let dtmcs = Dtmcs(raw_dtmcs);

        tracing::debug!("{:?}", dtmcs);

        match dtmcs.version() {
            0 => {
                let dtmcontrol = DtmcontrolV011(raw_dtmcs);
                tracing::debug!("{:?}", dtmcontrol);
                self.state.version = DtmVersion::V0_11;
                self.state.abits = dtmcontrol.addrbits();
                self.state.idle_cycles = dtmcontrol.idle();
            }
            1 => {
                self.state.version = DtmVersion::V0_13;
                self.state.abits = dtmcs.abits();
                self.state.idle_cycles = dtmcs.idle();
            }
            other => {
                return Err(RiscvError::UnsupportedDebugTransportModuleVersion(
                    other as u8,
                ))
            }
        }

        Ok(dtmcs)
    }

    /// Clear the sticky error state (field *op* in the DMI register)
    pub fn clear_error_state(&mut self) -> Result<(), RiscvError> {
        let mut dtmcs = Dtmcs(0);

        dtmcs.set_dmireset(true);

        let Dtmcs(reg_value) = dtmcs;

        self.dtmcs_scan(reg_value)?;

        Ok(())
    }

    /// Reset the DTM, cancelling any outstanding DMI transaction.
    pub fn hard_reset(&mut self) -> Result<(), RiscvError> {
        let mut dtmcs = Dtmcs(0);
        dtmcs.set_dmihardreset(true);

        self.dtmcs_scan(dtmcs.0)?;
        self.state.invalidate_progbuf_cache();

        Ok(())
    }

    /// Read the IDCODE register of the TAP.
    pub fn read_idcode(&mut self) -> Result<u32, RiscvError> {
        self.select_ir(IDCODE_ADDRESS);
        self.queue_dr(&dr_bits(0, 32), true);

        let captures = self.flush()?;
        let bits = captures
            .first()
            .ok_or(RiscvError::BatchedResultNotAvailable)?;

        Ok(bits[..bits.len().min(32)].load_le::<u32>())
    }

    /// Grow the DMI busy delay and clear the sticky busy state.
    pub(crate) fn increase_dmi_busy_delay(&mut self) -> Result<(), RiscvError> {
        self.state.dmi_busy_delay = grow_delay(self.state.dmi_busy_delay);
        self.state.quiet_batches = 0;

        tracing::info!(
            "dtmcs.idle={}, dmi_busy_delay={}, ac_busy_delay={}",
            self.state.idle_cycles,
            self.state.dmi_busy_delay,
            self.state.ac_busy_delay
        );

        self.clear_error_state()
    }

    /// Grow the abstract command busy delay.
    pub(crate) fn increase_ac_busy_delay(&mut self) {
        self.state.ac_busy_delay = grow_delay(self.state.ac_busy_delay);
        self.state.quiet_batches = 0;

        tracing::info!(
            "dtmcs.idle={}, dmi_busy_delay={}, ac_busy_delay={}",
            self.state.idle_cycles,
            self.state.dmi_busy_delay,
            self.state.ac_busy_delay
        );
    }

    /// Perform one logical DMI operation.
    ///
    /// The request is followed by a NOP scan capturing its response. Busy responses
    /// are retried with a larger delay until the timeout expires.
    fn dmi_op(&mut self, op: DmiOperation, exec: bool) -> Result<u32, RiscvError> {
        let start_time = Instant::now();

        loop {
            self.queue_dmi(op, self.state.request_idle(exec));
            self.queue_dmi(DmiOperation::NoOp, 0);

            let captures = self.flush()?;
            let [request, response] = captures.as_slice() else {
                return Err(RiscvError::BatchedResultNotAvailable);
            };
            let request = self.decode_dmi(request);
            let response = self.decode_dmi(response);

            let busy = request.status == DmiOperationStatus::RequestInProgress
                || response.status == DmiOperationStatus::RequestInProgress;

            if busy {
                // Operation still in progress, reset dmi status and try again.
                self.increase_dmi_busy_delay()?;

                if start_time.elapsed() > self.timeout {
                    tracing::error!("DMI stayed busy for {:?} on {:x?}", self.timeout, op);
                    return Err(RiscvError::DmiBusy);
                }
                continue;
            }

            return match response.status {
                DmiOperationStatus::Ok => Ok(response.data),
                _ => {
                    let address = match op {
                        DmiOperation::NoOp => 0,
                        DmiOperation::Read { address } | DmiOperation::Write { address, .. } => {
                            address
                        }
                    };
                    tracing::error!("DMI operation {:x?} failed: {:?}", op, response.status);
                    self.clear_error_state()?;
                    Err(RiscvError::DmiFailed { address })
                }
            };
        }
    }

    /// Track the effect of a DMI write on the program buffer cache.
    pub(crate) fn note_write(&mut self, address: u32, value: u32) {
        let progbuf = PROGBUF0_ADDRESS as u32..PROGBUF0_ADDRESS as u32 + PROGBUF_MAX as u32;

        if progbuf.contains(&address)
            || (address == Dmcontrol::ADDRESS as u32 && !Dmcontrol::from(value).dmactive())
        {
            self.state.invalidate_progbuf_cache();
        }
    }

    /// Read a DM register.
    pub fn read(&mut self, address: u32) -> Result<u32, RiscvError> {
        let value = self.dmi_op(DmiOperation::Read { address }, false)?;
        tracing::trace!("dmi read {:#04x} -> {:#010x}", address, value);
        Ok(value)
    }

    /// Read a DM register, where the read may start an abstract command.
    pub fn read_exec(&mut self, address: u32) -> Result<u32, RiscvError> {
        self.dmi_op(DmiOperation::Read { address }, true)
    }

    /// Write a DM register.
    pub fn write(&mut self, address: u32, value: u32) -> Result<(), RiscvError> {
        tracing::trace!("dmi write {:#04x} <- {:#010x}", address, value);
        self.note_write(address, value);
        self.dmi_op(DmiOperation::Write { address, value }, false)?;
        Ok(())
    }

    /// Write a DM register, where the write starts an abstract command.
    pub fn write_exec(&mut self, address: u32, value: u32) -> Result<(), RiscvError> {
        tracing::trace!("dmi write {:#04x} <- {:#010x} (exec)", address, value);
        self.note_write(address, value);
        self.dmi_op(DmiOperation::Write { address, value }, true)?;
        Ok(())
    }

    /// Decode the capture of a `dbus` scan.
    fn decode_dbus(bits: &BitSlice<u8, Lsb0>) -> (DmiOperationStatus, u64) {
        let value = bits[..bits.len().min(128)].load_le::<u128>();
        (
            DmiOperationStatus::parse((value & DMI_OP_MASK) as u8),
            (value >> DMI_VALUE_BIT_OFFSET) as u64 & DBUS_DATA_MASK,
        )
    }

    /// Perform one operation on the `dbus` register of a 0.11 DTM.
    ///
    /// Works like [`Dtm::read`], but returns all 34 data bits.
    fn dbus_op(&mut self, opcode: u8, address: u32, data: u64) -> Result<u64, RiscvError> {
        let bits = self.state.abits + DBUS_ADDRESS_BIT_OFFSET;
        let request = (address as u128) << DBUS_ADDRESS_BIT_OFFSET
            | ((data & DBUS_DATA_MASK) as u128) << DMI_VALUE_BIT_OFFSET
            | opcode as u128;
        let start_time = Instant::now();

        loop {
            self.select_ir(DMI_ADDRESS);
            self.queue_dr(&dr_bits(request, bits), true);
            let idle = self.state.request_idle(false);
            if idle > 0 {
                self.jtag.add_runtest(idle);
            }
            self.queue_dr(&dr_bits(0, bits), true);

            let captures = self.flush()?;
            let [request, response] = captures.as_slice() else {
                return Err(RiscvError::BatchedResultNotAvailable);
            };
            let (request_status, _) = Self::decode_dbus(request);
            let (status, value) = Self::decode_dbus(response);

            if request_status == DmiOperationStatus::RequestInProgress
                || status == DmiOperationStatus::RequestInProgress
            {
                // dbusreset sits where dmireset is.
                self.increase_dmi_busy_delay()?;

                if start_time.elapsed() > self.timeout {
                    tracing::error!("dbus stayed busy for {:?} at {:#x}", self.timeout, address);
                    return Err(RiscvError::DmiBusy);
                }
                continue;
            }

            if status != DmiOperationStatus::Ok {
                tracing::error!("dbus operation {} at {:#x} failed: {:?}", opcode, address, status);
                self.clear_error_state()?;
                return Err(RiscvError::DmiFailed { address });
            }

            return Ok(value);
        }
    }

    /// Read a register on the `dbus` of a 0.11 DTM.
    pub fn dbus_read(&mut self, address: u32) -> Result<u64, RiscvError> {
        let value = self.dbus_op(1, address, 0)?;
        tracing::trace!("dbus read {:#04x} -> {:#011x}", address, value);
        Ok(value)
    }

    /// Write a register on the `dbus` of a 0.11 DTM.
    pub fn dbus_write(&mut self, address: u32, value: u64) -> Result<(), RiscvError> {
        tracing::trace!("dbus write {:#04x} <- {:#011x}", address, value);
        self.dbus_op(2, address, value)?;
        Ok(())
    }

    /// Write `progbuf<index>` and remember the written value.
    pub(crate) fn write_progbuf(&mut self, index: usize, value: u32) -> Result<(), RiscvError> {
        let address = PROGBUF0_ADDRESS as u32 + index as u32;
        self.dmi_op(DmiOperation::Write { address, value }, false)?;
        self.state.progbuf_cache[index] = Some(value);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_case::test_case;

    #[test_case(DmiOperation::NoOp, 0; "nop")]
    #[test_case(DmiOperation::Read { address: 0x11 }, 0x11 << 34 | 1; "read")]
    #[test_case(DmiOperation::Write { address: 0x10, value: 0x8000_0001 }, 0x10 << 34 | 0x8000_0001 << 2 | 2; "write")]
    fn dmi_register_value(op: DmiOperation, expected: u128) {
        assert_eq!(op.register_value(), expected);
    }

    #[test_case(0, 1)]
    #[test_case(1, 2)]
    #[test_case(10, 12)]
    #[test_case(100, 111)]
    fn delay_growth(delay: u32, grown: u32) {
        assert_eq!(grow_delay(delay), grown);
    }

    #[test]
    fn status_parse() {
        assert_eq!(DmiOperationStatus::parse(0), DmiOperationStatus::Ok);
        assert_eq!(
            DmiOperationStatus::parse(2),
            DmiOperationStatus::OperationFailed
        );
        assert_eq!(
            DmiOperationStatus::parse(3),
            DmiOperationStatus::RequestInProgress
        );
    }

    #[test]
    fn request_idle_adds_ac_delay_for_exec() {
        let mut state = DtmState::new(TapPosition(0), None);
        state.idle_cycles = 1;
        state.dmi_busy_delay = 2;
        state.ac_busy_delay = 4;

        assert_eq!(state.request_idle(false), 3);
        assert_eq!(state.request_idle(true), 7);
    }

    #[test]
    fn dbus_capture_carries_interrupt() {
        let bits = dr_bits(1 << 35 | 0x1234 << 2 | 3, 43);
        let (status, value) = Dtm::decode_dbus(&bits);

        assert_eq!(status, DmiOperationStatus::RequestInProgress);
        assert_eq!(value, 1 << 33 | 0x1234);
    }

    #[test]
    fn tunneled_frame_layout() {
        let (len, frame) = DmiOperation::NoOp.to_tunneled_frame(41);

        // select bit, 7 bit width, 41 + 1 payload bits, 3 idle bits
        assert_eq!(len, 53);
        assert_eq!(frame >> 52, 1);
        assert_eq!((frame >> 45) & 0x7f, 42);
    }
}
