//! Debug Module sessions.
//!
//! A Debug Module is shared by every hart behind it. Its state lives in a
//! [`DmSession`], keyed by the TAP position of its DTM.

pub mod registers;

use std::time::{Duration, Instant};

use crate::dtm::{Dtm, DtmState, DtmVersion};
use crate::error::RiscvError;
use crate::transport::{BscanTunnel, JtagAccess, TapPosition};
use registers::{
    Abstractcs, DebugRegister, Dmcontrol, Dmcs2, Dmstatus, Hartinfo, Sbcs, DATA_MAX, PROGBUF_MAX,
};

/// Maximum number of harts enumerated behind one Debug Module.
const MAX_HARTS: u32 = 32;

/// DMI address of the Debug Module's register block. Only the first DM on a
/// DMI bus is used.
pub const DM_BASE: u32 = 0;

/// Version of the Debug Module, from `dmstatus.version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DmVersion {
    /// Version 0.11, behind a 0.11 DTM.
    V0_11,
    /// Version 0.13.
    V0_13,
    /// Version 1.0.
    V1_0,
    /// Not examined yet.
    #[default]
    Unknown,
}

/// Per Debug Module state.
#[derive(Debug, Default)]
pub struct DmState {
    /// `dmactive` was set by this session.
    pub(crate) was_reset: bool,
    pub(crate) examined: bool,
    pub(crate) version: DmVersion,
    pub(crate) abstract_data_count: u8,
    pub(crate) progbuf_size: u8,
    pub(crate) impebreak: bool,
    pub(crate) sbcs: Sbcs,
    pub(crate) hartinfo: Option<Hartinfo>,
    pub(crate) hart_count: Option<u32>,
    pub(crate) hartsellen: u32,
    pub(crate) current_hartid: Option<u32>,
    pub(crate) hasel_supported: bool,
    pub(crate) bus_master_delay: u32,
    /// Words of Debug RAM, 0.11 only.
    pub(crate) dram_words: usize,
}

impl DmState {
    /// Number of harts found behind the DM, if enumerated.
    pub fn hart_count(&self) -> Option<u32> {
        self.hart_count
    }

    /// Number of program buffer words.
    pub fn progbuf_size(&self) -> u8 {
        self.progbuf_size
    }

    /// Whether an implicit `ebreak` follows the program buffer.
    pub fn impebreak(&self) -> bool {
        self.impebreak
    }

    /// Number of `data` registers.
    pub fn abstract_data_count(&self) -> u8 {
        self.abstract_data_count
    }

    /// Whether the DM supports the hart array mask.
    pub fn hasel_supported(&self) -> bool {
        self.hasel_supported
    }

    /// Version of the Debug Module.
    pub fn version(&self) -> DmVersion {
        self.version
    }

    /// Snapshot of `sbcs` taken during examination.
    pub fn sbcs(&self) -> Sbcs {
        self.sbcs
    }

    /// Words of Debug RAM of a 0.11 Debug Module.
    pub fn dram_words(&self) -> usize {
        self.dram_words
    }

    /// Current system bus delay.
    pub fn bus_master_delay(&self) -> u32 {
        self.bus_master_delay
    }
}

/// A Debug Module and the DTM in front of it.
#[derive(Debug)]
pub struct DmSession {
    pub(crate) dtm: DtmState,
    pub(crate) dm: DmState,
}

impl DmSession {
    /// A new session for the DTM at `tap`.
    pub fn new(tap: TapPosition, tunnel: Option<BscanTunnel>, reset_delays_wait: Option<u32>) -> Self {
        let mut dtm = DtmState::new(tap, tunnel);
        dtm.reset_delays_wait = reset_delays_wait;

        Self {
            dtm,
            dm: DmState::default(),
        }
    }

    /// DTM state of the session.
    pub fn dtm_state(&self) -> &DtmState {
        &self.dtm
    }

    /// DM state of the session.
    pub fn dm_state(&self) -> &DmState {
        &self.dm
    }

    /// Borrow the session together with the transport.
    pub fn module<'a>(
        &'a mut self,
        jtag: &'a mut dyn JtagAccess,
        timeout: Duration,
    ) -> DebugModule<'a> {
        DebugModule {
            dtm: Dtm::new(jtag, &mut self.dtm, timeout),
            state: &mut self.dm,
        }
    }
}

/// Access to a Debug Module over its DTM.
#[derive(Debug)]
pub struct DebugModule<'a> {
    pub(crate) dtm: Dtm<'a>,
    pub(crate) state: &'a mut DmState,
}

impl<'a> DebugModule<'a> {
    /// Read a DM register.
    pub fn read_dm_register<R: DebugRegister>(&mut self) -> Result<R, RiscvError> {
        tracing::debug!(
            "Reading DM register '{}' at {:#010x}",
            R::NAME,
            R::ADDRESS
        );

        let value = self.dtm.read(R::ADDRESS as u32)?;

        tracing::debug!("Read DM register '{}' value {:#010x}", R::NAME, value);

        Ok(value.into())
    }

    /// Write a DM register.
    pub fn write_dm_register<R: DebugRegister>(&mut self, register: R) -> Result<(), RiscvError> {
        let data = register.into();

        tracing::debug!(
            "Write DM register '{}' at {:#010x} = {:#010x}",
            R::NAME,
            R::ADDRESS,
            data
        );

        self.dtm.write(R::ADDRESS as u32, data)
    }

    /// State of the module.
    pub fn state(&self) -> &DmState {
        self.state
    }

    /// Timeout for DMI level operations.
    pub fn timeout(&self) -> Duration {
        self.dtm.timeout()
    }

    /// `dmcontrol` with `dmactive` set and the current hart selected.
    pub(crate) fn dmcontrol(&self) -> Dmcontrol {
        let mut dmcontrol = Dmcontrol::from(0);
        dmcontrol.set_dmactive(true);
        dmcontrol.set_hartsel(self.state.current_hartid.unwrap_or(0));
        dmcontrol
    }

    /// Read `dtmcs` and check the DTM version.
    pub fn init_dtm(&mut self) -> Result<(), RiscvError> {
        self.dtm.init()?;

        match self.dtm.state.version {
            DtmVersion::V0_13 => Ok(()),
            DtmVersion::V0_11 if self.dtm.state.tunnel.is_some() => {
                tracing::error!("A 0.11 debug transport module can't be reached through a BSCAN tunnel");
                Err(RiscvError::Unsupported("0.11 debug transport behind a tunnel"))
            }
            DtmVersion::V0_11 => {
                tracing::info!("Found a 0.11 debug transport module");
                Ok(())
            }
            DtmVersion::Unknown => Err(RiscvError::NoRiscvTarget),
        }
    }

    /// Whether the DM is reached through a 0.11 DTM.
    pub fn is_legacy(&self) -> bool {
        self.dtm.state.version == DtmVersion::V0_11
    }

    /// Reset and activate the DM, unless that already happened in this session.
    pub fn activate(&mut self) -> Result<(), RiscvError> {
        if self.state.was_reset {
            return Ok(());
        }

        // Reset the debug module, then enable it.
        self.write_dm_register(Dmcontrol::from(0))?;

        let mut control = Dmcontrol::from(0);
        control.set_dmactive(true);
        self.write_dm_register(control)?;

        let start = Instant::now();
        loop {
            let control: Dmcontrol = self.read_dm_register()?;
            if control.dmactive() {
                break;
            }

            if start.elapsed() > self.timeout() {
                tracing::error!("dmactive did not read back as set");
                return Err(RiscvError::DebugModuleInactive);
            }
        }

        self.state.was_reset = true;
        self.state.current_hartid = Some(0);
        self.dtm.state.invalidate_progbuf_cache();

        Ok(())
    }

    /// Examine the Debug Module: version, capabilities and harts.
    ///
    /// Only done once per session.
    pub fn examine(&mut self) -> Result<(), RiscvError> {
        if self.state.examined {
            return Ok(());
        }

        if self.dtm.state.version == DtmVersion::Unknown {
            self.init_dtm()?;
        }

        if self.is_legacy() {
            return self.examine_legacy();
        }

        self.activate()?;

        let status: Dmstatus = self.read_dm_register()?;
        tracing::debug!("{:?}", status);

        self.state.version = match status.version() {
            2 => DmVersion::V0_13,
            3 => DmVersion::V1_0,
            other => {
                tracing::error!("Debug module version {} is not supported", other);
                return Err(RiscvError::UnsupportedDebugModuleVersion(other as u8));
            }
        };

        if !status.authenticated() {
            return Err(RiscvError::AuthenticationRequired);
        }

        self.state.impebreak = status.impebreak();

        let abstractcs: Abstractcs = self.read_dm_register()?;
        tracing::debug!("{:?}", abstractcs);

        self.state.progbuf_size = (abstractcs.progbufsize() as usize).min(PROGBUF_MAX) as u8;
        self.state.abstract_data_count = (abstractcs.datacount() as usize).min(DATA_MAX) as u8;

        if abstractcs.cmderr() != 0 {
            self.clear_cmderr()?;
        }

        if self.state.abstract_data_count < 1 {
            tracing::error!("The debug module reports no abstract data registers");
            return Err(RiscvError::Unsupported("abstract data registers"));
        }

        self.state.sbcs = self.read_dm_register()?;
        tracing::debug!("{:?}", self.state.sbcs);

        self.enumerate_harts()?;

        self.state.examined = true;

        Ok(())
    }

    /// Find out how many harts are behind this DM.
    pub fn enumerate_harts(&mut self) -> Result<u32, RiscvError> {
        // Find out how many bits of hartsel are implemented.
        let mut control = Dmcontrol::from(0);
        control.set_dmactive(true);
        control.set_hartsel(0xfffff);
        self.write_dm_register(control)?;

        let readback: Dmcontrol = self.read_dm_register()?;
        let hartsel = readback.hartsel();
        self.state.hartsellen = u32::BITS - hartsel.leading_zeros();
        self.state.current_hartid = None;
        self.state.hart_count = None;

        let limit = MAX_HARTS.min(1 << self.state.hartsellen);

        let mut hart_count = 0;
        for hartid in 0..limit {
            self.select_hart(hartid)?;

            let status: Dmstatus = self.read_dm_register()?;
            if status.anynonexistent() {
                break;
            }

            hart_count = hartid + 1;

            if status.anyhavereset() {
                let mut control = self.dmcontrol();
                control.set_ackhavereset(true);
                self.write_dm_register(control)?;
            }
        }

        // Check whether the hart array mask is implemented.
        let mut control = self.dmcontrol();
        control.set_hasel(true);
        self.write_dm_register(control)?;
        let readback: Dmcontrol = self.read_dm_register()?;
        self.state.hasel_supported = readback.hasel();

        let control = self.dmcontrol();
        self.write_dm_register(control)?;

        if self.state.hartinfo.is_none() && hart_count > 0 {
            self.select_hart(0)?;
            self.state.hartinfo = Some(self.read_dm_register()?);
        }

        tracing::info!(
            "Found {} harts (hartsellen {}, hasel {})",
            hart_count,
            self.state.hartsellen,
            self.state.hasel_supported
        );

        self.state.hart_count = Some(hart_count);

        Ok(hart_count)
    }

    /// Select `hartid`, unless it is already selected.
    pub fn select_hart(&mut self, hartid: u32) -> Result<(), RiscvError> {
        if self.state.current_hartid == Some(hartid) {
            return Ok(());
        }

        if let Some(count) = self.state.hart_count {
            if hartid >= count {
                return Err(RiscvError::HartNotFound(hartid));
            }
        }

        let mut control = Dmcontrol::from(0);
        control.set_dmactive(true);
        control.set_hartsel(hartid);
        self.write_dm_register(control)?;

        self.state.current_hartid = Some(hartid);

        Ok(())
    }

    /// Put `hartid` into halt group `group`.
    ///
    /// Returns `false` if the DM did not accept the group.
    pub fn set_halt_group(&mut self, hartid: u32, group: u32) -> Result<bool, RiscvError> {
        if self.is_legacy() {
            return Ok(false);
        }

        self.select_hart(hartid)?;

        let mut dmcs2 = Dmcs2::from(0);
        dmcs2.set_hgwrite(true);
        dmcs2.set_group(group);
        self.write_dm_register(dmcs2)?;

        let readback: Dmcs2 = self.read_dm_register()?;
        if readback.group() != group {
            tracing::warn!(
                "Hart {} could not join halt group {} (dmcs2.group reads {})",
                hartid,
                group,
                readback.group()
            );
            return Ok(false);
        }

        Ok(true)
    }

    /// Write 1 to all `cmderr` bits.
    pub fn clear_cmderr(&mut self) -> Result<(), RiscvError> {
        let mut abstractcs = Abstractcs::from(0);
        abstractcs.set_cmderr(0x7);
        self.write_dm_register(abstractcs)
    }

    /// Raw DMI read. On a 0.11 DTM this is a `dbus` read, without the status bits.
    pub fn dmi_read(&mut self, address: u32) -> Result<u32, RiscvError> {
        if self.is_legacy() {
            return Ok(self.dtm.dbus_read(address)? as u32);
        }
        self.dtm.read(address)
    }

    /// Raw DMI write.
    ///
    /// Writes to `dmcontrol` may change the selected hart, so the cached selection
    /// is dropped.
    pub fn dmi_write(&mut self, address: u32, value: u32) -> Result<(), RiscvError> {
        if self.is_legacy() {
            return self.dtm.dbus_write(address, u64::from(value));
        }

        self.dtm.write(address, value)?;
        if address == Dmcontrol::ADDRESS as u32 {
            self.state.current_hartid = None;
            if !Dmcontrol::from(value).dmactive() {
                self.state.was_reset = false;
                self.state.examined = false;
            }
        }
        Ok(())
    }

    /// Read the DM register at `address`, relative to the DM's base.
    pub fn dm_read(&mut self, address: u32) -> Result<u32, RiscvError> {
        self.dmi_read(DM_BASE + address)
    }

    /// Write the DM register at `address`, relative to the DM's base.
    pub fn dm_write(&mut self, address: u32, value: u32) -> Result<(), RiscvError> {
        self.dmi_write(DM_BASE + address, value)
    }

    /// Read `authdata`.
    pub fn authdata_read(&mut self) -> Result<u32, RiscvError> {
        if self.is_legacy() {
            return Err(RiscvError::Unsupported("authentication on a 0.11 debug module"));
        }
        self.dtm.read(registers::Authdata::ADDRESS as u32)
    }

    /// Write `authdata`, then report whether the DM is authenticated.
    pub fn authdata_write(&mut self, value: u32) -> Result<bool, RiscvError> {
        if self.is_legacy() {
            return Err(RiscvError::Unsupported("authentication on a 0.11 debug module"));
        }
        self.dtm.write(registers::Authdata::ADDRESS as u32, value)?;

        let start = Instant::now();
        loop {
            let status: Dmstatus = self.read_dm_register()?;
            if !status.authbusy() {
                if status.authenticated() {
                    tracing::info!("Debug module authenticated");
                }
                return Ok(status.authenticated());
            }
            if start.elapsed() > self.timeout() {
                return Err(RiscvError::Timeout);
            }
        }
    }
}
