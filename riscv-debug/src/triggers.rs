//! Hardware triggers.
//!
//! The trigger module is reached through `tselect`, `tdata1`, `tdata2` and `tinfo`.
//! Breakpoints and watchpoints are mapped onto legacy, `mcontrol` or `mcontrol6`
//! triggers, whichever the hart accepts. `icount`, `itrigger` and `etrigger` are
//! set up on request.

use std::collections::VecDeque;

use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;

use crate::error::RiscvError;
use crate::hart::RiscvCore;
use crate::registers::{csr, misa_has, RegisterNumber};

/// Triggers beyond this index are not looked at.
pub const MAX_TRIGGERS: usize = 32;

/// Configurations remembered per trigger as not supported.
const REJECTED_CAPACITY: usize = 16;

/// `tdata1.type` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Primitive)]
pub enum TriggerType {
    /// Legacy SiFive address match trigger.
    Legacy = 1,
    /// Address/data match trigger.
    Mcontrol = 2,
    /// Instruction count trigger.
    Icount = 3,
    /// Interrupt trigger.
    Itrigger = 4,
    /// Exception trigger.
    Etrigger = 5,
    /// Address/data match trigger, newer layout.
    Mcontrol6 = 6,
}

impl TriggerType {
    /// Unique id reserved for the manually set trigger of this type.
    pub fn manual_id(self) -> i32 {
        -(self as i32)
    }
}

// Match fields shared by mcontrol and mcontrol6.
const MATCH_LOAD: u64 = 1 << 0;
const MATCH_STORE: u64 = 1 << 1;
const MATCH_EXECUTE: u64 = 1 << 2;
const MATCH_U: u64 = 1 << 3;
const MATCH_S: u64 = 1 << 4;
const MATCH_M: u64 = 1 << 6;
const MATCH_CHAIN: u64 = 1 << 11;
const MATCH_ACTION_DEBUG: u64 = 1 << 12;

const MCONTROL_HIT: u64 = 1 << 20;

const MCONTROL6_VU: u64 = 1 << 23;
const MCONTROL6_VS: u64 = 1 << 24;
const MCONTROL6_HIT0: u64 = 1 << 22;
const MCONTROL6_HIT1: u64 = 1 << 25;

const LEGACY_X: u64 = 1 << 0;
const LEGACY_W: u64 = 1 << 1;
const LEGACY_R: u64 = 1 << 2;
const LEGACY_U: u64 = 1 << 3;
const LEGACY_S: u64 = 1 << 4;
const LEGACY_H: u64 = 1 << 5;
const LEGACY_M: u64 = 1 << 6;

const ICOUNT_HIT: u64 = 1 << 24;

/// `tdata1.match` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchKind {
    Equal = 0,
    Napot = 1,
    GreaterOrEqual = 2,
    Less = 3,
}

impl MatchKind {
    fn bits(self) -> u64 {
        (self as u64) << 7
    }
}

fn type_shift(xlen: u32) -> u32 {
    xlen - 4
}

fn dmode_bit(xlen: u32) -> u64 {
    1 << (xlen - 5)
}

/// `tdata1.type` of a raw `tdata1` value.
pub fn tdata1_type(tdata1: u64, xlen: u32) -> u64 {
    (tdata1 >> type_shift(xlen)) & 0xf
}

fn with_type(kind: TriggerType, xlen: u32) -> u64 {
    (kind as u64) << type_shift(xlen) | dmode_bit(xlen)
}

/// Hit bits of a trigger of type `kind`.
fn hit_mask(kind: u64, xlen: u32) -> u64 {
    match TriggerType::from_u64(kind) {
        Some(TriggerType::Mcontrol) => MCONTROL_HIT,
        Some(TriggerType::Mcontrol6) => MCONTROL6_HIT0 | MCONTROL6_HIT1,
        Some(TriggerType::Icount) => ICOUNT_HIT,
        Some(TriggerType::Itrigger | TriggerType::Etrigger) => 1 << (xlen - 6),
        Some(TriggerType::Legacy) | None => 0,
    }
}

/// What a breakpoint or watchpoint needs from a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TriggerRequest {
    pub(crate) address: u64,
    pub(crate) length: u64,
    pub(crate) read: bool,
    pub(crate) write: bool,
    pub(crate) execute: bool,
    pub(crate) unique_id: i32,
}

impl TriggerRequest {
    fn napot_possible(&self) -> bool {
        self.length > 1 && self.length.is_power_of_two() && self.address & (self.length - 1) == 0
    }
}

/// `tdata1` fields of a match trigger, before a match kind is picked.
#[derive(Debug, Clone, Copy)]
struct MatchFields {
    kind: TriggerType,
    common: u64,
    ignore_mask: u64,
}

impl MatchFields {
    fn mcontrol(request: &TriggerRequest, xlen: u32, misa: u64) -> Self {
        let mut common = with_type(TriggerType::Mcontrol, xlen) | MATCH_ACTION_DEBUG | MATCH_M;
        common |= common_access_bits(request, misa);

        Self {
            kind: TriggerType::Mcontrol,
            common,
            // maskmax
            ignore_mask: 0x3f << (xlen - 11),
        }
    }

    fn mcontrol6(request: &TriggerRequest, xlen: u32, misa: u64) -> Self {
        let mut common = with_type(TriggerType::Mcontrol6, xlen) | MATCH_ACTION_DEBUG | MATCH_M;
        common |= common_access_bits(request, misa);

        let hypervisor = misa_has(misa, 'H');
        if hypervisor && misa_has(misa, 'S') {
            common |= MCONTROL6_VS;
        }
        if hypervisor && misa_has(misa, 'U') {
            common |= MCONTROL6_VU;
        }

        Self {
            kind: TriggerType::Mcontrol6,
            common,
            ignore_mask: 0,
        }
    }

    fn tdata1(&self, kind: MatchKind, chain: bool) -> u64 {
        let chain = if chain { MATCH_CHAIN } else { 0 };
        self.common | chain | kind.bits()
    }
}

fn common_access_bits(request: &TriggerRequest, misa: u64) -> u64 {
    let mut bits = 0;
    if misa_has(misa, 'S') {
        bits |= MATCH_S;
    }
    if misa_has(misa, 'U') {
        bits |= MATCH_U;
    }
    if request.execute {
        bits |= MATCH_EXECUTE;
    }
    if request.read {
        bits |= MATCH_LOAD;
    }
    if request.write {
        bits |= MATCH_STORE;
    }
    bits
}

/// Privilege modes a manually set trigger fires in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerModes {
    pub m: bool,
    pub s: bool,
    pub u: bool,
    pub vs: bool,
    pub vu: bool,
}

/// An instruction count trigger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IcountTrigger {
    pub modes: TriggerModes,
    pub pending: bool,
    /// Instructions to retire before the trigger fires, up to 0x3fff.
    pub count: u32,
}

impl IcountTrigger {
    fn tdata1(&self, xlen: u32) -> u64 {
        let mut tdata1 = with_type(TriggerType::Icount, xlen) | 1;
        tdata1 |= (self.modes.vs as u64) << 26;
        tdata1 |= (self.modes.vu as u64) << 25;
        tdata1 |= (self.count as u64 & 0x3fff) << 10;
        tdata1 |= (self.modes.m as u64) << 9;
        tdata1 |= (self.pending as u64) << 8;
        tdata1 |= (self.modes.s as u64) << 7;
        tdata1 |= (self.modes.u as u64) << 6;
        tdata1
    }
}

/// An interrupt trigger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Itrigger {
    pub modes: TriggerModes,
    pub nmi: bool,
    /// Interrupt numbers that fire the trigger, as a bit mask.
    pub interrupts: u64,
}

impl Itrigger {
    fn tdata1(&self, xlen: u32) -> u64 {
        mode_bits(with_type(TriggerType::Itrigger, xlen) | 1, self.modes) | (self.nmi as u64) << 10
    }
}

/// An exception trigger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Etrigger {
    pub modes: TriggerModes,
    /// Exception codes that fire the trigger, as a bit mask.
    pub exceptions: u64,
}

impl Etrigger {
    fn tdata1(&self, xlen: u32) -> u64 {
        mode_bits(with_type(TriggerType::Etrigger, xlen) | 1, self.modes)
    }
}

/// Mode bits of `itrigger` and `etrigger`.
fn mode_bits(tdata1: u64, modes: TriggerModes) -> u64 {
    tdata1
        | (modes.vs as u64) << 12
        | (modes.vu as u64) << 11
        | (modes.m as u64) << 9
        | (modes.s as u64) << 7
        | (modes.u as u64) << 6
}

/// What is known about the triggers of a hart.
#[derive(Debug, Default)]
pub(crate) struct TriggerState {
    /// Supported types per trigger, as `1 << type` bits.
    tinfo: Vec<u32>,
    /// Unique id of the breakpoint or watchpoint using each trigger.
    owner: Vec<Option<i32>>,
    /// Recently rejected `(tdata1, tdata2)` pairs per trigger, most recent first.
    rejected: Vec<VecDeque<(u64, u64)>>,
    pub(crate) hit: Option<i32>,
}

impl TriggerState {
    pub(crate) fn count(&self) -> usize {
        self.tinfo.len()
    }

    /// Forget which trigger is used by what, e.g. after a reset cleared them.
    pub(crate) fn clear_assignments(&mut self) {
        self.owner.iter_mut().for_each(|owner| *owner = None);
        self.hit = None;
    }

    pub(crate) fn owner(&self, index: usize) -> Option<i32> {
        self.owner.get(index).copied().flatten()
    }

    fn push(&mut self, tinfo: u32) {
        self.tinfo.push(tinfo);
        self.owner.push(None);
        self.rejected.push(VecDeque::new());
    }

    /// First free trigger at or after `from` supporting `kind`. With `chained`, the
    /// next trigger must be free and support `kind` too.
    fn find_free(&self, kind: TriggerType, chained: bool, from: usize) -> Option<usize> {
        let required = if chained { 2 } else { 1 };
        let mut found = 0;

        for index in from..self.count() {
            if self.owner[index].is_none() && self.tinfo[index] & (1 << kind as u32) != 0 {
                found += 1;
                if found == required {
                    return Some(index + 1 - required);
                }
            } else {
                found = 0;
            }
        }

        None
    }

    fn is_rejected(&mut self, index: usize, tdata1: u64, tdata2: u64) -> bool {
        let Some(rejected) = self.rejected.get_mut(index) else {
            return false;
        };

        match rejected.iter().position(|&entry| entry == (tdata1, tdata2)) {
            Some(position) => {
                if let Some(entry) = rejected.remove(position) {
                    rejected.push_front(entry);
                }
                true
            }
            None => false,
        }
    }

    fn reject(&mut self, index: usize, tdata1: u64, tdata2: u64) {
        if let Some(rejected) = self.rejected.get_mut(index) {
            rejected.push_front((tdata1, tdata2));
            rejected.truncate(REJECTED_CAPACITY);
        }
    }
}

impl RiscvCore<'_> {
    fn tselect(&mut self) -> Result<u64, RiscvError> {
        self.read_register(RegisterNumber::csr(csr::TSELECT))
    }

    fn select_trigger(&mut self, index: usize) -> Result<(), RiscvError> {
        self.write_register(RegisterNumber::csr(csr::TSELECT), index as u64)
    }

    fn tdata1(&mut self) -> Result<u64, RiscvError> {
        self.read_register(RegisterNumber::csr(csr::TDATA1))
    }

    fn set_tdata1(&mut self, value: u64) -> Result<(), RiscvError> {
        self.write_register(RegisterNumber::csr(csr::TDATA1), value)
    }

    /// Count the triggers, find their types, and release triggers left in debug
    /// mode by an earlier session.
    pub(crate) fn enumerate_triggers(&mut self) -> Result<(), RiscvError> {
        let xlen = self.hart.xlen;

        let original = match self.tselect() {
            Ok(tselect) => tselect,
            Err(RiscvError::AbstractCommand(_)) => {
                tracing::info!("tselect is not accessible, assuming there are no triggers");
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        let mut warned_mixed = false;

        for index in 0..MAX_TRIGGERS {
            self.select_trigger(index)?;
            // The top bit is `tdrmode` on some old implementations.
            let readback = self.tselect()? & !(1 << (xlen - 1));
            if readback != index as u64 {
                break;
            }

            let tdata1 = self.tdata1()?;

            let tinfo = match self.read_register(RegisterNumber::csr(csr::TINFO)) {
                Ok(tinfo) => {
                    // 1 means the trigger doesn't exist, an odd value is invalid.
                    if tinfo == 0 || tinfo & 1 != 0 {
                        break;
                    }
                    (tinfo & 0xffff) as u32
                }
                Err(RiscvError::AbstractCommand(_)) => {
                    let kind = tdata1_type(tdata1, xlen);
                    if kind == 0 {
                        break;
                    }
                    1 << kind
                }
                Err(error) => return Err(error),
            };

            let legacy = 1 << TriggerType::Legacy as u32;
            let modern = 1 << TriggerType::Mcontrol as u32 | 1 << TriggerType::Mcontrol6 as u32;
            if tinfo & legacy != 0 && tinfo & modern != 0 && !warned_mixed {
                warned_mixed = true;
                tracing::warn!(
                    "Trigger {} supports both legacy and match control triggers, legacy is used first",
                    index
                );
            }

            tracing::debug!("Trigger {}: supported types {:#x}", index, tinfo);
            self.hart.triggers.push(tinfo);

            let kind = tdata1_type(tdata1, xlen);
            let dmode = kind == TriggerType::Legacy as u64 || tdata1 & dmode_bit(xlen) != 0;
            if dmode && kind != 0 {
                tracing::debug!("Releasing trigger {} left in debug mode", index);
                self.set_tdata1(0)?;
            }
        }

        self.select_trigger(original as usize)?;

        tracing::info!("Found {} triggers", self.hart.triggers.count());

        Ok(())
    }

    /// Program trigger `index` and check that the hart accepted the configuration.
    fn set_trigger(
        &mut self,
        index: usize,
        tdata1: u64,
        tdata2: u64,
        ignore_mask: u64,
    ) -> Result<(), RiscvError> {
        self.select_trigger(index)?;
        self.set_tdata1(0)?;
        self.write_register(RegisterNumber::csr(csr::TDATA2), tdata2)?;
        self.set_tdata1(tdata1)?;

        let tdata1_readback = self.tdata1()?;
        let tdata2_readback = self.read_register(RegisterNumber::csr(csr::TDATA2))?;

        let tdata1_denied = tdata1 & !ignore_mask != tdata1_readback & !ignore_mask;
        let tdata2_denied = tdata2 != tdata2_readback;

        if tdata1_denied || tdata2_denied {
            tracing::debug!(
                "Trigger {} doesn't support tdata1={:#x} (read {:#x}), tdata2={:#x} (read {:#x})",
                index,
                tdata1,
                tdata1_readback,
                tdata2,
                tdata2_readback
            );
            self.set_tdata1(0)?;
            return Err(RiscvError::ResourceUnavailable("trigger"));
        }

        Ok(())
    }

    /// `set_trigger`, skipping configurations the trigger rejected before.
    fn try_trigger(
        &mut self,
        index: usize,
        tdata1: u64,
        tdata2: u64,
        ignore_mask: u64,
    ) -> Result<(), RiscvError> {
        if self.hart.triggers.is_rejected(index, tdata1, tdata2) {
            return Err(RiscvError::ResourceUnavailable("trigger"));
        }

        let result = self.set_trigger(index, tdata1, tdata2, ignore_mask);
        if let Err(RiscvError::ResourceUnavailable(_)) = result {
            self.hart.triggers.reject(index, tdata1, tdata2);
        }
        result
    }

    fn setup_single(
        &mut self,
        unique_id: i32,
        kind: TriggerType,
        (tdata1, tdata2): (u64, u64),
        ignore_mask: u64,
    ) -> Result<(), RiscvError> {
        let mut from = 0;

        while let Some(index) = self.hart.triggers.find_free(kind, false, from) {
            match self.try_trigger(index, tdata1, tdata2, ignore_mask) {
                Ok(()) => {
                    self.hart.triggers.owner[index] = Some(unique_id);
                    return Ok(());
                }
                Err(RiscvError::ResourceUnavailable(_)) => from = index + 1,
                Err(error) => return Err(error),
            }
        }

        Err(RiscvError::ResourceUnavailable("trigger"))
    }

    fn setup_chained(
        &mut self,
        unique_id: i32,
        kind: TriggerType,
        first: (u64, u64),
        second: (u64, u64),
        ignore_mask: u64,
    ) -> Result<(), RiscvError> {
        let mut from = 0;

        while let Some(index) = self.hart.triggers.find_free(kind, true, from) {
            from = index + 1;

            match self.try_trigger(index, first.0, first.1, ignore_mask) {
                Ok(()) => {}
                Err(RiscvError::ResourceUnavailable(_)) => continue,
                Err(error) => return Err(error),
            }

            match self.try_trigger(index + 1, second.0, second.1, ignore_mask) {
                Ok(()) => {
                    self.hart.triggers.owner[index] = Some(unique_id);
                    self.hart.triggers.owner[index + 1] = Some(unique_id);
                    return Ok(());
                }
                Err(RiscvError::ResourceUnavailable(_)) => {
                    self.set_trigger(index, 0, 0, 0)?;
                }
                Err(error) => {
                    self.set_trigger(index, 0, 0, 0)?;
                    return Err(error);
                }
            }
        }

        Err(RiscvError::ResourceUnavailable("trigger"))
    }

    fn add_legacy_trigger(&mut self, request: &TriggerRequest) -> Result<(), RiscvError> {
        let index = self
            .hart
            .triggers
            .find_free(TriggerType::Legacy, false, 0)
            .ok_or(RiscvError::ResourceUnavailable("trigger"))?;

        self.select_trigger(index)?;
        if self.tdata1()? & (LEGACY_R | LEGACY_W | LEGACY_X) != 0 {
            // Used by software running on the hart.
            return Err(RiscvError::ResourceUnavailable("trigger"));
        }

        let misa = self.hart.misa;
        let mut tdata1 = LEGACY_M;
        for (set, bit) in [
            (request.read, LEGACY_R),
            (request.write, LEGACY_W),
            (request.execute, LEGACY_X),
            (misa_has(misa, 'U'), LEGACY_U),
            (misa_has(misa, 'S'), LEGACY_S),
            (misa_has(misa, 'H'), LEGACY_H),
        ] {
            if set {
                tdata1 |= bit;
            }
        }

        self.set_trigger(index, tdata1, request.address, 0)?;
        self.hart.triggers.owner[index] = Some(request.unique_id);
        Ok(())
    }

    fn add_match_trigger(
        &mut self,
        request: &TriggerRequest,
        fields: MatchFields,
    ) -> Result<(), RiscvError> {
        let id = request.unique_id;
        let kind = fields.kind;
        let ignore = fields.ignore_mask;

        if request.execute {
            let eq = (fields.tdata1(MatchKind::Equal, false), request.address);
            return self.setup_single(id, kind, eq, ignore);
        }

        let end = request.address.wrapping_add(request.length);
        let mut result = Err(RiscvError::ResourceUnavailable("trigger"));
        // Whether a trigger covering the whole range was tried and rejected.
        let mut range_rejected = false;

        if request.length > 0 {
            if self.config.enable_napot_trigger && request.napot_possible() {
                let napot = (
                    fields.tdata1(MatchKind::Napot, false),
                    request.address | ((request.length - 1) >> 1),
                );
                result = self.setup_single(id, kind, napot, ignore);
                if !matches!(result, Err(RiscvError::ResourceUnavailable(_))) {
                    return result;
                }
                range_rejected = true;
            }

            if self.config.enable_ge_lt_trigger {
                let ge = fields.tdata1(MatchKind::GreaterOrEqual, true);
                let lt = fields.tdata1(MatchKind::Less, false);
                result = self.setup_chained(id, kind, (ge, request.address), (lt, end), ignore);
                if !matches!(result, Err(RiscvError::ResourceUnavailable(_))) {
                    return result;
                }

                let lt = fields.tdata1(MatchKind::Less, true);
                let ge = fields.tdata1(MatchKind::GreaterOrEqual, false);
                result = self.setup_chained(id, kind, (lt, end), (ge, request.address), ignore);
                if !matches!(result, Err(RiscvError::ResourceUnavailable(_))) {
                    return result;
                }
                range_rejected = true;
            }
        }

        if self.config.enable_eq_match_trigger {
            let eq = (fields.tdata1(MatchKind::Equal, false), request.address);
            result = self.setup_single(id, kind, eq, ignore);

            if result.is_ok() && (request.length > 1 || range_rejected) {
                if request.length > 1 {
                    tracing::debug!(
                        "Trigger matches {:#x}, but maybe not {:#x}..={:#x}",
                        request.address,
                        request.address + 1,
                        end.wrapping_sub(1)
                    );
                }
                if !self.hart.warnings.range_trigger_fallback {
                    self.hart.warnings.range_trigger_fallback = true;
                    tracing::warn!(
                        "Could not set a trigger that will match a whole address range. As a fallback, \
                         this trigger (and maybe others) will only match against the first address of the range."
                    );
                }
            }
        }

        result
    }

    fn add_any_trigger(&mut self, request: &TriggerRequest) -> Result<(), RiscvError> {
        let xlen = self.hart.xlen;
        let misa = self.hart.misa;

        match self.add_legacy_trigger(request) {
            Err(RiscvError::ResourceUnavailable(_)) => {}
            result => return result,
        }

        match self.add_match_trigger(request, MatchFields::mcontrol(request, xlen, misa)) {
            Err(RiscvError::ResourceUnavailable(_)) => {}
            result => return result,
        }

        self.add_match_trigger(request, MatchFields::mcontrol6(request, xlen, misa))
    }

    /// Find a trigger for `request`, trying legacy, `mcontrol` and `mcontrol6`
    /// triggers in turn.
    pub(crate) fn add_trigger(&mut self, request: &TriggerRequest) -> Result<(), RiscvError> {
        self.require_halted()?;

        let tselect = self.tselect()?;
        let result = self.add_any_trigger(request);
        let restored = self.select_trigger(tselect as usize);

        result?;
        restored
    }

    /// Release every trigger used by `unique_id`.
    pub(crate) fn remove_trigger(&mut self, unique_id: i32) -> Result<(), RiscvError> {
        self.require_halted()?;

        let tselect = self.tselect()?;
        let mut found = false;

        for index in 0..self.hart.triggers.count() {
            if self.hart.triggers.owner[index] == Some(unique_id) {
                self.select_trigger(index)?;
                self.set_tdata1(0)?;
                self.hart.triggers.owner[index] = None;
                tracing::debug!("Released trigger {} of {}", index, unique_id);
                found = true;
            }
        }

        self.select_trigger(tselect as usize)?;

        if found {
            Ok(())
        } else {
            tracing::error!("No trigger is used by {}", unique_id);
            Err(RiscvError::UnknownBreakpoint(unique_id))
        }
    }

    /// Find the trigger whose hit bit is set, clear the bit and return the unique
    /// id of its owner.
    pub(crate) fn detect_trigger_hit(&mut self) -> Result<Option<i32>, RiscvError> {
        if self.hart.triggers.count() == 0 {
            return Ok(None);
        }

        let xlen = self.hart.xlen;
        let tselect = self.tselect()?;
        let mut hit = None;

        for index in 0..self.hart.triggers.count() {
            let Some(owner) = self.hart.triggers.owner(index) else {
                continue;
            };

            self.select_trigger(index)?;
            let tdata1 = self.tdata1()?;
            let mask = hit_mask(tdata1_type(tdata1, xlen), xlen);

            if tdata1 & mask != 0 {
                tracing::debug!("Trigger {} (owner {}) has its hit bit set", index, owner);
                self.set_tdata1(tdata1 & !mask)?;
                hit = Some(owner);
                break;
            }
        }

        self.select_trigger(tselect as usize)?;

        Ok(hit)
    }

    /// Disable every trigger that would halt the hart, returning what is needed
    /// to turn them back on.
    pub(crate) fn disable_triggers(&mut self) -> Result<Vec<(usize, u64)>, RiscvError> {
        let count = self.hart.triggers.count();
        if count == 0 {
            return Ok(Vec::new());
        }

        let xlen = self.hart.xlen;
        let tselect = self.tselect()?;
        let mut disabled = Vec::new();

        for index in 0..count {
            if self.hart.triggers.owner(index).is_none() {
                continue;
            }

            self.select_trigger(index)?;
            let tdata1 = self.tdata1()?;
            if tdata1 & dmode_bit(xlen) != 0 || tdata1_type(tdata1, xlen) == TriggerType::Legacy as u64 {
                self.set_tdata1(0)?;
                disabled.push((index, tdata1));
            }
        }

        self.select_trigger(tselect as usize)?;

        Ok(disabled)
    }

    /// Turn triggers disabled by [`Self::disable_triggers`] back on.
    pub(crate) fn enable_triggers(&mut self, disabled: &[(usize, u64)]) -> Result<(), RiscvError> {
        if disabled.is_empty() {
            return Ok(());
        }

        let tselect = self.tselect()?;
        for &(index, tdata1) in disabled {
            self.select_trigger(index)?;
            self.set_tdata1(tdata1)?;
        }
        self.select_trigger(tselect as usize)
    }

    fn add_manual_trigger(
        &mut self,
        kind: TriggerType,
        tdata1: u64,
        tdata2: u64,
    ) -> Result<(), RiscvError> {
        self.require_halted()?;

        let id = kind.manual_id();
        if (0..self.hart.triggers.count()).any(|index| self.hart.triggers.owner(index) == Some(id)) {
            tracing::error!("A {:?} trigger is already set, clear it first", kind);
            return Err(RiscvError::ResourceUnavailable("trigger already set"));
        }

        let index = self
            .hart
            .triggers
            .find_free(kind, false, 0)
            .ok_or(RiscvError::ResourceUnavailable("trigger"))?;

        let tselect = self.tselect()?;
        let result = self.set_trigger(index, tdata1, tdata2, 0);
        let restored = self.select_trigger(tselect as usize);
        result?;
        restored?;

        self.hart.triggers.owner[index] = Some(id);
        Ok(())
    }

    /// Set the instruction count trigger.
    pub fn set_icount(&mut self, trigger: IcountTrigger) -> Result<(), RiscvError> {
        let tdata1 = trigger.tdata1(self.hart.xlen);
        self.add_manual_trigger(TriggerType::Icount, tdata1, 0)
    }

    /// Clear the instruction count trigger.
    pub fn clear_icount(&mut self) -> Result<(), RiscvError> {
        self.remove_trigger(TriggerType::Icount.manual_id())
    }

    /// Set the interrupt trigger.
    pub fn set_itrigger(&mut self, trigger: Itrigger) -> Result<(), RiscvError> {
        let tdata1 = trigger.tdata1(self.hart.xlen);
        self.add_manual_trigger(TriggerType::Itrigger, tdata1, trigger.interrupts)
    }

    /// Clear the interrupt trigger.
    pub fn clear_itrigger(&mut self) -> Result<(), RiscvError> {
        self.remove_trigger(TriggerType::Itrigger.manual_id())
    }

    /// Set the exception trigger.
    pub fn set_etrigger(&mut self, trigger: Etrigger) -> Result<(), RiscvError> {
        let tdata1 = trigger.tdata1(self.hart.xlen);
        self.add_manual_trigger(TriggerType::Etrigger, tdata1, trigger.exceptions)
    }

    /// Clear the exception trigger.
    pub fn clear_etrigger(&mut self) -> Result<(), RiscvError> {
        self.remove_trigger(TriggerType::Etrigger.manual_id())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn state(tinfo: &[u32]) -> TriggerState {
        let mut state = TriggerState::default();
        for &tinfo in tinfo {
            state.push(tinfo);
        }
        state
    }

    fn watch(address: u64, length: u64) -> TriggerRequest {
        TriggerRequest {
            address,
            length,
            read: true,
            write: true,
            execute: false,
            unique_id: 1,
        }
    }

    #[test]
    fn free_trigger_search() {
        let mut triggers = state(&[1 << 2, 1 << 6, 1 << 6, 1 << 6]);
        triggers.owner[2] = Some(7);

        assert_eq!(triggers.find_free(TriggerType::Mcontrol6, false, 0), Some(1));
        assert_eq!(triggers.find_free(TriggerType::Mcontrol6, true, 0), None);
        assert_eq!(triggers.find_free(TriggerType::Mcontrol, true, 0), None);
        assert_eq!(triggers.find_free(TriggerType::Mcontrol, false, 1), None);

        triggers.owner[2] = None;
        assert_eq!(triggers.find_free(TriggerType::Mcontrol6, true, 0), Some(1));
        assert_eq!(triggers.find_free(TriggerType::Mcontrol6, true, 2), Some(2));
    }

    #[test]
    fn rejected_configurations_are_bounded() {
        let mut triggers = state(&[1 << 2]);

        for value in 0..(REJECTED_CAPACITY as u64 + 4) {
            triggers.reject(0, value, value);
        }

        assert!(!triggers.is_rejected(0, 0, 0));
        assert!(triggers.is_rejected(0, 5, 5));
        assert!(!triggers.is_rejected(0, 5, 6));
        assert_eq!(triggers.rejected[0].front(), Some(&(5, 5)));
        assert_eq!(triggers.rejected[0].len(), REJECTED_CAPACITY);
    }

    #[test]
    fn mcontrol6_execute_breakpoint() {
        let request = TriggerRequest {
            address: 0x8000_2000,
            length: 4,
            read: false,
            write: false,
            execute: true,
            unique_id: 3,
        };
        // RV32IMAC + S + U
        let misa = (1 << 30) | (1 << 18) | (1 << 20) | 0x1105;
        let fields = MatchFields::mcontrol6(&request, 32, misa);

        let tdata1 = fields.tdata1(MatchKind::Equal, false);
        assert_eq!(tdata1_type(tdata1, 32), 6);
        assert_eq!(tdata1 & dmode_bit(32), dmode_bit(32));
        assert_eq!(tdata1 & 0xffff, 0x1000 | MATCH_M | MATCH_S | MATCH_U | MATCH_EXECUTE);
    }

    #[test]
    fn mcontrol_ignores_maskmax() {
        let fields = MatchFields::mcontrol(&watch(0x2000, 0x40), 64, 0);
        assert_eq!(fields.ignore_mask, 0x3f << 53);

        let fields = MatchFields::mcontrol(&watch(0x2000, 0x40), 32, 0);
        assert_eq!(fields.ignore_mask, 0x3f << 21);
    }

    #[test]
    fn napot_needs_aligned_power_of_two() {
        assert!(watch(0x2000, 0x40).napot_possible());
        assert!(!watch(0x2000, 0x30).napot_possible());
        assert!(!watch(0x2010, 0x40).napot_possible());
        assert!(!watch(0x2001, 1).napot_possible());
    }

    #[test]
    fn icount_encoding() {
        let trigger = IcountTrigger {
            modes: TriggerModes {
                m: true,
                ..Default::default()
            },
            pending: false,
            count: 5,
        };

        let tdata1 = trigger.tdata1(32);
        assert_eq!(tdata1_type(tdata1, 32), 3);
        assert_eq!((tdata1 >> 10) & 0x3fff, 5);
        assert_eq!(tdata1 & (1 << 9), 1 << 9);
        assert_eq!(tdata1 & 0x3f, 1);
    }

    #[test]
    fn hit_bits() {
        assert_eq!(hit_mask(2, 32), 1 << 20);
        assert_eq!(hit_mask(6, 64), (1 << 22) | (1 << 25));
        assert_eq!(hit_mask(4, 64), 1 << 58);
        assert_eq!(hit_mask(1, 32), 0);
        assert_eq!(hit_mask(15, 32), 0);
    }

    #[test]
    fn manual_ids_are_negative_types() {
        assert_eq!(TriggerType::Icount.manual_id(), -3);
        assert_eq!(TriggerType::Etrigger.manual_id(), -5);
    }
}
