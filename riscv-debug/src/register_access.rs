//! Register access of a hart through the register cache.
//!
//! Reads are served from the cache when possible. Writes come in two flavours:
//! [`RiscvCore::set_register`] only updates the cache and leaves the hardware
//! write to the next flush, [`RiscvCore::write_register`] writes through.
//! Registers the hardware may change on its own are never cached.

use crate::abstract_command::{custom_regno, fpr_regno, gpr_regno, AbstractCommandErrorKind, AccessSize};
use crate::error::RiscvError;
use crate::hart::RiscvCore;
use crate::progbuf::{S0, S1};
use crate::registers::{
    csr, dcsr_with_priv, is_cacheable, is_fp_csr, is_vector_csr, misa_has, priv_from_dcsr, Dcsr,
    Mstatus, RegisterKind, RegisterNumber,
};

/// Flushing a register may dirty others (a saved `s0` or `mstatus`), so flushing
/// takes a few passes.
const FLUSH_PASSES: usize = 4;

impl RiscvCore<'_> {
    /// Size of an abstract access to a GPR.
    pub(crate) fn register_size(&self) -> AccessSize {
        if self.hart.xlen > 32 {
            AccessSize::U64
        } else {
            AccessSize::U32
        }
    }

    fn mask_to_xlen(&self, value: u64) -> u64 {
        if self.hart.xlen >= 64 {
            value
        } else {
            value & 0xffff_ffff
        }
    }

    /// Truncate `value` to the width of register `number`: FLEN for FPRs, XLEN
    /// for everything else.
    fn mask_to_width(&self, number: RegisterNumber, value: u64) -> u64 {
        match number.kind() {
            RegisterKind::Fpr(_) if self.has_double() => value,
            RegisterKind::Fpr(_) => value & 0xffff_ffff,
            _ => self.mask_to_xlen(value),
        }
    }

    /// Read a register, from the cache if it holds a valid value.
    ///
    /// `x0` reads as zero, `pc` is `dpc` and `priv` is decoded from `dcsr`.
    pub fn read_register(&mut self, number: RegisterNumber) -> Result<u64, RiscvError> {
        match number.kind() {
            RegisterKind::Gpr(0) => return Ok(0),
            RegisterKind::Pc => return self.read_register(RegisterNumber::csr(csr::DPC)),
            RegisterKind::Priv => {
                let dcsr = Dcsr::from(self.read_register(RegisterNumber::csr(csr::DCSR))? as u32);
                return Ok(priv_from_dcsr(dcsr));
            }
            RegisterKind::Vector(_) => {
                return Err(RiscvError::InvalidArgument(
                    "vector registers are read as bytes",
                ))
            }
            _ => {}
        }

        let entry = self
            .hart
            .registers
            .entry(number)
            .ok_or(RiscvError::UnknownRegister(number))?;
        if entry.valid {
            return Ok(entry.value_u64());
        }

        let value = self.read_register_from_hart(number)?;
        let cacheable = is_cacheable(number, false);

        if let Some(entry) = self.hart.registers.entry_mut(number) {
            entry.set_value_u64(value);
            entry.valid = cacheable;
            entry.dirty = false;
        }

        tracing::debug!("read {:?} = {:#x}", number, value);
        Ok(value)
    }

    /// Write a register and make sure it reaches the hardware right away.
    pub fn write_register(&mut self, number: RegisterNumber, value: u64) -> Result<(), RiscvError> {
        self.cache_set(number, value, true)
    }

    /// Write a register. Cacheable registers are only written on the next flush.
    pub fn set_register(&mut self, number: RegisterNumber, value: u64) -> Result<(), RiscvError> {
        self.cache_set(number, value, false)
    }

    fn cache_set(
        &mut self,
        number: RegisterNumber,
        value: u64,
        write_through: bool,
    ) -> Result<(), RiscvError> {
        match number.kind() {
            RegisterKind::Gpr(0) => return Ok(()),
            RegisterKind::Pc => {
                return self.cache_set(RegisterNumber::csr(csr::DPC), value, write_through)
            }
            RegisterKind::Priv => {
                let number = RegisterNumber::csr(csr::DCSR);
                let dcsr = Dcsr::from(self.read_register(number)? as u32);
                return self.cache_set(number, u32::from(dcsr_with_priv(dcsr, value)) as u64, true);
            }
            RegisterKind::Vector(_) => {
                return Err(RiscvError::InvalidArgument(
                    "vector registers are written as bytes",
                ))
            }
            _ => {}
        }

        let value = self.mask_to_width(number, value);
        let entry = self
            .hart
            .registers
            .entry(number)
            .ok_or(RiscvError::UnknownRegister(number))?;

        let need_to_write = !entry.valid || entry.dirty || entry.value_u64() != value;
        let cacheable = is_cacheable(number, need_to_write);

        let dirty = if !cacheable || (write_through && need_to_write) {
            self.write_register_to_hart(number, value)?;
            false
        } else {
            need_to_write
        };

        if let Some(entry) = self.hart.registers.entry_mut(number) {
            entry.set_value_u64(value);
            entry.dirty = dirty;
            entry.valid = cacheable;
        }

        tracing::debug!(
            "set {:?} = {:#x} (dirty {}, cached {})",
            number,
            value,
            dirty,
            cacheable
        );

        Ok(())
    }

    /// Read a register into the cache and mark it dirty, so the next flush restores
    /// it. Used before code on the hart overwrites the register.
    pub(crate) fn save_register(&mut self, number: RegisterNumber) -> Result<(), RiscvError> {
        self.read_register(number)?;

        if let Some(entry) = self.hart.registers.entry_mut(number) {
            if entry.valid {
                entry.dirty = true;
            }
        }

        Ok(())
    }

    /// Write every dirty register to the hardware.
    pub fn flush_registers(&mut self) -> Result<(), RiscvError> {
        for _ in 0..FLUSH_PASSES {
            let dirty = self.hart.registers.dirty_registers();
            if dirty.is_empty() {
                return Ok(());
            }

            for number in dirty {
                let Some(entry) = self.hart.registers.entry(number) else {
                    continue;
                };
                if !entry.dirty {
                    continue;
                }
                let value = entry.value_u64();

                tracing::debug!("flush {:?} = {:#x}", number, value);
                self.write_register_to_hart(number, value)?;

                if let Some(entry) = self.hart.registers.entry_mut(number) {
                    entry.dirty = false;
                }
            }
        }

        if self.hart.registers.any_dirty() {
            tracing::error!(
                "Registers still dirty after {} flush passes: {:?}",
                FLUSH_PASSES,
                self.hart.registers.dirty_registers()
            );
            return Err(RiscvError::ResourceUnavailable("register flush"));
        }

        Ok(())
    }

    /// Forget every cached register value, dirty or not.
    pub fn invalidate_registers(&mut self) {
        self.hart.registers.invalidate();
        self.hart.fpu_enabled = false;
        self.hart.vector_enabled = false;
    }

    /// Read a register from the hardware, bypassing the cache.
    pub(crate) fn read_register_from_hart(&mut self, number: RegisterNumber) -> Result<u64, RiscvError> {
        self.touch();

        let value = match number.kind() {
            RegisterKind::Gpr(n) if self.dm.is_legacy() => self.legacy_read_gpr(n)?,
            RegisterKind::Gpr(n) => {
                self.dm
                    .abstract_read_register(gpr_regno(n), self.register_size())? as u64
            }
            RegisterKind::Pc => self.read_csr_from_hart(csr::DPC)?,
            RegisterKind::Priv => {
                let dcsr = Dcsr::from(self.read_csr_from_hart(csr::DCSR)? as u32);
                priv_from_dcsr(dcsr)
            }
            RegisterKind::Fpr(n) => self.read_fpr_from_hart(n)?,
            RegisterKind::Csr(n) => self.read_csr_from_hart(n)?,
            RegisterKind::Vector(_) => {
                return Err(RiscvError::InvalidArgument(
                    "vector registers are read as bytes",
                ))
            }
            RegisterKind::Custom(_) if self.dm.is_legacy() => {
                return Err(RiscvError::Unsupported("custom registers on a 0.11 debug module"))
            }
            RegisterKind::Custom(_) => {
                let regno = self.custom_regno(number)?;
                self.dm.abstract_read_register(regno, self.register_size())? as u64
            }
        };

        Ok(value)
    }

    /// Write a register to the hardware, bypassing the cache.
    pub(crate) fn write_register_to_hart(
        &mut self,
        number: RegisterNumber,
        value: u64,
    ) -> Result<(), RiscvError> {
        self.touch();

        match number.kind() {
            RegisterKind::Gpr(0) => Ok(()),
            RegisterKind::Gpr(n) if self.dm.is_legacy() => self.legacy_write_gpr(n, value),
            RegisterKind::Gpr(n) => self.dm.abstract_write_register(
                gpr_regno(n),
                self.register_size(),
                value as u128,
                false,
            ),
            RegisterKind::Pc => self.write_csr_to_hart(csr::DPC, value),
            RegisterKind::Priv => {
                let dcsr = Dcsr::from(self.read_csr_from_hart(csr::DCSR)? as u32);
                self.write_csr_to_hart(csr::DCSR, u32::from(dcsr_with_priv(dcsr, value)) as u64)
            }
            RegisterKind::Fpr(n) => self.write_fpr_to_hart(n, value),
            RegisterKind::Csr(n) => self.write_csr_to_hart(n, value),
            RegisterKind::Vector(_) => Err(RiscvError::InvalidArgument(
                "vector registers are written as bytes",
            )),
            RegisterKind::Custom(_) if self.dm.is_legacy() => Err(RiscvError::Unsupported(
                "custom registers on a 0.11 debug module",
            )),
            RegisterKind::Custom(_) => {
                let regno = self.custom_regno(number)?;
                self.dm
                    .abstract_write_register(regno, self.register_size(), value as u128, false)
            }
        }
    }

    fn custom_regno(&self, number: RegisterNumber) -> Result<u16, RiscvError> {
        self.hart
            .registers
            .entry(number)
            .and_then(|entry| entry.custom_number)
            .map(custom_regno)
            .ok_or(RiscvError::UnknownRegister(number))
    }

    fn read_csr_from_hart(&mut self, number: u16) -> Result<u64, RiscvError> {
        if is_fp_csr(number) {
            self.enable_fpu()?;
        }
        if is_vector_csr(number) {
            self.enable_vector_unit()?;
        }

        if self.dm.is_legacy() {
            return self.legacy_read_csr(number);
        }

        let size = self.register_size();

        if self.hart.caps.read_csr {
            match self.dm.abstract_read_register(number, size) {
                Ok(value) => return Ok(value as u64),
                Err(RiscvError::AbstractCommand(AbstractCommandErrorKind::NotSupported)) => {
                    tracing::debug!("Abstract CSR reads are not supported");
                    self.hart.caps.read_csr = false;
                }
                Err(error) if self.has_progbuf(1) => {
                    tracing::debug!("Abstract read of CSR {:#x} failed: {}", number, error);
                }
                Err(error) => return Err(error),
            }
        }

        let mut program = self.new_program();
        program.csrr(S0, number)?;
        self.run_program(&program)?;

        Ok(self.dm.abstract_read_register(gpr_regno(S0), size)? as u64)
    }

    fn write_csr_to_hart(&mut self, number: u16, value: u64) -> Result<(), RiscvError> {
        if is_fp_csr(number) {
            self.enable_fpu()?;
        }
        if is_vector_csr(number) {
            self.enable_vector_unit()?;
        }

        let size = self.register_size();
        let mut written = false;

        if self.dm.is_legacy() {
            self.legacy_write_csr(number, value)?;
            written = true;
        } else if self.hart.caps.write_csr {
            match self.dm.abstract_write_register(number, size, value as u128, false) {
                Ok(()) => written = true,
                Err(RiscvError::AbstractCommand(AbstractCommandErrorKind::NotSupported)) => {
                    tracing::debug!("Abstract CSR writes are not supported");
                    self.hart.caps.write_csr = false;
                }
                Err(error) if self.has_progbuf(1) => {
                    tracing::debug!("Abstract write of CSR {:#x} failed: {}", number, error);
                }
                Err(error) => return Err(error),
            }
        }

        if !written {
            self.save_register(RegisterNumber::S0)?;

            let mut program = self.new_program();
            program.csrw(number, S0)?;
            self.load_program(&program)?;
            self.dm
                .abstract_write_register(gpr_regno(S0), size, value as u128, true)?;
        }

        if number == csr::MSTATUS {
            self.hart.fpu_enabled = false;
            self.hart.vector_enabled = false;
        }

        Ok(())
    }

    /// Set `mstatus.FS` behind the cache. The cached `mstatus` is marked dirty,
    /// so the next flush restores the original value.
    fn enable_fpu(&mut self) -> Result<(), RiscvError> {
        if self.hart.fpu_enabled {
            return Ok(());
        }

        let number = RegisterNumber::csr(csr::MSTATUS);
        let mut mstatus = Mstatus::from(self.read_register(number)?);
        if mstatus.fs() == 0 {
            self.save_register(number)?;
            mstatus.set_fs(1);
            self.write_csr_to_hart(csr::MSTATUS, u64::from(mstatus))?;
        }

        self.hart.fpu_enabled = true;
        Ok(())
    }

    /// Set `mstatus.VS` behind the cache, like [`RiscvCore::enable_fpu`].
    fn enable_vector_unit(&mut self) -> Result<(), RiscvError> {
        if self.hart.vector_enabled {
            return Ok(());
        }

        let number = RegisterNumber::csr(csr::MSTATUS);
        let mut mstatus = Mstatus::from(self.read_register(number)?);
        if mstatus.vs() == 0 {
            self.save_register(number)?;
            mstatus.set_vs(1);
            self.write_csr_to_hart(csr::MSTATUS, u64::from(mstatus))?;
        }

        self.hart.vector_enabled = true;
        Ok(())
    }

    fn has_double(&self) -> bool {
        misa_has(self.hart.misa, 'D')
    }

    fn fpr_size(&self) -> AccessSize {
        if self.has_double() {
            AccessSize::U64
        } else {
            AccessSize::U32
        }
    }

    fn read_fpr_from_hart(&mut self, n: u8) -> Result<u64, RiscvError> {
        if self.dm.is_legacy() {
            self.enable_fpu()?;
            return self.legacy_read_fpr(n, self.has_double());
        }

        let size = self.fpr_size();

        if self.hart.caps.read_fpr {
            match self.dm.abstract_read_register(fpr_regno(n), size) {
                Ok(value) => return Ok(value as u64),
                Err(RiscvError::AbstractCommand(AbstractCommandErrorKind::NotSupported)) => {
                    tracing::debug!("Abstract FPR reads are not supported");
                    self.hart.caps.read_fpr = false;
                }
                Err(error) if self.has_progbuf(1) => {
                    tracing::debug!("Abstract read of f{} failed: {}", n, error);
                }
                Err(error) => return Err(error),
            }
        }

        self.enable_fpu()?;

        let double = self.has_double();
        if double && self.hart.xlen < 64 {
            return self.read_double_through_scratch(n);
        }

        let mut program = self.new_program();
        program.fmv_x_f(double, S0, n)?;
        self.run_program(&program)?;

        Ok(self
            .dm
            .abstract_read_register(gpr_regno(S0), self.register_size())? as u64)
    }

    fn write_fpr_to_hart(&mut self, n: u8, value: u64) -> Result<(), RiscvError> {
        if self.dm.is_legacy() {
            self.enable_fpu()?;
            return self.legacy_write_fpr(n, value, self.has_double());
        }

        let size = self.fpr_size();

        if self.hart.caps.write_fpr {
            match self
                .dm
                .abstract_write_register(fpr_regno(n), size, value as u128, false)
            {
                Ok(()) => return Ok(()),
                Err(RiscvError::AbstractCommand(AbstractCommandErrorKind::NotSupported)) => {
                    tracing::debug!("Abstract FPR writes are not supported");
                    self.hart.caps.write_fpr = false;
                }
                Err(error) if self.has_progbuf(1) => {
                    tracing::debug!("Abstract write of f{} failed: {}", n, error);
                }
                Err(error) => return Err(error),
            }
        }

        self.enable_fpu()?;

        let double = self.has_double();
        if double && self.hart.xlen < 64 {
            return self.write_double_through_scratch(n, value);
        }

        self.save_register(RegisterNumber::S0)?;

        let mut program = self.new_program();
        program.fmv_f_x(double, n, S0)?;
        self.load_program(&program)?;
        self.dm
            .abstract_write_register(gpr_regno(S0), self.register_size(), value as u128, true)
    }

    /// RV32 with D: `fsd` into scratch memory and read the scratch.
    fn read_double_through_scratch(&mut self, n: u8) -> Result<u64, RiscvError> {
        let mut program = self.new_program();
        program.store_fp(true, n, S0)?;

        let scratch = self.reserve_scratch(program.len())?;
        let result = self.save_register(RegisterNumber::S0).and_then(|()| {
            self.load_program(&program)?;
            self.dm.abstract_write_register(
                gpr_regno(S0),
                AccessSize::U32,
                scratch.address() as u128,
                true,
            )?;
            self.scratch_read64(scratch)
        });
        self.release_scratch(scratch);

        result
    }

    /// RV32 with D: write the scratch and `fld` from it.
    fn write_double_through_scratch(&mut self, n: u8, value: u64) -> Result<(), RiscvError> {
        let mut program = self.new_program();
        program.load_fp(true, n, S0)?;

        let scratch = self.reserve_scratch(program.len())?;
        let result = self.save_register(RegisterNumber::S0).and_then(|()| {
            self.scratch_write64(scratch, value)?;
            self.load_program(&program)?;
            self.dm.abstract_write_register(
                gpr_regno(S0),
                AccessSize::U32,
                scratch.address() as u128,
                true,
            )
        });
        self.release_scratch(scratch);

        result
    }

    /// Element width and count used to move a vector register through `s0`.
    fn vector_layout(&self) -> (usize, usize) {
        let vlenb = self.hart.vlenb as usize;
        let element = if self.hart.xlen >= 64 && vlenb % 8 == 0 {
            8
        } else {
            4
        };
        (element, vlenb / element)
    }

    /// Configure `vtype`/`vl` so that every element of a register is reachable
    /// through `s0`. Returns the previous `vtype` and `vl`.
    fn prepare_vector_access(&mut self) -> Result<(u64, u64), RiscvError> {
        if self.hart.vlenb == 0 || self.dm.is_legacy() {
            return Err(RiscvError::Unsupported("vector registers"));
        }

        self.enable_vector_unit()?;

        let vtype = self.read_register(RegisterNumber::csr(csr::VTYPE))?;
        let vl = self.read_register(RegisterNumber::csr(csr::VL))?;

        let (element, count) = self.vector_layout();
        let vsew: u64 = if element == 8 { 3 } else { 2 };
        self.set_vector_config(vsew << 3, count as u64)?;

        Ok((vtype, vl))
    }

    fn set_vector_config(&mut self, vtype: u64, vl: u64) -> Result<(), RiscvError> {
        self.save_register(RegisterNumber::S0)?;
        self.save_register(RegisterNumber::S1)?;

        let size = self.register_size();
        self.dm
            .abstract_write_register(gpr_regno(S1), size, vtype as u128, false)?;

        let mut program = self.new_program();
        program.vsetvl(0, S0, S1)?;
        self.load_program(&program)?;
        self.dm
            .abstract_write_register(gpr_regno(S0), size, vl as u128, true)
    }

    /// Read vector register `v<n>` as little endian bytes.
    pub fn read_vector_register(&mut self, n: u8) -> Result<Vec<u8>, RiscvError> {
        let number = RegisterNumber::vector(n);
        if let Some(entry) = self.hart.registers.entry(number) {
            if entry.valid {
                return Ok(entry.value.clone());
            }
        }

        let (vtype, vl) = self.prepare_vector_access()?;
        let (element, count) = self.vector_layout();
        let size = self.register_size();

        let mut program = self.new_program();
        program.vmv_x_s(S0, n)?;
        program.vslide1down(n, n, S0)?;

        let mut bytes = Vec::with_capacity(element * count);
        let result: Result<(), RiscvError> = (|| {
            self.load_program(&program)?;
            // Sliding down `count` times rotates the register back into place.
            for _ in 0..count {
                self.dm.execute_progbuf()?;
                let value = self.dm.abstract_read_register(gpr_regno(S0), size)? as u64;
                bytes.extend_from_slice(&value.to_le_bytes()[..element]);
            }
            Ok(())
        })();

        self.set_vector_config(vtype, vl)?;
        result?;

        if let Some(entry) = self.hart.registers.entry_mut(number) {
            entry.value.clone_from(&bytes);
            entry.valid = true;
            entry.dirty = false;
        }

        Ok(bytes)
    }

    /// Write vector register `v<n>` from little endian bytes.
    pub fn write_vector_register(&mut self, n: u8, value: &[u8]) -> Result<(), RiscvError> {
        let number = RegisterNumber::vector(n);
        let (element, count) = self.vector_layout();
        if value.len() != element * count {
            return Err(RiscvError::InvalidArgument(
                "value does not match the vector register length",
            ));
        }

        let (vtype, vl) = self.prepare_vector_access()?;
        let size = self.register_size();

        let mut program = self.new_program();
        program.vslide1down(n, n, S0)?;

        let result: Result<(), RiscvError> = (|| {
            self.load_program(&program)?;
            for chunk in value.chunks(element) {
                let mut word = [0u8; 8];
                word[..element].copy_from_slice(chunk);
                self.dm.abstract_write_register(
                    gpr_regno(S0),
                    size,
                    u64::from_le_bytes(word) as u128,
                    true,
                )?;
            }
            Ok(())
        })();

        self.set_vector_config(vtype, vl)?;
        result?;

        if let Some(entry) = self.hart.registers.entry_mut(number) {
            entry.value = value.to_vec();
            entry.valid = true;
            entry.dirty = false;
        }

        Ok(())
    }
}
