//! Memory access: picks a method per request and moves the data.
//!
//! Three methods exist. The program buffer runs loads and stores on the hart and
//! needs it halted. The system bus reads physical memory behind the hart's back.
//! Abstract access-memory commands are left to the Debug Module. They are tried
//! in the configured order, and methods that can't do an access are skipped.
//! Behind a 0.11 DTM every access is a Debug RAM program instead.

use std::time::Instant;

use crate::abstract_command::{access_register, gpr_regno, AbstractCommandErrorKind, AccessSize};
use crate::batch::{ScanBatch, DEFAULT_BATCH_CAPACITY};
use crate::config::MemoryAccessMethod;
use crate::dm::registers::{Abstractauto, Abstractcs, Command, DATA0_ADDRESS};
use crate::error::{MemoryFaultKind, RiscvError};
use crate::hart::RiscvCore;
use crate::progbuf::{S0, S1};
use crate::registers::{csr, Dcsr, Mstatus, RegisterNumber};

/// Number of autoexec `data0` accesses queued per scan batch.
const AUTOEXEC_BATCH: usize = 32;

const PAGE_SIZE: u64 = 0x1000;

/// Access sizes tried when no method can do an access of the requested size.
const FALLBACK_SIZES: [usize; 5] = [16, 8, 4, 2, 1];

fn check_arguments(size: usize, count: usize, length: usize) -> Result<AccessSize, RiscvError> {
    let access = AccessSize::from_bytes(size).ok_or(RiscvError::InvalidArgument("access size"))?;

    if count.checked_mul(size) != Some(length) {
        tracing::error!(
            "Buffer of {} bytes does not hold {} elements of {} bytes",
            length,
            count,
            size
        );
        return Err(RiscvError::InvalidArgument("buffer length"));
    }

    Ok(access)
}

/// Largest access size that divides `address` and is no larger than `size`.
fn natural_size(address: u64, size: usize) -> usize {
    size.min(1 << address.trailing_zeros().min(4))
}

impl std::fmt::Display for MemoryAccessMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Progbuf => "program buffer",
            Self::Sysbus => "system bus",
            Self::Abstract => "abstract command",
        })
    }
}

impl RiscvCore<'_> {
    /// Read `count` elements of `size` bytes from virtual address `address`.
    ///
    /// The address is translated when the hart's MMU is on and translation is
    /// configured, either by the hart itself (`enable_virtual`) or by walking the
    /// page tables (`enable_virt2phys`).
    pub fn read_memory(
        &mut self,
        address: u64,
        size: usize,
        count: usize,
        buffer: &mut [u8],
    ) -> Result<(), RiscvError> {
        check_arguments(size, count, buffer.len())?;
        if count == 0 {
            return Ok(());
        }

        if self.config.enable_virtual && self.mmu_enabled()? {
            return self.with_mprv(|core| core.read_aligned(address, size, count, buffer, true));
        }

        if self.config.enable_virt2phys && self.mmu_enabled()? {
            let (size, count) = if address % size as u64 != 0 {
                (1, count * size)
            } else {
                (size, count)
            };

            let mut offset = 0;
            for (virtual_address, length) in pages(address, buffer.len()) {
                let physical = self.virt2phys(virtual_address)?;
                self.read_phys_memory(
                    physical,
                    size,
                    length / size,
                    &mut buffer[offset..offset + length],
                )?;
                offset += length;
            }
            debug_assert_eq!(offset, count * size);
            return Ok(());
        }

        self.read_phys_memory(address, size, count, buffer)
    }

    /// Write `count` elements of `size` bytes to virtual address `address`.
    pub fn write_memory(
        &mut self,
        address: u64,
        size: usize,
        count: usize,
        buffer: &[u8],
    ) -> Result<(), RiscvError> {
        check_arguments(size, count, buffer.len())?;
        if count == 0 {
            return Ok(());
        }

        if self.config.enable_virtual && self.mmu_enabled()? {
            return self.with_mprv(|core| core.write_aligned(address, size, count, buffer, true));
        }

        if self.config.enable_virt2phys && self.mmu_enabled()? {
            let (size, count) = if address % size as u64 != 0 {
                (1, count * size)
            } else {
                (size, count)
            };

            let mut offset = 0;
            for (virtual_address, length) in pages(address, buffer.len()) {
                let physical = self.virt2phys(virtual_address)?;
                self.write_phys_memory(physical, size, length / size, &buffer[offset..offset + length])?;
                offset += length;
            }
            debug_assert_eq!(offset, count * size);
            return Ok(());
        }

        self.write_phys_memory(address, size, count, buffer)
    }

    /// Read physical memory.
    pub fn read_phys_memory(
        &mut self,
        address: u64,
        size: usize,
        count: usize,
        buffer: &mut [u8],
    ) -> Result<(), RiscvError> {
        check_arguments(size, count, buffer.len())?;
        if count == 0 {
            return Ok(());
        }
        self.read_aligned(address, size, count, buffer, false)
    }

    /// Write physical memory.
    pub fn write_phys_memory(
        &mut self,
        address: u64,
        size: usize,
        count: usize,
        buffer: &[u8],
    ) -> Result<(), RiscvError> {
        check_arguments(size, count, buffer.len())?;
        if count == 0 {
            return Ok(());
        }
        self.write_aligned(address, size, count, buffer, false)
    }

    /// Read the element of `size` bytes at physical `address` `count` times.
    ///
    /// Each read is a separate bus access, which is what FIFOs and other
    /// registers with read side effects need.
    pub fn repeat_read(
        &mut self,
        address: u64,
        size: usize,
        count: usize,
        buffer: &mut [u8],
    ) -> Result<(), RiscvError> {
        check_arguments(size, count, buffer.len())?;
        if count == 0 {
            return Ok(());
        }

        for element in buffer.chunks_exact_mut(size) {
            self.read_aligned(address, size, 1, element, false)?;
        }

        Ok(())
    }

    /// Read any number of bytes, using word accesses where the address allows.
    pub fn read_buffer(&mut self, address: u64, buffer: &mut [u8]) -> Result<(), RiscvError> {
        let (head, body, tail) = split_buffer(address, buffer.len());

        self.read_memory(address, 1, head, &mut buffer[..head])?;
        self.read_memory(address + head as u64, 4, body / 4, &mut buffer[head..head + body])?;
        self.read_memory(
            address + (head + body) as u64,
            1,
            tail,
            &mut buffer[head + body..],
        )
    }

    /// Write any number of bytes, using word accesses where the address allows.
    pub fn write_buffer(&mut self, address: u64, buffer: &[u8]) -> Result<(), RiscvError> {
        let (head, body, tail) = split_buffer(address, buffer.len());

        self.write_memory(address, 1, head, &buffer[..head])?;
        self.write_memory(address + head as u64, 4, body / 4, &buffer[head..head + body])?;
        self.write_memory(address + (head + body) as u64, 1, tail, &buffer[head + body..])
    }

    /// Run `access` with `mstatus.MPRV` set, so loads and stores from the program
    /// buffer are translated like accesses at the privilege the hart halted in.
    fn with_mprv<T>(
        &mut self,
        access: impl FnOnce(&mut Self) -> Result<T, RiscvError>,
    ) -> Result<T, RiscvError> {
        let number = RegisterNumber::csr(csr::MSTATUS);
        let original = self.read_register(number)?;
        let dcsr = Dcsr::from(self.read_register(RegisterNumber::csr(csr::DCSR))? as u32);

        let mut mstatus = Mstatus::from(original);
        mstatus.set_mprv(true);
        mstatus.set_mpp(dcsr.prv() as u64);
        self.write_register(number, u64::from(mstatus))?;

        let result = access(self);
        let restored = self.write_register(number, original);

        let value = result?;
        restored?;
        Ok(value)
    }

    fn read_aligned(
        &mut self,
        address: u64,
        size: usize,
        count: usize,
        buffer: &mut [u8],
        translated: bool,
    ) -> Result<(), RiscvError> {
        let natural = natural_size(address, size);
        if natural != size {
            tracing::debug!(
                "Reading {:#x} with {} byte accesses instead of {}",
                address,
                natural,
                size
            );
            return self.read_aligned(address, natural, count * size / natural, buffer, translated);
        }

        if self.dm.is_legacy() {
            return self.legacy_read_memory(address, size, count, buffer);
        }

        if self.read_with_method(address, size, count, buffer, translated)? {
            return Ok(());
        }

        // No method does this size. Try the others, largest first.
        for access in FALLBACK_SIZES {
            if access == size || !self.any_method_for(access, translated) {
                continue;
            }

            if access < size {
                tracing::debug!("Splitting {} byte reads into {} byte reads", size, access);
                if self.read_with_method(address, access, count * size / access, buffer, translated)? {
                    return Ok(());
                }
            } else {
                tracing::debug!("Reading {} byte elements with {} byte reads", size, access);
                return self.read_wide(address, size, count, buffer, access, translated);
            }
        }

        tracing::error!("No memory access method can read {} bytes at {:#x}", size, address);
        Err(RiscvError::Unsupported("memory access"))
    }

    fn write_aligned(
        &mut self,
        address: u64,
        size: usize,
        count: usize,
        buffer: &[u8],
        translated: bool,
    ) -> Result<(), RiscvError> {
        let natural = natural_size(address, size);
        if natural != size {
            tracing::debug!(
                "Writing {:#x} with {} byte accesses instead of {}",
                address,
                natural,
                size
            );
            return self.write_aligned(address, natural, count * size / natural, buffer, translated);
        }

        if self.dm.is_legacy() {
            return self.legacy_write_memory(address, size, count, buffer);
        }

        if self.write_with_method(address, size, count, buffer, translated)? {
            return Ok(());
        }

        for access in FALLBACK_SIZES {
            if access == size || !self.any_method_for(access, translated) {
                continue;
            }

            if access < size {
                tracing::debug!("Splitting {} byte writes into {} byte writes", size, access);
                if self.write_with_method(address, access, count * size / access, buffer, translated)? {
                    return Ok(());
                }
            } else {
                tracing::debug!("Writing {} byte elements with read-modify-write", size);
                return self.write_wide(address, size, count, buffer, access, translated);
            }
        }

        tracing::error!("No memory access method can write {} bytes at {:#x}", size, address);
        Err(RiscvError::Unsupported("memory access"))
    }

    /// Read elements with accesses of `access` bytes, larger than the elements.
    fn read_wide(
        &mut self,
        address: u64,
        size: usize,
        count: usize,
        buffer: &mut [u8],
        access: usize,
        translated: bool,
    ) -> Result<(), RiscvError> {
        let mut wide = vec![0; access];

        for index in 0..count {
            let element = address + (index * size) as u64;
            let base = element & !(access as u64 - 1);
            let offset = (element - base) as usize;

            if !self.read_with_method(base, access, 1, &mut wide, translated)? {
                return Err(RiscvError::Unsupported("memory access"));
            }
            buffer[index * size..(index + 1) * size].copy_from_slice(&wide[offset..offset + size]);
        }

        Ok(())
    }

    /// Write elements with read-modify-write accesses of `access` bytes.
    fn write_wide(
        &mut self,
        address: u64,
        size: usize,
        count: usize,
        buffer: &[u8],
        access: usize,
        translated: bool,
    ) -> Result<(), RiscvError> {
        let mut wide = vec![0; access];

        for index in 0..count {
            let element = address + (index * size) as u64;
            let base = element & !(access as u64 - 1);
            let offset = (element - base) as usize;

            if !self.read_with_method(base, access, 1, &mut wide, translated)? {
                return Err(RiscvError::Unsupported("memory access"));
            }
            wide[offset..offset + size].copy_from_slice(&buffer[index * size..(index + 1) * size]);
            if !self.write_with_method(base, access, 1, &wide, translated)? {
                return Err(RiscvError::Unsupported("memory access"));
            }
        }

        Ok(())
    }

    /// Why `method` can't do an access of `size` bytes right now.
    fn skip_reason(
        &self,
        method: MemoryAccessMethod,
        size: usize,
        translated: bool,
    ) -> Option<&'static str> {
        match method {
            MemoryAccessMethod::Progbuf => {
                if !self.has_progbuf(2) {
                    Some("the program buffer is too small")
                } else if !self.hart.status.is_halted() {
                    Some("the hart is not halted")
                } else if size * 8 > self.hart.xlen as usize {
                    Some("the access is wider than the registers")
                } else {
                    None
                }
            }
            MemoryAccessMethod::Sysbus => {
                if translated {
                    Some("the system bus can't do virtual accesses")
                } else if self.dm.state.sbcs.sbversion() == 0 {
                    Some("the debug module has no system bus access")
                } else if !self.dm.sba_supports(size) {
                    Some("the system bus does not support the access size")
                } else {
                    None
                }
            }
            MemoryAccessMethod::Abstract => {
                if translated {
                    Some("abstract commands don't do virtual accesses here")
                } else if !self.hart.caps.memory {
                    Some("abstract memory access is not supported")
                } else {
                    None
                }
            }
        }
    }

    fn any_method_for(&self, size: usize, translated: bool) -> bool {
        self.config
            .memory_access_order()
            .into_iter()
            .any(|method| self.skip_reason(method, size, translated).is_none())
    }

    fn note_skipped(&mut self, method: MemoryAccessMethod, reason: &str) {
        let warned = &mut self.hart.warnings.method_skipped[method.index()];
        if !*warned {
            *warned = true;
            tracing::warn!("Skipping {} for memory access: {}", method, reason);
        }
    }

    fn note_chosen(&mut self, method: MemoryAccessMethod) {
        let warned = &mut self.hart.warnings.method_chosen[method.index()];
        if !*warned {
            *warned = true;
            tracing::warn!("Using {} for memory access", method);
        }
    }

    /// Read with the first capable method. `Ok(false)` if none is capable.
    fn read_with_method(
        &mut self,
        address: u64,
        size: usize,
        count: usize,
        buffer: &mut [u8],
        translated: bool,
    ) -> Result<bool, RiscvError> {
        let access = check_arguments(size, count, buffer.len())?;

        for method in self.config.memory_access_order() {
            if let Some(reason) = self.skip_reason(method, size, translated) {
                self.note_skipped(method, reason);
                continue;
            }
            self.note_chosen(method);

            let result = match method {
                MemoryAccessMethod::Progbuf => self.progbuf_read(address, access, count, buffer),
                MemoryAccessMethod::Sysbus => self.dm.sba_read(address, access, count, buffer),
                MemoryAccessMethod::Abstract => self.abstract_read(address, access, count, buffer),
            };

            match result {
                Err(RiscvError::AbstractCommand(AbstractCommandErrorKind::NotSupported))
                    if method == MemoryAccessMethod::Abstract =>
                {
                    self.hart.caps.memory = false;
                    self.note_skipped(method, "abstract memory access is not supported");
                }
                result => return result.map(|()| true),
            }
        }

        Ok(false)
    }

    /// Write with the first capable method. `Ok(false)` if none is capable.
    fn write_with_method(
        &mut self,
        address: u64,
        size: usize,
        count: usize,
        buffer: &[u8],
        translated: bool,
    ) -> Result<bool, RiscvError> {
        let access = check_arguments(size, count, buffer.len())?;

        for method in self.config.memory_access_order() {
            if let Some(reason) = self.skip_reason(method, size, translated) {
                self.note_skipped(method, reason);
                continue;
            }
            self.note_chosen(method);

            let result = match method {
                MemoryAccessMethod::Progbuf => self.progbuf_write(address, access, count, buffer),
                MemoryAccessMethod::Sysbus => self.dm.sba_write(address, access, count, buffer),
                MemoryAccessMethod::Abstract => self.abstract_write(address, access, count, buffer),
            };

            match result {
                Err(RiscvError::AbstractCommand(AbstractCommandErrorKind::NotSupported))
                    if method == MemoryAccessMethod::Abstract =>
                {
                    self.hart.caps.memory = false;
                    self.note_skipped(method, "abstract memory access is not supported");
                }
                result => return result.map(|()| true),
            }
        }

        Ok(false)
    }

    fn abstract_read(
        &mut self,
        address: u64,
        size: AccessSize,
        count: usize,
        buffer: &mut [u8],
    ) -> Result<(), RiscvError> {
        let bytes = size.bytes();
        let xlen = self.hart.xlen;

        for (index, element) in buffer.chunks_exact_mut(bytes).enumerate().take(count) {
            let element_address = address + (index * bytes) as u64;
            let value = self
                .dm
                .abstract_read_memory(element_address, size, xlen)
                .map_err(|error| memory_fault(error, element_address))?;
            element.copy_from_slice(&value.to_le_bytes()[..bytes]);
        }

        Ok(())
    }

    fn abstract_write(
        &mut self,
        address: u64,
        size: AccessSize,
        count: usize,
        buffer: &[u8],
    ) -> Result<(), RiscvError> {
        let bytes = size.bytes();
        let xlen = self.hart.xlen;

        for (index, element) in buffer.chunks_exact(bytes).enumerate().take(count) {
            let element_address = address + (index * bytes) as u64;
            self.dm
                .abstract_write_memory(element_address, size, element_value(element), xlen)
                .map_err(|error| memory_fault(error, element_address))?;
        }

        Ok(())
    }

    fn set_autoexec_data0(&mut self, enabled: bool) -> Result<(), RiscvError> {
        let mut autoexec = Abstractauto::default();
        autoexec.set_autoexecdata(enabled as u32);
        self.dm.write_dm_register(autoexec)
    }

    /// Read `count` elements with a load/increment loop in the program buffer.
    fn progbuf_read(
        &mut self,
        address: u64,
        size: AccessSize,
        count: usize,
        buffer: &mut [u8],
    ) -> Result<(), RiscvError> {
        let bytes = size.bytes();

        self.execute_fence()?;

        let mut program = self.new_program();
        program.load(bytes, S1, S0, 0)?;
        program.addi(S0, S0, bytes as i16)?;
        self.load_program(&program)?;

        let start = Instant::now();
        let mut next = 0;

        while next < count {
            match self.progbuf_read_from(address, size, next, count, buffer) {
                Ok(reached) if reached >= count => break,
                Ok(reached) => {
                    if start.elapsed() > self.dm.timeout() {
                        tracing::error!("Reading memory at {:#x} kept running into busy", address);
                        return Err(RiscvError::Timeout);
                    }
                    next = reached;
                }
                Err(RiscvError::AbstractCommand(error)) => {
                    tracing::debug!(
                        "Bulk read at {:#x} failed ({}), reading element by element",
                        address,
                        error
                    );
                    return self.progbuf_read_single(address, size, next, count, buffer);
                }
                Err(error) => return Err(error),
            }
        }

        Ok(())
    }

    /// One attempt at reading elements `first..count`.
    ///
    /// Returns the element to continue at, which is `count` once everything was read.
    fn progbuf_read_from(
        &mut self,
        address: u64,
        size: AccessSize,
        first: usize,
        count: usize,
        buffer: &mut [u8],
    ) -> Result<usize, RiscvError> {
        let bytes = size.bytes();
        let register_size = self.register_size();
        let base = address + (first * bytes) as u64;
        let remaining = count - first;

        self.touch();

        // Loads element `first` into s1 and advances s0.
        self.dm
            .abstract_write_register(gpr_regno(S0), register_size, base as u128, true)?;

        if remaining == 1 {
            let value = self.dm.abstract_read_register(gpr_regno(S1), register_size)?;
            store_element(buffer, first, bytes, value);
            return Ok(count);
        }

        // data0 <- element `first`, then s1 <- the next one.
        let command = access_register(gpr_regno(S1), register_size, true, false, true);
        self.dm.execute_abstract_command(Command::from(command).0)?;

        self.set_autoexec_data0(true)?;

        // Every read of data0 returns one element and loads the one after the next.
        let autoexec_reads = remaining - 2;
        let wide = register_size.data_words() > 1 && bytes > 4;
        let mut index = first;

        while index < first + autoexec_reads {
            let end = (index + AUTOEXEC_BATCH).min(first + autoexec_reads);

            let mut batch = ScanBatch::new(DEFAULT_BATCH_CAPACITY);
            let keys: Vec<_> = (index..end)
                .map(|_| {
                    let high = wide.then(|| batch.add_read(DATA0_ADDRESS as u32 + 1));
                    let low = batch.add_read_exec(DATA0_ADDRESS as u32);
                    (low, high)
                })
                .collect();
            batch.run(&mut self.dm.dtm)?;

            let status = self.dm.wait_for_abstract_idle(Instant::now())?;
            match AbstractCommandErrorKind::parse(status.cmderr()) {
                AbstractCommandErrorKind::None => {}
                AbstractCommandErrorKind::Busy => {
                    let restart = self.recover_busy_read(base, bytes, first)?;
                    // Keep what was read before the restart point.
                    for (offset, (low, high)) in keys.into_iter().enumerate() {
                        if index + offset >= restart {
                            break;
                        }
                        store_element(buffer, index + offset, bytes, batch_value(&batch, low, high)?);
                    }
                    return Ok(restart.max(first));
                }
                error => {
                    self.dm.clear_cmderr()?;
                    self.set_autoexec_data0(false)?;
                    return Err(RiscvError::AbstractCommand(error));
                }
            }

            for (offset, (low, high)) in keys.into_iter().enumerate() {
                store_element(buffer, index + offset, bytes, batch_value(&batch, low, high)?);
            }

            index = end;
        }

        self.set_autoexec_data0(false)?;

        let value = self.dm.read_abstract_data(register_size)?;
        store_element(buffer, count - 2, bytes, value);

        let value = self.dm.abstract_read_register(gpr_regno(S1), register_size)?;
        store_element(buffer, count - 1, bytes, value);

        Ok(count)
    }

    /// Clean up after a busy autoexec read, returning the element to restart at.
    fn recover_busy_read(&mut self, base: u64, bytes: usize, first: usize) -> Result<usize, RiscvError> {
        self.dm.clear_cmderr()?;
        self.set_autoexec_data0(false)?;
        self.dm.dtm.increase_ac_busy_delay();

        let s0 = self
            .dm
            .abstract_read_register(gpr_regno(S0), self.register_size())? as u64;

        // Elements two behind the next load made it to data0 and were read.
        let loaded = (s0.wrapping_sub(base) / bytes as u64) as usize;
        let restart = first + loaded.saturating_sub(2);

        tracing::info!(
            "Memory read ran into busy, restarting at element {} (ac_busy_delay={})",
            restart,
            self.dm.dtm.state.ac_busy_delay
        );

        Ok(restart)
    }

    /// Read one element at a time. Elements that fail are zero-filled, and the
    /// read only fails if no element could be read.
    fn progbuf_read_single(
        &mut self,
        address: u64,
        size: AccessSize,
        first: usize,
        count: usize,
        buffer: &mut [u8],
    ) -> Result<(), RiscvError> {
        let bytes = size.bytes();
        let register_size = self.register_size();
        let mut failed = None;
        let mut any_read = false;

        self.set_autoexec_data0(false)?;

        for index in first..count {
            let element_address = address + (index * bytes) as u64;

            let result = self
                .dm
                .abstract_write_register(gpr_regno(S0), register_size, element_address as u128, true)
                .and_then(|()| self.dm.abstract_read_register(gpr_regno(S1), register_size));

            match result {
                Ok(value) => {
                    store_element(buffer, index, bytes, value);
                    any_read = true;
                }
                Err(RiscvError::AbstractCommand(_)) => {
                    tracing::debug!("Failed to read memory at {:#x}", element_address);
                    buffer[index * bytes..(index + 1) * bytes].fill(0);
                    failed.get_or_insert(element_address);
                }
                Err(error) => return Err(error),
            }
        }

        match failed {
            Some(address) if !any_read => Err(RiscvError::MemoryFault {
                address,
                kind: MemoryFaultKind::DataAbort,
            }),
            Some(address) => {
                tracing::warn!("Some memory could not be read, starting at {:#x}; returning zeros", address);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Write `count` elements with a store/increment loop in the program buffer.
    fn progbuf_write(
        &mut self,
        address: u64,
        size: AccessSize,
        count: usize,
        buffer: &[u8],
    ) -> Result<(), RiscvError> {
        let bytes = size.bytes();

        let mut program = self.new_program();
        program.store(bytes, S1, S0, 0)?;
        program.addi(S0, S0, bytes as i16)?;
        self.load_program(&program)?;
        // The store reads s1, so the program doesn't count it as clobbered.
        self.save_register(RegisterNumber::S1)?;

        let start = Instant::now();
        let mut next = 0;

        while next < count {
            next = self.progbuf_write_from(address, size, next, count, buffer)?;

            if next < count && start.elapsed() > self.dm.timeout() {
                tracing::error!("Writing memory at {:#x} kept running into busy", address);
                return Err(RiscvError::Timeout);
            }
        }

        self.execute_fence()
    }

    fn progbuf_write_from(
        &mut self,
        address: u64,
        size: AccessSize,
        first: usize,
        count: usize,
        buffer: &[u8],
    ) -> Result<usize, RiscvError> {
        let bytes = size.bytes();
        let register_size = self.register_size();
        let base = address + (first * bytes) as u64;
        let element = |index: usize| element_value(&buffer[index * bytes..(index + 1) * bytes]);

        self.touch();

        let result = self
            .dm
            .abstract_write_register(gpr_regno(S0), register_size, base as u128, false)
            .and_then(|()| {
                self.dm
                    .abstract_write_register(gpr_regno(S1), register_size, element(first), true)
            });
        if let Err(error) = result {
            return Err(memory_fault(error, base));
        }

        if first + 1 == count {
            return Ok(count);
        }

        // s1 <- data0, then store it.
        let result = self
            .dm
            .abstract_write_register(gpr_regno(S1), register_size, element(first + 1), true);
        if let Err(error) = result {
            return Err(memory_fault(error, base + bytes as u64));
        }

        self.set_autoexec_data0(true)?;

        let wide = register_size.data_words() > 1 && bytes > 4;
        let mut index = first + 2;

        while index < count {
            let end = (index + AUTOEXEC_BATCH).min(count);

            let mut batch = ScanBatch::new(DEFAULT_BATCH_CAPACITY);
            for i in index..end {
                let value = element(i);
                // data0 goes last, writing it runs the command.
                if wide {
                    batch.add_write(DATA0_ADDRESS as u32 + 1, (value >> 32) as u32);
                }
                batch.add_write_exec(DATA0_ADDRESS as u32, value as u32);
            }
            batch.run(&mut self.dm.dtm)?;

            let status: Abstractcs = self.dm.wait_for_abstract_idle(Instant::now())?;
            match AbstractCommandErrorKind::parse(status.cmderr()) {
                AbstractCommandErrorKind::None => index = end,
                AbstractCommandErrorKind::Busy => {
                    self.dm.clear_cmderr()?;
                    self.set_autoexec_data0(false)?;
                    self.dm.dtm.increase_ac_busy_delay();

                    let s0 = self.dm.abstract_read_register(gpr_regno(S0), register_size)? as u64;
                    let written = (s0.wrapping_sub(base) / bytes as u64) as usize;

                    tracing::info!(
                        "Memory write ran into busy, restarting at element {} (ac_busy_delay={})",
                        first + written,
                        self.dm.dtm.state.ac_busy_delay
                    );
                    return Ok((first + written).min(count));
                }
                error => {
                    self.dm.clear_cmderr()?;
                    self.set_autoexec_data0(false)?;

                    let s0 = self.dm.abstract_read_register(gpr_regno(S0), register_size)? as u64;
                    tracing::error!("Memory write failed at {:#x}: {}", s0, error);
                    return Err(RiscvError::MemoryFault {
                        address: s0,
                        kind: MemoryFaultKind::DataAbort,
                    });
                }
            }
        }

        self.set_autoexec_data0(false)?;

        Ok(count)
    }
}

/// Split `[address, address + length)` at page boundaries.
fn pages(address: u64, length: usize) -> impl Iterator<Item = (u64, usize)> {
    let end = address + length as u64;
    let mut current = address;

    std::iter::from_fn(move || {
        if current >= end {
            return None;
        }
        let page_end = (current | (PAGE_SIZE - 1)).saturating_add(1);
        let chunk = page_end.min(end) - current;
        let item = (current, chunk as usize);
        current += chunk;
        Some(item)
    })
}

/// Bytes before the first word boundary, whole words, and the rest.
fn split_buffer(address: u64, length: usize) -> (usize, usize, usize) {
    let head = ((4 - (address % 4) as usize) % 4).min(length);
    let body = (length - head) & !3;
    let tail = length - head - body;
    (head, body, tail)
}

fn element_value(bytes: &[u8]) -> u128 {
    let mut value = [0u8; 16];
    value[..bytes.len()].copy_from_slice(bytes);
    u128::from_le_bytes(value)
}

fn store_element(buffer: &mut [u8], index: usize, bytes: usize, value: u128) {
    buffer[index * bytes..(index + 1) * bytes].copy_from_slice(&value.to_le_bytes()[..bytes]);
}

fn batch_value(
    batch: &ScanBatch,
    low: crate::batch::BatchKey,
    high: Option<crate::batch::BatchKey>,
) -> Result<u128, RiscvError> {
    let mut value = batch.get(low)? as u128;
    if let Some(high) = high {
        value |= (batch.get(high)? as u128) << 32;
    }
    Ok(value)
}

/// Report a failed load or store as a memory fault at `address`.
pub(crate) fn memory_fault(error: RiscvError, address: u64) -> RiscvError {
    match error {
        RiscvError::AbstractCommand(
            AbstractCommandErrorKind::Exception | AbstractCommandErrorKind::Bus,
        ) => RiscvError::MemoryFault {
            address,
            kind: MemoryFaultKind::DataAbort,
        },
        error => error,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_case::test_case;

    #[test_case(0x1000, 4, 4; "aligned")]
    #[test_case(0x1001, 4, 1; "odd")]
    #[test_case(0x1002, 8, 2; "halfword aligned")]
    #[test_case(0x0, 16, 16; "zero")]
    #[test_case(0x1008, 16, 8; "doubleword aligned")]
    fn natural_access_size(address: u64, size: usize, expected: usize) {
        assert_eq!(natural_size(address, size), expected);
    }

    #[test]
    fn page_split() {
        let chunks: Vec<_> = pages(0xffc, 0x1008).collect();
        assert_eq!(chunks, vec![(0xffc, 4), (0x1000, 0x1000), (0x2000, 4)]);
    }

    #[test_case(0x1000, 10, (0, 8, 2))]
    #[test_case(0x1001, 10, (3, 4, 3))]
    #[test_case(0x1003, 1, (1, 0, 0))]
    #[test_case(0x1002, 1, (1, 0, 0))]
    fn buffer_split(address: u64, length: usize, expected: (usize, usize, usize)) {
        assert_eq!(split_buffer(address, length), expected);
    }

    #[test]
    fn length_must_match() {
        assert!(matches!(
            check_arguments(4, 3, 8),
            Err(RiscvError::InvalidArgument(_))
        ));
        assert!(matches!(
            check_arguments(3, 1, 3),
            Err(RiscvError::InvalidArgument(_))
        ));
        assert_eq!(check_arguments(2, 4, 8).ok(), Some(AccessSize::U16));
    }
}
