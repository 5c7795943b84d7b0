//! System bus access through the Debug Module's bus master.
//!
//! The bus master works without involving any hart, so these accesses reach
//! physical memory and work while harts run.

use std::time::Instant;

use crate::abstract_command::AccessSize;
use crate::batch::{ScanBatch, DEFAULT_BATCH_CAPACITY};
use crate::dm::registers::{
    DebugRegister, Sbaddress0, Sbaddress1, Sbcs, Sbdata0, Sbdata1, Sbdata2, Sbdata3,
};
use crate::dm::DebugModule;
use crate::dtm::grow_delay;
use crate::error::{MemoryFaultKind, RiscvError};

const SBDATA: [u8; 4] = [
    Sbdata0::ADDRESS,
    Sbdata1::ADDRESS,
    Sbdata2::ADDRESS,
    Sbdata3::ADDRESS,
];

/// Outcome of one pass over the remaining elements.
enum Pass {
    Done,
    /// Elements before `index` were transferred; retry from there.
    RetryFrom(usize),
}

impl DebugModule<'_> {
    /// Whether the bus master can do accesses of `size` bytes.
    pub fn sba_supports(&self, size: usize) -> bool {
        self.state.sbcs.sbversion() != 0 && self.state.sbcs.supports_size(size)
    }

    fn sba_address_width(&self) -> u32 {
        self.state.sbcs.sbasize()
    }

    fn write_sb_address(&mut self, batch: &mut ScanBatch, address: u64) {
        if self.sba_address_width() > 32 {
            batch.add_write(Sbaddress1::ADDRESS as u32, (address >> 32) as u32);
        }
        batch.add_write(Sbaddress0::ADDRESS as u32, address as u32);
    }

    fn read_sb_address(&mut self) -> Result<u64, RiscvError> {
        let low = self.dtm.read(Sbaddress0::ADDRESS as u32)? as u64;
        let high = if self.sba_address_width() > 32 {
            self.dtm.read(Sbaddress1::ADDRESS as u32)? as u64
        } else {
            0
        };
        Ok(high << 32 | low)
    }

    /// Wait for the bus master to go idle and return the final `sbcs`.
    fn sba_wait_idle(&mut self, start: Instant) -> Result<Sbcs, RiscvError> {
        loop {
            let sbcs: Sbcs = self.read_dm_register()?;
            if !sbcs.sbbusy() {
                return Ok(sbcs);
            }
            if start.elapsed() > self.timeout() {
                tracing::error!("The system bus stayed busy: {:?}", sbcs);
                return Err(RiscvError::Timeout);
            }
        }
    }

    /// Clear the sticky error bits of `sbcs`.
    fn sba_clear_errors(&mut self) -> Result<(), RiscvError> {
        let mut sbcs = Sbcs::from(0);
        sbcs.set_sbbusyerror(true);
        sbcs.set_sberror(0x7);
        self.write_dm_register(sbcs)
    }

    /// Look at `sbcs` after a pass and decide how to go on.
    ///
    /// `failed_before` is the element a previous error stopped at, used to detect
    /// errors that persist across a retry.
    fn sba_check(
        &mut self,
        sbcs: Sbcs,
        base: u64,
        size: usize,
        next: usize,
        failed_before: &mut Option<usize>,
    ) -> Result<Pass, RiscvError> {
        if sbcs.sbbusyerror() {
            self.sba_clear_errors()?;
            self.state.bus_master_delay = grow_delay(self.state.bus_master_delay);
            tracing::info!("System bus busy, bus_master_delay={}", self.state.bus_master_delay);
            return Ok(Pass::RetryFrom(next));
        }

        if sbcs.sberror() == 0 {
            return Ok(Pass::Done);
        }

        let address = self.read_sb_address()?;
        self.sba_clear_errors()?;

        let index = ((address.wrapping_sub(base)) / size as u64) as usize;
        let index = index.max(next);

        if *failed_before == Some(index) {
            let failed = base + (index * size) as u64;
            tracing::error!(
                "System bus access at {:#x} failed with sberror {}",
                failed,
                sbcs.sberror()
            );
            return Err(RiscvError::MemoryFault {
                address: failed,
                kind: MemoryFaultKind::Bus(sbcs.sberror() as u8),
            });
        }

        *failed_before = Some(index);
        self.state.bus_master_delay = grow_delay(self.state.bus_master_delay);
        tracing::debug!(
            "sberror {} at element {}, retrying with bus_master_delay={}",
            sbcs.sberror(),
            index,
            self.state.bus_master_delay
        );

        Ok(Pass::RetryFrom(index))
    }

    /// Read `count` elements of `size` bytes starting at `address`.
    pub fn sba_read(
        &mut self,
        address: u64,
        size: AccessSize,
        count: usize,
        buffer: &mut [u8],
    ) -> Result<(), RiscvError> {
        let bytes = size.bytes();
        let words = size.data_words();
        let start = Instant::now();
        let mut next = 0;
        let mut failed_before = None;

        while next < count {
            if start.elapsed() > self.timeout() {
                return Err(RiscvError::Timeout);
            }

            let mut sbcs = Sbcs::from(0);
            sbcs.set_sbaccess(size.encoding() as u32);
            sbcs.set_sbreadonaddr(true);
            sbcs.set_sbautoincrement(true);
            sbcs.set_sbreadondata(count - next > 1);

            let mut batch = ScanBatch::new(DEFAULT_BATCH_CAPACITY);
            batch.add_write(Sbcs::ADDRESS as u32, u32::from(sbcs));
            self.write_sb_address(&mut batch, address + (next * bytes) as u64);

            let delay = self.state.bus_master_delay;
            let mut keys = Vec::new();
            let mut index = next;
            while index < count && !batch.is_full() && batch.len() + words * 2 + 4 < DEFAULT_BATCH_CAPACITY
            {
                if index == count - 1 && count - next > 1 {
                    // Reading sbdata0 must not start another bus read.
                    let mut last = sbcs;
                    last.set_sbreadondata(false);
                    batch.add_write(Sbcs::ADDRESS as u32, u32::from(last));
                }

                let mut element = Vec::with_capacity(words);
                for word in (1..words).rev() {
                    element.push((word, batch.add_read(SBDATA[word] as u32)));
                }
                element.push((0, batch.add_read_delayed(SBDATA[0] as u32, delay)));
                keys.push((index, element));
                index += 1;
            }

            batch.run(&mut self.dtm)?;

            let status = self.sba_wait_idle(start)?;

            let done = match self.sba_check(status, address, bytes, next, &mut failed_before)? {
                Pass::Done => index,
                Pass::RetryFrom(index) => index,
            };

            for (element_index, element) in keys {
                if element_index >= done {
                    break;
                }
                let mut value = 0u128;
                for (word, key) in element {
                    value |= (batch.get(key)? as u128) << (32 * word);
                }
                let offset = element_index * bytes;
                buffer[offset..offset + bytes].copy_from_slice(&value.to_le_bytes()[..bytes]);
            }

            next = done;
        }

        Ok(())
    }

    /// Write `count` elements of `size` bytes starting at `address`.
    pub fn sba_write(
        &mut self,
        address: u64,
        size: AccessSize,
        count: usize,
        buffer: &[u8],
    ) -> Result<(), RiscvError> {
        let bytes = size.bytes();
        let words = size.data_words();
        let start = Instant::now();
        let mut next = 0;
        let mut failed_before = None;

        while next < count {
            if start.elapsed() > self.timeout() {
                return Err(RiscvError::Timeout);
            }

            let mut sbcs = Sbcs::from(0);
            sbcs.set_sbaccess(size.encoding() as u32);
            sbcs.set_sbautoincrement(true);

            let mut batch = ScanBatch::new(DEFAULT_BATCH_CAPACITY);
            batch.add_write(Sbcs::ADDRESS as u32, u32::from(sbcs));
            self.write_sb_address(&mut batch, address + (next * bytes) as u64);

            let delay = self.state.bus_master_delay;
            let mut index = next;
            while index < count && batch.len() + words + 4 < DEFAULT_BATCH_CAPACITY {
                let offset = index * bytes;
                let mut value = [0u8; 16];
                value[..bytes].copy_from_slice(&buffer[offset..offset + bytes]);
                let value = u128::from_le_bytes(value);

                // The write to sbdata0 starts the bus access.
                for word in (1..words).rev() {
                    batch.add_write(SBDATA[word] as u32, (value >> (32 * word)) as u32);
                }
                batch.add_write_delayed(SBDATA[0] as u32, value as u32, delay);
                index += 1;
            }

            batch.run(&mut self.dtm)?;

            let status = self.sba_wait_idle(start)?;

            next = match self.sba_check(status, address, bytes, next, &mut failed_before)? {
                Pass::Done => index,
                Pass::RetryFrom(index) => index,
            };
        }

        Ok(())
    }
}
