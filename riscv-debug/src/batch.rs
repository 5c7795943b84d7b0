//! Batches of DMI operations executed with a single transport flush.

use std::time::Instant;

use crate::dtm::{DmiOperation, DmiOperationStatus, DmiResponse, Dtm};
use crate::error::RiscvError;

/// Default number of DMI operations in a batch.
pub const DEFAULT_BATCH_CAPACITY: usize = 128;

/// Handle to the result of a read queued in a [`ScanBatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchKey(usize);

#[derive(Debug, Clone, Copy)]
struct BatchOp {
    op: DmiOperation,
    exec: bool,
    /// Idle cycles on top of the DTM delays.
    extra_idle: u32,
}

/// A list of DMI operations.
///
/// The capture of every scan holds the response to the previous operation, so a
/// read is followed by a NOP and its key points to that NOP.
#[derive(Debug)]
pub struct ScanBatch {
    ops: Vec<BatchOp>,
    capacity: usize,
    responses: Vec<Option<DmiResponse>>,
}

impl ScanBatch {
    /// Create a batch holding at most `capacity` operations.
    pub fn new(capacity: usize) -> Self {
        Self {
            ops: Vec::with_capacity(capacity),
            capacity,
            responses: Vec::new(),
        }
    }

    fn push(&mut self, op: DmiOperation, exec: bool) -> usize {
        self.ops.push(BatchOp {
            op,
            exec,
            extra_idle: 0,
        });
        self.ops.len() - 1
    }

    /// Queue a DM register write.
    pub fn add_write(&mut self, address: u32, value: u32) {
        self.push(DmiOperation::Write { address, value }, false);
    }

    /// Queue a DM register write that starts an abstract command.
    pub fn add_write_exec(&mut self, address: u32, value: u32) {
        self.push(DmiOperation::Write { address, value }, true);
    }

    /// Queue a DM register read.
    pub fn add_read(&mut self, address: u32) -> BatchKey {
        self.push(DmiOperation::Read { address }, false);
        BatchKey(self.push(DmiOperation::NoOp, false))
    }

    /// Queue a DM register read that starts an abstract command.
    pub fn add_read_exec(&mut self, address: u32) -> BatchKey {
        self.push(DmiOperation::Read { address }, true);
        BatchKey(self.push(DmiOperation::NoOp, false))
    }

    /// Queue a DM register write followed by `idle` additional idle cycles.
    pub fn add_write_delayed(&mut self, address: u32, value: u32, idle: u32) {
        let index = self.push(DmiOperation::Write { address, value }, false);
        self.ops[index].extra_idle = idle;
    }

    /// Queue a DM register read, with `idle` additional idle cycles after the request.
    pub fn add_read_delayed(&mut self, address: u32, idle: u32) -> BatchKey {
        let index = self.push(DmiOperation::Read { address }, false);
        self.ops[index].extra_idle = idle;
        BatchKey(self.push(DmiOperation::NoOp, false))
    }

    /// Queue a NOP.
    pub fn add_nop(&mut self) {
        self.push(DmiOperation::NoOp, false);
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Whether another read (and the final NOP) would exceed the capacity.
    pub fn is_full(&self) -> bool {
        self.ops.len() + 3 > self.capacity
    }

    /// Execute every queued operation.
    ///
    /// Busy responses reset the DMI, grow the delay and re-run the batch starting at
    /// the operation whose response was busy.
    pub fn run(&mut self, dtm: &mut Dtm<'_>) -> Result<(), RiscvError> {
        if self.ops.is_empty() {
            return Ok(());
        }

        if !matches!(self.ops.last(), Some(BatchOp { op: DmiOperation::NoOp, .. })) {
            self.add_nop();
        }

        for op in &self.ops {
            if let DmiOperation::Write { address, value } = op.op {
                dtm.note_write(address, value);
            }
        }

        self.responses = vec![None; self.ops.len()];

        let start_time = Instant::now();
        let mut start = 0;
        let mut saw_busy = false;

        while start < self.ops.len() {
            for op in &self.ops[start..] {
                let idle = dtm.state.request_idle(op.exec) + op.extra_idle;
                dtm.queue_dmi(op.op, idle);
            }

            let captures = dtm.flush()?;
            if captures.len() != self.ops.len() - start {
                return Err(RiscvError::BatchedResultNotAvailable);
            }

            let mut busy_at = None;
            for (offset, bits) in captures.iter().enumerate() {
                let index = start + offset;
                let response = dtm.decode_dmi(bits);

                if response.status == DmiOperationStatus::RequestInProgress {
                    busy_at = Some(index);
                    break;
                }

                self.responses[index] = Some(response);
            }

            match busy_at {
                Some(index) => {
                    saw_busy = true;
                    dtm.increase_dmi_busy_delay()?;

                    if start_time.elapsed() > dtm.timeout() {
                        tracing::error!("DMI stayed busy while running a batch of {}", self.len());
                        return Err(RiscvError::DmiBusy);
                    }

                    // The capture at `index` belongs to the operation before it.
                    start = index.saturating_sub(1).max(start);
                    for response in &mut self.responses[start..] {
                        *response = None;
                    }
                }
                None => break,
            }
        }

        if self
            .responses
            .iter()
            .flatten()
            .any(|response| response.status == DmiOperationStatus::OperationFailed)
        {
            dtm.clear_error_state()?;
        }

        if !saw_busy {
            settle_delays(dtm);
        }

        Ok(())
    }

    /// Response to the operation preceding `key`.
    fn response(&self, key: BatchKey) -> Result<DmiResponse, RiscvError> {
        self.responses
            .get(key.0)
            .copied()
            .flatten()
            .ok_or(RiscvError::BatchedResultNotAvailable)
    }

    /// DMI status of the read behind `key`.
    pub fn status(&self, key: BatchKey) -> Result<DmiOperationStatus, RiscvError> {
        Ok(self.response(key)?.status)
    }

    /// Data returned by the read behind `key`.
    pub fn get(&self, key: BatchKey) -> Result<u32, RiscvError> {
        let response = self.response(key)?;

        match response.status {
            DmiOperationStatus::Ok => Ok(response.data),
            _ => {
                let address = match key.0.checked_sub(1).map(|i| self.ops[i].op) {
                    Some(DmiOperation::Read { address }) => address,
                    _ => 0,
                };
                Err(RiscvError::DmiFailed { address })
            }
        }
    }

    /// Whether any operation of the last run failed.
    pub fn any_failed(&self) -> bool {
        self.responses
            .iter()
            .flatten()
            .any(|response| response.status == DmiOperationStatus::OperationFailed)
    }

    /// Forget all operations and results.
    pub fn clear(&mut self) {
        self.ops.clear();
        self.responses.clear();
    }
}

/// Count a quiet batch, and drop the delays once enough quiet batches ran.
fn settle_delays(dtm: &mut Dtm<'_>) {
    let state = &mut *dtm.state;
    let Some(wait) = state.reset_delays_wait else {
        return;
    };

    state.quiet_batches = state.quiet_batches.saturating_add(1);

    if state.quiet_batches >= wait && (state.dmi_busy_delay > 0 || state.ac_busy_delay > 0) {
        tracing::debug!(
            "resetting delays after {} quiet batches (dmi {}, ac {})",
            state.quiet_batches,
            state.dmi_busy_delay,
            state.ac_busy_delay
        );
        state.dmi_busy_delay = 0;
        state.ac_busy_delay = 0;
        state.quiet_batches = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn read_key_points_after_request() {
        let mut batch = ScanBatch::new(DEFAULT_BATCH_CAPACITY);
        batch.add_write(0x10, 1);
        let key = batch.add_read(0x11);

        assert_eq!(key, BatchKey(2));
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn capacity_leaves_room_for_read() {
        let mut batch = ScanBatch::new(5);
        batch.add_read(0x04);
        assert!(!batch.is_full());
        batch.add_nop();
        assert!(batch.is_full());
    }

    #[test]
    fn results_unavailable_before_run() {
        let mut batch = ScanBatch::new(8);
        let key = batch.add_read(0x04);

        assert!(matches!(
            batch.get(key),
            Err(RiscvError::BatchedResultNotAvailable)
        ));
    }
}
