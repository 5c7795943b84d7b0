//! Sampling memory while harts run.
//!
//! Up to [`SAMPLE_BUCKETS`] addresses are read over the system bus on every
//! poll that finds a hart running. Samples go into a byte buffer:
//!
//! - a bucket index followed by the sampled value, little endian, or
//! - a timestamp marker followed by the host time in milliseconds as 4 bytes.

use std::time::Instant;

use crate::error::RiscvError;
use crate::hart::RiscvCore;

/// Number of addresses that can be sampled.
pub const SAMPLE_BUCKETS: usize = 16;

/// Bytes the sample buffer holds.
const SAMPLE_BUFFER_SIZE: usize = 1024 * 1024;

const TIMESTAMP_BEFORE: u8 = 0x80;
const TIMESTAMP_AFTER: u8 = 0x81;

/// An address to sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleBucket {
    /// Physical address.
    pub address: u64,
    /// Bytes read per sample, 4 or 8.
    pub size: usize,
}

/// One decoded entry of the sample buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sample {
    /// Host time in milliseconds before a sampling pass.
    TimestampBefore(u32),
    /// Host time in milliseconds after a sampling pass.
    TimestampAfter(u32),
    /// A value read from a bucket's address.
    Value {
        bucket: usize,
        address: u64,
        value: u64,
    },
}

/// Sampling configuration and collected samples of one target.
#[derive(Debug)]
pub struct MemorySampler {
    enabled: bool,
    buckets: [Option<SampleBucket>; SAMPLE_BUCKETS],
    buffer: Vec<u8>,
    capacity: usize,
    epoch: Instant,
}

impl Default for MemorySampler {
    fn default() -> Self {
        Self {
            enabled: false,
            buckets: [None; SAMPLE_BUCKETS],
            buffer: Vec::new(),
            capacity: SAMPLE_BUFFER_SIZE,
            epoch: Instant::now(),
        }
    }
}

impl MemorySampler {
    /// Whether sampling runs on the next poll.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Configured buckets, by index.
    pub fn buckets(&self) -> impl Iterator<Item = (usize, SampleBucket)> + '_ {
        self.buckets
            .iter()
            .enumerate()
            .filter_map(|(index, bucket)| bucket.map(|bucket| (index, bucket)))
    }

    /// Bytes collected so far.
    pub fn raw(&self) -> &[u8] {
        &self.buffer
    }

    /// Configure bucket `index`, or clear it with `None`.
    ///
    /// Any change drops the collected samples and turns sampling on.
    pub fn configure(&mut self, index: usize, bucket: Option<SampleBucket>) -> Result<(), RiscvError> {
        if index >= SAMPLE_BUCKETS {
            tracing::error!("Max bucket number is {}", SAMPLE_BUCKETS - 1);
            return Err(RiscvError::InvalidArgument("sample bucket out of range"));
        }
        if let Some(bucket) = bucket {
            if bucket.size != 4 && bucket.size != 8 {
                tracing::error!("Only 4 and 8 byte samples are supported, not {}", bucket.size);
                return Err(RiscvError::InvalidArgument("sample size"));
            }
        }

        self.buckets[index] = bucket;
        self.buffer.clear();
        self.enabled = true;
        Ok(())
    }

    /// Drop the collected samples.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    fn timestamp(&mut self, marker: u8) {
        if self.buffer.len() + 5 < self.capacity {
            let now = self.epoch.elapsed().as_millis() as u32;
            self.buffer.push(marker);
            self.buffer.extend_from_slice(&now.to_le_bytes());
        }
    }

    /// Take one sample of every bucket with `read`, between two timestamps.
    ///
    /// Buckets that don't fit the buffer anymore are skipped. The first failed
    /// read ends the pass.
    fn sample(
        &mut self,
        mut read: impl FnMut(u64, usize, &mut [u8]) -> Result<(), RiscvError>,
    ) -> Result<(), RiscvError> {
        tracing::debug!("Sample buffer used {}/{}", self.buffer.len(), self.capacity);

        self.timestamp(TIMESTAMP_BEFORE);

        let buckets = self.buckets;
        let mut result = Ok(());
        for (index, bucket) in buckets
            .iter()
            .enumerate()
            .filter_map(|(index, bucket)| bucket.map(|bucket| (index, bucket)))
        {
            if self.buffer.len() + 1 + bucket.size >= self.capacity {
                continue;
            }

            let mut value = [0u8; 8];
            if let Err(error) = read(bucket.address, bucket.size, &mut value[..bucket.size]) {
                result = Err(error);
                break;
            }
            self.buffer.push(index as u8);
            self.buffer.extend_from_slice(&value[..bucket.size]);
        }

        self.timestamp(TIMESTAMP_AFTER);
        result
    }

    /// Decode the collected samples.
    pub fn decode(&self) -> Result<Vec<Sample>, RiscvError> {
        let mut samples = Vec::new();
        let mut rest = self.buffer.as_slice();

        while let Some((&command, tail)) = rest.split_first() {
            let size = match command {
                TIMESTAMP_BEFORE | TIMESTAMP_AFTER => 4,
                index => match self.buckets.get(index as usize).copied().flatten() {
                    Some(bucket) => bucket.size,
                    None => {
                        tracing::error!("Sample buffer holds unknown command {:#x}", command);
                        return Err(RiscvError::InvalidArgument("corrupt sample buffer"));
                    }
                },
            };

            if tail.len() < size {
                tracing::error!("Sample buffer ends in the middle of an entry");
                return Err(RiscvError::InvalidArgument("corrupt sample buffer"));
            }
            let (payload, tail) = tail.split_at(size);
            let mut bytes = [0u8; 8];
            bytes[..size].copy_from_slice(payload);
            let value = u64::from_le_bytes(bytes);

            samples.push(match command {
                TIMESTAMP_BEFORE => Sample::TimestampBefore(value as u32),
                TIMESTAMP_AFTER => Sample::TimestampAfter(value as u32),
                index => Sample::Value {
                    bucket: index as usize,
                    address: self.buckets[index as usize].map_or(0, |bucket| bucket.address),
                    value,
                },
            });
            rest = tail;
        }

        Ok(samples)
    }
}

impl RiscvCore<'_> {
    /// Take one round of samples, if sampling is on.
    ///
    /// A failed read turns sampling off.
    pub(crate) fn sample_memory(&mut self) -> Result<(), RiscvError> {
        if !self.hart.sampler.enabled {
            return Ok(());
        }

        let mut sampler = std::mem::take(&mut self.hart.sampler);
        let result = sampler.sample(|address, size, buffer| self.read_phys_memory(address, size, 1, buffer));
        self.hart.sampler = sampler;

        if let Err(error) = &result {
            tracing::info!("Turning off memory sampling because it failed: {}", error);
            self.hart.sampler.enabled = false;
        }

        result
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sampler(buckets: &[(usize, u64, usize)]) -> MemorySampler {
        let mut sampler = MemorySampler::default();
        for &(index, address, size) in buckets {
            sampler
                .configure(index, Some(SampleBucket { address, size }))
                .unwrap();
        }
        sampler
    }

    #[test]
    fn samples_between_timestamps() {
        let mut sampler = sampler(&[(0, 0x1000, 4), (3, 0x2000, 8)]);
        sampler
            .sample(|address, size, buffer| {
                buffer.copy_from_slice(&(address + 1).to_le_bytes()[..size]);
                Ok(())
            })
            .unwrap();

        let samples = sampler.decode().unwrap();
        assert_eq!(samples.len(), 4);
        assert!(matches!(samples[0], Sample::TimestampBefore(_)));
        assert_eq!(
            samples[1],
            Sample::Value {
                bucket: 0,
                address: 0x1000,
                value: 0x1001
            }
        );
        assert_eq!(
            samples[2],
            Sample::Value {
                bucket: 3,
                address: 0x2000,
                value: 0x2001
            }
        );
        assert!(matches!(samples[3], Sample::TimestampAfter(_)));
        assert_eq!(sampler.raw().len(), 5 + 5 + 9 + 5);
    }

    #[test]
    fn failed_read_ends_the_pass() {
        let mut sampler = sampler(&[(0, 0x1000, 4), (1, 0x2000, 4)]);
        let result = sampler.sample(|address, _, _| {
            Err(RiscvError::MemoryFault {
                address,
                kind: crate::error::MemoryFaultKind::Bus(2),
            })
        });

        assert!(result.is_err());
        let samples = sampler.decode().unwrap();
        assert_eq!(samples.len(), 2);
    }

    #[test]
    fn full_buffer_keeps_room_for_markers() {
        let mut sampler = sampler(&[(0, 0x1000, 8)]);
        sampler.capacity = 16;
        for _ in 0..3 {
            sampler.sample(|_, _, _| Ok(())).unwrap();
        }

        // The first pass has no room for its closing marker, later ones have none at all.
        assert_eq!(sampler.raw().len(), 14);
        assert!(sampler.decode().is_ok());
    }

    #[test]
    fn reconfiguring_drops_samples() {
        let mut sampler = sampler(&[(0, 0x1000, 4)]);
        sampler.sample(|_, _, _| Ok(())).unwrap();
        assert!(!sampler.raw().is_empty());

        sampler.configure(0, None).unwrap();
        assert!(sampler.raw().is_empty());
        assert!(sampler.enabled());
        assert_eq!(sampler.buckets().count(), 0);
    }

    #[test]
    fn bucket_arguments_are_checked() {
        let mut sampler = MemorySampler::default();
        assert!(matches!(
            sampler.configure(SAMPLE_BUCKETS, None),
            Err(RiscvError::InvalidArgument(_))
        ));
        assert!(matches!(
            sampler.configure(0, Some(SampleBucket { address: 0, size: 2 })),
            Err(RiscvError::InvalidArgument(_))
        ));
        assert!(!sampler.enabled());
    }
}
