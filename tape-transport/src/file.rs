//! Deterministic, file/memory-backed [`TapeTransport`] used by tests and
//! by the CLI when pointed at a plain image file instead of a real drive.
//!
//! Grounded on `disk_driver::file::FileDiskDriver` / `memory::MemoryDiskDriver`
//! (a `Vec<u8>` standing in for the physical device), generalized from a
//! flat byte buffer to a `Vec<TapeRecord>` per partition because tape's
//! addressable unit is the *record* (filemarks included), not the byte.
use std::collections::HashMap;

use log::{debug, warn};

use crate::error::{LtfsError, Result};
use crate::types::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TapeRecord {
    Data(Vec<u8>),
    Filemark,
}

#[derive(Debug, Default)]
struct Partition {
    records: Vec<TapeRecord>,
    mam: HashMap<u16, Vec<u8>>,
    attributes: HashMap<u16, Vec<u8>>,
}

/// A simulated cartridge: two partitions, each a flat log of records.
/// `capacity_bytes` is the point at which writes start returning
/// `NoSpace`; `early_warning_bytes`/`program_early_warning_bytes` are the
/// soft thresholds below that.
pub struct FileTransport {
    partitions: [Partition; 2],
    position: Option<TapePosition>,
    write_protected: bool,
    capacity_bytes: u64,
    early_warning_bytes: u64,
    program_early_warning_bytes: u64,
}

impl FileTransport {
    pub fn new() -> Self {
        Self {
            partitions: [Partition::default(), Partition::default()],
            position: None,
            write_protected: false,
            capacity_bytes: 64 * 1024 * 1024,
            early_warning_bytes: 4 * 1024 * 1024,
            program_early_warning_bytes: 1 * 1024 * 1024,
        }
    }

    pub fn with_capacity(mut self, total: u64, early_warning: u64, program_early_warning: u64) -> Self {
        self.capacity_bytes = total;
        self.early_warning_bytes = early_warning;
        self.program_early_warning_bytes = program_early_warning;
        self
    }

    pub fn set_write_protected(&mut self, on: bool) {
        self.write_protected = on;
    }

    fn part(&self, p: PartitionId) -> &Partition {
        &self.partitions[p.as_index()]
    }

    fn part_mut(&mut self, p: PartitionId) -> &mut Partition {
        &mut self.partitions[p.as_index()]
    }

    fn used_bytes(&self, p: PartitionId) -> u64 {
        self.part(p)
            .records
            .iter()
            .map(|r| match r {
                TapeRecord::Data(d) => d.len() as u64,
                TapeRecord::Filemark => 0,
            })
            .sum()
    }

    fn remaining(&self, p: PartitionId) -> u64 {
        self.capacity_bytes.saturating_sub(self.used_bytes(p))
    }

    fn capacity_warning(&self, p: PartitionId) -> Option<CapacityWarning> {
        let remaining = self.remaining(p);
        if remaining <= self.program_early_warning_bytes {
            Some(CapacityWarning::ProgramEarlyWarning)
        } else if remaining <= self.early_warning_bytes {
            Some(CapacityWarning::EarlyWarning)
        } else {
            None
        }
    }

    /// Total number of blocks (records, filemarks included) currently on
    /// `p` — used as the append position a `locate`-to-EOD resolves to.
    pub fn block_count(&self, p: PartitionId) -> u64 {
        self.part(p).records.len() as u64
    }
}

impl Default for FileTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl super::TapeTransport for FileTransport {
    fn open(&mut self, name: &str) -> Result<()> {
        debug!("FileTransport open: {}", name);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn load(&mut self) -> Result<()> {
        self.position = Some(TapePosition::zero(PartitionId::A));
        Ok(())
    }

    fn unload(&mut self) -> Result<()> {
        self.position = None;
        Ok(())
    }

    fn test_ready(&mut self) -> Result<()> {
        Ok(())
    }

    fn locate(&mut self, position: TapePosition) -> Result<()> {
        let len = self.part(position.partition).records.len() as u64;
        if position.block > len {
            return Err(LtfsError::PositionLost);
        }
        self.position = Some(position);
        Ok(())
    }

    fn space(&mut self, partition: PartitionId, kind: SpaceKind) -> Result<()> {
        let cur = self
            .position
            .filter(|p| p.partition == partition)
            .map(|p| p.block)
            .unwrap_or(0);
        let len = self.part(partition).records.len() as u64;
        let new_block = match kind {
            SpaceKind::Eod => len,
            SpaceKind::Records(n) => (cur as i64 + n).clamp(0, len as i64) as u64,
            SpaceKind::FilemarksForward(n) | SpaceKind::SequentialFilemark(n) => {
                let mut remaining = n;
                let mut b = cur;
                while remaining > 0 && b < len {
                    if matches!(self.part(partition).records[b as usize], TapeRecord::Filemark) {
                        remaining -= 1;
                    }
                    b += 1;
                }
                b
            }
            SpaceKind::FilemarksBack(n) => {
                let mut remaining = n;
                let mut b = cur;
                while remaining > 0 && b > 0 {
                    b -= 1;
                    if matches!(self.part(partition).records[b as usize], TapeRecord::Filemark) {
                        remaining -= 1;
                    }
                }
                b
            }
        };
        self.position = Some(TapePosition::new(partition, new_block));
        Ok(())
    }

    fn read(&mut self, partition: PartitionId, buf: &mut [u8]) -> Result<ReadOutcome> {
        let pos = self
            .position
            .filter(|p| p.partition == partition)
            .ok_or(LtfsError::PositionLost)?;
        let records = &self.part(partition).records;
        if pos.block as usize >= records.len() {
            return Ok(ReadOutcome::EndOfData);
        }
        let outcome = match &records[pos.block as usize] {
            TapeRecord::Filemark => ReadOutcome::Filemark,
            TapeRecord::Data(d) => {
                let n = d.len().min(buf.len());
                buf[..n].copy_from_slice(&d[..n]);
                if d.len() > buf.len() {
                    warn!("short read: record has {} bytes, buffer has {}", d.len(), buf.len());
                }
                ReadOutcome::Record(n)
            }
        };
        self.position = Some(TapePosition::new(partition, pos.block + 1));
        Ok(outcome)
    }

    fn write(&mut self, partition: PartitionId, buf: &[u8]) -> Result<WriteStatus> {
        if self.write_protected {
            return Err(LtfsError::WriteProtected);
        }
        if buf.len() as u64 > self.remaining(partition) {
            return Err(LtfsError::NoSpace);
        }
        let pos = self
            .position
            .filter(|p| p.partition == partition)
            .ok_or(LtfsError::PositionLost)?;
        {
            let records = &mut self.part_mut(partition).records;
            records.truncate(pos.block as usize);
            records.push(TapeRecord::Data(buf.to_vec()));
        }
        self.position = Some(TapePosition::new(partition, pos.block + 1));
        let warning = self.capacity_warning(partition);
        Ok(match warning {
            Some(w) => WriteStatus::with_warning(w),
            None => WriteStatus::OK,
        })
    }

    fn write_filemark(&mut self, partition: PartitionId, count: u32) -> Result<WriteStatus> {
        if self.write_protected {
            return Err(LtfsError::WriteProtected);
        }
        let pos = self
            .position
            .filter(|p| p.partition == partition)
            .ok_or(LtfsError::PositionLost)?;
        let warning = self.capacity_warning(partition);
        {
            let records = &mut self.part_mut(partition).records;
            records.truncate(pos.block as usize);
            for _ in 0..count {
                records.push(TapeRecord::Filemark);
            }
        }
        self.position = Some(TapePosition::new(partition, pos.block + count as u64));
        Ok(match warning {
            Some(w) => WriteStatus::with_warning(w),
            None => WriteStatus::OK,
        })
    }

    fn remaining_capacity(&mut self) -> Result<RemainingCapacity> {
        Ok(RemainingCapacity {
            remaining_ip: self.remaining(PartitionId::A),
            remaining_dp: self.remaining(PartitionId::B),
            total_ip: self.capacity_bytes,
            total_dp: self.capacity_bytes,
        })
    }

    fn read_mam(&mut self, partition: PartitionId, attribute: AttributeId) -> Result<Vec<u8>> {
        self.part(partition)
            .mam
            .get(&attribute.0)
            .cloned()
            .ok_or(LtfsError::BadArg("no such MAM attribute".into()))
    }

    fn write_mam(&mut self, partition: PartitionId, attribute: AttributeId, bytes: &[u8]) -> Result<()> {
        self.part_mut(partition).mam.insert(attribute.0, bytes.to_vec());
        Ok(())
    }

    fn read_attribute(&mut self, partition: PartitionId, id: AttributeId) -> Result<Vec<u8>> {
        self.part(partition)
            .attributes
            .get(&id.0)
            .cloned()
            .ok_or(LtfsError::BadArg("no such tape attribute".into()))
    }

    fn write_attribute(&mut self, partition: PartitionId, id: AttributeId, bytes: &[u8]) -> Result<()> {
        self.part_mut(partition).attributes.insert(id.0, bytes.to_vec());
        Ok(())
    }

    fn is_write_protected(&mut self) -> Result<bool> {
        Ok(self.write_protected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TapeTransport;

    #[test]
    fn write_read_round_trip() {
        let mut t = FileTransport::new();
        t.load().unwrap();
        t.locate(TapePosition::zero(PartitionId::A)).unwrap();
        t.write(PartitionId::A, b"hello").unwrap();
        t.write_filemark(PartitionId::A, 1).unwrap();
        t.locate(TapePosition::zero(PartitionId::A)).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(t.read(PartitionId::A, &mut buf).unwrap(), ReadOutcome::Record(5));
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(t.read(PartitionId::A, &mut buf).unwrap(), ReadOutcome::Filemark);
        assert_eq!(t.read(PartitionId::A, &mut buf).unwrap(), ReadOutcome::EndOfData);
    }

    #[test]
    fn write_past_capacity_fails() {
        let mut t = FileTransport::new().with_capacity(10, 5, 2);
        t.load().unwrap();
        t.locate(TapePosition::zero(PartitionId::A)).unwrap();
        let status = t.write(PartitionId::A, &[0u8; 6]).unwrap();
        assert_eq!(status.warning, Some(CapacityWarning::EarlyWarning));
        let err = t.write(PartitionId::A, &[0u8; 20]).unwrap_err();
        assert_eq!(err, LtfsError::NoSpace);
    }

    #[test]
    fn write_protected_rejects_writes() {
        let mut t = FileTransport::new();
        t.load().unwrap();
        t.set_write_protected(true);
        t.locate(TapePosition::zero(PartitionId::A)).unwrap();
        assert_eq!(t.write(PartitionId::A, b"x").unwrap_err(), LtfsError::WriteProtected);
    }
}
