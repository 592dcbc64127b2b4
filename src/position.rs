//! Block/position layer (C2).
//!
//! Tracks two append-only partitions with sticky capacity state, a
//! single-block read-back cache, and a write-protect trip switch.
use std::collections::HashMap;

use std::num::NonZeroUsize;

use lru::LruCache;
use tape_transport::{
    CapacityState, LtfsError, PartitionId, ReadOutcome, Result, SpaceKind, TapePosition,
    TapeTransport, WriteStatus,
};

use crate::error::Status;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    partition: PartitionId,
    block: u64,
}

/// Tracks head position, per-partition append cursors, capacity state,
/// and the write-protect trip switch described in 
pub struct PositionManager<T: TapeTransport> {
    transport: T,
    current_position: Option<TapePosition>,
    /// `None` means "append at EOD" (the block/position layer re-locates
    /// lazily, only right before the next write).
    append_position: [Option<u64>; 2],
    capacity_state: [CapacityState; 2],
    read_only: bool,
    cache: LruCache<CacheKey, Vec<u8>>,
}

impl<T: TapeTransport> PositionManager<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            current_position: None,
            append_position: [None, None],
            capacity_state: [CapacityState::Ok; 2],
            read_only: false,
            cache: LruCache::new(NonZeroUsize::new(1).unwrap()),
        }
    }

    pub fn transport(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn capacity_state(&self, partition: PartitionId) -> CapacityState {
        self.capacity_state[partition.as_index()]
    }

    /// Forces the volume read-only for the remainder of the mount.
    /// Tripped by a write error, a write-protect switch, or `NoSpace` on
    /// the Index Partition.
    fn trip_read_only(&mut self) {
        self.read_only = true;
    }

    fn invalidate_cache(&mut self) {
        self.cache.clear();
    }

    /// Issues a `locate` if this partition's append position hasn't been
    /// resolved yet, then clears it.
    fn ensure_located_for_append(&mut self, partition: PartitionId) -> Result<()> {
        if let Some(block) = self.append_position[partition.as_index()] {
            self.transport.locate(TapePosition::new(partition, block))?;
            self.current_position = Some(TapePosition::new(partition, block));
            self.invalidate_cache();
        } else {
            self.transport.space(partition, SpaceKind::Eod)?;
            self.invalidate_cache();
        }
        self.append_position[partition.as_index()] = None;
        Ok(())
    }

    /// Forces the volume read-only for the remainder of the mount; used for
    /// a `Rollback` mount, which must never advance the tape.
    pub fn force_read_only(&mut self) {
        self.trip_read_only();
    }

    /// Marks `partition`'s append cursor as unresolved; the next write to
    /// it will re-locate to EOD. Used after any out-of-band positioning
    /// (mount traversal, explicit locate for a read).
    pub fn invalidate_append_position(&mut self, partition: PartitionId) {
        self.append_position[partition.as_index()] = None;
    }

    pub fn locate(&mut self, position: TapePosition) -> Result<()> {
        self.transport.locate(position)?;
        self.current_position = Some(position);
        self.invalidate_cache();
        Ok(())
    }

    pub fn current_position(&self) -> Option<TapePosition> {
        self.current_position
    }

    /// Appends one record to `partition`. Returns the position the record
    /// was written at and the merged status.
    pub fn append_record(&mut self, partition: PartitionId, buf: &[u8]) -> Result<(TapePosition, Status)> {
        if self.read_only {
            return Err(LtfsError::ReadOnlyVolume);
        }
        self.ensure_located_for_append(partition)?;
        let write_result = self.transport.write(partition, buf);
        let status = self.observe_write_result(partition, write_result)?;
        let pos = self.current_position.expect("position set by ensure_located_for_append");
        self.current_position = Some(TapePosition::new(partition, pos.block + 1));
        self.invalidate_cache();
        Ok((pos, status))
    }

    pub fn append_filemark(&mut self, partition: PartitionId, count: u32) -> Result<Status> {
        if self.read_only {
            return Err(LtfsError::ReadOnlyVolume);
        }
        self.ensure_located_for_append(partition)?;
        let write_result = self.transport.write_filemark(partition, count);
        let status = self.observe_write_result(partition, write_result)?;
        if let Some(pos) = self.current_position {
            self.current_position = Some(TapePosition::new(partition, pos.block + count as u64));
        }
        self.invalidate_cache();
        Ok(status)
    }

    fn observe_write_result(&mut self, partition: PartitionId, result: Result<WriteStatus>) -> Result<Status> {
        match result {
            Ok(write_status) => {
                let mut status = Status::OK;
                if let Some(warning) = write_status.warning {
                    self.capacity_state[partition.as_index()] =
                        self.capacity_state[partition.as_index()].escalate(warning);
                    status.capacity_warning = Some(warning);
                }
                Ok(status)
            }
            Err(LtfsError::NoSpace) if partition == PartitionId::A => {
                self.trip_read_only();
                Err(LtfsError::NoSpace)
            }
            Err(LtfsError::WriteProtected) | Err(LtfsError::LogicalWriteProtect) => {
                self.trip_read_only();
                Err(LtfsError::WriteProtected)
            }
            Err(e) => Err(e),
        }
    }

    /// Reads successive blocks from `partition` starting at the current
    /// position until a filemark is hit, concatenating their payloads.
    /// Used by the index manager (C6) to reassemble a multi-block index
    /// document ("tape-streamed input"). Returns `Ok(None)` if
    /// EOD is reached before a filemark (no more records here).
    pub fn read_stream_until_filemark(&mut self, partition: PartitionId, blocksize: usize) -> Result<Option<Vec<u8>>> {
        self.invalidate_cache();
        let mut out = Vec::new();
        loop {
            let mut buf = vec![0u8; blocksize];
            match self.transport.read(partition, &mut buf)? {
                ReadOutcome::Record(n) => {
                    buf.truncate(n);
                    out.extend_from_slice(&buf);
                    if let Some(pos) = self.current_position {
                        self.current_position = Some(TapePosition::new(partition, pos.block + 1));
                    }
                }
                ReadOutcome::Filemark => {
                    if let Some(pos) = self.current_position {
                        self.current_position = Some(TapePosition::new(partition, pos.block + 1));
                    }
                    return Ok(Some(out));
                }
                ReadOutcome::EndOfData => return Ok(None),
            }
        }
    }

    /// Reads `len` bytes at `position`, preferring the single-block
    /// read-back cache over a real transport read.
    pub fn read_at(&mut self, position: TapePosition, len: usize) -> Result<Vec<u8>> {
        let key = CacheKey {
            partition: position.partition,
            block: position.block,
        };
        if let Some(cached) = self.cache.get(&key) {
            if cached.len() >= len {
                return Ok(cached[..len].to_vec());
            }
        }
        self.transport.locate(position)?;
        let mut buf = vec![0u8; len.max(4096)];
        let outcome = self.transport.read(position.partition, &mut buf)?;
        let n = match outcome {
            ReadOutcome::Record(n) => n,
            ReadOutcome::Filemark => return Err(LtfsError::Filemark),
            ReadOutcome::EndOfData => return Err(LtfsError::EndOfData),
        };
        buf.truncate(n);
        self.cache.put(key, buf.clone());
        self.current_position = Some(TapePosition::new(position.partition, position.block + 1));
        if buf.len() < len {
            return Ok(buf);
        }
        Ok(buf[..len].to_vec())
    }
}

/// Bookkeeping for which partitions have gone past Programmable Early
/// Warning; used by the sync engine (C8) to decide whether writes should
/// continue going to both partitions or just the Index Partition.
#[derive(Debug, Default)]
pub struct CapacityTracker {
    pub pew_seen: HashMap<PartitionId, bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tape_transport::file::FileTransport;

    fn manager() -> PositionManager<FileTransport> {
        let mut t = FileTransport::new();
        use tape_transport::TapeTransport;
        t.load().unwrap();
        PositionManager::new(t)
    }

    #[test]
    fn append_then_read_back() {
        let mut mgr = manager();
        let (pos, status) = mgr.append_record(PartitionId::A, b"index-bytes").unwrap();
        assert_eq!(pos.block, 0);
        assert_eq!(status.capacity_warning, None);
        let data = mgr.read_at(pos, 11).unwrap();
        assert_eq!(data, b"index-bytes");
    }

    #[test]
    fn no_space_on_index_partition_trips_read_only() {
        let mut t = FileTransport::new().with_capacity(4, 2, 1);
        use tape_transport::TapeTransport;
        t.load().unwrap();
        let mut mgr = PositionManager::new(t);
        let err = mgr.append_record(PartitionId::A, &[0u8; 100]).unwrap_err();
        assert_eq!(err, LtfsError::NoSpace);
        assert!(mgr.is_read_only());
        let err2 = mgr.append_record(PartitionId::A, b"x").unwrap_err();
        assert_eq!(err2, LtfsError::ReadOnlyVolume);
    }
}
