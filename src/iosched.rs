//! I/O scheduler (C7).
//!
//! Per-file write buffer, lazy placement decision, a global
//! admission-controlled buffer pool, and an at-most-one-flusher
//! invariant, plain structs behind a `Mutex`/`Condvar`.
use std::sync::{Condvar, Mutex};

use tape_transport::{PartitionId, TapeTransport};

use crate::error::{Error, Result, Status};
use crate::position::PositionManager;
use crate::runtime::VolumePolicy;
use crate::tree::{Dentry, Extent};

/// Per-file state private to C7. Lives behind `Dentry::iosched`.
#[derive(Debug, Default)]
pub struct FileIoState {
    /// Bytes not yet committed to tape, starting at `buffer_offset`.
    buffer: Vec<u8>,
    buffer_offset: u64,
    placement: Option<PartitionId>,
    /// Set once any byte of this file has actually landed on `placement`;
    /// after that the placement decision is sticky.
    placement_committed: bool,
    pending_writer: bool,
}

impl FileIoState {
    fn buffered_len(&self) -> u64 {
        self.buffer.len() as u64
    }
}

/// The volume-wide admission-controlled buffer pool plus placement policy
///. One instance per mounted volume, shared by every open
/// file's scheduler calls.
pub struct Scheduler {
    blocksize: u32,
    state: Mutex<PoolState>,
    room_available: Condvar,
}

struct PoolState {
    used: u64,
    min_pool_size: u64,
    max_pool_size: u64,
}

impl Scheduler {
    pub fn new(blocksize: u32, policy: &VolumePolicy) -> Self {
        Self {
            blocksize,
            state: Mutex::new(PoolState {
                used: 0,
                min_pool_size: policy.min_pool_size,
                max_pool_size: policy.max_pool_size,
            }),
            room_available: Condvar::new(),
        }
    }

    /// True once the pool is deep enough over budget that the sync engine
    /// should be asked for a cache-pressure sync.
    pub fn under_cache_pressure(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.used > state.max_pool_size
    }

    fn reserve(&self, additional: u64) {
        let mut state = self.state.lock().unwrap();
        while state.used > state.min_pool_size && state.used + additional > state.max_pool_size {
            state = self.room_available.wait(state).unwrap();
        }
        state.used += additional;
    }

    fn release(&self, amount: u64) {
        let mut state = self.state.lock().unwrap();
        state.used = state.used.saturating_sub(amount);
        drop(state);
        self.room_available.notify_all();
    }

    /// Decides whether `name`/`projected_size` qualifies for the Index
    /// Partition under the volume's placement criteria.
    fn wants_index_partition(policy: &VolumePolicy, name: &str, projected_size: u64) -> bool {
        let criteria = &policy.index_criteria;
        criteria.have_criteria
            && projected_size <= criteria.max_filesize_criteria
            && criteria
                .glob_patterns
                .iter()
                .any(|pattern| glob_match(pattern, name))
    }

    /// Buffers `data` at the current end of `file`'s buffered region.
    /// Blocks (via admission control) if the pool is over budget.
    pub fn write(&self, file: &Dentry, data: &[u8]) -> Result<Status> {
        if data.is_empty() {
            return Ok(Status::OK);
        }
        self.reserve(data.len() as u64);
        let mut guard = file.iosched.lock().unwrap();
        let state = guard.get_or_insert_with(FileIoState::default);
        let mut meta = file.meta.lock().unwrap();
        if state.buffer.is_empty() {
            state.buffer_offset = meta.size;
        }
        state.buffer.extend_from_slice(data);
        meta.size = meta.size.max(state.buffer_offset + state.buffer.len() as u64);
        Ok(Status::OK)
    }

    /// Forces (or records) a placement decision via the `ltfs.partition`
    /// xattr on an empty file. Fails once data has already landed.
    pub fn force_placement(&self, file: &Dentry, partition: PartitionId) -> Result<()> {
        let mut guard = file.iosched.lock().unwrap();
        let state = guard.get_or_insert_with(FileIoState::default);
        if state.placement_committed {
            return Err(Error::BadArg("placement already committed".into()));
        }
        state.placement = Some(partition);
        Ok(())
    }

    /// Drains `file`'s write buffer to tape, updating its extent list
    /// under `contents_lock` ("flush semantics").
    pub fn flush<T: TapeTransport>(
        &self,
        file: &Dentry,
        mgr: &mut PositionManager<T>,
        policy: &VolumePolicy,
        index_partition: PartitionId,
        data_partition: PartitionId,
    ) -> Result<Status> {
        let mut guard = file.iosched.lock().unwrap();
        let state = match guard.as_mut() {
            Some(s) if !s.buffer.is_empty() => s,
            _ => return Ok(Status::OK),
        };
        if state.pending_writer {
            return Err(Error::BadArg("concurrent flush on same file".into()));
        }
        state.pending_writer = true;

        let name = file.meta.lock().unwrap().name.clone();
        let projected_size = file.meta.lock().unwrap().size;
        let partition = match state.placement {
            Some(p) => p,
            None => {
                if Self::wants_index_partition(policy, &name, projected_size) {
                    index_partition
                } else {
                    data_partition
                }
            }
        };

        let mut status = Status::OK;
        let mut written_extents = Vec::new();
        let blocksize = self.blocksize as usize;
        let mut offset = 0usize;
        while offset < state.buffer.len() {
            let end = (offset + blocksize).min(state.buffer.len());
            let chunk = &state.buffer[offset..end];
            let (pos, s) = mgr.append_record(partition, chunk)?;
            status = status.merge(s);
            written_extents.push(Extent {
                start: pos,
                byte_offset: 0,
                byte_count: chunk.len() as u64,
                file_offset: state.buffer_offset + offset as u64,
            });
            offset = end;
        }
        state.placement = Some(partition);
        state.placement_committed = true;

        let flushed = state.buffer.len() as u64;
        state.buffer.clear();
        state.pending_writer = false;
        drop(guard);
        self.release(flushed);

        {
            let mut contents = file.contents.write().unwrap();
            contents.extents.extend(written_extents);
        }
        {
            let mut meta = file.meta.lock().unwrap();
            meta.realsize = meta.realsize.max(meta.size);
        }
        Ok(status)
    }

    /// `close(file, flush=true)`
    pub fn close<T: TapeTransport>(
        &self,
        file: &Dentry,
        flush_first: bool,
        mgr: &mut PositionManager<T>,
        policy: &VolumePolicy,
        index_partition: PartitionId,
        data_partition: PartitionId,
    ) -> Result<Status> {
        if flush_first {
            self.flush(file, mgr, policy, index_partition, data_partition)
        } else {
            Ok(Status::OK)
        }
    }

    /// Flushes first, then trims or zero-extends (sparse) to `len`.
    pub fn truncate<T: TapeTransport>(
        &self,
        file: &Dentry,
        len: u64,
        mgr: &mut PositionManager<T>,
        policy: &VolumePolicy,
        index_partition: PartitionId,
        data_partition: PartitionId,
    ) -> Result<Status> {
        let status = self.flush(file, mgr, policy, index_partition, data_partition)?;
        let mut contents = file.contents.write().unwrap();
        contents.extents.retain(|e| e.file_offset < len);
        for e in contents.extents.iter_mut() {
            if e.file_offset + e.byte_count > len {
                e.byte_count = len - e.file_offset;
            }
        }
        drop(contents);
        let mut meta = file.meta.lock().unwrap();
        meta.size = len;
        meta.realsize = meta.realsize.min(len);
        Ok(status)
    }

    /// Reads `len` bytes at `offset`, serving unflushed tail bytes from
    /// the write buffer and sparse regions as zeros.
    pub fn read_logical<T: TapeTransport>(
        &self,
        file: &Dentry,
        offset: u64,
        len: usize,
        mgr: &mut PositionManager<T>,
    ) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        let extents: Vec<Extent> = file.contents.read().unwrap().extents.clone();
        for extent in &extents {
            let extent_end = extent.file_offset + extent.byte_count;
            let read_end = offset + len as u64;
            if extent_end <= offset || extent.file_offset >= read_end {
                continue;
            }
            let overlap_start = extent.file_offset.max(offset);
            let overlap_end = extent_end.min(read_end);
            let bytes = mgr.read_at(extent.start, (extent.byte_offset as u64 + (overlap_start - extent.file_offset) + (overlap_end - overlap_start)) as usize)?;
            let src_start = (extent.byte_offset as u64 + (overlap_start - extent.file_offset)) as usize;
            let src = &bytes[src_start..src_start + (overlap_end - overlap_start) as usize];
            let dst_start = (overlap_start - offset) as usize;
            out[dst_start..dst_start + src.len()].copy_from_slice(src);
        }
        let guard = file.iosched.lock().unwrap();
        if let Some(state) = guard.as_ref() {
            let buf_end = state.buffer_offset + state.buffer.len() as u64;
            let read_end = offset + len as u64;
            if buf_end > offset && state.buffer_offset < read_end {
                let overlap_start = state.buffer_offset.max(offset);
                let overlap_end = buf_end.min(read_end);
                let src_start = (overlap_start - state.buffer_offset) as usize;
                let src = &state.buffer[src_start..src_start + (overlap_end - overlap_start) as usize];
                let dst_start = (overlap_start - offset) as usize;
                out[dst_start..dst_start + src.len()].copy_from_slice(src);
            }
        }
        Ok(out)
    }
}

/// Minimal glob matcher for index-partition-criteria patterns (`*`/`?`
/// only, as used by `original_source/index_criteria.c`). Not a general
/// shell glob: no character classes, no `**`.
fn glob_match(pattern: &str, name: &str) -> bool {
    fn helper(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => helper(&p[1..], n) || (!n.is_empty() && helper(p, &n[1..])),
            (Some(b'?'), Some(_)) => helper(&p[1..], &n[1..]),
            (Some(pc), Some(nc)) if pc == nc => helper(&p[1..], &n[1..]),
            _ => false,
        }
    }
    helper(pattern.as_bytes(), name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_suffix_pattern() {
        assert!(glob_match("*.meta", "a.meta"));
        assert!(!glob_match("*.meta", "a.bin"));
        assert!(glob_match("data?.bin", "data1.bin"));
    }

    #[test]
    fn placement_picks_index_partition_for_matching_small_file() {
        let policy = VolumePolicy {
            index_criteria: crate::runtime::IndexPartitionCriteria {
                have_criteria: true,
                max_filesize_criteria: 1_048_576,
                glob_patterns: vec!["*.meta".to_string()],
            },
            ..VolumePolicy::default()
        };
        assert!(Scheduler::wants_index_partition(&policy, "a.meta", 1000));
        assert!(!Scheduler::wants_index_partition(&policy, "a.bin", 1000));
        assert!(!Scheduler::wants_index_partition(&policy, "a.meta", 2_000_000));
    }
}
