//! Index manager (C6).
//!
//! Owns the generation counter and the write/traversal algorithm: writing
//! a new generation, validating a candidate against the coherency record,
//! and walking the back-pointer chain backward or forward at mount time.
use uuid::Uuid;

use tape_transport::mam::CoherencyRecord;
use tape_transport::{AttributeId, PartitionId, TapePosition, TapeTransport};

use crate::error::{Error, Result, Status};
use crate::index::xml::{self, IndexMeta, IndexPartitionCriteriaXml};
use crate::position::PositionManager;
use crate::runtime::TraversalStrategy;
use crate::tree::Tree;

/// Tracks the generation chain and per-partition self-pointers for the
/// currently mounted volume ("Index generation chain").
pub struct IndexManager {
    pub generation: u64,
    pub volume_uuid: Uuid,
    pub index_partition: PartitionId,
    pub data_partition: PartitionId,
    self_pointer: [Option<TapePosition>; 2],
    pub dirty: bool,
    pub atime_dirty: bool,
}

impl IndexManager {
    pub fn new(volume_uuid: Uuid, index_partition: PartitionId, data_partition: PartitionId) -> Self {
        Self {
            generation: 0,
            volume_uuid,
            index_partition,
            data_partition,
            self_pointer: [None, None],
            dirty: false,
            atime_dirty: false,
        }
    }

    pub fn self_pointer(&self, partition: PartitionId) -> Option<TapePosition> {
        self.self_pointer[partition.as_index()]
    }

    pub(crate) fn set_self_pointer(&mut self, partition: PartitionId, pos: Option<TapePosition>) {
        self.self_pointer[partition.as_index()] = pos;
    }

    /// Writes a new generation to each of `partitions`, in order. A
    /// partial failure (`EarlyWarning` on IP) is tolerated and the write
    /// continues; `NoSpace` on IP aborts after tripping read-only (via
    /// [`PositionManager`]) and the remaining partitions in this call are
    /// skipped.
    pub fn write_generation<T: TapeTransport>(
        &mut self,
        mgr: &mut PositionManager<T>,
        tree: &Tree,
        creator: &str,
        blocksize: u32,
        index_criteria: Option<IndexPartitionCriteriaXml>,
        partitions: &[PartitionId],
    ) -> Result<Status> {
        let next_generation = self.generation + 1;
        let mut new_pointers = self.self_pointer;
        let mut status = Status::OK;

        for &partition in partitions {
            let previous = self.self_pointer[partition.as_index()];

            mgr.append_filemark(partition, 1)?;
            let location = mgr
                .current_position()
                .ok_or_else(|| Error::BadArg("position lost before index write".into()))?;

            let meta = IndexMeta {
                creator: creator.to_string(),
                comment: None,
                volume_uuid: self.volume_uuid,
                generation_number: next_generation,
                update_time: chrono::Utc::now(),
                location,
                previous_generation_location: previous,
                allow_policy_update: true,
                index_partition_criteria: index_criteria.clone(),
                highest_file_uid: tree.highest_uid(),
                unknown_tags: Vec::new(),
            };
            let (xml_text, clamped) = xml::serialize_index(&meta, tree)?;
            status.time_out_of_range |= clamped;

            for chunk in xml_text.as_bytes().chunks(blocksize as usize) {
                let (_, s) = mgr.append_record(partition, chunk)?;
                status = status.merge(s);
            }
            mgr.append_filemark(partition, 1)?;
            new_pointers[partition.as_index()] = Some(location);
        }

        for &partition in partitions {
            if let Some(pos) = new_pointers[partition.as_index()] {
                let coherency = CoherencyRecord {
                    volume_change_reference: 0,
                    generation: next_generation,
                    set_id: pos.block,
                    volume_uuid: self.volume_uuid.to_string(),
                    version: 1,
                };
                mgr.transport().write_mam(partition, AttributeId::COHERENCY, &coherency.to_bytes())?;
            }
        }

        self.self_pointer = new_pointers;
        self.generation = next_generation;
        self.dirty = false;
        self.atime_dirty = false;
        Ok(status)
    }
}

fn validate_candidate(meta: &IndexMeta, expected_uuid: Uuid, read_at: TapePosition) -> bool {
    meta.volume_uuid == expected_uuid && meta.location == read_at
}

/// Reads an index at a known position and parses it, validating self-
/// pointer consistency ("Traversal validates each candidate").
fn load_index_at<T: TapeTransport>(
    mgr: &mut PositionManager<T>,
    partition: PartitionId,
    pos: TapePosition,
    blocksize: u32,
    expected_uuid: Uuid,
) -> Result<(IndexMeta, Tree)> {
    mgr.locate(pos)?;
    let bytes = mgr
        .read_stream_until_filemark(partition, blocksize as usize)?
        .ok_or(Error::EodMissing)?;
    let (meta, tree, _) = xml::parse_index(&bytes)?;
    if !validate_candidate(&meta, expected_uuid, pos) {
        return Err(Error::BadIndex);
    }
    Ok((meta, tree))
}

/// Backward traversal: follow a partition's back-pointer
/// chain from `start`, stopping at the first candidate that satisfies
/// `stop`. Used directly for plain backward recovery (`stop` always
/// true on the first valid candidate) and for rollback (`stop` checks
/// the requested generation).
fn traverse_backward<T: TapeTransport>(
    mgr: &mut PositionManager<T>,
    partition: PartitionId,
    start: TapePosition,
    blocksize: u32,
    expected_uuid: Uuid,
    stop: impl Fn(&IndexMeta) -> bool,
) -> Result<(IndexMeta, Tree)> {
    let mut cursor = Some(start);
    let mut last_err = Error::BadIndex;
    while let Some(pos) = cursor {
        match load_index_at(mgr, partition, pos, blocksize, expected_uuid) {
            Ok((meta, tree)) => {
                if stop(&meta) {
                    return Ok((meta, tree));
                }
                cursor = meta.previous_generation_location;
            }
            Err(e) => {
                last_err = e;
                break;
            }
        }
    }
    Err(last_err)
}

/// Forward traversal: scan filemark-delimited records on
/// `partition` starting at `first_candidate`, parsing each as an index;
/// records that don't parse are data segments written under the index
/// partition placement policy and are skipped. Keeps the highest valid
/// generation seen before EOD.
fn traverse_forward<T: TapeTransport>(
    mgr: &mut PositionManager<T>,
    partition: PartitionId,
    first_candidate: TapePosition,
    blocksize: u32,
    expected_uuid: Uuid,
) -> Result<(IndexMeta, Tree)> {
    let mut best: Option<(IndexMeta, Tree)> = None;
    let mut pos = first_candidate;
    loop {
        if mgr.locate(pos).is_err() {
            break;
        }
        let bytes = match mgr.read_stream_until_filemark(partition, blocksize as usize) {
            Ok(Some(b)) => b,
            Ok(None) | Err(_) => break,
        };
        if let Ok((meta, tree, _)) = xml::parse_index(&bytes) {
            if meta.volume_uuid == expected_uuid {
                let better = best.as_ref().map_or(true, |(m, _)| meta.generation_number > m.generation_number);
                if better {
                    best = Some((meta, tree));
                }
            }
        }
        pos = match mgr.current_position() {
            Some(p) => p,
            None => break,
        };
    }
    best.ok_or(Error::BadIndex)
}

/// Result of a full mount-time index resolution.
pub struct MountResult {
    pub meta: IndexMeta,
    pub tree: Tree,
    pub manager: IndexManager,
    /// Set for a `Rollback` mount: the volume must stay read-only for the
    /// rest of this session.
    pub forced_read_only: bool,
}

/// Resolves the index to mount,'s ordering: coherency
/// agreement, then higher-generation-that-parses, then an explicit
/// traversal using `strategy`.
pub fn mount<T: TapeTransport>(
    mgr: &mut PositionManager<T>,
    index_partition: PartitionId,
    data_partition: PartitionId,
    blocksize: u32,
    expected_uuid: Uuid,
    strategy: TraversalStrategy,
) -> Result<MountResult> {
    let ip_coherency = crate::label::read_coherency(mgr.transport(), index_partition)?;
    let dp_coherency = crate::label::read_coherency(mgr.transport(), data_partition);

    let agree = dp_coherency
        .as_ref()
        .map(|dp| dp.generation == ip_coherency.generation && dp.volume_uuid == ip_coherency.volume_uuid)
        .unwrap_or(false);

    let (partition, coherency) = if agree {
        (index_partition, ip_coherency)
    } else {
        match &dp_coherency {
            Ok(dp) if dp.generation > ip_coherency.generation => (data_partition, dp.clone()),
            _ => (index_partition, ip_coherency),
        }
    };

    let head_position = TapePosition::new(partition, coherency.set_id);
    let mut forced_read_only = false;

    let (meta, tree) = match load_index_at(mgr, partition, head_position, blocksize, expected_uuid) {
        Ok(found) => found,
        Err(_) => match strategy {
            TraversalStrategy::Backward => {
                traverse_backward(mgr, partition, head_position, blocksize, expected_uuid, |_| true)?
            }
            TraversalStrategy::Forward => {
                traverse_forward(mgr, index_partition, TapePosition::zero(index_partition), blocksize, expected_uuid)?
            }
            TraversalStrategy::Rollback(target) => {
                forced_read_only = true;
                traverse_backward(mgr, partition, head_position, blocksize, expected_uuid, |m| {
                    m.generation_number == target
                })?
            }
        },
    };

    if let TraversalStrategy::Rollback(target) = strategy {
        if meta.generation_number != target {
            return Err(Error::BadIndex);
        }
        forced_read_only = true;
    }

    let mut manager = IndexManager::new(expected_uuid, index_partition, data_partition);
    manager.generation = meta.generation_number;
    let self_pos = TapePosition::new(partition, coherency.set_id);
    manager.set_self_pointer(partition, Some(self_pos));
    if let Ok(other) = &dp_coherency {
        let other_partition = partition.other();
        if other.generation == meta.generation_number {
            manager.set_self_pointer(other_partition, Some(TapePosition::new(other_partition, other.set_id)));
        }
    }

    Ok(MountResult { meta, tree, manager, forced_read_only })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tape_transport::file::FileTransport;
    use tape_transport::TapeTransport as _;

    fn mgr() -> PositionManager<FileTransport> {
        let mut t = FileTransport::new();
        t.load().unwrap();
        PositionManager::new(t)
    }

    #[test]
    fn write_then_reload_generation() {
        let mut mgr = mgr();
        let volume_uuid = Uuid::new_v4();
        let tree = Tree::new_empty("VOL".to_string());
        let mut manager = IndexManager::new(volume_uuid, PartitionId::A, PartitionId::B);
        let status = manager
            .write_generation(&mut mgr, &tree, "rust-ltfs", 4096, None, &[PartitionId::A, PartitionId::B])
            .unwrap();
        assert_eq!(status, Status::OK);
        assert_eq!(manager.generation, 1);

        let pos = manager.self_pointer(PartitionId::A).unwrap();
        let (meta, _) = load_index_at(&mut mgr, PartitionId::A, pos, 4096, volume_uuid).unwrap();
        assert_eq!(meta.generation_number, 1);
    }

    #[test]
    fn second_generation_points_back_to_first() {
        let mut mgr = mgr();
        let volume_uuid = Uuid::new_v4();
        let tree = Tree::new_empty("VOL".to_string());
        let mut manager = IndexManager::new(volume_uuid, PartitionId::A, PartitionId::B);
        manager.write_generation(&mut mgr, &tree, "rust-ltfs", 4096, None, &[PartitionId::A]).unwrap();
        let first_pos = manager.self_pointer(PartitionId::A).unwrap();
        manager.write_generation(&mut mgr, &tree, "rust-ltfs", 4096, None, &[PartitionId::A]).unwrap();
        let second_pos = manager.self_pointer(PartitionId::A).unwrap();
        let (meta, _) = load_index_at(&mut mgr, PartitionId::A, second_pos, 4096, volume_uuid).unwrap();
        assert_eq!(meta.previous_generation_location, Some(first_pos));
    }
}
