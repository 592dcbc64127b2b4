//! Opaque tape transport contract (C1).
//!
//! This crate knows nothing about directories, files, or the XML index —
//! it only exposes positioned record I/O on a two-partition, strictly
//! sequential medium, the way a SCSI/IOKit driver would. Everything above
//! this line in the core (`ltfs` crate) is written against the
//! [`TapeTransport`] trait object so a real transport can be swapped in
//! without touching filesystem logic, mirroring how the teacher's
//! `disk_driver::DiskDriver` trait decouples `RFS` from any one backing
//! store.
pub mod error;
pub mod file;
pub mod mam;
pub mod types;

pub use error::{LtfsError, Result};
pub use types::*;

/// Synchronous, positioned record I/O on a two-partition tape. All
/// operations are serialized per handle by the caller (spec §4.1); this
/// trait makes no attempt at internal locking.
pub trait TapeTransport {
    fn open(&mut self, name: &str) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    fn load(&mut self) -> Result<()>;
    fn unload(&mut self) -> Result<()>;
    fn test_ready(&mut self) -> Result<()>;

    fn locate(&mut self, position: TapePosition) -> Result<()>;
    fn space(&mut self, partition: PartitionId, kind: SpaceKind) -> Result<()>;

    /// Reads one record into `buf`. Returns the actual outcome; a short
    /// record is not an error (spec §4.1's "illegal length indicator").
    fn read(&mut self, partition: PartitionId, buf: &mut [u8]) -> Result<ReadOutcome>;

    /// Writes one record. May return a `WriteStatus` carrying a sticky
    /// capacity warning; never fails solely because of EW/PEW.
    fn write(&mut self, partition: PartitionId, buf: &[u8]) -> Result<WriteStatus>;

    fn write_filemark(&mut self, partition: PartitionId, count: u32) -> Result<WriteStatus>;

    fn remaining_capacity(&mut self) -> Result<RemainingCapacity>;

    fn read_mam(&mut self, partition: PartitionId, attribute: AttributeId) -> Result<Vec<u8>>;
    fn write_mam(&mut self, partition: PartitionId, attribute: AttributeId, bytes: &[u8]) -> Result<()>;

    fn read_attribute(&mut self, partition: PartitionId, id: AttributeId) -> Result<Vec<u8>>;
    fn write_attribute(&mut self, partition: PartitionId, id: AttributeId, bytes: &[u8]) -> Result<()>;

    /// Whether this transport/drive pair has logical block protection
    /// enabled. The core treats LBP as enabled/disabled only and leaves
    /// algorithm negotiation to the transport (§9 open question).
    fn lbp_enabled(&self) -> bool {
        false
    }

    fn is_write_protected(&mut self) -> Result<bool> {
        Ok(false)
    }
}
