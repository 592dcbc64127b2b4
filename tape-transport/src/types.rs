//! Tape addressing and status types shared by the transport contract (C1)
//! and the block/position layer (C2) that sits above it.
use std::fmt;

/// One of the two physical partitions a volume is formatted with.
/// The volume label (C3) maps these onto the logical Index/Data roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionId {
    A,
    B,
}

impl PartitionId {
    pub fn as_letter(self) -> char {
        match self {
            PartitionId::A => 'a',
            PartitionId::B => 'b',
        }
    }

    pub fn as_index(self) -> usize {
        match self {
            PartitionId::A => 0,
            PartitionId::B => 1,
        }
    }

    pub fn from_index(i: usize) -> Option<Self> {
        match i {
            0 => Some(PartitionId::A),
            1 => Some(PartitionId::B),
            _ => None,
        }
    }

    pub fn other(self) -> PartitionId {
        match self {
            PartitionId::A => PartitionId::B,
            PartitionId::B => PartitionId::A,
        }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_letter())
    }
}

/// `(partition, block)`. Block numbers are monotonically increasing per
/// partition; there is no in-place update (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TapePosition {
    pub partition: PartitionId,
    pub block: u64,
}

impl TapePosition {
    pub fn new(partition: PartitionId, block: u64) -> Self {
        Self { partition, block }
    }

    pub const fn zero(partition: PartitionId) -> Self {
        Self { partition, block: 0 }
    }
}

/// Argument to `TapeTransport::space` (C1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    Records(i64),
    FilemarksForward(i64),
    FilemarksBack(i64),
    Eod,
    SequentialFilemark(i64),
}

/// Result of a single `TapeTransport::read` call. A record-oriented medium
/// can terminate a read with a filemark or EOD instead of data, and a
/// short record is reported with its true length rather than failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes of a data record were placed into the caller's buffer.
    Record(usize),
    Filemark,
    EndOfData,
}

/// Soft capacity signal. Both are sticky until unmount (spec §4.2) and
/// never fail the write that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CapacityWarning {
    EarlyWarning,
    ProgramEarlyWarning,
}

/// Three-valued per-partition capacity state (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum CapacityState {
    #[default]
    Ok,
    EarlyWarning,
    ProgramEarlyWarning,
}

impl CapacityState {
    /// Capacity state only ever escalates during a mount (sticky).
    pub fn escalate(self, warning: CapacityWarning) -> Self {
        match warning {
            CapacityWarning::EarlyWarning => self.max(CapacityState::EarlyWarning),
            CapacityWarning::ProgramEarlyWarning => self.max(CapacityState::ProgramEarlyWarning),
        }
    }
}

/// Out-of-band status carried back from a write/writeFilemark, per the §9
/// design note: "warnings... carried out-of-band through a per-op status
/// struct, not as errors".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteStatus {
    pub warning: Option<CapacityWarning>,
}

impl WriteStatus {
    pub const OK: WriteStatus = WriteStatus { warning: None };

    pub fn with_warning(warning: CapacityWarning) -> Self {
        Self { warning: Some(warning) }
    }
}

/// `TapeTransport::remaining_capacity` result (bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemainingCapacity {
    pub remaining_ip: u64,
    pub remaining_dp: u64,
    pub total_ip: u64,
    pub total_dp: u64,
}

/// MAM attribute identifier (vendor-defined per spec §6; the coherency
/// record and user-string attributes share the namespace by convention).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttributeId(pub u16);

impl AttributeId {
    pub const COHERENCY: AttributeId = AttributeId(0x0408);
    pub const VOLUME_SERIAL: AttributeId = AttributeId(0x0401);
    pub const USER_MEDIUM_TEXT: AttributeId = AttributeId(0x0802);
}
