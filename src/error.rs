//! The core shares one closed error taxonomy with the transport layer;
//! see `tape_transport::error` for the enum itself.
pub use tape_transport::error::{LtfsError as Error, Result};

/// Out-of-band warnings attached to an otherwise-successful operation.
/// The façade and sync engine inspect this to decide whether a
/// capacity-triggered sync is due.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Status {
    pub capacity_warning: Option<tape_transport::CapacityWarning>,
    /// Set when a serialized timestamp was clamped into `[0000,9999]`
    /// during XML encoding.
    pub time_out_of_range: bool,
}

impl Status {
    pub const OK: Status = Status {
        capacity_warning: None,
        time_out_of_range: false,
    };

    pub fn merge(self, other: Status) -> Status {
        Status {
            capacity_warning: self.capacity_warning.max(other.capacity_warning),
            time_out_of_range: self.time_out_of_range || other.time_out_of_range,
        }
    }
}
