//! Closed error taxonomy shared by every layer of the core (spec §7).
//!
//! `EarlyWarning`/`ProgramEarlyWarning` are listed here because the
//! taxonomy is closed, but the core never returns them as `Err` — they
//! ride out-of-band on [`crate::Status`]. Returning them as errors here
//! would fail writes that the spec requires to succeed.
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LtfsError {
    // Argument
    #[error("null argument")]
    NullArg,
    #[error("invalid argument: {0}")]
    BadArg(String),
    #[error("name exceeds 255 bytes after normalization")]
    NameTooLong,
    #[error("invalid path: {0}")]
    InvalidPath(String),

    // Namespace
    #[error("no such dentry")]
    NoDentry,
    #[error("dentry already exists")]
    Exists,
    #[error("not a directory")]
    NotADir,
    #[error("is a directory")]
    IsADir,
    #[error("directory not empty")]
    NotEmpty,
    #[error("xattr already exists")]
    XattrExists,
    #[error("no such xattr")]
    NoXattr,
    #[error("xattr is read-only")]
    RdonlyXattr,
    #[error("xattr value exceeds 4096 bytes")]
    LargeXattr,

    // Capacity
    #[error("no space remaining")]
    NoSpace,
    #[error("early warning")]
    EarlyWarning,
    #[error("programmable early warning")]
    ProgramEarlyWarning,
    #[error("insufficient space for requested operation")]
    LessSpace,

    // Medium
    #[error("medium is write-protected")]
    WriteProtected,
    #[error("logical write protect asserted")]
    LogicalWriteProtect,
    #[error("volume is read-only for the remainder of this mount")]
    ReadOnlyVolume,
    #[error("medium error")]
    MediumError,
    #[error("unsupported medium")]
    UnsupportedMedium,
    #[error("medium format error")]
    MediumFormatError,

    // Transport
    #[error("device could not be opened")]
    DeviceUnopenable,
    #[error("device busy")]
    DeviceBusy,
    #[error("unsupported firmware")]
    UnsupportedFirmware,
    #[error("power-on reset detected")]
    PowerOnReset,
    #[error("medium may have changed")]
    MediumMayBeChanged,
    #[error("device fenced pending revalidation")]
    DeviceFenced,
    #[error("operation timed out")]
    TimedOut,
    #[error("crypto error")]
    CryptoError,
    #[error("encryption key required")]
    KeyRequired,

    // Integrity
    #[error("logical block protection read error")]
    LbpReadError,
    #[error("logical block protection write error")]
    LbpWriteError,
    #[error("partition coherency records disagree")]
    CoherencyMismatch,
    #[error("index failed to parse")]
    BadIndex,
    #[error("end of data marker missing")]
    EodMissing,

    // Control flow
    #[error("restart operation")]
    RestartOperation,
    #[error("revalidation failed")]
    RevalFailed,
    #[error("interrupted")]
    Interrupted,

    // Transport-reported conditions that are structurally errors even
    // though EW/PEW (above) are not: a filemark or EOD encountered where
    // the caller asked for a data record.
    #[error("filemark encountered")]
    Filemark,
    #[error("end of data encountered")]
    EndOfData,
    #[error("position lost")]
    PositionLost,
}

pub type Result<T> = std::result::Result<T, LtfsError>;
