//! MAM coherency-record codec (spec §6).
//!
//! The teacher casts `Ext2INode`/`Ext2GroupDesc` in and out of raw tape
//! blocks with `unsafe { serialize_row/deserialize_row }`
//! (`src/rfs_lib/utils.rs`). The coherency record is exactly this kind of
//! fixed, packed, little-endian struct, so we use the same idea through
//! `zerocopy`'s derive macros instead of raw pointer casts.
use zerocopy::{AsBytes, FromBytes, Unaligned};

pub const COHERENCY_RECORD_LEN: usize = 62;

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct CoherencyRecordRaw {
    pub volume_change_reference: zerocopy::byteorder::U64<zerocopy::LittleEndian>,
    pub generation: zerocopy::byteorder::U64<zerocopy::LittleEndian>,
    pub set_id: zerocopy::byteorder::U64<zerocopy::LittleEndian>,
    pub uuid: [u8; 37],
    pub version: u8,
}

/// The host-friendly view of [`CoherencyRecordRaw`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoherencyRecord {
    pub volume_change_reference: u64,
    pub generation: u64,
    pub set_id: u64,
    pub volume_uuid: String,
    pub version: u8,
}

impl CoherencyRecord {
    pub fn to_bytes(&self) -> [u8; COHERENCY_RECORD_LEN] {
        let mut uuid = [0u8; 37];
        let src = self.volume_uuid.as_bytes();
        let n = src.len().min(36);
        uuid[..n].copy_from_slice(&src[..n]);
        let raw = CoherencyRecordRaw {
            volume_change_reference: self.volume_change_reference.into(),
            generation: self.generation.into(),
            set_id: self.set_id.into(),
            uuid,
            version: self.version,
        };
        let mut out = [0u8; COHERENCY_RECORD_LEN];
        out.copy_from_slice(raw.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < COHERENCY_RECORD_LEN {
            return None;
        }
        let raw = CoherencyRecordRaw::read_from(&bytes[..COHERENCY_RECORD_LEN])?;
        let nul = raw.uuid.iter().position(|&b| b == 0).unwrap_or(raw.uuid.len());
        let volume_uuid = String::from_utf8_lossy(&raw.uuid[..nul]).into_owned();
        Some(Self {
            volume_change_reference: raw.volume_change_reference.get(),
            generation: raw.generation.get(),
            set_id: raw.set_id.get(),
            volume_uuid,
            version: raw.version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let rec = CoherencyRecord {
            volume_change_reference: 7,
            generation: 3,
            set_id: 4096,
            volume_uuid: "5f8e1b2a-0000-4000-8000-000000000001".to_string(),
            version: 1,
        };
        let bytes = rec.to_bytes();
        assert_eq!(bytes.len(), COHERENCY_RECORD_LEN);
        let back = CoherencyRecord::from_bytes(&bytes).unwrap();
        assert_eq!(rec, back);
    }
}
