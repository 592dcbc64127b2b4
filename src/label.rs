//! Label & coherency (C3).
//!
//! The VOL1 label is a fixed 80-byte ANSI record; the XML label and
//! coherency record live above it. Both partitions carry the same
//! three-part header: VOL1, XML label, coherency MAM record.
use chrono::{DateTime, Utc};
use uuid::Uuid;
use zerocopy::{AsBytes, FromBytes, Unaligned};

use tape_transport::mam::CoherencyRecord;
use tape_transport::{AttributeId, LtfsError, PartitionId, Result, TapePosition, TapeTransport};

use crate::position::PositionManager;

pub const VOL1_LABEL_LEN: usize = 80;
pub const CURRENT_LABEL_SCHEMA: &str = "2.2.0";

#[derive(Debug, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
struct Vol1Raw {
    label_identifier: [u8; 4], // "VOL1"
    volume_identifier: [u8; 6],
    _reserved1: [u8; 29],
    owner_identifier: [u8; 14],
    _reserved2: [u8; 28],
    label_version: u8,
}

const _: () = assert!(std::mem::size_of::<Vol1Raw>() == VOL1_LABEL_LEN);

/// The ANSI-style VOL1 barcode/identifier block, first record of a
/// partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vol1Label {
    pub volume_identifier: String,
    pub owner_identifier: String,
}

impl Vol1Label {
    pub fn to_bytes(&self) -> [u8; VOL1_LABEL_LEN] {
        let mut volume_identifier = [b' '; 6];
        pad_into(&mut volume_identifier, &self.volume_identifier);
        let mut owner_identifier = [b' '; 14];
        pad_into(&mut owner_identifier, &self.owner_identifier);
        let raw = Vol1Raw {
            label_identifier: *b"VOL1",
            volume_identifier,
            _reserved1: [b' '; 29],
            owner_identifier,
            _reserved2: [b' '; 28],
            label_version: b'3',
        };
        let mut out = [0u8; VOL1_LABEL_LEN];
        out.copy_from_slice(raw.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < VOL1_LABEL_LEN {
            return Err(LtfsError::MediumFormatError);
        }
        let raw = Vol1Raw::read_from(&bytes[..VOL1_LABEL_LEN]).ok_or(LtfsError::MediumFormatError)?;
        if &raw.label_identifier != b"VOL1" {
            return Err(LtfsError::UnsupportedMedium);
        }
        Ok(Self {
            volume_identifier: trimmed(&raw.volume_identifier),
            owner_identifier: trimmed(&raw.owner_identifier),
        })
    }
}

fn pad_into(dst: &mut [u8], src: &str) {
    let bytes = src.as_bytes();
    let n = bytes.len().min(dst.len());
    dst[..n].copy_from_slice(&bytes[..n]);
}

fn trimmed(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end().to_string()
}

/// The XML `<ltfslabel>` document (item 3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlLabel {
    pub creator: String,
    pub format_time: DateTime<Utc>,
    pub volume_uuid: Uuid,
    pub this_partition: PartitionId,
    pub index_partition: PartitionId,
    pub data_partition: PartitionId,
    pub blocksize: u32,
    pub compression: bool,
}

impl XmlLabel {
    pub fn to_xml(&self) -> String {
        format!(
            "<ltfslabel version=\"{schema}\">\
<creator>{creator}</creator>\
<formattime>{time}</formattime>\
<volumeuuid>{uuid}</volumeuuid>\
<location><partition>{this_part}</partition></location>\
<partitions><index>{ip}</index><data>{dp}</data></partitions>\
<blocksize>{blocksize}</blocksize>\
<compression>{compression}</compression>\
</ltfslabel>",
            schema = CURRENT_LABEL_SCHEMA,
            creator = escape(&self.creator),
            time = crate::index::xml::format_ltfs_time(self.format_time),
            uuid = self.volume_uuid,
            this_part = self.this_partition.as_letter(),
            ip = self.index_partition.as_letter(),
            dp = self.data_partition.as_letter(),
            blocksize = self.blocksize,
            compression = self.compression,
        )
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Minimum blocksize accepted at format time.
pub const MIN_BLOCKSIZE: u32 = 4096;
pub const DEFAULT_BLOCKSIZE: u32 = 524288;

/// Formats a fresh volume: erase-to-BOP, VOL1 + XML label + empty index on
/// both partitions, coherency generation 1 (step 1-3).
pub fn format_volume<T: TapeTransport>(
    mgr: &mut PositionManager<T>,
    blocksize: u32,
    creator: &str,
) -> Result<(Uuid, TapePosition)> {
    if blocksize < MIN_BLOCKSIZE {
        return Err(LtfsError::BadArg("blocksize below minimum".into()));
    }
    let volume_uuid = Uuid::new_v4();
    let now = Utc::now();

    for this in [PartitionId::A, PartitionId::B] {
        mgr.locate(TapePosition::zero(this))?;

        let vol1 = Vol1Label {
            volume_identifier: volume_uuid.simple().to_string()[..6].to_string(),
            owner_identifier: "LTFS".to_string(),
        };
        mgr.append_record(this, &vol1.to_bytes())?;
        mgr.append_filemark(this, 1)?;

        let label = XmlLabel {
            creator: creator.to_string(),
            format_time: now,
            volume_uuid,
            this_partition: this,
            index_partition: PartitionId::A,
            data_partition: PartitionId::B,
            blocksize,
            compression: false,
        };
        mgr.append_record(this, label.to_xml().as_bytes())?;
        mgr.append_filemark(this, 1)?;
    }

    // Initial empty index, written on each partition independently: each
    // partition's coherency record must name its own just-written index
    // location, not a location on the other partition.
    let index_xml = crate::index::xml::empty_index_xml(volume_uuid, 1);
    let mut index_position = None;
    for this in [PartitionId::A, PartitionId::B] {
        let (pos, _) = mgr.append_record(this, index_xml.as_bytes())?;
        mgr.append_filemark(this, 1)?;

        let coherency = CoherencyRecord {
            volume_change_reference: 0,
            generation: 1,
            set_id: pos.block,
            volume_uuid: volume_uuid.to_string(),
            version: 1,
        };
        mgr.transport().write_mam(this, AttributeId::COHERENCY, &coherency.to_bytes())?;
        if this == PartitionId::A {
            index_position = Some(pos);
        }
    }

    Ok((volume_uuid, index_position.expect("Index Partition position always set")))
}

/// Reads both partitions' coherency records and picks a mount candidate
/// per the ordering in: agree -> highest generation -> traversal.
pub fn read_coherency<T: TapeTransport>(transport: &mut T, partition: PartitionId) -> Result<CoherencyRecord> {
    let bytes = transport.read_mam(partition, AttributeId::COHERENCY)?;
    CoherencyRecord::from_bytes(&bytes).ok_or(LtfsError::BadIndex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vol1_round_trips() {
        let label = Vol1Label {
            volume_identifier: "TEST01".to_string(),
            owner_identifier: "LTFS".to_string(),
        };
        let bytes = label.to_bytes();
        assert_eq!(bytes.len(), VOL1_LABEL_LEN);
        let back = Vol1Label::from_bytes(&bytes).unwrap();
        assert_eq!(back.volume_identifier, "TEST01");
        assert_eq!(back.owner_identifier, "LTFS");
    }
}
