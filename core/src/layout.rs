//! On-disk record layout and byte codecs.
//!
//! Every record here is little-endian and packed, encoded/decoded through
//! explicit `to_le_bytes`/`from_le_bytes` calls rather than `#[repr(packed)]`
//! field access, which would be unsound to borrow directly in safe Rust.

use crate::constants::*;
use crate::error::{DbsError, DbsResult};

/// Superblock: bytes `[0, 512)` of the device.
#[derive(Debug, Clone, Copy)]
pub struct Superblock {
    pub version: u32,
    pub allocated_device_extents: u32,
    pub device_size: u64,
}

impl Superblock {
    pub fn new(device_size: u64) -> Self {
        Self {
            version: DBS_VERSION,
            allocated_device_extents: 0,
            device_size,
        }
    }

    pub fn encode(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut buf = [0u8; SUPERBLOCK_SIZE];
        buf[0..8].copy_from_slice(&DBS_MAGIC);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.allocated_device_extents.to_le_bytes());
        buf[16..24].copy_from_slice(&self.device_size.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> DbsResult<Self> {
        if buf.len() < SUPERBLOCK_SIZE {
            return Err(DbsError::NotInitialized);
        }
        if buf[0..8] != DBS_MAGIC {
            return Err(DbsError::NotInitialized);
        }
        let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if version != DBS_VERSION {
            return Err(DbsError::VersionMismatch {
                expected: DBS_VERSION,
                found: version,
            });
        }
        let allocated_device_extents = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let device_size = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        Ok(Self {
            version,
            allocated_device_extents,
            device_size,
        })
    }
}

/// Volume table slot. `snapshot_id == 0` marks the slot empty.
#[derive(Debug, Clone)]
pub struct VolumeRecord {
    pub snapshot_id: u16,
    pub volume_size: u64,
    pub volume_name: String,
}

impl VolumeRecord {
    pub fn empty() -> Self {
        Self {
            snapshot_id: 0,
            volume_size: 0,
            volume_name: String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot_id == 0
    }

    pub fn encode(&self) -> [u8; VOLUME_RECORD_SIZE] {
        let mut buf = [0u8; VOLUME_RECORD_SIZE];
        buf[0..2].copy_from_slice(&self.snapshot_id.to_le_bytes());
        buf[2..10].copy_from_slice(&self.volume_size.to_le_bytes());
        let name_bytes = self.volume_name.as_bytes();
        let n = name_bytes.len().min(DBS_MAX_VOLUME_NAME_SIZE);
        buf[10..10 + n].copy_from_slice(&name_bytes[..n]);
        buf
    }

    pub fn decode(buf: &[u8]) -> Self {
        let snapshot_id = u16::from_le_bytes(buf[0..2].try_into().unwrap());
        let volume_size = u64::from_le_bytes(buf[2..10].try_into().unwrap());
        let name_field = &buf[10..10 + DBS_VOLUME_NAME_FIELD_SIZE];
        let nul = name_field.iter().position(|&b| b == 0).unwrap_or(name_field.len());
        let volume_name = String::from_utf8_lossy(&name_field[..nul]).into_owned();
        Self {
            snapshot_id,
            volume_size,
            volume_name,
        }
    }
}

/// Snapshot table slot, id = index + 1. `created_at == 0` marks the slot empty.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotRecord {
    pub parent_snapshot_id: u16,
    pub created_at: i64,
}

impl SnapshotRecord {
    pub fn empty() -> Self {
        Self {
            parent_snapshot_id: 0,
            created_at: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.created_at == 0
    }

    pub fn encode(&self) -> [u8; SNAPSHOT_RECORD_SIZE] {
        let mut buf = [0u8; SNAPSHOT_RECORD_SIZE];
        buf[0..2].copy_from_slice(&self.parent_snapshot_id.to_le_bytes());
        buf[2..10].copy_from_slice(&self.created_at.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Self {
        let parent_snapshot_id = u16::from_le_bytes(buf[0..2].try_into().unwrap());
        let created_at = i64::from_le_bytes(buf[2..10].try_into().unwrap());
        Self {
            parent_snapshot_id,
            created_at,
        }
    }
}

/// One physical extent record.
///
/// The on-disk `extent_pos` field stores the *logical* extent index within
/// the owning volume; the in-memory representation here keeps that as
/// `logical_extent` and carries the *physical* device position separately
/// as `physical_extent`, so the two coordinate systems never collide in a
/// single ambiguous field (see the redesign note in the specification).
#[derive(Debug, Clone, Copy)]
pub struct ExtentRecord {
    pub snapshot_id: u16,
    pub logical_extent: u32,
    pub physical_extent: u32,
    pub block_bitmap: [u32; DBS_EXTENT_BITMAP_WORDS],
}

impl ExtentRecord {
    pub fn free() -> Self {
        Self {
            snapshot_id: 0,
            logical_extent: 0,
            physical_extent: 0,
            block_bitmap: [0; DBS_EXTENT_BITMAP_WORDS],
        }
    }

    pub fn is_free(&self) -> bool {
        self.snapshot_id == 0
    }

    /// Decode a raw on-disk record. `physical_extent` is not present on disk;
    /// callers fill it in from the scan position (see `extent_map.rs`).
    pub fn decode(buf: &[u8]) -> Self {
        let snapshot_id = u16::from_le_bytes(buf[0..2].try_into().unwrap());
        let logical_extent = u32::from_le_bytes(buf[2..6].try_into().unwrap());
        let mut block_bitmap = [0u32; DBS_EXTENT_BITMAP_WORDS];
        for (i, word) in block_bitmap.iter_mut().enumerate() {
            let off = 6 + i * 4;
            *word = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        }
        Self {
            snapshot_id,
            logical_extent,
            physical_extent: 0,
            block_bitmap,
        }
    }

    /// Encode for on-disk storage at `physical_extent`'s slot; the stored
    /// `extent_pos` field becomes `logical_extent`, per the on-disk/in-memory
    /// swap described in the specification.
    pub fn encode(&self) -> [u8; EXTENT_RECORD_SIZE] {
        let mut buf = [0u8; EXTENT_RECORD_SIZE];
        buf[0..2].copy_from_slice(&self.snapshot_id.to_le_bytes());
        buf[2..6].copy_from_slice(&self.logical_extent.to_le_bytes());
        for (i, word) in self.block_bitmap.iter().enumerate() {
            let off = 6 + i * 4;
            buf[off..off + 4].copy_from_slice(&word.to_le_bytes());
        }
        buf
    }
}

/// Byte layout derived from a device's total size.
#[derive(Debug, Clone, Copy)]
pub struct DeviceLayout {
    pub extent_offset: u64,
    pub data_offset: u64,
    pub total_device_extents: u32,
    pub metadata_size: u64,
}

impl DeviceLayout {
    pub fn compute(device_size: u64) -> Self {
        let extent_offset =
            (1 + div_round_up(DEVICE_METADATA_SIZE as u64, SUPERBLOCK_SIZE as u64)) * SUPERBLOCK_SIZE as u64;
        let total_device_extents = if device_size > extent_offset {
            ((device_size - extent_offset) / DBS_EXTENT_SIZE) as u32
        } else {
            0
        };
        let metadata_size =
            extent_offset + (EXTENT_RECORD_SIZE as u64 * total_device_extents as u64);
        let data_offset = div_round_up(DEVICE_METADATA_SIZE as u64, DBS_EXTENT_SIZE) * DBS_EXTENT_SIZE;
        Self {
            extent_offset,
            data_offset,
            total_device_extents,
            metadata_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblock_round_trips() {
        let sb = Superblock {
            version: DBS_VERSION,
            allocated_device_extents: 42,
            device_size: 1 << 30,
        };
        let decoded = Superblock::decode(&sb.encode()).unwrap();
        assert_eq!(decoded.allocated_device_extents, 42);
        assert_eq!(decoded.device_size, 1 << 30);
    }

    #[test]
    fn superblock_rejects_bad_magic() {
        let buf = [0u8; SUPERBLOCK_SIZE];
        assert!(matches!(Superblock::decode(&buf), Err(DbsError::NotInitialized)));
    }

    #[test]
    fn volume_record_round_trips_name() {
        let rec = VolumeRecord {
            snapshot_id: 7,
            volume_size: 123_456,
            volume_name: "my-volume".to_string(),
        };
        let decoded = VolumeRecord::decode(&rec.encode());
        assert_eq!(decoded.snapshot_id, 7);
        assert_eq!(decoded.volume_size, 123_456);
        assert_eq!(decoded.volume_name, "my-volume");
    }

    #[test]
    fn extent_record_round_trips_bitmap() {
        let mut rec = ExtentRecord::free();
        rec.snapshot_id = 3;
        rec.logical_extent = 9;
        rec.block_bitmap[0] = 0xFFFF_FFFF;
        let decoded = ExtentRecord::decode(&rec.encode());
        assert_eq!(decoded.snapshot_id, 3);
        assert_eq!(decoded.logical_extent, 9);
        assert_eq!(decoded.block_bitmap[0], 0xFFFF_FFFF);
    }

    #[test]
    fn layout_extent_offset_is_block_aligned() {
        let layout = DeviceLayout::compute(1 << 30);
        assert_eq!(layout.extent_offset % SUPERBLOCK_SIZE as u64, 0);
        assert_eq!(layout.data_offset % DBS_EXTENT_SIZE, 0);
    }
}
