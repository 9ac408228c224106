//! In-memory extent maps: resolve a logical extent index to the physical
//! extent that currently serves it, for a single snapshot or for an entire
//! volume (snapshot plus every ancestor).

use log::debug;

use crate::bitmap;
use crate::constants::*;
use crate::device::DeviceContext;
use crate::error::DbsResult;
use crate::layout::ExtentRecord;
use crate::metadata::MetadataContext;

pub struct ExtentMap {
    pub total_volume_extents: u32,
    pub allocated_volume_extents: u32,
    pub max_extent_idx: u32,
    /// One bit per logical index: set iff `extents[idx]` is populated.
    pub extent_bitmap: Vec<u32>,
    pub extents: Vec<ExtentRecord>,
}

impl ExtentMap {
    fn new(volume_size: u64) -> Self {
        let total_volume_extents = div_round_up(volume_size, DBS_EXTENT_SIZE) as u32;
        let bitmap_words = div_round_up(total_volume_extents as u64, 32) as usize;
        Self {
            total_volume_extents,
            allocated_volume_extents: 0,
            max_extent_idx: 0,
            extent_bitmap: vec![0u32; bitmap_words.max(1)],
            extents: vec![ExtentRecord::free(); total_volume_extents as usize],
        }
    }

    pub fn is_populated(&self, logical_idx: u32) -> bool {
        (logical_idx as usize) < self.extents.len() && bitmap::check_bit(&self.extent_bitmap, logical_idx)
    }

    fn place(&mut self, logical_idx: u32, mut record: ExtentRecord, physical_pos: u32) {
        record.physical_extent = physical_pos;
        self.allocated_volume_extents += 1;
        self.max_extent_idx = self.max_extent_idx.max(logical_idx);
        bitmap::set_bit(&mut self.extent_bitmap, logical_idx);
        self.extents[logical_idx as usize] = record;
    }

    /// Build the extent map for exactly one snapshot (§4.4): scan the
    /// on-device extent table in batches, keeping only records owned by
    /// `snapshot_id`.
    pub fn build_for_snapshot(
        device: &mut DeviceContext,
        volume_size: u64,
        snapshot_id: u16,
    ) -> DbsResult<Self> {
        let mut map = Self::new(volume_size);

        let extent_batch = device.config.extent_batch.max(1);
        let mut extents_remaining =
            device.superblock.allocated_device_extents.min(device.layout.total_device_extents) as u64;
        let mut batch_start: u32 = 0;
        let mut buf = vec![0u8; EXTENT_RECORD_SIZE * extent_batch];

        while extents_remaining > 0 {
            let batch_size = extents_remaining.min(extent_batch as u64) as u32;
            let batch_bytes = batch_size as usize * EXTENT_RECORD_SIZE;
            let batch_offset =
                device.layout.extent_offset + (batch_start as u64 * EXTENT_RECORD_SIZE as u64);
            device.read_at(batch_offset, &mut buf[..batch_bytes])?;

            for i in 0..batch_size {
                let off = i as usize * EXTENT_RECORD_SIZE;
                let record = ExtentRecord::decode(&buf[off..off + EXTENT_RECORD_SIZE]);
                if record.snapshot_id == snapshot_id {
                    // On disk, extent_pos is the logical index; the batch
                    // position is the physical position on device.
                    let logical_idx = record.logical_extent;
                    let physical_pos = batch_start + i;
                    map.place(logical_idx, record, physical_pos);
                }
            }

            extents_remaining -= batch_size as u64;
            batch_start += batch_size;
        }

        Ok(map)
    }

    /// Build the full-volume extent map (§4.5): the current snapshot's map
    /// merged with every ancestor's, nearest writer wins.
    pub fn build_for_volume(
        meta: &mut MetadataContext,
        volume_size: u64,
        current_snapshot: u16,
    ) -> DbsResult<Self> {
        let mut map = Self::build_for_snapshot(&mut meta.device, volume_size, current_snapshot)?;

        let mut ancestor = meta.snapshot_record(current_snapshot)?.parent_snapshot_id;
        while ancestor != 0 {
            let ancestor_map = Self::build_for_snapshot(&mut meta.device, volume_size, ancestor)?;
            map.merge_missing_from(&ancestor_map);
            ancestor = meta.snapshot_record(ancestor)?.parent_snapshot_id;
        }

        debug!(
            "built full-volume extent map: {} extents populated across the chain",
            map.allocated_volume_extents
        );
        Ok(map)
    }

    /// Copy every logical index present in `other` but absent here. Must be
    /// called nearest-ancestor-first so "nearest writer wins" holds.
    fn merge_missing_from(&mut self, other: &Self) {
        let mut logical_idx = 0u32;
        while logical_idx <= other.max_extent_idx {
            if bitmap::word_is_empty(&other.extent_bitmap, logical_idx) {
                logical_idx += 32;
                continue;
            }
            for i in 0..32 {
                let idx = logical_idx + i;
                if idx > other.max_extent_idx {
                    break;
                }
                if other.is_populated(idx) && !self.is_populated(idx) {
                    let record = other.extents[idx as usize];
                    self.place(idx, record, record.physical_extent);
                }
            }
            logical_idx += 32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::make_device;

    #[test]
    fn snapshot_map_starts_empty_for_fresh_snapshot() {
        let tmp = make_device(8 * 1024 * 1024);
        let mut device = DeviceContext::open(tmp.path()).unwrap();
        let map = ExtentMap::build_for_snapshot(&mut device, 4 * DBS_EXTENT_SIZE, 1).unwrap();
        assert_eq!(map.allocated_volume_extents, 0);
        assert_eq!(map.total_volume_extents, 4);
    }

    #[test]
    fn merge_missing_from_prefers_existing_entries() {
        let volume_size = 4 * DBS_EXTENT_SIZE;
        let mut current = ExtentMap::new(volume_size);
        let mut rec = ExtentRecord::free();
        rec.snapshot_id = 2;
        current.place(1, rec, 10);

        let mut ancestor = ExtentMap::new(volume_size);
        let mut anc_rec = ExtentRecord::free();
        anc_rec.snapshot_id = 1;
        ancestor.place(0, anc_rec, 5);
        ancestor.place(1, ExtentRecord { snapshot_id: 1, ..ExtentRecord::free() }, 6);

        current.merge_missing_from(&ancestor);

        // idx 0 came from the ancestor
        assert!(current.is_populated(0));
        assert_eq!(current.extents[0].snapshot_id, 1);
        // idx 1 stayed owned by the current snapshot (nearest writer wins)
        assert_eq!(current.extents[1].snapshot_id, 2);
    }
}
