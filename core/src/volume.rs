//! Volume context and the block I/O path: `read`, `write`, `unmap` keyed by
//! a 64-bit logical block number, including the copy-on-write allocation on
//! first write into an inherited extent.

use log::{debug, warn};

use crate::bitmap;
use crate::constants::*;
use crate::error::{DbsError, DbsResult};
use crate::extent_map::ExtentMap;
use crate::layout::{ExtentRecord, VolumeRecord};
use crate::metadata::MetadataContext;

/// An open volume: a device context, the volume's own record, and the
/// merged extent map across its whole snapshot chain.
pub struct VolumeHandle {
    meta: MetadataContext,
    volume: VolumeRecord,
    extent_map: ExtentMap,
}

impl VolumeHandle {
    pub fn open(path: impl AsRef<std::path::Path>, volume_name: &str) -> DbsResult<Self> {
        let mut meta = MetadataContext::open(path)?;
        let idx = meta
            .find_volume_by_name(volume_name)
            .ok_or_else(|| DbsError::VolumeNotFound(volume_name.to_string()))?;
        let volume = meta.volume_record(idx)?.clone();

        let extent_map = ExtentMap::build_for_volume(&mut meta, volume.volume_size, volume.snapshot_id)?;
        debug!(
            "opened volume '{}' (current snapshot {}, {} extents populated)",
            volume.volume_name, volume.snapshot_id, extent_map.allocated_volume_extents
        );

        Ok(Self {
            meta,
            volume,
            extent_map,
        })
    }

    pub fn volume_name(&self) -> &str {
        &self.volume.volume_name
    }

    pub fn volume_size(&self) -> u64 {
        self.volume.volume_size
    }

    fn extent_for_block(&self, block: u64) -> DbsResult<u32> {
        let extent_idx = (block >> DBS_BLOCK_BITS_IN_EXTENT) as u32;
        if extent_idx >= self.extent_map.total_volume_extents {
            return Err(DbsError::BlockOutOfRange(block));
        }
        Ok(extent_idx)
    }

    fn physical_byte_offset(&self, physical_extent: u32, block: u64) -> u64 {
        let block_in_extent = block & DBS_BLOCK_MASK_IN_EXTENT;
        self.meta.device.layout.data_offset
            + (physical_extent as u64 * DBS_EXTENT_SIZE)
            + (block_in_extent * DBS_BLOCK_SIZE as u64)
    }

    pub fn read_block(&mut self, block: u64, buf: &mut [u8; DBS_BLOCK_SIZE]) -> DbsResult<()> {
        let extent_idx = self.extent_for_block(block)?;
        let record = self.extent_map.extents[extent_idx as usize];
        let block_bit = (block & DBS_BLOCK_MASK_IN_EXTENT) as u32;

        if record.is_free() || !bitmap::check_bit(&record.block_bitmap, block_bit) {
            buf.fill(0);
            return Ok(());
        }

        let offset = self.physical_byte_offset(record.physical_extent, block);
        self.meta.device.read_at(offset, buf)?;
        Ok(())
    }

    pub fn write_block(&mut self, block: u64, buf: &[u8; DBS_BLOCK_SIZE]) -> DbsResult<()> {
        let extent_idx = self.extent_for_block(block)?;
        let current_snapshot = self.volume.snapshot_id;
        let mut record = self.extent_map.extents[extent_idx as usize];
        let block_bit = (block & DBS_BLOCK_MASK_IN_EXTENT) as u32;

        // Copy-on-write point: the extent is absent, or inherited from an
        // ancestor snapshot. Allocate a fresh physical extent claimed by
        // the current snapshot before any data is written.
        if record.is_free() || record.snapshot_id != current_snapshot {
            if self.meta.device.superblock.allocated_device_extents
                >= self.meta.device.layout.total_device_extents
            {
                return Err(DbsError::OutOfSpace);
            }

            let physical_pos = self.meta.device.superblock.allocated_device_extents;
            record = ExtentRecord {
                snapshot_id: current_snapshot,
                logical_extent: extent_idx,
                physical_extent: physical_pos,
                block_bitmap: [0; DBS_EXTENT_BITMAP_WORDS],
            };
            self.write_extent_record(extent_idx, &record)?;

            self.meta.device.superblock.allocated_device_extents += 1;
            self.meta.device.write_superblock()?;

            self.extent_map.extents[extent_idx as usize] = record;
            bitmap::set_bit(&mut self.extent_map.extent_bitmap, extent_idx);
            self.extent_map.max_extent_idx = self.extent_map.max_extent_idx.max(extent_idx);
            debug!(
                "allocated physical extent {} for logical extent {} on snapshot {}",
                physical_pos, extent_idx, current_snapshot
            );
        }

        let offset = self.physical_byte_offset(record.physical_extent, block);
        self.meta.device.write_at(offset, buf)?;

        if bitmap::check_bit(&record.block_bitmap, block_bit) {
            return Ok(());
        }

        bitmap::set_bit(&mut record.block_bitmap, block_bit);
        self.extent_map.extents[extent_idx as usize] = record;
        self.write_extent_record(extent_idx, &record)?;
        Ok(())
    }

    pub fn unmap_block(&mut self, block: u64) -> DbsResult<()> {
        let extent_idx = self.extent_for_block(block)?;
        let mut record = self.extent_map.extents[extent_idx as usize];
        let block_bit = (block & DBS_BLOCK_MASK_IN_EXTENT) as u32;

        if record.is_free() || !bitmap::check_bit(&record.block_bitmap, block_bit) {
            return Ok(());
        }

        bitmap::unset_bit(&mut record.block_bitmap, block_bit);
        if bitmap::is_empty(&record.block_bitmap) {
            warn!(
                "releasing extent {} (physical {}) on unmap: bitmap now empty",
                extent_idx, record.physical_extent
            );
            record.snapshot_id = 0;
        }
        self.extent_map.extents[extent_idx as usize] = record;
        self.write_extent_record(extent_idx, &record)?;
        Ok(())
    }

    /// Persist one extent record at its physical slot. On disk the stored
    /// `extent_pos` is the logical index, not the physical one.
    fn write_extent_record(&mut self, logical_idx: u32, record: &ExtentRecord) -> DbsResult<()> {
        let offset = self.meta.device.layout.extent_offset
            + (record.physical_extent as u64 * EXTENT_RECORD_SIZE as u64);
        let mut on_disk = *record;
        on_disk.logical_extent = logical_idx;
        self.meta.device.write_at(offset, &on_disk.encode())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::DeviceLayout;
    use crate::management;
    use crate::test_support::make_device;

    fn payload(byte: u8) -> [u8; DBS_BLOCK_SIZE] {
        [byte; DBS_BLOCK_SIZE]
    }

    #[test]
    fn fresh_volume_reads_zero() {
        let tmp = make_device(8 * 1024 * 1024);
        management::create_volume(tmp.path(), "v", 1024 * 1024).unwrap();
        let mut vol = VolumeHandle::open(tmp.path(), "v").unwrap();
        let mut buf = payload(0xAA);
        vol.read_block(0, &mut buf).unwrap();
        assert_eq!(buf, payload(0));
    }

    #[test]
    fn write_then_read_round_trips() {
        let tmp = make_device(8 * 1024 * 1024);
        management::create_volume(tmp.path(), "v", 1024 * 1024).unwrap();
        let mut vol = VolumeHandle::open(tmp.path(), "v").unwrap();
        vol.write_block(0, &payload(0x41)).unwrap();

        let mut buf = payload(0);
        vol.read_block(0, &mut buf).unwrap();
        assert_eq!(buf, payload(0x41));

        vol.read_block(1, &mut buf).unwrap();
        assert_eq!(buf, payload(0));
    }

    #[test]
    fn writing_allocates_one_extent_per_distinct_region() {
        let tmp = make_device(32 * 1024 * 1024);
        management::create_volume(tmp.path(), "v", 4 * 1024 * 1024).unwrap();
        let mut vol = VolumeHandle::open(tmp.path(), "v").unwrap();
        vol.write_block(0, &payload(1)).unwrap();
        vol.write_block(256, &payload(2)).unwrap();
        vol.write_block(512, &payload(3)).unwrap();
        assert_eq!(vol.meta.device.superblock.allocated_device_extents, 3);
    }

    #[test]
    fn second_write_to_same_extent_does_not_reallocate() {
        let tmp = make_device(8 * 1024 * 1024);
        management::create_volume(tmp.path(), "v", 1024 * 1024).unwrap();
        let mut vol = VolumeHandle::open(tmp.path(), "v").unwrap();
        vol.write_block(0, &payload(1)).unwrap();
        vol.write_block(1, &payload(2)).unwrap();
        assert_eq!(vol.meta.device.superblock.allocated_device_extents, 1);
    }

    #[test]
    fn unmap_never_written_block_is_noop() {
        let tmp = make_device(8 * 1024 * 1024);
        management::create_volume(tmp.path(), "v", 1024 * 1024).unwrap();
        let mut vol = VolumeHandle::open(tmp.path(), "v").unwrap();
        vol.unmap_block(5).unwrap();
        let mut buf = payload(0xFF);
        vol.read_block(5, &mut buf).unwrap();
        assert_eq!(buf, payload(0));
    }

    #[test]
    fn unmap_sole_block_frees_the_extent() {
        let tmp = make_device(8 * 1024 * 1024);
        management::create_volume(tmp.path(), "v", 1024 * 1024).unwrap();
        let mut vol = VolumeHandle::open(tmp.path(), "v").unwrap();
        vol.write_block(0, &payload(1)).unwrap();
        vol.unmap_block(0).unwrap();

        let mut buf = payload(0xFF);
        vol.read_block(0, &mut buf).unwrap();
        assert_eq!(buf, payload(0));
        assert_eq!(vol.meta.device.superblock.allocated_device_extents, 1);
    }

    #[test]
    fn write_past_device_capacity_fails_while_already_allocated_extent_keeps_working() {
        // A device sized for exactly one physical extent, but a volume
        // large enough to span two logical extents: the first write
        // allocates the device's only extent, the second has nowhere to
        // go, and a further write into the already-allocated extent must
        // still succeed.
        let extent_offset = DeviceLayout::compute(0).extent_offset;
        let tmp = make_device(extent_offset + DBS_EXTENT_SIZE);
        management::create_volume(tmp.path(), "v", 2 * DBS_EXTENT_SIZE).unwrap();
        let mut vol = VolumeHandle::open(tmp.path(), "v").unwrap();

        vol.write_block(0, &payload(1)).unwrap();
        assert_eq!(vol.meta.device.superblock.allocated_device_extents, 1);

        let err = vol.write_block(256, &payload(2)).unwrap_err();
        assert!(matches!(err, DbsError::OutOfSpace));

        vol.write_block(1, &payload(3)).unwrap();
        assert_eq!(vol.meta.device.superblock.allocated_device_extents, 1);
    }

    #[test]
    fn out_of_range_block_fails() {
        let tmp = make_device(8 * 1024 * 1024);
        management::create_volume(tmp.path(), "v", DBS_EXTENT_SIZE).unwrap();
        let mut vol = VolumeHandle::open(tmp.path(), "v").unwrap();
        let mut buf = payload(0);
        let err = vol.read_block(1 << 20, &mut buf).unwrap_err();
        assert!(matches!(err, DbsError::BlockOutOfRange(_)));
    }
}
