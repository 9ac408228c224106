//! Management operations: init device, create/rename/delete volumes,
//! create/clone/delete snapshots. See specification §4.7–§4.9 for the
//! clone and delete algorithms.

use std::path::Path;

use log::info;

use crate::constants::*;
use crate::device::DeviceContext;
use crate::error::{DbsError, DbsResult};
use crate::extent_map::ExtentMap;
use crate::layout::{ExtentRecord, VolumeRecord};
use crate::metadata::MetadataContext;

pub fn init_device(path: impl AsRef<Path>) -> DbsResult<()> {
    DeviceContext::init(path)
}

pub fn vacuum_device(_path: impl AsRef<Path>) -> DbsResult<()> {
    Err(DbsError::Unimplemented("vacuum"))
}

fn validate_name(name: &str) -> DbsResult<()> {
    if name.as_bytes().len() > DBS_MAX_VOLUME_NAME_SIZE {
        return Err(DbsError::NameTooLong(DBS_MAX_VOLUME_NAME_SIZE));
    }
    Ok(())
}

pub fn create_volume(path: impl AsRef<Path>, name: &str, size: u64) -> DbsResult<()> {
    validate_name(name)?;
    let mut meta = MetadataContext::open(path)?;

    if meta.find_volume_by_name(name).is_some() {
        return Err(DbsError::VolumeExists(name.to_string()));
    }
    let slot = meta
        .volumes
        .iter()
        .position(|v| v.is_empty())
        .ok_or(DbsError::VolumeTableFull)?;

    let snapshot_id = meta.add_snapshot(0).ok_or(DbsError::SnapshotTableFull)?;
    meta.volumes[slot] = VolumeRecord {
        snapshot_id,
        volume_size: size,
        volume_name: name.to_string(),
    };
    meta.write_back()?;
    info!("created volume '{name}' ({size} bytes, snapshot {snapshot_id})");
    Ok(())
}

pub fn rename_volume(path: impl AsRef<Path>, name: &str, new_name: &str) -> DbsResult<()> {
    validate_name(new_name)?;
    let mut meta = MetadataContext::open(path)?;
    let idx = meta
        .find_volume_by_name(name)
        .ok_or_else(|| DbsError::VolumeNotFound(name.to_string()))?;
    if meta.find_volume_by_name(new_name).is_some() {
        return Err(DbsError::VolumeExists(new_name.to_string()));
    }
    meta.volumes[idx].volume_name = new_name.to_string();
    meta.write_back()?;
    info!("renamed volume '{name}' to '{new_name}'");
    Ok(())
}

pub fn create_snapshot(path: impl AsRef<Path>, name: &str) -> DbsResult<u16> {
    let mut meta = MetadataContext::open(path)?;
    let idx = meta
        .find_volume_by_name(name)
        .ok_or_else(|| DbsError::VolumeNotFound(name.to_string()))?;

    // add_snapshot(parent = old current) then re-point the volume at the
    // new head; this correctly links the new head to the old one.
    let old_head = meta.volumes[idx].snapshot_id;
    let snapshot_id = meta.add_snapshot(old_head).ok_or(DbsError::SnapshotTableFull)?;
    meta.volumes[idx].snapshot_id = snapshot_id;
    meta.write_back()?;
    info!("created snapshot {snapshot_id} of volume '{name}' (parent {old_head})");
    Ok(snapshot_id)
}

/// Clone `source_snapshot_id` into a brand-new, independent volume. Shared
/// blocks are physically duplicated so deleting the source chain afterward
/// cannot affect the clone (see specification §4.7).
pub fn clone_snapshot(path: impl AsRef<Path>, new_name: &str, source_snapshot_id: u16) -> DbsResult<()> {
    validate_name(new_name)?;
    let mut meta = MetadataContext::open(path)?;

    if meta.find_volume_by_name(new_name).is_some() {
        return Err(DbsError::VolumeExists(new_name.to_string()));
    }
    let source_volume_idx = meta
        .find_volume_with_snapshot(source_snapshot_id)
        .ok_or(DbsError::SnapshotNotFound(source_snapshot_id))?;
    let volume_size = meta.volume_record(source_volume_idx)?.volume_size;

    let source_map = ExtentMap::build_for_volume(&mut meta, volume_size, source_snapshot_id)?;

    let dest_slot = meta
        .volumes
        .iter()
        .position(|v| v.is_empty())
        .ok_or(DbsError::VolumeTableFull)?;
    let dest_snapshot_id = meta.add_snapshot(0).ok_or(DbsError::SnapshotTableFull)?;

    let remaining_capacity =
        meta.device.layout.total_device_extents - meta.device.superblock.allocated_device_extents;
    if source_map.allocated_volume_extents > remaining_capacity {
        return Err(DbsError::OutOfSpace);
    }

    let mut buf = vec![0u8; DBS_EXTENT_SIZE as usize];
    let mut logical_idx = 0u32;
    while logical_idx <= source_map.max_extent_idx {
        if !source_map.is_populated(logical_idx) {
            logical_idx += 1;
            continue;
        }
        let source_record = source_map.extents[logical_idx as usize];
        let source_offset =
            meta.device.layout.data_offset + (source_record.physical_extent as u64 * DBS_EXTENT_SIZE);
        meta.device.read_at(source_offset, &mut buf)?;

        let dest_physical = meta.device.superblock.allocated_device_extents;
        let dest_offset = meta.device.layout.data_offset + (dest_physical as u64 * DBS_EXTENT_SIZE);
        meta.device.write_at(dest_offset, &buf)?;

        let dest_record = ExtentRecord {
            snapshot_id: dest_snapshot_id,
            logical_extent: logical_idx,
            physical_extent: dest_physical,
            block_bitmap: source_record.block_bitmap,
        };
        let record_offset =
            meta.device.layout.extent_offset + (dest_physical as u64 * EXTENT_RECORD_SIZE as u64);
        meta.device.write_at(record_offset, &dest_record.encode())?;

        meta.device.superblock.allocated_device_extents += 1;
        logical_idx += 1;
    }

    meta.volumes[dest_slot] = VolumeRecord {
        snapshot_id: dest_snapshot_id,
        volume_size,
        volume_name: new_name.to_string(),
    };
    meta.device.write_superblock()?;
    meta.write_back()?;
    info!(
        "cloned snapshot {source_snapshot_id} into volume '{new_name}' ({} extents copied)",
        source_map.allocated_volume_extents
    );
    Ok(())
}

/// Free every extent owned by any snapshot in the volume's chain, zero the
/// snapshot records, and zero the volume slot. Physical extents are not
/// compacted; `allocated_device_extents` is left unchanged (see §4.8 and
/// the reserved vacuum operation).
pub fn delete_volume(path: impl AsRef<Path>, name: &str) -> DbsResult<()> {
    let mut meta = MetadataContext::open(path)?;
    let idx = meta
        .find_volume_by_name(name)
        .ok_or_else(|| DbsError::VolumeNotFound(name.to_string()))?;
    let volume_size = meta.volume_record(idx)?.volume_size;
    let chain = meta.chain_from(meta.volumes[idx].snapshot_id);

    for &snapshot_id in &chain {
        free_snapshot_extents(&mut meta, volume_size, snapshot_id)?;
        meta.snapshots[snapshot_id as usize - 1].created_at = 0;
    }
    meta.volumes[idx].snapshot_id = 0;
    meta.write_back()?;
    info!("deleted volume '{name}' ({} snapshots freed)", chain.len());
    Ok(())
}

fn free_snapshot_extents(meta: &mut MetadataContext, volume_size: u64, snapshot_id: u16) -> DbsResult<()> {
    let map = ExtentMap::build_for_snapshot(&mut meta.device, volume_size, snapshot_id)?;
    let mut logical_idx = 0u32;
    while logical_idx <= map.max_extent_idx {
        if !map.is_populated(logical_idx) {
            logical_idx += 1;
            continue;
        }
        let record = map.extents[logical_idx as usize];
        let freed = ExtentRecord {
            snapshot_id: 0,
            ..record
        };
        let offset =
            meta.device.layout.extent_offset + (record.physical_extent as u64 * EXTENT_RECORD_SIZE as u64);
        let mut on_disk = freed;
        on_disk.logical_extent = logical_idx;
        meta.device.write_at(offset, &on_disk.encode())?;
        logical_idx += 1;
    }
    Ok(())
}

/// Delete a non-current snapshot, reparenting its child onto its parent and
/// handing the child ownership of any extent the target wrote that the
/// child hasn't overwritten (see §4.9).
pub fn delete_snapshot(path: impl AsRef<Path>, snapshot_id: u16) -> DbsResult<()> {
    let mut meta = MetadataContext::open(path)?;

    meta.snapshot_record(snapshot_id)?;
    if meta.volumes.iter().any(|v| !v.is_empty() && v.snapshot_id == snapshot_id) {
        return Err(DbsError::CurrentSnapshotUndeletable);
    }
    let volume_idx = meta
        .find_volume_with_snapshot(snapshot_id)
        .ok_or(DbsError::SnapshotNotFound(snapshot_id))?;
    let volume_size = meta.volume_record(volume_idx)?.volume_size;

    let child_id = meta
        .find_child_snapshot_id(snapshot_id)
        .ok_or(DbsError::SnapshotNotFound(snapshot_id))?;

    let target_map = ExtentMap::build_for_snapshot(&mut meta.device, volume_size, snapshot_id)?;
    let child_map = ExtentMap::build_for_snapshot(&mut meta.device, volume_size, child_id)?;

    let mut logical_idx = 0u32;
    while logical_idx <= target_map.max_extent_idx {
        if !target_map.is_populated(logical_idx) {
            logical_idx += 1;
            continue;
        }
        let target_record = target_map.extents[logical_idx as usize];
        let offset = meta.device.layout.extent_offset
            + (target_record.physical_extent as u64 * EXTENT_RECORD_SIZE as u64);

        let new_owner = if child_map.is_populated(logical_idx) {
            // The child already wrote this extent itself; the target's
            // copy is now unreferenced.
            0
        } else {
            // The child inherits ownership of the target's extent.
            child_id
        };
        let mut on_disk = ExtentRecord {
            snapshot_id: new_owner,
            ..target_record
        };
        on_disk.logical_extent = logical_idx;
        meta.device.write_at(offset, &on_disk.encode())?;
        logical_idx += 1;
    }

    let target_parent = meta.snapshot_record(snapshot_id)?.parent_snapshot_id;
    meta.snapshots[child_id as usize - 1].parent_snapshot_id = target_parent;
    meta.snapshots[snapshot_id as usize - 1] = crate::layout::SnapshotRecord::empty();
    meta.write_back()?;
    info!("deleted snapshot {snapshot_id}, child {child_id} reparented to {target_parent}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query;
    use crate::test_support::make_device;
    use crate::volume::VolumeHandle;

    fn payload(byte: u8) -> [u8; DBS_BLOCK_SIZE] {
        [byte; DBS_BLOCK_SIZE]
    }

    #[test]
    fn create_volume_rejects_duplicate_names() {
        let tmp = make_device(8 * 1024 * 1024);
        create_volume(tmp.path(), "v", 1024 * 1024).unwrap();
        let err = create_volume(tmp.path(), "v", 1024 * 1024).unwrap_err();
        assert!(matches!(err, DbsError::VolumeExists(_)));
    }

    #[test]
    fn create_volume_table_full() {
        let tmp = make_device(512 * 1024 * 1024);
        for i in 0..DBS_MAX_VOLUMES {
            create_volume(tmp.path(), &format!("v{i}"), 4096).unwrap();
        }
        let err = create_volume(tmp.path(), "overflow", 4096).unwrap_err();
        assert!(matches!(err, DbsError::VolumeTableFull));
    }

    #[test]
    fn snapshot_then_write_diverges_from_clone() {
        let tmp = make_device(32 * 1024 * 1024);
        create_volume(tmp.path(), "v", 4 * 1024 * 1024).unwrap();

        {
            let mut vol = VolumeHandle::open(tmp.path(), "v").unwrap();
            vol.write_block(0, &payload(0x41)).unwrap();
        }

        let pre_snapshot_id = query::volume_info(tmp.path())
            .unwrap()
            .into_iter()
            .find(|v| v.volume_name == "v")
            .unwrap()
            .snapshot_id;

        create_snapshot(tmp.path(), "v").unwrap();
        {
            let mut vol = VolumeHandle::open(tmp.path(), "v").unwrap();
            vol.write_block(0, &payload(0x42)).unwrap();
        }

        clone_snapshot(tmp.path(), "c", pre_snapshot_id).unwrap();

        let mut clone = VolumeHandle::open(tmp.path(), "c").unwrap();
        let mut buf = payload(0);
        clone.read_block(0, &mut buf).unwrap();
        assert_eq!(buf, payload(0x41));

        let mut live = VolumeHandle::open(tmp.path(), "v").unwrap();
        live.read_block(0, &mut buf).unwrap();
        assert_eq!(buf, payload(0x42));
    }

    #[test]
    fn clone_survives_deletion_of_source_volume() {
        let tmp = make_device(32 * 1024 * 1024);
        create_volume(tmp.path(), "v", 4 * 1024 * 1024).unwrap();
        {
            let mut vol = VolumeHandle::open(tmp.path(), "v").unwrap();
            vol.write_block(0, &payload(9)).unwrap();
        }
        let head = query::volume_info(tmp.path()).unwrap()[0].snapshot_id;
        clone_snapshot(tmp.path(), "c", head).unwrap();
        delete_volume(tmp.path(), "v").unwrap();

        let mut clone = VolumeHandle::open(tmp.path(), "c").unwrap();
        let mut buf = payload(0);
        clone.read_block(0, &mut buf).unwrap();
        assert_eq!(buf, payload(9));
    }

    #[test]
    fn delete_snapshot_rejects_current_head() {
        let tmp = make_device(8 * 1024 * 1024);
        create_volume(tmp.path(), "v", 1024 * 1024).unwrap();
        let head = query::volume_info(tmp.path()).unwrap()[0].snapshot_id;
        let err = delete_snapshot(tmp.path(), head).unwrap_err();
        assert!(matches!(err, DbsError::CurrentSnapshotUndeletable));
    }

    #[test]
    fn delete_middle_snapshot_preserves_child_read_view() {
        let tmp = make_device(32 * 1024 * 1024);
        create_volume(tmp.path(), "v", 4 * 1024 * 1024).unwrap();
        let root = query::volume_info(tmp.path()).unwrap()[0].snapshot_id;

        let middle = create_snapshot(tmp.path(), "v").unwrap();
        {
            let mut vol = VolumeHandle::open(tmp.path(), "v").unwrap();
            vol.write_block(100, &payload(7)).unwrap();
        }
        create_snapshot(tmp.path(), "v").unwrap();

        delete_snapshot(tmp.path(), middle).unwrap();
        assert!(meta_still_has(&tmp, root));

        let mut vol = VolumeHandle::open(tmp.path(), "v").unwrap();
        let mut buf = payload(0);
        vol.read_block(100, &mut buf).unwrap();
        assert_eq!(buf, payload(7));
    }

    fn meta_still_has(tmp: &tempfile::NamedTempFile, snapshot_id: u16) -> bool {
        let meta = MetadataContext::open(tmp.path()).unwrap();
        meta.snapshot_record(snapshot_id).is_ok()
    }
}
