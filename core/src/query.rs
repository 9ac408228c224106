//! Read-only queries over a device: device info, volume list, snapshot
//! list for a volume. These never mutate on-disk state.

use std::path::Path;

use crate::error::{DbsError, DbsResult};
use crate::metadata::MetadataContext;

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub version: u32,
    pub device_size: u64,
    pub total_device_extents: u32,
    pub allocated_device_extents: u32,
    pub volume_count: usize,
}

#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub volume_name: String,
    pub volume_size: u64,
    pub snapshot_id: u16,
    pub created_at: i64,
    pub snapshot_count: usize,
}

#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub snapshot_id: u16,
    pub parent_snapshot_id: Option<u16>,
    pub created_at: i64,
}

pub fn device_info(path: impl AsRef<Path>) -> DbsResult<DeviceInfo> {
    let meta = MetadataContext::open(path)?;
    Ok(DeviceInfo {
        version: meta.device.superblock.version,
        device_size: meta.device.superblock.device_size,
        total_device_extents: meta.device.layout.total_device_extents,
        allocated_device_extents: meta.device.superblock.allocated_device_extents,
        volume_count: meta.volumes.iter().filter(|v| !v.is_empty()).count(),
    })
}

pub fn volume_info(path: impl AsRef<Path>) -> DbsResult<Vec<VolumeInfo>> {
    let meta = MetadataContext::open(path)?;
    Ok(meta
        .volumes
        .iter()
        .filter(|v| !v.is_empty())
        .map(|v| {
            let created_at = meta
                .snapshots
                .get(v.snapshot_id as usize - 1)
                .map(|s| s.created_at)
                .unwrap_or(0);
            VolumeInfo {
                volume_name: v.volume_name.clone(),
                volume_size: v.volume_size,
                snapshot_id: v.snapshot_id,
                created_at,
                snapshot_count: meta.chain_from(v.snapshot_id).len(),
            }
        })
        .collect())
}

pub fn snapshot_info(path: impl AsRef<Path>, volume_name: &str) -> DbsResult<Vec<SnapshotInfo>> {
    let meta = MetadataContext::open(path)?;
    let idx = meta
        .find_volume_by_name(volume_name)
        .ok_or_else(|| DbsError::VolumeNotFound(volume_name.to_string()))?;
    let head = meta.volumes[idx].snapshot_id;

    Ok(meta
        .chain_from(head)
        .into_iter()
        .map(|id| {
            let record = meta.snapshots[id as usize - 1];
            SnapshotInfo {
                snapshot_id: id,
                parent_snapshot_id: (record.parent_snapshot_id != 0).then_some(record.parent_snapshot_id),
                created_at: record.created_at,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::management;
    use crate::test_support::make_device;

    #[test]
    fn device_info_reflects_volume_count() {
        let tmp = make_device(8 * 1024 * 1024);
        management::create_volume(tmp.path(), "a", 4096).unwrap();
        management::create_volume(tmp.path(), "b", 4096).unwrap();
        let info = device_info(tmp.path()).unwrap();
        assert_eq!(info.volume_count, 2);
        assert_eq!(info.allocated_device_extents, 0);
    }

    #[test]
    fn snapshot_info_walks_chain_to_root() {
        let tmp = make_device(8 * 1024 * 1024);
        management::create_volume(tmp.path(), "v", 4096).unwrap();
        management::create_snapshot(tmp.path(), "v").unwrap();
        management::create_snapshot(tmp.path(), "v").unwrap();

        let snapshots = snapshot_info(tmp.path(), "v").unwrap();
        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots.last().unwrap().parent_snapshot_id, None);
    }

    #[test]
    fn volume_info_reports_snapshot_count() {
        let tmp = make_device(8 * 1024 * 1024);
        management::create_volume(tmp.path(), "v", 4096).unwrap();
        management::create_snapshot(tmp.path(), "v").unwrap();
        let infos = volume_info(tmp.path()).unwrap();
        assert_eq!(infos[0].snapshot_count, 2);
    }
}
