//! Metadata context: a device context plus the fully loaded volume and
//! snapshot tables. Backs every management and query operation.

use chrono::Utc;
use log::debug;

use crate::constants::*;
use crate::device::DeviceContext;
use crate::error::{DbsError, DbsResult};
use crate::layout::{SnapshotRecord, VolumeRecord};

pub struct MetadataContext {
    pub device: DeviceContext,
    pub volumes: Vec<VolumeRecord>,
    pub snapshots: Vec<SnapshotRecord>,
}

impl MetadataContext {
    pub fn open(path: impl AsRef<std::path::Path>) -> DbsResult<Self> {
        let mut device = DeviceContext::open(path)?;
        let mut buf = vec![0u8; DEVICE_METADATA_SIZE];
        device.read_at(SUPERBLOCK_SIZE as u64, &mut buf)?;

        let mut volumes = Vec::with_capacity(DBS_MAX_VOLUMES);
        for i in 0..DBS_MAX_VOLUMES {
            let off = i * VOLUME_RECORD_SIZE;
            volumes.push(VolumeRecord::decode(&buf[off..off + VOLUME_RECORD_SIZE]));
        }

        let snapshots_base = VOLUME_TABLE_SIZE;
        let mut snapshots = Vec::with_capacity(DBS_MAX_SNAPSHOTS);
        for i in 0..DBS_MAX_SNAPSHOTS {
            let off = snapshots_base + i * SNAPSHOT_RECORD_SIZE;
            snapshots.push(SnapshotRecord::decode(&buf[off..off + SNAPSHOT_RECORD_SIZE]));
        }

        Ok(Self {
            device,
            volumes,
            snapshots,
        })
    }

    /// Persist both tables back to the device metadata region.
    pub fn write_back(&mut self) -> DbsResult<()> {
        let mut buf = vec![0u8; DEVICE_METADATA_SIZE];
        for (i, vol) in self.volumes.iter().enumerate() {
            let off = i * VOLUME_RECORD_SIZE;
            buf[off..off + VOLUME_RECORD_SIZE].copy_from_slice(&vol.encode());
        }
        let snapshots_base = VOLUME_TABLE_SIZE;
        for (i, snap) in self.snapshots.iter().enumerate() {
            let off = snapshots_base + i * SNAPSHOT_RECORD_SIZE;
            buf[off..off + SNAPSHOT_RECORD_SIZE].copy_from_slice(&snap.encode());
        }
        self.device.write_at(SUPERBLOCK_SIZE as u64, &buf)?;
        self.device.file.sync_data()?;
        Ok(())
    }

    /// Scan all volume slots, ignoring empty ones, for an exact name match.
    /// Returns the slot index (the volume id).
    pub fn find_volume_by_name(&self, name: &str) -> Option<usize> {
        self.volumes
            .iter()
            .enumerate()
            .find(|(_, v)| !v.is_empty() && v.volume_name == name)
            .map(|(idx, _)| idx)
    }

    /// Find the volume that owns `snapshot_id`, following child links
    /// downward when a newer snapshot has since superseded it as the
    /// volume's current snapshot. Terminates within `DBS_MAX_SNAPSHOTS`
    /// hops because the snapshot DAG is a forest rooted at current
    /// snapshots.
    pub fn find_volume_with_snapshot(&self, snapshot_id: u16) -> Option<usize> {
        if let Some(idx) = self
            .volumes
            .iter()
            .enumerate()
            .find(|(_, v)| !v.is_empty() && v.snapshot_id == snapshot_id)
            .map(|(idx, _)| idx)
        {
            return Some(idx);
        }

        let mut current = snapshot_id;
        for _ in 0..DBS_MAX_SNAPSHOTS {
            let child = self.find_child_snapshot_id(current)?;
            if let Some(idx) = self
                .volumes
                .iter()
                .enumerate()
                .find(|(_, v)| !v.is_empty() && v.snapshot_id == child)
                .map(|(idx, _)| idx)
            {
                return Some(idx);
            }
            current = child;
        }
        None
    }

    /// The unique snapshot whose `parent_snapshot_id == id`. Snapshot
    /// branching only ever happens via `clone_snapshot`, which always
    /// re-roots with `parent = 0`, so a non-cloned snapshot has at most one
    /// child; this invariant lets the lookup assume uniqueness.
    pub fn find_child_snapshot_id(&self, id: u16) -> Option<u16> {
        self.snapshots
            .iter()
            .enumerate()
            .find(|(_, s)| !s.is_empty() && s.parent_snapshot_id == id)
            .map(|(idx, _)| (idx + 1) as u16)
    }

    /// Append a new snapshot record with the given parent. Returns the new
    /// 1-based snapshot id, or `None` if the table is full.
    pub fn add_snapshot(&mut self, parent_snapshot_id: u16) -> Option<u16> {
        let slot = self.snapshots.iter().position(|s| s.is_empty())?;
        self.snapshots[slot] = SnapshotRecord {
            parent_snapshot_id,
            created_at: Utc::now().timestamp(),
        };
        debug!("allocated snapshot {} with parent {}", slot + 1, parent_snapshot_id);
        Some((slot + 1) as u16)
    }

    pub fn volume_record(&self, idx: usize) -> DbsResult<&VolumeRecord> {
        self.volumes
            .get(idx)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| DbsError::VolumeNotFound(format!("<slot {idx}>")))
    }

    pub fn snapshot_record(&self, snapshot_id: u16) -> DbsResult<&SnapshotRecord> {
        if snapshot_id == 0 {
            return Err(DbsError::SnapshotNotFound(snapshot_id));
        }
        self.snapshots
            .get(snapshot_id as usize - 1)
            .filter(|s| !s.is_empty())
            .ok_or(DbsError::SnapshotNotFound(snapshot_id))
    }

    /// Walk a snapshot chain from `head` to the root (parent 0), inclusive.
    pub fn chain_from(&self, head: u16) -> Vec<u16> {
        let mut chain = Vec::new();
        let mut current = head;
        while current != 0 {
            chain.push(current);
            current = match self.snapshots.get(current as usize - 1) {
                Some(s) if !s.is_empty() => s.parent_snapshot_id,
                _ => break,
            };
        }
        chain
    }
}
