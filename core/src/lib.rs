pub mod bitmap;
pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod extent_map;
pub mod layout;
pub mod management;
pub mod metadata;
pub mod query;
pub mod volume;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::DbsConfig;
pub use constants::{DBS_BLOCK_SIZE, DBS_EXTENT_SIZE, DBS_MAX_SNAPSHOTS, DBS_MAX_VOLUMES};
pub use device::DeviceContext;
pub use error::{DbsError, DbsResult};
pub use management::{
    clone_snapshot, create_snapshot, create_volume, delete_snapshot, delete_volume, init_device,
    rename_volume, vacuum_device,
};
pub use metadata::MetadataContext;
pub use query::{device_info, snapshot_info, volume_info, DeviceInfo, SnapshotInfo, VolumeInfo};
pub use volume::VolumeHandle;
