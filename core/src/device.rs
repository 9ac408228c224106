//! Device context: opens the backing device, validates the superblock, and
//! derives the region layout. See the specification's "Device context and
//! layout" section.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use fs2::FileExt;
use log::{debug, error};

use crate::config::DbsConfig;
use crate::constants::*;
use crate::error::{DbsError, DbsResult};
use crate::layout::{DeviceLayout, Superblock};

/// A handle to an opened, validated device plus its derived layout.
///
/// Unless `config.advisory_lock` is disabled, holds an advisory exclusive
/// lock on the underlying file for its whole lifetime; the lock (and the
/// file descriptor) are released on `Drop`. Opening the same device from a
/// second `DeviceContext`, in this process or another, is not supported
/// with the lock enabled — see the specification's concurrency section.
#[derive(Debug)]
pub struct DeviceContext {
    pub(crate) file: File,
    pub layout: DeviceLayout,
    pub superblock: Superblock,
    pub config: DbsConfig,
}

impl DeviceContext {
    /// Open an already-initialised device: read and validate the
    /// superblock, then derive the region layout from it.
    pub fn open(path: impl AsRef<Path>) -> DbsResult<Self> {
        Self::open_with_config(path, DbsConfig::from_env())
    }

    pub fn open_with_config(path: impl AsRef<Path>, config: DbsConfig) -> DbsResult<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        if config.advisory_lock {
            file.try_lock_exclusive().map_err(|e| {
                error!("failed to acquire exclusive lock on {}: {e}", path.display());
                DbsError::Io(e)
            })?;
        }

        let mut buf = [0u8; SUPERBLOCK_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf)?;
        let superblock = Superblock::decode(&buf)?;

        let layout = DeviceLayout::compute(superblock.device_size);
        debug!(
            "opened device {}: size={} extent_offset={} data_offset={} total_extents={}",
            path.display(),
            superblock.device_size,
            layout.extent_offset,
            layout.data_offset,
            layout.total_device_extents
        );

        Ok(Self {
            file,
            layout,
            superblock,
            config,
        })
    }

    /// Format a raw file or block device: zero the metadata and extent
    /// regions, then write the superblock last so a crash mid-format is
    /// detected as "not initialised" on the next open.
    pub fn init(path: impl AsRef<Path>) -> DbsResult<()> {
        Self::init_with_config(path, DbsConfig::from_env())
    }

    pub fn init_with_config(path: impl AsRef<Path>, config: DbsConfig) -> DbsResult<()> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        if config.advisory_lock {
            file.try_lock_exclusive()?;
        }

        let device_size = file.metadata()?.len();
        if device_size == 0 {
            return Err(DbsError::EmptyDevice);
        }

        let superblock = Superblock::new(device_size);
        let layout = DeviceLayout::compute(device_size);

        let empty_batch = vec![0u8; EXTENT_RECORD_SIZE * config.extent_batch];
        let mut offset = 0u64;
        while offset < layout.metadata_size {
            let chunk = (layout.metadata_size - offset).min(empty_batch.len() as u64) as usize;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&empty_batch[..chunk])?;
            offset += chunk as u64;
        }
        if config.fsync_barriers {
            file.sync_data()?;
        }

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&superblock.encode())?;
        if config.fsync_barriers {
            file.sync_data()?;
        }

        debug!(
            "initialised device {} ({} bytes, {} extents)",
            path.display(),
            device_size,
            layout.total_device_extents
        );
        Ok(())
    }

    pub fn write_superblock(&mut self) -> DbsResult<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.superblock.encode())?;
        if self.config.fsync_barriers {
            self.file.sync_data()?;
        }
        Ok(())
    }

    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> DbsResult<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> DbsResult<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::make_device;

    #[test]
    fn open_rejects_uninitialised_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(1 << 20).unwrap();
        let err = DeviceContext::open(tmp.path()).unwrap_err();
        assert!(matches!(err, DbsError::NotInitialized));
    }

    #[test]
    fn init_then_open_round_trips_layout() {
        let tmp = make_device(16 * 1024 * 1024);
        let ctx = DeviceContext::open(tmp.path()).unwrap();
        assert_eq!(ctx.superblock.allocated_device_extents, 0);
        assert_eq!(ctx.superblock.device_size, 16 * 1024 * 1024);
    }

    #[test]
    fn init_rejects_empty_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let err = DeviceContext::init(tmp.path()).unwrap_err();
        assert!(matches!(err, DbsError::EmptyDevice));
    }
}
