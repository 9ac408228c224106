use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbsError {
    #[error("device not initialized")]
    NotInitialized,

    #[error("metadata version mismatch: expected {expected:#010x}, found {found:#010x}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(u16),

    #[error("volume already exists: {0}")]
    VolumeExists(String),

    #[error("maximum volume count reached")]
    VolumeTableFull,

    #[error("maximum snapshot count reached")]
    SnapshotTableFull,

    #[error("device is out of extents")]
    OutOfSpace,

    #[error("cannot delete the current snapshot of a volume; delete the volume instead")]
    CurrentSnapshotUndeletable,

    #[error("block index {0} is out of range for this volume")]
    BlockOutOfRange(u64),

    #[error("volume name exceeds the maximum length of {0} bytes")]
    NameTooLong(usize),

    #[error("operation not implemented: {0}")]
    Unimplemented(&'static str),

    #[error("device is empty")]
    EmptyDevice,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DbsResult<T> = Result<T, DbsError>;
