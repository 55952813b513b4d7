use thiserror::Error;

/// All errors surfaced by the engine. Disk errors are never retried
/// internally; they pass through as `Io`.
#[derive(Debug, Error)]
pub enum Errors {
    #[error("the key is empty")]
    KeyIsEmpty,

    #[error("key not found in database")]
    KeyNotFound,

    #[error("data file not found for a keydir position")]
    DataFileNotFound,

    #[error("failed to update the keydir index")]
    IndexUpdateFailed,

    #[error("database directory path is empty")]
    DirPathIsEmpty,

    #[error("data file size must be greater than zero")]
    DataFileSizeTooSmall,

    #[error("data file merge ratio must be between 0 and 1")]
    InvalidMergeRatio,

    #[error("database directory may be corrupted")]
    DataDirectoryCorrupted,

    #[error("invalid crc, log record may be corrupted")]
    InvalidRecordCrc,

    #[error("batch exceeds the maximum number of records")]
    ExceedMaxBatchNum,

    #[error("another merge is in progress")]
    MergeInProgress,

    #[error("reclaimable size does not reach the merge ratio")]
    MergeRatioUnreached,

    #[error("not enough disk space to hold the merged data")]
    NotEnoughSpaceForMerge,

    #[error("database directory is in use by another process")]
    DatabaseIsInUse,

    /// Scan sentinel: a read past the last record of a data file.
    #[error("read past end of data file")]
    ReadDataFileEof,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Errors>;
