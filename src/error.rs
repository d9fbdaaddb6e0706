use super::*;

use thiserror::Error;

/// Recoverable failures of file system operations.
///
/// On-disk corruption and device failures are not represented here: they halt
/// with a panic.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FsError {
    #[error("no free inode left on the partition")]
    NoFreeInode,
    #[error("no free block left on the partition")]
    NoFreeBlock,
    #[error("exceed max open files")]
    TooManyOpenFiles,
    #[error("directory is full")]
    DirectoryFull,
    #[error("file would exceed the maximum size of {} bytes", MAX_FILE_SIZE)]
    FileTooLarge,
    #[error("partition of {0} sectors is too small for a file system")]
    PartitionTooSmall(u32),
    #[error("{0}: no such file or directory")]
    NotFound(String),
    #[error("{0}: already exists")]
    AlreadyExists(String),
    #[error("{0}: is a directory")]
    IsDirectory(String),
    #[error("{0}: not a directory")]
    NotDirectory(String),
    #[error("{0}: resource busy")]
    Busy(String),
    #[error("{0}: directory not empty")]
    NotEmpty(String),
    #[error("{0}: file name too long")]
    NameTooLong(String),
    #[error("{0}: invalid path")]
    InvalidPath(String),
    #[error("bad file descriptor {0}")]
    BadDescriptor(usize),
    #[error("file descriptor {0} is not open for writing")]
    NotWritable(usize),
    #[error("invalid seek to offset {0}")]
    InvalidSeek(i64),
}

pub type FsResult<T> = Result<T, FsError>;
