mod bitmap; // fixed-length bit vector
mod block_device; // sector devices
mod common;
mod dir; // directory entries
mod disk; // channels, disks, partitions
mod error;
mod file; // open-file table
mod free_space; // inode / block bitmaps
mod fs; // file system
mod inode;
mod path; // path resolution
mod super_block;
mod task;

pub use bitmap::Bitmap;
pub use block_device::{BlockDevice, ImageDisk, MemDisk};
pub use common::*;
pub use dir::{Dir, DirEntry, FileType};
pub use disk::{Disk, IdeChannel, Partition};
pub use error::{FsError, FsResult};
pub use file::{OpenFlags, Whence};
pub use free_space::BitmapKind;
pub use fs::{FileSystem, Stat};
pub use inode::{Inode, InodeSize};
pub use path::{path_depth, path_parse, wash_path, PathSearchRecord};
pub use super_block::SuperBlock;
pub use task::Task;
