use core::mem::size_of;

/// Signature stored in the superblock of every formatted partition.
pub const FS_MAGIC: u32 = 0x19780506;

/// sector size
pub const SECTOR_SIZE: usize = 512;

/// block size, one block is one sector
pub const BLOCK_SIZE: usize = SECTOR_SIZE;

/// bitmap bits per sector
pub const BITS_PER_SECTOR: usize = SECTOR_SIZE * 8;

/// max # of files (inodes) per partition
pub const MAX_FILES_PER_PART: usize = 4096;

/// direct blocks in inode
pub const NDIRECT: usize = 12;

/// addresses held by the singly-indirect block
pub const NINDIRECT: usize = BLOCK_SIZE / size_of::<u32>();

/// max # of data blocks a file can have
pub const MAX_FILE_BLOCKS: usize = NDIRECT + NINDIRECT;

/// max file size in bytes
pub const MAX_FILE_SIZE: usize = MAX_FILE_BLOCKS * BLOCK_SIZE;

/// Directory entries store names in a fixed field of this many bytes.
pub const MAX_FILE_NAME_LEN: usize = 16;

pub const MAX_PATH_LEN: usize = 512;

/// size of the global open-file table
pub const MAX_FILE_OPEN: usize = 32;

/// slots 0, 1, 2 of the open-file table belong to stdin, stdout, stderr
pub const FIRST_FREE_FD: usize = 3;

/// root i-number
pub const ROOT_INODE_NO: u32 = 0;

/// on-disk inode record, see `inode::DiskInode`
pub const INODE_SIZE: usize = 76;

/// on-disk directory entry, see `dir::DirEntry`
pub const DIR_ENTRY_SIZE: usize = 24;

/// directory entries per block
pub const DIR_ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / DIR_ENTRY_SIZE;

/// Number of sectors needed to hold `bytes` bytes.
pub(crate) fn sectors_for(bytes: usize) -> usize {
    bytes.div_ceil(SECTOR_SIZE)
}
