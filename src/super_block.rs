use super::*;
use disk::Partition;

use log::info;
use serde::{Deserialize, Serialize};

/// Sector 1 of every partition. Written by format, read once at mount.
#[repr(C)]
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq, Eq)]
pub struct SuperBlock {
    /// Must be FS_MAGIC
    pub magic: u32,
    /// sectors in the partition
    pub sec_cnt: u32,
    /// Number of inodes
    pub inode_cnt: u32,
    /// first sector of the partition
    pub part_lba_base: u32,

    pub block_bitmap_lba: u32,
    pub block_bitmap_sects: u32,

    pub inode_bitmap_lba: u32,
    pub inode_bitmap_sects: u32,

    pub inode_table_lba: u32,
    pub inode_table_sects: u32,

    /// first data block, the root directory lives here
    pub data_start_lba: u32,
    pub root_inode_no: u32,
    pub dir_entry_size: u32,
}

impl SuperBlock {
    /// Lay out a new file system on `part`.
    pub fn new(part: &Partition) -> FsResult<Self> {
        let boot_sector_sects = 1;
        let super_block_sects = 1;
        let inode_bitmap_sects = MAX_FILES_PER_PART.div_ceil(BITS_PER_SECTOR) as u32;
        let inode_table_sects = sectors_for(INODE_SIZE * MAX_FILES_PER_PART) as u32;
        let used_sects = boot_sector_sects + super_block_sects + inode_bitmap_sects + inode_table_sects;

        let sec_cnt = part.sec_cnt();
        if sec_cnt <= used_sects + 1 {
            return Err(FsError::PartitionTooSmall(sec_cnt));
        }
        let free_sects = sec_cnt - used_sects;

        // the bitmap is carved out of the free sectors it describes
        let block_bitmap_sects = free_sects.div_ceil(BITS_PER_SECTOR as u32);
        let block_bitmap_bit_len = free_sects - block_bitmap_sects;
        let block_bitmap_sects = block_bitmap_bit_len.div_ceil(BITS_PER_SECTOR as u32);

        let part_lba_base = part.start_lba();
        let block_bitmap_lba = part_lba_base + boot_sector_sects + super_block_sects;
        let inode_bitmap_lba = block_bitmap_lba + block_bitmap_sects;
        let inode_table_lba = inode_bitmap_lba + inode_bitmap_sects;

        Ok(Self {
            magic: FS_MAGIC,
            sec_cnt,
            inode_cnt: MAX_FILES_PER_PART as u32,
            part_lba_base,
            block_bitmap_lba,
            block_bitmap_sects,
            inode_bitmap_lba,
            inode_bitmap_sects,
            inode_table_lba,
            inode_table_sects,
            data_start_lba: inode_table_lba + inode_table_sects,
            root_inode_no: ROOT_INODE_NO,
            dir_entry_size: DIR_ENTRY_SIZE as u32,
        })
    }

    /// super block(disk) -> mem
    pub fn read(part: &Partition) -> Self {
        let mut buf = [0u8; SECTOR_SIZE];
        part.disk().read(part.start_lba() + 1, &mut buf);
        bincode::deserialize(&buf).expect("super block: undecodable sector")
    }

    /// mem -> super block(disk), padded to a full sector
    pub fn write(&self, part: &Partition) {
        let mut buf = [0u8; SECTOR_SIZE];
        bincode::serialize_into(&mut buf[..], self).expect("super block: exceeds a sector");
        part.disk().write(self.part_lba_base + 1, &buf);
    }

    pub fn is_formatted(&self) -> bool {
        self.magic == FS_MAGIC
    }

    /// Sectors of the data region, which is also the number of usable block-bitmap bits.
    pub fn data_sects(&self) -> u32 {
        self.part_lba_base + self.sec_cnt - self.data_start_lba
    }

    pub fn log_layout(&self, part_name: &str) {
        info!(
            "{part_name} info: magic {:#x}, part_lba_base {:#x}, all_sectors {:#x}, inode_cnt {:#x}",
            self.magic, self.part_lba_base, self.sec_cnt, self.inode_cnt
        );
        info!(
            "{part_name} layout: block_bitmap {:#x}+{:#x}, inode_bitmap {:#x}+{:#x}, inode_table {:#x}+{:#x}, data_start {:#x}",
            self.block_bitmap_lba,
            self.block_bitmap_sects,
            self.inode_bitmap_lba,
            self.inode_bitmap_sects,
            self.inode_table_lba,
            self.inode_table_sects,
            self.data_start_lba
        );
    }
}
