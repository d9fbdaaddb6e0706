//! Disk layout of a partition:
//! [ boot sector | super block | block bitmap | inode bitmap | inode table | data blocks ]
//!
//! Two disks hang off one IDE channel and share its lock, so requests to either
//! drive of a channel are serialized one at a time.

use super::*;
use block_device::BlockDevice;

use log::trace;
use std::sync::{Arc, Mutex};

pub struct IdeChannel {
    name: String,
    /// serializes every request on this channel
    lock: Mutex<()>,
}

impl IdeChannel {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            lock: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

pub struct Disk {
    name: String,
    channel: Arc<IdeChannel>,
    blk_dev: Arc<dyn BlockDevice>,
}

impl Disk {
    pub fn new(name: &str, channel: Arc<IdeChannel>, blk_dev: Arc<dyn BlockDevice>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            channel,
            blk_dev,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> &IdeChannel {
        &self.channel
    }

    pub fn sectors(&self) -> usize {
        self.blk_dev.sectors()
    }

    /// disk -> mem, `buf.len() / SECTOR_SIZE` sectors starting at `lba`
    pub fn read(&self, lba: u32, buf: &mut [u8]) {
        let _guard = self.channel.lock.lock().unwrap();
        trace!("{}: read lba {lba} x{}", self.name, buf.len() / SECTOR_SIZE);
        self.blk_dev.read_block(lba as usize, buf);
    }

    /// mem -> disk
    pub fn write(&self, lba: u32, buf: &[u8]) {
        let _guard = self.channel.lock.lock().unwrap();
        trace!("{}: write lba {lba} x{}", self.name, buf.len() / SECTOR_SIZE);
        self.blk_dev.write_block(lba as usize, buf);
    }
}

/// A contiguous run of sectors on a disk holding one file system.
#[derive(Clone)]
pub struct Partition {
    name: String,
    start_lba: u32,
    sec_cnt: u32,
    disk: Arc<Disk>,
}

impl Partition {
    pub fn new(name: &str, disk: Arc<Disk>, start_lba: u32, sec_cnt: u32) -> Self {
        assert!(
            start_lba as usize + sec_cnt as usize <= disk.sectors(),
            "partition {name} runs past the end of disk {}",
            disk.name()
        );
        Self {
            name: name.to_string(),
            start_lba,
            sec_cnt,
            disk,
        }
    }

    /// The whole device as a single partition, on a channel of its own.
    pub fn whole(name: &str, blk_dev: Arc<dyn BlockDevice>) -> Self {
        let sectors = blk_dev.sectors() as u32;
        let disk = Disk::new(name, IdeChannel::new("ide0"), blk_dev);
        Self::new(name, disk, 0, sectors)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start_lba(&self) -> u32 {
        self.start_lba
    }

    pub fn sec_cnt(&self) -> u32 {
        self.sec_cnt
    }

    pub fn disk(&self) -> &Disk {
        &self.disk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_device::MemDisk;

    #[test]
    fn drives_on_one_channel_share_it() {
        let channel = IdeChannel::new("ide0");
        let master = Disk::new("hda", channel.clone(), Arc::new(MemDisk::new(8)));
        let slave = Disk::new("hdb", channel.clone(), Arc::new(MemDisk::new(8)));
        assert!(std::ptr::eq(master.channel(), slave.channel()));

        master.write(3, &[7u8; SECTOR_SIZE]);
        let mut buf = [0u8; SECTOR_SIZE];
        slave.read(3, &mut buf);
        assert_eq!(buf, [0u8; SECTOR_SIZE]);
        master.read(3, &mut buf);
        assert_eq!(buf, [7u8; SECTOR_SIZE]);
    }

    #[test]
    #[should_panic(expected = "runs past the end")]
    fn partition_must_fit_on_disk() {
        let disk = Disk::new("hda", IdeChannel::new("ide0"), Arc::new(MemDisk::new(8)));
        Partition::new("hda1", disk, 4, 8);
    }
}
