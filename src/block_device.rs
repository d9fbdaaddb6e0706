use super::*;

use std::any::Any;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

/// A sector-addressed device. `buf.len()` is a multiple of [`SECTOR_SIZE`] and
/// selects how many consecutive sectors starting at `lba` are transferred.
///
/// Both calls block until the transfer is complete. A device that cannot
/// complete a request panics: the file system has no recovery path for it.
pub trait BlockDevice: Send + Sync + Any {
    fn read_block(&self, lba: usize, buf: &mut [u8]);
    fn write_block(&self, lba: usize, buf: &[u8]);
    /// total sectors on the device
    fn sectors(&self) -> usize;
}

fn check_request(lba: usize, len: usize, sectors: usize) {
    assert!(len % SECTOR_SIZE == 0, "partial sector transfer of {len} bytes");
    assert!(
        lba + len / SECTOR_SIZE <= sectors,
        "sector {lba} + {} beyond device end {sectors}",
        len / SECTOR_SIZE
    );
}

/// RAM-backed device.
pub struct MemDisk {
    data: Mutex<Vec<u8>>,
}

impl MemDisk {
    pub fn new(sectors: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; sectors * SECTOR_SIZE]),
        }
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, lba: usize, buf: &mut [u8]) {
        let data = self.data.lock().unwrap();
        check_request(lba, buf.len(), data.len() / SECTOR_SIZE);
        let start = lba * SECTOR_SIZE;
        buf.copy_from_slice(&data[start..start + buf.len()]);
    }

    fn write_block(&self, lba: usize, buf: &[u8]) {
        let mut data = self.data.lock().unwrap();
        check_request(lba, buf.len(), data.len() / SECTOR_SIZE);
        let start = lba * SECTOR_SIZE;
        data[start..start + buf.len()].copy_from_slice(buf);
    }

    fn sectors(&self) -> usize {
        self.data.lock().unwrap().len() / SECTOR_SIZE
    }
}

/// Device backed by a raw disk image on the host.
pub struct ImageDisk {
    file: Mutex<File>,
    sectors: usize,
}

impl ImageDisk {
    /// Open an existing image. Trailing bytes that do not fill a sector are ignored.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let sectors = file.metadata()?.len() as usize / SECTOR_SIZE;
        Ok(Self {
            file: Mutex::new(file),
            sectors,
        })
    }

    /// Create (or truncate) an image of `sectors` zeroed sectors.
    pub fn create(path: &Path, sectors: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len((sectors * SECTOR_SIZE) as u64)?;
        Ok(Self {
            file: Mutex::new(file),
            sectors,
        })
    }
}

impl BlockDevice for ImageDisk {
    fn read_block(&self, lba: usize, buf: &mut [u8]) {
        check_request(lba, buf.len(), self.sectors);
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start((lba * SECTOR_SIZE) as u64))
            .and_then(|_| file.read_exact(buf))
            .unwrap_or_else(|e| panic!("image read at sector {lba} failed: {e}"));
    }

    fn write_block(&self, lba: usize, buf: &[u8]) {
        check_request(lba, buf.len(), self.sectors);
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start((lba * SECTOR_SIZE) as u64))
            .and_then(|_| file.write_all(buf))
            .unwrap_or_else(|e| panic!("image write at sector {lba} failed: {e}"));
    }

    fn sectors(&self) -> usize {
        self.sectors
    }
}
