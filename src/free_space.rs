use super::*;
use bitmap::Bitmap;
use fs::FileSystem;

use log::debug;
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitmapKind {
    Inode,
    Block,
}

impl FileSystem {
    fn bitmap(&self, kind: BitmapKind) -> (&Mutex<Bitmap>, u32) {
        match kind {
            BitmapKind::Inode => (&self.inode_bitmap, self.sb.inode_bitmap_lba),
            BitmapKind::Block => (&self.block_bitmap, self.sb.block_bitmap_lba),
        }
    }

    /// Reserve an inode in memory. Inode numbers are bitmap indices.
    pub(crate) fn inode_bitmap_alloc(&self) -> FsResult<u32> {
        let mut bitmap = self.inode_bitmap.lock().unwrap();
        let bit_idx = bitmap.scan(1).ok_or(FsError::NoFreeInode)?;
        bitmap.set(bit_idx, true);
        debug!("inode bitmap: alloc {bit_idx}");
        Ok(bit_idx as u32)
    }

    /// Reserve a data block in memory, returning its lba.
    pub(crate) fn block_bitmap_alloc(&self) -> FsResult<u32> {
        let mut bitmap = self.block_bitmap.lock().unwrap();
        let bit_idx = bitmap.scan(1).ok_or(FsError::NoFreeBlock)?;
        bitmap.set(bit_idx, true);
        debug!("block bitmap: alloc {bit_idx}");
        Ok(self.sb.data_start_lba + bit_idx as u32)
    }

    pub(crate) fn inode_bitmap_free(&self, inode_no: u32) {
        self.inode_bitmap.lock().unwrap().set(inode_no as usize, false);
        debug!("inode bitmap: free {inode_no}");
    }

    /// Release the block at `lba` in memory, returning its bit index for a later sync.
    pub(crate) fn block_bitmap_free(&self, lba: u32) -> u32 {
        let bit_idx = self.block_bit_idx(lba);
        self.block_bitmap.lock().unwrap().set(bit_idx as usize, false);
        debug!("block bitmap: free {bit_idx}");
        bit_idx
    }

    pub(crate) fn block_bit_idx(&self, lba: u32) -> u32 {
        assert!(
            lba >= self.sb.data_start_lba,
            "lba {lba} is not a data block"
        );
        lba - self.sb.data_start_lba
    }

    /// Write the single bitmap sector that holds `bit_idx`.
    pub(crate) fn bitmap_sync(&self, bit_idx: u32, kind: BitmapKind) {
        self.bitmap_sync_range(bit_idx, bit_idx, kind);
    }

    /// Write every bitmap sector spanning bits `[start, end]`, each once.
    pub(crate) fn bitmap_sync_range(&self, start: u32, end: u32, kind: BitmapKind) {
        debug_assert!(start <= end);
        let (bitmap, lba) = self.bitmap(kind);
        let bitmap = bitmap.lock().unwrap();
        let first_sec = start as usize / BITS_PER_SECTOR;
        let last_sec = end as usize / BITS_PER_SECTOR;
        let bytes = &bitmap.as_bytes()[first_sec * SECTOR_SIZE..(last_sec + 1) * SECTOR_SIZE];
        self.disk().write(lba + first_sec as u32, bytes);
    }

    /// Sync the bitmap sectors touched by a batch of bit indices.
    pub(crate) fn bitmap_sync_bits(&self, bits: &[u32], kind: BitmapKind) {
        if let (Some(&start), Some(&end)) = (bits.iter().min(), bits.iter().max()) {
            self.bitmap_sync_range(start, end, kind);
        }
    }

    pub fn free_inode_count(&self) -> usize {
        self.inode_bitmap.lock().unwrap().count_free()
    }

    pub fn free_block_count(&self) -> usize {
        self.block_bitmap.lock().unwrap().count_free()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs::tests::mem_fs;

    fn disk_bitmap(fs: &FileSystem, kind: BitmapKind) -> Vec<u8> {
        let (lba, sects) = match kind {
            BitmapKind::Inode => (fs.sb.inode_bitmap_lba, fs.sb.inode_bitmap_sects),
            BitmapKind::Block => (fs.sb.block_bitmap_lba, fs.sb.block_bitmap_sects),
        };
        let mut buf = vec![0u8; sects as usize * SECTOR_SIZE];
        fs.disk().read(lba, &mut buf);
        buf
    }

    #[test]
    fn freed_lowest_bit_is_reused() {
        let fs = mem_fs(2048);
        let lba = fs.block_bitmap_alloc().unwrap();
        assert_eq!(lba, fs.sb.data_start_lba + 1); // bit 0 is the root directory
        let bit = fs.block_bitmap_free(lba);
        assert_eq!(bit, 1);
        assert_eq!(fs.block_bitmap_alloc().unwrap(), lba);

        let inode_no = fs.inode_bitmap_alloc().unwrap();
        assert_eq!(inode_no, 1);
        fs.inode_bitmap_free(inode_no);
        assert_eq!(fs.inode_bitmap_alloc().unwrap(), inode_no);
    }

    #[test]
    fn alloc_is_memory_only_until_synced() {
        let fs = mem_fs(2048);
        let inode_no = fs.inode_bitmap_alloc().unwrap();
        assert_eq!(disk_bitmap(&fs, BitmapKind::Inode)[0], 0b01);
        fs.bitmap_sync(inode_no, BitmapKind::Inode);
        assert_eq!(disk_bitmap(&fs, BitmapKind::Inode)[0], 0b11);
    }

    #[test]
    fn range_sync_covers_every_spanned_sector() {
        // enough data sectors for two block-bitmap sectors
        let fs = mem_fs(6000);
        assert_eq!(fs.sb.block_bitmap_sects, 2);
        let far = BITS_PER_SECTOR as u32 + 5;
        {
            let mut bitmap = fs.block_bitmap.lock().unwrap();
            bitmap.set(3, true);
            bitmap.set(far as usize, true);
        }
        fs.bitmap_sync_bits(&[far, 3], BitmapKind::Block);
        let on_disk = disk_bitmap(&fs, BitmapKind::Block);
        assert_eq!(on_disk[0], 0b1001);
        assert_eq!(on_disk[SECTOR_SIZE] & (1 << 5), 1 << 5);
    }

    #[test]
    fn exhaustion_is_reported() {
        let fs = mem_fs(620);
        let free = fs.free_block_count();
        for _ in 0..free {
            fs.block_bitmap_alloc().unwrap();
        }
        assert_eq!(fs.block_bitmap_alloc(), Err(FsError::NoFreeBlock));
    }
}
