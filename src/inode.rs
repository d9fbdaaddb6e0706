use super::*;
use dir::FileType;
use free_space::BitmapKind;
use fs::FileSystem;
use super_block::SuperBlock;

use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Shared handle to a cached inode. Every open file or directory handle on the
/// same inode number holds a clone of the same `Arc`.
pub type InodeRef = Arc<Mutex<Inode>>;

/// inode on disk, INODE_SIZE bytes
#[repr(C)]
#[derive(Serialize, Deserialize, Default, Clone)]
struct DiskInode {
    i_no: u32,
    i_size: u32,
    /// always 0 on disk
    i_open_cnts: u32,
    /// always 0 on disk
    write_deny: u32,
    i_sectors: [u32; NDIRECT + 1],
    /// list links of the cached copy, always 0 on disk
    _tag: [u32; 2],
}

/// inode in memory
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Inode {
    pub i_no: u32,
    /// bytes of content for a file, bytes of valid entries for a directory
    pub i_size: u32,
    pub i_open_cnts: u32,
    /// set while a writer holds the file open
    pub write_deny: bool,
    /// 0..12 direct blocks, 12 the singly-indirect block. 0 means unallocated.
    pub i_sectors: [u32; NDIRECT + 1],
}

/// The two readings of `i_size`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InodeSize {
    File { size: u32 },
    Directory { entries_bytes: u32 },
}

impl InodeSize {
    pub fn bytes(self) -> u32 {
        match self {
            InodeSize::File { size } => size,
            InodeSize::Directory { entries_bytes } => entries_bytes,
        }
    }
}

impl Inode {
    pub fn new(i_no: u32) -> Self {
        Self {
            i_no,
            ..Default::default()
        }
    }

    /// `i_size` read as the kind of object the inode backs.
    pub fn size_as(&self, kind: FileType) -> InodeSize {
        match kind {
            FileType::Directory => InodeSize::Directory {
                entries_bytes: self.i_size,
            },
            _ => InodeSize::File { size: self.i_size },
        }
    }

    /// Blocks holding content, in logical order.
    pub fn used_blocks(&self) -> usize {
        (self.i_size as usize).div_ceil(BLOCK_SIZE)
    }

    fn from_disk(d: DiskInode) -> Self {
        Self {
            i_no: d.i_no,
            i_size: d.i_size,
            i_open_cnts: 0,
            write_deny: false,
            i_sectors: d.i_sectors,
        }
    }

    /// Memory-only state is dropped so a later load starts clean.
    fn to_disk(&self) -> DiskInode {
        DiskInode {
            i_no: self.i_no,
            i_size: self.i_size,
            i_sectors: self.i_sectors,
            ..Default::default()
        }
    }
}

/// Where an inode record lives inside the inode table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct InodePosition {
    /// the record straddles two sectors
    pub two_sec: bool,
    pub sec_lba: u32,
    /// byte offset inside `sec_lba`
    pub off_size: usize,
}

impl InodePosition {
    fn sectors(&self) -> usize {
        if self.two_sec {
            2
        } else {
            1
        }
    }
}

pub(crate) fn inode_locate(sb: &SuperBlock, inode_no: u32) -> InodePosition {
    assert!(inode_no < sb.inode_cnt, "inode {inode_no} out of range");
    let off = inode_no as usize * INODE_SIZE;
    let off_size = off % SECTOR_SIZE;
    InodePosition {
        two_sec: SECTOR_SIZE - off_size < INODE_SIZE,
        sec_lba: sb.inode_table_lba + (off / SECTOR_SIZE) as u32,
        off_size,
    }
}

/// inode(disk) -> mem
pub(crate) fn load_inode(disk: &disk::Disk, sb: &SuperBlock, inode_no: u32) -> Inode {
    let pos = inode_locate(sb, inode_no);
    let mut buf = vec![0u8; pos.sectors() * SECTOR_SIZE];
    disk.read(pos.sec_lba, &mut buf);
    let d: DiskInode =
        bincode::deserialize(&buf[pos.off_size..]).expect("inode table: undecodable record");
    Inode {
        i_no: inode_no,
        ..Inode::from_disk(d)
    }
}

/// Encode `inode` into an inode-table image starting at `table[0]`, as format does.
pub(crate) fn encode_inode_at(table: &mut [u8], inode: &Inode) {
    let off = inode.i_no as usize * INODE_SIZE;
    bincode::serialize_into(&mut table[off..off + INODE_SIZE], &inode.to_disk())
        .expect("inode record overflow");
}

/// The singly-indirect block: NINDIRECT block addresses filling one block.
#[derive(Serialize, Deserialize)]
struct IndirectBlock {
    #[serde(with = "addr_array")]
    addrs: [u32; NINDIRECT],
}

/// serde stops at 32-element arrays, so the table goes out as a fixed tuple.
mod addr_array {
    use crate::common::NINDIRECT;
    use serde::de::{self, SeqAccess, Visitor};
    use serde::ser::SerializeTuple;
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(addrs: &[u32; NINDIRECT], s: S) -> Result<S::Ok, S::Error> {
        let mut tuple = s.serialize_tuple(NINDIRECT)?;
        for addr in addrs {
            tuple.serialize_element(addr)?;
        }
        tuple.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u32; NINDIRECT], D::Error> {
        struct AddrVisitor;

        impl<'de> Visitor<'de> for AddrVisitor {
            type Value = [u32; NINDIRECT];

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{NINDIRECT} block addresses")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut addrs = [0u32; NINDIRECT];
                for (i, addr) in addrs.iter_mut().enumerate() {
                    *addr = seq.next_element()?.ok_or_else(|| de::Error::invalid_length(i, &self))?;
                }
                Ok(addrs)
            }
        }

        d.deserialize_tuple(NINDIRECT, AddrVisitor)
    }
}

pub(crate) fn decode_indirect(buf: &[u8]) -> [u32; NINDIRECT] {
    let block: IndirectBlock =
        bincode::deserialize(buf).expect("indirect table: undecodable block");
    block.addrs
}

pub(crate) fn encode_indirect(table: &[u32]) -> [u8; BLOCK_SIZE] {
    let mut block = IndirectBlock { addrs: [0; NINDIRECT] };
    block.addrs.copy_from_slice(table);
    let mut buf = [0u8; BLOCK_SIZE];
    bincode::serialize_into(&mut buf[..], &block).expect("indirect table overflow");
    buf
}

impl FileSystem {
    /// Find or load inode `inode_no`, bumping its open count.
    pub(crate) fn inode_open(&self, inode_no: u32) -> InodeRef {
        let mut open_inodes = self.open_inodes.lock().unwrap();
        for inode_ref in open_inodes.iter() {
            let mut inode = inode_ref.lock().unwrap();
            if inode.i_no == inode_no {
                inode.i_open_cnts += 1;
                return Arc::clone(inode_ref);
            }
        }

        let mut inode = load_inode(self.disk(), &self.sb, inode_no);
        inode.i_open_cnts = 1;
        let inode_ref = Arc::new(Mutex::new(inode));
        open_inodes.push(Arc::clone(&inode_ref));
        debug!("inode {inode_no}: loaded");
        inode_ref
    }

    /// Put a freshly created inode into the cache with an open count of 1.
    pub(crate) fn inode_install(&self, inode_ref: &InodeRef) {
        let mut open_inodes = self.open_inodes.lock().unwrap();
        inode_ref.lock().unwrap().i_open_cnts = 1;
        open_inodes.push(Arc::clone(inode_ref));
    }

    /// Drop one reference; the last one evicts the inode from the cache.
    pub(crate) fn inode_close(&self, inode_ref: InodeRef) {
        let mut open_inodes = self.open_inodes.lock().unwrap();
        let mut inode = inode_ref.lock().unwrap();
        inode.i_open_cnts -= 1;
        if inode.i_open_cnts == 0 {
            open_inodes.retain(|cached| !Arc::ptr_eq(cached, &inode_ref));
            debug!("inode {}: evicted", inode.i_no);
        }
    }

    /// # of handles on `inode_no` in the cache, 0 if it is not cached
    pub fn inode_open_count(&self, inode_no: u32) -> u32 {
        let open_inodes = self.open_inodes.lock().unwrap();
        let count = open_inodes
            .iter()
            .map(|inode_ref| inode_ref.lock().unwrap().clone())
            .find(|inode| inode.i_no == inode_no)
            .map_or(0, |inode| inode.i_open_cnts);
        count
    }

    /// inode(mem) -> disk
    pub(crate) fn inode_sync(&self, inode: &Inode) {
        let pos = inode_locate(&self.sb, inode.i_no);
        assert!(pos.sec_lba < self.sb.data_start_lba);
        let mut buf = vec![0u8; pos.sectors() * SECTOR_SIZE];
        let _guard = self.inode_table_lock.lock().unwrap();
        self.disk().read(pos.sec_lba, &mut buf);
        bincode::serialize_into(&mut buf[pos.off_size..pos.off_size + INODE_SIZE], &inode.to_disk())
            .expect("inode record overflow");
        self.disk().write(pos.sec_lba, &buf);
    }

    /// Zero the on-disk record of `inode_no`.
    fn inode_delete(&self, inode_no: u32) {
        let pos = inode_locate(&self.sb, inode_no);
        let mut buf = vec![0u8; pos.sectors() * SECTOR_SIZE];
        let _guard = self.inode_table_lock.lock().unwrap();
        self.disk().read(pos.sec_lba, &mut buf);
        buf[pos.off_size..pos.off_size + INODE_SIZE].fill(0);
        self.disk().write(pos.sec_lba, &buf);
    }

    /// Reclaim every block of `inode_no`, its inode bit and its record.
    pub(crate) fn inode_release(&self, inode_no: u32) {
        let inode_ref = self.inode_open(inode_no);
        {
            let inode = inode_ref.lock().unwrap();
            let mut lbas: Vec<u32> = self
                .all_blocks(&inode)
                .into_iter()
                .filter(|&lba| lba != 0)
                .collect();
            if inode.i_sectors[NDIRECT] != 0 {
                lbas.push(inode.i_sectors[NDIRECT]);
            }
            let bits: Vec<u32> = lbas.into_iter().map(|lba| self.block_bitmap_free(lba)).collect();
            self.bitmap_sync_bits(&bits, BitmapKind::Block);

            self.inode_bitmap_free(inode_no);
            self.bitmap_sync(inode_no, BitmapKind::Inode);
            self.inode_delete(inode_no);
            debug!("inode {inode_no}: released {} blocks", bits.len());
        }
        self.inode_close(inode_ref);
    }

    pub(crate) fn read_indirect(&self, lba: u32) -> [u32; NINDIRECT] {
        let mut buf = [0u8; BLOCK_SIZE];
        self.disk().read(lba, &mut buf);
        decode_indirect(&buf)
    }

    pub(crate) fn write_indirect(&self, lba: u32, table: &[u32]) {
        self.disk().write(lba, &encode_indirect(table));
    }

    /// Every block address of `inode` in logical order: 12 direct, then the
    /// indirect table (read once) or zeros when it is absent.
    pub(crate) fn all_blocks(&self, inode: &Inode) -> [u32; MAX_FILE_BLOCKS] {
        let mut all_blocks = [0u32; MAX_FILE_BLOCKS];
        all_blocks[..NDIRECT].copy_from_slice(&inode.i_sectors[..NDIRECT]);
        if inode.i_sectors[NDIRECT] != 0 {
            all_blocks[NDIRECT..].copy_from_slice(&self.read_indirect(inode.i_sectors[NDIRECT]));
        }
        all_blocks
    }

    /// Allocate logical blocks `from..to` of `inode` (all currently absent).
    /// The indirect table is created on first crossing of NDIRECT. The
    /// indirect table and the block bitmap reach disk before this returns; the
    /// inode itself is left for the caller to sync. On exhaustion every block
    /// taken here is given back.
    pub(crate) fn inode_grow(
        &self,
        inode: &mut Inode,
        all_blocks: &mut [u32; MAX_FILE_BLOCKS],
        from: usize,
        to: usize,
    ) -> FsResult<()> {
        assert!(to <= MAX_FILE_BLOCKS);
        let mut taken: Vec<u32> = Vec::new();
        let mut new_table = false;

        for block_idx in from..to {
            debug_assert_eq!(all_blocks[block_idx], 0);
            let lba = if block_idx >= NDIRECT && inode.i_sectors[NDIRECT] == 0 {
                self.block_bitmap_alloc().and_then(|table| {
                    inode.i_sectors[NDIRECT] = table;
                    taken.push(table);
                    new_table = true;
                    self.block_bitmap_alloc()
                })
            } else {
                self.block_bitmap_alloc()
            };
            match lba {
                Ok(lba) => {
                    all_blocks[block_idx] = lba;
                    if block_idx < NDIRECT {
                        inode.i_sectors[block_idx] = lba;
                    }
                    taken.push(lba);
                }
                Err(e) => {
                    for lba in &taken {
                        self.block_bitmap_free(*lba);
                    }
                    for block_idx in from..to {
                        all_blocks[block_idx] = 0;
                        if block_idx < NDIRECT {
                            inode.i_sectors[block_idx] = 0;
                        }
                    }
                    if new_table {
                        inode.i_sectors[NDIRECT] = 0;
                    }
                    return Err(e);
                }
            }
        }

        if to > NDIRECT {
            self.write_indirect(inode.i_sectors[NDIRECT], &all_blocks[NDIRECT..]);
        }
        let bits: Vec<u32> = taken.iter().map(|&lba| self.block_bit_idx(lba)).collect();
        self.bitmap_sync_bits(&bits, BitmapKind::Block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs::tests::mem_fs;

    #[test]
    fn disk_inode_is_fixed_size() {
        assert_eq!(
            bincode::serialized_size(&DiskInode::default()).unwrap() as usize,
            INODE_SIZE
        );
    }

    #[test]
    fn indirect_table_fills_one_block() {
        let block = IndirectBlock { addrs: [0; NINDIRECT] };
        assert_eq!(bincode::serialized_size(&block).unwrap() as usize, BLOCK_SIZE);

        let table: Vec<u32> = (0..NINDIRECT as u32).map(|i| 0x0102_0000 + i).collect();
        let buf = encode_indirect(&table);
        // little-endian u32s, no length prefix
        assert_eq!(&buf[4..8], &[0x01, 0x00, 0x02, 0x01]);
        assert_eq!(decode_indirect(&buf).as_slice(), table.as_slice());
    }

    #[test]
    fn locate_stays_inside_inode_table() {
        let fs = mem_fs(2048);
        let sb = &fs.sb;
        let mut straddling = 0;
        for inode_no in 0..sb.inode_cnt {
            let pos = inode_locate(sb, inode_no);
            let last = pos.sec_lba + pos.sectors() as u32 - 1;
            assert!(pos.sec_lba >= sb.inode_table_lba);
            assert!(last < sb.inode_table_lba + sb.inode_table_sects);
            assert!(pos.off_size < SECTOR_SIZE);
            if pos.two_sec {
                straddling += 1;
                assert!(pos.off_size + INODE_SIZE > SECTOR_SIZE);
            } else {
                assert!(pos.off_size + INODE_SIZE <= SECTOR_SIZE);
            }
        }
        assert!(straddling > 0);
    }

    #[test]
    fn straddling_record_round_trips() {
        let fs = mem_fs(2048);
        // 6 * 76 = 456, the record crosses into the next sector
        assert!(inode_locate(&fs.sb, 6).two_sec);
        let mut inode = Inode::new(6);
        inode.i_size = 1234;
        inode.i_sectors = core::array::from_fn(|i| 1000 + i as u32);
        fs.inode_sync(&inode);
        assert_eq!(load_inode(fs.disk(), &fs.sb, 6), inode);
        // neighbours are untouched
        assert_eq!(load_inode(fs.disk(), &fs.sb, 5), Inode::new(5));
        assert_eq!(load_inode(fs.disk(), &fs.sb, 7), Inode::new(7));
    }

    #[test]
    fn sync_drops_memory_only_state() {
        let fs = mem_fs(2048);
        let mut inode = Inode::new(3);
        inode.i_open_cnts = 4;
        inode.write_deny = true;
        fs.inode_sync(&inode);
        let back = load_inode(fs.disk(), &fs.sb, 3);
        assert_eq!(back.i_open_cnts, 0);
        assert!(!back.write_deny);
    }

    #[test]
    fn open_shares_and_close_evicts() {
        let fs = mem_fs(2048);
        let a = fs.inode_open(0);
        assert_eq!(fs.inode_open_count(0), 2); // the root handle holds one
        let b = fs.inode_open(0);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(fs.inode_open_count(0), 3);
        fs.inode_close(a);
        fs.inode_close(b);
        assert_eq!(fs.inode_open_count(0), 1);

        let c = fs.inode_open(9);
        assert_eq!(fs.inode_open_count(9), 1);
        fs.inode_close(c);
        assert_eq!(fs.inode_open_count(9), 0);
    }

    #[test]
    fn grow_crosses_into_indirect_table() {
        let fs = mem_fs(2048);
        let free = fs.free_block_count();
        let mut inode = Inode::new(1);
        let mut all_blocks = [0u32; MAX_FILE_BLOCKS];
        fs.inode_grow(&mut inode, &mut all_blocks, 0, 14).unwrap();
        // 14 data blocks + the table
        assert_eq!(fs.free_block_count(), free - 15);
        assert!(inode.i_sectors.iter().all(|&lba| lba != 0));
        assert_eq!(fs.all_blocks(&inode), all_blocks);
        assert!(all_blocks[14..].iter().all(|&lba| lba == 0));
    }

    #[test]
    fn grow_gives_everything_back_on_exhaustion() {
        let fs = mem_fs(620); // 7 free data blocks
        let free = fs.free_block_count();
        let mut inode = Inode::new(1);
        let mut all_blocks = [0u32; MAX_FILE_BLOCKS];
        assert_eq!(
            fs.inode_grow(&mut inode, &mut all_blocks, 0, 13),
            Err(FsError::NoFreeBlock)
        );
        assert_eq!(fs.free_block_count(), free);
        assert_eq!(inode, Inode::new(1));
        assert!(all_blocks.iter().all(|&lba| lba == 0));
    }

    #[test]
    fn release_reclaims_blocks_and_record() {
        let fs = mem_fs(2048);
        let free_blocks = fs.free_block_count();
        let free_inodes = fs.free_inode_count();

        let inode_no = fs.inode_bitmap_alloc().unwrap();
        fs.bitmap_sync(inode_no, BitmapKind::Inode);
        let mut inode = Inode::new(inode_no);
        let mut all_blocks = [0u32; MAX_FILE_BLOCKS];
        fs.inode_grow(&mut inode, &mut all_blocks, 0, 20).unwrap();
        inode.i_size = 20 * BLOCK_SIZE as u32;
        fs.inode_sync(&inode);

        fs.inode_release(inode_no);
        assert_eq!(fs.free_block_count(), free_blocks);
        assert_eq!(fs.free_inode_count(), free_inodes);
        assert_eq!(load_inode(fs.disk(), &fs.sb, inode_no), Inode::new(inode_no));
        assert_eq!(fs.inode_open_count(inode_no), 0);
    }

    #[test]
    fn size_is_tagged_by_kind() {
        let mut inode = Inode::new(2);
        inode.i_size = 48;
        assert_eq!(
            inode.size_as(FileType::Directory),
            InodeSize::Directory { entries_bytes: 48 }
        );
        assert_eq!(inode.size_as(FileType::Regular), InodeSize::File { size: 48 });
        assert_eq!(inode.size_as(FileType::Regular).bytes(), 48);
    }
}
