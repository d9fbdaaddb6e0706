use super::*;
use free_space::BitmapKind;
use fs::FileSystem;
use inode::InodeRef;

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[repr(u32)]
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FileType {
    /// free slot
    #[default]
    Unknown = 0,
    Regular = 1,
    Directory = 2,
}

/// directory entry on disk, DIR_ENTRY_SIZE bytes
#[repr(C)]
#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct DirEntry {
    /// not NUL-terminated when the name fills the field
    filename: [u8; MAX_FILE_NAME_LEN],
    pub i_no: u32,
    pub f_type: FileType,
}

impl DirEntry {
    pub fn new(name: &str, i_no: u32, f_type: FileType) -> FsResult<Self> {
        let bytes = name.as_bytes();
        if bytes.len() > MAX_FILE_NAME_LEN {
            return Err(FsError::NameTooLong(name.to_string()));
        }
        let mut filename = [0u8; MAX_FILE_NAME_LEN];
        filename[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            filename,
            i_no,
            f_type,
        })
    }

    /// name bytes, up to the first NUL or the end of the field
    pub fn name_bytes(&self) -> &[u8] {
        let len = self
            .filename
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_FILE_NAME_LEN);
        &self.filename[..len]
    }

    pub fn name(&self) -> String {
        String::from_utf8_lossy(self.name_bytes()).into_owned()
    }

    pub fn is_free(&self) -> bool {
        self.f_type == FileType::Unknown
    }

    fn is_dot(&self) -> bool {
        self.name_bytes() == b"."
    }

    fn is_dot_dot(&self) -> bool {
        self.name_bytes() == b".."
    }

    /// The DIR_ENTRIES_PER_BLOCK slots of a directory block.
    pub(crate) fn decode_block(buf: &[u8]) -> Vec<DirEntry> {
        buf.chunks_exact(DIR_ENTRY_SIZE)
            .map(|raw| bincode::deserialize(raw).expect("directory block: bad entry"))
            .collect()
    }

    pub(crate) fn encode_into(&self, buf: &mut [u8], slot: usize) {
        let off = slot * DIR_ENTRY_SIZE;
        bincode::serialize_into(&mut buf[off..off + DIR_ENTRY_SIZE], self)
            .expect("directory entry overflow");
    }
}

impl core::fmt::Debug for DirEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?} -> {} ({:?})", self.name(), self.i_no, self.f_type)
    }
}

/// Open directory handle: a shared inode plus a readdir cursor.
pub struct Dir {
    pub(crate) inode: InodeRef,
    /// bytes of valid entries already returned by readdir
    pub(crate) dir_pos: u32,
    /// the root handle opened at mount, never closed
    resident: bool,
}

impl Dir {
    pub(crate) fn resident(inode: InodeRef) -> Self {
        Self {
            inode,
            dir_pos: 0,
            resident: true,
        }
    }

    pub fn inode_no(&self) -> u32 {
        self.inode.lock().unwrap().i_no
    }

    pub fn is_resident(&self) -> bool {
        self.resident
    }

    /// bytes of valid entries, "." and ".." included
    pub fn entries_bytes(&self) -> u32 {
        self.inode.lock().unwrap().i_size
    }
}

impl FileSystem {
    pub(crate) fn dir_open(&self, inode_no: u32) -> Dir {
        Dir {
            inode: self.inode_open(inode_no),
            dir_pos: 0,
            resident: false,
        }
    }

    pub(crate) fn dir_close(&self, dir: Dir) {
        if dir.resident {
            return;
        }
        self.inode_close(dir.inode);
    }

    fn read_dir_block(&self, lba: u32) -> Vec<DirEntry> {
        let mut buf = [0u8; BLOCK_SIZE];
        self.disk().read(lba, &mut buf);
        DirEntry::decode_block(&buf)
    }

    /// Look `name` up in `dir`, scanning direct blocks then indirect ones.
    pub(crate) fn search_dir_entry(&self, dir: &Dir, name: &str) -> Option<DirEntry> {
        let inode = dir.inode.lock().unwrap().clone();
        self.all_blocks(&inode)
            .into_iter()
            .filter(|&lba| lba != 0)
            .flat_map(|lba| self.read_dir_block(lba))
            .find(|entry| !entry.is_free() && entry.name_bytes() == name.as_bytes())
    }

    /// Put `entry` into the first free slot of `parent`, growing it by one
    /// block (and the indirect table when needed) if every block is full.
    /// Fails with `AlreadyExists` if the name is already listed.
    /// The parent inode is updated in memory only; the caller syncs it.
    pub(crate) fn sync_dir_entry(&self, parent: &Dir, entry: &DirEntry) -> FsResult<()> {
        let mut inode = parent.inode.lock().unwrap();
        debug_assert_eq!(inode.i_size as usize % DIR_ENTRY_SIZE, 0);
        let mut all_blocks = self.all_blocks(&inode);
        let mut buf = [0u8; BLOCK_SIZE];

        // a racing create may have taken the name since the caller looked it up
        let taken = all_blocks
            .iter()
            .filter(|&&lba| lba != 0)
            .flat_map(|&lba| self.read_dir_block(lba))
            .any(|old| !old.is_free() && old.name_bytes() == entry.name_bytes());
        if taken {
            warn!("dir {}: {} already exists", inode.i_no, entry.name());
            return Err(FsError::AlreadyExists(entry.name()));
        }

        for block_idx in 0..MAX_FILE_BLOCKS {
            if all_blocks[block_idx] == 0 {
                if let Err(e) = self.inode_grow(&mut inode, &mut all_blocks, block_idx, block_idx + 1) {
                    error!("alloc block bitmap for sync_dir_entry failed: {e}");
                    return Err(e);
                }
                buf.fill(0);
                entry.encode_into(&mut buf, 0);
                self.disk().write(all_blocks[block_idx], &buf);
                inode.i_size += DIR_ENTRY_SIZE as u32;
                debug!("dir {}: {entry:?} in new block {block_idx}", inode.i_no);
                return Ok(());
            }

            self.disk().read(all_blocks[block_idx], &mut buf);
            let entries = DirEntry::decode_block(&buf);
            if let Some(slot) = entries.iter().position(DirEntry::is_free) {
                entry.encode_into(&mut buf, slot);
                self.disk().write(all_blocks[block_idx], &buf);
                inode.i_size += DIR_ENTRY_SIZE as u32;
                debug!("dir {}: {entry:?} in block {block_idx} slot {slot}", inode.i_no);
                return Ok(());
            }
        }
        error!("directory {} is full", inode.i_no);
        Err(FsError::DirectoryFull)
    }

    /// Remove the entry for `inode_no` from `dir` and persist the directory inode.
    /// A non-first block losing its last entry goes back to the free list, and
    /// so does the indirect table once it holds no addresses.
    pub(crate) fn delete_dir_entry(&self, dir: &Dir, inode_no: u32) -> bool {
        let mut inode = dir.inode.lock().unwrap();
        let mut all_blocks = self.all_blocks(&inode);
        let mut buf = [0u8; BLOCK_SIZE];

        for block_idx in 0..MAX_FILE_BLOCKS {
            let lba = all_blocks[block_idx];
            if lba == 0 {
                continue;
            }
            self.disk().read(lba, &mut buf);
            let entries = DirEntry::decode_block(&buf);

            let mut is_dir_first_block = false;
            let mut dir_entry_cnt = 0;
            let mut found = None;
            for (slot, entry) in entries.iter().enumerate() {
                if entry.is_free() {
                    continue;
                }
                if entry.is_dot() {
                    is_dir_first_block = true;
                    continue;
                }
                if entry.is_dot_dot() {
                    continue;
                }
                dir_entry_cnt += 1;
                if entry.i_no == inode_no {
                    assert!(
                        found.is_none(),
                        "dir {}: more than one entry for inode {inode_no}",
                        inode.i_no
                    );
                    found = Some(slot);
                }
            }
            let Some(slot) = found else {
                continue;
            };

            if dir_entry_cnt == 1 && !is_dir_first_block {
                let mut bits = vec![self.block_bitmap_free(lba)];
                all_blocks[block_idx] = 0;
                if block_idx < NDIRECT {
                    inode.i_sectors[block_idx] = 0;
                } else if all_blocks[NDIRECT..].iter().all(|&lba| lba == 0) {
                    bits.push(self.block_bitmap_free(inode.i_sectors[NDIRECT]));
                    inode.i_sectors[NDIRECT] = 0;
                } else {
                    self.write_indirect(inode.i_sectors[NDIRECT], &all_blocks[NDIRECT..]);
                }
                self.bitmap_sync_bits(&bits, BitmapKind::Block);
                debug!("dir {}: block {block_idx} reclaimed", inode.i_no);
            } else {
                buf[slot * DIR_ENTRY_SIZE..(slot + 1) * DIR_ENTRY_SIZE].fill(0);
                self.disk().write(lba, &buf);
            }

            inode.i_size -= DIR_ENTRY_SIZE as u32;
            self.inode_sync(&inode);
            return true;
        }
        false
    }

    /// Next valid entry after the cursor, skipping free slots.
    pub(crate) fn dir_read(&self, dir: &mut Dir) -> Option<DirEntry> {
        let inode = dir.inode.lock().unwrap().clone();
        if dir.dir_pos >= inode.i_size {
            return None;
        }
        let mut cur_dir_entry_pos = 0;
        for lba in self.all_blocks(&inode).into_iter().filter(|&lba| lba != 0) {
            for entry in self.read_dir_block(lba) {
                if entry.is_free() {
                    continue;
                }
                if cur_dir_entry_pos < dir.dir_pos {
                    cur_dir_entry_pos += DIR_ENTRY_SIZE as u32;
                    continue;
                }
                dir.dir_pos += DIR_ENTRY_SIZE as u32;
                return Some(entry);
            }
        }
        None
    }

    /// only "." and ".." left
    pub(crate) fn dir_is_empty(&self, dir: &Dir) -> bool {
        dir.inode.lock().unwrap().i_size == 2 * DIR_ENTRY_SIZE as u32
    }

    /// Unlink the empty directory `child` from `parent` and free it.
    pub(crate) fn dir_remove(&self, parent: &Dir, child: &Dir) {
        let child_no = {
            let inode = child.inode.lock().unwrap();
            assert!(
                inode.i_sectors[1..].iter().all(|&lba| lba == 0),
                "dir {}: empty directory owns more than its first block",
                inode.i_no
            );
            inode.i_no
        };
        let deleted = self.delete_dir_entry(parent, child_no);
        assert!(deleted, "dir {}: no entry for child {child_no}", parent.inode_no());
        self.inode_release(child_no);
    }

    /// Inode number stored in the ".." entry of directory `child_no`.
    pub(crate) fn get_parent_dir_inode_nr(&self, child_no: u32) -> u32 {
        let inode_ref = self.inode_open(child_no);
        let first_block = inode_ref.lock().unwrap().i_sectors[0];
        self.inode_close(inode_ref);
        let entries = self.read_dir_block(first_block);
        assert!(
            entries[1].is_dot_dot(),
            "dir {child_no}: second entry is not \"..\""
        );
        entries[1].i_no
    }

    /// Name under which directory `parent_no` lists `child_no`.
    pub(crate) fn get_child_dir_name(&self, parent_no: u32, child_no: u32) -> Option<String> {
        let parent = self.dir_open(parent_no);
        let inode = parent.inode.lock().unwrap().clone();
        let name = self
            .all_blocks(&inode)
            .into_iter()
            .filter(|&lba| lba != 0)
            .flat_map(|lba| self.read_dir_block(lba))
            .find(|entry| {
                entry.f_type == FileType::Directory
                    && entry.i_no == child_no
                    && !entry.is_dot()
                    && !entry.is_dot_dot()
            })
            .map(|entry| entry.name());
        self.dir_close(parent);
        name
    }

    /// The root directory handle; closing it is a no-op.
    pub fn root_dir(&self) -> Dir {
        Dir::resident(Arc::clone(self.root_inode()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs::tests::mem_fs;

    fn fill(fs: &FileSystem, dir: &Dir, from: u32, count: u32) {
        for i in from..from + count {
            let entry = DirEntry::new(&format!("f{i}"), 100 + i, FileType::Regular).unwrap();
            fs.sync_dir_entry(dir, &entry).unwrap();
        }
        fs.inode_sync(&dir.inode.lock().unwrap());
    }

    #[test]
    fn entry_is_fixed_size() {
        assert_eq!(
            bincode::serialized_size(&DirEntry::default()).unwrap() as usize,
            DIR_ENTRY_SIZE
        );
        assert_eq!(DIR_ENTRIES_PER_BLOCK, 21);
    }

    #[test]
    fn full_length_name_is_not_terminated() {
        let name = "abcdefghijklmnop";
        let entry = DirEntry::new(name, 4, FileType::Regular).unwrap();
        assert_eq!(entry.name_bytes(), name.as_bytes());
        assert_eq!(
            DirEntry::new("abcdefghijklmnopq", 4, FileType::Regular),
            Err(FsError::NameTooLong("abcdefghijklmnopq".to_string()))
        );

        let mut buf = [0u8; BLOCK_SIZE];
        entry.encode_into(&mut buf, 3);
        assert_eq!(DirEntry::decode_block(&buf)[3], entry);
    }

    #[test]
    fn name_already_listed_is_refused() {
        let fs = mem_fs(2048);
        let root = fs.root_dir();
        fill(&fs, &root, 0, 30);
        let size = root.entries_bytes();

        // the name sits in the second block, past a free slot in the first
        assert!(fs.delete_dir_entry(&root, 103));
        let again = DirEntry::new("f25", 999, FileType::Regular).unwrap();
        assert_eq!(
            fs.sync_dir_entry(&root, &again),
            Err(FsError::AlreadyExists("f25".to_string()))
        );
        assert_eq!(root.entries_bytes(), size - DIR_ENTRY_SIZE as u32);
        assert_eq!(fs.search_dir_entry(&root, "f25").map(|e| e.i_no), Some(125));
    }

    #[test]
    fn search_finds_entries_in_later_blocks() {
        let fs = mem_fs(2048);
        let root = fs.root_dir();
        fill(&fs, &root, 0, 40);
        assert_eq!(fs.search_dir_entry(&root, "f39").unwrap().i_no, 139);
        assert_eq!(fs.search_dir_entry(&root, "f0").unwrap().i_no, 100);
        assert!(fs.search_dir_entry(&root, "f40").is_none());
        assert_eq!(fs.search_dir_entry(&root, ".").unwrap().i_no, ROOT_INODE_NO);
    }

    #[test]
    fn insert_reuses_freed_slot() {
        let fs = mem_fs(2048);
        let root = fs.root_dir();
        fill(&fs, &root, 0, 5);
        assert!(fs.delete_dir_entry(&root, 102));
        let free = fs.free_block_count();

        let entry = DirEntry::new("again", 200, FileType::Regular).unwrap();
        fs.sync_dir_entry(&root, &entry).unwrap();
        assert_eq!(fs.free_block_count(), free);
        let inode = root.inode.lock().unwrap().clone();
        let entries = fs.read_dir_block(inode.i_sectors[0]);
        // ".", "..", f0, f1, then the reused slot
        assert_eq!(entries[4], entry);
    }

    #[test]
    fn sole_entry_of_later_block_reclaims_it() {
        let fs = mem_fs(2048);
        let root = fs.root_dir();
        // 19 entries fill block 0 next to "." and "..", f19 opens block 1
        fill(&fs, &root, 0, 20);
        let second = root.inode.lock().unwrap().i_sectors[1];
        assert_ne!(second, 0);
        let free = fs.free_block_count();

        assert!(fs.delete_dir_entry(&root, 119));
        assert_eq!(root.inode.lock().unwrap().i_sectors[1], 0);
        assert_eq!(fs.free_block_count(), free + 1);
        assert_eq!(root.entries_bytes(), 21 * DIR_ENTRY_SIZE as u32);
    }

    #[test]
    fn shared_block_only_loses_the_slot() {
        let fs = mem_fs(2048);
        let root = fs.root_dir();
        fill(&fs, &root, 0, 22);
        let free = fs.free_block_count();

        assert!(fs.delete_dir_entry(&root, 120));
        let inode = root.inode.lock().unwrap().clone();
        assert_ne!(inode.i_sectors[1], 0);
        assert_eq!(fs.free_block_count(), free);
        assert!(fs.read_dir_block(inode.i_sectors[1])[1].is_free());
        assert!(fs.search_dir_entry(&root, "f21").is_some());
    }

    #[test]
    fn first_block_is_never_reclaimed() {
        let fs = mem_fs(2048);
        let root = fs.root_dir();
        fill(&fs, &root, 0, 1);
        let free = fs.free_block_count();
        assert!(fs.delete_dir_entry(&root, 100));
        assert_ne!(root.inode.lock().unwrap().i_sectors[0], 0);
        assert_eq!(fs.free_block_count(), free);
        assert!(fs.dir_is_empty(&root));
    }

    #[test]
    fn indirect_table_comes_and_goes_with_its_blocks() {
        let fs = mem_fs(2048);
        let root = fs.root_dir();
        // 19 + 11 * 21 entries fill the 12 direct blocks
        let direct = 19 + 11 * DIR_ENTRIES_PER_BLOCK as u32;
        fill(&fs, &root, 0, direct);
        assert_eq!(root.inode.lock().unwrap().i_sectors[NDIRECT], 0);
        let free = fs.free_block_count();

        fill(&fs, &root, direct, 1);
        assert_ne!(root.inode.lock().unwrap().i_sectors[NDIRECT], 0);
        assert_eq!(fs.free_block_count(), free - 2);
        assert!(fs.search_dir_entry(&root, &format!("f{direct}")).is_some());

        assert!(fs.delete_dir_entry(&root, 100 + direct));
        assert_eq!(root.inode.lock().unwrap().i_sectors[NDIRECT], 0);
        assert_eq!(fs.free_block_count(), free);
    }

    #[test]
    fn readdir_skips_holes() {
        let fs = mem_fs(2048);
        let mut root = fs.root_dir();
        fill(&fs, &root, 0, 3);
        assert!(fs.delete_dir_entry(&root, 101));

        let names: Vec<String> = std::iter::from_fn(|| fs.dir_read(&mut root))
            .map(|entry| entry.name())
            .collect();
        assert_eq!(names, [".", "..", "f0", "f2"]);
        assert!(fs.dir_read(&mut root).is_none());
    }
}
