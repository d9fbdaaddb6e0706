use super::*;
use bitmap::Bitmap;
use dir::{Dir, DirEntry, FileType};
use disk::{Disk, Partition};
use file::{FileTable, OpenFlags, Whence};
use free_space::BitmapKind;
use inode::{encode_inode_at, load_inode, Inode, InodeRef, InodeSize};
use path::{path_depth, wash_path, PathSearchRecord};
use super_block::SuperBlock;
use task::Task;

use log::{info, warn};
use scopeguard::ScopeGuard;
use std::sync::{Arc, Mutex};

/// A mounted partition: everything the file system keeps in memory.
pub struct FileSystem {
    pub(crate) part: Partition,
    pub(crate) sb: SuperBlock,
    pub(crate) block_bitmap: Mutex<Bitmap>,
    pub(crate) inode_bitmap: Mutex<Bitmap>,
    /// cached inodes, each shared by every handle on it
    pub(crate) open_inodes: Mutex<Vec<InodeRef>>,
    /// held across read-modify-write of inode table sectors
    pub(crate) inode_table_lock: Mutex<()>,
    /// opened at mount and never closed
    root_inode: InodeRef,
    pub(crate) file_table: Mutex<FileTable>,
    /// working directories of the attached tasks, one entry per task
    pub(crate) cwd_inodes: Mutex<Vec<u32>>,
}

/// What `stat` reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stat {
    pub st_ino: u32,
    pub st_size: InodeSize,
    pub st_filetype: FileType,
}

fn check_path(path: &str) -> FsResult<()> {
    if !path.starts_with('/') || path.len() >= MAX_PATH_LEN {
        return Err(FsError::InvalidPath(path.to_string()));
    }
    Ok(())
}

fn is_root(path: &str) -> bool {
    matches!(path, "/" | "/." | "/..")
}

/// last component of a path that does not end in '/'
fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

impl FileSystem {
    /// Write an empty file system onto `part`: super block, both bitmaps,
    /// the inode table and a root directory holding "." and "..".
    pub fn format(part: &Partition) -> FsResult<()> {
        let sb = SuperBlock::new(part)?;
        info!("{} info:", part.name());
        sb.log_layout(part.name());
        sb.write(part);

        // bit 0 is the root directory, bits past the last data sector are never free
        let mut block_bitmap = Bitmap::new(sb.block_bitmap_sects as usize * SECTOR_SIZE);
        block_bitmap.set(0, true);
        for bit_idx in sb.data_sects() as usize..block_bitmap.bits_len() {
            block_bitmap.set(bit_idx, true);
        }
        part.disk().write(sb.block_bitmap_lba, block_bitmap.as_bytes());

        let mut inode_bitmap = Bitmap::new(sb.inode_bitmap_sects as usize * SECTOR_SIZE);
        inode_bitmap.set(ROOT_INODE_NO as usize, true);
        part.disk().write(sb.inode_bitmap_lba, inode_bitmap.as_bytes());

        let mut root = Inode::new(ROOT_INODE_NO);
        root.i_size = 2 * DIR_ENTRY_SIZE as u32;
        root.i_sectors[0] = sb.data_start_lba;
        let mut inode_table = vec![0u8; sb.inode_table_sects as usize * SECTOR_SIZE];
        encode_inode_at(&mut inode_table, &root);
        part.disk().write(sb.inode_table_lba, &inode_table);

        let mut buf = [0u8; BLOCK_SIZE];
        DirEntry::new(".", ROOT_INODE_NO, FileType::Directory)?.encode_into(&mut buf, 0);
        DirEntry::new("..", ROOT_INODE_NO, FileType::Directory)?.encode_into(&mut buf, 1);
        part.disk().write(sb.data_start_lba, &buf);

        info!("{} format done", part.name());
        Ok(())
    }

    /// Load the file system on `part`, formatting it first if it has none.
    pub fn mount(part: Partition) -> FsResult<Self> {
        let mut sb = SuperBlock::read(&part);
        if sb.is_formatted() {
            info!("{} has filesystem", part.name());
        } else {
            info!("formatting {}'s partition {}......", part.disk().name(), part.name());
            Self::format(&part)?;
            sb = SuperBlock::read(&part);
        }

        let mut bits = vec![0u8; sb.block_bitmap_sects as usize * SECTOR_SIZE];
        part.disk().read(sb.block_bitmap_lba, &mut bits);
        let block_bitmap = Bitmap::from_bytes(bits);

        let mut bits = vec![0u8; sb.inode_bitmap_sects as usize * SECTOR_SIZE];
        part.disk().read(sb.inode_bitmap_lba, &mut bits);
        let inode_bitmap = Bitmap::from_bytes(bits);

        let mut root = load_inode(part.disk(), &sb, sb.root_inode_no);
        root.i_open_cnts = 1;
        let root_inode = Arc::new(Mutex::new(root));

        info!("mount {} done!", part.name());
        Ok(Self {
            part,
            sb,
            block_bitmap: Mutex::new(block_bitmap),
            inode_bitmap: Mutex::new(inode_bitmap),
            open_inodes: Mutex::new(vec![Arc::clone(&root_inode)]),
            inode_table_lock: Mutex::new(()),
            root_inode,
            file_table: Mutex::new(FileTable::new()),
            cwd_inodes: Mutex::new(Vec::new()),
        })
    }

    pub fn disk(&self) -> &Disk {
        self.part.disk()
    }

    pub fn partition(&self) -> &Partition {
        &self.part
    }

    pub fn super_block(&self) -> &SuperBlock {
        &self.sb
    }

    pub(crate) fn root_inode(&self) -> &InodeRef {
        &self.root_inode
    }

    /// # of descriptors currently open
    pub fn open_file_count(&self) -> usize {
        self.file_table.lock().unwrap().open_count()
    }

    /// Search `path` and check that every component was walked. The parent
    /// directory the search opened is closed when the returned guard drops.
    fn lookup(
        &self,
        path: &str,
    ) -> (
        Option<u32>,
        ScopeGuard<PathSearchRecord, impl FnOnce(PathSearchRecord) + '_>,
        FsResult<()>,
    ) {
        let (inode_no, record) = self.search_file(path);
        let walked = if path_depth(path) == record.searched_depth() || is_root(path) {
            Ok(())
        } else if record.file_type == FileType::Regular {
            Err(FsError::NotDirectory(record.searched_path.clone()))
        } else {
            Err(FsError::NotFound(record.searched_path.clone()))
        };
        let record = scopeguard::guard(record, |record| self.search_done(record));
        (inode_no, record, walked)
    }

    /// Open or create the regular file at `path`, returning a descriptor.
    pub fn open(&self, path: &str, flags: OpenFlags) -> FsResult<usize> {
        check_path(path)?;
        if path.ends_with('/') {
            warn!("can't open a directory {path}");
            return Err(FsError::IsDirectory(path.to_string()));
        }

        let (inode_no, record, walked) = self.lookup(path);
        if record.file_type == FileType::Directory {
            warn!("can't open a directory with open(), use opendir() to instead");
            return Err(FsError::IsDirectory(path.to_string()));
        }
        walked?;

        match (inode_no, flags.contains(OpenFlags::CREAT)) {
            (None, false) => {
                warn!("in path {}, file {} isn't exist", record.searched_path, basename(path));
                Err(FsError::NotFound(path.to_string()))
            }
            (Some(_), true) => {
                warn!("{path} has already exist!");
                Err(FsError::AlreadyExists(path.to_string()))
            }
            (None, true) => {
                info!("creating file {path}");
                self.file_create(&record.parent_dir, basename(path), flags)
            }
            (Some(inode_no), false) => self.file_open(inode_no, flags),
        }
    }

    pub fn close(&self, fd: usize) -> FsResult<()> {
        self.file_close(fd)
    }

    /// Read from the cursor of `fd`; 0 at the end of the file.
    pub fn read(&self, fd: usize, buf: &mut [u8]) -> FsResult<usize> {
        self.file_read(fd, buf)
    }

    /// Append `buf` to the file behind `fd`.
    pub fn write(&self, fd: usize, buf: &[u8]) -> FsResult<usize> {
        self.file_write(fd, buf)
    }

    pub fn lseek(&self, fd: usize, offset: i32, whence: Whence) -> FsResult<u32> {
        self.file_lseek(fd, offset, whence)
    }

    /// Remove the regular file at `path`. A file still open is refused.
    pub fn unlink(&self, path: &str) -> FsResult<()> {
        check_path(path)?;
        let (inode_no, record, walked) = self.lookup(path);
        let Some(inode_no) = inode_no else {
            warn!("file {path} not found!");
            return Err(FsError::NotFound(path.to_string()));
        };
        if record.file_type == FileType::Directory {
            warn!("can't delete a direcotry with unlink(), use rmdir() to instead");
            return Err(FsError::IsDirectory(path.to_string()));
        }
        walked?;
        if path.ends_with('/') {
            warn!("{path}: a regular file can't be named as a directory");
            return Err(FsError::NotDirectory(path.to_string()));
        }

        if self.file_table.lock().unwrap().is_open(inode_no) {
            warn!("file {path} is in use, not allow to delete!");
            return Err(FsError::Busy(path.to_string()));
        }

        // a racing unlink may have removed the entry first
        if !self.delete_dir_entry(&record.parent_dir, inode_no) {
            return Err(FsError::NotFound(path.to_string()));
        }
        self.inode_release(inode_no);
        Ok(())
    }

    /// Create directory `path` holding only "." and "..".
    pub fn mkdir(&self, path: &str) -> FsResult<()> {
        check_path(path)?;
        let (inode_no, record, walked) = self.lookup(path);
        if let Err(e) = walked {
            warn!("sys_mkdir: can't access {path}, subpath {} isn't exist", record.searched_path);
            return Err(e);
        }
        if inode_no.is_some() {
            warn!("sys_mkdir: file or directory {path} exist!");
            return Err(FsError::AlreadyExists(path.to_string()));
        }
        let parent = &record.parent_dir;
        let mut entry = DirEntry::new(basename(path), 0, FileType::Directory)?;

        let inode_no = self.inode_bitmap_alloc().inspect_err(|_| {
            warn!("sys_mkdir: allocate inode failed");
        })?;
        let inode_no = scopeguard::guard(inode_no, |inode_no| self.inode_bitmap_free(inode_no));
        let mut new_dir = Inode::new(*inode_no);

        let block_lba = self.block_bitmap_alloc().inspect_err(|_| {
            warn!("sys_mkdir: block_bitmap_alloc for create directory failed");
        })?;
        let block_lba = scopeguard::guard(block_lba, |lba| {
            let bit_idx = self.block_bitmap_free(lba);
            self.bitmap_sync(bit_idx, BitmapKind::Block);
        });
        new_dir.i_sectors[0] = *block_lba;
        self.bitmap_sync(self.block_bit_idx(*block_lba), BitmapKind::Block);

        let mut buf = [0u8; BLOCK_SIZE];
        DirEntry::new(".", *inode_no, FileType::Directory)?.encode_into(&mut buf, 0);
        DirEntry::new("..", parent.inode_no(), FileType::Directory)?.encode_into(&mut buf, 1);
        self.disk().write(*block_lba, &buf);
        new_dir.i_size = 2 * DIR_ENTRY_SIZE as u32;

        entry.i_no = *inode_no;
        self.sync_dir_entry(parent, &entry).inspect_err(|_| {
            warn!("sys_mkdir: sync_dir_entry to disk failed!");
        })?;

        self.inode_sync(&parent.inode.lock().unwrap());
        self.inode_sync(&new_dir);
        self.bitmap_sync(*inode_no, BitmapKind::Inode);

        ScopeGuard::into_inner(block_lba);
        ScopeGuard::into_inner(inode_no);
        info!("mkdir {path} as inode {}", new_dir.i_no);
        Ok(())
    }

    /// Open the directory at `path`.
    pub fn opendir(&self, path: &str) -> FsResult<Dir> {
        check_path(path)?;
        if is_root(path) {
            return Ok(self.root_dir());
        }
        let (inode_no, record, walked) = self.lookup(path);
        let Some(inode_no) = inode_no else {
            warn!("In {path}, sub path {} not exist", record.searched_path);
            return Err(FsError::NotFound(path.to_string()));
        };
        walked?;
        if record.file_type == FileType::Regular {
            warn!("{path} is regular file!");
            return Err(FsError::NotDirectory(path.to_string()));
        }
        Ok(self.dir_open(inode_no))
    }

    pub fn closedir(&self, dir: Dir) {
        self.dir_close(dir);
    }

    /// Next entry of `dir`, "." and ".." included.
    pub fn readdir(&self, dir: &mut Dir) -> Option<DirEntry> {
        self.dir_read(dir)
    }

    pub fn rewinddir(&self, dir: &mut Dir) {
        dir.dir_pos = 0;
    }

    /// Remove the empty directory `path`. The root, any working directory and
    /// directories still open elsewhere are refused.
    pub fn rmdir(&self, path: &str) -> FsResult<()> {
        check_path(path)?;
        if matches!(basename(path.trim_end_matches('/')), "." | "..") {
            return Err(FsError::InvalidPath(path.to_string()));
        }
        let (inode_no, record, walked) = self.lookup(path);
        let Some(inode_no) = inode_no else {
            warn!("In {path}, sub path {} not exist", record.searched_path);
            return Err(FsError::NotFound(path.to_string()));
        };
        walked?;
        if record.file_type == FileType::Regular {
            warn!("{path} is regular file!");
            return Err(FsError::NotDirectory(path.to_string()));
        }
        if inode_no == ROOT_INODE_NO || self.cwd_inodes.lock().unwrap().contains(&inode_no) {
            warn!("{path} is in use, not allow to delete!");
            return Err(FsError::Busy(path.to_string()));
        }

        let dir = scopeguard::guard(self.dir_open(inode_no), |dir| self.dir_close(dir));
        if !self.dir_is_empty(&dir) {
            warn!("dir {path} is not empty, it is not allowed to delete a nonempty directory!");
            return Err(FsError::NotEmpty(path.to_string()));
        }
        if self.inode_open_count(inode_no) > 1 {
            warn!("dir {path} is still open, not allow to delete!");
            return Err(FsError::Busy(path.to_string()));
        }
        self.dir_remove(&record.parent_dir, &dir);
        Ok(())
    }

    pub fn stat(&self, path: &str) -> FsResult<Stat> {
        check_path(path)?;
        let (inode_no, record, walked) = self.lookup(path);
        let Some(inode_no) = inode_no else {
            warn!("sys_stat: {path} not found");
            return Err(FsError::NotFound(path.to_string()));
        };
        walked?;

        let inode_ref = self.inode_open(inode_no);
        let inode = inode_ref.lock().unwrap().clone();
        self.inode_close(inode_ref);
        Ok(Stat {
            st_ino: inode_no,
            st_size: inode.size_as(record.file_type),
            st_filetype: record.file_type,
        })
    }

    /// Absolute path of the working directory of `task`, rebuilt from the
    /// ".." links up to the root.
    pub fn getcwd(&self, task: &Task) -> String {
        let mut child_inode_nr = task.cwd_inode_nr();
        let mut names = Vec::new();
        while child_inode_nr != ROOT_INODE_NO {
            let parent_inode_nr = self.get_parent_dir_inode_nr(child_inode_nr);
            let name = self
                .get_child_dir_name(parent_inode_nr, child_inode_nr)
                .unwrap_or_else(|| {
                    panic!("dir {parent_inode_nr}: no entry for its child {child_inode_nr}")
                });
            names.push(name);
            child_inode_nr = parent_inode_nr;
        }
        if names.is_empty() {
            return "/".to_string();
        }
        names.iter().rev().fold(String::new(), |mut path, name| {
            path.push('/');
            path.push_str(name);
            path
        })
    }

    /// Make the directory at `path` the working directory of `task`.
    pub fn chdir(&self, task: &mut Task, path: &str) -> FsResult<()> {
        check_path(path)?;
        let (inode_no, record, walked) = self.lookup(path);
        let Some(inode_no) = inode_no else {
            warn!("sys_chdir: {path} not found");
            return Err(FsError::NotFound(path.to_string()));
        };
        walked?;
        if record.file_type != FileType::Directory {
            warn!("sys_chdir: {path} is regular file or other!");
            return Err(FsError::NotDirectory(path.to_string()));
        }
        self.set_cwd(task, inode_no);
        Ok(())
    }

    /// `path` made absolute against the working directory of `task`, with
    /// "." and ".." collapsed.
    pub fn make_abs_path(&self, task: &Task, path: &str) -> String {
        if path.starts_with('/') {
            return wash_path(path);
        }
        wash_path(&format!("{}/{path}", self.getcwd(task)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use block_device::MemDisk;

    /// A freshly formatted file system on a RAM disk of `sectors` sectors.
    pub(crate) fn mem_fs(sectors: usize) -> FileSystem {
        let _ = env_logger::builder().is_test(true).try_init();
        let part = Partition::whole("ram0", Arc::new(MemDisk::new(sectors)));
        FileSystem::mount(part).unwrap()
    }

    #[test]
    fn format_reserves_root_and_tail() {
        let fs = mem_fs(2048);
        let sb = fs.super_block().clone();
        let data_sects = sb.data_sects() as usize;
        assert_eq!(fs.free_block_count(), data_sects - 1);
        assert_eq!(fs.free_inode_count(), MAX_FILES_PER_PART - 1);

        let bitmap = fs.block_bitmap.lock().unwrap();
        assert!(bitmap.test(0));
        assert!(!bitmap.test(data_sects - 1));
        assert!(bitmap.test(data_sects));
        assert!(bitmap.test(bitmap.bits_len() - 1));
    }

    #[test]
    fn root_directory_lists_itself() {
        let fs = mem_fs(2048);
        let mut root = fs.opendir("/").unwrap();
        assert!(root.is_resident());
        let dot = fs.readdir(&mut root).unwrap();
        let dot_dot = fs.readdir(&mut root).unwrap();
        assert_eq!((dot.name().as_str(), dot.i_no), (".", ROOT_INODE_NO));
        assert_eq!((dot_dot.name().as_str(), dot_dot.i_no), ("..", ROOT_INODE_NO));
        assert!(fs.readdir(&mut root).is_none());
        fs.closedir(root);
        assert_eq!(fs.inode_open_count(ROOT_INODE_NO), 1);
    }

    #[test]
    fn remount_keeps_the_tree() {
        let blk_dev: Arc<dyn block_device::BlockDevice> = Arc::new(MemDisk::new(2048));
        {
            let fs = FileSystem::mount(Partition::whole("ram0", Arc::clone(&blk_dev))).unwrap();
            fs.mkdir("/etc").unwrap();
            let fd = fs.open("/etc/motd", OpenFlags::CREAT | OpenFlags::WRONLY).unwrap();
            fs.write(fd, b"welcome").unwrap();
            fs.close(fd).unwrap();
        }
        let fs = FileSystem::mount(Partition::whole("ram0", blk_dev)).unwrap();
        let stat = fs.stat("/etc/motd").unwrap();
        assert_eq!(stat.st_filetype, FileType::Regular);
        assert_eq!(stat.st_size, InodeSize::File { size: 7 });
        let fd = fs.open("/etc/motd", OpenFlags::RDONLY).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(fs.read(fd, &mut buf), Ok(7));
        assert_eq!(&buf[..7], b"welcome");
        fs.close(fd).unwrap();
    }

    #[test]
    fn too_small_partition_fails_to_mount() {
        let part = Partition::whole("ram0", Arc::new(MemDisk::new(600)));
        assert!(matches!(
            FileSystem::mount(part),
            Err(FsError::PartitionTooSmall(600))
        ));
    }

    #[test]
    fn paths_must_be_absolute() {
        let fs = mem_fs(2048);
        assert_eq!(fs.mkdir("a"), Err(FsError::InvalidPath("a".to_string())));
        let long = format!("/{}", "x".repeat(MAX_PATH_LEN));
        assert!(matches!(fs.stat(&long), Err(FsError::InvalidPath(_))));
        assert_eq!(
            fs.mkdir("/abcdefghijklmnopq"),
            Err(FsError::NameTooLong("abcdefghijklmnopq".to_string()))
        );
    }

    #[test]
    fn mkdir_failure_gives_everything_back() {
        let fs = mem_fs(620);
        // use up every data block but one
        while fs.free_block_count() > 1 {
            fs.block_bitmap_alloc().unwrap();
        }
        // the new directory takes the last block, the root then cannot grow
        for i in 0..DIR_ENTRIES_PER_BLOCK - 2 {
            let fd = fs.open(&format!("/f{i}"), OpenFlags::CREAT).unwrap();
            fs.close(fd).unwrap();
        }
        let free_inodes = fs.free_inode_count();
        assert_eq!(fs.mkdir("/d"), Err(FsError::NoFreeBlock));
        assert_eq!(fs.free_block_count(), 1);
        assert_eq!(fs.free_inode_count(), free_inodes);
        assert!(matches!(fs.stat("/d"), Err(FsError::NotFound(_))));
    }

    #[test]
    fn stat_reports_directory_entries() {
        let fs = mem_fs(2048);
        fs.mkdir("/d").unwrap();
        fs.mkdir("/d/e").unwrap();
        let stat = fs.stat("/d").unwrap();
        assert_eq!(stat.st_filetype, FileType::Directory);
        assert_eq!(
            stat.st_size,
            InodeSize::Directory {
                entries_bytes: 3 * DIR_ENTRY_SIZE as u32
            }
        );
        let root = fs.stat("/").unwrap();
        assert_eq!(root.st_ino, ROOT_INODE_NO);
    }

    #[test]
    fn rmdir_refuses_root_dots_and_open_dirs() {
        let fs = mem_fs(2048);
        fs.mkdir("/d").unwrap();
        assert_eq!(fs.rmdir("/"), Err(FsError::Busy("/".to_string())));
        assert_eq!(fs.rmdir("/d/.."), Err(FsError::InvalidPath("/d/..".to_string())));
        assert_eq!(fs.rmdir("/d/."), Err(FsError::InvalidPath("/d/.".to_string())));

        let dir = fs.opendir("/d").unwrap();
        assert_eq!(fs.rmdir("/d"), Err(FsError::Busy("/d".to_string())));
        fs.closedir(dir);
        fs.rmdir("/d").unwrap();
        assert!(matches!(fs.opendir("/d"), Err(FsError::NotFound(_))));
    }

    #[test]
    fn regular_file_in_the_middle_is_not_a_directory() {
        let fs = mem_fs(2048);
        let fd = fs.open("/f", OpenFlags::CREAT).unwrap();
        fs.close(fd).unwrap();
        assert_eq!(
            fs.open("/f/g", OpenFlags::CREAT),
            Err(FsError::NotDirectory("/f".to_string()))
        );
        assert_eq!(fs.unlink("/f/g"), Err(FsError::NotDirectory("/f".to_string())));
        assert_eq!(fs.mkdir("/f/g"), Err(FsError::NotDirectory("/f".to_string())));
        assert!(matches!(fs.opendir("/f"), Err(FsError::NotDirectory(_))));
    }

    #[test]
    fn trailing_slash_does_not_name_a_file() {
        let fs = mem_fs(2048);
        let fd = fs.open("/f", OpenFlags::CREAT).unwrap();
        fs.close(fd).unwrap();
        assert_eq!(fs.unlink("/f/"), Err(FsError::NotDirectory("/f/".to_string())));
        assert_eq!(fs.stat("/f").unwrap().st_filetype, FileType::Regular);
        fs.unlink("/f").unwrap();
    }
}
