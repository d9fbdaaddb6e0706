use super::*;
use dir::{Dir, DirEntry, FileType};
use free_space::BitmapKind;
use fs::FileSystem;
use inode::{Inode, InodeRef};

use bitflags::bitflags;
use log::{debug, error, warn};
use scopeguard::ScopeGuard;
use std::sync::{Arc, Mutex};

bitflags! {
    /// Open modes; no bit set means read-only.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const WRONLY = 1;
        const RDWR = 2;
        const CREAT = 4;
    }
}

impl OpenFlags {
    pub const RDONLY: Self = Self::empty();

    pub fn is_writable(self) -> bool {
        self.intersects(Self::WRONLY | Self::RDWR)
    }
}

/// Reference point of `lseek`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// One slot of the open-file table.
#[derive(Clone)]
pub(crate) struct File {
    pub fd_pos: u32,
    pub fd_flag: OpenFlags,
    pub fd_inode: InodeRef,
}

/// Open files of the whole system, indexed by descriptor.
pub(crate) struct FileTable {
    files: Vec<Option<File>>,
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            files: vec![None; MAX_FILE_OPEN],
        }
    }

    /// Put `file` into the lowest free slot past the standard streams.
    pub fn install(&mut self, file: File) -> FsResult<usize> {
        let fd = (FIRST_FREE_FD..MAX_FILE_OPEN)
            .find(|&fd| self.files[fd].is_none())
            .ok_or_else(|| {
                error!("exceed max open files");
                FsError::TooManyOpenFiles
            })?;
        self.files[fd] = Some(file);
        Ok(fd)
    }

    pub fn get(&self, fd: usize) -> FsResult<&File> {
        self.files
            .get(fd)
            .and_then(Option::as_ref)
            .filter(|_| fd >= FIRST_FREE_FD)
            .ok_or(FsError::BadDescriptor(fd))
    }

    pub fn get_mut(&mut self, fd: usize) -> FsResult<&mut File> {
        if fd < FIRST_FREE_FD {
            return Err(FsError::BadDescriptor(fd));
        }
        self.files
            .get_mut(fd)
            .and_then(Option::as_mut)
            .ok_or(FsError::BadDescriptor(fd))
    }

    pub fn take(&mut self, fd: usize) -> FsResult<File> {
        if fd < FIRST_FREE_FD {
            return Err(FsError::BadDescriptor(fd));
        }
        self.files
            .get_mut(fd)
            .and_then(Option::take)
            .ok_or(FsError::BadDescriptor(fd))
    }

    /// Whether some slot refers to inode `inode_no`.
    pub fn is_open(&self, inode_no: u32) -> bool {
        self.files
            .iter()
            .flatten()
            .any(|file| file.fd_inode.lock().unwrap().i_no == inode_no)
    }

    pub fn open_count(&self) -> usize {
        self.files.iter().flatten().count()
    }
}

impl FileSystem {
    /// Create regular file `name` in `parent` and open it.
    ///
    /// Each resource taken here (inode bit, in-memory inode, table slot,
    /// directory entry) is given back if a later step fails.
    pub(crate) fn file_create(&self, parent: &Dir, name: &str, flags: OpenFlags) -> FsResult<usize> {
        let mut entry = DirEntry::new(name, 0, FileType::Regular)?;

        let inode_no = self.inode_bitmap_alloc().inspect_err(|_| {
            error!("in file_create: allocate inode failed");
        })?;
        let inode_no = scopeguard::guard(inode_no, |inode_no| self.inode_bitmap_free(inode_no));

        let mut new_inode = Inode::new(*inode_no);
        new_inode.write_deny = flags.is_writable();
        let inode_ref = Arc::new(Mutex::new(new_inode));

        let fd = self.file_table.lock().unwrap().install(File {
            fd_pos: 0,
            fd_flag: flags,
            fd_inode: Arc::clone(&inode_ref),
        })?;
        let fd = scopeguard::guard(fd, |fd| {
            let _ = self.file_table.lock().unwrap().take(fd);
        });

        entry.i_no = *inode_no;
        self.sync_dir_entry(parent, &entry).inspect_err(|_| {
            error!("sync dir_entry to disk failed");
        })?;

        self.inode_sync(&parent.inode.lock().unwrap());
        self.inode_sync(&inode_ref.lock().unwrap());
        self.bitmap_sync(*inode_no, BitmapKind::Inode);
        self.inode_install(&inode_ref);

        ScopeGuard::into_inner(inode_no);
        let fd = ScopeGuard::into_inner(fd);
        debug!("file_create: {name} is inode {} on fd {fd}", entry.i_no);
        Ok(fd)
    }

    /// Open existing inode `inode_no`. At most one writer at a time.
    pub(crate) fn file_open(&self, inode_no: u32, flags: OpenFlags) -> FsResult<usize> {
        let inode_ref = self.inode_open(inode_no);
        if flags.is_writable() {
            let mut inode = inode_ref.lock().unwrap();
            if inode.write_deny {
                drop(inode);
                self.inode_close(inode_ref);
                warn!("file {inode_no} can't be write now, try again later");
                return Err(FsError::Busy(format!("inode {inode_no}")));
            }
            inode.write_deny = true;
        }

        let installed = self.file_table.lock().unwrap().install(File {
            fd_pos: 0,
            fd_flag: flags,
            fd_inode: Arc::clone(&inode_ref),
        });
        installed.inspect_err(|_| {
            if flags.is_writable() {
                inode_ref.lock().unwrap().write_deny = false;
            }
            self.inode_close(Arc::clone(&inode_ref));
        })
    }

    pub(crate) fn file_close(&self, fd: usize) -> FsResult<()> {
        let file = self.file_table.lock().unwrap().take(fd)?;
        if file.fd_flag.is_writable() {
            file.fd_inode.lock().unwrap().write_deny = false;
        }
        self.inode_close(file.fd_inode);
        Ok(())
    }

    /// Append `buf` at the end of the file, whatever the cursor says.
    /// The cursor is left at the new end.
    pub(crate) fn file_write(&self, fd: usize, buf: &[u8]) -> FsResult<usize> {
        let file = self.file_table.lock().unwrap().get(fd)?.clone();
        if !file.fd_flag.is_writable() {
            return Err(FsError::NotWritable(fd));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let mut inode = file.fd_inode.lock().unwrap();
        if inode.i_size as usize + buf.len() > MAX_FILE_SIZE {
            error!("exceed max_file_size {MAX_FILE_SIZE} bytes, write file failed");
            return Err(FsError::FileTooLarge);
        }

        let mut all_blocks = self.all_blocks(&inode);
        let has_blocks = inode.used_blocks();
        let will_use_blocks = (inode.i_size as usize + buf.len()).div_ceil(BLOCK_SIZE);
        if will_use_blocks > has_blocks {
            self.inode_grow(&mut inode, &mut all_blocks, has_blocks, will_use_blocks)?;
        }

        let mut io_buf = [0u8; BLOCK_SIZE];
        let mut written = 0;
        let mut first_write_block = true;
        while written < buf.len() {
            let sec_idx = inode.i_size as usize / BLOCK_SIZE;
            let sec_lba = all_blocks[sec_idx];
            let sec_off = inode.i_size as usize % BLOCK_SIZE;
            let chunk = (BLOCK_SIZE - sec_off).min(buf.len() - written);

            // only the first block can hold earlier content
            if first_write_block && sec_off != 0 {
                self.disk().read(sec_lba, &mut io_buf);
            } else {
                io_buf.fill(0);
            }
            first_write_block = false;
            io_buf[sec_off..sec_off + chunk].copy_from_slice(&buf[written..written + chunk]);
            self.disk().write(sec_lba, &io_buf);

            inode.i_size += chunk as u32;
            written += chunk;
        }
        self.inode_sync(&inode);
        let end = inode.i_size;
        drop(inode);

        if let Ok(file) = self.file_table.lock().unwrap().get_mut(fd) {
            file.fd_pos = end;
        }
        Ok(written)
    }

    /// Read from the cursor, at most up to the end of the file.
    pub(crate) fn file_read(&self, fd: usize, buf: &mut [u8]) -> FsResult<usize> {
        let file = self.file_table.lock().unwrap().get(fd)?.clone();
        let inode = file.fd_inode.lock().unwrap().clone();

        let pos = file.fd_pos as usize;
        let size = buf.len().min((inode.i_size as usize).saturating_sub(pos));
        if size == 0 {
            return Ok(0);
        }

        let all_blocks = self.all_blocks(&inode);
        let mut io_buf = [0u8; BLOCK_SIZE];
        let mut bytes_read = 0;
        while bytes_read < size {
            let cur = pos + bytes_read;
            let sec_idx = cur / BLOCK_SIZE;
            let sec_off = cur % BLOCK_SIZE;
            let chunk = (BLOCK_SIZE - sec_off).min(size - bytes_read);
            let sec_lba = all_blocks[sec_idx];
            assert_ne!(sec_lba, 0, "inode {}: hole at block {sec_idx}", inode.i_no);
            self.disk().read(sec_lba, &mut io_buf);
            buf[bytes_read..bytes_read + chunk].copy_from_slice(&io_buf[sec_off..sec_off + chunk]);
            bytes_read += chunk;
        }

        if let Ok(file) = self.file_table.lock().unwrap().get_mut(fd) {
            file.fd_pos = (pos + bytes_read) as u32;
        }
        Ok(bytes_read)
    }

    /// Move the cursor of `fd`; the target must lie in `[0, size]`.
    pub(crate) fn file_lseek(&self, fd: usize, offset: i32, whence: Whence) -> FsResult<u32> {
        let mut file_table = self.file_table.lock().unwrap();
        let file = file_table.get_mut(fd)?;
        let file_size = file.fd_inode.lock().unwrap().i_size as i64;
        let new_pos = match whence {
            Whence::Set => offset as i64,
            Whence::Cur => file.fd_pos as i64 + offset as i64,
            Whence::End => file_size + offset as i64,
        };
        if !(0..=file_size).contains(&new_pos) {
            return Err(FsError::InvalidSeek(new_pos));
        }
        file.fd_pos = new_pos as u32;
        Ok(file.fd_pos)
    }
}
