use super::*;
use fs::FileSystem;

use log::debug;

/// A process as far as the file system is concerned: a name and a working
/// directory. Tasks are attached to one mounted file system, which keeps
/// their working directories out of reach of `rmdir`.
#[derive(Debug)]
pub struct Task {
    name: String,
    cwd_inode_nr: u32,
}

impl Task {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cwd_inode_nr(&self) -> u32 {
        self.cwd_inode_nr
    }
}

impl FileSystem {
    /// Start a task working in the root directory.
    pub fn task_attach(&self, name: &str) -> Task {
        self.cwd_inodes.lock().unwrap().push(ROOT_INODE_NO);
        debug!("task {name}: attached");
        Task {
            name: name.to_string(),
            cwd_inode_nr: ROOT_INODE_NO,
        }
    }

    /// Forget `task`; its working directory may be removed afterwards.
    pub fn task_detach(&self, task: Task) {
        self.forget_cwd(task.cwd_inode_nr);
        debug!("task {}: detached", task.name);
    }

    pub(crate) fn set_cwd(&self, task: &mut Task, inode_no: u32) {
        let mut cwd_inodes = self.cwd_inodes.lock().unwrap();
        if let Some(slot) = cwd_inodes.iter_mut().find(|no| **no == task.cwd_inode_nr) {
            *slot = inode_no;
        } else {
            cwd_inodes.push(inode_no);
        }
        task.cwd_inode_nr = inode_no;
    }

    fn forget_cwd(&self, inode_no: u32) {
        let mut cwd_inodes = self.cwd_inodes.lock().unwrap();
        if let Some(idx) = cwd_inodes.iter().position(|&no| no == inode_no) {
            cwd_inodes.swap_remove(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs::tests::mem_fs;

    #[test]
    fn chdir_moves_the_registered_cwd() {
        let fs = mem_fs(2048);
        fs.mkdir("/a").unwrap();
        fs.mkdir("/b").unwrap();
        let mut task = fs.task_attach("init");
        let other = fs.task_attach("shell");
        assert_eq!(*fs.cwd_inodes.lock().unwrap(), [ROOT_INODE_NO, ROOT_INODE_NO]);

        fs.chdir(&mut task, "/a").unwrap();
        let a = task.cwd_inode_nr();
        assert_ne!(a, ROOT_INODE_NO);
        assert!(fs.cwd_inodes.lock().unwrap().contains(&a));

        fs.chdir(&mut task, "/b").unwrap();
        assert!(!fs.cwd_inodes.lock().unwrap().contains(&a));
        fs.rmdir("/a").unwrap();

        fs.task_detach(task);
        fs.rmdir("/b").unwrap();
        fs.task_detach(other);
        assert!(fs.cwd_inodes.lock().unwrap().is_empty());
    }

    #[test]
    fn relative_paths_resolve_against_cwd() {
        let fs = mem_fs(2048);
        fs.mkdir("/usr").unwrap();
        fs.mkdir("/usr/lib").unwrap();
        let mut task = fs.task_attach("init");
        assert_eq!(fs.make_abs_path(&task, "usr/./lib"), "/usr/lib");

        fs.chdir(&mut task, "/usr/lib").unwrap();
        assert_eq!(fs.getcwd(&task), "/usr/lib");
        assert_eq!(task.name(), "init");
        assert_eq!(fs.make_abs_path(&task, "../bin"), "/usr/bin");
        assert_eq!(fs.make_abs_path(&task, "/etc/../tmp"), "/tmp");
        assert_eq!(fs.make_abs_path(&task, "."), "/usr/lib");
        fs.task_detach(task);
    }
}
