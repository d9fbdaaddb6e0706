use super::*;
use dir::{Dir, FileType};
use fs::FileSystem;

use log::debug;

/// Split off the first component of `path`.
/// Returns the component and whatever follows it, `None` once nothing is left.
pub fn path_parse(path: &str) -> (&str, Option<&str>) {
    let path = path.trim_start_matches('/');
    match path.find('/') {
        Some(end) => {
            let rest = &path[end..];
            let more = !rest.trim_start_matches('/').is_empty();
            (&path[..end], more.then_some(rest))
        }
        None => (path, None),
    }
}

/// # of components in `path`, "/" has none.
pub fn path_depth(path: &str) -> usize {
    path.split('/').filter(|name| !name.is_empty()).count()
}

/// Collapse "." and ".." in an absolute path without touching the disk.
/// ".." at the root stays at the root.
pub fn wash_path(path: &str) -> String {
    let mut names: Vec<&str> = Vec::new();
    for name in path.split('/') {
        match name {
            "" | "." => {}
            ".." => {
                names.pop();
            }
            name => names.push(name),
        }
    }
    if names.is_empty() {
        return "/".to_string();
    }
    names.iter().fold(String::new(), |mut washed, name| {
        washed.push('/');
        washed.push_str(name);
        washed
    })
}

/// What a path walk saw before it stopped.
pub struct PathSearchRecord {
    /// the components walked so far, the last one being where the walk stopped
    pub searched_path: String,
    /// directory that holds (or would hold) the last searched component;
    /// it is open and must be closed by the caller
    pub parent_dir: Dir,
    pub file_type: FileType,
}

impl PathSearchRecord {
    /// Components walked, to be compared with the depth of the input path.
    pub fn searched_depth(&self) -> usize {
        path_depth(&self.searched_path)
    }
}

impl FileSystem {
    /// Walk absolute `path` one component at a time.
    ///
    /// The walk stops at a missing component or at a regular file, so on a
    /// miss `parent_dir` is the directory where the component would be
    /// created. On a directory hit `parent_dir` is the directory that lists it.
    pub fn search_file(&self, path: &str) -> (Option<u32>, PathSearchRecord) {
        let mut record = PathSearchRecord {
            searched_path: String::new(),
            parent_dir: self.root_dir(),
            file_type: FileType::Unknown,
        };

        if matches!(path, "/" | "/." | "/..") {
            record.file_type = FileType::Directory;
            return (Some(ROOT_INODE_NO), record);
        }
        assert!(
            path.starts_with('/') && path.len() > 1 && path.len() < MAX_PATH_LEN,
            "search_file: {path:?} is not a valid absolute path"
        );

        let mut parent_inode_no = ROOT_INODE_NO;
        let mut found = None;
        let mut sub_path = Some(path);
        while let Some(remaining) = sub_path {
            let (name, rest) = path_parse(remaining);
            sub_path = rest;
            record.searched_path.push('/');
            record.searched_path.push_str(name);

            let Some(entry) = self.search_dir_entry(&record.parent_dir, name) else {
                debug!("search_file: {} not found", record.searched_path);
                return (None, record);
            };
            found = Some(entry.i_no);
            match entry.f_type {
                FileType::Directory => {
                    parent_inode_no = record.parent_dir.inode_no();
                    let child = self.dir_open(entry.i_no);
                    let parent = std::mem::replace(&mut record.parent_dir, child);
                    self.dir_close(parent);
                }
                FileType::Regular => {
                    record.file_type = FileType::Regular;
                    return (found, record);
                }
                FileType::Unknown => unreachable!("search_dir_entry returned a free slot"),
            }
        }

        // the walk ended on a directory, hand back the one that lists it
        let child = std::mem::replace(&mut record.parent_dir, self.dir_open(parent_inode_no));
        self.dir_close(child);
        record.file_type = FileType::Directory;
        (found, record)
    }

    /// Close the directory a search left open.
    pub fn search_done(&self, record: PathSearchRecord) {
        self.dir_close(record.parent_dir);
    }
}
