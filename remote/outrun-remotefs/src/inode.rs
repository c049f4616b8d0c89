//! Inode number assignment for the FUSE layer.
//!
//! The wire protocol deals in paths; the kernel deals in inode numbers.
//! This table hands out stable numbers per path for the lifetime of the
//! mount. Root is always inode 1.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, UNIX_EPOCH};

use dashmap::DashMap;
use fuser::{FileAttr, FileType};

use outrun_protocol::Attributes;

/// Root inode number as mandated by FUSE.
pub const ROOT_INO: u64 = 1;

/// Bidirectional path/inode table.
pub struct InodeTable {
    by_ino: DashMap<u64, String>,
    by_path: DashMap<String, u64>,
    next: AtomicU64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    /// Creates a table with `/` mapped to the root inode.
    #[must_use]
    pub fn new() -> Self {
        let table = Self {
            by_ino: DashMap::new(),
            by_path: DashMap::new(),
            next: AtomicU64::new(ROOT_INO + 1),
        };
        table.by_ino.insert(ROOT_INO, "/".to_owned());
        table.by_path.insert("/".to_owned(), ROOT_INO);
        table
    }

    /// Returns the inode for a path, assigning one on first sight.
    pub fn ino_for(&self, path: &str) -> u64 {
        if let Some(ino) = self.by_path.get(path) {
            return *ino;
        }

        let ino = self.next.fetch_add(1, Ordering::Relaxed);
        // Two racers may both allocate; the map decides, the loser's number
        // is simply never used.
        match self.by_path.entry(path.to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(e) => *e.get(),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(ino);
                self.by_ino.insert(ino, path.to_owned());
                ino
            }
        }
    }

    /// Path for an inode, if the kernel ever saw it.
    #[must_use]
    pub fn path_of(&self, ino: u64) -> Option<String> {
        self.by_ino.get(&ino).map(|p| p.clone())
    }

    /// Rebinds a path after a rename.
    pub fn rename(&self, from: &str, to: &str) {
        if let Some((_, ino)) = self.by_path.remove(from) {
            self.by_path.insert(to.to_owned(), ino);
            self.by_ino.insert(ino, to.to_owned());
        }
    }

    /// Drops a path binding after unlink/rmdir.
    pub fn forget_path(&self, path: &str) {
        if let Some((_, ino)) = self.by_path.remove(path) {
            self.by_ino.remove(&ino);
        }
    }
}

/// Joins a parent path and a child name.
#[must_use]
pub fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Converts wire attributes into what the kernel wants.
#[must_use]
pub fn to_file_attr(attr: &Attributes, ino: u64) -> FileAttr {
    let kind = match attr.mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    };

    let at = |ns: i64| {
        if ns >= 0 {
            UNIX_EPOCH + Duration::from_nanos(ns as u64)
        } else {
            UNIX_EPOCH
        }
    };

    FileAttr {
        ino,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: at(attr.atime_ns),
        mtime: at(attr.mtime_ns),
        ctime: at(attr.ctime_ns),
        crtime: at(attr.ctime_ns),
        kind,
        perm: (attr.mode & 0o7777) as u16,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: u32::try_from(attr.rdev).unwrap_or(0),
        blksize: 4096,
        flags: 0,
    }
}
