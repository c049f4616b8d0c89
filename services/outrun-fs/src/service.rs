//! Filesystem primitives served to the remote host.
//!
//! Every operation takes absolute paths in the local namespace, performs a
//! syscall-thin amount of work, and returns a typed result. Anything policy
//! shaped (caching, prefetching) lives elsewhere.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path};

use outrun_protocol::message::UTIME_OMIT_NS;
use outrun_protocol::{
    sha256, Attributes, DirEntry, FsStats, Metadata, RpcError, RpcResult, Validator,
};

use crate::APP_ID;

/// The local filesystem exposed as service operations.
///
/// The advertised root is always `/`; the validation step exists to reject
/// malformed paths, not to sandbox.
#[derive(Debug, Default)]
pub struct LocalFs;

impl LocalFs {
    /// Creates the service.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Rejects relative paths and any traversal above the root.
    pub fn validate(path: &str) -> RpcResult<&Path> {
        let p = Path::new(path);

        if !p.has_root() {
            return Err(RpcError::PermissionDenied);
        }
        if p.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(RpcError::PermissionDenied);
        }

        Ok(p)
    }

    /// Retrieves metadata of a filesystem entry without following symlinks.
    ///
    /// The symlink target rides along when the entry is a link, and the
    /// validator captures the version this answer describes.
    pub fn getattr(&self, path: &str) -> RpcResult<Metadata> {
        let p = Self::validate(path)?;
        let meta = std::fs::symlink_metadata(p)?;
        let attr = Attributes::from_metadata(&meta);

        let link = if attr.is_symlink() {
            Some(
                std::fs::read_link(p)?
                    .to_str()
                    .ok_or_else(|| RpcError::protocol("non-utf8 symlink target"))?
                    .to_owned(),
            )
        } else {
            None
        };

        Ok(Metadata {
            attr: Some(attr),
            link,
            error: None,
            validator: Some(Validator::from_metadata(&meta)),
        })
    }

    /// Like [`Self::getattr`] but folds the error into the record, for bulk
    /// replies where failures are per item.
    #[must_use]
    pub fn getattr_infallible(&self, path: &str) -> Metadata {
        self.getattr(path)
            .unwrap_or_else(Metadata::from_error)
    }

    /// Produces a complete directory listing snapshot with child attributes.
    pub fn readdir(&self, path: &str) -> RpcResult<Vec<DirEntry>> {
        let p = Self::validate(path)?;

        if !std::fs::symlink_metadata(p)?.is_dir() {
            return Err(RpcError::NotADirectory);
        }

        let mut entries = vec![
            DirEntry {
                name: ".".to_owned(),
                attr: None,
            },
            DirEntry {
                name: "..".to_owned(),
                attr: None,
            },
        ];

        for entry in std::fs::read_dir(p)? {
            let entry = entry?;

            // Non-UTF-8 names cannot cross the wire; they are rare enough in
            // system paths to drop rather than fail the listing.
            let Ok(name) = entry.file_name().into_string() else {
                tracing::debug!(dir = path, "skipping non-utf8 directory entry");
                continue;
            };

            let attr = entry.metadata().ok().map(|m| Attributes::from_metadata(&m));
            entries.push(DirEntry { name, attr });
        }

        Ok(entries)
    }

    /// Reads the target of a symlink.
    pub fn readlink(&self, path: &str) -> RpcResult<String> {
        let p = Self::validate(path)?;

        match std::fs::read_link(p) {
            Ok(target) => target
                .into_os_string()
                .into_string()
                .map_err(|_| RpcError::protocol("non-utf8 symlink target")),
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => Err(RpcError::NotASymlink),
            Err(e) => Err(e.into()),
        }
    }

    /// Opens a file for reading and returns its current attributes.
    pub fn open_read(&self, path: &str) -> RpcResult<(File, Attributes, u64)> {
        let p = Self::validate(path)?;
        let file = File::open(p)?;
        let meta = file.metadata()?;
        let attr = Attributes::from_metadata(&meta);

        Ok((file, attr, meta.len()))
    }

    /// Reads a chunk at an offset; short reads signal end of file.
    pub fn read(&self, file: &File, offset: u64, len: u32) -> RpcResult<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        let mut filled = 0;

        while filled < buf.len() {
            let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        buf.truncate(filled);
        Ok(buf)
    }

    /// Reads an entire file into memory for blob transfer.
    pub fn read_whole(&self, path: &str) -> RpcResult<Vec<u8>> {
        let p = Self::validate(path)?;
        let mut file = File::open(p)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Opens (or creates) a file for writing with POSIX open flags.
    pub fn open_write(&self, path: &str, flags: i32, mode: u32) -> RpcResult<File> {
        let p = Self::validate(path)?;
        let access = flags & libc::O_ACCMODE;

        let mut opts = OpenOptions::new();
        opts.read(access == libc::O_RDONLY || access == libc::O_RDWR)
            .write(access == libc::O_WRONLY || access == libc::O_RDWR)
            .create(flags & libc::O_CREAT != 0)
            .truncate(flags & libc::O_TRUNC != 0)
            .append(flags & libc::O_APPEND != 0)
            .custom_flags(flags & !(libc::O_ACCMODE | libc::O_CREAT | libc::O_TRUNC | libc::O_APPEND))
            .mode(mode);

        Ok(opts.open(p)?)
    }

    /// Writes a chunk at an offset and reports the bytes written.
    pub fn write(&self, file: &File, offset: u64, data: &[u8]) -> RpcResult<u32> {
        file.write_all_at(data, offset)?;
        Ok(u32::try_from(data.len()).map_err(|_| RpcError::protocol("oversized write"))?)
    }

    /// Flushes file state to disk.
    pub fn fsync(&self, file: &File, datasync: bool) -> RpcResult<()> {
        if datasync {
            file.sync_data()?;
        } else {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Truncates via handle when one is given, else by path.
    pub fn truncate(&self, path: &str, file: Option<&File>, size: u64) -> RpcResult<()> {
        if let Some(file) = file {
            file.set_len(size)?;
        } else {
            let p = Self::validate(path)?;
            let file = OpenOptions::new().write(true).open(p)?;
            file.set_len(size)?;
        }
        Ok(())
    }

    pub fn unlink(&self, path: &str) -> RpcResult<()> {
        Ok(std::fs::remove_file(Self::validate(path)?)?)
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> RpcResult<()> {
        let p = Self::validate(path)?;
        std::fs::DirBuilder::new().mode(mode).create(p)?;
        Ok(())
    }

    pub fn rmdir(&self, path: &str) -> RpcResult<()> {
        Ok(std::fs::remove_dir(Self::validate(path)?)?)
    }

    pub fn rename(&self, from: &str, to: &str) -> RpcResult<()> {
        Ok(std::fs::rename(Self::validate(from)?, Self::validate(to)?)?)
    }

    pub fn chmod(&self, path: &str, mode: u32) -> RpcResult<()> {
        let p = Self::validate(path)?;
        Ok(std::fs::set_permissions(p, PermissionsExt::from_mode(mode))?)
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> RpcResult<()> {
        let p = Self::validate(path)?;
        nix::unistd::chown(
            p,
            Some(nix::unistd::Uid::from_raw(uid)),
            Some(nix::unistd::Gid::from_raw(gid)),
        )
        .map_err(nix_to_rpc)
    }

    /// Sets access and modification times in nanoseconds, without following
    /// symlinks. [`UTIME_OMIT_NS`] leaves a timestamp untouched.
    pub fn utimens(&self, path: &str, atime_ns: i64, mtime_ns: i64) -> RpcResult<()> {
        let p = Self::validate(path)?;

        let times = [to_timespec(atime_ns), to_timespec(mtime_ns)];
        let cpath = std::ffi::CString::new(p.as_os_str().as_bytes())
            .map_err(|_| RpcError::protocol("path contains nul byte"))?;

        let rc = unsafe {
            libc::utimensat(
                libc::AT_FDCWD,
                cpath.as_ptr(),
                times.as_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };

        if rc < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    pub fn symlink(&self, path: &str, target: &str) -> RpcResult<()> {
        let p = Self::validate(path)?;
        Ok(std::os::unix::fs::symlink(target, p)?)
    }

    pub fn link(&self, path: &str, target: &str) -> RpcResult<()> {
        let p = Self::validate(path)?;
        let t = Self::validate(target)?;
        Ok(std::fs::hard_link(t, p)?)
    }

    /// Creates a device node or FIFO.
    pub fn mknod(&self, path: &str, mode: u32, rdev: u64) -> RpcResult<()> {
        let p = Self::validate(path)?;
        let kind = nix::sys::stat::SFlag::from_bits_truncate(mode);
        let perm = nix::sys::stat::Mode::from_bits_truncate(mode);

        if mode & libc::S_IFMT == libc::S_IFIFO {
            nix::unistd::mkfifo(p, perm).map_err(nix_to_rpc)
        } else {
            nix::sys::stat::mknod(p, kind, perm, rdev).map_err(nix_to_rpc)
        }
    }

    /// Filesystem statistics for the mount the path lives on.
    pub fn statfs(&self, path: &str) -> RpcResult<FsStats> {
        let p = Self::validate(path)?;
        let st = nix::sys::statvfs::statvfs(p).map_err(nix_to_rpc)?;

        #[allow(clippy::cast_possible_truncation)]
        Ok(FsStats {
            blocks: st.blocks(),
            bfree: st.blocks_free(),
            bavail: st.blocks_available(),
            files: st.files(),
            ffree: st.files_free(),
            bsize: st.block_size() as u32,
            frsize: st.fragment_size() as u32,
            namemax: st.name_max() as u32,
        })
    }

    /// Derives the session-stable root version of this host.
    ///
    /// An app-scoped hash of the machine id: stable across sessions on the
    /// same installation, different across hosts, and not leaking the
    /// confidential machine id itself.
    #[must_use]
    pub fn root_version(&self) -> u64 {
        let raw = std::fs::read("/etc/machine-id")
            .or_else(|_| std::fs::read("/var/lib/dbus/machine-id"))
            .unwrap_or_default();

        let mut seed = raw.trim_ascii().to_vec();
        seed.extend_from_slice(APP_ID);

        let digest = sha256(&seed);
        u64::from_be_bytes(digest[..8].try_into().unwrap_or_default())
    }

    /// Compares cached validators against current state, returning fresh
    /// metadata for every entry that changed.
    ///
    /// One batched pass is much cheaper than per-entry freshness checks on
    /// first access, which would each pay a round trip.
    #[must_use]
    pub fn changed_metadata(&self, entries: &[(String, Validator)]) -> Vec<(String, Metadata)> {
        let mut changed = Vec::new();

        for (path, cached) in entries {
            let fresh = self.getattr_infallible(path);
            let same = fresh
                .validator
                .is_some_and(|v| v == *cached);

            if !same {
                tracing::debug!(path, "cached metadata is stale");
                changed.push((path.clone(), fresh));
            }
        }

        changed
    }
}

fn to_timespec(ns: i64) -> libc::timespec {
    if ns == UTIME_OMIT_NS {
        libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        }
    } else {
        libc::timespec {
            tv_sec: ns.div_euclid(1_000_000_000),
            tv_nsec: ns.rem_euclid(1_000_000_000),
        }
    }
}

fn nix_to_rpc(err: nix::errno::Errno) -> RpcError {
    std::io::Error::from_raw_os_error(err as i32).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_traversal() {
        assert!(LocalFs::validate("/usr/lib").is_ok());
        assert!(LocalFs::validate("relative/path").is_err());
        assert!(LocalFs::validate("/usr/../etc/shadow").is_err());
    }

    #[test]
    fn test_getattr_and_readdir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();

        let fs = LocalFs::new();
        let meta = fs.getattr(file.to_str().unwrap()).unwrap();
        let attr = meta.attr.unwrap();
        assert!(attr.is_regular());
        assert_eq!(attr.size, 5);
        assert!(meta.validator.is_some());
        assert!(meta.link.is_none());

        let entries = fs.readdir(dir.path().to_str().unwrap()).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"."));
        assert!(names.contains(&".."));
        assert!(names.contains(&"a.txt"));
    }

    #[test]
    fn test_readdir_of_file_is_not_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();

        let fs = LocalFs::new();
        assert!(matches!(
            fs.readdir(file.to_str().unwrap()),
            Err(RpcError::NotADirectory)
        ));
    }

    #[test]
    fn test_readlink_distinguishes_non_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        let link = dir.path().join("link");
        std::fs::write(&file, b"x").unwrap();
        std::os::unix::fs::symlink(&file, &link).unwrap();

        let fs = LocalFs::new();
        assert_eq!(
            fs.readlink(link.to_str().unwrap()).unwrap(),
            file.to_str().unwrap()
        );
        assert!(matches!(
            fs.readlink(file.to_str().unwrap()),
            Err(RpcError::NotASymlink)
        ));
    }

    #[test]
    fn test_read_write_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let fs = LocalFs::new();

        let file = fs
            .open_write(
                path.to_str().unwrap(),
                libc::O_WRONLY | libc::O_CREAT,
                0o644,
            )
            .unwrap();
        assert_eq!(fs.write(&file, 0, b"hello world").unwrap(), 11);
        fs.fsync(&file, true).unwrap();
        drop(file);

        let (file, attr, len) = fs.open_read(path.to_str().unwrap()).unwrap();
        assert_eq!(len, 11);
        assert_eq!(attr.size, 11);
        assert_eq!(fs.read(&file, 6, 16).unwrap(), b"world");
        assert_eq!(fs.read(&file, 11, 16).unwrap(), b"");
    }

    #[test]
    fn test_changed_metadata_detects_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watched");
        std::fs::write(&path, b"one").unwrap();

        let fs = LocalFs::new();
        let path_str = path.to_str().unwrap().to_owned();
        let validator = fs.getattr(&path_str).unwrap().validator.unwrap();

        // Unchanged file does not report.
        let unchanged = fs.changed_metadata(&[(path_str.clone(), validator)]);
        assert!(unchanged.is_empty());

        // Grow the file; size is part of the validator.
        std::fs::write(&path, b"one two three").unwrap();
        let changed = fs.changed_metadata(&[(path_str.clone(), validator)]);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].0, path_str);
        assert!(changed[0].1.attr.is_some());
    }

    #[test]
    fn test_missing_path_reports_not_found() {
        let fs = LocalFs::new();
        assert!(matches!(
            fs.getattr("/definitely/not/here"),
            Err(RpcError::NotFound)
        ));

        let meta = fs.getattr_infallible("/definitely/not/here");
        assert_eq!(meta.error, Some(RpcError::NotFound));
    }
}
