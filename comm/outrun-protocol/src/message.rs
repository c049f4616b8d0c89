//! Message and record types that cross the wire.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RpcError;

/// Sentinel for a timestamp that `utimens` should leave untouched.
pub const UTIME_OMIT_NS: i64 = i64::MIN;

/// File attributes, essentially `lstat` output as a record.
///
/// Inode numbers are deliberately not part of the wire attributes: the
/// remote FUSE layer assigns its own stable inode numbers. The server-side
/// inode is carried in the [`Validator`] instead, where it participates in
/// change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub nlink: u32,
    pub rdev: u64,
    pub atime_ns: i64,
    pub mtime_ns: i64,
    pub ctime_ns: i64,
}

impl Attributes {
    /// Builds attributes from `std::fs` metadata (not following symlinks).
    #[must_use]
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self {
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.size(),
            nlink: u32::try_from(meta.nlink()).unwrap_or(u32::MAX),
            rdev: meta.rdev(),
            atime_ns: meta.atime() * 1_000_000_000 + meta.atime_nsec(),
            mtime_ns: meta.mtime() * 1_000_000_000 + meta.mtime_nsec(),
            ctime_ns: meta.ctime() * 1_000_000_000 + meta.ctime_nsec(),
        }
    }

    /// Copies the attributes with all write permission bits stripped.
    ///
    /// Entries served from the persistent cache are exposed read-only since
    /// the session treats system paths as immutable.
    #[must_use]
    pub const fn as_readonly(mut self) -> Self {
        self.mode &= !0o222;
        self
    }

    /// Whether the mode describes a regular file.
    #[must_use]
    pub const fn is_regular(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }

    /// Whether the mode describes a directory.
    #[must_use]
    pub const fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    /// Whether the mode describes a symlink.
    #[must_use]
    pub const fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }
}

/// Identifies one observed version of an inode on the local host.
///
/// Captured when the local host serves an attributes record; a mismatch on a
/// later session invalidates everything cached under it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub mtime_ns: i64,
    pub size: u64,
    pub ino: u64,
}

impl Validator {
    /// Captures a validator from `std::fs` metadata.
    #[must_use]
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self {
            mtime_ns: meta.mtime() * 1_000_000_000 + meta.mtime_nsec(),
            size: meta.size(),
            ino: meta.ino(),
        }
    }
}

/// One entry of a directory listing snapshot.
///
/// Listings are complete snapshots, not incremental. The attributes may be
/// absent if the child vanished between listing and stat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub attr: Option<Attributes>,
}

/// Metadata bundle for one path: attributes, symlink target, or the error
/// that accessing it produced.
///
/// Carrying the link target alongside the attributes costs nothing and
/// saves a round trip, because a symlink that gets stat'ed is very likely
/// to be read next.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Metadata {
    pub attr: Option<Attributes>,
    pub link: Option<String>,
    pub error: Option<RpcError>,
    pub validator: Option<Validator>,
}

impl Metadata {
    /// Wraps an access failure.
    #[must_use]
    pub fn from_error(error: RpcError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Compression applied to one blob payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    None,
    Lz4,
}

/// The complete contents of a regular file.
///
/// The checksum is a SHA-256 digest over the uncompressed bytes and doubles
/// as the content address in the remote blob cache. Compression is a per-blob
/// decision: small or incompressible payloads travel as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContents {
    pub encoding: Compression,
    pub payload: Vec<u8>,
    pub checksum: [u8; 32],
    pub size: u64,
}

impl FileContents {
    /// Wraps raw file data, compressing when the ratio beats `min_ratio`.
    ///
    /// `min_ratio` is the compressed/original threshold below which lz4 is
    /// worth the decode cost (default 0.85 from config).
    #[must_use]
    pub fn from_bytes(data: &[u8], min_ratio: f64) -> Self {
        let checksum = sha256(data);
        let size = data.len() as u64;

        let compressed = lz4_flex::compress_prepend_size(data);

        #[allow(clippy::cast_precision_loss)]
        let ratio = if data.is_empty() {
            1.0
        } else {
            compressed.len() as f64 / data.len() as f64
        };

        if ratio < min_ratio {
            Self {
                encoding: Compression::Lz4,
                payload: compressed,
                checksum,
                size,
            }
        } else {
            Self {
                encoding: Compression::None,
                payload: data.to_vec(),
                checksum,
                size,
            }
        }
    }

    /// Recovers the original bytes, verifying length and digest.
    pub fn into_bytes(self) -> Result<Vec<u8>, RpcError> {
        let data = match self.encoding {
            Compression::None => self.payload,
            Compression::Lz4 => lz4_flex::decompress_size_prepended(&self.payload)
                .map_err(RpcError::protocol)?,
        };

        if data.len() as u64 != self.size {
            return Err(RpcError::protocol("blob length mismatch"));
        }
        if sha256(&data) != self.checksum {
            return Err(RpcError::protocol("blob checksum mismatch"));
        }

        Ok(data)
    }

    /// Hex rendering of the content hash.
    #[must_use]
    pub fn checksum_hex(&self) -> String {
        hex(&self.checksum)
    }
}

/// Computes the SHA-256 digest of a byte string.
#[must_use]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Lowercase hex rendering of a digest.
#[must_use]
pub fn hex(digest: &[u8]) -> String {
    use std::fmt::Write;

    digest.iter().fold(String::with_capacity(digest.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

/// Filesystem statistics for `statfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FsStats {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub frsize: u32,
    pub namemax: u32,
}

/// What a bulk fetch should carry per path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchKind {
    Attr,
    Dir,
    Blob,
}

/// One item of a bulk fetch bundle.
///
/// Failures are embedded per item inside `meta`; a failed prefetch never
/// fails the bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleItem {
    pub path: String,
    pub meta: Metadata,
    pub dir: Option<Vec<DirEntry>>,
    pub blob: Option<FileContents>,
}

/// Requests from the remote host to the local host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// First message after connect. The connection is closed without reply
    /// on token mismatch.
    Handshake {
        token: String,
        protocol: u32,
        prefetch_paths: Vec<String>,
    },

    Getattr { path: String },
    Readdir { path: String },
    Readlink { path: String },

    OpenRead { path: String },
    Read { handle: u64, offset: u64, len: u32 },
    Close { handle: u64 },

    OpenWrite { path: String, flags: i32, mode: u32 },
    Write { handle: u64, offset: u64, data: Vec<u8> },
    Fsync { handle: u64, datasync: bool },
    Flush { handle: u64 },
    Truncate { path: String, handle: Option<u64>, size: u64 },

    Unlink { path: String },
    Mkdir { path: String, mode: u32 },
    Rmdir { path: String },
    Rename { from: String, to: String },
    Chmod { path: String, mode: u32 },
    Chown { path: String, uid: u32, gid: u32 },
    Utimens { path: String, atime_ns: i64, mtime_ns: i64 },
    Symlink { path: String, target: String },
    Link { path: String, target: String },
    Mknod { path: String, mode: u32, rdev: u64 },

    /// Fetch a set of paths plus their policy-defined prefetch closure.
    BulkFetch {
        paths: Vec<String>,
        depth: u32,
        kinds: Vec<FetchKind>,
    },

    /// Batched freshness check of previously cached metadata.
    Revalidate { entries: Vec<(String, Validator)> },

    /// Report blob contents already warm in the remote cache so the server
    /// skips prefetching them again this session.
    MarkCached { paths: Vec<String> },

    Statfs { path: String },
}

/// Responses from the local host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Handshook { root_version: u64 },
    Attr { meta: Metadata },
    Dir { entries: Vec<DirEntry> },
    Link { target: String },
    OpenedRead { handle: u64, attr: Attributes, len: u64 },
    OpenedWrite { handle: u64 },
    Data { data: Vec<u8> },
    Written { n: u32 },
    Bundle { items: Vec<BundleItem> },
    Changed { entries: Vec<(String, Metadata)> },
    Stats { stats: FsStats },
    Error { error: RpcError },
}

impl Request {
    /// Opcode carried in the frame header for this request.
    #[must_use]
    pub const fn opcode(&self) -> u8 {
        match self {
            Self::Handshake { .. } => 0x01,
            Self::Getattr { .. } => 0x02,
            Self::Readdir { .. } => 0x03,
            Self::Readlink { .. } => 0x04,
            Self::OpenRead { .. } => 0x05,
            Self::Read { .. } => 0x06,
            Self::Close { .. } => 0x07,
            Self::OpenWrite { .. } => 0x08,
            Self::Write { .. } => 0x09,
            Self::Fsync { .. } => 0x0a,
            Self::Flush { .. } => 0x0b,
            Self::Truncate { .. } => 0x0c,
            Self::Unlink { .. } => 0x0d,
            Self::Mkdir { .. } => 0x0e,
            Self::Rmdir { .. } => 0x0f,
            Self::Rename { .. } => 0x10,
            Self::Chmod { .. } => 0x11,
            Self::Chown { .. } => 0x12,
            Self::Utimens { .. } => 0x13,
            Self::Symlink { .. } => 0x14,
            Self::Link { .. } => 0x15,
            Self::Mknod { .. } => 0x16,
            Self::BulkFetch { .. } => 0x20,
            Self::Revalidate { .. } => 0x21,
            Self::MarkCached { .. } => 0x22,
            Self::Statfs { .. } => 0x23,
        }
    }

    /// Short operation name for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::Getattr { .. } => "getattr",
            Self::Readdir { .. } => "readdir",
            Self::Readlink { .. } => "readlink",
            Self::OpenRead { .. } => "open_read",
            Self::Read { .. } => "read",
            Self::Close { .. } => "close",
            Self::OpenWrite { .. } => "open_write",
            Self::Write { .. } => "write",
            Self::Fsync { .. } => "fsync",
            Self::Flush { .. } => "flush",
            Self::Truncate { .. } => "truncate",
            Self::Unlink { .. } => "unlink",
            Self::Mkdir { .. } => "mkdir",
            Self::Rmdir { .. } => "rmdir",
            Self::Rename { .. } => "rename",
            Self::Chmod { .. } => "chmod",
            Self::Chown { .. } => "chown",
            Self::Utimens { .. } => "utimens",
            Self::Symlink { .. } => "symlink",
            Self::Link { .. } => "link",
            Self::Mknod { .. } => "mknod",
            Self::BulkFetch { .. } => "bulk_fetch",
            Self::Revalidate { .. } => "revalidate",
            Self::MarkCached { .. } => "mark_cached",
            Self::Statfs { .. } => "statfs",
        }
    }
}

impl Response {
    /// Opcode carried in the frame header for this response.
    #[must_use]
    pub const fn opcode(&self) -> u8 {
        match self {
            Self::Ok => 0x40,
            Self::Handshook { .. } => 0x41,
            Self::Attr { .. } => 0x42,
            Self::Dir { .. } => 0x43,
            Self::Link { .. } => 0x44,
            Self::OpenedRead { .. } => 0x45,
            Self::OpenedWrite { .. } => 0x46,
            Self::Data { .. } => 0x47,
            Self::Written { .. } => 0x48,
            Self::Bundle { .. } => 0x49,
            Self::Changed { .. } => 0x4a,
            Self::Stats { .. } => 0x4b,
            Self::Error { .. } => 0x7f,
        }
    }
}

/// Whether an opcode byte is a known request opcode.
#[must_use]
pub const fn is_request_opcode(op: u8) -> bool {
    matches!(op, 0x01..=0x16 | 0x20..=0x23)
}

/// Whether an opcode byte is a known response opcode.
#[must_use]
pub const fn is_response_opcode(op: u8) -> bool {
    matches!(op, 0x40..=0x4b | 0x7f)
}
