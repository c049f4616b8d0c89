//! Cache keys and payloads.

use serde::{Deserialize, Serialize};

use outrun_protocol::{Attributes, DirEntry, RpcError};

/// Which metadata view of a path an entry caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetaKind {
    Attr,
    Dirlist,
    Readlink,
}

/// Key of one metadata entry: the operation it answers plus the path in the
/// local host's namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetaKey {
    pub kind: MetaKind,
    pub path: String,
}

impl MetaKey {
    #[must_use]
    pub fn attr(path: impl Into<String>) -> Self {
        Self {
            kind: MetaKind::Attr,
            path: path.into(),
        }
    }

    #[must_use]
    pub fn dirlist(path: impl Into<String>) -> Self {
        Self {
            kind: MetaKind::Dirlist,
            path: path.into(),
        }
    }

    #[must_use]
    pub fn readlink(path: impl Into<String>) -> Self {
        Self {
            kind: MetaKind::Readlink,
            path: path.into(),
        }
    }
}

/// What an entry holds.
///
/// `Negative` is a first-class kind: it caches the specific error an
/// operation produced, so the next identical call is answered locally
/// instead of paying a round trip to learn the same failure again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Attr {
        attr: Attributes,
        /// Content hash of the cached blob, when contents were fetched.
        blob: Option<String>,
    },
    Dirlist {
        entries: Vec<DirEntry>,
    },
    Readlink {
        target: String,
    },
    Negative {
        error: RpcError,
    },
}

impl Payload {
    /// Rough serialized size for cap accounting.
    #[must_use]
    pub fn approx_bytes(&self) -> u64 {
        serde_json::to_vec(self).map_or(64, |v| v.len() as u64)
    }

    /// The blob hash this payload pins, if any.
    #[must_use]
    pub fn blob_hash(&self) -> Option<&str> {
        match self {
            Self::Attr { blob, .. } => blob.as_deref(),
            _ => None,
        }
    }
}
