//! Open-file handle table.

use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use outrun_protocol::{RpcError, RpcResult};

/// Number of lock shards in the table.
const SHARDS: usize = 16;

/// Connection-scoped table of open files keyed by opaque handle.
///
/// Handles are meaningless outside the connection that created them;
/// dropping the table closes every file it still holds.
pub struct HandleTable {
    files: DashMap<u64, Arc<File>>,
    next: AtomicU64,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            files: DashMap::with_shard_amount(SHARDS),
            next: AtomicU64::new(1),
        }
    }

    /// Registers a file and returns its handle.
    pub fn insert(&self, file: File) -> u64 {
        let handle = self.next.fetch_add(1, Ordering::Relaxed);
        self.files.insert(handle, Arc::new(file));
        handle
    }

    /// Looks up an open file.
    pub fn get(&self, handle: u64) -> RpcResult<Arc<File>> {
        self.files
            .get(&handle)
            .map(|f| Arc::clone(&f))
            .ok_or(RpcError::BadHandle)
    }

    /// Removes a handle, closing the file once the last reader drops it.
    pub fn remove(&self, handle: u64) -> RpcResult<()> {
        self.files
            .remove(&handle)
            .map(|_| ())
            .ok_or(RpcError::BadHandle)
    }

    /// Number of open handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
