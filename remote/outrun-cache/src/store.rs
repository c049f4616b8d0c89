//! The cache store: in-memory index, caps, LRU, and coherence.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use nix::fcntl::{Flock, FlockArg};
use parking_lot::Mutex;
use thiserror::Error;

use outrun_protocol::{Metadata, RpcError, Validator};

use crate::blobs::BlobStore;
use crate::entry::{MetaKey, MetaKind, Payload};
use crate::flight::FlightGuards;
use crate::index::{self, EntryRecord, IndexWriter, LogRecord, Snapshot};

/// Size and entry limits, evaluated after every insert.
#[derive(Debug, Clone, Copy)]
pub struct CacheCaps {
    pub max_entries: usize,
    pub max_size: u64,
}

impl Default for CacheCaps {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            max_size: 20 * 1024 * 1024 * 1024,
        }
    }
}

/// Failures opening or maintaining the cache root.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Another session holds the LOCK file for this root.
    #[error("cache root is locked by another session")]
    Locked,

    #[error("cache i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
struct MetaEntry {
    payload: Payload,
    validator: Option<Validator>,
    last_use: u64,
    bytes: u64,
}

#[derive(Debug, Clone)]
struct BlobInfo {
    size: u64,
    last_use: u64,
    refs: usize,
}

/// Persistent cache with a single logical owner of its on-disk state.
///
/// Metadata reads go against the in-memory index; all disk mutation is
/// serialized through the writer thread. Blob files are written
/// content-addressed with temp-then-rename, so concurrent writers of the
/// same hash converge.
pub struct CacheStore {
    meta: DashMap<MetaKey, MetaEntry>,
    blobs: DashMap<String, BlobInfo>,
    blob_files: Arc<BlobStore>,
    writer: Option<IndexWriter>,
    caps: CacheCaps,
    /// Monotone logical clock for LRU recency; wall clocks skew.
    counter: AtomicU64,
    appends: AtomicU64,
    evict_lock: Mutex<()>,
    /// Single-flight gate for misses.
    pub flights: FlightGuards,
    degraded: AtomicBool,
    strikes: Mutex<HashMap<String, u32>>,
    root_version: Mutex<Option<u64>>,
    _lock: Flock<File>,
}

impl CacheStore {
    /// Opens the cache under `root`, replaying any persisted state and
    /// sweeping crash leftovers.
    pub fn open(root: &Path, caps: CacheCaps) -> Result<Self, CacheError> {
        std::fs::create_dir_all(root)?;

        let lock_file = File::create(root.join("LOCK"))?;
        let lock = Flock::lock(lock_file, FlockArg::LockExclusiveNonblock)
            .map_err(|_| CacheError::Locked)?;

        let blob_files = Arc::new(BlobStore::open(root)?);
        let replayed = index::replay(root);

        let meta = DashMap::new();
        let blobs: DashMap<String, BlobInfo> = DashMap::new();

        for (key, record) in replayed.entries {
            let mut payload = record.payload;

            // Re-link blob references against what actually survived on
            // disk; a hash without a file is a dead pointer.
            if let Payload::Attr { blob, .. } = &mut payload {
                if let Some(hash) = blob.clone() {
                    match blob_files.size_of(&hash) {
                        Some(size) => {
                            blobs
                                .entry(hash)
                                .and_modify(|info: &mut BlobInfo| info.refs += 1)
                                .or_insert(BlobInfo {
                                    size,
                                    last_use: record.last_use,
                                    refs: 1,
                                });
                        }
                        None => *blob = None,
                    }
                }
            }

            let bytes = payload.approx_bytes();
            meta.insert(
                key,
                MetaEntry {
                    payload,
                    validator: record.validator,
                    last_use: record.last_use,
                    bytes,
                },
            );
        }

        blob_files.sweep(|hash| blobs.contains_key(hash));

        let writer = IndexWriter::start(root, Arc::clone(&blob_files))?;

        tracing::info!(
            entries = meta.len(),
            blobs = blobs.len(),
            "cache opened"
        );

        Ok(Self {
            meta,
            blobs,
            blob_files,
            writer: Some(writer),
            caps,
            counter: AtomicU64::new(replayed.counter),
            appends: AtomicU64::new(0),
            evict_lock: Mutex::new(()),
            flights: FlightGuards::new(),
            degraded: AtomicBool::new(false),
            strikes: Mutex::new(HashMap::new()),
            root_version: Mutex::new(replayed.root_version),
            _lock: lock,
        })
    }

    fn writer(&self) -> &IndexWriter {
        self.writer.as_ref().expect("writer lives until shutdown")
    }

    fn touch(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record_append(&self) {
        let n = self.appends.fetch_add(1, Ordering::Relaxed) + 1;
        if n % IndexWriter::snapshot_interval() == 0 {
            self.writer().snapshot(self.build_snapshot());
        }
    }

    /// Binds the cache to the local host's current root version.
    ///
    /// A persisted cache from a different host (or reinstalled one) is
    /// worthless: everything is dropped before any read can return a stale
    /// value. Returns whether the existing contents were kept.
    pub fn begin_session(&self, root_version: u64) -> bool {
        let mut stored = self.root_version.lock();
        let kept = match *stored {
            Some(v) if v == root_version => true,
            None => true,
            Some(old) => {
                tracing::info!(old, new = root_version, "root version changed, dropping cache");
                self.clear();
                false
            }
        };

        *stored = Some(root_version);
        self.writer().append(LogRecord::RootVersion(root_version));
        kept
    }

    fn clear(&self) {
        self.meta.clear();
        let hashes: Vec<String> = self.blobs.iter().map(|e| e.key().clone()).collect();
        self.blobs.clear();
        for hash in hashes {
            self.writer().remove_blob(hash);
        }
        self.writer().snapshot(Snapshot::default());
    }

    /// Whether read-through is still enabled.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Looks up a metadata entry, refreshing its recency.
    #[must_use]
    pub fn get_meta(&self, key: &MetaKey) -> Option<Payload> {
        if self.is_degraded() {
            return None;
        }

        let mut entry = self.meta.get_mut(key)?;
        entry.last_use = self.touch();

        if let Some(hash) = entry.payload.blob_hash() {
            if let Some(mut info) = self.blobs.get_mut(hash) {
                info.last_use = entry.last_use;
            }
        }

        Some(entry.payload.clone())
    }

    /// Inserts an entry under its natural key and enforces the caps.
    ///
    /// `touched` distinguishes a direct fetch from an advisory prefetch:
    /// prefetched entries start with zero recency so they are the first to
    /// go if they never get used.
    pub fn insert_meta(
        &self,
        key: MetaKey,
        payload: Payload,
        validator: Option<Validator>,
        touched: bool,
    ) {
        if self.is_degraded() {
            return;
        }

        let last_use = if touched { self.touch() } else { 0 };
        let bytes = payload.approx_bytes();

        if let Some(hash) = payload.blob_hash() {
            if let Some(mut info) = self.blobs.get_mut(hash) {
                info.refs += 1;
            } else if let Some(size) = self.blob_files.size_of(hash) {
                self.blobs.insert(
                    hash.to_owned(),
                    BlobInfo {
                        size,
                        last_use,
                        refs: 1,
                    },
                );
            }
        }

        let old = self.meta.insert(
            key.clone(),
            MetaEntry {
                payload: payload.clone(),
                validator,
                last_use,
                bytes,
            },
        );
        if let Some(old) = old {
            self.deref_blob(&old.payload);
        }

        self.writer().append(LogRecord::Put(EntryRecord {
            key,
            payload,
            validator,
            last_use,
        }));
        self.record_append();
        self.enforce_caps();
    }

    /// Stores blob contents under their hash.
    ///
    /// The caller passes verified bytes (digest already checked against the
    /// wire checksum); the write itself is temp-then-rename with an fsync,
    /// which is one of the plane's few suspension points. Cap enforcement
    /// waits for the metadata insert that links the blob: a fresh blob is
    /// briefly unreferenced and must not be the first eviction victim.
    pub fn insert_blob(&self, hash: &str, data: &[u8]) -> Result<(), CacheError> {
        if self.is_degraded() {
            return Ok(());
        }

        let size = self.blob_files.insert(hash, data)?;
        let last_use = self.touch();

        self.blobs
            .entry(hash.to_owned())
            .and_modify(|info| {
                info.size = size;
                info.last_use = last_use;
            })
            .or_insert(BlobInfo {
                size,
                last_use,
                refs: 0,
            });

        Ok(())
    }

    /// Opens a cached blob for local reads, verifying its recorded size.
    pub fn open_blob(&self, hash: &str) -> Result<File, RpcError> {
        let recorded = self
            .blobs
            .get(hash)
            .map(|info| info.size)
            .ok_or_else(|| RpcError::CacheCorrupt(format!("unknown blob {hash}")))?;

        let file = self
            .blob_files
            .open_blob(hash)
            .map_err(|e| RpcError::CacheCorrupt(format!("blob {hash} unreadable: {e}")))?;

        let actual = file
            .metadata()
            .map_err(|e| RpcError::CacheCorrupt(e.to_string()))?
            .len();
        if actual != recorded {
            return Err(RpcError::CacheCorrupt(format!(
                "blob {hash} is {actual} bytes, expected {recorded}"
            )));
        }

        if let Some(mut info) = self.blobs.get_mut(hash) {
            info.last_use = self.touch();
        }

        Ok(file)
    }

    /// Reports a corrupt entry: invalidate, and after a second strike on
    /// the same key this session, disable read-through entirely.
    pub fn report_corrupt(&self, key: &MetaKey, detail: &str) {
        tracing::warn!(path = key.path, detail, "cache entry corrupt, invalidating");
        self.remove(key);

        let mut strikes = self.strikes.lock();
        let count = strikes.entry(format!("{:?}:{}", key.kind, key.path)).or_insert(0);
        *count += 1;

        if *count >= 2 && !self.degraded.swap(true, Ordering::Relaxed) {
            tracing::error!("cache corrupt twice for the same key, disabling read-through");
        }
    }

    /// Removes one entry and its blob pin.
    pub fn remove(&self, key: &MetaKey) {
        if let Some((_, old)) = self.meta.remove(key) {
            self.deref_blob(&old.payload);
            self.writer().append(LogRecord::Del(key.clone()));
            self.record_append();
        }
    }

    fn deref_blob(&self, payload: &Payload) {
        if let Some(hash) = payload.blob_hash() {
            if let Some(mut info) = self.blobs.get_mut(hash) {
                info.refs = info.refs.saturating_sub(1);
            }
        }
    }

    /// Current entry count (metadata entries).
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.meta.len()
    }

    /// Current total bytes on disk (index payloads plus blob files).
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        let meta: u64 = self.meta.iter().map(|e| e.bytes).sum();
        let blobs: u64 = self.blobs.iter().map(|e| e.size).sum();
        meta + blobs
    }

    /// Evicts until both caps hold.
    ///
    /// Order: orphan blobs first, then entries by ascending recency with
    /// ties broken toward larger on-disk footprint. A referenced blob is
    /// never evicted directly; it becomes an orphan when its last referring
    /// entry goes.
    fn enforce_caps(&self) {
        let _guard = self.evict_lock.lock();

        loop {
            let over_entries = self.meta.len() > self.caps.max_entries;
            let over_bytes = self.total_bytes() > self.caps.max_size;
            if !over_entries && !over_bytes {
                break;
            }

            // Orphan blobs are pure reclaim: no entry can still hit them.
            let orphan = self
                .blobs
                .iter()
                .filter(|e| e.refs == 0)
                .min_by_key(|e| e.last_use)
                .map(|e| e.key().clone());

            if over_bytes {
                if let Some(hash) = orphan {
                    self.blobs.remove(&hash);
                    self.writer().remove_blob(hash);
                    continue;
                }
            }

            let victim = self
                .meta
                .iter()
                .min_by(|a, b| {
                    a.last_use
                        .cmp(&b.last_use)
                        .then(b.bytes.cmp(&a.bytes))
                })
                .map(|e| e.key().clone());

            let Some(key) = victim else {
                // Nothing left to evict but still over budget: only orphan
                // blobs remain.
                if let Some(hash) = self
                    .blobs
                    .iter()
                    .filter(|e| e.refs == 0)
                    .min_by_key(|e| e.last_use)
                    .map(|e| e.key().clone())
                {
                    self.blobs.remove(&hash);
                    self.writer().remove_blob(hash);
                    continue;
                }
                break;
            };

            self.remove(&key);
        }
    }

    /// Entries that need a freshness check at session start, as
    /// `(path, validator)` pairs. Negative entries carry a zero validator;
    /// the server reports them changed if the path now exists.
    #[must_use]
    pub fn entries_for_revalidation(&self) -> Vec<(String, Validator)> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();

        for entry in &self.meta {
            let path = entry.key().path.clone();
            if !seen.insert(path.clone()) {
                continue;
            }

            let validator = entry.validator.unwrap_or(Validator {
                mtime_ns: 0,
                size: 0,
                ino: 0,
            });
            out.push((path, validator));
        }

        out
    }

    /// Applies the server's answer to a revalidation batch: every reported
    /// path has changed, so its entries are replaced or dropped and its
    /// blob pin released.
    pub fn apply_revalidation(&self, changed: &[(String, Metadata)]) {
        for (path, meta) in changed {
            for kind in [MetaKind::Attr, MetaKind::Dirlist, MetaKind::Readlink] {
                let key = MetaKey {
                    kind,
                    path: path.clone(),
                };
                if !self.meta.contains_key(&key) {
                    continue;
                }

                match kind {
                    MetaKind::Attr => {
                        if let Some(attr) = meta.attr {
                            // Contents may differ under the new validator;
                            // the blob re-fetches on demand.
                            self.insert_meta(
                                key,
                                Payload::Attr { attr, blob: None },
                                meta.validator,
                                false,
                            );
                        } else if let Some(error) = meta.error.clone() {
                            self.insert_meta(key, Payload::Negative { error }, None, false);
                        } else {
                            self.remove(&key);
                        }
                    }
                    MetaKind::Dirlist => {
                        // Listings are cheap to refetch and expensive to
                        // get wrong.
                        self.remove(&key);
                    }
                    MetaKind::Readlink => {
                        if let Some(target) = meta.link.clone() {
                            self.insert_meta(
                                key,
                                Payload::Readlink { target },
                                meta.validator,
                                false,
                            );
                        } else if let Some(error) = meta.error.clone() {
                            self.insert_meta(key, Payload::Negative { error }, None, false);
                        } else {
                            self.remove(&key);
                        }
                    }
                }
            }
        }
    }

    /// Paths whose contents are warm, for telling the server not to push
    /// those blobs again.
    #[must_use]
    pub fn warm_blob_paths(&self) -> Vec<String> {
        self.meta
            .iter()
            .filter(|e| e.payload.blob_hash().is_some())
            .map(|e| e.key().path.clone())
            .collect()
    }

    fn build_snapshot(&self) -> Snapshot {
        Snapshot {
            root_version: *self.root_version.lock(),
            entries: self
                .meta
                .iter()
                .map(|e| EntryRecord {
                    key: e.key().clone(),
                    payload: e.payload.clone(),
                    validator: e.validator,
                    last_use: e.last_use,
                })
                .collect(),
            counter: self.counter.load(Ordering::SeqCst),
        }
    }

    /// Compacts the on-disk state.
    pub fn save(&self) {
        self.writer().snapshot(self.build_snapshot());
    }

    /// Flushes, compacts, and releases the writer. The LOCK drops with the
    /// store.
    pub fn shutdown(mut self) {
        if let Some(writer) = self.writer.take() {
            writer.snapshot(self.build_snapshot());
            writer.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outrun_protocol::message::{hex, sha256};
    use outrun_protocol::{Attributes, RpcError};

    fn attrs(size: u64) -> Attributes {
        Attributes {
            mode: libc::S_IFREG | 0o644,
            uid: 0,
            gid: 0,
            size,
            nlink: 1,
            rdev: 0,
            atime_ns: 0,
            mtime_ns: 1,
            ctime_ns: 1,
        }
    }

    fn small_caps() -> CacheCaps {
        CacheCaps {
            max_entries: 4,
            max_size: 1024 * 1024,
        }
    }

    #[test]
    fn test_insert_get_and_persistence() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = CacheStore::open(dir.path(), CacheCaps::default()).unwrap();
            store.begin_session(1);
            store.insert_meta(
                MetaKey::attr("/usr/bin/true"),
                Payload::Attr {
                    attr: attrs(42),
                    blob: None,
                },
                None,
                true,
            );
            assert!(store.get_meta(&MetaKey::attr("/usr/bin/true")).is_some());
            store.shutdown();
        }

        let store = CacheStore::open(dir.path(), CacheCaps::default()).unwrap();
        assert!(store.begin_session(1));
        assert!(store.get_meta(&MetaKey::attr("/usr/bin/true")).is_some());
        store.shutdown();
    }

    #[test]
    fn test_second_open_while_locked_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path(), CacheCaps::default()).unwrap();

        assert!(matches!(
            CacheStore::open(dir.path(), CacheCaps::default()),
            Err(CacheError::Locked)
        ));

        store.shutdown();
    }

    #[test]
    fn test_root_version_change_drops_cache() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = CacheStore::open(dir.path(), CacheCaps::default()).unwrap();
            store.begin_session(1);
            store.insert_meta(
                MetaKey::attr("/usr/lib/libc.so.6"),
                Payload::Attr {
                    attr: attrs(1),
                    blob: None,
                },
                None,
                true,
            );
            store.shutdown();
        }

        let store = CacheStore::open(dir.path(), CacheCaps::default()).unwrap();
        assert!(!store.begin_session(2));
        assert!(store.get_meta(&MetaKey::attr("/usr/lib/libc.so.6")).is_none());
        store.shutdown();
    }

    #[test]
    fn test_entry_cap_enforced_after_insert() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path(), small_caps()).unwrap();
        store.begin_session(1);

        for i in 0..16 {
            store.insert_meta(
                MetaKey::attr(format!("/usr/bin/tool{i}")),
                Payload::Attr {
                    attr: attrs(i),
                    blob: None,
                },
                None,
                true,
            );
            assert!(store.entry_count() <= 4);
        }

        // The most recent entries survive.
        assert!(store.get_meta(&MetaKey::attr("/usr/bin/tool15")).is_some());
        assert!(store.get_meta(&MetaKey::attr("/usr/bin/tool0")).is_none());
        store.shutdown();
    }

    #[test]
    fn test_size_cap_evicts_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(
            dir.path(),
            CacheCaps {
                max_entries: 64,
                max_size: 4096,
            },
        )
        .unwrap();
        store.begin_session(1);

        for i in 0..4 {
            let data = vec![i as u8; 2048];
            let hash = hex(&sha256(&data));
            store.insert_blob(&hash, &data).unwrap();
            store.insert_meta(
                MetaKey::attr(format!("/usr/lib/lib{i}.so")),
                Payload::Attr {
                    attr: attrs(2048),
                    blob: Some(hash),
                },
                None,
                true,
            );
            assert!(store.total_bytes() <= 4096);
        }

        store.shutdown();
    }

    #[test]
    fn test_lru_recency_is_monotone() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path(), CacheCaps::default()).unwrap();
        store.begin_session(1);

        let key = MetaKey::attr("/usr/bin/env");
        store.insert_meta(
            key.clone(),
            Payload::Attr {
                attr: attrs(1),
                blob: None,
            },
            None,
            true,
        );

        let mut last = 0;
        for _ in 0..16 {
            store.get_meta(&key).unwrap();
            let current = store.meta.get(&key).unwrap().last_use;
            assert!(current > last);
            last = current;
        }

        store.shutdown();
    }

    #[test]
    fn test_untouched_prefetch_evicts_before_used_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path(), small_caps()).unwrap();
        store.begin_session(1);

        store.insert_meta(
            MetaKey::attr("/usr/bin/used"),
            Payload::Attr {
                attr: attrs(1),
                blob: None,
            },
            None,
            true,
        );
        for i in 0..3 {
            store.insert_meta(
                MetaKey::attr(format!("/usr/lib/prefetched{i}.so")),
                Payload::Attr {
                    attr: attrs(1),
                    blob: None,
                },
                None,
                false,
            );
        }

        // One more insert pushes past the cap; a never-used prefetch goes.
        store.insert_meta(
            MetaKey::attr("/usr/bin/new"),
            Payload::Attr {
                attr: attrs(1),
                blob: None,
            },
            None,
            true,
        );

        assert!(store.get_meta(&MetaKey::attr("/usr/bin/used")).is_some());
        store.shutdown();
    }

    #[test]
    fn test_negative_entries_cache_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path(), CacheCaps::default()).unwrap();
        store.begin_session(1);

        let key = MetaKey::attr("/usr/lib/python3/__pycache__/foo.cpython-311.pyc");
        store.insert_meta(
            key.clone(),
            Payload::Negative {
                error: RpcError::NotFound,
            },
            None,
            false,
        );

        match store.get_meta(&key) {
            Some(Payload::Negative { error }) => assert_eq!(error, RpcError::NotFound),
            other => panic!("unexpected payload: {other:?}"),
        }

        store.shutdown();
    }

    #[test]
    fn test_corrupt_twice_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path(), CacheCaps::default()).unwrap();
        store.begin_session(1);

        let key = MetaKey::attr("/usr/bin/flaky");
        store.report_corrupt(&key, "checksum mismatch");
        assert!(!store.is_degraded());

        store.report_corrupt(&key, "checksum mismatch again");
        assert!(store.is_degraded());
        assert!(store.get_meta(&key).is_none());

        store.shutdown();
    }

    #[test]
    fn test_revalidation_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path(), CacheCaps::default()).unwrap();
        store.begin_session(1);

        let validator = Validator {
            mtime_ns: 10,
            size: 1,
            ino: 99,
        };
        store.insert_meta(
            MetaKey::attr("/usr/lib/libz.so"),
            Payload::Attr {
                attr: attrs(1),
                blob: None,
            },
            Some(validator),
            true,
        );

        let pending = store.entries_for_revalidation();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, "/usr/lib/libz.so");
        assert_eq!(pending[0].1, validator);

        // Server says the file was replaced.
        let fresh = Metadata {
            attr: Some(attrs(2)),
            link: None,
            error: None,
            validator: Some(Validator {
                mtime_ns: 20,
                size: 2,
                ino: 100,
            }),
        };
        store.apply_revalidation(&[("/usr/lib/libz.so".to_owned(), fresh)]);

        match store.get_meta(&MetaKey::attr("/usr/lib/libz.so")) {
            Some(Payload::Attr { attr, blob }) => {
                assert_eq!(attr.size, 2);
                assert!(blob.is_none());
            }
            other => panic!("unexpected payload: {other:?}"),
        }

        store.shutdown();
    }

    #[test]
    fn test_blob_sharing_by_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path(), CacheCaps::default()).unwrap();
        store.begin_session(1);

        let data = b"identical library bytes";
        let hash = hex(&sha256(data));
        store.insert_blob(&hash, data).unwrap();

        for path in ["/usr/lib/a.so", "/opt/vendor/a.so"] {
            store.insert_meta(
                MetaKey::attr(path),
                Payload::Attr {
                    attr: attrs(data.len() as u64),
                    blob: Some(hash.clone()),
                },
                None,
                true,
            );
        }

        // One blob on disk, two referrers.
        assert_eq!(store.blobs.get(&hash).unwrap().refs, 2);
        let file = store.open_blob(&hash).unwrap();
        assert_eq!(file.metadata().unwrap().len(), data.len() as u64);

        store.shutdown();
    }
}
