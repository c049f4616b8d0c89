//! FUSE filesystem and read-side policy.
//!
//! Upcalls arrive on the FUSE session thread and are immediately handed to
//! the async runtime, bounded by a worker semaphore; the reply object
//! travels with the task and is completed from there. All actual policy
//! lives in [`FsCore`], which the session also uses directly during
//! bring-up.
//!
//! Per-operation behavior:
//!
//! - `lookup`/`getattr` consult the attribute cache, then the parent's
//!   cached listing (a name missing from a complete snapshot is a miss the
//!   kernel can be told about without a round trip), then bulk-fetch.
//! - `readdir` on a system directory bulk-fetches with `depth = 1` so the
//!   children's attributes land in the same reply.
//! - `open` for read on a system path wants the whole blob; subsequent
//!   reads are local. Everything else streams.
//! - Writes and other mutations pass through and invalidate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use fuser::{
    FileAttr, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use tokio::sync::Semaphore;

use outrun_cache::{CacheStore, MetaKey, Payload};
use outrun_protocol::message::UTIME_OMIT_NS;
use outrun_protocol::{
    Attributes, BundleItem, DirEntry, FetchKind, Metadata, RpcError, RpcResult, SystemPaths,
};

use crate::client::RpcClient;
use crate::inode::{child_path, to_file_attr, InodeTable, ROOT_INO};

/// Kernel-side attribute validity.
const TTL: Duration = Duration::from_secs(1);

/// Streaming read chunk bound.
const READ_CHUNK: u32 = 1024 * 1024;

/// State of one open file handle.
///
/// The policy is fixed at open time: a cached open never turns into a
/// streaming one or vice versa.
enum FileState {
    /// Served from a local blob.
    Cached(Arc<std::fs::File>),
    /// Reads proxied through an upstream handle.
    Streaming { remote: u64 },
    /// Write passthrough on an upstream handle.
    Writing { remote: u64 },
}

/// The policy core shared by the FUSE glue and the session.
pub struct FsCore {
    client: Arc<RpcClient>,
    cache: Arc<CacheStore>,
    system: SystemPaths,
    pub(crate) inodes: InodeTable,
    handles: DashMap<u64, FileState>,
    next_fh: AtomicU64,
    workers: Arc<Semaphore>,
    prefetch_depth: u32,
}

impl FsCore {
    /// Builds the core around a connected client and an opened cache.
    #[must_use]
    pub fn new(
        client: Arc<RpcClient>,
        cache: Arc<CacheStore>,
        system: SystemPaths,
        workers: usize,
        prefetch_depth: u32,
    ) -> Self {
        Self {
            client,
            cache,
            system,
            inodes: InodeTable::new(),
            handles: DashMap::with_shard_amount(16),
            next_fh: AtomicU64::new(1),
            workers: Arc::new(Semaphore::new(workers)),
            prefetch_depth,
        }
    }

    fn path_of(&self, ino: u64) -> RpcResult<String> {
        self.inodes.path_of(ino).ok_or(RpcError::NotFound)
    }

    /// Stops admitting upcalls; in-flight ones drain as they finish.
    pub fn drain(&self) {
        self.workers.close();
    }

    // ------------------------------------------------------------------
    // Bundle ingestion
    // ------------------------------------------------------------------

    /// Inserts every returned bundle item under its natural key.
    ///
    /// Prefetch is advisory: even if the speculation was wrong, later
    /// misses will benefit. The primary path is inserted as touched so it
    /// outlives unused speculation in LRU order.
    fn ingest(&self, items: &[BundleItem], primary: &str) {
        for item in items {
            if !self.system.contains(&item.path) {
                continue;
            }
            let touched = item.path == primary;

            if let Some(error) = &item.meta.error {
                self.cache.insert_meta(
                    MetaKey::attr(&item.path),
                    Payload::Negative {
                        error: error.clone(),
                    },
                    None,
                    touched,
                );
                continue;
            }

            if let Some(attr) = item.meta.attr {
                let blob = match &item.blob {
                    Some(contents) => {
                        let hash = contents.checksum_hex();
                        match contents.clone().into_bytes() {
                            Ok(data) => match self.cache.insert_blob(&hash, &data) {
                                Ok(()) => Some(hash),
                                Err(e) => {
                                    tracing::warn!(path = item.path, error = %e, "blob store failed");
                                    None
                                }
                            },
                            Err(e) => {
                                tracing::warn!(path = item.path, error = %e, "blob failed verification");
                                None
                            }
                        }
                    }
                    // A re-fetch without contents keeps an existing warm
                    // blob as long as the validator still matches.
                    None => self.warm_hash_if_unchanged(&item.path, item.meta.validator),
                };

                self.cache.insert_meta(
                    MetaKey::attr(&item.path),
                    Payload::Attr { attr, blob },
                    item.meta.validator,
                    touched,
                );
            }

            if let Some(target) = &item.meta.link {
                self.cache.insert_meta(
                    MetaKey::readlink(&item.path),
                    Payload::Readlink {
                        target: target.clone(),
                    },
                    item.meta.validator,
                    touched,
                );
            }

            if let Some(entries) = &item.dir {
                self.cache.insert_meta(
                    MetaKey::dirlist(&item.path),
                    Payload::Dirlist {
                        entries: entries.clone(),
                    },
                    item.meta.validator,
                    touched,
                );
            }
        }
    }

    fn warm_hash_if_unchanged(
        &self,
        path: &str,
        validator: Option<outrun_protocol::Validator>,
    ) -> Option<String> {
        let payload = self.cache.get_meta(&MetaKey::attr(path))?;
        let Payload::Attr { blob, .. } = payload else {
            return None;
        };
        // Only trust the old blob when both sides agree on the version.
        validator?;
        blob
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    /// A name absent from the parent's cached complete listing (or under a
    /// negatively cached parent) is known missing without a round trip.
    fn absent_by_parent(&self, path: &str) -> bool {
        let Some((parent, name)) = split_parent(path) else {
            return false;
        };
        if !self.system.contains(parent) {
            return false;
        }

        match self.cache.get_meta(&MetaKey::attr(parent)) {
            Some(Payload::Negative { .. }) => return true,
            _ => {}
        }

        match self.cache.get_meta(&MetaKey::dirlist(parent)) {
            Some(Payload::Dirlist { entries }) => !entries.iter().any(|e| e.name == name),
            _ => false,
        }
    }

    /// Attributes of a path, from cache where allowed.
    pub async fn attr_of(&self, path: &str) -> RpcResult<Attributes> {
        if !self.system.contains(path) {
            return meta_attr(self.client.getattr(path).await?);
        }

        let key = MetaKey::attr(path);
        if let Some(payload) = self.cache.get_meta(&key) {
            return payload_attr(&payload);
        }
        if self.absent_by_parent(path) {
            return Err(RpcError::NotFound);
        }

        let _flight = self.cache.flights.acquire(key.clone()).await;
        if let Some(payload) = self.cache.get_meta(&key) {
            return payload_attr(&payload);
        }

        let items = self
            .client
            .bulk_fetch(
                vec![path.to_owned()],
                self.prefetch_depth,
                vec![FetchKind::Attr],
            )
            .await?;
        self.ingest(&items, path);

        primary_meta(&items, path).and_then(meta_attr).map(Attributes::as_readonly)
    }

    /// Directory listing snapshot of a path.
    pub async fn dirlist_of(&self, path: &str) -> RpcResult<Vec<DirEntry>> {
        if !self.system.contains(path) {
            return self.client.readdir(path).await;
        }

        let key = MetaKey::dirlist(path);
        if let Some(payload) = self.cache.get_meta(&key) {
            return payload_dir(&payload);
        }
        if let Some(Payload::Negative { error }) = self.cache.get_meta(&MetaKey::attr(path)) {
            return Err(error);
        }

        let _flight = self.cache.flights.acquire(key.clone()).await;
        if let Some(payload) = self.cache.get_meta(&key) {
            return payload_dir(&payload);
        }

        let items = self
            .client
            .bulk_fetch(
                vec![path.to_owned()],
                1,
                vec![FetchKind::Attr, FetchKind::Dir],
            )
            .await?;
        self.ingest(&items, path);

        let meta = primary_meta(&items, path)?;
        if let Some(error) = meta.error {
            return Err(error);
        }
        items
            .iter()
            .find(|i| i.path == path)
            .and_then(|i| i.dir.clone())
            .ok_or(RpcError::NotADirectory)
    }

    /// Symlink target of a path.
    pub async fn readlink_of(&self, path: &str) -> RpcResult<String> {
        if !self.system.contains(path) {
            return self.client.readlink(path).await;
        }

        let key = MetaKey::readlink(path);
        if let Some(payload) = self.cache.get_meta(&key) {
            return payload_link(&payload);
        }
        match self.cache.get_meta(&MetaKey::attr(path)) {
            Some(Payload::Negative { error }) => return Err(error),
            Some(Payload::Attr { attr, .. }) if !attr.is_symlink() => {
                return Err(RpcError::NotASymlink)
            }
            _ => {}
        }

        let _flight = self.cache.flights.acquire(key.clone()).await;
        if let Some(payload) = self.cache.get_meta(&key) {
            return payload_link(&payload);
        }

        let items = self
            .client
            .bulk_fetch(
                vec![path.to_owned()],
                self.prefetch_depth,
                vec![FetchKind::Attr],
            )
            .await?;
        self.ingest(&items, path);

        let meta = primary_meta(&items, path)?;
        if let Some(error) = meta.error {
            return Err(error);
        }
        meta.link.ok_or(RpcError::NotASymlink)
    }

    // ------------------------------------------------------------------
    // File handles
    // ------------------------------------------------------------------

    fn register(&self, state: FileState) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(fh, state);
        fh
    }

    /// Opens a path for reading, deciding cached versus streaming once.
    pub async fn open_for_read(&self, path: &str) -> RpcResult<u64> {
        if self.system.contains(path) {
            // One bulk fetch brings the attributes, the whole blob, and the
            // dependency closure together.
            if let Some(file) = self.cached_blob(path).await? {
                return Ok(self.register(FileState::Cached(Arc::new(file))));
            }
        }

        let (remote, _attr, _len) = self.client.open_read(path).await?;
        Ok(self.register(FileState::Streaming { remote }))
    }

    /// Returns an open local blob for the path, fetching contents if the
    /// byte budget allows. `None` means the caller should stream instead.
    async fn cached_blob(&self, path: &str) -> RpcResult<Option<std::fs::File>> {
        let key = MetaKey::attr(path);

        for attempt in 0..2 {
            let hash = match self.cache.get_meta(&key) {
                Some(Payload::Attr {
                    blob: Some(hash), ..
                }) => Some(hash),
                Some(Payload::Negative { error }) => return Err(error),
                _ => None,
            };

            if let Some(hash) = hash {
                match self.cache.open_blob(&hash) {
                    Ok(file) => return Ok(Some(file)),
                    Err(RpcError::CacheCorrupt(detail)) => {
                        // Invalidate and fall through to a refetch.
                        self.cache.report_corrupt(&key, &detail);
                    }
                    Err(e) => return Err(e),
                }
            } else if attempt > 0 {
                // Fetched once and still no blob: over the bundle budget or
                // not a regular file after all. Stream it.
                return Ok(None);
            }

            let _flight = self.cache.flights.acquire(key.clone()).await;
            if matches!(
                self.cache.get_meta(&key),
                Some(Payload::Attr { blob: Some(_), .. })
            ) {
                continue;
            }

            let items = self
                .client
                .bulk_fetch(
                    vec![path.to_owned()],
                    self.prefetch_depth,
                    vec![FetchKind::Attr, FetchKind::Blob],
                )
                .await?;
            self.ingest(&items, path);
        }

        // Second corruption strike lands here; the cache is already
        // degraded and streaming is the safe fallback.
        Ok(None)
    }

    /// Opens a path for writing; never cached.
    pub async fn open_for_write(&self, path: &str, flags: i32, mode: u32) -> RpcResult<u64> {
        let remote = self.client.open_write(path, flags, mode).await?;
        self.invalidate(path);
        Ok(self.register(FileState::Writing { remote }))
    }

    /// Reads from an open handle.
    pub async fn read_handle(&self, fh: u64, offset: u64, size: u32) -> RpcResult<Vec<u8>> {
        enum Plan {
            Local(Arc<std::fs::File>),
            Remote(u64),
        }

        let plan = {
            let state = self.handles.get(&fh).ok_or(RpcError::BadHandle)?;
            match &*state {
                FileState::Cached(file) => Plan::Local(Arc::clone(file)),
                FileState::Streaming { remote } | FileState::Writing { remote } => {
                    Plan::Remote(*remote)
                }
            }
        };

        match plan {
            Plan::Local(file) => {
                let size = size as usize;
                tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
                    use std::os::unix::fs::FileExt;

                    let mut buf = vec![0u8; size];
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
                })
                .await
                .map_err(|e| RpcError::Io(e.to_string()))?
                .map_err(RpcError::from)
            }
            Plan::Remote(remote) => {
                // Large reads go out in fixed chunks so one request never
                // monopolizes a connection.
                let mut out = Vec::with_capacity(size as usize);
                let mut at = offset;
                let mut remaining = size;

                while remaining > 0 {
                    let chunk = remaining.min(READ_CHUNK);
                    let data = self.client.read(remote, at, chunk).await?;
                    let got = data.len() as u32;
                    out.extend_from_slice(&data);
                    if got < chunk {
                        break;
                    }
                    at += u64::from(got);
                    remaining -= got;
                }

                Ok(out)
            }
        }
    }

    /// Writes through an open write handle.
    pub async fn write_handle(&self, fh: u64, offset: u64, data: Vec<u8>) -> RpcResult<u32> {
        let remote = {
            let state = self.handles.get(&fh).ok_or(RpcError::BadHandle)?;
            match &*state {
                FileState::Writing { remote } => *remote,
                _ => return Err(RpcError::BadHandle),
            }
        };
        self.client.write(remote, offset, data).await
    }

    pub async fn flush_handle(&self, fh: u64) -> RpcResult<()> {
        let remote = {
            let state = self.handles.get(&fh).ok_or(RpcError::BadHandle)?;
            match &*state {
                FileState::Writing { remote } => Some(*remote),
                _ => None,
            }
        };
        match remote {
            Some(remote) => self.client.flush(remote).await,
            None => Ok(()),
        }
    }

    pub async fn fsync_handle(&self, fh: u64, datasync: bool) -> RpcResult<()> {
        let remote = {
            let state = self.handles.get(&fh).ok_or(RpcError::BadHandle)?;
            match &*state {
                FileState::Writing { remote } => Some(*remote),
                _ => None,
            }
        };
        match remote {
            Some(remote) => self.client.fsync(remote, datasync).await,
            None => Ok(()),
        }
    }

    /// Closes a handle, releasing the upstream one if any.
    pub async fn release_handle(&self, fh: u64) -> RpcResult<()> {
        let Some((_, state)) = self.handles.remove(&fh) else {
            return Err(RpcError::BadHandle);
        };

        match state {
            FileState::Cached(_) => Ok(()),
            FileState::Streaming { remote } | FileState::Writing { remote } => {
                self.client.close(remote).await
            }
        }
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Drops every cache entry the mutation of `path` could have stalled.
    fn invalidate(&self, path: &str) {
        self.cache.remove(&MetaKey::attr(path));
        self.cache.remove(&MetaKey::dirlist(path));
        self.cache.remove(&MetaKey::readlink(path));

        if let Some((parent, _)) = split_parent(path) {
            self.cache.remove(&MetaKey::dirlist(parent));
        }
    }

    pub async fn unlink_path(&self, path: &str) -> RpcResult<()> {
        self.client.unlink(path).await?;
        self.invalidate(path);
        self.inodes.forget_path(path);
        Ok(())
    }

    pub async fn rmdir_path(&self, path: &str) -> RpcResult<()> {
        self.client.rmdir(path).await?;
        self.invalidate(path);
        self.inodes.forget_path(path);
        Ok(())
    }

    pub async fn rename_path(&self, from: &str, to: &str) -> RpcResult<()> {
        self.client.rename(from, to).await?;
        self.invalidate(from);
        self.invalidate(to);
        self.inodes.rename(from, to);
        Ok(())
    }

    /// Attribute fetch that bypasses the cache, for freshly mutated paths.
    async fn fresh_attr(&self, path: &str) -> RpcResult<Attributes> {
        meta_attr(self.client.getattr(path).await?)
    }

    pub async fn setattr_path(
        &self,
        path: &str,
        fh: Option<u64>,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime_ns: Option<i64>,
        mtime_ns: Option<i64>,
    ) -> RpcResult<Attributes> {
        if let Some(size) = size {
            let remote = fh.and_then(|fh| {
                self.handles.get(&fh).and_then(|state| match &*state {
                    FileState::Writing { remote } => Some(*remote),
                    _ => None,
                })
            });
            self.client.truncate(path, remote, size).await?;
        }

        if let Some(mode) = mode {
            self.client.chmod(path, mode & 0o7777).await?;
        }

        if uid.is_some() || gid.is_some() {
            let current = self.fresh_attr(path).await?;
            self.client
                .chown(
                    path,
                    uid.unwrap_or(current.uid),
                    gid.unwrap_or(current.gid),
                )
                .await?;
        }

        if atime_ns.is_some() || mtime_ns.is_some() {
            self.client
                .utimens(
                    path,
                    atime_ns.unwrap_or(UTIME_OMIT_NS),
                    mtime_ns.unwrap_or(UTIME_OMIT_NS),
                )
                .await?;
        }

        self.invalidate(path);
        self.fresh_attr(path).await
    }

    /// Statistics of the projected filesystem.
    pub async fn statfs_path(&self, path: &str) -> RpcResult<outrun_protocol::FsStats> {
        self.client.statfs(path).await
    }

    pub(crate) fn client(&self) -> &Arc<RpcClient> {
        &self.client
    }
}

fn split_parent(path: &str) -> Option<(&str, &str)> {
    let idx = path.rfind('/')?;
    let name = &path[idx + 1..];
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    (!name.is_empty()).then_some((parent, name))
}

fn meta_attr(meta: Metadata) -> RpcResult<Attributes> {
    if let Some(error) = meta.error {
        return Err(error);
    }
    meta.attr
        .ok_or_else(|| RpcError::protocol("metadata without attributes"))
}

fn payload_attr(payload: &Payload) -> RpcResult<Attributes> {
    match payload {
        // Cached entries are projected read-only: the session treats system
        // paths as immutable.
        Payload::Attr { attr, .. } => Ok(attr.as_readonly()),
        Payload::Negative { error } => Err(error.clone()),
        _ => Err(RpcError::protocol("attr lookup hit non-attr payload")),
    }
}

fn payload_dir(payload: &Payload) -> RpcResult<Vec<DirEntry>> {
    match payload {
        Payload::Dirlist { entries } => Ok(entries.clone()),
        Payload::Negative { error } => Err(error.clone()),
        _ => Err(RpcError::protocol("dirlist lookup hit non-dir payload")),
    }
}

fn payload_link(payload: &Payload) -> RpcResult<String> {
    match payload {
        Payload::Readlink { target } => Ok(target.clone()),
        Payload::Negative { error } => Err(error.clone()),
        _ => Err(RpcError::protocol("readlink lookup hit non-link payload")),
    }
}

fn primary_meta(items: &[BundleItem], path: &str) -> RpcResult<Metadata> {
    items
        .iter()
        .find(|i| i.path == path)
        .map(|i| i.meta.clone())
        .ok_or_else(|| RpcError::protocol("bundle missing its primary item"))
}

fn time_ns(t: TimeOrNow) -> i64 {
    let time = match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    };
    time.duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
}

/// The `fuser` adapter over [`FsCore`].
pub struct OutrunFs {
    core: Arc<FsCore>,
    rt: tokio::runtime::Handle,
}

impl OutrunFs {
    /// Wraps the core for mounting; upcalls run on the given runtime.
    #[must_use]
    pub fn new(core: Arc<FsCore>, rt: tokio::runtime::Handle) -> Self {
        Self { core, rt }
    }
}

/// Dispatches one upcall onto the runtime under the worker cap.
macro_rules! upcall {
    ($self:ident, $reply:ident, $core:ident => $body:expr, $ok:expr) => {{
        let $core = Arc::clone(&$self.core);
        let workers = Arc::clone(&$core.workers);
        $self.rt.spawn(async move {
            // A closed semaphore means the session is draining.
            let Ok(_permit) = workers.acquire().await else {
                $reply.error(libc::EINTR);
                return;
            };
            match $body.await {
                Ok(value) => ($ok)($reply, value),
                Err(e) => $reply.error(RpcError::errno(&e)),
            }
        });
    }};
}

impl Filesystem for OutrunFs {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut KernelConfig,
    ) -> Result<(), libc::c_int> {
        tracing::info!("filesystem mounted");
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("filesystem unmounted");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &std::ffi::OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str().map(ToOwned::to_owned) else {
            reply.error(libc::EINVAL);
            return;
        };

        upcall!(self, reply, core => async {
            let parent = core.path_of(parent)?;
            let path = child_path(&parent, &name);
            let attr = core.attr_of(&path).await?;
            let ino = core.inodes.ino_for(&path);
            Ok::<FileAttr, RpcError>(to_file_attr(&attr, ino))
        }, |reply: ReplyEntry, attr: FileAttr| reply.entry(&TTL, &attr, 0));
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        upcall!(self, reply, core => async {
            let path = core.path_of(ino)?;
            let attr = core.attr_of(&path).await?;
            Ok::<FileAttr, RpcError>(to_file_attr(&attr, ino))
        }, |reply: ReplyAttr, attr: FileAttr| reply.attr(&TTL, &attr));
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        upcall!(self, reply, core => async {
            let path = core.path_of(ino)?;
            core.readlink_of(&path).await
        }, |reply: ReplyData, target: String| reply.data(target.as_bytes()));
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let core = Arc::clone(&self.core);
        let workers = Arc::clone(&core.workers);
        self.rt.spawn(async move {
            let Ok(_permit) = workers.acquire().await else {
                reply.error(libc::EINTR);
                return;
            };

            let listing = async {
                let path = core.path_of(ino)?;
                let entries = core.dirlist_of(&path).await?;
                Ok::<(String, Vec<DirEntry>), RpcError>((path, entries))
            }
            .await;

            match listing {
                Ok((path, entries)) => {
                    for (i, entry) in entries.iter().enumerate().skip(offset as usize) {
                        let child_ino = match entry.name.as_str() {
                            "." => ino,
                            ".." => split_parent(&path)
                                .map_or(ROOT_INO, |(parent, _)| core.inodes.ino_for(parent)),
                            name => core.inodes.ino_for(&child_path(&path, name)),
                        };
                        let kind = entry.attr.map_or(fuser::FileType::Directory, |a| {
                            to_file_attr(&a, child_ino).kind
                        });
                        if reply.add(child_ino, (i + 1) as i64, kind, &entry.name) {
                            break;
                        }
                    }
                    reply.ok();
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let write = flags & libc::O_ACCMODE != libc::O_RDONLY
            || flags & (libc::O_TRUNC | libc::O_APPEND) != 0;

        upcall!(self, reply, core => async {
            let path = core.path_of(ino)?;
            if write {
                core.open_for_write(&path, flags, 0).await
            } else {
                core.open_for_read(&path).await
            }
        }, |reply: ReplyOpen, fh: u64| reply.opened(fh, 0));
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        upcall!(self, reply, core => async {
            core.read_handle(fh, offset.max(0) as u64, size).await
        }, |reply: ReplyData, data: Vec<u8>| reply.data(&data));
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let data = data.to_vec();
        upcall!(self, reply, core => async {
            core.write_handle(fh, offset.max(0) as u64, data).await
        }, |reply: ReplyWrite, n: u32| reply.written(n));
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        upcall!(self, reply, core => async {
            core.flush_handle(fh).await
        }, |reply: ReplyEmpty, ()| reply.ok());
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        upcall!(self, reply, core => async {
            core.fsync_handle(fh, datasync).await
        }, |reply: ReplyEmpty, ()| reply.ok());
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        upcall!(self, reply, core => async {
            core.release_handle(fh).await
        }, |reply: ReplyEmpty, ()| reply.ok());
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(name) = name.to_str().map(ToOwned::to_owned) else {
            reply.error(libc::EINVAL);
            return;
        };

        upcall!(self, reply, core => async {
            let parent = core.path_of(parent)?;
            let path = child_path(&parent, &name);
            let fh = core.open_for_write(&path, flags | libc::O_CREAT, mode).await?;
            let attr = core.fresh_attr(&path).await?;
            let ino = core.inodes.ino_for(&path);
            Ok::<(FileAttr, u64), RpcError>((to_file_attr(&attr, ino), fh))
        }, |reply: ReplyCreate, (attr, fh): (FileAttr, u64)| reply.created(&TTL, &attr, 0, fh, 0));
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let atime_ns = atime.map(time_ns);
        let mtime_ns = mtime.map(time_ns);

        upcall!(self, reply, core => async {
            let path = core.path_of(ino)?;
            let attr = core
                .setattr_path(&path, fh, mode, uid, gid, size, atime_ns, mtime_ns)
                .await?;
            Ok::<FileAttr, RpcError>(to_file_attr(&attr, ino))
        }, |reply: ReplyAttr, attr: FileAttr| reply.attr(&TTL, &attr));
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = name.to_str().map(ToOwned::to_owned) else {
            reply.error(libc::EINVAL);
            return;
        };

        upcall!(self, reply, core => async {
            let parent = core.path_of(parent)?;
            let path = child_path(&parent, &name);
            core.client().mkdir(&path, mode).await?;
            core.invalidate(&path);
            let attr = core.fresh_attr(&path).await?;
            let ino = core.inodes.ino_for(&path);
            Ok::<FileAttr, RpcError>(to_file_attr(&attr, ino))
        }, |reply: ReplyEntry, attr: FileAttr| reply.entry(&TTL, &attr, 0));
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = name.to_str().map(ToOwned::to_owned) else {
            reply.error(libc::EINVAL);
            return;
        };

        upcall!(self, reply, core => async {
            let parent = core.path_of(parent)?;
            let path = child_path(&parent, &name);
            core.client().mknod(&path, mode, u64::from(rdev)).await?;
            core.invalidate(&path);
            let attr = core.fresh_attr(&path).await?;
            let ino = core.inodes.ino_for(&path);
            Ok::<FileAttr, RpcError>(to_file_attr(&attr, ino))
        }, |reply: ReplyEntry, attr: FileAttr| reply.entry(&TTL, &attr, 0));
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &std::ffi::OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str().map(ToOwned::to_owned) else {
            reply.error(libc::EINVAL);
            return;
        };

        upcall!(self, reply, core => async {
            let parent = core.path_of(parent)?;
            core.unlink_path(&child_path(&parent, &name)).await
        }, |reply: ReplyEmpty, ()| reply.ok());
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &std::ffi::OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str().map(ToOwned::to_owned) else {
            reply.error(libc::EINVAL);
            return;
        };

        upcall!(self, reply, core => async {
            let parent = core.path_of(parent)?;
            core.rmdir_path(&child_path(&parent, &name)).await
        }, |reply: ReplyEmpty, ()| reply.ok());
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        newparent: u64,
        newname: &std::ffi::OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(name), Some(newname)) = (
            name.to_str().map(ToOwned::to_owned),
            newname.to_str().map(ToOwned::to_owned),
        ) else {
            reply.error(libc::EINVAL);
            return;
        };

        upcall!(self, reply, core => async {
            let old_parent = core.path_of(parent)?;
            let new_parent = core.path_of(newparent)?;
            core.rename_path(
                &child_path(&old_parent, &name),
                &child_path(&new_parent, &newname),
            )
            .await
        }, |reply: ReplyEmpty, ()| reply.ok());
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &std::ffi::OsStr,
        target: &std::path::Path,
        reply: ReplyEntry,
    ) {
        let (Some(name), Some(target)) = (
            link_name.to_str().map(ToOwned::to_owned),
            target.to_str().map(ToOwned::to_owned),
        ) else {
            reply.error(libc::EINVAL);
            return;
        };

        upcall!(self, reply, core => async {
            let parent = core.path_of(parent)?;
            let path = child_path(&parent, &name);
            core.client().symlink(&path, &target).await?;
            core.invalidate(&path);
            let attr = core.fresh_attr(&path).await?;
            let ino = core.inodes.ino_for(&path);
            Ok::<FileAttr, RpcError>(to_file_attr(&attr, ino))
        }, |reply: ReplyEntry, attr: FileAttr| reply.entry(&TTL, &attr, 0));
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &std::ffi::OsStr,
        reply: ReplyEntry,
    ) {
        let Some(name) = newname.to_str().map(ToOwned::to_owned) else {
            reply.error(libc::EINVAL);
            return;
        };

        upcall!(self, reply, core => async {
            let target = core.path_of(ino)?;
            let parent = core.path_of(newparent)?;
            let path = child_path(&parent, &name);
            core.client().link(&path, &target).await?;
            core.invalidate(&path);
            core.invalidate(&target);
            let attr = core.fresh_attr(&path).await?;
            let new_ino = core.inodes.ino_for(&path);
            Ok::<FileAttr, RpcError>(to_file_attr(&attr, new_ino))
        }, |reply: ReplyEntry, attr: FileAttr| reply.entry(&TTL, &attr, 0));
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        upcall!(self, reply, core => async {
            let path = core.path_of(ino).unwrap_or_else(|_| "/".to_owned());
            core.statfs_path(&path).await
        }, |reply: ReplyStatfs, st: outrun_protocol::FsStats| {
            reply.statfs(
                st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namemax,
                st.frsize,
            );
        });
    }
}
