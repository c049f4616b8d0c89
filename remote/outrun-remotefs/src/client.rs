//! Multiplexed RPC client.
//!
//! A fixed pool of connections to the local host, each owned by a
//! supervisor task that dials, handshakes, and then pumps frames both ways.
//! Callers are decoupled from connections: every request gets a fresh id,
//! goes out on the least-loaded live connection, and parks a waiter that
//! the reader side wakes when the matching response arrives, in whatever
//! order the server finished them.
//!
//! Cancellation is local: dropping a call's future abandons the waiter and
//! the eventual response is discarded on arrival. No wire message is sent.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch, Notify, Semaphore};

use outrun_protocol::{
    codec, Attributes, BundleItem, DirEntry, FetchKind, FsStats, Metadata, Request, Response,
    RpcError, RpcResult, Validator, PROTOCOL_VERSION,
};
use outrun_transport::FrameStream;

/// Consecutive timeouts on one connection before it is recycled.
const TIMEOUT_STRIKES: u32 = 3;

/// Local retry policy for `Timeout`/`Busy`: attempts and base backoff.
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(100);

/// Client tunables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Number of pooled connections.
    pub pool_size: usize,
    /// Per-operation deadline; bulk fetches get a multiple of this.
    pub timeout: Duration,
    /// Soft cap on in-flight requests; submissions block beyond it.
    pub max_inflight: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            timeout: Duration::from_secs(30),
            max_inflight: 256,
        }
    }
}

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub addr: std::net::SocketAddr,
    pub token: String,
    pub prefetch_paths: Vec<String>,
}

struct Waiter {
    tx: oneshot::Sender<Response>,
}

struct ConnState {
    id: usize,
    tx: mpsc::Sender<Bytes>,
    load: AtomicUsize,
    strikes: AtomicU32,
    alive: AtomicBool,
    recycle: Notify,
}

struct ClientInner {
    params: ConnectParams,
    config: ClientConfig,
    conns: Vec<Arc<ConnState>>,
    waiters: DashMap<u64, Waiter>,
    next_id: AtomicU64,
    inflight: Semaphore,
    shutdown: AtomicBool,
    fatal: Mutex<Option<RpcError>>,
    root_version: watch::Sender<Option<u64>>,
}

impl ClientInner {
    fn route(&self, body: Bytes, conn: &ConnState) {
        match codec::decode_response(body) {
            Ok((request_id, response)) => {
                if let Some((_, waiter)) = self.waiters.remove(&request_id) {
                    conn.strikes.store(0, Ordering::Relaxed);
                    // A cancelled waiter dropped its receiver; the response
                    // just evaporates here.
                    let _ = waiter.tx.send(response);
                } else {
                    tracing::trace!(request_id, "response for abandoned request dropped");
                }
            }
            Err(e) => {
                tracing::error!(conn = conn.id, error = %e, "undecodable response, recycling");
                conn.recycle.notify_one();
            }
        }
    }

    fn record_fatal(&self, error: &RpcError) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            tracing::error!(error = %error, "session-fatal rpc failure");
            *fatal = Some(error.clone());
        }
        // Wake anyone still waiting for bring-up.
        self.root_version.send_replace(None);
    }
}

/// The pooled, multiplexed client.
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// Spins up the connection pool. Returns immediately; use
    /// [`Self::root_version`] to wait for the first completed handshake.
    #[must_use]
    pub fn connect(params: ConnectParams, config: ClientConfig) -> Self {
        let (root_tx, _) = watch::channel(None);

        let mut conns = Vec::with_capacity(config.pool_size);
        let mut receivers = Vec::with_capacity(config.pool_size);

        for id in 0..config.pool_size.max(1) {
            let (tx, rx) = mpsc::channel::<Bytes>(64);
            conns.push(Arc::new(ConnState {
                id,
                tx,
                load: AtomicUsize::new(0),
                strikes: AtomicU32::new(0),
                alive: AtomicBool::new(false),
                recycle: Notify::new(),
            }));
            receivers.push(rx);
        }

        let inner = Arc::new(ClientInner {
            inflight: Semaphore::new(config.max_inflight),
            params,
            conns,
            waiters: DashMap::with_shard_amount(16),
            next_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
            fatal: Mutex::new(None),
            root_version: root_tx,
            config,
        });

        for (conn, rx) in inner.conns.iter().zip(receivers) {
            tokio::spawn(run_connection(
                Arc::clone(&inner),
                Arc::clone(conn),
                rx,
            ));
        }

        Self { inner }
    }

    /// Waits for the local host's root version from the first handshake.
    ///
    /// Errors with whatever fatal condition stopped bring-up (bad token,
    /// protocol mismatch) or `Timeout` if no connection comes up in time.
    pub async fn root_version(&self) -> RpcResult<u64> {
        let mut rx = self.inner.root_version.subscribe();

        let deadline = tokio::time::sleep(self.inner.config.timeout);
        tokio::pin!(deadline);

        loop {
            if let Some(version) = *rx.borrow() {
                return Ok(version);
            }
            if let Some(fatal) = self.inner.fatal.lock().clone() {
                return Err(fatal);
            }

            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(RpcError::Shutdown);
                    }
                }
                () = &mut deadline => return Err(RpcError::Timeout),
            }
        }
    }

    /// Issues one call with the local retry policy for `Timeout`/`Busy`.
    pub async fn call(&self, request: Request) -> RpcResult<Response> {
        let mut attempt = 0;

        loop {
            match self.call_once(&request).await {
                Err(e) if e.is_retryable() && attempt + 1 < RETRY_ATTEMPTS => {
                    attempt += 1;
                    let delay = RETRY_BASE * 2u32.pow(attempt - 1);
                    tracing::debug!(op = request.name(), attempt, ?delay, "retrying after {e}");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn call_once(&self, request: &Request) -> RpcResult<Response> {
        let inner = &self.inner;

        if inner.shutdown.load(Ordering::Relaxed) {
            return Err(RpcError::Shutdown);
        }
        if let Some(fatal) = inner.fatal.lock().clone() {
            return Err(fatal);
        }

        // Backpressure: the waiter map must not grow without bound under a
        // burst of FUSE upcalls.
        let _permit = inner
            .inflight
            .acquire()
            .await
            .map_err(|_| RpcError::Shutdown)?;

        let request_id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = pick_connection(&inner.conns);

        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(request_id, Waiter { tx });

        let frame = codec::encode_request(request_id, request)?;

        conn.load.fetch_add(1, Ordering::Relaxed);
        let load_guard = LoadGuard { conn: Arc::clone(conn) };

        if conn.tx.send(frame).await.is_err() {
            inner.waiters.remove(&request_id);
            return Err(RpcError::Shutdown);
        }

        let result = tokio::time::timeout(op_timeout(&inner.config, request), rx).await;
        drop(load_guard);

        match result {
            Ok(Ok(Response::Error { error })) => Err(error),
            Ok(Ok(response)) => Ok(response),
            // Waiter dropped without an answer: shutdown drained the map.
            Ok(Err(_)) => Err(RpcError::Shutdown),
            Err(_) => {
                inner.waiters.remove(&request_id);
                let strikes = conn.strikes.fetch_add(1, Ordering::Relaxed) + 1;
                if strikes >= TIMEOUT_STRIKES {
                    tracing::warn!(conn = conn.id, strikes, "recycling connection after timeouts");
                    conn.strikes.store(0, Ordering::Relaxed);
                    conn.recycle.notify_one();
                }
                Err(RpcError::Timeout)
            }
        }
    }

    /// Tears the client down: no new calls, all pending waiters wake with
    /// `Shutdown`, supervisors exit.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        self.inner.inflight.close();
        self.inner.waiters.retain(|_, _| false);
        for conn in &self.inner.conns {
            conn.recycle.notify_one();
        }
    }

    /// Number of requests currently in flight.
    #[must_use]
    pub fn inflight(&self) -> usize {
        self.inner.waiters.len()
    }
}

struct LoadGuard {
    conn: Arc<ConnState>,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.conn.load.fetch_sub(1, Ordering::Relaxed);
    }
}

fn pick_connection(conns: &[Arc<ConnState>]) -> &Arc<ConnState> {
    conns
        .iter()
        .filter(|c| c.alive.load(Ordering::Relaxed))
        .min_by_key(|c| c.load.load(Ordering::Relaxed))
        .unwrap_or(&conns[0])
}

fn op_timeout(config: &ClientConfig, request: &Request) -> Duration {
    match request {
        // Bundles can carry two orders of magnitude more bytes than any
        // single operation.
        Request::BulkFetch { .. } => config.timeout.saturating_mul(4),
        _ => config.timeout,
    }
}

async fn dial(params: &ConnectParams, timeout: Duration) -> RpcResult<(FrameStream, u64)> {
    let mut stream = FrameStream::connect(params.addr)
        .await
        .map_err(RpcError::from)?;

    let handshake = Request::Handshake {
        token: params.token.clone(),
        protocol: PROTOCOL_VERSION,
        prefetch_paths: params.prefetch_paths.clone(),
    };
    stream
        .send(codec::encode_request(0, &handshake)?)
        .await
        .map_err(RpcError::from)?;

    let body = tokio::time::timeout(timeout, stream.recv())
        .await
        .map_err(|_| RpcError::Timeout)?
        .map_err(|e| match e {
            // The server closes without a reply on a bad token.
            outrun_transport::TransportError::Closed => RpcError::AuthFailed,
            other => RpcError::from(other),
        })?;

    match codec::decode_response(body)? {
        (_, Response::Handshook { root_version }) => Ok((stream, root_version)),
        (_, Response::Error { error }) => Err(error),
        _ => Err(RpcError::protocol("unexpected handshake response")),
    }
}

/// Supervisor for one pooled connection: dial, handshake, pump, redial.
async fn run_connection(
    inner: Arc<ClientInner>,
    conn: Arc<ConnState>,
    mut rx: mpsc::Receiver<Bytes>,
) {
    let mut backoff = Duration::from_millis(100);

    loop {
        if inner.shutdown.load(Ordering::Relaxed) {
            return;
        }

        match dial(&inner.params, inner.config.timeout).await {
            Ok((stream, root_version)) => {
                backoff = Duration::from_millis(100);
                conn.alive.store(true, Ordering::Relaxed);
                inner.root_version.send_replace(Some(root_version));
                tracing::debug!(conn = conn.id, "connection established");

                let (mut reader, mut writer) = stream.into_split();

                loop {
                    tokio::select! {
                        frame = rx.recv() => match frame {
                            Some(frame) => {
                                if writer.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            None => return,
                        },
                        body = reader.recv() => match body {
                            Ok(body) => inner.route(body, &conn),
                            Err(e) => {
                                tracing::debug!(conn = conn.id, error = %e, "connection lost");
                                break;
                            }
                        },
                        () = conn.recycle.notified() => {
                            tracing::debug!(conn = conn.id, "connection recycled");
                            break;
                        }
                    }
                }

                conn.alive.store(false, Ordering::Relaxed);
            }
            Err(e) if e.is_fatal() => {
                inner.record_fatal(&e);
                return;
            }
            Err(e) => {
                tracing::debug!(conn = conn.id, error = %e, "dial failed");
            }
        }

        if inner.shutdown.load(Ordering::Relaxed) {
            return;
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_secs(5));
    }
}

fn unexpected(response: &Response) -> RpcError {
    RpcError::Protocol(format!("unexpected response opcode {:#04x}", response.opcode()))
}

macro_rules! expect_ok {
    ($self:expr, $req:expr) => {
        match $self.call($req).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    };
}

impl RpcClient {
    pub async fn getattr(&self, path: &str) -> RpcResult<Metadata> {
        match self.call(Request::Getattr { path: path.into() }).await? {
            Response::Attr { meta } => Ok(meta),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn readdir(&self, path: &str) -> RpcResult<Vec<DirEntry>> {
        match self.call(Request::Readdir { path: path.into() }).await? {
            Response::Dir { entries } => Ok(entries),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn readlink(&self, path: &str) -> RpcResult<String> {
        match self.call(Request::Readlink { path: path.into() }).await? {
            Response::Link { target } => Ok(target),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn open_read(&self, path: &str) -> RpcResult<(u64, Attributes, u64)> {
        match self.call(Request::OpenRead { path: path.into() }).await? {
            Response::OpenedRead { handle, attr, len } => Ok((handle, attr, len)),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn read(&self, handle: u64, offset: u64, len: u32) -> RpcResult<Vec<u8>> {
        match self.call(Request::Read { handle, offset, len }).await? {
            Response::Data { data } => Ok(data),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn close(&self, handle: u64) -> RpcResult<()> {
        expect_ok!(self, Request::Close { handle })
    }

    pub async fn open_write(&self, path: &str, flags: i32, mode: u32) -> RpcResult<u64> {
        match self
            .call(Request::OpenWrite {
                path: path.into(),
                flags,
                mode,
            })
            .await?
        {
            Response::OpenedWrite { handle } => Ok(handle),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn write(&self, handle: u64, offset: u64, data: Vec<u8>) -> RpcResult<u32> {
        match self
            .call(Request::Write {
                handle,
                offset,
                data,
            })
            .await?
        {
            Response::Written { n } => Ok(n),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn fsync(&self, handle: u64, datasync: bool) -> RpcResult<()> {
        expect_ok!(self, Request::Fsync { handle, datasync })
    }

    pub async fn flush(&self, handle: u64) -> RpcResult<()> {
        expect_ok!(self, Request::Flush { handle })
    }

    pub async fn truncate(&self, path: &str, handle: Option<u64>, size: u64) -> RpcResult<()> {
        expect_ok!(
            self,
            Request::Truncate {
                path: path.into(),
                handle,
                size,
            }
        )
    }

    pub async fn unlink(&self, path: &str) -> RpcResult<()> {
        expect_ok!(self, Request::Unlink { path: path.into() })
    }

    pub async fn mkdir(&self, path: &str, mode: u32) -> RpcResult<()> {
        expect_ok!(self, Request::Mkdir { path: path.into(), mode })
    }

    pub async fn rmdir(&self, path: &str) -> RpcResult<()> {
        expect_ok!(self, Request::Rmdir { path: path.into() })
    }

    pub async fn rename(&self, from: &str, to: &str) -> RpcResult<()> {
        expect_ok!(
            self,
            Request::Rename {
                from: from.into(),
                to: to.into(),
            }
        )
    }

    pub async fn chmod(&self, path: &str, mode: u32) -> RpcResult<()> {
        expect_ok!(self, Request::Chmod { path: path.into(), mode })
    }

    pub async fn chown(&self, path: &str, uid: u32, gid: u32) -> RpcResult<()> {
        expect_ok!(self, Request::Chown { path: path.into(), uid, gid })
    }

    pub async fn utimens(&self, path: &str, atime_ns: i64, mtime_ns: i64) -> RpcResult<()> {
        expect_ok!(
            self,
            Request::Utimens {
                path: path.into(),
                atime_ns,
                mtime_ns,
            }
        )
    }

    pub async fn symlink(&self, path: &str, target: &str) -> RpcResult<()> {
        expect_ok!(
            self,
            Request::Symlink {
                path: path.into(),
                target: target.into(),
            }
        )
    }

    pub async fn link(&self, path: &str, target: &str) -> RpcResult<()> {
        expect_ok!(
            self,
            Request::Link {
                path: path.into(),
                target: target.into(),
            }
        )
    }

    pub async fn mknod(&self, path: &str, mode: u32, rdev: u64) -> RpcResult<()> {
        expect_ok!(self, Request::Mknod { path: path.into(), mode, rdev })
    }

    pub async fn bulk_fetch(
        &self,
        paths: Vec<String>,
        depth: u32,
        kinds: Vec<FetchKind>,
    ) -> RpcResult<Vec<BundleItem>> {
        match self
            .call(Request::BulkFetch {
                paths,
                depth,
                kinds,
            })
            .await?
        {
            Response::Bundle { items } => Ok(items),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn revalidate(
        &self,
        entries: Vec<(String, Validator)>,
    ) -> RpcResult<Vec<(String, Metadata)>> {
        match self.call(Request::Revalidate { entries }).await? {
            Response::Changed { entries } => Ok(entries),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn mark_cached(&self, paths: Vec<String>) -> RpcResult<()> {
        expect_ok!(self, Request::MarkCached { paths })
    }

    pub async fn statfs(&self, path: &str) -> RpcResult<FsStats> {
        match self.call(Request::Statfs { path: path.into() }).await? {
            Response::Stats { stats } => Ok(stats),
            other => Err(unexpected(&other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outrun_fs::{FsServer, ServerConfig};
    use outrun_transport::FrameListener;

    async fn start_server(token: &str) -> std::net::SocketAddr {
        let listener = FrameListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = FsServer::new(token.to_owned(), ServerConfig::default());
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });
        addr
    }

    fn params(addr: std::net::SocketAddr, token: &str) -> ConnectParams {
        ConnectParams {
            addr,
            token: token.to_owned(),
            prefetch_paths: vec!["/usr".to_owned()],
        }
    }

    #[tokio::test]
    async fn test_connect_and_getattr() {
        let addr = start_server("s").await;
        let client = RpcClient::connect(params(addr, "s"), ClientConfig::default());

        client.root_version().await.unwrap();
        let meta = client.getattr("/").await.unwrap();
        assert!(meta.attr.unwrap().is_dir());

        client.shutdown();
    }

    #[tokio::test]
    async fn test_wrong_token_is_fatal() {
        let addr = start_server("right").await;
        let client = RpcClient::connect(
            params(addr, "wrong"),
            ClientConfig {
                timeout: Duration::from_secs(2),
                ..ClientConfig::default()
            },
        );

        assert!(matches!(
            client.root_version().await,
            Err(RpcError::AuthFailed)
        ));
        assert!(matches!(
            client.getattr("/").await,
            Err(RpcError::AuthFailed)
        ));

        client.shutdown();
    }

    #[tokio::test]
    async fn test_concurrent_calls_multiplex() {
        let addr = start_server("s").await;
        let client = Arc::new(RpcClient::connect(
            params(addr, "s"),
            ClientConfig {
                pool_size: 2,
                ..ClientConfig::default()
            },
        ));
        client.root_version().await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let client = Arc::clone(&client);
            tasks.push(tokio::spawn(async move { client.getattr("/").await }));
        }

        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }

        assert_eq!(client.inflight(), 0);
        client.shutdown();
    }

    #[tokio::test]
    async fn test_missing_path_is_typed_not_fatal() {
        let addr = start_server("s").await;
        let client = RpcClient::connect(params(addr, "s"), ClientConfig::default());
        client.root_version().await.unwrap();

        assert!(matches!(
            client.getattr("/definitely/not/here").await,
            Err(RpcError::NotFound)
        ));
        // The connection survives a typed error.
        assert!(client.getattr("/").await.is_ok());

        client.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_calls() {
        let addr = start_server("s").await;
        let client = RpcClient::connect(params(addr, "s"), ClientConfig::default());
        client.root_version().await.unwrap();

        client.shutdown();
        assert!(matches!(
            client.getattr("/").await,
            Err(RpcError::Shutdown)
        ));
    }
}
