//! RPC server exposing the local filesystem.
//!
//! One TCP connection per client; the remote's connection pool opens
//! several. The first frame on every connection must be a handshake carrying
//! the session token: a mismatch closes the connection without a reply.
//! After that, requests are decoded, dispatched onto a bounded blocking
//! worker pool, and answered in completion order; the request id in each
//! frame lets the client reassemble the pairing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::{mpsc, Semaphore};

use outrun_protocol::{
    codec, Request, Response, RpcError, SystemPaths, PROTOCOL_VERSION,
};
use outrun_transport::{FrameListener, FrameReader, FrameStream, FrameWriter};

use crate::handles::HandleTable;
use crate::prefetch::{PrefetchEngine, PrefetchLimits};
use crate::service::LocalFs;

/// Server tunables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum concurrently executing requests across all connections.
    pub workers: usize,
    /// Prefetch closure bounds.
    pub limits: PrefetchLimits,
    /// Compression threshold (compressed/original) below which lz4 is used.
    pub min_ratio: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            limits: PrefetchLimits::default(),
            min_ratio: 0.85,
        }
    }
}

/// Running totals, mostly for diagnostics.
#[derive(Debug, Default)]
pub struct ServerStats {
    requests: AtomicU64,
    bulk_fetches: AtomicU64,
}

impl ServerStats {
    /// Total dispatched requests (handshakes excluded).
    #[must_use]
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Bulk fetches among them.
    #[must_use]
    pub fn bulk_fetches(&self) -> u64 {
        self.bulk_fetches.load(Ordering::Relaxed)
    }
}

struct Shared {
    fs: LocalFs,
    token: String,
    config: ServerConfig,
    root_version: u64,
    workers: Semaphore,
    stats: ServerStats,
    // Initialized by the first handshake; later connections of the same
    // session share the fetched-set state.
    prefetch: OnceLock<Arc<PrefetchEngine>>,
}

/// The filesystem RPC server.
pub struct FsServer {
    shared: Arc<Shared>,
}

impl FsServer {
    /// Creates a server for one session identified by `token`.
    #[must_use]
    pub fn new(token: String, config: ServerConfig) -> Self {
        let fs = LocalFs::new();
        let root_version = fs.root_version();

        Self {
            shared: Arc::new(Shared {
                fs,
                token,
                root_version,
                workers: Semaphore::new(config.workers),
                stats: ServerStats::default(),
                config,
                prefetch: OnceLock::new(),
            }),
        }
    }

    /// Running request totals.
    #[must_use]
    pub fn stats(&self) -> &ServerStats {
        &self.shared.stats
    }

    /// Accept loop; runs until the listener fails.
    pub async fn serve(&self, listener: FrameListener) -> std::io::Result<()> {
        tracing::info!(
            addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            "filesystem service listening"
        );

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, shared).await {
                            tracing::debug!(%peer, error = %e, "connection ended");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                    return Err(std::io::Error::other(e.to_string()));
                }
            }
        }
    }
}

async fn handle_connection(
    stream: FrameStream,
    shared: Arc<Shared>,
) -> Result<(), RpcError> {
    let (mut reader, writer) = stream.into_split();

    authenticate(&mut reader, writer, shared).await
}

/// Performs the handshake, then hands the connection to the request loop.
///
/// Token mismatch closes the connection silently; a protocol version
/// mismatch is answered before closing so the remote can report something
/// actionable.
async fn authenticate(
    reader: &mut FrameReader,
    mut writer: FrameWriter,
    shared: Arc<Shared>,
) -> Result<(), RpcError> {
    let body = reader.recv().await.map_err(RpcError::from)?;
    let (request_id, request) = codec::decode_request(body)?;

    let Request::Handshake {
        token,
        protocol,
        prefetch_paths,
    } = request
    else {
        return Err(RpcError::protocol("first message was not a handshake"));
    };

    if token != shared.token {
        tracing::warn!("rejecting connection with wrong session token");
        return Err(RpcError::AuthFailed);
    }

    if protocol != PROTOCOL_VERSION {
        let error = RpcError::Protocol(format!(
            "protocol version mismatch: local {PROTOCOL_VERSION}, remote {protocol}"
        ));
        let frame = codec::encode_response(request_id, &Response::Error { error: error.clone() })?;
        let _ = writer.send(frame).await;
        return Err(error);
    }

    shared.prefetch.get_or_init(|| {
        Arc::new(PrefetchEngine::new(
            SystemPaths::new(prefetch_paths),
            shared.config.limits,
            shared.config.min_ratio,
        ))
    });

    let frame = codec::encode_response(
        request_id,
        &Response::Handshook {
            root_version: shared.root_version,
        },
    )?;
    writer.send(frame).await.map_err(RpcError::from)?;

    request_loop(reader, writer, shared).await
}

async fn request_loop(
    reader: &mut FrameReader,
    mut writer: FrameWriter,
    shared: Arc<Shared>,
) -> Result<(), RpcError> {
    let handles = Arc::new(HandleTable::new());
    let (tx, mut rx) = mpsc::channel::<bytes::Bytes>(64);

    // Single writer task; workers complete out of order and funnel here.
    let write_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.send(frame).await.is_err() {
                break;
            }
        }
    });

    let result = loop {
        let body = match reader.recv().await {
            Ok(body) => body,
            Err(outrun_transport::TransportError::Closed) => break Ok(()),
            Err(e) => break Err(RpcError::from(e)),
        };

        // A frame that does not decode poisons the stream; kill the
        // connection rather than guess at resynchronization.
        let (request_id, request) = match codec::decode_request(body) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::error!(error = %e, "undecodable frame, dropping connection");
                break Err(e);
            }
        };

        let shared = Arc::clone(&shared);
        let handles = Arc::clone(&handles);
        let tx = tx.clone();

        tokio::spawn(async move {
            let Ok(_permit) = shared.workers.acquire().await else {
                return;
            };

            let op = request.name();
            let response = {
                let shared = Arc::clone(&shared);
                let handles = Arc::clone(&handles);
                tokio::task::spawn_blocking(move || dispatch(&shared, &handles, request))
                    .await
                    .unwrap_or_else(|e| Response::Error {
                        error: RpcError::Io(format!("worker panicked: {e}")),
                    })
            };

            match codec::encode_response(request_id, &response) {
                Ok(frame) => {
                    let _ = tx.send(frame).await;
                }
                Err(e) => tracing::error!(op, error = %e, "failed to encode response"),
            }
        });
    };

    drop(tx);
    let _ = write_task.await;

    result
}

/// Executes one request against the local filesystem.
fn dispatch(shared: &Shared, handles: &HandleTable, request: Request) -> Response {
    let fs = &shared.fs;

    shared.stats.requests.fetch_add(1, Ordering::Relaxed);
    if matches!(request, Request::BulkFetch { .. }) {
        shared.stats.bulk_fetches.fetch_add(1, Ordering::Relaxed);
    }

    let result: Result<Response, RpcError> = match request {
        Request::Handshake { .. } => Err(RpcError::protocol("duplicate handshake")),

        Request::Getattr { path } => fs.getattr(&path).map(|meta| Response::Attr { meta }),
        Request::Readdir { path } => fs.readdir(&path).map(|entries| Response::Dir { entries }),
        Request::Readlink { path } => fs.readlink(&path).map(|target| Response::Link { target }),

        Request::OpenRead { path } => fs.open_read(&path).map(|(file, attr, len)| {
            let handle = handles.insert(file);
            Response::OpenedRead { handle, attr, len }
        }),
        Request::Read {
            handle,
            offset,
            len,
        } => handles
            .get(handle)
            .and_then(|file| fs.read(&file, offset, len))
            .map(|data| Response::Data { data }),
        Request::Close { handle } => handles.remove(handle).map(|()| Response::Ok),

        Request::OpenWrite { path, flags, mode } => fs.open_write(&path, flags, mode).map(|file| {
            let handle = handles.insert(file);
            Response::OpenedWrite { handle }
        }),
        Request::Write {
            handle,
            offset,
            data,
        } => handles
            .get(handle)
            .and_then(|file| fs.write(&file, offset, &data))
            .map(|n| Response::Written { n }),
        Request::Fsync { handle, datasync } => handles
            .get(handle)
            .and_then(|file| fs.fsync(&file, datasync))
            .map(|()| Response::Ok),
        Request::Flush { handle } => handles.get(handle).map(|_| Response::Ok),
        Request::Truncate {
            path,
            handle,
            size,
        } => {
            let file = match handle {
                Some(h) => Some(handles.get(h)),
                None => None,
            };
            match file {
                Some(Err(e)) => Err(e),
                Some(Ok(f)) => fs.truncate(&path, Some(f.as_ref()), size).map(|()| Response::Ok),
                None => fs.truncate(&path, None, size).map(|()| Response::Ok),
            }
        }

        Request::Unlink { path } => fs.unlink(&path).map(|()| Response::Ok),
        Request::Mkdir { path, mode } => fs.mkdir(&path, mode).map(|()| Response::Ok),
        Request::Rmdir { path } => fs.rmdir(&path).map(|()| Response::Ok),
        Request::Rename { from, to } => fs.rename(&from, &to).map(|()| Response::Ok),
        Request::Chmod { path, mode } => fs.chmod(&path, mode).map(|()| Response::Ok),
        Request::Chown { path, uid, gid } => fs.chown(&path, uid, gid).map(|()| Response::Ok),
        Request::Utimens {
            path,
            atime_ns,
            mtime_ns,
        } => fs.utimens(&path, atime_ns, mtime_ns).map(|()| Response::Ok),
        Request::Symlink { path, target } => fs.symlink(&path, &target).map(|()| Response::Ok),
        Request::Link { path, target } => fs.link(&path, &target).map(|()| Response::Ok),
        Request::Mknod { path, mode, rdev } => fs.mknod(&path, mode, rdev).map(|()| Response::Ok),

        Request::BulkFetch {
            paths,
            depth,
            kinds,
        } => match shared.prefetch.get() {
            Some(engine) => Ok(Response::Bundle {
                items: engine.bulk_fetch(&paths, depth, &kinds),
            }),
            None => Err(RpcError::protocol("bulk fetch before handshake")),
        },
        Request::Revalidate { entries } => Ok(Response::Changed {
            entries: fs.changed_metadata(&entries),
        }),
        Request::MarkCached { paths } => {
            if let Some(engine) = shared.prefetch.get() {
                engine.mark_cached(&paths);
            }
            Ok(Response::Ok)
        }

        Request::Statfs { path } => fs.statfs(&path).map(|stats| Response::Stats { stats }),
    };

    result.unwrap_or_else(|error| Response::Error { error })
}

#[cfg(test)]
mod tests {
    use super::*;
    use outrun_protocol::{encode_request, FetchKind};

    async fn start_server(token: &str) -> std::net::SocketAddr {
        let listener = FrameListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = FsServer::new(token.to_owned(), ServerConfig::default());

        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        addr
    }

    async fn handshake(stream: &mut FrameStream, token: &str) -> Response {
        let frame = encode_request(
            1,
            &Request::Handshake {
                token: token.to_owned(),
                protocol: PROTOCOL_VERSION,
                prefetch_paths: vec!["/usr".to_owned()],
            },
        )
        .unwrap();
        stream.send(frame).await.unwrap();

        let body = stream.recv().await.unwrap();
        codec::decode_response(body).unwrap().1
    }

    #[tokio::test]
    async fn test_handshake_and_getattr() {
        let addr = start_server("secret").await;
        let mut stream = FrameStream::connect(addr).await.unwrap();

        let resp = handshake(&mut stream, "secret").await;
        assert!(matches!(resp, Response::Handshook { .. }));

        let frame = encode_request(
            2,
            &Request::Getattr {
                path: "/".to_owned(),
            },
        )
        .unwrap();
        stream.send(frame).await.unwrap();

        let (id, resp) = codec::decode_response(stream.recv().await.unwrap()).unwrap();
        assert_eq!(id, 2);
        match resp {
            Response::Attr { meta } => assert!(meta.attr.unwrap().is_dir()),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bad_token_closes_without_reply() {
        let addr = start_server("secret").await;
        let mut stream = FrameStream::connect(addr).await.unwrap();

        let frame = encode_request(
            1,
            &Request::Handshake {
                token: "wrong".to_owned(),
                protocol: PROTOCOL_VERSION,
                prefetch_paths: vec![],
            },
        )
        .unwrap();
        stream.send(frame).await.unwrap();

        assert!(stream.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_request_before_handshake_drops_connection() {
        let addr = start_server("secret").await;
        let mut stream = FrameStream::connect(addr).await.unwrap();

        let frame = encode_request(
            1,
            &Request::Getattr {
                path: "/".to_owned(),
            },
        )
        .unwrap();
        stream.send(frame).await.unwrap();

        assert!(stream.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_bulk_fetch_over_the_wire() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"contents").unwrap();

        let listener = FrameListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = FsServer::new("t".to_owned(), ServerConfig::default());
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        let mut stream = FrameStream::connect(addr).await.unwrap();
        let frame = encode_request(
            1,
            &Request::Handshake {
                token: "t".to_owned(),
                protocol: PROTOCOL_VERSION,
                prefetch_paths: vec![dir.path().to_str().unwrap().to_owned()],
            },
        )
        .unwrap();
        stream.send(frame).await.unwrap();
        stream.recv().await.unwrap();

        let target = dir.path().join("a.txt").to_str().unwrap().to_owned();
        let frame = encode_request(
            2,
            &Request::BulkFetch {
                paths: vec![target.clone()],
                depth: 1,
                kinds: vec![FetchKind::Attr, FetchKind::Blob],
            },
        )
        .unwrap();
        stream.send(frame).await.unwrap();

        let (_, resp) = codec::decode_response(stream.recv().await.unwrap()).unwrap();
        match resp {
            Response::Bundle { items } => {
                assert_eq!(items[0].path, target);
                let blob = items[0].blob.clone().unwrap();
                assert_eq!(blob.into_bytes().unwrap(), b"contents");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }
}
