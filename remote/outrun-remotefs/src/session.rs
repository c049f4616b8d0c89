//! Session lifecycle.
//!
//! One session spans one mount: bring up the cache and the connection
//! pool, revalidate what persisted, mount, serve until told to stop, then
//! drain and release everything in reverse order. The state machine is
//! explicit so teardown can assert it runs from exactly one place on every
//! exit path.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use outrun_cache::{CacheCaps, CacheError, CacheStore};
use outrun_protocol::{RpcError, FILESYSTEM_NAME};

use crate::client::{ClientConfig, ConnectParams, RpcClient};
use crate::config::Config;
use crate::fs::{FsCore, OutrunFs};

/// Default FUSE worker cap.
const DEFAULT_WORKERS: usize = 16;

/// Transitive prefetch depth requested in bulk fetches.
const PREFETCH_DEPTH: u32 = 3;

/// Lifecycle states, in forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Handshake,
    Mounted,
    Running,
    Draining,
    Closed,
}

impl SessionState {
    /// Whether `self -> to` is a legal transition.
    #[must_use]
    pub fn allows(self, to: Self) -> bool {
        use SessionState::{Closed, Draining, Handshake, Init, Mounted, Running};

        matches!(
            (self, to),
            (Init, Handshake)
                | (Handshake, Mounted)
                | (Mounted, Running)
                | (Running, Draining)
                | (Draining, Closed)
                // Failures during bring-up skip straight to teardown.
                | (Init | Handshake | Mounted, Draining)
        )
    }
}

/// Session-fatal failures surfaced to the host shell.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cache: {0}")]
    Cache(#[from] CacheError),

    #[error("rpc: {0}")]
    Rpc(#[from] RpcError),

    #[error("mount: {0}")]
    Mount(#[from] std::io::Error),

    #[error("illegal session transition {from:?} -> {to:?}")]
    State {
        from: SessionState,
        to: SessionState,
    },
}

/// What a session needs to start.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Local host's RPC endpoint (the tunneled socket).
    pub addr: std::net::SocketAddr,
    /// Shared session token.
    pub token: String,
    /// Where to mount the projection.
    pub mount_point: PathBuf,
    /// Loaded configuration.
    pub config: Config,
}

/// One mount's lifetime.
pub struct Session {
    state: SessionState,
    options: SessionOptions,
}

impl Session {
    /// Creates a session in `Init`.
    #[must_use]
    pub fn new(options: SessionOptions) -> Self {
        Self {
            state: SessionState::Init,
            options,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    fn advance(&mut self, to: SessionState) -> Result<(), SessionError> {
        if !self.state.allows(to) {
            return Err(SessionError::State {
                from: self.state,
                to,
            });
        }
        tracing::debug!(from = ?self.state, to = ?to, "session transition");
        self.state = to;
        Ok(())
    }

    /// Runs the session to completion: mount, serve, drain, close.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let result = self.bring_up_and_serve().await;

        // Teardown runs on every exit path.
        if self.state != SessionState::Closed {
            let _ = self.advance(SessionState::Draining);
            let _ = self.advance(SessionState::Closed);
        }

        result
    }

    async fn bring_up_and_serve(&mut self) -> Result<(), SessionError> {
        let config = self.options.config.clone();
        let system = config.system_paths();

        // Init: the cache root is the only local state we own.
        let caps = CacheCaps {
            max_entries: config.cache.max_entries,
            max_size: config.cache.max_size,
        };
        let cache_path = config.cache.path.clone();
        let cache = tokio::task::spawn_blocking(move || CacheStore::open(&cache_path, caps))
            .await
            .map_err(|e| CacheError::Io(std::io::Error::other(e.to_string())))??;
        let cache = Arc::new(cache);

        self.advance(SessionState::Handshake)?;

        let client = Arc::new(RpcClient::connect(
            ConnectParams {
                addr: self.options.addr,
                token: self.options.token.clone(),
                prefetch_paths: system.prefixes().to_vec(),
            },
            ClientConfig {
                pool_size: config.rpc.pool_size,
                timeout: std::time::Duration::from_millis(config.rpc.timeout_ms),
                ..ClientConfig::default()
            },
        ));

        let result = self
            .serve_with(Arc::clone(&cache), Arc::clone(&client), system)
            .await;

        client.shutdown();
        cache.save();

        result
    }

    async fn serve_with(
        &mut self,
        cache: Arc<CacheStore>,
        client: Arc<RpcClient>,
        system: outrun_protocol::SystemPaths,
    ) -> Result<(), SessionError> {
        let root_version = client.root_version().await?;
        let kept = cache.begin_session(root_version);

        // One batched freshness pass covers every persisted entry before
        // any read can serve a stale answer.
        if kept {
            let pending = cache.entries_for_revalidation();
            if !pending.is_empty() {
                tracing::info!(entries = pending.len(), "revalidating persisted cache");
                let changed = client.revalidate(pending).await?;
                tracing::info!(changed = changed.len(), "revalidation complete");
                cache.apply_revalidation(&changed);
            }

            let warm = cache.warm_blob_paths();
            if !warm.is_empty() {
                client.mark_cached(warm).await?;
            }
        }

        let core = Arc::new(FsCore::new(
            client,
            cache,
            system,
            DEFAULT_WORKERS,
            PREFETCH_DEPTH,
        ));

        self.advance(SessionState::Mounted)?;

        let fs = OutrunFs::new(Arc::clone(&core), tokio::runtime::Handle::current());
        let mount = fuser::spawn_mount2(
            fs,
            &self.options.mount_point,
            &[
                fuser::MountOption::FSName(FILESYSTEM_NAME.to_owned()),
                fuser::MountOption::DefaultPermissions,
                fuser::MountOption::AllowOther,
                fuser::MountOption::AutoUnmount,
            ],
        )?;

        self.advance(SessionState::Running)?;
        tracing::info!(mount = %self.options.mount_point.display(), "session running");

        shutdown_signal().await;

        self.advance(SessionState::Draining)?;
        tracing::info!("draining session");

        core.drain();
        drop(mount);

        self.advance(SessionState::Closed)?;
        Ok(())
    }
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
