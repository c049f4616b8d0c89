//! End-to-end tests of the filesystem plane without a kernel mount: a real
//! server over real TCP, the pooled client, the persistent cache, and the
//! policy core driving them.

use std::sync::Arc;

use outrun_cache::{CacheCaps, CacheStore};
use outrun_fs::{FsServer, ServerConfig};
use outrun_protocol::{RpcError, SystemPaths};
use outrun_remotefs::{ClientConfig, ConnectParams, FsCore, RpcClient};
use outrun_transport::FrameListener;

const WORKERS: usize = 16;
const DEPTH: u32 = 3;

/// Builds a minimal dynamic ELF64 image whose DT_NEEDED entries are
/// absolute paths, so resolution does not depend on the host's real
/// library directories.
fn synthetic_elf(interp: &str, needed: &[&str]) -> Vec<u8> {
    const ET_DYN: u16 = 3;
    const PT_LOAD: u32 = 1;
    const PT_DYNAMIC: u32 = 2;
    const PT_INTERP: u32 = 3;
    const DT_NEEDED: i64 = 1;
    const DT_STRTAB: i64 = 5;

    let mut strtab = vec![0u8];
    let mut needed_offsets = Vec::new();
    for name in needed {
        needed_offsets.push(strtab.len() as u64);
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
    }

    let phoff = 64u64;
    let interp_off = phoff + 3 * 56;
    let dyn_off = interp_off + interp.len() as u64 + 1;
    let dyn_len = (needed.len() as u64 + 2) * 16;
    let strtab_off = dyn_off + dyn_len;

    let total = strtab_off as usize + strtab.len();
    let mut img = vec![0u8; total];

    img[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    img[4] = 2; // ELF64
    img[5] = 1; // little-endian
    img[16..18].copy_from_slice(&ET_DYN.to_le_bytes());
    img[32..40].copy_from_slice(&phoff.to_le_bytes());
    img[54..56].copy_from_slice(&56u16.to_le_bytes());
    img[56..58].copy_from_slice(&3u16.to_le_bytes());

    let mut phdr = |idx: usize, p_type: u32, off: u64, filesz: u64| {
        let at = phoff as usize + idx * 56;
        img[at..at + 4].copy_from_slice(&p_type.to_le_bytes());
        img[at + 8..at + 16].copy_from_slice(&off.to_le_bytes());
        img[at + 16..at + 24].copy_from_slice(&off.to_le_bytes());
        img[at + 32..at + 40].copy_from_slice(&filesz.to_le_bytes());
    };

    phdr(0, PT_LOAD, 0, total as u64);
    phdr(1, PT_INTERP, interp_off, interp.len() as u64 + 1);
    phdr(2, PT_DYNAMIC, dyn_off, dyn_len);

    img[interp_off as usize..interp_off as usize + interp.len()]
        .copy_from_slice(interp.as_bytes());

    let mut at = dyn_off as usize;
    for off in &needed_offsets {
        img[at..at + 8].copy_from_slice(&DT_NEEDED.to_le_bytes());
        img[at + 8..at + 16].copy_from_slice(&off.to_le_bytes());
        at += 16;
    }
    img[at..at + 8].copy_from_slice(&DT_STRTAB.to_le_bytes());
    img[at + 8..at + 16].copy_from_slice(&strtab_off.to_le_bytes());

    img[strtab_off as usize..].copy_from_slice(&strtab);
    img
}

struct Plane {
    server: Arc<FsServer>,
    addr: std::net::SocketAddr,
    client: Arc<RpcClient>,
    cache: Arc<CacheStore>,
    core: Arc<FsCore>,
}

/// Starts a server rooted in reality but prefetch-restricted to the given
/// prefixes, and wires a fresh client, cache, and core to it.
async fn start_plane(prefixes: Vec<String>, cache_dir: &std::path::Path) -> Plane {
    let listener = FrameListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(FsServer::new("hunter2".to_owned(), ServerConfig::default()));
    {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });
    }

    attach_plane(server, addr, prefixes, cache_dir).await
}

async fn attach_plane(
    server: Arc<FsServer>,
    addr: std::net::SocketAddr,
    prefixes: Vec<String>,
    cache_dir: &std::path::Path,
) -> Plane {
    let client = Arc::new(RpcClient::connect(
        ConnectParams {
            addr,
            token: "hunter2".to_owned(),
            prefetch_paths: prefixes.clone(),
        },
        ClientConfig::default(),
    ));

    let cache_dir = cache_dir.to_path_buf();
    let cache = Arc::new(
        tokio::task::spawn_blocking(move || CacheStore::open(&cache_dir, CacheCaps::default()))
            .await
            .unwrap()
            .unwrap(),
    );

    let root_version = client.root_version().await.unwrap();
    let kept = cache.begin_session(root_version);

    if kept {
        let pending = cache.entries_for_revalidation();
        if !pending.is_empty() {
            let changed = client.revalidate(pending).await.unwrap();
            cache.apply_revalidation(&changed);
        }
        let warm = cache.warm_blob_paths();
        if !warm.is_empty() {
            client.mark_cached(warm).await.unwrap();
        }
    }

    let core = Arc::new(FsCore::new(
        Arc::clone(&client),
        Arc::clone(&cache),
        SystemPaths::new(prefixes),
        WORKERS,
        DEPTH,
    ));

    Plane {
        server,
        addr,
        client,
        cache,
        core,
    }
}

/// Ends the session; the server task keeps running on its own handle.
fn teardown(plane: Plane) {
    let Plane {
        client,
        cache,
        core,
        server: _server,
        addr: _addr,
    } = plane;

    drop(core);
    client.shutdown();
    Arc::try_unwrap(cache).ok().unwrap().shutdown();
}

#[tokio::test]
async fn test_cold_run_of_dynamic_binary() {
    let root = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let base = root.path().to_str().unwrap().to_owned();

    std::fs::create_dir_all(root.path().join("usr/bin")).unwrap();
    std::fs::create_dir_all(root.path().join("usr/lib")).unwrap();
    std::fs::create_dir_all(root.path().join("lib64")).unwrap();

    let interp = format!("{base}/lib64/ld.so");
    let libfoo = format!("{base}/usr/lib/libfoo.so.1");
    let libbar = format!("{base}/usr/lib/libbar.so.2");
    std::fs::write(&interp, b"interpreter bytes").unwrap();
    std::fs::write(&libfoo, b"libfoo bytes").unwrap();
    std::fs::write(&libbar, b"libbar bytes").unwrap();

    let app = format!("{base}/usr/bin/app");
    let image = synthetic_elf(&interp, &[&libfoo, &libbar]);
    std::fs::write(&app, &image).unwrap();

    let plane = start_plane(
        vec![format!("{base}/usr"), format!("{base}/lib64")],
        cache_dir.path(),
    )
    .await;

    // One open, one bulk fetch on the wire.
    let fh = plane.core.open_for_read(&app).await.unwrap();
    assert_eq!(plane.server.stats().bulk_fetches(), 1);

    // Contents serve locally from the cached blob.
    let data = plane.core.read_handle(fh, 0, image.len() as u32).await.unwrap();
    assert_eq!(data, image);
    plane.core.release_handle(fh).await.unwrap();

    // The dependency closure landed in cache: stats of the libraries and
    // the interpreter are hits, not round trips.
    let requests_before = plane.server.stats().requests();
    for path in [&interp, &libfoo, &libbar] {
        let attr = plane.core.attr_of(path).await.unwrap();
        assert!(attr.is_regular());
    }
    assert_eq!(plane.server.stats().requests(), requests_before);

    teardown(plane);
}

#[tokio::test]
async fn test_warm_run_reuses_persisted_cache() {
    let root = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let base = root.path().to_str().unwrap().to_owned();

    std::fs::create_dir_all(root.path().join("usr/bin")).unwrap();
    let app = format!("{base}/usr/bin/tool");
    let image = synthetic_elf(&format!("{base}/usr/bin/ld.so"), &[]);
    std::fs::write(&app, &image).unwrap();
    std::fs::write(format!("{base}/usr/bin/ld.so"), b"ld").unwrap();

    // Session one: cold fetch, then persist.
    let plane = start_plane(vec![format!("{base}/usr")], cache_dir.path()).await;
    let server = Arc::clone(&plane.server);
    let addr = plane.addr;

    let fh = plane.core.open_for_read(&app).await.unwrap();
    plane.core.release_handle(fh).await.unwrap();
    assert_eq!(server.stats().bulk_fetches(), 1);

    teardown(plane);

    // Session two against the same cache root and server.
    let bulk_before = server.stats().bulk_fetches();
    let plane2 = attach_plane(
        Arc::clone(&server),
        addr,
        vec![format!("{base}/usr")],
        cache_dir.path(),
    )
    .await;

    // Warm open: attributes and blob come from the persisted cache.
    let fh = plane2.core.open_for_read(&app).await.unwrap();
    let data = plane2.core.read_handle(fh, 0, image.len() as u32).await.unwrap();
    assert_eq!(data, image);
    plane2.core.release_handle(fh).await.unwrap();

    assert_eq!(server.stats().bulk_fetches(), bulk_before);

    teardown(plane2);
}

#[tokio::test]
async fn test_python_probe_served_by_negative_entry() {
    let root = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let base = root.path().to_str().unwrap().to_owned();

    std::fs::create_dir_all(root.path().join("usr/lib/python3")).unwrap();
    let module = format!("{base}/usr/lib/python3/foo.py");
    std::fs::write(&module, b"x = 1\n").unwrap();

    let plane = start_plane(vec![format!("{base}/usr")], cache_dir.path()).await;

    // The source stat pulls the (absent) __pycache__ alongside.
    plane.core.attr_of(&module).await.unwrap();

    let requests_before = plane.server.stats().requests();

    let pycache = format!("{base}/usr/lib/python3/__pycache__");
    assert!(matches!(
        plane.core.attr_of(&pycache).await,
        Err(RpcError::NotFound)
    ));
    assert!(matches!(
        plane
            .core
            .attr_of(&format!("{pycache}/foo.cpython-311.pyc"))
            .await,
        Err(RpcError::NotFound)
    ));

    // Both answers came from the negative entry; nothing hit the wire.
    assert_eq!(plane.server.stats().requests(), requests_before);

    teardown(plane);
}

#[tokio::test]
async fn test_user_file_streams_without_caching() {
    let root = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let base = root.path().to_str().unwrap().to_owned();

    std::fs::create_dir_all(root.path().join("usr")).unwrap();
    std::fs::create_dir_all(root.path().join("home/user")).unwrap();

    // Bigger than one streaming chunk.
    let payload: Vec<u8> = (0..3 * 1024 * 1024 + 17).map(|i| (i % 251) as u8).collect();
    let input = format!("{base}/home/user/input.bin");
    std::fs::write(&input, &payload).unwrap();

    let plane = start_plane(vec![format!("{base}/usr")], cache_dir.path()).await;
    let entries_before = plane.cache.entry_count();

    let fh = plane.core.open_for_read(&input).await.unwrap();
    let data = plane
        .core
        .read_handle(fh, 0, payload.len() as u32)
        .await
        .unwrap();
    assert_eq!(data, payload);
    plane.core.release_handle(fh).await.unwrap();

    // Streamed in chunks, never bundled, never cached.
    assert_eq!(plane.server.stats().bulk_fetches(), 0);
    assert_eq!(plane.cache.entry_count(), entries_before);

    teardown(plane);
}

#[tokio::test]
async fn test_concurrent_misses_coalesce() {
    let root = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let base = root.path().to_str().unwrap().to_owned();

    std::fs::create_dir_all(root.path().join("usr/bin")).unwrap();
    let target = format!("{base}/usr/bin/contended");
    std::fs::write(&target, b"#!/bin/sh\n").unwrap();

    let plane = start_plane(vec![format!("{base}/usr")], cache_dir.path()).await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let core = Arc::clone(&plane.core);
        let target = target.clone();
        tasks.push(tokio::spawn(async move { core.attr_of(&target).await }));
    }

    let mut sizes = Vec::new();
    for task in tasks {
        sizes.push(task.await.unwrap().unwrap().size);
    }

    assert!(sizes.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(plane.server.stats().bulk_fetches(), 1);

    teardown(plane);
}

#[tokio::test]
async fn test_write_passthrough_mutates_local_host() {
    let root = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let base = root.path().to_str().unwrap().to_owned();

    std::fs::create_dir_all(root.path().join("usr")).unwrap();
    std::fs::create_dir_all(root.path().join("home")).unwrap();

    let plane = start_plane(vec![format!("{base}/usr")], cache_dir.path()).await;

    let out = format!("{base}/home/result.txt");
    let fh = plane
        .core
        .open_for_write(&out, libc::O_WRONLY | libc::O_CREAT, 0o644)
        .await
        .unwrap();
    assert_eq!(
        plane.core.write_handle(fh, 0, b"written remotely".to_vec()).await.unwrap(),
        16
    );
    plane.core.fsync_handle(fh, true).await.unwrap();
    plane.core.release_handle(fh).await.unwrap();

    assert_eq!(std::fs::read(&out).unwrap(), b"written remotely");

    teardown(plane);
}
