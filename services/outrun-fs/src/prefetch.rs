//! Prefetch policy: turning one request into the bundle of entries the
//! remote will need next.
//!
//! Every rule here is a bet that bandwidth is cheaper than a 20 ms round
//! trip. The bets are deterministic and bounded: a bundle never exceeds the
//! configured entry and byte caps, truncating in BFS order with the primary
//! targets always served first. A failed prefetch becomes a per-item error
//! in the bundle so the remote can cache the negative result; it never fails
//! the primary request.
//!
//! Rules, in the order they are applied:
//!
//! 1. ELF dependency closure: interpreter from PT_INTERP, libraries from
//!    DT_NEEDED resolved against the standard search directories (plus
//!    whatever `/etc/ld.so.conf.d/*.conf` names), transitively up to the
//!    depth cap, and the listings of the search directories themselves.
//! 2. Script interpreter: `#!` on the first line pulls the interpreter.
//! 3. Python bytecode companions: a `.py` fetch pulls the matching
//!    `__pycache__` entries, or their absence.
//! 4. Symlink targets: a fetched symlink pulls its target's attributes.

use std::collections::{HashSet, VecDeque};
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use parking_lot::Mutex;

use outrun_protocol::{BundleItem, FetchKind, FileContents, SystemPaths};

use crate::elf;
use crate::service::LocalFs;

/// Hard bounds for one bundle.
#[derive(Debug, Clone, Copy)]
pub struct PrefetchLimits {
    /// Maximum items in one bundle.
    pub max_entries: usize,
    /// Maximum total uncompressed blob bytes in one bundle.
    pub max_bytes: u64,
    /// Transitive DT_NEEDED depth.
    pub max_depth: u32,
}

impl Default for PrefetchLimits {
    fn default() -> Self {
        Self {
            max_entries: 256,
            max_bytes: 128 * 1024 * 1024,
            max_depth: 3,
        }
    }
}

/// One resolved prefetch decision waiting for budget.
#[derive(Debug, Clone)]
struct Suggestion {
    path: String,
    want_dir: bool,
    want_blob: bool,
    depth: u32,
}

/// Session-scoped prefetch engine.
///
/// Remembers what it already served so repeated opens of the same binary do
/// not re-ship the same libraries. The remote reports its warm cache through
/// `mark_cached` for the same reason.
pub struct PrefetchEngine {
    fs: LocalFs,
    prefetchable: SystemPaths,
    limits: PrefetchLimits,
    min_ratio: f64,
    fetched_meta: Mutex<HashSet<String>>,
    fetched_blobs: Mutex<HashSet<String>>,
}

impl PrefetchEngine {
    /// Creates an engine restricted to the given prefixes.
    #[must_use]
    pub fn new(prefetchable: SystemPaths, limits: PrefetchLimits, min_ratio: f64) -> Self {
        Self {
            fs: LocalFs::new(),
            prefetchable,
            limits,
            min_ratio,
            fetched_meta: Mutex::new(HashSet::new()),
            fetched_blobs: Mutex::new(HashSet::new()),
        }
    }

    /// Marks blob contents as already present on the remote.
    pub fn mark_cached(&self, paths: &[String]) {
        self.fetched_blobs.lock().extend(paths.iter().cloned());
    }

    /// Serves a bulk fetch: the requested paths plus their prefetch closure.
    #[must_use]
    pub fn bulk_fetch(&self, paths: &[String], depth: u32, kinds: &[FetchKind]) -> Vec<BundleItem> {
        let want_dir = kinds.contains(&FetchKind::Dir);
        let want_blob = kinds.contains(&FetchKind::Blob);
        let depth_cap = depth.min(self.limits.max_depth);

        let mut bundle: Vec<BundleItem> = Vec::new();
        // Keyed by (path, wants-contents): a path pulled for attributes may
        // legitimately come around again for its contents.
        let mut included: HashSet<(String, bool)> = HashSet::new();
        let mut bytes_used: u64 = 0;
        let mut queue: VecDeque<Suggestion> = VecDeque::new();

        // Primary targets are always served, budget permitting the blob.
        for path in paths {
            if bundle.len() >= self.limits.max_entries {
                break;
            }

            let (item, raw) = self.fetch_item(path, want_dir, want_blob, &mut bytes_used);
            self.suggest_for(&item, raw.as_deref(), 0, depth_cap, &mut queue);
            included.insert((path.clone(), want_blob));
            bundle.push(item);
        }

        // Expand the closure in BFS order until a cap cuts it off.
        while let Some(sug) = queue.pop_front() {
            if bundle.len() >= self.limits.max_entries {
                tracing::debug!(dropped = queue.len() + 1, "bundle entry cap reached");
                break;
            }
            if !self.prefetchable.contains(&sug.path)
                || !included.insert((sug.path.clone(), sug.want_blob))
            {
                continue;
            }
            if self.already_fetched(&sug.path, sug.want_blob) {
                continue;
            }

            let (item, raw) =
                self.fetch_item(&sug.path, sug.want_dir, sug.want_blob, &mut bytes_used);
            self.suggest_for(&item, raw.as_deref(), sug.depth, depth_cap, &mut queue);
            bundle.push(item);
        }

        bundle
    }

    fn already_fetched(&self, path: &str, want_blob: bool) -> bool {
        if want_blob {
            self.fetched_blobs.lock().contains(path)
        } else {
            self.fetched_meta.lock().contains(path)
        }
    }

    /// Builds one bundle item, charging blob bytes against the budget.
    ///
    /// Returns the raw blob bytes alongside so dependency expansion can
    /// parse them without a second read.
    fn fetch_item(
        &self,
        path: &str,
        want_dir: bool,
        want_blob: bool,
        bytes_used: &mut u64,
    ) -> (BundleItem, Option<Vec<u8>>) {
        let meta = self.fs.getattr_infallible(path);
        self.fetched_meta.lock().insert(path.to_owned());

        let is_dir = meta.attr.is_some_and(|a| a.is_dir());
        let is_file = meta.attr.is_some_and(|a| a.is_regular());

        let dir = (want_dir && is_dir)
            .then(|| self.fs.readdir(path).ok())
            .flatten();

        let mut raw = None;
        let mut blob = None;

        if want_blob && is_file {
            match self.fs.read_whole(path) {
                Ok(data) => {
                    let fits = *bytes_used + data.len() as u64 <= self.limits.max_bytes;
                    if fits {
                        *bytes_used += data.len() as u64;
                        blob = Some(FileContents::from_bytes(&data, self.min_ratio));
                        self.fetched_blobs.lock().insert(path.to_owned());
                        raw = Some(data);
                    } else {
                        tracing::debug!(path, size = data.len(), "blob over byte budget, omitted");
                    }
                }
                Err(e) => {
                    tracing::debug!(path, error = %e, "blob read failed during prefetch");
                }
            }
        }

        (
            BundleItem {
                path: path.to_owned(),
                meta,
                dir,
                blob,
            },
            raw,
        )
    }

    /// Derives follow-up suggestions from a fetched item.
    fn suggest_for(
        &self,
        item: &BundleItem,
        raw: Option<&[u8]>,
        depth: u32,
        depth_cap: u32,
        queue: &mut VecDeque<Suggestion>,
    ) {
        // Symlink target: a stat of a link is very likely followed by a stat
        // of what it points to.
        if let Some(link) = &item.meta.link {
            if let Some(target) = resolve_link(&item.path, link) {
                queue.push_back(Suggestion {
                    path: target,
                    want_dir: false,
                    want_blob: false,
                    depth,
                });
            }
        }

        // Python bytecode companions.
        self.suggest_pycache(&item.path, queue, depth);

        let Some(data) = raw else { return };

        // Script interpreter.
        if let Some(interp) = parse_shebang(data) {
            queue.push_back(Suggestion {
                path: interp,
                want_dir: false,
                want_blob: true,
                depth,
            });
        }

        // ELF dependency closure.
        if depth < depth_cap && elf::looks_like_elf(data) {
            if let Some(info) = elf::parse(data) {
                self.suggest_elf(&info, depth, queue);
            }
        }
    }

    fn suggest_elf(&self, info: &elf::ElfInfo, depth: u32, queue: &mut VecDeque<Suggestion>) {
        if !info.is_dynamic() {
            return;
        }

        if let Some(interp) = &info.interpreter {
            queue.push_back(Suggestion {
                path: interp.clone(),
                want_dir: false,
                want_blob: true,
                depth: depth + 1,
            });
        }

        for name in &info.needed {
            // Names with a slash are taken as-is; bare sonames resolve
            // against the search path.
            let resolved = if name.contains('/') {
                Some(name.clone())
            } else {
                library_dirs()
                    .iter()
                    .map(|dir| format!("{dir}/{name}"))
                    .find(|p| std::fs::symlink_metadata(p).is_ok())
            };

            let Some(path) = resolved else { continue };

            // The soname path is often a symlink; ship its metadata and the
            // real file's contents.
            queue.push_back(Suggestion {
                path: path.clone(),
                want_dir: false,
                want_blob: false,
                depth: depth + 1,
            });

            if let Ok(real) = std::fs::canonicalize(&path) {
                if let Some(real) = real.to_str() {
                    queue.push_back(Suggestion {
                        path: real.to_owned(),
                        want_dir: false,
                        want_blob: true,
                        depth: depth + 1,
                    });
                }
            }
        }

        // The dynamic linker walks these during lookup; having their
        // listings warm answers its stat storm locally.
        for dir in library_dirs() {
            queue.push_back(Suggestion {
                path: dir.clone(),
                want_dir: true,
                want_blob: false,
                depth: depth + 1,
            });
        }
    }

    /// CPython probes `__pycache__` right after reading a source file.
    fn suggest_pycache(&self, path: &str, queue: &mut VecDeque<Suggestion>, depth: u32) {
        let p = Path::new(path);
        if p.extension().is_none_or(|e| e != "py") {
            return;
        }
        let (Some(parent), Some(stem)) = (p.parent(), p.file_stem().and_then(|s| s.to_str()))
        else {
            return;
        };

        let pycache = parent.join("__pycache__");
        let Some(pycache_str) = pycache.to_str() else {
            return;
        };

        // The directory itself: present or (negatively cacheable) absent.
        queue.push_back(Suggestion {
            path: pycache_str.to_owned(),
            want_dir: true,
            want_blob: false,
            depth,
        });

        if let Ok(entries) = std::fs::read_dir(&pycache) {
            let prefix = format!("{stem}.");
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with(&prefix) {
                    queue.push_back(Suggestion {
                        path: format!("{pycache_str}/{name}"),
                        want_dir: false,
                        want_blob: true,
                        depth,
                    });
                }
            }
        }
    }
}

/// Shared-library search directories: the conventional ones plus whatever
/// the ld.so drop-in configuration names. Resolved once per process.
fn library_dirs() -> &'static Vec<String> {
    static DIRS: OnceLock<Vec<String>> = OnceLock::new();

    DIRS.get_or_init(|| {
        let mut dirs: Vec<String> = ["/lib", "/lib64", "/usr/lib", "/usr/lib64"]
            .iter()
            .map(ToString::to_string)
            .collect();

        if let Ok(entries) = std::fs::read_dir("/etc/ld.so.conf.d") {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_none_or(|e| e != "conf") {
                    continue;
                }
                if let Ok(text) = std::fs::read_to_string(&path) {
                    for line in text.lines() {
                        let line = line.trim();
                        if line.is_empty() || line.starts_with('#') || line.starts_with("include") {
                            continue;
                        }
                        if line.starts_with('/') && !dirs.iter().any(|d| d == line) {
                            dirs.push(line.to_owned());
                        }
                    }
                }
            }
        }

        dirs
    })
}

/// Extracts the interpreter path from a `#!` line.
fn parse_shebang(data: &[u8]) -> Option<String> {
    let rest = data.strip_prefix(b"#!")?;
    let line = rest.split(|&b| b == b'\n').next()?;
    let line = std::str::from_utf8(line).ok()?;
    let interp = line.trim_start().split_whitespace().next()?;

    interp.starts_with('/').then(|| interp.to_owned())
}

/// Resolves a symlink target relative to the link's directory, lexically.
fn resolve_link(link_path: &str, target: &str) -> Option<String> {
    let base = if target.starts_with('/') {
        PathBuf::from(target)
    } else {
        Path::new(link_path).parent()?.join(target)
    };

    let mut out = PathBuf::new();
    for comp in base.components() {
        match comp {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }

    out.to_str().map(str::to_owned)
}
