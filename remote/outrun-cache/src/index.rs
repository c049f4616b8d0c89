//! On-disk metadata index: append-only log plus compacted snapshots.
//!
//! All disk mutation funnels through a single writer thread; readers never
//! touch the files after startup replay. Appends are checksummed per record
//! so a crash mid-write costs only the torn tail.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};

use outrun_protocol::message::{hex, sha256};
use outrun_protocol::Validator;

use crate::blobs::BlobStore;
use crate::entry::{MetaKey, Payload};

/// Appends between automatic compactions.
const SNAPSHOT_EVERY: u64 = 4096;

/// One live index entry as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub key: MetaKey,
    pub payload: Payload,
    pub validator: Option<Validator>,
    pub last_use: u64,
}

/// One log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    Put(EntryRecord),
    Del(MetaKey),
    RootVersion(u64),
}

/// Compacted state written to `meta.snap`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub root_version: Option<u64>,
    pub entries: Vec<EntryRecord>,
    pub counter: u64,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    sum: String,
    rec: LogRecord,
}

fn checksum(record: &LogRecord) -> String {
    let bytes = serde_json::to_vec(record).unwrap_or_default();
    hex(&sha256(&bytes))
}

/// State recovered at startup.
#[derive(Debug, Default)]
pub struct Replayed {
    pub root_version: Option<u64>,
    pub entries: HashMap<MetaKey, EntryRecord>,
    pub counter: u64,
}

fn idx_path(root: &Path) -> PathBuf {
    root.join("meta.idx")
}

fn snap_path(root: &Path) -> PathBuf {
    root.join("meta.snap")
}

/// Replays `meta.snap` then `meta.idx`, discarding any log tail whose
/// checksums fail.
#[must_use]
pub fn replay(root: &Path) -> Replayed {
    let mut state = Replayed::default();

    match std::fs::read(snap_path(root)) {
        Ok(bytes) => match serde_json::from_slice::<Snapshot>(&bytes) {
            Ok(snap) => {
                state.root_version = snap.root_version;
                state.counter = snap.counter;
                for record in snap.entries {
                    state.entries.insert(record.key.clone(), record);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "snapshot unreadable, starting from empty index");
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(error = %e, "snapshot unreadable, starting from empty index"),
    }

    let Ok(file) = File::open(idx_path(root)) else {
        return state;
    };

    let mut applied = 0usize;
    for line in BufReader::new(file).lines() {
        let Ok(line) = line else { break };
        if line.is_empty() {
            continue;
        }

        let Ok(envelope) = serde_json::from_str::<Envelope>(&line) else {
            tracing::warn!(applied, "discarding torn index log tail");
            break;
        };
        if checksum(&envelope.rec) != envelope.sum {
            tracing::warn!(applied, "discarding index log tail with bad checksum");
            break;
        }

        apply(&mut state, envelope.rec);
        applied += 1;
    }

    state
}

fn apply(state: &mut Replayed, record: LogRecord) {
    match record {
        LogRecord::Put(entry) => {
            state.counter = state.counter.max(entry.last_use);
            state.entries.insert(entry.key.clone(), entry);
        }
        LogRecord::Del(key) => {
            state.entries.remove(&key);
        }
        LogRecord::RootVersion(version) => state.root_version = Some(version),
    }
}

enum Cmd {
    Append(LogRecord),
    Snapshot(Box<Snapshot>),
    RemoveBlob(String),
    Shutdown,
}

/// Handle to the single disk-writer thread.
pub struct IndexWriter {
    tx: Sender<Cmd>,
    handle: Option<JoinHandle<()>>,
}

impl IndexWriter {
    /// Starts the writer thread for the given cache root.
    pub fn start(root: &Path, blob_store: Arc<BlobStore>) -> std::io::Result<Self> {
        let idx = idx_path(root);
        let snap = snap_path(root);
        let file = OpenOptions::new().create(true).append(true).open(&idx)?;
        let (tx, rx) = mpsc::channel::<Cmd>();

        let handle = std::thread::Builder::new()
            .name("outrun-cache-writer".into())
            .spawn(move || {
                let mut out = BufWriter::new(file);

                while let Ok(cmd) = rx.recv() {
                    match cmd {
                        Cmd::Append(record) => {
                            let envelope = Envelope {
                                sum: checksum(&record),
                                rec: record,
                            };
                            if let Ok(mut line) = serde_json::to_vec(&envelope) {
                                line.push(b'\n');
                                if let Err(e) = out.write_all(&line).and_then(|()| out.flush()) {
                                    tracing::error!(error = %e, "index append failed");
                                }
                            }
                        }
                        Cmd::Snapshot(snapshot) => {
                            if let Err(e) = write_snapshot(&snap, &snapshot) {
                                tracing::error!(error = %e, "snapshot write failed");
                            } else {
                                // Fresh log after a successful compaction.
                                match OpenOptions::new()
                                    .create(true)
                                    .write(true)
                                    .truncate(true)
                                    .open(&idx)
                                {
                                    Ok(file) => out = BufWriter::new(file),
                                    Err(e) => {
                                        tracing::error!(error = %e, "index truncate failed");
                                    }
                                }
                            }
                        }
                        Cmd::RemoveBlob(hash) => blob_store.remove(&hash),
                        Cmd::Shutdown => break,
                    }
                }

                let _ = out.flush();
            })?;

        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Queues a log append.
    pub fn append(&self, record: LogRecord) {
        let _ = self.tx.send(Cmd::Append(record));
    }

    /// Queues a compaction with the given full state.
    pub fn snapshot(&self, snapshot: Snapshot) {
        let _ = self.tx.send(Cmd::Snapshot(Box::new(snapshot)));
    }

    /// Queues removal of a blob file.
    pub fn remove_blob(&self, hash: String) {
        let _ = self.tx.send(Cmd::RemoveBlob(hash));
    }

    /// Number of appends after which the owner should trigger a snapshot.
    #[must_use]
    pub const fn snapshot_interval() -> u64 {
        SNAPSHOT_EVERY
    }

    /// Flushes outstanding work and joins the thread.
    pub fn shutdown(mut self) {
        let _ = self.tx.send(Cmd::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        let _ = self.tx.send(Cmd::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn write_snapshot(snap: &Path, snapshot: &Snapshot) -> std::io::Result<()> {
    let tmp = snap.with_extension("snap.tmp");

    let mut file = File::create(&tmp)?;
    serde_json::to_writer(&mut file, snapshot).map_err(std::io::Error::other)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp, snap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use outrun_protocol::RpcError;

    fn record(path: &str, last_use: u64) -> EntryRecord {
        EntryRecord {
            key: MetaKey::attr(path),
            payload: Payload::Negative {
                error: RpcError::NotFound,
            },
            validator: None,
            last_use,
        }
    }

    fn writer_for(dir: &Path) -> IndexWriter {
        let blobs = Arc::new(BlobStore::open(dir).unwrap());
        IndexWriter::start(dir, blobs).unwrap()
    }

    #[test]
    fn test_append_replay_roundtrip() {
        let dir = tempfile::tempdir().unwrap();

        let writer = writer_for(dir.path());
        writer.append(LogRecord::RootVersion(7));
        writer.append(LogRecord::Put(record("/a", 1)));
        writer.append(LogRecord::Put(record("/b", 2)));
        writer.append(LogRecord::Del(MetaKey::attr("/a")));
        writer.shutdown();

        let state = replay(dir.path());
        assert_eq!(state.root_version, Some(7));
        assert_eq!(state.entries.len(), 1);
        assert!(state.entries.contains_key(&MetaKey::attr("/b")));
        assert_eq!(state.counter, 2);
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();

        let writer = writer_for(dir.path());
        writer.append(LogRecord::Put(record("/good", 1)));
        writer.shutdown();

        // Simulate a crash mid-append.
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join("meta.idx"))
            .unwrap();
        file.write_all(b"{\"sum\":\"feedface\",\"rec\":{\"Put\":{\"key\"").unwrap();
        drop(file);

        let state = replay(dir.path());
        assert_eq!(state.entries.len(), 1);
        assert!(state.entries.contains_key(&MetaKey::attr("/good")));
    }

    #[test]
    fn test_bad_checksum_discards_tail() {
        let dir = tempfile::tempdir().unwrap();

        let writer = writer_for(dir.path());
        writer.append(LogRecord::Put(record("/one", 1)));
        writer.shutdown();

        // A structurally valid line whose checksum does not match, followed
        // by a line that would otherwise be fine.
        let tampered = Envelope {
            sum: "0".repeat(64),
            rec: LogRecord::Put(record("/two", 2)),
        };
        let fine = Envelope {
            sum: checksum(&LogRecord::Put(record("/three", 3))),
            rec: LogRecord::Put(record("/three", 3)),
        };
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join("meta.idx"))
            .unwrap();
        serde_json::to_writer(&mut file, &tampered).unwrap();
        file.write_all(b"\n").unwrap();
        serde_json::to_writer(&mut file, &fine).unwrap();
        file.write_all(b"\n").unwrap();
        drop(file);

        let state = replay(dir.path());
        assert_eq!(state.entries.len(), 1);
        assert!(state.entries.contains_key(&MetaKey::attr("/one")));
    }

    #[test]
    fn test_snapshot_compacts_log() {
        let dir = tempfile::tempdir().unwrap();

        let writer = writer_for(dir.path());
        writer.append(LogRecord::Put(record("/a", 1)));
        writer.snapshot(Snapshot {
            root_version: Some(9),
            entries: vec![record("/a", 1)],
            counter: 5,
        });
        writer.append(LogRecord::Put(record("/b", 6)));
        writer.shutdown();

        let state = replay(dir.path());
        assert_eq!(state.root_version, Some(9));
        assert_eq!(state.entries.len(), 2);
        assert_eq!(state.counter, 6);
    }
}
