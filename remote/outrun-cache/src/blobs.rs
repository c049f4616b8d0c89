//! Content-addressed blob storage.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Prefix of in-progress temp files inside the blob tree.
const TMP_PREFIX: &str = "tmp-";

/// Blob files on disk, named by content hash and fanned out over a two-hex
/// prefix directory.
///
/// Writes are temp-then-rename on unique hash-named targets: two writers of
/// the same hash converge and the loser's temp file is unlinked. A blob file
/// is immutable once in place.
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Opens (and creates) the blob tree under `<cache_root>/blobs`.
    pub fn open(cache_root: &Path) -> std::io::Result<Self> {
        let root = cache_root.join("blobs");
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Final path of a blob.
    #[must_use]
    pub fn path_for(&self, hash: &str) -> PathBuf {
        let prefix = hash.get(..2).unwrap_or("xx");
        self.root.join(prefix).join(hash)
    }

    /// Writes blob contents, fsyncing before the atomic rename.
    ///
    /// Returns the bytes now on disk for this hash. An already present blob
    /// is left alone.
    pub fn insert(&self, hash: &str, data: &[u8]) -> std::io::Result<u64> {
        let target = self.path_for(hash);

        if let Ok(meta) = std::fs::metadata(&target) {
            return Ok(meta.len());
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = self.root.join(format!("{TMP_PREFIX}{}", Uuid::new_v4().simple()));
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        match std::fs::rename(&tmp, &target) {
            Ok(()) => Ok(data.len() as u64),
            Err(e) => {
                // Lost a race or the rename failed outright; either way the
                // temp file must not linger.
                let _ = std::fs::remove_file(&tmp);
                if target.exists() {
                    Ok(data.len() as u64)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Opens a blob for reading.
    pub fn open_blob(&self, hash: &str) -> std::io::Result<File> {
        File::open(self.path_for(hash))
    }

    /// Size of a stored blob, if present.
    #[must_use]
    pub fn size_of(&self, hash: &str) -> Option<u64> {
        std::fs::metadata(self.path_for(hash)).ok().map(|m| m.len())
    }

    /// Deletes a blob; missing files are fine (concurrent removal).
    pub fn remove(&self, hash: &str) {
        if let Err(e) = std::fs::remove_file(self.path_for(hash)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(hash, error = %e, "failed to remove blob");
            }
        }
    }

    /// Removes crash leftovers: temp files from interrupted writes and blob
    /// files no longer referenced by the index.
    pub fn sweep<F>(&self, is_referenced: F)
    where
        F: Fn(&str) -> bool,
    {
        let Ok(top) = std::fs::read_dir(&self.root) else {
            return;
        };

        for entry in top.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };

            if name.starts_with(TMP_PREFIX) {
                tracing::debug!(file = name, "sweeping orphan temp file");
                let _ = std::fs::remove_file(entry.path());
                continue;
            }

            let Ok(shard) = std::fs::read_dir(entry.path()) else {
                continue;
            };
            for blob in shard.flatten() {
                let hash = blob.file_name();
                let Some(hash) = hash.to_str() else { continue };
                if !is_referenced(hash) {
                    tracing::debug!(hash, "sweeping unreferenced blob");
                    let _ = std::fs::remove_file(blob.path());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outrun_protocol::message::{hex, sha256};

    #[test]
    fn test_insert_open_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let data = b"library bytes";
        let hash = hex(&sha256(data));

        assert_eq!(store.insert(&hash, data).unwrap(), data.len() as u64);
        assert_eq!(store.size_of(&hash), Some(data.len() as u64));

        let mut file = store.open_blob(&hash).unwrap();
        let mut read = Vec::new();
        std::io::Read::read_to_end(&mut file, &mut read).unwrap();
        assert_eq!(read, data);
    }

    #[test]
    fn test_double_insert_converges() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let data = b"same";
        let hash = hex(&sha256(data));
        store.insert(&hash, data).unwrap();
        store.insert(&hash, data).unwrap();

        assert_eq!(store.size_of(&hash), Some(4));
    }

    #[test]
    fn test_sweep_removes_temps_and_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let keep = hex(&sha256(b"keep"));
        let drop_ = hex(&sha256(b"drop"));
        store.insert(&keep, b"keep").unwrap();
        store.insert(&drop_, b"drop").unwrap();

        // Simulate a crash between temp write and rename.
        std::fs::write(dir.path().join("blobs").join("tmp-deadbeef"), b"partial").unwrap();

        store.sweep(|hash| hash == keep);

        assert!(store.size_of(&keep).is_some());
        assert!(store.size_of(&drop_).is_none());
        assert!(!dir.path().join("blobs").join("tmp-deadbeef").exists());
    }
}
