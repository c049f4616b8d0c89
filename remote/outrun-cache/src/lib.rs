//! # outrun-cache
//!
//! Persistent cache for the remote side of the filesystem plane.
//!
//! Metadata (attributes, directory listings, symlink targets, and negative
//! results) is kept in an in-memory index backed by an append-only log with
//! periodic compacted snapshots. File contents live in a content-addressed
//! blob store, so identical files across paths share one blob.
//!
//! On-disk layout under the cache root:
//!
//! ```text
//! meta.idx            append-only log of checksummed index records
//! meta.snap           compacted snapshot
//! blobs/<hh>/<hash>   blob files named by content hash
//! LOCK                exclusive lock held by the running session
//! ```
//!
//! The index tolerates a crash mid-append: records whose checksum fails on
//! replay are discarded along with everything after them, rolling back to
//! the last consistent state. Blob writes go through a temp file and an
//! atomic rename, so a crash leaves at worst an orphan temp file that the
//! next startup sweeps.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod blobs;
pub mod entry;
pub mod flight;
pub mod index;
pub mod store;

pub use entry::{MetaKey, MetaKind, Payload};
pub use flight::FlightGuards;
pub use store::{CacheCaps, CacheError, CacheStore};
