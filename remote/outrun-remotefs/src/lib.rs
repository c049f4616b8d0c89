//! # outrun-remotefs
//!
//! Remote-host side of the filesystem plane: the FUSE filesystem that
//! projects the local host's namespace into the remote process tree, the
//! multiplexed RPC client it rides on, and the session lifecycle that ties
//! mount, cache, and connection pool together.
//!
//! The FUSE layer is the policy center: it consults the cache first, asks
//! the local host on a miss, and decides which misses are worth a bulk
//! fetch with a prefetch closure instead of a single answer.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod client;
pub mod config;
pub mod fs;
pub mod inode;
pub mod session;

pub use client::{ClientConfig, ConnectParams, RpcClient};
pub use config::Config;
pub use fs::{FsCore, OutrunFs};
pub use session::{Session, SessionOptions, SessionState};
