//! # outrun-fs
//!
//! Local-host side of the outrun filesystem plane.
//!
//! This crate exposes the local filesystem over the RPC protocol so that the
//! remote host can project it into its process tree. It contains three
//! pieces:
//!
//! - [`service::LocalFs`]: the filesystem primitives themselves, thin
//!   wrappers over syscalls with typed errors
//! - [`prefetch::PrefetchEngine`]: the policy that turns one request into a
//!   bundle of entries the remote will very likely need next
//! - [`server::FsServer`]: the TCP service that authenticates the session
//!   token and dispatches requests onto a bounded worker pool
//!
//! The design assumption throughout is that bandwidth is cheap and latency
//! is expensive: it is always better to ship a little too much in one reply
//! than to be asked again twenty milliseconds later.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod elf;
pub mod handles;
pub mod prefetch;
pub mod server;
pub mod service;

pub use prefetch::{PrefetchEngine, PrefetchLimits};
pub use server::{FsServer, ServerConfig, ServerStats};
pub use service::LocalFs;

/// Application id mixed into the machine identifier so the derived value is
/// not the confidential machine id itself.
pub const APP_ID: &[u8] = b"0cba94f1778b44a2b4072ee05c2bbe39";
