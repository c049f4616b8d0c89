//! # outrun-protocol
//!
//! Wire protocol for the outrun filesystem plane.
//!
//! The local host exposes its filesystem over a framed RPC protocol; the
//! remote host consumes it from the FUSE layer and the cache. This crate
//! defines the message types, the frame codec, and the error taxonomy shared
//! by both ends.
//!
//! ## Wire format
//!
//! ```text
//! +----------------+--------+---------------------+----------------+
//! | Length (4B BE) | Opcode | Request id (8B BE)  | Payload (CBOR) |
//! +----------------+--------+---------------------+----------------+
//! ```
//!
//! - Length: size of opcode + request id + payload in big-endian
//! - Opcode: message type identifier
//! - Request id: correlates responses with requests; responses may arrive
//!   out of order
//! - Payload: self-describing CBOR record
//!
//! Bulk file contents travel inside payloads with their own compression tag
//! (`none` or `lz4`); compression is applied per blob, never across frames.
//!
//! A frame that is truncated, oversized, or carries an unknown opcode is a
//! protocol fault: the connection is not recoverable mid-stream and must be
//! torn down.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod codec;
pub mod error;
pub mod message;
pub mod paths;

pub use codec::{
    decode_request, decode_response, encode_request, encode_response, Frame, DEFAULT_MAX_FRAME,
};
pub use error::{RpcError, RpcResult};
pub use message::{
    hex, sha256, Attributes, BundleItem, Compression, DirEntry, FetchKind, FileContents, FsStats,
    Metadata, Request, Response, Validator,
};
pub use paths::SystemPaths;

/// Protocol version.
///
/// Checked during the handshake; both ends must agree. Prefetch rule changes
/// do not require a version bump, message layout changes do.
pub const PROTOCOL_VERSION: u32 = 1;

/// Name of the FUSE filesystem as reported to the kernel.
pub const FILESYSTEM_NAME: &str = "outrunfs";

/// Exit code for failures of outrun itself, as opposed to the guest command.
pub const OUTRUN_ERROR_CODE: i32 = 254;
