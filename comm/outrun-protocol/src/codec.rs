//! Frame encoding and decoding.
//!
//! The codec defines exactly one framing so the parser stays total: every
//! byte sequence either decodes to a message or fails with a protocol error
//! that tears down the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::RpcError;
use crate::message::{is_request_opcode, is_response_opcode, Request, Response};

/// Bytes of frame header following the length prefix: opcode + request id.
pub const FRAME_HEADER: usize = 1 + 8;

/// Default upper bound for one frame body.
///
/// Must comfortably exceed the largest legal bundle (128 MiB of uncompressed
/// prefetch payload plus record overhead).
pub const DEFAULT_MAX_FRAME: usize = 192 * 1024 * 1024;

/// A decoded frame body: opcode, request id, and the CBOR payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub opcode: u8,
    pub request_id: u64,
    pub payload: Bytes,
}

impl Frame {
    /// Splits a length-stripped frame body into its parts.
    ///
    /// The caller has already consumed the 4-byte length prefix and read
    /// exactly that many bytes.
    pub fn parse(mut body: Bytes) -> Result<Self, RpcError> {
        if body.len() < FRAME_HEADER {
            return Err(RpcError::protocol("frame shorter than header"));
        }

        let opcode = body.get_u8();
        let request_id = body.get_u64();

        Ok(Self {
            opcode,
            request_id,
            payload: body,
        })
    }
}

fn encode_frame(opcode: u8, request_id: u64, body: &impl serde::Serialize) -> Result<Bytes, RpcError> {
    let mut payload = Vec::new();
    ciborium::into_writer(body, &mut payload).map_err(RpcError::protocol)?;

    let len = FRAME_HEADER + payload.len();
    let mut buf = BytesMut::with_capacity(4 + len);
    buf.put_u32(u32::try_from(len).map_err(|_| RpcError::protocol("frame too large"))?);
    buf.put_u8(opcode);
    buf.put_u64(request_id);
    buf.extend_from_slice(&payload);

    Ok(buf.freeze())
}

fn decode_payload<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T, RpcError> {
    let mut cursor = std::io::Cursor::new(payload);
    let value: T = ciborium::from_reader(&mut cursor).map_err(RpcError::protocol)?;

    if cursor.position() != payload.len() as u64 {
        return Err(RpcError::protocol("trailing bytes after payload"));
    }

    Ok(value)
}

/// Encodes a request as a complete frame including the length prefix.
pub fn encode_request(request_id: u64, request: &Request) -> Result<Bytes, RpcError> {
    encode_frame(request.opcode(), request_id, request)
}

/// Encodes a response as a complete frame including the length prefix.
pub fn encode_response(request_id: u64, response: &Response) -> Result<Bytes, RpcError> {
    encode_frame(response.opcode(), request_id, response)
}

/// Decodes a request from a length-stripped frame body.
pub fn decode_request(body: Bytes) -> Result<(u64, Request), RpcError> {
    let frame = Frame::parse(body)?;

    if !is_request_opcode(frame.opcode) {
        return Err(RpcError::Protocol(format!(
            "unknown request opcode {:#04x}",
            frame.opcode
        )));
    }

    let request: Request = decode_payload(&frame.payload)?;

    if request.opcode() != frame.opcode {
        return Err(RpcError::protocol("opcode does not match payload"));
    }

    Ok((frame.request_id, request))
}

/// Decodes a response from a length-stripped frame body.
pub fn decode_response(body: Bytes) -> Result<(u64, Response), RpcError> {
    let frame = Frame::parse(body)?;

    if !is_response_opcode(frame.opcode) {
        return Err(RpcError::Protocol(format!(
            "unknown response opcode {:#04x}",
            frame.opcode
        )));
    }

    let response: Response = decode_payload(&frame.payload)?;

    if response.opcode() != frame.opcode {
        return Err(RpcError::protocol("opcode does not match payload"));
    }

    Ok((frame.request_id, response))
}

/// Validates a length prefix before the body is read off the stream.
pub fn check_frame_len(len: u32, max_frame: usize) -> Result<usize, RpcError> {
    let len = len as usize;

    if len < FRAME_HEADER {
        return Err(RpcError::protocol("frame length below header size"));
    }
    if len > max_frame {
        return Err(RpcError::Protocol(format!(
            "frame of {len} bytes exceeds limit of {max_frame}"
        )));
    }

    Ok(len)
}
