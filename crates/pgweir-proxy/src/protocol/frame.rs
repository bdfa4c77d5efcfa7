//! Frame extraction for the two phases of the PostgreSQL v3 protocol.
//!
//! Startup phase (first client message): a 4-byte big-endian length that
//! includes itself, then `len - 4` body bytes, no type byte. Message phase:
//! one type byte, then a 4-byte big-endian length covering the length field
//! and the payload, so the whole frame is `1 + len` bytes.
//!
//! Extraction drains the input buffer only when a complete frame is
//! available; a short read leaves the buffer untouched. Declared lengths
//! outside `[4, 1 MiB]` are a protocol violation and fatal to the session.

use bytes::{Buf, Bytes, BytesMut};

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: u32 = 196608;

/// Special startup codes (sent in place of the protocol version)
pub const SSL_REQUEST_CODE: u32 = 80877103;
pub const GSSENC_REQUEST_CODE: u32 = 80877104;
pub const CANCEL_REQUEST_CODE: u32 = 80877102;

/// Sanity bound on any declared frame length.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Backend ReadyForQuery message type
pub const MSG_READY_FOR_QUERY: u8 = b'Z';

/// A complete wire frame, length prefix (and type byte, if any) included.
pub type Frame = Bytes;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("declared frame length {0} outside [4, {MAX_FRAME_LEN}]")]
    LengthOutOfRange(usize),
}

fn read_be32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

fn check_len(len: usize) -> Result<(), FrameError> {
    if !(4..=MAX_FRAME_LEN).contains(&len) {
        return Err(FrameError::LengthOutOfRange(len));
    }
    Ok(())
}

/// Extract one startup-phase frame. Returns `None` if incomplete.
pub fn try_extract_startup(buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = read_be32(&buf[..4]) as usize;
    check_len(len)?;
    if buf.len() < len {
        return Ok(None);
    }
    Ok(Some(buf.split_to(len).freeze()))
}

/// Extract one typed message-phase frame. Returns `None` if incomplete.
pub fn try_extract_message(buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
    if buf.len() < 5 {
        return Ok(None);
    }
    let len = read_be32(&buf[1..5]) as usize;
    check_len(len)?;
    let total = 1 + len;
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some(buf.split_to(total).freeze()))
}

/// True when the buffer holds at least one complete typed frame, without
/// draining anything.
pub fn has_complete_message(buf: &[u8]) -> Result<bool, FrameError> {
    if buf.len() < 5 {
        return Ok(false);
    }
    let len = read_be32(&buf[1..5]) as usize;
    check_len(len)?;
    Ok(buf.len() >= 1 + len)
}

/// Number of bytes forming the first client packet as far as routing is
/// concerned. If the first startup frame is an SSLRequest, that is its 8
/// bytes plus the following StartupMessage; otherwise the single startup
/// frame. Returns 0 while incomplete.
pub fn first_client_packet_length(buf: &[u8]) -> Result<usize, FrameError> {
    if buf.len() < 4 {
        return Ok(0);
    }
    let len = read_be32(&buf[..4]) as usize;
    check_len(len)?;
    if buf.len() < len {
        return Ok(0);
    }
    if len == 8 && read_be32(&buf[4..8]) == SSL_REQUEST_CODE {
        // SSLRequest followed by the real StartupMessage.
        let rest = &buf[8..];
        if rest.len() < 4 {
            return Ok(0);
        }
        let startup_len = read_be32(&rest[..4]) as usize;
        check_len(startup_len)?;
        if rest.len() < startup_len {
            return Ok(0);
        }
        return Ok(8 + startup_len);
    }
    Ok(len)
}

fn startup_code(frame: &[u8]) -> Option<u32> {
    if frame.len() == 8 {
        Some(read_be32(&frame[4..8]))
    } else {
        None
    }
}

/// True if the startup frame is an SSLRequest (len 8, code 80877103).
pub fn is_ssl_request(frame: &[u8]) -> bool {
    startup_code(frame) == Some(SSL_REQUEST_CODE)
}

/// True if the startup frame is a GSSENCRequest (len 8, code 80877104).
pub fn is_gssenc_request(frame: &[u8]) -> bool {
    startup_code(frame) == Some(GSSENC_REQUEST_CODE)
}

/// True if the startup frame begins a CancelRequest (len 16, code 80877102).
pub fn is_cancel_request(frame: &[u8]) -> bool {
    frame.len() >= 8 && read_be32(&frame[4..8]) == CANCEL_REQUEST_CODE
}

/// Type byte of a message-phase frame, or 0 for an empty slice.
pub fn message_type(frame: &[u8]) -> u8 {
    frame.first().copied().unwrap_or(0)
}

/// Transaction status of a ReadyForQuery frame ('I', 'T' or 'E'), if the
/// frame is one.
pub fn ready_for_query_status(frame: &[u8]) -> Option<u8> {
    if frame.len() == 6 && frame[0] == MSG_READY_FOR_QUERY && read_be32(&frame[1..5]) == 5 {
        Some(frame[5])
    } else {
        None
    }
}

/// Extract a parameter value from a StartupMessage frame (e.g. "user",
/// "database"). The body past the 8-byte header is a sequence of
/// null-terminated key/value pairs ending with an extra null; a missing
/// final terminator on a truncated message is tolerated.
pub fn startup_parameter(frame: &[u8], key: &str) -> Option<String> {
    if frame.len() < 8 {
        return None;
    }
    let mut fields = frame[8..].split(|&b| b == 0);
    while let Some(k) = fields.next() {
        if k.is_empty() {
            break;
        }
        let v = fields.next()?;
        if k == key.as_bytes() {
            return String::from_utf8(v.to_vec()).ok();
        }
    }
    None
}
