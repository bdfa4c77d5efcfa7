//! ErrorResponse packet builder
//!
//! Used only on pre-auth rejection paths (backend connect failure, wait-queue
//! timeout); everything else flows through the proxy untouched.

use bytes::{BufMut, Bytes, BytesMut};

/// Build a PostgreSQL ErrorResponse frame: type byte `E`, 4-byte big-endian
/// length covering the body, then tagged C-string fields `S` = FATAL,
/// `C` = sqlstate (5 ASCII chars), `M` = message, zero-tag terminated.
pub fn build_error_response(sqlstate: &str, message: &str) -> Bytes {
    let mut body = BytesMut::new();
    for (tag, value) in [(b'S', "FATAL"), (b'C', sqlstate), (b'M', message)] {
        body.put_u8(tag);
        body.put_slice(value.as_bytes());
        body.put_u8(0);
    }
    body.put_u8(0);

    let mut out = BytesMut::with_capacity(5 + body.len());
    out.put_u8(b'E');
    out.put_u32((4 + body.len()) as u32);
    out.put_slice(&body);
    out.freeze()
}

/// Parsed fields of an ErrorResponse frame.
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedError {
    pub severity: String,
    pub sqlstate: String,
    pub message: String,
}

/// Parse an ErrorResponse frame back into its S/C/M fields. Returns `None`
/// for anything that is not a well-formed ErrorResponse.
pub fn parse_error_response(frame: &[u8]) -> Option<ParsedError> {
    if frame.len() < 5 || frame[0] != b'E' {
        return None;
    }
    let mut severity = None;
    let mut sqlstate = None;
    let mut message = None;
    let mut rest = &frame[5..];
    while let Some((&tag, tail)) = rest.split_first() {
        if tag == 0 {
            break;
        }
        let end = tail.iter().position(|&b| b == 0)?;
        let value = String::from_utf8(tail[..end].to_vec()).ok()?;
        match tag {
            b'S' => severity = Some(value),
            b'C' => sqlstate = Some(value),
            b'M' => message = Some(value),
            _ => {}
        }
        rest = &tail[end + 1..];
    }
    Some(ParsedError {
        severity: severity?,
        sqlstate: sqlstate?,
        message: message?,
    })
}
