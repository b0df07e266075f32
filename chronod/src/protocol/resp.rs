//! RESP-like token layer: `+` simple strings, `:` integers, `$` bulk
//! strings, `*` arrays, `-` errors. Both `\r\n` and bare `\n` terminate
//! items. "Need more data" is a value (`FrameError::Incomplete`), never
//! a failure of the connection.

use super::stream::{LineRead, ReadBuffer};

/// Upper bound on decimal digits in an integer item.
pub const MAX_INT_DIGITS: usize = 84;
/// Upper bound on a simple-string item, terminator included.
pub const STRING_LENGTH_MAX: usize = 16384;
/// Upper bound on a declared bulk-string length.
pub const BULK_LENGTH_MAX: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespType {
    String,
    Integer,
    BulkString,
    Array,
    Error,
    Bad,
}

#[derive(Debug, PartialEq)]
pub enum FrameError {
    /// The frame is not fully buffered yet; rewind and wait.
    Incomplete,
    /// Protocol violation with rendered context.
    Fatal { message: String, pos: usize },
}

pub type FrameResult<T> = Result<T, FrameError>;

pub fn fatal(buf: &ReadBuffer, message: &str) -> FrameError {
    let (message, pos) = buf.error_context(message);
    FrameError::Fatal { message, pos }
}

/// Classify the next item by its leading byte; `None` means no bytes.
pub fn next_type(buf: &ReadBuffer) -> Option<RespType> {
    buf.pick().map(|byte| match byte {
        b'+' => RespType::String,
        b':' => RespType::Integer,
        b'$' => RespType::BulkString,
        b'*' => RespType::Array,
        b'-' => RespType::Error,
        _ => RespType::Bad,
    })
}

/// Parse the decimal body of an integer item (terminator included).
fn read_int_body(buf: &mut ReadBuffer) -> FrameResult<u64> {
    enum Body {
        Value(u64),
        BadChar,
        BadCr,
        TooLong,
    }
    let parsed = match buf.read_line(MAX_INT_DIGITS + 2) {
        LineRead::Partial => return Err(FrameError::Incomplete),
        LineRead::Overrun => Body::TooLong,
        LineRead::Complete(line) => {
            let mut result: u64 = 0;
            let mut outcome = Body::BadChar;
            let mut it = line.iter();
            while let Some(&c) = it.next() {
                if c.is_ascii_digit() {
                    result = result.wrapping_mul(10).wrapping_add(u64::from(c & 0x0F));
                } else if c == b'\n' {
                    outcome = Body::Value(result);
                    break;
                } else if c == b'\r' {
                    outcome = match it.next() {
                        Some(b'\n') => Body::Value(result),
                        _ => Body::BadCr,
                    };
                    break;
                } else {
                    outcome = Body::BadChar;
                    break;
                }
            }
            outcome
        }
    };
    match parsed {
        Body::Value(v) => Ok(v),
        Body::TooLong => Err(fatal(buf, "integer is too long")),
        Body::BadCr => Err(fatal(buf, "invalid symbol inside stream - '\\r'")),
        Body::BadChar => Err(fatal(
            buf,
            "can't parse integer (character value out of range)",
        )),
    }
}

/// Read `:value\r\n`.
pub fn read_int(buf: &mut ReadBuffer) -> FrameResult<u64> {
    match buf.get() {
        None => Err(FrameError::Incomplete),
        Some(b':') => read_int_body(buf),
        Some(_) => Err(fatal(buf, "integer expected")),
    }
}

/// Read `+text\r\n` into `out`; returns the text length.
pub fn read_string(buf: &mut ReadBuffer, out: &mut Vec<u8>) -> FrameResult<usize> {
    match buf.get() {
        None => return Err(FrameError::Incomplete),
        Some(b'+') => {}
        Some(_) => return Err(fatal(buf, "string expected")),
    }
    let copied = match buf.read_line(STRING_LENGTH_MAX) {
        LineRead::Partial => return Err(FrameError::Incomplete),
        LineRead::Overrun => None,
        LineRead::Complete(line) => {
            let mut text = line;
            if let [head @ .., b'\n'] = text {
                text = head;
            }
            if let [head @ .., b'\r'] = text {
                text = head;
            }
            out.clear();
            out.extend_from_slice(text);
            Some(out.len())
        }
    };
    match copied {
        Some(n) => Ok(n),
        None => Err(fatal(buf, "string is too long")),
    }
}

/// Read `$len\r\n<bytes>\r\n` into `out`; returns the payload length.
pub fn read_bulkstr(buf: &mut ReadBuffer, out: &mut Vec<u8>) -> FrameResult<usize> {
    match buf.get() {
        None => return Err(FrameError::Incomplete),
        Some(b'$') => {}
        Some(_) => return Err(fatal(buf, "bulk string expected")),
    }
    let declared = read_int_body(buf)? as usize;
    if declared > BULK_LENGTH_MAX {
        return Err(fatal(buf, "declared object size is too large"));
    }
    let payload = match buf.read_bytes(declared) {
        Some(bytes) => bytes.to_vec(),
        None => return Err(FrameError::Incomplete),
    };
    match buf.get() {
        None => return Err(FrameError::Incomplete),
        Some(b'\n') => {}
        Some(b'\r') => match buf.get() {
            None => return Err(FrameError::Incomplete),
            Some(b'\n') => {}
            Some(_) => return Err(fatal(buf, "bad end of stream")),
        },
        Some(_) => return Err(fatal(buf, "bad end of stream")),
    }
    *out = payload;
    Ok(out.len())
}

/// Read `*n\r\n`, returning the element count.
pub fn read_array_size(buf: &mut ReadBuffer) -> FrameResult<u64> {
    match buf.get() {
        None => Err(FrameError::Incomplete),
        Some(b'*') => read_int_body(buf),
        Some(_) => Err(fatal(buf, "array expected")),
    }
}
