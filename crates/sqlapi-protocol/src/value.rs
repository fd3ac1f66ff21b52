//! Dynamically typed cell values and their tagged binary encoding.
//!
//! # Wire encoding
//! One tag byte, then a fixed- or length-prefixed payload:
//!
//! | Tag | Kind   | Payload                                  |
//! |-----|--------|------------------------------------------|
//! | 0   | Null   | none                                     |
//! | 1   | Bool   | 1 byte, 0 or 1                           |
//! | 2   | Int    | 4-byte LE i32 (see narrowing note)       |
//! | 3   | UInt   | 4-byte LE u32 (see narrowing note)       |
//! | 4   | Double | 8-byte LE f64                            |
//! | 5   | Text   | u32 LE byte length + UTF-8               |
//! | 6   | Blob   | u32 LE length + raw bytes                |
//! | 7   | Date   | u32 LE length + ISO-8601 `YYYY-MM-DD`    |
//!
//! # Narrowing
//! `Int` and `UInt` carry 64-bit values in memory but only 32 bits on the
//! wire: encoding truncates with `as i32` / `as u32`, silently.  This is a
//! frozen legacy coercion — peers on old databases depend on it.  Decoding
//! widens back to 64 bits.

use bytes::{Buf, BufMut};
use chrono::NaiveDate;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_UINT: u8 = 3;
const TAG_DOUBLE: u8 = 4;
const TAG_TEXT: u8 = 5;
const TAG_BLOB: u8 = 6;
const TAG_DATE: u8 = 7;

/// Errors produced while decoding wire data.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated frame: needed {needed} more byte(s)")]
    Truncated { needed: usize },
    #[error("unknown value tag {0}")]
    BadTag(u8),
    #[error("unknown request kind {0}")]
    BadRequestKind(i32),
    #[error("unknown response kind {0}")]
    BadResponseKind(i32),
    #[error("unknown error code {0}")]
    BadErrorCode(i32),
    #[error("invalid UTF-8 in text field")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("invalid date literal: {0}")]
    BadDate(String),
}

/// A dynamically typed cell, the unit of every body and item key.
///
/// Equality is type-sensitive: `Int(1)` and `Text("1")` are distinct keys.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    Text(String),
    Blob(Vec<u8>),
    Date(NaiveDate),
}

impl Value {
    /// Append the tagged encoding of `self` to `buf`.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            Value::Null => buf.put_u8(TAG_NULL),
            Value::Bool(b) => {
                buf.put_u8(TAG_BOOL);
                buf.put_u8(u8::from(*b));
            }
            Value::Int(v) => {
                buf.put_u8(TAG_INT);
                // Legacy narrowing: 64-bit values are truncated on the wire.
                buf.put_i32_le(*v as i32);
            }
            Value::UInt(v) => {
                buf.put_u8(TAG_UINT);
                buf.put_u32_le(*v as u32);
            }
            Value::Double(v) => {
                buf.put_u8(TAG_DOUBLE);
                buf.put_f64_le(*v);
            }
            Value::Text(s) => {
                buf.put_u8(TAG_TEXT);
                put_bytes(buf, s.as_bytes());
            }
            Value::Blob(b) => {
                buf.put_u8(TAG_BLOB);
                put_bytes(buf, b);
            }
            Value::Date(d) => {
                buf.put_u8(TAG_DATE);
                put_bytes(buf, d.to_string().as_bytes());
            }
        }
    }

    /// Decode one tagged value from the front of `buf`.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Value, DecodeError> {
        let tag = take_u8(buf)?;
        match tag {
            TAG_NULL => Ok(Value::Null),
            TAG_BOOL => Ok(Value::Bool(take_u8(buf)? != 0)),
            TAG_INT => Ok(Value::Int(i64::from(take_i32(buf)?))),
            TAG_UINT => {
                need(buf, 4)?;
                Ok(Value::UInt(u64::from(buf.get_u32_le())))
            }
            TAG_DOUBLE => {
                need(buf, 8)?;
                Ok(Value::Double(buf.get_f64_le()))
            }
            TAG_TEXT => Ok(Value::Text(String::from_utf8(take_bytes(buf)?)?)),
            TAG_BLOB => Ok(Value::Blob(take_bytes(buf)?)),
            TAG_DATE => {
                let text = String::from_utf8(take_bytes(buf)?)?;
                let date = text
                    .parse::<NaiveDate>()
                    .map_err(|_| DecodeError::BadDate(text))?;
                Ok(Value::Date(date))
            }
            other => Err(DecodeError::BadTag(other)),
        }
    }

    /// The value rendered as SQL-embeddable text (before quoting).
    ///
    /// Numbers render in decimal, booleans as 1/0 so INTEGER affinity
    /// applies, dates as ISO-8601.  `Null` renders empty, matching what the
    /// query synthesis historically produced for unset keys.
    pub fn sql_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => if *b { "1" } else { "0" }.to_owned(),
            Value::Int(v) => v.to_string(),
            Value::UInt(v) => v.to_string(),
            Value::Double(v) => v.to_string(),
            Value::Text(s) => s.clone(),
            Value::Blob(b) => String::from_utf8_lossy(b).into_owned(),
            Value::Date(d) => d.to_string(),
        }
    }

    /// True for the `Null` placeholder used when a request targets no row.
    pub fn is_empty_key(&self) -> bool {
        matches!(self, Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Buf helpers (all reads are bounds-checked; Buf panics on underflow)
// ---------------------------------------------------------------------------

fn need<B: Buf>(buf: &B, n: usize) -> Result<(), DecodeError> {
    if buf.remaining() < n {
        return Err(DecodeError::Truncated {
            needed: n - buf.remaining(),
        });
    }
    Ok(())
}

fn take_u8<B: Buf>(buf: &mut B) -> Result<u8, DecodeError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

pub(crate) fn take_i32<B: Buf>(buf: &mut B) -> Result<i32, DecodeError> {
    need(buf, 4)?;
    Ok(buf.get_i32_le())
}

fn put_bytes<B: BufMut>(buf: &mut B, data: &[u8]) {
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

fn take_bytes<B: Buf>(buf: &mut B) -> Result<Vec<u8>, DecodeError> {
    need(buf, 4)?;
    let len = buf.get_u32_le() as usize;
    need(buf, len)?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

pub(crate) fn put_text<B: BufMut>(buf: &mut B, s: &str) {
    put_bytes(buf, s.as_bytes());
}

pub(crate) fn take_text<B: Buf>(buf: &mut B) -> Result<String, DecodeError> {
    Ok(String::from_utf8(take_bytes(buf)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn round_trip(v: &Value) -> Value {
        let mut buf = BytesMut::new();
        v.encode(&mut buf);
        let mut bytes = buf.freeze();
        let decoded = Value::decode(&mut bytes).expect("decode");
        assert_eq!(bytes.remaining(), 0, "no trailing bytes");
        decoded
    }

    #[test]
    fn int_narrows_to_32_bits_on_the_wire() {
        let mut buf = BytesMut::new();
        Value::Int(0x1_0000_0001).encode(&mut buf);
        assert_eq!(buf.len(), 5);
        let mut bytes = buf.freeze();
        // The high 32 bits are clipped silently.
        assert_eq!(Value::decode(&mut bytes).unwrap(), Value::Int(1));
    }

    #[test]
    fn uint_narrows_like_int() {
        let mut buf = BytesMut::new();
        Value::UInt(u64::from(u32::MAX) + 7).encode(&mut buf);
        let mut bytes = buf.freeze();
        assert_eq!(Value::decode(&mut bytes).unwrap(), Value::UInt(6));
    }

    #[test]
    fn in_range_values_survive_the_round_trip() {
        for v in [
            Value::Null,
            Value::Bool(true),
            Value::Int(-42),
            Value::UInt(42),
            Value::Double(2.5),
            Value::Text("row-1".to_owned()),
            Value::Blob(vec![0, 1, 0xFF]),
            Value::Date(NaiveDate::from_ymd_opt(2011, 3, 14).unwrap()),
        ] {
            assert_eq!(round_trip(&v), v);
        }
    }

    #[test]
    fn date_encodes_as_iso_8601_text() {
        let mut buf = BytesMut::new();
        Value::Date(NaiveDate::from_ymd_opt(2011, 3, 4).unwrap()).encode(&mut buf);
        assert_eq!(&buf[..], b"\x07\x0a\x00\x00\x002011-03-04");
    }

    #[test]
    fn equality_is_type_sensitive() {
        assert_ne!(Value::Int(1), Value::Text("1".to_owned()));
        assert_ne!(Value::Int(1), Value::UInt(1));
        assert_eq!(Value::Text("k".to_owned()), Value::Text("k".to_owned()));
    }

    #[test]
    fn truncated_input_is_an_error_not_a_panic() {
        // Text tag claiming 10 bytes with only 2 present.
        let mut bytes = bytes::Bytes::from_static(b"\x05\x0a\x00\x00\x00ab");
        assert!(matches!(
            Value::decode(&mut bytes),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut bytes = bytes::Bytes::from_static(&[0x63]);
        assert!(matches!(Value::decode(&mut bytes), Err(DecodeError::BadTag(0x63))));
    }
}
