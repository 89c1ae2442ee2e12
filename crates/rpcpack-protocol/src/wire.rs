//! MessagePack cursor and writer helpers.
//!
//! [`Reader`] walks an encoded buffer without copying. It is `Copy`, so a
//! read-ahead is just a second cursor over the same bytes. [`Reader::capture`]
//! skips exactly one value and hands back its byte range, which is how
//! argument, result and error-data payloads stay encoded until their target
//! type is known.
//!
//! ```text
//! buffer:  84 a7 jsonrpc a3 2.0 a2 id 01 a6 method a3 add a6 params 92 02 03
//!                                                                   ^^^^^^^^
//!                                                capture() -> 3 bytes, no copy
//! ```

use std::ops::Range;

use rmp::Marker;
use rmp::decode::{self, Bytes, NumValueReadError, ValueReadError, bytes::BytesReadError};

use crate::error::{ProtocolError, ProtocolResult};

/// Zero-copy cursor over MessagePack bytes.
#[derive(Debug, Clone, Copy)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Creates a reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current offset into the underlying buffer.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Returns true once every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize) -> ProtocolResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::truncated(len, self.remaining()));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Runs an `rmp` decoder over the unread bytes and advances past what it
    /// consumed.
    fn decode_with<T>(
        &mut self,
        read: impl FnOnce(&mut Bytes<'a>) -> ProtocolResult<T>,
    ) -> ProtocolResult<T> {
        let mut bytes = Bytes::new(&self.data[self.pos..]);
        let value = read(&mut bytes)?;
        self.pos = self.data.len() - bytes.remaining_slice().len();
        Ok(value)
    }

    /// Looks at the next marker without consuming it.
    pub fn peek_marker(&self) -> ProtocolResult<Marker> {
        match self.data.get(self.pos) {
            Some(&byte) => Ok(Marker::from_u8(byte)),
            None => Err(ProtocolError::truncated(1, 0)),
        }
    }

    /// Consumes and returns the next marker.
    pub fn read_marker(&mut self) -> ProtocolResult<Marker> {
        self.decode_with(|rd| {
            decode::read_marker(rd).map_err(|err| value_error(err.into(), "marker"))
        })
    }

    /// Consumes a nil if one is next. Returns whether it did.
    pub fn try_read_nil(&mut self) -> ProtocolResult<bool> {
        if matches!(self.peek_marker()?, Marker::Null) {
            self.pos += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Reads a map header and returns the number of entries.
    pub fn read_map_len(&mut self) -> ProtocolResult<u32> {
        self.decode_with(|rd| decode::read_map_len(rd).map_err(|err| value_error(err, "map")))
    }

    /// Reads an array header and returns the number of elements.
    pub fn read_array_len(&mut self) -> ProtocolResult<u32> {
        self.decode_with(|rd| decode::read_array_len(rd).map_err(|err| value_error(err, "array")))
    }

    /// Reads a string, borrowing it from the buffer.
    pub fn read_str(&mut self) -> ProtocolResult<&'a str> {
        let len = self.read_str_len()?;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes).map_err(ProtocolError::decode)
    }

    fn read_str_len(&mut self) -> ProtocolResult<usize> {
        self.decode_with(|rd| decode::read_str_len(rd).map_err(|err| value_error(err, "string")))
            .map(|len| len as usize)
    }

    /// Reads any integer that fits in an `i64`.
    pub fn read_i64(&mut self) -> ProtocolResult<i64> {
        self.decode_with(|rd| decode::read_int::<i64, _>(rd).map_err(|err| int_error(err, "i64")))
    }

    /// Reads a non-negative integer.
    pub fn read_u64_value(&mut self) -> ProtocolResult<u64> {
        self.decode_with(|rd| decode::read_int::<u64, _>(rd).map_err(|err| int_error(err, "u64")))
    }

    /// Reads a binary blob, borrowing it from the buffer.
    pub fn read_bin(&mut self) -> ProtocolResult<&'a [u8]> {
        let len = self.read_bin_len()?;
        self.take(len)
    }

    fn read_bin_len(&mut self) -> ProtocolResult<usize> {
        self.decode_with(|rd| decode::read_bin_len(rd).map_err(|err| value_error(err, "binary")))
            .map(|len| len as usize)
    }

    /// Reads an extension value as `(type tag, payload)`.
    pub fn read_ext(&mut self) -> ProtocolResult<(i8, &'a [u8])> {
        let (tag, len) = self.read_ext_header()?;
        Ok((tag, self.take(len)?))
    }

    fn read_ext_header(&mut self) -> ProtocolResult<(i8, usize)> {
        let meta = self.decode_with(|rd| {
            decode::read_ext_meta(rd).map_err(|err| value_error(err, "extension"))
        })?;
        Ok((meta.typeid, meta.size as usize))
    }

    /// Reads a float (either width).
    pub fn read_f64(&mut self) -> ProtocolResult<f64> {
        if matches!(self.peek_marker()?, Marker::F32) {
            self.decode_with(|rd| {
                decode::read_f32(rd)
                    .map(f64::from)
                    .map_err(|err| value_error(err, "float"))
            })
        } else {
            self.decode_with(|rd| decode::read_f64(rd).map_err(|err| value_error(err, "float")))
        }
    }

    /// Skips exactly one well-formed value, including everything nested in it.
    pub fn skip(&mut self) -> ProtocolResult<()> {
        // Containers add their children to the count instead of recursing, so
        // deeply nested input cannot exhaust the stack.
        let mut pending: u64 = 1;
        while pending > 0 {
            pending -= 1;
            let payload = match self.peek_marker()? {
                Marker::FixStr(_) | Marker::Str8 | Marker::Str16 | Marker::Str32 => {
                    self.read_str_len()?
                }
                Marker::Bin8 | Marker::Bin16 | Marker::Bin32 => self.read_bin_len()?,
                Marker::FixExt1
                | Marker::FixExt2
                | Marker::FixExt4
                | Marker::FixExt8
                | Marker::FixExt16
                | Marker::Ext8
                | Marker::Ext16
                | Marker::Ext32 => self.read_ext_header()?.1,
                Marker::FixArray(_) | Marker::Array16 | Marker::Array32 => {
                    pending += u64::from(self.read_array_len()?);
                    0
                }
                Marker::FixMap(_) | Marker::Map16 | Marker::Map32 => {
                    pending += 2 * u64::from(self.read_map_len()?);
                    0
                }
                Marker::Reserved => {
                    return Err(ProtocolError::decode("reserved marker 0xc1"));
                }
                scalar => {
                    self.pos += 1;
                    scalar_width(scalar)
                }
            };
            self.take(payload)?;
        }
        Ok(())
    }

    /// Skips one value and returns the range of bytes it occupied.
    ///
    /// The range indexes the buffer this reader was created over; slicing a
    /// shared buffer with it does not copy.
    pub fn capture(&mut self) -> ProtocolResult<Range<usize>> {
        let start = self.pos;
        self.skip()?;
        Ok(start..self.pos)
    }
}

/// Data bytes following a fixed-width scalar marker.
fn scalar_width(marker: Marker) -> usize {
    match marker {
        Marker::U8 | Marker::I8 => 1,
        Marker::U16 | Marker::I16 => 2,
        Marker::U32 | Marker::I32 | Marker::F32 => 4,
        Marker::U64 | Marker::I64 | Marker::F64 => 8,
        _ => 0,
    }
}

fn read_failure(err: BytesReadError) -> ProtocolError {
    match err {
        BytesReadError::InsufficientBytes {
            expected, actual, ..
        } => ProtocolError::truncated(expected, actual),
        other => ProtocolError::decode(other),
    }
}

fn value_error(err: ValueReadError<BytesReadError>, expected: &str) -> ProtocolError {
    match err {
        ValueReadError::InvalidMarkerRead(err) | ValueReadError::InvalidDataRead(err) => {
            read_failure(err)
        }
        ValueReadError::TypeMismatch(marker) => ProtocolError::decode(format!(
            "expected {}, found {}",
            expected,
            describe(marker)
        )),
    }
}

fn int_error(err: NumValueReadError<BytesReadError>, target: &str) -> ProtocolError {
    match err {
        NumValueReadError::InvalidMarkerRead(err) | NumValueReadError::InvalidDataRead(err) => {
            read_failure(err)
        }
        NumValueReadError::TypeMismatch(marker) => ProtocolError::decode(format!(
            "expected integer, found {}",
            describe(marker)
        )),
        NumValueReadError::OutOfRange => {
            ProtocolError::decode(format!("integer out of range for {}", target))
        }
    }
}

/// Human-readable name of the value kind a marker introduces.
pub fn describe(marker: Marker) -> &'static str {
    match marker {
        Marker::Null => "nil",
        Marker::True | Marker::False => "boolean",
        Marker::FixPos(_)
        | Marker::FixNeg(_)
        | Marker::U8
        | Marker::U16
        | Marker::U32
        | Marker::U64
        | Marker::I8
        | Marker::I16
        | Marker::I32
        | Marker::I64 => "integer",
        Marker::F32 | Marker::F64 => "float",
        Marker::FixStr(_) | Marker::Str8 | Marker::Str16 | Marker::Str32 => "string",
        Marker::Bin8 | Marker::Bin16 | Marker::Bin32 => "binary",
        Marker::FixArray(_) | Marker::Array16 | Marker::Array32 => "array",
        Marker::FixMap(_) | Marker::Map16 | Marker::Map32 => "map",
        Marker::FixExt1
        | Marker::FixExt2
        | Marker::FixExt4
        | Marker::FixExt8
        | Marker::FixExt16
        | Marker::Ext8
        | Marker::Ext16
        | Marker::Ext32 => "extension",
        Marker::Reserved => "reserved",
    }
}

/// Returns true when the marker starts an integer.
pub fn is_integer(marker: Marker) -> bool {
    matches!(
        marker,
        Marker::FixPos(_)
            | Marker::FixNeg(_)
            | Marker::U8
            | Marker::U16
            | Marker::U32
            | Marker::U64
            | Marker::I8
            | Marker::I16
            | Marker::I32
            | Marker::I64
    )
}

pub(crate) fn write_str(out: &mut Vec<u8>, value: &str) -> ProtocolResult<()> {
    rmp::encode::write_str(out, value).map_err(ProtocolError::encode)
}

pub(crate) fn write_i64(out: &mut Vec<u8>, value: i64) -> ProtocolResult<()> {
    rmp::encode::write_sint(out, value)
        .map(|_| ())
        .map_err(ProtocolError::encode)
}

pub(crate) fn write_u64(out: &mut Vec<u8>, value: u64) -> ProtocolResult<()> {
    rmp::encode::write_uint(out, value)
        .map(|_| ())
        .map_err(ProtocolError::encode)
}

pub(crate) fn write_nil(out: &mut Vec<u8>) -> ProtocolResult<()> {
    rmp::encode::write_nil(out).map_err(ProtocolError::encode)
}

pub(crate) fn write_map_len(out: &mut Vec<u8>, len: usize) -> ProtocolResult<()> {
    let len = u32::try_from(len).map_err(ProtocolError::encode)?;
    rmp::encode::write_map_len(out, len)
        .map(|_| ())
        .map_err(ProtocolError::encode)
}

pub(crate) fn write_array_len(out: &mut Vec<u8>, len: usize) -> ProtocolResult<()> {
    let len = u32::try_from(len).map_err(ProtocolError::encode)?;
    rmp::encode::write_array_len(out, len)
        .map(|_| ())
        .map_err(ProtocolError::encode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use std::collections::BTreeMap;

    fn encode<T: Serialize>(value: &T) -> Vec<u8> {
        rmp_serde::to_vec_named(value).unwrap()
    }

    #[test]
    fn capture_scalar_followed_by_more() {
        let mut bytes = encode(&300u32);
        bytes.extend(encode(&"tail"));

        let mut reader = Reader::new(&bytes);
        let range = reader.capture().unwrap();
        assert_eq!(range, 0..3);
        assert_eq!(reader.read_str().unwrap(), "tail");
        assert!(reader.is_empty());
    }

    #[test]
    fn capture_nested_structure() {
        let mut inner = BTreeMap::new();
        inner.insert("list", vec![vec![1, 2], vec![3]]);
        let value = (inner, "x", Some(4.5f64), Option::<u8>::None);
        let bytes = encode(&value);

        let mut reader = Reader::new(&bytes);
        let range = reader.capture().unwrap();
        assert_eq!(range, 0..bytes.len());
        assert!(reader.is_empty());
    }

    #[test]
    fn capture_binary_and_extension() {
        let mut bytes = Vec::new();
        rmp::encode::write_bin(&mut bytes, &[1, 2, 3]).unwrap();
        rmp::encode::write_ext_meta(&mut bytes, 4, 7).unwrap();
        bytes.extend_from_slice(&[9, 9, 9, 9]);
        write_nil(&mut bytes).unwrap();

        let mut reader = Reader::new(&bytes);
        assert_eq!(reader.capture().unwrap(), 0..5);
        let ext = reader.capture().unwrap();
        assert_eq!(ext.len(), 6);
        assert!(reader.try_read_nil().unwrap());
        assert!(reader.is_empty());
    }

    #[test]
    fn capture_truncated_fails() {
        let bytes = encode(&vec!["alpha", "beta"]);
        let cut = &bytes[..bytes.len() - 2];
        let mut reader = Reader::new(cut);
        assert!(matches!(reader.capture(), Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn capture_rejects_huge_declared_length() {
        // Array32 claiming four billion elements with no data behind it.
        let bytes = [0xdd, 0xff, 0xff, 0xff, 0xff];
        let mut reader = Reader::new(&bytes);
        assert!(reader.capture().is_err());
    }

    #[test]
    fn read_ahead_does_not_advance_original() {
        let bytes = encode(&("a", "b"));
        let mut reader = Reader::new(&bytes);
        reader.read_array_len().unwrap();

        let mut ahead = reader;
        assert_eq!(ahead.read_str().unwrap(), "a");
        assert_eq!(reader.read_str().unwrap(), "a");
        assert_eq!(reader.position(), ahead.position());
    }

    #[test]
    fn integers_of_every_width() {
        for value in [0i64, 1, -1, -33, 127, 128, 255, 256, -129, 70_000, -70_000, i64::MIN, i64::MAX] {
            let mut bytes = Vec::new();
            write_i64(&mut bytes, value).unwrap();
            let mut reader = Reader::new(&bytes);
            assert_eq!(reader.read_i64().unwrap(), value);
        }
    }

    #[test]
    fn unsigned_above_i64_max() {
        let mut bytes = Vec::new();
        write_u64(&mut bytes, u64::MAX).unwrap();
        assert_eq!(Reader::new(&bytes).read_u64_value().unwrap(), u64::MAX);
        assert!(Reader::new(&bytes).read_i64().is_err());
    }

    #[test]
    fn negative_is_not_unsigned() {
        let mut bytes = Vec::new();
        write_i64(&mut bytes, -5).unwrap();
        assert!(Reader::new(&bytes).read_u64_value().is_err());
    }

    #[test]
    fn map_and_array_headers() {
        let mut bytes = Vec::new();
        write_map_len(&mut bytes, 20).unwrap();
        write_array_len(&mut bytes, 3).unwrap();

        let mut reader = Reader::new(&bytes);
        assert_eq!(reader.read_map_len().unwrap(), 20);
        assert_eq!(reader.read_array_len().unwrap(), 3);
    }

    #[test]
    fn truncated_header_reports_counts() {
        // Map16 with only one of its two length bytes.
        let bytes = [0xde, 0x00];
        let err = Reader::new(&bytes).read_map_len().unwrap_err();
        assert!(err.to_string().contains("needed 2 bytes, 1 remaining"));
    }

    #[test]
    fn mismatch_leaves_reader_in_place() {
        let bytes = encode(&"text");
        let mut reader = Reader::new(&bytes);
        assert!(reader.read_array_len().is_err());
        assert_eq!(reader.position(), 0);
        assert_eq!(reader.read_str().unwrap(), "text");
    }

    #[test]
    fn wrong_kind_reports_found_type() {
        let bytes = encode(&"text");
        let err = Reader::new(&bytes).read_map_len().unwrap_err();
        assert!(err.to_string().contains("found string"));
    }
}
