//! Human-readable rendering of encoded messages.
//!
//! MessagePack values map onto JSON with two additions: binary becomes a hex
//! string and extensions become `{"$ext": tag, "data": hex}`. Map keys that
//! are not strings are rendered as their JSON text.

use rmp::Marker;
use serde_json::{Map, Number, Value};

use crate::error::{ProtocolError, ProtocolResult};
use crate::wire::Reader;

const MAX_DEPTH: usize = 128;

/// Renders one encoded value as compact JSON text.
pub fn render(bytes: &[u8]) -> ProtocolResult<String> {
    let value = to_json(&mut Reader::new(bytes))?;
    Ok(value.to_string())
}

/// Decodes the next value permissively into a JSON value.
pub fn to_json(reader: &mut Reader<'_>) -> ProtocolResult<Value> {
    value(reader, 0)
}

fn value(reader: &mut Reader<'_>, depth: usize) -> ProtocolResult<Value> {
    if depth > MAX_DEPTH {
        return Err(ProtocolError::decode(format!(
            "value nested deeper than {} levels",
            MAX_DEPTH
        )));
    }

    let marker = reader.peek_marker()?;
    Ok(match marker {
        Marker::Null => {
            reader.read_marker()?;
            Value::Null
        }
        Marker::True | Marker::False => {
            reader.read_marker()?;
            Value::Bool(matches!(marker, Marker::True))
        }
        Marker::U64 => Value::Number(Number::from(reader.read_u64_value()?)),
        Marker::FixPos(_)
        | Marker::FixNeg(_)
        | Marker::U8
        | Marker::U16
        | Marker::U32
        | Marker::I8
        | Marker::I16
        | Marker::I32
        | Marker::I64 => Value::Number(Number::from(reader.read_i64()?)),
        Marker::F32 | Marker::F64 => Number::from_f64(reader.read_f64()?)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Marker::FixStr(_) | Marker::Str8 | Marker::Str16 | Marker::Str32 => {
            Value::String(reader.read_str()?.to_string())
        }
        Marker::Bin8 | Marker::Bin16 | Marker::Bin32 => Value::String(hex::encode(reader.read_bin()?)),
        Marker::FixArray(_) | Marker::Array16 | Marker::Array32 => {
            let len = reader.read_array_len()?;
            let mut items = Vec::with_capacity(len.min(64) as usize);
            for _ in 0..len {
                items.push(value(reader, depth + 1)?);
            }
            Value::Array(items)
        }
        Marker::FixMap(_) | Marker::Map16 | Marker::Map32 => {
            let len = reader.read_map_len()?;
            let mut entries = Map::new();
            for _ in 0..len {
                let key = match value(reader, depth + 1)? {
                    Value::String(key) => key,
                    other => other.to_string(),
                };
                entries.insert(key, value(reader, depth + 1)?);
            }
            Value::Object(entries)
        }
        Marker::Reserved => {
            return Err(ProtocolError::decode("reserved marker 0xc1"));
        }
        _ => {
            let (tag, data) = reader.read_ext()?;
            let mut entries = Map::new();
            entries.insert("$ext".to_string(), Value::Number(Number::from(tag)));
            entries.insert("data".to_string(), Value::String(hex::encode(data)));
            Value::Object(entries)
        }
    })
}
