//! Request correlation identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolResult;
use crate::wire::{self, Reader};

/// Identifier joining a request to its response.
///
/// Either an integer or a string, never both. A request without an id is a
/// notification; that absence is expressed as `Option<CorrelationId>` on the
/// envelope rather than as a variant here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorrelationId {
    /// Integer id.
    Number(i64),
    /// String id.
    String(String),
}

impl CorrelationId {
    /// Returns the integer value if this is a numeric id.
    pub fn as_number(&self) -> Option<i64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::String(_) => None,
        }
    }

    /// Returns the string value if this is a string id.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Number(_) => None,
            Self::String(s) => Some(s),
        }
    }

    /// Decodes an id: integers become [`CorrelationId::Number`], anything else
    /// must be a string.
    pub fn read(reader: &mut Reader<'_>) -> ProtocolResult<Self> {
        if wire::is_integer(reader.peek_marker()?) {
            Ok(Self::Number(reader.read_i64()?))
        } else {
            Ok(Self::String(reader.read_str()?.to_string()))
        }
    }

    /// Encodes the id as an integer or a string.
    pub fn write(&self, out: &mut Vec<u8>) -> ProtocolResult<()> {
        match self {
            Self::Number(n) => wire::write_i64(out, *n),
            Self::String(s) => wire::write_str(out, s),
        }
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::String(s) => write!(f, "\"{}\"", s),
        }
    }
}

impl From<i64> for CorrelationId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<i32> for CorrelationId {
    fn from(value: i32) -> Self {
        Self::Number(i64::from(value))
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}
