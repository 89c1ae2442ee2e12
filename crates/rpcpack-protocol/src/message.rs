//! Message envelopes and deferred payload access.
//!
//! A decoded message keeps its argument, result and error-data payloads as
//! [`Payload::Deferred`] slices of the input buffer. Once the caller knows the
//! target type it resolves them with [`Request::argument`],
//! [`ResultMessage::result`] or [`ErrorMessage::data`], then calls
//! [`Message::deserialization_complete`] so the buffer can be reused.

use std::any::{Any, type_name};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::PROTOCOL_VERSION;
use crate::codec::{DecodingScope, FormatContext, Shared};
use crate::error::ResolveError;
use crate::id::CorrelationId;
use crate::resolver::TypeKey;
use crate::text;
use crate::wire::Reader;

/// A type-erased value travelling as an argument, result or error data.
///
/// The encoder looks up a formatter for [`AnyValue::type_key`].
#[derive(Clone)]
pub struct AnyValue {
    value: Arc<dyn Any + Send + Sync>,
    key: TypeKey,
}

impl AnyValue {
    /// Wraps a value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            key: TypeKey::of::<T>(),
        }
    }

    /// Identity of the wrapped value's type.
    pub fn type_key(&self) -> TypeKey {
        self.key
    }

    /// Borrows the wrapped value if it is a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    pub(crate) fn as_any(&self) -> &dyn Any {
        &*self.value
    }
}

impl fmt::Debug for AnyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AnyValue<{}>", self.key.name())
    }
}

/// An argument, result or error-data value.
#[derive(Debug, Clone)]
pub enum Payload {
    /// In-memory value, encoded through the resolver chain.
    Value(AnyValue),
    /// Still-encoded bytes captured from an input buffer.
    Deferred(Bytes),
}

impl Payload {
    /// Wraps a value.
    pub fn value<T: Any + Send + Sync>(value: T) -> Self {
        Self::Value(AnyValue::new(value))
    }

    /// Returns the in-memory value, if any.
    pub fn as_value(&self) -> Option<&AnyValue> {
        match self {
            Self::Value(v) => Some(v),
            Self::Deferred(_) => None,
        }
    }

    /// Returns the captured bytes, if any. Empty after completion.
    pub fn deferred_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Value(_) => None,
            Self::Deferred(b) => Some(b),
        }
    }

    fn release(&mut self) {
        if let Self::Deferred(bytes) = self {
            *bytes = Bytes::new();
        }
    }
}

/// How a request passes its arguments.
#[derive(Debug, Clone, Default)]
pub enum Arguments {
    /// No `params`.
    #[default]
    None,
    /// `params` as an array.
    Positional(Vec<Payload>),
    /// `params` as a map.
    Named(BTreeMap<String, Payload>),
}

impl Arguments {
    /// Builds positional arguments.
    pub fn positional(values: impl IntoIterator<Item = AnyValue>) -> Self {
        Self::Positional(values.into_iter().map(Payload::Value).collect())
    }

    /// Builds named arguments.
    pub fn named<K: Into<String>>(values: impl IntoIterator<Item = (K, AnyValue)>) -> Self {
        Self::Named(
            values
                .into_iter()
                .map(|(k, v)| (k.into(), Payload::Value(v)))
                .collect(),
        )
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Positional(v) => v.len(),
            Self::Named(m) => m.len(),
        }
    }

    /// Returns true if there are no arguments.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up an argument. Names only match named arguments and positions
    /// only match positional ones.
    pub fn get(&self, key: ArgumentKey<'_>) -> Option<&Payload> {
        match (self, key) {
            (Self::Positional(v), ArgumentKey::Position(i)) => v.get(i),
            (Self::Named(m), ArgumentKey::Name(name)) => m.get(name),
            _ => None,
        }
    }

    /// Looks up by name for named arguments, by position otherwise.
    pub fn get_by_name_or_position(&self, name: &str, position: usize) -> Option<&Payload> {
        match self {
            Self::Named(m) => m.get(name),
            Self::Positional(v) => v.get(position),
            Self::None => None,
        }
    }

    fn release(&mut self) {
        match self {
            Self::None => {}
            Self::Positional(v) => v.iter_mut().for_each(Payload::release),
            Self::Named(m) => m.values_mut().for_each(Payload::release),
        }
    }
}

/// Selects an argument by position or by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentKey<'a> {
    /// Zero-based position.
    Position(usize),
    /// Parameter name.
    Name(&'a str),
}

impl From<usize> for ArgumentKey<'_> {
    fn from(position: usize) -> Self {
        Self::Position(position)
    }
}

impl<'a> From<&'a str> for ArgumentKey<'a> {
    fn from(name: &'a str) -> Self {
        Self::Name(name)
    }
}

/// Buffer and formatter a decoded message resolves its payloads against.
#[derive(Clone)]
pub(crate) struct Origin {
    pub(crate) buffer: Bytes,
    pub(crate) shared: Arc<Shared>,
}

impl fmt::Debug for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Origin")
            .field("buffer_len", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

fn resolve_payload<T: Any>(
    payload: &Payload,
    origin: Option<&Origin>,
    id: Option<&CorrelationId>,
) -> Result<T, ResolveError> {
    let bytes = match payload {
        Payload::Value(_) => return Err(ResolveError::Materialized),
        Payload::Deferred(bytes) => bytes,
    };
    let origin = origin.ok_or(ResolveError::Completed)?;
    let _scope = DecodingScope::enter(&origin.shared, id.cloned())?;
    let cx = FormatContext::new(&origin.shared);
    cx.decode_value::<T>(bytes).map_err(|err| {
        debug!(target_type = type_name::<T>(), error = %err, "deferred decode mismatch");
        ResolveError::mismatch(type_name::<T>(), err)
    })
}

/// A decoded or outgoing protocol message.
#[derive(Debug, Clone)]
pub enum Message {
    /// A request or notification.
    Request(Request),
    /// A successful response.
    Result(ResultMessage),
    /// An error response.
    Error(ErrorMessage),
}

impl Message {
    /// Protocol version tag.
    pub fn version(&self) -> &str {
        match self {
            Self::Request(m) => &m.version,
            Self::Result(m) => &m.version,
            Self::Error(m) => &m.version,
        }
    }

    /// Correlation id, absent for notifications and id-less errors.
    pub fn id(&self) -> Option<&CorrelationId> {
        match self {
            Self::Request(m) => m.id.as_ref(),
            Self::Result(m) => Some(&m.id),
            Self::Error(m) => m.id.as_ref(),
        }
    }

    /// Checks if this message uses the supported protocol version.
    pub fn is_compatible(&self) -> bool {
        self.version() == PROTOCOL_VERSION
    }

    /// The buffer this message was decoded from, until completion.
    pub fn original_buffer(&self) -> Option<&Bytes> {
        let origin = match self {
            Self::Request(m) => m.origin.as_ref(),
            Self::Result(m) => m.origin.as_ref(),
            Self::Error(m) => m.origin.as_ref(),
        };
        origin.map(|o| &o.buffer)
    }

    /// Releases the input buffer and every captured slice.
    ///
    /// Must be called once all deferred payloads are resolved or the message
    /// is abandoned; the transport may reuse the buffer right after.
    pub fn deserialization_complete(&mut self) {
        match self {
            Self::Request(m) => m.deserialization_complete(),
            Self::Result(m) => m.deserialization_complete(),
            Self::Error(m) => m.deserialization_complete(),
        }
    }

    /// Returns the request, if this is one.
    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Self::Request(m) => Some(m),
            _ => None,
        }
    }

    /// Returns the result, if this is one.
    pub fn as_result(&self) -> Option<&ResultMessage> {
        match self {
            Self::Result(m) => Some(m),
            _ => None,
        }
    }

    /// Returns the error, if this is one.
    pub fn as_error(&self) -> Option<&ErrorMessage> {
        match self {
            Self::Error(m) => Some(m),
            _ => None,
        }
    }
}

impl From<Request> for Message {
    fn from(m: Request) -> Self {
        Self::Request(m)
    }
}

impl From<ResultMessage> for Message {
    fn from(m: ResultMessage) -> Self {
        Self::Result(m)
    }
}

impl From<ErrorMessage> for Message {
    fn from(m: ErrorMessage) -> Self {
        Self::Error(m)
    }
}

/// A method invocation. Without an id it is a notification.
#[derive(Debug, Clone)]
pub struct Request {
    /// Protocol version tag.
    pub version: String,
    /// Correlation id; `None` for notifications.
    pub id: Option<CorrelationId>,
    /// Method name.
    pub method: String,
    /// Arguments.
    pub arguments: Arguments,
    pub(crate) origin: Option<Origin>,
}

impl Request {
    /// Creates a request expecting a response.
    pub fn new(
        id: impl Into<CorrelationId>,
        method: impl Into<String>,
        arguments: Arguments,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            id: Some(id.into()),
            method: method.into(),
            arguments,
            origin: None,
        }
    }

    /// Creates a notification.
    pub fn notification(method: impl Into<String>, arguments: Arguments) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            id: None,
            method: method.into(),
            arguments,
            origin: None,
        }
    }

    /// Returns true if no response is expected.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Decodes an argument as `T`.
    pub fn argument<'k, T: Any>(&self, key: impl Into<ArgumentKey<'k>>) -> Result<T, ResolveError> {
        let payload = self.arguments.get(key.into()).ok_or(ResolveError::NotFound)?;
        resolve_payload(payload, self.origin.as_ref(), self.id.as_ref())
    }

    /// Decodes an argument found by name (named form) or position (positional
    /// form).
    pub fn argument_by_name_or_position<T: Any>(
        &self,
        name: &str,
        position: usize,
    ) -> Result<T, ResolveError> {
        let payload = self
            .arguments
            .get_by_name_or_position(name, position)
            .ok_or(ResolveError::NotFound)?;
        resolve_payload(payload, self.origin.as_ref(), self.id.as_ref())
    }

    /// Number of arguments.
    pub fn argument_count(&self) -> usize {
        self.arguments.len()
    }

    /// Releases the input buffer and captured arguments.
    pub fn deserialization_complete(&mut self) {
        self.arguments.release();
        self.origin = None;
    }
}

/// A successful response.
#[derive(Debug, Clone)]
pub struct ResultMessage {
    /// Protocol version tag.
    pub version: String,
    /// Id of the request this answers.
    pub id: CorrelationId,
    /// Return value.
    pub result: Payload,
    pub(crate) origin: Option<Origin>,
}

impl ResultMessage {
    /// Creates a result response.
    pub fn new<T: Any + Send + Sync>(id: impl Into<CorrelationId>, result: T) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            id: id.into(),
            result: Payload::value(result),
            origin: None,
        }
    }

    /// Decodes the return value as `T`.
    pub fn result<T: Any>(&self) -> Result<T, ResolveError> {
        resolve_payload(&self.result, self.origin.as_ref(), Some(&self.id))
    }

    /// Releases the input buffer and the captured result.
    pub fn deserialization_complete(&mut self) {
        self.result.release();
        self.origin = None;
    }
}

/// An error response.
#[derive(Debug, Clone)]
pub struct ErrorMessage {
    /// Protocol version tag.
    pub version: String,
    /// Id of the failed request, if it could be determined.
    pub id: Option<CorrelationId>,
    /// Error details.
    pub error: ErrorDetail,
    pub(crate) origin: Option<Origin>,
}

impl ErrorMessage {
    /// Creates an error response.
    pub fn new(id: impl Into<CorrelationId>, error: ErrorDetail) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            id: Some(id.into()),
            error,
            origin: None,
        }
    }

    /// Decodes the error data as `T`, falling back to a primitive object.
    ///
    /// Returns `None` when there is no data or neither decode succeeds.
    pub fn data<T: Any>(&self) -> Option<ErrorData<T>> {
        let payload = self.error.data.as_ref()?;
        match resolve_payload::<T>(payload, self.origin.as_ref(), self.id.as_ref()) {
            Ok(value) => Some(ErrorData::Typed(value)),
            Err(err) if err.is_mismatch() => {
                let bytes = payload.deferred_bytes()?;
                match text::to_json(&mut Reader::new(bytes)) {
                    Ok(value) => Some(ErrorData::Primitive(value)),
                    Err(fallback) => {
                        debug!(error = %fallback, "error data is not a primitive object either");
                        None
                    }
                }
            }
            Err(err) => {
                debug!(error = %err, "error data unavailable");
                None
            }
        }
    }

    /// Releases the input buffer and the captured error data.
    pub fn deserialization_complete(&mut self) {
        if let Some(data) = self.error.data.as_mut() {
            data.release();
        }
        self.origin = None;
    }
}

/// Error data decoded either as the requested type or as a fallback
/// primitive object.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorData<T> {
    /// Decoded as the requested type.
    Typed(T),
    /// Decoded permissively into arrays, maps and scalars.
    Primitive(serde_json::Value),
}

impl<T> ErrorData<T> {
    /// Returns the typed value, if the primary decode succeeded.
    pub fn typed(self) -> Option<T> {
        match self {
            Self::Typed(v) => Some(v),
            Self::Primitive(_) => None,
        }
    }
}

/// The `error` member of an error response.
#[derive(Debug, Clone)]
pub struct ErrorDetail {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured data.
    pub data: Option<Payload>,
}

impl ErrorDetail {
    /// Creates error details without data.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Builder: attach structured data.
    pub fn with_data<T: Any + Send + Sync>(mut self, data: T) -> Self {
        self.data = Some(Payload::value(data));
        self
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code.description(), self.code.code(), self.message)
    }
}

/// Error codes carried by error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum ErrorCode {
    /// Invalid data was received (-32700).
    ParseError,
    /// The message is not a valid request (-32600).
    InvalidRequest,
    /// The method does not exist (-32601).
    MethodNotFound,
    /// Invalid method parameters (-32602).
    InvalidParams,
    /// Internal error (-32603).
    InternalError,
    /// The invoked method threw (-32000).
    InvocationError,
    /// A marshaled object referenced by the request was not found (-32001).
    NoMarshaledObjectFound,
    /// The result could not be serialized (-32003).
    ResponseSerializationFailure,
    /// The request was canceled (-32800).
    RequestCanceled,
    /// Other codes in the reserved server range -32099..=-32000.
    ServerError(i64),
    /// Application-defined code.
    Application(i64),
}

impl ErrorCode {
    /// Maps a wire code to a variant.
    pub fn from_code(code: i64) -> Self {
        match code {
            -32700 => Self::ParseError,
            -32600 => Self::InvalidRequest,
            -32601 => Self::MethodNotFound,
            -32602 => Self::InvalidParams,
            -32603 => Self::InternalError,
            -32000 => Self::InvocationError,
            -32001 => Self::NoMarshaledObjectFound,
            -32003 => Self::ResponseSerializationFailure,
            -32800 => Self::RequestCanceled,
            -32099..=-32000 => Self::ServerError(code),
            _ => Self::Application(code),
        }
    }

    /// The wire code.
    pub fn code(&self) -> i64 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::InvocationError => -32000,
            Self::NoMarshaledObjectFound => -32001,
            Self::ResponseSerializationFailure => -32003,
            Self::RequestCanceled => -32800,
            Self::ServerError(code) | Self::Application(code) => *code,
        }
    }

    /// Returns a human-readable description of the error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::ParseError => "Parse error",
            Self::InvalidRequest => "Invalid request",
            Self::MethodNotFound => "Method not found",
            Self::InvalidParams => "Invalid params",
            Self::InternalError => "Internal error",
            Self::InvocationError => "Invocation error",
            Self::NoMarshaledObjectFound => "No marshaled object found",
            Self::ResponseSerializationFailure => "Response serialization failure",
            Self::RequestCanceled => "Request canceled",
            Self::ServerError(_) => "Server error",
            Self::Application(_) => "Application error",
        }
    }
}

impl From<i64> for ErrorCode {
    fn from(code: i64) -> Self {
        Self::from_code(code)
    }
}

impl From<ErrorCode> for i64 {
    fn from(code: ErrorCode) -> Self {
        code.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_constructors() {
        let request = Request::new(1, "add", Arguments::positional([AnyValue::new(2i64)]));
        assert_eq!(request.version, "2.0");
        assert_eq!(request.id, Some(CorrelationId::Number(1)));
        assert!(!request.is_notification());
        assert_eq!(request.argument_count(), 1);

        let note = Request::notification("ping", Arguments::None);
        assert!(note.is_notification());
        assert_eq!(note.argument_count(), 0);
    }

    #[test]
    fn in_memory_argument_is_materialized() {
        let request = Request::new(1, "add", Arguments::positional([AnyValue::new(2i64)]));
        assert!(matches!(
            request.argument::<i64>(0),
            Err(ResolveError::Materialized)
        ));
        assert!(matches!(
            request.argument::<i64>(1),
            Err(ResolveError::NotFound)
        ));
    }

    #[test]
    fn keys_match_their_own_form() {
        let positional = Arguments::positional([AnyValue::new(1i64)]);
        assert!(positional.get(ArgumentKey::Position(0)).is_some());
        assert!(positional.get(ArgumentKey::Name("a")).is_none());
        assert!(positional.get_by_name_or_position("a", 0).is_some());

        let named = Arguments::named([("a", AnyValue::new(1i64))]);
        assert!(named.get(ArgumentKey::Name("a")).is_some());
        assert!(named.get(ArgumentKey::Position(0)).is_none());
        assert!(named.get_by_name_or_position("a", 5).is_some());
    }

    #[test]
    fn any_value_downcast() {
        let value = AnyValue::new(String::from("hi"));
        assert_eq!(value.downcast_ref::<String>().map(String::as_str), Some("hi"));
        assert!(value.downcast_ref::<i64>().is_none());
        assert!(format!("{:?}", value).contains("String"));
    }

    #[test]
    fn error_code_mapping() {
        assert_eq!(ErrorCode::from_code(-32601), ErrorCode::MethodNotFound);
        assert_eq!(ErrorCode::MethodNotFound.code(), -32601);
        assert_eq!(ErrorCode::from_code(-32050), ErrorCode::ServerError(-32050));
        assert_eq!(ErrorCode::from_code(42), ErrorCode::Application(42));
        assert_eq!(ErrorCode::Application(42).code(), 42);
        for code in [-32700, -32600, -32602, -32603, -32000, -32001, -32003, -32800] {
            assert_eq!(ErrorCode::from_code(code).code(), code);
        }
    }

    #[test]
    fn error_code_serde_as_integer() {
        let json = serde_json::to_string(&ErrorCode::InvalidParams).unwrap();
        assert_eq!(json, "-32602");
        let parsed: ErrorCode = serde_json::from_str("-32603").unwrap();
        assert_eq!(parsed, ErrorCode::InternalError);
    }

    #[test]
    fn error_detail_display() {
        let detail = ErrorDetail::new(ErrorCode::MethodNotFound, "no such method");
        let display = detail.to_string();
        assert!(display.contains("Method not found"));
        assert!(display.contains("-32601"));
        assert!(display.contains("no such method"));
    }

    #[test]
    fn completion_on_in_memory_message_keeps_values() {
        let mut message = Message::from(ResultMessage::new(7, 3i64));
        message.deserialization_complete();
        let result = message.as_result().unwrap();
        assert!(result.result.as_value().is_some());
        assert!(message.original_buffer().is_none());
    }
}
