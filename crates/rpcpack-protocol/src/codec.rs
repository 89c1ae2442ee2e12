//! The MessagePack envelope codec.
//!
//! Decoding reads the envelope eagerly and captures argument, result and
//! error-data payloads as slices of the input buffer; see
//! [`crate::message`] for how those are resolved later.
//!
//! A formatter instance encodes one message at a time and runs one deferred
//! decode at a time. Callers needing parallelism use separate instances.

use std::any::{Any, type_name};
use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use rmp::Marker;
use tracing::{debug, trace, warn};

use crate::PROGRESS_METHOD;
use crate::channel::{ChannelFactory, ChannelKind, ChannelTracker, DuplexChannel};
use crate::error::{ProtocolError, ProtocolResult, ResolveError};
use crate::id::CorrelationId;
use crate::message::{
    AnyValue, Arguments, ErrorCode, ErrorDetail, ErrorMessage, Message, Origin, Payload, Request,
    ResultMessage,
};
use crate::options::FormatterOptions;
use crate::progress::{NotificationSink, ProgressResolver, ProgressTracker};
use crate::resolver::{FormatterResolver, ResolverChain, SerdeResolver, TypeKey};
use crate::text;
use crate::wire::{self, Reader};

enum DecodeSlot {
    Idle,
    Busy(Option<CorrelationId>),
}

/// State shared by a formatter and every message it decoded.
pub(crate) struct Shared {
    chain: ResolverChain,
    progress: ProgressTracker,
    channels: ChannelTracker,
    sink: Option<Arc<dyn NotificationSink>>,
    options: FormatterOptions,
    serializing: Mutex<Option<CorrelationId>>,
    deserializing: Mutex<DecodeSlot>,
    progress_failures: AtomicU64,
}

/// View of a formatter handed to value formatters.
#[derive(Clone, Copy)]
pub struct FormatContext<'a> {
    shared: &'a Shared,
    diagnostic: bool,
}

impl<'a> FormatContext<'a> {
    pub(crate) fn new(shared: &'a Shared) -> Self {
        Self {
            shared,
            diagnostic: false,
        }
    }

    /// A context whose encodes must not register progress or channel
    /// tokens.
    pub(crate) fn diagnostic(shared: &'a Shared) -> Self {
        Self {
            shared,
            diagnostic: true,
        }
    }

    /// Returns true when encoding only for display.
    pub fn is_diagnostic(&self) -> bool {
        self.diagnostic
    }

    /// Id of the request currently being encoded.
    pub fn serializing_request_id(&self) -> Option<CorrelationId> {
        self.shared.serializing.lock().clone()
    }

    /// Id of the message whose payload is currently being resolved.
    pub fn deserializing_message_id(&self) -> Option<CorrelationId> {
        match &*self.shared.deserializing.lock() {
            DecodeSlot::Busy(id) => id.clone(),
            DecodeSlot::Idle => None,
        }
    }

    /// Encodes a nested value through the resolver chain.
    pub fn encode_value(&self, value: &AnyValue, out: &mut Vec<u8>) -> ProtocolResult<()> {
        let key = value.type_key();
        let formatter = self
            .shared
            .chain
            .formatter(key)
            .ok_or(ProtocolError::UnsupportedType(key.name()))?;
        formatter.encode(value.as_any(), out, self)
    }

    /// Decodes exactly one value as `T` through the resolver chain.
    pub fn decode_value<T: Any>(&self, bytes: &Bytes) -> ProtocolResult<T> {
        let formatter = self
            .shared
            .chain
            .formatter(TypeKey::of::<T>())
            .ok_or(ProtocolError::UnsupportedType(type_name::<T>()))?;
        let decoded = formatter.decode(bytes, self)?;
        match decoded.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(_) => Err(ProtocolError::decode(format!(
                "formatter for {} produced another type",
                type_name::<T>()
            ))),
        }
    }

    pub(crate) fn progress(&self) -> &'a ProgressTracker {
        &self.shared.progress
    }

    pub(crate) fn channels(&self) -> &'a ChannelTracker {
        &self.shared.channels
    }

    pub(crate) fn sink(&self) -> Option<Arc<dyn NotificationSink>> {
        self.shared.sink.clone()
    }
}

/// Marks the formatter as resolving a payload of one message.
pub(crate) struct DecodingScope<'a> {
    shared: &'a Shared,
}

impl<'a> DecodingScope<'a> {
    pub(crate) fn enter(shared: &'a Shared, id: Option<CorrelationId>) -> Result<Self, ResolveError> {
        let mut slot = shared.deserializing.lock();
        if let DecodeSlot::Busy(current) = &*slot {
            let current = current
                .as_ref()
                .map_or_else(|| "(notification)".to_string(), ToString::to_string);
            return Err(ResolveError::Busy(current));
        }
        *slot = DecodeSlot::Busy(id);
        Ok(Self { shared })
    }
}

impl Drop for DecodingScope<'_> {
    fn drop(&mut self) {
        *self.shared.deserializing.lock() = DecodeSlot::Idle;
    }
}

/// Sets the request id being encoded; restores the previous one on drop.
struct SerializingScope<'a> {
    shared: &'a Shared,
    previous: Option<CorrelationId>,
}

impl<'a> SerializingScope<'a> {
    fn enter(shared: &'a Shared, id: Option<CorrelationId>) -> Self {
        let previous = mem::replace(&mut *shared.serializing.lock(), id);
        Self { shared, previous }
    }
}

impl Drop for SerializingScope<'_> {
    fn drop(&mut self) {
        *self.shared.serializing.lock() = self.previous.take();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Request,
    Result,
    Error,
}

/// Encodes and decodes JSON-RPC messages as MessagePack.
#[derive(Clone)]
pub struct MessagePackFormatter {
    shared: Arc<Shared>,
}

impl Default for MessagePackFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MessagePackFormatter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePackFormatter")
            .field("options", &self.shared.options)
            .field("channels", &self.shared.channels.is_available())
            .field("sink", &self.shared.sink.is_some())
            .finish_non_exhaustive()
    }
}

impl MessagePackFormatter {
    /// Creates a formatter with the default serde resolver and no
    /// collaborators.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts configuring a formatter.
    pub fn builder() -> FormatterBuilder {
        FormatterBuilder::default()
    }

    /// Encodes a message and notifies the trackers when it is a response.
    pub fn encode(&self, message: &Message) -> ProtocolResult<Vec<u8>> {
        let out = self.encode_envelope(message)?;
        match message {
            Message::Request(_) => {}
            Message::Result(m) => self.shared.channels.on_response_sent(&m.id, true),
            Message::Error(m) => {
                if let Some(id) = &m.id {
                    self.shared.channels.on_response_sent(id, false);
                }
            }
        }
        Ok(out)
    }

    /// Encodes a message without touching tracker state beyond token
    /// assignment.
    pub fn encode_envelope(&self, message: &Message) -> ProtocolResult<Vec<u8>> {
        self.encode_with(message, &FormatContext::new(&self.shared))
    }

    fn encode_with(&self, message: &Message, cx: &FormatContext<'_>) -> ProtocolResult<Vec<u8>> {
        let mut out = Vec::new();
        match message {
            Message::Request(request) => {
                let _scope = SerializingScope::enter(&self.shared, request.id.clone());
                encode_request(request, &mut out, cx)?;
            }
            Message::Result(result) => {
                let _scope = SerializingScope::enter(&self.shared, None);
                encode_result(result, &mut out, cx)?;
            }
            Message::Error(error) => {
                let _scope = SerializingScope::enter(&self.shared, None);
                encode_error(error, &mut out, cx)?;
            }
        }
        trace!(bytes = out.len(), "encoded message");
        Ok(out)
    }

    /// Decodes one message, capturing its payloads for later resolution.
    ///
    /// The returned message shares `buffer` until
    /// [`Message::deserialization_complete`] is called.
    pub fn decode(&self, buffer: impl Into<Bytes>) -> ProtocolResult<Message> {
        let buffer = buffer.into();
        let max = self.shared.options.max_message_size;
        if buffer.len() > max {
            return Err(ProtocolError::MessageTooLarge {
                size: buffer.len(),
                max,
            });
        }

        let kind = peek_kind(Reader::new(&buffer))?;
        trace!(?kind, bytes = buffer.len(), "decoding message");
        let message = match kind {
            Kind::Request => {
                let request = self.decode_request(buffer)?;
                if request.method == PROGRESS_METHOD {
                    self.handle_progress(&request);
                }
                Message::Request(request)
            }
            Kind::Result => Message::Result(self.decode_result(buffer)?),
            Kind::Error => Message::Error(self.decode_error(buffer)?),
        };
        Ok(message)
    }

    /// Renders a message for diagnostics.
    ///
    /// Uses the retained input buffer when there is one, otherwise encodes
    /// the message. Progress and channel arguments render as tokens only if
    /// they are already registered, and nil otherwise; nothing new is
    /// registered.
    pub fn text_representation(&self, message: &Message) -> ProtocolResult<String> {
        match message.original_buffer() {
            Some(buffer) => text::render(buffer),
            None => {
                let cx = FormatContext::diagnostic(&self.shared);
                text::render(&self.encode_with(message, &cx)?)
            }
        }
    }

    /// Opens an out-of-band channel to pass as an argument.
    pub fn open_channel(&self, kind: ChannelKind) -> ProtocolResult<DuplexChannel> {
        self.shared.channels.open(kind)
    }

    /// Context for driving value formatters directly.
    pub fn context(&self) -> FormatContext<'_> {
        FormatContext::new(&self.shared)
    }

    /// Configured options.
    pub fn options(&self) -> &FormatterOptions {
        &self.shared.options
    }

    /// Progress token table.
    pub fn progress_tracker(&self) -> &ProgressTracker {
        &self.shared.progress
    }

    /// Channel token table.
    pub fn channel_tracker(&self) -> &ChannelTracker {
        &self.shared.channels
    }

    fn origin(&self, buffer: Bytes) -> Option<Origin> {
        Some(Origin {
            buffer,
            shared: Arc::clone(&self.shared),
        })
    }

    fn decode_request(&self, buffer: Bytes) -> ProtocolResult<Request> {
        let mut reader = Reader::new(&buffer);
        let mut version = None;
        let mut id = None;
        let mut method = None;
        let mut arguments = Arguments::None;

        for _ in 0..reader.read_map_len()? {
            match reader.read_str()? {
                "jsonrpc" => version = Some(reader.read_str()?.to_string()),
                "id" => id = read_optional_id(&mut reader)?,
                "method" => method = Some(reader.read_str()?.to_string()),
                "params" => arguments = read_arguments(&mut reader, &buffer)?,
                _ => reader.skip()?,
            }
        }

        Ok(Request {
            version: version.ok_or(ProtocolError::MissingField("jsonrpc"))?,
            id,
            method: method.ok_or(ProtocolError::MissingField("method"))?,
            arguments,
            origin: self.origin(buffer),
        })
    }

    fn decode_result(&self, buffer: Bytes) -> ProtocolResult<ResultMessage> {
        let mut reader = Reader::new(&buffer);
        let mut version = None;
        let mut id = None;
        let mut result = None;

        for _ in 0..reader.read_map_len()? {
            match reader.read_str()? {
                "jsonrpc" => version = Some(reader.read_str()?.to_string()),
                "id" => id = Some(CorrelationId::read(&mut reader)?),
                "result" => result = Some(Payload::Deferred(buffer.slice(reader.capture()?))),
                _ => reader.skip()?,
            }
        }

        let id = id.ok_or(ProtocolError::MissingField("id"))?;
        let message = ResultMessage {
            version: version.ok_or(ProtocolError::MissingField("jsonrpc"))?,
            result: result.ok_or(ProtocolError::MissingField("result"))?,
            origin: self.origin(buffer),
            id,
        };
        self.shared.progress.on_response_observed(&message.id);
        self.shared.channels.on_response_observed(&message.id, true);
        Ok(message)
    }

    fn decode_error(&self, buffer: Bytes) -> ProtocolResult<ErrorMessage> {
        let mut reader = Reader::new(&buffer);
        let mut version = None;
        let mut id = None;
        let mut error = None;

        for _ in 0..reader.read_map_len()? {
            match reader.read_str()? {
                "jsonrpc" => version = Some(reader.read_str()?.to_string()),
                "id" => id = read_optional_id(&mut reader)?,
                "error" => error = Some(read_error_detail(&mut reader, &buffer)?),
                _ => reader.skip()?,
            }
        }

        let message = ErrorMessage {
            version: version.ok_or(ProtocolError::MissingField("jsonrpc"))?,
            id,
            error: error.ok_or(ProtocolError::MissingField("error"))?,
            origin: self.origin(buffer),
        };
        if let Some(id) = &message.id {
            self.shared.progress.on_response_observed(id);
            self.shared.channels.on_response_observed(id, false);
        }
        Ok(message)
    }

    fn handle_progress(&self, request: &Request) {
        let Err(err) = self.deliver_progress(request) else {
            return;
        };
        let failures = self.shared.progress_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures <= self.shared.options.progress_failure_warn_limit {
            warn!(error = %err, failures, "dropped progress notification");
        } else {
            debug!(error = %err, failures, "dropped progress notification");
        }
    }

    fn deliver_progress(&self, request: &Request) -> ProtocolResult<()> {
        let token = request
            .arguments
            .get_by_name_or_position("token", 0)
            .and_then(Payload::deferred_bytes)
            .ok_or(ProtocolError::MissingField("token"))?;
        let value = request
            .arguments
            .get_by_name_or_position("value", 1)
            .and_then(Payload::deferred_bytes)
            .ok_or(ProtocolError::MissingField("value"))?;

        let _scope = DecodingScope::enter(&self.shared, None).map_err(ProtocolError::decode)?;
        let cx = FormatContext::new(&self.shared);
        self.shared.progress.on_notification_received(token, value, &cx)
    }
}

/// Scans top-level keys without consuming the caller's reader.
fn peek_kind(mut reader: Reader<'_>) -> ProtocolResult<Kind> {
    for _ in 0..reader.read_map_len()? {
        match reader.read_str()? {
            "method" => return Ok(Kind::Request),
            "result" => return Ok(Kind::Result),
            "error" => return Ok(Kind::Error),
            _ => reader.skip()?,
        }
    }
    Err(ProtocolError::UnrecognizedMessage)
}

fn read_optional_id(reader: &mut Reader<'_>) -> ProtocolResult<Option<CorrelationId>> {
    if reader.try_read_nil()? {
        Ok(None)
    } else {
        CorrelationId::read(reader).map(Some)
    }
}

fn read_arguments(reader: &mut Reader<'_>, buffer: &Bytes) -> ProtocolResult<Arguments> {
    match reader.peek_marker()? {
        Marker::Null => {
            reader.read_marker()?;
            Ok(Arguments::None)
        }
        Marker::FixArray(_) | Marker::Array16 | Marker::Array32 => {
            let len = reader.read_array_len()?;
            let mut values = Vec::with_capacity(len.min(64) as usize);
            for _ in 0..len {
                values.push(Payload::Deferred(buffer.slice(reader.capture()?)));
            }
            Ok(Arguments::Positional(values))
        }
        Marker::FixMap(_) | Marker::Map16 | Marker::Map32 => {
            let mut values = BTreeMap::new();
            for _ in 0..reader.read_map_len()? {
                let name = reader.read_str()?.to_string();
                values.insert(name, Payload::Deferred(buffer.slice(reader.capture()?)));
            }
            Ok(Arguments::Named(values))
        }
        marker => Err(ProtocolError::InvalidArguments {
            found: wire::describe(marker).to_string(),
        }),
    }
}

fn read_error_detail(reader: &mut Reader<'_>, buffer: &Bytes) -> ProtocolResult<ErrorDetail> {
    let mut code = None;
    let mut message = String::new();
    let mut data = None;

    for _ in 0..reader.read_map_len()? {
        match reader.read_str()? {
            "code" => code = Some(ErrorCode::from_code(reader.read_i64()?)),
            "message" => message = reader.read_str()?.to_string(),
            "data" => {
                data = if reader.try_read_nil()? {
                    None
                } else {
                    Some(Payload::Deferred(buffer.slice(reader.capture()?)))
                }
            }
            _ => reader.skip()?,
        }
    }

    Ok(ErrorDetail {
        code: code.ok_or(ProtocolError::MissingField("code"))?,
        message,
        data,
    })
}

fn encode_payload(payload: &Payload, out: &mut Vec<u8>, cx: &FormatContext<'_>) -> ProtocolResult<()> {
    match payload {
        Payload::Value(value) => cx.encode_value(value, out),
        Payload::Deferred(bytes) if bytes.is_empty() => Err(ProtocolError::encode(
            "captured payload was released by deserialization_complete",
        )),
        Payload::Deferred(bytes) => {
            out.extend_from_slice(bytes);
            Ok(())
        }
    }
}

fn write_header(
    out: &mut Vec<u8>,
    fields: usize,
    version: &str,
    id: Option<&CorrelationId>,
) -> ProtocolResult<()> {
    wire::write_map_len(out, fields + 1 + usize::from(id.is_some()))?;
    wire::write_str(out, "jsonrpc")?;
    wire::write_str(out, version)?;
    if let Some(id) = id {
        wire::write_str(out, "id")?;
        id.write(out)?;
    }
    Ok(())
}

fn encode_request(request: &Request, out: &mut Vec<u8>, cx: &FormatContext<'_>) -> ProtocolResult<()> {
    write_header(out, 2, &request.version, request.id.as_ref())?;
    wire::write_str(out, "method")?;
    wire::write_str(out, &request.method)?;
    wire::write_str(out, "params")?;
    match &request.arguments {
        Arguments::None => wire::write_nil(out)?,
        Arguments::Positional(values) => {
            wire::write_array_len(out, values.len())?;
            for value in values {
                encode_payload(value, out, cx)?;
            }
        }
        Arguments::Named(values) => {
            wire::write_map_len(out, values.len())?;
            for (name, value) in values {
                wire::write_str(out, name)?;
                encode_payload(value, out, cx)?;
            }
        }
    }
    Ok(())
}

fn encode_result(result: &ResultMessage, out: &mut Vec<u8>, cx: &FormatContext<'_>) -> ProtocolResult<()> {
    write_header(out, 1, &result.version, Some(&result.id))?;
    wire::write_str(out, "result")?;
    encode_payload(&result.result, out, cx)
}

fn encode_error(error: &ErrorMessage, out: &mut Vec<u8>, cx: &FormatContext<'_>) -> ProtocolResult<()> {
    write_header(out, 1, &error.version, error.id.as_ref())?;
    wire::write_str(out, "error")?;
    let detail = &error.error;
    wire::write_map_len(out, 2 + usize::from(detail.data.is_some()))?;
    wire::write_str(out, "code")?;
    wire::write_i64(out, detail.code.code())?;
    wire::write_str(out, "message")?;
    wire::write_str(out, &detail.message)?;
    if let Some(data) = &detail.data {
        wire::write_str(out, "data")?;
        encode_payload(data, out, cx)?;
    }
    Ok(())
}

/// Configures a [`MessagePackFormatter`].
pub struct FormatterBuilder {
    resolver: Arc<dyn FormatterResolver>,
    progress: ProgressResolver,
    options: FormatterOptions,
    sink: Option<Arc<dyn NotificationSink>>,
    factory: Option<Arc<dyn ChannelFactory>>,
}

impl Default for FormatterBuilder {
    fn default() -> Self {
        Self {
            resolver: Arc::new(SerdeResolver::default()),
            progress: ProgressResolver::default(),
            options: FormatterOptions::default(),
            sink: None,
            factory: None,
        }
    }
}

impl FormatterBuilder {
    /// Builder: set the resolver for user data types.
    pub fn resolver(mut self, resolver: impl FormatterResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Builder: set options.
    pub fn options(mut self, options: FormatterOptions) -> Self {
        self.options = options;
        self
    }

    /// Builder: allow `Progress<V>` arguments.
    pub fn progress<V: Any + Send + Sync>(mut self) -> Self {
        self.progress.accept::<V>();
        self
    }

    /// Builder: set where progress proxies send their notifications.
    pub fn notification_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Builder: set the out-of-band channel facility.
    pub fn channel_factory(mut self, factory: Arc<dyn ChannelFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Builds the formatter.
    pub fn build(self) -> MessagePackFormatter {
        debug!(
            max_message_size = self.options.max_message_size,
            channels = self.factory.is_some(),
            "created formatter"
        );
        MessagePackFormatter {
            shared: Arc::new(Shared {
                chain: ResolverChain::new(self.resolver, self.progress),
                progress: ProgressTracker::default(),
                channels: ChannelTracker::new(self.factory),
                sink: self.sink,
                options: self.options,
                serializing: Mutex::new(None),
                deserializing: Mutex::new(DecodeSlot::Idle),
                progress_failures: AtomicU64::new(0),
            }),
        }
    }
}
