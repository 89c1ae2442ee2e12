//! MessagePack JSON-RPC message codec for rpcpack.
//!
//! Messages are JSON-RPC 2.0 envelopes encoded as MessagePack maps. The codec
//! decodes the envelope eagerly but leaves argument, result and error-data
//! payloads encoded until the caller knows their target types.
//!
//! # Wire Shape
//!
//! - Request: `{jsonrpc, id?, method, params}` where `params` is an array, a
//!   map or nil. No `id` means a notification.
//! - Result: `{jsonrpc, id, result}`.
//! - Error: `{jsonrpc, id, error: {code, message, data?}}`.
//!
//! # Deferred Decoding
//!
//! [`MessagePackFormatter::decode`] keeps zero-copy slices of the input
//! buffer. Resolve them with [`Request::argument`], [`ResultMessage::result`]
//! or [`ErrorMessage::data`], then release the buffer with
//! [`Message::deserialization_complete`].
//!
//! # Marshaled Objects
//!
//! [`Progress`] callbacks and channel endpoints travel as integer tokens
//! scoped to the request that carried them. Tokens are retired when the
//! response for that request is sent or observed.
//!
//! # Example
//!
//! ```rust
//! use rpcpack_protocol::{AnyValue, Arguments, MessagePackFormatter, Request};
//!
//! let formatter = MessagePackFormatter::new();
//! let request = Request::new(1, "add", Arguments::positional([AnyValue::new(2i64), AnyValue::new(3i64)]));
//! let bytes = formatter.encode(&request.into()).unwrap();
//!
//! let mut message = formatter.decode(bytes).unwrap();
//! let request = message.as_request().unwrap();
//! assert_eq!(request.argument::<i64>(0).unwrap(), 2);
//! assert_eq!(request.argument::<i64>(1).unwrap(), 3);
//! message.deserialization_complete();
//! ```

mod channel;
mod codec;
mod error;
mod id;
mod message;
mod options;
mod progress;
mod resolver;
pub mod text;
pub mod wire;


pub use channel::{
    ByteStream, ChannelFactory, ChannelId, ChannelIo, ChannelKind, ChannelReader, ChannelTracker,
    ChannelWriter, DuplexChannel,
};
pub use codec::{FormatContext, FormatterBuilder, MessagePackFormatter};
pub use error::{ProtocolError, ProtocolResult, ResolveError};
pub use id::CorrelationId;
pub use message::{
    AnyValue, ArgumentKey, Arguments, ErrorCode, ErrorData, ErrorDetail, ErrorMessage, Message,
    Payload, Request, ResultMessage,
};
pub use options::FormatterOptions;
pub use progress::{NotificationSink, Progress, ProgressTracker};
pub use resolver::{
    Formatter, FormatterResolver, RawMessage, ResolverChain, SerdeFormatter, SerdeResolver,
    TypeKey, ValueFormatter, typed,
};

/// Protocol version tag carried by every envelope.
pub const PROTOCOL_VERSION: &str = "2.0";

/// Reserved method of progress notifications.
pub const PROGRESS_METHOD: &str = "$/progress";

/// Default maximum message size (16 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
