//! Type-directed formatter resolution.
//!
//! The encoder and the deferred decoder both ask a [`ResolverChain`] for the
//! formatter of a type. The chain tries, in order:
//!
//! 1. built-in formatters for [`CorrelationId`] and [`RawMessage`];
//! 2. the caller-supplied [`FormatterResolver`] (usually a [`SerdeResolver`]);
//! 3. the progress fallback, for `Progress<V>` with a registered `V`;
//! 4. the channel fallback, for the channel endpoint types.
//!
//! Answers, including "no formatter", are memoized per type.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::channel::ChannelResolver;
use crate::codec::FormatContext;
use crate::error::{ProtocolError, ProtocolResult};
use crate::id::CorrelationId;
use crate::progress::ProgressResolver;
use crate::wire::Reader;

/// Stable identity of a Rust type, with its name for diagnostics.
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    /// Key for `T`.
    pub fn of<T: ?Sized + Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    /// The `TypeId`.
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// The type name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns true if this is the key of `T`.
    pub fn is<T: ?Sized + Any>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Encodes and decodes values of one type, type-erased.
pub trait ValueFormatter: Send + Sync {
    /// Appends the encoding of `value` to `out`.
    fn encode(&self, value: &dyn Any, out: &mut Vec<u8>, cx: &FormatContext<'_>)
    -> ProtocolResult<()>;

    /// Decodes exactly one encoded value.
    fn decode(&self, bytes: &Bytes, cx: &FormatContext<'_>) -> ProtocolResult<Box<dyn Any + Send>>;
}

/// Typed counterpart of [`ValueFormatter`]; wrap with [`typed`].
pub trait Formatter<T>: Send + Sync {
    /// Appends the encoding of `value` to `out`.
    fn serialize(&self, value: &T, out: &mut Vec<u8>, cx: &FormatContext<'_>) -> ProtocolResult<()>;

    /// Decodes exactly one encoded value.
    fn deserialize(&self, bytes: &Bytes, cx: &FormatContext<'_>) -> ProtocolResult<T>;
}

struct Typed<T, F> {
    inner: F,
    _type: PhantomData<fn() -> T>,
}

impl<T, F> ValueFormatter for Typed<T, F>
where
    T: Any + Send,
    F: Formatter<T>,
{
    fn encode(
        &self,
        value: &dyn Any,
        out: &mut Vec<u8>,
        cx: &FormatContext<'_>,
    ) -> ProtocolResult<()> {
        let value = value.downcast_ref::<T>().ok_or_else(|| {
            ProtocolError::encode(format!("value is not a {}", type_name::<T>()))
        })?;
        self.inner.serialize(value, out, cx)
    }

    fn decode(&self, bytes: &Bytes, cx: &FormatContext<'_>) -> ProtocolResult<Box<dyn Any + Send>> {
        Ok(Box::new(self.inner.deserialize(bytes, cx)?))
    }
}

/// Erases a typed formatter.
pub fn typed<T, F>(formatter: F) -> Arc<dyn ValueFormatter>
where
    T: Any + Send,
    F: Formatter<T> + 'static,
{
    Arc::new(Typed {
        inner: formatter,
        _type: PhantomData,
    })
}

/// Supplies formatters for types it knows about.
pub trait FormatterResolver: Send + Sync {
    /// Returns a formatter for `key`, or `None` to let the next resolver try.
    fn resolve(&self, key: TypeKey) -> Option<Arc<dyn ValueFormatter>>;
}

/// Already-encoded MessagePack bytes, passed through untouched.
///
/// Decoding a payload as `RawMessage` yields the captured slice itself; it
/// shares the input buffer, so holding on to it keeps that buffer alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage(Bytes);

impl RawMessage {
    /// Wraps bytes that must hold exactly one encoded value.
    pub fn new(bytes: impl Into<Bytes>) -> ProtocolResult<Self> {
        let bytes = bytes.into();
        let mut reader = Reader::new(&bytes);
        reader.skip()?;
        if !reader.is_empty() {
            return Err(ProtocolError::decode(format!(
                "raw message has {} trailing bytes",
                reader.remaining()
            )));
        }
        Ok(Self(bytes))
    }

    /// Encodes a serde value into a raw message.
    pub fn serialize<T: Serialize + ?Sized>(value: &T) -> ProtocolResult<Self> {
        Ok(Self(Bytes::from(rmp_serde::to_vec_named(value)?)))
    }

    /// Decodes the raw bytes with serde.
    pub fn deserialize<T: DeserializeOwned>(&self) -> ProtocolResult<T> {
        Ok(rmp_serde::from_slice(&self.0)?)
    }

    /// The encoded bytes.
    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }
}

struct RawMessageFormatter;

impl Formatter<RawMessage> for RawMessageFormatter {
    fn serialize(&self, value: &RawMessage, out: &mut Vec<u8>, _: &FormatContext<'_>) -> ProtocolResult<()> {
        out.extend_from_slice(&value.0);
        Ok(())
    }

    fn deserialize(&self, bytes: &Bytes, _: &FormatContext<'_>) -> ProtocolResult<RawMessage> {
        Ok(RawMessage(bytes.clone()))
    }
}

struct CorrelationIdFormatter;

impl Formatter<CorrelationId> for CorrelationIdFormatter {
    fn serialize(
        &self,
        value: &CorrelationId,
        out: &mut Vec<u8>,
        _: &FormatContext<'_>,
    ) -> ProtocolResult<()> {
        value.write(out)
    }

    fn deserialize(&self, bytes: &Bytes, _: &FormatContext<'_>) -> ProtocolResult<CorrelationId> {
        CorrelationId::read(&mut Reader::new(bytes))
    }
}

/// Formatter for any serde type, encoded with named struct fields.
pub struct SerdeFormatter<T>(PhantomData<fn() -> T>);

impl<T> Default for SerdeFormatter<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> Formatter<T> for SerdeFormatter<T>
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, value: &T, out: &mut Vec<u8>, _: &FormatContext<'_>) -> ProtocolResult<()> {
        rmp_serde::encode::write_named(out, value)?;
        Ok(())
    }

    fn deserialize(&self, bytes: &Bytes, _: &FormatContext<'_>) -> ProtocolResult<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Resolver for a registered set of serde types.
///
/// `SerdeResolver::default()` knows the primitive set: `bool`, `i32`, `i64`,
/// `u32`, `u64`, `f32`, `f64`, `String`, `()`, `Vec<u8>` and
/// `serde_json::Value`.
#[derive(Clone)]
pub struct SerdeResolver {
    formatters: HashMap<TypeId, Arc<dyn ValueFormatter>>,
}

impl SerdeResolver {
    /// Creates an empty resolver.
    pub fn empty() -> Self {
        Self {
            formatters: HashMap::new(),
        }
    }

    /// Builder: register `T`.
    pub fn with<T>(mut self) -> Self
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.register::<T>();
        self
    }

    /// Registers `T`.
    pub fn register<T>(&mut self)
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.formatters
            .insert(TypeId::of::<T>(), typed::<T, _>(SerdeFormatter::<T>::default()));
    }

    /// Registers a custom formatter for `T`.
    pub fn register_formatter<T, F>(&mut self, formatter: F)
    where
        T: Any + Send,
        F: Formatter<T> + 'static,
    {
        self.formatters.insert(TypeId::of::<T>(), typed::<T, _>(formatter));
    }

    /// Returns true if `T` is registered.
    pub fn contains<T: Any>(&self) -> bool {
        self.formatters.contains_key(&TypeId::of::<T>())
    }
}

impl Default for SerdeResolver {
    fn default() -> Self {
        Self::empty()
            .with::<bool>()
            .with::<i32>()
            .with::<i64>()
            .with::<u32>()
            .with::<u64>()
            .with::<f32>()
            .with::<f64>()
            .with::<String>()
            .with::<()>()
            .with::<Vec<u8>>()
            .with::<serde_json::Value>()
    }
}

impl FormatterResolver for SerdeResolver {
    fn resolve(&self, key: TypeKey) -> Option<Arc<dyn ValueFormatter>> {
        self.formatters.get(&key.id()).cloned()
    }
}

/// Ordered, memoizing composition of built-in and caller resolvers.
pub struct ResolverChain {
    user: Arc<dyn FormatterResolver>,
    progress: ProgressResolver,
    channels: ChannelResolver,
    cache: RwLock<HashMap<TypeId, Option<Arc<dyn ValueFormatter>>>>,
}

impl ResolverChain {
    pub(crate) fn new(user: Arc<dyn FormatterResolver>, progress: ProgressResolver) -> Self {
        Self {
            user,
            progress,
            channels: ChannelResolver::default(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the formatter for `key`, if any resolver claims it.
    pub fn formatter(&self, key: TypeKey) -> Option<Arc<dyn ValueFormatter>> {
        if let Some(hit) = self.cache.read().get(&key.id()) {
            return hit.clone();
        }

        let found = builtin(key)
            .or_else(|| self.user.resolve(key))
            .or_else(|| self.progress.resolve(key))
            .or_else(|| self.channels.resolve(key));
        trace!(type_name = key.name(), found = found.is_some(), "resolved formatter");

        self.cache
            .write()
            .entry(key.id())
            .or_insert(found)
            .clone()
    }
}

fn builtin(key: TypeKey) -> Option<Arc<dyn ValueFormatter>> {
    if key.is::<CorrelationId>() {
        Some(typed::<CorrelationId, _>(CorrelationIdFormatter))
    } else if key.is::<RawMessage>() {
        Some(typed::<RawMessage, _>(RawMessageFormatter))
    } else {
        None
    }
}
