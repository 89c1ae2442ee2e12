//! Data channels marshaled as integer tokens.
//!
//! A channel is an out-of-band byte pipe provided by a [`ChannelFactory`]
//! (typically a multiplexing layer on the same connection). The requester
//! opens one with [`MessagePackFormatter::open_channel`], keeps the local
//! endpoint and passes an [`offered`](DuplexChannel::offered) reference as an
//! argument. Only the channel id travels; the receiving side attaches to the
//! same id through its own factory.
//!
//! Without a factory, channel arguments are written as nil and decode as
//! detached endpoints whose I/O fails. Ids the factory did not open through
//! this tracker are written as nil too.
//!
//! [`MessagePackFormatter::open_channel`]: crate::MessagePackFormatter::open_channel

use std::any::{Any, TypeId, type_name};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

use crate::codec::FormatContext;
use crate::error::{ProtocolError, ProtocolResult};
use crate::id::CorrelationId;
use crate::resolver::{Formatter, FormatterResolver, TypeKey, ValueFormatter, typed};
use crate::wire::{self, Reader};

/// Identifier of an out-of-band channel, used as its token on the wire.
pub type ChannelId = u64;

/// Direction of a channel endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Bidirectional.
    Duplex,
    /// The receiver reads.
    Read,
    /// The receiver writes.
    Write,
}

/// Byte I/O behind an attached endpoint.
pub trait ChannelIo: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T> ChannelIo for T where T: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

/// Out-of-band channel facility.
pub trait ChannelFactory: Send + Sync {
    /// Mints a new channel and returns its id with the local side.
    fn create(&self, kind: ChannelKind) -> ProtocolResult<(ChannelId, Box<dyn ChannelIo>)>;

    /// Opens the local side of a channel the peer offered.
    fn attach(&self, id: ChannelId, kind: ChannelKind) -> ProtocolResult<Box<dyn ChannelIo>>;

    /// Disposes a channel that will never be claimed.
    fn release(&self, id: ChannelId);
}

struct Slot {
    id: Option<ChannelId>,
    io: Option<Box<dyn ChannelIo>>,
}

impl Slot {
    fn io(&mut self) -> io::Result<Pin<&mut (dyn ChannelIo + 'static)>> {
        match self.io.as_mut() {
            Some(io) => Ok(Pin::new(io.as_mut())),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                match self.id {
                    Some(id) => format!("channel {} is not attached here", id),
                    None => "channel was not marshaled".to_string(),
                },
            )),
        }
    }

    fn poll_read(&mut self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.io() {
            Ok(io) => io.poll_read(cx, buf),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    fn poll_write(&mut self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.io() {
            Ok(io) => io.poll_write(cx, buf),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.io() {
            Ok(io) => io.poll_flush(cx),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    fn poll_shutdown(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.io() {
            Ok(io) => io.poll_shutdown(cx),
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("attached", &self.io.is_some())
            .finish()
    }
}

/// Endpoint types the channel formatter can marshal.
pub(crate) trait Endpoint: Any + Send + Sync + Sized {
    const KIND: ChannelKind;

    fn channel_id(&self) -> Option<ChannelId>;

    fn from_parts(id: Option<ChannelId>, io: Option<Box<dyn ChannelIo>>) -> Self;
}

macro_rules! endpoint {
    ($(#[$doc:meta])* $name:ident, $kind:expr) => {
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name(Slot);

        impl $name {
            /// Endpoint bound to a channel id with local I/O.
            pub fn new(id: ChannelId, io: Box<dyn ChannelIo>) -> Self {
                Self(Slot { id: Some(id), io: Some(io) })
            }

            /// Reference to a channel opened on this side, for passing as an
            /// argument.
            pub fn offered(id: ChannelId) -> Self {
                Self(Slot { id: Some(id), io: None })
            }

            /// Endpoint bound to nothing.
            pub fn detached() -> Self {
                Self(Slot { id: None, io: None })
            }

            /// The channel id, if any.
            pub fn channel_id(&self) -> Option<ChannelId> {
                self.0.id
            }

            /// Returns true when local I/O is available.
            pub fn is_attached(&self) -> bool {
                self.0.io.is_some()
            }
        }

        impl Endpoint for $name {
            const KIND: ChannelKind = $kind;

            fn channel_id(&self) -> Option<ChannelId> {
                self.0.id
            }

            fn from_parts(id: Option<ChannelId>, io: Option<Box<dyn ChannelIo>>) -> Self {
                Self(Slot { id, io })
            }
        }
    };
}

endpoint!(
    /// Bidirectional channel endpoint.
    DuplexChannel,
    ChannelKind::Duplex
);
endpoint!(
    /// Read-only channel endpoint.
    ChannelReader,
    ChannelKind::Read
);
endpoint!(
    /// Write-only channel endpoint.
    ChannelWriter,
    ChannelKind::Write
);

impl AsyncRead for DuplexChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.0.poll_read(cx, buf)
    }
}

impl AsyncWrite for DuplexChannel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.0.poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.0.poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.0.poll_shutdown(cx)
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.0.poll_read(cx, buf)
    }
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.0.poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.0.poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.0.poll_shutdown(cx)
    }
}

/// A duplex channel presented as a plain byte stream.
#[derive(Debug)]
pub struct ByteStream(DuplexChannel);

impl ByteStream {
    /// Wraps a duplex channel.
    pub fn new(channel: DuplexChannel) -> Self {
        Self(channel)
    }

    /// Unwraps the duplex channel.
    pub fn into_inner(self) -> DuplexChannel {
        self.0
    }

    /// The channel id, if any.
    pub fn channel_id(&self) -> Option<ChannelId> {
        self.0.channel_id()
    }
}

impl Endpoint for ByteStream {
    const KIND: ChannelKind = ChannelKind::Duplex;

    fn channel_id(&self) -> Option<ChannelId> {
        self.0.channel_id()
    }

    fn from_parts(id: Option<ChannelId>, io: Option<Box<dyn ChannelIo>>) -> Self {
        Self(DuplexChannel::from_parts(id, io))
    }
}

impl AsyncRead for ByteStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for ByteStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

#[derive(Default)]
struct ChannelState {
    /// Channels opened through the factory and not yet finalized.
    opened: HashSet<ChannelId>,
    /// Channels this side offered, by the request that carried them.
    outbound: HashMap<CorrelationId, Vec<ChannelId>>,
    /// Channels this side attached, by the request that carried them.
    inbound: HashMap<CorrelationId, Vec<ChannelId>>,
}

/// Maps channel endpoints to tokens and back, per request.
pub struct ChannelTracker {
    factory: Option<Arc<dyn ChannelFactory>>,
    state: Mutex<ChannelState>,
}

impl ChannelTracker {
    pub(crate) fn new(factory: Option<Arc<dyn ChannelFactory>>) -> Self {
        Self {
            factory,
            state: Mutex::new(ChannelState::default()),
        }
    }

    /// Returns true when a channel factory is configured.
    pub fn is_available(&self) -> bool {
        self.factory.is_some()
    }

    /// Opens a new channel through the factory.
    pub fn open(&self, kind: ChannelKind) -> ProtocolResult<DuplexChannel> {
        let factory = self.factory()?;
        let (id, io) = factory.create(kind)?;
        self.state.lock().opened.insert(id);
        debug!(channel = id, ?kind, "opened channel");
        Ok(DuplexChannel::new(id, io))
    }

    /// Returns the token for an endpoint, or `None` when it must be written
    /// as nil.
    ///
    /// Only ids returned by [`open`](Self::open) get a token. Offering the
    /// same channel twice with one request tracks it once.
    pub fn get_token_for(
        &self,
        channel: Option<ChannelId>,
        request: Option<&CorrelationId>,
    ) -> ProtocolResult<Option<ChannelId>> {
        if self.factory.is_none() {
            trace!("no channel factory; channel marshaled as nil");
            return Ok(None);
        }
        let Some(id) = channel else {
            return Ok(None);
        };
        let request = request.ok_or_else(|| {
            ProtocolError::encode("channel arguments require a request with an id")
        })?;

        let mut state = self.state.lock();
        if !state.opened.contains(&id) {
            debug!(channel = id, "channel was not opened through this tracker; marshaled as nil");
            return Ok(None);
        }
        let offered = state.outbound.entry(request.clone()).or_default();
        if !offered.contains(&id) {
            offered.push(id);
        }
        trace!(channel = id, request = %request, "offered channel");
        Ok(Some(id))
    }

    /// Returns the token an endpoint would get, without tracking it.
    pub fn peek_token_for(&self, channel: Option<ChannelId>) -> Option<ChannelId> {
        let id = channel?;
        (self.factory.is_some() && self.state.lock().opened.contains(&id)).then_some(id)
    }

    /// Attaches the local side of a channel the peer offered.
    pub fn get_channel_by_token(
        &self,
        token: ChannelId,
        kind: ChannelKind,
        request: Option<&CorrelationId>,
    ) -> ProtocolResult<Box<dyn ChannelIo>> {
        let io = self.factory()?.attach(token, kind)?;
        if let Some(request) = request {
            self.state
                .lock()
                .inbound
                .entry(request.clone())
                .or_default()
                .push(token);
        }
        trace!(channel = token, ?kind, "attached channel");
        Ok(io)
    }

    /// Finalizes channels attached for `request` once its response is sent.
    pub fn on_response_sent(&self, request: &CorrelationId, successful: bool) {
        let ids = self.state.lock().inbound.remove(request);
        self.finish(ids, request, successful, "sent");
    }

    /// Finalizes channels offered with `request` once its response arrives.
    pub fn on_response_observed(&self, request: &CorrelationId, successful: bool) {
        let ids = {
            let mut state = self.state.lock();
            let ids = state.outbound.remove(request);
            for id in ids.iter().flatten() {
                state.opened.remove(id);
            }
            ids
        };
        self.finish(ids, request, successful, "observed");
    }

    fn finish(
        &self,
        ids: Option<Vec<ChannelId>>,
        request: &CorrelationId,
        successful: bool,
        event: &'static str,
    ) {
        let Some(ids) = ids else {
            return;
        };
        if !successful && let Some(factory) = self.factory.as_ref() {
            for id in &ids {
                factory.release(*id);
            }
        }
        debug!(request = %request, channels = ids.len(), successful, event, "finalized channels");
    }

    /// Number of channels this side offered and still tracks for `request`.
    pub fn outbound_count(&self, request: &CorrelationId) -> usize {
        self.state.lock().outbound.get(request).map_or(0, Vec::len)
    }

    /// Number of channels this side attached and still tracks for `request`.
    pub fn inbound_count(&self, request: &CorrelationId) -> usize {
        self.state.lock().inbound.get(request).map_or(0, Vec::len)
    }

    fn factory(&self) -> ProtocolResult<&Arc<dyn ChannelFactory>> {
        self.factory
            .as_ref()
            .ok_or_else(|| ProtocolError::ChannelUnavailable("no channel factory configured".into()))
    }
}

struct ChannelFormatter<E>(PhantomData<fn() -> E>);

impl<E: Endpoint> Formatter<E> for ChannelFormatter<E> {
    fn serialize(&self, value: &E, out: &mut Vec<u8>, cx: &FormatContext<'_>) -> ProtocolResult<()> {
        let token = if cx.is_diagnostic() {
            cx.channels().peek_token_for(value.channel_id())
        } else {
            let request = cx.serializing_request_id();
            cx.channels().get_token_for(value.channel_id(), request.as_ref())?
        };
        match token {
            Some(token) => wire::write_u64(out, token),
            None => wire::write_nil(out),
        }
    }

    fn deserialize(&self, bytes: &Bytes, cx: &FormatContext<'_>) -> ProtocolResult<E> {
        let mut reader = Reader::new(bytes);
        if reader.try_read_nil()? {
            return Ok(E::from_parts(None, None));
        }
        let token = reader.read_u64_value()?;
        let request = cx.deserializing_message_id();
        let io = cx
            .channels()
            .get_channel_by_token(token, E::KIND, request.as_ref())?;
        Ok(E::from_parts(Some(token), Some(io)))
    }
}

fn formatter_for<E: Endpoint>() -> Arc<dyn ValueFormatter> {
    typed::<E, _>(ChannelFormatter::<E>(PhantomData))
}

/// Fallback resolver matching the channel endpoint types.
#[derive(Default)]
pub(crate) struct ChannelResolver {
    cache: RwLock<HashMap<TypeId, Option<Arc<dyn ValueFormatter>>>>,
}

impl FormatterResolver for ChannelResolver {
    fn resolve(&self, key: TypeKey) -> Option<Arc<dyn ValueFormatter>> {
        if let Some(hit) = self.cache.read().get(&key.id()) {
            return hit.clone();
        }
        let found = if key.is::<DuplexChannel>() {
            Some(formatter_for::<DuplexChannel>())
        } else if key.is::<ChannelReader>() {
            Some(formatter_for::<ChannelReader>())
        } else if key.is::<ChannelWriter>() {
            Some(formatter_for::<ChannelWriter>())
        } else if key.is::<ByteStream>() {
            Some(formatter_for::<ByteStream>())
        } else {
            None
        };
        if found.is_some() {
            trace!(type_name = key.name(), "matched channel type");
        }
        self.cache.write().entry(key.id()).or_insert(found).clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Factory backed by in-process tokio pipes.
    #[derive(Default)]
    pub(crate) struct MemoryFactory {
        next: AtomicU64,
        peers: Mutex<HashMap<ChannelId, DuplexStream>>,
        pub(crate) released: Mutex<Vec<ChannelId>>,
    }

    impl ChannelFactory for MemoryFactory {
        fn create(&self, _kind: ChannelKind) -> ProtocolResult<(ChannelId, Box<dyn ChannelIo>)> {
            let id = self.next.fetch_add(1, Ordering::SeqCst) + 1;
            let (local, remote) = tokio::io::duplex(256);
            self.peers.lock().insert(id, remote);
            Ok((id, Box::new(local)))
        }

        fn attach(&self, id: ChannelId, _kind: ChannelKind) -> ProtocolResult<Box<dyn ChannelIo>> {
            match self.peers.lock().remove(&id) {
                Some(remote) => Ok(Box::new(remote)),
                None => Err(ProtocolError::ChannelUnavailable(format!("unknown channel {}", id))),
            }
        }

        fn release(&self, id: ChannelId) {
            self.peers.lock().remove(&id);
            self.released.lock().push(id);
        }
    }

    fn tracker() -> (Arc<MemoryFactory>, ChannelTracker) {
        let factory = Arc::new(MemoryFactory::default());
        let tracker = ChannelTracker::new(Some(factory.clone()));
        (factory, tracker)
    }

    #[test]
    fn without_factory_channels_become_nil() {
        let tracker = ChannelTracker::new(None);
        assert!(!tracker.is_available());
        let token = tracker
            .get_token_for(Some(3), Some(&CorrelationId::from(1)))
            .unwrap();
        assert_eq!(token, None);
        assert!(matches!(
            tracker.open(ChannelKind::Duplex),
            Err(ProtocolError::ChannelUnavailable(_))
        ));
    }

    #[test]
    fn offered_channel_is_tracked_until_response() {
        let (factory, tracker) = tracker();
        let request = CorrelationId::from(1);
        let local = tracker.open(ChannelKind::Duplex).unwrap();
        let id = local.channel_id().unwrap();

        assert_eq!(tracker.get_token_for(Some(id), Some(&request)).unwrap(), Some(id));
        assert_eq!(tracker.outbound_count(&request), 1);

        tracker.on_response_observed(&request, true);
        assert_eq!(tracker.outbound_count(&request), 0);
        assert!(factory.released.lock().is_empty());
    }

    #[test]
    fn failed_response_releases_offered_channels() {
        let (factory, tracker) = tracker();
        let request = CorrelationId::from("r");
        let id = tracker.open(ChannelKind::Read).unwrap().channel_id().unwrap();
        tracker.get_token_for(Some(id), Some(&request)).unwrap();

        tracker.on_response_observed(&request, false);
        assert_eq!(*factory.released.lock(), vec![id]);
        // A second observation is a no-op.
        tracker.on_response_observed(&request, false);
        assert_eq!(factory.released.lock().len(), 1);
    }

    #[test]
    fn attached_channels_finalize_on_response_sent() {
        let (_factory, tracker) = tracker();
        let request = CorrelationId::from(8);
        let id = tracker.open(ChannelKind::Write).unwrap().channel_id().unwrap();

        tracker
            .get_channel_by_token(id, ChannelKind::Write, Some(&request))
            .unwrap();
        assert_eq!(tracker.inbound_count(&request), 1);
        tracker.on_response_sent(&request, true);
        assert_eq!(tracker.inbound_count(&request), 0);
    }

    #[test]
    fn notification_cannot_offer_channel() {
        let (_factory, tracker) = tracker();
        let id = tracker.open(ChannelKind::Duplex).unwrap().channel_id().unwrap();
        assert!(tracker.get_token_for(Some(id), None).is_err());
    }

    #[test]
    fn ids_not_opened_here_become_nil() {
        let (factory, tracker) = tracker();
        let request = CorrelationId::from(2);
        assert_eq!(tracker.get_token_for(Some(40), Some(&request)).unwrap(), None);
        assert_eq!(tracker.peek_token_for(Some(40)), None);
        assert_eq!(tracker.outbound_count(&request), 0);

        tracker.on_response_observed(&request, false);
        assert!(factory.released.lock().is_empty());
    }

    #[test]
    fn offering_twice_releases_once() {
        let (factory, tracker) = tracker();
        let request = CorrelationId::from(6);
        let id = tracker.open(ChannelKind::Duplex).unwrap().channel_id().unwrap();

        tracker.get_token_for(Some(id), Some(&request)).unwrap();
        tracker.get_token_for(Some(id), Some(&request)).unwrap();
        assert_eq!(tracker.outbound_count(&request), 1);

        tracker.on_response_observed(&request, false);
        assert_eq!(*factory.released.lock(), vec![id]);
        // Finalized channels are no longer offered.
        assert_eq!(tracker.peek_token_for(Some(id)), None);
    }

    #[test]
    fn unknown_token_fails_to_attach() {
        let (_factory, tracker) = tracker();
        assert!(tracker.get_channel_by_token(77, ChannelKind::Duplex, None).is_err());
    }

    #[test]
    fn resolver_matches_only_endpoint_types() {
        let resolver = ChannelResolver::default();
        assert!(resolver.resolve(TypeKey::of::<DuplexChannel>()).is_some());
        assert!(resolver.resolve(TypeKey::of::<ByteStream>()).is_some());
        assert!(resolver.resolve(TypeKey::of::<String>()).is_none());
        assert_eq!(ChannelReader::KIND, ChannelKind::Read);
        assert_eq!(ChannelWriter::KIND, ChannelKind::Write);
    }

    #[tokio::test]
    async fn attached_endpoints_carry_bytes() {
        let (_factory, tracker) = tracker();
        let mut local = tracker.open(ChannelKind::Duplex).unwrap();
        let id = local.channel_id().unwrap();
        let io = tracker
            .get_channel_by_token(id, ChannelKind::Duplex, None)
            .unwrap();
        let mut remote = ByteStream::new(DuplexChannel::new(id, io));

        local.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        remote.write_all(b"pong").await.unwrap();
        local.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn detached_endpoint_io_fails() {
        let mut reader = ChannelReader::detached();
        let mut buf = [0u8; 1];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        let mut writer = ChannelWriter::offered(4);
        assert!(!writer.is_attached());
        let err = writer.write_all(b"x").await.unwrap_err();
        assert!(err.to_string().contains("channel 4"));
    }
}
