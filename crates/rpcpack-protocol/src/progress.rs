//! Progress callbacks marshaled as integer tokens.
//!
//! When a request carries a [`Progress<V>`] argument, the sender registers it
//! under a fresh token tied to the request's id and writes only the token. The
//! receiver turns the token back into a `Progress<V>` proxy whose reports are
//! sent as `$/progress` notifications with named arguments `token` and
//! `value`. When such a notification arrives, the sender decodes `value` as
//! `V` and invokes the original callback. Tokens are dropped once the
//! response for their request is observed.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::PROGRESS_METHOD;
use crate::codec::FormatContext;
use crate::error::{ProtocolError, ProtocolResult};
use crate::id::CorrelationId;
use crate::message::{AnyValue, Arguments, Request};
use crate::resolver::{Formatter, FormatterResolver, RawMessage, TypeKey, ValueFormatter, typed};
use crate::wire::{self, Reader};

/// Receives notifications the codec produces on its own, such as progress
/// reports from a proxy.
pub trait NotificationSink: Send + Sync {
    /// Sends `notification` to the remote peer.
    fn notify(&self, notification: Request);
}

/// A callback accepting intermediate results of a long-running call.
pub struct Progress<V> {
    callback: Arc<dyn Fn(V) + Send + Sync>,
}

impl<V> Progress<V> {
    /// Creates a progress handle around `callback`.
    pub fn new(callback: impl Fn(V) + Send + Sync + 'static) -> Self {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// Reports one value.
    pub fn report(&self, value: V) {
        (self.callback)(value)
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.callback) as *const () as usize
    }
}

impl<V> Clone for Progress<V> {
    fn clone(&self) -> Self {
        Self {
            callback: Arc::clone(&self.callback),
        }
    }
}

impl<V> fmt::Debug for Progress<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Progress<{}>", type_name::<V>())
    }
}

/// A registered progress callback that decodes its own value type.
trait ProgressTarget: Send + Sync {
    fn report_encoded(&self, value: &Bytes, cx: &FormatContext<'_>) -> ProtocolResult<()>;
}

impl<V: Any + Send> ProgressTarget for Progress<V> {
    fn report_encoded(&self, value: &Bytes, cx: &FormatContext<'_>) -> ProtocolResult<()> {
        let value = cx.decode_value::<V>(value)?;
        self.report(value);
        Ok(())
    }
}

struct Registration {
    identity: usize,
    request: CorrelationId,
    target: Arc<dyn ProgressTarget>,
}

#[derive(Default)]
struct ProgressState {
    by_token: HashMap<u64, Registration>,
    /// Keyed by callback identity and owning request.
    token_by_identity: HashMap<(usize, CorrelationId), u64>,
    tokens_by_request: HashMap<CorrelationId, Vec<u64>>,
}

/// Maps progress callbacks to tokens and back, per request.
pub struct ProgressTracker {
    next_token: AtomicU64,
    state: Mutex<ProgressState>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self {
            next_token: AtomicU64::new(1),
            state: Mutex::new(ProgressState::default()),
        }
    }
}

impl ProgressTracker {
    /// Returns the token for `progress`, registering it under `request`.
    ///
    /// Passing the same callback twice for one request yields the same token;
    /// each request gets its own token for a shared callback. Notifications
    /// cannot carry progress handles since no response would ever release
    /// them.
    pub fn get_token_for<V: Any + Send>(
        &self,
        progress: &Progress<V>,
        request: Option<&CorrelationId>,
    ) -> ProtocolResult<u64> {
        let request = request.ok_or_else(|| {
            ProtocolError::encode("progress arguments require a request with an id")
        })?;
        let key = (progress.identity(), request.clone());

        let mut state = self.state.lock();
        if let Some(token) = state.token_by_identity.get(&key) {
            return Ok(*token);
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        state.by_token.insert(
            token,
            Registration {
                identity: key.0,
                request: request.clone(),
                target: Arc::new(progress.clone()),
            },
        );
        state.token_by_identity.insert(key, token);
        state
            .tokens_by_request
            .entry(request.clone())
            .or_default()
            .push(token);
        trace!(token, request = %request, value_type = type_name::<V>(), "registered progress");
        Ok(token)
    }

    /// Looks up the token already assigned to `progress` for `request`.
    pub fn find_token<V>(&self, progress: &Progress<V>, request: &CorrelationId) -> Option<u64> {
        self.state
            .lock()
            .token_by_identity
            .get(&(progress.identity(), request.clone()))
            .copied()
    }

    /// Builds a local proxy for a token received from the peer.
    pub fn create_proxy<V>(&self, token: u64, sink: Option<Arc<dyn NotificationSink>>) -> Progress<V>
    where
        V: Any + Send + Sync,
    {
        Progress::new(move |value: V| {
            let Some(sink) = sink.as_ref() else {
                warn!(token, "progress reported with no notification sink; dropped");
                return;
            };
            let token = match RawMessage::serialize(&token) {
                Ok(token) => token,
                Err(err) => {
                    warn!(token, error = %err, "failed to encode progress token");
                    return;
                }
            };
            sink.notify(Request::notification(
                PROGRESS_METHOD,
                Arguments::named([("token", AnyValue::new(token)), ("value", AnyValue::new(value))]),
            ));
        })
    }

    /// Delivers an inbound `$/progress` notification to the registered
    /// callback.
    pub fn on_notification_received(
        &self,
        token: &Bytes,
        value: &Bytes,
        cx: &FormatContext<'_>,
    ) -> ProtocolResult<()> {
        let token = Reader::new(token).read_u64_value()?;
        let target = self
            .state
            .lock()
            .by_token
            .get(&token)
            .map(|registration| Arc::clone(&registration.target))
            .ok_or_else(|| ProtocolError::decode(format!("no progress registered for token {}", token)))?;
        target.report_encoded(value, cx)
    }

    /// Releases every token registered for `request`.
    pub fn on_response_observed(&self, request: &CorrelationId) {
        let mut state = self.state.lock();
        let Some(tokens) = state.tokens_by_request.remove(request) else {
            return;
        };
        for token in &tokens {
            if let Some(registration) = state.by_token.remove(token) {
                state
                    .token_by_identity
                    .remove(&(registration.identity, registration.request));
            }
        }
        debug!(request = %request, released = tokens.len(), "released progress tokens");
    }

    /// Returns true while `token` is registered.
    pub fn is_registered(&self, token: u64) -> bool {
        self.state.lock().by_token.contains_key(&token)
    }

    /// Number of registered tokens.
    pub fn len(&self) -> usize {
        self.state.lock().by_token.len()
    }

    /// Returns true when no token is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Writes a [`Progress<V>`] as its token and reads a token back as a proxy.
struct ProgressFormatter<V>(PhantomData<fn() -> V>);

impl<V> Formatter<Progress<V>> for ProgressFormatter<V>
where
    V: Any + Send + Sync,
{
    fn serialize(
        &self,
        value: &Progress<V>,
        out: &mut Vec<u8>,
        cx: &FormatContext<'_>,
    ) -> ProtocolResult<()> {
        let request = cx.serializing_request_id();
        if cx.is_diagnostic() {
            return match request.and_then(|request| cx.progress().find_token(value, &request)) {
                Some(token) => wire::write_u64(out, token),
                None => wire::write_nil(out),
            };
        }
        let token = cx.progress().get_token_for(value, request.as_ref())?;
        wire::write_u64(out, token)
    }

    fn deserialize(&self, bytes: &Bytes, cx: &FormatContext<'_>) -> ProtocolResult<Progress<V>> {
        let token = Reader::new(bytes).read_u64_value()?;
        Ok(cx.progress().create_proxy(token, cx.sink()))
    }
}

type FormatterFactory = fn() -> Arc<dyn ValueFormatter>;

/// Fallback resolver matching `Progress<V>` for the accepted value types.
#[derive(Default)]
pub(crate) struct ProgressResolver {
    factories: HashMap<TypeId, FormatterFactory>,
    cache: RwLock<HashMap<TypeId, Option<Arc<dyn ValueFormatter>>>>,
}

impl ProgressResolver {
    /// Lets `Progress<V>` travel as an argument.
    pub(crate) fn accept<V>(&mut self)
    where
        V: Any + Send + Sync,
    {
        fn make<V: Any + Send + Sync>() -> Arc<dyn ValueFormatter> {
            typed::<Progress<V>, _>(ProgressFormatter::<V>(PhantomData))
        }
        self.factories.insert(TypeId::of::<Progress<V>>(), make::<V>);
    }
}

impl FormatterResolver for ProgressResolver {
    fn resolve(&self, key: TypeKey) -> Option<Arc<dyn ValueFormatter>> {
        if let Some(hit) = self.cache.read().get(&key.id()) {
            return hit.clone();
        }
        let found = self.factories.get(&key.id()).map(|make| make());
        self.cache.write().entry(key.id()).or_insert(found).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MessagePackFormatter;
    use std::sync::atomic::AtomicI64;

    fn encoded<T: serde::Serialize>(value: &T) -> Bytes {
        Bytes::from(rmp_serde::to_vec_named(value).unwrap())
    }

    #[test]
    fn tokens_are_unique_and_stable_per_callback() {
        let tracker = ProgressTracker::default();
        let id = CorrelationId::from("42");
        let a = Progress::<i64>::new(|_| {});
        let b = Progress::<i64>::new(|_| {});

        let ta = tracker.get_token_for(&a, Some(&id)).unwrap();
        let tb = tracker.get_token_for(&b, Some(&id)).unwrap();
        assert_ne!(ta, tb);
        assert_eq!(tracker.get_token_for(&a.clone(), Some(&id)).unwrap(), ta);
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn shared_callback_gets_a_token_per_request() {
        let tracker = ProgressTracker::default();
        let a = CorrelationId::from("A");
        let b = CorrelationId::from("B");
        let progress = Progress::<i64>::new(|_| {});

        let ta = tracker.get_token_for(&progress, Some(&a)).unwrap();
        let tb = tracker.get_token_for(&progress, Some(&b)).unwrap();
        assert_ne!(ta, tb);

        tracker.on_response_observed(&a);
        assert!(!tracker.is_registered(ta));
        assert!(tracker.is_registered(tb));

        tracker.on_response_observed(&b);
        assert!(tracker.is_empty());
    }

    #[test]
    fn notifications_cannot_carry_progress() {
        let tracker = ProgressTracker::default();
        let progress = Progress::<i64>::new(|_| {});
        assert!(tracker.get_token_for(&progress, None).is_err());
        assert!(tracker.is_empty());
    }

    #[test]
    fn response_releases_only_its_own_tokens() {
        let tracker = ProgressTracker::default();
        let first = CorrelationId::from(1);
        let second = CorrelationId::from(2);
        let t1 = tracker
            .get_token_for(&Progress::<i64>::new(|_| {}), Some(&first))
            .unwrap();
        let t2 = tracker
            .get_token_for(&Progress::<i64>::new(|_| {}), Some(&second))
            .unwrap();

        tracker.on_response_observed(&first);
        assert!(!tracker.is_registered(t1));
        assert!(tracker.is_registered(t2));

        // Unknown ids are ignored.
        tracker.on_response_observed(&CorrelationId::from("nope"));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn notification_reaches_registered_callback() {
        let formatter = MessagePackFormatter::builder().progress::<i64>().build();
        let cx = formatter.context();
        let seen = Arc::new(AtomicI64::new(0));
        let sink = Arc::clone(&seen);
        let progress = Progress::new(move |v: i64| sink.store(v, Ordering::SeqCst));

        let tracker = formatter.progress_tracker();
        let token = tracker
            .get_token_for(&progress, Some(&CorrelationId::from(9)))
            .unwrap();
        tracker
            .on_notification_received(&encoded(&token), &encoded(&17i64), &cx)
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 17);
    }

    #[test]
    fn unknown_token_is_an_error() {
        let formatter = MessagePackFormatter::new();
        let cx = formatter.context();
        let err = formatter
            .progress_tracker()
            .on_notification_received(&encoded(&99u64), &encoded(&1i64), &cx)
            .unwrap_err();
        assert!(err.to_string().contains("token 99"));
    }

    #[test]
    fn bad_value_is_an_error() {
        let formatter = MessagePackFormatter::new();
        let cx = formatter.context();
        let tracker = formatter.progress_tracker();
        let token = tracker
            .get_token_for(&Progress::<i64>::new(|_| {}), Some(&CorrelationId::from(1)))
            .unwrap();
        assert!(
            tracker
                .on_notification_received(&encoded(&token), &encoded(&"text"), &cx)
                .is_err()
        );
    }

    struct Collect(Mutex<Vec<Request>>);

    impl NotificationSink for Collect {
        fn notify(&self, notification: Request) {
            self.0.lock().push(notification);
        }
    }

    #[test]
    fn proxy_sends_progress_notification() {
        let collected = Arc::new(Collect(Mutex::new(Vec::new())));
        let tracker = ProgressTracker::default();
        let proxy: Progress<String> = tracker.create_proxy(5, Some(collected.clone()));
        proxy.report("half".to_string());

        let sent = collected.0.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, PROGRESS_METHOD);
        assert!(sent[0].is_notification());
        let Arguments::Named(args) = &sent[0].arguments else {
            panic!("expected named arguments");
        };
        let token = args["token"].as_value().unwrap().downcast_ref::<RawMessage>().unwrap();
        assert_eq!(token.deserialize::<u64>().unwrap(), 5);
        let value = args["value"].as_value().unwrap().downcast_ref::<String>().unwrap();
        assert_eq!(value, "half");
    }

    #[test]
    fn proxy_without_sink_drops_reports() {
        let tracker = ProgressTracker::default();
        let proxy: Progress<i64> = tracker.create_proxy(1, None);
        proxy.report(1);
    }

    #[test]
    fn resolver_only_matches_accepted_value_types() {
        let mut resolver = ProgressResolver::default();
        resolver.accept::<String>();
        assert!(resolver.resolve(TypeKey::of::<Progress<String>>()).is_some());
        assert!(resolver.resolve(TypeKey::of::<Progress<i64>>()).is_none());
        assert!(resolver.resolve(TypeKey::of::<String>()).is_none());
    }
}
