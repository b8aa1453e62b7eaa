//! Request cache with a shared exponential backoff window.
//!
//! Wraps an upstream API behind two mechanisms:
//!
//! - caching: answers are stored per parameter set until they expire;
//! - backoff: a failed request bars the upstream for a growing window. Within
//!   the window no request is made; the backend may offer stale data
//!   instead, otherwise [`CacheError::BackingOff`] is returned.
//!
//! Consecutive failures share one window regardless of which parameters
//! triggered them. Concurrent requests for the same parameters are
//! serialised, so only one of them reaches the backend.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::backoff::{BackoffConfig, ExponentialBackoff};
use crate::error::{CacheError, RequestError};

/// A stored answer.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<D> {
    pub data: D,
    /// Entry is served from the cache until this instant (inclusive).
    pub expires: Option<Instant>,
    /// Opaque validator for conditional requests (e.g. `Last-Modified`).
    pub last_modified: Option<String>,
}

impl<D> CacheEntry<D> {
    /// An entry that is never served from the cache until it gets an expiry.
    pub fn new(data: D) -> Self {
        Self {
            data,
            expires: None,
            last_modified: None,
        }
    }

    /// Live for `ttl` from now.
    pub fn expiring_in(mut self, ttl: Duration) -> Self {
        self.expires = Some(Instant::now() + ttl);
        self
    }

    pub fn last_modified(mut self, marker: impl Into<String>) -> Self {
        self.last_modified = Some(marker.into());
        self
    }

    pub fn is_live(&self, now: Instant) -> bool {
        self.expires.is_some_and(|expires| expires >= now)
    }
}

/// Request parameters; also the cache key.
///
/// Order-independent: two parameter sets with the same pairs are equal no
/// matter in which order the pairs were added.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestParams(BTreeMap<String, String>);

impl RequestParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter, rendered with `Display`.
    pub fn with(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for RequestParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                f.write_str("&")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

/// The upstream behind a [`RequestCache`].
#[async_trait::async_trait]
pub trait RequestBackend: Send + Sync {
    type Data: Clone + Send + Sync + 'static;

    /// Perform the actual request.
    ///
    /// `previous` is the entry stored for these parameters, expired or not;
    /// backends may use it for conditional requests and return it with a
    /// refreshed expiry when upstream reports no change. The returned entry
    /// must carry an expiry to be served from the cache later.
    async fn perform_request(
        &self,
        previous: Option<CacheEntry<Self::Data>>,
        params: &RequestParams,
    ) -> Result<CacheEntry<Self::Data>, RequestError<Self::Data>>;

    /// Called instead of [`perform_request`](Self::perform_request) while
    /// backing off. Must not contact the upstream. `None` turns into
    /// [`CacheError::BackingOff`]; the default never serves stale data.
    fn backing_off_result(
        &self,
        _previous: Option<&CacheEntry<Self::Data>>,
        _params: &RequestParams,
    ) -> Option<CacheEntry<Self::Data>> {
        None
    }
}

/// Configuration for a [`RequestCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestCacheConfig {
    pub backoff: BackoffConfig,
}

impl Default for RequestCacheConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig {
                start: Duration::from_secs(15),
                base: 2,
                max: Duration::from_secs(120),
            },
        }
    }
}

struct BackoffGate {
    backoff: ExponentialBackoff,
    until: Option<Instant>,
}

impl BackoffGate {
    fn active_until(&self, now: Instant) -> Option<Instant> {
        match self.until {
            Some(until) if self.backoff.failing() && now < until => Some(until),
            _ => None,
        }
    }
}

pub struct RequestCache<B: RequestBackend> {
    backend: B,
    entries: Mutex<HashMap<RequestParams, CacheEntry<B::Data>>>,
    in_flight: Mutex<HashMap<RequestParams, Arc<tokio::sync::Mutex<()>>>>,
    gate: Mutex<BackoffGate>,
}

impl<B: RequestBackend> RequestCache<B> {
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, RequestCacheConfig::default())
    }

    pub fn with_config(backend: B, config: RequestCacheConfig) -> Self {
        Self {
            backend,
            entries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            gate: Mutex::new(BackoffGate {
                backoff: ExponentialBackoff::new(config.backoff),
                until: None,
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Answer from the cache if a live entry exists, otherwise fetch.
    pub async fn request(&self, params: &RequestParams) -> Result<B::Data, CacheError> {
        if let Some(data) = self.live_data(params, Instant::now()) {
            return Ok(data);
        }

        let guard = self.key_guard(params);
        let held = guard.lock().await;

        // Whoever held the guard before us may have stored a fresh answer.
        let now = Instant::now();
        let previous = {
            let entries = self.entries.lock();
            match entries.get(params) {
                Some(entry) if entry.is_live(now) => {
                    let data = entry.data.clone();
                    drop(entries);
                    self.release_guard(params, &guard);
                    drop(held);
                    return Ok(data);
                }
                other => other.cloned(),
            }
        };

        let result = self.execute(now, previous, params).await;
        if let Ok(entry) = &result {
            self.entries.lock().insert(params.clone(), entry.clone());
        }
        self.release_guard(params, &guard);
        drop(held);

        result.map(|entry| entry.data)
    }

    /// Fetch without reading or writing the cache. Still gated by backoff.
    pub async fn request_uncached(&self, params: &RequestParams) -> Result<B::Data, CacheError> {
        self.execute(Instant::now(), None, params)
            .await
            .map(|entry| entry.data)
    }

    /// End of the current backoff window, if one is active.
    pub fn backing_off_until(&self) -> Option<Instant> {
        self.gate.lock().active_until(Instant::now())
    }

    /// Forget the stored answer for `params`.
    pub fn invalidate(&self, params: &RequestParams) -> bool {
        self.entries.lock().remove(params).is_some()
    }

    /// Number of stored answers, live or expired.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    // ── Internal ───────────────────────────────────────────────────────

    fn live_data(&self, params: &RequestParams, now: Instant) -> Option<B::Data> {
        self.entries
            .lock()
            .get(params)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.data.clone())
    }

    fn key_guard(&self, params: &RequestParams) -> Arc<tokio::sync::Mutex<()>> {
        self.in_flight
            .lock()
            .entry(params.clone())
            .or_default()
            .clone()
    }

    /// Drop the per-key guard once nobody else is waiting on it.
    fn release_guard(&self, params: &RequestParams, guard: &Arc<tokio::sync::Mutex<()>>) {
        let mut in_flight = self.in_flight.lock();
        // One reference in the map, one held by the caller.
        if Arc::strong_count(guard) <= 2 {
            in_flight.remove(params);
        }
    }

    async fn execute(
        &self,
        now: Instant,
        previous: Option<CacheEntry<B::Data>>,
        params: &RequestParams,
    ) -> Result<CacheEntry<B::Data>, CacheError> {
        let backing_off = self.gate.lock().active_until(now);
        if let Some(until) = backing_off {
            return match self.backend.backing_off_result(previous.as_ref(), params) {
                Some(entry) => {
                    tracing::debug!(%params, "returning stale data while still backing off");
                    Ok(entry)
                }
                None => Err(CacheError::backing_off(until, now)),
            };
        }

        match self.backend.perform_request(previous, params).await {
            Ok(entry) => {
                let mut gate = self.gate.lock();
                gate.backoff.reset();
                gate.until = None;
                Ok(entry)
            }
            Err(mut err) => {
                if err.back_off {
                    let mut gate = self.gate.lock();
                    let delay = gate.backoff.next_delay();
                    gate.until = Some(now + delay);
                    tracing::warn!(%params, ?delay, error = %err, "request failed, backing off");
                }
                match err.fallback.take() {
                    Some(entry) => {
                        tracing::debug!(%params, error = %err, "ignoring failed request and returning old cache entry");
                        Ok(entry)
                    }
                    None => Err(err.into_surfaced()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Outcome = Result<CacheEntry<u32>, RequestError<u32>>;

    /// Backend replaying scripted outcomes; counts calls.
    struct ScriptedBackend {
        outcomes: Mutex<VecDeque<Outcome>>,
        calls: AtomicUsize,
        stale: Option<u32>,
    }

    impl ScriptedBackend {
        fn new(outcomes: Vec<Outcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: AtomicUsize::new(0),
                stale: None,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl RequestBackend for ScriptedBackend {
        type Data = u32;

        async fn perform_request(
            &self,
            previous: Option<CacheEntry<u32>>,
            _params: &RequestParams,
        ) -> Outcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.outcomes.lock().pop_front() {
                Some(Ok(entry)) if entry.data == 0 => {
                    // Zero means "not modified": reuse the previous entry.
                    let prev = previous.expect("conditional fetch without previous entry");
                    Ok(prev.expiring_in(Duration::from_secs(60)))
                }
                Some(outcome) => outcome,
                None => Err(RequestError::fatal("script exhausted")),
            }
        }

        fn backing_off_result(
            &self,
            _previous: Option<&CacheEntry<u32>>,
            _params: &RequestParams,
        ) -> Option<CacheEntry<u32>> {
            self.stale.map(CacheEntry::new)
        }
    }

    fn fresh(value: u32) -> Outcome {
        Ok(CacheEntry::new(value).expiring_in(Duration::from_secs(60)))
    }

    fn params() -> RequestParams {
        RequestParams::new().with("lat", 52.5).with("lon", 13.4)
    }

    #[test]
    fn params_are_order_independent() {
        let a = RequestParams::new().with("lat", 1).with("lon", 2);
        let b = RequestParams::new().with("lon", 2).with("lat", 1);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "lat=1&lon=2");
        assert_eq!(a.get("lon"), Some("2"));
    }

    #[test]
    fn entry_liveness() {
        let now = Instant::now();
        let mut entry = CacheEntry::new(1u32);
        assert!(!entry.is_live(now));
        entry.expires = Some(now);
        assert!(entry.is_live(now), "expiry is inclusive");
        assert!(!entry.is_live(now + Duration::from_millis(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn second_request_is_a_cache_hit() {
        let cache = RequestCache::new(ScriptedBackend::new(vec![fresh(7)]));
        assert_eq!(cache.request(&params()).await.unwrap(), 7);
        assert_eq!(cache.request(&params()).await.unwrap(), 7);
        assert_eq!(cache.backend().calls(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_passed_to_backend() {
        let cache = RequestCache::new(ScriptedBackend::new(vec![fresh(7), fresh(0)]));
        cache.request(&params()).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        // Backend answers "not modified" and hands back the previous entry.
        assert_eq!(cache.request(&params()).await.unwrap(), 7);
        assert_eq!(cache.backend().calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn uncached_request_is_not_stored() {
        let cache = RequestCache::new(ScriptedBackend::new(vec![fresh(1), fresh(2)]));
        assert_eq!(cache.request_uncached(&params()).await.unwrap(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.request_uncached(&params()).await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_failure_bars_backend() {
        let cache = RequestCache::new(ScriptedBackend::new(vec![Err(
            RequestError::transient("timeout"),
        )]));

        let err = cache.request(&params()).await.unwrap_err();
        assert!(matches!(err, CacheError::Request { .. }));

        let err = cache.request(&params()).await.unwrap_err();
        match err {
            CacheError::BackingOff { remaining, .. } => {
                assert_eq!(remaining, Duration::from_secs(15))
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(cache.backend().calls(), 1);

        // Uncached requests are gated too.
        assert!(cache
            .request_uncached(&params())
            .await
            .unwrap_err()
            .is_backing_off());
        assert_eq!(cache.backend().calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failure_does_not_back_off() {
        let cache = RequestCache::new(ScriptedBackend::new(vec![
            Err(RequestError::fatal("404")),
            fresh(3),
        ]));
        assert!(cache.request(&params()).await.is_err());
        assert!(cache.backing_off_until().is_none());
        assert_eq!(cache.request(&params()).await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_is_served_and_window_extended() {
        let cache = RequestCache::new(ScriptedBackend::new(vec![Err(
            RequestError::transient("timeout").with_fallback(CacheEntry::new(99)),
        )]));

        assert_eq!(cache.request(&params()).await.unwrap(), 99);
        let until = cache.backing_off_until().expect("window engaged");
        assert_eq!(until - Instant::now(), Duration::from_secs(15));
        // Stored, but without expiry it is never a cache hit.
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_hook_answers_while_backing_off() {
        let mut backend = ScriptedBackend::new(vec![Err(RequestError::transient("timeout"))]);
        backend.stale = Some(5);
        let cache = RequestCache::new(backend);

        assert!(cache.request(&params()).await.is_err());
        assert_eq!(cache.request(&params()).await.unwrap(), 5);
        assert_eq!(cache.backend().calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_answer_is_stored_for_the_next_fetch() {
        let mut backend = ScriptedBackend::new(vec![Err(RequestError::transient("timeout")), fresh(0)]);
        backend.stale = Some(5);
        let cache = RequestCache::new(backend);

        assert!(cache.request(&params()).await.is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.request(&params()).await.unwrap(), 5);
        assert_eq!(cache.len(), 1);

        // Past the window the stored stale entry is offered as the previous one.
        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(cache.request(&params()).await.unwrap(), 5);
        assert_eq!(cache.backend().calls(), 2);
        assert_eq!(cache.request(&params()).await.unwrap(), 5);
        assert_eq!(cache.backend().calls(), 2, "refreshed entry is live");
    }

    #[tokio::test(start_paused = true)]
    async fn cause_is_surfaced() {
        let cache = RequestCache::new(ScriptedBackend::new(vec![Err(RequestError::transient(
            "timeout",
        )
        .caused_by(anyhow::anyhow!("connection reset")))]));
        match cache.request(&params()).await.unwrap_err() {
            CacheError::Upstream(cause) => assert_eq!(cause.to_string(), "connection reset"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn windows_grow_then_reset_after_success() {
        let cache = RequestCache::new(ScriptedBackend::new(vec![
            Err(RequestError::transient("1")),
            Err(RequestError::transient("2")),
            Err(RequestError::transient("3")),
            Ok(CacheEntry::new(1).expiring_in(Duration::from_secs(1))),
            Err(RequestError::transient("4")),
        ]));

        let mut windows = Vec::new();
        for _ in 0..3 {
            assert!(cache.request(&params()).await.is_err());
            let window = cache.backing_off_until().unwrap() - Instant::now();
            windows.push(window);
            tokio::time::advance(window).await;
        }
        assert_eq!(
            windows,
            vec![
                Duration::from_secs(15),
                Duration::from_secs(30),
                Duration::from_secs(60)
            ]
        );

        assert_eq!(cache.request(&params()).await.unwrap(), 1);
        assert!(cache.backing_off_until().is_none());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.request(&params()).await.is_err());
        let window = cache.backing_off_until().unwrap() - Instant::now();
        assert_eq!(window, Duration::from_secs(15));
        assert_eq!(cache.backend().calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_share_one_fetch() {
        struct SlowBackend(AtomicUsize);

        #[async_trait::async_trait]
        impl RequestBackend for SlowBackend {
            type Data = usize;

            async fn perform_request(
                &self,
                _previous: Option<CacheEntry<usize>>,
                _params: &RequestParams,
            ) -> Result<CacheEntry<usize>, RequestError<usize>> {
                let n = self.0.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(CacheEntry::new(n).expiring_in(Duration::from_secs(60)))
            }
        }

        let cache = Arc::new(RequestCache::new(SlowBackend(AtomicUsize::new(0))));
        let a = tokio::spawn({
            let cache = cache.clone();
            async move { cache.request(&params()).await.unwrap() }
        });
        let b = tokio::spawn({
            let cache = cache.clone();
            async move { cache.request(&params()).await.unwrap() }
        });

        assert_eq!(a.await.unwrap(), 0);
        assert_eq!(b.await.unwrap(), 0);
        assert_eq!(cache.backend().0.load(Ordering::SeqCst), 1);
        assert!(cache.in_flight.lock().is_empty());
    }
}
