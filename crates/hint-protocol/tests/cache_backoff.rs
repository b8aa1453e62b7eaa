/// Request cache against a flaky quota-limited upstream.
///
/// The upstream fails for a while, then recovers. Callers must see:
/// - at most one upstream call per backoff window,
/// - windows of 15s, 30s, 60s, 120s, 120s while failures continue,
/// - stale data while backing off when the backend offers it,
/// - normal service again after one success.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use hint_protocol::{CacheEntry, CacheError, RequestBackend, RequestCache, RequestError, RequestParams};
use tokio::time::Instant;

#[derive(Default)]
struct Forecast {
    calls: AtomicUsize,
    down: AtomicBool,
}

#[async_trait::async_trait]
impl RequestBackend for Forecast {
    type Data = String;

    async fn perform_request(
        &self,
        _previous: Option<CacheEntry<String>>,
        params: &RequestParams,
    ) -> Result<CacheEntry<String>, RequestError<String>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.down.load(Ordering::SeqCst) {
            return Err(RequestError::transient(format!("quota exceeded (call {n})")));
        }
        Ok(CacheEntry::new(format!("forecast for {params} #{n}")).expiring_in(Duration::from_secs(600)))
    }

    fn backing_off_result(
        &self,
        previous: Option<&CacheEntry<String>>,
        _params: &RequestParams,
    ) -> Option<CacheEntry<String>> {
        previous.cloned()
    }
}

fn params(city: &str) -> RequestParams {
    RequestParams::new().with("q", city).with("units", "metric")
}

#[tokio::test(start_paused = true)]
async fn failure_windows_double_up_to_the_cap() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();

    let cache = RequestCache::new(Forecast::default());
    cache.backend().down.store(true, Ordering::SeqCst);

    let mut windows = Vec::new();
    for _ in 0..5 {
        let started = Instant::now();
        let err = cache.request(&params("zurich")).await.unwrap_err();
        assert!(matches!(err, CacheError::Request { .. }), "upstream error surfaces: {err:?}");
        let until = cache.backing_off_until().expect("window engaged");
        windows.push(until - started);

        // Inside the window the upstream is left alone.
        let err = cache.request(&params("bern")).await.unwrap_err();
        assert!(err.is_backing_off());

        tokio::time::sleep_until(until).await;
    }
    assert_eq!(
        windows,
        [15, 30, 60, 120, 120].map(Duration::from_secs).to_vec()
    );
    assert_eq!(cache.backend().calls.load(Ordering::SeqCst), 5);

    cache.backend().down.store(false, Ordering::SeqCst);
    let data = cache.request(&params("zurich")).await.unwrap();
    assert!(data.starts_with("forecast for q=zurich&units=metric"));
    assert_eq!(cache.backing_off_until(), None);
}

#[tokio::test(start_paused = true)]
async fn stale_answer_served_while_backing_off() {
    let cache = RequestCache::new(Forecast::default());
    let first = cache.request(&params("geneva")).await.unwrap();

    // Let the entry expire, then break the upstream.
    tokio::time::sleep(Duration::from_secs(601)).await;
    cache.backend().down.store(true, Ordering::SeqCst);
    cache.request(&params("geneva")).await.unwrap_err();
    assert!(cache.backing_off_until().is_some());

    let stale = cache.request(&params("geneva")).await.unwrap();
    assert_eq!(stale, first);
    let err = cache.request(&params("basel")).await.unwrap_err();
    assert!(err.is_backing_off(), "nothing stale to serve for basel");
    assert_eq!(cache.backend().calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn uncached_requests_share_the_window() {
    let cache = RequestCache::new(Forecast::default());
    cache.backend().down.store(true, Ordering::SeqCst);

    cache.request_uncached(&params("lugano")).await.unwrap_err();
    let err = cache.request(&params("chur")).await.unwrap_err();
    assert!(err.is_backing_off());
    assert!(cache.is_empty());

    tokio::time::sleep(Duration::from_secs(15)).await;
    cache.backend().down.store(false, Ordering::SeqCst);
    cache.request_uncached(&params("lugano")).await.unwrap();
    assert!(cache.is_empty(), "uncached answers are not stored");
}
