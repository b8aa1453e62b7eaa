/// Upstream scenario: a quota-limited API goes down for a while.
///
/// A poller asks the [`RequestCache`] for the same forecast every
/// `poll` interval, and for a second city every other poll. The simulated
/// upstream fails transiently inside the outage window. The emitted events
/// show the backoff window doubling, stale answers being served, and the
/// window resetting after the first success.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use hint_protocol::{
    BackoffConfig, CacheEntry, CacheError, RequestBackend, RequestCache, RequestCacheConfig, RequestError,
    RequestParams,
};

use crate::events::{emit, EventRequest, EventStarted, EventUpstreamSummary};

pub struct UpstreamConfig {
    pub duration: Duration,
    pub poll: Duration,
    pub ttl: Duration,
    pub outage_start: Duration,
    pub outage: Duration,
    pub backoff_start: Duration,
    pub backoff_max: Duration,
}

struct FlakyUpstream {
    started: Instant,
    ttl: Duration,
    outage: std::ops::Range<Duration>,
    calls: AtomicU64,
}

#[async_trait::async_trait]
impl RequestBackend for FlakyUpstream {
    type Data = String;

    async fn perform_request(
        &self,
        _previous: Option<CacheEntry<String>>,
        params: &RequestParams,
    ) -> Result<CacheEntry<String>, RequestError<String>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(20)).await;
        if self.outage.contains(&self.started.elapsed()) {
            return Err(RequestError::transient(format!("upstream unavailable (call {call})")));
        }
        Ok(CacheEntry::new(format!("{params} @ call {call}"))
            .expiring_in(self.ttl)
            .last_modified(call.to_string()))
    }

    fn backing_off_result(
        &self,
        previous: Option<&CacheEntry<String>>,
        _params: &RequestParams,
    ) -> Option<CacheEntry<String>> {
        previous.cloned()
    }
}

#[derive(Default)]
struct Tally {
    fresh: u32,
    cached: u32,
    stale: u32,
    backing_off: u32,
    errors: u32,
}

pub async fn run(config: UpstreamConfig) -> anyhow::Result<()> {
    emit(&EventStarted::new("upstream"));
    let start = Instant::now();

    let backend = FlakyUpstream {
        started: start,
        ttl: config.ttl,
        outage: config.outage_start..config.outage_start + config.outage,
        calls: AtomicU64::new(0),
    };
    let cache = RequestCache::with_config(
        backend,
        RequestCacheConfig {
            backoff: BackoffConfig {
                start: config.backoff_start,
                base: 2,
                max: config.backoff_max,
            },
        },
    );

    let cities = [
        RequestParams::new().with("q", "zurich").with("units", "metric"),
        RequestParams::new().with("q", "lausanne").with("units", "metric"),
    ];

    let mut tally = Tally::default();
    let mut seq = 0u32;
    let mut poll = tokio::time::interval(config.poll);
    while start.elapsed() < config.duration {
        poll.tick().await;
        let params = &cities[(seq % 2) as usize];
        seq += 1;

        let calls_before = cache.backend().calls.load(Ordering::SeqCst);
        let result = cache.request(params).await;
        let upstream_calls = cache.backend().calls.load(Ordering::SeqCst);
        let called = upstream_calls > calls_before;
        let backing_off = cache.backing_off_until();

        let outcome = match (&result, called) {
            (Ok(_), true) => {
                tally.fresh += 1;
                "fresh"
            }
            (Ok(_), false) if backing_off.is_some() => {
                tally.stale += 1;
                "stale"
            }
            (Ok(_), false) => {
                tally.cached += 1;
                "cached"
            }
            (Err(CacheError::BackingOff { .. }), _) => {
                tally.backing_off += 1;
                "backing_off"
            }
            (Err(err), _) => {
                tracing::debug!(%params, error = %err, "request failed");
                tally.errors += 1;
                "error"
            }
        };

        emit(&EventRequest {
            event: "request",
            seq,
            outcome,
            backoff_remaining_ms: backing_off.map(|until| {
                until
                    .saturating_duration_since(tokio::time::Instant::now())
                    .as_millis() as u64
            }),
            upstream_calls,
            elapsed_s: start.elapsed().as_secs_f64(),
        });
    }

    emit(&EventUpstreamSummary {
        event: "summary",
        requests: seq,
        upstream_calls: cache.backend().calls.load(Ordering::SeqCst),
        fresh: tally.fresh,
        cached: tally.cached,
        stale: tally.stale,
        backing_off: tally.backing_off,
        errors: tally.errors,
        duration_s: start.elapsed().as_secs_f64(),
    });
    Ok(())
}
