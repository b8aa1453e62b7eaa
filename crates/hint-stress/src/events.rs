use std::io::Write;

use hint_metrics::ChannelSnapshot;
use serde::Serialize;

/// Emit a JSONL event to stdout (flushed immediately for piped output).
pub fn emit<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{json}");
        let _ = lock.flush();
    }
}

/// RFC 3339 timestamp for JSONL events.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ── Session events ──────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventStarted {
    pub event: &'static str,
    pub mode: String,
    pub timestamp: String,
}

impl EventStarted {
    pub fn new(mode: &str) -> Self {
        Self {
            event: "started",
            mode: mode.to_string(),
            timestamp: now_iso(),
        }
    }
}

// ── Pipeline events ─────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventPresence {
    pub event: &'static str,
    pub resource: Option<String>,
    pub elapsed_s: f64,
}

impl EventPresence {
    pub fn new(resource: Option<&str>, elapsed_s: f64) -> Self {
        Self {
            event: "presence",
            resource: resource.map(str::to_string),
            elapsed_s,
        }
    }
}

#[derive(Serialize)]
pub struct EventChannels {
    pub event: &'static str,
    pub locked_to: Option<String>,
    pub batches: ChannelSnapshot,
    pub stream: ChannelSnapshot,
    pub delivered: usize,
    pub elapsed_s: f64,
}

impl EventChannels {
    pub fn new(
        locked_to: Option<String>,
        batches: ChannelSnapshot,
        stream: ChannelSnapshot,
        delivered: usize,
        elapsed_s: f64,
    ) -> Self {
        Self {
            event: "channels",
            locked_to,
            batches,
            stream,
            delivered,
            elapsed_s,
        }
    }
}

#[derive(Serialize)]
pub struct EventPipelineSummary {
    pub event: &'static str,
    pub batches_produced: u64,
    pub blocks_produced: u64,
    pub blocks_released: u64,
    pub delivered: usize,
    pub batches: ChannelSnapshot,
    pub stream: ChannelSnapshot,
    pub duration_s: f64,
}

// ── Upstream events ─────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventRequest {
    pub event: &'static str,
    pub seq: u32,
    /// `fresh`, `cached`, `stale`, `backing_off` or `error`.
    pub outcome: &'static str,
    pub backoff_remaining_ms: Option<u64>,
    pub upstream_calls: u64,
    pub elapsed_s: f64,
}

#[derive(Serialize)]
pub struct EventUpstreamSummary {
    pub event: &'static str,
    pub requests: u32,
    pub upstream_calls: u64,
    pub fresh: u32,
    pub cached: u32,
    pub stale: u32,
    pub backing_off: u32,
    pub errors: u32,
    pub duration_s: f64,
}
