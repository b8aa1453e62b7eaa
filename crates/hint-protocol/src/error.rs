use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::cache::CacheEntry;

/// Protocol-level errors for the telemetry core.
#[derive(Debug, thiserror::Error)]
pub enum HintProtocolError {
    #[error("compression failed: {0}")]
    Compression(String),

    #[error("runtime is shut down")]
    Shutdown,
}

/// Errors surfaced to callers of [`RequestCache::request`](crate::RequestCache::request).
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Upstream is in its backoff window and no stale data could be served.
    #[error("backing off from upstream for another {remaining:?}")]
    BackingOff { until: Instant, remaining: Duration },

    /// The backend failed and gave no underlying cause.
    #[error("upstream request failed: {message}")]
    Request { message: String },

    /// The cause the backend failure was raised from.
    #[error(transparent)]
    Upstream(anyhow::Error),
}

impl CacheError {
    pub(crate) fn backing_off(until: Instant, now: Instant) -> Self {
        CacheError::BackingOff {
            until,
            remaining: until.saturating_duration_since(now),
        }
    }

    pub fn is_backing_off(&self) -> bool {
        matches!(self, CacheError::BackingOff { .. })
    }
}

/// Failure reported by a [`RequestBackend`](crate::RequestBackend).
///
/// `back_off` engages (or extends) the shared backoff window. A fallback
/// entry is served instead of failing. Without one, the `cause` is
/// surfaced in place of this error unless `use_context` is cleared.
pub struct RequestError<D> {
    pub message: String,
    pub back_off: bool,
    pub fallback: Option<CacheEntry<D>>,
    pub cause: Option<anyhow::Error>,
    pub use_context: bool,
}

impl<D> RequestError<D> {
    /// Retryable failure; engages backoff.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            back_off: true,
            fallback: None,
            cause: None,
            use_context: true,
        }
    }

    /// Non-retryable failure; leaves the backoff window alone.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            back_off: false,
            ..Self::transient(message)
        }
    }

    /// Serve `entry` instead of failing.
    pub fn with_fallback(mut self, entry: CacheEntry<D>) -> Self {
        self.fallback = Some(entry);
        self
    }

    /// Record the error this failure was raised while handling.
    pub fn caused_by(mut self, cause: impl Into<anyhow::Error>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Surface this error itself, never the cause.
    pub fn without_context(mut self) -> Self {
        self.use_context = false;
        self
    }

    /// The error the cache reports when there is nothing to fall back to.
    pub(crate) fn into_surfaced(self) -> CacheError {
        match (self.use_context, self.cause) {
            (true, Some(cause)) => CacheError::Upstream(cause),
            _ => CacheError::Request {
                message: self.message,
            },
        }
    }
}

impl<D> fmt::Debug for RequestError<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestError")
            .field("message", &self.message)
            .field("back_off", &self.back_off)
            .field("has_fallback", &self.fallback.is_some())
            .field("cause", &self.cause)
            .finish()
    }
}

impl<D> fmt::Display for RequestError<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by: {cause})")?;
        }
        Ok(())
    }
}
