//! # Rate limiter
//! Token bucket guarding the inbound request path.
//!
//! Refill is lazy: tokens are topped up from the elapsed time whenever the
//! bucket is consulted. All reads and writes of one bucket happen under a
//! single mutex, so concurrent callers never double-spend a token.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;

#[derive(Debug)]
pub struct TokenBucket {
    inner: Mutex<BucketState>,
    capacity: f64,
    /// Tokens per second.
    refill_rate: f64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Full bucket of `capacity` tokens refilled at `refill_rate` tokens/second.
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self::starting_at(capacity, refill_rate, Instant::now())
    }

    /// Like [`TokenBucket::new`] with an explicit start instant.
    pub fn starting_at(capacity: f64, refill_rate: f64, now: Instant) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            inner: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: now,
            }),
            capacity,
            refill_rate: refill_rate.max(0.0),
        }
    }

    /// Bucket sized from a per-minute budget, e.g. 60 rpm with burst 20.
    pub fn per_minute(requests_per_minute: u32, burst_size: u32) -> Self {
        Self::new(burst_size as f64, requests_per_minute as f64 / 60.0)
    }

    /// Take one token if available.
    pub fn consume(&self) -> bool {
        self.consume_at(Instant::now())
    }

    pub fn consume_at(&self, now: Instant) -> bool {
        let mut st = self.inner.lock().expect("token bucket mutex poisoned");
        self.refill(&mut st, now);
        if st.tokens >= 1.0 {
            st.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens available at `now`, after refill.
    pub fn available_at(&self, now: Instant) -> f64 {
        let mut st = self.inner.lock().expect("token bucket mutex poisoned");
        self.refill(&mut st, now);
        st.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Time needed to accumulate one whole token from empty.
    pub fn refill_interval(&self) -> Option<Duration> {
        (self.refill_rate > 0.0).then(|| Duration::from_secs_f64(1.0 / self.refill_rate))
    }

    fn refill(&self, st: &mut BucketState, now: Instant) {
        // Instants older than the last refill add nothing.
        let elapsed = now.saturating_duration_since(st.last_refill).as_secs_f64();
        st.tokens = (st.tokens + elapsed * self.refill_rate).min(self.capacity);
        if now > st.last_refill {
            st.last_refill = now;
        }
    }
}

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ratelimit_rejected_total", "Requests rejected with 429.");
    });
}

#[derive(serde::Serialize)]
struct ThrottledBody {
    error: &'static str,
}

/// Axum middleware: admit the request if a token is available, else 429.
pub async fn enforce(
    State(limiter): State<Arc<TokenBucket>>,
    req: Request,
    next: Next,
) -> Response {
    if limiter.consume() {
        return next.run(req).await;
    }

    ensure_metrics_described();
    counter!("ratelimit_rejected_total").increment(1);
    tracing::debug!(target: "ratelimit", path = %req.uri().path(), "rate limit exceeded");
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(ThrottledBody {
            error: "Rate limit exceeded. Please try again later.",
        }),
    )
        .into_response()
}
