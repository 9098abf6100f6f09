//! Token bucket record and its pure transitions.
//!
//! Every store applies exactly these transitions; the Redis store mirrors them in Lua.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Longest refill period a bucket may carry: one year.
pub const MAX_RATE_SECS: u64 = 365 * 24 * 60 * 60;

/// Persisted per-client bucket. Invariant: `0 <= current <= max_tokens`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    /// Seconds between refills.
    #[serde(rename = "refillRate")]
    pub rate: u64,
    #[serde(rename = "maxTokens")]
    pub max_tokens: i64,
    #[serde(rename = "currentTokens")]
    pub current: i64,
}

impl Bucket {
    /// Fresh bucket for a first-time client: one token to admit the request that created it.
    pub fn seeded(rate: u64, max_tokens: i64) -> Self {
        Self {
            rate,
            max_tokens,
            current: max_tokens.clamp(0, 1),
        }
    }

    /// Time between refills, clamped to `1..=MAX_RATE_SECS` so a bad stored rate cannot overflow a deadline.
    pub fn refill_period(&self) -> Duration {
        Duration::from_secs(self.rate.clamp(1, MAX_RATE_SECS))
    }

    /// Consume one token. Returns false when the bucket is empty.
    pub fn take(&mut self) -> bool {
        if self.current <= 0 {
            return false;
        }
        self.current -= 1;
        true
    }

    /// Add one token, capped at capacity.
    pub fn refill(&mut self) {
        if self.current < self.max_tokens {
            self.current += 1;
        }
        self.clamp();
    }

    pub fn apply(&mut self, settings: BucketSettings) {
        if let Some(rate) = settings.rate {
            self.rate = rate;
        }
        if let Some(max) = settings.max_tokens {
            self.max_tokens = max;
        }
        self.clamp();
    }

    fn clamp(&mut self) {
        self.current = self.current.clamp(0, self.max_tokens.max(0));
    }
}

/// Administrative change to a bucket; `None` leaves the field alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketSettings {
    pub rate: Option<u64>,
    pub max_tokens: Option<i64>,
}

impl BucketSettings {
    pub fn rate(rate: u64) -> Self {
        Self {
            rate: Some(rate),
            max_tokens: None,
        }
    }

    pub fn max_tokens(max: i64) -> Self {
        Self {
            rate: None,
            max_tokens: Some(max),
        }
    }
}

/// Result of an atomic consume attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeOutcome {
    Taken { remaining: i64 },
    Empty,
    Missing,
}
