//! Hierarchical admission control.
//!
//! A request is admitted only when every applicable bucket has a token:
//!
//! ```text
//! global ─▶ operation (if limited) ─▶ caller-global ─▶ caller-operation (if limited)
//! ```
//!
//! The first empty bucket aborts the chain and every bucket debited before it
//! is credited back in reverse order, so a rejected request costs nothing.
//! Anonymous requests (no caller id) stop after the operation tier.
//!
//! Each bucket debit and credit is atomic on its own; a partially rejected
//! chain is not atomic across buckets. A concurrent request may briefly see a
//! token that is about to be refunded as missing and be rejected. It can never
//! be admitted on a token it should not have had.

mod bucket;
mod sweeper;

pub use bucket::TokenBucket;
pub use sweeper::CallerSweeper;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::types::{CallerId, Error, LimitScope, QueryContext, RateLimitConfig, Result};

/// One caller's buckets. Per-operation buckets are created on first use.
#[derive(Debug)]
pub struct CallerRecord {
    global: TokenBucket,
    operations: HashMap<String, TokenBucket>,
    last_seen: Instant,
}

impl CallerRecord {
    fn new(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            global: TokenBucket::new_at(config.burst_size, config.tokens_per_second(), now),
            operations: HashMap::new(),
            last_seen: now,
        }
    }

    fn touch(&mut self, now: Instant) {
        if now > self.last_seen {
            self.last_seen = now;
        }
    }
}

/// Remaining tokens in one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketStatus {
    pub capacity: u32,
    pub tokens: f64,
    pub refill_per_second: f64,
}

impl BucketStatus {
    fn of(bucket: &TokenBucket, now: Instant) -> Self {
        Self {
            capacity: bucket.capacity(),
            tokens: bucket.tokens_at(now),
            refill_per_second: bucket.refill_rate(),
        }
    }
}

/// One tracked caller in a status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallerStatus {
    pub global: BucketStatus,
    pub operations: BTreeMap<String, BucketStatus>,
    #[serde(with = "humantime_serde")]
    pub idle: Duration,
}

/// Point-in-time view of the limiter. Taking it consumes no tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterStatus {
    pub enabled: bool,
    pub requests_per_minute: u32,
    pub burst_size: u32,
    pub global: BucketStatus,
    pub operations: BTreeMap<String, BucketStatus>,
    pub tracked_callers: usize,
    pub callers: BTreeMap<String, CallerStatus>,
    pub generated_at: DateTime<Utc>,
}

/// Three-tier token bucket rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    global: TokenBucket,
    operations: HashMap<String, TokenBucket>,
    callers: Mutex<HashMap<CallerId, CallerRecord>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::new_at(config, Instant::now())
    }

    /// Build a limiter whose buckets start full at `now`.
    pub fn new_at(config: RateLimitConfig, now: Instant) -> Self {
        let global = TokenBucket::new_at(config.burst_size, config.tokens_per_second(), now);
        let operations = config
            .per_operation_limits
            .iter()
            .map(|(op, &rpm)| (op.clone(), operation_bucket(&config, rpm, now)))
            .collect();

        Self {
            config,
            global,
            operations,
            callers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Admit or reject one request. Never blocks waiting for tokens.
    pub fn allow(&self, caller: Option<&CallerId>, operation: &str) -> Result<()> {
        self.allow_at(caller, operation, Instant::now())
    }

    pub fn allow_at(&self, caller: Option<&CallerId>, operation: &str, now: Instant) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let reject = |scope: LimitScope| {
            tracing::debug!(
                scope = %scope,
                operation = operation,
                caller = caller.map(CallerId::as_str).unwrap_or(""),
                "request_rate_limited"
            );
            Error::RateLimitExceeded {
                scope,
                context: QueryContext::new(operation).with_caller(caller.cloned()),
            }
        };

        if !self.global.try_acquire_at(now) {
            return Err(reject(LimitScope::Global));
        }

        let shared_operation = self.operations.get(operation);
        if let Some(bucket) = shared_operation {
            if !bucket.try_acquire_at(now) {
                self.global.credit_at(now);
                return Err(reject(LimitScope::Operation));
            }
        }

        let Some(caller) = caller else {
            return Ok(());
        };

        let mut callers = self.lock_callers();
        let record = callers
            .entry(caller.clone())
            .or_insert_with(|| CallerRecord::new(&self.config, now));
        record.touch(now);

        if !record.global.try_acquire_at(now) {
            drop(callers);
            self.refund_shared(shared_operation, now);
            return Err(reject(LimitScope::Caller));
        }

        if let Some(&rpm) = self.config.per_operation_limits.get(operation) {
            let bucket = record
                .operations
                .entry(operation.to_string())
                .or_insert_with(|| operation_bucket(&self.config, rpm, now));
            if !bucket.try_acquire_at(now) {
                record.global.credit_at(now);
                drop(callers);
                self.refund_shared(shared_operation, now);
                return Err(reject(LimitScope::Caller));
            }
        }

        Ok(())
    }

    /// Credit the operation and global buckets, in that order.
    fn refund_shared(&self, shared_operation: Option<&TokenBucket>, now: Instant) {
        if let Some(bucket) = shared_operation {
            bucket.credit_at(now);
        }
        self.global.credit_at(now);
    }

    /// Forget callers idle for longer than the configured timeout.
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now(), self.config.caller_idle_timeout)
    }

    /// Forget callers whose last admission check is more than `threshold` before `now`.
    pub fn evict_idle_at(&self, now: Instant, threshold: Duration) -> usize {
        let mut callers = self.lock_callers();
        let before = callers.len();
        callers.retain(|_, record| now.saturating_duration_since(record.last_seen) <= threshold);
        before - callers.len()
    }

    /// Number of callers currently tracked.
    pub fn tracked_callers(&self) -> usize {
        self.lock_callers().len()
    }

    pub fn status(&self) -> LimiterStatus {
        self.status_at(Instant::now())
    }

    pub fn status_at(&self, now: Instant) -> LimiterStatus {
        let operations = self
            .operations
            .iter()
            .map(|(op, bucket)| (op.clone(), BucketStatus::of(bucket, now)))
            .collect();

        let callers = self.lock_callers();
        let caller_statuses: BTreeMap<String, CallerStatus> = callers
            .iter()
            .map(|(id, record)| {
                let status = CallerStatus {
                    global: BucketStatus::of(&record.global, now),
                    operations: record
                        .operations
                        .iter()
                        .map(|(op, bucket)| (op.clone(), BucketStatus::of(bucket, now)))
                        .collect(),
                    idle: now.saturating_duration_since(record.last_seen),
                };
                (id.to_string(), status)
            })
            .collect();

        LimiterStatus {
            enabled: self.config.enabled,
            requests_per_minute: self.config.requests_per_minute,
            burst_size: self.config.burst_size,
            global: BucketStatus::of(&self.global, now),
            operations,
            tracked_callers: callers.len(),
            callers: caller_statuses,
            generated_at: Utc::now(),
        }
    }

    /// Refill the shared buckets and forget every caller.
    pub fn reset(&self) {
        self.global.reset();
        for bucket in self.operations.values() {
            bucket.reset();
        }
        self.lock_callers().clear();
        tracing::info!("rate_limiter_reset");
    }

    fn lock_callers(&self) -> MutexGuard<'_, HashMap<CallerId, CallerRecord>> {
        self.callers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn operation_bucket(config: &RateLimitConfig, rpm: u32, now: Instant) -> TokenBucket {
    TokenBucket::new_at(config.operation_burst(rpm), f64::from(rpm) / 60.0, now)
}
