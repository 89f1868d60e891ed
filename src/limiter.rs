use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::debug;

use crate::resolver::TenantContext;

/// Per-tenant token-bucket admission control with dynamic capacity.
///
/// The outer map lock is held only long enough to fetch or create a bucket
/// handle; consumption runs under the bucket's own lock, so buckets are
/// independent and contention is bounded by per-tenant request rate.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Arc<Mutex<TokenBucket>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or reject one request for the tenant in `context`, using the
    /// context's quota policy. Policy changes take effect here: capacity
    /// is updated in place and the balance clamped down to a reduced
    /// burst, never increased.
    pub fn try_consume(&self, context: &TenantContext) -> bool {
        let rpm_limit = context.quota_policy.rpm_limit.max(1);
        let burst_capacity = context.quota_policy.burst_capacity().max(1);

        let bucket = {
            let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");
            Arc::clone(buckets.entry(context.tenant_id.clone()).or_insert_with(|| {
                debug!(
                    tenant_id = %context.tenant_id,
                    rpm = rpm_limit,
                    burst = burst_capacity,
                    "creating rate-limit bucket"
                );
                Arc::new(Mutex::new(TokenBucket::new(rpm_limit, burst_capacity)))
            }))
        };

        let mut bucket = bucket.lock().expect("rate limiter bucket lock poisoned");
        if bucket.rpm_limit != rpm_limit || bucket.burst_capacity != burst_capacity {
            debug!(
                tenant_id = %context.tenant_id,
                rpm = rpm_limit,
                burst = burst_capacity,
                "updating rate-limit bucket capacity"
            );
            bucket.update_capacity(rpm_limit, burst_capacity);
        }
        let admitted = bucket.try_consume_at(Instant::now());
        if !admitted {
            debug!(tenant_id = %context.tenant_id, rpm = rpm_limit, "rate limit exceeded");
        }
        admitted
    }

    /// Remaining tokens for a tenant, for diagnostics.
    pub fn available_tokens(&self, tenant_id: &str) -> Option<f64> {
        let bucket = {
            let buckets = self.buckets.lock().expect("rate limiter lock poisoned");
            buckets.get(tenant_id).cloned()
        }?;
        let bucket = bucket.lock().expect("rate limiter bucket lock poisoned");
        Some(bucket.tokens)
    }

    /// Drop a tenant's bucket, e.g. when the tenant is deleted.
    pub fn clear_bucket(&self, tenant_id: &str) {
        self.buckets
            .lock()
            .expect("rate limiter lock poisoned")
            .remove(tenant_id);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

struct TokenBucket {
    rpm_limit: u32,
    burst_capacity: u32,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rpm_limit: u32, burst_capacity: u32) -> Self {
        let burst_capacity = burst_capacity.max(1);
        Self {
            rpm_limit: rpm_limit.max(1),
            burst_capacity,
            // Buckets start full.
            tokens: f64::from(burst_capacity),
            last_refill: Instant::now(),
        }
    }

    fn try_consume_at(&mut self, now: Instant) -> bool {
        self.refill_at(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill_at(&mut self, now: Instant) {
        // Monotonic clock; an earlier `now` contributes nothing.
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let added = elapsed.as_secs_f64() * f64::from(self.rpm_limit) / 60.0;
        if added > 0.0 {
            self.tokens = (self.tokens + added).min(f64::from(self.burst_capacity));
            self.last_refill = now;
        }
    }

    fn update_capacity(&mut self, rpm_limit: u32, burst_capacity: u32) {
        self.rpm_limit = rpm_limit.max(1);
        self.burst_capacity = burst_capacity.max(1);
        if self.tokens > f64::from(self.burst_capacity) {
            self.tokens = f64::from(self.burst_capacity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::QuotaPolicy;
    use std::time::Duration;

    fn context(tenant_id: &str, rpm_limit: u32, burst_multiplier: f64) -> TenantContext {
        TenantContext {
            tenant_id: tenant_id.to_string(),
            user_id: "u1".to_string(),
            plan: "basic".to_string(),
            quota_policy: QuotaPolicy {
                rpm_limit,
                tpm_limit: None,
                monthly_token_cap: None,
                burst_multiplier,
            },
        }
    }

    #[test]
    fn admits_exactly_burst_capacity_at_infinite_rate() {
        let mut bucket = TokenBucket::new(2, 2);
        let now = Instant::now();

        assert!(bucket.try_consume_at(now));
        assert!(bucket.try_consume_at(now));
        assert!(!bucket.try_consume_at(now));

        // 2 rpm refills one token per 30 seconds.
        let later = now + Duration::from_secs(30);
        assert!(bucket.try_consume_at(later));
        assert!(!bucket.try_consume_at(later));
    }

    #[test]
    fn refill_rate_is_rpm_over_sixty_and_capped_at_burst() {
        let mut bucket = TokenBucket::new(60, 90);
        let now = Instant::now();
        // Anchor the refill clock at `now` so elapsed times below are exact.
        bucket.refill_at(now);

        // Drain the bucket completely.
        for _ in 0..90 {
            assert!(bucket.try_consume_at(now));
        }
        assert!(!bucket.try_consume_at(now));

        // 10 seconds at 60 rpm refills 10 tokens, minus the one consumed.
        bucket.refill_at(now + Duration::from_secs(10));
        assert!((bucket.tokens - 10.0).abs() < 0.001);

        // A long idle period never exceeds burst capacity.
        bucket.refill_at(now + Duration::from_secs(3_600));
        assert!((bucket.tokens - 90.0).abs() < f64::EPSILON);
    }

    #[test]
    fn capacity_decrease_clamps_outstanding_tokens() {
        let mut bucket = TokenBucket::new(100, 200);
        assert!((bucket.tokens - 200.0).abs() < f64::EPSILON);

        bucket.update_capacity(1, 1);
        assert!((bucket.tokens - 1.0).abs() < f64::EPSILON);

        // An increase never manufactures tokens.
        bucket.tokens = 0.5;
        bucket.update_capacity(100, 200);
        assert!((bucket.tokens - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_valued_policies_floor_at_one() {
        let bucket = TokenBucket::new(0, 0);
        assert_eq!(bucket.rpm_limit, 1);
        assert_eq!(bucket.burst_capacity, 1);
    }

    #[test]
    fn limiter_enforces_burst_per_tenant() {
        let limiter = RateLimiter::new();
        let ctx = context("t1", 2, 1.0);

        assert!(limiter.try_consume(&ctx));
        assert!(limiter.try_consume(&ctx));
        assert!(!limiter.try_consume(&ctx));

        // Another tenant has an independent bucket.
        let other = context("t2", 2, 1.0);
        assert!(limiter.try_consume(&other));
    }

    #[test]
    fn policy_change_applies_to_existing_bucket() {
        let limiter = RateLimiter::new();

        // Fill a large bucket, then shrink the policy: the clamped bucket
        // admits only the reduced burst.
        let big = context("t1", 100, 2.0);
        assert!(limiter.try_consume(&big));
        assert!(limiter.available_tokens("t1").unwrap() > 100.0);

        let small = context("t1", 1, 1.0);
        assert!(limiter.try_consume(&small));
        assert!(!limiter.try_consume(&small));
    }

    #[test]
    fn clear_bucket_forgets_state() {
        let limiter = RateLimiter::new();
        let ctx = context("t1", 1, 1.0);
        assert!(limiter.try_consume(&ctx));
        assert!(!limiter.try_consume(&ctx));

        limiter.clear_bucket("t1");
        assert!(limiter.try_consume(&ctx));
    }
}
