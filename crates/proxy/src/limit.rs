//! Per-client rate limiting.
//!
//! Each rate-limited listener owns one [`RateLimiter`]: a table of token
//! buckets keyed by client IP plus a ban map. A request costs one token;
//! when the bucket is empty and a ban window is configured, the client is
//! banned and subsequent requests are rejected without touching tokens.
//! Both tables are size-bounded with LRU eviction so spoofed sources cannot
//! grow memory; timing uses the monotonic clock only.

use parking_lot::Mutex;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use portico_common::BoundedTable;
use portico_config::RateLimit;

/// Maximum token buckets tracked per listener.
const MAX_BUCKETS: usize = 65_536;
/// Maximum concurrent bans tracked per listener.
const MAX_BANS: usize = 16_384;
/// Buckets idle this long are dropped by the sweeper.
const BUCKET_IDLE: Duration = Duration::from_secs(600);

/// Outcome of a rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Over the limit. `newly_banned` is set on the transition into a ban
    /// window so the caller can persist the ban exactly once.
    Limited { newly_banned: bool },
    /// Rejected because an earlier violation banned this client.
    Banned,
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            last_seen: now,
        }
    }

    fn try_consume(&mut self, capacity: f64, refill_per_sec: f64, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(capacity);
        self.last_refill = now;
        self.last_seen = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Token-bucket limiter for one listener.
pub struct RateLimiter {
    rps: f64,
    burst: f64,
    ban_window: Option<Duration>,
    buckets: Mutex<BoundedTable<IpAddr, TokenBucket>>,
    bans: Mutex<BoundedTable<IpAddr, Instant>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimit) -> Self {
        Self {
            rps: f64::from(config.rps.max(1)),
            burst: f64::from(config.burst.max(1)),
            ban_window: (config.ban_seconds > 0)
                .then(|| Duration::from_secs(config.ban_seconds)),
            buckets: Mutex::new(BoundedTable::new(MAX_BUCKETS)),
            bans: Mutex::new(BoundedTable::new(MAX_BANS)),
        }
    }

    /// The ban window length, if banning is configured.
    pub fn ban_window(&self) -> Option<Duration> {
        self.ban_window
    }

    /// Charge one request to `ip`.
    pub fn check(&self, ip: IpAddr) -> RateDecision {
        let now = Instant::now();

        if self.ban_window.is_some() {
            let mut bans = self.bans.lock();
            if let Some(until) = bans.get_mut(&ip) {
                if *until > now {
                    return RateDecision::Banned;
                }
                bans.remove(&ip);
            }
        }

        let allowed = {
            let mut buckets = self.buckets.lock();
            let bucket = buckets.get_or_insert_with(ip, || TokenBucket::new(self.burst, now));
            bucket.try_consume(self.burst, self.rps, now)
        };

        if allowed {
            return RateDecision::Allowed;
        }

        match self.ban_window {
            Some(window) => {
                self.bans.lock().insert(ip, now + window);
                RateDecision::Limited { newly_banned: true }
            }
            None => RateDecision::Limited { newly_banned: false },
        }
    }

    /// Drop idle buckets and expired bans. Run from periodic maintenance.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.buckets
            .lock()
            .retain(|_, b| now.duration_since(b.last_seen) < BUCKET_IDLE);
        self.bans.lock().retain(|_, until| *until > now);
    }

    #[cfg(test)]
    fn tracked_buckets(&self) -> usize {
        self.buckets.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn limiter(rps: u32, burst: u32, ban_seconds: u64) -> RateLimiter {
        RateLimiter::new(&RateLimit {
            rps,
            burst,
            ban_seconds,
        })
    }

    #[test]
    fn burst_then_limited() {
        let rl = limiter(1, 2, 0);
        let client = ip("1.2.3.4");

        assert_eq!(rl.check(client), RateDecision::Allowed);
        assert_eq!(rl.check(client), RateDecision::Allowed);
        assert_eq!(rl.check(client), RateDecision::Limited { newly_banned: false });
    }

    #[test]
    fn ban_transition_reported_once_and_sticks() {
        let rl = limiter(1, 1, 5);
        let client = ip("1.2.3.4");

        assert_eq!(rl.check(client), RateDecision::Allowed);
        assert_eq!(rl.check(client), RateDecision::Limited { newly_banned: true });
        // Later requests see the standing ban without re-reporting it.
        assert_eq!(rl.check(client), RateDecision::Banned);
        assert_eq!(rl.check(client), RateDecision::Banned);
    }

    #[test]
    fn refill_restores_tokens() {
        let rl = limiter(20, 1, 0);
        let client = ip("1.2.3.4");

        assert_eq!(rl.check(client), RateDecision::Allowed);
        assert_eq!(rl.check(client), RateDecision::Limited { newly_banned: false });

        // 20 rps refills one token in 50ms.
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(rl.check(client), RateDecision::Allowed);
    }

    #[test]
    fn clients_are_independent() {
        let rl = limiter(1, 1, 0);
        assert_eq!(rl.check(ip("1.1.1.1")), RateDecision::Allowed);
        assert_eq!(rl.check(ip("2.2.2.2")), RateDecision::Allowed);
        assert_eq!(rl.check(ip("1.1.1.1")), RateDecision::Limited { newly_banned: false });
    }

    #[test]
    fn sweep_drops_expired_bans() {
        let rl = limiter(1, 1, 1);
        let client = ip("1.2.3.4");
        rl.check(client);
        rl.check(client);

        std::thread::sleep(Duration::from_millis(1100));
        rl.sweep();
        // Ban expired; bucket refilled one token over the elapsed second.
        assert_eq!(rl.check(client), RateDecision::Allowed);
    }

    #[test]
    fn bucket_table_stays_bounded() {
        let rl = limiter(1, 1, 0);
        for i in 0..100u32 {
            let addr = IpAddr::from([10, 0, (i >> 8) as u8, (i & 0xff) as u8]);
            rl.check(addr);
        }
        assert!(rl.tracked_buckets() <= MAX_BUCKETS);
    }
}
