use std::collections::HashMap;
use std::time::Duration;

use cookie::{Cookie, SameSite};
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;

pub const THROTTLE_COOKIE_PREFIX: &str = "prewarm_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// The caller should store `set_cookie` so the next call inside the window is throttled.
    Allowed { set_cookie: String },
    Throttled { remaining: Duration },
}

impl ThrottleDecision {
    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Throttled { .. })
    }
}

/// Per-caller throttle kept in a short-lived cookie holding the last run's unix time.
#[derive(Debug, Clone, Copy)]
pub struct CookieThrottle {
    cooldown: Duration,
}

impl CookieThrottle {
    pub fn new(cooldown: Duration) -> Self {
        Self { cooldown }
    }

    pub fn cookie_name(scope: &str) -> String {
        format!("{THROTTLE_COOKIE_PREFIX}{scope}")
    }

    pub fn check(
        &self,
        cookies: &HashMap<String, String>,
        scope: &str,
        now_unix: i64,
    ) -> ThrottleDecision {
        let name = Self::cookie_name(scope);
        let cooldown_secs = self.cooldown.as_secs() as i64;
        let last_run = cookies
            .get(&name)
            .and_then(|raw| raw.trim().parse::<i64>().ok());

        if let Some(last_run) = last_run {
            let elapsed = now_unix.saturating_sub(last_run);
            if (0..cooldown_secs).contains(&elapsed) {
                return ThrottleDecision::Throttled {
                    remaining: Duration::from_secs((cooldown_secs - elapsed) as u64),
                };
            }
        }

        let marker = Cookie::build((name, now_unix.to_string()))
            .max_age(cookie::time::Duration::seconds(cooldown_secs))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .build();
        ThrottleDecision::Allowed {
            set_cookie: marker.encoded().to_string(),
        }
    }
}

/// Server-side cooldown: at most one acquisition per key per window. A zero cooldown disables it.
pub struct CooldownGate {
    limiter: Option<DefaultKeyedRateLimiter<String>>,
    clock: DefaultClock,
}

impl CooldownGate {
    pub fn new(cooldown: Duration) -> Self {
        let limiter = Quota::with_period(cooldown)
            .map(|quota| RateLimiter::keyed(quota.allow_burst(nonzero!(1u32))));
        Self {
            limiter,
            clock: DefaultClock::default(),
        }
    }

    /// Consumes the slot for `key`, or returns how long until it frees up.
    pub fn try_acquire(&self, key: &str) -> Result<(), Duration> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };
        limiter.retain_recent();
        limiter
            .check_key(&key.to_string())
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }

    /// Keys currently holding a slot.
    pub fn tracked_keys(&self) -> usize {
        self.limiter.as_ref().map_or(0, |limiter| limiter.len())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use cookie::Cookie;

    use super::{CookieThrottle, CooldownGate, ThrottleDecision};

    #[test]
    fn missing_or_old_cookie_allows_and_sets_marker() {
        let throttle = CookieThrottle::new(Duration::from_secs(120));
        let mut cookies = HashMap::new();

        let fresh = throttle.check(&cookies, "full", 1_000);
        cookies.insert("prewarm_full".to_string(), "800".to_string());
        let old = throttle.check(&cookies, "full", 1_000);

        let ThrottleDecision::Allowed { set_cookie } = fresh else {
            panic!("fresh caller is allowed");
        };
        let marker = Cookie::parse(set_cookie).expect("valid set-cookie");
        assert_eq!(marker.name(), "prewarm_full");
        assert_eq!(marker.value(), "1000");
        assert_eq!(marker.max_age(), Some(cookie::time::Duration::seconds(120)));
        assert_eq!(marker.path(), Some("/"));
        assert_eq!(marker.http_only(), Some(true));
        assert!(!old.is_throttled());
    }

    #[test]
    fn recent_cookie_throttles_only_its_own_mode() {
        let throttle = CookieThrottle::new(Duration::from_secs(120));
        let cookies = HashMap::from([("prewarm_full".to_string(), "950".to_string())]);

        assert_eq!(
            throttle.check(&cookies, "full", 1_000),
            ThrottleDecision::Throttled {
                remaining: Duration::from_secs(70)
            }
        );
        assert!(!throttle.check(&cookies, "thumbs", 1_000).is_throttled());
    }

    #[test]
    fn cooldown_gate_reports_the_remaining_window() {
        let gate = CooldownGate::new(Duration::from_secs(60));

        assert!(gate.try_acquire("owner:fix_owner_card").is_ok());
        let remaining = gate
            .try_acquire("owner:fix_owner_card")
            .expect_err("second run is throttled");
        assert!(remaining > Duration::from_secs(58));
        assert!(remaining <= Duration::from_secs(60));
        assert!(gate.try_acquire("owner:unlock_thumbs").is_ok());
    }

    #[tokio::test]
    async fn cooldown_gate_frees_and_forgets_keys_after_window() {
        let gate = CooldownGate::new(Duration::from_millis(100));

        assert!(gate.try_acquire("owner-1:fix_owner_card").is_ok());
        assert!(gate.try_acquire("owner-2:fix_owner_card").is_ok());
        assert!(gate.try_acquire("owner-1:fix_owner_card").is_err());
        assert_eq!(gate.tracked_keys(), 2);

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(gate.try_acquire("owner-1:fix_owner_card").is_ok());
        assert_eq!(gate.tracked_keys(), 1);
    }

    #[test]
    fn zero_cooldown_never_throttles() {
        let gate = CooldownGate::new(Duration::ZERO);

        assert!(gate.try_acquire("owner:unlock_thumbs").is_ok());
        assert!(gate.try_acquire("owner:unlock_thumbs").is_ok());
        assert_eq!(gate.tracked_keys(), 0);
    }
}
