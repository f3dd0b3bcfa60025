use crate::config::{RateLimitConfig, RateLimitSettings};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const GC_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateScope {
    Http,
    Connect,
}

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Clone)]
struct RateState {
    stamps: VecDeque<Instant>,
    blocked_until: Option<Instant>,
    last_seen: Instant,
}

impl RateState {
    fn new(now: Instant) -> Self {
        Self {
            stamps: VecDeque::new(),
            blocked_until: None,
            last_seen: now,
        }
    }
}

pub struct RateLimiter {
    http: Mutex<HashMap<String, RateState>>,
    connect: Mutex<HashMap<String, RateState>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            http: Mutex::new(HashMap::new()),
            connect: Mutex::new(HashMap::new()),
            config: config.clone(),
        }
    }

    /// Records a hit for the identity and decides whether it may proceed.
    pub async fn check(&self, scope: RateScope, identity: &str) -> RateDecision {
        let (bucket, settings) = match scope {
            RateScope::Http => (&self.http, &self.config.http),
            RateScope::Connect => (&self.connect, &self.config.connect),
        };
        let now = Instant::now();
        let mut states = bucket.lock().await;
        if states.len() > GC_THRESHOLD {
            let horizon = settings.window + settings.penalty;
            states.retain(|_, state| now.duration_since(state.last_seen) < horizon);
        }
        let state = states
            .entry(identity.to_string())
            .or_insert_with(|| RateState::new(now));
        state.last_seen = now;
        if let Some(blocked_until) = state.blocked_until {
            if blocked_until > now {
                return RateDecision {
                    allowed: false,
                    retry_after: Some(blocked_until.duration_since(now)),
                };
            }
            state.blocked_until = None;
            state.stamps.clear();
        }
        while let Some(oldest) = state.stamps.front() {
            if now.duration_since(*oldest) >= settings.window {
                state.stamps.pop_front();
            } else {
                break;
            }
        }
        if (state.stamps.len() as u32) < settings.burst {
            state.stamps.push_back(now);
            return RateDecision {
                allowed: true,
                retry_after: None,
            };
        }
        if settings.penalty > Duration::ZERO {
            state.blocked_until = Some(now + settings.penalty);
            return RateDecision {
                allowed: false,
                retry_after: Some(settings.penalty),
            };
        }
        let retry_after = state
            .stamps
            .front()
            .map(|oldest| settings.window.saturating_sub(now.duration_since(*oldest)));
        RateDecision {
            allowed: false,
            retry_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn tight_config() -> RateLimitConfig {
        let settings = RateLimitSettings {
            burst: 3,
            window: Duration::from_millis(40),
            penalty: Duration::from_millis(60),
        };
        RateLimitConfig {
            http: settings.clone(),
            connect: settings,
        }
    }

    async fn exhaust(limiter: &RateLimiter, scope: RateScope, addr: &str, n: u32) {
        for _ in 0..n {
            assert!(limiter.check(scope, addr).await.allowed);
        }
    }

    #[tokio::test]
    async fn burst_allows_up_to_limit() {
        let limiter = RateLimiter::new(&tight_config());
        exhaust(&limiter, RateScope::Http, "10.0.0.1:4000", 3).await;
        assert!(!limiter.check(RateScope::Http, "10.0.0.1:4000").await.allowed);
    }

    #[tokio::test]
    async fn penalty_blocks_then_recovers() {
        let limiter = RateLimiter::new(&tight_config());
        let addr = "10.0.0.2:4000";
        exhaust(&limiter, RateScope::Http, addr, 3).await;
        let denied = limiter.check(RateScope::Http, addr).await;
        assert!(!denied.allowed);
        assert!(denied.retry_after.expect("retry hint") >= Duration::from_millis(50));
        sleep(Duration::from_millis(70)).await;
        assert!(limiter.check(RateScope::Http, addr).await.allowed);
    }

    #[tokio::test]
    async fn window_retry_when_no_penalty() {
        let mut config = tight_config();
        config.http.penalty = Duration::ZERO;
        let limiter = RateLimiter::new(&config);
        let addr = "10.0.0.3:4000";
        exhaust(&limiter, RateScope::Http, addr, 3).await;
        let denied = limiter.check(RateScope::Http, addr).await;
        assert!(!denied.allowed);
        assert!(denied.retry_after.expect("retry hint") <= Duration::from_millis(40));
        sleep(Duration::from_millis(50)).await;
        assert!(limiter.check(RateScope::Http, addr).await.allowed);
    }

    #[tokio::test]
    async fn http_and_connect_scopes_independent() {
        let limiter = RateLimiter::new(&tight_config());
        let addr = "10.0.0.4:4000";
        exhaust(&limiter, RateScope::Http, addr, 3).await;
        assert!(!limiter.check(RateScope::Http, addr).await.allowed);
        assert!(limiter.check(RateScope::Connect, addr).await.allowed);
    }
}
