use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rocket::request::{FromRequest, Outcome, Request};

/// Fixed-window limiter for anonymous posting, keyed by client address.
pub struct RateLimiter {
    window: Duration,
    limit: u64,
    windows: Mutex<Windows>,
}

struct Windows {
    entries: HashMap<String, Window>,
    last_sweep: Instant,
}

struct Window {
    opened: Instant,
    used: u64,
}

/// Client IP address extracted from the request.
/// Checks: X-Forwarded-For → X-Real-Ip → socket peer → "unknown".
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ClientIp {
    type Error = std::convert::Infallible;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let forwarded = request
            .headers()
            .get_one("X-Forwarded-For")
            .and_then(|xff| xff.split(',').next());
        let candidates = [forwarded, request.headers().get_one("X-Real-Ip")];
        if let Some(ip) = candidates
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|ip| !ip.is_empty())
        {
            return Outcome::Success(ClientIp(ip.to_string()));
        }
        let peer = request
            .client_ip()
            .map_or_else(|| "unknown".to_string(), |addr| addr.to_string());
        Outcome::Success(ClientIp(peer))
    }
}

#[derive(Clone, Debug)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u64,
    pub retry_after_secs: u64,
}

impl RateLimiter {
    pub fn new(window: Duration, limit: u64) -> Self {
        RateLimiter {
            window,
            limit,
            windows: Mutex::new(Windows {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Counts one attempt for `key` and reports whether it may proceed.
    pub fn check(&self, key: &str) -> Decision {
        let now = Instant::now();
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // Sweep expired windows at most once per window length.
        let window = self.window;
        if now.duration_since(windows.last_sweep) >= window {
            windows
                .entries
                .retain(|_, w| now.duration_since(w.opened) < window);
            windows.last_sweep = now;
        }

        let entry = windows.entries.entry(key.to_string()).or_insert(Window {
            opened: now,
            used: 0,
        });
        if now.duration_since(entry.opened) >= window {
            *entry = Window {
                opened: now,
                used: 0,
            };
        }
        let retry_after_secs = self
            .window
            .saturating_sub(now.duration_since(entry.opened))
            .as_secs();

        if entry.used >= self.limit {
            return Decision {
                allowed: false,
                remaining: 0,
                retry_after_secs,
            };
        }
        entry.used += 1;
        Decision {
            allowed: true,
            remaining: self.limit - entry.used,
            retry_after_secs,
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows
            .lock()
            .map(|w| w.entries.len())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_under_limit() {
        let rl = RateLimiter::new(Duration::from_secs(60), 10);
        let d = rl.check("10.0.0.1");
        assert!(d.allowed);
        assert_eq!(d.remaining, 9);
    }

    #[test]
    fn blocks_at_limit() {
        let rl = RateLimiter::new(Duration::from_secs(60), 3);
        for _ in 0..3 {
            assert!(rl.check("10.0.0.1").allowed);
        }
        let d = rl.check("10.0.0.1");
        assert!(!d.allowed);
        assert!(d.retry_after_secs <= 60);
    }

    #[test]
    fn clients_are_independent() {
        let rl = RateLimiter::new(Duration::from_secs(60), 1);
        assert!(rl.check("10.0.0.1").allowed);
        assert!(!rl.check("10.0.0.1").allowed);
        assert!(rl.check("10.0.0.2").allowed);
    }

    #[test]
    fn expired_windows_are_dropped() {
        let rl = RateLimiter::new(Duration::ZERO, 1);
        rl.check("10.0.0.1");
        rl.check("10.0.0.2");
        assert_eq!(rl.tracked_keys(), 1);
        assert!(rl.check("10.0.0.1").allowed);
    }

    #[test]
    fn sweeps_at_most_once_per_window() {
        let rl = RateLimiter::new(Duration::from_millis(100), 1);
        assert!(rl.check("10.0.0.1").allowed);
        std::thread::sleep(Duration::from_millis(150));

        assert!(rl.check("10.0.0.2").allowed);
        assert_eq!(rl.tracked_keys(), 1);
        assert!(rl.check("10.0.0.3").allowed);
        assert_eq!(rl.tracked_keys(), 2);
        assert!(!rl.check("10.0.0.3").allowed);
    }

    #[test]
    fn many_clients_stay_independent() {
        let rl = RateLimiter::new(Duration::from_secs(60), 1);
        for i in 0..5_000 {
            assert!(rl.check(&format!("10.1.{}.{}", i / 256, i % 256)).allowed);
        }
        assert_eq!(rl.tracked_keys(), 5_000);
        assert!(!rl.check("10.1.0.0").allowed);
    }
}
