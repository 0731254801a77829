//! Fixed-window rate limiter keyed by client id.
//!
//! Protects the service from client overload. Independent of the circuit
//! breakers, which protect downstream services.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::RateLimitConfig;

struct Window {
    started: Instant,
    count: u32,
}

/// Outcome of a rejected request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttled {
    /// Time until the client's window resets.
    pub retry_after: Duration,
}

/// Per-client request counters.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count a request for `client_id`, returning false once the window is full.
    pub fn is_allowed(&self, client_id: &str) -> bool {
        self.check(client_id).is_ok()
    }

    /// Like [`is_allowed`](Self::is_allowed) but reports when the window resets.
    pub fn check(&self, client_id: &str) -> Result<(), Throttled> {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let window = windows.entry(client_id.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.duration_since(window.started) >= self.config.window {
            window.started = now;
            window.count = 0;
        }

        if window.count >= self.config.max_requests {
            let retry_after = self
                .config
                .window
                .saturating_sub(now.duration_since(window.started));
            debug!(client_id, count = window.count, "Rate limit exceeded");
            return Err(Throttled { retry_after });
        }

        window.count += 1;
        Ok(())
    }

    /// Drop windows that have expired. Returns how many were removed.
    pub fn prune_idle(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| now.duration_since(w.started) < self.config.window);
        before - windows.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.lock().len()
    }
}

/// Periodically drop expired client windows.
pub fn spawn_prune_task(limiter: Arc<RateLimiter>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(limiter.config.window.max(Duration::from_secs(1)));
        loop {
            interval.tick().await;
            let pruned = limiter.prune_idle();
            if pruned > 0 {
                debug!(pruned, "Pruned idle rate-limit windows");
            }
        }
    })
}
