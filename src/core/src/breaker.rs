use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-engram sliding-window call-rate limiter.
///
/// Bounds recursive and tap-triggered invocation frequency: at most
/// `max_calls` admitted per engram within the trailing `window`.
/// Rejected calls are not recorded and not queued. Entries reset only
/// by falling out of the window.
pub struct CircuitBreaker {
    window: Duration,
    max_calls: usize,
    calls: Mutex<HashMap<String, Vec<Instant>>>,
}

impl CircuitBreaker {
    pub fn new(window: Duration, max_calls: usize) -> Self {
        Self {
            window,
            max_calls,
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or reject a call for an engram. An absent id always admits
    /// (no key to limit on).
    pub fn admit(&self, engram_id: Option<&str>) -> bool {
        match engram_id {
            None => true,
            Some(id) => self.admit_at(id, Instant::now()),
        }
    }

    fn admit_at(&self, engram_id: &str, now: Instant) -> bool {
        let Ok(mut calls) = self.calls.lock() else {
            return true;
        };
        let recent = calls.entry(engram_id.to_string()).or_default();
        recent.retain(|t| now.duration_since(*t) < self.window);
        if recent.len() >= self.max_calls {
            return false;
        }
        recent.push(now);
        true
    }
}
