//! Shared application state.

use crate::config::ConfigHandle;
use gencore_backend::LlmBackend;
use gencore_cache::ResponseCache;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// State shared across all request handlers. Lifecycle owns the singletons;
/// handlers hold cheap clones.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigHandle>,
    pub backend: Arc<dyn LlmBackend>,
    pub cache: Arc<ResponseCache>,
    pub connections: Arc<ConnectionTracker>,
    /// Root token; cancelled once at shutdown, every request derives a
    /// child from it.
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl AppState {
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Live connection and error accounting for the status endpoint.
#[derive(Default)]
pub struct ConnectionTracker {
    active_requests: AtomicUsize,
    ws_sessions: AtomicUsize,
    errors: AtomicU64,
}

impl ConnectionTracker {
    /// Track an HTTP request for its lifetime via the returned guard.
    pub fn begin_request(self: Arc<Self>) -> RequestGuard {
        self.active_requests.fetch_add(1, Ordering::SeqCst);
        RequestGuard { tracker: self }
    }

    /// Track a WebSocket session for its lifetime via the returned guard.
    pub fn begin_ws(self: Arc<Self>) -> WsGuard {
        self.ws_sessions.fetch_add(1, Ordering::SeqCst);
        WsGuard { tracker: self }
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_requests(&self) -> usize {
        self.active_requests.load(Ordering::SeqCst)
    }

    pub fn ws_sessions(&self) -> usize {
        self.ws_sessions.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

pub struct RequestGuard {
    tracker: Arc<ConnectionTracker>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.tracker.active_requests.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct WsGuard {
    tracker: Arc<ConnectionTracker>,
}

impl Drop for WsGuard {
    fn drop(&mut self) {
        self.tracker.ws_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_guard_counts() {
        let tracker = Arc::new(ConnectionTracker::default());
        assert_eq!(tracker.active_requests(), 0);
        {
            let _a = tracker.clone().begin_request();
            let _b = tracker.clone().begin_request();
            assert_eq!(tracker.active_requests(), 2);
        }
        assert_eq!(tracker.active_requests(), 0);
    }

    #[test]
    fn test_ws_guard_counts() {
        let tracker = Arc::new(ConnectionTracker::default());
        let guard = tracker.clone().begin_ws();
        assert_eq!(tracker.ws_sessions(), 1);
        drop(guard);
        assert_eq!(tracker.ws_sessions(), 0);
    }
}
