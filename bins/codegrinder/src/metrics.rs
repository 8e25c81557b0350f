// Request counters, surfaced at /v2/stats. Counters are atomics; only the
// slowest-path record sits behind a (never awaited-across) mutex.
use axum::body::Body;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::AppState;

#[derive(Default)]
pub struct Metrics {
    hits: AtomicU64,
    errors: AtomicU64,
    total_micros: AtomicU64,
    slowest_micros: AtomicU64,
    slowest_path: Mutex<String>,
}

impl Metrics {
    pub fn observe(&self, path: &str, status: u16, elapsed_micros: u64) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.total_micros.fetch_add(elapsed_micros, Ordering::Relaxed);
        if status >= 400 {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        if elapsed_micros > self.slowest_micros.load(Ordering::Relaxed) {
            self.slowest_micros.store(elapsed_micros, Ordering::Relaxed);
            if let Ok(mut slowest_path) = self.slowest_path.lock() {
                *slowest_path = path.to_string();
            }
        }
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = self.total_micros.load(Ordering::Relaxed);
        let average_seconds = if hits == 0 {
            0.0
        } else {
            total as f64 / hits as f64 / 1_000_000.0
        };
        serde_json::json!({
            "hits": hits,
            "errors": self.errors.load(Ordering::Relaxed),
            "totalSeconds": total as f64 / 1_000_000.0,
            "averageSeconds": average_seconds,
            "slowestSeconds": self.slowest_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            "slowestPath": self.slowest_path.lock().map(|p| p.clone()).unwrap_or_default(),
        })
    }
}

/// Middleware: time every request and record its outcome.
pub async fn track(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let start = Instant::now();
    let response = next.run(request).await;
    state.metrics.observe(
        &path,
        response.status().as_u16(),
        start.elapsed().as_micros() as u64,
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::default();
        metrics.observe("/v2/version", 200, 1_000);
        metrics.observe("/v2/version", 200, 3_000);
        metrics.observe("/v2/commit_bundles/unsigned", 400, 10_000);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["hits"], 3);
        assert_eq!(snapshot["errors"], 1);
        assert_eq!(snapshot["slowestPath"], "/v2/commit_bundles/unsigned");
        assert!((snapshot["averageSeconds"].as_f64().unwrap() - 0.004666).abs() < 1e-4);
    }

    #[test]
    fn test_slowest_tracks_maximum() {
        let metrics = Metrics::default();
        metrics.observe("/a", 200, 5_000);
        metrics.observe("/b", 200, 1_000);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["slowestPath"], "/a");
        assert_eq!(snapshot["slowestSeconds"].as_f64().unwrap(), 0.005);
    }
}
