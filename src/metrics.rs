use axum::{routing::get, Router};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::MetricsConfig;
use crate::limiter::{AdmissionController, LimiterSnapshot};

#[derive(Default)]
pub struct Metrics {
    pub submissions_total: AtomicU64,
    pub admitted_total: AtomicU64,
    pub timed_out_total: AtomicU64,
    pub transport_succeeded: AtomicU64,
    pub transport_failed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_submissions(&self) {
        self.submissions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_admitted(&self) {
        self.admitted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_timed_out(&self) {
        self.timed_out_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_succeeded(&self) {
        self.transport_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.transport_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn format_prometheus(&self, limiter: &LimiterSnapshot) -> String {
        format!(
            "# HELP registrar_submissions_total Total submissions\n\
             # TYPE registrar_submissions_total counter\n\
             registrar_submissions_total {}\n\
             # HELP registrar_admitted_total Submissions admitted by the limiter\n\
             # TYPE registrar_admitted_total counter\n\
             registrar_admitted_total {}\n\
             # HELP registrar_timed_out_total Submissions that timed out waiting for a slot\n\
             # TYPE registrar_timed_out_total counter\n\
             registrar_timed_out_total {}\n\
             # HELP registrar_transport_succeeded_total Successful registry calls\n\
             # TYPE registrar_transport_succeeded_total counter\n\
             registrar_transport_succeeded_total {}\n\
             # HELP registrar_transport_failed_total Failed registry calls\n\
             # TYPE registrar_transport_failed_total counter\n\
             registrar_transport_failed_total {}\n\
             # HELP registrar_window_rollovers_total Windows rolled over\n\
             # TYPE registrar_window_rollovers_total counter\n\
             registrar_window_rollovers_total {}\n\
             # HELP registrar_window_consumed Slots consumed in the current window\n\
             # TYPE registrar_window_consumed gauge\n\
             registrar_window_consumed {}\n\
             # HELP registrar_window_capacity Slots per window\n\
             # TYPE registrar_window_capacity gauge\n\
             registrar_window_capacity {}\n\
             # HELP registrar_waiting Callers queued for a slot\n\
             # TYPE registrar_waiting gauge\n\
             registrar_waiting {}\n",
            self.submissions_total.load(Ordering::Relaxed),
            self.admitted_total.load(Ordering::Relaxed),
            self.timed_out_total.load(Ordering::Relaxed),
            self.transport_succeeded.load(Ordering::Relaxed),
            self.transport_failed.load(Ordering::Relaxed),
            limiter.generation,
            limiter.consumed,
            limiter.capacity,
            limiter.waiting,
        )
    }
}

pub fn router(path: &str, metrics: Arc<Metrics>, limiter: Arc<AdmissionController>) -> Router {
    Router::new()
        .route(path, get(move || {
            let m = metrics.clone();
            let l = limiter.clone();
            async move { m.format_prometheus(&l.snapshot()) }
        }))
        .layer(TraceLayer::new_for_http())
}

pub async fn run_metrics_server(
    config: MetricsConfig,
    metrics: Arc<Metrics>,
    limiter: Arc<AdmissionController>,
) {
    if !config.enable {
        return;
    }

    let app = router(&config.path, metrics, limiter);

    let addr: std::net::SocketAddr = match config.bind_addr.parse() {
        Ok(a) => a,
        Err(e) => {
            error!("Invalid metrics bind address: {}", e);
            return;
        }
    };

    match TcpListener::bind(addr).await {
        Ok(listener) => {
            info!("Metrics server listening on {}{}", addr, config.path);
            if let Err(e) = axum::serve(listener, app).await {
                error!("Metrics server stopped: {}", e);
            }
        }
        Err(e) => error!("Failed to bind metrics server on {}: {}", addr, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_prometheus_output_reflects_counters_and_window() {
        let metrics = Metrics::new();
        metrics.inc_submissions();
        metrics.inc_submissions();
        metrics.inc_admitted();
        metrics.inc_timed_out();
        metrics.inc_failed();

        let snapshot = LimiterSnapshot {
            capacity: 3,
            consumed: 1,
            remaining: 2,
            waiting: 4,
            generation: 7,
            window_resets_in: Duration::from_secs(12),
        };
        let text = metrics.format_prometheus(&snapshot);

        assert!(text.contains("registrar_submissions_total 2\n"));
        assert!(text.contains("registrar_admitted_total 1\n"));
        assert!(text.contains("registrar_timed_out_total 1\n"));
        assert!(text.contains("registrar_transport_succeeded_total 0\n"));
        assert!(text.contains("registrar_transport_failed_total 1\n"));
        assert!(text.contains("registrar_window_rollovers_total 7\n"));
        assert!(text.contains("registrar_window_capacity 3\n"));
        assert!(text.contains("registrar_waiting 4\n"));
    }
}
