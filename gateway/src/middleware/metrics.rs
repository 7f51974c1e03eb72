//! Prometheus metrics recorder.
//!
//! Each recorder owns its registry so several app states can coexist in one
//! process (integration tests build many).

use prometheus::{
    histogram_opts, opts, register_histogram_vec_with_registry,
    register_int_counter_vec_with_registry, Encoder, HistogramVec, IntCounterVec, Registry,
    TextEncoder,
};

use crate::models::quota::WindowType;

pub struct PrometheusRecorder {
    registry: Registry,
    requests_total: IntCounterVec,
    auth_failures_total: IntCounterVec,
    quota_denials_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
}

impl Default for PrometheusRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl PrometheusRecorder {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = register_int_counter_vec_with_registry!(
            opts!("datagate_requests_total", "Requests handled, by plane and status"),
            &["plane", "status"],
            registry
        )
        .expect("failed to register datagate_requests_total");

        let auth_failures_total = register_int_counter_vec_with_registry!(
            opts!("datagate_auth_failures_total", "Rejected data-plane credentials"),
            &["code"],
            registry
        )
        .expect("failed to register datagate_auth_failures_total");

        let quota_denials_total = register_int_counter_vec_with_registry!(
            opts!("datagate_quota_denials_total", "Requests denied by a quota window"),
            &["window"],
            registry
        )
        .expect("failed to register datagate_quota_denials_total");

        let request_duration_seconds = register_histogram_vec_with_registry!(
            histogram_opts!(
                "datagate_request_duration_seconds",
                "Request latency in seconds",
                vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
            ),
            &["plane"],
            registry
        )
        .expect("failed to register datagate_request_duration_seconds");

        Self {
            registry,
            requests_total,
            auth_failures_total,
            quota_denials_total,
            request_duration_seconds,
        }
    }

    pub fn record_request(&self, plane: &str, status: u16, latency_ms: i64) {
        self.requests_total
            .with_label_values(&[plane, &status.to_string()])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[plane])
            .observe(latency_ms.max(0) as f64 / 1000.0);
    }

    pub fn record_auth_failure(&self, code: &str) {
        self.auth_failures_total.with_label_values(&[code]).inc();
    }

    pub fn record_quota_denial(&self, window: WindowType) {
        self.quota_denials_total
            .with_label_values(&[window.as_str()])
            .inc();
    }

    /// Prometheus text exposition of this recorder's registry.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_recorders_do_not_collide() {
        let a = PrometheusRecorder::new();
        let b = PrometheusRecorder::new();
        a.record_request("data", 200, 12);
        assert!(a.encode().contains("datagate_requests_total{plane=\"data\",status=\"200\"} 1"));
        assert!(!b.encode().contains("status=\"200\""));
    }

    #[test]
    fn test_denials_labelled_by_window() {
        let m = PrometheusRecorder::new();
        m.record_quota_denial(WindowType::Minute);
        m.record_auth_failure("credential_expired");
        let text = m.encode();
        assert!(text.contains("datagate_quota_denials_total{window=\"minute\"} 1"));
        assert!(text.contains("datagate_auth_failures_total{code=\"credential_expired\"} 1"));
    }
}
