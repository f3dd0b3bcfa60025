use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    connections_active: AtomicU64,
    frames_ingress: AtomicU64,
    frames_egress: AtomicU64,
    calls_started: AtomicU64,
    calls_accepted: AtomicU64,
    calls_rejected: AtomicU64,
    calls_ended: AtomicU64,
    calls_missed: AtomicU64,
    calls_busy: AtomicU64,
    chat_messages: AtomicU64,
    chat_retries: AtomicU64,
    chat_failures: AtomicU64,
    push_sent: AtomicU64,
    push_failed: AtomicU64,
    validation_failures: AtomicU64,
    http_rate_limited: AtomicU64,
    connect_rate_limited: AtomicU64,
}

#[derive(Serialize)]
pub struct HealthSnapshot {
    pub status: String,
    pub uptime_seconds: u64,
    pub version: String,
    pub connections: u64,
    pub frames_ingress: u64,
    pub frames_egress: u64,
    pub calls_started: u64,
    pub calls_missed: u64,
    pub chat_messages: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_connections(&self) {
        self.connections_active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr_connections(&self) {
        self.connections_active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn connections_active(&self) -> u64 {
        self.connections_active.load(Ordering::SeqCst)
    }

    pub fn mark_ingress(&self) {
        self.frames_ingress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_egress(&self) {
        self.frames_egress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn frames_ingress(&self) -> u64 {
        self.frames_ingress.load(Ordering::SeqCst)
    }

    pub fn frames_egress(&self) -> u64 {
        self.frames_egress.load(Ordering::SeqCst)
    }

    pub fn mark_call_started(&self) {
        self.calls_started.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_call_accepted(&self) {
        self.calls_accepted.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_call_rejected(&self) {
        self.calls_rejected.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_call_ended(&self) {
        self.calls_ended.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_call_missed(&self) {
        self.calls_missed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn calls_started(&self) -> u64 {
        self.calls_started.load(Ordering::SeqCst)
    }

    pub fn calls_missed(&self) -> u64 {
        self.calls_missed.load(Ordering::SeqCst)
    }

    pub fn mark_call_busy(&self) {
        self.calls_busy.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_chat_message(&self) {
        self.chat_messages.fetch_add(1, Ordering::SeqCst);
    }

    pub fn chat_messages(&self) -> u64 {
        self.chat_messages.load(Ordering::SeqCst)
    }

    pub fn mark_chat_retry(&self) {
        self.chat_retries.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_chat_failure(&self) {
        self.chat_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_push_sent(&self) {
        self.push_sent.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_push_failed(&self) {
        self.push_failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_validation_failure(&self) {
        self.validation_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_http_rate_limited(&self) {
        self.http_rate_limited.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_connect_rate_limited(&self) {
        self.connect_rate_limited.fetch_add(1, Ordering::SeqCst);
    }

    pub fn encode_prometheus(&self) -> String {
        let mut output = String::with_capacity(1024);
        let gauge = |out: &mut String, name: &str, value: u64| {
            out.push_str(&format!(
                "# TYPE peal_{name} gauge\npeal_{name} {value}\n"
            ));
        };
        let counter = |out: &mut String, name: &str, value: u64| {
            out.push_str(&format!(
                "# TYPE peal_{name} counter\npeal_{name} {value}\n"
            ));
        };
        gauge(
            &mut output,
            "connections_active",
            self.connections_active.load(Ordering::SeqCst),
        );
        counter(
            &mut output,
            "frames_ingress",
            self.frames_ingress.load(Ordering::SeqCst),
        );
        counter(
            &mut output,
            "frames_egress",
            self.frames_egress.load(Ordering::SeqCst),
        );
        counter(
            &mut output,
            "calls_started",
            self.calls_started.load(Ordering::SeqCst),
        );
        counter(
            &mut output,
            "calls_accepted",
            self.calls_accepted.load(Ordering::SeqCst),
        );
        counter(
            &mut output,
            "calls_rejected",
            self.calls_rejected.load(Ordering::SeqCst),
        );
        counter(
            &mut output,
            "calls_ended",
            self.calls_ended.load(Ordering::SeqCst),
        );
        counter(
            &mut output,
            "calls_missed",
            self.calls_missed.load(Ordering::SeqCst),
        );
        counter(
            &mut output,
            "calls_busy",
            self.calls_busy.load(Ordering::SeqCst),
        );
        counter(
            &mut output,
            "chat_messages",
            self.chat_messages.load(Ordering::SeqCst),
        );
        counter(
            &mut output,
            "chat_retries",
            self.chat_retries.load(Ordering::SeqCst),
        );
        counter(
            &mut output,
            "chat_failures",
            self.chat_failures.load(Ordering::SeqCst),
        );
        counter(
            &mut output,
            "push_sent",
            self.push_sent.load(Ordering::SeqCst),
        );
        counter(
            &mut output,
            "push_failed",
            self.push_failed.load(Ordering::SeqCst),
        );
        counter(
            &mut output,
            "validation_failures",
            self.validation_failures.load(Ordering::SeqCst),
        );
        counter(
            &mut output,
            "http_rate_limited",
            self.http_rate_limited.load(Ordering::SeqCst),
        );
        counter(
            &mut output,
            "connect_rate_limited",
            self.connect_rate_limited.load(Ordering::SeqCst),
        );
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prometheus_encoding_lists_counters() {
        let metrics = Metrics::new();
        metrics.incr_connections();
        metrics.mark_call_started();
        metrics.mark_call_missed();
        metrics.mark_chat_message();
        let encoded = metrics.encode_prometheus();
        assert!(encoded.contains("peal_connections_active 1"));
        assert!(encoded.contains("peal_calls_started 1"));
        assert!(encoded.contains("peal_calls_missed 1"));
        assert!(encoded.contains("peal_chat_messages 1"));
        assert!(encoded.contains("# TYPE peal_connections_active gauge"));
    }

    #[test]
    fn connection_gauge_tracks_lifecycle() {
        let metrics = Metrics::new();
        metrics.incr_connections();
        metrics.incr_connections();
        metrics.decr_connections();
        assert_eq!(metrics.connections_active(), 1);
    }
}
