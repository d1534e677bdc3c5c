use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::transport::CloseReason;

pub struct SessionMetrics {
    registry: Registry,
    sessions_active: IntGauge,
    sessions_created: IntCounter,
    sessions_closed: IntCounterVec,
    requests_rejected: IntCounterVec,
}

impl SessionMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let sessions_active = IntGauge::new(
            "stream_relay_sessions_active",
            "Sessions currently held in the registry",
        )?;
        let sessions_created = IntCounter::new(
            "stream_relay_sessions_created_total",
            "Sessions created by an initialize handshake",
        )?;
        let sessions_closed = IntCounterVec::new(
            Opts::new(
                "stream_relay_sessions_closed_total",
                "Sessions removed from the registry",
            ),
            &["reason"],
        )?;
        let requests_rejected = IntCounterVec::new(
            Opts::new(
                "stream_relay_requests_rejected_total",
                "Requests rejected for a missing or unknown session",
            ),
            &["verb"],
        )?;

        registry.register(Box::new(sessions_active.clone()))?;
        registry.register(Box::new(sessions_created.clone()))?;
        registry.register(Box::new(sessions_closed.clone()))?;
        registry.register(Box::new(requests_rejected.clone()))?;

        Ok(Self {
            registry,
            sessions_active,
            sessions_created,
            sessions_closed,
            requests_rejected,
        })
    }

    pub fn record_session_created(&self) {
        self.sessions_created.inc();
        self.sessions_active.inc();
    }

    pub fn record_session_closed(&self, reason: CloseReason) {
        self.sessions_closed
            .with_label_values(&[reason.as_str()])
            .inc();
        self.sessions_active.dec();
    }

    pub fn record_rejected(&self, verb: &str) {
        self.requests_rejected.with_label_values(&[verb]).inc();
    }

    pub fn sessions_active(&self) -> i64 {
        self.sessions_active.get()
    }

    pub fn sessions_closed(&self, reason: CloseReason) -> u64 {
        self.sessions_closed
            .with_label_values(&[reason.as_str()])
            .get()
    }

    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_sessions_and_encodes_text_format() {
        let metrics = SessionMetrics::new().unwrap();
        metrics.record_session_created();
        metrics.record_session_created();
        metrics.record_session_closed(CloseReason::ClientTerminated);
        metrics.record_rejected("post");

        assert_eq!(metrics.sessions_active(), 1);
        assert_eq!(metrics.sessions_closed(CloseReason::ClientTerminated), 1);
        assert_eq!(metrics.sessions_closed(CloseReason::Expired), 0);

        let text = metrics.encode().unwrap();
        assert!(text.contains("stream_relay_sessions_created_total 2"));
        assert!(text.contains("stream_relay_requests_rejected_total{verb=\"post\"} 1"));
    }
}
