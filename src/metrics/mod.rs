//! Prometheus metrics
//!
//! All counters live in one registry constructed at server start and passed
//! by handle into the components that update them. The admin HTTP server
//! exposes the registry at /metrics.

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

/// All broker metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    /// Currently open client connections
    pub connections: IntGauge,
    /// CONNECT packets handled, by result
    pub connects_handled: IntCounterVec,
    /// Packets received from clients, by packet type
    pub messages_received: IntCounterVec,
    /// Packets sent to clients, by packet type
    pub messages_sent: IntCounterVec,
    /// Bytes received from clients
    pub bytes_received: IntCounter,
    /// Bytes sent to clients
    pub bytes_sent: IntCounter,
    /// Live sessions (attached and detached)
    pub sessions: IntGauge,
    /// Subscriptions across all sessions
    pub subscriptions: IntGauge,
    /// Retained messages in the store
    pub retained_messages: IntGauge,
    /// Packets sitting in pending lists
    pub pending_messages: IntGauge,
    /// Outbound messages dropped because a subscriber's channel was full
    pub dropped_messages: IntCounter,
    /// Broker-internal publish latency
    pub publish_latency: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections = IntGauge::with_opts(Opts::new(
            "tethermq_connections",
            "Number of open client connections",
        ))
        .unwrap();

        let connects_handled = IntCounterVec::new(
            Opts::new(
                "tethermq_connect_handled_total",
                "Total CONNECT packets handled, by result",
            ),
            &["result"],
        )
        .unwrap();

        let messages_received = IntCounterVec::new(
            Opts::new(
                "tethermq_messages_received_total",
                "Total packets received, by packet type",
            ),
            &["message_type"],
        )
        .unwrap();

        let messages_sent = IntCounterVec::new(
            Opts::new(
                "tethermq_messages_sent_total",
                "Total packets sent, by packet type",
            ),
            &["message_type"],
        )
        .unwrap();

        let bytes_received = IntCounter::with_opts(Opts::new(
            "tethermq_bytes_received_total",
            "Total bytes received from clients",
        ))
        .unwrap();

        let bytes_sent = IntCounter::with_opts(Opts::new(
            "tethermq_bytes_sent_total",
            "Total bytes sent to clients",
        ))
        .unwrap();

        let sessions = IntGauge::with_opts(Opts::new(
            "tethermq_sessions",
            "Number of sessions in the registry",
        ))
        .unwrap();

        let subscriptions = IntGauge::with_opts(Opts::new(
            "tethermq_subscriptions",
            "Number of subscriptions across all sessions",
        ))
        .unwrap();

        let retained_messages = IntGauge::with_opts(Opts::new(
            "tethermq_retained_messages",
            "Number of retained messages",
        ))
        .unwrap();

        let pending_messages = IntGauge::with_opts(Opts::new(
            "tethermq_pending_messages",
            "Number of packets in pending lists",
        ))
        .unwrap();

        let dropped_messages = IntCounter::with_opts(Opts::new(
            "tethermq_dropped_messages_total",
            "Outbound messages dropped on full subscriber channels",
        ))
        .unwrap();

        let publish_latency = Histogram::with_opts(
            HistogramOpts::new(
                "tethermq_publish_latency_seconds",
                "Time between receiving a publish and writing it to a subscriber",
            )
            .buckets(vec![
                0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
            ]),
        )
        .unwrap();

        for collector in [
            Box::new(connections.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(connects_handled.clone()),
            Box::new(messages_received.clone()),
            Box::new(messages_sent.clone()),
            Box::new(bytes_received.clone()),
            Box::new(bytes_sent.clone()),
            Box::new(sessions.clone()),
            Box::new(subscriptions.clone()),
            Box::new(retained_messages.clone()),
            Box::new(pending_messages.clone()),
            Box::new(dropped_messages.clone()),
            Box::new(publish_latency.clone()),
        ] {
            registry.register(collector).unwrap();
        }

        Metrics {
            registry,
            connections,
            connects_handled,
            messages_received,
            messages_sent,
            bytes_received,
            bytes_sent,
            sessions,
            subscriptions,
            retained_messages,
            pending_messages,
            dropped_messages,
            publish_latency,
        }
    }

    pub fn connection_opened(&self) {
        self.connections.inc();
    }

    pub fn connection_closed(&self) {
        self.connections.dec();
    }

    pub fn connect_handled(&self, result: &str) {
        self.connects_handled.with_label_values(&[result]).inc();
    }

    pub fn message_received(&self, message_type: &'static str, bytes: usize) {
        self.messages_received
            .with_label_values(&[message_type])
            .inc();
        self.bytes_received.inc_by(bytes as u64);
    }

    pub fn message_sent(&self, message_type: &'static str, bytes: usize) {
        self.messages_sent.with_label_values(&[message_type]).inc();
        self.bytes_sent.inc_by(bytes as u64);
    }

    pub fn message_dropped(&self) {
        self.dropped_messages.inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
