//! Per-association traffic statistics.
//!
//! The protocol engine reports every PDU and message it sends or receives to a [StatisticsSink].
//! [Statistics] keeps plain counters, [OtelStatistics] forwards to OpenTelemetry metrics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::{KeyValue, global};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatisticsEvent {
    PduSent,
    PduReceived,
    MessageSent,
    MessageReceived,
}

/// Receiver of traffic events.
pub trait StatisticsSink: Send + Sync + fmt::Debug {
    fn record_event(&self, event: StatisticsEvent, byte_count: usize);
}

/// Atomic traffic counters.
#[derive(Debug, Default)]
pub struct Statistics {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    pdus_sent: AtomicU64,
    pdus_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

impl Statistics {
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn pdus_sent(&self) -> u64 {
        self.pdus_sent.load(Ordering::Relaxed)
    }

    pub fn pdus_received(&self) -> u64 {
        self.pdus_received.load(Ordering::Relaxed)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Add the counters of `other` to these.
    pub fn add(&self, other: &Statistics) {
        self.bytes_sent.fetch_add(other.bytes_sent(), Ordering::Relaxed);
        self.bytes_received
            .fetch_add(other.bytes_received(), Ordering::Relaxed);
        self.pdus_sent.fetch_add(other.pdus_sent(), Ordering::Relaxed);
        self.pdus_received
            .fetch_add(other.pdus_received(), Ordering::Relaxed);
        self.messages_sent
            .fetch_add(other.messages_sent(), Ordering::Relaxed);
        self.messages_received
            .fetch_add(other.messages_received(), Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for counter in [
            &self.bytes_sent,
            &self.bytes_received,
            &self.pdus_sent,
            &self.pdus_received,
            &self.messages_sent,
            &self.messages_received,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl StatisticsSink for Statistics {
    fn record_event(&self, event: StatisticsEvent, byte_count: usize) {
        let bytes = byte_count as u64;
        match event {
            StatisticsEvent::PduSent => {
                self.pdus_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
            }
            StatisticsEvent::PduReceived => {
                self.pdus_received.fetch_add(1, Ordering::Relaxed);
                self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
            }
            StatisticsEvent::MessageSent => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
            }
            StatisticsEvent::MessageReceived => {
                self.messages_received.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Sent: {} in {} PDUs ({} messages), Received: {} in {} PDUs ({} messages)",
            HumanBytes(self.bytes_sent()),
            self.pdus_sent(),
            self.messages_sent(),
            HumanBytes(self.bytes_received()),
            self.pdus_received(),
            self.messages_received(),
        )
    }
}

struct HumanBytes(u64);

impl fmt::Display for HumanBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
        if self.0 < 1024 {
            return write!(f, "{} B", self.0);
        }
        let mut value = self.0 as f64 / 1024.0;
        let mut unit = 0;
        while value >= 1024.0 && unit < UNITS.len() - 1 {
            value /= 1024.0;
            unit += 1;
        }
        write!(f, "{value:.1} {}", UNITS[unit])
    }
}

/// Forwards traffic events to OpenTelemetry counters.
#[derive(Debug, Clone)]
pub struct OtelStatistics {
    bytes: Counter<u64>,
    pdus: Counter<u64>,
    messages: Counter<u64>,
}

impl OtelStatistics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            bytes: meter
                .u64_counter("oxidimse.pdu.bytes")
                .with_description("Bytes of PDUs sent and received")
                .with_unit("By")
                .build(),
            pdus: meter
                .u64_counter("oxidimse.pdus")
                .with_description("Number of PDUs sent and received")
                .build(),
            messages: meter
                .u64_counter("oxidimse.messages")
                .with_description("Number of DIMSE messages sent and received")
                .build(),
        }
    }

    /// Counters registered on the global meter provider.
    pub fn global() -> Self {
        Self::new(&global::meter(env!("CARGO_PKG_NAME")))
    }
}

impl StatisticsSink for OtelStatistics {
    fn record_event(&self, event: StatisticsEvent, byte_count: usize) {
        match event {
            StatisticsEvent::PduSent | StatisticsEvent::PduReceived => {
                let attributes = [KeyValue::new("direction", direction(event))];
                self.pdus.add(1, &attributes);
                self.bytes.add(byte_count as u64, &attributes);
            }
            StatisticsEvent::MessageSent | StatisticsEvent::MessageReceived => {
                self.messages
                    .add(1, &[KeyValue::new("direction", direction(event))]);
            }
        }
    }
}

fn direction(event: StatisticsEvent) -> &'static str {
    match event {
        StatisticsEvent::PduSent | StatisticsEvent::MessageSent => "sent",
        StatisticsEvent::PduReceived | StatisticsEvent::MessageReceived => "received",
    }
}

impl<T: StatisticsSink + ?Sized> StatisticsSink for std::sync::Arc<T> {
    fn record_event(&self, event: StatisticsEvent, byte_count: usize) {
        (**self).record_event(event, byte_count);
    }
}

/// Report to both sinks.
impl<A: StatisticsSink, B: StatisticsSink> StatisticsSink for (A, B) {
    fn record_event(&self, event: StatisticsEvent, byte_count: usize) {
        self.0.record_event(event, byte_count);
        self.1.record_event(event, byte_count);
    }
}
