pub mod http;
pub mod registry;

pub use self::http::MetricsServer;
pub use self::registry::PrometheusSink;

/// Label names shared by every per-probe metric, in `LabelTuple` order.
pub const LABEL_NAMES: [&str; 3] = ["dst_ip", "src_ip", "node_name"];

/// Key under which all metrics for one probe are recorded.
///
/// `source_addresses` is every address bound to the local hostname joined
/// into a single value, not one label per address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LabelTuple {
    pub destination: String,
    pub source_addresses: String,
    pub node_name: String,
}

impl LabelTuple {
    pub fn new(
        destination: impl Into<String>,
        source_addresses: impl Into<String>,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            destination: destination.into(),
            source_addresses: source_addresses.into(),
            node_name: node_name.into(),
        }
    }

    /// Label values in `LABEL_NAMES` order.
    pub fn values(&self) -> [&str; 3] {
        [
            &self.destination,
            &self.source_addresses,
            &self.node_name,
        ]
    }
}

/// Unlabeled process-wide counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessCounter {
    /// Connections served by the accept loop.
    ConnectionsHandled,
    /// Failed service-record lookups.
    FailedDiscoveries,
}

/// Per-probe counters, keyed by `LabelTuple`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeCounter {
    Retransmits,
    LostSegments,
    RetransmittedSegments,
}

/// Per-probe gauges, keyed by `LabelTuple`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeGauge {
    SendSegmentSize,
    ReceiveSegmentSize,
    PathMtu,
    RoundTripTimeSeconds,
    RoundTripTimeVariance,
    TotalRetransmits,
}

/// Per-probe histograms, keyed by `LabelTuple`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeHistogram {
    RoundTripTimeSeconds,
}

impl ProcessCounter {
    pub fn name(self) -> &'static str {
        match self {
            Self::ConnectionsHandled => "conntest_connections_handled_total",
            Self::FailedDiscoveries => "conntest_failed_SRV_discoveries_counter",
        }
    }

    pub fn help(self) -> &'static str {
        match self {
            Self::ConnectionsHandled => "Total number of connections handled by the server.",
            Self::FailedDiscoveries => "Total number of failed SRV record discoveries.",
        }
    }
}

impl ProbeCounter {
    pub const ALL: [Self; 3] = [
        Self::Retransmits,
        Self::LostSegments,
        Self::RetransmittedSegments,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Retransmits => "conntest_tcp_retransmits_counter",
            Self::LostSegments => "conntest_tcp_lost_packets_counter",
            Self::RetransmittedSegments => "conntest_tcp_retrans_counter",
        }
    }

    pub fn help(self) -> &'static str {
        match self {
            Self::Retransmits => "Unrecovered RTO timeouts seen when probing.",
            Self::LostSegments => "Segments the kernel considered lost.",
            Self::RetransmittedSegments => "Segments retransmitted and not yet acknowledged.",
        }
    }
}

impl ProbeGauge {
    pub const ALL: [Self; 6] = [
        Self::SendSegmentSize,
        Self::ReceiveSegmentSize,
        Self::PathMtu,
        Self::RoundTripTimeSeconds,
        Self::RoundTripTimeVariance,
        Self::TotalRetransmits,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::SendSegmentSize => "conntest_tcp_send_message_gauge",
            Self::ReceiveSegmentSize => "conntest_tcp_receive_message_gauge",
            Self::PathMtu => "conntest_tcp_pmtu_gauge",
            Self::RoundTripTimeSeconds => "conntest_tcp_round_trip_time_seconds_gauge",
            Self::RoundTripTimeVariance => "conntest_tcp_round_trip_time_variance_gauge",
            Self::TotalRetransmits => "conntest_tcp_total_retrans_gauge",
        }
    }

    pub fn help(self) -> &'static str {
        match self {
            Self::SendSegmentSize => "Send maximum segment size in bytes.",
            Self::ReceiveSegmentSize => "Receive maximum segment size in bytes.",
            Self::PathMtu => "Path MTU in bytes.",
            Self::RoundTripTimeSeconds => "Smoothed round trip time in seconds.",
            Self::RoundTripTimeVariance => "Round trip time variance in microseconds.",
            Self::TotalRetransmits => "Total retransmits over the connection lifetime.",
        }
    }
}

impl ProbeHistogram {
    pub fn name(self) -> &'static str {
        match self {
            Self::RoundTripTimeSeconds => "conntest_tcp_round_trip_time_seconds_hist",
        }
    }

    pub fn help(self) -> &'static str {
        match self {
            Self::RoundTripTimeSeconds => "Distribution of smoothed round trip times in seconds.",
        }
    }
}

/// Write-only, process-wide time-series sink.
///
/// Constructed once at startup and shared by reference with every component
/// that records metrics. Implementations must tolerate concurrent writers.
pub trait MetricsSink: Send + Sync {
    /// Add one to an unlabeled counter.
    fn increment(&self, counter: ProcessCounter);

    /// Add `value` to a per-probe counter.
    fn add_counter(&self, counter: ProbeCounter, labels: &LabelTuple, value: f64);

    /// Set a per-probe gauge.
    fn set_gauge(&self, gauge: ProbeGauge, labels: &LabelTuple, value: f64);

    /// Record one observation in a per-probe histogram.
    fn observe_histogram(&self, histogram: ProbeHistogram, labels: &LabelTuple, value: f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_label_values_order() {
        let labels = LabelTuple::new("10.0.0.1:8080", "10.0.0.2, 10.0.0.3, ", "node-a");
        assert_eq!(labels.values(), ["10.0.0.1:8080", "10.0.0.2, 10.0.0.3, ", "node-a"]);
    }

    #[test]
    fn test_metric_names_unique() {
        let mut names = HashSet::new();
        names.insert(ProcessCounter::ConnectionsHandled.name());
        names.insert(ProcessCounter::FailedDiscoveries.name());
        names.insert(ProbeHistogram::RoundTripTimeSeconds.name());
        for c in ProbeCounter::ALL {
            assert!(names.insert(c.name()), "duplicate {}", c.name());
        }
        for g in ProbeGauge::ALL {
            assert!(names.insert(g.name()), "duplicate {}", g.name());
        }
        assert_eq!(names.len(), 12);
    }
}
