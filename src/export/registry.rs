use anyhow::Result;
use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};

use super::{
    LabelTuple, MetricsSink, ProbeCounter, ProbeGauge, ProbeHistogram, ProcessCounter, LABEL_NAMES,
};

/// Prometheus-backed metrics sink.
///
/// Owns its own `Registry` rather than the global default so tests can build
/// as many independent sinks as they like.
pub struct PrometheusSink {
    registry: Registry,

    // === Server ===
    /// Connections handled by the accept loop.
    connections_handled: Counter,

    // === Discovery ===
    /// Failed SRV lookups, including retried ones.
    failed_discoveries: Counter,

    // === Probe diagnostics ===
    retransmits: CounterVec,
    lost_segments: CounterVec,
    retransmitted_segments: CounterVec,
    send_segment_size: GaugeVec,
    receive_segment_size: GaugeVec,
    path_mtu: GaugeVec,
    round_trip_time: GaugeVec,
    round_trip_time_variance: GaugeVec,
    total_retransmits: GaugeVec,
    round_trip_time_hist: HistogramVec,
}

impl PrometheusSink {
    /// Creates a sink with every metric registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let connections_handled = Counter::with_opts(process_opts(
            ProcessCounter::ConnectionsHandled,
        ))?;
        let failed_discoveries = Counter::with_opts(process_opts(
            ProcessCounter::FailedDiscoveries,
        ))?;

        let retransmits = probe_counter(ProbeCounter::Retransmits)?;
        let lost_segments = probe_counter(ProbeCounter::LostSegments)?;
        let retransmitted_segments = probe_counter(ProbeCounter::RetransmittedSegments)?;

        let send_segment_size = probe_gauge(ProbeGauge::SendSegmentSize)?;
        let receive_segment_size = probe_gauge(ProbeGauge::ReceiveSegmentSize)?;
        let path_mtu = probe_gauge(ProbeGauge::PathMtu)?;
        let round_trip_time = probe_gauge(ProbeGauge::RoundTripTimeSeconds)?;
        let round_trip_time_variance = probe_gauge(ProbeGauge::RoundTripTimeVariance)?;
        let total_retransmits = probe_gauge(ProbeGauge::TotalRetransmits)?;

        let hist = ProbeHistogram::RoundTripTimeSeconds;
        let round_trip_time_hist = HistogramVec::new(
            HistogramOpts::new(hist.name(), hist.help())
                .buckets(exponential_buckets(1e-9, 10.0, 10)?),
            &LABEL_NAMES,
        )?;

        registry.register(Box::new(connections_handled.clone()))?;
        registry.register(Box::new(failed_discoveries.clone()))?;
        registry.register(Box::new(retransmits.clone()))?;
        registry.register(Box::new(lost_segments.clone()))?;
        registry.register(Box::new(retransmitted_segments.clone()))?;
        registry.register(Box::new(send_segment_size.clone()))?;
        registry.register(Box::new(receive_segment_size.clone()))?;
        registry.register(Box::new(path_mtu.clone()))?;
        registry.register(Box::new(round_trip_time.clone()))?;
        registry.register(Box::new(round_trip_time_variance.clone()))?;
        registry.register(Box::new(total_retransmits.clone()))?;
        registry.register(Box::new(round_trip_time_hist.clone()))?;

        Ok(Self {
            registry,
            connections_handled,
            failed_discoveries,
            retransmits,
            lost_segments,
            retransmitted_segments,
            send_segment_size,
            receive_segment_size,
            path_mtu,
            round_trip_time,
            round_trip_time_variance,
            total_retransmits,
            round_trip_time_hist,
        })
    }

    /// Returns the registry backing this sink.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn encode_text(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Current value of an unlabeled counter.
    pub fn process_counter(&self, counter: ProcessCounter) -> f64 {
        self.process(counter).get()
    }

    /// Current value of a per-probe counter.
    pub fn probe_counter(&self, counter: ProbeCounter, labels: &LabelTuple) -> f64 {
        self.counter_vec(counter)
            .with_label_values(&labels.values())
            .get()
    }

    /// Current value of a per-probe gauge.
    pub fn probe_gauge(&self, gauge: ProbeGauge, labels: &LabelTuple) -> f64 {
        self.gauge_vec(gauge).with_label_values(&labels.values()).get()
    }

    /// Number of observations recorded in a per-probe histogram.
    pub fn histogram_count(&self, histogram: ProbeHistogram, labels: &LabelTuple) -> u64 {
        self.histogram_vec(histogram)
            .with_label_values(&labels.values())
            .get_sample_count()
    }

    fn process(&self, counter: ProcessCounter) -> &Counter {
        match counter {
            ProcessCounter::ConnectionsHandled => &self.connections_handled,
            ProcessCounter::FailedDiscoveries => &self.failed_discoveries,
        }
    }

    fn counter_vec(&self, counter: ProbeCounter) -> &CounterVec {
        match counter {
            ProbeCounter::Retransmits => &self.retransmits,
            ProbeCounter::LostSegments => &self.lost_segments,
            ProbeCounter::RetransmittedSegments => &self.retransmitted_segments,
        }
    }

    fn gauge_vec(&self, gauge: ProbeGauge) -> &GaugeVec {
        match gauge {
            ProbeGauge::SendSegmentSize => &self.send_segment_size,
            ProbeGauge::ReceiveSegmentSize => &self.receive_segment_size,
            ProbeGauge::PathMtu => &self.path_mtu,
            ProbeGauge::RoundTripTimeSeconds => &self.round_trip_time,
            ProbeGauge::RoundTripTimeVariance => &self.round_trip_time_variance,
            ProbeGauge::TotalRetransmits => &self.total_retransmits,
        }
    }

    fn histogram_vec(&self, histogram: ProbeHistogram) -> &HistogramVec {
        match histogram {
            ProbeHistogram::RoundTripTimeSeconds => &self.round_trip_time_hist,
        }
    }
}

impl MetricsSink for PrometheusSink {
    fn increment(&self, counter: ProcessCounter) {
        self.process(counter).inc();
    }

    fn add_counter(&self, counter: ProbeCounter, labels: &LabelTuple, value: f64) {
        // Prometheus counters only move forward.
        if value > 0.0 {
            self.counter_vec(counter)
                .with_label_values(&labels.values())
                .inc_by(value);
        }
    }

    fn set_gauge(&self, gauge: ProbeGauge, labels: &LabelTuple, value: f64) {
        self.gauge_vec(gauge)
            .with_label_values(&labels.values())
            .set(value);
    }

    fn observe_histogram(&self, histogram: ProbeHistogram, labels: &LabelTuple, value: f64) {
        self.histogram_vec(histogram)
            .with_label_values(&labels.values())
            .observe(value);
    }
}

/// Encode a registry in the Prometheus text exposition format.
pub(crate) fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;

    Ok(String::from_utf8(buffer)?)
}

fn process_opts(counter: ProcessCounter) -> Opts {
    Opts::new(counter.name(), counter.help())
}

fn probe_counter(counter: ProbeCounter) -> prometheus::Result<CounterVec> {
    CounterVec::new(Opts::new(counter.name(), counter.help()), &LABEL_NAMES)
}

fn probe_gauge(gauge: ProbeGauge) -> prometheus::Result<GaugeVec> {
    GaugeVec::new(Opts::new(gauge.name(), gauge.help()), &LABEL_NAMES)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> LabelTuple {
        LabelTuple::new("10.1.2.3:8080", "10.1.2.4", "node-a")
    }

    #[test]
    fn test_new_registers_all_metrics() {
        let sink = PrometheusSink::new().expect("sink");
        sink.increment(ProcessCounter::ConnectionsHandled);
        sink.add_counter(ProbeCounter::Retransmits, &labels(), 1.0);
        sink.set_gauge(ProbeGauge::PathMtu, &labels(), 1500.0);
        sink.observe_histogram(ProbeHistogram::RoundTripTimeSeconds, &labels(), 0.001);

        let text = sink.encode_text().expect("encode");
        assert!(text.contains("conntest_connections_handled_total 1"));
        assert!(text.contains("conntest_tcp_pmtu_gauge{"));
        assert!(text.contains("dst_ip=\"10.1.2.3:8080\""));
        assert!(text.contains("conntest_tcp_round_trip_time_seconds_hist_count"));
    }

    #[test]
    fn test_counters_accumulate() {
        let sink = PrometheusSink::new().expect("sink");
        sink.add_counter(ProbeCounter::LostSegments, &labels(), 2.0);
        sink.add_counter(ProbeCounter::LostSegments, &labels(), 3.0);
        sink.add_counter(ProbeCounter::LostSegments, &labels(), 0.0);
        assert_eq!(sink.probe_counter(ProbeCounter::LostSegments, &labels()), 5.0);

        sink.increment(ProcessCounter::FailedDiscoveries);
        sink.increment(ProcessCounter::FailedDiscoveries);
        assert_eq!(sink.process_counter(ProcessCounter::FailedDiscoveries), 2.0);
        assert_eq!(sink.process_counter(ProcessCounter::ConnectionsHandled), 0.0);
    }

    #[test]
    fn test_gauges_overwrite() {
        let sink = PrometheusSink::new().expect("sink");
        sink.set_gauge(ProbeGauge::SendSegmentSize, &labels(), 1448.0);
        sink.set_gauge(ProbeGauge::SendSegmentSize, &labels(), 536.0);
        assert_eq!(sink.probe_gauge(ProbeGauge::SendSegmentSize, &labels()), 536.0);
    }

    #[test]
    fn test_labels_are_independent() {
        let sink = PrometheusSink::new().expect("sink");
        let other = LabelTuple::new("10.9.9.9:8080", "10.1.2.4", "node-a");
        sink.observe_histogram(ProbeHistogram::RoundTripTimeSeconds, &labels(), 0.01);
        sink.observe_histogram(ProbeHistogram::RoundTripTimeSeconds, &labels(), 0.02);
        sink.observe_histogram(ProbeHistogram::RoundTripTimeSeconds, &other, 0.03);

        assert_eq!(
            sink.histogram_count(ProbeHistogram::RoundTripTimeSeconds, &labels()),
            2
        );
        assert_eq!(
            sink.histogram_count(ProbeHistogram::RoundTripTimeSeconds, &other),
            1
        );
    }
}
