//! Point-in-time kernel TCP statistics for a connected socket.

use anyhow::Result;
#[cfg(not(target_os = "linux"))]
use anyhow::bail;
use tokio::net::TcpStream;

use crate::export::{LabelTuple, MetricsSink, ProbeCounter, ProbeGauge, ProbeHistogram};

/// Scalar fields read from one client-side connection at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    /// Unrecovered RTO timeouts.
    pub retransmits: u32,
    /// Send maximum segment size in bytes.
    pub send_segment_size: u32,
    /// Receive maximum segment size in bytes.
    pub receive_segment_size: u32,
    /// Segments considered lost.
    pub lost_segments: u32,
    /// Segments retransmitted and not yet acknowledged.
    pub retransmitted_segments: u32,
    /// Path MTU in bytes.
    pub path_mtu: u32,
    /// Smoothed round trip time in microseconds.
    pub round_trip_time_us: u32,
    /// Round trip time variance in microseconds.
    pub round_trip_time_variance_us: u32,
    /// Retransmits over the connection lifetime.
    pub total_retransmits: u32,
}

impl DiagnosticsSnapshot {
    /// Smoothed round trip time in seconds.
    pub fn round_trip_time_seconds(&self) -> f64 {
        f64::from(self.round_trip_time_us) / 1e6
    }

    /// Write every field into the sink under `labels`.
    ///
    /// Counters are incremented, gauges set, and the RTT is observed once.
    pub fn record(&self, sink: &dyn MetricsSink, labels: &LabelTuple) {
        sink.add_counter(ProbeCounter::Retransmits, labels, f64::from(self.retransmits));
        sink.set_gauge(
            ProbeGauge::SendSegmentSize,
            labels,
            f64::from(self.send_segment_size),
        );
        sink.set_gauge(
            ProbeGauge::ReceiveSegmentSize,
            labels,
            f64::from(self.receive_segment_size),
        );
        sink.add_counter(
            ProbeCounter::LostSegments,
            labels,
            f64::from(self.lost_segments),
        );
        sink.add_counter(
            ProbeCounter::RetransmittedSegments,
            labels,
            f64::from(self.retransmitted_segments),
        );
        sink.set_gauge(ProbeGauge::PathMtu, labels, f64::from(self.path_mtu));

        let rtt = self.round_trip_time_seconds();
        sink.set_gauge(ProbeGauge::RoundTripTimeSeconds, labels, rtt);
        sink.observe_histogram(ProbeHistogram::RoundTripTimeSeconds, labels, rtt);

        sink.set_gauge(
            ProbeGauge::RoundTripTimeVariance,
            labels,
            f64::from(self.round_trip_time_variance_us),
        );
        sink.set_gauge(
            ProbeGauge::TotalRetransmits,
            labels,
            f64::from(self.total_retransmits),
        );
    }
}

/// Read a diagnostics snapshot from a connected stream.
#[cfg(target_os = "linux")]
pub fn read_snapshot(stream: &TcpStream) -> Result<DiagnosticsSnapshot> {
    use std::os::fd::AsRawFd;

    let info = linux::getsockopt_tcp_info(stream.as_raw_fd())?;
    Ok(info.into())
}

/// Read a diagnostics snapshot from a connected stream.
#[cfg(not(target_os = "linux"))]
pub fn read_snapshot(_stream: &TcpStream) -> Result<DiagnosticsSnapshot> {
    bail!("TCP_INFO diagnostics are only supported on Linux")
}

#[cfg(target_os = "linux")]
mod linux {
    use std::mem;
    use std::os::fd::RawFd;

    use anyhow::{bail, Result};

    use super::DiagnosticsSnapshot;

    /// Leading part of the kernel's `struct tcp_info`, present since 2.6.
    ///
    /// Later kernels append fields after `tcpi_total_retrans`; asking for
    /// only this prefix keeps the layout stable across versions.
    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    pub(super) struct RawTcpInfo {
        pub tcpi_state: u8,
        pub tcpi_ca_state: u8,
        pub tcpi_retransmits: u8,
        pub tcpi_probes: u8,
        pub tcpi_backoff: u8,
        pub tcpi_options: u8,
        pub tcpi_wscale: u8,
        pub tcpi_flags: u8,

        pub tcpi_rto: u32,
        pub tcpi_ato: u32,
        pub tcpi_snd_mss: u32,
        pub tcpi_rcv_mss: u32,

        pub tcpi_unacked: u32,
        pub tcpi_sacked: u32,
        pub tcpi_lost: u32,
        pub tcpi_retrans: u32,
        pub tcpi_fackets: u32,

        pub tcpi_last_data_sent: u32,
        pub tcpi_last_ack_sent: u32,
        pub tcpi_last_data_recv: u32,
        pub tcpi_last_ack_recv: u32,

        pub tcpi_pmtu: u32,
        pub tcpi_rcv_ssthresh: u32,
        pub tcpi_rtt: u32,
        pub tcpi_rttvar: u32,
        pub tcpi_snd_ssthresh: u32,
        pub tcpi_snd_cwnd: u32,
        pub tcpi_advmss: u32,
        pub tcpi_reordering: u32,

        pub tcpi_rcv_rtt: u32,
        pub tcpi_rcv_space: u32,

        pub tcpi_total_retrans: u32,
    }

    pub(super) fn getsockopt_tcp_info(fd: RawFd) -> Result<RawTcpInfo> {
        let mut info = RawTcpInfo::default();
        let mut len = mem::size_of::<RawTcpInfo>() as libc::socklen_t;

        // SAFETY: `info` is a plain repr(C) struct of integers and `len` holds
        // its exact size, so the kernel writes at most that many bytes.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_INFO,
                (&mut info as *mut RawTcpInfo).cast::<libc::c_void>(),
                &mut len,
            )
        };

        if rc != 0 {
            let err = std::io::Error::last_os_error();
            bail!("getsockopt(TCP_INFO): {err}");
        }

        if (len as usize) < mem::size_of::<RawTcpInfo>() {
            bail!(
                "getsockopt(TCP_INFO) returned {len} bytes, expected {}",
                mem::size_of::<RawTcpInfo>()
            );
        }

        Ok(info)
    }

    impl From<RawTcpInfo> for DiagnosticsSnapshot {
        fn from(raw: RawTcpInfo) -> Self {
            Self {
                retransmits: u32::from(raw.tcpi_retransmits),
                send_segment_size: raw.tcpi_snd_mss,
                receive_segment_size: raw.tcpi_rcv_mss,
                lost_segments: raw.tcpi_lost,
                retransmitted_segments: raw.tcpi_retrans,
                path_mtu: raw.tcpi_pmtu,
                round_trip_time_us: raw.tcpi_rtt,
                round_trip_time_variance_us: raw.tcpi_rttvar,
                total_retransmits: raw.tcpi_total_retrans,
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_raw_tcp_info_layout() {
            // 8 single-byte fields followed by 24 u32 fields.
            assert_eq!(mem::size_of::<RawTcpInfo>(), 104);
        }

        #[test]
        fn test_snapshot_from_raw() {
            let raw = RawTcpInfo {
                tcpi_retransmits: 2,
                tcpi_snd_mss: 1448,
                tcpi_rcv_mss: 536,
                tcpi_lost: 3,
                tcpi_retrans: 1,
                tcpi_pmtu: 1500,
                tcpi_rtt: 250,
                tcpi_rttvar: 125,
                tcpi_total_retrans: 7,
                ..RawTcpInfo::default()
            };

            let snapshot = DiagnosticsSnapshot::from(raw);
            assert_eq!(snapshot.retransmits, 2);
            assert_eq!(snapshot.send_segment_size, 1448);
            assert_eq!(snapshot.receive_segment_size, 536);
            assert_eq!(snapshot.lost_segments, 3);
            assert_eq!(snapshot.retransmitted_segments, 1);
            assert_eq!(snapshot.path_mtu, 1500);
            assert_eq!(snapshot.round_trip_time_us, 250);
            assert_eq!(snapshot.round_trip_time_variance_us, 125);
            assert_eq!(snapshot.total_retransmits, 7);
        }

        #[test]
        fn test_getsockopt_rejects_non_socket() {
            let err = getsockopt_tcp_info(-1).expect_err("invalid fd");
            assert!(err.to_string().contains("TCP_INFO"));
        }
    }
}
