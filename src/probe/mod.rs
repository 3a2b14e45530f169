//! Probe client: dial, snapshot TCP diagnostics, exchange frames, close.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::net::TcpStream;
use tracing::{debug, error};

use crate::diagnostics::{self, DiagnosticsSnapshot};
use crate::export::{LabelTuple, MetricsSink};
use crate::identity::LocalIdentity;
use crate::pacing::Pacing;
use crate::protocol::{filler_payload, FrameStream, ProtocolError};

/// Issues single probes against a destination and records their diagnostics.
#[derive(Clone)]
pub struct ProbeClient {
    sink: Arc<dyn MetricsSink>,
    node_name: String,
    identity: Option<LocalIdentity>,
    timeout: Option<Duration>,
}

impl ProbeClient {
    pub fn new(sink: Arc<dyn MetricsSink>, node_name: impl Into<String>) -> Self {
        Self {
            sink,
            node_name: node_name.into(),
            identity: None,
            timeout: None,
        }
    }

    /// Use a fixed identity instead of resolving the local host on every probe.
    pub fn with_identity(mut self, identity: LocalIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Bound each probe's total duration. Without it a peer that never
    /// acknowledges holds the probe forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Probe `destination` once with a payload of `payload_len` filler bytes.
    ///
    /// Diagnostics are recorded as soon as they are read, so a later frame
    /// failure still leaves them in the sink. The connection is closed on
    /// every path.
    pub async fn probe(&self, destination: &str, payload_len: usize) -> Result<DiagnosticsSnapshot> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.probe_once(destination, payload_len))
                .await
                .map_err(|_| anyhow!("probe of {destination} timed out after {limit:?}"))?,
            None => self.probe_once(destination, payload_len).await,
        }
    }

    async fn probe_once(&self, destination: &str, payload_len: usize) -> Result<DiagnosticsSnapshot> {
        let stream = TcpStream::connect(destination)
            .await
            .with_context(|| format!("dialing {destination}"))?;

        if let Ok(local) = stream.local_addr() {
            debug!(%local, %destination, "connected");
        }

        let snapshot = diagnostics::read_snapshot(&stream)
            .with_context(|| format!("fetching TCP info for {destination}"))?;

        let identity = self.local_identity().await?;
        let labels = LabelTuple::new(destination, identity.source_addresses, identity.node_name);
        snapshot.record(self.sink.as_ref(), &labels);

        let mut frames = FrameStream::new(stream);
        let exchange = async {
            frames.send_frame(&filler_payload(payload_len)).await?;
            frames.send_end_of_stream().await
        }
        .await;
        frames.close().await;
        debug!(%destination, "client finished sending");

        exchange.with_context(|| format!("exchanging frames with {destination}"))?;

        Ok(snapshot)
    }

    async fn local_identity(&self) -> Result<LocalIdentity> {
        match &self.identity {
            Some(identity) => Ok(identity.clone()),
            None => LocalIdentity::resolve(&self.node_name)
                .await
                .context("resolving local identity"),
        }
    }
}

/// True when a probe error is the peer closing the connection, which is
/// the expected way for an exchange to end early.
pub fn is_benign(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<ProtocolError>())
        .any(ProtocolError::is_eof)
}

/// Probe one destination `times` times in sequence (0 = forever), pausing
/// between rounds.
///
/// Peer-closed errors are ignored; every other failure is logged and the
/// last one is returned once the rounds are done.
pub async fn run_sequential(
    client: &ProbeClient,
    destination: &str,
    payload_len: usize,
    times: u64,
    pacing: Pacing,
) -> Result<()> {
    let mut last_err = None;
    let mut sent: u64 = 0;

    loop {
        debug!(%destination, "sending TCP test");

        if let Err(e) = client.probe(destination, payload_len).await {
            if !is_benign(&e) {
                error!(error = %format!("{e:#}"), %destination, "probe failed");
                last_err = Some(e);
            }
        }

        if times != 0 {
            sent += 1;
            if sent >= times {
                debug!(times, %destination, "finished sending");
                break;
            }
        }

        pacing.sleep().await;
    }

    match last_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{PrometheusSink, ProbeHistogram};
    use crate::server::{serve, ConnectionHandler};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    fn identity() -> LocalIdentity {
        LocalIdentity {
            source_addresses: "127.0.0.1".to_string(),
            node_name: "node-a".to_string(),
        }
    }

    fn client(sink: &Arc<PrometheusSink>) -> ProbeClient {
        let sink: Arc<dyn MetricsSink> = sink.clone();
        ProbeClient::new(sink, "node-a").with_identity(identity())
    }

    #[test]
    fn test_is_benign() {
        let eof = anyhow::Error::from(ProtocolError::Eof).context("exchanging frames");
        assert!(is_benign(&eof));

        let mismatch = anyhow::Error::from(ProtocolError::UnexpectedReply {
            reply: "NOPE".into(),
        });
        assert!(!is_benign(&mismatch));

        assert!(!is_benign(&anyhow!("dialing somewhere")));
    }

    #[tokio::test]
    async fn test_probe_against_server() {
        let sink = Arc::new(PrometheusSink::new().expect("sink"));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let cancel = CancellationToken::new();
        let handler = ConnectionHandler::new(sink.clone());
        tokio::spawn(serve(listener, handler, cancel.clone()));

        let client = client(&sink);
        client.probe(&addr, 8).await.expect("probe succeeds");

        let labels = LabelTuple::new(addr.as_str(), "127.0.0.1", "node-a");
        assert_eq!(
            sink.histogram_count(ProbeHistogram::RoundTripTimeSeconds, &labels),
            1
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_dial_failure_records_nothing() {
        let sink = Arc::new(PrometheusSink::new().expect("sink"));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        drop(listener);

        let err = client(&sink).probe(&addr, 8).await.expect_err("refused");
        assert!(err.to_string().contains("dialing"));
        assert!(!is_benign(&err));

        let labels = LabelTuple::new(addr.as_str(), "127.0.0.1", "node-a");
        assert_eq!(
            sink.histogram_count(ProbeHistogram::RoundTripTimeSeconds, &labels),
            0
        );
    }

    #[tokio::test]
    async fn test_bad_ack_keeps_recorded_diagnostics() {
        let sink = Arc::new(PrometheusSink::new().expect("sink"));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 9];
            stream.read_exact(&mut buf).await.expect("read payload");
            stream.write_all(b"NOPE\n").await.expect("write");
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        });

        let err = client(&sink).probe(&addr, 8).await.expect_err("bad ACK");
        assert!(!is_benign(&err));

        let labels = LabelTuple::new(addr.as_str(), "127.0.0.1", "node-a");
        assert_eq!(
            sink.histogram_count(ProbeHistogram::RoundTripTimeSeconds, &labels),
            1
        );
    }

    #[tokio::test]
    async fn test_timeout_bounds_silent_peer() {
        let sink = Arc::new(PrometheusSink::new().expect("sink"));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            // Never acknowledge.
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let client = client(&sink).with_timeout(Some(Duration::from_millis(200)));
        let err = client.probe(&addr, 8).await.expect_err("timed out");
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_run_sequential_repeats() {
        let sink = Arc::new(PrometheusSink::new().expect("sink"));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, ConnectionHandler::new(sink.clone()), cancel.clone()));

        let pacing = Pacing::new(Duration::from_millis(1), Duration::from_millis(1));
        run_sequential(&client(&sink), &addr, 8, 10, pacing)
            .await
            .expect("all rounds succeed");

        let labels = LabelTuple::new(addr.as_str(), "127.0.0.1", "node-a");
        assert_eq!(
            sink.histogram_count(ProbeHistogram::RoundTripTimeSeconds, &labels),
            10
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_run_sequential_returns_dial_error() {
        let sink = Arc::new(PrometheusSink::new().expect("sink"));
        let pacing = Pacing::new(Duration::from_millis(1), Duration::ZERO);

        let err = run_sequential(&client(&sink), "some_string", 16, 1, pacing)
            .await
            .expect_err("invalid address");
        assert!(err.to_string().contains("some_string"));
    }
}
