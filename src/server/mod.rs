//! Server side of the probe protocol.
//!
//! The accept loop hands every connection to its own task running
//! [`ConnectionHandler::handle`], so a slow or idle peer never delays the
//! next accept.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::export::{MetricsSink, ProcessCounter};
use crate::protocol::{FrameKind, FrameStream, ProtocolError};

/// Grace period before closing a connection that sent an empty frame or
/// hung up without sending anything. Readiness checks that open and
/// immediately close would otherwise race the close.
pub const IDLE_LINGER: Duration = Duration::from_secs(5);

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The peer sent `EOS`; closed immediately.
    EndOfStream,
    /// The peer hung up after exchanging frames; closed immediately.
    PeerClosed,
    /// Closed once the idle-linger deadline passed.
    Linger,
}

/// Runs the receive state machine for one accepted connection at a time.
#[derive(Clone)]
pub struct ConnectionHandler {
    sink: Arc<dyn MetricsSink>,
    linger: Duration,
}

impl ConnectionHandler {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            sink,
            linger: IDLE_LINGER,
        }
    }

    /// Override the idle-linger grace period.
    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    /// Serve one connection until `EOS`, the linger deadline, or a read error.
    ///
    /// Every frame read is acknowledged. An empty frame arms the linger
    /// deadline but keeps reading. The transport closing without `EOS` ends
    /// without error: at once if frames were exchanged and no linger is armed,
    /// otherwise after the deadline. Any other read error is returned.
    pub async fn handle<S>(&self, stream: S) -> Result<Termination, ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut frames = FrameStream::new(stream);
        let mut counted = false;
        let mut linger_deadline: Option<Instant> = None;

        loop {
            let read = match linger_deadline {
                Some(deadline) => {
                    tokio::select! {
                        read = frames.read_frame() => read,
                        _ = sleep_until(deadline) => {
                            debug!("idle linger elapsed, closing connection");
                            frames.close().await;
                            return Ok(Termination::Linger);
                        }
                    }
                }
                None => frames.read_frame().await,
            };

            let line = match read {
                Ok(Some(line)) => line,
                Ok(None) if counted && linger_deadline.is_none() => {
                    debug!("peer closed after exchanging frames");
                    frames.close().await;
                    return Ok(Termination::PeerClosed);
                }
                Ok(None) => {
                    // Silent peer, or an empty frame already armed the linger.
                    let deadline =
                        linger_deadline.unwrap_or_else(|| Instant::now() + self.linger);
                    debug!("peer closed without EOS, lingering before close");
                    sleep_until(deadline).await;
                    frames.close().await;
                    return Ok(Termination::Linger);
                }
                Err(e) => {
                    error!(error = %e, "reading frame");
                    return Err(e);
                }
            };

            if let Err(e) = frames.acknowledge().await {
                debug!(error = %e, "writing ACK");
            }

            if !counted {
                self.sink.increment(ProcessCounter::ConnectionsHandled);
                counted = true;
            }

            match FrameKind::classify(&line) {
                FrameKind::Empty => {
                    if linger_deadline.is_none() {
                        debug!(linger = ?self.linger, "empty frame, scheduling close");
                        linger_deadline = Some(Instant::now() + self.linger);
                    }
                }
                FrameKind::EndOfStream => {
                    frames.close().await;
                    return Ok(Termination::EndOfStream);
                }
                FrameKind::Payload => {
                    debug!(bytes = line.len(), "received payload frame");
                }
            }
        }
    }
}

/// Accept connections until accepting fails or `cancel` fires.
///
/// Each connection is served on its own task. Only an accept error ends the
/// loop with an error.
pub async fn serve(
    listener: TcpListener,
    handler: ConnectionHandler,
    cancel: CancellationToken,
) -> Result<()> {
    let local_addr = listener.local_addr().context("getting listener address")?;
    info!(addr = %local_addr, "probe server accepting connections");

    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("probe server stopped");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "accepting connection");
                    return Err(e).context("accepting connection");
                }
            },
        };

        let handler = handler.clone();
        tokio::spawn(async move {
            serve_connection(handler, stream, peer).await;
        });
    }
}

async fn serve_connection(handler: ConnectionHandler, stream: tokio::net::TcpStream, peer: SocketAddr) {
    debug!(%peer, "serving connection");

    match handler.handle(stream).await {
        Ok(termination) => debug!(%peer, ?termination, "finished serving connection"),
        Err(e) => debug!(%peer, error = %e, "connection ended with error"),
    }
}

/// Drive `work` while the accept loop in `server` keeps running.
///
/// If the server task ends first, `cancel` fires and its outcome is returned,
/// so a failed accept loop stops the process instead of leaving it probing
/// without a listener. Once `work` finishes, `cancel` fires and the server's
/// own result is returned.
pub async fn run_alongside<F>(
    mut server: JoinHandle<Result<()>>,
    work: F,
    cancel: CancellationToken,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    tokio::select! {
        joined = &mut server => {
            cancel.cancel();
            return server_outcome(joined);
        }
        _ = work => {}
    }

    cancel.cancel();
    server_outcome(server.await)
}

fn server_outcome(joined: Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result.context("probe server stopped"),
        Err(e) => Err(e).context("probe server task failed"),
    }
}
