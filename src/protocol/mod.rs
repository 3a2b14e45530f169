//! Newline-delimited request/acknowledge protocol shared by the probe client
//! and the server connection handler.
//!
//! Every frame is an arbitrary byte payload terminated by `\n`. The receiver
//! answers each frame it reads with `ACK\n`; a sender only proceeds to its next
//! frame once that acknowledgement has arrived. The literal `EOS` frame ends
//! the exchange.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

/// Frame delimiter.
pub const DELIMITER: u8 = b'\n';

/// End-of-stream marker frame.
pub const END_OF_STREAM: &str = "EOS";

/// Acknowledge reply sent after every frame read.
pub const ACK: &str = "ACK";

/// Filler byte used to build probe payloads.
pub const FILLER_BYTE: u8 = b'a';

/// Errors produced by a single frame exchange.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The peer closed the transport before a full reply arrived.
    #[error("EOF")]
    Eof,

    /// The reply to a frame was something other than `ACK`.
    #[error("unexpected reply {reply:?}, expected {ACK}")]
    UnexpectedReply { reply: String },

    /// The payload would be split by the frame delimiter.
    #[error("payload contains the frame delimiter at offset {offset}")]
    DelimiterInPayload { offset: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns true when the error is the peer closing the connection.
    pub fn is_eof(&self) -> bool {
        match self {
            Self::Eof => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}

/// Meaning of a received frame, after trimming surrounding whitespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Nothing but whitespace. Typically a liveness/readiness check.
    Empty,
    /// The `EOS` marker.
    EndOfStream,
    /// Opaque test data.
    Payload,
}

impl FrameKind {
    /// Classify a received line.
    pub fn classify(line: &str) -> Self {
        match line.trim() {
            "" => Self::Empty,
            END_OF_STREAM => Self::EndOfStream,
            _ => Self::Payload,
        }
    }
}

/// Append the delimiter to `payload`, rejecting payloads that contain it.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if let Some(offset) = payload.iter().position(|b| *b == DELIMITER) {
        return Err(ProtocolError::DelimiterInPayload { offset });
    }

    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.extend_from_slice(payload);
    frame.push(DELIMITER);
    Ok(frame)
}

/// Build a probe payload of `len` filler bytes.
pub fn filler_payload(len: usize) -> Vec<u8> {
    vec![FILLER_BYTE; len]
}

/// Succeeds only if the trimmed reply is exactly `ACK`.
pub fn check_ack(reply: &str) -> Result<(), ProtocolError> {
    if reply.trim() == ACK {
        Ok(())
    } else {
        Err(ProtocolError::UnexpectedReply {
            reply: reply.to_string(),
        })
    }
}

/// A duplex byte stream speaking the frame protocol.
///
/// Reads go through a single buffer that lives as long as the connection, so
/// bytes that arrive together with a reply are never discarded.
pub struct FrameStream<S> {
    inner: BufReader<S>,
}

impl<S> FrameStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            inner: BufReader::new(stream),
        }
    }

    /// Returns the underlying stream.
    pub fn get_ref(&self) -> &S {
        self.inner.get_ref()
    }

    /// Consumes the wrapper, returning the underlying stream.
    pub fn into_inner(self) -> S {
        self.inner.into_inner()
    }

    /// Write one frame, then block until the peer acknowledges it.
    pub async fn send_frame(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        let frame = encode_frame(payload)?;
        debug!(bytes = frame.len(), "sending frame");

        let stream = self.inner.get_mut();
        stream.write_all(&frame).await?;
        stream.flush().await?;

        let reply = self.read_frame().await?.ok_or(ProtocolError::Eof)?;
        debug!(reply = %reply.trim(), "received reply");

        check_ack(&reply)
    }

    /// Send the `EOS` marker and wait for its acknowledgement.
    pub async fn send_end_of_stream(&mut self) -> Result<(), ProtocolError> {
        self.send_frame(END_OF_STREAM.as_bytes()).await
    }

    /// Read one delimited line.
    ///
    /// Returns `Ok(None)` when the peer closed the transport without sending
    /// any further bytes. A final line without a delimiter is returned as-is.
    pub async fn read_frame(&mut self) -> Result<Option<String>, ProtocolError> {
        let mut buf = Vec::new();
        let n = self.inner.read_until(DELIMITER, &mut buf).await?;
        if n == 0 {
            return Ok(None);
        }

        if buf.last() == Some(&DELIMITER) {
            buf.pop();
        }

        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    /// Reply to a received frame.
    pub async fn acknowledge(&mut self) -> Result<(), ProtocolError> {
        let stream = self.inner.get_mut();
        stream.write_all(b"ACK\n").await?;
        stream.flush().await?;
        Ok(())
    }

    /// Shut down the write half. Errors are ignored; the peer may already be gone.
    pub async fn close(&mut self) {
        if let Err(e) = self.inner.get_mut().shutdown().await {
            debug!(error = %e, "shutting down stream");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    #[test]
    fn test_classify_frames() {
        assert_eq!(FrameKind::classify(""), FrameKind::Empty);
        assert_eq!(FrameKind::classify("  \r"), FrameKind::Empty);
        assert_eq!(FrameKind::classify("EOS"), FrameKind::EndOfStream);
        assert_eq!(FrameKind::classify(" EOS\r"), FrameKind::EndOfStream);
        assert_eq!(FrameKind::classify("aaaa"), FrameKind::Payload);
        assert_eq!(FrameKind::classify("EOSX"), FrameKind::Payload);
    }

    #[test]
    fn test_encode_frame_appends_delimiter() {
        let frame = encode_frame(b"abc").expect("valid payload");
        assert_eq!(frame, b"abc\n");

        let empty = encode_frame(b"").expect("empty payload is a frame");
        assert_eq!(empty, b"\n");
    }

    #[test]
    fn test_encode_frame_rejects_delimiter() {
        let err = encode_frame(b"ab\ncd").expect_err("delimiter inside payload");
        assert!(matches!(err, ProtocolError::DelimiterInPayload { offset: 2 }));
    }

    #[test]
    fn test_filler_payload() {
        let payload = filler_payload(10);
        assert_eq!(payload.len(), 10);
        assert!(payload.iter().all(|b| *b == FILLER_BYTE));
        assert!(filler_payload(0).is_empty());
    }

    #[test]
    fn test_check_ack() {
        assert!(check_ack("ACK").is_ok());
        assert!(check_ack("ACK\r").is_ok());
        assert!(check_ack("  ACK ").is_ok());

        for reply in ["", "NACK", "ACKACK", "ack", "EOS"] {
            let err = check_ack(reply).expect_err("only ACK is accepted");
            assert!(matches!(err, ProtocolError::UnexpectedReply { .. }), "{reply:?}");
        }
    }

    #[test]
    fn test_is_eof() {
        assert!(ProtocolError::Eof.is_eof());
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "closed");
        assert!(ProtocolError::from(io).is_eof());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(!ProtocolError::from(io).is_eof());
        assert!(!ProtocolError::UnexpectedReply {
            reply: String::new()
        }
        .is_eof());
    }

    #[tokio::test]
    async fn test_send_frame_succeeds_on_ack() {
        let (client, server) = duplex(64);
        let mut client = FrameStream::new(client);
        let mut server = FrameStream::new(server);

        let peer = tokio::spawn(async move {
            let line = server.read_frame().await.expect("read").expect("frame");
            server.acknowledge().await.expect("ack");
            line
        });

        client.send_frame(b"hello").await.expect("acknowledged");
        assert_eq!(peer.await.expect("join"), "hello");
    }

    #[tokio::test]
    async fn test_send_frame_fails_on_other_reply() {
        let (client, mut server) = duplex(64);
        let mut client = FrameStream::new(client);

        tokio::spawn(async move {
            let mut buf = [0u8; 6];
            server.read_exact(&mut buf).await.expect("read");
            server.write_all(b"NOPE\n").await.expect("write");
        });

        let err = client.send_frame(b"hello").await.expect_err("not ACK");
        match err {
            ProtocolError::UnexpectedReply { reply } => assert_eq!(reply, "NOPE"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_send_frame_fails_on_empty_reply() {
        let (client, mut server) = duplex(64);
        let mut client = FrameStream::new(client);

        tokio::spawn(async move {
            let mut buf = [0u8; 2];
            server.read_exact(&mut buf).await.expect("read");
            server.write_all(b"\n").await.expect("write");
        });

        let err = client.send_frame(b"x").await.expect_err("empty reply");
        assert!(matches!(err, ProtocolError::UnexpectedReply { .. }));
    }

    #[tokio::test]
    async fn test_send_frame_reports_eof() {
        let (client, mut server) = duplex(64);
        let mut client = FrameStream::new(client);

        tokio::spawn(async move {
            let mut buf = [0u8; 2];
            server.read_exact(&mut buf).await.expect("read");
            drop(server);
        });

        let err = client.send_frame(b"x").await.expect_err("peer closed");
        assert!(err.is_eof());
    }

    #[tokio::test]
    async fn test_read_frame_keeps_buffered_bytes() {
        let (client, mut server) = duplex(64);
        let mut client = FrameStream::new(client);

        server.write_all(b"first\nsecond\nlast").await.expect("write");
        drop(server);

        assert_eq!(client.read_frame().await.expect("read"), Some("first".into()));
        assert_eq!(client.read_frame().await.expect("read"), Some("second".into()));
        assert_eq!(client.read_frame().await.expect("read"), Some("last".into()));
        assert_eq!(client.read_frame().await.expect("read"), None);
    }
}
