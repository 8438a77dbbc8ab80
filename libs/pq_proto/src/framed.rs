//! Message framing over a socket-or-TLS transport façade.
//!
//! All engine I/O with the server goes through [`Framed`], which owns the
//! read buffer and hands out parsed [`BeMessage`]s. In COPY mode the same
//! buffer backs the [`StreamBuffer`] demultiplexer, so several logical
//! messages can share one transport read.

use bytes::{Buf, Bytes, BytesMut};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use crate::{BeMessage, FeMessage, ProtocolError, StreamBuffer};
use utils::rate_limit::TokenBucket;

/// Transient empty reads are retried this many times, sleeping
/// [`TRANSIENT_RETRY_SLEEP`] between attempts, before the connection is
/// declared gone.
const TRANSIENT_READ_RETRIES: u32 = 5;
const TRANSIENT_RETRY_SLEEP: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out waiting for server reply")]
    Timeout,
    #[error("connection closed by server")]
    Eof,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Either a plain TCP socket or a client TLS session over one. Short TLS
/// reads/writes are resumed by the TLS layer, so callers see whole-message
/// semantics either way.
pub enum MaybeTlsStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Framed reader/writer over the transport. The read side is a
/// [`StreamBuffer`], so several logical messages arriving in one
/// transport read are drained without further I/O.
pub struct Framed {
    stream: MaybeTlsStream,
    read_buf: StreamBuffer,
    write_buf: BytesMut,
    /// Consumed per byte read while in COPY mode, when configured.
    network_bucket: Option<Arc<TokenBucket>>,
}

impl Framed {
    pub fn new(stream: MaybeTlsStream) -> Self {
        Framed {
            stream,
            read_buf: StreamBuffer::new(),
            write_buf: BytesMut::with_capacity(8 * 1024),
            network_bucket: None,
        }
    }

    pub fn set_network_bucket(&mut self, bucket: Option<Arc<TokenBucket>>) {
        self.network_bucket = bucket;
    }

    pub fn into_inner(self) -> MaybeTlsStream {
        self.stream
    }

    pub fn inner_mut(&mut self) -> &mut MaybeTlsStream {
        &mut self.stream
    }

    /// Send one frontend message and flush.
    pub async fn send(&mut self, msg: &FeMessage<'_>) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        msg.write(&mut self.write_buf);
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Queue a frontend message without flushing.
    pub fn send_noflush(&mut self, msg: &FeMessage<'_>) {
        msg.write(&mut self.write_buf);
    }

    /// Flush previously queued messages.
    pub async fn flush(&mut self) -> Result<(), ConnectionError> {
        self.stream.write_all(&self.write_buf).await?;
        self.write_buf.clear();
        self.stream.flush().await?;
        Ok(())
    }

    /// Read one backend message, blocking until it is complete.
    pub async fn read_message(&mut self) -> Result<BeMessage, ConnectionError> {
        let (kind, payload) = self.read_raw_frame().await?;
        Ok(BeMessage::parse(kind, payload)?)
    }

    /// Read one backend message, failing with [`ConnectionError::Timeout`]
    /// if no complete message arrives within `timeout`.
    pub async fn read_message_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<BeMessage, ConnectionError> {
        tokio::time::timeout(timeout, self.read_message())
            .await
            .map_err(|_| ConnectionError::Timeout)?
    }

    /// Read the raw `(kind, payload)` of the next frame.
    pub async fn read_raw_frame(&mut self) -> Result<(u8, Bytes), ConnectionError> {
        loop {
            if let Some(message) = self.read_buf.next_any_message()? {
                return Ok(message);
            }
            self.read_more().await?;
        }
    }

    /// Read the single-byte server answer to an SSLRequest ('S' or 'N').
    pub async fn read_ssl_answer(&mut self) -> Result<u8, ConnectionError> {
        if self.read_buf.is_empty() {
            self.read_more().await?;
        }
        let buf = self.read_buf.buf_mut();
        let answer = buf[0];
        buf.advance(1);
        Ok(answer)
    }

    /// Pull more bytes off the transport into the read buffer. Empty reads
    /// are treated as transient and retried a bounded number of times.
    async fn read_more(&mut self) -> Result<(), ConnectionError> {
        let mut attempt = 0;
        loop {
            let n = self.stream.read_buf(self.read_buf.buf_mut()).await?;
            if n > 0 {
                if let Some(bucket) = &self.network_bucket {
                    bucket.acquire(n as u64).await;
                }
                return Ok(());
            }
            attempt += 1;
            if attempt > TRANSIENT_READ_RETRIES {
                return Err(ConnectionError::Eof);
            }
            debug!("empty read from server, retrying (attempt {attempt})");
            tokio::time::sleep(TRANSIENT_RETRY_SLEEP).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn pair() -> (MaybeTlsStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (MaybeTlsStream::Tcp(client), server)
    }

    #[tokio::test]
    async fn reads_message_split_across_writes() {
        let (client, mut server) = pair().await;
        let mut framed = Framed::new(client);

        // ReadyForQuery, written in two chunks.
        let wire = [b'Z', 0, 0, 0, 5, b'I'];
        server.write_all(&wire[..2]).await.unwrap();
        let read = tokio::spawn(async move { framed.read_message().await.unwrap() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.write_all(&wire[2..]).await.unwrap();

        match read.await.unwrap() {
            BeMessage::ReadyForQuery(status) => assert_eq!(status, b'I'),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn timed_read_fails_with_timeout() {
        let (client, _server) = pair().await;
        let mut framed = Framed::new(client);
        match framed.read_message_timeout(Duration::from_millis(50)).await {
            Err(ConnectionError::Timeout) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_then_read_roundtrip() {
        let (client, mut server) = pair().await;
        let mut framed = Framed::new(client);
        framed.send(&FeMessage::Query("IDENTIFY_SYSTEM")).await.unwrap();

        let mut received = vec![0u8; 21];
        use tokio::io::AsyncReadExt;
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received[0], b'Q');
        assert_eq!(&received[5..], b"IDENTIFY_SYSTEM\0");
    }
}
