//! Line-delimited JSON framing over TCP.
//!
//! One [`Envelope`] per `\n`-terminated line. A [`PeerConnection`] wraps an
//! outbound stream behind a mutex so a request and its reply are never
//! interleaved with another exchange on the same socket. The first failed
//! exchange discards the stream, so a late reply can never be read by the
//! next request.

use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::error::NetworkError;
use super::message::Envelope;

/// Reads one frame. `Ok(None)` on clean EOF.
pub async fn read_frame<R>(reader: &mut R, max_frame: usize) -> Result<Option<String>, NetworkError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = (&mut *reader)
        .take(max_frame as u64 + 1)
        .read_line(&mut line)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if n > max_frame && !line.ends_with('\n') {
        return Err(NetworkError::FrameTooLarge(n));
    }
    Ok(Some(line))
}

pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
{
    let line = envelope.to_line()?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

struct Framed {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// An outbound connection to one peer.
pub struct PeerConnection {
    addr: String,
    max_frame: usize,
    /// `None` once an exchange has failed or the connection was closed.
    inner: Mutex<Option<Framed>>,
}

impl PeerConnection {
    pub async fn connect(addr: &str, max_frame: usize) -> Result<Self, NetworkError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok(Self {
            addr: addr.to_string(),
            max_frame,
            inner: Mutex::new(Some(Framed {
                reader: BufReader::new(read),
                writer: write,
            })),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Sends `request` and waits for exactly one reply. Waiting for an
    /// in-flight exchange on the same connection counts against `timeout`.
    ///
    /// Any failure drops the stream. Exchanges queued behind it then fail
    /// with [`NetworkError::ConnectionReset`] without sending anything.
    pub async fn exchange(
        &self,
        request: &Envelope,
        timeout: Duration,
        op: &'static str,
    ) -> Result<Envelope, NetworkError> {
        let deadline = Instant::now() + timeout;
        let timed_out = || NetworkError::Timeout {
            peer: self.addr.clone(),
            op,
        };

        let mut slot = tokio::time::timeout_at(deadline, self.inner.lock())
            .await
            .map_err(|_| timed_out())?;
        let Some(framed) = slot.as_mut() else {
            return Err(NetworkError::ConnectionReset(self.addr.clone()));
        };

        let max_frame = self.max_frame;
        let io = async {
            write_frame(&mut framed.writer, request).await?;
            match read_frame(&mut framed.reader, max_frame).await? {
                Some(line) => Ok(Envelope::from_line(&line)?),
                None => Err(NetworkError::ConnectionClosed(self.addr.clone())),
            }
        };
        let outcome = match tokio::time::timeout_at(deadline, io).await {
            Ok(outcome) => outcome,
            Err(_) => Err(timed_out()),
        };
        if outcome.is_err() {
            *slot = None;
        }
        outcome
    }

    /// Whether the stream is still usable.
    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    /// Shuts down the write half; the peer sees EOF.
    pub async fn close(&self) {
        if let Some(mut framed) = self.inner.lock().await.take() {
            let _ = framed.writer.shutdown().await;
        }
    }
}
