//! Buffered line I/O bound to one connection, enforcing read/write
//! deadlines and a maximum line length.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// RFC 5321 mandates 1000 octets including CRLF; this leaves a few KiB of
/// headroom for the long addresses some clients send in practice.
pub const MAX_LINE_LENGTH: usize = 4096;

/// A connection's underlying byte stream: before STARTTLS this is the raw
/// TCP socket, after STARTTLS it's a `tokio_rustls::server::TlsStream`. The
/// session only ever talks to `dyn Stream`, so the swap at STARTTLS time is
/// invisible to everything above `LineIo`.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// Marker placeholder used only while a stream is being swapped out; it is
/// never read from or written to by anything outside [`LineIo::rebuild`]
/// and [`LineIo::replace_stream`].
struct Unplugged;

impl AsyncRead for Unplugged {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        _buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for Unplugged {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::task::Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

/// Outcome of [`LineIo::read_line`].
#[derive(Debug)]
pub enum ReadLineError {
    /// The peer closed the connection (EOF) before sending a complete line.
    ConnectionClosed,
    /// No complete line arrived before the deadline.
    Timeout,
    /// A line exceeded [`MAX_LINE_LENGTH`]; the scanner has already
    /// discarded bytes up to and including the next newline and rebuilt
    /// itself, so the session may continue reading fresh commands.
    TooLong,
    /// The underlying socket returned an I/O error.
    Io(std::io::Error),
}

impl std::fmt::Display for ReadLineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadLineError::ConnectionClosed => write!(f, "connection closed"),
            ReadLineError::Timeout => write!(f, "read timed out"),
            ReadLineError::TooLong => write!(f, "line too long"),
            ReadLineError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for ReadLineError {}

/// Buffered reader/writer bound to one connection.
pub struct LineIo {
    inner: BufReader<Box<dyn Stream>>,
    max_line_len: usize,
}

impl LineIo {
    pub fn new(stream: Box<dyn Stream>) -> Self {
        Self {
            inner: BufReader::new(stream),
            max_line_len: MAX_LINE_LENGTH,
        }
    }

    #[cfg(test)]
    pub fn with_max_line_len(stream: Box<dyn Stream>, max_line_len: usize) -> Self {
        Self {
            inner: BufReader::new(stream),
            max_line_len,
        }
    }

    /// Reads one CRLF (or bare LF)-terminated line, not including the
    /// terminator, bounded by `deadline`.
    ///
    /// On [`ReadLineError::TooLong`] the scanner has already recovered: the
    /// remainder of the oversized line has been discarded up to the next
    /// newline and the internal buffer rebuilt, so the caller only needs to
    /// send the error reply and an implicit RSET before continuing.
    pub async fn read_line(&mut self, deadline: Duration) -> Result<Vec<u8>, ReadLineError> {
        let mut buf = Vec::new();
        let read = tokio::time::timeout(deadline, self.inner.read_until(b'\n', &mut buf))
            .await
            .map_err(|_| ReadLineError::Timeout)?
            .map_err(ReadLineError::Io)?;

        if read == 0 {
            return Err(ReadLineError::ConnectionClosed);
        }

        if buf.len() > self.max_line_len {
            self.discard_until_newline_and_rebuild(deadline, &buf).await?;
            return Err(ReadLineError::TooLong);
        }

        while buf.last() == Some(&b'\n') || buf.last() == Some(&b'\r') {
            buf.pop();
        }
        Ok(buf)
    }

    /// Consumes bytes until the newline that ended the oversized line (if
    /// it hasn't already arrived in `already_read`), then rebuilds the
    /// internal buffer so no partially-read oversized line leaks into the
    /// next logical line.
    async fn discard_until_newline_and_rebuild(
        &mut self,
        deadline: Duration,
        already_read: &[u8],
    ) -> Result<(), ReadLineError> {
        if already_read.last() != Some(&b'\n') {
            loop {
                let mut scratch = Vec::new();
                let read =
                    tokio::time::timeout(deadline, self.inner.read_until(b'\n', &mut scratch))
                        .await
                        .map_err(|_| ReadLineError::Timeout)?
                        .map_err(ReadLineError::Io)?;
                if read == 0 {
                    return Err(ReadLineError::ConnectionClosed);
                }
                if scratch.last() == Some(&b'\n') {
                    break;
                }
            }
        }
        self.rebuild();
        Ok(())
    }

    /// Replaces the internal buffer with a fresh one around the same
    /// stream, discarding any partially-buffered bytes. Used after
    /// line-too-long recovery.
    fn rebuild(&mut self) {
        let stream = self.take_stream();
        self.inner = BufReader::new(stream);
    }

    pub async fn write_line(&mut self, line: &str, deadline: Duration) -> Result<(), std::io::Error> {
        let framed = format!("{line}\r\n");
        tokio::time::timeout(deadline, async {
            self.inner.write_all(framed.as_bytes()).await?;
            self.inner.flush().await
        })
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "write timed out"))??;
        Ok(())
    }

    /// Takes ownership of the underlying stream, leaving a harmless
    /// placeholder behind. Used to perform the STARTTLS handshake, which
    /// needs to consume the plaintext stream and produce a TLS one.
    pub fn take_stream(&mut self) -> Box<dyn Stream> {
        let placeholder = BufReader::new(Box::new(Unplugged) as Box<dyn Stream>);
        std::mem::replace(&mut self.inner, placeholder).into_inner()
    }

    /// Rebuilds the buffered reader/writer around a new stream (the TLS
    /// stream produced by a successful STARTTLS handshake).
    pub fn replace_stream(&mut self, stream: Box<dyn Stream>) {
        self.inner = BufReader::new(stream);
    }
}
