//! Reads CRLF-terminated lines off a transport with a per-read deadline and a
//! hard size ceiling; writes lines back out with CRLF appended.
//!
//! Generic over the transport so the same codec works before and after a
//! STARTTLS upgrade (see `smtp::tls`): rebuilding a `LineCodec` around a new
//! stream is how the in-band transport upgrade discards any buffered
//! plaintext, per the session's STARTTLS handling.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Outcome of a single `read_line` call.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A complete line, CRLF or LF terminator included.
    Line(Vec<u8>),
    /// The peer closed the connection (zero-length read).
    Eof,
    /// No line arrived within the configured deadline.
    Timeout,
}

pub struct LineCodec<S> {
    reader: BufReader<S>,
    max_line_bytes: usize,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin> LineCodec<S> {
    pub fn new(
        stream: S,
        max_line_bytes: usize,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            reader: BufReader::new(stream),
            max_line_bytes,
            read_timeout,
            write_timeout,
        }
    }

    /// Reads the next `\n`-terminated line, deadline-bounded by
    /// `read_timeout_seconds`. The terminator is included in the returned
    /// bytes; callers trim it themselves.
    pub async fn read_line(&mut self) -> Result<ReadOutcome> {
        let mut buf = Vec::new();
        let read = tokio::time::timeout(
            self.read_timeout,
            read_line_bounded(&mut self.reader, &mut buf, self.max_line_bytes),
        )
        .await;

        match read {
            Err(_elapsed) => Ok(ReadOutcome::Timeout),
            Ok(Err(e)) => Err(e).context("failed reading line from client"),
            Ok(Ok(0)) => Ok(ReadOutcome::Eof),
            Ok(Ok(_)) => Ok(ReadOutcome::Line(buf)),
        }
    }

    /// Appends CRLF to `line` and flushes. Broken-pipe / connection-reset
    /// errors are swallowed; the session will notice on its next read.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        self.write_bytes_line(line.as_bytes()).await
    }

    pub async fn write_bytes_line(&mut self, line: &[u8]) -> Result<()> {
        let writer = self.reader.get_mut();
        let write = async {
            writer.write_all(line).await?;
            writer.write_all(b"\r\n").await?;
            writer.flush().await
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => swallow_write_error(e),
            Err(_elapsed) => {
                // The peer stopped reading; treat it like a dropped connection
                // rather than a hard error, the next read will surface it.
                Ok(())
            }
        }
    }

    /// Consumes the codec and returns the underlying transport, discarding
    /// any bytes buffered but not yet consumed by the caller. Used by
    /// STARTTLS to swap the stream under the codec.
    pub fn into_inner(self) -> S {
        self.reader.into_inner()
    }
}

fn swallow_write_error(e: std::io::Error) -> Result<()> {
    use std::io::ErrorKind::*;
    match e.kind() {
        BrokenPipe | ConnectionReset | ConnectionAborted => Ok(()),
        _ => Err(e).context("failed writing line to client"),
    }
}

/// Reads until `\n` or `max_bytes` is reached, appending into `buf`.
/// Returns the number of bytes read (0 on EOF before any byte is read).
async fn read_line_bounded<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_bytes: usize,
) -> std::io::Result<usize> {
    let mut total = 0usize;
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return Ok(total);
        }
        total += 1;
        buf.push(byte[0]);
        if byte[0] == b'\n' {
            return Ok(total);
        }
        if buf.len() >= max_bytes {
            return Ok(total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn reads_crlf_terminated_line() {
        let (client, mut server) = duplex(64);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            server.write_all(b"EHLO test\r\n").await.unwrap();
        });
        let mut codec = LineCodec::new(client, 1024, Duration::from_secs(1), Duration::from_secs(1));
        match codec.read_line().await.unwrap() {
            ReadOutcome::Line(line) => assert_eq!(line, b"EHLO test\r\n"),
            other => panic!("expected line, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_on_closed_connection() {
        let (client, server) = duplex(64);
        drop(server);
        let mut codec = LineCodec::new(client, 1024, Duration::from_secs(1), Duration::from_secs(1));
        match codec.read_line().await.unwrap() {
            ReadOutcome::Eof => {}
            other => panic!("expected eof, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_when_nothing_arrives() {
        let (client, server) = duplex(64);
        let mut codec = LineCodec::new(client, 1024, Duration::from_millis(20), Duration::from_secs(1));
        match codec.read_line().await.unwrap() {
            ReadOutcome::Timeout => {}
            other => panic!("expected timeout, got {other:?}"),
        }
        drop(server);
    }

    #[tokio::test]
    async fn line_is_capped_at_max_bytes() {
        let (client, mut server) = duplex(4096);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            server.write_all(&vec![b'a'; 100]).await.unwrap();
        });
        let mut codec = LineCodec::new(client, 10, Duration::from_secs(1), Duration::from_secs(1));
        match codec.read_line().await.unwrap() {
            ReadOutcome::Line(line) => assert_eq!(line.len(), 10),
            other => panic!("expected capped line, got {other:?}"),
        }
    }
}
