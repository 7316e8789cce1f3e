//! In-band STARTTLS transport upgrade.
//!
//! `MailStream` lets a session hold either a plain `TcpStream` or a
//! TLS-wrapped one behind a single type, so swapping the transport under the
//! line codec on STARTTLS doesn't require changing the `Session`'s own type
//! parameter.

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::{Context as _, Result};
use rustls::{ServerConfig, ServerConnection};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

/// Transport for a single SMTP connection, before or after STARTTLS.
pub enum MailStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl MailStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, MailStream::Tls(_))
    }
}

impl AsyncRead for MailStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MailStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MailStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MailStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MailStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MailStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MailStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MailStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MailStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MailStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// The result of attempting a STARTTLS handshake. Unlike
/// `tokio_rustls::TlsAcceptor::accept`, a failure does not consume the
/// socket: the plain stream is handed back so the caller can still reply to
/// the client over it.
pub enum Upgrade {
    Upgraded(MailStream),
    Failed { stream: MailStream, reason: String },
}

/// Upgrades a plain stream to TLS using `config`. Errors only when called on
/// a stream that is already TLS-wrapped; an in-handshake failure is reported
/// as `Upgrade::Failed` with the stream intact, not as an `Err`.
///
/// Driven by hand with `rustls::ServerConnection` rather than
/// `tokio_rustls::TlsAcceptor::accept`, whose `Accept` future owns the
/// underlying `IO` and drops it together with the stream on handshake
/// failure — leaving nothing to write a `454 TLS not available` reply on.
/// Reading/writing TLS records ourselves over the still-owned `TcpStream`
/// keeps the socket available either way.
pub async fn upgrade(stream: MailStream, config: &Arc<ServerConfig>) -> Result<Upgrade> {
    let mut tcp = match stream {
        MailStream::Plain(tcp) => tcp,
        MailStream::Tls(_) => return Err(anyhow::anyhow!("connection is already TLS-wrapped")),
    };

    let mut conn = match ServerConnection::new(config.clone()) {
        Ok(conn) => conn,
        Err(e) => {
            return Ok(Upgrade::Failed {
                stream: MailStream::Plain(tcp),
                reason: e.to_string(),
            })
        }
    };

    match drive_handshake(&mut tcp, &mut conn).await {
        Ok(()) => Ok(Upgrade::Upgraded(MailStream::Tls(Box::new(TlsStream::new(tcp, conn))))),
        Err(e) => Ok(Upgrade::Failed {
            stream: MailStream::Plain(tcp),
            reason: e.to_string(),
        }),
    }
}

/// Pumps TLS records between `tcp` and `conn` until the handshake completes
/// or fails, per the pack's `plustik-kutsche` SMTP server's synchronous
/// `write_tls`/`read_tls`/`process_new_packets` loop, adapted to tokio's
/// async I/O.
async fn drive_handshake(tcp: &mut TcpStream, conn: &mut ServerConnection) -> Result<()> {
    while conn.is_handshaking() {
        if conn.wants_write() {
            let mut out = Vec::new();
            conn.write_tls(&mut out).context("encoding TLS handshake bytes")?;
            if !out.is_empty() {
                tcp.write_all(&out).await.context("sending TLS handshake bytes")?;
            }
        }
        if !conn.is_handshaking() {
            break;
        }
        if conn.wants_read() {
            let mut buf = [0u8; 4096];
            let n = tcp.read(&mut buf).await.context("reading TLS handshake bytes")?;
            if n == 0 {
                return Err(anyhow::anyhow!("peer closed the connection during the TLS handshake"));
            }
            let mut cursor = io::Cursor::new(&buf[..n]);
            conn.read_tls(&mut cursor).context("parsing TLS handshake bytes")?;
            if let Err(e) = conn.process_new_packets() {
                if conn.wants_write() {
                    let mut out = Vec::new();
                    if conn.write_tls(&mut out).is_ok() && !out.is_empty() {
                        let _ = tcp.write_all(&out).await;
                    }
                }
                return Err(anyhow::anyhow!(e.to_string()));
            }
        }
    }
    Ok(())
}

/// Builds the TLS server config from a PEM certificate chain and private
/// key, floored at TLS 1.2, for use with `STARTTLS`.
pub fn build_server_config(cert_file: &Path, key_file: &Path) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(cert_file)?;
    let key = load_private_key(key_file)?;

    let mut config = ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS12,
        &rustls::version::TLS13,
    ])
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .context("failed to build TLS server config")?;

    config.alpn_protocols = vec![b"smtp".to_vec()];

    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open TLS certificate file {}", path.display()))?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse TLS certificate file {}", path.display()))
}

fn load_private_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open TLS private key file {}", path.display()))?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("failed to parse TLS private key file {}", path.display()))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", path.display()))
}
