//! Accepts SMTP connections and drives each one through a `Session`, with a
//! registry of in-flight connections so the listener can wait for them to
//! drain (briefly) on shutdown.

mod email_parser;
mod line_codec;
pub mod session;
pub mod tls;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::store::EmailStore;
use session::{Session, SessionConfig, SessionEnd};
use tls::MailStream;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Owns the listening socket and the set of currently active connections.
pub struct Server {
    config: Config,
    store: Arc<dyn EmailStore>,
    tls_acceptor: Option<Arc<rustls::ServerConfig>>,
    connections: Arc<Mutex<HashMap<u64, CancellationToken>>>,
    next_conn_id: AtomicU64,
}

impl Server {
    pub fn new(config: Config, store: Arc<dyn EmailStore>) -> Result<Self> {
        let tls_acceptor = if config.tls.enabled {
            let cert = config
                .tls
                .cert_file
                .as_deref()
                .context("tls.enabled is true but no cert_file was configured")?;
            let key = config
                .tls
                .key_file
                .as_deref()
                .context("tls.enabled is true but no key_file was configured")?;
            Some(tls::build_server_config(
                std::path::Path::new(cert),
                std::path::Path::new(key),
            )?)
        } else {
            None
        };

        Ok(Server {
            config,
            store,
            tls_acceptor,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_conn_id: AtomicU64::new(1),
        })
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            domain: self.config.domain.clone(),
            // A single DATA line can legitimately be as long as the whole
            // message; the line ceiling must not be tighter than that or a
            // long line gets split mid-body and the remainder is misread as
            // a command (spec.md §4.1).
            max_line_bytes: self.config.max_message_bytes,
            max_message_bytes: self.config.max_message_bytes,
            max_recipients: self.config.max_recipients,
            read_timeout: Duration::from_secs(self.config.read_timeout_seconds),
            write_timeout: Duration::from_secs(self.config.write_timeout_seconds),
            auth_required: self.config.auth.required,
            auth_username: self.config.auth.username.clone(),
            auth_password: self.config.auth.password.clone(),
            tls_acceptor: self.tls_acceptor.clone(),
        }
    }

    /// Binds and accepts connections until `shutdown` is cancelled, then
    /// waits up to `DRAIN_TIMEOUT` for in-flight sessions before returning.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind SMTP listener on {addr}"))?;
        info!("SMTP sink listening on {addr}");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested, no longer accepting new connections");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.spawn_connection(stream, peer.to_string(), &shutdown),
                        Err(e) => error!("error accepting connection: {e:#}"),
                    }
                }
            }
        }

        self.drain_connections().await;
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer: String, shutdown: &CancellationToken) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let conn_token = shutdown.child_token();
        self.connections.lock().unwrap().insert(conn_id, conn_token.clone());

        let session_cfg = self.session_config();
        let store = self.store.clone();
        let connections = self.connections.clone();

        info!("connection {conn_id} accepted from {peer}");

        tokio::spawn(async move {
            let result = tokio::select! {
                res = handle_connection(stream, session_cfg, store, peer.clone()) => res,
                _ = conn_token.cancelled() => {
                    debug!("connection {conn_id} cancelled by shutdown");
                    Ok(())
                }
            };
            if let Err(e) = result {
                warn!("connection {conn_id} from {peer} ended with error: {e:#}");
            }
            connections.lock().unwrap().remove(&conn_id);
        });
    }

    async fn drain_connections(&self) {
        let tokens: Vec<CancellationToken> = {
            let guard = self.connections.lock().unwrap();
            guard.values().cloned().collect()
        };
        if tokens.is_empty() {
            return;
        }
        info!("waiting up to {:?} for {} connection(s) to drain", DRAIN_TIMEOUT, tokens.len());

        let wait_empty = async {
            loop {
                if self.connections.lock().unwrap().is_empty() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };

        if tokio::time::timeout(DRAIN_TIMEOUT, wait_empty).await.is_err() {
            warn!("drain timeout elapsed, cancelling remaining connections");
            for token in tokens {
                token.cancel();
            }
        }
    }
}

/// Runs the session dialogue on `stream`, looping back in after a STARTTLS
/// handshake to continue it over the upgraded transport.
async fn handle_connection(
    stream: TcpStream,
    cfg: SessionConfig,
    store: Arc<dyn EmailStore>,
    peer: String,
) -> Result<()> {
    let tls_acceptor = cfg.tls_acceptor.clone();
    let mut session = Session::new(MailStream::Plain(stream), cfg, store, peer.clone());

    loop {
        match session.run().await? {
            SessionEnd::Quit => {
                info!("connection from {peer} closed (QUIT)");
                return Ok(());
            }
            SessionEnd::Eof => {
                info!("connection from {peer} closed (EOF)");
                return Ok(());
            }
            SessionEnd::Timeout => {
                info!("connection from {peer} closed (read timeout)");
                return Ok(());
            }
            SessionEnd::StartTls => {
                let Some(server_config) = tls_acceptor.as_ref() else {
                    // The session only emits StartTls when it has already
                    // confirmed tls_acceptor is configured.
                    unreachable!("STARTTLS accepted without a configured acceptor");
                };
                let plain = session.take_transport();
                match tls::upgrade(plain, server_config).await? {
                    tls::Upgrade::Upgraded(upgraded) => session.install_transport(upgraded),
                    tls::Upgrade::Failed { stream, reason } => {
                        warn!("TLS handshake with {peer} failed: {reason}");
                        session.restore_transport(stream);
                        session.reply_tls_unavailable(&reason).await?;
                    }
                }
            }
        }
    }
}
