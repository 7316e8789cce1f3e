//! Drives a single SMTP connection through the command dialogue: greeting,
//! EHLO/HELO, optional STARTTLS and AUTH, the MAIL/RCPT/DATA transaction, and
//! RSET/NOOP/QUIT. One `Session` is spawned per accepted connection; the
//! listener (see `smtp::mod`) owns the actual STARTTLS handshake and
//! reinstalls the upgraded transport via `take_transport`/`install_transport`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use log::{debug, info, warn};
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};

use super::email_parser;
use super::line_codec::{LineCodec, ReadOutcome};
use crate::store::{Email, EmailStore};

/// Per-connection settings threaded through from `config::Config`.
#[derive(Clone)]
pub struct SessionConfig {
    pub domain: String,
    pub max_line_bytes: usize,
    pub max_message_bytes: usize,
    pub max_recipients: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub auth_required: bool,
    pub auth_username: String,
    pub auth_password: String,
    pub tls_acceptor: Option<Arc<ServerConfig>>,
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum SessionState {
    /// Right after the 220 greeting; waiting for EHLO/HELO.
    Greeted,
    /// EHLO/HELO seen, not authenticated (or auth not required).
    Identified,
    /// AUTH succeeded.
    Authenticated,
    /// MAIL FROM accepted, no RCPT TO yet.
    MailFrom,
    /// At least one RCPT TO accepted.
    Rcpt,
    /// DATA accepted, collecting message content.
    Data,
}

/// Why the session's command loop returned control to the listener.
pub enum SessionEnd {
    Quit,
    Eof,
    Timeout,
    /// STARTTLS was accepted (`220 Go ahead` already sent); the listener
    /// must perform the handshake and call `install_transport` before
    /// resuming the dialogue with another `run()`.
    StartTls,
}

pub struct Session<S> {
    codec: Option<LineCodec<S>>,
    state: SessionState,
    cfg: SessionConfig,
    store: Arc<dyn EmailStore>,
    client_ip: String,
    is_tls: bool,
    authenticated: bool,
    auth_user: String,
    mail_from: Option<String>,
    rcpt_to: Vec<String>,
    data_buf: Vec<u8>,
    data_overflowed: bool,
}

enum Dispatch {
    Continue,
    Quit,
    StartTls,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Session<S> {
    pub fn new(stream: S, cfg: SessionConfig, store: Arc<dyn EmailStore>, client_ip: String) -> Self {
        let codec = LineCodec::new(stream, cfg.max_line_bytes, cfg.read_timeout, cfg.write_timeout);
        Session {
            codec: Some(codec),
            state: SessionState::Greeted,
            cfg,
            store,
            client_ip,
            is_tls: false,
            authenticated: false,
            auth_user: String::new(),
            mail_from: None,
            rcpt_to: Vec::new(),
            data_buf: Vec::new(),
            data_overflowed: false,
        }
    }

    fn codec(&mut self) -> &mut LineCodec<S> {
        self.codec.as_mut().expect("session transport missing mid-dialogue")
    }

    /// Takes the underlying transport out of the session, discarding any
    /// buffered plaintext. Used by the listener around a STARTTLS handshake.
    pub fn take_transport(&mut self) -> S {
        self.codec.take().expect("transport already taken").into_inner()
    }

    /// Installs a new transport (the TLS-wrapped stream) and resets the
    /// dialogue per RFC 3207: any prior transaction and authentication state
    /// from before the handshake is discarded.
    pub fn install_transport(&mut self, stream: S) {
        self.codec = Some(LineCodec::new(
            stream,
            self.cfg.max_line_bytes,
            self.cfg.read_timeout,
            self.cfg.write_timeout,
        ));
        self.is_tls = true;
        self.authenticated = false;
        self.auth_user.clear();
        self.reset_transaction();
        self.state = SessionState::Greeted;
    }

    /// Puts the plain transport back after a failed STARTTLS handshake.
    /// Unlike `install_transport`, this does not discard the session's prior
    /// authentication/transaction state — the handshake never happened from
    /// the client's point of view, so the dialogue resumes exactly where it
    /// left off, in plaintext.
    pub fn restore_transport(&mut self, stream: S) {
        self.codec = Some(LineCodec::new(
            stream,
            self.cfg.max_line_bytes,
            self.cfg.read_timeout,
            self.cfg.write_timeout,
        ));
    }

    /// Replies `454 TLS not available` after a failed STARTTLS handshake,
    /// once the plaintext transport has been restored.
    pub async fn reply_tls_unavailable(&mut self, reason: &str) -> Result<()> {
        self.codec().write_line(&format!("454 TLS not available: {reason}")).await
    }

    /// Sends the 220 banner and runs the command dialogue until QUIT, EOF, a
    /// read timeout, or an accepted STARTTLS request.
    pub async fn run(&mut self) -> Result<SessionEnd> {
        if self.state == SessionState::Greeted && !self.is_tls {
            self.codec()
                .write_line(&format!("220 {} ESMTP ready", self.cfg.domain))
                .await?;
        }

        loop {
            let outcome = self.codec().read_line().await?;
            let line = match outcome {
                ReadOutcome::Line(bytes) => bytes,
                ReadOutcome::Eof => {
                    debug!("client {} closed the connection", self.client_ip);
                    return Ok(SessionEnd::Eof);
                }
                ReadOutcome::Timeout => {
                    self.codec().write_line("421 Timeout waiting for input").await?;
                    return Ok(SessionEnd::Timeout);
                }
            };

            if self.state == SessionState::Data {
                if self.handle_data_line(&line).await? {
                    self.state = self.post_transaction_state();
                }
                continue;
            }

            let trimmed = String::from_utf8_lossy(&line)
                .trim_end_matches(['\r', '\n'])
                .to_string();

            if trimmed.is_empty() {
                self.codec().write_line("500 Syntax error, command unrecognized").await?;
                continue;
            }

            match self.dispatch(&trimmed).await? {
                Dispatch::Continue => {}
                Dispatch::Quit => return Ok(SessionEnd::Quit),
                Dispatch::StartTls => return Ok(SessionEnd::StartTls),
            }
        }
    }

    fn post_transaction_state(&self) -> SessionState {
        if self.authenticated {
            SessionState::Authenticated
        } else {
            SessionState::Identified
        }
    }

    fn reset_transaction(&mut self) {
        self.mail_from = None;
        self.rcpt_to.clear();
        self.data_buf.clear();
        self.data_overflowed = false;
    }

    async fn dispatch(&mut self, line: &str) -> Result<Dispatch> {
        let verb = line.split_whitespace().next().unwrap_or("").to_ascii_uppercase();

        match verb.as_str() {
            "HELO" => self.handle_helo(line).await,
            "EHLO" => self.handle_ehlo(line).await,
            "AUTH" => self.handle_auth(line).await,
            "MAIL" => self.handle_mail(line).await,
            "RCPT" => self.handle_rcpt(line).await,
            "DATA" => self.handle_data_start().await,
            "RSET" => self.handle_rset().await,
            "NOOP" => {
                self.codec().write_line("250 OK").await?;
                Ok(Dispatch::Continue)
            }
            "QUIT" => {
                self.codec().write_line("221 Bye").await?;
                Ok(Dispatch::Quit)
            }
            "STARTTLS" => self.handle_starttls().await,
            _ => {
                self.codec().write_line("500 Command not recognized").await?;
                Ok(Dispatch::Continue)
            }
        }
    }

    async fn handle_helo(&mut self, line: &str) -> Result<Dispatch> {
        let domain = line.split_whitespace().nth(1).unwrap_or("client");
        let greeting = format!("250 {} greets {}", self.cfg.domain, domain);
        self.codec().write_line(&greeting).await?;
        self.reset_transaction();
        self.state = self.post_transaction_state();
        Ok(Dispatch::Continue)
    }

    async fn handle_ehlo(&mut self, line: &str) -> Result<Dispatch> {
        let domain = line.split_whitespace().nth(1).unwrap_or("client");
        let mut lines = vec![format!("{} greets {}", self.cfg.domain, domain)];

        if self.cfg.auth_required || !self.cfg.auth_username.is_empty() {
            lines.push("AUTH PLAIN LOGIN".to_string());
        }
        if self.cfg.tls_acceptor.is_some() && !self.is_tls {
            lines.push("STARTTLS".to_string());
        }
        lines.push(format!("SIZE {}", self.cfg.max_message_bytes));

        let last = lines.len() - 1;
        for (i, text) in lines.iter().enumerate() {
            let reply = if i == last { format!("250 {text}") } else { format!("250-{text}") };
            self.codec().write_line(&reply).await?;
        }

        self.reset_transaction();
        self.state = self.post_transaction_state();
        Ok(Dispatch::Continue)
    }

    async fn handle_rset(&mut self) -> Result<Dispatch> {
        self.reset_transaction();
        // RSET has no listed transition out of `Greeted` (spec.md §4.3) — a
        // client that hasn't sent EHLO/HELO yet stays there, so it can't use
        // RSET to skip straight to MAIL FROM.
        if self.state != SessionState::Greeted {
            self.state = self.post_transaction_state();
        }
        self.codec().write_line("250 OK").await?;
        Ok(Dispatch::Continue)
    }

    async fn handle_starttls(&mut self) -> Result<Dispatch> {
        if matches!(self.state, SessionState::MailFrom | SessionState::Rcpt | SessionState::Data) {
            self.codec().write_line("503 Bad sequence of commands").await?;
            return Ok(Dispatch::Continue);
        }
        if self.cfg.tls_acceptor.is_none() {
            self.codec().write_line("502 STARTTLS not available").await?;
            return Ok(Dispatch::Continue);
        }
        if self.is_tls {
            self.codec().write_line("502 STARTTLS not available: already active").await?;
            return Ok(Dispatch::Continue);
        }
        self.codec().write_line("220 Go ahead").await?;
        Ok(Dispatch::StartTls)
    }

    async fn handle_auth(&mut self, line: &str) -> Result<Dispatch> {
        if !matches!(self.state, SessionState::Greeted | SessionState::Identified) {
            self.codec().write_line("503 Already authenticated").await?;
            return Ok(Dispatch::Continue);
        }

        let mut parts = line.split_whitespace();
        parts.next(); // "AUTH"
        let mechanism = parts.next().unwrap_or("").to_ascii_uppercase();
        let initial_response = parts.next().map(str::to_string);

        let creds = match mechanism.as_str() {
            "PLAIN" => self.auth_plain(initial_response).await?,
            "LOGIN" => self.auth_login(initial_response).await?,
            "" => {
                self.codec().write_line("501 Syntax error in parameters").await?;
                return Ok(Dispatch::Continue);
            }
            _ => {
                self.codec().write_line("504 Unrecognized authentication mechanism").await?;
                return Ok(Dispatch::Continue);
            }
        };

        let Some(creds) = creds else {
            // Client aborted with "*", or the decode failed; a reply was
            // already sent by the mechanism handler.
            return Ok(Dispatch::Continue);
        };

        if creds.username == self.cfg.auth_username && creds.password == self.cfg.auth_password {
            self.authenticated = true;
            self.auth_user = creds.username;
            self.state = SessionState::Authenticated;
            self.codec().write_line("235 2.7.0 Authentication successful").await?;
        } else {
            warn!("failed AUTH attempt from {} for user {:?}", self.client_ip, creds.username);
            self.codec().write_line("535 5.7.8 Authentication credentials invalid").await?;
        }
        Ok(Dispatch::Continue)
    }

    async fn auth_plain(&mut self, initial_response: Option<String>) -> Result<Option<Credentials>> {
        let encoded = match initial_response {
            Some(r) => r,
            None => {
                self.codec().write_line("334 ").await?;
                match self.read_continuation_line().await? {
                    Some(l) => l,
                    None => return Ok(None),
                }
            }
        };
        if encoded == "*" {
            self.codec().write_line("501 Authentication cancelled").await?;
            return Ok(None);
        }
        match decode_auth_plain(&encoded) {
            Some(creds) => Ok(Some(creds)),
            None => {
                self.codec().write_line("535 5.7.8 Authentication failed").await?;
                Ok(None)
            }
        }
    }

    async fn auth_login(&mut self, initial_username: Option<String>) -> Result<Option<Credentials>> {
        let username_b64 = match initial_username {
            Some(u) => u,
            None => {
                self.codec().write_line("334 VXNlcm5hbWU6").await?;
                match self.read_continuation_line().await? {
                    Some(l) => l,
                    None => return Ok(None),
                }
            }
        };
        if username_b64 == "*" {
            self.codec().write_line("501 Authentication cancelled").await?;
            return Ok(None);
        }

        self.codec().write_line("334 UGFzc3dvcmQ6").await?;
        let password_b64 = match self.read_continuation_line().await? {
            Some(l) => l,
            None => return Ok(None),
        };
        if password_b64 == "*" {
            self.codec().write_line("501 Authentication cancelled").await?;
            return Ok(None);
        }

        match (decode_base64_utf8(&username_b64), decode_base64_utf8(&password_b64)) {
            (Some(username), Some(password)) => Ok(Some(Credentials { username, password })),
            _ => {
                self.codec().write_line("535 5.7.8 Authentication failed").await?;
                Ok(None)
            }
        }
    }

    /// Reads one more line while inside an AUTH continuation exchange. `Eof`
    /// or `Timeout` end the AUTH attempt (caller sees `None`); the outer
    /// `run` loop notices the dead connection on its next read.
    async fn read_continuation_line(&mut self) -> Result<Option<String>> {
        match self.codec().read_line().await? {
            ReadOutcome::Line(bytes) => Ok(Some(
                String::from_utf8_lossy(&bytes).trim_end_matches(['\r', '\n']).to_string(),
            )),
            ReadOutcome::Eof | ReadOutcome::Timeout => Ok(None),
        }
    }

    async fn handle_mail(&mut self, line: &str) -> Result<Dispatch> {
        if self.cfg.auth_required && !self.authenticated {
            self.codec().write_line("530 Authentication required").await?;
            return Ok(Dispatch::Continue);
        }
        if !matches!(self.state, SessionState::Identified | SessionState::Authenticated) {
            self.codec().write_line("503 Bad sequence of commands").await?;
            return Ok(Dispatch::Continue);
        }
        let Some(addr) = extract_path(line, "FROM:") else {
            self.codec().write_line("501 Syntax error in MAIL FROM parameters").await?;
            return Ok(Dispatch::Continue);
        };
        self.mail_from = Some(addr);
        self.rcpt_to.clear();
        self.state = SessionState::MailFrom;
        self.codec().write_line("250 OK").await?;
        Ok(Dispatch::Continue)
    }

    async fn handle_rcpt(&mut self, line: &str) -> Result<Dispatch> {
        if !matches!(self.state, SessionState::MailFrom | SessionState::Rcpt) {
            self.codec().write_line("503 Need MAIL before RCPT").await?;
            return Ok(Dispatch::Continue);
        }
        if self.rcpt_to.len() >= self.cfg.max_recipients {
            self.codec().write_line("452 Too many recipients").await?;
            return Ok(Dispatch::Continue);
        }
        let Some(addr) = extract_path(line, "TO:") else {
            self.codec().write_line("501 Syntax error in RCPT TO parameters").await?;
            return Ok(Dispatch::Continue);
        };
        self.rcpt_to.push(addr);
        self.state = SessionState::Rcpt;
        self.codec().write_line("250 OK").await?;
        Ok(Dispatch::Continue)
    }

    async fn handle_data_start(&mut self) -> Result<Dispatch> {
        if self.state != SessionState::Rcpt {
            self.codec().write_line("503 Bad sequence of commands").await?;
            return Ok(Dispatch::Continue);
        }
        self.data_buf.clear();
        self.data_overflowed = false;
        self.state = SessionState::Data;
        self.codec()
            .write_line("354 Start mail input; end with <CRLF>.<CRLF>")
            .await?;
        Ok(Dispatch::Continue)
    }

    /// Handles a single line received while in the `Data` state. Returns
    /// `true` once the end-of-data marker has been processed, so the caller
    /// can restore the post-transaction state.
    async fn handle_data_line(&mut self, raw: &[u8]) -> Result<bool> {
        let trimmed = trim_end_crlf(raw);

        if trimmed == b"." {
            return self.finish_data().await;
        }

        if self.data_overflowed {
            // Already replied 552; keep consuming lines without buffering,
            // up to the end-of-data marker handled above.
            return Ok(false);
        }

        let unstuffed = if trimmed.starts_with(b".") { &trimmed[1..] } else { trimmed };

        if self.data_buf.len() + unstuffed.len() + 2 > self.cfg.max_message_bytes {
            self.data_overflowed = true;
            self.codec()
                .write_line("552 Message size exceeds fixed maximum message size")
                .await?;
            return Ok(false);
        }

        self.data_buf.extend_from_slice(unstuffed);
        self.data_buf.extend_from_slice(b"\r\n");
        Ok(false)
    }

    async fn finish_data(&mut self) -> Result<bool> {
        if self.data_overflowed {
            self.reset_transaction();
            return Ok(true);
        }

        let (subject, body) = email_parser::parse(&self.data_buf);
        let email = Email {
            sender: self.mail_from.clone().unwrap_or_default(),
            recipients: self.rcpt_to.clone(),
            subject,
            body,
            raw_message: self.data_buf.clone(),
            size_bytes: self.data_buf.len(),
            received_at: Utc::now(),
            status: "received".to_string(),
            auth_user: self.auth_user.clone(),
            client_ip: self.client_ip.clone(),
        };

        match self.store.create(email).await {
            Ok(id) => {
                info!(
                    "stored message {} from {:?} to {:?} ({} bytes)",
                    id,
                    self.mail_from,
                    self.rcpt_to,
                    self.data_buf.len()
                );
                self.codec().write_line("250 OK: message accepted").await?;
            }
            Err(e) => {
                warn!("failed to store message: {e:#}");
                self.codec()
                    .write_line("451 Requested action aborted: local error")
                    .await?;
            }
        }

        self.reset_transaction();
        Ok(true)
    }
}

struct Credentials {
    username: String,
    password: String,
}

fn decode_auth_plain(encoded: &str) -> Option<Credentials> {
    let raw = BASE64.decode(encoded.as_bytes()).ok()?;
    let parts: Vec<&[u8]> = raw.splitn(3, |&b| b == 0).collect();
    let (authcid, password) = match parts.as_slice() {
        [_authzid, authcid, password] => (*authcid, *password),
        [authcid, password] => (*authcid, *password),
        _ => return None,
    };
    Some(Credentials {
        username: String::from_utf8_lossy(authcid).into_owned(),
        password: String::from_utf8_lossy(password).into_owned(),
    })
}

fn decode_base64_utf8(encoded: &str) -> Option<String> {
    let raw = BASE64.decode(encoded.as_bytes()).ok()?;
    Some(String::from_utf8_lossy(&raw).into_owned())
}

/// Extracts the address following a `MAIL FROM:`/`RCPT TO:` keyword.
/// `None` only when the keyword itself is absent. Everything after the
/// keyword is trimmed, the first whitespace-delimited token is kept
/// (discarding trailing ESMTP parameters like `SIZE=...`), and angle
/// brackets are stripped only when the token is wrapped in both — a bare
/// address with no brackets is stored as-is rather than rejected.
fn extract_path(line: &str, keyword: &str) -> Option<String> {
    let upper = line.to_ascii_uppercase();
    let idx = upper.find(keyword)?;
    let rest = line[idx + keyword.len()..].trim();
    let token = rest.split_whitespace().next().unwrap_or("");
    let addr = if token.starts_with('<') && token.ends_with('>') {
        &token[1..token.len() - 1]
    } else {
        token
    };
    Some(addr.to_string())
}

fn trim_end_crlf(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryEmailStore;
    use tokio::io::duplex;

    fn test_cfg() -> SessionConfig {
        SessionConfig {
            domain: "sink.test".to_string(),
            max_line_bytes: 8192,
            max_message_bytes: 1024,
            max_recipients: 5,
            read_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(2),
            auth_required: false,
            auth_username: "alice".to_string(),
            auth_password: "secret".to_string(),
            tls_acceptor: None,
        }
    }

    async fn run_dialogue(cfg: SessionConfig, script: &[u8]) -> (Vec<u8>, Arc<InMemoryEmailStore>) {
        let (mut client, server) = duplex(8192);
        let store = Arc::new(InMemoryEmailStore::new());
        let store_for_session: Arc<dyn EmailStore> = store.clone();
        let mut session = Session::new(server, cfg, store_for_session, "127.0.0.1".to_string());

        let script = script.to_vec();
        let driver = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            client.write_all(&script).await.unwrap();
            let mut out = Vec::new();
            let _ = tokio::time::timeout(Duration::from_millis(200), client.read_to_end(&mut out)).await;
            out
        });

        let _ = tokio::time::timeout(Duration::from_millis(500), session.run()).await;
        drop(session);
        let out = driver.await.unwrap();
        (out, store)
    }

    #[tokio::test]
    async fn full_transaction_is_stored() {
        let script = b"EHLO client.test\r\n\
MAIL FROM:<a@example.com>\r\n\
RCPT TO:<b@example.com>\r\n\
DATA\r\n\
Subject: hi\r\n\
\r\n\
hello world\r\n\
.\r\n\
QUIT\r\n";
        let (out, store) = run_dialogue(test_cfg(), script).await;
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("220"));
        assert!(text.contains("250"));
        assert!(text.contains("354"));
        assert!(text.contains("250 OK: message accepted"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.all()[0].sender, "a@example.com");
    }

    #[tokio::test]
    async fn rcpt_before_mail_is_rejected() {
        let script = b"EHLO client.test\r\nRCPT TO:<b@example.com>\r\nQUIT\r\n";
        let (out, store) = run_dialogue(test_cfg(), script).await;
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("503"));
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn auth_required_blocks_mail_until_authenticated() {
        let mut cfg = test_cfg();
        cfg.auth_required = true;
        let script = b"EHLO client.test\r\nMAIL FROM:<a@example.com>\r\nQUIT\r\n";
        let (out, _store) = run_dialogue(cfg, script).await;
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("530"));
    }

    #[tokio::test]
    async fn successful_auth_plain_unlocks_mail() {
        let mut cfg = test_cfg();
        cfg.auth_required = true;
        let creds = BASE64.encode(b"\0alice\0secret");
        let script = format!(
            "EHLO client.test\r\nAUTH PLAIN {creds}\r\nMAIL FROM:<a@example.com>\r\nQUIT\r\n"
        );
        let (out, _store) = run_dialogue(cfg, script.as_bytes()).await;
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("235"));
        assert!(!text.contains("530"));
    }

    #[tokio::test]
    async fn dot_stuffed_line_is_unstuffed() {
        let script = b"EHLO client.test\r\n\
MAIL FROM:<a@example.com>\r\n\
RCPT TO:<b@example.com>\r\n\
DATA\r\n\
..this line started with a dot\r\n\
.\r\n\
QUIT\r\n";
        let (_out, store) = run_dialogue(test_cfg(), script).await;
        assert_eq!(store.len(), 1);
        assert!(store.all()[0].raw_message.starts_with(b".this line started with a dot"));
    }

    #[tokio::test]
    async fn single_leading_dot_is_unstuffed() {
        // S3: ".hello", "..world", "." -> raw_message "hello\r\n.world\r\n".
        let script = b"EHLO client.test\r\n\
MAIL FROM:<a@example.com>\r\n\
RCPT TO:<b@example.com>\r\n\
DATA\r\n\
.hello\r\n\
..world\r\n\
.\r\n\
QUIT\r\n";
        let (_out, store) = run_dialogue(test_cfg(), script).await;
        assert_eq!(store.len(), 1);
        let email = &store.all()[0];
        assert_eq!(email.raw_message, b"hello\r\n.world\r\n");
        assert_eq!(email.size_bytes, 15);
    }

    #[tokio::test]
    async fn message_at_exact_size_ceiling_is_accepted() {
        let mut cfg = test_cfg();
        cfg.max_message_bytes = 4;
        // Body line "hi" plus its restored CRLF is exactly 4 bytes.
        let script = b"EHLO client.test\r\n\
MAIL FROM:<a@example.com>\r\n\
RCPT TO:<b@example.com>\r\n\
DATA\r\n\
hi\r\n\
.\r\n\
QUIT\r\n";
        let (out, store) = run_dialogue(cfg, script).await;
        let text = String::from_utf8_lossy(&out);
        assert!(!text.contains("552"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.all()[0].raw_message, b"hi\r\n");
    }

    #[tokio::test]
    async fn malformed_auth_plain_blob_gets_535_and_stays_open() {
        let mut cfg = test_cfg();
        cfg.auth_required = true;
        let script = b"EHLO client.test\r\nAUTH PLAIN not-valid-base64!!\r\nNOOP\r\nQUIT\r\n";
        let (out, _store) = run_dialogue(cfg, script).await;
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("535"));
        // The connection stays open: NOOP after the failed AUTH still gets a 250.
        assert!(text.contains("250 OK"));
    }

    #[tokio::test]
    async fn starttls_without_tls_configured_gets_502() {
        let script = b"EHLO client.test\r\nSTARTTLS\r\nQUIT\r\n";
        let (out, _store) = run_dialogue(test_cfg(), script).await;
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("502"));
    }

    #[tokio::test]
    async fn oversized_message_gets_552() {
        let mut cfg = test_cfg();
        cfg.max_message_bytes = 16;
        let script = b"EHLO client.test\r\n\
MAIL FROM:<a@example.com>\r\n\
RCPT TO:<b@example.com>\r\n\
DATA\r\n\
this line is definitely longer than sixteen bytes\r\n\
.\r\n\
QUIT\r\n";
        let (out, store) = run_dialogue(cfg, script).await;
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("552"));
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn too_many_recipients_gets_452() {
        let mut cfg = test_cfg();
        cfg.max_recipients = 1;
        let script = b"EHLO client.test\r\n\
MAIL FROM:<a@example.com>\r\n\
RCPT TO:<b@example.com>\r\n\
RCPT TO:<c@example.com>\r\n\
QUIT\r\n";
        let (out, _store) = run_dialogue(cfg, script).await;
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("452"));
    }

    #[test]
    fn auth_plain_decodes_authzid_authcid_password() {
        let encoded = BASE64.encode(b"\0alice\0secret");
        let creds = decode_auth_plain(&encoded).unwrap();
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.password, "secret");
    }

    #[test]
    fn extract_path_strips_size_param() {
        let addr = extract_path("MAIL FROM:<a@example.com> SIZE=1024", "FROM:").unwrap();
        assert_eq!(addr, "a@example.com");
    }

    #[test]
    fn extract_path_accepts_bare_address_without_brackets() {
        let addr = extract_path("MAIL FROM:a@example.com", "FROM:").unwrap();
        assert_eq!(addr, "a@example.com");
    }
}
