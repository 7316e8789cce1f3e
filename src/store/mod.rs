//! The `Email` record produced by a completed SMTP transaction, and the
//! `EmailStore` contract required to persist it.
//!
//! The core SMTP front-end only ever calls `EmailStore::create`; everything
//! else an email inbox needs (listing, marking read, wiping) belongs to the
//! web UI this crate does not implement.

mod memory;
mod sqlite;

pub use memory::InMemoryEmailStore;
pub use sqlite::SqliteEmailStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single received message, ready for persistence.
///
/// Constructed by the session state machine once a DATA phase ends
/// successfully (see `smtp::session`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Email {
    /// Mailbox given after `MAIL FROM:`, angle brackets stripped.
    pub sender: String,
    /// Mailboxes given after each `RCPT TO:`, in the order received.
    pub recipients: Vec<String>,
    /// Value of the first `Subject:` header, or empty if absent.
    pub subject: String,
    /// Best-effort UTF-8 text body (see `smtp::email_parser`).
    pub body: String,
    /// Exact bytes received after DATA, post dot-unstuffing, terminator excluded.
    pub raw_message: Vec<u8>,
    /// `raw_message.len()`.
    pub size_bytes: usize,
    /// Captured when the terminating dot was read.
    pub received_at: DateTime<Utc>,
    /// Always `"received"` at creation time; the web UI may later set `"read"`.
    pub status: String,
    /// Authenticated username, empty if the session was unauthenticated.
    pub auth_user: String,
    /// Peer address captured at accept.
    pub client_ip: String,
}

/// Persistence contract required of the core.
///
/// Implementations must be safe to call concurrently from many session
/// tasks; the core never serializes access to the store itself.
#[async_trait]
pub trait EmailStore: Send + Sync {
    /// Persists all fields of `email` atomically and returns the assigned id.
    ///
    /// The store is solely responsible for id assignment; duplicate ids are
    /// therefore impossible.
    async fn create(&self, email: Email) -> Result<i64>;
}
