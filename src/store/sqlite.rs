//! A `SQLite`-backed `EmailStore`, the default persistence layer when a
//! database path is configured (see `config::Config::database_path`).
//!
//! The schema mirrors the table the original prototype of this system used:
//! recipients are stored as a JSON array, `raw_message` is stored as a BLOB
//! so arbitrary (non-UTF-8) message bytes survive a round trip untouched.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

use super::{Email, EmailStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS emails (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    sender          TEXT NOT NULL,
    recipients      TEXT NOT NULL,
    subject         TEXT NOT NULL DEFAULT '',
    body            TEXT NOT NULL,
    raw_message     BLOB NOT NULL,
    size_bytes      INTEGER NOT NULL,
    received_at     TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'received',
    smtp_auth_user  TEXT NOT NULL DEFAULT '',
    client_ip       TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_emails_received_at ON emails(received_at DESC);
CREATE INDEX IF NOT EXISTS idx_emails_sender ON emails(sender);
CREATE INDEX IF NOT EXISTS idx_emails_status ON emails(status);
";

pub struct SqliteEmailStore {
    pool: SqlitePool,
}

impl SqliteEmailStore {
    /// Opens (creating if necessary) the SQLite database at `path` and
    /// ensures the `emails` table exists.
    pub async fn connect(path: &str) -> Result<Self> {
        let in_memory = path == ":memory:";
        let uri = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{path}")
        };
        let options = SqliteConnectOptions::from_str(&uri)
            .with_context(|| format!("invalid database path: {path}"))?
            .create_if_missing(true);

        // A pooled in-memory database gives each connection its own empty
        // database unless pinned to a single connection.
        let max_connections = if in_memory { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open database at {path}"))?;

        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .context("failed to initialize email schema")?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl EmailStore for SqliteEmailStore {
    async fn create(&self, email: Email) -> Result<i64> {
        let recipients_json = serde_json::to_string(&email.recipients)?;
        let received_at = email.received_at.to_rfc3339();

        let result = sqlx::query(
            "INSERT INTO emails
                (sender, recipients, subject, body, raw_message, size_bytes,
                 received_at, status, smtp_auth_user, client_ip)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&email.sender)
        .bind(&recipients_json)
        .bind(&email.subject)
        .bind(&email.body)
        .bind(&email.raw_message)
        .bind(email.size_bytes as i64)
        .bind(&received_at)
        .bind(&email.status)
        .bind(&email.auth_user)
        .bind(&email.client_ip)
        .execute(&self.pool)
        .await
        .context("failed to persist email")?;

        Ok(result.last_insert_rowid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_email() -> Email {
        Email {
            sender: "a@x".to_string(),
            recipients: vec!["b@y".to_string(), "c@z".to_string()],
            subject: "hi".to_string(),
            body: "hello".to_string(),
            raw_message: b"Subject: hi\r\n\r\nhello\r\n".to_vec(),
            size_bytes: 22,
            received_at: Utc::now(),
            status: "received".to_string(),
            auth_user: "alice".to_string(),
            client_ip: "127.0.0.1".to_string(),
        }
    }

    #[tokio::test]
    async fn create_persists_and_returns_distinct_ids() {
        let store = SqliteEmailStore::connect(":memory:").await.unwrap();
        let id1 = store.create(sample_email()).await.unwrap();
        let id2 = store.create(sample_email()).await.unwrap();
        assert_ne!(id1, id2);

        let row: (String, String, i64) =
            sqlx::query_as("SELECT sender, recipients, size_bytes FROM emails WHERE id = ?")
                .bind(id1)
                .fetch_one(&store.pool)
                .await
                .unwrap();
        assert_eq!(row.0, "a@x");
        assert_eq!(row.1, "[\"b@y\",\"c@z\"]");
        assert_eq!(row.2, 22);
    }
}
