//! An in-process `EmailStore` backed by a `Mutex<Vec<Email>>`.
//!
//! Used when no database path is configured, and by the test suite, where a
//! throwaway store avoids filesystem setup.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use super::{Email, EmailStore};

/// Thread-safe, unbounded, non-durable store. Ids are assigned sequentially
/// starting at 1.
#[derive(Default)]
pub struct InMemoryEmailStore {
    emails: Mutex<Vec<Email>>,
    next_id: AtomicI64,
}

impl InMemoryEmailStore {
    pub fn new() -> Self {
        Self {
            emails: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Returns a snapshot of every email persisted so far, in insertion order.
    pub fn all(&self) -> Vec<Email> {
        self.emails.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.emails.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EmailStore for InMemoryEmailStore {
    async fn create(&self, email: Email) -> Result<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.emails.lock().unwrap().push(email);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_email(sender: &str) -> Email {
        Email {
            sender: sender.to_string(),
            recipients: vec!["b@y".to_string()],
            subject: "hi".to_string(),
            body: "hello".to_string(),
            raw_message: b"Subject: hi\r\n\r\nhello\r\n".to_vec(),
            size_bytes: 22,
            received_at: Utc::now(),
            status: "received".to_string(),
            auth_user: String::new(),
            client_ip: "127.0.0.1".to_string(),
        }
    }

    #[tokio::test]
    async fn assigns_distinct_sequential_ids() {
        let store = InMemoryEmailStore::new();
        let id1 = store.create(sample_email("a@x")).await.unwrap();
        let id2 = store.create(sample_email("a@x")).await.unwrap();
        assert_ne!(id1, id2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_creates_all_land() {
        let store = std::sync::Arc::new(InMemoryEmailStore::new());
        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.create(sample_email(&format!("sender{i}@x"))).await
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap().unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 20, "every create must get a distinct id");
        assert_eq!(store.len(), 20);
    }
}
