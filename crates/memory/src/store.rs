//! Conversation persistence: an append-only message log per session with a TTL.

use aiops_core::Message;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid session key")]
    InvalidKey,
    #[error("Store task failed: {0}")]
    Task(String),
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Messages for the session, oldest first. Unknown or expired sessions are empty.
    async fn load(&self, session_id: &str) -> Result<Vec<Message>, StoreError>;
    async fn append(&self, session_id: &str, messages: &[Message]) -> Result<(), StoreError>;
    async fn delete(&self, session_id: &str) -> Result<(), StoreError>;
}

fn validate_key(session_id: &str) -> Result<(), StoreError> {
    if session_id.is_empty()
        || session_id.contains("..")
        || session_id.contains('/')
        || session_id.contains('\\')
    {
        return Err(StoreError::InvalidKey);
    }
    Ok(())
}

struct Entry {
    messages: Vec<Message>,
    expires_at: Instant,
}

/// Process-local store. Appending refreshes the session's TTL.
pub struct InMemoryConversationStore {
    ttl: Duration,
    sessions: Mutex<HashMap<String, Entry>>,
}

impl InMemoryConversationStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn load(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        validate_key(session_id)?;
        let mut sessions = self.sessions.lock();
        let expired = match sessions.get(session_id) {
            Some(entry) if entry.expires_at > Instant::now() => return Ok(entry.messages.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            debug!("Session {} expired", session_id);
            sessions.remove(session_id);
        }
        Ok(Vec::new())
    }

    async fn append(&self, session_id: &str, messages: &[Message]) -> Result<(), StoreError> {
        validate_key(session_id)?;
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        let entry = sessions.entry(session_id.to_string()).or_insert_with(|| Entry {
            messages: Vec::new(),
            expires_at: now + self.ttl,
        });
        if entry.expires_at <= now {
            entry.messages.clear();
        }
        entry.messages.extend_from_slice(messages);
        entry.expires_at = now + self.ttl;
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        validate_key(session_id)?;
        self.sessions.lock().remove(session_id);
        Ok(())
    }
}

/// One JSON message per line under `<base>/<session>.jsonl`.
///
/// Expiry is judged from the file's modification time. File IO runs on the
/// blocking pool.
pub struct JsonlConversationStore {
    base_path: PathBuf,
    ttl: Duration,
}

impl JsonlConversationStore {
    pub fn new<P: AsRef<Path>>(base_path: P, ttl: Duration) -> Result<Self, StoreError> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        Ok(Self { base_path, ttl })
    }

    fn session_path(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        validate_key(session_id)?;
        Ok(self.base_path.join(format!("{session_id}.jsonl")))
    }

    fn is_expired(path: &Path, ttl: Duration) -> Result<bool, StoreError> {
        let modified = fs::metadata(path)?.modified()?;
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        Ok(age > ttl)
    }

    fn load_blocking(path: &Path, ttl: Duration) -> Result<Vec<Message>, StoreError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        if Self::is_expired(path, ttl)? {
            fs::remove_file(path)?;
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(path)?);
        let mut messages = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(message) => messages.push(message),
                Err(e) => warn!("Skipping corrupted line in {}: {}", path.display(), e),
            }
        }
        Ok(messages)
    }

    fn append_blocking(path: &Path, ttl: Duration, messages: &[Message]) -> Result<(), StoreError> {
        if path.exists() && Self::is_expired(path, ttl)? {
            fs::remove_file(path)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        for message in messages {
            let json = serde_json::to_string(message)?;
            writeln!(file, "{json}")?;
        }
        file.sync_all()?;
        Ok(())
    }
}

async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

#[async_trait]
impl ConversationStore for JsonlConversationStore {
    async fn load(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        let path = self.session_path(session_id)?;
        let ttl = self.ttl;
        blocking(move || Self::load_blocking(&path, ttl)).await
    }

    async fn append(&self, session_id: &str, messages: &[Message]) -> Result<(), StoreError> {
        let path = self.session_path(session_id)?;
        let ttl = self.ttl;
        let messages = messages.to_vec();
        blocking(move || Self::append_blocking(&path, ttl, &messages)).await
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        let path = self.session_path(session_id)?;
        blocking(move || match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_in_memory_append_and_load() {
        let store = InMemoryConversationStore::new(Duration::from_secs(60));
        store
            .append("s1", &[Message::user_text("hello")])
            .await
            .unwrap();
        store
            .append("s1", &[Message::user_text("again")])
            .await
            .unwrap();
        let messages = store.load("s1").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].text(), "again");
        assert!(store.load("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_expiry() {
        let store = InMemoryConversationStore::new(Duration::from_millis(10));
        store.append("s1", &[Message::user_text("hi")]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.load("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_jsonl_round_trip_skips_corruption() {
        let dir = TempDir::new().unwrap();
        let store = JsonlConversationStore::new(dir.path(), Duration::from_secs(3600)).unwrap();
        store
            .append("s1", &[Message::user_text("first")])
            .await
            .unwrap();

        let path = dir.path().join("s1.jsonl");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{not json").unwrap();

        store
            .append("s1", &[Message::user_text("second")])
            .await
            .unwrap();
        let messages = store.load("s1").await.unwrap();
        let texts: Vec<String> = messages.iter().map(Message::text).collect();
        assert_eq!(texts, vec!["first", "second"]);

        store.delete("s1").await.unwrap();
        store.delete("s1").await.unwrap();
        assert!(store.load("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_keys_rejected() {
        let dir = TempDir::new().unwrap();
        let store = JsonlConversationStore::new(dir.path(), Duration::from_secs(60)).unwrap();
        assert!(matches!(
            store.load("../etc").await,
            Err(StoreError::InvalidKey)
        ));
        assert!(matches!(store.load("").await, Err(StoreError::InvalidKey)));
    }
}
