use agora_core::wire::MessageKind;
use agora_storage::{MessageStore, StorageError, StoredMessage};
use async_trait::async_trait;
use std::{
    path::Path,
    sync::{Arc, Mutex},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("message store lock poisoned")]
    Poisoned,
    #[error("blocking task failed: {0}")]
    Join(String),
}

/// Durable chat history as seen by the hub.
#[async_trait]
pub trait MessageLog: Send + Sync {
    async fn store(
        &self,
        sender_id: &str,
        sender_name: &str,
        content: &str,
        kind: MessageKind,
    ) -> Result<StoredMessage, PersistError>;

    /// The last `limit` messages, oldest first.
    async fn recent(&self, limit: usize) -> Result<Vec<StoredMessage>, PersistError>;
}

/// SQLite-backed log. Every call runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteMessageLog {
    store: Arc<Mutex<MessageStore>>,
}

impl SqliteMessageLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        Ok(Self::from_store(MessageStore::open(path)?))
    }

    pub fn from_store(store: MessageStore) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
        }
    }

    async fn with_store<T, F>(&self, op: F) -> Result<T, PersistError>
    where
        T: Send + 'static,
        F: FnOnce(&MessageStore) -> Result<T, StorageError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store.lock().map_err(|_| PersistError::Poisoned)?;
            op(&*guard).map_err(PersistError::from)
        })
        .await
        .map_err(|err| PersistError::Join(err.to_string()))?
    }
}

#[async_trait]
impl MessageLog for SqliteMessageLog {
    async fn store(
        &self,
        sender_id: &str,
        sender_name: &str,
        content: &str,
        kind: MessageKind,
    ) -> Result<StoredMessage, PersistError> {
        let sender_id = sender_id.to_string();
        let sender_name = sender_name.to_string();
        let content = content.to_string();
        self.with_store(move |store| store.store(&sender_id, &sender_name, &content, kind))
            .await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<StoredMessage>, PersistError> {
        self.with_store(move |store| store.recent(limit)).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory log with a switch to make `store` fail.
    #[derive(Default)]
    pub struct MemoryLog {
        rows: Mutex<Vec<StoredMessage>>,
        fail_stores: AtomicBool,
    }

    impl MemoryLog {
        pub fn set_failing(&self, failing: bool) {
            self.fail_stores.store(failing, Ordering::SeqCst);
        }

        pub fn rows(&self) -> Vec<StoredMessage> {
            self.rows.lock().expect("rows lock").clone()
        }
    }

    #[async_trait]
    impl MessageLog for MemoryLog {
        async fn store(
            &self,
            sender_id: &str,
            sender_name: &str,
            content: &str,
            kind: MessageKind,
        ) -> Result<StoredMessage, PersistError> {
            if self.fail_stores.load(Ordering::SeqCst) {
                return Err(PersistError::Join("store offline".to_string()));
            }
            let mut rows = self.rows.lock().expect("rows lock");
            let stored = StoredMessage {
                id: rows.len() as i64 + 1,
                sender_id: sender_id.to_string(),
                sender_name: sender_name.to_string(),
                content: content.to_string(),
                kind,
                timestamp: Utc::now(),
            };
            rows.push(stored.clone());
            Ok(stored)
        }

        async fn recent(&self, limit: usize) -> Result<Vec<StoredMessage>, PersistError> {
            let rows = self.rows.lock().expect("rows lock");
            let start = rows.len().saturating_sub(limit);
            Ok(rows[start..].to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sqlite_log_stores_and_reads_back() {
        let file = tempfile::NamedTempFile::new().expect("temp file");
        let log = SqliteMessageLog::open(file.path()).expect("open log");
        let first = log
            .store("u-1", "Ann", "hello", MessageKind::Text)
            .await
            .expect("store");
        log.store("agent_x", "X (AI)", "hi Ann", MessageKind::Text)
            .await
            .expect("store");

        let recent = log.recent(10).await.expect("recent");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0], first);
        assert_eq!(recent[1].sender_id, "agent_x");
    }
}
