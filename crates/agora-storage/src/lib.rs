use agora_core::wire::{MessageKind, OutboundEvent, Participant};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use thiserror::Error;

pub const CHAT_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unknown message kind: {0}")]
    MessageKind(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// One persisted chat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: i64,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
}

impl StoredMessage {
    pub fn sender(&self) -> Participant {
        Participant::new(self.sender_id.clone(), self.sender_name.clone())
    }

    /// Wire timestamp, e.g. `2026-02-23T14:00:00.000Z`.
    pub fn wire_timestamp(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn to_event(&self) -> OutboundEvent {
        OutboundEvent::Message {
            content: self.content.clone(),
            message_type: self.kind,
            sender: self.sender(),
            timestamp: Some(self.wire_timestamp()),
        }
    }
}

pub struct MessageStore {
    conn: Connection,
}

impl MessageStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > CHAT_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: CHAT_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_messages.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn store(
        &self,
        sender_id: &str,
        sender_name: &str,
        content: &str,
        kind: MessageKind,
    ) -> Result<StoredMessage, StorageError> {
        self.store_at(sender_id, sender_name, content, kind, Utc::now())
    }

    pub fn store_at(
        &self,
        sender_id: &str,
        sender_name: &str,
        content: &str,
        kind: MessageKind,
        timestamp: DateTime<Utc>,
    ) -> Result<StoredMessage, StorageError> {
        let timestamp = timestamp.trunc_subsecs(6);
        self.conn.execute(
            "
            INSERT INTO messages (sender_id, sender_name, content, message_type, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                sender_id,
                sender_name,
                content,
                kind.as_str(),
                timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            ],
        )?;
        Ok(StoredMessage {
            id: self.conn.last_insert_rowid(),
            sender_id: sender_id.to_string(),
            sender_name: sender_name.to_string(),
            content: content.to_string(),
            kind,
            timestamp,
        })
    }

    /// The last `limit` messages, oldest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<StoredMessage>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT id, sender_id, sender_name, content, message_type, created_at
            FROM messages
            ORDER BY id DESC
            LIMIT ?1
            ",
        )?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = statement.query_map([limit], |row| {
            let kind: String = row.get(4)?;
            let kind = kind.parse::<MessageKind>().map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    4,
                    rusqlite::types::Type::Text,
                    Box::new(StorageError::MessageKind(err)),
                )
            })?;
            let timestamp = parse_timestamp(row.get::<_, String>(5)?).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    5,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })?;
            Ok(StoredMessage {
                id: row.get(0)?,
                sender_id: row.get(1)?,
                sender_name: row.get(2)?,
                content: row.get(3)?,
                kind,
                timestamp,
            })
        })?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }

    pub fn count(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?)
    }
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}
