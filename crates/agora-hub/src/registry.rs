use agora_core::wire::{BroadcastMessage, Participant};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc, RwLock};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    Closed,
    Backpressure,
}

impl DeliveryError {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryError::Closed => "closed",
            DeliveryError::Backpressure => "backpressure",
        }
    }
}

/// Send side of one participant's outbound queue. The matching receiver is
/// drained by that connection's socket writer.
#[derive(Debug)]
pub struct TransportHandle {
    sender: mpsc::Sender<Arc<str>>,
}

impl TransportHandle {
    pub fn new(sender: mpsc::Sender<Arc<str>>) -> Self {
        Self { sender }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Never waits: a full queue counts as a failed delivery.
    pub fn deliver(&self, message: &BroadcastMessage) -> Result<(), DeliveryError> {
        self.sender
            .try_send(message.payload().clone())
            .map_err(|err| match err {
                mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
                mpsc::error::TrySendError::Full(_) => DeliveryError::Backpressure,
            })
    }
}

#[derive(Debug)]
pub struct Connection {
    conn_id: u64,
    participant_id: String,
    display_name: String,
    handle: TransportHandle,
}

impl Connection {
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn participant(&self) -> Participant {
        Participant::new(self.participant_id.clone(), self.display_name.clone())
    }

    pub fn deliver(&self, message: &BroadcastMessage) -> Result<(), DeliveryError> {
        self.handle.deliver(message)
    }
}

/// Live participant connections keyed by participant id. Readers only ever
/// get point-in-time copies.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    conn_counter: AtomicU64,
    entries: RwLock<HashMap<String, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any live entry with the same id.
    pub async fn register(
        &self,
        participant_id: impl Into<String>,
        display_name: impl Into<String>,
        handle: TransportHandle,
    ) -> Arc<Connection> {
        let conn = Arc::new(Connection {
            conn_id: self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1,
            participant_id: participant_id.into(),
            display_name: display_name.into(),
            handle,
        });
        let (replaced, active) = {
            let mut entries = self.entries.write().await;
            let replaced = entries.insert(conn.participant_id.clone(), conn.clone());
            (replaced.is_some(), entries.len())
        };
        info!(
            event = "participant_registered",
            participant_id = %conn.participant_id,
            display_name = %conn.display_name,
            conn_id = conn.conn_id,
            replaced,
            active
        );
        conn
    }

    pub async fn unregister(&self, participant_id: &str) -> bool {
        let (removed, active) = {
            let mut entries = self.entries.write().await;
            let removed = entries.remove(participant_id).is_some();
            (removed, entries.len())
        };
        if removed {
            info!(event = "participant_unregistered", participant_id, active);
        }
        removed
    }

    /// Removes `conn` only while it is still the live entry for its id, so a
    /// stale session can never evict the participant's newer connection.
    pub async fn release(&self, conn: &Connection) -> bool {
        let (removed, active) = {
            let mut entries = self.entries.write().await;
            let is_current = entries
                .get(&conn.participant_id)
                .is_some_and(|live| live.conn_id == conn.conn_id);
            if is_current {
                entries.remove(&conn.participant_id);
            }
            (is_current, entries.len())
        };
        if removed {
            info!(
                event = "participant_released",
                participant_id = %conn.participant_id,
                conn_id = conn.conn_id,
                active
            );
        }
        removed
    }

    pub async fn display_name(&self, participant_id: &str) -> Option<String> {
        self.entries
            .read()
            .await
            .get(participant_id)
            .map(|conn| conn.display_name.clone())
    }

    pub async fn get(&self, participant_id: &str) -> Option<Arc<Connection>> {
        self.entries.read().await.get(participant_id).cloned()
    }

    /// Participants in join order.
    pub async fn snapshot(&self) -> Vec<Participant> {
        self.connections()
            .await
            .iter()
            .map(|conn| conn.participant())
            .collect()
    }

    /// Live connections in join order.
    pub(crate) async fn connections(&self) -> Vec<Arc<Connection>> {
        let mut conns: Vec<_> = self.entries.read().await.values().cloned().collect();
        conns.sort_by_key(|conn| conn.conn_id);
        conns
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
