use crate::{
    fanout::{Broadcaster, FanoutReport},
    persistence::{MessageLog, PersistError},
};
use agora_core::wire::{BroadcastMessage, MessageKind, Participant, WireError};
use agora_storage::StoredMessage;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("persist failed: {0}")]
    Persist(#[from] PersistError),
    #[error("encode failed: {0}")]
    Encode(#[from] WireError),
}

/// The one path every chat line takes, human or agent: persist, then fan out.
pub struct ChatRelay {
    log: Arc<dyn MessageLog>,
    broadcaster: Arc<Broadcaster>,
}

impl ChatRelay {
    pub fn new(log: Arc<dyn MessageLog>, broadcaster: Arc<Broadcaster>) -> Self {
        Self { log, broadcaster }
    }

    pub fn log(&self) -> &Arc<dyn MessageLog> {
        &self.log
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Nothing is broadcast unless the message was stored first.
    pub async fn publish(
        &self,
        sender: &Participant,
        content: &str,
        kind: MessageKind,
    ) -> Result<(StoredMessage, FanoutReport), RelayError> {
        let stored = self
            .log
            .store(&sender.id, &sender.name, content, kind)
            .await?;
        let message = BroadcastMessage::encode(&stored.to_event())?;
        let report = self.broadcaster.broadcast(&message).await;
        info!(
            event = "chat_relayed",
            message_id = stored.id,
            sender_id = %sender.id,
            kind = %kind,
            recipients = report.delivered
        );
        Ok((stored, report))
    }
}
