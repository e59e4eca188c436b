use crate::registry::{Connection, ConnectionRegistry};
use agora_core::wire::BroadcastMessage;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of one `broadcast` call, including its presence follow-up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub pruned: Vec<String>,
    pub presence_rounds: usize,
}

/// Fans messages out to every registered connection and reaps the ones that
/// fail delivery.
#[derive(Debug)]
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Delivers `message` to every live entry, then re-publishes presence once
    /// if any entry was pruned. Entries that fail that presence round are
    /// pruned too but do not trigger another round; the next membership change
    /// publishes their absence.
    pub async fn broadcast(&self, message: &BroadcastMessage) -> FanoutReport {
        let mut report = FanoutReport::default();
        let (delivered, pruned) = self.deliver_round(message).await;
        report.delivered = delivered;
        report.pruned = pruned;

        if !report.pruned.is_empty() {
            match self.presence_message().await {
                Ok(presence) => {
                    report.presence_rounds = 1;
                    let (_, mut late) = self.deliver_round(&presence).await;
                    report.pruned.append(&mut late);
                }
                Err(err) => warn!(event = "presence_encode_failed", error = %err),
            }
        }

        debug!(
            event = "broadcast_done",
            kind = %message.kind(),
            delivered = report.delivered,
            pruned = report.pruned.len(),
            presence_rounds = report.presence_rounds
        );
        report
    }

    /// Best-effort delivery to one participant. A failed delivery reaps the
    /// entry and re-publishes presence.
    pub async fn send_to(&self, participant_id: &str, message: &BroadcastMessage) -> bool {
        let Some(conn) = self.registry.get(participant_id).await else {
            debug!(event = "send_to_miss", participant_id);
            return false;
        };
        match conn.deliver(message) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    event = "send_error",
                    participant_id,
                    conn_id = conn.conn_id(),
                    reason = err.as_str()
                );
                if self.registry.release(&conn).await {
                    self.publish_presence().await;
                }
                false
            }
        }
    }

    /// One pass over a registry snapshot. Every entry is attempted regardless
    /// of earlier failures; failed entries are released afterwards.
    async fn deliver_round(&self, message: &BroadcastMessage) -> (usize, Vec<String>) {
        let conns = self.registry.connections().await;
        let mut delivered = 0;
        let mut failed: Vec<Arc<Connection>> = Vec::new();
        for conn in conns {
            match conn.deliver(message) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(
                        event = "send_error",
                        participant_id = %conn.participant_id(),
                        conn_id = conn.conn_id(),
                        kind = %message.kind(),
                        reason = err.as_str()
                    );
                    failed.push(conn);
                }
            }
        }

        let mut pruned = Vec::new();
        for conn in failed {
            if self.registry.release(&conn).await {
                pruned.push(conn.participant_id().to_string());
            }
        }
        (delivered, pruned)
    }
}
