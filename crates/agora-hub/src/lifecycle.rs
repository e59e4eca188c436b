use crate::{
    config::Config,
    fanout::Broadcaster,
    persistence::{MessageLog, PersistError, SqliteMessageLog},
    provider::{ChatCompletionProvider, ContentProvider, ProviderError, ProviderSettings},
    registry::ConnectionRegistry,
    relay::ChatRelay,
    scheduler::{AgentScheduler, SchedulerConfig, StopReport},
};
use agora_core::roster::{Roster, RosterError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("message store unavailable: {0}")]
    Storage(#[from] PersistError),
    #[error("invalid roster: {0}")]
    Roster(#[from] RosterError),
    #[error("content provider: {0}")]
    Provider(#[from] ProviderError),
    #[error("invalid listen address {addr}: {reason}")]
    Addr { addr: String, reason: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Owns the shared chat graph and the agent scheduler. The broadcast path is
/// complete before any agent can run, and agents are fully stopped before the
/// provider is released.
pub struct ChatRuntime {
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<Broadcaster>,
    relay: Arc<ChatRelay>,
    log: Arc<dyn MessageLog>,
    roster: Arc<Roster>,
    scheduler: Mutex<Option<AgentScheduler>>,
}

impl ChatRuntime {
    pub fn start(config: &Config) -> Result<Self, StartupError> {
        let log: Arc<dyn MessageLog> = Arc::new(SqliteMessageLog::open(&config.db_path)?);
        info!(event = "store_opened", path = %config.db_path.display());

        let roster = if !config.agents_enabled {
            Roster::default()
        } else if let Some(path) = &config.agents_path {
            Roster::load(path)?
        } else {
            Roster::builtin()
        };
        let roster = Arc::new(roster);

        let provider: Option<Arc<dyn ContentProvider>> = match &config.api_key {
            Some(api_key) if !roster.is_empty() => {
                let settings = ProviderSettings {
                    base_url: config.base_url.clone(),
                    timeout: config.provider_timeout,
                    ..ProviderSettings::new(api_key.clone())
                };
                Some(Arc::new(ChatCompletionProvider::new(
                    settings,
                    roster.clone(),
                    log.clone(),
                )?))
            }
            Some(_) => None,
            None => {
                if !roster.is_empty() {
                    warn!(
                        event = "agents_disabled",
                        reason = "no api key configured"
                    );
                }
                None
            }
        };

        let scheduler = SchedulerConfig {
            error_cooldown: config.error_cooldown,
            shutdown_grace: config.shutdown_grace,
            seed: config.seed,
        };
        Ok(Self::assemble(log, roster, provider, scheduler))
    }

    pub fn assemble(
        log: Arc<dyn MessageLog>,
        roster: Arc<Roster>,
        provider: Option<Arc<dyn ContentProvider>>,
        scheduler: SchedulerConfig,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(registry.clone()));
        let relay = Arc::new(ChatRelay::new(log.clone(), broadcaster.clone()));
        let scheduler =
            provider.map(|provider| AgentScheduler::new(provider, relay.clone(), scheduler));
        Self {
            registry,
            broadcaster,
            relay,
            log,
            roster,
            scheduler: Mutex::new(scheduler),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn relay(&self) -> &Arc<ChatRelay> {
        &self.relay
    }

    pub fn log(&self) -> &Arc<dyn MessageLog> {
        &self.log
    }

    pub fn roster(&self) -> &Arc<Roster> {
        &self.roster
    }

    pub async fn start_agents(&self) -> usize {
        let scheduler = self.scheduler.lock().await;
        match scheduler.as_ref() {
            Some(scheduler) => scheduler.start_all(&self.roster.agents).await,
            None => 0,
        }
    }

    /// Stops every agent loop, then drops the scheduler and with it the
    /// provider's HTTP client. Safe to call more than once.
    pub async fn shutdown(&self) -> StopReport {
        let Some(scheduler) = self.scheduler.lock().await.take() else {
            return StopReport::default();
        };
        let report = scheduler.stop_all().await;
        drop(scheduler);
        info!(
            event = "runtime_stopped",
            agents_stopped = report.stopped,
            agents_abandoned = report.abandoned.len()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::testing::MemoryLog;
    use crate::registry::TransportHandle;
    use agora_core::roster::AgentDescriptor;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl ContentProvider for Echo {
        async fn produce(&self, agent: &AgentDescriptor) -> Result<Option<String>, ProviderError> {
            Ok(Some(format!("{} checking in", agent.name)))
        }
    }

    fn roster() -> Arc<Roster> {
        let mut roster = Roster::builtin();
        for agent in &mut roster.agents {
            agent.min_interval_secs = 10;
            agent.max_interval_secs = 10;
        }
        Arc::new(roster)
    }

    #[tokio::test(start_paused = true)]
    async fn agents_speak_to_connected_humans_until_shutdown() {
        let log = Arc::new(MemoryLog::default());
        let runtime = ChatRuntime::assemble(
            log.clone(),
            roster(),
            Some(Arc::new(Echo)),
            SchedulerConfig::default(),
        );
        let (handle, mut rx) = TransportHandle::channel(16);
        runtime.registry().register("u-1", "Ann", handle).await;

        assert_eq!(runtime.start_agents().await, 3);
        assert_eq!(runtime.start_agents().await, 0);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(log.rows().len(), 3);
        let mut frames = 0;
        while rx.try_recv().is_ok() {
            frames += 1;
        }
        assert_eq!(frames, 3);

        let report = runtime.shutdown().await;
        assert_eq!(report.stopped, 3);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(log.rows().len(), 3);

        assert_eq!(runtime.shutdown().await, StopReport::default());
        assert_eq!(runtime.start_agents().await, 0);
    }

    #[tokio::test]
    async fn missing_api_key_runs_without_agents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config {
            addr: "127.0.0.1:0".to_string(),
            db_path: dir.path().join("chat.db"),
            upload_dir: dir.path().join("uploads"),
            agents_path: None,
            agents_enabled: true,
            api_key: None,
            base_url: "http://127.0.0.1:9/v1/chat/completions".to_string(),
            provider_timeout: Duration::from_secs(1),
            error_cooldown: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
            queue_capacity: 8,
            history_on_join: 0,
            announce_joins: false,
            seed: None,
            debug: false,
            log_dir: None,
        };
        let runtime = ChatRuntime::start(&config).expect("start");
        assert_eq!(runtime.roster().len(), 3);
        assert_eq!(runtime.start_agents().await, 0);
        assert_eq!(runtime.shutdown().await, StopReport::default());
    }

    #[tokio::test]
    async fn bad_roster_file_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let roster_path = dir.path().join("agents.toml");
        std::fs::write(
            &roster_path,
            "[[agents]]\nagent_id = \"a\"\nname = \"A\"\nmodel = \"m\"\ndescription = \"d\"\nmin_interval_secs = 9\nmax_interval_secs = 3\n",
        )
        .expect("write roster");
        let config = Config {
            addr: "127.0.0.1:0".to_string(),
            db_path: dir.path().join("chat.db"),
            upload_dir: dir.path().join("uploads"),
            agents_path: Some(roster_path),
            agents_enabled: true,
            api_key: Some("sk-test".to_string()),
            base_url: "http://127.0.0.1:9/v1/chat/completions".to_string(),
            provider_timeout: Duration::from_secs(1),
            error_cooldown: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
            queue_capacity: 8,
            history_on_join: 0,
            announce_joins: false,
            seed: None,
            debug: false,
            log_dir: None,
        };
        let err = ChatRuntime::start(&config).err().expect("roster error");
        assert!(matches!(
            err,
            StartupError::Roster(RosterError::InvalidInterval { .. })
        ));
    }
}
