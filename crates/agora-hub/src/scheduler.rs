use crate::{
    provider::{ContentProvider, ProviderError},
    relay::{ChatRelay, RelayError},
};
use agora_core::{
    roster::AgentDescriptor,
    wire::{MessageKind, Participant},
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{sleep, timeout_at, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum IterationError {
    #[error("provider failed: {0}")]
    Provider(#[from] ProviderError),
    #[error("relay failed: {0}")]
    Relay(#[from] RelayError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Idle,
    Waiting,
    Speaking,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub error_cooldown: Duration,
    pub shutdown_grace: Duration,
    pub seed: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            error_cooldown: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(10),
            seed: None,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub stopped: usize,
    pub abandoned: Vec<String>,
}

struct AgentLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    phase: watch::Receiver<LoopPhase>,
}

/// Owns one speaking loop per agent. Loops never touch sockets directly; every
/// line goes through the relay like a human message would.
pub struct AgentScheduler {
    provider: Arc<dyn ContentProvider>,
    relay: Arc<ChatRelay>,
    config: SchedulerConfig,
    loops: Mutex<HashMap<String, AgentLoop>>,
}

impl AgentScheduler {
    pub fn new(
        provider: Arc<dyn ContentProvider>,
        relay: Arc<ChatRelay>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            provider,
            relay,
            config,
            loops: Mutex::new(HashMap::new()),
        }
    }

    /// Spawns a loop for every agent that is not already running. Returns how
    /// many were started.
    pub async fn start_all(&self, agents: &[AgentDescriptor]) -> usize {
        let mut loops = self.loops.lock().await;
        let mut started = 0;
        for agent in agents {
            if let Some(existing) = loops.get(&agent.agent_id) {
                if !existing.handle.is_finished() {
                    debug!(event = "agent_already_running", agent_id = %agent.agent_id);
                    continue;
                }
            }
            let cancel = CancellationToken::new();
            let (phase_tx, phase_rx) = watch::channel(LoopPhase::Idle);
            let handle = tokio::spawn(run_agent_loop(
                agent.clone(),
                self.provider.clone(),
                self.relay.clone(),
                self.config.clone(),
                cancel.clone(),
                phase_tx,
            ));
            loops.insert(
                agent.agent_id.clone(),
                AgentLoop {
                    cancel,
                    handle,
                    phase: phase_rx,
                },
            );
            started += 1;
        }
        info!(event = "agents_started", started, total = loops.len());
        started
    }

    /// Cancels every loop and waits up to the shutdown grace for them to
    /// finish. Loops still running after that are aborted.
    pub async fn stop_all(&self) -> StopReport {
        let drained: Vec<(String, AgentLoop)> = self.loops.lock().await.drain().collect();
        for (_, agent_loop) in &drained {
            agent_loop.cancel.cancel();
        }

        let deadline = Instant::now() + self.config.shutdown_grace;
        let mut report = StopReport::default();
        for (agent_id, mut agent_loop) in drained {
            match timeout_at(deadline, &mut agent_loop.handle).await {
                Ok(_) => report.stopped += 1,
                Err(_) => {
                    agent_loop.handle.abort();
                    report.abandoned.push(agent_id);
                }
            }
        }
        if report.abandoned.is_empty() {
            info!(event = "agents_stopped", stopped = report.stopped);
        } else {
            error!(
                event = "agents_abandoned",
                stopped = report.stopped,
                abandoned = ?report.abandoned
            );
        }
        report
    }

    pub async fn phase(&self, agent_id: &str) -> Option<LoopPhase> {
        let loops = self.loops.lock().await;
        loops.get(agent_id).map(|agent_loop| *agent_loop.phase.borrow())
    }

    pub async fn running(&self) -> Vec<String> {
        let loops = self.loops.lock().await;
        let mut ids: Vec<String> = loops
            .iter()
            .filter(|(_, agent_loop)| !agent_loop.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

async fn run_agent_loop(
    agent: AgentDescriptor,
    provider: Arc<dyn ContentProvider>,
    relay: Arc<ChatRelay>,
    config: SchedulerConfig,
    cancel: CancellationToken,
    phase: watch::Sender<LoopPhase>,
) {
    let mut rng = agent_rng(config.seed, &agent.agent_id);
    let sender = Participant::new(agent.agent_id.clone(), agent.name.clone());
    info!(event = "agent_loop_started", agent_id = %agent.agent_id);

    loop {
        let wait = sample_wait(&mut rng, agent.speak_interval());
        phase.send_replace(LoopPhase::Waiting);
        debug!(
            event = "agent_waiting",
            agent_id = %agent.agent_id,
            wait_ms = wait.as_millis() as u64
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sleep(wait) => {}
        }
        if cancel.is_cancelled() {
            break;
        }

        phase.send_replace(LoopPhase::Speaking);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            outcome = speak_once(&agent, provider.as_ref(), &relay, &sender) => outcome,
        };
        match outcome {
            Ok(true) => {}
            Ok(false) => debug!(event = "agent_silent", agent_id = %agent.agent_id),
            Err(err) => {
                warn!(
                    event = "agent_iteration_failed",
                    agent_id = %agent.agent_id,
                    error = %err,
                    cooldown_secs = config.error_cooldown.as_secs()
                );
                phase.send_replace(LoopPhase::Waiting);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = sleep(config.error_cooldown) => {}
                }
            }
        }
    }

    phase.send_replace(LoopPhase::Cancelled);
    info!(event = "agent_loop_stopped", agent_id = %agent.agent_id);
}

/// Returns whether a line was published.
async fn speak_once(
    agent: &AgentDescriptor,
    provider: &dyn ContentProvider,
    relay: &ChatRelay,
    sender: &Participant,
) -> Result<bool, IterationError> {
    let Some(content) = provider.produce(agent).await? else {
        return Ok(false);
    };
    relay.publish(sender, &content, MessageKind::Text).await?;
    Ok(true)
}

fn agent_rng(seed: Option<u64>, agent_id: &str) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed ^ id_hash(agent_id)),
        None => StdRng::from_entropy(),
    }
}

// FNV-1a; stable across runs so seeded schedules are reproducible.
fn id_hash(id: &str) -> u64 {
    id.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Uniform wait in `[min, max]` at millisecond resolution.
pub fn sample_wait(rng: &mut impl Rng, (min, max): (Duration, Duration)) -> Duration {
    let min_ms = min.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    if max_ms <= min_ms {
        return min;
    }
    Duration::from_millis(rng.gen_range(min_ms..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::Broadcaster;
    use crate::persistence::testing::MemoryLog;
    use crate::registry::{ConnectionRegistry, TransportHandle};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Script {
        Say(&'static str),
        Silent,
        Fail,
        Hang,
    }

    struct FakeProvider {
        script: Script,
        calls: AtomicUsize,
    }

    impl FakeProvider {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ContentProvider for FakeProvider {
        async fn produce(&self, _agent: &AgentDescriptor) -> Result<Option<String>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script {
                Script::Say(text) => Ok(Some(text.to_string())),
                Script::Silent => Ok(None),
                Script::Fail => Err(ProviderError::Network("connection refused".to_string())),
                Script::Hang => std::future::pending().await,
            }
        }
    }

    fn agent(id: &str, min: u64, max: u64) -> AgentDescriptor {
        AgentDescriptor {
            agent_id: id.to_string(),
            name: format!("{id} (AI)"),
            model: "test/model".to_string(),
            description: "test persona".to_string(),
            min_interval_secs: min,
            max_interval_secs: max,
            context_message_count: 10,
            avatar_url: None,
        }
    }

    fn scheduler(
        provider: Arc<dyn ContentProvider>,
        log: Arc<MemoryLog>,
        registry: Arc<ConnectionRegistry>,
        config: SchedulerConfig,
    ) -> AgentScheduler {
        let relay = Arc::new(ChatRelay::new(log, Arc::new(Broadcaster::new(registry))));
        AgentScheduler::new(provider, relay, config)
    }

    #[tokio::test(start_paused = true)]
    async fn agent_speaks_through_the_relay_after_its_interval() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (handle, mut rx) = TransportHandle::channel(8);
        registry.register("u-1", "Ann", handle).await;
        let log = Arc::new(MemoryLog::default());
        let provider = FakeProvider::new(Script::Say("stairs are hard"));
        let sched = scheduler(
            provider.clone(),
            log.clone(),
            registry,
            SchedulerConfig::default(),
        );

        assert_eq!(sched.start_all(&[agent("agent_a", 5, 5)]).await, 1);
        sleep(Duration::from_secs(4)).await;
        assert!(log.rows().is_empty());

        sleep(Duration::from_secs(2)).await;
        let rows = log.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sender_id, "agent_a");
        assert_eq!(rows[0].content, "stairs are hard");
        let frame: serde_json::Value =
            serde_json::from_str(&rx.try_recv().expect("frame")).expect("json");
        assert_eq!(frame["sender"]["name"], "agent_a (AI)");

        let report = sched.stop_all().await;
        assert_eq!(report.stopped, 1);
        assert!(report.abandoned.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_reply_publishes_nothing() {
        let log = Arc::new(MemoryLog::default());
        let provider = FakeProvider::new(Script::Silent);
        let sched = scheduler(
            provider.clone(),
            log.clone(),
            Arc::new(ConnectionRegistry::new()),
            SchedulerConfig::default(),
        );

        sched.start_all(&[agent("agent_a", 5, 5)]).await;
        sleep(Duration::from_secs(16)).await;
        assert_eq!(provider.calls(), 3);
        assert!(log.rows().is_empty());
        sched.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failure_waits_out_the_cooldown() {
        let log = Arc::new(MemoryLog::default());
        let provider = FakeProvider::new(Script::Fail);
        let config = SchedulerConfig {
            error_cooldown: Duration::from_secs(100),
            ..SchedulerConfig::default()
        };
        let sched = scheduler(
            provider.clone(),
            log,
            Arc::new(ConnectionRegistry::new()),
            config,
        );

        sched.start_all(&[agent("agent_a", 5, 5)]).await;
        sleep(Duration::from_secs(50)).await;
        assert_eq!(provider.calls(), 1);
        assert_eq!(sched.phase("agent_a").await, Some(LoopPhase::Waiting));

        // cooldown ends at 105s, next attempt at 110s
        sleep(Duration::from_secs(61)).await;
        assert_eq!(provider.calls(), 2);
        sched.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_all_skips_running_loops() {
        let provider = FakeProvider::new(Script::Silent);
        let sched = scheduler(
            provider,
            Arc::new(MemoryLog::default()),
            Arc::new(ConnectionRegistry::new()),
            SchedulerConfig::default(),
        );
        let agents = [agent("agent_a", 5, 5), agent("agent_b", 5, 5)];

        assert_eq!(sched.start_all(&agents).await, 2);
        assert_eq!(sched.start_all(&agents).await, 0);
        assert_eq!(sched.running().await, vec!["agent_a", "agent_b"]);

        let report = sched.stop_all().await;
        assert_eq!(report.stopped, 2);
        assert!(sched.running().await.is_empty());
        assert_eq!(sched.phase("agent_a").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_a_pending_provider_call() {
        let log = Arc::new(MemoryLog::default());
        let provider = FakeProvider::new(Script::Hang);
        let sched = scheduler(
            provider.clone(),
            log.clone(),
            Arc::new(ConnectionRegistry::new()),
            SchedulerConfig::default(),
        );

        sched.start_all(&[agent("agent_a", 1, 1)]).await;
        sleep(Duration::from_secs(2)).await;
        assert_eq!(provider.calls(), 1);
        assert_eq!(sched.phase("agent_a").await, Some(LoopPhase::Speaking));

        let report = sched.stop_all().await;
        assert_eq!(report.stopped, 1);
        assert!(report.abandoned.is_empty());
        assert!(log.rows().is_empty());
    }

    #[test]
    fn sampled_waits_stay_in_range_and_vary() {
        let mut rng = StdRng::seed_from_u64(7);
        let bounds = (Duration::from_secs(60), Duration::from_secs(600));
        let waits: Vec<Duration> = (0..200).map(|_| sample_wait(&mut rng, bounds)).collect();
        assert!(waits.iter().all(|w| *w >= bounds.0 && *w <= bounds.1));
        assert!(waits.iter().any(|w| *w != waits[0]));
    }

    #[test]
    fn equal_bounds_give_a_fixed_wait() {
        let mut rng = StdRng::seed_from_u64(1);
        let five = Duration::from_secs(5);
        assert_eq!(sample_wait(&mut rng, (five, five)), five);
    }

    #[test]
    fn seeded_schedules_are_reproducible_per_agent() {
        let bounds = (Duration::from_secs(60), Duration::from_secs(600));
        let draw = |seed, id| {
            let mut rng = agent_rng(Some(seed), id);
            (0..5)
                .map(|_| sample_wait(&mut rng, bounds))
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(42, "agent_a"), draw(42, "agent_a"));
        assert_ne!(draw(42, "agent_a"), draw(42, "agent_b"));
    }
}
