use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONTEXT_MESSAGES: usize = 30;

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("failed to read roster {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse roster: {0}")]
    Parse(String),
    #[error("agent #{index} has an empty {field}")]
    EmptyField { index: usize, field: &'static str },
    #[error("duplicate agent id {0}")]
    DuplicateId(String),
    #[error("agent {agent_id} has min interval {min}s above max interval {max}s")]
    InvalidInterval { agent_id: String, min: u64, max: u64 },
    #[error("agent {0} must read at least one message of context")]
    NoContext(String),
}

/// Static configuration of one autonomous participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub agent_id: String,
    pub name: String,
    pub model: String,
    pub description: String,
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    #[serde(default = "default_context_messages")]
    pub context_message_count: usize,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

fn default_context_messages() -> usize {
    DEFAULT_CONTEXT_MESSAGES
}

impl AgentDescriptor {
    pub fn speak_interval(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.min_interval_secs),
            Duration::from_secs(self.max_interval_secs),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Roster {
    #[serde(default)]
    pub agents: Vec<AgentDescriptor>,
}

impl Roster {
    pub fn new(agents: Vec<AgentDescriptor>) -> Result<Self, RosterError> {
        let roster = Self { agents };
        roster.validate()?;
        Ok(roster)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RosterError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| RosterError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, RosterError> {
        let roster: Roster =
            toml::from_str(contents).map_err(|err| RosterError::Parse(err.to_string()))?;
        roster.validate()?;
        Ok(roster)
    }

    pub fn validate(&self) -> Result<(), RosterError> {
        let mut seen = HashSet::new();
        for (index, agent) in self.agents.iter().enumerate() {
            if agent.agent_id.trim().is_empty() {
                return Err(RosterError::EmptyField {
                    index,
                    field: "agent_id",
                });
            }
            if agent.name.trim().is_empty() {
                return Err(RosterError::EmptyField {
                    index,
                    field: "name",
                });
            }
            if agent.model.trim().is_empty() {
                return Err(RosterError::EmptyField {
                    index,
                    field: "model",
                });
            }
            if !seen.insert(agent.agent_id.as_str()) {
                return Err(RosterError::DuplicateId(agent.agent_id.clone()));
            }
            if agent.min_interval_secs > agent.max_interval_secs {
                return Err(RosterError::InvalidInterval {
                    agent_id: agent.agent_id.clone(),
                    min: agent.min_interval_secs,
                    max: agent.max_interval_secs,
                });
            }
            if agent.context_message_count == 0 {
                return Err(RosterError::NoContext(agent.agent_id.clone()));
            }
        }
        Ok(())
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentDescriptor> {
        self.agents.iter().find(|agent| agent.agent_id == agent_id)
    }

    pub fn others<'a>(&'a self, agent_id: &'a str) -> impl Iterator<Item = &'a AgentDescriptor> {
        self.agents
            .iter()
            .filter(move |agent| agent.agent_id != agent_id)
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// The three personas the room ships with.
    pub fn builtin() -> Self {
        Self {
            agents: vec![
                AgentDescriptor {
                    agent_id: "agent_fatty_li".to_string(),
                    name: "Big Li (AI)".to_string(),
                    model: "deepseek/deepseek-chat-v3-0324".to_string(),
                    description: "Weighs well over 100 kg and is anxious to lose weight fast. \
                        Talks in a hurry and complains about getting out of breath on stairs \
                        and never finding clothes that fit."
                        .to_string(),
                    min_interval_secs: 60,
                    max_interval_secs: 600,
                    context_message_count: DEFAULT_CONTEXT_MESSAGES,
                    avatar_url: None,
                },
                AgentDescriptor {
                    agent_id: "agent_doctor_wang".to_string(),
                    name: "Dr. Wang (AI)".to_string(),
                    model: "openai/gpt-4o-2024-11-20".to_string(),
                    description: "A calm physician focused on diet and lifestyle. Speaks in an \
                        orderly, gentle but firm way, gives evidence-based advice and explains \
                        medical terms in plain words."
                        .to_string(),
                    min_interval_secs: 90,
                    max_interval_secs: 700,
                    context_message_count: DEFAULT_CONTEXT_MESSAGES,
                    avatar_url: None,
                },
                AgentDescriptor {
                    agent_id: "agent_professor_zhang".to_string(),
                    name: "Prof. Zhang (AI)".to_string(),
                    model: "google/gemini-2.0-flash-001".to_string(),
                    description: "Believes people need to be healthy, not thin. Witty, fond of \
                        rhetorical questions, occasionally sharp without being rude, and likes \
                        quoting studies and social trends."
                        .to_string(),
                    min_interval_secs: 80,
                    max_interval_secs: 500,
                    context_message_count: DEFAULT_CONTEXT_MESSAGES,
                    avatar_url: None,
                },
            ],
        }
    }
}
