use agora_core::roster::{AgentDescriptor, Roster};
use agora_storage::StoredMessage;
use serde::Serialize;

const OPENING_NUDGE: &str = "The group has been quiet for a while. Say something in character \
to get a conversation going about healthy living or losing weight.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    pub role: &'static str,
    pub content: String,
}

impl PromptMessage {
    fn system(content: String) -> Self {
        Self {
            role: "system",
            content,
        }
    }

    fn user(content: String) -> Self {
        Self {
            role: "user",
            content,
        }
    }

    fn assistant(content: String) -> Self {
        Self {
            role: "assistant",
            content,
        }
    }
}

pub fn system_prompt(agent: &AgentDescriptor, roster: &Roster) -> String {
    let others: Vec<String> = roster
        .others(&agent.agent_id)
        .map(|other| format!("- {}: {}", other.name, other.description))
        .collect();
    let participants = if others.is_empty() {
        "(you are the only scripted member right now)".to_string()
    } else {
        others.join("\n")
    };

    format!(
        "You are a real person named {name} taking part in a group chat about healthy living \
and weight loss (other topics come up too).

Your character: {description}

Take part in the discussion naturally, based on your character and the chat so far. Your reply should:
1. Always stay in character.
2. Sound like a person chatting, not an official statement; emoji, catchphrases and casual phrasing are fine.
3. Be of moderate length.
4. Respond to the last few messages or to the overall mood of the chat.
5. Occasionally ask a question, show emotion or shift the topic, while keeping the conversation coherent.
6. Never mention or hint that you are an AI, a language model or a program.
7. You are an ordinary member, not the group owner or a moderator.

You are chatting with the following people (real users may be present too):
{participants}

Reply with what you would say next. Output only the message itself, without a prefix such as '{name}:'.",
        name = agent.name,
        description = agent.description,
    )
}

/// The agent's own lines become `assistant` turns; everybody else's become
/// `user` turns prefixed with the sender's name.
pub fn format_history(
    history: &[StoredMessage],
    agent: &AgentDescriptor,
    roster: &Roster,
) -> Vec<PromptMessage> {
    history
        .iter()
        .map(|msg| {
            if msg.sender_id == agent.agent_id {
                return PromptMessage::assistant(msg.content.clone());
            }
            let sender_name = roster
                .get(&msg.sender_id)
                .map(|other| other.name.as_str())
                .unwrap_or(msg.sender_name.as_str());
            PromptMessage::user(format!("{sender_name}: {}", msg.content))
        })
        .collect()
}

pub fn build_messages(
    agent: &AgentDescriptor,
    roster: &Roster,
    history: &[StoredMessage],
) -> Vec<PromptMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(PromptMessage::system(system_prompt(agent, roster)));
    messages.extend(format_history(history, agent, roster));
    if history.is_empty() {
        messages.push(PromptMessage::user(OPENING_NUDGE.to_string()));
    }
    messages
}

/// Models sometimes echo the `Name:` prefix they were told not to write.
pub fn clean_reply(agent: &AgentDescriptor, reply: &str) -> Option<String> {
    let trimmed = reply.trim();
    let prefix = format!("{}:", agent.name);
    let cleaned = trimmed.strip_prefix(&prefix).unwrap_or(trimmed).trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::wire::MessageKind;
    use chrono::Utc;

    fn stored(id: i64, sender_id: &str, sender_name: &str, content: &str) -> StoredMessage {
        StoredMessage {
            id,
            sender_id: sender_id.to_string(),
            sender_name: sender_name.to_string(),
            content: content.to_string(),
            kind: MessageKind::Text,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn system_prompt_names_persona_and_the_others() {
        let roster = Roster::builtin();
        let doctor = roster.get("agent_doctor_wang").expect("doctor");
        let prompt = system_prompt(doctor, &roster);
        assert!(prompt.contains("named Dr. Wang (AI)"));
        assert!(prompt.contains("- Big Li (AI):"));
        assert!(prompt.contains("- Prof. Zhang (AI):"));
        assert!(!prompt.contains("- Dr. Wang (AI):"));
    }

    #[test]
    fn history_maps_roles_and_prefixes_other_senders() {
        let roster = Roster::builtin();
        let li = roster.get("agent_fatty_li").expect("li");
        let history = vec![
            stored(1, "u-1", "Ann", "any tips for running?"),
            stored(2, "agent_fatty_li", "Big Li (AI)", "I get winded on stairs"),
            stored(3, "agent_doctor_wang", "stale name", "start with walking"),
        ];
        let messages = format_history(&history, li, &roster);
        assert_eq!(
            messages,
            vec![
                PromptMessage::user("Ann: any tips for running?".to_string()),
                PromptMessage::assistant("I get winded on stairs".to_string()),
                PromptMessage::user("Dr. Wang (AI): start with walking".to_string()),
            ]
        );
    }

    #[test]
    fn empty_history_gets_an_opening_nudge() {
        let roster = Roster::builtin();
        let li = roster.get("agent_fatty_li").expect("li");
        let messages = build_messages(li, &roster, &[]);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].role, "user");
        assert_eq!(messages[1].content, OPENING_NUDGE);
    }

    #[test]
    fn clean_reply_strips_own_name_and_rejects_blank() {
        let roster = Roster::builtin();
        let li = roster.get("agent_fatty_li").expect("li");
        assert_eq!(
            clean_reply(li, "  Big Li (AI): stairs again today  "),
            Some("stairs again today".to_string())
        );
        assert_eq!(
            clean_reply(li, "Dr. Wang (AI): hi"),
            Some("Dr. Wang (AI): hi".to_string())
        );
        assert_eq!(clean_reply(li, "   "), None);
        assert_eq!(clean_reply(li, "Big Li (AI):"), None);
    }
}
