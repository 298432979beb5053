//! The ordered message log for a session: token accounting, transcript
//! persistence, and the view sent to the model each turn.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::budget::Budgeter;
use crate::llm::{ChatMessage, Role};

/// Where a message came from; distinct from its chat role so agent and
/// feedback injections stay auditable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOrigin {
    User,
    Model,
    Agent,
    SystemPrompt,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub origin: MessageOrigin,

    /// For assistant messages: the full prompt that produced them,
    /// archived for transcripts and sampling.
    pub prompt_used: Option<Vec<ChatMessage>>,
}

#[derive(Serialize)]
struct TranscriptEntry<'a> {
    timestamp: String,
    role: &'a str,
    origin: MessageOrigin,
    content: &'a str,
}

/// Append-only conversation log. The opening system prompt is a constant
/// owned here and re-emitted at the head of every turn; `clear` removes
/// everything else.
pub struct Conversation {
    system_prompt: String,
    messages: Vec<Message>,
    transcript_path: Option<PathBuf>,
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            messages: Vec::new(),
            transcript_path: None,
        }
    }

    /// Enable transcript persistence; entries append as JSON lines.
    pub fn with_transcript(mut self, path: PathBuf) -> Self {
        self.transcript_path = Some(path);
        self
    }

    pub fn add_user(&mut self, content: impl Into<String>) {
        self.push(Message {
            role: Role::User,
            content: content.into(),
            origin: MessageOrigin::User,
            prompt_used: None,
        });
    }

    pub fn add_assistant(&mut self, content: impl Into<String>, prompt_used: Vec<ChatMessage>) {
        self.push(Message {
            role: Role::Assistant,
            content: content.into(),
            origin: MessageOrigin::Model,
            prompt_used: Some(prompt_used),
        });
    }

    /// System messages injected mid-conversation (agent command output,
    /// edit feedback notes).
    pub fn add_system(&mut self, content: impl Into<String>) {
        self.push(Message {
            role: Role::System,
            content: content.into(),
            origin: MessageOrigin::Agent,
            prompt_used: None,
        });
    }

    fn push(&mut self, message: Message) {
        if let Some(path) = &self.transcript_path {
            let entry = TranscriptEntry {
                timestamp: chrono::Local::now().to_rfc3339(),
                role: message.role.as_str(),
                origin: message.origin,
                content: &message.content,
            };
            if let Err(e) = append_jsonl(path, &entry) {
                tracing::warn!(error = %e, "failed to append transcript entry");
            }
        }
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The chat view: optionally headed by the opening system prompt.
    pub fn get_messages(&self, include_system_prompt: bool) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        if include_system_prompt {
            out.push(ChatMessage::system(self.system_prompt.clone()));
        }
        out.extend(self.messages.iter().map(|m| ChatMessage {
            role: m.role,
            content: m.content.clone(),
        }));
        out
    }

    /// Remove all non-system-prompt messages.
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Token count of the current chat view: a fixed per-message overhead
    /// plus content tokens, system prompt included.
    pub fn count_tokens(&self, budgeter: &Budgeter) -> usize {
        self.get_messages(true)
            .iter()
            .map(|m| budgeter.count_message(&m.content))
            .sum()
    }
}

fn append_jsonl<T: Serialize>(path: &PathBuf, entry: &T) -> Result<()> {
    use std::io::Write;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open transcript {}", path.display()))?;
    let line = serde_json::to_string(entry)?;
    writeln!(file, "{line}")?;
    Ok(())
}
