//! Inference capability.
//!
//! The router talks to an [`Inference`] implementation for reply text and
//! for turning operator free text into a [`CommandIntent`]. Any failure is
//! the caller's cue to fall back to [`keywords::keyword_intent`] or a
//! canned reply; nothing here is allowed to stall the pipeline.

pub mod keywords;
pub mod ollama;

pub use ollama::OllamaInference;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Operator command kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    ToggleChannel,
    SetPolicy,
    AddRule,
    ListRules,
    FindContact,
    SendMessage,
    TrashMail,
    ClearRules,
    Status,
    Help,
    #[serde(other)]
    Unknown,
}

impl CommandAction {
    /// Actions that must pass the destructive gate.
    pub fn is_destructive(&self) -> bool {
        matches!(self, Self::TrashMail | Self::ClearRules)
    }
}

/// Structured reading of an operator utterance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandIntent {
    pub action: CommandAction,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

impl CommandIntent {
    pub fn new(action: CommandAction) -> Self {
        Self {
            action,
            target: None,
            content: None,
        }
    }

    pub fn unknown() -> Self {
        Self::new(CommandAction::Unknown)
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into()).filter(|t: &String| !t.trim().is_empty());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into()).filter(|c: &String| !c.trim().is_empty());
        self
    }
}

const COMMAND_PROMPT: &str = r#"You turn an operator's message into one JSON command.

Actions:
- toggle_channel: target is "direct", "voice", "mail" or "all"; content is "on" or "off"
- set_policy: target is a contact; content is one of automatic, always, never, manual_review
- add_rule: target is "direct" or "mail"; content is "<condition> <value> -> <action>"
- list_rules
- find_contact: target is a name, number or address
- send_message: target is a contact; content is the message text
- trash_mail: target is the sender whose mail should be trashed
- clear_rules
- status
- help
- unknown

Message: {text}

Respond with ONLY a JSON object like {"action": "...", "target": "...", "content": "..."}."#;

/// Text generation plus command interpretation.
#[async_trait]
pub trait Inference: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Generate text. An empty string is a valid answer meaning "nothing useful".
    async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, LlmError>;

    /// Interpret operator free text. The default prompts [`generate`](Self::generate)
    /// for JSON and parses it leniently.
    async fn interpret_command(&self, text: &str) -> Result<CommandIntent, LlmError> {
        let prompt = COMMAND_PROMPT.replace("{text}", text);
        let raw = self.generate(&prompt, 160, 0.0).await?;
        parse_intent(self.name(), &raw)
    }
}

/// Parse a model's command answer.
pub fn parse_intent(provider: &str, raw: &str) -> Result<CommandIntent, LlmError> {
    if raw.trim().is_empty() {
        return Err(LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason: "empty response".into(),
        });
    }
    let json = extract_json_object(raw);
    let mut intent: CommandIntent =
        serde_json::from_str(&json).map_err(|e| LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason: format!("JSON parse error: {e}"),
        })?;
    intent.target = intent.target.filter(|t| !t.trim().is_empty());
    intent.content = intent.content.filter(|c| !c.trim().is_empty());
    Ok(intent)
}

/// Extract a JSON object from model output that may carry code fences or prose.
pub fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```") {
        let after = trimmed[start + 3..].trim_start_matches("json");
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && start < end
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
