use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A fully assembled request: system instructions plus an ordered dialogue
/// that must end with a user message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Prompt {
    pub system: String,
    pub messages: Vec<ChatMessage>,
}

impl Prompt {
    pub fn validate(&self) -> crate::error::Result<()> {
        match self.messages.last() {
            Some(last) if last.role == Role::User && !last.content.trim().is_empty() => Ok(()),
            Some(_) => Err(crate::error::LlmError::InvalidInput(
                "prompt must end with a non-empty user message".to_string(),
            )),
            None => Err(crate::error::LlmError::InvalidInput(
                "prompt has no messages".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub model: String,
    pub usage: Usage,
    pub finish_reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_must_end_with_user_turn() {
        let mut prompt = Prompt {
            system: "be helpful".to_string(),
            messages: vec![],
        };
        assert!(prompt.validate().is_err());

        prompt.messages.push(ChatMessage::user("hi"));
        prompt.messages.push(ChatMessage::assistant("hello"));
        assert!(prompt.validate().is_err());

        prompt.messages.push(ChatMessage::user("book me"));
        assert!(prompt.validate().is_ok());
    }
}
