//! Conversation messages exchanged with models and tools.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool invocation requested by a model turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }

    /// Fetch a string argument, tolerating absent or non-string values.
    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    System {
        content: String,
    },
    Human {
        content: String,
    },
    Ai {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        native_search_used: bool,
    },
    Tool {
        content: String,
        name: String,
        tool_call_id: String,
    },
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message::System {
            content: content.into(),
        }
    }

    pub fn human(content: impl Into<String>) -> Self {
        Message::Human {
            content: content.into(),
        }
    }

    pub fn ai(content: impl Into<String>) -> Self {
        Message::Ai {
            content: content.into(),
            tool_calls: Vec::new(),
            native_search_used: false,
        }
    }

    pub fn ai_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Message::Ai {
            content: content.into(),
            tool_calls,
            native_search_used: false,
        }
    }

    pub fn tool(
        content: impl Into<String>,
        name: impl Into<String>,
        tool_call_id: impl Into<String>,
    ) -> Self {
        Message::Tool {
            content: content.into(),
            name: name.into(),
            tool_call_id: tool_call_id.into(),
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Message::System { content }
            | Message::Human { content }
            | Message::Ai { content, .. }
            | Message::Tool { content, .. } => content,
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Message::System { .. } => "system",
            Message::Human { .. } => "human",
            Message::Ai { .. } => "ai",
            Message::Tool { .. } => "tool",
        }
    }

    pub fn is_ai(&self) -> bool {
        matches!(self, Message::Ai { .. })
    }

    pub fn is_tool(&self) -> bool {
        matches!(self, Message::Tool { .. })
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Message::Ai { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    pub fn native_search_used(&self) -> bool {
        matches!(
            self,
            Message::Ai {
                native_search_used: true,
                ..
            }
        )
    }
}

/// Render messages as a `Role: content` transcript for prompts.
pub fn buffer_string(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|message| {
            let prefix = match message {
                Message::System { .. } => "System",
                Message::Human { .. } => "Human",
                Message::Ai { .. } => "AI",
                Message::Tool { .. } => "Tool",
            };
            format!("{prefix}: {}", message.content())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Drop the last AI message and everything after it.
///
/// Returns the input unchanged when it holds no AI message.
pub fn remove_up_to_last_ai_message(messages: &[Message]) -> Vec<Message> {
    match messages.iter().rposition(Message::is_ai) {
        Some(index) => messages[..index].to_vec(),
        None => messages.to_vec(),
    }
}

/// Contents of every tool message, in order.
pub fn tool_message_contents(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .filter(|message| message.is_tool())
        .map(|message| message.content().to_string())
        .collect()
}

pub fn last_ai_message(messages: &[Message]) -> Option<&Message> {
    messages.iter().rev().find(|message| message.is_ai())
}
