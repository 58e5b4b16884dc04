//! Conversation data model.
//!
//! These types model the data flowing between the agent loop, the tool
//! executor, and the LLM client. They are provider-agnostic; whatever client
//! the host plugs in translates them to its wire format.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// The role of a participant in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System-level instructions that shape model behavior.
    System,
    /// Input from the human user.
    User,
    /// Output from the LLM.
    Assistant,
    /// Result of a tool invocation, fed back to the model.
    Tool,
}

/// A single message in a conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Who produced this message.
    pub role: Role,

    /// The textual content of the message.
    ///
    /// For [`Role::Tool`] messages this is the tool result string. For
    /// [`Role::Assistant`] messages that carry tool calls only, it may be
    /// empty.
    #[serde(default)]
    pub content: String,

    /// Tool calls requested by the assistant (non-empty only when
    /// `role == Role::Assistant` and the model emitted calls).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Identifies which tool call this message answers (present iff
    /// `role == Role::Tool`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create an assistant text message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create an assistant message that carries tool calls alongside any
    /// text the model produced before them.
    pub fn assistant_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    /// Create a tool result message answering `tool_call_id`.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tool calls
// ---------------------------------------------------------------------------

/// A tool invocation requested by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Stable identifier assigned by the LLM for correlating results.
    pub id: String,

    /// The name of the tool to invoke (must match a registered tool).
    pub name: String,

    /// Parsed arguments. Empty when the model sent no arguments or when
    /// parsing failed (see [`ToolCall::parse_error`]).
    #[serde(default)]
    pub input: Map<String, Value>,

    /// Set when the model's raw argument payload was not valid JSON. The
    /// executor surfaces this back to the model as a recoverable error
    /// result instead of executing anything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

impl ToolCall {
    /// Create a call with already-parsed arguments.
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
            parse_error: None,
        }
    }
}

/// The result of executing (or refusing) a tool call, ready to feed back to
/// the model and to display to the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Name of the tool that produced this result.
    pub tool_name: String,

    /// The [`ToolCall::id`] this result answers.
    pub tool_call_id: String,

    /// Result content. For failures this is the error message.
    pub content: String,

    /// Whether the invocation failed.
    #[serde(default)]
    pub is_error: bool,

    /// Whether the in-context copy was truncated or replaced by a cached
    /// summary (the UI still received the full output).
    #[serde(default)]
    pub cached: bool,
}

impl ToolResult {
    /// A successful result.
    pub fn ok(
        tool_name: impl Into<String>,
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: false,
            cached: false,
        }
    }

    /// A failed result whose content is the error message.
    pub fn error(
        tool_name: impl Into<String>,
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: true,
            cached: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tool definitions
// ---------------------------------------------------------------------------

/// A tool definition advertised to the LLM alongside each turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,

    /// Human-readable description of what the tool does.
    pub description: String,

    /// JSON Schema describing the tool's input parameters.
    pub input_schema: Value,
}

// ---------------------------------------------------------------------------
// Usage tracking
// ---------------------------------------------------------------------------

/// Token usage reported by the LLM for one turn.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Number of tokens in the input (prompt).
    pub input_tokens: u32,
    /// Number of tokens generated by the model.
    pub output_tokens: u32,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_roles() {
        assert_eq!(Message::system("s").role, Role::System);
        assert_eq!(Message::user("u").role, Role::User);
        assert_eq!(Message::assistant("a").role, Role::Assistant);

        let tool = Message::tool_result("tc_01", "ok");
        assert_eq!(tool.role, Role::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("tc_01"));
    }

    #[test]
    fn assistant_tool_calls_keeps_preamble_text() {
        let call = ToolCall::new("tc_01", "read_file", Map::new());
        let msg = Message::assistant_tool_calls("Let me check.", vec![call]);
        assert_eq!(msg.content, "Let me check.");
        assert_eq!(msg.tool_calls.len(), 1);
        assert!(msg.tool_call_id.is_none());
    }

    #[test]
    fn tool_call_serde_omits_empty_parse_error() {
        let call = ToolCall::new("tc_01", "grep", Map::new());
        let json = serde_json::to_string(&call).unwrap();
        assert!(!json.contains("parse_error"));

        let mut bad = call.clone();
        bad.parse_error = Some("unexpected token".into());
        let json = serde_json::to_string(&bad).unwrap();
        assert!(json.contains("parse_error"));
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
        let parsed: Role = serde_json::from_str("\"tool\"").unwrap();
        assert_eq!(parsed, Role::Tool);
    }
}
