//! Wire-adjacent types for LLM interaction.
//!
//! These are provider-agnostic: whatever client the host plugs in translates
//! them to its own wire format and emits [`Chunk`] values while streaming.

use futures::stream::BoxStream;
use serde_json::Map;

use kiln_core::{Message, ToolCall, ToolDefinition, Usage};

use crate::llm::args::parse_argument_text;

// ---------------------------------------------------------------------------
// Requests and responses
// ---------------------------------------------------------------------------

/// A full request to an LLM backend.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model identifier. Empty means the client's current model.
    pub model: String,
    /// Conversation history.
    pub messages: Vec<Message>,
    /// Tool definitions the model may invoke this turn.
    pub tools: Vec<ToolDefinition>,
    /// System prompt, kept separate from the message list.
    pub system: Option<String>,
    /// Maximum tokens the model may generate.
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
}

impl ChatRequest {
    /// A request with just messages; everything else defaulted.
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            model: String::new(),
            messages,
            tools: Vec::new(),
            system: None,
            max_tokens: None,
            temperature: None,
        }
    }

    /// Builder: set the tool definitions.
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Builder: set the system prompt.
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Builder: set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

/// The aggregated outcome of one model turn.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    /// Text the model produced (may precede tool calls).
    pub text: String,
    /// Tool calls the model requested, in emission order.
    pub tool_calls: Vec<ToolCall>,
    /// Token usage, when the backend reports it.
    pub usage: Usage,
}

impl ChatResponse {
    /// Whether the model wants tools run before continuing.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Streaming chunks
// ---------------------------------------------------------------------------

/// One element of a streaming model response.
#[derive(Debug, Clone)]
pub enum Chunk {
    /// Assistant text delta.
    Text(String),
    /// Reasoning/thinking delta (not part of the final answer).
    Thinking(String),
    /// Partial tool call; fold with [`ToolCallAssembler`].
    ToolCall(ToolCallDelta),
    /// The turn finished, with usage if known.
    Done(Usage),
    /// The stream failed mid-flight.
    Error(String),
}

/// A fragment of an in-progress tool call.
///
/// The first fragment for a call carries `id` and `name`; subsequent
/// fragments append to the raw JSON argument text.
#[derive(Debug, Clone, Default)]
pub struct ToolCallDelta {
    /// Which call this fragment belongs to, in emission order.
    pub index: usize,
    /// Present on the opening fragment.
    pub id: Option<String>,
    /// Present on the opening fragment.
    pub name: Option<String>,
    /// Raw JSON argument text to append.
    pub arguments_delta: String,
}

/// A lazy stream of chunks from the backend.
pub type ChunkStream = BoxStream<'static, Chunk>;

// ---------------------------------------------------------------------------
// Tool-call assembly
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Folds [`Chunk::ToolCall`] fragments into complete [`ToolCall`] values.
///
/// Argument text that fails to parse as JSON becomes a `parse_error` on the
/// finished call rather than an error here; the executor turns it into a
/// retryable result for the model.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    partials: Vec<PartialCall>,
}

impl ToolCallAssembler {
    /// Create an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one fragment.
    pub fn push(&mut self, delta: &ToolCallDelta) {
        while self.partials.len() <= delta.index {
            self.partials.push(PartialCall::default());
        }
        let partial = &mut self.partials[delta.index];
        if let Some(id) = &delta.id {
            partial.id = id.clone();
        }
        if let Some(name) = &delta.name {
            partial.name = name.clone();
        }
        partial.arguments.push_str(&delta.arguments_delta);
    }

    /// Whether any fragment has been folded in.
    pub fn is_empty(&self) -> bool {
        self.partials.is_empty()
    }

    /// Finish assembly, parsing each call's accumulated argument text.
    pub fn finish(self) -> Vec<ToolCall> {
        self.partials
            .into_iter()
            .map(|partial| match parse_argument_text(&partial.arguments) {
                Ok(input) => ToolCall::new(partial.id, partial.name, input),
                Err(reason) => ToolCall {
                    id: partial.id,
                    name: partial.name,
                    input: Map::new(),
                    parse_error: Some(reason),
                },
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembler_folds_split_arguments() {
        let mut assembler = ToolCallAssembler::new();
        assembler.push(&ToolCallDelta {
            index: 0,
            id: Some("tc_01".into()),
            name: Some("read_file".into()),
            arguments_delta: "{\"pa".into(),
        });
        assembler.push(&ToolCallDelta {
            index: 0,
            id: None,
            name: None,
            arguments_delta: "th\":\"a.txt\"}".into(),
        });

        let calls = assembler.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "tc_01");
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].input["path"], "a.txt");
        assert!(calls[0].parse_error.is_none());
    }

    #[test]
    fn assembler_keeps_call_order_across_interleaving() {
        let mut assembler = ToolCallAssembler::new();
        assembler.push(&ToolCallDelta {
            index: 0,
            id: Some("tc_01".into()),
            name: Some("read_file".into()),
            arguments_delta: String::new(),
        });
        assembler.push(&ToolCallDelta {
            index: 1,
            id: Some("tc_02".into()),
            name: Some("grep".into()),
            arguments_delta: "{}".into(),
        });
        assembler.push(&ToolCallDelta {
            index: 0,
            id: None,
            name: None,
            arguments_delta: "{\"path\":\"x\"}".into(),
        });

        let calls = assembler.finish();
        assert_eq!(calls[0].id, "tc_01");
        assert_eq!(calls[1].id, "tc_02");
    }

    #[test]
    fn assembler_surfaces_bad_json_as_parse_error() {
        let mut assembler = ToolCallAssembler::new();
        assembler.push(&ToolCallDelta {
            index: 0,
            id: Some("tc_01".into()),
            name: Some("grep".into()),
            arguments_delta: "not json".into(),
        });

        let calls = assembler.finish();
        assert!(calls[0].parse_error.is_some());
        assert!(calls[0].input.is_empty());
    }

    #[test]
    fn chat_request_builder() {
        let req = ChatRequest::new(vec![Message::user("hi")])
            .with_system("be terse")
            .with_model("m1");
        assert_eq!(req.system.as_deref(), Some("be terse"));
        assert_eq!(req.model, "m1");
    }
}
