//! Shared fixtures for the integration tests: a scripted LLM client, a
//! recording output sink, and small filesystem tools that honor the path
//! guard the way real tool crates would.

// Each test binary uses a different subset of these fixtures.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use kiln_core::{
    OutputSink, PermissionLevel, Tool, ToolCall, ToolError, Usage,
};
use kiln_agent::llm::parse_argument_text;
use kiln_agent::workspace::PathGuard;
use kiln_agent::{
    AgentError, ChatRequest, ChatResponse, Chunk, ChunkStream, LlmClient, Result, Tier,
    ToolCallDelta,
};

/// Initialize test logging once; respects `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// Scripted LLM client
// ---------------------------------------------------------------------------

/// One scripted model turn. `chat` and `chat_stream` both pop from the same
/// queue, so classifier calls and loop turns interleave exactly as the
/// runtime issues them.
#[derive(Debug, Clone)]
pub enum Turn {
    /// Plain text answer.
    Text(String),
    /// Tool calls as `(id, name, raw-argument-json)`; the raw text flows
    /// through the real assembler/parser, so invalid JSON exercises the
    /// parse-error path.
    Calls(Vec<(String, String, String)>),
    /// The stream breaks mid-flight.
    StreamError(String),
}

impl Turn {
    pub fn text(text: &str) -> Self {
        Self::Text(text.to_owned())
    }

    pub fn call(id: &str, name: &str, raw_args: &str) -> Self {
        Self::Calls(vec![(id.to_owned(), name.to_owned(), raw_args.to_owned())])
    }

    pub fn calls(calls: &[(&str, &str, &str)]) -> Self {
        Self::Calls(
            calls
                .iter()
                .map(|(id, name, args)| ((*id).to_owned(), (*name).to_owned(), (*args).to_owned()))
                .collect(),
        )
    }
}

/// LLM client that replays a fixed script.
pub struct ScriptedClient {
    turns: Mutex<VecDeque<Turn>>,
    pub requests: Mutex<Vec<ChatRequest>>,
    pub tiers: Mutex<Vec<Tier>>,
    model: Mutex<String>,
}

impl ScriptedClient {
    pub fn new(turns: Vec<Turn>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
            tiers: Mutex::new(Vec::new()),
            model: Mutex::new("scripted".to_owned()),
        })
    }

    fn pop(&self, request: &ChatRequest) -> Result<Turn> {
        self.requests.lock().unwrap().push(request.clone());
        self.turns
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AgentError::Llm {
                reason: "script exhausted".into(),
            })
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        match self.pop(request)? {
            Turn::Text(text) => Ok(ChatResponse {
                text,
                ..ChatResponse::default()
            }),
            Turn::Calls(calls) => {
                let tool_calls = calls
                    .into_iter()
                    .map(|(id, name, raw)| match parse_argument_text(&raw) {
                        Ok(input) => ToolCall::new(id, name, input),
                        Err(reason) => ToolCall {
                            id,
                            name,
                            input: Map::new(),
                            parse_error: Some(reason),
                        },
                    })
                    .collect();
                Ok(ChatResponse {
                    text: String::new(),
                    tool_calls,
                    usage: Usage::default(),
                })
            }
            Turn::StreamError(reason) => Err(AgentError::Llm { reason }),
        }
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChunkStream> {
        let turn = self.pop(request)?;
        let chunks: Vec<Chunk> = match turn {
            Turn::Text(text) => vec![Chunk::Text(text), Chunk::Done(Usage::default())],
            Turn::Calls(calls) => {
                let mut chunks = Vec::new();
                for (index, (id, name, raw)) in calls.into_iter().enumerate() {
                    // Split the raw argument text to exercise reassembly.
                    let mid = raw.len() / 2;
                    let mid = (0..=mid)
                        .rev()
                        .find(|i| raw.is_char_boundary(*i))
                        .unwrap_or(0);
                    chunks.push(Chunk::ToolCall(ToolCallDelta {
                        index,
                        id: Some(id),
                        name: Some(name),
                        arguments_delta: raw[..mid].to_owned(),
                    }));
                    chunks.push(Chunk::ToolCall(ToolCallDelta {
                        index,
                        id: None,
                        name: None,
                        arguments_delta: raw[mid..].to_owned(),
                    }));
                }
                chunks.push(Chunk::Done(Usage::default()));
                chunks
            }
            Turn::StreamError(reason) => vec![Chunk::Error(reason)],
        };
        Ok(futures::stream::iter(chunks).boxed())
    }

    fn set_model(&self, model: &str) {
        *self.model.lock().unwrap() = model.to_owned();
    }

    fn model(&self) -> String {
        self.model.lock().unwrap().clone()
    }

    fn set_tier(&self, tier: Tier) {
        self.tiers.lock().unwrap().push(tier);
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Recording output sink
// ---------------------------------------------------------------------------

/// Captures everything the runtime emits.
#[derive(Default)]
pub struct RecordingOutput {
    pub streamed: Mutex<String>,
    pub lines: Mutex<Vec<String>>,
    pub tool_results: Mutex<Vec<(String, String, bool)>>,
}

impl OutputSink for RecordingOutput {
    fn stream_text(&self, delta: &str) {
        self.streamed.lock().unwrap().push_str(delta);
    }
    fn stream_thinking(&self, _delta: &str) {}
    fn stream_done(&self, _usage: Option<Usage>) {}
    fn text_line(&self, line: &str) {
        self.lines.lock().unwrap().push(line.to_owned());
    }
    fn info(&self, message: &str) {
        self.lines.lock().unwrap().push(message.to_owned());
    }
    fn warning(&self, message: &str) {
        self.lines.lock().unwrap().push(format!("warn: {message}"));
    }
    fn success(&self, message: &str) {
        self.lines.lock().unwrap().push(message.to_owned());
    }
    fn error(&self, message: &str) {
        self.lines.lock().unwrap().push(format!("error: {message}"));
    }
    fn tool_call(&self, _name: &str, _description: &str) {}
    fn tool_result(&self, name: &str, output: &str, is_error: bool) {
        self.tool_results
            .lock()
            .unwrap()
            .push((name.to_owned(), output.to_owned(), is_error));
    }
    fn permission_prompt(&self, _tool: &str, _level: PermissionLevel, _description: &str) {}
    fn activity(&self, _status: &str) {}
    fn update_context_stats(&self, _ratio: f64, _used: usize, _window: usize, _warn: bool) {}
    fn set_session_id(&self, _id: &str) {}
    fn clear(&self) {}
}

// ---------------------------------------------------------------------------
// Filesystem tools
// ---------------------------------------------------------------------------

pub struct ListFilesTool {
    pub guard: Arc<PathGuard>,
}

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }
    fn description(&self) -> &str {
        "List files under a directory in the project"
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
        })
    }
    fn permission_level(&self) -> PermissionLevel {
        PermissionLevel::Read
    }
    async fn execute(
        &self,
        input: &Map<String, Value>,
        _cancel: &CancellationToken,
    ) -> std::result::Result<String, ToolError> {
        let path = input.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let dir = self
            .guard
            .validate_read(path)
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        let mut names: Vec<String> = std::fs::read_dir(&dir)
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(names.join("\n"))
    }
}

pub struct ReadFileTool {
    pub guard: Arc<PathGuard>,
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }
    fn description(&self) -> &str {
        "Read a file from the project"
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"],
        })
    }
    fn permission_level(&self) -> PermissionLevel {
        PermissionLevel::Read
    }
    async fn execute(
        &self,
        input: &Map<String, Value>,
        _cancel: &CancellationToken,
    ) -> std::result::Result<String, ToolError> {
        let path = input
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput {
                name: "read_file".into(),
                reason: "missing path".into(),
            })?;
        let resolved = self
            .guard
            .validate_read(path)
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        std::fs::read_to_string(&resolved).map_err(|e| ToolError::ExecutionFailed(e.to_string()))
    }
}

pub struct WriteFileTool {
    pub guard: Arc<PathGuard>,
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }
    fn description(&self) -> &str {
        "Write a file inside the project"
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["path", "content"],
        })
    }
    fn permission_level(&self) -> PermissionLevel {
        PermissionLevel::Write
    }
    async fn execute(
        &self,
        input: &Map<String, Value>,
        _cancel: &CancellationToken,
    ) -> std::result::Result<String, ToolError> {
        let path = input["path"].as_str().unwrap_or_default();
        let content = input["content"].as_str().unwrap_or_default();
        let mut file = self
            .guard
            .open_for_write(path)
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        use std::io::Write;
        file.write_all(content.as_bytes())
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(format!("wrote {} bytes to {path}", content.len()))
    }
}

pub struct EditFileTool {
    pub guard: Arc<PathGuard>,
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }
    fn description(&self) -> &str {
        "Replace text in a project file"
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "old_text": { "type": "string" },
                "new_text": { "type": "string" }
            },
            "required": ["path", "old_text", "new_text"],
        })
    }
    fn permission_level(&self) -> PermissionLevel {
        PermissionLevel::Write
    }
    async fn execute(
        &self,
        input: &Map<String, Value>,
        _cancel: &CancellationToken,
    ) -> std::result::Result<String, ToolError> {
        let path = input["path"].as_str().unwrap_or_default();
        let old_text = input["old_text"].as_str().unwrap_or_default();
        let new_text = input["new_text"].as_str().unwrap_or_default();

        let resolved = self
            .guard
            .validate_read(path)
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        let contents = std::fs::read_to_string(&resolved)
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        if !contents.contains(old_text) {
            return Err(ToolError::ExecutionFailed(format!(
                "`{old_text}` not found in {path}"
            )));
        }
        let updated = contents.replacen(old_text, new_text, 1);

        let mut file = self
            .guard
            .open_for_write(path)
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        use std::io::Write;
        file.write_all(updated.as_bytes())
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(format!("edited {path}"))
    }
}
