//! Tool capability trait and registry.
//!
//! A tool is a named JSON-schema endpoint the LLM may invoke. The registry
//! owns every registered tool, validates inputs against each tool's declared
//! schema before dispatch, and supports per-tool enablement from host
//! configuration.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::message::ToolDefinition;

// ---------------------------------------------------------------------------
// Permission levels
// ---------------------------------------------------------------------------

/// How invasive a tool is, for permission gating and parallel dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionLevel {
    /// Inspects state without changing it (read a file, grep, list).
    Read,
    /// Mutates files inside the project root.
    Write,
    /// Runs external processes or otherwise acts outside the file layer.
    Execute,
}

impl std::fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Execute => "execute",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by tools and the registry.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// No tool with the requested name is registered.
    #[error("unknown tool: {name}")]
    NotFound { name: String },

    /// The tool exists but is disabled by configuration.
    #[error("tool `{name}` is disabled")]
    Disabled { name: String },

    /// The input did not satisfy the tool's JSON schema.
    #[error("invalid input for `{name}`: {reason}")]
    InvalidInput { name: String, reason: String },

    /// The tool ran and failed.
    #[error("{0}")]
    ExecutionFailed(String),

    /// The invocation observed cancellation before completing.
    #[error("interrupted")]
    Interrupted,
}

// ---------------------------------------------------------------------------
// Tool trait
// ---------------------------------------------------------------------------

/// A capability exposed to the LLM and executed by the runtime.
///
/// Implementations live outside the core (filesystem, grep, bash, git,
/// language servers); the runtime only depends on this contract.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name, as advertised to the LLM.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for the tool's input object.
    fn input_schema(&self) -> Value;

    /// Permission classification used by the policy and the parallel
    /// dispatch decision.
    fn permission_level(&self) -> PermissionLevel;

    /// Execute the tool. Implementations should observe `cancel` during
    /// long-running work and return [`ToolError::Interrupted`] when it
    /// fires.
    async fn execute(
        &self,
        input: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<String, ToolError>;

    /// The definition advertised to the LLM.
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_owned(),
            description: self.description().to_owned(),
            input_schema: self.input_schema(),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Concurrent registry of tools with per-tool enablement.
///
/// Registration happens at startup; lookups and execution are lock-free
/// reads on a [`DashMap`].
#[derive(Default)]
pub struct ToolRegistry {
    tools: DashMap<String, Arc<dyn Tool>>,
    disabled: DashMap<String, ()>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any previous tool with the same name.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        tracing::debug!(tool = tool.name(), level = %tool.permission_level(), "tool registered");
        self.tools.insert(tool.name().to_owned(), tool);
    }

    /// Look up an enabled tool by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Tool>, ToolError> {
        if self.disabled.contains_key(name) {
            return Err(ToolError::Disabled { name: name.to_owned() });
        }
        self.tools
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ToolError::NotFound { name: name.to_owned() })
    }

    /// Whether `name` is registered and enabled.
    pub fn contains(&self, name: &str) -> bool {
        !self.disabled.contains_key(name) && self.tools.contains_key(name)
    }

    /// Names of all enabled tools, sorted for stable output.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .iter()
            .filter(|entry| !self.disabled.contains_key(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Definitions of all enabled tools, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.list()
            .into_iter()
            .filter_map(|name| self.tools.get(&name).map(|t| t.definition()))
            .collect()
    }

    /// Disable a tool without unregistering it.
    pub fn disable(&self, name: &str) {
        self.disabled.insert(name.to_owned(), ());
    }

    /// Re-enable a previously disabled tool.
    pub fn enable(&self, name: &str) {
        self.disabled.remove(name);
    }

    /// Validate `input` against the tool's schema and execute it.
    ///
    /// Schema violations come back as [`ToolError::InvalidInput`] so the
    /// model can correct its arguments on the next turn.
    pub async fn execute(
        &self,
        name: &str,
        input: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<String, ToolError> {
        let tool = self.get(name)?;
        validate_input(name, &tool.input_schema(), input)?;
        tool.execute(input, cancel).await
    }
}

/// Validate a tool input object against the tool's declared JSON schema.
fn validate_input(
    name: &str,
    schema: &Value,
    input: &Map<String, Value>,
) -> Result<(), ToolError> {
    let compiled =
        jsonschema::JSONSchema::compile(schema).map_err(|e| ToolError::InvalidInput {
            name: name.to_owned(),
            reason: format!("tool declares an invalid schema: {e}"),
        })?;

    let instance = Value::Object(input.clone());
    if let Err(errors) = compiled.validate(&instance) {
        let detail: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(ToolError::InvalidInput {
            name: name.to_owned(),
            reason: detail.join("; "),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
