//! Shared data model and host contracts for the Kiln agent runtime.
//!
//! This crate defines the types that flow between the agent loop, the tool
//! layer, and the embedding host:
//!
//! - [`message`] -- conversation messages, tool calls, tool results, and the
//!   tool definitions advertised to the LLM.
//! - [`tool`] -- the `Tool` capability trait, permission levels, and the
//!   tool registry with schema validation and per-tool enablement.
//! - [`ui`] -- the output and input contracts the runtime emits through.
//!   Implementations may be a terminal, a programmatic embedding, or a no-op.
//!
//! Nothing in this crate talks to an LLM or touches the filesystem beyond
//! what a registered tool does itself.

pub mod message;
pub mod tool;
pub mod ui;

pub use message::{Message, Role, ToolCall, ToolDefinition, ToolResult, Usage};
pub use tool::{PermissionLevel, Tool, ToolError, ToolRegistry};
pub use ui::{InputSource, NullInput, NullOutput, OutputSink};
