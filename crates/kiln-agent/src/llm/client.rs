//! The LLM client contract.
//!
//! The runtime talks to whatever backend the host provides through this
//! trait. Implementations own connection details, wire formats, and model
//! naming; the runtime only selects tiers and consumes typed responses.

use async_trait::async_trait;

use crate::config::Tier;
use crate::error::Result;
use crate::llm::types::{ChatRequest, ChatResponse, ChunkStream};

/// A conversational LLM backend.
///
/// Implementations must be cheap to share behind an `Arc` and safe to call
/// concurrently; `set_model`/`set_tier` use interior mutability.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One complete (non-streaming) turn.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// One streaming turn. The stream yields [`crate::llm::Chunk`] values
    /// ending with `Done` (or `Error`).
    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChunkStream>;

    /// Switch the active model by name.
    fn set_model(&self, model: &str);

    /// The active model name.
    fn model(&self) -> String;

    /// Switch the active capability tier; the implementation maps tiers to
    /// model names.
    fn set_tier(&self, tier: Tier);

    /// Release any held connections. Further calls may fail.
    async fn close(&self) -> Result<()>;
}
