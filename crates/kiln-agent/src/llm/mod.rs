//! LLM client contract and resilience layer.
//!
//! The runtime never embeds a vendor backend. Hosts implement [`LlmClient`]
//! for whatever serves their models; the runtime wraps it in a
//! [`CircuitBreaker`] and consumes responses as typed [`Chunk`] streams.
//!
//! - [`types`] -- chunk/request/response types and the tool-call assembler.
//! - [`client`] -- the `LlmClient` trait.
//! - [`args`] -- tolerant tool-argument parsing.
//! - [`breaker`] -- the circuit breaker decorator.

pub mod args;
pub mod breaker;
pub mod client;
pub mod types;

pub use args::{parse_argument_text, parse_argument_value};
pub use breaker::{CircuitBreaker, CircuitState};
pub use client::LlmClient;
pub use types::{ChatRequest, ChatResponse, Chunk, ChunkStream, ToolCallAssembler, ToolCallDelta};
