//! Output and input contracts consumed by the runtime.
//!
//! The agent loop is oblivious to rendering: everything user-visible goes
//! through [`OutputSink`], and the only two places the core ever reads from
//! the user (the permission prompt and the planner's confirmation step) go
//! through [`InputSource`]. Hosts provide a terminal, a programmatic
//! embedding, or the no-op implementations below.

use std::io;

use crate::message::Usage;
use crate::tool::PermissionLevel;

/// Everything the runtime emits toward the user.
///
/// Methods are infallible from the core's perspective; implementations
/// swallow or report their own I/O problems.
pub trait OutputSink: Send + Sync {
    /// A streamed assistant text delta.
    fn stream_text(&self, delta: &str);

    /// A streamed thinking/reasoning delta.
    fn stream_thinking(&self, delta: &str);

    /// The current stream finished, with token usage if known.
    fn stream_done(&self, usage: Option<Usage>);

    /// A complete line of plain text.
    fn text_line(&self, line: &str);

    /// Informational notice.
    fn info(&self, message: &str);

    /// Warning notice.
    fn warning(&self, message: &str);

    /// Success notice.
    fn success(&self, message: &str);

    /// Error notice.
    fn error(&self, message: &str);

    /// A tool is about to run.
    fn tool_call(&self, name: &str, description: &str);

    /// A tool finished. `output` is always the full display copy, even when
    /// the in-context copy was truncated or summarized.
    fn tool_result(&self, name: &str, output: &str, is_error: bool);

    /// The permission policy needs a decision; the answer is read through
    /// [`InputSource::read_line`].
    fn permission_prompt(&self, tool_name: &str, level: PermissionLevel, description: &str);

    /// Transient activity/status indicator (e.g. "thinking", "searching").
    fn activity(&self, status: &str);

    /// Context window statistics after a conversation change.
    fn update_context_stats(&self, ratio: f64, used: usize, window: usize, warn: bool);

    /// The active session changed.
    fn set_session_id(&self, id: &str);

    /// Clear any rendered conversation state.
    fn clear(&self);
}

/// The two reads the core performs from the user.
pub trait InputSource: Send + Sync {
    /// Read one line, displaying `prompt` first.
    fn read_line(&self, prompt: &str) -> io::Result<String>;

    /// Yes/no confirmation with a default.
    fn confirm(&self, prompt: &str, default_yes: bool) -> io::Result<bool>;
}

// ---------------------------------------------------------------------------
// No-op implementations
// ---------------------------------------------------------------------------

/// Output sink that drops everything. Used in tests and headless embeddings.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullOutput;

impl OutputSink for NullOutput {
    fn stream_text(&self, _delta: &str) {}
    fn stream_thinking(&self, _delta: &str) {}
    fn stream_done(&self, _usage: Option<Usage>) {}
    fn text_line(&self, _line: &str) {}
    fn info(&self, _message: &str) {}
    fn warning(&self, _message: &str) {}
    fn success(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
    fn tool_call(&self, _name: &str, _description: &str) {}
    fn tool_result(&self, _name: &str, _output: &str, _is_error: bool) {}
    fn permission_prompt(&self, _tool_name: &str, _level: PermissionLevel, _description: &str) {}
    fn activity(&self, _status: &str) {}
    fn update_context_stats(&self, _ratio: f64, _used: usize, _window: usize, _warn: bool) {}
    fn set_session_id(&self, _id: &str) {}
    fn clear(&self) {}
}

/// Input source that always answers the default.
///
/// `read_line` returns an empty string, which the permission policy maps to
/// deny-once, so a headless run can never silently grant access.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullInput;

impl InputSource for NullInput {
    fn read_line(&self, _prompt: &str) -> io::Result<String> {
        Ok(String::new())
    }

    fn confirm(&self, _prompt: &str, default_yes: bool) -> io::Result<bool> {
        Ok(default_yes)
    }
}
