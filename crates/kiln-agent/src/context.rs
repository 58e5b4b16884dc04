//! Conversation context management.
//!
//! Tracks the message list and a cheap deterministic token estimate,
//! triggers auto-compaction near the window limit, and exposes the save
//! hook an external session persister attaches to.
//!
//! Compaction asks the LLM for two things: a prose summary of the oldest
//! messages, and a list of *learnings* (imperatives and preferences worth
//! remembering long-term) that are routed through an optional callback. The
//! summarized prefix is then replaced by a single assistant message while
//! the most recent messages survive verbatim.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use kiln_core::{Message, Role};

use crate::config::ContextConfig;
use crate::error::{AgentError, Result};
use crate::llm::{ChatRequest, LlmClient};

// ---------------------------------------------------------------------------
// Stats and learnings
// ---------------------------------------------------------------------------

/// Context window statistics for the UI and `/context`.
#[derive(Debug, Clone, Copy)]
pub struct ContextStats {
    pub tokens_used: usize,
    pub context_window: usize,
    pub usage_ratio: f64,
    pub warn_threshold: f64,
    pub compact_threshold: f64,
    pub message_count: usize,
}

/// Something the summarizer flagged as worth remembering beyond this
/// session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Learning {
    pub kind: LearningKind,
    pub text: String,
}

/// Rough classification of a learning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearningKind {
    /// An instruction to follow ("always run the linter before tests").
    Imperative,
    /// A user preference ("prefers tabs in Makefiles").
    Preference,
}

/// Fired with a snapshot of the conversation after every append.
pub type SaveHook = Box<dyn Fn(&[Message]) + Send + Sync>;

/// Fired with the learnings extracted during a compaction.
pub type LearningsHook = Box<dyn Fn(&[Learning]) + Send + Sync>;

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Owns the conversation and its token budget.
pub struct ContextManager {
    messages: Mutex<Vec<Message>>,
    config: ContextConfig,
    save_hook: Mutex<Option<SaveHook>>,
    learnings_hook: Mutex<Option<LearningsHook>>,
    warned: AtomicBool,
}

impl ContextManager {
    /// Create a manager with the given budget configuration.
    pub fn new(config: ContextConfig) -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            config,
            save_hook: Mutex::new(None),
            learnings_hook: Mutex::new(None),
            warned: AtomicBool::new(false),
        }
    }

    /// Append a message and fire the save hook.
    pub fn add(&self, message: Message) {
        let snapshot = {
            let mut messages = self.messages.lock().expect("context mutex poisoned");
            messages.push(message);
            messages.clone()
        };
        if let Some(hook) = self.save_hook.lock().expect("context mutex poisoned").as_ref() {
            hook(&snapshot);
        }
    }

    /// A snapshot of the conversation.
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().expect("context mutex poisoned").clone()
    }

    /// Drop the whole conversation.
    pub fn clear(&self) {
        self.messages.lock().expect("context mutex poisoned").clear();
        self.warned.store(false, Ordering::SeqCst);
    }

    /// Replace the conversation wholesale (session resume).
    pub fn restore(&self, messages: Vec<Message>) {
        *self.messages.lock().expect("context mutex poisoned") = messages;
        self.warned.store(false, Ordering::SeqCst);
    }

    /// Install the save hook, replacing any previous one.
    pub fn on_save(&self, hook: SaveHook) {
        *self.save_hook.lock().expect("context mutex poisoned") = Some(hook);
    }

    /// Install the learnings hook, replacing any previous one.
    pub fn on_learnings(&self, hook: LearningsHook) {
        *self.learnings_hook.lock().expect("context mutex poisoned") = Some(hook);
    }

    /// Current statistics.
    pub fn stats(&self) -> ContextStats {
        let messages = self.messages.lock().expect("context mutex poisoned");
        let tokens_used = estimate_messages(&messages, self.config.per_message_overhead);
        ContextStats {
            tokens_used,
            context_window: self.config.context_window,
            usage_ratio: tokens_used as f64 / self.config.context_window as f64,
            warn_threshold: self.config.warn_threshold,
            compact_threshold: self.config.compact_threshold,
            message_count: messages.len(),
        }
    }

    /// Whether usage crossed the compaction threshold (and auto-compaction
    /// is enabled).
    pub fn needs_compaction(&self) -> bool {
        self.config.auto_compact && self.stats().usage_ratio >= self.config.compact_threshold
    }

    /// Whether usage is past the warning threshold.
    pub fn needs_warning(&self) -> bool {
        self.stats().usage_ratio >= self.config.warn_threshold
    }

    /// Latched variant of [`ContextManager::needs_warning`]: true exactly
    /// once per crossing, rearmed by compaction/clear/restore.
    pub fn take_warning(&self) -> bool {
        if self.needs_warning() {
            !self.warned.swap(true, Ordering::SeqCst)
        } else {
            self.warned.store(false, Ordering::SeqCst);
            false
        }
    }

    /// Summarize the oldest messages into one assistant message, keeping
    /// the most recent `preserve_last` verbatim (fewer in analysis mode).
    ///
    /// The optional `focus` steers the summary ("focus on the database
    /// migration"). The caller is the loop; nothing appends concurrently.
    pub async fn compact(
        &self,
        llm: &dyn LlmClient,
        focus: Option<&str>,
        analysis_mode: bool,
    ) -> Result<()> {
        let preserve = if analysis_mode {
            self.config.preserve_last_analysis
        } else {
            self.config.preserve_last
        };

        let snapshot = self.messages();
        let (system, conversation) = split_system(&snapshot);
        if conversation.len() <= preserve {
            tracing::debug!(
                total = snapshot.len(),
                preserve,
                "not enough messages to compact"
            );
            return Ok(());
        }

        let split_point = conversation.len() - preserve;
        let prefix = &conversation[..split_point];
        let tail = &conversation[split_point..];
        let prefix_tokens = estimate_messages(prefix, self.config.per_message_overhead);

        tracing::info!(
            summarized = prefix.len(),
            preserved = tail.len(),
            prefix_tokens,
            "compacting conversation"
        );

        let transcript = format_transcript(prefix);
        let (mut summary, learnings) = summarize(llm, &transcript, focus).await?;

        // The rewrite must strictly shrink the estimate; clamp the summary
        // so the whole replacement message (header included) stays below the
        // prefix it replaces.
        let header = format!("[Summary of {} earlier messages]\n", prefix.len());
        let max_content_chars = prefix_tokens
            .saturating_sub(self.config.per_message_overhead + 1)
            .saturating_mul(4);
        let summary_budget = max_content_chars.saturating_sub(header.len());
        if summary.len() > summary_budget {
            summary = truncate_at_char_boundary(&summary, summary_budget);
        }

        if !learnings.is_empty() {
            if let Some(hook) = self
                .learnings_hook
                .lock()
                .expect("context mutex poisoned")
                .as_ref()
            {
                hook(&learnings);
            }
        }

        let mut rewritten = Vec::with_capacity(2 + tail.len());
        if let Some(system) = system {
            rewritten.push(system.clone());
        }
        rewritten.push(Message::assistant(format!("{header}{summary}")));
        rewritten.extend_from_slice(tail);

        *self.messages.lock().expect("context mutex poisoned") = rewritten;
        self.warned.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Estimation
// ---------------------------------------------------------------------------

/// Cheap token estimate: 4 bytes per token on content plus a flat
/// per-message overhead. Deterministic and monotone in the message list.
fn estimate_message(message: &Message, overhead: usize) -> usize {
    let mut bytes = message.content.len();
    for call in &message.tool_calls {
        bytes += call.name.len();
        bytes += serde_json::to_string(&call.input).map(|s| s.len()).unwrap_or(0);
    }
    overhead + bytes.div_ceil(4)
}

fn estimate_messages(messages: &[Message], overhead: usize) -> usize {
    messages.iter().map(|m| estimate_message(m, overhead)).sum()
}

// ---------------------------------------------------------------------------
// Summarization helpers
// ---------------------------------------------------------------------------

fn split_system(messages: &[Message]) -> (Option<&Message>, &[Message]) {
    match messages.first() {
        Some(first) if first.role == Role::System => (Some(first), &messages[1..]),
        _ => (None, messages),
    }
}

/// Render messages into a readable transcript for the summarizer.
fn format_transcript(messages: &[Message]) -> String {
    let mut buf = String::with_capacity(messages.len() * 200);
    for msg in messages {
        let label = match msg.role {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
        };
        buf.push_str(label);
        buf.push_str(": ");
        if !msg.content.is_empty() {
            buf.push_str(&msg.content);
        }
        for call in &msg.tool_calls {
            buf.push_str(&format!(
                "\n  [tool_call: {}({})]",
                call.name,
                serde_json::to_string(&call.input).unwrap_or_default()
            ));
        }
        buf.push('\n');
    }
    buf
}

async fn summarize(
    llm: &dyn LlmClient,
    transcript: &str,
    focus: Option<&str>,
) -> Result<(String, Vec<Learning>)> {
    let focus_line = focus
        .map(|f| format!("Pay particular attention to: {f}\n\n"))
        .unwrap_or_default();

    let prompt = format!(
        "Summarize the following coding-session transcript concisely, preserving key \
         facts, decisions, file paths, and tool results needed to continue the work.\n\
         {focus_line}\
         After the summary, if the user expressed durable instructions or preferences, \
         add a line `LEARNINGS:` followed by one `- ` bullet per item. Omit the section \
         if there are none.\n\n{transcript}"
    );

    let request = ChatRequest::new(vec![Message::user(prompt)]);
    let response = llm.chat(&request).await?;
    if response.has_tool_calls() {
        return Err(AgentError::LlmParse {
            reason: "summarizer returned tool calls instead of text".into(),
        });
    }

    Ok(parse_summary_output(&response.text))
}

/// Split the summarizer's output into the prose summary and the learnings
/// section, if present.
fn parse_summary_output(text: &str) -> (String, Vec<Learning>) {
    let Some(marker) = text.find("LEARNINGS:") else {
        return (text.trim().to_owned(), Vec::new());
    };

    let summary = text[..marker].trim().to_owned();
    let learnings = text[marker + "LEARNINGS:".len()..]
        .lines()
        .filter_map(|line| {
            let item = line.trim().strip_prefix("- ")?.trim();
            if item.is_empty() {
                return None;
            }
            let lowered = item.to_lowercase();
            let kind = if lowered.contains("prefer") || lowered.contains("likes") {
                LearningKind::Preference
            } else {
                LearningKind::Imperative
            };
            Some(Learning {
                kind,
                text: item.to_owned(),
            })
        })
        .collect();

    (summary, learnings)
}

fn truncate_at_char_boundary(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_owned();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
