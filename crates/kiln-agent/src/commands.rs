//! Slash commands.
//!
//! The runtime recognizes a small, closed set of commands. Anything that
//! needs capabilities the core scopes out (clipboard, session files, the
//! semantic index, skill files) goes through [`CommandHooks`], which hosts
//! implement; the defaults report the feature as unavailable.

use async_trait::async_trait;

use kiln_core::Message;

use crate::config::Tier;
use crate::error::{AgentError, Result};
use crate::permission::PermissionMode;
use crate::router::Intent;
use crate::runtime::{Agent, AgentMode, TurnOutcome};

const HELP: &str = "\
Commands:
  /help                    show this help
  /exit, /quit             leave
  /clear                   reset the conversation and permission cache
  /copy                    copy the last assistant reply
  /context                 show context window usage
  /compact [focus]         summarize earlier messages now
  /mode {fast|smart|genius} switch the model tier
  /ask  /plan [goal]  /build  switch agent mode
  /skills                  list available skills
  /status                  show runtime status
  /reindex                 rebuild the semantic index
  /sessions                list saved sessions
  /resume [id-prefix]      resume a saved session
  /new                     start a fresh session
  /rewind                  restore files from the last checkpoint
  /delete <id-prefix> [--force]  delete a saved session";

// ---------------------------------------------------------------------------
// Host hooks
// ---------------------------------------------------------------------------

/// External collaborators the session-level commands delegate to.
///
/// Every method has a "not available" default so a minimal embedding works
/// with [`NullHooks`].
#[async_trait]
pub trait CommandHooks: Send + Sync {
    /// Copy text to the host clipboard. `false` means unsupported.
    fn copy_to_clipboard(&self, _text: &str) -> bool {
        false
    }

    /// Names of available skills.
    fn list_skills(&self) -> Vec<String> {
        Vec::new()
    }

    /// Rebuild the semantic index. `false` means unsupported.
    async fn reindex(&self) -> bool {
        false
    }

    /// Saved sessions as `(id, title)` pairs, most recent first.
    fn list_sessions(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Load a saved session by id prefix.
    fn resume_session(&self, _id_prefix: &str) -> Option<(String, Vec<Message>)> {
        None
    }

    /// Allocate a fresh session, returning its id.
    fn new_session(&self) -> Option<String> {
        None
    }

    /// Delete a saved session by id prefix. `force` skips safety checks.
    fn delete_session(&self, _id_prefix: &str, _force: bool) -> bool {
        false
    }
}

/// Hooks that support nothing; every session command reports unavailable.
pub struct NullHooks;

impl CommandHooks for NullHooks {}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Handle one slash-command line.
pub async fn handle_command(agent: &mut Agent, line: &str) -> Result<TurnOutcome> {
    let mut parts = line.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or("").trim();

    match command {
        "/help" => {
            agent.output.text_line(HELP);
        }
        "/exit" | "/quit" => return Ok(TurnOutcome::Exit),
        "/clear" => {
            agent.context.clear();
            agent.policy.clear_cache();
            agent.cache.clear();
            agent.output.clear();
            agent.output.info("conversation cleared");
        }
        "/copy" => {
            let last = agent
                .context
                .messages()
                .into_iter()
                .rev()
                .find(|m| m.role == kiln_core::Role::Assistant && !m.content.is_empty());
            match last {
                Some(message) if agent.hooks.copy_to_clipboard(&message.content) => {
                    agent.output.success("copied");
                }
                Some(_) => agent.output.warning("clipboard not available"),
                None => agent.output.warning("nothing to copy"),
            }
        }
        "/context" => {
            let stats = agent.context.stats();
            agent.output.text_line(&format!(
                "context: {} / {} tokens ({:.0}%), {} messages",
                stats.tokens_used,
                stats.context_window,
                stats.usage_ratio * 100.0,
                stats.message_count
            ));
        }
        "/compact" => {
            let focus = if rest.is_empty() { None } else { Some(rest) };
            let analysis = agent.policy.mode() == PermissionMode::Analysis;
            let before = agent.context.stats().tokens_used;
            match agent
                .context
                .compact(agent.llm.as_ref(), focus, analysis)
                .await
            {
                Ok(()) => {
                    let after = agent.context.stats().tokens_used;
                    agent
                        .output
                        .success(&format!("compacted: {before} -> {after} tokens"));
                }
                Err(e) => agent.output.error(&format!("compaction failed: {e}")),
            }
        }
        "/mode" => match rest {
            "fast" => set_tier(agent, Tier::Fast),
            "smart" => set_tier(agent, Tier::Smart),
            "genius" => set_tier(agent, Tier::Genius),
            _ => agent.output.warning("usage: /mode {fast|smart|genius}"),
        },
        "/ask" => {
            agent.set_mode(AgentMode::Ask);
            agent.output.info("ask mode: read-only tools, no prompts");
        }
        "/plan" => {
            agent.set_mode(AgentMode::Plan);
            agent.output.info("plan mode: reads are free, writes prompt");
            if !rest.is_empty() {
                let cancel = agent.cancel_token().child_token();
                let outcome = agent.run_pipeline_turn(rest, Intent::Plan, &cancel).await;
                if let Err(e) = &outcome {
                    agent.output.error(&e.to_string());
                }
                return outcome;
            }
        }
        "/build" => {
            agent.set_mode(AgentMode::Build);
            agent.output.info("build mode");
        }
        "/skills" => {
            let skills = agent.hooks.list_skills();
            if skills.is_empty() {
                agent.output.info("no skills available");
            } else {
                for skill in skills {
                    agent.output.text_line(&skill);
                }
            }
        }
        "/status" => {
            let stats = agent.context.stats();
            agent.output.text_line(&format!(
                "mode: {} | permissions: {} | model: {} | circuit: {} | checkpoints: {} | context: {:.0}%",
                agent.mode(),
                agent.policy.mode(),
                agent.llm.model(),
                agent.breaker.state(),
                agent.checkpoints.len(),
                stats.usage_ratio * 100.0
            ));
        }
        "/reindex" => {
            if agent.hooks.reindex().await {
                agent.output.success("reindex complete");
            } else {
                agent.output.warning("semantic index not available");
            }
        }
        "/sessions" => {
            let sessions = agent.hooks.list_sessions();
            if sessions.is_empty() {
                agent.output.info("no saved sessions");
            } else {
                for (id, title) in sessions {
                    agent.output.text_line(&format!("{id}  {title}"));
                }
            }
        }
        "/resume" => match agent.hooks.resume_session(rest) {
            Some((id, messages)) => {
                agent.context.restore(messages);
                agent.policy.clear_cache();
                agent.session_id = id.clone();
                agent.output.set_session_id(&id);
                agent.output.success(&format!("resumed session {id}"));
            }
            None => agent.output.warning("session not found"),
        },
        "/new" => {
            agent.context.clear();
            agent.policy.clear_cache();
            agent.cache.clear();
            let id = agent.hooks.new_session().unwrap_or_default();
            agent.session_id = id.clone();
            if !id.is_empty() {
                agent.output.set_session_id(&id);
            }
            agent.output.success("new session");
        }
        "/rewind" => match agent.checkpoints.rewind() {
            Ok(report) if report.errors.is_empty() => {
                agent.output.success(&format!(
                    "restored {} file(s) from before: {}",
                    report.restored, report.prompt
                ));
            }
            Ok(report) => {
                agent
                    .output
                    .error(&format!("partial rewind: {}", report.errors[0]));
            }
            Err(AgentError::NoCheckpoint) => agent.output.warning("nothing to rewind"),
            Err(e) => return Err(e),
        },
        "/delete" => {
            let mut args = rest.split_whitespace();
            let prefix = args.next().unwrap_or("");
            let force = args.any(|a| a == "--force");
            if prefix.is_empty() {
                agent.output.warning("usage: /delete <id-prefix> [--force]");
            } else if agent.hooks.delete_session(prefix, force) {
                agent.output.success("session deleted");
            } else {
                agent.output.warning("session not found or delete refused");
            }
        }
        other => {
            agent
                .output
                .warning(&format!("unknown command {other}; see /help"));
        }
    }

    Ok(TurnOutcome::CommandHandled)
}

fn set_tier(agent: &Agent, tier: Tier) {
    agent.llm.set_tier(tier);
    agent.output.info(&format!("model tier: {tier}"));
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use kiln_core::{NullOutput, OutputSink, PermissionLevel, ToolRegistry, Usage};

    use crate::llm::{ChatRequest, ChatResponse, ChunkStream, LlmClient};

    struct InertClient;

    #[async_trait]
    impl LlmClient for InertClient {
        async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse> {
            Ok(ChatResponse {
                text: "summary".into(),
                ..ChatResponse::default()
            })
        }
        async fn chat_stream(&self, _request: &ChatRequest) -> Result<ChunkStream> {
            Err(AgentError::Llm { reason: "inert".into() })
        }
        fn set_model(&self, _model: &str) {}
        fn model(&self) -> String {
            "inert".into()
        }
        fn set_tier(&self, _tier: Tier) {}
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Output sink that records every line-level call.
    #[derive(Default)]
    struct RecordingOutput {
        lines: Mutex<Vec<String>>,
    }

    impl OutputSink for RecordingOutput {
        fn stream_text(&self, _delta: &str) {}
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
        fn tool_result(&self, _name: &str, _output: &str, _is_error: bool) {}
        fn permission_prompt(&self, _tool: &str, _level: PermissionLevel, _description: &str) {}
        fn activity(&self, _status: &str) {}
        fn update_context_stats(&self, _ratio: f64, _used: usize, _window: usize, _warn: bool) {}
        fn set_session_id(&self, _id: &str) {}
        fn clear(&self) {}
    }

    async fn agent_with_output() -> (tempfile::TempDir, Agent, Arc<RecordingOutput>) {
        let dir = tempfile::tempdir().unwrap();
        let output = Arc::new(RecordingOutput::default());
        let agent = Agent::builder(Arc::new(InertClient), dir.path())
            .registry(Arc::new(ToolRegistry::new()))
            .output(output.clone())
            .build()
            .unwrap();
        (dir, agent, output)
    }

    #[tokio::test]
    async fn exit_commands_return_exit() {
        let (_dir, mut agent, _output) = agent_with_output().await;
        assert_eq!(agent.handle("/exit").await.unwrap(), TurnOutcome::Exit);
        assert_eq!(agent.handle("/quit").await.unwrap(), TurnOutcome::Exit);
    }

    #[tokio::test]
    async fn clear_resets_context_and_permission_cache() {
        let (_dir, mut agent, _output) = agent_with_output().await;
        agent.context.add(Message::user("hello"));
        assert_eq!(
            agent.handle("/clear").await.unwrap(),
            TurnOutcome::CommandHandled
        );
        assert!(agent.context.messages().is_empty());
    }

    #[tokio::test]
    async fn mode_commands_switch_agent_mode() {
        let (_dir, mut agent, _output) = agent_with_output().await;
        agent.handle("/ask").await.unwrap();
        assert_eq!(agent.mode(), AgentMode::Ask);
        agent.handle("/build").await.unwrap();
        assert_eq!(agent.mode(), AgentMode::Build);
    }

    #[tokio::test]
    async fn unknown_command_warns_but_is_handled() {
        let (_dir, mut agent, output) = agent_with_output().await;
        assert_eq!(
            agent.handle("/frobnicate").await.unwrap(),
            TurnOutcome::CommandHandled
        );
        let lines = output.lines.lock().unwrap();
        assert!(lines.iter().any(|l| l.contains("unknown command")));
    }

    #[tokio::test]
    async fn rewind_with_nothing_to_rewind_warns() {
        let (_dir, mut agent, output) = agent_with_output().await;
        agent.handle("/rewind").await.unwrap();
        let lines = output.lines.lock().unwrap();
        assert!(lines.iter().any(|l| l.contains("nothing to rewind")));
    }

    #[tokio::test]
    async fn status_reports_mode_and_circuit() {
        let (_dir, mut agent, output) = agent_with_output().await;
        agent.handle("/status").await.unwrap();
        let lines = output.lines.lock().unwrap();
        assert!(lines.iter().any(|l| l.contains("mode: build") && l.contains("circuit: closed")));
    }

    #[tokio::test]
    async fn sessions_without_hooks_report_unavailable() {
        let (_dir, mut agent, output) = agent_with_output().await;
        agent.handle("/sessions").await.unwrap();
        agent.handle("/resume abc").await.unwrap();
        agent.handle("/reindex").await.unwrap();
        let lines = output.lines.lock().unwrap();
        assert!(lines.iter().any(|l| l.contains("no saved sessions")));
        assert!(lines.iter().any(|l| l.contains("session not found")));
        assert!(lines.iter().any(|l| l.contains("not available")));
    }

    #[tokio::test]
    async fn help_lists_the_closed_command_set() {
        let (_dir, mut agent, output) = agent_with_output().await;
        agent.handle("/help").await.unwrap();
        let lines = output.lines.lock().unwrap();
        let help = lines.first().expect("help text printed");
        for command in ["/clear", "/compact", "/rewind", "/resume", "/delete"] {
            assert!(help.contains(command), "{command} missing from help");
        }
    }
}
