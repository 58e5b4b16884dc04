//! The agent runtime and its ReAct loop.
//!
//! [`Agent`] owns every core component: the path guard, permission policy,
//! checkpoint ring, context manager, result cache, tool executor, and the
//! breaker-wrapped LLM client. One `Agent` serves one session.
//!
//! A turn walks the loop: open a checkpoint, stream an LLM response, run
//! any requested tools, feed results back, commit the checkpoint, and
//! repeat until the model answers with plain text, the iteration cap
//! trips, or the user cancels.

use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use kiln_core::{
    InputSource, Message, NullInput, NullOutput, OutputSink, PermissionLevel, ToolRegistry,
};

use crate::cache::ResultCache;
use crate::checkpoint::CheckpointManager;
use crate::commands::{self, CommandHooks, NullHooks};
use crate::config::AgentConfig;
use crate::context::ContextManager;
use crate::error::{AgentError, Result};
use crate::executor::ToolExecutor;
use crate::llm::{ChatRequest, Chunk, CircuitBreaker, LlmClient, ToolCallAssembler};
use crate::permission::{PermissionMode, PermissionPolicy};
use crate::retrieval::{self, RetrievalAugmenter};
use crate::router::{Intent, IntentRouter};
use crate::workspace::PathGuard;

/// Read tools that survive every analysis-mode filter so the model always
/// has eyes on the workspace.
const CORE_READ_TOOLS: [&str; 3] = ["read_file", "list_files", "grep"];

// ---------------------------------------------------------------------------
// Modes and outcomes
// ---------------------------------------------------------------------------

/// High-level agent behavior mode, orthogonal to the permission mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    /// Read-only exploration; the tool set is restricted to reads and the
    /// permission mode is forced to Auto.
    Ask,
    /// Planning conversations; reads are free, writes prompt.
    Plan,
    /// Unrestricted, subject to the global permission mode.
    Build,
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ask => "ask",
            Self::Plan => "plan",
            Self::Build => "build",
        };
        write!(f, "{s}")
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The model produced a final text answer.
    Completed { text: String, iterations: u32 },
    /// The user cancelled; partial progress is preserved in the context.
    Cancelled,
    /// The input was a slash command and was handled.
    CommandHandled,
    /// The user asked to leave.
    Exit,
    /// The user declined a generated plan.
    PlanRejected,
    /// The plan executed but verification found blocking issues.
    VerificationFailed { errors: usize },
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Step-by-step construction of an [`Agent`].
pub struct AgentBuilder {
    llm: Arc<dyn LlmClient>,
    root: std::path::PathBuf,
    config: AgentConfig,
    registry: Arc<ToolRegistry>,
    output: Arc<dyn OutputSink>,
    input: Arc<dyn InputSource>,
    retrieval: Option<Arc<dyn RetrievalAugmenter>>,
    hooks: Arc<dyn CommandHooks>,
    system_prompt: String,
}

impl AgentBuilder {
    /// Override the runtime configuration.
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a pre-populated tool registry.
    pub fn registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Where runtime output goes.
    pub fn output(mut self, output: Arc<dyn OutputSink>) -> Self {
        self.output = output;
        self
    }

    /// Where the permission prompt and plan confirmation read from.
    pub fn input(mut self, input: Arc<dyn InputSource>) -> Self {
        self.input = input;
        self
    }

    /// Attach a best-effort workspace retriever.
    pub fn retrieval(mut self, retrieval: Arc<dyn RetrievalAugmenter>) -> Self {
        self.retrieval = Some(retrieval);
        self
    }

    /// Attach host hooks for session/skill/clipboard commands.
    pub fn hooks(mut self, hooks: Arc<dyn CommandHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Replace the default system prompt.
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Construct the agent. Fails if the project root cannot be resolved.
    pub fn build(self) -> Result<Agent> {
        let guard = Arc::new(PathGuard::new(&self.root)?);
        let policy = Arc::new(PermissionPolicy::new(
            PermissionMode::Ask,
            Arc::clone(&self.output),
            Arc::clone(&self.input),
        ));
        let checkpoints = Arc::new(CheckpointManager::new(
            self.config.agent_loop.checkpoint_capacity,
        ));
        let context = Arc::new(ContextManager::new(self.config.context.clone()));
        let cache = Arc::new(ResultCache::new(self.config.cache.clone()));

        let breaker = Arc::new(CircuitBreaker::new(
            Arc::clone(&self.llm),
            self.config.breaker.clone(),
        ));
        let llm: Arc<dyn LlmClient> = breaker.clone();

        let executor = Arc::new(ToolExecutor::new(
            Arc::clone(&self.registry),
            Arc::clone(&policy),
            Arc::clone(&checkpoints),
            Arc::clone(&cache),
            Arc::clone(&guard),
            Arc::clone(&self.output),
            self.config.executor.clone(),
        ));

        let router = IntentRouter::new(Some(Arc::clone(&llm)), self.config.models.fast.clone());

        Ok(Agent {
            config: self.config,
            registry: self.registry,
            llm,
            breaker,
            policy,
            checkpoints,
            context,
            cache,
            executor,
            guard,
            output: self.output,
            input: self.input,
            router,
            retrieval: self.retrieval,
            hooks: self.hooks,
            mode: AgentMode::Build,
            stashed_permission_mode: None,
            cancel: CancellationToken::new(),
            session_id: String::new(),
            system_prompt: self.system_prompt,
        })
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// One session's runtime: all shared components plus the loop.
pub struct Agent {
    pub(crate) config: AgentConfig,
    pub(crate) registry: Arc<ToolRegistry>,
    pub(crate) llm: Arc<dyn LlmClient>,
    pub(crate) breaker: Arc<CircuitBreaker>,
    pub(crate) policy: Arc<PermissionPolicy>,
    pub(crate) checkpoints: Arc<CheckpointManager>,
    pub(crate) context: Arc<ContextManager>,
    pub(crate) cache: Arc<ResultCache>,
    pub(crate) executor: Arc<ToolExecutor>,
    pub(crate) guard: Arc<PathGuard>,
    pub(crate) output: Arc<dyn OutputSink>,
    pub(crate) input: Arc<dyn InputSource>,
    pub(crate) router: IntentRouter,
    pub(crate) retrieval: Option<Arc<dyn RetrievalAugmenter>>,
    pub(crate) hooks: Arc<dyn CommandHooks>,
    pub(crate) mode: AgentMode,
    pub(crate) stashed_permission_mode: Option<PermissionMode>,
    pub(crate) cancel: CancellationToken,
    pub(crate) session_id: String,
    pub(crate) system_prompt: String,
}

impl Agent {
    /// Start building an agent around an LLM client and a project root.
    pub fn builder(llm: Arc<dyn LlmClient>, root: impl AsRef<Path>) -> AgentBuilder {
        AgentBuilder {
            llm,
            root: root.as_ref().to_path_buf(),
            config: AgentConfig::default(),
            registry: Arc::new(ToolRegistry::new()),
            output: Arc::new(NullOutput),
            input: Arc::new(NullInput),
            retrieval: None,
            hooks: Arc::new(NullHooks),
            system_prompt: "You are Kiln, a codebase assistant. Use the available tools to \
                            inspect and modify the project; answer concisely."
                .to_owned(),
        }
    }

    /// The token the host cancels to interrupt whatever is running.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The current agent mode.
    pub fn mode(&self) -> AgentMode {
        self.mode
    }

    /// The context manager, for host-side session persistence hookup.
    pub fn context(&self) -> &Arc<ContextManager> {
        &self.context
    }

    /// The permission policy.
    pub fn policy(&self) -> &Arc<PermissionPolicy> {
        &self.policy
    }

    /// The checkpoint manager.
    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    /// The tool registry.
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// The canonical project root.
    pub fn project_root(&self) -> &Path {
        self.guard.root()
    }

    /// Switch agent modes, updating the permission policy atomically.
    ///
    /// Ask forces Auto permission over a read-only tool set; Plan forces
    /// prompting for writes; entering Build restores whatever permission
    /// mode was active before leaving it.
    pub fn set_mode(&mut self, mode: AgentMode) {
        if self.mode == mode {
            return;
        }
        match mode {
            AgentMode::Ask => {
                self.stashed_permission_mode.get_or_insert(self.policy.mode());
                self.policy.set_mode(PermissionMode::Auto);
            }
            AgentMode::Plan => {
                self.stashed_permission_mode.get_or_insert(self.policy.mode());
                self.policy.set_mode(PermissionMode::Ask);
            }
            AgentMode::Build => {
                if let Some(previous) = self.stashed_permission_mode.take() {
                    self.policy.set_mode(previous);
                }
            }
        }
        tracing::info!(from = %self.mode, to = %mode, "agent mode changed");
        self.mode = mode;
    }

    /// Handle one line of user input: a slash command or a query.
    pub async fn handle(&mut self, line: &str) -> Result<TurnOutcome> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(TurnOutcome::CommandHandled);
        }
        if line.starts_with('/') {
            return commands::handle_command(self, line).await;
        }
        self.run_query(line).await
    }

    /// Route and run a natural-language query.
    async fn run_query(&mut self, query: &str) -> Result<TurnOutcome> {
        let cancel = self.cancel.child_token();

        // Best-effort retrieval pre-pass; failures are silent.
        let prompt = match &self.retrieval {
            Some(augmenter) => {
                match retrieval::augment_query(augmenter.as_ref(), query, &self.config.retrieval)
                    .await
                {
                    Some(block) => format!("{block}\n{query}"),
                    None => query.to_owned(),
                }
            }
            None => query.to_owned(),
        };

        self.output.activity("routing");
        let intent = self.router.classify(query).await;
        tracing::info!(%intent, "query routed");

        let outcome = if matches!(intent, Intent::Plan | Intent::Review) {
            self.run_pipeline_turn(&prompt, intent, &cancel).await
        } else {
            self.llm.set_tier(intent.recommended_tier());
            self.run_loop(prompt, &cancel).await
        };
        self.report_failure(&outcome);
        outcome
    }

    /// The single-agent ReAct loop for one turn.
    pub(crate) async fn run_loop(
        &self,
        user_message: String,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        self.context.add(Message::user(user_message.clone()));
        self.push_context_stats();

        let cap = self.config.agent_loop.max_iterations;
        for iteration in 0..cap {
            tracing::debug!(iteration, "loop iteration start");

            self.maybe_compact().await;

            self.checkpoints.start(&user_message);

            let tools = self.tool_definitions_for_turn(&user_message);
            let request = ChatRequest::new(self.context.messages())
                .with_tools(tools)
                .with_system(self.system_prompt.clone());

            self.output.activity("thinking");
            let stream = match self.llm.chat_stream(&request).await {
                Ok(stream) => stream,
                Err(e) => {
                    self.checkpoints.commit();
                    return Err(e);
                }
            };

            let consumed = self.consume_stream(stream, cancel).await;

            if consumed.cancelled {
                if !consumed.text.is_empty() {
                    self.context.add(Message::assistant(consumed.text));
                }
                self.checkpoints.commit();
                return Ok(TurnOutcome::Cancelled);
            }
            if let Some(reason) = consumed.error {
                self.checkpoints.commit();
                return Err(AgentError::Stream { reason });
            }

            let calls = consumed.calls;
            if calls.is_empty() {
                self.context.add(Message::assistant(consumed.text.clone()));
                self.checkpoints.commit();
                self.push_context_stats();
                return Ok(TurnOutcome::Completed {
                    text: consumed.text,
                    iterations: iteration + 1,
                });
            }

            self.context
                .add(Message::assistant_tool_calls(consumed.text, calls.clone()));

            let results = self.executor.execute_batch(&calls, cancel).await;
            debug_assert_eq!(results.len(), calls.len());
            for result in results {
                self.context
                    .add(Message::tool_result(result.tool_call_id, result.content));
            }

            self.checkpoints.commit();
            self.push_context_stats();

            if cancel.is_cancelled() {
                return Ok(TurnOutcome::Cancelled);
            }
        }

        Err(AgentError::MaxIterations { cap })
    }

    /// Drain one LLM stream into text, tool calls, and a terminal state.
    async fn consume_stream(
        &self,
        mut stream: crate::llm::ChunkStream,
        cancel: &CancellationToken,
    ) -> ConsumedStream {
        let mut consumed = ConsumedStream::default();
        let mut assembler = ToolCallAssembler::new();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    consumed.cancelled = true;
                    break;
                }
                chunk = stream.next() => chunk,
            };

            match chunk {
                Some(Chunk::Text(delta)) => {
                    self.output.stream_text(&delta);
                    consumed.text.push_str(&delta);
                }
                Some(Chunk::Thinking(delta)) => {
                    self.output.stream_thinking(&delta);
                }
                Some(Chunk::ToolCall(delta)) => {
                    assembler.push(&delta);
                }
                Some(Chunk::Done(usage)) => {
                    self.output.stream_done(Some(usage));
                    break;
                }
                Some(Chunk::Error(reason)) => {
                    consumed.error = Some(reason);
                    break;
                }
                None => break,
            }
        }

        consumed.calls = assembler.finish();
        consumed
    }

    /// Compact when past the threshold; failures leave the context as-is.
    async fn maybe_compact(&self) {
        if self.context.needs_compaction() {
            let analysis = self.policy.mode() == PermissionMode::Analysis;
            self.output.activity("compacting context");
            if let Err(e) = self.context.compact(self.llm.as_ref(), None, analysis).await {
                tracing::warn!(error = %e, "auto-compaction failed; continuing uncompacted");
            }
        }
        if self.context.take_warning() {
            let stats = self.context.stats();
            self.output.warning(&format!(
                "context {}% full; /compact to summarize earlier messages",
                (stats.usage_ratio * 100.0) as u32
            ));
        }
    }

    /// Tool definitions for this turn, filtered by agent mode and, in
    /// analysis mode, by query relevance.
    pub(crate) fn tool_definitions_for_turn(&self, query: &str) -> Vec<kiln_core::ToolDefinition> {
        let read_only = self.mode == AgentMode::Ask;
        let analysis = self.policy.mode() == PermissionMode::Analysis;

        self.registry
            .definitions()
            .into_iter()
            .filter(|def| {
                let Ok(tool) = self.registry.get(&def.name) else {
                    return false;
                };
                let level = tool.permission_level();
                if (read_only || analysis) && level != PermissionLevel::Read {
                    return false;
                }
                if analysis && !CORE_READ_TOOLS.contains(&def.name.as_str()) {
                    return relevant_to_query(def, query);
                }
                true
            })
            .collect()
    }

    /// Emit the current context stats through the output contract.
    fn push_context_stats(&self) {
        let stats = self.context.stats();
        self.output.update_context_stats(
            stats.usage_ratio,
            stats.tokens_used,
            stats.context_window,
            stats.usage_ratio >= stats.warn_threshold,
        );
    }

    /// Print the user-visible failure line for fatal turn errors.
    fn report_failure(&self, outcome: &Result<TurnOutcome>) {
        if let Err(e) = outcome {
            self.output.error(&e.to_string());
        }
    }
}

/// Accumulated state from draining one stream.
#[derive(Default)]
struct ConsumedStream {
    text: String,
    calls: Vec<kiln_core::ToolCall>,
    error: Option<String>,
    cancelled: bool,
}

/// Analysis-mode relevance: the tool's name or description shares a
/// meaningful token with the query.
fn relevant_to_query(def: &kiln_core::ToolDefinition, query: &str) -> bool {
    let haystack = format!("{} {}", def.name, def.description).to_lowercase();
    query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.len() > 3)
        .any(|token| haystack.contains(token))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{Map, Value, json};

    use kiln_core::{Tool, ToolError};

    use crate::config::Tier;
    use crate::llm::{ChatResponse, ChunkStream};

    struct InertClient;

    #[async_trait]
    impl LlmClient for InertClient {
        async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse> {
            Ok(ChatResponse::default())
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

    struct LeveledTool {
        name: &'static str,
        description: &'static str,
        level: PermissionLevel,
    }

    #[async_trait]
    impl Tool for LeveledTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            self.description
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn permission_level(&self) -> PermissionLevel {
            self.level
        }
        async fn execute(
            &self,
            _input: &Map<String, Value>,
            _cancel: &CancellationToken,
        ) -> std::result::Result<String, ToolError> {
            Ok("ok".into())
        }
    }

    fn test_agent() -> (tempfile::TempDir, Agent) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(LeveledTool {
            name: "read_file",
            description: "Read a file from the workspace",
            level: PermissionLevel::Read,
        }));
        registry.register(Arc::new(LeveledTool {
            name: "search_symbols",
            description: "Search language symbols in the index",
            level: PermissionLevel::Read,
        }));
        registry.register(Arc::new(LeveledTool {
            name: "write_file",
            description: "Write a file",
            level: PermissionLevel::Write,
        }));

        let agent = Agent::builder(Arc::new(InertClient), dir.path())
            .registry(registry)
            .build()
            .unwrap();
        (dir, agent)
    }

    #[test]
    fn ask_mode_forces_auto_and_build_restores() {
        let (_dir, mut agent) = test_agent();
        agent.policy.set_mode(PermissionMode::Strict);

        agent.set_mode(AgentMode::Ask);
        assert_eq!(agent.policy.mode(), PermissionMode::Auto);

        agent.set_mode(AgentMode::Build);
        assert_eq!(agent.policy.mode(), PermissionMode::Strict);
        assert!(agent.stashed_permission_mode.is_none());
    }

    #[test]
    fn plan_mode_prompts_for_writes() {
        let (_dir, mut agent) = test_agent();
        agent.policy.set_mode(PermissionMode::Auto);

        agent.set_mode(AgentMode::Plan);
        assert_eq!(agent.policy.mode(), PermissionMode::Ask);

        agent.set_mode(AgentMode::Build);
        assert_eq!(agent.policy.mode(), PermissionMode::Auto);
    }

    #[test]
    fn ask_then_plan_restores_the_original_mode() {
        let (_dir, mut agent) = test_agent();
        agent.policy.set_mode(PermissionMode::Strict);

        agent.set_mode(AgentMode::Ask);
        agent.set_mode(AgentMode::Plan);
        agent.set_mode(AgentMode::Build);
        // The stash from entering Ask survives the Plan hop.
        assert_eq!(agent.policy.mode(), PermissionMode::Strict);
    }

    #[test]
    fn ask_mode_filters_to_read_tools() {
        let (_dir, mut agent) = test_agent();
        agent.set_mode(AgentMode::Ask);

        let names: Vec<String> = agent
            .tool_definitions_for_turn("anything")
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert!(names.contains(&"read_file".to_owned()));
        assert!(!names.contains(&"write_file".to_owned()));
    }

    #[test]
    fn analysis_mode_selects_by_query_relevance() {
        let (_dir, agent) = test_agent();
        agent.policy.set_mode(PermissionMode::Analysis);

        // Query mentioning symbols keeps the symbol tool.
        let names: Vec<String> = agent
            .tool_definitions_for_turn("find all symbols named Foo")
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert!(names.contains(&"search_symbols".to_owned()));
        assert!(names.contains(&"read_file".to_owned())); // core read set
        assert!(!names.contains(&"write_file".to_owned()));

        // An unrelated query drops it but keeps the core read set.
        let names: Vec<String> = agent
            .tool_definitions_for_turn("summarize the readme")
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert!(!names.contains(&"search_symbols".to_owned()));
        assert!(names.contains(&"read_file".to_owned()));
    }

    #[test]
    fn build_mode_exposes_everything() {
        let (_dir, agent) = test_agent();
        let names: Vec<String> = agent
            .tool_definitions_for_turn("anything")
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert!(names.contains(&"write_file".to_owned()));
    }
}
