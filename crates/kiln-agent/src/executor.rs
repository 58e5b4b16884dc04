//! Batch tool execution.
//!
//! Takes the tool calls the model emitted in one turn and runs them under
//! the permission policy, snapshotting files before mutation, truncating
//! oversized output, and substituting cached summaries for the in-context
//! copy of very large results. Results always come back in input order.
//!
//! A batch runs concurrently only when it is provably safe and prompt-free:
//! at least two calls, Auto permission mode, and every tool registered with
//! Read level. Everything else is strictly sequential.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use kiln_core::{OutputSink, PermissionLevel, ToolCall, ToolRegistry, ToolResult};

use crate::cache::ResultCache;
use crate::checkpoint::CheckpointManager;
use crate::config::ExecutorConfig;
use crate::permission::{PermissionMode, PermissionPolicy};
use crate::workspace::PathGuard;

/// Tools that mutate files and therefore get a pre-mutation snapshot.
const MUTATING_TOOLS: [&str; 2] = ["write_file", "edit_file"];

/// Content of the synthetic result recorded for calls a cancellation
/// prevented from running.
const INTERRUPTED: &str = "Interrupted";

fn is_mutating(tool_name: &str) -> bool {
    MUTATING_TOOLS.contains(&tool_name)
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Runs tool batches on behalf of the agent loop.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    policy: Arc<PermissionPolicy>,
    checkpoints: Arc<CheckpointManager>,
    cache: Arc<ResultCache>,
    guard: Arc<PathGuard>,
    output: Arc<dyn OutputSink>,
    config: ExecutorConfig,
}

impl ToolExecutor {
    /// Wire up an executor.
    pub fn new(
        registry: Arc<ToolRegistry>,
        policy: Arc<PermissionPolicy>,
        checkpoints: Arc<CheckpointManager>,
        cache: Arc<ResultCache>,
        guard: Arc<PathGuard>,
        output: Arc<dyn OutputSink>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            policy,
            checkpoints,
            cache,
            guard,
            output,
            config,
        }
    }

    /// Execute a turn's tool calls, preserving input order in the output.
    pub async fn execute_batch(
        &self,
        calls: &[ToolCall],
        cancel: &CancellationToken,
    ) -> Vec<ToolResult> {
        if calls.is_empty() {
            return Vec::new();
        }

        if self.can_parallelize(calls) {
            tracing::debug!(count = calls.len(), "dispatching batch in parallel");
            self.execute_parallel(calls, cancel).await
        } else {
            self.execute_sequential(calls, cancel).await
        }
    }

    /// A batch may run concurrently iff it has at least two calls, the
    /// permission mode is Auto (no prompts possible mid-flight), and every
    /// tool is registered with Read level.
    fn can_parallelize(&self, calls: &[ToolCall]) -> bool {
        calls.len() >= 2
            && self.policy.mode() == PermissionMode::Auto
            && calls.iter().all(|call| {
                self.registry
                    .get(&call.name)
                    .map(|tool| tool.permission_level() == PermissionLevel::Read)
                    .unwrap_or(false)
            })
    }

    // -- Sequential path -----------------------------------------------------

    async fn execute_sequential(
        &self,
        calls: &[ToolCall],
        cancel: &CancellationToken,
    ) -> Vec<ToolResult> {
        let mut results = Vec::with_capacity(calls.len());

        for call in calls {
            if cancel.is_cancelled() {
                tracing::info!(
                    pending = calls.len() - results.len(),
                    "batch interrupted; recording synthetic results"
                );
                break;
            }
            results.push(self.execute_one(call, cancel).await);
        }

        // Calls the cancellation prevented from starting still need a
        // result slot so the conversation stays paired.
        for call in &calls[results.len()..] {
            results.push(ToolResult::error(&call.name, &call.id, INTERRUPTED));
        }

        results
    }

    /// Run a single call through the full gate sequence.
    async fn execute_one(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolResult {
        // Unparseable arguments never reach a tool; the model gets a
        // structured request to retry instead.
        if let Some(reason) = &call.parse_error {
            tracing::debug!(tool = %call.name, reason, "tool call had unparseable arguments");
            return ToolResult::error(&call.name, &call.id, retry_instructions(&call.name, reason));
        }

        let tool = match self.registry.get(&call.name) {
            Ok(tool) => tool,
            Err(e) => {
                return ToolResult::error(&call.name, &call.id, e.to_string());
            }
        };

        let level = tool.permission_level();
        let description = describe_input(call);

        if !self.policy.check(&call.name, level, &description) {
            tracing::info!(tool = %call.name, "permission denied");
            return ToolResult::error(&call.name, &call.id, format!("{}: Permission denied", call.name));
        }

        // Repeat of an identical recent large call: answer from the cache.
        if let Some(full) = self.cache.get(&call.name, &call.input) {
            self.output.tool_result(&call.name, &full, false);
            let mut result = ToolResult::ok(&call.name, &call.id, full);
            result.cached = true;
            return result;
        }

        if is_mutating(&call.name) {
            self.snapshot_target(call);
        }

        self.output.tool_call(&call.name, &description);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return ToolResult::error(&call.name, &call.id, INTERRUPTED);
            }
            outcome = self.registry.execute(&call.name, &call.input, cancel) => outcome,
        };

        match outcome {
            Ok(output) => self.finish_success(call, output),
            Err(e) => {
                tracing::debug!(tool = %call.name, error = %e, "tool failed");
                let text = e.to_string();
                self.output.tool_result(&call.name, &text, true);
                ToolResult::error(&call.name, &call.id, text)
            }
        }
    }

    /// Record the pre-mutation state of the file a mutating tool targets.
    /// Resolution failures are left for the tool itself to report.
    fn snapshot_target(&self, call: &ToolCall) {
        let Some(path) = call.input.get("path").and_then(|v| v.as_str()) else {
            return;
        };
        let Ok(resolved) = self.guard.validate_write(path) else {
            return;
        };
        if let Err(e) = self.checkpoints.snapshot(&resolved) {
            tracing::warn!(path, error = %e, "pre-mutation snapshot failed");
        }
    }

    /// Truncate, display, and (for very large outputs) cache-substitute a
    /// successful result.
    fn finish_success(&self, call: &ToolCall, output: String) -> ToolResult {
        let (display, truncated) = truncate_output(output, self.config.max_output_bytes);

        // The UI always gets the full display copy.
        self.output.tool_result(&call.name, &display, false);

        // The conversation gets a summary when the output is cache-worthy;
        // failures never take this path, so error detail is never hidden.
        if let Some(summary) = self.cache.store(&call.name, &call.input, &display) {
            let mut result = ToolResult::ok(&call.name, &call.id, summary);
            result.cached = true;
            return result;
        }

        let mut result = ToolResult::ok(&call.name, &call.id, display);
        result.cached = truncated;
        result
    }

    // -- Parallel path -------------------------------------------------------

    async fn execute_parallel(
        &self,
        calls: &[ToolCall],
        cancel: &CancellationToken,
    ) -> Vec<ToolResult> {
        // Phase 1: permission walk, in input order. Under the Auto
        // precondition every call passes, but the gate stays in the path so
        // the invariant does not depend on it.
        for call in calls {
            let description = describe_input(call);
            if !self
                .policy
                .check(&call.name, PermissionLevel::Read, &description)
            {
                // Fall back to the sequential path, which handles denials.
                return self.execute_sequential(calls, cancel).await;
            }
        }

        // Phase 2: fan out onto a bounded pool, collecting by index.
        let semaphore = Arc::new(Semaphore::new(self.config.parallel_workers));
        let mut join_set: JoinSet<(usize, ToolResult)> = JoinSet::new();

        for (index, call) in calls.iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let registry = Arc::clone(&self.registry);
            let output = Arc::clone(&self.output);
            let cancel = cancel.clone();
            let call = call.clone();
            let max_output_bytes = self.config.max_output_bytes;

            join_set.spawn(async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (index, ToolResult::error(&call.name, &call.id, INTERRUPTED));
                    }
                };

                if cancel.is_cancelled() {
                    return (index, ToolResult::error(&call.name, &call.id, INTERRUPTED));
                }

                if let Some(reason) = &call.parse_error {
                    return (
                        index,
                        ToolResult::error(&call.name, &call.id, retry_instructions(&call.name, reason)),
                    );
                }

                output.tool_call(&call.name, &describe_input(&call));

                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return (index, ToolResult::error(&call.name, &call.id, INTERRUPTED));
                    }
                    outcome = registry.execute(&call.name, &call.input, &cancel) => outcome,
                };

                let result = match outcome {
                    Ok(raw) => {
                        let (display, truncated) = truncate_output(raw, max_output_bytes);
                        output.tool_result(&call.name, &display, false);
                        let mut result = ToolResult::ok(&call.name, &call.id, display);
                        result.cached = truncated;
                        result
                    }
                    Err(e) => {
                        let text = e.to_string();
                        output.tool_result(&call.name, &text, true);
                        ToolResult::error(&call.name, &call.id, text)
                    }
                };
                (index, result)
            });
        }

        let mut slots: Vec<Option<ToolResult>> = vec![None; calls.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => tracing::warn!(error = %e, "parallel tool task failed to join"),
            }
        }

        // Cache substitution happens after collection so the store order is
        // deterministic (input order), then missing slots become synthetic
        // interrupts.
        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                let call = &calls[index];
                match slot {
                    Some(result) if !result.is_error => {
                        if let Some(summary) =
                            self.cache.store(&call.name, &call.input, &result.content)
                        {
                            let mut substituted = ToolResult::ok(&call.name, &call.id, summary);
                            substituted.cached = true;
                            substituted
                        } else {
                            result
                        }
                    }
                    Some(result) => result,
                    None => ToolResult::error(&call.name, &call.id, INTERRUPTED),
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Compact one-line rendering of a call's input for prompts and the UI.
fn describe_input(call: &ToolCall) -> String {
    let rendered = serde_json::to_string(&call.input).unwrap_or_default();
    if rendered.len() > 120 {
        let mut end = 120;
        while !rendered.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &rendered[..end])
    } else {
        rendered
    }
}

/// The structured retry message for unparseable arguments.
fn retry_instructions(tool_name: &str, reason: &str) -> String {
    format!(
        "The arguments for `{tool_name}` could not be parsed: {reason}. \
         Call the tool again with arguments as a single valid JSON object, \
         for example: {{\"path\": \"src/main.rs\"}}."
    )
}

/// Truncate output past the byte limit at a char boundary, appending a
/// marker sentence. Returns the (possibly shortened) text and whether
/// truncation happened.
fn truncate_output(output: String, max_bytes: usize) -> (String, bool) {
    if output.len() <= max_bytes {
        return (output, false);
    }
    let mut end = max_bytes;
    while end > 0 && !output.is_char_boundary(end) {
        end -= 1;
    }
    let total = output.len();
    let mut shortened = output[..end].to_owned();
    shortened.push_str(&format!(
        "\n[output truncated: showing first {end} of {total} bytes]"
    ));
    (shortened, true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
