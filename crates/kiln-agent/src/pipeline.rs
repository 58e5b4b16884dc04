//! The plan → execute → verify pipeline.
//!
//! Plan and Review intents leave the single-agent loop and run here: the
//! planner produces a step DAG under a read-only tool set, the execute
//! stage walks the DAG running any step whose dependencies are done (with
//! bounded retries per step), and the verify stage runs registered lint and
//! test tools, then asks the LLM to review the diff of every file the
//! pipeline touched. Any error-severity finding fails verification.
//!
//! The whole pipeline runs inside a single checkpoint, so one `/rewind`
//! undoes everything it wrote.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Map;
use similar::TextDiff;
use tokio_util::sync::CancellationToken;

use kiln_core::{Message, PermissionLevel, ToolDefinition};

use crate::config::Tier;
use crate::error::{AgentError, Result};
use crate::llm::ChatRequest;
use crate::planner::{Plan, PlanStep, Planner, StepKind, extract_json_block};
use crate::router::Intent;
use crate::runtime::{Agent, TurnOutcome};

/// Per-file cap on rendered diff bytes fed to the reviewer.
const MAX_DIFF_BYTES: usize = 4_000;

// ---------------------------------------------------------------------------
// Verification issues
// ---------------------------------------------------------------------------

/// Severity of a finding from the verification review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Error,
    Warning,
    Info,
}

/// One finding from the verification review.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyIssue {
    pub severity: IssueSeverity,
    pub message: String,
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ReviewOutput {
    #[serde(default)]
    issues: Vec<VerifyIssue>,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

impl Agent {
    /// Run a Plan/Review query through the three-stage flow.
    pub(crate) async fn run_pipeline_turn(
        &self,
        goal: &str,
        intent: Intent,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        tracing::info!(%intent, "entering plan pipeline");
        self.context.add(Message::user(goal.to_owned()));

        // -- Stage 1: plan (read-only tools) ---------------------------------
        self.output.activity("planning");
        let read_defs = self.read_only_definitions();
        let planner = Planner::new(
            std::sync::Arc::clone(&self.llm),
            self.config.models.genius.clone(),
        );
        let plan = planner.generate(goal, &read_defs, None).await?;
        self.output.text_line(&plan.render());

        if self.config.pipeline.confirm_plan {
            let accepted = self
                .input
                .confirm("Execute this plan?", true)
                .unwrap_or(false);
            if !accepted {
                self.output.info("plan discarded");
                self.context
                    .add(Message::assistant("Plan rejected by user."));
                return Ok(TurnOutcome::PlanRejected);
            }
        }

        // -- Stage 2: execute (DAG walk) -------------------------------------
        // One checkpoint spans the whole pipeline; snapshot-on-first-touch
        // keeps the pre-pipeline state whatever order steps touch files in.
        self.checkpoints.start(goal);
        let executed = self.execute_plan(plan, cancel).await;
        self.checkpoints.commit();

        let (plan, step_outputs) = match executed {
            Ok(done) => done,
            Err(AgentError::Cancelled) => return Ok(TurnOutcome::Cancelled),
            Err(e) => {
                // The checkpoint is already committed, so /rewind can undo
                // whatever the failed plan managed to write.
                return Err(e);
            }
        };

        if cancel.is_cancelled() {
            return Ok(TurnOutcome::Cancelled);
        }

        // -- Stage 3: verify -------------------------------------------------
        self.output.activity("verifying");
        let issues = self.verify(&plan, cancel).await?;

        let errors = issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Error)
            .count();
        let warnings = issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Warning)
            .count();

        for issue in &issues {
            let line = match &issue.file {
                Some(file) => format!("{file}: {}", issue.message),
                None => issue.message.clone(),
            };
            match issue.severity {
                IssueSeverity::Error => self.output.error(&line),
                IssueSeverity::Warning => self.output.warning(&line),
                IssueSeverity::Info => self.output.info(&line),
            }
        }

        let summary = format!(
            "Completed {} plan steps; verification found {errors} error(s) and {warnings} warning(s).",
            step_outputs.len(),
        );
        self.context.add(Message::assistant(summary.clone()));

        if errors > 0 {
            self.output.error("verification failed");
            return Ok(TurnOutcome::VerificationFailed { errors });
        }

        self.output.success(&summary);
        Ok(TurnOutcome::Completed {
            text: summary,
            iterations: step_outputs.len() as u32,
        })
    }

    /// Walk the DAG until every step is done, running each ready step with
    /// retries. Returns the finished plan and each step's final output.
    async fn execute_plan(
        &self,
        mut plan: Plan,
        cancel: &CancellationToken,
    ) -> Result<(Plan, HashMap<u32, String>)> {
        let mut outputs: HashMap<u32, String> = HashMap::new();

        while !plan.is_complete() {
            if cancel.is_cancelled() {
                return Ok((plan, outputs));
            }

            let ready = plan.ready_steps();
            if ready.is_empty() {
                // validate() rejects cycles, so this is unreachable short of
                // a logic bug; fail loudly rather than spin.
                return Err(AgentError::Internal(
                    "plan has unfinished steps but none are ready".into(),
                ));
            }

            for id in ready {
                if cancel.is_cancelled() {
                    return Ok((plan, outputs));
                }
                let step = plan
                    .step(id)
                    .expect("ready step id exists in plan")
                    .clone();
                self.output
                    .activity(&format!("step {id}: {}", step.description));

                let output = self.run_step_with_retries(&step, &outputs, cancel).await?;
                outputs.insert(id, output);
                plan.mark_done(id);
            }
        }

        Ok((plan, outputs))
    }

    /// One step, retried with exponential backoff on failure.
    async fn run_step_with_retries(
        &self,
        step: &PlanStep,
        prior_outputs: &HashMap<u32, String>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let cfg = &self.config.pipeline;
        let max_attempts = cfg.step_retries + 1;
        let mut delay = cfg.initial_retry_delay;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.run_step(step, prior_outputs, cancel).await {
                Ok(output) => {
                    tracing::info!(step = step.id, attempt, "step completed");
                    return Ok(output);
                }
                Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
                Err(e) => {
                    tracing::warn!(step = step.id, attempt, error = %e, "step attempt failed");
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        tokio::time::sleep(delay).await;
                        delay = Duration::from_secs_f64(
                            (delay.as_secs_f64() * cfg.retry_backoff_factor)
                                .min(cfg.max_retry_delay.as_secs_f64()),
                        );
                    }
                }
            }
        }

        Err(AgentError::StepFailed {
            step_id: step.id,
            attempts: max_attempts,
            reason: last_error,
        })
    }

    /// A bounded mini ReAct loop scoped to one step. Runs non-streaming:
    /// step workers report through `activity`, not the text stream.
    async fn run_step(
        &self,
        step: &PlanStep,
        prior_outputs: &HashMap<u32, String>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.llm.set_tier(match step.kind {
            StepKind::Read => Tier::Fast,
            StepKind::Code | StepKind::Test | StepKind::Verify => Tier::Smart,
        });

        let tools = match step.kind {
            StepKind::Read => self.read_only_definitions(),
            _ => self.registry.definitions(),
        };

        let mut messages = vec![Message::user(step_prompt(step, prior_outputs))];

        for _ in 0..self.config.pipeline.step_max_iterations {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            let request = ChatRequest::new(messages.clone())
                .with_tools(tools.clone())
                .with_system(
                    "You are executing one step of an approved plan for a codebase \
                     assistant. Use tools as needed, then reply with a short summary \
                     of what you did and found.",
                );

            let response = self.llm.chat(&request).await?;

            if !response.has_tool_calls() {
                return Ok(response.text);
            }

            messages.push(Message::assistant_tool_calls(
                response.text,
                response.tool_calls.clone(),
            ));
            let results = self.executor.execute_batch(&response.tool_calls, cancel).await;
            for result in results {
                messages.push(Message::tool_result(result.tool_call_id, result.content));
            }
        }

        Err(AgentError::Internal(format!(
            "step {} did not converge within {} iterations",
            step.id, self.config.pipeline.step_max_iterations
        )))
    }

    /// Verification: run registered lint/test tools, then have the LLM
    /// review the diffs of everything the pipeline touched.
    async fn verify(&self, plan: &Plan, cancel: &CancellationToken) -> Result<Vec<VerifyIssue>> {
        let mut check_report = String::new();
        let check_names = self
            .config
            .pipeline
            .lint_tools
            .iter()
            .chain(self.config.pipeline.test_tools.iter());

        for name in check_names {
            if !self.registry.contains(name) {
                continue;
            }
            self.output.activity(&format!("running {name}"));
            match self.registry.execute(name, &Map::new(), cancel).await {
                Ok(output) => {
                    check_report.push_str(&format!("## {name}\n{output}\n"));
                }
                Err(e) => {
                    check_report.push_str(&format!("## {name} (failed)\n{e}\n"));
                }
            }
        }

        let diffs = self.render_diffs();
        if diffs.is_empty() && check_report.is_empty() {
            return Ok(Vec::new());
        }

        let prompt = format!(
            "Review the result of an automated coding session.\n\n\
             Goal: {goal}\n\n\
             Check output:\n{checks}\n\
             Changes:\n{diffs}\n\n\
             Respond with valid JSON: {{\"issues\": [{{\"severity\": \
             \"error\"|\"warning\"|\"info\", \"message\": \"...\", \"file\": \"...\"}}]}}. \
             Use \"error\" only for defects that must block acceptance. An empty issues \
             array means the changes look good.",
            goal = plan.goal,
            checks = if check_report.is_empty() { "(no checks registered)" } else { &check_report },
            diffs = if diffs.is_empty() { "(no file changes recorded)".to_owned() } else { diffs },
        );

        self.llm.set_tier(Tier::Genius);
        let response = self
            .llm
            .chat(&ChatRequest::new(vec![Message::user(prompt)]))
            .await?;

        let parsed: ReviewOutput = serde_json::from_str(extract_json_block(&response.text))
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "unparseable review output; treating as clean");
                ReviewOutput::default()
            });
        Ok(parsed.issues)
    }

    /// Unified diffs of every file recorded in the pipeline's checkpoint,
    /// capped per file.
    fn render_diffs(&self) -> String {
        let mut out = String::new();
        for (path, snapshot) in self.checkpoints.latest_files() {
            let before = snapshot
                .contents
                .as_deref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            let after = std::fs::read_to_string(&path).unwrap_or_default();
            if before == after {
                continue;
            }

            let label = path.display().to_string();
            let diff = TextDiff::from_lines(before.as_str(), after.as_str())
                .unified_diff()
                .context_radius(3)
                .header(&format!("a/{label}"), &format!("b/{label}"))
                .to_string();

            if diff.len() > MAX_DIFF_BYTES {
                let mut end = MAX_DIFF_BYTES;
                while !diff.is_char_boundary(end) {
                    end -= 1;
                }
                out.push_str(&diff[..end]);
                out.push_str("\n[diff truncated]\n");
            } else {
                out.push_str(&diff);
            }
            out.push('\n');
        }
        out
    }

    /// Definitions of registered tools with Read permission level.
    pub(crate) fn read_only_definitions(&self) -> Vec<ToolDefinition> {
        self.registry
            .definitions()
            .into_iter()
            .filter(|def| {
                self.registry
                    .get(&def.name)
                    .map(|tool| tool.permission_level() == PermissionLevel::Read)
                    .unwrap_or(false)
            })
            .collect()
    }
}

/// Prompt for one step's worker, including what its dependencies produced.
fn step_prompt(step: &PlanStep, prior_outputs: &HashMap<u32, String>) -> String {
    let mut prompt = format!("Execute this plan step:\n\n{}\n", step.description);

    if !step.files.is_empty() {
        prompt.push_str(&format!("\nLikely files involved: {}\n", step.files.join(", ")));
    }

    let mut deps: Vec<u32> = step.depends_on.clone();
    deps.sort_unstable();
    for dep in deps {
        if let Some(output) = prior_outputs.get(&dep) {
            prompt.push_str(&format!("\nResult of prerequisite step {dep}:\n{output}\n"));
        }
    }
    prompt
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
