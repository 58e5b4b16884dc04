//! Plan generation and the step DAG.
//!
//! The planner asks the LLM to decompose a goal into typed steps with
//! explicit dependencies, parses the JSON it returns (tolerating markdown
//! fences), and validates that the dependency graph is acyclic before
//! anything executes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use kiln_core::{Message, ToolDefinition};

use crate::error::{AgentError, Result};
use crate::llm::{ChatRequest, LlmClient};

// ---------------------------------------------------------------------------
// Plan types
// ---------------------------------------------------------------------------

/// What kind of work a step is; execution uses this to scope tools and the
/// verifier treats `Verify` steps as its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// Gather understanding (read files, grep).
    Read,
    /// Change code.
    Code,
    /// Run or write tests.
    Test,
    /// Confirm the result.
    Verify,
}

/// A single step in a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// Identifier referenced by `depends_on`.
    pub id: u32,

    /// What to do.
    pub description: String,

    /// Step classification.
    pub kind: StepKind,

    /// Files the step is expected to touch, when known up front.
    #[serde(default)]
    pub files: Vec<String>,

    /// Steps that must complete first.
    #[serde(default)]
    pub depends_on: Vec<u32>,

    /// Whether the step has completed.
    #[serde(default)]
    pub done: bool,
}

/// An executable decomposition of a goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Unique plan identifier.
    pub id: Uuid,

    /// The goal that was decomposed.
    pub goal: String,

    /// Steps in declaration order.
    pub steps: Vec<PlanStep>,
}

impl Plan {
    /// Validate structural integrity: unique ids, known dependencies, and
    /// an acyclic dependency graph.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(AgentError::PlanningFailed {
                reason: "plan contains zero steps".into(),
            });
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id) {
                return Err(AgentError::PlanningFailed {
                    reason: format!("duplicate step id {}", step.id),
                });
            }
        }
        for step in &self.steps {
            for dep in &step.depends_on {
                if !ids.contains(dep) {
                    return Err(AgentError::PlanningFailed {
                        reason: format!("step {} depends on unknown step {dep}", step.id),
                    });
                }
                if *dep == step.id {
                    return Err(AgentError::PlanCycle { step_id: step.id });
                }
            }
        }

        // Kahn's algorithm; anything left over sits on a cycle.
        let mut in_degree: HashMap<u32, usize> = self
            .steps
            .iter()
            .map(|s| (s.id, s.depends_on.len()))
            .collect();
        let mut dependents: HashMap<u32, Vec<u32>> = HashMap::new();
        for step in &self.steps {
            for dep in &step.depends_on {
                dependents.entry(*dep).or_default().push(step.id);
            }
        }

        let mut queue: Vec<u32> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = queue.pop() {
            visited += 1;
            for dependent in dependents.get(&id).into_iter().flatten() {
                let degree = in_degree
                    .get_mut(dependent)
                    .expect("dependent id was inserted above");
                *degree -= 1;
                if *degree == 0 {
                    queue.push(*dependent);
                }
            }
        }

        if visited != self.steps.len() {
            let stuck = in_degree
                .iter()
                .filter(|(_, deg)| **deg > 0)
                .map(|(id, _)| *id)
                .min()
                .unwrap_or(0);
            return Err(AgentError::PlanCycle { step_id: stuck });
        }

        Ok(())
    }

    /// Ids of steps that are not done and whose dependencies all are.
    pub fn ready_steps(&self) -> Vec<u32> {
        let done: HashSet<u32> = self.steps.iter().filter(|s| s.done).map(|s| s.id).collect();
        self.steps
            .iter()
            .filter(|s| !s.done && s.depends_on.iter().all(|dep| done.contains(dep)))
            .map(|s| s.id)
            .collect()
    }

    /// Mark a step done.
    pub fn mark_done(&mut self, id: u32) {
        if let Some(step) = self.steps.iter_mut().find(|s| s.id == id) {
            step.done = true;
        }
    }

    /// Look up a step by id.
    pub fn step(&self, id: u32) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Whether every step is done.
    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.done)
    }

    /// Human-readable rendering for the UI and the plan confirmation.
    pub fn render(&self) -> String {
        let mut out = format!("Plan: {}\n", self.goal);
        for step in &self.steps {
            let deps = if step.depends_on.is_empty() {
                String::new()
            } else {
                format!(
                    " (after {})",
                    step.depends_on
                        .iter()
                        .map(u32::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            };
            out.push_str(&format!(
                "  {}. [{}] {}{}\n",
                step.id,
                serde_json::to_value(step.kind)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_owned))
                    .unwrap_or_default(),
                step.description,
                deps
            ));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

/// Decomposes goals into validated plans using the LLM.
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl Planner {
    /// Create a planner that plans on `model` (normally the genius tier).
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }

    /// Produce a validated plan for `goal`.
    pub async fn generate(
        &self,
        goal: &str,
        available_tools: &[ToolDefinition],
        context: Option<&str>,
    ) -> Result<Plan> {
        let system = self.build_system_prompt(available_tools);
        let mut user = format!("Decompose this goal into an executable plan:\n\n{goal}");
        if let Some(context) = context {
            user.push_str(&format!("\n\nRelevant workspace context:\n{context}"));
        }

        let request = ChatRequest::new(vec![Message::user(user)])
            .with_system(system)
            .with_model(self.model.clone());

        let response = self.llm.chat(&request).await?;
        if response.has_tool_calls() {
            return Err(AgentError::PlanningFailed {
                reason: "planner returned tool calls instead of a plan".into(),
            });
        }

        let plan = parse_plan(goal, &response.text)?;
        plan.validate()?;

        tracing::info!(goal, steps = plan.steps.len(), "plan generated");
        Ok(plan)
    }

    fn build_system_prompt(&self, available_tools: &[ToolDefinition]) -> String {
        let tool_list: String = available_tools
            .iter()
            .map(|t| format!("- `{}`: {}", t.name, t.description))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            r#"You are the planning stage of a codebase assistant. Decompose the user's goal into ordered steps.

## Available tools
{tool_list}

## Output format
Respond with valid JSON (no markdown fencing) in exactly this structure:
{{
  "steps": [
    {{
      "id": 1,
      "description": "What this step does",
      "kind": "read" | "code" | "test" | "verify",
      "files": ["src/lib.rs"],
      "depends_on": []
    }}
  ]
}}

## Rules
- Start with read steps that gather understanding, end with a verify step.
- Keep the plan minimal: the fewest steps that finish the goal.
- depends_on lists step ids that must complete first; the graph must have no cycles.
- List files only when you are confident they are involved."#
        )
    }
}

/// Parse the LLM's plan JSON, tolerating markdown code fences.
fn parse_plan(goal: &str, text: &str) -> Result<Plan> {
    let json = extract_json_block(text);

    #[derive(Deserialize)]
    struct RawPlan {
        steps: Vec<PlanStep>,
    }

    let raw: RawPlan = serde_json::from_str(json).map_err(|e| AgentError::PlanningFailed {
        reason: format!("failed to parse plan JSON: {e}"),
    })?;

    Ok(Plan {
        id: Uuid::now_v7(),
        goal: goal.to_owned(),
        steps: raw.steps,
    })
}

/// Extract a JSON block from text that may wrap it in markdown fences.
pub(crate) fn extract_json_block(text: &str) -> &str {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```json") {
        let body = start + "```json".len();
        if let Some(end) = trimmed[body..].find("```") {
            return trimmed[body..body + end].trim();
        }
    }
    if let Some(start) = trimmed.find("```") {
        let body = start + 3;
        if let Some(end) = trimmed[body..].find("```") {
            return trimmed[body..body + end].trim();
        }
    }
    trimmed
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
