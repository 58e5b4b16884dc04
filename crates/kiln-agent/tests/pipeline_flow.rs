//! End-to-end scenarios for the plan → execute → verify pipeline.

mod common;

use std::fs;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use kiln_core::{InputSource, PermissionLevel, Tool, ToolError, ToolRegistry};
use kiln_agent::workspace::PathGuard;
use kiln_agent::{Agent, AgentConfig, PermissionMode, TurnOutcome};

use common::{ReadFileTool, RecordingOutput, ScriptedClient, Turn, WriteFileTool};

/// Input source that declines confirmations.
struct DecliningInput;

impl InputSource for DecliningInput {
    fn read_line(&self, _prompt: &str) -> io::Result<String> {
        Ok(String::new())
    }
    fn confirm(&self, _prompt: &str, _default_yes: bool) -> io::Result<bool> {
        Ok(false)
    }
}

/// A lint tool whose report feeds the verification review.
struct LintTool;

#[async_trait]
impl Tool for LintTool {
    fn name(&self) -> &str {
        "lint"
    }
    fn description(&self) -> &str {
        "Run the project linter"
    }
    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }
    fn permission_level(&self) -> PermissionLevel {
        PermissionLevel::Execute
    }
    async fn execute(
        &self,
        _input: &Map<String, Value>,
        _cancel: &CancellationToken,
    ) -> Result<String, ToolError> {
        Ok("lint: 1 warning (unused import in src/lib.rs)".into())
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    root: std::path::PathBuf,
    agent: Agent,
    client: Arc<ScriptedClient>,
    output: Arc<RecordingOutput>,
}

fn fixture(turns: Vec<Turn>, decline_plan: bool, with_lint: bool) -> Fixture {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();

    let guard = Arc::new(PathGuard::new(&root).unwrap());
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(ReadFileTool { guard: Arc::clone(&guard) }));
    registry.register(Arc::new(WriteFileTool { guard: Arc::clone(&guard) }));
    if with_lint {
        registry.register(Arc::new(LintTool));
    }

    let client = ScriptedClient::new(turns);
    let output = Arc::new(RecordingOutput::default());

    let mut builder = Agent::builder(client.clone(), &root)
        .registry(registry)
        .output(output.clone())
        .config(AgentConfig::default());
    if decline_plan {
        builder = builder.input(Arc::new(DecliningInput));
    }
    let agent = builder.build().unwrap();

    Fixture {
        _dir: dir,
        root,
        agent,
        client,
        output,
    }
}

const SINGLE_READ_PLAN: &str = r#"{"steps": [
    {"id": 1, "description": "inspect the module", "kind": "read", "files": ["src/lib.rs"]}
]}"#;

#[tokio::test]
async fn review_intent_runs_the_pipeline_to_completion() {
    let mut fx = fixture(
        vec![
            Turn::text(SINGLE_READ_PLAN),              // planner
            Turn::text("inspected the module; looks coherent"), // step 1
        ],
        false,
        false,
    );

    let outcome = fx.agent.handle("review the parser module").await.unwrap();
    match outcome {
        TurnOutcome::Completed { text, .. } => {
            assert!(text.contains("0 error(s)"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    // The plan was rendered to the user before execution.
    let lines = fx.output.lines.lock().unwrap();
    assert!(lines.iter().any(|l| l.contains("inspect the module")));
}

#[tokio::test]
async fn declined_plan_executes_nothing() {
    let mut fx = fixture(vec![Turn::text(SINGLE_READ_PLAN)], true, false);

    let outcome = fx.agent.handle("review the parser module").await.unwrap();
    assert_eq!(outcome, TurnOutcome::PlanRejected);

    // Only the planner consumed a scripted turn.
    assert_eq!(fx.client.requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn verification_errors_fail_the_pipeline() {
    let mut fx = fixture(
        vec![
            Turn::text(SINGLE_READ_PLAN),                // planner
            Turn::text("inspected the module"),          // step 1
            Turn::text(
                r#"{"issues": [
                    {"severity": "error", "message": "tests were deleted", "file": "tests/a.rs"},
                    {"severity": "warning", "message": "long function"}
                ]}"#,
            ), // reviewer (lint output forces a review call)
        ],
        false,
        true,
    );

    let outcome = fx.agent.handle("review the parser module").await.unwrap();
    assert_eq!(outcome, TurnOutcome::VerificationFailed { errors: 1 });

    let lines = fx.output.lines.lock().unwrap();
    assert!(lines.iter().any(|l| l.contains("tests were deleted")));
    assert!(lines.iter().any(|l| l.contains("verification failed")));
}

#[tokio::test]
async fn step_tool_calls_run_through_the_executor() {
    let plan = r#"{"steps": [
        {"id": 1, "description": "write the marker file", "kind": "code", "files": ["marker.txt"]}
    ]}"#;

    let mut fx = fixture(
        vec![
            Turn::text(plan), // planner
            Turn::call(
                "tc_1",
                "write_file",
                r#"{"path": "marker.txt", "content": "done"}"#,
            ), // step 1 asks for a tool
            Turn::text("wrote the marker file"), // step 1 concludes
            Turn::text(r#"{"issues": []}"#),     // reviewer sees the diff
        ],
        false,
        false,
    );
    fx.agent.policy().set_mode(PermissionMode::Auto);

    let outcome = fx.agent.handle("plan out the marker work").await.unwrap();
    assert!(matches!(outcome, TurnOutcome::Completed { .. }));
    assert_eq!(
        fs::read_to_string(fx.root.join("marker.txt")).unwrap(),
        "done"
    );

    // The pipeline's single checkpoint recorded the file it created, so
    // /rewind deletes it again.
    fx.agent.handle("/rewind").await.unwrap();
    assert!(!fx.root.join("marker.txt").exists());
}

#[tokio::test]
async fn invalid_plan_json_fails_planning() {
    let mut fx = fixture(vec![Turn::text("no json here")], false, false);
    let err = fx.agent.handle("review the parser module").await.unwrap_err();
    assert!(err.to_string().contains("planning failed"));
}

#[tokio::test]
async fn cyclic_plan_is_rejected_before_execution() {
    let cyclic = r#"{"steps": [
        {"id": 1, "description": "a", "kind": "read", "depends_on": [2]},
        {"id": 2, "description": "b", "kind": "code", "depends_on": [1]}
    ]}"#;
    let mut fx = fixture(vec![Turn::text(cyclic)], false, false);

    let err = fx.agent.handle("review the parser module").await.unwrap_err();
    assert!(err.to_string().contains("cycle"));
    // Nothing past the planner ran.
    assert_eq!(fx.client.requests.lock().unwrap().len(), 1);
}
