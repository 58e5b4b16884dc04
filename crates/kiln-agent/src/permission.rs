//! Permission policy for tool execution.
//!
//! Each tool call is gated by the active [`PermissionMode`] and a per-tool
//! decision cache. When neither decides, the user is prompted through the
//! output contract and answered through the input contract; the policy is
//! oblivious to whether the UI is a line stream or a full-screen interface.

use std::sync::Arc;
use std::sync::Mutex;

use dashmap::DashMap;
use kiln_core::{InputSource, OutputSink, PermissionLevel};

// ---------------------------------------------------------------------------
// Modes and decisions
// ---------------------------------------------------------------------------

/// Global permission mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionMode {
    /// Reads are free; anything else prompts. The default.
    Ask,
    /// Everything is allowed without prompting.
    Auto,
    /// Everything prompts, reads included.
    Strict,
    /// Reads are allowed, everything else is denied outright.
    Analysis,
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ask => "ask",
            Self::Auto => "auto",
            Self::Strict => "strict",
            Self::Analysis => "analysis",
        };
        write!(f, "{s}")
    }
}

/// Cached per-tool verdict from an earlier prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    AlwaysAllow,
    NeverAllow,
    Unset,
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Mode plus decision cache plus the prompt plumbing.
pub struct PermissionPolicy {
    mode: Mutex<PermissionMode>,
    decisions: DashMap<String, PermissionDecision>,
    output: Arc<dyn OutputSink>,
    input: Arc<dyn InputSource>,
}

impl PermissionPolicy {
    /// Create a policy in the given mode.
    pub fn new(
        mode: PermissionMode,
        output: Arc<dyn OutputSink>,
        input: Arc<dyn InputSource>,
    ) -> Self {
        Self {
            mode: Mutex::new(mode),
            decisions: DashMap::new(),
            output,
            input,
        }
    }

    /// The active mode.
    pub fn mode(&self) -> PermissionMode {
        *self.mode.lock().expect("permission mutex poisoned")
    }

    /// Switch modes. The decision cache survives mode changes; `/clear` and
    /// session switches reset it via [`PermissionPolicy::clear_cache`].
    pub fn set_mode(&self, mode: PermissionMode) {
        let mut guard = self.mode.lock().expect("permission mutex poisoned");
        if *guard != mode {
            tracing::info!(from = %*guard, to = %mode, "permission mode changed");
            *guard = mode;
        }
    }

    /// The cached verdict for a tool.
    pub fn decision(&self, tool_name: &str) -> PermissionDecision {
        self.decisions
            .get(tool_name)
            .map(|entry| *entry.value())
            .unwrap_or(PermissionDecision::Unset)
    }

    /// Drop every cached decision.
    pub fn clear_cache(&self) {
        self.decisions.clear();
    }

    /// Decide whether a tool call may run.
    ///
    /// Decision procedure, first match wins:
    /// 1. Auto mode allows.
    /// 2. A cached per-tool decision applies.
    /// 3. Ask mode allows reads without prompting.
    /// 4. Analysis mode denies everything that is not a read.
    /// 5. Otherwise the user is prompted; unrecognized input is deny-once.
    pub fn check(&self, tool_name: &str, level: PermissionLevel, description: &str) -> bool {
        let mode = self.mode();

        if mode == PermissionMode::Auto {
            return true;
        }

        match self.decision(tool_name) {
            PermissionDecision::AlwaysAllow => return true,
            PermissionDecision::NeverAllow => {
                tracing::debug!(tool = tool_name, "denied by cached decision");
                return false;
            }
            PermissionDecision::Unset => {}
        }

        if mode == PermissionMode::Ask && level == PermissionLevel::Read {
            return true;
        }

        if mode == PermissionMode::Analysis {
            if level == PermissionLevel::Read {
                return true;
            }
            tracing::debug!(tool = tool_name, %level, "denied by analysis mode");
            return false;
        }

        self.prompt(tool_name, level, description)
    }

    /// Ask the user. Four answers are understood: allow once, deny once,
    /// always allow (cached), never allow (cached).
    fn prompt(&self, tool_name: &str, level: PermissionLevel, description: &str) -> bool {
        self.output.permission_prompt(tool_name, level, description);

        let answer = match self.input.read_line("[y]es / [n]o / [a]lways / n[e]ver > ") {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "permission prompt read failed; denying");
                return false;
            }
        };

        match answer.trim().to_lowercase().as_str() {
            "y" | "yes" => true,
            "a" | "always" => {
                self.decisions
                    .insert(tool_name.to_owned(), PermissionDecision::AlwaysAllow);
                true
            }
            "e" | "never" => {
                self.decisions
                    .insert(tool_name.to_owned(), PermissionDecision::NeverAllow);
                false
            }
            // Explicit "n"/"no" and anything unrecognized: deny this once.
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::NullOutput;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Mutex as StdMutex;

    /// Input source fed from a fixed script of answers.
    struct ScriptedInput {
        answers: StdMutex<VecDeque<&'static str>>,
    }

    impl ScriptedInput {
        fn new(answers: &[&'static str]) -> Arc<Self> {
            Arc::new(Self {
                answers: StdMutex::new(answers.iter().copied().collect()),
            })
        }
    }

    impl InputSource for ScriptedInput {
        fn read_line(&self, _prompt: &str) -> io::Result<String> {
            Ok(self
                .answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or("")
                .to_owned())
        }

        fn confirm(&self, _prompt: &str, default_yes: bool) -> io::Result<bool> {
            Ok(default_yes)
        }
    }

    fn policy(mode: PermissionMode, answers: &[&'static str]) -> PermissionPolicy {
        PermissionPolicy::new(mode, Arc::new(NullOutput), ScriptedInput::new(answers))
    }

    #[test]
    fn auto_mode_allows_everything() {
        let policy = policy(PermissionMode::Auto, &[]);
        assert!(policy.check("bash", PermissionLevel::Execute, "rm -rf"));
        assert!(policy.check("write_file", PermissionLevel::Write, "w"));
    }

    #[test]
    fn ask_mode_allows_reads_without_prompting() {
        let policy = policy(PermissionMode::Ask, &[]);
        // Empty scripted input would deny any prompt, so passing proves no
        // prompt happened.
        assert!(policy.check("read_file", PermissionLevel::Read, "r"));
    }

    #[test]
    fn ask_mode_prompts_for_writes() {
        let policy = policy(PermissionMode::Ask, &["y", "n"]);
        assert!(policy.check("write_file", PermissionLevel::Write, "w"));
        assert!(!policy.check("write_file", PermissionLevel::Write, "w"));
    }

    #[test]
    fn analysis_mode_denies_writes_without_prompting() {
        let policy = policy(PermissionMode::Analysis, &["y"]);
        assert!(policy.check("read_file", PermissionLevel::Read, "r"));
        assert!(!policy.check("write_file", PermissionLevel::Write, "w"));
        // The scripted "y" was never consumed.
        assert!(!policy.check("bash", PermissionLevel::Execute, "x"));
    }

    #[test]
    fn strict_mode_prompts_even_for_reads() {
        let policy = policy(PermissionMode::Strict, &["n"]);
        assert!(!policy.check("read_file", PermissionLevel::Read, "r"));
    }

    #[test]
    fn always_allow_is_cached() {
        let policy = policy(PermissionMode::Ask, &["a"]);
        assert!(policy.check("write_file", PermissionLevel::Write, "w"));
        assert_eq!(
            policy.decision("write_file"),
            PermissionDecision::AlwaysAllow
        );
        // No answers left; a prompt would deny. The cache answers instead.
        assert!(policy.check("write_file", PermissionLevel::Write, "w"));
        assert!(policy.check("write_file", PermissionLevel::Write, "w"));
    }

    #[test]
    fn never_allow_is_cached() {
        let policy = policy(PermissionMode::Ask, &["e", "y"]);
        assert!(!policy.check("bash", PermissionLevel::Execute, "x"));
        // The scripted "y" is never consulted; the cache denies first.
        assert!(!policy.check("bash", PermissionLevel::Execute, "x"));
    }

    #[test]
    fn unrecognized_answer_denies_once() {
        let policy = policy(PermissionMode::Ask, &["whatever", "y"]);
        assert!(!policy.check("write_file", PermissionLevel::Write, "w"));
        // Nothing was cached; the next prompt is answered afresh.
        assert!(policy.check("write_file", PermissionLevel::Write, "w"));
    }

    #[test]
    fn clear_cache_forgets_decisions() {
        let policy = policy(PermissionMode::Ask, &["a", "n"]);
        assert!(policy.check("write_file", PermissionLevel::Write, "w"));
        policy.clear_cache();
        assert_eq!(policy.decision("write_file"), PermissionDecision::Unset);
        assert!(!policy.check("write_file", PermissionLevel::Write, "w"));
    }

    #[test]
    fn mode_switch_keeps_cache() {
        let policy = policy(PermissionMode::Ask, &["e"]);
        assert!(!policy.check("bash", PermissionLevel::Execute, "x"));
        policy.set_mode(PermissionMode::Strict);
        assert_eq!(policy.decision("bash"), PermissionDecision::NeverAllow);
    }
}
