//! Two-stage intent classification.
//!
//! Stage one is a keyword matcher over an [`aho_corasick`] automaton: strong
//! verbs map straight to an intent, long queries containing a planning verb
//! bias toward Plan, and multi-file hints upgrade Code to Plan. Only when
//! the keyword stage is ambiguous does stage two issue a one-shot LLM call
//! on the fast tier with a tightly constrained prompt. Unrecognized model
//! output falls back to Simple.

use std::sync::Arc;

use aho_corasick::{AhoCorasick, MatchKind};
use regex::Regex;

use crate::config::Tier;
use crate::llm::{ChatRequest, LlmClient};

use kiln_core::Message;

// ---------------------------------------------------------------------------
// Intents
// ---------------------------------------------------------------------------

/// What the user is asking for, at routing granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intent {
    /// Multi-step work that deserves a plan.
    Plan,
    /// A concrete code change.
    Code,
    /// Look over existing changes or code.
    Review,
    /// A question about the codebase.
    Question,
    /// Chasing a defect.
    Debug,
    /// Anything small enough for the fast tier.
    Simple,
}

impl Intent {
    /// The model tier this intent deserves.
    pub fn recommended_tier(self) -> Tier {
        match self {
            Self::Plan | Self::Review => Tier::Genius,
            Self::Code | Self::Debug => Tier::Smart,
            Self::Question | Self::Simple => Tier::Fast,
        }
    }

    fn parse(word: &str) -> Option<Self> {
        match word {
            "plan" => Some(Self::Plan),
            "code" => Some(Self::Code),
            "review" => Some(Self::Review),
            "question" => Some(Self::Question),
            "debug" => Some(Self::Debug),
            "simple" => Some(Self::Simple),
            _ => None,
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Plan => "plan",
            Self::Code => "code",
            Self::Review => "review",
            Self::Question => "question",
            Self::Debug => "debug",
            Self::Simple => "simple",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Keyword tables
// ---------------------------------------------------------------------------

/// (phrase, intent) pairs for the keyword stage. Matching is
/// case-insensitive and bounded at word edges.
const KEYWORDS: &[(&str, Intent)] = &[
    // Planning verbs.
    ("plan", Intent::Plan),
    ("design", Intent::Plan),
    ("architect", Intent::Plan),
    ("restructure", Intent::Plan),
    ("migrate", Intent::Plan),
    // Coding verbs.
    ("implement", Intent::Code),
    ("write", Intent::Code),
    ("add", Intent::Code),
    ("create", Intent::Code),
    ("fix", Intent::Code),
    ("refactor", Intent::Code),
    ("rename", Intent::Code),
    // Review verbs.
    ("review", Intent::Review),
    ("audit", Intent::Review),
    ("critique", Intent::Review),
    // Debugging markers.
    ("debug", Intent::Debug),
    ("diagnose", Intent::Debug),
    ("crash", Intent::Debug),
    ("stack trace", Intent::Debug),
    ("segfault", Intent::Debug),
    // Question words.
    ("what", Intent::Question),
    ("how", Intent::Question),
    ("where", Intent::Question),
    ("why", Intent::Question),
    ("explain", Intent::Question),
];

/// Queries longer than this with a planning verb skip straight to Plan.
const LONG_QUERY_BYTES: usize = 160;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Classifies user queries, optionally falling back to an LLM.
pub struct IntentRouter {
    automaton: AhoCorasick,
    file_hint: Regex,
    llm: Option<Arc<dyn LlmClient>>,
    fast_model: String,
}

impl IntentRouter {
    /// Build the router. With `llm = None` ambiguity resolves to Simple.
    pub fn new(llm: Option<Arc<dyn LlmClient>>, fast_model: impl Into<String>) -> Self {
        let automaton = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .match_kind(MatchKind::Standard)
            .build(KEYWORDS.iter().map(|(phrase, _)| *phrase))
            .expect("keyword table is a valid automaton");

        // Path-ish tokens ("src/foo.rs", "lib/bar.py") hint at multi-file
        // work.
        let file_hint = Regex::new(r"[\w./-]+\.(rs|go|py|ts|js|java|c|cpp|h|toml|md)\b")
            .expect("file hint regex is valid");

        Self {
            automaton,
            file_hint,
            llm,
            fast_model: fast_model.into(),
        }
    }

    /// Classify a query.
    pub async fn classify(&self, query: &str) -> Intent {
        if let Some(intent) = self.keyword_stage(query) {
            tracing::debug!(%intent, "intent resolved by keyword stage");
            return intent;
        }
        let intent = self.llm_stage(query).await;
        tracing::debug!(%intent, "intent resolved by llm stage");
        intent
    }

    /// Stage one: deterministic keyword rules. `None` means ambiguous.
    fn keyword_stage(&self, query: &str) -> Option<Intent> {
        let mut matched: Vec<Intent> = Vec::new();
        for hit in self.automaton.find_iter(query) {
            if !at_word_boundary(query, hit.start(), hit.end()) {
                continue;
            }
            let intent = KEYWORDS[hit.pattern().as_usize()].1;
            if !matched.contains(&intent) {
                matched.push(intent);
            }
        }

        let has_plan_verb = matched.contains(&Intent::Plan);
        let file_hints = self.file_hint.find_iter(query).count();

        // Long queries carrying a planning verb are Plan regardless of what
        // else matched.
        if has_plan_verb && query.len() > LONG_QUERY_BYTES {
            return Some(Intent::Plan);
        }

        // Multi-file coding work is upgraded to Plan.
        if matched.contains(&Intent::Code) && (file_hints >= 2 || query.contains("across")) {
            return Some(Intent::Plan);
        }

        match matched.as_slice() {
            [single] => Some(*single),
            [] if query.trim_end().ends_with('?') => Some(Intent::Question),
            _ => None,
        }
    }

    /// Stage two: one-shot fast-tier classification.
    async fn llm_stage(&self, query: &str) -> Intent {
        let Some(llm) = &self.llm else {
            return Intent::Simple;
        };

        let request = ChatRequest::new(vec![Message::user(query)])
            .with_system(
                "You classify queries for a codebase assistant. Reply with exactly one \
                 word from this list and nothing else: plan, code, review, question, \
                 debug, simple.",
            )
            .with_model(self.fast_model.clone());

        match llm.chat(&request).await {
            Ok(response) => {
                let word = response
                    .text
                    .split_whitespace()
                    .next()
                    .unwrap_or("")
                    .trim_matches(|c: char| !c.is_ascii_alphabetic())
                    .to_lowercase();
                Intent::parse(&word).unwrap_or(Intent::Simple)
            }
            Err(e) => {
                tracing::warn!(error = %e, "intent classification call failed");
                Intent::Simple
            }
        }
    }
}

/// Check that a match spans whole words so "what" never fires inside
/// "whatever".
fn at_word_boundary(text: &str, start: usize, end: usize) -> bool {
    let before_ok = start == 0
        || text[..start]
            .chars()
            .next_back()
            .is_some_and(|c| !c.is_alphanumeric());
    let after_ok = end == text.len()
        || text[end..].chars().next().is_some_and(|c| !c.is_alphanumeric());
    before_ok && after_ok
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
