//! Runtime configuration.
//!
//! Every tunable the runtime honors lives here, with defaults matching the
//! documented behavior. Hosts may overlay values from a TOML file via
//! [`RuntimeConfig`]; anything absent keeps its default.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{AgentError, Result};

// ---------------------------------------------------------------------------
// Model tiers
// ---------------------------------------------------------------------------

/// Coarse LLM capability class selected by intent or the `/mode` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Cheapest model; classification and trivial queries.
    Fast,
    /// Day-to-day coding model.
    Smart,
    /// Most capable model; planning and review.
    Genius,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Fast => "fast",
            Self::Smart => "smart",
            Self::Genius => "genius",
        };
        write!(f, "{s}")
    }
}

/// Model name for each tier, so tier switches are pure data.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelTable {
    pub fast: String,
    pub smart: String,
    pub genius: String,
}

impl Default for ModelTable {
    fn default() -> Self {
        Self {
            fast: "qwen2.5-coder:7b".to_owned(),
            smart: "qwen2.5-coder:14b".to_owned(),
            genius: "qwen2.5-coder:32b".to_owned(),
        }
    }
}

impl ModelTable {
    /// Model name for a tier.
    pub fn model_for(&self, tier: Tier) -> &str {
        match tier {
            Tier::Fast => &self.fast,
            Tier::Smart => &self.smart,
            Tier::Genius => &self.genius,
        }
    }
}

// ---------------------------------------------------------------------------
// Component configs
// ---------------------------------------------------------------------------

/// ReAct loop tunables.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Maximum loop iterations per turn.
    pub max_iterations: u32,
    /// Committed checkpoint ring capacity.
    pub checkpoint_capacity: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            checkpoint_capacity: 10,
        }
    }
}

/// Tool executor tunables.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Tool output beyond this many bytes is truncated with a marker.
    pub max_output_bytes: usize,
    /// Worker pool size for parallel-eligible batches.
    pub parallel_workers: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: 50_000,
            parallel_workers: 4,
        }
    }
}

/// Context manager tunables.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Context window size in estimated tokens.
    pub context_window: usize,
    /// Usage ratio at which the UI is warned.
    pub warn_threshold: f64,
    /// Usage ratio at which auto-compaction triggers.
    pub compact_threshold: f64,
    /// Messages preserved verbatim at the tail during compaction.
    pub preserve_last: usize,
    /// Tail size while in analysis mode.
    pub preserve_last_analysis: usize,
    /// Whether compaction fires automatically at the threshold.
    pub auto_compact: bool,
    /// Flat per-message token overhead added by the estimator.
    pub per_message_overhead: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            context_window: 32_768,
            warn_threshold: 0.8,
            compact_threshold: 0.95,
            preserve_last: 4,
            preserve_last_analysis: 2,
            auto_compact: true,
            per_message_overhead: 8,
        }
    }
}

/// Result cache tunables.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Outputs at or above this many bytes are cached and summarized
    /// in-context.
    pub min_store_bytes: usize,
    /// Maximum live entries before LRU eviction.
    pub max_entries: usize,
    /// Entry time-to-live.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            min_store_bytes: 8_192,
            max_entries: 64,
            ttl: Duration::from_secs(180),
        }
    }
}

/// Circuit breaker tunables.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub max_failures: u32,
    /// Time the breaker stays open before admitting a probe.
    pub timeout: Duration,
    /// Consecutive half-open successes required to reclose.
    pub half_open_max: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            timeout: Duration::from_secs(30),
            half_open_max: 2,
        }
    }
}

/// Plan pipeline tunables.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Retry attempts per plan step beyond the first.
    pub step_retries: u32,
    /// Initial delay between step retries.
    pub initial_retry_delay: Duration,
    /// Multiplier applied to the delay after each retry.
    pub retry_backoff_factor: f64,
    /// Cap on the retry delay.
    pub max_retry_delay: Duration,
    /// Iteration cap for each step's mini loop.
    pub step_max_iterations: u32,
    /// Lint tool names to run during verification, if registered.
    pub lint_tools: Vec<String>,
    /// Test tool names to run during verification, if registered.
    pub test_tools: Vec<String>,
    /// Ask the user to confirm a generated plan before executing it.
    pub confirm_plan: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            step_retries: 2,
            initial_retry_delay: Duration::from_millis(500),
            retry_backoff_factor: 2.0,
            max_retry_delay: Duration::from_secs(10),
            step_max_iterations: 6,
            lint_tools: vec!["lint".to_owned()],
            test_tools: vec!["run_tests".to_owned()],
            confirm_plan: true,
        }
    }
}

/// Retrieval pre-pass tunables.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Hard deadline for the pre-pass.
    pub deadline: Duration,
    /// Queries below this many whitespace tokens are skipped.
    pub min_tokens: usize,
    /// Queries below this many bytes are skipped.
    pub min_len: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(3),
            min_tokens: 3,
            min_len: 12,
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregate config
// ---------------------------------------------------------------------------

/// Everything tunable about the runtime, with defaults for all of it.
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    pub models: ModelTable,
    pub agent_loop: LoopConfig,
    pub executor: ExecutorConfig,
    pub context: ContextConfig,
    pub cache: CacheConfig,
    pub breaker: BreakerConfig,
    pub pipeline: PipelineConfig,
    pub retrieval: RetrievalConfig,
}

// ---------------------------------------------------------------------------
// TOML overlay
// ---------------------------------------------------------------------------

/// The host-facing configuration file shape. Every field is optional; absent
/// values keep the built-in defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub models: Option<ModelTable>,
    pub max_iterations: Option<u32>,
    pub checkpoint_capacity: Option<usize>,
    pub max_output_bytes: Option<usize>,
    pub parallel_workers: Option<usize>,
    pub context_window: Option<usize>,
    pub warn_threshold: Option<f64>,
    pub compact_threshold: Option<f64>,
    pub preserve_last: Option<usize>,
    pub auto_compact: Option<bool>,
    pub cache_min_store_bytes: Option<usize>,
    pub cache_max_entries: Option<usize>,
    pub cache_ttl_secs: Option<u64>,
    pub breaker_max_failures: Option<u32>,
    pub breaker_timeout_secs: Option<u64>,
    pub breaker_half_open_max: Option<u32>,
    pub step_retries: Option<u32>,
    pub lint_tools: Option<Vec<String>>,
    pub test_tools: Option<Vec<String>>,
    pub confirm_plan: Option<bool>,
    /// Tool names the host disables on its registry before building the
    /// agent; the runtime itself never registers tools.
    pub disabled_tools: Option<Vec<String>>,
}

impl RuntimeConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| AgentError::Config { reason: e.to_string() })
    }

    /// Overlay this file's values onto the built-in defaults.
    pub fn into_agent_config(self) -> AgentConfig {
        let mut cfg = AgentConfig::default();

        if let Some(models) = self.models {
            cfg.models = models;
        }
        if let Some(v) = self.max_iterations {
            cfg.agent_loop.max_iterations = v;
        }
        if let Some(v) = self.checkpoint_capacity {
            cfg.agent_loop.checkpoint_capacity = v;
        }
        if let Some(v) = self.max_output_bytes {
            cfg.executor.max_output_bytes = v;
        }
        if let Some(v) = self.parallel_workers {
            cfg.executor.parallel_workers = v.max(1);
        }
        if let Some(v) = self.context_window {
            cfg.context.context_window = v;
        }
        if let Some(v) = self.warn_threshold {
            cfg.context.warn_threshold = v;
        }
        if let Some(v) = self.compact_threshold {
            cfg.context.compact_threshold = v;
        }
        if let Some(v) = self.preserve_last {
            cfg.context.preserve_last = v;
        }
        if let Some(v) = self.auto_compact {
            cfg.context.auto_compact = v;
        }
        if let Some(v) = self.cache_min_store_bytes {
            cfg.cache.min_store_bytes = v;
        }
        if let Some(v) = self.cache_max_entries {
            cfg.cache.max_entries = v.max(1);
        }
        if let Some(v) = self.cache_ttl_secs {
            cfg.cache.ttl = Duration::from_secs(v);
        }
        if let Some(v) = self.breaker_max_failures {
            cfg.breaker.max_failures = v.max(1);
        }
        if let Some(v) = self.breaker_timeout_secs {
            cfg.breaker.timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.breaker_half_open_max {
            cfg.breaker.half_open_max = v.max(1);
        }
        if let Some(v) = self.step_retries {
            cfg.pipeline.step_retries = v;
        }
        if let Some(v) = self.lint_tools {
            cfg.pipeline.lint_tools = v;
        }
        if let Some(v) = self.test_tools {
            cfg.pipeline.test_tools = v;
        }
        if let Some(v) = self.confirm_plan {
            cfg.pipeline.confirm_plan = v;
        }

        cfg
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
