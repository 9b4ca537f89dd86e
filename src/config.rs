//! Configuration for a pipeline run.
//!
//! Every knob lives in [`PipelineConfig`], built via
//! [`PipelineConfigBuilder`]. One struct makes configs trivial to share
//! across concurrent document runs and to diff when two runs escalate
//! differently.
//!
//! The escalation thresholds and the confidence-boost formula are empirical
//! constants inherited from production tuning — there is no derivation to
//! verify, which is exactly why they are configuration rather than
//! hard-coded values.

use crate::error::PipelineError;
use crate::model::Tier;
use crate::progress::ProcessingProgress;
use crate::provider::{ResultStore, SuggestionProvider, ValidationProvider};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Configuration for document-field extraction.
///
/// Built via [`PipelineConfig::builder()`] or [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use docfields::PipelineConfig;
/// use docfields::Tier;
///
/// let config = PipelineConfig::builder()
///     .max_tier(Tier::Tier2)
///     .api_timeout_secs(20)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// A field is validated when its confidence is below this. Default: 0.7.
    pub confidence_threshold: f64,

    /// Critical fields (document number, SIRET, grand total) are validated
    /// below this stricter bar. Default: 0.85.
    pub critical_threshold: f64,

    /// Gate 1→2: escalate when Tier-1 overall confidence is below this or a
    /// required field is missing. Default: 0.85.
    pub tier1_escalation_threshold: f64,

    /// Gate 2→3: escalate when post-Tier-2 overall confidence is below this
    /// or a required field is still missing. Default: 0.90.
    pub tier2_escalation_threshold: f64,

    /// Confidence added to a validated field. Default: 0.3.
    pub validation_boost: f64,

    /// Ceiling for boosted confidences. Default: 0.95.
    pub confidence_cap: f64,

    /// Fixed confidence assigned to every Tier-3 field (treated as ground
    /// truth for the run). Default: 0.95.
    pub full_extraction_confidence: f64,

    /// Confidence for a previously-missing field supplied by Tier 2.
    /// Default: 0.85.
    pub supplied_field_confidence: f64,

    /// Tier at which the run enters the pipeline; gates below it are
    /// bypassed. Tier-2 entry still runs the free local extraction first
    /// (Tier 2 consumes its output); Tier-3 entry skips it entirely.
    /// Default: Tier1.
    pub entry_tier: Tier,

    /// Highest tier the run may reach — the cost-control knob. Default: Tier3.
    pub max_tier: Tier,

    /// Retry attempts per external call on transient failure. Default: 2.
    ///
    /// Exponential backoff doubles the delay each attempt, so 2 retries at
    /// the default base cost at most 1.5 s of waiting per group.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds. Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-external-call timeout in seconds; a timeout counts as that
    /// tier's failure. Default: 30.
    pub api_timeout_secs: u64,

    /// Maximum characters of surrounding text sent as context per field.
    /// Bounds request size regardless of document length. Default: 480.
    pub context_window_chars: usize,

    /// Estimated unit cost of one group validation call. Default: 0.002.
    pub cost_per_validation_call: f64,

    /// Estimated unit cost of one full re-extraction call. Default: 0.02.
    pub cost_per_full_extraction: f64,

    /// External validation/extraction service. Without one, escalation past
    /// Tier 1 is skipped (and recorded in the output's run-level notes).
    pub provider: Option<Arc<dyn ValidationProvider>>,

    /// Optional learned-hint source consulted while building validation
    /// requests.
    pub suggestions: Option<Arc<dyn SuggestionProvider>>,

    /// Optional persistence collaborator; receives the final output exactly
    /// once per run.
    pub store: Option<Arc<dyn ResultStore>>,

    /// Progress channel; events are dropped (never blocking) when the
    /// buffer is full or the receiver is gone.
    pub progress: Option<mpsc::Sender<ProcessingProgress>>,

    /// Cooperative cancellation, checked at tier boundaries.
    pub cancel: CancellationToken,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            critical_threshold: 0.85,
            tier1_escalation_threshold: 0.85,
            tier2_escalation_threshold: 0.90,
            validation_boost: 0.3,
            confidence_cap: 0.95,
            full_extraction_confidence: 0.95,
            supplied_field_confidence: 0.85,
            entry_tier: Tier::Tier1,
            max_tier: Tier::Tier3,
            max_retries: 2,
            retry_backoff_ms: 500,
            api_timeout_secs: 30,
            context_window_chars: 480,
            cost_per_validation_call: 0.002,
            cost_per_full_extraction: 0.02,
            provider: None,
            suggestions: None,
            store: None,
            progress: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("confidence_threshold", &self.confidence_threshold)
            .field("critical_threshold", &self.critical_threshold)
            .field("tier1_escalation_threshold", &self.tier1_escalation_threshold)
            .field("tier2_escalation_threshold", &self.tier2_escalation_threshold)
            .field("validation_boost", &self.validation_boost)
            .field("confidence_cap", &self.confidence_cap)
            .field("entry_tier", &self.entry_tier)
            .field("max_tier", &self.max_tier)
            .field("max_retries", &self.max_retries)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("context_window_chars", &self.context_window_chars)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn ValidationProvider>"))
            .field("suggestions", &self.suggestions.as_ref().map(|_| "<dyn SuggestionProvider>"))
            .field("store", &self.store.as_ref().map(|_| "<dyn ResultStore>"))
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn confidence_threshold(mut self, v: f64) -> Self {
        self.config.confidence_threshold = v;
        self
    }

    pub fn critical_threshold(mut self, v: f64) -> Self {
        self.config.critical_threshold = v;
        self
    }

    pub fn tier1_escalation_threshold(mut self, v: f64) -> Self {
        self.config.tier1_escalation_threshold = v;
        self
    }

    pub fn tier2_escalation_threshold(mut self, v: f64) -> Self {
        self.config.tier2_escalation_threshold = v;
        self
    }

    pub fn validation_boost(mut self, v: f64) -> Self {
        self.config.validation_boost = v;
        self
    }

    pub fn confidence_cap(mut self, v: f64) -> Self {
        self.config.confidence_cap = v;
        self
    }

    pub fn full_extraction_confidence(mut self, v: f64) -> Self {
        self.config.full_extraction_confidence = v;
        self
    }

    pub fn entry_tier(mut self, tier: Tier) -> Self {
        self.config.entry_tier = tier;
        self
    }

    pub fn max_tier(mut self, tier: Tier) -> Self {
        self.config.max_tier = tier;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs.max(1);
        self
    }

    pub fn context_window_chars(mut self, chars: usize) -> Self {
        self.config.context_window_chars = chars.max(32);
        self
    }

    pub fn cost_per_validation_call(mut self, cost: f64) -> Self {
        self.config.cost_per_validation_call = cost;
        self
    }

    pub fn cost_per_full_extraction(mut self, cost: f64) -> Self {
        self.config.cost_per_full_extraction = cost;
        self
    }

    pub fn provider(mut self, provider: Arc<dyn ValidationProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn suggestions(mut self, suggestions: Arc<dyn SuggestionProvider>) -> Self {
        self.config.suggestions = Some(suggestions);
        self
    }

    pub fn store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.config.store = Some(store);
        self
    }

    pub fn progress(mut self, tx: mpsc::Sender<ProcessingProgress>) -> Self {
        self.config.progress = Some(tx);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.config.cancel = token;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        for (name, v) in [
            ("confidence_threshold", c.confidence_threshold),
            ("critical_threshold", c.critical_threshold),
            ("tier1_escalation_threshold", c.tier1_escalation_threshold),
            ("tier2_escalation_threshold", c.tier2_escalation_threshold),
            ("confidence_cap", c.confidence_cap),
            ("full_extraction_confidence", c.full_extraction_confidence),
            ("supplied_field_confidence", c.supplied_field_confidence),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(PipelineError::InvalidConfig(format!(
                    "{name} must be in [0, 1], got {v}"
                )));
            }
        }
        if c.validation_boost < 0.0 {
            return Err(PipelineError::InvalidConfig(format!(
                "validation_boost must be ≥ 0, got {}",
                c.validation_boost
            )));
        }
        if c.entry_tier > c.max_tier {
            return Err(PipelineError::InvalidConfig(format!(
                "entry_tier ({}) exceeds max_tier ({})",
                c.entry_tier, c.max_tier
            )));
        }
        Ok(self.config)
    }
}
