//! Configuration types for the document pipeline.
//!
//! Every decision knob (thresholds, attempt caps, model ids, prices,
//! timeouts) lives in [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`]. Nothing is read from ambient module-level
//! state: the binary maps flags and `TDV_*` environment variables onto the
//! builder, and tests construct configs directly.
//!
//! # Design choice: builder over constructor
//! Callers set only what they care about and rely on documented defaults for
//! the rest. `build()` validates cross-field constraints such as
//! `reject_floor <= confidence_threshold`.

use crate::error::TradeDocError;
use bigdecimal::num_bigint::BigInt;
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Absolute ceiling on extraction-phase model calls per document.
///
/// Enforced in the extractor regardless of configuration.
pub const HARD_MAX_EXTRACTION_ATTEMPTS: u32 = 2;

/// Which hosted model a call goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// Fast, inexpensive model used first for every document.
    Cheap,
    /// Slower, more accurate model used on escalation and retry.
    Capable,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Cheap => "cheap",
            ModelTier::Capable => "capable",
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Estimated price per call, per tier, in USD.
///
/// A flat per-call estimate (1 000 input / 200 output tokens) rather than a
/// token-metered bill: the audit trail must reconcile exactly, and provider
/// token counts are not always reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTable {
    pub cheap_per_call: BigDecimal,
    pub capable_per_call: BigDecimal,
}

impl PriceTable {
    /// Parse both prices from decimal strings, e.g. `"0.000500"`.
    pub fn from_strs(cheap: &str, capable: &str) -> Result<Self, TradeDocError> {
        let parse = |label: &str, s: &str| {
            BigDecimal::from_str(s.trim()).map_err(|e| {
                TradeDocError::InvalidConfig(format!("{label} price '{s}' is not a decimal: {e}"))
            })
        };
        Ok(Self {
            cheap_per_call: parse("cheap", cheap)?,
            capable_per_call: parse("capable", capable)?,
        })
    }

    pub fn price(&self, tier: ModelTier) -> &BigDecimal {
        match tier {
            ModelTier::Cheap => &self.cheap_per_call,
            ModelTier::Capable => &self.capable_per_call,
        }
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        Self {
            cheap_per_call: BigDecimal::new(BigInt::from(500), 6),
            capable_per_call: BigDecimal::new(BigInt::from(6000), 6),
        }
    }
}

/// Configuration for the routing / classification / extraction pipeline.
///
/// Built via [`PipelineConfig::builder()`] or using
/// [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use trade_doc_validator::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .confidence_threshold(0.85)
///     .reject_floor(0.4)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_extraction_attempts, 2);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// First-stage confidence at or above which no escalation happens. Default: 0.8.
    ///
    /// The comparison is `>=`: exactly 0.8 stays on the cheap tier.
    pub confidence_threshold: f64,

    /// Confidence below which a document is rejected outright. Default: 0.5.
    ///
    /// A rejected document costs one classification call and zero extraction
    /// calls. Set to 0.0 to disable the reject gate entirely.
    pub reject_floor: f64,

    /// Extraction attempts before accepting a degraded result. Default: 2.
    ///
    /// Validated into `1..=2`; the extractor also caps at
    /// [`HARD_MAX_EXTRACTION_ATTEMPTS`] on its own.
    pub max_extraction_attempts: u32,

    /// Model-reported extraction confidence below which the quality gate
    /// fails with `confidence_too_low`. Default: 0.3.
    pub min_extraction_confidence: f64,

    /// Escalate a confident `OTHER` classification as well. Default: false.
    pub escalate_on_ambiguous_type: bool,

    /// Model id used for the cheap tier.
    pub cheap_model_id: String,

    /// Model id used for the capable tier.
    pub capable_model_id: String,

    /// LLM provider name (e.g. "anthropic", "openai", "ollama").
    /// If None, detected from the environment.
    pub provider_name: Option<String>,

    /// Per-call price estimates used for the cost breakdown.
    pub price_table: PriceTable,

    /// Sampling temperature for classification calls. Default: 0.1.
    pub classification_temperature: f32,

    /// Sampling temperature for extraction calls. Default: 0.0.
    pub extraction_temperature: f32,

    /// Output-token cap for classification calls. Default: 1000.
    pub classification_max_tokens: usize,

    /// Output-token cap for extraction calls. Default: 2000.
    pub extraction_max_tokens: usize,

    /// Infrastructure retries on a transient model or storage failure. Default: 3.
    ///
    /// Separate from, and beneath, `max_extraction_attempts`.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    ///
    /// Doubles after each attempt: 500 ms → 1 s → 2 s.
    pub retry_backoff_ms: u64,

    /// Per model call timeout in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Per storage / queue call timeout in seconds. Default: 15.
    pub storage_timeout_secs: u64,

    /// PDF rasterisation resolution. Range: 72–400. Default: 144.
    pub dpi: u32,

    /// Long-edge cap for rendered pages in pixels. Default: 4000.
    pub max_rendered_pixels: u32,

    /// Record retention in days (result rows). Default: 90.
    pub record_retention_days: i64,

    /// Audit retention in days. Default: 365.
    pub audit_retention_days: i64,

    /// Bucket used for documents submitted inline rather than by reference.
    pub inline_bucket: String,

    /// Messages processed concurrently by the queue worker. Default: 4.
    pub worker_concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.8,
            reject_floor: 0.5,
            max_extraction_attempts: HARD_MAX_EXTRACTION_ATTEMPTS,
            min_extraction_confidence: 0.3,
            escalate_on_ambiguous_type: false,
            cheap_model_id: "claude-3-haiku-20240307".to_string(),
            capable_model_id: "claude-3-5-sonnet-20240620".to_string(),
            provider_name: None,
            price_table: PriceTable::default(),
            classification_temperature: 0.1,
            extraction_temperature: 0.0,
            classification_max_tokens: 1000,
            extraction_max_tokens: 2000,
            max_retries: 3,
            retry_backoff_ms: 500,
            api_timeout_secs: 60,
            storage_timeout_secs: 15,
            dpi: 144,
            max_rendered_pixels: 4000,
            record_retention_days: 90,
            audit_retention_days: 365,
            inline_bucket: "inline".to_string(),
            worker_concurrency: 4,
        }
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn model_id(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Cheap => &self.cheap_model_id,
            ModelTier::Capable => &self.capable_model_id,
        }
    }

    /// The extraction attempt budget after applying the hard cap.
    pub fn effective_extraction_attempts(&self) -> u32 {
        self.max_extraction_attempts.clamp(1, HARD_MAX_EXTRACTION_ATTEMPTS)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn confidence_threshold(mut self, t: f64) -> Self {
        self.config.confidence_threshold = t;
        self
    }

    pub fn reject_floor(mut self, f: f64) -> Self {
        self.config.reject_floor = f;
        self
    }

    pub fn max_extraction_attempts(mut self, n: u32) -> Self {
        self.config.max_extraction_attempts = n;
        self
    }

    pub fn min_extraction_confidence(mut self, c: f64) -> Self {
        self.config.min_extraction_confidence = c.clamp(0.0, 1.0);
        self
    }

    pub fn escalate_on_ambiguous_type(mut self, v: bool) -> Self {
        self.config.escalate_on_ambiguous_type = v;
        self
    }

    pub fn cheap_model_id(mut self, id: impl Into<String>) -> Self {
        self.config.cheap_model_id = id.into();
        self
    }

    pub fn capable_model_id(mut self, id: impl Into<String>) -> Self {
        self.config.capable_model_id = id.into();
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn price_table(mut self, prices: PriceTable) -> Self {
        self.config.price_table = prices;
        self
    }

    pub fn classification_temperature(mut self, t: f32) -> Self {
        self.config.classification_temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn extraction_temperature(mut self, t: f32) -> Self {
        self.config.extraction_temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn classification_max_tokens(mut self, n: usize) -> Self {
        self.config.classification_max_tokens = n;
        self
    }

    pub fn extraction_max_tokens(mut self, n: usize) -> Self {
        self.config.extraction_max_tokens = n;
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

    pub fn storage_timeout_secs(mut self, secs: u64) -> Self {
        self.config.storage_timeout_secs = secs.max(1);
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn record_retention_days(mut self, days: i64) -> Self {
        self.config.record_retention_days = days;
        self
    }

    pub fn audit_retention_days(mut self, days: i64) -> Self {
        self.config.audit_retention_days = days;
        self
    }

    pub fn inline_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.config.inline_bucket = bucket.into();
        self
    }

    pub fn worker_concurrency(mut self, n: usize) -> Self {
        self.config.worker_concurrency = n.max(1);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, TradeDocError> {
        let c = &self.config;
        if !(0.0..=1.0).contains(&c.confidence_threshold) {
            return Err(TradeDocError::InvalidConfig(format!(
                "confidence threshold must be 0.0–1.0, got {}",
                c.confidence_threshold
            )));
        }
        if !(0.0..=1.0).contains(&c.reject_floor) {
            return Err(TradeDocError::InvalidConfig(format!(
                "reject floor must be 0.0–1.0, got {}",
                c.reject_floor
            )));
        }
        if c.reject_floor > c.confidence_threshold {
            return Err(TradeDocError::InvalidConfig(format!(
                "reject floor {} exceeds confidence threshold {}",
                c.reject_floor, c.confidence_threshold
            )));
        }
        if c.max_extraction_attempts == 0
            || c.max_extraction_attempts > HARD_MAX_EXTRACTION_ATTEMPTS
        {
            return Err(TradeDocError::InvalidConfig(format!(
                "extraction attempts must be 1–{}, got {}",
                HARD_MAX_EXTRACTION_ATTEMPTS, c.max_extraction_attempts
            )));
        }
        if c.cheap_model_id.trim().is_empty() || c.capable_model_id.trim().is_empty() {
            return Err(TradeDocError::InvalidConfig(
                "model ids must not be empty".into(),
            ));
        }
        if c.record_retention_days <= 0 || c.audit_retention_days <= 0 {
            return Err(TradeDocError::InvalidConfig(
                "retention periods must be ≥ 1 day".into(),
            ));
        }
        Ok(self.config)
    }
}
