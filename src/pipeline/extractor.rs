//! The two-stage extractor: classify cheaply, escalate when unsure, extract,
//! gate, retry once.
//!
//! ```text
//!              c ≥ threshold
//! Classifying ───────────────────────────▶ Extracting(cheap) ──┐
//!   (cheap)  │ floor ≤ c < threshold                           │ gate fails, attempt 1
//!            ├──────────▶ Escalating ───▶ Extracting(capable) ◀┘
//!            │ c < floor   (capable)                │
//!            ▼                                      ▼
//!       Done(REJECTED)               Done(EXTRACTED | EXTRACTED_DEGRADED)
//! ```
//!
//! ## Invariants
//!
//! * At most one escalation per document, and only from the first stage.
//! * Extraction-phase model calls never exceed
//!   [`HARD_MAX_EXTRACTION_ATTEMPTS`](crate::config::HARD_MAX_EXTRACTION_ATTEMPTS),
//!   whatever the replies look like.
//! * Every model call is charged exactly once, in the audit row that
//!   records it, so the cost total always equals the sum of audit costs.
//! * Nothing is persisted here; the caller commits the finished
//!   [`ProcessingContext`] in one transaction.

use crate::config::{ModelTier, PipelineConfig, PriceTable};
use crate::error::TradeDocError;
use crate::pipeline::model::{ModelRequest, VisionModel};
use crate::pipeline::normalize::normalize_fields;
use crate::pipeline::parse::{
    classification_result, parse_classification, parse_extraction, ParsedResponse, RawExtraction,
};
use crate::pipeline::quality::{assess, QualityReport};
use crate::prompts::{extraction_prompt, CLASSIFIER_PROMPT};
use crate::types::{
    AttemptCost, AuditEntry, AuditStage, ClassificationResult, CostBreakdown, DocumentPayload,
    DocumentRef, DocumentType, ExtractionResult, ProcessingRecord, Quality, TerminalState,
};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

/// What to do after the first-stage classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Confident enough: extract on the cheap tier.
    Extract,
    /// Re-classify once on the capable tier.
    Escalate,
    /// Below the reject floor: stop without extracting.
    Reject,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Extract => "extract_on_cheap",
            Decision::Escalate => "escalate",
            Decision::Reject => "reject",
        }
    }
}

/// Escalation rule for a first-stage result.
///
/// `c >= threshold` never escalates (unless the ambiguous-type extension is
/// on and the type is `OTHER`); `floor <= c < threshold` escalates;
/// `c < floor` rejects.
pub fn decide(config: &PipelineConfig, classification: &ClassificationResult) -> Decision {
    let c = classification.confidence;
    if c < config.reject_floor {
        Decision::Reject
    } else if c < config.confidence_threshold {
        Decision::Escalate
    } else if config.escalate_on_ambiguous_type
        && classification.document_type == DocumentType::Other
    {
        Decision::Escalate
    } else {
        Decision::Extract
    }
}

// ── Per-document context ─────────────────────────────────────────────────

/// Everything accumulated while one document moves through the states.
///
/// Owned by a single invocation; documents never share one.
#[derive(Debug)]
pub struct ProcessingContext {
    pub document: DocumentRef,
    pub started_at: DateTime<Utc>,
    /// Extraction-phase attempts made so far.
    pub extraction_attempts: u32,
    pub escalated: bool,
    /// Cheap-tier confidence, the value the escalation decision was made on.
    pub first_stage_confidence: Option<f64>,
    pub image_quality_score: Option<f64>,
    prices: PriceTable,
    audit: Vec<AuditEntry>,
    calls: Vec<AttemptCost>,
    record_retention: Duration,
    audit_retention: Duration,
}

impl ProcessingContext {
    pub fn new(document: DocumentRef, config: &PipelineConfig) -> Self {
        Self {
            document,
            started_at: Utc::now(),
            extraction_attempts: 0,
            escalated: false,
            first_stage_confidence: None,
            image_quality_score: None,
            prices: config.price_table.clone(),
            audit: Vec::new(),
            calls: Vec::new(),
            record_retention: Duration::days(config.record_retention_days),
            audit_retention: Duration::days(config.audit_retention_days),
        }
    }

    pub fn audit(&self) -> &[AuditEntry] {
        &self.audit
    }

    pub fn model_calls(&self) -> usize {
        self.calls.len()
    }

    /// Append a decision row that made no model call.
    pub fn note(&mut self, stage: AuditStage, outcome: &str, detail: impl Into<String>) -> u32 {
        self.push(stage, None, None, None, BigDecimal::from(0), outcome, detail.into())
    }

    /// Append a row for a model call and charge its tier's price.
    pub fn charge(
        &mut self,
        stage: AuditStage,
        tier: ModelTier,
        model_id: String,
        confidence: Option<f64>,
        outcome: &str,
        detail: impl Into<String>,
    ) -> u32 {
        let cost = self.prices.price(tier).clone();
        let sequence = self.push(
            stage,
            Some(tier),
            Some(model_id),
            confidence,
            cost.clone(),
            outcome,
            detail.into(),
        );
        self.calls.push(AttemptCost {
            sequence,
            stage,
            tier,
            cost,
        });
        sequence
    }

    #[allow(clippy::too_many_arguments)]
    fn push(
        &mut self,
        stage: AuditStage,
        tier: Option<ModelTier>,
        model_id: Option<String>,
        confidence: Option<f64>,
        cost: BigDecimal,
        outcome: &str,
        detail: String,
    ) -> u32 {
        let sequence = self.audit.len() as u32 + 1;
        let recorded_at = Utc::now();
        self.audit.push(AuditEntry {
            document_id: self.document.document_id.clone(),
            sequence,
            stage,
            tier,
            model_id,
            confidence,
            cost,
            outcome: outcome.to_string(),
            detail,
            recorded_at,
            expires_at: recorded_at + self.audit_retention,
        });
        sequence
    }

    /// Close the trail with an outcome row and build the terminal record.
    pub fn finish(mut self, outcome: Outcome) -> (ProcessingRecord, Vec<AuditEntry>) {
        let detail = outcome
            .detail
            .clone()
            .unwrap_or_else(|| outcome.issues.join("; "));
        self.note(AuditStage::Outcome, outcome.state.as_str(), detail);

        let completed_at = Utc::now();
        let costs = CostBreakdown::from_calls(self.calls, self.escalated);
        info!(
            "{}: {} after {} extraction attempt(s), escalated={}, cost={}",
            self.document.document_id,
            outcome.state,
            self.extraction_attempts,
            self.escalated,
            costs.total
        );
        let record = ProcessingRecord {
            document_id: self.document.document_id,
            bucket: self.document.bucket,
            key: self.document.key,
            source: self.document.source,
            state: outcome.state,
            quality: outcome.quality,
            classification: outcome.classification,
            extraction: outcome.extraction,
            attempt_count: self.extraction_attempts,
            escalated: self.escalated,
            first_stage_confidence: self.first_stage_confidence,
            costs,
            quality_issues: outcome.issues,
            image_quality_score: self.image_quality_score,
            detail: outcome.detail,
            started_at: self.started_at,
            completed_at,
            expires_at: completed_at + self.record_retention,
        };
        (record, self.audit)
    }
}

/// How a document's processing ended, before it is turned into a record.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub state: TerminalState,
    pub quality: Option<Quality>,
    pub classification: Option<ClassificationResult>,
    pub extraction: Option<ExtractionResult>,
    pub issues: Vec<String>,
    pub detail: Option<String>,
}

impl Outcome {
    pub fn extracted(classification: ClassificationResult, extraction: ExtractionResult) -> Self {
        Self {
            state: TerminalState::Extracted,
            quality: Some(Quality::Complete),
            classification: Some(classification),
            extraction: Some(extraction),
            issues: Vec::new(),
            detail: None,
        }
    }

    pub fn degraded(
        classification: ClassificationResult,
        extraction: ExtractionResult,
        issues: Vec<String>,
    ) -> Self {
        Self {
            state: TerminalState::ExtractedDegraded,
            quality: Some(Quality::Degraded),
            classification: Some(classification),
            extraction: Some(extraction),
            issues,
            detail: None,
        }
    }

    pub fn rejected(
        classification: Option<ClassificationResult>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            state: TerminalState::Rejected,
            quality: None,
            classification,
            extraction: None,
            issues: Vec::new(),
            detail: Some(reason.into()),
        }
    }

    pub fn unreadable(reason: impl Into<String>) -> Self {
        Self {
            state: TerminalState::Unreadable,
            quality: None,
            classification: None,
            extraction: None,
            issues: Vec::new(),
            detail: Some(reason.into()),
        }
    }
}

// ── State machine ────────────────────────────────────────────────────────

#[derive(Debug)]
enum State {
    Classifying,
    Escalating,
    Extracting {
        classification: ClassificationResult,
        tier: ModelTier,
    },
    Done(Box<Outcome>),
}

/// Drives one document from `Classifying` to `Done`.
pub struct TwoStageExtractor<'a> {
    model: &'a dyn VisionModel,
    config: &'a PipelineConfig,
}

impl<'a> TwoStageExtractor<'a> {
    pub fn new(model: &'a dyn VisionModel, config: &'a PipelineConfig) -> Self {
        Self { model, config }
    }

    /// Run the state machine to completion.
    ///
    /// Fails only when a classification call cannot reach the model at all;
    /// in that case nothing has been written and the message can be
    /// redelivered. Extraction-call failures count as failed attempts.
    pub async fn run(
        &self,
        ctx: &mut ProcessingContext,
        payload: &DocumentPayload,
    ) -> Result<Outcome, TradeDocError> {
        let mut state = State::Classifying;
        loop {
            state = match state {
                State::Classifying => {
                    let first = self.classify(ctx, payload, ModelTier::Cheap).await?;
                    ctx.first_stage_confidence = Some(first.confidence);
                    let decision = decide(self.config, &first);
                    ctx.note(
                        AuditStage::EscalationDecision,
                        decision.as_str(),
                        format!(
                            "confidence {:.3} vs threshold {:.3}, floor {:.3}",
                            first.confidence,
                            self.config.confidence_threshold,
                            self.config.reject_floor
                        ),
                    );
                    info!(
                        "{}: classified {} ({:.2}) on cheap tier → {}",
                        ctx.document.document_id,
                        first.document_type,
                        first.confidence,
                        decision.as_str()
                    );
                    match decision {
                        Decision::Extract => State::Extracting {
                            classification: first,
                            tier: ModelTier::Cheap,
                        },
                        Decision::Escalate => {
                            ctx.escalated = true;
                            State::Escalating
                        }
                        Decision::Reject => {
                            let reason = format!(
                                "classification confidence {:.3} below reject floor {:.3}",
                                first.confidence, self.config.reject_floor
                            );
                            State::Done(Box::new(Outcome::rejected(Some(first), reason)))
                        }
                    }
                }
                State::Escalating => {
                    let second = self.classify(ctx, payload, ModelTier::Capable).await?;
                    info!(
                        "{}: re-classified {} ({:.2}) on capable tier",
                        ctx.document.document_id, second.document_type, second.confidence
                    );
                    State::Extracting {
                        classification: second,
                        tier: ModelTier::Capable,
                    }
                }
                State::Extracting {
                    classification,
                    tier,
                } => State::Done(Box::new(self.extract(ctx, payload, classification, tier).await)),
                State::Done(outcome) => return Ok(*outcome),
            };
        }
    }

    async fn classify(
        &self,
        ctx: &mut ProcessingContext,
        payload: &DocumentPayload,
        tier: ModelTier,
    ) -> Result<ClassificationResult, TradeDocError> {
        let request = ModelRequest {
            tier,
            prompt: CLASSIFIER_PROMPT,
            payload,
            max_tokens: self.config.classification_max_tokens,
            temperature: self.config.classification_temperature,
        };
        let reply = self.model.invoke(&request).await.map_err(|source| {
            TradeDocError::ModelUnavailable {
                document_id: ctx.document.document_id.clone(),
                source,
            }
        })?;

        let parsed = parse_classification(&reply.text);
        let malformed = !parsed.is_valid();
        let result = classification_result(parsed, tier);
        if malformed {
            warn!(
                "{}: unparseable classification from {} tier, using confidence 0.0 / OTHER",
                ctx.document.document_id, tier
            );
        }
        let outcome = if malformed {
            "malformed_response"
        } else {
            result.document_type.as_str()
        };
        ctx.charge(
            AuditStage::Classification,
            tier,
            reply.model_id,
            Some(result.confidence),
            outcome,
            result.reasoning.clone(),
        );
        Ok(result)
    }

    async fn extract(
        &self,
        ctx: &mut ProcessingContext,
        payload: &DocumentPayload,
        classification: ClassificationResult,
        first_tier: ModelTier,
    ) -> Outcome {
        let max_attempts = self.config.effective_extraction_attempts();
        let document_type = classification.document_type;
        let prompt = extraction_prompt(document_type);
        let mut tier = first_tier;
        let mut best: Option<(ExtractionResult, QualityReport)> = None;

        for attempt in 1..=max_attempts {
            ctx.extraction_attempts = attempt;
            let request = ModelRequest {
                tier,
                prompt,
                payload,
                max_tokens: self.config.extraction_max_tokens,
                temperature: self.config.extraction_temperature,
            };

            let (extraction, report) = match self.model.invoke(&request).await {
                Ok(reply) => {
                    let extraction = extraction_result(parse_extraction(&reply.text), tier);
                    let report =
                        assess(document_type, &extraction, self.config.min_extraction_confidence);
                    let verdict = if report.passed { "complete" } else { "incomplete" };
                    ctx.charge(
                        AuditStage::Extraction,
                        tier,
                        reply.model_id,
                        extraction.confidence,
                        verdict,
                        report.issue_labels().join("; "),
                    );
                    (extraction, report)
                }
                Err(e) => {
                    warn!(
                        "{}: extraction attempt {} failed: {}",
                        ctx.document.document_id, attempt, e
                    );
                    ctx.charge(
                        AuditStage::Extraction,
                        tier,
                        self.model.model_id(tier),
                        None,
                        "call_failed",
                        e.to_string(),
                    );
                    (
                        ExtractionResult::empty(tier, e.to_string()),
                        QualityReport::call_failed(e.to_string()),
                    )
                }
            };

            debug!(
                "{}: attempt {} on {} tier, gate passed={}, score={:.2}",
                ctx.document.document_id, attempt, tier, report.passed, report.score
            );
            if report.passed {
                return Outcome::extracted(classification, extraction);
            }

            if best.as_ref().is_none_or(|(_, b)| report.score >= b.score) {
                best = Some((extraction, report));
            }

            if attempt < max_attempts {
                let labels = best
                    .as_ref()
                    .map(|(_, r)| r.issue_labels().join("; "))
                    .unwrap_or_default();
                ctx.note(
                    AuditStage::Retry,
                    "retry_on_capable",
                    format!("attempt {attempt} failed quality gate: {labels}"),
                );
                info!(
                    "{}: attempt {} incomplete, retrying on capable tier",
                    ctx.document.document_id, attempt
                );
                tier = ModelTier::Capable;
            }
        }

        match best {
            Some((extraction, report)) => {
                warn!(
                    "{}: accepting degraded extraction after {} attempts",
                    ctx.document.document_id, max_attempts
                );
                Outcome::degraded(classification, extraction, report.issue_labels())
            }
            None => Outcome::degraded(
                classification,
                ExtractionResult::empty(tier, "no attempt completed"),
                vec!["no_fields_extracted".to_string()],
            ),
        }
    }
}

fn extraction_result(parsed: ParsedResponse<RawExtraction>, tier: ModelTier) -> ExtractionResult {
    match parsed {
        ParsedResponse::Valid(raw) => ExtractionResult {
            fields: normalize_fields(&raw.fields),
            confidence: raw.confidence,
            notes: raw.notes,
            tier,
            malformed: false,
        },
        ParsedResponse::Malformed(raw) => {
            let preview: String = raw.chars().take(120).collect();
            ExtractionResult::empty(tier, format!("unparseable extraction response: {preview}"))
        }
    }
}
