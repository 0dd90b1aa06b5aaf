//! Data model shared by every pipeline stage.
//!
//! Records and audit entries are created once and never mutated after the
//! extractor reaches `Done`. Monetary values are [`BigDecimal`] throughout;
//! no binary float ever carries an amount or a cost.

use crate::config::ModelTier;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// ── Documents ────────────────────────────────────────────────────────────

/// Where a document lives. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub bucket: String,
    pub key: String,
    pub document_id: String,
    /// Set when this document was derived from another (a PDF page).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceDocument>,
}

impl DocumentRef {
    /// Reference with a deterministic id derived from the location.
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        let bucket = bucket.into();
        let key = key.into();
        let document_id = derive_document_id(&bucket, &key);
        Self {
            bucket,
            key,
            document_id,
            source: None,
        }
    }

    pub fn with_document_id(mut self, id: impl Into<String>) -> Self {
        self.document_id = id.into();
        self
    }

    pub fn with_source(mut self, source: SourceDocument) -> Self {
        self.source = Some(source);
        self
    }

    /// Lower-cased extension of the key's final path segment, if any.
    pub fn extension(&self) -> Option<String> {
        let name = self.key.rsplit('/').next().unwrap_or(&self.key);
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }

    pub fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }
}

/// `doc_` + the first 12 hex digits of UUIDv5(URL, `s3://bucket/key`).
///
/// The same object always maps to the same id, so a redelivered message
/// lands on the record that already exists.
pub fn derive_document_id(bucket: &str, key: &str) -> String {
    let name = format!("s3://{bucket}/{key}");
    let uuid = Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes());
    let hex = uuid.simple().to_string();
    format!("doc_{}", &hex[..12])
}

/// Provenance of a derived document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDocument {
    #[serde(rename = "type")]
    pub kind: String,
    pub original_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_document_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<u32>,
}

impl SourceDocument {
    pub fn pdf_page(original: &DocumentRef, page_number: u32, total_pages: u32) -> Self {
        Self {
            kind: "pdf_conversion".to_string(),
            original_key: original.key.clone(),
            original_document_id: Some(original.document_id.clone()),
            page_number: Some(page_number),
            total_pages: Some(total_pages),
        }
    }
}

/// What the hosted model is shown alongside the prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentPayload {
    /// Raster image bytes plus their MIME type.
    Image { data: Vec<u8>, mime: String },
    /// Decoded text (plain-text documents and trade messages).
    Text(String),
}

impl DocumentPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            DocumentPayload::Image { .. } => "image",
            DocumentPayload::Text(_) => "text",
        }
    }
}

// ── Classification ───────────────────────────────────────────────────────

/// Trade-finance document categories the classifier can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentType {
    LetterOfCredit,
    CommercialInvoice,
    BillOfLading,
    PackingList,
    Certificate,
    Other,
}

impl DocumentType {
    pub const ALL: [DocumentType; 6] = [
        DocumentType::LetterOfCredit,
        DocumentType::CommercialInvoice,
        DocumentType::BillOfLading,
        DocumentType::PackingList,
        DocumentType::Certificate,
        DocumentType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::LetterOfCredit => "LETTER_OF_CREDIT",
            DocumentType::CommercialInvoice => "COMMERCIAL_INVOICE",
            DocumentType::BillOfLading => "BILL_OF_LADING",
            DocumentType::PackingList => "PACKING_LIST",
            DocumentType::Certificate => "CERTIFICATE",
            DocumentType::Other => "OTHER",
        }
    }

    /// Map a model-supplied label onto a known type; anything else is `Other`.
    ///
    /// Accepts case and separator variations ("letter of credit",
    /// "Bill-of-Lading") and the common abbreviations.
    pub fn from_label(label: &str) -> Self {
        let norm: String = label
            .trim()
            .chars()
            .map(|c| match c {
                ' ' | '-' | '/' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        match norm.as_str() {
            "LETTER_OF_CREDIT" | "LC" | "L_C" | "DOCUMENTARY_CREDIT" => {
                DocumentType::LetterOfCredit
            }
            "COMMERCIAL_INVOICE" | "INVOICE" => DocumentType::CommercialInvoice,
            "BILL_OF_LADING" | "BL" | "B_L" | "BOL" => DocumentType::BillOfLading,
            "PACKING_LIST" => DocumentType::PackingList,
            "CERTIFICATE" | "CERTIFICATE_OF_ORIGIN" | "INSURANCE_CERTIFICATE" => {
                DocumentType::Certificate
            }
            _ => DocumentType::Other,
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of one classification call. Escalation supersedes, never merges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub document_type: DocumentType,
    /// Always within `[0, 1]`; 0.0 when the response could not be parsed.
    pub confidence: f64,
    pub reasoning: String,
    pub tier: ModelTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_indicators: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternative_types: Vec<String>,
    /// True when the safe default was substituted for an unparseable reply.
    #[serde(default)]
    pub malformed: bool,
}

impl ClassificationResult {
    /// The safe default for an unparseable reply: confidence 0.0, type `OTHER`.
    pub fn malformed(tier: ModelTier, raw: &str) -> Self {
        let preview: String = raw.chars().take(120).collect();
        Self {
            document_type: DocumentType::Other,
            confidence: 0.0,
            reasoning: format!("unparseable classification response: {preview}"),
            tier,
            complexity_score: None,
            key_indicators: Vec::new(),
            alternative_types: Vec::new(),
            malformed: true,
        }
    }
}

// ── Extraction ───────────────────────────────────────────────────────────

/// A monetary value split into an exact decimal amount and a currency code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonetaryAmount {
    pub amount: BigDecimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

/// One extracted field value after normalisation.
///
/// Non-monetary numbers that are not integers keep their literal text so no
/// value ever passes through `f64`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Amount(MonetaryAmount),
    Integer(i64),
    Text(String),
    List(Vec<FieldValue>),
    Object(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    /// Whether the value carries real content for the quality gate.
    pub fn is_present(&self) -> bool {
        match self {
            FieldValue::Null => false,
            FieldValue::Text(s) => {
                let t = s.trim();
                !t.is_empty()
                    && !t.eq_ignore_ascii_case("null")
                    && !t.eq_ignore_ascii_case("n/a")
                    && !t.eq_ignore_ascii_case("none")
            }
            FieldValue::List(items) => items.iter().any(FieldValue::is_present),
            FieldValue::Object(map) => map.values().any(FieldValue::is_present),
            FieldValue::Bool(_) | FieldValue::Amount(_) | FieldValue::Integer(_) => true,
        }
    }

    pub fn as_amount(&self) -> Option<&MonetaryAmount> {
        match self {
            FieldValue::Amount(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Output of one extraction attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub notes: String,
    pub tier: ModelTier,
    #[serde(default)]
    pub malformed: bool,
}

impl ExtractionResult {
    /// An attempt that produced nothing usable.
    pub fn empty(tier: ModelTier, notes: impl Into<String>) -> Self {
        Self {
            fields: BTreeMap::new(),
            confidence: None,
            notes: notes.into(),
            tier,
            malformed: true,
        }
    }
}

// ── Records and audit ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Quality {
    Complete,
    Degraded,
}

/// How processing of a document ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalState {
    Extracted,
    ExtractedDegraded,
    Rejected,
    Unreadable,
}

impl TerminalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalState::Extracted => "EXTRACTED",
            TerminalState::ExtractedDegraded => "EXTRACTED_DEGRADED",
            TerminalState::Rejected => "REJECTED",
            TerminalState::Unreadable => "UNREADABLE",
        }
    }
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision point an audit row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStage {
    Routing,
    /// A PDF split into page documents; one row per page.
    Conversion,
    Classification,
    EscalationDecision,
    Extraction,
    Retry,
    Outcome,
}

impl AuditStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStage::Routing => "routing",
            AuditStage::Conversion => "conversion",
            AuditStage::Classification => "classification",
            AuditStage::EscalationDecision => "escalation_decision",
            AuditStage::Extraction => "extraction",
            AuditStage::Retry => "retry",
            AuditStage::Outcome => "outcome",
        }
    }
}

/// One append-only row of the audit trail, keyed by (document id, sequence).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub document_id: String,
    pub sequence: u32,
    pub stage: AuditStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<ModelTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Estimated cost of the model call this row records; zero otherwise.
    pub cost: BigDecimal,
    pub outcome: String,
    #[serde(default)]
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Cost of one model call, mirrored by an audit row with the same sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptCost {
    pub sequence: u32,
    pub stage: AuditStage,
    pub tier: ModelTier,
    pub cost: BigDecimal,
}

/// Per-stage and total cost estimate of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub classification: BigDecimal,
    pub extraction: BigDecimal,
    pub total: BigDecimal,
    pub per_call: Vec<AttemptCost>,
    pub note: String,
}

impl CostBreakdown {
    pub fn from_calls(per_call: Vec<AttemptCost>, escalated: bool) -> Self {
        let zero = BigDecimal::from(0);
        let mut classification = zero.clone();
        let mut extraction = zero;
        for call in &per_call {
            match call.stage {
                AuditStage::Classification => classification += &call.cost,
                _ => extraction += &call.cost,
            }
        }
        let total = &classification + &extraction;
        let note = if per_call.is_empty() {
            "no model calls".to_string()
        } else if escalated || per_call.iter().any(|c| c.tier == ModelTier::Capable) {
            "escalated for accuracy".to_string()
        } else {
            "used cheap model".to_string()
        };
        Self {
            classification,
            extraction,
            total,
            per_call,
            note,
        }
    }
}

/// The terminal result of processing one document. Written once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub document_id: String,
    pub bucket: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceDocument>,
    pub state: TerminalState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<Quality>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<ClassificationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction: Option<ExtractionResult>,
    /// Extraction-phase attempts made; never above 2.
    pub attempt_count: u32,
    pub escalated: bool,
    /// Confidence of the cheap-tier classification; absent when no model
    /// was called.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_stage_confidence: Option<f64>,
    pub costs: CostBreakdown,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quality_issues: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_quality_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn document_id_is_deterministic() {
        let a = derive_document_id("trade-docs", "inbox/lc.png");
        let b = derive_document_id("trade-docs", "inbox/lc.png");
        let c = derive_document_id("trade-docs", "inbox/lc2.png");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("doc_"));
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn extension_is_lowercased_last_segment() {
        assert_eq!(DocumentRef::new("b", "x/Scan.PDF").extension().as_deref(), Some("pdf"));
        assert_eq!(DocumentRef::new("b", "a.b/c.tar.gz").extension().as_deref(), Some("gz"));
        assert_eq!(DocumentRef::new("b", "dir.d/README").extension(), None);
        assert_eq!(DocumentRef::new("b", ".hidden").extension(), None);
        assert_eq!(DocumentRef::new("b", "trailing.").extension(), None);
    }

    #[test]
    fn document_type_labels() {
        assert_eq!(DocumentType::from_label("LETTER_OF_CREDIT"), DocumentType::LetterOfCredit);
        assert_eq!(DocumentType::from_label("letter of credit"), DocumentType::LetterOfCredit);
        assert_eq!(DocumentType::from_label("Bill-of-Lading"), DocumentType::BillOfLading);
        assert_eq!(DocumentType::from_label("recipe"), DocumentType::Other);
        for t in DocumentType::ALL {
            assert_eq!(DocumentType::from_label(t.as_str()), t);
        }
    }

    #[test]
    fn field_value_presence() {
        assert!(!FieldValue::Null.is_present());
        assert!(!FieldValue::Text("  ".into()).is_present());
        assert!(!FieldValue::Text("N/A".into()).is_present());
        assert!(FieldValue::Text("LC123".into()).is_present());
        assert!(!FieldValue::List(vec![FieldValue::Null]).is_present());
        assert!(FieldValue::Integer(0).is_present());
    }

    #[test]
    fn amount_field_keeps_decimal_through_json() {
        let v = FieldValue::Amount(MonetaryAmount {
            amount: BigDecimal::from_str("150000.00").unwrap(),
            currency: Some("EUR".into()),
        });
        let json = serde_json::to_string(&v).unwrap();
        assert!(json.contains("\"150000.00\""), "got: {json}");
        let back: FieldValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn untagged_text_does_not_become_amount() {
        let back: FieldValue = serde_json::from_str("\"LC-2024-001\"").unwrap();
        assert_eq!(back, FieldValue::Text("LC-2024-001".into()));
        let obj: FieldValue =
            serde_json::from_str(r#"{"name":"ACME","address":"Rotterdam"}"#).unwrap();
        assert!(matches!(obj, FieldValue::Object(_)));
    }

    #[test]
    fn cost_breakdown_splits_stages() {
        let cheap = BigDecimal::from_str("0.000500").unwrap();
        let capable = BigDecimal::from_str("0.006000").unwrap();
        let call = |sequence, stage, tier, cost: &BigDecimal| AttemptCost {
            sequence,
            stage,
            tier,
            cost: cost.clone(),
        };
        let calls = vec![
            call(1, AuditStage::Classification, ModelTier::Cheap, &cheap),
            call(3, AuditStage::Extraction, ModelTier::Cheap, &cheap),
            call(5, AuditStage::Extraction, ModelTier::Capable, &capable),
        ];
        let b = CostBreakdown::from_calls(calls, false);
        assert_eq!(b.classification, cheap);
        assert_eq!(b.total, BigDecimal::from_str("0.007").unwrap());
        assert_eq!(b.note, "escalated for accuracy");
    }
}
