//! Quality gate for extraction attempts.
//!
//! An attempt passes when every critical field of its document type is
//! present and non-empty, at least one field was extracted at all, and the
//! model did not report a confidence below the configured minimum. Types
//! without a specialised prompt have no critical list; for those only the
//! "something was extracted" rule applies.

use crate::types::{DocumentType, ExtractionResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fields that must be present for an extraction to count as complete.
pub fn critical_fields(document_type: DocumentType) -> &'static [&'static str] {
    match document_type {
        DocumentType::LetterOfCredit => &[
            "lc_number",
            "applicant",
            "beneficiary",
            "credit_amount",
            "expiry_date",
        ],
        DocumentType::CommercialInvoice => &["invoice_number", "seller", "buyer", "total_amount"],
        DocumentType::BillOfLading => &[
            "bill_of_lading_number",
            "shipper",
            "consignee",
            "port_of_loading",
            "port_of_discharge",
        ],
        DocumentType::PackingList | DocumentType::Certificate | DocumentType::Other => &[],
    }
}

/// One reason an attempt failed the gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum QualityIssue {
    MalformedResponse,
    ModelCallFailed { detail: String },
    NoFieldsExtracted,
    MissingCriticalFields { fields: Vec<String> },
    ConfidenceTooLow { confidence: f64, minimum: f64 },
}

impl fmt::Display for QualityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityIssue::MalformedResponse => f.write_str("malformed_response"),
            QualityIssue::ModelCallFailed { detail } => write!(f, "model_call_failed: {detail}"),
            QualityIssue::NoFieldsExtracted => f.write_str("no_fields_extracted"),
            QualityIssue::MissingCriticalFields { fields } => {
                write!(f, "missing_critical_fields: {}", fields.join(", "))
            }
            QualityIssue::ConfidenceTooLow { confidence, minimum } => {
                write!(f, "confidence_too_low: {confidence:.2} < {minimum:.2}")
            }
        }
    }
}

/// Verdict for one extraction attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub passed: bool,
    pub issues: Vec<QualityIssue>,
    /// Fraction of critical fields present; 1.0 when the type has none and
    /// at least one field was extracted.
    pub score: f64,
}

impl QualityReport {
    /// Report for an attempt whose model call never returned.
    pub fn call_failed(detail: impl Into<String>) -> Self {
        Self {
            passed: false,
            issues: vec![QualityIssue::ModelCallFailed {
                detail: detail.into(),
            }],
            score: 0.0,
        }
    }

    pub fn issue_labels(&self) -> Vec<String> {
        self.issues.iter().map(ToString::to_string).collect()
    }
}

/// Run the gate against one attempt.
pub fn assess(
    document_type: DocumentType,
    extraction: &ExtractionResult,
    min_confidence: f64,
) -> QualityReport {
    let mut issues = Vec::new();
    if extraction.malformed {
        issues.push(QualityIssue::MalformedResponse);
    }

    let any_present = extraction.fields.values().any(|v| v.is_present());
    if !any_present {
        issues.push(QualityIssue::NoFieldsExtracted);
    }

    let critical = critical_fields(document_type);
    let missing: Vec<String> = critical
        .iter()
        .filter(|name| {
            !extraction
                .fields
                .get(**name)
                .is_some_and(|v| v.is_present())
        })
        .map(|name| name.to_string())
        .collect();
    let score = if critical.is_empty() {
        if any_present { 1.0 } else { 0.0 }
    } else {
        (critical.len() - missing.len()) as f64 / critical.len() as f64
    };
    if !missing.is_empty() && any_present {
        issues.push(QualityIssue::MissingCriticalFields { fields: missing });
    }

    if let Some(c) = extraction.confidence {
        if c < min_confidence {
            issues.push(QualityIssue::ConfidenceTooLow {
                confidence: c,
                minimum: min_confidence,
            });
        }
    }

    QualityReport {
        passed: issues.is_empty(),
        issues,
        score,
    }
}
