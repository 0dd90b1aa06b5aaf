//! Tolerant parsing of hosted-model replies.
//!
//! Models are asked for bare JSON but routinely wrap it in prose or a
//! ```` ```json ```` fence, or get cut off by the token limit. Every reply
//! therefore goes through [`extract_json_object`], which tries, in order:
//!
//! 1. the whole trimmed reply as JSON,
//! 2. the contents of the first fenced code block,
//! 3. the first balanced `{…}` span that parses (string-aware brace scan).
//!
//! The outcome is an explicit [`ParsedResponse`]: callers must handle the
//! `Malformed` arm, and do so with a safe default rather than an error.
//!
//! ## Monetary literals
//!
//! `serde_json` reads every non-integer number as `f64`, which would turn
//! `"total_amount": 150000.00` into `150000.0` and round anything beyond
//! 15 significant digits. Before an extraction reply is parsed, bare decimal
//! literals under monetary keys are therefore quoted, so the exact text
//! reaches [`crate::pipeline::normalize`].

use crate::config::ModelTier;
use crate::pipeline::normalize::is_monetary_key;
use crate::types::{ClassificationResult, DocumentType};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::borrow::Cow;

static RE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[A-Za-z]*[ \t]*\r?\n?(.*?)```").unwrap());
static RE_KEYED_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""([^"\\\n]+)"(\s*:\s*)(-?\d+(?:\.\d+)?)(\s*[,}\]\r\n])"#).unwrap()
});

/// A model reply after tolerant parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResponse<T> {
    Valid(T),
    /// Nothing usable was found; carries the raw reply for the audit trail.
    Malformed(String),
}

impl<T> ParsedResponse<T> {
    pub fn is_valid(&self) -> bool {
        matches!(self, ParsedResponse::Valid(_))
    }
}

/// Find the first JSON object in a model reply.
pub fn extract_json_object(text: &str) -> Option<Map<String, Value>> {
    let trimmed = text.trim();
    if let Some(obj) = parse_object(trimmed) {
        return Some(obj);
    }
    for caps in RE_FENCE.captures_iter(trimmed) {
        if let Some(obj) = caps.get(1).and_then(|m| parse_object(m.as_str().trim())) {
            return Some(obj);
        }
    }
    balanced_object(trimmed)
}

fn parse_object(s: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(s) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Scan for `{…}` spans with matching braces, ignoring braces inside strings.
fn balanced_object(text: &str) -> Option<Map<String, Value>> {
    let bytes = text.as_bytes();
    for (start, _) in text.match_indices('{') {
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (offset, &b) in bytes[start..].iter().enumerate() {
            if in_string {
                match b {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        if let Some(obj) = parse_object(&text[start..=start + offset]) {
                            return Some(obj);
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
    }
    None
}

/// A confidence value in `[0, 1]`; numeric strings and percentages accepted.
pub fn parse_confidence(value: Option<&Value>) -> Option<f64> {
    let c = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let s = s.trim();
            match s.strip_suffix('%') {
                Some(pct) => pct.trim().parse::<f64>().ok()? / 100.0,
                None => s.parse::<f64>().ok()?,
            }
        }
        _ => return None,
    };
    (c.is_finite() && (0.0..=1.0).contains(&c)).then_some(c)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                _ => None,
            })
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

fn string_field(obj: &Map<String, Value>, key: &str) -> String {
    match obj.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        _ => String::new(),
    }
}

// ── Classification ───────────────────────────────────────────────────────

/// Classification fields as read from the reply, before tier tagging.
#[derive(Debug, Clone, PartialEq)]
pub struct RawClassification {
    pub document_type: DocumentType,
    pub confidence: f64,
    pub reasoning: String,
    pub complexity_score: Option<f64>,
    pub key_indicators: Vec<String>,
    pub alternative_types: Vec<String>,
}

/// Parse a classification reply.
///
/// A reply with a JSON object but a missing or invalid confidence is still
/// `Valid`, with confidence 0.0: the type is kept, the document will not be
/// trusted.
pub fn parse_classification(text: &str) -> ParsedResponse<RawClassification> {
    let Some(obj) = extract_json_object(text) else {
        return ParsedResponse::Malformed(text.to_string());
    };
    if !obj.contains_key("document_type") && !obj.contains_key("confidence") {
        return ParsedResponse::Malformed(text.to_string());
    }
    let document_type = match obj.get("document_type") {
        Some(Value::String(label)) => DocumentType::from_label(label),
        _ => DocumentType::Other,
    };
    ParsedResponse::Valid(RawClassification {
        document_type,
        confidence: parse_confidence(obj.get("confidence")).unwrap_or(0.0),
        reasoning: string_field(&obj, "reasoning"),
        complexity_score: parse_confidence(obj.get("complexity_score")),
        key_indicators: string_list(obj.get("key_indicators")),
        alternative_types: string_list(obj.get("alternative_types")),
    })
}

/// Resolve a parsed reply into a result, substituting the safe default.
pub fn classification_result(
    parsed: ParsedResponse<RawClassification>,
    tier: ModelTier,
) -> ClassificationResult {
    match parsed {
        ParsedResponse::Valid(raw) => ClassificationResult {
            document_type: raw.document_type,
            confidence: raw.confidence,
            reasoning: raw.reasoning,
            tier,
            complexity_score: raw.complexity_score,
            key_indicators: raw.key_indicators,
            alternative_types: raw.alternative_types,
            malformed: false,
        },
        ParsedResponse::Malformed(raw) => ClassificationResult::malformed(tier, &raw),
    }
}

// ── Extraction ───────────────────────────────────────────────────────────

const EXTRACTION_META_KEYS: [&str; 4] =
    ["confidence", "extraction_notes", "notes", "document_type"];

/// Quote bare decimal literals under monetary keys: `"total": 1.50` becomes
/// `"total": "1.50"`. Exponent forms and every other key are left alone.
pub fn quote_monetary_literals(text: &str) -> Cow<'_, str> {
    RE_KEYED_NUMBER.replace_all(text, |caps: &Captures<'_>| {
        if is_monetary_key(&caps[1]) {
            format!("\"{}\"{}\"{}\"{}", &caps[1], &caps[2], &caps[3], &caps[4])
        } else {
            caps[0].to_string()
        }
    })
}

/// Extraction fields as read from the reply, before normalisation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawExtraction {
    pub fields: Map<String, Value>,
    pub confidence: Option<f64>,
    pub notes: String,
}

/// Parse an extraction reply.
///
/// Reads `extracted_fields` when present; otherwise treats the remaining
/// top-level keys of the object as the fields.
pub fn parse_extraction(text: &str) -> ParsedResponse<RawExtraction> {
    let Some(mut obj) = extract_json_object(&quote_monetary_literals(text)) else {
        return ParsedResponse::Malformed(text.to_string());
    };
    let confidence = parse_confidence(obj.get("confidence"));
    let notes = match string_field(&obj, "extraction_notes") {
        n if n.is_empty() => string_field(&obj, "notes"),
        n => n,
    };
    let fields = match obj.remove("extracted_fields") {
        Some(Value::Object(fields)) => fields,
        Some(_) => return ParsedResponse::Malformed(text.to_string()),
        None => {
            for key in EXTRACTION_META_KEYS {
                obj.remove(key);
            }
            obj
        }
    };
    ParsedResponse::Valid(RawExtraction {
        fields,
        confidence,
        notes,
    })
}
