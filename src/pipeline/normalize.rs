//! Normalisation of raw extracted fields.
//!
//! Monetary fields become a [`MonetaryAmount`]: an exact [`BigDecimal`] plus
//! an ISO 4217 code. The amount never passes through `f64`, so
//! `"EUR 150,000.00"` is stored as `150000.00` / `EUR` and survives any number
//! of serialise/parse round trips unchanged.
//!
//! ## Separator rules
//!
//! | Input | Reading |
//! |-------|---------|
//! | `1,234.56` / `1.234,56` | both separators: the last one is the decimal point |
//! | `1234,5` / `1234,56` | single comma followed by 1–2 digits: decimal comma |
//! | `100,000` / `1,000,000` | otherwise commas group thousands |
//! | `1.234.567` | several dots group thousands |
//! | `150.000` | a single dot is always the decimal point |

use crate::types::{FieldValue, MonetaryAmount};
use bigdecimal::BigDecimal;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::str::FromStr;

static RE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d[\d,.'\x{a0} ]*\d|\d").unwrap());
static RE_CODE_TAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^A-Za-z])([A-Za-z]{3})$").unwrap());
static RE_CODE_HEAD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z]{3})(?:$|[^A-Za-z])").unwrap());

/// Longest symbols first so `US$` wins over `$`.
const SYMBOLS: [(&str, &str); 6] = [
    ("US$", "USD"),
    ("€", "EUR"),
    ("£", "GBP"),
    ("¥", "JPY"),
    ("₹", "INR"),
    ("$", "USD"),
];

/// Parse a money string such as `"EUR 150,000.00"` or `"1.234,56 €"`.
///
/// Returns `None` when the text holds no number or more than one.
pub fn parse_money(text: &str) -> Option<MonetaryAmount> {
    let m = RE_NUMBER.find(text)?;
    let before = &text[..m.start()];
    let after = &text[m.end()..];
    if before.chars().chain(after.chars()).any(|c| c.is_ascii_digit()) {
        return None;
    }
    let canonical = canonical_number(m.as_str())?;
    let mut amount = BigDecimal::from_str(&canonical).ok()?;
    if before.trim_end().ends_with('-') {
        amount = -amount;
    }
    Some(MonetaryAmount {
        amount,
        currency: adjacent_currency(before, after),
    })
}

/// Resolve grouping and decimal separators into `digits[.digits]`.
fn canonical_number(token: &str) -> Option<String> {
    let cleaned: String = token
        .chars()
        .filter(|c| !matches!(c, ' ' | '\'' | '\u{a0}'))
        .collect();
    let commas = cleaned.matches(',').count();
    let dots = cleaned.matches('.').count();

    let decimal_at = match (cleaned.rfind(','), cleaned.rfind('.')) {
        (Some(c), Some(d)) => Some(c.max(d)),
        (Some(c), None) => {
            let frac_len = cleaned.len() - c - 1;
            (commas == 1 && (1..=2).contains(&frac_len)).then_some(c)
        }
        (None, Some(d)) => (dots == 1).then_some(d),
        (None, None) => None,
    };

    let (int_part, frac_part) = match decimal_at {
        Some(i) => (&cleaned[..i], &cleaned[i + 1..]),
        None => (cleaned.as_str(), ""),
    };
    if let Some(i) = decimal_at {
        let decimal_char = &cleaned[i..i + 1];
        if int_part.contains(decimal_char) {
            return None;
        }
    }
    if !frac_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let digits: String = int_part.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    if frac_part.is_empty() {
        Some(digits)
    } else {
        Some(format!("{digits}.{frac_part}"))
    }
}

fn adjacent_currency(before: &str, after: &str) -> Option<String> {
    let before = before.trim_end().trim_end_matches('-').trim_end();
    let after = after.trim_start();
    for (symbol, code) in SYMBOLS {
        if before.ends_with(symbol) || after.starts_with(symbol) {
            return Some(code.to_string());
        }
    }
    RE_CODE_TAIL
        .captures(before)
        .or_else(|| RE_CODE_HEAD.captures(after))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_ascii_uppercase())
}

/// A standalone currency field value, e.g. `"eur"` or `"€"`.
pub fn currency_code(text: &str) -> Option<String> {
    let t = text.trim();
    if let Some((_, code)) = SYMBOLS.iter().find(|(s, _)| *s == t) {
        return Some(code.to_string());
    }
    (t.len() == 3 && t.chars().all(|c| c.is_ascii_alphabetic())).then(|| t.to_ascii_uppercase())
}

/// Whether a field name denotes money.
pub fn is_monetary_key(key: &str) -> bool {
    let k = key.to_ascii_lowercase();
    k == "amount"
        || k == "price"
        || k.ends_with("_amount")
        || k.ends_with("_price")
        || matches!(k.as_str(), "total" | "subtotal" | "invoice_value" | "insured_value")
}

/// Normalise a raw field map. A sibling `currency` field fills in the code
/// for amounts that carry none of their own.
pub fn normalize_fields(raw: &Map<String, Value>) -> BTreeMap<String, FieldValue> {
    normalize_map(raw, None)
}

fn normalize_map(
    raw: &Map<String, Value>,
    inherited: Option<&str>,
) -> BTreeMap<String, FieldValue> {
    let own = raw
        .get("currency")
        .and_then(Value::as_str)
        .and_then(currency_code);
    let fallback = own.as_deref().or(inherited);
    raw.iter()
        .map(|(k, v)| (k.clone(), normalize_value(k, v, fallback)))
        .collect()
}

fn normalize_value(key: &str, value: &Value, fallback: Option<&str>) -> FieldValue {
    let monetary = is_monetary_key(key);
    match value {
        Value::Null => FieldValue::Null,
        Value::Bool(b) => FieldValue::Bool(*b),
        // Extraction replies arrive with monetary literals already quoted;
        // a number here came from a caller-built map.
        Value::Number(n) if monetary => match BigDecimal::from_str(&n.to_string()) {
            Ok(amount) => FieldValue::Amount(MonetaryAmount {
                amount,
                currency: fallback.map(str::to_string),
            }),
            Err(_) => FieldValue::Text(n.to_string()),
        },
        Value::Number(n) => match n.as_i64() {
            Some(i) => FieldValue::Integer(i),
            None => FieldValue::Text(n.to_string()),
        },
        Value::String(s) if monetary => match parse_money(s) {
            Some(mut money) => {
                if money.currency.is_none() {
                    money.currency = fallback.map(str::to_string);
                }
                FieldValue::Amount(money)
            }
            None => FieldValue::Text(s.trim().to_string()),
        },
        Value::String(s) => FieldValue::Text(s.trim().to_string()),
        Value::Array(items) => FieldValue::List(
            items
                .iter()
                .map(|v| normalize_value(key, v, fallback))
                .collect(),
        ),
        Value::Object(map) => FieldValue::Object(normalize_map(map, fallback)),
    }
}
