//! Trigger normalisation: three inbound payload shapes, one request type.
//!
//! | Shape | Example |
//! |-------|---------|
//! | direct | `{"bucket": "b", "key": "inbox/lc.png"}` |
//! | queue-wrapped | `{"Records": [{"body": "{\"bucket\":…}"}]}` or `{"body": {…}}` |
//! | storage event | `{"Records": [{"s3": {"bucket": {"name": "b"}, "object": {"key": "inbox/lc+1.png"}}}]}` |
//!
//! Storage-event keys arrive form-url-encoded (`+` for space, `%XX`
//! escapes) and are decoded here. A direct payload may also carry the
//! document inline (`content` as text or `content_base64`), in which case it
//! is stored under the configured inline bucket before routing.

use crate::error::TradeDocError;
use crate::types::{DocumentRef, SourceDocument};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which of the accepted shapes a request arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerShape {
    Direct,
    QueueWrapped,
    StorageEvent,
}

/// One document to route, whatever shape it arrived in.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerRequest {
    pub document: DocumentRef,
    /// Document bytes supplied with the trigger instead of by reference.
    pub inline: Option<Vec<u8>>,
    pub shape: TriggerShape,
}

#[derive(Debug, Deserialize)]
struct DirectPayload {
    bucket: Option<String>,
    key: Option<String>,
    document_id: Option<String>,
    source_document: Option<SourceDocument>,
    content: Option<String>,
    content_base64: Option<String>,
}

/// Normalise any accepted payload into one request per document.
pub fn normalize(
    payload: &Value,
    inline_bucket: &str,
) -> Result<Vec<TriggerRequest>, TradeDocError> {
    let obj = payload
        .as_object()
        .ok_or_else(|| TradeDocError::InvalidTrigger("payload is not a JSON object".into()))?;

    if let Some(records) = obj.get("Records") {
        let records = records
            .as_array()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| {
                TradeDocError::InvalidTrigger("'Records' must be a non-empty array".into())
            })?;
        let mut requests = Vec::with_capacity(records.len());
        for record in records {
            if let Some(s3) = record.get("s3") {
                requests.push(storage_event(s3)?);
            } else if let Some(body) = record.get("body") {
                requests.extend(queue_body(body, inline_bucket)?);
            } else {
                return Err(TradeDocError::InvalidTrigger(
                    "record has neither 's3' nor 'body'".into(),
                ));
            }
        }
        return Ok(requests);
    }

    if let Some(body) = obj.get("body") {
        return queue_body(body, inline_bucket);
    }

    Ok(vec![direct(payload, inline_bucket, TriggerShape::Direct)?])
}

fn queue_body(body: &Value, inline_bucket: &str) -> Result<Vec<TriggerRequest>, TradeDocError> {
    let inner: Value = match body {
        Value::String(s) => serde_json::from_str(s)
            .map_err(|e| TradeDocError::InvalidTrigger(format!("queue body is not JSON: {e}")))?,
        other => other.clone(),
    };
    if inner.get("Records").is_some() {
        // storage event relayed through a queue
        let mut requests = normalize(&inner, inline_bucket)?;
        for r in &mut requests {
            r.shape = TriggerShape::QueueWrapped;
        }
        return Ok(requests);
    }
    Ok(vec![direct(&inner, inline_bucket, TriggerShape::QueueWrapped)?])
}

fn direct(
    value: &Value,
    inline_bucket: &str,
    shape: TriggerShape,
) -> Result<TriggerRequest, TradeDocError> {
    let payload: DirectPayload = serde_json::from_value(value.clone())
        .map_err(|e| TradeDocError::InvalidTrigger(format!("unrecognised payload: {e}")))?;

    let inline = match (payload.content, payload.content_base64) {
        (Some(text), _) => Some(text.into_bytes()),
        (None, Some(b64)) => Some(STANDARD.decode(b64.trim()).map_err(|e| {
            TradeDocError::InvalidTrigger(format!("content_base64 is not valid base64: {e}"))
        })?),
        (None, None) => None,
    };

    let key = payload
        .key
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| TradeDocError::InvalidTrigger("missing 'key'".into()))?;
    let bucket = match (payload.bucket.filter(|b| !b.trim().is_empty()), &inline) {
        (Some(bucket), _) => bucket,
        (None, Some(_)) => inline_bucket.to_string(),
        (None, None) => return Err(TradeDocError::InvalidTrigger("missing 'bucket'".into())),
    };

    let mut document = DocumentRef::new(bucket, key);
    if let Some(id) = payload.document_id.filter(|id| !id.trim().is_empty()) {
        document = document.with_document_id(id);
    }
    if let Some(source) = payload.source_document {
        document = document.with_source(source);
    }
    Ok(TriggerRequest {
        document,
        inline,
        shape,
    })
}

fn storage_event(s3: &Value) -> Result<TriggerRequest, TradeDocError> {
    let bucket = s3
        .pointer("/bucket/name")
        .and_then(Value::as_str)
        .ok_or_else(|| TradeDocError::InvalidTrigger("storage event missing bucket name".into()))?;
    let raw_key = s3
        .pointer("/object/key")
        .and_then(Value::as_str)
        .ok_or_else(|| TradeDocError::InvalidTrigger("storage event missing object key".into()))?;
    let key = decode_object_key(raw_key)?;
    Ok(TriggerRequest {
        document: DocumentRef::new(bucket, key),
        inline: None,
        shape: TriggerShape::StorageEvent,
    })
}

/// Decode a form-url-encoded object key: `+` is a space, `%XX` a byte.
///
/// Malformed escapes are kept literally.
pub fn decode_object_key(raw: &str) -> Result<String, TradeDocError> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8(out).map_err(|_| {
        TradeDocError::InvalidTrigger(format!(
            "object key '{raw}' is not valid UTF-8 once decoded"
        ))
    })
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
