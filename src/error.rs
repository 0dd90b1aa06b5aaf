//! Error types for the trade-doc-validator library.
//!
//! Three error types reflect three distinct failure modes:
//!
//! * [`TradeDocError`] — **Fatal** for one invocation: the trigger could not
//!   be understood, the model was unreachable during classification, or the
//!   result could not be persisted. Returned as `Err(TradeDocError)` from the
//!   [`crate::Pipeline`] entry points so the caller (or the queue) can
//!   redeliver. A document that is simply unreadable is *not* fatal: the
//!   handlers turn it into an `UNREADABLE` record.
//!
//! * [`ModelCallError`] — a single hosted-model call failed after all
//!   infrastructure retries. During extraction it is folded into the attempt
//!   result rather than propagated, so the bounded domain retry still applies.
//!
//! * [`StorageError`] — an object-store, record-store or queue operation
//!   failed. Transient variants are retried by [`crate::retry`].
//!
//! ## Why two retry budgets
//!
//! Infrastructure retries (timeouts, throttling) sit *beneath* the domain
//! extraction retry. A throttled call that succeeds on its second network
//! attempt is still one extraction attempt.

use crate::config::ModelTier;
use thiserror::Error;

/// All fatal errors returned by the trade-doc-validator library.
#[derive(Debug, Error)]
pub enum TradeDocError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The inbound payload matched none of the accepted trigger shapes.
    #[error("Invalid trigger payload: {0}\nExpected {{bucket, key}}, a queue-wrapped body, or a storage event.")]
    InvalidTrigger(String),

    /// The document bytes could not be decoded (corrupt, encrypted, empty).
    #[error("Document '{key}' is unreadable: {detail}")]
    DocumentUnreadable { key: String, detail: String },

    /// pdfium-render returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    // ── Model errors ──────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Classification could not reach the hosted model; nothing was written.
    #[error("Hosted model unavailable while processing '{document_id}': {source}")]
    ModelUnavailable {
        document_id: String,
        #[source]
        source: ModelCallError,
    },

    // ── Storage errors ────────────────────────────────────────────────────
    /// Reading the source object or dispatching a message failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The terminal record and audit trail could not be committed.
    #[error("Failed to persist result for '{document_id}': {source}\nThe message should be redelivered.")]
    Persistence {
        document_id: String,
        #[source]
        source: StorageError,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Set PDFIUM_LIB_PATH=/path/to/dir/containing/libpdfium, or install pdfium\n\
as a system library, then retry.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TradeDocError {
    /// Whether redelivering the same message could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TradeDocError::ModelUnavailable { source, .. } => source.is_transient(),
            TradeDocError::Storage(e) | TradeDocError::Persistence { source: e, .. } => {
                e.is_transient()
            }
            _ => false,
        }
    }
}

/// A single hosted-model call that failed after its infrastructure retries.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum ModelCallError {
    /// The scoped timeout elapsed on the last attempt.
    #[error("{tier} model call timed out after {secs}s")]
    Timeout { tier: ModelTier, secs: u64 },

    /// The provider returned an error on every attempt.
    #[error("{tier} model call failed after {retries} retries: {detail}")]
    Provider {
        tier: ModelTier,
        retries: u32,
        detail: String,
    },
}

impl ModelCallError {
    pub fn tier(&self) -> ModelTier {
        match self {
            ModelCallError::Timeout { tier, .. } | ModelCallError::Provider { tier, .. } => *tier,
        }
    }

    pub fn is_transient(&self) -> bool {
        true
    }
}

/// Failure of an object-store, record-store or queue operation.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum StorageError {
    #[error("Object not found: '{location}'")]
    NotFound { location: String },

    #[error("Invalid object key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("{operation} throttled: {detail}")]
    Throttled { operation: String, detail: String },

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("{operation} failed: {detail}")]
    Io { operation: String, detail: String },

    #[error("Record store error: {0}")]
    Database(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Serialisation error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Timeouts, throttling and generic I/O blips are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Throttled { .. } | StorageError::Timeout { .. } | StorageError::Io { .. }
        )
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreadable_display_names_key() {
        let e = TradeDocError::DocumentUnreadable {
            key: "inbox/scan.pdf".into(),
            detail: "bad xref".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("inbox/scan.pdf"), "got: {msg}");
        assert!(msg.contains("bad xref"), "got: {msg}");
    }

    #[test]
    fn model_timeout_display_names_tier() {
        let e = ModelCallError::Timeout {
            tier: ModelTier::Capable,
            secs: 60,
        };
        assert!(e.to_string().contains("capable"));
        assert_eq!(e.tier(), ModelTier::Capable);
    }

    #[test]
    fn storage_transience() {
        assert!(StorageError::Throttled {
            operation: "put_object".into(),
            detail: "slow down".into()
        }
        .is_transient());
        assert!(!StorageError::NotFound {
            location: "s3://b/k".into()
        }
        .is_transient());
        assert!(!StorageError::Database("constraint".into()).is_transient());
    }

    #[test]
    fn persistence_is_transient_when_source_is() {
        let e = TradeDocError::Persistence {
            document_id: "doc_1".into(),
            source: StorageError::Timeout {
                operation: "commit".into(),
                secs: 15,
            },
        };
        assert!(e.is_transient());
        assert!(e.to_string().contains("redelivered"));
    }

    #[test]
    fn unreadable_is_not_transient() {
        let e = TradeDocError::DocumentUnreadable {
            key: "k".into(),
            detail: "d".into(),
        };
        assert!(!e.is_transient());
    }
}
