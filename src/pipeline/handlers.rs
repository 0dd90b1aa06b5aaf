//! Handlers: what happens to a routed document.
//!
//! | Handler | Input | Work |
//! |---------|-------|------|
//! | `vision_image` | raster image | payload → two-stage extractor → commit |
//! | `pdf_convert` | PDF | rasterise → store `{base}_page_NNN.png` → dispatch each page to `vision_image` |
//! | `text` / `specialized_trade` | UTF-8 text, SWIFT/EDI messages | payload → two-stage extractor → commit |
//!
//! A PDF gets no terminal record of its own unless it cannot be read; its
//! pages are documents in their own right and carry `source_document`
//! provenance. Under the PDF's own id the audit trail keeps one `conversion`
//! row per page naming the page document, so the parent can always be
//! traced to its results.
//!
//! Unreadable input (corrupt bytes, a missing object) ends in an `UNREADABLE`
//! record without any model call. Infrastructure failures propagate so the
//! message can be redelivered; nothing is written in that case.

use crate::config::PipelineConfig;
use crate::error::{StorageError, TradeDocError};
use crate::pipeline::encode::{image_payload, image_quality_score, text_payload};
use crate::pipeline::extractor::{Outcome, ProcessingContext, TwoStageExtractor};
use crate::pipeline::model::VisionModel;
use crate::pipeline::render::PdfRasteriser;
use crate::pipeline::router::HandlerKind;
use crate::retry::{with_retry, RetryPolicy};
use crate::storage::{CommitOutcome, Dispatcher, ObjectStore, QueueMessage, RecordStore};
use crate::types::{
    AuditEntry, AuditStage, DocumentPayload, DocumentRef, ProcessingRecord, SourceDocument,
    TerminalState,
};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// What handling one message produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HandleOutcome {
    /// A terminal record was committed.
    Recorded {
        document_id: String,
        state: TerminalState,
    },
    /// The document already had a record; nothing was written.
    AlreadyRecorded { document_id: String },
    /// A PDF was split into pages, each dispatched as its own document.
    Converted { document_id: String, pages: u32 },
}

/// Borrowed view of everything a handler needs.
#[derive(Clone, Copy)]
pub struct Handlers<'a> {
    pub config: &'a PipelineConfig,
    pub model: &'a dyn VisionModel,
    pub objects: &'a dyn ObjectStore,
    pub records: &'a dyn RecordStore,
    pub dispatcher: &'a dyn Dispatcher,
    pub rasteriser: &'a dyn PdfRasteriser,
}

impl Handlers<'_> {
    fn storage_policy(&self) -> RetryPolicy {
        RetryPolicy::for_storage(self.config)
    }

    /// Handle one routed message.
    ///
    /// A document that already has a record is skipped before any model
    /// call, so redelivery costs nothing.
    pub async fn handle(&self, message: &QueueMessage) -> Result<HandleOutcome, TradeDocError> {
        let document = message.document();
        let policy = self.storage_policy();
        let existing = with_retry(&policy, "get_record", || {
            self.records.get_record(&document.document_id)
        })
        .await?;
        if existing.is_some() {
            info!("{}: already recorded, skipping", document.document_id);
            return Ok(HandleOutcome::AlreadyRecorded {
                document_id: document.document_id,
            });
        }

        match message.routing_decision {
            HandlerKind::VisionImage => self.vision_image(document, message.routing_decision).await,
            HandlerKind::PdfConvert => self.pdf_convert(document).await,
            HandlerKind::Text | HandlerKind::SpecializedTrade => {
                self.text(document, message.routing_decision).await
            }
        }
    }

    async fn vision_image(
        &self,
        document: DocumentRef,
        handler: HandlerKind,
    ) -> Result<HandleOutcome, TradeDocError> {
        let (payload, score) = match self.fetch(&document).await? {
            Ok(bytes) => {
                let score = image_quality_score(bytes.len());
                (image_payload(bytes, &document.key), Some(score))
            }
            Err(unreadable) => (Err(unreadable), None),
        };
        self.extract_and_commit(document, handler, payload, score).await
    }

    async fn text(
        &self,
        document: DocumentRef,
        handler: HandlerKind,
    ) -> Result<HandleOutcome, TradeDocError> {
        let payload = match self.fetch(&document).await? {
            Ok(bytes) => text_payload(bytes, &document.key),
            Err(unreadable) => Err(unreadable),
        };
        self.extract_and_commit(document, handler, payload, None).await
    }

    async fn pdf_convert(&self, document: DocumentRef) -> Result<HandleOutcome, TradeDocError> {
        let bytes = match self.fetch(&document).await? {
            Ok(bytes) => bytes,
            Err(unreadable) => {
                return self
                    .extract_and_commit(document, HandlerKind::PdfConvert, Err(unreadable), None)
                    .await
            }
        };

        let pages = match self.rasteriser.rasterise(bytes, &document.key).await {
            Ok(pages) => pages,
            Err(
                e @ (TradeDocError::DocumentUnreadable { .. }
                | TradeDocError::RasterisationFailed { .. }),
            ) => {
                warn!("{}: PDF unreadable: {}", document.document_id, e);
                return self
                    .extract_and_commit(document, HandlerKind::PdfConvert, Err(e), None)
                    .await;
            }
            Err(e) => return Err(e),
        };

        let policy = self.storage_policy();
        let total = pages.len() as u32;
        let mut trail = ProcessingContext::new(document.clone(), self.config);
        trail.note(
            AuditStage::Routing,
            HandlerKind::PdfConvert.as_str(),
            format!("dispatched '{}' to {}", document.key, HandlerKind::PdfConvert),
        );
        for page in pages {
            let page_key = page_key(&document.key, page.page_number);
            let metadata = BTreeMap::from([
                ("original_key".to_string(), document.key.clone()),
                ("original_document_id".to_string(), document.document_id.clone()),
                ("page_number".to_string(), page.page_number.to_string()),
                ("total_pages".to_string(), page.total_pages.to_string()),
                ("width".to_string(), page.width.to_string()),
                ("height".to_string(), page.height.to_string()),
            ]);
            with_retry(&policy, "put_object", || {
                self.objects
                    .put_object(&document.bucket, &page_key, page.png.clone(), &metadata)
            })
            .await?;

            let page_doc = DocumentRef::new(document.bucket.clone(), page_key).with_source(
                SourceDocument::pdf_page(&document, page.page_number, page.total_pages),
            );
            let message = QueueMessage::new(&page_doc, HandlerKind::VisionImage);
            with_retry(&policy, "dispatch", || self.dispatcher.dispatch(message.clone())).await?;
            trail.note(
                AuditStage::Conversion,
                "page_dispatched",
                format!(
                    "page {}/{} → {} ({})",
                    page.page_number, total, page_doc.document_id, page_doc.key
                ),
            );
            debug!(
                "{}: page {}/{} → {} ({})",
                document.document_id, page.page_number, total, page_doc.key, page_doc.document_id
            );
        }

        let rows = trail.audit().to_vec();
        with_retry(&policy, "append_audit", || self.records.append_audit(&rows))
            .await
            .map_err(|source| TradeDocError::Persistence {
                document_id: document.document_id.clone(),
                source,
            })?;
        info!("{}: converted into {} page image(s)", document.document_id, total);
        Ok(HandleOutcome::Converted {
            document_id: document.document_id,
            pages: total,
        })
    }

    /// Read the object. A missing or invalid object is unreadable input
    /// (the inner `Err`); anything else is an infrastructure failure.
    async fn fetch(
        &self,
        document: &DocumentRef,
    ) -> Result<Result<Vec<u8>, TradeDocError>, TradeDocError> {
        let policy = self.storage_policy();
        let result = with_retry(&policy, "get_object", || {
            self.objects.get_object(&document.bucket, &document.key)
        })
        .await;
        match result {
            Ok(bytes) => Ok(Ok(bytes)),
            Err(e @ (StorageError::NotFound { .. } | StorageError::InvalidKey { .. })) => {
                Ok(Err(TradeDocError::DocumentUnreadable {
                    key: document.key.clone(),
                    detail: e.to_string(),
                }))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn extract_and_commit(
        &self,
        document: DocumentRef,
        handler: HandlerKind,
        payload: Result<DocumentPayload, TradeDocError>,
        image_quality_score: Option<f64>,
    ) -> Result<HandleOutcome, TradeDocError> {
        let mut ctx = ProcessingContext::new(document, self.config);
        ctx.image_quality_score = image_quality_score;
        ctx.note(
            AuditStage::Routing,
            handler.as_str(),
            format!("dispatched '{}' to {}", ctx.document.key, handler),
        );

        let outcome = match payload {
            Ok(payload) => {
                TwoStageExtractor::new(self.model, self.config)
                    .run(&mut ctx, &payload)
                    .await?
            }
            Err(TradeDocError::DocumentUnreadable { detail, .. }) => Outcome::unreadable(detail),
            Err(e @ TradeDocError::RasterisationFailed { .. }) => {
                Outcome::unreadable(e.to_string())
            }
            Err(e) => return Err(e),
        };

        let (record, audit) = ctx.finish(outcome);
        persist(self.records, &self.storage_policy(), &record, &audit).await
    }
}

/// Commit a record and its audit rows under the storage retry policy.
pub async fn persist(
    records: &dyn RecordStore,
    policy: &RetryPolicy,
    record: &ProcessingRecord,
    audit: &[AuditEntry],
) -> Result<HandleOutcome, TradeDocError> {
    let committed = with_retry(policy, "commit", || records.commit(record, audit))
        .await
        .map_err(|source| TradeDocError::Persistence {
            document_id: record.document_id.clone(),
            source,
        })?;
    Ok(match committed {
        CommitOutcome::Committed => HandleOutcome::Recorded {
            document_id: record.document_id.clone(),
            state: record.state,
        },
        CommitOutcome::AlreadyRecorded => {
            info!("{}: record already committed by an earlier delivery", record.document_id);
            HandleOutcome::AlreadyRecorded {
                document_id: record.document_id.clone(),
            }
        }
    })
}

/// `inbox/lc.pdf`, page 3 → `inbox/lc_page_003.png`.
pub fn page_key(key: &str, page_number: u32) -> String {
    let name_start = key.rfind('/').map_or(0, |i| i + 1);
    let base = match key[name_start..].rfind('.') {
        Some(dot) if dot > 0 => &key[..name_start + dot],
        _ => key,
    };
    format!("{base}_page_{page_number:03}.png")
}
