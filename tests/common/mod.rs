//! Shared fixtures for the integration tests: a scripted model, a fake
//! rasteriser and a pipeline wired to a scratch directory.

#![allow(dead_code)]

use async_trait::async_trait;
use image::{DynamicImage, Rgba, RgbaImage};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use trade_doc_validator::pipeline::encode::png_bytes;
use trade_doc_validator::pipeline::render::looks_like_pdf;
use trade_doc_validator::prompts::CLASSIFIER_PROMPT;
use trade_doc_validator::{
    ChannelDispatcher, LocalObjectStore, ModelCallError, ModelReply, ModelRequest, ModelTier,
    ObjectStore, PdfRasteriser, Pipeline, PipelineConfig, QueueMessage, RenderedPage,
    SqliteRecordStore, TradeDocError, VisionModel,
};

// ── Scripted model ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Classification,
    Extraction,
}

/// Replies queued per (tier, kind); every call pops one and is logged.
#[derive(Default)]
pub struct ScriptedModel {
    queues: Mutex<BTreeMap<(ModelTier, bool), VecDeque<Result<String, ModelCallError>>>>,
    calls: Mutex<Vec<(ModelTier, CallKind)>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, tier: ModelTier, kind: CallKind, reply: Result<String, ModelCallError>) -> Self {
        self.queues
            .lock()
            .unwrap()
            .entry((tier, kind == CallKind::Classification))
            .or_default()
            .push_back(reply);
        self
    }

    pub fn classify(self, tier: ModelTier, reply: &str) -> Self {
        self.push(tier, CallKind::Classification, Ok(reply.to_string()))
    }

    pub fn extract(self, tier: ModelTier, reply: &str) -> Self {
        self.push(tier, CallKind::Extraction, Ok(reply.to_string()))
    }

    pub fn fail_extraction(self, tier: ModelTier) -> Self {
        self.push(
            tier,
            CallKind::Extraction,
            Err(ModelCallError::Provider {
                tier,
                retries: 3,
                detail: "503 overloaded".into(),
            }),
        )
    }

    pub fn fail_classification(self, tier: ModelTier) -> Self {
        self.push(
            tier,
            CallKind::Classification,
            Err(ModelCallError::Timeout { tier, secs: 60 }),
        )
    }

    pub fn calls(&self) -> Vec<(ModelTier, CallKind)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, kind: CallKind) -> usize {
        self.calls().iter().filter(|(_, k)| *k == kind).count()
    }

    pub fn count_tier(&self, tier: ModelTier, kind: CallKind) -> usize {
        self.calls().iter().filter(|c| **c == (tier, kind)).count()
    }
}

#[async_trait]
impl VisionModel for ScriptedModel {
    async fn invoke(&self, request: &ModelRequest<'_>) -> Result<ModelReply, ModelCallError> {
        let kind = if request.prompt == CLASSIFIER_PROMPT {
            CallKind::Classification
        } else {
            CallKind::Extraction
        };
        self.calls.lock().unwrap().push((request.tier, kind));
        let next = self
            .queues
            .lock()
            .unwrap()
            .get_mut(&(request.tier, kind == CallKind::Classification))
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| panic!("no scripted {kind:?} reply left for {} tier", request.tier));
        next.map(|text| ModelReply {
            text,
            model_id: self.model_id(request.tier),
            input_tokens: 1200,
            output_tokens: 150,
            duration_ms: 5,
            retries: 0,
        })
    }

    fn model_id(&self, tier: ModelTier) -> String {
        format!("scripted-{tier}")
    }
}

// ── Fake rasteriser ──────────────────────────────────────────────────────────

/// Renders `pages` blank pages for anything with a PDF header.
pub struct FakeRasteriser {
    pub pages: u32,
}

#[async_trait]
impl PdfRasteriser for FakeRasteriser {
    async fn rasterise(&self, pdf: Vec<u8>, key: &str) -> Result<Vec<RenderedPage>, TradeDocError> {
        if !looks_like_pdf(&pdf) || pdf.len() < 16 {
            return Err(TradeDocError::DocumentUnreadable {
                key: key.to_string(),
                detail: "not a PDF".into(),
            });
        }
        Ok((1..=self.pages)
            .map(|n| RenderedPage {
                page_number: n,
                total_pages: self.pages,
                png: sample_png(),
                width: 8,
                height: 8,
            })
            .collect())
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────────────

pub fn sample_png() -> Vec<u8> {
    let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, Rgba([255, 255, 255, 255])));
    png_bytes(&img).unwrap()
}

pub fn minimal_pdf() -> Vec<u8> {
    b"%PDF-1.4\n1 0 obj << /Type /Catalog >> endobj\n%%EOF\n".to_vec()
}

/// A Word document with one paragraph per line of `body`.
pub fn word_document(body: &str) -> Vec<u8> {
    use docx_rs::{Docx, Paragraph, Run};
    let docx = body.lines().fold(Docx::new(), |docx, line| {
        docx.add_paragraph(Paragraph::new().add_run(Run::new().add_text(line)))
    });
    let mut buf = std::io::Cursor::new(Vec::new());
    docx.build().pack(&mut buf).unwrap();
    buf.into_inner()
}

pub fn fast_config() -> PipelineConfig {
    PipelineConfig::builder()
        .retry_backoff_ms(1)
        .max_retries(1)
        .build()
        .unwrap()
}

pub struct Harness {
    pub dir: TempDir,
    pub model: Arc<ScriptedModel>,
    pub objects: Arc<LocalObjectStore>,
    pub records: Arc<SqliteRecordStore>,
    pub pipeline: Pipeline,
    pub rx: UnboundedReceiver<QueueMessage>,
}

impl Harness {
    pub fn new(model: ScriptedModel) -> Self {
        Self::with(model, fast_config(), 2)
    }

    pub fn with(model: ScriptedModel, config: PipelineConfig, pdf_pages: u32) -> Self {
        let dir = TempDir::new().unwrap();
        let model = Arc::new(model);
        let objects = Arc::new(LocalObjectStore::new(dir.path().join("objects")));
        let records = Arc::new(SqliteRecordStore::open(dir.path().join("records.db")).unwrap());
        let (dispatcher, rx) = ChannelDispatcher::channel();
        let pipeline = Pipeline::new(
            config,
            model.clone(),
            objects.clone(),
            records.clone(),
            Arc::new(dispatcher),
            Arc::new(FakeRasteriser { pages: pdf_pages }),
        );
        Self {
            dir,
            model,
            objects,
            records,
            pipeline,
            rx,
        }
    }

    pub async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) {
        self.objects
            .put_object(bucket, key, bytes, &BTreeMap::new())
            .await
            .unwrap();
    }
}

// ── Canned replies ───────────────────────────────────────────────────────────

pub fn classification(document_type: &str, confidence: f64) -> String {
    format!(
        r#"{{"document_type":"{document_type}","confidence":{confidence},"reasoning":"scripted"}}"#
    )
}

pub const LC_COMPLETE: &str = r#"{
  "extracted_fields": {
    "lc_number": "LC-2024-00123",
    "applicant": "Acme Imports Ltd",
    "beneficiary": "Shanghai Export Co",
    "credit_amount": "EUR 150,000.00",
    "currency": "EUR",
    "expiry_date": "2024-12-31"
  },
  "confidence": 0.93,
  "extraction_notes": ""
}"#;

/// Letter of credit with the financial fields missing.
pub const LC_NO_AMOUNT: &str = r#"{
  "extracted_fields": {
    "lc_number": "LC-2024-00123",
    "applicant": "Acme Imports Ltd",
    "beneficiary": "Shanghai Export Co",
    "credit_amount": null,
    "expiry_date": "2024-12-31"
  },
  "confidence": 0.7,
  "extraction_notes": "amount illegible"
}"#;

/// Amounts as bare JSON numbers, one past `f64` precision.
pub const LC_NUMERIC_AMOUNTS: &str = r#"{
  "extracted_fields": {
    "lc_number": "LC-2024-00777",
    "applicant": "Acme Imports Ltd",
    "beneficiary": "Shanghai Export Co",
    "credit_amount": 150000.00,
    "tolerance_amount": 98765432109876543.21,
    "currency": "USD",
    "expiry_date": "2025-03-31"
  },
  "confidence": 0.9
}"#;

pub const LC_ONLY_NUMBER: &str =
    r#"{"extracted_fields":{"lc_number":"LC-9","applicant":""},"confidence":0.5}"#;
