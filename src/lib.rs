//! # trade-doc-validator
//!
//! Route, classify and extract trade-finance documents (letters of credit,
//! commercial invoices, bills of lading, …) with two tiers of hosted Vision
//! Language Model.
//!
//! ## Why two tiers?
//!
//! Most documents are easy: a cheap, fast model classifies them confidently
//! and extracts every critical field on the first try. Only the hard ones
//! need the slow, expensive model. This crate classifies everything on the
//! cheap tier first and escalates a document to the capable tier only when
//! the classification confidence or the extraction quality says so, with a
//! hard cap on calls per document. Every decision is written to an audit
//! trail alongside its estimated cost.
//!
//! ## Pipeline Overview
//!
//! ```text
//! trigger (direct / queue-wrapped / storage event)
//!  │
//!  ├─ 1. Normalise  one request per document, object keys decoded
//!  ├─ 2. Route      extension → image | pdf | text | trade message, else REJECTED
//!  ├─ 3. Prepare    PDF → PNG per page (pdfium, spawn_blocking), image/text payload
//!  ├─ 4. Classify   cheap tier; escalate once to capable when 0.5 ≤ c < 0.8
//!  ├─ 5. Extract    type-specific prompt, quality gate, one retry on capable
//!  └─ 6. Commit     record + audit rows in one SQLite transaction
//! ```
//!
//! [`stats::summarize`] reports escalation and cost figures over committed
//! records (`tdv stats`).
//!
//! Terminal states: `EXTRACTED`, `EXTRACTED_DEGRADED`, `REJECTED`, `UNREADABLE`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trade_doc_validator::{
//!     ChannelDispatcher, LlmVisionModel, LocalObjectStore, Pipeline, PipelineConfig,
//!     PdfiumRasteriser, SqliteRecordStore,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from ANTHROPIC_API_KEY / OPENAI_API_KEY / GEMINI_API_KEY
//!     let config = PipelineConfig::default();
//!     let (dispatcher, mut rx) = ChannelDispatcher::channel();
//!     let pipeline = Pipeline::new(
//!         config.clone(),
//!         Arc::new(LlmVisionModel::from_config(&config)?),
//!         Arc::new(LocalObjectStore::new("./objects")),
//!         Arc::new(SqliteRecordStore::open("./records.db")?),
//!         Arc::new(dispatcher),
//!         Arc::new(PdfiumRasteriser::new(config.dpi, config.max_rendered_pixels)),
//!     );
//!     let trigger = serde_json::json!({"bucket": "trade-docs", "key": "inbox/lc.png"});
//!     let report = pipeline.run(&trigger, &mut rx).await?;
//!     println!("{}", serde_json::to_string_pretty(&report)?);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `tdv` binary (clap + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! trade-doc-validator = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod pipeline;
pub mod prompts;
pub mod retry;
pub mod service;
pub mod stats;
pub mod storage;
pub mod types;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    ModelTier, PipelineConfig, PipelineConfigBuilder, PriceTable, HARD_MAX_EXTRACTION_ATTEMPTS,
};
pub use error::{ModelCallError, StorageError, TradeDocError};
pub use pipeline::handlers::HandleOutcome;
pub use pipeline::model::{LlmVisionModel, ModelReply, ModelRequest, VisionModel};
pub use pipeline::render::{PdfRasteriser, PdfiumRasteriser, RenderedPage};
pub use pipeline::router::{HandlerKind, RoutingDecision};
pub use service::{Pipeline, RouteOutcome, RunReport};
pub use stats::{summarize, ProcessingStats};
pub use storage::{
    ChannelDispatcher, CommitOutcome, Dispatcher, LocalObjectStore, ObjectStore, QueueMessage,
    RecordStore, SqliteRecordStore,
};
pub use types::{
    AuditEntry, AuditStage, ClassificationResult, DocumentRef, DocumentType, ExtractionResult,
    FieldValue, MonetaryAmount, ProcessingRecord, Quality, TerminalState,
};
