//! Pipeline stages for trade-document validation.
//!
//! Each submodule implements exactly one step. The stages before the model
//! call and after it are pure functions over bytes or JSON, so they are
//! tested without a network or a provider.
//!
//! ## Data Flow
//!
//! ```text
//! trigger ──▶ router ──▶ handlers ──▶ render/encode ──▶ extractor ──▶ (commit)
//!  (shape)    (ext)      (per kind)    (pdfium/png)      │    ▲
//!                                                         ▼    │
//!                                                  model ──▶ parse ──▶ normalize ──▶ quality
//! ```
//!
//! 1. [`trigger`]  — normalise the three inbound payload shapes
//! 2. [`router`]   — extension table → one handler, or fail closed
//! 3. [`handlers`] — fetch bytes, split PDFs into pages, run the extractor
//! 4. [`render`]   — rasterise PDF pages in `spawn_blocking`; pdfium is not async-safe
//! 5. [`encode`]   — validate image/text bytes into a model payload
//! 6. [`extractor`] — the Classifying → Escalating → Extracting → Done machine
//! 7. [`model`]    — the only stage with network I/O; infra retry/backoff
//! 8. [`parse`]    — tolerant JSON recovery from free-text replies
//! 9. [`normalize`] — money strings to fixed-point decimals
//! 10. [`quality`] — critical-field gate per document type

pub mod encode;
pub mod extractor;
pub mod handlers;
pub mod model;
pub mod normalize;
pub mod parse;
pub mod quality;
pub mod render;
pub mod router;
pub mod trigger;
