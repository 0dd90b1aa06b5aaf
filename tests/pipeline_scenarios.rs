//! Pipeline integration tests: trigger in, records and audit trail out,
//! with a scripted model standing in for the hosted one.
//!
//! Run with:
//!   cargo test --test pipeline_scenarios

mod common;

use bigdecimal::BigDecimal;
use common::*;
use serde_json::json;
use std::str::FromStr;
use trade_doc_validator::types::derive_document_id;
use trade_doc_validator::{
    AuditStage, DocumentType, HandleOutcome, HandlerKind, ModelTier, PipelineConfig, Quality,
    RecordStore, RouteOutcome, TerminalState, TradeDocError,
};

use ModelTier::{Capable, Cheap};

fn decimal(s: &str) -> BigDecimal {
    BigDecimal::from_str(s).unwrap()
}

async fn run_image(h: &mut Harness, key: &str) -> String {
    h.put("trade-docs", key, sample_png()).await;
    let report = h
        .pipeline
        .run(&json!({"bucket": "trade-docs", "key": key}), &mut h.rx)
        .await
        .unwrap();
    assert_eq!(report.handled.len(), 1, "{report:?}");
    derive_document_id("trade-docs", key)
}

// ── Escalation scenarios ─────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_a_confident_lc_extracts_on_cheap() {
    let model = ScriptedModel::new()
        .classify(Cheap, &classification("LETTER_OF_CREDIT", 0.96))
        .extract(Cheap, LC_COMPLETE);
    let mut h = Harness::new(model);
    let id = run_image(&mut h, "inbox/lc.png").await;

    let record = h.records.get_record(&id).await.unwrap().unwrap();
    assert_eq!(record.state, TerminalState::Extracted);
    assert_eq!(record.quality, Some(Quality::Complete));
    assert_eq!(record.attempt_count, 1);
    assert!(!record.escalated);
    assert_eq!(
        record.classification.as_ref().unwrap().document_type,
        DocumentType::LetterOfCredit
    );
    assert_eq!(
        h.model.calls(),
        vec![(Cheap, CallKind::Classification), (Cheap, CallKind::Extraction)]
    );
    assert_eq!(record.costs.note, "used cheap model");
    assert!(record.image_quality_score.is_some());
}

#[tokio::test]
async fn scenario_b_uncertain_classification_escalates_once() {
    let model = ScriptedModel::new()
        .classify(Cheap, &classification("LETTER_OF_CREDIT", 0.78))
        .classify(Capable, &classification("LETTER_OF_CREDIT", 0.95))
        .extract(Capable, LC_COMPLETE);
    let mut h = Harness::new(model);
    let id = run_image(&mut h, "inbox/lc.png").await;

    let record = h.records.get_record(&id).await.unwrap().unwrap();
    assert_eq!(record.state, TerminalState::Extracted);
    assert!(record.escalated);
    assert_eq!(record.attempt_count, 1);
    assert_eq!(h.model.count_tier(Capable, CallKind::Classification), 1);
    assert_eq!(h.model.count_tier(Capable, CallKind::Extraction), 1);
    assert_eq!(h.model.count_tier(Cheap, CallKind::Extraction), 0);
    assert_eq!(record.classification.unwrap().tier, Capable);
    assert_eq!(record.costs.note, "escalated for accuracy");
}

#[tokio::test]
async fn scenario_c_missing_amount_retries_on_capable() {
    let model = ScriptedModel::new()
        .classify(Cheap, &classification("LETTER_OF_CREDIT", 0.93))
        .extract(Cheap, LC_NO_AMOUNT)
        .extract(Capable, LC_COMPLETE);
    let mut h = Harness::new(model);
    let id = run_image(&mut h, "inbox/lc.png").await;

    let record = h.records.get_record(&id).await.unwrap().unwrap();
    assert_eq!(record.state, TerminalState::Extracted);
    assert_eq!(record.attempt_count, 2);
    assert!(!record.escalated);
    assert_eq!(
        h.model.calls(),
        vec![
            (Cheap, CallKind::Classification),
            (Cheap, CallKind::Extraction),
            (Capable, CallKind::Extraction),
        ]
    );

    let trail = h.records.audit_trail(&id).await.unwrap();
    assert!(trail.iter().any(|a| a.stage == AuditStage::Retry));
}

#[tokio::test]
async fn scenario_d_low_confidence_rejected_without_extraction() {
    let model = ScriptedModel::new().classify(Cheap, &classification("OTHER", 0.24));
    let mut h = Harness::new(model);
    let id = run_image(&mut h, "inbox/photo.png").await;

    let record = h.records.get_record(&id).await.unwrap().unwrap();
    assert_eq!(record.state, TerminalState::Rejected);
    assert_eq!(record.attempt_count, 0);
    assert!(record.extraction.is_none());
    assert_eq!(h.model.count(CallKind::Extraction), 0);
    assert_eq!(h.model.count(CallKind::Classification), 1);
}

#[tokio::test]
async fn two_incomplete_attempts_degrade_without_third_call() {
    let model = ScriptedModel::new()
        .classify(Cheap, &classification("LETTER_OF_CREDIT", 0.9))
        .extract(Cheap, LC_NO_AMOUNT)
        .extract(Capable, LC_ONLY_NUMBER);
    let mut h = Harness::new(model);
    let id = run_image(&mut h, "inbox/lc.png").await;

    let record = h.records.get_record(&id).await.unwrap().unwrap();
    assert_eq!(record.state, TerminalState::ExtractedDegraded);
    assert_eq!(record.quality, Some(Quality::Degraded));
    assert_eq!(record.attempt_count, 2);
    assert_eq!(h.model.count(CallKind::Extraction), 2);
    // the first attempt had more critical fields, so it is the one kept
    let extraction = record.extraction.unwrap();
    assert!(extraction.fields.contains_key("beneficiary"));
    assert!(record
        .quality_issues
        .iter()
        .any(|i| i.contains("credit_amount")));
}

#[tokio::test]
async fn failed_extraction_calls_still_bounded_at_two() {
    let model = ScriptedModel::new()
        .classify(Cheap, &classification("COMMERCIAL_INVOICE", 0.95))
        .fail_extraction(Cheap)
        .fail_extraction(Capable);
    let mut h = Harness::new(model);
    let id = run_image(&mut h, "inbox/inv.png").await;

    let record = h.records.get_record(&id).await.unwrap().unwrap();
    assert_eq!(record.state, TerminalState::ExtractedDegraded);
    assert_eq!(record.attempt_count, 2);
    assert_eq!(h.model.count(CallKind::Extraction), 2);
    assert_eq!(record.costs.total, decimal("0.0005") + decimal("0.0005") + decimal("0.006"));
}

#[tokio::test]
async fn single_attempt_config_never_retries() {
    let config = PipelineConfig::builder()
        .max_extraction_attempts(1)
        .retry_backoff_ms(1)
        .build()
        .unwrap();
    let model = ScriptedModel::new()
        .classify(Cheap, &classification("LETTER_OF_CREDIT", 0.9))
        .extract(Cheap, LC_NO_AMOUNT);
    let mut h = Harness::with(model, config, 1);
    let id = run_image(&mut h, "inbox/lc.png").await;

    let record = h.records.get_record(&id).await.unwrap().unwrap();
    assert_eq!(record.state, TerminalState::ExtractedDegraded);
    assert_eq!(record.attempt_count, 1);
    assert_eq!(h.model.count(CallKind::Extraction), 1);
}

#[tokio::test]
async fn truncated_classification_is_other_with_zero_confidence() {
    let model =
        ScriptedModel::new().classify(Cheap, "Sure! ```json\n{\"document_type\": \"LETTER_OF");
    let mut h = Harness::new(model);
    let id = run_image(&mut h, "inbox/blurry.png").await;

    let record = h.records.get_record(&id).await.unwrap().unwrap();
    let classification = record.classification.unwrap();
    assert_eq!(classification.document_type, DocumentType::Other);
    assert_eq!(classification.confidence, 0.0);
    assert!(classification.malformed);
    assert_eq!(record.state, TerminalState::Rejected);
    assert_eq!(h.model.count(CallKind::Extraction), 0);
}

#[tokio::test]
async fn classification_outage_leaves_no_record() {
    let model = ScriptedModel::new().fail_classification(Cheap);
    let mut h = Harness::new(model);
    h.put("trade-docs", "inbox/lc.png", sample_png()).await;

    let err = h
        .pipeline
        .run(&json!({"bucket": "trade-docs", "key": "inbox/lc.png"}), &mut h.rx)
        .await
        .unwrap_err();
    assert!(matches!(err, TradeDocError::ModelUnavailable { .. }));
    assert!(err.is_transient());

    let id = derive_document_id("trade-docs", "inbox/lc.png");
    assert!(h.records.get_record(&id).await.unwrap().is_none());
    assert!(h.records.audit_trail(&id).await.unwrap().is_empty());
}

// ── Money and costs ──────────────────────────────────────────────────────────

#[tokio::test]
async fn credit_amount_is_exact_decimal_after_persistence() {
    let model = ScriptedModel::new()
        .classify(Cheap, &classification("LETTER_OF_CREDIT", 0.96))
        .extract(Cheap, LC_COMPLETE);
    let mut h = Harness::new(model);
    let id = run_image(&mut h, "inbox/lc.png").await;

    let record = h.records.get_record(&id).await.unwrap().unwrap();
    let fields = record.extraction.unwrap().fields;
    let amount = fields["credit_amount"].as_amount().unwrap();
    assert_eq!(amount.amount, decimal("150000.00"));
    assert_eq!(amount.amount.to_string(), "150000.00");
    assert_eq!(amount.currency.as_deref(), Some("EUR"));
}

#[tokio::test]
async fn numeric_amounts_keep_scale_and_every_digit() {
    let model = ScriptedModel::new()
        .classify(Cheap, &classification("LETTER_OF_CREDIT", 0.96))
        .extract(Cheap, LC_NUMERIC_AMOUNTS);
    let mut h = Harness::new(model);
    let id = run_image(&mut h, "inbox/lc_numeric.png").await;

    let record = h.records.get_record(&id).await.unwrap().unwrap();
    assert_eq!(record.state, TerminalState::Extracted);
    let fields = record.extraction.unwrap().fields;

    let credit = fields["credit_amount"].as_amount().unwrap();
    assert_eq!(credit.amount.to_string(), "150000.00");
    assert_eq!(credit.amount.as_bigint_and_exponent().1, 2);
    assert_eq!(credit.currency.as_deref(), Some("USD"));

    let tolerance = fields["tolerance_amount"].as_amount().unwrap();
    assert_eq!(tolerance.amount, decimal("98765432109876543.21"));
    assert_eq!(tolerance.amount.to_string(), "98765432109876543.21");
}

#[tokio::test]
async fn cost_total_matches_audit_rows() {
    let model = ScriptedModel::new()
        .classify(Cheap, &classification("LETTER_OF_CREDIT", 0.93))
        .extract(Cheap, LC_NO_AMOUNT)
        .extract(Capable, LC_COMPLETE);
    let mut h = Harness::new(model);
    let id = run_image(&mut h, "inbox/lc.png").await;

    let record = h.records.get_record(&id).await.unwrap().unwrap();
    let trail = h.records.audit_trail(&id).await.unwrap();
    let audited: BigDecimal = trail.iter().map(|a| a.cost.clone()).sum();
    assert_eq!(record.costs.total, audited);
    assert_eq!(record.costs.total, decimal("0.007"));
    assert_eq!(record.costs.classification, decimal("0.0005"));
    assert_eq!(record.costs.extraction, decimal("0.0065"));
    assert_eq!(record.costs.per_call.len(), 3);

    let sequences: Vec<u32> = trail.iter().map(|a| a.sequence).collect();
    assert_eq!(sequences, (1..=trail.len() as u32).collect::<Vec<_>>());
    assert_eq!(trail.last().unwrap().stage, AuditStage::Outcome);
}

// ── Idempotency ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn redelivery_writes_nothing_and_calls_no_model() {
    let model = ScriptedModel::new()
        .classify(Cheap, &classification("LETTER_OF_CREDIT", 0.96))
        .extract(Cheap, LC_COMPLETE);
    let mut h = Harness::new(model);
    let id = run_image(&mut h, "inbox/lc.png").await;
    let trail_before = h.records.audit_trail(&id).await.unwrap();

    let body = json!({"bucket": "trade-docs", "key": "inbox/lc.png"}).to_string();
    let trigger = json!({"Records": [{"body": body}]});
    let report = h.pipeline.run(&trigger, &mut h.rx).await.unwrap();
    assert_eq!(
        report.handled,
        vec![HandleOutcome::AlreadyRecorded { document_id: id.clone() }]
    );
    assert_eq!(h.model.calls().len(), 2);
    assert_eq!(h.records.audit_trail(&id).await.unwrap(), trail_before);
}

// ── Routing ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn router_dispatches_by_extension_and_rejects_unknown() {
    let mut h = Harness::new(ScriptedModel::new());
    let event = json!({"Records": [
        {"s3": {"bucket": {"name": "trade-docs"}, "object": {"key": "inbox/scan.JPG"}}},
        {"s3": {"bucket": {"name": "trade-docs"}, "object": {"key": "inbox/lc.pdf"}}},
        {"s3": {"bucket": {"name": "trade-docs"}, "object": {"key": "inbox/notes.txt"}}},
        {"s3": {"bucket": {"name": "trade-docs"}, "object": {"key": "inbox/payload.exe"}}},
    ]});
    let routed = h.pipeline.accept(&event).await.unwrap();
    assert_eq!(routed.len(), 4);

    let mut dispatched = Vec::new();
    while let Ok(message) = h.rx.try_recv() {
        dispatched.push((message.key, message.routing_decision));
    }
    assert_eq!(
        dispatched,
        vec![
            ("inbox/scan.JPG".to_string(), HandlerKind::VisionImage),
            ("inbox/lc.pdf".to_string(), HandlerKind::PdfConvert),
            ("inbox/notes.txt".to_string(), HandlerKind::Text),
        ]
    );

    let RouteOutcome::Rejected { document_id, reason, .. } = &routed[3] else {
        panic!("expected reject, got {:?}", routed[3]);
    };
    assert!(reason.contains(".exe"));
    let record = h.records.get_record(document_id).await.unwrap().unwrap();
    assert_eq!(record.state, TerminalState::Rejected);
    let trail = h.records.audit_trail(document_id).await.unwrap();
    assert_eq!(trail[0].stage, AuditStage::Routing);
    assert!(h.model.calls().is_empty());
}

#[tokio::test]
async fn inline_trade_message_goes_to_specialized_handler() {
    let model = ScriptedModel::new()
        .classify(Cheap, &classification("LETTER_OF_CREDIT", 0.91))
        .extract(Cheap, LC_COMPLETE);
    let mut h = Harness::new(model);
    let trigger =
        json!({"key": "swift/lc.mt700", "content": ":20:LC-2024-00123\n:32B:EUR150000,00"});
    let report = h.pipeline.run(&trigger, &mut h.rx).await.unwrap();

    assert!(matches!(
        &report.routed[0],
        RouteOutcome::Dispatched { handler: HandlerKind::SpecializedTrade, .. }
    ));
    let id = derive_document_id("inline", "swift/lc.mt700");
    let record = h.records.get_record(&id).await.unwrap().unwrap();
    assert_eq!(record.state, TerminalState::Extracted);
    assert!(h.dir.path().join("objects/inline/swift/lc.mt700").exists());
}

// ── Word documents ───────────────────────────────────────────────────────────

#[tokio::test]
async fn word_document_is_routed_to_text_and_extracted() {
    let model = ScriptedModel::new()
        .classify(Cheap, &classification("LETTER_OF_CREDIT", 0.92))
        .extract(Cheap, LC_COMPLETE);
    let mut h = Harness::new(model);
    let body = "IRREVOCABLE DOCUMENTARY CREDIT\nLC-2024-00123\nEUR 150,000.00";
    h.put("trade-docs", "inbox/lc.docx", word_document(body)).await;
    let report = h
        .pipeline
        .run(&json!({"bucket": "trade-docs", "key": "inbox/lc.docx"}), &mut h.rx)
        .await
        .unwrap();

    assert!(matches!(
        &report.routed[0],
        RouteOutcome::Dispatched { handler: HandlerKind::Text, .. }
    ));
    let id = derive_document_id("trade-docs", "inbox/lc.docx");
    let record = h.records.get_record(&id).await.unwrap().unwrap();
    assert_eq!(record.state, TerminalState::Extracted);
    assert_eq!(h.model.count(CallKind::Classification), 1);
}

#[tokio::test]
async fn corrupt_word_document_is_unreadable_and_legacy_doc_rejected() {
    let mut h = Harness::new(ScriptedModel::new());
    let mut zip_header = b"PK\x03\x04".to_vec();
    zip_header.extend_from_slice(&[0u8; 26]);
    h.put("trade-docs", "inbox/broken.docx", zip_header).await;
    h.put("trade-docs", "inbox/old.doc", b"\xd0\xcf\x11\xe0\xa1\xb1\x1a\xe1".to_vec()).await;
    let trigger = json!({"Records": [
        {"s3": {"bucket": {"name": "trade-docs"}, "object": {"key": "inbox/broken.docx"}}},
        {"s3": {"bucket": {"name": "trade-docs"}, "object": {"key": "inbox/old.doc"}}},
    ]});
    h.pipeline.run(&trigger, &mut h.rx).await.unwrap();

    let id = |key: &str| derive_document_id("trade-docs", key);
    let broken = h.records.get_record(&id("inbox/broken.docx")).await.unwrap().unwrap();
    assert_eq!(broken.state, TerminalState::Unreadable);
    let old = h.records.get_record(&id("inbox/old.doc")).await.unwrap().unwrap();
    assert_eq!(old.state, TerminalState::Rejected);
    assert!(h.model.calls().is_empty());
}

// ── Unreadable input ─────────────────────────────────────────────────────────

#[tokio::test]
async fn corrupt_pdf_is_unreadable_without_model_call() {
    let mut h = Harness::new(ScriptedModel::new());
    h.put("trade-docs", "inbox/bad.pdf", b"this is not a pdf at all".to_vec()).await;
    let report = h
        .pipeline
        .run(&json!({"bucket": "trade-docs", "key": "inbox/bad.pdf"}), &mut h.rx)
        .await
        .unwrap();

    let id = derive_document_id("trade-docs", "inbox/bad.pdf");
    assert_eq!(
        report.handled,
        vec![HandleOutcome::Recorded { document_id: id.clone(), state: TerminalState::Unreadable }]
    );
    let record = h.records.get_record(&id).await.unwrap().unwrap();
    assert_eq!(record.state, TerminalState::Unreadable);
    assert_eq!(record.costs.total, decimal("0"));
    assert!(h.model.calls().is_empty());
}

#[tokio::test]
async fn corrupt_image_and_missing_object_are_unreadable() {
    let mut h = Harness::new(ScriptedModel::new());
    h.put("trade-docs", "inbox/broken.png", b"\x89PNG\r\n\x1a\ntruncated".to_vec()).await;
    let trigger = json!({"Records": [
        {"s3": {"bucket": {"name": "trade-docs"}, "object": {"key": "inbox/broken.png"}}},
        {"s3": {"bucket": {"name": "trade-docs"}, "object": {"key": "inbox/gone.png"}}},
    ]});
    h.pipeline.run(&trigger, &mut h.rx).await.unwrap();

    for key in ["inbox/broken.png", "inbox/gone.png"] {
        let record = h
            .records
            .get_record(&derive_document_id("trade-docs", key))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, TerminalState::Unreadable, "{key}");
    }
    assert!(h.model.calls().is_empty());
}

// ── PDF conversion ───────────────────────────────────────────────────────────

#[tokio::test]
async fn pdf_pages_are_stored_and_processed_as_images() {
    let model = ScriptedModel::new()
        .classify(Cheap, &classification("LETTER_OF_CREDIT", 0.95))
        .classify(Cheap, &classification("LETTER_OF_CREDIT", 0.95))
        .extract(Cheap, LC_COMPLETE)
        .extract(Cheap, LC_COMPLETE);
    let mut h = Harness::with(model, fast_config(), 2);
    h.put("trade-docs", "inbox/lc.pdf", minimal_pdf()).await;

    let report = h
        .pipeline
        .run(&json!({"bucket": "trade-docs", "key": "inbox/lc.pdf"}), &mut h.rx)
        .await
        .unwrap();

    let pdf_id = derive_document_id("trade-docs", "inbox/lc.pdf");
    assert!(report
        .handled
        .contains(&HandleOutcome::Converted { document_id: pdf_id.clone(), pages: 2 }));
    assert!(h.records.get_record(&pdf_id).await.unwrap().is_none());

    let trail = h.records.audit_trail(&pdf_id).await.unwrap();
    assert_eq!(trail[0].stage, AuditStage::Routing);
    let pages: Vec<_> = trail
        .iter()
        .filter(|row| row.stage == AuditStage::Conversion)
        .collect();
    assert_eq!(pages.len(), 2);
    let first_page = derive_document_id("trade-docs", "inbox/lc_page_001.png");
    assert!(pages[0].detail.contains(&first_page), "{:?}", pages[0]);

    for n in 1..=2u32 {
        let key = format!("inbox/lc_page_{n:03}.png");
        assert!(h.dir.path().join("objects/trade-docs").join(&key).exists());
        let record = h
            .records
            .get_record(&derive_document_id("trade-docs", &key))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, TerminalState::Extracted);
        let source = record.source.unwrap();
        assert_eq!(source.kind, "pdf_conversion");
        assert_eq!(source.original_key, "inbox/lc.pdf");
        assert_eq!(source.page_number, Some(n));
        assert_eq!(source.total_pages, Some(2));
    }
    assert_eq!(h.model.count(CallKind::Classification), 2);
}
