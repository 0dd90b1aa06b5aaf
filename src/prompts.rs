//! Prompts for document classification and field extraction.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth**: the JSON shapes the parsers in
//!    [`crate::pipeline::parse`] expect are described in exactly one place.
//!
//! 2. **Testability**: unit tests inspect prompts directly without a model,
//!    so a prompt that stops asking for a critical field is caught early.

use crate::types::DocumentType;

/// Classification prompt sent to the cheap tier first and, on escalation,
/// to the capable tier.
pub const CLASSIFIER_PROMPT: &str = r#"You are a trade-finance document classifier. Look at the document and decide which type it is.

Document types:
- LETTER_OF_CREDIT: documentary credit / LC issued by a bank (SWIFT MT700 style fields, "irrevocable", "documentary credit", applicant, beneficiary, issuing bank)
- COMMERCIAL_INVOICE: seller's invoice for goods (invoice number, seller, buyer, line items, total amount)
- BILL_OF_LADING: carrier's receipt for shipped goods (B/L number, shipper, consignee, vessel, ports)
- PACKING_LIST: packages, weights and marks of a shipment
- CERTIFICATE: certificate of origin, inspection, insurance or quality
- OTHER: anything else

Respond with ONLY a JSON object, no prose:
{
  "document_type": "LETTER_OF_CREDIT",
  "confidence": 0.95,
  "complexity_score": 0.4,
  "reasoning": "one sentence explaining the decision",
  "key_indicators": ["phrases or fields you relied on"],
  "alternative_types": ["other plausible types"]
}

"confidence" is a number between 0.0 and 1.0. Be honest: use a low value when the document is unclear, partial or not a trade document."#;

/// Extraction prompt for letters of credit.
pub const LETTER_OF_CREDIT_PROMPT: &str = r#"Extract the fields of this LETTER OF CREDIT.

Return ONLY a JSON object of this shape:
{
  "extracted_fields": {
    "lc_number": "",
    "issue_date": "YYYY-MM-DD",
    "expiry_date": "YYYY-MM-DD",
    "expiry_place": "",
    "applicant": "",
    "beneficiary": "",
    "issuing_bank": "",
    "advising_bank": "",
    "credit_amount": "amount exactly as written, with currency",
    "currency": "ISO 4217 code",
    "available_with": "",
    "available_by": "",
    "shipment_from": "",
    "shipment_to": "",
    "partial_shipments": "",
    "transhipment": "",
    "latest_shipment_date": "YYYY-MM-DD",
    "required_documents": [],
    "payment_terms": "",
    "charges": ""
  },
  "confidence": 0.0,
  "extraction_notes": "anything unclear or missing"
}

Copy amounts exactly as printed; do not convert or round them. Use null for fields that are not present."#;

/// Extraction prompt for commercial invoices.
pub const COMMERCIAL_INVOICE_PROMPT: &str = r#"Extract the fields of this COMMERCIAL INVOICE.

Return ONLY a JSON object of this shape:
{
  "extracted_fields": {
    "invoice_number": "",
    "invoice_date": "YYYY-MM-DD",
    "seller": "",
    "buyer": "",
    "lc_reference": "",
    "incoterms": "",
    "currency": "ISO 4217 code",
    "line_items": [
      {"description": "", "quantity": 0, "unit_price": "", "amount": ""}
    ],
    "subtotal_amount": "",
    "total_amount": "amount exactly as written, with currency",
    "country_of_origin": ""
  },
  "confidence": 0.0,
  "extraction_notes": "anything unclear or missing"
}

Copy amounts exactly as printed; do not convert or round them. Use null for fields that are not present."#;

/// Extraction prompt for bills of lading.
pub const BILL_OF_LADING_PROMPT: &str = r#"Extract the fields of this BILL OF LADING.

Return ONLY a JSON object of this shape:
{
  "extracted_fields": {
    "bill_of_lading_number": "",
    "shipper": "",
    "consignee": "",
    "notify_party": "",
    "carrier": "",
    "vessel": "",
    "voyage_number": "",
    "port_of_loading": "",
    "port_of_discharge": "",
    "place_of_delivery": "",
    "shipped_on_board_date": "YYYY-MM-DD",
    "goods_description": "",
    "number_of_packages": "",
    "gross_weight": "",
    "freight_terms": ""
  },
  "confidence": 0.0,
  "extraction_notes": "anything unclear or missing"
}

Use null for fields that are not present."#;

/// Fallback extraction prompt for every other document type.
pub const GENERIC_EXTRACTION_PROMPT: &str = r#"Extract the key information from this trade document.

Return ONLY a JSON object of this shape:
{
  "extracted_fields": {
    "document_number": "",
    "document_date": "YYYY-MM-DD",
    "issuer": "",
    "recipient": "",
    "references": [],
    "amounts": [{"label": "", "amount": ""}],
    "parties": [],
    "key_terms": []
  },
  "confidence": 0.0,
  "extraction_notes": "anything unclear or missing"
}

Copy amounts exactly as printed. Use null for fields that are not present."#;

/// Pick the extraction prompt for a classified type; generic when none fits.
pub fn extraction_prompt(document_type: DocumentType) -> &'static str {
    match document_type {
        DocumentType::LetterOfCredit => LETTER_OF_CREDIT_PROMPT,
        DocumentType::CommercialInvoice => COMMERCIAL_INVOICE_PROMPT,
        DocumentType::BillOfLading => BILL_OF_LADING_PROMPT,
        DocumentType::PackingList | DocumentType::Certificate | DocumentType::Other => {
            GENERIC_EXTRACTION_PROMPT
        }
    }
}

/// Prompt text for a text payload: the instructions followed by the document.
pub fn with_document_text(prompt: &str, text: &str) -> String {
    format!("{prompt}\n\n--- DOCUMENT TEXT ---\n{text}\n--- END DOCUMENT TEXT ---")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::quality::critical_fields;

    #[test]
    fn every_critical_field_is_requested_by_its_prompt() {
        for t in DocumentType::ALL {
            let prompt = extraction_prompt(t);
            for field in critical_fields(t) {
                assert!(
                    prompt.contains(&format!("\"{field}\"")),
                    "{t} prompt does not ask for {field}"
                );
            }
        }
    }

    #[test]
    fn classifier_lists_every_type() {
        for t in DocumentType::ALL {
            assert!(CLASSIFIER_PROMPT.contains(t.as_str()), "missing {t}");
        }
    }

    #[test]
    fn text_payload_wraps_document() {
        let p = with_document_text("Extract.", ":20:LC123");
        assert!(p.starts_with("Extract."));
        assert!(p.contains(":20:LC123"));
    }
}
