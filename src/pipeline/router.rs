//! Routing: one handler per document, decided by file extension.
//!
//! The table is fixed in code and matched case-insensitively. Anything not
//! in it fails closed: the router returns [`RoutingDecision::Reject`] with a
//! reason, and the service persists a `REJECTED` record instead of
//! dispatching. A document is never silently dropped.

use crate::types::DocumentRef;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const IMAGE_EXTENSIONS: &[&str] =
    &["png", "jpg", "jpeg", "gif", "bmp", "tiff", "tif", "webp"];
pub const PDF_EXTENSIONS: &[&str] = &["pdf"];
/// Legacy binary `.doc` is absent: nothing here can read it, so it fails
/// closed. `.docx` text is pulled out of the archive by the text handler.
pub const TEXT_EXTENSIONS: &[&str] = &["txt", "docx", "rtf", "csv", "md"];
pub const TRADE_MESSAGE_EXTENSIONS: &[&str] = &["mt700", "mt710", "swift", "xml", "edi"];

/// The handler a routed document is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    VisionImage,
    PdfConvert,
    Text,
    SpecializedTrade,
}

impl HandlerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerKind::VisionImage => "vision_image",
            HandlerKind::PdfConvert => "pdf_convert",
            HandlerKind::Text => "text",
            HandlerKind::SpecializedTrade => "specialized_trade",
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exactly one of these per document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RoutingDecision {
    Dispatch { handler: HandlerKind },
    Reject { reason: String },
}

/// Decide the handler for a document.
pub fn route(document: &DocumentRef) -> RoutingDecision {
    let Some(ext) = document.extension() else {
        return RoutingDecision::Reject {
            reason: format!("'{}' has no file extension", document.key),
        };
    };
    match handler_for_extension(&ext) {
        Some(handler) => RoutingDecision::Dispatch { handler },
        None => RoutingDecision::Reject {
            reason: format!("unsupported file type '.{ext}'"),
        },
    }
}

/// Look up a lower- or mixed-case extension without the dot.
pub fn handler_for_extension(ext: &str) -> Option<HandlerKind> {
    let ext = ext.trim_start_matches('.').to_ascii_lowercase();
    let ext = ext.as_str();
    if IMAGE_EXTENSIONS.contains(&ext) {
        Some(HandlerKind::VisionImage)
    } else if PDF_EXTENSIONS.contains(&ext) {
        Some(HandlerKind::PdfConvert)
    } else if TEXT_EXTENSIONS.contains(&ext) {
        Some(HandlerKind::Text)
    } else if TRADE_MESSAGE_EXTENSIONS.contains(&ext) {
        Some(HandlerKind::SpecializedTrade)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routed(key: &str) -> RoutingDecision {
        route(&DocumentRef::new("b", key))
    }

    #[test]
    fn images_go_to_vision() {
        for key in ["a.png", "b.JPG", "c.jpeg", "scan.TIFF"] {
            assert_eq!(
                routed(key),
                RoutingDecision::Dispatch { handler: HandlerKind::VisionImage },
                "{key}"
            );
        }
    }

    #[test]
    fn pdf_text_and_trade_messages() {
        assert_eq!(
            routed("x/lc.pdf"),
            RoutingDecision::Dispatch { handler: HandlerKind::PdfConvert }
        );
        assert_eq!(
            routed("notes.txt"),
            RoutingDecision::Dispatch { handler: HandlerKind::Text }
        );
        assert_eq!(
            routed("swift/credit.MT700"),
            RoutingDecision::Dispatch { handler: HandlerKind::SpecializedTrade }
        );
    }

    #[test]
    fn word_documents() {
        assert_eq!(
            routed("inbox/lc.docx"),
            RoutingDecision::Dispatch { handler: HandlerKind::Text }
        );
        let RoutingDecision::Reject { reason } = routed("inbox/old.DOC") else {
            panic!("legacy .doc must fail closed");
        };
        assert!(reason.contains(".doc"));
    }

    #[test]
    fn unknown_and_missing_extensions_reject() {
        let RoutingDecision::Reject { reason } = routed("payload.exe") else {
            panic!("expected reject");
        };
        assert!(reason.contains(".exe"));
        assert!(matches!(routed("README"), RoutingDecision::Reject { .. }));
    }

    #[test]
    fn extension_tables_do_not_overlap() {
        let all = [IMAGE_EXTENSIONS, PDF_EXTENSIONS, TEXT_EXTENSIONS, TRADE_MESSAGE_EXTENSIONS];
        let mut seen = std::collections::HashSet::new();
        for ext in all.iter().flat_map(|t| t.iter()) {
            assert!(seen.insert(*ext), "duplicate extension {ext}");
        }
    }
}
