//! Payload preparation: raw object bytes → what the hosted model is shown.
//!
//! Images are sniffed by content, not by extension. PNG, JPEG, GIF and WebP
//! go to the model as-is; BMP and TIFF are re-encoded as PNG because vision
//! APIs do not accept them. PNG is the re-encoding target because it is
//! lossless: text crispness matters far more than file size for reading
//! small print on trade documents.
//!
//! Text documents are UTF-8, except `.docx`, whose body text (paragraphs
//! and table cells) is read out of the archive first.
//!
//! Bytes that are not a decodable image, or text that is not UTF-8, are
//! [`TradeDocError::DocumentUnreadable`].

use crate::error::TradeDocError;
use crate::types::DocumentPayload;
use docx_rs::{
    DocumentChild, Paragraph, ParagraphChild, RunChild, Table, TableCellContent, TableChild,
    TableRowChild,
};
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use tracing::debug;

/// PNG-encode a decoded image.
pub fn png_bytes(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}

/// Validate image bytes and wrap them for the model.
pub fn image_payload(bytes: Vec<u8>, key: &str) -> Result<DocumentPayload, TradeDocError> {
    let unreadable = |detail: String| TradeDocError::DocumentUnreadable {
        key: key.to_string(),
        detail,
    };
    let format = image::guess_format(&bytes).map_err(|e| unreadable(e.to_string()))?;
    let decoded = image::load_from_memory_with_format(&bytes, format)
        .map_err(|e| unreadable(format!("cannot decode {:?} image: {}", format, e)))?;

    let mime = match format {
        ImageFormat::Png => "image/png",
        ImageFormat::Jpeg => "image/jpeg",
        ImageFormat::Gif => "image/gif",
        ImageFormat::WebP => "image/webp",
        other => {
            let png = png_bytes(&decoded).map_err(|e| unreadable(e.to_string()))?;
            debug!("Re-encoded {:?} '{}' as PNG ({} bytes)", other, key, png.len());
            return Ok(DocumentPayload::Image {
                data: png,
                mime: "image/png".to_string(),
            });
        }
    };
    Ok(DocumentPayload::Image {
        data: bytes,
        mime: mime.to_string(),
    })
}

/// Decode a text document; empty or non-UTF-8 content is unreadable.
pub fn text_payload(bytes: Vec<u8>, key: &str) -> Result<DocumentPayload, TradeDocError> {
    let text = if key.to_ascii_lowercase().ends_with(".docx") {
        docx_text(&bytes, key)?
    } else {
        String::from_utf8(bytes).map_err(|e| TradeDocError::DocumentUnreadable {
            key: key.to_string(),
            detail: format!("not valid UTF-8 text: {e}"),
        })?
    };
    let text = text.trim_start_matches('\u{feff}');
    if text.trim().is_empty() {
        return Err(TradeDocError::DocumentUnreadable {
            key: key.to_string(),
            detail: "document is empty".into(),
        });
    }
    Ok(DocumentPayload::Text(text.to_string()))
}

/// Body text of a Word document: one line per paragraph, table cells
/// joined with ` | ` one row per line.
fn docx_text(bytes: &[u8], key: &str) -> Result<String, TradeDocError> {
    let docx = docx_rs::read_docx(bytes).map_err(|e| TradeDocError::DocumentUnreadable {
        key: key.to_string(),
        detail: format!("cannot read Word document: {e}"),
    })?;
    let mut text = String::new();
    for child in &docx.document.children {
        match child {
            DocumentChild::Paragraph(p) => {
                push_paragraph(&mut text, p);
                text.push('\n');
            }
            DocumentChild::Table(t) => push_table(&mut text, t),
            _ => {}
        }
    }
    debug!("Read {} chars of text from '{}'", text.len(), key);
    Ok(text)
}

fn push_paragraph(out: &mut String, paragraph: &Paragraph) {
    for child in &paragraph.children {
        if let ParagraphChild::Run(run) = child {
            for piece in &run.children {
                match piece {
                    RunChild::Text(t) => out.push_str(&t.text),
                    RunChild::Tab(_) => out.push('\t'),
                    _ => {}
                }
            }
        }
    }
}

#[allow(irrefutable_let_patterns)]
fn push_table(out: &mut String, table: &Table) {
    for row in &table.rows {
        let TableChild::TableRow(row) = row else {
            continue;
        };
        let mut cells = Vec::new();
        for cell in &row.cells {
            let TableRowChild::TableCell(cell) = cell else {
                continue;
            };
            let mut content = String::new();
            for item in &cell.children {
                match item {
                    TableCellContent::Paragraph(p) => {
                        if !content.is_empty() {
                            content.push(' ');
                        }
                        push_paragraph(&mut content, p);
                    }
                    TableCellContent::Table(nested) => push_table(&mut content, nested),
                    _ => {}
                }
            }
            cells.push(content.trim().to_string());
        }
        out.push_str(&cells.join(" | "));
        out.push('\n');
    }
}

/// Coarse image-quality hint from the byte size, kept as training metadata.
pub fn image_quality_score(byte_len: usize) -> f64 {
    match byte_len {
        n if n < 50 * 1024 => 0.3,
        n if n > 500 * 1024 => 0.9,
        _ => 0.6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn sample(format: ImageFormat) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, Rgba([255, 0, 0, 255])));
        let mut buf = Vec::new();
        let img = if format == ImageFormat::Jpeg {
            DynamicImage::ImageRgb8(img.to_rgb8())
        } else {
            img
        };
        img.write_to(&mut Cursor::new(&mut buf), format).unwrap();
        buf
    }

    #[test]
    fn png_passes_through() {
        let bytes = sample(ImageFormat::Png);
        let payload = image_payload(bytes.clone(), "a.png").unwrap();
        assert_eq!(
            payload,
            DocumentPayload::Image {
                data: bytes,
                mime: "image/png".into()
            }
        );
    }

    #[test]
    fn jpeg_keeps_mime() {
        let DocumentPayload::Image { mime, .. } =
            image_payload(sample(ImageFormat::Jpeg), "a.jpg").unwrap()
        else {
            panic!("expected image");
        };
        assert_eq!(mime, "image/jpeg");
    }

    #[test]
    fn bmp_reencoded_as_png() {
        let DocumentPayload::Image { data, mime } =
            image_payload(sample(ImageFormat::Bmp), "a.bmp").unwrap()
        else {
            panic!("expected image");
        };
        assert_eq!(mime, "image/png");
        assert_eq!(image::guess_format(&data).unwrap(), ImageFormat::Png);
    }

    #[test]
    fn garbage_is_unreadable() {
        let err = image_payload(b"definitely not an image".to_vec(), "x.png").unwrap_err();
        assert!(matches!(err, TradeDocError::DocumentUnreadable { .. }));
        let mut truncated = sample(ImageFormat::Png);
        truncated.truncate(20);
        assert!(image_payload(truncated, "t.png").is_err());
    }

    #[test]
    fn text_rules() {
        assert_eq!(
            text_payload(":20:LC123".as_bytes().to_vec(), "m.mt700").unwrap(),
            DocumentPayload::Text(":20:LC123".into())
        );
        assert!(text_payload(vec![0xff, 0xfe, 0x00], "bad.txt").is_err());
        assert!(text_payload(b"   \n".to_vec(), "empty.txt").is_err());
    }

    fn word_document(body: &str, cells: [&str; 2]) -> Vec<u8> {
        use docx_rs::{Docx, Run, TableCell, TableRow};
        let cell = |text: &str| {
            TableCell::new().add_paragraph(Paragraph::new().add_run(Run::new().add_text(text)))
        };
        let mut buf = Cursor::new(Vec::new());
        Docx::new()
            .add_paragraph(Paragraph::new().add_run(Run::new().add_text(body)))
            .add_table(Table::new(vec![TableRow::new(vec![cell(cells[0]), cell(cells[1])])]))
            .build()
            .pack(&mut buf)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn docx_body_and_tables_become_text() {
        let bytes = word_document(
            "IRREVOCABLE DOCUMENTARY CREDIT LC-2024-00123",
            ["Amount", "EUR 150,000.00"],
        );
        let DocumentPayload::Text(text) = text_payload(bytes, "inbox/LC.DOCX").unwrap() else {
            panic!("expected text");
        };
        assert!(text.contains("IRREVOCABLE DOCUMENTARY CREDIT LC-2024-00123"));
        assert!(text.contains("Amount | EUR 150,000.00"));
    }

    #[test]
    fn broken_docx_is_unreadable() {
        let mut zip_header = b"PK\x03\x04".to_vec();
        zip_header.extend_from_slice(&[0u8; 26]);
        let err = text_payload(zip_header, "inbox/lc.docx").unwrap_err();
        let TradeDocError::DocumentUnreadable { detail, .. } = err else {
            panic!("expected unreadable");
        };
        assert!(detail.contains("Word document"));
    }

    #[test]
    fn quality_buckets() {
        assert_eq!(image_quality_score(10 * 1024), 0.3);
        assert_eq!(image_quality_score(100 * 1024), 0.6);
        assert_eq!(image_quality_score(600 * 1024), 0.9);
    }
}
