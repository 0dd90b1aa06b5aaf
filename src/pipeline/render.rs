//! PDF rasterisation: every page to a PNG at a fixed resolution via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async contexts.
//! `tokio::task::spawn_blocking` moves the work onto the blocking pool so the
//! runtime's worker threads never stall during CPU-heavy rendering.
//!
//! ## Failure semantics
//!
//! Corrupt, truncated or password-protected PDFs surface as
//! [`TradeDocError::DocumentUnreadable`]: a terminal state, never retried.
//! Failing to *bind* pdfium is an environment problem and surfaces as
//! [`TradeDocError::PdfiumBindingFailed`] instead, so the message is redelivered
//! rather than the document being condemned.

use crate::error::TradeDocError;
use crate::pipeline::encode::png_bytes;
use async_trait::async_trait;
use pdfium_render::prelude::*;
use std::path::PathBuf;
use tracing::{debug, info};

/// One rendered page, 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    pub page_number: u32,
    pub total_pages: u32,
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Turns PDF bytes into page images.
#[async_trait]
pub trait PdfRasteriser: Send + Sync {
    /// `key` is used for error messages only.
    async fn rasterise(&self, pdf: Vec<u8>, key: &str) -> Result<Vec<RenderedPage>, TradeDocError>;
}

/// Whether the bytes carry a PDF header near the start.
pub fn looks_like_pdf(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(1024)];
    head.windows(5).any(|w| w == b"%PDF-")
}

/// [`PdfRasteriser`] backed by pdfium.
///
/// Binds to `PDFIUM_LIB_PATH` (a directory holding the platform library)
/// when set, otherwise to the system library.
#[derive(Debug, Clone)]
pub struct PdfiumRasteriser {
    dpi: u32,
    max_pixels: u32,
    library_dir: Option<PathBuf>,
}

impl PdfiumRasteriser {
    pub fn new(dpi: u32, max_pixels: u32) -> Self {
        Self {
            dpi,
            max_pixels,
            library_dir: std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from),
        }
    }

    pub fn with_library_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.library_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl PdfRasteriser for PdfiumRasteriser {
    async fn rasterise(&self, pdf: Vec<u8>, key: &str) -> Result<Vec<RenderedPage>, TradeDocError> {
        if !looks_like_pdf(&pdf) {
            return Err(TradeDocError::DocumentUnreadable {
                key: key.to_string(),
                detail: "missing %PDF header".into(),
            });
        }
        let this = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || this.rasterise_blocking(&pdf, &key))
            .await
            .map_err(|e| TradeDocError::Internal(format!("Render task panicked: {}", e)))?
    }
}

impl PdfiumRasteriser {
    fn bind(&self) -> Result<Pdfium, TradeDocError> {
        let bindings = match &self.library_dir {
            Some(dir) => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir)),
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|e| TradeDocError::PdfiumBindingFailed(format!("{:?}", e)))?;
        Ok(Pdfium::new(bindings))
    }

    fn rasterise_blocking(
        &self,
        pdf: &[u8],
        key: &str,
    ) -> Result<Vec<RenderedPage>, TradeDocError> {
        let pdfium = self.bind()?;

        let document = pdfium
            .load_pdf_from_byte_slice(pdf, None)
            .map_err(|e| TradeDocError::DocumentUnreadable {
                key: key.to_string(),
                detail: format!("{:?}", e),
            })?;

        let pages = document.pages();
        let total_pages = pages.len();
        if total_pages == 0 {
            return Err(TradeDocError::DocumentUnreadable {
                key: key.to_string(),
                detail: "PDF has no pages".into(),
            });
        }
        info!("PDF '{}' loaded: {} pages", key, total_pages);

        let render_config = PdfRenderConfig::new()
            .scale_page_by_factor(self.dpi as f32 / 72.0)
            .set_maximum_width(self.max_pixels as i32)
            .set_maximum_height(self.max_pixels as i32);

        let mut results = Vec::with_capacity(total_pages as usize);
        for idx in 0..total_pages {
            let page_number = idx as usize + 1;
            let page = pages
                .get(idx)
                .map_err(|e| TradeDocError::RasterisationFailed {
                    page: page_number,
                    detail: format!("{:?}", e),
                })?;

            let bitmap = page.render_with_config(&render_config).map_err(|e| {
                TradeDocError::RasterisationFailed {
                    page: page_number,
                    detail: format!("{:?}", e),
                }
            })?;

            let image = bitmap.as_image();
            let png = png_bytes(&image).map_err(|e| TradeDocError::RasterisationFailed {
                page: page_number,
                detail: e.to_string(),
            })?;
            debug!(
                "Rendered page {} → {}x{} px, {} bytes",
                page_number,
                image.width(),
                image.height(),
                png.len()
            );

            results.push(RenderedPage {
                page_number: page_number as u32,
                total_pages: total_pages as u32,
                png,
                width: image.width(),
                height: image.height(),
            });
        }

        Ok(results)
    }
}
