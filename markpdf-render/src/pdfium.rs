use std::sync::Arc;

use anyhow::{anyhow, Result};
use markpdf_core::{PageRender, RenderImage, RENDER_SCALE};
use pdfium_render::prelude::*;
use tracing::{debug, instrument, warn};

use crate::{complete_pass, CancelToken, RenderError};

/// Pdfium-backed page rasterizer. One instance binds the library once and is
/// shared across render passes.
pub struct PdfRasterizer {
    pdfium: Arc<Pdfium>,
}

impl PdfRasterizer {
    pub fn new() -> Result<Self> {
        let pdfium = match bind_pdfium_from_build_hint() {
            Some(pdfium) => pdfium,
            None => bind_pdfium_default()?,
        };
        Ok(Self {
            pdfium: Arc::new(pdfium),
        })
    }

    /// Rasterize every page of the document at the fixed editor scale.
    ///
    /// The token is checked before each page; a pass superseded by a newer
    /// one stops at the next page boundary with [`RenderError::Cancelled`]
    /// and its partial output is discarded.
    #[instrument(skip(self, bytes, token), fields(len = bytes.len()))]
    pub fn render_document(
        &self,
        bytes: &[u8],
        token: &CancelToken,
    ) -> std::result::Result<Vec<PageRender>, RenderError> {
        token.checkpoint()?;
        let document = self
            .pdfium
            .load_pdf_from_byte_slice(bytes, None)
            .map_err(|err| RenderError::Parse(err.to_string()))?;

        let page_count = document.pages().len();
        let mut pages = Vec::with_capacity(usize::from(page_count));
        for (index, page) in document.pages().iter().enumerate() {
            token.checkpoint()?;
            let page_number = index as u32 + 1;
            pages.push(render_page(&page, page_number)?);
        }

        debug!(page_count, "rasterized document");
        complete_pass(pages, token)
    }
}

fn render_page(page: &PdfPage<'_>, page_number: u32) -> std::result::Result<PageRender, RenderError> {
    let config = PdfRenderConfig::new().scale_page_by_factor(RENDER_SCALE);
    let bitmap = page
        .render_with_config(&config)
        .map_err(|err| RenderError::Rasterize {
            page: page_number,
            message: err.to_string(),
        })?;
    let image = bitmap.as_image().to_rgba8();
    let (width, height) = (image.width(), image.height());

    Ok(PageRender {
        page_number,
        image: RenderImage {
            width,
            height,
            pixels: image.into_raw(),
        },
        width: width as f32,
        height: height as f32,
        pdf_width: page.width().value,
        pdf_height: page.height().value,
    })
}

fn bind_pdfium_from_build_hint() -> Option<Pdfium> {
    match option_env!("MARKPDF_PDFIUM_LIBRARY_PATH") {
        Some(path) if !path.is_empty() => match Pdfium::bind_to_library(path) {
            Ok(bindings) => Some(Pdfium::new(bindings)),
            Err(err) => {
                warn!(
                    "failed to load Pdfium from build-provided path {}: {}",
                    path, err
                );
                None
            }
        },
        _ => None,
    }
}

fn bind_pdfium_default() -> Result<Pdfium> {
    let mut errors = Vec::new();

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");

    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("{}: {}", cwd_path.display(), err));
        }
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(anyhow!(
                "failed to bind to a pdfium library; ensure it is installed ({})",
                errors.join(", ")
            ))
        }
    }
}
