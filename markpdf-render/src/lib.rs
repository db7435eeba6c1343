use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use markpdf_core::PageRender;
use parking_lot::Mutex;

#[cfg(feature = "pdf")]
mod pdfium;

#[cfg(feature = "pdf")]
pub use pdfium::PdfRasterizer;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// A newer render pass superseded this one. Never shown to the user.
    #[error("render pass cancelled")]
    Cancelled,
    #[error("failed to parse document: {0}")]
    Parse(String),
    #[error("failed to rasterize page {page}: {message}")]
    Rasterize { page: u32, message: String },
}

/// Cooperative cancellation flag checked between pages of a render pass.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn checkpoint(&self) -> Result<(), RenderError> {
        if self.is_cancelled() {
            Err(RenderError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Final gate of a render pass: pages only surface if the token is still
/// live. A pass superseded while its last page rendered is discarded whole,
/// so stale pages can never be installed over the newer pass's output.
pub(crate) fn complete_pass(
    pages: Vec<PageRender>,
    token: &CancelToken,
) -> Result<Vec<PageRender>, RenderError> {
    token.checkpoint()?;
    Ok(pages)
}

/// Tracks the in-flight render pass. Beginning a new pass cancels the
/// previous one, so at most one pass can complete per document swap.
#[derive(Default)]
pub struct PassRegistry {
    current: Mutex<Option<CancelToken>>,
}

impl PassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel any running pass and hand out a token for the new one.
    pub fn begin(&self) -> CancelToken {
        let token = CancelToken::new();
        let mut current = self.current.lock();
        if let Some(previous) = current.replace(token.clone()) {
            previous.cancel();
        }
        token
    }

    /// Forget the current token once its pass has finished.
    pub fn finish(&self, token: &CancelToken) {
        let mut current = self.current.lock();
        if current
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(&active.cancelled, &token.cancelled))
        {
            *current = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use markpdf_core::RenderImage;

    fn blank_page(page_number: u32) -> PageRender {
        PageRender {
            page_number,
            image: RenderImage {
                width: 10,
                height: 10,
                pixels: Vec::new(),
            },
            width: 10.0,
            height: 10.0,
            pdf_width: 10.0,
            pdf_height: 10.0,
        }
    }

    #[test]
    fn superseded_pass_surfaces_no_pages() {
        let registry = PassRegistry::new();
        let token = registry.begin();
        let pages = vec![blank_page(1), blank_page(2)];

        // The pass finished its last page just as a newer one began.
        registry.begin();
        assert!(matches!(
            complete_pass(pages, &token),
            Err(RenderError::Cancelled)
        ));
    }

    #[test]
    fn live_pass_surfaces_its_pages() {
        let registry = PassRegistry::new();
        let token = registry.begin();
        let pages = complete_pass(vec![blank_page(1)], &token).unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].page_number, 1);
    }

    #[test]
    fn fresh_token_is_live() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.checkpoint().is_ok());
    }

    #[test]
    fn cancelled_token_fails_checkpoint() {
        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(token.checkpoint(), Err(RenderError::Cancelled)));
    }

    #[test]
    fn beginning_a_pass_cancels_the_previous_one() {
        let registry = PassRegistry::new();
        let first = registry.begin();
        assert!(!first.is_cancelled());

        let second = registry.begin();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[test]
    fn finish_only_clears_its_own_token() {
        let registry = PassRegistry::new();
        let stale = registry.begin();
        let active = registry.begin();

        registry.finish(&stale);
        let third = registry.begin();
        assert!(active.is_cancelled());
        assert!(!third.is_cancelled());
    }
}
