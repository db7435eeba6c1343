use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

pub mod fonts;

pub use fonts::FontFamily;

pub type AnnotationId = Uuid;

/// Fixed scale pages are rasterized at.
pub const RENDER_SCALE: f32 = 1.4;

/// Horizontal padding added around the widest measured line when auto-fitting
/// a text box.
pub const TEXT_BOX_PADDING: f32 = 8.0;

/// Per-line gap used by the on-screen text box fit.
pub const TEXT_BOX_LINE_GAP: f32 = 2.0;

pub const FONT_SIZE_MIN: f32 = 6.0;
pub const FONT_SIZE_MAX: f32 = 150.0;

/// Rasterized page bitmap, RGBA8.
#[derive(Debug, Clone)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// One rendered page of the open document.
///
/// `width`/`height` are raster-space pixels after scaling; `pdf_width`/
/// `pdf_height` are the page's user-space size in points as reported at render
/// time. The compositor re-reads the true page size from the reopened
/// document rather than trusting these, so a scale change between render and
/// save cannot skew the inverse mapping.
#[derive(Debug, Clone)]
pub struct PageRender {
    pub page_number: u32,
    pub image: RenderImage,
    pub width: f32,
    pub height: f32,
    pub pdf_width: f32,
    pub pdf_height: f32,
}

/// Axis-aligned box in raster space (origin top-left, y grows downward).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RasterBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl RasterBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Clamp so the box lies entirely within a page of the given raster size.
    ///
    /// Size is trimmed to the page first (a box can never be larger than its
    /// page), then the origin is pinned so `x + width <= page_width` and
    /// `y + height <= page_height` hold exactly at the boundary.
    pub fn clamped_to(mut self, page_width: f32, page_height: f32) -> Self {
        self.width = self.width.clamp(0.0, page_width);
        self.height = self.height.clamp(0.0, page_height);
        self.x = self.x.clamp(0.0, (page_width - self.width).max(0.0));
        self.y = self.y.clamp(0.0, (page_height - self.height).max(0.0));
        self
    }
}

/// Annotation box mapped into PDF user space (origin bottom-left, y grows
/// upward). `y_top` is the top edge, `y_bottom` the baseline anchor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PdfBox {
    pub x: f32,
    pub y_top: f32,
    pub y_bottom: f32,
    pub width: f32,
    pub height: f32,
}

/// Project a raster-space box into PDF user space.
///
/// The raster dimensions come from the `PageRender`; the PDF dimensions must
/// come from the authoritative page object of the document being written, so
/// the projection stays correct even if the raster scale has changed since
/// the page was rendered.
pub fn to_pdf_space(
    rect: RasterBox,
    raster_width: f32,
    raster_height: f32,
    pdf_width: f32,
    pdf_height: f32,
) -> PdfBox {
    let x = rect.x / raster_width * pdf_width;
    let width = rect.width / raster_width * pdf_width;
    let height = rect.height / raster_height * pdf_height;
    let y_top = pdf_height - rect.y / raster_height * pdf_height;
    PdfBox {
        x,
        y_top,
        y_bottom: y_top - height,
        width,
        height,
    }
}

/// Inverse of [`to_pdf_space`].
pub fn to_raster_space(
    rect: PdfBox,
    raster_width: f32,
    raster_height: f32,
    pdf_width: f32,
    pdf_height: f32,
) -> RasterBox {
    RasterBox {
        x: rect.x / pdf_width * raster_width,
        y: (pdf_height - rect.y_top) / pdf_height * raster_height,
        width: rect.width / pdf_width * raster_width,
        height: rect.height / pdf_height * raster_height,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const WHITE: Rgb = Rgb {
        r: 255,
        g: 255,
        b: 255,
    };
    pub const BLACK: Rgb = Rgb { r: 0, g: 0, b: 0 };

    pub fn to_normalized(self) -> (f32, f32, f32) {
        (
            f32::from(self.r) / 255.0,
            f32::from(self.g) / 255.0,
            f32::from(self.b) / 255.0,
        )
    }
}

/// Image codec of an embedded payload; selects the PDF embedding filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageMime {
    Png,
    Jpeg,
}

impl ImageMime {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageMime::Png => "image/png",
            ImageMime::Jpeg => "image/jpeg",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ImageDataError {
    #[error("data URL carries no base64 payload")]
    Empty,
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Base64 raster payload for image and signature annotations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePayload {
    pub data_url: String,
    pub mime: ImageMime,
}

impl ImagePayload {
    pub fn from_bytes(bytes: &[u8], mime: ImageMime) -> Self {
        Self {
            data_url: format!("data:{};base64,{}", mime.as_str(), BASE64.encode(bytes)),
            mime,
        }
    }

    /// Decode the payload back to raw image bytes. Accepts both a full
    /// `data:` URL and a bare base64 string.
    pub fn decoded(&self) -> std::result::Result<Vec<u8>, ImageDataError> {
        let encoded = match self.data_url.split_once(',') {
            Some((prefix, rest)) if prefix.starts_with("data:") => rest,
            _ => self.data_url.as_str(),
        };
        if encoded.is_empty() {
            return Err(ImageDataError::Empty);
        }
        Ok(BASE64.decode(encoded.trim())?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    pub text: String,
    pub font_size: f32,
    pub font: FontFamily,
    pub background: Option<Rgb>,
}

/// The three annotation variants. Image and signature share a payload shape
/// but stay distinct so callers can treat signatures specially.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AnnotationKind {
    Text(TextContent),
    Image(ImagePayload),
    Signature(ImagePayload),
}

impl AnnotationKind {
    pub fn is_text(&self) -> bool {
        matches!(self, AnnotationKind::Text(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: AnnotationId,
    pub page_number: u32,
    pub rect: RasterBox,
    pub kind: AnnotationKind,
}

impl Annotation {
    pub fn text_content(&self) -> Option<&TextContent> {
        match &self.kind {
            AnnotationKind::Text(content) => Some(content),
            _ => None,
        }
    }
}

/// Minimum box that fits a block of text at the given font and size.
///
/// Width is the widest measured line plus fixed padding; height is one
/// `font_size + gap` slot per line. Pure in its inputs, so re-fitting with
/// unchanged content is a no-op.
pub fn fit_text_box(text: &str, font_size: f32, font: FontFamily) -> (f32, f32) {
    let (widest, lines) = fonts::measure_block(font, font_size, text);
    (
        widest + TEXT_BOX_PADDING,
        lines as f32 * (font_size + TEXT_BOX_LINE_GAP),
    )
}

pub fn clamp_font_size(size: f32) -> f32 {
    size.clamp(FONT_SIZE_MIN, FONT_SIZE_MAX)
}

/// Ordered collection of annotations for one open document.
///
/// The store owns the list exclusively; order is draw order at compose time.
/// Geometry mutations clamp rather than reject, so an annotation can never
/// leave its page.
#[derive(Debug, Default)]
pub struct AnnotationStore {
    items: Vec<Annotation>,
}

impl AnnotationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Annotation> {
        self.items.iter()
    }

    pub fn annotations(&self) -> &[Annotation] {
        &self.items
    }

    pub fn get(&self, id: AnnotationId) -> Option<&Annotation> {
        self.items.iter().find(|a| a.id == id)
    }

    fn get_mut(&mut self, id: AnnotationId) -> Option<&mut Annotation> {
        self.items.iter_mut().find(|a| a.id == id)
    }

    /// Append with a fresh id; returns the id of the new annotation.
    pub fn add(
        &mut self,
        page_number: u32,
        rect: RasterBox,
        kind: AnnotationKind,
        page_width: f32,
        page_height: f32,
    ) -> AnnotationId {
        let id = Uuid::new_v4();
        self.items.push(Annotation {
            id,
            page_number,
            rect: rect.clamped_to(page_width, page_height),
            kind,
        });
        id
    }

    /// Move the annotation's origin; the final position is clamped against
    /// the annotation's own size and the page bounds. No-op if absent.
    pub fn move_to(&mut self, id: AnnotationId, x: f32, y: f32, page_width: f32, page_height: f32) {
        if let Some(ann) = self.get_mut(id) {
            let moved = RasterBox { x, y, ..ann.rect };
            ann.rect = moved.clamped_to(page_width, page_height);
        }
    }

    /// Apply a new size and position, then clamp as in [`move_to`]. A box
    /// pushed past an edge is pinned to it with size preserved.
    pub fn resize(
        &mut self,
        id: AnnotationId,
        width: f32,
        height: f32,
        x: f32,
        y: f32,
        page_width: f32,
        page_height: f32,
    ) {
        if let Some(ann) = self.get_mut(id) {
            ann.rect = RasterBox {
                x,
                y,
                width,
                height,
            }
            .clamped_to(page_width, page_height);
        }
    }

    /// Merge text content changes and re-fit the box. No-op if the id is
    /// absent or the annotation is not text.
    pub fn update_text(
        &mut self,
        id: AnnotationId,
        apply: impl FnOnce(&mut TextContent),
        page_width: f32,
        page_height: f32,
    ) -> bool {
        let Some(ann) = self.get_mut(id) else {
            return false;
        };
        let AnnotationKind::Text(ref mut content) = ann.kind else {
            return false;
        };
        apply(content);
        content.font_size = clamp_font_size(content.font_size);
        let (width, height) = fit_text_box(&content.text, content.font_size, content.font);
        ann.rect = RasterBox {
            width,
            height,
            ..ann.rect
        }
        .clamped_to(page_width, page_height);
        true
    }

    pub fn remove(&mut self, id: AnnotationId) -> Option<Annotation> {
        let index = self.items.iter().position(|a| a.id == id)?;
        Some(self.items.remove(index))
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// Ephemeral selection/edit state. Never serialized alongside annotations.
#[derive(Debug, Clone, PartialEq)]
pub struct EditorState {
    pub selected: Option<AnnotationId>,
    pub editing_text: Option<AnnotationId>,
    pub active_page: u32,
}

impl Default for EditorState {
    fn default() -> Self {
        Self {
            selected: None,
            editing_text: None,
            active_page: 1,
        }
    }
}

/// Discrete user actions driving the editor surface.
#[derive(Debug, Clone)]
pub enum EditorAction {
    AddText {
        page_number: u32,
        x: f32,
        y: f32,
        text: String,
        font_size: f32,
        font: FontFamily,
        background: Option<Rgb>,
    },
    AddImage {
        page_number: u32,
        rect: RasterBox,
        payload: ImagePayload,
    },
    AddSignature {
        page_number: u32,
        rect: RasterBox,
        payload: ImagePayload,
    },
    Select {
        id: AnnotationId,
    },
    ClearSelection,
    BeginTextEdit {
        id: AnnotationId,
    },
    EndTextEdit,
    SetText {
        id: AnnotationId,
        text: String,
    },
    SetFont {
        id: AnnotationId,
        font: FontFamily,
    },
    SetFontSize {
        id: AnnotationId,
        font_size: f32,
    },
    SetBackground {
        id: AnnotationId,
        background: Option<Rgb>,
    },
    /// Commit of a finished drag: applied once with the final position.
    MoveTo {
        id: AnnotationId,
        x: f32,
        y: f32,
    },
    /// Commit of a finished resize-handle drag.
    Resize {
        id: AnnotationId,
        width: f32,
        height: f32,
        x: f32,
        y: f32,
    },
    Remove {
        id: AnnotationId,
    },
    GotoPage {
        page: u32,
    },
    NextPage,
    PrevPage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EditorEvent {
    AnnotationAdded(AnnotationId),
    AnnotationRemoved(AnnotationId),
    SelectionChanged(Option<AnnotationId>),
    GeometryChanged(AnnotationId),
    ContentChanged(AnnotationId),
    ActivePageChanged(u32),
    PagesReplaced { page_count: u32 },
    StoreCleared,
}

/// One editor session: one open file, its rendered pages, its annotation
/// store, and the selection state machine. At most one annotation is
/// selected and at most one text annotation is in edit mode at any time.
pub struct EditorSession {
    pages: Vec<PageRender>,
    store: AnnotationStore,
    state: EditorState,
    events: Arc<Mutex<Vec<EditorEvent>>>,
    saving: bool,
}

impl Default for EditorSession {
    fn default() -> Self {
        Self::new()
    }
}

impl EditorSession {
    pub fn new() -> Self {
        Self {
            pages: Vec::new(),
            store: AnnotationStore::new(),
            state: EditorState::default(),
            events: Arc::new(Mutex::new(Vec::new())),
            saving: false,
        }
    }

    pub fn events(&self) -> Arc<Mutex<Vec<EditorEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn state(&self) -> &EditorState {
        &self.state
    }

    pub fn store(&self) -> &AnnotationStore {
        &self.store
    }

    pub fn pages(&self) -> &[PageRender] {
        &self.pages
    }

    pub fn has_pages(&self) -> bool {
        !self.pages.is_empty()
    }

    pub fn page(&self, page_number: u32) -> Option<&PageRender> {
        self.pages.iter().find(|p| p.page_number == page_number)
    }

    fn push_event(&self, event: EditorEvent) {
        self.events.lock().push(event);
    }

    /// Install the pages of a freshly rendered file. Discards all annotations
    /// and ephemeral state from the previous file.
    pub fn replace_pages(&mut self, pages: Vec<PageRender>) {
        let page_count = pages.len() as u32;
        self.pages = pages;
        self.store.clear();
        self.state = EditorState::default();
        self.push_event(EditorEvent::StoreCleared);
        self.push_event(EditorEvent::PagesReplaced { page_count });
    }

    /// Drop all pages after a render failure; annotation tools stay disabled
    /// until a valid file is rendered.
    pub fn clear_pages(&mut self) {
        self.replace_pages(Vec::new());
    }

    /// Gate for the save flow: at most one save may be in flight. Returns
    /// false if a save is already running or there is nothing to save onto.
    pub fn try_begin_save(&mut self) -> bool {
        if self.saving || self.pages.is_empty() {
            return false;
        }
        self.saving = true;
        true
    }

    pub fn is_saving(&self) -> bool {
        self.saving
    }

    /// Complete a save. On success the store and selection reset to idle; on
    /// failure everything is preserved so the user can retry.
    pub fn finish_save(&mut self, success: bool) {
        self.saving = false;
        if success {
            self.store.clear();
            self.state.selected = None;
            self.state.editing_text = None;
            self.push_event(EditorEvent::StoreCleared);
        }
    }

    fn select(&mut self, id: Option<AnnotationId>) {
        if self.state.selected != id {
            self.state.selected = id;
            self.push_event(EditorEvent::SelectionChanged(id));
        }
        // Selection change always leaves text-edit mode; re-entering is an
        // explicit action on the already-selected annotation.
        self.state.editing_text = None;
    }

    #[instrument(skip(self, action))]
    pub fn apply(&mut self, action: EditorAction) -> Result<()> {
        match action {
            EditorAction::AddText {
                page_number,
                x,
                y,
                text,
                font_size,
                font,
                background,
            } => {
                let page = self
                    .page(page_number)
                    .ok_or_else(|| anyhow!("page {} is not rendered", page_number))?;
                let (page_w, page_h) = (page.width, page.height);
                let font_size = clamp_font_size(font_size);
                let (width, height) = fit_text_box(&text, font_size, font);
                let id = self.store.add(
                    page_number,
                    RasterBox::new(x, y, width, height),
                    AnnotationKind::Text(TextContent {
                        text,
                        font_size,
                        font,
                        background,
                    }),
                    page_w,
                    page_h,
                );
                self.push_event(EditorEvent::AnnotationAdded(id));
                self.select(Some(id));
                self.state.editing_text = Some(id);
            }
            EditorAction::AddImage {
                page_number,
                rect,
                payload,
            } => {
                let id = self.add_image_kind(page_number, rect, AnnotationKind::Image(payload))?;
                self.push_event(EditorEvent::AnnotationAdded(id));
                self.select(Some(id));
            }
            EditorAction::AddSignature {
                page_number,
                rect,
                payload,
            } => {
                let id =
                    self.add_image_kind(page_number, rect, AnnotationKind::Signature(payload))?;
                self.push_event(EditorEvent::AnnotationAdded(id));
                self.select(Some(id));
            }
            EditorAction::Select { id } => {
                if self.store.get(id).is_some() {
                    self.select(Some(id));
                }
            }
            EditorAction::ClearSelection => {
                self.select(None);
            }
            EditorAction::BeginTextEdit { id } => {
                if self.store.get(id).is_some_and(|a| a.kind.is_text()) {
                    self.select(Some(id));
                    self.state.editing_text = Some(id);
                }
            }
            EditorAction::EndTextEdit => {
                self.state.editing_text = None;
            }
            EditorAction::SetText { id, text } => {
                self.with_text(id, move |content| content.text = text);
            }
            EditorAction::SetFont { id, font } => {
                self.with_text(id, move |content| content.font = font);
            }
            EditorAction::SetFontSize { id, font_size } => {
                self.with_text(id, move |content| content.font_size = font_size);
            }
            EditorAction::SetBackground { id, background } => {
                self.with_text(id, move |content| content.background = background);
            }
            EditorAction::MoveTo { id, x, y } => {
                if let Some((page_w, page_h)) = self.page_dims_for(id) {
                    self.store.move_to(id, x, y, page_w, page_h);
                    self.push_event(EditorEvent::GeometryChanged(id));
                }
            }
            EditorAction::Resize {
                id,
                width,
                height,
                x,
                y,
            } => {
                if let Some((page_w, page_h)) = self.page_dims_for(id) {
                    self.store.resize(id, width, height, x, y, page_w, page_h);
                    self.push_event(EditorEvent::GeometryChanged(id));
                }
            }
            EditorAction::Remove { id } => {
                if self.store.remove(id).is_some() {
                    if self.state.selected == Some(id) {
                        self.state.selected = None;
                        self.push_event(EditorEvent::SelectionChanged(None));
                    }
                    if self.state.editing_text == Some(id) {
                        self.state.editing_text = None;
                    }
                    self.push_event(EditorEvent::AnnotationRemoved(id));
                }
            }
            EditorAction::GotoPage { page } => {
                self.goto_page(page);
            }
            EditorAction::NextPage => {
                self.goto_page(self.state.active_page.saturating_add(1));
            }
            EditorAction::PrevPage => {
                self.goto_page(self.state.active_page.saturating_sub(1));
            }
        }
        Ok(())
    }

    fn add_image_kind(
        &mut self,
        page_number: u32,
        rect: RasterBox,
        kind: AnnotationKind,
    ) -> Result<AnnotationId> {
        let page = self
            .page(page_number)
            .ok_or_else(|| anyhow!("page {} is not rendered", page_number))?;
        let (page_w, page_h) = (page.width, page.height);
        Ok(self.store.add(page_number, rect, kind, page_w, page_h))
    }

    fn with_text(&mut self, id: AnnotationId, apply: impl FnOnce(&mut TextContent)) {
        if let Some((page_w, page_h)) = self.page_dims_for(id) {
            if self.store.update_text(id, apply, page_w, page_h) {
                self.push_event(EditorEvent::ContentChanged(id));
            }
        }
    }

    fn page_dims_for(&self, id: AnnotationId) -> Option<(f32, f32)> {
        let page_number = self.store.get(id)?.page_number;
        let page = self.page(page_number)?;
        Some((page.width, page.height))
    }

    fn goto_page(&mut self, page: u32) {
        if self.pages.is_empty() {
            return;
        }
        let next = page.clamp(1, self.pages.len() as u32);
        if next != self.state.active_page {
            self.state.active_page = next;
            self.push_event(EditorEvent::ActivePageChanged(next));
        }
    }
}

/// Opaque document identifier assigned by the surrounding document system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentKey(pub String);

/// Opaque file identifier within a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileKey(pub String);

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentKey {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<&str> for FileKey {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("file {file} of document {document} not found")]
    NotFound { document: DocumentKey, file: FileKey },
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("submission rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Receipt for a stored version; the version number is assigned by the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionReceipt {
    pub version: u32,
    pub file: FileKey,
}

/// Fetches the exact bytes previously stored for one file of a document.
#[async_trait::async_trait]
pub trait FileSource: Send + Sync {
    async fn fetch(
        &self,
        document: &DocumentKey,
        file: &FileKey,
    ) -> std::result::Result<Vec<u8>, SourceError>;
}

/// Stores finished bytes as a new immutable version of a document. Prior
/// versions are preserved; the sink assigns the version number.
#[async_trait::async_trait]
pub trait VersionSink: Send + Sync {
    async fn submit(
        &self,
        document: &DocumentKey,
        file_name: &str,
        bytes: &[u8],
    ) -> std::result::Result<VersionReceipt, SinkError>;
}

/// Filesystem-backed document library: `root/<document>/<file>` for source
/// files, `root/<document>/versions/v<N>_<name>` for submitted versions.
pub struct DirectoryLibrary {
    root: PathBuf,
}

impl DirectoryLibrary {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create library root at {:?}", root))?;
        Ok(Self { root })
    }

    fn versions_dir(&self, document: &DocumentKey) -> PathBuf {
        self.root.join(&document.0).join("versions")
    }

    /// All stored versions of a document, in ascending version order.
    pub fn versions(&self, document: &DocumentKey) -> Result<Vec<FileKey>> {
        let dir = self.versions_dir(document);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries: Vec<(u32, String)> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if let Some(version) = parse_version_prefix(&name) {
                entries.push((version, name));
            }
        }
        entries.sort();
        Ok(entries
            .into_iter()
            .map(|(_, name)| FileKey(format!("versions/{}", name)))
            .collect())
    }

    fn next_version(&self, document: &DocumentKey) -> Result<u32> {
        let dir = self.versions_dir(document);
        if !dir.exists() {
            return Ok(1);
        }
        let mut highest = 0;
        for entry in fs::read_dir(&dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if let Some(version) = parse_version_prefix(&name) {
                highest = highest.max(version);
            }
        }
        Ok(highest + 1)
    }
}

fn parse_version_prefix(name: &str) -> Option<u32> {
    let rest = name.strip_prefix('v')?;
    let (digits, _) = rest.split_once('_')?;
    digits.parse().ok()
}

#[async_trait::async_trait]
impl FileSource for DirectoryLibrary {
    async fn fetch(
        &self,
        document: &DocumentKey,
        file: &FileKey,
    ) -> std::result::Result<Vec<u8>, SourceError> {
        let path = self.root.join(&document.0).join(&file.0);
        if !path.exists() {
            return Err(SourceError::NotFound {
                document: document.clone(),
                file: file.clone(),
            });
        }
        let mut bytes = Vec::new();
        File::open(&path)?.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

#[async_trait::async_trait]
impl VersionSink for DirectoryLibrary {
    async fn submit(
        &self,
        document: &DocumentKey,
        file_name: &str,
        bytes: &[u8],
    ) -> std::result::Result<VersionReceipt, SinkError> {
        if file_name.contains('/') || file_name.contains('\\') {
            return Err(SinkError::Rejected(format!(
                "file name {:?} must not contain path separators",
                file_name
            )));
        }
        let dir = self.versions_dir(document);
        fs::create_dir_all(&dir)?;
        let version = self
            .next_version(document)
            .map_err(|err| SinkError::Rejected(err.to_string()))?;
        let name = format!("v{}_{}", version, file_name);
        let path = dir.join(&name);
        let tmp = dir.join(format!("{}.tmp", name));
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.flush()?;
        fs::rename(&tmp, &path)?;
        debug!(document = %document, version, "stored new file version");
        Ok(VersionReceipt {
            version,
            file: FileKey(format!("versions/{}", name)),
        })
    }
}

/// In-memory library for tests and embedding.
#[derive(Default)]
pub struct MemoryLibrary {
    inner: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, document: &DocumentKey, file: &FileKey, bytes: Vec<u8>) {
        self.inner
            .lock()
            .insert((document.0.clone(), file.0.clone()), bytes);
    }
}

#[async_trait::async_trait]
impl FileSource for MemoryLibrary {
    async fn fetch(
        &self,
        document: &DocumentKey,
        file: &FileKey,
    ) -> std::result::Result<Vec<u8>, SourceError> {
        self.inner
            .lock()
            .get(&(document.0.clone(), file.0.clone()))
            .cloned()
            .ok_or_else(|| SourceError::NotFound {
                document: document.clone(),
                file: file.clone(),
            })
    }
}

#[async_trait::async_trait]
impl VersionSink for MemoryLibrary {
    async fn submit(
        &self,
        document: &DocumentKey,
        file_name: &str,
        bytes: &[u8],
    ) -> std::result::Result<VersionReceipt, SinkError> {
        let mut inner = self.inner.lock();
        let prefix = "versions/v";
        let version = inner
            .keys()
            .filter(|(doc, _)| doc == &document.0)
            .filter_map(|(_, file)| {
                let rest = file.strip_prefix(prefix)?;
                let (digits, _) = rest.split_once('_')?;
                digits.parse::<u32>().ok()
            })
            .max()
            .unwrap_or(0)
            + 1;
        let key = FileKey(format!("versions/v{}_{}", version, file_name));
        inner.insert((document.0.clone(), key.0.clone()), bytes.to_vec());
        Ok(VersionReceipt { version, file: key })
    }
}
