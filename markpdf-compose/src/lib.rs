//! Flattens annotations into the PDF they were drawn over.
//!
//! The compositor reopens the original bytes, maps every annotation box from
//! raster space into the page's user space and appends one content stream per
//! annotation, preserving the order they were added in. Output is a complete
//! new PDF; the input bytes are never modified.

use std::collections::HashMap;

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};
use markpdf_core::{
    fonts, to_pdf_space, Annotation, AnnotationKind, FontFamily, PageRender, PdfBox, TextContent,
};
use tracing::{debug, warn};

mod error;
mod images;

pub use error::{ComposeError, Result};

/// Line height used when drawing text into the page.
const LINE_HEIGHT_GAP: f32 = 1.0;
/// Inset from the box edge to the first glyph.
const TEXT_INSET: f32 = 2.0;
/// Slack added around measured text when sizing the occlusion rectangle.
const OCCLUSION_PAD: f32 = 2.0;

/// Raster dimensions a page was displayed at; pairs a page number with the
/// bitmap size its annotation coordinates are relative to.
#[derive(Debug, Clone, Copy)]
pub struct PageGeometry {
    pub page_number: u32,
    pub raster_width: f32,
    pub raster_height: f32,
}

impl From<&PageRender> for PageGeometry {
    fn from(page: &PageRender) -> Self {
        Self {
            page_number: page.page_number,
            raster_width: page.width,
            raster_height: page.height,
        }
    }
}

/// Produce a new PDF with the given annotations drawn into their pages.
///
/// Annotations whose page number no longer exists in the document are
/// skipped with a warning rather than failing the whole compose. The result
/// is deterministic for identical inputs.
pub fn compose(
    pdf_bytes: &[u8],
    annotations: &[Annotation],
    geometry: &[PageGeometry],
) -> Result<Vec<u8>> {
    let mut doc =
        Document::load_mem(pdf_bytes).map_err(|err| ComposeError::Parse(err.to_string()))?;
    let page_map = doc.get_pages();
    if page_map.is_empty() {
        return Err(ComposeError::EmptyDocument);
    }

    let mut fonts_in_use: HashMap<FontFamily, ObjectId> = HashMap::new();
    let mut image_seq = 0u32;

    for annotation in annotations {
        let Some(&page_id) = page_map.get(&annotation.page_number) else {
            warn!(
                page = annotation.page_number,
                id = %annotation.id,
                "annotation references a page the document no longer has, skipping"
            );
            continue;
        };
        let Some(page_geometry) = geometry
            .iter()
            .find(|g| g.page_number == annotation.page_number)
        else {
            warn!(
                page = annotation.page_number,
                id = %annotation.id,
                "no raster geometry for page, skipping annotation"
            );
            continue;
        };

        // The reopened page is authoritative for user-space size; the raster
        // dimensions only define the proportion of the mapping.
        let (pdf_width, pdf_height) = page_size(&doc, page_id);
        let rect = to_pdf_space(
            annotation.rect,
            page_geometry.raster_width,
            page_geometry.raster_height,
            pdf_width,
            pdf_height,
        );

        match &annotation.kind {
            AnnotationKind::Text(content) => {
                let font_id = *fonts_in_use
                    .entry(content.font)
                    .or_insert_with(|| register_font(&mut doc, content.font));
                let ops = text_operations(content, rect, font_res_name(content.font));
                let stream_id = add_content_stream(&mut doc, ops)?;
                attach_to_page(
                    &mut doc,
                    page_id,
                    stream_id,
                    &[("Font", font_res_name(content.font).to_owned(), font_id)],
                )?;
            }
            AnnotationKind::Image(payload) | AnnotationKind::Signature(payload) => {
                let embedded = images::embed_image(&mut doc, payload)?;
                image_seq += 1;
                let name = format!("AnnIm{}", image_seq);
                let ops = image_operations(rect, &name);
                let stream_id = add_content_stream(&mut doc, ops)?;
                attach_to_page(
                    &mut doc,
                    page_id,
                    stream_id,
                    &[("XObject", name, embedded.object_id)],
                )?;
            }
        }
    }

    let mut output = Vec::new();
    doc.save_to(&mut output)
        .map_err(|err| ComposeError::Save(err.to_string()))?;
    debug!(
        annotations = annotations.len(),
        bytes = output.len(),
        "composed document"
    );
    Ok(output)
}

fn font_res_name(family: FontFamily) -> &'static str {
    match family {
        FontFamily::Helvetica => "AnnHelv",
        FontFamily::TimesRoman => "AnnTimes",
        FontFamily::Courier => "AnnCour",
    }
}

/// Standard-14 fonts need no embedding, only a Type1 dictionary.
fn register_font(doc: &mut Document, family: FontFamily) -> ObjectId {
    doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => family.base_name(),
        "Encoding" => "WinAnsiEncoding",
    })
}

/// Footprint the drawn text will actually occupy, in page points.
fn measured_extent(content: &TextContent) -> (f32, f32) {
    let (widest, lines) = fonts::measure_block(content.font, content.font_size, &content.text);
    (
        widest + 2.0 * TEXT_INSET,
        lines as f32 * (content.font_size + LINE_HEIGHT_GAP),
    )
}

fn text_operations(content: &TextContent, rect: PdfBox, font_name: &str) -> Vec<Operation> {
    let (measured_width, measured_height) = measured_extent(content);
    let occlusion_width = rect.width.max(measured_width) + OCCLUSION_PAD;
    let occlusion_height = rect.height.max(measured_height) + OCCLUSION_PAD;

    let mut ops = vec![Operation::new("q", vec![])];

    // Blank out whatever the box covered, even if the text outgrew it.
    ops.push(Operation::new(
        "rg",
        vec![1.0f32.into(), 1.0f32.into(), 1.0f32.into()],
    ));
    ops.push(Operation::new(
        "re",
        vec![
            rect.x.into(),
            (rect.y_top - occlusion_height).into(),
            occlusion_width.into(),
            occlusion_height.into(),
        ],
    ));
    ops.push(Operation::new("f", vec![]));

    if let Some(background) = content.background {
        let (r, g, b) = background.to_normalized();
        ops.push(Operation::new("rg", vec![r.into(), g.into(), b.into()]));
        ops.push(Operation::new(
            "re",
            vec![
                rect.x.into(),
                rect.y_bottom.into(),
                rect.width.into(),
                rect.height.into(),
            ],
        ));
        ops.push(Operation::new("f", vec![]));
    }

    let lines: Vec<&str> = content.text.split('\n').collect();
    if lines.iter().any(|line| !line.is_empty()) {
        let line_height = content.font_size + LINE_HEIGHT_GAP;
        // First baseline sits at the top line; T* then steps down by the
        // leading so the last line lands exactly on y_bottom.
        let first_baseline = rect.y_bottom + (lines.len() as f32 - 1.0) * line_height;

        ops.push(Operation::new(
            "rg",
            vec![0.0f32.into(), 0.0f32.into(), 0.0f32.into()],
        ));
        ops.push(Operation::new("BT", vec![]));
        ops.push(Operation::new(
            "Tf",
            vec![Object::Name(font_name.into()), content.font_size.into()],
        ));
        ops.push(Operation::new("TL", vec![line_height.into()]));
        ops.push(Operation::new(
            "Td",
            vec![(rect.x + TEXT_INSET).into(), first_baseline.into()],
        ));
        for (index, line) in lines.iter().enumerate() {
            if index > 0 {
                ops.push(Operation::new("T*", vec![]));
            }
            if !line.is_empty() {
                ops.push(Operation::new("Tj", vec![Object::string_literal(*line)]));
            }
        }
        ops.push(Operation::new("ET", vec![]));
    }

    ops.push(Operation::new("Q", vec![]));
    ops
}

fn image_operations(rect: PdfBox, name: &str) -> Vec<Operation> {
    vec![
        Operation::new("q", vec![]),
        Operation::new(
            "cm",
            vec![
                rect.width.into(),
                0.into(),
                0.into(),
                rect.height.into(),
                rect.x.into(),
                rect.y_bottom.into(),
            ],
        ),
        Operation::new("Do", vec![Object::Name(name.into())]),
        Operation::new("Q", vec![]),
    ]
}

fn add_content_stream(doc: &mut Document, operations: Vec<Operation>) -> Result<ObjectId> {
    let encoded = Content { operations }
        .encode()
        .map_err(|err| ComposeError::Content(err.to_string()))?;
    Ok(doc.add_object(Stream::new(dictionary! {}, encoded)))
}

/// Append the content stream to the page and make its resources reachable,
/// folding inherited resources into the page so nothing existing breaks.
fn attach_to_page(
    doc: &mut Document,
    page_id: ObjectId,
    stream_id: ObjectId,
    resources: &[(&str, String, ObjectId)],
) -> Result<()> {
    let mut merged = resolved_resources(doc, page_id);
    for (kind, name, object_id) in resources {
        let mut sub = match merged.get(kind.as_bytes()) {
            Ok(existing) => resolve_dictionary(doc, existing),
            Err(_) => Dictionary::new(),
        };
        sub.set(name.as_bytes(), Object::Reference(*object_id));
        merged.set(*kind, Object::Dictionary(sub));
    }

    let existing_contents = doc
        .get_dictionary(page_id)
        .ok()
        .and_then(|dict| dict.get(b"Contents").ok().cloned());

    let page = doc.get_dictionary_mut(page_id)?;
    let contents = match existing_contents {
        Some(Object::Array(mut refs)) => {
            refs.push(Object::Reference(stream_id));
            Object::Array(refs)
        }
        Some(single @ Object::Reference(_)) => {
            Object::Array(vec![single, Object::Reference(stream_id)])
        }
        _ => Object::Array(vec![Object::Reference(stream_id)]),
    };
    page.set("Contents", contents);
    page.set("Resources", Object::Dictionary(merged));
    Ok(())
}

fn resolve_dictionary(doc: &Document, object: &Object) -> Dictionary {
    match object {
        Object::Dictionary(dict) => dict.clone(),
        Object::Reference(id) => doc
            .get_dictionary(*id)
            .map(|dict| dict.clone())
            .unwrap_or_default(),
        _ => Dictionary::new(),
    }
}

/// Resolve the page's own or inherited /Resources dictionary.
fn resolved_resources(doc: &Document, page_id: ObjectId) -> Dictionary {
    inherited_entry(doc, page_id, b"Resources")
        .map(|object| resolve_dictionary(doc, &object))
        .unwrap_or_default()
}

/// Page size in user-space points from the effective MediaBox, falling back
/// to US Letter when the document omits it.
fn page_size(doc: &Document, page_id: ObjectId) -> (f32, f32) {
    let media_box = inherited_entry(doc, page_id, b"MediaBox").and_then(|object| {
        let values: Vec<f32> = match object {
            Object::Array(items) => items.iter().filter_map(as_f32).collect(),
            _ => return None,
        };
        (values.len() == 4).then(|| {
            (
                (values[2] - values[0]).abs(),
                (values[3] - values[1]).abs(),
            )
        })
    });
    media_box.unwrap_or((612.0, 792.0))
}

fn as_f32(object: &Object) -> Option<f32> {
    match object {
        Object::Integer(value) => Some(*value as f32),
        Object::Real(value) => Some(*value),
        _ => None,
    }
}

/// Walk the page and its /Parent chain for an inheritable attribute.
fn inherited_entry(doc: &Document, page_id: ObjectId, key: &[u8]) -> Option<Object> {
    let mut current = page_id;
    loop {
        let dict = doc.get_dictionary(current).ok()?;
        if let Ok(object) = dict.get(key) {
            let resolved = match object {
                Object::Reference(id) => doc.get_object(*id).ok()?.clone(),
                other => other.clone(),
            };
            return Some(resolved);
        }
        match dict.get(b"Parent") {
            Ok(Object::Reference(parent)) => current = *parent,
            _ => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use markpdf_core::{ImageMime, ImagePayload, RasterBox, Rgb};
    use uuid::Uuid;

    fn create_test_pdf(width: f32, height: f32) -> Vec<u8> {
        let mut doc = Document::with_version("1.7");
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "MediaBox" => vec![
                0.into(),
                0.into(),
                Object::Real(width),
                Object::Real(height),
            ],
        });
        let pages_id = doc.add_object(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![Object::Reference(page_id)],
            "Count" => 1,
        });
        if let Ok(page) = doc.get_object_mut(page_id) {
            if let Ok(dict) = page.as_dict_mut() {
                dict.set("Parent", Object::Reference(pages_id));
            }
        }
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => Object::Reference(pages_id),
        });
        doc.trailer.set("Root", Object::Reference(catalog_id));

        let mut buffer = Vec::new();
        doc.save_to(&mut buffer).unwrap();
        buffer
    }

    fn letter_geometry() -> Vec<PageGeometry> {
        vec![PageGeometry {
            page_number: 1,
            raster_width: 612.0 * 1.4,
            raster_height: 792.0 * 1.4,
        }]
    }

    fn text_annotation(text: &str, font_size: f32) -> Annotation {
        Annotation {
            id: Uuid::new_v4(),
            page_number: 1,
            rect: RasterBox::new(100.0, 100.0, 180.0, 20.0),
            kind: AnnotationKind::Text(TextContent {
                text: text.to_owned(),
                font_size,
                font: FontFamily::Helvetica,
                background: None,
            }),
        }
    }

    fn png_bytes() -> Vec<u8> {
        let mut img = image::RgbaImage::new(2, 2);
        img.put_pixel(0, 0, image::Rgba([255, 0, 0, 255]));
        img.put_pixel(1, 1, image::Rgba([0, 0, 255, 128]));
        let mut buffer = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buffer, image::ImageFormat::Png).unwrap();
        buffer.into_inner()
    }

    fn count_image_xobjects(bytes: &[u8]) -> usize {
        let doc = Document::load_mem(bytes).unwrap();
        doc.objects
            .values()
            .filter(|object| {
                object
                    .as_stream()
                    .ok()
                    .and_then(|stream| stream.dict.get(b"Subtype").ok())
                    .and_then(|subtype| subtype.as_name().ok())
                    .is_some_and(|name| name == b"Image")
            })
            .count()
    }

    #[test]
    fn no_annotations_yields_valid_pdf() {
        let pdf = create_test_pdf(612.0, 792.0);
        let result = compose(&pdf, &[], &letter_geometry()).unwrap();
        assert!(result.starts_with(b"%PDF-"));
        assert_eq!(Document::load_mem(&result).unwrap().get_pages().len(), 1);
    }

    #[test]
    fn text_annotation_adds_content_and_font() {
        let pdf = create_test_pdf(612.0, 792.0);
        let result = compose(
            &pdf,
            &[text_annotation("Hello World", 14.0)],
            &letter_geometry(),
        )
        .unwrap();

        let doc = Document::load_mem(&result).unwrap();
        let (_, page_id) = doc.get_pages().into_iter().next().unwrap();
        let page = doc.get_dictionary(page_id).unwrap();
        let resources = page.get(b"Resources").unwrap().as_dict().unwrap();
        let font = resources.get(b"Font").unwrap().as_dict().unwrap();
        assert!(font.get(b"AnnHelv").is_ok());

        let contents = page.get(b"Contents").unwrap().as_array().unwrap();
        assert_eq!(contents.len(), 1);
    }

    #[test]
    fn compose_is_deterministic() {
        let pdf = create_test_pdf(612.0, 792.0);
        let annotations = vec![text_annotation("same input", 12.0)];
        let first = compose(&pdf, &annotations, &letter_geometry()).unwrap();
        let second = compose(&pdf, &annotations, &letter_geometry()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn stale_page_numbers_are_skipped() {
        let pdf = create_test_pdf(612.0, 792.0);
        let mut stale = text_annotation("orphan", 12.0);
        stale.page_number = 5;

        let result = compose(&pdf, &[stale], &letter_geometry()).unwrap();
        let doc = Document::load_mem(&result).unwrap();
        let (_, page_id) = doc.get_pages().into_iter().next().unwrap();
        let page = doc.get_dictionary(page_id).unwrap();
        assert!(page.get(b"Contents").is_err());
    }

    #[test]
    fn png_annotation_embeds_image_with_smask() {
        let pdf = create_test_pdf(612.0, 792.0);
        let annotation = Annotation {
            id: Uuid::new_v4(),
            page_number: 1,
            rect: RasterBox::new(50.0, 50.0, 120.0, 60.0),
            kind: AnnotationKind::Image(ImagePayload::from_bytes(&png_bytes(), ImageMime::Png)),
        };
        let result = compose(&pdf, &[annotation], &letter_geometry()).unwrap();
        // Base image plus its alpha SMask.
        assert_eq!(count_image_xobjects(&result), 2);
    }

    #[test]
    fn signature_embeds_like_image() {
        let pdf = create_test_pdf(612.0, 792.0);
        let annotation = Annotation {
            id: Uuid::new_v4(),
            page_number: 1,
            rect: RasterBox::new(300.0, 700.0, 160.0, 50.0),
            kind: AnnotationKind::Signature(ImagePayload::from_bytes(
                &png_bytes(),
                ImageMime::Png,
            )),
        };
        let result = compose(&pdf, &[annotation], &letter_geometry()).unwrap();
        assert!(count_image_xobjects(&result) >= 1);
    }

    #[test]
    fn mismatched_mime_payload_fails_compose() {
        // PNG bytes declared as JPEG would pass straight through under a
        // DCTDecode filter and render broken; the compose must refuse.
        let pdf = create_test_pdf(612.0, 792.0);
        let annotation = Annotation {
            id: Uuid::new_v4(),
            page_number: 1,
            rect: RasterBox::new(0.0, 0.0, 50.0, 50.0),
            kind: AnnotationKind::Image(ImagePayload::from_bytes(&png_bytes(), ImageMime::Jpeg)),
        };
        assert!(matches!(
            compose(&pdf, &[annotation], &letter_geometry()),
            Err(ComposeError::ImageDecode(_))
        ));
    }

    #[test]
    fn corrupt_image_payload_fails_compose() {
        let pdf = create_test_pdf(612.0, 792.0);
        let annotation = Annotation {
            id: Uuid::new_v4(),
            page_number: 1,
            rect: RasterBox::new(0.0, 0.0, 50.0, 50.0),
            kind: AnnotationKind::Image(ImagePayload::from_bytes(b"not an image", ImageMime::Png)),
        };
        assert!(matches!(
            compose(&pdf, &[annotation], &letter_geometry()),
            Err(ComposeError::ImageDecode(_))
        ));
    }

    #[test]
    fn occlusion_covers_text_wider_than_its_box() {
        let pdf = create_test_pdf(612.0, 792.0);
        let mut annotation = text_annotation("a rather long line of annotation text", 16.0);
        annotation.rect.width = 10.0;

        let result = compose(&pdf, &[annotation.clone()], &letter_geometry()).unwrap();
        let doc = Document::load_mem(&result).unwrap();
        let (_, page_id) = doc.get_pages().into_iter().next().unwrap();
        let contents = doc
            .get_dictionary(page_id)
            .unwrap()
            .get(b"Contents")
            .unwrap()
            .as_array()
            .unwrap()
            .clone();
        let stream_id = contents[0].as_reference().unwrap();
        let stream = doc.get_object(stream_id).unwrap().as_stream().unwrap();
        let content = Content::decode(&stream.content).unwrap();

        let rect_op = content
            .operations
            .iter()
            .find(|op| op.operator == "re")
            .unwrap();
        let occlusion_width = as_f32(&rect_op.operands[2]).unwrap();
        let text_content = annotation.text_content().unwrap();
        let (measured, _) =
            fonts::measure_block(text_content.font, text_content.font_size, &text_content.text);
        assert!(occlusion_width >= measured);
    }

    #[test]
    fn multi_line_text_anchors_last_line_at_box_bottom() {
        let content = TextContent {
            text: "one\ntwo\nthree".to_owned(),
            font_size: 10.0,
            font: FontFamily::Courier,
            background: None,
        };
        let rect = PdfBox {
            x: 20.0,
            y_top: 120.0,
            y_bottom: 80.0,
            width: 100.0,
            height: 40.0,
        };
        let ops = text_operations(&content, rect, "AnnCour");

        let td = ops.iter().find(|op| op.operator == "Td").unwrap();
        let first_baseline = as_f32(&td.operands[1]).unwrap();
        // Two leading steps of 11pt above the bottom anchor.
        assert!((first_baseline - (80.0 + 2.0 * 11.0)).abs() < 1e-3);
        assert_eq!(
            ops.iter().filter(|op| op.operator == "T*").count(),
            2
        );
    }

    #[test]
    fn background_paints_box_before_text() {
        let content = TextContent {
            text: "x".to_owned(),
            font_size: 12.0,
            font: FontFamily::Helvetica,
            background: Some(Rgb { r: 255, g: 255, b: 0 }),
        };
        let rect = PdfBox {
            x: 0.0,
            y_top: 20.0,
            y_bottom: 0.0,
            width: 50.0,
            height: 20.0,
        };
        let ops = text_operations(&content, rect, "AnnHelv");
        // White occlusion, then the background fill, then black for glyphs.
        assert_eq!(ops.iter().filter(|op| op.operator == "rg").count(), 3);
        assert_eq!(ops.iter().filter(|op| op.operator == "re").count(), 2);
    }
}
